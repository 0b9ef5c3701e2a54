use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const PLAY_SUBJECT: &str = "stream_play";

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("secret is empty")]
    EmptySecret,
    #[error("failed to sign play token: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),
}

/// Claims accepted by the media server for playback. No expiry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayClaims {
    pub sub: String,
    pub sid: String,
}

/// HS256 token authorizing playback of `stream_id`.
pub fn sign_play_token(secret: &str, stream_id: &str) -> Result<String, TokenError> {
    if secret.is_empty() {
        return Err(TokenError::EmptySecret);
    }
    let claims = PlayClaims {
        sub: PLAY_SUBJECT.to_string(),
        sid: stream_id.to_string(),
    };
    let token = jsonwebtoken::encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )?;
    Ok(token)
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{DecodingKey, Validation};

    fn verify(token: &str, secret: &str) -> Result<PlayClaims, jsonwebtoken::errors::Error> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = false;
        validation.required_spec_claims.clear();
        jsonwebtoken::decode::<PlayClaims>(token, &DecodingKey::from_secret(secret.as_bytes()), &validation)
            .map(|data| data.claims)
    }

    #[test]
    fn signs_play_claims() {
        let token = sign_play_token("s3cret", "stream1").unwrap();
        assert_eq!(token.split('.').count(), 3);
        let claims = verify(&token, "s3cret").unwrap();
        assert_eq!(
            claims,
            PlayClaims {
                sub: "stream_play".into(),
                sid: "stream1".into()
            }
        );
    }

    #[test]
    fn wrong_secret_fails_verification() {
        let token = sign_play_token("s3cret", "stream1").unwrap();
        assert!(verify(&token, "other").is_err());
    }

    #[test]
    fn empty_secret_is_rejected() {
        assert!(matches!(sign_play_token("", "stream1"), Err(TokenError::EmptySecret)));
    }
}
