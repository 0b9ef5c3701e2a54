use std::fmt;

use super::SignalingError;

/// Request id used for every message of the single play session.
pub const PLAY_REQUEST_ID: &str = "play01";

pub const PARAM_REQUEST_ID: &str = "Request-ID";
pub const PARAM_STREAM_ID: &str = "Stream-ID";
pub const PARAM_AUTH: &str = "Auth";
pub const PARAM_ERROR_MESSAGE: &str = "error-message";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Method {
    Play,
    Offer,
    Answer,
    Candidate,
    Close,
    Standby,
    Heartbeat,
    Error,
    /// Methods this client does not understand. Kept so newer servers can
    /// add verbs without breaking the session.
    Other(String),
}

impl Method {
    pub fn as_str(&self) -> &str {
        match self {
            Method::Play => "PLAY",
            Method::Offer => "OFFER",
            Method::Answer => "ANSWER",
            Method::Candidate => "CANDIDATE",
            Method::Close => "CLOSE",
            Method::Standby => "STANDBY",
            Method::Heartbeat => "HEARTBEAT",
            Method::Error => "ERROR",
            Method::Other(token) => token,
        }
    }

    fn from_token(token: &str) -> Self {
        match token.to_ascii_uppercase().as_str() {
            "PLAY" => Method::Play,
            "OFFER" => Method::Offer,
            "ANSWER" => Method::Answer,
            "CANDIDATE" => Method::Candidate,
            "CLOSE" => Method::Close,
            "STANDBY" => Method::Standby,
            "HEARTBEAT" => Method::Heartbeat,
            "ERROR" => Method::Error,
            _ => Method::Other(token.to_string()),
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Insertion-ordered parameter list. Keys compare case-insensitively and a
/// repeated key overwrites the earlier value in place.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Params {
    entries: Vec<(String, String)>,
}

impl Params {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self
            .entries
            .iter_mut()
            .find(|(k, _)| k.eq_ignore_ascii_case(&key))
        {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// One text frame of the signaling protocol:
///
/// ```text
/// METHOD
/// Key: Value
/// Key: Value
///
/// body...
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalingEnvelope {
    pub method: Method,
    pub params: Params,
    pub body: String,
}

impl SignalingEnvelope {
    pub fn new(method: Method) -> Self {
        Self {
            method,
            params: Params::new(),
            body: String::new(),
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.set(key, value);
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.get(key)
    }

    /// PLAY request opening the session for `stream_id`.
    pub fn play(stream_id: &str, auth: Option<&str>) -> Self {
        let envelope = Self::new(Method::Play)
            .with_param(PARAM_REQUEST_ID, PLAY_REQUEST_ID)
            .with_param(PARAM_STREAM_ID, stream_id);
        match auth {
            Some(token) if !token.is_empty() => envelope.with_param(PARAM_AUTH, token),
            _ => envelope,
        }
    }

    /// ANSWER or CANDIDATE reply scoped to the play request.
    pub fn reply(method: Method, stream_id: &str, body: impl Into<String>) -> Self {
        Self::new(method)
            .with_param(PARAM_REQUEST_ID, PLAY_REQUEST_ID)
            .with_param(PARAM_STREAM_ID, stream_id)
            .with_body(body)
    }

    pub fn heartbeat() -> Self {
        Self::new(Method::Heartbeat)
    }

    pub fn encode(&self) -> String {
        let mut out = String::with_capacity(self.body.len() + 64);
        out.push_str(self.method.as_str());
        out.push('\n');
        for (key, value) in self.params.iter() {
            out.push_str(key);
            out.push_str(": ");
            out.push_str(value);
            out.push('\n');
        }
        out.push('\n');
        out.push_str(&self.body);
        out
    }

    pub fn decode(text: &str) -> Result<Self, SignalingError> {
        let (head, body) = split_frame(text);
        let mut lines = head.split('\n').map(|line| line.trim_end_matches('\r'));
        let method = lines
            .next()
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .ok_or_else(|| SignalingError::Protocol("frame has no method line".into()))?;

        let mut params = Params::new();
        for line in lines {
            if line.is_empty() {
                continue;
            }
            let (key, value) = line.split_once(':').ok_or_else(|| {
                SignalingError::Protocol(format!("malformed parameter line '{line}'"))
            })?;
            let key = key.trim();
            if key.is_empty() {
                return Err(SignalingError::Protocol(format!(
                    "parameter line '{line}' has an empty key"
                )));
            }
            params.set(key, value.trim());
        }

        Ok(Self {
            method: Method::from_token(method),
            params,
            body: body.to_string(),
        })
    }
}

/// Splits at the first blank line after the method line. Header lines may
/// end in `\n` or `\r\n`; everything after the blank line is the body.
fn split_frame(text: &str) -> (&str, &str) {
    let mut start = 0;
    while let Some(len) = text[start..].find('\n') {
        let end = start + len;
        if start > 0 && text[start..end].trim_end_matches('\r').is_empty() {
            return (&text[..start], &text[end + 1..]);
        }
        start = end + 1;
    }
    (text, "")
}

impl fmt::Display for SignalingEnvelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_header_params_and_verbatim_body() {
        let frame = "OFFER\nRequest-ID: play01\nStream-ID: cam\n\n{\"type\":\"offer\",\n\"sdp\":\"v=0\"}";
        let envelope = SignalingEnvelope::decode(frame).unwrap();
        assert_eq!(envelope.method, Method::Offer);
        assert_eq!(envelope.param("stream-id"), Some("cam"));
        assert_eq!(envelope.param(PARAM_REQUEST_ID), Some("play01"));
        assert_eq!(envelope.body, "{\"type\":\"offer\",\n\"sdp\":\"v=0\"}");
    }

    #[test]
    fn duplicate_keys_keep_last_value() {
        let envelope = SignalingEnvelope::decode("ERROR\nerror-message: a\nError-Message: b\n\n").unwrap();
        assert_eq!(envelope.params.len(), 1);
        assert_eq!(envelope.param(PARAM_ERROR_MESSAGE), Some("b"));
    }

    #[test]
    fn unknown_methods_and_keys_are_preserved() {
        let envelope = SignalingEnvelope::decode("SUBSCRIBE\nX-Custom: 1\n\n").unwrap();
        assert_eq!(envelope.method, Method::Other("SUBSCRIBE".into()));
        assert_eq!(envelope.param("x-custom"), Some("1"));
    }

    #[test]
    fn frame_without_blank_line_has_empty_body() {
        let envelope = SignalingEnvelope::decode("STANDBY\r\nStream-ID: cam\r\n").unwrap();
        assert_eq!(envelope.method, Method::Standby);
        assert_eq!(envelope.param(PARAM_STREAM_ID), Some("cam"));
        assert!(envelope.body.is_empty());
    }

    #[test]
    fn crlf_header_keeps_blank_lines_inside_the_body() {
        let envelope =
            SignalingEnvelope::decode("OFFER\r\nStream-ID: cam\r\n\r\nline1\n\nline2").unwrap();
        assert_eq!(envelope.method, Method::Offer);
        assert_eq!(envelope.param(PARAM_STREAM_ID), Some("cam"));
        assert_eq!(envelope.body, "line1\n\nline2");

        let envelope = SignalingEnvelope::decode("CLOSE\n\r\nbye\r\n\r\n").unwrap();
        assert_eq!(envelope.method, Method::Close);
        assert!(envelope.params.is_empty());
        assert_eq!(envelope.body, "bye\r\n\r\n");
    }

    #[test]
    fn rejects_malformed_frames() {
        assert!(matches!(
            SignalingEnvelope::decode(""),
            Err(SignalingError::Protocol(_))
        ));
        assert!(matches!(
            SignalingEnvelope::decode("OFFER\nnot a header\n\nbody"),
            Err(SignalingError::Protocol(_))
        ));
    }

    #[test]
    fn play_omits_empty_auth() {
        let play = SignalingEnvelope::play("cam", Some(""));
        assert_eq!(play.param(PARAM_AUTH), None);
        let encoded = SignalingEnvelope::play("cam", Some("tok")).encode();
        assert_eq!(
            encoded,
            "PLAY\nRequest-ID: play01\nStream-ID: cam\nAuth: tok\n\n"
        );
    }
}
