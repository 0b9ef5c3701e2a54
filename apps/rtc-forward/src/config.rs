use std::env;
use std::path::{Path, PathBuf};

use thiserror::Error;
use url::Url;

use crate::auth::{self, TokenError};
use crate::cli::Cli;
use crate::forward::ForwardMode;
use crate::signaling::websocket_endpoint;

pub const DEFAULT_FFMPEG_PATH: &str = "/usr/bin/ffmpeg";
pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required option: {0}")]
    MissingOption(&'static str),
    #[error("The option '{option}' requires a port between 1 and 65535, got {value}")]
    InvalidPort { option: &'static str, value: u32 },
    #[error("Port for video cannot be the same as the port for audio")]
    SamePorts,
    #[error("Invalid forward mode: {0}")]
    InvalidForwardMode(String),
    #[error("Invalid RTMP URL provided. Please set RTMP_FORWARD_URL to a valid URL when using RTMP forward mode.")]
    InvalidRtmpUrl,
    #[error("Please set CUSTOM_FORWARD_COMMAND when using CUSTOM forward mode.")]
    MissingCustomCommand,
    #[error("The source is not a valid websocket URL")]
    InvalidSource,
    #[error("The source URL must contain the stream ID. Example: ws://localhost/stream-id")]
    MissingStreamId,
    #[error("Could not generate authentication token: {0}")]
    Token(#[from] TokenError),
    #[error("Could not find 'ffmpeg' at specified location: {}", .0.display())]
    FfmpegNotFound(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceServer {
    pub url: String,
    pub username: Option<String>,
    pub credential: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Config {
    /// `<scheme>://<host>/ws`
    pub signaling_url: Url,
    pub stream_id: String,
    pub auth: Option<String>,
    pub sdp_file: PathBuf,
    pub video_port: u16,
    pub audio_port: u16,
    pub forward: ForwardMode,
    pub debug: bool,
    pub ice_servers: Vec<IceServer>,
}

impl Config {
    pub fn from_cli(cli: &Cli) -> Result<Self, ConfigError> {
        Self::from_cli_with(cli, |key| env::var(key).ok())
    }

    /// Validates `cli` with environment lookups going through `env`.
    pub fn from_cli_with<F>(cli: &Cli, env: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let input = non_empty(cli.input.as_deref()).ok_or(ConfigError::MissingOption("--input"))?;
        let video_port = port("--video-port", cli.video_port)?;
        let audio_port = port("--audio-port", cli.audio_port)?;
        if video_port == audio_port {
            return Err(ConfigError::SamePorts);
        }
        let sdp_file = cli
            .sdp_file
            .clone()
            .filter(|path| !path.as_os_str().is_empty())
            .ok_or(ConfigError::MissingOption("--sdp-file"))?;
        let mode = non_empty(cli.forward_mode.as_deref())
            .ok_or(ConfigError::MissingOption("--forward-mode"))?;

        let forward = match mode.to_ascii_uppercase().as_str() {
            "TEST" => ForwardMode::Test,
            "RTMP" => {
                let url = env("RTMP_FORWARD_URL").unwrap_or_default();
                match Url::parse(&url) {
                    Ok(parsed) if matches!(parsed.scheme(), "rtmp" | "rtmps") => {}
                    _ => return Err(ConfigError::InvalidRtmpUrl),
                }
                let ffmpeg = cli
                    .ffmpeg_path
                    .clone()
                    .or_else(|| non_empty(env("FFMPEG_PATH").as_deref()).map(PathBuf::from))
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_FFMPEG_PATH));
                ForwardMode::Rtmp { ffmpeg, url }
            }
            "CUSTOM" => {
                let command = env("CUSTOM_FORWARD_COMMAND").unwrap_or_default();
                if command.trim().is_empty() {
                    return Err(ConfigError::MissingCustomCommand);
                }
                ForwardMode::Custom { command }
            }
            _ => return Err(ConfigError::InvalidForwardMode(mode.to_string())),
        };

        let source = Url::parse(input).map_err(|_| ConfigError::InvalidSource)?;
        if !matches!(source.scheme(), "ws" | "wss") || source.host_str().is_none() {
            return Err(ConfigError::InvalidSource);
        }
        let stream_id = source.path().trim_start_matches('/').to_string();
        if stream_id.is_empty() {
            return Err(ConfigError::MissingStreamId);
        }

        let auth = match non_empty(cli.secret.as_deref()) {
            Some(secret) => Some(auth::sign_play_token(secret, &stream_id)?),
            None => non_empty(cli.auth.as_deref()).map(str::to_string),
        };

        if let ForwardMode::Rtmp { ffmpeg, .. } = &forward {
            if !exists(ffmpeg) {
                return Err(ConfigError::FfmpegNotFound(ffmpeg.clone()));
            }
        }

        Ok(Self {
            signaling_url: websocket_endpoint(&source),
            stream_id,
            auth,
            sdp_file,
            video_port,
            audio_port,
            forward,
            debug: cli.debug,
            ice_servers: ice_servers(&env),
        })
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|value| !value.is_empty())
}

fn port(option: &'static str, value: Option<u32>) -> Result<u16, ConfigError> {
    match value {
        None | Some(0) => Err(ConfigError::MissingOption(option)),
        Some(value) => u16::try_from(value).map_err(|_| ConfigError::InvalidPort { option, value }),
    }
}

fn exists(path: &Path) -> bool {
    std::fs::metadata(path).is_ok()
}

/// STUN from `STUN_SERVER` (empty disables), TURN from `TURN_SERVER` with
/// `TURN_USERNAME` / `TURN_PASSWORD`.
fn ice_servers<F>(env: &F) -> Vec<IceServer>
where
    F: Fn(&str) -> Option<String>,
{
    let mut servers = Vec::new();
    let stun = env("STUN_SERVER").unwrap_or_else(|| DEFAULT_STUN_SERVER.to_string());
    if !stun.trim().is_empty() {
        servers.push(IceServer {
            url: stun.trim().to_string(),
            username: None,
            credential: None,
        });
    }
    if let Some(turn) = env("TURN_SERVER").filter(|value| !value.trim().is_empty()) {
        servers.push(IceServer {
            url: turn.trim().to_string(),
            username: env("TURN_USERNAME"),
            credential: env("TURN_PASSWORD"),
        });
    }
    servers
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn cli(args: &[&str]) -> Cli {
        let mut argv = vec!["rtc-forward"];
        argv.extend_from_slice(args);
        Cli::try_parse_normalized(argv).unwrap()
    }

    fn env_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    const TEST_ARGS: &[&str] = &[
        "-i", "ws://h/stream1", "-sdp", "/tmp/s.sdp", "-fm", "TEST", "-vp", "5004", "-ap", "5006",
    ];

    #[test]
    fn test_mode_resolves_endpoint_and_stream() {
        let config = Config::from_cli_with(&cli(TEST_ARGS), env_from(&[])).unwrap();
        assert_eq!(config.signaling_url.as_str(), "ws://h/ws");
        assert_eq!(config.stream_id, "stream1");
        assert_eq!(config.sdp_file, PathBuf::from("/tmp/s.sdp"));
        assert_eq!((config.video_port, config.audio_port), (5004, 5006));
        assert_eq!(config.forward, ForwardMode::Test);
        assert_eq!(config.auth, None);
        assert_eq!(config.ice_servers.len(), 1);
        assert_eq!(config.ice_servers[0].url, DEFAULT_STUN_SERVER);
    }

    #[test]
    fn rtmp_mode_requires_rtmp_url_and_binary() {
        let ffmpeg = std::env::current_exe().unwrap();
        let ffmpeg_arg = ffmpeg.to_str().unwrap();
        let mut args = TEST_ARGS.to_vec();
        args[5] = "RTMP";
        args.extend(["--ffmpeg-path", ffmpeg_arg]);

        let err = Config::from_cli_with(&cli(&args), env_from(&[])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidRtmpUrl));
        let err = Config::from_cli_with(&cli(&args), env_from(&[("RTMP_FORWARD_URL", "http://x/y")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidRtmpUrl));

        let config = Config::from_cli_with(&cli(&args), env_from(&[("RTMP_FORWARD_URL", "rtmp://x/y")]))
            .unwrap();
        assert_eq!(
            config.forward,
            ForwardMode::Rtmp {
                ffmpeg: ffmpeg.clone(),
                url: "rtmp://x/y".into()
            }
        );
    }

    #[test]
    fn ffmpeg_path_falls_back_to_env_and_must_exist() {
        let mut args = TEST_ARGS.to_vec();
        args[5] = "RTMP";
        let err = Config::from_cli_with(
            &cli(&args),
            env_from(&[
                ("RTMP_FORWARD_URL", "rtmps://x/y"),
                ("FFMPEG_PATH", "/nonexistent/rtc-forward/ffmpeg"),
            ]),
        )
        .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Could not find 'ffmpeg' at specified location: /nonexistent/rtc-forward/ffmpeg"
        );
        match err {
            ConfigError::FfmpegNotFound(path) => {
                assert_eq!(path, PathBuf::from("/nonexistent/rtc-forward/ffmpeg"))
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn custom_mode_requires_command() {
        let mut args = TEST_ARGS.to_vec();
        args[5] = "CUSTOM";
        let err = Config::from_cli_with(&cli(&args), env_from(&[("CUSTOM_FORWARD_COMMAND", "  ")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::MissingCustomCommand));

        let config = Config::from_cli_with(
            &cli(&args),
            env_from(&[("CUSTOM_FORWARD_COMMAND", "gst-launch-1.0 -v")]),
        )
        .unwrap();
        assert_eq!(
            config.forward,
            ForwardMode::Custom {
                command: "gst-launch-1.0 -v".into()
            }
        );
    }

    #[test]
    fn rejects_bad_ports_and_modes() {
        let mut same = TEST_ARGS.to_vec();
        same[9] = "5004";
        assert!(matches!(
            Config::from_cli_with(&cli(&same), env_from(&[])),
            Err(ConfigError::SamePorts)
        ));

        let mut zero = TEST_ARGS.to_vec();
        zero[7] = "0";
        assert!(matches!(
            Config::from_cli_with(&cli(&zero), env_from(&[])),
            Err(ConfigError::MissingOption("--video-port"))
        ));

        let mut large = TEST_ARGS.to_vec();
        large[9] = "70000";
        assert!(matches!(
            Config::from_cli_with(&cli(&large), env_from(&[])),
            Err(ConfigError::InvalidPort { value: 70000, .. })
        ));

        let mut mode = TEST_ARGS.to_vec();
        mode[5] = "SRT";
        assert!(matches!(
            Config::from_cli_with(&cli(&mode), env_from(&[])),
            Err(ConfigError::InvalidForwardMode(m)) if m == "SRT"
        ));
    }

    #[test]
    fn rejects_bad_sources() {
        let mut http = TEST_ARGS.to_vec();
        http[1] = "http://h/stream1";
        assert!(matches!(
            Config::from_cli_with(&cli(&http), env_from(&[])),
            Err(ConfigError::InvalidSource)
        ));

        let mut no_stream = TEST_ARGS.to_vec();
        no_stream[1] = "wss://h:8443";
        assert!(matches!(
            Config::from_cli_with(&cli(&no_stream), env_from(&[])),
            Err(ConfigError::MissingStreamId)
        ));

        let missing = cli(&["-sdp", "/tmp/s.sdp"]);
        assert!(matches!(
            Config::from_cli_with(&missing, env_from(&[])),
            Err(ConfigError::MissingOption("--input"))
        ));
    }

    #[test]
    fn secret_replaces_auth_token() {
        let mut args = TEST_ARGS.to_vec();
        args.extend(["-a", "plain-token"]);
        let config = Config::from_cli_with(&cli(&args), env_from(&[])).unwrap();
        assert_eq!(config.auth.as_deref(), Some("plain-token"));

        args.extend(["-s", "s3cret"]);
        let config = Config::from_cli_with(&cli(&args), env_from(&[])).unwrap();
        let token = config.auth.unwrap();
        assert_ne!(token, "plain-token");
        assert_eq!(token, auth::sign_play_token("s3cret", "stream1").unwrap());
    }

    #[test]
    fn ice_servers_from_env() {
        let config = Config::from_cli_with(
            &cli(TEST_ARGS),
            env_from(&[
                ("STUN_SERVER", ""),
                ("TURN_SERVER", "turn:turn.example.com:3478"),
                ("TURN_USERNAME", "user"),
                ("TURN_PASSWORD", "pass"),
            ]),
        )
        .unwrap();
        assert_eq!(
            config.ice_servers,
            vec![IceServer {
                url: "turn:turn.example.com:3478".into(),
                username: Some("user".into()),
                credential: Some("pass".into()),
            }]
        );
    }
}
