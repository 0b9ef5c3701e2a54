use clap::{ArgAction, Args, Parser};
use std::ffi::OsString;
use std::path::PathBuf;

use crate::telemetry::logging::{LogConfig, LogLevel};

#[derive(Parser, Debug, Clone)]
#[command(
    name = "rtc-forward",
    about = "Play one WebRTC stream from a media server and hand it to a local consumer over RTP/UDP",
    version,
    disable_version_flag = true,
    after_help = "FORWARD MODES:\n    \
        TEST     Write the SDP file and do nothing else\n    \
        RTMP     Push to RTMP with ffmpeg; set RTMP_FORWARD_URL\n    \
        CUSTOM   Run a custom command; set CUSTOM_FORWARD_COMMAND"
)]
pub struct Cli {
    #[arg(
        short = 'i',
        long = "input",
        value_name = "SOURCE",
        help = "Input WebRTC stream, e.g. ws(s)://host:port/stream-id"
    )]
    pub input: Option<String>,

    #[arg(
        long = "sdp-file",
        value_name = "FILE",
        help = "File the SDP description is written to (alias: -sdp)"
    )]
    pub sdp_file: Option<PathBuf>,

    #[arg(
        long = "forward-mode",
        value_name = "MODE",
        help = "TEST, RTMP or CUSTOM (alias: -fm)"
    )]
    pub forward_mode: Option<String>,

    #[arg(
        long = "video-port",
        value_name = "PORT",
        help = "Loopback UDP port for video packets (alias: -vp)"
    )]
    pub video_port: Option<u32>,

    #[arg(
        long = "audio-port",
        value_name = "PORT",
        help = "Loopback UDP port for audio packets (alias: -ap)"
    )]
    pub audio_port: Option<u32>,

    #[arg(
        long = "ffmpeg-path",
        value_name = "PATH",
        help = "ffmpeg binary used in RTMP mode (default: $FFMPEG_PATH or /usr/bin/ffmpeg)"
    )]
    pub ffmpeg_path: Option<PathBuf>,

    #[arg(
        short = 'a',
        long = "auth",
        value_name = "TOKEN",
        help = "Authentication token for the source"
    )]
    pub auth: Option<String>,

    #[arg(
        short = 's',
        long = "secret",
        value_name = "SECRET",
        help = "Secret used to sign an authentication token"
    )]
    pub secret: Option<String>,

    #[arg(
        long = "debug",
        action = ArgAction::SetTrue,
        help = "Log signaling frames and show consumer output"
    )]
    pub debug: bool,

    #[arg(short = 'v', long = "version", action = ArgAction::Version, help = "Print version")]
    pub version: Option<bool>,

    #[command(flatten)]
    pub logging: LoggingArgs,
}

#[derive(Args, Debug, Clone)]
pub struct LoggingArgs {
    #[arg(
        long = "log-level",
        value_enum,
        env = "RTC_FORWARD_LOG_LEVEL",
        default_value_t = LogLevel::Warn,
        help = "Minimum log level (error, warn, info, debug, trace)"
    )]
    pub level: LogLevel,

    #[arg(
        long = "log-file",
        value_name = "PATH",
        env = "RTC_FORWARD_LOG_FILE",
        help = "Write logs to the specified file instead of stderr"
    )]
    pub file: Option<PathBuf>,
}

impl LoggingArgs {
    pub fn to_config(&self) -> LogConfig {
        LogConfig {
            level: self.level,
            file: self.file.clone(),
        }
    }
}

/// Single-dash multi-letter spellings accepted by the command line.
const LEGACY_ALIASES: &[(&str, &str)] = &[
    ("-sdp", "--sdp-file"),
    ("-fm", "--forward-mode"),
    ("-vp", "--video-port"),
    ("-ap", "--audio-port"),
];

/// Rewrites `-sdp`, `-fm`, `-vp` and `-ap` (also in `-vp=5004` form) to their
/// long spellings. Values are never rewritten.
pub fn normalize_args<I, T>(args: I) -> Vec<OsString>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString>,
{
    let mut out = Vec::new();
    let mut expecting_value = false;
    for arg in args.into_iter().map(Into::into) {
        if expecting_value {
            expecting_value = false;
            out.push(arg);
            continue;
        }
        let Some(text) = arg.to_str() else {
            out.push(arg);
            continue;
        };
        let (flag, inline) = match text.split_once('=') {
            Some((flag, value)) => (flag, Some(value)),
            None => (text, None),
        };
        match LEGACY_ALIASES.iter().find(|(alias, _)| *alias == flag) {
            Some((_, long)) => match inline {
                Some(value) => out.push(format!("{long}={value}").into()),
                None => {
                    out.push(OsString::from(*long));
                    expecting_value = true;
                }
            },
            None => {
                expecting_value = takes_value(flag) && inline.is_none();
                out.push(arg);
            }
        }
    }
    out
}

fn takes_value(flag: &str) -> bool {
    matches!(
        flag,
        "-i" | "--input"
            | "--sdp-file"
            | "--forward-mode"
            | "--video-port"
            | "--audio-port"
            | "--ffmpeg-path"
            | "-a"
            | "--auth"
            | "-s"
            | "--secret"
            | "--log-level"
            | "--log-file"
    )
}

impl Cli {
    pub fn parse_normalized() -> Self {
        Cli::parse_from(normalize_args(std::env::args_os()))
    }

    pub fn try_parse_normalized<I, T>(args: I) -> Result<Self, clap::Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString>,
    {
        Cli::try_parse_from(normalize_args(args))
    }
}
