pub mod logging {
    use std::fs::OpenOptions;
    use std::path::PathBuf;
    use std::sync::OnceLock;

    use clap::ValueEnum;
    use tracing_appender::non_blocking::WorkerGuard;
    use tracing_subscriber::EnvFilter;

    /// Replaces the computed filter entirely, e.g. `rtc_forward=trace,webrtc_ice=debug`.
    pub const LOG_FILTER_ENV: &str = "RTC_FORWARD_LOG_FILTER";
    /// Keeps dependency traces at `--log-level trace` when set to `1`.
    pub const TRACE_DEPS_ENV: &str = "RTC_FORWARD_TRACE_DEPS";

    /// Held at `info` under `--log-level trace`.
    const NOISY_TARGETS: &[&str] = &[
        "webrtc",
        "webrtc_ice",
        "webrtc_dtls",
        "webrtc_srtp",
        "webrtc_mdns",
        "interceptor",
        "tokio_tungstenite",
        "tungstenite",
        "mio",
    ];

    #[derive(Clone, Copy, Debug, Default, ValueEnum, PartialEq, Eq, PartialOrd, Ord)]
    pub enum LogLevel {
        Error,
        #[default]
        Warn,
        Info,
        Debug,
        Trace,
    }

    #[derive(Clone, Debug, Default)]
    pub struct LogConfig {
        pub level: LogLevel,
        pub file: Option<PathBuf>,
    }

    impl LogConfig {
        /// `--debug` never lowers an explicitly higher level.
        pub fn with_debug(mut self, debug: bool) -> Self {
            if debug && self.level < LogLevel::Debug {
                self.level = LogLevel::Debug;
            }
            self
        }
    }

    #[derive(thiserror::Error, Debug)]
    pub enum InitError {
        #[error("failed to open log file {}: {source}", path.display())]
        Io {
            path: PathBuf,
            source: std::io::Error,
        },
        #[error("failed to install logger: {0}")]
        Install(String),
    }

    static GUARD: OnceLock<WorkerGuard> = OnceLock::new();

    /// Installs the global subscriber, writing to stderr or `config.file`.
    /// Later calls are no-ops.
    pub fn init(config: &LogConfig) -> Result<(), InitError> {
        if GUARD.get().is_some() {
            return Ok(());
        }

        let (writer, guard) = match &config.file {
            Some(path) => {
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .map_err(|source| InitError::Io {
                        path: path.clone(),
                        source,
                    })?;
                tracing_appender::non_blocking(file)
            }
            None => tracing_appender::non_blocking(std::io::stderr()),
        };

        let filter = std::env::var(LOG_FILTER_ENV)
            .unwrap_or_else(|_| default_filter(config.level, trace_deps_enabled()));
        let subscriber = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::new(filter))
            .with_target(config.level >= LogLevel::Debug)
            .with_ansi(config.file.is_none())
            .with_writer(writer)
            .finish();
        tracing::subscriber::set_global_default(subscriber)
            .map_err(|err| InitError::Install(err.to_string()))?;

        let _ = GUARD.set(guard);
        Ok(())
    }

    fn trace_deps_enabled() -> bool {
        std::env::var(TRACE_DEPS_ENV).is_ok_and(|value| {
            matches!(
                value.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            )
        })
    }

    fn default_filter(level: LogLevel, trace_deps: bool) -> String {
        let mut filter = match level {
            LogLevel::Error => "error".to_owned(),
            LogLevel::Warn => "warn".to_owned(),
            LogLevel::Info => "info".to_owned(),
            LogLevel::Debug => "info,rtc_forward=debug".to_owned(),
            LogLevel::Trace => "trace".to_owned(),
        };
        if level == LogLevel::Trace && !trace_deps {
            for target in NOISY_TARGETS {
                filter.push(',');
                filter.push_str(target);
                filter.push_str("=info");
            }
        }
        filter
    }

}
