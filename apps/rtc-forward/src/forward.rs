//! Supervision of the downstream consumer process.

use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use thiserror::Error;
use tokio::process::Command;
use tokio::task::JoinHandle;

use crate::lifecycle::{ConsumerHandle, SessionLifecycle, ShutdownReason};

/// How often the supervisor checks whether the consumer has exited.
const REAP_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("consumer command is empty")]
    EmptyCommand,
    #[error("failed to start '{program}': {source}")]
    Spawn { program: String, source: io::Error },
    #[error("failed waiting for consumer: {0}")]
    Wait(io::Error),
    #[error("session is ending; consumer not started")]
    Rejected,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForwardMode {
    /// Only the descriptor file is produced.
    Test,
    /// ffmpeg reads the descriptor and pushes FLV to `url`.
    Rtmp { ffmpeg: PathBuf, url: String },
    /// Arbitrary command, split on whitespace. Quotes are not interpreted.
    Custom { command: String },
}

impl ForwardMode {
    pub fn name(&self) -> &'static str {
        match self {
            ForwardMode::Test => "TEST",
            ForwardMode::Rtmp { .. } => "RTMP",
            ForwardMode::Custom { .. } => "CUSTOM",
        }
    }
}

/// Argument vector for the consumer, program first. `None` in TEST mode.
pub fn consumer_argv(mode: &ForwardMode, sdp_file: &Path) -> Result<Option<Vec<String>>, ForwardError> {
    match mode {
        ForwardMode::Test => Ok(None),
        ForwardMode::Rtmp { ffmpeg, url } => Ok(Some(vec![
            ffmpeg.to_string_lossy().into_owned(),
            "-re".into(),
            "-protocol_whitelist".into(),
            "file,sdp,udp,rtp".into(),
            "-f".into(),
            "sdp".into(),
            "-i".into(),
            sdp_file.to_string_lossy().into_owned(),
            "-f".into(),
            "flv".into(),
            url.clone(),
        ])),
        ForwardMode::Custom { command } => {
            let argv: Vec<String> = command.split_whitespace().map(str::to_owned).collect();
            if argv.is_empty() {
                return Err(ForwardError::EmptyCommand);
            }
            Ok(Some(argv))
        }
    }
}

pub struct ForwardSupervisor {
    mode: ForwardMode,
    sdp_file: PathBuf,
    debug: bool,
    lifecycle: SessionLifecycle,
    launched: AtomicBool,
}

impl ForwardSupervisor {
    pub fn new(
        mode: ForwardMode,
        sdp_file: PathBuf,
        debug: bool,
        lifecycle: SessionLifecycle,
    ) -> Arc<Self> {
        Arc::new(Self {
            mode,
            sdp_file,
            debug,
            lifecycle,
            launched: AtomicBool::new(false),
        })
    }

    /// Starts the consumer once the descriptor exists. The consumer's exit,
    /// or a failure to start it, ends the session.
    pub fn launch(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        if matches!(self.mode, ForwardMode::Test) {
            tracing::info!(target = "forward", "TEST mode: descriptor written, no consumer to start");
            return None;
        }
        if self.launched.swap(true, Ordering::SeqCst) {
            return None;
        }

        let supervisor = Arc::clone(self);
        Some(tokio::spawn(async move {
            let reason = match supervisor.run().await {
                Ok(code) => ShutdownReason::ConsumerExited(code),
                Err(err) => ShutdownReason::ConsumerFailed(err.to_string()),
            };
            supervisor.lifecycle.shutdown(reason);
        }))
    }

    /// Spawns the consumer, tracks it in the lifecycle slot and waits for it.
    /// Returns the exit code (1 when terminated by a signal).
    pub async fn run(&self) -> Result<i32, ForwardError> {
        let Some(argv) = consumer_argv(&self.mode, &self.sdp_file)? else {
            return Ok(0);
        };

        let mut command = Command::new(&argv[0]);
        command
            .args(&argv[1..])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .kill_on_drop(true);
        if self.debug {
            command.stderr(Stdio::inherit());
            tracing::info!(target = "forward", "Running command: {}", argv.join(" "));
        } else {
            command.stderr(Stdio::null());
        }
        #[cfg(target_os = "linux")]
        die_with_parent(&mut command);

        let mut child = command.spawn().map_err(|source| ForwardError::Spawn {
            program: argv[0].clone(),
            source,
        })?;

        let Some(pid) = child.id() else {
            // Already reaped; nothing left to track.
            let status = child.wait().await.map_err(ForwardError::Wait)?;
            return Ok(status.code().unwrap_or(1));
        };
        if !self.lifecycle.register_consumer(ConsumerHandle::new(pid)) {
            let _ = child.start_kill();
            let _ = child.wait().await;
            return Err(ForwardError::Rejected);
        }
        tracing::info!(target = "forward", pid, mode = self.mode.name(), "consumer started");

        let mut ticker = tokio::time::interval(REAP_INTERVAL);
        let status = loop {
            ticker.tick().await;
            let reaped = self
                .lifecycle
                .reap_consumer(pid, || child.try_wait())
                .map_err(ForwardError::Wait)?;
            if let Some(status) = reaped {
                break status;
            }
        };

        let code = status.code().unwrap_or(1);
        if status.success() {
            tracing::info!(target = "forward", pid, "consumer exited");
        } else {
            tracing::warn!(target = "forward", pid, code, "consumer exited with failure");
        }
        Ok(code)
    }
}

/// Ask the kernel to SIGKILL the consumer if this process dies first.
#[cfg(target_os = "linux")]
fn die_with_parent(command: &mut Command) {
    // SAFETY: the closure only calls prctl(2), which is async-signal-safe.
    unsafe {
        command.pre_exec(|| {
            if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL as libc::c_ulong) == -1 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        });
    }
}
