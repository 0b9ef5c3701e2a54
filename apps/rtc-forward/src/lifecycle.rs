//! The single shutdown path.
//!
//! Every fatal trigger calls [`SessionLifecycle::shutdown`]. It kills the
//! consumer process if one is tracked and hands the reason to whoever owns
//! process termination (the binary's `main`). The consumer slot has its own
//! lock so shutdown never waits on negotiation work.

use std::fmt;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
    /// Server sent CLOSE.
    RemoteClosed,
    /// STANDBY after the offer was accepted.
    PublisherStopped,
    SignalingClosed,
    SignalingFailed(String),
    /// Server sent ERROR with this message.
    ServerError(String),
    Negotiation(String),
    PeerClosed,
    PeerFailed,
    Descriptor(String),
    /// Consumer exited on its own with this code.
    ConsumerExited(i32),
    ConsumerFailed(String),
    Interrupted,
}

impl ShutdownReason {
    pub fn exit_code(&self) -> i32 {
        match self {
            ShutdownReason::RemoteClosed
            | ShutdownReason::PublisherStopped
            | ShutdownReason::SignalingClosed
            | ShutdownReason::PeerClosed
            | ShutdownReason::Interrupted => 0,
            ShutdownReason::ConsumerExited(code) => *code,
            ShutdownReason::SignalingFailed(_)
            | ShutdownReason::ServerError(_)
            | ShutdownReason::Negotiation(_)
            | ShutdownReason::PeerFailed
            | ShutdownReason::Descriptor(_)
            | ShutdownReason::ConsumerFailed(_) => 1,
        }
    }
}

impl fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShutdownReason::RemoteClosed => write!(f, "connection closed by remote host"),
            ShutdownReason::PublisherStopped => write!(f, "publisher stopped the stream"),
            ShutdownReason::SignalingClosed => write!(f, "signaling connection closed"),
            ShutdownReason::SignalingFailed(err) => write!(f, "signaling failed: {err}"),
            ShutdownReason::ServerError(message) => write!(f, "server error: {message}"),
            ShutdownReason::Negotiation(err) => write!(f, "negotiation failed: {err}"),
            ShutdownReason::PeerClosed => write!(f, "peer connection closed"),
            ShutdownReason::PeerFailed => write!(f, "peer connection failed"),
            ShutdownReason::Descriptor(err) => write!(f, "{err}"),
            ShutdownReason::ConsumerExited(code) => write!(f, "consumer exited with code {code}"),
            ShutdownReason::ConsumerFailed(err) => write!(f, "consumer failed: {err}"),
            ShutdownReason::Interrupted => write!(f, "interrupted"),
        }
    }
}

/// Reference to the running consumer, killable from any task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsumerHandle {
    pid: u32,
}

impl ConsumerHandle {
    pub fn new(pid: u32) -> Self {
        Self { pid }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    #[cfg(unix)]
    fn kill(&self) -> io::Result<()> {
        let pid = libc::pid_t::try_from(self.pid)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))?;
        // SAFETY: kill(2) has no memory-safety preconditions.
        let rc = unsafe { libc::kill(pid, libc::SIGKILL) };
        if rc == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    #[cfg(not(unix))]
    fn kill(&self) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "forced kill is only supported on unix",
        ))
    }
}

pub type ExitReceiver = mpsc::UnboundedReceiver<ShutdownReason>;

#[derive(Clone)]
pub struct SessionLifecycle {
    inner: Arc<Inner>,
}

struct Inner {
    consumer: Mutex<Option<ConsumerHandle>>,
    ended: AtomicBool,
    exit_tx: mpsc::UnboundedSender<ShutdownReason>,
}

impl SessionLifecycle {
    /// The receiver yields exactly one reason, from the first shutdown call.
    pub fn new() -> (Self, ExitReceiver) {
        let (exit_tx, exit_rx) = mpsc::unbounded_channel();
        let lifecycle = Self {
            inner: Arc::new(Inner {
                consumer: Mutex::new(None),
                ended: AtomicBool::new(false),
                exit_tx,
            }),
        };
        (lifecycle, exit_rx)
    }

    /// Tracks `handle` as the live consumer. Returns false when one is
    /// already tracked or shutdown has started; the caller must then kill
    /// its own process.
    pub fn register_consumer(&self, handle: ConsumerHandle) -> bool {
        let mut slot = self.inner.consumer.lock();
        if slot.is_some() || self.is_ended() {
            return false;
        }
        *slot = Some(handle);
        true
    }

    /// Runs `reap` under the consumer lock and clears the slot for `pid`
    /// once it reports an exit or fails. `shutdown` takes the same lock, so
    /// it never signals a pid that has already been reaped.
    pub fn reap_consumer<T>(
        &self,
        pid: u32,
        reap: impl FnOnce() -> io::Result<Option<T>>,
    ) -> io::Result<Option<T>> {
        let mut slot = self.inner.consumer.lock();
        let reaped = reap();
        if !matches!(reaped, Ok(None)) && slot.map(|handle| handle.pid()) == Some(pid) {
            *slot = None;
        }
        reaped
    }

    pub fn consumer(&self) -> Option<ConsumerHandle> {
        *self.inner.consumer.lock()
    }

    pub fn is_ended(&self) -> bool {
        self.inner.ended.load(Ordering::SeqCst)
    }

    /// Kills the tracked consumer, if any, and reports `reason` for process
    /// exit. Safe to call any number of times from any task; only the first
    /// reason is reported. Returns true when this call killed the consumer.
    pub fn shutdown(&self, reason: ShutdownReason) -> bool {
        let mut slot = self.inner.consumer.lock();
        let killed = match slot.take() {
            Some(handle) => {
                if let Err(err) = handle.kill() {
                    tracing::warn!(target = "lifecycle", pid = handle.pid(), "failed to kill consumer: {err}");
                } else {
                    tracing::info!(target = "lifecycle", pid = handle.pid(), "consumer killed");
                }
                true
            }
            None => false,
        };

        if !self.inner.ended.swap(true, Ordering::SeqCst) {
            if reason.exit_code() == 0 {
                tracing::info!(target = "lifecycle", %reason, "session ending");
            } else {
                tracing::error!(target = "lifecycle", %reason, code = reason.exit_code(), "session ending");
            }
            let _ = self.inner.exit_tx.send(reason);
        }
        drop(slot);
        killed
    }
}
