//! Wires one play session together and waits for its single ending.

use std::sync::Arc;

use crate::config::Config;
use crate::forward::ForwardSupervisor;
use crate::lifecycle::{SessionLifecycle, ShutdownReason};
use crate::negotiation::{MediaTargets, NegotiationController};
use crate::peer::PeerEngine;
use crate::peer::webrtc::WebRtcEngine;
use crate::signaling::SignalingChannel;
use crate::signaling::heartbeat::{self, HEARTBEAT_PERIOD};

/// Runs the session with the webrtc-rs engine.
pub async fn run(config: Config) -> ShutdownReason {
    let engine = match WebRtcEngine::new(&config.ice_servers) {
        Ok(engine) => Arc::new(engine) as Arc<dyn PeerEngine>,
        Err(err) => return ShutdownReason::Negotiation(err.to_string()),
    };
    run_with_engine(config, engine).await
}

/// Connects, starts the heartbeat and the controller, then blocks until the
/// first shutdown reason is reported by any component.
pub async fn run_with_engine(config: Config, engine: Arc<dyn PeerEngine>) -> ShutdownReason {
    let (lifecycle, mut exit_rx) = SessionLifecycle::new();
    spawn_interrupt_watcher(lifecycle.clone());

    let forward = ForwardSupervisor::new(
        config.forward.clone(),
        config.sdp_file.clone(),
        config.debug,
        lifecycle.clone(),
    );
    tracing::info!(
        target = "session",
        mode = config.forward.name(),
        stream_id = %config.stream_id,
        "starting play session"
    );

    let (sender, receiver) = match SignalingChannel::connect(&config.signaling_url).await {
        Ok(channel) => channel,
        Err(err) => {
            lifecycle.shutdown(ShutdownReason::SignalingFailed(err.to_string()));
            return first_reason(&mut exit_rx).await;
        }
    };
    let _heartbeat = heartbeat::spawn(sender.clone(), HEARTBEAT_PERIOD, lifecycle.clone());

    let controller = NegotiationController::new(
        config.stream_id.clone(),
        config.auth.clone(),
        MediaTargets::from(&config),
        sender,
        engine,
        forward,
        lifecycle.clone(),
    );
    tokio::spawn(controller.run(receiver));

    first_reason(&mut exit_rx).await
}

async fn first_reason(exit_rx: &mut crate::lifecycle::ExitReceiver) -> ShutdownReason {
    exit_rx.recv().await.unwrap_or(ShutdownReason::Interrupted)
}

fn spawn_interrupt_watcher(lifecycle: SessionLifecycle) {
    tokio::spawn(async move {
        wait_for_interrupt().await;
        lifecycle.shutdown(ShutdownReason::Interrupted);
    });
}

#[cfg(unix)]
async fn wait_for_interrupt() {
    use tokio::signal::unix::{SignalKind, signal};

    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(stream) => Some(stream),
        Err(err) => {
            tracing::warn!(target = "session", "cannot watch SIGTERM: {err}");
            None
        }
    };
    let sigterm = async {
        match terminate.as_mut() {
            Some(stream) => {
                stream.recv().await;
            }
            None => std::future::pending::<()>().await,
        }
    };
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::warn!(target = "session", "cannot watch ctrl-c: {err}");
            std::future::pending::<()>().await;
        }
    };
    tokio::select! {
        _ = ctrl_c => {}
        _ = sigterm => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_interrupt() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!(target = "session", "cannot watch ctrl-c: {err}");
        std::future::pending::<()>().await;
    }
}
