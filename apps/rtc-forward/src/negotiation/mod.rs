//! Play-session state machine.
//!
//! One task owns all negotiation state. It drains two inputs in arrival
//! order: decoded signaling frames and events pushed by the peer engine.
//! Every outgoing frame goes through the [`SignalingSender`] writer queue.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, interval_at};

use crate::config::Config;
use crate::descriptor;
use crate::forward::ForwardSupervisor;
use crate::lifecycle::{SessionLifecycle, ShutdownReason};
use crate::peer::{
    CandidateInit, PeerConnectionState, PeerEngine, PeerEvent, PeerEventReceiver,
    PeerEventSender, PeerSession, SdpType, SessionDescription, TrackKind,
};
use crate::relay::{MediaRelay, MediaSource, RelayEnd};
use crate::signaling::envelope::PARAM_ERROR_MESSAGE;
use crate::signaling::{Method, SignalingEnvelope, SignalingError, SignalingSender, SignalingSource};

pub mod readiness;

pub use readiness::TrackReadiness;

pub const KEYFRAME_PERIOD: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    Idle,
    AwaitingOffer,
    Negotiating,
    Connected,
    Closed,
}

impl NegotiationState {
    fn offer_accepted(self) -> bool {
        matches!(self, NegotiationState::Negotiating | NegotiationState::Connected)
    }
}

#[derive(Debug, Error)]
pub enum NegotiationError {
    #[error("offer declares no audio or video media")]
    NoMedia,
    #[error(transparent)]
    Peer(#[from] crate::peer::PeerError),
    #[error(transparent)]
    Signaling(#[from] SignalingError),
}

/// Outcome of handling one input.
#[derive(Debug, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Shutdown(ShutdownReason),
}

/// Where accepted tracks and the descriptor go.
#[derive(Debug, Clone)]
pub struct MediaTargets {
    pub sdp_file: PathBuf,
    pub video_port: u16,
    pub audio_port: u16,
}

impl MediaTargets {
    pub fn port(&self, kind: TrackKind) -> u16 {
        match kind {
            TrackKind::Video => self.video_port,
            TrackKind::Audio => self.audio_port,
        }
    }
}

impl From<&Config> for MediaTargets {
    fn from(config: &Config) -> Self {
        Self {
            sdp_file: config.sdp_file.clone(),
            video_port: config.video_port,
            audio_port: config.audio_port,
        }
    }
}

enum Input {
    Frame(Result<SignalingEnvelope, SignalingError>),
    Peer(PeerEvent),
}

pub struct NegotiationController {
    state: NegotiationState,
    stream_id: String,
    auth: Option<String>,
    targets: MediaTargets,
    signaling: SignalingSender,
    engine: Arc<dyn PeerEngine>,
    session: Option<Arc<dyn PeerSession>>,
    events_tx: PeerEventSender,
    events_rx: PeerEventReceiver,
    accepted: HashSet<TrackKind>,
    readiness: TrackReadiness,
    forward: Arc<ForwardSupervisor>,
    lifecycle: SessionLifecycle,
    keyframe_period: Duration,
    tasks: Vec<JoinHandle<()>>,
}

impl NegotiationController {
    pub fn new(
        stream_id: impl Into<String>,
        auth: Option<String>,
        targets: MediaTargets,
        signaling: SignalingSender,
        engine: Arc<dyn PeerEngine>,
        forward: Arc<ForwardSupervisor>,
        lifecycle: SessionLifecycle,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            state: NegotiationState::Idle,
            stream_id: stream_id.into(),
            auth,
            targets,
            signaling,
            engine,
            session: None,
            events_tx,
            events_rx,
            accepted: HashSet::new(),
            readiness: TrackReadiness::default(),
            forward,
            lifecycle,
            keyframe_period: KEYFRAME_PERIOD,
            tasks: Vec::new(),
        }
    }

    pub fn with_keyframe_period(mut self, period: Duration) -> Self {
        self.keyframe_period = period;
        self
    }

    /// Sends PLAY and waits for the offer.
    pub fn start(&mut self) -> Result<(), SignalingError> {
        self.signaling
            .send(SignalingEnvelope::play(&self.stream_id, self.auth.as_deref()))?;
        self.state = NegotiationState::AwaitingOffer;
        tracing::info!(target = "negotiation", stream_id = %self.stream_id, "play requested");
        Ok(())
    }

    /// Drives the session until a fatal input, then runs the shutdown path
    /// and returns the reason.
    pub async fn run<S>(mut self, mut source: S) -> ShutdownReason
    where
        S: SignalingSource,
    {
        let mut flow = match self.start() {
            Ok(()) => Flow::Continue,
            Err(err) => Flow::Shutdown(ShutdownReason::SignalingFailed(err.to_string())),
        };

        let reason = loop {
            if let Flow::Shutdown(reason) = flow {
                break reason;
            }
            let input = tokio::select! {
                frame = source.receive() => Input::Frame(frame),
                Some(event) = self.events_rx.recv() => Input::Peer(event),
            };
            flow = match input {
                Input::Frame(Ok(envelope)) => self.handle_envelope(envelope).await,
                Input::Frame(Err(err)) => self.handle_signaling_error(err),
                Input::Peer(event) => self.handle_peer_event(event).await,
            };
        };

        self.lifecycle.shutdown(reason.clone());
        self.close().await;
        reason
    }

    fn handle_signaling_error(&self, err: SignalingError) -> Flow {
        match err {
            SignalingError::Protocol(message) => {
                tracing::warn!(target = "negotiation", "dropping malformed frame: {message}");
                Flow::Continue
            }
            SignalingError::ConnectionClosed => Flow::Shutdown(ShutdownReason::SignalingClosed),
            other => Flow::Shutdown(ShutdownReason::SignalingFailed(other.to_string())),
        }
    }

    pub async fn handle_envelope(&mut self, envelope: SignalingEnvelope) -> Flow {
        match envelope.method {
            Method::Offer => self.handle_offer(&envelope.body).await,
            Method::Candidate => {
                self.handle_remote_candidate(&envelope.body).await;
                Flow::Continue
            }
            Method::Close => Flow::Shutdown(ShutdownReason::RemoteClosed),
            Method::Standby => {
                if self.state.offer_accepted() {
                    Flow::Shutdown(ShutdownReason::PublisherStopped)
                } else {
                    tracing::info!(target = "negotiation", "stream is not live yet (STANDBY)");
                    Flow::Continue
                }
            }
            Method::Error => {
                let message = envelope
                    .param(PARAM_ERROR_MESSAGE)
                    .map(str::to_string)
                    .or_else(|| Some(envelope.body.trim().to_string()).filter(|body| !body.is_empty()))
                    .unwrap_or_else(|| "unknown error".to_string());
                tracing::warn!(target = "negotiation", %message, "server reported an error");
                Flow::Shutdown(ShutdownReason::ServerError(message))
            }
            Method::Play | Method::Answer | Method::Heartbeat | Method::Other(_) => {
                tracing::debug!(target = "negotiation", method = %envelope.method, "ignoring frame");
                Flow::Continue
            }
        }
    }

    async fn handle_offer(&mut self, body: &str) -> Flow {
        if self.state != NegotiationState::AwaitingOffer {
            tracing::debug!(target = "negotiation", state = ?self.state, "ignoring OFFER");
            return Flow::Continue;
        }
        let offer = match serde_json::from_str::<SessionDescription>(body) {
            Ok(offer) if offer.sdp_type == SdpType::Offer => offer,
            Ok(other) => {
                tracing::warn!(target = "negotiation", sdp_type = ?other.sdp_type, "OFFER body is not an offer");
                return Flow::Continue;
            }
            Err(err) => {
                tracing::warn!(target = "negotiation", "invalid OFFER body: {err}");
                return Flow::Continue;
            }
        };

        match self.accept_offer(offer).await {
            Ok(()) => Flow::Continue,
            Err(NegotiationError::Signaling(err)) => {
                Flow::Shutdown(ShutdownReason::SignalingFailed(err.to_string()))
            }
            Err(err) => Flow::Shutdown(ShutdownReason::Negotiation(err.to_string())),
        }
    }

    async fn accept_offer(&mut self, offer: SessionDescription) -> Result<(), NegotiationError> {
        let kinds = offer.media_kinds();
        if kinds.is_empty() {
            return Err(NegotiationError::NoMedia);
        }

        let session = self.engine.open(self.events_tx.clone()).await?;
        self.session = Some(Arc::clone(&session));
        self.state = NegotiationState::Negotiating;
        self.readiness.expect(kinds);

        let answer = session.accept_offer(offer).await?;
        let body = serde_json::to_string(&answer)
            .map_err(|err| crate::peer::PeerError::Description(err.to_string()))?;
        self.signaling
            .send(SignalingEnvelope::reply(Method::Answer, &self.stream_id, body))?;
        tracing::info!(
            target = "negotiation",
            video = kinds.video,
            audio = kinds.audio,
            "offer accepted, answer sent"
        );
        Ok(())
    }

    async fn handle_remote_candidate(&mut self, body: &str) {
        if !self.state.offer_accepted() || body.trim().is_empty() {
            tracing::debug!(target = "negotiation", state = ?self.state, "ignoring CANDIDATE");
            return;
        }
        let Some(session) = self.session.as_ref() else {
            return;
        };
        let candidate = match serde_json::from_str::<CandidateInit>(body) {
            Ok(candidate) => candidate,
            Err(err) => {
                tracing::warn!(target = "negotiation", "invalid CANDIDATE body: {err}");
                return;
            }
        };
        if let Err(err) = session.add_remote_candidate(candidate).await {
            tracing::warn!(target = "negotiation", "failed to add remote candidate: {err}");
        }
    }

    pub async fn handle_peer_event(&mut self, event: PeerEvent) -> Flow {
        if self.state == NegotiationState::Closed {
            return Flow::Continue;
        }
        match event {
            PeerEvent::Track { kind, ssrc, source } => {
                self.accept_track(kind, ssrc, source);
                Flow::Continue
            }
            PeerEvent::LocalCandidate(candidate) => {
                let body = match candidate {
                    Some(candidate) => match serde_json::to_string(&candidate) {
                        Ok(body) => body,
                        Err(err) => {
                            tracing::warn!(target = "negotiation", "failed to encode candidate: {err}");
                            return Flow::Continue;
                        }
                    },
                    None => String::new(),
                };
                match self
                    .signaling
                    .send(SignalingEnvelope::reply(Method::Candidate, &self.stream_id, body))
                {
                    Ok(()) => Flow::Continue,
                    Err(err) => Flow::Shutdown(ShutdownReason::SignalingFailed(err.to_string())),
                }
            }
            PeerEvent::ConnectionState(state) => match state {
                PeerConnectionState::Connected => {
                    if self.state == NegotiationState::Negotiating {
                        self.state = NegotiationState::Connected;
                    }
                    tracing::info!(target = "negotiation", "peer connection established");
                    Flow::Continue
                }
                PeerConnectionState::Failed => Flow::Shutdown(ShutdownReason::PeerFailed),
                PeerConnectionState::Closed => Flow::Shutdown(ShutdownReason::PeerClosed),
                other => {
                    tracing::debug!(target = "negotiation", state = ?other, "peer connection state");
                    Flow::Continue
                }
            },
            PeerEvent::FirstPacket(kind) => {
                tracing::debug!(target = "negotiation", %kind, "first packet received");
                if !self.readiness.mark_flowing(kind) {
                    return Flow::Continue;
                }
                self.emit_descriptor().await
            }
        }
    }

    fn accept_track(&mut self, kind: TrackKind, ssrc: u32, source: Box<dyn MediaSource>) {
        if !self.accepted.insert(kind) {
            tracing::debug!(target = "negotiation", %kind, ssrc, "dropping duplicate track");
            return;
        }
        let port = self.targets.port(kind);
        tracing::info!(target = "negotiation", %kind, ssrc, port, "relaying track");

        let relay = MediaRelay::new(kind, Some(self.events_tx.clone()));
        self.tasks.push(tokio::spawn(async move {
            match relay.forward_to_port(source, port).await {
                RelayEnd::TrackClosed(err) => {
                    tracing::info!(target = "relay", %kind, "relay stopped: {err}")
                }
                RelayEnd::WriteFailed(err) => {
                    tracing::warn!(target = "relay", %kind, "relay stopped: {err}")
                }
            }
        }));

        if let Some(session) = self.session.as_ref() {
            self.tasks.push(spawn_keyframe_requests(
                Arc::downgrade(session),
                ssrc,
                self.keyframe_period,
            ));
        }
    }

    async fn emit_descriptor(&mut self) -> Flow {
        let targets = &self.targets;
        if let Err(err) =
            descriptor::write(&targets.sdp_file, targets.video_port, targets.audio_port).await
        {
            return Flow::Shutdown(ShutdownReason::Descriptor(err.to_string()));
        }
        tracing::info!(target = "negotiation", path = %targets.sdp_file.display(), "session descriptor written");
        self.forward.launch();
        Flow::Continue
    }

    async fn close(&mut self) {
        self.state = NegotiationState::Closed;
        for task in self.tasks.drain(..) {
            task.abort();
        }
        if let Some(session) = self.session.take() {
            if let Err(err) = session.close().await {
                tracing::debug!(target = "negotiation", "peer close failed: {err}");
            }
        }
    }
}

/// Periodic picture-loss indications for one track. Stops once the session
/// is gone.
fn spawn_keyframe_requests(
    session: Weak<dyn PeerSession>,
    media_ssrc: u32,
    period: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + period, period);
        loop {
            ticker.tick().await;
            let Some(session) = session.upgrade() else {
                break;
            };
            if let Err(err) = session.request_keyframe(media_ssrc).await {
                tracing::trace!(target = "negotiation", media_ssrc, "keyframe request failed: {err}");
            }
        }
    })
}
