//! Seam between the negotiation state machine and the peer-session engine.
//!
//! Engine callbacks never mutate session state directly. They push
//! [`PeerEvent`]s onto a queue that the controller task drains in order.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::relay::MediaSource;

pub mod webrtc;

pub type PeerEventSender = mpsc::UnboundedSender<PeerEvent>;
pub type PeerEventReceiver = mpsc::UnboundedReceiver<PeerEvent>;

#[derive(Debug, Error)]
pub enum PeerError {
    #[error("peer session setup failed: {0}")]
    Setup(String),
    #[error("invalid session description: {0}")]
    Description(String),
    #[error("invalid ice candidate: {0}")]
    Candidate(String),
    #[error("rtcp write failed: {0}")]
    Rtcp(String),
    #[error("peer session closed")]
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    Video,
    Audio,
}

impl TrackKind {
    /// Payload type advertised for this kind by the local descriptor.
    pub fn payload_type(self) -> u8 {
        match self {
            TrackKind::Video => 96,
            TrackKind::Audio => 111,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TrackKind::Video => "video",
            TrackKind::Audio => "audio",
        }
    }
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Pranswer,
    Answer,
    Rollback,
}

/// JSON body of OFFER / ANSWER frames: `{"type":"offer","sdp":"v=0..."}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

/// Media kinds declared by the `m=` lines of a description.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MediaKinds {
    pub video: bool,
    pub audio: bool,
}

impl MediaKinds {
    pub fn contains(&self, kind: TrackKind) -> bool {
        match kind {
            TrackKind::Video => self.video,
            TrackKind::Audio => self.audio,
        }
    }

    pub fn is_empty(&self) -> bool {
        !self.video && !self.audio
    }
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }

    pub fn media_kinds(&self) -> MediaKinds {
        let mut kinds = MediaKinds::default();
        for line in self.sdp.lines() {
            let line = line.trim_start();
            if line.starts_with("m=video") {
                kinds.video = true;
            } else if line.starts_with("m=audio") {
                kinds.audio = true;
            }
        }
        kinds
    }
}

/// JSON body of CANDIDATE frames, in the browser `RTCIceCandidateInit` shape.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateInit {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
    #[serde(
        rename = "usernameFragment",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub username_fragment: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

pub enum PeerEvent {
    /// Remote track announced by the engine.
    Track {
        kind: TrackKind,
        ssrc: u32,
        source: Box<dyn MediaSource>,
    },
    /// Locally gathered candidate; `None` marks end of gathering.
    LocalCandidate(Option<CandidateInit>),
    ConnectionState(PeerConnectionState),
    /// A relay read its first packet for this kind.
    FirstPacket(TrackKind),
}

impl fmt::Debug for PeerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerEvent::Track { kind, ssrc, .. } => f
                .debug_struct("Track")
                .field("kind", kind)
                .field("ssrc", ssrc)
                .finish_non_exhaustive(),
            PeerEvent::LocalCandidate(candidate) => {
                f.debug_tuple("LocalCandidate").field(candidate).finish()
            }
            PeerEvent::ConnectionState(state) => {
                f.debug_tuple("ConnectionState").field(state).finish()
            }
            PeerEvent::FirstPacket(kind) => f.debug_tuple("FirstPacket").field(kind).finish(),
        }
    }
}

/// Creates peer sessions wired to an event queue.
#[async_trait]
pub trait PeerEngine: Send + Sync {
    async fn open(&self, events: PeerEventSender) -> Result<Arc<dyn PeerSession>, PeerError>;
}

#[async_trait]
pub trait PeerSession: Send + Sync {
    /// Applies the remote offer and returns the local answer, already set as
    /// the local description.
    async fn accept_offer(
        &self,
        offer: SessionDescription,
    ) -> Result<SessionDescription, PeerError>;

    async fn add_remote_candidate(&self, candidate: CandidateInit) -> Result<(), PeerError>;

    /// Sends a picture loss indication for `media_ssrc`.
    async fn request_keyframe(&self, media_ssrc: u32) -> Result<(), PeerError>;

    async fn close(&self) -> Result<(), PeerError>;
}
