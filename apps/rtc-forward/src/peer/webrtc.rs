//! webrtc-rs implementation of the peer-session engine.

use std::sync::Arc;

use async_trait::async_trait;
use ::webrtc::api::API;
use ::webrtc::api::APIBuilder;
use ::webrtc::api::interceptor_registry::register_default_interceptors;
use ::webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8, MediaEngine};
use ::webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use ::webrtc::ice_transport::ice_server::RTCIceServer;
use ::webrtc::interceptor::registry::Registry;
use ::webrtc::peer_connection::RTCPeerConnection;
use ::webrtc::peer_connection::configuration::RTCConfiguration;
use ::webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use ::webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use ::webrtc::rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use ::webrtc::rtp::packet::Packet;
use ::webrtc::rtp_transceiver::RTCRtpTransceiver;
use ::webrtc::rtp_transceiver::rtp_codec::{
    RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType,
};
use ::webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use ::webrtc::track::track_remote::TrackRemote;

use super::{
    CandidateInit, PeerConnectionState, PeerEngine, PeerError, PeerEvent, PeerEventSender,
    PeerSession, SessionDescription, TrackKind,
};
use crate::config::IceServer;
use crate::relay::{MediaError, MediaSource};

/// Receive-only engine with VP8 video and Opus audio.
pub struct WebRtcEngine {
    api: API,
    ice_servers: Vec<RTCIceServer>,
}

impl WebRtcEngine {
    pub fn new(ice_servers: &[IceServer]) -> Result<Self, PeerError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_codec(
                RTCRtpCodecParameters {
                    capability: RTCRtpCodecCapability {
                        mime_type: MIME_TYPE_VP8.to_owned(),
                        clock_rate: 90_000,
                        channels: 0,
                        sdp_fmtp_line: String::new(),
                        rtcp_feedback: vec![],
                    },
                    payload_type: TrackKind::Video.payload_type(),
                    ..Default::default()
                },
                RTPCodecType::Video,
            )
            .map_err(|err| PeerError::Setup(format!("register VP8 codec: {err}")))?;
        media_engine
            .register_codec(
                RTCRtpCodecParameters {
                    capability: RTCRtpCodecCapability {
                        mime_type: MIME_TYPE_OPUS.to_owned(),
                        clock_rate: 48_000,
                        channels: 0,
                        sdp_fmtp_line: String::new(),
                        rtcp_feedback: vec![],
                    },
                    payload_type: TrackKind::Audio.payload_type(),
                    ..Default::default()
                },
                RTPCodecType::Audio,
            )
            .map_err(|err| PeerError::Setup(format!("register Opus codec: {err}")))?;

        // NACK, RTCP reports and TWCC.
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(|err| PeerError::Setup(format!("register interceptors: {err}")))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let ice_servers = ice_servers
            .iter()
            .map(|server| RTCIceServer {
                urls: vec![server.url.clone()],
                username: server.username.clone().unwrap_or_default(),
                credential: server.credential.clone().unwrap_or_default(),
                ..Default::default()
            })
            .collect();

        Ok(Self { api, ice_servers })
    }
}

#[async_trait]
impl PeerEngine for WebRtcEngine {
    async fn open(&self, events: PeerEventSender) -> Result<Arc<dyn PeerSession>, PeerError> {
        let rtc_config = RTCConfiguration {
            ice_servers: self.ice_servers.clone(),
            ..Default::default()
        };
        let peer_connection = Arc::new(
            self.api
                .new_peer_connection(rtc_config)
                .await
                .map_err(|err| PeerError::Setup(err.to_string()))?,
        );

        // Callbacks only enqueue; the controller owns all state.
        let track_events = events.clone();
        peer_connection.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                let events = track_events.clone();
                Box::pin(async move {
                    let kind = match track.kind() {
                        RTPCodecType::Video => TrackKind::Video,
                        RTPCodecType::Audio => TrackKind::Audio,
                        other => {
                            tracing::debug!(target = "peer", kind = %other, "ignoring track of unknown kind");
                            return;
                        }
                    };
                    tracing::debug!(
                        target = "peer",
                        kind = %kind,
                        ssrc = track.ssrc(),
                        codec = %track.codec().capability.mime_type,
                        "remote track"
                    );
                    let _ = events.send(PeerEvent::Track {
                        kind,
                        ssrc: track.ssrc(),
                        source: Box::new(RemoteTrack { track }),
                    });
                })
            },
        ));

        let candidate_events = events.clone();
        peer_connection.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let events = candidate_events.clone();
            Box::pin(async move {
                let init = match candidate {
                    Some(candidate) => match candidate.to_json() {
                        Ok(json) => Some(from_rtc_candidate(json)),
                        Err(err) => {
                            tracing::warn!(target = "peer", "failed to encode local candidate: {err}");
                            return;
                        }
                    },
                    None => None,
                };
                let _ = events.send(PeerEvent::LocalCandidate(init));
            })
        }));

        let state_events = events;
        peer_connection.on_peer_connection_state_change(Box::new(
            move |state: RTCPeerConnectionState| {
                let events = state_events.clone();
                Box::pin(async move {
                    tracing::debug!(target = "peer", state = %state, "peer connection state");
                    if let Some(state) = map_state(state) {
                        let _ = events.send(PeerEvent::ConnectionState(state));
                    }
                })
            },
        ));

        Ok(Arc::new(WebRtcSession { peer_connection }))
    }
}

struct WebRtcSession {
    peer_connection: Arc<RTCPeerConnection>,
}

#[async_trait]
impl PeerSession for WebRtcSession {
    async fn accept_offer(
        &self,
        offer: SessionDescription,
    ) -> Result<SessionDescription, PeerError> {
        let remote = RTCSessionDescription::offer(offer.sdp)
            .map_err(|err| PeerError::Description(err.to_string()))?;
        self.peer_connection
            .set_remote_description(remote)
            .await
            .map_err(|err| PeerError::Description(format!("set remote description: {err}")))?;

        let answer = self
            .peer_connection
            .create_answer(None)
            .await
            .map_err(|err| PeerError::Description(format!("create answer: {err}")))?;
        let sdp = answer.sdp.clone();
        self.peer_connection
            .set_local_description(answer)
            .await
            .map_err(|err| PeerError::Description(format!("set local description: {err}")))?;

        Ok(SessionDescription::answer(sdp))
    }

    async fn add_remote_candidate(&self, candidate: CandidateInit) -> Result<(), PeerError> {
        self.peer_connection
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: candidate.username_fragment,
            })
            .await
            .map_err(|err| PeerError::Candidate(err.to_string()))
    }

    async fn request_keyframe(&self, media_ssrc: u32) -> Result<(), PeerError> {
        self.peer_connection
            .write_rtcp(&[Box::new(PictureLossIndication {
                sender_ssrc: 0,
                media_ssrc,
            })])
            .await
            .map(|_| ())
            .map_err(|err| PeerError::Rtcp(err.to_string()))
    }

    async fn close(&self) -> Result<(), PeerError> {
        self.peer_connection
            .close()
            .await
            .map_err(|err| PeerError::Setup(format!("close: {err}")))
    }
}

struct RemoteTrack {
    track: Arc<TrackRemote>,
}

#[async_trait]
impl MediaSource for RemoteTrack {
    async fn next_packet(&mut self) -> Result<Packet, MediaError> {
        let (packet, _attributes) = self
            .track
            .read_rtp()
            .await
            .map_err(|err| MediaError::Read(err.to_string()))?;
        Ok(packet)
    }
}

fn from_rtc_candidate(json: RTCIceCandidateInit) -> CandidateInit {
    CandidateInit {
        candidate: json.candidate,
        sdp_mid: json.sdp_mid,
        sdp_mline_index: json.sdp_mline_index,
        username_fragment: json.username_fragment,
    }
}

fn map_state(state: RTCPeerConnectionState) -> Option<PeerConnectionState> {
    match state {
        RTCPeerConnectionState::New => Some(PeerConnectionState::New),
        RTCPeerConnectionState::Connecting => Some(PeerConnectionState::Connecting),
        RTCPeerConnectionState::Connected => Some(PeerConnectionState::Connected),
        RTCPeerConnectionState::Disconnected => Some(PeerConnectionState::Disconnected),
        RTCPeerConnectionState::Failed => Some(PeerConnectionState::Failed),
        RTCPeerConnectionState::Closed => Some(PeerConnectionState::Closed),
        RTCPeerConnectionState::Unspecified => None,
    }
}
