#![allow(dead_code)]

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use uuid::Uuid;
use webrtc::rtp::header::Header;
use webrtc::rtp::packet::Packet;

use rtc_forward::forward::{ForwardMode, ForwardSupervisor};
use rtc_forward::lifecycle::{ExitReceiver, SessionLifecycle, ShutdownReason};
use rtc_forward::negotiation::{MediaTargets, NegotiationController};
use rtc_forward::peer::{
    CandidateInit, PeerConnectionState, PeerEngine, PeerError, PeerEvent, PeerEventSender,
    PeerSession, SessionDescription, TrackKind,
};
use rtc_forward::relay::{MediaError, MediaSource};
use rtc_forward::signaling::{Method, SignalingEnvelope, SignalingSender};

pub const STEP: Duration = Duration::from_secs(5);

pub fn rtp_packet(payload_type: u8, sequence_number: u16, marker: u8) -> Packet {
    Packet {
        header: Header {
            version: 2,
            payload_type,
            sequence_number,
            ssrc: 0x1234_5678,
            ..Default::default()
        },
        payload: Bytes::from(vec![marker; 8]),
    }
}

pub fn offer_sdp(video: bool, audio: bool) -> String {
    let mut sdp = String::from("v=0\r\no=- 1 2 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n");
    if audio {
        sdp.push_str("m=audio 9 UDP/TLS/RTP/SAVPF 111\r\na=rtpmap:111 opus/48000/2\r\n");
    }
    if video {
        sdp.push_str("m=video 9 UDP/TLS/RTP/SAVPF 102\r\na=rtpmap:102 VP8/90000\r\n");
    }
    sdp
}

pub fn offer_envelope(video: bool, audio: bool) -> SignalingEnvelope {
    let body = serde_json::to_string(&SessionDescription::offer(offer_sdp(video, audio)))
        .expect("encode offer");
    SignalingEnvelope::new(Method::Offer)
        .with_param("Request-ID", "play01")
        .with_param("Stream-ID", "stream1")
        .with_body(body)
}

/// Track that yields its packets and then stays open without traffic.
pub struct ScriptedTrack {
    packets: VecDeque<Packet>,
}

impl ScriptedTrack {
    pub fn new(packets: Vec<Packet>) -> Self {
        Self {
            packets: packets.into(),
        }
    }
}

#[async_trait]
impl MediaSource for ScriptedTrack {
    async fn next_packet(&mut self) -> Result<Packet, MediaError> {
        match self.packets.pop_front() {
            Some(packet) => Ok(packet),
            None => std::future::pending().await,
        }
    }
}

pub struct TrackScript {
    pub kind: TrackKind,
    pub ssrc: u32,
    pub packets: Vec<Packet>,
}

/// What the engine does once an offer has been accepted.
#[derive(Default)]
pub struct EngineScript {
    pub tracks: Vec<TrackScript>,
    pub local_candidates: Vec<Option<CandidateInit>>,
    pub fail_accept: bool,
}

#[derive(Default)]
pub struct EngineLog {
    pub opened: usize,
    pub offers: Vec<SessionDescription>,
    pub candidates: Vec<CandidateInit>,
    pub keyframes: Vec<u32>,
    pub closed: bool,
    pub events: Option<PeerEventSender>,
}

#[derive(Clone, Default)]
pub struct ScriptedEngine {
    script: Arc<Mutex<Option<EngineScript>>>,
    pub log: Arc<Mutex<EngineLog>>,
}

impl ScriptedEngine {
    pub fn new(script: EngineScript) -> Self {
        Self {
            script: Arc::new(Mutex::new(Some(script))),
            log: Arc::default(),
        }
    }

    /// Pushes an event as if the engine raised it.
    pub fn inject(&self, event: PeerEvent) {
        let events = self.log.lock().events.clone().expect("no session opened");
        events.send(event).expect("controller is gone");
    }

    pub fn set_state(&self, state: PeerConnectionState) {
        self.inject(PeerEvent::ConnectionState(state));
    }
}

#[async_trait]
impl PeerEngine for ScriptedEngine {
    async fn open(&self, events: PeerEventSender) -> Result<Arc<dyn PeerSession>, PeerError> {
        let mut log = self.log.lock();
        log.opened += 1;
        log.events = Some(events.clone());
        Ok(Arc::new(ScriptedSession {
            events,
            script: Mutex::new(self.script.lock().take().unwrap_or_default()),
            log: Arc::clone(&self.log),
        }))
    }
}

struct ScriptedSession {
    events: PeerEventSender,
    script: Mutex<EngineScript>,
    log: Arc<Mutex<EngineLog>>,
}

#[async_trait]
impl PeerSession for ScriptedSession {
    async fn accept_offer(
        &self,
        offer: SessionDescription,
    ) -> Result<SessionDescription, PeerError> {
        self.log.lock().offers.push(offer.clone());
        let script = std::mem::take(&mut *self.script.lock());
        if script.fail_accept {
            return Err(PeerError::Description("scripted failure".into()));
        }
        for candidate in script.local_candidates {
            let _ = self.events.send(PeerEvent::LocalCandidate(candidate));
        }
        for track in script.tracks {
            let _ = self.events.send(PeerEvent::Track {
                kind: track.kind,
                ssrc: track.ssrc,
                source: Box::new(ScriptedTrack::new(track.packets)),
            });
        }
        Ok(SessionDescription::answer(offer.sdp.replace("o=- 1 2", "o=- 3 4")))
    }

    async fn add_remote_candidate(&self, candidate: CandidateInit) -> Result<(), PeerError> {
        self.log.lock().candidates.push(candidate);
        Ok(())
    }

    async fn request_keyframe(&self, media_ssrc: u32) -> Result<(), PeerError> {
        self.log.lock().keyframes.push(media_ssrc);
        Ok(())
    }

    async fn close(&self) -> Result<(), PeerError> {
        self.log.lock().closed = true;
        Ok(())
    }
}

/// Loopback listeners standing in for the consumer, plus a fresh sdp path.
pub struct MediaSinks {
    pub video: UdpSocket,
    pub audio: UdpSocket,
    pub targets: MediaTargets,
}

impl MediaSinks {
    pub async fn bind() -> Self {
        let video = UdpSocket::bind("127.0.0.1:0").await.expect("bind video");
        let audio = UdpSocket::bind("127.0.0.1:0").await.expect("bind audio");
        let targets = MediaTargets {
            sdp_file: temp_sdp_path(),
            video_port: video.local_addr().unwrap().port(),
            audio_port: audio.local_addr().unwrap().port(),
        };
        Self {
            video,
            audio,
            targets,
        }
    }
}

pub fn temp_sdp_path() -> PathBuf {
    std::env::temp_dir().join(format!("rtc-forward-test-{}.sdp", Uuid::new_v4()))
}

pub async fn recv_datagram(socket: &UdpSocket) -> Vec<u8> {
    let mut buf = vec![0u8; 2048];
    let n = timeout(STEP, socket.recv(&mut buf))
        .await
        .expect("datagram timed out")
        .expect("udp recv");
    buf.truncate(n);
    buf
}

pub async fn wait_for_file(path: &std::path::Path) -> String {
    let deadline = tokio::time::Instant::now() + STEP;
    loop {
        if let Ok(content) = tokio::fs::read_to_string(path).await {
            if !content.is_empty() {
                return content;
            }
        }
        assert!(tokio::time::Instant::now() < deadline, "{path:?} never written");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Controller running against in-memory signaling queues.
pub struct Harness {
    pub inbox: mpsc::UnboundedSender<SignalingEnvelope>,
    pub outbox: mpsc::UnboundedReceiver<SignalingEnvelope>,
    pub lifecycle: SessionLifecycle,
    pub exit_rx: ExitReceiver,
    pub engine: ScriptedEngine,
    pub targets: MediaTargets,
    task: JoinHandle<ShutdownReason>,
}

impl Harness {
    pub fn start(script: EngineScript, targets: MediaTargets, mode: ForwardMode) -> Self {
        Self::start_with_auth(script, targets, mode, None)
    }

    pub fn start_with_auth(
        script: EngineScript,
        targets: MediaTargets,
        mode: ForwardMode,
        auth: Option<String>,
    ) -> Self {
        let engine = ScriptedEngine::new(script);
        let (lifecycle, exit_rx) = SessionLifecycle::new();
        let forward =
            ForwardSupervisor::new(mode, targets.sdp_file.clone(), false, lifecycle.clone());
        let (sender, outbox) = SignalingSender::channel();
        let (inbox, inbox_rx) = mpsc::unbounded_channel();
        let controller = NegotiationController::new(
            "stream1",
            auth,
            targets.clone(),
            sender,
            Arc::new(engine.clone()),
            forward,
            lifecycle.clone(),
        )
        .with_keyframe_period(Duration::from_millis(20));
        let task = tokio::spawn(controller.run(inbox_rx));
        Self {
            inbox,
            outbox,
            lifecycle,
            exit_rx,
            engine,
            targets,
            task,
        }
    }

    pub fn send(&self, envelope: SignalingEnvelope) {
        self.inbox.send(envelope).expect("controller stopped reading");
    }

    pub async fn next_sent(&mut self) -> SignalingEnvelope {
        timeout(STEP, self.outbox.recv())
            .await
            .expect("no frame sent in time")
            .expect("writer queue closed")
    }

    /// Next sent frame with `method`, skipping others.
    pub async fn next_sent_of(&mut self, method: Method) -> SignalingEnvelope {
        loop {
            let envelope = self.next_sent().await;
            if envelope.method == method {
                return envelope;
            }
        }
    }

    /// Waits for the controller to end and returns its reason along with
    /// every frame it sent that was not consumed yet.
    pub async fn finish(mut self) -> (ShutdownReason, Vec<SignalingEnvelope>) {
        let reason = timeout(STEP, self.task)
            .await
            .expect("controller did not stop")
            .expect("controller panicked");
        let mut sent = Vec::new();
        while let Ok(envelope) = self.outbox.try_recv() {
            sent.push(envelope);
        }
        (reason, sent)
    }
}
