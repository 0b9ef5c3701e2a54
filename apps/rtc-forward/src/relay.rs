//! Per-track forwarding of RTP packets to a loopback UDP port.

use std::io;
use std::net::{Ipv4Addr, SocketAddr};

use async_trait::async_trait;
use thiserror::Error;
use tokio::net::UdpSocket;
use webrtc::rtp::packet::Packet;
use webrtc::util::Marshal;

use crate::peer::{PeerEvent, PeerEventSender, TrackKind};

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("track read failed: {0}")]
    Read(String),
    #[error("packet encode failed: {0}")]
    Encode(String),
    #[error("udp socket error: {0}")]
    Socket(#[from] io::Error),
}

/// A readable, already decrypted media track.
#[async_trait]
pub trait MediaSource: Send {
    async fn next_packet(&mut self) -> Result<Packet, MediaError>;
}

#[async_trait]
impl<S: MediaSource + ?Sized> MediaSource for Box<S> {
    async fn next_packet(&mut self) -> Result<Packet, MediaError> {
        (**self).next_packet().await
    }
}

/// Where rewritten packets go. Implemented by a connected [`UdpSocket`].
#[async_trait]
pub trait DatagramSink: Send + Sync {
    async fn send_datagram(&self, datagram: &[u8]) -> io::Result<usize>;
}

#[async_trait]
impl DatagramSink for UdpSocket {
    async fn send_datagram(&self, datagram: &[u8]) -> io::Result<usize> {
        self.send(datagram).await
    }
}

/// Why a relay stopped.
#[derive(Debug)]
pub enum RelayEnd {
    /// The track stopped producing packets.
    TrackClosed(MediaError),
    /// The destination failed with something other than "refused".
    WriteFailed(io::Error),
}

/// Opens the loopback socket used for the lifetime of one relay.
pub async fn loopback_socket(port: u16) -> io::Result<UdpSocket> {
    let socket = UdpSocket::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, 0))).await?;
    socket
        .connect(SocketAddr::from((Ipv4Addr::LOCALHOST, port)))
        .await?;
    Ok(socket)
}

/// ICMP port-unreachable surfaces as ECONNREFUSED on a connected UDP socket.
/// That only means the consumer is not listening yet.
pub fn is_destination_refused(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::ConnectionRefused
}

pub struct MediaRelay {
    kind: TrackKind,
    events: Option<PeerEventSender>,
    forwarded: u64,
    dropped: u64,
}

impl MediaRelay {
    /// `events` receives one [`PeerEvent::FirstPacket`] when the first packet
    /// has been read.
    pub fn new(kind: TrackKind, events: Option<PeerEventSender>) -> Self {
        Self {
            kind,
            events,
            forwarded: 0,
            dropped: 0,
        }
    }

    /// Binds a socket to `port` and relays until the track or socket fails.
    pub async fn forward_to_port<S>(self, source: S, port: u16) -> RelayEnd
    where
        S: MediaSource,
    {
        match loopback_socket(port).await {
            Ok(socket) => self.run(source, socket).await,
            Err(err) => {
                tracing::warn!(target = "relay", kind = %self.kind, port, "udp socket setup failed: {err}");
                RelayEnd::WriteFailed(err)
            }
        }
    }

    pub async fn run<S, D>(mut self, mut source: S, sink: D) -> RelayEnd
    where
        S: MediaSource,
        D: DatagramSink,
    {
        let payload_type = self.kind.payload_type();
        loop {
            let mut packet = match source.next_packet().await {
                Ok(packet) => packet,
                Err(err) => {
                    tracing::info!(
                        target = "relay",
                        kind = %self.kind,
                        forwarded = self.forwarded,
                        dropped = self.dropped,
                        "track ended: {err}"
                    );
                    return RelayEnd::TrackClosed(err);
                }
            };

            if let Some(events) = self.events.take() {
                let _ = events.send(PeerEvent::FirstPacket(self.kind));
            }

            packet.header.payload_type = payload_type;
            let datagram = match packet.marshal() {
                Ok(bytes) => bytes,
                Err(err) => {
                    tracing::debug!(target = "relay", kind = %self.kind, "dropping unencodable packet: {err}");
                    self.dropped += 1;
                    continue;
                }
            };

            match sink.send_datagram(&datagram).await {
                Ok(_) => self.forwarded += 1,
                Err(err) if is_destination_refused(&err) => {
                    self.dropped += 1;
                    if self.dropped == 1 || self.dropped % 500 == 0 {
                        tracing::debug!(
                            target = "relay",
                            kind = %self.kind,
                            dropped = self.dropped,
                            "consumer not listening yet; dropping packets"
                        );
                    }
                }
                Err(err) => {
                    tracing::warn!(
                        target = "relay",
                        kind = %self.kind,
                        forwarded = self.forwarded,
                        "udp write failed: {err}"
                    );
                    return RelayEnd::WriteFailed(err);
                }
            }
        }
    }
}
