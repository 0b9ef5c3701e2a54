//! Control connection to the media server.
//!
//! Frames are text envelopes (see [`envelope`]). Every outgoing frame goes
//! through one writer task, so the heartbeat, ICE emission and the answer
//! never interleave on the socket.

use std::fmt;

use async_trait::async_trait;
use futures_util::stream::SplitStream;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{Error as WsError, Message, error::ProtocolError},
};
use url::Url;

pub mod envelope;
pub mod heartbeat;

pub use envelope::{Method, Params, SignalingEnvelope};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("signaling transport error: {0}")]
    Transport(String),
    #[error("malformed signaling frame: {0}")]
    Protocol(String),
    #[error("signaling connection closed")]
    ConnectionClosed,
}

/// Anything the controller can pull decoded envelopes from.
#[async_trait]
pub trait SignalingSource: Send {
    async fn receive(&mut self) -> Result<SignalingEnvelope, SignalingError>;
}

pub struct SignalingChannel;

impl SignalingChannel {
    /// Dials the server and spawns the writer task. A failed write surfaces
    /// as a transport error on the receiver.
    pub async fn connect(url: &Url) -> Result<(SignalingSender, SignalingReceiver), SignalingError> {
        tracing::debug!(target = "signaling", url = %url, "connecting");
        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .map_err(|err| SignalingError::Transport(format!("websocket connect failed: {err}")))?;
        tracing::info!(target = "signaling", url = %url, "signaling websocket connected");

        let (ws_write, ws_read) = ws_stream.split();
        let (sender, send_rx) = SignalingSender::channel();
        let (failed_tx, failed_rx) = oneshot::channel();
        tokio::spawn(write_loop(ws_write, send_rx, failed_tx));

        Ok((sender, SignalingReceiver::new(ws_read, failed_rx)))
    }
}

async fn write_loop<W>(
    mut ws_write: W,
    mut send_rx: mpsc::UnboundedReceiver<SignalingEnvelope>,
    failed: oneshot::Sender<SignalingError>,
) where
    W: Sink<Message> + Unpin,
    W::Error: fmt::Display,
{
    while let Some(envelope) = send_rx.recv().await {
        let text = envelope.encode();
        if let Err(err) = ws_write.send(Message::Text(text)).await {
            tracing::warn!(
                target = "signaling",
                method = %envelope.method,
                "signaling write failed: {err}"
            );
            let _ = failed.send(SignalingError::Transport(format!(
                "failed to send {}: {err}",
                envelope.method
            )));
            return;
        }
    }
    let _ = ws_write.close().await;
}

/// Cloneable handle feeding the single writer task.
#[derive(Clone)]
pub struct SignalingSender {
    tx: mpsc::UnboundedSender<SignalingEnvelope>,
}

impl SignalingSender {
    /// Sender plus the queue it feeds. The production writer drains the
    /// queue onto the websocket; tests read it directly.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<SignalingEnvelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn send(&self, envelope: SignalingEnvelope) -> Result<(), SignalingError> {
        tracing::debug!(target = "signaling", direction = ">>>", "\n{}", envelope);
        self.tx
            .send(envelope)
            .map_err(|_| SignalingError::Transport("signaling writer has stopped".into()))
    }
}

pub struct SignalingReceiver<R = SplitStream<WsStream>> {
    ws_read: R,
    write_failed: Option<oneshot::Receiver<SignalingError>>,
}

impl<R> SignalingReceiver<R> {
    fn new(ws_read: R, write_failed: oneshot::Receiver<SignalingError>) -> Self {
        Self {
            ws_read,
            write_failed: Some(write_failed),
        }
    }
}

/// Resolves with the writer's failure; pends forever once the writer has
/// stopped cleanly.
async fn write_failure(slot: &mut Option<oneshot::Receiver<SignalingError>>) -> SignalingError {
    let Some(failed) = slot.as_mut() else {
        return std::future::pending().await;
    };
    let result = failed.await;
    *slot = None;
    match result {
        Ok(err) => err,
        Err(_) => std::future::pending().await,
    }
}

#[async_trait]
impl<R> SignalingSource for SignalingReceiver<R>
where
    R: Stream<Item = Result<Message, WsError>> + Unpin + Send,
{
    async fn receive(&mut self) -> Result<SignalingEnvelope, SignalingError> {
        loop {
            let frame = tokio::select! {
                err = write_failure(&mut self.write_failed) => return Err(err),
                frame = self.ws_read.next() => frame,
            };
            let Some(frame) = frame else {
                return Err(SignalingError::ConnectionClosed);
            };
            let text = match frame {
                Ok(Message::Text(text)) => text,
                Ok(Message::Binary(data)) => String::from_utf8(data).map_err(|_| {
                    SignalingError::Protocol("binary frame is not valid utf-8".into())
                })?,
                Ok(Message::Close(_)) => return Err(SignalingError::ConnectionClosed),
                Ok(_) => continue,
                Err(
                    WsError::ConnectionClosed
                    | WsError::AlreadyClosed
                    | WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake),
                ) => return Err(SignalingError::ConnectionClosed),
                Err(err) => return Err(SignalingError::Transport(err.to_string())),
            };
            tracing::debug!(target = "signaling", direction = "<<<", "\n{}", text);
            return SignalingEnvelope::decode(&text);
        }
    }
}

#[async_trait]
impl SignalingSource for mpsc::UnboundedReceiver<SignalingEnvelope> {
    async fn receive(&mut self) -> Result<SignalingEnvelope, SignalingError> {
        self.recv().await.ok_or(SignalingError::ConnectionClosed)
    }
}

/// `<scheme>://<host>/ws` endpoint for a `ws(s)://host/stream-id` source.
pub fn websocket_endpoint(source: &Url) -> Url {
    let mut endpoint = source.clone();
    endpoint.set_path("/ws");
    endpoint.set_query(None);
    endpoint.set_fragment(None);
    endpoint
}
