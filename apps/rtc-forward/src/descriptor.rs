use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::peer::TrackKind;

#[derive(Debug, Error)]
#[error("failed to write session descriptor {path:?}: {source}")]
pub struct DescriptorError {
    pub path: PathBuf,
    pub source: io::Error,
}

/// Fixed-template SDP read by the consumer. Payload types match what the
/// relays stamp on every packet, whatever was negotiated.
pub fn render(video_port: u16, audio_port: u16) -> String {
    let audio_pt = TrackKind::Audio.payload_type();
    let video_pt = TrackKind::Video.payload_type();
    [
        "v=0".to_string(),
        "o=- 0 0 IN IP4 127.0.0.1".to_string(),
        "s=rtc-forward".to_string(),
        "c=IN IP4 127.0.0.1".to_string(),
        "t=0 0".to_string(),
        format!("m=audio {audio_port} RTP/AVP {audio_pt}"),
        format!("a=rtpmap:{audio_pt} OPUS/48000/2"),
        format!("m=video {video_port} RTP/AVP {video_pt}"),
        format!("a=rtpmap:{video_pt} VP8/90000"),
    ]
    .join("\n")
        + "\n"
}

/// Writes the descriptor, replacing any previous content.
pub async fn write(path: &Path, video_port: u16, audio_port: u16) -> Result<(), DescriptorError> {
    tokio::fs::write(path, render(video_port, audio_port))
        .await
        .map_err(|source| DescriptorError {
            path: path.to_path_buf(),
            source,
        })
}
