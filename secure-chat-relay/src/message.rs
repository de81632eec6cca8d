use std::io;

use bytes::{Bytes, BytesMut};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};

/// Upper bound on a single frame, handshake tokens included.
pub const MAX_FRAME_LEN: usize = 64 * 1024;

pub type FrameReader<R> = FramedRead<R, LengthDelimitedCodec>;
pub type FrameWriter<W> = FramedWrite<W, LengthDelimitedCodec>;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum MessageKind {
    #[serde(rename = "TEXT")]
    Text,
    #[serde(rename = "LOGOUT")]
    Logout,
    #[serde(rename = "WHOISIN")]
    WhoIsIn,
}

/// Application message a client sends inside one encrypted frame.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatMessage {
    pub kind: MessageKind,
    #[serde(default)]
    pub message: String,
}

impl ChatMessage {
    pub fn text(message: impl Into<String>) -> Self {
        Self {
            kind: MessageKind::Text,
            message: message.into(),
        }
    }

    pub fn logout() -> Self {
        Self {
            kind: MessageKind::Logout,
            message: String::new(),
        }
    }

    pub fn who_is_in() -> Self {
        Self {
            kind: MessageKind::WhoIsIn,
            message: String::new(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_LEN)
        .new_codec()
}

pub fn frame_reader<R: AsyncRead>(reader: R) -> FrameReader<R> {
    FramedRead::new(reader, codec())
}

pub fn frame_writer<W: AsyncWrite>(writer: W) -> FrameWriter<W> {
    FramedWrite::new(writer, codec())
}

/// Reads the next frame; `None` means the peer closed the stream cleanly.
pub async fn read_frame<R>(reader: &mut FrameReader<R>) -> io::Result<Option<BytesMut>>
where
    R: AsyncRead + Unpin,
{
    reader.next().await.transpose()
}

pub async fn write_frame<W>(writer: &mut FrameWriter<W>, frame: impl Into<Bytes>) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.send(frame.into()).await
}
