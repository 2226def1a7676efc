//! Packets and their wire framing.
//!
//! # Frame layout (big-endian)
//!
//! ```text
//! ┌──────────────┬────────────────┬─────────┬────────┬────────────┬─────────────────┬─────────┐
//! │ u32 frame_len│ u16 channel_len│ channel │ u8 has │ [16] uuid  │ u32 payload_len │ payload │
//! │              │                │ (utf-8) │ _id    │ if has_id  │                 │         │
//! └──────────────┴────────────────┴─────────┴────────┴────────────┴─────────────────┴─────────┘
//! ```
//!
//! `frame_len` counts every byte after itself.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use uuid::Uuid;

use crate::error::{TransportError, TransportResult};

/// Largest frame accepted on the wire.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// A message on a named logical channel.
///
/// `id` correlates a request with its response; fire-and-forget packets
/// carry none.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub channel: String,
    pub id: Option<Uuid>,
    pub payload: Bytes,
}

impl Packet {
    pub fn new(channel: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            channel: channel.into(),
            id: None,
            payload: payload.into(),
        }
    }

    /// A packet whose payload is the JSON encoding of `message`.
    pub fn json<T: Serialize>(channel: impl Into<String>, message: &T) -> TransportResult<Self> {
        let payload = serde_json::to_vec(message)?;
        Ok(Self::new(channel, payload))
    }

    /// A JSON packet carrying a fresh correlation id.
    pub fn request<T: Serialize>(channel: impl Into<String>, message: &T) -> TransportResult<Self> {
        Ok(Self::json(channel, message)?.with_id(Uuid::new_v4()))
    }

    /// A JSON response on the same channel with the same correlation id.
    pub fn reply<T: Serialize>(&self, message: &T) -> TransportResult<Self> {
        let mut packet = Self::json(self.channel.clone(), message)?;
        packet.id = self.id;
        Ok(packet)
    }

    pub fn with_id(mut self, id: Uuid) -> Self {
        self.id = Some(id);
        self
    }

    /// Decode the JSON payload.
    pub fn decode<T: DeserializeOwned>(&self) -> TransportResult<T> {
        Ok(serde_json::from_slice(&self.payload)?)
    }
}

/// Encoder/decoder for the frame layout above.
pub struct PacketCodec;

impl PacketCodec {
    /// Append the encoded frame for `packet` to `dst`.
    pub fn encode(packet: &Packet, dst: &mut BytesMut) -> TransportResult<()> {
        let channel = packet.channel.as_bytes();
        let channel_len = u16::try_from(channel.len())
            .map_err(|_| TransportError::Malformed("channel name too long".into()))?;
        let id_len = if packet.id.is_some() { 16 } else { 0 };
        let body_len = 2 + channel.len() + 1 + id_len + 4 + packet.payload.len();
        if body_len > MAX_FRAME_LEN {
            return Err(TransportError::FrameTooLarge(body_len));
        }

        dst.reserve(4 + body_len);
        dst.put_u32(body_len as u32);
        dst.put_u16(channel_len);
        dst.put_slice(channel);
        match packet.id {
            Some(id) => {
                dst.put_u8(1);
                dst.put_slice(id.as_bytes());
            }
            None => dst.put_u8(0),
        }
        dst.put_u32(packet.payload.len() as u32);
        dst.put_slice(&packet.payload);
        Ok(())
    }

    /// Decode one frame from the front of `src`.
    ///
    /// Returns `Ok(None)` and leaves `src` untouched when the frame is not
    /// complete yet.
    pub fn decode(src: &mut BytesMut) -> TransportResult<Option<Packet>> {
        if src.len() < 4 {
            return Ok(None);
        }
        let frame_len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if frame_len > MAX_FRAME_LEN {
            return Err(TransportError::FrameTooLarge(frame_len));
        }
        if src.len() < 4 + frame_len {
            return Ok(None);
        }
        src.advance(4);
        let body = src.split_to(frame_len).freeze();
        Self::decode_body(body).map(Some)
    }

    fn decode_body(mut body: Bytes) -> TransportResult<Packet> {
        let truncated = || TransportError::Malformed("truncated frame".into());

        if body.remaining() < 2 {
            return Err(truncated());
        }
        let channel_len = body.get_u16() as usize;
        if body.remaining() < channel_len + 1 {
            return Err(truncated());
        }
        let channel = String::from_utf8(body.split_to(channel_len).to_vec())
            .map_err(|_| TransportError::Malformed("channel is not utf-8".into()))?;

        let id = match body.get_u8() {
            0 => None,
            1 => {
                if body.remaining() < 16 {
                    return Err(truncated());
                }
                let mut raw = [0u8; 16];
                body.copy_to_slice(&mut raw);
                Some(Uuid::from_bytes(raw))
            }
            flag => {
                return Err(TransportError::Malformed(format!("invalid id flag {flag}")));
            }
        };

        if body.remaining() < 4 {
            return Err(truncated());
        }
        let payload_len = body.get_u32() as usize;
        if body.remaining() != payload_len {
            return Err(TransportError::Malformed(format!(
                "payload length {payload_len} does not match remaining {} bytes",
                body.remaining()
            )));
        }

        Ok(Packet {
            channel,
            id,
            payload: body,
        })
    }

    /// Read one frame. Returns `Ok(None)` on a clean end of stream.
    pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> TransportResult<Option<Packet>> {
        let frame_len = match reader.read_u32().await {
            Ok(len) => len as usize,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if frame_len > MAX_FRAME_LEN {
            return Err(TransportError::FrameTooLarge(frame_len));
        }
        let mut body = vec![0u8; frame_len];
        reader.read_exact(&mut body).await?;
        Self::decode_body(Bytes::from(body)).map(Some)
    }

    pub async fn write_frame<W: AsyncWrite + Unpin>(
        writer: &mut W,
        packet: &Packet,
    ) -> TransportResult<()> {
        let mut buf = BytesMut::new();
        Self::encode(packet, &mut buf)?;
        writer.write_all(&buf).await?;
        writer.flush().await?;
        Ok(())
    }
}
