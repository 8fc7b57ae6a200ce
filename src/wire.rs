//! Binary framing for peer messages.
//!
//! Each length-delimited frame is `MAGIC (4 bytes) | type (1 byte) | payload`
//! where the payload is the MessagePack encoding of the message struct.
//! Frames with an unknown magic, an unknown type or an undecodable payload
//! are dropped and decoding continues with the next frame.

use serde::de::DeserializeOwned;
use tokio_util::bytes::{BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};
use tracing::debug;

use crate::rpc::PeerMessage;

pub const MAGIC: [u8; 4] = *b"DWV1";

const MAX_FRAME_LENGTH: usize = 16 * 1024 * 1024;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Ping = 0x01,
    Pong = 0x02,
    Election = 0x10,
    Alive = 0x11,
    Coordinator = 0x12,
    Puzzle = 0x13,
    Claim = 0x14,
    MutexRequest = 0x20,
    MutexReply = 0x21,
    Announce = 0x30,
    DiscoveryRequest = 0x31,
    Ack = 0x7F,
}

impl TryFrom<u8> for MessageType {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0x01 => MessageType::Ping,
            0x02 => MessageType::Pong,
            0x10 => MessageType::Election,
            0x11 => MessageType::Alive,
            0x12 => MessageType::Coordinator,
            0x13 => MessageType::Puzzle,
            0x14 => MessageType::Claim,
            0x20 => MessageType::MutexRequest,
            0x21 => MessageType::MutexReply,
            0x30 => MessageType::Announce,
            0x31 => MessageType::DiscoveryRequest,
            0x7F => MessageType::Ack,
            other => return Err(other),
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),
}

impl PeerMessage {
    pub fn message_type(&self) -> MessageType {
        match self {
            PeerMessage::Ping(_) => MessageType::Ping,
            PeerMessage::Pong(_) => MessageType::Pong,
            PeerMessage::Election(_) => MessageType::Election,
            PeerMessage::Alive(_) => MessageType::Alive,
            PeerMessage::Coordinator(_) => MessageType::Coordinator,
            PeerMessage::Puzzle(_) => MessageType::Puzzle,
            PeerMessage::Claim(_) => MessageType::Claim,
            PeerMessage::MutexRequest(_) => MessageType::MutexRequest,
            PeerMessage::MutexReply(_) => MessageType::MutexReply,
            PeerMessage::Announce(_) => MessageType::Announce,
            PeerMessage::DiscoveryRequest(_) => MessageType::DiscoveryRequest,
            PeerMessage::Ack(_) => MessageType::Ack,
        }
    }
}

/// Encode a message into a frame body (without the length prefix).
pub fn encode_frame(msg: &PeerMessage) -> Result<Bytes, WireError> {
    let payload = match msg {
        PeerMessage::Ping(m) => rmp_serde::to_vec_named(m)?,
        PeerMessage::Pong(m) => rmp_serde::to_vec_named(m)?,
        PeerMessage::Election(m) => rmp_serde::to_vec_named(m)?,
        PeerMessage::Alive(m) => rmp_serde::to_vec_named(m)?,
        PeerMessage::Coordinator(m) => rmp_serde::to_vec_named(m)?,
        PeerMessage::Puzzle(m) => rmp_serde::to_vec_named(m)?,
        PeerMessage::Claim(m) => rmp_serde::to_vec_named(m)?,
        PeerMessage::MutexRequest(m) => rmp_serde::to_vec_named(m)?,
        PeerMessage::MutexReply(m) => rmp_serde::to_vec_named(m)?,
        PeerMessage::Announce(m) => rmp_serde::to_vec_named(m)?,
        PeerMessage::DiscoveryRequest(m) => rmp_serde::to_vec_named(m)?,
        PeerMessage::Ack(m) => rmp_serde::to_vec_named(m)?,
    };

    let mut buf = BytesMut::with_capacity(MAGIC.len() + 1 + payload.len());
    buf.put_slice(&MAGIC);
    buf.put_u8(msg.message_type() as u8);
    buf.put_slice(&payload);
    Ok(buf.freeze())
}

/// Decode a frame body. Returns `None` for anything unrecognised.
pub fn decode_frame(frame: &[u8]) -> Option<PeerMessage> {
    if frame.len() < MAGIC.len() + 1 || frame[..MAGIC.len()] != MAGIC {
        debug!(len = frame.len(), "Dropping frame with bad magic");
        return None;
    }
    let kind = match MessageType::try_from(frame[MAGIC.len()]) {
        Ok(kind) => kind,
        Err(byte) => {
            debug!(kind = byte, "Dropping frame with unknown type");
            return None;
        }
    };
    let payload = &frame[MAGIC.len() + 1..];

    let msg = match kind {
        MessageType::Ping => PeerMessage::Ping(payload_of(payload)?),
        MessageType::Pong => PeerMessage::Pong(payload_of(payload)?),
        MessageType::Election => PeerMessage::Election(payload_of(payload)?),
        MessageType::Alive => PeerMessage::Alive(payload_of(payload)?),
        MessageType::Coordinator => PeerMessage::Coordinator(payload_of(payload)?),
        MessageType::Puzzle => PeerMessage::Puzzle(payload_of(payload)?),
        MessageType::Claim => PeerMessage::Claim(payload_of(payload)?),
        MessageType::MutexRequest => PeerMessage::MutexRequest(payload_of(payload)?),
        MessageType::MutexReply => PeerMessage::MutexReply(payload_of(payload)?),
        MessageType::Announce => PeerMessage::Announce(payload_of(payload)?),
        MessageType::DiscoveryRequest => PeerMessage::DiscoveryRequest(payload_of(payload)?),
        MessageType::Ack => PeerMessage::Ack(payload_of(payload)?),
    };
    Some(msg)
}

fn payload_of<T: DeserializeOwned>(payload: &[u8]) -> Option<T> {
    match rmp_serde::from_slice(payload) {
        Ok(v) => Some(v),
        Err(e) => {
            debug!(error = %e, "Dropping frame with undecodable payload");
            None
        }
    }
}

/// Length-delimited codec speaking [`PeerMessage`]s.
#[derive(Debug)]
pub struct PeerCodec {
    inner: LengthDelimitedCodec,
}

impl PeerCodec {
    pub fn new() -> Self {
        Self {
            inner: LengthDelimitedCodec::builder()
                .max_frame_length(MAX_FRAME_LENGTH)
                .new_codec(),
        }
    }
}

impl Default for PeerCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for PeerCodec {
    type Item = PeerMessage;
    type Error = WireError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<PeerMessage>, WireError> {
        loop {
            let Some(frame) = self.inner.decode(src)? else {
                return Ok(None);
            };
            if let Some(msg) = decode_frame(&frame) {
                return Ok(Some(msg));
            }
        }
    }
}

impl Encoder<PeerMessage> for PeerCodec {
    type Error = WireError;

    fn encode(&mut self, msg: PeerMessage, dst: &mut BytesMut) -> Result<(), WireError> {
        let body = encode_frame(&msg)?;
        self.inner.encode(body, dst)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::{Coordinator, Header, MutexRequest};

    fn coordinator() -> PeerMessage {
        PeerMessage::Coordinator(Coordinator {
            header: Header::lamport("node-3", 7),
            leader_id: "node-3".into(),
            term: 4,
        })
    }

    #[test]
    fn test_frame_layout() {
        let frame = encode_frame(&coordinator()).unwrap();
        assert_eq!(&frame[..4], b"DWV1");
        assert_eq!(frame[4], 0x12);
        assert_eq!(decode_frame(&frame), Some(coordinator()));
    }

    #[test]
    fn test_bad_magic_and_type_are_dropped() {
        let mut frame = encode_frame(&coordinator()).unwrap().to_vec();
        frame[0] = b'X';
        assert_eq!(decode_frame(&frame), None);

        let mut frame = encode_frame(&coordinator()).unwrap().to_vec();
        frame[4] = 0x55;
        assert_eq!(decode_frame(&frame), None);

        assert_eq!(decode_frame(b"DW"), None);
    }

    #[test]
    fn test_payload_type_mismatch_is_dropped() {
        // A COORDINATOR payload under the MUTEX_REQUEST type byte.
        let mut frame = encode_frame(&coordinator()).unwrap().to_vec();
        frame[4] = MessageType::MutexRequest as u8;
        assert_eq!(decode_frame(&frame), None);
    }

    #[test]
    fn test_codec_skips_garbage_frames() {
        let mut codec = PeerCodec::new();
        let mut buf = BytesMut::new();

        let mut raw = LengthDelimitedCodec::new();
        raw.encode(Bytes::from_static(b"junkjunk"), &mut buf).unwrap();

        let request = PeerMessage::MutexRequest(MutexRequest {
            header: Header::lamport("node-1", 3),
            resource_id: "index".into(),
        });
        codec.encode(request.clone(), &mut buf).unwrap();

        assert_eq!(codec.decode(&mut buf).unwrap(), Some(request));
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
    }
}
