//! Wire framing for the protocol engine (spec §4.7 "Protocol Engine").
//!
//! Wire format per frame:
//! - 4 bytes: length, big-endian, includes the type byte
//! - 1 byte: frame type
//! - N bytes: payload
//!
//! Control frames (`Accept`/`Reject`/`Ack`) carry the 20-byte data object id
//! they refer to; `Terminate` carries none. `Metadata`/`Payload` frames carry
//! the postcard-encoded metadata tree or a raw payload chunk respectively.

use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;
const OBJECT_ID_LEN: usize = 20;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame too large: {0} bytes (max {MAX_FRAME_SIZE})")]
    TooLarge(usize),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed control frame: expected {OBJECT_ID_LEN}-byte object id, got {0} bytes")]
    MalformedControl(usize),
    #[error("unknown frame type: {0}")]
    UnknownFrameType(u8),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum FrameType {
    /// A `Metadata` tree: node description or data object header.
    Metadata = 0,
    /// A chunk of a data object's external payload.
    PayloadChunk = 1,
    /// Accept the object just offered; receiver wants the payload (or
    /// nothing more, if metadata-only).
    ControlAccept = 10,
    /// Reject the object just offered (already have it, or not interested).
    ControlReject = 11,
    /// Acknowledge a fully received object.
    ControlAck = 12,
    /// Tear down the connection cleanly.
    ControlTerminate = 13,
}

impl TryFrom<u8> for FrameType {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Metadata),
            1 => Ok(Self::PayloadChunk),
            10 => Ok(Self::ControlAccept),
            11 => Ok(Self::ControlReject),
            12 => Ok(Self::ControlAck),
            13 => Ok(Self::ControlTerminate),
            other => Err(FrameError::UnknownFrameType(other)),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub frame_type: FrameType,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(frame_type: FrameType, payload: Vec<u8>) -> Self {
        Self { frame_type, payload }
    }

    pub fn metadata(bytes: Vec<u8>) -> Self {
        Self::new(FrameType::Metadata, bytes)
    }

    pub fn payload_chunk(bytes: Vec<u8>) -> Self {
        Self::new(FrameType::PayloadChunk, bytes)
    }

    pub fn accept(object_id: [u8; OBJECT_ID_LEN]) -> Self {
        Self::new(FrameType::ControlAccept, object_id.to_vec())
    }

    pub fn reject(object_id: [u8; OBJECT_ID_LEN]) -> Self {
        Self::new(FrameType::ControlReject, object_id.to_vec())
    }

    pub fn ack(object_id: [u8; OBJECT_ID_LEN]) -> Self {
        Self::new(FrameType::ControlAck, object_id.to_vec())
    }

    pub fn terminate() -> Self {
        Self::new(FrameType::ControlTerminate, Vec::new())
    }

    /// Parse the object id out of a control frame's payload. Returns `None`
    /// for `Terminate` or non-control frame types.
    pub fn object_id(&self) -> Result<Option<[u8; OBJECT_ID_LEN]>, FrameError> {
        match self.frame_type {
            FrameType::ControlAccept | FrameType::ControlReject | FrameType::ControlAck => {
                if self.payload.len() != OBJECT_ID_LEN {
                    return Err(FrameError::MalformedControl(self.payload.len()));
                }
                let mut id = [0u8; OBJECT_ID_LEN];
                id.copy_from_slice(&self.payload);
                Ok(Some(id))
            }
            _ => Ok(None),
        }
    }
}

/// Length-prefixed frame codec used by every TCP connection in the protocol
/// engine. The UDP "application port" transport (spec §6) never frames
/// control messages over this codec at all; it only ever carries `Metadata`
/// frames directly, one per datagram.
#[derive(Default)]
pub struct FrameCodec;

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < 5 {
            return Ok(None);
        }
        let length = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if length > MAX_FRAME_SIZE {
            return Err(FrameError::TooLarge(length));
        }
        if src.len() < 4 + length {
            return Ok(None);
        }
        src.advance(4);
        let frame_type = FrameType::try_from(src[0])?;
        src.advance(1);
        let payload = src.split_to(length - 1).to_vec();
        Ok(Some(Frame { frame_type, payload }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let length = 1 + item.payload.len();
        if length > MAX_FRAME_SIZE {
            return Err(FrameError::TooLarge(length));
        }
        dst.put_u32(length as u32);
        dst.put_u8(item.frame_type as u8);
        dst.put_slice(&item.payload);
        Ok(())
    }
}

/// Lazily parse as many complete frames as are available in `buf`, without
/// requiring the whole lower-layer stream up front. Mirrors the original
/// `put_data` pattern: each call reports how many bytes remain unparsed
/// (always 0 here, since `FrameCodec` only ever consumes whole frames) and
/// how many frames came out of this call.
pub fn put_data(codec: &mut FrameCodec, buf: &mut BytesMut) -> Result<Vec<Frame>, FrameError> {
    let mut frames = Vec::new();
    while let Some(frame) = codec.decode(buf)? {
        frames.push(frame);
    }
    Ok(frames)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metadata_frame_round_trip() {
        let mut codec = FrameCodec;
        let frame = Frame::metadata(vec![1, 2, 3, 4]);
        let mut buf = BytesMut::new();
        codec.encode(frame.clone(), &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn control_frame_carries_object_id() {
        let id = [7u8; OBJECT_ID_LEN];
        let frame = Frame::accept(id);
        assert_eq!(frame.object_id().unwrap(), Some(id));
    }

    #[test]
    fn terminate_has_no_object_id() {
        assert_eq!(Frame::terminate().object_id().unwrap(), None);
    }

    #[test]
    fn malformed_control_payload_rejected() {
        let frame = Frame::new(FrameType::ControlAck, vec![1, 2, 3]);
        assert!(frame.object_id().is_err());
    }

    #[test]
    fn put_data_parses_multiple_frames_from_one_buffer() {
        let mut codec = FrameCodec;
        let mut buf = BytesMut::new();
        codec.encode(Frame::metadata(vec![1]), &mut buf).unwrap();
        codec.encode(Frame::ack([0u8; OBJECT_ID_LEN]), &mut buf).unwrap();
        let frames = put_data(&mut codec, &mut buf).unwrap();
        assert_eq!(frames.len(), 2);
    }

    #[test]
    fn partial_frame_reports_no_frames_yet() {
        let mut codec = FrameCodec;
        let mut buf = BytesMut::new();
        codec.encode(Frame::metadata(vec![1, 2, 3]), &mut buf).unwrap();
        buf.truncate(buf.len() - 1);
        let frames = put_data(&mut codec, &mut buf).unwrap();
        assert!(frames.is_empty());
        assert!(!buf.is_empty());
    }
}
