//! Wire framing
//!
//! `[u32 BE length][u8 wire version][CBOR PeerMessage]`. The length covers
//! the version byte and the payload.

use bytes::{Buf, BufMut, BytesMut};

use super::{PeerMessage, ProtocolError};

pub const WIRE_VERSION: u8 = 1;
/// 64 MiB.
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

const LEN_PREFIX: usize = 4;

pub fn encode_frame(message: &PeerMessage) -> Result<Vec<u8>, ProtocolError> {
    let mut payload = Vec::new();
    ciborium::into_writer(message, &mut payload)
        .map_err(|e| ProtocolError::SerializationError(e.to_string()))?;

    let body_len = payload.len() + 1;
    if body_len > MAX_FRAME_LEN {
        return Err(ProtocolError::FrameTooLarge {
            size: body_len,
            max: MAX_FRAME_LEN,
        });
    }

    let mut frame = Vec::with_capacity(LEN_PREFIX + body_len);
    frame.put_u32(body_len as u32);
    frame.put_u8(WIRE_VERSION);
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Decode exactly one complete frame.
pub fn decode_frame(frame: &[u8]) -> Result<PeerMessage, ProtocolError> {
    let mut decoder = FrameDecoder::new();
    decoder.extend(frame);
    match decoder.next_message()? {
        Some(message) if decoder.buffered() == 0 => Ok(message),
        Some(_) => Err(ProtocolError::SerializationError(
            "trailing bytes after frame".to_string(),
        )),
        None => Err(ProtocolError::Truncated),
    }
}

/// Reassembles frames from a byte stream.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: BytesMut,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Next complete message, or `None` until more bytes arrive.
    pub fn next_message(&mut self) -> Result<Option<PeerMessage>, ProtocolError> {
        if self.buf.len() < LEN_PREFIX {
            return Ok(None);
        }
        let body_len =
            u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]) as usize;
        if body_len > MAX_FRAME_LEN {
            return Err(ProtocolError::FrameTooLarge {
                size: body_len,
                max: MAX_FRAME_LEN,
            });
        }
        if body_len == 0 {
            return Err(ProtocolError::Truncated);
        }
        if self.buf.len() < LEN_PREFIX + body_len {
            return Ok(None);
        }

        self.buf.advance(LEN_PREFIX);
        let body = self.buf.split_to(body_len);
        if body[0] != WIRE_VERSION {
            return Err(ProtocolError::UnsupportedVersion(body[0]));
        }
        let message = ciborium::from_reader(&body[1..])
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))?;
        Ok(Some(message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::BlockId;
    use crate::protocol::RestorePurpose;

    #[test]
    fn test_stream_reassembly() {
        let first = PeerMessage::RestoreResponse {
            id: BlockId::new_random(),
            purpose: RestorePurpose::Verification,
            data: vec![7u8; 1000],
        };
        let second = PeerMessage::CatalogRequest;

        let mut stream = encode_frame(&first).unwrap();
        stream.extend(encode_frame(&second).unwrap());

        let mut decoder = FrameDecoder::new();
        let (head, tail) = stream.split_at(10);
        decoder.extend(head);
        assert!(decoder.next_message().unwrap().is_none());
        decoder.extend(tail);

        assert_eq!(decoder.next_message().unwrap(), Some(first));
        assert_eq!(decoder.next_message().unwrap(), Some(second));
        assert_eq!(decoder.next_message().unwrap(), None);
    }

    #[test]
    fn test_rejects_unknown_version() {
        let mut frame = encode_frame(&PeerMessage::CatalogRequest).unwrap();
        frame[4] = 9;
        assert!(matches!(
            decode_frame(&frame),
            Err(ProtocolError::UnsupportedVersion(9))
        ));
    }

    #[test]
    fn test_rejects_oversized_length() {
        let mut frame = Vec::new();
        frame.extend_from_slice(&((MAX_FRAME_LEN + 1) as u32).to_be_bytes());
        frame.push(WIRE_VERSION);
        assert!(matches!(
            decode_frame(&frame),
            Err(ProtocolError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn test_truncated_frame() {
        let frame = encode_frame(&PeerMessage::Delete {
            ids: vec![BlockId::new_random()],
        })
        .unwrap();
        assert!(matches!(
            decode_frame(&frame[..frame.len() - 1]),
            Err(ProtocolError::Truncated)
        ));
    }
}
