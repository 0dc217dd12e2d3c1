use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{FrameError, Result};

/// Frame header: magic (2) + length (4) + lane (2) = 8 bytes.
pub const HEADER_SIZE: usize = 8;

/// Magic bytes: "DV" (0x44 0x56).
pub const MAGIC: [u8; 2] = [0x44, 0x56];

/// Default maximum payload size: 16 MiB.
pub const DEFAULT_MAX_PAYLOAD: usize = 16 * 1024 * 1024;

/// One framed message, tagged with the lane it travels on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub lane: u16,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(lane: u16, payload: impl Into<Bytes>) -> Self {
        Self {
            lane,
            payload: payload.into(),
        }
    }

    /// Header plus payload, in bytes.
    pub fn wire_size(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }
}

/// Append one frame to `dst`.
///
/// ```text
/// ┌────────────┬──────────────┬────────────┬──────────────────┐
/// │ Magic (2B) │ Length (4B)  │ Lane (2B)  │ Payload          │
/// │ 0x44 0x56  │ little endian│ little end.│ (Length bytes)   │
/// └────────────┴──────────────┴────────────┴──────────────────┘
/// ```
pub fn encode_frame(lane: u16, payload: &[u8], dst: &mut BytesMut) -> Result<()> {
    let len = u32::try_from(payload.len()).map_err(|_| FrameError::PayloadTooLarge {
        size: payload.len(),
        max: u32::MAX as usize,
    })?;
    dst.reserve(HEADER_SIZE + payload.len());
    dst.put_slice(&MAGIC);
    dst.put_u32_le(len);
    dst.put_u16_le(lane);
    dst.put_slice(payload);
    Ok(())
}

/// Take one frame off the front of `src`.
///
/// `Ok(None)` means more bytes are needed; nothing is consumed in that case.
pub fn decode_frame(src: &mut BytesMut, max_payload: usize) -> Result<Option<Frame>> {
    if src.len() < HEADER_SIZE {
        return Ok(None);
    }
    if src[0..2] != MAGIC {
        return Err(FrameError::InvalidMagic);
    }

    let payload_len = u32::from_le_bytes([src[2], src[3], src[4], src[5]]) as usize;
    let lane = u16::from_le_bytes([src[6], src[7]]);

    if payload_len > max_payload {
        return Err(FrameError::PayloadTooLarge {
            size: payload_len,
            max: max_payload,
        });
    }
    if src.len() < HEADER_SIZE + payload_len {
        return Ok(None);
    }

    src.advance(HEADER_SIZE);
    let payload = src.split_to(payload_len).freeze();
    Ok(Some(Frame { lane, payload }))
}

/// Frame layer limits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameConfig {
    /// Largest payload accepted or produced. Default: 16 MiB.
    pub max_payload_size: usize,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            max_payload_size: DEFAULT_MAX_PAYLOAD,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lane::{CONTROL, RPC};

    #[test]
    fn encoded_frame_decodes_back() {
        let mut buf = BytesMut::new();
        encode_frame(RPC, br#"{"request":"x"}"#, &mut buf).unwrap();
        assert_eq!(buf.len(), HEADER_SIZE + 15);
        assert_eq!(&buf[0..2], b"DV");

        let frame = decode_frame(&mut buf, DEFAULT_MAX_PAYLOAD).unwrap().unwrap();
        assert_eq!(frame.lane, RPC);
        assert_eq!(frame.payload.as_ref(), br#"{"request":"x"}"#);
        assert!(buf.is_empty());
    }

    #[test]
    fn partial_header_waits_for_more() {
        let mut buf = BytesMut::from(&[0x44, 0x56, 0x00][..]);
        assert!(decode_frame(&mut buf, DEFAULT_MAX_PAYLOAD).unwrap().is_none());
        assert_eq!(buf.len(), 3, "nothing is consumed while incomplete");
    }

    #[test]
    fn partial_payload_waits_for_more() {
        let mut buf = BytesMut::new();
        encode_frame(CONTROL, b"\"ping\"", &mut buf).unwrap();
        buf.truncate(HEADER_SIZE + 2);

        assert!(decode_frame(&mut buf, DEFAULT_MAX_PAYLOAD).unwrap().is_none());
    }

    #[test]
    fn bad_magic_is_rejected() {
        let mut buf = BytesMut::from(&[0x49, 0x50, 0, 0, 0, 0, 0, 0][..]);
        let result = decode_frame(&mut buf, DEFAULT_MAX_PAYLOAD);
        assert!(matches!(result, Err(FrameError::InvalidMagic)));
    }

    #[test]
    fn oversized_length_is_rejected_before_buffering() {
        let mut buf = BytesMut::new();
        buf.put_slice(&MAGIC);
        buf.put_u32_le(4096);
        buf.put_u16_le(RPC);

        let result = decode_frame(&mut buf, 1024);
        assert!(matches!(
            result,
            Err(FrameError::PayloadTooLarge {
                size: 4096,
                max: 1024
            })
        ));
    }

    #[test]
    fn back_to_back_frames_keep_their_lanes() {
        let mut buf = BytesMut::new();
        encode_frame(CONTROL, b"\"ping\"", &mut buf).unwrap();
        encode_frame(RPC, b"{}", &mut buf).unwrap();

        let first = decode_frame(&mut buf, DEFAULT_MAX_PAYLOAD).unwrap().unwrap();
        let second = decode_frame(&mut buf, DEFAULT_MAX_PAYLOAD).unwrap().unwrap();
        assert_eq!(first, Frame::new(CONTROL, &b"\"ping\""[..]));
        assert_eq!(second, Frame::new(RPC, &b"{}"[..]));
        assert_eq!(second.wire_size(), HEADER_SIZE + 2);
    }
}
