use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

use crate::codec::{decode_frame, encode_frame, Frame, FrameConfig};
use crate::error::FrameError;

/// `tokio_util` codec for the ipcdefer frame format.
///
/// Use with `Framed::new(stream, FrameCodec::default())` to get a
/// `Stream<Item = Result<Frame>>` + `Sink<Frame>` over any async byte stream.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_payload_size: usize,
}

impl FrameCodec {
    pub fn new(config: &FrameConfig) -> Self {
        Self {
            max_payload_size: config.max_payload_size,
        }
    }

    pub fn max_payload_size(&self) -> usize {
        self.max_payload_size
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(&FrameConfig::default())
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, FrameError> {
        decode_frame(src, self.max_payload_size)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, FrameError> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None if src.is_empty() => Ok(None),
            None => {
                tracing::debug!(buffered = src.len(), "stream ended mid-frame");
                Err(FrameError::Truncated)
            }
        }
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), FrameError> {
        if frame.payload.len() > self.max_payload_size {
            return Err(FrameError::PayloadTooLarge {
                size: frame.payload.len(),
                max: self.max_payload_size,
            });
        }
        encode_frame(frame.lane, &frame.payload, dst)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use futures_util::{SinkExt, StreamExt};
    use ipcdefer_transport::IpcStream;
    use tokio::io::AsyncWriteExt;
    use tokio_util::codec::Framed;

    use super::*;
    use crate::lane::{CONTROL, RPC};

    #[tokio::test]
    async fn frames_cross_a_stream_pair() {
        let (left, right) = IpcStream::pair().unwrap();
        let mut tx = Framed::new(left, FrameCodec::default());
        let mut rx = Framed::new(right, FrameCodec::default());

        tx.send(Frame::new(CONTROL, &b"\"ping\""[..])).await.unwrap();
        tx.send(Frame::new(RPC, &b"{\"connectionCount\":2}"[..]))
            .await
            .unwrap();

        let first = rx.next().await.unwrap().unwrap();
        assert_eq!(first.lane, CONTROL);
        assert_eq!(first.payload.as_ref(), b"\"ping\"");

        let second = rx.next().await.unwrap().unwrap();
        assert_eq!(second.lane, RPC);
    }

    #[tokio::test]
    async fn clean_close_ends_the_stream() {
        let (left, right) = IpcStream::pair().unwrap();
        let mut tx = Framed::new(left, FrameCodec::default());
        let mut rx = Framed::new(right, FrameCodec::default());

        tx.send(Frame::new(RPC, &b"{}"[..])).await.unwrap();
        drop(tx);

        assert!(rx.next().await.unwrap().is_ok());
        assert!(rx.next().await.is_none());
    }

    #[tokio::test]
    async fn truncated_frame_reports_connection_closed() {
        let (mut left, right) = IpcStream::pair().unwrap();
        let mut rx = Framed::new(right, FrameCodec::default());

        let mut wire = BytesMut::new();
        encode_frame(RPC, b"{\"request\":\"x\"}", &mut wire).unwrap();
        left.write_all(&wire[..wire.len() - 3]).await.unwrap();
        left.shutdown().await.unwrap();

        let result = rx.next().await.unwrap();
        assert!(matches!(result, Err(FrameError::Truncated)));
    }

    #[tokio::test]
    async fn encoder_refuses_oversized_payload() {
        let mut codec = FrameCodec::new(&FrameConfig {
            max_payload_size: 4,
        });
        let mut dst = BytesMut::new();
        let result = codec.encode(Frame::new(RPC, &b"too long"[..]), &mut dst);

        assert!(matches!(
            result,
            Err(FrameError::PayloadTooLarge { size: 8, max: 4 })
        ));
        assert!(dst.is_empty());
    }
}
