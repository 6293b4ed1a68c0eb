use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::trace;

use crate::command::Command;
use crate::frame::{self, Frame};
use crate::Error;

const DEFAULT_MAX_FRAME_SIZE: usize = 512 * 1024 * 1024;

/// Streams RESP frames in and out of a byte buffer.
///
/// Decoding never consumes a partial frame: when the buffer ends in the middle of one, `decode`
/// returns `Ok(None)` and is retried once more bytes arrive. Malformed input is a protocol error
/// after which the stream's framing is unknown, so the caller is expected to drop the connection.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_frame_size: usize,
}

impl FrameCodec {
    pub fn new(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_SIZE)
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.is_empty() {
            return Ok(None);
        }

        let (frame, consumed) = match Frame::decode(&src[..]) {
            Ok(decoded) => decoded,
            Err(frame::Error::Incomplete) => {
                // A frame that is still incomplete past the limit can never be accepted.
                if src.len() > self.max_frame_size {
                    return Err(Error::Protocol(format!(
                        "frame exceeds the maximum size of {} bytes",
                        self.max_frame_size
                    )));
                }
                return Ok(None);
            }
            Err(err) => return Err(err.into()),
        };

        trace!(consumed, "decoded frame: {}", frame);

        // Remove the parsed frame from the buffer.
        src.advance(consumed);

        Ok(Some(frame))
    }
}

impl Encoder<Command> for FrameCodec {
    type Error = Error;

    fn encode(&mut self, cmd: Command, dst: &mut BytesMut) -> Result<(), Self::Error> {
        cmd.write_to(dst);
        Ok(())
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = Error;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        frame.write_to(dst);
        Ok(())
    }
}
