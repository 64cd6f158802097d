// tokio-util codec over the nsq-wire framing.
use bytes::BytesMut;
use nsq_wire::{Command, DEFAULT_MAX_FRAME_BYTES, Frame};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::ConnectionError;

#[derive(Debug, Clone, Copy)]
pub struct NsqCodec {
    max_frame_bytes: usize,
}

impl NsqCodec {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self { max_frame_bytes }
    }
}

impl Default for NsqCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_BYTES)
    }
}

impl Decoder for NsqCodec {
    type Item = Frame;
    type Error = ConnectionError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, ConnectionError> {
        Ok(Frame::decode_from(src, self.max_frame_bytes)?)
    }
}

impl Encoder<Command> for NsqCodec {
    type Error = ConnectionError;

    fn encode(&mut self, item: Command, dst: &mut BytesMut) -> Result<(), ConnectionError> {
        Ok(item.encode(dst)?)
    }
}
