// nsq TCP protocol (V2) framing, message decoding and command encoding.
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::Serialize;
use std::fmt;

/// Protocol magic sent once by the client right after the TCP connect.
pub const MAGIC_V2: &[u8; 4] = b"  V2";

pub const FRAME_TYPE_RESPONSE: i32 = 0;
pub const FRAME_TYPE_ERROR: i32 = 1;
pub const FRAME_TYPE_MESSAGE: i32 = 2;

pub const OK_RESPONSE: &[u8] = b"OK";
pub const HEARTBEAT_RESPONSE: &[u8] = b"_heartbeat_";
pub const CLOSE_WAIT_RESPONSE: &[u8] = b"CLOSE_WAIT";

pub const MESSAGE_ID_LEN: usize = 16;
// timestamp (8) + attempts (2) + id (16)
const MESSAGE_HEADER_LEN: usize = 8 + 2 + MESSAGE_ID_LEN;
// size prefix that precedes every frame
const FRAME_SIZE_LEN: usize = 4;
// frame type that starts every frame body
const FRAME_TYPE_LEN: usize = 4;

/// Default cap for a single inbound frame.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

const MAX_NAME_LEN: usize = 64;
const EPHEMERAL_SUFFIX: &str = "#ephemeral";

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("frame of {length} bytes exceeds cap of {max} bytes")]
    FrameTooLarge { length: usize, max: usize },
    #[error("invalid frame size {0}")]
    InvalidFrameSize(u32),
    #[error("unknown frame type {0}")]
    UnknownFrameType(i32),
    #[error("message body too short ({0} bytes)")]
    ShortMessage(usize),
    #[error("message id must be 16 bytes, got {0}")]
    InvalidMessageId(usize),
    #[error("failed to serialize identify body")]
    Serialize(#[from] serde_json::Error),
}

/// Opaque 16 byte message id assigned by nsqd.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageId([u8; MESSAGE_ID_LEN]);

impl MessageId {
    pub fn from_slice(input: &[u8]) -> Result<Self> {
        let bytes: [u8; MESSAGE_ID_LEN] = input
            .try_into()
            .map_err(|_| Error::InvalidMessageId(input.len()))?;
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; MESSAGE_ID_LEN] {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // nsqd ids are printable hex, lossy only matters for hand-built ids.
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

impl fmt::Debug for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MessageId({self})")
    }
}

/// A message frame body as delivered by nsqd.
///
/// ```
/// use bytes::Bytes;
/// use nsq_wire::{Message, MessageId};
///
/// let message = Message {
///     id: MessageId::from_slice(b"0123456789abcdef").expect("id"),
///     attempts: 2,
///     timestamp: 1_700_000_000_000_000_000,
///     body: Bytes::from_static(b"hello"),
/// };
/// let decoded = Message::decode(message.encode()).expect("decode");
/// assert_eq!(decoded, message);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: MessageId,
    /// Delivery count maintained by nsqd, including requeues.
    pub attempts: u16,
    /// Nanoseconds since the unix epoch at publish time.
    pub timestamp: i64,
    pub body: Bytes,
}

impl Message {
    pub fn decode(mut input: Bytes) -> Result<Self> {
        if input.len() < MESSAGE_HEADER_LEN {
            return Err(Error::ShortMessage(input.len()));
        }
        let timestamp = input.get_i64();
        let attempts = input.get_u16();
        let id = MessageId::from_slice(&input.split_to(MESSAGE_ID_LEN))?;
        Ok(Self {
            id,
            attempts,
            timestamp,
            body: input,
        })
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(MESSAGE_HEADER_LEN + self.body.len());
        buf.put_i64(self.timestamp);
        buf.put_u16(self.attempts);
        buf.extend_from_slice(self.id.as_bytes());
        buf.extend_from_slice(&self.body);
        buf.freeze()
    }
}

/// Decoded server frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Response(Bytes),
    Error(Bytes),
    Message(Message),
}

impl Frame {
    pub fn decode(frame_type: i32, body: Bytes) -> Result<Self> {
        match frame_type {
            FRAME_TYPE_RESPONSE => Ok(Self::Response(body)),
            FRAME_TYPE_ERROR => Ok(Self::Error(body)),
            FRAME_TYPE_MESSAGE => Ok(Self::Message(Message::decode(body)?)),
            other => Err(Error::UnknownFrameType(other)),
        }
    }

    /// Pull one complete frame off the front of `buf`.
    ///
    /// Returns `Ok(None)` when more bytes are needed; the buffer is left
    /// untouched in that case.
    pub fn decode_from(buf: &mut BytesMut, max_frame_bytes: usize) -> Result<Option<Self>> {
        if buf.len() < FRAME_SIZE_LEN {
            return Ok(None);
        }
        let size = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let length = size as usize;
        if length < FRAME_TYPE_LEN {
            return Err(Error::InvalidFrameSize(size));
        }
        if length > max_frame_bytes {
            return Err(Error::FrameTooLarge {
                length,
                max: max_frame_bytes,
            });
        }
        if buf.len() < FRAME_SIZE_LEN + length {
            buf.reserve(FRAME_SIZE_LEN + length - buf.len());
            return Ok(None);
        }
        buf.advance(FRAME_SIZE_LEN);
        let mut data = buf.split_to(length).freeze();
        let frame_type = data.get_i32();
        Self::decode(frame_type, data).map(Some)
    }

    pub fn encode(&self) -> Bytes {
        let (frame_type, body) = match self {
            Self::Response(body) => (FRAME_TYPE_RESPONSE, body.clone()),
            Self::Error(body) => (FRAME_TYPE_ERROR, body.clone()),
            Self::Message(message) => (FRAME_TYPE_MESSAGE, message.encode()),
        };
        let mut buf = BytesMut::with_capacity(FRAME_SIZE_LEN + FRAME_TYPE_LEN + body.len());
        buf.put_u32((FRAME_TYPE_LEN + body.len()) as u32);
        buf.put_i32(frame_type);
        buf.extend_from_slice(&body);
        buf.freeze()
    }

    pub fn is_heartbeat(&self) -> bool {
        matches!(self, Self::Response(body) if body.as_ref() == HEARTBEAT_RESPONSE)
    }
}

/// Body of the IDENTIFY command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Identify {
    pub client_id: String,
    pub hostname: String,
    pub user_agent: String,
    /// Milliseconds between server heartbeats.
    pub heartbeat_interval: i64,
    pub feature_negotiation: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Identify(Identify),
    Sub { topic: String, channel: String },
    Rdy(u64),
    Fin(MessageId),
    Req { id: MessageId, delay_ms: u64 },
    Touch(MessageId),
    Nop,
    Cls,
}

impl Command {
    pub fn encode(&self, buf: &mut BytesMut) -> Result<()> {
        match self {
            Self::Identify(identify) => {
                let body = serde_json::to_vec(identify)?;
                buf.extend_from_slice(b"IDENTIFY\n");
                buf.put_u32(body.len() as u32);
                buf.extend_from_slice(&body);
            }
            Self::Sub { topic, channel } => {
                buf.extend_from_slice(format!("SUB {topic} {channel}\n").as_bytes());
            }
            Self::Rdy(count) => {
                buf.extend_from_slice(format!("RDY {count}\n").as_bytes());
            }
            Self::Fin(id) => write_id_command(buf, b"FIN ", id, None),
            Self::Req { id, delay_ms } => write_id_command(buf, b"REQ ", id, Some(*delay_ms)),
            Self::Touch(id) => write_id_command(buf, b"TOUCH ", id, None),
            Self::Nop => buf.extend_from_slice(b"NOP\n"),
            Self::Cls => buf.extend_from_slice(b"CLS\n"),
        }
        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Bytes> {
        let mut buf = BytesMut::new();
        self.encode(&mut buf)?;
        Ok(buf.freeze())
    }
}

fn write_id_command(buf: &mut BytesMut, verb: &[u8], id: &MessageId, suffix: Option<u64>) {
    buf.extend_from_slice(verb);
    buf.extend_from_slice(id.as_bytes());
    if let Some(value) = suffix {
        buf.extend_from_slice(format!(" {value}").as_bytes());
    }
    buf.put_u8(b'\n');
}

pub fn valid_topic_name(name: &str) -> bool {
    valid_name(name)
}

pub fn valid_channel_name(name: &str) -> bool {
    valid_name(name)
}

fn valid_name(name: &str) -> bool {
    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return false;
    }
    let base = name.strip_suffix(EPHEMERAL_SUFFIX).unwrap_or(name);
    !base.is_empty()
        && base
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-'))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_id() -> MessageId {
        MessageId::from_slice(b"0a1b2c3d4e5f6071").expect("id")
    }

    #[test]
    fn decode_from_waits_for_complete_frame() {
        let encoded = Frame::Response(Bytes::from_static(b"OK")).encode();
        let mut buf = BytesMut::from(&encoded[..3]);
        assert!(Frame::decode_from(&mut buf, DEFAULT_MAX_FRAME_BYTES)
            .expect("partial size")
            .is_none());
        buf.extend_from_slice(&encoded[3..encoded.len() - 1]);
        assert!(Frame::decode_from(&mut buf, DEFAULT_MAX_FRAME_BYTES)
            .expect("partial body")
            .is_none());
        buf.extend_from_slice(&encoded[encoded.len() - 1..]);
        let frame = Frame::decode_from(&mut buf, DEFAULT_MAX_FRAME_BYTES)
            .expect("decode")
            .expect("frame");
        assert_eq!(frame, Frame::Response(Bytes::from_static(b"OK")));
        assert!(buf.is_empty());
    }

    #[test]
    fn decode_from_handles_back_to_back_frames() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&Frame::Response(Bytes::from_static(HEARTBEAT_RESPONSE)).encode());
        buf.extend_from_slice(&Frame::Error(Bytes::from_static(b"E_INVALID")).encode());
        let first = Frame::decode_from(&mut buf, DEFAULT_MAX_FRAME_BYTES)
            .expect("decode")
            .expect("first");
        assert!(first.is_heartbeat());
        let second = Frame::decode_from(&mut buf, DEFAULT_MAX_FRAME_BYTES)
            .expect("decode")
            .expect("second");
        assert_eq!(second, Frame::Error(Bytes::from_static(b"E_INVALID")));
    }

    #[test]
    fn decode_from_rejects_oversized_frame() {
        let mut buf = BytesMut::new();
        buf.put_u32(1024);
        let err = Frame::decode_from(&mut buf, 512).expect_err("too large");
        assert!(matches!(
            err,
            Error::FrameTooLarge {
                length: 1024,
                max: 512
            }
        ));
    }

    #[test]
    fn decode_from_rejects_undersized_frame() {
        let mut buf = BytesMut::new();
        buf.put_u32(2);
        buf.put_u16(0);
        let err = Frame::decode_from(&mut buf, DEFAULT_MAX_FRAME_BYTES).expect_err("invalid");
        assert!(matches!(err, Error::InvalidFrameSize(2)));
    }

    #[test]
    fn decode_rejects_unknown_frame_type() {
        let err = Frame::decode(7, Bytes::new()).expect_err("unknown");
        assert!(matches!(err, Error::UnknownFrameType(7)));
    }

    #[test]
    fn message_frame_exposes_attempts_and_body() {
        let message = Message {
            id: test_id(),
            attempts: 3,
            timestamp: 42,
            body: Bytes::from_static(b"payload"),
        };
        let mut buf = BytesMut::from(&Frame::Message(message.clone()).encode()[..]);
        let frame = Frame::decode_from(&mut buf, DEFAULT_MAX_FRAME_BYTES)
            .expect("decode")
            .expect("frame");
        let Frame::Message(decoded) = frame else {
            panic!("expected message frame");
        };
        assert_eq!(decoded.attempts, 3);
        assert_eq!(decoded.timestamp, 42);
        assert_eq!(decoded.body, Bytes::from_static(b"payload"));
        assert_eq!(decoded.id, test_id());
    }

    #[test]
    fn short_message_is_rejected() {
        let err = Message::decode(Bytes::from_static(b"tiny")).expect_err("short");
        assert!(matches!(err, Error::ShortMessage(4)));
    }

    #[test]
    fn identify_is_length_prefixed_json() {
        let command = Command::Identify(Identify {
            client_id: "orders:billing".to_string(),
            hostname: "worker-1".to_string(),
            user_agent: "nsq-reader/0.1.0".to_string(),
            heartbeat_interval: 30_000,
            feature_negotiation: false,
        });
        let mut encoded = command.to_bytes().expect("encode");
        assert!(encoded.starts_with(b"IDENTIFY\n"));
        encoded.advance(b"IDENTIFY\n".len());
        let len = encoded.get_u32() as usize;
        assert_eq!(len, encoded.len());
        let body: serde_json::Value = serde_json::from_slice(&encoded).expect("json");
        assert_eq!(body["client_id"], "orders:billing");
        assert_eq!(body["heartbeat_interval"], 30_000);
        assert_eq!(body["feature_negotiation"], false);
    }

    #[test]
    fn line_commands_encode_as_text() {
        let sub = Command::Sub {
            topic: "orders".to_string(),
            channel: "billing".to_string(),
        };
        assert_eq!(
            sub.to_bytes().expect("sub"),
            Bytes::from_static(b"SUB orders billing\n")
        );
        assert_eq!(
            Command::Rdy(25).to_bytes().expect("rdy"),
            Bytes::from_static(b"RDY 25\n")
        );
        assert_eq!(
            Command::Fin(test_id()).to_bytes().expect("fin"),
            Bytes::from_static(b"FIN 0a1b2c3d4e5f6071\n")
        );
        assert_eq!(
            Command::Req {
                id: test_id(),
                delay_ms: 90_000
            }
            .to_bytes()
            .expect("req"),
            Bytes::from_static(b"REQ 0a1b2c3d4e5f6071 90000\n")
        );
        assert_eq!(
            Command::Touch(test_id()).to_bytes().expect("touch"),
            Bytes::from_static(b"TOUCH 0a1b2c3d4e5f6071\n")
        );
        assert_eq!(Command::Nop.to_bytes().expect("nop"), Bytes::from_static(b"NOP\n"));
        assert_eq!(Command::Cls.to_bytes().expect("cls"), Bytes::from_static(b"CLS\n"));
    }

    #[test]
    fn message_id_requires_sixteen_bytes() {
        let err = MessageId::from_slice(b"short").expect_err("len");
        assert!(matches!(err, Error::InvalidMessageId(5)));
        assert_eq!(test_id().to_string(), "0a1b2c3d4e5f6071");
    }

    #[test]
    fn names_follow_nsqd_rules() {
        assert!(valid_topic_name("orders"));
        assert!(valid_topic_name("orders.v2_test-1"));
        assert!(valid_channel_name("billing#ephemeral"));
        assert!(!valid_topic_name(""));
        assert!(!valid_topic_name("#ephemeral"));
        assert!(!valid_topic_name("has space"));
        assert!(!valid_channel_name(&"x".repeat(65)));
    }
}
