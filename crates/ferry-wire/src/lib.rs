// Framed encoding for messages relayed through durable queues.
//
// Every queue entry is one frame. The frame flags say whether the payload is
// the message itself or a reference to a blob holding the encoded message
// (used when the body is too large to travel inline).
use bytes::{Buf, Bytes, BytesMut};
use ferry_common::ids::MessageId;
use serde::{Deserialize, Serialize};

pub const MAGIC: u32 = 0x46525931;
pub const VERSION: u16 = 1;
pub const FLAG_MESSAGE: u16 = 0x0000;
pub const FLAG_BLOB_REF: u16 = 0x0001;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid magic number")]
    InvalidMagic,
    #[error("unsupported version {0}")]
    UnsupportedVersion(u16),
    #[error("unexpected frame flags {0:#06x}")]
    UnexpectedFlags(u16),
    #[error("frame too large")]
    FrameTooLarge,
    #[error("incomplete frame")]
    Incomplete,
    #[error("failed to serialize message")]
    Serialize(serde_json::Error),
    #[error("failed to deserialize message")]
    Deserialize(serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub magic: u32,
    pub version: u16,
    pub flags: u16,
    pub length: u32,
}

impl FrameHeader {
    pub const LEN: usize = 12;

    pub fn new(flags: u16, length: u32) -> Self {
        Self {
            magic: MAGIC,
            version: VERSION,
            flags,
            length,
        }
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.extend_from_slice(&self.magic.to_be_bytes());
        buf.extend_from_slice(&self.version.to_be_bytes());
        buf.extend_from_slice(&self.flags.to_be_bytes());
        buf.extend_from_slice(&self.length.to_be_bytes());
    }

    pub fn decode(mut buf: Bytes) -> Result<Self> {
        // Validate header before we trust the length.
        if buf.remaining() < Self::LEN {
            return Err(Error::Incomplete);
        }
        let magic = buf.get_u32();
        if magic != MAGIC {
            return Err(Error::InvalidMagic);
        }
        let version = buf.get_u16();
        if version != VERSION {
            return Err(Error::UnsupportedVersion(version));
        }
        let flags = buf.get_u16();
        let length = buf.get_u32();
        Ok(Self {
            magic,
            version,
            flags,
            length,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: FrameHeader,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(flags: u16, payload: Bytes) -> Result<Self> {
        if payload.len() > u32::MAX as usize {
            return Err(Error::FrameTooLarge);
        }
        Ok(Self {
            header: FrameHeader::new(flags, payload.len() as u32),
            payload,
        })
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(FrameHeader::LEN + self.payload.len());
        self.header.encode(&mut buf);
        buf.extend_from_slice(&self.payload);
        buf.freeze()
    }

    pub fn decode(input: Bytes) -> Result<Self> {
        if input.len() < FrameHeader::LEN {
            return Err(Error::Incomplete);
        }
        let header = FrameHeader::decode(input.slice(0..FrameHeader::LEN))?;
        let length = header.length as usize;
        if input.len() < FrameHeader::LEN + length {
            return Err(Error::Incomplete);
        }
        let payload = input.slice(FrameHeader::LEN..FrameHeader::LEN + length);
        Ok(Self { header, payload })
    }
}

/// Request or response exchanged between clients and the application.
///
/// ```
/// use bytes::Bytes;
/// use ferry_wire::Message;
///
/// let message = Message::request("client-1", "Echo", Bytes::from_static(b"hello"));
/// let frame = message.encode().expect("encode");
/// let decoded = Message::decode(frame).expect("decode");
/// assert_eq!(message, decoded);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub message_id: MessageId,
    pub client_id: String,
    pub action: String,
    // Opaque caller data echoed back on the response.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation: Option<String>,
    // Set only for durable clients.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<u64>,
    // For responses: the request this answers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relates_to: Option<MessageId>,
    #[serde(with = "base64_bytes")]
    pub body: Bytes,
}

impl Message {
    pub fn request(client_id: impl Into<String>, action: impl Into<String>, body: Bytes) -> Self {
        Self {
            message_id: MessageId::new(),
            client_id: client_id.into(),
            action: action.into(),
            correlation: None,
            batch_id: None,
            relates_to: None,
            body,
        }
    }

    /// Builds a response that answers `self`.
    pub fn reply(&self, body: Bytes) -> Self {
        Self {
            message_id: MessageId::new(),
            client_id: self.client_id.clone(),
            action: self.action.clone(),
            correlation: self.correlation.clone(),
            batch_id: self.batch_id,
            relates_to: Some(self.message_id),
            body,
        }
    }

    /// Copy whose body no longer shares a buffer with the original.
    pub fn deep_copy(&self) -> Self {
        Self {
            body: Bytes::copy_from_slice(&self.body),
            ..self.clone()
        }
    }

    pub fn encode(&self) -> Result<Frame> {
        let payload = serde_json::to_vec(self).map_err(Error::Serialize)?;
        Frame::new(FLAG_MESSAGE, Bytes::from(payload))
    }

    pub fn decode(frame: Frame) -> Result<Self> {
        if frame.header.flags != FLAG_MESSAGE {
            return Err(Error::UnexpectedFlags(frame.header.flags));
        }
        serde_json::from_slice(&frame.payload).map_err(Error::Deserialize)
    }
}

/// Pointer to a blob that holds an encoded message frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobRef {
    pub container: String,
    pub blob: String,
    pub length: u64,
}

impl BlobRef {
    pub fn encode(&self) -> Result<Frame> {
        let payload = serde_json::to_vec(self).map_err(Error::Serialize)?;
        Frame::new(FLAG_BLOB_REF, Bytes::from(payload))
    }
}

/// What a queue entry carries once its frame header is read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Envelope {
    Inline(Message),
    Blob(BlobRef),
}

impl Envelope {
    pub fn decode(input: Bytes) -> Result<Self> {
        let frame = Frame::decode(input)?;
        match frame.header.flags {
            FLAG_MESSAGE => Message::decode(frame).map(Envelope::Inline),
            FLAG_BLOB_REF => serde_json::from_slice(&frame.payload)
                .map(Envelope::Blob)
                .map_err(Error::Deserialize),
            other => Err(Error::UnexpectedFlags(other)),
        }
    }
}

mod base64_bytes {
    use base64::Engine;
    use bytes::Bytes;
    use serde::Deserialize;
    use serde::de::Error;

    pub fn serialize<S>(value: &Bytes, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let encoded = base64::engine::general_purpose::STANDARD.encode(value);
        serializer.serialize_str(&encoded)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> std::result::Result<Bytes, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(encoded.as_bytes())
            .map_err(D::Error::custom)?;
        Ok(Bytes::from(decoded))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_round_trip() {
        let frame = Frame::new(0x1, Bytes::from_static(b"hello")).expect("frame");
        let decoded = Frame::decode(frame.encode()).expect("decode");
        assert_eq!(decoded.payload, Bytes::from_static(b"hello"));
        assert_eq!(decoded.header.flags, 0x1);
    }

    #[test]
    fn decode_rejects_invalid_magic() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&0xDEADBEEFu32.to_be_bytes());
        buf.extend_from_slice(&VERSION.to_be_bytes());
        buf.extend_from_slice(&0u16.to_be_bytes());
        buf.extend_from_slice(&0u32.to_be_bytes());
        let err = FrameHeader::decode(buf.freeze()).expect_err("invalid magic");
        assert!(matches!(err, Error::InvalidMagic));
    }

    #[test]
    fn decode_rejects_unsupported_version() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&MAGIC.to_be_bytes());
        buf.extend_from_slice(&0xFFFFu16.to_be_bytes());
        buf.extend_from_slice(&0u16.to_be_bytes());
        buf.extend_from_slice(&0u32.to_be_bytes());
        let err = FrameHeader::decode(buf.freeze()).expect_err("unsupported version");
        assert!(matches!(err, Error::UnsupportedVersion(0xFFFF)));
    }

    #[test]
    fn decode_rejects_incomplete_payload() {
        let header = FrameHeader::new(0, 5);
        let mut buf = BytesMut::new();
        header.encode(&mut buf);
        buf.extend_from_slice(b"hi");
        let err = Frame::decode(buf.freeze()).expect_err("incomplete payload");
        assert!(matches!(err, Error::Incomplete));
    }

    #[test]
    fn reply_links_request_and_keeps_correlation() {
        let mut request = Message::request("c1", "Square", Bytes::from_static(b"3"));
        request.correlation = Some("row-7".into());
        request.batch_id = Some(4);
        let response = request.reply(Bytes::from_static(b"9"));
        assert_eq!(response.relates_to, Some(request.message_id));
        assert_ne!(response.message_id, request.message_id);
        assert_eq!(response.correlation.as_deref(), Some("row-7"));
        assert_eq!(response.client_id, "c1");
    }

    #[test]
    fn deep_copy_detaches_body_buffer() {
        let shared = Bytes::from(vec![1u8, 2, 3]);
        let message = Message::request("c1", "a", shared.slice(0..2));
        let copy = message.deep_copy();
        assert_eq!(copy, message);
        assert_ne!(copy.body.as_ptr(), message.body.as_ptr());
    }

    #[test]
    fn message_decode_rejects_blob_flag() {
        let frame = Frame::new(FLAG_BLOB_REF, Bytes::from_static(b"{}")).expect("frame");
        let err = Message::decode(frame).expect_err("flags");
        assert!(matches!(err, Error::UnexpectedFlags(FLAG_BLOB_REF)));
    }

    #[test]
    fn envelope_distinguishes_inline_and_blob() {
        let message = Message::request("c1", "a", Bytes::from_static(b"x"));
        let inline = Envelope::decode(message.encode().expect("encode").encode()).expect("decode");
        assert_eq!(inline, Envelope::Inline(message));

        let blob = BlobRef {
            container: "blobs".into(),
            blob: "b-1".into(),
            length: 99,
        };
        let decoded = Envelope::decode(blob.encode().expect("encode").encode()).expect("decode");
        assert_eq!(decoded, Envelope::Blob(blob));
    }

    #[test]
    fn malformed_json_is_a_deserialize_error() {
        let frame = Frame::new(FLAG_MESSAGE, Bytes::from_static(b"{not json")).expect("frame");
        let err = Envelope::decode(frame.encode()).expect_err("bad json");
        assert!(matches!(err, Error::Deserialize(_)));
    }
}
