// Response-fragment header and size-prefixed framing.

use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};

use crate::error::{Result, ShardError};
use crate::proto::worker::ResponseData;

/// Version of the worker response protocol spoken by this czar.
pub const PROTOCOL_VERSION: i32 = 2;

/// Wire header announcing one response fragment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtoHeader {
    pub protocol: i32,
    /// Size of the fragment body in bytes
    pub size: i32,
    /// MD5 digest of the fragment body
    pub md5: [u8; 16],
}

impl ProtoHeader {
    pub fn new(protocol: i32, size: i32, md5: [u8; 16]) -> Self {
        Self { protocol, size, md5 }
    }

    /// Header describing `body`.
    pub fn for_body(body: &[u8]) -> Self {
        let mut hasher = Md5::new();
        hasher.update(body);
        Self::new(PROTOCOL_VERSION, body.len() as i32, hasher.finalize().into())
    }

    pub fn serialize(&self) -> Result<Vec<u8>> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ShardError::Serialization(e.to_string()))
    }

    pub fn parse(bytes: &[u8]) -> Result<ProtoHeader> {
        let (header, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ShardError::Protocol(format!("bad header: {}", e)))?;
        Ok(header)
    }

    /// True iff `body` hashes to this header's digest.
    pub fn verify_body(&self, body: &[u8]) -> bool {
        let mut hasher = Md5::new();
        hasher.update(body);
        let digest: [u8; 16] = hasher.finalize().into();
        digest == self.md5
    }

    pub fn md5_hex(&self) -> String {
        hex::encode(self.md5)
    }
}

/// Prefix a serialized header with its one-byte length.
pub fn wrap_header(header: &ProtoHeader) -> Result<Vec<u8>> {
    let bytes = header.serialize()?;
    if bytes.len() > u8::MAX as usize {
        return Err(ShardError::Protocol(format!("header too large: {} bytes", bytes.len())));
    }
    let mut framed = Vec::with_capacity(1 + bytes.len());
    framed.push(bytes.len() as u8);
    framed.extend_from_slice(&bytes);
    Ok(framed)
}

/// Assemble one complete wire fragment for `data`.
pub fn encode_fragment(data: &ResponseData) -> Result<Vec<u8>> {
    let body = data.serialize()?;
    let mut frame = wrap_header(&ProtoHeader::for_body(&body))?;
    frame.extend_from_slice(&body);
    Ok(frame)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::worker::{RowBundle, RowSchema};

    #[test]
    fn test_header_round_trip() {
        let header = ProtoHeader::new(PROTOCOL_VERSION, 23, [7u8; 16]);
        let parsed = ProtoHeader::parse(&header.serialize().unwrap()).unwrap();
        assert_eq!(header, parsed);
    }

    #[test]
    fn test_for_body_digest_matches() {
        let body = b"one small row bundle";
        let header = ProtoHeader::for_body(body);
        assert_eq!(header.size as usize, body.len());
        assert!(header.verify_body(body));
        assert!(!header.verify_body(b"tampered"));
    }

    #[test]
    fn test_wrap_header_prefix() {
        let header = ProtoHeader::for_body(b"abc");
        let framed = wrap_header(&header).unwrap();
        let announced = framed[0] as usize;
        assert_eq!(announced, framed.len() - 1);
        let parsed = ProtoHeader::parse(&framed[1..]).unwrap();
        assert_eq!(header, parsed);
    }

    #[test]
    fn test_encode_fragment_layout() {
        let data = ResponseData {
            session: 1,
            schema: Some(RowSchema::default()),
            rows: vec![RowBundle::of(vec![Some(b"x")])],
        };
        let frame = encode_fragment(&data).unwrap();
        let header_size = frame[0] as usize;
        let header = ProtoHeader::parse(&frame[1..1 + header_size]).unwrap();
        let body = &frame[1 + header_size..];
        assert_eq!(header.size as usize, body.len());
        assert!(header.verify_body(body));
        assert_eq!(ResponseData::parse(body).unwrap(), data);
    }
}
