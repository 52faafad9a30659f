//! The durable encoding of one [Generation].
//!
//! A record is `[header length: u32 BE][header: JSON][payload]`, where the
//! payload is the zstd-compressed serialized tree and the header describes it:
//! format version, sequence, creation time, payload length and the blake3
//! digest of the payload.
use bytes::{BufMut, Bytes, BytesMut};
use data_encoding::HEXLOWER;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::errors::CacheError;
use crate::nodes::Generation;

pub const FORMAT_VERSION: u32 = 1;

const ZSTD_LEVEL: i32 = 3;

#[derive(Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordHeader {
    pub format_version: u32,
    pub sequence: u64,
    pub created_at: u64,
    pub payload_len: u64,
    /// blake3 digest of the payload, lowercase hex.
    pub payload_digest: String,
}

pub fn encode(generation: &Generation) -> Result<Bytes, CacheError> {
    let tree = generation
        .encode_tree()
        .map_err(|e| CacheError::InvalidRequest(format!("unable to serialize tree: {}", e)))?;
    let payload = zstd::stream::encode_all(tree.as_slice(), ZSTD_LEVEL)?;

    let header = RecordHeader {
        format_version: FORMAT_VERSION,
        sequence: generation.sequence(),
        created_at: generation.created_at(),
        payload_len: payload.len() as u64,
        payload_digest: HEXLOWER.encode(blake3::hash(&payload).as_bytes()),
    };
    let header = serde_json::to_vec(&header)
        .map_err(|e| CacheError::InvalidRequest(format!("unable to serialize header: {}", e)))?;

    let mut buf = BytesMut::with_capacity(4 + header.len() + payload.len());
    buf.put_u32(header.len() as u32);
    buf.put_slice(&header);
    buf.put_slice(&payload);
    Ok(buf.freeze())
}

/// Parses only the header of a record.
pub fn decode_header(data: &[u8]) -> Result<(RecordHeader, &[u8]), CacheError> {
    if data.len() < 4 {
        return Err(CacheError::Corruption("record truncated".into()));
    }
    let (len, rest) = data.split_at(4);
    let len = u32::from_be_bytes([len[0], len[1], len[2], len[3]]) as usize;
    if rest.len() < len {
        return Err(CacheError::Corruption("record header truncated".into()));
    }
    let (header, payload) = rest.split_at(len);

    let header: RecordHeader = serde_json::from_slice(header)
        .map_err(|e| CacheError::Corruption(format!("invalid record header: {}", e)))?;
    Ok((header, payload))
}

/// Decodes and verifies a record stored under `sequence`.
pub fn decode(sequence: u64, data: &[u8]) -> Result<Generation, CacheError> {
    let (header, payload) = decode_header(data)?;

    if header.format_version != FORMAT_VERSION {
        return Err(CacheError::UnsupportedVersion(header.format_version));
    }
    if header.sequence != sequence {
        return Err(CacheError::Corruption(format!(
            "record stored as {} claims sequence {}",
            sequence, header.sequence
        )));
    }
    if header.payload_len != payload.len() as u64 {
        return Err(CacheError::Corruption(format!(
            "payload has {} bytes, header says {}",
            payload.len(),
            header.payload_len
        )));
    }
    let digest = HEXLOWER.encode(blake3::hash(payload).as_bytes());
    if digest != header.payload_digest {
        warn!(expected = %header.payload_digest, actual = %digest, "payload digest mismatch");
        return Err(CacheError::Corruption("payload digest mismatch".into()));
    }

    let tree = zstd::stream::decode_all(payload)
        .map_err(|e| CacheError::Corruption(format!("unable to decompress payload: {}", e)))?;
    Generation::decode_tree(header.sequence, header.created_at, &tree)
        .map_err(|e| CacheError::Corruption(format!("invalid tree: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::{decode, decode_header, encode, FORMAT_VERSION};
    use crate::errors::CacheError;
    use crate::fixtures;

    #[test]
    fn header_describes_record() {
        let generation = fixtures::sample_generation(7);
        let data = encode(&generation).unwrap();

        let (header, payload) = decode_header(&data).unwrap();
        assert_eq!(FORMAT_VERSION, header.format_version);
        assert_eq!(7, header.sequence);
        assert_eq!(generation.created_at(), header.created_at);
        assert_eq!(payload.len() as u64, header.payload_len);

        assert_eq!(generation, decode(7, &data).unwrap());
    }

    #[test]
    fn flipped_payload_byte() {
        let data = encode(&fixtures::sample_generation(1)).unwrap();
        let mut data = data.to_vec();
        let last = data.len() - 1;
        data[last] ^= 0xff;

        assert!(matches!(decode(1, &data), Err(CacheError::Corruption(_))));
    }

    #[test]
    fn truncated() {
        let data = encode(&fixtures::sample_generation(1)).unwrap();
        for len in [0, 3, 10, data.len() - 1] {
            assert!(
                matches!(decode(1, &data[..len]), Err(CacheError::Corruption(_))),
                "len {len}"
            );
        }
    }

    #[test]
    fn other_format_version() {
        let data = crate::cache::tests::with_format_version(
            &encode(&fixtures::sample_generation(1)).unwrap(),
            FORMAT_VERSION + 1,
        );
        assert!(matches!(
            decode(1, &data),
            Err(CacheError::UnsupportedVersion(v)) if v == FORMAT_VERSION + 1
        ));
    }

    #[test]
    fn stored_under_wrong_sequence() {
        let data = encode(&fixtures::sample_generation(2)).unwrap();
        assert!(matches!(decode(3, &data), Err(CacheError::Corruption(_))));
    }
}
