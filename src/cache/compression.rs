//! zstd helpers and the envelope written to the durable store.

use crate::errors::{ResilienceError, ResilienceResult};

/// Prefix marking bytes written by [`StoredRecord::encode`].
pub const RECORD_MAGIC: &[u8; 4] = b"RSC\x01";

const FLAG_RAW: u8 = 0;
const FLAG_ZSTD: u8 = 1;

/// Compresses `data` with zstd at `level`.
pub fn compress(data: &[u8], level: i32) -> ResilienceResult<Vec<u8>> {
    zstd::encode_all(data, level).map_err(|e| ResilienceError::Compression {
        message: format!("zstd encode failed: {}", e),
    })
}

/// Reverses [`compress`].
pub fn decompress(data: &[u8]) -> ResilienceResult<Vec<u8>> {
    zstd::decode_all(data).map_err(|e| ResilienceError::Compression {
        message: format!("zstd decode failed: {}", e),
    })
}

/// A value as kept in the durable store: serialized bytes, zstd-compressed
/// when they were larger than the threshold.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRecord {
    /// Whether `payload` is zstd data
    pub compressed: bool,
    /// Serialized value, possibly compressed
    pub payload: Vec<u8>,
}

impl StoredRecord {
    /// Wraps serialized bytes, compressing when `raw` is longer than
    /// `threshold`.
    pub fn pack(raw: Vec<u8>, threshold: Option<usize>, level: i32) -> ResilienceResult<Self> {
        match threshold {
            Some(threshold) if raw.len() > threshold => Ok(Self {
                compressed: true,
                payload: compress(&raw, level)?,
            }),
            _ => Ok(Self {
                compressed: false,
                payload: raw,
            }),
        }
    }

    /// Returns the serialized bytes.
    pub fn unpack(self) -> ResilienceResult<Vec<u8>> {
        if self.compressed {
            decompress(&self.payload)
        } else {
            Ok(self.payload)
        }
    }

    /// Envelope bytes: magic, flag byte, payload.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(RECORD_MAGIC.len() + 1 + self.payload.len());
        out.extend_from_slice(RECORD_MAGIC);
        out.push(if self.compressed { FLAG_ZSTD } else { FLAG_RAW });
        out.extend_from_slice(&self.payload);
        out
    }

    /// Parses envelope bytes. Bytes without the magic prefix were written by
    /// something else and are taken as an uncompressed payload.
    pub fn decode(bytes: &[u8]) -> ResilienceResult<Self> {
        let Some(rest) = bytes.strip_prefix(RECORD_MAGIC.as_slice()) else {
            return Ok(Self {
                compressed: false,
                payload: bytes.to_vec(),
            });
        };
        match rest.split_first() {
            Some((&FLAG_RAW, payload)) => Ok(Self {
                compressed: false,
                payload: payload.to_vec(),
            }),
            Some((&FLAG_ZSTD, payload)) => Ok(Self {
                compressed: true,
                payload: payload.to_vec(),
            }),
            Some((flag, _)) => Err(ResilienceError::Serialization {
                message: format!("unknown record flag {}", flag),
            }),
            None => Err(ResilienceError::Serialization {
                message: "truncated record".to_string(),
            }),
        }
    }

    /// Bytes on the wire, envelope included.
    pub fn encoded_len(&self) -> usize {
        RECORD_MAGIC.len() + 1 + self.payload.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_small_payload_is_not_compressed() {
        let record = StoredRecord::pack(b"short".to_vec(), Some(1024), 3).unwrap();
        assert!(!record.compressed);
        assert_eq!(record.payload, b"short");
    }

    #[test]
    fn test_large_payload_is_compressed_and_restored() {
        let raw = "transcript ".repeat(500).into_bytes();
        let record = StoredRecord::pack(raw.clone(), Some(1024), 3).unwrap();
        assert!(record.compressed);
        assert!(record.payload.len() < raw.len());

        let decoded = StoredRecord::decode(&record.encode()).unwrap();
        assert_eq!(decoded, record);
        assert_eq!(decoded.unpack().unwrap(), raw);
    }

    #[test]
    fn test_no_threshold_never_compresses() {
        let raw = vec![b'a'; 10_000];
        assert!(!StoredRecord::pack(raw, None, 3).unwrap().compressed);
    }

    #[test]
    fn test_bytes_without_marker_are_raw() {
        let record = StoredRecord::decode(br#"{"plain":true}"#).unwrap();
        assert!(!record.compressed);
        assert_eq!(record.payload, br#"{"plain":true}"#);
    }

    #[test]
    fn test_unknown_flag_is_rejected() {
        let mut bytes = RECORD_MAGIC.to_vec();
        bytes.push(9);
        assert!(matches!(
            StoredRecord::decode(&bytes),
            Err(ResilienceError::Serialization { .. })
        ));
        assert!(StoredRecord::decode(RECORD_MAGIC).is_err());
    }

    #[test]
    fn test_corrupt_compressed_payload() {
        let record = StoredRecord {
            compressed: true,
            payload: vec![1, 2, 3],
        };
        assert!(matches!(
            record.unpack(),
            Err(ResilienceError::Compression { .. })
        ));
    }
}
