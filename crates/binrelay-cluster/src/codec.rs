//! Entity payload encoding
//!
//! The local cache stores plain JSON. Tree-service payloads are the same JSON
//! wrapped in gzip; relational rows store the JSON uncompressed.

use crate::error::{ClusterError, Result};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::{Read, Write};

pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(value)?)
}

pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(serde_json::from_slice(bytes)?)
}

pub fn compress(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

pub fn decompress(data: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(data);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|e| ClusterError::Serialization(format!("gzip payload: {}", e)))?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SourceInfo;

    #[test]
    fn test_compressed_entity() {
        let source = SourceInfo::new(9, "orders", "db1", 3306);
        let packed = compress(&encode(&source).unwrap()).unwrap();
        assert_eq!(&packed[..2], &[0x1f, 0x8b]);

        let unpacked: SourceInfo = decode(&decompress(&packed).unwrap()).unwrap();
        assert_eq!(unpacked, source);
    }

    #[test]
    fn test_corrupt_payload() {
        assert!(matches!(
            decompress(b"not gzip"),
            Err(ClusterError::Serialization(_))
        ));
        assert!(matches!(
            decode::<SourceInfo>(b"{"),
            Err(ClusterError::Serialization(_))
        ));
    }
}
