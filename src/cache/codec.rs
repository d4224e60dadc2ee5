//! Pluggable payload codec for cache storage.
//!
//! Selected by configuration, independent of any specific compression
//! algorithm. Decode failures never fail a read; the manager falls back to
//! the raw stored bytes and logs a warning.

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::{self, Read, Write};

/// Encode/decode seam applied to payloads before L1/L2 storage
pub trait CacheCodec: Send + Sync {
    fn name(&self) -> &'static str;
    fn encode(&self, data: &[u8]) -> io::Result<Vec<u8>>;
    fn decode(&self, data: &[u8]) -> io::Result<Vec<u8>>;
}

/// Gzip codec, the default when compression is enabled
#[derive(Debug, Default)]
pub struct GzipCodec;

impl CacheCodec for GzipCodec {
    fn name(&self) -> &'static str {
        "gzip"
    }

    fn encode(&self, data: &[u8]) -> io::Result<Vec<u8>> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data)?;
        encoder.finish()
    }

    fn decode(&self, data: &[u8]) -> io::Result<Vec<u8>> {
        let mut decoder = GzDecoder::new(data);
        let mut out = Vec::new();
        decoder.read_to_end(&mut out)?;
        Ok(out)
    }
}

/// No-op codec used when compression is disabled
#[derive(Debug, Default)]
pub struct IdentityCodec;

impl CacheCodec for IdentityCodec {
    fn name(&self) -> &'static str {
        "identity"
    }

    fn encode(&self, data: &[u8]) -> io::Result<Vec<u8>> {
        Ok(data.to_vec())
    }

    fn decode(&self, data: &[u8]) -> io::Result<Vec<u8>> {
        Ok(data.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gzip_round_trip() {
        let codec = GzipCodec;
        let input = br#"{"id":"wf-1","nodes":[1,2,3,4,5,6,7,8,9,10]}"#.repeat(20);
        let encoded = codec.encode(&input).unwrap();
        assert!(encoded.len() < input.len());
        assert_eq!(codec.decode(&encoded).unwrap(), input);
    }

    #[test]
    fn gzip_decode_rejects_garbage() {
        let codec = GzipCodec;
        assert!(codec.decode(b"definitely not gzip").is_err());
    }
}
