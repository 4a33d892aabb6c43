//! Blob codec and packfile builder.
//!
//! The codec turns plaintext blobs into their stored form (compress, then
//! encrypt) and back. The builder accumulates encoded blobs into one
//! packfile payload, tracking each blob's offset for the state that gets
//! published alongside the sealed packfile.

use std::io::Read;

use serde::{Deserialize, Serialize};

use coffre_storage::Mac;

use crate::config::{CompressionAlgorithm, CompressionConfig};
use crate::encryption::{self, EncryptionAlgorithm, EncryptionKey};
use crate::error::{RepositoryError, RepositoryResult};
use crate::state::{ResourceType, StateEntry};

/// Compress-then-encrypt pipeline shared by every stored blob.
#[derive(Clone)]
pub struct BlobCodec {
    /// Compression step, if configured.
    pub compression: Option<CompressionConfig>,
    /// Encryption step, if configured.
    pub encryption: Option<(EncryptionAlgorithm, EncryptionKey)>,
}

impl BlobCodec {
    /// A codec that stores blobs verbatim.
    pub fn plaintext() -> Self {
        BlobCodec {
            compression: None,
            encryption: None,
        }
    }

    /// Encodes a plaintext blob into its stored form.
    pub fn encode(&self, data: &[u8]) -> RepositoryResult<Vec<u8>> {
        let compressed = match &self.compression {
            Some(config) => match config.algorithm {
                CompressionAlgorithm::Zlib => {
                    use flate2::write::ZlibEncoder;
                    use flate2::Compression;
                    use std::io::Write;
                    let mut encoder =
                        ZlibEncoder::new(Vec::new(), Compression::new(config.level.min(9)));
                    encoder.write_all(data)?;
                    encoder.finish()?
                }
            },
            None => data.to_vec(),
        };
        match &self.encryption {
            Some((algo, key)) => encryption::encrypt(&compressed, key, *algo),
            None => Ok(compressed),
        }
    }

    /// Decodes a stored blob back into plaintext.
    pub fn decode(&self, data: &[u8]) -> RepositoryResult<Vec<u8>> {
        let compressed = match &self.encryption {
            Some((algo, key)) => encryption::decrypt(data, key, *algo)?,
            None => data.to_vec(),
        };
        match &self.compression {
            Some(config) => match config.algorithm {
                CompressionAlgorithm::Zlib => {
                    use flate2::read::ZlibDecoder;
                    let mut out = Vec::new();
                    ZlibDecoder::new(&compressed[..])
                        .read_to_end(&mut out)
                        .map_err(|e| {
                            RepositoryError::Corrupt(format!("zlib stream: {e}"))
                        })?;
                    Ok(out)
                }
            },
            None => Ok(compressed),
        }
    }
}

/// Summary of a sealed packfile, serialized nowhere but useful to callers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SealStats {
    /// Number of blobs packed.
    pub blobs: usize,
    /// Total payload bytes.
    pub bytes: u64,
}

/// Accumulates encoded blobs into one packfile payload.
pub struct PackfileBuilder {
    payload: Vec<u8>,
    pending: Vec<(ResourceType, Mac, u64, u32)>,
    max_size: u64,
}

impl PackfileBuilder {
    /// An empty builder sealing at `max_size` payload bytes.
    pub fn new(max_size: u64) -> Self {
        PackfileBuilder {
            payload: Vec::new(),
            pending: Vec::new(),
            max_size,
        }
    }

    /// Appends an already-encoded blob, recording its offset.
    pub fn add(&mut self, resource: ResourceType, mac: Mac, encoded: &[u8]) {
        let offset = self.payload.len() as u64;
        self.payload.extend_from_slice(encoded);
        self.pending
            .push((resource, mac, offset, encoded.len() as u32));
    }

    /// Whether a blob is already pending in this builder.
    pub fn contains(&self, resource: ResourceType, mac: Mac) -> bool {
        self.pending
            .iter()
            .any(|(r, m, _, _)| *r == resource && *m == mac)
    }

    /// Whether the payload reached the configured seal size.
    pub fn is_full(&self) -> bool {
        self.payload.len() as u64 >= self.max_size
    }

    /// Whether anything is pending.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Number of pending blobs.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Consumes the builder, yielding the packfile payload and the state
    /// entries pointing into it. The packfile MAC is filled in by the
    /// caller once computed over the payload.
    pub fn seal(self, packfile: Mac) -> (Vec<u8>, Vec<StateEntry>, SealStats) {
        let stats = SealStats {
            blobs: self.pending.len(),
            bytes: self.payload.len() as u64,
        };
        let entries = self
            .pending
            .into_iter()
            .map(|(resource, mac, offset, length)| StateEntry {
                resource,
                mac,
                packfile,
                offset,
                length,
            })
            .collect();
        (self.payload, entries, stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CompressionConfig;

    fn full_codec() -> BlobCodec {
        BlobCodec {
            compression: Some(CompressionConfig::default()),
            encryption: Some((
                EncryptionAlgorithm::AesGcm256,
                EncryptionKey([13u8; 32]),
            )),
        }
    }

    #[test]
    fn test_plaintext_codec_is_identity() {
        let codec = BlobCodec::plaintext();
        let data = b"unchanged".to_vec();
        assert_eq!(codec.encode(&data).unwrap(), data);
        assert_eq!(codec.decode(&data).unwrap(), data);
    }

    #[test]
    fn test_full_codec_round_trip() {
        let codec = full_codec();
        let data: Vec<u8> = (0..10_000u32).map(|i| (i % 7) as u8).collect();
        let encoded = codec.encode(&data).unwrap();
        assert_ne!(encoded, data);
        assert_eq!(codec.decode(&encoded).unwrap(), data);
    }

    #[test]
    fn test_compression_shrinks_redundant_data() {
        let codec = BlobCodec {
            compression: Some(CompressionConfig::default()),
            encryption: None,
        };
        let data = vec![0u8; 100_000];
        let encoded = codec.encode(&data).unwrap();
        assert!(encoded.len() < data.len() / 10);
    }

    #[test]
    fn test_decode_rejects_tampering() {
        let codec = full_codec();
        let mut encoded = codec.encode(b"payload").unwrap();
        let last = encoded.len() - 1;
        encoded[last] ^= 0x01;
        assert!(codec.decode(&encoded).is_err());
    }

    #[test]
    fn test_builder_offsets_are_contiguous() {
        let mut builder = PackfileBuilder::new(1 << 20);
        let a = Mac([1; 32]);
        let b = Mac([2; 32]);
        builder.add(ResourceType::Chunk, a, b"aaaa");
        builder.add(ResourceType::Chunk, b, b"bbbbbb");

        let packfile = Mac([9; 32]);
        let (payload, entries, stats) = builder.seal(packfile);
        assert_eq!(payload, b"aaaabbbbbb");
        assert_eq!(stats.blobs, 2);
        assert_eq!(stats.bytes, 10);

        assert_eq!(entries[0].offset, 0);
        assert_eq!(entries[0].length, 4);
        assert_eq!(entries[1].offset, 4);
        assert_eq!(entries[1].length, 6);
        assert!(entries.iter().all(|e| e.packfile == packfile));
    }

    #[test]
    fn test_builder_fullness() {
        let mut builder = PackfileBuilder::new(8);
        assert!(!builder.is_full());
        builder.add(ResourceType::Chunk, Mac([1; 32]), b"12345678");
        assert!(builder.is_full());
    }

    #[test]
    fn test_builder_contains_pending() {
        let mut builder = PackfileBuilder::new(1 << 20);
        let mac = Mac([1; 32]);
        assert!(!builder.contains(ResourceType::Chunk, mac));
        builder.add(ResourceType::Chunk, mac, b"x");
        assert!(builder.contains(ResourceType::Chunk, mac));
        assert!(!builder.contains(ResourceType::Object, mac));
    }
}
