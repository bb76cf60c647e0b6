//! Hashing utilities for distsync
//!
//! - SHA-256 for ring positions and chunk identifiers
//! - BLAKE3 for content checksums (chunks and whole files)

use blake3::Hasher;
use sha2::{Digest, Sha256};

/// Width of a chunk identifier in bytes before hex encoding
pub const CHUNK_ID_BYTES: usize = 16;

/// Checksum characters folded into a node-side object key
const OBJECT_KEY_CHECKSUM_CHARS: usize = 16;

/// Compute BLAKE3 hash of data, return hex string
pub fn blake3_hash(data: &[u8]) -> String {
    let hash = blake3::hash(data);
    format!("{}", hash)
}

/// Compute BLAKE3 hash incrementally (for streaming)
pub struct Blake3Hasher {
    hasher: Hasher,
}

impl Blake3Hasher {
    pub fn new() -> Self {
        Self {
            hasher: Hasher::new(),
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
    }

    pub fn finalize(&self) -> String {
        let hash = self.hasher.finalize();
        format!("{}", hash)
    }
}

impl Default for Blake3Hasher {
    fn default() -> Self {
        Self::new()
    }
}

/// Position of a key on the ring: the first 8 bytes of SHA-256, big endian.
pub fn ring_position(key: &str) -> u64 {
    let digest = Sha256::digest(key.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(prefix)
}

/// Deterministic chunk identifier for `(filename, index)`.
///
/// Re-uploading the same file places chunk `i` on the same ring position.
pub fn chunk_id(filename: &str, index: u64) -> String {
    let digest = Sha256::digest(format!("{}:{}", filename, index).as_bytes());
    hex::encode(&digest[..CHUNK_ID_BYTES])
}

/// Key a chunk is stored under on a node.
///
/// Includes a checksum prefix so that a re-upload with different content
/// never overwrites bytes still referenced by the previous record.
pub fn object_key(chunk_id: &str, checksum: &str) -> String {
    let end = checksum.len().min(OBJECT_KEY_CHECKSUM_CHARS);
    format!("{}.{}", chunk_id, &checksum[..end])
}

/// Compute directory prefix for chunk files (2-level hierarchy)
///
/// Returns (aa, bb) where aa and bb are the first two bytes of BLAKE3(key)
/// This creates a balanced directory tree: chunks/aa/bb/key
pub fn blob_prefix(key: &str) -> (String, String) {
    let hash = blake3::hash(key.as_bytes());
    let bytes = hash.as_bytes();
    (format!("{:02x}", bytes[0]), format!("{:02x}", bytes[1]))
}
