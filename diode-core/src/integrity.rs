//! Integrity: the injected 32-byte hash used for proofs, headers and tickets.

use std::sync::Arc;

use sha2::{Digest, Sha256};

use crate::header::{HeaderHasher, RlpHeaderHasher};

/// 32-byte digest.
pub type Hash = [u8; 32];

/// Hash capability supplied by the host. Must be deterministic.
pub trait Hasher: Send + Sync {
    fn hash(&self, data: &[u8]) -> Hash;
}

/// SHA-256, the hash edge servers use for state proofs.
#[derive(Debug, Clone, Copy, Default)]
pub struct Sha256Hasher;

impl Hasher for Sha256Hasher {
    fn hash(&self, data: &[u8]) -> Hash {
        let mut hasher = Sha256::new();
        hasher.update(data);
        hasher.finalize().into()
    }
}

/// Verify `data` against an expected digest.
pub fn verify_hash(hasher: &dyn Hasher, data: &[u8], expected: &Hash) -> bool {
    hasher.hash(data) == *expected
}

/// Hash capabilities response decoders need: a content hash for proofs and
/// the light-client header hash for block headers.
#[derive(Clone)]
pub struct Verifiers {
    pub hasher: Arc<dyn Hasher>,
    pub header_hasher: Arc<dyn HeaderHasher>,
}

impl Verifiers {
    pub fn new(hasher: Arc<dyn Hasher>, header_hasher: Arc<dyn HeaderHasher>) -> Self {
        Self {
            hasher,
            header_hasher,
        }
    }
}

impl Default for Verifiers {
    fn default() -> Self {
        Self {
            hasher: Arc::new(Sha256Hasher),
            header_hasher: Arc::new(RlpHeaderHasher::new(Sha256Hasher)),
        }
    }
}

impl std::fmt::Debug for Verifiers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Verifiers").finish_non_exhaustive()
    }
}
