//! Block headers: the light-client hashing contract and the claimed-hash check.
//!
//! Chain validation itself lives with the light client; this module only needs
//! to recompute a header's canonical hash and compare it with the hash the
//! edge server claims. A mismatch is fatal to that claim.

use crate::integrity::{Hash, Hasher};
use crate::rlp::{self, Value};

/// Header fields as served by `getblockheader`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockHeader {
    pub tx_hash: Vec<u8>,
    pub state_hash: Vec<u8>,
    pub prev_block: Vec<u8>,
    pub miner_sig: Vec<u8>,
    pub miner_pubkey: Vec<u8>,
    pub timestamp: u64,
    pub number: u64,
    pub nonce: u64,
}

/// Canonical header hash supplied by the light client.
pub trait HeaderHasher: Send + Sync {
    fn header_hash(&self, header: &BlockHeader) -> Hash;
}

/// Hashes the encoded field list with an injected content hash.
#[derive(Debug, Clone, Copy, Default)]
pub struct RlpHeaderHasher<H> {
    hasher: H,
}

impl<H: Hasher> RlpHeaderHasher<H> {
    pub fn new(hasher: H) -> Self {
        Self { hasher }
    }
}

impl<H: Hasher> HeaderHasher for RlpHeaderHasher<H> {
    fn header_hash(&self, header: &BlockHeader) -> Hash {
        let fields = Value::List(vec![
            Value::Bytes(header.prev_block.clone()),
            Value::Bytes(header.miner_pubkey.clone()),
            Value::Bytes(header.state_hash.clone()),
            Value::Bytes(header.tx_hash.clone()),
            Value::uint(header.timestamp),
            Value::uint(header.number),
            Value::uint(header.nonce),
            Value::Bytes(header.miner_sig.clone()),
        ]);
        self.hasher.hash(&rlp::encode(&fields))
    }
}

/// The recomputed header hash differs from the one the server claimed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("block hash mismatch: claimed 0x{claimed}, computed 0x{computed}")]
pub struct ProtocolMismatch {
    pub claimed: String,
    pub computed: String,
}

/// Fail closed unless `claimed` equals the header's canonical hash.
pub fn verify_header(
    header: &BlockHeader,
    claimed: &[u8],
    hasher: &dyn HeaderHasher,
) -> Result<Hash, ProtocolMismatch> {
    let computed = hasher.header_hash(header);
    if computed.as_slice() != claimed {
        return Err(ProtocolMismatch {
            claimed: hex::encode(claimed),
            computed: hex::encode(computed),
        });
    }
    Ok(computed)
}
