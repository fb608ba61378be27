//! Merkle proof verifier for account and state proofs.
//!
//! A proof node is either a bucket `[prefix, modulo, [key, value]...]` (three
//! or more items) or a binary branch `[left, right]`. A branch child is a
//! nested node, a 32-byte subtree hash, or the empty string for an absent
//! subtree. Buckets hash as `hash(encode(bucket))`, branches as
//! `hash(left || right)`.
//!
//! The verifier never trusts a root: callers compare `root_hash` against a
//! state root taken from a verified block header.

use crate::integrity::{Hash, Hasher};
use crate::rlp::{self, decode_uint, Value, MAX_DEPTH};

const BRANCH_ARITY: usize = 2;
const MIN_BUCKET_LEN: usize = 3;
const EMPTY_SUBTREE: Hash = [0u8; 32];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Leaf {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

/// Verified shape of a proof. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MerkleTree {
    pub root_hash: Hash,
    /// `modulo` carried by the deepest bucket; combine with leaf keys to
    /// re-derive node positions.
    pub module: u64,
    /// Branch levels above that bucket.
    pub depth: u32,
    /// Leaves in depth-first order.
    pub leaves: Vec<Leaf>,
    /// Proof the tree was rebuilt from.
    pub raw: Value,
}

impl MerkleTree {
    /// Walk a raw proof depth-first and rebuild its root.
    pub fn build(raw: &Value, hasher: &dyn Hasher) -> Result<Self, ProofError> {
        if raw.as_list().map_or(false, |items| items.is_empty()) {
            return Err(ProofError::NoLeaves);
        }
        let mut walk = Walk {
            hasher,
            leaves: Vec::new(),
            terminal: None,
        };
        let root_hash = walk.node(raw, 0, "proof")?;
        let Some((module, depth)) = walk.terminal else {
            return Err(ProofError::NoLeaves);
        };
        Ok(Self {
            root_hash,
            module,
            depth,
            leaves: walk.leaves,
            raw: raw.clone(),
        })
    }

    /// Value proven for `key`, if the proof carries it.
    pub fn value(&self, key: &[u8]) -> Option<&[u8]> {
        self.leaves
            .iter()
            .find(|leaf| leaf.key == key)
            .map(|leaf| leaf.value.as_slice())
    }

    /// Compare the rebuilt root with an independently trusted one.
    pub fn verify_root(&self, trusted: &[u8]) -> Result<(), ProofError> {
        if self.root_hash.as_slice() != trusted {
            return Err(ProofError::RootMismatch {
                computed: hex::encode(self.root_hash),
                trusted: hex::encode(trusted),
            });
        }
        Ok(())
    }
}

struct Walk<'h> {
    hasher: &'h dyn Hasher,
    leaves: Vec<Leaf>,
    /// (module, depth) of the deepest bucket seen so far.
    terminal: Option<(u64, u32)>,
}

impl Walk<'_> {
    fn node(&mut self, node: &Value, depth: u32, path: &str) -> Result<Hash, ProofError> {
        let Some(items) = node.as_list() else {
            return Err(shape(path, "expected a list"));
        };
        match items.len() {
            BRANCH_ARITY => self.branch(items, depth, path),
            n if n >= MIN_BUCKET_LEN => self.bucket(node, items, depth, path),
            n => Err(shape(path, &format!("node with {} items", n))),
        }
    }

    fn branch(&mut self, children: &[Value], depth: u32, path: &str) -> Result<Hash, ProofError> {
        if depth as usize >= MAX_DEPTH {
            return Err(shape(path, "proof too deep"));
        }
        let mut preimage = Vec::with_capacity(BRANCH_ARITY * 32);
        for (i, child) in children.iter().enumerate() {
            let child_path = format!("{}[{}]", path, i);
            let hash = match child {
                Value::Bytes(b) if b.is_empty() => EMPTY_SUBTREE,
                Value::Bytes(b) => {
                    Hash::try_from(b.as_slice()).map_err(|_| ProofError::InvalidHash {
                        path: child_path,
                        len: b.len(),
                    })?
                }
                Value::List(_) => self.node(child, depth + 1, &child_path)?,
            };
            preimage.extend_from_slice(&hash);
        }
        Ok(self.hasher.hash(&preimage))
    }

    fn bucket(
        &mut self,
        node: &Value,
        items: &[Value],
        depth: u32,
        path: &str,
    ) -> Result<Hash, ProofError> {
        if items[0].as_bytes().is_none() {
            return Err(shape(&format!("{}.prefix", path), "expected bytes"));
        }
        let module = items[1]
            .as_bytes()
            .and_then(decode_uint)
            .ok_or_else(|| shape(&format!("{}.modulo", path), "expected an integer"))?;
        for (i, pair) in items[MIN_BUCKET_LEN - 1..].iter().enumerate() {
            let pair_path = format!("{}[{}]", path, i + MIN_BUCKET_LEN - 1);
            match pair.as_list() {
                Some([Value::Bytes(key), Value::Bytes(value)]) => self.leaves.push(Leaf {
                    key: key.clone(),
                    value: value.clone(),
                }),
                _ => return Err(shape(&pair_path, "expected [key, value]")),
            }
        }
        if self.terminal.map_or(true, |(_, d)| depth > d) {
            self.terminal = Some((module, depth));
        }
        Ok(self.hasher.hash(&rlp::encode(node)))
    }
}

fn shape(path: &str, reason: &str) -> ProofError {
    ProofError::Shape {
        path: path.to_string(),
        reason: reason.to_string(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProofError {
    #[error("invalid proof at {path}: {reason}")]
    Shape { path: String, reason: String },
    #[error("invalid proof at {path}: subtree hash must be 32 bytes, got {len}")]
    InvalidHash { path: String, len: usize },
    #[error("invalid proof: no leaves")]
    NoLeaves,
    #[error("proof root 0x{computed} does not match trusted root 0x{trusted}")]
    RootMismatch { computed: String, trusted: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::integrity::Sha256Hasher;

    fn bucket(module: u64, pairs: &[(&[u8], &[u8])]) -> Value {
        let mut items = vec![Value::Bytes(vec![]), Value::uint(module)];
        for (k, v) in pairs {
            items.push(Value::List(vec![Value::from(*k), Value::from(*v)]));
        }
        Value::List(items)
    }

    #[test]
    fn single_bucket_root_is_its_own_hash() {
        let proof = bucket(1, &[(b"key", b"value")]);
        let tree = MerkleTree::build(&proof, &Sha256Hasher).unwrap();
        assert_eq!(tree.root_hash, Sha256Hasher.hash(&rlp::encode(&proof)));
        assert_eq!(tree.module, 1);
        assert_eq!(tree.depth, 0);
        assert_eq!(tree.value(b"key"), Some(&b"value"[..]));
    }

    #[test]
    fn branch_combines_child_hashes() {
        let leaf = bucket(3, &[(b"a", b"1"), (b"b", b"2")]);
        let sibling = [9u8; 32];
        let proof = Value::List(vec![leaf.clone(), Value::Bytes(sibling.to_vec())]);
        let tree = MerkleTree::build(&proof, &Sha256Hasher).unwrap();

        let mut preimage = Sha256Hasher.hash(&rlp::encode(&leaf)).to_vec();
        preimage.extend_from_slice(&sibling);
        assert_eq!(tree.root_hash, Sha256Hasher.hash(&preimage));
        assert_eq!(tree.module, 3);
        assert_eq!(tree.depth, 1);
        assert_eq!(tree.leaves.len(), 2);
        assert!(tree.verify_root(&tree.root_hash.clone()).is_ok());
    }

    #[test]
    fn absent_child_hashes_as_zero() {
        let leaf = bucket(2, &[(b"k", b"v")]);
        let proof = Value::List(vec![Value::Bytes(vec![]), leaf.clone()]);
        let tree = MerkleTree::build(&proof, &Sha256Hasher).unwrap();
        let mut preimage = vec![0u8; 32];
        preimage.extend_from_slice(&Sha256Hasher.hash(&rlp::encode(&leaf)));
        assert_eq!(tree.root_hash, Sha256Hasher.hash(&preimage));
    }

    #[test]
    fn deepest_bucket_sets_module() {
        let shallow = bucket(1, &[(b"s", b"1")]);
        let deep = bucket(4, &[(b"d", b"2")]);
        let proof = Value::List(vec![
            shallow,
            Value::List(vec![deep, Value::Bytes(vec![7u8; 32])]),
        ]);
        let tree = MerkleTree::build(&proof, &Sha256Hasher).unwrap();
        assert_eq!(tree.module, 4);
        assert_eq!(tree.depth, 2);
        assert_eq!(tree.leaves[0].key, b"s".to_vec());
        assert_eq!(tree.leaves[1].key, b"d".to_vec());
    }

    #[test]
    fn zero_leaves_rejected() {
        let hashes_only = Value::List(vec![
            Value::Bytes(vec![1u8; 32]),
            Value::Bytes(vec![2u8; 32]),
        ]);
        assert_eq!(
            MerkleTree::build(&hashes_only, &Sha256Hasher),
            Err(ProofError::NoLeaves)
        );
        assert_eq!(
            MerkleTree::build(&Value::List(vec![]), &Sha256Hasher),
            Err(ProofError::NoLeaves)
        );
    }

    #[test]
    fn truncated_branch_rejected() {
        let proof = Value::List(vec![
            bucket(1, &[(b"k", b"v")]),
            Value::List(vec![bucket(2, &[(b"x", b"y")])]),
        ]);
        match MerkleTree::build(&proof, &Sha256Hasher) {
            Err(ProofError::Shape { path, .. }) => assert_eq!(path, "proof[1]"),
            other => panic!("expected shape error, got {:?}", other),
        }
    }

    #[test]
    fn short_subtree_hash_rejected() {
        let proof = Value::List(vec![bucket(1, &[(b"k", b"v")]), Value::Bytes(vec![1, 2, 3])]);
        assert!(matches!(
            MerkleTree::build(&proof, &Sha256Hasher),
            Err(ProofError::InvalidHash { len: 3, .. })
        ));
    }

    #[test]
    fn malformed_pair_rejected() {
        let proof = Value::List(vec![
            Value::Bytes(vec![]),
            Value::uint(1),
            Value::List(vec![Value::from(&b"only-key"[..])]),
        ]);
        assert!(matches!(
            MerkleTree::build(&proof, &Sha256Hasher),
            Err(ProofError::Shape { .. })
        ));
    }

    #[test]
    fn root_mismatch_reported() {
        let tree = MerkleTree::build(&bucket(1, &[(b"k", b"v")]), &Sha256Hasher).unwrap();
        assert!(matches!(
            tree.verify_root(&[0u8; 32]),
            Err(ProofError::RootMismatch { .. })
        ));
    }
}
