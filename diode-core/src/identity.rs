//! Device identity: 20-byte addresses and the injected signer capability.

use std::fmt;

/// 20-byte account address (device, fleet contract, or server id).
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Hash)]
pub struct Address([u8; 20]);

impl Address {
    pub const ZERO: Address = Address([0u8; 20]);

    pub fn new(bytes: [u8; 20]) -> Self {
        Address(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// Accepts up to 20 bytes. Shorter wire values are left-padded with zeros,
    /// matching how integers drop leading zero bytes. Longer input is rejected.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        if bytes.len() > 20 {
            return None;
        }
        let mut out = [0u8; 20];
        out[20 - bytes.len()..].copy_from_slice(bytes);
        Some(Address(out))
    }

    /// Parse `0x`-prefixed or bare hex.
    pub fn from_hex(s: &str) -> Option<Self> {
        let s = s.strip_prefix("0x").unwrap_or(s);
        let bytes = hex::decode(s).ok()?;
        if bytes.len() != 20 {
            return None;
        }
        Self::from_slice(&bytes)
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 20]
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

/// Signing capability supplied by the host. The core never generates keys.
pub trait Signer: Send + Sync {
    fn sign(&self, preimage: &[u8]) -> Result<Vec<u8>, SignError>;
    fn public_key(&self) -> Vec<u8>;
}

impl<T: Signer + ?Sized> Signer for Box<T> {
    fn sign(&self, preimage: &[u8]) -> Result<Vec<u8>, SignError> {
        (**self).sign(preimage)
    }

    fn public_key(&self) -> Vec<u8> {
        (**self).public_key()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SignError {
    #[error("signer unavailable")]
    Unavailable,
    #[error("signing failed: {0}")]
    Failed(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_hex_roundtrip() {
        let addr = Address::new([0xab; 20]);
        let text = addr.to_string();
        assert_eq!(text.len(), 42);
        assert_eq!(Address::from_hex(&text), Some(addr));
    }

    #[test]
    fn address_from_short_slice_pads_left() {
        let addr = Address::from_slice(&[1, 2]).unwrap();
        assert_eq!(addr.as_bytes()[18..], [1, 2]);
        assert!(Address::from_slice(&[0u8; 21]).is_none());
    }

    #[test]
    fn address_rejects_wrong_hex_length() {
        assert!(Address::from_hex("0x1234").is_none());
        assert!(Address::from_hex("zz").is_none());
    }
}
