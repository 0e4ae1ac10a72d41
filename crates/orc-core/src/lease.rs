//! Lease ids: the capability token a worker presents when it claims and
//! later completes or fails a task.
//!
//! Unlike the teacher's HMAC-signed, scope-bound agent tokens, the source
//! specification's lease is a capability by possession: a random token
//! compared by equality against the task's latest attempt (§4.5, §5). No
//! cryptographic binding is required because the lease never leaves the
//! orchestrator's own process boundary plus the worker it was handed to.

use rand::RngCore;
use thiserror::Error;

const LEASE_PREFIX: &str = "lease-";
const LEASE_HEX_LEN: usize = 12;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LeaseError {
    #[error("lease id {0:?} does not start with {LEASE_PREFIX:?}")]
    MissingPrefix(String),
    #[error("lease id {0:?} has the wrong length (expected {LEASE_HEX_LEN} hex chars after the prefix)")]
    WrongLength(String),
    #[error("lease id {0:?} contains non-hex characters")]
    NotHex(String),
}

/// A validated lease id, e.g. `lease-a1b2c3d4e5f6`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct LeaseId(String);

impl LeaseId {
    /// Mint a fresh random lease id.
    pub fn generate() -> Self {
        let mut bytes = [0u8; LEASE_HEX_LEN / 2];
        rand::rng().fill_bytes(&mut bytes);
        Self(format!("{LEASE_PREFIX}{}", hex::encode(bytes)))
    }

    pub fn parse(s: impl Into<String>) -> Result<Self, LeaseError> {
        let s = s.into();
        let rest = s
            .strip_prefix(LEASE_PREFIX)
            .ok_or_else(|| LeaseError::MissingPrefix(s.clone()))?;
        if rest.len() != LEASE_HEX_LEN {
            return Err(LeaseError::WrongLength(s));
        }
        if !rest.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(LeaseError::NotHex(s));
        }
        Ok(Self(s))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for LeaseId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for LeaseId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_then_parse_roundtrips() {
        let lease = LeaseId::generate();
        let parsed = LeaseId::parse(lease.as_str()).unwrap();
        assert_eq!(lease, parsed);
    }

    #[test]
    fn generate_has_expected_shape() {
        let lease = LeaseId::generate();
        assert!(lease.as_str().starts_with("lease-"));
        assert_eq!(lease.as_str().len(), "lease-".len() + LEASE_HEX_LEN);
    }

    #[test]
    fn rejects_missing_prefix() {
        assert!(matches!(
            LeaseId::parse("abcdef012345"),
            Err(LeaseError::MissingPrefix(_))
        ));
    }

    #[test]
    fn rejects_wrong_length() {
        assert!(matches!(
            LeaseId::parse("lease-abc"),
            Err(LeaseError::WrongLength(_))
        ));
    }

    #[test]
    fn rejects_non_hex() {
        assert!(matches!(
            LeaseId::parse("lease-zzzzzzzzzzzz"),
            Err(LeaseError::NotHex(_))
        ));
    }

    #[test]
    fn two_generated_leases_differ() {
        assert_ne!(LeaseId::generate(), LeaseId::generate());
    }
}
