//! Core wire types for garlic routing
//!
//! Fixed-size identifiers are newtypes over byte arrays. All integers on the
//! wire are big-endian; dates are milliseconds since the Unix epoch.

use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// 32-byte fixed-size array used for hashes, keys and tags.
pub type Bytes32 = [u8; 32];

/// Session tag size on the wire
pub const SESSION_TAG_LEN: usize = 32;
/// Session key size on the wire
pub const SESSION_KEY_LEN: usize = 32;

// =============================================================================
// IDENTITY TYPES
// =============================================================================

/// SHA-256 hash of a router identity or destination
#[derive(Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IdentHash(pub Bytes32);

impl IdentHash {
    /// Hash the serialized identity bytes
    pub fn of(identity_bytes: &[u8]) -> Self {
        Self(crate::crypto::sha256(identity_bytes))
    }

    /// Get as bytes
    pub fn as_bytes(&self) -> &Bytes32 {
        &self.0
    }
}

impl fmt::Display for IdentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..8]))
    }
}

impl fmt::Debug for IdentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IdentHash({self})")
    }
}

/// Tunnel identifier, unique per hop
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct TunnelId(pub u32);

impl fmt::Display for TunnelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// SESSION KEY MATERIAL
// =============================================================================

/// Symmetric AES-256 session key
#[derive(Clone, PartialEq, Eq, Hash, Zeroize, ZeroizeOnDrop)]
pub struct SessionKey(pub Bytes32);

impl SessionKey {
    /// Generate a fresh random key
    pub fn random() -> Self {
        let mut key = [0u8; SESSION_KEY_LEN];
        rand::rngs::OsRng.fill_bytes(&mut key);
        Self(key)
    }

    pub fn as_bytes(&self) -> &Bytes32 {
        &self.0
    }
}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionKey({}..)", hex::encode(&self.0[..4]))
    }
}

/// Single-use session tag, implicitly bound to one [`SessionKey`]
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionTag(pub Bytes32);

impl SessionTag {
    /// Generate a fresh random tag
    pub fn random() -> Self {
        let mut tag = [0u8; SESSION_TAG_LEN];
        rand::rngs::OsRng.fill_bytes(&mut tag);
        Self(tag)
    }

    /// Generate `count` fresh random tags
    pub fn batch(count: usize) -> Vec<Self> {
        (0..count).map(|_| Self::random()).collect()
    }

    pub fn as_bytes(&self) -> &Bytes32 {
        &self.0
    }
}

impl fmt::Debug for SessionTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionTag({})", hex::encode(&self.0[..6]))
    }
}

/// Which encryption path produced a garlic message
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyType {
    /// Asymmetric bootstrap: ElGamal block carrying a session key
    ElGamal,
    /// Symmetric reuse: a previously delivered session tag
    Aes,
}

// =============================================================================
// LEASES
// =============================================================================

/// One inbound tunnel gateway of a remote destination
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Lease {
    /// Gateway router
    pub gateway: IdentHash,
    /// Tunnel id at the gateway
    pub tunnel_id: TunnelId,
    /// Expiration (wall clock)
    pub end_date: SystemTime,
}

impl Lease {
    pub fn is_expired(&self) -> bool {
        self.end_date <= SystemTime::now()
    }
}

/// A destination's current set of inbound leases
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LeaseSet {
    /// Destination the leases lead to
    pub destination: IdentHash,
    /// Leases, in no particular order
    pub leases: Vec<Lease>,
}

impl LeaseSet {
    pub fn new(destination: IdentHash, leases: Vec<Lease>) -> Self {
        Self {
            destination,
            leases,
        }
    }

    /// Leases that have not expired yet
    pub fn live_leases(&self) -> impl Iterator<Item = &Lease> {
        self.leases.iter().filter(|l| !l.is_expired())
    }

    /// A lease set is usable while at least one lease is live
    pub fn is_usable(&self) -> bool {
        self.live_leases().next().is_some()
    }
}

// =============================================================================
// TIME
// =============================================================================

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Wall-clock expiration `ttl` from now, in milliseconds since the epoch.
pub fn expiration_in(ttl: Duration) -> u64 {
    now_millis().saturating_add(ttl.as_millis() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_tags_are_distinct() {
        let tags = SessionTag::batch(15);
        let unique: std::collections::HashSet<_> = tags.iter().collect();
        assert_eq!(unique.len(), 15);
    }

    #[test]
    fn test_lease_set_usable() {
        let dest = IdentHash([1u8; 32]);
        let expired = Lease {
            gateway: IdentHash([2u8; 32]),
            tunnel_id: TunnelId(7),
            end_date: SystemTime::now() - Duration::from_secs(1),
        };
        let mut ls = LeaseSet::new(dest, vec![expired.clone()]);
        assert!(!ls.is_usable());

        ls.leases.push(Lease {
            end_date: SystemTime::now() + Duration::from_secs(600),
            ..expired
        });
        assert!(ls.is_usable());
        assert_eq!(ls.live_leases().count(), 1);
    }

    #[test]
    fn test_ident_hash_display_is_short_hex() {
        let h = IdentHash([0xab; 32]);
        assert_eq!(h.to_string(), "abababababababab");
    }
}
