//! # Identities, Keys and Contacts
//!
//! This module defines the identity types the lookup engine works with:
//!
//! - [`Keypair`]: Ed25519 signing keypair used to derive a peer identity
//! - [`Identity`]: 32-byte identifier naming a peer; also used as a lookup target
//! - [`Contact`]: immutable identity + address record for a remote peer
//!
//! ## Identity Model
//!
//! Identity = Ed25519 public key. Target keys for arbitrary data are mapped
//! into the same 256-bit space with [`hash_key`] (BLAKE3).
//!
//! ## Distance
//!
//! Closeness is the Kademlia XOR metric: `distance(a, b) = a XOR b`, compared
//! as an unsigned 256-bit big-endian integer ([`distance_cmp`]).
//!
//! ## Invariants
//!
//! - `Identity::from_bytes(bytes).as_bytes() == bytes`
//! - XOR distance is symmetric and zero only for equal identities
//! - `Contact` equality, hashing and ordering consider only the identity

use std::cmp::Ordering;

use ed25519_dalek::{SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use rand::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};

/// Length in bytes of an identifier.
pub const ID_LEN: usize = 32;

#[derive(Clone)]
pub struct Keypair {
    signing_key: SigningKey,
}

impl Keypair {
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self { signing_key }
    }

    /// Generate a keypair from a caller-supplied RNG.
    ///
    /// Deterministic RNGs make simulated networks reproducible.
    pub fn generate_from<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        let signing_key = SigningKey::generate(rng);
        Self { signing_key }
    }

    pub fn from_secret_key_bytes(bytes: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(bytes);
        Self { signing_key }
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    pub fn identity(&self) -> Identity {
        Identity::from_bytes(self.public_key_bytes())
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    /// Build a contact record for this keypair reachable at `addr`.
    pub fn create_contact(&self, addr: impl Into<String>) -> Contact {
        Contact {
            identity: self.identity(),
            addr: addr.into(),
            public_key: Some(self.public_key_bytes()),
        }
    }
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keypair")
            .field("identity", &hex::encode(self.identity().as_bytes()))
            .finish_non_exhaustive()
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Identity([u8; ID_LEN]);

impl Identity {
    #[inline]
    pub fn from_bytes(bytes: [u8; ID_LEN]) -> Self {
        Self(bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; ID_LEN] {
        &self.0
    }

    #[inline]
    pub fn xor_distance(&self, other: &Identity) -> [u8; ID_LEN] {
        let mut out = [0u8; ID_LEN];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        out
    }

    /// Returns `true` if `self` is strictly closer to `target` than `other`.
    #[inline]
    pub fn is_closer(&self, other: &Identity, target: &Identity) -> bool {
        distance_cmp(&self.xor_distance(target), &other.xor_distance(target)) == Ordering::Less
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        if bytes.len() != ID_LEN {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let mut arr = [0u8; ID_LEN];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }

    /// First eight bytes in hex, for log fields.
    pub(crate) fn short(&self) -> String {
        hex::encode(&self.0[..8])
    }
}

/// Map arbitrary bytes onto the identifier space.
pub fn hash_key(data: &[u8]) -> Identity {
    Identity::from_bytes(*blake3::hash(data).as_bytes())
}

/// Compare two XOR distances as unsigned big-endian integers.
///
/// # Example
/// ```ignore
/// let dist_a = a.xor_distance(&target);
/// let dist_b = b.xor_distance(&target);
/// if distance_cmp(&dist_a, &dist_b) == Ordering::Less {
///     // a is closer to target than b
/// }
/// ```
#[inline]
pub fn distance_cmp(a: &[u8; ID_LEN], b: &[u8; ID_LEN]) -> Ordering {
    for i in 0..ID_LEN {
        if a[i] < b[i] {
            return Ordering::Less;
        } else if a[i] > b[i] {
            return Ordering::Greater;
        }
    }
    Ordering::Equal
}

/// Stable sort by ascending XOR distance to `target`.
///
/// Contacts at equal distance keep their relative input order.
pub fn sort_by_distance(contacts: &mut [Contact], target: &Identity) {
    contacts.sort_by(|a, b| a.cmp_distance(b, target));
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Identity({})", &self.to_hex()[..16])
    }
}

impl std::fmt::Display for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl From<[u8; ID_LEN]> for Identity {
    fn from(bytes: [u8; ID_LEN]) -> Self {
        Self(bytes)
    }
}

impl From<Identity> for [u8; ID_LEN] {
    fn from(identity: Identity) -> Self {
        identity.0
    }
}

impl AsRef<[u8]> for Identity {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// A remote peer as seen by the lookup engine.
///
/// Immutable once created. Equality, hashing and ordering use the identity
/// only, so two records for the same peer with different addresses collapse
/// into one ledger entry.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Contact {
    pub identity: Identity,
    pub addr: String,
    /// Ed25519 public key bytes, when the peer advertised one.
    #[serde(default)]
    pub public_key: Option<[u8; 32]>,
}

impl Contact {
    pub fn new(identity: Identity, addr: impl Into<String>) -> Self {
        Self {
            identity,
            addr: addr.into(),
            public_key: None,
        }
    }

    #[inline]
    pub fn distance_to(&self, target: &Identity) -> [u8; ID_LEN] {
        self.identity.xor_distance(target)
    }

    #[inline]
    pub fn cmp_distance(&self, other: &Contact, target: &Identity) -> Ordering {
        distance_cmp(&self.distance_to(target), &other.distance_to(target))
    }

    /// Parse the advertised public key, if any.
    ///
    /// Returns `None` when no key was advertised or the bytes are not a
    /// valid Ed25519 point.
    pub fn verifying_key(&self) -> Option<VerifyingKey> {
        self.public_key
            .and_then(|bytes| VerifyingKey::from_bytes(&bytes).ok())
    }
}

impl PartialEq for Contact {
    fn eq(&self, other: &Self) -> bool {
        self.identity == other.identity
    }
}

impl Eq for Contact {}

impl std::hash::Hash for Contact {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.identity.hash(state);
    }
}

impl PartialOrd for Contact {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Contact {
    fn cmp(&self, other: &Self) -> Ordering {
        self.identity.cmp(&other.identity)
    }
}
