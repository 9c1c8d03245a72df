//! Node identity: Ed25519 keys, node hash, advert flags
//!
//! Every node is identified by an Ed25519 keypair. The single-byte node
//! hash used in packet paths is the first byte of the public key.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;

use crate::error::{CoreError, Result};

/// Maximum node name length on the wire (bytes, excluding any terminator)
pub const MAX_NAME_LEN: usize = 15;

/// Advert flag bit: appdata carries a latitude/longitude pair
pub const FLAG_HAS_LOCATION: u8 = 0x10;

/// Advert flag bit: appdata carries a node name
pub const FLAG_HAS_NAME: u8 = 0x80;

/// Node kind carried in the low nibble of the advert flags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum NodeKind {
    /// Phone/chat client
    Chat = 1,
    /// Store-and-forward repeater
    Repeater = 2,
    /// Room server
    Room = 3,
    /// Telemetry sensor
    Sensor = 4,
}

impl NodeKind {
    /// Decode from the low nibble of an advert flags byte
    pub fn from_flags(flags: u8) -> Option<NodeKind> {
        match flags & 0x0F {
            1 => Some(NodeKind::Chat),
            2 => Some(NodeKind::Repeater),
            3 => Some(NodeKind::Room),
            4 => Some(NodeKind::Sensor),
            _ => None,
        }
    }
}

/// Geographic position in micro-degrees (degrees x 1e6)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Location {
    /// Latitude x 1e6
    pub lat: i32,
    /// Longitude x 1e6
    pub lon: i32,
}

impl Location {
    /// Build from floating-point degrees
    pub fn from_degrees(lat: f64, lon: f64) -> Location {
        Location {
            lat: (lat * 1e6) as i32,
            lon: (lon * 1e6) as i32,
        }
    }
}

/// Ed25519 public key with mesh helpers
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PublicKey(VerifyingKey);

impl PublicKey {
    /// Parse from raw bytes
    pub fn from_bytes(bytes: &[u8; 32]) -> Result<PublicKey> {
        VerifyingKey::from_bytes(bytes)
            .map(PublicKey)
            .map_err(|e| CoreError::InvalidKey(e.to_string()))
    }

    /// Raw key bytes
    pub fn to_bytes(&self) -> [u8; 32] {
        self.0.to_bytes()
    }

    /// Single-byte node hash used in packet paths
    pub fn node_hash(&self) -> u8 {
        self.0.to_bytes()[0]
    }

    /// Verify an Ed25519 signature over `message`
    pub fn verify(&self, message: &[u8], signature: &[u8; 64]) -> Result<()> {
        let sig = Signature::from_bytes(signature);
        self.0
            .verify(message, &sig)
            .map_err(|_| CoreError::BadSignature)
    }

    pub(crate) fn verifying_key(&self) -> &VerifyingKey {
        &self.0
    }
}

impl std::fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let b = self.0.to_bytes();
        write!(f, "PublicKey({:02x}{:02x}..{:02x})", b[0], b[1], b[31])
    }
}

/// Node keypair wrapping an Ed25519 signing key
pub struct Keypair {
    signing: SigningKey,
}

impl Keypair {
    /// Generate a fresh random keypair
    pub fn generate() -> Keypair {
        Keypair {
            signing: SigningKey::generate(&mut OsRng),
        }
    }

    /// Rebuild from a stored 32-byte seed
    pub fn from_seed(seed: &[u8; 32]) -> Keypair {
        Keypair {
            signing: SigningKey::from_bytes(seed),
        }
    }

    /// Seed bytes for persistence
    pub fn seed(&self) -> [u8; 32] {
        self.signing.to_bytes()
    }

    /// Public half
    pub fn public(&self) -> PublicKey {
        PublicKey(self.signing.verifying_key())
    }

    /// Single-byte node hash of the public key
    pub fn node_hash(&self) -> u8 {
        self.public().node_hash()
    }

    /// Sign `message`, returning the raw 64-byte signature
    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.signing.sign(message).to_bytes()
    }

    pub(crate) fn signing_key(&self) -> &SigningKey {
        &self.signing
    }
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keypair")
            .field("public", &self.public())
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

/// The local node's advertised identity
#[derive(Debug)]
pub struct NodeIdentity {
    keypair: Keypair,
    name: String,
    kind: NodeKind,
    location: Option<Location>,
}

impl NodeIdentity {
    /// Build a repeater identity; fails when the name exceeds the wire limit
    pub fn new(
        keypair: Keypair,
        name: &str,
        kind: NodeKind,
        location: Option<Location>,
    ) -> Result<NodeIdentity> {
        if name.len() > MAX_NAME_LEN {
            return Err(CoreError::NameTooLong {
                len: name.len(),
                max: MAX_NAME_LEN,
            });
        }
        Ok(NodeIdentity {
            keypair,
            name: name.to_string(),
            kind,
            location,
        })
    }

    /// Keypair backing this identity
    pub fn keypair(&self) -> &Keypair {
        &self.keypair
    }

    /// Advertised node name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Node kind presented in adverts
    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    /// Advertised location, if any
    pub fn location(&self) -> Option<Location> {
        self.location
    }

    /// Single-byte node hash
    pub fn node_hash(&self) -> u8 {
        self.keypair.node_hash()
    }

    /// Advert flags byte for a given presented kind
    pub fn flags_for_kind(&self, kind: NodeKind) -> u8 {
        let mut flags = kind as u8;
        if self.location.is_some() {
            flags |= FLAG_HAS_LOCATION;
        }
        if !self.name.is_empty() {
            flags |= FLAG_HAS_NAME;
        }
        flags
    }

    /// Advert flags byte for the true identity
    pub fn flags(&self) -> u8 {
        self.flags_for_kind(self.kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_hash_is_first_pubkey_byte() {
        let kp = Keypair::generate();
        assert_eq!(kp.node_hash(), kp.public().to_bytes()[0]);
    }

    #[test]
    fn seed_round_trip() {
        let kp = Keypair::generate();
        let restored = Keypair::from_seed(&kp.seed());
        assert_eq!(kp.public().to_bytes(), restored.public().to_bytes());
    }

    #[test]
    fn sign_and_verify() {
        let kp = Keypair::generate();
        let msg = b"advert bytes";
        let sig = kp.sign(msg);
        assert!(kp.public().verify(msg, &sig).is_ok());
        assert!(kp.public().verify(b"tampered", &sig).is_err());
    }

    #[test]
    fn debug_redacts_secret() {
        let kp = Keypair::generate();
        let dbg = format!("{:?}", kp);
        assert!(dbg.contains("REDACTED"));
        let seed_hex: String = kp.seed().iter().map(|b| format!("{:02x}", b)).collect();
        assert!(!dbg.contains(&seed_hex));
    }

    #[test]
    fn name_length_enforced() {
        let kp = Keypair::generate();
        let err = NodeIdentity::new(kp, "a-name-way-too-long", NodeKind::Repeater, None);
        assert!(matches!(err, Err(CoreError::NameTooLong { .. })));
    }

    #[test]
    fn flags_compose_kind_and_feature_bits() {
        let kp = Keypair::generate();
        let id = NodeIdentity::new(
            kp,
            "rpt1",
            NodeKind::Repeater,
            Some(Location::from_degrees(48.85, 2.35)),
        )
        .unwrap();
        let flags = id.flags();
        assert_eq!(flags & 0x0F, NodeKind::Repeater as u8);
        assert_ne!(flags & FLAG_HAS_LOCATION, 0);
        assert_ne!(flags & FLAG_HAS_NAME, 0);
        assert_eq!(NodeKind::from_flags(flags), Some(NodeKind::Repeater));

        let chat = id.flags_for_kind(NodeKind::Chat);
        assert_eq!(chat & 0x0F, NodeKind::Chat as u8);
    }
}
