//! Signed node advertisements
//!
//! Advert payload: `pubkey(32) || timestamp(4 LE) || signature(64) || appdata`
//! where appdata is `flags(1) || name || location`. The signature covers
//! `pubkey || timestamp || appdata`; parsing verifies it before any field is
//! trusted. When both name and location are present the 8-byte location
//! occupies the payload tail and the name is the span in between.

use embermesh_core::identity::{
    Location, NodeIdentity, NodeKind, PublicKey, FLAG_HAS_LOCATION, FLAG_HAS_NAME,
};

use crate::error::{ProtocolError, Result};

/// Smallest valid advert payload: pubkey + timestamp + signature + flags
pub const ADVERT_MIN_LEN: usize = 32 + 4 + 64 + 1;

const TIMESTAMP_OFFSET: usize = 32;
const SIGNATURE_OFFSET: usize = 36;
const APPDATA_OFFSET: usize = 100;
const LOCATION_LEN: usize = 8;

/// A parsed, signature-verified advert
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advert {
    /// Advertiser's Ed25519 public key bytes
    pub pubkey: [u8; 32],
    /// Advertiser's clock at build time (epoch seconds)
    pub timestamp: u32,
    /// Raw flags byte
    pub flags: u8,
    /// Advertised name, when present
    pub name: Option<String>,
    /// Advertised location, when present
    pub location: Option<Location>,
}

impl Advert {
    /// Node hash of the advertiser
    pub fn node_hash(&self) -> u8 {
        self.pubkey[0]
    }

    /// Node kind from the flag low nibble
    pub fn kind(&self) -> Option<NodeKind> {
        NodeKind::from_flags(self.flags)
    }

    /// Build and sign an advert payload for `identity`, presenting `kind`
    pub fn build(identity: &NodeIdentity, timestamp: u32, kind: NodeKind) -> Vec<u8> {
        let flags = identity.flags_for_kind(kind);
        let mut appdata = Vec::with_capacity(1 + identity.name().len() + LOCATION_LEN);
        appdata.push(flags);
        appdata.extend_from_slice(identity.name().as_bytes());
        if let Some(loc) = identity.location() {
            appdata.extend_from_slice(&loc.lat.to_le_bytes());
            appdata.extend_from_slice(&loc.lon.to_le_bytes());
        }

        let pubkey = identity.keypair().public().to_bytes();
        let mut signed = Vec::with_capacity(32 + 4 + appdata.len());
        signed.extend_from_slice(&pubkey);
        signed.extend_from_slice(&timestamp.to_le_bytes());
        signed.extend_from_slice(&appdata);
        let signature = identity.keypair().sign(&signed);

        let mut payload = Vec::with_capacity(APPDATA_OFFSET + appdata.len());
        payload.extend_from_slice(&pubkey);
        payload.extend_from_slice(&timestamp.to_le_bytes());
        payload.extend_from_slice(&signature);
        payload.extend_from_slice(&appdata);
        payload
    }

    /// Parse and verify an advert payload
    pub fn parse(payload: &[u8]) -> Result<Advert> {
        if payload.len() < ADVERT_MIN_LEN {
            return Err(ProtocolError::MalformedAdvert("payload too short"));
        }

        let mut pubkey = [0u8; 32];
        pubkey.copy_from_slice(&payload[..TIMESTAMP_OFFSET]);
        let timestamp = u32::from_le_bytes(
            payload[TIMESTAMP_OFFSET..SIGNATURE_OFFSET].try_into().expect("4 bytes"),
        );
        let mut signature = [0u8; 64];
        signature.copy_from_slice(&payload[SIGNATURE_OFFSET..APPDATA_OFFSET]);
        let appdata = &payload[APPDATA_OFFSET..];

        // Verify before trusting anything in the appdata.
        let key = PublicKey::from_bytes(&pubkey)?;
        let mut signed = Vec::with_capacity(32 + 4 + appdata.len());
        signed.extend_from_slice(&pubkey);
        signed.extend_from_slice(&timestamp.to_le_bytes());
        signed.extend_from_slice(&appdata);
        key.verify(&signed, &signature)?;

        let flags = appdata[0];
        let mut rest = &appdata[1..];

        let location = if flags & FLAG_HAS_LOCATION != 0 {
            if rest.len() < LOCATION_LEN {
                return Err(ProtocolError::MalformedAdvert("location truncated"));
            }
            let tail = &rest[rest.len() - LOCATION_LEN..];
            let lat = i32::from_le_bytes(tail[..4].try_into().expect("4 bytes"));
            let lon = i32::from_le_bytes(tail[4..].try_into().expect("4 bytes"));
            rest = &rest[..rest.len() - LOCATION_LEN];
            Some(Location { lat, lon })
        } else {
            None
        };

        let name = if flags & FLAG_HAS_NAME != 0 {
            let text = String::from_utf8_lossy(rest)
                .trim_end_matches('\0')
                .to_string();
            Some(text)
        } else {
            None
        };

        Ok(Advert {
            pubkey,
            timestamp,
            flags,
            name,
            location,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use embermesh_core::identity::Keypair;

    fn identity(name: &str, location: Option<Location>) -> NodeIdentity {
        NodeIdentity::new(Keypair::generate(), name, NodeKind::Repeater, location).unwrap()
    }

    #[test]
    fn build_parse_round_trip_full() {
        let id = identity("ridge-rpt", Some(Location::from_degrees(46.2, 6.1)));
        let payload = Advert::build(&id, 1_700_000_000, NodeKind::Repeater);
        let advert = Advert::parse(&payload).unwrap();
        assert_eq!(advert.pubkey, id.keypair().public().to_bytes());
        assert_eq!(advert.timestamp, 1_700_000_000);
        assert_eq!(advert.kind(), Some(NodeKind::Repeater));
        assert_eq!(advert.name.as_deref(), Some("ridge-rpt"));
        assert_eq!(advert.location, Some(Location::from_degrees(46.2, 6.1)));
        assert_eq!(advert.node_hash(), id.node_hash());
    }

    #[test]
    fn name_only_advert() {
        let id = identity("bare", None);
        let payload = Advert::build(&id, 1_700_000_000, NodeKind::Repeater);
        let advert = Advert::parse(&payload).unwrap();
        assert_eq!(advert.name.as_deref(), Some("bare"));
        assert_eq!(advert.location, None);
    }

    #[test]
    fn presented_kind_can_differ_from_identity() {
        let id = identity("rpt", None);
        let payload = Advert::build(&id, 1_700_000_000, NodeKind::Chat);
        let advert = Advert::parse(&payload).unwrap();
        assert_eq!(advert.kind(), Some(NodeKind::Chat));
    }

    #[test]
    fn tampered_timestamp_fails_verification() {
        let id = identity("rpt", None);
        let mut payload = Advert::build(&id, 1_700_000_000, NodeKind::Repeater);
        payload[TIMESTAMP_OFFSET] ^= 0x01;
        assert!(Advert::parse(&payload).is_err());
    }

    #[test]
    fn tampered_appdata_fails_verification() {
        let id = identity("rpt", None);
        let mut payload = Advert::build(&id, 1_700_000_000, NodeKind::Repeater);
        let last = payload.len() - 1;
        payload[last] ^= 0x01;
        assert!(Advert::parse(&payload).is_err());
    }

    #[test]
    fn short_payload_rejected() {
        assert!(matches!(
            Advert::parse(&[0u8; ADVERT_MIN_LEN - 1]),
            Err(ProtocolError::MalformedAdvert(_))
        ));
    }

    #[test]
    fn truncated_location_rejected() {
        // Hand-build a payload whose flags claim a location that is not there.
        let id = identity("rpt", None);
        let keypair = id.keypair();
        let flags = 0x10 | NodeKind::Repeater as u8;
        let appdata = [flags, 1, 2, 3];
        let pubkey = keypair.public().to_bytes();
        let mut signed = Vec::new();
        signed.extend_from_slice(&pubkey);
        signed.extend_from_slice(&1_700_000_000u32.to_le_bytes());
        signed.extend_from_slice(&appdata);
        let signature = keypair.sign(&signed);

        let mut payload = Vec::new();
        payload.extend_from_slice(&pubkey);
        payload.extend_from_slice(&1_700_000_000u32.to_le_bytes());
        payload.extend_from_slice(&signature);
        payload.extend_from_slice(&appdata);
        assert!(matches!(
            Advert::parse(&payload),
            Err(ProtocolError::MalformedAdvert("location truncated"))
        ));
    }
}
