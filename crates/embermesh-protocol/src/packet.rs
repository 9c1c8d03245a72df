//! Packet framing and the dedup packet id
//!
//! Wire layout: `header(1) || path_len(1) || payload_len(1) || path || payload`.
//!
//! The header byte packs the route type (bits 0-1), payload type (bits 2-5)
//! and payload version (bits 6-7). Decoding is strict: declared lengths must
//! match the frame exactly; a frame is never silently truncated or padded.

use crate::error::{ProtocolError, Result};

/// Maximum hops recorded in a packet path (one node hash per hop)
pub const MAX_PATH_LEN: usize = 64;

/// Maximum payload bytes per packet
pub const MAX_PAYLOAD_LEN: usize = 180;

/// Fixed frame header: header byte plus the two length bytes
pub const FRAME_HEADER_LEN: usize = 3;

const ROUTE_MASK: u8 = 0x03;
const TYPE_SHIFT: u8 = 2;
const TYPE_MASK: u8 = 0x0F;
const VERSION_SHIFT: u8 = 6;
const VERSION_MASK: u8 = 0x03;

/// How a packet traverses the mesh
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RouteType {
    /// Flood within a transport segment
    TransportFlood = 0,
    /// Plain flood: every repeater re-emits once
    Flood = 1,
    /// Source-routed: next hop peels itself off the path
    Direct = 2,
    /// Source-routed within a transport segment
    TransportDirect = 3,
}

impl RouteType {
    /// Decode from the low two header bits
    pub fn from_bits(bits: u8) -> RouteType {
        match bits & ROUTE_MASK {
            0 => RouteType::TransportFlood,
            1 => RouteType::Flood,
            2 => RouteType::Direct,
            _ => RouteType::TransportDirect,
        }
    }

    /// True for flood-style relaying
    pub fn is_flood(self) -> bool {
        matches!(self, RouteType::Flood | RouteType::TransportFlood)
    }

    /// True for source-routed relaying
    pub fn is_direct(self) -> bool {
        matches!(self, RouteType::Direct | RouteType::TransportDirect)
    }

    /// True for the transport-segment variants
    pub fn is_transport(self) -> bool {
        matches!(self, RouteType::TransportFlood | RouteType::TransportDirect)
    }
}

/// What the payload carries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PayloadType {
    /// Addressed request to a node
    Request = 0,
    /// Addressed response from a node
    Response = 1,
    /// Encrypted text message
    TextMessage = 2,
    /// Delivery acknowledgement
    Ack = 3,
    /// Signed node advertisement
    Advert = 4,
    /// Group channel text
    GroupText = 5,
    /// Group channel data
    GroupData = 6,
    /// Anonymous request (login handshake)
    AnonRequest = 7,
    /// Returned path notification
    Path = 8,
    /// Route trace probe
    Trace = 9,
    /// Multipart fragment
    Multipart = 10,
    /// Control/administrative payload
    Control = 11,
    /// Application-defined raw payload
    RawCustom = 15,
}

impl PayloadType {
    /// Decode from the four payload-type header bits
    pub fn from_bits(bits: u8) -> Option<PayloadType> {
        match bits & TYPE_MASK {
            0 => Some(PayloadType::Request),
            1 => Some(PayloadType::Response),
            2 => Some(PayloadType::TextMessage),
            3 => Some(PayloadType::Ack),
            4 => Some(PayloadType::Advert),
            5 => Some(PayloadType::GroupText),
            6 => Some(PayloadType::GroupData),
            7 => Some(PayloadType::AnonRequest),
            8 => Some(PayloadType::Path),
            9 => Some(PayloadType::Trace),
            10 => Some(PayloadType::Multipart),
            11 => Some(PayloadType::Control),
            15 => Some(PayloadType::RawCustom),
            _ => None,
        }
    }
}

/// A decoded mesh packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Route type from the header
    pub route: RouteType,
    /// Payload type from the header
    pub payload_type: PayloadType,
    /// Payload version bits
    pub version: u8,
    path: Vec<u8>,
    payload: Vec<u8>,
}

impl Packet {
    /// Build a packet with an empty path
    pub fn new(route: RouteType, payload_type: PayloadType, payload: Vec<u8>) -> Result<Packet> {
        if payload.len() > MAX_PAYLOAD_LEN {
            return Err(ProtocolError::PayloadTooLong(payload.len()));
        }
        Ok(Packet {
            route,
            payload_type,
            version: 0,
            path: Vec::new(),
            payload,
        })
    }

    /// Packed header byte
    pub fn header_byte(&self) -> u8 {
        (self.route as u8)
            | ((self.payload_type as u8) << TYPE_SHIFT)
            | ((self.version & VERSION_MASK) << VERSION_SHIFT)
    }

    /// Hop path (node hashes, oldest first)
    pub fn path(&self) -> &[u8] {
        &self.path
    }

    /// Payload bytes
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// True when `hash` already appears in the path
    pub fn path_contains(&self, hash: u8) -> bool {
        self.path.contains(&hash)
    }

    /// Append our hash to the path; fails when the path is full
    pub fn push_path_hash(&mut self, hash: u8) -> Result<()> {
        if self.path.len() >= MAX_PATH_LEN {
            return Err(ProtocolError::PathFull);
        }
        self.path.push(hash);
        Ok(())
    }

    /// Remove and return the first path hash (direct-route hop peel)
    pub fn peel_path(&mut self) -> Option<u8> {
        if self.path.is_empty() {
            None
        } else {
            Some(self.path.remove(0))
        }
    }

    /// Encode to wire bytes
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(FRAME_HEADER_LEN + self.path.len() + self.payload.len());
        out.push(self.header_byte());
        out.push(self.path.len() as u8);
        out.push(self.payload.len() as u8);
        out.extend_from_slice(&self.path);
        out.extend_from_slice(&self.payload);
        out
    }

    /// Decode from wire bytes, rejecting any length disagreement
    pub fn decode(frame: &[u8]) -> Result<Packet> {
        if frame.len() < FRAME_HEADER_LEN {
            return Err(ProtocolError::FrameTooShort(frame.len()));
        }
        let header = frame[0];
        let path_len = frame[1] as usize;
        let payload_len = frame[2] as usize;
        if path_len > MAX_PATH_LEN {
            return Err(ProtocolError::PathTooLong(path_len));
        }
        if payload_len > MAX_PAYLOAD_LEN {
            return Err(ProtocolError::PayloadTooLong(payload_len));
        }
        let declared = FRAME_HEADER_LEN + path_len + payload_len;
        if declared != frame.len() {
            return Err(ProtocolError::LengthMismatch {
                declared,
                actual: frame.len(),
            });
        }
        let payload_type = PayloadType::from_bits(header >> TYPE_SHIFT)
            .ok_or(ProtocolError::UnknownPayloadType((header >> TYPE_SHIFT) & TYPE_MASK))?;
        Ok(Packet {
            route: RouteType::from_bits(header),
            payload_type,
            version: (header >> VERSION_SHIFT) & VERSION_MASK,
            path: frame[FRAME_HEADER_LEN..FRAME_HEADER_LEN + path_len].to_vec(),
            payload: frame[FRAME_HEADER_LEN + path_len..declared].to_vec(),
        })
    }

    /// Dedup id over the stable fields: header byte, payload length and the
    /// first 16 payload bytes. The path is excluded because it mutates at
    /// every hop and would defeat duplicate suppression.
    pub fn packet_id(&self) -> u32 {
        let mut hash = djb2_init();
        hash = djb2_step(hash, self.header_byte());
        hash = djb2_step(hash, self.payload.len() as u8);
        for &byte in self.payload.iter().take(16) {
            hash = djb2_step(hash, byte);
        }
        hash
    }
}

#[inline]
fn djb2_init() -> u32 {
    5381
}

#[inline]
fn djb2_step(hash: u32, byte: u8) -> u32 {
    (hash.wrapping_shl(5).wrapping_add(hash)) ^ byte as u32
}
