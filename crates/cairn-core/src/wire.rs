//! Cairn wire format — on-wire types for all hub-to-hub communication.
//!
//! These types ARE the protocol. Every field, every size, every reserved byte
//! is part of the wire format; changing anything here is a breaking change.
//!
//! All multi-byte integers are big-endian. All types are #[repr(C, packed)]
//! for deterministic layout and use zerocopy derives for safe,
//! allocation-free serialization. There is no unsafe code in this module.

use static_assertions::assert_eq_size;
use zerocopy::byteorder::{BigEndian, U16, U32};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

// ── Node IDs ──────────────────────────────────────────────────────────────────

/// Node identifier — the first 16 bytes of the BLAKE3 hash of a canonical
/// node name. Used in packet headers for routing and key lookup.
pub type NodeId = [u8; 16];

/// Compute a NodeId from a canonical node name.
/// The input string is the protocol-level name and must never change
/// for a given node once peers have registered its keys.
pub fn node_id(name: &str) -> NodeId {
    let digest = blake3::hash(name.as_bytes());
    let mut id = [0u8; 16];
    id.copy_from_slice(&digest.as_bytes()[..16]);
    id
}

// ── Packet Header ─────────────────────────────────────────────────────────────

/// The logical unit of hub communication, before fragmentation.
///
/// Every encoded packet starts with this header, followed by
/// `payload_len` bytes of AEAD ciphertext and a 16-byte auth tag.
/// The receiver can route and decrypt a packet from the header alone.
///
/// Wire size: 68 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct PacketHeader {
    /// Wire format version. Currently 0x01.
    /// A receiver seeing an unknown version silently drops the packet.
    pub version: u8,

    /// Packet type discriminator — see [`PacketType`].
    pub packet_type: u8,

    /// Bit flags. Reserved, must be zero.
    pub flags: u8,

    /// Reserved, must be zero.
    pub reserved: u8,

    /// UUID identifying this logical packet. Retransmissions reuse it;
    /// a reply carries the id of the packet it answers.
    pub packet_id: [u8; 16],

    /// NodeId of the sender.
    pub src_id: [u8; 16],

    /// NodeId of the destination.
    pub dst_id: [u8; 16],

    /// AES-GCM nonce, fresh random per encoded packet.
    pub nonce: [u8; 12],

    /// Length of the AEAD ciphertext in bytes, excluding the auth tag.
    pub payload_len: U32<BigEndian>,
}

assert_eq_size!(PacketHeader, [u8; 68]);

/// Wire size of [`PacketHeader`].
pub const PACKET_HEADER_LEN: usize = 68;

/// AES-GCM auth tag length appended after the ciphertext.
pub const AUTH_TAG_LEN: usize = 16;

/// AES-GCM nonce length carried in the header.
pub const NONCE_LEN: usize = 12;

/// Current packet format version.
pub const PACKET_VERSION: u8 = 0x01;

// ── Chunk Framing ─────────────────────────────────────────────────────────────

/// Fragmentation frame — prepended to each chunk of an encoded packet.
///
/// Receivers assemble chunks in `chunk_index` order and only emit the
/// reassembled packet when all `chunk_count` distinct indices are present.
///
/// Wire size: 20 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct ChunkHeader {
    /// Packet this chunk belongs to.
    pub packet_id: [u8; 16],

    /// Zero-indexed position of this chunk.
    pub chunk_index: U16<BigEndian>,

    /// Total number of chunks for this packet.
    pub chunk_count: U16<BigEndian>,
}

assert_eq_size!(ChunkHeader, [u8; 20]);

/// Wire size of [`ChunkHeader`].
pub const CHUNK_HEADER_LEN: usize = 20;

// ── Packet Type ───────────────────────────────────────────────────────────────

/// Packet type — declared in the header, governs dispatch.
///
/// The payload body is opaque ciphertext until decryption; the type byte
/// is the only routing information a hub needs before decrypting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    /// A question forwarded by a mini hub to its main hub.
    Query = 0x01,

    /// A signed knowledge capsule, sent in reply to a Query or CapsuleRequest.
    Capsule = 0x02,

    /// Transport acknowledgement of a fully reassembled packet.
    /// Emitted by the simulator, never encoded by hubs.
    Ack = 0x03,

    /// Transport negative-acknowledgement of a lost chunk.
    /// Emitted by the simulator, never encoded by hubs.
    Nak = 0x04,

    /// A signed manifest from a main hub, or an empty poll for one
    /// from a mini hub.
    Manifest = 0x05,

    /// Selective-sync fetch of a single capsule by id.
    CapsuleRequest = 0x06,
}

impl TryFrom<u8> for PacketType {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(PacketType::Query),
            0x02 => Ok(PacketType::Capsule),
            0x03 => Ok(PacketType::Ack),
            0x04 => Ok(PacketType::Nak),
            0x05 => Ok(PacketType::Manifest),
            0x06 => Ok(PacketType::CapsuleRequest),
            other => Err(WireError::UnknownPacketType(other)),
        }
    }
}

impl From<PacketType> for u8 {
    fn from(t: PacketType) -> u8 {
        t as u8
    }
}

// ── Constants ─────────────────────────────────────────────────────────────────

/// Maximum question length accepted by a mini hub, in bytes.
pub const MAX_QUESTION_BYTES: usize = 8192;

// ── Errors ────────────────────────────────────────────────────────────────────

/// Errors that can arise when interpreting wire-format data.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("unknown packet type byte: 0x{0:02x}")]
    UnknownPacketType(u8),

    #[error("unknown packet version: 0x{0:02x}")]
    UnknownVersion(u8),

    #[error("truncated frame: need {needed} bytes, have {got}")]
    Truncated { needed: usize, got: usize },

    #[error("declared payload length {declared} disagrees with frame length {actual}")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("reserved flags are non-zero: 0x{0:02x}")]
    ReservedFlagsSet(u8),
}

// ── Tests ─────────────────────────────────────────────────────────────────────
