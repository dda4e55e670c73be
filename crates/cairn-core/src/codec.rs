//! Packet codec — framing, sealing, and unsealing of wire packets.
//!
//! An encoded packet is a [`PacketHeader`] followed by AEAD ciphertext and
//! the 16-byte auth tag. Encoding seals the plaintext body under the
//! sender–receiver pair key; decoding resolves the key from the header's
//! source id and fails closed on any mismatch.
//!
//! Chunk framing wraps slices of an encoded packet for the simulated link;
//! the codec is symmetric, so `decode(encode(p)) = p` for any packet.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;
use zerocopy::byteorder::{U16, U32};
use zerocopy::{AsBytes, FromBytes};

use crate::crypto::{AeadKey, AeadKeychain, CryptoError};
use crate::manifest::Manifest;
use crate::wire::{
    ChunkHeader, NodeId, PacketHeader, PacketType, WireError, AUTH_TAG_LEN, CHUNK_HEADER_LEN,
    PACKET_HEADER_LEN, PACKET_VERSION,
};

// ── Wire bodies ───────────────────────────────────────────────────────────────

/// Plaintext body of a QUERY packet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryBody {
    pub question: String,
    pub user_id: String,
    /// Canonical node name of the asking mini hub, for the reply route.
    pub reply_to: String,
}

/// Plaintext body of a CAPSULE_REQUEST packet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapsuleRequestBody {
    pub capsule_id: Uuid,
}

/// Plaintext body of a MANIFEST packet.
///
/// Mini hubs poll with `Poll`; main hubs answer (and periodically push)
/// with `Publish`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ManifestBody {
    Poll,
    Publish { manifest: Manifest },
}

// ── Encode / decode ───────────────────────────────────────────────────────────

/// A fully decoded and decrypted packet.
#[derive(Debug, Clone)]
pub struct DecodedPacket {
    pub packet_type: PacketType,
    pub packet_id: Uuid,
    pub src: NodeId,
    pub dst: NodeId,
    pub plaintext: Vec<u8>,
}

/// Seal a plaintext body into an encoded wire packet.
///
/// Retransmissions MUST reuse the bytes returned here rather than
/// re-encoding: a fresh nonce would make the retransmission a different
/// ciphertext, and the queue contract is byte-identical replays.
pub fn encode_packet(
    packet_type: PacketType,
    packet_id: Uuid,
    src: NodeId,
    dst: NodeId,
    plaintext: &[u8],
    key: &AeadKey,
) -> Result<Bytes, CodecError> {
    let (nonce, ciphertext) = key.seal(plaintext)?;

    let header = PacketHeader {
        version: PACKET_VERSION,
        packet_type: packet_type.into(),
        flags: 0,
        reserved: 0,
        packet_id: *packet_id.as_bytes(),
        src_id: src,
        dst_id: dst,
        nonce,
        payload_len: U32::new(plaintext.len() as u32),
    };

    let mut out = Vec::with_capacity(PACKET_HEADER_LEN + ciphertext.len());
    out.extend_from_slice(header.as_bytes());
    out.extend_from_slice(&ciphertext);
    Ok(Bytes::from(out))
}

/// Parse the header of an encoded packet without decrypting.
///
/// The simulator uses this to learn the packet id for fragmentation and
/// ACK/NAK correlation; it never holds AEAD keys.
pub fn peek_header(encoded: &[u8]) -> Result<PacketHeader, WireError> {
    if encoded.len() < PACKET_HEADER_LEN {
        return Err(WireError::Truncated {
            needed: PACKET_HEADER_LEN,
            got: encoded.len(),
        });
    }
    let header = PacketHeader::read_from_prefix(&encoded[..PACKET_HEADER_LEN])
        .ok_or(WireError::Truncated {
            needed: PACKET_HEADER_LEN,
            got: encoded.len(),
        })?;
    if header.version != PACKET_VERSION {
        return Err(WireError::UnknownVersion(header.version));
    }
    if header.flags != 0 {
        return Err(WireError::ReservedFlagsSet(header.flags));
    }
    Ok(header)
}

/// Unseal an encoded packet, resolving the AEAD key from the sender id.
pub fn decode_packet(
    encoded: &[u8],
    keychain: &dyn AeadKeychain,
) -> Result<DecodedPacket, CodecError> {
    let header = peek_header(encoded)?;
    let packet_type = PacketType::try_from(header.packet_type)?;

    let declared = header.payload_len.get() as usize;
    let expected = PACKET_HEADER_LEN + declared + AUTH_TAG_LEN;
    if encoded.len() != expected {
        return Err(CodecError::Wire(WireError::LengthMismatch {
            declared,
            actual: encoded.len().saturating_sub(PACKET_HEADER_LEN + AUTH_TAG_LEN),
        }));
    }

    let src = header.src_id;
    let key = keychain
        .key_for(&src)
        .ok_or_else(|| CodecError::UnknownPeer(hex::encode(src)))?;

    let plaintext = key.open(&header.nonce, &encoded[PACKET_HEADER_LEN..])?;

    Ok(DecodedPacket {
        packet_type,
        packet_id: Uuid::from_bytes(header.packet_id),
        src,
        dst: header.dst_id,
        plaintext,
    })
}

// ── Chunk framing ─────────────────────────────────────────────────────────────

/// Frame one fragment of an encoded packet for the link.
pub fn encode_chunk(packet_id: Uuid, chunk_index: u16, chunk_count: u16, body: &[u8]) -> Bytes {
    let header = ChunkHeader {
        packet_id: *packet_id.as_bytes(),
        chunk_index: U16::new(chunk_index),
        chunk_count: U16::new(chunk_count),
    };
    let mut out = Vec::with_capacity(CHUNK_HEADER_LEN + body.len());
    out.extend_from_slice(header.as_bytes());
    out.extend_from_slice(body);
    Bytes::from(out)
}

/// A parsed chunk frame.
#[derive(Debug, Clone)]
pub struct ChunkFrame {
    pub packet_id: Uuid,
    pub chunk_index: u16,
    pub chunk_count: u16,
    pub body: Bytes,
}

/// Parse a chunk frame received from the link.
pub fn decode_chunk(frame: &Bytes) -> Result<ChunkFrame, WireError> {
    if frame.len() < CHUNK_HEADER_LEN {
        return Err(WireError::Truncated {
            needed: CHUNK_HEADER_LEN,
            got: frame.len(),
        });
    }
    let header =
        ChunkHeader::read_from_prefix(&frame[..CHUNK_HEADER_LEN]).ok_or(WireError::Truncated {
            needed: CHUNK_HEADER_LEN,
            got: frame.len(),
        })?;
    Ok(ChunkFrame {
        packet_id: Uuid::from_bytes(header.packet_id),
        chunk_index: header.chunk_index.get(),
        chunk_count: header.chunk_count.get(),
        body: frame.slice(CHUNK_HEADER_LEN..),
    })
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error(transparent)]
    Wire(#[from] WireError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error("no AEAD key registered for peer {0}")]
    UnknownPeer(String),
}

// ── Tests ─────────────────────────────────────────────────────────────────────
