use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::constants::packet_constants::*;
use crate::constants::packet_type_ids;
use crate::utils::crc32_parts;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("expected {expected} bytes for a packet, got {got}")]
    LengthMismatch { expected: usize, got: usize },
    #[error("crc mismatch: computed 0x{computed:08X}, packet carries 0x{carried:08X}")]
    BadCrc { computed: u32, carried: u32 },
    #[error("magic tail 0x{0:016X} does not match")]
    BadMagic(u64),
    #[error("payload is {got} bytes but packets carry {expected}")]
    InvalidPayloadSize { expected: usize, got: usize },
}

/// Discriminator stored in the first field of every packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum PacketType {
    None,
    Accel,
    RawAccel,
    Text,
    Configure,
}

impl PacketType {
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            packet_type_ids::NONE => Some(PacketType::None),
            packet_type_ids::ACCEL => Some(PacketType::Accel),
            packet_type_ids::RAW_ACCEL => Some(PacketType::RawAccel),
            packet_type_ids::TEXT => Some(PacketType::Text),
            packet_type_ids::CONFIGURE => Some(PacketType::Configure),
            _ => None,
        }
    }

    pub fn to_u32(self) -> u32 {
        match self {
            PacketType::None => packet_type_ids::NONE,
            PacketType::Accel => packet_type_ids::ACCEL,
            PacketType::RawAccel => packet_type_ids::RAW_ACCEL,
            PacketType::Text => packet_type_ids::TEXT,
            PacketType::Configure => packet_type_ids::CONFIGURE,
        }
    }
}

/// A typed view of the `inner` bytes of a packet.
///
/// Implementors encode to exactly `SIZE` bytes (trailing zero padding included) and decode from
/// a slice of at least `SIZE` bytes. Decoding never fails: every bit pattern maps to some value,
/// unknown discriminants are preserved rather than rejected.
pub trait Payload: Sized {
    const SIZE: usize;

    fn encode(&self) -> Vec<u8>;

    fn decode(bytes: &[u8]) -> Self;

    /// Fails when this payload type does not fill a packet's inner area exactly.
    fn check_size() -> Result<(), FrameError> {
        if Self::SIZE != INNER_SIZE {
            return Err(FrameError::InvalidPayloadSize {
                expected: INNER_SIZE,
                got: Self::SIZE,
            });
        }
        Ok(())
    }
}

/// Fixed-size wire envelope:
/// `[type u32][inner 112][crc32 u32][magic u64]`, all little-endian.
///
/// The CRC covers `type + inner` only, the magic tail is used purely for resynchronisation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialPacket {
    packet_type: u32,
    inner: [u8; INNER_SIZE],
    crc32: u32,
    magic: u64,
}

impl SerialPacket {
    pub const SIZE: usize = TYPE_SIZE + INNER_SIZE + CRC_SIZE + MAGIC_SIZE;

    /// Builds a packet around raw inner bytes, computing the CRC and setting the magic tail.
    pub fn new(packet_type: u32, inner: [u8; INNER_SIZE]) -> Self {
        let crc32 = Self::compute_crc(packet_type, &inner);
        Self {
            packet_type,
            inner,
            crc32,
            magic: MAGIC,
        }
    }

    /// Builds a packet from a typed payload.
    pub fn from_payload<T: Payload>(packet_type: PacketType, payload: &T) -> Result<Self, FrameError> {
        T::check_size()?;
        let encoded = payload.encode();
        let inner: [u8; INNER_SIZE] = encoded.as_slice().try_into().map_err(|_| {
            FrameError::InvalidPayloadSize {
                expected: INNER_SIZE,
                got: encoded.len(),
            }
        })?;
        Ok(Self::new(packet_type.to_u32(), inner))
    }

    pub fn packet_type_raw(&self) -> u32 {
        self.packet_type
    }

    /// Returns `None` for type ids this build does not know about.
    pub fn packet_type(&self) -> Option<PacketType> {
        PacketType::from_u32(self.packet_type)
    }

    pub fn inner(&self) -> &[u8; INNER_SIZE] {
        &self.inner
    }

    pub fn crc(&self) -> u32 {
        self.crc32
    }

    pub fn magic(&self) -> u64 {
        self.magic
    }

    /// Decodes the inner bytes as `T`.
    pub fn inner_as<T: Payload>(&self) -> Result<T, FrameError> {
        T::check_size()?;
        Ok(T::decode(&self.inner))
    }

    /// True if the carried CRC matches the one computed over `type + inner`.
    pub fn is_valid(&self) -> bool {
        self.computed_crc() == self.crc32
    }

    pub fn computed_crc(&self) -> u32 {
        Self::compute_crc(self.packet_type, &self.inner)
    }

    pub fn to_bytes(&self) -> [u8; PACKET_SIZE] {
        let mut out = [0u8; PACKET_SIZE];
        out[TYPE_OFFSET..INNER_OFFSET].copy_from_slice(&self.packet_type.to_le_bytes());
        out[INNER_OFFSET..CRC_OFFSET].copy_from_slice(&self.inner);
        out[CRC_OFFSET..MAGIC_OFFSET].copy_from_slice(&self.crc32.to_le_bytes());
        out[MAGIC_OFFSET..].copy_from_slice(&self.magic.to_le_bytes());
        out
    }

    /// Splits exactly one packet's worth of bytes into its fields without checking anything.
    pub fn from_bytes_unchecked(bytes: &[u8; PACKET_SIZE]) -> Self {
        let mut inner = [0u8; INNER_SIZE];
        inner.copy_from_slice(&bytes[INNER_OFFSET..CRC_OFFSET]);

        Self {
            packet_type: u32::from_le_bytes(four(&bytes[TYPE_OFFSET..INNER_OFFSET])),
            inner,
            crc32: u32::from_le_bytes(four(&bytes[CRC_OFFSET..MAGIC_OFFSET])),
            magic: u64::from_le_bytes(eight(&bytes[MAGIC_OFFSET..PACKET_SIZE])),
        }
    }

    /// Parses a single packet from `bytes`, requiring the exact size, the magic tail and a
    /// matching CRC.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, FrameError> {
        let bytes: &[u8; PACKET_SIZE] = bytes.try_into().map_err(|_| FrameError::LengthMismatch {
            expected: PACKET_SIZE,
            got: bytes.len(),
        })?;
        let packet = Self::from_bytes_unchecked(bytes);

        if packet.magic != MAGIC {
            return Err(FrameError::BadMagic(packet.magic));
        }
        let computed = packet.computed_crc();
        if computed != packet.crc32 {
            return Err(FrameError::BadCrc {
                computed,
                carried: packet.crc32,
            });
        }
        Ok(packet)
    }

    /// Computes CRC-32 over `[type][inner]`.
    pub fn compute_crc(packet_type: u32, inner: &[u8]) -> u32 {
        crc32_parts(&[&packet_type.to_le_bytes()[..], inner])
    }

    /// Hex dump of the packet grouped into `group_size` byte words.
    pub fn bytes_hex(&self, group_size: usize) -> Vec<String> {
        self.to_bytes()
            .chunks(group_size.max(1))
            .map(|chunk| chunk.iter().map(|b| format!("{b:02X}")).collect())
            .collect()
    }
}

fn four(bytes: &[u8]) -> [u8; 4] {
    [bytes[0], bytes[1], bytes[2], bytes[3]]
}

fn eight(bytes: &[u8]) -> [u8; 8] {
    let mut out = [0u8; 8];
    out.copy_from_slice(&bytes[..8]);
    out
}

const _: () = assert!(SerialPacket::SIZE == PACKET_SIZE);
