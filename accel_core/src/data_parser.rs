use std::collections::VecDeque;
use std::time::{Duration, Instant};

use log::warn;

use crate::constants::packet_constants::{MAGIC_REVERSED, PACKET_SIZE};
use crate::serial_packet::SerialPacket;

/// Minimum spacing between two CRC mismatch warnings.
const CORRUPTION_LOG_INTERVAL: Duration = Duration::from_secs(1);

/// Running totals kept by the parser.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ParserStats {
    pub bytes_read: u64,
    pub packets_accepted: u64,
    pub packets_corrupted: u64,
}

/// Streaming parser that turns serial bytes into CRC-checked packets.
///
/// Packets end with a magic tail instead of starting with a header, so the parser keeps a window
/// of the last `PACKET_SIZE` bytes plus the last 8 bytes as a big-endian integer. Once the window
/// is full and those 8 bytes spell the magic, the window holds one whole candidate packet. Any
/// garbage simply slides through the window until the tail lines up again.
pub struct SerialParser {
    /// The most recent bytes, at most `PACKET_SIZE` of them.
    window: VecDeque<u8>,
    /// The last 8 bytes seen, oldest in the most significant position.
    last_long: u64,
    /// Packets that passed the CRC check and have not been taken yet.
    parsed_packets: VecDeque<SerialPacket>,
    stats: ParserStats,
    last_corruption_log: Option<Instant>,
    suppressed_corruption_logs: u64,
}

impl Default for SerialParser {
    fn default() -> Self {
        Self::new()
    }
}

impl SerialParser {
    pub fn new() -> Self {
        SerialParser {
            window: VecDeque::with_capacity(PACKET_SIZE),
            last_long: 0,
            parsed_packets: VecDeque::new(),
            stats: ParserStats::default(),
            last_corruption_log: None,
            suppressed_corruption_logs: 0,
        }
    }

    /// Feeds new bytes into the parser and queues every packet that completes and passes its
    /// CRC check. Bytes may be split across calls at any offset.
    ///
    /// # Arguments
    ///
    /// - `bytes` (`&[u8]`) - Raw bytes read from the serial stream.
    pub fn parse_bytes(&mut self, bytes: &[u8]) {
        for &byte in bytes {
            self.push_byte(byte);
        }
    }

    fn push_byte(&mut self, byte: u8) {
        self.stats.bytes_read += 1;

        if self.window.len() == PACKET_SIZE {
            self.window.pop_front();
        }
        self.window.push_back(byte);
        // The wire is little-endian, shifting left reverses it into MAGIC_REVERSED.
        self.last_long = (self.last_long << 8) | byte as u64;

        if self.window.len() == PACKET_SIZE && self.last_long == MAGIC_REVERSED {
            let mut candidate = [0u8; PACKET_SIZE];
            for (slot, b) in candidate.iter_mut().zip(self.window.drain(..)) {
                *slot = b;
            }
            self.validate(SerialPacket::from_bytes_unchecked(&candidate));
        }
    }

    fn validate(&mut self, packet: SerialPacket) {
        if packet.is_valid() {
            self.stats.packets_accepted += 1;
            self.parsed_packets.push_back(packet);
            return;
        }

        // A false magic match inside garbage lands here too. The window is already empty so
        // scanning simply continues with the next byte.
        self.stats.packets_corrupted += 1;
        self.log_corruption(&packet);
    }

    fn log_corruption(&mut self, packet: &SerialPacket) {
        let now = Instant::now();
        let due = self
            .last_corruption_log
            .is_none_or(|last| now.duration_since(last) >= CORRUPTION_LOG_INTERVAL);

        if !due {
            self.suppressed_corruption_logs += 1;
            return;
        }

        warn!(
            "Crc32 doesn't match: computed 0x{:08X}, packet carries 0x{:08X} ({} similar suppressed)",
            packet.computed_crc(),
            packet.crc(),
            self.suppressed_corruption_logs
        );
        self.last_corruption_log = Some(now);
        self.suppressed_corruption_logs = 0;
    }

    /// Pops the next validated packet, if available.
    pub fn get_packet(&mut self) -> Option<SerialPacket> {
        self.parsed_packets.pop_front()
    }

    pub fn stats(&self) -> ParserStats {
        self.stats
    }

    /// Number of bytes currently held as a partial candidate.
    pub fn buffered_len(&self) -> usize {
        self.window.len()
    }

    /// Hard reset after a line error: forgets the partial window and the rolling tail, and drops
    /// packets not yet taken. Counters are kept.
    pub fn reset(&mut self) {
        self.window.clear();
        self.last_long = 0;
        self.parsed_packets.clear();
    }

    /// Full reset, counters included.
    pub fn clear(&mut self) {
        self.reset();
        self.stats = ParserStats::default();
        self.last_corruption_log = None;
        self.suppressed_corruption_logs = 0;
    }
}

#[cfg(test)]
mod tests {
    use nalgebra::{Quaternion, Vector3};

    use super::*;
    use crate::constants::packet_constants::{INNER_OFFSET, INNER_SIZE, MAGIC_OFFSET};
    use crate::packets::AccelSample;
    use crate::serial_packet::PacketType;

    fn numbered_packet(n: u8) -> SerialPacket {
        let mut inner = [0u8; INNER_SIZE];
        inner[0] = n;
        inner[INNER_SIZE - 1] = n.wrapping_mul(3);
        SerialPacket::new(PacketType::Text.to_u32(), inner)
    }

    fn stream_of(count: u8) -> Vec<u8> {
        (0..count)
            .flat_map(|n| numbered_packet(n).to_bytes())
            .collect()
    }

    fn drain(parser: &mut SerialParser) -> Vec<SerialPacket> {
        std::iter::from_fn(|| parser.get_packet()).collect()
    }

    #[test]
    fn test_parses_single_packet() {
        let packet = numbered_packet(7);
        let mut parser = SerialParser::new();
        parser.parse_bytes(&packet.to_bytes());

        assert_eq!(parser.get_packet(), Some(packet));
        assert!(parser.get_packet().is_none());
        assert_eq!(parser.buffered_len(), 0);
        assert_eq!(
            parser.stats(),
            ParserStats {
                bytes_read: PACKET_SIZE as u64,
                packets_accepted: 1,
                packets_corrupted: 0,
            }
        );
    }

    #[test]
    fn test_split_at_every_offset_keeps_order() {
        let bytes = stream_of(3);
        for split in 0..=bytes.len() {
            let mut parser = SerialParser::new();
            parser.parse_bytes(&bytes[..split]);
            parser.parse_bytes(&bytes[split..]);

            let packets = drain(&mut parser);
            assert_eq!(packets.len(), 3, "split at {split}");
            for (n, packet) in packets.iter().enumerate() {
                assert_eq!(packet.inner()[0], n as u8);
            }
        }
    }

    #[test]
    fn test_resyncs_after_leading_garbage() {
        let packet = numbered_packet(1);
        let bytes = packet.to_bytes();
        let garbage: Vec<u8> = (0..300u32).map(|i| (i * 37 % 251) as u8).collect();

        let mut parser = SerialParser::new();
        parser.parse_bytes(&garbage);
        assert!(parser.get_packet().is_none());

        parser.parse_bytes(&bytes[..PACKET_SIZE - 1]);
        assert!(parser.get_packet().is_none());

        parser.parse_bytes(&bytes[PACKET_SIZE - 1..]);
        assert_eq!(parser.get_packet(), Some(packet));
        assert!(parser.get_packet().is_none());
        assert_eq!(parser.stats().packets_corrupted, 0);
    }

    #[test]
    fn test_corrupted_accel_packet_is_counted_not_delivered() {
        let sample = AccelSample {
            delta_micros: 10_000,
            accel: Vector3::new(0.0, 9.81, 0.0),
            gyro_quat: Quaternion::identity(),
            gyro_euler: Vector3::zeros(),
        };
        let packet = SerialPacket::from_payload(PacketType::Accel, &sample).unwrap();
        let mut bytes = packet.to_bytes();
        bytes[INNER_OFFSET + 3] ^= 0xFF;

        let mut parser = SerialParser::new();
        parser.parse_bytes(&bytes);

        assert!(parser.get_packet().is_none());
        assert_eq!(parser.stats().packets_corrupted, 1);
        assert_eq!(parser.stats().packets_accepted, 0);
    }

    #[test]
    fn test_corruption_does_not_lose_following_packet() {
        let mut bytes = numbered_packet(1).to_bytes().to_vec();
        bytes[10] ^= 0x01;
        bytes.extend_from_slice(&numbered_packet(2).to_bytes());

        let mut parser = SerialParser::new();
        parser.parse_bytes(&bytes);

        let packets = drain(&mut parser);
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].inner()[0], 2);
        assert_eq!(parser.stats().packets_corrupted, 1);
    }

    #[test]
    fn test_damaged_magic_skips_packet_without_counting() {
        let mut bytes = numbered_packet(1).to_bytes().to_vec();
        bytes[MAGIC_OFFSET] ^= 0x01;
        bytes.extend_from_slice(&numbered_packet(2).to_bytes());

        let mut parser = SerialParser::new();
        parser.parse_bytes(&bytes);

        let packets = drain(&mut parser);
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].inner()[0], 2);
        assert_eq!(parser.stats().packets_corrupted, 0);
    }

    #[test]
    fn test_reset_drops_partial_packet_but_keeps_counters() {
        let bytes = numbered_packet(4).to_bytes();
        let mut parser = SerialParser::new();
        parser.parse_bytes(&bytes[..60]);
        parser.reset();
        assert_eq!(parser.buffered_len(), 0);

        // The tail of the interrupted packet alone cannot complete a window.
        parser.parse_bytes(&bytes[60..]);
        assert!(parser.get_packet().is_none());

        parser.parse_bytes(&bytes);
        assert!(parser.get_packet().is_some());
        assert_eq!(parser.stats().bytes_read, (PACKET_SIZE * 2) as u64);

        parser.clear();
        assert_eq!(parser.stats(), ParserStats::default());
    }
}
