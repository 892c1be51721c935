//! In-memory stand-in for the sensor hub's serial link.

use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

use accel_core::data_parser::SerialParser;
use accel_core::serial_packet::{FrameError, PacketType, Payload, SerialPacket};

use crate::transport::{Transport, TransportError};

enum Inbound {
    Bytes(VecDeque<u8>),
    LineError,
}

#[derive(Default)]
struct MockState {
    to_host: VecDeque<Inbound>,
    from_host: Vec<u8>,
    unplugged: bool,
    discards: usize,
}

#[derive(Default)]
struct Shared {
    state: Mutex<MockState>,
    ready: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, MockState> {
        // A panicking test thread must not take every other handle down with it.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Host side of a mocked link. Reads block for up to the timeout like a real port.
pub struct MockTransport {
    shared: Arc<Shared>,
    timeout: Duration,
}

/// Device side of a mocked link, used by tests to play the sensor hub.
#[derive(Clone)]
pub struct MockDeviceHandle {
    shared: Arc<Shared>,
}

impl MockTransport {
    /// Creates a connected transport/device pair.
    pub fn pair(timeout: Duration) -> (Box<dyn Transport>, MockDeviceHandle) {
        let shared = Arc::new(Shared::default());
        let transport = MockTransport {
            shared: shared.clone(),
            timeout,
        };
        (Box::new(transport), MockDeviceHandle { shared })
    }
}

impl Transport for MockTransport {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        let guard = self.shared.lock();
        let (mut state, _) = self
            .shared
            .ready
            .wait_timeout_while(guard, self.timeout, |s| s.to_host.is_empty() && !s.unplugged)
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if state.unplugged {
            return Err(TransportError::Closed(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "mock device unplugged",
            )));
        }

        match state.to_host.pop_front() {
            None => Err(TransportError::TimedOut),
            Some(Inbound::LineError) => Err(TransportError::Line("mock framing error".to_string())),
            Some(Inbound::Bytes(mut bytes)) => {
                let n = bytes.len().min(buf.len());
                for (slot, b) in buf.iter_mut().zip(bytes.drain(..n)) {
                    *slot = b;
                }
                if !bytes.is_empty() {
                    state.to_host.push_front(Inbound::Bytes(bytes));
                }
                Ok(n)
            }
        }
    }

    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        let mut state = self.shared.lock();
        if state.unplugged {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "mock device unplugged"));
        }
        state.from_host.extend_from_slice(bytes);
        Ok(())
    }

    fn discard_input(&mut self) -> io::Result<()> {
        let mut state = self.shared.lock();
        state.to_host.clear();
        state.discards += 1;
        Ok(())
    }

    fn is_open(&self) -> bool {
        !self.shared.lock().unplugged
    }

    fn try_clone(&self) -> io::Result<Box<dyn Transport>> {
        Ok(Box::new(MockTransport {
            shared: self.shared.clone(),
            timeout: self.timeout,
        }))
    }

    fn name(&self) -> String {
        "mock".to_string()
    }
}

impl MockDeviceHandle {
    fn push(&self, inbound: Inbound) {
        self.shared.lock().to_host.push_back(inbound);
        self.shared.ready.notify_all();
    }

    /// Queues raw bytes for the host to read.
    pub fn inject_bytes(&self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        self.push(Inbound::Bytes(bytes.iter().copied().collect()));
    }

    pub fn inject_packet(&self, packet: &SerialPacket) {
        self.inject_bytes(&packet.to_bytes());
    }

    pub fn inject_payload<T: Payload>(&self, packet_type: PacketType, payload: &T) -> Result<(), FrameError> {
        let packet = SerialPacket::from_payload(packet_type, payload)?;
        self.inject_packet(&packet);
        Ok(())
    }

    /// Makes the host's next read report a framing error.
    pub fn inject_line_error(&self) {
        self.push(Inbound::LineError);
    }

    /// Simulates the cable being pulled: every further read or write fails.
    pub fn unplug(&self) {
        self.shared.lock().unplugged = true;
        self.shared.ready.notify_all();
    }

    /// Everything the host has written so far.
    pub fn written_bytes(&self) -> Vec<u8> {
        self.shared.lock().from_host.clone()
    }

    /// Parses and removes the packets the host has written so far.
    pub fn take_written_packets(&self) -> Vec<SerialPacket> {
        let bytes = std::mem::take(&mut self.shared.lock().from_host);
        let mut parser = SerialParser::new();
        parser.parse_bytes(&bytes);
        std::iter::from_fn(|| parser.get_packet()).collect()
    }

    /// How many times the host discarded its receive buffer.
    pub fn discard_count(&self) -> usize {
        self.shared.lock().discards
    }

    /// True once the host has read everything injected so far.
    pub fn is_drained(&self) -> bool {
        self.shared.lock().to_host.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use accel_core::constants::packet_constants::INNER_SIZE;

    #[test]
    fn test_read_times_out_when_idle() {
        let (mut transport, _device) = MockTransport::pair(Duration::from_millis(5));
        let mut buf = [0u8; 16];
        assert!(matches!(transport.read(&mut buf), Err(TransportError::TimedOut)));
    }

    #[test]
    fn test_partial_reads_keep_remaining_bytes() {
        let (mut transport, device) = MockTransport::pair(Duration::from_millis(5));
        device.inject_bytes(&[1, 2, 3, 4, 5]);

        let mut buf = [0u8; 3];
        assert_eq!(transport.read(&mut buf).unwrap(), 3);
        assert_eq!(buf, [1, 2, 3]);
        assert_eq!(transport.read(&mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], &[4, 5]);
        assert!(device.is_drained());
    }

    #[test]
    fn test_line_error_and_unplug() {
        let (mut transport, device) = MockTransport::pair(Duration::from_millis(5));
        device.inject_line_error();
        let mut buf = [0u8; 4];
        assert!(matches!(transport.read(&mut buf), Err(TransportError::Line(_))));

        device.unplug();
        assert!(!transport.is_open());
        assert!(matches!(transport.read(&mut buf), Err(TransportError::Closed(_))));
        assert!(transport.write_all(&[0]).is_err());
    }

    #[test]
    fn test_written_packets_are_parsed_back() {
        let (mut transport, device) = MockTransport::pair(Duration::from_millis(5));
        let packet = SerialPacket::new(PacketType::Configure.to_u32(), [7u8; INNER_SIZE]);
        transport.write_all(&packet.to_bytes()).unwrap();

        assert_eq!(device.take_written_packets(), vec![packet]);
        assert!(device.written_bytes().is_empty());
    }
}
