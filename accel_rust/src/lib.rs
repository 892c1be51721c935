use accel_core::constants::packet_constants::{INNER_SIZE, PACKET_SIZE};
use accel_core::data_parser::SerialParser;
use accel_core::serial_packet::{FrameError, PacketType, Payload, SerialPacket};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{Receiver, Sender, channel};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thiserror::Error;

pub mod collection;
pub mod mock_serial;
pub mod transport;

use transport::{SerialTransport, Transport, TransportError};

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("already connected")]
    AlreadyConnected,
    #[error("not connected")]
    NotConnected,
    #[error("payload is {got} bytes but packets carry {expected}")]
    InvalidPayloadSize { expected: usize, got: usize },
    #[error(transparent)]
    Frame(FrameError),
    #[error("transport i/o failed: {0}")]
    Io(#[from] io::Error),
}

impl From<FrameError> for ProtocolError {
    fn from(err: FrameError) -> Self {
        match err {
            FrameError::InvalidPayloadSize { expected, got } => {
                ProtocolError::InvalidPayloadSize { expected, got }
            }
            other => ProtocolError::Frame(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// How long one read on the transport may block.
    pub read_timeout: Duration,
    /// Size of the buffer the reader thread reads into.
    pub read_chunk_size: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_millis(10),
            read_chunk_size: 1024,
        }
    }
}

/// Counters shared between the reader thread and the consumer.
#[derive(Default)]
struct Counters {
    bytes_read: AtomicU64,
    packets_accepted: AtomicU64,
    packets_corrupted: AtomicU64,
}

impl Counters {
    fn mirror(&self, parser: &SerialParser) {
        let stats = parser.stats();
        self.bytes_read.store(stats.bytes_read, Ordering::Relaxed);
        self.packets_accepted.store(stats.packets_accepted, Ordering::Relaxed);
        self.packets_corrupted.store(stats.packets_corrupted, Ordering::Relaxed);
    }

    fn zero(&self) {
        self.bytes_read.store(0, Ordering::Relaxed);
        self.packets_accepted.store(0, Ordering::Relaxed);
        self.packets_corrupted.store(0, Ordering::Relaxed);
    }
}

/// Everything that only exists while connected.
struct Connection {
    name: String,
    writer: Box<dyn Transport>,
    packet_receiver: Receiver<SerialPacket>,
    running: Arc<AtomicBool>,
    join_handle: Option<JoinHandle<Box<dyn Transport>>>,
}

impl Connection {
    fn reader_finished(&self) -> bool {
        !self.running.load(Ordering::Relaxed)
            || self.join_handle.as_ref().is_none_or(|h| h.is_finished())
    }
}

/// Serial protocol engine for the sensor hub.
///
/// A background thread reads the transport, frames and validates packets, and queues them on an
/// unbounded channel. The application drains that queue once per frame through [`update`] and
/// [`try_dequeue`], and sends configure packets back with [`send`].
///
/// [`update`]: ProtocolEngine::update
/// [`try_dequeue`]: ProtocolEngine::try_dequeue
/// [`send`]: ProtocolEngine::send
///
/// # Example:
///
/// ```no_run
/// use accel_rust::ProtocolEngine;
///
/// fn main() -> anyhow::Result<()> {
///     let mut engine = ProtocolEngine::default();
///     engine.connect("/dev/ttyACM0", 1_000_000)?;
///
///     loop {
///         engine.update();
///         while let Some(packet) = engine.try_dequeue() {
///             println!("{:?}", packet.packet_type());
///         }
///     }
/// }
/// ```
pub struct ProtocolEngine {
    config: EngineConfig,
    connection: Option<Connection>,
    counters: Arc<Counters>,
    error_sender: Sender<String>,
    error_receiver: Receiver<String>,
}

impl Default for ProtocolEngine {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}

impl ProtocolEngine {
    pub fn new(config: EngineConfig) -> Self {
        debug_assert_eq!(SerialPacket::SIZE, PACKET_SIZE);
        let (error_sender, error_receiver) = channel();
        Self {
            config,
            connection: None,
            counters: Arc::new(Counters::default()),
            error_sender,
            error_receiver,
        }
    }

    /// Opens a serial port and starts reading from it.
    ///
    /// # Arguments
    ///
    /// - `port_name` (`&str`) - The name of the serial port to connect to (e.g., "/dev/ttyACM0").
    /// - `baud_rate` (`u32`) - The baud rate for the serial connection.
    pub fn connect(&mut self, port_name: &str, baud_rate: u32) -> Result<(), ProtocolError> {
        if self.connection.is_some() {
            return Err(ProtocolError::AlreadyConnected);
        }
        let transport = SerialTransport::open(port_name, baud_rate, self.config.read_timeout)?;
        self.connect_with(Box::new(transport))
    }

    /// Starts reading from an already opened transport. All counters start from zero and
    /// nothing from a previous connection survives.
    pub fn connect_with(&mut self, transport: Box<dyn Transport>) -> Result<(), ProtocolError> {
        if self.connection.is_some() {
            return Err(ProtocolError::AlreadyConnected);
        }

        let writer = transport.try_clone()?;
        let name = transport.name();
        self.counters.zero();
        // Errors left over from a previous link
        while self.error_receiver.try_recv().is_ok() {}

        let (packet_sender, packet_receiver) = channel();
        let running = Arc::new(AtomicBool::new(true));
        let handle = spawn_reader(
            transport,
            self.config.read_chunk_size.max(PACKET_SIZE),
            packet_sender,
            self.error_sender.clone(),
            self.counters.clone(),
            running.clone(),
        );

        info!("Connected to {name}");
        self.connection = Some(Connection {
            name,
            writer,
            packet_receiver,
            running,
            join_handle: Some(handle),
        });
        Ok(())
    }

    /// Stops the reader, closes the transport and clears every queue and counter.
    pub fn disconnect(&mut self) -> Result<(), ProtocolError> {
        let mut connection = self.connection.take().ok_or(ProtocolError::NotConnected)?;

        connection.running.store(false, Ordering::Relaxed);
        // The reader hands its transport back so both halves are dropped here, after the join.
        if let Some(handle) = connection.join_handle.take()
            && handle.join().is_err()
        {
            warn!("Reader thread for {} panicked", connection.name);
        }
        while connection.packet_receiver.try_recv().is_ok() {}
        self.counters.zero();

        info!("Disconnected from {}", connection.name);
        Ok(())
    }

    /// Consumer-side pump, called once per frame. Notices a reader that stopped on its own
    /// (device unplugged) and drops the connection.
    ///
    /// # Returns
    ///
    /// - `bool` - Whether the engine is still connected.
    pub fn update(&mut self) -> bool {
        let Some(connection) = &self.connection else {
            return false;
        };
        if !connection.reader_finished() {
            return true;
        }

        warn!("Lost connection to {}", connection.name);
        // The queue may still hold packets the reader got out before it died; they are dropped
        // with the rest of the connection.
        let _ = self.disconnect();
        false
    }

    /// Pops the oldest validated packet without blocking.
    pub fn try_dequeue(&mut self) -> Option<SerialPacket> {
        self.connection
            .as_ref()
            .and_then(|c| c.packet_receiver.try_recv().ok())
    }

    /// Pops the oldest packet and views its payload as `T`.
    ///
    /// Fails with `InvalidPayloadSize` before touching the queue when `T` does not fill a
    /// packet, so a mismatched type never consumes a packet.
    pub fn try_dequeue_typed<T: Payload>(&mut self) -> Result<Option<(SerialPacket, T)>, ProtocolError> {
        if T::SIZE != INNER_SIZE {
            return Err(ProtocolError::InvalidPayloadSize {
                expected: INNER_SIZE,
                got: T::SIZE,
            });
        }
        match self.try_dequeue() {
            Some(packet) => {
                let payload = packet.inner_as::<T>()?;
                Ok(Some((packet, payload)))
            }
            None => Ok(None),
        }
    }

    /// Drains every packet currently queued, in arrival order.
    pub fn drain(&mut self) -> Vec<SerialPacket> {
        std::iter::from_fn(|| self.try_dequeue()).collect()
    }

    /// Writes a pre-built packet to the transport.
    pub fn send_raw(&mut self, packet: &SerialPacket) -> Result<(), ProtocolError> {
        let connection = self.connection.as_mut().ok_or(ProtocolError::NotConnected)?;
        if !connection.writer.is_open() {
            return Err(ProtocolError::NotConnected);
        }

        let started = Instant::now();
        connection.writer.write_all(&packet.to_bytes())?;
        debug!(
            "Sent packet type {} in {:?}",
            packet.packet_type_raw(),
            started.elapsed()
        );
        Ok(())
    }

    /// Builds a packet around `payload` and writes it to the transport.
    pub fn send<T: Payload>(&mut self, packet_type: PacketType, payload: &T) -> Result<(), ProtocolError> {
        if self.connection.is_none() {
            return Err(ProtocolError::NotConnected);
        }
        let packet = SerialPacket::from_payload(packet_type, payload)?;
        self.send_raw(&packet)
    }

    /// Lists the serial ports present on this machine.
    pub fn get_port_names() -> Result<Vec<String>, ProtocolError> {
        let ports = serialport::available_ports().map_err(io::Error::from)?;
        Ok(ports.into_iter().map(|p| p.port_name).collect())
    }

    /// Checks for any errors that have occurred in the background thread.
    ///
    /// # Returns
    ///
    /// - `Option<String>` - `Some(error_message)` if an error has occurred, otherwise `None`.
    pub fn check_error(&self) -> Option<String> {
        self.error_receiver.try_recv().ok()
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    pub fn port_name(&self) -> Option<&str> {
        self.connection.as_ref().map(|c| c.name.as_str())
    }

    /// Packets that passed the CRC check since connecting.
    pub fn packet_count(&self) -> u64 {
        self.counters.packets_accepted.load(Ordering::Relaxed)
    }

    pub fn corrupted_packet_count(&self) -> u64 {
        self.counters.packets_corrupted.load(Ordering::Relaxed)
    }

    pub fn bytes_read(&self) -> u64 {
        self.counters.bytes_read.load(Ordering::Relaxed)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }
}

/// Runs the framer on its own thread until `running` is cleared or the transport closes.
/// The transport is returned on exit.
fn spawn_reader(
    mut transport: Box<dyn Transport>,
    chunk_size: usize,
    sender: Sender<SerialPacket>,
    error_sender: Sender<String>,
    counters: Arc<Counters>,
    running: Arc<AtomicBool>,
) -> JoinHandle<Box<dyn Transport>> {
    thread::spawn(move || {
        let mut parser = SerialParser::new();
        let mut buffer = vec![0u8; chunk_size];

        while running.load(Ordering::Relaxed) {
            match transport.read(&mut buffer) {
                Ok(bytes_read @ 1..) => {
                    parser.parse_bytes(&buffer[..bytes_read]);

                    while let Some(packet) = parser.get_packet() {
                        if sender.send(packet).is_err() {
                            return transport; // Receiver dropped
                        }
                    }
                    // Only after queueing, so a counter never runs ahead of the queue
                    counters.mirror(&parser);
                }
                Ok(0) => {}
                // Timeouts are expected between bursts; just keep reading
                Err(TransportError::TimedOut) => {}
                Err(TransportError::Line(reason)) => {
                    warn!("Serial line error ({reason}), resynchronising");
                    if let Err(e) = transport.discard_input() {
                        warn!("Failed to discard input: {e}");
                    }
                    parser.reset();
                }
                // Anything else means the device is gone
                Err(e @ TransportError::Closed(_)) => {
                    let _ = error_sender.send(e.to_string());
                    running.store(false, Ordering::Relaxed);
                    break;
                }
            }
        }
        transport
    })
}

/// Ensures the reader thread is stopped and the port released when the engine is dropped.
impl Drop for ProtocolEngine {
    fn drop(&mut self) {
        if self.connection.is_some() {
            let _ = self.disconnect();
        }
    }
}

#[cfg(test)]
mod tests {
    use accel_core::packets::{AccelSample, ConfigureKind, ConfigurePacket, TextFragment};
    use nalgebra::{Quaternion, Vector3};

    use super::*;
    use crate::mock_serial::{MockDeviceHandle, MockTransport};

    fn connected() -> (ProtocolEngine, MockDeviceHandle) {
        let (transport, device) = MockTransport::pair(Duration::from_millis(5));
        let mut engine = ProtocolEngine::default();
        engine.connect_with(transport).unwrap();
        (engine, device)
    }

    /// Waits for the reader thread to queue `count` packets.
    fn wait_for_packets(engine: &mut ProtocolEngine, count: usize) -> Vec<SerialPacket> {
        let deadline = Instant::now() + Duration::from_secs(2);
        let mut packets = Vec::new();
        while packets.len() < count && Instant::now() < deadline {
            packets.extend(engine.drain());
            thread::sleep(Duration::from_millis(1));
        }
        packets
    }

    fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(1));
        }
        false
    }

    fn sample() -> AccelSample {
        AccelSample {
            delta_micros: 10_000,
            accel: Vector3::new(0.0, 9.81, 0.0),
            gyro_quat: Quaternion::identity(),
            gyro_euler: Vector3::zeros(),
        }
    }

    #[test]
    fn test_connect_failure() {
        let mut engine = ProtocolEngine::default();
        assert!(engine.connect("invalid_port_name", 1_000_000).is_err());
        assert!(!engine.is_connected());
    }

    #[test]
    fn test_connect_disconnect() {
        let (mut engine, _device) = connected();
        assert!(engine.is_connected());
        assert_eq!(engine.port_name(), Some("mock"));

        let (second, _other) = MockTransport::pair(Duration::from_millis(5));
        assert!(matches!(engine.connect_with(second), Err(ProtocolError::AlreadyConnected)));

        engine.disconnect().unwrap();
        assert!(!engine.is_connected());
        assert!(matches!(engine.disconnect(), Err(ProtocolError::NotConnected)));
    }

    #[test]
    fn test_operations_require_connection() {
        let mut engine = ProtocolEngine::default();
        assert!(!engine.update());
        assert!(engine.try_dequeue().is_none());
        assert!(matches!(
            engine.send(PacketType::Configure, &ConfigurePacket::poll_for_data()),
            Err(ProtocolError::NotConnected)
        ));
    }

    #[test]
    fn test_packets_arrive_in_order() {
        let (mut engine, device) = connected();
        for i in 0..5u8 {
            let text = format!("line {i}");
            device
                .inject_payload(PacketType::Text, &TextFragment::new(text.as_bytes(), false))
                .unwrap();
        }

        let packets = wait_for_packets(&mut engine, 5);
        assert_eq!(packets.len(), 5);
        for (i, packet) in packets.iter().enumerate() {
            let fragment = packet.inner_as::<TextFragment>().unwrap();
            assert_eq!(fragment.bytes(), format!("line {i}").as_bytes());
        }
        assert!(wait_until(|| engine.packet_count() == 5));
        assert_eq!(engine.bytes_read(), 5 * PACKET_SIZE as u64);
    }

    #[test]
    fn test_typed_dequeue() {
        let (mut engine, device) = connected();
        device.inject_payload(PacketType::Accel, &sample()).unwrap();

        assert!(wait_until(|| engine.packet_count() == 1));
        let (packet, payload) = engine.try_dequeue_typed::<AccelSample>().unwrap().unwrap();
        assert_eq!(packet.packet_type(), Some(PacketType::Accel));
        assert_eq!(payload, sample());
    }

    #[test]
    fn test_typed_dequeue_rejects_wrong_size() {
        struct Tiny;
        impl Payload for Tiny {
            const SIZE: usize = 4;
            fn encode(&self) -> Vec<u8> {
                vec![0; 4]
            }
            fn decode(_: &[u8]) -> Self {
                Tiny
            }
        }

        let (mut engine, device) = connected();
        device.inject_payload(PacketType::Accel, &sample()).unwrap();
        assert!(wait_until(|| engine.packet_count() == 1));

        assert!(matches!(
            engine.try_dequeue_typed::<Tiny>(),
            Err(ProtocolError::InvalidPayloadSize { expected: INNER_SIZE, got: 4 })
        ));
        // The packet is still there for a correctly sized reader.
        assert!(engine.try_dequeue().is_some());
    }

    #[test]
    fn test_corrupted_packet_is_counted() {
        let (mut engine, device) = connected();
        let mut bytes = SerialPacket::from_payload(PacketType::Accel, &sample())
            .unwrap()
            .to_bytes();
        bytes[4 + 3] ^= 0xFF;
        device.inject_bytes(&bytes);

        assert!(wait_until(|| engine.corrupted_packet_count() == 1));
        assert_eq!(engine.packet_count(), 0);
        assert!(engine.try_dequeue().is_none());
    }

    #[test]
    fn test_line_error_resets_framer() {
        let (mut engine, device) = connected();
        let packet = SerialPacket::from_payload(PacketType::Accel, &sample()).unwrap();
        let bytes = packet.to_bytes();

        device.inject_bytes(&bytes[..50]);
        device.inject_line_error();
        assert!(wait_until(|| device.discard_count() == 1));

        device.inject_packet(&packet);
        let packets = wait_for_packets(&mut engine, 1);
        assert_eq!(packets, vec![packet]);
        assert!(engine.is_connected());
        assert_eq!(engine.corrupted_packet_count(), 0);
    }

    #[test]
    fn test_send_writes_framed_packet() {
        let (mut engine, device) = connected();
        engine
            .send(PacketType::Configure, &ConfigurePacket::reset())
            .unwrap();

        let written = device.take_written_packets();
        assert_eq!(written.len(), 1);
        let configure = written[0].inner_as::<ConfigurePacket>().unwrap();
        assert_eq!(configure.kind, ConfigureKind::Reset);
    }

    #[test]
    fn test_unplug_disconnects_on_update() {
        let (mut engine, device) = connected();
        assert!(engine.update());

        device.unplug();
        assert!(wait_until(|| !engine.update()));
        assert!(!engine.is_connected());
        assert!(engine.check_error().is_some());
        assert_eq!(engine.packet_count(), 0);
    }

    #[test]
    fn test_reconnect_starts_from_zero() {
        let (mut engine, device) = connected();
        device.inject_payload(PacketType::Accel, &sample()).unwrap();
        assert!(wait_until(|| engine.packet_count() == 1));
        engine.disconnect().unwrap();
        assert_eq!(engine.packet_count(), 0);

        let (transport, device) = MockTransport::pair(Duration::from_millis(5));
        engine.connect_with(transport).unwrap();
        assert!(engine.try_dequeue().is_none());
        device.inject_payload(PacketType::Accel, &sample()).unwrap();
        assert_eq!(wait_for_packets(&mut engine, 1).len(), 1);
        assert!(wait_until(|| engine.packet_count() == 1));
    }

    #[test]
    fn test_counters_never_run_ahead_of_queue() {
        let (mut engine, device) = connected();
        for _ in 0..50 {
            device.inject_payload(PacketType::Accel, &sample()).unwrap();
        }

        let mut dequeued = 0u64;
        let deadline = Instant::now() + Duration::from_secs(2);
        while dequeued < 50 && Instant::now() < deadline {
            let counted = engine.packet_count();
            while engine.try_dequeue().is_some() {
                dequeued += 1;
            }
            assert!(dequeued >= counted, "counted {counted}, dequeued {dequeued}");
        }
        assert_eq!(dequeued, 50);
    }

    #[test]
    fn test_reconnect_discards_old_errors() {
        let (mut engine, device) = connected();
        device.unplug();
        assert!(wait_until(|| !engine.update()));

        let (transport, _device) = MockTransport::pair(Duration::from_millis(5));
        engine.connect_with(transport).unwrap();
        assert!(engine.check_error().is_none());
        assert!(engine.update());
    }
}
