use std::io::{self, Read, Write};
use std::time::Duration;

use serialport::{ClearBuffer, SerialPort};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    /// Nothing arrived within the read timeout. Not an error for a streaming link.
    #[error("read timed out")]
    TimedOut,
    /// Framing, parity or overrun reported by the serial layer. The link is still usable but
    /// whatever is buffered can no longer be trusted.
    #[error("line error: {0}")]
    Line(String),
    /// The device is gone.
    #[error("transport closed: {0}")]
    Closed(#[source] io::Error),
}

/// A point-to-point byte link to the device.
///
/// The engine clones the transport once so the reader thread and the sender each own a handle;
/// implementations must allow one handle to read while another writes.
pub trait Transport: Send {
    /// Reads whatever is available, waiting at most the transport's timeout.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError>;

    /// Writes and flushes one complete frame.
    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()>;

    /// Drops everything received but not read yet.
    fn discard_input(&mut self) -> io::Result<()>;

    fn is_open(&self) -> bool;

    fn try_clone(&self) -> io::Result<Box<dyn Transport>>;

    fn name(&self) -> String;
}

/// [`Transport`] over a real serial port.
pub struct SerialTransport {
    port: Box<dyn SerialPort>,
    open: bool,
}

impl SerialTransport {
    /// Opens `port_name` at `baud_rate`.
    ///
    /// # Arguments
    ///
    /// - `port_name` (`&str`) - The name of the serial port to connect to (e.g., "/dev/ttyACM0").
    /// - `baud_rate` (`u32`) - The baud rate for the serial connection. The sensor hub runs at 1,000,000.
    /// - `timeout` (`Duration`) - Read timeout for the serial port.
    pub fn open(port_name: &str, baud_rate: u32, timeout: Duration) -> io::Result<Self> {
        let mut port: Box<dyn SerialPort> = serialport::new(port_name, baud_rate)
            .timeout(timeout)
            .open()
            .map_err(io::Error::other)?;

        // Sets DTR to true, the board only starts streaming once the host asserts it
        port.write_data_terminal_ready(true)?;
        // Give the device a moment to settle after opening the port
        std::thread::sleep(Duration::from_millis(50));

        Ok(Self::from_port(port))
    }

    pub fn from_port(port: Box<dyn SerialPort>) -> Self {
        Self { port, open: true }
    }
}

impl Transport for SerialTransport {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        match self.port.read(buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::TimedOut => Err(TransportError::TimedOut),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => Err(TransportError::TimedOut),
            // serialport surfaces framing and parity faults as invalid data
            Err(e) if e.kind() == io::ErrorKind::InvalidData => Err(TransportError::Line(e.to_string())),
            Err(e) => {
                self.open = false;
                Err(TransportError::Closed(e))
            }
        }
    }

    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        let result = Write::write_all(&mut self.port, bytes).and_then(|_| self.port.flush());
        if let Err(e) = &result
            && e.kind() != io::ErrorKind::TimedOut
        {
            self.open = false;
        }
        result
    }

    fn discard_input(&mut self) -> io::Result<()> {
        self.port.clear(ClearBuffer::Input).map_err(io::Error::from)
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn try_clone(&self) -> io::Result<Box<dyn Transport>> {
        let port = self.port.try_clone().map_err(io::Error::from)?;
        Ok(Box::new(SerialTransport::from_port(port)))
    }

    fn name(&self) -> String {
        self.port.name().unwrap_or_else(|| "serial".to_string())
    }
}
