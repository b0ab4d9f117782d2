//! Access to the physical bus.
//!
//! A [`Device`] is a byte-granularity duplex channel. The half-duplex line
//! echoes every transmitted symbol back to the sender; implementations that
//! lack the echo must synthesize it, because the bus handler verifies every
//! sent symbol against the next received one.

use std::io::{ErrorKind, Read, Write};
use std::time::Duration;

use log::debug;

use crate::result::{Error, Result};

/// A byte-granularity duplex channel to the bus.
pub trait Device: Send {
    /// Opens the channel.
    fn open(&mut self) -> Result<()>;

    /// Returns whether the channel is opened and available.
    fn is_valid(&self) -> bool;

    /// Writes a single symbol.
    fn send(&mut self, symbol: u8) -> Result<()>;

    /// Reads a single symbol, waiting at most `timeout`.
    fn recv(&mut self, timeout: Duration) -> Result<u8>;

    /// The transfer latency of the channel, added to every deadline.
    fn latency(&self) -> Duration {
        Duration::ZERO
    }

    /// The channel name, e.g. `/dev/ttyUSB0`.
    fn name(&self) -> &str;
}

/// A [`Device`] backed by a local serial port (2400 Bd, 8N1).
///
/// A directly attached tty has no transfer latency of its own; remote
/// bridges would report one through [`Device::latency`].
pub struct SerialDevice {
    path: String,
    baud_rate: u32,
    port: Option<Box<dyn serialport::SerialPort>>,
}

impl SerialDevice {
    pub fn new(path: &str, baud_rate: u32) -> Self {
        SerialDevice {
            path: path.to_string(),
            baud_rate,
            port: None,
        }
    }

    /// Drops the port on a hard I/O error so the run loop re-opens it.
    fn invalidate(&mut self) {
        debug!("dropping serial port {}", self.path);
        self.port = None;
    }
}

impl Device for SerialDevice {
    fn open(&mut self) -> Result<()> {
        let port = serialport::new(&self.path, self.baud_rate)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .flow_control(serialport::FlowControl::None)
            .timeout(Duration::from_millis(100))
            .open()
            .map_err(|_| Error::Device)?;
        self.port = Some(port);
        Ok(())
    }

    fn is_valid(&self) -> bool {
        self.port.is_some()
    }

    fn send(&mut self, symbol: u8) -> Result<()> {
        let port = self.port.as_mut().ok_or(Error::Device)?;
        match port.write_all(&[symbol]).and_then(|_| port.flush()) {
            Ok(()) => Ok(()),
            Err(_) => {
                self.invalidate();
                Err(Error::Send)
            }
        }
    }

    fn recv(&mut self, timeout: Duration) -> Result<u8> {
        let port = self.port.as_mut().ok_or(Error::Device)?;
        // serialport rejects a zero timeout on some platforms
        let timeout = timeout.max(Duration::from_micros(1));
        port.set_timeout(timeout).map_err(|_| Error::Device)?;
        let mut buf = [0u8; 1];
        match port.read_exact(&mut buf) {
            Ok(()) => Ok(buf[0]),
            Err(err) if err.kind() == ErrorKind::TimedOut || err.kind() == ErrorKind::WouldBlock => {
                Err(Error::Timeout)
            }
            Err(_) => {
                self.invalidate();
                Err(Error::Device)
            }
        }
    }

    fn name(&self) -> &str {
        &self.path
    }
}
