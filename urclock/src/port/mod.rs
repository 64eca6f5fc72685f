//! Byte transport between the host and the bootloader.
//!
//! The protocol layer only ever talks to a [`Port`]: it sends whole frames,
//! receives an exact number of reply bytes within the current timeout and
//! drains stale input before re-synchronising. On native platforms
//! [`NativePort`] wraps the `serialport` crate.
//!
//! ```text
//! +-------------------+
//! |  Session / Sync   |
//! +---------+---------+
//!           |
//!           v
//! +---------+---------+
//! |    Port trait     |
//! +---------+---------+
//!           |
//!           v
//! +---------+---------+
//! | NativePort (8N1)  |
//! +-------------------+
//! ```
//!
//! ## Example
//!
//! ```rust,no_run
//! use urclock::port::Port;
//!
//! fn ping<P: Port>(port: &mut P) -> urclock::Result<[u8; 2]> {
//!     port.send(&[0x30, 0x20])?;
//!     let mut reply = [0u8; 2];
//!     port.recv(&mut reply)?;
//!     Ok(reply)
//! }
//! ```

#[cfg(feature = "native")]
pub mod native;

use std::io::{ErrorKind, Read, Write};
use std::time::Duration;

use log::trace;

use crate::error::{Error, Result};

/// Serial port configuration.
///
/// Bootloaders always talk 8N1 without flow control, so only the port, baud
/// rate and initial timeout are configurable.
#[derive(Debug, Clone)]
pub struct SerialConfig {
    /// Port name/path (e.g., "/dev/ttyUSB0", "COM3").
    pub port_name: String,
    /// Baud rate.
    pub baud_rate: u32,
    /// Read timeout.
    pub timeout: Duration,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port_name: String::new(),
            baud_rate: 115200,
            timeout: Duration::from_millis(100),
        }
    }
}

impl SerialConfig {
    /// Create a new configuration with port name and baud rate.
    pub fn new(port_name: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port_name: port_name.into(),
            baud_rate,
            ..Default::default()
        }
    }

    /// Set the timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Serial port information.
#[derive(Debug, Clone)]
pub struct PortInfo {
    /// Port name/path.
    pub name: String,
    /// USB vendor ID (if available).
    pub vid: Option<u16>,
    /// USB product ID (if available).
    pub pid: Option<u16>,
    /// Manufacturer string (if available).
    pub manufacturer: Option<String>,
    /// Product string (if available).
    pub product: Option<String>,
}

/// Byte transport used by the bootloader protocol.
///
/// `read` is expected to block for at most [`Port::timeout`] and to report
/// an expired timeout as [`ErrorKind::TimedOut`] (or [`ErrorKind::WouldBlock`]).
pub trait Port: Read + Write + Send {
    /// Set the read timeout.
    fn set_timeout(&mut self, timeout: Duration) -> Result<()>;

    /// Get the current timeout.
    fn timeout(&self) -> Duration;

    /// Discard pending input and output.
    fn clear_buffers(&mut self) -> Result<()>;

    /// Get the port name/path.
    fn name(&self) -> &str;

    /// Set DTR (Data Terminal Ready) pin state.
    fn set_dtr(&mut self, level: bool) -> Result<()>;

    /// Set RTS (Request To Send) pin state.
    fn set_rts(&mut self, level: bool) -> Result<()>;

    /// Close the port and release resources.
    fn close(&mut self) -> Result<()>;

    /// Drive DTR and RTS together; `true` asserts both lines.
    fn set_dtr_rts(&mut self, level: bool) -> Result<()> {
        self.set_dtr(level)?;
        self.set_rts(level)
    }

    /// Write a complete frame and flush it.
    fn send(&mut self, buf: &[u8]) -> Result<()> {
        trace!("send {:02x?}", buf);
        Write::write_all(self, buf)?;
        Write::flush(self)?;
        Ok(())
    }

    /// Fill `buf` completely or fail with [`Error::Timeout`].
    fn recv(&mut self, buf: &mut [u8]) -> Result<()> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.read(&mut buf[filled..]) {
                Ok(0) => {
                    return Err(Error::Timeout(format!(
                        "port closed after {filled} of {} bytes",
                        buf.len()
                    )));
                },
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => {},
                Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => {
                    return Err(Error::Timeout(format!(
                        "received {filled} of {} bytes within {} ms",
                        buf.len(),
                        self.timeout()
                            .as_millis()
                    )));
                },
                Err(e) => return Err(e.into()),
            }
        }
        trace!("recv {:02x?}", buf);
        Ok(())
    }

    /// Throw away whatever the device has sent so far.
    fn drain(&mut self) -> Result<()> {
        self.clear_buffers()
    }
}

/// Trait for listing available serial ports.
///
/// This is separated from `Port` because it's a static operation that
/// doesn't require an open port instance.
pub trait PortEnumerator {
    /// List all available serial ports.
    fn list_ports() -> Result<Vec<PortInfo>>;
}

#[cfg(feature = "native")]
pub use native::{NativePort, NativePortEnumerator};
