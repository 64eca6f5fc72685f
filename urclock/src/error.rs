//! Error types for urclock.

use std::io;
use thiserror::Error;

/// Result type for urclock operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for urclock operations.
///
/// Everything except [`Error::Io`] and [`Error::Serial`] leaves the session
/// usable; transport failures should be treated as fatal.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (serial port, file operations).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serial port error.
    #[cfg(feature = "native")]
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// Malformed input file.
    #[error("invalid image: {0}")]
    InvalidImage(String),

    /// No stable reply to the get-sync handshake.
    #[error("not in sync with the bootloader after {attempts} attempts")]
    SyncFailure {
        /// Number of attempts made.
        attempts: usize,
    },

    /// A response byte did not match the negotiated INSYNC/OK constant.
    #[error("protocol expects {what} byte {expected:#04x} but got {actual:#04x}")]
    ProtocolMismatch {
        /// Which protocol byte was checked ("sync" or "OK").
        what: &'static str,
        /// Negotiated value.
        expected: u8,
        /// Received value.
        actual: u8,
    },

    /// Communication timeout.
    #[error("timeout: {0}")]
    Timeout(String),

    /// The bootloader cannot perform the requested operation.
    #[error("capability: {0}")]
    Capability(String),

    /// Bootloader start address could not be established.
    #[error("unknown bootloader geometry: {0}")]
    GeometryUnknown(String),

    /// Input data overlaps the bootloader or the metadata block.
    #[error("overlap: {0}")]
    Overlap(String),

    /// Writing the input would break the path into the bootloader.
    #[error("unsafe upload: {0}")]
    Safety(String),

    /// Length or address outside what the device or protocol accepts.
    #[error("size: {0}")]
    Size(String),

    /// MCU could not be identified from id, signature or name.
    #[error("unknown MCU: {0}")]
    UnknownMcu(String),

    /// Invalid option or override.
    #[error("configuration error: {0}")]
    Config(String),

    /// Operation stopped by the embedding application.
    #[error("operation interrupted")]
    Interrupted,
}

impl Error {
    /// Whether the session can still be used after this error.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Io(_) | Self::Timeout(_) => false,
            #[cfg(feature = "native")]
            Self::Serial(_) => false,
            _ => true,
        }
    }
}
