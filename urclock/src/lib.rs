//! # urclock
//!
//! A library for programming AVR parts through urboot and optiboot serial
//! bootloaders.
//!
//! This crate provides the host side of the bootloader conversation:
//!
//! - Get-sync negotiation, including the urboot bootinfo that identifies
//!   the part and the bootloader's features
//! - STK500v1 and urprotocol framing with paged flash and EEPROM access
//! - Bootloader geometry detection from the top-of-flash trailer, the reset
//!   vector or a table of known bootloader images
//! - Image preparation for vector bootloaders: reset redirection, vector
//!   patching and upload metadata
//! - A write guard that never lets a page write cut reset off from the
//!   bootloader
//!
//! ## Features
//!
//! - `native` (default): Native serial port support
//! - `serde`: Serialization support for data types
//!
//! ## Example
//!
//! ```rust,no_run
//! use urclock::{MemoryImage, Session, SessionOptions, TransformOptions, UploadSource};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     #[cfg(feature = "native")]
//!     {
//!         use urclock::{NativePort, SerialConfig};
//!
//!         let port = NativePort::open(&SerialConfig::new("/dev/ttyUSB0", 115200))?;
//!         let mut session = Session::open(port, SessionOptions::default())?;
//!         println!("{} {}", session.part().name, session.version_string());
//!
//!         let mut image = MemoryImage::from_file("blink.hex", session.part().flash_size)?;
//!         let source = UploadSource::from_path("blink.hex");
//!         session.transform_for_upload(&mut image, &TransformOptions::default(), &source)?;
//!         session.upload(&image, &mut |done, total| {
//!             println!("page {done}/{total}");
//!         })?;
//!         session.close()?;
//!     }
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

use std::sync::{Arc, OnceLock};

pub mod bootloader;
pub mod device;
pub mod error;
pub mod image;
pub mod opcode;
pub mod port;
pub mod protocol;
pub mod session;

#[cfg(test)]
pub(crate) mod testing;

static INTERRUPT_CHECKER: OnceLock<Arc<dyn Fn() -> bool + Send + Sync>> = OnceLock::new();

/// Register a global interruption checker used by long-running library loops.
///
/// The checker should return `true` when the current operation should stop,
/// e.g. after Ctrl-C in a CLI. An upload checks it before every page.
pub fn set_interrupt_checker<F>(checker: F)
where
    F: Fn() -> bool + Send + Sync + 'static,
{
    let _ = INTERRUPT_CHECKER.set(Arc::new(checker));
}

/// Returns whether interruption was requested by the embedding application.
#[must_use]
pub fn is_interrupted_requested() -> bool {
    INTERRUPT_CHECKER
        .get()
        .is_some_and(|checker| checker())
}

/// Serialises tests that depend on the global interrupt flag.
#[cfg(test)]
pub(crate) fn interrupt_test_guard() -> std::sync::MutexGuard<'static, ()> {
    static LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());
    LOCK.lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}

#[cfg(test)]
pub(crate) fn test_set_interrupted(value: bool) {
    use std::sync::atomic::{AtomicBool, Ordering};

    static TEST_INTERRUPT_FLAG: OnceLock<Arc<AtomicBool>> = OnceLock::new();

    let flag = TEST_INTERRUPT_FLAG
        .get_or_init(|| {
            let shared = Arc::new(AtomicBool::new(false));
            let checker = Arc::clone(&shared);
            set_interrupt_checker(move || checker.load(Ordering::Relaxed));
            shared
        })
        .clone();

    flag.store(value, Ordering::Relaxed);
}

// Re-exports for convenience
#[cfg(feature = "native")]
pub use port::{NativePort, NativePortEnumerator};
pub use {
    bootloader::{BootloaderGeometry, BootloaderVersion, Capabilities, Features, FlashReader, VectorLevel},
    device::McuDescriptor,
    error::{Error, Result},
    image::{EraseState, MemoryImage, Metadata, TransformOptions, UploadDate, UploadSource},
    port::{Port, PortEnumerator, PortInfo, SerialConfig},
    protocol::{Dialect, Memory, SyncNegotiator},
    session::{BoardId, BoardIdLocation, Session, SessionOptions},
};
