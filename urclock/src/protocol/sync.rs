//! Get-sync handshake and bootinfo decoding.
//!
//! Urboot answers `GET_SYNC` with a pair of bytes that replaces the classic
//! `INSYNC`/`OK` for the rest of the session. The pair encodes a 16-bit
//! *bootinfo*: the MCU id the bootloader was built for and a few feature
//! bits. Legacy bootloaders answer the classic `0x14 0x10`.
//!
//! ```text
//! bootinfo = features * 2040 + mcu_id
//! insync   = bootinfo / 255
//! ok       = bootinfo % 255, plus one if >= insync
//! ```
//!
//! `insync` and `ok` never coincide, and the pair that would collide with
//! `0x14 0x10` is sent as `255 254` instead.

use std::thread;
use std::time::Duration;

use log::{debug, warn};

use crate::bootloader::Features;
use crate::error::{Error, Result};
use crate::port::Port;
use crate::protocol::stk500::{Dialect, EOP, Frame, RESP_INSYNC, RESP_OK};

/// Default number of get-sync attempts.
pub const MAX_SYNC_ATTEMPTS: usize = 20;

/// Per-attempt reply timeout while syncing.
pub const SYNC_TIMEOUT: Duration = Duration::from_millis(100);

/// Reply timeout once in sync.
pub const SESSION_TIMEOUT: Duration = Duration::from_millis(500);

/// Number of distinct MCU ids the bootinfo can carry.
pub const MCU_ID_SPACE: u16 = 2040;

/// Pair sent in place of the one that would read as a legacy reply.
const ALIAS: (u8, u8) = (255, 254);

/// What a urboot bootloader tells about itself during sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootInfo {
    /// Part the bootloader was built for.
    pub mcu_id: u16,
    /// Feature bits.
    pub features: Features,
}

/// Result of a successful sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncOutcome {
    /// Framing to use for the session.
    pub dialect: Dialect,
    /// First byte of every reply from now on.
    pub insync: u8,
    /// Last byte of every reply from now on.
    pub ok: u8,
    /// Decoded bootinfo; `None` for legacy bootloaders.
    pub bootinfo: Option<BootInfo>,
}

impl SyncOutcome {
    /// Check the leading reply byte.
    pub fn check_insync(&self, actual: u8) -> Result<()> {
        if actual == self.insync {
            Ok(())
        } else {
            Err(Error::ProtocolMismatch {
                what: "sync",
                expected: self.insync,
                actual,
            })
        }
    }

    /// Check the trailing reply byte.
    pub fn check_ok(&self, actual: u8) -> Result<()> {
        if actual == self.ok {
            Ok(())
        } else {
            Err(Error::ProtocolMismatch {
                what: "OK",
                expected: self.ok,
                actual,
            })
        }
    }

    /// Features announced by the bootloader; empty for legacy ones.
    pub fn features(&self) -> Features {
        self.bootinfo
            .map(|b| b.features)
            .unwrap_or_else(Features::empty)
    }
}

/// Decode a stable sync pair. Returns `None` for the classic legacy pair.
pub fn decode_bootinfo(insync: u8, ok: u8) -> Option<BootInfo> {
    if (insync, ok) == (RESP_INSYNC, RESP_OK) {
        return None;
    }

    let (insync, ok) = if (insync, ok) == ALIAS {
        (RESP_INSYNC, RESP_OK)
    } else if ok > insync {
        (insync, ok - 1)
    } else {
        (insync, ok)
    };

    let bootinfo = u16::from(insync) * 255 + u16::from(ok);
    Some(BootInfo {
        mcu_id: bootinfo % MCU_ID_SPACE,
        features: Features::from_bits_retain((bootinfo / MCU_ID_SPACE) as u8),
    })
}

/// Sync pair a urboot bootloader sends for `mcu_id` and `features`.
///
/// `mcu_id` 2039 with all five feature bits set shares its pair with the
/// alias and cannot be represented.
pub fn encode_bootinfo(mcu_id: u16, features: u8) -> (u8, u8) {
    let bootinfo = u32::from(features & 0x1f) * u32::from(MCU_ID_SPACE)
        + u32::from(mcu_id % MCU_ID_SPACE);
    let insync = (bootinfo / 255) as u8;
    let mut ok = (bootinfo % 255) as u8;
    if ok >= insync {
        ok += 1;
    }
    if (insync, ok) == (RESP_INSYNC, RESP_OK) {
        ALIAS
    } else {
        (insync, ok)
    }
}

/// Bounded get-sync loop.
///
/// A reply only counts once the same pair arrives on two consecutive
/// attempts, which weeds out line noise and bytes from a still running
/// application.
///
/// Only the first attempt sends `GET_SYNC`; later ones send `EOP EOP`
/// unless strict. Some optiboot builds swallow the first byte while they
/// blink their LED and would bail on a command byte where they expect
/// `EOP`. Strict mode sends `GET_SYNC` throughout for bootloaders that
/// insist on well-formed commands.
#[derive(Debug, Clone)]
pub struct SyncNegotiator {
    attempts: usize,
    timeout: Duration,
    backoff: Duration,
    strict: bool,
}

impl Default for SyncNegotiator {
    fn default() -> Self {
        Self {
            attempts: MAX_SYNC_ATTEMPTS,
            timeout: SYNC_TIMEOUT,
            backoff: Duration::from_millis(32),
            strict: false,
        }
    }
}

impl SyncNegotiator {
    /// Create a negotiator with the default budget.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of attempts.
    #[must_use]
    pub fn with_attempts(mut self, attempts: usize) -> Self {
        self.attempts = attempts.max(1);
        self
    }

    /// Set the per-attempt reply timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the pause after the first attempt that got no reply; it doubles
    /// with each attempt up to eight times this value.
    #[must_use]
    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    /// Send `GET_SYNC` on every attempt.
    #[must_use]
    pub fn with_strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    /// Pause after attempt `attempt` (counted from 0) timed out.
    fn pause(&self, attempt: usize) -> Duration {
        self.backoff * (1u32 << attempt.min(3))
    }

    /// Run the handshake. On success the port timeout is raised to
    /// [`SESSION_TIMEOUT`].
    pub fn negotiate<P: Port + ?Sized>(&self, port: &mut P) -> Result<SyncOutcome> {
        port.set_timeout(self.timeout)?;
        let get_sync = Frame::get_sync().build();
        let mut last: Option<[u8; 2]> = None;
        let mut stable = None;

        for attempt in 0..self.attempts {
            // Stale bytes would pose as a stable reply
            port.drain()?;
            if attempt == 0 || self.strict {
                port.send(&get_sync)?;
            } else {
                port.send(&[EOP, EOP])?;
            }

            let mut reply = [0u8; 2];
            match port.recv(&mut reply) {
                Ok(()) if last == Some(reply) && reply[0] != reply[1] => {
                    stable = Some(reply);
                    break;
                },
                Ok(()) => {
                    debug!("sync reply {:02x} {:02x}", reply[0], reply[1]);
                    last = Some(reply);
                },
                Err(Error::Timeout(_)) => {
                    let pause = self.pause(attempt);
                    if !pause.is_zero() {
                        debug!("sleeping for {} ms", pause.as_millis());
                        thread::sleep(pause);
                    }
                },
                Err(e) => return Err(e),
            }

            if attempt >= 2 {
                warn!("attempt {} of {}: not in sync", attempt + 1, self.attempts);
            }
        }

        let Some([insync, ok]) = stable else {
            return Err(Error::SyncFailure {
                attempts: self.attempts,
            });
        };
        if !self.strict {
            realign(port)?;
        }
        port.drain()?;
        port.set_timeout(SESSION_TIMEOUT)?;

        let bootinfo = decode_bootinfo(insync, ok);
        let dialect = if bootinfo.is_some() {
            Dialect::Native
        } else {
            Dialect::Legacy
        };
        debug!("in sync: {} ({insync:#04x} {ok:#04x})", dialect.name());

        Ok(SyncOutcome {
            dialect,
            insync,
            ok,
            bootinfo,
        })
    }
}

/// A bootloader that missed one byte of the first request is one `EOP`
/// short. A lone `EOP` either completes that request, and is answered, or
/// starts a new one that another `EOP` completes.
fn realign<P: Port + ?Sized>(port: &mut P) -> Result<()> {
    port.send(&[EOP])?;
    let mut reply = [0u8; 1];
    match port.recv(&mut reply) {
        Ok(()) => Ok(()),
        Err(Error::Timeout(_)) => {
            debug!("not out of step, completing the lone EOP");
            port.send(&[EOP])
        },
        Err(e) => Err(e),
    }
}
