//! What we know about the bootloader sitting in high flash.
//!
//! [`detect`] fills in a [`BootloaderGeometry`] from the bootloader's own
//! trailer, from the opcodes around the reset vector or, as a last resort,
//! from hashes of well-known bootloader images (see [`hash`]).

pub mod detect;
pub mod hash;

use bitflags::bitflags;

use crate::error::Result;
use crate::opcode;

pub use detect::{DetectOptions, detect};

bitflags! {
    /// Feature bits a urboot bootloader announces during sync.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct Features: u8 {
        /// Reserved.
        const RESERVED_1 = 1;
        /// Reserved.
        const RESERVED_2 = 2;
        /// Flash can be read back.
        const READ_FLASH = 4;
        /// Flash writes behave like NOR memory: pages need not be erased
        /// and unwritten bytes are left untouched.
        const FLASH_LL_NOR = 8;
        /// Chip erase is implemented.
        const CHIP_ERASE = 16;
    }
}

impl Features {
    /// Whether flash reads are available.
    pub fn can_read_flash(self) -> bool {
        self.contains(Self::READ_FLASH)
    }

    /// Whether the bootloader writes flash NOR-style.
    pub fn is_nor(self) -> bool {
        self.contains(Self::FLASH_LL_NOR)
    }

    /// Whether the bootloader erases the chip itself.
    pub fn has_chip_erase(self) -> bool {
        self.contains(Self::CHIP_ERASE)
    }
}

bitflags! {
    /// Capability byte stored in the bootloader trailer.
    ///
    /// Some bits changed meaning over urboot versions: bit 7 is
    /// "has pgm_write_page()" before u7.7 and "autobaud" afterwards, bit 0
    /// is "preserves reset flags" before u7.7 and "has chip erase" after.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct Capabilities: u8 {
        /// pgm_write_page() callable by the application.
        const PGM_WRITE_PAGE = 128;
        /// EEPROM read/write.
        const EEPROM = 64;
        /// Urprotocol (u7.6 and later).
        const URPROTOCOL = 32;
        /// Dual boot from external SPI flash.
        const DUAL = 16;
        /// Vector bootloader, low bit of the level.
        const VBL = 4;
        /// Vector bootloader, high bit of the level.
        const VBL_PATCH = 8;
        /// Bootloader refuses to overwrite itself.
        const PROTECT_ME = 2;
        /// Reset flags handed to the application.
        const RESET_FLAGS = 1;
    }
}

impl Capabilities {
    /// Bit 7 from u7.7 on.
    pub const AUTOBAUD: Self = Self::PGM_WRITE_PAGE;

    /// Bit 0 from u7.7 on.
    pub const HAS_CE: Self = Self::RESET_FLAGS;

    /// Vector bootloader level encoded in bits 2 and 3.
    pub fn vector_level(self) -> VectorLevel {
        VectorLevel::from_bits(self.bits() >> 2)
    }
}

/// How a vector bootloader gets control after reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum VectorLevel {
    /// Bootloader lives in the hardware boot section.
    #[default]
    None,
    /// The uploader must patch the reset vector.
    Jump,
    /// The bootloader patches the vector table on upload.
    Patch,
    /// The bootloader patches and verifies.
    PatchVerify,
}

impl VectorLevel {
    /// Level from its 2-bit encoding.
    pub fn from_bits(bits: u8) -> Self {
        match bits & 3 {
            0 => Self::None,
            1 => Self::Jump,
            2 => Self::Patch,
            _ => Self::PatchVerify,
        }
    }

    /// Numeric level 0..=3.
    pub fn level(self) -> u8 {
        self as u8
    }

    /// Letter used in the version string.
    fn letter(self) -> char {
        ['h', 'j', 'v', 'V'][usize::from(self.level())]
    }
}

/// Which bootloader was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BootloaderVersion {
    /// Could not tell.
    #[default]
    Unknown,
    /// Urboot with its trailer.
    Urboot {
        /// Version byte: major in bits 3..7, minor in bits 0..2.
        version: u8,
        /// Capability byte.
        capabilities: Capabilities,
        /// Write-page `rjmp` at the top, or `ret`.
        write_page: u16,
    },
    /// Optiboot-style two-byte version.
    Optiboot {
        /// Major version.
        major: u8,
        /// Minor version.
        minor: u8,
    },
}

/// Anything the flash contents can be read from.
///
/// Implemented by [`crate::Session`]; detection and the image transformer
/// only ever see this trait.
pub trait FlashReader {
    /// Whether reads are possible at all.
    fn can_read_flash(&self) -> bool;

    /// Read `buf.len()` bytes of flash starting at `addr`.
    fn read_flash(&mut self, addr: u32, buf: &mut [u8]) -> Result<()>;
}

/// Bootloader position and properties for one connected part.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootloaderGeometry {
    /// Flash size of the part.
    pub flash_size: u32,
    /// Flash page size of the part.
    pub page_size: u32,
    /// Interrupt vectors of the part.
    pub interrupts: u8,
    /// First bootloader byte; `None` when unknown or absent.
    pub start: Option<u32>,
    /// Vector bootloader level.
    pub vector_level: VectorLevel,
    /// Vector the application entry is moved to; 0 for none.
    pub vector_number: u8,
    /// Identified bootloader.
    pub version: BootloaderVersion,
    /// Bootloader can read and write EEPROM.
    pub eeprom_rw: bool,
    /// Session uses urprotocol.
    pub urprotocol: bool,
    /// Features from sync.
    pub features: Features,
    /// Start was taken from the known-image hash table.
    pub guessed: bool,
}

impl BootloaderGeometry {
    /// Geometry with nothing known yet: all flash is application flash.
    pub fn new(flash_size: u32, page_size: u32, interrupts: u8) -> Self {
        Self {
            flash_size,
            page_size,
            interrupts,
            start: None,
            vector_level: VectorLevel::None,
            vector_number: 0,
            version: BootloaderVersion::Unknown,
            eeprom_rw: false,
            urprotocol: false,
            features: Features::empty(),
            guessed: false,
        }
    }

    /// Bytes available to the application (`pfend + 1`).
    pub fn app_end(&self) -> u32 {
        self.start
            .unwrap_or(self.flash_size)
    }

    /// Last application byte.
    pub fn program_end(&self) -> u32 {
        self.app_end()
            .saturating_sub(1)
    }

    /// Bootloader size in bytes; 0 when unknown.
    pub fn size(&self) -> u32 {
        self.start
            .map_or(0, |s| self.flash_size - s)
    }

    /// Size of one vector table slot.
    pub fn vector_size(&self) -> u32 {
        opcode::vector_size(self.flash_size)
    }

    /// Urboot version byte, 0 for anything else.
    pub fn urboot_version(&self) -> u8 {
        match self.version {
            BootloaderVersion::Urboot { version, .. } => version,
            _ => 0,
        }
    }

    /// Whether an optiboot-style bootloader was seen.
    pub fn is_optiboot(&self) -> bool {
        matches!(self.version, BootloaderVersion::Optiboot { .. })
    }

    /// Whether flash may be read through this bootloader.
    pub fn can_read_flash(&self) -> bool {
        !self.urprotocol || self.features.can_read_flash()
    }

    /// Whether the uploader must keep the reset vector pointing at the
    /// bootloader.
    pub fn patches_reset(&self) -> bool {
        self.start.is_some() && self.vector_level == VectorLevel::Jump
    }

    /// Reset vector bytes that enter the bootloader, and how many are used.
    pub fn reset_to_bootloader(&self) -> Option<([u8; 4], usize)> {
        self.start
            .map(|s| opcode::reset_to_bootloader(s, self.flash_size))
    }

    /// Whether byte-level writes to flash address `addr` must be refused:
    /// the bootloader, the reset vector and the moved application vector.
    pub fn readonly(&self, addr: u32) -> bool {
        if addr > self.program_end() {
            return true;
        }
        if addr < 512 && self.vector_level != VectorLevel::None {
            let vecsz = self.vector_size();
            if addr < vecsz {
                return true;
            }
            if self.vector_number > 0 {
                let slot = u32::from(self.vector_number) * vecsz;
                if (slot..slot + vecsz).contains(&addr) {
                    return true;
                }
            }
        }
        false
    }

    /// Compact description: version followed by one letter per capability.
    ///
    /// `u7.7 weu-jPrac` reads: urboot 7.7, write-page, EEPROM, urprotocol,
    /// no dual boot, vector bootloader needing a reset patch, protected,
    /// reset flags, autobaud, chip erase.
    pub fn version_string(&self) -> String {
        match self.version {
            BootloaderVersion::Urboot {
                version,
                capabilities,
                write_page,
            } if version >= 0o72 => urboot_version_string(version, capabilities, write_page),
            BootloaderVersion::Urboot { .. } | BootloaderVersion::Unknown => {
                "x0.0 .........".to_string()
            },
            BootloaderVersion::Optiboot { major, minor } => {
                let (ee, vbl) = if self.guessed {
                    (
                        if self.eeprom_rw { 'e' } else { '-' },
                        self.vector_level.letter(),
                    )
                } else {
                    ('?', '?')
                };
                format!("o{major}.{minor} -{ee}s-{vbl}-r--")
            },
        }
    }
}

fn urboot_version_string(hi: u8, cap: Capabilities, write_page: u16) -> String {
    let has = |flag: Capabilities, yes: char, no: char| if cap.contains(flag) { yes } else { no };
    let modern = hi >= 0o77;
    let mut out = format!("u{}.{} ", hi >> 3, hi & 7);

    let write = if modern {
        write_page != opcode::RET
    } else {
        cap.contains(Capabilities::PGM_WRITE_PAGE)
    };
    out.push(if write { 'w' } else { '-' });
    out.push(has(Capabilities::EEPROM, 'e', '-'));
    if hi >= 0o76 {
        out.push(has(Capabilities::URPROTOCOL, 'u', 's'));
        out.push(has(Capabilities::DUAL, 'd', '-'));
    } else {
        out.push('-');
        out.push(match (cap.bits() >> 4) & 3 {
            3 => 'D',
            2 => 'd',
            1 => 'f',
            _ => '-',
        });
    }
    out.push(cap.vector_level().letter());
    out.push(if modern {
        has(Capabilities::PROTECT_ME, 'P', 'p')
    } else {
        has(Capabilities::PROTECT_ME, 'p', '-')
    });
    out.push(if modern || cap.contains(Capabilities::RESET_FLAGS) { 'r' } else { '-' });
    out.push(if modern && cap.contains(Capabilities::AUTOBAUD) { 'a' } else { '-' });
    out.push(match (modern, cap.contains(Capabilities::HAS_CE)) {
        (true, true) => 'c',
        (true, false) => '-',
        (false, _) => '.',
    });
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn urboot(version: u8, cap: u8, write_page: u16) -> BootloaderGeometry {
        let mut geo = BootloaderGeometry::new(32768, 128, 26);
        geo.start = Some(32768 - 384);
        geo.version = BootloaderVersion::Urboot {
            version,
            capabilities: Capabilities::from_bits_retain(cap),
            write_page,
        };
        geo
    }

    #[test]
    fn test_feature_predicates() {
        let f = Features::from_bits_retain(4 | 16);
        assert!(f.can_read_flash());
        assert!(f.has_chip_erase());
        assert!(!f.is_nor());
    }

    #[test]
    fn test_vector_level_from_capabilities() {
        assert_eq!(Capabilities::from_bits_retain(0x00).vector_level(), VectorLevel::None);
        assert_eq!(Capabilities::from_bits_retain(0x04).vector_level(), VectorLevel::Jump);
        assert_eq!(Capabilities::from_bits_retain(0x08).vector_level(), VectorLevel::Patch);
        assert_eq!(Capabilities::from_bits_retain(0xec).vector_level(), VectorLevel::PatchVerify);
    }

    #[test]
    fn test_modern_urboot_version_string() {
        // u7.7, autobaud, EEPROM, urprotocol, vbl jump, protect, chip erase
        let geo = urboot(0o77, 0x80 | 0x40 | 0x20 | 0x04 | 0x02 | 0x01, 0xcf00);
        assert_eq!(geo.version_string(), "u7.7 weu-jPrac");

        let geo = urboot(0o77, 0x20 | 0x04, opcode::RET);
        assert_eq!(geo.version_string(), "u7.7 --u-jpr--");
    }

    #[test]
    fn test_u76_version_string() {
        let geo = urboot(0o76, 0x40 | 0x10 | 0x08 | 0x02 | 0x01, opcode::RET);
        assert_eq!(geo.version_string(), "u7.6 -esdvpr-.");
    }

    #[test]
    fn test_old_urboot_version_string() {
        let geo = urboot(0o73, 0x80 | 0x30 | 0x0c, opcode::RET);
        assert_eq!(geo.version_string(), "u7.3 w--DV---.");
    }

    #[test]
    fn test_optiboot_and_unknown_version_strings() {
        let mut geo = BootloaderGeometry::new(32768, 128, 26);
        assert_eq!(geo.version_string(), "x0.0 .........");

        geo.version = BootloaderVersion::Optiboot { major: 8, minor: 0 };
        assert_eq!(geo.version_string(), "o8.0 -?s-?-r--");

        geo.guessed = true;
        assert_eq!(geo.version_string(), "o8.0 --s-h-r--");
    }

    #[test]
    fn test_readonly_addresses() {
        let mut geo = urboot(0o77, 0x04, 0xcf00);
        geo.vector_level = VectorLevel::Jump;
        geo.vector_number = 25;

        assert!(geo.readonly(0));
        assert!(geo.readonly(3));
        assert!(!geo.readonly(4));
        assert!(geo.readonly(100));
        assert!(geo.readonly(103));
        assert!(!geo.readonly(104));
        assert!(!geo.readonly(32383));
        assert!(geo.readonly(32384));
    }

    #[test]
    fn test_app_end_without_bootloader() {
        let geo = BootloaderGeometry::new(8192, 64, 15);
        assert_eq!(geo.app_end(), 8192);
        assert_eq!(geo.size(), 0);
        assert!(!geo.readonly(8191));
        assert!(geo.reset_to_bootloader().is_none());
    }
}
