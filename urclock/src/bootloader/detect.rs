//! Work out where the bootloader starts and how it hooks into reset.
//!
//! Urboot v7.5 and later describe themselves in the top six bytes of
//! flash:
//!
//! ```text
//! +----------+---------+-----------------+------------+---------+
//! | numpages | vectnum | write-page rjmp | capability | version |
//! +----------+---------+-----------------+------------+---------+
//! | 1        | 1       | 2 (LE)          | 1          | 1       |
//! +----------+---------+-----------------+------------+---------+
//! ```
//!
//! Older vector bootloaders are found through the reset vector, which must
//! jump into them, and a scan of their code for the jump to the moved
//! application vector. Anything else is matched against known images.

use byteorder::{ByteOrder, LittleEndian};
use log::{debug, warn};

use super::{BootloaderGeometry, BootloaderVersion, Capabilities, Features, FlashReader, VectorLevel, hash};
use crate::device::McuDescriptor;
use crate::error::{Error, Result};
use crate::opcode;

/// Largest bootloader the heuristics accept.
const MAX_BOOTLOADER_SIZE: u32 = 2048;

/// User overrides; each wins over what the device says.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DetectOptions {
    /// Bootloader size in bytes.
    pub bootsize: Option<u32>,
    /// Vector number of a vector bootloader; `-1` for none.
    pub vectornum: Option<i32>,
    /// Proceed despite overrides that contradict the bootloader.
    pub force: bool,
}

/// Top-of-flash trailer of a urboot bootloader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Trailer {
    pages: u8,
    vectnum: u8,
    write_page: u16,
    capabilities: Capabilities,
    version: u8,
}

impl Trailer {
    fn parse(raw: &[u8; 6]) -> Self {
        Self {
            pages: raw[0],
            vectnum: raw[1],
            write_page: LittleEndian::read_u16(&raw[2..4]),
            capabilities: Capabilities::from_bits_retain(raw[4]),
            version: raw[5],
        }
    }

    fn looks_like_urboot(&self) -> bool {
        (0o72..=0o147).contains(&self.version)
            && (opcode::is_rjmp(self.write_page) || self.write_page == opcode::RET)
    }
}

/// Establish the bootloader geometry of the connected part.
pub fn detect<R: FlashReader + ?Sized>(
    reader: &mut R,
    mcu: &McuDescriptor,
    urprotocol: bool,
    features: Features,
    opts: &DetectOptions,
) -> Result<BootloaderGeometry> {
    let flash = mcu.flash_size;
    let page = mcu.page_size;
    let nint = u32::from(mcu.interrupts);

    let mut geo = BootloaderGeometry::new(flash, page, mcu.interrupts);
    geo.urprotocol = urprotocol;
    geo.features = features;

    // No room for a bootloader
    if flash < 512 {
        return Ok(geo);
    }

    if let Some(size) = opts.bootsize {
        let max = (flash / 4).min(8192);
        if size % page != 0 {
            return Err(Error::Config(format!(
                "bootsize {size} is not a multiple of the flash page size {page}"
            )));
        }
        if !(64..=max).contains(&size) {
            return Err(Error::Config(format!(
                "implausible bootsize {size}, should be in [64, {max}]"
            )));
        }
        geo.start = Some(flash - size);
    }

    let vector_override = opts
        .vectornum
        .filter(|&v| v != -1);
    if let Some(v) = vector_override {
        if v < -1 || v > nint as i32 {
            return Err(Error::Config(format!(
                "unknown interrupt vector #{v} for vector bootloader, should be in [-1, {nint}]"
            )));
        }
        if v > 0 {
            geo.vector_level = VectorLevel::Jump;
            geo.vector_number = v as u8;
        }
    }

    if !geo.can_read_flash() {
        if geo.start.is_none() {
            return Err(Error::Capability(
                "bootloader cannot read flash; please specify bootsize and, if needed, vectornum or eepromrw"
                    .to_string(),
            ));
        }
        return Ok(geo);
    }

    let mut raw = [0u8; 6];
    reader.read_flash(flash - 6, &mut raw)?;
    let trailer = Trailer::parse(&raw);

    if trailer.looks_like_urboot() {
        geo.version = BootloaderVersion::Urboot {
            version: trailer.version,
            capabilities: trailer.capabilities,
            write_page: trailer.write_page,
        };
        geo.eeprom_rw = trailer
            .capabilities
            .contains(Capabilities::EEPROM);
        if geo.vector_level == VectorLevel::None {
            geo.vector_level = trailer
                .capabilities
                .vector_level();
        }
        if trailer.version >= 0o75 {
            apply_trailer(&mut geo, &trailer, opts, vector_override)?;
        }
    } else if trailer.version != 0xff {
        geo.version = BootloaderVersion::Optiboot {
            major: trailer.version,
            minor: raw[4],
        };
    }

    if geo.start.is_none() && geo.vector_level != VectorLevel::None {
        locate_vector_bootloader(reader, &mut geo)?;
    }

    if geo.start.is_none() {
        if let Some(known) = hash::guess(reader, flash, page)? {
            geo.start = Some(flash - known.size);
            geo.eeprom_rw |= known.eeprom;
            geo.guessed = true;
        }
    }

    match geo.start {
        Some(start) => {
            debug!(
                "bootloader at {start:#06x} ({} bytes), vector level {}, vector {}",
                flash - start,
                geo.vector_level.level(),
                geo.vector_number
            );
            Ok(geo)
        },
        None => Err(Error::GeometryUnknown(match geo.version {
            BootloaderVersion::Optiboot { major, minor } => {
                format!("bootloader might be optiboot {major}.{minor}? please specify bootsize")
            },
            _ => "unknown bootloader; please specify bootsize".to_string(),
        })),
    }
}

/// Take size and vector number from a v7.5+ trailer once it passes the
/// plausibility checks.
fn apply_trailer(
    geo: &mut BootloaderGeometry,
    trailer: &Trailer,
    opts: &DetectOptions,
    vector_override: Option<i32>,
) -> Result<()> {
    let flash = geo.flash_size;
    let blsize = u32::from(trailer.pages) * geo.page_size;
    if !(64..=MAX_BOOTLOADER_SIZE).contains(&blsize)
        || u32::from(trailer.vectnum) > u32::from(geo.interrupts)
    {
        return Ok(());
    }

    // The write-page rjmp sits 4 bytes below the end and jumps back into the bootloader
    let from_end = opcode::rjmp_distance(trailer.write_page, flash) - 4;
    if trailer.write_page != opcode::RET && !(-(blsize as i32)..-6).contains(&from_end) {
        return Ok(());
    }

    match geo.start {
        Some(start) if start != flash - blsize => {
            warn!(
                "urboot bootloader size {blsize} explicitly overwritten by bootsize {}",
                flash - start
            );
            if !opts.force && geo.vector_level != VectorLevel::None {
                return Err(Error::Safety(
                    "bootsize override contradicts the vector bootloader; this can brick it"
                        .to_string(),
                ));
            }
        },
        Some(_) => {},
        None => geo.start = Some(flash - blsize),
    }

    match vector_override {
        Some(v) if v != i32::from(trailer.vectnum) => {
            warn!(
                "urboot vector number {} overwritten by vectornum {v}; the application might not start correctly",
                trailer.vectnum
            );
        },
        Some(_) => {},
        None => geo.vector_number = trailer.vectnum,
    }
    Ok(())
}

/// Older vector bootloaders: follow the reset vector, then look for the
/// jump to the application's vector inside the bootloader.
fn locate_vector_bootloader<R: FlashReader + ?Sized>(
    reader: &mut R,
    geo: &mut BootloaderGeometry,
) -> Result<()> {
    let flash = geo.flash_size;
    let page = geo.page_size;
    let vecsz = geo.vector_size();

    let mut reset = [0u8; 4];
    reader.read_flash(0, &mut reset)?;
    let reset16 = LittleEndian::read_u16(&reset);

    let candidate = if opcode::is_rjmp(reset16) {
        flash.is_power_of_two().then(|| {
            let mut guess = i64::from(opcode::rjmp_distance(reset16, flash));
            while guess < 0 {
                guess += i64::from(flash);
            }
            guess as u32
        })
    } else if vecsz == 4 && opcode::is_jmp(reset16) {
        Some(opcode::jmp_address(LittleEndian::read_u32(&reset))).filter(|&a| a < flash)
    } else {
        None
    };

    if let Some(start) = candidate
        .filter(|&s| s % page == 0 && flash - s <= MAX_BOOTLOADER_SIZE)
    {
        debug!("reset vector points to a bootloader at {start:#06x}");
        geo.start = Some(start);
    }

    let Some(start) = geo.start else {
        return Ok(());
    };
    if geo.vector_number > 0 {
        return Ok(());
    }

    let nint = i64::from(geo.interrupts);
    let vecsz_i = i64::from(vecsz);
    let mut to_end = i64::from(flash - start);
    let mut jmp_low: Option<u16> = None;
    let mut skip = false;
    let mut buf = vec![0u8; page as usize];

    for p in 0..(flash - start) / page {
        reader.read_flash(start + p * page, &mut buf)?;
        for word in buf.chunks_exact(2) {
            let op = LittleEndian::read_u16(word);
            if let Some(low) = jmp_low.take() {
                let dest = i64::from(opcode::jmp_address((u32::from(op) << 16) | u32::from(low)));
                if dest % vecsz_i == 0 && dest <= nint * vecsz_i {
                    geo.vector_number = (dest / vecsz_i) as u8;
                    return Ok(());
                }
            } else if skip {
                skip = false;
            } else if opcode::is_rjmp(op) && to_end > 4 {
                // Top 4 bytes are trailer data, not code
                let dist = i64::from(opcode::rjmp_distance(op, flash));
                if dist > to_end && dist <= to_end + nint * vecsz_i {
                    geo.vector_number = ((dist - to_end) / vecsz_i) as u8;
                    return Ok(());
                }
            } else if opcode::is_jmp(op) && to_end > 6 {
                jmp_low = Some(op);
            } else if opcode::is_op32(op) {
                skip = true;
            }
            to_end -= 2;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device;
    use crate::testing::FlashImage;

    fn atmega328p() -> &'static McuDescriptor {
        device::by_name("ATmega328P").unwrap()
    }

    fn attiny85() -> &'static McuDescriptor {
        device::by_name("ATtiny85").unwrap()
    }

    /// 32 KiB flash with a 384-byte u7.7 vector bootloader using vector 25.
    fn urboot_328p(cap: u8) -> FlashImage {
        let mut flash = FlashImage::erased(32768);
        let wp = opcode::rjmp_opcode(-100, 32768);
        flash.bytes[32762..].copy_from_slice(&[3, 25, wp as u8, (wp >> 8) as u8, cap, 0o77]);
        flash
    }

    #[test]
    fn test_urboot_trailer() {
        let mut flash = urboot_328p(0x40 | 0x20 | 0x04);
        let geo = detect(&mut flash, atmega328p(), true, Features::READ_FLASH, &DetectOptions::default())
            .unwrap();
        assert_eq!(geo.start, Some(32384));
        assert_eq!(geo.size(), 384);
        assert_eq!(geo.vector_level, VectorLevel::Jump);
        assert_eq!(geo.vector_number, 25);
        assert!(geo.eeprom_rw);
        assert_eq!(geo.urboot_version(), 0o77);
        assert!(!geo.guessed);
    }

    #[test]
    fn test_matching_bootsize_override_is_quiet() {
        let mut flash = urboot_328p(0x04);
        let opts = DetectOptions {
            bootsize: Some(384),
            ..Default::default()
        };
        let geo = detect(&mut flash, atmega328p(), true, Features::READ_FLASH, &opts).unwrap();
        assert_eq!(geo.start, Some(32384));
    }

    #[test]
    fn test_contradicting_bootsize_needs_force() {
        let mut flash = urboot_328p(0x04);
        let mut opts = DetectOptions {
            bootsize: Some(512),
            ..Default::default()
        };
        let err = detect(&mut flash, atmega328p(), true, Features::READ_FLASH, &opts).unwrap_err();
        assert!(matches!(err, Error::Safety(_)));

        opts.force = true;
        let geo = detect(&mut flash, atmega328p(), true, Features::READ_FLASH, &opts).unwrap();
        assert_eq!(geo.start, Some(32768 - 512));
    }

    #[test]
    fn test_vectornum_override_wins() {
        let mut flash = urboot_328p(0x04);
        let opts = DetectOptions {
            vectornum: Some(24),
            ..Default::default()
        };
        let geo = detect(&mut flash, atmega328p(), true, Features::READ_FLASH, &opts).unwrap();
        assert_eq!(geo.vector_number, 24);
        assert_eq!(geo.vector_level, VectorLevel::Jump);
    }

    #[test]
    fn test_override_validation() {
        let mut flash = urboot_328p(0x04);
        for bootsize in [100, 32, 16384] {
            let opts = DetectOptions {
                bootsize: Some(bootsize),
                ..Default::default()
            };
            assert!(matches!(
                detect(&mut flash, atmega328p(), true, Features::READ_FLASH, &opts),
                Err(Error::Config(_))
            ));
        }
        let opts = DetectOptions {
            vectornum: Some(27),
            ..Default::default()
        };
        assert!(matches!(
            detect(&mut flash, atmega328p(), true, Features::READ_FLASH, &opts),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_unreadable_flash_needs_bootsize() {
        let mut flash = urboot_328p(0x04);
        let err = detect(&mut flash, atmega328p(), true, Features::empty(), &DetectOptions::default())
            .unwrap_err();
        assert!(matches!(err, Error::Capability(_)));

        let opts = DetectOptions {
            bootsize: Some(512),
            vectornum: Some(25),
            ..Default::default()
        };
        let geo = detect(&mut flash, atmega328p(), true, Features::empty(), &opts).unwrap();
        assert_eq!(geo.start, Some(32256));
        assert_eq!(geo.vector_number, 25);
        assert_eq!(flash.reads, 0);
    }

    #[test]
    fn test_old_vector_bootloader_found_via_reset_and_rjmp() {
        // ATtiny85: 256-byte u7.4 bootloader, reset rjmps into it and its
        // code rjmps to vector 14 (USI_OVF)
        let mut flash = FlashImage::erased(8192);
        let start = 8192 - 256;
        let reset = opcode::rjmp_to_bootloader(start, 8192);
        flash.bytes[..2].copy_from_slice(&reset.to_le_bytes());

        // rjmp at start+100 to vector 14 at byte 28
        let at = start + 100;
        let jump = opcode::rjmp_opcode(28 + 8192 - at as i32, 8192);
        flash.bytes[at as usize..at as usize + 2].copy_from_slice(&jump.to_le_bytes());
        flash.bytes[8186..].copy_from_slice(&[0, 0, 0x08, 0x95, 0x04, 0o74]);

        let geo = detect(&mut flash, attiny85(), false, Features::empty(), &DetectOptions::default())
            .unwrap();
        assert_eq!(geo.start, Some(start));
        assert_eq!(geo.vector_level, VectorLevel::Jump);
        assert_eq!(geo.vector_number, 14);
    }

    #[test]
    fn test_old_vector_bootloader_with_jmp_to_vector() {
        // ATmega328P: reset rjmps to a 512-byte bootloader that jmps to vector 22
        let mut flash = FlashImage::erased(32768);
        let start = 32768 - 512;
        let reset = opcode::rjmp_to_bootloader(start, 32768);
        flash.bytes[..2].copy_from_slice(&reset.to_le_bytes());

        // lds r24, 0x0100 must not be mistaken for a jump target
        let code = start as usize + 10;
        flash.bytes[code..code + 4].copy_from_slice(&[0x80, 0x91, 0x0c, 0x94]);
        let jmp = opcode::jmp_opcode(22 * 4).to_le_bytes();
        flash.bytes[code + 4..code + 8].copy_from_slice(&jmp);
        flash.bytes[32762..].copy_from_slice(&[0, 0, 0x08, 0x95, 0x04, 0o74]);

        let geo = detect(&mut flash, atmega328p(), false, Features::empty(), &DetectOptions::default())
            .unwrap();
        assert_eq!(geo.start, Some(start));
        assert_eq!(geo.vector_number, 22);
    }

    #[test]
    fn test_optiboot_without_hash_match() {
        let mut flash = FlashImage::erased(32768);
        flash.bytes[32766..].copy_from_slice(&[0x02, 0x08]);
        let err = detect(&mut flash, atmega328p(), false, Features::empty(), &DetectOptions::default())
            .unwrap_err();
        match err {
            Error::GeometryUnknown(msg) => assert!(msg.contains("optiboot 8.2"), "{msg}"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_optiboot_with_bootsize() {
        let mut flash = FlashImage::erased(32768);
        flash.bytes[32766..].copy_from_slice(&[0x02, 0x08]);
        let opts = DetectOptions {
            bootsize: Some(512),
            ..Default::default()
        };
        let geo = detect(&mut flash, atmega328p(), false, Features::empty(), &opts).unwrap();
        assert!(geo.is_optiboot());
        assert_eq!(geo.version_string(), "o8.2 -?s-?-r--");
        assert_eq!(geo.start, Some(32256));
    }
}
