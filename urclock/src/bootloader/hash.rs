//! Recognise popular non-urboot bootloaders by hashing the top of flash.
//!
//! Hashes are Jenkins one-at-a-time over the top `size` bytes of flash read
//! backwards, i.e. starting with the very last byte.

use log::debug;

use super::FlashReader;
use crate::error::Result;

/// One known bootloader image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KnownBootloader {
    /// Size in bytes.
    pub size: u32,
    /// Whether it supports EEPROM access.
    pub eeprom: bool,
    /// Hash of its top 256 bytes.
    pub hash256: u32,
    /// Hash over `size` bytes.
    pub hash: u32,
}

const fn known(size: u32, eeprom: bool, hash256: u32, hash: u32) -> KnownBootloader {
    KnownBootloader {
        size,
        eeprom,
        hash256,
        hash,
    }
}

/// Arduino, picoboot, LGT8F and Sanguino bootloader builds.
pub static KNOWN_BOOTLOADERS: &[KnownBootloader] = &[
    // ATmegaBOOT family
    known(1024, false, 0x3544_5c45, 0x9ef7_7953),
    known(1024, false, 0x32b1_376c, 0xceba_80bb),
    known(2048, false, 0x0842_6ba2, 0x29e8_1e21),
    known(4096, false, 0x1bf8_ed1b, 0x272e_49ed),
    known(2048, false, 0x9774_b926, 0x3350_16ed),
    known(4096, false, 0x3242_ddd3, 0x8096_32a3),
    known(2048, false, 0xc553_f5b4, 0x56be_91cb),
    known(2048, false, 0x12ab_8da0, 0xca46_a3ca),
    known(2048, false, 0x3242_ddd3, 0xf3e9_4dba),
    known(2048, false, 0x2eed_30b3, 0x47d1_4ffa),
    known(2048, false, 0x1cef_0d75, 0x6cfb_ac49),
    // bigboot
    known(1024, true, 0x6ca0_f37b, 0x2112_4cde),
    known(1024, true, 0xae42_ebb8, 0xeb4b_1b71),
    known(1024, true, 0x6ca0_f37b, 0x31ba_e545),
    // optiboot
    known(512, false, 0x035c_bc07, 0x24ba_435e),
    known(512, false, 0x4550_50db, 0x1d53_065f),
    known(512, false, 0xd200_1ddb, 0x16c9_663b),
    known(512, false, 0x49c1_e9a4, 0xa450_759b),
    known(512, false, 0xc54d_cd6c, 0x5bfc_5d06),
    // picoboot
    known(256, false, 0x5a01_c55b, 0x5a01_c55b),
    known(256, false, 0x1451_061b, 0x1451_061b),
    known(512, false, 0x3242_ddd3, 0x5334_8738),
    known(512, false, 0x858e_12de, 0xc80a_44a4),
    known(512, false, 0x3242_ddd3, 0xc254_e344),
    known(256, false, 0xaa62_bafc, 0xaa62_bafc),
    known(256, false, 0x5626_3965, 0x5626_3965),
    known(512, false, 0x3242_ddd3, 0x5ba5_f5f6),
    // LGT8F328P optiboot
    known(3072, false, 0x3242_ddd3, 0xd334_7c5d),
    // Sanguino optiboot
    known(1024, false, 0xe244_a3c6, 0xc7ce_aadf),
    known(1024, false, 0xe244_a3c6, 0x063b_24dd),
    known(1024, false, 0xe244_a3c6, 0x6e5d_8d92),
    known(1024, false, 0xe244_a3c6, 0xed2e_78d7),
    known(1024, false, 0xe244_a3c6, 0x5721_5b62),
    known(1024, false, 0xe244_a3c6, 0x3659_54f4),
    known(1024, false, 0xe244_a3c6, 0x6f12_0e6a),
    known(1024, false, 0xe244_a3c6, 0x79b2_66ae),
];

/// Jenkins one-at-a-time hash.
pub fn jenkins(data: &[u8]) -> u32 {
    let mut h: u32 = 0;
    for &b in data {
        h = h.wrapping_add(u32::from(b));
        h = h.wrapping_add(h << 10);
        h ^= h >> 6;
    }
    h = h.wrapping_add(h << 3);
    h ^= h >> 11;
    h.wrapping_add(h << 15)
}

/// Try to recognise the bootloader at the top of flash.
///
/// Reads grow in 128-byte steps from the top, so a miss on the first
/// 256 bytes costs two reads.
pub fn guess<R: FlashReader + ?Sized>(
    reader: &mut R,
    flash_size: u32,
    page_size: u32,
) -> Result<Option<KnownBootloader>> {
    if !reader.can_read_flash() {
        return Ok(None);
    }

    let mut list = KNOWN_BOOTLOADERS.to_vec();
    list.sort_by_key(|k| (k.size, k.hash));

    let mut top: Vec<u8> = Vec::new();
    let mut size = 0;
    for entry in &list {
        if entry.size <= size {
            continue;
        }
        size = entry.size;
        if size > flash_size / 2 {
            return Ok(None);
        }

        let mut chunk = [0u8; 128];
        while (top.len() as u32) < size {
            reader.read_flash(flash_size - top.len() as u32 - 128, &mut chunk)?;
            top.extend(chunk.iter().rev());
        }

        let hash = jenkins(&top[..size as usize]);
        if let Some(found) = list
            .iter()
            .find(|k| k.hash == hash && k.size == size && size % page_size == 0)
        {
            debug!("top {size} bytes of flash match a known bootloader");
            return Ok(Some(*found));
        }

        if size == 256 && !list.iter().any(|k| k.hash256 == hash) {
            return Ok(None);
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FlashImage;

    #[test]
    fn test_jenkins_reference_values() {
        assert_eq!(jenkins(b""), 0);
        assert_eq!(jenkins(b"a"), 0xca2e_9442);
        assert_eq!(jenkins(b"The quick brown fox jumps over the lazy dog"), 0x519e_91f5);
    }

    #[test]
    fn test_table_is_sane() {
        for k in KNOWN_BOOTLOADERS {
            assert!(k.size.is_power_of_two() || k.size == 3072);
            if k.size == 256 {
                assert_eq!(k.hash, k.hash256);
            }
        }
    }

    #[test]
    fn test_unknown_top_stops_after_256_bytes() {
        let mut flash = FlashImage::erased(32768);
        flash.bytes[32767] = 0x42;
        assert_eq!(guess(&mut flash, 32768, 128).unwrap(), None);
        assert_eq!(flash.reads, 2);
    }

    #[test]
    fn test_unreadable_flash_is_not_guessed() {
        let mut flash = FlashImage::erased(32768);
        flash.readable = false;
        assert_eq!(guess(&mut flash, 32768, 128).unwrap(), None);
        assert_eq!(flash.reads, 0);
    }
}
