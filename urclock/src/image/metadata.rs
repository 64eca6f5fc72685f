//! Upload metadata stored just below the bootloader.
//!
//! The block ends at the last application byte. Reading backwards from
//! there:
//!
//! ```text
//! +----------+------+-------------+------------+-------+
//! | filename | date | store start | store size | mcode |
//! +----------+------+-------------+------------+-------+
//! | mcode    | 6    | 2 or 4 (LE) | 2 or 4     | 1     |
//! +----------+------+-------------+------------+-------+
//! ```
//!
//! `mcode` 0xff means no metadata at all (just that byte), 0 keeps only the
//! store location, 1 adds the date and larger values add a NUL-terminated
//! filename of `mcode` bytes. Addresses are 4 bytes wide on parts with more
//! than 64 KiB flash.

use std::fmt;

use byteorder::{ByteOrder, LittleEndian};
use chrono::{DateTime, Datelike, Local, TimeZone, Timelike};

/// `mcode` of a block that holds nothing but itself.
pub const MCODE_NONE: u8 = 0xff;

/// Largest `mcode` carrying a filename.
pub const MCODE_MAX: u8 = 254;

/// Longest filename that fits, excluding the terminating NUL.
pub const MAX_FILENAME: usize = MCODE_MAX as usize - 1;

const DATE_SIZE: u32 = 6;

fn address_width(flash_size: u32) -> usize {
    if flash_size > 1 << 16 { 4 } else { 2 }
}

/// Size of the store location header plus the mcode byte.
pub fn header_size(flash_size: u32) -> u32 {
    2 * address_width(flash_size) as u32 + 1
}

/// Bytes taken by a metadata block with the given `mcode`.
pub fn nmeta(mcode: u8, flash_size: u32) -> u32 {
    let header = header_size(flash_size);
    match mcode {
        MCODE_NONE => 1,
        0 => header,
        1 => header + DATE_SIZE,
        n => u32::from(n) + DATE_SIZE + header,
    }
}

/// Upload time with minute resolution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct UploadDate {
    /// Year.
    pub year: u16,
    /// Month, 1-12.
    pub month: u8,
    /// Day of month, 1-31.
    pub day: u8,
    /// Hour, 0-23.
    pub hour: u8,
    /// Minute, 0-59.
    pub minute: u8,
}

impl UploadDate {
    /// Date from calendar fields.
    pub fn new(year: u16, month: u8, day: u8, hour: u8, minute: u8) -> Self {
        Self {
            year,
            month,
            day,
            hour,
            minute,
        }
    }

    /// Date of a timestamp, seconds dropped.
    pub fn from_datetime<Tz: TimeZone>(when: &DateTime<Tz>) -> Self {
        Self {
            year: when.year().clamp(0, i32::from(u16::MAX)) as u16,
            month: when.month() as u8,
            day: when.day() as u8,
            hour: when.hour() as u8,
            minute: when.minute() as u8,
        }
    }

    /// Current local time.
    pub fn now() -> Self {
        Self::from_datetime(&Local::now())
    }

    /// Whether the fields could be a real date.
    pub fn plausible(&self) -> bool {
        (1..3000).contains(&self.year)
            && (1..=12).contains(&self.month)
            && (1..=31).contains(&self.day)
            && self.hour < 24
            && self.minute < 60
    }

    /// Wire form: year LE16, month, day, hour, minute.
    pub fn to_bytes(&self) -> [u8; 6] {
        let mut raw = [0u8; 6];
        LittleEndian::write_u16(&mut raw[..2], self.year);
        raw[2] = self.month;
        raw[3] = self.day;
        raw[4] = self.hour;
        raw[5] = self.minute;
        raw
    }

    /// Inverse of [`UploadDate::to_bytes`].
    pub fn from_bytes(raw: &[u8; 6]) -> Self {
        Self {
            year: LittleEndian::read_u16(&raw[..2]),
            month: raw[2],
            day: raw[3],
            hour: raw[4],
            minute: raw[5],
        }
    }
}

impl fmt::Display for UploadDate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04}-{:02}-{:02} {:02}.{:02}",
            self.year, self.month, self.day, self.hour, self.minute
        )
    }
}

/// Decoded or to-be-written metadata block.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Metadata {
    /// What the block holds, see the module docs.
    pub mcode: u8,
    /// Name of the uploaded application.
    pub filename: Option<String>,
    /// When the application was built or uploaded.
    pub date: Option<UploadDate>,
    /// First byte after the application.
    pub store_start: u32,
    /// Free bytes between the application and this block.
    pub store_size: u32,
}

impl Metadata {
    /// Bytes this block occupies.
    pub fn size(&self, flash_size: u32) -> u32 {
        nmeta(self.mcode, flash_size)
    }

    /// Serialise the complete block, `nmeta(mcode)` bytes.
    pub fn encode(&self, flash_size: u32) -> Vec<u8> {
        if self.mcode == MCODE_NONE {
            return vec![MCODE_NONE];
        }

        let width = address_width(flash_size);
        let mut out = Vec::with_capacity(self.size(flash_size) as usize);
        if self.mcode > 1 {
            let mut name = self
                .filename
                .as_deref()
                .unwrap_or("")
                .as_bytes()
                .to_vec();
            name.resize(usize::from(self.mcode), 0);
            out.extend_from_slice(&name);
        }
        if self.mcode >= 1 {
            out.extend_from_slice(
                &self
                    .date
                    .unwrap_or_default()
                    .to_bytes(),
            );
        }

        let mut field = [0u8; 4];
        LittleEndian::write_u32(&mut field, self.store_start);
        out.extend_from_slice(&field[..width]);
        LittleEndian::write_u32(&mut field, self.store_size);
        out.extend_from_slice(&field[..width]);
        out.push(self.mcode);
        out
    }

    /// Decode the bytes ending at the last application byte.
    ///
    /// `tail` may be longer than the block. Returns `None` unless the store
    /// location adds up to `app_end` and, when present, the date is
    /// plausible. The filename is only filled in when `tail` covers it.
    pub fn parse(tail: &[u8], flash_size: u32, app_end: u32) -> Option<Self> {
        let n = tail.len();
        let header = header_size(flash_size) as usize;
        let &mcode = tail.last()?;
        if mcode == MCODE_NONE || n < header {
            return None;
        }

        let width = address_width(flash_size);
        let read = |at: usize| -> u32 {
            if width == 4 {
                LittleEndian::read_u32(&tail[at..at + 4])
            } else {
                u32::from(LittleEndian::read_u16(&tail[at..at + 2]))
            }
        };
        let store_size = read(n - 1 - width);
        let store_start = read(n - 1 - 2 * width);

        let total = u64::from(store_start) + u64::from(store_size) + u64::from(nmeta(mcode, flash_size));
        if store_start == 0 || total != u64::from(app_end) {
            return None;
        }

        let mut meta = Self {
            mcode,
            filename: None,
            date: None,
            store_start,
            store_size,
        };
        if mcode == 0 {
            return Some(meta);
        }

        let date_at = n.checked_sub(header + DATE_SIZE as usize)?;
        let mut raw = [0u8; 6];
        raw.copy_from_slice(&tail[date_at..date_at + 6]);
        let date = UploadDate::from_bytes(&raw);
        if !date.plausible() {
            return None;
        }
        meta.date = Some(date);

        if mcode > 1 {
            if let Some(at) = n.checked_sub(nmeta(mcode, flash_size) as usize) {
                meta.filename = Some(decode_filename(&tail[at..at + usize::from(mcode)]));
            }
        }
        Some(meta)
    }
}

/// Filename bytes up to the first NUL.
pub fn decode_filename(raw: &[u8]) -> String {
    let end = raw
        .iter()
        .position(|&b| b == 0)
        .unwrap_or(raw.len());
    String::from_utf8_lossy(&raw[..end]).into_owned()
}

/// Longest prefix of `name` that fits a metadata block.
pub fn truncate_filename(name: &str) -> &str {
    if name.len() <= MAX_FILENAME {
        return name;
    }
    let mut end = MAX_FILENAME;
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    &name[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nmeta_sizes() {
        assert_eq!(nmeta(MCODE_NONE, 32768), 1);
        assert_eq!(nmeta(0, 32768), 5);
        assert_eq!(nmeta(1, 32768), 11);
        assert_eq!(nmeta(10, 32768), 21);
        assert_eq!(nmeta(0, 131072), 9);
        assert_eq!(nmeta(1, 131072), 15);
        assert_eq!(nmeta(254, 131072), 269);
    }

    #[test]
    fn test_date_plausibility() {
        assert!(UploadDate::new(2024, 2, 29, 23, 59).plausible());
        assert!(!UploadDate::new(0, 1, 1, 0, 0).plausible());
        assert!(!UploadDate::new(2024, 13, 1, 0, 0).plausible());
        assert!(!UploadDate::new(2024, 1, 0, 0, 0).plausible());
        assert!(!UploadDate::new(2024, 1, 1, 24, 0).plausible());
        assert!(!UploadDate::default().plausible());
        assert_eq!(UploadDate::new(2024, 3, 7, 9, 5).to_string(), "2024-03-07 09.05");
    }

    #[test]
    fn test_date_from_datetime() {
        let when = chrono::Utc
            .with_ymd_and_hms(2023, 11, 5, 17, 42, 59)
            .unwrap();
        assert_eq!(UploadDate::from_datetime(&when), UploadDate::new(2023, 11, 5, 17, 42));
    }

    #[test]
    fn test_encode_layout() {
        let meta = Metadata {
            mcode: 6,
            filename: Some("blink".into()),
            date: Some(UploadDate::new(2024, 5, 17, 12, 30)),
            store_start: 1000,
            store_size: 31490,
        };
        let block = meta.encode(32768);
        assert_eq!(block.len(), 17);
        assert_eq!(&block[..6], b"blink\0");
        assert_eq!(&block[6..12], &[0xe8, 0x07, 5, 17, 12, 30]);
        assert_eq!(&block[12..14], &1000u16.to_le_bytes());
        assert_eq!(&block[14..16], &31490u16.to_le_bytes());
        assert_eq!(block[16], 6);
    }

    #[test]
    fn test_encode_wide_and_none() {
        let meta = Metadata {
            mcode: 0,
            store_start: 0x1_2000,
            store_size: 0x100,
            ..Default::default()
        };
        assert_eq!(
            meta.encode(131072),
            vec![0x00, 0x20, 0x01, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00]
        );

        let none = Metadata {
            mcode: MCODE_NONE,
            ..Default::default()
        };
        assert_eq!(none.encode(32768), vec![0xff]);
    }

    #[test]
    fn test_parse_encoded_block() {
        let meta = Metadata {
            mcode: 6,
            filename: Some("blink".into()),
            date: Some(UploadDate::new(2024, 5, 17, 12, 30)),
            store_start: 1000,
            store_size: 31491,
        };
        let app_end = 1000 + 31491 + 17;
        let block = meta.encode(32768);
        assert_eq!(Metadata::parse(&block, 32768, app_end), Some(meta.clone()));

        // Date and header only
        let short = Metadata::parse(&block[6..], 32768, app_end).unwrap();
        assert_eq!(short.filename, None);
        assert_eq!(short.date, meta.date);

        assert_eq!(Metadata::parse(&block, 32768, app_end + 1), None);
    }

    #[test]
    fn test_parse_rejects_implausible_date() {
        let meta = Metadata {
            mcode: 1,
            date: Some(UploadDate::new(2024, 0, 17, 12, 30)),
            store_start: 100,
            store_size: 89,
            ..Default::default()
        };
        assert_eq!(Metadata::parse(&meta.encode(8192), 8192, 200), None);
    }

    #[test]
    fn test_parse_mcode_zero_and_erased() {
        let meta = Metadata {
            mcode: 0,
            store_start: 100,
            store_size: 95,
            ..Default::default()
        };
        assert_eq!(Metadata::parse(&meta.encode(8192), 8192, 200), Some(meta));
        assert_eq!(Metadata::parse(&[0xff; 11], 8192, 200), None);
    }

    #[test]
    fn test_filename_helpers() {
        assert_eq!(decode_filename(b"abc\0\0"), "abc");
        assert_eq!(decode_filename(b"abc"), "abc");
        let long = "é".repeat(200);
        let cut = truncate_filename(&long);
        assert!(cut.len() <= MAX_FILENAME);
        assert_eq!(cut.len(), 252);
    }
}
