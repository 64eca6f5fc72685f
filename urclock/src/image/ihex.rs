//! Intel HEX loading on top of the `ihex` record reader.
//!
//! Record types 02 and 04 set the upper address bits for the data records
//! that follow; start address records are ignored. Blank lines are skipped
//! and errors carry the line number of the offending record.

use ihex::{Reader, Record};
use log::{debug, trace};

use super::MemoryImage;
use crate::error::{Error, Result};

/// Parse Intel HEX `text` into an image of `size` bytes.
pub fn parse(text: &str, size: u32) -> Result<MemoryImage> {
    let mut lines = Vec::new();
    let mut records = String::with_capacity(text.len());
    for (n, line) in text.lines().enumerate() {
        let line = line.trim();
        if !line.is_empty() {
            lines.push(n + 1);
            records.push_str(line);
            records.push('\n');
        }
    }

    let mut image = MemoryImage::new(size);
    let mut base: u32 = 0;
    for (record, lineno) in Reader::new(&records).zip(lines) {
        let record = record.map_err(|e| Error::InvalidImage(format!("line {lineno}: {e}")))?;
        match record {
            Record::Data { offset, value } => {
                let addr = base + u32::from(offset);
                trace!("record at {addr:#06x}, {} bytes", value.len());
                image.write(addr, &value)?;
            },
            Record::EndOfFile => return Ok(image),
            Record::ExtendedSegmentAddress(segment) => base = u32::from(segment) << 4,
            Record::ExtendedLinearAddress(upper) => base = u32::from(upper) << 16,
            Record::StartSegmentAddress { .. } | Record::StartLinearAddress(_) => {
                debug!("line {lineno}: start address record ignored");
            },
        }
    }
    Ok(image)
}
