//! Sparse flash images and what gets done to them before upload.
//!
//! A [`MemoryImage`] is a full-size buffer plus one "allocated" tag per
//! byte. Loaders tag the bytes an input file sets; [`transform`] then adds
//! vector patches, metadata and page padding so that only whole pages with
//! meaningful contents reach the device.

pub mod ihex;
pub mod metadata;
pub mod transform;

use std::fs;
use std::ops::Range;
use std::path::Path;

use log::debug;

use crate::error::{Error, Result};

pub use metadata::{Metadata, UploadDate, nmeta};
pub use transform::{EraseState, TransformOptions, UploadSource, transform};

/// Byte buffer with an allocation tag per byte; untagged bytes read 0xff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryImage {
    data: Vec<u8>,
    tags: Vec<bool>,
}

impl MemoryImage {
    /// Empty image of `size` bytes.
    pub fn new(size: u32) -> Self {
        Self {
            data: vec![0xff; size as usize],
            tags: vec![false; size as usize],
        }
    }

    /// Image with `bytes` placed at address 0.
    pub fn from_bytes(bytes: &[u8], size: u32) -> Result<Self> {
        let mut image = Self::new(size);
        image.write(0, bytes)?;
        Ok(image)
    }

    /// Load a raw binary or, for `.hex`/`.ihex` files, Intel HEX.
    pub fn from_file<P: AsRef<Path>>(path: P, size: u32) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read(path)?;
        let is_hex = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| matches!(e.to_ascii_lowercase().as_str(), "hex" | "ihex" | "ihx"));

        let image = if is_hex {
            let text = String::from_utf8(raw)
                .map_err(|_| Error::InvalidImage(format!("{} is not a text file", path.display())))?;
            ihex::parse(&text, size)?
        } else {
            Self::from_bytes(&raw, size)?
        };
        debug!(
            "loaded {} with {} bytes set",
            path.display(),
            image.allocated_count()
        );
        Ok(image)
    }

    /// Total size in bytes.
    pub fn size(&self) -> u32 {
        self.data.len() as u32
    }

    /// Set bytes and tag them.
    pub fn write(&mut self, addr: u32, bytes: &[u8]) -> Result<()> {
        let range = self.checked_range(addr, bytes.len())?;
        self.data[range.clone()].copy_from_slice(bytes);
        self.tags[range].fill(true);
        Ok(())
    }

    /// Set one byte and tag it.
    pub fn set(&mut self, addr: u32, byte: u8) {
        if let Some(slot) = self.data.get_mut(addr as usize) {
            *slot = byte;
            self.tags[addr as usize] = true;
        }
    }

    /// Byte at `addr`; 0xff outside the image.
    pub fn get(&self, addr: u32) -> u8 {
        self.data
            .get(addr as usize)
            .copied()
            .unwrap_or(0xff)
    }

    /// Whether `addr` is tagged.
    pub fn is_set(&self, addr: u32) -> bool {
        self.tags
            .get(addr as usize)
            .copied()
            .unwrap_or(false)
    }

    /// Tag `range` without changing contents.
    pub fn tag(&mut self, range: Range<u32>) {
        let end = (range.end as usize).min(self.tags.len());
        let start = (range.start as usize).min(end);
        self.tags[start..end].fill(true);
    }

    /// Drop tags in `range`; contents revert to 0xff.
    pub fn untag(&mut self, range: Range<u32>) {
        let end = (range.end as usize).min(self.tags.len());
        let start = (range.start as usize).min(end);
        self.tags[start..end].fill(false);
        self.data[start..end].fill(0xff);
    }

    /// Forget everything at and above `len`.
    pub fn truncate(&mut self, len: u32) {
        self.untag(len..self.size());
    }

    /// Raw contents.
    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    /// Contents of `range`.
    pub fn slice(&self, range: Range<u32>) -> &[u8] {
        &self.data[range.start as usize..range.end as usize]
    }

    /// Mutable contents of `range`, leaving tags alone.
    pub fn slice_mut(&mut self, range: Range<u32>) -> &mut [u8] {
        &mut self.data[range.start as usize..range.end as usize]
    }

    /// Number of tagged bytes in `range`.
    pub fn count_set(&self, range: Range<u32>) -> usize {
        let end = (range.end as usize).min(self.tags.len());
        let start = (range.start as usize).min(end);
        self.tags[start..end]
            .iter()
            .filter(|&&t| t)
            .count()
    }

    /// Number of tagged bytes.
    pub fn allocated_count(&self) -> usize {
        self.count_set(0..self.size())
    }

    /// One past the highest tagged address; 0 for an empty image.
    pub fn allocated_end(&self) -> u32 {
        self.tags
            .iter()
            .rposition(|&t| t)
            .map_or(0, |i| i as u32 + 1)
    }

    /// Start and length of the first contiguous tagged run.
    pub fn first_block(&self) -> Option<(u32, u32)> {
        let start = self
            .tags
            .iter()
            .position(|&t| t)?;
        let len = self.tags[start..]
            .iter()
            .take_while(|&&t| t)
            .count();
        Some((start as u32, len as u32))
    }

    /// Start addresses of `page_size` pages below `limit` holding any
    /// tagged byte.
    pub fn dirty_pages(&self, page_size: u32, limit: u32) -> Vec<u32> {
        let limit = limit.min(self.size());
        (0..limit)
            .step_by(page_size as usize)
            .filter(|&p| self.count_set(p..(p + page_size).min(limit)) > 0)
            .collect()
    }

    fn checked_range(&self, addr: u32, len: usize) -> Result<Range<usize>> {
        let start = addr as usize;
        let end = start + len;
        if end > self.data.len() {
            return Err(Error::Size(format!(
                "data [{start:#06x}, {:#06x}] beyond memory size {:#06x}",
                end.saturating_sub(1),
                self.data.len()
            )));
        }
        Ok(start..end)
    }
}
