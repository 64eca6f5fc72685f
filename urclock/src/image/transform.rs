//! Prepare an input image for upload next to a high-flash bootloader.
//!
//! Nothing here writes to the device; flash is only read to fill page
//! holes and to look at the reset vector and old metadata. Every check that
//! can refuse the upload runs before the first page goes out.
//!
//! Steps, in order (restore mode stops after trimming the input below the
//! bootloader):
//!
//! 1. refuse input that overlaps the bootloader, dropping metadata fields
//!    until the rest fits below it
//! 2. redirect reset to the bootloader and move the application entry into
//!    the bootloader's vector slot
//! 3. write the metadata block, or a single 0xff byte
//! 4. blank stale metadata left on the device
//! 5. mark all application flash when chip erase is emulated
//! 6. make sure reset still reaches the bootloader
//! 7. pad partially set pages from device flash or with 0xff

use std::fs;
use std::path::Path;

use byteorder::{ByteOrder, LittleEndian};
use chrono::{DateTime, Local, TimeDelta};
use log::{debug, warn};

use super::MemoryImage;
use super::metadata::{MCODE_NONE, Metadata, UploadDate, nmeta, truncate_filename};
use crate::bootloader::{BootloaderGeometry, FlashReader, VectorLevel};
use crate::error::{Error, Result};
use crate::opcode;

/// Chip-erase bookkeeping shared between the session and the transformer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EraseState {
    /// A real chip erase just happened; flash reads as 0xff.
    pub done: bool,
    /// Chip erase is due but the bootloader cannot do it: the next upload
    /// must rewrite all application flash.
    pub emulate: bool,
}

/// Upload switches.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransformOptions {
    /// Upload the input as is, only trimmed below the bootloader.
    pub restore: bool,
    /// No metadata at all, not even the 0xff marker.
    pub nometadata: bool,
    /// Keep the store location but no date or filename.
    pub nodate: bool,
    /// Keep date and store location but no filename.
    pub nofilename: bool,
    /// Only the 0xff marker byte.
    pub nostore: bool,
    /// Blank the store area between application and metadata.
    pub initstore: bool,
    /// Patch a wrong reset vector instead of refusing the input.
    pub force: bool,
    /// Name recorded instead of the input's file name.
    pub title: Option<String>,
}

/// Where the input came from, as recorded in the metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadSource {
    /// Base name of the input file.
    pub filename: Option<String>,
    /// Its modification time.
    pub date: UploadDate,
}

impl UploadSource {
    /// Explicit name and date.
    pub fn new(filename: Option<String>, date: UploadDate) -> Self {
        Self { filename, date }
    }

    /// Base name and modification time of `path`; the current time when
    /// the file has none. Rounded to the nearest minute.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref();
        let modified = fs::metadata(path)
            .and_then(|m| m.modified())
            .ok();
        let when = modified.map_or_else(Local::now, DateTime::<Local>::from) + TimeDelta::seconds(30);

        Self {
            filename: path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned()),
            date: UploadDate::from_datetime(&when),
        }
    }
}

/// Run the pre-upload pipeline on `image`.
///
/// Returns the extent of the upload: one past the last byte that belongs to
/// the application or its metadata.
pub fn transform<R: FlashReader + ?Sized>(
    image: &mut MemoryImage,
    geo: &BootloaderGeometry,
    opts: &TransformOptions,
    source: &UploadSource,
    erase: &mut EraseState,
    reader: &mut R,
) -> Result<u32> {
    let flash = geo.flash_size;
    if image.size() != flash {
        return Err(Error::Size(format!(
            "image of {} bytes does not match flash size {flash}",
            image.size()
        )));
    }

    let maxsize = geo.app_end();
    let pfend = geo.program_end();
    let (firstbeg, firstlen) = image
        .first_block()
        .unwrap_or((maxsize, 0));

    let filename = truncate_filename(
        opts.title
            .as_deref()
            .or(source.filename.as_deref())
            .unwrap_or(""),
    );
    let mcode = if opts.nometadata || opts.nostore {
        MCODE_NONE
    } else if opts.nodate {
        0
    } else if opts.nofilename {
        1
    } else {
        (filename.len() + 1) as u8
    };

    let mut size = image.allocated_end();
    if opts.restore {
        // Uploaded as is; the commit guard still keeps reset on the bootloader
        if size > maxsize {
            image.truncate(maxsize);
            size = maxsize;
        }
        debug!("restore: upload trimmed to {size:#06x}, nothing patched");
        return Ok(size);
    }
    if let Some(start) = geo.start {
        size = place_application(image, geo, opts, source, filename, mcode, start, size, firstlen)?;
    }

    let known = geo.start.is_some();
    if known && reader.can_read_flash() {
        let mut devmcode = [0u8; 1];
        reader.read_flash(pfend, &mut devmcode)?;
        let devnmeta = nmeta(devmcode[0], flash);
        for addr in maxsize.saturating_sub(devnmeta)..maxsize {
            if !image.is_set(addr) {
                image.set(addr, 0xff);
            }
        }
    }

    if erase.emulate {
        image.tag(0..maxsize);
        erase.emulate = false;
    }

    if let Some(start) = geo
        .start
        .filter(|_| geo.vector_level == VectorLevel::Jump)
    {
        protect_reset(image, geo, opts.force, start, firstbeg, reader)?;
    }

    let page = geo.page_size;
    if !page.is_power_of_two() || page > maxsize || maxsize % page != 0 {
        return Err(Error::Size(format!(
            "page size {page} implausible for size {maxsize} below bootloader"
        )));
    }

    let nor = geo.urprotocol && geo.features.is_nor();
    if !erase.done && !nor && reader.can_read_flash() {
        pad_from_device(image, page, maxsize, reader)?;
    }
    erase.done = false;

    for addr in (0..maxsize).step_by(page as usize) {
        let nset = image.count_set(addr..addr + page);
        if nset != 0 && nset != page as usize {
            debug!("0xff padding page {addr:#06x}");
            for a in addr..addr + page {
                if !image.is_set(a) {
                    image.set(a, 0xff);
                }
            }
        }
    }

    Ok(size)
}

/// Steps 1 to 3 for a bootloader at `start`.
#[allow(clippy::too_many_arguments)]
fn place_application(
    image: &mut MemoryImage,
    geo: &BootloaderGeometry,
    opts: &TransformOptions,
    source: &UploadSource,
    filename: &str,
    mut mcode: u8,
    start: u32,
    mut size: u32,
    firstlen: u32,
) -> Result<u32> {
    let flash = geo.flash_size;
    let maxsize = start;
    let pfend = maxsize - 1;
    let mut nmdata = if opts.nometadata {
        0
    } else {
        nmeta(mcode, flash)
    };

    // Input that already went through here carries its own metadata block
    if let Some(app_end) = strip_metadata(image, flash, maxsize) {
        size = app_end;
    }
    let firstbeg = image
        .first_block()
        .map_or(maxsize, |(b, _)| b);

    if size > maxsize {
        return Err(Error::Overlap(format!(
            "input [{firstbeg:#06x}, {:#06x}] overlaps bootloader [{start:#06x}, {:#06x}]; consider restore",
            size - 1,
            flash - 1
        )));
    }

    if !opts.nometadata {
        if size == maxsize {
            return Err(Error::Overlap(format!(
                "input [{firstbeg:#06x}, {:#06x}] overlaps metadata code byte at {pfend:#06x}; consider nometadata",
                size - 1
            )));
        }

        let meta0 = nmeta(0, flash);
        let meta1 = nmeta(1, flash);
        if nmdata >= meta0 && size > maxsize - meta0 {
            warn!(
                "input [{firstbeg:#06x}, {:#06x}] overlaps metadata [{:#06x}, {pfend:#06x}], selecting nostore",
                size - 1,
                maxsize - nmdata
            );
            mcode = MCODE_NONE;
            nmdata = 1;
        }
        if nmdata >= meta1 && size > maxsize - meta1 {
            warn!(
                "input [{firstbeg:#06x}, {:#06x}] overlaps metadata [{:#06x}, {pfend:#06x}], selecting nodate",
                size - 1,
                maxsize - nmdata
            );
            mcode = 0;
            nmdata = meta0;
        }
        if size > maxsize - nmdata {
            warn!(
                "input [{firstbeg:#06x}, {:#06x}] overlaps metadata [{:#06x}, {pfend:#06x}], selecting nofilename",
                size - 1,
                maxsize - nmdata
            );
            mcode = 1;
            nmdata = meta1;
        }
    }

    patch_vectors(image, geo, start, size, firstbeg, firstlen);

    if nmdata > 0 {
        let nfree = maxsize - size;
        if nfree >= nmdata {
            let meta = Metadata {
                mcode,
                filename: (mcode > 1 && mcode != MCODE_NONE).then(|| filename.to_string()),
                date: (mcode >= 1 && mcode != MCODE_NONE).then_some(source.date),
                store_start: size,
                store_size: nfree - nmdata,
            };
            debug!(
                "metadata {:?} {} store {} at {:#06x}",
                filename,
                source.date,
                meta.store_size,
                maxsize - nmdata
            );
            image.write(maxsize - nmdata, &meta.encode(flash))?;
            if opts.initstore {
                image.tag(size..size + meta.store_size);
            }
            size = maxsize;
        }
    }

    if size < maxsize && nmdata == 0 {
        image.set(pfend, 0xff);
        size = maxsize;
    }
    Ok(size)
}

/// Recognise a metadata block this pipeline wrote earlier and remove it.
/// Returns where the application proper ends.
fn strip_metadata(image: &mut MemoryImage, flash: u32, maxsize: u32) -> Option<u32> {
    let pfend = maxsize.checked_sub(1)?;
    if !image.is_set(pfend) {
        return None;
    }

    let mcode = image.get(pfend);
    if mcode == MCODE_NONE {
        image.untag(pfend..maxsize);
        return Some(image.allocated_end());
    }

    let nm = nmeta(mcode, flash);
    let from = maxsize.checked_sub(nm)?;
    if image.count_set(from..maxsize) != nm as usize {
        return None;
    }
    let meta = Metadata::parse(image.slice(from..maxsize), flash, maxsize)?;
    image.untag(from..maxsize);
    Some(meta.store_start)
}

/// Step 2: only for code that starts with a complete vector table.
fn patch_vectors(
    image: &mut MemoryImage,
    geo: &BootloaderGeometry,
    start: u32,
    size: u32,
    firstbeg: u32,
    firstlen: u32,
) {
    let flash = geo.flash_size;
    let vecsz = geo.vector_size();
    let table = u32::from(geo.interrupts) * vecsz;
    let vn = u32::from(geo.vector_number);
    let vbl = geo.vector_level != VectorLevel::None;

    let llcode = firstbeg == 0 && firstlen > table;
    let llvectors = firstbeg == 0
        && firstlen >= table
        && (0..table)
            .step_by(vecsz as usize)
            .all(|i| {
                let op = LittleEndian::read_u16(image.slice(i..i + 2));
                opcode::is_rjmp(op) || (vecsz == 4 && opcode::is_jmp(op))
            });

    if llcode && !llvectors && vn > 0 && vbl {
        warn!("not patching jmp to application as input does not start with a vector table");
    }
    if !(llcode && llvectors && vn > 0 && vbl) {
        return;
    }

    // Before u7.5 only bootloaders that rely on the uploader get patched
    let version = geo.urboot_version();
    if version < 0o75 && !((version == 0 || version >= 0o72) && geo.vector_level == VectorLevel::Jump) {
        return;
    }

    let Some(appstart) = opcode::reset_target(image.slice(0..vecsz), vecsz, flash) else {
        warn!(
            "not patching input as opcode word {:04x} at reset is not a{}jmp",
            LittleEndian::read_u16(image.slice(0..2)),
            if vecsz == 2 { "n r" } else { " " }
        );
        return;
    };
    if appstart == start {
        return;
    }

    let vectors_end = vecsz * vn;
    if appstart < vectors_end || appstart >= size {
        warn!(
            "not patching as reset jumps to {appstart:#06x}, outside code area [{vectors_end:#06x}, {size:#06x})"
        );
        return;
    }

    let (jump, n) = opcode::reset_to_bootloader(start, flash);
    image.slice_mut(0..n as u32).copy_from_slice(&jump[..n]);
    let slot = vectors_end;
    if vecsz == 4 {
        LittleEndian::write_u32(image.slice_mut(slot..slot + 4), opcode::jmp_opcode(appstart));
    } else {
        let rjmp = opcode::rjmp_opcode(appstart as i32 - slot as i32, flash);
        LittleEndian::write_u16(image.slice_mut(slot..slot + 2), rjmp);
    }
    debug!("reset now enters bootloader at {start:#06x}, vector {vn} enters application at {appstart:#06x}");
}

/// Step 6.
fn protect_reset<R: FlashReader + ?Sized>(
    image: &mut MemoryImage,
    geo: &BootloaderGeometry,
    force: bool,
    start: u32,
    firstbeg: u32,
    reader: &mut R,
) -> Result<()> {
    let flash = geo.flash_size;
    let vecsz = geo.vector_size();
    let set = image.count_set(0..vecsz);
    let (jump, n) = opcode::reset_to_bootloader(start, flash);

    if force || set != vecsz as usize {
        if reader.can_read_flash() {
            let mut probe = [0u8; 4];
            probe[..vecsz as usize].copy_from_slice(image.slice(0..vecsz));
            if set != vecsz as usize {
                let mut device = [0u8; 4];
                reader.read_flash(0, &mut device[..vecsz as usize])?;
                for i in 0..vecsz {
                    if !image.is_set(i) {
                        probe[i as usize] = device[i as usize];
                    }
                }
            }
            if opcode::reset_target(&probe[..vecsz as usize], vecsz, flash) == Some(start) {
                return Ok(());
            }
        }
        debug!("setting reset vector to jump to bootloader at {start:#06x}");
        return image.write(0, &jump[..n]);
    }

    if firstbeg < vecsz {
        match opcode::reset_target(image.slice(0..vecsz), vecsz, flash) {
            None => {
                return Err(Error::Safety(
                    "input would overwrite the reset vector bricking the bootloader; force will try to patch the input"
                        .to_string(),
                ));
            },
            Some(dest) if dest != start => {
                return Err(Error::Safety(format!(
                    "input points reset to {dest:#06x}, not to bootloader at {start:#06x}; force will try to patch the input"
                )));
            },
            Some(_) => {},
        }
    }
    Ok(())
}

/// Step 7, first half: read what partially set pages lack from the device.
fn pad_from_device<R: FlashReader + ?Sized>(
    image: &mut MemoryImage,
    page: u32,
    maxsize: u32,
    reader: &mut R,
) -> Result<()> {
    for addr in (0..maxsize).step_by(page as usize) {
        let end = addr + page;
        let nset = image.count_set(addr..end);
        if nset == 0 || nset == page as usize {
            continue;
        }

        let Some(first) = (addr..end).find(|&a| !image.is_set(a)) else {
            continue;
        };
        let Some(last) = (first..end).rev().find(|&a| !image.is_set(a)) else {
            continue;
        };

        let mut buf = vec![0u8; (last - first + 1) as usize];
        match reader.read_flash(first, &mut buf) {
            Ok(()) => {
                debug!("padding [{first:#06x}, {last:#06x}]");
                for (a, &b) in (first..=last).zip(&buf) {
                    if !image.is_set(a) {
                        image.set(a, b);
                    }
                }
            },
            Err(e) if e.is_recoverable() => {
                debug!("cannot read flash [{first:#06x}, {last:#06x}] to pad page bytes: {e}");
            },
            Err(e) => return Err(e),
        }
    }
    Ok(())
}
