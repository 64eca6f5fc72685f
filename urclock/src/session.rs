//! An open connection to a urboot or optiboot bootloader.
//!
//! [`Session::open`] resets the board, negotiates the protocol, works out
//! which part is connected and where its bootloader sits. Everything after
//! that goes through the session: paged and bytewise memory access, chip
//! erase, and the upload of a transformed image.
//!
//! ## Example
//!
//! ```rust,no_run
//! use urclock::{MemoryImage, Session, SessionOptions, TransformOptions, UploadSource};
//! use urclock::port::{NativePort, SerialConfig};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let port = NativePort::open(&SerialConfig::new("/dev/ttyUSB0", 115200))?;
//!     let mut session = Session::open(port, SessionOptions::default())?;
//!
//!     let flash = session.part().flash_size;
//!     let mut image = MemoryImage::from_file("blink.hex", flash)?;
//!     let source = UploadSource::from_path("blink.hex");
//!     session.transform_for_upload(&mut image, &TransformOptions::default(), &source)?;
//!     session.upload(&image, &mut |done, total| println!("{done}/{total}"))?;
//!     session.close()?;
//!     Ok(())
//! }
//! ```

use std::fmt;
use std::str::FromStr;
use std::thread;
use std::time::Duration;

use log::{debug, info, warn};

use crate::bootloader::{BootloaderGeometry, DetectOptions, Features, FlashReader, detect};
use crate::device::{self, McuDescriptor};
use crate::error::{Error, Result};
use crate::image::metadata::{MCODE_MAX, decode_filename};
use crate::image::{EraseState, MemoryImage, Metadata, TransformOptions, UploadSource, nmeta, transform};
use crate::opcode;
use crate::port::Port;
use crate::protocol::stk500::{Frame, PageLayout, UNIVERSAL_CE, legacy_address};
use crate::protocol::{Dialect, Memory, PageOp, SyncNegotiator, SyncOutcome};

/// Time for a series capacitor on the reset line to discharge.
const RESET_DISCHARGE: Duration = Duration::from_millis(20);

/// Reset pulse; longer pulses through a capacitor spike above Vcc.
const RESET_PULSE: Duration = Duration::from_micros(100);

/// Time the board needs to come out of reset, before any user delay.
const RESET_SETTLE_MS: i64 = 120;

/// Optiboot needs a pause between two successive sessions.
const OPTIBOOT_CLOSE_PAUSE: Duration = Duration::from_millis(200);

/// Where a board keeps its identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoardIdLocation {
    /// Memory holding the id.
    pub memory: Memory,
    /// Byte address; negative values count from the end of the memory.
    pub addr: i32,
    /// Number of bytes, 1 to 8, little endian.
    pub len: u8,
}

impl Default for BoardIdLocation {
    fn default() -> Self {
        Self {
            memory: Memory::Eeprom,
            addr: 257,
            len: 6,
        }
    }
}

impl FromStr for BoardIdLocation {
    type Err = Error;

    /// Parse `E.<addr>.<len>` or `F.<addr>.<len>`, e.g. `F.-4.2` for the
    /// penultimate flash word.
    fn from_str(s: &str) -> Result<Self> {
        let memory = match s.split_once('.') {
            Some(("E", _)) => Memory::Eeprom,
            Some(("F", _)) => Memory::Flash,
            _ => {
                return Err(Error::Config(format!(
                    "board id location {s} must start with E. or F."
                )));
            },
        };
        let Some((addr, len)) = s[2..].split_once('.') else {
            return Err(Error::Config(format!(
                "board id location {s} must look like [E|F].<addr>.<len>"
            )));
        };
        let addr = parse_int(addr)
            .ok_or_else(|| Error::Config(format!("address {addr} of board id location {s} is not a number")))?;
        let len = parse_int(len)
            .filter(|l| (1..=8).contains(l))
            .ok_or_else(|| Error::Config(format!("length {len} of board id location {s} must be between 1 and 8")))?;

        Ok(Self {
            memory,
            addr,
            len: len as u8,
        })
    }
}

impl fmt::Display for BoardIdLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mem = match self.memory {
            Memory::Eeprom => 'E',
            Memory::Flash => 'F',
        };
        write!(f, "{mem}.{}.{}", self.addr, self.len)
    }
}

fn parse_int(s: &str) -> Option<i32> {
    let (negative, digits) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s),
    };
    let value = match digits
        .strip_prefix("0x")
        .or_else(|| digits.strip_prefix("0X"))
    {
        Some(hex) => i32::from_str_radix(hex, 16).ok()?,
        None => digits.parse().ok()?,
    };
    Some(if negative { -value } else { value })
}

/// Board identity read from the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoardId {
    /// Little-endian value of the id bytes.
    pub value: u64,
    /// Number of bytes read.
    pub len: u8,
}

impl fmt::Display for BoardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:0width$x}", self.value, width = 2 * usize::from(self.len))
    }
}

/// How to talk to the bootloader and what to assume about it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOptions {
    /// Part name; needed when the bootloader does not identify the part.
    pub part: Option<String>,
    /// Bootloader size override in bytes.
    pub bootsize: Option<u32>,
    /// Vector bootloader vector override; `-1` for none.
    pub vectornum: Option<i32>,
    /// Assume EEPROM access even if the bootloader does not advertise it.
    pub eepromrw: bool,
    /// Never send chip erase; rewrite all application flash instead.
    pub emulate_ce: bool,
    /// Extra milliseconds to wait after the reset pulse; may be negative.
    pub delay_ms: i64,
    /// Pulse DTR/RTS to reset the board before syncing.
    pub autoreset: bool,
    /// Send well-formed `GET_SYNC` on every sync attempt.
    pub strict: bool,
    /// Do not read upload metadata from the device.
    pub nometadata: bool,
    /// Proceed despite a part or bootloader that contradicts the overrides.
    pub force: bool,
    /// Board identity location; defaults to `E.257.6`.
    pub board_id: Option<BoardIdLocation>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            part: None,
            bootsize: None,
            vectornum: None,
            eepromrw: false,
            emulate_ce: false,
            delay_ms: 0,
            autoreset: true,
            strict: false,
            nometadata: false,
            force: false,
            board_id: None,
        }
    }
}

/// Programming session with one bootloader.
///
/// Generic over the port type `P`, so tests can run it against a simulated
/// bootloader.
pub struct Session<P: Port> {
    port: P,
    options: SessionOptions,
    link: SyncOutcome,
    mcu: &'static McuDescriptor,
    layout: PageLayout,
    geo: BootloaderGeometry,
    /// Last `LEXT` byte sent on a legacy link.
    ext_cache: Option<u8>,
    erase: EraseState,
    metadata: Option<Metadata>,
}

impl<P: Port> Session<P> {
    /// Reset the board, sync and identify the part and its bootloader.
    pub fn open(port: P, options: SessionOptions) -> Result<Self> {
        let sync = SyncNegotiator::new().with_strict(options.strict);
        Self::open_with(port, options, &sync)
    }

    /// Like [`Session::open`] with a custom sync loop.
    pub fn open_with(mut port: P, options: SessionOptions, sync: &SyncNegotiator) -> Result<Self> {
        if options.autoreset {
            pulse_reset(&mut port, options.delay_ms)?;
        }

        debug!("syncing with bootloader on {}", port.name());
        let link = sync.negotiate(&mut port)?;
        port.send(&Frame::enter_progmode().build())?;
        expect_reply(&mut port, &link, 0, &mut [])?;

        let mcu = match link.bootinfo {
            Some(info) => device::resolve(Some(info.mcu_id), options.part.as_deref())?,
            None => {
                let mut signature = [0u8; 3];
                port.send(&Frame::read_signature().build())?;
                expect_reply(&mut port, &link, 0, &mut signature)?;
                resolve_signature(signature, options.part.as_deref(), options.force)?
            },
        };
        info!("{} bootloader for {}", link.dialect.name(), mcu.name);

        let urprotocol = link.dialect == Dialect::Native;
        let features = link.features();
        let mut geo = BootloaderGeometry::new(mcu.flash_size, mcu.page_size, mcu.interrupts);
        geo.urprotocol = urprotocol;
        geo.features = features;

        let detect_options = DetectOptions {
            bootsize: options.bootsize,
            vectornum: options.vectornum,
            force: options.force,
        };
        let mut session = Self {
            port,
            options,
            link,
            mcu,
            layout: PageLayout::from(mcu),
            geo,
            ext_cache: None,
            erase: EraseState::default(),
            metadata: None,
        };

        session.geo = detect(&mut session, mcu, urprotocol, features, &detect_options)?;
        info!("bootloader {}", session.geo.version_string());

        if !session.options.nometadata {
            session.metadata = session.read_metadata()?;
        }
        Ok(session)
    }

    /// Get a reference to the underlying port.
    pub fn port(&self) -> &P {
        &self.port
    }

    /// Get a mutable reference to the underlying port.
    pub fn port_mut(&mut self) -> &mut P {
        &mut self.port
    }

    /// Consume the session and return the underlying port.
    pub fn into_port(self) -> P {
        self.port
    }

    /// Connected part.
    pub fn part(&self) -> &'static McuDescriptor {
        self.mcu
    }

    /// Options the session was opened with.
    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    /// Bootloader geometry established at open.
    pub fn geometry(&self) -> &BootloaderGeometry {
        &self.geo
    }

    /// Framing in use.
    pub fn dialect(&self) -> Dialect {
        self.link.dialect
    }

    /// Feature bits from sync; empty on legacy links.
    pub fn features(&self) -> Features {
        self.link.features()
    }

    /// Bootloader version and capabilities, e.g. `u7.7 weu-jPrac`.
    pub fn version_string(&self) -> String {
        self.geo.version_string()
    }

    /// Upload metadata found on the device at open.
    pub fn metadata(&self) -> Option<&Metadata> {
        self.metadata.as_ref()
    }

    /// Pending chip-erase state.
    pub fn erase_state(&self) -> EraseState {
        self.erase
    }

    /// Whether EEPROM may be accessed.
    pub fn eeprom_access(&self) -> bool {
        self.geo.eeprom_rw || self.options.eepromrw
    }

    /// Keep the bootloader from timing out while idle.
    pub fn keep_alive(&mut self) -> Result<()> {
        self.command(&Frame::get_sync(), &mut [])
    }

    /// Signature bytes of the part. Urboot has identified the part during
    /// sync already, so only legacy links ask the device.
    pub fn read_signature(&mut self) -> Result<[u8; 3]> {
        if self.link.bootinfo.is_some() {
            return Ok(self.mcu.signature);
        }
        let mut signature = [0u8; 3];
        self.command(&Frame::read_signature(), &mut signature)?;
        Ok(signature)
    }

    /// Read `buf.len()` bytes starting at `addr`, a page at a time.
    ///
    /// Reading flash page 0 of a vector bootloader also rewrites a reset
    /// vector that no longer reaches the bootloader.
    pub fn paged_read(&mut self, mem: Memory, addr: u32, buf: &mut [u8]) -> Result<()> {
        self.check_readable(mem)?;
        self.check_range(mem, addr, buf.len())?;

        let page = self.mcu.page_size;
        let mut at = addr;
        for chunk in buf.chunks_mut(page as usize) {
            self.read_memory(mem, at, chunk)?;
            if at == 0 && mem == Memory::Flash {
                self.repair_reset(chunk)?;
            }
            at += chunk.len() as u32;
        }
        Ok(())
    }

    /// Write `data` starting at `addr`, a page at a time.
    ///
    /// Flash writes must start on a page boundary; a short last page is
    /// padded with 0xff.
    pub fn paged_write(&mut self, mem: Memory, addr: u32, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        if mem == Memory::Eeprom && !self.eeprom_access() {
            return Err(Error::Capability(self.eeprom_denied("write")));
        }
        self.check_range(mem, addr, data.len())?;

        let page = self.mcu.page_size;
        if mem == Memory::Flash && addr % page != 0 {
            return Err(Error::Size(format!(
                "flash writes must start on a {page}-byte page boundary, not at {addr:#06x}"
            )));
        }
        if self.link.dialect == Dialect::Legacy && addr & 1 == 1 {
            return Err(Error::Size(format!(
                "odd {} address {addr:#06x} cannot be written over a word-addressed link",
                mem.name()
            )));
        }

        let mut at = addr;
        for chunk in data.chunks(page as usize) {
            let mut payload = chunk.to_vec();
            if mem == Memory::Flash && payload.len() < page as usize {
                debug!("padding page at {at:#06x} with {} bytes 0xff", page as usize - payload.len());
                payload.resize(page as usize, 0xff);
            }
            self.write_chunk(mem, at, &mut payload)?;
            at += chunk.len() as u32;
        }
        Ok(())
    }

    /// Read one byte.
    pub fn read_byte(&mut self, mem: Memory, addr: u32) -> Result<u8> {
        self.check_range(mem, addr, 1)?;
        let mut byte = [0u8; 1];
        self.read_ef(mem, addr, &mut byte)?;
        Ok(byte[0])
    }

    /// Write one byte by rewriting the page or word around it.
    ///
    /// Refuses bootloader flash, the reset vector and the vector slot the
    /// bootloader uses.
    pub fn write_byte(&mut self, mem: Memory, addr: u32, value: u8) -> Result<()> {
        self.check_range(mem, addr, 1)?;
        match mem {
            Memory::Flash => {
                if self.geo.readonly(addr) {
                    return Err(Error::Safety(format!(
                        "flash address {addr:#06x} belongs to the bootloader or its vectors"
                    )));
                }
                let page = self.mcu.page_size;
                let base = addr - addr % page;
                let mut buf = vec![0u8; page as usize];
                self.check_readable(Memory::Flash)?;
                self.read_memory(Memory::Flash, base, &mut buf)?;
                buf[(addr - base) as usize] = value;
                self.write_chunk(Memory::Flash, base, &mut buf)
            },
            Memory::Eeprom => {
                if !self.eeprom_access() {
                    return Err(Error::Capability(self.eeprom_denied("write")));
                }
                if self.link.dialect == Dialect::Native {
                    return self.write_chunk(Memory::Eeprom, addr, &mut [value]);
                }
                let base = addr & !1;
                let mut word = [0u8; 2];
                self.read_ef(Memory::Eeprom, base, &mut word)?;
                word[(addr - base) as usize] = value;
                self.write_chunk(Memory::Eeprom, base, &mut word)
            },
        }
    }

    /// Erase the application flash.
    ///
    /// Bootloaders that cannot erase get the erase emulated: the next
    /// upload rewrites all application flash. Returns whether the erase was
    /// emulated.
    pub fn chip_erase(&mut self) -> Result<bool> {
        let page = self.mcu.page_size;
        let urboot = self.geo.urboot_version();
        let emulate = self.options.emulate_ce
            || (self.geo.urprotocol && !self.geo.features.has_chip_erase())
            || self.geo.is_optiboot()
            || (urboot != 0 && urboot < 0o76);

        if emulate {
            debug!("bootloader cannot erase the chip, emulating");
            self.erase.emulate = true;
            return Ok(true);
        }

        let timeout = if page > 2 {
            Duration::from_millis(u64::from(500 + self.mcu.flash_size / page * 20))
        } else {
            Duration::from_secs(20)
        };
        let saved = self.port.timeout();
        self.port.set_timeout(timeout)?;
        let erased = match self.link.dialect {
            Dialect::Native => {
                debug!("chip erase via urprotocol");
                self.command(&Frame::chip_erase(), &mut [])
            },
            Dialect::Legacy => {
                debug!("chip erase via universal STK500v1 command");
                let mut echo = [0u8; 1];
                self.command(&Frame::universal(UNIVERSAL_CE), &mut echo)
            },
        };
        self.port.set_timeout(saved)?;
        erased?;
        self.erase.done = true;

        // Reset must reach the bootloader again
        if let Some((jump, resetsize)) = self.guarded_reset() {
            if page >= self.geo.vector_size() {
                let mut page0 = vec![0xff; page as usize];
                page0[..resetsize].copy_from_slice(&jump[..resetsize]);
                self.write_chunk(Memory::Flash, 0, &mut page0)?;
            }
        }
        info!("chip erased");
        Ok(false)
    }

    /// Read the board identity.
    pub fn board_id(&mut self) -> Result<BoardId> {
        let explicit = self.options.board_id;
        let mut loc = explicit.unwrap_or_default();
        let eeprom = i64::from(self.mcu.eeprom_size);

        // Small parts keep the default id elsewhere
        if explicit.is_none() && i64::from(loc.addr) + i64::from(loc.len) > eeprom {
            loc.addr = 0;
            if eeprom < 8 {
                loc.memory = Memory::Flash;
            }
        }

        let size = match loc.memory {
            Memory::Flash => i64::from(self.mcu.flash_size),
            Memory::Eeprom => eeprom,
        };
        let mut addr = i64::from(loc.addr);
        if addr < 0 {
            addr += size;
        }
        let len = usize::from(loc.len);
        if addr < 0 || addr + len as i64 > size {
            return Err(Error::Size(format!(
                "board id at {loc} is outside {} range [0, {:#06x}]",
                loc.memory.name(),
                size - 1
            )));
        }

        let mut raw = [0u8; 8];
        self.read_ef(loc.memory, addr as u32, &mut raw[..len])?;
        Ok(BoardId {
            value: u64::from_le_bytes(raw),
            len: loc.len,
        })
    }

    /// Run the pre-upload pipeline on `image` against this device.
    ///
    /// Returns one past the last byte of application and metadata.
    pub fn transform_for_upload(
        &mut self,
        image: &mut MemoryImage,
        opts: &TransformOptions,
        source: &UploadSource,
    ) -> Result<u32> {
        let geo = self.geo.clone();
        let mut erase = self.erase;
        let extent = transform(image, &geo, opts, source, &mut erase, self)?;
        self.erase = erase;
        Ok(extent)
    }

    /// Write every flash page of `image` that holds a set byte.
    ///
    /// `progress` is called with pages written and pages total. Returns the
    /// number of pages written.
    pub fn upload(
        &mut self,
        image: &MemoryImage,
        progress: &mut dyn FnMut(usize, usize),
    ) -> Result<usize> {
        if image.size() != self.mcu.flash_size {
            return Err(Error::Size(format!(
                "image of {} bytes does not match flash size {}",
                image.size(),
                self.mcu.flash_size
            )));
        }

        let page = self.mcu.page_size;
        let pages = image.dirty_pages(page, self.geo.app_end());
        let total = pages.len();
        for (n, &addr) in pages.iter().enumerate() {
            if crate::is_interrupted_requested() {
                return Err(Error::Interrupted);
            }
            let mut payload = image
                .slice(addr..addr + page)
                .to_vec();
            self.write_chunk(Memory::Flash, addr, &mut payload)?;
            progress(n + 1, total);
        }
        info!("wrote {total} flash pages");
        Ok(total)
    }

    /// Leave programming mode; the bootloader starts the application.
    pub fn close(&mut self) -> Result<()> {
        self.command(&Frame::leave_progmode(), &mut [])?;
        if self.geo.is_optiboot() {
            thread::sleep(OPTIBOOT_CLOSE_PAUSE);
        }
        self.port.close()
    }

    fn command(&mut self, frame: &Frame, reply: &mut [u8]) -> Result<()> {
        self.port.send(&frame.build())?;
        expect_reply(&mut self.port, &self.link, 0, reply)
    }

    fn send_page_request(
        &mut self,
        op: PageOp,
        mem: Memory,
        addr: u32,
        len: usize,
        payload: &[u8],
    ) -> Result<()> {
        let frame = match self.link.dialect {
            Dialect::Native => Frame::native_page(op, mem, addr, len, payload, self.layout)?,
            Dialect::Legacy => {
                let frame = Frame::legacy_page(op, mem, len, payload, self.layout)?;
                let target = legacy_address(&mut self.ext_cache, mem, addr, self.layout);
                if let Some(ext) = target.extended {
                    let mut echo = [0u8; 1];
                    self.command(&Frame::load_extended(ext), &mut echo)?;
                }
                self.command(&Frame::load_address(target.word), &mut [])?;
                frame
            },
        };
        self.port.send(&frame.build())
    }

    /// One read frame. Legacy links address words, so an odd start reads
    /// one extra byte from the even address below and drops it.
    fn read_ef(&mut self, mem: Memory, addr: u32, buf: &mut [u8]) -> Result<()> {
        self.check_readable(mem)?;
        let max = self.layout.max_transfer() as usize;
        let odd = self.link.dialect == Dialect::Legacy && addr & 1 == 1;
        let len = buf.len() + usize::from(odd);
        if buf.is_empty() || len > max {
            return Err(Error::Size(format!(
                "{} read of {len} bytes at {addr:#06x} outside [1, {max}]",
                mem.name()
            )));
        }

        let start = if odd { addr & !1 } else { addr };
        self.send_page_request(PageOp::Read, mem, start, len, &[])?;
        expect_reply(&mut self.port, &self.link, usize::from(odd), buf)
    }

    /// Any number of bytes, as few frames as possible.
    fn read_memory(&mut self, mem: Memory, addr: u32, buf: &mut [u8]) -> Result<()> {
        let mut step = self.layout.max_transfer() as usize;
        if self.link.dialect == Dialect::Legacy {
            // Room for the extra byte of an odd start
            step -= 1;
        }
        let mut at = addr;
        for chunk in buf.chunks_mut(step) {
            self.read_ef(mem, at, chunk)?;
            at += chunk.len() as u32;
        }
        Ok(())
    }

    /// One write frame, with page 0 of a vector bootloader forced to keep
    /// its reset jump.
    fn write_chunk(&mut self, mem: Memory, addr: u32, payload: &mut [u8]) -> Result<()> {
        if mem == Memory::Flash {
            self.guard_reset(addr, payload);
        }
        self.send_page_request(PageOp::Write, mem, addr, payload.len(), payload)?;
        expect_reply(&mut self.port, &self.link, 0, &mut [])
    }

    /// Reset jump into the bootloader, when the uploader is responsible for
    /// it.
    fn guarded_reset(&self) -> Option<([u8; 4], usize)> {
        if self.geo.patches_reset() {
            self.geo.reset_to_bootloader()
        } else {
            None
        }
    }

    fn guard_reset(&self, addr: u32, payload: &mut [u8]) {
        let Some((jump, resetsize)) = self.guarded_reset() else {
            return;
        };
        let badd = addr as usize;
        if badd >= resetsize {
            return;
        }

        let vecsz = self.geo.vector_size();
        let n = (resetsize - badd).min(payload.len());
        if badd == 0 && payload.len() >= vecsz as usize {
            if opcode::reset_target(payload, vecsz, self.geo.flash_size) != self.geo.start {
                payload[..resetsize].copy_from_slice(&jump[..resetsize]);
                info!("forcing reset vector to point to vector bootloader");
            }
        } else if payload[..n] != jump[badd..badd + n] {
            payload[..n].copy_from_slice(&jump[badd..badd + n]);
            info!("forcing partial reset vector to point to vector bootloader");
        }
    }

    fn repair_reset(&mut self, head: &mut [u8]) -> Result<()> {
        let Some((jump, resetsize)) = self.guarded_reset() else {
            return Ok(());
        };
        let vecsz = self.geo.vector_size();
        if head.len() < vecsz as usize
            || opcode::reset_target(head, vecsz, self.geo.flash_size) == self.geo.start
        {
            return Ok(());
        }

        let page = self.mcu.page_size as usize;
        let n = head.len().min(page);
        let mut page0 = vec![0xff; page];
        page0[..n].copy_from_slice(&head[..n]);
        if n < page {
            self.read_memory(Memory::Flash, n as u32, &mut page0[n..])?;
        }
        page0[..resetsize].copy_from_slice(&jump[..resetsize]);
        head[..resetsize].copy_from_slice(&jump[..resetsize]);

        info!("en passant forcing reset vector to point to vector bootloader");
        self.write_chunk(Memory::Flash, 0, &mut page0)
    }

    fn check_readable(&self, mem: Memory) -> Result<()> {
        match mem {
            Memory::Flash if !self.geo.can_read_flash() => Err(Error::Capability(
                "bootloader does not have flash read capability".to_string(),
            )),
            Memory::Eeprom if !self.eeprom_access() => Err(Error::Capability(self.eeprom_denied("read"))),
            _ => Ok(()),
        }
    }

    fn eeprom_denied(&self, what: &str) -> String {
        if self.geo.urboot_version() != 0 {
            format!("bootloader does not have EEPROM {what} capability")
        } else {
            format!("bootloader might not have EEPROM {what}; try eepromrw if it has")
        }
    }

    fn check_range(&self, mem: Memory, addr: u32, len: usize) -> Result<()> {
        let size = match mem {
            Memory::Flash => self.mcu.flash_size,
            Memory::Eeprom => self.mcu.eeprom_size,
        };
        let end = u64::from(addr) + len as u64;
        if end > u64::from(size) {
            return Err(Error::Size(format!(
                "{} range [{addr:#06x}, {:#06x}] outside [0, {:#06x}]",
                mem.name(),
                end.saturating_sub(1),
                size.saturating_sub(1)
            )));
        }
        Ok(())
    }

    /// Metadata block just below the bootloader, if one is there.
    fn read_metadata(&mut self) -> Result<Option<Metadata>> {
        let flash = self.geo.flash_size;
        let app_end = self.geo.app_end();
        if !self.geo.can_read_flash() || self.geo.program_end() < nmeta(MCODE_MAX, flash) {
            return Ok(None);
        }

        let n = nmeta(1, flash);
        let mut tail = vec![0u8; n as usize];
        self.read_memory(Memory::Flash, app_end - n, &mut tail)?;
        let Some(mut meta) = Metadata::parse(&tail, flash, app_end) else {
            debug!("no metadata below {app_end:#06x}");
            return Ok(None);
        };

        if meta.mcode > 1 {
            let mut name = vec![0u8; usize::from(meta.mcode)];
            self.read_memory(Memory::Flash, app_end - nmeta(meta.mcode, flash), &mut name)?;
            meta.filename = Some(decode_filename(&name));
        }
        debug!(
            "metadata: application {} bytes, store {} bytes",
            meta.store_start, meta.store_size
        );
        Ok(Some(meta))
    }
}

impl<P: Port> FlashReader for Session<P> {
    fn can_read_flash(&self) -> bool {
        self.geo.can_read_flash()
    }

    fn read_flash(&mut self, addr: u32, buf: &mut [u8]) -> Result<()> {
        self.check_range(Memory::Flash, addr, buf.len())?;
        self.read_memory(Memory::Flash, addr, buf)
    }
}

/// Receive `INSYNC`, `skip` ignored bytes, `payload` and `OK`.
fn expect_reply<P: Port + ?Sized>(
    port: &mut P,
    link: &SyncOutcome,
    skip: usize,
    payload: &mut [u8],
) -> Result<()> {
    let mut byte = [0u8; 1];
    port.recv(&mut byte)?;
    link.check_insync(byte[0])?;
    for _ in 0..skip {
        port.recv(&mut byte)?;
    }
    port.recv(payload)?;
    port.recv(&mut byte)?;
    link.check_ok(byte[0])
}

/// Reset through a negative-logic USB-serial adapter: release the lines so
/// a series capacitor discharges, pull reset low briefly, release again and
/// wait for the board to come up.
fn pulse_reset<P: Port + ?Sized>(port: &mut P, delay_ms: i64) -> Result<()> {
    port.set_dtr_rts(false)?;
    thread::sleep(RESET_DISCHARGE);
    port.set_dtr_rts(true)?;
    thread::sleep(RESET_PULSE);
    port.set_dtr_rts(false)?;

    let settle = RESET_SETTLE_MS + delay_ms;
    if settle > 0 {
        thread::sleep(Duration::from_millis(settle as u64));
    }
    Ok(())
}

fn resolve_signature(
    signature: [u8; 3],
    part: Option<&str>,
    force: bool,
) -> Result<&'static McuDescriptor> {
    let hex = format!("{:02x}{:02x}{:02x}", signature[0], signature[1], signature[2]);
    if let Some(name) = part {
        let given = device::by_name(name).ok_or_else(|| Error::UnknownMcu(format!("no part named {name}")))?;
        if given.signature != signature {
            if !force {
                return Err(Error::UnknownMcu(format!(
                    "connected part's signature {hex} does not match {}'s; use force to override",
                    given.name
                )));
            }
            warn!("signature {hex} does not match {}, proceeding as forced", given.name);
        }
        return Ok(given);
    }

    let found: Vec<_> = device::by_signature(signature).collect();
    match found.as_slice() {
        [] => Err(Error::UnknownMcu(format!(
            "no part with signature {hex}; specify the part"
        ))),
        [only] => Ok(*only),
        [first, ..] => {
            warn!(
                "signature {hex} is shared by {}; assuming {}",
                found
                    .iter()
                    .map(|m| m.name)
                    .collect::<Vec<_>>()
                    .join(", "),
                first.name
            );
            Ok(*first)
        },
    }
}
