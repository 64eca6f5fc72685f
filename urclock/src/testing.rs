//! Test doubles: a scripted port, a flash fake and a simulated bootloader.

use std::collections::VecDeque;
use std::io::{self, ErrorKind, Read, Write};
use std::time::Duration;

use byteorder::{BigEndian, ByteOrder, LittleEndian};

use crate::bootloader::FlashReader;
use crate::error::{Error, Result};
use crate::port::Port;
use crate::protocol::encode_bootinfo;
use crate::protocol::stk500::{EOP, RESP_INSYNC, RESP_OK};

/// Port that answers every flushed frame with the next scripted reply and
/// times out once the script runs dry.
#[derive(Debug, Default)]
pub struct MockPort {
    replies: VecDeque<Vec<u8>>,
    pending: VecDeque<u8>,
    written: Vec<u8>,
    timeout: Duration,
    /// DTR/RTS levels in the order they were set.
    pub lines: Vec<bool>,
}

impl MockPort {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the reply to the next frame.
    pub fn reply(&mut self, bytes: &[u8]) {
        self.replies
            .push_back(bytes.to_vec());
    }

    /// Everything sent so far.
    pub fn written(&self) -> &[u8] {
        &self.written
    }
}

impl Read for MockPort {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pending.is_empty() {
            return Err(io::Error::new(ErrorKind::TimedOut, "no data"));
        }
        let n = buf.len().min(self.pending.len());
        for (slot, b) in buf
            .iter_mut()
            .zip(self.pending.drain(..n))
        {
            *slot = b;
        }
        Ok(n)
    }
}

impl Write for MockPort {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.written
            .extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if let Some(reply) = self.replies.pop_front() {
            self.pending.extend(reply);
        }
        Ok(())
    }
}

impl Port for MockPort {
    fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
        self.timeout = timeout;
        Ok(())
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn clear_buffers(&mut self) -> Result<()> {
        self.pending.clear();
        Ok(())
    }

    fn name(&self) -> &str {
        "mock"
    }

    fn set_dtr(&mut self, level: bool) -> Result<()> {
        self.lines.push(level);
        Ok(())
    }

    fn set_rts(&mut self, _level: bool) -> Result<()> {
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Flash contents behind the [`FlashReader`] seam.
#[derive(Debug, Clone)]
pub struct FlashImage {
    pub bytes: Vec<u8>,
    pub readable: bool,
    /// Number of `read_flash` calls.
    pub reads: usize,
}

impl FlashImage {
    /// Erased flash of `size` bytes.
    pub fn erased(size: u32) -> Self {
        Self {
            bytes: vec![0xff; size as usize],
            readable: true,
            reads: 0,
        }
    }
}

impl FlashReader for FlashImage {
    fn can_read_flash(&self) -> bool {
        self.readable
    }

    fn read_flash(&mut self, addr: u32, buf: &mut [u8]) -> Result<()> {
        if !self.readable {
            return Err(Error::Capability("flash not readable".into()));
        }
        self.reads += 1;
        let start = addr as usize;
        let src = self
            .bytes
            .get(start..start + buf.len())
            .ok_or_else(|| Error::Size(format!("read beyond flash at {addr:#06x}")))?;
        buf.copy_from_slice(src);
        Ok(())
    }
}

/// Urboot or optiboot device on the other end of a [`Port`].
///
/// Frames are interpreted one per flush, which is how `Port::send` emits
/// them.
#[derive(Debug)]
pub struct SimBootloader {
    pub flash: Vec<u8>,
    pub eeprom: Vec<u8>,
    pub page_size: u32,
    /// Bootloader start; chip erase and page writes stop below it.
    pub start: u32,
    pub signature: [u8; 3],
    /// Reply pair; `None` for a legacy bootloader.
    pub native: Option<(u8, u8)>,
    /// Flash page writes as (address, length).
    pub page_writes: Vec<(u32, usize)>,
    pub chip_erases: usize,
    pub progmode: bool,
    /// Answer nothing at all.
    pub mute: bool,
    word: u32,
    ext: u32,
    inbox: Vec<u8>,
    pending: VecDeque<u8>,
    timeout: Duration,
    pub lines: Vec<bool>,
}

impl SimBootloader {
    /// Urprotocol bootloader built for `mcu_id` with `features`.
    pub fn native(flash_size: u32, page_size: u32, start: u32, mcu_id: u16, features: u8) -> Self {
        let mut sim = Self::legacy(flash_size, page_size, start, [0x1e, 0x95, 0x0f]);
        sim.native = Some(encode_bootinfo(mcu_id, features));
        sim
    }

    /// STK500v1 bootloader answering with `signature`.
    pub fn legacy(flash_size: u32, page_size: u32, start: u32, signature: [u8; 3]) -> Self {
        Self {
            flash: vec![0xff; flash_size as usize],
            eeprom: vec![0xff; 1024],
            page_size,
            start,
            signature,
            native: None,
            page_writes: Vec::new(),
            chip_erases: 0,
            progmode: false,
            mute: false,
            word: 0,
            ext: 0,
            inbox: Vec::new(),
            pending: VecDeque::new(),
            timeout: Duration::ZERO,
            lines: Vec::new(),
        }
    }

    /// Place a urboot trailer at the top of flash.
    pub fn with_trailer(mut self, vectnum: u8, capabilities: u8, version: u8) -> Self {
        let flash = self.flash.len();
        let pages = ((flash as u32 - self.start) / self.page_size) as u8;
        let wp = crate::opcode::RET.to_le_bytes();
        self.flash[flash - 6..].copy_from_slice(&[pages, vectnum, wp[0], wp[1], capabilities, version]);
        self
    }

    fn pair(&self) -> (u8, u8) {
        self.native
            .unwrap_or((RESP_INSYNC, RESP_OK))
    }

    fn wide(&self) -> bool {
        self.flash.len() > 0x10000
    }

    fn respond(&mut self, frame: &[u8]) {
        if self.mute || frame.last() != Some(&EOP) {
            return;
        }
        let (insync, ok) = self.pair();
        let body = &frame[..frame.len() - 1];
        let Some(&cmd) = body.first() else {
            return;
        };

        let payload: Option<Vec<u8>> = match (self.native.is_some(), cmd) {
            // A bare EOP passes for get-sync
            (_, 0x30 | EOP) => Some(Vec::new()),
            (_, 0x50) => {
                self.progmode = true;
                Some(Vec::new())
            },
            (_, 0x51) => {
                self.progmode = false;
                Some(Vec::new())
            },
            (_, 0x52) => {
                self.erase();
                Some(Vec::new())
            },
            (_, 0x75) => Some(self.signature.to_vec()),
            (_, 0x56) if body.len() == 5 => {
                match body[1] {
                    0x4d => self.ext = u32::from(body[3]),
                    0xac if body[2] == 0x80 => self.erase(),
                    _ => {},
                }
                Some(vec![0])
            },
            (_, 0x55) if body.len() == 3 => {
                self.word = u32::from(LittleEndian::read_u16(&body[1..3])) | (self.ext << 16);
                Some(Vec::new())
            },
            (true, 0x00..=0x03) => self.native_page(cmd, &body[1..]),
            (false, 0x64 | 0x74) => self.legacy_page(cmd, &body[1..]),
            _ => None,
        };

        if let Some(data) = payload {
            self.pending.push_back(insync);
            self.pending.extend(data);
            self.pending.push_back(ok);
        }
    }

    fn native_page(&mut self, op: u8, rest: &[u8]) -> Option<Vec<u8>> {
        let alen = if self.wide() { 3 } else { 2 };
        let llen = if self.page_size <= 256 { 1 } else { 2 };
        if rest.len() < alen + llen {
            return None;
        }
        let mut addr = u32::from(LittleEndian::read_u16(&rest[..2]));
        if alen == 3 {
            addr |= u32::from(rest[2]) << 16;
        }
        let len = if llen == 1 {
            match rest[alen] {
                0 => 256,
                n => usize::from(n),
            }
        } else {
            usize::from(BigEndian::read_u16(&rest[alen..alen + 2]))
        };
        let data = &rest[alen + llen..];
        self.transfer(op & 1 == 1, op & 2 == 2, addr, len, data)
    }

    fn legacy_page(&mut self, cmd: u8, rest: &[u8]) -> Option<Vec<u8>> {
        if rest.len() < 3 {
            return None;
        }
        let len = usize::from(BigEndian::read_u16(&rest[..2]));
        let flash = rest[2] == b'F';
        let addr = self.word * 2;
        self.transfer(cmd == 0x74, flash, addr, len, &rest[3..])
    }

    fn transfer(&mut self, read: bool, flash: bool, addr: u32, len: usize, data: &[u8]) -> Option<Vec<u8>> {
        let start = addr as usize;
        let mem = if flash { &mut self.flash } else { &mut self.eeprom };
        let end = start + len;
        if end > mem.len() {
            return None;
        }
        if read {
            return data
                .is_empty()
                .then(|| mem[start..end].to_vec());
        }
        if data.len() != len {
            return None;
        }
        if flash {
            if addr >= self.start {
                // Bootloader refuses to overwrite itself
                return Some(Vec::new());
            }
            self.page_writes.push((addr, len));
        }
        mem[start..end].copy_from_slice(data);
        Some(Vec::new())
    }

    fn erase(&mut self) {
        self.chip_erases += 1;
        let start = self.start as usize;
        self.flash[..start].fill(0xff);
    }
}

impl Read for SimBootloader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pending.is_empty() {
            return Err(io::Error::new(ErrorKind::TimedOut, "no data"));
        }
        let n = buf.len().min(self.pending.len());
        for (slot, b) in buf
            .iter_mut()
            .zip(self.pending.drain(..n))
        {
            *slot = b;
        }
        Ok(n)
    }
}

impl Write for SimBootloader {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inbox
            .extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        let frame = std::mem::take(&mut self.inbox);
        self.respond(&frame);
        Ok(())
    }
}

impl Port for SimBootloader {
    fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
        self.timeout = timeout;
        Ok(())
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn clear_buffers(&mut self) -> Result<()> {
        self.pending.clear();
        Ok(())
    }

    fn name(&self) -> &str {
        "sim"
    }

    fn set_dtr(&mut self, level: bool) -> Result<()> {
        self.lines.push(level);
        Ok(())
    }

    fn set_rts(&mut self, _level: bool) -> Result<()> {
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}
