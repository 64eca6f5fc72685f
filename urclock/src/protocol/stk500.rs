//! STK500v1 commands and the urprotocol page frames.
//!
//! Every request ends in [`EOP`]. Replies are bracketed by the two bytes the
//! bootloader answered during sync: the classic `0x14`/`0x10` pair for
//! legacy bootloaders, a bootinfo-carrying pair for urboot.
//!
//! ## Native page frame
//!
//! ```text
//! +----+-------------+-----------+-----------+-----+
//! | op | address LE  | length    | payload   | EOP |
//! +----+-------------+-----------+-----------+-----+
//! | 1  | 2 or 3      | 1 or 2 BE | writes    | 1   |
//! +----+-------------+-----------+-----------+-----+
//! ```
//!
//! The address is 3 bytes wide on parts with more than 64 KiB flash. The
//! length is one byte (0 meaning 256) when the page size is at most 256.
//!
//! ## Legacy page frame
//!
//! ```text
//! +------+-------+-------+--------+---------+-----+
//! | 0x64 | len H | len L | F / E  | payload | EOP |
//! | 0x74 |       |       |        |         |     |
//! +------+-------+-------+--------+---------+-----+
//! ```
//!
//! preceded by a `LOAD_ADDRESS` of the word address and, on parts with more
//! than 128 KiB flash, a universal `LEXT` whenever the high byte changes.

use byteorder::{BigEndian, LittleEndian, WriteBytesExt};

use crate::device::McuDescriptor;
use crate::error::{Error, Result};

/// End of every request.
pub const EOP: u8 = 0x20;

/// Classic STK500 "in sync" reply.
pub const RESP_INSYNC: u8 = 0x14;

/// Classic STK500 "ok" reply.
pub const RESP_OK: u8 = 0x10;

/// Universal subcommand: load extended address byte.
pub const UNIVERSAL_LEXT: [u8; 2] = [0x4d, 0x00];

/// Universal subcommand: chip erase.
pub const UNIVERSAL_CE: [u8; 4] = [0xac, 0x80, 0x00, 0x00];

/// STK500v1 command bytes understood by urboot and optiboot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    /// Get in sync (0x30).
    GetSync = 0x30,
    /// Enter programming mode (0x50).
    EnterProgmode = 0x50,
    /// Leave programming mode (0x51).
    LeaveProgmode = 0x51,
    /// Chip erase (0x52).
    ChipErase = 0x52,
    /// Load word address (0x55).
    LoadAddress = 0x55,
    /// Universal SPI-style command (0x56).
    Universal = 0x56,
    /// Program page (0x64).
    ProgPage = 0x64,
    /// Read page (0x74).
    ReadPage = 0x74,
    /// Read signature (0x75).
    ReadSign = 0x75,
}

/// Which framing the bootloader speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    /// Urprotocol: address and length in one frame, bootinfo in the replies.
    Native,
    /// Plain STK500v1 as spoken by optiboot and older urboot builds.
    Legacy,
}

impl Dialect {
    /// Human readable name.
    pub fn name(self) -> &'static str {
        match self {
            Self::Native => "urprotocol",
            Self::Legacy => "STK500v1",
        }
    }
}

/// Memory a page transfer addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Memory {
    /// Program flash.
    Flash,
    /// Data EEPROM.
    Eeprom,
}

impl Memory {
    /// Memory selector byte of a legacy page frame.
    pub fn selector(self) -> u8 {
        match self {
            Self::Flash => b'F',
            Self::Eeprom => b'E',
        }
    }

    /// Lower-case name as used in messages.
    pub fn name(self) -> &'static str {
        match self {
            Self::Flash => "flash",
            Self::Eeprom => "eeprom",
        }
    }
}

/// Direction of a page transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageOp {
    /// Device to host.
    Read,
    /// Host to device.
    Write,
}

/// Urprotocol opcode for a page transfer.
pub fn native_opcode(op: PageOp, mem: Memory) -> u8 {
    match (op, mem) {
        (PageOp::Write, Memory::Eeprom) => 0x00,
        (PageOp::Read, Memory::Eeprom) => 0x01,
        (PageOp::Write, Memory::Flash) => 0x02,
        (PageOp::Read, Memory::Flash) => 0x03,
    }
}

/// Part geometry the frame encoders depend on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageLayout {
    /// Flash size in bytes.
    pub flash_size: u32,
    /// Flash page size in bytes.
    pub page_size: u32,
}

impl PageLayout {
    /// Largest length a single page frame may carry.
    pub fn max_transfer(&self) -> u32 {
        self.page_size.max(256)
    }

    /// Native addresses need a third byte.
    pub fn wide_address(&self) -> bool {
        self.flash_size > 0x10000
    }

    /// Legacy transfers need `LEXT` for the upper flash.
    pub fn extended_address(&self) -> bool {
        self.flash_size > 0x20000
    }
}

impl From<&McuDescriptor> for PageLayout {
    fn from(mcu: &McuDescriptor) -> Self {
        Self {
            flash_size: mcu.flash_size,
            page_size: mcu.page_size,
        }
    }
}

/// Request frame builder.
#[derive(Debug)]
pub struct Frame {
    command: u8,
    data: Vec<u8>,
}

impl Frame {
    /// Create a frame that starts with `command`.
    pub fn new(command: u8) -> Self {
        Self {
            command,
            data: Vec::new(),
        }
    }

    /// `GET_SYNC` as used for sync and keep-alive.
    pub fn get_sync() -> Self {
        Self::new(Command::GetSync as u8)
    }

    /// Enter programming mode.
    pub fn enter_progmode() -> Self {
        Self::new(Command::EnterProgmode as u8)
    }

    /// Leave programming mode; urboot jumps to the application afterwards.
    pub fn leave_progmode() -> Self {
        Self::new(Command::LeaveProgmode as u8)
    }

    /// Native chip erase.
    pub fn chip_erase() -> Self {
        Self::new(Command::ChipErase as u8)
    }

    /// Read the three signature bytes.
    pub fn read_signature() -> Self {
        Self::new(Command::ReadSign as u8)
    }

    /// Universal command with a 4-byte payload.
    pub fn universal(cmd: [u8; 4]) -> Self {
        let mut frame = Self::new(Command::Universal as u8);
        frame
            .data
            .extend_from_slice(&cmd);
        frame
    }

    /// Universal `LEXT` selecting the upper 64 K words.
    pub fn load_extended(ext: u8) -> Self {
        Self::universal([UNIVERSAL_LEXT[0], UNIVERSAL_LEXT[1], ext, 0x00])
    }

    /// Load a 16-bit word address.
    #[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
    pub fn load_address(word: u16) -> Self {
        let mut frame = Self::new(Command::LoadAddress as u8);
        frame.data.write_u16::<LittleEndian>(word).unwrap();
        frame
    }

    /// Urprotocol page transfer. Reads pass an empty payload.
    #[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
    pub fn native_page(
        op: PageOp,
        mem: Memory,
        addr: u32,
        len: usize,
        payload: &[u8],
        layout: PageLayout,
    ) -> Result<Self> {
        check_length(op, mem, len, payload, layout)?;

        let mut frame = Self::new(native_opcode(op, mem));
        frame.data.write_u16::<LittleEndian>(addr as u16).unwrap();
        if layout.wide_address() {
            frame.data.push((addr >> 16) as u8);
        }
        if layout.page_size <= 256 {
            // 256 wraps to 0 on the wire
            frame.data.push(len as u8);
        } else {
            frame.data.write_u16::<BigEndian>(len as u16).unwrap();
        }
        frame
            .data
            .extend_from_slice(payload);
        Ok(frame)
    }

    /// Legacy page transfer; the address has been loaded separately.
    #[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
    pub fn legacy_page(
        op: PageOp,
        mem: Memory,
        len: usize,
        payload: &[u8],
        layout: PageLayout,
    ) -> Result<Self> {
        check_length(op, mem, len, payload, layout)?;

        let command = match op {
            PageOp::Read => Command::ReadPage,
            PageOp::Write => Command::ProgPage,
        };
        let mut frame = Self::new(command as u8);
        frame.data.write_u16::<BigEndian>(len as u16).unwrap();
        frame.data.push(mem.selector());
        frame
            .data
            .extend_from_slice(payload);
        Ok(frame)
    }

    /// Build the complete request.
    pub fn build(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.data.len() + 2);
        buf.push(self.command);
        buf.extend_from_slice(&self.data);
        buf.push(EOP);
        buf
    }

    /// First byte of the request.
    pub fn command(&self) -> u8 {
        self.command
    }
}

fn check_length(
    op: PageOp,
    mem: Memory,
    len: usize,
    payload: &[u8],
    layout: PageLayout,
) -> Result<()> {
    let max = layout.max_transfer() as usize;
    if len == 0 || len > max {
        return Err(Error::Size(format!(
            "{} transfer of {len} bytes outside [1, {max}]",
            mem.name()
        )));
    }
    if layout.page_size <= 256 && len > 256 {
        return Err(Error::Size(format!("length {len} does not fit the 1-byte length field")));
    }
    match op {
        PageOp::Write if payload.len() != len => Err(Error::Size(format!(
            "payload of {} bytes announced as {len}",
            payload.len()
        ))),
        PageOp::Read if !payload.is_empty() => {
            Err(Error::Size("read requests carry no payload".to_string()))
        },
        _ => Ok(()),
    }
}

/// What a legacy transfer must send before its page frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LegacyAddress {
    /// `LEXT` byte to send first, if the cached one is stale.
    pub extended: Option<u8>,
    /// Word address for `LOAD_ADDRESS`.
    pub word: u16,
}

/// Work out the legacy address frames for a transfer at byte address
/// `baddr`, updating the cached extended address byte.
///
/// The cache is forgotten when the page straddles a 64 K-word boundary
/// because the bootloader increments the extended byte itself.
///
/// Addresses are always word addresses. Every part in the table is a
/// classic AVR; byte-addressed legacy links (optiboot_x on UPDI parts) are
/// not supported.
pub fn legacy_address(
    cache: &mut Option<u8>,
    mem: Memory,
    baddr: u32,
    layout: PageLayout,
) -> LegacyAddress {
    let addr = baddr / 2;
    let span = layout.page_size / 2;

    let mut extended = None;
    if mem == Memory::Flash && layout.extended_address() {
        let ext = (addr >> 16) as u8;
        if *cache != Some(ext) {
            extended = Some(ext);
            *cache = Some(ext);
        }
        if addr & 0xffff_0000 != (addr + span) & 0xffff_0000 {
            *cache = None;
        }
    }

    LegacyAddress {
        extended,
        word: addr as u16,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ATMEGA328P: PageLayout = PageLayout {
        flash_size: 32768,
        page_size: 128,
    };

    const ATMEGA2560: PageLayout = PageLayout {
        flash_size: 262144,
        page_size: 256,
    };

    #[test]
    fn test_simple_commands() {
        assert_eq!(Frame::get_sync().build(), vec![0x30, 0x20]);
        assert_eq!(Frame::enter_progmode().build(), vec![0x50, 0x20]);
        assert_eq!(Frame::leave_progmode().build(), vec![0x51, 0x20]);
        assert_eq!(Frame::chip_erase().build(), vec![0x52, 0x20]);
        assert_eq!(Frame::read_signature().build(), vec![0x75, 0x20]);
    }

    #[test]
    fn test_universal_frames() {
        assert_eq!(
            Frame::universal(UNIVERSAL_CE).build(),
            vec![0x56, 0xac, 0x80, 0x00, 0x00, 0x20]
        );
        assert_eq!(
            Frame::load_extended(1).build(),
            vec![0x56, 0x4d, 0x00, 0x01, 0x00, 0x20]
        );
    }

    #[test]
    fn test_native_read_frame() {
        let frame = Frame::native_page(PageOp::Read, Memory::Flash, 0x7f80, 128, &[], ATMEGA328P)
            .unwrap()
            .build();
        assert_eq!(frame, vec![0x03, 0x80, 0x7f, 0x80, 0x20]);
    }

    #[test]
    fn test_native_write_frame_wide_address() {
        let payload = vec![0xaa; 256];
        let frame = Frame::native_page(
            PageOp::Write,
            Memory::Flash,
            0x3_fe00,
            256,
            &payload,
            ATMEGA2560,
        )
        .unwrap()
        .build();
        assert_eq!(&frame[..5], &[0x02, 0x00, 0xfe, 0x03, 0x00]);
        assert_eq!(frame.len(), 5 + 256 + 1);
        assert_eq!(frame.last(), Some(&EOP));
    }

    #[test]
    fn test_native_eeprom_opcodes() {
        let frame = Frame::native_page(PageOp::Write, Memory::Eeprom, 5, 2, &[1, 2], ATMEGA328P)
            .unwrap()
            .build();
        assert_eq!(frame, vec![0x00, 0x05, 0x00, 0x02, 0x01, 0x02, 0x20]);
        let frame = Frame::native_page(PageOp::Read, Memory::Eeprom, 5, 1, &[], ATMEGA328P)
            .unwrap()
            .build();
        assert_eq!(frame[0], 0x01);
    }

    #[test]
    fn test_big_pages_use_two_byte_length() {
        let layout = PageLayout {
            flash_size: 131072,
            page_size: 512,
        };
        let frame = Frame::native_page(PageOp::Read, Memory::Flash, 0, 512, &[], layout)
            .unwrap()
            .build();
        assert_eq!(frame, vec![0x03, 0x00, 0x00, 0x00, 0x02, 0x00, 0x20]);
    }

    #[test]
    fn test_length_limits() {
        assert!(matches!(
            Frame::native_page(PageOp::Read, Memory::Flash, 0, 257, &[], ATMEGA328P),
            Err(Error::Size(_))
        ));
        assert!(matches!(
            Frame::native_page(PageOp::Read, Memory::Flash, 0, 0, &[], ATMEGA328P),
            Err(Error::Size(_))
        ));
        assert!(matches!(
            Frame::legacy_page(PageOp::Write, Memory::Flash, 4, &[0; 3], ATMEGA328P),
            Err(Error::Size(_))
        ));
    }

    #[test]
    fn test_legacy_page_frame() {
        let frame = Frame::legacy_page(PageOp::Read, Memory::Eeprom, 200, &[], ATMEGA2560)
            .unwrap()
            .build();
        assert_eq!(frame, vec![0x74, 0x00, 0xc8, b'E', 0x20]);
        let frame = Frame::legacy_page(PageOp::Write, Memory::Flash, 2, &[0xde, 0xad], ATMEGA328P)
            .unwrap()
            .build();
        assert_eq!(frame, vec![0x64, 0x00, 0x02, b'F', 0xde, 0xad, 0x20]);
    }

    #[test]
    fn test_legacy_address_is_word_address() {
        let mut cache = None;
        let addr = legacy_address(&mut cache, Memory::Flash, 0x7e00, ATMEGA328P);
        assert_eq!(addr.word, 0x3f00);
        assert_eq!(addr.extended, None);
        assert_eq!(Frame::load_address(addr.word).build(), vec![0x55, 0x00, 0x3f, 0x20]);
    }

    #[test]
    fn test_legacy_address_halves_for_every_part() {
        for mcu in crate::device::MCU_TABLE {
            let mut cache = None;
            let layout = PageLayout::from(mcu);
            let addr = legacy_address(&mut cache, Memory::Flash, 2 * mcu.page_size, layout);
            assert_eq!(u32::from(addr.word), mcu.page_size, "{}", mcu.name);
        }
    }

    #[test]
    fn test_legacy_extended_address_cache() {
        let mut cache = None;
        let first = legacy_address(&mut cache, Memory::Flash, 0x2_0000, ATMEGA2560);
        assert_eq!(first.extended, Some(1));
        assert_eq!(first.word, 0);

        // Same 64 K-word bank: no LEXT
        let second = legacy_address(&mut cache, Memory::Flash, 0x2_0100, ATMEGA2560);
        assert_eq!(second.extended, None);

        // Back to the low bank
        let third = legacy_address(&mut cache, Memory::Flash, 0x100, ATMEGA2560);
        assert_eq!(third.extended, Some(0));
    }

    #[test]
    fn test_legacy_cache_invalidated_at_bank_end() {
        let mut cache = None;
        let last = legacy_address(&mut cache, Memory::Flash, 0x1_ff00, ATMEGA2560);
        assert_eq!(last.extended, Some(0));
        assert_eq!(cache, None);
        let next = legacy_address(&mut cache, Memory::Flash, 0x1_ff00, ATMEGA2560);
        assert_eq!(next.extended, Some(0));
    }
}
