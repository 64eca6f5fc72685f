//! Just enough AVR instruction decoding to find and patch jumps.
//!
//! Vector tables hold either 2-byte `rjmp` (flash ≤ 8 KiB) or 4-byte `jmp`
//! entries. Relative jumps wrap around flash on parts whose flash is a power
//! of two no larger than 8 KiB, so distances are normalised to
//! `[-size/2, size/2)` with `size = min(flash, 8192)`.

use byteorder::{ByteOrder, LittleEndian};

/// `ret`; stands in for the write-page rjmp of urboot builds without one.
pub const RET: u16 = 0x9508;

/// Size of one interrupt vector slot in bytes.
pub fn vector_size(flash_size: u32) -> u32 {
    if flash_size <= 8192 { 2 } else { 4 }
}

/// `rjmp k`: relative jump of ±2 K words.
pub fn is_rjmp(op: u16) -> bool {
    op & 0xf000 == 0xc000
}

/// First word of `jmp k`.
pub fn is_jmp(op: u16) -> bool {
    op & 0xfe0e == 0x940c
}

/// First word of a two-word instruction (`lds`, `sts`, `jmp`, `call`).
pub fn is_op32(op: u16) -> bool {
    op & 0xfe0f == 0x9200 || op & 0xfe0f == 0x9000 || is_jmp(op) || op & 0xfe0e == 0x940e
}

fn wrap_distance(dist: i32, flash_size: u32) -> i32 {
    let size = flash_size.min(8192) as i32;
    if size > 0 && size & (size - 1) == 0 {
        let wrapped = dist & (size - 1);
        if wrapped >= size / 2 { wrapped - size } else { wrapped }
    } else {
        dist
    }
}

/// Byte distance from an `rjmp` to its destination.
pub fn rjmp_distance(op: u16, flash_size: u32) -> i32 {
    // Sign-extend the 12-bit word offset
    let words = i32::from(((op & 0x0fff) << 4) as i16 >> 4);
    wrap_distance(words * 2 + 2, flash_size)
}

/// `rjmp` that jumps `dist` bytes forward from its own address.
pub fn rjmp_opcode(dist: i32, flash_size: u32) -> u16 {
    let dist = wrap_distance(dist, flash_size);
    0xc000 | (((dist >> 1) - 1) & 0x0fff) as u16
}

/// `rjmp` placed at address 0 that lands on `blstart` by wrapping backwards
/// past address 0; valid when flash size is a power of two.
pub fn rjmp_to_bootloader(blstart: u32, flash_size: u32) -> u16 {
    let words = (i64::from(blstart) - i64::from(flash_size) - 2) / 2;
    0xc000 | (words as u16 & 0x0fff)
}

/// 32-bit `jmp` to a byte address, first instruction word in the low half.
pub fn jmp_opcode(addr: u32) -> u32 {
    (((addr >> 1) & 0xffff) << 16) | 0x940c | (((addr >> 18) & 31) << 4) | ((addr >> 17) & 1)
}

/// Byte address a 32-bit `jmp` goes to.
pub fn jmp_address(jmp: u32) -> u32 {
    let words = (jmp >> 16) | ((jmp & 1) << 16) | ((jmp & 0x1f0) << 13);
    words << 1
}

/// Absolute destination of the jump found at address 0, if it is one.
///
/// `jmp` targets are taken verbatim; `rjmp` targets are folded into flash.
pub fn reset_target(bytes: &[u8], vecsz: u32, flash_size: u32) -> Option<u32> {
    if bytes.len() < vecsz as usize || bytes.len() < 2 {
        return None;
    }
    let op16 = LittleEndian::read_u16(bytes);

    if vecsz == 4 && is_jmp(op16) {
        return Some(jmp_address(LittleEndian::read_u32(bytes)));
    }
    if !is_rjmp(op16) {
        return None;
    }

    let flash = i64::from(flash_size);
    let mut addr = i64::from(rjmp_distance(op16, flash_size));
    if flash > 0 {
        while addr < 0 {
            addr += flash;
        }
        while addr > flash {
            addr -= flash;
        }
    }
    u32::try_from(addr).ok()
}

/// Reset vector contents for a vector bootloader at `blstart`.
///
/// Returns the bytes and how many of them are used: a 2-byte `rjmp` on small
/// or power-of-two flash, otherwise a 4-byte `jmp`.
pub fn reset_to_bootloader(blstart: u32, flash_size: u32) -> ([u8; 4], usize) {
    let mut out = [0u8; 4];
    if vector_size(flash_size) == 2 || flash_size.is_power_of_two() {
        LittleEndian::write_u16(&mut out, rjmp_to_bootloader(blstart, flash_size));
        (out, 2)
    } else {
        LittleEndian::write_u32(&mut out, jmp_opcode(blstart));
        (out, 4)
    }
}
