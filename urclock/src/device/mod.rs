//! Static descriptions of the AVR parts urclock can program.
//!
//! Urboot bootloaders announce an MCU id during sync; legacy bootloaders
//! only answer a signature query. Both resolve to a [`McuDescriptor`] from
//! the built-in table.

mod table;

use crate::error::{Error, Result};

pub use table::MCU_TABLE;

/// How the part talks serial.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Uart {
    /// No hardware UART; bootloaders bit-bang or use the USI.
    Software,
    /// Hardware USART(s).
    Usart {
        /// Number of USART peripherals.
        count: u8,
    },
}

/// One I/O port and the addresses of its PIN/DDR/PORT registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortBits {
    /// Port letter.
    pub name: char,
    /// Pins that exist on the package.
    pub mask: u8,
    /// I/O address of PINx.
    pub pin: u8,
    /// I/O address of DDRx.
    pub ddr: u8,
    /// I/O address of PORTx.
    pub port: u8,
}

/// Immutable per-MCU reference data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct McuDescriptor {
    /// Canonical part name.
    pub name: &'static str,
    /// Id as encoded into the urboot sync reply.
    pub mcu_id: u16,
    /// Signature bytes.
    pub signature: [u8; 3],
    /// Flash size in bytes.
    pub flash_size: u32,
    /// Flash page size in bytes.
    pub page_size: u32,
    /// EEPROM size in bytes.
    pub eeprom_size: u32,
    /// EEPROM page size in bytes.
    pub eeprom_page_size: u32,
    /// Number of interrupt vectors including reset.
    pub interrupts: u8,
    /// Serial hardware.
    pub uart: Uart,
    /// I/O ports.
    pub ports: &'static [PortBits],
    /// Vector names indexed by vector number (0 is RESET).
    pub isr_names: &'static [&'static str],
}

impl McuDescriptor {
    /// Size of one vector table slot.
    pub fn vector_size(&self) -> u32 {
        crate::opcode::vector_size(self.flash_size)
    }

    /// Size of the whole interrupt vector table.
    pub fn vector_table_size(&self) -> u32 {
        u32::from(self.interrupts) * self.vector_size()
    }

    /// Largest single paged transfer the protocol allows.
    pub fn max_transfer(&self) -> u32 {
        self.page_size.max(256)
    }

    /// Name of vector `num`; `-1` means none and `interrupts` names the
    /// spare slot just past the table that vector bootloaders may use.
    pub fn isr_name(&self, num: i32) -> &'static str {
        if num == -1 {
            return "none";
        }
        let Ok(idx) = usize::try_from(num) else {
            return "unknown";
        };
        if idx == usize::from(self.interrupts) {
            return "VBL_ADDITIONAL_VECTOR";
        }
        self.isr_names
            .get(idx)
            .copied()
            .unwrap_or("unknown")
    }
}

/// Look up a part by the id an urboot bootloader reports.
pub fn by_mcu_id(mcu_id: u16) -> Option<&'static McuDescriptor> {
    MCU_TABLE
        .iter()
        .find(|m| m.mcu_id == mcu_id)
}

/// All parts sharing a signature.
pub fn by_signature(signature: [u8; 3]) -> impl Iterator<Item = &'static McuDescriptor> {
    MCU_TABLE
        .iter()
        .filter(move |m| m.signature == signature)
}

/// Case-insensitive lookup by part name.
pub fn by_name(name: &str) -> Option<&'static McuDescriptor> {
    MCU_TABLE
        .iter()
        .find(|m| m.name.eq_ignore_ascii_case(name))
}

/// Resolve the part behind an urboot id, preferring the id over a
/// user-supplied name when both are known and disagree.
pub fn resolve(mcu_id: Option<u16>, name: Option<&str>) -> Result<&'static McuDescriptor> {
    let by_id = mcu_id.and_then(by_mcu_id);
    let named = match name {
        Some(n) => Some(by_name(n).ok_or_else(|| Error::UnknownMcu(format!("no part named {n}")))?),
        None => None,
    };

    match (by_id, named) {
        (Some(found), Some(given)) if found.name != given.name => {
            log::warn!(
                "bootloader reports {} but part {} was requested; using {}",
                found.name,
                given.name,
                found.name
            );
            Ok(found)
        },
        (Some(found), _) => Ok(found),
        (None, Some(given)) => {
            if let Some(id) = mcu_id {
                log::warn!("unknown mcu id {id}, trusting requested part {}", given.name);
            }
            Ok(given)
        },
        (None, None) => Err(Error::UnknownMcu(match mcu_id {
            Some(id) => format!("mcu id {id} is not in the part table; specify the part"),
            None => "bootloader does not identify the part; specify the part".to_string(),
        })),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_is_consistent() {
        for mcu in MCU_TABLE {
            assert!(mcu.page_size.is_power_of_two(), "{}", mcu.name);
            assert_eq!(mcu.flash_size % mcu.page_size, 0, "{}", mcu.name);
            assert_eq!(mcu.isr_names.len(), usize::from(mcu.interrupts), "{}", mcu.name);
            assert_eq!(mcu.isr_names[0], "RESET", "{}", mcu.name);
            assert!(mcu.mcu_id < 2040, "{}", mcu.name);
        }
    }

    #[test]
    fn test_ids_and_names_are_unique() {
        for (i, a) in MCU_TABLE.iter().enumerate() {
            for b in &MCU_TABLE[i + 1..] {
                assert_ne!(a.mcu_id, b.mcu_id);
                assert_ne!(a.name, b.name);
            }
        }
    }

    #[test]
    fn test_lookup_atmega328p() {
        let mcu = by_name("atmega328p").unwrap();
        assert_eq!(mcu.flash_size, 32768);
        assert_eq!(mcu.page_size, 128);
        assert_eq!(mcu.interrupts, 26);
        assert_eq!(by_mcu_id(mcu.mcu_id), Some(mcu));
        assert_eq!(by_signature([0x1e, 0x95, 0x0f]).next(), Some(mcu));
    }

    #[test]
    fn test_isr_names() {
        let mcu = by_name("ATmega328P").unwrap();
        assert_eq!(mcu.isr_name(0), "RESET");
        assert_eq!(mcu.isr_name(4), "PCINT1");
        assert_eq!(mcu.isr_name(5), "PCINT2");
        assert_eq!(mcu.isr_name(-1), "none");
        assert_eq!(mcu.isr_name(26), "VBL_ADDITIONAL_VECTOR");
        assert_eq!(mcu.isr_name(27), "unknown");
    }

    #[test]
    fn test_resolve_prefers_reported_id() {
        let m328 = by_name("ATmega328P").unwrap();
        let found = resolve(Some(m328.mcu_id), Some("ATmega2560")).unwrap();
        assert_eq!(found.name, "ATmega328P");
    }

    #[test]
    fn test_resolve_falls_back_to_name() {
        let found = resolve(Some(2039), Some("ATtiny85")).unwrap();
        assert_eq!(found.name, "ATtiny85");
        assert!(matches!(resolve(Some(2039), None), Err(Error::UnknownMcu(_))));
        assert!(matches!(resolve(None, Some("ATfoo")), Err(Error::UnknownMcu(_))));
    }

    #[test]
    fn test_vector_table_size() {
        assert_eq!(by_name("ATmega328P").unwrap().vector_table_size(), 104);
        assert_eq!(by_name("ATtiny85").unwrap().vector_table_size(), 30);
        assert_eq!(by_name("ATmega2560").unwrap().vector_table_size(), 228);
    }
}
