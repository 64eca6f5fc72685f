//! Part table. Ids follow avrdude's `uP_table` numbering.

use super::{McuDescriptor, PortBits, Uart};

const fn port(name: char, mask: u8, pin: u8) -> PortBits {
    PortBits {
        name,
        mask,
        pin,
        ddr: pin + 1,
        port: pin + 2,
    }
}

const ATTINY84A_ISRS: &[&str] = &[
    "RESET", "INT0", "PCINT0", "PCINT1", "WDT", "TIM1_CAPT", "TIM1_COMPA", "TIM1_COMPB",
    "TIM1_OVF", "TIM0_COMPA", "TIM0_COMPB", "TIM0_OVF", "ANA_COMP", "ADC", "EE_RDY", "USI_STR",
    "USI_OVF",
];

const ATTINY85_ISRS: &[&str] = &[
    "RESET", "INT0", "PCINT0", "TIMER1_COMPA", "TIMER1_OVF", "TIMER0_OVF", "EE_READY",
    "ANA_COMP", "ADC", "TIMER1_COMPB", "TIMER0_COMPA", "TIMER0_COMPB", "WDT", "USI_START",
    "USI_OVF",
];

const ATMEGA8_ISRS: &[&str] = &[
    "RESET", "INT0", "INT1", "TIMER2_COMP", "TIMER2_OVF", "TIMER1_CAPT", "TIMER1_COMPA",
    "TIMER1_COMPB", "TIMER1_OVF", "TIMER0_OVF", "SPI_STC", "USART_RXC", "USART_UDRE",
    "USART_TXC", "ADC", "EE_RDY", "ANA_COMP", "TWI", "SPM_RDY",
];

const ATMEGA328P_ISRS: &[&str] = &[
    "RESET", "INT0", "INT1", "PCINT0", "PCINT1", "PCINT2", "WDT", "TIMER2_COMPA",
    "TIMER2_COMPB", "TIMER2_OVF", "TIMER1_CAPT", "TIMER1_COMPA", "TIMER1_COMPB", "TIMER1_OVF",
    "TIMER0_COMPA", "TIMER0_COMPB", "TIMER0_OVF", "SPI_STC", "USART_RX", "USART_UDRE",
    "USART_TX", "ADC", "EE_READY", "ANALOG_COMP", "TWI", "SPM_READY",
];

const ATMEGA1284P_ISRS: &[&str] = &[
    "RESET", "INT0", "INT1", "INT2", "PCINT0", "PCINT1", "PCINT2", "PCINT3", "WDT",
    "TIMER2_COMPA", "TIMER2_COMPB", "TIMER2_OVF", "TIMER1_CAPT", "TIMER1_COMPA", "TIMER1_COMPB",
    "TIMER1_OVF", "TIMER0_COMPA", "TIMER0_COMPB", "TIMER0_OVF", "SPI_STC", "USART0_RX",
    "USART0_UDRE", "USART0_TX", "ANALOG_COMP", "ADC", "EE_READY", "TWI", "SPM_READY",
    "USART1_RX", "USART1_UDRE", "USART1_TX", "TIMER3_CAPT", "TIMER3_COMPA", "TIMER3_COMPB",
    "TIMER3_OVF",
];

const ATMEGA2560_ISRS: &[&str] = &[
    "RESET", "INT0", "INT1", "INT2", "INT3", "INT4", "INT5", "INT6", "INT7", "PCINT0", "PCINT1",
    "PCINT2", "WDT", "TIMER2_COMPA", "TIMER2_COMPB", "TIMER2_OVF", "TIMER1_CAPT", "TIMER1_COMPA",
    "TIMER1_COMPB", "TIMER1_COMPC", "TIMER1_OVF", "TIMER0_COMPA", "TIMER0_COMPB", "TIMER0_OVF",
    "SPI_STC", "USART0_RX", "USART0_UDRE", "USART0_TX", "ANALOG_COMP", "ADC", "EE_READY",
    "TIMER3_CAPT", "TIMER3_COMPA", "TIMER3_COMPB", "TIMER3_COMPC", "TIMER3_OVF", "USART1_RX",
    "USART1_UDRE", "USART1_TX", "TWI", "SPM_READY", "TIMER4_CAPT", "TIMER4_COMPA",
    "TIMER4_COMPB", "TIMER4_COMPC", "TIMER4_OVF", "TIMER5_CAPT", "TIMER5_COMPA", "TIMER5_COMPB",
    "TIMER5_COMPC", "TIMER5_OVF", "USART2_RX", "USART2_UDRE", "USART2_TX", "USART3_RX",
    "USART3_UDRE", "USART3_TX",
];

/// Every part urclock knows about.
pub static MCU_TABLE: &[McuDescriptor] = &[
    McuDescriptor {
        name: "ATtiny84A",
        mcu_id: 25,
        signature: [0x1e, 0x93, 0x0c],
        flash_size: 8192,
        page_size: 64,
        eeprom_size: 512,
        eeprom_page_size: 4,
        interrupts: 17,
        uart: Uart::Software,
        ports: &[port('A', 0xff, 0x19), port('B', 0x0f, 0x16)],
        isr_names: ATTINY84A_ISRS,
    },
    McuDescriptor {
        name: "ATtiny85",
        mcu_id: 26,
        signature: [0x1e, 0x93, 0x0b],
        flash_size: 8192,
        page_size: 64,
        eeprom_size: 512,
        eeprom_page_size: 4,
        interrupts: 15,
        uart: Uart::Software,
        ports: &[port('B', 0x3f, 0x16)],
        isr_names: ATTINY85_ISRS,
    },
    McuDescriptor {
        name: "ATmega8",
        mcu_id: 45,
        signature: [0x1e, 0x93, 0x07],
        flash_size: 8192,
        page_size: 64,
        eeprom_size: 512,
        eeprom_page_size: 4,
        interrupts: 19,
        uart: Uart::Usart { count: 1 },
        ports: &[
            port('B', 0xff, 0x16),
            port('C', 0x7f, 0x13),
            port('D', 0xff, 0x10),
        ],
        isr_names: ATMEGA8_ISRS,
    },
    McuDescriptor {
        name: "ATmega328P",
        mcu_id: 118,
        signature: [0x1e, 0x95, 0x0f],
        flash_size: 32768,
        page_size: 128,
        eeprom_size: 1024,
        eeprom_page_size: 4,
        interrupts: 26,
        uart: Uart::Usart { count: 1 },
        ports: &[
            port('B', 0xff, 0x03),
            port('C', 0x7f, 0x06),
            port('D', 0xff, 0x09),
        ],
        isr_names: ATMEGA328P_ISRS,
    },
    McuDescriptor {
        name: "ATmega1284P",
        mcu_id: 163,
        signature: [0x1e, 0x97, 0x05],
        flash_size: 131072,
        page_size: 256,
        eeprom_size: 4096,
        eeprom_page_size: 8,
        interrupts: 35,
        uart: Uart::Usart { count: 2 },
        ports: &[
            port('A', 0xff, 0x00),
            port('B', 0xff, 0x03),
            port('C', 0xff, 0x06),
            port('D', 0xff, 0x09),
        ],
        isr_names: ATMEGA1284P_ISRS,
    },
    McuDescriptor {
        name: "ATmega2560",
        mcu_id: 181,
        signature: [0x1e, 0x98, 0x01],
        flash_size: 262144,
        page_size: 256,
        eeprom_size: 4096,
        eeprom_page_size: 8,
        interrupts: 57,
        uart: Uart::Usart { count: 4 },
        ports: &[
            port('A', 0xff, 0x00),
            port('B', 0xff, 0x03),
            port('C', 0xff, 0x06),
            port('D', 0xff, 0x09),
            port('E', 0xff, 0x0c),
            port('F', 0xff, 0x0f),
            port('G', 0x3f, 0x12),
        ],
        isr_names: ATMEGA2560_ISRS,
    },
];
