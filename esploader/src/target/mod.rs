//! Flashable target devices
//!
//! Everything that differs between chip families lives in one static
//! [ChipDescriptor] row per [Chip]. The protocol code looks values up in the
//! descriptor instead of matching on the chip.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString, IntoEnumIterator, VariantNames};

pub use self::flash_target::{
    DefaultProgressCallback,
    FlashTarget,
    ProgressCallbacks,
    RamTarget,
    SpiFlashTarget,
};
use crate::{
    Error,
    flasher::{FLASH_SECTOR_SIZE, FlashFrequency, FlashSize, SpiAttachParams},
};

pub(crate) mod flash_target;

/// Maximum block size for RAM flashing.
pub(crate) const MAX_RAM_BLOCK_SIZE: usize = 0x1800;

/// Supported crystal frequencies
///
/// Note that not all frequencies are supported by each target device.
#[cfg_attr(feature = "cli", derive(clap::ValueEnum))]
#[derive(
    Debug, Default, Clone, Copy, Hash, PartialEq, Eq, Display, VariantNames, Serialize, Deserialize,
)]
#[non_exhaustive]
#[repr(u32)]
pub enum XtalFrequency {
    /// 26 MHz
    #[strum(serialize = "26 MHz")]
    _26Mhz,
    /// 32 MHz
    #[strum(serialize = "32 MHz")]
    _32Mhz,
    /// 40 MHz
    #[default]
    #[strum(serialize = "40 MHz")]
    _40Mhz,
    /// 48MHz
    #[strum(serialize = "48 MHz")]
    _48Mhz,
}

/// All supported devices
#[cfg_attr(feature = "cli", derive(clap::ValueEnum))]
#[derive(
    Debug,
    Clone,
    Copy,
    Hash,
    PartialEq,
    Eq,
    Display,
    EnumIter,
    EnumString,
    VariantNames,
    Deserialize,
    Serialize,
)]
#[non_exhaustive]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Chip {
    /// ESP32
    Esp32,
    /// ESP32-C2, ESP8684
    Esp32c2,
    /// ESP32-C3, ESP8685
    Esp32c3,
    /// ESP32-C5
    Esp32c5,
    /// ESP32-C6
    Esp32c6,
    /// ESP32-H2
    Esp32h2,
    /// ESP32-P4
    Esp32p4,
    /// ESP32-S2
    Esp32s2,
    /// ESP32-S3
    Esp32s3,
    /// ESP8266
    Esp8266,
}

impl Chip {
    /// Create a [Chip] from a magic value.
    pub fn from_magic(magic: u32) -> Result<Self, Error> {
        Chip::iter()
            .find(|chip| chip.has_magic_value(magic))
            .ok_or(Error::ChipDetect(magic))
    }

    /// Check if the magic value contains the specified value
    pub fn has_magic_value(&self, value: u32) -> bool {
        self.descriptor().magic_values.contains(&value)
    }

    /// The static description of this chip.
    pub fn descriptor(&self) -> &'static ChipDescriptor {
        &DESCRIPTORS[*self as usize]
    }

    /// Returns the boot address for the [Chip]
    pub fn boot_address(&self) -> u32 {
        self.descriptor().bootloader_address
    }

    /// Returns the default crystal frequency for the [Chip].
    pub fn default_xtal_frequency(&self) -> XtalFrequency {
        self.descriptor().default_xtal
    }

    /// SPI register addresses for a chip
    pub fn spi_registers(&self) -> SpiRegisters {
        self.descriptor().spi_registers
    }

    /// Creates a [FlashTarget] writing to the SPI flash.
    pub fn flash_target(
        &self,
        spi_params: SpiAttachParams,
        verify: bool,
        skip: bool,
        compress: bool,
    ) -> FlashTarget {
        FlashTarget::SpiFlash(SpiFlashTarget::new(
            *self, spi_params, verify, skip, compress,
        ))
    }

    /// Creates a [FlashTarget] loading into RAM.
    pub fn ram_target(&self, entry: Option<u32>) -> FlashTarget {
        FlashTarget::Ram(RamTarget::new(entry, MAX_RAM_BLOCK_SIZE))
    }
}

/// SPI register addresses
#[derive(Copy, Clone, Hash, Debug, PartialEq, Eq)]
pub struct SpiRegisters {
    base: u32,
    usr_offset: u32,
    usr1_offset: u32,
    usr2_offset: u32,
    w0_offset: u32,
    mosi_length_offset: Option<u32>,
    miso_length_offset: Option<u32>,
}

impl SpiRegisters {
    /// Get the address of the CMD register.
    pub fn cmd(&self) -> u32 {
        self.base
    }

    /// Get the address of the USR register.
    pub fn usr(&self) -> u32 {
        self.base + self.usr_offset
    }

    /// Get the address of the USR1 register.
    pub fn usr1(&self) -> u32 {
        self.base + self.usr1_offset
    }

    /// Get the address of the USR2 register.
    pub fn usr2(&self) -> u32 {
        self.base + self.usr2_offset
    }

    /// Get the address of the W0 register.
    pub fn w0(&self) -> u32 {
        self.base + self.w0_offset
    }

    /// Get the address of the MOSI length register.
    pub fn mosi_length(&self) -> Option<u32> {
        self.mosi_length_offset.map(|offset| self.base + offset)
    }

    /// Get the address of the MISO length register.
    pub fn miso_length(&self) -> Option<u32> {
        self.miso_length_offset.map(|offset| self.base + offset)
    }
}

/// How the crystal frequency is estimated from the UART clock divider.
#[derive(Copy, Clone, Hash, Debug, PartialEq, Eq)]
pub struct UartClockDivider {
    /// UART0 CLKDIV register.
    pub register: u32,
    /// Mask of the divider bits.
    pub mask: u32,
    /// Extra divider between the crystal and the UART clock.
    pub xtal_divider: u32,
    /// Estimates above this many MHz select `above`.
    pub threshold_mhz: u32,
    /// Frequency at or below the threshold.
    pub below: XtalFrequency,
    /// Frequency above the threshold.
    pub above: XtalFrequency,
}

impl UartClockDivider {
    /// Pick the crystal frequency for a divider read while running at `baud`.
    pub fn estimate(&self, baud: u32, clkdiv: u32) -> XtalFrequency {
        let divider = u64::from(clkdiv & self.mask);
        let estimate = u64::from(baud) * divider / 1_000_000 / u64::from(self.xtal_divider);

        if estimate > u64::from(self.threshold_mhz) {
            self.above
        } else {
            self.below
        }
    }
}

/// How the ROM loader sizes the erase preceding a raw flash write.
#[derive(Copy, Clone, Hash, Debug, PartialEq, Eq)]
pub enum ErasePolicy {
    /// The erase covers exactly the written bytes.
    Exact,
    /// The ESP8266 ROM erases the head sectors of a block twice, so the
    /// requested size is reduced to compensate.
    Esp8266HeadSectors,
}

impl ErasePolicy {
    const SECTORS_PER_BLOCK: u32 = 16;

    /// Erase size to send with a ROM FlashBegin for a write of `size` bytes
    /// at `offset`.
    pub fn erase_size(&self, offset: u32, size: u32) -> u32 {
        match self {
            ErasePolicy::Exact => size,
            ErasePolicy::Esp8266HeadSectors => {
                let sector_size = FLASH_SECTOR_SIZE as u32;
                let num_sectors = size.div_ceil(sector_size);
                let start_sector = offset / sector_size;

                let head_sectors = (Self::SECTORS_PER_BLOCK
                    - start_sector % Self::SECTORS_PER_BLOCK)
                    .min(num_sectors);

                if num_sectors < 2 * head_sectors {
                    num_sectors.div_ceil(2) * sector_size
                } else {
                    (num_sectors - head_sectors) * sector_size
                }
            }
        }
    }
}

/// Everything the protocol needs to know about a chip family.
#[derive(Debug, PartialEq, Eq)]
#[non_exhaustive]
pub struct ChipDescriptor {
    /// The chip this row describes.
    pub chip: Chip,
    /// Values found at the chip detection register.
    pub magic_values: &'static [u32],
    /// Number of status bytes in ROM responses.
    pub rom_status_len: usize,
    /// Whether the ROM understands SpiAttach, SpiSetParams, ChangeBaudrate,
    /// the compressed write commands and FlashMd5.
    pub rom_extended_commands: bool,
    /// Whether ROM begin commands carry the trailing encryption word.
    pub rom_encrypted_begin: bool,
    /// How the ROM erase size is derived.
    pub erase_policy: ErasePolicy,
    /// SPI flash controller registers.
    pub spi_registers: SpiRegisters,
    /// UART clock divider, for chips supporting more than one crystal.
    pub uart_clock: Option<UartClockDivider>,
    /// Crystal frequency used when no divider is described.
    pub default_xtal: XtalFrequency,
    /// Image header flash size codes, high nibble of byte 3.
    pub flash_sizes: &'static [(FlashSize, u8)],
    /// Image header flash frequency codes, low nibble of byte 3.
    pub flash_frequencies: &'static [(FlashFrequency, u8)],
    /// Flash frequency assumed when none is configured.
    pub default_flash_frequency: FlashFrequency,
    /// Where the second stage bootloader image lives in flash.
    pub bootloader_address: u32,
}

impl ChipDescriptor {
    /// Encodes a flash size into the image header format.
    pub fn encode_flash_size(&self, size: FlashSize) -> Result<u8, Error> {
        self.flash_sizes
            .iter()
            .find(|(candidate, _)| *candidate == size)
            .map(|&(_, code)| code)
            .ok_or(Error::UnsupportedFlashSize {
                chip: self.chip,
                size,
            })
    }

    /// Encodes a flash frequency into the image header format.
    pub fn encode_flash_frequency(&self, frequency: FlashFrequency) -> Result<u8, Error> {
        self.flash_frequencies
            .iter()
            .find(|(candidate, _)| *candidate == frequency)
            .map(|&(_, code)| code)
            .ok_or(Error::UnsupportedFlashFrequency {
                chip: self.chip,
                frequency,
            })
    }
}

const ESP32_FLASH_SIZES: &[(FlashSize, u8)] = &[
    (FlashSize::_1Mb, 0x00),
    (FlashSize::_2Mb, 0x10),
    (FlashSize::_4Mb, 0x20),
    (FlashSize::_8Mb, 0x30),
    (FlashSize::_16Mb, 0x40),
    (FlashSize::_32Mb, 0x50),
    (FlashSize::_64Mb, 0x60),
    (FlashSize::_128Mb, 0x70),
];

const ESP8266_FLASH_SIZES: &[(FlashSize, u8)] = &[
    (FlashSize::_512Kb, 0x00),
    (FlashSize::_256Kb, 0x10),
    (FlashSize::_1Mb, 0x20),
    (FlashSize::_2Mb, 0x30),
    (FlashSize::_4Mb, 0x40),
    (FlashSize::_8Mb, 0x80),
    (FlashSize::_16Mb, 0x90),
];

const FLASH_FREQUENCIES: &[(FlashFrequency, u8)] = &[
    (FlashFrequency::_20Mhz, 0x2),
    (FlashFrequency::_26Mhz, 0x1),
    (FlashFrequency::_40Mhz, 0x0),
    (FlashFrequency::_80Mhz, 0xF),
];

const ESP32C2_FLASH_FREQUENCIES: &[(FlashFrequency, u8)] = &[
    (FlashFrequency::_15Mhz, 0x2),
    (FlashFrequency::_20Mhz, 0x1),
    (FlashFrequency::_30Mhz, 0x0),
    (FlashFrequency::_60Mhz, 0xF),
];

const ESP32H2_FLASH_FREQUENCIES: &[(FlashFrequency, u8)] = &[
    (FlashFrequency::_12Mhz, 0x2),
    (FlashFrequency::_16Mhz, 0x1),
    (FlashFrequency::_24Mhz, 0x0),
    (FlashFrequency::_48Mhz, 0xF),
];

const SPI_REGISTERS_C2_C3_S3: SpiRegisters = SpiRegisters {
    base: 0x6000_2000,
    usr_offset: 0x18,
    usr1_offset: 0x1c,
    usr2_offset: 0x20,
    w0_offset: 0x58,
    mosi_length_offset: Some(0x24),
    miso_length_offset: Some(0x28),
};

const SPI_REGISTERS_C5_C6_H2: SpiRegisters = SpiRegisters {
    base: 0x6000_3000,
    ..SPI_REGISTERS_C2_C3_S3
};

const UART_CLKDIV_MASK: u32 = 0xfffff;

/// One row per [Chip], in declaration order.
static DESCRIPTORS: [ChipDescriptor; 10] = [
    ChipDescriptor {
        chip: Chip::Esp32,
        magic_values: &[0x00f0_1d83],
        rom_status_len: 4,
        rom_extended_commands: true,
        rom_encrypted_begin: false,
        erase_policy: ErasePolicy::Exact,
        spi_registers: SpiRegisters {
            base: 0x3ff4_2000,
            usr_offset: 0x1c,
            usr1_offset: 0x20,
            usr2_offset: 0x24,
            w0_offset: 0x80,
            mosi_length_offset: Some(0x28),
            miso_length_offset: Some(0x2c),
        },
        uart_clock: Some(UartClockDivider {
            register: 0x3ff4_0014,
            mask: UART_CLKDIV_MASK,
            xtal_divider: 1,
            threshold_mhz: 33,
            below: XtalFrequency::_26Mhz,
            above: XtalFrequency::_40Mhz,
        }),
        default_xtal: XtalFrequency::_40Mhz,
        flash_sizes: ESP32_FLASH_SIZES,
        flash_frequencies: FLASH_FREQUENCIES,
        default_flash_frequency: FlashFrequency::_40Mhz,
        bootloader_address: 0x1000,
    },
    ChipDescriptor {
        chip: Chip::Esp32c2,
        magic_values: &[
            0x6f51_306f, // ECO0
            0x7c41_a06f, // ECO1
        ],
        rom_status_len: 4,
        rom_extended_commands: true,
        rom_encrypted_begin: true,
        erase_policy: ErasePolicy::Exact,
        spi_registers: SPI_REGISTERS_C2_C3_S3,
        uart_clock: Some(UartClockDivider {
            register: 0x6000_0014,
            mask: UART_CLKDIV_MASK,
            xtal_divider: 1,
            threshold_mhz: 33,
            below: XtalFrequency::_26Mhz,
            above: XtalFrequency::_40Mhz,
        }),
        default_xtal: XtalFrequency::_40Mhz,
        flash_sizes: ESP32_FLASH_SIZES,
        flash_frequencies: ESP32C2_FLASH_FREQUENCIES,
        default_flash_frequency: FlashFrequency::_30Mhz,
        bootloader_address: 0x0,
    },
    ChipDescriptor {
        chip: Chip::Esp32c3,
        magic_values: &[
            0x6921_506f, // ECO1 + ECO2
            0x1b31_506f, // ECO3
            0x4881_606f, // ECO6
            0x4361_606f, // ECO7
        ],
        rom_status_len: 4,
        rom_extended_commands: true,
        rom_encrypted_begin: true,
        erase_policy: ErasePolicy::Exact,
        spi_registers: SPI_REGISTERS_C2_C3_S3,
        uart_clock: None,
        default_xtal: XtalFrequency::_40Mhz,
        flash_sizes: ESP32_FLASH_SIZES,
        flash_frequencies: FLASH_FREQUENCIES,
        default_flash_frequency: FlashFrequency::_40Mhz,
        bootloader_address: 0x0,
    },
    ChipDescriptor {
        chip: Chip::Esp32c5,
        magic_values: &[0x1101_406f, 0x63e1_406f, 0x5fd1_406f],
        rom_status_len: 4,
        rom_extended_commands: true,
        rom_encrypted_begin: true,
        erase_policy: ErasePolicy::Exact,
        spi_registers: SPI_REGISTERS_C5_C6_H2,
        uart_clock: Some(UartClockDivider {
            register: 0x6000_0014,
            mask: UART_CLKDIV_MASK,
            xtal_divider: 1,
            threshold_mhz: 45,
            below: XtalFrequency::_40Mhz,
            above: XtalFrequency::_48Mhz,
        }),
        default_xtal: XtalFrequency::_48Mhz,
        flash_sizes: ESP32_FLASH_SIZES,
        flash_frequencies: FLASH_FREQUENCIES,
        default_flash_frequency: FlashFrequency::_40Mhz,
        bootloader_address: 0x2000,
    },
    ChipDescriptor {
        chip: Chip::Esp32c6,
        magic_values: &[0x2ce0_806f],
        rom_status_len: 4,
        rom_extended_commands: true,
        rom_encrypted_begin: true,
        erase_policy: ErasePolicy::Exact,
        spi_registers: SPI_REGISTERS_C5_C6_H2,
        uart_clock: None,
        default_xtal: XtalFrequency::_40Mhz,
        flash_sizes: ESP32_FLASH_SIZES,
        flash_frequencies: FLASH_FREQUENCIES,
        default_flash_frequency: FlashFrequency::_40Mhz,
        bootloader_address: 0x0,
    },
    ChipDescriptor {
        chip: Chip::Esp32h2,
        magic_values: &[0xd7b7_3e80],
        rom_status_len: 4,
        rom_extended_commands: true,
        rom_encrypted_begin: true,
        erase_policy: ErasePolicy::Exact,
        spi_registers: SPI_REGISTERS_C5_C6_H2,
        uart_clock: None,
        default_xtal: XtalFrequency::_32Mhz,
        flash_sizes: ESP32_FLASH_SIZES,
        flash_frequencies: ESP32H2_FLASH_FREQUENCIES,
        default_flash_frequency: FlashFrequency::_24Mhz,
        bootloader_address: 0x0,
    },
    ChipDescriptor {
        chip: Chip::Esp32p4,
        magic_values: &[0x0, 0x0add_bad0],
        rom_status_len: 4,
        rom_extended_commands: true,
        rom_encrypted_begin: true,
        erase_policy: ErasePolicy::Exact,
        spi_registers: SpiRegisters {
            base: 0x5008_d000,
            ..SPI_REGISTERS_C2_C3_S3
        },
        uart_clock: None,
        default_xtal: XtalFrequency::_40Mhz,
        flash_sizes: ESP32_FLASH_SIZES,
        flash_frequencies: FLASH_FREQUENCIES,
        default_flash_frequency: FlashFrequency::_40Mhz,
        bootloader_address: 0x2000,
    },
    ChipDescriptor {
        chip: Chip::Esp32s2,
        magic_values: &[0x0000_07c6],
        rom_status_len: 4,
        rom_extended_commands: true,
        rom_encrypted_begin: true,
        erase_policy: ErasePolicy::Exact,
        spi_registers: SpiRegisters {
            base: 0x3f40_2000,
            ..SPI_REGISTERS_C2_C3_S3
        },
        uart_clock: None,
        default_xtal: XtalFrequency::_40Mhz,
        flash_sizes: ESP32_FLASH_SIZES,
        flash_frequencies: FLASH_FREQUENCIES,
        default_flash_frequency: FlashFrequency::_40Mhz,
        bootloader_address: 0x1000,
    },
    ChipDescriptor {
        chip: Chip::Esp32s3,
        magic_values: &[0x9],
        rom_status_len: 4,
        rom_extended_commands: true,
        rom_encrypted_begin: true,
        erase_policy: ErasePolicy::Exact,
        spi_registers: SPI_REGISTERS_C2_C3_S3,
        uart_clock: None,
        default_xtal: XtalFrequency::_40Mhz,
        flash_sizes: ESP32_FLASH_SIZES,
        flash_frequencies: FLASH_FREQUENCIES,
        default_flash_frequency: FlashFrequency::_40Mhz,
        bootloader_address: 0x0,
    },
    ChipDescriptor {
        chip: Chip::Esp8266,
        magic_values: &[0xfff0_c101],
        rom_status_len: 2,
        rom_extended_commands: false,
        rom_encrypted_begin: false,
        erase_policy: ErasePolicy::Esp8266HeadSectors,
        spi_registers: SpiRegisters {
            base: 0x6000_0200,
            usr_offset: 0x1c,
            usr1_offset: 0x20,
            usr2_offset: 0x24,
            w0_offset: 0x40,
            mosi_length_offset: None,
            miso_length_offset: None,
        },
        uart_clock: Some(UartClockDivider {
            register: 0x6000_0014,
            mask: UART_CLKDIV_MASK,
            xtal_divider: 2,
            threshold_mhz: 33,
            below: XtalFrequency::_26Mhz,
            above: XtalFrequency::_40Mhz,
        }),
        default_xtal: XtalFrequency::_26Mhz,
        flash_sizes: ESP8266_FLASH_SIZES,
        flash_frequencies: FLASH_FREQUENCIES,
        default_flash_frequency: FlashFrequency::_40Mhz,
        bootloader_address: 0x0,
    },
];
