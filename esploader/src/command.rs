//! Commands understood by the ROM bootloader and the flash stub
//!
//! A request packet is an 8-byte header (direction, opcode, payload length,
//! checksum) followed by the payload. Responses share the header layout with
//! the direction byte set to `1` and carry status bytes at the end of their
//! payload.

use std::{mem::size_of, time::Duration};

use bytemuck::{Pod, Zeroable, bytes_of};
use strum::Display;

use crate::{
    Error,
    error::{RomError, RomErrorKind},
    flasher::{SpiAttachParams, SpiSetParams},
};

pub(crate) const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3);
const ERASE_REGION_TIMEOUT_PER_MB: Duration = Duration::from_secs(30);
const ERASE_WRITE_TIMEOUT_PER_MB: Duration = Duration::from_secs(40);
const ERASE_CHIP_TIMEOUT: Duration = Duration::from_secs(120);
const MEM_END_TIMEOUT: Duration = Duration::from_millis(50);
const SYNC_TIMEOUT: Duration = Duration::from_millis(100);
const FLASH_DEFLATE_END_TIMEOUT: Duration = Duration::from_secs(10);
const FLASH_MD5_TIMEOUT_PER_MB: Duration = Duration::from_secs(8);

/// Length of the packet header shared by requests and responses.
pub const HEADER_LEN: usize = 8;

/// Seed of the XOR checksum carried by data packets.
pub const CHECKSUM_INIT: u8 = 0xEF;

/// Direction byte of a response packet.
const DIRECTION_RESPONSE: u8 = 0x01;

/// Status code of a rejected, unrecognised request.
const ROM_INVALID_RECV_MSG: u8 = 0x05;

/// Input data for SYNC command (36 bytes: 0x07 0x07 0x12 0x20, followed by
/// 32 x 0x55)
const SYNC_FRAME: [u8; 36] = [
    0x07, 0x07, 0x12, 0x20, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55,
    0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55,
    0x55, 0x55, 0x55, 0x55,
];

/// Types of commands that can be sent to a target device
///
/// <https://docs.espressif.com/projects/esptool/en/latest/esp32/advanced-topics/serial-protocol.html>
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Display)]
#[non_exhaustive]
#[repr(u8)]
pub enum CommandType {
    /// Placeholder for errors not tied to a command.
    Unknown = 0,
    // Commands supported by the ROM bootloaders
    /// Start a raw flash write.
    FlashBegin = 0x02,
    /// One block of a raw flash write.
    FlashData = 0x03,
    /// Finish a raw flash write.
    FlashEnd = 0x04,
    /// Start a RAM download.
    MemBegin = 0x05,
    /// Finish a RAM download, optionally jumping to an entry point.
    MemEnd = 0x06,
    /// One block of a RAM download.
    MemData = 0x07,
    /// Synchronize with the bootloader.
    Sync = 0x08,
    /// Write a 32-bit register.
    WriteReg = 0x09,
    /// Read a 32-bit register.
    ReadReg = 0x0A,
    // Not supported by the ESP8266 ROM
    /// Set the SPI flash geometry.
    SpiSetParams = 0x0B,
    /// Attach the SPI flash.
    SpiAttach = 0x0D,
    /// Switch the UART baud rate.
    ChangeBaudrate = 0x0F,
    /// Start a compressed flash write.
    FlashDeflBegin = 0x10,
    /// One block of a compressed flash write.
    FlashDeflData = 0x11,
    /// Finish a compressed flash write.
    FlashDeflEnd = 0x12,
    /// MD5 of a flash region.
    FlashMd5 = 0x13,
    // Stub-only commands
    /// Erase the whole flash.
    EraseFlash = 0xD0,
    /// Erase a sector-aligned flash region.
    EraseRegion = 0xD1,
    /// Stream a flash region back to the host.
    ReadFlash = 0xD2,
    /// Leave the stub and run the flashed application.
    RunUserCode = 0xD3,
    /// Read SPI flash manufacturer and device id, not part of the protocol.
    FlashDetect = 0x9F,
}

impl CommandType {
    /// Return a timeout based on the command type
    pub fn timeout(&self) -> Duration {
        match self {
            CommandType::MemEnd => MEM_END_TIMEOUT,
            CommandType::Sync => SYNC_TIMEOUT,
            CommandType::EraseFlash => ERASE_CHIP_TIMEOUT,
            CommandType::FlashDeflEnd => FLASH_DEFLATE_END_TIMEOUT,
            _ => DEFAULT_TIMEOUT,
        }
    }

    /// Return a timeout scaled by the number of bytes the command touches
    pub fn timeout_for_size(&self, size: u32) -> Duration {
        match self {
            CommandType::FlashBegin | CommandType::FlashDeflBegin | CommandType::EraseRegion => {
                timeout_per_mb(ERASE_REGION_TIMEOUT_PER_MB, size)
            }
            CommandType::FlashData | CommandType::FlashDeflData => {
                timeout_per_mb(ERASE_WRITE_TIMEOUT_PER_MB, size)
            }
            CommandType::FlashMd5 => timeout_per_mb(FLASH_MD5_TIMEOUT_PER_MB, size),
            _ => self.timeout(),
        }
    }
}

/// Scale a per-megabyte rate, never going below the default timeout.
fn timeout_per_mb(timeout_per_mb: Duration, size: u32) -> Duration {
    let millis = timeout_per_mb.as_millis() as u64 * u64::from(size) / 1_000_000;
    Duration::from_millis(millis).max(DEFAULT_TIMEOUT)
}

/// Available commands
#[derive(Copy, Clone, Debug)]
#[non_exhaustive]
pub enum Command<'a> {
    /// Begin a raw flash write.
    FlashBegin {
        /// Total number of bytes to erase.
        size: u32,
        /// Number of data packets that will follow.
        blocks: u32,
        /// Size of each data packet.
        block_size: u32,
        /// Target address.
        offset: u32,
        /// Append the encryption word (ESP32-S2 and later ROMs).
        supports_encryption: bool,
    },
    /// Write one raw flash block.
    FlashData {
        /// Block contents.
        data: &'a [u8],
        /// Pad the block up to this many bytes.
        pad_to: usize,
        /// Byte used for padding.
        pad_byte: u8,
        /// Zero-based block index within the transfer.
        sequence: u32,
    },
    /// End a raw flash write.
    FlashEnd {
        /// Reboot into the application afterwards.
        reboot: bool,
    },
    /// Begin a RAM download.
    MemBegin {
        /// Total number of bytes to load.
        size: u32,
        /// Number of data packets that will follow.
        blocks: u32,
        /// Size of each data packet.
        block_size: u32,
        /// Load address.
        offset: u32,
        /// Append the encryption word (ESP32-S2 and later ROMs).
        supports_encryption: bool,
    },
    /// End a RAM download.
    MemEnd {
        /// Stay in the bootloader instead of jumping to `entry`.
        no_entry: bool,
        /// Entry point address.
        entry: u32,
    },
    /// Write one RAM block.
    MemData {
        /// Block contents.
        data: &'a [u8],
        /// Pad the block up to this many bytes.
        pad_to: usize,
        /// Byte used for padding.
        pad_byte: u8,
        /// Zero-based block index within the transfer.
        sequence: u32,
    },
    /// Synchronization frame.
    Sync,
    /// Write a register, optionally masked.
    WriteReg {
        /// Register address.
        address: u32,
        /// Value to write.
        value: u32,
        /// Bits to change, all of them when `None`.
        mask: Option<u32>,
    },
    /// Read a register.
    ReadReg {
        /// Register address.
        address: u32,
    },
    /// Configure the flash geometry.
    SpiSetParams {
        /// Flash geometry.
        spi_params: SpiSetParams,
    },
    /// Attach the SPI flash, ROM form.
    SpiAttach {
        /// Pin configuration.
        spi_params: SpiAttachParams,
    },
    /// Attach the SPI flash, stub form.
    SpiAttachStub {
        /// Pin configuration.
        spi_params: SpiAttachParams,
    },
    /// Switch the baud rate.
    ChangeBaudrate {
        /// New baud rate
        new_baud: u32,
        /// Prior baud rate ('0' for ROM flasher)
        prior_baud: u32,
    },
    /// Begin a compressed flash write.
    FlashDeflBegin {
        /// Uncompressed size in bytes.
        size: u32,
        /// Number of data packets that will follow.
        blocks: u32,
        /// Size of each data packet.
        block_size: u32,
        /// Target address.
        offset: u32,
        /// Append the encryption word (ESP32-S2 and later ROMs).
        supports_encryption: bool,
    },
    /// Write one block of compressed data.
    FlashDeflData {
        /// Block contents.
        data: &'a [u8],
        /// Pad the block up to this many bytes.
        pad_to: usize,
        /// Byte used for padding.
        pad_byte: u8,
        /// Zero-based block index within the transfer.
        sequence: u32,
    },
    /// End a compressed flash write.
    FlashDeflEnd {
        /// Reboot into the application afterwards.
        reboot: bool,
    },
    /// Compute the MD5 of a flash region.
    FlashMd5 {
        /// Start address.
        offset: u32,
        /// Length in bytes.
        size: u32,
    },
    /// Erase the whole flash.
    EraseFlash,
    /// Erase a flash region.
    EraseRegion {
        /// Start address, sector aligned.
        offset: u32,
        /// Length in bytes, sector aligned.
        size: u32,
    },
    /// Read a flash region.
    ReadFlash {
        /// Start address.
        offset: u32,
        /// Length in bytes.
        size: u32,
        /// Bytes per data packet.
        block_size: u32,
        /// Packets sent ahead of the host acknowledgement.
        max_in_flight: u32,
    },
    /// Run the application.
    RunUserCode,
}

impl Command<'_> {
    /// Return the command type
    pub fn command_type(&self) -> CommandType {
        match self {
            Command::FlashBegin { .. } => CommandType::FlashBegin,
            Command::FlashData { .. } => CommandType::FlashData,
            Command::FlashEnd { .. } => CommandType::FlashEnd,
            Command::MemBegin { .. } => CommandType::MemBegin,
            Command::MemData { .. } => CommandType::MemData,
            Command::MemEnd { .. } => CommandType::MemEnd,
            Command::Sync => CommandType::Sync,
            Command::WriteReg { .. } => CommandType::WriteReg,
            Command::ReadReg { .. } => CommandType::ReadReg,
            Command::SpiSetParams { .. } => CommandType::SpiSetParams,
            Command::SpiAttach { .. } | Command::SpiAttachStub { .. } => CommandType::SpiAttach,
            Command::ChangeBaudrate { .. } => CommandType::ChangeBaudrate,
            Command::FlashDeflBegin { .. } => CommandType::FlashDeflBegin,
            Command::FlashDeflData { .. } => CommandType::FlashDeflData,
            Command::FlashDeflEnd { .. } => CommandType::FlashDeflEnd,
            Command::FlashMd5 { .. } => CommandType::FlashMd5,
            Command::EraseFlash => CommandType::EraseFlash,
            Command::EraseRegion { .. } => CommandType::EraseRegion,
            Command::ReadFlash { .. } => CommandType::ReadFlash,
            Command::RunUserCode => CommandType::RunUserCode,
        }
    }

    /// Serialize the command into a request packet, header included.
    pub fn encode(&self) -> Vec<u8> {
        let (payload, checksum) = self.payload();

        let mut packet = Vec::with_capacity(HEADER_LEN + payload.len());
        packet.push(0);
        packet.push(self.command_type() as u8);
        packet.extend_from_slice(&(payload.len() as u16).to_le_bytes());
        packet.extend_from_slice(&checksum.to_le_bytes());
        packet.extend_from_slice(&payload);
        packet
    }

    fn payload(&self) -> (Vec<u8>, u32) {
        match *self {
            Command::FlashBegin {
                size,
                blocks,
                block_size,
                offset,
                supports_encryption,
            }
            | Command::MemBegin {
                size,
                blocks,
                block_size,
                offset,
                supports_encryption,
            }
            | Command::FlashDeflBegin {
                size,
                blocks,
                block_size,
                offset,
                supports_encryption,
            } => (
                begin_payload(size, blocks, block_size, offset, supports_encryption),
                0,
            ),
            Command::FlashData {
                data,
                pad_to,
                pad_byte,
                sequence,
            }
            | Command::MemData {
                data,
                pad_to,
                pad_byte,
                sequence,
            }
            | Command::FlashDeflData {
                data,
                pad_to,
                pad_byte,
                sequence,
            } => data_payload(data, pad_to, pad_byte, sequence),
            // 0 means reboot, 1 means stay/run user code
            Command::FlashEnd { reboot } | Command::FlashDeflEnd { reboot } => {
                (u32::from(!reboot).to_le_bytes().to_vec(), 0)
            }
            Command::MemEnd { no_entry, entry } => {
                #[derive(Zeroable, Pod, Copy, Clone)]
                #[repr(C)]
                struct EntryParams {
                    no_entry: u32,
                    entry: u32,
                }
                let params = EntryParams {
                    no_entry: u32::from(no_entry),
                    entry,
                };
                (bytes_of(&params).to_vec(), 0)
            }
            Command::Sync => (SYNC_FRAME.to_vec(), 0),
            Command::WriteReg {
                address,
                value,
                mask,
            } => {
                #[derive(Zeroable, Pod, Copy, Clone, Debug)]
                #[repr(C)]
                struct WriteRegParams {
                    address: u32,
                    value: u32,
                    mask: u32,
                    delay_us: u32,
                }
                let params = WriteRegParams {
                    address,
                    value,
                    mask: mask.unwrap_or(0xFFFF_FFFF),
                    delay_us: 0,
                };
                (bytes_of(&params).to_vec(), 0)
            }
            Command::ReadReg { address } => (address.to_le_bytes().to_vec(), 0),
            Command::SpiSetParams { spi_params } => (spi_params.encode(), 0),
            Command::SpiAttach { spi_params } => (spi_params.encode(false), 0),
            Command::SpiAttachStub { spi_params } => (spi_params.encode(true), 0),
            Command::ChangeBaudrate {
                new_baud,
                prior_baud,
            } => (words(&[new_baud, prior_baud]), 0),
            Command::FlashMd5 { offset, size } => (words(&[offset, size, 0, 0]), 0),
            Command::EraseRegion { offset, size } => (words(&[offset, size]), 0),
            Command::ReadFlash {
                offset,
                size,
                block_size,
                max_in_flight,
            } => (words(&[offset, size, block_size, max_in_flight]), 0),
            Command::EraseFlash | Command::RunUserCode => (Vec::new(), 0),
        }
    }
}

fn words(values: &[u32]) -> Vec<u8> {
    values.iter().flat_map(|value| value.to_le_bytes()).collect()
}

fn begin_payload(
    size: u32,
    blocks: u32,
    block_size: u32,
    offset: u32,
    supports_encryption: bool,
) -> Vec<u8> {
    #[derive(Zeroable, Pod, Copy, Clone, Debug)]
    #[repr(C)]
    struct BeginParams {
        size: u32,
        blocks: u32,
        block_size: u32,
        offset: u32,
        encrypted: u32,
    }
    let params = BeginParams {
        size,
        blocks,
        block_size,
        offset,
        encrypted: 0,
    };

    let bytes = bytes_of(&params);
    if supports_encryption {
        bytes.to_vec()
    } else {
        // ESP32, ESP8266 and the stub do not take the trailing `encrypted` word
        bytes[..bytes.len() - 4].to_vec()
    }
}

fn data_payload(block_data: &[u8], pad_to: usize, pad_byte: u8, sequence: u32) -> (Vec<u8>, u32) {
    #[derive(Zeroable, Pod, Copy, Clone, Debug)]
    #[repr(C)]
    struct BlockParams {
        size: u32,
        sequence: u32,
        dummy1: u32,
        dummy2: u32,
    }

    let pad_length = pad_to.saturating_sub(block_data.len());

    let params = BlockParams {
        size: (block_data.len() + pad_length) as u32,
        sequence,
        dummy1: 0,
        dummy2: 0,
    };

    let mut payload = Vec::with_capacity(size_of::<BlockParams>() + block_data.len() + pad_length);
    payload.extend_from_slice(bytes_of(&params));
    payload.extend_from_slice(block_data);
    payload.resize(payload.len() + pad_length, pad_byte);

    let check = checksum(&payload[size_of::<BlockParams>()..], CHECKSUM_INIT);

    (payload, u32::from(check))
}

/// XOR-fold `data` into `checksum`.
pub fn checksum(data: &[u8], mut checksum: u8) -> u8 {
    for byte in data {
        checksum ^= *byte;
    }

    checksum
}

/// Value carried by a successful response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandResponseValue {
    /// The 32-bit `value` header field, for responses without extra data.
    ValueU32(u32),
    /// Response data with the status bytes stripped.
    Vector(Vec<u8>),
}

impl TryFrom<CommandResponseValue> for u32 {
    type Error = Error;

    fn try_from(value: CommandResponseValue) -> Result<Self, Self::Error> {
        match value {
            CommandResponseValue::ValueU32(value) => Ok(value),
            CommandResponseValue::Vector(data) => Err(Error::InvalidResponse(format!(
                "expected a 32-bit value, received {} bytes of data",
                data.len()
            ))),
        }
    }
}

impl TryFrom<CommandResponseValue> for Vec<u8> {
    type Error = Error;

    fn try_from(value: CommandResponseValue) -> Result<Self, Self::Error> {
        match value {
            CommandResponseValue::Vector(data) => Ok(data),
            CommandResponseValue::ValueU32(_) => Err(Error::InvalidResponse(
                "expected response data, received a bare value".into(),
            )),
        }
    }
}

/// A decoded response packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResponse {
    /// Direction byte, `1` for responses.
    pub resp: u8,
    /// Opcode this packet answers.
    pub return_op: u8,
    /// The 32-bit `value` header field.
    pub value: u32,
    /// Payload, status bytes included.
    pub data: Vec<u8>,
}

impl CommandResponse {
    /// Parse a decoded frame.
    ///
    /// Frames too short to hold a header yield `Ok(None)`. A length field that
    /// disagrees with the payload is rejected.
    pub fn parse(frame: &[u8]) -> Result<Option<Self>, Error> {
        if frame.len() < HEADER_LEN {
            return Ok(None);
        }

        let length = u16::from_le_bytes([frame[2], frame[3]]) as usize;
        let data = &frame[HEADER_LEN..];
        if length != data.len() {
            return Err(Error::InvalidResponse(format!(
                "length field says {length} bytes, packet carries {}",
                data.len()
            )));
        }

        Ok(Some(CommandResponse {
            resp: frame[0],
            return_op: frame[1],
            value: u32::from_le_bytes([frame[4], frame[5], frame[6], frame[7]]),
            data: data.to_vec(),
        }))
    }

    /// Whether this is a response packet at all.
    pub fn is_response(&self) -> bool {
        self.resp == DIRECTION_RESPONSE
    }

    /// Whether the target flagged the request as an unrecognised message.
    pub fn is_unsupported(&self) -> bool {
        self.data.len() >= 2 && self.data[0] != 0 && self.data[1] == ROM_INVALID_RECV_MSG
    }

    /// Interpret the trailing `status_len` status bytes.
    pub fn check(self, command: CommandType, status_len: usize) -> Result<CommandResponseValue, Error> {
        if self.data.len() < status_len {
            return Err(Error::InvalidResponse(format!(
                "{command} response carries {} bytes, fewer than its {status_len} status bytes",
                self.data.len()
            )));
        }

        let split = self.data.len() - status_len;
        let status = &self.data[split..];
        if status[0] != 0 {
            return Err(RomError::new(command, RomErrorKind::from(status[1])).into());
        }

        if split > 0 {
            let mut data = self.data;
            data.truncate(split);
            Ok(CommandResponseValue::Vector(data))
        } else {
            Ok(CommandResponseValue::ValueU32(self.value))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(op: u8, value: u32, data: &[u8]) -> Vec<u8> {
        let mut frame = vec![1, op];
        frame.extend_from_slice(&(data.len() as u16).to_le_bytes());
        frame.extend_from_slice(&value.to_le_bytes());
        frame.extend_from_slice(data);
        frame
    }

    #[test]
    fn sync_packet_layout() {
        let packet = Command::Sync.encode();

        assert_eq!(&packet[..8], &[0x00, 0x08, 36, 0, 0, 0, 0, 0]);
        assert_eq!(&packet[8..12], &[0x07, 0x07, 0x12, 0x20]);
        assert!(packet[12..].iter().all(|&b| b == 0x55));
    }

    #[test]
    fn data_packet_carries_checksum_of_padded_block() {
        let packet = Command::FlashData {
            data: &[0x01, 0x02],
            pad_to: 4,
            pad_byte: 0xff,
            sequence: 7,
        }
        .encode();

        assert_eq!(packet[1], CommandType::FlashData as u8);
        assert_eq!(u16::from_le_bytes([packet[2], packet[3]]), 16 + 4);
        let expected = CHECKSUM_INIT ^ 0x01 ^ 0x02 ^ 0xff ^ 0xff;
        assert_eq!(&packet[4..8], &[expected, 0, 0, 0]);
        // size, sequence, two reserved words
        assert_eq!(&packet[8..12], &4u32.to_le_bytes());
        assert_eq!(&packet[12..16], &7u32.to_le_bytes());
        assert_eq!(&packet[24..], &[0x01, 0x02, 0xff, 0xff]);
    }

    #[test]
    fn begin_drops_encryption_word_when_unsupported() {
        let plain = Command::FlashBegin {
            size: 0x1000,
            blocks: 4,
            block_size: 0x400,
            offset: 0x10000,
            supports_encryption: false,
        }
        .encode();
        let encrypted = Command::FlashDeflBegin {
            size: 0x1000,
            blocks: 4,
            block_size: 0x400,
            offset: 0x10000,
            supports_encryption: true,
        }
        .encode();

        assert_eq!(plain.len(), HEADER_LEN + 16);
        assert_eq!(encrypted.len(), HEADER_LEN + 20);
        assert_eq!(&plain[20..24], &0x10000u32.to_le_bytes());
    }

    #[test]
    fn end_commands_invert_reboot_flag() {
        assert_eq!(&Command::FlashEnd { reboot: true }.encode()[8..], &[0, 0, 0, 0]);
        assert_eq!(&Command::FlashDeflEnd { reboot: false }.encode()[8..], &[1, 0, 0, 0]);
    }

    #[test]
    fn checksum_is_order_independent() {
        let payload = [0x12, 0x34, 0x56, 0x78, 0x9a];
        let mut reversed = payload;
        reversed.reverse();

        assert_eq!(checksum(&payload, CHECKSUM_INIT), checksum(&reversed, CHECKSUM_INIT));
        assert_eq!(checksum(&[], CHECKSUM_INIT), CHECKSUM_INIT);
    }

    #[test]
    fn checksum_detects_single_byte_changes() {
        let payload = [0x10u8; 32];
        let reference = checksum(&payload, CHECKSUM_INIT);

        for index in 0..payload.len() {
            let mut mutated = payload;
            mutated[index] ^= 0x5a;
            assert_ne!(checksum(&mutated, CHECKSUM_INIT), reference);
        }
    }

    #[test]
    fn size_scaled_timeouts_have_a_floor() {
        assert_eq!(CommandType::FlashDeflBegin.timeout_for_size(0x1000), DEFAULT_TIMEOUT);
        assert_eq!(
            CommandType::FlashBegin.timeout_for_size(4_000_000),
            Duration::from_secs(120)
        );
        assert_eq!(CommandType::EraseFlash.timeout(), Duration::from_secs(120));
    }

    #[test]
    fn rejects_length_mismatch() {
        let mut frame = response(0x0A, 0, &[0, 0, 0, 0]);
        frame[2] = 6;

        assert!(matches!(
            CommandResponse::parse(&frame),
            Err(Error::InvalidResponse(_))
        ));
    }

    #[test]
    fn short_frames_are_not_responses() {
        assert_eq!(CommandResponse::parse(b"OHAI").unwrap(), None);
    }

    #[test]
    fn checked_value_and_data() {
        let frame = response(0x0A, 0xdead_beef, &[0, 0, 0, 0]);
        let value = CommandResponse::parse(&frame)
            .unwrap()
            .unwrap()
            .check(CommandType::ReadReg, 4)
            .unwrap();
        assert_eq!(value, CommandResponseValue::ValueU32(0xdead_beef));

        let frame = response(0x13, 0, &[0xaa; 18]);
        let mut data = frame.clone();
        let len = data.len();
        data[len - 2] = 0;
        data[len - 1] = 0;
        let value = CommandResponse::parse(&data)
            .unwrap()
            .unwrap()
            .check(CommandType::FlashMd5, 2)
            .unwrap();
        assert_eq!(value, CommandResponseValue::Vector(vec![0xaa; 16]));
    }

    #[test]
    fn failed_status_is_a_rom_error() {
        let frame = response(0x03, 0, &[1, 0x07, 0, 0]);
        let err = CommandResponse::parse(&frame)
            .unwrap()
            .unwrap()
            .check(CommandType::FlashData, 4)
            .unwrap_err();

        match err {
            Error::RomError(rom) => {
                assert_eq!(rom.command(), CommandType::FlashData);
                assert_eq!(rom.kind(), RomErrorKind::InvalidCrc);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn detects_unsupported_marker() {
        let frame = response(0x00, 0, &[1, 0x05]);
        assert!(CommandResponse::parse(&frame).unwrap().unwrap().is_unsupported());
    }
}
