//! Library errors

use strum::Display;
use thiserror::Error;

use crate::{
    command::CommandType,
    connection::{SerialPortError, SerialPortErrorKind, slip::SlipError},
    flasher::{FlashFrequency, FlashSize},
    target::Chip,
};

/// Coarse classification of an [Error].
///
/// Callers that only need to decide whether to retry, report a bad device or
/// abort can match on this instead of the full error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[non_exhaustive]
pub enum ErrorKind {
    /// No qualifying response arrived before the deadline.
    Timeout,
    /// Malformed frame, unexpected response or a command rejected by the
    /// target.
    Protocol,
    /// The device could not be brought up (sync, chip detection, stub).
    Connection,
    /// Post-write verification failed.
    Integrity,
    /// The request exceeds what the target or the protocol can do.
    Capability,
    /// The serial transport itself failed.
    Transport,
    /// Invalid caller-provided configuration.
    Configuration,
}

/// All possible errors returned by this library.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// No response arrived in time.
    #[error("Timeout while running {0} command")]
    Timeout(CommandType),

    /// A response could not be parsed or did not fit the request.
    #[error("Received an invalid response: {0}")]
    InvalidResponse(String),

    /// The target rejected an opcode it does not know.
    #[error("The target does not support the {0} command")]
    UnsupportedCommand(CommandType),

    /// The target reported a failure status.
    #[error(transparent)]
    RomError(Box<RomError>),

    /// A frame could not be unescaped.
    #[error("Malformed frame: {0}")]
    InvalidSlip(#[from] SlipError),

    /// The device could not be brought up.
    #[error(transparent)]
    Connection(Box<ConnectionError>),

    /// The chip magic value matches no known chip.
    #[error("Unrecognized chip magic value: {0:#010x}")]
    ChipDetect(u32),

    /// The detected chip differs from the configured one.
    #[error("Chip provided ({expected}) does not match the detected chip ({detected})")]
    ChipMismatch {
        /// Configured chip.
        expected: Chip,
        /// Detected chip.
        detected: Chip,
    },

    /// No chip was detected or configured.
    #[error("The chip is unknown: the connection was not resolved and no chip was configured")]
    ChipNotProvided,

    /// The flash stub is missing or malformed.
    #[error("Invalid flash stub: {0}")]
    InvalidStub(String),

    /// No SPI flash answered.
    #[error("Unable to detect the attached SPI flash chip")]
    FlashConnect,

    /// The MD5 of written flash differs from the data sent.
    #[error(
        "Verification of flash contents at {address:#x} failed: expected MD5 {expected:032x}, found {actual:032x}"
    )]
    VerifyFailed {
        /// Start of the segment.
        address: u32,
        /// Digest of the data sent.
        expected: u128,
        /// Digest reported by the target.
        actual: u128,
    },

    /// An SPI transaction payload exceeds 64 bytes.
    #[error("SPI commands can send at most 64 bytes, {0} were requested")]
    SpiPayloadTooLarge(usize),

    /// An SPI transaction reads more than 32 bits.
    #[error("SPI commands can read back at most 32 bits, {0} were requested")]
    SpiReadTooWide(u32),

    /// An SPI transaction never completed.
    #[error("SPI command {0:#04x} did not complete in time")]
    SpiCommandTimeout(u8),

    /// The flash capacity byte is not known.
    #[error("Unrecognized flash size ID: {0:#04x}")]
    UnsupportedFlash(u8),

    /// The flash size cannot be used on this chip.
    #[error("Flash size {size} is not supported by {chip}")]
    UnsupportedFlashSize {
        /// Target chip.
        chip: Chip,
        /// Requested size.
        size: FlashSize,
    },

    /// The flash frequency cannot be used on this chip.
    #[error("Flash frequency {frequency} is not supported by {chip}")]
    UnsupportedFlashFrequency {
        /// Target chip.
        chip: Chip,
        /// Requested frequency.
        frequency: FlashFrequency,
    },

    /// A flash size could not be parsed.
    #[error("Invalid flash size: {0}")]
    InvalidFlashSize(String),

    /// The operation only works with the flash stub.
    #[error("The {0} operation requires the flash stub")]
    StubRequired(&'static str),

    /// The chip lacks the feature.
    #[error("The {feature} operation is not supported on {chip}")]
    UnsupportedFeature {
        /// Target chip.
        chip: Chip,
        /// Name of the operation.
        feature: &'static str,
    },

    /// An erase region is not sector aligned.
    #[error("Erase region {offset:#x}+{size:#x} is not aligned to the flash sector size")]
    InvalidEraseRegion {
        /// Requested start address.
        offset: u32,
        /// Requested length.
        size: u32,
    },

    /// A block was sent without a write in progress.
    #[error("No flash write is in progress")]
    NoWriteInProgress,

    /// A custom reset sequence could not be parsed.
    #[error("Invalid reset sequence: {0}")]
    InvalidResetSequence(String),

    /// The serial port failed.
    #[error(transparent)]
    Serial(SerialPortError),
}

impl Error {
    /// The coarse [ErrorKind] of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Timeout(_) | Error::SpiCommandTimeout(_) => ErrorKind::Timeout,
            Error::InvalidResponse(_)
            | Error::UnsupportedCommand(_)
            | Error::RomError(_)
            | Error::InvalidSlip(_)
            | Error::NoWriteInProgress => ErrorKind::Protocol,
            Error::Connection(_)
            | Error::ChipDetect(_)
            | Error::InvalidStub(_)
            | Error::FlashConnect => ErrorKind::Connection,
            Error::VerifyFailed { .. } => ErrorKind::Integrity,
            Error::SpiPayloadTooLarge(_)
            | Error::SpiReadTooWide(_)
            | Error::UnsupportedFlash(_)
            | Error::UnsupportedFlashSize { .. }
            | Error::UnsupportedFlashFrequency { .. }
            | Error::StubRequired(_)
            | Error::UnsupportedFeature { .. }
            | Error::InvalidEraseRegion { .. } => ErrorKind::Capability,
            Error::Serial(_) => ErrorKind::Transport,
            Error::ChipMismatch { .. }
            | Error::ChipNotProvided
            | Error::InvalidFlashSize(_)
            | Error::InvalidResetSequence(_) => ErrorKind::Configuration,
        }
    }
}

impl From<SerialPortError> for Error {
    fn from(err: SerialPortError) -> Self {
        match err.kind {
            SerialPortErrorKind::Timeout => Error::Timeout(CommandType::Unknown),
            _ => Error::Serial(err),
        }
    }
}

impl From<ConnectionError> for Error {
    fn from(err: ConnectionError) -> Self {
        Error::Connection(Box::new(err))
    }
}

impl From<RomError> for Error {
    fn from(err: RomError) -> Self {
        Error::RomError(Box::new(err))
    }
}

/// Connection-related errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConnectionError {
    /// No reset strategy got a sync reply.
    #[error("Failed to connect to the device")]
    ConnectionFailed,

    /// The boot log shows download mode but syncs went unanswered.
    #[error("The device is in download mode but did not respond to sync requests")]
    NoSyncReply,

    /// The boot log shows a mode other than download.
    #[error("The device is not in download mode (boot mode {0})")]
    WrongBootMode(String),

    /// The stub never sent its greeting.
    #[error("The flash stub did not acknowledge its startup")]
    InvalidStubHandshake,
}

/// An error reported by the ROM bootloader or the flash stub.
#[derive(Clone, Copy, Debug, Error)]
#[non_exhaustive]
#[error("Error while running {command} command: {kind}")]
pub struct RomError {
    command: CommandType,
    kind: RomErrorKind,
}

impl RomError {
    pub(crate) fn new(command: CommandType, kind: RomErrorKind) -> RomError {
        RomError { command, kind }
    }

    /// The command that failed.
    pub fn command(&self) -> CommandType {
        self.command
    }

    /// The reported failure.
    pub fn kind(&self) -> RomErrorKind {
        self.kind
    }
}

/// Error codes reported in the status bytes of a response.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Error)]
#[non_exhaustive]
#[repr(u8)]
pub enum RomErrorKind {
    /// Unrecognised or malformed request.
    #[error("Received message is invalid")]
    InvalidMessage = 0x05,
    /// The command could not be carried out.
    #[error("Bootloader failed to execute command")]
    FailedToAct = 0x06,
    /// Checksum mismatch.
    #[error("Received message has invalid CRC")]
    InvalidCrc = 0x07,
    /// Flash write failed.
    #[error("Bootloader failed to write to flash")]
    FlashWriteError = 0x08,
    /// Flash read failed.
    #[error("Bootloader failed to read from flash")]
    FlashReadError = 0x09,
    /// Bad flash read length.
    #[error("Invalid length for flash read")]
    FlashReadLengthError = 0x0a,
    /// Bad compressed data.
    #[error("Malformed compressed data received")]
    DeflateError = 0x0b,
    /// Bad data length.
    #[error("Bad data length")]
    BadDataLen = 0xc0,
    /// Bad data checksum.
    #[error("Bad data checksum")]
    BadDataChecksum = 0xc1,
    /// Bad block size.
    #[error("Bad block size")]
    BadBlocksize = 0xc2,
    /// Unknown command.
    #[error("Invalid command")]
    InvalidCommand = 0xc3,
    /// SPI operation failed.
    #[error("SPI operation failed")]
    FailedSpiOp = 0xc4,
    /// SPI unlock failed.
    #[error("SPI unlock failed")]
    FailedSpiUnlock = 0xc5,
    /// No flash write in progress.
    #[error("Not in flash mode")]
    NotInFlashMode = 0xc6,
    /// Decompression failed.
    #[error("Error when uncompressing the data")]
    InflateError = 0xc7,
    /// Too little data.
    #[error("Didn't receive enough data")]
    NotEnoughData = 0xc8,
    /// Too much data.
    #[error("Received too much data")]
    TooMuchData = 0xc9,
    /// Command not implemented.
    #[error("Command not implemented")]
    CmdNotImplemented = 0xff,
    /// Any other code.
    #[error("Other")]
    Other = 0xfe,
}

impl From<u8> for RomErrorKind {
    fn from(raw: u8) -> Self {
        match raw {
            0x05 => RomErrorKind::InvalidMessage,
            0x06 => RomErrorKind::FailedToAct,
            0x07 => RomErrorKind::InvalidCrc,
            0x08 => RomErrorKind::FlashWriteError,
            0x09 => RomErrorKind::FlashReadError,
            0x0a => RomErrorKind::FlashReadLengthError,
            0x0b => RomErrorKind::DeflateError,
            0xc0 => RomErrorKind::BadDataLen,
            0xc1 => RomErrorKind::BadDataChecksum,
            0xc2 => RomErrorKind::BadBlocksize,
            0xc3 => RomErrorKind::InvalidCommand,
            0xc4 => RomErrorKind::FailedSpiOp,
            0xc5 => RomErrorKind::FailedSpiUnlock,
            0xc6 => RomErrorKind::NotInFlashMode,
            0xc7 => RomErrorKind::InflateError,
            0xc8 => RomErrorKind::NotEnoughData,
            0xc9 => RomErrorKind::TooMuchData,
            0xff => RomErrorKind::CmdNotImplemented,
            _ => RomErrorKind::Other,
        }
    }
}

pub(crate) trait ResultExt {
    /// Attach the command type to a bare timeout.
    fn for_command(self, command: CommandType) -> Self;
}

impl<T> ResultExt for Result<T, Error> {
    fn for_command(self, command: CommandType) -> Self {
        match self {
            Err(Error::Timeout(CommandType::Unknown)) => Err(Error::Timeout(command)),
            res => res,
        }
    }
}
