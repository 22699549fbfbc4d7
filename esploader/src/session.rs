//! Per-connection session state
//!
//! A [Session] is produced by [Connection::connect] and records what has been
//! learned about the device: its chip, whether the flash stub is running, and
//! the current baud rate.
//!
//! [Connection::connect]: crate::connection::Connection::connect

use log::debug;

use crate::{Error, target::Chip};

/// Flash write block size understood by the ROM loaders.
pub const ROM_FLASH_WRITE_SIZE: usize = 0x400;
/// Flash write block size understood by the flash stub.
pub const STUB_FLASH_WRITE_SIZE: usize = 0x4000;

/// State of an established connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    chip: Option<Chip>,
    stub: bool,
    flash_write_size: usize,
    baud: u32,
}

impl Session {
    pub(crate) fn new(chip: Option<Chip>, baud: u32) -> Self {
        Session {
            chip,
            stub: false,
            flash_write_size: ROM_FLASH_WRITE_SIZE,
            baud,
        }
    }

    /// The resolved chip, if any.
    pub fn chip(&self) -> Option<Chip> {
        self.chip
    }

    /// The resolved chip, or [Error::ChipNotProvided].
    pub fn require_chip(&self) -> Result<Chip, Error> {
        self.chip.ok_or(Error::ChipNotProvided)
    }

    /// Whether the flash stub is running on the device.
    pub fn is_stub(&self) -> bool {
        self.stub
    }

    /// Block size used by flash write commands.
    pub fn flash_write_size(&self) -> usize {
        self.flash_write_size
    }

    /// Baud rate of the link.
    pub fn baud(&self) -> u32 {
        self.baud
    }

    pub(crate) fn set_baud(&mut self, baud: u32) {
        self.baud = baud;
    }

    /// Switch to stub mode. There is no way back within a session.
    pub(crate) fn enter_stub_mode(&mut self) {
        debug!("Session switched to stub mode");
        self.stub = true;
        self.flash_write_size = STUB_FLASH_WRITE_SIZE;
    }

    /// Settle the chip of an unresolved session, or check that a resolved
    /// session matches the expected chip.
    pub(crate) fn resolve_chip(&mut self, chip: Chip) -> Result<(), Error> {
        match self.chip {
            Some(detected) if detected != chip => Err(Error::ChipMismatch {
                expected: chip,
                detected,
            }),
            _ => {
                self.chip = Some(chip);
                Ok(())
            }
        }
    }

    /// Number of status bytes at the end of every response.
    pub fn status_len(&self) -> usize {
        if self.stub {
            2
        } else {
            self.chip
                .map_or(4, |chip| chip.descriptor().rom_status_len)
        }
    }

    /// Whether begin commands carry the trailing encryption word.
    pub(crate) fn encrypted_begin(&self) -> bool {
        !self.stub
            && self
                .chip
                .is_some_and(|chip| chip.descriptor().rom_encrypted_begin)
    }
}
