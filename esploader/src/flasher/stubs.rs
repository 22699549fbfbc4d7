//! Flash stub payloads
//!
//! The stub binaries are not part of this crate. Callers hand them over as
//! [FlashStub] values, typically deserialized from the files shipped with the
//! stub releases.

use miniz_oxide::inflate::decompress_to_vec_zlib;
use serde::{Deserialize, Serialize};

use crate::Error;

/// Register holding the chip detection magic value.
pub(crate) const CHIP_DETECT_MAGIC_REG_ADDR: u32 = 0x4000_1000;
/// Frame the stub sends once it is running.
pub(crate) const EXPECTED_STUB_HANDSHAKE: &[u8] = b"OHAI";
/// Frames read while waiting for the handshake.
pub(crate) const MAX_HANDSHAKE_FRAMES: usize = 10;

/// Flash stub object (deserialized from a stub description)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlashStub {
    /// Entry point (address)
    entry: u32,
    /// zlib-compressed text section
    text: Vec<u8>,
    /// Start of text section address
    text_start: u32,
    /// zlib-compressed data section
    data: Vec<u8>,
    /// Start of data section address
    data_start: u32,
}

impl FlashStub {
    /// Create a stub from its zlib-compressed sections.
    pub fn new(entry: u32, text_start: u32, text: Vec<u8>, data_start: u32, data: Vec<u8>) -> Self {
        FlashStub {
            entry,
            text,
            text_start,
            data,
            data_start,
        }
    }

    /// Fetch stub entry point
    pub fn entry(&self) -> u32 {
        self.entry
    }

    /// Fetch text start address and decompressed bytes
    pub fn text(&self) -> Result<(u32, Vec<u8>), Error> {
        Ok((self.text_start, inflate(&self.text, "text")?))
    }

    /// Fetch data start address and decompressed bytes
    pub fn data(&self) -> Result<(u32, Vec<u8>), Error> {
        Ok((self.data_start, inflate(&self.data, "data")?))
    }
}

fn inflate(section: &[u8], name: &str) -> Result<Vec<u8>, Error> {
    decompress_to_vec_zlib(section)
        .map_err(|e| Error::InvalidStub(format!("{name} section does not decompress: {e:?}")))
}
