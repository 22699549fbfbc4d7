//! Binary segments and the flash parameters of bootloader image headers.

use std::{borrow::Cow, fmt, ops::AddAssign};

use log::{debug, warn};

use crate::{
    Error,
    flasher::FlashSettings,
    target::{Chip, ChipDescriptor},
};

/// First byte of every application and bootloader image.
pub const ESP_MAGIC: u8 = 0xE9;

const FLASH_MODE_OFFSET: usize = 2;
const SIZE_FREQ_OFFSET: usize = 3;
/// Last byte of the extended header, set when a SHA-256 digest is appended.
const HASH_APPENDED_OFFSET: usize = 23;

/// Binary data to be written at an address.
#[derive(Default, Clone, Eq, PartialEq)]
pub struct Segment<'a> {
    /// Base address of the segment
    pub addr: u32,
    /// Segment data
    pub data: Cow<'a, [u8]>,
}

impl<'a> Segment<'a> {
    /// Creates a new [`Segment`].
    pub fn new(addr: u32, data: &'a [u8]) -> Self {
        Segment {
            addr,
            data: Cow::Borrowed(data),
        }
    }

    /// Return a [`Segment`] borrowing from this one.
    pub fn borrow<'b>(&'b self) -> Segment<'b>
    where
        'a: 'b,
    {
        Segment {
            addr: self.addr,
            data: Cow::Borrowed(self.data.as_ref()),
        }
    }

    /// Return the size of the segment
    pub fn size(&self) -> u32 {
        self.data.len() as u32
    }
}

impl AddAssign<&'_ [u8]> for Segment<'_> {
    fn add_assign(&mut self, rhs: &'_ [u8]) {
        self.data.to_mut().extend_from_slice(rhs);
    }
}

impl fmt::Debug for Segment<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Segment")
            .field("addr", &format_args!("{:#010x}", self.addr))
            .field("size", &self.size())
            .finish()
    }
}

/// Patch the flash mode, size and frequency of a bootloader image header.
///
/// Only a segment written to the bootloader address of the chip and starting
/// with [ESP_MAGIC] is changed. Settings left as `None` keep the value found
/// in the header.
pub fn update_flash_params<'a>(
    descriptor: &ChipDescriptor,
    segment: Segment<'a>,
    settings: &FlashSettings,
) -> Result<Segment<'a>, Error> {
    if segment.addr != descriptor.bootloader_address
        || segment.data.len() <= SIZE_FREQ_OFFSET
        || segment.data[0] != ESP_MAGIC
    {
        return Ok(segment);
    }

    if settings.mode.is_none() && settings.size.is_none() && settings.freq.is_none() {
        return Ok(segment);
    }

    let size_code = settings
        .size
        .map(|size| descriptor.encode_flash_size(size))
        .transpose()?;
    let freq_code = settings
        .freq
        .map(|freq| descriptor.encode_flash_frequency(freq))
        .transpose()?;

    let mut segment = segment;
    let header = segment.data.to_mut();

    if let Some(mode) = settings.mode {
        header[FLASH_MODE_OFFSET] = mode.encode();
    }

    let old = header[SIZE_FREQ_OFFSET];
    let size = size_code.unwrap_or(old & 0xF0);
    let freq = freq_code.unwrap_or(old & 0x0F);
    header[SIZE_FREQ_OFFSET] = size | freq;

    debug!(
        "Bootloader header flash parameters: mode {:#04x}, size/frequency {:#04x}",
        header[FLASH_MODE_OFFSET], header[SIZE_FREQ_OFFSET]
    );

    if descriptor.chip != Chip::Esp8266
        && header.len() > HASH_APPENDED_OFFSET
        && header[HASH_APPENDED_OFFSET] == 1
    {
        warn!(
            "Flash parameters of the bootloader image were changed, its appended SHA-256 digest is now stale"
        );
    }

    Ok(segment)
}
