//! SPI flash target module.
//!
//! Writes segments to the SPI flash with FlashBegin/FlashData/FlashEnd or
//! their compressed counterparts, optionally skipping unchanged segments and
//! verifying the result with the on-device MD5 command.

use std::borrow::Cow;

use log::{debug, info, warn};
use md5::{Digest, Md5};
use miniz_oxide::deflate::compress_to_vec_zlib;

use super::ProgressCallbacks;
use crate::{
    Error,
    command::{Command, CommandResponseValue, CommandType},
    connection::{Connection, SerialInterface},
    flasher::{SpiAttachParams, stubs::CHIP_DETECT_MAGIC_REG_ADDR},
    image_format::Segment,
    session::Session,
    target::Chip,
};

const ZLIB_LEVEL: u8 = 9;

/// State of a FlashBegin/FlashDeflBegin in progress.
#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq)]
struct WriteState {
    compressed: bool,
    sequence: u32,
}

/// Applications running from the SPI flash
#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq)]
pub struct SpiFlashTarget {
    chip: Chip,
    spi_attach_params: SpiAttachParams,
    verify: bool,
    skip: bool,
    compress: bool,
    write: Option<WriteState>,
    last_compressed: bool,
}

impl SpiFlashTarget {
    /// Create a new SPI flash target.
    pub fn new(
        chip: Chip,
        spi_attach_params: SpiAttachParams,
        verify: bool,
        skip: bool,
        compress: bool,
    ) -> Self {
        SpiFlashTarget {
            chip,
            spi_attach_params,
            verify,
            skip,
            compress,
            write: None,
            last_compressed: false,
        }
    }

    /// Begin the flashing operation by attaching the SPI flash.
    pub async fn begin<P: SerialInterface>(
        &mut self,
        connection: &mut Connection<P>,
        session: &Session,
    ) -> Result<(), Error> {
        attach_flash(connection, session, self.spi_attach_params).await
    }

    /// Start a write of `size` bytes at `offset`.
    ///
    /// With `compressed_size` set, the blocks that follow carry zlib data of
    /// that length.
    pub async fn begin_write<P: SerialInterface>(
        &mut self,
        connection: &mut Connection<P>,
        session: &Session,
        offset: u32,
        size: u32,
        compressed_size: Option<u32>,
    ) -> Result<(), Error> {
        let block_size = session.flash_write_size() as u32;
        let blocks = compressed_size.unwrap_or(size).div_ceil(block_size);

        let (erase_size, timeout) = if session.is_stub() {
            (size, CommandType::FlashBegin.timeout())
        } else {
            let erase_size = match compressed_size {
                Some(_) => size.div_ceil(block_size) * block_size,
                None => self
                    .chip
                    .descriptor()
                    .erase_policy
                    .erase_size(offset, size),
            };
            (
                erase_size,
                CommandType::FlashBegin.timeout_for_size(erase_size),
            )
        };

        debug!(
            "Begin write of {size:#x} bytes at {offset:#010x}, {blocks} blocks, erasing {erase_size:#x}"
        );

        let command = if compressed_size.is_some() {
            Command::FlashDeflBegin {
                size: erase_size,
                blocks,
                block_size,
                offset,
                supports_encryption: session.encrypted_begin(),
            }
        } else {
            Command::FlashBegin {
                size: erase_size,
                blocks,
                block_size,
                offset,
                supports_encryption: session.encrypted_begin(),
            }
        };
        connection.checked_command(command, timeout, session).await?;

        self.write = Some(WriteState {
            compressed: compressed_size.is_some(),
            sequence: 0,
        });

        Ok(())
    }

    /// Send the next block of the write in progress.
    pub async fn write_block<P: SerialInterface>(
        &mut self,
        connection: &mut Connection<P>,
        session: &Session,
        block: &[u8],
        timeout: std::time::Duration,
    ) -> Result<(), Error> {
        let state = self.write.as_mut().ok_or(Error::NoWriteInProgress)?;

        let command = if state.compressed {
            Command::FlashDeflData {
                data: block,
                pad_to: 0,
                pad_byte: 0xff,
                sequence: state.sequence,
            }
        } else {
            Command::FlashData {
                data: block,
                pad_to: session.flash_write_size(),
                pad_byte: 0xff,
                sequence: state.sequence,
            }
        };
        connection.checked_command(command, timeout, session).await?;

        state.sequence += 1;

        Ok(())
    }

    /// End the write in progress.
    pub async fn finish_write<P: SerialInterface>(
        &mut self,
        connection: &mut Connection<P>,
        session: &Session,
        reboot: bool,
    ) -> Result<(), Error> {
        let state = self.write.take().ok_or(Error::NoWriteInProgress)?;

        let command = if state.compressed {
            Command::FlashDeflEnd { reboot }
        } else {
            Command::FlashEnd { reboot }
        };
        let timeout = command.command_type().timeout();
        connection.checked_command(command, timeout, session).await?;

        Ok(())
    }

    /// Write a segment to the target device.
    pub async fn write_segment<P: SerialInterface>(
        &mut self,
        connection: &mut Connection<P>,
        session: &Session,
        segment: Segment<'_>,
        progress: &mut dyn ProgressCallbacks,
    ) -> Result<(), Error> {
        let addr = segment.addr;

        let data = pad_to_word(segment.data);
        let size = data.len() as u32;

        let checksum_md5 = u128::from_be_bytes(Md5::digest(&data).into());
        let md5_supported = supports_md5(self.chip, session);

        if self.skip && md5_supported {
            let flash_checksum_md5 = flash_md5(connection, session, addr, size).await?;

            if checksum_md5 == flash_checksum_md5 {
                info!("Segment at address {addr:#x} has not changed, skipping write");

                progress.finish(true);
                return Ok(());
            }
        }

        progress.init(addr, data.len());

        self.last_compressed =
            self.compress && (session.is_stub() || self.chip.descriptor().rom_extended_commands);
        if self.last_compressed {
            self.write_compressed(connection, session, addr, &data, progress)
                .await?;
        } else {
            self.write_raw(connection, session, addr, &data, progress)
                .await?;
        }

        // The stub acknowledges blocks before they are written out, a register
        // read waits for the pipeline to drain
        if session.is_stub() {
            connection
                .read_reg(session, CHIP_DETECT_MAGIC_REG_ADDR)
                .await?;
        }

        if self.verify {
            if md5_supported {
                progress.verifying();

                let flash_checksum_md5 = flash_md5(connection, session, addr, size).await?;
                if checksum_md5 != flash_checksum_md5 {
                    return Err(Error::VerifyFailed {
                        address: addr,
                        expected: checksum_md5,
                        actual: flash_checksum_md5,
                    });
                }
                debug!("Segment at address {addr:#x} verified successfully");
            } else {
                warn!(
                    "The {} ROM cannot compute flash checksums, segment at {addr:#x} was not verified",
                    self.chip
                );
            }
        }

        progress.finish(false);

        Ok(())
    }

    async fn write_raw<P: SerialInterface>(
        &mut self,
        connection: &mut Connection<P>,
        session: &Session,
        addr: u32,
        data: &[u8],
        progress: &mut dyn ProgressCallbacks,
    ) -> Result<(), Error> {
        self.begin_write(connection, session, addr, data.len() as u32, None)
            .await?;

        let mut written = 0;
        for block in data.chunks(session.flash_write_size()) {
            let timeout = CommandType::FlashData.timeout_for_size(block.len() as u32);
            self.write_block(connection, session, block, timeout)
                .await?;

            written += block.len();
            progress.update(written);
        }

        Ok(())
    }

    async fn write_compressed<P: SerialInterface>(
        &mut self,
        connection: &mut Connection<P>,
        session: &Session,
        addr: u32,
        data: &[u8],
        progress: &mut dyn ProgressCallbacks,
    ) -> Result<(), Error> {
        let compressed = compress_to_vec_zlib(data, ZLIB_LEVEL);
        debug!(
            "Compressed {} bytes to {} bytes",
            data.len(),
            compressed.len()
        );

        self.begin_write(
            connection,
            session,
            addr,
            data.len() as u32,
            Some(compressed.len() as u32),
        )
        .await?;

        let chunks = compressed.chunks(session.flash_write_size());
        let num_chunks = chunks.len();

        // Uncompressed bytes per block are estimated from the overall ratio
        let mut written = 0;
        for (i, block) in chunks.enumerate() {
            let estimated = if i + 1 == num_chunks {
                data.len() - written
            } else {
                let estimate = block.len() as u64 * data.len() as u64 / compressed.len() as u64;
                (estimate as usize).min(data.len() - written)
            };

            let timeout = CommandType::FlashDeflData.timeout_for_size(estimated as u32);
            self.write_block(connection, session, block, timeout)
                .await?;

            written += estimated;
            progress.update(written);
        }

        Ok(())
    }

    /// Complete the flashing operation.
    ///
    /// The stub is told to flush its last writes with an empty write of the
    /// same kind as the last segment. The configured after-reset runs when
    /// `reboot` is set.
    pub async fn finish<P: SerialInterface>(
        &mut self,
        connection: &mut Connection<P>,
        session: &Session,
        reboot: bool,
    ) -> Result<(), Error> {
        if session.is_stub() {
            let compressed_size = self.last_compressed.then_some(0);
            self.begin_write(connection, session, 0, 0, compressed_size)
                .await?;
            self.finish_write(connection, session, false).await?;
        }

        if reboot {
            connection.reset_after(session).await?;
        }

        Ok(())
    }
}

/// Attach the SPI flash with the given pins.
///
/// The ESP8266 ROM has no attach command, an empty FlashBegin attaches the
/// flash instead.
pub(crate) async fn attach_flash<P: SerialInterface>(
    connection: &mut Connection<P>,
    session: &Session,
    spi_params: SpiAttachParams,
) -> Result<(), Error> {
    let chip = session.require_chip()?;

    let command = if session.is_stub() {
        Command::SpiAttachStub { spi_params }
    } else if chip.descriptor().rom_extended_commands {
        Command::SpiAttach { spi_params }
    } else {
        Command::FlashBegin {
            size: 0,
            blocks: 0,
            block_size: session.flash_write_size() as u32,
            offset: 0,
            supports_encryption: session.encrypted_begin(),
        }
    };

    let timeout = command.command_type().timeout();
    connection.checked_command(command, timeout, session).await?;

    Ok(())
}

fn supports_md5(chip: Chip, session: &Session) -> bool {
    session.is_stub() || chip.descriptor().rom_extended_commands
}

/// MD5 digest of a flash region as computed by the device.
pub(crate) async fn flash_md5<P: SerialInterface>(
    connection: &mut Connection<P>,
    session: &Session,
    offset: u32,
    size: u32,
) -> Result<u128, Error> {
    let chip = session.require_chip()?;
    if !supports_md5(chip, session) {
        return Err(Error::UnsupportedFeature {
            chip,
            feature: "flash MD5",
        });
    }

    let value = connection
        .checked_command(
            Command::FlashMd5 { offset, size },
            CommandType::FlashMd5.timeout_for_size(size),
            session,
        )
        .await?;

    parse_md5(value)
}

/// The stub answers with 16 raw bytes, the ROM with 32 hex characters.
fn parse_md5(value: CommandResponseValue) -> Result<u128, Error> {
    let data: Vec<u8> = value.try_into()?;

    match data.len() {
        16 => {
            let mut digest = [0u8; 16];
            digest.copy_from_slice(&data);
            Ok(u128::from_be_bytes(digest))
        }
        32 => std::str::from_utf8(&data)
            .ok()
            .and_then(|hex| u128::from_str_radix(hex, 16).ok())
            .ok_or_else(|| {
                Error::InvalidResponse(format!(
                    "MD5 digest is not hex: {}",
                    String::from_utf8_lossy(&data)
                ))
            }),
        len => Err(Error::InvalidResponse(format!(
            "MD5 digest of {len} bytes"
        ))),
    }
}

/// Pad with erased flash bytes up to a multiple of four.
fn pad_to_word(mut data: Cow<'_, [u8]>) -> Cow<'_, [u8]> {
    if data.len() % 4 != 0 {
        let padded_len = data.len().next_multiple_of(4);
        data.to_mut().resize(padded_len, 0xff);
    }
    data
}
