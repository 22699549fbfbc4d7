//! Loading segments into the device RAM.

use log::{debug, warn};

use super::ProgressCallbacks;
use crate::{
    Error,
    command::{Command, CommandType},
    connection::{Connection, SerialInterface},
    image_format::Segment,
    session::Session,
    target::MAX_RAM_BLOCK_SIZE,
};

/// Applications running in the target device's RAM.
#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq)]
pub struct RamTarget {
    entry: Option<u32>,
    block_size: usize,
}

impl RamTarget {
    /// Create a new RAM target.
    pub fn new(entry: Option<u32>, block_size: usize) -> Self {
        RamTarget { entry, block_size }
    }
}

impl Default for RamTarget {
    fn default() -> Self {
        Self::new(None, MAX_RAM_BLOCK_SIZE)
    }
}

impl RamTarget {
    /// Begin the flashing operation.
    pub async fn begin<P: SerialInterface>(
        &mut self,
        _connection: &mut Connection<P>,
        _session: &Session,
    ) -> Result<(), Error> {
        Ok(())
    }

    /// Write a segment to the target device.
    ///
    /// Blocks are padded to a multiple of four bytes and numbered from zero.
    pub async fn write_segment<P: SerialInterface>(
        &mut self,
        connection: &mut Connection<P>,
        session: &Session,
        segment: Segment<'_>,
        progress: &mut dyn ProgressCallbacks,
    ) -> Result<(), Error> {
        let addr = segment.addr;
        let padded_len = segment.data.len().next_multiple_of(4);
        let block_count = padded_len.div_ceil(self.block_size);

        debug!("Loading {padded_len} bytes into RAM at {addr:#010x}");

        connection
            .checked_command(
                Command::MemBegin {
                    size: padded_len as u32,
                    blocks: block_count as u32,
                    block_size: self.block_size as u32,
                    offset: addr,
                    supports_encryption: false,
                },
                CommandType::MemBegin.timeout(),
                session,
            )
            .await?;

        progress.init(addr, segment.data.len());

        let mut written = 0;
        for (i, block) in segment.data.chunks(self.block_size).enumerate() {
            connection
                .checked_command(
                    Command::MemData {
                        sequence: i as u32,
                        pad_to: block.len().next_multiple_of(4),
                        pad_byte: 0,
                        data: block,
                    },
                    CommandType::MemData.timeout(),
                    session,
                )
                .await?;

            written += block.len();
            progress.update(written);
        }

        progress.finish(false);

        Ok(())
    }

    /// Complete the flashing operation, jumping to the entry point when
    /// `reboot` is set.
    pub async fn finish<P: SerialInterface>(
        &mut self,
        connection: &mut Connection<P>,
        session: &Session,
        reboot: bool,
    ) -> Result<(), Error> {
        if !reboot {
            return Ok(());
        }

        let entry = self.entry.unwrap_or_default();
        let result = connection
            .checked_command(
                Command::MemEnd {
                    no_entry: entry == 0,
                    entry,
                },
                CommandType::MemEnd.timeout(),
                session,
            )
            .await;

        match result {
            Ok(_) => Ok(()),
            // The ROM may jump to the entry point before its reply is out
            Err(e) if !session.is_stub() => {
                warn!("Ignoring MemEnd failure while starting RAM code: {e}");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}
