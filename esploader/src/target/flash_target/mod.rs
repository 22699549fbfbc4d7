//! Flash target module.
//!
//! A [FlashTarget] is where segments end up: the SPI flash, through
//! [SpiFlashTarget], or the device RAM, through [RamTarget]. Progress of a
//! write is reported through [ProgressCallbacks].

mod ram;
mod spi_flash;

pub(crate) use self::spi_flash::{attach_flash, flash_md5};
pub use self::{ram::RamTarget, spi_flash::SpiFlashTarget};
use crate::{
    Error,
    connection::{Connection, SerialInterface},
    image_format::Segment,
    session::Session,
};

/// Flash target enum - either SPI flash or RAM.
#[derive(Debug)]
pub enum FlashTarget {
    /// Applications running from the SPI flash
    SpiFlash(SpiFlashTarget),
    /// Applications running in the target device's RAM
    Ram(RamTarget),
}

impl FlashTarget {
    /// Begin the flashing operation.
    pub async fn begin<P: SerialInterface>(
        &mut self,
        connection: &mut Connection<P>,
        session: &Session,
    ) -> Result<(), Error> {
        match self {
            FlashTarget::SpiFlash(target) => target.begin(connection, session).await,
            FlashTarget::Ram(target) => target.begin(connection, session).await,
        }
    }

    /// Write a segment to the target device.
    pub async fn write_segment<P: SerialInterface>(
        &mut self,
        connection: &mut Connection<P>,
        session: &Session,
        segment: Segment<'_>,
        progress: &mut dyn ProgressCallbacks,
    ) -> Result<(), Error> {
        match self {
            FlashTarget::SpiFlash(target) => {
                target
                    .write_segment(connection, session, segment, progress)
                    .await
            }
            FlashTarget::Ram(target) => {
                target
                    .write_segment(connection, session, segment, progress)
                    .await
            }
        }
    }

    /// Complete the flashing operation.
    pub async fn finish<P: SerialInterface>(
        &mut self,
        connection: &mut Connection<P>,
        session: &Session,
        reboot: bool,
    ) -> Result<(), Error> {
        match self {
            FlashTarget::SpiFlash(target) => target.finish(connection, session, reboot).await,
            FlashTarget::Ram(target) => target.finish(connection, session, reboot).await,
        }
    }
}

/// Progress update callbacks.
///
/// Amounts are in uncompressed bytes of the segment being written.
pub trait ProgressCallbacks {
    /// Initialize some progress report.
    fn init(&mut self, addr: u32, total: usize);
    /// Update some progress report.
    fn update(&mut self, current: usize);
    /// Indicate post-flash checksum verification has begun.
    fn verifying(&mut self);
    /// Finish some progress report.
    fn finish(&mut self, skipped: bool);
}

/// An empty implementation of [ProgressCallbacks] that does nothing.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct DefaultProgressCallback;

impl ProgressCallbacks for DefaultProgressCallback {
    fn init(&mut self, _addr: u32, _total: usize) {}
    fn update(&mut self, _current: usize) {}
    fn verifying(&mut self) {}
    fn finish(&mut self, _skipped: bool) {}
}
