//! Write a binary application to a target device
//!
//! The [Flasher] struct abstracts over various operations for writing a binary
//! application to a target device. It additionally provides some operations to
//! read information from the target device.

use std::str::FromStr;

use log::{debug, info, warn};
use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, IntoEnumIterator, VariantNames};

use self::{
    spi::{FLASH_RDID, run_spiflash_command},
    stubs::{EXPECTED_STUB_HANDSHAKE, FlashStub, MAX_HANDSHAKE_FRAMES},
};
use crate::{
    Error,
    command::{Command, CommandType, DEFAULT_TIMEOUT},
    config::FlasherConfig,
    connection::{Connection, ResetBeforeOperation, SerialInterface},
    error::ConnectionError,
    image_format::{Segment, update_flash_params},
    session::Session,
    target::{Chip, DefaultProgressCallback, ProgressCallbacks, XtalFrequency, flash_target},
};

pub mod spi;
pub mod stubs;

/// List of SPI parameters to try while detecting flash size
pub(crate) const TRY_SPI_PARAMS: [SpiAttachParams; 2] =
    [SpiAttachParams::default(), SpiAttachParams::esp32_pico_d4()];

pub(crate) const FLASH_SECTOR_SIZE: usize = 0x1000;

const READ_FLASH_BLOCK_SIZE: u32 = 0x1000;
const READ_FLASH_MAX_IN_FLIGHT: u32 = 64;
const BAUD_CHANGE_DELAY_MS: u32 = 50;

/// Supported flash frequencies
///
/// Note that not all frequencies are supported by each target device.
#[cfg_attr(feature = "cli", derive(clap::ValueEnum))]
#[derive(
    Debug,
    Default,
    Clone,
    Copy,
    Hash,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Display,
    VariantNames,
    Serialize,
    Deserialize,
)]
#[non_exhaustive]
#[repr(u8)]
pub enum FlashFrequency {
    /// 12 MHz
    #[serde(rename = "12MHz")]
    #[strum(serialize = "12MHz")]
    _12Mhz,
    /// 15 MHz
    #[serde(rename = "15MHz")]
    #[strum(serialize = "15MHz")]
    _15Mhz,
    /// 16 MHz
    #[serde(rename = "16MHz")]
    #[strum(serialize = "16MHz")]
    _16Mhz,
    /// 20 MHz
    #[serde(rename = "20MHz")]
    #[strum(serialize = "20MHz")]
    _20Mhz,
    /// 24 MHz
    #[serde(rename = "24MHz")]
    #[strum(serialize = "24MHz")]
    _24Mhz,
    /// 26 MHz
    #[serde(rename = "26MHz")]
    #[strum(serialize = "26MHz")]
    _26Mhz,
    /// 30 MHz
    #[serde(rename = "30MHz")]
    #[strum(serialize = "30MHz")]
    _30Mhz,
    /// 40 MHz
    #[serde(rename = "40MHz")]
    #[strum(serialize = "40MHz")]
    #[default]
    _40Mhz,
    /// 48 MHz
    #[serde(rename = "48MHz")]
    #[strum(serialize = "48MHz")]
    _48Mhz,
    /// 60 MHz
    #[serde(rename = "60MHz")]
    #[strum(serialize = "60MHz")]
    _60Mhz,
    /// 80 MHz
    #[serde(rename = "80MHz")]
    #[strum(serialize = "80MHz")]
    _80Mhz,
}

/// Supported flash modes
#[cfg_attr(feature = "cli", derive(clap::ValueEnum))]
#[derive(
    Debug,
    Default,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Display,
    VariantNames,
    Serialize,
    Deserialize,
)]
#[non_exhaustive]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum FlashMode {
    /// Quad I/O (4 pins used for address & data)
    Qio,
    /// Quad Output (4 pins used for data)
    Qout,
    /// Dual I/O (2 pins used for address & data)
    #[default]
    Dio,
    /// Dual Output (2 pins used for data)
    Dout,
}

impl FlashMode {
    /// Encodes the flash mode into the image header format.
    pub const fn encode(self) -> u8 {
        match self {
            FlashMode::Qio => 0,
            FlashMode::Qout => 1,
            FlashMode::Dio => 2,
            FlashMode::Dout => 3,
        }
    }
}

/// Supported flash sizes
///
/// Note that not all sizes are supported by each target device.
#[cfg_attr(feature = "cli", derive(clap::ValueEnum))]
#[derive(
    Debug,
    Default,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Display,
    VariantNames,
    EnumIter,
    Deserialize,
    Serialize,
)]
#[non_exhaustive]
#[repr(u8)]
#[doc(alias("esp_image_flash_size_t"))]
pub enum FlashSize {
    /// 256 KB
    #[serde(rename = "256KB")]
    #[strum(serialize = "256KB")]
    _256Kb,
    /// 512 KB
    #[serde(rename = "512KB")]
    #[strum(serialize = "512KB")]
    _512Kb,
    /// 1 MB
    #[serde(rename = "1MB")]
    #[strum(serialize = "1MB")]
    _1Mb,
    /// 2 MB
    #[serde(rename = "2MB")]
    #[strum(serialize = "2MB")]
    _2Mb,
    /// 4 MB
    #[default]
    #[serde(rename = "4MB")]
    #[strum(serialize = "4MB")]
    _4Mb,
    /// 8 MB
    #[serde(rename = "8MB")]
    #[strum(serialize = "8MB")]
    _8Mb,
    /// 16 MB
    #[serde(rename = "16MB")]
    #[strum(serialize = "16MB")]
    _16Mb,
    /// 32 MB
    #[serde(rename = "32MB")]
    #[strum(serialize = "32MB")]
    _32Mb,
    /// 64 MB
    #[serde(rename = "64MB")]
    #[strum(serialize = "64MB")]
    _64Mb,
    /// 128 MB
    #[serde(rename = "128MB")]
    #[strum(serialize = "128MB")]
    _128Mb,
    /// 256 MB
    #[serde(rename = "256MB")]
    #[strum(serialize = "256MB")]
    _256Mb,
}

impl FlashSize {
    /// Create a [FlashSize] from the capacity byte of a JEDEC id.
    pub const fn from_detected(value: u8) -> Result<FlashSize, Error> {
        match value {
            0x12 | 0x32 => Ok(FlashSize::_256Kb),
            0x13 | 0x33 => Ok(FlashSize::_512Kb),
            0x14 | 0x34 => Ok(FlashSize::_1Mb),
            0x15 | 0x35 => Ok(FlashSize::_2Mb),
            0x16 | 0x36 => Ok(FlashSize::_4Mb),
            0x17 | 0x37 => Ok(FlashSize::_8Mb),
            0x18 | 0x38 => Ok(FlashSize::_16Mb),
            0x19 | 0x39 => Ok(FlashSize::_32Mb),
            0x20 | 0x1A | 0x3A => Ok(FlashSize::_64Mb),
            0x21 | 0x1B => Ok(FlashSize::_128Mb),
            0x22 | 0x1C => Ok(FlashSize::_256Mb),
            _ => Err(Error::UnsupportedFlash(value)),
        }
    }

    /// Returns the flash size in bytes
    pub const fn size(self) -> u32 {
        match self {
            FlashSize::_256Kb => 0x0040000,
            FlashSize::_512Kb => 0x0080000,
            FlashSize::_1Mb => 0x0100000,
            FlashSize::_2Mb => 0x0200000,
            FlashSize::_4Mb => 0x0400000,
            FlashSize::_8Mb => 0x0800000,
            FlashSize::_16Mb => 0x1000000,
            FlashSize::_32Mb => 0x2000000,
            FlashSize::_64Mb => 0x4000000,
            FlashSize::_128Mb => 0x8000000,
            FlashSize::_256Mb => 0x10000000,
        }
    }
}

impl FromStr for FlashSize {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        FlashSize::VARIANTS
            .iter()
            .copied()
            .zip(FlashSize::iter())
            .find(|(name, _)| *name == s.to_uppercase())
            .map(|(_, variant)| variant)
            .ok_or_else(|| Error::InvalidFlashSize(s.to_string()))
    }
}

/// Flash settings written into the bootloader image header.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[non_exhaustive]
pub struct FlashSettings {
    /// Flash mode.
    pub mode: Option<FlashMode>,
    /// Flash size.
    pub size: Option<FlashSize>,
    /// Flash frequency.
    #[serde(rename = "frequency")]
    pub freq: Option<FlashFrequency>,
}

impl FlashSettings {
    /// Creates a new [FlashSettings] with the specified mode, size, and
    /// frequency.
    pub fn new(
        mode: Option<FlashMode>,
        size: Option<FlashSize>,
        freq: Option<FlashFrequency>,
    ) -> Self {
        FlashSettings { mode, size, freq }
    }
}

/// Parameters of the attached SPI flash chip (sizes, etc).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[repr(C)]
pub struct SpiSetParams {
    /// Flash chip ID
    fl_id: u32,
    /// Total size in bytes
    total_size: u32,
    /// Block size
    block_size: u32,
    /// Sector size
    sector_size: u32,
    /// Page size
    page_size: u32,
    /// Status mask
    status_mask: u32,
}

impl SpiSetParams {
    /// Create a new [SpiSetParams] with the specified size.
    pub const fn default(size: u32) -> Self {
        SpiSetParams {
            fl_id: 0,
            total_size: size,
            block_size: 64 * 1024,
            sector_size: FLASH_SECTOR_SIZE as u32,
            page_size: 256,
            status_mask: 0xFFFF,
        }
    }

    /// Encode the parameters into a byte array
    pub fn encode(&self) -> Vec<u8> {
        [
            self.fl_id,
            self.total_size,
            self.block_size,
            self.sector_size,
            self.page_size,
            self.status_mask,
        ]
        .iter()
        .flat_map(|word| word.to_le_bytes())
        .collect()
    }
}

/// Parameters for attaching to a target devices SPI flash
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[repr(C)]
pub struct SpiAttachParams {
    clk: u8,
    q: u8,
    d: u8,
    hd: u8,
    cs: u8,
}

impl SpiAttachParams {
    /// Create a new [SpiAttachParams] with default values.
    pub const fn default() -> Self {
        SpiAttachParams {
            clk: 0,
            q: 0,
            d: 0,
            hd: 0,
            cs: 0,
        }
    }

    /// Default SPI parameters for ESP32-PICO-D4.
    pub const fn esp32_pico_d4() -> Self {
        SpiAttachParams {
            clk: 6,
            q: 17,
            d: 8,
            hd: 11,
            cs: 16,
        }
    }

    /// Encode the parameters into a byte array
    ///
    /// The ROM takes an extra zero word that the stub does not expect.
    pub fn encode(self, stub: bool) -> Vec<u8> {
        let packed = ((self.hd as u32) << 24)
            | ((self.cs as u32) << 18)
            | ((self.d as u32) << 12)
            | ((self.q as u32) << 6)
            | (self.clk as u32);

        let mut encoded = packed.to_le_bytes().to_vec();

        if !stub {
            encoded.extend_from_slice(&[0u8; 4]);
        }

        encoded
    }
}

/// Information about the connected device
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct DeviceInfo {
    /// The chip being used
    pub chip: Chip,
    /// The crystal frequency of the chip
    pub crystal_frequency: XtalFrequency,
    /// The total available flash size
    pub flash_size: FlashSize,
    /// Whether the flash stub is running
    pub stub: bool,
    /// Baud rate of the link
    pub baud: u32,
}

/// Connect to and flash a target device
#[derive(Debug)]
pub struct Flasher<P: SerialInterface> {
    /// Connection for flash operations
    connection: Connection<P>,
    /// What is known about the device
    session: Session,
    /// Flash size, loaded from SPI flash
    flash_size: FlashSize,
    /// Configuration for SPI attached flash
    spi_params: SpiAttachParams,
    /// Flashing behaviour
    config: FlasherConfig,
}

impl<P: SerialInterface> Flasher<P> {
    /// Brings up the device and prepares it for flashing.
    ///
    /// The device is reset and synchronised, its chip checked against the
    /// configured one, the stub uploaded when enabled, the flash attached and
    /// sized, and finally the baud rate raised when configured. On failure
    /// the connection is handed back together with the error.
    pub async fn connect(
        mut connection: Connection<P>,
        config: FlasherConfig,
        stub: Option<&FlashStub>,
    ) -> Result<Self, (Connection<P>, Error)> {
        let mut session = match connection.connect().await {
            Ok(session) => session,
            Err(e) => return Err((connection, e)),
        };

        let resolved = match config.chip {
            Some(chip) => session.resolve_chip(chip),
            None => session.require_chip().map(|_| ()),
        };
        if let Err(e) = resolved {
            return Err((connection, e));
        }

        let no_sync = connection.config().before == ResetBeforeOperation::NoResetNoSync;

        let mut flasher = Flasher {
            connection,
            session,
            flash_size: FlashSize::default(),
            spi_params: SpiAttachParams::default(),
            config,
        };

        if no_sync {
            return Ok(flasher);
        }

        if let Err(e) = flasher.prepare(stub).await {
            return Err((flasher.into_connection(), e));
        }

        Ok(flasher)
    }

    async fn prepare(&mut self, stub: Option<&FlashStub>) -> Result<(), Error> {
        if self.config.use_stub {
            let stub = stub.ok_or_else(|| {
                Error::InvalidStub("the stub is enabled but none was supplied".into())
            })?;
            info!("Using flash stub");
            self.load_stub(stub).await?;
        }

        self.spi_autodetect().await?;

        if let Some(baud) = self.config.baud {
            if baud != self.session.baud() {
                if baud > 115_200 {
                    warn!("Setting baud rate higher than 115,200 can cause issues");
                }
                self.change_baud(baud).await?;
            }
        }

        Ok(())
    }

    /// Uploads the flash stub to RAM and waits for it to announce itself.
    ///
    /// Nothing is sent when the stub is already running.
    pub async fn load_stub(&mut self, stub: &FlashStub) -> Result<(), Error> {
        if self.session.is_stub() {
            return Ok(());
        }

        let chip = self.session.require_chip()?;
        debug!("Loading flash stub for chip: {chip}");

        let (text_addr, text) = stub.text()?;
        let (data_addr, data) = stub.data()?;

        let mut ram_target = chip.ram_target(Some(stub.entry()));
        ram_target.begin(&mut self.connection, &self.session).await?;

        debug!("Write {} byte stub text", text.len());
        ram_target
            .write_segment(
                &mut self.connection,
                &self.session,
                Segment::new(text_addr, &text),
                &mut DefaultProgressCallback,
            )
            .await?;

        debug!("Write {} byte stub data", data.len());
        ram_target
            .write_segment(
                &mut self.connection,
                &self.session,
                Segment::new(data_addr, &data),
                &mut DefaultProgressCallback,
            )
            .await?;

        debug!("Finish stub write");
        ram_target
            .finish(&mut self.connection, &self.session, true)
            .await?;

        for _ in 0..MAX_HANDSHAKE_FRAMES {
            match self.connection.read_frame(DEFAULT_TIMEOUT).await {
                Ok(frame) if frame == EXPECTED_STUB_HANDSHAKE => {
                    info!("Stub running");
                    self.session.enter_stub_mode();
                    return Ok(());
                }
                Ok(frame) => debug!("Ignoring {} byte frame while waiting for the stub", frame.len()),
                Err(Error::InvalidSlip(e)) => debug!("Ignoring {e} while waiting for the stub"),
                Err(Error::Timeout(_)) => break,
                Err(e) => return Err(e),
            }
        }

        Err(ConnectionError::InvalidStubHandshake.into())
    }

    /// Attaches the SPI flash and detects its size, trying the known pin
    /// assignments in turn.
    pub async fn spi_autodetect(&mut self) -> Result<(), Error> {
        let chip = self.session.require_chip()?;

        for spi_params in TRY_SPI_PARAMS.iter().copied() {
            debug!("Attempting flash enable with: {spi_params:?}");

            // The attach may fail while the flash still answers
            if let Err(e) = self.enable_flash(spi_params).await {
                debug!("Flash enable failed: {e}");
            }

            if let Some(flash_size) = self.flash_detect().await? {
                debug!("Flash detect OK!");

                self.flash_size = flash_size;
                self.spi_params = spi_params;

                if self.session.is_stub() || chip.descriptor().rom_extended_commands {
                    self.connection
                        .checked_command(
                            Command::SpiSetParams {
                                spi_params: SpiSetParams::default(flash_size.size()),
                            },
                            CommandType::SpiSetParams.timeout(),
                            &self.session,
                        )
                        .await?;
                }

                return Ok(());
            }

            debug!("Flash detect failed");
        }

        debug!("SPI flash autodetection failed");

        Err(Error::FlashConnect)
    }

    /// Read the JEDEC id of the attached flash.
    pub async fn flash_id(&mut self) -> Result<u32, Error> {
        run_spiflash_command(&mut self.connection, &self.session, FLASH_RDID, &[], 24).await
    }

    /// Detect the flash size of the connected device.
    ///
    /// `None` means no flash answered with these pins.
    pub async fn flash_detect(&mut self) -> Result<Option<FlashSize>, Error> {
        const FLASH_RETRY: u8 = 0xFF;

        let flash_id = self.flash_id().await?;
        let size_id = (flash_id >> 16) as u8;

        if size_id == FLASH_RETRY {
            return Ok(None);
        }

        let flash_size = match FlashSize::from_detected(size_id) {
            Ok(size) => size,
            Err(_) => {
                warn!(
                    "Could not detect flash size (FlashID=0x{flash_id:02X}, SizeID=0x{size_id:02X}), defaulting to 4MB"
                );
                FlashSize::default()
            }
        };

        Ok(Some(flash_size))
    }

    /// Attach the SPI flash with the given pins.
    pub async fn enable_flash(&mut self, spi_params: SpiAttachParams) -> Result<(), Error> {
        flash_target::attach_flash(&mut self.connection, &self.session, spi_params).await
    }

    /// The crystal frequency of the device.
    pub async fn xtal_frequency(&mut self) -> Result<XtalFrequency, Error> {
        let chip = self.session.require_chip()?;

        match chip.descriptor().uart_clock {
            Some(divider) => {
                let clkdiv = self
                    .connection
                    .read_reg(&self.session, divider.register)
                    .await?;
                Ok(divider.estimate(self.session.baud(), clkdiv))
            }
            None => Ok(chip.default_xtal_frequency()),
        }
    }

    /// Read and print any information we can about the connected device
    pub async fn device_info(&mut self) -> Result<DeviceInfo, Error> {
        let chip = self.session.require_chip()?;
        let crystal_frequency = self.xtal_frequency().await?;

        Ok(DeviceInfo {
            chip,
            crystal_frequency,
            flash_size: self.flash_size,
            stub: self.session.is_stub(),
            baud: self.session.baud(),
        })
    }

    /// Load segments into RAM and jump to `entry`.
    ///
    /// Note that this will not touch the flash on the device
    pub async fn load_segments_to_ram(
        &mut self,
        segments: &[Segment<'_>],
        entry: u32,
        progress: &mut dyn ProgressCallbacks,
    ) -> Result<(), Error> {
        let mut target = self.session.require_chip()?.ram_target(Some(entry));
        target.begin(&mut self.connection, &self.session).await?;

        for segment in segments {
            target
                .write_segment(
                    &mut self.connection,
                    &self.session,
                    segment.borrow(),
                    progress,
                )
                .await?;
        }

        target
            .finish(&mut self.connection, &self.session, true)
            .await
    }

    /// Load a bin image to flash at a specific address
    pub async fn write_bin_to_flash(
        &mut self,
        addr: u32,
        data: &[u8],
        progress: &mut dyn ProgressCallbacks,
    ) -> Result<(), Error> {
        self.write_bins_to_flash(&[Segment::new(addr, data)], progress)
            .await?;

        info!("Binary successfully written to flash!");

        Ok(())
    }

    /// Load multiple bin images to flash at specific addresses
    ///
    /// A bootloader image gets the configured flash settings patched into
    /// its header. The configured after-reset runs once all segments are
    /// written.
    pub async fn write_bins_to_flash(
        &mut self,
        segments: &[Segment<'_>],
        progress: &mut dyn ProgressCallbacks,
    ) -> Result<(), Error> {
        let chip = self.session.require_chip()?;

        let mut target = chip.flash_target(
            self.spi_params,
            self.config.verify,
            self.config.skip,
            self.config.compress,
        );
        target.begin(&mut self.connection, &self.session).await?;

        for segment in segments {
            let segment = update_flash_params(
                chip.descriptor(),
                segment.borrow(),
                &self.config.flash_settings,
            )?;

            target
                .write_segment(&mut self.connection, &self.session, segment, progress)
                .await?;
        }

        target
            .finish(&mut self.connection, &self.session, true)
            .await
    }

    /// Get MD5 of region
    pub async fn checksum_md5(&mut self, addr: u32, length: u32) -> Result<u128, Error> {
        flash_target::flash_md5(&mut self.connection, &self.session, addr, length).await
    }

    /// Change the baud rate of the connection.
    pub async fn change_baud(&mut self, baud: u32) -> Result<(), Error> {
        let chip = self.session.require_chip()?;
        if !self.session.is_stub() && !chip.descriptor().rom_extended_commands {
            return Err(Error::UnsupportedFeature {
                chip,
                feature: "baud rate change from the ROM loader",
            });
        }

        info!("Changing baud rate to {baud}");

        let prior_baud = if self.session.is_stub() {
            self.session.baud()
        } else {
            0
        };

        // The C2 ROM assumes a 40 MHz crystal when dividing the baud rate
        let mut new_baud = baud;
        if chip == Chip::Esp32c2
            && !self.session.is_stub()
            && self.xtal_frequency().await? == XtalFrequency::_26Mhz
        {
            new_baud = new_baud * 40 / 26;
        }

        self.connection
            .checked_command(
                Command::ChangeBaudrate {
                    new_baud,
                    prior_baud,
                },
                CommandType::ChangeBaudrate.timeout(),
                &self.session,
            )
            .await?;

        self.connection.reconnect(baud).await?;
        self.session.set_baud(baud);

        self.connection.delay_ms(BAUD_CHANGE_DELAY_MS).await;
        if let Err(e) = self.connection.flush_input().await {
            debug!("Ignoring {e} while draining after the baud change");
        }

        Ok(())
    }

    /// Erase a region of flash.
    ///
    /// Offset and size must be multiples of the flash sector size.
    pub async fn erase_region(&mut self, offset: u32, size: u32) -> Result<(), Error> {
        if !self.session.is_stub() {
            return Err(Error::StubRequired("erase region"));
        }
        if offset % FLASH_SECTOR_SIZE as u32 != 0 || size % FLASH_SECTOR_SIZE as u32 != 0 {
            return Err(Error::InvalidEraseRegion { offset, size });
        }

        debug!("Erasing region of 0x{size:x}B at 0x{offset:08x}");

        self.connection
            .checked_command(
                Command::EraseRegion { offset, size },
                CommandType::EraseRegion.timeout_for_size(size),
                &self.session,
            )
            .await?;

        Ok(())
    }

    /// Erase entire flash.
    pub async fn erase_flash(&mut self) -> Result<(), Error> {
        if !self.session.is_stub() {
            return Err(Error::StubRequired("erase flash"));
        }

        debug!("Erasing the entire flash");

        self.connection
            .checked_command(
                Command::EraseFlash,
                CommandType::EraseFlash.timeout(),
                &self.session,
            )
            .await?;

        Ok(())
    }

    /// Read `size` bytes of flash starting at `offset`.
    ///
    /// The stub streams the data and finishes with its MD5 digest, which is
    /// checked against the received bytes.
    pub async fn read_flash(
        &mut self,
        offset: u32,
        size: u32,
        progress: &mut dyn ProgressCallbacks,
    ) -> Result<Vec<u8>, Error> {
        if !self.session.is_stub() {
            return Err(Error::StubRequired("read flash"));
        }

        debug!("Reading 0x{size:x}B from 0x{offset:08x}");

        self.connection
            .checked_command(
                Command::ReadFlash {
                    offset,
                    size,
                    block_size: READ_FLASH_BLOCK_SIZE,
                    max_in_flight: READ_FLASH_MAX_IN_FLIGHT,
                },
                CommandType::ReadFlash.timeout(),
                &self.session,
            )
            .await?;

        progress.init(offset, size as usize);

        let size = size as usize;
        let mut data = Vec::with_capacity(size);
        while data.len() < size {
            let frame = self
                .connection
                .read_frame(DEFAULT_TIMEOUT)
                .await
                .map_err(|e| match e {
                    Error::Timeout(_) => Error::Timeout(CommandType::ReadFlash),
                    e => e,
                })?;

            if frame.len() != READ_FLASH_BLOCK_SIZE as usize && data.len() + frame.len() < size {
                return Err(Error::InvalidResponse(format!(
                    "short flash read block of {} bytes",
                    frame.len()
                )));
            }

            data.extend_from_slice(&frame);
            if data.len() > size {
                return Err(Error::InvalidResponse(format!(
                    "flash read returned {} bytes, {size} were requested",
                    data.len()
                )));
            }

            self.connection
                .write_frame(&(data.len() as u32).to_le_bytes())
                .await?;
            progress.update(data.len());
        }

        let digest = self.connection.read_frame(DEFAULT_TIMEOUT).await?;
        let expected: [u8; 16] = digest.as_slice().try_into().map_err(|_| {
            Error::InvalidResponse(format!("MD5 digest of {} bytes", digest.len()))
        })?;

        let expected = u128::from_be_bytes(expected);
        let actual = u128::from_be_bytes(Md5::digest(&data).into());
        if expected != actual {
            return Err(Error::VerifyFailed {
                address: offset,
                expected,
                actual,
            });
        }

        progress.finish(false);

        Ok(data)
    }

    /// Resets the device according to the configured after-reset.
    pub async fn reset_after(&mut self) -> Result<(), Error> {
        self.connection.reset_after(&self.session).await
    }

    /// The active serial connection being used by the flasher
    pub fn connection(&mut self) -> &mut Connection<P> {
        &mut self.connection
    }

    /// The session state of the device.
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// The chip type that the flasher is connected to
    pub fn chip(&self) -> Option<Chip> {
        self.session.chip()
    }

    /// The detected, or overridden, flash size.
    pub fn flash_size(&self) -> FlashSize {
        self.flash_size
    }

    /// Set the flash size.
    pub fn set_flash_size(&mut self, flash_size: FlashSize) {
        self.flash_size = flash_size;
    }

    /// The SPI pins the flash was attached with.
    pub fn spi_params(&self) -> SpiAttachParams {
        self.spi_params
    }

    /// Consume self and return the underlying connection.
    pub fn into_connection(self) -> Connection<P> {
        self.connection
    }
}

impl<P: SerialInterface> From<Flasher<P>> for Connection<P> {
    fn from(flasher: Flasher<P>) -> Self {
        flasher.into_connection()
    }
}
