//! Establish a connection with a target device.
//!
//! The [Connection] struct abstracts over the serial connection and
//! sending/decoding of commands, and provides higher-level operations with the
//! device.

use std::{
    fmt,
    sync::LazyLock,
    time::{Duration, Instant},
};

use log::{debug, info};
use regex::Regex;

use self::reset::{construct_reset_strategy_sequence, hard_reset, soft_reset};
use crate::{
    command::{Command, CommandResponse, CommandResponseValue, CommandType},
    config::ConnectionConfig,
    error::{ConnectionError, Error, ResultExt, RomError, RomErrorKind},
    flasher::stubs::CHIP_DETECT_MAGIC_REG_ADDR,
    session::Session,
    target::Chip,
};

#[cfg(feature = "serialport")]
mod port;
pub mod reset;
pub mod slip;

#[cfg(feature = "serialport")]
pub use self::port::NativePort;
pub use self::reset::{ResetAfterOperation, ResetBeforeOperation, ResetStep, ResetStrategy};

const MAX_SYNC_ATTEMPTS: usize = 7;
/// Extra replies the ROM sends after answering a sync request.
const MAX_EXTRA_SYNC_REPLIES: usize = 7;
const MAX_RESPONSE_FRAMES: usize = 100;
const FLUSH_READ_TIMEOUT: Duration = Duration::from_millis(10);
const MAX_FLUSH_READS: usize = 16;
const BOOT_LOG_TIMEOUT: Duration = Duration::from_millis(50);
const MAX_BOOT_LOG_LEN: usize = 4096;
pub(crate) const USB_SERIAL_JTAG_PID: u16 = 0x1001;

static BOOT_LOG: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"boot:(0x[0-9a-fA-F]+)([\s\S]*waiting for download)?")
        .expect("boot log pattern is valid")
});

/// Buffer type for clear operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClearBufferType {
    /// Clear the input buffer.
    Input,
    /// Clear the output buffer.
    Output,
    /// Clear both buffers.
    All,
}

/// Serial port error kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SerialPortErrorKind {
    /// No device found
    NoDevice,
    /// Invalid input
    InvalidInput,
    /// Unknown error
    Unknown,
    /// I/O error
    Io,
    /// Timeout
    Timeout,
}

/// Serial port error type.
#[derive(Debug)]
pub struct SerialPortError {
    /// Error kind
    pub kind: SerialPortErrorKind,
    /// Error description
    pub description: String,
}

impl SerialPortError {
    /// Create a new serial port error.
    pub fn new(kind: SerialPortErrorKind, description: impl Into<String>) -> Self {
        Self {
            kind,
            description: description.into(),
        }
    }

    /// Create an I/O error.
    pub fn io(description: impl Into<String>) -> Self {
        Self::new(SerialPortErrorKind::Io, description)
    }

    /// Create a timeout error.
    pub fn timeout(description: impl Into<String>) -> Self {
        Self::new(SerialPortErrorKind::Timeout, description)
    }
}

impl fmt::Display for SerialPortError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.description)
    }
}

impl std::error::Error for SerialPortError {}

/// USB port information.
#[derive(Debug, Clone, Default)]
pub struct PortInfo {
    /// USB Vendor ID
    pub vid: u16,
    /// USB Product ID
    pub pid: u16,
    /// Serial number
    pub serial_number: Option<String>,
    /// Manufacturer
    pub manufacturer: Option<String>,
    /// Product name
    pub product: Option<String>,
}

#[cfg(feature = "serialport")]
impl From<serialport::UsbPortInfo> for PortInfo {
    fn from(info: serialport::UsbPortInfo) -> Self {
        PortInfo {
            vid: info.vid,
            pid: info.pid,
            serial_number: info.serial_number,
            manufacturer: info.manufacturer,
            product: info.product,
        }
    }
}

/// Async serial port interface.
///
/// Everything the protocol needs from a byte link with DTR/RTS control lines.
/// Futures are not required to be `Send`, so implementations backed by
/// single-threaded runtimes work as well.
#[allow(async_fn_in_trait)]
pub trait SerialInterface {
    /// Get the port name (e.g., "/dev/ttyUSB0" or "COM3").
    fn name(&self) -> Option<String>;

    /// Get the current baud rate.
    fn baud_rate(&self) -> u32;

    /// (Re)open the link at the given baud rate.
    async fn connect(&mut self, baud_rate: u32) -> Result<(), SerialPortError>;

    /// Close the link.
    async fn disconnect(&mut self) -> Result<(), SerialPortError>;

    /// Read at least `min_bytes` bytes, waiting no longer than `timeout`.
    ///
    /// Running out of time before `min_bytes` bytes arrive is reported as a
    /// [SerialPortErrorKind::Timeout] error.
    async fn read(
        &mut self,
        timeout: Duration,
        min_bytes: usize,
    ) -> Result<Vec<u8>, SerialPortError>;

    /// Write all data to the serial port.
    async fn write_all(&mut self, buf: &[u8]) -> Result<(), SerialPortError>;

    /// Flush the output buffer.
    async fn flush(&mut self) -> Result<(), SerialPortError>;

    /// Clear the specified buffer(s).
    async fn clear(&mut self, buffer_to_clear: ClearBufferType) -> Result<(), SerialPortError>;

    /// Set the DTR (Data Terminal Ready) signal.
    async fn write_data_terminal_ready(&mut self, level: bool) -> Result<(), SerialPortError>;

    /// Set the RTS (Request To Send) signal.
    async fn write_request_to_send(&mut self, level: bool) -> Result<(), SerialPortError>;

    /// Delay for the specified number of milliseconds.
    async fn delay_ms(&mut self, ms: u32);
}

/// Where a [Connection] is in its bring-up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Nothing has been sent yet.
    Disconnected,
    /// Driving the reset lines.
    Resetting,
    /// Exchanging sync packets.
    Syncing,
    /// Identifying the chip.
    Resolving,
    /// The device answers commands.
    Connected,
    /// Bring-up gave up.
    Failed,
}

/// An established connection with a target device.
pub struct Connection<P: SerialInterface> {
    serial: P,
    port_info: PortInfo,
    read_ahead: Vec<u8>,
    config: ConnectionConfig,
    state: ConnectionState,
}

impl<P: SerialInterface + fmt::Debug> fmt::Debug for Connection<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("serial", &self.serial)
            .field("port_info", &self.port_info)
            .field("config", &self.config)
            .field("state", &self.state)
            .finish()
    }
}

impl<P: SerialInterface> Connection<P> {
    /// Creates a new connection with a target device.
    pub fn new(serial: P, port_info: PortInfo, config: ConnectionConfig) -> Self {
        Connection {
            serial,
            port_info,
            read_ahead: Vec::new(),
            config,
            state: ConnectionState::Disconnected,
        }
    }

    /// Synchronises with a device that is already waiting in its loader.
    ///
    /// No reset is performed and the chip is not identified.
    pub async fn begin(&mut self) -> Result<Session, Error> {
        self.state = ConnectionState::Syncing;

        let mut result = Err(ConnectionError::ConnectionFailed.into());
        for _ in 0..MAX_SYNC_ATTEMPTS {
            self.flush_input().await?;

            result = self.sync().await;
            if result.is_ok() {
                break;
            }
        }

        match result {
            Ok(()) => {
                self.state = ConnectionState::Connected;
                Ok(Session::new(None, self.serial.baud_rate()))
            }
            Err(e) => {
                self.state = ConnectionState::Failed;
                Err(e)
            }
        }
    }

    /// Resets the device into its loader, synchronises and identifies the
    /// chip.
    pub async fn connect(&mut self) -> Result<Session, Error> {
        let baud = self.serial.baud_rate();

        if self.config.before == ResetBeforeOperation::NoResetNoSync {
            self.state = ConnectionState::Connected;
            return Ok(Session::new(None, baud));
        }

        let port_name = self.serial.name().unwrap_or_default();
        let reset_sequence = construct_reset_strategy_sequence(
            &port_name,
            self.port_info.pid,
            self.config.before,
            self.config.reset_sequence.as_deref(),
        )
        .inspect_err(|_| self.state = ConnectionState::Failed)?;

        let mut last_error = Error::from(ConnectionError::ConnectionFailed);
        let mut synced = false;
        'attempts: for attempt in 0..self.config.connect_attempts {
            for reset_strategy in &reset_sequence {
                match self.connect_attempt(reset_strategy).await {
                    Ok(()) => {
                        synced = true;
                        break 'attempts;
                    }
                    Err(e) => {
                        debug!("Failed to connect (attempt {}), error {e}, retrying", attempt + 1);
                        last_error = e;
                    }
                }
            }
        }

        if !synced {
            self.state = ConnectionState::Failed;
            return Err(last_error);
        }

        self.state = ConnectionState::Resolving;
        match self.detect_chip().await {
            Ok(chip) => {
                info!("Detected {chip}");
                self.state = ConnectionState::Connected;
                Ok(Session::new(Some(chip), baud))
            }
            Err(e) => {
                self.state = ConnectionState::Failed;
                Err(e)
            }
        }
    }

    /// One reset followed by a round of sync attempts.
    async fn connect_attempt(&mut self, reset_strategy: &ResetStrategy) -> Result<(), Error> {
        if self.config.before != ResetBeforeOperation::NoReset {
            self.state = ConnectionState::Resetting;
            reset_strategy.reset(&mut self.serial).await?;
        }

        self.state = ConnectionState::Syncing;

        let boot_log = self.read_boot_log().await;
        let boot_log = String::from_utf8_lossy(&boot_log);

        let boot_mode = BOOT_LOG.captures(&boot_log).map(|captures| {
            let mode = captures
                .get(1)
                .map(|m| m.as_str())
                .unwrap_or_default()
                .to_string();
            let download_mode = captures.get(2).is_some();

            debug!("Boot Mode: {mode}");
            debug!("Download Mode: {download_mode}");

            (mode, download_mode)
        });

        for _ in 0..MAX_SYNC_ATTEMPTS {
            self.flush_input().await?;

            if self.sync().await.is_ok() {
                return Ok(());
            }
        }

        let error = match boot_mode {
            Some((_, true)) => ConnectionError::NoSyncReply,
            Some((mode, false)) => ConnectionError::WrongBootMode(mode),
            None => ConnectionError::ConnectionFailed,
        };

        Err(error.into())
    }

    /// Collect whatever the device printed after being reset.
    async fn read_boot_log(&mut self) -> Vec<u8> {
        let mut log = std::mem::take(&mut self.read_ahead);

        while log.len() < MAX_BOOT_LOG_LEN {
            match self.serial.read(BOOT_LOG_TIMEOUT, 1).await {
                Ok(bytes) if !bytes.is_empty() => log.extend_from_slice(&bytes),
                _ => break,
            }
        }

        log
    }

    /// Syncs with a device.
    pub(crate) async fn sync(&mut self) -> Result<(), Error> {
        let response = self
            .command(Command::Sync, CommandType::Sync.timeout())
            .await?;

        if let &[status, error, ..] = &response.data[..] {
            if status != 0 {
                return Err(RomError::new(CommandType::Sync, RomErrorKind::from(error)).into());
            }
        }

        // The ROM answers a single sync request several times
        for _ in 0..MAX_EXTRA_SYNC_REPLIES {
            if self
                .read_response(Some(CommandType::Sync), CommandType::Sync.timeout())
                .await
                .is_err()
            {
                break;
            }
        }

        Ok(())
    }

    /// Read the next complete frame, waiting at most `timeout`.
    pub(crate) async fn read_frame(&mut self, timeout: Duration) -> Result<Vec<u8>, Error> {
        let deadline = Instant::now() + timeout;

        loop {
            let decoded = slip::decode(&self.read_ahead)
                .map(|(frame, rest)| (frame, self.read_ahead.len() - rest.len()));

            match decoded {
                Ok((Some(frame), consumed)) => {
                    self.read_ahead.drain(..consumed);
                    return Ok(frame);
                }
                Ok((None, _)) => {}
                Err(e) => {
                    self.discard_malformed_frame();
                    return Err(e.into());
                }
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                self.read_ahead.clear();
                return Err(Error::Timeout(CommandType::Unknown));
            }

            match self.serial.read(remaining, 1).await {
                Ok(bytes) => self.read_ahead.extend_from_slice(&bytes),
                Err(e) => {
                    if e.kind == SerialPortErrorKind::Timeout {
                        self.read_ahead.clear();
                    }
                    return Err(e.into());
                }
            }
        }
    }

    /// Drop the first non-empty frame from the read-ahead buffer, keeping
    /// whatever follows it.
    fn discard_malformed_frame(&mut self) {
        let Some(start) = self.read_ahead.iter().position(|&b| b == slip::END) else {
            self.read_ahead.clear();
            return;
        };

        match self.read_ahead[start..]
            .windows(2)
            .position(|pair| pair[0] != slip::END && pair[1] == slip::END)
        {
            Some(i) => {
                self.read_ahead.drain(..start + i + 2);
            }
            None => self.read_ahead.clear(),
        }
    }

    /// Read responses until one answers `expected`.
    ///
    /// With `expected` set to `None` the first response of any kind is
    /// returned.
    pub(crate) async fn read_response(
        &mut self,
        expected: Option<CommandType>,
        timeout: Duration,
    ) -> Result<CommandResponse, Error> {
        for _ in 0..MAX_RESPONSE_FRAMES {
            let frame = self.read_frame(timeout).await?;
            let Some(response) = CommandResponse::parse(&frame)? else {
                continue;
            };
            if !response.is_response() {
                continue;
            }

            match expected {
                Some(ty) if response.return_op != ty as u8 => {
                    if response.is_unsupported() {
                        self.flush_input().await?;
                        return Err(Error::UnsupportedCommand(ty));
                    }
                    debug!(
                        "Skipping response to {:#04x} while waiting for {ty}",
                        response.return_op
                    );
                }
                _ => return Ok(response),
            }
        }

        Err(Error::InvalidResponse(format!(
            "no matching response within {MAX_RESPONSE_FRAMES} frames"
        )))
    }

    /// Writes a SLIP frame to the serial port.
    pub(crate) async fn write_frame(&mut self, payload: &[u8]) -> Result<(), Error> {
        self.serial.write_all(&slip::encode(payload)).await?;
        self.serial.flush().await?;
        Ok(())
    }

    /// Writes a command to the serial port.
    pub async fn write_command(&mut self, command: Command<'_>) -> Result<(), Error> {
        debug!("Writing command: {}", command.command_type());
        self.write_frame(&command.encode()).await
    }

    /// Writes a command and reads the matching response, without
    /// interpreting its status bytes.
    pub async fn command(
        &mut self,
        command: Command<'_>,
        timeout: Duration,
    ) -> Result<CommandResponse, Error> {
        let ty = command.command_type();
        self.write_command(command).await.for_command(ty)?;
        self.read_response(Some(ty), timeout).await.for_command(ty)
    }

    /// Writes a command and checks the status bytes of its response.
    pub async fn checked_command(
        &mut self,
        command: Command<'_>,
        timeout: Duration,
        session: &Session,
    ) -> Result<CommandResponseValue, Error> {
        let ty = command.command_type();
        self.command(command, timeout)
            .await?
            .check(ty, session.status_len())
    }

    /// Reads a register.
    pub async fn read_reg(&mut self, session: &Session, addr: u32) -> Result<u32, Error> {
        self.checked_command(
            Command::ReadReg { address: addr },
            CommandType::ReadReg.timeout(),
            session,
        )
        .await?
        .try_into()
    }

    /// Writes a register.
    pub async fn write_reg(
        &mut self,
        session: &Session,
        addr: u32,
        value: u32,
        mask: Option<u32>,
    ) -> Result<(), Error> {
        self.checked_command(
            Command::WriteReg {
                address: addr,
                value,
                mask,
            },
            CommandType::WriteReg.timeout(),
            session,
        )
        .await?;

        Ok(())
    }

    /// Discards buffered and in-flight input.
    pub async fn flush_input(&mut self) -> Result<(), Error> {
        self.read_ahead.clear();
        self.serial.clear(ClearBufferType::Input).await?;

        for _ in 0..MAX_FLUSH_READS {
            match self.serial.read(FLUSH_READ_TIMEOUT, 1).await {
                Ok(bytes) if !bytes.is_empty() => {}
                _ => break,
            }
        }

        Ok(())
    }

    /// Detects which chip is connected to this connection.
    pub async fn detect_chip(&mut self) -> Result<Chip, Error> {
        // The status length is chip dependent, so only the header is used
        let response = self
            .command(
                Command::ReadReg {
                    address: CHIP_DETECT_MAGIC_REG_ADDR,
                },
                CommandType::ReadReg.timeout(),
            )
            .await?;

        let magic = response.value;
        debug!("Read chip magic value: {magic:#010x}");
        Chip::from_magic(magic)
    }

    /// Reopens the link at a new baud rate.
    pub(crate) async fn reconnect(&mut self, baud: u32) -> Result<(), Error> {
        self.serial.disconnect().await?;
        self.serial.connect(baud).await?;
        self.read_ahead.clear();
        Ok(())
    }

    /// Resets the device into the application.
    pub async fn reset(&mut self) -> Result<(), Error> {
        hard_reset(&mut self.serial, self.port_info.pid).await
    }

    /// Resets the device taking into account the reset after argument.
    pub async fn reset_after(&mut self, session: &Session) -> Result<(), Error> {
        match self.config.after {
            ResetAfterOperation::HardReset => self.reset().await,
            ResetAfterOperation::NoReset => {
                info!("Staying in bootloader");
                soft_reset(self, session, true).await
            }
            ResetAfterOperation::NoResetNoStub => {
                info!("Staying in flasher stub");
                Ok(())
            }
            ResetAfterOperation::RunUserCode => {
                info!("Running user code");
                soft_reset(self, session, false).await
            }
        }
    }

    /// Where the connection is in its bring-up.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// The configuration this connection was created with.
    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// The serial port.
    pub fn serial(&self) -> &P {
        &self.serial
    }

    /// Delays through the serial port.
    pub(crate) async fn delay_ms(&mut self, ms: u32) {
        self.serial.delay_ms(ms).await;
    }

    /// Turns a connection into its serial port.
    pub fn into_serial(self) -> P {
        self.serial
    }

    /// Returns the USB PID of the serial port.
    pub fn usb_pid(&self) -> u16 {
        self.port_info.pid
    }

    /// Returns if the connection is using USB serial JTAG.
    pub fn is_using_usb_serial_jtag(&self) -> bool {
        self.port_info.pid == USB_SERIAL_JTAG_PID
    }
}
