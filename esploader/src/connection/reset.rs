//! Reset strategies for resetting a target device.
//!
//! The DTR and RTS lines of a USB-to-serial bridge are usually wired to the
//! IO0 and EN pins of the chip, which is what these sequences toggle.

// The sequences follow `esptool.py`:
// https://github.com/espressif/esptool/blob/a8586d0/esptool/reset.py

use std::str::FromStr;

use log::debug;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString, VariantNames};

use super::{Connection, SerialInterface, USB_SERIAL_JTAG_PID};
use crate::{
    Error,
    command::{Command, CommandType},
    session::Session,
    target::Chip,
};

/// Default time to wait before releasing the boot pin after a reset.
const DEFAULT_RESET_DELAY: u32 = 50; // ms
/// Amount of time to wait if the default reset delay does not work.
const EXTRA_RESET_DELAY: u32 = 500; // ms
/// Time the chip is held in reset.
const RESET_HOLD_MS: u32 = 100;

/// A single step of a reset sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResetStep {
    /// Set the DTR line.
    Dtr(bool),
    /// Set the RTS line.
    Rts(bool),
    /// Wait for the given number of milliseconds.
    Wait(u32),
}

impl FromStr for ResetStep {
    type Err = Error;

    fn from_str(token: &str) -> Result<Self, Self::Err> {
        let invalid = || Error::InvalidResetSequence(format!("invalid step '{token}'"));

        let mut chars = token.chars();
        let kind = chars.next().ok_or_else(invalid)?;
        let arg = chars.as_str();

        let level = || match arg {
            "0" => Ok(false),
            "1" => Ok(true),
            _ => Err(invalid()),
        };

        match kind.to_ascii_uppercase() {
            'D' => Ok(ResetStep::Dtr(level()?)),
            'R' => Ok(ResetStep::Rts(level()?)),
            'W' => match arg.parse::<u32>() {
                Ok(ms) if ms > 0 => Ok(ResetStep::Wait(ms)),
                _ => Err(invalid()),
            },
            _ => Err(invalid()),
        }
    }
}

/// Reset strategy types for resetting a target device.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResetStrategy {
    /// Classic reset sequence, sets DTR and RTS sequentially.
    Classic {
        /// Delay in milliseconds.
        delay_ms: u32,
    },
    /// UNIX-only reset sequence setting both lines as close together as
    /// possible.
    #[cfg(unix)]
    UnixTight {
        /// Delay in milliseconds.
        delay_ms: u32,
    },
    /// Custom reset sequence for USB-JTAG-Serial peripheral.
    UsbJtagSerial,
    /// Pulse EN without touching IO0, booting the application.
    Hard {
        /// Whether the device is attached through USB-Serial-JTAG.
        usb_jtag: bool,
    },
    /// User-provided sequence, see [ResetStrategy::custom].
    Custom(Vec<ResetStep>),
}

impl ResetStrategy {
    /// Create a classic reset strategy.
    pub fn classic(extra_delay: bool) -> Self {
        ResetStrategy::Classic {
            delay_ms: reset_delay(extra_delay),
        }
    }

    /// Create a UNIX tight reset strategy.
    #[cfg(unix)]
    pub fn unix_tight(extra_delay: bool) -> Self {
        ResetStrategy::UnixTight {
            delay_ms: reset_delay(extra_delay),
        }
    }

    /// Create a USB JTAG serial reset strategy.
    pub fn usb_jtag_serial() -> Self {
        ResetStrategy::UsbJtagSerial
    }

    /// Parse a custom reset sequence such as `D0|R1|W100|D1|R0|W50|D0`.
    ///
    /// `D` and `R` set DTR and RTS to `0` or `1`, `W` waits for a positive
    /// number of milliseconds. The whole sequence is validated up front.
    pub fn custom(sequence: &str) -> Result<Self, Error> {
        let steps = sequence
            .split('|')
            .map(str::trim)
            .map(ResetStep::from_str)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(ResetStrategy::Custom(steps))
    }

    /// Execute the reset strategy.
    pub async fn reset<P: SerialInterface>(&self, serial_port: &mut P) -> Result<(), Error> {
        match self {
            ResetStrategy::Classic { delay_ms } => {
                debug!("Using Classic reset strategy with delay of {delay_ms}ms");

                serial_port.write_data_terminal_ready(false).await?; // IO0 = HIGH
                serial_port.write_request_to_send(true).await?; // EN = LOW, chip in reset

                serial_port.delay_ms(RESET_HOLD_MS).await;

                serial_port.write_data_terminal_ready(true).await?; // IO0 = LOW
                serial_port.write_request_to_send(false).await?; // EN = HIGH, chip out of reset

                serial_port.delay_ms(*delay_ms).await;

                serial_port.write_data_terminal_ready(false).await?; // IO0 = HIGH, done
            }
            #[cfg(unix)]
            ResetStrategy::UnixTight { delay_ms } => {
                debug!("Using UnixTight reset strategy with delay of {delay_ms}ms");

                set_dtr_rts(serial_port, false, false).await?;
                set_dtr_rts(serial_port, true, true).await?;
                set_dtr_rts(serial_port, false, true).await?; // IO0 = HIGH, EN = LOW

                serial_port.delay_ms(RESET_HOLD_MS).await;

                set_dtr_rts(serial_port, true, false).await?; // IO0 = LOW, EN = HIGH

                serial_port.delay_ms(*delay_ms).await;

                set_dtr_rts(serial_port, false, false).await?; // IO0 = HIGH, done
                serial_port.write_data_terminal_ready(false).await?;
            }
            ResetStrategy::UsbJtagSerial => {
                debug!("Using UsbJtagSerial reset strategy");

                serial_port.write_request_to_send(false).await?;
                serial_port.write_data_terminal_ready(false).await?; // Idle

                serial_port.delay_ms(100).await;

                serial_port.write_data_terminal_ready(true).await?; // Set IO0
                serial_port.write_request_to_send(false).await?;

                serial_port.delay_ms(100).await;

                // Go through (1,1) instead of (0,0)
                serial_port.write_request_to_send(true).await?;
                serial_port.write_data_terminal_ready(false).await?;
                // Windows only propagates DTR on RTS setting
                serial_port.write_request_to_send(true).await?;

                serial_port.delay_ms(100).await;

                serial_port.write_request_to_send(false).await?;
                serial_port.write_data_terminal_ready(false).await?;
            }
            ResetStrategy::Hard { usb_jtag } => {
                debug!("Using HardReset reset strategy");

                serial_port.delay_ms(100).await;

                if *usb_jtag {
                    serial_port.write_data_terminal_ready(false).await?;
                    serial_port.delay_ms(100).await;

                    serial_port.write_request_to_send(true).await?;
                    serial_port.write_data_terminal_ready(false).await?;
                    serial_port.write_request_to_send(true).await?;
                    serial_port.delay_ms(100).await;
                } else {
                    serial_port.write_request_to_send(true).await?;
                    serial_port.delay_ms(100).await;
                }

                serial_port.write_request_to_send(false).await?;
            }
            ResetStrategy::Custom(steps) => {
                debug!("Using Custom reset strategy with {} steps", steps.len());

                for step in steps {
                    match *step {
                        ResetStep::Dtr(level) => serial_port.write_data_terminal_ready(level).await?,
                        ResetStep::Rts(level) => serial_port.write_request_to_send(level).await?,
                        ResetStep::Wait(ms) => serial_port.delay_ms(ms).await,
                    }
                }
            }
        }

        Ok(())
    }
}

fn reset_delay(extra_delay: bool) -> u32 {
    if extra_delay {
        EXTRA_RESET_DELAY
    } else {
        DEFAULT_RESET_DELAY
    }
}

#[cfg(unix)]
async fn set_dtr_rts<P: SerialInterface>(
    serial_port: &mut P,
    dtr: bool,
    rts: bool,
) -> Result<(), Error> {
    serial_port.write_data_terminal_ready(dtr).await?;
    serial_port.write_request_to_send(rts).await?;
    Ok(())
}

/// Performs a hard reset of the chip.
pub async fn hard_reset<P: SerialInterface>(serial_port: &mut P, pid: u16) -> Result<(), Error> {
    ResetStrategy::Hard {
        usb_jtag: pid == USB_SERIAL_JTAG_PID,
    }
    .reset(serial_port)
    .await
}

/// Performs a soft reset of the device.
///
/// With `stay_in_bootloader` the device ends up in its ROM loader, otherwise
/// it starts the application.
pub async fn soft_reset<P: SerialInterface>(
    connection: &mut Connection<P>,
    session: &Session,
    stay_in_bootloader: bool,
) -> Result<(), Error> {
    debug!("Using SoftReset reset strategy");

    match (session.is_stub(), stay_in_bootloader) {
        // The ROM loader is already in the bootloader
        (false, true) => Ok(()),
        // From the ROM, 'run user code' is as close to a soft reset as we can do.
        // From the stub, the same sequence reloads the ROM loader.
        (false, false) | (true, true) => {
            connection
                .checked_command(
                    Command::FlashBegin {
                        size: 0,
                        blocks: 0,
                        block_size: session.flash_write_size() as u32,
                        offset: 0,
                        supports_encryption: session.encrypted_begin(),
                    },
                    CommandType::FlashBegin.timeout(),
                    session,
                )
                .await?;
            connection
                .write_command(Command::FlashEnd {
                    reboot: stay_in_bootloader,
                })
                .await
        }
        (true, false) => {
            let chip = session.require_chip()?;
            if chip != Chip::Esp8266 {
                return Err(Error::UnsupportedFeature {
                    chip,
                    feature: "soft reset from the flash stub",
                });
            }

            connection.write_command(Command::RunUserCode).await
        }
    }
}

/// Constructs a sequence of reset strategies based on the OS and chip.
///
/// Returns a [Vec] containing one or more reset strategies to be attempted
/// sequentially. A custom sequence replaces the built-in ones.
#[allow(unused_variables)]
pub fn construct_reset_strategy_sequence(
    port_name: &str,
    pid: u16,
    mode: ResetBeforeOperation,
    custom: Option<&str>,
) -> Result<Vec<ResetStrategy>, Error> {
    if let Some(sequence) = custom {
        return Ok(vec![ResetStrategy::custom(sequence)?]);
    }

    // USB-JTAG/Serial mode
    if pid == USB_SERIAL_JTAG_PID || mode == ResetBeforeOperation::UsbReset {
        return Ok(vec![ResetStrategy::usb_jtag_serial()]);
    }

    // USB-to-Serial bridge
    #[cfg(unix)]
    if !port_name.starts_with("rfc2217:") {
        return Ok(vec![
            ResetStrategy::unix_tight(false),
            ResetStrategy::unix_tight(true),
            ResetStrategy::classic(false),
            ResetStrategy::classic(true),
        ]);
    }

    Ok(vec![ResetStrategy::classic(false), ResetStrategy::classic(true)])
}

/// Enum to represent different reset behaviors before an operation.
#[cfg_attr(feature = "cli", derive(clap::ValueEnum))]
#[derive(
    Debug,
    Default,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Display,
    EnumIter,
    EnumString,
    VariantNames,
    Hash,
    Serialize,
    Deserialize,
)]
#[non_exhaustive]
#[strum(serialize_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum ResetBeforeOperation {
    /// Uses DTR & RTS serial control lines to try to reset the chip into
    /// bootloader mode.
    #[default]
    DefaultReset,
    /// Skips DTR/RTS control signal assignments and just start sending a serial
    /// synchronisation command to the chip.
    NoReset,
    /// Skips DTR/RTS control signal assignments and also skips the serial
    /// synchronization command.
    NoResetNoSync,
    /// Reset sequence for USB-JTAG-Serial peripheral.
    UsbReset,
}

/// Enum to represent different reset behaviors after an operation.
#[cfg_attr(feature = "cli", derive(clap::ValueEnum))]
#[derive(
    Debug,
    Default,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Display,
    EnumIter,
    EnumString,
    VariantNames,
    Hash,
    Serialize,
    Deserialize,
)]
#[non_exhaustive]
#[strum(serialize_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum ResetAfterOperation {
    /// The RTS serial control line is used to reset the chip into a normal boot
    /// sequence.
    #[default]
    HardReset,
    /// Leaves the chip in the serial bootloader, no reset is performed.
    NoReset,
    /// Leaves the chip in the stub bootloader, no reset is performed.
    NoResetNoStub,
    /// Starts the application without toggling any control line.
    RunUserCode,
}
