//! Serial bootloader protocol client for Espressif devices.
//!
//! `esploader` talks to the ROM loader of the ESP8266 and ESP32 family chips
//! over any byte link implementing [connection::SerialInterface]. It brings
//! the device up, identifies the chip, optionally uploads the RAM flash stub,
//! and then erases, writes, reads and verifies the SPI flash.
//!
//! ```no_run
//! # async fn flash(port: esploader::connection::NativePort, stub: esploader::flasher::stubs::FlashStub) -> Result<(), esploader::Error> {
//! use esploader::{
//!     config::{ConnectionConfig, FlasherConfig},
//!     connection::{Connection, PortInfo},
//!     flasher::Flasher,
//!     target::DefaultProgressCallback,
//! };
//!
//! let connection = Connection::new(port, PortInfo::default(), ConnectionConfig::default());
//! let mut flasher = Flasher::connect(connection, FlasherConfig::default(), Some(&stub))
//!     .await
//!     .map_err(|(_, e)| e)?;
//!
//! flasher
//!     .write_bin_to_flash(0x10000, &[0u8; 4096], &mut DefaultProgressCallback)
//!     .await?;
//! # Ok(())
//! # }
//! ```
//!
//! The library logs through the [log] facade and never installs a logger.

#![warn(missing_docs, rust_2018_idioms)]

pub use self::error::Error;

pub mod command;
pub mod config;
pub mod connection;
pub mod error;
pub mod flasher;
pub mod image_format;
pub mod session;
pub mod target;
