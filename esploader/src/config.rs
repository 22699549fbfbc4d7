//! Connection and flashing configuration
//!
//! Both structs are plain serde types with every field defaulted, so they can
//! be loaded from any serde format and only the values that differ from the
//! defaults need to be given.

use serde::{Deserialize, Serialize};

use crate::{
    connection::{ResetAfterOperation, ResetBeforeOperation},
    flasher::FlashSettings,
    target::Chip,
};

const DEFAULT_CONNECT_ATTEMPTS: usize = 7;

/// How a [Connection](crate::connection::Connection) brings up the device and
/// leaves it afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Reset performed before synchronising.
    pub before: ResetBeforeOperation,
    /// Reset performed once flashing is done.
    pub after: ResetAfterOperation,
    /// Reset and sync rounds before giving up.
    pub connect_attempts: usize,
    /// Custom reset sequence, e.g. `D0|R1|W100|D1|R0|W50|D0`, replacing the
    /// built-in strategies.
    pub reset_sequence: Option<String>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig {
            before: ResetBeforeOperation::default(),
            after: ResetAfterOperation::default(),
            connect_attempts: DEFAULT_CONNECT_ATTEMPTS,
            reset_sequence: None,
        }
    }
}

/// What a [Flasher](crate::flasher::Flasher) does once connected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlasherConfig {
    /// Upload and use the flash stub.
    pub use_stub: bool,
    /// Check written segments against their MD5 digest.
    pub verify: bool,
    /// Skip segments whose flash contents already match.
    pub skip: bool,
    /// Send segments zlib-compressed.
    pub compress: bool,
    /// Baud rate to switch to after connecting.
    pub baud: Option<u32>,
    /// Expected chip. Required when the connection does not identify it.
    pub chip: Option<Chip>,
    /// Flash parameters patched into bootloader images.
    pub flash_settings: FlashSettings,
}

impl Default for FlasherConfig {
    fn default() -> Self {
        FlasherConfig {
            use_stub: true,
            verify: true,
            skip: false,
            compress: true,
            baud: None,
            chip: None,
            flash_settings: FlashSettings::default(),
        }
    }
}
