//! Raw SPI flash commands driven through the SPI controller registers.

use bitflags::bitflags;
use log::debug;

use crate::{
    Error,
    connection::{Connection, SerialInterface},
    session::Session,
};

/// Read the JEDEC manufacturer and device id.
pub(crate) const FLASH_RDID: u8 = 0x9F;

const MAX_DATA_LEN: usize = 64;
const MAX_READ_BITS: u32 = 32;
const MAX_POLLS: usize = 10;

/// Starts a user command when written to the CMD register, reads back as set
/// while the command is running.
const CMD_USR: u32 = 1 << 18;
const USR2_COMMAND_LEN_SHIFT: u32 = 28;
const USR1_MISO_BITLEN_SHIFT: u32 = 8;
const USR1_MOSI_BITLEN_SHIFT: u32 = 17;

bitflags! {
    /// Phases enabled in the USR register.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct UsrFlags: u32 {
        const COMMAND = 1 << 31;
        const MISO = 1 << 28;
        const MOSI = 1 << 27;
    }
}

/// Run an arbitrary SPI flash command and return up to 32 bits read back.
///
/// `data` is sent after the 8-bit `opcode`. The USR and USR2 registers are
/// restored afterwards.
pub async fn run_spiflash_command<P: SerialInterface>(
    connection: &mut Connection<P>,
    session: &Session,
    opcode: u8,
    data: &[u8],
    read_bits: u32,
) -> Result<u32, Error> {
    if data.len() > MAX_DATA_LEN {
        return Err(Error::SpiPayloadTooLarge(data.len()));
    }
    if read_bits > MAX_READ_BITS {
        return Err(Error::SpiReadTooWide(read_bits));
    }

    let registers = session.require_chip()?.spi_registers();

    let old_spi_usr = connection.read_reg(session, registers.usr()).await?;
    let old_spi_usr2 = connection.read_reg(session, registers.usr2()).await?;

    let mosi_bits = data.len() as u32 * 8;
    match (registers.mosi_length(), registers.miso_length()) {
        (Some(mosi_length), Some(miso_length)) => {
            if mosi_bits > 0 {
                connection
                    .write_reg(session, mosi_length, mosi_bits - 1, None)
                    .await?;
            }
            if read_bits > 0 {
                connection
                    .write_reg(session, miso_length, read_bits - 1, None)
                    .await?;
            }
        }
        _ => {
            let usr1 = (read_bits.saturating_sub(1) << USR1_MISO_BITLEN_SHIFT)
                | (mosi_bits.saturating_sub(1) << USR1_MOSI_BITLEN_SHIFT);
            connection
                .write_reg(session, registers.usr1(), usr1, None)
                .await?;
        }
    }

    let mut flags = UsrFlags::COMMAND;
    flags.set(UsrFlags::MISO, read_bits > 0);
    flags.set(UsrFlags::MOSI, !data.is_empty());

    connection
        .write_reg(session, registers.usr(), flags.bits(), None)
        .await?;
    connection
        .write_reg(
            session,
            registers.usr2(),
            (7 << USR2_COMMAND_LEN_SHIFT) | u32::from(opcode),
            None,
        )
        .await?;

    if data.is_empty() {
        connection
            .write_reg(session, registers.w0(), 0, None)
            .await?;
    } else {
        for (i, bytes) in data.chunks(4).enumerate() {
            let mut word = [0; 4];
            word[..bytes.len()].copy_from_slice(bytes);
            connection
                .write_reg(
                    session,
                    registers.w0() + 4 * i as u32,
                    u32::from_le_bytes(word),
                    None,
                )
                .await?;
        }
    }

    connection
        .write_reg(session, registers.cmd(), CMD_USR, None)
        .await?;

    let mut done = false;
    for _ in 0..MAX_POLLS {
        if connection.read_reg(session, registers.cmd()).await? & CMD_USR == 0 {
            done = true;
            break;
        }
    }
    if !done {
        return Err(Error::SpiCommandTimeout(opcode));
    }

    let result = connection.read_reg(session, registers.w0()).await?;
    debug!("SPI command {opcode:#04x} returned {result:#010x}");

    connection
        .write_reg(session, registers.usr(), old_spi_usr, None)
        .await?;
    connection
        .write_reg(session, registers.usr2(), old_spi_usr2, None)
        .await?;

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usr_flags_per_phase() {
        let mut flags = UsrFlags::COMMAND;
        flags.set(UsrFlags::MISO, true);
        flags.set(UsrFlags::MOSI, false);

        assert_eq!(flags.bits(), 0x9000_0000);
    }
}
