//! [SerialInterface] on top of a native serial port.

use std::{
    io::{ErrorKind, Read, Write},
    time::{Duration, Instant},
};

use serialport::SerialPort;

use super::{ClearBufferType, SerialInterface, SerialPortError, SerialPortErrorKind};

#[cfg(unix)]
/// Alias for the serial TTYPort.
pub type Port = serialport::TTYPort;
#[cfg(windows)]
/// Alias for the serial COMPort.
pub type Port = serialport::COMPort;

const READ_CHUNK: usize = 1024;

/// A native serial port that can be closed and reopened at another baud rate.
#[derive(Debug)]
pub struct NativePort {
    path: String,
    baud_rate: u32,
    port: Option<Port>,
}

impl NativePort {
    /// Open `path` at `baud_rate`.
    pub fn open(path: impl Into<String>, baud_rate: u32) -> Result<Self, SerialPortError> {
        let path = path.into();
        let port = open_port(&path, baud_rate)?;

        Ok(NativePort {
            path,
            baud_rate,
            port: Some(port),
        })
    }

    fn port(&mut self) -> Result<&mut Port, SerialPortError> {
        self.port
            .as_mut()
            .ok_or_else(|| SerialPortError::new(SerialPortErrorKind::NoDevice, "port is closed"))
    }
}

fn open_port(path: &str, baud_rate: u32) -> Result<Port, SerialPortError> {
    serialport::new(path, baud_rate)
        .open_native()
        .map_err(map_serial_error)
}

fn map_serial_error(err: serialport::Error) -> SerialPortError {
    let kind = match err.kind() {
        serialport::ErrorKind::NoDevice => SerialPortErrorKind::NoDevice,
        serialport::ErrorKind::InvalidInput => SerialPortErrorKind::InvalidInput,
        serialport::ErrorKind::Io(ErrorKind::TimedOut) => SerialPortErrorKind::Timeout,
        serialport::ErrorKind::Io(_) => SerialPortErrorKind::Io,
        _ => SerialPortErrorKind::Unknown,
    };

    SerialPortError::new(kind, err.to_string())
}

fn map_io_error(err: std::io::Error) -> SerialPortError {
    match err.kind() {
        ErrorKind::TimedOut => SerialPortError::timeout(err.to_string()),
        _ => SerialPortError::io(err.to_string()),
    }
}

/// Call `read_chunk` with the time left until at least `min_bytes` bytes
/// have arrived. Falling short at the deadline is a timeout, and the partial
/// data is discarded.
fn read_at_least(
    timeout: Duration,
    min_bytes: usize,
    mut read_chunk: impl FnMut(Duration, &mut [u8]) -> Result<usize, SerialPortError>,
) -> Result<Vec<u8>, SerialPortError> {
    let min_bytes = min_bytes.max(1);
    let deadline = Instant::now() + timeout;
    let mut data = Vec::new();
    let mut chunk = [0u8; READ_CHUNK];

    while data.len() < min_bytes {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }

        match read_chunk(remaining, &mut chunk) {
            Ok(n) => data.extend_from_slice(&chunk[..n]),
            Err(e) if e.kind == SerialPortErrorKind::Timeout => break,
            Err(e) => return Err(e),
        }
    }

    if data.len() < min_bytes {
        return Err(SerialPortError::timeout(format!(
            "{} of {min_bytes} bytes within {}ms",
            data.len(),
            timeout.as_millis()
        )));
    }

    Ok(data)
}

impl SerialInterface for NativePort {
    fn name(&self) -> Option<String> {
        Some(self.path.clone())
    }

    fn baud_rate(&self) -> u32 {
        self.baud_rate
    }

    async fn connect(&mut self, baud_rate: u32) -> Result<(), SerialPortError> {
        self.port = None;
        self.port = Some(open_port(&self.path, baud_rate)?);
        self.baud_rate = baud_rate;
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), SerialPortError> {
        self.port = None;
        Ok(())
    }

    async fn read(
        &mut self,
        timeout: Duration,
        min_bytes: usize,
    ) -> Result<Vec<u8>, SerialPortError> {
        let port = self.port()?;

        read_at_least(timeout, min_bytes, |remaining, chunk| {
            port.set_timeout(remaining).map_err(map_serial_error)?;
            port.read(chunk).map_err(map_io_error)
        })
    }

    async fn write_all(&mut self, buf: &[u8]) -> Result<(), SerialPortError> {
        self.port()?.write_all(buf).map_err(map_io_error)
    }

    async fn flush(&mut self) -> Result<(), SerialPortError> {
        Write::flush(self.port()?).map_err(map_io_error)
    }

    async fn clear(&mut self, buffer_to_clear: ClearBufferType) -> Result<(), SerialPortError> {
        let clear_type = match buffer_to_clear {
            ClearBufferType::Input => serialport::ClearBuffer::Input,
            ClearBufferType::Output => serialport::ClearBuffer::Output,
            ClearBufferType::All => serialport::ClearBuffer::All,
        };
        self.port()?.clear(clear_type).map_err(map_serial_error)
    }

    async fn write_data_terminal_ready(&mut self, level: bool) -> Result<(), SerialPortError> {
        self.port()?
            .write_data_terminal_ready(level)
            .map_err(map_serial_error)
    }

    async fn write_request_to_send(&mut self, level: bool) -> Result<(), SerialPortError> {
        self.port()?
            .write_request_to_send(level)
            .map_err(map_serial_error)
    }

    async fn delay_ms(&mut self, ms: u32) {
        std::thread::sleep(Duration::from_millis(u64::from(ms)));
    }
}
