//! A scripted in-memory device speaking the serial loader protocol.
#![allow(dead_code)]

use std::{
    cell::{RefCell, RefMut},
    collections::{HashMap, VecDeque},
    rc::Rc,
    time::Duration,
};

use esploader::{
    command::{CHECKSUM_INIT, checksum},
    config::{ConnectionConfig, FlasherConfig},
    connection::{ClearBufferType, Connection, PortInfo, SerialInterface, SerialPortError, slip},
    flasher::{Flasher, stubs::FlashStub},
    target::{Chip, ProgressCallbacks},
};
use md5::{Digest, Md5};
use miniz_oxide::{deflate::compress_to_vec_zlib, inflate::decompress_to_vec_zlib};

pub const FLASH_SIZE: usize = 0x40_0000;
/// Winbond part with a 4 MB capacity byte.
pub const JEDEC_ID_4MB: u32 = 0x16_40ef;
pub const CHIP_DETECT_MAGIC_REG_ADDR: u32 = 0x4000_1000;
pub const STUB_ENTRY: u32 = 0x4008_0400;

pub mod op {
    pub const FLASH_BEGIN: u8 = 0x02;
    pub const FLASH_DATA: u8 = 0x03;
    pub const FLASH_END: u8 = 0x04;
    pub const MEM_BEGIN: u8 = 0x05;
    pub const MEM_END: u8 = 0x06;
    pub const MEM_DATA: u8 = 0x07;
    pub const SYNC: u8 = 0x08;
    pub const WRITE_REG: u8 = 0x09;
    pub const READ_REG: u8 = 0x0A;
    pub const SPI_SET_PARAMS: u8 = 0x0B;
    pub const SPI_ATTACH: u8 = 0x0D;
    pub const CHANGE_BAUDRATE: u8 = 0x0F;
    pub const FLASH_DEFL_BEGIN: u8 = 0x10;
    pub const FLASH_DEFL_DATA: u8 = 0x11;
    pub const FLASH_DEFL_END: u8 = 0x12;
    pub const FLASH_MD5: u8 = 0x13;
    pub const ERASE_FLASH: u8 = 0xD0;
    pub const ERASE_REGION: u8 = 0xD1;
    pub const READ_FLASH: u8 = 0xD2;
    pub const RUN_USER_CODE: u8 = 0xD3;
}

/// A request packet received by the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub op: u8,
    pub checksum: u32,
    pub payload: Vec<u8>,
}

impl Request {
    /// Little endian word `index` of the payload.
    pub fn word(&self, index: usize) -> u32 {
        word(&self.payload, index)
    }
}

fn word(data: &[u8], index: usize) -> u32 {
    let start = index * 4;
    u32::from_le_bytes([
        data[start],
        data[start + 1],
        data[start + 2],
        data[start + 3],
    ])
}

#[derive(Debug)]
struct PendingWrite {
    offset: usize,
    size: usize,
    compressed: bool,
    next_sequence: u32,
    received: Vec<u8>,
}

#[derive(Debug)]
pub struct DeviceState {
    pub chip: Chip,
    pub magic: u32,
    pub stub: bool,
    pub baud: u32,
    /// Sync requests ignored before the device starts answering.
    pub sync_failures: usize,
    pub syncs_seen: usize,
    /// Printed whenever EN is released.
    pub boot_log: Option<Vec<u8>>,
    pub stub_handshake: bool,
    /// Raw bytes sent ahead of the stub greeting.
    pub handshake_noise: Vec<u8>,
    /// The port fails every read once this opcode has been answered.
    pub unplug_after: Option<u8>,
    pub corrupt_md5: bool,
    /// Swallow every request without answering.
    pub silent: bool,
    /// Answer this opcode with an "invalid message" failure.
    pub rejected: Option<u8>,
    pub jedec_id: u32,
    pub flash: Vec<u8>,
    pub registers: HashMap<u32, u32>,
    pub requests: Vec<Request>,
    pub signals: Vec<(char, bool)>,
    pub acks: Vec<u32>,
    pub reconnects: Vec<u32>,
    input: VecDeque<u8>,
    rx: Vec<u8>,
    write: Option<PendingWrite>,
    unplugged: bool,
}

impl DeviceState {
    fn new(chip: Chip) -> Self {
        DeviceState {
            chip,
            magic: chip.descriptor().magic_values[0],
            stub: false,
            baud: 115_200,
            sync_failures: 0,
            syncs_seen: 0,
            boot_log: None,
            stub_handshake: true,
            handshake_noise: Vec::new(),
            unplug_after: None,
            corrupt_md5: false,
            silent: false,
            rejected: None,
            jedec_id: JEDEC_ID_4MB,
            flash: vec![0xff; FLASH_SIZE],
            registers: HashMap::new(),
            requests: Vec::new(),
            signals: Vec::new(),
            acks: Vec::new(),
            reconnects: Vec::new(),
            input: VecDeque::new(),
            rx: Vec::new(),
            write: None,
            unplugged: false,
        }
    }

    /// Queue a raw packet as one frame for the host.
    pub fn push_frame(&mut self, packet: &[u8]) {
        self.input.extend(slip::encode(packet));
    }

    /// Queue a response packet with a passing status.
    pub fn push_response(&mut self, op: u8, value: u32, data: &[u8]) {
        let mut body = data.to_vec();
        body.resize(data.len() + self.status_len(), 0);
        self.push_packet(op, value, &body);
    }

    pub fn requests_with_op(&self, op: u8) -> Vec<Request> {
        self.requests.iter().filter(|r| r.op == op).cloned().collect()
    }

    pub fn ops(&self) -> Vec<u8> {
        self.requests.iter().map(|r| r.op).collect()
    }

    fn status_len(&self) -> usize {
        if self.stub {
            2
        } else {
            self.chip.descriptor().rom_status_len
        }
    }

    fn push_packet(&mut self, op: u8, value: u32, body: &[u8]) {
        let mut packet = vec![0x01, op];
        packet.extend_from_slice(&(body.len() as u16).to_le_bytes());
        packet.extend_from_slice(&value.to_le_bytes());
        packet.extend_from_slice(body);
        self.push_frame(&packet);
    }

    fn fail(&mut self, op: u8, code: u8) {
        let mut body = vec![0; self.status_len()];
        body[0] = 1;
        body[1] = code;
        self.push_packet(op, 0, &body);
    }

    fn receive(&mut self, bytes: &[u8]) {
        self.rx.extend_from_slice(bytes);

        loop {
            let (frame, consumed) = match slip::decode(&self.rx) {
                Ok((Some(frame), rest)) => {
                    let consumed = self.rx.len() - rest.len();
                    (frame, consumed)
                }
                _ => break,
            };
            self.rx.drain(..consumed);
            self.handle(frame);
        }
    }

    fn handle(&mut self, frame: Vec<u8>) {
        if frame.len() < 8 || frame[0] != 0 {
            // Read flash acknowledgements
            if frame.len() == 4 {
                self.acks.push(word(&frame, 0));
            }
            return;
        }

        let request = Request {
            op: frame[1],
            checksum: word(&frame, 1),
            payload: frame[8..].to_vec(),
        };
        self.requests.push(request.clone());
        if self.unplug_after == Some(request.op) {
            self.unplugged = true;
        }

        if self.silent {
            return;
        }
        if self.rejected == Some(request.op) {
            self.fail(request.op, 0x05);
            return;
        }

        match request.op {
            op::SYNC => {
                self.syncs_seen += 1;
                if self.syncs_seen > self.sync_failures {
                    for _ in 0..8 {
                        self.push_response(op::SYNC, 0, &[]);
                    }
                }
            }
            op::READ_REG => {
                let address = request.word(0);
                let value = if address == CHIP_DETECT_MAGIC_REG_ADDR {
                    self.magic
                } else {
                    self.registers.get(&address).copied().unwrap_or(0)
                };
                self.push_response(op::READ_REG, value, &[]);
            }
            op::WRITE_REG => {
                let (address, value) = (request.word(0), request.word(1));
                let registers = self.chip.spi_registers();
                if address == registers.cmd() && value & (1 << 18) != 0 {
                    self.registers.insert(registers.w0(), self.jedec_id);
                    self.registers.insert(address, 0);
                } else {
                    self.registers.insert(address, value);
                }
                self.push_response(op::WRITE_REG, 0, &[]);
            }
            op::MEM_END => {
                self.push_response(op::MEM_END, 0, &[]);
                let noise = self.handshake_noise.clone();
                self.input.extend(noise);
                if self.stub_handshake {
                    self.stub = true;
                    self.push_frame(b"OHAI");
                }
            }
            op::FLASH_BEGIN | op::FLASH_DEFL_BEGIN => {
                self.write = Some(PendingWrite {
                    offset: request.word(3) as usize,
                    size: request.word(0) as usize,
                    compressed: request.op == op::FLASH_DEFL_BEGIN,
                    next_sequence: 0,
                    received: Vec::new(),
                });
                self.push_response(request.op, 0, &[]);
            }
            op::FLASH_DATA | op::FLASH_DEFL_DATA => self.flash_data(&request),
            op::FLASH_END | op::FLASH_DEFL_END => {
                self.write = None;
                self.push_response(request.op, 0, &[]);
            }
            op::FLASH_MD5 => {
                let (offset, size) = (request.word(0) as usize, request.word(1) as usize);
                let digest = self.digest(offset, size);
                let data = if self.stub {
                    digest.to_vec()
                } else {
                    digest
                        .iter()
                        .map(|b| format!("{b:02x}"))
                        .collect::<String>()
                        .into_bytes()
                };
                self.push_response(op::FLASH_MD5, 0, &data);
            }
            op::ERASE_FLASH => {
                self.flash.fill(0xff);
                self.push_response(op::ERASE_FLASH, 0, &[]);
            }
            op::ERASE_REGION => {
                let (offset, size) = (request.word(0) as usize, request.word(1) as usize);
                self.flash[offset..offset + size].fill(0xff);
                self.push_response(op::ERASE_REGION, 0, &[]);
            }
            op::READ_FLASH => {
                let (offset, size, block_size) = (
                    request.word(0) as usize,
                    request.word(1) as usize,
                    request.word(2) as usize,
                );
                self.push_response(op::READ_FLASH, 0, &[]);

                let contents = self.flash[offset..offset + size].to_vec();
                for block in contents.chunks(block_size) {
                    self.push_frame(block);
                }
                let digest = self.digest(offset, size);
                self.push_frame(&digest);
            }
            op::RUN_USER_CODE => {}
            op::MEM_BEGIN
            | op::MEM_DATA
            | op::SPI_SET_PARAMS
            | op::SPI_ATTACH
            | op::CHANGE_BAUDRATE => self.push_response(request.op, 0, &[]),
            other => self.fail(other, 0x05),
        }
    }

    fn flash_data(&mut self, request: &Request) {
        let block = &request.payload[16..];

        if u32::from(checksum(block, CHECKSUM_INIT)) != request.checksum {
            self.fail(request.op, 0xc1);
            return;
        }
        let Some(write) = self.write.as_mut() else {
            self.fail(request.op, 0xc6);
            return;
        };
        if request.word(1) != write.next_sequence {
            self.fail(request.op, 0xc2);
            return;
        }
        write.next_sequence += 1;

        let written = if write.compressed {
            write.received.extend_from_slice(block);
            // Partial streams fail to inflate, the last block completes it
            decompress_to_vec_zlib(&write.received)
                .ok()
                .map(|data| (write.offset, data))
        } else {
            let start = write.offset + write.received.len();
            write.received.extend_from_slice(block);
            let end = (write.offset + write.size).min(start + block.len());
            (start < end).then(|| (start, block[..end - start].to_vec()))
        };

        if let Some((start, data)) = written {
            self.flash[start..start + data.len()].copy_from_slice(&data);
        }

        self.push_response(request.op, 0, &[]);
    }

    fn digest(&self, offset: usize, size: usize) -> [u8; 16] {
        let mut digest: [u8; 16] = Md5::digest(&self.flash[offset..offset + size]).into();
        if self.corrupt_md5 {
            digest[0] ^= 0xff;
        }
        digest
    }
}

/// Handle to the shared device state, usable as a serial port.
#[derive(Debug, Clone)]
pub struct FakeDevice {
    state: Rc<RefCell<DeviceState>>,
}

impl FakeDevice {
    pub fn new(chip: Chip) -> Self {
        FakeDevice {
            state: Rc::new(RefCell::new(DeviceState::new(chip))),
        }
    }

    pub fn state(&self) -> RefMut<'_, DeviceState> {
        self.state.borrow_mut()
    }

    pub fn connection(&self, config: ConnectionConfig) -> Connection<FakeDevice> {
        Connection::new(self.clone(), PortInfo::default(), config)
    }
}

impl SerialInterface for FakeDevice {
    fn name(&self) -> Option<String> {
        Some("/dev/ttyFAKE0".into())
    }

    fn baud_rate(&self) -> u32 {
        self.state.borrow().baud
    }

    async fn connect(&mut self, baud_rate: u32) -> Result<(), SerialPortError> {
        let mut state = self.state();
        state.baud = baud_rate;
        state.reconnects.push(baud_rate);
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), SerialPortError> {
        Ok(())
    }

    async fn read(
        &mut self,
        _timeout: Duration,
        _min_bytes: usize,
    ) -> Result<Vec<u8>, SerialPortError> {
        let mut state = self.state();
        if state.input.is_empty() {
            if state.unplugged {
                return Err(SerialPortError::io("device unplugged"));
            }
            return Err(SerialPortError::timeout("nothing queued"));
        }
        Ok(state.input.drain(..).collect())
    }

    async fn write_all(&mut self, buf: &[u8]) -> Result<(), SerialPortError> {
        self.state().receive(buf);
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), SerialPortError> {
        Ok(())
    }

    async fn clear(&mut self, buffer_to_clear: ClearBufferType) -> Result<(), SerialPortError> {
        if buffer_to_clear != ClearBufferType::Output {
            self.state().input.clear();
        }
        Ok(())
    }

    async fn write_data_terminal_ready(&mut self, level: bool) -> Result<(), SerialPortError> {
        self.state().signals.push(('D', level));
        Ok(())
    }

    async fn write_request_to_send(&mut self, level: bool) -> Result<(), SerialPortError> {
        let mut state = self.state();
        state.signals.push(('R', level));
        if !level {
            if let Some(log) = state.boot_log.clone() {
                state.input.extend(log);
            }
        }
        Ok(())
    }

    async fn delay_ms(&mut self, _ms: u32) {}
}

/// Progress events in the order they were reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    Init(u32, usize),
    Update(usize),
    Verifying,
    Finish(bool),
}

#[derive(Debug, Default)]
pub struct RecordingProgress {
    pub events: Vec<Progress>,
}

impl ProgressCallbacks for RecordingProgress {
    fn init(&mut self, addr: u32, total: usize) {
        self.events.push(Progress::Init(addr, total));
    }

    fn update(&mut self, current: usize) {
        self.events.push(Progress::Update(current));
    }

    fn verifying(&mut self) {
        self.events.push(Progress::Verifying);
    }

    fn finish(&mut self, skipped: bool) {
        self.events.push(Progress::Finish(skipped));
    }
}

/// A stub whose text spans two RAM blocks.
pub fn test_stub() -> FlashStub {
    let text: Vec<u8> = (0..0x2000u32).map(|i| (i % 7) as u8).collect();
    let data = b"stub data".to_vec();

    FlashStub::new(
        STUB_ENTRY,
        0x4008_0000,
        compress_to_vec_zlib(&text, 9),
        0x3ffe_0000,
        compress_to_vec_zlib(&data, 9),
    )
}

pub fn rom_config() -> FlasherConfig {
    FlasherConfig {
        use_stub: false,
        ..FlasherConfig::default()
    }
}

/// Connect a flasher to `device` with the default connection settings.
pub fn flasher(
    device: &FakeDevice,
    config: FlasherConfig,
    stub: Option<&FlashStub>,
) -> Flasher<FakeDevice> {
    let connection = device.connection(ConnectionConfig::default());
    futures_lite::future::block_on(Flasher::connect(connection, config, stub))
        .map_err(|(_, e)| e)
        .expect("flasher connects")
}

/// Test data that deflates to several blocks but not to nothing.
pub fn firmware(len: usize) -> Vec<u8> {
    let mut seed = 0x1234_5678u32;
    (0..len)
        .map(|i| {
            seed = seed.wrapping_mul(1_103_515_245).wrapping_add(12_345);
            if i % 3 == 0 { (seed >> 16) as u8 } else { (i / 64) as u8 }
        })
        .collect()
}
