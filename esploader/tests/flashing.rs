mod common;

use common::{
    FakeDevice, Progress, RecordingProgress, firmware, flasher, op, rom_config, test_stub,
};
use esploader::{
    Error,
    config::{ConnectionConfig, FlasherConfig},
    error::ErrorKind,
    flasher::{FlashFrequency, FlashMode, FlashSettings, FlashSize, Flasher, spi},
    image_format::{ESP_MAGIC, Segment},
    target::Chip,
};
use futures_lite::future::block_on;

fn stub_config() -> FlasherConfig {
    FlasherConfig::default()
}

#[test]
fn compressed_rom_write_is_verified() {
    let device = FakeDevice::new(Chip::Esp32);
    let mut flasher = flasher(&device, rom_config(), None);
    device.state().requests.clear();

    let data = firmware(4096);
    let mut progress = RecordingProgress::default();
    block_on(flasher.write_bin_to_flash(0x10000, &data, &mut progress)).unwrap();

    let state = device.state();
    assert_eq!(&state.flash[0x10000..0x11000], &data[..]);

    let begin = &state.requests_with_op(op::FLASH_DEFL_BEGIN)[0];
    let blocks = begin.word(1);
    assert_eq!(begin.payload.len(), 16);
    assert_eq!(begin.word(0), 4096);
    assert_eq!(begin.word(2), 0x400);
    assert_eq!(begin.word(3), 0x10000);

    let sequences: Vec<u32> = state
        .requests_with_op(op::FLASH_DEFL_DATA)
        .iter()
        .map(|r| r.word(1))
        .collect();
    assert_eq!(sequences, (0..blocks).collect::<Vec<_>>());

    let md5 = &state.requests_with_op(op::FLASH_MD5)[0];
    assert_eq!((md5.word(0), md5.word(1)), (0x10000, 4096));

    // The ROM needs no closing write
    assert!(state.requests_with_op(op::FLASH_DEFL_END).is_empty());

    assert_eq!(progress.events.first(), Some(&Progress::Init(0x10000, 4096)));
    assert_eq!(
        &progress.events[progress.events.len() - 3..],
        &[
            Progress::Update(4096),
            Progress::Verifying,
            Progress::Finish(false)
        ]
    );
}

#[test]
fn digest_mismatch_is_an_integrity_error() {
    let device = FakeDevice::new(Chip::Esp32);
    let mut flasher = flasher(&device, rom_config(), None);
    device.state().corrupt_md5 = true;

    let data = firmware(4096);
    let err = block_on(flasher.write_bin_to_flash(
        0x10000,
        &data,
        &mut RecordingProgress::default(),
    ))
    .unwrap_err();

    assert!(matches!(err, Error::VerifyFailed { address: 0x10000, .. }));
    assert_eq!(err.kind(), ErrorKind::Integrity);
}

#[test]
fn raw_rom_write_pads_every_block() {
    let device = FakeDevice::new(Chip::Esp32c3);
    let config = FlasherConfig {
        compress: false,
        ..rom_config()
    };
    let mut flasher = flasher(&device, config, None);
    device.state().requests.clear();

    let data = firmware(0x901);
    block_on(flasher.write_bin_to_flash(0x20000, &data, &mut RecordingProgress::default()))
        .unwrap();

    let state = device.state();

    let begin = &state.requests_with_op(op::FLASH_BEGIN)[0];
    // This ROM takes the trailing encryption word
    assert_eq!(begin.payload.len(), 20);
    assert_eq!(
        (begin.word(0), begin.word(1), begin.word(2), begin.word(3)),
        (0x904, 3, 0x400, 0x20000)
    );

    let writes = state.requests_with_op(op::FLASH_DATA);
    assert_eq!(writes.len(), 3);
    for (i, write) in writes.iter().enumerate() {
        assert_eq!(write.word(0), 0x400);
        assert_eq!(write.word(1), i as u32);
        assert_eq!(write.payload.len(), 16 + 0x400);
    }
    assert!(writes[2].payload[16 + 0x104..].iter().all(|&b| b == 0xff));

    assert_eq!(&state.flash[0x20000..0x20901], &data[..]);
    assert_eq!(&state.flash[0x20901..0x20904], &[0xff; 3]);
}

#[test]
fn stub_write_drains_and_closes() {
    let device = FakeDevice::new(Chip::Esp32);
    let stub = test_stub();
    let mut flasher = flasher(&device, stub_config(), Some(&stub));
    device.state().requests.clear();

    let data = firmware(0x6000);
    block_on(flasher.write_bin_to_flash(0x10000, &data, &mut RecordingProgress::default()))
        .unwrap();

    let state = device.state();
    assert_eq!(&state.flash[0x10000..0x16000], &data[..]);

    let begin = &state.requests_with_op(op::FLASH_DEFL_BEGIN)[0];
    assert_eq!(begin.payload.len(), 16);
    assert_eq!((begin.word(0), begin.word(2)), (0x6000, 0x4000));

    let ops = state.ops();
    let last_data = ops
        .iter()
        .rposition(|&op| op == op::FLASH_DEFL_DATA)
        .unwrap();
    assert_eq!(ops[last_data + 1], op::READ_REG);
    assert_eq!(ops[last_data + 2], op::FLASH_MD5);

    // Stub digests are raw bytes, the compare passed. The compressed write
    // is closed with an empty compressed write.
    let tail = &state.requests[state.requests.len() - 2..];
    assert_eq!(tail[0].op, op::FLASH_DEFL_BEGIN);
    assert_eq!((tail[0].word(0), tail[0].word(1)), (0, 0));
    assert_eq!(tail[1].op, op::FLASH_DEFL_END);
    assert_eq!(tail[1].word(0), 1);
    assert!(state.requests_with_op(op::FLASH_END).is_empty());
}

#[test]
fn uncompressed_stub_write_closes_with_flash_end() {
    let device = FakeDevice::new(Chip::Esp32c3);
    let stub = test_stub();
    let config = FlasherConfig {
        compress: false,
        ..stub_config()
    };
    let mut flasher = flasher(&device, config, Some(&stub));
    device.state().requests.clear();

    let data = firmware(0x4800);
    block_on(flasher.write_bin_to_flash(0x20000, &data, &mut RecordingProgress::default()))
        .unwrap();

    let state = device.state();
    assert_eq!(&state.flash[0x20000..0x24800], &data[..]);
    assert!(state.requests_with_op(op::FLASH_DEFL_BEGIN).is_empty());

    let tail = &state.requests[state.requests.len() - 2..];
    assert_eq!(tail[0].op, op::FLASH_BEGIN);
    assert_eq!(tail[0].word(0), 0);
    assert_eq!(tail[1].op, op::FLASH_END);
    assert_eq!(tail[1].word(0), 1);
}

#[test]
fn unchanged_segments_are_skipped() {
    let device = FakeDevice::new(Chip::Esp32);
    let config = FlasherConfig {
        skip: true,
        ..rom_config()
    };
    let mut flasher = flasher(&device, config, None);

    let data = firmware(0x1000);
    {
        let mut state = device.state();
        state.flash[0x8000..0x9000].copy_from_slice(&data);
        state.requests.clear();
    }

    let mut progress = RecordingProgress::default();
    block_on(flasher.write_bin_to_flash(0x8000, &data, &mut progress)).unwrap();

    assert_eq!(progress.events, vec![Progress::Finish(true)]);

    let state = device.state();
    assert_eq!(state.requests_with_op(op::FLASH_MD5).len(), 1);
    assert!(state.requests_with_op(op::FLASH_DEFL_BEGIN).is_empty());
    assert!(state.requests_with_op(op::FLASH_DEFL_DATA).is_empty());
}

#[test]
fn changed_segments_are_written_despite_skip() {
    let device = FakeDevice::new(Chip::Esp32);
    let config = FlasherConfig {
        skip: true,
        ..rom_config()
    };
    let mut flasher = flasher(&device, config, None);

    let data = firmware(0x1000);
    block_on(flasher.write_bin_to_flash(0x8000, &data, &mut RecordingProgress::default()))
        .unwrap();

    let state = device.state();
    assert_eq!(state.requests_with_op(op::FLASH_MD5).len(), 2);
    assert_eq!(&state.flash[0x8000..0x9000], &data[..]);
}

#[test]
fn erasing_needs_the_stub_and_sector_alignment() {
    let device = FakeDevice::new(Chip::Esp32);
    let mut rom = flasher(&device, rom_config(), None);

    let err = block_on(rom.erase_region(0x1000, 0x1000)).unwrap_err();
    assert!(matches!(err, Error::StubRequired(_)));
    assert_eq!(err.kind(), ErrorKind::Capability);
    assert!(matches!(
        block_on(rom.erase_flash()),
        Err(Error::StubRequired(_))
    ));

    let device = FakeDevice::new(Chip::Esp32);
    let stub = test_stub();
    let mut flasher = flasher(&device, stub_config(), Some(&stub));
    device.state().flash[0x3000..0x5000].fill(0x00);
    device.state().requests.clear();

    assert!(matches!(
        block_on(flasher.erase_region(0x3001, 0x1000)),
        Err(Error::InvalidEraseRegion {
            offset: 0x3001,
            size: 0x1000
        })
    ));
    assert!(matches!(
        block_on(flasher.erase_region(0x3000, 0x800)),
        Err(Error::InvalidEraseRegion { .. })
    ));
    assert!(device.state().requests.is_empty());

    block_on(flasher.erase_region(0x3000, 0x1000)).unwrap();
    {
        let state = device.state();
        assert!(state.flash[0x3000..0x4000].iter().all(|&b| b == 0xff));
        assert!(state.flash[0x4000..0x5000].iter().all(|&b| b == 0x00));
    }

    block_on(flasher.erase_flash()).unwrap();
    assert!(device.state().flash.iter().all(|&b| b == 0xff));
}

#[test]
fn reads_flash_through_the_stub() {
    let device = FakeDevice::new(Chip::Esp32s3);
    let stub = test_stub();
    let mut flasher = flasher(&device, stub_config(), Some(&stub));

    let data = firmware(0x1800);
    device.state().flash[0x2000..0x3800].copy_from_slice(&data);

    let mut progress = RecordingProgress::default();
    let read = block_on(flasher.read_flash(0x2000, 0x1800, &mut progress)).unwrap();

    assert_eq!(read, data);
    assert_eq!(device.state().acks, vec![0x1000, 0x1800]);
    assert_eq!(
        progress.events,
        vec![
            Progress::Init(0x2000, 0x1800),
            Progress::Update(0x1000),
            Progress::Update(0x1800),
            Progress::Finish(false),
        ]
    );

    let request = &device.state().requests_with_op(op::READ_FLASH)[0];
    assert_eq!(
        (request.word(0), request.word(1), request.word(2), request.word(3)),
        (0x2000, 0x1800, 0x1000, 64)
    );
}

#[test]
fn corrupted_reads_are_rejected() {
    let device = FakeDevice::new(Chip::Esp32s3);
    let stub = test_stub();
    let mut flasher = flasher(&device, stub_config(), Some(&stub));
    device.state().corrupt_md5 = true;

    let err = block_on(flasher.read_flash(0, 0x1000, &mut RecordingProgress::default()))
        .unwrap_err();
    assert!(matches!(err, Error::VerifyFailed { address: 0, .. }));

    let device = FakeDevice::new(Chip::Esp32s3);
    let mut rom = common::flasher(&device, rom_config(), None);
    assert!(matches!(
        block_on(rom.read_flash(0, 0x1000, &mut RecordingProgress::default())),
        Err(Error::StubRequired(_))
    ));
}

#[test]
fn rom_baud_change_compensates_for_a_26mhz_crystal() {
    let device = FakeDevice::new(Chip::Esp32c2);
    // UART divider of a 26 MHz crystal at 115200 baud
    device.state().registers.insert(0x6000_0014, 226);
    let mut flasher = flasher(&device, rom_config(), None);

    block_on(flasher.change_baud(460_800)).unwrap();

    let state = device.state();
    let change = &state.requests_with_op(op::CHANGE_BAUDRATE)[0];
    assert_eq!((change.word(0), change.word(1)), (460_800 * 40 / 26, 0));
    assert_eq!(state.reconnects, vec![460_800]);
    assert_eq!(flasher.session().baud(), 460_800);
}

#[test]
fn esp8266_rom_writes_raw_and_unverified() {
    let device = FakeDevice::new(Chip::Esp8266);
    let mut flasher = flasher(&device, rom_config(), None);
    assert_eq!(flasher.flash_size(), FlashSize::_4Mb);

    {
        let state = device.state();
        // No SpiAttach or SpiSetParams, an empty FlashBegin attaches instead
        assert!(state.requests_with_op(op::SPI_ATTACH).is_empty());
        assert!(state.requests_with_op(op::SPI_SET_PARAMS).is_empty());
        assert_eq!(state.requests_with_op(op::FLASH_BEGIN)[0].word(0), 0);
    }
    device.state().requests.clear();

    let data = firmware(0x2000);
    let mut progress = RecordingProgress::default();
    block_on(flasher.write_bin_to_flash(0x0, &data, &mut progress)).unwrap();

    let state = device.state();
    let begin = state
        .requests_with_op(op::FLASH_BEGIN)
        .into_iter()
        .find(|r| r.word(1) != 0)
        .unwrap();
    // Two head sectors of a short write erase a single sector
    assert_eq!(
        (begin.word(0), begin.word(1), begin.word(2), begin.word(3)),
        (0x1000, 8, 0x400, 0)
    );
    assert_eq!(begin.payload.len(), 16);

    assert_eq!(state.requests_with_op(op::FLASH_DATA).len(), 8);
    assert!(state.requests_with_op(op::FLASH_DEFL_BEGIN).is_empty());
    assert!(state.requests_with_op(op::FLASH_MD5).is_empty());
    assert!(!progress.events.contains(&Progress::Verifying));
    drop(state);

    let err = block_on(flasher.change_baud(460_800)).unwrap_err();
    assert!(matches!(
        err,
        Error::UnsupportedFeature {
            chip: Chip::Esp8266,
            ..
        }
    ));
    assert!(matches!(
        block_on(flasher.checksum_md5(0, 0x1000)),
        Err(Error::UnsupportedFeature { .. })
    ));
}

#[test]
fn spi_commands_are_bounded() {
    let device = FakeDevice::new(Chip::Esp32);
    let mut flasher = flasher(&device, rom_config(), None);
    let session = flasher.session().clone();
    device.state().requests.clear();

    let err = block_on(spi::run_spiflash_command(
        flasher.connection(),
        &session,
        0x02,
        &[0; 65],
        0,
    ))
    .unwrap_err();
    assert!(matches!(err, Error::SpiPayloadTooLarge(65)));

    let err = block_on(spi::run_spiflash_command(
        flasher.connection(),
        &session,
        0x9f,
        &[],
        33,
    ))
    .unwrap_err();
    assert!(matches!(err, Error::SpiReadTooWide(33)));

    assert!(device.state().requests.is_empty());

    let id = block_on(spi::run_spiflash_command(
        flasher.connection(),
        &session,
        0x9f,
        &[],
        24,
    ))
    .unwrap();
    assert_eq!(id & 0xff_ffff, common::JEDEC_ID_4MB);
}

#[test]
fn flash_size_follows_the_jedec_id() {
    let device = FakeDevice::new(Chip::Esp32s3);
    device.state().jedec_id = 0x18_40ef;
    let flasher = flasher(&device, rom_config(), None);

    assert_eq!(flasher.flash_size(), FlashSize::_16Mb);
    let params = &device.state().requests_with_op(op::SPI_SET_PARAMS)[0];
    assert_eq!(params.word(1), 16 * 1024 * 1024);

    // Unknown capacity bytes fall back to 4 MB
    let device = FakeDevice::new(Chip::Esp32s3);
    device.state().jedec_id = 0x42_40ef;
    let flasher = common::flasher(&device, rom_config(), None);
    assert_eq!(flasher.flash_size(), FlashSize::_4Mb);
}

#[test]
fn absent_flash_fails_to_attach() {
    let device = FakeDevice::new(Chip::Esp32);
    device.state().jedec_id = 0xff_ffff;

    let (_, err) = block_on(Flasher::connect(
        device.connection(ConnectionConfig::default()),
        rom_config(),
        None,
    ))
    .err()
    .unwrap();

    assert!(matches!(err, Error::FlashConnect));
    // Both pin assignments were tried
    assert_eq!(device.state().requests_with_op(op::SPI_ATTACH).len(), 2);
}

#[test]
fn bootloader_header_is_patched() {
    let device = FakeDevice::new(Chip::Esp32);
    let config = FlasherConfig {
        compress: false,
        flash_settings: FlashSettings::new(
            Some(FlashMode::Dio),
            Some(FlashSize::_8Mb),
            Some(FlashFrequency::_80Mhz),
        ),
        ..rom_config()
    };
    let mut flasher = flasher(&device, config, None);

    let mut bootloader = firmware(0x100);
    bootloader[0] = ESP_MAGIC;
    bootloader[2] = FlashMode::Qio.encode();
    bootloader[3] = 0x2f;

    let application = bootloader.clone();
    let segments = [
        Segment::new(0x1000, &bootloader),
        Segment::new(0x10000, &application),
    ];
    block_on(flasher.write_bins_to_flash(&segments, &mut RecordingProgress::default())).unwrap();

    let descriptor = Chip::Esp32.descriptor();
    let size_freq = descriptor.encode_flash_size(FlashSize::_8Mb).unwrap()
        | descriptor
            .encode_flash_frequency(FlashFrequency::_80Mhz)
            .unwrap();

    let state = device.state();
    assert_eq!(state.flash[0x1002], FlashMode::Dio.encode());
    assert_eq!(state.flash[0x1003], size_freq);
    assert_eq!(&state.flash[0x1004..0x1100], &bootloader[4..]);

    // Only the bootloader is touched
    assert_eq!(&state.flash[0x10000..0x10100], &application[..]);
}

#[test]
fn segments_load_into_ram() {
    let device = FakeDevice::new(Chip::Esp32c3);
    let mut flasher = flasher(&device, rom_config(), None);
    device.state().requests.clear();

    let code = firmware(0x1900);
    let segments = [Segment::new(0x4038_0000, &code)];
    let mut progress = RecordingProgress::default();
    block_on(flasher.load_segments_to_ram(&segments, 0x4038_0400, &mut progress)).unwrap();

    let state = device.state();
    assert_eq!(
        state.ops(),
        vec![
            op::MEM_BEGIN,
            op::MEM_DATA,
            op::MEM_DATA,
            op::MEM_END
        ]
    );
    let end = &state.requests_with_op(op::MEM_END)[0];
    assert_eq!((end.word(0), end.word(1)), (0, 0x4038_0400));
    assert_eq!(progress.events.last(), Some(&Progress::Finish(false)));
}
