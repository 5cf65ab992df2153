//! End-to-end protocol scenarios driven over a scripted mock transport.


use std::time::Duration;

use esploader::{
    Chip, Command, CommandResponseValue, CommandType, ConnectionError, Error, Flasher, FlashStub,
    ProgressCallbacks,
};
use mock_device::{ok_response, response, MockDevice};

#[derive(Default)]
struct RecordedProgress {
    init: Option<(u32, usize)>,
    updates: Vec<usize>,
    finished: bool,
}

impl ProgressCallbacks for RecordedProgress {
    fn init(&mut self, addr: u32, total: usize) {
        self.init = Some((addr, total));
    }

    fn update(&mut self, current: usize) {
        self.updates.push(current);
    }

    fn finish(&mut self) {
        self.finished = true;
    }
}

const ESP32_MAGIC: u32 = 0x00F0_1D83;

fn flasher_for(device: &MockDevice) -> Flasher {
    let mut flasher = Flasher::new(Box::new(device.clone()));
    flasher.connection().start_reader().unwrap();
    flasher
}

fn enqueue_chip_detect(device: &MockDevice) {
    device.enqueue(ok_response(CommandType::ReadReg as u8, ESP32_MAGIC));
}

#[test]
fn detects_esp32_from_magic_register() {
    let device = MockDevice::new();
    enqueue_chip_detect(&device);

    let mut flasher = flasher_for(&device);
    assert_eq!(flasher.chip().unwrap(), Chip::Esp32);

    // the classification is cached, no second READ_REG goes out
    assert_eq!(flasher.chip().unwrap(), Chip::Esp32);
    assert_eq!(device.sent_opcodes(), [CommandType::ReadReg as u8]);

    let sent = device.sent();
    assert_eq!(sent[0].payload, 0x4000_1000u32.to_le_bytes());
}

#[test]
fn sync_frame_is_bit_exact() {
    let device = MockDevice::new();
    device.enqueue(ok_response(CommandType::Sync as u8, 0));

    let mut flasher = flasher_for(&device);
    assert!(flasher.connection().sync().unwrap());

    let mut expected = vec![0xC0, 0x00, 0x08, 0x24, 0x00, 0x00, 0x00, 0x00, 0x00];
    expected.extend([0x07, 0x07, 0x12, 0x20]);
    expected.extend([0x55; 32]);
    expected.push(0xC0);

    assert_eq!(device.sent()[0].raw, expected);
}

#[test]
fn sync_rejects_nonzero_status() {
    let device = MockDevice::new();
    device.enqueue(response(CommandType::Sync as u8, 0, &[0x01, 0x05]));

    let mut flasher = flasher_for(&device);
    assert!(!flasher.connection().sync().unwrap());
}

#[test]
fn connect_pulses_reset_lines_and_syncs() {
    let device = MockDevice::new();
    device.enqueue(ok_response(CommandType::Sync as u8, 0));
    enqueue_chip_detect(&device);

    let mut flasher = Flasher::new(Box::new(device.clone()));
    flasher.connect().unwrap();

    let signals = device.0.lock().unwrap().signals.clone();
    assert_eq!(
        signals,
        [(false, true), (true, false), (false, false)],
        "reset pulse must release both lines at the end"
    );
    assert_eq!(
        device.sent_opcodes(),
        [CommandType::Sync as u8, CommandType::ReadReg as u8]
    );
}

#[test]
fn check_command_returns_data_only_when_longer_than_value() {
    let device = MockDevice::new();
    let mut flasher = flasher_for(&device);

    device.enqueue(response(CommandType::ReadReg as u8, 7, &[0, 0, 0, 0]));
    let short = flasher
        .connection()
        .check_command(
            Command::ReadReg { address: 0x0 },
            Duration::from_millis(500),
        )
        .unwrap();
    assert!(matches!(short, CommandResponseValue::Value(7)));

    device.enqueue(response(
        CommandType::ReadReg as u8,
        7,
        &[1, 2, 3, 4, 5, 6],
    ));
    let long = flasher
        .connection()
        .check_command(
            Command::ReadReg { address: 0x0 },
            Duration::from_millis(500),
        )
        .unwrap();
    assert!(matches!(long, CommandResponseValue::Data(data) if data == [1, 2, 3, 4, 5, 6]));
}

#[test]
fn write_reg_defaults_to_full_mask() {
    let device = MockDevice::new();
    device.enqueue(ok_response(CommandType::WriteReg as u8, 0));

    let mut flasher = flasher_for(&device);
    flasher
        .connection()
        .write_reg(0x6000_8090, 0x0, None)
        .unwrap();

    let mut expected = Vec::new();
    for word in [0x6000_8090u32, 0x0, 0xFFFF_FFFF, 0x0] {
        expected.extend(word.to_le_bytes());
    }
    assert_eq!(device.sent()[0].payload, expected);
}

#[test]
fn mismatched_opcode_in_response_is_an_error() {
    let device = MockDevice::new();
    device.enqueue(ok_response(CommandType::FlashEnd as u8, 0));

    let mut flasher = flasher_for(&device);
    let err = flasher.connection().read_reg(0x1000).unwrap_err();
    assert!(matches!(
        err,
        Error::Connection(ConnectionError::InvalidResponse { received: 0x04, .. })
    ));
}

#[test]
fn flash_small_image_pads_and_checksums_block() {
    let device = MockDevice::new();
    enqueue_chip_detect(&device);
    device.enqueue(ok_response(CommandType::SpiAttach as u8, 0));
    device.enqueue(ok_response(CommandType::SpiSetParams as u8, 0));
    device.enqueue(ok_response(CommandType::FlashBegin as u8, 0));
    device.enqueue(ok_response(CommandType::FlashData as u8, 0));

    let data = [0xAAu8; 0x0A];
    let mut progress = RecordedProgress::default();
    let mut flasher = flasher_for(&device);
    flasher
        .flash_data(&data, 0x1000, Some(&mut progress), false)
        .unwrap();

    assert_eq!(progress.init, Some((0x1000, 1)));
    assert_eq!(progress.updates, [0]);
    assert!(progress.finished);

    let sent = device.sent();
    assert_eq!(
        device.sent_opcodes(),
        [
            CommandType::ReadReg as u8,
            CommandType::SpiAttach as u8,
            CommandType::SpiSetParams as u8,
            CommandType::FlashBegin as u8,
            CommandType::FlashData as u8,
        ]
    );

    // SPI_ATTACH carries eight zero bytes on the ROM loader
    assert_eq!(sent[1].payload, [0u8; 8]);

    // SPI_SET_PARAMS announces the configured 4MB flash geometry
    let mut spi_params = Vec::new();
    for word in [0u32, 0x40_0000, 0x10000, 4096, 256, 0xFFFF] {
        spi_params.extend(word.to_le_bytes());
    }
    assert_eq!(sent[2].payload, spi_params);

    // FLASH_BEGIN: size padded to 4, one 0x200 block at the given offset
    let mut begin = Vec::new();
    for word in [0x0Cu32, 1, 0x200, 0x1000] {
        begin.extend(word.to_le_bytes());
    }
    assert_eq!(sent[3].payload, begin);

    // FLASH_DATA: block header + 0x200 bytes of data padded with 0xFF
    let block = &sent[4].payload[16..];
    assert_eq!(block.len(), 0x200);
    assert_eq!(&block[..0x0A], &data[..]);
    assert!(block[0x0A..].iter().all(|&b| b == 0xFF));

    let mut header = Vec::new();
    for word in [0x200u32, 0, 0, 0] {
        header.extend(word.to_le_bytes());
    }
    assert_eq!(&sent[4].payload[..16], header);

    let expected_checksum = block.iter().fold(0xEFu8, |acc, &b| acc ^ b);
    assert_eq!(sent[4].checksum, expected_checksum as u32);
}

#[test]
fn stub_handshake_flips_state_and_clears_caches() {
    let device = MockDevice::new();
    enqueue_chip_detect(&device);

    // text upload: begin + one block; data upload: begin + one block
    device.enqueue(ok_response(CommandType::MemBegin as u8, 0));
    device.enqueue(ok_response(CommandType::MemData as u8, 0));
    device.enqueue(ok_response(CommandType::MemBegin as u8, 0));
    device.enqueue(ok_response(CommandType::MemData as u8, 0));

    // MEM_END is acknowledged, then the freshly-booted stub says hi
    let mut mem_end = ok_response(CommandType::MemEnd as u8, 0);
    mem_end.extend([0xC0, b'O', b'H', b'A', b'I', 0xC0]);
    device.enqueue(mem_end);

    let stub = FlashStub::from_parts(
        0x4009_E5F0,
        0x4009_E000,
        &[0x11; 32],
        0x3FFD_0000,
        &[0x22; 8],
    );

    let mut flasher = flasher_for(&device);
    flasher.load_stub(Some(stub)).unwrap();
    assert!(flasher.is_stub());

    let mem_begin = &device.sent()[1];
    let mut expected = Vec::new();
    for word in [32u32, 1, 0x1800, 0x4009_E000] {
        expected.extend(word.to_le_bytes());
    }
    assert_eq!(mem_begin.payload, expected);

    // chip cache was invalidated: asking again reaches for the register
    enqueue_chip_detect(&device);
    flasher.chip().unwrap();
    let read_regs = device
        .sent_opcodes()
        .iter()
        .filter(|&&op| op == CommandType::ReadReg as u8)
        .count();
    assert_eq!(read_regs, 2);

    // loading over the stub's own text range is refused outright
    let err = flasher.mem_begin(0x100, 1, 0x100, 0x4009_E010).unwrap_err();
    assert!(matches!(err, Error::StubOverlap { .. }));
}

#[test]
fn wrong_stub_greeting_fails_the_handshake() {
    let device = MockDevice::new();
    enqueue_chip_detect(&device);
    device.enqueue(ok_response(CommandType::MemBegin as u8, 0));
    device.enqueue(ok_response(CommandType::MemData as u8, 0));

    let mut mem_end = ok_response(CommandType::MemEnd as u8, 0);
    mem_end.extend([0xC0, b'N', b'O', b'P', b'E', 0xC0]);
    device.enqueue(mem_end);

    let stub = FlashStub::from_parts(0x4009_E5F0, 0x4009_E000, &[0x11; 16], 0x3FFD_0000, &[]);

    let mut flasher = flasher_for(&device);
    let err = flasher.load_stub(Some(stub)).unwrap_err();
    assert!(matches!(
        err,
        Error::Connection(ConnectionError::InvalidStubHandshake)
    ));
    assert!(!flasher.is_stub());
}

#[test]
fn mem_finish_swallows_missing_ack_under_rom() {
    let device = MockDevice::new();
    let mut flasher = flasher_for(&device);

    // no scripted response: the ROM jumped to the entry point instead of
    // acknowledging, which must not surface as an error
    flasher.mem_finish(0x4009_E5F0).unwrap();
    assert_eq!(device.sent_opcodes(), [CommandType::MemEnd as u8]);
}

#[test]
fn change_baud_payload_and_reader_cycle() {
    let device = MockDevice::new();
    device.enqueue(ok_response(CommandType::ChangeBaud as u8, 0));

    let mut flasher = flasher_for(&device);
    flasher.change_baud(921_600).unwrap();

    let sent = device.sent();
    let mut expected = Vec::new();
    for word in [921_600u32, 0] {
        expected.extend(word.to_le_bytes());
    }
    assert_eq!(sent[0].payload, expected, "ROM loader sends prior baud 0");

    let state = device.0.lock().unwrap();
    assert_eq!(state.bauds, [921_600]);
    assert_eq!(
        state.reader_handles, 2,
        "reader must be restarted around the baud change"
    );
}

#[test]
fn erase_flash_requires_the_stub() {
    let device = MockDevice::new();
    let mut flasher = flasher_for(&device);

    let err = flasher.erase_flash().unwrap_err();
    assert!(matches!(
        err,
        Error::StubRequired(CommandType::EraseFlash)
    ));
    assert!(device.sent().is_empty());
}

#[test]
fn flash_finish_reannounces_before_flash_end() {
    let device = MockDevice::new();
    enqueue_chip_detect(&device);
    device.enqueue(ok_response(CommandType::SpiAttach as u8, 0));
    device.enqueue(ok_response(CommandType::SpiSetParams as u8, 0));
    device.enqueue(ok_response(CommandType::FlashBegin as u8, 0));
    device.enqueue(ok_response(CommandType::FlashEnd as u8, 0));

    let mut flasher = flasher_for(&device);
    flasher.flash_finish(true).unwrap();

    let sent = device.sent();
    let flash_end = sent.last().unwrap();
    assert_eq!(flash_end.opcode, CommandType::FlashEnd as u8);
    // reboot is encoded as zero
    assert_eq!(flash_end.payload, [0, 0, 0, 0]);
}

#[test]
fn efuses_are_read_once_and_drive_mac_derivation() {
    let device = MockDevice::new();
    enqueue_chip_detect(&device);

    // four eFuse words starting at the ESP32 base
    device.enqueue(ok_response(CommandType::ReadReg as u8, 0x0000_0000));
    device.enqueue(ok_response(CommandType::ReadReg as u8, 0xC400_0110));
    device.enqueue(ok_response(CommandType::ReadReg as u8, 0x0000_240A));
    device.enqueue(ok_response(CommandType::ReadReg as u8, 0x0000_0000));

    let mut flasher = flasher_for(&device);
    assert_eq!(
        flasher.mac_addr().unwrap(),
        [0x24, 0x0A, 0xC4, 0x00, 0x01, 0x10]
    );
    assert_eq!(flasher.chip_name().unwrap(), "ESP32");

    // chip detect + four eFuse words, served from the cache afterwards
    let sent = device.sent();
    assert_eq!(sent.len(), 5);
    for (n, command) in sent[1..].iter().enumerate() {
        let address = 0x6001_A000u32 + 4 * n as u32;
        assert_eq!(command.payload, address.to_le_bytes());
    }
}

#[test]
fn hard_reset_pulses_rts() {
    let device = MockDevice::new();
    let mut flasher = flasher_for(&device);
    flasher.hard_reset().unwrap();

    let signals = device.0.lock().unwrap().signals.clone();
    assert_eq!(signals, [(false, true), (false, false)]);
}

#[test]
fn disconnect_returns_reader_error_instead_of_raising() {
    let device = MockDevice::new();
    let mut flasher = flasher_for(&device);

    assert!(flasher.disconnect().is_none());
    // a second disconnect is a no-op
    assert!(flasher.disconnect().is_none());
}
