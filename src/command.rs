//! ROM bootloader protocol commands

use std::time::Duration;

use strum::Display;

use crate::buffer::ByteBuffer;

pub(crate) const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3);
/// Hard cap applied to every command timeout.
pub(crate) const MAX_TIMEOUT: Duration = Duration::from_secs(600);
const ERASE_CHIP_TIMEOUT: Duration = Duration::from_secs(300);
const ERASE_TIMEOUT_PER_MB: Duration = Duration::from_secs(30);
const MEM_END_TIMEOUT: Duration = Duration::from_millis(50);
const SYNC_TIMEOUT: Duration = Duration::from_millis(100);

pub(crate) const CHECKSUM_INIT: u8 = 0xEF;

pub(crate) fn checksum(data: &[u8], mut checksum: u8) -> u8 {
    for byte in data {
        checksum ^= *byte;
    }

    checksum
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Display)]
#[repr(u8)]
#[non_exhaustive]
pub enum CommandType {
    FlashBegin = 0x02,
    FlashData = 0x03,
    FlashEnd = 0x04,
    MemBegin = 0x05,
    MemEnd = 0x06,
    MemData = 0x07,
    Sync = 0x08,
    WriteReg = 0x09,
    ReadReg = 0x0A,
    SpiSetParams = 0x0B,
    SpiAttach = 0x0D,
    ChangeBaud = 0x0F,
    // Supported by the stub only
    EraseFlash = 0xD0,
}

impl CommandType {
    pub fn timeout(&self) -> Duration {
        match self {
            CommandType::MemEnd => MEM_END_TIMEOUT,
            CommandType::Sync => SYNC_TIMEOUT,
            CommandType::EraseFlash => ERASE_CHIP_TIMEOUT,
            _ => DEFAULT_TIMEOUT,
        }
    }

    /// Timeout scaled to the amount of flash affected, for commands that
    /// trigger an erase.
    pub fn timeout_for_size(&self, size: u32) -> Duration {
        match self {
            CommandType::FlashBegin => {
                let mb = size as f64 / 1_000_000.0;
                Duration::max(
                    DEFAULT_TIMEOUT,
                    Duration::from_millis((ERASE_TIMEOUT_PER_MB.as_millis() as f64 * mb) as u64),
                )
            }
            _ => self.timeout(),
        }
    }
}

#[derive(Copy, Clone, Debug)]
#[non_exhaustive]
pub enum Command<'a> {
    FlashBegin {
        erase_size: u32,
        blocks: u32,
        block_size: u32,
        offset: u32,
        /// `Some` on chips whose ROM takes a trailing encryption word.
        encrypted: Option<bool>,
    },
    FlashData {
        data: &'a [u8],
        sequence: u32,
    },
    FlashEnd {
        reboot: bool,
    },
    MemBegin {
        size: u32,
        blocks: u32,
        block_size: u32,
        offset: u32,
    },
    MemData {
        data: &'a [u8],
        sequence: u32,
    },
    MemEnd {
        entry: u32,
    },
    Sync,
    WriteReg {
        address: u32,
        value: u32,
        mask: Option<u32>,
    },
    ReadReg {
        address: u32,
    },
    SpiSetParams {
        flash_size: u32,
    },
    SpiAttach,
    ChangeBaud {
        /// New baud rate
        new_baud: u32,
        /// Prior baud rate ('0' for ROM flasher)
        prior_baud: u32,
    },
    EraseFlash,
}

impl Command<'_> {
    pub fn command_type(&self) -> CommandType {
        match self {
            Command::FlashBegin { .. } => CommandType::FlashBegin,
            Command::FlashData { .. } => CommandType::FlashData,
            Command::FlashEnd { .. } => CommandType::FlashEnd,
            Command::MemBegin { .. } => CommandType::MemBegin,
            Command::MemData { .. } => CommandType::MemData,
            Command::MemEnd { .. } => CommandType::MemEnd,
            Command::Sync => CommandType::Sync,
            Command::WriteReg { .. } => CommandType::WriteReg,
            Command::ReadReg { .. } => CommandType::ReadReg,
            Command::SpiSetParams { .. } => CommandType::SpiSetParams,
            Command::SpiAttach => CommandType::SpiAttach,
            Command::ChangeBaud { .. } => CommandType::ChangeBaud,
            Command::EraseFlash => CommandType::EraseFlash,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.command_type().timeout()
    }

    /// Checksum word for the command header. Only the block-data commands
    /// carry one; everything else sends zero.
    pub fn checksum(&self) -> u32 {
        match self {
            Command::FlashData { data, .. } | Command::MemData { data, .. } => {
                checksum(data, CHECKSUM_INIT) as u32
            }
            _ => 0,
        }
    }

    /// Serialize the command payload (everything after the checksum word).
    pub fn write_payload(&self, buffer: &mut ByteBuffer) {
        match *self {
            Command::FlashBegin {
                erase_size,
                blocks,
                block_size,
                offset,
                encrypted,
            } => {
                buffer.pack("<IIII", &[erase_size, blocks, block_size, offset]);
                if let Some(encrypted) = encrypted {
                    buffer.pack("<I", &[encrypted as u32]);
                }
            }
            Command::FlashData { data, sequence } | Command::MemData { data, sequence } => {
                buffer.pack("<IIII", &[data.len() as u32, sequence, 0, 0]);
                buffer.copy(data);
            }
            Command::FlashEnd { reboot } => {
                buffer.pack("<I", &[if reboot { 0 } else { 1 }]);
            }
            Command::MemBegin {
                size,
                blocks,
                block_size,
                offset,
            } => {
                buffer.pack("<IIII", &[size, blocks, block_size, offset]);
            }
            Command::MemEnd { entry } => {
                buffer.pack("<II", &[if entry == 0 { 1 } else { 0 }, entry]);
            }
            Command::Sync => {
                buffer.copy(&[0x07, 0x07, 0x12, 0x20]);
                buffer.fill(0x55, 32);
            }
            Command::WriteReg {
                address,
                value,
                mask,
            } => {
                buffer.pack("<IIII", &[address, value, mask.unwrap_or(0xFFFF_FFFF), 0]);
            }
            Command::ReadReg { address } => {
                buffer.pack("<I", &[address]);
            }
            Command::SpiSetParams { flash_size } => {
                buffer.pack("<IIIIII", &[0, flash_size, 0x10000, 4096, 256, 0xFFFF]);
            }
            Command::SpiAttach => {
                buffer.fill(0, 8);
            }
            Command::ChangeBaud {
                new_baud,
                prior_baud,
            } => {
                buffer.pack("<II", &[new_baud, prior_baud]);
            }
            Command::EraseFlash => {}
        }
    }
}
