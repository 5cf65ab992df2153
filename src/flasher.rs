//! High-level flashing operations
//!
//! [Flasher] drives the whole download-mode session: reset and sync, chip
//! detection, the flash and memory write state machines, stub upload, baud
//! changes and chip erase.

use std::{ops::Range, time::Duration};

use log::debug;

use crate::{
    chip::{Chip, CHIP_DETECT_MAGIC_REG_ADDR},
    command::{Command, CommandType, DEFAULT_TIMEOUT},
    connection::Connection,
    error::{ConnectionError, Error},
    progress::ProgressCallbacks,
    stub::FlashStub,
    transport::Transport,
};

/// Baud rate every ROM loader starts out at.
pub const ESP_ROM_BAUD: u32 = 115_200;

pub(crate) const FLASH_SECTOR_SIZE: u32 = 0x1000;
const FLASH_SECTORS_PER_BLOCK: u32 = 16;

/// Write size once the stub loader is running.
const STUB_FLASH_WRITE_SIZE: usize = 0x4000;
/// Block size for writes into RAM.
const MAX_RAM_BLOCK_SIZE: usize = 0x1800;

/// Per-block timeout for `FLASH_DATA`.
const BLOCK_WRITE_TIMEOUT: Duration = Duration::from_secs(2);

const DEFAULT_FLASH_SIZE: u32 = 0x40_0000;

const EXPECTED_STUB_HANDSHAKE: &str = "OHAI";

/// Driver for one attached device.
///
/// Operations take `&mut self` and must not be interleaved; the borrow
/// checker enforces this within safe code.
pub struct Flasher {
    /// Connection for bootloader commands
    connection: Connection,
    /// Detected chip family, reset when the stub takes over
    chip: Option<Chip>,
    /// Cached eFuse words, reset when the stub takes over
    efuses: Option<[u32; 4]>,
    /// Indicate RAM stub loader is in use
    use_stub: bool,
    /// RAM ranges occupied by the running stub
    stub_segments: Vec<Range<u32>>,
    /// Size of the attached SPI flash, reported to the ROM before writes
    flash_size: u32,
}

impl Flasher {
    /// Wrap an already-open transport. No traffic happens until
    /// [connect](Flasher::connect).
    pub fn new(transport: Box<dyn Transport>) -> Self {
        Flasher {
            connection: Connection::new(transport, ESP_ROM_BAUD),
            chip: None,
            efuses: None,
            use_stub: false,
            stub_segments: Vec::new(),
            flash_size: DEFAULT_FLASH_SIZE,
        }
    }

    /// Reset the device into download mode, sync with the ROM loader and
    /// detect the chip family.
    pub fn connect(&mut self) -> Result<(), Error> {
        self.connection.begin()?;

        let chip = self.chip()?;
        debug!("Connected to {}", chip);

        Ok(())
    }

    /// Stop the background reader and return the error it terminated with,
    /// if any. The transport itself stays open.
    pub fn disconnect(&mut self) -> Option<ConnectionError> {
        self.connection.stop_reader()
    }

    /// The active serial connection being used by the flasher
    pub fn connection(&mut self) -> &mut Connection {
        &mut self.connection
    }

    /// Is the RAM stub loader running?
    pub fn is_stub(&self) -> bool {
        self.use_stub
    }

    /// Override the flash size announced through `SPI_SET_PARAMS`.
    pub fn set_flash_size(&mut self, flash_size: u32) {
        self.flash_size = flash_size;
    }

    /// The chip family on the other end of the link, detected once and
    /// cached.
    pub fn chip(&mut self) -> Result<Chip, Error> {
        if let Some(chip) = self.chip {
            return Ok(chip);
        }

        let magic = self.connection.read_reg(CHIP_DETECT_MAGIC_REG_ADDR)?;
        let chip = Chip::from_magic(magic)?;
        self.chip = Some(chip);

        Ok(chip)
    }

    /// The chip's eFuse block, read once and cached.
    pub fn efuses(&mut self) -> Result<[u32; 4], Error> {
        if let Some(efuses) = self.efuses {
            return Ok(efuses);
        }

        let base = self.chip()?.into_target().efuse_reg();
        let mut words = [0u32; 4];
        for (n, word) in words.iter_mut().enumerate() {
            *word = self.connection.read_reg(base + 4 * n as u32)?;
        }
        self.efuses = Some(words);

        Ok(words)
    }

    /// Marketing name of the connected chip, refined by eFuse bits.
    pub fn chip_name(&mut self) -> Result<&'static str, Error> {
        let target = self.chip()?.into_target();
        let efuses = self.efuses()?;

        Ok(target.chip_name(&efuses))
    }

    /// Factory MAC address of the connected chip.
    pub fn mac_addr(&mut self) -> Result<[u8; 6], Error> {
        let target = self.chip()?.into_target();
        let efuses = self.efuses()?;

        target.mac_address(&efuses)
    }

    /// Write an image into SPI flash at `offset`.
    ///
    /// The image is padded with `0xFF` to the ROM's alignment, split into
    /// write-size blocks and streamed through `FLASH_DATA`.
    pub fn flash_data(
        &mut self,
        data: &[u8],
        offset: u32,
        mut progress: Option<&mut dyn ProgressCallbacks>,
        encrypted: bool,
    ) -> Result<(), Error> {
        let alignment = if encrypted { 32 } else { 4 };
        let mut image = data.to_vec();
        let padded_len = image.len().div_ceil(alignment) * alignment;
        image.resize(padded_len, 0xFF);

        let (blocks, block_size) = self.flash_begin(image.len() as u32, offset, encrypted)?;

        if let Some(cb) = progress.as_mut() {
            cb.init(offset, blocks);
        }

        for (sequence, chunk) in image.chunks(block_size).enumerate() {
            if let Some(cb) = progress.as_mut() {
                cb.update(sequence);
            }

            let mut block = chunk.to_vec();
            block.resize(block_size, 0xFF);
            self.flash_block(&block, sequence as u32)?;
        }

        if let Some(cb) = progress.as_mut() {
            cb.finish();
        }

        // Under the stub a final register read acts as a fence for the last
        // block before FLASH_END or a reset.
        if self.use_stub {
            self.connection.read_reg(CHIP_DETECT_MAGIC_REG_ADDR)?;
        }

        Ok(())
    }

    /// Announce an upcoming flash write, triggering the erase.
    ///
    /// Returns the block count and write size for the data phase.
    pub fn flash_begin(
        &mut self,
        size: u32,
        offset: u32,
        encrypted: bool,
    ) -> Result<(usize, usize), Error> {
        let chip = self.chip()?;
        let target = chip.into_target();

        if chip != Chip::Esp8266 {
            self.connection
                .check_command(Command::SpiAttach, CommandType::SpiAttach.timeout())?;
        }
        if chip == Chip::Esp32 {
            self.connection.check_command(
                Command::SpiSetParams {
                    flash_size: self.flash_size,
                },
                CommandType::SpiSetParams.timeout(),
            )?;
        }

        let block_size = if self.use_stub {
            STUB_FLASH_WRITE_SIZE
        } else {
            target.flash_write_size()
        };
        let blocks = (size as usize).div_ceil(block_size);

        // The ESP8266 ROM erases more than asked around block boundaries;
        // shrink the announced size to compensate.
        let erase_size = if chip == Chip::Esp8266 {
            get_erase_size(offset, size)
        } else {
            size
        };

        // The stub erases lazily, so only the ROM needs the size-scaled
        // timeout here.
        let timeout = if self.use_stub {
            DEFAULT_TIMEOUT
        } else {
            CommandType::FlashBegin.timeout_for_size(size)
        };

        debug!(
            "Erasing {:#x} bytes at {:#010x}, writing {} blocks of {:#x}",
            erase_size, offset, blocks, block_size
        );

        self.connection.check_command(
            Command::FlashBegin {
                erase_size,
                blocks: blocks as u32,
                block_size: block_size as u32,
                offset,
                encrypted: target.takes_encrypted_flag().then_some(encrypted),
            },
            timeout,
        )?;

        Ok((blocks, block_size))
    }

    /// Write one block. `block` must already be padded to the write size.
    pub fn flash_block(&mut self, block: &[u8], sequence: u32) -> Result<(), Error> {
        self.connection.check_command(
            Command::FlashData {
                data: block,
                sequence,
            },
            BLOCK_WRITE_TIMEOUT,
        )?;

        Ok(())
    }

    /// Leave flash mode, optionally rebooting into the written image.
    pub fn flash_finish(&mut self, reboot: bool) -> Result<(), Error> {
        self.flash_begin(0, 0, false)?;
        self.connection
            .check_command(Command::FlashEnd { reboot }, CommandType::FlashEnd.timeout())?;

        Ok(())
    }

    /// Announce an upcoming write into RAM.
    pub fn mem_begin(
        &mut self,
        size: u32,
        blocks: u32,
        block_size: u32,
        offset: u32,
    ) -> Result<(), Error> {
        if self.use_stub {
            let load = offset..offset.saturating_add(size);
            for segment in &self.stub_segments {
                if load.start < segment.end && segment.start < load.end {
                    return Err(Error::StubOverlap {
                        offset: load.start,
                        end: load.end,
                    });
                }
            }
        }

        self.connection.check_command(
            Command::MemBegin {
                size,
                blocks,
                block_size,
                offset,
            },
            CommandType::MemBegin.timeout(),
        )?;

        Ok(())
    }

    /// Write one RAM block.
    pub fn mem_block(&mut self, data: &[u8], sequence: u32) -> Result<(), Error> {
        self.connection.check_command(
            Command::MemData { data, sequence },
            CommandType::MemData.timeout(),
        )?;

        Ok(())
    }

    /// Finish a RAM write, jumping to `entry` when it is non-zero.
    ///
    /// The ROM loader frequently jumps before acknowledging, so its errors
    /// are logged and dropped; under the stub they are real failures.
    pub fn mem_finish(&mut self, entry: u32) -> Result<(), Error> {
        let result = self
            .connection
            .check_command(Command::MemEnd { entry }, CommandType::MemEnd.timeout());

        match result {
            Err(err) if !self.use_stub => {
                debug!("MEM_END not acknowledged by the ROM loader: {err:#}");
                Ok(())
            }
            other => other.map(|_| ()),
        }
    }

    /// Upload the flasher stub into RAM and hand control to it.
    ///
    /// Uses the built-in stub for the detected chip when none is supplied.
    pub fn load_stub(&mut self, stub: Option<FlashStub>) -> Result<(), Error> {
        if self.use_stub {
            return Ok(());
        }

        let stub = match stub {
            Some(stub) => stub,
            None => FlashStub::get(self.chip()?)?,
        };

        let mut segments = Vec::new();
        for (name, (start, bytes)) in [("text", stub.text()), ("data", stub.data())] {
            if bytes.is_empty() {
                continue;
            }
            debug!("Writing {} byte stub {}", bytes.len(), name);

            let blocks = bytes.len().div_ceil(MAX_RAM_BLOCK_SIZE);
            self.mem_begin(
                bytes.len() as u32,
                blocks as u32,
                MAX_RAM_BLOCK_SIZE as u32,
                start,
            )?;
            for (sequence, chunk) in bytes.chunks(MAX_RAM_BLOCK_SIZE).enumerate() {
                self.mem_block(chunk, sequence as u32)?;
            }
            segments.push(start..start + bytes.len() as u32);
        }

        debug!("Running stub at {:#010x}", stub.entry());

        // Capture the greeting the stub prints right after it boots. The
        // listener must outlive mem_finish so the packet cannot be dropped.
        let listen = self.connection.listen()?;
        self.mem_finish(stub.entry())?;
        let handshake = self
            .connection
            .read_packet(EXPECTED_STUB_HANDSHAKE.len(), DEFAULT_TIMEOUT)?;
        drop(listen);

        if handshake != EXPECTED_STUB_HANDSHAKE.as_bytes() {
            return Err(Error::Connection(ConnectionError::InvalidStubHandshake));
        }

        // The stub remaps what the detection and eFuse registers return, so
        // both caches go stale the moment it takes over.
        self.use_stub = true;
        self.chip = None;
        self.efuses = None;
        self.stub_segments = segments;

        debug!("Stub running");

        Ok(())
    }

    /// Negotiate a new link speed with the device, then reopen our side at
    /// the same rate.
    pub fn change_baud(&mut self, baud: u32) -> Result<(), Error> {
        debug!("Change baud to: {}", baud);

        let prior_baud = match self.use_stub {
            true => self.connection.baud(),
            false => 0,
        };

        self.connection.check_command(
            Command::ChangeBaud {
                new_baud: baud,
                prior_baud,
            },
            CommandType::ChangeBaud.timeout(),
        )?;

        self.connection.set_baud(baud)?;
        self.connection
            .wait_silent(10, Duration::from_millis(200))?;

        Ok(())
    }

    /// Erase the entire flash chip. Stub only.
    pub fn erase_flash(&mut self) -> Result<(), Error> {
        if !self.use_stub {
            return Err(Error::StubRequired(CommandType::EraseFlash));
        }

        self.connection
            .check_command(Command::EraseFlash, CommandType::EraseFlash.timeout())?;

        Ok(())
    }

    /// Reset the device back into its application.
    pub fn hard_reset(&mut self) -> Result<(), Error> {
        self.connection.hard_reset()
    }
}

/// Size to announce through `FLASH_BEGIN` on the ESP8266.
///
/// Its ROM loader erases the announced region plus the remainder of the
/// first 64KB block, so the announced size is shrunk to end up with the
/// correct total.
pub(crate) fn get_erase_size(offset: u32, size: u32) -> u32 {
    let num_sectors = size.div_ceil(FLASH_SECTOR_SIZE);
    let start_sector = offset / FLASH_SECTOR_SIZE;

    let head_sectors = u32::min(
        FLASH_SECTORS_PER_BLOCK - (start_sector % FLASH_SECTORS_PER_BLOCK),
        num_sectors,
    );

    if num_sectors < 2 * head_sectors {
        (num_sectors + 1) / 2 * FLASH_SECTOR_SIZE
    } else {
        (num_sectors - head_sectors) * FLASH_SECTOR_SIZE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn erase_size_shrinks_near_block_boundaries() {
        // 8 sectors starting one sector into a 16-sector block
        assert_eq!(get_erase_size(0x1000, 0x8000), 0x4000);
        // aligned writes lose one full head block
        assert_eq!(get_erase_size(0, 0x20000), 0x10000);
        // tiny writes round up to half a sector pair
        assert_eq!(get_erase_size(0, 1), 0x1000);
    }

    #[test]
    fn erase_size_is_sector_aligned() {
        for (offset, size) in [(0, 0x1234), (0x3000, 0x7FFF), (0xF000, 0x10001)] {
            assert_eq!(get_erase_size(offset, size) % FLASH_SECTOR_SIZE, 0);
        }
    }
}
