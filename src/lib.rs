//! A library for flashing Espressif devices over serial, speaking the ROM
//! bootloader protocol.
//!
//! The driver resets the chip into its serial download mode, synchronizes
//! with the on-chip bootloader, optionally uploads a RAM-resident flasher
//! stub, and then streams firmware blocks into SPI flash:
//!
//! ```no_run
//! use esploader::{Flasher, SerialTransport};
//!
//! # fn main() -> Result<(), esploader::Error> {
//! let transport = SerialTransport::open("/dev/ttyUSB0", esploader::ESP_ROM_BAUD)?;
//! let mut flasher = Flasher::new(Box::new(transport));
//!
//! flasher.connect()?;
//! flasher.flash_data(&[0xE9, 0x02, 0x02, 0x00], 0x1000, None, false)?;
//! flasher.flash_finish(true)?;
//! # Ok(())
//! # }
//! ```
//!
//! Supported families: ESP32, ESP32-S2 and ESP8266.

pub use crate::{
    chip::{format_mac, Chip},
    command::{Command, CommandType},
    connection::{CommandResponse, CommandResponseValue, Connection},
    error::{ChipDetectError, ConnectionError, Error, TimedOutCommand},
    flasher::{Flasher, ESP_ROM_BAUD},
    progress::ProgressCallbacks,
    stub::FlashStub,
    transport::{SerialTransport, Transport},
};

pub mod buffer;
mod chip;
mod command;
mod connection;
mod error;
mod flasher;
mod progress;
pub mod reader;
mod stub;
mod transport;
