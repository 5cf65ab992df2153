//! RAM stub loader support
//!
//! The stub is an opaque pair of `text`/`data` images plus an entry point,
//! uploaded into the chip's RAM to replace the ROM loader's flash routines
//! with faster ones. Records are stored as TOML with base64-encoded
//! sections, converted from the JSON shipped by `esptool.py`.

use base64::{engine::general_purpose, Engine as _};
use serde::Deserialize;

use crate::{chip::Chip, error::Error};

const STUB_32: &str = include_str!("../resources/stubs/esp32.toml");

/// Flash stub image for one chip family.
#[derive(Debug, Clone, Deserialize)]
pub struct FlashStub {
    /// Entry point (address)
    entry: u32,
    /// Text (base64 encoded)
    text: String,
    /// Start of text section address
    text_start: u32,
    /// Data (base64 encoded)
    data: String,
    /// Start of data section address
    data_start: u32,
}

impl FlashStub {
    /// Fetch the built-in flash stub for the provided chip.
    ///
    /// Only the ESP32 ships with one; supply your own [FlashStub] for the
    /// other families.
    pub fn get(chip: Chip) -> Result<FlashStub, Error> {
        let s = match chip {
            Chip::Esp32 => STUB_32,
            _ => return Err(Error::UnsupportedChip(chip)),
        };

        let stub: FlashStub = toml::from_str(s).unwrap();

        Ok(stub)
    }

    /// Build a stub record from raw section bytes.
    pub fn from_parts(
        entry: u32,
        text_start: u32,
        text: &[u8],
        data_start: u32,
        data: &[u8],
    ) -> Self {
        FlashStub {
            entry,
            text: general_purpose::STANDARD.encode(text),
            text_start,
            data: general_purpose::STANDARD.encode(data),
            data_start,
        }
    }

    /// Fetch stub entry point
    pub fn entry(&self) -> u32 {
        self.entry
    }

    /// Fetch text start address and bytes
    pub fn text(&self) -> (u32, Vec<u8>) {
        let v = general_purpose::STANDARD.decode(&self.text).unwrap();
        (self.text_start, v)
    }

    /// Fetch data start address and bytes
    pub fn data(&self) -> (u32, Vec<u8>) {
        let v = general_purpose::STANDARD.decode(&self.data).unwrap();
        (self.data_start, v)
    }
}
