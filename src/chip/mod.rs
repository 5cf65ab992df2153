//! Supported target devices
//!
//! The connected chip family is classified by reading a magic word from a
//! fixed ROM address; everything else the driver needs to know about a
//! family (eFuse layout, write sizes, MAC derivation) hangs off that.

use strum::Display;

use crate::error::Error;

mod esp32;
mod esp32s2;
mod esp8266;

pub(crate) use esp32::Esp32;
pub(crate) use esp32s2::Esp32s2;
pub(crate) use esp8266::Esp8266;

/// Register used for chip detection on every supported family.
pub(crate) const CHIP_DETECT_MAGIC_REG_ADDR: u32 = 0x4000_1000;

/// All supported devices
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[non_exhaustive]
pub enum Chip {
    /// ESP32
    #[strum(serialize = "ESP32")]
    Esp32,
    /// ESP32-S2
    #[strum(serialize = "ESP32-S2")]
    Esp32s2,
    /// ESP8266
    #[strum(serialize = "ESP8266")]
    Esp8266,
}

impl Chip {
    pub fn from_magic(magic: u32) -> Result<Self, Error> {
        if Esp32::has_magic_value(magic) {
            Ok(Chip::Esp32)
        } else if Esp32s2::has_magic_value(magic) {
            Ok(Chip::Esp32s2)
        } else if Esp8266::has_magic_value(magic) {
            Ok(Chip::Esp8266)
        } else {
            Err(Error::ChipDetect(magic.into()))
        }
    }

    pub(crate) fn into_target(self) -> Box<dyn Target> {
        match self {
            Chip::Esp32 => Box::new(Esp32),
            Chip::Esp32s2 => Box::new(Esp32s2),
            Chip::Esp8266 => Box::new(Esp8266),
        }
    }
}

/// Family-specific constants and derivations.
pub(crate) trait Target {
    /// Base address of the eFuse register block.
    fn efuse_reg(&self) -> u32;

    /// Write size for `FLASH_DATA` under the ROM loader.
    fn flash_write_size(&self) -> usize;

    /// Does `FLASH_BEGIN` take a trailing encryption word on this family?
    fn takes_encrypted_flag(&self) -> bool;

    /// Marketing name, refined by eFuse bits where families share a die.
    fn chip_name(&self, efuses: &[u32; 4]) -> &'static str;

    /// Derive the factory MAC address from the eFuse words.
    fn mac_address(&self, efuses: &[u32; 4]) -> Result<[u8; 6], Error>;
}

/// ESP32-style MAC layout: two bytes from the high word, four from the low.
pub(crate) fn mac_from_words(mac1: u32, mac2: u32) -> [u8; 6] {
    [
        (mac2 >> 8) as u8,
        mac2 as u8,
        (mac1 >> 24) as u8,
        (mac1 >> 16) as u8,
        (mac1 >> 8) as u8,
        mac1 as u8,
    ]
}

/// Render a MAC address in the conventional colon-separated form.
pub fn format_mac(mac: [u8; 6]) -> String {
    mac.iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(":")
}
