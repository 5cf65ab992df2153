use crate::{
    chip::{mac_from_words, Target},
    error::Error,
};

const CHIP_DETECT_MAGIC_VALUES: &[u32] = &[0x0000_07C6];

/// ESP32-S2 Target
pub struct Esp32s2;

impl Esp32s2 {
    pub fn has_magic_value(value: u32) -> bool {
        CHIP_DETECT_MAGIC_VALUES.contains(&value)
    }
}

impl Target for Esp32s2 {
    fn efuse_reg(&self) -> u32 {
        0x6001_A000
    }

    fn flash_write_size(&self) -> usize {
        0x400
    }

    // The S2 ROM's FLASH_BEGIN takes a trailing word flagging encrypted
    // writes.
    fn takes_encrypted_flag(&self) -> bool {
        true
    }

    fn chip_name(&self, _efuses: &[u32; 4]) -> &'static str {
        "ESP32-S2"
    }

    fn mac_address(&self, efuses: &[u32; 4]) -> Result<[u8; 6], Error> {
        Ok(mac_from_words(efuses[1], efuses[2]))
    }
}
