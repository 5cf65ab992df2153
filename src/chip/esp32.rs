use crate::{
    chip::{mac_from_words, Target},
    error::Error,
};

const CHIP_DETECT_MAGIC_VALUES: &[u32] = &[0x00F0_1D83];

/// ESP32 Target
pub struct Esp32;

impl Esp32 {
    pub fn has_magic_value(value: u32) -> bool {
        CHIP_DETECT_MAGIC_VALUES.contains(&value)
    }
}

impl Target for Esp32 {
    fn efuse_reg(&self) -> u32 {
        0x6001_A000
    }

    fn flash_write_size(&self) -> usize {
        0x200
    }

    fn takes_encrypted_flag(&self) -> bool {
        false
    }

    fn chip_name(&self, _efuses: &[u32; 4]) -> &'static str {
        "ESP32"
    }

    fn mac_address(&self, efuses: &[u32; 4]) -> Result<[u8; 6], Error> {
        Ok(mac_from_words(efuses[1], efuses[2]))
    }
}
