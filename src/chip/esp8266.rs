use crate::{chip::Target, error::Error};

const CHIP_DETECT_MAGIC_VALUES: &[u32] = &[0xFFF0_C101];

/// Espressif-registered OUIs used when the custom-MAC eFuse block is blank.
const OUI_VARIANT_0: [u8; 3] = [0x18, 0xFE, 0x34];
const OUI_VARIANT_1: [u8; 3] = [0xAC, 0xD0, 0x74];

/// ESP8266 Target
pub struct Esp8266;

impl Esp8266 {
    pub fn has_magic_value(value: u32) -> bool {
        CHIP_DETECT_MAGIC_VALUES.contains(&value)
    }
}

impl Target for Esp8266 {
    fn efuse_reg(&self) -> u32 {
        0x3FF0_0050
    }

    fn flash_write_size(&self) -> usize {
        0x200
    }

    fn takes_encrypted_flag(&self) -> bool {
        false
    }

    fn chip_name(&self, efuses: &[u32; 4]) -> &'static str {
        let is_8285 = (efuses[0] & (1 << 4)) != 0 || (efuses[2] & (1 << 16)) != 0;
        if is_8285 {
            "ESP8285"
        } else {
            "ESP8266EX"
        }
    }

    fn mac_address(&self, efuses: &[u32; 4]) -> Result<[u8; 6], Error> {
        let oui = if efuses[3] != 0 {
            [
                (efuses[3] >> 16) as u8,
                (efuses[3] >> 8) as u8,
                efuses[3] as u8,
            ]
        } else {
            match (efuses[1] >> 16) as u8 {
                0 => OUI_VARIANT_0,
                1 => OUI_VARIANT_1,
                _ => return Err(Error::UnknownOui),
            }
        };

        Ok([
            oui[0],
            oui[1],
            oui[2],
            (efuses[1] >> 8) as u8,
            efuses[1] as u8,
            (efuses[0] >> 24) as u8,
        ])
    }
}
