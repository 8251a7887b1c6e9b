// Well-known GATT identifiers and the Battery Service value format.

use std::fmt;
use uuid::Uuid;

/// Bluetooth SIG base UUID (0000xxxx-0000-1000-8000-00805F9B34FB)
const BLUETOOTH_BASE_UUID: u128 = 0x0000_0000_0000_1000_8000_00805F9B34FB;

/// Battery Service (0x180F)
pub const BATTERY_SERVICE_UUID: Uuid = uuid_from_short(0x180F);

/// Battery Level characteristic (0x2A19)
pub const BATTERY_LEVEL_UUID: Uuid = uuid_from_short(0x2A19);

/// Client Characteristic Configuration descriptor (0x2902)
pub const CCCD_UUID: Uuid = uuid_from_short(0x2902);

/// Expand a 16-bit SIG-assigned UUID to its 128-bit form
pub const fn uuid_from_short(short: u16) -> Uuid {
    Uuid::from_u128(BLUETOOTH_BASE_UUID | ((short as u128) << 96))
}

/// Battery charge as a percentage (0-100)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct BatteryLevel(u8);

impl BatteryLevel {
    /// Decode a Battery Level value: first byte, unsigned, percent.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        match bytes.first() {
            Some(&level) if level <= 100 => Some(Self(level)),
            _ => None,
        }
    }

    pub fn percent(&self) -> u8 {
        self.0
    }
}

impl fmt::Display for BatteryLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}%", self.0)
    }
}
