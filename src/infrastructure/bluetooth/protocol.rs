//! Bluetooth constants
//!
//! Well-known UUIDs and descriptor values shared by the radio backends.

use uuid::Uuid;

/// Bluetooth Base UUID: `00000000-0000-1000-8000-00805F9B34FB`
const BASE_UUID: u128 = 0x0000_0000_0000_1000_8000_0080_5f9b_34fb;

/// Expand a 16-bit assigned number into a full 128-bit UUID
pub const fn short_uuid(short: u16) -> Uuid {
    Uuid::from_u128(BASE_UUID | ((short as u128) << 96))
}

/// Client Characteristic Configuration descriptor (0x2902).
/// Writing [`ENABLE_NOTIFICATION_VALUE`] to it turns notifications on.
pub const CLIENT_CHARACTERISTIC_CONFIG_UUID: Uuid = short_uuid(0x2902);

/// Serial Port Profile service class (0x1101), used for stream links
pub const SERIAL_PORT_SERVICE_UUID: Uuid = short_uuid(0x1101);

/// CCCD value enabling notifications (little-endian 0x0001)
pub const ENABLE_NOTIFICATION_VALUE: [u8; 2] = [0x01, 0x00];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_uuid_expansion() {
        assert_eq!(
            CLIENT_CHARACTERISTIC_CONFIG_UUID.to_string(),
            "00002902-0000-1000-8000-00805f9b34fb"
        );
        assert_eq!(
            SERIAL_PORT_SERVICE_UUID.to_string(),
            "00001101-0000-1000-8000-00805f9b34fb"
        );
    }

    #[test]
    fn test_descriptor_values() {
        assert_eq!(ENABLE_NOTIFICATION_VALUE, [0x01, 0x00]);
    }
}
