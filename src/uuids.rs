//! Transfer service and characteristic UUIDs.
//!
//! The target GATT identifiers are fixed configuration constants, not
//! runtime-negotiated.

use uuid::Uuid;

/// Transfer Service UUID.
pub const TRANSFER_SERVICE_UUID: Uuid = Uuid::from_u128(0xe20a39f4_73f5_4bc4_a12f_17d1ad07a961);

/// Transfer Characteristic UUID (Notify).
pub const TRANSFER_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x08590f7e_db05_467e_8757_72f6faeb13d4);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uuid_format() {
        let service = TRANSFER_SERVICE_UUID.to_string();
        assert_eq!(service, "e20a39f4-73f5-4bc4-a12f-17d1ad07a961");

        let characteristic = TRANSFER_CHARACTERISTIC_UUID.to_string();
        assert_eq!(characteristic, "08590f7e-db05-467e-8757-72f6faeb13d4");
    }

    #[test]
    fn test_service_and_characteristic_differ() {
        assert_ne!(TRANSFER_SERVICE_UUID, TRANSFER_CHARACTERISTIC_UUID);
    }
}
