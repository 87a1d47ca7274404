//! Error types for the transfer-central-ble crate.

use thiserror::Error;
use uuid::Uuid;

use crate::device::DeviceId;
use crate::transport::AdapterState;

/// The main error type for this crate.
#[derive(Error, Debug)]
pub enum Error {
    /// Bluetooth-related error from the underlying BLE library.
    #[error("Bluetooth error: {0}")]
    Bluetooth(#[from] btleplug::Error),

    /// The adapter cannot scan or connect in its current state.
    #[error("Bluetooth adapter unavailable: {state}")]
    AdapterUnavailable {
        /// The adapter state that prevented the operation.
        state: AdapterState,
    },

    /// The scan policy cannot change while a scan is running.
    #[error("Scan in progress, stop scanning before reconfiguring")]
    ScanActive,

    /// The single connection slot is already occupied.
    #[error("Connection slot occupied by {device}")]
    ConnectionBusy {
        /// The device holding the slot.
        device: DeviceId,
    },

    /// The transport does not know the given device.
    #[error("Device not found: {device}")]
    DeviceNotFound {
        /// The identifier that was searched for.
        device: DeviceId,
    },

    /// Service not found on the device.
    #[error("Service not found: {uuid}")]
    ServiceNotFound {
        /// The UUID of the service that was not found.
        uuid: Uuid,
    },

    /// Characteristic not found on the device.
    #[error("Characteristic not found: {uuid}")]
    CharacteristicNotFound {
        /// The UUID of the characteristic that was not found.
        uuid: Uuid,
    },
}

/// A specialized Result type for this crate.
pub type Result<T> = std::result::Result<T, Error>;
