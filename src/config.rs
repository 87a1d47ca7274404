//! Scan policy and manager configuration.

use uuid::Uuid;

use crate::device::DeviceId;
use crate::uuids::{TRANSFER_CHARACTERISTIC_UUID, TRANSFER_SERVICE_UUID};

/// Default minimum signal strength for accepting a discovered peripheral,
/// in dBm. Advertisements weaker than this are too far away for a reliable
/// transfer and are dropped.
pub const DEFAULT_MINIMUM_RSSI: i16 = -66;

/// Policy for accepting a discovered peripheral.
///
/// Immutable while a scan is running. When `target` is set, the scan behaves
/// as "connect to exactly this device and stop" instead of surfacing every
/// acceptable peripheral.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ScanPolicy {
    /// Connect only to this device, if set.
    pub target: Option<DeviceId>,
    /// Minimum acceptable signal strength in dBm.
    pub minimum_rssi: i16,
}

impl Default for ScanPolicy {
    fn default() -> Self {
        Self {
            target: None,
            minimum_rssi: DEFAULT_MINIMUM_RSSI,
        }
    }
}

/// Configuration for a [`CentralManager`](crate::CentralManager).
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CentralConfig {
    /// The GATT service to discover after connecting.
    pub service_uuid: Uuid,
    /// The notifying characteristic to subscribe to within that service.
    pub characteristic_uuid: Uuid,
    /// Initial scan policy.
    pub policy: ScanPolicy,
}

impl Default for CentralConfig {
    fn default() -> Self {
        Self {
            service_uuid: TRANSFER_SERVICE_UUID,
            characteristic_uuid: TRANSFER_CHARACTERISTIC_UUID,
            policy: ScanPolicy::default(),
        }
    }
}

impl CentralConfig {
    /// Configuration targeting a single known device.
    pub fn with_target(target: DeviceId) -> Self {
        Self {
            policy: ScanPolicy {
                target: Some(target),
                ..ScanPolicy::default()
            },
            ..Self::default()
        }
    }
}
