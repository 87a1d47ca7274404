//! Device-level data model.
//!
//! Identifies remote peripherals and the transfer characteristic bound on an
//! active connection.

use uuid::Uuid;

/// Stable per-session identifier for a remote peripheral.
///
/// The transport assigns these; the core treats them as opaque. Two
/// advertisements with the same identifier refer to the same device, with the
/// newer observation superseding the older one.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DeviceId(String);

impl DeviceId {
    /// Create a device identifier from its transport-level string form.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for DeviceId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for DeviceId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Advertisement payload observed during discovery.
#[derive(Debug, Clone, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Advertisement {
    /// Advertised local name, if present.
    pub local_name: Option<String>,
    /// Advertised service UUIDs.
    pub services: Vec<Uuid>,
}

/// A peripheral that passed the scan policy, surfaced to the caller in
/// broadcast-discovery mode.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DiscoveredDevice {
    /// Transport identifier for the device.
    pub id: DeviceId,
    /// Advertised local name, if present.
    pub local_name: Option<String>,
    /// Signal strength of the accepted advertisement, in dBm.
    pub rssi: i16,
    /// Advertised service UUIDs.
    pub services: Vec<Uuid>,
}

/// The single characteristic used for data notification on an active
/// connection.
///
/// Bound once per connection during the GATT walk and cleared on disconnect.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TransferCharacteristicRef {
    /// UUID of the service containing the characteristic.
    pub service: Uuid,
    /// UUID of the characteristic itself.
    pub characteristic: Uuid,
    /// Whether notifications are currently active.
    pub is_notifying: bool,
}
