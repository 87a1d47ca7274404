//! BLE transport capability.
//!
//! The core depends on an injected transport rather than talking to a radio
//! directly: the transport executes scan/connect/GATT commands and delivers
//! every radio callback through a single event channel. A btleplug-backed
//! implementation lives in [`backend`]; tests drive the core with a fake.

pub mod backend;

use async_trait::async_trait;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::device::{Advertisement, DeviceId};
use crate::error::Result;

pub use backend::BtleplugTransport;

/// Radio power/authorization snapshot.
///
/// Mutated only by transport state-change notifications; scanning is allowed
/// only in [`AdapterState::PoweredOn`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum AdapterState {
    /// State not yet reported by the transport.
    #[default]
    Unknown,
    /// The radio stack is resetting.
    Resetting,
    /// This system has no usable BLE radio.
    Unsupported,
    /// The application is not authorized to use Bluetooth.
    Unauthorized,
    /// The radio is powered off.
    PoweredOff,
    /// The radio is powered on and ready.
    PoweredOn,
}

impl AdapterState {
    /// Whether scanning and connecting are possible in this state.
    pub fn is_available(&self) -> bool {
        matches!(self, Self::PoweredOn)
    }

    /// Whether this state may still transition to `PoweredOn` on its own,
    /// without user intervention.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unknown | Self::Resetting)
    }
}

impl std::fmt::Display for AdapterState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unknown => write!(f, "Unknown"),
            Self::Resetting => write!(f, "Resetting"),
            Self::Unsupported => write!(f, "Unsupported"),
            Self::Unauthorized => write!(f, "Unauthorized"),
            Self::PoweredOff => write!(f, "PoweredOff"),
            Self::PoweredOn => write!(f, "PoweredOn"),
        }
    }
}

/// Events delivered by the transport on its single callback channel.
///
/// GATT-walk completion events carry `Result<_, String>` payloads so the
/// whole event is `Clone` and can fan out over a broadcast channel.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// The adapter changed power/authorization state.
    AdapterState(AdapterState),
    /// An advertisement was observed. `rssi` is absent on platforms that do
    /// not report signal strength for every advertisement.
    Discovered {
        /// The advertising device.
        device: DeviceId,
        /// Parsed advertisement payload.
        advertisement: Advertisement,
        /// Observed signal strength in dBm.
        rssi: Option<i16>,
    },
    /// A requested connection was established.
    Connected {
        /// The connected device.
        device: DeviceId,
    },
    /// A requested connection could not be established.
    ConnectFailed {
        /// The device that failed to connect.
        device: DeviceId,
        /// Transport-reported failure reason.
        reason: String,
    },
    /// An established or in-flight connection was torn down.
    Disconnected {
        /// The disconnected device.
        device: DeviceId,
        /// Failure reason, if the disconnect was not requested.
        reason: Option<String>,
    },
    /// Service discovery completed.
    ServicesDiscovered {
        /// The device the discovery ran against.
        device: DeviceId,
        /// Discovered service UUIDs, filtered to the requested set.
        result: std::result::Result<Vec<Uuid>, String>,
    },
    /// Characteristic discovery completed for one service.
    CharacteristicsDiscovered {
        /// The device the discovery ran against.
        device: DeviceId,
        /// The service the characteristics belong to.
        service: Uuid,
        /// Discovered characteristic UUIDs, filtered to the requested set.
        result: std::result::Result<Vec<Uuid>, String>,
    },
    /// The notification state of a characteristic changed.
    NotificationStateChanged {
        /// The device owning the characteristic.
        device: DeviceId,
        /// The characteristic whose state changed.
        characteristic: Uuid,
        /// Whether the peripheral is now pushing notifications.
        is_notifying: bool,
        /// Transport-reported error, if the change failed.
        error: Option<String>,
    },
    /// The remote device restructured its GATT table, invalidating services.
    ServicesInvalidated {
        /// The device whose services changed.
        device: DeviceId,
        /// The invalidated service UUIDs.
        services: Vec<Uuid>,
    },
}

/// Commands the core issues against the radio.
///
/// All commands are fire-and-forget: they return once the request is handed
/// to the radio, and completion arrives later as a [`TransportEvent`].
#[async_trait]
pub trait BleTransport: Send + Sync {
    /// Start scanning for advertisements. An empty `services` slice scans
    /// without a service filter.
    async fn start_scan(&self, services: &[Uuid]) -> Result<()>;

    /// Stop an active scan.
    async fn stop_scan(&self) -> Result<()>;

    /// Whether a scan is currently active at the radio level.
    fn is_scanning(&self) -> bool;

    /// Request a connection to a discovered device.
    async fn connect(&self, device: &DeviceId) -> Result<()>;

    /// Cancel an in-flight or established connection.
    async fn cancel_connection(&self, device: &DeviceId) -> Result<()>;

    /// Discover services on a connected device, filtered to `services`.
    async fn discover_services(&self, device: &DeviceId, services: &[Uuid]) -> Result<()>;

    /// Discover characteristics of one service, filtered to `characteristics`.
    async fn discover_characteristics(
        &self,
        device: &DeviceId,
        service: Uuid,
        characteristics: &[Uuid],
    ) -> Result<()>;

    /// Enable or disable notifications on a characteristic.
    async fn set_notify(&self, device: &DeviceId, characteristic: Uuid, enabled: bool)
        -> Result<()>;

    /// Subscribe to the transport's event channel.
    fn events(&self) -> broadcast::Receiver<TransportEvent>;
}
