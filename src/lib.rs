//! # transfer-central-ble
//!
//! A Bluetooth Low Energy **central-role connection manager** for
//! transfer-service peripherals: discover nearby devices, filter them by
//! signal strength and optional target identity, connect, walk the GATT
//! hierarchy, and subscribe to the notifying transfer characteristic.
//!
//! ## Features
//!
//! - **Discovery**: RSSI-gated scanning with optional connect-to-target mode
//! - **Single connection slot**: at most one in-flight or active connection
//! - **GATT walk**: service -> characteristic -> notification subscription,
//!   surfaced as a single "ready for data" event
//! - **Invalidation recovery**: automatic re-discovery when the peripheral
//!   restructures its GATT table
//! - **Injected transport**: btleplug-backed by default, swappable for tests
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use transfer_central_ble::{BtleplugTransport, CentralConfig, CentralManager, Result};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let transport = Arc::new(BtleplugTransport::new().await?);
//!     let manager = CentralManager::new(transport, CentralConfig::default());
//!     manager.start();
//!
//!     let mut events = manager.subscribe();
//!     manager.start_scan().await?;
//!
//!     while let Ok(event) = events.recv().await {
//!         println!("{event:?}");
//!     }
//!
//!     manager.shutdown().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Platform Notes
//!
//! ### macOS
//! Requires Bluetooth permission. Add `NSBluetoothAlwaysUsageDescription`
//! to your Info.plist for bundled apps.
//!
//! ### Linux
//! Requires BlueZ. User may need to be in the `bluetooth` group.
//!
//! ### Windows
//! Requires Windows 10 or later with Bluetooth LE support.
//!
//! ## Feature Flags
//!
//! - `serde`: Enable serialization/deserialization for data types

// Public modules
pub mod config;
pub mod device;
pub mod error;
pub mod manager;
pub mod session;
pub mod transport;
pub mod uuids;

// Re-exports for convenience
pub use config::{CentralConfig, ScanPolicy, DEFAULT_MINIMUM_RSSI};
pub use device::{Advertisement, DeviceId, DiscoveredDevice, TransferCharacteristicRef};
pub use error::{Error, Result};
pub use manager::{CentralEvent, CentralManager};
pub use session::{PeripheralSession, SessionError, SessionPhase};
pub use transport::{AdapterState, BleTransport, BtleplugTransport, TransportEvent};
pub use uuids::{TRANSFER_CHARACTERISTIC_UUID, TRANSFER_SERVICE_UUID};
