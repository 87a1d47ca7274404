//! btleplug-backed transport.
//!
//! Translates the btleplug central event stream into [`TransportEvent`]s and
//! executes transport commands against the first system adapter. GATT
//! discovery in btleplug is request-style, so service/characteristic
//! completion events are synthesized when the underlying calls return.
//! btleplug has no service-invalidation signal, so this backend never emits
//! [`TransportEvent::ServicesInvalidated`].

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, CentralState, Characteristic, Manager as _, Peripheral as _, ScanFilter,
};
use btleplug::platform::{Adapter, Manager, PeripheralId};
use futures::stream::StreamExt;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::device::{Advertisement, DeviceId};
use crate::error::{Error, Result};
use crate::transport::{AdapterState, BleTransport, TransportEvent};

/// BLE transport backed by btleplug.
pub struct BtleplugTransport {
    /// The adapter commands run against.
    adapter: Adapter,
    /// Whether scanning is currently active.
    is_scanning: Arc<RwLock<bool>>,
    /// Peripheral ids by stringified device id, learned from advertisements.
    known: Arc<RwLock<HashMap<DeviceId, PeripheralId>>>,
    /// Characteristics discovered per device, for notify commands.
    characteristics: Arc<RwLock<HashMap<(DeviceId, Uuid), Characteristic>>>,
    /// Channel for transport events.
    event_tx: broadcast::Sender<TransportEvent>,
    /// Handle to the central event pump.
    pump_handle: RwLock<Option<tokio::task::JoinHandle<()>>>,
}

impl BtleplugTransport {
    /// Create a transport on the first system Bluetooth adapter and start
    /// pumping central events.
    ///
    /// # Errors
    ///
    /// Returns an error if Bluetooth is not available.
    pub async fn new() -> Result<Self> {
        let manager = Manager::new().await.map_err(Error::Bluetooth)?;

        let adapters = manager.adapters().await.map_err(Error::Bluetooth)?;
        let adapter = adapters
            .into_iter()
            .next()
            .ok_or(Error::AdapterUnavailable {
                state: AdapterState::Unsupported,
            })?;

        info!(
            "Using Bluetooth adapter: {:?}",
            adapter.adapter_info().await.ok()
        );

        Ok(Self::with_adapter(adapter))
    }

    /// Create a transport on a specific adapter.
    pub fn with_adapter(adapter: Adapter) -> Self {
        let (event_tx, _) = broadcast::channel(100);

        let transport = Self {
            adapter,
            is_scanning: Arc::new(RwLock::new(false)),
            known: Arc::new(RwLock::new(HashMap::new())),
            characteristics: Arc::new(RwLock::new(HashMap::new())),
            event_tx,
            pump_handle: RwLock::new(None),
        };
        transport.start_pump();
        transport
    }

    /// Spawn the task translating btleplug central events.
    fn start_pump(&self) {
        let adapter = self.adapter.clone();
        let known = self.known.clone();
        let event_tx = self.event_tx.clone();

        let handle = tokio::spawn(async move {
            let mut events = match adapter.events().await {
                Ok(events) => events,
                Err(e) => {
                    error!("Failed to get adapter events: {}", e);
                    return;
                }
            };

            while let Some(event) = events.next().await {
                Self::handle_central_event(event, &adapter, &known, &event_tx).await;
            }

            debug!("Central event pump ended");
        });

        *self.pump_handle.write() = Some(handle);
    }

    /// Translate one btleplug central event.
    async fn handle_central_event(
        event: CentralEvent,
        adapter: &Adapter,
        known: &Arc<RwLock<HashMap<DeviceId, PeripheralId>>>,
        event_tx: &broadcast::Sender<TransportEvent>,
    ) {
        match event {
            CentralEvent::StateUpdate(state) => {
                let state = match state {
                    CentralState::Unknown => AdapterState::Unknown,
                    CentralState::PoweredOn => AdapterState::PoweredOn,
                    CentralState::PoweredOff => AdapterState::PoweredOff,
                };
                debug!("Adapter state update: {}", state);
                let _ = event_tx.send(TransportEvent::AdapterState(state));
            }
            CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => {
                trace!("Advertisement from {:?}", id);
                Self::process_advertisement(adapter, id, known, event_tx).await;
            }
            CentralEvent::DeviceConnected(id) => {
                debug!("Device connected: {:?}", id);
                let _ = event_tx.send(TransportEvent::Connected {
                    device: DeviceId::from(id.to_string()),
                });
            }
            CentralEvent::DeviceDisconnected(id) => {
                debug!("Device disconnected: {:?}", id);
                // btleplug does not distinguish requested from unexpected
                // disconnects, so no reason is attached.
                let _ = event_tx.send(TransportEvent::Disconnected {
                    device: DeviceId::from(id.to_string()),
                    reason: None,
                });
            }
            CentralEvent::ManufacturerDataAdvertisement { .. } => {}
            CentralEvent::ServiceDataAdvertisement { .. } => {}
            CentralEvent::ServicesAdvertisement { .. } => {}
        }
    }

    /// Resolve a peripheral and surface its advertisement.
    async fn process_advertisement(
        adapter: &Adapter,
        id: PeripheralId,
        known: &Arc<RwLock<HashMap<DeviceId, PeripheralId>>>,
        event_tx: &broadcast::Sender<TransportEvent>,
    ) {
        let peripheral = match adapter.peripheral(&id).await {
            Ok(p) => p,
            Err(e) => {
                trace!("Failed to get peripheral: {}", e);
                return;
            }
        };

        let properties = match peripheral.properties().await {
            Ok(Some(p)) => p,
            _ => return,
        };

        let device = DeviceId::from(id.to_string());
        known.write().insert(device.clone(), id);

        let _ = event_tx.send(TransportEvent::Discovered {
            device,
            advertisement: Advertisement {
                local_name: properties.local_name,
                services: properties.services,
            },
            rssi: properties.rssi,
        });
    }

    /// Look up the peripheral id for a device seen during scanning.
    fn peripheral_id(&self, device: &DeviceId) -> Result<PeripheralId> {
        self.known
            .read()
            .get(device)
            .cloned()
            .ok_or_else(|| Error::DeviceNotFound {
                device: device.clone(),
            })
    }
}

#[async_trait]
impl BleTransport for BtleplugTransport {
    async fn start_scan(&self, services: &[Uuid]) -> Result<()> {
        self.adapter
            .start_scan(ScanFilter {
                services: services.to_vec(),
            })
            .await
            .map_err(Error::Bluetooth)?;

        *self.is_scanning.write() = true;
        debug!("Scan started");
        Ok(())
    }

    async fn stop_scan(&self) -> Result<()> {
        self.adapter.stop_scan().await.map_err(Error::Bluetooth)?;

        *self.is_scanning.write() = false;
        debug!("Scan stopped");
        Ok(())
    }

    fn is_scanning(&self) -> bool {
        *self.is_scanning.read()
    }

    async fn connect(&self, device: &DeviceId) -> Result<()> {
        let id = self.peripheral_id(device)?;
        let peripheral = self.adapter.peripheral(&id).await.map_err(Error::Bluetooth)?;

        let device = device.clone();
        let event_tx = self.event_tx.clone();

        tokio::spawn(async move {
            if let Err(e) = peripheral.connect().await {
                warn!("Connect to {} failed: {}", device, e);
                let _ = event_tx.send(TransportEvent::ConnectFailed {
                    device,
                    reason: e.to_string(),
                });
            }
            // Success surfaces as a DeviceConnected central event.
        });

        Ok(())
    }

    async fn cancel_connection(&self, device: &DeviceId) -> Result<()> {
        let id = self.peripheral_id(device)?;
        let peripheral = self.adapter.peripheral(&id).await.map_err(Error::Bluetooth)?;

        let device = device.clone();
        tokio::spawn(async move {
            if let Err(e) = peripheral.disconnect().await {
                warn!("Disconnect from {} failed: {}", device, e);
            }
        });

        Ok(())
    }

    async fn discover_services(&self, device: &DeviceId, services: &[Uuid]) -> Result<()> {
        let id = self.peripheral_id(device)?;
        let peripheral = self.adapter.peripheral(&id).await.map_err(Error::Bluetooth)?;

        let device = device.clone();
        let filter = services.to_vec();
        let event_tx = self.event_tx.clone();

        tokio::spawn(async move {
            // btleplug discovers the whole GATT table in one call; the
            // requested filter is applied to the result.
            let result = match peripheral.discover_services().await {
                Ok(()) => {
                    let found: Vec<Uuid> = peripheral
                        .services()
                        .iter()
                        .map(|s| s.uuid)
                        .filter(|uuid| filter.is_empty() || filter.contains(uuid))
                        .collect();
                    debug!("Discovered {} matching services on {}", found.len(), device);
                    Ok(found)
                }
                Err(e) => Err(e.to_string()),
            };

            let _ = event_tx.send(TransportEvent::ServicesDiscovered { device, result });
        });

        Ok(())
    }

    async fn discover_characteristics(
        &self,
        device: &DeviceId,
        service: Uuid,
        characteristics: &[Uuid],
    ) -> Result<()> {
        let id = self.peripheral_id(device)?;
        let peripheral = self.adapter.peripheral(&id).await.map_err(Error::Bluetooth)?;

        let gatt_service = peripheral
            .services()
            .into_iter()
            .find(|s| s.uuid == service)
            .ok_or(Error::ServiceNotFound { uuid: service })?;

        let mut found = Vec::new();
        {
            let mut cache = self.characteristics.write();
            for characteristic in gatt_service.characteristics {
                if !characteristics.is_empty() && !characteristics.contains(&characteristic.uuid) {
                    continue;
                }
                found.push(characteristic.uuid);
                cache.insert((device.clone(), characteristic.uuid), characteristic);
            }
        }

        debug!(
            "Discovered {} matching characteristics in {} on {}",
            found.len(),
            service,
            device
        );

        let _ = self.event_tx.send(TransportEvent::CharacteristicsDiscovered {
            device: device.clone(),
            service,
            result: Ok(found),
        });

        Ok(())
    }

    async fn set_notify(
        &self,
        device: &DeviceId,
        characteristic: Uuid,
        enabled: bool,
    ) -> Result<()> {
        let id = self.peripheral_id(device)?;
        let peripheral = self.adapter.peripheral(&id).await.map_err(Error::Bluetooth)?;

        let gatt_characteristic = self
            .characteristics
            .read()
            .get(&(device.clone(), characteristic))
            .cloned()
            .ok_or(Error::CharacteristicNotFound {
                uuid: characteristic,
            })?;

        let device = device.clone();
        let event_tx = self.event_tx.clone();

        tokio::spawn(async move {
            let outcome = if enabled {
                peripheral.subscribe(&gatt_characteristic).await
            } else {
                peripheral.unsubscribe(&gatt_characteristic).await
            };

            let event = match outcome {
                Ok(()) => TransportEvent::NotificationStateChanged {
                    device,
                    characteristic,
                    is_notifying: enabled,
                    error: None,
                },
                Err(e) => TransportEvent::NotificationStateChanged {
                    device,
                    characteristic,
                    is_notifying: !enabled,
                    error: Some(e.to_string()),
                },
            };
            let _ = event_tx.send(event);
        });

        Ok(())
    }

    fn events(&self) -> broadcast::Receiver<TransportEvent> {
        self.event_tx.subscribe()
    }
}

impl Drop for BtleplugTransport {
    fn drop(&mut self) {
        if let Some(handle) = self.pump_handle.write().take() {
            handle.abort();
        }
    }
}
