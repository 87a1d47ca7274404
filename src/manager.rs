//! Central manager for discovering and connecting to transfer peripherals.
//!
//! Owns the radio session: tracks adapter state, runs the scan with the
//! configured policy, holds the capacity-one connection slot, and hands a
//! connected peripheral to a [`PeripheralSession`] for the GATT walk. All
//! transport events flow through a single processing path, so mutation of
//! the shared state is single-writer.

use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::config::{CentralConfig, ScanPolicy};
use crate::device::{Advertisement, DeviceId, DiscoveredDevice, TransferCharacteristicRef};
use crate::error::{Error, Result};
use crate::session::{PeripheralSession, SessionError, SessionPhase, SessionRequest};
use crate::transport::{AdapterState, BleTransport, TransportEvent};

/// Events surfaced to the manager's subscriber.
///
/// The manager holds only the sending half of the channel; it never keeps a
/// subscriber alive.
#[derive(Debug, Clone)]
pub enum CentralEvent {
    /// A peripheral passed the scan policy in broadcast-discovery mode.
    Discovered(DiscoveredDevice),
    /// A connection was established; the GATT walk is starting.
    Connected {
        /// The connected device.
        device: DeviceId,
    },
    /// A connection attempt failed. The scan, if active, keeps running.
    ConnectFailed {
        /// The device that failed to connect.
        device: DeviceId,
        /// Transport-reported failure reason.
        reason: String,
    },
    /// The connection was torn down and all bound state cleared.
    Disconnected {
        /// The disconnected device.
        device: DeviceId,
        /// Failure reason, if the disconnect was not requested.
        reason: Option<String>,
    },
    /// The notification subscription is active; data will now arrive.
    ReadyForData {
        /// The ready device.
        device: DeviceId,
        /// The bound transfer characteristic.
        characteristic: TransferCharacteristicRef,
    },
    /// The GATT walk stalled; no further progress until the caller
    /// disconnects and reconnects.
    SessionStalled {
        /// The stalled device.
        device: DeviceId,
        /// The phase the walk stalled in.
        phase: SessionPhase,
        /// What went wrong.
        error: SessionError,
    },
}

/// Mutable manager state, guarded by one lock.
struct Inner {
    /// Discovery acceptance policy.
    policy: ScanPolicy,
    /// Last reported adapter state.
    adapter: AdapterState,
    /// Whether a scan is active.
    scanning: bool,
    /// Whether a scan should auto-start when the adapter powers on.
    scan_requested: bool,
    /// Connect candidate awaiting a connected/failed event.
    pending: Option<DeviceId>,
    /// The single active connection.
    session: Option<PeripheralSession>,
}

/// Shared core of the manager; the event pump holds a clone.
struct Core {
    /// Injected transport.
    transport: Arc<dyn BleTransport>,
    /// The GATT service to walk after connecting.
    service_uuid: Uuid,
    /// The notifying characteristic to subscribe to.
    characteristic_uuid: Uuid,
    /// Guarded mutable state.
    inner: RwLock<Inner>,
    /// Channel for caller-facing events.
    event_tx: broadcast::Sender<CentralEvent>,
}

/// BLE central-role connection manager.
///
/// Construct one per application with an injected [`BleTransport`], call
/// [`start`](Self::start) to begin processing transport events, and observe
/// progress through [`subscribe`](Self::subscribe).
pub struct CentralManager {
    core: Arc<Core>,
    /// Running flag for the event pump.
    is_running: Arc<AtomicBool>,
    /// Handle to the event pump task.
    pump_handle: RwLock<Option<tokio::task::JoinHandle<()>>>,
}

impl CentralManager {
    /// Create a manager over the given transport.
    pub fn new(transport: Arc<dyn BleTransport>, config: CentralConfig) -> Self {
        let (event_tx, _) = broadcast::channel(32);

        Self {
            core: Arc::new(Core {
                transport,
                service_uuid: config.service_uuid,
                characteristic_uuid: config.characteristic_uuid,
                inner: RwLock::new(Inner {
                    policy: config.policy,
                    adapter: AdapterState::default(),
                    scanning: false,
                    scan_requested: false,
                    pending: None,
                    session: None,
                }),
                event_tx,
            }),
            is_running: Arc::new(AtomicBool::new(false)),
            pump_handle: RwLock::new(None),
        }
    }

    /// Start pumping transport events through the state machine.
    ///
    /// Idempotent; a second call while running is ignored.
    pub fn start(&self) {
        if self.is_running.swap(true, Ordering::SeqCst) {
            debug!("Event pump already running");
            return;
        }

        let core = self.core.clone();
        let is_running = self.is_running.clone();
        let mut events = core.transport.events();

        let handle = tokio::spawn(async move {
            while is_running.load(Ordering::SeqCst) {
                match events.recv().await {
                    Ok(event) => core.process(event).await,
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!("Event pump lagged, {} transport events dropped", missed);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            debug!("Central event pump ended");
        });

        *self.pump_handle.write() = Some(handle);
    }

    /// Feed a single transport event through the state machine.
    ///
    /// The pump started by [`start`](Self::start) calls this internally; it
    /// is public for transports that deliver callbacks by hand.
    pub async fn handle_event(&self, event: TransportEvent) {
        self.core.process(event).await;
    }

    /// Subscribe to caller-facing events.
    pub fn subscribe(&self) -> broadcast::Receiver<CentralEvent> {
        self.core.event_tx.subscribe()
    }

    /// Replace the scan policy.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ScanActive`] while scanning (the policy is immutable
    /// during a scan) and [`Error::ConnectionBusy`] while the connection slot
    /// is occupied.
    pub fn configure(&self, target: Option<DeviceId>, minimum_rssi: i16) -> Result<()> {
        let mut inner = self.core.inner.write();

        if inner.scanning {
            return Err(Error::ScanActive);
        }
        if let Some(device) = inner
            .pending
            .as_ref()
            .or_else(|| inner.session.as_ref().map(|s| s.device()))
        {
            return Err(Error::ConnectionBusy {
                device: device.clone(),
            });
        }

        debug!(
            "Scan policy set: target={:?}, minimum_rssi={}",
            target, minimum_rssi
        );
        inner.policy = ScanPolicy {
            target,
            minimum_rssi,
        };
        Ok(())
    }

    /// Start scanning for peripherals.
    ///
    /// Idempotent while scanning. If the adapter has not reported
    /// `PoweredOn` yet the request is recorded and the scan auto-starts once
    /// it does.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AdapterUnavailable`] if the adapter is unsupported,
    /// unauthorized, or powered off. The scan request is still recorded, so
    /// powering the radio back on starts the scan.
    pub async fn start_scan(&self) -> Result<()> {
        {
            let mut inner = self.core.inner.write();
            inner.scan_requested = true;

            match inner.adapter {
                AdapterState::PoweredOn => {}
                state if state.is_transient() => {
                    debug!("Adapter not ready ({}), scan deferred", state);
                    return Ok(());
                }
                state => return Err(Error::AdapterUnavailable { state }),
            }

            if inner.scanning {
                debug!("Already scanning, ignoring start request");
                return Ok(());
            }
            inner.scanning = true;
        }

        if let Err(e) = self.core.transport.start_scan(&[]).await {
            self.core.inner.write().scanning = false;
            return Err(e);
        }

        info!("Scan started");
        Ok(())
    }

    /// Stop an active scan. A no-op unless currently scanning.
    pub async fn stop_scan(&self) -> Result<()> {
        {
            let mut inner = self.core.inner.write();
            inner.scan_requested = false;

            if !inner.scanning {
                debug!("Not scanning, ignoring stop request");
                return Ok(());
            }
            inner.scanning = false;
        }

        self.core.transport.stop_scan().await?;
        info!("Scan stopped");
        Ok(())
    }

    /// Tear down the in-flight or established connection.
    ///
    /// Clears the target identifier and the connection slot eagerly; the
    /// transport's disconnect event is idempotent with this. A no-op when no
    /// connection is in flight.
    pub async fn cancel_connect(&self) -> Result<()> {
        let device = {
            let mut inner = self.core.inner.write();
            inner.policy.target = None;
            let pending = inner.pending.take();
            pending.or_else(|| inner.session.take().map(|s| s.device().clone()))
        };

        let Some(device) = device else {
            debug!("No connection to cancel");
            return Ok(());
        };

        info!("Cancelling connection to {}", device);
        self.core.transport.cancel_connection(&device).await
    }

    /// Stop scanning, tear down the connection, and stop the event pump.
    pub async fn shutdown(&self) -> Result<()> {
        info!("Shutting down central manager");

        self.stop_scan().await?;
        self.cancel_connect().await?;

        self.is_running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.pump_handle.write().take() {
            handle.abort();
        }

        Ok(())
    }

    /// Last reported adapter state.
    pub fn adapter_state(&self) -> AdapterState {
        self.core.inner.read().adapter
    }

    /// Whether a scan is active.
    pub fn is_scanning(&self) -> bool {
        self.core.inner.read().scanning
    }

    /// Current scan policy.
    pub fn scan_policy(&self) -> ScanPolicy {
        self.core.inner.read().policy.clone()
    }

    /// The device occupying the connection slot, if any.
    pub fn active_device(&self) -> Option<DeviceId> {
        let inner = self.core.inner.read();
        inner
            .session
            .as_ref()
            .map(|s| s.device().clone())
            .or_else(|| inner.pending.clone())
    }

    /// GATT walk phase of the active connection, if one exists.
    pub fn session_phase(&self) -> Option<SessionPhase> {
        self.core.inner.read().session.as_ref().map(|s| s.phase())
    }

    /// The bound transfer characteristic, once the walk discovered it.
    pub fn transfer_characteristic(&self) -> Option<TransferCharacteristicRef> {
        self.core
            .inner
            .read()
            .session
            .as_ref()
            .and_then(|s| s.transfer_ref().cloned())
    }
}

impl Drop for CentralManager {
    fn drop(&mut self) {
        self.is_running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.pump_handle.write().take() {
            handle.abort();
        }
    }
}

impl Core {
    /// Process one transport event.
    async fn process(&self, event: TransportEvent) {
        match event {
            TransportEvent::AdapterState(state) => self.on_adapter_state(state).await,
            TransportEvent::Discovered {
                device,
                advertisement,
                rssi,
            } => self.on_discovered(device, advertisement, rssi).await,
            TransportEvent::Connected { device } => self.on_connected(device).await,
            TransportEvent::ConnectFailed { device, reason } => {
                self.on_connect_failed(device, reason);
            }
            TransportEvent::Disconnected { device, reason } => {
                self.on_disconnected(device, reason);
            }
            TransportEvent::ServicesDiscovered { device, result } => {
                let requests = self.with_session(&device, |s| s.on_services_discovered(result));
                self.drive(&device, requests).await;
            }
            TransportEvent::CharacteristicsDiscovered {
                device,
                service,
                result,
            } => {
                let requests =
                    self.with_session(&device, |s| s.on_characteristics_discovered(service, result));
                self.drive(&device, requests).await;
            }
            TransportEvent::NotificationStateChanged {
                device,
                characteristic,
                is_notifying,
                error,
            } => {
                let requests = self.with_session(&device, |s| {
                    s.on_notification_state(characteristic, is_notifying, error)
                });
                self.drive(&device, requests).await;
            }
            TransportEvent::ServicesInvalidated { device, services } => {
                let requests = self.with_session(&device, |s| s.on_services_invalidated(&services));
                self.drive(&device, requests).await;
            }
        }
    }

    /// Track an adapter state change, auto-starting a requested scan on
    /// power-on.
    async fn on_adapter_state(&self, state: AdapterState) {
        let start = {
            let mut inner = self.inner.write();
            debug!("Adapter state: {} -> {}", inner.adapter, state);
            inner.adapter = state;

            if state == AdapterState::PoweredOn {
                let start = inner.scan_requested && !inner.scanning;
                if start {
                    inner.scanning = true;
                }
                start
            } else {
                if inner.scanning {
                    debug!("Adapter left PoweredOn, scan implicitly stopped");
                    inner.scanning = false;
                }
                false
            }
        };

        if start {
            info!("Adapter powered on, starting requested scan");
            if let Err(e) = self.transport.start_scan(&[]).await {
                warn!("Failed to start scan: {}", e);
                self.inner.write().scanning = false;
            }
        }
    }

    /// Apply the scan policy to one advertisement.
    async fn on_discovered(
        &self,
        device: DeviceId,
        advertisement: Advertisement,
        rssi: Option<i16>,
    ) {
        enum Decision {
            Connect,
            Surface(i16),
            Drop,
        }

        let decision = {
            let mut inner = self.inner.write();

            let Some(rssi) = rssi else {
                trace!("Dropping advertisement from {} without RSSI", device);
                return;
            };
            if rssi < inner.policy.minimum_rssi {
                trace!(
                    "Rejecting {} at {} dBm (minimum {})",
                    device,
                    rssi,
                    inner.policy.minimum_rssi
                );
                return;
            }

            match inner.policy.target.clone() {
                Some(target) if device != target => {
                    trace!("Ignoring {} while targeting {}", device, target);
                    Decision::Drop
                }
                Some(_) => {
                    if inner.pending.is_some() || inner.session.is_some() {
                        debug!(
                            "Connection slot occupied, ignoring advertisement from {}",
                            device
                        );
                        Decision::Drop
                    } else {
                        inner.pending = Some(device.clone());
                        Decision::Connect
                    }
                }
                None => Decision::Surface(rssi),
            }
        };

        match decision {
            Decision::Connect => {
                info!("Target device {} in range, connecting", device);
                if let Err(e) = self.transport.connect(&device).await {
                    warn!("Connect request for {} failed: {}", device, e);
                    self.inner.write().pending = None;
                    let _ = self.event_tx.send(CentralEvent::ConnectFailed {
                        device,
                        reason: e.to_string(),
                    });
                }
            }
            Decision::Surface(rssi) => {
                debug!("Discovered {} at {} dBm", device, rssi);
                let _ = self.event_tx.send(CentralEvent::Discovered(DiscoveredDevice {
                    id: device,
                    local_name: advertisement.local_name,
                    rssi,
                    services: advertisement.services,
                }));
            }
            Decision::Drop => {}
        }
    }

    /// Promote the pending candidate to an active session.
    async fn on_connected(&self, device: DeviceId) {
        let (was_scanning, requests) = {
            let mut inner = self.inner.write();

            if inner.pending.as_ref() != Some(&device) {
                warn!("Connected event for {} without a pending request", device);
                return;
            }
            inner.pending = None;

            let was_scanning = inner.scanning;
            inner.scanning = false;

            let mut session = PeripheralSession::new(
                device.clone(),
                self.service_uuid,
                self.characteristic_uuid,
                self.event_tx.clone(),
            );
            let requests = session.start();
            inner.session = Some(session);

            (was_scanning, requests)
        };

        info!("Connected to {}", device);
        let _ = self.event_tx.send(CentralEvent::Connected {
            device: device.clone(),
        });

        if was_scanning {
            if let Err(e) = self.transport.stop_scan().await {
                warn!("Failed to stop scan after connect: {}", e);
            }
            debug!("Scan stopped after connect");
        }

        self.drive(&device, requests).await;
    }

    /// Discard the pending candidate on a failed connection attempt.
    fn on_connect_failed(&self, device: DeviceId, reason: String) {
        {
            let mut inner = self.inner.write();
            if inner.pending.as_ref() != Some(&device) {
                debug!("Connect failure for {} we did not request", device);
                return;
            }
            inner.pending = None;
        }

        warn!("Failed to connect to {}: {}", device, reason);
        let _ = self
            .event_tx
            .send(CentralEvent::ConnectFailed { device, reason });
    }

    /// Clear the connection slot on disconnect, whatever the walk phase.
    fn on_disconnected(&self, device: DeviceId, reason: Option<String>) {
        {
            let mut inner = self.inner.write();
            let matches_session = inner.session.as_ref().is_some_and(|s| s.device() == &device);
            let matches_pending = inner.pending.as_ref() == Some(&device);

            if !matches_session && !matches_pending {
                debug!("Disconnect event for unrelated device {}", device);
                return;
            }

            // Dropping the session clears the bound transfer characteristic.
            inner.session = None;
            inner.pending = None;
        }

        match &reason {
            Some(reason) => warn!("Disconnected from {}: {}", device, reason),
            None => info!("Disconnected from {}", device),
        }
        let _ = self
            .event_tx
            .send(CentralEvent::Disconnected { device, reason });
    }

    /// Run a session transition if the event belongs to the active session.
    fn with_session<F>(&self, device: &DeviceId, f: F) -> Vec<SessionRequest>
    where
        F: FnOnce(&mut PeripheralSession) -> Vec<SessionRequest>,
    {
        let mut inner = self.inner.write();
        match inner.session.as_mut() {
            Some(session) if session.device() == device => f(session),
            _ => {
                debug!("GATT event for {} with no matching session", device);
                Vec::new()
            }
        }
    }

    /// Issue the radio work a session transition asked for.
    async fn drive(&self, device: &DeviceId, requests: Vec<SessionRequest>) {
        for request in requests {
            let result = match &request {
                SessionRequest::DiscoverServices => {
                    self.transport
                        .discover_services(device, &[self.service_uuid])
                        .await
                }
                SessionRequest::DiscoverCharacteristics { service } => {
                    self.transport
                        .discover_characteristics(device, *service, &[self.characteristic_uuid])
                        .await
                }
                SessionRequest::EnableNotifications { characteristic } => {
                    self.transport.set_notify(device, *characteristic, true).await
                }
            };

            if let Err(e) = result {
                let error = match request {
                    SessionRequest::DiscoverServices => SessionError::ServiceDiscoveryFailed {
                        reason: e.to_string(),
                    },
                    SessionRequest::DiscoverCharacteristics { service } => {
                        SessionError::CharacteristicDiscoveryFailed {
                            service,
                            reason: e.to_string(),
                        }
                    }
                    SessionRequest::EnableNotifications { characteristic } => {
                        SessionError::SubscriptionFailed {
                            characteristic,
                            reason: e.to_string(),
                        }
                    }
                };

                let mut inner = self.inner.write();
                if let Some(session) = inner.session.as_mut() {
                    if session.device() == device {
                        session.stall(error);
                    }
                }
            }
        }
    }
}
