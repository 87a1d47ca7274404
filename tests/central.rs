//! State machine tests driving the central manager through a fake transport.

use async_trait::async_trait;
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use std::sync::Arc;
use tokio::sync::broadcast;
use uuid::Uuid;

use transfer_central_ble::{
    AdapterState, Advertisement, BleTransport, CentralConfig, CentralEvent, CentralManager,
    DeviceId, Error, Result, ScanPolicy, SessionError, SessionPhase, TransportEvent,
    TRANSFER_CHARACTERISTIC_UUID, TRANSFER_SERVICE_UUID,
};

/// A radio command the manager issued against the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Command {
    StartScan(Vec<Uuid>),
    StopScan,
    Connect(DeviceId),
    CancelConnection(DeviceId),
    DiscoverServices(DeviceId, Vec<Uuid>),
    DiscoverCharacteristics(DeviceId, Uuid, Vec<Uuid>),
    SetNotify(DeviceId, Uuid, bool),
}

/// Transport double that records commands and lets tests inject events.
struct FakeTransport {
    commands: Mutex<Vec<Command>>,
    scanning: Mutex<bool>,
    event_tx: broadcast::Sender<TransportEvent>,
}

impl FakeTransport {
    fn new() -> Arc<Self> {
        let (event_tx, _) = broadcast::channel(64);
        Arc::new(Self {
            commands: Mutex::new(Vec::new()),
            scanning: Mutex::new(false),
            event_tx,
        })
    }

    fn commands(&self) -> Vec<Command> {
        self.commands.lock().clone()
    }

    fn count(&self, matcher: impl Fn(&Command) -> bool) -> usize {
        self.commands.lock().iter().filter(|c| matcher(c)).count()
    }
}

#[async_trait]
impl BleTransport for FakeTransport {
    async fn start_scan(&self, services: &[Uuid]) -> Result<()> {
        self.commands.lock().push(Command::StartScan(services.to_vec()));
        *self.scanning.lock() = true;
        Ok(())
    }

    async fn stop_scan(&self) -> Result<()> {
        self.commands.lock().push(Command::StopScan);
        *self.scanning.lock() = false;
        Ok(())
    }

    fn is_scanning(&self) -> bool {
        *self.scanning.lock()
    }

    async fn connect(&self, device: &DeviceId) -> Result<()> {
        self.commands.lock().push(Command::Connect(device.clone()));
        Ok(())
    }

    async fn cancel_connection(&self, device: &DeviceId) -> Result<()> {
        self.commands
            .lock()
            .push(Command::CancelConnection(device.clone()));
        Ok(())
    }

    async fn discover_services(&self, device: &DeviceId, services: &[Uuid]) -> Result<()> {
        self.commands
            .lock()
            .push(Command::DiscoverServices(device.clone(), services.to_vec()));
        Ok(())
    }

    async fn discover_characteristics(
        &self,
        device: &DeviceId,
        service: Uuid,
        characteristics: &[Uuid],
    ) -> Result<()> {
        self.commands.lock().push(Command::DiscoverCharacteristics(
            device.clone(),
            service,
            characteristics.to_vec(),
        ));
        Ok(())
    }

    async fn set_notify(
        &self,
        device: &DeviceId,
        characteristic: Uuid,
        enabled: bool,
    ) -> Result<()> {
        self.commands
            .lock()
            .push(Command::SetNotify(device.clone(), characteristic, enabled));
        Ok(())
    }

    fn events(&self) -> broadcast::Receiver<TransportEvent> {
        self.event_tx.subscribe()
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Manager over a fake transport, with the adapter already powered on.
async fn powered_manager(
    policy: ScanPolicy,
) -> (
    Arc<FakeTransport>,
    CentralManager,
    broadcast::Receiver<CentralEvent>,
) {
    init_tracing();
    let transport = FakeTransport::new();
    let config = CentralConfig {
        policy,
        ..CentralConfig::default()
    };
    let manager = CentralManager::new(transport.clone() as Arc<dyn BleTransport>, config);
    let events = manager.subscribe();
    manager
        .handle_event(TransportEvent::AdapterState(AdapterState::PoweredOn))
        .await;
    (transport, manager, events)
}

fn target_policy(id: &str) -> ScanPolicy {
    ScanPolicy {
        target: Some(DeviceId::from(id)),
        ..ScanPolicy::default()
    }
}

fn advertisement(id: &str, rssi: i16) -> TransportEvent {
    TransportEvent::Discovered {
        device: DeviceId::from(id),
        advertisement: Advertisement {
            local_name: Some("transfer-peripheral".to_string()),
            services: vec![TRANSFER_SERVICE_UUID],
        },
        rssi: Some(rssi),
    }
}

fn drain(events: &mut broadcast::Receiver<CentralEvent>) -> Vec<CentralEvent> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        out.push(event);
    }
    out
}

/// Drive the manager from an accepted connection to an active subscription.
async fn walk_to_ready(manager: &CentralManager, device: &DeviceId) {
    manager
        .handle_event(TransportEvent::Connected {
            device: device.clone(),
        })
        .await;
    manager
        .handle_event(TransportEvent::ServicesDiscovered {
            device: device.clone(),
            result: Ok(vec![TRANSFER_SERVICE_UUID]),
        })
        .await;
    manager
        .handle_event(TransportEvent::CharacteristicsDiscovered {
            device: device.clone(),
            service: TRANSFER_SERVICE_UUID,
            result: Ok(vec![TRANSFER_CHARACTERISTIC_UUID]),
        })
        .await;
    manager
        .handle_event(TransportEvent::NotificationStateChanged {
            device: device.clone(),
            characteristic: TRANSFER_CHARACTERISTIC_UUID,
            is_notifying: true,
            error: None,
        })
        .await;
}

#[tokio::test]
async fn weak_advertisements_are_dropped() {
    let (transport, manager, mut events) = powered_manager(ScanPolicy::default()).await;
    manager.start_scan().await.unwrap();

    manager.handle_event(advertisement("dev-a", -80)).await;

    assert!(drain(&mut events).is_empty());
    assert_eq!(transport.count(|c| matches!(c, Command::Connect(_))), 0);
}

#[tokio::test]
async fn broadcast_discovery_surfaces_without_connecting() {
    let (transport, manager, mut events) = powered_manager(ScanPolicy::default()).await;
    manager.start_scan().await.unwrap();

    manager.handle_event(advertisement("dev-a", -60)).await;

    match drain(&mut events).as_slice() {
        [CentralEvent::Discovered(device)] => {
            assert_eq!(device.id, DeviceId::from("dev-a"));
            assert_eq!(device.rssi, -60);
            assert_eq!(device.services, vec![TRANSFER_SERVICE_UUID]);
        }
        other => panic!("unexpected events: {:?}", other),
    }
    assert_eq!(transport.count(|c| matches!(c, Command::Connect(_))), 0);
}

#[tokio::test]
async fn target_mode_connects_exactly_once() {
    let (transport, manager, mut events) = powered_manager(target_policy("dev-a")).await;
    manager.start_scan().await.unwrap();

    // Repeated advertisements before the connection completes must not
    // issue additional connect requests.
    manager.handle_event(advertisement("dev-a", -60)).await;
    manager.handle_event(advertisement("dev-a", -58)).await;
    manager.handle_event(advertisement("dev-a", -62)).await;

    assert_eq!(transport.count(|c| matches!(c, Command::Connect(_))), 1);
    assert!(drain(&mut events).is_empty());
}

#[tokio::test]
async fn target_mode_filters_identity_then_signal() {
    let (transport, manager, _events) = powered_manager(target_policy("dev-a")).await;
    manager.start_scan().await.unwrap();

    // Wrong identity, strong signal: rejected.
    manager.handle_event(advertisement("dev-b", -50)).await;
    // Right identity, weak signal: rejected.
    manager.handle_event(advertisement("dev-a", -70)).await;
    // Right identity, acceptable signal: connect.
    manager.handle_event(advertisement("dev-a", -65)).await;

    assert_eq!(
        transport.commands(),
        vec![
            Command::StartScan(vec![]),
            Command::Connect(DeviceId::from("dev-a")),
        ]
    );
}

#[tokio::test]
async fn start_scan_is_idempotent() {
    let (transport, manager, _events) = powered_manager(ScanPolicy::default()).await;

    manager.start_scan().await.unwrap();
    manager.start_scan().await.unwrap();

    assert_eq!(transport.count(|c| matches!(c, Command::StartScan(_))), 1);
    assert!(manager.is_scanning());
}

#[tokio::test]
async fn scan_request_deferred_until_power_on() {
    let transport = FakeTransport::new();
    let manager = CentralManager::new(
        transport.clone() as Arc<dyn BleTransport>,
        CentralConfig::default(),
    );

    // Adapter state is still Unknown: the request is recorded, not issued.
    manager.start_scan().await.unwrap();
    assert_eq!(transport.count(|c| matches!(c, Command::StartScan(_))), 0);
    assert!(!manager.is_scanning());

    manager
        .handle_event(TransportEvent::AdapterState(AdapterState::PoweredOn))
        .await;

    assert_eq!(transport.count(|c| matches!(c, Command::StartScan(_))), 1);
    assert!(manager.is_scanning());
}

#[tokio::test]
async fn start_scan_fails_when_adapter_unavailable() {
    let transport = FakeTransport::new();
    let manager = CentralManager::new(
        transport.clone() as Arc<dyn BleTransport>,
        CentralConfig::default(),
    );
    manager
        .handle_event(TransportEvent::AdapterState(AdapterState::PoweredOff))
        .await;

    match manager.start_scan().await {
        Err(Error::AdapterUnavailable { state }) => {
            assert_eq!(state, AdapterState::PoweredOff);
        }
        other => panic!("unexpected result: {:?}", other.map(|_| ())),
    }
}

#[tokio::test]
async fn connect_and_walk_reaches_ready() {
    let (transport, manager, mut events) = powered_manager(target_policy("dev-a")).await;
    manager.start_scan().await.unwrap();
    let device = DeviceId::from("dev-a");

    manager.handle_event(advertisement("dev-a", -60)).await;
    walk_to_ready(&manager, &device).await;

    assert_eq!(
        transport.commands(),
        vec![
            Command::StartScan(vec![]),
            Command::Connect(device.clone()),
            Command::StopScan,
            Command::DiscoverServices(device.clone(), vec![TRANSFER_SERVICE_UUID]),
            Command::DiscoverCharacteristics(
                device.clone(),
                TRANSFER_SERVICE_UUID,
                vec![TRANSFER_CHARACTERISTIC_UUID],
            ),
            Command::SetNotify(device.clone(), TRANSFER_CHARACTERISTIC_UUID, true),
        ]
    );

    let surfaced = drain(&mut events);
    assert_eq!(surfaced.len(), 2);
    assert!(matches!(surfaced[0], CentralEvent::Connected { .. }));
    match &surfaced[1] {
        CentralEvent::ReadyForData {
            device: ready,
            characteristic,
        } => {
            assert_eq!(*ready, device);
            assert_eq!(characteristic.service, TRANSFER_SERVICE_UUID);
            assert_eq!(characteristic.characteristic, TRANSFER_CHARACTERISTIC_UUID);
            assert!(characteristic.is_notifying);
        }
        other => panic!("unexpected event: {:?}", other),
    }

    assert_eq!(manager.session_phase(), Some(SessionPhase::Ready));
    assert!(!manager.is_scanning());

    // A duplicate notification-active event must not fire a second ready.
    manager
        .handle_event(TransportEvent::NotificationStateChanged {
            device: device.clone(),
            characteristic: TRANSFER_CHARACTERISTIC_UUID,
            is_notifying: true,
            error: None,
        })
        .await;
    assert!(drain(&mut events).is_empty());
}

#[tokio::test]
async fn no_characteristic_discovery_without_returned_service() {
    let (transport, manager, mut events) = powered_manager(target_policy("dev-a")).await;
    let device = DeviceId::from("dev-a");

    manager.handle_event(advertisement("dev-a", -60)).await;
    manager
        .handle_event(TransportEvent::Connected {
            device: device.clone(),
        })
        .await;
    manager
        .handle_event(TransportEvent::ServicesDiscovered {
            device: device.clone(),
            result: Ok(vec![]),
        })
        .await;

    assert_eq!(
        transport.count(|c| matches!(c, Command::DiscoverCharacteristics(..))),
        0
    );
    let stalled = drain(&mut events)
        .into_iter()
        .find_map(|event| match event {
            CentralEvent::SessionStalled { error, .. } => Some(error),
            _ => None,
        });
    assert_eq!(
        stalled,
        Some(SessionError::ServiceNotFound {
            uuid: TRANSFER_SERVICE_UUID
        })
    );
}

#[tokio::test]
async fn discovery_error_stalls_without_retry() {
    let (transport, manager, mut events) = powered_manager(target_policy("dev-a")).await;
    let device = DeviceId::from("dev-a");

    manager.handle_event(advertisement("dev-a", -60)).await;
    manager
        .handle_event(TransportEvent::Connected {
            device: device.clone(),
        })
        .await;
    drain(&mut events);

    manager
        .handle_event(TransportEvent::ServicesDiscovered {
            device: device.clone(),
            result: Err("gatt failure".to_string()),
        })
        .await;

    match drain(&mut events).as_slice() {
        [CentralEvent::SessionStalled { phase, error, .. }] => {
            assert_eq!(*phase, SessionPhase::ServicesPending);
            assert_eq!(
                *error,
                SessionError::ServiceDiscoveryFailed {
                    reason: "gatt failure".to_string()
                }
            );
        }
        other => panic!("unexpected events: {:?}", other),
    }
    // The stall is terminal: no re-issued discovery.
    assert_eq!(
        transport.count(|c| matches!(c, Command::DiscoverServices(..))),
        1
    );
    assert_eq!(manager.session_phase(), Some(SessionPhase::ServicesPending));
}

#[tokio::test]
async fn invalidation_rediscovers_once_and_recovers() {
    let (transport, manager, mut events) = powered_manager(target_policy("dev-a")).await;
    manager.start_scan().await.unwrap();
    let device = DeviceId::from("dev-a");

    manager.handle_event(advertisement("dev-a", -60)).await;
    walk_to_ready(&manager, &device).await;
    drain(&mut events);

    manager
        .handle_event(TransportEvent::ServicesInvalidated {
            device: device.clone(),
            services: vec![TRANSFER_SERVICE_UUID],
        })
        .await;

    // Exactly one re-issued service discovery per invalidation event.
    assert_eq!(
        transport.count(|c| matches!(c, Command::DiscoverServices(..))),
        2
    );
    assert_eq!(manager.session_phase(), Some(SessionPhase::ServicesPending));
    assert!(manager.transfer_characteristic().is_none());

    // A second successful walk reaches Ready again.
    manager
        .handle_event(TransportEvent::ServicesDiscovered {
            device: device.clone(),
            result: Ok(vec![TRANSFER_SERVICE_UUID]),
        })
        .await;
    manager
        .handle_event(TransportEvent::CharacteristicsDiscovered {
            device: device.clone(),
            service: TRANSFER_SERVICE_UUID,
            result: Ok(vec![TRANSFER_CHARACTERISTIC_UUID]),
        })
        .await;
    manager
        .handle_event(TransportEvent::NotificationStateChanged {
            device: device.clone(),
            characteristic: TRANSFER_CHARACTERISTIC_UUID,
            is_notifying: true,
            error: None,
        })
        .await;

    assert_eq!(manager.session_phase(), Some(SessionPhase::Ready));
    assert!(drain(&mut events)
        .iter()
        .any(|event| matches!(event, CentralEvent::ReadyForData { .. })));
}

#[tokio::test]
async fn disconnect_clears_state_in_any_phase() {
    let (transport, manager, mut events) = powered_manager(target_policy("dev-a")).await;
    let device = DeviceId::from("dev-a");

    manager.handle_event(advertisement("dev-a", -60)).await;
    manager
        .handle_event(TransportEvent::Connected {
            device: device.clone(),
        })
        .await;
    manager
        .handle_event(TransportEvent::ServicesDiscovered {
            device: device.clone(),
            result: Ok(vec![TRANSFER_SERVICE_UUID]),
        })
        .await;
    drain(&mut events);

    // Disconnect lands mid-walk, in CharacteristicsPending.
    manager
        .handle_event(TransportEvent::Disconnected {
            device: device.clone(),
            reason: Some("link lost".to_string()),
        })
        .await;

    match drain(&mut events).as_slice() {
        [CentralEvent::Disconnected { reason, .. }] => {
            assert_eq!(reason.as_deref(), Some("link lost"));
        }
        other => panic!("unexpected events: {:?}", other),
    }
    assert!(manager.active_device().is_none());
    assert!(manager.session_phase().is_none());
    assert!(manager.transfer_characteristic().is_none());

    // Late walk events for the torn-down session are ignored.
    manager
        .handle_event(TransportEvent::CharacteristicsDiscovered {
            device: device.clone(),
            service: TRANSFER_SERVICE_UUID,
            result: Ok(vec![TRANSFER_CHARACTERISTIC_UUID]),
        })
        .await;
    assert_eq!(transport.count(|c| matches!(c, Command::SetNotify(..))), 0);
    assert!(drain(&mut events).is_empty());
}

#[tokio::test]
async fn connect_failure_frees_slot_and_keeps_scanning() {
    let (transport, manager, mut events) = powered_manager(target_policy("dev-a")).await;
    manager.start_scan().await.unwrap();
    let device = DeviceId::from("dev-a");

    manager.handle_event(advertisement("dev-a", -60)).await;
    manager
        .handle_event(TransportEvent::ConnectFailed {
            device: device.clone(),
            reason: "timed out".to_string(),
        })
        .await;

    match drain(&mut events).as_slice() {
        [CentralEvent::ConnectFailed { reason, .. }] => {
            assert_eq!(reason, "timed out");
        }
        other => panic!("unexpected events: {:?}", other),
    }
    assert!(manager.is_scanning());
    assert!(manager.active_device().is_none());

    // The next advertisement may try again.
    manager.handle_event(advertisement("dev-a", -60)).await;
    assert_eq!(transport.count(|c| matches!(c, Command::Connect(_))), 2);
}

#[tokio::test]
async fn cancel_connect_clears_slot_and_target() {
    let (transport, manager, mut events) = powered_manager(target_policy("dev-a")).await;
    manager.start_scan().await.unwrap();
    let device = DeviceId::from("dev-a");

    manager.handle_event(advertisement("dev-a", -60)).await;
    walk_to_ready(&manager, &device).await;
    drain(&mut events);

    manager.cancel_connect().await.unwrap();

    assert_eq!(
        transport.count(|c| matches!(c, Command::CancelConnection(_))),
        1
    );
    assert!(manager.active_device().is_none());
    assert!(manager.scan_policy().target.is_none());

    // The transport's disconnect event after the eager clear is idempotent.
    manager
        .handle_event(TransportEvent::Disconnected {
            device: device.clone(),
            reason: None,
        })
        .await;
    assert!(drain(&mut events).is_empty());

    // With the target cleared, the same device now surfaces as a plain
    // discovery instead of reconnecting.
    manager.handle_event(advertisement("dev-a", -60)).await;
    assert!(matches!(
        drain(&mut events).as_slice(),
        [CentralEvent::Discovered(_)]
    ));
    assert_eq!(transport.count(|c| matches!(c, Command::Connect(_))), 1);
}

#[tokio::test]
async fn notification_cancel_drops_back_to_subscription_pending() {
    let (_transport, manager, _events) = powered_manager(target_policy("dev-a")).await;
    let device = DeviceId::from("dev-a");

    manager.handle_event(advertisement("dev-a", -60)).await;
    walk_to_ready(&manager, &device).await;

    manager
        .handle_event(TransportEvent::NotificationStateChanged {
            device: device.clone(),
            characteristic: TRANSFER_CHARACTERISTIC_UUID,
            is_notifying: false,
            error: None,
        })
        .await;

    assert_eq!(
        manager.session_phase(),
        Some(SessionPhase::SubscriptionPending)
    );
    assert!(!manager.transfer_characteristic().unwrap().is_notifying);
}

#[tokio::test]
async fn configure_refused_while_scanning_or_connected() {
    let (_transport, manager, _events) = powered_manager(ScanPolicy::default()).await;

    manager.start_scan().await.unwrap();
    assert!(matches!(
        manager.configure(Some(DeviceId::from("dev-a")), -60),
        Err(Error::ScanActive)
    ));

    manager.stop_scan().await.unwrap();
    manager.configure(Some(DeviceId::from("dev-a")), -60).unwrap();
    assert_eq!(manager.scan_policy().minimum_rssi, -60);

    manager.start_scan().await.unwrap();
    manager.handle_event(advertisement("dev-a", -55)).await;
    manager
        .handle_event(TransportEvent::Connected {
            device: DeviceId::from("dev-a"),
        })
        .await;

    assert!(matches!(
        manager.configure(None, -66),
        Err(Error::ConnectionBusy { .. })
    ));
}

#[tokio::test]
async fn unsolicited_connected_event_is_ignored() {
    let (transport, manager, mut events) = powered_manager(ScanPolicy::default()).await;

    manager
        .handle_event(TransportEvent::Connected {
            device: DeviceId::from("dev-x"),
        })
        .await;

    assert!(drain(&mut events).is_empty());
    assert!(manager.active_device().is_none());
    assert_eq!(
        transport.count(|c| matches!(c, Command::DiscoverServices(..))),
        0
    );
}
