//! Per-connection GATT walk.
//!
//! A [`PeripheralSession`] drives one connected peripheral from service
//! discovery to an active notification subscription. The walk is linear:
//! `ServicesPending -> CharacteristicsPending -> SubscriptionPending -> Ready`,
//! with service invalidation looping back to `ServicesPending`. Every error
//! is surfaced once and stalls the session; there is no internal retry, the
//! caller recovers by disconnecting and reconnecting.
//!
//! The session mutates state only; radio work is returned as
//! [`SessionRequest`]s for the manager to issue after releasing its lock.

use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::device::{DeviceId, TransferCharacteristicRef};
use crate::manager::CentralEvent;

/// Phase of the GATT walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum SessionPhase {
    /// Waiting for service discovery to complete.
    ServicesPending,
    /// Waiting for characteristic discovery to complete.
    CharacteristicsPending,
    /// Waiting for the notification subscription to take effect.
    SubscriptionPending,
    /// Subscribed; the peripheral pushes data until disconnect.
    Ready,
}

impl std::fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ServicesPending => write!(f, "ServicesPending"),
            Self::CharacteristicsPending => write!(f, "CharacteristicsPending"),
            Self::SubscriptionPending => write!(f, "SubscriptionPending"),
            Self::Ready => write!(f, "Ready"),
        }
    }
}

/// Error that stalled a session, surfaced once to the caller.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// Service discovery failed at the transport level.
    #[error("Service discovery failed: {reason}")]
    ServiceDiscoveryFailed {
        /// Transport-reported reason.
        reason: String,
    },

    /// The target service was not present in the discovery result.
    #[error("Service not found: {uuid}")]
    ServiceNotFound {
        /// The UUID of the missing service.
        uuid: Uuid,
    },

    /// Characteristic discovery failed at the transport level.
    #[error("Characteristic discovery failed on service {service}: {reason}")]
    CharacteristicDiscoveryFailed {
        /// The service the discovery ran against.
        service: Uuid,
        /// Transport-reported reason.
        reason: String,
    },

    /// The target characteristic was not present in the discovery result.
    #[error("Characteristic not found: {uuid}")]
    CharacteristicNotFound {
        /// The UUID of the missing characteristic.
        uuid: Uuid,
    },

    /// Enabling notifications failed.
    #[error("Subscription failed on characteristic {characteristic}: {reason}")]
    SubscriptionFailed {
        /// The characteristic the subscription targeted.
        characteristic: Uuid,
        /// Transport-reported reason.
        reason: String,
    },
}

/// Radio work a session transition asks the manager to issue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum SessionRequest {
    /// Discover the target service.
    DiscoverServices,
    /// Discover the target characteristic within one discovered service.
    DiscoverCharacteristics {
        /// The service to walk.
        service: Uuid,
    },
    /// Enable notifications on the bound characteristic.
    EnableNotifications {
        /// The characteristic to subscribe to.
        characteristic: Uuid,
    },
}

/// State machine for one connected peripheral.
pub struct PeripheralSession {
    /// The connected device.
    device: DeviceId,
    /// The service to walk.
    service_uuid: Uuid,
    /// The notifying characteristic to bind.
    characteristic_uuid: Uuid,
    /// Current walk phase.
    phase: SessionPhase,
    /// The bound transfer characteristic, once discovered.
    transfer: Option<TransferCharacteristicRef>,
    /// Channel for caller-facing events.
    event_tx: broadcast::Sender<CentralEvent>,
}

impl PeripheralSession {
    /// Create a session for a freshly connected device.
    pub(crate) fn new(
        device: DeviceId,
        service_uuid: Uuid,
        characteristic_uuid: Uuid,
        event_tx: broadcast::Sender<CentralEvent>,
    ) -> Self {
        Self {
            device,
            service_uuid,
            characteristic_uuid,
            phase: SessionPhase::ServicesPending,
            transfer: None,
            event_tx,
        }
    }

    /// The device this session belongs to.
    pub fn device(&self) -> &DeviceId {
        &self.device
    }

    /// Current walk phase.
    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    /// The bound transfer characteristic, once discovered.
    pub fn transfer_ref(&self) -> Option<&TransferCharacteristicRef> {
        self.transfer.as_ref()
    }

    /// Begin the walk by requesting service discovery.
    pub(crate) fn start(&mut self) -> Vec<SessionRequest> {
        debug!("Starting GATT walk on {}", self.device);
        self.phase = SessionPhase::ServicesPending;
        vec![SessionRequest::DiscoverServices]
    }

    /// Handle a service discovery result.
    pub(crate) fn on_services_discovered(
        &mut self,
        result: Result<Vec<Uuid>, String>,
    ) -> Vec<SessionRequest> {
        if self.phase != SessionPhase::ServicesPending {
            debug!(
                "Ignoring service discovery result in phase {} on {}",
                self.phase, self.device
            );
            return Vec::new();
        }

        let services = match result {
            Ok(services) => services,
            Err(reason) => {
                self.stall(SessionError::ServiceDiscoveryFailed { reason });
                return Vec::new();
            }
        };

        // Walk only services the discovery actually returned, never a
        // superset list.
        let requests: Vec<SessionRequest> = services
            .into_iter()
            .filter(|uuid| *uuid == self.service_uuid)
            .map(|service| SessionRequest::DiscoverCharacteristics { service })
            .collect();

        if requests.is_empty() {
            self.stall(SessionError::ServiceNotFound {
                uuid: self.service_uuid,
            });
            return Vec::new();
        }

        debug!("Transfer service found on {}", self.device);
        self.phase = SessionPhase::CharacteristicsPending;
        requests
    }

    /// Handle a characteristic discovery result for one service.
    pub(crate) fn on_characteristics_discovered(
        &mut self,
        service: Uuid,
        result: Result<Vec<Uuid>, String>,
    ) -> Vec<SessionRequest> {
        if self.phase != SessionPhase::CharacteristicsPending {
            debug!(
                "Ignoring characteristic discovery result in phase {} on {}",
                self.phase, self.device
            );
            return Vec::new();
        }

        let characteristics = match result {
            Ok(characteristics) => characteristics,
            Err(reason) => {
                self.stall(SessionError::CharacteristicDiscoveryFailed { service, reason });
                return Vec::new();
            }
        };

        if !characteristics.contains(&self.characteristic_uuid) {
            self.stall(SessionError::CharacteristicNotFound {
                uuid: self.characteristic_uuid,
            });
            return Vec::new();
        }

        debug!("Transfer characteristic found on {}", self.device);
        self.transfer = Some(TransferCharacteristicRef {
            service,
            characteristic: self.characteristic_uuid,
            is_notifying: false,
        });
        self.phase = SessionPhase::SubscriptionPending;

        vec![SessionRequest::EnableNotifications {
            characteristic: self.characteristic_uuid,
        }]
    }

    /// Handle a notification state change.
    pub(crate) fn on_notification_state(
        &mut self,
        characteristic: Uuid,
        is_notifying: bool,
        error: Option<String>,
    ) -> Vec<SessionRequest> {
        if characteristic != self.characteristic_uuid {
            return Vec::new();
        }

        if let Some(reason) = error {
            self.stall(SessionError::SubscriptionFailed {
                characteristic,
                reason,
            });
            return Vec::new();
        }

        if is_notifying {
            if self.phase != SessionPhase::Ready {
                if let Some(transfer) = self.transfer.as_mut() {
                    transfer.is_notifying = true;
                }
                self.phase = SessionPhase::Ready;
                info!("Notifications active on {}", self.device);
                if let Some(transfer) = self.transfer.clone() {
                    let _ = self.event_tx.send(CentralEvent::ReadyForData {
                        device: self.device.clone(),
                        characteristic: transfer,
                    });
                }
            }
        } else {
            // Subscription cancelled by the peripheral; steady until
            // disconnect or external intervention.
            if let Some(transfer) = self.transfer.as_mut() {
                transfer.is_notifying = false;
            }
            if self.phase == SessionPhase::Ready {
                self.phase = SessionPhase::SubscriptionPending;
            }
            debug!("Notifications cancelled on {}", self.device);
        }

        Vec::new()
    }

    /// Handle invalidation of services by the remote device.
    ///
    /// If the transfer service is among the invalidated ones, all bound state
    /// is discarded and the walk restarts from service discovery.
    pub(crate) fn on_services_invalidated(&mut self, services: &[Uuid]) -> Vec<SessionRequest> {
        if !services.contains(&self.service_uuid) {
            return Vec::new();
        }

        info!(
            "Transfer service invalidated on {}, re-discovering",
            self.device
        );
        self.transfer = None;
        self.phase = SessionPhase::ServicesPending;
        vec![SessionRequest::DiscoverServices]
    }

    /// Surface a stall once and leave the session in its current phase.
    pub(crate) fn stall(&mut self, error: SessionError) {
        warn!("Session stalled on {} ({}): {}", self.device, self.phase, error);
        let _ = self.event_tx.send(CentralEvent::SessionStalled {
            device: self.device.clone(),
            phase: self.phase,
            error,
        });
    }
}
