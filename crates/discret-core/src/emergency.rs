use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

use crate::access::{Actor, AuditLog, AuditResult, Role};
use crate::notify::{Channel, NotificationService, Priority};
use crate::realtime::{Audience, Broadcaster, RealtimeEvent};
use discret_shared::constants::{ACCEL_BUFFER_DEPTH, IMPACT_G_THRESHOLD};
use discret_shared::geo::RawCoordinates;
use discret_shared::types::{DeliveryId, UserId};
use thiserror::Error;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EmergencyType {
    PanicButton,
    AccidentDetected,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EmergencyStatus {
    Triggered,
    Responding,
    Acknowledged,
    Resolved,
}

/// The privacy exception: this record carries raw coordinates, and it is
/// the only place in the system allowed to.
#[derive(Debug, Clone, Serialize)]
pub struct EmergencyRecord {
    pub id: Uuid,
    pub driver_id: UserId,
    pub delivery_id: Option<DeliveryId>,
    pub emergency_type: EmergencyType,
    pub location: RawCoordinates,
    pub triggered_at: DateTime<Utc>,
    pub status: EmergencyStatus,
    pub notifications: Vec<Uuid>,
    pub acknowledged_by: Option<UserId>,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub resolved_by: Option<UserId>,
    pub resolved_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AccelReading {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub t: DateTime<Utc>,
}

impl AccelReading {
    pub fn g_force(&self) -> f64 {
        (self.x * self.x + self.y * self.y + self.z * self.z).sqrt()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmergencyContact {
    pub user_id: UserId,
    pub name: String,
    pub channel: Channel,
}

#[derive(Error, Debug)]
pub enum EmergencyError {
    #[error("emergency {0} not_found")]
    NotFound(Uuid),
}

#[derive(Default)]
struct EmergencyState {
    emergencies: HashMap<Uuid, EmergencyRecord>,
    active: HashMap<UserId, Uuid>,
    accel: HashMap<UserId, VecDeque<AccelReading>>,
    contacts: HashMap<UserId, Vec<EmergencyContact>>,
}

/// Privileged path that bypasses location privacy when a life is at risk.
pub struct EmergencyService {
    audit: Arc<AuditLog>,
    notifier: Arc<NotificationService>,
    broadcaster: Arc<Broadcaster>,
    inner: RwLock<EmergencyState>,
}

impl EmergencyService {
    pub fn new(
        audit: Arc<AuditLog>,
        notifier: Arc<NotificationService>,
        broadcaster: Arc<Broadcaster>,
    ) -> Self {
        Self {
            audit,
            notifier,
            broadcaster,
            inner: RwLock::new(EmergencyState::default()),
        }
    }

    /// Panic button. Idempotent while the driver has a non-resolved
    /// emergency: the existing record is returned untouched.
    pub async fn panic(
        &self,
        actor: Actor,
        driver_id: UserId,
        location: RawCoordinates,
        delivery_id: Option<DeliveryId>,
    ) -> EmergencyRecord {
        if let Some(existing) = self.active_for(driver_id).await {
            return existing;
        }
        self.trigger(actor, driver_id, EmergencyType::PanicButton, location, delivery_id)
            .await
    }

    /// Impact detection over the accelerometer stream.
    pub async fn accelerometer(
        &self,
        actor: Actor,
        driver_id: UserId,
        reading: AccelReading,
        location: RawCoordinates,
        delivery_id: Option<DeliveryId>,
    ) -> Option<EmergencyRecord> {
        let impact = {
            let mut state = self.inner.write().await;
            let buffer = state.accel.entry(driver_id).or_default();
            buffer.push_back(reading);
            if buffer.len() > ACCEL_BUFFER_DEPTH {
                buffer.pop_front();
            }
            reading.g_force() >= IMPACT_G_THRESHOLD
        };

        if !impact {
            return None;
        }
        if let Some(existing) = self.active_for(driver_id).await {
            return Some(existing);
        }

        warn!(%driver_id, g_force = reading.g_force(), "impact detected");
        Some(
            self.trigger(
                actor,
                driver_id,
                EmergencyType::AccidentDetected,
                location,
                delivery_id,
            )
            .await,
        )
    }

    async fn trigger(
        &self,
        actor: Actor,
        driver_id: UserId,
        emergency_type: EmergencyType,
        location: RawCoordinates,
        delivery_id: Option<DeliveryId>,
    ) -> EmergencyRecord {
        let record = {
            let mut state = self.inner.write().await;
            // Racing triggers for the same driver collapse onto the first.
            if let Some(id) = state.active.get(&driver_id) {
                if let Some(existing) = state.emergencies.get(id) {
                    if existing.status != EmergencyStatus::Resolved {
                        return existing.clone();
                    }
                }
            }

            let record = EmergencyRecord {
                id: Uuid::new_v4(),
                driver_id,
                delivery_id,
                emergency_type,
                location,
                triggered_at: Utc::now(),
                status: EmergencyStatus::Triggered,
                notifications: Vec::new(),
                acknowledged_by: None,
                acknowledged_at: None,
                resolved_by: None,
                resolved_at: None,
            };
            state.emergencies.insert(record.id, record.clone());
            state.active.insert(driver_id, record.id);
            record
        };

        info!(emergency_id = %record.id, %driver_id, kind = ?emergency_type, "emergency triggered");
        self.audit
            .record(
                actor.user_id,
                actor.role,
                "emergency.trigger",
                "emergency",
                Some(record.id.to_string()),
                json!({"type": emergency_type, "delivery_id": delivery_id}),
                AuditResult::Success,
            )
            .await;

        self.initiate_response(record).await
    }

    /// Move to `responding`, fan out critical notifications to the driver's
    /// configured contacts, and alert responders over the push fabric.
    async fn initiate_response(&self, record: EmergencyRecord) -> EmergencyRecord {
        let contacts = {
            let state = self.inner.read().await;
            state.contacts.get(&record.driver_id).cloned().unwrap_or_default()
        };

        let mut notification_ids = Vec::new();
        for contact in &contacts {
            let send = self
                .notifier
                .send(
                    Actor::system(),
                    contact.user_id,
                    contact.channel,
                    "emergency_alert",
                    &format!(
                        "Emergency for your driver contact: {:?} at {:.4},{:.4}",
                        record.emergency_type, record.location.latitude, record.location.longitude
                    ),
                    Priority::Critical,
                )
                .await;
            match send {
                Ok(n) => notification_ids.push(n.id),
                Err(e) => warn!(error = %e, contact = %contact.user_id, "emergency notification rejected"),
            }
        }

        // Raw coordinates ride along here and nowhere else.
        self.broadcaster
            .broadcast(RealtimeEvent::new(
                "alert:emergency",
                json!({
                    "emergency_id": record.id,
                    "driver_id": record.driver_id,
                    "delivery_id": record.delivery_id,
                    "type": record.emergency_type,
                    "location": {
                        "latitude": record.location.latitude,
                        "longitude": record.location.longitude,
                    },
                    "triggered_at": record.triggered_at,
                }),
                Audience::roles(vec![Role::SecurityOfficer, Role::Admin, Role::Dispatcher]),
            ))
            .await;

        let mut state = self.inner.write().await;
        match state.emergencies.get_mut(&record.id) {
            Some(stored) => {
                stored.status = EmergencyStatus::Responding;
                stored.notifications = notification_ids;
                stored.clone()
            }
            None => record,
        }
    }

    pub async fn acknowledge(
        &self,
        actor: Actor,
        id: Uuid,
        by: UserId,
    ) -> Result<EmergencyRecord, EmergencyError> {
        let record = {
            let mut state = self.inner.write().await;
            let record = state
                .emergencies
                .get_mut(&id)
                .ok_or(EmergencyError::NotFound(id))?;
            if matches!(
                record.status,
                EmergencyStatus::Triggered | EmergencyStatus::Responding
            ) {
                record.status = EmergencyStatus::Acknowledged;
                record.acknowledged_by = Some(by);
                record.acknowledged_at = Some(Utc::now());
            }
            record.clone()
        };

        self.audit
            .record(
                actor.user_id,
                actor.role,
                "emergency.acknowledge",
                "emergency",
                Some(id.to_string()),
                json!({}),
                AuditResult::Success,
            )
            .await;
        Ok(record)
    }

    /// Resolving clears the driver's active-emergency slot.
    pub async fn resolve(
        &self,
        actor: Actor,
        id: Uuid,
        by: UserId,
    ) -> Result<EmergencyRecord, EmergencyError> {
        let record = {
            let mut state = self.inner.write().await;
            let record = state
                .emergencies
                .get_mut(&id)
                .ok_or(EmergencyError::NotFound(id))?;
            if record.status != EmergencyStatus::Resolved {
                record.status = EmergencyStatus::Resolved;
                record.resolved_by = Some(by);
                record.resolved_at = Some(Utc::now());
            }
            let record = record.clone();
            state.active.remove(&record.driver_id);
            record
        };

        self.audit
            .record(
                actor.user_id,
                actor.role,
                "emergency.resolve",
                "emergency",
                Some(id.to_string()),
                json!({}),
                AuditResult::Success,
            )
            .await;
        Ok(record)
    }

    /// Reading an emergency exposes raw coordinates, so it lands in the
    /// audit log too.
    pub async fn get(&self, actor: Actor, id: Uuid) -> Option<EmergencyRecord> {
        let record = self.inner.read().await.emergencies.get(&id).cloned();
        if record.is_some() {
            self.audit
                .record(
                    actor.user_id,
                    actor.role,
                    "emergency.read",
                    "emergency",
                    Some(id.to_string()),
                    json!({}),
                    AuditResult::Success,
                )
                .await;
        }
        record
    }

    pub async fn active_for(&self, driver_id: UserId) -> Option<EmergencyRecord> {
        let state = self.inner.read().await;
        let id = state.active.get(&driver_id)?;
        state
            .emergencies
            .get(id)
            .filter(|r| r.status != EmergencyStatus::Resolved)
            .cloned()
    }

    pub async fn list(&self) -> Vec<EmergencyRecord> {
        let state = self.inner.read().await;
        let mut all: Vec<EmergencyRecord> = state.emergencies.values().cloned().collect();
        all.sort_by(|a, b| b.triggered_at.cmp(&a.triggered_at));
        all
    }

    pub async fn set_contacts(
        &self,
        actor: Actor,
        driver_id: UserId,
        contacts: Vec<EmergencyContact>,
    ) {
        {
            let mut state = self.inner.write().await;
            state.contacts.insert(driver_id, contacts);
        }
        self.audit
            .record(
                actor.user_id,
                actor.role,
                "emergency.contacts_update",
                "emergency",
                Some(driver_id.to_string()),
                json!({}),
                AuditResult::Success,
            )
            .await;
    }

    pub async fn contacts(&self, driver_id: UserId) -> Vec<EmergencyContact> {
        self.inner
            .read()
            .await
            .contacts
            .get(&driver_id)
            .cloned()
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ENC_KEY: &[u8] = b"unit-test-encryption-key-32-bytes!!";

    fn service() -> (EmergencyService, Arc<Broadcaster>, Arc<AuditLog>) {
        let audit = Arc::new(AuditLog::new());
        let broadcaster = Arc::new(Broadcaster::new());
        let notifier = Arc::new(NotificationService::new(ENC_KEY, audit.clone()));
        (
            EmergencyService::new(audit.clone(), notifier, broadcaster.clone()),
            broadcaster,
            audit,
        )
    }

    fn nairobi() -> RawCoordinates {
        RawCoordinates::new(-1.300, 36.800).unwrap()
    }

    #[tokio::test]
    async fn test_panic_creates_responding_emergency() {
        let (svc, _, _) = service();
        let driver = UserId::new();

        let record = svc
            .panic(Actor::default(), driver, nairobi(), None)
            .await;
        assert_eq!(record.status, EmergencyStatus::Responding);
        assert_eq!(record.emergency_type, EmergencyType::PanicButton);
        assert_eq!(record.location, nairobi());
    }

    #[tokio::test]
    async fn test_panic_idempotent_while_active() {
        let (svc, _, _) = service();
        let driver = UserId::new();
        let actor = Actor::default();

        let first = svc.panic(actor, driver, nairobi(), None).await;
        let second = svc.panic(actor, driver, nairobi(), None).await;
        assert_eq!(first.id, second.id);

        // Resolving reopens the path for a fresh emergency
        svc.resolve(actor, first.id, UserId::new()).await.unwrap();
        assert!(svc.active_for(driver).await.is_none());
        let third = svc.panic(actor, driver, nairobi(), None).await;
        assert_ne!(first.id, third.id);
    }

    #[tokio::test]
    async fn test_accelerometer_threshold() {
        let (svc, _, _) = service();
        let driver = UserId::new();
        let actor = Actor::default();

        let gentle = AccelReading {
            x: 0.1,
            y: 0.2,
            z: 1.0,
            t: Utc::now(),
        };
        assert!(svc
            .accelerometer(actor, driver, gentle, nairobi(), None)
            .await
            .is_none());

        let crash = AccelReading {
            x: 3.5,
            y: 2.8,
            z: 1.2,
            t: Utc::now(),
        };
        assert!(crash.g_force() >= IMPACT_G_THRESHOLD);
        let record = svc
            .accelerometer(actor, driver, crash, nairobi(), None)
            .await
            .unwrap();
        assert_eq!(record.emergency_type, EmergencyType::AccidentDetected);

        // A second impact while active returns the same record
        let again = svc
            .accelerometer(actor, driver, crash, nairobi(), None)
            .await
            .unwrap();
        assert_eq!(record.id, again.id);
    }

    #[tokio::test]
    async fn test_emergency_broadcast_carries_raw_location() {
        let (svc, broadcaster, _) = service();

        let (conn, mut rx) = broadcaster.connect().await;
        broadcaster
            .authenticate(conn, UserId::new(), Role::SecurityOfficer)
            .await;

        svc.panic(Actor::default(), UserId::new(), nairobi(), None)
            .await;

        let event = rx.try_recv().unwrap();
        assert_eq!(event.name, "alert:emergency");
        assert_eq!(event.payload["location"]["latitude"], -1.300);
    }

    #[tokio::test]
    async fn test_contacts_notified_on_panic() {
        let (svc, _, _) = service();
        let driver = UserId::new();
        let actor = Actor::default();

        svc.set_contacts(
            actor,
            driver,
            vec![
                EmergencyContact {
                    user_id: UserId::new(),
                    name: "Dispatch desk".into(),
                    channel: Channel::Sms,
                },
                EmergencyContact {
                    user_id: UserId::new(),
                    name: "Family".into(),
                    channel: Channel::Whatsapp,
                },
            ],
        )
        .await;

        let record = svc.panic(actor, driver, nairobi(), None).await;
        assert_eq!(record.notifications.len(), 2);
    }

    #[tokio::test]
    async fn test_lifecycle_transitions() {
        let (svc, _, _) = service();
        let actor = Actor::default();
        let officer = UserId::new();

        let record = svc.panic(actor, UserId::new(), nairobi(), None).await;

        let acked = svc.acknowledge(actor, record.id, officer).await.unwrap();
        assert_eq!(acked.status, EmergencyStatus::Acknowledged);

        let resolved = svc.resolve(actor, record.id, officer).await.unwrap();
        assert_eq!(resolved.status, EmergencyStatus::Resolved);
        assert_eq!(resolved.resolved_by, Some(officer));
    }

    #[tokio::test]
    async fn test_unknown_emergency_not_found() {
        let (svc, _, _) = service();
        assert!(matches!(
            svc.acknowledge(Actor::default(), Uuid::new_v4(), UserId::new())
                .await
                .unwrap_err(),
            EmergencyError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_accel_buffer_bounded() {
        let (svc, _, _) = service();
        let driver = UserId::new();
        let calm = AccelReading {
            x: 0.0,
            y: 0.0,
            z: 1.0,
            t: Utc::now(),
        };
        for _ in 0..50 {
            svc.accelerometer(Actor::default(), driver, calm, nairobi(), None)
                .await;
        }
        assert_eq!(
            svc.inner.read().await.accel[&driver].len(),
            ACCEL_BUFFER_DEPTH
        );
    }
}
