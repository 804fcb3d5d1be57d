use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::RwLock;
use tracing::warn;
use uuid::Uuid;

use crate::access::{Actor, AuditLog, AuditResult, Role};
use crate::obfuscate::ObfuscatedLocation;
use crate::realtime::{Audience, Broadcaster, RealtimeEvent};
use discret_shared::constants::LOCATION_HISTORY_DEPTH;
use discret_shared::types::{DeliveryId, MovementState, UserId};
use thiserror::Error;

const STOP_WINDOW: usize = 10;
const STOP_MIN_STATIONARY: usize = 3;
const STOP_MIN_SPAN: TimeDelta = TimeDelta::minutes(15);
const STOP_SUPPRESSION: TimeDelta = TimeDelta::minutes(30);

const RAPID_WINDOW: usize = 5;
const RAPID_MIN_ZONES: usize = 5;
const RAPID_MAX_SPAN: TimeDelta = TimeDelta::minutes(5);

const COMM_LOSS_AFTER: TimeDelta = TimeDelta::minutes(10);
const COMM_LOSS_ESCALATE: TimeDelta = TimeDelta::minutes(30);
const COMM_LOSS_SUPPRESSION: TimeDelta = TimeDelta::minutes(15);

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyType {
    RouteDeviation,
    UnusualStop,
    TamperingDetected,
    CommunicationLost,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStatus {
    FalsePositive,
    Investigated,
    Escalated,
    Resolved,
}

#[derive(Debug, Clone, Serialize)]
pub struct AlertResolution {
    pub status: ResolutionStatus,
    pub resolved_by: UserId,
    pub resolved_at: DateTime<Utc>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SecurityAlert {
    pub id: Uuid,
    pub delivery_id: DeliveryId,
    pub driver_id: UserId,
    pub vehicle_id: Option<String>,
    pub anomaly_type: AnomalyType,
    pub severity: Severity,
    pub zone_id: String,
    pub detected_at: DateTime<Utc>,
    pub description: String,
    pub acknowledged: bool,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub acknowledged_by: Option<UserId>,
    pub resolution: Option<AlertResolution>,
}

#[derive(Error, Debug)]
pub enum MonitorError {
    #[error("alert {0} not_found")]
    NotFound(Uuid),
}

#[derive(Debug, Clone, Default)]
pub struct AlertFilter {
    pub severity: Option<Severity>,
    pub unacknowledged_only: bool,
    pub delivery_id: Option<DeliveryId>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MonitorStats {
    pub total: usize,
    pub unacknowledged: usize,
    pub by_severity: HashMap<Severity, usize>,
    pub by_type: HashMap<AnomalyType, usize>,
}

#[derive(Debug, Clone)]
struct LocationEntry {
    zone_id: String,
    t: DateTime<Utc>,
    is_moving: bool,
}

#[derive(Default)]
struct MonitorState {
    history: HashMap<UserId, VecDeque<LocationEntry>>,
    last_delivery: HashMap<UserId, DeliveryId>,
    expected_routes: HashMap<DeliveryId, Vec<String>>,
    alerts: HashMap<Uuid, SecurityAlert>,
    last_comm_alert: HashMap<UserId, DateTime<Utc>>,
}

/// Anomaly detector over the stream of obfuscated fixes. Keeps a bounded
/// per-driver history and never sees a raw coordinate.
pub struct SecurityMonitor {
    audit: Arc<AuditLog>,
    broadcaster: Arc<Broadcaster>,
    inner: RwLock<MonitorState>,
}

impl SecurityMonitor {
    pub fn new(audit: Arc<AuditLog>, broadcaster: Arc<Broadcaster>) -> Self {
        Self {
            audit,
            broadcaster,
            inner: RwLock::new(MonitorState::default()),
        }
    }

    pub async fn register_expected_route(
        &self,
        actor: Actor,
        delivery_id: DeliveryId,
        zone_sequence: Vec<String>,
    ) {
        {
            let mut state = self.inner.write().await;
            state.expected_routes.insert(delivery_id, zone_sequence);
        }
        self.audit
            .record(
                actor.user_id,
                actor.role,
                "monitor.register_route",
                "delivery",
                Some(delivery_id.to_string()),
                json!({}),
                AuditResult::Success,
            )
            .await;
    }

    /// Append a fix to the driver's history and run the detectors.
    pub async fn process_location_update(
        &self,
        actor: Actor,
        delivery_id: DeliveryId,
        driver_id: UserId,
        location: &ObfuscatedLocation,
        vehicle_id: Option<String>,
    ) -> Vec<SecurityAlert> {
        let raised = {
            let mut state = self.inner.write().await;

            let is_moving = match location.movement_state {
                MovementState::Moving => true,
                MovementState::Stationary => false,
                // The obfuscator leaves movement unknown; infer it from the
                // previous zone.
                MovementState::Unknown => state
                    .history
                    .get(&driver_id)
                    .and_then(|h| h.back())
                    .map(|prev| prev.zone_id != location.zone_id)
                    .unwrap_or(false),
            };

            state.last_delivery.insert(driver_id, delivery_id);
            let history = state.history.entry(driver_id).or_default();
            history.push_back(LocationEntry {
                zone_id: location.zone_id.clone(),
                t: Utc::now(),
                is_moving,
            });
            if history.len() > LOCATION_HISTORY_DEPTH {
                history.pop_front();
            }

            let mut raised = Vec::new();
            if let Some(alert) =
                detect_route_deviation(&state, delivery_id, driver_id, &vehicle_id, location)
            {
                raised.push(alert);
            }
            if let Some(alert) =
                detect_unusual_stop(&state, delivery_id, driver_id, &vehicle_id, location)
            {
                raised.push(alert);
            }
            if let Some(alert) =
                detect_rapid_zone_changes(&state, delivery_id, driver_id, &vehicle_id, location)
            {
                raised.push(alert);
            }

            for alert in &raised {
                state.alerts.insert(alert.id, alert.clone());
            }
            raised
        };

        self.audit
            .record(
                actor.user_id,
                actor.role,
                "monitor.location_update",
                "location",
                Some(delivery_id.to_string()),
                json!({"zone_id": location.zone_id, "alerts_raised": raised.len()}),
                AuditResult::Success,
            )
            .await;

        for alert in &raised {
            warn!(
                alert_id = %alert.id,
                anomaly = ?alert.anomaly_type,
                severity = ?alert.severity,
                driver_id = %alert.driver_id,
                "security alert raised"
            );
            self.publish_alert(alert).await;
        }

        raised
    }

    /// Out-of-band tick: flag drivers that went quiet.
    pub async fn check_communication_loss(
        &self,
        actor: Actor,
        delivery_id: DeliveryId,
        driver_id: UserId,
        last_seen_at: DateTime<Utc>,
    ) -> Option<SecurityAlert> {
        let alert = {
            let mut state = self.inner.write().await;
            let silence = Utc::now() - last_seen_at;
            if silence < COMM_LOSS_AFTER {
                return None;
            }

            if let Some(last) = state.last_comm_alert.get(&driver_id) {
                if Utc::now() - *last < COMM_LOSS_SUPPRESSION {
                    return None;
                }
            }

            let severity = if silence >= COMM_LOSS_ESCALATE {
                Severity::High
            } else {
                Severity::Medium
            };
            let zone_id = state
                .history
                .get(&driver_id)
                .and_then(|h| h.back())
                .map(|e| e.zone_id.clone())
                .unwrap_or_default();

            let alert = new_alert(
                delivery_id,
                driver_id,
                None,
                AnomalyType::CommunicationLost,
                severity,
                zone_id,
                format!("no location fix for {} min", silence.num_minutes()),
            );
            state.alerts.insert(alert.id, alert.clone());
            state.last_comm_alert.insert(driver_id, Utc::now());
            alert
        };

        self.audit
            .record(
                actor.user_id,
                actor.role,
                "monitor.communication_loss",
                "security_alert",
                Some(alert.id.to_string()),
                json!({"severity": alert.severity}),
                AuditResult::Success,
            )
            .await;
        self.publish_alert(&alert).await;

        Some(alert)
    }

    /// Periodic sweep over every tracked driver's last fix.
    pub async fn sweep_communication_loss(&self) -> Vec<SecurityAlert> {
        let tracked: Vec<(DeliveryId, UserId, DateTime<Utc>)> = {
            let state = self.inner.read().await;
            state
                .history
                .iter()
                .filter_map(|(driver, history)| {
                    let last = history.back()?;
                    let delivery = state.last_delivery.get(driver)?;
                    Some((*delivery, *driver, last.t))
                })
                .collect()
        };

        let mut alerts = Vec::new();
        for (delivery_id, driver_id, last_seen) in tracked {
            if let Some(alert) = self
                .check_communication_loss(Actor::system(), delivery_id, driver_id, last_seen)
                .await
            {
                alerts.push(alert);
            }
        }
        alerts
    }

    pub async fn acknowledge(
        &self,
        actor: Actor,
        alert_id: Uuid,
        by: UserId,
    ) -> Result<SecurityAlert, MonitorError> {
        let alert = {
            let mut state = self.inner.write().await;
            let alert = state
                .alerts
                .get_mut(&alert_id)
                .ok_or(MonitorError::NotFound(alert_id))?;
            if !alert.acknowledged {
                alert.acknowledged = true;
                alert.acknowledged_at = Some(Utc::now());
                alert.acknowledged_by = Some(by);
            }
            alert.clone()
        };

        self.audit
            .record(
                actor.user_id,
                actor.role,
                "alert.acknowledge",
                "security_alert",
                Some(alert_id.to_string()),
                json!({}),
                AuditResult::Success,
            )
            .await;
        Ok(alert)
    }

    pub async fn resolve(
        &self,
        actor: Actor,
        alert_id: Uuid,
        by: UserId,
        status: ResolutionStatus,
        notes: Option<String>,
    ) -> Result<SecurityAlert, MonitorError> {
        let alert = {
            let mut state = self.inner.write().await;
            let alert = state
                .alerts
                .get_mut(&alert_id)
                .ok_or(MonitorError::NotFound(alert_id))?;
            // Resolution is terminal.
            if alert.resolution.is_none() {
                alert.resolution = Some(AlertResolution {
                    status,
                    resolved_by: by,
                    resolved_at: Utc::now(),
                    notes,
                });
            }
            alert.clone()
        };

        self.audit
            .record(
                actor.user_id,
                actor.role,
                "alert.resolve",
                "security_alert",
                Some(alert_id.to_string()),
                json!({"status": status}),
                AuditResult::Success,
            )
            .await;
        Ok(alert)
    }

    pub async fn alerts(&self, filter: &AlertFilter) -> Vec<SecurityAlert> {
        let state = self.inner.read().await;
        let mut alerts: Vec<SecurityAlert> = state
            .alerts
            .values()
            .filter(|a| filter.severity.is_none_or(|s| a.severity == s))
            .filter(|a| !filter.unacknowledged_only || !a.acknowledged)
            .filter(|a| filter.delivery_id.is_none_or(|d| a.delivery_id == d))
            .cloned()
            .collect();
        alerts.sort_by(|a, b| b.detected_at.cmp(&a.detected_at));
        alerts
    }

    pub async fn stats(&self) -> MonitorStats {
        let state = self.inner.read().await;
        let mut by_severity: HashMap<Severity, usize> = HashMap::new();
        let mut by_type: HashMap<AnomalyType, usize> = HashMap::new();
        for alert in state.alerts.values() {
            *by_severity.entry(alert.severity).or_default() += 1;
            *by_type.entry(alert.anomaly_type).or_default() += 1;
        }
        MonitorStats {
            total: state.alerts.len(),
            unacknowledged: state
                .alerts
                .values()
                .filter(|a| !a.acknowledged)
                .count(),
            by_severity,
            by_type,
        }
    }

    async fn publish_alert(&self, alert: &SecurityAlert) {
        self.broadcaster
            .broadcast(RealtimeEvent::new(
                "alert:security",
                json!({
                    "alert_id": alert.id,
                    "delivery_id": alert.delivery_id,
                    "anomaly_type": alert.anomaly_type,
                    "severity": alert.severity,
                    "zone_id": alert.zone_id,
                }),
                Audience::roles(vec![Role::SecurityOfficer, Role::Admin]),
            ))
            .await;
    }
}

fn new_alert(
    delivery_id: DeliveryId,
    driver_id: UserId,
    vehicle_id: Option<String>,
    anomaly_type: AnomalyType,
    severity: Severity,
    zone_id: String,
    description: String,
) -> SecurityAlert {
    SecurityAlert {
        id: Uuid::new_v4(),
        delivery_id,
        driver_id,
        vehicle_id,
        anomaly_type,
        severity,
        zone_id,
        detected_at: Utc::now(),
        description,
        acknowledged: false,
        acknowledged_at: None,
        acknowledged_by: None,
        resolution: None,
    }
}

fn detect_route_deviation(
    state: &MonitorState,
    delivery_id: DeliveryId,
    driver_id: UserId,
    vehicle_id: &Option<String>,
    location: &ObfuscatedLocation,
) -> Option<SecurityAlert> {
    let route = state.expected_routes.get(&delivery_id)?;
    if route.contains(&location.zone_id) {
        return None;
    }
    Some(new_alert(
        delivery_id,
        driver_id,
        vehicle_id.clone(),
        AnomalyType::RouteDeviation,
        Severity::Medium,
        location.zone_id.clone(),
        "driver outside the expected zone sequence".to_string(),
    ))
}

fn detect_unusual_stop(
    state: &MonitorState,
    delivery_id: DeliveryId,
    driver_id: UserId,
    vehicle_id: &Option<String>,
    location: &ObfuscatedLocation,
) -> Option<SecurityAlert> {
    let history = state.history.get(&driver_id)?;
    let recent: Vec<&LocationEntry> = history.iter().rev().take(STOP_WINDOW).collect();
    let stationary: Vec<&&LocationEntry> = recent.iter().filter(|e| !e.is_moving).collect();
    if stationary.len() < STOP_MIN_STATIONARY {
        return None;
    }

    // recent is newest-first
    let newest = stationary.first()?.t;
    let oldest = stationary.last()?.t;
    if newest - oldest < STOP_MIN_SPAN {
        return None;
    }

    let suppressed = state.alerts.values().any(|a| {
        a.driver_id == driver_id
            && a.anomaly_type == AnomalyType::UnusualStop
            && Utc::now() - a.detected_at < STOP_SUPPRESSION
    });
    if suppressed {
        return None;
    }

    Some(new_alert(
        delivery_id,
        driver_id,
        vehicle_id.clone(),
        AnomalyType::UnusualStop,
        Severity::Low,
        location.zone_id.clone(),
        "prolonged stationary period off schedule".to_string(),
    ))
}

fn detect_rapid_zone_changes(
    state: &MonitorState,
    delivery_id: DeliveryId,
    driver_id: UserId,
    vehicle_id: &Option<String>,
    location: &ObfuscatedLocation,
) -> Option<SecurityAlert> {
    let history = state.history.get(&driver_id)?;
    if history.len() < RAPID_WINDOW {
        return None;
    }
    let recent: Vec<&LocationEntry> = history.iter().rev().take(RAPID_WINDOW).collect();

    let span = recent.first()?.t - recent.last()?.t;
    if span > RAPID_MAX_SPAN {
        return None;
    }

    let distinct: std::collections::HashSet<&str> =
        recent.iter().map(|e| e.zone_id.as_str()).collect();
    if distinct.len() < RAPID_MIN_ZONES {
        return None;
    }

    // Physically implausible cell hopping reads as GPS spoofing.
    Some(new_alert(
        delivery_id,
        driver_id,
        vehicle_id.clone(),
        AnomalyType::TamperingDetected,
        Severity::High,
        location.zone_id.clone(),
        format!("{} distinct zones inside {} min", distinct.len(), RAPID_MAX_SPAN.num_minutes()),
    ))
}
