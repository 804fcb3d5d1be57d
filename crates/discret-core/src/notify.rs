use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::RwLock;
use tokio::time::timeout;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::access::{Actor, AuditLog, AuditResult};
use discret_shared::crypto::{self, derive_context_key};
use discret_shared::error::CryptoError;
use discret_shared::types::UserId;
use thiserror::Error;

/// Seconds to wait before each retry attempt.
const RETRY_SCHEDULE_SECS: [u64; 5] = [1, 5, 30, 60, 300];
const MAX_RETRIES: u32 = 5;
const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(10);

const RATE_WINDOW_SECS: i64 = 60;
const RATE_MAX_SENDS: u32 = 10;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Sms,
    Push,
    Whatsapp,
    Ussd,
    Email,
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Channel::Sms => "sms",
            Channel::Push => "push",
            Channel::Whatsapp => "whatsapp",
            Channel::Ussd => "ussd",
            Channel::Email => "email",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Default)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NotificationStatus {
    Pending,
    Sent,
    Delivered,
    Read,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct NotificationRecord {
    pub id: Uuid,
    pub recipient_id: UserId,
    pub channel: Channel,
    pub priority: Priority,
    pub template_id: String,
    pub content_ciphertext: String,
    pub scheduled_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub read_at: Option<DateTime<Utc>>,
    pub status: NotificationStatus,
    pub retry_count: u32,
    pub max_retries: u32,
    pub failure_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QuietHours {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl QuietHours {
    fn contains(&self, t: NaiveTime) -> bool {
        if self.start <= self.end {
            t >= self.start && t < self.end
        } else {
            // window wraps midnight
            t >= self.start || t < self.end
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserPreferences {
    pub channels: Vec<Channel>,
    pub quiet: Option<QuietHours>,
}

impl Default for UserPreferences {
    fn default() -> Self {
        Self {
            channels: vec![Channel::Sms, Channel::Push, Channel::Email],
            quiet: None,
        }
    }
}

#[derive(Error, Debug)]
pub enum NotifyError {
    #[error("notification {0} not_found")]
    NotFound(Uuid),

    #[error("rate limit exceeded for {recipient} on {channel}")]
    RateLimited { recipient: UserId, channel: Channel },

    #[error("channel {0} not in recipient preferences")]
    ChannelNotAllowed(Channel),

    #[error("recipient is in quiet hours")]
    QuietHours,

    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("transport unavailable: {0}")]
    Unavailable(String),

    #[error("transport attempt timed out")]
    Timeout,
}

/// Stub provider; real sms/push/whatsapp integrations slot in behind the
/// same variant match. `fail_next` makes the next N attempts fail, which
/// is all the tests need.
#[derive(Default)]
pub struct StubTransport {
    fail_next: AtomicU32,
}

impl StubTransport {
    pub fn failing(times: u32) -> Self {
        Self {
            fail_next: AtomicU32::new(times),
        }
    }

    async fn deliver(&self, channel: Channel, recipient: UserId) -> Result<(), TransportError> {
        if self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(TransportError::Unavailable(format!(
                "{channel} provider rejected the message"
            )));
        }
        debug!(%recipient, %channel, "stub transport delivered");
        Ok(())
    }
}

struct RateWindow {
    count: u32,
    reset_at: DateTime<Utc>,
}

#[derive(Default)]
struct NotifyState {
    records: HashMap<Uuid, NotificationRecord>,
    preferences: HashMap<UserId, UserPreferences>,
    rate: HashMap<(UserId, Channel), RateWindow>,
}

/// Encrypted multi-channel outbound with bounded retries. At-least-once
/// with de-duplication by notification id; never exactly-once.
pub struct NotificationService {
    encryption_key: Vec<u8>,
    audit: Arc<AuditLog>,
    transport: StubTransport,
    inner: RwLock<NotifyState>,
}

impl NotificationService {
    pub fn new(encryption_key: &[u8], audit: Arc<AuditLog>) -> Self {
        Self::with_transport(encryption_key, audit, StubTransport::default())
    }

    pub fn with_transport(
        encryption_key: &[u8],
        audit: Arc<AuditLog>,
        transport: StubTransport,
    ) -> Self {
        Self {
            encryption_key: encryption_key.to_vec(),
            audit,
            transport,
            inner: RwLock::new(NotifyState::default()),
        }
    }

    /// Queue a notification and dispatch it on a background task.
    pub async fn send(
        self: &Arc<Self>,
        actor: Actor,
        recipient_id: UserId,
        channel: Channel,
        template_id: &str,
        content: &str,
        priority: Priority,
    ) -> Result<NotificationRecord, NotifyError> {
        let record = {
            let mut state = self.inner.write().await;

            // Preferences gate every channel below critical.
            if priority != Priority::Critical {
                let prefs = state.preferences.get(&recipient_id).cloned().unwrap_or_default();
                if !prefs.channels.contains(&channel) {
                    return Err(NotifyError::ChannelNotAllowed(channel));
                }
                if let Some(quiet) = &prefs.quiet {
                    if quiet.contains(Utc::now().time()) {
                        return Err(NotifyError::QuietHours);
                    }
                }
            }

            check_rate(&mut state, recipient_id, channel)?;

            let key = derive_context_key(&self.encryption_key, &recipient_id.to_string());
            let content_ciphertext = crypto::encrypt(&key, content.as_bytes())?;

            let record = NotificationRecord {
                id: Uuid::new_v4(),
                recipient_id,
                channel,
                priority,
                template_id: template_id.to_string(),
                content_ciphertext,
                scheduled_at: Utc::now(),
                sent_at: None,
                delivered_at: None,
                read_at: None,
                status: NotificationStatus::Pending,
                retry_count: 0,
                max_retries: MAX_RETRIES,
                failure_reason: None,
            };
            state.records.insert(record.id, record.clone());
            record
        };

        self.audit
            .record(
                actor.user_id,
                actor.role,
                "notification.send",
                "notification",
                Some(record.id.to_string()),
                json!({"channel": channel, "priority": priority, "template_id": template_id}),
                AuditResult::Success,
            )
            .await;

        let service = Arc::clone(self);
        let id = record.id;
        tokio::spawn(async move {
            service.dispatch_with_retry(id, recipient_id, channel).await;
        });

        Ok(record)
    }

    async fn dispatch_with_retry(&self, id: Uuid, recipient: UserId, channel: Channel) {
        loop {
            let attempt = timeout(ATTEMPT_TIMEOUT, self.transport.deliver(channel, recipient))
                .await
                .unwrap_or(Err(TransportError::Timeout));

            match attempt {
                Ok(()) => {
                    let mut state = self.inner.write().await;
                    if let Some(record) = state.records.get_mut(&id) {
                        record.status = NotificationStatus::Sent;
                        record.sent_at = Some(Utc::now());
                    }
                    info!(notification_id = %id, %channel, "notification sent");
                    return;
                }
                Err(e) => {
                    let retry_count = {
                        let mut state = self.inner.write().await;
                        let Some(record) = state.records.get_mut(&id) else {
                            return;
                        };
                        record.retry_count += 1;
                        if record.retry_count > record.max_retries {
                            record.status = NotificationStatus::Failed;
                            record.failure_reason = Some(e.to_string());
                            error!(notification_id = %id, %channel, error = %e, "notification failed after retries");
                            return;
                        }
                        record.retry_count
                    };

                    let delay = RETRY_SCHEDULE_SECS[(retry_count as usize - 1)
                        .min(RETRY_SCHEDULE_SECS.len() - 1)];
                    debug!(notification_id = %id, retry = retry_count, delay_secs = delay, "retrying notification");
                    tokio::time::sleep(Duration::from_secs(delay)).await;
                }
            }
        }
    }

    pub async fn mark_delivered(&self, id: Uuid) -> Result<NotificationRecord, NotifyError> {
        let mut state = self.inner.write().await;
        let record = state.records.get_mut(&id).ok_or(NotifyError::NotFound(id))?;
        if record.status == NotificationStatus::Sent {
            record.status = NotificationStatus::Delivered;
            record.delivered_at = Some(Utc::now());
        }
        Ok(record.clone())
    }

    pub async fn mark_read(&self, id: Uuid) -> Result<NotificationRecord, NotifyError> {
        let mut state = self.inner.write().await;
        let record = state.records.get_mut(&id).ok_or(NotifyError::NotFound(id))?;
        if matches!(
            record.status,
            NotificationStatus::Sent | NotificationStatus::Delivered
        ) {
            if record.delivered_at.is_none() {
                record.delivered_at = Some(Utc::now());
            }
            record.status = NotificationStatus::Read;
            record.read_at = Some(Utc::now());
        }
        Ok(record.clone())
    }

    pub async fn get(&self, id: Uuid) -> Option<NotificationRecord> {
        self.inner.read().await.records.get(&id).cloned()
    }

    pub async fn list_for_user(&self, user_id: UserId) -> Vec<NotificationRecord> {
        let state = self.inner.read().await;
        let mut records: Vec<NotificationRecord> = state
            .records
            .values()
            .filter(|r| r.recipient_id == user_id)
            .cloned()
            .collect();
        records.sort_by(|a, b| b.scheduled_at.cmp(&a.scheduled_at));
        records
    }

    pub async fn set_preferences(
        &self,
        actor: Actor,
        user_id: UserId,
        prefs: UserPreferences,
    ) {
        {
            let mut state = self.inner.write().await;
            state.preferences.insert(user_id, prefs);
        }
        self.audit
            .record(
                actor.user_id,
                actor.role,
                "notification.preferences",
                "notification",
                Some(user_id.to_string()),
                json!({}),
                AuditResult::Success,
            )
            .await;
    }

    pub async fn preferences(&self, user_id: UserId) -> UserPreferences {
        self.inner
            .read()
            .await
            .preferences
            .get(&user_id)
            .cloned()
            .unwrap_or_default()
    }
}

/// Fixed window, ≤10 sends per recipient+channel per minute. The window
/// resets lazily on the first send past `reset_at`.
fn check_rate(
    state: &mut NotifyState,
    recipient: UserId,
    channel: Channel,
) -> Result<(), NotifyError> {
    let now = Utc::now();
    let window = state
        .rate
        .entry((recipient, channel))
        .or_insert_with(|| RateWindow {
            count: 0,
            reset_at: now + chrono::TimeDelta::seconds(RATE_WINDOW_SECS),
        });

    if now >= window.reset_at {
        window.count = 0;
        window.reset_at = now + chrono::TimeDelta::seconds(RATE_WINDOW_SECS);
    }

    if window.count >= RATE_MAX_SENDS {
        return Err(NotifyError::RateLimited { recipient, channel });
    }
    window.count += 1;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const ENC_KEY: &[u8] = b"unit-test-encryption-key-32-bytes!!";

    fn service() -> Arc<NotificationService> {
        Arc::new(NotificationService::new(ENC_KEY, Arc::new(AuditLog::new())))
    }

    async fn wait_for_status(
        svc: &Arc<NotificationService>,
        id: Uuid,
        status: NotificationStatus,
    ) -> NotificationRecord {
        for _ in 0..200 {
            if let Some(r) = svc.get(id).await {
                if r.status == status {
                    return r;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("notification never reached {status:?}");
    }

    #[tokio::test]
    async fn test_send_encrypts_and_dispatches() {
        let svc = service();
        let recipient = UserId::new();

        let record = svc
            .send(
                Actor::system(),
                recipient,
                Channel::Sms,
                "delivery_arrived",
                "Your parcel is at the gate",
                Priority::Normal,
            )
            .await
            .unwrap();

        assert_eq!(record.status, NotificationStatus::Pending);
        assert!(!record.content_ciphertext.contains("parcel"));

        let sent = wait_for_status(&svc, record.id, NotificationStatus::Sent).await;
        assert!(sent.sent_at.is_some());

        let key = derive_context_key(ENC_KEY, &recipient.to_string());
        let plain = crypto::decrypt(&key, &sent.content_ciphertext).unwrap();
        assert_eq!(plain, b"Your parcel is at the gate");
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_then_success() {
        let svc = Arc::new(NotificationService::with_transport(
            ENC_KEY,
            Arc::new(AuditLog::new()),
            StubTransport::failing(2),
        ));

        let record = svc
            .send(
                Actor::system(),
                UserId::new(),
                Channel::Push,
                "t",
                "hello",
                Priority::Normal,
            )
            .await
            .unwrap();

        let sent = wait_for_status(&svc, record.id, NotificationStatus::Sent).await;
        assert_eq!(sent.retry_count, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_fail() {
        let svc = Arc::new(NotificationService::with_transport(
            ENC_KEY,
            Arc::new(AuditLog::new()),
            StubTransport::failing(100),
        ));

        let record = svc
            .send(
                Actor::system(),
                UserId::new(),
                Channel::Whatsapp,
                "t",
                "hello",
                Priority::Normal,
            )
            .await
            .unwrap();

        let failed = wait_for_status(&svc, record.id, NotificationStatus::Failed).await;
        assert_eq!(failed.retry_count, MAX_RETRIES + 1);
        assert!(failed.failure_reason.is_some());
    }

    #[tokio::test]
    async fn test_rate_limit_per_channel() {
        let svc = service();
        let recipient = UserId::new();

        for _ in 0..10 {
            svc.send(
                Actor::system(),
                recipient,
                Channel::Sms,
                "t",
                "x",
                Priority::Normal,
            )
            .await
            .unwrap();
        }

        let err = svc
            .send(
                Actor::system(),
                recipient,
                Channel::Sms,
                "t",
                "x",
                Priority::Normal,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, NotifyError::RateLimited { .. }));

        // A different channel still goes through
        svc.send(
            Actor::system(),
            recipient,
            Channel::Push,
            "t",
            "x",
            Priority::Normal,
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_preferences_gate_non_critical() {
        let svc = service();
        let recipient = UserId::new();

        svc.set_preferences(
            Actor::system(),
            recipient,
            UserPreferences {
                channels: vec![Channel::Email],
                quiet: None,
            },
        )
        .await;

        let err = svc
            .send(
                Actor::system(),
                recipient,
                Channel::Sms,
                "t",
                "x",
                Priority::High,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, NotifyError::ChannelNotAllowed(Channel::Sms)));

        // Critical pierces preferences
        svc.send(
            Actor::system(),
            recipient,
            Channel::Sms,
            "t",
            "x",
            Priority::Critical,
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_quiet_hours_reject_non_critical() {
        let svc = service();
        let recipient = UserId::new();

        // All day quiet window
        svc.set_preferences(
            Actor::system(),
            recipient,
            UserPreferences {
                channels: vec![Channel::Sms],
                quiet: Some(QuietHours {
                    start: NaiveTime::from_hms_opt(0, 0, 0).unwrap(),
                    end: NaiveTime::from_hms_opt(23, 59, 59).unwrap(),
                }),
            },
        )
        .await;

        let err = svc
            .send(
                Actor::system(),
                recipient,
                Channel::Sms,
                "t",
                "x",
                Priority::Normal,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, NotifyError::QuietHours));
    }

    #[tokio::test]
    async fn test_status_chain_monotone() {
        let svc = service();
        let record = svc
            .send(
                Actor::system(),
                UserId::new(),
                Channel::Email,
                "t",
                "x",
                Priority::Normal,
            )
            .await
            .unwrap();
        wait_for_status(&svc, record.id, NotificationStatus::Sent).await;

        let delivered = svc.mark_delivered(record.id).await.unwrap();
        assert_eq!(delivered.status, NotificationStatus::Delivered);

        let read = svc.mark_read(record.id).await.unwrap();
        assert_eq!(read.status, NotificationStatus::Read);
        assert!(read.read_at.is_some());

        // Acks never move the status backwards
        let still_read = svc.mark_delivered(record.id).await.unwrap();
        assert_eq!(still_read.status, NotificationStatus::Read);
    }

    #[tokio::test]
    async fn test_unknown_notification_not_found() {
        let svc = service();
        assert!(matches!(
            svc.mark_delivered(Uuid::new_v4()).await.unwrap_err(),
            NotifyError::NotFound(_)
        ));
    }

    #[test]
    fn test_quiet_hours_wrap_midnight() {
        let quiet = QuietHours {
            start: NaiveTime::from_hms_opt(22, 0, 0).unwrap(),
            end: NaiveTime::from_hms_opt(6, 0, 0).unwrap(),
        };
        assert!(quiet.contains(NaiveTime::from_hms_opt(23, 30, 0).unwrap()));
        assert!(quiet.contains(NaiveTime::from_hms_opt(3, 0, 0).unwrap()));
        assert!(!quiet.contains(NaiveTime::from_hms_opt(12, 0, 0).unwrap()));
    }
}
