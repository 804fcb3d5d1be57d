use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;

use discret_shared::crypto::sha256_hex;
use discret_shared::redact::redact_value;
use discret_shared::types::UserId;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Customer,
    Driver,
    Dispatcher,
    SecurityOfficer,
    Admin,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Customer => "customer",
            Role::Driver => "driver",
            Role::Dispatcher => "dispatcher",
            Role::SecurityOfficer => "security_officer",
            Role::Admin => "admin",
            Role::System => "system",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Role {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "customer" => Ok(Role::Customer),
            "driver" => Ok(Role::Driver),
            "dispatcher" => Ok(Role::Dispatcher),
            "security_officer" => Ok(Role::SecurityOfficer),
            "admin" => Ok(Role::Admin),
            "system" => Ok(Role::System),
            _ => Err(()),
        }
    }
}

/// Fixed role → permission matrix.
pub fn permissions(role: Role) -> &'static [&'static str] {
    match role {
        Role::Customer => &[
            "read:own_delivery",
            "write:own_delivery_consent",
            "read:own_notification",
        ],
        Role::Driver => &[
            "read:assigned_delivery",
            "write:delivery_status",
            "read:emergency",
            "write:emergency",
        ],
        Role::Dispatcher => &[
            "read:all_delivery",
            "write:delivery_assignment",
            "read:emergency",
            "read:audit",
        ],
        Role::SecurityOfficer => &[
            "read:security_alert",
            "write:security_alert",
            "read:emergency",
            "read:audit",
            "read:location_history",
        ],
        Role::Admin | Role::System => &["*"],
    }
}

pub fn has_permission(role: Role, permission: &str) -> bool {
    let grants = permissions(role);
    grants.contains(&"*") || grants.contains(&permission)
}

/// Authenticated identity attached to an operation; both fields absent for
/// anonymous ingress.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Actor {
    pub user_id: Option<UserId>,
    pub role: Option<Role>,
}

impl Actor {
    pub fn new(user_id: UserId, role: Role) -> Self {
        Self {
            user_id: Some(user_id),
            role: Some(role),
        }
    }

    pub fn system() -> Self {
        Self {
            user_id: None,
            role: Some(Role::System),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuditResult {
    Success,
    Denied,
    Failure,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub seq: u64,
    pub actor_id: Option<UserId>,
    pub actor_role: Option<Role>,
    pub action: String,
    pub resource_type: String,
    pub resource_id: Option<String>,
    pub metadata: Value,
    pub result: AuditResult,
    pub at: DateTime<Utc>,
    pub prev_hash: String,
    pub hash: String,
}

#[derive(Debug)]
struct AuditState {
    entries: Vec<AuditEntry>,
    last_hash: String,
}

/// Tamper-evident access log shared by every service. Append-only,
/// monotonic sequence, SHA-256 hash chain over entry contents.
pub struct AuditLog {
    inner: RwLock<AuditState>,
}

impl AuditLog {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(AuditState {
                entries: Vec::new(),
                last_hash: "CHAIN_START".to_string(),
            }),
        }
    }

    pub async fn record(
        &self,
        actor_id: Option<UserId>,
        actor_role: Option<Role>,
        action: &str,
        resource_type: &str,
        resource_id: Option<String>,
        metadata: Value,
        result: AuditResult,
    ) -> AuditEntry {
        let metadata = redact_value(&metadata);
        let mut state = self.inner.write().await;

        let seq = state.entries.len() as u64 + 1;
        let prev_hash = state.last_hash.clone();
        let at = Utc::now();

        let preimage = serde_json::json!({
            "seq": seq,
            "actor_id": actor_id,
            "actor_role": actor_role,
            "action": action,
            "resource_type": resource_type,
            "resource_id": resource_id,
            "metadata": metadata,
            "result": result,
            "at": at,
            "prev_hash": prev_hash,
        });
        let hash = sha256_hex(preimage.to_string().as_bytes());

        let entry = AuditEntry {
            seq,
            actor_id,
            actor_role,
            action: action.to_string(),
            resource_type: resource_type.to_string(),
            resource_id,
            metadata,
            result,
            at,
            prev_hash,
            hash: hash.clone(),
        };

        state.entries.push(entry.clone());
        state.last_hash = hash;
        entry
    }

    /// Most recent entries first, optionally filtered.
    pub async fn query(
        &self,
        actor_id: Option<UserId>,
        resource_type: Option<&str>,
        limit: usize,
    ) -> Vec<AuditEntry> {
        let state = self.inner.read().await;
        state
            .entries
            .iter()
            .rev()
            .filter(|e| actor_id.is_none_or(|id| e.actor_id == Some(id)))
            .filter(|e| resource_type.is_none_or(|rt| e.resource_type == rt))
            .take(limit)
            .cloned()
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Walk the chain and confirm no entry was altered or dropped.
    pub async fn verify_chain(&self) -> bool {
        let state = self.inner.read().await;
        let mut prev = "CHAIN_START".to_string();
        for entry in &state.entries {
            if entry.prev_hash != prev {
                return false;
            }
            let preimage = serde_json::json!({
                "seq": entry.seq,
                "actor_id": entry.actor_id,
                "actor_role": entry.actor_role,
                "action": entry.action,
                "resource_type": entry.resource_type,
                "resource_id": entry.resource_id,
                "metadata": entry.metadata,
                "result": entry.result,
                "at": entry.at,
                "prev_hash": entry.prev_hash,
            });
            if sha256_hex(preimage.to_string().as_bytes()) != entry.hash {
                return false;
            }
            prev = entry.hash.clone();
        }
        true
    }
}

impl Default for AuditLog {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_permission_matrix() {
        assert!(has_permission(Role::Driver, "write:emergency"));
        assert!(!has_permission(Role::Driver, "read:audit"));
        assert!(has_permission(Role::Dispatcher, "read:audit"));
        assert!(has_permission(Role::Admin, "anything:at_all"));
        assert!(has_permission(Role::System, "read:audit"));
        assert!(!has_permission(Role::Customer, "read:security_alert"));
    }

    #[test]
    fn test_role_parse() {
        assert_eq!(
            "security_officer".parse::<Role>().unwrap(),
            Role::SecurityOfficer
        );
        assert!("superuser".parse::<Role>().is_err());
    }

    #[tokio::test]
    async fn test_audit_chain_monotonic() {
        let log = AuditLog::new();
        for i in 0..10 {
            let entry = log
                .record(
                    Some(UserId::new()),
                    Some(Role::Driver),
                    "location.update",
                    "location",
                    None,
                    json!({"i": i}),
                    AuditResult::Success,
                )
                .await;
            assert_eq!(entry.seq, i + 1);
        }
        assert_eq!(log.len().await, 10);
        assert!(log.verify_chain().await);
    }

    #[tokio::test]
    async fn test_audit_metadata_redacted() {
        let log = AuditLog::new();
        let entry = log
            .record(
                None,
                None,
                "emergency.trigger",
                "emergency",
                None,
                json!({"latitude": -1.3, "zone_id": "88f2a"}),
                AuditResult::Success,
            )
            .await;
        assert_eq!(entry.metadata["latitude"], "[REDACTED]");
        assert_eq!(entry.metadata["zone_id"], "88f2a");
    }

    #[tokio::test]
    async fn test_audit_query_filters() {
        let log = AuditLog::new();
        let actor = UserId::new();
        log.record(
            Some(actor),
            Some(Role::Driver),
            "a",
            "delivery",
            None,
            json!({}),
            AuditResult::Success,
        )
        .await;
        log.record(
            None,
            None,
            "b",
            "alert",
            None,
            json!({}),
            AuditResult::Denied,
        )
        .await;

        let by_actor = log.query(Some(actor), None, 10).await;
        assert_eq!(by_actor.len(), 1);
        assert_eq!(by_actor[0].action, "a");

        let by_type = log.query(None, Some("alert"), 10).await;
        assert_eq!(by_type.len(), 1);
        assert_eq!(by_type[0].result, AuditResult::Denied);
    }
}
