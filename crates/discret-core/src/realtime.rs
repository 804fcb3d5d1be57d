use std::collections::{HashMap, HashSet, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::RwLock;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::access::Role;
use discret_shared::constants::OFFLINE_QUEUE_DEPTH;
use discret_shared::types::{DeliveryId, UserId};

/// Recipient set for an event: any non-empty combination of a delivery
/// room, explicit users, and roles.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Audience {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delivery_id: Option<DeliveryId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub user_ids: Vec<UserId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub roles: Vec<Role>,
}

impl Audience {
    pub fn delivery(delivery_id: DeliveryId) -> Self {
        Self {
            delivery_id: Some(delivery_id),
            ..Default::default()
        }
    }

    pub fn users(user_ids: Vec<UserId>) -> Self {
        Self {
            user_ids,
            ..Default::default()
        }
    }

    pub fn roles(roles: Vec<Role>) -> Self {
        Self {
            roles,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RealtimeEvent {
    pub id: Uuid,
    pub name: String,
    pub payload: Value,
    pub audience: Audience,
    pub at: DateTime<Utc>,
}

impl RealtimeEvent {
    pub fn new(name: &str, payload: Value, audience: Audience) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.to_string(),
            payload,
            audience,
            at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct RealtimeStats {
    pub sessions: usize,
    pub authenticated: usize,
    pub rooms: usize,
    pub queued_events: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct SessionIdentity {
    pub user_id: UserId,
    pub role: Role,
}

struct Session {
    identity: Option<SessionIdentity>,
    tx: UnboundedSender<RealtimeEvent>,
}

#[derive(Default)]
struct BroadcasterState {
    sessions: HashMap<Uuid, Session>,
    rooms: HashMap<DeliveryId, HashSet<Uuid>>,
    offline: HashMap<UserId, VecDeque<RealtimeEvent>>,
}

/// Privacy-filtered push fabric: live sessions, delivery rooms, and a
/// bounded per-user offline queue drained at the next authenticate.
pub struct Broadcaster {
    inner: RwLock<BroadcasterState>,
}

impl Broadcaster {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(BroadcasterState::default()),
        }
    }

    /// Register a connection; the receiver is the session's outbound feed.
    pub async fn connect(&self) -> (Uuid, UnboundedReceiver<RealtimeEvent>) {
        let conn_id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.inner.write().await;
        state.sessions.insert(
            conn_id,
            Session {
                identity: None,
                tx,
            },
        );
        (conn_id, rx)
    }

    /// Bind the session to an identity and drain the user's offline queue
    /// in enqueue order. Returns false for unknown connections.
    pub async fn authenticate(&self, conn_id: Uuid, user_id: UserId, role: Role) -> bool {
        let mut state = self.inner.write().await;
        let tx = {
            let Some(session) = state.sessions.get_mut(&conn_id) else {
                return false;
            };
            session.identity = Some(SessionIdentity { user_id, role });
            session.tx.clone()
        };

        for event in state.offline.remove(&user_id).unwrap_or_default() {
            let _ = tx.send(event);
        }
        debug!(%conn_id, %user_id, role = %role, "realtime session authenticated");
        true
    }

    pub async fn subscribe(&self, conn_id: Uuid, delivery_id: DeliveryId) -> bool {
        let mut state = self.inner.write().await;
        if !state.sessions.contains_key(&conn_id) {
            return false;
        }
        state.rooms.entry(delivery_id).or_default().insert(conn_id);
        true
    }

    pub async fn unsubscribe(&self, conn_id: Uuid, delivery_id: DeliveryId) {
        let mut state = self.inner.write().await;
        if let Some(room) = state.rooms.get_mut(&delivery_id) {
            room.remove(&conn_id);
            if room.is_empty() {
                state.rooms.remove(&delivery_id);
            }
        }
    }

    /// Closing a session only removes its registry entries.
    pub async fn disconnect(&self, conn_id: Uuid) {
        let mut state = self.inner.write().await;
        state.sessions.remove(&conn_id);
        state.rooms.retain(|_, room| {
            room.remove(&conn_id);
            !room.is_empty()
        });
    }

    /// Fan an event out to its audience. Each live session receives the
    /// event at most once per call even when it matches several criteria;
    /// targeted users with no live session get it queued.
    pub async fn broadcast(&self, event: RealtimeEvent) -> usize {
        let mut state = self.inner.write().await;

        let mut recipients: HashSet<Uuid> = HashSet::new();

        if let Some(delivery_id) = event.audience.delivery_id {
            if let Some(room) = state.rooms.get(&delivery_id) {
                recipients.extend(room.iter().copied());
            }
        }

        let mut offline_users: Vec<UserId> = Vec::new();
        for user_id in &event.audience.user_ids {
            let live: Vec<Uuid> = state
                .sessions
                .iter()
                .filter(|(_, s)| s.identity.map(|i| i.user_id) == Some(*user_id))
                .map(|(id, _)| *id)
                .collect();
            if live.is_empty() {
                offline_users.push(*user_id);
            } else {
                recipients.extend(live);
            }
        }

        for role in &event.audience.roles {
            recipients.extend(
                state
                    .sessions
                    .iter()
                    .filter(|(_, s)| s.identity.map(|i| i.role) == Some(*role))
                    .map(|(id, _)| *id),
            );
        }

        let mut delivered = 0;
        let mut orphaned: Vec<UserId> = Vec::new();
        for conn_id in recipients {
            if let Some(session) = state.sessions.get(&conn_id) {
                if session.tx.send(event.clone()).is_ok() {
                    delivered += 1;
                } else if let Some(identity) = session.identity {
                    // Receiver already gone; the send was initiated, so the
                    // event still lands in the user's offline queue.
                    orphaned.push(identity.user_id);
                }
            }
        }

        for user_id in offline_users.into_iter().chain(orphaned) {
            Self::enqueue_offline(&mut state, user_id, event.clone());
        }

        delivered
    }

    fn enqueue_offline(state: &mut BroadcasterState, user_id: UserId, event: RealtimeEvent) {
        let queue = state.offline.entry(user_id).or_default();
        if queue.len() >= OFFLINE_QUEUE_DEPTH {
            queue.pop_front();
            warn!(%user_id, "offline queue full, dropping oldest event");
        }
        queue.push_back(event);
    }

    pub async fn stats(&self) -> RealtimeStats {
        let state = self.inner.read().await;
        RealtimeStats {
            sessions: state.sessions.len(),
            authenticated: state
                .sessions
                .values()
                .filter(|s| s.identity.is_some())
                .count(),
            rooms: state.rooms.len(),
            queued_events: state.offline.values().map(|q| q.len()).sum(),
        }
    }
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(audience: Audience) -> RealtimeEvent {
        RealtimeEvent::new("delivery:status", json!({"status": "in_transit"}), audience)
    }

    #[tokio::test]
    async fn test_room_broadcast() {
        let b = Broadcaster::new();
        let delivery = DeliveryId::new();

        let (conn, mut rx) = b.connect().await;
        b.subscribe(conn, delivery).await;

        let delivered = b.broadcast(event(Audience::delivery(delivery))).await;
        assert_eq!(delivered, 1);
        assert!(rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_dedup_across_criteria() {
        let b = Broadcaster::new();
        let delivery = DeliveryId::new();
        let user = UserId::new();

        let (conn, mut rx) = b.connect().await;
        b.authenticate(conn, user, Role::Driver).await;
        b.subscribe(conn, delivery).await;

        // Session matches the room, the user id, and the role.
        let ev = event(Audience {
            delivery_id: Some(delivery),
            user_ids: vec![user],
            roles: vec![Role::Driver],
        });
        let delivered = b.broadcast(ev).await;

        assert_eq!(delivered, 1);
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_offline_queue_bound_and_drain_order() {
        let b = Broadcaster::new();
        let user = UserId::new();

        for i in 0..51 {
            let ev = RealtimeEvent::new("seq", json!({ "i": i }), Audience::users(vec![user]));
            b.broadcast(ev).await;
        }
        assert_eq!(b.stats().await.queued_events, 50);

        let (conn, mut rx) = b.connect().await;
        b.authenticate(conn, user, Role::Customer).await;

        // Oldest (i=0) was dropped; the rest arrive in enqueue order.
        let first = rx.try_recv().unwrap();
        assert_eq!(first.payload["i"], 1);
        let mut count = 1;
        let mut last = first.payload["i"].as_i64().unwrap();
        while let Ok(ev) = rx.try_recv() {
            let i = ev.payload["i"].as_i64().unwrap();
            assert!(i > last);
            last = i;
            count += 1;
        }
        assert_eq!(count, 50);
        assert_eq!(b.stats().await.queued_events, 0);
    }

    #[tokio::test]
    async fn test_role_broadcast_skips_other_roles() {
        let b = Broadcaster::new();

        let (officer, mut officer_rx) = b.connect().await;
        b.authenticate(officer, UserId::new(), Role::SecurityOfficer)
            .await;
        let (customer, mut customer_rx) = b.connect().await;
        b.authenticate(customer, UserId::new(), Role::Customer).await;

        b.broadcast(event(Audience::roles(vec![Role::SecurityOfficer])))
            .await;

        assert!(officer_rx.try_recv().is_ok());
        assert!(customer_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_disconnect_cleans_rooms() {
        let b = Broadcaster::new();
        let delivery = DeliveryId::new();
        let (conn, _rx) = b.connect().await;
        b.subscribe(conn, delivery).await;

        b.disconnect(conn).await;
        let stats = b.stats().await;
        assert_eq!(stats.sessions, 0);
        assert_eq!(stats.rooms, 0);
    }

    #[tokio::test]
    async fn test_closed_receiver_falls_back_to_offline_queue() {
        let b = Broadcaster::new();
        let user = UserId::new();
        let (conn, rx) = b.connect().await;
        b.authenticate(conn, user, Role::Customer).await;
        drop(rx);

        b.broadcast(event(Audience::users(vec![user]))).await;
        assert_eq!(b.stats().await.queued_events, 1);
    }
}
