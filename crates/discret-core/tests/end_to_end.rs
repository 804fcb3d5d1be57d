use std::sync::Arc;

use serde_json::json;

use discret_core::access::{Actor, AuditLog, Role};
use discret_core::emergency::EmergencyService;
use discret_core::monitor::SecurityMonitor;
use discret_core::notify::{Channel, NotificationService, Priority};
use discret_core::obfuscate;
use discret_core::realtime::{Audience, Broadcaster, RealtimeEvent};
use discret_core::verify::{VerificationService, VerifyConfig, VerificationMethod};
use discret_shared::geo::RawCoordinates;
use discret_shared::types::{DeliveryId, UserId};

const ENC_KEY: &[u8] = b"integration-encryption-key-32-byte!";
const MAC_KEY: &[u8] = b"integration-hmac-secret-32-bytes-ok";

struct Platform {
    audit: Arc<AuditLog>,
    broadcaster: Arc<Broadcaster>,
    verifier: VerificationService,
    monitor: SecurityMonitor,
    emergency: EmergencyService,
    notifier: Arc<NotificationService>,
}

fn platform() -> Platform {
    let audit = Arc::new(AuditLog::new());
    let broadcaster = Arc::new(Broadcaster::new());
    let notifier = Arc::new(NotificationService::new(ENC_KEY, audit.clone()));
    Platform {
        verifier: VerificationService::new(
            ENC_KEY,
            MAC_KEY,
            VerifyConfig::default(),
            audit.clone(),
            broadcaster.clone(),
        ),
        monitor: SecurityMonitor::new(audit.clone(), broadcaster.clone()),
        emergency: EmergencyService::new(audit.clone(), notifier.clone(), broadcaster.clone()),
        audit,
        broadcaster,
        notifier,
    }
}

#[tokio::test]
async fn full_delivery_flow_stays_obfuscated_outside_emergencies() {
    let p = platform();
    let actor = Actor::new(UserId::new(), Role::Driver);
    let delivery = DeliveryId::new();
    let driver = UserId::new();

    // Driver feeds fixes through the obfuscator into the monitor.
    let raw = RawCoordinates::new(-1.286, 36.817).unwrap();
    let ob = obfuscate::obfuscate(&raw, 8).unwrap();
    p.monitor
        .process_location_update(actor, delivery, driver, &ob, None)
        .await;

    // Recipient verifies with OTP + geofence.
    p.verifier
        .initialize(
            actor,
            delivery,
            vec![VerificationMethod::Otp, VerificationMethod::Geofence],
        )
        .await;
    let (otp, _) = p.verifier.generate_otp(actor, delivery, UserId::new()).await;
    let dest = RawCoordinates::new(-1.2861, 36.8171).unwrap();
    p.verifier
        .verify_geofence(actor, delivery, raw, dest, None)
        .await;
    assert!(p.verifier.verify_otp(actor, delivery, &otp).await.valid);
    assert!(p.verifier.status(delivery).await.unwrap().complete);

    // No audit entry outside the emergency path carries a raw coordinate.
    for entry in p.audit.query(None, None, 1000).await {
        let meta = entry.metadata.to_string();
        assert!(!meta.contains("36.817"), "leaked longitude in {meta}");
        assert!(!meta.contains("-1.286"), "leaked latitude in {meta}");
    }
    assert!(p.audit.verify_chain().await);
}

#[tokio::test]
async fn emergency_reaches_responders_with_raw_location() {
    let p = platform();
    let driver = UserId::new();
    let actor = Actor::new(driver, Role::Driver);
    let delivery = DeliveryId::new();

    // A security officer and a customer are both online.
    let (officer_conn, mut officer_rx) = p.broadcaster.connect().await;
    p.broadcaster
        .authenticate(officer_conn, UserId::new(), Role::SecurityOfficer)
        .await;
    let (customer_conn, mut customer_rx) = p.broadcaster.connect().await;
    p.broadcaster
        .authenticate(customer_conn, UserId::new(), Role::Customer)
        .await;
    p.broadcaster.subscribe(customer_conn, delivery).await;

    let spot = RawCoordinates::new(-1.300, 36.800).unwrap();
    let record = p.emergency.panic(actor, driver, spot, Some(delivery)).await;

    // Idempotent second trigger.
    let again = p.emergency.panic(actor, driver, spot, Some(delivery)).await;
    assert_eq!(record.id, again.id);

    // Officer sees the raw location; the customer's room got nothing.
    let event = officer_rx.try_recv().unwrap();
    assert_eq!(event.name, "alert:emergency");
    assert_eq!(event.payload["location"]["longitude"], 36.800);
    assert!(customer_rx.try_recv().is_err());

    // Resolution frees the driver's active slot.
    let admin = Actor::new(UserId::new(), Role::Admin);
    p.emergency
        .resolve(admin, record.id, admin.user_id.unwrap())
        .await
        .unwrap();
    assert!(p.emergency.active_for(driver).await.is_none());
}

#[tokio::test]
async fn critical_notification_pierces_preferences_and_is_audited() {
    let p = platform();
    let recipient = UserId::new();
    let system = Actor::system();

    p.notifier
        .set_preferences(
            system,
            recipient,
            discret_core::notify::UserPreferences {
                channels: vec![Channel::Email],
                quiet: None,
            },
        )
        .await;

    let record = p
        .notifier
        .send(
            system,
            recipient,
            Channel::Sms,
            "emergency_alert",
            "driver needs help",
            Priority::Critical,
        )
        .await
        .unwrap();
    assert_eq!(record.priority, Priority::Critical);

    let entries = p.audit.query(None, Some("notification"), 10).await;
    assert!(!entries.is_empty());
}

#[tokio::test]
async fn offline_subscriber_catches_up_after_authenticate() {
    let p = platform();
    let user = UserId::new();

    for i in 0..3 {
        p.broadcaster
            .broadcast(RealtimeEvent::new(
                "delivery:status",
                json!({ "seq": i }),
                Audience::users(vec![user]),
            ))
            .await;
    }

    let (conn, mut rx) = p.broadcaster.connect().await;
    p.broadcaster.authenticate(conn, user, Role::Customer).await;

    for i in 0..3 {
        assert_eq!(rx.try_recv().unwrap().payload["seq"], i);
    }
    assert!(rx.try_recv().is_err());
}
