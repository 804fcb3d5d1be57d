use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::RwLock;
use totp_rs::{Algorithm, TOTP};
use tracing::{info, warn};
use uuid::Uuid;

use crate::access::{Actor, AuditLog, AuditResult};
use crate::realtime::{Audience, Broadcaster, RealtimeEvent};
use discret_shared::constants::MAX_PHOTO_BYTES;
use discret_shared::crypto::{
    self, derive_context_key, hmac_sha256, sha256_hex, SymmetricKey,
};
use discret_shared::error::CryptoError;
use discret_shared::geo::{haversine_distance_m, RawCoordinates};
use discret_shared::types::{DeliveryId, UserId};
use thiserror::Error;

const OTP_SECRET_LEN: usize = 20;
const FALLBACK_CODE_LEN: usize = 8;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum VerificationMethod {
    Otp,
    Photo,
    Signature,
    Geofence,
    Code,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum VerifyReason {
    NoOtpGenerated,
    NoPendingOtp,
    OtpExpired,
    MaxAttemptsExceeded,
    InvalidOtp,
    AlreadyVerified,
    InvalidCode,
}

/// Success-shaped verification outcome; failures here are domain results,
/// not transport errors.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct VerifyOutcome {
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<VerifyReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remaining: Option<u32>,
}

impl VerifyOutcome {
    fn ok() -> Self {
        Self {
            valid: true,
            reason: None,
            remaining: None,
        }
    }

    fn fail(reason: VerifyReason) -> Self {
        Self {
            valid: false,
            reason: Some(reason),
            remaining: None,
        }
    }

    fn fail_with_remaining(reason: VerifyReason, remaining: u32) -> Self {
        Self {
            valid: false,
            reason: Some(reason),
            remaining: Some(remaining),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct GeofenceOutcome {
    pub within: bool,
    pub distance_m: f64,
    pub radius_m: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeliveryVerification {
    pub id: Uuid,
    pub delivery_id: DeliveryId,
    pub required: Vec<VerificationMethod>,
    pub completed: Vec<VerificationMethod>,
    pub complete: bool,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct OtpRecord {
    pub id: Uuid,
    pub delivery_id: DeliveryId,
    pub recipient_id: UserId,
    pub expires_at: DateTime<Utc>,
    pub attempt_count: u32,
    pub verified: bool,
    pub verified_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhotoMeta {
    pub width: u32,
    pub height: u32,
    pub mime: String,
    pub bytes: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeliveryPhoto {
    pub id: Uuid,
    pub delivery_id: DeliveryId,
    pub photo_ciphertext: String,
    pub meta: PhotoMeta,
    pub captured_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeliverySignature {
    pub id: Uuid,
    pub delivery_id: DeliveryId,
    pub sig_ciphertext: String,
    pub sig_hash: String,
    pub signer_name_ciphertext: Option<String>,
    pub captured_at: DateTime<Utc>,
}

#[derive(Error, Debug)]
pub enum VerifyError {
    #[error("delivery {0} has no verification record")]
    NotFound(DeliveryId),

    #[error("photo exceeds the {MAX_PHOTO_BYTES} byte cap")]
    PhotoTooLarge,

    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

#[derive(Debug, Clone, Copy)]
pub struct VerifyConfig {
    pub otp_ttl_secs: i64,
    pub otp_length: usize,
    pub max_otp_attempts: u32,
    pub geofence_radius_m: f64,
}

impl Default for VerifyConfig {
    fn default() -> Self {
        Self {
            otp_ttl_secs: 300,
            otp_length: 6,
            max_otp_attempts: 5,
            geofence_radius_m: 100.0,
        }
    }
}

impl VerifyConfig {
    fn clamped(mut self) -> Self {
        self.otp_ttl_secs = self.otp_ttl_secs.clamp(60, 900);
        self.otp_length = self.otp_length.clamp(4, 8);
        self
    }
}

#[derive(Default)]
struct VerifyState {
    verifications: HashMap<DeliveryId, DeliveryVerification>,
    otp_secrets: HashMap<DeliveryId, Vec<u8>>,
    otps: HashMap<DeliveryId, OtpRecord>,
    photos: HashMap<DeliveryId, DeliveryPhoto>,
    signatures: HashMap<DeliveryId, DeliverySignature>,
}

/// Multi-factor proof that a parcel reached the right recipient at the
/// right place. Owns every per-delivery sub-record; per-delivery OTP
/// secrets never leave the process.
pub struct VerificationService {
    encryption_key: Vec<u8>,
    hmac_secret: Vec<u8>,
    config: VerifyConfig,
    audit: Arc<AuditLog>,
    broadcaster: Arc<Broadcaster>,
    inner: RwLock<VerifyState>,
}

impl VerificationService {
    pub fn new(
        encryption_key: &[u8],
        hmac_secret: &[u8],
        config: VerifyConfig,
        audit: Arc<AuditLog>,
        broadcaster: Arc<Broadcaster>,
    ) -> Self {
        Self {
            encryption_key: encryption_key.to_vec(),
            hmac_secret: hmac_secret.to_vec(),
            config: config.clamped(),
            audit,
            broadcaster,
            inner: RwLock::new(VerifyState::default()),
        }
    }

    fn delivery_key(&self, delivery_id: DeliveryId) -> SymmetricKey {
        derive_context_key(&self.encryption_key, &delivery_id.to_string())
    }

    pub async fn initialize(
        &self,
        actor: Actor,
        delivery_id: DeliveryId,
        required: Vec<VerificationMethod>,
    ) -> DeliveryVerification {
        let verification = DeliveryVerification {
            id: Uuid::new_v4(),
            delivery_id,
            required,
            completed: Vec::new(),
            complete: false,
            completed_at: None,
        };

        {
            let mut state = self.inner.write().await;
            state.verifications.insert(delivery_id, verification.clone());
        }

        self.audit
            .record(
                actor.user_id,
                actor.role,
                "verification.initialize",
                "verification",
                Some(delivery_id.to_string()),
                json!({"required": verification.required}),
                AuditResult::Success,
            )
            .await;

        verification
    }

    /// Lazily creates the per-delivery secret, then emits a time-based
    /// one-time token. The secret stays in process memory.
    pub async fn generate_otp(
        &self,
        actor: Actor,
        delivery_id: DeliveryId,
        recipient_id: UserId,
    ) -> (String, DateTime<Utc>) {
        let expires_at = Utc::now() + TimeDelta::seconds(self.config.otp_ttl_secs);

        let token = {
            let mut state = self.inner.write().await;
            let secret = state
                .otp_secrets
                .entry(delivery_id)
                .or_insert_with(|| {
                    let mut bytes = vec![0u8; OTP_SECRET_LEN];
                    rand::rngs::OsRng.fill_bytes(&mut bytes);
                    bytes
                })
                .clone();

            state.otps.insert(
                delivery_id,
                OtpRecord {
                    id: Uuid::new_v4(),
                    delivery_id,
                    recipient_id,
                    expires_at,
                    attempt_count: 0,
                    verified: false,
                    verified_at: None,
                },
            );

            self.totp(&secret).generate(Utc::now().timestamp() as u64)
        };

        self.audit
            .record(
                actor.user_id,
                actor.role,
                "otp.generate",
                "verification",
                Some(delivery_id.to_string()),
                json!({"recipient_id": recipient_id, "ttl_secs": self.config.otp_ttl_secs}),
                AuditResult::Success,
            )
            .await;

        (token, expires_at)
    }

    pub async fn verify_otp(
        &self,
        actor: Actor,
        delivery_id: DeliveryId,
        token: &str,
    ) -> VerifyOutcome {
        let (outcome, newly_complete) = {
            let mut state = self.inner.write().await;

            let Some(secret) = state.otp_secrets.get(&delivery_id).cloned() else {
                let outcome = VerifyOutcome::fail(VerifyReason::NoOtpGenerated);
                drop(state);
                self.audit_otp_verify(actor, delivery_id, outcome).await;
                return outcome;
            };

            let max_attempts = self.config.max_otp_attempts;
            let totp = self.totp(&secret);
            let Some(record) = state.otps.get_mut(&delivery_id) else {
                let outcome = VerifyOutcome::fail(VerifyReason::NoPendingOtp);
                drop(state);
                self.audit_otp_verify(actor, delivery_id, outcome).await;
                return outcome;
            };

            if record.verified {
                // Consumed records never re-verify and never count attempts.
                let outcome = VerifyOutcome::fail(VerifyReason::AlreadyVerified);
                drop(state);
                self.audit_otp_verify(actor, delivery_id, outcome).await;
                return outcome;
            }

            if record.attempt_count >= max_attempts {
                let outcome = VerifyOutcome::fail(VerifyReason::MaxAttemptsExceeded);
                drop(state);
                self.audit_otp_verify(actor, delivery_id, outcome).await;
                return outcome;
            }

            // Every decided attempt counts, the successful one included.
            record.attempt_count += 1;

            if Utc::now() > record.expires_at {
                let outcome = VerifyOutcome::fail(VerifyReason::OtpExpired);
                drop(state);
                self.audit_otp_verify(actor, delivery_id, outcome).await;
                return outcome;
            }

            // Library comparator is constant-time with a ±1 step window.
            if !totp.check(token, Utc::now().timestamp() as u64) {
                let remaining = max_attempts - record.attempt_count;
                let outcome =
                    VerifyOutcome::fail_with_remaining(VerifyReason::InvalidOtp, remaining);
                drop(state);
                self.audit_otp_verify(actor, delivery_id, outcome).await;
                return outcome;
            }

            record.verified = true;
            record.verified_at = Some(Utc::now());

            let newly_complete = mark_completed(&mut state, delivery_id, VerificationMethod::Otp);
            (VerifyOutcome::ok(), newly_complete)
        };

        self.audit_otp_verify(actor, delivery_id, outcome).await;
        self.publish_completion(newly_complete).await;
        outcome
    }

    async fn audit_otp_verify(
        &self,
        actor: Actor,
        delivery_id: DeliveryId,
        outcome: VerifyOutcome,
    ) {
        self.audit
            .record(
                actor.user_id,
                actor.role,
                "otp.verify",
                "verification",
                Some(delivery_id.to_string()),
                json!({"valid": outcome.valid, "reason": outcome.reason}),
                if outcome.valid {
                    AuditResult::Success
                } else {
                    AuditResult::Failure
                },
            )
            .await;
    }

    pub async fn store_photo(
        &self,
        actor: Actor,
        delivery_id: DeliveryId,
        bytes: &[u8],
        meta: PhotoMeta,
    ) -> Result<DeliveryPhoto, VerifyError> {
        if bytes.len() > MAX_PHOTO_BYTES {
            return Err(VerifyError::PhotoTooLarge);
        }

        let photo_ciphertext = crypto::encrypt(&self.delivery_key(delivery_id), bytes)?;
        let photo = DeliveryPhoto {
            id: Uuid::new_v4(),
            delivery_id,
            photo_ciphertext,
            meta,
            captured_at: Utc::now(),
        };

        let newly_complete = {
            let mut state = self.inner.write().await;
            state.photos.insert(delivery_id, photo.clone());
            mark_completed(&mut state, delivery_id, VerificationMethod::Photo)
        };

        self.audit
            .record(
                actor.user_id,
                actor.role,
                "photo.store",
                "verification",
                Some(delivery_id.to_string()),
                json!({"bytes": photo.meta.bytes, "mime": photo.meta.mime}),
                AuditResult::Success,
            )
            .await;
        self.publish_completion(newly_complete).await;

        Ok(photo)
    }

    pub async fn store_signature(
        &self,
        actor: Actor,
        delivery_id: DeliveryId,
        data: &[u8],
        signer_name: Option<&str>,
    ) -> Result<DeliverySignature, VerifyError> {
        let key = self.delivery_key(delivery_id);
        let sig_hash = sha256_hex(data);
        let sig_ciphertext = crypto::encrypt(&key, data)?;
        let signer_name_ciphertext = match signer_name {
            Some(name) => Some(crypto::encrypt(&key, name.as_bytes())?),
            None => None,
        };

        let signature = DeliverySignature {
            id: Uuid::new_v4(),
            delivery_id,
            sig_ciphertext,
            sig_hash,
            signer_name_ciphertext,
            captured_at: Utc::now(),
        };

        let newly_complete = {
            let mut state = self.inner.write().await;
            state.signatures.insert(delivery_id, signature.clone());
            mark_completed(&mut state, delivery_id, VerificationMethod::Signature)
        };

        self.audit
            .record(
                actor.user_id,
                actor.role,
                "signature.store",
                "verification",
                Some(delivery_id.to_string()),
                json!({"signer_named": signature.signer_name_ciphertext.is_some()}),
                AuditResult::Success,
            )
            .await;
        self.publish_completion(newly_complete).await;

        Ok(signature)
    }

    /// One audit entry regardless of outcome.
    pub async fn verify_geofence(
        &self,
        actor: Actor,
        delivery_id: DeliveryId,
        driver_loc: RawCoordinates,
        delivery_loc: RawCoordinates,
        radius_m: Option<f64>,
    ) -> GeofenceOutcome {
        let radius_m = radius_m.unwrap_or(self.config.geofence_radius_m);
        let distance_m = haversine_distance_m(&driver_loc, &delivery_loc);
        let within = distance_m <= radius_m;

        let newly_complete = if within {
            let mut state = self.inner.write().await;
            mark_completed(&mut state, delivery_id, VerificationMethod::Geofence)
        } else {
            None
        };

        self.audit
            .record(
                actor.user_id,
                actor.role,
                "geofence.verify",
                "verification",
                Some(delivery_id.to_string()),
                json!({"within": within, "distance_m": distance_m.round(), "radius_m": radius_m}),
                if within {
                    AuditResult::Success
                } else {
                    AuditResult::Failure
                },
            )
            .await;
        self.publish_completion(newly_complete).await;

        GeofenceOutcome {
            within,
            distance_m,
            radius_m,
        }
    }

    /// Human-dictated escape hatch when no other factor is workable; the
    /// expected code is an HMAC over the delivery id alone.
    pub async fn fallback(
        &self,
        actor: Actor,
        delivery_id: DeliveryId,
        code: &str,
    ) -> VerifyOutcome {
        let expected = self.fallback_code(delivery_id);
        let supplied = code.trim().to_ascii_uppercase();

        let outcome = if crypto::constant_time_eq(supplied.as_bytes(), expected.as_bytes()) {
            VerifyOutcome::ok()
        } else {
            VerifyOutcome::fail(VerifyReason::InvalidCode)
        };

        let newly_complete = if outcome.valid {
            let mut state = self.inner.write().await;
            let verification = state.verifications.entry(delivery_id).or_insert_with(|| {
                DeliveryVerification {
                    id: Uuid::new_v4(),
                    delivery_id,
                    required: vec![VerificationMethod::Code],
                    completed: Vec::new(),
                    complete: false,
                    completed_at: None,
                }
            });
            if !verification.complete {
                verification.completed = vec![VerificationMethod::Code];
                verification.complete = true;
                verification.completed_at = Some(Utc::now());
                Some(verification.clone())
            } else {
                None
            }
        } else {
            None
        };

        self.audit
            .record(
                actor.user_id,
                actor.role,
                "fallback.verify",
                "verification",
                Some(delivery_id.to_string()),
                json!({"valid": outcome.valid}),
                if outcome.valid {
                    AuditResult::Success
                } else {
                    AuditResult::Failure
                },
            )
            .await;
        self.publish_completion(newly_complete).await;

        outcome
    }

    fn fallback_code(&self, delivery_id: DeliveryId) -> String {
        let mac = hmac_sha256(&self.hmac_secret, delivery_id.to_string().as_bytes());
        hex::encode(&mac)[..FALLBACK_CODE_LEN].to_ascii_uppercase()
    }

    pub async fn status(&self, delivery_id: DeliveryId) -> Option<DeliveryVerification> {
        self.inner
            .read()
            .await
            .verifications
            .get(&delivery_id)
            .cloned()
    }

    /// Required methods not yet completed.
    pub async fn pending(&self, delivery_id: DeliveryId) -> Option<Vec<VerificationMethod>> {
        let state = self.inner.read().await;
        state.verifications.get(&delivery_id).map(|v| {
            v.required
                .iter()
                .filter(|m| !v.completed.contains(m))
                .copied()
                .collect()
        })
    }

    pub async fn otp_record(&self, delivery_id: DeliveryId) -> Option<OtpRecord> {
        self.inner.read().await.otps.get(&delivery_id).cloned()
    }

    fn totp(&self, secret: &[u8]) -> TOTP {
        // new_unchecked: length 4..6 tokens are below RFC 4226's floor but
        // an explicit operator choice here.
        TOTP::new_unchecked(
            Algorithm::SHA1,
            self.config.otp_length,
            1,
            30,
            secret.to_vec(),
        )
    }

    async fn publish_completion(&self, verification: Option<DeliveryVerification>) {
        let Some(v) = verification else { return };
        info!(delivery_id = %v.delivery_id, methods = ?v.completed, "delivery verification complete");
        self.broadcaster
            .broadcast(RealtimeEvent::new(
                "verification:completed",
                json!({
                    "delivery_id": v.delivery_id,
                    "methods": v.completed,
                    "completed_at": v.completed_at,
                }),
                Audience::delivery(v.delivery_id),
            ))
            .await;
    }
}

/// Record a completed method; returns the verification snapshot only when
/// this call transitions it to complete. Completion is monotone.
fn mark_completed(
    state: &mut VerifyState,
    delivery_id: DeliveryId,
    method: VerificationMethod,
) -> Option<DeliveryVerification> {
    let verification = match state.verifications.get_mut(&delivery_id) {
        Some(v) => v,
        None => {
            warn!(%delivery_id, ?method, "method completed for uninitialized verification");
            return None;
        }
    };

    if verification.complete {
        return None;
    }
    if !verification.completed.contains(&method) {
        verification.completed.push(method);
    }

    let all_done = verification
        .required
        .iter()
        .all(|m| verification.completed.contains(m));
    if all_done {
        verification.complete = true;
        verification.completed_at = Some(Utc::now());
        return Some(verification.clone());
    }
    None
}
