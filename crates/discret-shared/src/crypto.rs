use argon2::password_hash::rand_core::OsRng as HashOsRng;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::{Argon2, Params, Version};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::constants::{NONCE_SIZE, SYMMETRIC_KEY_SIZE, TAG_SIZE};
use crate::error::CryptoError;

type HmacSha256 = Hmac<Sha256>;

pub type SymmetricKey = [u8; SYMMETRIC_KEY_SIZE];

/// Per-context key derivation: one context's compromise does not cascade.
pub fn derive_context_key(master_key: &[u8], context_id: &str) -> SymmetricKey {
    let digest = hmac_sha256(master_key, context_id.as_bytes());
    let mut key = [0u8; SYMMETRIC_KEY_SIZE];
    key.copy_from_slice(&digest);
    key
}

pub fn hmac_sha256(key: &[u8], data: &[u8]) -> [u8; 32] {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

pub fn generate_nonce() -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut nonce);
    nonce
}

/// `n` bytes of OS entropy, hex-encoded.
pub fn random_token(n: usize) -> String {
    let mut bytes = vec![0u8; n];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

// Wire form: base64(nonce) ":" base64(tag) ":" base64(body)
pub fn encrypt(key: &SymmetricKey, plaintext: &[u8]) -> Result<String, CryptoError> {
    let cipher = ChaCha20Poly1305::new(key.into());
    let nonce_bytes = generate_nonce();
    let nonce = Nonce::from_slice(&nonce_bytes);

    // aead appends the 16-byte tag to the ciphertext
    let mut sealed = cipher
        .encrypt(nonce, plaintext)
        .map_err(|_| CryptoError::EncryptionFailed)?;
    let tag = sealed.split_off(sealed.len() - TAG_SIZE);
    let body = sealed;

    Ok(format!(
        "{}:{}:{}",
        STANDARD.encode(nonce_bytes),
        STANDARD.encode(tag),
        STANDARD.encode(body)
    ))
}

pub fn decrypt(key: &SymmetricKey, wire: &str) -> Result<Vec<u8>, CryptoError> {
    let mut segments = wire.splitn(3, ':');
    let (nonce_b64, tag_b64, body_b64) = match (segments.next(), segments.next(), segments.next())
    {
        (Some(n), Some(t), Some(b)) => (n, t, b),
        _ => return Err(CryptoError::InvalidFormat),
    };

    let nonce_bytes = STANDARD
        .decode(nonce_b64)
        .map_err(|_| CryptoError::InvalidFormat)?;
    let tag = STANDARD
        .decode(tag_b64)
        .map_err(|_| CryptoError::InvalidFormat)?;
    let body = STANDARD
        .decode(body_b64)
        .map_err(|_| CryptoError::InvalidFormat)?;

    if nonce_bytes.len() != NONCE_SIZE || tag.len() != TAG_SIZE {
        return Err(CryptoError::InvalidFormat);
    }

    let cipher = ChaCha20Poly1305::new(key.into());
    let nonce = Nonce::from_slice(&nonce_bytes);
    let mut sealed = body;
    sealed.extend_from_slice(&tag);

    cipher
        .decrypt(nonce, sealed.as_slice())
        .map_err(|_| CryptoError::AuthFailed)
}

/// Memory-hard password hashing (Argon2id, OWASP-sized parameters).
pub fn hash_password(password: &str) -> Result<String, CryptoError> {
    let salt = SaltString::generate(&mut HashOsRng);
    let argon2 = argon2_instance();
    argon2
        .hash_password(password.as_bytes(), &salt)
        .map(|h| h.to_string())
        .map_err(|e| CryptoError::PasswordHash(e.to_string()))
}

pub fn verify_password(password: &str, hash: &str) -> Result<bool, CryptoError> {
    let parsed = PasswordHash::new(hash).map_err(|e| CryptoError::PasswordHash(e.to_string()))?;
    Ok(argon2_instance()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok())
}

fn argon2_instance() -> Argon2<'static> {
    let params = Params::new(19 * 1024, 2, 1, None).expect("static argon2 params");
    Argon2::new(argon2::Algorithm::Argon2id, Version::V0x13, params)
}

/// Constant-time equality over byte strings.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.ct_eq(b).unwrap_u8() == 1
}
