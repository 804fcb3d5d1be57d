use thiserror::Error;

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("encryption failed")]
    EncryptionFailed,

    #[error("invalid_format: ciphertext must be base64(nonce):base64(tag):base64(body)")]
    InvalidFormat,

    #[error("auth_failed: ciphertext authentication failed")]
    AuthFailed,

    #[error("password hash error: {0}")]
    PasswordHash(String),
}

#[derive(Error, Debug)]
pub enum GeoError {
    #[error("latitude {0} out of range [-90, 90]")]
    LatitudeOutOfRange(f64),

    #[error("longitude {0} out of range [-180, 180]")]
    LongitudeOutOfRange(f64),

    #[error("invalid zone id: {0}")]
    InvalidZoneId(String),
}
