use std::env;

use discret_shared::constants::{DEFAULT_HTTP_PORT, MIN_SECRET_LEN};

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub rust_env: String,
    pub host: String,
    pub port: u16,

    pub jwt_secret: String,
    pub encryption_key: String,
    pub hmac_secret: String,

    pub location_grid_size_meters: u32,
    pub code_ttl_minutes: i64,
    pub code_max_attempts: u32,
    pub otp_ttl_seconds: i64,
    pub otp_length: usize,

    pub retention_days_location: i64,
    pub retention_days_delivery: i64,
    pub retention_days_audit: i64,

    pub rate_limit_window_ms: u64,
    pub rate_limit_max_requests: u32,
    pub cors_origin: Option<String>,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, String> {
        let config = Self {
            rust_env: read_optional_string("RUST_ENV", "development"),
            host: read_optional_string("HOST", "0.0.0.0"),
            port: read_optional_parsed("PORT", DEFAULT_HTTP_PORT)?,

            jwt_secret: read_var("JWT_SECRET")?,
            encryption_key: read_var("ENCRYPTION_KEY")?,
            hmac_secret: read_var("HMAC_SECRET")?,

            location_grid_size_meters: read_optional_parsed("LOCATION_GRID_SIZE_METERS", 500)?,
            code_ttl_minutes: read_optional_parsed("CODE_TTL_MINUTES", 30)?,
            code_max_attempts: read_optional_parsed("CODE_MAX_ATTEMPTS", 5)?,
            otp_ttl_seconds: read_optional_parsed("OTP_TTL_SECONDS", 300)?,
            otp_length: read_optional_parsed("OTP_LENGTH", 6)?,

            retention_days_location: read_optional_parsed("RETENTION_DAYS_LOCATION", 30)?,
            retention_days_delivery: read_optional_parsed("RETENTION_DAYS_DELIVERY", 365)?,
            retention_days_audit: read_optional_parsed("RETENTION_DAYS_AUDIT", 2555)?,

            rate_limit_window_ms: read_optional_parsed("RATE_LIMIT_WINDOW_MS", 60_000)?,
            rate_limit_max_requests: read_optional_parsed("RATE_LIMIT_MAX_REQUESTS", 100)?,
            cors_origin: env::var("CORS_ORIGIN").ok().filter(|s| !s.is_empty()),
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), String> {
        for (name, value) in [
            ("JWT_SECRET", &self.jwt_secret),
            ("ENCRYPTION_KEY", &self.encryption_key),
            ("HMAC_SECRET", &self.hmac_secret),
        ] {
            if value.len() < MIN_SECRET_LEN {
                return Err(format!("{name} must be at least {MIN_SECRET_LEN} characters"));
            }
            if self.is_production() && value.contains("CHANGE_ME") {
                return Err(format!("{name} still carries a placeholder value"));
            }
        }
        Ok(())
    }

    pub fn is_production(&self) -> bool {
        self.rust_env == "production"
    }

    /// Map the configured grid size onto a hex-cell resolution.
    /// Edge lengths run ~1.2 km (res 7), ~460 m (res 8), ~170 m (res 9).
    pub fn default_resolution(&self) -> u8 {
        match self.location_grid_size_meters {
            0..=250 => 9,
            251..=900 => 8,
            _ => 7,
        }
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn read_var(name: &str) -> Result<String, String> {
    env::var(name).map_err(|_| format!("{name} is required"))
}

fn read_optional_string(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

fn read_optional_parsed<T: std::str::FromStr>(name: &str, default: T) -> Result<T, String>
where
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(raw) => raw.parse::<T>().map_err(|e| format!("invalid {name}: {e}")),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> AppConfig {
        AppConfig {
            rust_env: "development".into(),
            host: "0.0.0.0".into(),
            port: DEFAULT_HTTP_PORT,
            jwt_secret: "x".repeat(40),
            encryption_key: "y".repeat(40),
            hmac_secret: "z".repeat(40),
            location_grid_size_meters: 500,
            code_ttl_minutes: 30,
            code_max_attempts: 5,
            otp_ttl_seconds: 300,
            otp_length: 6,
            retention_days_location: 30,
            retention_days_delivery: 365,
            retention_days_audit: 2555,
            rate_limit_window_ms: 60_000,
            rate_limit_max_requests: 100,
            cors_origin: None,
        }
    }

    #[test]
    fn test_short_secret_rejected() {
        let mut config = base_config();
        config.jwt_secret = "short".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_placeholder_rejected_in_production_only() {
        let mut config = base_config();
        config.hmac_secret = format!("CHANGE_ME_{}", "a".repeat(30));
        assert!(config.validate().is_ok());

        config.rust_env = "production".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_grid_size_maps_to_resolution() {
        let mut config = base_config();
        assert_eq!(config.default_resolution(), 8);
        config.location_grid_size_meters = 150;
        assert_eq!(config.default_resolution(), 9);
        config.location_grid_size_meters = 2000;
        assert_eq!(config.default_resolution(), 7);
    }
}
