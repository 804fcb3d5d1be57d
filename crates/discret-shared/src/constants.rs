/// Application name
pub const APP_NAME: &str = "Discret";

/// ChaCha20-Poly1305 nonce size in bytes (96 bits)
pub const NONCE_SIZE: usize = 12;

/// ChaCha20-Poly1305 tag size in bytes (128 bits)
pub const TAG_SIZE: usize = 16;

/// Symmetric key size in bytes
pub const SYMMETRIC_KEY_SIZE: usize = 32;

/// Minimum length for operator-supplied secrets
pub const MIN_SECRET_LEN: usize = 32;

/// Zone grid resolution bounds (hex cells, ~1.2 km down to ~170 m edge)
pub const MIN_ZONE_RESOLUTION: u8 = 7;
pub const MAX_ZONE_RESOLUTION: u8 = 9;
pub const DEFAULT_ZONE_RESOLUTION: u8 = 8;

/// Maximum proof-of-delivery photo size pre-encryption (5 MiB)
pub const MAX_PHOTO_BYTES: usize = 5 * 1024 * 1024;

/// Per-driver location history depth kept by the security monitor
pub const LOCATION_HISTORY_DEPTH: usize = 100;

/// Per-user offline event queue depth
pub const OFFLINE_QUEUE_DEPTH: usize = 50;

/// Accelerometer reading buffer depth per driver
pub const ACCEL_BUFFER_DEPTH: usize = 30;

/// G-force magnitude that counts as an impact
pub const IMPACT_G_THRESHOLD: f64 = 4.0;

/// Realtime keepalive ping interval
pub const WS_PING_INTERVAL_SECS: u64 = 25;

/// Realtime idle timeout
pub const WS_IDLE_TIMEOUT_SECS: u64 = 30;

/// Default HTTP API port
pub const DEFAULT_HTTP_PORT: u16 = 3001;
