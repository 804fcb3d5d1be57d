use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use discret_shared::crypto::{constant_time_eq, hmac_sha256};
use discret_shared::types::{DeliveryId, UserId};

const MIN_TTL: TimeDelta = TimeDelta::minutes(5);
const MAX_TTL: TimeDelta = TimeDelta::hours(24);

// Word lists are 16 entries each so two MAC bytes index them uniformly.
const WORDS_CLASSIC: &[&str] = &[
    "amber", "birch", "cedar", "delta", "ember", "flint", "grove", "heron", "iris", "juniper",
    "kestrel", "larch", "maple", "nectar", "otter", "pebble",
];

const WORDS_SAVANNA: &[&str] = &[
    "acacia", "baobab", "cheetah", "duiker", "eland", "falcon", "gazelle", "hyrax", "ibis",
    "jackal", "kudu", "lion", "mamba", "nyala", "oryx", "plover",
];

const WORDS_HARBOR: &[&str] = &[
    "anchor", "buoy", "compass", "dhow", "ebb", "ferry", "galley", "harbor", "inlet", "jetty",
    "keel", "lagoon", "mast", "north", "oar", "pier",
];

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum CodeTheme {
    #[default]
    Classic,
    Savanna,
    Harbor,
}

impl CodeTheme {
    /// Unknown themes fall back to the default list.
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "savanna" => CodeTheme::Savanna,
            "harbor" => CodeTheme::Harbor,
            _ => CodeTheme::Classic,
        }
    }

    fn words(&self) -> &'static [&'static str] {
        match self {
            CodeTheme::Classic => WORDS_CLASSIC,
            CodeTheme::Savanna => WORDS_SAVANNA,
            CodeTheme::Harbor => WORDS_HARBOR,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryCode {
    pub id: Uuid,
    pub delivery_id: DeliveryId,
    pub code: String,
    pub theme: CodeTheme,
    pub expires_at: DateTime<Utc>,
    pub used_at: Option<DateTime<Utc>>,
    pub generated_by: UserId,
    pub created_at: DateTime<Utc>,
}

/// Deterministic themed hand-off codes: the code string is a pure function
/// of (delivery, user, theme, secret), so regeneration never diverges.
pub struct CodeGenerator {
    hmac_secret: Vec<u8>,
    ttl: TimeDelta,
}

impl CodeGenerator {
    pub fn new(hmac_secret: &[u8], ttl: TimeDelta) -> Self {
        Self {
            hmac_secret: hmac_secret.to_vec(),
            ttl: ttl.clamp(MIN_TTL, MAX_TTL),
        }
    }

    pub fn generate(
        &self,
        delivery_id: DeliveryId,
        generated_by: UserId,
        theme: CodeTheme,
    ) -> DeliveryCode {
        let now = Utc::now();
        DeliveryCode {
            id: Uuid::new_v4(),
            delivery_id,
            code: self.code_for(delivery_id, generated_by, theme),
            theme,
            expires_at: now + self.ttl,
            used_at: None,
            generated_by,
            created_at: now,
        }
    }

    fn code_for(&self, delivery_id: DeliveryId, user_id: UserId, theme: CodeTheme) -> String {
        let input = format!("{delivery_id}:{user_id}");
        let h = hmac_sha256(&self.hmac_secret, input.as_bytes());
        let words = theme.words();

        let first = u16::from_be_bytes([h[0], h[1]]) as usize % words.len();
        let second = u16::from_be_bytes([h[2], h[3]]) as usize % words.len();

        format!("{}-{}-{}", words[first], words[second], hex::encode(&h[4..6]))
    }
}

/// Trimmed, case-insensitive equality in constant time.
pub fn validate_code(supplied: &str, expected: &str) -> bool {
    let a = supplied.trim().to_ascii_lowercase();
    let b = expected.trim().to_ascii_lowercase();
    constant_time_eq(a.as_bytes(), b.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn generator() -> CodeGenerator {
        CodeGenerator::new(b"test-hmac-secret-test-hmac-secret", TimeDelta::hours(24))
    }

    #[test]
    fn test_code_deterministic() {
        let gen = generator();
        let delivery = DeliveryId::new();
        let user = UserId::new();

        let a = gen.generate(delivery, user, CodeTheme::Savanna);
        let b = gen.generate(delivery, user, CodeTheme::Savanna);
        assert_eq!(a.code, b.code);
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_code_varies_by_inputs() {
        let gen = generator();
        let delivery = DeliveryId::new();
        let user = UserId::new();

        let base = gen.generate(delivery, user, CodeTheme::Classic);
        let other_delivery = gen.generate(DeliveryId::new(), user, CodeTheme::Classic);
        assert_ne!(base.code, other_delivery.code);
    }

    #[test]
    fn test_code_shape() {
        let gen = generator();
        let code = gen.generate(DeliveryId::new(), UserId::new(), CodeTheme::Harbor);
        let parts: Vec<&str> = code.code.split('-').collect();
        assert_eq!(parts.len(), 3);
        assert!(WORDS_HARBOR.contains(&parts[0]));
        assert!(WORDS_HARBOR.contains(&parts[1]));
        assert_eq!(parts[2].len(), 4);
        assert!(parts[2].chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_unknown_theme_falls_back() {
        assert_eq!(CodeTheme::parse("galactic"), CodeTheme::Classic);
        assert_eq!(CodeTheme::parse("SAVANNA"), CodeTheme::Savanna);
    }

    #[test]
    fn test_ttl_clamped() {
        let gen = CodeGenerator::new(b"secret", TimeDelta::days(14));
        let code = gen.generate(DeliveryId::new(), UserId::new(), CodeTheme::Classic);
        assert!(code.expires_at - code.created_at <= TimeDelta::hours(24));

        let gen = CodeGenerator::new(b"secret", TimeDelta::seconds(10));
        let code = gen.generate(DeliveryId::new(), UserId::new(), CodeTheme::Classic);
        assert!(code.expires_at - code.created_at >= TimeDelta::minutes(5));
    }

    #[test]
    fn test_validate_case_and_whitespace() {
        assert!(validate_code("  Acacia-Kudu-3f2a ", "acacia-kudu-3f2a"));
        assert!(!validate_code("acacia-kudu-3f2b", "acacia-kudu-3f2a"));
    }
}
