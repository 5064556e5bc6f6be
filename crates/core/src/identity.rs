//! Durable per-install user identity.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;

const SUFFIX_ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
const SUFFIX_LEN: usize = 6;

/// Identifies one installation to the backend. Generated on first launch,
/// persisted, and reused for every later session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    /// Generates a fresh id of the form `user_<unix-millis>_<6 base36 chars>`.
    pub fn generate() -> Self {
        let millis = chrono::Utc::now().timestamp_millis();
        let mut rng = rand::rng();
        let suffix: String = (0..SUFFIX_LEN)
            .map(|_| SUFFIX_ALPHABET[rng.random_range(0..SUFFIX_ALPHABET.len())] as char)
            .collect();
        Self(format!("user_{}_{}", millis, suffix))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The conversation endpoint for this user on `host` (`host[:port]`).
    pub fn endpoint(&self, host: &str) -> String {
        format!("ws://{}/api/v1/senior/ws/{}", host, self.0)
    }
}

impl From<String> for UserId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_format() {
        let id = UserId::generate();
        let parts: Vec<&str> = id.as_str().split('_').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "user");
        assert!(parts[1].parse::<i64>().is_ok());
        assert_eq!(parts[2].len(), SUFFIX_LEN);
        assert!(
            parts[2]
                .chars()
                .all(|c| c.is_ascii_digit() || c.is_ascii_lowercase())
        );
    }

    #[test]
    fn test_generated_ids_differ() {
        assert_ne!(UserId::generate(), UserId::generate());
    }

    #[test]
    fn test_endpoint() {
        let id = UserId::from("user_1752719078023_16myc6".to_string());
        assert_eq!(
            id.endpoint("192.168.101.48:8080"),
            "ws://192.168.101.48:8080/api/v1/senior/ws/user_1752719078023_16myc6"
        );
    }

    #[test]
    fn test_serializes_as_plain_string() {
        let id = UserId::from("user_1_abcdef".to_string());
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"user_1_abcdef\"");
        let back: UserId = serde_json::from_str("\"user_1_abcdef\"").unwrap();
        assert_eq!(back, id);
    }
}
