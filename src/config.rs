use std::time::Duration;

use e2ecore::consts::{MAX_FORWARD_JUMP, MAX_SKIPPED_MESSAGE_KEYS};
use e2ecore::{FreshnessPolicy, RatchetEngine};
use serde::{Deserialize, Serialize};

const DAY: i64 = 24 * 60 * 60;

/// Key lifecycle and ratchet policy for one device. Every field has a default,
/// so partial JSON documents are accepted.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Peers reject a signed pre-key older than this.
    pub signed_pre_key_lifetime_secs: i64,
    /// Maintenance rotates the signed pre-key once it is this old.
    pub signed_pre_key_rotation_secs: i64,
    /// A retired signed pre-key still accepts handshakes for this long.
    pub signed_pre_key_grace_secs: i64,
    pub clock_skew_secs: i64,
    pub one_time_pre_key_target: u32,
    pub one_time_pre_key_low_watermark: u32,
    pub max_skipped_message_keys: usize,
    pub max_forward_jump: u32,
    pub directory_timeout_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            signed_pre_key_lifetime_secs: 30 * DAY,
            signed_pre_key_rotation_secs: 7 * DAY,
            signed_pre_key_grace_secs: 14 * DAY,
            clock_skew_secs: 5 * 60,
            one_time_pre_key_target: 100,
            one_time_pre_key_low_watermark: 20,
            max_skipped_message_keys: MAX_SKIPPED_MESSAGE_KEYS,
            max_forward_jump: MAX_FORWARD_JUMP,
            directory_timeout_ms: 10_000,
        }
    }
}

impl ClientConfig {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    pub fn freshness_policy(&self) -> FreshnessPolicy {
        FreshnessPolicy {
            max_lifetime_secs: self.signed_pre_key_lifetime_secs,
            max_clock_skew_secs: self.clock_skew_secs,
        }
    }

    pub fn ratchet_engine(&self) -> RatchetEngine {
        RatchetEngine::new(self.max_skipped_message_keys, self.max_forward_jump)
    }

    pub fn directory_timeout(&self) -> Duration {
        Duration::from_millis(self.directory_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_keeps_defaults() {
        let config =
            ClientConfig::from_json(r#"{ "one_time_pre_key_target": 10, "max_forward_jump": 50 }"#)
                .unwrap();
        assert_eq!(config.one_time_pre_key_target, 10);
        assert_eq!(config.max_forward_jump, 50);
        assert_eq!(
            config.one_time_pre_key_low_watermark,
            ClientConfig::default().one_time_pre_key_low_watermark
        );
    }

    #[test]
    fn json_roundtrip() {
        let config = ClientConfig {
            directory_timeout_ms: 250,
            ..Default::default()
        };
        let parsed = ClientConfig::from_json(&config.to_json().unwrap()).unwrap();
        assert_eq!(parsed, config);
        assert_eq!(parsed.directory_timeout(), Duration::from_millis(250));
    }

    #[test]
    fn rejects_malformed_json() {
        assert!(ClientConfig::from_json("{ not json").is_err());
    }
}
