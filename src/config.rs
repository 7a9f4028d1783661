//! Configuration for [`crate::MirrorPeering`].
//!
//! Every field has a default, so a config file only needs the mirror lists.
//! Mirrors are written as hex-encoded mirror address records, which for a
//! mirror without socket hints is just its 64-character public key.

use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::backoff::DEFAULT_BACKOFF;
use crate::peer::{PeerOptions, DEFAULT_REQUEST_ATTEMPTS};
use crate::protocol::MirrorAddr;
use crate::registry::GcPolicy;

/// Number of mirrors each resource is mapped onto.
pub const DEFAULT_PICK: usize = 2;

/// Upper bound on writer cores tracked per autobase in one batch.
pub const DEFAULT_MAX_AUTOBASE_WRITERS: usize = 64;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PeeringConfig {
    /// Candidates for autobases and mailbox posts.
    pub autobase_mirrors: Vec<MirrorAddr>,
    /// Candidates for standalone cores.
    pub core_mirrors: Vec<MirrorAddr>,
    pub pick: usize,
    pub gc_interval_ms: u64,
    pub gc_strikes: u32,
    /// Base reconnect delays in milliseconds.
    pub backoff_ms: Vec<u64>,
    pub request_attempts: usize,
    pub max_autobase_writers: usize,
    /// Hold sessions for replication but never announce cores.
    pub passive: bool,
}

impl Default for PeeringConfig {
    fn default() -> Self {
        let gc = GcPolicy::default();
        Self {
            autobase_mirrors: Vec::new(),
            core_mirrors: Vec::new(),
            pick: DEFAULT_PICK,
            gc_interval_ms: gc.interval.as_millis() as u64,
            gc_strikes: gc.strikes,
            backoff_ms: DEFAULT_BACKOFF.iter().map(|d| d.as_millis() as u64).collect(),
            request_attempts: DEFAULT_REQUEST_ATTEMPTS,
            max_autobase_writers: DEFAULT_MAX_AUTOBASE_WRITERS,
            passive: false,
        }
    }
}

impl PeeringConfig {
    /// Use the same candidates for both cores and autobases.
    pub fn with_mirrors(mirrors: Vec<MirrorAddr>) -> Self {
        Self {
            autobase_mirrors: mirrors.clone(),
            core_mirrors: mirrors,
            ..Self::default()
        }
    }

    /// Parse a JSON config. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("invalid peering config")
    }

    /// Collection policy for the connection registry.
    pub fn gc_policy(&self) -> GcPolicy {
        GcPolicy {
            interval: Duration::from_millis(self.gc_interval_ms),
            strikes: self.gc_strikes.max(1),
        }
    }

    /// Options applied to every new peer connection.
    pub fn peer_options(&self) -> PeerOptions {
        PeerOptions {
            backoff: self.backoff_ms.iter().map(|ms| Duration::from_millis(*ms)).collect(),
            request_attempts: self.request_attempts.max(1),
            suspended: false,
            passive: self.passive,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_missing_fields() {
        let key = "ab".repeat(32);
        let json = format!(r#"{{ "core_mirrors": ["{key}"], "pick": 3 }}"#);
        let config = PeeringConfig::from_json(&json).expect("config parses");

        assert_eq!(config.pick, 3);
        assert_eq!(config.core_mirrors, vec![MirrorAddr::from_key([0xab; 32])]);
        assert!(config.autobase_mirrors.is_empty());
        assert_eq!(config.gc_policy(), GcPolicy::default());
        assert_eq!(config.peer_options().backoff, DEFAULT_BACKOFF.to_vec());
        assert!(!config.passive);
    }

    #[test]
    fn mirrors_round_trip_through_json() {
        let config = PeeringConfig::with_mirrors(vec![MirrorAddr::from_key([7; 32])]);
        let json = serde_json::to_string(&config).expect("serializes");
        assert_eq!(PeeringConfig::from_json(&json).expect("parses"), config);
    }

    #[test]
    fn malformed_mirror_is_rejected() {
        assert!(PeeringConfig::from_json(r#"{ "core_mirrors": ["zz"] }"#).is_err());
    }
}
