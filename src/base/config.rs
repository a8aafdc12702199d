//! Engine configuration.
//!
//! All knobs are plain numbers so the struct can be loaded from JSON next to
//! the rest of an application's settings.

use crate::base::neterror::NetError;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// How the synchronous resolver hands back addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResolverMode {
    /// Every address the system resolver returns, in resolver order.
    #[default]
    Full,
    /// A single IPv4 address, as older stacks did.
    Legacy,
}

/// Configuration options for [`SocketEngine`](crate::engine::SocketEngine).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Bound on every blocking-style read/write wait. 0 waits forever.
    pub io_timeout_secs: u64,

    /// Pause after a blocking connect succeeds. 0 disables it.
    pub settle_delay_ms: u64,

    /// Poll quantum used by event-loop readiness watches.
    pub watch_quantum_ms: u64,

    /// Candidate list shape.
    pub resolver_mode: ResolverMode,

    /// File whose modification time triggers a resolver reload.
    pub resolv_conf: PathBuf,

    /// Initial buffer size for `get_line_alloc`.
    pub line_buffer_size: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            io_timeout_secs: 60,
            settle_delay_ms: 100,
            watch_quantum_ms: 50,
            resolver_mode: ResolverMode::Full,
            resolv_conf: PathBuf::from("/etc/resolv.conf"),
            line_buffer_size: 256,
        }
    }
}

impl EngineConfig {
    /// Parse a JSON document. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self, NetError> {
        serde_json::from_str(json).map_err(|e| {
            NetError::io(std::io::Error::new(std::io::ErrorKind::InvalidData, e))
        })
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_secs(self.io_timeout_secs)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn watch_quantum(&self) -> Duration {
        // A zero quantum would turn every watch into a busy loop.
        Duration::from_millis(self.watch_quantum_ms.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.io_timeout(), Duration::from_secs(60));
        assert_eq!(config.settle_delay(), Duration::from_millis(100));
        assert_eq!(config.resolver_mode, ResolverMode::Full);
    }

    #[test]
    fn test_from_json_partial() {
        let config =
            EngineConfig::from_json(r#"{"settle_delay_ms": 0, "resolver_mode": "legacy"}"#)
                .unwrap();
        assert_eq!(config.settle_delay(), Duration::ZERO);
        assert_eq!(config.resolver_mode, ResolverMode::Legacy);
        assert_eq!(config.io_timeout_secs, 60);
    }

    #[test]
    fn test_from_json_invalid() {
        assert!(EngineConfig::from_json("{not json").is_err());
    }

    #[test]
    fn test_zero_quantum_clamped() {
        let config = EngineConfig {
            watch_quantum_ms: 0,
            ..EngineConfig::default()
        };
        assert_eq!(config.watch_quantum(), Duration::from_millis(1));
    }
}
