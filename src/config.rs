//! Configuration for accepting PROXY protocol headers.

use crate::Version;
use serde::Deserialize;
use std::time::Duration;

/// PROXY protocol configuration for a listener
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ProxyProtocolConfig {
    /// Accept the human-readable v1 header.
    pub accept_v1: bool,

    /// Accept the binary v2 header.
    pub accept_v2: bool,

    /// Timeout for reading the PROXY header in seconds.
    /// Default: 5 seconds
    ///
    /// Only the tokio endpoint enforces this; the parsers never wait.
    pub timeout: u64,
}

impl Default for ProxyProtocolConfig {
    fn default() -> Self {
        Self {
            accept_v1: true,
            accept_v2: true,
            timeout: 5,
        }
    }
}

impl ProxyProtocolConfig {
    /// Get timeout as Duration
    pub fn timeout_duration(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    pub fn accepts(&self, version: Version) -> bool {
        match version {
            Version::V1 => self.accept_v1,
            Version::V2 => self.accept_v2,
        }
    }
}
