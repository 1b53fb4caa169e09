/*
 * @file config.rs
 * @brief Connection-level configuration for the async wire client core
 */

use std::time::Duration;

/// `SO_KEEPALIVE` tuning. Defaults mirror the original client's fixed
/// constants: 15s idle, `max(1, idle/3)` between probes, 3 probes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepaliveOptions {
    pub idle: Duration,
    pub interval: Duration,
    pub probes: u32,
}

impl KeepaliveOptions {
    pub fn with_idle(idle: Duration) -> Self {
        let interval_secs = (idle.as_secs() / 3).max(1);
        KeepaliveOptions {
            idle,
            interval: Duration::from_secs(interval_secs),
            probes: 3,
        }
    }
}

impl Default for KeepaliveOptions {
    fn default() -> Self {
        Self::with_idle(Duration::from_secs(15))
    }
}

/// Options consumed by `transport::connect_*`. This core has no persisted
/// state and no file/env configuration layer — callers construct
/// `ConnectOptions` programmatically.
#[derive(Debug, Clone, Default)]
pub struct ConnectOptions {
    pub timeout: Option<Duration>,
    pub keepalive: Option<KeepaliveOptions>,
    pub reuseaddr: bool,
    pub source_addr: Option<String>,
}

impl ConnectOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_keepalive(mut self, keepalive: KeepaliveOptions) -> Self {
        self.keepalive = Some(keepalive);
        self
    }

    pub fn with_reuseaddr(mut self, reuseaddr: bool) -> Self {
        self.reuseaddr = reuseaddr;
        self
    }

    pub fn with_source_addr(mut self, source_addr: impl Into<String>) -> Self {
        self.source_addr = Some(source_addr.into());
        self
    }
}
