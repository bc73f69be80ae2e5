//! Tunables for the manager and the client sync engine.
//!
//! Defaults match the production posture: pushes are cheap, pulls are held
//! open for half a minute, and a derailed client backs off hard before
//! hammering the manager again. `for_testing` variants shrink every interval
//! so integration tests finish in milliseconds.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Live instances above this count evict the least-recently-active one.
    pub max_instances: usize,
    /// Steps retained per instance for incremental catch-up.
    pub step_history: usize,
    /// How long a pull with no new steps is held open.
    pub long_poll_timeout: Duration,
    /// How often idle instances are swept out.
    pub sweep_interval: Duration,
    /// Presence entries not re-confirmed within this window are dropped.
    pub presence_timeout: Duration,
    /// Quiet period coalescing snapshot writes after a burst of pushes.
    pub save_debounce: Duration,
    /// Whether a `GetDocument` for an unknown name creates it.
    pub create_on_missing: bool,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        ManagerConfig {
            max_instances: 20,
            step_history: 1000,
            long_poll_timeout: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(5),
            presence_timeout: Duration::from_secs(5),
            save_debounce: Duration::from_secs(10),
            create_on_missing: true,
        }
    }
}

impl ManagerConfig {
    pub fn for_testing() -> Self {
        ManagerConfig {
            max_instances: 4,
            step_history: 32,
            long_poll_timeout: Duration::from_millis(150),
            sweep_interval: Duration::from_millis(40),
            presence_timeout: Duration::from_millis(30),
            save_debounce: Duration::from_millis(25),
            create_on_missing: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Pause between polls when the last pull came back empty.
    pub poll_delay: Duration,
    /// First retry delay after the manager stops responding.
    pub backoff_base: Duration,
    /// Retry delay ceiling; doubling stops here.
    pub backoff_cap: Duration,
    /// Document size at which the engine detaches and goes local-only.
    pub max_doc_size: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            poll_delay: Duration::from_secs(1),
            backoff_base: Duration::from_millis(200),
            backoff_cap: Duration::from_secs(60),
            max_doc_size: 40_000,
        }
    }
}

impl EngineConfig {
    pub fn for_testing() -> Self {
        EngineConfig {
            poll_delay: Duration::from_millis(20),
            backoff_base: Duration::from_millis(10),
            backoff_cap: Duration::from_millis(80),
            max_doc_size: 40_000,
        }
    }
}

/// Deadlines for the typed request wrappers.
#[derive(Debug, Clone)]
pub struct CommTimeouts {
    /// Plain requests: load and push.
    pub request: Duration,
    /// Pulls, which may be held open by the manager. Must exceed the
    /// manager's long-poll window or every quiet poll reads as an outage.
    pub pull: Duration,
}

impl Default for CommTimeouts {
    fn default() -> Self {
        CommTimeouts {
            request: Duration::from_secs(1),
            pull: Duration::from_secs(35),
        }
    }
}

impl CommTimeouts {
    pub fn for_testing() -> Self {
        CommTimeouts {
            request: Duration::from_millis(250),
            pull: Duration::from_millis(400),
        }
    }
}
