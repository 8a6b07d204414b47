//! Tunable timing and retry parameters.
//!
//! The defaults mirror the protocol's observed constants (3 attempts, 1s
//! polling, 1s inter-phase delay, 60s completion ceiling); callers may adjust
//! them for slow networks.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ProtocolConfig {
    /// Attempts per protocol phase before the failure becomes fatal
    pub max_attempts: u8,
    /// Interval for discovery, inbound-message and completion polling
    pub poll_interval: Duration,
    /// Pause between the ECDSA and EdDSA phases so peers can catch up
    pub inter_phase_delay: Duration,
    /// Ceiling for the all-parties completion barrier
    pub barrier_timeout: Duration,
    /// Download attempts for the setup message before giving up
    pub setup_download_attempts: u8,
    /// Ceiling for a single phase attempt
    pub phase_timeout: Duration,
    /// Spin interval of the outbound pump loop
    pub pump_interval: Duration,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            poll_interval: Duration::from_secs(1),
            inter_phase_delay: Duration::from_secs(1),
            barrier_timeout: Duration::from_secs(60),
            setup_download_attempts: 10,
            phase_timeout: Duration::from_secs(120),
            pump_interval: Duration::from_millis(100),
        }
    }
}

impl ProtocolConfig {
    pub fn with_max_attempts(mut self, attempts: u8) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_barrier_timeout(mut self, timeout: Duration) -> Self {
        self.barrier_timeout = timeout;
        self
    }

    pub fn with_phase_timeout(mut self, timeout: Duration) -> Self {
        self.phase_timeout = timeout;
        self
    }

    /// Tight timings for tests and loopback transports.
    pub fn fast() -> Self {
        Self {
            max_attempts: 3,
            poll_interval: Duration::from_millis(20),
            inter_phase_delay: Duration::from_millis(10),
            barrier_timeout: Duration::from_secs(2),
            setup_download_attempts: 10,
            phase_timeout: Duration::from_secs(5),
            pump_interval: Duration::from_millis(5),
        }
    }
}
