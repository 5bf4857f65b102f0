use jobpulse_core::wire::DEFAULT_MAX_FRAME_BYTES;
use std::time::Duration;
use url::Url;

pub const DEFAULT_SYNCED_DISPLAY: Duration = Duration::from_secs(3);

/// Bounded retry schedule used after an established connection drops.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl ReconnectPolicy {
    pub fn next_delay(&self, current: Duration) -> Duration {
        let next = current + current;
        if next > self.max_delay {
            self.max_delay
        } else {
            next
        }
    }

    /// Every delay the policy will sleep before giving up.
    pub fn schedule(&self) -> Vec<Duration> {
        let mut delays = Vec::with_capacity(self.max_attempts as usize);
        let mut delay = self.initial_delay;
        for _ in 0..self.max_attempts {
            delays.push(delay);
            delay = self.next_delay(delay);
        }
        delays
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub hub_url: Url,
    pub handshake_timeout: Duration,
    pub max_frame_bytes: usize,
    pub reconnect: ReconnectPolicy,
}

impl ClientConfig {
    pub fn new(hub_url: Url) -> Self {
        Self {
            hub_url,
            handshake_timeout: Duration::from_secs(10),
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            reconnect: ReconnectPolicy::default(),
        }
    }

    pub fn with_reconnect(mut self, reconnect: ReconnectPolicy) -> Self {
        self.reconnect = reconnect;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplayConfig {
    /// How long `synced` stays visible before the queue status falls back to
    /// `idle`.
    pub synced_display: Duration,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            synced_display: DEFAULT_SYNCED_DISPLAY,
        }
    }
}
