use std::time::Duration;

/// How long an outgoing call rings before it is given up as unanswered.
pub const DEFAULT_RING_TIMEOUT: Duration = Duration::from_secs(60);

pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";

/// Configuration for the call manager.
#[derive(Debug, Clone)]
pub struct CallManagerConfig {
    /// Deadline for an outgoing call to be answered.
    pub ring_timeout: Duration,
    /// Deadline for the local user to answer an incoming call.
    /// `None` lets an incoming call ring until the caller gives up.
    pub callee_timeout: Option<Duration>,
    /// Incoming calls beyond this are declined as busy; outgoing ones fail.
    pub max_concurrent_calls: usize,
    /// End the call when the engine rejects a session description.
    /// When false the failure is only reported and the call stays connected.
    pub end_on_negotiation_failure: bool,
    /// ICE servers handed to every negotiation engine.
    pub ice_servers: Vec<String>,
}

impl Default for CallManagerConfig {
    fn default() -> Self {
        Self {
            ring_timeout: DEFAULT_RING_TIMEOUT,
            callee_timeout: None,
            max_concurrent_calls: 4,
            end_on_negotiation_failure: false,
            ice_servers: vec![DEFAULT_STUN_SERVER.to_string()],
        }
    }
}

impl CallManagerConfig {
    pub fn with_ring_timeout(mut self, timeout: Duration) -> Self {
        self.ring_timeout = timeout;
        self
    }

    pub fn with_callee_timeout(mut self, timeout: Duration) -> Self {
        self.callee_timeout = Some(timeout);
        self
    }

    pub fn with_max_concurrent_calls(mut self, max: usize) -> Self {
        self.max_concurrent_calls = max;
        self
    }
}
