use std::time::Duration;

use relay_core::protocol::CloseClass;

/// Reconnect scheduling after a dropped connection.
///
/// Ordinary closures back off linearly (delay grows by a fixed increment per
/// attempt) with a small attempt bound. Device-conflict closures are expected
/// to self-resolve, so they double from a base delay up to a cap — but with a
/// smaller attempt bound so they cannot spin forever. Logout never retries.
#[derive(Clone, Debug)]
pub struct ReconnectPolicy {
    pub linear_increment: Duration,
    pub linear_max_attempts: u32,
    pub conflict_base: Duration,
    pub conflict_cap: Duration,
    pub conflict_max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            linear_increment: Duration::from_secs(2),
            linear_max_attempts: 5,
            conflict_base: Duration::from_secs(1),
            conflict_cap: Duration::from_secs(30),
            conflict_max_attempts: 3,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before reconnect attempt number `attempt` (1-based), or `None`
    /// when the budget for this close class is exhausted.
    pub fn delay(&self, class: CloseClass, attempt: u32) -> Option<Duration> {
        match class {
            CloseClass::LoggedOut => None,
            CloseClass::Conflict => {
                if attempt > self.conflict_max_attempts {
                    return None;
                }
                let doubled = self
                    .conflict_base
                    .saturating_mul(1u32 << (attempt - 1).min(16));
                Some(doubled.min(self.conflict_cap))
            }
            CloseClass::Other => {
                if attempt > self.linear_max_attempts {
                    return None;
                }
                Some(self.linear_increment.saturating_mul(attempt))
            }
        }
    }
}
