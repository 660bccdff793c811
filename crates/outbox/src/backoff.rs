//! Exponential reschedule policy for delivery retries.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Delay policy for rescheduling a failed delivery.
///
/// `delay_for(retries) = initial × 2^min(retries, max_exponent)`, computed
/// from the retry count before the failing attempt is recorded, so the
/// first reschedule waits the full initial delay. With the defaults the
/// sequence is 5s, 10s, 20s, 40s, capping at 80s.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryBackoff {
    /// Delay before the first retry.
    pub initial: Duration,
    /// Exponent cap; keeps the delay bounded however high the ceiling goes.
    pub max_exponent: u32,
}

impl Default for RetryBackoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(5),
            max_exponent: 4,
        }
    }
}

impl RetryBackoff {
    pub fn new(initial: Duration, max_exponent: u32) -> Self {
        Self {
            initial,
            max_exponent,
        }
    }

    /// Delay applied after the delivery attempt made at `retries` fails.
    pub fn delay_for(&self, retries: u32) -> Duration {
        let exponent = retries.min(self.max_exponent);
        self.initial * 2_u32.pow(exponent)
    }
}
