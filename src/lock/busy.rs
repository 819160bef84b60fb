use std::thread;
use std::time::{Duration, Instant};

use crate::common::{LodeError, Result};

/// First pause between attempts
const INITIAL_DELAY: Duration = Duration::from_millis(1);
/// Longest pause between attempts
const MAX_DELAY: Duration = Duration::from_millis(50);

/// Retries operations that fail with `Busy`, backing off exponentially until
/// the timeout is spent. A zero timeout means a single attempt.
#[derive(Debug, Clone, Copy)]
pub struct BusyHandler {
    timeout: Duration,
}

impl BusyHandler {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Runs `attempt` until it returns something other than `Busy` or the
    /// timeout expires.
    pub fn retry<T>(&self, mut attempt: impl FnMut() -> Result<T>) -> Result<T> {
        let deadline = Instant::now() + self.timeout;
        let mut delay = INITIAL_DELAY;
        loop {
            match attempt() {
                Err(LodeError::Busy) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(LodeError::Busy);
                    }
                    thread::sleep(delay.min(deadline - now));
                    delay = (delay * 2).min(MAX_DELAY);
                }
                other => return other,
            }
        }
    }
}
