//! Busy-wait loops with an injectable exit condition.
//!
//! The ring-buffer fast path never blocks in the kernel: waiting for free space or
//! for new data is an active poll of memory. A [`SpinPolicy`] bounds such a poll
//! with an optional deadline so callers (and tests) can turn an indefinite wait
//! into a [`TransportError::SpinTimeout`].

use std::time::{Duration, Instant};

use crate::error::{Result, TransportError};

/// Polls between two reads of the clock.
const CLOCK_CHECK_INTERVAL: u64 = 256;

/// How long a busy-wait may run before giving up.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SpinPolicy {
    timeout: Option<Duration>,
}

impl SpinPolicy {
    /// Spin until the condition holds, however long that takes.
    pub fn unbounded() -> Self {
        Self { timeout: None }
    }

    /// Spin for at most `timeout`.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
        }
    }

    /// Builds a policy from an optional millisecond budget, as found in config files.
    pub fn from_millis(timeout_ms: Option<u64>) -> Self {
        Self {
            timeout: timeout_ms.map(Duration::from_millis),
        }
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Starts a wait for `what`; call [`Spinner::tick`] after every unsuccessful poll.
    pub fn spinner(&self, what: &'static str) -> Spinner {
        Spinner {
            what,
            started: Instant::now(),
            timeout: self.timeout,
            spins: 0,
        }
    }

    /// Busy-polls `ready` until it returns `Ok(true)`.
    ///
    /// Errors from the predicate end the wait immediately. Returns the number of
    /// unsuccessful polls.
    pub fn spin_until<F>(&self, what: &'static str, mut ready: F) -> Result<u64>
    where
        F: FnMut() -> Result<bool>,
    {
        let mut spinner = self.spinner(what);
        while !ready()? {
            spinner.tick()?;
            std::hint::spin_loop();
        }
        Ok(spinner.spins())
    }
}

/// State of one busy-wait.
#[derive(Debug)]
pub struct Spinner {
    what: &'static str,
    started: Instant,
    timeout: Option<Duration>,
    spins: u64,
}

impl Spinner {
    /// Records one unsuccessful poll and fails once the deadline has passed.
    pub fn tick(&mut self) -> Result<()> {
        self.spins += 1;
        if let Some(timeout) = self.timeout {
            if self.spins % CLOCK_CHECK_INTERVAL == 0 && self.started.elapsed() >= timeout {
                return Err(TransportError::SpinTimeout {
                    what: self.what,
                    timeout_ms: timeout.as_millis() as u64,
                });
            }
        }
        Ok(())
    }

    /// Number of unsuccessful polls so far.
    pub fn spins(&self) -> u64 {
        self.spins
    }
}
