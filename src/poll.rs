//! Bounded polling for asynchronous hypervisor state changes.

use std::io::Write;
use std::time::Duration;

use crate::error::Result;

/// Outcome of a bounded poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome<T> {
    /// The predicate produced a value before the attempts ran out.
    Ready(T),
    /// All attempts were used without the predicate producing a value.
    TimedOut,
}

impl<T> PollOutcome<T> {
    pub fn is_ready(&self) -> bool {
        matches!(self, PollOutcome::Ready(_))
    }

    pub fn into_ready(self) -> Option<T> {
        match self {
            PollOutcome::Ready(value) => Some(value),
            PollOutcome::TimedOut => None,
        }
    }
}

/// Wait-until-predicate with a fixed attempt count and a fixed
/// inter-attempt delay. Blocks the calling thread for the full delay on
/// every iteration; callers decide whether a timeout is fatal.
#[derive(Debug, Clone, Copy)]
pub struct Poll {
    pub attempts: u32,
    pub delay: Duration,
}

impl Poll {
    pub const fn new(attempts: u32, delay: Duration) -> Self {
        Self { attempts, delay }
    }

    /// Sleep, then check, up to `attempts` times. The predicate returns
    /// `Ok(Some(v))` to finish early, `Ok(None)` to keep waiting.
    pub fn run<T>(
        &self,
        mut check: impl FnMut(u32) -> Result<Option<T>>,
    ) -> Result<PollOutcome<T>> {
        for attempt in 0..self.attempts {
            std::thread::sleep(self.delay);
            if let Some(value) = check(attempt)? {
                return Ok(PollOutcome::Ready(value));
            }
        }
        Ok(PollOutcome::TimedOut)
    }
}

/// Rotating wait indicator written to stderr during long polls.
pub struct Spinner {
    active: bool,
}

const FRAMES: [char; 4] = ['|', '/', '-', '\\'];

impl Spinner {
    pub fn start(message: &str) -> Self {
        eprint!("{message} ...|");
        let _ = std::io::stderr().flush();
        Self { active: true }
    }

    pub fn tick(&mut self, attempt: u32) {
        eprint!("\x08{}", FRAMES[(attempt as usize + 1) % FRAMES.len()]);
        let _ = std::io::stderr().flush();
    }

    pub fn finish(mut self) {
        eprintln!("\x08done");
        self.active = false;
    }
}

impl Drop for Spinner {
    fn drop(&mut self) {
        if self.active {
            eprintln!();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FAST: Poll = Poll::new(5, Duration::ZERO);

    #[test]
    fn test_early_success_stops_polling() {
        let mut calls = 0;
        let outcome = FAST
            .run(|attempt| {
                calls += 1;
                Ok((attempt == 2).then_some(attempt))
            })
            .unwrap();
        assert_eq!(outcome, PollOutcome::Ready(2));
        assert_eq!(calls, 3);
    }

    #[test]
    fn test_budget_exhaustion_times_out() {
        let mut calls = 0;
        let outcome = FAST
            .run(|_| {
                calls += 1;
                Ok(None::<()>)
            })
            .unwrap();
        assert_eq!(outcome, PollOutcome::TimedOut);
        assert_eq!(calls, 5);
    }

    #[test]
    fn test_predicate_error_propagates() {
        let result: crate::Result<PollOutcome<()>> =
            FAST.run(|_| Err(crate::Error::Configuration("boom".into())));
        assert!(result.is_err());
    }
}
