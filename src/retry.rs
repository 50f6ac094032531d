//! Bounded retry and completion-wait policies for submit/query loops.
//!
//! Every backend submission site uses the same two bounds: a busy-retry
//! loop with a fixed sleep quantum and attempt ceiling, and a wall-clock
//! bound on completion waits. Keeping the constants here means a stuck
//! component surfaces as [`Error::Stall`] or [`Error::SyncTimeout`] within
//! a predictable window instead of hanging the submission thread.

use crate::error::{Error, Result};
use std::time::{Duration, Instant};

/// Outcome of an asynchronous submit or output query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitStatus {
    /// The operation was accepted; output (if any) is available.
    Accepted,
    /// The component's input queue is full; retry after one quantum.
    Busy,
    /// The component needs more input before producing output.
    NeedMoreInput,
}

/// Busy-retry policy: sleep one quantum per `Busy`, give up at the ceiling.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Sleep per busy iteration.
    pub quantum: Duration,
    /// Maximum number of attempts before declaring a stall.
    pub ceiling: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            quantum: Duration::from_millis(1),
            ceiling: 100,
        }
    }
}

impl RetryPolicy {
    /// Drive `op` until it stops reporting [`SubmitStatus::Busy`].
    ///
    /// Returns the first non-busy status, or [`Error::Stall`] after the
    /// ceiling. The sleep happens before each retry, not after the final
    /// attempt.
    pub fn run<F>(&self, mut op: F) -> Result<SubmitStatus>
    where
        F: FnMut() -> Result<SubmitStatus>,
    {
        let mut retries = 0u32;
        loop {
            match op()? {
                SubmitStatus::Busy => {
                    retries += 1;
                    if retries >= self.ceiling {
                        crate::observability::record_stall();
                        return Err(Error::Stall { retries });
                    }
                    crate::observability::record_busy_retry();
                    std::thread::sleep(self.quantum);
                }
                status => return Ok(status),
            }
        }
    }
}

/// Bounded completion wait for device synchronization.
#[derive(Debug, Clone, Copy)]
pub struct SyncPolicy {
    /// Poll interval while the completion token is unsignaled.
    pub quantum: Duration,
    /// Wall-clock deadline.
    pub timeout: Duration,
}

impl Default for SyncPolicy {
    fn default() -> Self {
        Self {
            quantum: Duration::from_millis(1),
            timeout: Duration::from_secs(1),
        }
    }
}

impl SyncPolicy {
    /// Poll `done` until it reports true or the deadline passes.
    pub fn wait<F>(&self, mut done: F) -> Result<()>
    where
        F: FnMut() -> Result<bool>,
    {
        let start = Instant::now();
        loop {
            if done()? {
                return Ok(());
            }
            if start.elapsed() >= self.timeout {
                return Err(Error::SyncTimeout(self.timeout));
            }
            std::thread::sleep(self.quantum);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepted_passes_through() {
        let policy = RetryPolicy::default();
        let status = policy.run(|| Ok(SubmitStatus::Accepted)).unwrap();
        assert_eq!(status, SubmitStatus::Accepted);
    }

    #[test]
    fn busy_then_accepted() {
        let policy = RetryPolicy {
            quantum: Duration::from_micros(10),
            ceiling: 100,
        };
        let mut calls = 0;
        let status = policy
            .run(|| {
                calls += 1;
                if calls < 5 {
                    Ok(SubmitStatus::Busy)
                } else {
                    Ok(SubmitStatus::Accepted)
                }
            })
            .unwrap();
        assert_eq!(status, SubmitStatus::Accepted);
        assert_eq!(calls, 5);
    }

    #[test]
    fn always_busy_stalls_at_ceiling() {
        let policy = RetryPolicy {
            quantum: Duration::from_micros(10),
            ceiling: 100,
        };
        let mut calls = 0u32;
        let err = policy
            .run(|| {
                calls += 1;
                Ok(SubmitStatus::Busy)
            })
            .unwrap_err();
        assert!(matches!(err, Error::Stall { retries: 100 }));
        assert_eq!(calls, 100);
    }

    #[test]
    fn error_aborts_immediately() {
        let policy = RetryPolicy::default();
        let mut calls = 0;
        let err = policy
            .run(|| {
                calls += 1;
                Err(Error::DeviceLost("gone".into()))
            })
            .unwrap_err();
        assert!(matches!(err, Error::DeviceLost(_)));
        assert_eq!(calls, 1);
    }

    #[test]
    fn sync_completes() {
        let policy = SyncPolicy {
            quantum: Duration::from_micros(10),
            timeout: Duration::from_millis(100),
        };
        let mut polls = 0;
        policy
            .wait(|| {
                polls += 1;
                Ok(polls >= 3)
            })
            .unwrap();
        assert_eq!(polls, 3);
    }

    #[test]
    fn sync_times_out() {
        let policy = SyncPolicy {
            quantum: Duration::from_micros(10),
            timeout: Duration::from_millis(5),
        };
        let err = policy.wait(|| Ok(false)).unwrap_err();
        assert!(matches!(err, Error::SyncTimeout(_)));
    }
}
