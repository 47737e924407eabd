//! The cooperative retry loop that turns poll-shaped operations into
//! blocking calls.
//!
//! The transport never sleeps on its own; a bridge thread wraps each
//! handshake or I/O method in a driver, which re-invokes the operation
//! every time slice until it completes or the budget runs out.

use std::cmp;
use std::thread;
use std::time::{Duration, Instant};

use {Error, Step};

/// Smallest permitted sleep between retries.
pub const MIN_TIME_SLICE: Duration = Duration::from_millis(1);

/// Polls an operation until it completes, sleeping a fixed slice between
/// retries, optionally bounded by a total budget.
#[derive(Debug, Copy, Clone)]
pub struct Driver {
    time_slice: Duration,
    timeout: Option<Duration>,
}

impl Driver {
    /// A driver sleeping `time_slice` between retries, floored at 1 ms.
    pub fn new(time_slice: Duration) -> Self {
        Driver {
            time_slice: cmp::max(time_slice, MIN_TIME_SLICE),
            timeout: None,
        }
    }

    /// Bounds the total time spent polling; exceeding it fails
    /// `TimedOut`.
    pub fn with_timeout(self, timeout: Duration) -> Self {
        Driver {
            timeout: Some(timeout),
            ..self
        }
    }

    /// Repeatedly invokes `step` until it yields `Done` or fails.
    ///
    /// The first invocation happens immediately; the timeout is only
    /// consulted between retries, so an operation that completes on its
    /// first step never times out.
    pub fn run<T, F>(&self, mut step: F) -> Result<T, Error>
    where
        F: FnMut() -> Result<Step<T>, Error>,
    {
        let start = Instant::now();
        loop {
            match step()? {
                Step::Done(value) => return Ok(value),
                Step::Again => {}
            }
            if let Some(timeout) = self.timeout {
                if start.elapsed() > timeout {
                    return Err(Error::TimedOut);
                }
            }
            thread::sleep(self.time_slice);
        }
    }
}
