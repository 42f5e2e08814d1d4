//! Per-origin ceiling on callers waiting for a snap to start.

use std::collections::HashMap;

use thiserror::Error;

/// Misuse or exhaustion of a [`RequestQueue`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RequestQueueError {
    /// The origin already has the maximum number of queued requests.
    #[error("maximum number of requests reached for origin '{origin}'")]
    Exhausted {
        /// The saturated origin.
        origin: String,
    },
    /// The origin has no queued requests to release.
    #[error("no requests queued for origin '{origin}'")]
    Empty {
        /// The idle origin.
        origin: String,
    },
}

/// Counts queued requests per origin up to a fixed ceiling.
#[derive(Debug, Clone)]
pub struct RequestQueue {
    max_size: usize,
    counts: HashMap<String, usize>,
}

impl RequestQueue {
    /// Creates an empty queue allowing `max_size` requests per origin.
    #[must_use]
    pub fn new(max_size: usize) -> Self {
        Self {
            max_size,
            counts: HashMap::new(),
        }
    }

    /// Registers a queued request for `origin`.
    ///
    /// # Errors
    ///
    /// Returns [`RequestQueueError::Exhausted`] at the ceiling.
    pub fn increment(&mut self, origin: &str) -> Result<(), RequestQueueError> {
        let count = self.get(origin);
        if count >= self.max_size {
            return Err(RequestQueueError::Exhausted {
                origin: origin.to_owned(),
            });
        }
        self.counts.insert(origin.to_owned(), count + 1);
        Ok(())
    }

    /// Releases a queued request for `origin`.
    ///
    /// # Errors
    ///
    /// Returns [`RequestQueueError::Empty`] when nothing is queued.
    pub fn decrement(&mut self, origin: &str) -> Result<(), RequestQueueError> {
        match self.get(origin) {
            0 => Err(RequestQueueError::Empty {
                origin: origin.to_owned(),
            }),
            1 => {
                self.counts.remove(origin);
                Ok(())
            }
            count => {
                self.counts.insert(origin.to_owned(), count - 1);
                Ok(())
            }
        }
    }

    /// Number of requests queued for `origin`.
    #[must_use]
    pub fn get(&self, origin: &str) -> usize {
        self.counts.get(origin).copied().unwrap_or(0)
    }
}
