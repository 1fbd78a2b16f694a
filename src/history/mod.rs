//! Rolling player count history, one bounded buffer per target.
//!
//! Each buffer holds hourly buckets. A bucket keeps the latest count seen
//! during its hour, so the buffer's time span stays bounded no matter how
//! often targets are polled.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, PoisonError};

use crate::probe::OnlineStatus;

/// Default number of buckets kept per target.
pub const DEFAULT_CAPACITY: usize = 24;

/// Span of a single bucket.
pub fn bucket_duration() -> ChronoDuration {
    ChronoDuration::hours(1)
}

/// Latest player count observed within one hour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistoryBucket {
    pub bucket_start: DateTime<Utc>,
    pub value: u32,
}

/// Owner of every target's history buffer.
#[derive(Debug, Default)]
pub struct HistoryTracker {
    buffers: Mutex<HashMap<String, VecDeque<HistoryBucket>>>,
}

impl HistoryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an online sample observed at `now`.
    ///
    /// Opens a new bucket when the buffer is empty or the current bucket is at
    /// least an hour old, otherwise overwrites the current bucket's value.
    /// The oldest buckets are evicted once the buffer exceeds `capacity`.
    pub fn record(&self, target_id: &str, status: &OnlineStatus, capacity: usize, now: DateTime<Utc>) {
        let capacity = capacity.max(1);
        let mut buffers = self.buffers.lock().unwrap_or_else(PoisonError::into_inner);
        let buffer = buffers.entry(target_id.to_string()).or_default();

        match buffer.back_mut() {
            Some(current) if now - current.bucket_start < bucket_duration() => {
                current.value = status.players;
            }
            _ => {
                buffer.push_back(HistoryBucket {
                    bucket_start: now,
                    value: status.players,
                });
            }
        }

        while buffer.len() > capacity {
            buffer.pop_front();
        }
    }

    /// Copy of a target's buckets, oldest first.
    pub fn snapshot(&self, target_id: &str) -> Vec<HistoryBucket> {
        let buffers = self.buffers.lock().unwrap_or_else(PoisonError::into_inner);
        buffers
            .get(target_id)
            .map(|b| b.iter().copied().collect())
            .unwrap_or_default()
    }
}
