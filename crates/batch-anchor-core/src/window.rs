//! Boundary-aligned time windows.
//!
//! Windows partition wall-clock time into half-open intervals
//! `[k * len, (k + 1) * len)` measured from the Unix epoch. They are never
//! persisted; they only select which batches are due for a first attempt.

use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// A half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeWindow {
    /// The window of length `len` that contains `at`.
    pub fn containing(at: DateTime<Utc>, len: Duration) -> Result<Self, CoreError> {
        let len_ms = window_millis(len)?;
        let start_ms = at.timestamp_millis().div_euclid(len_ms) * len_ms;
        Ok(Self {
            start: from_millis(start_ms)?,
            end: from_millis(start_ms + len_ms)?,
        })
    }

    /// The most recent window that has fully elapsed at `at`.
    pub fn elapsed_before(at: DateTime<Utc>, len: Duration) -> Result<Self, CoreError> {
        let current = Self::containing(at, len)?;
        current.previous()
    }

    /// The window immediately before this one.
    pub fn previous(&self) -> Result<Self, CoreError> {
        let len_ms = self.length_millis();
        let start_ms = self.start.timestamp_millis() - len_ms;
        Ok(Self {
            start: from_millis(start_ms)?,
            end: self.start,
        })
    }

    /// Whether `t` falls inside `[start, end)`.
    pub fn contains(&self, t: &DateTime<Utc>) -> bool {
        *t >= self.start && *t < self.end
    }

    /// The next boundary strictly after `at`.
    pub fn next_boundary(at: DateTime<Utc>, len: Duration) -> Result<DateTime<Utc>, CoreError> {
        Ok(Self::containing(at, len)?.end)
    }

    fn length_millis(&self) -> i64 {
        self.end.timestamp_millis() - self.start.timestamp_millis()
    }
}

fn window_millis(len: Duration) -> Result<i64, CoreError> {
    let ms = i64::try_from(len.as_millis()).map_err(|_| CoreError::InvalidWindow(len))?;
    if ms <= 0 {
        return Err(CoreError::InvalidWindow(len));
    }
    Ok(ms)
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>, CoreError> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or(CoreError::TimestampOutOfRange(ms))
}
