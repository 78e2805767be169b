/*!
 # Recurring daily on-window

 Pure time-of-day arithmetic for the window during which the host is
 allowed to stay powered. A window whose start and end are equal means
 "no window": the host is permitted to run at all times.
*/

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Local, NaiveTime, Timelike};

const DAY_SECS: i64 = 24 * 60 * 60;

/// A recurring window between two times of day. If `start` is after
/// `end` the window crosses midnight. Dates are irrelevant; every query
/// is answered from the time-of-day component of the supplied `now`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecurringWindow {
    start: NaiveTime,
    end: NaiveTime,
    crosses_midnight: bool,
}

impl RecurringWindow {
    pub fn new(start: NaiveTime, end: NaiveTime) -> Self {
        Self {
            start,
            end,
            crosses_midnight: end < start,
        }
    }

    /// The "no window" sentinel: active at every time of day.
    pub fn always_active() -> Self {
        let midnight = NaiveTime::from_hms_opt(0, 0, 0).unwrap();
        Self::new(midnight, midnight)
    }

    /// False for the always-active sentinel (`start == end`).
    pub fn has_window(&self) -> bool {
        self.start != self.end
    }

    pub fn start(&self) -> NaiveTime {
        self.start
    }

    pub fn end(&self) -> NaiveTime {
        self.end
    }

    /// True if the window is active at `now`.
    pub fn is_active(&self, now: NaiveTime) -> bool {
        self.until_start(now) == Duration::ZERO
    }

    /// Duration until the window next starts. Zero while the window is
    /// active (or when there is no window at all).
    pub fn until_start(&self, now: NaiveTime) -> Duration {
        if !self.has_window() {
            return Duration::ZERO;
        }

        let (start, end, now) = self.normalised(now);
        if now < start {
            // Before window start.
            return secs(start - now);
        }
        if now <= end {
            // During window.
            return Duration::ZERO;
        }
        // After window: wait for tomorrow's start.
        secs(start + DAY_SECS - now)
    }

    /// Duration until the window next ends.
    pub fn until_end(&self, now: NaiveTime) -> Duration {
        if !self.has_window() {
            return Duration::ZERO;
        }

        let (_, end, now) = self.normalised(now);
        if now <= end {
            secs(end - now)
        } else {
            secs(end + DAY_SECS - now)
        }
    }

    /// Absolute timestamp of the next window start.
    pub fn next_start(&self, now: DateTime<Local>) -> DateTime<Local> {
        now + self.until_start(now.time())
    }

    /// Absolute timestamp of the next window end.
    pub fn next_end(&self, now: DateTime<Local>) -> DateTime<Local> {
        now + self.until_end(now.time())
    }

    /// Maps start, end and now onto a single seconds-since-midnight axis.
    /// For a midnight-crossing window the end lands on the next day, and
    /// so does a `now` that falls in the early-morning part of the window.
    fn normalised(&self, now: NaiveTime) -> (i64, i64, i64) {
        let start = self.start.num_seconds_from_midnight() as i64;
        let mut end = self.end.num_seconds_from_midnight() as i64;
        let mut now = now.num_seconds_from_midnight() as i64;
        if self.crosses_midnight {
            end += DAY_SECS;
            if now < start {
                now += DAY_SECS;
            }
        }
        (start, end, now)
    }
}

impl fmt::Display for RecurringWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.has_window() {
            write!(f, "always on")
        } else {
            write!(
                f,
                "{} to {}",
                self.start.format("%H:%M"),
                self.end.format("%H:%M")
            )
        }
    }
}

fn secs(s: i64) -> Duration {
    Duration::from_secs(s.max(0) as u64)
}
