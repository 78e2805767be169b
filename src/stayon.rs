/*!
 # Stay-on override

 A single process-wide deadline shared between the notification
 endpoint (which sets it) and the main control loop (which consults it
 before requesting a power-off).
*/

use chrono::{DateTime, Local, TimeDelta};
use parking_lot::Mutex;
use tracing::info;

use crate::{Error, Result};

/// Longest a stay-on request may push the shutdown out, in hours.
const MAX_STAY_ON_HOURS: i64 = 12;

/// The host is left running when the window opens within this many
/// minutes; a power cycle that short saves nothing.
const MIN_OFF_MINUTES: i64 = 15;

pub struct StayOnOverride {
    until: Mutex<DateTime<Local>>,
}

impl StayOnOverride {
    pub fn new(now: DateTime<Local>) -> Self {
        Self {
            until: Mutex::new(now),
        }
    }

    /// Delays power-off for `minutes` from `now`.
    pub fn stay_on_for(&self, minutes: i64, now: DateTime<Local>) -> Result<()> {
        self.set_until(now + TimeDelta::minutes(minutes), now)
    }

    /// Moves the deadline. A deadline more than 12 hours out is
    /// rejected and the previous one is left in place.
    pub fn set_until(&self, until: DateTime<Local>, now: DateTime<Local>) -> Result<()> {
        if until - now > TimeDelta::hours(MAX_STAY_ON_HOURS) {
            return Err(Error::StayOnTooLong(MAX_STAY_ON_HOURS as u64));
        }
        *self.until.lock() = until;
        info!("staying on until {until}");
        Ok(())
    }

    pub fn active(&self, now: DateTime<Local>) -> bool {
        now < *self.until.lock()
    }

    /// Whether the main loop should request a power-off: never while an
    /// override is active, and only when the window is far enough away
    /// to be worth it.
    pub fn should_power_off(&self, minutes_until_active: i64, now: DateTime<Local>) -> bool {
        !self.active(now) && minutes_until_active > MIN_OFF_MINUTES
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Local> {
        Local.with_ymd_and_hms(2024, 6, 3, 12, 0, 0).unwrap()
    }

    #[test]
    fn override_delays_power_off() {
        let t = now();
        let stay_on = StayOnOverride::new(t);
        assert!(!stay_on.active(t));

        stay_on.stay_on_for(30, t).unwrap();
        assert!(stay_on.active(t + TimeDelta::minutes(29)));
        assert!(!stay_on.active(t + TimeDelta::minutes(30)));
    }

    #[test]
    fn rejects_more_than_twelve_hours() {
        let t = now();
        let stay_on = StayOnOverride::new(t);
        stay_on.stay_on_for(60, t).unwrap();

        let err = stay_on.stay_on_for(12 * 60 + 1, t).unwrap_err();
        assert!(matches!(err, Error::StayOnTooLong(12)));
        // The prior deadline is untouched.
        assert!(stay_on.active(t + TimeDelta::minutes(59)));
        assert!(!stay_on.active(t + TimeDelta::minutes(61)));
    }

    #[test]
    fn twelve_hours_exactly_is_accepted() {
        let t = now();
        let stay_on = StayOnOverride::new(t);
        stay_on.stay_on_for(12 * 60, t).unwrap();
        assert!(stay_on.active(t + TimeDelta::hours(11)));
    }

    #[test]
    fn power_off_decision() {
        let t = now();
        let stay_on = StayOnOverride::new(t);

        // Far from the window and no override: turn off.
        assert!(stay_on.should_power_off(120, t));
        // Window opens soon: stay up.
        assert!(!stay_on.should_power_off(15, t));
        // Override active: stay up regardless.
        stay_on.stay_on_for(60, t).unwrap();
        assert!(!stay_on.should_power_off(120, t));
    }
}
