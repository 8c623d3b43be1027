use chrono::{Duration, NaiveDate, NaiveDateTime, NaiveTime, Timelike};
use thiserror::Error;

use crate::limits::*;

/// Why a candidate start time was refused by the grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum GridRejection {
    #[error("{0} is before the start of the current day")]
    PastDate(NaiveDateTime),
    #[error("{0} is outside business hours")]
    OutsideBusinessHours(NaiveDateTime),
    #[error("{0} is not on the 30-minute grid")]
    OffGrid(NaiveDateTime),
}

/// Fixed business-hour window with a single slot granularity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeGridPolicy {
    open: NaiveTime,
    last_slot_start: NaiveTime,
    slot_minutes: u32,
}

impl Default for TimeGridPolicy {
    fn default() -> Self {
        Self::new()
    }
}

fn hm(t: (u32, u32)) -> NaiveTime {
    // Constants in `limits` are valid wall-clock times.
    NaiveTime::from_hms_opt(t.0, t.1, 0).unwrap_or_default()
}

impl TimeGridPolicy {
    pub fn new() -> Self {
        Self {
            open: hm(OPEN_TIME),
            last_slot_start: hm(LAST_SLOT_START),
            slot_minutes: SLOT_MINUTES,
        }
    }

    /// Check `t` against the grid as seen at wall-clock `now`.
    ///
    /// Rules run in order and the first failure wins:
    /// 1. not before 00:00 of `now`'s day
    /// 2. time of day within `[open, last_slot_start]`
    /// 3. whole grid minute, zero seconds
    pub fn validate(&self, t: NaiveDateTime, now: NaiveDateTime) -> Result<(), GridRejection> {
        if t.date() < now.date() {
            return Err(GridRejection::PastDate(t));
        }
        let time = t.time();
        if time < self.open || time > self.last_slot_start {
            return Err(GridRejection::OutsideBusinessHours(t));
        }
        if time.second() != 0 || time.nanosecond() != 0 {
            return Err(GridRejection::OffGrid(t));
        }
        let since_open = minute_of_day(time) - minute_of_day(self.open);
        if since_open % self.slot_minutes != 0 {
            return Err(GridRejection::OffGrid(t));
        }
        Ok(())
    }

    /// Every grid start of `date`, in order.
    pub fn slots_for(&self, date: NaiveDate) -> Vec<NaiveDateTime> {
        let step = Duration::minutes(i64::from(self.slot_minutes));
        let last = date.and_time(self.last_slot_start);
        let mut slots = Vec::new();
        let mut cur = date.and_time(self.open);
        while cur <= last {
            slots.push(cur);
            cur += step;
        }
        slots
    }
}

fn minute_of_day(t: NaiveTime) -> u32 {
    t.hour() * 60 + t.minute()
}

/// Source of business-local wall-clock time.
pub trait Clock: Send + Sync {
    fn now(&self) -> NaiveDateTime;
}

/// Reads the host's local time.
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> NaiveDateTime {
        chrono::Local::now().naive_local()
    }
}

/// Always returns the same instant.
pub struct FixedClock(pub NaiveDateTime);

impl Clock for FixedClock {
    fn now(&self) -> NaiveDateTime {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dt(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, mo, d)
            .unwrap()
            .and_hms_opt(h, mi, 0)
            .unwrap()
    }

    fn now() -> NaiveDateTime {
        dt(2025, 6, 1, 15, 47)
    }

    #[test]
    fn accepts_every_grid_slot_in_hours() {
        let policy = TimeGridPolicy::new();
        for h in 10..=17 {
            for m in [0, 30] {
                assert_eq!(policy.validate(dt(2025, 6, 2, h, m), now()), Ok(()), "{h}:{m}");
            }
        }
    }

    #[test]
    fn rejects_off_grid_minutes_in_hours() {
        let policy = TimeGridPolicy::new();
        for h in 10..=16 {
            for m in (0..60).filter(|m| *m != 0 && *m != 30) {
                let t = dt(2025, 6, 2, h, m);
                assert_eq!(policy.validate(t, now()), Err(GridRejection::OffGrid(t)));
            }
        }
    }

    #[test]
    fn rejects_outside_business_hours() {
        let policy = TimeGridPolicy::new();
        for (h, m) in [(0, 0), (9, 0), (9, 30), (9, 59), (17, 31), (18, 0), (18, 30), (23, 30)] {
            let t = dt(2025, 6, 2, h, m);
            assert_eq!(
                policy.validate(t, now()),
                Err(GridRejection::OutsideBusinessHours(t)),
                "{h}:{m}"
            );
        }
    }

    #[test]
    fn seconds_are_off_grid() {
        let policy = TimeGridPolicy::new();
        let t = dt(2025, 6, 2, 10, 0) + Duration::seconds(1);
        assert_eq!(policy.validate(t, now()), Err(GridRejection::OffGrid(t)));
        let t = dt(2025, 6, 2, 10, 30) + Duration::milliseconds(5);
        assert_eq!(policy.validate(t, now()), Err(GridRejection::OffGrid(t)));
    }

    #[test]
    fn last_slot_with_seconds_is_outside_hours() {
        let policy = TimeGridPolicy::new();
        let t = dt(2025, 6, 2, 17, 30) + Duration::seconds(1);
        assert_eq!(policy.validate(t, now()), Err(GridRejection::OutsideBusinessHours(t)));
    }

    #[test]
    fn past_day_rejected_before_other_rules() {
        let policy = TimeGridPolicy::new();
        let t = dt(2025, 5, 31, 9, 15);
        assert_eq!(policy.validate(t, now()), Err(GridRejection::PastDate(t)));
    }

    #[test]
    fn earlier_today_is_allowed() {
        // Day granularity: a slot already passed today still validates.
        let policy = TimeGridPolicy::new();
        assert_eq!(policy.validate(dt(2025, 6, 1, 10, 0), now()), Ok(()));
    }

    #[test]
    fn slots_for_covers_the_day() {
        let policy = TimeGridPolicy::new();
        let date = NaiveDate::from_ymd_opt(2025, 6, 2).unwrap();
        let slots = policy.slots_for(date);
        assert_eq!(slots.len(), 16);
        assert_eq!(slots[0], dt(2025, 6, 2, 10, 0));
        assert_eq!(slots[15], dt(2025, 6, 2, 17, 30));
        for s in &slots {
            assert_eq!(policy.validate(*s, now()), Ok(()));
        }
    }

    #[test]
    fn last_slot_ends_at_close() {
        let step = Duration::minutes(i64::from(SLOT_MINUTES));
        assert_eq!(hm(LAST_SLOT_START) + step, hm(CLOSE_TIME));
    }

    #[test]
    fn fixed_clock_is_fixed() {
        let clock = FixedClock(now());
        assert_eq!(clock.now(), clock.now());
    }
}
