//! Deadline arithmetic for the recurring game cycles.
//!
//! Deadlines are always recomputed from a fixed anchor rather than advanced
//! by naive fixed-length sleeps, so jitter in any one sleep never
//! accumulates across iterations. The daily check time is a wall-clock UTC
//! hour/minute; perches repeat on an interval anchored to the previous
//! check time.

use chrono::{DateTime, Duration, Timelike, Utc};

/// How long before the daily check the starvation warnings go out.
pub const WARNING_OFFSET_HOURS: i64 = 4;

/// A recurring cycle definition: a fixed time of day, or a fixed interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleSpec {
    DailyAt { hour: u32, minute: u32 },
    EveryMinutes(u32),
}

impl CycleSpec {
    pub fn next_deadline(&self, anchor: DateTime<Utc>, now: DateTime<Utc>) -> DateTime<Utc> {
        match *self {
            CycleSpec::DailyAt { hour, minute } => next_daily(now, hour, minute),
            CycleSpec::EveryMinutes(minutes) => next_interval(anchor, now, minutes),
        }
    }
}

/// Today at `hour:minute` UTC if that is still ahead, otherwise tomorrow.
/// Idempotent: repeated calls with the same `now` yield the same deadline.
pub fn next_daily(now: DateTime<Utc>, hour: u32, minute: u32) -> DateTime<Utc> {
    let mut deadline = now
        .date_naive()
        .and_hms_opt(hour, minute, 0)
        .unwrap()
        .and_utc();
    if deadline <= now {
        deadline += Duration::days(1);
    }
    deadline
}

/// The first `anchor + k * interval` strictly after `now`.
pub fn next_interval(anchor: DateTime<Utc>, now: DateTime<Utc>, minutes: u32) -> DateTime<Utc> {
    let interval = Duration::minutes(minutes as i64);
    if anchor > now {
        return anchor;
    }
    let elapsed = (now - anchor).num_seconds();
    let steps = elapsed / interval.num_seconds() + 1;
    anchor + interval * (steps as i32)
}

/// The next top of the hour after `now` (hours-alive bookkeeping).
pub fn next_hour(now: DateTime<Utc>) -> DateTime<Utc> {
    let truncated = now
        .with_minute(0)
        .and_then(|t| t.with_second(0))
        .and_then(|t| t.with_nanosecond(0))
        .unwrap();
    truncated + Duration::hours(1)
}

/// The two deadlines the parrot cycle runs on: the daily starve check and
/// the perch interval. Perches are anchored one day before the check time,
/// so the check always lands exactly on a perch boundary (the interval is
/// constrained to divide or be a multiple of 60 minutes).
#[derive(Debug, Clone, Copy)]
pub struct CycleClock {
    pub check_at: DateTime<Utc>,
    pub perch_at: DateTime<Utc>,
}

impl CycleClock {
    pub fn new(hour: u32, minute: u32, interval_minutes: u32, now: DateTime<Utc>) -> Self {
        let mut clock = CycleClock {
            check_at: now,
            perch_at: now,
        };
        clock.refresh(hour, minute, interval_minutes, now);
        clock
    }

    /// Recompute both deadlines from the current settings. Called at
    /// startup, after every daily check, and when a setting changes.
    pub fn refresh(&mut self, hour: u32, minute: u32, interval_minutes: u32, now: DateTime<Utc>) {
        self.check_at = CycleSpec::DailyAt { hour, minute }.next_deadline(now, now);
        let anchor = self.check_at - Duration::days(1);
        self.perch_at = CycleSpec::EveryMinutes(interval_minutes).next_deadline(anchor, now);
    }

    /// Advance the perch deadline past `now`, staying on the anchor grid.
    pub fn advance_perch(&mut self, interval_minutes: u32, now: DateTime<Utc>) {
        self.perch_at = CycleSpec::EveryMinutes(interval_minutes).next_deadline(self.perch_at, now);
    }

    pub fn warn_at(&self) -> DateTime<Utc> {
        self.check_at - Duration::hours(WARNING_OFFSET_HOURS)
    }
}

/// Sleep until `deadline`, returning immediately if it has already passed.
pub async fn sleep_until(deadline: DateTime<Utc>) {
    let now = Utc::now();
    if deadline <= now {
        return;
    }
    let delay = (deadline - now)
        .to_std()
        .unwrap_or(std::time::Duration::ZERO);
    tokio::time::sleep(delay).await;
}
