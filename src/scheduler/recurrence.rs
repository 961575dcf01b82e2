//! Weekday recurrence.
//!
//! Days of the week are numbered 0 (Sunday) through 6 (Saturday). Day steps
//! are taken on the local calendar of the instant's timezone, so a run at
//! 09:00 stays at 09:00 across daylight-saving changes.

use chrono::{DateTime, Datelike, Days, Duration, LocalResult, NaiveDateTime, TimeZone};

/// Earliest instant `>= from` whose weekday is in `days_of_week` and which
/// does not exceed `until`.
///
/// If `from` itself falls on a listed weekday it is returned unchanged.
/// Returns `None` when `days_of_week` is empty or holds a value above 6, or
/// when the next qualifying day lies after `until`.
pub fn next_occurrence<Tz: TimeZone>(
    from: &DateTime<Tz>,
    until: &DateTime<Tz>,
    days_of_week: &[u8],
) -> Option<DateTime<Tz>> {
    if days_of_week.is_empty() || days_of_week.iter().any(|d| *d > 6) {
        return None;
    }
    if from > until {
        return None;
    }
    if qualifies(from, days_of_week) {
        return Some(from.clone());
    }
    for offset in 1..=7 {
        let candidate = add_days(from, offset)?;
        if &candidate > until {
            return None;
        }
        if qualifies(&candidate, days_of_week) {
            return Some(candidate);
        }
    }
    None
}

/// Shift `dt` by whole calendar days in its own timezone, keeping the local
/// time of day. A local time that falls into a DST gap moves forward by the
/// size of the gap (one hour).
pub fn add_days<Tz: TimeZone>(dt: &DateTime<Tz>, days: u64) -> Option<DateTime<Tz>> {
    let local = dt.naive_local().checked_add_days(Days::new(days))?;
    resolve_local(&dt.timezone(), local)
}

fn resolve_local<Tz: TimeZone>(tz: &Tz, local: NaiveDateTime) -> Option<DateTime<Tz>> {
    match tz.from_local_datetime(&local) {
        LocalResult::Single(dt) => Some(dt),
        LocalResult::Ambiguous(earliest, _) => Some(earliest),
        LocalResult::None => tz.from_local_datetime(&(local + Duration::hours(1))).earliest(),
    }
}

fn qualifies<Tz: TimeZone>(dt: &DateTime<Tz>, days_of_week: &[u8]) -> bool {
    let weekday = dt.weekday().num_days_from_sunday() as u8;
    days_of_week.contains(&weekday)
}
