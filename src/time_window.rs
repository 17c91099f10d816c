//! Quiet-hours arithmetic.
//!
//! Pure functions over a tenant's IANA timezone and an `HH:MM` start/end pair.
//! Malformed or missing configuration degrades to "no quiet hours".

use std::sync::LazyLock;

use chrono::{DateTime, Duration, NaiveDate, NaiveTime, TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use regex::Regex;

const MINUTES_PER_DAY: u32 = 24 * 60;

static HHMM: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([01]?\d|2[0-3]):([0-5]\d)$").expect("valid HH:MM regex"));

/// Parse `HH:MM` into minute-of-day. Returns `None` for anything malformed.
pub fn parse_hhmm(value: &str) -> Option<u32> {
    let caps = HHMM.captures(value.trim())?;
    let hours: u32 = caps.get(1)?.as_str().parse().ok()?;
    let minutes: u32 = caps.get(2)?.as_str().parse().ok()?;
    Some(hours * 60 + minutes)
}

/// Resolve an IANA timezone name. Unknown names fall back to UTC.
pub fn resolve_timezone(name: &str) -> Tz {
    name.trim().parse::<Tz>().unwrap_or_else(|_| {
        tracing::debug!(timezone = name, "Unknown timezone, using UTC wall clock");
        Tz::UTC
    })
}

/// Whether `minute` (0..1440) falls inside the quiet window `[start, end)`,
/// wrapping past midnight when `start > end`. `start == end` disables it.
fn minute_in_window(minute: u32, start: u32, end: u32) -> bool {
    if start == end {
        false
    } else if start < end {
        minute >= start && minute < end
    } else {
        minute >= start || minute < end
    }
}

fn local_minute_of_day(now: DateTime<Utc>, tz: Tz) -> u32 {
    let local = now.with_timezone(&tz);
    local.hour() * 60 + local.minute()
}

/// Is `now` inside the quiet window for the given timezone?
pub fn is_within_quiet_hours(now: DateTime<Utc>, timezone: &str, start: &str, end: &str) -> bool {
    let (Some(start), Some(end)) = (parse_hhmm(start), parse_hhmm(end)) else {
        return false;
    };
    let tz = resolve_timezone(timezone);
    minute_in_window(local_minute_of_day(now, tz), start, end)
}

/// The earliest instant at or after `now` when sending is allowed.
///
/// Outside quiet hours this is `now`. Inside, it is the next local occurrence
/// of `end`, with the UTC offset derived for that day rather than `now`'s.
pub fn next_allowed_send_time(
    now: DateTime<Utc>,
    timezone: &str,
    start: &str,
    end: &str,
) -> DateTime<Utc> {
    if !is_within_quiet_hours(now, timezone, start, end) {
        return now;
    }
    // Both parse, otherwise we'd have returned above.
    let Some(end_minute) = parse_hhmm(end) else {
        return now;
    };

    let tz = resolve_timezone(timezone);
    let local = now.with_timezone(&tz);
    let today = local.date_naive();
    let day = if local_minute_of_day(now, tz) < end_minute {
        today
    } else {
        today.succ_opt().unwrap_or(today)
    };

    local_instant(tz, day, end_minute).unwrap_or(now)
}

/// Convert a local wall-clock minute on `day` into an absolute instant.
///
/// Ambiguous times (DST fall-back) take the earlier instant; times inside a
/// spring-forward gap are pushed forward until they exist.
fn local_instant(tz: Tz, day: NaiveDate, minute_of_day: u32) -> Option<DateTime<Utc>> {
    let minute_of_day = minute_of_day % MINUTES_PER_DAY;
    let time = NaiveTime::from_hms_opt(minute_of_day / 60, minute_of_day % 60, 0)?;
    let mut naive = day.and_time(time);

    for _ in 0..4 {
        if let Some(dt) = tz.from_local_datetime(&naive).earliest() {
            return Some(dt.with_timezone(&Utc));
        }
        naive += Duration::minutes(30);
    }
    None
}
