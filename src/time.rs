use chrono::{DateTime, Duration, Offset, TimeZone, Utc};
use chrono_tz::Tz;

pub const LOCAL_TIMESTAMP_FORMAT: &str = "%m/%d/%Y %I:%M:%S %p";
pub const LOCAL_SCHEDULE_FORMAT: &str = "%m/%d/%Y %I:%M %p";

/// First wall-clock boundary in `tz` strictly after `now`, for boundaries every
/// `interval_minutes` past the hour.
///
/// The offset in effect at `now` is used. Real-world offsets and DST shifts are whole
/// multiples of 15 minutes, so quarter-hour boundaries stay aligned across transitions.
pub fn next_boundary<T: TimeZone>(
    now: DateTime<Utc>,
    tz: &T,
    interval_minutes: u32,
) -> DateTime<Utc> {
    let interval = i64::from(interval_minutes.clamp(1, 60));
    let step_seconds = interval * 60;
    let offset_seconds = i64::from(now.with_timezone(tz).offset().fix().local_minus_utc());
    let local_seconds = now.timestamp() + offset_seconds;
    let next_local = (local_seconds.div_euclid(step_seconds) + 1) * step_seconds;
    DateTime::from_timestamp(next_local - offset_seconds, 0)
        .unwrap_or_else(|| now + Duration::minutes(interval))
}

pub fn format_local(ts: DateTime<Utc>, tz: &Tz) -> String {
    ts.with_timezone(tz).format(LOCAL_TIMESTAMP_FORMAT).to_string()
}

pub fn format_local_schedule(ts: DateTime<Utc>, tz: &Tz) -> String {
    ts.with_timezone(tz).format(LOCAL_SCHEDULE_FORMAT).to_string()
}

pub fn parse_timezone(value: &str) -> Result<Tz, String> {
    value
        .trim()
        .parse::<Tz>()
        .map_err(|err| format!("unknown timezone {value:?}: {err}"))
}

/// The host's IANA timezone, or UTC when it cannot be determined.
pub fn host_timezone() -> Tz {
    match iana_time_zone::get_timezone() {
        Ok(name) => parse_timezone(&name).unwrap_or_else(|err| {
            tracing::warn!("host timezone not recognised; rendering in UTC: {err}");
            Tz::UTC
        }),
        Err(err) => {
            tracing::warn!("failed to detect host timezone; rendering in UTC: {err}");
            Tz::UTC
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    #[test]
    fn next_quarter_is_strictly_after_now() {
        assert_eq!(
            next_boundary(utc(2025, 1, 1, 10, 7, 30), &Utc, 15),
            utc(2025, 1, 1, 10, 15, 0)
        );
        assert_eq!(
            next_boundary(utc(2025, 1, 1, 10, 15, 0), &Utc, 15),
            utc(2025, 1, 1, 10, 30, 0)
        );
        assert_eq!(
            next_boundary(utc(2025, 1, 1, 10, 14, 59), &Utc, 15),
            utc(2025, 1, 1, 10, 15, 0)
        );
    }

    #[test]
    fn last_quarter_rolls_into_next_day() {
        assert_eq!(
            next_boundary(utc(2025, 12, 31, 23, 50, 0), &Utc, 15),
            utc(2026, 1, 1, 0, 0, 0)
        );
    }

    #[test]
    fn boundaries_follow_the_reference_timezone() {
        // Kathmandu is UTC+05:45: the top of the local hour falls at :15 UTC.
        let tz = parse_timezone("Asia/Kathmandu").unwrap();
        assert_eq!(
            next_boundary(utc(2025, 5, 1, 3, 20, 0), &tz, 60),
            utc(2025, 5, 1, 4, 15, 0)
        );
        assert_eq!(
            next_boundary(utc(2025, 5, 1, 3, 20, 0), &tz, 15),
            utc(2025, 5, 1, 3, 30, 0)
        );
    }

    #[test]
    fn quarter_boundaries_hold_across_dst_start() {
        let tz = parse_timezone("America/New_York").unwrap();
        // 2025-03-09 01:50 EST; clocks jump from 02:00 EST to 03:00 EDT (07:00 UTC).
        let now = utc(2025, 3, 9, 6, 50, 0);
        assert_eq!(next_boundary(now, &tz, 15), utc(2025, 3, 9, 7, 0, 0));
    }

    #[test]
    fn local_rendering_uses_twelve_hour_clock() {
        let tz = parse_timezone("America/Chicago").unwrap();
        assert_eq!(
            format_local(utc(2025, 7, 4, 18, 5, 9), &tz),
            "07/04/2025 01:05:09 PM"
        );
        assert_eq!(
            format_local_schedule(utc(2025, 7, 4, 18, 15, 0), &tz),
            "07/04/2025 01:15 PM"
        );
    }

    #[test]
    fn rejects_unknown_timezone() {
        assert!(parse_timezone("Mars/Olympus").is_err());
    }
}
