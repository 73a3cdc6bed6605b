//! Timezone-aware cron evaluator (5-field: min hour dom month dow).

use chrono::{DateTime, Datelike, Timelike, Utc};

/// Parse an IANA timezone name, falling back to UTC.
pub fn parse_tz(tz: &str) -> chrono_tz::Tz {
    tz.parse::<chrono_tz::Tz>().unwrap_or(chrono_tz::UTC)
}

/// Parse a cron field and check if a value matches.
fn cron_field_matches(field: &str, value: u32) -> bool {
    if field == "*" {
        return true;
    }
    // */N (every N)
    if let Some(step) = field.strip_prefix("*/") {
        if let Ok(n) = step.parse::<u32>() {
            return n > 0 && value % n == 0;
        }
    }
    // Comma-separated values, each either N or N-M.
    for part in field.split(',') {
        if let Some((start_s, end_s)) = part.split_once('-') {
            if let (Ok(start), Ok(end)) = (start_s.parse::<u32>(), end_s.parse::<u32>()) {
                if value >= start && value <= end {
                    return true;
                }
            }
        } else if let Ok(n) = part.parse::<u32>() {
            if value == n {
                return true;
            }
        }
    }
    false
}

/// Check if a **local** naive datetime matches a 5-field cron expression.
fn cron_matches_naive(cron: &str, dt: &chrono::NaiveDateTime) -> bool {
    let fields: Vec<&str> = cron.split_whitespace().collect();
    if fields.len() != 5 {
        return false;
    }
    cron_field_matches(fields[0], dt.minute())
        && cron_field_matches(fields[1], dt.hour())
        && cron_field_matches(fields[2], dt.day())
        && cron_field_matches(fields[3], dt.month())
        && cron_field_matches(fields[4], dt.weekday().num_days_from_sunday())
}

/// Next occurrence strictly after `after`, evaluated in `tz`, as UTC.
///
/// DST handling: local times inside a spring-forward gap are skipped;
/// fall-back overlaps take the earliest (pre-transition) mapping.
pub fn cron_next_tz(cron: &str, after: &DateTime<Utc>, tz: chrono_tz::Tz) -> Option<DateTime<Utc>> {
    use chrono::TimeZone;

    let local_after = after.with_timezone(&tz).naive_local();
    let to_next_minute = 60 - i64::from(local_after.second());
    let mut candidate = local_after + chrono::Duration::seconds(to_next_minute);
    candidate = candidate.with_second(0).unwrap_or(candidate);

    let max_checks = 366 * 24 * 60; // one year of minutes
    for _ in 0..max_checks {
        if cron_matches_naive(cron, &candidate) {
            match tz.from_local_datetime(&candidate) {
                chrono::LocalResult::Single(dt) => return Some(dt.with_timezone(&Utc)),
                chrono::LocalResult::Ambiguous(earliest, _) => {
                    return Some(earliest.with_timezone(&Utc));
                }
                chrono::LocalResult::None => {
                    // DST gap — this local minute doesn't exist.
                }
            }
        }
        candidate += chrono::Duration::minutes(1);
    }
    None
}

/// Basic syntactic validation for schedule creation.
pub fn cron_is_valid(cron: &str) -> bool {
    let fields: Vec<&str> = cron.split_whitespace().collect();
    if fields.len() != 5 {
        return false;
    }
    fields.iter().all(|f| {
        *f == "*"
            || f.strip_prefix("*/")
                .map(|s| s.parse::<u32>().map(|n| n > 0).unwrap_or(false))
                .unwrap_or_else(|| {
                    f.split(',').all(|part| {
                        if let Some((a, b)) = part.split_once('-') {
                            a.parse::<u32>().is_ok() && b.parse::<u32>().is_ok()
                        } else {
                            part.parse::<u32>().is_ok()
                        }
                    })
                })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn every_5_minutes() {
        let dt = Utc.with_ymd_and_hms(2024, 6, 15, 10, 0, 0).unwrap();
        assert!(cron_matches_naive("*/5 * * * *", &dt.naive_utc()));
        let dt2 = Utc.with_ymd_and_hms(2024, 6, 15, 10, 3, 0).unwrap();
        assert!(!cron_matches_naive("*/5 * * * *", &dt2.naive_utc()));
    }

    #[test]
    fn next_is_strictly_after() {
        let after = Utc.with_ymd_and_hms(2024, 6, 15, 10, 30, 0).unwrap();
        let next = cron_next_tz("30 * * * *", &after, chrono_tz::UTC).unwrap();
        assert_eq!(next.hour(), 11);
        assert_eq!(next.minute(), 30);
    }

    #[test]
    fn evaluates_in_named_timezone() {
        let after = Utc.with_ymd_and_hms(2024, 6, 15, 12, 0, 0).unwrap();
        let tz = parse_tz("US/Eastern");
        let next = cron_next_tz("0 9 * * *", &after, tz).unwrap();
        // 9:00 EDT = 13:00 UTC.
        assert_eq!(next.hour(), 13);
        assert_eq!(next.minute(), 0);
    }

    #[test]
    fn spring_forward_gap_is_skipped() {
        // 2:30 local does not exist on 2024-03-10 in US/Eastern.
        let after = Utc.with_ymd_and_hms(2024, 3, 10, 6, 0, 0).unwrap();
        let tz = parse_tz("US/Eastern");
        let next = cron_next_tz("30 2 * * *", &after, tz).unwrap();
        assert_eq!(next.day(), 11);
    }

    #[test]
    fn fall_back_takes_earliest_mapping() {
        let after = Utc.with_ymd_and_hms(2024, 11, 3, 4, 0, 0).unwrap();
        let tz = parse_tz("US/Eastern");
        let next = cron_next_tz("30 1 * * *", &after, tz).unwrap();
        assert_eq!(next.hour(), 5);
        assert_eq!(next.minute(), 30);
    }

    #[test]
    fn invalid_tz_falls_back_to_utc() {
        assert_eq!(parse_tz("Not/Real"), chrono_tz::UTC);
    }

    #[test]
    fn validation_accepts_common_forms() {
        assert!(cron_is_valid("* * * * *"));
        assert!(cron_is_valid("*/10 9-17 * * 1-5"));
        assert!(cron_is_valid("0,30 8 1 * *"));
        assert!(!cron_is_valid("* * * *"));
        assert!(!cron_is_valid("banana * * * *"));
        assert!(!cron_is_valid("*/0 * * * *"));
    }
}
