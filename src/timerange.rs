// ============================================================================
// TIME RANGES
// ============================================================================
// Signed relative time ranges such as `-1h`, `2mo` or `-1y 3h 126s`.
// ============================================================================

use chrono::{DateTime, Duration, Months, Utc};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::TimeRangeError;

static RANGE_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(concat!(
        r"^([-+])?\s*",
        r"(?:(\d+)\s*y(?:ears?)?)?\s*",
        r"(?:(\d+)\s*mo(?:nths?)?)?\s*",
        r"(?:(\d+)\s*d(?:ays?)?)?\s*",
        r"(?:(\d+)\s*h(?:ours?)?)?\s*",
        r"(?:(\d+)\s*m(?:inutes?)?)?\s*",
        r"(?:(\d+)\s*s(?:econds?)?)?",
        r"$",
    ))
    .expect("valid time range regex")
});

/// Parsed range expression. Every component carries the expression sign.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimeRange {
    pub years: i64,
    pub months: i64,
    pub days: i64,
    pub hours: i64,
    pub minutes: i64,
    pub seconds: i64,
}

impl TimeRange {
    pub fn is_negative(&self) -> bool {
        [self.years, self.months, self.days, self.hours, self.minutes, self.seconds]
            .iter()
            .any(|v| *v < 0)
    }

    /// Shift `time` by the range.
    pub fn apply(&self, time: DateTime<Utc>) -> Result<DateTime<Utc>, TimeRangeError> {
        let overflow = || TimeRangeError::InvalidRange {
            input: format!("{:?}", self),
        };

        let months = self.years * 12 + self.months;
        let shifted = if months >= 0 {
            time.checked_add_months(Months::new(u32::try_from(months).map_err(|_| overflow())?))
        } else {
            time.checked_sub_months(Months::new(
                u32::try_from(months.unsigned_abs()).map_err(|_| overflow())?,
            ))
        }
        .ok_or_else(overflow)?;

        let offset = Duration::try_days(self.days)
            .and_then(|d| d.checked_add(&Duration::try_hours(self.hours)?))
            .and_then(|d| d.checked_add(&Duration::try_minutes(self.minutes)?))
            .and_then(|d| d.checked_add(&Duration::try_seconds(self.seconds)?))
            .ok_or_else(overflow)?;

        shifted.checked_add_signed(offset).ok_or_else(overflow)
    }
}

/// Parse a range expression. An expression without any component is invalid.
pub fn parse(input: &str) -> Result<TimeRange, TimeRangeError> {
    let invalid = || TimeRangeError::InvalidRange {
        input: input.to_string(),
    };

    let captures = RANGE_REGEX.captures(input.trim()).ok_or_else(invalid)?;
    let sign = match captures.get(1).map(|m| m.as_str()) {
        Some("-") => -1,
        _ => 1,
    };

    let mut values = [0i64; 6];
    let mut found = false;
    for (slot, value) in values.iter_mut().enumerate() {
        if let Some(m) = captures.get(slot + 2) {
            *value = sign * m.as_str().parse::<i64>().map_err(|_| invalid())?;
            found = true;
        }
    }
    if !found {
        return Err(invalid());
    }

    Ok(TimeRange {
        years: values[0],
        months: values[1],
        days: values[2],
        hours: values[3],
        minutes: values[4],
        seconds: values[5],
    })
}

/// Apply a range expression to a date.
pub fn apply(time: DateTime<Utc>, input: &str) -> Result<DateTime<Utc>, TimeRangeError> {
    parse(input)?.apply(time).map_err(|_| TimeRangeError::InvalidRange {
        input: input.to_string(),
    })
}

/// Render a duration as a range expression (`-1d 3h 2m 6s`).
pub fn format(duration: Duration) -> String {
    const UNITS: [(i64, &str); 4] = [(86_400, "d"), (3_600, "h"), (60, "m"), (1, "s")];

    let mut seconds = duration.num_seconds().unsigned_abs() as i64;
    let mut parts = Vec::new();
    for (size, unit) in UNITS {
        let count = seconds / size;
        if count > 0 {
            parts.push(format!("{}{}", count, unit));
            seconds %= size;
        }
    }
    if parts.is_empty() {
        return "0s".into();
    }

    let result = parts.join(" ");
    if duration < Duration::zero() {
        format!("-{}", result)
    } else {
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    fn reference() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 15, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_apply() {
        let now = reference();

        assert_eq!(apply(now, "-1h").unwrap(), now - Duration::hours(1));
        assert_eq!(
            apply(now, "2mo").unwrap(),
            Utc.with_ymd_and_hms(2024, 5, 15, 12, 0, 0).unwrap()
        );
        assert_eq!(
            apply(now, "-1y 3h 126s").unwrap(),
            Utc.with_ymd_and_hms(2023, 3, 15, 8, 57, 54).unwrap()
        );
        assert_eq!(
            apply(now, "3d 1h 6m").unwrap(),
            now + Duration::days(3) + Duration::hours(1) + Duration::minutes(6)
        );
        assert_eq!(apply(now, "+2 days").unwrap(), now + Duration::days(2));
    }

    #[test]
    fn test_apply_fail() {
        let now = reference();
        for input in ["42", "", "-", "1w", "h1"] {
            assert!(apply(now, input).is_err(), "'{}' should be rejected", input);
        }
    }

    #[test]
    fn test_parse_sign() {
        let range = parse("-1d 2h").unwrap();
        assert!(range.is_negative());
        assert_eq!(range.days, -1);
        assert_eq!(range.hours, -2);
        assert!(!parse("1d").unwrap().is_negative());
    }

    #[test]
    fn test_format() {
        assert_eq!(format(-Duration::hours(1)), "-1h");
        assert_eq!(format(Duration::days(60)), "60d");
        assert_eq!(
            format(-(Duration::days(1) + Duration::hours(3) + Duration::seconds(126))),
            "-1d 3h 2m 6s"
        );
        assert_eq!(
            format(Duration::days(3) + Duration::hours(1) + Duration::minutes(6)),
            "3d 1h 6m"
        );
    }
}
