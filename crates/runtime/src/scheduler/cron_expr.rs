//! POSIX 5-field cron expressions.
//!
//! Validation is done field by field so a malformed expression is rejected at
//! save time with a message naming the offending field. Next-occurrence
//! computation is delegated to the `cron` crate after normalizing to its
//! six-field form: the seconds field is pinned to `0` and day-of-week
//! ordinals are translated from the POSIX `0-7` (Sunday is 0 or 7) convention
//! to the crate's `1-7` (Sunday is 1).

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use cron::Schedule;
use thiserror::Error;

/// Errors from parsing a cron expression.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CronError {
    #[error("expected 5 fields (minute hour day-of-month month day-of-week), got {0}")]
    FieldCount(usize),

    #[error("{field} field: {reason}")]
    Field { field: &'static str, reason: String },

    #[error("unsupported expression: {0}")]
    Unsupported(String),
}

const FIELDS: [(&str, u32, u32); 5] = [
    ("minute", 0, 59),
    ("hour", 0, 23),
    ("day-of-month", 1, 31),
    ("month", 1, 12),
    // Both 0 and 7 mean Sunday.
    ("day-of-week", 0, 7),
];

/// A validated 5-field cron expression.
#[derive(Debug, Clone)]
pub struct CronExpression {
    source: String,
    schedule: Schedule,
}

impl CronExpression {
    /// Parse and validate a 5-field expression.
    pub fn parse(expr: &str) -> Result<Self, CronError> {
        let fields: Vec<&str> = expr.split_whitespace().collect();
        if fields.len() != FIELDS.len() {
            return Err(CronError::FieldCount(fields.len()));
        }

        let mut expanded = Vec::with_capacity(FIELDS.len());
        for (&(name, min, max), field) in FIELDS.iter().zip(fields.iter().copied()) {
            let values = expand_field(field, min, max)
                .map_err(|reason| CronError::Field { field: name, reason })?;
            expanded.push(values);
        }

        let day_of_week = if fields[4] == "*" {
            "*".to_string()
        } else {
            translate_day_of_week(&expanded[4])
        };
        let normalized = format!(
            "0 {} {} {} {} {}",
            fields[0], fields[1], fields[2], fields[3], day_of_week
        );
        let schedule = Schedule::from_str(&normalized)
            .map_err(|e| CronError::Unsupported(e.to_string()))?;

        Ok(Self {
            source: expr.to_string(),
            schedule,
        })
    }

    /// The expression as the user wrote it.
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// The next firing instant strictly after `after`, if any.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&after).next()
    }
}

impl fmt::Display for CronExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

impl FromStr for CronExpression {
    type Err = CronError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Expand one field into the set of values it matches. Accepts `*`, numeric
/// values, ranges, comma lists, and steps (`*/n`, `a-b/n`).
fn expand_field(field: &str, min: u32, max: u32) -> Result<BTreeSet<u32>, String> {
    if field.is_empty() {
        return Err("empty field".to_string());
    }
    let mut values = BTreeSet::new();
    for part in field.split(',') {
        let (range_part, step) = match part.split_once('/') {
            Some((range, step_str)) => {
                let step: u32 = step_str
                    .parse()
                    .map_err(|_| format!("invalid step '{step_str}'"))?;
                if step == 0 {
                    return Err("step must be at least 1".to_string());
                }
                (range, step)
            }
            None => (part, 1),
        };

        let (start, end) = if range_part == "*" {
            (min, max)
        } else if let Some((start_str, end_str)) = range_part.split_once('-') {
            let start = parse_bounded(start_str, min, max)?;
            let end = parse_bounded(end_str, min, max)?;
            if start > end {
                return Err(format!("range start {start} is greater than end {end}"));
            }
            (start, end)
        } else {
            let value = parse_bounded(range_part, min, max)?;
            if step > 1 {
                return Err(format!(
                    "step requires '*' or a range, got '{part}'"
                ));
            }
            (value, value)
        };

        values.extend((start..=end).step_by(step as usize));
    }
    Ok(values)
}

fn parse_bounded(raw: &str, min: u32, max: u32) -> Result<u32, String> {
    let value: u32 = raw
        .parse()
        .map_err(|_| format!("invalid value '{raw}'"))?;
    if value < min || value > max {
        return Err(format!("value {value} out of range {min}-{max}"));
    }
    Ok(value)
}

/// Map an expanded POSIX day-of-week set (0-7, Sunday twice) onto the `cron`
/// crate's 1-7 ordinals as an explicit list.
fn translate_day_of_week(days: &BTreeSet<u32>) -> String {
    let mapped: BTreeSet<u32> = days.iter().map(|d| (d % 7) + 1).collect();
    mapped
        .iter()
        .map(u32::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, TimeZone, Timelike, Weekday};

    #[test]
    fn accepts_standard_forms() {
        for expr in [
            "* * * * *",
            "*/1 * * * *",
            "0 3 * * *",
            "*/15 2-4 1,15 * 1-5",
            "30 0-23/2 * 1,6,12 *",
            "0 0 * * 7",
        ] {
            assert!(CronExpression::parse(expr).is_ok(), "{expr} should parse");
        }
    }

    #[test]
    fn rejects_wrong_field_count() {
        assert_eq!(
            CronExpression::parse("* * * *").unwrap_err(),
            CronError::FieldCount(4)
        );
        assert_eq!(
            CronExpression::parse("* * * * * *").unwrap_err(),
            CronError::FieldCount(6)
        );
        assert_eq!(CronExpression::parse("").unwrap_err(), CronError::FieldCount(0));
    }

    #[test]
    fn rejects_out_of_range_values_with_field_name() {
        let err = CronExpression::parse("60 * * * *").unwrap_err();
        match err {
            CronError::Field { field, reason } => {
                assert_eq!(field, "minute");
                assert!(reason.contains("60"));
            }
            other => panic!("unexpected error: {other:?}"),
        }

        assert!(matches!(
            CronExpression::parse("* 24 * * *").unwrap_err(),
            CronError::Field { field: "hour", .. }
        ));
        assert!(matches!(
            CronExpression::parse("* * 0 * *").unwrap_err(),
            CronError::Field { field: "day-of-month", .. }
        ));
        assert!(matches!(
            CronExpression::parse("* * * 13 *").unwrap_err(),
            CronError::Field { field: "month", .. }
        ));
        assert!(matches!(
            CronExpression::parse("* * * * 8").unwrap_err(),
            CronError::Field { field: "day-of-week", .. }
        ));
    }

    #[test]
    fn rejects_malformed_tokens() {
        for expr in [
            "a * * * *",
            "*/0 * * * *",
            "5-1 * * * *",
            "1,,2 * * * *",
            "5/2 * * * *",
            "1-60 * * * *",
        ] {
            assert!(CronExpression::parse(expr).is_err(), "{expr} should be rejected");
        }
    }

    #[test]
    fn next_after_advances_on_step_boundary() {
        let expr = CronExpression::parse("*/5 * * * *").unwrap();
        let after = Utc.with_ymd_and_hms(2024, 6, 1, 12, 3, 20).unwrap();
        let next = expr.next_after(after).unwrap();
        assert!(next > after);
        assert_eq!(next.minute() % 5, 0);
        assert_eq!(next.second(), 0);
        assert_eq!(next.minute(), 5);
    }

    #[test]
    fn sunday_accepts_both_zero_and_seven() {
        for expr in ["0 0 * * 0", "0 0 * * 7"] {
            let parsed = CronExpression::parse(expr).unwrap();
            let after = Utc.with_ymd_and_hms(2024, 6, 3, 0, 0, 0).unwrap(); // a Monday
            let next = parsed.next_after(after).unwrap();
            assert_eq!(next.weekday(), Weekday::Sun, "{expr}");
        }
    }

    #[test]
    fn weekday_ranges_translate() {
        let parsed = CronExpression::parse("0 12 * * 1-5").unwrap();
        let mut at = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap(); // a Saturday
        for _ in 0..10 {
            let next = parsed.next_after(at).unwrap();
            let wd = next.weekday();
            assert!(wd != Weekday::Sat && wd != Weekday::Sun);
            at = next;
        }
    }

    #[test]
    fn wrapping_weekend_range_covers_saturday_and_sunday() {
        let parsed = CronExpression::parse("0 0 * * 6-7").unwrap();
        let mut at = Utc.with_ymd_and_hms(2024, 6, 3, 0, 0, 0).unwrap(); // a Monday
        let mut seen = std::collections::BTreeSet::new();
        for _ in 0..4 {
            let next = parsed.next_after(at).unwrap();
            seen.insert(next.weekday().num_days_from_monday());
            at = next;
        }
        // Saturday and Sunday only.
        assert_eq!(seen.into_iter().collect::<Vec<_>>(), vec![5, 6]);
    }

    #[test]
    fn identical_expressions_parse_independently() {
        let a = CronExpression::parse("* * * * *").unwrap();
        let b = CronExpression::parse("* * * * *").unwrap();
        let after = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 30).unwrap();
        assert_eq!(a.next_after(after), b.next_after(after));
        assert_eq!(a.as_str(), "* * * * *");
    }
}
