//! Cron expression parsing and evaluation
//!
//! Five space-separated fields (minute, hour, day-of-month, month,
//! day-of-week), each a comma-separated list of `v`, `a-b`, `*`, or
//! `a-b/step` terms, plus the `@hourly`/`@daily`/`@weekly`/`@monthly`/
//! `@yearly` presets. Evaluation is purely calendrical in a named
//! timezone: the spring-forward missing hour is skipped and the
//! fall-back duplicated hour is selected on its first occurrence.

use std::collections::BTreeSet;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Duration as ChronoDuration, LocalResult, NaiveDate, TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

/// Errors from cron parsing
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CronError {
    /// Wrong number of fields
    #[error("expected 5 fields, got {0}")]
    FieldCount(usize),

    /// A field failed to parse
    #[error("invalid {field} field: {value}")]
    InvalidField {
        /// Field name
        field: &'static str,
        /// Offending text
        value: String,
    },

    /// A value fell outside the field's range
    #[error("{field} value {value} out of range {min}-{max}")]
    OutOfRange {
        /// Field name
        field: &'static str,
        /// Offending value
        value: u32,
        /// Lower bound
        min: u32,
        /// Upper bound
        max: u32,
    },

    /// Unknown preset alias
    #[error("unknown preset: {0}")]
    UnknownPreset(String),

    /// Unknown timezone name
    #[error("unknown timezone: {0}")]
    UnknownTimezone(String),
}

/// A parsed five-field cron expression
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CronSchedule {
    expr: String,
    minutes: BTreeSet<u32>,
    hours: BTreeSet<u32>,
    days_of_month: BTreeSet<u32>,
    months: BTreeSet<u32>,
    days_of_week: BTreeSet<u32>,
    dom_restricted: bool,
    dow_restricted: bool,
}

impl CronSchedule {
    /// Parse an expression or preset alias
    ///
    /// # Example
    ///
    /// ```
    /// use windlass_core::timer::CronSchedule;
    ///
    /// let every_five = CronSchedule::parse("*/5 * * * *").unwrap();
    /// let nightly = CronSchedule::parse("@daily").unwrap();
    /// assert_eq!(nightly.expression(), "0 0 * * *");
    /// # let _ = every_five;
    /// ```
    pub fn parse(expr: &str) -> Result<Self, CronError> {
        let expr = expr.trim();
        let expr = if let Some(alias) = expr.strip_prefix('@') {
            match alias {
                "hourly" => "0 * * * *",
                "daily" => "0 0 * * *",
                "weekly" => "0 0 * * 0",
                "monthly" => "0 0 1 * *",
                "yearly" => "0 0 1 1 *",
                other => return Err(CronError::UnknownPreset(format!("@{other}"))),
            }
        } else {
            expr
        };

        let fields: Vec<&str> = expr.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(CronError::FieldCount(fields.len()));
        }

        let minutes = parse_field(fields[0], "minute", 0, 59)?;
        let hours = parse_field(fields[1], "hour", 0, 23)?;
        let days_of_month = parse_field(fields[2], "day-of-month", 1, 31)?;
        let months = parse_field(fields[3], "month", 1, 12)?;
        // Day-of-week accepts 0-7 with both 0 and 7 meaning Sunday.
        let days_of_week: BTreeSet<u32> = parse_field(fields[4], "day-of-week", 0, 7)?
            .into_iter()
            .map(|d| d % 7)
            .collect();

        Ok(Self {
            expr: expr.to_string(),
            dom_restricted: fields[2] != "*",
            dow_restricted: fields[4] != "*",
            minutes,
            hours,
            days_of_month,
            months,
            days_of_week,
        })
    }

    /// The normalized expression text
    pub fn expression(&self) -> &str {
        &self.expr
    }

    /// Next occurrence strictly after `after`, in the given timezone
    ///
    /// Returns `None` when no occurrence exists within a four-year
    /// horizon (e.g. `0 0 30 2 *`).
    pub fn next_after(&self, after: DateTime<Utc>, tz: Tz) -> Option<DateTime<Utc>> {
        let local_after = after.with_timezone(&tz).naive_local();
        // First candidate: the next whole minute.
        let mut date = local_after.date();
        let mut minute_floor =
            local_after.time().hour() * 60 + local_after.time().minute() + 1;

        // Calendar scan bounded to cover any leap-year cycle.
        let horizon = date + ChronoDuration::days(366 * 4 + 1);

        while date <= horizon {
            if !self.months.contains(&date.month()) || !self.day_matches(date) {
                date = date.succ_opt()?;
                minute_floor = 0;
                continue;
            }

            // Scan matching hour/minute pairs at or after the floor.
            for &hour in &self.hours {
                for &minute in &self.minutes {
                    let offset = hour * 60 + minute;
                    if offset < minute_floor {
                        continue;
                    }
                    let naive = date.and_hms_opt(hour, minute, 0)?;
                    match tz.from_local_datetime(&naive) {
                        LocalResult::Single(dt) => {
                            return Some(dt.with_timezone(&Utc));
                        }
                        // Duplicated (fall-back) hour: take its first pass.
                        LocalResult::Ambiguous(first, _second) => {
                            return Some(first.with_timezone(&Utc));
                        }
                        // Missing (spring-forward) hour: skipped.
                        LocalResult::None => continue,
                    }
                }
            }

            date = date.succ_opt()?;
            minute_floor = 0;
        }
        None
    }

    fn day_matches(&self, date: NaiveDate) -> bool {
        let dom = self.days_of_month.contains(&date.day());
        let dow = self
            .days_of_week
            .contains(&date.weekday().num_days_from_sunday());
        match (self.dom_restricted, self.dow_restricted) {
            // Standard cron: restricted day fields match on either.
            (true, true) => dom || dow,
            (true, false) => dom,
            (false, true) => dow,
            (false, false) => true,
        }
    }
}

impl FromStr for CronSchedule {
    type Err = CronError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for CronSchedule {
    type Error = CronError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<CronSchedule> for String {
    fn from(schedule: CronSchedule) -> Self {
        schedule.expr
    }
}

impl std::fmt::Display for CronSchedule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.expr)
    }
}

/// Resolve a timezone name
pub fn parse_timezone(name: &str) -> Result<Tz, CronError> {
    name.parse::<Tz>()
        .map_err(|_| CronError::UnknownTimezone(name.to_string()))
}

fn parse_field(
    text: &str,
    field: &'static str,
    min: u32,
    max: u32,
) -> Result<BTreeSet<u32>, CronError> {
    let mut values = BTreeSet::new();

    for term in text.split(',') {
        if term.is_empty() {
            return Err(CronError::InvalidField {
                field,
                value: text.to_string(),
            });
        }

        let (range, step) = match term.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step.parse().map_err(|_| CronError::InvalidField {
                    field,
                    value: term.to_string(),
                })?;
                if step == 0 {
                    return Err(CronError::InvalidField {
                        field,
                        value: term.to_string(),
                    });
                }
                (range, step)
            }
            None => (term, 1),
        };

        let (start, end) = if range == "*" {
            (min, max)
        } else if let Some((a, b)) = range.split_once('-') {
            let a: u32 = a.parse().map_err(|_| CronError::InvalidField {
                field,
                value: term.to_string(),
            })?;
            let b: u32 = b.parse().map_err(|_| CronError::InvalidField {
                field,
                value: term.to_string(),
            })?;
            if a > b {
                return Err(CronError::InvalidField {
                    field,
                    value: term.to_string(),
                });
            }
            (a, b)
        } else {
            let v: u32 = range.parse().map_err(|_| CronError::InvalidField {
                field,
                value: term.to_string(),
            })?;
            // `v/step` means v through the field maximum.
            if step > 1 {
                (v, max)
            } else {
                (v, v)
            }
        };

        for value in [start, end] {
            if value < min || value > max {
                return Err(CronError::OutOfRange {
                    field,
                    value,
                    min,
                    max,
                });
            }
        }

        let mut value = start;
        while value <= end {
            values.insert(value);
            value += step;
        }
    }

    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDateTime;

    fn utc(s: &str) -> DateTime<Utc> {
        NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
            .unwrap()
            .and_utc()
    }

    #[test]
    fn test_parse_every_minute() {
        let schedule = CronSchedule::parse("* * * * *").unwrap();
        let next = schedule.next_after(utc("2026-03-02 10:15:30"), Tz::UTC).unwrap();
        assert_eq!(next, utc("2026-03-02 10:16:00"));
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert_eq!(
            CronSchedule::parse("* * * *"),
            Err(CronError::FieldCount(4))
        );
        assert!(matches!(
            CronSchedule::parse("61 * * * *"),
            Err(CronError::OutOfRange { field: "minute", .. })
        ));
        assert!(matches!(
            CronSchedule::parse("*/0 * * * *"),
            Err(CronError::InvalidField { .. })
        ));
        assert!(matches!(
            CronSchedule::parse("5-2 * * * *"),
            Err(CronError::InvalidField { .. })
        ));
        assert!(matches!(
            CronSchedule::parse("@fortnightly"),
            Err(CronError::UnknownPreset(_))
        ));
    }

    #[test]
    fn test_presets() {
        assert_eq!(
            CronSchedule::parse("@hourly").unwrap().expression(),
            "0 * * * *"
        );
        assert_eq!(
            CronSchedule::parse("@daily").unwrap().expression(),
            "0 0 * * *"
        );
        assert_eq!(
            CronSchedule::parse("@weekly").unwrap().expression(),
            "0 0 * * 0"
        );
        assert_eq!(
            CronSchedule::parse("@monthly").unwrap().expression(),
            "0 0 1 * *"
        );
        assert_eq!(
            CronSchedule::parse("@yearly").unwrap().expression(),
            "0 0 1 1 *"
        );
    }

    #[test]
    fn test_step_ranges() {
        let schedule = CronSchedule::parse("*/15 * * * *").unwrap();
        let next = schedule.next_after(utc("2026-03-02 10:16:00"), Tz::UTC).unwrap();
        assert_eq!(next, utc("2026-03-02 10:30:00"));

        let schedule = CronSchedule::parse("10-30/10 * * * *").unwrap();
        let next = schedule.next_after(utc("2026-03-02 10:31:00"), Tz::UTC).unwrap();
        assert_eq!(next, utc("2026-03-02 11:10:00"));
    }

    #[test]
    fn test_lists_and_exact_values() {
        let schedule = CronSchedule::parse("0 9,17 * * *").unwrap();
        assert_eq!(
            schedule.next_after(utc("2026-03-02 10:00:00"), Tz::UTC).unwrap(),
            utc("2026-03-02 17:00:00")
        );
        assert_eq!(
            schedule.next_after(utc("2026-03-02 18:00:00"), Tz::UTC).unwrap(),
            utc("2026-03-03 09:00:00")
        );
    }

    #[test]
    fn test_next_is_strictly_after() {
        let schedule = CronSchedule::parse("30 10 * * *").unwrap();
        let at = utc("2026-03-02 10:30:00");
        assert_eq!(
            schedule.next_after(at, Tz::UTC).unwrap(),
            utc("2026-03-03 10:30:00")
        );
    }

    #[test]
    fn test_day_of_week() {
        // 2026-03-02 is a Monday; next Sunday is 2026-03-08.
        let schedule = CronSchedule::parse("0 0 * * 0").unwrap();
        assert_eq!(
            schedule.next_after(utc("2026-03-02 00:00:00"), Tz::UTC).unwrap(),
            utc("2026-03-08 00:00:00")
        );
        // 7 also means Sunday.
        let schedule = CronSchedule::parse("0 0 * * 7").unwrap();
        assert_eq!(
            schedule.next_after(utc("2026-03-02 00:00:00"), Tz::UTC).unwrap(),
            utc("2026-03-08 00:00:00")
        );
    }

    #[test]
    fn test_dom_and_dow_match_either() {
        // Standard cron: day 15 OR Monday, whichever comes first.
        let schedule = CronSchedule::parse("0 0 15 * 1").unwrap();
        // From Tue 2026-03-03: next Monday is 2026-03-09, before the 15th.
        assert_eq!(
            schedule.next_after(utc("2026-03-03 00:00:00"), Tz::UTC).unwrap(),
            utc("2026-03-09 00:00:00")
        );
        // From Tue 2026-03-10: the 15th (a Sunday) comes before next Monday.
        assert_eq!(
            schedule.next_after(utc("2026-03-10 00:00:00"), Tz::UTC).unwrap(),
            utc("2026-03-15 00:00:00")
        );
    }

    #[test]
    fn test_month_rollover_and_impossible_date() {
        let schedule = CronSchedule::parse("0 0 31 * *").unwrap();
        // April has 30 days; from 2026-04-01 the next 31st is May 31.
        assert_eq!(
            schedule.next_after(utc("2026-04-01 00:00:00"), Tz::UTC).unwrap(),
            utc("2026-05-31 00:00:00")
        );

        // February 30 never exists.
        let schedule = CronSchedule::parse("0 0 30 2 *").unwrap();
        assert_eq!(schedule.next_after(utc("2026-01-01 00:00:00"), Tz::UTC), None);
    }

    #[test]
    fn test_spring_forward_hour_is_skipped() {
        // US Eastern: 2026-03-08 02:30 local does not exist (02:00 -> 03:00).
        let tz: Tz = "America/New_York".parse().unwrap();
        let schedule = CronSchedule::parse("30 2 * * *").unwrap();

        // 06:00 UTC on 2026-03-07 is 01:00 EST; next 02:30 local fires that day.
        let next = schedule.next_after(utc("2026-03-07 06:00:00"), tz).unwrap();
        assert_eq!(next, utc("2026-03-07 07:30:00")); // 02:30 EST

        // The day after, 02:30 does not exist; the occurrence lands on March 9.
        let next = schedule.next_after(next, tz).unwrap();
        assert_eq!(next, utc("2026-03-09 06:30:00")); // 02:30 EDT
    }

    #[test]
    fn test_fall_back_hour_selected_once() {
        // US Eastern: 2026-11-01 01:30 local occurs twice (EDT then EST).
        let tz: Tz = "America/New_York".parse().unwrap();
        let schedule = CronSchedule::parse("30 1 * * *").unwrap();

        let next = schedule.next_after(utc("2026-11-01 00:00:00"), tz).unwrap();
        // First occurrence is 01:30 EDT = 05:30 UTC, not 06:30 UTC.
        assert_eq!(next, utc("2026-11-01 05:30:00"));

        // The following occurrence is the next day's 01:30 EST.
        let next = schedule.next_after(next, tz).unwrap();
        assert_eq!(next, utc("2026-11-02 06:30:00"));
    }

    #[test]
    fn test_timezone_parse() {
        assert!(parse_timezone("Europe/Berlin").is_ok());
        assert!(matches!(
            parse_timezone("Mars/Olympus"),
            Err(CronError::UnknownTimezone(_))
        ));
    }

    #[test]
    fn test_serde_round_trip() {
        let schedule = CronSchedule::parse("*/5 9-17 * * 1-5").unwrap();
        let json = serde_json::to_string(&schedule).unwrap();
        assert_eq!(json, r#""*/5 9-17 * * 1-5""#);
        let parsed: CronSchedule = serde_json::from_str(&json).unwrap();
        assert_eq!(schedule, parsed);
    }
}
