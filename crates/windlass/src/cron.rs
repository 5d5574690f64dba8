//! Five-field cron expressions for schedule cadences.
//!
//! Supported syntax per field (minute, hour, day-of-month, month,
//! day-of-week): `*`, lists (`1,15`), ranges (`1-5`), and steps (`*/15`,
//! `10-50/10`). Day-of-week uses 0–6 with 0 = Sunday; 7 is accepted as an
//! alias for Sunday. As in classic cron, when both day-of-month and
//! day-of-week are restricted, a date matching either fires.

use std::collections::BTreeSet;

use time::{Duration, OffsetDateTime, Time};

/// A parsed cron expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpr {
    minutes: BTreeSet<u8>,
    hours: BTreeSet<u8>,
    days_of_month: BTreeSet<u8>,
    months: BTreeSet<u8>,
    days_of_week: BTreeSet<u8>,
    dom_restricted: bool,
    dow_restricted: bool,
}

impl CronExpr {
    /// Parse a five-field expression, e.g. `"*/15 2 * * 1-5"`.
    pub fn parse(expression: &str) -> Result<Self, String> {
        let fields: Vec<&str> = expression.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(format!(
                "expected 5 fields (minute hour day-of-month month day-of-week), got {}",
                fields.len()
            ));
        }

        let minutes = parse_field(fields[0], 0, 59, "minute")?;
        let hours = parse_field(fields[1], 0, 23, "hour")?;
        let days_of_month = parse_field(fields[2], 1, 31, "day-of-month")?;
        let months = parse_field(fields[3], 1, 12, "month")?;
        let mut days_of_week = parse_field(fields[4], 0, 7, "day-of-week")?;
        // 7 is Sunday, same as 0.
        if days_of_week.remove(&7) {
            days_of_week.insert(0);
        }

        Ok(Self {
            minutes,
            hours,
            days_of_month,
            months,
            days_of_week,
            dom_restricted: fields[2] != "*",
            dow_restricted: fields[4] != "*",
        })
    }

    /// The next matching instant strictly after `now` (UTC, minute
    /// precision).
    pub fn next_after(&self, now: OffsetDateTime) -> OffsetDateTime {
        let mut candidate = now
            .replace_time(Time::from_hms(now.hour(), now.minute(), 0).expect("valid time"))
            + Duration::minutes(1);

        // Bounded walk; worst realistic gap (e.g. Feb 29) is well inside.
        for _ in 0..(5 * 366 * 24 * 60) {
            if !self.months.contains(&u8::from(candidate.month())) {
                candidate = first_of_next_month(candidate);
                continue;
            }
            if !self.day_matches(candidate) {
                candidate = (candidate + Duration::days(1))
                    .replace_time(Time::MIDNIGHT);
                continue;
            }
            if !self.hours.contains(&candidate.hour()) {
                candidate = candidate
                    .replace_time(Time::from_hms(candidate.hour(), 0, 0).expect("valid time"))
                    + Duration::hours(1);
                continue;
            }
            if !self.minutes.contains(&candidate.minute()) {
                candidate += Duration::minutes(1);
                continue;
            }
            return candidate;
        }

        // Unreachable for any valid expression; fall back far in the future.
        candidate
    }

    fn day_matches(&self, at: OffsetDateTime) -> bool {
        let dom = self.days_of_month.contains(&at.day());
        let dow = self
            .days_of_week
            .contains(&at.weekday().number_days_from_sunday());

        match (self.dom_restricted, self.dow_restricted) {
            (true, true) => dom || dow,
            (true, false) => dom,
            (false, true) => dow,
            (false, false) => true,
        }
    }
}

fn first_of_next_month(at: OffsetDateTime) -> OffsetDateTime {
    let mut candidate = at.replace_time(Time::MIDNIGHT);
    let month = candidate.month();
    while candidate.month() == month {
        candidate += Duration::days(1);
    }
    candidate
}

fn parse_field(field: &str, min: u8, max: u8, name: &str) -> Result<BTreeSet<u8>, String> {
    let mut values = BTreeSet::new();

    for part in field.split(',') {
        let (range_part, step) = match part.split_once('/') {
            Some((range, step)) => {
                let step: u8 = step
                    .parse()
                    .map_err(|_| format!("{name}: invalid step '{step}'"))?;
                if step == 0 {
                    return Err(format!("{name}: step must be positive"));
                }
                (range, step)
            }
            None => (part, 1),
        };

        let (lo, hi) = if range_part == "*" {
            (min, max)
        } else {
            match range_part.split_once('-') {
                Some((lo, hi)) => {
                    let lo: u8 = lo.parse().map_err(|_| format!("{name}: invalid '{lo}'"))?;
                    let hi: u8 = hi.parse().map_err(|_| format!("{name}: invalid '{hi}'"))?;
                    (lo, hi)
                }
                None => {
                    let v: u8 = range_part
                        .parse()
                        .map_err(|_| format!("{name}: invalid '{range_part}'"))?;
                    (v, v)
                }
            }
        };

        if lo < min || hi > max || lo > hi {
            return Err(format!("{name}: '{part}' outside {min}-{max}"));
        }

        let mut v = lo;
        while v <= hi {
            values.insert(v);
            match v.checked_add(step) {
                Some(next) => v = next,
                None => break,
            }
        }
    }

    if values.is_empty() {
        return Err(format!("{name}: empty field"));
    }
    Ok(values)
}
