use std::str::FromStr;

use chrono_tz::Tz;

use crate::error::{CronError, Result};
use crate::schedule::{CronSchedule, Every, Schedule};

const EVERY_PREFIX: &str = "@every";

const SUNDAY: u32 = 0;
const SATURDAY: u32 = 6;
const SUNDAY_ALIAS: u32 = 7;

/// Turns cadence expressions into schedules.
///
/// Accepted forms:
/// - 5 fields `min hour dom month dow` (or 6/7 with a leading seconds field
///   when `with_seconds` is on)
/// - descriptors: `@yearly`, `@annually`, `@monthly`, `@weekly`, `@daily`,
///   `@midnight`, `@hourly`
/// - `@every <duration>` with a `humantime` duration (`1s`, `5m`, `1h 30m`)
/// - any of the above prefixed with `TZ=<zone>` or `CRON_TZ=<zone>`
///
/// Day-of-week numbers follow standard cron: `0`-`6` from Sunday, with `7`
/// also meaning Sunday. They are rewritten to the `cron` crate's `1`-`7`
/// numbering before the expression is handed over; day names (`MON-FRI`)
/// pass through unchanged. Field matching itself is left to the `cron` crate.
#[derive(Debug, Clone, Copy)]
pub struct Parser {
    with_seconds: bool,
    tz: Tz,
}

impl Default for Parser {
    fn default() -> Self {
        Self {
            with_seconds: false,
            tz: Tz::UTC,
        }
    }
}

impl Parser {
    pub fn new(with_seconds: bool, tz: Tz) -> Self {
        Self { with_seconds, tz }
    }

    pub fn with_seconds(&self) -> bool {
        self.with_seconds
    }

    pub fn timezone(&self) -> Tz {
        self.tz
    }

    pub fn parse(&self, spec: &str) -> Result<Box<dyn Schedule>> {
        let trimmed = spec.trim();
        if trimmed.is_empty() {
            return Err(invalid(spec, "empty expression"));
        }

        let (tz, body) = split_timezone(trimmed, self.tz)?;

        let every = body
            .strip_prefix(EVERY_PREFIX)
            .filter(|rest| rest.is_empty() || rest.starts_with(char::is_whitespace));
        if let Some(rest) = every {
            return parse_every(rest).map(|every| Box::new(every) as Box<dyn Schedule>);
        }

        let expr = if body.starts_with('@') {
            descriptor(body)
                .ok_or_else(|| invalid(spec, &format!("unrecognized descriptor: {body}")))?
                .to_string()
        } else {
            self.normalize_fields(spec, body)?
        };

        let schedule =
            cron::Schedule::from_str(&expr).map_err(|e| invalid(spec, &e.to_string()))?;
        Ok(Box::new(CronSchedule::new(expr, schedule, tz)))
    }

    /// Returns the expression in the `cron` crate's form: seconds field
    /// first, day-of-week in its numbering.
    fn normalize_fields(&self, spec: &str, body: &str) -> Result<String> {
        let mut fields: Vec<String> = body.split_whitespace().map(str::to_string).collect();
        if self.with_seconds {
            if !(6..=7).contains(&fields.len()) {
                return Err(invalid(
                    spec,
                    &format!("expected 6 fields, found {}", fields.len()),
                ));
            }
        } else {
            if fields.len() != 5 {
                return Err(invalid(
                    spec,
                    &format!("expected 5 fields, found {}", fields.len()),
                ));
            }
            fields.insert(0, "0".to_string());
        }
        fields[5] = day_of_week(spec, &fields[5])?;
        Ok(fields.join(" "))
    }
}

/// Rewrites numeric day-of-week items from `0`-`7` (Sunday = 0 or 7) to the
/// `cron` crate's `1`-`7` (Sunday = 1). Numeric ranges and steps are
/// expanded to explicit lists so `5-7` (Friday to Sunday) stays valid.
fn day_of_week(spec: &str, field: &str) -> Result<String> {
    let items = field
        .split(',')
        .map(|item| day_of_week_item(spec, item))
        .collect::<Result<Vec<_>>>()?;
    Ok(items.join(","))
}

fn day_of_week_item(spec: &str, item: &str) -> Result<String> {
    let (base, step) = match item.split_once('/') {
        Some((base, step)) => (base, Some(step)),
        None => (item, None),
    };
    if base == "*" || base == "?" || base.chars().any(|c| c.is_ascii_alphabetic()) {
        return Ok(item.to_string());
    }

    let day = |s: &str| -> Result<u32> {
        s.parse::<u32>()
            .ok()
            .filter(|d| *d <= SUNDAY_ALIAS)
            .ok_or_else(|| invalid(spec, &format!("invalid day of week: {s}")))
    };
    let (first, last) = match base.split_once('-') {
        Some((first, last)) => (day(first)?, day(last)?),
        None if step.is_some() => (day(base)?, SATURDAY),
        None => {
            let d = day(base)?;
            (d, d)
        }
    };
    if first > last {
        return Err(invalid(spec, &format!("invalid day-of-week range: {base}")));
    }
    let step = match step {
        Some(s) => s
            .parse::<usize>()
            .ok()
            .filter(|s| *s > 0)
            .ok_or_else(|| invalid(spec, &format!("invalid day-of-week step: {s}")))?,
        None => 1,
    };

    let mut days: Vec<u32> = (first..=last)
        .step_by(step)
        .map(|d| (if d == SUNDAY_ALIAS { SUNDAY } else { d }) + 1)
        .collect();
    days.sort_unstable();
    days.dedup();
    Ok(days
        .iter()
        .map(u32::to_string)
        .collect::<Vec<_>>()
        .join(","))
}

fn split_timezone(spec: &str, default: Tz) -> Result<(Tz, &str)> {
    let rest = match spec
        .strip_prefix("CRON_TZ=")
        .or_else(|| spec.strip_prefix("TZ="))
    {
        Some(rest) => rest,
        None => return Ok((default, spec)),
    };

    let (zone, body) = rest
        .split_once(char::is_whitespace)
        .ok_or_else(|| invalid(spec, "missing expression after timezone"))?;
    let tz: Tz = zone
        .parse()
        .map_err(|_| CronError::InvalidTimezone(zone.to_string()))?;
    Ok((tz, body.trim_start()))
}

fn parse_every(rest: &str) -> Result<Every> {
    let value = rest.trim();
    let interval = humantime::parse_duration(value).map_err(|e| CronError::InvalidDuration {
        value: value.to_string(),
        reason: e.to_string(),
    })?;
    if interval.is_zero() {
        return Err(CronError::InvalidDuration {
            value: value.to_string(),
            reason: "interval must be greater than zero".to_string(),
        });
    }
    Ok(Every::new(interval))
}

fn descriptor(name: &str) -> Option<&'static str> {
    match name {
        "@yearly" | "@annually" => Some("0 0 0 1 1 *"),
        "@monthly" => Some("0 0 0 1 * *"),
        "@weekly" => Some("0 0 0 * * SUN"),
        "@daily" | "@midnight" => Some("0 0 0 * * *"),
        "@hourly" => Some("0 0 * * * *"),
        _ => None,
    }
}

fn invalid(spec: &str, reason: &str) -> CronError {
    CronError::InvalidCronExpression {
        expr: spec.to_string(),
        reason: reason.to_string(),
    }
}
