//! Timer spec parsing and next-fire calculation.
//!
//! A timer spec is either six space-separated cron fields
//! (`sec min hour day-of-month month day-of-week`) or one of the named
//! descriptors (`@hourly`, `@daily`, `@every 90s`, ...). Calendar specs are
//! evaluated in the host's local time zone; all returned instants are UTC.

use crate::error::ScheduleError;

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration as ChronoDuration, Local, Timelike, Utc};
use cron::Schedule as CronExpression;

/// Anything that can tell the cron engine when to fire next.
///
/// Implementations must return a time strictly after `from` on every call,
/// except where a wrapper such as [`ImmediatelyFirst`] deliberately fires at
/// `from` once. Returning `None` retires the entry.
pub trait Schedule: fmt::Debug + Send + Sync + 'static {
  fn next_after(&self, from: DateTime<Utc>) -> Option<DateTime<Utc>>;
}

impl<S: Schedule + ?Sized> Schedule for Arc<S> {
  fn next_after(&self, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
    (**self).next_after(from)
  }
}

impl<S: Schedule + ?Sized> Schedule for Box<S> {
  fn next_after(&self, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
    (**self).next_after(from)
  }
}

/// A parsed timer spec.
#[derive(Debug, Clone)]
pub enum TimerSchedule {
  /// A calendar expression, already translated to the `cron` crate's field conventions.
  Cron(Box<CronExpression>),
  /// `@every <duration>`: a constant delay, whole seconds, at least one second.
  Every(StdDuration),
}

impl Schedule for TimerSchedule {
  fn next_after(&self, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
    match self {
      TimerSchedule::Cron(expression) => expression
        .after(&from.with_timezone(&Local))
        .next()
        .map(|next| next.with_timezone(&Utc)),
      TimerSchedule::Every(delay) => {
        let base = from.with_nanosecond(0).unwrap_or(from);
        let delay = ChronoDuration::from_std(*delay).ok()?;
        base.checked_add_signed(delay)
      }
    }
  }
}

impl FromStr for TimerSchedule {
  type Err = ScheduleError;

  fn from_str(spec: &str) -> Result<Self, Self::Err> {
    parse(spec)
  }
}

/// Parses a timer spec.
///
/// Day-of-week uses the classic cron numbering (`0` = Sunday through `6` =
/// Saturday) or names; `?` is accepted as `*` in the two day fields.
pub fn parse(spec: &str) -> Result<TimerSchedule, ScheduleError> {
  let spec = spec.trim();
  if spec.is_empty() {
    return Err(ScheduleError::Empty);
  }

  if spec.starts_with('@') {
    return parse_descriptor(spec);
  }

  let fields: Vec<&str> = spec.split_whitespace().collect();
  if fields.len() != 6 {
    return Err(ScheduleError::FieldCount(fields.len(), spec.to_string()));
  }

  let day_of_month = if fields[3] == "?" { "*" } else { fields[3] };
  let day_of_week = translate_day_of_week(fields[5])?;
  let expression = format!(
    "{} {} {} {} {} {}",
    fields[0], fields[1], fields[2], day_of_month, fields[4], day_of_week
  );

  CronExpression::from_str(&expression)
    .map(|parsed| TimerSchedule::Cron(Box::new(parsed)))
    .map_err(|e| ScheduleError::Invalid {
      spec: spec.to_string(),
      reason: e.to_string(),
    })
}

fn parse_descriptor(spec: &str) -> Result<TimerSchedule, ScheduleError> {
  let (name, rest) = match spec.split_once(char::is_whitespace) {
    Some((name, rest)) => (name, rest.trim()),
    None => (spec, ""),
  };

  let expanded = match name.to_ascii_lowercase().as_str() {
    "@yearly" | "@annually" => "0 0 0 1 1 *",
    "@monthly" => "0 0 0 1 * *",
    "@weekly" => "0 0 0 * * 0",
    "@daily" | "@midnight" => "0 0 0 * * *",
    "@hourly" => "0 0 * * * *",
    "@every" => return parse_every(rest).map(TimerSchedule::Every),
    _ => return Err(ScheduleError::UnknownDescriptor(spec.to_string())),
  };
  if !rest.is_empty() {
    return Err(ScheduleError::UnknownDescriptor(spec.to_string()));
  }
  parse(expanded)
}

/// Parses durations like `90s`, `1h30m` or `1.5m`, rounded down to whole seconds (minimum 1s).
fn parse_every(text: &str) -> Result<StdDuration, ScheduleError> {
  let invalid = || ScheduleError::InvalidDuration(text.to_string());
  if text.is_empty() {
    return Err(invalid());
  }

  let mut total_secs = 0f64;
  let mut rest = text;
  while !rest.is_empty() {
    let number_len = rest
      .find(|c: char| !(c.is_ascii_digit() || c == '.'))
      .ok_or_else(invalid)?;
    if number_len == 0 {
      return Err(invalid());
    }
    let value: f64 = rest[..number_len].parse().map_err(|_| invalid())?;
    rest = &rest[number_len..];

    let unit_len = rest
      .find(|c: char| c.is_ascii_digit() || c == '.')
      .unwrap_or(rest.len());
    let unit_secs = match &rest[..unit_len] {
      "h" => 3600.0,
      "m" => 60.0,
      "s" => 1.0,
      "ms" => 1e-3,
      "us" | "µs" => 1e-6,
      "ns" => 1e-9,
      _ => return Err(invalid()),
    };
    rest = &rest[unit_len..];
    total_secs += value * unit_secs;
  }

  let whole = total_secs.floor() as u64;
  Ok(StdDuration::from_secs(whole.max(1)))
}

/// Rewrites a `0-6` (Sunday = 0) day-of-week field into the `cron` crate's `1-7` (Sunday = 1).
fn translate_day_of_week(field: &str) -> Result<String, ScheduleError> {
  let mut items = Vec::new();
  for item in field.split(',') {
    let (base, step) = match item.split_once('/') {
      Some((base, step)) => (base, Some(step)),
      None => (item, None),
    };
    let base = match base {
      "*" | "?" => "*".to_string(),
      range if range.contains('-') => {
        let (start, end) = range.split_once('-').unwrap_or((range, range));
        format!("{}-{}", translate_day(start)?, translate_day(end)?)
      }
      single => translate_day(single)?,
    };
    items.push(match step {
      Some(step) => format!("{base}/{step}"),
      None => base,
    });
  }
  Ok(items.join(","))
}

fn translate_day(token: &str) -> Result<String, ScheduleError> {
  match token.parse::<u32>() {
    Ok(day) if day <= 6 => Ok((day + 1).to_string()),
    Ok(day) => Err(ScheduleError::DayOfWeekRange(day)),
    // Names (MON, Fri, ...) mean the same thing in both conventions.
    Err(_) => Ok(token.to_string()),
  }
}

/// Fires at the reference time on its first call, then defers to the wrapped schedule.
///
/// Used when the worker is configured to run newly loaded jobs right away
/// instead of waiting for their first natural occurrence.
#[derive(Debug)]
pub struct ImmediatelyFirst<S> {
  inner: S,
  fired: AtomicBool,
}

impl<S: Schedule> ImmediatelyFirst<S> {
  pub fn new(inner: S) -> Self {
    Self {
      inner,
      fired: AtomicBool::new(false),
    }
  }
}

impl<S: Schedule> Schedule for ImmediatelyFirst<S> {
  fn next_after(&self, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
    if !self.fired.swap(true, Ordering::AcqRel) {
      return Some(from);
    }
    self.inner.next_after(from)
  }
}
