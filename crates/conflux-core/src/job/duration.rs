//! ISO-8601 durations (`P1DT2H`) and repeating intervals (`R3/PT10M`)

use chrono::{DateTime, Duration, Months, Utc};

use crate::domain::definition::TimerDefinition;
use crate::CoreError;

/// A parsed ISO-8601 duration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IsoDuration {
    months: u32,
    days: u32,
    millis: u64,
}

fn invalid(text: &str) -> CoreError {
    CoreError::ConfigurationError(format!("Invalid ISO-8601 duration: {}", text))
}

// u32::MAX hours
const MAX_SECONDS: f64 = 4_294_967_295.0 * 3_600.0;

fn too_large(text: &str) -> CoreError {
    CoreError::ConfigurationError(format!("ISO-8601 duration too large: {}", text))
}

impl IsoDuration {
    /// Parse `PnYnMnWnDTnHnMnS`; only seconds may carry a fraction
    pub fn parse(text: &str) -> Result<Self, CoreError> {
        let body = text.trim().strip_prefix('P').ok_or_else(|| invalid(text))?;
        let (date_part, time_part) = match body.split_once('T') {
            Some((date, time)) => {
                if time.is_empty() {
                    return Err(invalid(text));
                }
                (date, Some(time))
            }
            None => (body, None),
        };
        if date_part.is_empty() && time_part.is_none() {
            return Err(invalid(text));
        }

        let mut duration = IsoDuration::default();
        for (value, unit) in components(date_part, text)? {
            let whole = whole_number(value, text)?;
            let (field, factor) = match unit {
                'Y' => (&mut duration.months, 12),
                'M' => (&mut duration.months, 1),
                'W' => (&mut duration.days, 7),
                'D' => (&mut duration.days, 1),
                _ => return Err(invalid(text)),
            };
            let current = *field;
            *field = whole
                .checked_mul(factor)
                .and_then(|v| current.checked_add(v))
                .ok_or_else(|| too_large(text))?;
        }
        if let Some(time_part) = time_part {
            for (value, unit) in components(time_part, text)? {
                let millis = match unit {
                    'H' => u64::from(whole_number(value, text)?) * 3_600_000,
                    'M' => u64::from(whole_number(value, text)?) * 60_000,
                    'S' => {
                        let seconds: f64 = value.parse().map_err(|_| invalid(text))?;
                        if !(0.0..=MAX_SECONDS).contains(&seconds) {
                            return Err(invalid(text));
                        }
                        (seconds * 1000.0).round() as u64
                    }
                    _ => return Err(invalid(text)),
                };
                duration.millis = duration
                    .millis
                    .checked_add(millis)
                    .ok_or_else(|| too_large(text))?;
            }
        }
        Ok(duration)
    }

    /// `start` moved forward by this duration
    pub fn add_to(&self, start: DateTime<Utc>) -> Result<DateTime<Utc>, CoreError> {
        let shifted = start
            .checked_add_months(Months::new(self.months))
            .ok_or_else(|| CoreError::ConfigurationError("Duration overflows the calendar".to_string()))?;
        let millis = i64::try_from(self.millis)
            .map_err(|_| CoreError::ConfigurationError("Duration too large".to_string()))?;
        shifted
            .checked_add_signed(Duration::days(i64::from(self.days)))
            .and_then(|t| t.checked_add_signed(Duration::milliseconds(millis)))
            .ok_or_else(|| CoreError::ConfigurationError("Duration overflows the calendar".to_string()))
    }
}

fn components<'a>(part: &'a str, original: &str) -> Result<Vec<(&'a str, char)>, CoreError> {
    let mut result = Vec::new();
    let mut start = 0;
    for (idx, ch) in part.char_indices() {
        if ch.is_ascii_digit() || ch == '.' || ch == ',' {
            continue;
        }
        let value = &part[start..idx];
        if value.is_empty() {
            return Err(invalid(original));
        }
        result.push((value, ch));
        start = idx + ch.len_utf8();
    }
    if start != part.len() {
        return Err(invalid(original));
    }
    Ok(result)
}

fn whole_number(value: &str, original: &str) -> Result<u32, CoreError> {
    value.parse().map_err(|_| invalid(original))
}

/// A parsed repeating interval `R[n]/[start/]duration`
#[derive(Debug, Clone, PartialEq)]
pub struct RepeatSpec {
    /// Remaining firings; `None` repeats forever
    pub repetitions: Option<u32>,
    /// Explicit first firing
    pub start: Option<DateTime<Utc>>,
    /// Interval between firings
    pub interval: IsoDuration,
    interval_text: String,
}

impl RepeatSpec {
    /// Parse a repeat expression
    pub fn parse(text: &str) -> Result<Self, CoreError> {
        let invalid_repeat =
            || CoreError::ConfigurationError(format!("Invalid ISO-8601 repeating interval: {}", text));
        let parts: Vec<&str> = text.trim().split('/').collect();
        let (count, start, interval) = match parts.as_slice() {
            [count, interval] => (*count, None, *interval),
            [count, start, interval] => (*count, Some(*start), *interval),
            _ => return Err(invalid_repeat()),
        };
        let count = count.strip_prefix('R').ok_or_else(invalid_repeat)?;
        let repetitions = if count.is_empty() {
            None
        } else {
            Some(count.parse::<u32>().map_err(|_| invalid_repeat())?)
        };
        let start = start
            .map(|s| DateTime::parse_from_rfc3339(s).map(|t| t.with_timezone(&Utc)))
            .transpose()
            .map_err(|_| invalid_repeat())?;
        Ok(Self {
            repetitions,
            start,
            interval: IsoDuration::parse(interval)?,
            interval_text: interval.to_string(),
        })
    }

    /// Due date of the first firing
    pub fn first_due(&self, now: DateTime<Utc>) -> Result<DateTime<Utc>, CoreError> {
        match self.start {
            Some(start) => Ok(start),
            None => self.interval.add_to(now),
        }
    }

    /// Due date and repeat expression of the firing after one due at
    /// `previous_due`, or `None` when the repetitions are used up
    pub fn next(&self, previous_due: DateTime<Utc>) -> Result<Option<(DateTime<Utc>, String)>, CoreError> {
        let remaining = match self.repetitions {
            Some(n) if n <= 1 => return Ok(None),
            Some(n) => Some(n - 1),
            None => None,
        };
        let due = self.interval.add_to(previous_due)?;
        let expression = match remaining {
            Some(n) => format!("R{}/{}", n, self.interval_text),
            None => format!("R/{}", self.interval_text),
        };
        Ok(Some((due, expression)))
    }
}

/// When a timer fires and how it repeats
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedTimer {
    /// First due date
    pub due_date: DateTime<Utc>,
    /// Repeat expression for recurring timers
    pub repeat: Option<String>,
    /// No repetition after this instant
    pub end_date: Option<DateTime<Utc>>,
}

/// Compute the first due date of a timer definition
pub fn resolve_timer(definition: &TimerDefinition, now: DateTime<Utc>) -> Result<ResolvedTimer, CoreError> {
    match definition {
        TimerDefinition::Duration(text) => Ok(ResolvedTimer {
            due_date: IsoDuration::parse(text)?.add_to(now)?,
            repeat: None,
            end_date: None,
        }),
        TimerDefinition::Date(date) => Ok(ResolvedTimer {
            due_date: *date,
            repeat: None,
            end_date: None,
        }),
        TimerDefinition::Cycle {
            expression,
            end_date,
        } => {
            let spec = RepeatSpec::parse(expression)?;
            Ok(ResolvedTimer {
                due_date: spec.first_due(now)?,
                repeat: Some(expression.clone()),
                end_date: *end_date,
            })
        }
    }
}
