use chrono::{DateTime, Utc};
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug, Clone)]
#[error("Invalid cron expression '{expression}': {reason}")]
pub struct CronError {
    pub expression: String,
    pub reason: String,
}

/// A parsed cron expression.
///
/// Accepts the classic five-field form (`min hour dom month dow`) as well as
/// the six/seven-field forms with leading seconds and trailing year.
/// Five-field expressions number weekdays like unix cron (0 or 7 = Sunday);
/// the longer forms keep the `cron` crate's numbering (1 = Sunday).
#[derive(Debug, Clone)]
pub struct CronSchedule {
    expression: String,
    schedule: cron::Schedule,
}

impl CronSchedule {
    pub fn parse(expression: &str) -> Result<Self, CronError> {
        let fields: Vec<&str> = expression.split_whitespace().collect();
        let normalized = match fields.len() {
            5 => {
                let weekdays = unix_weekdays(fields[4]).map_err(|reason| CronError {
                    expression: expression.to_string(),
                    reason,
                })?;
                format!("0 {} {}", fields[..4].join(" "), weekdays)
            }
            6 | 7 => fields.join(" "),
            n => {
                return Err(CronError {
                    expression: expression.to_string(),
                    reason: format!("expected 5 to 7 fields, found {n}"),
                })
            }
        };

        let schedule = cron::Schedule::from_str(&normalized).map_err(|e| CronError {
            expression: expression.to_string(),
            reason: e.to_string(),
        })?;

        Ok(Self {
            expression: expression.to_string(),
            schedule,
        })
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// First firing strictly after `after`.
    pub fn next_after(&self, after: &DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(after).next()
    }
}

/// Rewrite a unix day-of-week field (0 or 7 = Sunday, 1 = Monday) into the
/// `cron` crate's numbering (1 = Sunday, 7 = Saturday).
///
/// Names and `*` based items mean the same thing in both and pass through.
fn unix_weekdays(field: &str) -> Result<String, String> {
    let mut items = Vec::new();
    for item in field.split(',') {
        let (base, step) = match item.split_once('/') {
            Some((base, step)) => {
                let step: u8 = step
                    .parse()
                    .map_err(|_| format!("invalid day-of-week step '{step}'"))?;
                if step == 0 {
                    return Err("day-of-week step must be positive".to_string());
                }
                (base, Some(step))
            }
            None => (item, None),
        };

        let bounds = match base.split_once('-') {
            Some((start, end)) => weekday_number(start).zip(weekday_number(end)),
            None => weekday_number(base).map(|day| match step {
                // `n/s` runs from n through the end of the week.
                Some(_) => (day, 6),
                None => (day, day),
            }),
        };
        let Some((start, end)) = bounds else {
            items.push(item.to_string());
            continue;
        };

        if start > 7 || end > 7 {
            return Err(format!("day-of-week '{item}' is out of range 0-7"));
        }
        if start > end {
            return Err(format!("day-of-week range '{item}' is reversed"));
        }

        let mut days: Vec<u8> = (start..=end)
            .step_by(usize::from(step.unwrap_or(1)))
            .map(|day| if day == 7 { 1 } else { day + 1 })
            .collect();
        days.sort_unstable();
        days.dedup();
        items.extend(days.iter().map(u8::to_string));
    }
    Ok(items.join(","))
}

fn weekday_number(value: &str) -> Option<u8> {
    value.parse().ok()
}
