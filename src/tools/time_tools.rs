use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Datelike, Duration, Local};
use serde_json::{Value, json};

use super::{Tool, tool_error_payload};

pub const CURRENT_TIME_TOOL_NAME: &str = "get_current_time";

/// Local clock with optional relative offsets ("tomorrow", "in 3 hours").
#[derive(Debug, Default)]
pub struct CurrentTimeTool;

impl CurrentTimeTool {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Tool for CurrentTimeTool {
    fn name(&self) -> &str {
        CURRENT_TIME_TOOL_NAME
    }

    fn description(&self) -> &str {
        "Return the current local date and time.\n\
         Optional arg 'relative' shifts the result: now, today, tomorrow, yesterday, in <n> minutes|hours|days|weeks."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "relative": { "type": "string", "description": "Relative expression such as 'in 2 days'." }
            }
        })
    }

    async fn call(&self, args: Value) -> Result<Value> {
        let now = Local::now();
        let relative = args
            .get("relative")
            .and_then(Value::as_str)
            .map(str::trim)
            .unwrap_or_default();
        if relative.is_empty() {
            return Ok(time_payload(now));
        }
        Ok(match shift_relative(now, relative) {
            Some(shifted) => time_payload(shifted),
            None => tool_error_payload(
                "invalid_args",
                format!("could not parse relative time '{relative}'"),
            ),
        })
    }
}

fn time_payload(at: DateTime<Local>) -> Value {
    json!({
        "now_iso": at.to_rfc3339(),
        "date": at.date_naive().to_string(),
        "weekday": at.weekday().to_string(),
        "utc_offset": at.offset().to_string(),
        "unix_seconds": at.timestamp()
    })
}

pub fn shift_relative(now: DateTime<Local>, input: &str) -> Option<DateTime<Local>> {
    let input = input.trim().to_ascii_lowercase();
    match input.as_str() {
        "now" | "today" => return Some(now),
        "tomorrow" => return Some(now + Duration::days(1)),
        "yesterday" => return Some(now - Duration::days(1)),
        _ => {}
    }

    let rest = input.strip_prefix("in ")?;
    let (amount, unit) = rest.split_once(' ')?;
    let amount = amount.parse::<i64>().ok()?;
    let delta = match unit.trim() {
        "minute" | "minutes" => Duration::minutes(amount),
        "hour" | "hours" => Duration::hours(amount),
        "day" | "days" => Duration::days(amount),
        "week" | "weeks" => Duration::weeks(amount),
        _ => return None,
    };
    Some(now + delta)
}
