//! Timing nodes: in-process `delay` and durable `sleep`
//!
//! `delay` blocks the runner worker for milliseconds and is not durable;
//! `sleep` returns `needs_sleep` with a wake time, and the runner persists a
//! sleep schedule and suspends the execution.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use flowrun_core::value::merge_passthrough;
use flowrun_core::{ExecutionContext, ExecutionResult, ExecutorError, NodeExecutor};
use serde_json::{json, Map, Value};
use tracing::debug;

/// In-process pause of `duration` milliseconds, bounded by cancellation.
///
/// Intended for sub-second to low-second pauses; anything longer belongs on
/// the durable `sleep` node.
#[derive(Debug, Default)]
pub struct DelayExecutor;

#[async_trait]
impl NodeExecutor for DelayExecutor {
    async fn execute(&self, ctx: &ExecutionContext) -> Result<ExecutionResult, ExecutorError> {
        let duration_ms = ctx
            .node_config
            .get("duration")
            .and_then(Value::as_u64)
            .unwrap_or(0);

        tokio::select! {
            _ = tokio::time::sleep(std::time::Duration::from_millis(duration_ms)) => {}
            _ = ctx.cancelled() => {
                return Err(ExecutorError::Cancelled(ctx.execution_id));
            }
        }

        let mut output = Map::new();
        output.insert("data".to_string(), Value::Bool(true));
        output.insert("delay_ms".to_string(), json!(duration_ms));
        merge_passthrough(&mut output, &ctx.input);
        Ok(ExecutionResult::ok(Value::Object(output)))
    }
}

/// Parsed sleep configuration
#[derive(Debug, Clone, PartialEq)]
pub enum SleepConfig {
    Relative {
        duration_value: f64,
        duration_unit: SleepUnit,
    },
    Absolute {
        target: DateTime<Utc>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SleepUnit {
    Seconds,
    Minutes,
    Hours,
    Days,
    Weeks,
}

impl SleepUnit {
    fn seconds(&self) -> f64 {
        match self {
            Self::Seconds => 1.0,
            Self::Minutes => 60.0,
            Self::Hours => 3_600.0,
            Self::Days => 86_400.0,
            Self::Weeks => 604_800.0,
        }
    }

    fn parse(s: &str) -> Result<Self, String> {
        match s {
            "seconds" => Ok(Self::Seconds),
            "minutes" => Ok(Self::Minutes),
            "hours" => Ok(Self::Hours),
            "days" => Ok(Self::Days),
            "weeks" => Ok(Self::Weeks),
            other => Err(format!("invalid duration_unit: {other:?}")),
        }
    }
}

impl SleepConfig {
    /// Parse the sleep node config. Mode is `relative` when `duration_value`
    /// is present, `absolute` when `target_date` is.
    pub fn parse(config: &Value) -> Result<Self, String> {
        if let Some(duration) = config.get("duration_value") {
            let duration_value = duration
                .as_f64()
                .ok_or_else(|| "duration_value must be a number".to_string())?;
            if duration_value < 0.0 {
                return Err("duration_value must be >= 0".to_string());
            }
            let unit = config
                .get("duration_unit")
                .and_then(Value::as_str)
                .ok_or_else(|| "missing duration_unit".to_string())?;
            return Ok(Self::Relative {
                duration_value,
                duration_unit: SleepUnit::parse(unit)?,
            });
        }

        if let Some(target_date) = config.get("target_date").and_then(Value::as_str) {
            let timezone = config
                .get("timezone")
                .and_then(Value::as_str)
                .unwrap_or("UTC");
            let target = parse_target_date(target_date, timezone)?;
            return Ok(Self::Absolute { target });
        }

        Err("sleep config needs duration_value (relative) or target_date (absolute)".to_string())
    }

    pub fn mode(&self) -> &'static str {
        match self {
            Self::Relative { .. } => "relative",
            Self::Absolute { .. } => "absolute",
        }
    }

    /// Wake time for a sleep starting now
    pub fn wake_up_at(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            Self::Relative {
                duration_value,
                duration_unit,
            } => {
                let millis = (duration_value * duration_unit.seconds() * 1_000.0).round() as i64;
                now + chrono::Duration::milliseconds(millis)
            }
            Self::Absolute { target } => *target,
        }
    }
}

/// Parse a target date in the given IANA zone; stored UTC.
///
/// Accepted formats: RFC 3339 (with or without fractional seconds),
/// `YYYY-MM-DDTHH:MM[:SS]`, `YYYY-MM-DD HH:MM[:SS]`, and `YYYY-MM-DD`.
fn parse_target_date(text: &str, timezone: &str) -> Result<DateTime<Utc>, String> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Ok(dt.with_timezone(&Utc));
    }

    let tz: Tz = timezone
        .parse()
        .map_err(|_| format!("invalid timezone: {timezone:?}"))?;

    let naive = [
        "%Y-%m-%dT%H:%M:%S",
        "%Y-%m-%dT%H:%M",
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%d %H:%M",
    ]
    .iter()
    .find_map(|format| NaiveDateTime::parse_from_str(text, format).ok())
    .or_else(|| {
        NaiveDate::parse_from_str(text, "%Y-%m-%d")
            .ok()
            .and_then(|date| date.and_hms_opt(0, 0, 0))
    })
    .ok_or_else(|| format!("unrecognized date format: {text:?}"))?;

    tz.from_local_datetime(&naive)
        .earliest()
        .map(|dt| dt.with_timezone(&Utc))
        .ok_or_else(|| format!("date {text:?} does not exist in timezone {timezone:?}"))
}

/// Durable pause. Completes immediately when the wake time has passed;
/// otherwise asks the runner to persist a sleep schedule.
#[derive(Debug, Default)]
pub struct SleepExecutor;

#[async_trait]
impl NodeExecutor for SleepExecutor {
    async fn execute(&self, ctx: &ExecutionContext) -> Result<ExecutionResult, ExecutorError> {
        let config = match SleepConfig::parse(&ctx.node_config) {
            Ok(c) => c,
            Err(message) => return Ok(ExecutionResult::fail(message)),
        };

        let now = Utc::now();
        let wake_up_at = config.wake_up_at(now);

        if wake_up_at <= now {
            debug!(node_id = %ctx.node_id, %wake_up_at, "sleep target already passed, skipping");
            let mut output = Map::new();
            output.insert("data".to_string(), Value::Bool(true));
            output.insert("sleep_skipped".to_string(), Value::Bool(true));
            output.insert(
                "reason".to_string(),
                Value::String("target time already passed".to_string()),
            );
            merge_passthrough(&mut output, &ctx.input);
            return Ok(ExecutionResult::ok(Value::Object(output)));
        }

        let duration_ms = (wake_up_at - now).num_milliseconds();
        let mut output = Map::new();
        output.insert("data".to_string(), json!(wake_up_at.to_rfc3339()));
        output.insert(
            "sleep_scheduled_until".to_string(),
            json!(wake_up_at.to_rfc3339()),
        );
        output.insert("sleep_duration_ms".to_string(), json!(duration_ms));
        output.insert("mode".to_string(), json!(config.mode()));
        output.insert("scheduled_at".to_string(), json!(now.to_rfc3339()));
        merge_passthrough(&mut output, &ctx.input);
        Ok(ExecutionResult::sleep(wake_up_at, Value::Object(output)))
    }

    fn validate_config(&self, config: &Value) -> Result<(), String> {
        SleepConfig::parse(config).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn ctx(config: Value) -> ExecutionContext {
        ExecutionContext::new(
            Uuid::now_v7(),
            Uuid::now_v7(),
            "sleep-1",
            config,
            json!({"message": "a"}),
            json!({"nodeOutputs": {}, "input": {}}),
        )
    }

    #[tokio::test]
    async fn test_delay_completes() {
        let ctx = ExecutionContext::new(
            Uuid::now_v7(),
            Uuid::now_v7(),
            "d-1",
            json!({"duration": 5}),
            json!({"k": 1}),
            json!({}),
        );
        let result = DelayExecutor.execute(&ctx).await.unwrap();
        assert!(result.success);
        assert_eq!(result.output["k"], json!(1));
    }

    #[tokio::test]
    async fn test_delay_releases_on_cancellation() {
        let ctx = ExecutionContext::new(
            Uuid::now_v7(),
            Uuid::now_v7(),
            "d-1",
            json!({"duration": 60_000}),
            Value::Null,
            json!({}),
        );
        ctx.cancellation_handle().cancel();
        let start = std::time::Instant::now();
        let result = DelayExecutor.execute(&ctx).await;
        assert!(matches!(result, Err(ExecutorError::Cancelled(_))));
        assert!(start.elapsed() < std::time::Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_relative_sleep_schedules_wake() {
        let result = SleepExecutor
            .execute(&ctx(json!({"duration_value": 5, "duration_unit": "seconds"})))
            .await
            .unwrap();
        assert!(result.success);
        assert!(result.needs_sleep);
        let wake = result.wake_up_at.unwrap();
        let delta = wake - Utc::now();
        assert!(delta > chrono::Duration::seconds(3));
        assert!(delta <= chrono::Duration::seconds(6));
        assert_eq!(result.output["mode"], json!("relative"));
        assert_eq!(result.output["message"], json!("a"));
        assert!(result.output["sleep_duration_ms"].as_i64().unwrap() > 3_000);
    }

    #[tokio::test]
    async fn test_zero_duration_completes_immediately() {
        let result = SleepExecutor
            .execute(&ctx(json!({"duration_value": 0, "duration_unit": "seconds"})))
            .await
            .unwrap();
        assert!(result.success);
        assert!(!result.needs_sleep);
        assert_eq!(result.output["sleep_skipped"], json!(true));
    }

    #[tokio::test]
    async fn test_absolute_sleep_in_the_past_skips() {
        let result = SleepExecutor
            .execute(&ctx(json!({"target_date": "2000-01-01T00:00:00Z"})))
            .await
            .unwrap();
        assert!(result.success);
        assert!(!result.needs_sleep);
        assert_eq!(result.output["sleep_skipped"], json!(true));
        assert_eq!(result.output["reason"], json!("target time already passed"));
        assert_eq!(result.output["message"], json!("a"));
    }

    #[tokio::test]
    async fn test_absolute_sleep_in_the_future() {
        let result = SleepExecutor
            .execute(&ctx(json!({"target_date": "2999-06-01 12:00:00", "timezone": "America/New_York"})))
            .await
            .unwrap();
        assert!(result.needs_sleep);
        assert_eq!(result.output["mode"], json!("absolute"));
        // Noon Eastern in June is 16:00 UTC (EDT)
        assert_eq!(
            result.wake_up_at.unwrap(),
            Utc.with_ymd_and_hms(2999, 6, 1, 16, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_target_date_formats() {
        for text in [
            "2999-01-02T03:04:05Z",
            "2999-01-02T03:04:05.123456789Z",
            "2999-01-02T03:04:05",
            "2999-01-02T03:04",
            "2999-01-02 03:04:05",
            "2999-01-02 03:04",
            "2999-01-02",
        ] {
            assert!(
                parse_target_date(text, "UTC").is_ok(),
                "failed to parse {text:?}"
            );
        }
        assert!(parse_target_date("tomorrow", "UTC").is_err());
        assert!(parse_target_date("2999-01-02", "Mars/Olympus").is_err());
    }

    #[test]
    fn test_config_validation() {
        assert!(SleepConfig::parse(&json!({"duration_value": 1, "duration_unit": "weeks"})).is_ok());
        assert!(SleepConfig::parse(&json!({"duration_value": -1, "duration_unit": "seconds"})).is_err());
        assert!(SleepConfig::parse(&json!({"duration_value": 1, "duration_unit": "fortnights"})).is_err());
        assert!(SleepConfig::parse(&json!({})).is_err());
        assert!(SleepConfig::parse(&json!({"target_date": "2999-01-01"})).is_ok());
    }
}
