//! Timer trigger: fires on a fixed interval or at a wall-clock time on
//! selected weekdays.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Datelike, Local, NaiveDate, NaiveDateTime, NaiveTime, Weekday};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{Subscription, Trigger, TriggerNode};
use crate::tools::ToolDescriptor;

/// Longest single wait, matching a signed 32-bit millisecond timer.
const MAX_WAIT_MS: u64 = 2_147_483_647;

#[derive(Debug, Clone, PartialEq)]
pub enum Schedule {
    Every(Duration),
    Monthly,
    At { time: NaiveTime, days: Vec<Weekday> },
}

impl Schedule {
    /// Build a schedule from node parameters.
    pub fn from_params(params: &Value) -> anyhow::Result<Self> {
        let obj = params
            .as_object()
            .ok_or_else(|| anyhow::anyhow!("Timer trigger node is missing parameters"))?;
        let str_param = |key: &str, default: &str| -> String {
            obj.get(key).and_then(Value::as_str).unwrap_or(default).to_string()
        };

        let schedule_type = str_param("scheduleType", "Interval");
        match schedule_type.as_str() {
            "Interval" => {
                let schedule = str_param("schedule", "Every Minute");
                let minutes: u64 = match schedule.as_str() {
                    "Every Minute" => 1,
                    "Every 5 Minutes" => 5,
                    "Every 15 Minutes" => 15,
                    "Every 30 Minutes" => 30,
                    "Hourly" => 60,
                    "Daily" => 24 * 60,
                    "Weekly" => 7 * 24 * 60,
                    "Monthly" => return Ok(Schedule::Monthly),
                    other => anyhow::bail!("Invalid schedule: {other}"),
                };
                Ok(Schedule::Every(Duration::from_secs(minutes * 60)))
            }
            "Specific Time" => {
                let raw = str_param("specificTime", "");
                let time = NaiveTime::parse_from_str(&raw, "%H:%M")
                    .map_err(|_| anyhow::anyhow!("Invalid specificTime: {raw}"))?;
                let days = obj
                    .get("specificDays")
                    .and_then(Value::as_array)
                    .map(|list| {
                        list.iter()
                            .filter_map(Value::as_str)
                            .filter_map(|d| d.parse::<Weekday>().ok())
                            .collect::<Vec<_>>()
                    })
                    .unwrap_or_default();
                if days.is_empty() {
                    anyhow::bail!("Invalid schedule: no valid specificDays");
                }
                Ok(Schedule::At { time, days })
            }
            other => anyhow::bail!("Invalid scheduleType: {other}"),
        }
    }

    /// Delay from `now` (local wall clock) until the next firing.
    pub fn next_delay(&self, now: NaiveDateTime) -> Duration {
        match self {
            Schedule::Every(d) => *d,
            Schedule::Monthly => {
                let (year, month) = if now.month() == 12 {
                    (now.year() + 1, 1)
                } else {
                    (now.year(), now.month() + 1)
                };
                let first = NaiveDate::from_ymd_opt(year, month, 1)
                    .and_then(|d| d.and_hms_opt(0, 0, 0))
                    .unwrap_or(now);
                let ms = (first - now).num_milliseconds().max(0) as u64;
                Duration::from_millis(ms.min(MAX_WAIT_MS))
            }
            Schedule::At { time, days } => {
                let mut target = now.date().and_time(*time);
                if target <= now {
                    target += chrono::Duration::days(1);
                }
                // At most a week ahead since `days` is non-empty.
                for _ in 0..7 {
                    if days.contains(&target.weekday()) {
                        break;
                    }
                    target += chrono::Duration::days(1);
                }
                let ms = (target - now).num_milliseconds().max(0) as u64;
                Duration::from_millis(ms.min(MAX_WAIT_MS))
            }
        }
    }
}

fn timer_event(node_id: &str) -> Value {
    json!({
        "type": "timer",
        "nodeId": node_id,
        "timestamp": chrono::Utc::now().to_rfc3339(),
    })
}

#[derive(Default)]
pub struct TimerTrigger;

impl TimerTrigger {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Trigger for TimerTrigger {
    fn kind(&self) -> &str {
        "timer"
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "fireOnStart": { "type": "string", "enum": ["Yes", "No"], "default": "Yes" },
                "scheduleType": { "type": "string", "enum": ["Interval", "Specific Time"], "default": "Interval" },
                "schedule": {
                    "type": "string",
                    "enum": [
                        "Every Minute", "Every 5 Minutes", "Every 15 Minutes", "Every 30 Minutes",
                        "Hourly", "Daily", "Weekly", "Monthly"
                    ],
                    "default": "Every Minute"
                },
                "specificTime": { "type": "string", "description": "HH:MM, local time" },
                "specificDays": {
                    "type": "array",
                    "items": {
                        "type": "string",
                        "enum": ["Monday", "Tuesday", "Wednesday", "Thursday", "Friday", "Saturday", "Sunday"]
                    }
                }
            },
            "additionalProperties": false
        })
    }

    async fn subscribe(&self, node: &TriggerNode) -> anyhow::Result<Subscription> {
        let schedule = Schedule::from_params(&node.parameters)?;
        let fire_on_start = node
            .parameters
            .get("fireOnStart")
            .and_then(Value::as_str)
            .unwrap_or("Yes")
            == "Yes";

        let (tx, rx) = mpsc::channel(16);
        let stop = CancellationToken::new();
        let token = stop.clone();
        let node_id = node.id.clone();

        tokio::spawn(async move {
            if fire_on_start && tx.send(timer_event(&node_id)).await.is_err() {
                return;
            }
            loop {
                let wait = schedule.next_delay(Local::now().naive_local());
                debug!(node_id = %node_id, wait_ms = wait.as_millis() as u64, "timer armed");
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(wait) => {
                        if tx.send(timer_event(&node_id)).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        Ok(Subscription { events: rx, stop })
    }

    fn validate(&self, event: &Value, node: &TriggerNode) -> bool {
        event.get("type").and_then(Value::as_str) == Some("timer")
            && event.get("nodeId").and_then(Value::as_str) == Some(node.id.as_str())
    }

    fn process(&self, event: &Value) -> Value {
        json!({ "timestamp": event.get("timestamp").cloned().unwrap_or(Value::Null) })
    }
}

pub fn descriptor() -> ToolDescriptor {
    let trigger = TimerTrigger::new();
    ToolDescriptor::trigger(
        "trigger_timer",
        "Start a workflow on a schedule: a fixed interval or a specific time on selected days.",
        trigger.parameters(),
        Arc::new(|| Box::new(TimerTrigger::new()) as Box<dyn Trigger>),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(s: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M").unwrap()
    }

    #[test]
    fn interval_schedules_map_to_minutes() {
        let s = Schedule::from_params(&json!({"schedule": "Every 15 Minutes"})).unwrap();
        assert_eq!(s, Schedule::Every(Duration::from_secs(900)));
        let s = Schedule::from_params(&json!({})).unwrap();
        assert_eq!(s, Schedule::Every(Duration::from_secs(60)));
    }

    #[test]
    fn unknown_schedule_names_are_rejected() {
        let err = Schedule::from_params(&json!({"schedule": "Fortnightly"})).unwrap_err();
        assert_eq!(err.to_string(), "Invalid schedule: Fortnightly");
        let err = Schedule::from_params(&json!({"scheduleType": "Cron"})).unwrap_err();
        assert_eq!(err.to_string(), "Invalid scheduleType: Cron");
        let err = Schedule::from_params(&Value::Null).unwrap_err();
        assert_eq!(err.to_string(), "Timer trigger node is missing parameters");
    }

    #[test]
    fn monthly_waits_for_the_first_and_is_capped() {
        // 2026-10-31 12:00 -> 2026-11-01 00:00 is 12 hours.
        let d = Schedule::Monthly.next_delay(at("2026-10-31 12:00"));
        assert_eq!(d, Duration::from_secs(12 * 3600));
        let d = Schedule::Monthly.next_delay(at("2026-12-31 00:00"));
        assert_eq!(d, Duration::from_secs(24 * 3600));
        let d = Schedule::Monthly.next_delay(at("2026-01-01 00:01"));
        assert_eq!(d, Duration::from_millis(MAX_WAIT_MS));
    }

    #[test]
    fn specific_time_skips_past_times_and_other_days() {
        let s = Schedule::from_params(&json!({
            "scheduleType": "Specific Time",
            "specificTime": "09:30",
            "specificDays": ["Monday", "Wednesday"]
        }))
        .unwrap();
        // 2026-10-12 is a Monday.
        assert_eq!(s.next_delay(at("2026-10-12 09:00")), Duration::from_secs(30 * 60));
        // Past today's slot, next is Wednesday.
        assert_eq!(
            s.next_delay(at("2026-10-12 10:00")),
            Duration::from_secs((47 * 60 + 30) * 60)
        );
    }

    #[test]
    fn validate_matches_node_id_only() {
        let node = TriggerNode {
            id: "n1".into(),
            workflow_id: "w".into(),
            parameters: json!({}),
        };
        let t = TimerTrigger::new();
        assert!(t.validate(&timer_event("n1"), &node));
        assert!(!t.validate(&timer_event("n2"), &node));
        assert!(!t.validate(&json!({"type": "webhook", "nodeId": "n1"}), &node));
    }
}
