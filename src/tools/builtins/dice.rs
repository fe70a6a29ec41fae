//! Dice tools: a one-shot `roll_dice` and the long-running
//! `roll_dice_periodically`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde_json::{json, Value};

use crate::tools::async_exec::{AsyncRunStatus, AsyncTool, StepOutcome, StepPlan, Summary};
use crate::tools::{Tool, ToolContext, ToolDescriptor};

/// Largest die accepted by both tools.
const MAX_SIDES: u32 = 1_000_000;
/// Most dice rolled in one call or one periodic step.
const MAX_DICE: u32 = 100;
/// Most rolls one periodic run may plan.
const MAX_PERIODIC_ROLLS: u128 = 100_000;

fn roll(count: u32, sides: u32) -> Vec<u32> {
    let mut rng = rand::rng();
    (0..count).map(|_| rng.random_range(1..=sides)).collect()
}

fn sum(rolls: &[u32]) -> u64 {
    rolls.iter().map(|r| u64::from(*r)).sum()
}

// ── roll_dice ────────────────────────────────────────────────

/// `{ dieType: "d20", count?: 1..=100, modifier?: number }`
pub struct RollDice;

fn parse_die_type(raw: Option<&Value>) -> anyhow::Result<u32> {
    let die = raw.and_then(Value::as_str).unwrap_or("");
    let sides = die
        .strip_prefix('d')
        .filter(|rest| !rest.is_empty() && rest.bytes().all(|b| b.is_ascii_digit()))
        .and_then(|rest| rest.parse::<u32>().ok())
        .ok_or_else(|| anyhow::anyhow!("Invalid dieType \"{die}\". Expected format like \"d6\"."))?;
    if sides < 1 {
        anyhow::bail!("Die type \"{die}\" does not represent a valid number of sides.");
    }
    if sides > MAX_SIDES {
        anyhow::bail!("Die type \"{die}\" has too many sides (at most {MAX_SIDES}).");
    }
    Ok(sides)
}

fn roll_dice(params: &Value) -> anyhow::Result<Value> {
    let sides = parse_die_type(params.get("dieType"))?;

    let count = match params.get("count") {
        None | Some(Value::Null) => 1,
        Some(v) => v
            .as_u64()
            .filter(|c| (1..=100).contains(c))
            .ok_or_else(|| anyhow::anyhow!("Count must be an integer between 1 and 100. Received: {v}"))?
            as u32,
    };

    let modifier = match params.get("modifier") {
        None | Some(Value::Null) => 0.0,
        Some(v) => v
            .as_f64()
            .ok_or_else(|| anyhow::anyhow!("Modifier must be a number. Received: {v}"))?,
    };

    let rolls = roll(count, sides);
    let sum = sum(&rolls);
    let total = sum as f64 + modifier;
    tracing::debug!(?rolls, sum, modifier, total, "dice rolled");

    Ok(json!({
        "total": total,
        "individualRolls": rolls,
    }))
}

#[async_trait]
impl Tool for RollDice {
    async fn execute(&self, params: Value, _input: Value, _ctx: &ToolContext) -> anyhow::Result<Value> {
        // Bad dice input is a domain failure reported in the envelope,
        // not an executor failure.
        Ok(roll_dice(&params).unwrap_or_else(|e| {
            json!({
                "success": false,
                "total": null,
                "individualRolls": null,
                "error": e.to_string(),
            })
        }))
    }
}

pub fn descriptor() -> ToolDescriptor {
    ToolDescriptor::sync(
        "roll_dice",
        "Roll one or more dice of a given type (e.g. d6, d20) and add an optional modifier.",
        json!({
            "type": "object",
            "properties": {
                "dieType": {
                    "type": "string",
                    "pattern": "^d[0-9]+$",
                    "description": "Die to roll, written as d<sides> (e.g. \"d6\")."
                },
                "count": {
                    "type": "integer",
                    "minimum": 1,
                    "maximum": 100,
                    "description": "Number of dice to roll (default 1)."
                },
                "modifier": {
                    "type": "number",
                    "description": "Added to the sum of the rolls (default 0)."
                }
            },
            "required": ["dieType"],
            "additionalProperties": false
        }),
        Arc::new(RollDice),
    )
}

// ── roll_dice_periodically ───────────────────────────────────

/// Rolls `diceCount` dice every `intervalSeconds` for `durationMinutes`.
pub struct PeriodicDiceRoller;

struct PeriodicArgs {
    dice_count: u32,
    sides: u32,
    interval: Duration,
    duration: Duration,
}

impl PeriodicArgs {
    fn from_json(args: &Value) -> anyhow::Result<Self> {
        let num = |key: &str, default: f64| -> anyhow::Result<f64> {
            match args.get(key) {
                None | Some(Value::Null) => Ok(default),
                Some(v) => v
                    .as_f64()
                    .filter(|n| *n > 0.0 && n.is_finite())
                    .ok_or_else(|| anyhow::anyhow!("{key} must be a positive number, got {v}")),
            }
        };
        let dice_count = num("diceCount", 2.0)?;
        if dice_count > f64::from(MAX_DICE) {
            anyhow::bail!("diceCount must be at most {MAX_DICE}, got {dice_count}");
        }
        let sides = num("sides", 6.0)?;
        if sides > f64::from(MAX_SIDES) {
            anyhow::bail!("sides must be at most {MAX_SIDES}, got {sides}");
        }
        Ok(Self {
            dice_count: (dice_count as u32).max(1),
            sides: (sides as u32).max(1),
            interval: Duration::from_millis((num("intervalSeconds", 60.0)? * 1000.0).round() as u64),
            duration: Duration::from_millis((num("durationMinutes", 60.0)? * 60_000.0).round() as u64),
        })
    }
}

#[async_trait]
impl AsyncTool for PeriodicDiceRoller {
    fn name(&self) -> &str {
        "roll_dice_periodically"
    }

    fn description(&self) -> &str {
        "Roll dice periodically at specified intervals for a duration. This is a long-running \
         async tool that reports progress after each roll. Perfect for tasks like \"roll dice \
         every minute for an hour\"."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "diceCount": { "type": "number", "description": "Number of dice to roll each time (default: 2)" },
                "sides": { "type": "number", "description": "Number of sides on each die (default: 6)" },
                "intervalSeconds": { "type": "number", "description": "Interval between rolls in seconds (default: 60)" },
                "durationMinutes": { "type": "number", "description": "Total duration to keep rolling in minutes (default: 60)" }
            },
            "required": []
        })
    }

    fn estimated_duration(&self, args: &Value) -> Duration {
        let minutes = args
            .get("durationMinutes")
            .and_then(Value::as_f64)
            .filter(|m| *m > 0.0)
            .unwrap_or(60.0);
        Duration::from_millis((minutes * 60_000.0) as u64)
    }

    fn plan(&self, args: &Value) -> anyhow::Result<StepPlan> {
        let a = PeriodicArgs::from_json(args)?;
        if a.interval.is_zero() {
            anyhow::bail!("intervalSeconds is too small");
        }
        let steps = a.duration.as_millis() / a.interval.as_millis();
        if steps > MAX_PERIODIC_ROLLS {
            anyhow::bail!(
                "durationMinutes / intervalSeconds plans {steps} rolls, at most {MAX_PERIODIC_ROLLS} allowed"
            );
        }
        Ok(StepPlan { steps: steps as usize, interval: a.interval })
    }

    async fn step(&self, index: usize, args: &Value) -> anyhow::Result<StepOutcome> {
        let a = PeriodicArgs::from_json(args)?;
        let rolls = roll(a.dice_count, a.sides);
        let total = sum(&rolls);
        Ok(StepOutcome {
            data: json!({
                "rollNumber": index + 1,
                "rolls": rolls,
                "total": total,
            }),
            sample: Some(total as f64),
        })
    }

    fn finish(
        &self,
        args: &Value,
        steps: &[StepOutcome],
        summary: Option<Summary>,
        status: AsyncRunStatus,
    ) -> Value {
        let minutes = args.get("durationMinutes").and_then(Value::as_f64).unwrap_or(60.0);
        let all_rolls: Vec<&Value> = steps.iter().map(|s| &s.data).collect();
        let message = match status {
            AsyncRunStatus::Completed => {
                format!("Completed {} dice rolls over {minutes} minutes", steps.len())
            }
            AsyncRunStatus::Cancelled => {
                format!("Cancelled after {} dice rolls", steps.len())
            }
        };
        json!({
            "totalRolls": steps.len(),
            "allRolls": all_rolls,
            "summary": summary.map(|s| json!({
                "highest": s.highest,
                "lowest": s.lowest,
                "average": s.average.round(),
            })),
            "message": message,
        })
    }
}
