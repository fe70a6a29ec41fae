//! Structured logging for the facade and embedding hosts.
//!
//! [`JsonLineLayer`] captures each tracing event, formats it as a single
//! JSON line, and writes it to a sink (stderr for the facade). Stdout is
//! never touched so callers can parse the one-line tool result.

use std::fmt;
use std::io::Write;
use std::sync::Mutex;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

/// Environment variable that re-enables facade logging.
pub const DEBUG_ENV: &str = "TOOLGATE_TOOL_DEBUG";

/// Whether `TOOLGATE_TOOL_DEBUG` asks for logs.
pub fn debug_requested() -> bool {
    std::env::var(DEBUG_ENV)
        .map(|v| matches!(v.trim(), "1" | "true" | "yes"))
        .unwrap_or(false)
}

/// Install the global subscriber.
///
/// With `debug == false` everything is filtered out. Otherwise `RUST_LOG`
/// applies (default `debug`). Calling this twice is harmless.
pub fn init(debug: bool) {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = if debug {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug"))
    } else {
        tracing_subscriber::EnvFilter::new("off")
    };

    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(JsonLineLayer::new(std::io::stderr()))
        .try_init();
}

// ---------------------------------------------------------------------------
// Tracing layer
// ---------------------------------------------------------------------------

/// A [`tracing_subscriber::Layer`] that serialises events as JSON lines.
pub struct JsonLineLayer<W> {
    sink: Mutex<W>,
}

impl<W: Write + Send + 'static> JsonLineLayer<W> {
    pub fn new(sink: W) -> Self {
        Self {
            sink: Mutex::new(sink),
        }
    }
}

impl<S: Subscriber, W: Write + Send + 'static> Layer<S> for JsonLineLayer<W> {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let meta = event.metadata();

        let mut visitor = JsonVisitor::default();
        event.record(&mut visitor);

        let json = serde_json::json!({
            "level": level_str(meta.level()),
            "target": meta.target(),
            "message": visitor.message.unwrap_or_default(),
            "fields": visitor.fields,
            "ts": chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
        });

        if let Ok(line) = serde_json::to_string(&json) {
            let mut sink = self.sink.lock().unwrap_or_else(|e| e.into_inner());
            // Best-effort; a closed stderr must not take the tool down.
            let _ = writeln!(sink, "{line}");
            let _ = sink.flush();
        }
    }
}

fn level_str(level: &Level) -> &'static str {
    match *level {
        Level::ERROR => "ERROR",
        Level::WARN => "WARN",
        Level::INFO => "INFO",
        Level::DEBUG => "DEBUG",
        Level::TRACE => "TRACE",
    }
}

// ---------------------------------------------------------------------------
// Field visitor
// ---------------------------------------------------------------------------

#[derive(Default)]
struct JsonVisitor {
    message: Option<String>,
    fields: serde_json::Map<String, serde_json::Value>,
}

impl JsonVisitor {
    fn put(&mut self, field: &Field, value: serde_json::Value) {
        self.fields.insert(field.name().to_string(), value);
    }
}

impl Visit for JsonVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        let val = format!("{value:?}");
        if field.name() == "message" {
            self.message = Some(val);
        } else {
            self.put(field, serde_json::Value::String(val));
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = Some(value.to_string());
        } else {
            self.put(field, serde_json::Value::String(value.to_string()));
        }
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.put(field, serde_json::Value::Number(value.into()));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.put(field, serde_json::Value::Number(value.into()));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.put(field, serde_json::Value::Bool(value));
    }
}
