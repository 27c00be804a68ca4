use std::collections::BTreeMap;
use std::fmt;

use chrono::Utc;
use serde_json::{Map, Value};
use tracing::field::{Field, Visit};
use tracing::span::{Attributes, Id, Record};
use tracing::{Event, Level, Subscriber};
use tracing_error::ErrorLayer;
use tracing_subscriber::fmt::{format::Writer, FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::layer::Context;
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{EnvFilter, Layer, Registry};

const DEFAULT_DIRECTIVE: &str = "splat_orchestrator=info";
const PROCESS_TARGET: &str = "splat_orchestrator::process";

const RESET: &str = "\x1b[0m";
const DIM: &str = "\x1b[90m";
const CYAN: &str = "\x1b[96m";
const GREEN: &str = "\x1b[92m";
const WHITE: &str = "\x1b[97m";

/// Fields recorded on a span or an event, in name order
#[derive(Debug, Clone, Default)]
pub struct RecordedFields(BTreeMap<&'static str, Value>);

impl RecordedFields {
    fn get(&self, name: &str) -> Option<String> {
        self.0.get(name).map(|value| match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
    }
}

impl Visit for RecordedFields {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        let text = format!("{value:?}").trim_matches('"').to_string();
        self.0.insert(field.name(), Value::String(text));
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.0.insert(field.name(), Value::String(value.to_string()));
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.0.insert(field.name(), Value::from(value));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.0.insert(field.name(), Value::from(value));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.0.insert(field.name(), Value::from(value));
    }
}

/// Keeps every span's fields in its extensions so formatters can read the job and stage of an
/// event
pub struct FieldCollectorLayer;

impl<S> Layer<S> for FieldCollectorLayer
where
    S: Subscriber + for<'lookup> LookupSpan<'lookup>,
{
    fn on_new_span(&self, attrs: &Attributes<'_>, id: &Id, ctx: Context<'_, S>) {
        let Some(span) = ctx.span(id) else {
            return;
        };
        let mut fields = RecordedFields::default();
        attrs.record(&mut fields);
        span.extensions_mut().insert(fields);
    }

    fn on_record(&self, id: &Id, values: &Record<'_>, ctx: Context<'_, S>) {
        let Some(span) = ctx.span(id) else {
            return;
        };
        let mut extensions = span.extensions_mut();
        match extensions.get_mut::<RecordedFields>() {
            Some(fields) => values.record(fields),
            None => {
                let mut fields = RecordedFields::default();
                values.record(&mut fields);
                extensions.insert(fields);
            }
        }
    }
}

/// Job and stage an event belongs to, plus every span field in scope
#[derive(Default)]
struct EventScope {
    job: Option<String>,
    partition: Option<String>,
    stage: Option<String>,
    fields: Map<String, Value>,
}

impl EventScope {
    fn from_context<S, N>(ctx: &FmtContext<'_, S, N>) -> Self
    where
        S: Subscriber + for<'a> LookupSpan<'a>,
        N: for<'a> FormatFields<'a> + 'static,
    {
        let mut scope = Self::default();
        let Some(spans) = ctx.event_scope() else {
            return scope;
        };
        // Root first, so inner spans overwrite outer ones
        for span in spans.from_root() {
            let extensions = span.extensions();
            let Some(fields) = extensions.get::<RecordedFields>() else {
                continue;
            };
            scope.job = fields.get("job_id").or(scope.job);
            scope.partition = fields.get("partition").or(scope.partition);
            scope.stage = fields.get("stage").or(scope.stage);
            scope.fields.extend(fields.0.iter().map(|(name, value)| (name.to_string(), value.clone())));
        }
        scope
    }

    fn stage_column(&self) -> String {
        match (&self.partition, &self.stage) {
            (Some(partition), Some(stage)) => format!("{partition}/{stage}"),
            (None, Some(stage)) => stage.clone(),
            (Some(partition), None) => partition.clone(),
            (None, None) => "-".to_string(),
        }
    }
}

/// Short label for the source column
fn source_label(target: &str) -> &'static str {
    if target.starts_with(PROCESS_TARGET) {
        "PROCESS"
    } else if target.starts_with("splat_orchestrator") {
        "-"
    } else if target.starts_with("aws") {
        "AWS"
    } else if target.starts_with("tokio_postgres") {
        "PG"
    } else {
        "EXTERNAL"
    }
}

fn level_color(level: &Level) -> &'static str {
    match *level {
        Level::TRACE => "\x1b[90m",
        Level::DEBUG => "\x1b[34m",
        Level::INFO => "\x1b[32m",
        Level::WARN => "\x1b[33m",
        Level::ERROR => "\x1b[31m",
    }
}

/// Event layout, picked from `LOG_FORMAT`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventFormat {
    /// Columns for the console: time | level | job | partition/stage | source | message (fields)
    Pretty,
    /// One JSON object per line
    Json,
}

impl EventFormat {
    pub fn from_env() -> Self {
        match std::env::var("LOG_FORMAT").as_deref() {
            Ok("json") => EventFormat::Json,
            _ => EventFormat::Pretty,
        }
    }

    fn write_pretty(
        &self,
        writer: &mut Writer<'_>,
        event: &Event<'_>,
        scope: &EventScope,
        fields: RecordedFields,
    ) -> fmt::Result {
        let meta = event.metadata();
        let mut fields = fields.0;
        let message = fields.remove("message").map(|message| match message {
            Value::String(s) => s,
            other => other.to_string(),
        });
        // Already shown in the job column
        if scope.job.is_some() {
            fields.remove("job_id");
        }

        write!(writer, "{CYAN}{}{RESET} {DIM}|{RESET} ", Utc::now().format("%y-%m-%d %H:%M:%S"))?;
        write!(writer, "{}{:<5}{RESET} {DIM}|{RESET} ", level_color(meta.level()), meta.level())?;
        write!(writer, "{GREEN}{:<8}{RESET} {DIM}|{RESET} ", scope.job.as_deref().unwrap_or("-"))?;
        write!(writer, "{GREEN}{:<24}{RESET} {DIM}|{RESET} ", scope.stage_column())?;
        write!(writer, "{GREEN}{:<8}{RESET} {DIM}|{RESET} ", source_label(meta.target()))?;
        write!(writer, "{WHITE}{}{RESET}", message.unwrap_or_default())?;

        if !fields.is_empty() {
            let rendered: Vec<String> = fields
                .iter()
                .map(|(name, value)| match value {
                    Value::String(s) => format!("{DIM}{name}={s}{RESET}"),
                    other => format!("{DIM}{name}={other}{RESET}"),
                })
                .collect();
            write!(writer, " ({})", rendered.join(", "))?;
        }
        writeln!(writer)
    }

    fn write_json(
        &self,
        writer: &mut Writer<'_>,
        event: &Event<'_>,
        scope: EventScope,
        fields: RecordedFields,
    ) -> fmt::Result {
        let meta = event.metadata();
        let mut root = Map::new();
        root.insert("timestamp".into(), Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true).into());
        root.insert("level".into(), meta.level().to_string().into());
        root.insert("target".into(), meta.target().into());
        root.insert("source".into(), source_label(meta.target()).into());
        if let (Some(file), Some(line)) = (meta.file(), meta.line()) {
            root.insert("location".into(), format!("{file}:{line}").into());
        }
        for (key, value) in [("job_id", &scope.job), ("partition", &scope.partition), ("stage", &scope.stage)] {
            if let Some(value) = value {
                root.insert(key.into(), value.clone().into());
            }
        }

        let mut all_fields = scope.fields;
        for (name, value) in fields.0 {
            if name == "message" {
                root.insert("message".into(), value);
            } else {
                all_fields.insert(name.to_string(), value);
            }
        }
        if !all_fields.is_empty() {
            root.insert("fields".into(), Value::Object(all_fields));
        }

        let line = serde_json::to_string(&Value::Object(root)).map_err(|_| fmt::Error)?;
        writeln!(writer, "{line}")
    }
}

impl<S, N> FormatEvent<S, N> for EventFormat
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(&self, ctx: &FmtContext<'_, S, N>, mut writer: Writer<'_>, event: &Event<'_>) -> fmt::Result {
        let scope = EventScope::from_context(ctx);
        let mut fields = RecordedFields::default();
        event.record(&mut fields);

        match self {
            EventFormat::Pretty => self.write_pretty(&mut writer, event, &scope, fields),
            EventFormat::Json => self.write_json(&mut writer, event, scope, fields),
        }
    }
}

/// Initialize the tracing subscriber with the [`EventFormat`] chosen by `LOG_FORMAT`, filtered by
/// `RUST_LOG` (falling back to `splat_orchestrator=info`).
///
/// This will also install color_eyre to handle the panic in the application
pub fn init_logging() {
    color_eyre::install().expect("Unable to install color_eyre");

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::builder()
            .with_default_directive(Level::INFO.into())
            .parse(DEFAULT_DIRECTIVE)
            .expect("Invalid filter directive and Logger control")
    });

    let fmt_layer = tracing_subscriber::fmt::layer().event_format(EventFormat::from_env());
    let subscriber = Registry::default()
        .with(env_filter)
        .with(FieldCollectorLayer)
        .with(fmt_layer)
        .with(ErrorLayer::default());
    tracing::subscriber::set_global_default(subscriber).expect("Failed to set global default subscriber");
}
