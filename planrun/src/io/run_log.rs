//! Product run log: one redacted JSON record per line.
//!
//! Every record carries the same correlation stamp (`trace_id` for the run,
//! `group_id` for the current step attempt or iteration, a fresh `span_id`)
//! so a run can be filtered down to a single attempt. The file is opened in
//! append mode and flushed after each record; nothing is ever rewritten.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rand::Rng;
use serde::Serialize;
use serde_json::{Map, Value, json};
use tracing::{debug, warn};

use crate::core::redact::redact_value;
use crate::io::config::OutputMode;
use crate::io::telemetry::{OtlpConfig, OtlpExporter};

/// Fields stamped by the logger; contextual fields never override them.
const STAMPED_FIELDS: [&str; 8] = [
    "event",
    "level",
    "timestamp",
    "provider",
    "model",
    "trace_id",
    "group_id",
    "span_id",
];

/// Longest field value shown in the text rendering.
const TEXT_FIELD_LIMIT: usize = 160;

const LOG_FILE_PREFIX: &str = "run-";
const LOG_FILE_EXTENSION: &str = "jsonl";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Info,
    Warn,
    Error,
}

impl Level {
    pub fn as_str(self) -> &'static str {
        match self {
            Level::Info => "info",
            Level::Warn => "warn",
            Level::Error => "error",
        }
    }
}

/// Correlation group for the records that follow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Group {
    /// Outside the loop (bootstrap, final summary).
    Run,
    /// Inside an iteration with no active step.
    Iteration(u32),
    /// One attempt at one step.
    Step { step_id: String, iteration: u32 },
}

impl Group {
    pub fn id(&self) -> String {
        match self {
            Group::Run => "run".to_string(),
            Group::Iteration(iteration) => format!("iter-{iteration}"),
            Group::Step { step_id, iteration } => format!("{step_id}@{iteration}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunLogSettings {
    pub path: PathBuf,
    pub output: OutputMode,
    /// Directory pruned at startup; only `run-*.jsonl` files are touched.
    pub retention_dir: PathBuf,
    pub retention_days: u32,
    pub otlp: Option<OtlpConfig>,
    pub provider: String,
    pub model: String,
}

pub struct RunLogger {
    path: PathBuf,
    file: File,
    output: OutputMode,
    provider: String,
    model: String,
    trace_id: String,
    group: Group,
    exporter: Option<OtlpExporter>,
}

impl RunLogger {
    /// Open (or create) the log file, prune expired logs and start the
    /// exporter when one is configured.
    pub fn open(settings: RunLogSettings) -> Result<Self> {
        if let Some(parent) = settings.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)
                .with_context(|| format!("create log dir {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&settings.path)
            .with_context(|| format!("open run log {}", settings.path.display()))?;

        let exporter = match settings.otlp {
            Some(config) => match OtlpExporter::start(config) {
                Ok(exporter) => Some(exporter),
                Err(err) => {
                    warn!(err = %format!("{err:#}"), "OTLP export disabled");
                    None
                }
            },
            None => None,
        };

        let mut logger = Self {
            path: settings.path,
            file,
            output: settings.output,
            provider: settings.provider,
            model: settings.model,
            trace_id: random_hex::<16>(),
            group: Group::Run,
            exporter,
        };
        debug!(path = %logger.path.display(), trace_id = %logger.trace_id, "run log opened");

        let max_age = Duration::from_secs(u64::from(settings.retention_days) * 24 * 60 * 60);
        let deleted = prune_logs(
            &settings.retention_dir,
            max_age,
            SystemTime::now(),
            &logger.path,
        )?;
        logger.info(
            "log_retention",
            json!({
                "deleted": deleted,
                "retention_days": settings.retention_days,
                "dir": settings.retention_dir.display().to_string(),
            }),
        )?;
        Ok(logger)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    pub fn group(&self) -> &Group {
        &self.group
    }

    pub fn set_group(&mut self, group: Group) {
        self.group = group;
    }

    pub fn info(&mut self, event: &str, fields: Value) -> Result<()> {
        self.log(Level::Info, event, fields)
    }

    pub fn warn(&mut self, event: &str, fields: Value) -> Result<()> {
        self.log(Level::Warn, event, fields)
    }

    pub fn error(&mut self, event: &str, fields: Value) -> Result<()> {
        self.log(Level::Error, event, fields)
    }

    /// Stamp, redact and append one record.
    ///
    /// `fields` should be a JSON object; anything else is stored under `data`.
    pub fn log(&mut self, level: Level, event: &str, fields: Value) -> Result<()> {
        let record = self.build_record(level, event, fields);
        self.write_record(&record)?;
        if let Some(exporter) = self.exporter.as_mut() {
            exporter.export(&record);
        }
        self.report_export_failure()
    }

    fn build_record(&self, level: Level, event: &str, fields: Value) -> Value {
        let mut record = match fields {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("data".to_string(), other);
                map
            }
        };
        let stamp = [
            ("event", Value::from(event)),
            ("level", Value::from(level.as_str())),
            (
                "timestamp",
                Value::from(Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)),
            ),
            ("provider", Value::from(self.provider.as_str())),
            ("model", Value::from(self.model.as_str())),
            ("trace_id", Value::from(self.trace_id.as_str())),
            ("group_id", Value::from(self.group.id())),
            ("span_id", Value::from(random_hex::<8>())),
        ];
        for (key, value) in stamp {
            record.insert(key.to_string(), value);
        }
        let mut record = Value::Object(record);
        redact_value(&mut record);
        record
    }

    fn write_record(&mut self, record: &Value) -> Result<()> {
        let line = serde_json::to_string(record).context("serialize run-log record")?;
        writeln!(self.file, "{line}")
            .and_then(|()| self.file.flush())
            .with_context(|| format!("append run log {}", self.path.display()))?;
        if self.output == OutputMode::Text {
            let mut stdout = std::io::stdout().lock();
            writeln!(stdout, "{}", render_text(record)).context("write run log to stdout")?;
        }
        Ok(())
    }

    /// Record the first export failure once, in the file only.
    fn report_export_failure(&mut self) -> Result<()> {
        let Some(message) = self.exporter.as_mut().and_then(OtlpExporter::take_failure) else {
            return Ok(());
        };
        let record = self.build_record(
            Level::Warn,
            "telemetry_warning",
            json!({ "message": message }),
        );
        self.write_record(&record)
    }
}

impl Drop for RunLogger {
    fn drop(&mut self) {
        if let Some(exporter) = &self.exporter
            && exporter.dropped() > 0
        {
            warn!(dropped = exporter.dropped(), "run-log records dropped by OTLP export queue");
        }
    }
}

/// `<dir>/run-<UTC yyyymmdd-HHMMSS>.jsonl`
pub fn default_log_path(dir: &Path, now: DateTime<Utc>) -> PathBuf {
    dir.join(format!(
        "{LOG_FILE_PREFIX}{}.{LOG_FILE_EXTENSION}",
        now.format("%Y%m%d-%H%M%S")
    ))
}

/// Delete run logs in `dir` whose mtime is older than `max_age`, except `keep`.
///
/// A missing directory is not an error. Returns the number of deleted files.
pub fn prune_logs(dir: &Path, max_age: Duration, now: SystemTime, keep: &Path) -> Result<usize> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(err) => return Err(err).with_context(|| format!("read log dir {}", dir.display())),
    };
    let mut deleted = 0;
    for entry in entries {
        let entry = entry.with_context(|| format!("read log dir {}", dir.display()))?;
        let path = entry.path();
        if !is_run_log(&path) || same_file(&path, keep) {
            continue;
        }
        let modified = match entry.metadata().and_then(|meta| meta.modified()) {
            Ok(modified) => modified,
            Err(err) => {
                warn!(path = %path.display(), %err, "cannot read log mtime");
                continue;
            }
        };
        let age = now.duration_since(modified).unwrap_or_default();
        if age > max_age {
            fs::remove_file(&path)
                .with_context(|| format!("remove expired log {}", path.display()))?;
            deleted += 1;
        }
    }
    Ok(deleted)
}

fn is_run_log(path: &Path) -> bool {
    path.is_file()
        && path.extension().is_some_and(|ext| ext == LOG_FILE_EXTENSION)
        && path
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| name.starts_with(LOG_FILE_PREFIX))
}

fn same_file(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}

fn random_hex<const N: usize>() -> String {
    let mut bytes = [0u8; N];
    rand::thread_rng().fill(&mut bytes[..]);
    hex::encode(bytes)
}

/// `HH:MM:SS LEVEL group event key=value ...`
fn render_text(record: &Value) -> String {
    let field = |key: &str| record.get(key).and_then(Value::as_str).unwrap_or_default();
    let time = field("timestamp").get(11..19).unwrap_or_default();
    let mut line = format!(
        "{time} {:<5} {} {}",
        field("level").to_ascii_uppercase(),
        field("group_id"),
        field("event")
    );
    if let Some(map) = record.as_object() {
        for (key, value) in map {
            if STAMPED_FIELDS.contains(&key.as_str()) {
                continue;
            }
            let rendered = match value {
                Value::String(s) if !s.contains(char::is_whitespace) && !s.is_empty() => s.clone(),
                other => other.to_string(),
            };
            line.push(' ');
            line.push_str(key);
            line.push('=');
            line.push_str(&clip(&rendered, TEXT_FIELD_LIMIT).replace('\n', "\\n"));
        }
    }
    line
}

fn clip(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}
