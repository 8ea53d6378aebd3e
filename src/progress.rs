//! Run progress reporting.
//!
//! Reports per-document progress during `extract`, `parse`, and `pipeline`
//! runs so users see what is being processed and how much is left.
//! Progress is emitted on **stderr** so stdout remains parseable for scripts.

use std::io::Write;

/// Stage of a run.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Stage {
    /// Walking the source directory. Total unknown.
    Scanning,
    /// Fingerprinting and extracting text from files.
    Extracting,
    /// Structuring text rows against a schema.
    Structuring,
}

impl Stage {
    fn as_str(self) -> &'static str {
        match self {
            Stage::Scanning => "scanning",
            Stage::Extracting => "extracting",
            Stage::Structuring => "structuring",
        }
    }
}

/// A single progress event.
#[derive(Clone, Debug)]
pub enum ProgressEvent {
    Scanning { table: String },
    /// `n` items of `total` done in `stage`.
    Item {
        stage: Stage,
        table: String,
        n: u64,
        total: u64,
    },
}

/// Reports run progress. Implementations write to stderr (human or JSON).
pub trait ProgressReporter: Send + Sync {
    fn report(&self, event: ProgressEvent);
}

/// Human-friendly progress on stderr: "extract claims  extracting  12 / 1,500 files".
pub struct StderrProgress;

impl ProgressReporter for StderrProgress {
    fn report(&self, event: ProgressEvent) {
        let line = match &event {
            ProgressEvent::Scanning { table } => format!("{}  scanning...\n", table),
            ProgressEvent::Item {
                stage,
                table,
                n,
                total,
            } => {
                let unit = match stage {
                    Stage::Structuring => "rows",
                    _ => "files",
                };
                format!(
                    "{}  {}  {} / {} {}\n",
                    table,
                    stage.as_str(),
                    format_number(*n),
                    format_number(*total),
                    unit
                )
            }
        };
        let mut stderr = std::io::stderr().lock();
        let _ = stderr.write_all(line.as_bytes());
        let _ = stderr.flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl ProgressReporter for JsonProgress {
    fn report(&self, event: ProgressEvent) {
        let obj = match &event {
            ProgressEvent::Scanning { table } => serde_json::json!({
                "event": "progress",
                "table": table,
                "stage": Stage::Scanning.as_str(),
            }),
            ProgressEvent::Item {
                stage,
                table,
                n,
                total,
            } => serde_json::json!({
                "event": "progress",
                "table": table,
                "stage": stage.as_str(),
                "n": n,
                "total": total
            }),
        };
        let mut stderr = std::io::stderr().lock();
        let _ = writeln!(stderr, "{}", obj);
        let _ = stderr.flush();
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl ProgressReporter for NoProgress {
    fn report(&self, _event: ProgressEvent) {}
}

pub fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    for (i, c) in s.chars().rev().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq, clap::ValueEnum)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> Box<dyn ProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}
