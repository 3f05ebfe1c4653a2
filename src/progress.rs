//! Indexing progress reporting.
//!
//! Reports observable progress during `docgraph index` and background index
//! jobs so users see which document is being processed, how many are left,
//! and whether the collection was written. CLI progress goes to **stderr** so
//! stdout remains parseable for scripts.

use serde::Serialize;
use std::io::Write;
use std::sync::Mutex;

/// A single progress event for a batch index run.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum IndexProgressEvent {
    /// Document `n` of `total` is being chunked, embedded, and summarized.
    Indexing { document: String, n: usize, total: usize },
    /// The document's index was saved.
    Indexed { document: String, chunks: usize },
    /// The document failed; the batch continues.
    Failed { document: String, error: String },
    /// Building the collection from `children` indices.
    Composing { collection: String, children: usize },
    /// The collection was persisted.
    Saved { collection: String },
}

/// Receives progress events. Called from the indexing pipeline.
pub trait IndexProgressReporter: Send + Sync {
    fn report(&self, event: IndexProgressEvent);
}

/// Human-friendly progress on stderr: "index [2/5] report.pdf".
pub struct StderrProgress;

impl IndexProgressReporter for StderrProgress {
    fn report(&self, event: IndexProgressEvent) {
        let line = match &event {
            IndexProgressEvent::Indexing { document, n, total } => {
                format!("index [{}/{}] {}\n", n, total, document)
            }
            IndexProgressEvent::Indexed { document, chunks } => {
                format!("index {}  {} chunks\n", document, chunks)
            }
            IndexProgressEvent::Failed { document, error } => {
                format!("index {}  FAILED: {}\n", document, error)
            }
            IndexProgressEvent::Composing {
                collection,
                children,
            } => format!("compose {}  {} indices\n", collection, children),
            IndexProgressEvent::Saved { collection } => format!("saved {}\n", collection),
        };
        let mut stderr = std::io::stderr().lock();
        let _ = stderr.write_all(line.as_bytes());
        let _ = stderr.flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl IndexProgressReporter for JsonProgress {
    fn report(&self, event: IndexProgressEvent) {
        let mut obj = serde_json::json!({ "event": "progress" });
        if let (Some(map), Ok(serde_json::Value::Object(fields))) =
            (obj.as_object_mut(), serde_json::to_value(&event))
        {
            map.extend(fields);
        }
        if let Ok(line) = serde_json::to_string(&obj) {
            let mut stderr = std::io::stderr().lock();
            let _ = writeln!(stderr, "{}", line);
            let _ = stderr.flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl IndexProgressReporter for NoProgress {
    fn report(&self, _event: IndexProgressEvent) {}
}

/// Keeps every event in memory; backs the HTTP job status endpoint.
#[derive(Default)]
pub struct RecordingProgress {
    events: Mutex<Vec<IndexProgressEvent>>,
}

impl RecordingProgress {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<IndexProgressEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    pub fn last(&self) -> Option<IndexProgressEvent> {
        self.events.lock().ok().and_then(|events| events.last().cloned())
    }
}

impl IndexProgressReporter for RecordingProgress {
    fn report(&self, event: IndexProgressEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
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

    pub fn reporter(&self) -> Box<dyn IndexProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}
