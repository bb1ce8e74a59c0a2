//! Per-workflow step logs: one JSON object per line, appended as steps run.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::secret_mask::{self, SecretMask};
use crate::error::Result;
use crate::types::WorkflowId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stream {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Start,
    End,
}

/// One line of a workflow log file, also the frame streamed to log readers.
///
/// The field names are the wire format: `kind` (`data` or `control`), `idx`,
/// `time`, then `stream` and `content` for output lines, or `step_name` and
/// `step_status` (`start` or `end`) for step boundaries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum LogLine {
    Data {
        idx: usize,
        stream: Stream,
        content: String,
        time: DateTime<Utc>,
    },
    Control {
        idx: usize,
        step_name: String,
        step_status: StepStatus,
        time: DateTime<Utc>,
    },
}

#[must_use]
pub fn log_file_path(log_dir: &Path, wid: &WorkflowId) -> PathBuf {
    log_dir.join(format!("{wid}.log"))
}

pub trait WorkflowLogger: Send + Sync {
    /// One line of step output. Trailing newlines are dropped.
    fn data(&self, idx: usize, stream: Stream, line: &str);

    fn control(&self, idx: usize, step_name: &str, status: StepStatus);
}

/// Used when the log file cannot be opened.
pub struct NullLogger;

impl WorkflowLogger for NullLogger {
    fn data(&self, _idx: usize, _stream: Stream, _line: &str) {}
    fn control(&self, _idx: usize, _step_name: &str, _status: StepStatus) {}
}

pub struct FileLogger {
    file: Mutex<File>,
    mask: Option<SecretMask>,
}

impl FileLogger {
    pub fn open(log_dir: &Path, wid: &WorkflowId, secret_values: &[String]) -> Result<Self> {
        std::fs::create_dir_all(log_dir)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_file_path(log_dir, wid))?;
        Ok(Self {
            file: Mutex::new(file),
            mask: SecretMask::new(secret_values),
        })
    }

    fn write(&self, line: &LogLine) {
        let mut encoded = match serde_json::to_vec(line) {
            Ok(encoded) => encoded,
            Err(e) => {
                warn!(error = %e, "failed to encode log line");
                return;
            }
        };
        encoded.push(b'\n');
        // a single write per line keeps concurrent readers from seeing halves
        if let Err(e) = self.file.lock().write_all(&encoded) {
            warn!(error = %e, "failed to write log line");
        }
    }
}

impl WorkflowLogger for FileLogger {
    fn data(&self, idx: usize, stream: Stream, line: &str) {
        let line = line.trim_end_matches(['\r', '\n']);
        self.write(&LogLine::Data {
            idx,
            stream,
            content: secret_mask::apply(self.mask.as_ref(), line),
            time: Utc::now(),
        });
    }

    fn control(&self, idx: usize, step_name: &str, status: StepStatus) {
        self.write(&LogLine::Control {
            idx,
            step_name: step_name.to_string(),
            step_status: status,
            time: Utc::now(),
        });
    }
}

/// Reads every complete line written so far. A partially written last line is skipped.
pub fn read_log(log_dir: &Path, wid: &WorkflowId) -> Result<Vec<LogLine>> {
    let file = File::open(log_file_path(log_dir, wid))?;
    let mut lines = Vec::new();
    for raw in BufReader::new(file).lines() {
        let raw = raw?;
        if raw.trim().is_empty() {
            continue;
        }
        match serde_json::from_str(&raw) {
            Ok(line) => lines.push(line),
            Err(e) => warn!(error = %e, "skipping malformed log line"),
        }
    }
    Ok(lines)
}
