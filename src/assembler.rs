//! Record reassembly from raw log lines.
//!
//! The tailer hands over one line at a time. Lines are buffered until a line that trims to
//! `</record>` arrives; the buffered lines are then wrapped in a synthetic root element,
//! sanitized and passed to the deserializer. The buffer is cleared whether or not the
//! fragment parses.

use crate::deserializer::RecordDeserializer;
use crate::record::LogRecord;
use crate::sanitizer::sanitize;
use std::sync::Arc;

pub const RECORD_TERMINATOR: &str = "</record>";
const ROOT_OPEN: &str = "<records>";
const ROOT_CLOSE: &str = "</records>";

/// Outcome of a completed record.
#[derive(Debug)]
pub enum Assembled {
    Record(LogRecord),
    /// The fragment did not deserialize. It is kept for diagnostics only.
    Rejected {
        fragment: String,
        error: anyhow::Error,
    },
}

pub struct RecordAssembler {
    deserializer: Arc<dyn RecordDeserializer>,
    lines: Vec<String>,
}

impl RecordAssembler {
    pub fn new(deserializer: Arc<dyn RecordDeserializer>) -> Self {
        Self {
            deserializer,
            lines: Vec::new(),
        }
    }

    /// Buffer one raw line. Returns `Some` only when the line terminates a record.
    pub fn push_line(&mut self, raw_line: &str) -> Option<Assembled> {
        let line = raw_line.trim();
        if line.is_empty() {
            return None;
        }

        self.lines.push(line.to_string());
        if line != RECORD_TERMINATOR {
            return None;
        }

        let fragment = self.pending_fragment();
        self.lines.clear();

        Some(match self.deserializer.deserialize(&fragment) {
            Ok(record) => Assembled::Record(record),
            Err(error) => Assembled::Rejected { fragment, error },
        })
    }

    /// Sanitized, wrapped text of whatever is buffered right now.
    pub fn pending_fragment(&self) -> String {
        let capacity = ROOT_OPEN.len()
            + ROOT_CLOSE.len()
            + self.lines.iter().map(String::len).sum::<usize>();
        let mut wrapped = String::with_capacity(capacity);
        wrapped.push_str(ROOT_OPEN);
        for line in &self.lines {
            wrapped.push_str(line);
        }
        wrapped.push_str(ROOT_CLOSE);
        sanitize(&wrapped)
    }

    /// Number of buffered lines not yet closed by a terminator.
    pub fn backlog_len(&self) -> usize {
        self.lines.len()
    }
}

/// Truncates `text` to `limit` characters for log output.
pub(crate) fn preview(text: &str, limit: usize) -> String {
    let mut preview = String::new();
    for (idx, ch) in text.chars().enumerate() {
        if idx >= limit {
            preview.push('…');
            return preview;
        }
        preview.push(ch);
    }
    preview
}
