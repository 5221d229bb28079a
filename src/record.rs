use serde::{Deserialize, Serialize};

/// One parsed log entry.
///
/// Field names follow the structural tags emitted by the producer; `class` is renamed because
/// it is a keyword in most languages that consume the JSON output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    /// Milliseconds since the Unix epoch.
    #[serde(rename = "millis")]
    pub timestamp_millis: i64,
    #[serde(default)]
    pub sequence: u64,
    #[serde(default)]
    pub logger: String,
    #[serde(default)]
    pub level: String,
    #[serde(rename = "class", default)]
    pub class_name: String,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub thread: String,
    #[serde(default)]
    pub message: String,
}

impl LogRecord {
    /// Returns the method name when the record carries a non-blank one.
    pub fn method_name(&self) -> Option<&str> {
        self.method
            .as_deref()
            .map(str::trim)
            .filter(|method| !method.is_empty())
    }
}
