use crate::record::LogRecord;
use anyhow::{Context, Result};
use serde::Deserialize;

/// Converts a sanitized, root-wrapped fragment into a `LogRecord`.
///
/// Errors are per-record: the assembler logs and drops the fragment, tailing carries on.
pub trait RecordDeserializer: Send + Sync {
    fn deserialize(&self, fragment: &str) -> Result<LogRecord>;
}

/// `quick-xml` backed deserializer for `<records><record>..</record></records>` fragments.
///
/// The root element name is not checked. Unknown child elements (`<date>`, `<nanos>`) and stray
/// text before the record are ignored.
#[derive(Debug, Default, Clone, Copy)]
pub struct XmlRecordDeserializer;

#[derive(Deserialize)]
struct Fragment {
    record: LogRecord,
}

impl RecordDeserializer for XmlRecordDeserializer {
    fn deserialize(&self, fragment: &str) -> Result<LogRecord> {
        let parsed: Fragment =
            quick_xml::de::from_str(fragment).context("failed to deserialize log record")?;
        Ok(parsed.record)
    }
}
