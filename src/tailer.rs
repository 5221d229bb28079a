use crate::assembler::{preview, Assembled, RecordAssembler};
use crate::consumer::LogConsumer;
use crate::deserializer::RecordDeserializer;
use crate::error::TailError;
use crate::metrics;
use crate::queue::PendingFileQueue;
use crate::record::LogRecord;
use anyhow::Result;
use std::collections::HashSet;
use std::ffi::OsStr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tokio::io::{AsyncBufReadExt, AsyncSeekExt, BufReader, SeekFrom};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);
const SHORTCUT_EXTENSION: &str = "lnk";
const FRAGMENT_PREVIEW_LIMIT: usize = 512;

/// Configuration for the log tailer.
#[derive(Debug, Clone)]
pub struct TailerConfig {
    /// Position the first file at its current end before parsing.
    pub skip_to_end: bool,
    /// Delay before re-polling a file that has no new data.
    pub poll_interval: Duration,
    /// Methods worth forwarding; empty accepts any non-blank method.
    pub methods: Vec<String>,
}

impl Default for TailerConfig {
    fn default() -> Self {
        Self {
            skip_to_end: false,
            poll_interval: DEFAULT_POLL_INTERVAL,
            methods: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TailPhase {
    Idle,
    Positioning,
    Reading,
    WaitingForData,
    Switching,
    Shutdown,
}

/// Per-run state owned by the tailer. Observers see it through the consumer.
#[derive(Debug)]
struct TailerState {
    phase: TailPhase,
    /// Cleared for good once the first file has been positioned.
    skip_to_end: bool,
    working: bool,
    /// Set once the tailer has reached the live end of some file.
    initialized: bool,
    backlog: usize,
}

enum FileOutcome {
    Skipped,
    Switched,
    Shutdown,
}

enum Interest {
    Forward,
    NoMethod,
    FilteredMethod,
}

async fn sleep_or_cancel(duration: Duration, cancel_token: &CancellationToken) -> bool {
    tokio::select! {
        biased;
        _ = cancel_token.cancelled() => true,
        _ = sleep(duration) => false,
    }
}

/// Consumes queued log files one at a time and forwards reassembled records.
///
/// At the end of a file the tailer either switches to the next queued path (abandoning any
/// unread tail) or, when nothing is queued, keeps the file open and re-polls it after
/// `poll_interval` since the producer may still be appending.
pub struct LogTailer {
    queue: Arc<PendingFileQueue>,
    consumer: Arc<dyn LogConsumer>,
    deserializer: Arc<dyn RecordDeserializer>,
    poll_interval: Duration,
    methods: HashSet<String>,
    cancel_token: CancellationToken,
    state: TailerState,
}

impl LogTailer {
    pub fn new(
        queue: Arc<PendingFileQueue>,
        consumer: Arc<dyn LogConsumer>,
        deserializer: Arc<dyn RecordDeserializer>,
        config: TailerConfig,
        cancel_token: CancellationToken,
    ) -> Self {
        let poll_interval = if config.poll_interval.is_zero() {
            DEFAULT_POLL_INTERVAL
        } else {
            config.poll_interval
        };

        Self {
            queue,
            consumer,
            deserializer,
            poll_interval,
            methods: config.methods.into_iter().collect(),
            cancel_token,
            state: TailerState {
                phase: TailPhase::Idle,
                skip_to_end: config.skip_to_end,
                working: false,
                initialized: false,
                backlog: 0,
            },
        }
    }

    /// Runs until cancelled (`Ok`) or until a file cannot be read (`Err`).
    pub async fn run(mut self) -> Result<()> {
        info!(
            skip_to_end = self.state.skip_to_end,
            poll_interval_ms = self.poll_interval.as_millis() as u64,
            "log tailer started"
        );

        loop {
            self.transition(TailPhase::Idle);
            if self.cancel_token.is_cancelled() {
                break;
            }

            let Some(path) = self.queue.dequeue(&self.cancel_token).await else {
                break;
            };
            self.report_backlog();

            match self.tail_file(&path).await {
                Ok(FileOutcome::Shutdown) => break,
                Ok(FileOutcome::Skipped) | Ok(FileOutcome::Switched) => {}
                Err(err) => {
                    self.force_working(false);
                    warn!(error = %err, path = %path.display(), "log tailer aborted");
                    return Err(err);
                }
            }
        }

        self.transition(TailPhase::Shutdown);
        self.force_working(false);
        info!("log tailer stopped");
        Ok(())
    }

    async fn tail_file(&mut self, path: &Path) -> Result<FileOutcome> {
        info!(path = %path.display(), backlog = self.state.backlog, "next log file");

        if path.extension() == Some(OsStr::new(SHORTCUT_EXTENSION)) {
            debug!(path = %path.display(), "ignoring shortcut file");
            metrics::FILES_SKIPPED_TOTAL
                .with_label_values(&["shortcut"])
                .inc();
            return Ok(FileOutcome::Skipped);
        }
        match fs::metadata(path).await {
            Ok(meta) if meta.is_file() => {}
            Ok(_) | Err(_) => {
                debug!(path = %path.display(), "ignoring path that is not a regular file");
                metrics::FILES_SKIPPED_TOTAL
                    .with_label_values(&["not_a_file"])
                    .inc();
                return Ok(FileOutcome::Skipped);
            }
        }

        self.consumer.set_current_file(path);

        let file = fs::File::open(path)
            .await
            .map_err(|source| TailError::Open {
                path: path.to_path_buf(),
                source,
            })?;
        metrics::FILES_OPENED_TOTAL.inc();
        let mut reader = BufReader::new(file);

        self.transition(TailPhase::Reading);
        if self.state.skip_to_end {
            self.position_at_end(path, &mut reader).await?;
        }

        info!(path = %path.display(), "start interpreting entries");
        let mut assembler = RecordAssembler::new(self.deserializer.clone());
        let mut pending: Vec<u8> = Vec::new();

        loop {
            if self.cancel_token.is_cancelled() {
                return Ok(FileOutcome::Shutdown);
            }

            if let Err(source) = reader.read_until(b'\n', &mut pending).await {
                warn!(
                    path = %path.display(),
                    fragment = %preview(&assembler.pending_fragment(), FRAGMENT_PREVIEW_LIMIT),
                    "read failed; unfinished record discarded"
                );
                return Err(TailError::Read {
                    path: path.to_path_buf(),
                    source,
                }
                .into());
            }

            if pending.last() == Some(&b'\n') {
                metrics::LINES_READ_TOTAL.inc();
                self.set_working(true);
                let outcome = assembler.push_line(&String::from_utf8_lossy(&pending));
                pending.clear();
                if let Some(outcome) = outcome {
                    self.handle_assembled(outcome)?;
                }
                continue;
            }

            // end of stream; `pending` may hold the start of a line still being written
            self.set_initialized(true);

            if !self.queue.is_empty() {
                self.transition(TailPhase::Switching);
                if !pending.is_empty() || assembler.backlog_len() > 0 {
                    debug!(
                        path = %path.display(),
                        partial_bytes = pending.len(),
                        buffered_lines = assembler.backlog_len(),
                        "abandoning unterminated data"
                    );
                }
                info!(path = %path.display(), "current file done and successor queued");
                return Ok(FileOutcome::Switched);
            }

            self.transition(TailPhase::WaitingForData);
            self.set_working(false);
            if sleep_or_cancel(self.poll_interval, &self.cancel_token).await {
                return Ok(FileOutcome::Shutdown);
            }
            self.transition(TailPhase::Reading);
        }
    }

    async fn position_at_end(
        &mut self,
        path: &Path,
        reader: &mut BufReader<fs::File>,
    ) -> Result<()> {
        self.transition(TailPhase::Positioning);
        let offset = reader
            .seek(SeekFrom::End(0))
            .await
            .map_err(|source| TailError::Read {
                path: path.to_path_buf(),
                source,
            })?;

        self.state.skip_to_end = false;
        self.set_initialized(true);
        info!(path = %path.display(), offset, "skipped to end of log file");
        self.transition(TailPhase::Reading);
        Ok(())
    }

    fn handle_assembled(&mut self, outcome: Assembled) -> Result<()> {
        let record = match outcome {
            Assembled::Record(record) => record,
            Assembled::Rejected { fragment, error } => {
                metrics::RECORDS_DROPPED_TOTAL
                    .with_label_values(&["parse_error"])
                    .inc();
                debug!(
                    error = %format!("{error:#}"),
                    fragment = %preview(&fragment, FRAGMENT_PREVIEW_LIMIT),
                    "dropping unparsable record"
                );
                return Ok(());
            }
        };

        metrics::RECORDS_PARSED_TOTAL.inc();
        metrics::LAST_ENTRY_MILLIS.set(record.timestamp_millis);
        self.consumer.set_last_entry_timestamp(record.timestamp_millis);

        match self.interest(&record) {
            Interest::Forward => {
                self.consumer.accept(record)?;
                metrics::RECORDS_FORWARDED_TOTAL.inc();
            }
            Interest::NoMethod => {
                metrics::RECORDS_DROPPED_TOTAL
                    .with_label_values(&["no_method"])
                    .inc();
            }
            Interest::FilteredMethod => {
                metrics::RECORDS_DROPPED_TOTAL
                    .with_label_values(&["filtered_method"])
                    .inc();
            }
        }
        Ok(())
    }

    fn interest(&self, record: &LogRecord) -> Interest {
        match record.method_name() {
            None => Interest::NoMethod,
            Some(method) if !self.methods.is_empty() && !self.methods.contains(method) => {
                Interest::FilteredMethod
            }
            Some(_) => Interest::Forward,
        }
    }

    fn report_backlog(&mut self) {
        let backlog = self.queue.len();
        self.state.backlog = backlog;
        metrics::BACKLOG_FILES.set(backlog as i64);
        self.consumer.set_backlog_count(backlog);
    }

    fn set_working(&mut self, working: bool) {
        if self.state.working != working {
            self.force_working(working);
        }
    }

    fn force_working(&mut self, working: bool) {
        self.state.working = working;
        self.consumer.set_working(working);
    }

    fn set_initialized(&mut self, initialized: bool) {
        if self.state.initialized != initialized {
            self.state.initialized = initialized;
            self.consumer.set_initialized(initialized);
        }
    }

    fn transition(&mut self, phase: TailPhase) {
        if self.state.phase != phase {
            trace!(from = ?self.state.phase, to = ?phase, "tailer phase change");
            self.state.phase = phase;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consumer::{StatusBoard, TailerStatus};
    use crate::deserializer::XmlRecordDeserializer;
    use std::fs::OpenOptions;
    use std::io::Write;
    use std::path::PathBuf;
    use std::sync::Mutex;
    use tempfile::TempDir;
    use tokio::task::JoinHandle;
    use tokio::time::{timeout, Instant};

    #[derive(Default)]
    struct RecordingConsumer {
        records: Mutex<Vec<LogRecord>>,
        working_reports: Mutex<Vec<bool>>,
        status: StatusBoard,
    }

    impl RecordingConsumer {
        fn millis(&self) -> Vec<i64> {
            self.records
                .lock()
                .unwrap()
                .iter()
                .map(|record| record.timestamp_millis)
                .collect()
        }

        fn status(&self) -> TailerStatus {
            self.status.snapshot()
        }
    }

    impl LogConsumer for RecordingConsumer {
        fn accept(&self, record: LogRecord) -> Result<()> {
            self.records.lock().unwrap().push(record.clone());
            self.status.accept(record)
        }

        fn set_current_file(&self, path: &Path) {
            self.status.set_current_file(path);
        }

        fn set_initialized(&self, initialized: bool) {
            self.status.set_initialized(initialized);
        }

        fn set_working(&self, working: bool) {
            self.working_reports.lock().unwrap().push(working);
            self.status.set_working(working);
        }

        fn set_last_entry_timestamp(&self, millis: i64) {
            self.status.set_last_entry_timestamp(millis);
        }

        fn set_backlog_count(&self, count: usize) {
            self.status.set_backlog_count(count);
        }
    }

    struct Harness {
        dir: TempDir,
        queue: Arc<PendingFileQueue>,
        consumer: Arc<RecordingConsumer>,
        cancel_token: CancellationToken,
        handle: Option<JoinHandle<Result<()>>>,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                dir: TempDir::new().unwrap(),
                queue: Arc::new(PendingFileQueue::new()),
                consumer: Arc::new(RecordingConsumer::default()),
                cancel_token: CancellationToken::new(),
                handle: None,
            }
        }

        fn path(&self, name: &str) -> PathBuf {
            self.dir.path().join(name)
        }

        fn append(&self, name: &str, text: &str) -> PathBuf {
            let path = self.path(name);
            let mut file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .unwrap();
            file.write_all(text.as_bytes()).unwrap();
            file.flush().unwrap();
            path
        }

        fn start(&mut self, config: TailerConfig) {
            let tailer = LogTailer::new(
                self.queue.clone(),
                self.consumer.clone(),
                Arc::new(XmlRecordDeserializer),
                config,
                self.cancel_token.clone(),
            );
            self.handle = Some(tokio::spawn(tailer.run()));
        }

        async fn stop(&mut self) -> Result<()> {
            self.cancel_token.cancel();
            let handle = self.handle.take().expect("tailer started");
            timeout(Duration::from_secs(5), handle)
                .await
                .expect("tailer stops promptly")
                .expect("tailer task does not panic")
        }
    }

    fn fast() -> TailerConfig {
        TailerConfig {
            poll_interval: Duration::from_millis(10),
            ..TailerConfig::default()
        }
    }

    fn record_xml(millis: i64, method: Option<&str>, message: &str) -> String {
        let method = method
            .map(|m| format!("  <method>{m}</method>\n"))
            .unwrap_or_default();
        format!(
            "<record>\n  <millis>{millis}</millis>\n  <level>INFO</level>\n{method}  <message>{message}</message>\n</record>\n"
        )
    }

    async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            sleep(Duration::from_millis(10)).await;
        }
        condition()
    }

    #[tokio::test]
    async fn forwards_records_and_tracks_timestamp_of_methodless_ones() {
        let mut harness = Harness::new();
        let mut text = record_xml(1, Some("a"), "first");
        text.push_str(&record_xml(2, Some("b"), "List<Foo<Bar>> & co"));
        text.push_str(&record_xml(3, None, "no method"));
        let path = harness.append("game.xml", &text);
        harness.queue.enqueue(path.clone());
        harness.start(fast());

        let consumer = harness.consumer.clone();
        assert!(eventually(|| consumer.status().last_entry_millis == Some(3)).await);
        assert_eq!(consumer.millis(), vec![1, 2]);
        assert_eq!(
            consumer.records.lock().unwrap()[1].message,
            "List<Foo<Bar>> & co"
        );

        let status = consumer.status();
        assert_eq!(status.current_file, Some(path));
        assert!(status.initialized);
        assert_eq!(status.backlog, 0);

        harness.stop().await.unwrap();
        assert!(!consumer.status().working);
    }

    #[tokio::test]
    async fn skip_to_end_ignores_existing_records() {
        let mut harness = Harness::new();
        let path = harness.append("game.xml", &record_xml(1, Some("old"), "before start"));
        harness.queue.enqueue(path);
        harness.start(TailerConfig {
            skip_to_end: true,
            ..fast()
        });

        let consumer = harness.consumer.clone();
        assert!(eventually(|| consumer.status().initialized).await);

        harness.append("game.xml", &record_xml(2, Some("new"), "after start"));
        assert!(eventually(|| consumer.millis() == vec![2]).await);

        harness.stop().await.unwrap();
    }

    #[tokio::test]
    async fn skip_to_end_applies_to_first_file_only() {
        let mut harness = Harness::new();
        let first = harness.append("a.xml", &record_xml(1, Some("m"), "skipped"));
        harness.queue.enqueue(first);
        harness.start(TailerConfig {
            skip_to_end: true,
            ..fast()
        });

        let consumer = harness.consumer.clone();
        assert!(eventually(|| consumer.status().initialized).await);

        let second = harness.append("b.xml", &record_xml(2, Some("m"), "read in full"));
        harness.queue.enqueue(second.clone());

        assert!(eventually(|| consumer.millis() == vec![2]).await);
        assert_eq!(consumer.status().current_file, Some(second));

        harness.stop().await.unwrap();
    }

    #[tokio::test]
    async fn keeps_following_the_same_file_while_queue_is_empty() {
        let mut harness = Harness::new();
        let path = harness.append("game.xml", "");
        harness.queue.enqueue(path);
        harness.start(fast());

        let consumer = harness.consumer.clone();
        assert!(eventually(|| consumer.status().initialized).await);
        assert!(!consumer.status().working);

        // a record written in pieces, with a line split mid-way
        harness.append("game.xml", "<record>\n  <millis>7</millis>\n  <method>m</me");
        sleep(Duration::from_millis(50)).await;
        assert!(consumer.millis().is_empty());

        harness.append("game.xml", "thod>\n  <message>joined</message>\n</record>\n");
        assert!(eventually(|| consumer.millis() == vec![7]).await);
        assert_eq!(
            consumer.records.lock().unwrap()[0].method.as_deref(),
            Some("m")
        );

        harness.stop().await.unwrap();
    }

    #[tokio::test]
    async fn switches_to_queued_successor_and_abandons_old_file() {
        let mut harness = Harness::new();
        let first = harness.append("a.xml", &record_xml(1, Some("m"), "one"));
        harness.queue.enqueue(first);
        harness.start(fast());

        let consumer = harness.consumer.clone();
        assert!(eventually(|| consumer.millis() == vec![1]).await);

        let second = harness.append("b.xml", &record_xml(2, Some("m"), "two"));
        harness.queue.enqueue(second.clone());
        assert!(eventually(|| consumer.millis() == vec![1, 2]).await);
        assert_eq!(consumer.status().current_file, Some(second));
        assert!(harness.queue.is_empty());

        harness.append("a.xml", &record_xml(3, Some("m"), "late write to old file"));
        harness.append("b.xml", &record_xml(4, Some("m"), "three"));
        assert!(eventually(|| consumer.millis() == vec![1, 2, 4]).await);

        harness.stop().await.unwrap();
    }

    #[tokio::test]
    async fn reports_backlog_on_dequeue() {
        let mut harness = Harness::new();
        let a = harness.append("a.xml", &record_xml(1, Some("m"), "one"));
        let b = harness.append("b.xml", &record_xml(2, Some("m"), "two"));
        let c = harness.append("c.xml", &record_xml(3, Some("m"), "three"));
        harness.queue.enqueue(a);
        harness.queue.enqueue(b);
        harness.queue.enqueue(c.clone());
        harness.start(fast());

        let consumer = harness.consumer.clone();
        assert!(eventually(|| consumer.millis() == vec![1, 2, 3]).await);
        let status = consumer.status();
        assert_eq!(status.backlog, 0);
        assert_eq!(status.current_file, Some(c));

        harness.stop().await.unwrap();
    }

    #[tokio::test]
    async fn ignores_shortcuts_and_non_regular_files() {
        let mut harness = Harness::new();
        let shortcut = harness.append("game.xml.lnk", &record_xml(1, Some("m"), "link"));
        let directory = harness.path("subdir");
        std::fs::create_dir(&directory).unwrap();
        let missing = harness.path("gone.xml");
        let real = harness.append("game.xml", &record_xml(2, Some("m"), "real"));

        harness.queue.enqueue(shortcut);
        harness.queue.enqueue(directory);
        harness.queue.enqueue(missing);
        harness.queue.enqueue(real.clone());
        harness.start(fast());

        let consumer = harness.consumer.clone();
        assert!(eventually(|| consumer.millis() == vec![2]).await);
        assert_eq!(consumer.status().current_file, Some(real));

        harness.stop().await.unwrap();
    }

    #[tokio::test]
    async fn unparsable_record_is_dropped_and_tailing_continues() {
        let mut harness = Harness::new();
        let mut text = String::from("<record>\n<millis>soon</millis>\n<method>m</method>\n</record>\n");
        text.push_str(&record_xml(5, Some("m"), "fine"));
        let path = harness.append("game.xml", &text);
        harness.queue.enqueue(path);
        harness.start(fast());

        let consumer = harness.consumer.clone();
        assert!(eventually(|| consumer.millis() == vec![5]).await);
        assert_eq!(consumer.status().last_entry_millis, Some(5));

        harness.stop().await.unwrap();
    }

    #[tokio::test]
    async fn method_filter_treats_unlisted_methods_as_absent() {
        let mut harness = Harness::new();
        let mut text = record_xml(1, Some("keep"), "a");
        text.push_str(&record_xml(2, Some("other"), "b"));
        let path = harness.append("game.xml", &text);
        harness.queue.enqueue(path);
        harness.start(TailerConfig {
            methods: vec!["keep".to_string()],
            ..fast()
        });

        let consumer = harness.consumer.clone();
        assert!(eventually(|| consumer.status().last_entry_millis == Some(2)).await);
        assert_eq!(consumer.millis(), vec![1]);

        harness.stop().await.unwrap();
    }

    #[tokio::test]
    async fn stops_while_idle_without_a_file() {
        let mut harness = Harness::new();
        harness.start(fast());
        sleep(Duration::from_millis(20)).await;

        harness.stop().await.unwrap();
        let status = harness.consumer.status();
        assert!(!status.working);
        assert_eq!(status.current_file, None);
    }

    #[test]
    fn initial_state_reflects_config() {
        let tailer = LogTailer::new(
            Arc::new(PendingFileQueue::new()),
            Arc::new(StatusBoard::new()),
            Arc::new(XmlRecordDeserializer),
            TailerConfig {
                skip_to_end: true,
                poll_interval: Duration::ZERO,
                methods: Vec::new(),
            },
            CancellationToken::new(),
        );

        let state = &tailer.state;
        assert_eq!(state.phase, TailPhase::Idle);
        assert!(state.skip_to_end);
        assert!(!state.working);
        assert!(!state.initialized);
        assert_eq!(state.backlog, 0);
        assert_eq!(tailer.poll_interval, DEFAULT_POLL_INTERVAL);
    }

    // /proc/self/mem is a regular file whose read at offset 0 fails with EIO
    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn read_failure_aborts_with_read_error() {
        let mut harness = Harness::new();
        let unreadable = PathBuf::from("/proc/self/mem");
        let later = harness.append("game.xml", &record_xml(1, Some("m"), "never reached"));
        harness.queue.enqueue(unreadable.clone());
        harness.queue.enqueue(later);
        harness.start(fast());

        let handle = harness.handle.take().expect("tailer started");
        let result = timeout(Duration::from_secs(5), handle)
            .await
            .expect("tailer aborts promptly")
            .expect("tailer task does not panic");

        let err = result.expect_err("read failure is fatal");
        match err.downcast_ref::<TailError>() {
            Some(TailError::Read { path, .. }) => assert_eq!(path, &unreadable),
            other => panic!("expected read error, got {other:?}"),
        }

        let consumer = harness.consumer.clone();
        assert_eq!(
            consumer.working_reports.lock().unwrap().last(),
            Some(&false)
        );
        assert!(consumer.millis().is_empty());
        assert_eq!(consumer.status().current_file, Some(unreadable));
        assert_eq!(harness.queue.len(), 1);
    }
}
