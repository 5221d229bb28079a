//! Wiring of watcher, queue and tailer.
//!
//! `Pipeline` creates the pending queue the two workers share and owns the cancellation token,
//! the watcher registration, the tailer task and the channel on which the watcher reports
//! failures. Nothing is global; dropping the pipeline retracts the watch.

use crate::config::Config;
use crate::consumer::LogConsumer;
use crate::deserializer::{RecordDeserializer, XmlRecordDeserializer};
use crate::queue::PendingFileQueue;
use crate::tailer::{LogTailer, TailerConfig};
use crate::watcher::{DirectoryWatcher, WatcherOptions};
use anyhow::{anyhow, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub watcher: WatcherOptions,
    pub tailer: TailerConfig,
}

impl From<&Config> for PipelineOptions {
    fn from(config: &Config) -> Self {
        Self {
            watcher: WatcherOptions {
                log_dir: config.log_dir(),
                extension: config.extension().to_string(),
                read_all: config.watcher.read_all,
            },
            tailer: TailerConfig {
                skip_to_end: config.tailer.skip_to_end,
                poll_interval: config.poll_interval(),
                methods: config.filter.methods.clone(),
            },
        }
    }
}

pub struct Pipeline {
    watcher: DirectoryWatcher,
    cancel_token: CancellationToken,
    tailer: Option<JoinHandle<Result<()>>>,
    errors: mpsc::UnboundedReceiver<anyhow::Error>,
}

impl Pipeline {
    /// Starts both workers with the XML deserializer. Must be called inside a tokio runtime.
    ///
    /// A missing or invalid log directory fails here, before any worker runs.
    pub fn start(options: PipelineOptions, consumer: Arc<dyn LogConsumer>) -> Result<Self> {
        Self::start_with(options, consumer, Arc::new(XmlRecordDeserializer))
    }

    pub fn start_with(
        options: PipelineOptions,
        consumer: Arc<dyn LogConsumer>,
        deserializer: Arc<dyn RecordDeserializer>,
    ) -> Result<Self> {
        let queue = Arc::new(PendingFileQueue::new());
        let cancel_token = CancellationToken::new();
        let watcher = DirectoryWatcher::new(options.watcher, queue.clone())?;

        let tailer = LogTailer::new(
            queue,
            consumer,
            deserializer,
            options.tailer,
            cancel_token.clone(),
        );
        let tailer = tokio::spawn(tailer.run());

        let (error_tx, errors) = mpsc::unbounded_channel();
        if let Err(err) = watcher.start(error_tx) {
            cancel_token.cancel();
            return Err(err);
        }

        info!("pipeline started");
        Ok(Self {
            watcher,
            cancel_token,
            tailer: Some(tailer),
            errors,
        })
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    /// Resolves when the tailer finishes or the watcher reports a failure.
    pub async fn wait(&mut self) -> Result<()> {
        let errors = &mut self.errors;
        let joined = match self.tailer.as_mut() {
            Some(handle) => tokio::select! {
                joined = handle => joined,
                Some(err) = errors.recv() => return Err(err),
            },
            None => return Ok(()),
        };

        self.tailer = None;
        joined.map_err(|err| anyhow!("log tailer task failed: {err}"))?
    }

    /// Requests cooperative shutdown of both workers. Safe to call repeatedly.
    pub fn stop(&self) {
        self.cancel_token.cancel();
        self.watcher.stop();
    }

    /// Stops the workers and waits up to `grace` for the tailer to finish.
    pub async fn shutdown(mut self, grace: Duration) -> Result<()> {
        self.stop();

        let Some(mut handle) = self.tailer.take() else {
            return Ok(());
        };

        match timeout(grace, &mut handle).await {
            Ok(Ok(result)) => {
                info!("log tailer stopped");
                result
            }
            Ok(Err(err)) => Err(anyhow!("log tailer task failed: {err}")),
            Err(_) => {
                warn!("log tailer did not stop within timeout; aborting");
                handle.abort();
                Ok(())
            }
        }
    }
}
