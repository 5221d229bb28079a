use crate::error::TailError;
use crate::queue::PendingFileQueue;
use anyhow::{Context, Result};
use notify::event::{ModifyKind, RenameMode};
use notify::{
    Config as NotifyConfig, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher,
};
use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct WatcherOptions {
    pub log_dir: PathBuf,
    /// Extension (without the dot) of files considered during directory scans.
    pub extension: String,
    pub read_all: bool,
}

/// Feeds the pending queue with log files found in one directory.
///
/// Construction validates the directory and, with `read_all`, queues the existing backlog.
/// `start` registers for creation events and queues the newest existing log file, which the
/// tailer treats as the active one. Created files are queued without filtering.
pub struct DirectoryWatcher {
    options: WatcherOptions,
    queue: Arc<PendingFileQueue>,
    watcher: Mutex<Option<RecommendedWatcher>>,
}

impl DirectoryWatcher {
    pub fn new(options: WatcherOptions, queue: Arc<PendingFileQueue>) -> Result<Self> {
        validate_log_dir(&options.log_dir)?;

        if options.read_all {
            let backlog = backlog_files(&options.log_dir, &options.extension)?;
            let count = backlog.len();
            for path in backlog {
                queue.enqueue(path);
            }
            info!(
                path = %options.log_dir.display(),
                count,
                "queued existing log files as backlog"
            );
        }

        Ok(Self {
            options,
            queue,
            watcher: Mutex::new(None),
        })
    }

    /// Registers the directory watch and queues the newest existing log file.
    ///
    /// Watch failures after registration are sent to `error_tx` for the supervisor.
    pub fn start(&self, error_tx: mpsc::UnboundedSender<anyhow::Error>) -> Result<()> {
        let queue = self.queue.clone();
        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) => handle_event(&queue, event),
                Err(err) => {
                    error!(error = %err, "directory watcher error");
                    let _ = error_tx.send(TailError::Watch(err).into());
                }
            },
            NotifyConfig::default(),
        )
        .map_err(TailError::Watch)
        .context("failed to create directory watcher")?;

        watcher
            .watch(&self.options.log_dir, RecursiveMode::NonRecursive)
            .map_err(TailError::Watch)
            .with_context(|| format!("failed to watch {}", self.options.log_dir.display()))?;

        info!(path = %self.options.log_dir.display(), "registered log directory watch");

        // registered first, so a file created meanwhile is already queued by its event
        if let Some(newest) = newest_log_file(&self.options.log_dir, &self.options.extension)? {
            if self.queue.snapshot().contains(&newest) {
                debug!(path = %newest.display(), "newest log file already queued");
            } else {
                info!(path = %newest.display(), "queued newest log file as active file");
                self.queue.enqueue(newest);
            }
        }

        *self.lock_watcher() = Some(watcher);
        Ok(())
    }

    /// Retracts the watch registration. Safe to call more than once.
    pub fn stop(&self) {
        let Some(mut watcher) = self.lock_watcher().take() else {
            return;
        };
        if let Err(err) = watcher.unwatch(&self.options.log_dir) {
            warn!(error = %err, "failed to unwatch log directory");
        }
        info!(path = %self.options.log_dir.display(), "directory watcher stopped");
    }

    fn lock_watcher(&self) -> std::sync::MutexGuard<'_, Option<RecommendedWatcher>> {
        self.watcher
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for DirectoryWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

fn handle_event(queue: &PendingFileQueue, event: Event) {
    let created: Vec<PathBuf> = match event.kind {
        // inotify follows a rename's `To` with a `Both` for the same pair; only `To` counts
        EventKind::Create(_)
        | EventKind::Modify(ModifyKind::Name(RenameMode::To))
        | EventKind::Modify(ModifyKind::Name(RenameMode::Any)) => event.paths,
        _ => return,
    };

    for path in created {
        debug!(path = %path.display(), "detected new file");
        queue.enqueue(path);
    }
}

pub fn validate_log_dir(log_dir: &Path) -> Result<()> {
    match fs::metadata(log_dir) {
        Ok(meta) if meta.is_dir() => Ok(()),
        Ok(_) => Err(TailError::NotADirectory(log_dir.to_path_buf()).into()),
        Err(_) => Err(TailError::WatchDirMissing(log_dir.to_path_buf()).into()),
    }
}

/// Every matching log file except the newest, oldest first.
pub fn backlog_files(log_dir: &Path, extension: &str) -> Result<Vec<PathBuf>> {
    let mut files = list_log_files(log_dir, extension)?;
    files.sort_by(|(a_path, a_time), (b_path, b_time)| {
        a_time.cmp(b_time).then_with(|| a_path.cmp(b_path))
    });
    files.pop();
    Ok(files.into_iter().map(|(path, _)| path).collect())
}

/// The matching log file with the latest modification time.
pub fn newest_log_file(log_dir: &Path, extension: &str) -> Result<Option<PathBuf>> {
    Ok(list_log_files(log_dir, extension)?
        .into_iter()
        .max_by(|(a_path, a_time), (b_path, b_time)| {
            a_time.cmp(b_time).then_with(|| a_path.cmp(b_path))
        })
        .map(|(path, _)| path))
}

fn list_log_files(log_dir: &Path, extension: &str) -> Result<Vec<(PathBuf, SystemTime)>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(log_dir)
        .with_context(|| format!("failed to read directory {}", log_dir.display()))?
    {
        let path = entry
            .with_context(|| format!("failed to read entry in {}", log_dir.display()))?
            .path();
        if path.extension() != Some(OsStr::new(extension)) {
            continue;
        }

        let modified = match fs::metadata(&path) {
            Ok(meta) if meta.is_file() => meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            Ok(_) => continue,
            Err(err) => {
                debug!(path = %path.display(), error = %err, "log file vanished during scan");
                continue;
            }
        };
        files.push((path, modified));
    }
    Ok(files)
}
