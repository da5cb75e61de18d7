//! Input watcher for automatic rebuilds.
//!
//! Watches the input root for changes to module input files, batches
//! bursts of changes, and re-runs the incremental build once per batch.

use std::collections::BTreeSet;
use std::mem;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::indexer::{BuildReport, Indexer};
use crate::source::{JsonDirProvider, DEFAULT_INPUT_SUFFIX};

/// Errors that can occur in the watcher.
#[derive(Error, Debug)]
pub enum WatcherError {
    #[error("Failed to create watcher: {0}")]
    CreateError(String),

    #[error("Failed to watch path: {0}")]
    WatchError(String),

    #[error("Input provider has no directory to watch")]
    NoWatchRoot,
}

/// Configuration for the watcher.
#[derive(Debug, Clone)]
pub struct WatcherConfig {
    /// Quiet period that ends a batch of changes
    pub debounce: Duration,

    /// Suffix of module input files
    pub suffix: String,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(500),
            suffix: DEFAULT_INPUT_SUFFIX.to_string(),
        }
    }
}

/// Input files changed during one burst.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeBatch {
    pub paths: BTreeSet<PathBuf>,
}

/// Watches a directory for changes to module inputs.
pub struct InputWatcher {
    config: WatcherConfig,
    root_path: PathBuf,
    // Dropping the notify watcher stops event delivery.
    watcher: Option<RecommendedWatcher>,
}

impl InputWatcher {
    pub fn new(root_path: PathBuf, config: WatcherConfig) -> Self {
        Self {
            config,
            root_path,
            watcher: None,
        }
    }

    pub fn is_watching(&self) -> bool {
        self.watcher.is_some()
    }

    /// Start watching and return a channel of debounced change batches.
    pub fn start(&mut self) -> Result<mpsc::Receiver<ChangeBatch>, WatcherError> {
        let (raw_tx, raw_rx) = mpsc::channel::<PathBuf>(256);
        let (batch_tx, batch_rx) = mpsc::channel(16);
        let suffix = self.config.suffix.clone();

        let mut watcher = notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
            match res {
                Ok(event) => {
                    for path in Self::changed_inputs(event, &suffix) {
                        // Best effort; a closed channel means the watcher is stopping.
                        let _ = raw_tx.blocking_send(path);
                    }
                }
                Err(e) => error!("Watch error: {}", e),
            }
        })
        .map_err(|e| WatcherError::CreateError(e.to_string()))?;

        watcher
            .watch(&self.root_path, RecursiveMode::Recursive)
            .map_err(|e| WatcherError::WatchError(e.to_string()))?;
        self.watcher = Some(watcher);

        tokio::spawn(debounce(raw_rx, batch_tx, self.config.debounce));

        info!(
            "Started watching {:?} with {:?} debounce",
            self.root_path, self.config.debounce
        );
        Ok(batch_rx)
    }

    /// Stop watching.
    pub fn stop(&mut self) {
        self.watcher = None;
        info!("Stopped watching {:?}", self.root_path);
    }

    /// Input file paths touched by a notify event.
    fn changed_inputs(event: Event, suffix: &str) -> Vec<PathBuf> {
        match event.kind {
            EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_) => event
                .paths
                .into_iter()
                .filter(|path| Self::should_watch(path, suffix))
                .collect(),
            _ => Vec::new(),
        }
    }

    pub fn should_watch(path: &Path, suffix: &str) -> bool {
        JsonDirProvider::is_input_file(path, suffix)
    }
}

/// Collect paths into batches that close after `quiet` without new changes.
async fn debounce(
    mut raw_rx: mpsc::Receiver<PathBuf>,
    batch_tx: mpsc::Sender<ChangeBatch>,
    quiet: Duration,
) {
    let mut pending = BTreeSet::new();
    loop {
        if pending.is_empty() {
            match raw_rx.recv().await {
                Some(path) => {
                    pending.insert(path);
                }
                None => return,
            }
            continue;
        }

        match tokio::time::timeout(quiet, raw_rx.recv()).await {
            Ok(Some(path)) => {
                pending.insert(path);
            }
            Ok(None) => {
                let _ = batch_tx
                    .send(ChangeBatch {
                        paths: mem::take(&mut pending),
                    })
                    .await;
                return;
            }
            Err(_) => {
                let batch = ChangeBatch {
                    paths: mem::take(&mut pending),
                };
                debug!("Flushing {} changed inputs", batch.paths.len());
                if batch_tx.send(batch).await.is_err() {
                    return;
                }
            }
        }
    }
}

/// Rebuilds the index whenever inputs change.
pub struct WatchService {
    indexer: Arc<Indexer>,
    config: WatcherConfig,
}

impl WatchService {
    pub fn new(indexer: Arc<Indexer>, config: WatcherConfig) -> Self {
        Self { indexer, config }
    }

    /// Build once, then rebuild after every change batch until `cancel` fires.
    ///
    /// `on_report` receives the report of every completed build. A build
    /// that fails outright is logged and watching continues.
    pub async fn run<F>(self, cancel: CancellationToken, mut on_report: F) -> Result<(), WatcherError>
    where
        F: FnMut(&BuildReport) + Send,
    {
        let root = self
            .indexer
            .provider()
            .watch_root()
            .map(Path::to_path_buf)
            .ok_or(WatcherError::NoWatchRoot)?;

        let mut watcher = InputWatcher::new(root, self.config.clone());
        let mut batches = watcher.start()?;

        self.rebuild(&cancel, &mut on_report).await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                batch = batches.recv() => match batch {
                    Some(batch) => {
                        info!("{} input(s) changed, rebuilding", batch.paths.len());
                        for path in &batch.paths {
                            debug!("Changed: {:?}", path);
                        }
                        self.rebuild(&cancel, &mut on_report).await;
                    }
                    None => break,
                },
            }
        }

        watcher.stop();
        Ok(())
    }

    async fn rebuild<F>(&self, cancel: &CancellationToken, on_report: &mut F)
    where
        F: FnMut(&BuildReport) + Send,
    {
        match self.indexer.run_with_cancel(cancel.child_token()).await {
            Ok(report) => on_report(&report),
            Err(e) => error!("Build failed: {:#}", e),
        }
    }
}
