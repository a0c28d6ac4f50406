//! Workspace filesystem observer.
//!
//! Publishes change events for the active workspace onto the event bus as
//! `FileChanged` infrastructure events. Browsing and editing live
//! elsewhere; this is a leaf publisher only. Events are debounced into
//! small batches so editors that fan out writes do not flood subscribers.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use notify::{RecommendedWatcher, RecursiveMode, Watcher as _};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::bus::{BusEvent, EventBus};
use crate::{AppError, Result};

/// Collection window for batching rapid-fire notifications.
const DEBOUNCE: Duration = Duration::from_millis(250);

/// Running workspace watcher; dropping it stops the observation.
pub struct WorkspaceWatcher {
    // The watcher must stay alive for callbacks to fire.
    _watcher: RecommendedWatcher,
    task: JoinHandle<()>,
    cancel: CancellationToken,
}

impl WorkspaceWatcher {
    /// Watch `root` recursively and publish batched change events.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the watch cannot be established.
    pub fn spawn(root: &Path, bus: Arc<EventBus>) -> Result<Self> {
        let (raw_tx, mut raw_rx) = mpsc::unbounded_channel::<Vec<PathBuf>>();

        let mut watcher = notify::recommended_watcher(move |result: notify::Result<notify::Event>| {
            match result {
                Ok(event) => {
                    if !event.paths.is_empty() {
                        let _ = raw_tx.send(event.paths);
                    }
                }
                Err(err) => warn!(%err, "workspace watch error"),
            }
        })
        .map_err(|err| AppError::Io(format!("failed to create watcher: {err}")))?;

        watcher
            .watch(root, RecursiveMode::Recursive)
            .map_err(|err| AppError::Io(format!("failed to watch {}: {err}", root.display())))?;

        let cancel = CancellationToken::new();
        let task_cancel = cancel.clone();
        let root_label = root.display().to_string();

        let task = tokio::spawn(async move {
            loop {
                let first = tokio::select! {
                    () = task_cancel.cancelled() => break,
                    paths = raw_rx.recv() => match paths {
                        Some(paths) => paths,
                        None => break,
                    },
                };

                // Collect whatever else lands inside the debounce window.
                let mut batch: Vec<PathBuf> = first;
                let window_end = tokio::time::Instant::now() + DEBOUNCE;
                loop {
                    tokio::select! {
                        () = tokio::time::sleep_until(window_end) => break,
                        more = raw_rx.recv() => match more {
                            Some(paths) => batch.extend(paths),
                            None => break,
                        },
                    }
                }

                batch.sort();
                batch.dedup();
                debug!(count = batch.len(), root = %root_label, "workspace files changed");
                bus.publish_infra(BusEvent::FileChanged {
                    paths: batch
                        .into_iter()
                        .map(|p| p.to_string_lossy().into_owned())
                        .collect(),
                });
            }
        });

        Ok(Self { _watcher: watcher, task, cancel })
    }

    /// Stop the watcher task.
    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

impl Drop for WorkspaceWatcher {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.task.abort();
    }
}
