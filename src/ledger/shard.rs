//! Append-only per-session ledger shards under `messages/`.
//!
//! Persistence is best-effort: a failed append is logged and dropped, and
//! the daemon never blocks on shard I/O. At startup the shards are read
//! back so UIs can restore history across a daemon restart.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::events::SessionEvent;
use crate::Result;

/// One serialized ledger line bound for a session's shard file.
#[derive(Debug)]
pub struct ShardLine {
    /// Session the line belongs to.
    pub session_id: String,
    /// Pre-serialized JSON line (no trailing newline).
    pub line: String,
}

/// Spawn the shard writer task.
///
/// Receives [`ShardLine`]s and appends them to `<dir>/<session>.jsonl`.
/// Write failures are logged at `warn!` and do not stop the task.
#[must_use]
pub fn spawn_shard_writer(
    dir: PathBuf,
    mut rx: mpsc::UnboundedReceiver<ShardLine>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;

                () = cancel.cancelled() => {
                    debug!("shard writer: cancellation received, stopping");
                    break;
                }

                item = rx.recv() => {
                    let Some(ShardLine { session_id, line }) = item else {
                        debug!("shard writer: channel closed, stopping");
                        break;
                    };
                    if let Err(err) = append_line(&dir, &session_id, &line).await {
                        warn!(%session_id, %err, "shard append failed, dropping line");
                    }
                }
            }
        }
    })
}

async fn append_line(dir: &Path, session_id: &str, line: &str) -> Result<()> {
    tokio::fs::create_dir_all(dir).await?;
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(dir.join(shard_file_name(session_id)))
        .await?;
    file.write_all(line.as_bytes()).await?;
    file.write_all(b"\n").await?;
    Ok(())
}

/// Read all shards back into memory, keyed by session id.
///
/// Unparseable lines are skipped with a debug log; a best-effort log never
/// fails a startup.
#[must_use]
pub fn restore_shards(dir: &Path) -> HashMap<String, Vec<SessionEvent>> {
    let mut restored: HashMap<String, Vec<SessionEvent>> = HashMap::new();
    let Ok(entries) = std::fs::read_dir(dir) else {
        return restored;
    };

    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().is_none_or(|ext| ext != "jsonl") {
            continue;
        }
        let Ok(raw) = std::fs::read_to_string(&path) else {
            continue;
        };
        for line in raw.lines() {
            match serde_json::from_str::<SessionEvent>(line) {
                Ok(event) => restored.entry(event.session_id.clone()).or_default().push(event),
                Err(err) => debug!(?path, %err, "skipping unparseable shard line"),
            }
        }
    }

    for events in restored.values_mut() {
        events.sort_by_key(|e| e.seq);
    }
    restored
}

fn shard_file_name(session_id: &str) -> String {
    let safe: String = session_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    format!("{safe}.jsonl")
}
