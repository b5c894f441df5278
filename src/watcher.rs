//! Log directory monitoring.
//!
//! Tails every regular file in the log directory plus any file created there
//! later, one task per file, deduplicated by canonical path. Each tail task
//! follows appends across rotation and truncation and feeds complete lines
//! to the pipeline one at a time; files are processed concurrently with each
//! other. Shutdown is cooperative: the monitor joins every tail task before
//! returning.

use anyhow::{Context, Result};
use notify::{Config as NotifyConfig, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::HashSet;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncSeekExt, BufReader};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::Pipeline;

/// How long a tail task sleeps at end-of-file before rechecking.
const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Watch `log_dir` and tail its files until `shutdown` fires.
pub async fn start_monitoring(
    log_dir: PathBuf,
    parse_all: bool,
    pipeline: Arc<Pipeline>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let mut active: HashSet<PathBuf> = HashSet::new();
    let mut tails: JoinSet<()> = JoinSet::new();

    // Tail all existing files in the directory.
    match std::fs::read_dir(&log_dir) {
        Ok(entries) => {
            for entry in entries.flatten() {
                let is_file = entry.file_type().map(|t| t.is_file()).unwrap_or(false);
                if is_file {
                    begin_tail(
                        &entry.path(),
                        parse_all,
                        &pipeline,
                        &shutdown,
                        &mut active,
                        &mut tails,
                    );
                }
            }
        }
        Err(e) => error!("error reading directory {}: {}", log_dir.display(), e),
    }

    // Subscribe to creation events for files that appear later. A watcher
    // failure degrades to tailing only the initial set.
    let (event_tx, mut event_rx) = mpsc::channel::<notify::Result<Event>>(100);
    let _watcher = match RecommendedWatcher::new(
        move |res| {
            let _ = event_tx.blocking_send(res);
        },
        NotifyConfig::default(),
    ) {
        Ok(mut watcher) => match watcher.watch(&log_dir, RecursiveMode::NonRecursive) {
            Ok(()) => {
                debug!("watching directory: {}", log_dir.display());
                Some(watcher)
            }
            Err(e) => {
                error!("error watching directory {}: {}", log_dir.display(), e);
                None
            }
        },
        Err(e) => {
            error!("error creating file watcher: {}", e);
            None
        }
    };

    info!(
        "log monitoring started for {} file(s) in {}",
        active.len(),
        log_dir.display()
    );

    loop {
        tokio::select! {
            Some(res) = event_rx.recv() => {
                match res {
                    Ok(event) => {
                        if matches!(event.kind, EventKind::Create(_)) {
                            for path in &event.paths {
                                if path.is_file() {
                                    begin_tail(
                                        path,
                                        parse_all,
                                        &pipeline,
                                        &shutdown,
                                        &mut active,
                                        &mut tails,
                                    );
                                }
                            }
                        }
                    }
                    Err(e) => error!("file watcher error: {}", e),
                }
            }
            _ = shutdown.changed() => break,
        }
    }

    debug!("draining {} tail task(s)", tails.len());
    while tails.join_next().await.is_some() {}
    info!("log monitoring stopped");
    Ok(())
}

/// Spawn a tail task for `path` unless one is already running for it.
/// Dedup is keyed by canonical absolute path, so the initial scan and a
/// late-arriving creation event for the same file race safely.
fn begin_tail(
    path: &Path,
    parse_all: bool,
    pipeline: &Arc<Pipeline>,
    shutdown: &watch::Receiver<bool>,
    active: &mut HashSet<PathBuf>,
    tails: &mut JoinSet<()>,
) {
    let abs = match path.canonicalize() {
        Ok(abs) => abs,
        Err(e) => {
            warn!("error resolving path {}: {}", path.display(), e);
            return;
        }
    };

    if !active.insert(abs.clone()) {
        return;
    }

    let pipeline = pipeline.clone();
    let shutdown = shutdown.clone();
    tails.spawn(async move {
        if let Err(e) = tail_file(&abs, parse_all, pipeline, shutdown).await {
            warn!("error tailing file {}: {:#}", abs.display(), e);
        }
    });
}

/// Follow one file, handing each complete line to the pipeline before
/// reading the next. Reopens from offset 0 when the file shrinks
/// (rotation/truncation).
async fn tail_file(
    path: &Path,
    from_beginning: bool,
    pipeline: Arc<Pipeline>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let mut file = File::open(path)
        .await
        .with_context(|| format!("failed to open {}", path.display()))?;
    let mut pos = if from_beginning {
        0
    } else {
        file.metadata().await?.len()
    };
    file.seek(SeekFrom::Start(pos)).await?;
    let mut reader = BufReader::new(file);

    debug!("tailing {} from offset {}", path.display(), pos);

    let mut chunk = String::new();
    let mut pending = String::new();

    loop {
        chunk.clear();
        let n = reader
            .read_line(&mut chunk)
            .await
            .with_context(|| format!("failed to read {}", path.display()))?;

        if n == 0 {
            match tokio::fs::metadata(path).await {
                Ok(meta) if meta.len() < pos => {
                    info!(
                        "log file {} appears to have been rotated, starting from beginning",
                        path.display()
                    );
                    let reopened = File::open(path)
                        .await
                        .with_context(|| format!("failed to reopen {}", path.display()))?;
                    pos = 0;
                    pending.clear();
                    reader = BufReader::new(reopened);
                    continue;
                }
                Ok(_) => {}
                // Mid-rotation gap; keep polling the path.
                Err(_) => {}
            }

            tokio::select! {
                _ = tokio::time::sleep(POLL_INTERVAL) => {}
                _ = shutdown.changed() => return Ok(()),
            }
            continue;
        }

        pos += n as u64;
        pending.push_str(&chunk);

        // A chunk without a trailing newline is a partially written line;
        // hold it until the rest arrives.
        if pending.ends_with('\n') {
            let line = pending.trim_end_matches(['\r', '\n']);
            pipeline.process(line, path).await;
            pending.clear();
        }

        if *shutdown.borrow() {
            return Ok(());
        }
    }
}
