//! Client session: attach to a running server and transmit files

use crate::{PortalConfig, PortalError, Result, SessionStatus, TransferMetrics};
use file_portal_shared_memory::{ChunkPool, PortalSegment, PlatformUtils, WaitPolicy, MAX_FILE_NAME_LENGTH};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, info, info_span, warn};

/// Result of one file handed to the session
#[derive(Debug)]
pub struct FileOutcome {
    pub path: PathBuf,
    /// Bytes sent, or why the file was not transmitted
    pub result: Result<u64>,
}

/// Failed files split by cause
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FailureBreakdown {
    /// Lost because the server or its consumer stopped responding
    pub unresponsive_peer: usize,
    /// Everything else, such as unreadable files or an exhausted pool
    pub other: usize,
}

impl FailureBreakdown {
    pub fn from_outcomes<'a>(outcomes: impl IntoIterator<Item = &'a FileOutcome>) -> Self {
        let mut breakdown = Self::default();
        for error in outcomes.into_iter().filter_map(|o| o.result.as_ref().err()) {
            if error.is_liveness_failure() {
                breakdown.unresponsive_peer += 1;
            } else {
                breakdown.other += 1;
            }
        }
        breakdown
    }
}

/// Decrements the live-worker count when a worker exits, panics included
struct LiveWorker(Arc<AtomicUsize>);

impl Drop for LiveWorker {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Attached client, one producer worker per file
pub struct ClientSession {
    pool: ChunkPool,
    policy: WaitPolicy,
    live_workers: Arc<AtomicUsize>,
    metrics: Arc<TransferMetrics>,
    workers: Vec<(PathBuf, JoinHandle<Result<u64>>)>,
    rejected: Vec<FileOutcome>,
    next_worker: u64,
}

impl ClientSession {
    /// Attach to the segment a server created
    ///
    /// Fails with [`PortalError::NotReady`] when the segment or its objects
    /// cannot be found, or the server does not report ready within one wait.
    pub fn attach(config: &PortalConfig) -> Result<Self> {
        let policy = config.wait_policy();
        let pool = PortalSegment::open(config.segment_name.as_str())
            .and_then(ChunkPool::locate)
            .map_err(|e| PortalError::NotReady(format!("cannot attach to {}: {}", config.segment_name, e)))?;
        pool.wait_until_ready(&policy)
            .map_err(|e| PortalError::NotReady(e.to_string()))?;

        info!("Attached to {} with {} chunks", pool.segment_name(), pool.slot_count());
        Ok(Self {
            pool,
            policy,
            live_workers: Arc::new(AtomicUsize::new(0)),
            metrics: Arc::new(TransferMetrics::new()),
            workers: Vec::new(),
            rejected: Vec::new(),
            next_worker: 0,
        })
    }

    /// Start one worker per path; returns the number of workers started
    ///
    /// Paths whose name does not fit the chunk name field are skipped.
    pub fn transfer_files<I, P>(&mut self, paths: I) -> usize
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        let mut started = 0;
        for path in paths {
            let path = path.as_ref().to_path_buf();
            let name = path.to_string_lossy().into_owned();

            if name.len() > MAX_FILE_NAME_LENGTH - 1 {
                warn!("File name is too long, skipped: {}", name);
                self.metrics.record_skipped();
                self.rejected.push(FileOutcome {
                    result: Err(PortalError::NameTooLong {
                        path: path.clone(),
                        len: name.len(),
                        limit: MAX_FILE_NAME_LENGTH - 1,
                    }),
                    path,
                });
                continue;
            }

            match self.spawn_worker(path.clone(), name) {
                Ok(handle) => {
                    self.workers.push((path, handle));
                    started += 1;
                }
                Err(e) => {
                    warn!("Cannot start worker for {}: {}", path.display(), e);
                    self.metrics.record_failed();
                    self.rejected.push(FileOutcome { path, result: Err(e.into()) });
                }
            }
        }
        started
    }

    fn spawn_worker(&mut self, path: PathBuf, name: String) -> std::io::Result<JoinHandle<Result<u64>>> {
        let worker_id = format!("{}-{}", PlatformUtils::get_process_id(), self.next_worker);
        self.next_worker += 1;

        let pool = self.pool.clone();
        let policy = self.policy;
        let metrics = self.metrics.clone();
        let live = self.live_workers.clone();
        live.fetch_add(1, Ordering::SeqCst);

        let spawned = thread::Builder::new()
            .name(format!("client-{}", worker_id))
            .spawn(move || {
                let _live = LiveWorker(live);
                let span = info_span!("client_worker", worker = %worker_id, path = %path.display());
                let _enter = span.enter();

                let result = send_file(&pool, &path, &name, &policy);
                match &result {
                    Ok(bytes) => {
                        info!("File transmitted: {} ({} bytes)", name, bytes);
                        metrics.record_completed(*bytes);
                    }
                    Err(e) => {
                        warn!("File transfer failed: {}", e);
                        metrics.record_failed();
                    }
                }
                result
            });

        if spawned.is_err() {
            self.live_workers.fetch_sub(1, Ordering::SeqCst);
        }
        spawned
    }

    /// `Completed` once every started worker has exited
    pub fn status(&self) -> SessionStatus {
        if self.live_workers() == 0 {
            SessionStatus::Completed
        } else {
            SessionStatus::Active
        }
    }

    pub fn live_workers(&self) -> usize {
        self.live_workers.load(Ordering::SeqCst)
    }

    pub fn metrics(&self) -> &TransferMetrics {
        &self.metrics
    }

    /// Join every worker and report what happened to each file
    pub fn wait(self) -> Vec<FileOutcome> {
        let mut outcomes = self.rejected;
        for (path, handle) in self.workers {
            let result = handle
                .join()
                .unwrap_or_else(|_| Err(PortalError::WorkerPanicked(path.clone())));
            outcomes.push(FileOutcome { path, result });
        }
        outcomes
    }
}

/// Producer side of one transfer
fn send_file(pool: &ChunkPool, path: &Path, name: &str, policy: &WaitPolicy) -> Result<u64> {
    // opened first so an unreadable file never holds a chunk
    let mut source = BufReader::new(File::open(path)?);

    let handle = pool.request_slot(policy)?;
    debug!(index = handle.index, generation = handle.generation, "Chunk granted");

    let chunk = pool
        .chunk(handle)
        .ok_or_else(|| PortalError::NotReady(format!("granted chunk {} is out of range", handle.index)))?;
    Ok(chunk.produce(handle, name, &mut source, policy)?)
}
