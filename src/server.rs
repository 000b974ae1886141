//! Server session: own the segment, arbitrate chunks, receive files

use crate::{PortalConfig, PortalError, Result, SessionStatus, TransferMetrics};
use chrono::Utc;
use file_portal_shared_memory::{
    Arbiter, Arbitration, ChunkPool, PlatformUtils, PortalSegment, SegmentCleaner, SlotHandle, WaitPolicy,
};
use parking_lot::Mutex;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, info_span, warn};

/// State shared between the session, the arbitration thread and consumers
struct ServerShared {
    output_dir: PathBuf,
    policy: WaitPolicy,
    running: AtomicBool,
    live_workers: AtomicUsize,
    next_worker: AtomicU64,
    received: Mutex<Vec<PathBuf>>,
    metrics: TransferMetrics,
}

impl ServerShared {
    fn next_worker_id(&self) -> String {
        format!(
            "{}-{}",
            PlatformUtils::get_process_id(),
            self.next_worker.fetch_add(1, Ordering::SeqCst)
        )
    }
}

/// Decrements the live-worker count when a consumer exits
struct LiveWorker(Arc<ServerShared>);

impl Drop for LiveWorker {
    fn drop(&mut self) {
        self.0.live_workers.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Segment owner and receiving side of all transfers
pub struct ServerSession {
    pool: ChunkPool,
    shared: Arc<ServerShared>,
    arbitration: Option<JoinHandle<()>>,
    // dropped last: removes the segment name once everything else is gone
    _cleaner: SegmentCleaner,
}

impl ServerSession {
    /// Wipe any stale segment, then create the segment and chunk pool
    pub fn new(config: &PortalConfig) -> Result<Self> {
        config.validate()?;
        fs::create_dir_all(&config.output_dir)?;

        let cleaner = SegmentCleaner::new(config.segment_name.as_str());
        let segment = PortalSegment::create(config.segment_name.as_str(), config.segment_size)?;
        let pool = ChunkPool::create(segment)?;

        Ok(Self {
            pool,
            shared: Arc::new(ServerShared {
                output_dir: config.output_dir.clone(),
                policy: config.wait_policy(),
                running: AtomicBool::new(false),
                live_workers: AtomicUsize::new(0),
                next_worker: AtomicU64::new(0),
                received: Mutex::new(Vec::new()),
                metrics: TransferMetrics::new(),
            }),
            arbitration: None,
            _cleaner: cleaner,
        })
    }

    /// Start the arbitration thread
    pub fn start(&mut self) -> Result<()> {
        if self.arbitration.is_some() {
            return Ok(());
        }

        let mut arbiter = Arbiter::new(self.pool.clone(), self.shared.policy);
        let shared = self.shared.clone();
        shared.running.store(true, Ordering::SeqCst);

        let handle = thread::Builder::new()
            .name("arbiter".to_string())
            .spawn(move || {
                let span = info_span!("arbiter");
                let _enter = span.enter();
                info!("Arbitration started");

                loop {
                    match arbiter.poll() {
                        Ok(Arbitration::Granted(handle)) => spawn_consumer(&shared, arbiter.pool(), handle),
                        Ok(Arbitration::Stopped) => break,
                        Ok(Arbitration::Exhausted) | Ok(Arbitration::Idle) => {}
                        Err(e) => {
                            error!("Arbitration failed: {}", e);
                            break;
                        }
                    }
                }

                shared.running.store(false, Ordering::SeqCst);
                info!("Arbitration stopped");
            });

        match handle {
            Ok(handle) => {
                self.arbitration = Some(handle);
                info!("Server is serving {}", self.pool.segment_name());
                Ok(())
            }
            Err(e) => {
                self.shared.running.store(false, Ordering::SeqCst);
                Err(e.into())
            }
        }
    }

    /// Refuse further requests; the arbitration thread exits after its current wait
    pub fn stop(&self) -> Result<()> {
        self.pool.stop()?;
        info!("Server stopping");
        Ok(())
    }

    pub fn status(&self) -> SessionStatus {
        if self.shared.running.load(Ordering::SeqCst) {
            SessionStatus::Active
        } else if self.arbitration.is_some() {
            SessionStatus::Completed
        } else {
            SessionStatus::NotReady
        }
    }

    /// Final paths of the files received so far
    pub fn received_files(&self) -> Vec<PathBuf> {
        self.shared.received.lock().clone()
    }

    pub fn live_workers(&self) -> usize {
        self.shared.live_workers.load(Ordering::SeqCst)
    }

    pub fn metrics(&self) -> &TransferMetrics {
        &self.shared.metrics
    }

    pub fn pool(&self) -> &ChunkPool {
        &self.pool
    }
}

impl Drop for ServerSession {
    fn drop(&mut self) {
        if let Err(e) = self.pool.stop() {
            warn!("Failed to stop arbitration: {}", e);
        }
        if let Some(handle) = self.arbitration.take() {
            if handle.join().is_err() {
                error!("Arbitration thread panicked");
            }
        }
    }
}


fn spawn_consumer(shared: &Arc<ServerShared>, pool: &ChunkPool, handle: SlotHandle) {
    let worker_id = shared.next_worker_id();
    shared.live_workers.fetch_add(1, Ordering::SeqCst);
    let live = LiveWorker(shared.clone());

    let worker_shared = shared.clone();
    let worker_pool = pool.clone();
    let spawned = thread::Builder::new()
        .name(format!("server-{}", worker_id))
        .spawn(move || {
            let _live = live;
            let span = info_span!("server_worker", worker = %worker_id, chunk = handle.index);
            let _enter = span.enter();

            match receive_file(&worker_shared, &worker_pool, handle, &worker_id) {
                Ok((path, bytes)) => {
                    info!("File received: {} ({} bytes)", path.display(), bytes);
                    worker_shared.metrics.record_completed(bytes);
                    worker_shared.received.lock().push(path);
                }
                Err(e) => {
                    warn!("File transfer failed: {}", e);
                    worker_shared.metrics.record_failed();
                }
            }
        });

    if let Err(e) = spawned {
        error!("Cannot start consumer for chunk {}: {}", handle.index, e);
        release_chunk(pool, handle);
    }
}

/// Consumer side of one transfer
///
/// Writes into `<output_dir>/<worker_id>` and renames to the final name on
/// success. A partial file never survives a failed transfer.
fn receive_file(
    shared: &ServerShared,
    pool: &ChunkPool,
    handle: SlotHandle,
    worker_id: &str,
) -> Result<(PathBuf, u64)> {
    let chunk = pool
        .chunk(handle)
        .ok_or_else(|| PortalError::NotReady(format!("granted chunk {} is out of range", handle.index)))?;

    let transient = shared.output_dir.join(worker_id);
    let file = match File::create(&transient) {
        Ok(file) => file,
        Err(e) => {
            // nobody will consume this chunk, let the producer know
            release_chunk(pool, handle);
            return Err(e.into());
        }
    };

    let mut sink = BufWriter::new(file);
    let received = chunk
        .consume(handle, &mut sink, &shared.policy)
        .map_err(PortalError::from)
        .and_then(|received| {
            sink.flush()?;
            Ok(received)
        });
    drop(sink);

    let received = match received {
        Ok(received) => received,
        Err(e) => {
            discard(&transient);
            return Err(e);
        }
    };

    let final_path = shared
        .output_dir
        .join(final_file_name(Utc::now().timestamp(), worker_id, &received.name));
    match fs::rename(&transient, &final_path) {
        Ok(()) => Ok((final_path, received.bytes)),
        Err(e) => {
            warn!("Cannot rename {} to {}: {}", transient.display(), final_path.display(), e);
            Ok((transient, received.bytes))
        }
    }
}

fn release_chunk(pool: &ChunkPool, handle: SlotHandle) {
    if let Err(e) = pool.release(handle) {
        warn!("Failed to release chunk {}: {}", handle.index, e);
    }
}

fn discard(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => debug!("Removed partial file {}", path.display()),
        Err(e) => warn!("Cannot remove partial file {}: {}", path.display(), e),
    }
}

/// `<timestamp>_<worker_id>_<file name>`
fn final_file_name(timestamp: i64, worker_id: &str, transmitted: &str) -> String {
    format!("{}_{}_{}", timestamp, worker_id, output_file_name(transmitted))
}

/// Last path component of a transmitted name
fn output_file_name(transmitted: &str) -> &str {
    Path::new(transmitted)
        .file_name()
        .and_then(|name| name.to_str())
        .filter(|name| !name.is_empty())
        .unwrap_or("unnamed")
}

#[cfg(test)]
mod tests {
    use super::*;
    use file_portal_shared_memory::SharedMemoryRegion;
    use std::io::{self, Read};
    use std::time::{Duration, Instant};
    use tempfile::tempdir;

    fn test_config(output_dir: &Path) -> PortalConfig {
        PortalConfig {
            segment_name: PlatformUtils::generate_region_name("server"),
            segment_size: ChunkPool::segment_size_for(4),
            wait_timeout_ms: 200,
            strike_limit: 3,
            output_dir: output_dir.to_path_buf(),
            ..PortalConfig::default()
        }
    }

    fn wait_until(condition: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(10);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        false
    }

    /// Serves one frame, then fails
    struct BrokenSource {
        served: bool,
    }

    impl Read for BrokenSource {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.served {
                return Err(io::Error::new(io::ErrorKind::Other, "device lost"));
            }
            self.served = true;
            buf.fill(7);
            Ok(buf.len())
        }
    }

    #[test]
    fn test_output_file_name() {
        assert_eq!(output_file_name("report.pdf"), "report.pdf");
        assert_eq!(output_file_name("/home/user/data/report.pdf"), "report.pdf");
        assert_eq!(output_file_name("../../etc/passwd"), "passwd");
        assert_eq!(output_file_name(".."), "unnamed");
        assert_eq!(output_file_name(""), "unnamed");
    }

    #[test]
    fn test_final_file_name() {
        assert_eq!(final_file_name(1700000000, "42-7", "dir/a.txt"), "1700000000_42-7_a.txt");
    }

    #[test]
    fn test_lifecycle() {
        let dir = tempdir().unwrap();
        let mut server = ServerSession::new(&test_config(dir.path())).unwrap();
        assert_eq!(server.status(), SessionStatus::NotReady);
        assert_eq!(server.pool().slot_count(), 4);

        server.start().unwrap();
        assert_eq!(server.status(), SessionStatus::Active);

        server.stop().unwrap();
        assert!(wait_until(|| server.status() == SessionStatus::Completed));
        assert!(server.received_files().is_empty());
    }

    #[test]
    fn test_stale_segment_is_replaced() {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path());
        let stale = SharedMemoryRegion::create(config.segment_name.as_str(), 4096).unwrap();

        let server = ServerSession::new(&config).unwrap();
        assert_eq!(server.pool().slot_count(), 4);
        drop(stale);
    }

    #[test]
    fn test_interrupted_transfer_leaves_no_file() {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path());
        let mut server = ServerSession::new(&config).unwrap();
        server.start().unwrap();

        let client_pool = ChunkPool::locate(PortalSegment::open(config.segment_name.as_str()).unwrap()).unwrap();
        let policy = config.wait_policy();
        let handle = client_pool.request_slot(&policy).unwrap();
        let chunk = client_pool.chunk(handle).unwrap();

        let result = chunk.produce(handle, "broken.bin", &mut BrokenSource { served: false }, &policy);
        assert!(result.is_err());

        assert!(wait_until(|| server.metrics().snapshot().failed == 1));
        assert!(wait_until(|| server.live_workers() == 0));
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
        assert_eq!(client_pool.busy_count(), 0);
    }
}
