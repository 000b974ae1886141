//! Client and server running as two separate processes of the binary

use file_portal::PortalConfig;
use file_portal_shared_memory::{
    ArbitrationStatus, ChunkPool, PlatformUtils, PortalSegment, SegmentCleaner, SharedMemoryError, DATA_FRAME_SIZE,
};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use tempfile::tempdir;

const PORTAL: &str = env!("CARGO_BIN_EXE_file-portal");

/// A `file-portal server` child, killed and reaped if the test bails out
struct ServerProcess {
    child: Child,
    _cleaner: SegmentCleaner,
}

impl ServerProcess {
    fn spawn(config_path: &Path, segment_name: &str) -> Self {
        let cleaner = SegmentCleaner::new(segment_name);
        let child = Command::new(PORTAL)
            .arg("server")
            .arg("--config")
            .arg(config_path)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .unwrap();
        Self { child, _cleaner: cleaner }
    }

    fn pid(&self) -> u32 {
        self.child.id()
    }

    /// Ctrl-C the server and wait for it to exit
    fn interrupt(&mut self) -> Option<ExitStatus> {
        kill(Pid::from_raw(self.pid() as i32), Signal::SIGINT).unwrap();

        let deadline = Instant::now() + Duration::from_secs(20);
        while Instant::now() < deadline {
            if let Some(status) = self.child.try_wait().unwrap() {
                return Some(status);
            }
            thread::sleep(Duration::from_millis(20));
        }
        None
    }
}

impl Drop for ServerProcess {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

fn write_config(dir: &Path, output_dir: &Path, slots: usize) -> (PathBuf, PortalConfig) {
    let config = PortalConfig {
        segment_name: PlatformUtils::generate_region_name("proc"),
        segment_size: ChunkPool::segment_size_for(slots),
        wait_timeout_ms: 2000,
        strike_limit: 3,
        output_dir: output_dir.to_path_buf(),
        poll_interval_secs: 1,
        ..PortalConfig::default()
    };
    let path = dir.join("portal.toml");
    config.save_to_file(&path).unwrap();
    (path, config)
}

fn wait_until(condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(20);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(20));
    }
    false
}

fn server_is_ready(segment_name: &str) -> bool {
    PortalSegment::open(segment_name)
        .and_then(ChunkPool::locate)
        .and_then(|pool| pool.status())
        .map(|status| status == ArbitrationStatus::Ready)
        .unwrap_or(false)
}

fn run_client(config_path: &Path, paths: &[&Path]) -> ExitStatus {
    Command::new(PORTAL)
        .arg("client")
        .arg("--config")
        .arg(config_path)
        .args(paths)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .unwrap()
}

/// Files under their final `<timestamp>_<worker id>_<name>` name
fn received_files(dir: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = fs::read_dir(dir)
        .map(|entries| entries.filter_map(|e| e.ok()).map(|e| e.path()).collect())
        .unwrap_or_default();
    files.retain(|path| {
        let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
        name.splitn(3, '_').count() == 3
    });
    files.sort();
    files
}

#[test]
fn test_transfer_between_processes() {
    let workdir = tempdir().unwrap();
    let inbox = tempdir().unwrap();
    let (config_path, config) = write_config(workdir.path(), inbox.path(), 4);

    let mut server = ServerProcess::spawn(&config_path, &config.segment_name);
    assert!(wait_until(|| server_is_ready(&config.segment_name)));

    let large: Vec<u8> = (0..DATA_FRAME_SIZE * 5 + 123).map(|i| (i * 13 % 241) as u8).collect();
    let small = b"hello from another process".to_vec();
    let large_path = workdir.path().join("large.bin");
    let small_path = workdir.path().join("small.txt");
    fs::write(&large_path, &large).unwrap();
    fs::write(&small_path, &small).unwrap();

    let status = run_client(&config_path, &[&large_path, &small_path]);
    assert!(status.success());

    assert!(wait_until(|| received_files(inbox.path()).len() == 2));
    let worker_prefix = format!("{}-", server.pid());
    for received in received_files(inbox.path()) {
        let file_name = received.file_name().unwrap().to_str().unwrap().to_string();
        let mut parts = file_name.splitn(3, '_');
        let timestamp: i64 = parts.next().unwrap().parse().unwrap();
        let worker = parts.next().unwrap();
        let name = parts.next().unwrap();

        assert!(timestamp > 0);
        assert!(worker.starts_with(&worker_prefix), "{} is not a server worker", worker);
        let expected = match name {
            "large.bin" => &large,
            "small.txt" => &small,
            other => panic!("unexpected file {}", other),
        };
        assert_eq!(&fs::read(&received).unwrap(), expected);
    }

    let exit = server.interrupt().unwrap();
    assert!(exit.success());
    assert!(matches!(
        PortalSegment::open(config.segment_name.as_str()),
        Err(SharedMemoryError::RegionNotFound(_))
    ));
}

#[test]
fn test_client_process_fails_without_server() {
    let workdir = tempdir().unwrap();
    let (config_path, _) = write_config(workdir.path(), workdir.path(), 1);
    let source = workdir.path().join("lonely.txt");
    fs::write(&source, b"nobody is listening").unwrap();

    let status = run_client(&config_path, &[&source]);
    assert!(!status.success());
}
