//! Filesystem-backed execution lock guarding a whole orchestrator run.
//!
//! Acquisition is an atomic create-new of a lock file holding a small JSON
//! payload `{"pid": ..., "createdAt": ...}`. An existing lock is reclaimed
//! when it is stale: malformed payload, owning process no longer alive, or
//! payload older than a ceiling (the ceiling applies even to a live owner,
//! guarding against runaway holders). A live lock is polled at a fixed
//! interval, with an optional wait-started/wait-ended hook pair fired
//! exactly once per wait episode.
//!
//! Release is idempotent and has three triggers: explicit call, guard drop,
//! and terminating signals (`SIGINT`, `SIGTERM`, `SIGHUP`, `SIGQUIT`). A
//! signal-triggered release restores the default disposition and re-raises
//! the signal, so the process exit status still reflects the interruption.

use crate::errors::LockError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

pub const DEFAULT_LOCK_FILE: &str = "lintrun.lock";
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);
pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(60);

/// On-disk lock payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockPayload {
    pub pid: u32,
    /// Creation time, epoch milliseconds.
    pub created_at: u64,
}

impl LockPayload {
    fn current() -> Self {
        Self {
            pid: std::process::id(),
            created_at: epoch_ms(),
        }
    }

    fn age(&self) -> Duration {
        Duration::from_millis(epoch_ms().saturating_sub(self.created_at))
    }
}

fn epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Acquisition options. The liveness probe is an injected capability so
/// tests can substitute a stub without touching OS signal delivery.
pub struct LockOptions {
    pub path: PathBuf,
    pub poll_interval: Duration,
    pub stale_after: Duration,
    pub probe: fn(u32) -> bool,
    pub on_wait_start: Option<Box<dyn Fn() + Send + Sync>>,
    pub on_wait_end: Option<Box<dyn Fn() + Send + Sync>>,
    pub handle_signals: bool,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            path: std::env::temp_dir().join(DEFAULT_LOCK_FILE),
            poll_interval: DEFAULT_POLL_INTERVAL,
            stale_after: DEFAULT_STALE_AFTER,
            probe: process_is_alive,
            on_wait_start: None,
            on_wait_end: None,
            handle_signals: true,
        }
    }
}

impl LockOptions {
    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = path.into();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_stale_after(mut self, ceiling: Duration) -> Self {
        self.stale_after = ceiling;
        self
    }

    pub fn with_probe(mut self, probe: fn(u32) -> bool) -> Self {
        self.probe = probe;
        self
    }

    pub fn with_wait_hooks(
        mut self,
        on_start: Box<dyn Fn() + Send + Sync>,
        on_end: Box<dyn Fn() + Send + Sync>,
    ) -> Self {
        self.on_wait_start = Some(on_start);
        self.on_wait_end = Some(on_end);
        self
    }

    pub fn with_signal_handling(mut self, handle: bool) -> Self {
        self.handle_signals = handle;
        self
    }
}

/// Zero-signal liveness probe. A permission error on the probe still means
/// the process exists.
#[cfg(unix)]
pub fn process_is_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    match kill(Pid::from_raw(pid as i32), None) {
        Ok(_) => true,
        Err(Errno::ESRCH) => false,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

#[cfg(not(unix))]
pub fn process_is_alive(_pid: u32) -> bool {
    // No portable probe; never reclaim on liveness grounds (the age
    // ceiling still applies).
    true
}

enum Staleness {
    Live,
    /// File vanished between the create attempt and the read.
    Gone,
    Stale(&'static str),
}

/// Entry point for the cross-process execution lock.
pub struct ExecutionLock;

impl ExecutionLock {
    /// Block (polling) until ownership of the lock file is obtained.
    pub async fn acquire(options: LockOptions) -> Result<LockGuard, LockError> {
        let mut waiting = false;
        loop {
            match try_create(&options.path) {
                Ok(()) => {
                    if waiting && let Some(hook) = &options.on_wait_end {
                        hook();
                    }
                    debug!(path = %options.path.display(), "execution lock acquired");
                    return Ok(LockGuard::new(options.path, options.handle_signals));
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    match classify(&options)? {
                        Staleness::Stale(reason) => {
                            info!(path = %options.path.display(), reason, "removing stale lock");
                            remove_lock_file(&options.path)?;
                        }
                        Staleness::Gone => {}
                        Staleness::Live => {
                            if !waiting {
                                waiting = true;
                                if let Some(hook) = &options.on_wait_start {
                                    hook();
                                }
                            }
                            tokio::time::sleep(options.poll_interval).await;
                        }
                    }
                }
                Err(e) => {
                    return Err(LockError::Acquire {
                        path: options.path.clone(),
                        source: e,
                    });
                }
            }
        }
    }
}

fn try_create(path: &Path) -> io::Result<()> {
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)?;
    let json = serde_json::to_string(&LockPayload::current()).map_err(io::Error::other)?;
    if let Err(e) = file.write_all(json.as_bytes()) {
        let _ = fs::remove_file(path);
        return Err(e);
    }
    Ok(())
}

fn classify(options: &LockOptions) -> Result<Staleness, LockError> {
    let content = match fs::read_to_string(&options.path) {
        Ok(c) => c,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Staleness::Gone),
        Err(e) => {
            return Err(LockError::Read {
                path: options.path.clone(),
                source: e,
            });
        }
    };
    let payload: LockPayload = match serde_json::from_str(&content) {
        Ok(p) => p,
        Err(_) => return Ok(Staleness::Stale("malformed payload")),
    };
    if !(options.probe)(payload.pid) {
        return Ok(Staleness::Stale("owning process is not alive"));
    }
    if payload.age() > options.stale_after {
        return Ok(Staleness::Stale("age exceeds staleness ceiling"));
    }
    Ok(Staleness::Live)
}

fn remove_lock_file(path: &Path) -> Result<(), LockError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(LockError::Release {
            path: path.to_path_buf(),
            source: e,
        }),
    }
}

/// Owned lock. Released exactly once regardless of how many triggers fire.
pub struct LockGuard {
    path: PathBuf,
    released: Arc<AtomicBool>,
    signal_task: Option<tokio::task::JoinHandle<()>>,
}

impl LockGuard {
    fn new(path: PathBuf, handle_signals: bool) -> Self {
        let released = Arc::new(AtomicBool::new(false));
        #[cfg(unix)]
        let signal_task =
            handle_signals.then(|| spawn_signal_watcher(path.clone(), released.clone()));
        #[cfg(not(unix))]
        let signal_task = {
            let _ = handle_signals;
            None
        };
        Self {
            path,
            released,
            signal_task,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Release the lock. Idempotent; an already-missing file is not an
    /// error. Deregisters the signal watcher.
    pub fn release(&mut self) -> Result<(), LockError> {
        if let Some(task) = self.signal_task.take() {
            task.abort();
        }
        if self.released.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        debug!(path = %self.path.display(), "execution lock released");
        remove_lock_file(&self.path)
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Some(task) = self.signal_task.take() {
            task.abort();
        }
        if !self.released.swap(true, Ordering::SeqCst)
            && let Err(e) = fs::remove_file(&self.path)
            && e.kind() != io::ErrorKind::NotFound
        {
            warn!(path = %self.path.display(), error = %e, "failed to release execution lock");
        }
    }
}

#[cfg(unix)]
fn spawn_signal_watcher(path: PathBuf, released: Arc<AtomicBool>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        use nix::sys::signal::{SigHandler, Signal};
        use tokio::signal::unix::{SignalKind, signal};

        let Ok(mut interrupt) = signal(SignalKind::interrupt()) else {
            return;
        };
        let Ok(mut terminate) = signal(SignalKind::terminate()) else {
            return;
        };
        let Ok(mut hangup) = signal(SignalKind::hangup()) else {
            return;
        };
        let Ok(mut quit) = signal(SignalKind::quit()) else {
            return;
        };

        let sig = tokio::select! {
            _ = interrupt.recv() => Signal::SIGINT,
            _ = terminate.recv() => Signal::SIGTERM,
            _ = hangup.recv() => Signal::SIGHUP,
            _ = quit.recv() => Signal::SIGQUIT,
        };

        if !released.swap(true, Ordering::SeqCst) {
            let _ = fs::remove_file(&path);
        }

        // Default disposition before re-raising, so the exit status carries
        // the signal. Fall back to a plain exit if re-raising fails.
        unsafe {
            let _ = nix::sys::signal::signal(sig, SigHandler::SigDfl);
        }
        let _ = nix::sys::signal::raise(sig);
        std::process::exit(128 + sig as i32);
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tempfile::tempdir;
    use tokio::time::timeout;

    fn always_alive(_pid: u32) -> bool {
        true
    }

    fn never_alive(_pid: u32) -> bool {
        false
    }

    fn opts(path: &Path) -> LockOptions {
        LockOptions::default()
            .with_path(path)
            .with_poll_interval(Duration::from_millis(20))
            .with_signal_handling(false)
    }

    fn write_payload(path: &Path, pid: u32, created_at: u64) {
        let payload = LockPayload { pid, created_at };
        fs::write(path, serde_json::to_string(&payload).unwrap()).unwrap();
    }

    #[tokio::test]
    async fn acquire_writes_pid_payload() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("run.lock");
        let _guard = ExecutionLock::acquire(opts(&path)).await.unwrap();

        let payload: LockPayload =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(payload.pid, std::process::id());
        assert!(payload.created_at > 0);
    }

    #[tokio::test]
    async fn release_is_idempotent() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("run.lock");
        let mut guard = ExecutionLock::acquire(opts(&path)).await.unwrap();

        guard.release().unwrap();
        assert!(!path.exists());
        guard.release().unwrap();
    }

    #[tokio::test]
    async fn drop_releases_the_lock() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("run.lock");
        {
            let _guard = ExecutionLock::acquire(opts(&path)).await.unwrap();
            assert!(path.exists());
        }
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn dead_pid_lock_is_reclaimed_promptly() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("run.lock");
        write_payload(&path, 4_000_000, epoch_ms());

        let guard = timeout(
            Duration::from_millis(250),
            ExecutionLock::acquire(opts(&path).with_probe(never_alive)),
        )
        .await
        .expect("stale lock should be reclaimed within one poll interval")
        .unwrap();
        assert!(guard.path().exists());
    }

    #[tokio::test]
    async fn malformed_payload_is_reclaimed() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("run.lock");
        fs::write(&path, "not json at all").unwrap();

        let _guard = timeout(
            Duration::from_millis(250),
            ExecutionLock::acquire(opts(&path).with_probe(always_alive)),
        )
        .await
        .unwrap()
        .unwrap();
    }

    #[tokio::test]
    async fn age_ceiling_reclaims_even_a_live_owner() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("run.lock");
        write_payload(&path, std::process::id(), epoch_ms() - 120_000);

        let _guard = timeout(
            Duration::from_millis(250),
            ExecutionLock::acquire(
                opts(&path)
                    .with_probe(always_alive)
                    .with_stale_after(Duration::from_secs(60)),
            ),
        )
        .await
        .unwrap()
        .unwrap();
    }

    #[tokio::test]
    async fn live_lock_blocks_until_released() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("run.lock");
        let guard = ExecutionLock::acquire(opts(&path)).await.unwrap();

        // Second acquire must not succeed while the first guard is held.
        let pending = timeout(
            Duration::from_millis(150),
            ExecutionLock::acquire(opts(&path).with_probe(always_alive)),
        )
        .await;
        assert!(pending.is_err());

        drop(guard);
        let _second = timeout(
            Duration::from_millis(500),
            ExecutionLock::acquire(opts(&path).with_probe(always_alive)),
        )
        .await
        .expect("acquire should succeed after release")
        .unwrap();
    }

    #[tokio::test]
    async fn wait_hooks_fire_once_per_episode() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("run.lock");
        write_payload(&path, std::process::id(), epoch_ms());

        let started = Arc::new(AtomicUsize::new(0));
        let ended = Arc::new(AtomicUsize::new(0));
        let (s, e) = (started.clone(), ended.clone());

        let options = opts(&path).with_probe(always_alive).with_wait_hooks(
            Box::new(move || {
                s.fetch_add(1, Ordering::SeqCst);
            }),
            Box::new(move || {
                e.fetch_add(1, Ordering::SeqCst);
            }),
        );

        let acquire = tokio::spawn(ExecutionLock::acquire(options));
        tokio::time::sleep(Duration::from_millis(100)).await;
        fs::remove_file(&path).unwrap();

        let _guard = timeout(Duration::from_millis(500), acquire)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(started.load(Ordering::SeqCst), 1);
        assert_eq!(ended.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn uncontended_acquire_fires_no_hooks() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("run.lock");
        let started = Arc::new(AtomicUsize::new(0));
        let s = started.clone();

        let _guard = ExecutionLock::acquire(opts(&path).with_wait_hooks(
            Box::new(move || {
                s.fetch_add(1, Ordering::SeqCst);
            }),
            Box::new(|| {}),
        ))
        .await
        .unwrap();
        assert_eq!(started.load(Ordering::SeqCst), 0);
    }

    #[cfg(unix)]
    #[test]
    fn probe_reports_own_process_alive() {
        assert!(process_is_alive(std::process::id()));
    }
}
