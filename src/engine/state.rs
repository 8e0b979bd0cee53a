use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use fs2::FileExt;
use log::{debug, warn};
use tokio::task::JoinHandle;

use crate::error::CloneError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LaunchState {
    Idle,
    Launching,
}

impl LaunchState {
    const fn to_raw(self) -> u8 {
        match self {
            LaunchState::Idle => 0,
            LaunchState::Launching => 1,
        }
    }

    #[cfg(test)]
    const fn from_raw(raw: u8) -> Self {
        match raw {
            0 => LaunchState::Idle,
            _ => LaunchState::Launching,
        }
    }
}

/// Shared single-flight cell. The only way out of `Launching` is dropping the guard.
///
/// With a lock file, the cell also excludes launches from other processes
/// holding the same file.
#[derive(Clone, Debug, Default)]
pub struct LaunchStateCell {
    raw: Arc<AtomicU8>,
    lock_path: Option<PathBuf>,
}

impl LaunchStateCell {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_lock_file(path: impl Into<PathBuf>) -> Self {
        Self {
            raw: Arc::default(),
            lock_path: Some(path.into()),
        }
    }

    #[cfg(test)]
    pub fn current(&self) -> LaunchState {
        LaunchState::from_raw(self.raw.load(Ordering::SeqCst))
    }

    /// Move `Idle -> Launching`, or return `None` if a launch is already in flight
    /// here or in another process sharing the lock file.
    pub fn try_begin(&self) -> Option<LaunchGuard> {
        self.raw
            .compare_exchange(
                LaunchState::Idle.to_raw(),
                LaunchState::Launching.to_raw(),
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .ok()?;
        let mut guard = LaunchGuard {
            raw: self.raw.clone(),
            lock: None,
        };
        if let Some(path) = &self.lock_path {
            // Dropping the guard on failure puts the cell back to Idle.
            guard.lock = Some(acquire_lock(path)?);
        }
        Some(guard)
    }
}

fn acquire_lock(path: &Path) -> Option<File> {
    if let Some(parent) = path.parent()
        && let Err(err) = fs::create_dir_all(parent)
    {
        warn!("engine: cannot create lock dir {}: {err}", parent.display());
    }
    let file = match OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
    {
        Ok(file) => file,
        Err(err) => {
            warn!("engine: cannot open launch lock {}: {err}", path.display());
            return None;
        }
    };
    match file.try_lock_exclusive() {
        Ok(()) => Some(file),
        Err(err) => {
            debug!("engine: launch lock {} held elsewhere: {err}", path.display());
            None
        }
    }
}

/// Holds the cell in `Launching`; restores `Idle` when dropped, including on unwind.
#[derive(Debug)]
pub struct LaunchGuard {
    raw: Arc<AtomicU8>,
    lock: Option<File>,
}

impl Drop for LaunchGuard {
    fn drop(&mut self) {
        if let Some(lock) = self.lock.take() {
            let _ = lock.unlock();
        }
        self.raw
            .store(LaunchState::Idle.to_raw(), Ordering::SeqCst);
    }
}

/// Exit code of the child, `None` when it was terminated by a signal.
pub type LaunchResult = Result<Option<i32>, CloneError>;

#[derive(Debug)]
pub enum LaunchOutcome {
    Started(JoinHandle<LaunchResult>),
    AlreadyLaunching,
    HostNotReady,
    InstanceLimitReached { running: usize },
}

impl LaunchOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            LaunchOutcome::Started(_) => "started",
            LaunchOutcome::AlreadyLaunching => "already launching",
            LaunchOutcome::HostNotReady => "host not ready",
            LaunchOutcome::InstanceLimitReached { .. } => "instance limit reached",
        }
    }
}
