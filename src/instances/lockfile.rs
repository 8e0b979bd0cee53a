use std::fs::OpenOptions;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use log::debug;

use super::InstanceSlots;

/// Instance slots backed by advisory lock files.
///
/// A running client holds an exclusive lock on its slot file; a slot exists
/// while that lock is held. There is no way to take a slot away from another
/// process, so force release is unsupported.
pub struct LockFileSlots {
    dir: PathBuf,
}

impl LockFileSlots {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn slot_path(&self, name: &str) -> PathBuf {
        self.dir.join(lock_file_name(name))
    }
}

fn lock_file_name(name: &str) -> String {
    let flat: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    format!("{flat}.lock")
}

fn is_locked(path: &Path) -> bool {
    let file = match OpenOptions::new().read(true).write(true).open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == ErrorKind::NotFound => return false,
        // Present but not ours to open.
        Err(err) if err.kind() == ErrorKind::PermissionDenied => return true,
        Err(err) => {
            debug!("instances: probing {} failed: {err}", path.display());
            return false;
        }
    };
    match file.try_lock_exclusive() {
        Ok(()) => {
            let _ = file.unlock();
            false
        }
        Err(_) => true,
    }
}

impl InstanceSlots for LockFileSlots {
    fn slot_exists(&self, name: &str) -> bool {
        is_locked(&self.slot_path(name))
    }
}
