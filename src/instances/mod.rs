use log::{debug, info, warn};

use crate::error::{CloneError, Result};

#[cfg(not(windows))]
pub mod lockfile;
#[cfg(windows)]
pub mod windows;

/// Prefix of the named mutexes the game client creates, one per running instance.
pub const SLOT_PREFIX: &str = r"Global\6AA83AB5-BAC4-4a36-9F66-A309770760CB_ffxiv_game";
pub const SLOT_COUNT: usize = 10;
/// Clients allowed side by side before the launch is refused.
pub const MAX_CLIENTS: usize = 2;

/// Suffixes released when the instance limit is lifted.
pub fn default_release_suffixes() -> Vec<String> {
    ["00", "01"]
        .iter()
        .map(|n| format!("6AA83AB5-BAC4-4a36-9F66-A309770760CB_ffxiv_game{n}"))
        .collect()
}

pub fn slot_name(index: usize) -> String {
    format!("{SLOT_PREFIX}{index:02}")
}

/// OS primitive behind the instance slots.
pub trait InstanceSlots: Send + Sync {
    /// Whether a slot with this name currently exists. Existing-but-inaccessible counts.
    fn slot_exists(&self, name: &str) -> bool;

    fn supports_force_release(&self) -> bool {
        false
    }

    /// Close every slot handle whose name ends with one of `suffixes`; returns how many closed.
    fn force_release(&self, _suffixes: &[String]) -> Result<usize> {
        Err(CloneError::InstanceSlots(
            "slots cannot be released on this platform".into(),
        ))
    }
}

pub struct InstanceGuard {
    slots: Box<dyn InstanceSlots>,
}

impl InstanceGuard {
    pub fn new(slots: Box<dyn InstanceSlots>) -> Self {
        Self { slots }
    }

    /// Guard over the current platform's slot primitive, covering every client process.
    pub fn platform() -> Self {
        #[cfg(windows)]
        let slots: Box<dyn InstanceSlots> = Box::new(windows::NamedMutexSlots::system_wide());
        #[cfg(not(windows))]
        let slots: Box<dyn InstanceSlots> =
            Box::new(lockfile::LockFileSlots::new(crate::env::slots_dir()));
        Self::new(slots)
    }

    pub fn count_running_instances(&self) -> usize {
        let count = (0..SLOT_COUNT)
            .filter(|&i| self.slots.slot_exists(&slot_name(i)))
            .count();
        debug!("instances: {count} slot(s) in use");
        count
    }

    pub fn supports_force_release(&self) -> bool {
        self.slots.supports_force_release()
    }

    /// Best-effort; returns 0 when the platform cannot release slots.
    pub fn force_release_instance_slots(&self, suffixes: &[String]) -> usize {
        if !self.slots.supports_force_release() {
            debug!("instances: force release unsupported on this platform");
            return 0;
        }
        if self.count_running_instances() == 0 {
            return 0;
        }
        match self.slots.force_release(suffixes) {
            Ok(closed) => {
                info!("instances: closed {closed} slot handle(s)");
                closed
            }
            Err(err) => {
                warn!("instances: force release failed: {err}");
                0
            }
        }
    }
}
