use std::env;
use std::path::PathBuf;

/// Directory name the modding runtime uses under the roaming app-data root.
const RUNTIME_DIR_NAME: &str = "XIVLauncher";
const APP_DIR_NAME: &str = "clone-session";

fn app_data_root() -> PathBuf {
    match env::consts::OS {
        "windows" => env::var_os("APPDATA")
            .or_else(|| env::var_os("LOCALAPPDATA"))
            .map(PathBuf::from),
        "macos" => env::var_os("HOME")
            .map(PathBuf::from)
            .map(|home| home.join("Library").join("Application Support")),
        _ => env::var_os("XDG_DATA_HOME")
            .map(PathBuf::from)
            .or_else(|| {
                env::var_os("HOME")
                    .map(PathBuf::from)
                    .map(|home| home.join(".local").join("share"))
            }),
    }
    .unwrap_or_else(|| PathBuf::from("."))
}

/// Default runtime base directory when a profile does not override it.
pub fn default_runtime_base() -> PathBuf {
    app_data_root().join(RUNTIME_DIR_NAME)
}

/// Root directory for this tool's own files (settings, host snapshot, scratch).
pub fn default_app_dir() -> PathBuf {
    app_data_root().join(APP_DIR_NAME)
}

pub fn settings_path() -> PathBuf {
    default_app_dir().join("settings.json")
}

pub fn host_path() -> PathBuf {
    default_app_dir().join("host.json")
}

/// Scratch directory for runtime archives before extraction.
pub fn scratch_dir() -> PathBuf {
    default_app_dir().join("cache")
}

/// Lock file that keeps concurrent launcher processes from launching at once.
pub fn launch_lock_path() -> PathBuf {
    default_app_dir().join("launch.lock")
}

/// Directory holding lock-file instance slots on platforms without named mutexes.
pub fn slots_dir() -> PathBuf {
    env::var_os("XDG_RUNTIME_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(env::temp_dir)
        .join(APP_DIR_NAME)
}

pub fn asset_base_dir(runtime_base: &std::path::Path) -> PathBuf {
    runtime_base.join("dalamudAssets")
}

pub fn runtime_version_dir(runtime_base: &std::path::Path, version: &str) -> PathBuf {
    runtime_base.join("addon").join("Hooks").join(version)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn derives_runtime_layout_from_base() {
        let base = Path::new("base");
        assert_eq!(
            runtime_version_dir(base, "9.0.0.1"),
            Path::new("base").join("addon").join("Hooks").join("9.0.0.1")
        );
        assert_eq!(asset_base_dir(base), base.join("dalamudAssets"));
    }

    #[test]
    fn app_files_live_under_app_dir() {
        let root = default_app_dir();
        assert!(settings_path().starts_with(&root));
        assert!(host_path().starts_with(&root));
        assert!(scratch_dir().starts_with(&root));
        assert!(launch_lock_path().starts_with(&root));
        assert!(default_runtime_base().ends_with(RUNTIME_DIR_NAME));
    }
}
