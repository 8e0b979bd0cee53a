use std::path::{Path, PathBuf};

use log::{debug, error};
use tokio::fs;

use crate::error::{CloneError, Result};

const LOCAL_VERSION_FILE: &str = "asset.ver";

pub fn local_version_path(base_dir: &Path) -> PathBuf {
    base_dir.join(LOCAL_VERSION_FILE)
}

/// Last synchronized asset version, or 0 when unknown.
///
/// Falling back to 0 means the next sync treats every asset as stale, which is
/// the safe direction.
pub async fn read_local_version(base_dir: &Path) -> u32 {
    let path = local_version_path(base_dir);
    let text = match fs::read_to_string(&path).await {
        Ok(text) => text,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            debug!("storage: no version marker at {}", path.display());
            return 0;
        }
        Err(err) => {
            error!("storage: could not read {}: {err}", path.display());
            return 0;
        }
    };
    match text.trim().parse::<u32>() {
        Ok(version) => version,
        Err(err) => {
            error!(
                "storage: could not parse {} ({:?}): {err}",
                path.display(),
                text.trim()
            );
            0
        }
    }
}

/// Persist the asset version marker. Callers may treat failure as non-fatal.
pub async fn write_local_version(base_dir: &Path, version: u32) -> Result<()> {
    let path = local_version_path(base_dir);
    fs::create_dir_all(base_dir)
        .await
        .map_err(|e| CloneError::io("unable to create asset base dir", e))?;
    fs::write(&path, version.to_string())
        .await
        .map_err(|e| CloneError::io(format!("unable to persist {}", path.display()), e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_marker_reads_as_zero() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(read_local_version(dir.path()).await, 0);
    }

    #[tokio::test]
    async fn garbage_marker_reads_as_zero() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(local_version_path(dir.path()), "not-a-number").unwrap();
        assert_eq!(read_local_version(dir.path()).await, 0);
    }

    #[tokio::test]
    async fn marker_round_trips_with_whitespace() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(local_version_path(dir.path()), " 12\n").unwrap();
        assert_eq!(read_local_version(dir.path()).await, 12);

        write_local_version(dir.path(), 13).await.unwrap();
        assert_eq!(
            std::fs::read_to_string(local_version_path(dir.path())).unwrap(),
            "13"
        );
    }

    #[tokio::test]
    async fn write_failure_is_reported_not_panicked() {
        let dir = tempfile::tempdir().unwrap();
        // A regular file where the base directory should be.
        let blocker = dir.path().join("assets");
        std::fs::write(&blocker, b"x").unwrap();
        assert!(write_local_version(&blocker, 3).await.is_err());
    }
}
