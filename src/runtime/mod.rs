use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, info, warn};
use zip::read::ZipArchive;

use crate::env;
use crate::error::{CloneError, Result};
use crate::networking::RemoteSource;

/// A runtime build that is present on disk and ready to inject.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedRuntime {
    pub assembly_version: String,
    pub version_dir: PathBuf,
}

pub struct RuntimeResolver {
    remote: Arc<dyn RemoteSource>,
    scratch_dir: PathBuf,
}

impl RuntimeResolver {
    pub fn new(remote: Arc<dyn RemoteSource>, scratch_dir: impl Into<PathBuf>) -> Self {
        Self {
            remote,
            scratch_dir: scratch_dir.into(),
        }
    }

    /// Make sure the build published for `stream` exists under `runtime_base`.
    ///
    /// `observe_streams` receives every stream name in the fetched map before
    /// the lookup, so callers can refresh their picker even when `stream` is
    /// unknown. Presence of the version directory is trusted without hashing.
    pub async fn resolve<F>(
        &self,
        stream: &str,
        runtime_base: &Path,
        observe_streams: F,
    ) -> Result<ResolvedRuntime>
    where
        F: FnOnce(&[String]),
    {
        info!("runtime: resolving stream {stream}");
        let streams = self
            .remote
            .fetch_runtime_streams()
            .await
            .map_err(|e| CloneError::RuntimeUpdateFailed(format!("stream list unavailable: {e}")))?;

        let names: Vec<String> = streams.keys().cloned().collect();
        observe_streams(&names);

        let info = streams
            .get(stream)
            .ok_or_else(|| CloneError::UnknownStream(stream.to_owned()))?;
        let version_dir = env::runtime_version_dir(runtime_base, &info.assembly_version);
        let resolved = ResolvedRuntime {
            assembly_version: info.assembly_version.clone(),
            version_dir: version_dir.clone(),
        };

        if version_dir.is_dir() {
            debug!(
                "runtime: {} already present at {}",
                info.assembly_version,
                version_dir.display()
            );
            return Ok(resolved);
        }

        info!("runtime: downloading build {}", info.assembly_version);
        let archive_path = self
            .scratch_dir
            .join(format!("{}.zip", info.assembly_version));
        if archive_path.exists() {
            fs::remove_file(&archive_path).map_err(|e| {
                CloneError::RuntimeUpdateFailed(format!(
                    "unable to clear stale archive {}: {e}",
                    archive_path.display()
                ))
            })?;
        }
        self.remote
            .download_to_path(&info.download_url, &archive_path)
            .await
            .map_err(|e| CloneError::RuntimeUpdateFailed(e.to_string()))?;

        let (archive, dest) = (archive_path.clone(), version_dir.clone());
        let extracted = tokio::task::spawn_blocking(move || extract_zip(&archive, &dest))
            .await
            .unwrap_or_else(|e| Err(format!("extraction task failed: {e}")));
        if let Err(err) = extracted {
            // A half-written directory would be trusted on the next run.
            let _ = fs::remove_dir_all(&version_dir);
            return Err(CloneError::RuntimeUpdateFailed(err));
        }
        if let Err(err) = fs::remove_file(&archive_path) {
            debug!("runtime: could not remove {}: {err}", archive_path.display());
        }

        info!("runtime: {} ready at {}", info.assembly_version, version_dir.display());
        Ok(resolved)
    }
}

fn extract_zip(archive_path: &Path, dest: &Path) -> Result<(), String> {
    info!("runtime: extracting {} into {}", archive_path.display(), dest.display());
    let file = fs::File::open(archive_path).map_err(|e| format!("zip open error: {e}"))?;
    let mut archive = ZipArchive::new(file).map_err(|e| format!("zip parse error: {e}"))?;
    fs::create_dir_all(dest).map_err(|e| format!("zip dest create error: {e}"))?;
    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|e| format!("zip entry error: {e}"))?;
        let Some(relative) = entry.enclosed_name() else {
            warn!("runtime: skipping unsafe zip entry {}", entry.name());
            continue;
        };
        let out_path = dest.join(relative);
        if entry.is_dir() {
            fs::create_dir_all(&out_path).map_err(|e| format!("zip dir create error: {e}"))?;
            continue;
        }
        if let Some(parent) = out_path.parent() {
            fs::create_dir_all(parent).map_err(|e| format!("zip parent dir error: {e}"))?;
        }
        let mut out_file =
            fs::File::create(&out_path).map_err(|e| format!("zip create file error: {e}"))?;
        io::copy(&mut entry, &mut out_file).map_err(|e| format!("zip write error: {e}"))?;
    }
    Ok(())
}
