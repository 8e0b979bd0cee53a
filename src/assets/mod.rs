use std::fs::File;
use std::io::Read;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use log::{debug, error, info, warn};
use sha1::Sha1;
use sha2::{Digest, Sha256};
use tokio::fs;

use crate::engine::models::{AssetEntry, AssetManifest};
use crate::error::{CloneError, Result};
use crate::networking::RemoteSource;
use crate::storage;
use crate::util::{cache_buster, cache_busted_url};

/// Stable mirror that survives version bumps, for tools that do not follow the versioned path.
const DEV_DIR: &str = "dev";

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub assets_dir: PathBuf,
    pub version: u32,
    pub refreshed: bool,
    pub downloaded: usize,
    pub skipped: usize,
    pub mirror_failures: usize,
    pub hash_failures: usize,
}

/// Strict gate: only a newer remote version forces a full refresh.
#[must_use]
pub fn needs_refresh(local_version: u32, remote_version: u32) -> bool {
    remote_version > local_version
}

#[must_use]
pub fn should_download(exists: bool, refresh: bool, hash_mismatch: bool) -> bool {
    !exists || refresh || hash_mismatch
}

pub struct AssetSynchronizer {
    remote: Arc<dyn RemoteSource>,
}

impl AssetSynchronizer {
    pub fn new(remote: Arc<dyn RemoteSource>) -> Self {
        Self { remote }
    }

    pub async fn sync(&self, base_dir: &Path) -> Result<SyncReport> {
        info!("assets: starting sync in {}", base_dir.display());
        let local_version = storage::read_local_version(base_dir).await;

        let (manifest, refresh) = match self.remote.fetch_asset_manifest().await {
            Ok(manifest) => {
                let refresh = needs_refresh(local_version, manifest.version);
                debug!(
                    "assets: version check local={} remote={} refresh={}",
                    local_version, manifest.version, refresh
                );
                (manifest, refresh)
            }
            Err(err) => {
                // A flaky route to the asset host must not block launching.
                warn!("assets: version check failed ({err}); keeping local version {local_version}");
                (
                    AssetManifest {
                        version: local_version,
                        assets: Vec::new(),
                    },
                    false,
                )
            }
        };

        let assets_dir = base_dir.join(manifest.version.to_string());
        let dev_dir = base_dir.join(DEV_DIR);
        fs::create_dir_all(&assets_dir).await.map_err(|e| {
            CloneError::io(format!("unable to create {}", assets_dir.display()), e)
        })?;

        let mut report = SyncReport {
            assets_dir: assets_dir.clone(),
            version: manifest.version,
            refreshed: refresh,
            ..SyncReport::default()
        };

        for entry in &manifest.assets {
            self.sync_entry(entry, &assets_dir, &dev_dir, refresh, &mut report)
                .await?;
        }

        if refresh {
            if let Err(err) = storage::write_local_version(base_dir, manifest.version).await {
                error!("assets: could not write local asset version: {err}");
            }
        }

        info!(
            "assets: ok at {} ({} downloaded, {} up to date)",
            assets_dir.display(),
            report.downloaded,
            report.skipped
        );
        Ok(report)
    }

    async fn sync_entry(
        &self,
        entry: &AssetEntry,
        assets_dir: &Path,
        dev_dir: &Path,
        refresh: bool,
        report: &mut SyncReport,
    ) -> Result<()> {
        let relative = safe_relative_path(&entry.file_name)
            .ok_or_else(|| CloneError::download(&entry.url, format!("unsafe file name {:?}", entry.file_name)))?;
        let file_path = assets_dir.join(&relative);
        let dev_path = dev_dir.join(&relative);

        if let Some(parent) = file_path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| CloneError::io(format!("unable to create {}", parent.display()), e))?;
        }
        if let Some(parent) = dev_path.parent()
            && let Err(err) = fs::create_dir_all(parent).await
        {
            debug!("assets: mirror dir {} unavailable: {err}", parent.display());
        }

        let exists = file_path.exists();
        let mut mismatch = false;
        if exists && let Some(expected) = entry.declared_hash() {
            match hash_off_thread(&file_path, expected).await {
                Ok(matches) => mismatch = !matches,
                Err(err) => {
                    error!("assets: {err}");
                    report.hash_failures += 1;
                }
            }
        }

        if !should_download(exists, refresh, mismatch) {
            report.skipped += 1;
            return Ok(());
        }

        debug!("assets: downloading {} to {}", entry.url, entry.file_name);
        let url = cache_busted_url(&entry.url, cache_buster());
        let bytes = self.remote.download_bytes(&url).await?;
        fs::write(&file_path, &bytes)
            .await
            .map_err(|e| CloneError::io(format!("unable to write {}", file_path.display()), e))?;
        report.downloaded += 1;

        if let Err(err) = fs::write(&dev_path, &bytes).await {
            warn!("assets: could not mirror {}: {err}", dev_path.display());
            report.mirror_failures += 1;
        }
        Ok(())
    }
}

async fn hash_off_thread(path: &Path, expected: &str) -> Result<bool> {
    let owned_path = path.to_path_buf();
    let expected = expected.to_owned();
    tokio::task::spawn_blocking(move || hash_matches(&owned_path, &expected))
        .await
        .map_err(|e| CloneError::HashCheckFailed {
            path: path.to_path_buf(),
            reason: format!("hash task failed: {e}"),
        })?
}

/// Compare a file's digest to the declared hex string.
///
/// A 64-digit declaration is SHA-256; anything else is treated as SHA-1, which
/// is what the asset endpoint publishes.
pub fn hash_matches(path: &Path, expected: &str) -> Result<bool> {
    let actual = if expected.len() == 64 {
        file_digest::<Sha256>(path)?
    } else {
        file_digest::<Sha1>(path)?
    };
    debug!("assets: {} has {}, remote {}", path.display(), actual, expected);
    Ok(actual.eq_ignore_ascii_case(expected.trim()))
}

fn file_digest<D: Digest>(path: &Path) -> Result<String> {
    let hash_err = |e: std::io::Error| CloneError::HashCheckFailed {
        path: path.to_path_buf(),
        reason: e.to_string(),
    };
    let mut file = File::open(path).map_err(hash_err)?;
    let mut hasher = D::new();
    let mut buf = [0u8; 8192];
    loop {
        let read = file.read(&mut buf).map_err(hash_err)?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    Ok(hasher
        .finalize()
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect())
}

/// Reject manifest file names that would escape the asset directory.
fn safe_relative_path(file_name: &str) -> Option<PathBuf> {
    let path = Path::new(file_name);
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    (!out.as_os_str().is_empty()).then_some(out)
}
