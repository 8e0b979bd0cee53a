use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::engine::models::LaunchProfile;
use crate::error::{CloneError, Result};

/// External sandbox launcher the child can be wrapped in.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxSettings {
    pub launcher_path: PathBuf,
    pub box_name: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub version: u32,
    pub profiles: Vec<LaunchProfile>,
    pub default_profile_index: usize,
    pub remove_instance_limit: bool,
    pub known_streams: Vec<String>,
    pub auto_clone: bool,
    pub sandbox: Option<SandboxSettings>,
    /// Last deleted profile, kept so the deletion can be undone.
    #[serde(skip_serializing_if = "Option::is_none")]
    deleted: Option<LaunchProfile>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            version: 1,
            profiles: Vec::new(),
            default_profile_index: 0,
            remove_instance_limit: false,
            known_streams: vec!["release".into(), "stg".into(), "net5".into()],
            auto_clone: false,
            sandbox: None,
            deleted: None,
        }
    }
}

impl Settings {
    /// Load settings, falling back to defaults when the file does not exist yet.
    pub fn load(path: &Path) -> Result<Self> {
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!("config: no settings at {}, using defaults", path.display());
                return Ok(Self::default());
            }
            Err(err) => {
                return Err(CloneError::io(format!("failed to read {}", path.display()), err));
            }
        };
        let parse_err =
            |e: serde_json::Error| CloneError::Config(format!("failed to parse {}: {e}", path.display()));
        let value: serde_json::Value = serde_json::from_str(&text).map_err(parse_err)?;
        // `serde(default)` would also accept a sequence and silently reset everything.
        if !value.is_object() {
            return Err(CloneError::Config(format!(
                "{} does not contain a settings object",
                path.display()
            )));
        }
        let mut settings: Settings = serde_json::from_value(value).map_err(parse_err)?;
        if settings.default_profile_index >= settings.profiles.len() {
            settings.default_profile_index = 0;
        }
        Ok(settings)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| CloneError::io("failed to create settings dir", e))?;
        }
        let bytes = serde_json::to_vec_pretty(self)
            .map_err(|e| CloneError::Config(format!("failed to serialize settings: {e}")))?;
        fs::write(path, bytes)
            .map_err(|e| CloneError::io(format!("failed to write {}", path.display()), e))?;
        info!("config: saved {}", path.display());
        Ok(())
    }

    /// The default profile, creating an empty one when none exist.
    pub fn default_profile(&mut self) -> &LaunchProfile {
        if self.profiles.is_empty() {
            self.profiles.push(LaunchProfile::default());
            self.default_profile_index = 0;
        }
        let index = self.default_profile_index.min(self.profiles.len() - 1);
        &self.profiles[index]
    }

    pub fn find_profile(&self, name: &str) -> Option<&LaunchProfile> {
        self.profiles
            .iter()
            .find(|p| p.name.eq_ignore_ascii_case(name.trim()))
    }

    pub fn add_profile(&mut self, profile: LaunchProfile) -> usize {
        self.profiles.push(profile);
        self.profiles.len() - 1
    }

    pub fn copy_profile(&mut self, index: usize) -> Option<usize> {
        let copy = self.profiles.get(index)?.clone();
        Some(self.add_profile(copy))
    }

    pub fn set_default(&mut self, index: usize) -> Result<()> {
        if index >= self.profiles.len() {
            return Err(CloneError::Config(format!("no profile at index {index}")));
        }
        self.default_profile_index = index;
        Ok(())
    }

    /// Remove a profile. The default profile cannot be deleted.
    pub fn delete_profile(&mut self, index: usize) -> Result<LaunchProfile> {
        if index >= self.profiles.len() {
            return Err(CloneError::Config(format!("no profile at index {index}")));
        }
        if index == self.default_profile_index {
            return Err(CloneError::Config("the default profile cannot be deleted".into()));
        }
        let removed = self.profiles.remove(index);
        if self.default_profile_index > index {
            self.default_profile_index -= 1;
        }
        self.deleted = Some(removed.clone());
        Ok(removed)
    }

    /// Restore the most recently deleted profile, if any, at the end of the list.
    pub fn undo_delete(&mut self) -> Option<usize> {
        let profile = self.deleted.take()?;
        Some(self.add_profile(profile))
    }

    /// Replace the stream picker contents; returns whether anything changed.
    pub fn set_known_streams(&mut self, streams: &[String]) -> bool {
        if streams.is_empty() || self.known_streams == streams {
            return false;
        }
        self.known_streams = streams.to_vec();
        true
    }
}
