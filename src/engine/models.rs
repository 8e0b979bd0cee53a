use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::util::non_blank;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetEntry {
    #[serde(rename = "Url", alias = "url")]
    pub url: String,
    #[serde(rename = "FileName", alias = "fileName")]
    pub file_name: String,
    #[serde(rename = "Hash", alias = "hash", default)]
    pub hash: Option<String>,
}

impl AssetEntry {
    /// Declared hash, or `None` when the publisher marked the entry unhashed.
    pub fn declared_hash(&self) -> Option<&str> {
        non_blank(self.hash.as_deref())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetManifest {
    #[serde(rename = "Version", alias = "version")]
    pub version: u32,
    #[serde(rename = "Assets", alias = "assets", default)]
    pub assets: Vec<AssetEntry>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeVersionInfo {
    #[serde(rename = "assemblyVersion")]
    pub assembly_version: String,
    #[serde(rename = "downloadUrl")]
    pub download_url: String,
}

pub type RuntimeStreamMap = BTreeMap<String, RuntimeVersionInfo>;

/// One named launch configuration. Blank overrides fall back to host defaults.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LaunchProfile {
    pub name: String,
    pub user_path: Option<String>,
    pub runtime_base_path: Option<PathBuf>,
    pub game_path: Option<PathBuf>,
    pub selected_stream: String,
}

impl Default for LaunchProfile {
    fn default() -> Self {
        Self {
            name: String::new(),
            user_path: None,
            runtime_base_path: None,
            game_path: None,
            selected_stream: "release".into(),
        }
    }
}

impl LaunchProfile {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn user_path_override(&self) -> Option<&str> {
        non_blank(self.user_path.as_deref())
    }

    pub fn runtime_base_override(&self) -> Option<&Path> {
        non_blank_path(self.runtime_base_path.as_deref())
    }

    pub fn game_path_override(&self) -> Option<&Path> {
        non_blank_path(self.game_path.as_deref())
    }

    pub fn display_name(&self, index: usize) -> String {
        if self.name.trim().is_empty() {
            format!("Profile {index}")
        } else {
            self.name.clone()
        }
    }
}

// Identity is the launch-relevant fields only; names are cosmetic.
impl PartialEq for LaunchProfile {
    fn eq(&self, other: &Self) -> bool {
        self.user_path == other.user_path
            && self.runtime_base_path == other.runtime_base_path
            && self.game_path == other.game_path
            && self.selected_stream == other.selected_stream
    }
}

impl Eq for LaunchProfile {}

fn non_blank_path(path: Option<&Path>) -> Option<&Path> {
    path.filter(|p| !p.as_os_str().to_string_lossy().trim().is_empty())
}
