use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use arboard::Clipboard;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

/// Proof that the host runtime finished its own startup.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StartInfo {
    pub client_language: String,
}

/// Narrow view of the host process the orchestrator is allowed to use.
pub trait HostServices: Send + Sync {
    /// `None` until the host has completed initialization.
    fn start_info(&self) -> Option<StartInfo>;

    /// Raw value of one of the host's own launch arguments, forwarded verbatim.
    fn game_argument(&self, key: &str) -> Option<String>;

    /// Game binary the host itself was started with.
    fn game_path(&self) -> PathBuf;

    /// User data path the host itself was started with.
    fn user_path(&self) -> String;

    fn set_clipboard(&self, text: &str);

    /// Stream names observed on the release endpoint, for the profile picker.
    fn publish_streams(&self, streams: &[String]);
}

/// Snapshot of the host's launch state, written by the host integration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HostSnapshot {
    pub game_path: PathBuf,
    pub user_path: String,
    pub client_language: String,
    pub arguments: BTreeMap<String, String>,
}

/// `HostServices` backed by a `host.json` snapshot on disk.
///
/// A missing or unreadable snapshot means the host is not ready. The command
/// line goes to the system clipboard; `clipboard_path` is written only when
/// no clipboard is available or it is disabled.
pub struct FileHost {
    snapshot: Option<HostSnapshot>,
    clipboard_path: PathBuf,
    system_clipboard: bool,
    streams_sink: Option<Box<dyn Fn(&[String]) + Send + Sync>>,
}

impl FileHost {
    pub fn load(path: &Path, clipboard_path: impl Into<PathBuf>) -> Self {
        let snapshot = match std::fs::read_to_string(path) {
            Ok(text) => match serde_json::from_str::<HostSnapshot>(&text) {
                Ok(snapshot) => Some(snapshot),
                Err(err) => {
                    warn!("host: {} is not valid: {err}", path.display());
                    None
                }
            },
            Err(err) => {
                debug!("host: no snapshot at {}: {err}", path.display());
                None
            }
        };
        Self {
            snapshot,
            clipboard_path: clipboard_path.into(),
            system_clipboard: true,
            streams_sink: None,
        }
    }

    /// Only write the fallback file, never the system clipboard.
    pub fn without_system_clipboard(mut self) -> Self {
        self.system_clipboard = false;
        self
    }

    fn write_clipboard_file(&self, text: &str) {
        if let Some(parent) = self.clipboard_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        match std::fs::write(&self.clipboard_path, text) {
            Ok(()) => info!("host: command line saved to {}", self.clipboard_path.display()),
            Err(err) => warn!("host: could not save command line: {err}"),
        }
    }

    pub fn on_streams(mut self, sink: impl Fn(&[String]) + Send + Sync + 'static) -> Self {
        self.streams_sink = Some(Box::new(sink));
        self
    }
}

#[cfg(test)]
impl FileHost {
    pub fn from_snapshot(snapshot: HostSnapshot, clipboard_path: impl Into<PathBuf>) -> Self {
        Self {
            snapshot: Some(snapshot),
            clipboard_path: clipboard_path.into(),
            system_clipboard: true,
            streams_sink: None,
        }
    }
}

impl HostServices for FileHost {
    fn start_info(&self) -> Option<StartInfo> {
        self.snapshot.as_ref().map(|s| StartInfo {
            client_language: s.client_language.clone(),
        })
    }

    fn game_argument(&self, key: &str) -> Option<String> {
        self.snapshot.as_ref()?.arguments.get(key).cloned()
    }

    fn game_path(&self) -> PathBuf {
        self.snapshot
            .as_ref()
            .map(|s| s.game_path.clone())
            .unwrap_or_default()
    }

    fn user_path(&self) -> String {
        self.snapshot
            .as_ref()
            .map(|s| s.user_path.clone())
            .unwrap_or_default()
    }

    fn set_clipboard(&self, text: &str) {
        if self.system_clipboard {
            match Clipboard::new().and_then(|mut clipboard| clipboard.set_text(text)) {
                Ok(()) => {
                    info!("host: command line copied to clipboard");
                    return;
                }
                Err(err) => warn!("host: system clipboard unavailable: {err}"),
            }
        }
        self.write_clipboard_file(text);
    }

    fn publish_streams(&self, streams: &[String]) {
        debug!("host: streams available {:?}", streams);
        if let Some(sink) = &self.streams_sink {
            sink(streams);
        }
    }
}

#[cfg(test)]
pub mod fake {
    use std::sync::Mutex;

    use super::*;

    /// Host that is ready unless told otherwise and records side effects.
    #[derive(Default)]
    pub struct FakeHost {
        pub not_ready: bool,
        pub arguments: BTreeMap<String, String>,
        pub clipboard: Mutex<Vec<String>>,
        pub streams: Mutex<Vec<String>>,
    }

    impl FakeHost {
        pub fn ready() -> Self {
            let arguments = [
                ("Language", "1"),
                ("DEV.DataPathType", "1"),
                ("DEV.MaxEntitledExpansionID", "4"),
                ("DEV.TestSID", "ticket"),
                ("DEV.UseSqPack", "1"),
                ("SYS.Region", "3"),
                ("language", "1"),
                ("resetConfig", "0"),
                ("ver", "2024.01.01.0000.0000"),
            ]
            .into_iter()
            .map(|(k, v)| (k.to_owned(), v.to_owned()))
            .collect();
            Self {
                arguments,
                ..Self::default()
            }
        }
    }

    impl HostServices for FakeHost {
        fn start_info(&self) -> Option<StartInfo> {
            (!self.not_ready).then(|| StartInfo {
                client_language: "English".into(),
            })
        }

        fn game_argument(&self, key: &str) -> Option<String> {
            self.arguments.get(key).cloned()
        }

        fn game_path(&self) -> PathBuf {
            PathBuf::from("C:/game/ffxiv_dx11.exe")
        }

        fn user_path(&self) -> String {
            "C:/Users/me/Documents/My Games".into()
        }

        fn set_clipboard(&self, text: &str) {
            self.clipboard.lock().unwrap().push(text.to_owned());
        }

        fn publish_streams(&self, streams: &[String]) {
            *self.streams.lock().unwrap() = streams.to_vec();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;

    #[test]
    fn missing_snapshot_means_not_ready() {
        let dir = tempfile::tempdir().unwrap();
        let host = FileHost::load(&dir.path().join("host.json"), dir.path().join("clip.txt"));
        assert!(host.start_info().is_none());
        assert_eq!(host.game_argument("ver"), None);
        assert_eq!(host.user_path(), "");
    }

    #[test]
    fn loads_snapshot_and_writes_clipboard_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("host.json");
        std::fs::write(
            &path,
            r#"{"gamePath": "C:/game/ffxiv_dx11.exe", "userPath": "C:/user",
                "clientLanguage": "English", "arguments": {"ver": "2024.01.01", "SYS.Region": "3"}}"#,
        )
        .unwrap();
        let clip = dir.path().join("out").join("last-command.txt");
        let host = FileHost::load(&path, &clip).without_system_clipboard();

        assert_eq!(
            host.start_info(),
            Some(StartInfo {
                client_language: "English".into()
            })
        );
        assert_eq!(host.game_argument("SYS.Region").as_deref(), Some("3"));
        assert_eq!(host.game_path(), PathBuf::from("C:/game/ffxiv_dx11.exe"));

        host.set_clipboard("launch -g x");
        assert_eq!(std::fs::read_to_string(clip).unwrap(), "launch -g x");
    }

    #[test]
    fn clipboard_file_is_created_with_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let clip = dir.path().join("a").join("b").join("last-command.txt");
        let host = FileHost::from_snapshot(HostSnapshot::default(), &clip).without_system_clipboard();

        host.set_clipboard("first");
        host.set_clipboard("second");
        assert_eq!(std::fs::read_to_string(clip).unwrap(), "second");
    }

    #[test]
    fn malformed_snapshot_is_not_ready() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("host.json");
        std::fs::write(&path, "{ nope").unwrap();
        assert!(FileHost::load(&path, dir.path().join("c")).start_info().is_none());
    }

    #[test]
    fn stream_sink_receives_names() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let host = FileHost::from_snapshot(HostSnapshot::default(), "clip.txt")
            .on_streams(move |names| *sink.lock().unwrap() = names.to_vec());
        host.publish_streams(&["release".into(), "stg".into()]);
        assert_eq!(*seen.lock().unwrap(), vec!["release", "stg"]);
    }
}
