use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, error, info, warn};
use tokio::runtime::Handle;

use crate::assets::AssetSynchronizer;
use crate::config::SandboxSettings;
use crate::engine::models::LaunchProfile;
use crate::engine::state::{LaunchOutcome, LaunchResult, LaunchStateCell};
use crate::env;
use crate::error::CloneError;
use crate::host::{HostServices, StartInfo};
use crate::instances::{InstanceGuard, MAX_CLIENTS, default_release_suffixes};
use crate::networking::RemoteSource;
use crate::process::{LaunchInputs, ProcessSpawner, build_launch_command};
use crate::runtime::RuntimeResolver;

pub mod models;
pub mod state;

/// Collaborators a launch needs; all shared with the background task.
#[derive(Clone)]
pub struct LaunchServices {
    pub remote: Arc<dyn RemoteSource>,
    pub spawner: Arc<dyn ProcessSpawner>,
    pub host: Arc<dyn HostServices>,
    pub instances: Arc<InstanceGuard>,
}

#[derive(Clone, Debug)]
pub struct LaunchOptions {
    pub remove_instance_limit: bool,
    pub sandbox: Option<SandboxSettings>,
    pub default_runtime_base: PathBuf,
    pub scratch_dir: PathBuf,
    /// Lock file shared by every launcher process; `None` keeps single-flight in-process only.
    pub lock_path: Option<PathBuf>,
}

impl Default for LaunchOptions {
    fn default() -> Self {
        Self {
            remove_instance_limit: false,
            sandbox: None,
            default_runtime_base: env::default_runtime_base(),
            scratch_dir: env::scratch_dir(),
            lock_path: Some(env::launch_lock_path()),
        }
    }
}

/// Single-flight launcher: at most one sync/resolve/spawn sequence at a time.
///
/// There is no cancellation. Once a launch starts, the state stays
/// `Launching` until the child exits or a stage fails.
pub struct LaunchOrchestrator {
    state: LaunchStateCell,
    runtime: Handle,
    services: LaunchServices,
    options: LaunchOptions,
}

impl LaunchOrchestrator {
    pub fn new(runtime: Handle, services: LaunchServices, options: LaunchOptions) -> Self {
        let state = match &options.lock_path {
            Some(path) => LaunchStateCell::with_lock_file(path),
            None => LaunchStateCell::new(),
        };
        Self {
            state,
            runtime,
            services,
            options,
        }
    }

    #[cfg(test)]
    pub fn state(&self) -> state::LaunchState {
        self.state.current()
    }

    #[cfg(test)]
    pub fn instances(&self) -> &InstanceGuard {
        &self.services.instances
    }

    /// Start a launch for `profile` without blocking the caller.
    pub fn launch(&self, profile: LaunchProfile) -> LaunchOutcome {
        let Some(guard) = self.state.try_begin() else {
            debug!("engine: launch already in progress, ignoring");
            return LaunchOutcome::AlreadyLaunching;
        };

        let instances = &self.services.instances;
        if self.options.remove_instance_limit {
            instances.force_release_instance_slots(&default_release_suffixes());
        } else {
            let running = instances.count_running_instances();
            if running >= MAX_CLIENTS {
                warn!("engine: {running} clients already running, refusing launch");
                return LaunchOutcome::InstanceLimitReached { running };
            }
        }

        let Some(start_info) = self.services.host.start_info() else {
            warn!("engine: {}", CloneError::HostNotReady);
            return LaunchOutcome::HostNotReady;
        };

        let runtime_base = profile
            .runtime_base_override()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.options.default_runtime_base.clone());
        let job = LaunchJob {
            services: self.services.clone(),
            options: self.options.clone(),
            profile,
            runtime_base,
            start_info,
        };

        let handle = self.runtime.spawn(async move {
            let _guard = guard;
            let result = job.run().await;
            if let Err(err) = &result {
                error!("engine: launch failed: {err}");
            }
            result
        });
        LaunchOutcome::Started(handle)
    }
}

struct LaunchJob {
    services: LaunchServices,
    options: LaunchOptions,
    profile: LaunchProfile,
    runtime_base: PathBuf,
    start_info: StartInfo,
}

impl LaunchJob {
    async fn run(self) -> LaunchResult {
        let LaunchServices {
            remote,
            spawner,
            host,
            ..
        } = self.services;

        info!("engine: updating assets");
        let sync = AssetSynchronizer::new(remote.clone())
            .sync(&env::asset_base_dir(&self.runtime_base))
            .await?;

        info!("engine: updating runtime ({})", self.profile.selected_stream);
        let runtime = RuntimeResolver::new(remote, &self.options.scratch_dir)
            .resolve(&self.profile.selected_stream, &self.runtime_base, |names| {
                host.publish_streams(names)
            })
            .await?;

        let mut command = build_launch_command(
            host.as_ref(),
            &LaunchInputs {
                profile: &self.profile,
                runtime_base: &self.runtime_base,
                runtime: &runtime,
                assets_dir: &sync.assets_dir,
                client_language: &self.start_info.client_language,
            },
        );
        let line = command.display();
        let clipboard_host = host.clone();
        if let Err(err) =
            tokio::task::spawn_blocking(move || clipboard_host.set_clipboard(&line)).await
        {
            warn!("engine: clipboard update aborted: {err}");
        }
        if let Some(sandbox) = &self.options.sandbox {
            debug!("engine: wrapping launch in sandbox box {}", sandbox.box_name);
            command = command.wrapped_in(sandbox);
        }

        info!("engine: starting runtime {} in cloned process", runtime.assembly_version);
        let code = spawner.run(&command).await?;
        match code {
            Some(0) => info!("engine: cloned session exited cleanly"),
            other => warn!(
                "engine: {}",
                CloneError::ChildProcessError(format!("exit status {other:?}"))
            ),
        }
        Ok(code)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::engine::models::{AssetManifest, RuntimeVersionInfo};
    use crate::engine::state::LaunchState;
    use crate::host::fake::FakeHost;
    use crate::instances::fake::FakeSlots;
    use crate::networking::fake::FakeRemote;
    use crate::process::fake::FakeSpawner;
    use crate::process::INJECTOR_EXE;

    struct Harness {
        dir: tempfile::TempDir,
        remote: Arc<FakeRemote>,
        spawner: Arc<FakeSpawner>,
        host: Arc<FakeHost>,
        slots: FakeSlots,
    }

    impl Harness {
        fn new(remote: FakeRemote, spawner: FakeSpawner) -> Self {
            Self {
                dir: tempfile::tempdir().unwrap(),
                remote: Arc::new(remote),
                spawner: Arc::new(spawner),
                host: Arc::new(FakeHost::ready()),
                slots: FakeSlots::default(),
            }
        }

        fn base(&self) -> PathBuf {
            self.dir.path().join("XIVLauncher")
        }

        fn options(&self) -> LaunchOptions {
            LaunchOptions {
                remove_instance_limit: false,
                sandbox: None,
                default_runtime_base: self.base(),
                scratch_dir: self.dir.path().join("cache"),
                lock_path: Some(self.dir.path().join("launch.lock")),
            }
        }

        fn orchestrator(&self, options: LaunchOptions) -> LaunchOrchestrator {
            let services = LaunchServices {
                remote: self.remote.clone(),
                spawner: self.spawner.clone(),
                host: self.host.clone(),
                instances: Arc::new(InstanceGuard::new(Box::new(self.slots.clone()))),
            };
            LaunchOrchestrator::new(Handle::current(), services, options)
        }
    }

    /// Remote whose runtime build is already installed under `base`.
    fn healthy_remote(base: &Path) -> FakeRemote {
        std::fs::create_dir_all(env::runtime_version_dir(base, "9.1.0.4")).unwrap();
        let mut streams = BTreeMap::new();
        streams.insert(
            "release".to_owned(),
            RuntimeVersionInfo {
                assembly_version: "9.1.0.4".into(),
                download_url: "https://x/latest.zip".into(),
            },
        );
        FakeRemote {
            manifest: Some(AssetManifest {
                version: 3,
                assets: Vec::new(),
            }),
            streams: Some(streams),
            ..FakeRemote::default()
        }
    }

    fn harness(spawner: FakeSpawner) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let remote = healthy_remote(&dir.path().join("XIVLauncher"));
        let mut h = Harness::new(remote, spawner);
        h.dir = dir;
        h
    }

    async fn finish(outcome: LaunchOutcome) -> LaunchResult {
        match outcome {
            LaunchOutcome::Started(handle) => handle.await.expect("launch task panicked"),
            other => panic!("expected Started, got {}", other.label()),
        }
    }

    #[tokio::test]
    async fn launch_runs_full_sequence_and_returns_to_idle() {
        let h = harness(FakeSpawner::default());
        let orchestrator = h.orchestrator(h.options());

        let result = finish(orchestrator.launch(LaunchProfile::named("main"))).await;

        assert_eq!(result.unwrap(), Some(0));
        assert_eq!(orchestrator.state(), LaunchState::Idle);
        assert_eq!(h.spawner.spawn_count(), 1);

        let commands = h.spawner.commands.lock().unwrap();
        let version_dir = env::runtime_version_dir(&h.base(), "9.1.0.4");
        assert_eq!(commands[0].program, version_dir.join(INJECTOR_EXE));
        assert_eq!(commands[0].working_dir, version_dir);
        let asset_flag = format!(
            "--dalamud-asset-directory={}",
            env::asset_base_dir(&h.base()).join("3").display()
        );
        assert!(commands[0].args.contains(&asset_flag));

        let clipboard = h.host.clipboard.lock().unwrap();
        assert_eq!(*clipboard, vec![commands[0].display()]);
        assert_eq!(*h.host.streams.lock().unwrap(), vec!["release".to_owned()]);
    }

    #[tokio::test]
    async fn second_launch_while_in_flight_is_a_noop() {
        let h = harness(FakeSpawner::gated());
        let orchestrator = h.orchestrator(h.options());

        let first = orchestrator.launch(LaunchProfile::default());
        assert_eq!(orchestrator.state(), LaunchState::Launching);
        let second = orchestrator.launch(LaunchProfile::default());
        assert!(matches!(second, LaunchOutcome::AlreadyLaunching));

        h.spawner.release();
        finish(first).await.unwrap();
        assert_eq!(h.spawner.spawn_count(), 1);
        assert_eq!(orchestrator.state(), LaunchState::Idle);
    }

    #[tokio::test]
    async fn separate_orchestrators_share_the_launch_lock() {
        let h = harness(FakeSpawner::gated());
        let first = h.orchestrator(h.options());
        let second = h.orchestrator(h.options());

        let running = first.launch(LaunchProfile::default());
        assert!(matches!(
            second.launch(LaunchProfile::default()),
            LaunchOutcome::AlreadyLaunching
        ));
        assert_eq!(second.state(), LaunchState::Idle);

        h.spawner.release();
        finish(running).await.unwrap();
        assert_eq!(h.spawner.spawn_count(), 1);

        let next = second.launch(LaunchProfile::default());
        h.spawner.release();
        finish(next).await.unwrap();
        assert_eq!(h.spawner.spawn_count(), 2);
    }

    #[tokio::test]
    async fn in_flight_launch_has_no_cancellation() {
        let h = harness(FakeSpawner::gated());
        let orchestrator = h.orchestrator(h.options());

        let first = orchestrator.launch(LaunchProfile::default());
        while h.spawner.spawn_count() == 0 {
            tokio::task::yield_now().await;
        }
        // Nothing but the child exiting moves the state back.
        assert_eq!(orchestrator.state(), LaunchState::Launching);

        h.spawner.release();
        finish(first).await.unwrap();
        assert_eq!(orchestrator.state(), LaunchState::Idle);
    }

    #[tokio::test]
    async fn stream_fetch_failure_aborts_without_spawning() {
        let mut h = harness(FakeSpawner::default());
        Arc::get_mut(&mut h.remote).unwrap().streams = None;
        let orchestrator = h.orchestrator(h.options());

        let result = finish(orchestrator.launch(LaunchProfile::default())).await;

        assert!(matches!(result, Err(CloneError::RuntimeUpdateFailed(_))));
        assert_eq!(h.spawner.spawn_count(), 0);
        assert_eq!(orchestrator.state(), LaunchState::Idle);
        // Not stuck: the next attempt is accepted.
        let again = orchestrator.launch(LaunchProfile::default());
        assert!(finish(again).await.is_err());
        assert_eq!(h.remote.stream_fetches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn sync_failure_aborts_without_spawning() {
        let mut h = harness(FakeSpawner::default());
        Arc::get_mut(&mut h.remote).unwrap().manifest = Some(AssetManifest {
            version: 4,
            assets: vec![crate::engine::models::AssetEntry {
                url: "https://cdn/missing.png".into(),
                file_name: "missing.png".into(),
                hash: None,
            }],
        });
        let orchestrator = h.orchestrator(h.options());

        let result = finish(orchestrator.launch(LaunchProfile::default())).await;

        assert!(matches!(result, Err(CloneError::DownloadFailed { .. })));
        assert_eq!(h.spawner.spawn_count(), 0);
        assert_eq!(h.remote.stream_fetches.load(Ordering::SeqCst), 0);
        assert_eq!(orchestrator.state(), LaunchState::Idle);
    }

    #[tokio::test]
    async fn spawn_failure_returns_to_idle() {
        let h = harness(FakeSpawner {
            fail: true,
            ..FakeSpawner::default()
        });
        let orchestrator = h.orchestrator(h.options());

        let result = finish(orchestrator.launch(LaunchProfile::default())).await;

        assert!(matches!(result, Err(CloneError::SpawnFailed { .. })));
        assert_eq!(orchestrator.state(), LaunchState::Idle);
        assert!(matches!(
            orchestrator.launch(LaunchProfile::default()),
            LaunchOutcome::Started(_)
        ));
    }

    #[tokio::test]
    async fn host_not_ready_aborts_before_any_work() {
        let mut h = harness(FakeSpawner::default());
        Arc::get_mut(&mut h.host).unwrap().not_ready = true;
        let orchestrator = h.orchestrator(h.options());

        let outcome = orchestrator.launch(LaunchProfile::default());

        assert!(matches!(outcome, LaunchOutcome::HostNotReady));
        assert_eq!(orchestrator.state(), LaunchState::Idle);
        assert_eq!(h.remote.stream_fetches.load(Ordering::SeqCst), 0);
        assert!(!env::asset_base_dir(&h.base()).exists());
    }

    #[tokio::test]
    async fn instance_limit_refuses_launch() {
        let mut h = harness(FakeSpawner::default());
        h.slots = FakeSlots::with_running(MAX_CLIENTS);
        let orchestrator = h.orchestrator(h.options());

        let outcome = orchestrator.launch(LaunchProfile::default());

        assert!(matches!(
            outcome,
            LaunchOutcome::InstanceLimitReached { running: MAX_CLIENTS }
        ));
        assert_eq!(orchestrator.state(), LaunchState::Idle);
    }

    #[tokio::test]
    async fn lifted_limit_releases_slots_and_launches() {
        let mut h = harness(FakeSpawner::default());
        h.slots = FakeSlots::with_running(2);
        h.slots.can_release = true;
        let mut options = h.options();
        options.remove_instance_limit = true;
        let orchestrator = h.orchestrator(options);

        finish(orchestrator.launch(LaunchProfile::default()))
            .await
            .unwrap();

        assert_eq!(orchestrator.instances().count_running_instances(), 0);
        assert_eq!(h.spawner.spawn_count(), 1);
    }

    #[tokio::test]
    async fn profile_runtime_base_and_sandbox_are_applied() {
        let dir = tempfile::tempdir().unwrap();
        let custom = dir.path().join("custom");
        let h = Harness::new(healthy_remote(&custom), FakeSpawner::default());
        let mut options = h.options();
        options.sandbox = Some(SandboxSettings {
            launcher_path: PathBuf::from("C:/Sandboxie/Start.exe"),
            box_name: "alt".into(),
        });
        let orchestrator = h.orchestrator(options);
        let mut profile = LaunchProfile::named("alt");
        profile.runtime_base_path = Some(custom.clone());

        finish(orchestrator.launch(profile)).await.unwrap();

        let commands = h.spawner.commands.lock().unwrap();
        assert_eq!(commands[0].program, PathBuf::from("C:/Sandboxie/Start.exe"));
        assert_eq!(commands[0].args[0], "/box:alt");
        assert_eq!(
            PathBuf::from(&commands[0].args[1]),
            env::runtime_version_dir(&custom, "9.1.0.4").join(INJECTOR_EXE)
        );
        assert!(env::asset_base_dir(&custom).join("3").is_dir());
        // Clipboard carries the unwrapped injector command.
        assert!(h.host.clipboard.lock().unwrap()[0].contains(INJECTOR_EXE));
    }
}
