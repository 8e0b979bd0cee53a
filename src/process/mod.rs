use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use log::{debug, info, warn};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;

use crate::config::SandboxSettings;
use crate::engine::models::LaunchProfile;
use crate::error::{CloneError, Result};
use crate::host::HostServices;
use crate::runtime::ResolvedRuntime;

pub const INJECTOR_EXE: &str = "Dalamud.Injector.exe";
const FLAG_PREFIX: &str = "--dalamud";

/// Host launch arguments copied into the child's game-argument block, in order.
pub const FORWARDED_ARGUMENTS: [&str; 8] = [
    "DEV.DataPathType",
    "DEV.MaxEntitledExpansionID",
    "DEV.TestSID",
    "DEV.UseSqPack",
    "SYS.Region",
    "language",
    "resetConfig",
    "ver",
];

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LaunchCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
}

impl LaunchCommand {
    /// Single quoted line suitable for pasting into a shell by hand.
    pub fn display(&self) -> String {
        let mut line = format!("\"{}\"", self.program.display());
        for arg in &self.args {
            line.push(' ');
            line.push_str(&quote_arg(arg));
        }
        line
    }

    /// Run the command through an external sandbox launcher instead.
    pub fn wrapped_in(self, sandbox: &SandboxSettings) -> Self {
        let mut args = Vec::with_capacity(self.args.len() + 2);
        args.push(format!("/box:{}", sandbox.box_name));
        args.push(self.program.display().to_string());
        args.extend(self.args);
        Self {
            program: sandbox.launcher_path.clone(),
            args,
            working_dir: self.working_dir,
        }
    }
}

fn quote_arg(arg: &str) -> String {
    if !arg.contains(char::is_whitespace) {
        return arg.to_owned();
    }
    match arg.split_once('=') {
        Some((key, value)) if !key.contains(char::is_whitespace) => format!("{key}=\"{value}\""),
        _ => format!("\"{arg}\""),
    }
}

/// Inputs that vary per launch; everything else comes from the host.
pub struct LaunchInputs<'a> {
    pub profile: &'a LaunchProfile,
    pub runtime_base: &'a Path,
    pub runtime: &'a ResolvedRuntime,
    pub assets_dir: &'a Path,
    pub client_language: &'a str,
}

pub fn build_launch_command(host: &dyn HostServices, inputs: &LaunchInputs<'_>) -> LaunchCommand {
    let version_dir = &inputs.runtime.version_dir;
    let base = inputs.runtime_base;
    let game_path = inputs
        .profile
        .game_path_override()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| host.game_path());
    let user_path = inputs
        .profile
        .user_path_override()
        .map(str::to_owned)
        .unwrap_or_else(|| host.user_path());
    let language = host
        .game_argument("Language")
        .unwrap_or_else(|| inputs.client_language.to_owned());

    let mut args = vec![
        "launch".to_owned(),
        "-g".to_owned(),
        game_path.display().to_string(),
        format!("{FLAG_PREFIX}-working-directory={}", version_dir.display()),
        format!(
            "{FLAG_PREFIX}-configuration-path={}",
            base.join("dalamudConfig.json").display()
        ),
        format!(
            "{FLAG_PREFIX}-plugin-directory={}",
            base.join("installedPlugins").display()
        ),
        format!(
            "{FLAG_PREFIX}-dev-plugin-directory={}",
            base.join("devPlugins").display()
        ),
        format!("{FLAG_PREFIX}-asset-directory={}", inputs.assets_dir.display()),
        format!("{FLAG_PREFIX}-delay-initialize=0"),
        format!("{FLAG_PREFIX}-client-language={language}"),
        "--".to_owned(),
    ];
    for key in FORWARDED_ARGUMENTS {
        let value = host.game_argument(key).unwrap_or_default();
        args.push(format!("{key}={value}"));
    }
    args.push(format!("UserPath={user_path}"));

    LaunchCommand {
        program: version_dir.join(INJECTOR_EXE),
        args,
        working_dir: version_dir.clone(),
    }
}

#[async_trait]
pub trait ProcessSpawner: Send + Sync {
    /// Start the command and wait for it; returns the exit code (`None` if killed by a signal).
    async fn run(&self, command: &LaunchCommand) -> Result<Option<i32>>;
}

/// Spawns real processes and forwards their output to the log.
#[derive(Clone, Default)]
pub struct TokioSpawner;

impl TokioSpawner {
    pub fn new() -> Self {
        Self
    }
}

async fn forward_lines<R>(reader: R, label: &'static str, is_stderr: bool)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) if is_stderr => warn!("{label}: {line}"),
            Ok(Some(line)) => info!("{label}: {line}"),
            Ok(None) => break,
            Err(err) => {
                debug!("{label}: stream closed: {err}");
                break;
            }
        }
    }
}

#[async_trait]
impl ProcessSpawner for TokioSpawner {
    async fn run(&self, command: &LaunchCommand) -> Result<Option<i32>> {
        info!("process: starting {}", command.program.display());
        debug!("process: cwd={} args={:?}", command.working_dir.display(), command.args);

        let mut child = Command::new(&command.program)
            .args(&command.args)
            .current_dir(&command.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| CloneError::SpawnFailed {
                program: command.program.clone(),
                reason: e.to_string(),
            })?;

        let stdout = child
            .stdout
            .take()
            .map(|out| tokio::spawn(forward_lines(out, "child", false)));
        let stderr = child
            .stderr
            .take()
            .map(|err| tokio::spawn(forward_lines(err, "child", true)));

        let status = child
            .wait()
            .await
            .map_err(|e| CloneError::ChildProcessError(format!("wait failed: {e}")))?;
        for task in [stdout, stderr].into_iter().flatten() {
            let _ = task.await;
        }
        info!("process: exited with {status}");
        Ok(status.code())
    }
}

#[cfg(test)]
pub mod fake {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tokio::sync::Notify;

    use super::*;

    /// Records commands; optionally blocks until released or fails to spawn.
    #[derive(Default)]
    pub struct FakeSpawner {
        pub spawned: AtomicUsize,
        pub commands: Mutex<Vec<LaunchCommand>>,
        pub gate: Option<Notify>,
        pub fail: bool,
    }

    impl FakeSpawner {
        pub fn gated() -> Self {
            Self {
                gate: Some(Notify::new()),
                ..Self::default()
            }
        }

        pub fn spawn_count(&self) -> usize {
            self.spawned.load(Ordering::SeqCst)
        }

        pub fn release(&self) {
            if let Some(gate) = &self.gate {
                gate.notify_one();
            }
        }
    }

    #[async_trait]
    impl ProcessSpawner for FakeSpawner {
        async fn run(&self, command: &LaunchCommand) -> Result<Option<i32>> {
            if self.fail {
                return Err(CloneError::SpawnFailed {
                    program: command.program.clone(),
                    reason: "file not found".into(),
                });
            }
            self.spawned.fetch_add(1, Ordering::SeqCst);
            self.commands.lock().unwrap().push(command.clone());
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            Ok(Some(0))
        }
    }
}
