use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use env_logger::Env;
use log::{error, info, warn};
use tokio::runtime::{Builder, Runtime};

mod assets;
mod config;
mod engine;
mod env;
mod error;
mod host;
mod instances;
mod networking;
mod process;
mod runtime;
mod storage;
mod util;

use crate::config::{SandboxSettings, Settings};
use crate::engine::models::LaunchProfile;
use crate::engine::state::LaunchOutcome;
use crate::engine::{LaunchOptions, LaunchOrchestrator, LaunchServices};
use crate::error::{CloneError, Result};
use crate::host::FileHost;
use crate::instances::{InstanceGuard, MAX_CLIENTS};
use crate::networking::{NetworkClient, RemoteSource};
use crate::process::TokioSpawner;

#[derive(Parser, Debug)]
#[command(
    name = "clone-session",
    author,
    version,
    about = "Launch an additional, independently configured game session"
)]
struct Cli {
    /// Settings file (profiles, instance limit, sandbox).
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    /// Host snapshot describing the running client's launch state.
    #[arg(long, global = true)]
    host: Option<PathBuf>,

    /// Enable debug logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Save the launch command line to a file instead of the system clipboard.
    #[arg(long, global = true)]
    no_clipboard: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Clone the session using a named profile, or the default profile.
    Launch { profile: Option<String> },
    /// Show how many client instance slots are in use.
    Instances {
        /// Close the first two slot handles so the client allows more instances.
        #[arg(long)]
        release: bool,
        /// Process owning the slot handles (Windows only; defaults to this process).
        #[arg(long)]
        pid: Option<u32>,
    },
    /// Refresh the list of runtime release streams.
    Streams,
    /// Manage launch profiles.
    #[command(subcommand)]
    Profiles(ProfileCommand),
    /// Change global settings.
    Config(ConfigArgs),
}

#[derive(Subcommand, Debug)]
enum ProfileCommand {
    List,
    Add(ProfileArgs),
    Copy { index: usize },
    Delete { index: usize },
    /// Restore the most recently deleted profile.
    Undo,
    Default { index: usize },
}

#[derive(Args, Debug)]
struct ProfileArgs {
    name: String,
    #[arg(long)]
    user_path: Option<String>,
    #[arg(long)]
    runtime_path: Option<PathBuf>,
    #[arg(long)]
    game_path: Option<PathBuf>,
    #[arg(long, default_value = "release")]
    stream: String,
}

#[derive(Args, Debug)]
struct ConfigArgs {
    #[arg(long)]
    remove_instance_limit: Option<bool>,
    #[arg(long)]
    auto_clone: Option<bool>,
    /// Sandbox launcher executable; use with --sandbox-box.
    #[arg(long, requires = "sandbox_box")]
    sandbox_launcher: Option<PathBuf>,
    #[arg(long)]
    sandbox_box: Option<String>,
    /// Stop wrapping launches in a sandbox.
    #[arg(long, conflicts_with = "sandbox_launcher")]
    no_sandbox: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let filter = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(Env::default().default_filter_or(filter)).init();

    let runtime = build_runtime();
    match runtime.block_on(run(cli, runtime.clone())) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err}");
            ExitCode::FAILURE
        }
    }
}

fn build_runtime() -> Arc<Runtime> {
    match Runtime::new() {
        Ok(rt) => Arc::new(rt),
        Err(err) => {
            warn!(
                "main: failed to create multithreaded runtime ({}); trying single-threaded runtime",
                err
            );
            match Builder::new_current_thread().enable_all().build() {
                Ok(rt) => Arc::new(rt),
                Err(fallback_err) => {
                    error!(
                        "main: failed to create any Tokio runtime ({}); exiting",
                        fallback_err
                    );
                    std::process::exit(1);
                }
            }
        }
    }
}

async fn run(cli: Cli, runtime: Arc<Runtime>) -> Result<()> {
    let settings_path = cli.settings.unwrap_or_else(env::settings_path);
    let host_path = cli.host.unwrap_or_else(env::host_path);
    let system_clipboard = !cli.no_clipboard;
    let mut settings = Settings::load(&settings_path)?;

    match cli.command {
        Some(Command::Launch { profile }) => {
            let request = LaunchRequest {
                settings_path: &settings_path,
                host_path: &host_path,
                profile_name: profile.as_deref(),
                system_clipboard,
            };
            launch(&runtime, &mut settings, request).await
        }
        None if settings.auto_clone => {
            let request = LaunchRequest {
                settings_path: &settings_path,
                host_path: &host_path,
                profile_name: None,
                system_clipboard,
            };
            launch(&runtime, &mut settings, request).await
        }
        None => {
            print_status(&mut settings, &settings_path);
            Ok(())
        }
        Some(Command::Instances { release, pid }) => {
            let guard = slot_guard(pid);
            if release {
                if !guard.supports_force_release() {
                    warn!("instances: releasing slots is not supported on this platform");
                }
                let closed = guard
                    .force_release_instance_slots(&instances::default_release_suffixes());
                println!("released {closed} slot(s)");
            }
            println!(
                "{} of {} allowed instance(s) running",
                guard.count_running_instances(),
                MAX_CLIENTS
            );
            Ok(())
        }
        Some(Command::Streams) => {
            let streams = NetworkClient::new().fetch_runtime_streams().await?;
            for (name, info) in &streams {
                println!("{name}\t{}", info.assembly_version);
            }
            let names: Vec<String> = streams.keys().cloned().collect();
            if settings.set_known_streams(&names) {
                settings.save(&settings_path)?;
            }
            Ok(())
        }
        Some(Command::Profiles(command)) => {
            profiles(command, &mut settings)?;
            settings.save(&settings_path)
        }
        Some(Command::Config(args)) => {
            configure(args, &mut settings);
            settings.save(&settings_path)
        }
    }
}

struct LaunchRequest<'a> {
    settings_path: &'a std::path::Path,
    host_path: &'a std::path::Path,
    profile_name: Option<&'a str>,
    system_clipboard: bool,
}

async fn launch(
    runtime: &Arc<Runtime>,
    settings: &mut Settings,
    request: LaunchRequest<'_>,
) -> Result<()> {
    let LaunchRequest {
        settings_path,
        host_path,
        profile_name,
        system_clipboard,
    } = request;
    let profile = match profile_name {
        Some(name) => settings
            .find_profile(name)
            .cloned()
            .ok_or_else(|| CloneError::Config(format!("no profile named '{name}'")))?,
        None => settings.default_profile().clone(),
    };

    let sink_path = settings_path.to_path_buf();
    let clipboard_path = settings_path
        .parent()
        .map(|dir| dir.join("last-command.txt"))
        .unwrap_or_else(|| env::default_app_dir().join("last-command.txt"));
    let mut host = FileHost::load(host_path, clipboard_path)
        .on_streams(move |names| remember_streams(&sink_path, names));
    if !system_clipboard {
        host = host.without_system_clipboard();
    }
    let services = LaunchServices {
        remote: Arc::new(NetworkClient::new()),
        spawner: Arc::new(TokioSpawner::new()),
        host: Arc::new(host),
        instances: Arc::new(InstanceGuard::platform()),
    };
    let options = LaunchOptions {
        remove_instance_limit: settings.remove_instance_limit,
        sandbox: settings.sandbox.clone(),
        ..LaunchOptions::default()
    };
    let orchestrator = LaunchOrchestrator::new(runtime.handle().clone(), services, options);

    info!("main: cloning session with profile '{}'", profile.display_name(0));
    match orchestrator.launch(profile) {
        LaunchOutcome::Started(handle) => match handle.await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(err)) => Err(err),
            Err(join_err) => Err(CloneError::ChildProcessError(format!(
                "launch task aborted: {join_err}"
            ))),
        },
        LaunchOutcome::HostNotReady => Err(CloneError::HostNotReady),
        LaunchOutcome::InstanceLimitReached { running } => {
            warn!(
                "main: {running} of {MAX_CLIENTS} allowed clients already running; \
                 use `config --remove-instance-limit true` to lift the limit"
            );
            Ok(())
        }
        other => {
            warn!("main: launch skipped ({})", other.label());
            Ok(())
        }
    }
}

fn remember_streams(settings_path: &std::path::Path, names: &[String]) {
    let result = Settings::load(settings_path).and_then(|mut settings| {
        if settings.set_known_streams(names) {
            settings.save(settings_path)?;
        }
        Ok(())
    });
    if let Err(err) = result {
        warn!("main: could not record stream list: {err}");
    }
}

fn profiles(command: ProfileCommand, settings: &mut Settings) -> Result<()> {
    match command {
        ProfileCommand::List => {
            for (i, profile) in settings.profiles.iter().enumerate() {
                let marker = if i == settings.default_profile_index { "*" } else { " " };
                println!(
                    "{marker} {i}: {} [{}]",
                    profile.display_name(i),
                    profile.selected_stream
                );
            }
        }
        ProfileCommand::Add(args) => {
            if !settings.known_streams.contains(&args.stream) {
                warn!("profiles: stream '{}' is not in the known stream list", args.stream);
            }
            let index = settings.add_profile(LaunchProfile {
                user_path: args.user_path,
                runtime_base_path: args.runtime_path,
                game_path: args.game_path,
                selected_stream: args.stream,
                ..LaunchProfile::named(args.name)
            });
            println!("added profile {index}");
        }
        ProfileCommand::Copy { index } => {
            let copy = settings
                .copy_profile(index)
                .ok_or_else(|| CloneError::Config(format!("no profile at index {index}")))?;
            println!("copied profile {index} to {copy}");
        }
        ProfileCommand::Delete { index } => {
            let removed = settings.delete_profile(index)?;
            println!("{} deleted", removed.display_name(index));
        }
        ProfileCommand::Undo => match settings.undo_delete() {
            Some(index) => println!("restored profile {index}"),
            None => println!("nothing to undo"),
        },
        ProfileCommand::Default { index } => settings.set_default(index)?,
    }
    Ok(())
}

fn configure(args: ConfigArgs, settings: &mut Settings) {
    if let Some(value) = args.remove_instance_limit {
        settings.remove_instance_limit = value;
    }
    if let Some(value) = args.auto_clone {
        settings.auto_clone = value;
    }
    if args.no_sandbox {
        settings.sandbox = None;
    } else if let (Some(launcher_path), Some(box_name)) = (args.sandbox_launcher, args.sandbox_box) {
        settings.sandbox = Some(SandboxSettings {
            launcher_path,
            box_name,
        });
    }
}

#[cfg(windows)]
fn slot_guard(pid: Option<u32>) -> InstanceGuard {
    match pid {
        Some(pid) => InstanceGuard::new(Box::new(
            instances::windows::NamedMutexSlots::for_process(pid),
        )),
        None => InstanceGuard::platform(),
    }
}

#[cfg(not(windows))]
fn slot_guard(pid: Option<u32>) -> InstanceGuard {
    if let Some(pid) = pid {
        warn!("instances: --pid {pid} ignored; slot handles are per-process only on Windows");
    }
    InstanceGuard::platform()
}

fn print_status(settings: &mut Settings, settings_path: &std::path::Path) {
    let running = InstanceGuard::platform().count_running_instances();
    println!("settings: {}", settings_path.display());
    println!("instances running: {running}");
    if running >= MAX_CLIENTS && !settings.remove_instance_limit {
        println!("max clients reached");
    }
    let default = settings.default_profile().clone();
    println!(
        "default profile: {} [{}]",
        default.display_name(settings.default_profile_index),
        default.selected_stream
    );
}
