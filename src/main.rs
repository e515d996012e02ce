mod bundle;
mod collectors;
mod config;
mod hooks;
mod installer;
mod juju;
mod machine;
mod state;
mod status;
mod submit;

use clap::{Parser, Subcommand};
use collectors::runner::TokioCommandRunner;
use config::{Config, ConfigSource, StatusSinkKind};
use hooks::{HookSettings, Hooks};
use installer::{AptInstaller, MarkerGate};
use juju::{HookToolStatus, UnitStatus};
use machine::LifecycleEvent;
use state::{FileFlagStore, FlagStore};
use status::LogStatus;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use submit::Submitter;
use tracing::{error, info, warn};
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "storpool-inventory")]
#[command(version)]
struct Cli {
    #[arg(long, default_value = config::DEFAULT_CONFIG_PATH)]
    config: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, Clone, Copy)]
enum Command {
    Install,
    ConfigChanged,
    UpdateStatus,
    UpgradeCharm,
    Stop,
    /// Print the persisted flags, last URL and status as JSON.
    ShowState,
    /// Print the example YAML configuration.
    PrintDefaultConfig,
}

impl Command {
    fn event(self) -> Option<LifecycleEvent> {
        match self {
            Command::Install => Some(LifecycleEvent::Install),
            Command::ConfigChanged => Some(LifecycleEvent::ConfigChanged),
            Command::UpdateStatus => Some(LifecycleEvent::UpdateStatus),
            Command::UpgradeCharm => Some(LifecycleEvent::UpgradeCharm),
            Command::Stop => Some(LifecycleEvent::Stop),
            Command::ShowState | Command::PrintDefaultConfig => None,
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse_from(hook_args(std::env::args().collect()));
    if let Command::PrintDefaultConfig = cli.command {
        println!("{}", Config::example_yaml());
        return;
    }

    let cfg = match Config::load_or_default(&cli.config) {
        Ok(cfg) => cfg,
        Err(err) => {
            init_tracing(None);
            error!(error = %err, "could not load the configuration");
            std::process::exit(1);
        }
    };
    init_tracing(cfg.log_file.as_deref());

    let store = FileFlagStore::new(cfg.state_path());
    let Some(event) = cli.command.event() else {
        show_state(&store);
        return;
    };

    let runner = TokioCommandRunner;
    let submit_url = resolve_submit_url(&cfg, &runner).await;
    info!(
        event = %event,
        submit_url = submit_url.as_deref().unwrap_or(""),
        state_dir = %cfg.state_dir.display(),
        "starting storpool-inventory"
    );

    let hostname = cfg.hostname.clone().unwrap_or_else(submit::local_hostname);
    let submitter = match Submitter::new(cfg.submit_timeout, hostname) {
        Ok(s) => s,
        Err(err) => {
            error!(error = %err, "could not set up the HTTP client");
            std::process::exit(1);
        }
    };
    tracing::debug!(hostname = submitter.hostname(), "submissions are named after this host");
    let status = match cfg.status_sink {
        StatusSinkKind::Log => UnitStatus::Log(LogStatus),
        StatusSinkKind::Juju => UnitStatus::HookTool(HookToolStatus::new(&runner)),
    };
    let installer = AptInstaller::new(&runner, cfg.package_record_path(), cfg.install_timeout);
    let gate = MarkerGate::new(cfg.repo_marker.clone());
    let settings = HookSettings::new(
        cfg.bundle_path(),
        cfg.work_dir_parent.clone(),
        cfg.command_timeout,
        cfg.use_sudo.resolve(collectors::running_as_root()),
    );

    let hooks = Hooks::new(settings, &runner, &installer, &gate, &submitter, &status);
    match hooks.handle(&store, event, submit_url.as_deref()).await {
        Ok(state) => info!(
            flags = ?state.flags.names(),
            done = hooks::is_done(&state),
            "hook finished"
        ),
        Err(err) => {
            error!(error = %err, path = %store.path().display(), "could not persist the state");
            std::process::exit(1);
        }
    }
}

/// When invoked through a symlink named after a hook (`hooks/install`),
/// turn the file name into the subcommand.
fn hook_args(mut args: Vec<String>) -> Vec<String> {
    let hook = args
        .first()
        .and_then(|argv0| Path::new(argv0).file_name())
        .and_then(|name| name.to_str())
        .and_then(LifecycleEvent::from_hook_name);
    if let Some(event) = hook {
        args.push(event.hook_name().to_string());
    }
    args
}

async fn resolve_submit_url(cfg: &Config, runner: &TokioCommandRunner) -> Option<String> {
    let url = match cfg.config_source {
        ConfigSource::File => return cfg.submit_url().map(str::to_string),
        ConfigSource::Juju => match juju::config_get_submit_url(runner).await {
            Ok(url) => url,
            Err(err) => {
                error!(error = %err, "could not read the charm configuration");
                std::process::exit(1);
            }
        },
    };

    match config::parse_submit_url(url.as_deref()) {
        Ok(url) => url,
        Err(err) => {
            warn!(error = %err, "ignoring the configured submit_url");
            None
        }
    }
}

fn show_state(store: &FileFlagStore) {
    let state = match store.load() {
        Ok(state) => state,
        Err(err) => {
            error!(error = %err, "could not load the state");
            std::process::exit(1);
        }
    };
    match serde_json::to_string_pretty(&state) {
        Ok(text) => println!("{text}"),
        Err(err) => {
            error!(error = %err, "could not serialize the state");
            std::process::exit(1);
        }
    }
}

fn init_tracing(log_file: Option<&Path>) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let file = log_file.and_then(|path| {
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|err| eprintln!("cannot open log file {}: {err}", path.display()))
            .ok()
    });
    let (writer, ansi) = match file {
        Some(file) => (BoxMakeWriter::new(Mutex::new(file)), false),
        None => (BoxMakeWriter::new(std::io::stderr), true),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(ansi)
        .init();
}
