// devel-install: provisions a Magento release into a working directory
// Main library entry point

#[cfg(not(unix))]
compile_error!("devel-install manages POSIX ownership and permission modes and only builds on Unix");

pub mod installation;
pub mod params;
pub mod report;
pub mod settings;
pub mod utils;

use clap::{Parser, Subcommand};
use installation::error::InstallError;
use installation::guard::{FilesystemGuard, FilesystemTarget};
use installation::host_fs::UnixHostFs;
use installation::orchestrator::{InstallOrchestrator, InstallPlan, RunStatus};
use log::{error, info, warn};
use params::profile::{parse_assignment, InstallProfile, RequestOverrides};
use params::resolver::ParameterResolver;
use params::{catalog, ParameterSet};
use settings::InstallerSettings;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub const EXIT_OK: i32 = 0;
pub const EXIT_INSTALLER_FAILED: i32 = 1;
pub const EXIT_FATAL: i32 = 2;
pub const EXIT_CONFIG: i32 = 3;

#[derive(Debug, Parser)]
#[command(name = "devel-install", version, about = "Provision a Magento release for development")]
pub struct Cli {
    /// Install root (defaults to the current directory).
    #[arg(long, global = true)]
    pub root: Option<PathBuf>,

    /// Settings file (defaults to `devel-install.toml` in the install root, if present).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Parameter profile (INI with [core] and [fs] sections).
    #[arg(long, global = true)]
    pub profile: Option<PathBuf>,

    /// Override one parameter; `key=` sets it to an empty value.
    #[arg(long = "set", value_name = "KEY=VALUE", value_parser = parse_assignment)]
    pub overrides: Vec<(String, String)>,

    /// Also log to stdout.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// List every parameter with its effective value and where it came from.
    Params,
    /// Run the install-root ownership/mode gate.
    Check,
    /// Gate, then fetch, extract, fix permissions and run the application installer.
    Install {
        /// Print the report as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Print the effective settings as TOML.
    Config,
}

/// Initialize logging system with dual format (JSON + human-readable)
fn init_logging(log_dir: &Path, with_stdout: bool) -> Result<(), Box<dyn std::error::Error>> {
    let timestamp = chrono::Utc::now().format("%Y-%m-%d-%H%M%S");

    // JSON log file for structured parsing
    let json_log_file = log_dir.join(format!("devel-install-{}.log", timestamp));

    // Human-readable log file (.txt)
    let txt_log_file = log_dir.join(format!("devel-install-{}.txt", timestamp));

    let mut dispatch = fern::Dispatch::new().level(log::LevelFilter::Debug);

    if with_stdout {
        dispatch = dispatch.chain(
            fern::Dispatch::new()
                .format(move |out, message, record| {
                    let timestamp_local = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
                    let message_str = format!("{}", message);
                    let (phase, step, cleaned_message) =
                        utils::logging::parse_log_metadata(&message_str);
                    let txt_line = utils::logging::format_human_readable_log(
                        &timestamp_local.to_string(),
                        record.level(),
                        record.target(),
                        &cleaned_message,
                        phase.as_deref(),
                        step.as_deref(),
                    );
                    out.finish(format_args!("{}", txt_line));
                })
                .chain(std::io::stdout()),
        );
    }

    dispatch = dispatch
        .chain(
            fern::Dispatch::new()
                .format(move |out, message, record| {
                    let timestamp_utc = chrono::Utc::now().to_rfc3339();
                    let message_str = format!("{}", message);
                    let (phase, step, cleaned_message) =
                        utils::logging::parse_log_metadata(&message_str);
                    let json_line = utils::logging::format_json_log(
                        &timestamp_utc,
                        record.level(),
                        record.target(),
                        &cleaned_message,
                        phase.as_deref(),
                        step.as_deref(),
                        None,
                    );
                    out.finish(format_args!("{}\n", json_line));
                })
                .chain(fern::log_file(json_log_file)?),
        )
        .chain(
            fern::Dispatch::new()
                .format(move |out, message, record| {
                    let timestamp_local = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
                    let message_str = format!("{}", message);
                    let (phase, step, cleaned_message) =
                        utils::logging::parse_log_metadata(&message_str);
                    let txt_line = utils::logging::format_human_readable_log(
                        &timestamp_local.to_string(),
                        record.level(),
                        record.target(),
                        &cleaned_message,
                        phase.as_deref(),
                        step.as_deref(),
                    );
                    out.finish(format_args!("{}\n", txt_line));
                })
                .chain(fern::log_file(txt_log_file)?),
        );

    dispatch.apply()?;

    log::info!(
        "[PHASE: initialization] Logging initialized, log directory: {:?}",
        log_dir
    );
    Ok(())
}

/// Everything a command needs, loaded once from settings, profile and `--set` flags.
struct Session {
    root: PathBuf,
    settings: InstallerSettings,
    profile: InstallProfile,
    overrides: RequestOverrides,
    fs_params: ParameterSet,
    app_params: ParameterSet,
}

impl Session {
    fn load(cli: &Cli) -> anyhow::Result<Self> {
        let search_dir = utils::path_resolver::resolve_install_root(cli.root.as_deref())?;
        let settings = InstallerSettings::load(cli.config.as_deref(), &search_dir)?;
        let root = match (&cli.root, &settings.install_root) {
            (None, Some(configured)) => {
                utils::path_resolver::resolve_install_root(Some(configured.as_path()))?
            }
            _ => search_dir,
        };

        let profile_path = match &cli.profile {
            Some(p) => utils::path_resolver::resolve_under_root(&root, p),
            None => utils::path_resolver::resolve_under_root(&root, &settings.profile_file),
        };
        let profile = InstallProfile::load(&profile_path)?;
        let overrides = RequestOverrides::from_pairs(cli.overrides.iter().cloned());

        let fs_params = catalog::filesystem_params()?;
        let app_params = catalog::application_params(&settings.site_host)?;

        Ok(Self {
            root,
            settings,
            profile,
            overrides,
            fs_params,
            app_params,
        })
    }

    fn resolver(&self) -> ParameterResolver<'_> {
        ParameterResolver::new(Some(&self.overrides), Some(&self.profile))
    }

    fn guard(&self) -> FilesystemGuard {
        FilesystemGuard::new(Arc::new(UnixHostFs))
    }

    fn target(&self) -> Result<FilesystemTarget, InstallError> {
        FilesystemTarget::from_params(
            &self.root,
            &self.fs_params,
            &self.resolver(),
            self.settings.protected_subtree(),
        )
    }
}

/// CLI entry: parse arguments, run one command, return the process exit code.
pub fn run(cli: Cli) -> i32 {
    let session = match Session::load(&cli) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Configuration error: {:#}", e);
            return EXIT_CONFIG;
        }
    };

    match utils::path_resolver::resolve_log_folder(session.settings.log_dir.as_deref()) {
        Ok(log_dir) => {
            if let Err(e) = init_logging(&log_dir, cli.verbose) {
                eprintln!("Failed to initialize logging: {}", e);
            }
        }
        Err(e) => eprintln!("Failed to initialize logging: {:#}", e),
    }

    info!(
        "[PHASE: initialization] devel-install {} starting (command={:?}, root={:?})",
        env!("CARGO_PKG_VERSION"),
        cli.command,
        session.root
    );

    match cli.command {
        Command::Params => run_params(&session),
        Command::Check => run_check(&session),
        Command::Install { json } => run_install(&session, json),
        Command::Config => run_config(&session),
    }
}

fn run_params(session: &Session) -> i32 {
    let resolver = session.resolver();
    for set in [&session.fs_params, &session.app_params] {
        let rows = report::parameter_rows(set, &resolver);
        println!("{}", report::render_parameter_table(set.name(), &rows));
    }
    EXIT_OK
}

fn run_check(session: &Session) -> i32 {
    let target = match session.target() {
        Ok(t) => t,
        Err(e) => {
            error!("[PHASE: preflight] [STEP: check_root] {}", e);
            eprintln!("{}", e);
            return EXIT_FATAL;
        }
    };

    match session.guard().check_root(&target) {
        Ok(()) => {
            println!("Install root {} is ready.", target.root.display());
            EXIT_OK
        }
        Err(instructions) => {
            eprintln!("{}", instructions);
            EXIT_FATAL
        }
    }
}

fn run_config(session: &Session) -> i32 {
    match session.settings.to_toml() {
        Ok(rendered) => {
            print!("{}", rendered);
            EXIT_OK
        }
        Err(e) => {
            eprintln!("{:#}", e);
            EXIT_CONFIG
        }
    }
}

fn run_install(session: &Session, json: bool) -> i32 {
    let plan = match InstallPlan::resolve(
        &session.root,
        &session.settings,
        &session.fs_params,
        &session.app_params,
        &session.resolver(),
    ) {
        Ok(p) => p,
        Err(e) => {
            error!("[PHASE: install] [STEP: plan] {}", e);
            eprintln!("{}", e);
            return EXIT_FATAL;
        }
    };

    let guard = session.guard();
    let preflight = guard.check_root(&plan.target);
    let mut orchestrator = InstallOrchestrator::new(session.settings.clone(), plan, guard);

    let fatal = match preflight {
        Err(instructions) => Some(InstallError::Precondition(instructions.to_string())),
        Ok(()) => {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build();
            match rt {
                Ok(rt) => rt.block_on(orchestrator.auto_run()).err(),
                Err(e) => Some(InstallError::io("Failed to start async runtime", e)),
            }
        }
    };

    let run = orchestrator.into_run();
    let report = report::InstallReport::from_run(run, fatal.as_ref());

    if json {
        match report.to_json() {
            Ok(s) => println!("{}", s),
            Err(e) => eprintln!("{:#}", e),
        }
    } else {
        if let Some(e) = &fatal {
            eprintln!("{}", e);
        }
        print!("{}", report.render_text());
    }

    match (&fatal, report.run.status) {
        (Some(e), _) => {
            error!(
                "[PHASE: install] [STEP: result] Install halted ({}): {}",
                e.kind(),
                e
            );
            EXIT_FATAL
        }
        (None, RunStatus::Succeeded) => {
            info!("[PHASE: install] [STEP: result] Install succeeded");
            EXIT_OK
        }
        (None, _) => {
            warn!("[PHASE: install] [STEP: result] Installer reported failure");
            EXIT_INSTALLER_FAILED
        }
    }
}
