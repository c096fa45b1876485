mod error;
mod logging;
mod settings;
mod single_instance;

use std::future::Future;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use runkit_backend::{MajorVersion, RuntimeKind};
use runkit_core::{HttpArchiveService, HttpMetadataCatalog};
use runkit_engine::{
    Collaborators, EngineConfig, JsonRecordStore, ReconcileReport, RuntimeLayout, RuntimeManager,
};
use runkit_platform::AppPaths;

use crate::error::AppError;
use crate::settings::AppSettings;
use crate::single_instance::SingleInstance;

#[derive(Parser, Debug)]
#[command(name = "runkit", version)]
#[command(about = "Install, update and switch PHP and Node runtimes", long_about = None)]
struct Cli {
    /// Log debug detail for this run.
    #[arg(long, global = true)]
    debug: bool,

    /// Runtime kind: php or node.
    #[arg(value_parser = parse_kind)]
    kind: RuntimeKind,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show installed versions; the default is marked with `*`.
    List,
    /// Bring records, binaries, pointer and wrappers back in sync.
    Reconcile,
    /// Install the latest release of a major version.
    Install {
        #[arg(value_parser = parse_major)]
        major: MajorVersion,
    },
    /// Replace an installed major with its latest release.
    Update {
        #[arg(value_parser = parse_major)]
        major: MajorVersion,
    },
    /// Uninstall a major version.
    Remove {
        #[arg(value_parser = parse_major)]
        major: MajorVersion,
    },
    /// Make a major version the default.
    Default {
        #[arg(value_parser = parse_major)]
        major: MajorVersion,
    },
    /// List installed majors with a newer release in the catalog.
    Outdated,
}

impl Command {
    fn name(&self) -> &'static str {
        match self {
            Self::List => "list",
            Self::Reconcile => "reconcile",
            Self::Install { .. } => "install",
            Self::Update { .. } => "update",
            Self::Remove { .. } => "remove",
            Self::Default { .. } => "default",
            Self::Outdated => "outdated",
        }
    }

    fn major(&self) -> Option<&MajorVersion> {
        match self {
            Self::Install { major }
            | Self::Update { major }
            | Self::Remove { major }
            | Self::Default { major } => Some(major),
            Self::List | Self::Reconcile | Self::Outdated => None,
        }
    }
}

fn parse_kind(value: &str) -> Result<RuntimeKind, String> {
    RuntimeKind::from_name(value).ok_or_else(|| format!("unknown runtime '{value}' (php, node)"))
}

fn parse_major(value: &str) -> Result<MajorVersion, String> {
    value.parse().map_err(|error: runkit_backend::VersionParseError| error.to_string())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            log::error!("{error}");
            eprintln!("error: {error}");
            ExitCode::from(error.exit_code())
        }
    }
}

async fn run(cli: Cli) -> Result<(), AppError> {
    let paths = AppPaths::new().map_err(AppError::environment_unavailable)?;
    let settings = AppSettings::load(&paths);
    let paths = settings.apply_paths(paths);
    logging::init_logging(
        &paths,
        cli.kind,
        cli.command.name(),
        cli.debug || settings.debug_logging,
        settings.max_log_size_bytes,
    );
    if !paths.settings_file().exists() {
        match settings.save(&paths) {
            Ok(()) => log::info!("Wrote default settings to {}", paths.settings_file().display()),
            Err(error) => log::warn!("Failed to write default settings: {error}"),
        }
    }

    let _instance =
        SingleInstance::acquire(&paths.lock_file()).map_err(AppError::environment_unavailable)?;
    let manager = build_manager(&paths, &settings, cli.kind);
    let kind = cli.kind;

    if let Some(major) = cli.command.major()
        && !kind.accepts(major)
    {
        return Err(AppError::invalid_argument(
            "major",
            format!("{major} is not a {kind} version"),
        ));
    }

    if matches!(cli.command, Command::Reconcile) {
        let report = manager
            .initialize()
            .await
            .map_err(|error| AppError::operation_failed("Reconcile", error))?;
        print_report(&report);
        return Ok(());
    }

    manager
        .reconcile()
        .await
        .map_err(|error| AppError::operation_failed("Reconcile", error))?;

    match cli.command {
        Command::List => print_records(&manager).await,
        Command::Reconcile => {}
        Command::Install { major } => {
            let record = with_timeout(
                "install",
                settings.install_timeout(),
                with_progress(&manager, &major, manager.install(&major)),
            )
            .await?
            .map_err(|error| AppError::operation_failed("Install", error))?;
            println!("Installed {kind} {}", record.full_version);
        }
        Command::Update { major } => {
            let record = with_timeout(
                "update",
                settings.install_timeout(),
                with_progress(&manager, &major, manager.update(&major)),
            )
            .await?
            .map_err(|error| AppError::operation_failed("Update", error))?;
            println!("Updated {kind} {major} to {}", record.full_version);
        }
        Command::Remove { major } => {
            with_progress(&manager, &major, manager.remove(&major))
                .await
                .map_err(|error| AppError::operation_failed("Remove", error))?;
            println!("Removed {kind} {major}");
        }
        Command::Default { major } => {
            manager
                .set_default(&major)
                .await
                .map_err(|error| AppError::operation_failed("Set default", error))?;
            println!("{kind} {major} is now the default");
        }
        Command::Outdated => {
            let updates = manager
                .check_updates()
                .await
                .map_err(|error| AppError::update_check_failed("Catalog", error))?;
            if updates.is_empty() {
                println!("All installed {kind} versions are up to date");
            }
            for update in updates {
                let mut flags = String::new();
                if update.is_lts {
                    flags.push_str(" (LTS)");
                }
                if update.is_eol {
                    flags.push_str(" (EOL)");
                }
                println!(
                    "{:<6} {} -> {}{flags}",
                    update.major.to_string(),
                    update.installed,
                    update.latest
                );
            }
        }
    }
    Ok(())
}

fn build_manager(paths: &AppPaths, settings: &AppSettings, kind: RuntimeKind) -> RuntimeManager {
    let http_timeout = Duration::from_secs(settings.http_timeout_secs);
    let user_agent = format!("runkit/{}", env!("CARGO_PKG_VERSION"));

    let catalog_client = reqwest::Client::builder()
        .timeout(http_timeout)
        .user_agent(user_agent.clone())
        .build()
        .unwrap_or_default();
    // No total timeout for archive downloads, only for stalls.
    let download_client = reqwest::Client::builder()
        .connect_timeout(http_timeout)
        .read_timeout(http_timeout)
        .user_agent(user_agent)
        .build()
        .unwrap_or_default();

    let catalog = HttpMetadataCatalog::new(catalog_client, settings.catalog_urls.clone());
    let archive = HttpArchiveService::new(download_client).with_retry_delays(settings.retry_delays());
    let store = JsonRecordStore::new(paths.records_dir());

    let mut config = EngineConfig::new(RuntimeLayout::from_paths(paths, kind))
        .with_version_timeout(settings.version_probe_timeout());
    if let Some(bundled) = settings.bundled_for(kind) {
        config = config.with_bundled(bundled);
    }

    RuntimeManager::new(
        config,
        Collaborators::new(Arc::new(catalog), Arc::new(archive), Arc::new(store)),
    )
}

async fn with_timeout<T>(
    operation: &'static str,
    limit: Duration,
    future: impl Future<Output = T>,
) -> Result<T, AppError> {
    tokio::time::timeout(limit, future)
        .await
        .map_err(|_| AppError::timeout(operation, limit.as_secs()))
}

/// Drive `operation` while printing its progress for `major` to stderr.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
async fn with_progress<T>(
    manager: &RuntimeManager,
    major: &MajorVersion,
    operation: impl Future<Output = T>,
) -> T {
    let mut updates = manager.subscribe();
    let mut last_percent = None;
    tokio::pin!(operation);

    loop {
        tokio::select! {
            result = &mut operation => {
                if last_percent.is_some() {
                    eprintln!();
                }
                return result;
            }
            changed = updates.changed() => {
                if changed.is_err() {
                    return operation.await;
                }
                let percent = updates
                    .borrow_and_update()
                    .progress
                    .get(major)
                    .map(|fraction| (fraction * 100.0).round() as u8);
                if let Some(percent) = percent
                    && last_percent != Some(percent)
                {
                    eprint!("\r{major} {percent:>3}%");
                    last_percent = Some(percent);
                }
            }
        }
    }
}

async fn print_records(manager: &RuntimeManager) {
    let records = manager.records().await;
    if records.is_empty() {
        println!("No {} versions installed", manager.kind());
        return;
    }
    for record in records {
        let marker = if record.is_default { '*' } else { ' ' };
        println!(
            "{marker} {:<6} {:<10} installed {}",
            record.major.to_string(),
            record.full_version.to_string(),
            record.installed_at.format("%Y-%m-%d")
        );
    }
}

fn print_report(report: &ReconcileReport) {
    if report.is_clean() {
        println!("Nothing to reconcile");
        return;
    }
    for mutation in &report.mutations {
        println!("- {mutation}");
    }
}
