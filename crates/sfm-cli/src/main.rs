use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use chrono::Local;
use clap::{Parser, ValueEnum};
use sfm_adapters::{
    Destination, InMemoryDestination, OutboxNotifier, SalesforceSource, SugarCrmDestination,
};
use sfm_core::RunMode;
use sfm_storage::{build_http_client, OutboxStore};
use sfm_sync::{MigrationConfig, MigrationPipeline, RunOptions, RunStatus};
use tracing::info;

mod logging;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Action {
    /// Create every record; first run only.
    Full,
    /// Update changed records and create new ones.
    Incremental,
}

impl From<Action> for RunMode {
    fn from(action: Action) -> Self {
        match action {
            Action::Full => RunMode::Full,
            Action::Incremental => RunMode::Incremental,
        }
    }
}

#[derive(Debug, Parser)]
#[command(name = "sf-migrate")]
#[command(about = "Migrates Salesforce records into SugarCRM")]
struct Cli {
    #[arg(short, long, value_enum)]
    action: Action,
    /// Interchange file root [env: SFM_CSV_DIR]
    #[arg(short, long)]
    csv_dir: Option<PathBuf>,
    /// Log and report root [env: SFM_LOG_DIR]
    #[arg(short, long)]
    log_dir: Option<PathBuf>,
    /// YAML credentials file [env: SFM_CONFIG_FILE]
    #[arg(short = 'f', long)]
    config_file: Option<PathBuf>,
    /// Send welcome mail to inactive users and activate them after the load.
    #[arg(short = 'm', long)]
    send_mail: bool,
    /// Import the interchange files already on disk.
    #[arg(long)]
    skip_export: bool,
    /// Load into an in-memory destination instead of SugarCRM.
    #[arg(long)]
    dry_run: bool,
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(status) => ExitCode::from(status.exit_code()),
        Err(err) => {
            eprintln!("sf-migrate: {err:#}");
            ExitCode::from(RunStatus::Aborted.exit_code())
        }
    }
}

async fn run(cli: Cli) -> Result<RunStatus> {
    let mut config = MigrationConfig::from_env();
    if let Some(dir) = cli.csv_dir {
        config.csv_dir = dir;
    }
    if let Some(dir) = cli.log_dir {
        config.log_dir = dir;
    }
    if let Some(file) = cli.config_file {
        config.config_file = Some(file);
    }

    let date = Local::now().date_naive();
    let run_log = logging::init_run_logging(
        &config.log_dir,
        date,
        logging::level_from_verbosity(cli.verbose),
    )
    .with_context(|| format!("opening run log under {}", config.log_dir.display()))?;

    info!(log = %run_log.path().display(), "run log opened");

    let credentials = config.load_credentials().context("loading credentials")?;
    let settings = credentials.migration.clone();
    let http = build_http_client(&config.http_client_config())?;

    let destination: Box<dyn Destination> = if cli.dry_run {
        info!("dry run; writing to an in-memory destination");
        Box::new(InMemoryDestination::new())
    } else {
        Box::new(SugarCrmDestination::new(
            http.clone(),
            credentials.sugarcrm()?.clone(),
        ))
    };

    let outbox_dir = settings
        .notification
        .outbox_dir
        .clone()
        .unwrap_or_else(|| config.csv_dir.join("outbox"));
    let mut pipeline = MigrationPipeline::new(config, settings, destination);
    if !cli.skip_export {
        pipeline = pipeline.with_source(Box::new(SalesforceSource::new(
            http,
            credentials.salesforce()?.clone(),
        )));
    }
    if cli.send_mail {
        pipeline = pipeline.with_notifier(Box::new(OutboxNotifier::new(OutboxStore::new(
            outbox_dir,
        ))));
    }

    let report = pipeline
        .run(RunOptions {
            mode: cli.action.into(),
            date,
            skip_export: cli.skip_export,
            send_mail: cli.send_mail,
        })
        .await;
    let report_path = report.write_to(&pipeline.report_dir(date)).await?;

    let (created, updated, failed) = report.stages.iter().fold((0, 0, 0), |acc, s| {
        (acc.0 + s.created, acc.1 + s.updated, acc.2 + s.failed)
    });
    info!(report = %report_path.display(), "run report written");
    println!(
        "migration {:?}: run_id={} mode={} created={} updated={} failed={} report={}",
        report.status(),
        report.run_id,
        report.mode,
        created,
        updated,
        failed,
        report_path.display()
    );
    Ok(report.status())
}
