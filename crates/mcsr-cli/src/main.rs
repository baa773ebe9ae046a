use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use mcsr_core::{IngestionReport, SourceKind};
use mcsr_storage::{HttpTransportConfig, JsonFileStore, ReportArchive};
use mcsr_sync::{
    default_report_kinds, DriveCredentials, DrivePoller, HttpDriveTransport, HttpMailboxTransport,
    IngestionPipeline, MailboxCredentials, MailboxPoller, PollSummary, PollerConfig,
    PollerSchedule,
};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "mcsr-cli")]
#[command(about = "Multi-channel sales reconciler command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum SourceArg {
    Online,
    Pos,
}

impl From<SourceArg> for SourceKind {
    fn from(arg: SourceArg) -> Self {
        match arg {
            SourceArg::Online => SourceKind::Online,
            SourceArg::Pos => SourceKind::Pos,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Ingest a delimited report file in strict mode.
    Upload {
        file: PathBuf,
        #[arg(long, value_enum, default_value = "online")]
        source: SourceArg,
        /// JSON file mapping order references to staff names.
        #[arg(long)]
        staff_map: Option<PathBuf>,
        /// Row count the submitting client expects; mismatch is a warning.
        #[arg(long)]
        expected_rows: Option<usize>,
    },
    /// Run one mailbox poll tick now.
    PollMailbox,
    /// Run one drive-folder poll tick now.
    PollDrive,
    /// Run both poll timers until interrupted.
    Schedule,
}

fn http_config(config: &PollerConfig) -> HttpTransportConfig {
    HttpTransportConfig {
        timeout: Duration::from_secs(config.http_timeout_secs),
        user_agent: Some(config.user_agent.clone()),
        ..HttpTransportConfig::default()
    }
}

async fn open_store() -> Result<Arc<JsonFileStore>> {
    let path =
        std::env::var("MCSR_STORE_PATH").unwrap_or_else(|_| "./mcsr-store.json".to_string());
    let store = JsonFileStore::open(&path)
        .await
        .with_context(|| format!("opening store {path}"))?;
    Ok(Arc::new(store))
}

fn mailbox_poller(config: &PollerConfig, store: Arc<JsonFileStore>) -> Result<MailboxPoller> {
    let pipeline = Arc::new(IngestionPipeline::new(store.clone()));
    let transport = Arc::new(HttpMailboxTransport::new(http_config(config))?);
    Ok(MailboxPoller::new(
        transport,
        MailboxCredentials::from_env(),
        default_report_kinds(),
        pipeline,
        store,
    )
    .with_archive(ReportArchive::new(config.archive_dir.clone())))
}

fn drive_poller(config: &PollerConfig, store: Arc<JsonFileStore>) -> Result<DrivePoller> {
    let pipeline = Arc::new(IngestionPipeline::new(store.clone()));
    let transport = Arc::new(HttpDriveTransport::new(
        config.drive_api_base.clone(),
        http_config(config),
    )?);
    Ok(DrivePoller::new(
        transport,
        DriveCredentials::from_env(),
        config.drive_folder_id.clone(),
        config.drive_source_kind,
        pipeline,
        store,
    )
    .with_archive(ReportArchive::new(config.archive_dir.clone())))
}

fn print_report(report: &IngestionReport) {
    println!(
        "ingest complete: total={} imported={} merged={} duplicates={} invalid={} empty={} failed={} net_total={:.2}",
        report.total_rows,
        report.imported,
        report.merged,
        report.skipped_duplicate,
        report.skipped_invalid,
        report.skipped_empty,
        report.failed,
        report.imported_net_total
    );
    if let Some(warning) = &report.row_count_warning {
        println!("warning: {warning}");
    }
    for order in &report.failed_orders {
        println!("failed row: {order}");
    }
}

fn print_poll_summary(source: &str, summary: &PollSummary) {
    println!(
        "{source} poll complete: processed={} unchanged={} failed={}",
        summary.processed, summary.skipped_unchanged, summary.failed
    );
    for report in &summary.reports {
        print_report(report);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mcsr=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = PollerConfig::from_env();

    match cli.command {
        Commands::Upload {
            file,
            source,
            staff_map,
            expected_rows,
        } => {
            let text = tokio::fs::read_to_string(&file)
                .await
                .with_context(|| format!("reading {}", file.display()))?;
            let staff_map: HashMap<String, String> = match staff_map {
                Some(path) => {
                    let raw = tokio::fs::read_to_string(&path)
                        .await
                        .with_context(|| format!("reading staff map {}", path.display()))?;
                    serde_json::from_str(&raw)
                        .with_context(|| format!("parsing staff map {}", path.display()))?
                }
                None => HashMap::new(),
            };

            let store = open_store().await?;
            let pipeline = IngestionPipeline::new(store);
            let report = pipeline
                .ingest_manual_upload(&text, source.into(), staff_map, expected_rows)
                .await?;
            print_report(&report);
        }
        Commands::PollMailbox => {
            let store = open_store().await?;
            let poller = mailbox_poller(&config, store)?;
            let summary = poller.tick().await?;
            print_poll_summary("mailbox", &summary);
        }
        Commands::PollDrive => {
            let store = open_store().await?;
            let poller = drive_poller(&config, store)?;
            let summary = poller.tick().await?;
            print_poll_summary("drive", &summary);
        }
        Commands::Schedule => {
            if !config.scheduler_enabled {
                println!("scheduler disabled; set MCSR_SCHEDULER_ENABLED=1 to run");
                return Ok(());
            }
            let store = open_store().await?;
            let mailbox = Arc::new(mailbox_poller(&config, store.clone())?);
            let drive = Arc::new(drive_poller(&config, store)?);
            let schedule = PollerSchedule::start(mailbox, drive, &config).await?;
            info!(
                mailbox_cron = %config.mailbox_cron,
                drive_cron = %config.drive_cron,
                "pollers scheduled, press ctrl-c to stop"
            );
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            schedule.shutdown().await?;
        }
    }

    Ok(())
}
