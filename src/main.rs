mod app;
mod appsettings;
mod clock;
mod console;
mod delivery;
mod export;
mod reminder;
mod scheduling;
mod storage;
#[cfg(test)]
mod test_utils;

use std::{path::PathBuf, sync::Arc};

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::io::BufReader;

use app::ReminderApp;
use appsettings::{AppSettings, StorageSettings};
use clock::{Clock, SystemClock};
use console::Console;
use delivery::SmtpMailTransport;
use export::{ExportOutcome, PdfExporter};
use scheduling::{DeliveryScheduler, delivery_events};
use storage::{InMemoryReminderStorage, ReminderStorage, sqlite::SqliteReminderStorage};

#[derive(Parser)]
#[command(name = "advtodo")]
#[command(version, about = "Reminders delivered by email, exportable to PDF", long_about = None)]
struct Cli {
    /// settings file to use instead of appsettings.*
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Clone, Copy, Default)]
enum Command {
    /// interactive session (default)
    #[default]
    Run,
    /// write every stored reminder to a PDF file and exit
    Export,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    pretty_env_logger::init();

    let cli = Cli::parse();
    let settings =
        AppSettings::load(cli.config.as_deref()).context("Failed to load application settings")?;

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let storage = open_storage(&settings.storage).await?;
    let exporter = PdfExporter::new(settings.export.directory.clone(), Arc::clone(&clock));

    match cli.command.unwrap_or_default() {
        Command::Run => run_console(settings, storage, exporter, clock).await,
        Command::Export => {
            let outcome = exporter.export(storage.as_ref()).await;
            match outcome.context("Export failed")? {
                ExportOutcome::Empty => println!("Nothing to export."),
                ExportOutcome::Written {
                    path,
                    reminders,
                    unrendered,
                    ..
                } => {
                    println!("Exported {} reminder(s) to {}", reminders, path.display());
                    if unrendered > 0 {
                        println!("{unrendered} character(s) could not be rendered");
                    }
                }
            }
            Ok(())
        }
    }
}

async fn open_storage(settings: &StorageSettings) -> anyhow::Result<Arc<dyn ReminderStorage>> {
    if !settings.persistent {
        log::info!("Using in-memory storage");
        return Ok(Arc::new(InMemoryReminderStorage::new()));
    }

    let storage = SqliteReminderStorage::open(&settings.database_path)
        .await
        .with_context(|| {
            format!(
                "Failed to open database {}",
                settings.database_path.display()
            )
        })?;

    Ok(Arc::new(storage))
}

async fn run_console(
    settings: AppSettings,
    storage: Arc<dyn ReminderStorage>,
    exporter: PdfExporter,
    clock: Arc<dyn Clock>,
) -> anyhow::Result<()> {
    if settings.smtp.login.is_empty() {
        log::warn!("SMTP login is not set, deliveries will fail. Set YANDEX_LOGIN or smtp.login");
    }

    let (events_sender, events) = delivery_events(settings.scheduler.event_queue_capacity);
    let transport = Arc::new(SmtpMailTransport::new(settings.smtp));
    let scheduler = Arc::new(DeliveryScheduler::new(
        transport,
        events_sender,
        clock,
        &settings.scheduler,
    ));

    let app = ReminderApp::new(storage, scheduler, exporter);
    Console::new(app)
        .run(
            BufReader::new(tokio::io::stdin()),
            tokio::io::stdout(),
            events,
        )
        .await
}
