//! ihale-monitor - follow batch analysis progress from the terminal

use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use ihale_common::events::{DocumentId, DocumentStatus};
use ihale_monitor::client::{EVENTS_PATH, QUEUE_EVENTS_PATH};
use ihale_monitor::{
    BatchReport, CancelController, ClientOptions, ClientViewState, Flow, StreamClient,
};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(name = "ihale-monitor")]
#[command(about = "Submit and follow tender document analysis batches")]
#[command(version)]
struct Args {
    /// Base URL of ihale-analyzer
    #[arg(short, long, env = "IHALE_SERVER_URL", default_value = "http://127.0.0.1:5790")]
    server: String,

    /// Reconnect attempts when the event stream drops
    #[arg(long, default_value_t = 5)]
    max_reconnects: u32,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Submit documents and follow the batch until it ends
    Analyze {
        #[arg(required = true)]
        document_ids: Vec<DocumentId>,
    },
    /// Print every event on the stream
    Watch {
        /// Only follow queue status updates
        #[arg(long)]
        queue: bool,
    },
    /// Print the current queue status
    Status,
    /// Ask the server to stop a batch
    Cancel { batch_id: Uuid },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ihale_monitor=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let options = ClientOptions {
        max_reconnects: args.max_reconnects,
        ..ClientOptions::default()
    };
    let client = StreamClient::with_options(&args.server, options)
        .context("Failed to create HTTP client")?;

    match args.command {
        Command::Analyze { document_ids } => analyze(&client, &document_ids).await,
        Command::Watch { queue } => watch(&client, queue).await,
        Command::Status => {
            let status = client
                .queue_status()
                .await
                .context("Failed to fetch queue status")?;
            println!("{}", serde_json::to_string_pretty(&status)?);
            Ok(())
        }
        Command::Cancel { batch_id } => {
            let response = client
                .cancel_batch(batch_id)
                .await
                .context("Failed to cancel batch")?;
            println!("{}: {:?}", response.batch_id, response.outcome);
            Ok(())
        }
    }
}

/// First Ctrl+C stops the batch on the server, the second one stops listening
async fn analyze(client: &StreamClient, document_ids: &[DocumentId]) -> Result<()> {
    let controller = CancelController::new();
    let interrupts = {
        let controller = controller.clone();
        let client = client.clone();
        tokio::spawn(async move { handle_interrupts(client, controller).await })
    };

    let mut last_message = String::new();
    let outcome = client
        .analyze(document_ids, &controller, |view| {
            if view.message != last_message {
                print_view(view);
                last_message = view.message.clone();
            }
        })
        .await;
    interrupts.abort();

    match outcome {
        Ok(report) => {
            print_report(&report);
            Ok(())
        }
        Err(e) if e.is_no_work_done() => {
            println!("Cancelled before any document finished");
            Ok(())
        }
        Err(e) => Err(e).context("Batch analysis failed"),
    }
}

async fn handle_interrupts(client: StreamClient, controller: CancelController) {
    if signal::ctrl_c().await.is_err() {
        return;
    }
    match controller.batch_id() {
        Some(batch_id) => {
            info!(%batch_id, "Stopping batch (Ctrl+C again to stop listening)");
            if let Err(e) = client.cancel_batch(batch_id).await {
                warn!(error = %e, "Cancel request failed");
                controller.close();
                return;
            }
        }
        None => {
            controller.close();
            return;
        }
    }
    if signal::ctrl_c().await.is_ok() {
        controller.close();
    }
}

async fn watch(client: &StreamClient, queue_only: bool) -> Result<()> {
    let controller = CancelController::new();
    {
        let controller = controller.clone();
        tokio::spawn(async move {
            if signal::ctrl_c().await.is_ok() {
                controller.close();
            }
        });
    }

    let path = if queue_only { QUEUE_EVENTS_PATH } else { EVENTS_PATH };
    client
        .watch(path, &controller, |event| {
            match event.payload_json() {
                Ok(json) => println!("{} {}", event.event_type(), json),
                Err(e) => warn!(error = %e, "Unprintable event"),
            }
            Flow::Continue
        })
        .await
        .context("Event stream failed")
}

fn print_view(view: &ClientViewState) {
    match view.estimated_remaining {
        Some(eta) if eta > Duration::ZERO => {
            println!(
                "[{}/{}] {} (~{}s left)",
                view.current,
                view.total,
                view.message,
                eta.as_secs()
            )
        }
        _ => println!("[{}/{}] {}", view.current, view.total, view.message),
    }
}

fn print_report(report: &BatchReport) {
    println!(
        "Batch {} {:?} in {}s: {} ok, {} failed, {} skipped, {} cancelled",
        report.batch_id,
        report.phase,
        report.elapsed.as_secs(),
        report.summary.success,
        report.summary.failed,
        report.summary.skipped,
        report.summary.cancelled,
    );
    for result in &report.results {
        let mark = match result.status {
            DocumentStatus::Completed => "ok",
            DocumentStatus::Failed => "FAILED",
            _ => "-",
        };
        match &result.error {
            Some(error) => println!("  {:>6} {} ({})", mark, result.filename, error),
            None => println!("  {:>6} {} ({} ms)", mark, result.filename, result.duration),
        }
    }
    if let Some(error) = &report.error {
        println!("Stopped early: {}", error);
    }
}
