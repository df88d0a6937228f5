use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio_stream::wrappers::WatchStream;
use tokio_stream::StreamExt;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use url::Url;

use crate::http::{HttpRunSource, HttpStreamFactory};
use runwatch_engine::{
    billable_minutes, ExecutionRun, RegistryConfig, RunHistorySource, RunStatus, StreamEvent,
    StreamRegistry, TrackerConfig, UsageTracker,
};
use runwatch_error::EngineError;

const DEFAULT_ENDPOINT: &str = "http://127.0.0.1:2468";
const RECONCILE_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(name = "runwatch", bin_name = "runwatch")]
#[command(about = "Live run streaming and usage accounting", version)]
#[command(arg_required_else_help = true)]
pub struct RunwatchCli {
    #[command(subcommand)]
    command: Command,

    #[arg(long, short = 'e', global = true, default_value = DEFAULT_ENDPOINT)]
    endpoint: String,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Print the billable minutes for a thread once and exit.
    Usage(UsageArgs),
    /// Follow a thread: stream run events and usage updates until Ctrl-C.
    Watch(WatchArgs),
}

#[derive(Args, Debug)]
pub struct UsageArgs {
    thread: String,
}

#[derive(Args, Debug)]
pub struct WatchArgs {
    thread: String,
}

#[derive(Debug, Error)]
pub enum CliError {
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("runtime error: {0}")]
    Runtime(String),
}

pub fn run() -> Result<(), CliError> {
    let cli = RunwatchCli::parse();
    init_logging();

    if Url::parse(&cli.endpoint).is_err() {
        return Err(CliError::InvalidEndpoint(cli.endpoint.clone()));
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| CliError::Runtime(err.to_string()))?;

    runtime.block_on(async move {
        match &cli.command {
            Command::Usage(args) => run_usage(&cli.endpoint, args).await,
            Command::Watch(args) => run_watch(&cli.endpoint, args).await,
        }
    })
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_logfmt::builder()
                .layer()
                .with_writer(std::io::stderr),
        )
        .init();
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct UsageReport<'a> {
    thread: &'a str,
    billable_minutes: i64,
    runs: Vec<ExecutionRun>,
}

async fn run_usage(endpoint: &str, args: &UsageArgs) -> Result<(), CliError> {
    let source = HttpRunSource::new(endpoint);
    let runs = source.fetch_runs(&args.thread).await?;
    let report = UsageReport {
        thread: &args.thread,
        billable_minutes: billable_minutes(&runs, Utc::now()),
        runs,
    };
    write_stdout_line(&serde_json::to_string_pretty(&report)?)
}

#[derive(Serialize)]
#[serde(tag = "kind", rename_all = "snake_case", rename_all_fields = "camelCase")]
enum WatchLine<'a> {
    Usage {
        thread: &'a str,
        billable_minutes: i64,
    },
    Event {
        run_id: &'a str,
        payload: &'a Value,
    },
    Terminal {
        run_id: &'a str,
        status: RunStatus,
    },
    StreamError {
        run_id: &'a str,
        message: &'a str,
    },
}

async fn run_watch(endpoint: &str, args: &WatchArgs) -> Result<(), CliError> {
    let tracker = UsageTracker::new(
        Arc::new(HttpRunSource::new(endpoint)),
        TrackerConfig::default(),
    );
    let registry = StreamRegistry::new(
        Arc::new(HttpStreamFactory::new(endpoint)),
        RegistryConfig::default(),
    );

    let display = tracker.observe(&args.thread).await;
    tracker.track(&args.thread).await;

    let mut usage_updates = WatchStream::new(display);
    let mut reconcile = tokio::time::interval(RECONCILE_INTERVAL);

    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result?;
                tracing::info!(thread = %args.thread, "shutting down");
                break;
            }
            Some(minutes) = usage_updates.next() => {
                write_stdout_line(&serde_json::to_string(&WatchLine::Usage {
                    thread: &args.thread,
                    billable_minutes: minutes,
                })?)?;
            }
            _ = reconcile.tick() => {
                reconcile_subscriptions(&tracker, &registry, &args.thread).await;
            }
        }
    }

    tracker.dispose_all().await;
    registry.dispose_all("shutdown").await;
    Ok(())
}

/// Align live subscriptions with the tracker's cached snapshot: open streams
/// for running runs, record runs the snapshot already shows as finished.
async fn reconcile_subscriptions(tracker: &UsageTracker, registry: &StreamRegistry, thread: &str) {
    for run in tracker.runs(thread).await {
        if run.status.is_terminal() {
            if !registry.is_terminal(&run.id).await {
                registry.mark_terminal(&run.id).await;
            }
            continue;
        }
        match registry.subscribe(&run.id).await {
            Ok(subscription) => {
                if !subscription.already_open {
                    spawn_event_printer(run.id.clone(), subscription.events);
                }
            }
            Err(EngineError::AlreadyTerminal { .. }) => {}
            Err(err) => {
                tracing::warn!(run_id = %run.id, error = %err, "failed to open run stream");
            }
        }
    }
}

fn spawn_event_printer(run_id: String, mut events: broadcast::Receiver<StreamEvent>) {
    tokio::spawn(async move {
        loop {
            let line = match events.recv().await {
                Ok(StreamEvent::Message(payload)) => serde_json::to_string(&WatchLine::Event {
                    run_id: &run_id,
                    payload: &payload,
                }),
                Ok(StreamEvent::Terminal(status)) => {
                    let line = serde_json::to_string(&WatchLine::Terminal {
                        run_id: &run_id,
                        status,
                    });
                    print_or_warn(&run_id, line);
                    return;
                }
                Ok(StreamEvent::TransportError(message)) => {
                    let line = serde_json::to_string(&WatchLine::StreamError {
                        run_id: &run_id,
                        message: &message,
                    });
                    print_or_warn(&run_id, line);
                    return;
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(run_id = %run_id, skipped = skipped, "event printer lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return,
            };
            print_or_warn(&run_id, line);
        }
    });
}

fn print_or_warn(run_id: &str, line: Result<String, serde_json::Error>) {
    let result = line
        .map_err(CliError::from)
        .and_then(|line| write_stdout_line(&line));
    if let Err(err) = result {
        tracing::warn!(run_id = %run_id, error = %err, "failed to write event");
    }
}

fn write_stdout_line(text: &str) -> Result<(), CliError> {
    let mut out = std::io::stdout();
    out.write_all(text.as_bytes())?;
    out.write_all(b"\n")?;
    out.flush()?;
    Ok(())
}
