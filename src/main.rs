use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use stream_forwarder::{Config, Error, Forwarder, KafkaStreamClient, MemoryStream, StreamClient};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Backoff before resubmitting a line the buffer turned away.
const BACKPRESSURE_PAUSE: Duration = Duration::from_millis(20);

#[derive(Parser, Debug)]
#[command(name = "stream-forwarder")]
#[command(about = "Forwards newline-delimited JSON events to a partitioned stream", long_about = None)]
struct Args {
    #[arg(short, long, value_name = "FILE", default_value = "config.toml")]
    config: PathBuf,

    #[arg(short, long, help = "Enable JSON output for logs")]
    json_logs: bool,

    #[arg(short, long, help = "Verbose logging")]
    verbose: bool,

    #[arg(long, help = "Ship to an in-memory stream instead of the configured brokers")]
    dry_run: bool,

    #[arg(long, help = "Wait for each event's outcome before reading the next line")]
    wait: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(args.json_logs, args.verbose);

    info!("Starting stream-forwarder");
    info!("Loading configuration from {:?}", args.config);

    let config = Config::from_file(&args.config)
        .with_context(|| format!("failed to load configuration from {:?}", args.config))?;

    info!(
        region = %config.stream.region,
        stream = %config.stream.stream_name,
        brokers = ?config.stream.brokers,
        buffer_records = config.buffer.max_records,
        batch_records = config.batch.max_records,
        linger_ms = config.batch.linger_ms,
        "Configuration summary"
    );

    if args.dry_run {
        info!("Dry run, events go to an in-memory stream");
        run(config, Arc::new(MemoryStream::new(4)), args.wait).await
    } else {
        let client = KafkaStreamClient::new(&config.stream)?;
        run(config, Arc::new(client), args.wait).await
    }
}

async fn run<C: StreamClient>(config: Config, client: Arc<C>, wait: bool) -> anyhow::Result<()> {
    let ack_timeout = config.ack_timeout();
    let forwarder = Forwarder::start(config, client)?;
    forwarder.subscribe(|id, outcome| {
        if !outcome.is_delivered() {
            warn!(record_id = %id, outcome = ?outcome, "Event not delivered");
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut line_no: u64 = 0;

    loop {
        let line = tokio::select! {
            line = lines.next_line() => line.context("failed to read stdin")?,
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal");
                break;
            }
        };
        let Some(line) = line else {
            info!("End of input");
            break;
        };
        line_no += 1;
        if line.trim().is_empty() {
            continue;
        }

        let event: serde_json::Value = match serde_json::from_str(&line) {
            Ok(event) => event,
            Err(e) => {
                warn!(line = line_no, error = %e, "Skipping malformed line");
                continue;
            }
        };

        if wait {
            match forwarder.submit_and_wait(&event, ack_timeout).await {
                Ok(outcome) => info!(line = line_no, outcome = ?outcome, "Event resolved"),
                Err(e) => warn!(line = line_no, error = %e, "Event not accepted"),
            }
            continue;
        }

        loop {
            match forwarder.submit(&event) {
                Ok(_) => break,
                Err(Error::Backpressure { .. }) => tokio::time::sleep(BACKPRESSURE_PAUSE).await,
                Err(e) => {
                    warn!(line = line_no, error = %e, "Event not accepted");
                    break;
                }
            }
        }
    }

    let stats = forwarder.shutdown().await;
    info!(
        submitted = stats.submitted,
        delivered = stats.records_delivered,
        failed = stats.records_failed,
        retries = stats.retries,
        success_rate = stats.success_rate(),
        "Forwarding complete"
    );
    if stats.records_failed > 0 {
        error!(failed = stats.records_failed, "Some events were not delivered");
    }

    Ok(())
}

fn init_logging(json: bool, verbose: bool) {
    let env_filter = if verbose {
        EnvFilter::new("stream_forwarder=debug,info")
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("stream_forwarder=info,warn"))
    };

    // Logs go to stderr so stdout stays free for piping.
    let fmt_layer = if json {
        tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .json()
            .flatten_event(true)
            .with_current_span(false)
            .with_span_list(false)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(false)
            .with_thread_ids(false)
            .with_thread_names(false)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}
