use clap::{Parser, Subcommand};
use pg_sql_replay::kafka::{KafkaProducer, ShardConsumer, TopicManager};
use pg_sql_replay::postgres::{PgConnection, PostgresTarget, SlotReader};
use pg_sql_replay::telemetry::Telemetry;
use pg_sql_replay::{CaptureService, Config, ReplayExecutor, Result};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

#[derive(Parser, Debug)]
#[command(name = "pg-sql-replay")]
#[command(about = "Replays PostgreSQL changes as SQL through Kafka", long_about = None)]
struct Args {
    #[arg(short, long, value_name = "FILE", default_value = "config.toml")]
    config: PathBuf,

    #[arg(short, long, help = "Enable JSON output for logs")]
    json_logs: bool,

    #[arg(short, long, help = "Verbose logging")]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Read the replication slot and publish one SQL batch per transaction
    Capture,
    /// Apply SQL batches from Kafka to the target database
    Replay {
        #[arg(long, value_name = "ID")]
        shard_id: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    init_logging(args.json_logs, args.verbose);

    info!("Loading configuration from {:?}", args.config);
    let config = match Config::from_file(&args.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    let result = match args.command {
        Command::Capture => run_capture(config, shutdown_rx).await,
        Command::Replay { shard_id } => run_replay(config, &shard_id, shutdown_rx).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) if e.is_fatal() => {
            error!("Stopped with fatal error: {}", e);
            ExitCode::FAILURE
        }
        Err(e) => {
            warn!("Stopped after non-fatal error: {}", e);
            ExitCode::SUCCESS
        }
    }
}

async fn run_capture(config: Config, shutdown: watch::Receiver<bool>) -> Result<()> {
    info!(
        postgres_host = %config.postgres.host,
        postgres_port = %config.postgres.port,
        postgres_database = %config.postgres.database,
        slot = %config.postgres.slot_name,
        kafka_brokers = ?config.kafka.brokers,
        kafka_topic = %config.kafka.topic,
        "Starting capture"
    );

    let connection = PgConnection::connect(
        &config.postgres_url(),
        &config.postgres.ssl_mode,
        Duration::from_secs(config.postgres.connect_timeout_secs),
        "source",
    )
    .await?;
    let mut reader = SlotReader::new(
        connection,
        config.postgres.slot_name.clone(),
        config.capture.max_changes_per_poll,
    );
    reader.ensure_slot().await?;

    TopicManager::new(&config.kafka)?
        .ensure_topic_exists(&config.kafka.topic)
        .await?;
    let producer = KafkaProducer::new(&config.kafka)?;

    let telemetry = Telemetry::new(format!("{}-capture", config.telemetry.service_name));
    let mut capture = CaptureService::new(
        reader,
        producer,
        config.capture.serializer(),
        config.kafka.partition_key.clone(),
        config.kafka.topic.clone(),
        Duration::from_millis(config.capture.poll_interval_ms),
        telemetry,
    );

    capture.run(shutdown).await
}

async fn run_replay(config: Config, shard_id: &str, shutdown: watch::Receiver<bool>) -> Result<()> {
    let group_id = config.consumer_group(shard_id);
    info!(
        shard_id,
        group_id = %group_id,
        kafka_topic = %config.kafka.topic,
        "Starting replay"
    );

    let consumer = Arc::new(ShardConsumer::new(&config.kafka, &group_id)?);
    let connection = PgConnection::connect(
        &config.target.url,
        &config.postgres.ssl_mode,
        Duration::from_secs(config.postgres.connect_timeout_secs),
        "target",
    )
    .await?;

    let telemetry = Telemetry::new(format!(
        "{}-shard-{}",
        config.telemetry.service_name, shard_id
    ));
    let mut executor = ReplayExecutor::new(
        PostgresTarget::new(connection),
        consumer.clone(),
        telemetry,
        config.replay.skip_without_trace_context,
    );

    executor.run(consumer.as_ref(), shutdown).await?;

    drop(executor);
    drop(consumer);
    info!(shard_id, "Replay resources released");
    Ok(())
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
}

fn init_logging(json: bool, verbose: bool) {
    let env_filter = if verbose {
        EnvFilter::new("pg_sql_replay=debug,info")
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("pg_sql_replay=info,warn"))
    };

    let fmt_layer = if json {
        tracing_subscriber::fmt::layer()
            .json()
            .flatten_event(true)
            .with_current_span(false)
            .with_span_list(false)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
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
