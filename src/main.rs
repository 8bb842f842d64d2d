use binlog_hub::checkpoint::CheckpointManager;
use binlog_hub::hub::{EventHubConnection, KafkaPublisher};
use binlog_hub::source::ReplicationSource;
use binlog_hub::{Config, Error, Replicator, Result};
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

#[derive(Parser, Debug)]
#[command(name = "binlog-hub")]
#[command(about = "MySQL binlog to Azure Event Hubs CDC replicator", long_about = None)]
struct Args {
    #[arg(short, long, value_name = "FILE", env = "CONFIG")]
    config: PathBuf,

    #[arg(short, long, help = "Enable JSON output for logs")]
    json_logs: bool,

    #[arg(short, long, help = "Verbose logging")]
    verbose: bool,

    #[arg(long, help = "Delete the saved binlog position before starting")]
    reset_position: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    init_logging(args.json_logs, args.verbose);

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(Error::Shutdown) => {
            info!("Stopped");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("{}", e);
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run(args: Args) -> Result<()> {
    info!("Starting binlog-hub");
    info!("Loading configuration from {:?}", args.config);

    let config = Config::from_file(&args.config)?;

    info!(
        mysql_address = %config.connection.mysql.address,
        mysql_server_id = config.connection.mysql.server_id,
        tables = ?config.allowed_tables(),
        position_file = %config.position_path().display(),
        max_events = config.connection.eventhub.publishing.max_events,
        "Configuration summary"
    );

    let checkpoints = CheckpointManager::new(config.position_path());
    if args.reset_position {
        warn!("Discarding saved position {:?}", checkpoints.path());
        checkpoints.delete().await?;
    }

    let source = binlog_source(&config)?;
    let connection = EventHubConnection::parse(&config.connection.eventhub.connection_url)?;
    let publisher = KafkaPublisher::new(&connection)?;

    let replicator = Replicator::new(&config, source, Arc::new(publisher), Arc::new(checkpoints));

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("Received shutdown signal"),
                Err(e) => error!("Cannot listen for shutdown signal: {}", e),
            }
            shutdown.cancel();
        }
    });

    replicator.run(shutdown).await
}

#[cfg(feature = "mysql")]
fn binlog_source(config: &Config) -> Result<Arc<dyn ReplicationSource>> {
    Ok(Arc::new(binlog_hub::source::BinlogSource::new(
        &config.connection.mysql,
        &config.binlog_reader.retry,
    )))
}

#[cfg(not(feature = "mysql"))]
fn binlog_source(_config: &Config) -> Result<Arc<dyn ReplicationSource>> {
    Err(Error::Config(
        "built without MySQL support, rebuild with `--features mysql`".into(),
    ))
}

fn init_logging(json: bool, verbose: bool) {
    let env_filter = if verbose {
        EnvFilter::new("binlog_hub=debug,info")
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("binlog_hub=info,warn"))
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
