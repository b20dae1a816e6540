//! Waypoint journey orchestration engine.
//!
//! Runs the built-in admission plan once for each given reference, or
//! listens on the broker's internal channel and runs it per message.

mod admission;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info, warn};
use waypoint_core::config::{AppConfig, BrokerBackend};
use waypoint_core::Channel;
use waypoint_journey::{Clock, Driver, JourneyWorker};
use waypoint_store::{broker_from_config, client_from_config, Broker, Client, RedisBroker};

#[derive(Parser, Debug)]
#[command(name = "waypoint")]
#[command(about = "Journey orchestration engine")]
#[command(version)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(long, env = "WAYPOINT_CONFIG")]
    config: Option<String>,

    /// Journey reference to run (repeatable)
    #[arg(long = "reference")]
    references: Vec<String>,

    /// Listen on the Redis internal channel instead of running references
    #[arg(long, default_value_t = false)]
    listen: bool,

    /// Journey namespace (overrides config)
    #[arg(long, env = "WAYPOINT__SOURCE")]
    source: Option<String>,

    /// SQLite file with the source tables (overrides config)
    #[arg(long, env = "WAYPOINT__ENGINE__DATA_PATH")]
    data_path: Option<String>,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "waypoint=info,waypoint_journey=info,waypoint_store=info".into()),
        )
        .json()
        .init();

    let cli = Cli::parse();

    info!("Waypoint starting up");

    let mut config = AppConfig::load(cli.config.as_deref()).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        AppConfig::default()
    });

    if let Some(source) = cli.source {
        config.source = source;
    }
    if let Some(data_path) = cli.data_path {
        config.engine.data_path = data_path;
    }

    info!(
        source = %config.source,
        client = ?config.client.backend,
        broker = ?config.broker.backend,
        data_path = %config.engine.data_path,
        "Configuration loaded"
    );

    let plan = Arc::new(admission::admission_plan(
        &config.engine.data_path,
        &config.engine.watch_messages,
    )?);
    let client = client_from_config(&config.client)?;

    if cli.listen {
        if config.broker.backend != BrokerBackend::Redis {
            warn!(backend = ?config.broker.backend, "Listening requires Redis, connecting anyway");
        }
        let stop = Arc::new(AtomicBool::new(false));
        let flag = stop.clone();
        ctrlc::set_handler(move || flag.store(true, Ordering::SeqCst))?;

        let redis = Arc::new(RedisBroker::new(&config.broker.redis)?);
        let worker = JourneyWorker::new(plan, client.clone(), redis.clone(), config.source.clone());
        let listened = redis.listen(Channel::Internal, &worker, &stop);
        drop(worker);

        info!("Shutting down, flushing buffered journeys");
        let flushed = client.flush()?;
        info!(journeys = flushed, "Waypoint finished");
        return listened.map_err(Into::into);
    }

    if cli.references.is_empty() {
        warn!("No references given, nothing to run");
        return Ok(());
    }

    let broker = broker_from_config(&config.broker)?;
    for reference in &cli.references {
        let mut driver = Driver::find_or_create(
            reference,
            &config.source,
            client.clone(),
            broker.clone(),
            Clock::Local,
        )?;
        match plan.run(&mut driver) {
            Ok(status) => info!(
                journey = %reference,
                status = %serde_json::to_string(&status)?,
                "Run finished"
            ),
            Err(e) => error!(journey = %reference, error = %e, "Run failed"),
        }
    }

    let flushed = client.flush()?;
    broker.flush()?;
    info!(journeys = flushed, "Waypoint finished");
    Ok(())
}
