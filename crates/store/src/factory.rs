use std::sync::Arc;

use tracing::info;
use waypoint_core::config::{BrokerBackend, BrokerConfig, ClientBackend, ClientConfig};

use crate::batched::{BatchedSqliteBroker, BatchedSqliteClient};
use crate::broker::Broker;
use crate::client::Client;
use crate::error::StoreResult;
use crate::memory::{MemoryBroker, MemoryClient};
use crate::pubsub::RedisBroker;
use crate::rest::HttpClient;
use crate::sqlite::{SqliteBroker, SqliteClient};

/// Build the journey store selected by `config.backend`.
pub fn client_from_config(config: &ClientConfig) -> StoreResult<Arc<dyn Client>> {
    info!(backend = ?config.backend, "Initialising journey store");
    let client: Arc<dyn Client> = match config.backend {
        ClientBackend::Memory => Arc::new(MemoryClient::new()),
        ClientBackend::Sqlite => Arc::new(SqliteClient::open(&config.sqlite_path)?),
        ClientBackend::BatchedSqlite => Arc::new(BatchedSqliteClient::new(
            SqliteClient::open(&config.sqlite_path)?,
            config.batch_size,
        )),
        ClientBackend::Http => Arc::new(HttpClient::from_config(&config.http)?),
    };
    Ok(client)
}

/// Build the broker selected by `config.backend`.
pub fn broker_from_config(config: &BrokerConfig) -> StoreResult<Arc<dyn Broker>> {
    info!(backend = ?config.backend, "Initialising broker");
    let broker: Arc<dyn Broker> = match config.backend {
        BrokerBackend::Memory => Arc::new(MemoryBroker::new()),
        BrokerBackend::Sqlite => Arc::new(SqliteBroker::open(&config.sqlite_path)?),
        BrokerBackend::BatchedSqlite => Arc::new(BatchedSqliteBroker::new(
            SqliteBroker::open(&config.sqlite_path)?,
            config.batch_size,
        )),
        BrokerBackend::Redis => Arc::new(RedisBroker::new(&config.redis)?),
    };
    Ok(broker)
}
