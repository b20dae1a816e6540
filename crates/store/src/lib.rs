//! Journey persistence backends.
//!
//! A [`Client`] stores journeys with their step and state history; a
//! [`Broker`] is a keyed data store that can also publish envelopes on the
//! `internal` and `external` channels. Every backend implements the same
//! traits so steps and decisions never know where their data lives.

#![warn(clippy::unwrap_used)]

pub mod batched;
pub mod broker;
pub mod client;
pub mod error;
pub mod factory;
pub mod memory;
pub mod pubsub;
pub mod rest;
pub mod sqlite;

pub use batched::{BatchedSqliteBroker, BatchedSqliteClient};
pub use broker::{Broker, MessageHandler};
pub use client::Client;
pub use error::{ClientError, StoreError, StoreResult};
pub use factory::{broker_from_config, client_from_config};
pub use memory::{MemoryBroker, MemoryClient};
pub use pubsub::RedisBroker;
pub use rest::{HttpApi, HttpClient};
pub use sqlite::{SqliteBroker, SqliteClient};
