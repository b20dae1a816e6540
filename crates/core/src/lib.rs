//! Shared building blocks for the journey engine: configuration, the codec
//! used on every wire and column, and the record types persisted by stores.

pub mod codec;
pub mod config;
pub mod error;
pub mod types;

pub use codec::JsonCodec;
pub use config::AppConfig;
pub use error::{CoreError, CoreResult};
pub use types::{
    BrokerMessage, Channel, Journey, StateRecord, StateUpdate, StepRecord, StepStatus, StepUpdate,
    StepWrite,
};
