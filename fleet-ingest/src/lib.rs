pub mod broker;
pub mod config;
pub mod pipeline;
pub mod storage;

pub use broker::{
    ConnectionManager, InboundMessage, MessageHandler, SessionError, SessionState,
};
pub use config::{BrokerConfig, Config, DatabaseConfig, IngestConfig, SqliteConfig, Transport};
pub use pipeline::{IngestPipeline, IngestReport};
pub use storage::{
    Applied, ConnectionProvider, DeviceResolver, FailureKind, OsVersionStore, ProviderError,
    SignalStore, SqliteProvider, StatisticsStore, StatusStore, StorageStore, StoreError,
    StoreKind,
};
