pub mod backoff;
pub mod config;
pub mod db;
pub mod dispatch;
pub mod error;
pub mod gateway;
pub mod models;
pub mod parser;
pub mod prompt;
pub mod queue;
pub mod store;

pub use config::{ParseFailurePolicy, RecapConfig};
pub use dispatch::DispatchMode;
pub use error::{QueueError, RecapError, StoreError};
pub use gateway::{CallOptions, ChatModel, GatewayConfig, GatewayError, ModelGateway};
pub use prompt::ChatMessage;
pub use queue::{InMemoryJobQueue, JobQueue, PgJobQueue};
pub use store::{InMemorySummaryStore, PgSummaryStore, SummaryStore};
