//! Marten - Entity-resolution data mart replication server
//!
//! Consumes affected-entity notifications, fetches current entity state
//! from the resolution engine, reconciles it against the replicated state
//! by hash comparison, and maintains four aggregated statistical reports
//! through a pending-delta queue.

pub mod api;
pub mod config;
pub mod error;
pub mod services;
pub mod sources;
pub mod types;

// Re-export the working set most callers need
pub use config::Config;
pub use error::TaskError;
pub use services::{
    DataMartStore, EntityDelta, MessageConsumer, RefreshService, ReportAggregator, RetryPolicy,
    Scheduler, WorkerPool,
};
pub use sources::EngineClient;
