//! Shared foundations for the KestrelDB workflow orchestrator: canonical
//! error taxonomy, cluster-addressing types, key ranges, replication
//! positions, orchestrator configuration, and the per-verb operation
//! context.

pub mod config;
pub mod error;
pub mod keyrange;
pub mod opctx;
pub mod retry;
pub mod types;

pub use config::OrchestratorConfig;
pub use error::{ErrorCode, ErrorContext, ErrorRecorder, KestrelError, KestrelResult};
pub use keyrange::KeyRange;
pub use opctx::OpCtx;
pub use retry::retry_on_error;
pub use types::{Position, TabletAlias, TabletType};
