//! Domain model for tracked workflows.
//!
//! # Architecture
//!
//! - **Types** (`types.rs`): identifiers, canonical statuses, stages, connectivity
//! - **State** (`state.rs`): the committed `WorkflowState` and `StateChange` events
//! - **Errors** (`errors.rs`): transport, fetch, registry errors and reconciliation anomalies

pub mod errors;
pub mod state;
pub mod types;

pub use errors::{Anomaly, FetchError, TrackerError, TransportError};
pub use state::{ChangeCause, StateChange, WorkflowState};
pub use types::{
    CanonicalStatus, Connectivity, StageId, StageRecord, StageStatus, TimestampUtc, UpdateSource,
    WorkflowId,
};
