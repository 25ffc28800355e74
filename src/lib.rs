//! Client-side status reconciliation for long-running backend workflows.
//!
//! A workflow is followed over two channels at once: a push channel that may
//! drop or reorder messages, and a periodic status poll. Each tracked
//! workflow gets one reconciler actor that merges both into a single
//! monotonic `WorkflowState`, and a dispatcher that notifies each meaningful
//! transition exactly once.

pub mod backoff;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod domain;
pub mod gate;
pub mod payload;
pub mod poll;
pub mod reconciler;
pub mod registry;
pub mod stage_mapper;

#[cfg(test)]
mod test_support;

pub use config::{TrackOptions, TrackerConfig};
pub use dispatcher::{Notification, NotificationKind, Notifier};
pub use domain::{
    CanonicalStatus, Connectivity, StateChange, TrackerError, WorkflowId, WorkflowState,
};
pub use registry::{MultiTracker, Registry, SubscriptionHandle, WorkflowTracker};
pub use stage_mapper::StageMapper;
