//! Error types for the tracking engine.

use crate::domain::types::{CanonicalStatus, UpdateSource};
use std::fmt::{Display, Formatter};

/// Errors surfaced by the registry and its actors.
#[derive(Debug, Clone)]
pub enum TrackerError {
    /// The reconciler actor could not be spawned.
    SpawnFailed { message: String },
    /// The registry has been torn down.
    RegistryClosed,
    /// The tracker configuration failed validation.
    InvalidConfig { message: String },
    /// Per-workflow options were rejected before anything was started.
    InvalidOptions { message: String },
}

impl Display for TrackerError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SpawnFailed { message } => write!(f, "failed to spawn reconciler: {}", message),
            Self::RegistryClosed => write!(f, "registry is closed"),
            Self::InvalidConfig { message } => write!(f, "invalid configuration: {}", message),
            Self::InvalidOptions { message } => write!(f, "invalid track options: {}", message),
        }
    }
}

impl std::error::Error for TrackerError {}

/// Push channel failures. All of these are recovered by reconnecting.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportError {
    Refused(String),
    Timeout,
    Closed,
    Protocol(String),
}

impl Display for TransportError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Refused(reason) => write!(f, "connection refused: {}", reason),
            Self::Timeout => write!(f, "connection timed out"),
            Self::Closed => write!(f, "connection closed"),
            Self::Protocol(reason) => write!(f, "protocol error: {}", reason),
        }
    }
}

impl std::error::Error for TransportError {}

/// Status fetch failures. All of these are retried on the next poll tick.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchError {
    NotFound,
    Timeout,
    Transport(String),
    Malformed(String),
}

impl Display for FetchError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound => write!(f, "workflow not found"),
            Self::Timeout => write!(f, "status request timed out"),
            Self::Transport(reason) => write!(f, "transport error: {}", reason),
            Self::Malformed(reason) => write!(f, "malformed status payload: {}", reason),
        }
    }
}

impl std::error::Error for FetchError {}

/// Protocol anomalies detected while reconciling. Logged and discarded.
#[derive(Debug, Clone, PartialEq)]
pub enum Anomaly {
    /// The update would move the workflow backwards.
    Regression {
        source: UpdateSource,
        from: CanonicalStatus,
        to: CanonicalStatus,
    },
    /// A push update that is not newer than the last applied push update.
    StalePush,
    /// The payload could not be understood.
    Malformed(String),
}

impl Display for Anomaly {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Regression { source, from, to } => {
                write!(f, "{} update regresses {} -> {}", source, from, to)
            }
            Self::StalePush => write!(f, "stale push update"),
            Self::Malformed(reason) => write!(f, "malformed payload: {}", reason),
        }
    }
}
