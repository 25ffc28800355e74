//! Strongly typed domain primitives for tracked workflows.
//!
//! These types describe what the engine knows about one workflow: its
//! canonical status, the fixed stage sequence, and how the client is currently
//! connected to the backend.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Opaque identifier for a backend workflow (e.g. `"wf_1"`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkflowId(pub String);

impl WorkflowId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for WorkflowId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for WorkflowId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl std::fmt::Display for WorkflowId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// UTC timestamp used for stage and state bookkeeping.
pub type TimestampUtc = DateTime<Utc>;

/// Canonical workflow status.
///
/// The backend reports free-form tokens; the stage mapper translates them into
/// one of these values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CanonicalStatus {
    #[default]
    Pending,
    Planning,
    ContentCreation,
    QualityReview,
    Completed,
    Failed,
    Cancelled,
}

impl CanonicalStatus {
    /// Position in the pipeline. All terminal statuses share the highest ordinal.
    pub fn ordinal(self) -> u8 {
        match self {
            CanonicalStatus::Pending => 0,
            CanonicalStatus::Planning => 1,
            CanonicalStatus::ContentCreation => 2,
            CanonicalStatus::QualityReview => 3,
            CanonicalStatus::Completed | CanonicalStatus::Failed | CanonicalStatus::Cancelled => 4,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            CanonicalStatus::Completed | CanonicalStatus::Failed | CanonicalStatus::Cancelled
        )
    }

    /// The stage this status corresponds to, if it names one.
    pub fn stage(self) -> Option<StageId> {
        match self {
            CanonicalStatus::Planning => Some(StageId::Planning),
            CanonicalStatus::ContentCreation => Some(StageId::ContentCreation),
            CanonicalStatus::QualityReview => Some(StageId::QualityReview),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CanonicalStatus::Pending => "pending",
            CanonicalStatus::Planning => "planning",
            CanonicalStatus::ContentCreation => "content_creation",
            CanonicalStatus::QualityReview => "quality_review",
            CanonicalStatus::Completed => "completed",
            CanonicalStatus::Failed => "failed",
            CanonicalStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for CanonicalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One of the fixed pipeline stages, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageId {
    Planning,
    ContentCreation,
    QualityReview,
}

impl StageId {
    /// Every stage in pipeline order.
    pub const ALL: [StageId; 3] = [
        StageId::Planning,
        StageId::ContentCreation,
        StageId::QualityReview,
    ];

    pub fn ordinal(self) -> u8 {
        self.status().ordinal()
    }

    /// The canonical status reported while this stage runs.
    pub fn status(self) -> CanonicalStatus {
        match self {
            StageId::Planning => CanonicalStatus::Planning,
            StageId::ContentCreation => CanonicalStatus::ContentCreation,
            StageId::QualityReview => CanonicalStatus::QualityReview,
        }
    }
}

/// Status of a single stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    Failed,
    Skipped,
}

impl StageStatus {
    /// True once the stage can no longer change on forward progress.
    pub fn is_settled(self) -> bool {
        matches!(
            self,
            StageStatus::Completed | StageStatus::Failed | StageStatus::Skipped
        )
    }
}

/// A stage and its mutable bookkeeping. Identity and order never change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageRecord {
    pub id: StageId,
    pub status: StageStatus,
    pub started_at: Option<TimestampUtc>,
    pub ended_at: Option<TimestampUtc>,
    pub error_message: Option<String>,
}

impl StageRecord {
    pub fn new(id: StageId) -> Self {
        Self {
            id,
            status: StageStatus::Pending,
            started_at: None,
            ended_at: None,
            error_message: None,
        }
    }

    /// The full stage sequence in its initial state.
    pub fn initial_stages() -> Vec<StageRecord> {
        StageId::ALL.iter().copied().map(StageRecord::new).collect()
    }
}

/// How the client is currently hearing about a workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Connectivity {
    Connected,
    #[default]
    Disconnected,
    Reconnecting,
    /// Push channel is down or closed; polling is the sole source of truth.
    PollingOnly,
}

impl std::fmt::Display for Connectivity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Connectivity::Connected => write!(f, "connected"),
            Connectivity::Disconnected => write!(f, "disconnected"),
            Connectivity::Reconnecting => write!(f, "reconnecting"),
            Connectivity::PollingOnly => write!(f, "polling_only"),
        }
    }
}

/// Which channel produced an update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateSource {
    Push,
    Poll,
}

impl std::fmt::Display for UpdateSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UpdateSource::Push => write!(f, "push"),
            UpdateSource::Poll => write!(f, "poll"),
        }
    }
}
