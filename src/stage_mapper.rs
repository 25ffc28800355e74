//! Translation of backend status tokens into canonical stages and progress.
//!
//! The mapper is pure: it takes the committed stages and a raw report and
//! returns a candidate. Whether the candidate is accepted is the reconciler's
//! decision.

use crate::domain::{CanonicalStatus, StageId, StageRecord, StageStatus, TimestampUtc};

/// Default credit given to the single in-progress stage.
pub const DEFAULT_PARTIAL_CREDIT: f64 = 0.5;

/// Tokens naming the overall state of a running workflow rather than a stage.
const ACTIVE_TOKENS: &[&str] = &[
    "processing",
    "in_progress",
    "running",
    "active",
    "started",
    "generating",
];

const STATUS_TOKENS: &[(&str, CanonicalStatus)] = &[
    ("pending", CanonicalStatus::Pending),
    ("queued", CanonicalStatus::Pending),
    ("created", CanonicalStatus::Pending),
    ("submitted", CanonicalStatus::Pending),
    ("waiting", CanonicalStatus::Pending),
    ("not_started", CanonicalStatus::Pending),
    ("planning", CanonicalStatus::Planning),
    ("plan", CanonicalStatus::Planning),
    ("analyzing", CanonicalStatus::Planning),
    ("outlining", CanonicalStatus::Planning),
    ("content_creation", CanonicalStatus::ContentCreation),
    ("content_generation", CanonicalStatus::ContentCreation),
    ("generating_content", CanonicalStatus::ContentCreation),
    ("creating_content", CanonicalStatus::ContentCreation),
    ("writing", CanonicalStatus::ContentCreation),
    ("drafting", CanonicalStatus::ContentCreation),
    ("quality_review", CanonicalStatus::QualityReview),
    ("quality_check", CanonicalStatus::QualityReview),
    ("review", CanonicalStatus::QualityReview),
    ("reviewing", CanonicalStatus::QualityReview),
    ("validating", CanonicalStatus::QualityReview),
    ("completed", CanonicalStatus::Completed),
    ("complete", CanonicalStatus::Completed),
    ("done", CanonicalStatus::Completed),
    ("success", CanonicalStatus::Completed),
    ("succeeded", CanonicalStatus::Completed),
    ("finished", CanonicalStatus::Completed),
    ("failed", CanonicalStatus::Failed),
    ("failure", CanonicalStatus::Failed),
    ("error", CanonicalStatus::Failed),
    ("errored", CanonicalStatus::Failed),
    ("cancelled", CanonicalStatus::Cancelled),
    ("canceled", CanonicalStatus::Cancelled),
    ("aborted", CanonicalStatus::Cancelled),
];

/// Result of looking a raw token up in the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Token {
    Status(CanonicalStatus),
    /// "Something is running"; the stage must come from elsewhere.
    Active,
    Unknown,
}

/// Lowercases and normalises separators so `"Content-Creation"` and
/// `"content creation"` both match `content_creation`.
pub fn normalize_token(raw: &str) -> String {
    raw.trim()
        .chars()
        .map(|c| match c {
            '-' | ' ' => '_',
            c => c.to_ascii_lowercase(),
        })
        .collect()
}

pub fn lookup_token(raw: &str) -> Token {
    let token = normalize_token(raw);
    if ACTIVE_TOKENS.contains(&token.as_str()) {
        return Token::Active;
    }
    STATUS_TOKENS
        .iter()
        .find(|(name, _)| *name == token)
        .map(|(_, status)| Token::Status(*status))
        .unwrap_or(Token::Unknown)
}

/// Inputs for one mapping.
#[derive(Debug, Clone)]
pub struct MapRequest<'a> {
    pub raw_status: Option<&'a str>,
    /// The snapshot's `current_stage` field, when the backend sends one.
    pub stage_hint: Option<&'a str>,
    pub current_status: CanonicalStatus,
    pub current_stages: &'a [StageRecord],
    /// Floor for the computed progress.
    pub previous_progress: u8,
    pub reported_progress: Option<f64>,
    pub error: Option<&'a str>,
    pub now: TimestampUtc,
}

/// A candidate produced by the mapper.
#[derive(Debug, Clone, PartialEq)]
pub struct StageMapping {
    pub status: CanonicalStatus,
    pub stages: Vec<StageRecord>,
    pub progress_percent: u8,
    /// False when the raw token was not in the table.
    pub recognized: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct StageMapper {
    partial_credit: f64,
}

impl Default for StageMapper {
    fn default() -> Self {
        Self::new(DEFAULT_PARTIAL_CREDIT)
    }
}

impl StageMapper {
    pub fn new(partial_credit: f64) -> Self {
        Self {
            partial_credit: partial_credit.clamp(0.0, 1.0),
        }
    }

    pub fn partial_credit(&self) -> f64 {
        self.partial_credit
    }

    /// Resolves the raw token (and stage hint) to a canonical status.
    ///
    /// Unknown tokens fall back to the hinted stage or, failing that, to the
    /// current status, which is the nearest known predecessor.
    pub fn resolve(
        &self,
        raw_status: Option<&str>,
        stage_hint: Option<&str>,
        current: CanonicalStatus,
    ) -> (CanonicalStatus, bool) {
        let hinted = stage_hint.and_then(|hint| match lookup_token(hint) {
            Token::Status(status) if status.stage().is_some() => Some(status),
            _ => None,
        });

        match raw_status.map(|raw| (raw, lookup_token(raw))) {
            Some((_, Token::Status(status))) => (status, true),
            Some((_, Token::Active)) | None => (hinted.unwrap_or(current), true),
            Some((raw, Token::Unknown)) => {
                let fallback = hinted.unwrap_or(current);
                tracing::warn!(
                    token = raw,
                    fallback = %fallback,
                    "Unknown status token, keeping nearest known stage"
                );
                (fallback, false)
            }
        }
    }

    pub fn map_status(&self, request: MapRequest<'_>) -> StageMapping {
        let (status, recognized) = self.resolve(
            request.raw_status,
            request.stage_hint,
            request.current_status,
        );
        let hinted_stage = request
            .stage_hint
            .and_then(|hint| match lookup_token(hint) {
                Token::Status(s) => s.stage(),
                _ => None,
            });

        let mut stages = request.current_stages.to_vec();
        let now = request.now;

        match status {
            CanonicalStatus::Pending => {}
            CanonicalStatus::Planning
            | CanonicalStatus::ContentCreation
            | CanonicalStatus::QualityReview => {
                let ordinal = status.ordinal();
                for stage in stages.iter_mut() {
                    let stage_ordinal = stage.id.ordinal();
                    if stage_ordinal < ordinal && !stage.status.is_settled() {
                        complete_stage(stage, now);
                    } else if stage_ordinal == ordinal && !stage.status.is_settled() {
                        start_stage(stage, now);
                    }
                }
            }
            CanonicalStatus::Completed => {
                for stage in stages.iter_mut().filter(|s| !s.status.is_settled()) {
                    complete_stage(stage, now);
                }
            }
            CanonicalStatus::Failed => {
                let message = request.error.unwrap_or("workflow failed");
                fail_stage(&mut stages, hinted_stage, message, now);
            }
            CanonicalStatus::Cancelled => {
                for stage in stages.iter_mut().filter(|s| !s.status.is_settled()) {
                    stage.status = StageStatus::Skipped;
                    stage.ended_at = Some(now);
                }
            }
        }

        // A non-fatal error attaches to whichever stage is running.
        if let (Some(error), false) = (request.error, status.is_terminal()) {
            if let Some(stage) = stages
                .iter_mut()
                .find(|s| s.status == StageStatus::InProgress)
            {
                stage.error_message = Some(error.to_string());
            }
        }

        let computed = if status == CanonicalStatus::Completed {
            100
        } else if let Some(reported) = request.reported_progress {
            clamp_percent(reported)
        } else {
            self.derive_progress(&stages)
        };

        let progress_percent = if computed < request.previous_progress {
            tracing::debug!(
                computed,
                previous = request.previous_progress,
                status = %status,
                "Progress would regress, keeping previous value"
            );
            request.previous_progress
        } else {
            computed
        };

        StageMapping {
            status,
            stages,
            progress_percent,
            recognized,
        }
    }

    /// `done / total * 100`, plus partial credit for the running stage.
    pub fn derive_progress(&self, stages: &[StageRecord]) -> u8 {
        if stages.is_empty() {
            return 0;
        }
        let total = stages.len() as f64;
        let done = stages
            .iter()
            .filter(|s| matches!(s.status, StageStatus::Completed | StageStatus::Skipped))
            .count() as f64;
        let running = if stages.iter().any(|s| s.status == StageStatus::InProgress) {
            self.partial_credit
        } else {
            0.0
        };
        clamp_percent((done + running) / total * 100.0)
    }
}

/// Stages from `stage` onward go back to pending so a retried stage can run
/// again. Earlier stages keep their history.
pub fn reopen_from(stages: &[StageRecord], stage: StageId) -> Vec<StageRecord> {
    stages
        .iter()
        .map(|record| {
            if record.id.ordinal() >= stage.ordinal() {
                StageRecord::new(record.id)
            } else {
                record.clone()
            }
        })
        .collect()
}

fn clamp_percent(value: f64) -> u8 {
    if value.is_nan() {
        return 0;
    }
    value.round().clamp(0.0, 100.0) as u8
}

fn start_stage(stage: &mut StageRecord, now: TimestampUtc) {
    if stage.status != StageStatus::InProgress {
        stage.status = StageStatus::InProgress;
    }
    stage.started_at.get_or_insert(now);
}

fn complete_stage(stage: &mut StageRecord, now: TimestampUtc) {
    stage.status = StageStatus::Completed;
    stage.started_at.get_or_insert(now);
    stage.ended_at = Some(now);
}

fn fail_stage(
    stages: &mut [StageRecord],
    hinted: Option<StageId>,
    message: &str,
    now: TimestampUtc,
) {
    let target = hinted
        .filter(|id| {
            stages
                .iter()
                .any(|s| s.id == *id && !s.status.is_settled())
        })
        .or_else(|| {
            stages
                .iter()
                .find(|s| s.status == StageStatus::InProgress)
                .map(|s| s.id)
        })
        .or_else(|| stages.iter().find(|s| !s.status.is_settled()).map(|s| s.id));

    let Some(target) = target else {
        return;
    };

    for stage in stages.iter_mut() {
        if stage.id.ordinal() < target.ordinal() && !stage.status.is_settled() {
            complete_stage(stage, now);
        } else if stage.id == target {
            stage.status = StageStatus::Failed;
            stage.started_at.get_or_insert(now);
            stage.ended_at = Some(now);
            stage.error_message = Some(message.to_string());
        }
    }
}

#[cfg(test)]
#[path = "tests/stage_mapper_tests.rs"]
mod tests;
