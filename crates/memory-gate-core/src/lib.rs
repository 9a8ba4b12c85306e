use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Display, Formatter};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use ulid::Ulid;

/// Trust a superseded memory is left with, regardless of what it held before.
pub const SUPERSEDED_CONFIDENCE_CEILING: f32 = 0.2;

/// Trust ceiling applied by an explicit low-confidence flag.
pub const FLAGGED_CONFIDENCE_CEILING: f32 = 0.5;

#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum GateError {
    #[error("memory not found: {0}")]
    NotFound(MemoryId),
    #[error("duplicate memory id: {0}")]
    DuplicateId(MemoryId),
    #[error("invalid correction: {0}")]
    InvalidCorrection(String),
    #[error("similarity adapter failure: {0}")]
    Adapter(String),
    #[error("similarity search timed out after {0:?}")]
    RetrievalTimeout(Duration),
    #[error("concurrent correction conflict on {0}")]
    RevisionConflict(MemoryId),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("storage error: {0}")]
    Storage(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct MemoryId(pub Ulid);

impl MemoryId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for MemoryId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for MemoryId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct CorrectionId(pub Ulid);

impl CorrectionId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for CorrectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for CorrectionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Retrieval eligibility of a memory. Only `Active` records are ever
/// returned to callers; the other two states exist so exclusion is a stored
/// fact rather than a per-query judgement.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TrustState {
    Active,
    LowConfidence,
    Suppressed,
}

impl TrustState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::LowConfidence => "low_confidence",
            Self::Suppressed => "suppressed",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "active" => Some(Self::Active),
            "low_confidence" => Some(Self::LowConfidence),
            "suppressed" => Some(Self::Suppressed),
            _ => None,
        }
    }
}

/// The trust-bearing fields of a memory, separated out because they are the
/// only fields a correction may overwrite and the only fields audit replay
/// needs to reconstruct.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct TrustFields {
    pub trust_state: TrustState,
    pub confidence: f32,
    pub superseded_by: Option<MemoryId>,
}

impl TrustFields {
    /// Trust every memory starts with at ingest time.
    #[must_use]
    pub fn ingest_default() -> Self {
        Self { trust_state: TrustState::Active, confidence: 1.0, superseded_by: None }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MemoryRecord {
    pub memory_id: MemoryId,
    pub content: String,
    /// Opaque handle into the similarity index. Owned by the adapter; the
    /// store persists it without interpreting it.
    pub embedding_ref: Option<String>,
    pub trust_state: TrustState,
    pub confidence: f32,
    pub superseded_by: Option<MemoryId>,
    /// Compare-and-set token; bumped by every trust update.
    pub revision: u32,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl MemoryRecord {
    /// Build a fresh record with ingest-default trust.
    #[must_use]
    pub fn new_active(
        memory_id: MemoryId,
        content: String,
        embedding_ref: Option<String>,
        created_at: OffsetDateTime,
    ) -> Self {
        let defaults = TrustFields::ingest_default();
        Self {
            memory_id,
            content,
            embedding_ref,
            trust_state: defaults.trust_state,
            confidence: defaults.confidence,
            superseded_by: defaults.superseded_by,
            revision: 1,
            created_at,
            updated_at: created_at,
        }
    }

    #[must_use]
    pub fn trust_fields(&self) -> TrustFields {
        TrustFields {
            trust_state: self.trust_state,
            confidence: self.confidence,
            superseded_by: self.superseded_by,
        }
    }

    /// Validate one memory record against domain invariants.
    ///
    /// # Errors
    /// Returns [`GateError::Validation`] when content, confidence, revision,
    /// or supersession constraints are violated.
    pub fn validate(&self) -> Result<(), GateError> {
        if self.content.trim().is_empty() {
            return Err(GateError::Validation("content MUST be non-empty".to_string()));
        }

        if !(0.0..=1.0).contains(&self.confidence) {
            return Err(GateError::Validation("confidence MUST be in [0.0, 1.0]".to_string()));
        }

        if self.revision == 0 {
            return Err(GateError::Validation("revision MUST be >= 1".to_string()));
        }

        if self.superseded_by == Some(self.memory_id) {
            return Err(GateError::Validation(
                "a memory MUST NOT be superseded by itself".to_string(),
            ));
        }

        if self.trust_state == TrustState::Suppressed && self.confidence != 0.0 {
            return Err(GateError::Validation(
                "suppressed memories MUST carry zero confidence".to_string(),
            ));
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CorrectionKind {
    Supersede { new_id: MemoryId },
    FlagLowConfidence,
    Suppress,
    Restore,
}

impl CorrectionKind {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Supersede { .. } => "supersede",
            Self::FlagLowConfidence => "flag_low_confidence",
            Self::Suppress => "suppress",
            Self::Restore => "restore",
        }
    }
}

/// One entry of the append-only correction audit log. The log carries enough
/// to reconstruct every trust transition by replay; see [`replay_corrections`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CorrectionEvent {
    pub correction_id: CorrectionId,
    pub target_id: MemoryId,
    #[serde(flatten)]
    pub kind: CorrectionKind,
    #[serde(with = "time::serde::rfc3339")]
    pub applied_at: OffsetDateTime,
    pub reason: String,
}

impl CorrectionEvent {
    /// Validate audit accountability fields.
    ///
    /// # Errors
    /// Returns [`GateError::Validation`] when the reason is empty.
    pub fn validate(&self) -> Result<(), GateError> {
        if self.reason.trim().is_empty() {
            return Err(GateError::Validation(
                "reason MUST be provided for every correction".to_string(),
            ));
        }
        Ok(())
    }
}

/// Outcome of planning a correction against a record's current trust.
#[derive(Debug, Clone, PartialEq)]
pub enum CorrectionPlan {
    /// The correction has already taken effect; acknowledging it again must
    /// not change state or grow the audit log.
    AlreadyApplied,
    Apply(TrustFields),
}

/// Compute the trust fields a correction would leave behind, without touching
/// any store. Confidence is monotonically non-increasing for every kind
/// except an explicit restore.
///
/// # Errors
/// Returns [`GateError::InvalidCorrection`] when a memory would supersede
/// itself.
pub fn plan_correction(
    current: &TrustFields,
    kind: &CorrectionKind,
    target_id: MemoryId,
) -> Result<CorrectionPlan, GateError> {
    match kind {
        CorrectionKind::Supersede { new_id } => {
            if *new_id == target_id {
                return Err(GateError::InvalidCorrection(
                    "a memory cannot supersede itself".to_string(),
                ));
            }
            if current.superseded_by == Some(*new_id) {
                return Ok(CorrectionPlan::AlreadyApplied);
            }
            // Supersession never weakens an existing suppression.
            let trust_state = if current.trust_state == TrustState::Suppressed {
                TrustState::Suppressed
            } else {
                TrustState::LowConfidence
            };
            Ok(CorrectionPlan::Apply(TrustFields {
                trust_state,
                confidence: current.confidence.min(SUPERSEDED_CONFIDENCE_CEILING),
                superseded_by: Some(*new_id),
            }))
        }
        CorrectionKind::FlagLowConfidence => {
            if current.trust_state == TrustState::Suppressed {
                return Ok(CorrectionPlan::AlreadyApplied);
            }
            if current.trust_state == TrustState::LowConfidence
                && current.confidence <= FLAGGED_CONFIDENCE_CEILING
            {
                return Ok(CorrectionPlan::AlreadyApplied);
            }
            Ok(CorrectionPlan::Apply(TrustFields {
                trust_state: TrustState::LowConfidence,
                confidence: current.confidence.min(FLAGGED_CONFIDENCE_CEILING),
                superseded_by: current.superseded_by,
            }))
        }
        CorrectionKind::Suppress => {
            if current.trust_state == TrustState::Suppressed {
                return Ok(CorrectionPlan::AlreadyApplied);
            }
            Ok(CorrectionPlan::Apply(TrustFields {
                trust_state: TrustState::Suppressed,
                confidence: 0.0,
                superseded_by: current.superseded_by,
            }))
        }
        CorrectionKind::Restore => {
            let restored = TrustFields::ingest_default();
            if *current == restored {
                return Ok(CorrectionPlan::AlreadyApplied);
            }
            Ok(CorrectionPlan::Apply(restored))
        }
    }
}

/// Follow `superseded_by` links from `start` to the end of the chain,
/// returning every id visited (starting with `start`).
///
/// # Errors
/// Returns [`GateError::InvalidCorrection`] when the links form a cycle, so
/// callers can rely on chain resolution terminating, and surfaces any error
/// `next` hits while resolving a link. A failed lookup is never treated as
/// the end of the chain.
pub fn supersession_chain<F>(start: MemoryId, mut next: F) -> Result<Vec<MemoryId>, GateError>
where
    F: FnMut(MemoryId) -> Result<Option<MemoryId>, GateError>,
{
    let mut chain = vec![start];
    let mut visited: BTreeSet<MemoryId> = BTreeSet::new();
    visited.insert(start);

    let mut cursor = start;
    while let Some(successor) = next(cursor)? {
        if !visited.insert(successor) {
            return Err(GateError::InvalidCorrection(format!(
                "supersession cycle detected at {successor}"
            )));
        }
        chain.push(successor);
        cursor = successor;
    }

    Ok(chain)
}

/// One similarity-ranked candidate produced by the search adapter.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Candidate {
    pub memory_id: MemoryId,
    pub similarity: f32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    Suppressed,
    LowConfidence,
    /// The index returned an id the store no longer knows. Logged and
    /// dropped, never fatal to the query.
    StaleIndexEntry,
}

impl DropReason {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Suppressed => "suppressed",
            Self::LowConfidence => "low_confidence",
            Self::StaleIndexEntry => "stale_index_entry",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct DroppedCandidate {
    pub memory_id: MemoryId,
    pub similarity: f32,
    pub reason: DropReason,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FilterOutcome {
    pub admitted: Vec<Candidate>,
    pub dropped: Vec<DroppedCandidate>,
}

/// Admission control over a similarity-ranked candidate list.
///
/// Admits only candidates whose record is `Active`; everything else is
/// dropped with a reason. The admitted list is a subsequence of the input;
/// this stage never reorders or re-ranks.
#[must_use]
pub fn admit_candidates(
    candidates: &[Candidate],
    records: &BTreeMap<MemoryId, MemoryRecord>,
) -> FilterOutcome {
    let mut admitted = Vec::new();
    let mut dropped = Vec::new();

    for candidate in candidates {
        let Some(record) = records.get(&candidate.memory_id) else {
            dropped.push(DroppedCandidate {
                memory_id: candidate.memory_id,
                similarity: candidate.similarity,
                reason: DropReason::StaleIndexEntry,
            });
            continue;
        };

        match record.trust_state {
            TrustState::Active => admitted.push(*candidate),
            TrustState::LowConfidence => dropped.push(DroppedCandidate {
                memory_id: candidate.memory_id,
                similarity: candidate.similarity,
                reason: DropReason::LowConfidence,
            }),
            TrustState::Suppressed => dropped.push(DroppedCandidate {
                memory_id: candidate.memory_id,
                similarity: candidate.similarity,
                reason: DropReason::Suppressed,
            }),
        }
    }

    FilterOutcome { admitted, dropped }
}

/// Reconstruct trust fields for every corrected memory by folding the audit
/// log, in append order, over ingest-default trust. A store whose current
/// trust fields disagree with the replay has lost or reordered corrections.
///
/// # Errors
/// Returns [`GateError::InvalidCorrection`] when the log contains a
/// self-supersession.
pub fn replay_corrections(
    events: &[CorrectionEvent],
) -> Result<BTreeMap<MemoryId, TrustFields>, GateError> {
    let mut replayed: BTreeMap<MemoryId, TrustFields> = BTreeMap::new();

    for event in events {
        let current = replayed
            .get(&event.target_id)
            .copied()
            .unwrap_or_else(TrustFields::ingest_default);
        match plan_correction(&current, &event.kind, event.target_id)? {
            CorrectionPlan::AlreadyApplied => {}
            CorrectionPlan::Apply(fields) => {
                replayed.insert(event.target_id, fields);
            }
        }
    }

    Ok(replayed)
}

/// Durable record of memories and their correction audit log.
///
/// `update_trust` is the only mutation path for existing records: it must
/// apply the field overwrite and append the audit event in one transaction,
/// guarded by a compare-and-set on `expected_revision` so concurrent
/// corrections on the same id are serialized.
pub trait MemoryStore: Send + Sync {
    /// Insert a new memory.
    ///
    /// # Errors
    /// Returns [`GateError::DuplicateId`] when the id already exists, or
    /// [`GateError::Validation`] when the record is invalid.
    fn put(&self, record: &MemoryRecord) -> Result<(), GateError>;

    /// Fetch one memory.
    ///
    /// # Errors
    /// Returns [`GateError::NotFound`] when the id is absent.
    fn get(&self, memory_id: MemoryId) -> Result<MemoryRecord, GateError>;

    /// Fetch many memories in one consistent snapshot. Missing ids are
    /// simply absent from the result; there is no partial failure.
    ///
    /// # Errors
    /// Returns [`GateError::Storage`] when the backend fails.
    fn batch_get(&self, memory_ids: &[MemoryId])
        -> Result<BTreeMap<MemoryId, MemoryRecord>, GateError>;

    /// Atomically overwrite trust fields and append the audit event.
    ///
    /// # Errors
    /// Returns [`GateError::NotFound`] when the id is absent, or
    /// [`GateError::RevisionConflict`] when `expected_revision` no longer
    /// matches the stored record.
    fn update_trust(
        &self,
        memory_id: MemoryId,
        fields: TrustFields,
        expected_revision: u32,
        event: &CorrectionEvent,
    ) -> Result<MemoryRecord, GateError>;

    /// Full audit log in append order.
    ///
    /// # Errors
    /// Returns [`GateError::Storage`] when the backend fails.
    fn list_corrections(&self) -> Result<Vec<CorrectionEvent>, GateError>;
}
