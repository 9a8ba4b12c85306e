use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use memory_gate_core::{
    admit_candidates, plan_correction, supersession_chain, Candidate, CorrectionEvent,
    CorrectionId, CorrectionKind, CorrectionPlan, DropReason, GateError, MemoryId, MemoryRecord,
    MemoryStore, TrustState,
};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{debug, warn};

pub const API_CONTRACT_VERSION: &str = "gate.v1";

/// Similarity search over the external embedding model and vector index.
/// The gate treats it as a black box returning a similarity-ranked candidate
/// list; it knows nothing about trust and must never mutate it.
#[async_trait]
pub trait SimilaritySearchAdapter: Send + Sync {
    /// Rank up to `limit` candidates for `query_text`, best first.
    ///
    /// # Errors
    /// Returns [`GateError::Adapter`] on transport or model failure.
    async fn search(&self, query_text: &str, limit: usize) -> Result<Vec<Candidate>, GateError>;
}

#[derive(Debug, Clone)]
pub struct GateConfig {
    /// Multiplier applied to `k` before the adapter call, so filtering
    /// losses can still leave `k` survivors.
    pub overfetch_factor: usize,
    pub adapter_timeout: Duration,
    /// Backoff before the single adapter retry.
    pub retry_backoff: Duration,
    /// Attempts per correction when a concurrent writer bumps the revision.
    pub correction_retries: u32,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            overfetch_factor: 3,
            adapter_timeout: Duration::from_secs(10),
            retry_backoff: Duration::from_millis(250),
            correction_retries: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IngestRequest {
    pub memory_id: Option<MemoryId>,
    pub content: String,
    pub embedding_ref: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetrievedMemory {
    pub memory_id: MemoryId,
    pub content: String,
    pub similarity: f32,
    pub confidence: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueryResponse {
    pub results: Vec<RetrievedMemory>,
    pub requested_k: usize,
    /// May be smaller than `requested_k`: under-filling after admission
    /// control is a reportable outcome, not an error.
    pub returned_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CorrectionRequest {
    pub target_id: MemoryId,
    #[serde(flatten)]
    pub kind: CorrectionKind,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CorrectionReceipt {
    pub accepted: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub applied_at: OffsetDateTime,
    /// True when the correction had already taken effect and this call was
    /// acknowledged as a no-op.
    pub already_applied: bool,
}

/// Translates correction events into serialized trust updates and guards the
/// supersession invariants. The only write path for existing memories.
pub struct TrustLedger<S: MemoryStore> {
    store: Arc<S>,
    correction_retries: u32,
}

impl<S: MemoryStore> TrustLedger<S> {
    #[must_use]
    pub fn new(store: Arc<S>, correction_retries: u32) -> Self {
        Self { store, correction_retries }
    }

    /// Mark `old_id` as replaced by `new_id`, downgrading its trust so both
    /// are never simultaneously active for the same fact.
    ///
    /// # Errors
    /// Returns [`GateError::InvalidCorrection`] when either memory is
    /// missing, the replacement is not active, or the link would close a
    /// supersession cycle.
    pub fn supersede(
        &self,
        old_id: MemoryId,
        new_id: MemoryId,
        reason: &str,
    ) -> Result<CorrectionReceipt, GateError> {
        self.apply(old_id, CorrectionKind::Supersede { new_id }, reason)
    }

    /// Suppress a memory outright. Terminal except for an explicit restore.
    ///
    /// # Errors
    /// Returns [`GateError::NotFound`] when the memory is absent.
    pub fn suppress(&self, memory_id: MemoryId, reason: &str) -> Result<CorrectionReceipt, GateError> {
        self.apply(memory_id, CorrectionKind::Suppress, reason)
    }

    /// Downgrade a memory to low confidence without suppressing it.
    ///
    /// # Errors
    /// Returns [`GateError::NotFound`] when the memory is absent.
    pub fn flag_low_confidence(
        &self,
        memory_id: MemoryId,
        reason: &str,
    ) -> Result<CorrectionReceipt, GateError> {
        self.apply(memory_id, CorrectionKind::FlagLowConfidence, reason)
    }

    /// Reset a memory to active full trust and clear its supersession link.
    ///
    /// # Errors
    /// Returns [`GateError::NotFound`] when the memory is absent.
    pub fn restore(&self, memory_id: MemoryId, reason: &str) -> Result<CorrectionReceipt, GateError> {
        self.apply(memory_id, CorrectionKind::Restore, reason)
    }

    /// Apply one correction: validate, plan against current trust, then
    /// commit update and audit row atomically under a revision
    /// compare-and-set. Conflicting corrections on the same id are retried
    /// against the fresh revision; disjoint ids never contend.
    ///
    /// # Errors
    /// Returns the taxonomy errors described on the named methods, or
    /// [`GateError::RevisionConflict`] when retries are exhausted.
    pub fn apply(
        &self,
        target_id: MemoryId,
        kind: CorrectionKind,
        reason: &str,
    ) -> Result<CorrectionReceipt, GateError> {
        if reason.trim().is_empty() {
            return Err(GateError::Validation(
                "reason MUST be provided for every correction".to_string(),
            ));
        }

        let mut attempts = 0;
        loop {
            let target = self.load_target(target_id, &kind)?;

            let applied_at = OffsetDateTime::now_utc();
            // Plan before judging the replacement: re-acknowledging an
            // applied supersession stays a no-op success even after the
            // replacement itself has been downgraded since.
            let fields = match plan_correction(&target.trust_fields(), &kind, target_id)? {
                CorrectionPlan::AlreadyApplied => {
                    // Re-acknowledging an applied correction must not grow
                    // the audit log.
                    return Ok(CorrectionReceipt {
                        accepted: true,
                        applied_at,
                        already_applied: true,
                    });
                }
                CorrectionPlan::Apply(fields) => fields,
            };

            if let CorrectionKind::Supersede { new_id } = &kind {
                self.check_supersession(target_id, *new_id)?;
            }

            let event = CorrectionEvent {
                correction_id: CorrectionId::new(),
                target_id,
                kind: kind.clone(),
                applied_at,
                reason: reason.to_string(),
            };

            match self.store.update_trust(target_id, fields, target.revision, &event) {
                Ok(_) => {
                    return Ok(CorrectionReceipt {
                        accepted: true,
                        applied_at,
                        already_applied: false,
                    });
                }
                Err(GateError::RevisionConflict(id)) if attempts < self.correction_retries => {
                    attempts += 1;
                    warn!(memory_id = %id, attempt = attempts, "correction lost a revision race, retrying");
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn load_target(
        &self,
        target_id: MemoryId,
        kind: &CorrectionKind,
    ) -> Result<MemoryRecord, GateError> {
        match self.store.get(target_id) {
            Ok(record) => Ok(record),
            // A supersession naming a missing memory is a malformed
            // correction, not a lookup miss.
            Err(GateError::NotFound(id)) if matches!(kind, CorrectionKind::Supersede { .. }) => {
                Err(GateError::InvalidCorrection(format!("superseded memory not found: {id}")))
            }
            Err(err) => Err(err),
        }
    }

    fn check_supersession(&self, old_id: MemoryId, new_id: MemoryId) -> Result<(), GateError> {
        if new_id == old_id {
            return Err(GateError::InvalidCorrection(
                "a memory cannot supersede itself".to_string(),
            ));
        }

        let replacement = match self.store.get(new_id) {
            Ok(record) => record,
            Err(GateError::NotFound(id)) => {
                return Err(GateError::InvalidCorrection(format!(
                    "replacement memory not found: {id}"
                )));
            }
            Err(err) => return Err(err),
        };
        if replacement.trust_state != TrustState::Active {
            return Err(GateError::InvalidCorrection(format!(
                "replacement memory {new_id} is {}, not active",
                replacement.trust_state.as_str()
            )));
        }

        // superseded_by must stay a forest: the replacement's chain may not
        // lead back to the memory being superseded. A lookup failure mid-walk
        // aborts the correction rather than passing the check.
        let chain = supersession_chain(new_id, |id| match self.store.get(id) {
            Ok(record) => Ok(record.superseded_by),
            Err(GateError::NotFound(_)) => Ok(None),
            Err(err) => Err(err),
        })?;
        if chain.contains(&old_id) {
            return Err(GateError::InvalidCorrection(format!(
                "superseding {old_id} with {new_id} would close a supersession cycle"
            )));
        }

        Ok(())
    }
}

/// The retrieval gate: similarity search, trust admission control, top-K
/// truncation. The single public entry point for read queries, plus the
/// ingest and correction write surface.
pub struct MemoryGate<S: MemoryStore, A: SimilaritySearchAdapter> {
    store: Arc<S>,
    adapter: A,
    ledger: TrustLedger<S>,
    config: GateConfig,
}

impl<S: MemoryStore, A: SimilaritySearchAdapter> MemoryGate<S, A> {
    #[must_use]
    pub fn new(store: Arc<S>, adapter: A, config: GateConfig) -> Self {
        let ledger = TrustLedger::new(Arc::clone(&store), config.correction_retries);
        Self { store, adapter, ledger, config }
    }

    #[must_use]
    pub fn ledger(&self) -> &TrustLedger<S> {
        &self.ledger
    }

    /// Ingest a new memory with active, full trust.
    ///
    /// # Errors
    /// Returns [`GateError::DuplicateId`] on id collision or
    /// [`GateError::Validation`] for invalid content.
    pub fn ingest(&self, request: IngestRequest) -> Result<MemoryRecord, GateError> {
        let record = MemoryRecord::new_active(
            request.memory_id.unwrap_or_default(),
            request.content,
            request.embedding_ref,
            OffsetDateTime::now_utc(),
        );
        self.store.put(&record)?;
        Ok(record)
    }

    /// Apply one correction through the trust ledger.
    ///
    /// # Errors
    /// See [`TrustLedger::apply`].
    pub fn correct(&self, request: &CorrectionRequest) -> Result<CorrectionReceipt, GateError> {
        self.ledger.apply(request.target_id, request.kind.clone(), &request.reason)
    }

    /// Run a trust-filtered retrieval query.
    ///
    /// Over-fetches from the similarity adapter, admits only active
    /// memories, and truncates to `k` preserving the adapter's order.
    /// Queries never write; cancelling at any await point leaves no partial
    /// state behind.
    ///
    /// # Errors
    /// Returns [`GateError::Validation`] for empty query text,
    /// [`GateError::Adapter`] or [`GateError::RetrievalTimeout`] when the
    /// adapter fails twice, and [`GateError::Storage`] when the trust lookup
    /// fails. Filtering losses are not errors.
    pub async fn query(&self, query_text: &str, k: usize) -> Result<QueryResponse, GateError> {
        if query_text.trim().is_empty() {
            return Err(GateError::Validation("query text MUST be non-empty".to_string()));
        }
        if k == 0 {
            return Ok(QueryResponse { results: Vec::new(), requested_k: 0, returned_count: 0 });
        }

        let limit = k.saturating_mul(self.config.overfetch_factor).max(k);
        let candidates = self.search_with_retry(query_text, limit).await?;

        // Trust lookup happens only after the adapter returns, so adapter
        // latency never holds the store hostage.
        let candidate_ids: Vec<MemoryId> =
            candidates.iter().map(|candidate| candidate.memory_id).collect();
        let records = self.store.batch_get(&candidate_ids)?;

        let outcome = admit_candidates(&candidates, &records);
        for dropped in &outcome.dropped {
            match dropped.reason {
                DropReason::StaleIndexEntry => warn!(
                    memory_id = %dropped.memory_id,
                    similarity = dropped.similarity,
                    "similarity index returned an id with no stored record; dropping"
                ),
                reason => debug!(
                    memory_id = %dropped.memory_id,
                    similarity = dropped.similarity,
                    reason = reason.as_str(),
                    "candidate failed trust admission"
                ),
            }
        }

        let results: Vec<RetrievedMemory> = outcome
            .admitted
            .into_iter()
            .take(k)
            .filter_map(|candidate| {
                records.get(&candidate.memory_id).map(|record| RetrievedMemory {
                    memory_id: candidate.memory_id,
                    content: record.content.clone(),
                    similarity: candidate.similarity,
                    confidence: record.confidence,
                })
            })
            .collect();

        let returned_count = results.len();
        Ok(QueryResponse { results, requested_k: k, returned_count })
    }

    async fn search_with_retry(
        &self,
        query_text: &str,
        limit: usize,
    ) -> Result<Vec<Candidate>, GateError> {
        match self.search_once(query_text, limit).await {
            Ok(candidates) => Ok(candidates),
            Err(err @ (GateError::Adapter(_) | GateError::RetrievalTimeout(_))) => {
                warn!(error = %err, "similarity search failed, retrying once");
                tokio::time::sleep(self.config.retry_backoff).await;
                // Second failure surfaces as the query's failure; unfiltered
                // or partial results are never a fallback.
                self.search_once(query_text, limit).await
            }
            Err(err) => Err(err),
        }
    }

    async fn search_once(
        &self,
        query_text: &str,
        limit: usize,
    ) -> Result<Vec<Candidate>, GateError> {
        match tokio::time::timeout(
            self.config.adapter_timeout,
            self.adapter.search(query_text, limit),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(GateError::RetrievalTimeout(self.config.adapter_timeout)),
        }
    }
}
