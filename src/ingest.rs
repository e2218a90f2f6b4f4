//! Ingestion Coordinator
//!
//! Owns the at-most-once insert guarantee. The fingerprint ledger is a fast
//! in-process pre-filter; the store's unique constraint on the fingerprint is
//! the authoritative synchronization point, so two racing cycles over the
//! same content always resolve to one Created and one Skipped.

use crate::extractor::DraftThreat;
use crate::store::{InsertOutcome, StoreError, ThreatStore};
use crate::{AnalysisStatus, Severity, ThreatId, ThreatRecord};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

/// Fingerprints committed over this process's lifetime, mapped to their
/// record ids. Mirrors the store's fingerprint index as a lock-free
/// pre-filter; never evicts, and losing an entry only costs a store
/// round-trip.
#[derive(Default)]
pub struct DedupLedger {
    seen: DashMap<String, ThreatId>,
}

impl DedupLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup(&self, fingerprint: &str) -> Option<ThreatId> {
        self.seen.get(fingerprint).map(|id| *id)
    }

    pub fn remember(&self, fingerprint: String, id: ThreatId) {
        self.seen.insert(fingerprint, id);
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

#[derive(Debug, Clone)]
pub enum IngestOutcome {
    Created(ThreatRecord),
    /// Content already ingested; carries the existing record's id.
    Skipped(ThreatId),
}

#[derive(Debug, Default)]
pub struct IngestStats {
    pub created: AtomicU64,
    pub skipped: AtomicU64,
}

pub struct IngestionCoordinator {
    store: Arc<dyn ThreatStore>,
    ledger: DedupLedger,
    stats: IngestStats,
}

impl IngestionCoordinator {
    pub fn new(store: Arc<dyn ThreatStore>) -> Self {
        Self {
            store,
            ledger: DedupLedger::new(),
            stats: IngestStats::default(),
        }
    }

    /// Commit a draft threat. Duplicate content is a normal outcome, not an
    /// error; the caller learns the winner's id either way.
    pub async fn ingest(&self, draft: DraftThreat) -> Result<IngestOutcome, StoreError> {
        let fingerprint = draft.document.fingerprint.clone();

        if let Some(existing) = self.ledger.lookup(&fingerprint) {
            debug!(%existing, "duplicate content, ledger hit");
            self.stats.skipped.fetch_add(1, Ordering::Relaxed);
            return Ok(IngestOutcome::Skipped(existing));
        }

        let document = draft.document;
        let record = ThreatRecord {
            id: Uuid::new_v4(),
            fingerprint: fingerprint.clone(),
            source: document.source,
            title: document.title,
            link: document.link,
            body: document.body,
            iocs: draft.iocs,
            severity: Severity::Unknown,
            status: AnalysisStatus::Pending,
            summary: None,
            created_at: chrono::Utc::now(),
            analyzed_at: None,
        };

        match self.store.insert_threat(record.clone()).await? {
            InsertOutcome::Inserted(id) => {
                self.ledger.remember(fingerprint, id);
                self.stats.created.fetch_add(1, Ordering::Relaxed);
                info!(
                    threat_id = %id,
                    source = %record.source,
                    iocs = record.iocs.len(),
                    title = %record.title,
                    "threat record created"
                );
                Ok(IngestOutcome::Created(record))
            }
            InsertOutcome::Duplicate(existing) => {
                self.ledger.remember(fingerprint, existing);
                self.stats.skipped.fetch_add(1, Ordering::Relaxed);
                debug!(%existing, "duplicate content, lost insert race");
                Ok(IngestOutcome::Skipped(existing))
            }
        }
    }

    pub fn created(&self) -> u64 {
        self.stats.created.load(Ordering::Relaxed)
    }

    pub fn skipped(&self) -> u64 {
        self.stats.skipped.load(Ordering::Relaxed)
    }
}
