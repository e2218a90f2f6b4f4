//! Threat Store
//!
//! Storage collaborator boundary. The pipeline needs a row store with an
//! atomically enforced unique constraint on the content fingerprint,
//! transactional insert of a record with its IoCs, and indexed lookups for
//! the dashboard queries. `MemoryStore` provides those semantics in-process;
//! a database-backed implementation plugs in behind the same trait.

use crate::{AnalysisRecord, AnalysisStatus, Severity, ThreatId, ThreatRecord};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("storage unavailable: {0}")]
    Unavailable(String),
    #[error("unknown threat record {0}")]
    NotFound(ThreatId),
}

/// Outcome of the atomic check-and-insert on the fingerprint key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted(ThreatId),
    /// The fingerprint already exists; carries the winning record's id.
    Duplicate(ThreatId),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreCounts {
    pub threats: usize,
    pub iocs: usize,
    pub analyses: usize,
    pub pending: usize,
}

#[async_trait]
pub trait ThreatStore: Send + Sync {
    /// Atomic check-and-insert keyed on `record.fingerprint`. The record and
    /// its IoCs commit together or not at all; a fingerprint collision
    /// returns `Duplicate` with the existing id and writes nothing.
    async fn insert_threat(&self, record: ThreatRecord) -> Result<InsertOutcome, StoreError>;

    async fn get_threat(&self, id: ThreatId) -> Result<Option<ThreatRecord>, StoreError>;

    /// Append one analysis attempt. Attempts are never overwritten.
    async fn record_analysis(&self, record: AnalysisRecord) -> Result<(), StoreError>;

    /// Latest successful analysis for a record, if any.
    async fn latest_success(&self, id: ThreatId) -> Result<Option<AnalysisRecord>, StoreError>;

    /// Update the post-creation mutable fields. The analysis orchestrator is
    /// the sole caller.
    async fn set_analysis_state(
        &self,
        id: ThreatId,
        status: AnalysisStatus,
        severity: Severity,
        summary: Option<String>,
        analyzed_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn threats_by_status(
        &self,
        status: AnalysisStatus,
    ) -> Result<Vec<ThreatRecord>, StoreError>;

    async fn threats_by_severity(
        &self,
        severity: Severity,
    ) -> Result<Vec<ThreatRecord>, StoreError>;

    async fn threats_in_range(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<ThreatRecord>, StoreError>;

    async fn counts(&self) -> Result<StoreCounts, StoreError>;
}

#[derive(Default)]
struct MemoryInner {
    threats: HashMap<ThreatId, ThreatRecord>,
    by_fingerprint: HashMap<String, ThreatId>,
    analyses: HashMap<ThreatId, Vec<AnalysisRecord>>,
}

/// In-memory store. A single write lock around both maps makes the
/// check-and-insert atomic and the record+IoC commit transactional.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ThreatStore for MemoryStore {
    async fn insert_threat(&self, record: ThreatRecord) -> Result<InsertOutcome, StoreError> {
        let mut inner = self.inner.write();
        if let Some(existing) = inner.by_fingerprint.get(&record.fingerprint) {
            return Ok(InsertOutcome::Duplicate(*existing));
        }
        let id = record.id;
        inner.by_fingerprint.insert(record.fingerprint.clone(), id);
        inner.threats.insert(id, record);
        Ok(InsertOutcome::Inserted(id))
    }

    async fn get_threat(&self, id: ThreatId) -> Result<Option<ThreatRecord>, StoreError> {
        Ok(self.inner.read().threats.get(&id).cloned())
    }

    async fn record_analysis(&self, record: AnalysisRecord) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        if !inner.threats.contains_key(&record.threat_id) {
            return Err(StoreError::NotFound(record.threat_id));
        }
        inner
            .analyses
            .entry(record.threat_id)
            .or_default()
            .push(record);
        Ok(())
    }

    async fn latest_success(&self, id: ThreatId) -> Result<Option<AnalysisRecord>, StoreError> {
        Ok(self
            .inner
            .read()
            .analyses
            .get(&id)
            .and_then(|attempts| attempts.iter().rev().find(|a| a.success).cloned()))
    }

    async fn set_analysis_state(
        &self,
        id: ThreatId,
        status: AnalysisStatus,
        severity: Severity,
        summary: Option<String>,
        analyzed_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        let record = inner.threats.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        record.status = status;
        record.severity = severity;
        if summary.is_some() {
            record.summary = summary;
        }
        record.analyzed_at = Some(analyzed_at);
        Ok(())
    }

    async fn threats_by_status(
        &self,
        status: AnalysisStatus,
    ) -> Result<Vec<ThreatRecord>, StoreError> {
        Ok(self
            .inner
            .read()
            .threats
            .values()
            .filter(|t| t.status == status)
            .cloned()
            .collect())
    }

    async fn threats_by_severity(
        &self,
        severity: Severity,
    ) -> Result<Vec<ThreatRecord>, StoreError> {
        Ok(self
            .inner
            .read()
            .threats
            .values()
            .filter(|t| t.severity == severity)
            .cloned()
            .collect())
    }

    async fn threats_in_range(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<ThreatRecord>, StoreError> {
        Ok(self
            .inner
            .read()
            .threats
            .values()
            .filter(|t| t.created_at >= from && t.created_at < to)
            .cloned()
            .collect())
    }

    async fn counts(&self) -> Result<StoreCounts, StoreError> {
        let inner = self.inner.read();
        Ok(StoreCounts {
            threats: inner.threats.len(),
            iocs: inner.threats.values().map(|t| t.iocs.len()).sum(),
            analyses: inner.analyses.values().map(|a| a.len()).sum(),
            pending: inner
                .threats
                .values()
                .filter(|t| t.status == AnalysisStatus::Pending)
                .count(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn record(fingerprint: &str) -> ThreatRecord {
        ThreatRecord {
            id: Uuid::new_v4(),
            fingerprint: fingerprint.to_string(),
            source: "test".to_string(),
            title: "A threat".to_string(),
            link: None,
            body: "body".to_string(),
            iocs: vec![],
            severity: Severity::Unknown,
            status: AnalysisStatus::Pending,
            summary: None,
            created_at: Utc::now(),
            analyzed_at: None,
        }
    }

    fn analysis(threat_id: ThreatId, success: bool, severity: Severity) -> AnalysisRecord {
        AnalysisRecord {
            id: Uuid::new_v4(),
            threat_id,
            summary: "summary".to_string(),
            category: "malware".to_string(),
            severity,
            confidence: 0.8,
            model: "test-model".to_string(),
            latency_ms: 10,
            success,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn duplicate_fingerprint_reports_winner() {
        let store = MemoryStore::new();
        let first = record("fp-1");
        let first_id = first.id;
        assert_eq!(
            store.insert_threat(first).await.unwrap(),
            InsertOutcome::Inserted(first_id)
        );
        assert_eq!(
            store.insert_threat(record("fp-1")).await.unwrap(),
            InsertOutcome::Duplicate(first_id)
        );
        assert_eq!(store.counts().await.unwrap().threats, 1);
    }

    #[tokio::test]
    async fn concurrent_inserts_resolve_to_one_winner() {
        let store = std::sync::Arc::new(MemoryStore::new());
        let a = record("fp-race");
        let b = record("fp-race");

        let (ra, rb) = tokio::join!(
            {
                let store = store.clone();
                async move { store.insert_threat(a).await.unwrap() }
            },
            {
                let store = store.clone();
                async move { store.insert_threat(b).await.unwrap() }
            }
        );

        let winners: Vec<ThreatId> = [ra, rb]
            .iter()
            .filter_map(|o| match o {
                InsertOutcome::Inserted(id) => Some(*id),
                InsertOutcome::Duplicate(_) => None,
            })
            .collect();
        let losers: Vec<ThreatId> = [ra, rb]
            .iter()
            .filter_map(|o| match o {
                InsertOutcome::Duplicate(id) => Some(*id),
                InsertOutcome::Inserted(_) => None,
            })
            .collect();

        assert_eq!(winners.len(), 1);
        assert_eq!(losers.len(), 1);
        assert_eq!(winners[0], losers[0]);
        assert_eq!(store.counts().await.unwrap().threats, 1);
    }

    #[tokio::test]
    async fn latest_success_skips_fallback_attempts() {
        let store = MemoryStore::new();
        let rec = record("fp-2");
        let id = rec.id;
        store.insert_threat(rec).await.unwrap();

        store
            .record_analysis(analysis(id, false, Severity::High))
            .await
            .unwrap();
        assert!(store.latest_success(id).await.unwrap().is_none());

        store
            .record_analysis(analysis(id, true, Severity::Medium))
            .await
            .unwrap();
        let latest = store.latest_success(id).await.unwrap().unwrap();
        assert!(latest.success);
        assert_eq!(latest.severity, Severity::Medium);
    }

    #[tokio::test]
    async fn analysis_state_update_mutates_record() {
        let store = MemoryStore::new();
        let rec = record("fp-3");
        let id = rec.id;
        store.insert_threat(rec).await.unwrap();

        store
            .set_analysis_state(
                id,
                AnalysisStatus::Analyzed,
                Severity::High,
                Some("summary".to_string()),
                Utc::now(),
            )
            .await
            .unwrap();

        let updated = store.get_threat(id).await.unwrap().unwrap();
        assert_eq!(updated.status, AnalysisStatus::Analyzed);
        assert_eq!(updated.severity, Severity::High);
        assert!(updated.analyzed_at.is_some());

        let by_status = store
            .threats_by_status(AnalysisStatus::Analyzed)
            .await
            .unwrap();
        assert_eq!(by_status.len(), 1);
        let by_severity = store.threats_by_severity(Severity::High).await.unwrap();
        assert_eq!(by_severity.len(), 1);
    }
}
