//! ThreatFlow - AI-Powered Threat Intelligence Aggregation Pipeline
//!
//! Continuously polls security news feeds, extracts scored indicators of
//! compromise, deduplicates and persists threat records, and dispatches each
//! new record to a local LLM for summarization and severity scoring. High
//! severity outcomes raise alerts.
//!
//! # Architecture
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                     THREAT INTELLIGENCE PIPELINE                  │
//! ├──────────────────────────────────────────────────────────────────┤
//! │ ┌──────────┐  ┌──────────┐  ┌──────────┐                         │
//! │ │ Krebs RSS│  │ SANS ISC │  │ Schneier │   ... Feed Sources      │
//! │ └────┬─────┘  └────┬─────┘  └────┬─────┘                         │
//! │      └─────────────┼─────────────┘                               │
//! │                    ▼                                             │
//! │         ┌─────────────────────┐   bounded fetch pool             │
//! │         │    Feed Fetcher     │   (retry + backoff)              │
//! │         └──────────┬──────────┘                                  │
//! │                    ▼                                             │
//! │         ┌─────────────────────┐                                  │
//! │         │  Extraction Worker  │   pattern engine, scored IoCs    │
//! │         └──────────┬──────────┘                                  │
//! │                    ▼                                             │
//! │         ┌─────────────────────┐                                  │
//! │         │ Ingestion           │   fingerprint dedup,             │
//! │         │ Coordinator         │   atomic check-and-insert        │
//! │         └──────────┬──────────┘                                  │
//! │                    ▼                                             │
//! │         ┌─────────────────────┐   bounded analysis pool          │
//! │         │ Analysis            │   LLM summary or fallback        │
//! │         │ Orchestrator        │   heuristic severity             │
//! │         └──────────┬──────────┘                                  │
//! │                    ▼                                             │
//! │              ┌──────────┐                                        │
//! │              │  Alerts  │   high / critical only                 │
//! │              └──────────┘                                        │
//! └──────────────────────────────────────────────────────────────────┘
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod alerts;
pub mod analysis;
pub mod config;
pub mod extractor;
pub mod feed;
pub mod fetcher;
pub mod ingest;
pub mod patterns;
pub mod scheduler;
pub mod store;

pub use alerts::{AlertSink, ChannelAlertSink, LogAlertSink};
pub use analysis::{AnalysisOrchestrator, OllamaSummarizer, Summarizer};
pub use config::{FeedSource, PipelineConfig};
pub use extractor::ExtractionWorker;
pub use fetcher::{FeedFetcher, FetchError, FetchFeed};
pub use ingest::{IngestOutcome, IngestionCoordinator};
pub use patterns::PatternEngine;
pub use scheduler::PipelineScheduler;
pub use store::{MemoryStore, StoreError, ThreatStore};

// =============================================================================
// Core Types
// =============================================================================

/// Unique identifier for a threat record
pub type ThreatId = Uuid;

/// Indicator of Compromise category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IocType {
    Ipv4,
    Ipv6,
    Domain,
    Url,
    HashMd5,
    HashSha1,
    HashSha256,
    Email,
    Cve,
    Wallet,
    YaraRule,
}

impl IocType {
    pub fn as_str(&self) -> &'static str {
        match self {
            IocType::Ipv4 => "ipv4",
            IocType::Ipv6 => "ipv6",
            IocType::Domain => "domain",
            IocType::Url => "url",
            IocType::HashMd5 => "md5",
            IocType::HashSha1 => "sha1",
            IocType::HashSha256 => "sha256",
            IocType::Email => "email",
            IocType::Cve => "cve",
            IocType::Wallet => "wallet",
            IocType::YaraRule => "yara",
        }
    }

    pub fn is_hash(&self) -> bool {
        matches!(
            self,
            IocType::HashMd5 | IocType::HashSha1 | IocType::HashSha256
        )
    }
}

/// Threat impact tier; gates alerting
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub enum Severity {
    #[default]
    Unknown = 0,
    Low = 1,
    Medium = 2,
    High = 3,
    Critical = 4,
}

impl Severity {
    /// Parse a severity label as emitted by the LLM backend.
    pub fn from_label(label: &str) -> Option<Severity> {
        match label.trim().to_ascii_lowercase().as_str() {
            "low" | "info" => Some(Severity::Low),
            "medium" | "moderate" => Some(Severity::Medium),
            "high" => Some(Severity::High),
            "critical" => Some(Severity::Critical),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Unknown => "unknown",
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

/// Analysis lifecycle of a threat record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum AnalysisStatus {
    #[default]
    Pending,
    Analyzed,
    Failed,
}

/// A scored indicator extracted from document text
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ioc {
    pub ioc_type: IocType,
    pub value: String,
    /// Confidence in [0, 1], per the extraction rule's scoring policy
    pub confidence: f64,
    /// Id of the extraction rule that produced this indicator
    pub rule_id: String,
    /// Byte offsets into the source text
    pub start: usize,
    pub end: usize,
}

/// A fetched document, one per feed item. Transient: handed from the fetcher
/// to the extraction worker and discarded after ingestion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawDocument {
    /// Name of the feed source this document came from
    pub source: String,
    pub title: String,
    pub link: Option<String>,
    /// Cleaned body text (HTML stripped, whitespace collapsed)
    pub body: String,
    pub published: Option<DateTime<Utc>>,
    pub fetched_at: DateTime<Utc>,
    /// SHA-256 over the normalized title + body, hex encoded
    pub fingerprint: String,
}

/// A persisted threat record. Created once by the ingestion coordinator;
/// status, severity and summary are mutated only by the analysis orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreatRecord {
    pub id: ThreatId,
    /// Unique across all time; the deduplication key
    pub fingerprint: String,
    pub source: String,
    pub title: String,
    pub link: Option<String>,
    pub body: String,
    pub iocs: Vec<Ioc>,
    pub severity: Severity,
    pub status: AnalysisStatus,
    pub summary: Option<String>,
    pub created_at: DateTime<Utc>,
    pub analyzed_at: Option<DateTime<Utc>>,
}

/// One analysis attempt for a threat record. Append-only; the latest
/// successful record is authoritative.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisRecord {
    pub id: Uuid,
    pub threat_id: ThreatId,
    pub summary: String,
    pub category: String,
    pub severity: Severity,
    pub confidence: f64,
    /// Model identifier, or "fallback-heuristic" for degraded results
    pub model: String,
    pub latency_ms: u64,
    /// False when the result came from the fallback heuristic
    pub success: bool,
    pub created_at: DateTime<Utc>,
}

/// Raised when a record transitions into the high or critical tier
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertEvent {
    pub threat_id: ThreatId,
    pub severity: Severity,
    pub raised_at: DateTime<Utc>,
    pub reason: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_ordering_gates_alert_tiers() {
        assert!(Severity::Critical > Severity::High);
        assert!(Severity::High > Severity::Medium);
        assert!(Severity::Medium > Severity::Low);
        assert!(Severity::Low > Severity::Unknown);
    }

    #[test]
    fn severity_labels_round_trip() {
        for sev in [Severity::Low, Severity::Medium, Severity::High, Severity::Critical] {
            assert_eq!(Severity::from_label(sev.as_str()), Some(sev));
        }
        assert_eq!(Severity::from_label("MODERATE"), Some(Severity::Medium));
        assert_eq!(Severity::from_label("apocalyptic"), None);
    }
}
