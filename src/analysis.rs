//! Analysis Orchestrator
//!
//! Dispatches newly committed threat records to the LLM backend for
//! summarization and severity scoring, under a timeout with bounded retries.
//! When the backend is unreachable or too slow, a deterministic heuristic
//! derived from the record's IoC mix supplies the severity instead, clearly
//! marked as a fallback so it can be re-analyzed later.

use crate::alerts::AlertSink;
use crate::config::PipelineConfig;
use crate::store::{StoreError, ThreatStore};
use crate::{AlertEvent, AnalysisRecord, AnalysisStatus, IocType, Severity, ThreatRecord};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const FALLBACK_MODEL_ID: &str = "fallback-heuristic";
const FALLBACK_CONFIDENCE: f64 = 0.3;
const DEFAULT_RESPONSE_CONFIDENCE: f64 = 0.7;
/// IoC volume at which the fallback heuristic escalates to High.
const FALLBACK_IOC_VOLUME: usize = 8;

#[derive(Error, Debug)]
pub enum AnalysisError {
    #[error("analysis backend timed out")]
    Timeout,
    #[error("analysis backend error: {0}")]
    Backend(String),
    #[error("analysis backend http status {0}")]
    Http(u16),
    #[error("unparseable analysis response: {0}")]
    Parse(String),
}

impl AnalysisError {
    pub fn is_transient(&self) -> bool {
        match self {
            AnalysisError::Timeout | AnalysisError::Backend(_) => true,
            AnalysisError::Http(code) => *code >= 500,
            AnalysisError::Parse(_) => false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SummaryRequest {
    pub title: String,
    pub body: String,
    pub max_tokens: u32,
}

#[derive(Debug, Clone)]
pub struct SummaryResponse {
    pub summary: String,
    pub category: String,
    pub severity: Severity,
    pub confidence: f64,
}

/// Tagged analysis outcome; consumed by exhaustive matching so a degraded
/// result can never masquerade as an AI-derived one.
#[derive(Debug, Clone)]
pub enum AnalysisOutcome {
    Success(SummaryResponse),
    Fallback { severity: Severity },
}

/// The summarization collaborator boundary.
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, request: &SummaryRequest) -> Result<SummaryResponse, AnalysisError>;
    fn model_id(&self) -> &str;
}

// =============================================================================
// Ollama-backed summarizer
// =============================================================================

#[derive(Serialize)]
struct OllamaRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    options: OllamaOptions,
}

#[derive(Serialize)]
struct OllamaOptions {
    temperature: f64,
    top_p: f64,
    max_tokens: u32,
}

#[derive(Deserialize)]
struct OllamaResponse {
    #[serde(default)]
    response: String,
}

#[derive(Deserialize)]
struct ModelVerdict {
    #[serde(default)]
    summary: String,
    #[serde(default)]
    threat_type: String,
    #[serde(default)]
    severity: String,
    #[serde(default)]
    confidence_score: Option<f64>,
}

pub struct OllamaSummarizer {
    client: reqwest::Client,
    base_url: String,
    model: String,
}

impl OllamaSummarizer {
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(config.analysis_timeout_secs))
                .build()
                .expect("failed to build HTTP client"),
            base_url: config.ollama_url.trim_end_matches('/').to_string(),
            model: config.ollama_model.clone(),
        }
    }

    /// Liveness probe against the model registry endpoint.
    pub async fn is_available(&self) -> bool {
        let url = format!("{}/api/tags", self.base_url);
        match self.client.get(&url).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                warn!(error = %e, "ollama service not available");
                false
            }
        }
    }

    fn build_prompt(request: &SummaryRequest) -> String {
        format!(
            "Analyze this cybersecurity threat in 2-3 sentences:\n\n\
             Title: {}\n\
             Content: {}\n\n\
             Respond ONLY with JSON:\n\
             {{\n\
                 \"summary\": \"Brief 2-3 sentence summary\",\n\
                 \"threat_type\": \"malware\",\n\
                 \"severity\": \"high\",\n\
                 \"confidence_score\": 0.8\n\
             }}",
            request.title, request.body
        )
    }
}

#[async_trait]
impl Summarizer for OllamaSummarizer {
    async fn summarize(&self, request: &SummaryRequest) -> Result<SummaryResponse, AnalysisError> {
        let prompt = Self::build_prompt(request);
        let payload = OllamaRequest {
            model: &self.model,
            prompt: &prompt,
            stream: false,
            options: OllamaOptions {
                temperature: 0.3,
                top_p: 0.9,
                max_tokens: request.max_tokens,
            },
        };

        let url = format!("{}/api/generate", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    AnalysisError::Timeout
                } else {
                    AnalysisError::Backend(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(AnalysisError::Http(status.as_u16()));
        }

        let body: OllamaResponse = response
            .json()
            .await
            .map_err(|e| AnalysisError::Backend(e.to_string()))?;

        parse_model_text(&body.response)
    }

    fn model_id(&self) -> &str {
        &self.model
    }
}

/// Scrape the JSON object out of free-form model text; small models wrap
/// their answer in prose more often than not.
fn parse_model_text(text: &str) -> Result<SummaryResponse, AnalysisError> {
    let start = text
        .find('{')
        .ok_or_else(|| AnalysisError::Parse("no JSON object in response".to_string()))?;
    let end = text
        .rfind('}')
        .ok_or_else(|| AnalysisError::Parse("unterminated JSON object".to_string()))?;
    if end < start {
        return Err(AnalysisError::Parse("unterminated JSON object".to_string()));
    }

    let verdict: ModelVerdict = serde_json::from_str(&text[start..=end])
        .map_err(|e| AnalysisError::Parse(e.to_string()))?;

    Ok(SummaryResponse {
        summary: verdict.summary,
        category: if verdict.threat_type.is_empty() {
            "unknown".to_string()
        } else {
            verdict.threat_type
        },
        severity: Severity::from_label(&verdict.severity).unwrap_or(Severity::Medium),
        confidence: verdict
            .confidence_score
            .unwrap_or(DEFAULT_RESPONSE_CONFIDENCE)
            .clamp(0.0, 1.0),
    })
}

// =============================================================================
// Orchestrator
// =============================================================================

#[derive(Debug, Default)]
pub struct AnalysisStats {
    pub analyzed: AtomicU64,
    pub fallbacks: AtomicU64,
    pub alerts: AtomicU64,
    pub skipped_terminal: AtomicU64,
}

pub struct AnalysisOrchestrator {
    summarizer: Arc<dyn Summarizer>,
    store: Arc<dyn ThreatStore>,
    alerts: Arc<dyn AlertSink>,
    timeout: Duration,
    max_retries: u32,
    max_input_chars: usize,
    max_tokens: u32,
    alert_min_severity: Severity,
    stats: AnalysisStats,
}

impl AnalysisOrchestrator {
    pub fn new(
        config: &PipelineConfig,
        summarizer: Arc<dyn Summarizer>,
        store: Arc<dyn ThreatStore>,
        alerts: Arc<dyn AlertSink>,
    ) -> Self {
        Self {
            summarizer,
            store,
            alerts,
            timeout: Duration::from_secs(config.analysis_timeout_secs),
            max_retries: config.max_analysis_retries,
            max_input_chars: config.max_input_chars,
            max_tokens: config.max_tokens,
            alert_min_severity: config.alert_min_severity,
            stats: AnalysisStats::default(),
        }
    }

    /// Analyze one record: summarize through the backend or fall back to the
    /// heuristic, persist the attempt, update the record, and raise an alert
    /// on an upward transition into an alerting tier.
    ///
    /// Idempotent: a record that already has a successful analysis is
    /// returned unchanged, never re-submitted.
    pub async fn analyze(&self, record: &ThreatRecord) -> Result<AnalysisRecord, StoreError> {
        if let Some(previous) = self.store.latest_success(record.id).await? {
            debug!(threat_id = %record.id, "already analyzed, skipping");
            self.stats.skipped_terminal.fetch_add(1, Ordering::Relaxed);
            return Ok(previous);
        }

        let request = SummaryRequest {
            title: record.title.clone(),
            body: truncate_chars(&record.body, self.max_input_chars),
            max_tokens: self.max_tokens,
        };

        let started = Instant::now();
        let outcome = self.call_with_retry(&request, record).await;
        let latency_ms = started.elapsed().as_millis() as u64;

        let (analysis, status) = match outcome {
            AnalysisOutcome::Success(response) => {
                self.stats.analyzed.fetch_add(1, Ordering::Relaxed);
                info!(
                    threat_id = %record.id,
                    severity = response.severity.as_str(),
                    latency_ms,
                    "analysis complete"
                );
                (
                    AnalysisRecord {
                        id: Uuid::new_v4(),
                        threat_id: record.id,
                        summary: response.summary,
                        category: response.category,
                        severity: response.severity,
                        confidence: response.confidence,
                        model: self.summarizer.model_id().to_string(),
                        latency_ms,
                        success: true,
                        created_at: chrono::Utc::now(),
                    },
                    AnalysisStatus::Analyzed,
                )
            }
            AnalysisOutcome::Fallback { severity } => {
                self.stats.fallbacks.fetch_add(1, Ordering::Relaxed);
                warn!(
                    threat_id = %record.id,
                    severity = severity.as_str(),
                    "analysis backend unavailable, heuristic fallback"
                );
                (
                    AnalysisRecord {
                        id: Uuid::new_v4(),
                        threat_id: record.id,
                        summary: format!(
                            "Heuristic classification (backend unavailable): {}",
                            record.title
                        ),
                        category: "unclassified".to_string(),
                        severity,
                        confidence: FALLBACK_CONFIDENCE,
                        model: FALLBACK_MODEL_ID.to_string(),
                        latency_ms,
                        success: false,
                        created_at: chrono::Utc::now(),
                    },
                    AnalysisStatus::Failed,
                )
            }
        };

        self.store.record_analysis(analysis.clone()).await?;
        self.store
            .set_analysis_state(
                record.id,
                status,
                analysis.severity,
                Some(analysis.summary.clone()),
                analysis.created_at,
            )
            .await?;

        self.maybe_alert(record, &analysis).await;

        Ok(analysis)
    }

    /// Records whose last attempt fell back and are awaiting another try.
    pub async fn failed_threats(&self) -> Result<Vec<ThreatRecord>, StoreError> {
        self.store.threats_by_status(AnalysisStatus::Failed).await
    }

    /// Re-run analysis over records whose last attempt fell back. Returns
    /// how many records were re-submitted. The scheduler meters its own
    /// pass through the analysis pool instead of calling this directly.
    pub async fn reanalyze_failed(&self) -> Result<usize, StoreError> {
        let failed = self.failed_threats().await?;
        let count = failed.len();
        for record in failed {
            self.analyze(&record).await?;
        }
        Ok(count)
    }

    async fn call_with_retry(
        &self,
        request: &SummaryRequest,
        record: &ThreatRecord,
    ) -> AnalysisOutcome {
        let mut attempt = 0u32;
        loop {
            let result = tokio::time::timeout(self.timeout, self.summarizer.summarize(request))
                .await
                .map_err(|_| AnalysisError::Timeout)
                .and_then(|inner| inner);

            match result {
                Ok(response) => return AnalysisOutcome::Success(response),
                Err(e) if e.is_transient() && attempt < self.max_retries => {
                    attempt += 1;
                    warn!(
                        threat_id = %record.id,
                        attempt,
                        error = %e,
                        "transient analysis failure, retrying"
                    );
                }
                Err(e) => {
                    debug!(threat_id = %record.id, error = %e, "analysis exhausted");
                    return AnalysisOutcome::Fallback {
                        severity: fallback_severity(record),
                    };
                }
            }
        }
    }

    async fn maybe_alert(&self, record: &ThreatRecord, analysis: &AnalysisRecord) {
        // One alert per upward transition into an alerting tier; a record
        // re-analyzed at the same severity stays quiet, and downgrades never
        // retract an earlier alert.
        if analysis.severity >= self.alert_min_severity && analysis.severity > record.severity {
            self.stats.alerts.fetch_add(1, Ordering::Relaxed);
            self.alerts
                .emit(AlertEvent {
                    threat_id: record.id,
                    severity: analysis.severity,
                    raised_at: chrono::Utc::now(),
                    reason: format!(
                        "{} severity threat from {}: {}",
                        analysis.severity.as_str(),
                        record.source,
                        record.title
                    ),
                })
                .await;
        }
    }

    pub fn fallbacks(&self) -> u64 {
        self.stats.fallbacks.load(Ordering::Relaxed)
    }

    pub fn analyzed(&self) -> u64 {
        self.stats.analyzed.load(Ordering::Relaxed)
    }

    pub fn alerts_emitted(&self) -> u64 {
        self.stats.alerts.load(Ordering::Relaxed)
    }
}

/// Deterministic severity when the backend is unreachable, derived from the
/// IoC type mix, IoC volume, and keyword classification of the text.
pub fn fallback_severity(record: &ThreatRecord) -> Severity {
    let text = format!("{} {}", record.title, record.body).to_lowercase();

    let mut severity = Severity::Medium;
    if text.contains("ransom") {
        severity = Severity::Critical;
    } else if ["malware", "virus", "trojan", "backdoor"]
        .iter()
        .any(|w| text.contains(w))
        || ["vulnerability", "cve-", "exploit"]
            .iter()
            .any(|w| text.contains(w))
        || ["breach", "leak", "exposed"].iter().any(|w| text.contains(w))
    {
        severity = Severity::High;
    }

    let has_cve = record.iocs.iter().any(|i| i.ioc_type == IocType::Cve);
    let has_hash = record.iocs.iter().any(|i| i.ioc_type.is_hash());
    // A CVE together with a payload hash is an active exploitation signal.
    if has_cve && has_hash {
        severity = severity.max(Severity::High);
    }
    if record.iocs.len() >= FALLBACK_IOC_VOLUME {
        severity = severity.max(Severity::High);
    }

    severity
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}
