//! Extraction Worker
//!
//! Runs the pattern engine over a fetched document and produces the draft
//! threat the ingestion coordinator commits. CPU-bound and synchronous; it
//! runs inline in whichever worker completed the fetch.

use crate::patterns::PatternEngine;
use crate::{Ioc, IocType, RawDocument};
use std::collections::HashMap;

/// A not-yet-committed threat: the source document plus its scored IoCs.
#[derive(Debug, Clone)]
pub struct DraftThreat {
    pub document: RawDocument,
    pub iocs: Vec<Ioc>,
}

pub struct ExtractionWorker {
    engine: PatternEngine,
}

impl ExtractionWorker {
    pub fn new() -> Self {
        Self {
            engine: PatternEngine::new(),
        }
    }

    /// Extract indicators from title + body. Candidates are collapsed per
    /// (type, value), keeping the highest-confidence instance, to match the
    /// per-record uniqueness the store enforces.
    pub fn extract(&self, document: RawDocument) -> DraftThreat {
        let text = format!("{}\n{}", document.title, document.body);
        let candidates = self.engine.extract(&text);

        let mut best: HashMap<(IocType, String), Ioc> = HashMap::new();
        for ioc in candidates {
            let key = (ioc.ioc_type, ioc.value.clone());
            match best.get(&key) {
                Some(existing) if existing.confidence >= ioc.confidence => {}
                _ => {
                    best.insert(key, ioc);
                }
            }
        }

        let mut iocs: Vec<Ioc> = best.into_values().collect();
        // Deterministic order for storage and display.
        iocs.sort_by(|a, b| a.start.cmp(&b.start).then(a.rule_id.cmp(&b.rule_id)));

        DraftThreat { document, iocs }
    }
}

impl Default for ExtractionWorker {
    fn default() -> Self {
        Self::new()
    }
}
