//! IoC Pattern Engine
//!
//! Stateless, deterministic indicator extraction. Every rule carries an id
//! and a base confidence; scoring adjustments are fixed constants so that a
//! given text always produces the same indicator set with the same scores.
//!
//! Scoring policy:
//! - base confidence per rule (see `rule_table`)
//! - +0.10 per threat-context keyword within 50 chars of the match, capped at +0.30
//! - +0.15 when the match was defanged (`8[.]8[.]8[.]8`, `hxxp://...`)
//! - -0.20 for well-known infrastructure substrings in network indicators
//! - clamped to [0.10, 1.00]

use crate::{Ioc, IocType};
use regex::Regex;
use std::collections::HashSet;
use std::net::{Ipv4Addr, Ipv6Addr};

const CONTEXT_WINDOW: usize = 50;
const KEYWORD_BONUS: f64 = 0.10;
const KEYWORD_BONUS_CAP: f64 = 0.30;
const DEFANG_BONUS: f64 = 0.15;
const INFRA_PENALTY: f64 = 0.20;
const MIN_CONFIDENCE: f64 = 0.10;
const MAX_CONFIDENCE: f64 = 1.00;

/// Keywords that raise confidence when they appear near a match
const THREAT_KEYWORDS: &[&str] = &[
    "malware",
    "malicious",
    "threat",
    "attack",
    "compromise",
    "exploit",
    "phishing",
    "scam",
    "fraud",
    "suspicious",
    "blacklist",
    "c2",
    "c&c",
    "payload",
    "botnet",
    "ransom",
];

/// Benign infrastructure names that lower confidence for network indicators
const INFRA_SUBSTRINGS: &[&str] = &["google", "microsoft", "amazon", "cloudflare"];

/// Domains that are never emitted
const FALSE_POSITIVE_DOMAINS: &[&str] = &["example.com", "test.com", "localhost", "www.w3.org"];

struct ExtractionRule {
    id: &'static str,
    ioc_type: IocType,
    pattern: Regex,
    base_confidence: f64,
    /// Defanged rules get the defang bonus and have their value refanged
    defanged: bool,
}

fn rule(
    id: &'static str,
    ioc_type: IocType,
    pattern: &str,
    base_confidence: f64,
    defanged: bool,
) -> ExtractionRule {
    ExtractionRule {
        id,
        ioc_type,
        pattern: Regex::new(pattern).expect("invalid extraction rule pattern"),
        base_confidence,
        defanged,
    }
}

fn rule_table() -> Vec<ExtractionRule> {
    vec![
        rule("ipv4", IocType::Ipv4, r"\b(?:\d{1,3}\.){3}\d{1,3}\b", 0.50, false),
        rule(
            "ipv4-defanged",
            IocType::Ipv4,
            r"\b\d{1,3}(?:\[\.\]\d{1,3}){3}\b",
            0.50,
            true,
        ),
        rule(
            "ipv6",
            IocType::Ipv6,
            r"\b(?:[0-9a-fA-F]{1,4}:){7}[0-9a-fA-F]{1,4}\b",
            0.50,
            false,
        ),
        rule(
            "domain",
            IocType::Domain,
            r"\b[a-zA-Z0-9](?:[a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?(?:\.[a-zA-Z0-9](?:[a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?)*\.[a-zA-Z]{2,}\b",
            0.40,
            false,
        ),
        rule(
            "domain-defanged",
            IocType::Domain,
            r"\b[a-zA-Z0-9][a-zA-Z0-9-]*(?:\[\.\][a-zA-Z0-9-]+)+\b",
            0.40,
            true,
        ),
        rule(
            "url",
            IocType::Url,
            r#"\bhttps?://[^\s<>"{}|\\^`\[\]]+"#,
            0.55,
            false,
        ),
        rule(
            "url-defanged",
            IocType::Url,
            r#"(?i)\bhxxps?://[^\s<>"{}|\\^`]+"#,
            0.55,
            true,
        ),
        rule("hash-md5", IocType::HashMd5, r"\b[a-fA-F0-9]{32}\b", 0.55, false),
        rule("hash-sha1", IocType::HashSha1, r"\b[a-fA-F0-9]{40}\b", 0.60, false),
        rule(
            "hash-sha256",
            IocType::HashSha256,
            r"\b[a-fA-F0-9]{64}\b",
            0.65,
            false,
        ),
        rule(
            "email",
            IocType::Email,
            r"\b[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}\b",
            0.45,
            false,
        ),
        rule("cve", IocType::Cve, r"\bCVE-\d{4}-\d{4,7}\b", 0.70, false),
        rule(
            "wallet-btc",
            IocType::Wallet,
            r"\b[13][a-km-zA-HJ-NP-Z1-9]{25,34}\b",
            0.35,
            false,
        ),
        rule(
            "wallet-bech32",
            IocType::Wallet,
            r"\bbc1[a-z0-9]{39,59}\b",
            0.40,
            false,
        ),
    ]
}

/// Stateless IoC extractor. Safe to share across workers; extraction is pure
/// and total over its input (garbage in, empty vec out -- never an error).
pub struct PatternEngine {
    rules: Vec<ExtractionRule>,
    yara: Regex,
}

impl PatternEngine {
    pub fn new() -> Self {
        Self {
            rules: rule_table(),
            // Matches the head of a YARA rule through its condition keyword;
            // the rule name is the reported indicator value.
            yara: Regex::new(
                r"(?s)\brule\s+([A-Za-z_][A-Za-z0-9_]*)[^{]{0,128}\{.{0,4096}?condition\s*:",
            )
            .expect("invalid yara fragment pattern"),
        }
    }

    /// Extract all indicator candidates from `text`, in rule-table order.
    ///
    /// Overlapping matches from different rules are all kept; a value can be
    /// reported both as a domain and as part of a defanged URL. Duplicates
    /// are suppressed per (rule, value) only.
    pub fn extract(&self, text: &str) -> Vec<Ioc> {
        let mut out = Vec::new();
        let mut seen: HashSet<(&'static str, String)> = HashSet::new();

        for rule in &self.rules {
            for m in rule.pattern.find_iter(text) {
                let value = if rule.defanged {
                    refang(m.as_str())
                } else {
                    m.as_str().to_string()
                };
                if !valid_indicator(rule.ioc_type, &value) {
                    continue;
                }
                if !seen.insert((rule.id, value.clone())) {
                    continue;
                }
                let context = context_window(text, m.start(), m.end());
                out.push(Ioc {
                    ioc_type: rule.ioc_type,
                    confidence: score(rule, &value, context),
                    value,
                    rule_id: rule.id.to_string(),
                    start: m.start(),
                    end: m.end(),
                });
            }
        }

        for caps in self.yara.captures_iter(text) {
            let whole = caps.get(0).expect("capture 0 always present");
            let name = caps.get(1).expect("yara pattern has one group");
            let value = name.as_str().to_string();
            if !seen.insert(("yara-rule", value.clone())) {
                continue;
            }
            let context = context_window(text, whole.start(), whole.end());
            out.push(Ioc {
                ioc_type: IocType::YaraRule,
                confidence: score_raw(0.60, false, IocType::YaraRule, &value, context),
                value,
                rule_id: "yara-rule".to_string(),
                start: whole.start(),
                end: whole.end(),
            });
        }

        out
    }
}

impl Default for PatternEngine {
    fn default() -> Self {
        Self::new()
    }
}

fn score(rule: &ExtractionRule, value: &str, context: &str) -> f64 {
    score_raw(rule.base_confidence, rule.defanged, rule.ioc_type, value, context)
}

fn score_raw(base: f64, defanged: bool, ioc_type: IocType, value: &str, context: &str) -> f64 {
    let mut confidence = base;

    let ctx = context.to_lowercase();
    let hits = THREAT_KEYWORDS.iter().filter(|k| ctx.contains(**k)).count();
    confidence += (hits as f64 * KEYWORD_BONUS).min(KEYWORD_BONUS_CAP);

    if defanged {
        confidence += DEFANG_BONUS;
    }

    if matches!(
        ioc_type,
        IocType::Ipv4 | IocType::Ipv6 | IocType::Domain | IocType::Url
    ) {
        let lower = value.to_lowercase();
        if INFRA_SUBSTRINGS.iter().any(|s| lower.contains(s)) {
            confidence -= INFRA_PENALTY;
        }
    }

    confidence.clamp(MIN_CONFIDENCE, MAX_CONFIDENCE)
}

/// Restore a defanged value: `[.]` separators and `hxxp` schemes.
fn refang(value: &str) -> String {
    let value = value.replace("[.]", ".");
    if value.len() >= 4 && value[..4].eq_ignore_ascii_case("hxxp") {
        format!("http{}", &value[4..])
    } else {
        value
    }
}

fn valid_indicator(ioc_type: IocType, value: &str) -> bool {
    match ioc_type {
        IocType::Ipv4 => match value.parse::<Ipv4Addr>() {
            Ok(ip) => {
                !(ip.is_private()
                    || ip.is_loopback()
                    || ip.is_link_local()
                    || ip.is_broadcast()
                    || ip.is_multicast()
                    || ip.is_unspecified())
            }
            Err(_) => false,
        },
        IocType::Ipv6 => match value.parse::<Ipv6Addr>() {
            Ok(ip) => !(ip.is_loopback() || ip.is_multicast() || ip.is_unspecified()),
            Err(_) => false,
        },
        IocType::Domain => {
            let lower = value.to_lowercase();
            if FALSE_POSITIVE_DOMAINS.contains(&lower.as_str()) {
                return false;
            }
            // Refanged defanged matches can turn out to be IPs; require an
            // alphabetic TLD of at least two characters.
            match lower.rsplit('.').next() {
                Some(tld) => tld.len() >= 2 && tld.chars().all(|c| c.is_ascii_alphabetic()),
                None => false,
            }
        }
        ioc_type if ioc_type.is_hash() => !placeholder_hash(value),
        _ => true,
    }
}

/// All-zero and all-f values show up constantly in documentation and are
/// never real hashes.
fn placeholder_hash(value: &str) -> bool {
    let lower = value.to_lowercase();
    lower.chars().all(|c| c == '0') || lower.chars().all(|c| c == 'f')
}

fn context_window(text: &str, start: usize, end: usize) -> &str {
    let mut lo = start.saturating_sub(CONTEXT_WINDOW);
    while lo > 0 && !text.is_char_boundary(lo) {
        lo -= 1;
    }
    let mut hi = (end + CONTEXT_WINDOW).min(text.len());
    while hi < text.len() && !text.is_char_boundary(hi) {
        hi += 1;
    }
    &text[lo..hi]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn values_of(iocs: &[Ioc], ioc_type: IocType) -> Vec<&str> {
        iocs.iter()
            .filter(|i| i.ioc_type == ioc_type)
            .map(|i| i.value.as_str())
            .collect()
    }

    #[test]
    fn extracts_c2_report_indicators() {
        let engine = PatternEngine::new();
        let text = "C2 server at 8[.]8[.]8[.]8 delivering payload hash \
                    d41d8cd98f00b204e9800998ecf8427e (CVE-2023-1234)";
        let iocs = engine.extract(text);

        assert_eq!(values_of(&iocs, IocType::Ipv4), vec!["8.8.8.8"]);
        assert_eq!(
            values_of(&iocs, IocType::HashMd5),
            vec!["d41d8cd98f00b204e9800998ecf8427e"]
        );
        assert_eq!(values_of(&iocs, IocType::Cve), vec!["CVE-2023-1234"]);

        // The refanged ip must not also surface as a domain.
        assert!(values_of(&iocs, IocType::Domain).is_empty());
    }

    #[test]
    fn extraction_is_deterministic() {
        let engine = PatternEngine::new();
        let text = "Botnet at evil-domain.net and 203.0.113.7, drop at \
                    hxxp://payload[.]example[.]net/x.bin, contact scam@bad.org";
        let first = engine.extract(text);
        let second = engine.extract(text);
        assert_eq!(first.len(), second.len());
        for (a, b) in first.iter().zip(second.iter()) {
            assert_eq!(a.value, b.value);
            assert_eq!(a.rule_id, b.rule_id);
            assert!((a.confidence - b.confidence).abs() < f64::EPSILON);
        }
    }

    #[test]
    fn defanged_scores_at_least_plain() {
        let engine = PatternEngine::new();
        let defanged = engine.extract("malware C2 at 8[.]8[.]8[.]8 observed");
        let plain = engine.extract("malware C2 at 9.9.9.9 observed");
        let d = defanged.iter().find(|i| i.value == "8.8.8.8").unwrap();
        let p = plain.iter().find(|i| i.value == "9.9.9.9").unwrap();
        assert!(d.confidence >= p.confidence);
    }

    #[test]
    fn context_keywords_raise_confidence() {
        let engine = PatternEngine::new();
        let hot = engine.extract("malicious exploit traffic from 203.0.113.9");
        let cold = engine.extract("a routine mention of 203.0.113.9 in a changelog");
        let h = hot.iter().find(|i| i.value == "203.0.113.9").unwrap();
        let c = cold.iter().find(|i| i.value == "203.0.113.9").unwrap();
        assert!(h.confidence > c.confidence);
    }

    #[test]
    fn placeholder_hashes_never_emitted() {
        let engine = PatternEngine::new();
        let text = format!("sample hashes: {} and {}", "0".repeat(64), "f".repeat(32));
        let iocs = engine.extract(&text);
        assert!(iocs.iter().all(|i| !i.ioc_type.is_hash()));
    }

    #[test]
    fn private_ips_and_known_domains_filtered() {
        let engine = PatternEngine::new();
        let iocs = engine.extract("beacon to 192.168.1.10 and example.com and 10.0.0.5");
        assert!(values_of(&iocs, IocType::Ipv4).is_empty());
        assert!(values_of(&iocs, IocType::Domain).is_empty());
    }

    #[test]
    fn overlapping_rules_both_reported() {
        let engine = PatternEngine::new();
        let iocs = engine.extract("payload at hxxp://evil[.]net/a and mirror evil.net");
        let urls = values_of(&iocs, IocType::Url);
        let domains = values_of(&iocs, IocType::Domain);
        assert_eq!(urls, vec!["http://evil.net/a"]);
        assert!(domains.contains(&"evil.net"));
    }

    #[test]
    fn known_infrastructure_scores_lower() {
        let engine = PatternEngine::new();
        let iocs = engine.extract("traffic to update.google.com and to update.evil-cdn.com");
        let benign = iocs.iter().find(|i| i.value.contains("google")).unwrap();
        let other = iocs.iter().find(|i| i.value.contains("evil-cdn")).unwrap();
        assert!(benign.confidence < other.confidence);
    }

    #[test]
    fn yara_fragment_reported_by_rule_name() {
        let engine = PatternEngine::new();
        let text = r#"shared detection: rule SuspiciousLoader {
            strings: $a = "loader"
            condition: $a
        }"#;
        let iocs = engine.extract(text);
        let yara = values_of(&iocs, IocType::YaraRule);
        assert_eq!(yara, vec!["SuspiciousLoader"]);
    }

    #[test]
    fn garbage_input_yields_empty() {
        let engine = PatternEngine::new();
        let garbage: String = (0u8..=255).map(|b| b as char).collect();
        // Must not panic, whatever it matches must be valid indicators.
        let _ = engine.extract(&garbage);
        assert!(engine.extract("").is_empty());
        assert!(engine.extract("\u{0}\u{1}\u{2}").is_empty());
    }

    #[test]
    fn cryptocurrency_wallets_detected() {
        let engine = PatternEngine::new();
        let iocs = engine.extract(
            "ransom payment to 1A1zP1eP5QGefi2DMPTfTL5SLmv7DivfNa or \
             bc1qar0srrr7xfkvy5l643lydnw9re59gtzzwf5mdq",
        );
        let wallets = values_of(&iocs, IocType::Wallet);
        assert_eq!(wallets.len(), 2);
    }
}
