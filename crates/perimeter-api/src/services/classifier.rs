use std::net::IpAddr;
use std::sync::OnceLock;

use data_encoding::BASE32_NOPAD;
use ipnetwork::IpNetwork;
use perimeter_shared::{AlertKind, Finding, Severity};
use regex::Regex;
use sha2::{Digest, Sha256};

/// Decoded input larger than this skips pattern work entirely.
const MAX_SCAN_BYTES: usize = 256 * 1024;
/// Hard cap on the decoded size of any single field.
const MAX_DECODED_BYTES: usize = 1024 * 1024;
/// A field may not expand past this factor across decode passes.
const MAX_EXPANSION_FACTOR: usize = 64;
/// Nested encodings are peeled at most this many times.
const DECODE_PASSES: usize = 3;

/// Everything the classifier sees about one request.
#[derive(Debug, Clone, Default)]
pub struct ClassifyInput<'a> {
    pub method: &'a str,
    pub route: &'a str,
    pub query: &'a str,
    pub body: &'a [u8],
    pub user_agent: Option<&'a str>,
    pub referer: Option<&'a str>,
    pub remote_address: Option<&'a str>,
}

struct Rule {
    kind: AlertKind,
    strong: bool,
    re: Regex,
}

fn rules() -> &'static [Rule] {
    static RULES: OnceLock<Vec<Rule>> = OnceLock::new();
    RULES.get_or_init(|| {
        let rule = |kind, strong, pattern: &str| Rule {
            kind,
            strong,
            re: Regex::new(pattern).expect("invalid classifier pattern"),
        };
        vec![
            // Script injection
            rule(AlertKind::Xss, true, r"(?i)<\s*script"),
            rule(AlertKind::Xss, true, r"(?i)<\s*iframe"),
            rule(AlertKind::Xss, true, r"(?i)<[^>]*\bon\w+\s*="),
            rule(AlertKind::Xss, false, r"(?i)\bjavascript\s*:"),
            // SQL injection
            rule(AlertKind::SqlInjection, true, r"(?i)'\s*or\s+1\s*=\s*1"),
            rule(AlertKind::SqlInjection, true, r"(?i)\bunion\s+select\b"),
            rule(AlertKind::SqlInjection, true, r"(?i)\bdrop\s+table\b"),
            rule(AlertKind::SqlInjection, false, r"(?i)\binformation_schema\b"),
            rule(AlertKind::SqlInjection, false, r"(?i)\bsleep\s*\(\s*\d+\s*\)"),
            rule(
                AlertKind::SqlInjection,
                true,
                r"(?i);\s*(?:select|insert|update|delete|drop|alter)\b",
            ),
            // Command injection
            rule(
                AlertKind::CommandInjection,
                true,
                r"(?i)(?:;|\||&&)\s*(?:rm|cat|ls|sh|bash|powershell|curl|wget)\b",
            ),
            rule(AlertKind::CommandInjection, true, r"\$\([^)]{1,256}\)"),
            rule(AlertKind::CommandInjection, true, r"`[^`]{1,256}`"),
        ]
    })
}

/// User-Agent substrings of known scanning tools, matched case-insensitively.
const SCANNER_AGENTS: &[&str] = &[
    "sqlmap",
    "nikto",
    "nmap",
    "masscan",
    "dirb",
    "gobuster",
    "wfuzz",
    "burp",
    "acunetix",
    "nessus",
    "metasploit",
    "hydra",
    "openvas",
    "zgrab",
];

/// Score base per attack family. Part of the persisted risk formula.
pub fn score_base(kind: AlertKind) -> u8 {
    match kind {
        AlertKind::Xss => 60,
        AlertKind::SqlInjection => 80,
        AlertKind::CommandInjection => 90,
        AlertKind::BruteForce => 50,
        AlertKind::UnauthorizedAccess => 70,
        AlertKind::RateLimitExceeded => 40,
        AlertKind::ApiAbuse => 40,
        AlertKind::PenTestTool => 50,
        AlertKind::ForwarderOverflow => 10,
        AlertKind::Internal => 10,
    }
}

/// `round(score_base × severity_multiplier + payload_bonus)` clamped to [0, 100].
pub fn risk_score(finding: &Finding) -> i32 {
    let bonus = (finding.fragment.len() / 32).min(20) as f64;
    let raw = f64::from(finding.score_base) * finding.severity.multiplier() + bonus;
    (raw.round() as i32).clamp(0, 100)
}

/// Short stable hash of the normalized offending fragment: 16 bytes of
/// SHA-256 over `kind:fragment`, base32 without padding (26 chars).
pub fn signature(kind: AlertKind, fragment: &str) -> String {
    let normalized = normalize_fragment(fragment);
    let mut hasher = Sha256::new();
    hasher.update(kind.as_slug().as_bytes());
    hasher.update(b":");
    hasher.update(normalized.as_bytes());
    let digest = hasher.finalize();
    BASE32_NOPAD.encode(&digest[..16])
}

fn normalize_fragment(fragment: &str) -> String {
    let mut out = String::with_capacity(fragment.len());
    let mut last_space = true;
    for ch in fragment.trim().chars() {
        if ch.is_whitespace() {
            if !last_space {
                out.push(' ');
                last_space = true;
            }
        } else {
            for lower in ch.to_lowercase() {
                out.push(lower);
            }
            last_space = false;
        }
    }
    out
}

/// Build a finding for kinds emitted outside the pattern scan (brute force,
/// rate limiting, internal conditions).
pub fn finding_for(kind: AlertKind, severity: Severity, fragment: &str) -> Finding {
    let fragment = truncate_fragment(fragment);
    Finding {
        kind,
        severity,
        signature: signature(kind, &fragment),
        fragment,
        score_base: score_base(kind),
    }
}

fn truncate_fragment(fragment: &str) -> String {
    let mut s = fragment.to_string();
    if s.len() > 512 {
        let mut cut = 512;
        while !s.is_char_boundary(cut) {
            cut -= 1;
        }
        s.truncate(cut);
    }
    s
}

pub struct Classifier {
    whitelist: Vec<IpNetwork>,
    testing: bool,
}

impl Classifier {
    pub fn new(whitelist: Vec<IpNetwork>, testing: bool) -> Self {
        Self { whitelist, testing }
    }

    /// Loopback/test addresses and `TESTING` mode suppress every finding,
    /// before any scoring happens.
    pub fn is_suppressed(&self, remote_address: Option<&str>) -> bool {
        if self.testing {
            return true;
        }
        let Some(addr) = remote_address else {
            return false;
        };
        let Ok(ip) = addr.parse::<IpAddr>() else {
            return false;
        };
        self.whitelist.iter().any(|net| net.contains(ip))
    }

    /// Pattern-match one request against the attack families. Pure and
    /// infallible: malformed input degrades to an `ApiAbuse` finding.
    pub fn classify(&self, input: &ClassifyInput<'_>) -> Vec<Finding> {
        if self.is_suppressed(input.remote_address) {
            return Vec::new();
        }

        let mut findings: Vec<Finding> = Vec::new();
        let mut decode_overrun = false;
        let write_route = matches!(input.method, "POST" | "PUT" | "PATCH" | "DELETE");

        let body_text = match std::str::from_utf8(input.body) {
            Ok(text) => Some(text),
            Err(_) => {
                findings.push(finding_for(
                    AlertKind::ApiAbuse,
                    Severity::Low,
                    "undecodable request body",
                ));
                None
            }
        };

        let mut fields: Vec<String> = Vec::with_capacity(4);
        for raw in [
            Some(input.query),
            body_text,
            input.user_agent,
            input.referer,
        ]
        .into_iter()
        .flatten()
        {
            match decode_layers(raw) {
                Some(decoded) => fields.push(decoded),
                None => decode_overrun = true,
            }
        }

        if decode_overrun {
            findings.push(finding_for(
                AlertKind::ApiAbuse,
                Severity::High,
                "decode expansion budget exceeded",
            ));
        }

        let total: usize = fields.iter().map(String::len).sum();
        if total > MAX_SCAN_BYTES {
            findings.push(finding_for(
                AlertKind::ApiAbuse,
                Severity::High,
                "oversized request input",
            ));
            return ordered(findings);
        }

        // Raw hits per field, grouped by kind afterwards.
        struct Hit {
            field: usize,
            strong: bool,
            fragment: String,
        }
        let mut hits: Vec<(AlertKind, Hit)> = Vec::new();
        for (field_idx, field) in fields.iter().enumerate() {
            for rule in rules() {
                if let Some(m) = rule.re.find(field) {
                    hits.push((
                        rule.kind,
                        Hit {
                            field: field_idx,
                            strong: rule.strong,
                            fragment: truncate_fragment(m.as_str()),
                        },
                    ));
                }
            }
        }

        if let Some(agent) = input.user_agent {
            let lower = agent.to_ascii_lowercase();
            if let Some(tool) = SCANNER_AGENTS.iter().find(|t| lower.contains(**t)) {
                hits.push((
                    AlertKind::PenTestTool,
                    Hit {
                        field: usize::MAX,
                        strong: true,
                        fragment: format!("scanner user-agent: {tool}"),
                    },
                ));
            }
        }

        if matches!(input.method, "GET" | "HEAD") && !input.body.is_empty() {
            hits.push((
                AlertKind::ApiAbuse,
                Hit {
                    field: usize::MAX - 1,
                    strong: false,
                    fragment: format!("{} request with body on {}", input.method, input.route),
                },
            ));
        }

        let mut kinds: Vec<AlertKind> = Vec::new();
        for (kind, _) in &hits {
            if !kinds.contains(kind) {
                kinds.push(*kind);
            }
        }
        let multi_kind = kinds.len() >= 2;

        for kind in kinds {
            let kind_hits: Vec<&Hit> = hits.iter().filter(|(k, _)| *k == kind).map(|(_, h)| h).collect();
            let fragment = kind_hits[0].fragment.clone();
            let base = score_base(kind);

            let distinct_fields = {
                let mut seen: Vec<usize> = Vec::new();
                for h in &kind_hits {
                    if !seen.contains(&h.field) {
                        seen.push(h.field);
                    }
                }
                seen.len()
            };
            let any_strong = kind_hits.iter().any(|h| h.strong);
            let stacking = kind_hits
                .iter()
                .any(|h| h.fragment.contains(';') || h.fragment.contains("&&") || h.fragment.contains('|') || h.fragment.contains('`'));

            let mut severity = if distinct_fields > 1 || any_strong {
                Severity::Medium
            } else {
                Severity::Low
            };
            if base >= 70 || stacking {
                severity = Severity::High;
            }
            let injection = matches!(kind, AlertKind::SqlInjection | AlertKind::CommandInjection);
            if multi_kind || (injection && write_route) {
                severity = Severity::Critical;
            }

            findings.push(Finding {
                kind,
                severity,
                signature: signature(kind, &fragment),
                fragment,
                score_base: base,
            });
        }

        ordered(findings)
    }
}

fn ordered(mut findings: Vec<Finding>) -> Vec<Finding> {
    findings.sort_by(|a, b| {
        b.severity
            .rank()
            .cmp(&a.severity.rank())
            .then_with(|| b.score_base.cmp(&a.score_base))
    });
    findings
}

/// Peel URL- and HTML-entity encodings, up to three passes, within a fixed
/// expansion budget. `None` means the budget was blown.
fn decode_layers(raw: &str) -> Option<String> {
    let budget = (raw.len().saturating_mul(MAX_EXPANSION_FACTOR)).min(MAX_DECODED_BYTES);
    let mut current = raw.to_string();
    for _ in 0..DECODE_PASSES {
        let url_decoded = urlencoding::decode(&current)
            .map(|c| c.into_owned())
            .unwrap_or_else(|_| current.clone());
        let entity_decoded = decode_html_entities(&url_decoded);
        if entity_decoded.len() > budget.max(raw.len()) {
            return None;
        }
        if entity_decoded == current {
            break;
        }
        current = entity_decoded;
    }
    Some(current)
}

/// Minimal HTML entity decoder covering the set attackers use to mask
/// markup: named entities for angle brackets, quotes and ampersand, plus
/// decimal and hex numeric references.
fn decode_html_entities(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(pos) = rest.find('&') {
        out.push_str(&rest[..pos]);
        rest = &rest[pos..];
        let Some(end) = rest[..rest.len().min(12)].find(';') else {
            out.push('&');
            rest = &rest[1..];
            continue;
        };
        let entity = &rest[1..end];
        let decoded = match entity {
            "lt" => Some('<'),
            "gt" => Some('>'),
            "quot" => Some('"'),
            "apos" => Some('\''),
            "amp" => Some('&'),
            _ => entity
                .strip_prefix("#x")
                .or_else(|| entity.strip_prefix("#X"))
                .and_then(|hex| u32::from_str_radix(hex, 16).ok())
                .or_else(|| entity.strip_prefix('#').and_then(|dec| dec.parse().ok()))
                .and_then(char::from_u32),
        };
        match decoded {
            Some(ch) => {
                out.push(ch);
                rest = &rest[end + 1..];
            }
            None => {
                out.push('&');
                rest = &rest[1..];
            }
        }
    }
    out.push_str(rest);
    out
}
