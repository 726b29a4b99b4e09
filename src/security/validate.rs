//! Declarative input validation.
//!
//! Endpoints declare a [`Schema`] for their JSON body; validation enforces
//! strict types, length caps, array caps, and object-key caps, returning
//! path-qualified messages that surface as `VALIDATION_FAILED` details.

use std::collections::BTreeMap;

use regex::Regex;
use serde_json::Value;

/// Expected JSON type of a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// JSON string.
    String,
    /// JSON number.
    Number,
    /// JSON boolean.
    Boolean,
    /// JSON object.
    Object,
    /// JSON array.
    Array,
}

impl FieldKind {
    fn matches(self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Number => value.is_number(),
            Self::Boolean => value.is_boolean(),
            Self::Object => value.is_object(),
            Self::Array => value.is_array(),
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Number => "number",
            Self::Boolean => "boolean",
            Self::Object => "object",
            Self::Array => "array",
        }
    }
}

/// Validation rule for one field.
#[derive(Debug, Clone)]
pub struct FieldRule {
    /// Expected type.
    pub kind: FieldKind,
    /// Whether the field must be present.
    pub required: bool,
    /// Maximum string length in characters.
    pub max_length: Option<usize>,
    /// Maximum array length.
    pub max_items: Option<usize>,
    /// Maximum object key count.
    pub max_keys: Option<usize>,
    /// Regex the (string) value must match.
    pub pattern: Option<&'static str>,
}

impl FieldRule {
    /// Required field of the given type.
    #[must_use]
    pub fn required(kind: FieldKind) -> Self {
        Self {
            kind,
            required: true,
            max_length: None,
            max_items: None,
            max_keys: None,
            pattern: None,
        }
    }

    /// Optional field of the given type.
    #[must_use]
    pub fn optional(kind: FieldKind) -> Self {
        Self {
            required: false,
            ..Self::required(kind)
        }
    }

    /// Cap string length.
    #[must_use]
    pub fn max_length(mut self, n: usize) -> Self {
        self.max_length = Some(n);
        self
    }

    /// Cap array length.
    #[must_use]
    pub fn max_items(mut self, n: usize) -> Self {
        self.max_items = Some(n);
        self
    }

    /// Cap object key count.
    #[must_use]
    pub fn max_keys(mut self, n: usize) -> Self {
        self.max_keys = Some(n);
        self
    }

    /// Require the string value to match `pattern`.
    #[must_use]
    pub fn pattern(mut self, pattern: &'static str) -> Self {
        self.pattern = Some(pattern);
        self
    }
}

/// Schema for a JSON object body.
#[derive(Debug, Clone, Default)]
pub struct Schema {
    /// Field rules keyed by top-level field name.
    pub fields: BTreeMap<&'static str, FieldRule>,
    /// Whether fields outside the schema are tolerated.
    pub allow_unknown: bool,
}

impl Schema {
    /// Empty schema builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a field rule.
    #[must_use]
    pub fn field(mut self, name: &'static str, rule: FieldRule) -> Self {
        self.fields.insert(name, rule);
        self
    }

    /// Tolerate unknown fields.
    #[must_use]
    pub fn allow_unknown(mut self) -> Self {
        self.allow_unknown = true;
        self
    }
}

/// Validate `value` against `schema`; returns path-qualified messages,
/// empty when valid.
#[must_use]
pub fn validate(schema: &Schema, value: &Value) -> Vec<String> {
    let mut errors = Vec::new();

    let Some(map) = value.as_object() else {
        errors.push("body: expected object".to_string());
        return errors;
    };

    for (name, rule) in &schema.fields {
        match map.get(*name) {
            None | Some(Value::Null) => {
                if rule.required {
                    errors.push(format!("body.{name}: required field is missing"));
                }
            }
            Some(field) => check_field(name, rule, field, &mut errors),
        }
    }

    if !schema.allow_unknown {
        for key in map.keys() {
            if !schema.fields.contains_key(key.as_str()) {
                errors.push(format!("body.{key}: unknown field"));
            }
        }
    }

    errors
}

fn check_field(name: &str, rule: &FieldRule, value: &Value, errors: &mut Vec<String>) {
    if !rule.kind.matches(value) {
        errors.push(format!(
            "body.{name}: expected {}, got {}",
            rule.kind.name(),
            json_type_name(value)
        ));
        return;
    }

    if let (Some(max), Some(s)) = (rule.max_length, value.as_str()) {
        if s.chars().count() > max {
            errors.push(format!("body.{name}: exceeds maximum length {max}"));
        }
    }
    if let (Some(max), Some(arr)) = (rule.max_items, value.as_array()) {
        if arr.len() > max {
            errors.push(format!("body.{name}: exceeds maximum items {max}"));
        }
    }
    if let (Some(max), Some(obj)) = (rule.max_keys, value.as_object()) {
        if obj.len() > max {
            errors.push(format!("body.{name}: exceeds maximum keys {max}"));
        }
    }
    if let (Some(pattern), Some(s)) = (rule.pattern, value.as_str()) {
        match Regex::new(pattern) {
            Ok(re) if !re.is_match(s) => {
                errors.push(format!("body.{name}: does not match required pattern"));
            }
            Ok(_) => {}
            Err(_) => errors.push(format!("body.{name}: invalid validation pattern")),
        }
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema() -> Schema {
        Schema::new()
            .field("name", FieldRule::required(FieldKind::String).max_length(64))
            .field("count", FieldRule::optional(FieldKind::Number))
            .field(
                "tags",
                FieldRule::optional(FieldKind::Array).max_items(3),
            )
    }

    #[test]
    fn valid_body_passes() {
        let errors = validate(&schema(), &json!({"name": "ok", "count": 2, "tags": ["a"]}));
        assert!(errors.is_empty(), "unexpected errors: {errors:?}");
    }

    #[test]
    fn missing_required_field_fails() {
        let errors = validate(&schema(), &json!({"count": 2}));
        assert_eq!(errors, vec!["body.name: required field is missing"]);
    }

    #[test]
    fn wrong_type_is_reported_with_both_types() {
        let errors = validate(&schema(), &json!({"name": 42}));
        assert_eq!(errors, vec!["body.name: expected string, got number"]);
    }

    #[test]
    fn string_length_cap_enforced() {
        let errors = validate(&schema(), &json!({"name": "x".repeat(65)}));
        assert_eq!(errors, vec!["body.name: exceeds maximum length 64"]);
    }

    #[test]
    fn array_cap_enforced() {
        let errors = validate(&schema(), &json!({"name": "ok", "tags": ["a","b","c","d"]}));
        assert_eq!(errors, vec!["body.tags: exceeds maximum items 3"]);
    }

    #[test]
    fn object_key_cap_enforced() {
        let schema = Schema::new().field(
            "attrs",
            FieldRule::required(FieldKind::Object).max_keys(1),
        );
        let errors = validate(&schema, &json!({"attrs": {"a": 1, "b": 2}}));
        assert_eq!(errors, vec!["body.attrs: exceeds maximum keys 1"]);
    }

    #[test]
    fn unknown_fields_rejected_by_default() {
        let errors = validate(&schema(), &json!({"name": "ok", "extra": true}));
        assert_eq!(errors, vec!["body.extra: unknown field"]);
    }

    #[test]
    fn unknown_fields_tolerated_when_allowed() {
        let schema = schema().allow_unknown();
        let errors = validate(&schema, &json!({"name": "ok", "extra": true}));
        assert!(errors.is_empty());
    }

    #[test]
    fn pattern_mismatch_reported() {
        let schema = Schema::new().field(
            "id",
            FieldRule::required(FieldKind::String).pattern(r"^[a-z0-9-]+$"),
        );
        let errors = validate(&schema, &json!({"id": "Not Valid!"}));
        assert_eq!(errors, vec!["body.id: does not match required pattern"]);
    }

    #[test]
    fn non_object_body_fails() {
        let errors = validate(&schema(), &json!([1, 2, 3]));
        assert_eq!(errors, vec!["body: expected object"]);
    }

    #[test]
    fn null_counts_as_missing() {
        let errors = validate(&schema(), &json!({"name": null}));
        assert_eq!(errors, vec!["body.name: required field is missing"]);
    }
}
