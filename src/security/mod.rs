//! Input security: threat scanning and schema validation.

pub mod scanner;
pub mod validate;

pub use scanner::{Severity, ThreatKind, ThreatMatch, max_severity, sanitize_value, scan_value};
pub use validate::{FieldKind, FieldRule, Schema, validate};
