//! Record-level types: raw payloads, statuses, and validation errors

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A raw record as produced by a source parser: an open field→value mapping
/// with heterogeneous JSON values.
pub type RawRecord = serde_json::Map<String, Value>;

/// Lifecycle status of a single record
///
/// A record is created as `Pending`, progresses to `Valid` or `Invalid`
/// after validation, and terminates as `Processed` or `Failed`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum RecordStatus {
    Pending,
    Valid,
    Invalid,
    Processed,
    Failed,
}

impl RecordStatus {
    /// Whether the record has reached a terminal state
    pub fn is_terminal(&self) -> bool {
        matches!(self, RecordStatus::Processed | RecordStatus::Failed)
    }
}

/// Machine-readable validation error codes
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    Required,
    TypeMismatch,
    PatternMismatch,
    CustomValidation,
    UnknownField,
    DuplicateValue,
    ExternalDuplicate,
}

/// Severity of a validation error
///
/// Warnings are non-blocking: a validation result carrying only warnings
/// still counts as valid.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ErrorSeverity {
    #[default]
    Error,
    Warning,
}

/// A single validation finding attached to a record
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ValidationError {
    /// Field the finding applies to
    pub field: String,
    /// Human-readable message
    pub message: String,
    /// Machine-readable code
    pub code: ErrorCode,
    /// Offending value, when one exists
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    /// Blocking or advisory
    #[serde(default)]
    pub severity: ErrorSeverity,
    /// Optional grouping category
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    /// Optional remediation hint
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
    /// Additional context
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Map<String, Value>>,
}

impl ValidationError {
    /// Create an error-severity finding
    pub fn new(field: impl Into<String>, message: impl Into<String>, code: ErrorCode) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
            code,
            value: None,
            severity: ErrorSeverity::Error,
            category: None,
            suggestion: None,
            metadata: None,
        }
    }

    /// Create a warning-severity finding
    pub fn warning(field: impl Into<String>, message: impl Into<String>, code: ErrorCode) -> Self {
        Self {
            severity: ErrorSeverity::Warning,
            ..Self::new(field, message, code)
        }
    }

    /// Attach the offending value
    pub fn with_value(mut self, value: Value) -> Self {
        self.value = Some(value);
        self
    }

    /// Whether this finding blocks the record
    pub fn is_blocking(&self) -> bool {
        self.severity == ErrorSeverity::Error
    }
}

/// A record flowing through the ingestion pipeline
///
/// `raw` is the parser output and is never mutated; `parsed` is the
/// post-alias, post-transform payload handed to the processor. Status
/// changes produce a new value rather than mutating in place.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ImportRecord {
    /// Zero-based position in the source
    pub index: u64,
    /// Original field→value mapping
    pub raw: RawRecord,
    /// Post-transform mapping, present once validation produced one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parsed: Option<RawRecord>,
    /// Current lifecycle status
    pub status: RecordStatus,
    /// Validation findings, in discovery order
    #[serde(default)]
    pub errors: Vec<ValidationError>,
    /// Message of the final processor failure, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processing_error: Option<String>,
    /// Number of processor retries performed
    #[serde(default)]
    pub retry_count: u32,
}

impl ImportRecord {
    /// Wrap a freshly parsed raw record
    pub fn pending(index: u64, raw: RawRecord) -> Self {
        Self {
            index,
            raw,
            parsed: None,
            status: RecordStatus::Pending,
            errors: Vec::new(),
            processing_error: None,
            retry_count: 0,
        }
    }

    /// Validation passed: carry the parsed payload forward
    pub fn into_valid(self, parsed: RawRecord, errors: Vec<ValidationError>) -> Self {
        Self {
            parsed: Some(parsed),
            status: RecordStatus::Valid,
            errors,
            ..self
        }
    }

    /// Validation failed
    pub fn into_invalid(self, errors: Vec<ValidationError>) -> Self {
        Self {
            status: RecordStatus::Invalid,
            errors,
            ..self
        }
    }

    /// Processor succeeded after `retry_count` retries
    pub fn into_processed(self, retry_count: u32) -> Self {
        Self {
            status: RecordStatus::Processed,
            retry_count,
            ..self
        }
    }

    /// Processor failed terminally
    pub fn into_failed(self, error: impl Into<String>, retry_count: u32) -> Self {
        Self {
            status: RecordStatus::Failed,
            processing_error: Some(error.into()),
            retry_count,
            ..self
        }
    }

    /// Whether every raw value is empty (null or blank string)
    ///
    /// Used by the `skip_empty_rows` schema option.
    pub fn is_empty_row(&self) -> bool {
        self.raw.values().all(|v| match v {
            Value::Null => true,
            Value::String(s) => s.trim().is_empty(),
            _ => false,
        })
    }

    /// Whether any blocking validation finding is present
    pub fn has_blocking_errors(&self) -> bool {
        self.errors.iter().any(ValidationError::is_blocking)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw(pairs: &[(&str, Value)]) -> RawRecord {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn status_progression_produces_new_values() {
        let record = ImportRecord::pending(0, raw(&[("name", json!("ada"))]));
        assert_eq!(record.status, RecordStatus::Pending);

        let valid = record.clone().into_valid(record.raw.clone(), vec![]);
        assert_eq!(valid.status, RecordStatus::Valid);
        assert_eq!(record.status, RecordStatus::Pending);

        let processed = valid.into_processed(2);
        assert_eq!(processed.status, RecordStatus::Processed);
        assert_eq!(processed.retry_count, 2);
    }

    #[test]
    fn warnings_do_not_block() {
        let record = ImportRecord::pending(0, raw(&[("name", json!("ada"))])).into_valid(
            raw(&[("name", json!("ada"))]),
            vec![ValidationError::warning(
                "name",
                "looks odd",
                ErrorCode::CustomValidation,
            )],
        );
        assert!(!record.has_blocking_errors());
    }

    #[test]
    fn empty_row_detection() {
        let blank = ImportRecord::pending(0, raw(&[("a", json!("")), ("b", json!(null))]));
        assert!(blank.is_empty_row());

        let non_blank = ImportRecord::pending(1, raw(&[("a", json!("")), ("b", json!(0))]));
        assert!(!non_blank.is_empty_row());
    }

    #[test]
    fn error_codes_serialize_in_wire_form() {
        let err = ValidationError::new("email", "duplicate", ErrorCode::DuplicateValue);
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["code"], "DUPLICATE_VALUE");
        assert_eq!(json["severity"], "error");
    }
}
