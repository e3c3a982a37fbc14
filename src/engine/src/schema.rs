//! Schema definition and record validation
//!
//! The validator owns the per-record hot path up to the processor: alias
//! resolution, transforms, type/pattern/custom checks, and cross-record
//! uniqueness. Uniqueness state is shared by every batch of a job; the
//! check-and-insert step runs inside one critical section per record so
//! concurrent batches cannot both admit the same value.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use bulkflow_shared::{ErrorCode, RawRecord, ValidationError};
use parking_lot::Mutex;
use regex::Regex;
use serde_json::Value;

/// Built-in field types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    String,
    Number,
    Boolean,
    Date,
    Email,
    Array,
    /// No built-in type check; pair with a custom validator
    Custom,
}

/// Outcome of a custom validator
#[derive(Debug, Clone, PartialEq)]
pub enum CustomCheck {
    Pass,
    Fail(String),
    Warn(String),
}

/// Value-to-value transform applied before validation
pub type TransformFn = dyn Fn(Value) -> Value + Send + Sync;

/// User-supplied per-field check
pub type CustomValidatorFn = dyn Fn(&Value) -> CustomCheck + Send + Sync;

/// Definition of a single schema field
#[derive(Clone)]
pub struct FieldDef {
    pub name: String,
    pub field_type: FieldType,
    pub required: bool,
    pub pattern: Option<Regex>,
    pub custom_validator: Option<Arc<CustomValidatorFn>>,
    pub transform: Option<Arc<TransformFn>>,
    pub default_value: Option<Value>,
    /// Separator for string-encoded array values
    pub separator: String,
    pub item_transform: Option<Arc<TransformFn>>,
    /// Case-insensitive alternate input names
    pub aliases: Vec<String>,
}

impl FieldDef {
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            required: false,
            pattern: None,
            custom_validator: None,
            transform: None,
            default_value: None,
            separator: ",".to_string(),
            item_transform: None,
            aliases: Vec::new(),
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn with_pattern(mut self, pattern: Regex) -> Self {
        self.pattern = Some(pattern);
        self
    }

    pub fn with_transform(
        mut self,
        transform: impl Fn(Value) -> Value + Send + Sync + 'static,
    ) -> Self {
        self.transform = Some(Arc::new(transform));
        self
    }

    pub fn with_item_transform(
        mut self,
        transform: impl Fn(Value) -> Value + Send + Sync + 'static,
    ) -> Self {
        self.item_transform = Some(Arc::new(transform));
        self
    }

    pub fn with_custom_validator(
        mut self,
        validator: impl Fn(&Value) -> CustomCheck + Send + Sync + 'static,
    ) -> Self {
        self.custom_validator = Some(Arc::new(validator));
        self
    }

    pub fn with_default(mut self, value: Value) -> Self {
        self.default_value = Some(value);
        self
    }

    pub fn with_separator(mut self, separator: impl Into<String>) -> Self {
        self.separator = separator.into();
        self
    }

    pub fn with_aliases<I, S>(mut self, aliases: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.aliases = aliases.into_iter().map(Into::into).collect();
        self
    }
}

impl fmt::Debug for FieldDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FieldDef")
            .field("name", &self.name)
            .field("field_type", &self.field_type)
            .field("required", &self.required)
            .field("aliases", &self.aliases)
            .finish_non_exhaustive()
    }
}

/// Record schema: field definitions plus record-level options
#[derive(Debug, Clone, Default)]
pub struct ImportSchema {
    pub fields: Vec<FieldDef>,
    /// Reject input keys that are not part of the schema
    pub strict: bool,
    /// Silently drop records whose raw values are all empty
    pub skip_empty_rows: bool,
    /// Fields whose values must be unique across the whole job
    pub unique_fields: Vec<String>,
}

impl ImportSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_field(mut self, field: FieldDef) -> Self {
        self.fields.push(field);
        self
    }

    pub fn strict(mut self) -> Self {
        self.strict = true;
        self
    }

    pub fn skip_empty_rows(mut self) -> Self {
        self.skip_empty_rows = true;
        self
    }

    pub fn unique_on(mut self, field: impl Into<String>) -> Self {
        self.unique_fields.push(field.into());
        self
    }
}

/// Result of validating one record
#[derive(Debug, Clone)]
pub struct ValidationOutcome {
    /// True when no error-severity findings exist; warnings are allowed
    pub is_valid: bool,
    pub errors: Vec<ValidationError>,
    /// The payload the engine should process, post alias and transform
    pub parsed: RawRecord,
}

/// Stateful validator for one job
pub struct SchemaValidator {
    schema: ImportSchema,
    /// Lowercased canonical-or-alias → canonical name
    alias_map: HashMap<String, String>,
    /// Canonical field names for strict-mode lookups
    known_fields: HashSet<String>,
    /// Per-field normalized values already seen in this job
    seen_unique: Mutex<HashMap<String, HashSet<String>>>,
    email_pattern: Regex,
}

impl SchemaValidator {
    pub fn new(schema: ImportSchema) -> Self {
        let mut alias_map = HashMap::new();
        let mut known_fields = HashSet::new();
        for field in &schema.fields {
            alias_map.insert(field.name.to_lowercase(), field.name.clone());
            known_fields.insert(field.name.clone());
            for alias in &field.aliases {
                alias_map.insert(alias.to_lowercase(), field.name.clone());
            }
        }
        Self {
            schema,
            alias_map,
            known_fields,
            // The pattern is fixed and known-good; compilation cannot fail.
            email_pattern: Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$").unwrap(),
            seen_unique: Mutex::new(HashMap::new()),
        }
    }

    pub fn schema(&self) -> &ImportSchema {
        &self.schema
    }

    /// Remap input keys onto canonical field names, case-insensitively
    ///
    /// Keys without a canonical mapping pass through verbatim; a mapped key
    /// never overwrites a canonical key that is already present.
    pub fn resolve_aliases(&self, raw: &RawRecord) -> RawRecord {
        let mut resolved = RawRecord::new();
        for (key, value) in raw {
            match self.alias_map.get(&key.to_lowercase()) {
                Some(canonical) => {
                    if !resolved.contains_key(canonical) {
                        resolved.insert(canonical.clone(), value.clone());
                    }
                }
                None => {
                    resolved.insert(key.clone(), value.clone());
                }
            }
        }
        resolved
    }

    /// Apply per-field transforms: array splitting, the field transform,
    /// and default substitution, in that order
    pub fn apply_transforms(&self, mut record: RawRecord) -> RawRecord {
        for field in &self.schema.fields {
            let current = record.get(&field.name).cloned();

            let mut value = current;
            if field.field_type == FieldType::Array {
                if let Some(Value::String(s)) = &value {
                    let items: Vec<Value> = s
                        .split(field.separator.as_str())
                        .map(str::trim)
                        .filter(|item| !item.is_empty())
                        .map(|item| {
                            let item = Value::String(item.to_string());
                            match &field.item_transform {
                                Some(transform) => transform(item),
                                None => item,
                            }
                        })
                        .collect();
                    value = Some(Value::Array(items));
                }
            }

            if let Some(transform) = &field.transform {
                if !is_absent(value.as_ref()) {
                    value = value.map(|v| transform(v));
                }
            }

            if is_absent(value.as_ref()) {
                if let Some(default) = &field.default_value {
                    value = Some(default.clone());
                }
            }

            if let Some(v) = value {
                record.insert(field.name.clone(), v);
            }
        }
        record
    }

    /// Convenience: alias resolution followed by transforms
    pub fn prepare(&self, raw: &RawRecord) -> RawRecord {
        self.apply_transforms(self.resolve_aliases(raw))
    }

    /// Run schema checks against a prepared record
    ///
    /// Uniqueness is not checked here; see [`SchemaValidator::check_unique`].
    pub fn validate(&self, prepared: &RawRecord) -> ValidationOutcome {
        let mut errors = Vec::new();

        for field in &self.schema.fields {
            let value = prepared.get(&field.name);

            if is_absent(value) {
                if field.required {
                    errors.push(ValidationError::new(
                        &field.name,
                        format!("Field '{}' is required", field.name),
                        ErrorCode::Required,
                    ));
                }
                continue;
            }
            let Some(value) = value else { continue };

            if let Some(error) = self.check_type(field, value) {
                errors.push(error);
            }

            if let Some(pattern) = &field.pattern {
                let text = string_form(value);
                if !pattern.is_match(&text) {
                    errors.push(
                        ValidationError::new(
                            &field.name,
                            format!("Value does not match pattern '{}'", pattern.as_str()),
                            ErrorCode::PatternMismatch,
                        )
                        .with_value(value.clone()),
                    );
                }
            }

            if let Some(validator) = &field.custom_validator {
                match validator(value) {
                    CustomCheck::Pass => {}
                    CustomCheck::Fail(message) => {
                        errors.push(
                            ValidationError::new(&field.name, message, ErrorCode::CustomValidation)
                                .with_value(value.clone()),
                        );
                    }
                    CustomCheck::Warn(message) => {
                        errors.push(
                            ValidationError::warning(
                                &field.name,
                                message,
                                ErrorCode::CustomValidation,
                            )
                            .with_value(value.clone()),
                        );
                    }
                }
            }
        }

        if self.schema.strict {
            for key in prepared.keys() {
                if !self.known_fields.contains(key) {
                    errors.push(ValidationError::new(
                        key,
                        format!("Unknown field '{key}'"),
                        ErrorCode::UnknownField,
                    ));
                }
            }
        }

        let is_valid = !errors.iter().any(ValidationError::is_blocking);
        ValidationOutcome {
            is_valid,
            errors,
            parsed: prepared.clone(),
        }
    }

    /// Atomically check-and-record unique-field values for one record
    ///
    /// Values are keyed case-insensitively for strings and by their JSON
    /// rendering otherwise. The seen-set grows for the lifetime of the job.
    pub fn check_unique(&self, prepared: &RawRecord) -> Vec<ValidationError> {
        if self.schema.unique_fields.is_empty() {
            return Vec::new();
        }

        let mut errors = Vec::new();
        let mut seen = self.seen_unique.lock();
        for field in &self.schema.unique_fields {
            let value = prepared.get(field);
            if is_absent(value) {
                continue;
            }
            let Some(value) = value else { continue };
            let key = match value {
                Value::String(s) => s.to_lowercase(),
                other => other.to_string(),
            };
            let entry = seen.entry(field.clone()).or_default();
            if !entry.insert(key) {
                errors.push(
                    ValidationError::new(
                        field,
                        format!("Duplicate value for unique field '{field}'"),
                        ErrorCode::DuplicateValue,
                    )
                    .with_value(value.clone()),
                );
            }
        }
        errors
    }

    fn check_type(&self, field: &FieldDef, value: &Value) -> Option<ValidationError> {
        let ok = match field.field_type {
            FieldType::String => value.is_string(),
            FieldType::Number => match value {
                Value::Number(_) => true,
                Value::String(s) => s.trim().parse::<f64>().is_ok(),
                _ => false,
            },
            FieldType::Boolean => match value {
                Value::Bool(_) => true,
                Value::Number(n) => n.as_f64() == Some(0.0) || n.as_f64() == Some(1.0),
                Value::String(s) => matches!(
                    s.trim().to_lowercase().as_str(),
                    "true" | "false" | "1" | "0" | "yes" | "no"
                ),
                _ => false,
            },
            FieldType::Date => match value {
                Value::String(s) => parse_date(s),
                Value::Number(_) => true,
                _ => false,
            },
            FieldType::Email => match value {
                Value::String(s) => self.email_pattern.is_match(s),
                _ => false,
            },
            FieldType::Array => value.is_array() || value.is_string(),
            FieldType::Custom => true,
        };

        if ok {
            None
        } else {
            Some(
                ValidationError::new(
                    &field.name,
                    format!(
                        "Expected {} for field '{}'",
                        type_name(field.field_type),
                        field.name
                    ),
                    ErrorCode::TypeMismatch,
                )
                .with_value(value.clone()),
            )
        }
    }
}

impl fmt::Debug for SchemaValidator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchemaValidator")
            .field("schema", &self.schema)
            .finish_non_exhaustive()
    }
}

/// Absent values: missing, null, empty string, empty array
fn is_absent(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => s.is_empty(),
        Some(Value::Array(items)) => items.is_empty(),
        _ => false,
    }
}

fn string_form(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn parse_date(s: &str) -> bool {
    let s = s.trim();
    chrono::DateTime::parse_from_rfc3339(s).is_ok()
        || chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d").is_ok()
        || chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").is_ok()
}

fn type_name(field_type: FieldType) -> &'static str {
    match field_type {
        FieldType::String => "a string",
        FieldType::Number => "a number",
        FieldType::Boolean => "a boolean",
        FieldType::Date => "a date",
        FieldType::Email => "an email address",
        FieldType::Array => "an array",
        FieldType::Custom => "a custom value",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn raw(pairs: &[(&str, Value)]) -> RawRecord {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn email_schema() -> ImportSchema {
        ImportSchema::new()
            .with_field(
                FieldDef::new("email", FieldType::Email)
                    .required()
                    .with_aliases(["e-mail", "mail"]),
            )
            .with_field(FieldDef::new("age", FieldType::Number))
    }

    #[test]
    fn aliases_resolve_case_insensitively() {
        let validator = SchemaValidator::new(email_schema());
        let resolved = validator.resolve_aliases(&raw(&[
            ("E-Mail", json!("a@x.com")),
            ("extra", json!("kept")),
        ]));
        assert_eq!(resolved.get("email"), Some(&json!("a@x.com")));
        assert_eq!(resolved.get("extra"), Some(&json!("kept")));
        assert!(!resolved.contains_key("E-Mail"));
    }

    #[test]
    fn canonical_key_wins_over_alias() {
        let validator = SchemaValidator::new(email_schema());
        let resolved = validator.resolve_aliases(&raw(&[
            ("email", json!("first@x.com")),
            ("mail", json!("second@x.com")),
        ]));
        assert_eq!(resolved.get("email"), Some(&json!("first@x.com")));
        assert_eq!(resolved.len(), 1);
    }

    #[test]
    fn array_values_split_and_trim() {
        let schema = ImportSchema::new().with_field(
            FieldDef::new("tags", FieldType::Array)
                .with_item_transform(|v| match v {
                    Value::String(s) => Value::String(s.to_uppercase()),
                    other => other,
                }),
        );
        let validator = SchemaValidator::new(schema);
        let transformed = validator.apply_transforms(raw(&[("tags", json!(" a, b ,, c"))]));
        assert_eq!(transformed.get("tags"), Some(&json!(["A", "B", "C"])));
    }

    #[test]
    fn defaults_fill_absent_values() {
        let schema = ImportSchema::new()
            .with_field(FieldDef::new("country", FieldType::String).with_default(json!("ES")));
        let validator = SchemaValidator::new(schema);
        let transformed = validator.apply_transforms(raw(&[("country", json!(""))]));
        assert_eq!(transformed.get("country"), Some(&json!("ES")));
    }

    #[test]
    fn transform_not_applied_to_absent_values() {
        let schema = ImportSchema::new().with_field(
            FieldDef::new("name", FieldType::String).with_transform(|v| match v {
                Value::String(s) => Value::String(s.trim().to_string()),
                other => other,
            }),
        );
        let validator = SchemaValidator::new(schema);
        let transformed = validator.apply_transforms(raw(&[("name", json!(null))]));
        assert_eq!(transformed.get("name"), Some(&json!(null)));
    }

    #[test]
    fn required_fields_reject_absence() {
        let validator = SchemaValidator::new(email_schema());
        let outcome = validator.validate(&raw(&[("age", json!(30))]));
        assert!(!outcome.is_valid);
        assert_eq!(outcome.errors[0].code, ErrorCode::Required);
        assert_eq!(outcome.errors[0].field, "email");
    }

    #[test]
    fn type_checks_accept_coercible_forms() {
        let schema = ImportSchema::new()
            .with_field(FieldDef::new("count", FieldType::Number))
            .with_field(FieldDef::new("active", FieldType::Boolean))
            .with_field(FieldDef::new("joined", FieldType::Date));
        let validator = SchemaValidator::new(schema);

        let ok = validator.validate(&raw(&[
            ("count", json!("42")),
            ("active", json!("Yes")),
            ("joined", json!("2024-01-01")),
        ]));
        assert!(ok.is_valid, "errors: {:?}", ok.errors);

        let bad = validator.validate(&raw(&[
            ("count", json!("forty-two")),
            ("active", json!("maybe")),
            ("joined", json!("soon")),
        ]));
        assert_eq!(bad.errors.len(), 3);
        assert!(bad
            .errors
            .iter()
            .all(|e| e.code == ErrorCode::TypeMismatch));
    }

    #[test]
    fn email_format_is_checked() {
        let validator = SchemaValidator::new(email_schema());
        let outcome = validator.validate(&raw(&[("email", json!("not-an-email"))]));
        assert!(!outcome.is_valid);
        assert_eq!(outcome.errors[0].code, ErrorCode::TypeMismatch);
    }

    #[test]
    fn pattern_runs_after_type_check() {
        let schema = ImportSchema::new().with_field(
            FieldDef::new("sku", FieldType::String)
                .with_pattern(Regex::new(r"^SKU-\d{4}$").unwrap()),
        );
        let validator = SchemaValidator::new(schema);
        let outcome = validator.validate(&raw(&[("sku", json!("SKU-12"))]));
        assert_eq!(outcome.errors[0].code, ErrorCode::PatternMismatch);
    }

    #[test]
    fn custom_validator_warnings_do_not_block() {
        let schema = ImportSchema::new().with_field(
            FieldDef::new("name", FieldType::String).with_custom_validator(|v| {
                match v.as_str() {
                    Some(s) if s.len() < 2 => CustomCheck::Warn("very short name".into()),
                    _ => CustomCheck::Pass,
                }
            }),
        );
        let validator = SchemaValidator::new(schema);
        let outcome = validator.validate(&raw(&[("name", json!("x"))]));
        assert!(outcome.is_valid);
        assert_eq!(outcome.errors.len(), 1);
    }

    #[test]
    fn strict_mode_flags_unknown_fields() {
        let mut schema = email_schema();
        schema.strict = true;
        let validator = SchemaValidator::new(schema);
        let outcome = validator.validate(&raw(&[
            ("email", json!("a@x.com")),
            ("nickname", json!("al")),
        ]));
        assert!(!outcome.is_valid);
        assert!(outcome
            .errors
            .iter()
            .any(|e| e.code == ErrorCode::UnknownField && e.field == "nickname"));
    }

    #[test]
    fn uniqueness_is_case_insensitive_and_cumulative() {
        let schema = email_schema();
        let validator = SchemaValidator::new(ImportSchema {
            unique_fields: vec!["email".into()],
            ..schema
        });

        assert!(validator
            .check_unique(&raw(&[("email", json!("a@x.com"))]))
            .is_empty());
        assert!(validator
            .check_unique(&raw(&[("email", json!("b@x.com"))]))
            .is_empty());

        let dupes = validator.check_unique(&raw(&[("email", json!("A@X.com"))]));
        assert_eq!(dupes.len(), 1);
        assert_eq!(dupes[0].code, ErrorCode::DuplicateValue);
    }

    #[test]
    fn uniqueness_keys_non_strings_by_rendering() {
        let validator = SchemaValidator::new(ImportSchema::new().unique_on("code"));
        assert!(validator.check_unique(&raw(&[("code", json!(7))])).is_empty());
        assert_eq!(validator.check_unique(&raw(&[("code", json!(7))])).len(), 1);
    }
}
