//! Preview driver: validate a bounded sample without processing, state
//! mutation, or events

use bulkflow_shared::{ImportRecord, ValidationError};

use crate::error::Result;
use crate::pipeline::RecordFeed;
use crate::schema::SchemaValidator;

/// Result of sampling the head of a source
#[derive(Debug, Clone, Default)]
pub struct PreviewResult {
    pub valid_records: Vec<ImportRecord>,
    pub invalid_records: Vec<ImportRecord>,
    pub total_sampled: u64,
    /// Union of post-alias column names, in first-seen order
    pub columns: Vec<String>,
}

/// Read at most `max_records` records and validate them in isolation
///
/// Uniqueness is deliberately not checked: the seen-values map is job
/// state, and preview must leave the job untouched.
pub(crate) async fn run_preview(
    feed: &mut RecordFeed,
    validator: Option<&SchemaValidator>,
    max_records: u64,
) -> Result<PreviewResult> {
    let mut result = PreviewResult::default();

    while result.total_sampled < max_records {
        let Some(record) = feed.next_record().await? else {
            break;
        };
        result.total_sampled += 1;

        match validator {
            Some(validator) => {
                let prepared = validator.prepare(&record.raw);
                for column in prepared.keys() {
                    if !result.columns.iter().any(|c| c == column) {
                        result.columns.push(column.clone());
                    }
                }
                let outcome = validator.validate(&prepared);
                if outcome.errors.iter().any(ValidationError::is_blocking) {
                    result
                        .invalid_records
                        .push(record.into_invalid(outcome.errors));
                } else {
                    result
                        .valid_records
                        .push(record.into_valid(outcome.parsed, outcome.errors));
                }
            }
            None => {
                for column in record.raw.keys() {
                    if !result.columns.iter().any(|c| c == column) {
                        result.columns.push(column.clone());
                    }
                }
                let parsed = record.raw.clone();
                result.valid_records.push(record.into_valid(parsed, Vec::new()));
            }
        }
    }

    Ok(result)
}
