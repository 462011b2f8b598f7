//! Idempotent batch upsert keyed by a caller-supplied identity field.

use std::collections::HashMap;

use pitwall_core::{Document, IdentityError, Record, CREATED_AT_FIELD};
use serde::Serialize;
use thiserror::Error;
use tracing::{error, info, instrument, warn};

use crate::{DocumentStore, StoreError, UpsertOp};

#[derive(Debug, Error)]
pub enum UpsertError {
    #[error("document store unreachable: {0}")]
    Connectivity(String),
    #[error("invalid store configuration: {0}")]
    Configuration(String),
    #[error("unique constraint on {collection}.{field} could not be guaranteed: {message}")]
    Constraint {
        collection: String,
        field: String,
        message: String,
    },
}

impl From<StoreError> for UpsertError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Connectivity(message) => UpsertError::Connectivity(message),
            StoreError::InvalidAddress(message) => UpsertError::Configuration(message),
            StoreError::Index {
                collection,
                field,
                message,
            } => UpsertError::Constraint {
                collection,
                field,
                message,
            },
        }
    }
}

/// One document that did not make it into the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WriteFailure {
    /// Position in the submitted batch.
    pub position: usize,
    pub identity: Option<String>,
    pub code: Option<i32>,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{} of {} documents failed to write to `{}`", .failures.len(), .submitted, .collection)]
pub struct PartialWriteError {
    pub collection: String,
    pub submitted: usize,
    pub failures: Vec<WriteFailure>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub collection: String,
    pub identity_field: String,
    pub submitted: usize,
    pub matched: u64,
    pub created: u64,
    pub modified: u64,
    /// Earlier batch entries replaced by a later entry with the same identity value.
    pub superseded: usize,
    pub failures: Vec<WriteFailure>,
}

impl SyncReport {
    pub fn empty(collection: &str, identity_field: &str) -> Self {
        Self {
            collection: collection.to_string(),
            identity_field: identity_field.to_string(),
            ..Default::default()
        }
    }

    /// Documents that exist in the store with this batch's content.
    pub fn written(&self) -> u64 {
        self.matched + self.created
    }

    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn partial_write_error(&self) -> Option<PartialWriteError> {
        if self.failures.is_empty() {
            return None;
        }
        Some(PartialWriteError {
            collection: self.collection.clone(),
            submitted: self.submitted,
            failures: self.failures.clone(),
        })
    }
}

/// Reconciles document batches into a collection.
///
/// Each document becomes one conditional write against the identity field, so concurrent
/// runs upserting the same key converge on a single document holding one run's fields.
pub struct UpsertEngine<S> {
    store: S,
}

impl<S: DocumentStore> UpsertEngine<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Upsert `documents` into `collection` keyed by `identity_field`.
    ///
    /// Returns `Err` only when nothing was attempted: the store is unreachable or the unique
    /// constraint cannot be put in place. Per-document failures land in the report.
    #[instrument(skip_all, fields(collection = %collection, identity_field = %identity_field, batch = documents.len()))]
    pub async fn synchronize(
        &self,
        documents: Vec<Document>,
        identity_field: &str,
        collection: &str,
    ) -> Result<SyncReport, UpsertError> {
        let mut report = SyncReport::empty(collection, identity_field);
        report.submitted = documents.len();
        if documents.is_empty() {
            info!("no documents to upsert");
            return Ok(report);
        }

        if let Err(err) = self.store.ping().await {
            error!(store = %self.store.describe(), %err, "couldn't reach document store");
            return Err(err.into());
        }
        if let Err(err) = self.store.ensure_unique_index(collection, identity_field).await {
            error!(%err, "unique index unavailable; nothing written");
            return Err(err.into());
        }

        let planned = plan_operations(documents, identity_field);
        report.superseded = planned.superseded;
        report.failures = planned.rejected;
        let ops = planned.ops;

        if !ops.is_empty() {
            match self.store.bulk_upsert(collection, &ops).await {
                Ok(outcome) => {
                    report.matched = outcome.matched;
                    report.created = outcome.upserted.len() as u64;
                    report.modified = outcome.modified;
                    for op_error in outcome.errors {
                        let op = ops.get(op_error.op_index);
                        report.failures.push(WriteFailure {
                            position: op.map(|op| op.position).unwrap_or(op_error.op_index),
                            identity: op.map(|op| op.filter_value.to_string()),
                            code: op_error.code,
                            message: op_error.message,
                        });
                    }
                }
                Err(err) => {
                    error!(%err, "bulk write failed for the whole batch");
                    let message = err.to_string();
                    report.failures.extend(ops.iter().map(|op| WriteFailure {
                        position: op.position,
                        identity: Some(op.filter_value.to_string()),
                        code: None,
                        message: message.clone(),
                    }));
                }
            }
        }
        report.failures.sort_by_key(|f| f.position);

        if let Some(partial) = report.partial_write_error() {
            error!(%partial, "bulk upsert finished with failures");
            for failure in &partial.failures {
                error!(
                    position = failure.position,
                    identity = ?failure.identity,
                    code = ?failure.code,
                    message = %failure.message,
                    "document write failed"
                );
            }
        }

        info!(
            matched = report.matched,
            created = report.created,
            modified = report.modified,
            superseded = report.superseded,
            failed = report.failures.len(),
            "upsert finished"
        );
        Ok(report)
    }
}

struct PlannedBatch {
    ops: Vec<UpsertOp>,
    rejected: Vec<WriteFailure>,
    superseded: usize,
}

/// Validate identities and collapse duplicates (last occurrence wins) into one write each.
fn plan_operations(documents: Vec<Document>, identity_field: &str) -> PlannedBatch {
    let mut ops: Vec<UpsertOp> = Vec::with_capacity(documents.len());
    let mut slots: HashMap<String, usize> = HashMap::new();
    let mut rejected = Vec::new();
    let mut superseded = 0;

    for (position, document) in documents.into_iter().enumerate() {
        let filter_value = match document.identity(identity_field) {
            Ok(value) => value.clone(),
            Err(err) => {
                let identity = match &err {
                    IdentityError::Missing(_) => None,
                    IdentityError::Unusable { value, .. } => Some(value.clone()),
                };
                warn!(position, %err, "document rejected before write");
                rejected.push(WriteFailure {
                    position,
                    identity,
                    code: None,
                    message: err.to_string(),
                });
                continue;
            }
        };

        let token = filter_value
            .identity_token()
            .unwrap_or_else(|| filter_value.to_string());
        let op = UpsertOp {
            position,
            filter_field: identity_field.to_string(),
            filter_value,
            set_on_insert: Record::new().with(CREATED_AT_FIELD, document.updated_at()),
            set: document.into_fields(),
        };

        match slots.get(&token) {
            Some(&slot) => {
                ops[slot] = op;
                superseded += 1;
            }
            None => {
                slots.insert(token, ops.len());
                ops.push(op);
            }
        }
    }

    PlannedBatch {
        ops,
        rejected,
        superseded,
    }
}
