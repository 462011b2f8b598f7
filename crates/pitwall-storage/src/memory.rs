//! In-process document store with the same upsert semantics as the MongoDB store.
//! Backs tests and dry runs.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use pitwall_core::{Record, Value};
use tokio::sync::Mutex;

use crate::{BulkWriteOutcome, DocumentStore, OpError, StoreError, UpsertOp};

const DUPLICATE_KEY: i32 = 11000;
const DOLLAR_PREFIXED_FIELD: i32 = 52;

#[derive(Debug, Default)]
struct MemoryCollection {
    unique_fields: BTreeSet<String>,
    documents: Vec<Record>,
}

enum Applied {
    Matched { modified: bool },
    Inserted,
}

/// Filter equality as the server applies it: numbers compare by value across int and float.
fn same_key(stored: Option<&Value>, wanted: &Value) -> bool {
    match (stored.and_then(Value::identity_token), wanted.identity_token()) {
        (Some(a), Some(b)) => a == b,
        _ => stored == Some(wanted),
    }
}

impl MemoryCollection {
    fn position_of(&self, field: &str, value: &Value) -> Option<usize> {
        self.documents
            .iter()
            .position(|doc| same_key(doc.get(field), value))
    }

    fn unique_conflict(&self, candidate: &Record, skip: Option<usize>) -> Option<(String, Value)> {
        for field in &self.unique_fields {
            let Some(value) = candidate.get(field).filter(|v| !v.is_null()) else {
                continue;
            };
            let clash = self
                .documents
                .iter()
                .enumerate()
                .any(|(i, doc)| Some(i) != skip && same_key(doc.get(field), value));
            if clash {
                return Some((field.clone(), value.clone()));
            }
        }
        None
    }

    fn apply(&mut self, collection: &str, op: &UpsertOp) -> Result<Applied, (i32, String)> {
        if let Some(field) = op
            .set
            .iter()
            .chain(op.set_on_insert.iter())
            .map(|(field, _)| field)
            .find(|field| field.starts_with('$'))
        {
            return Err((
                DOLLAR_PREFIXED_FIELD,
                format!("The dollar ($) prefixed field '{field}' is not valid for storage."),
            ));
        }

        let duplicate = |field: String, value: Value| {
            (
                DUPLICATE_KEY,
                format!(
                    "E11000 duplicate key error collection: {collection} index: {field}_1 dup key: {{ {field}: {value} }}"
                ),
            )
        };

        match self.position_of(&op.filter_field, &op.filter_value) {
            Some(pos) => {
                let mut updated = self.documents[pos].clone();
                for (field, value) in op.set.iter() {
                    updated.set(field.clone(), value.clone());
                }
                if let Some((field, value)) = self.unique_conflict(&updated, Some(pos)) {
                    return Err(duplicate(field, value));
                }
                let modified = updated != self.documents[pos];
                self.documents[pos] = updated;
                Ok(Applied::Matched { modified })
            }
            None => {
                let mut inserted = op.set.clone();
                inserted.set(op.filter_field.clone(), op.filter_value.clone());
                for (field, value) in op.set_on_insert.iter() {
                    inserted.set(field.clone(), value.clone());
                }
                if let Some((field, value)) = self.unique_conflict(&inserted, None) {
                    return Err(duplicate(field, value));
                }
                self.documents.push(inserted);
                Ok(Applied::Inserted)
            }
        }
    }
}

/// Cloning shares the underlying collections.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    collections: Arc<Mutex<BTreeMap<String, MemoryCollection>>>,
    reachable: Arc<AtomicBool>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            collections: Arc::new(Mutex::new(BTreeMap::new())),
            reachable: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Simulate the store going away (or coming back).
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    pub async fn documents(&self, collection: &str) -> Vec<Record> {
        self.collections
            .lock()
            .await
            .get(collection)
            .map(|c| c.documents.clone())
            .unwrap_or_default()
    }

    pub async fn find_one(&self, collection: &str, field: &str, value: &Value) -> Option<Record> {
        let collections = self.collections.lock().await;
        let coll = collections.get(collection)?;
        coll.position_of(field, value)
            .map(|pos| coll.documents[pos].clone())
    }

    pub async fn unique_fields(&self, collection: &str) -> Vec<String> {
        self.collections
            .lock()
            .await
            .get(collection)
            .map(|c| c.unique_fields.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn check_reachable(&self) -> Result<(), StoreError> {
        if self.reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Connectivity(
                "in-memory store marked unreachable".to_string(),
            ))
        }
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    fn describe(&self) -> String {
        "in-memory store".to_string()
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.check_reachable()
    }

    async fn ensure_unique_index(&self, collection: &str, field: &str) -> Result<(), StoreError> {
        self.check_reachable()?;
        let mut collections = self.collections.lock().await;
        let coll = collections.entry(collection.to_string()).or_default();
        if coll.unique_fields.contains(field) {
            return Ok(());
        }

        let mut seen = BTreeSet::new();
        for value in coll.documents.iter().filter_map(|doc| doc.get(field)) {
            if let Some(token) = value.identity_token() {
                if !seen.insert(token) {
                    return Err(StoreError::Index {
                        collection: collection.to_string(),
                        field: field.to_string(),
                        message: format!("existing documents share the value {value}"),
                    });
                }
            }
        }
        coll.unique_fields.insert(field.to_string());
        Ok(())
    }

    async fn bulk_upsert(
        &self,
        collection: &str,
        ops: &[UpsertOp],
    ) -> Result<BulkWriteOutcome, StoreError> {
        self.check_reachable()?;
        let mut collections = self.collections.lock().await;
        let coll = collections.entry(collection.to_string()).or_default();

        let mut outcome = BulkWriteOutcome::default();
        for (op_index, op) in ops.iter().enumerate() {
            match coll.apply(collection, op) {
                Ok(Applied::Matched { modified }) => {
                    outcome.matched += 1;
                    if modified {
                        outcome.modified += 1;
                    }
                }
                Ok(Applied::Inserted) => outcome.upserted.push(op_index),
                Err((code, message)) => outcome.errors.push(OpError {
                    op_index,
                    code: Some(code),
                    message,
                }),
            }
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn op(position: usize, code: &str, points: f64) -> UpsertOp {
        UpsertOp {
            position,
            filter_field: "driverCode".into(),
            filter_value: Value::from(code),
            set: Record::new().with("driverCode", code).with("points", points),
            set_on_insert: Record::new().with("_created_at", "t0"),
        }
    }

    #[tokio::test]
    async fn upsert_inserts_then_matches() {
        let store = MemoryStore::new();
        store.ensure_unique_index("drivers", "driverCode").await.unwrap();

        let first = store.bulk_upsert("drivers", &[op(0, "VER", 10.0)]).await.unwrap();
        assert_eq!(first.upserted, vec![0]);

        let second = store
            .bulk_upsert("drivers", &[op(0, "VER", 10.0), op(1, "NOR", 8.0)])
            .await
            .unwrap();
        assert_eq!(second.matched, 1);
        assert_eq!(second.modified, 0);
        assert_eq!(second.upserted, vec![1]);

        let third = store.bulk_upsert("drivers", &[op(0, "VER", 35.0)]).await.unwrap();
        assert_eq!(third.modified, 1);
        assert_eq!(store.documents("drivers").await.len(), 2);
    }

    #[tokio::test]
    async fn dollar_prefixed_fields_fail_only_their_operation() {
        let store = MemoryStore::new();
        let mut bad = op(1, "HAM", 5.0);
        bad.set.set("$bad", 1);

        let outcome = store
            .bulk_upsert("drivers", &[op(0, "LEC", 1.0), bad, op(2, "RUS", 2.0)])
            .await
            .unwrap();
        assert_eq!(outcome.upserted, vec![0, 2]);
        assert_eq!(outcome.errors.len(), 1);
        assert_eq!(outcome.errors[0].op_index, 1);
        assert_eq!(outcome.errors[0].code, Some(DOLLAR_PREFIXED_FIELD));
    }

    #[tokio::test]
    async fn secondary_unique_index_rejects_duplicates() {
        let store = MemoryStore::new();
        store.ensure_unique_index("drivers", "number").await.unwrap();
        let mut a = op(0, "VER", 1.0);
        a.set.set("number", 1);
        let mut b = op(1, "NOR", 1.0);
        b.set.set("number", 1);

        let outcome = store.bulk_upsert("drivers", &[a, b]).await.unwrap();
        assert_eq!(outcome.upserted, vec![0]);
        assert_eq!(outcome.errors[0].code, Some(DUPLICATE_KEY));
    }

    #[tokio::test]
    async fn unreachable_store_refuses_everything() {
        let store = MemoryStore::new();
        store.set_reachable(false);
        assert!(matches!(store.ping().await, Err(StoreError::Connectivity(_))));
        assert!(store.bulk_upsert("drivers", &[op(0, "VER", 1.0)]).await.is_err());
    }
}
