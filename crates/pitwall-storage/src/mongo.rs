//! MongoDB-backed document store.

use async_trait::async_trait;
use bson::{doc, Bson, Document as BsonDocument};
use mongodb::error::{Error as MongoError, ErrorKind};
use mongodb::options::{ClientOptions, IndexOptions};
use mongodb::{Client, Database, IndexModel};
use pitwall_core::{Record, Value};
use tracing::{info, warn};

use crate::{BulkWriteOutcome, DocumentStore, OpError, StoreConfig, StoreError, UpsertOp};

/// Statements per `update` command; stays well below the server's write batch limit.
const MAX_STATEMENTS_PER_COMMAND: usize = 1000;

#[derive(Clone)]
pub struct MongoStore {
    database: Database,
}

impl MongoStore {
    /// Connect and verify the server answers within the configured timeout.
    pub async fn connect(config: &StoreConfig) -> Result<Self, StoreError> {
        let mut options = ClientOptions::parse(&config.uri)
            .await
            .map_err(|e| StoreError::InvalidAddress(e.to_string()))?;
        options.server_selection_timeout = Some(config.connect_timeout);
        options.connect_timeout = Some(config.connect_timeout);
        if options.app_name.is_none() {
            options.app_name = config.app_name.clone();
        }

        let client =
            Client::with_options(options).map_err(|e| StoreError::InvalidAddress(e.to_string()))?;
        let store = Self {
            database: client.database(&config.database),
        };
        store.ping().await?;

        info!(database = %config.database, "connected to MongoDB");
        Ok(store)
    }

    pub fn db_name(&self) -> &str {
        self.database.name()
    }
}

fn is_connectivity(err: &MongoError) -> bool {
    matches!(
        err.kind.as_ref(),
        ErrorKind::ServerSelection { .. } | ErrorKind::Io(_) | ErrorKind::DnsResolve { .. }
    )
}

#[async_trait]
impl DocumentStore for MongoStore {
    fn describe(&self) -> String {
        format!("mongodb database `{}`", self.db_name())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.database
            .run_command(doc! { "ping": 1 })
            .await
            .map(|_| ())
            .map_err(|e| StoreError::Connectivity(e.to_string()))
    }

    async fn ensure_unique_index(&self, collection: &str, field: &str) -> Result<(), StoreError> {
        let mut keys = BsonDocument::new();
        keys.insert(field, 1);
        let model = IndexModel::builder()
            .keys(keys)
            .options(IndexOptions::builder().unique(true).build())
            .build();

        match self
            .database
            .collection::<BsonDocument>(collection)
            .create_index(model)
            .await
        {
            Ok(created) => {
                info!(collection, index = %created.index_name, "unique index ensured");
                Ok(())
            }
            Err(err) if is_connectivity(&err) => Err(StoreError::Connectivity(err.to_string())),
            Err(err) => Err(StoreError::Index {
                collection: collection.to_string(),
                field: field.to_string(),
                message: err.to_string(),
            }),
        }
    }

    async fn bulk_upsert(
        &self,
        collection: &str,
        ops: &[UpsertOp],
    ) -> Result<BulkWriteOutcome, StoreError> {
        let mut outcome = BulkWriteOutcome::default();

        for (chunk_no, chunk) in ops.chunks(MAX_STATEMENTS_PER_COMMAND).enumerate() {
            let offset = chunk_no * MAX_STATEMENTS_PER_COMMAND;
            let updates: Vec<Bson> = chunk
                .iter()
                .map(|op| Bson::Document(update_statement(op)))
                .collect();
            let command = doc! {
                "update": collection,
                "updates": updates,
                "ordered": false,
            };

            let reply = match self.database.run_command(command).await {
                Ok(reply) => reply,
                Err(err) => {
                    // Earlier chunks are already applied; this chunk is lost as a unit.
                    let message = err.to_string();
                    outcome.errors.extend((0..chunk.len()).map(|i| OpError {
                        op_index: offset + i,
                        code: None,
                        message: message.clone(),
                    }));
                    continue;
                }
            };

            let upserted = reply
                .get_array("upserted")
                .map(|entries| {
                    entries
                        .iter()
                        .filter_map(Bson::as_document)
                        .filter_map(|entry| entry_index(entry, "index"))
                        .map(|i| offset + i)
                        .collect::<Vec<_>>()
                })
                .unwrap_or_default();

            let touched = count_field(&reply, "n");
            outcome.matched += touched.saturating_sub(upserted.len() as u64);
            outcome.modified += count_field(&reply, "nModified");
            outcome.upserted.extend(upserted);

            if let Ok(write_errors) = reply.get_array("writeErrors") {
                for entry in write_errors.iter().filter_map(Bson::as_document) {
                    let Some(index) = entry_index(entry, "index") else {
                        continue;
                    };
                    outcome.errors.push(OpError {
                        op_index: offset + index,
                        code: entry.get_i32("code").ok(),
                        message: entry
                            .get_str("errmsg")
                            .unwrap_or("unknown write error")
                            .to_string(),
                    });
                }
            }

            if let Ok(concern) = reply.get_document("writeConcernError") {
                warn!(collection, error = %concern, "write concern error reported");
            }
        }

        Ok(outcome)
    }
}

fn update_statement(op: &UpsertOp) -> BsonDocument {
    let mut filter = BsonDocument::new();
    filter.insert(op.filter_field.as_str(), value_to_bson(&op.filter_value));

    let mut update = BsonDocument::new();
    update.insert("$set", record_to_bson(&op.set));
    if !op.set_on_insert.is_empty() {
        update.insert("$setOnInsert", record_to_bson(&op.set_on_insert));
    }

    doc! {
        "q": filter,
        "u": update,
        "upsert": true,
        "multi": false,
    }
}

fn count_field(reply: &BsonDocument, key: &str) -> u64 {
    match reply.get(key) {
        Some(Bson::Int32(v)) => (*v).max(0) as u64,
        Some(Bson::Int64(v)) => (*v).max(0) as u64,
        Some(Bson::Double(v)) if *v > 0.0 => *v as u64,
        _ => 0,
    }
}

fn entry_index(entry: &BsonDocument, key: &str) -> Option<usize> {
    match entry.get(key) {
        Some(Bson::Int32(v)) if *v >= 0 => Some(*v as usize),
        Some(Bson::Int64(v)) if *v >= 0 => Some(*v as usize),
        _ => None,
    }
}

pub fn value_to_bson(value: &Value) -> Bson {
    match value {
        Value::Null => Bson::Null,
        Value::Bool(b) => Bson::Boolean(*b),
        Value::Int(i) => Bson::Int64(*i),
        Value::Float(f) if f.is_finite() => Bson::Double(*f),
        Value::Float(_) => Bson::Null,
        Value::Timestamp(ts) => Bson::DateTime(bson::DateTime::from_chrono(*ts)),
        Value::Text(s) => Bson::String(s.clone()),
        Value::List(items) => Bson::Array(items.iter().map(value_to_bson).collect()),
    }
}

pub fn record_to_bson(record: &Record) -> BsonDocument {
    let mut doc = BsonDocument::new();
    for (field, value) in record.iter() {
        doc.insert(field.as_str(), value_to_bson(value));
    }
    doc
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use pitwall_core::CREATED_AT_FIELD;

    #[test]
    fn update_statement_sets_fields_and_creation_stamp_on_insert() {
        let ts = Utc.with_ymd_and_hms(2025, 4, 6, 5, 0, 0).single().unwrap();
        let op = UpsertOp {
            position: 0,
            filter_field: "driverCode".into(),
            filter_value: Value::from("NOR"),
            set: Record::new().with("driverCode", "NOR").with("points", 25.0),
            set_on_insert: Record::new().with(CREATED_AT_FIELD, ts),
        };

        let statement = update_statement(&op);
        assert_eq!(statement.get_document("q").unwrap(), &doc! { "driverCode": "NOR" });
        let update = statement.get_document("u").unwrap();
        assert_eq!(
            update.get_document("$set").unwrap(),
            &doc! { "driverCode": "NOR", "points": 25.0 }
        );
        let mut expected = BsonDocument::new();
        expected.insert(CREATED_AT_FIELD, bson::DateTime::from_chrono(ts));
        assert_eq!(update.get_document("$setOnInsert").unwrap(), &expected);
        assert_eq!(statement.get_bool("upsert"), Ok(true));
    }

    #[test]
    fn empty_set_on_insert_is_omitted() {
        let op = UpsertOp {
            position: 0,
            filter_field: "id".into(),
            filter_value: Value::from("2025-1"),
            set: Record::new().with("id", "2025-1"),
            set_on_insert: Record::new(),
        };
        let statement = update_statement(&op);
        assert!(!statement.get_document("u").unwrap().contains_key("$setOnInsert"));
    }

    #[test]
    fn reply_counts_accept_any_integer_width() {
        let reply = doc! { "n": 3_i32, "nModified": 2_i64 };
        assert_eq!(count_field(&reply, "n"), 3);
        assert_eq!(count_field(&reply, "nModified"), 2);
        assert_eq!(count_field(&reply, "missing"), 0);
    }

    #[test]
    fn values_map_onto_bson_types() {
        assert_eq!(
            value_to_bson(&Value::from(vec![1, 2])),
            Bson::Array(vec![Bson::Int64(1), Bson::Int64(2)])
        );
        assert_eq!(value_to_bson(&Value::Float(f64::NAN)), Bson::Null);
        assert_eq!(value_to_bson(&Value::Null), Bson::Null);
    }
}
