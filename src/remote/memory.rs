//! In-process document store.
//!
//! Behaves like the hosted backend for everything the sync engine relies on
//! (generated ids, merge updates, filtered and ordered queries, atomic
//! batches) and can be told to reject writes, which is how the replay and
//! dead-letter paths are exercised.

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

use super::{Direction, Document, FilterOp, OrderBy, QueryFilter, RemoteError, RemoteStore, WriteOp};

struct FieldRule {
    field: String,
    value: Value,
    error: RemoteError,
}

#[derive(Default)]
struct Inner {
    collections: HashMap<String, BTreeMap<String, Map<String, Value>>>,
    offline: bool,
    collection_failures: HashMap<String, RemoteError>,
    field_failures: Vec<FieldRule>,
    batch_commits: usize,
    creates: usize,
}

#[derive(Default)]
pub struct MemoryRemoteStore {
    inner: Mutex<Inner>,
}

fn offline_error() -> RemoteError {
    RemoteError::Unavailable("Failed to get document because the client is offline.".into())
}

fn generate_id() -> String {
    Uuid::new_v4().simple().to_string()[..20].to_string()
}

fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        (Some(Value::Number(x)), Some(Value::Number(y))) => {
            let (x, y) = (x.as_f64().unwrap_or(0.0), y.as_f64().unwrap_or(0.0));
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Some(Value::Bool(x)), Some(Value::Bool(y))) => x.cmp(y),
        _ => Ordering::Equal,
    }
}

fn matches_filter(doc: &Map<String, Value>, filter: &QueryFilter) -> bool {
    let field = doc.get(&filter.field);
    match filter.op {
        FilterOp::Eq => field == Some(&filter.value),
        FilterOp::NotEq => field != Some(&filter.value),
        FilterOp::In => match (&filter.value, field) {
            (Value::Array(options), Some(v)) => options.contains(v),
            _ => false,
        },
    }
}

impl Inner {
    fn check_write(
        &self,
        collection: &str,
        id: Option<&str>,
        data: Option<&Map<String, Value>>,
    ) -> Result<(), RemoteError> {
        if self.offline {
            return Err(offline_error());
        }
        if let Some(err) = self.collection_failures.get(collection) {
            return Err(err.clone());
        }
        let existing = id.and_then(|id| self.collections.get(collection)?.get(id));
        for rule in &self.field_failures {
            let hit = |doc: Option<&Map<String, Value>>| {
                doc.and_then(|d| d.get(&rule.field)) == Some(&rule.value)
            };
            if hit(data) || hit(existing) {
                return Err(rule.error.clone());
            }
        }
        Ok(())
    }

    fn apply(&mut self, op: WriteOp) {
        match op {
            WriteOp::Set {
                collection,
                id,
                data,
            } => {
                self.collections.entry(collection).or_default().insert(id, data);
            }
            WriteOp::Update {
                collection,
                id,
                data,
            } => {
                if let Some(doc) = self
                    .collections
                    .get_mut(&collection)
                    .and_then(|c| c.get_mut(&id))
                {
                    doc.extend(data);
                }
            }
            WriteOp::Delete { collection, id } => {
                if let Some(c) = self.collections.get_mut(&collection) {
                    c.remove(&id);
                }
            }
        }
    }

    fn exists(&self, collection: &str, id: &str) -> bool {
        self.collections
            .get(collection)
            .is_some_and(|c| c.contains_key(id))
    }
}

impl MemoryRemoteStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Make every call fail with `unavailable` until switched back.
    pub fn set_offline(&self, offline: bool) {
        self.lock().offline = offline;
    }

    /// Reject every write to `collection` with `error`.
    pub fn fail_collection(&self, collection: &str, error: RemoteError) {
        self.lock()
            .collection_failures
            .insert(collection.to_string(), error);
    }

    /// Reject writes whose data, or whose target document, has
    /// `field == value`.
    pub fn fail_when(&self, field: &str, value: Value, error: RemoteError) {
        self.lock().field_failures.push(FieldRule {
            field: field.to_string(),
            value,
            error,
        });
    }

    pub fn clear_failures(&self) {
        let mut inner = self.lock();
        inner.collection_failures.clear();
        inner.field_failures.clear();
    }

    /// Seed a document with a known id.
    pub fn insert(&self, collection: &str, id: &str, data: Value) {
        if let Value::Object(map) = data {
            self.lock()
                .collections
                .entry(collection.to_string())
                .or_default()
                .insert(id.to_string(), map);
        }
    }

    pub fn get(&self, collection: &str, id: &str) -> Option<Map<String, Value>> {
        self.lock().collections.get(collection)?.get(id).cloned()
    }

    /// All documents of `collection`, each with its `"id"`.
    pub fn documents(&self, collection: &str) -> Vec<Document> {
        self.lock()
            .collections
            .get(collection)
            .map(|c| {
                c.iter()
                    .map(|(id, data)| {
                        let mut doc = data.clone();
                        doc.insert("id".into(), Value::String(id.clone()));
                        doc
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn batch_commits(&self) -> usize {
        self.lock().batch_commits
    }

    pub fn create_calls(&self) -> usize {
        self.lock().creates
    }
}

#[async_trait]
impl RemoteStore for MemoryRemoteStore {
    async fn create(
        &self,
        collection: &str,
        data: Map<String, Value>,
    ) -> Result<String, RemoteError> {
        let mut inner = self.lock();
        inner.check_write(collection, None, Some(&data))?;
        let id = generate_id();
        inner.creates += 1;
        inner.apply(WriteOp::Set {
            collection: collection.to_string(),
            id: id.clone(),
            data,
        });
        Ok(id)
    }

    async fn update(
        &self,
        collection: &str,
        id: &str,
        partial: Map<String, Value>,
    ) -> Result<(), RemoteError> {
        let mut inner = self.lock();
        inner.check_write(collection, Some(id), Some(&partial))?;
        if !inner.exists(collection, id) {
            return Err(RemoteError::NotFound(format!(
                "No document to update: {collection}/{id}"
            )));
        }
        inner.apply(WriteOp::Update {
            collection: collection.to_string(),
            id: id.to_string(),
            data: partial,
        });
        Ok(())
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<(), RemoteError> {
        let mut inner = self.lock();
        inner.check_write(collection, Some(id), None)?;
        inner.apply(WriteOp::Delete {
            collection: collection.to_string(),
            id: id.to_string(),
        });
        Ok(())
    }

    async fn query(
        &self,
        collection: &str,
        filters: &[QueryFilter],
        order: Option<&OrderBy>,
    ) -> Result<Vec<Document>, RemoteError> {
        if self.lock().offline {
            return Err(offline_error());
        }
        let mut docs: Vec<Document> = self
            .documents(collection)
            .into_iter()
            .filter(|d| filters.iter().all(|f| matches_filter(d, f)))
            .collect();
        if let Some(order) = order {
            docs.sort_by(|a, b| {
                let ord = compare_values(a.get(&order.field), b.get(&order.field));
                match order.direction {
                    Direction::Asc => ord,
                    Direction::Desc => ord.reverse(),
                }
            });
        }
        Ok(docs)
    }

    async fn batch_commit(&self, writes: Vec<WriteOp>) -> Result<(), RemoteError> {
        let mut inner = self.lock();
        for op in &writes {
            match op {
                WriteOp::Set {
                    collection,
                    id,
                    data,
                } => inner.check_write(collection, Some(id), Some(data))?,
                WriteOp::Update {
                    collection,
                    id,
                    data,
                } => {
                    inner.check_write(collection, Some(id), Some(data))?;
                    if !inner.exists(collection, id) {
                        return Err(RemoteError::NotFound(format!(
                            "No document to update: {collection}/{id}"
                        )));
                    }
                }
                WriteOp::Delete { collection, id } => {
                    inner.check_write(collection, Some(id), None)?
                }
            }
        }
        for op in writes {
            inner.apply(op);
        }
        inner.batch_commits += 1;
        Ok(())
    }

    async fn is_reachable(&self) -> bool {
        !self.lock().offline
    }
}
