//! Value types exchanged with a remote document store.

use std::cmp::Ordering;
use std::fmt;

use chrono::{DateTime, Utc};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Length of generated document ids, matching the store's own auto-ids.
const AUTO_ID_LENGTH: usize = 20;

/// Reference to a single document: collection path plus document id.
///
/// Serialized as its slash-joined path so references can live inside
/// document payloads (e.g. a `friends` list).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DocRef {
    collection: String,
    id: String,
}

impl DocRef {
    pub fn new(collection: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            id: id.into(),
        }
    }

    /// Parse `collection/sub/.../id`. The last segment is the id.
    pub fn parse(path: &str) -> Option<Self> {
        let (collection, id) = path.rsplit_once('/')?;
        if collection.is_empty() || id.is_empty() {
            return None;
        }
        Some(Self::new(collection, id))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn collection(&self) -> CollectionRef {
        CollectionRef::new(self.collection.clone())
    }

    pub fn collection_path(&self) -> &str {
        &self.collection
    }

    pub fn path(&self) -> String {
        format!("{}/{}", self.collection, self.id)
    }
}

impl fmt::Display for DocRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.collection, self.id)
    }
}

impl TryFrom<String> for DocRef {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        DocRef::parse(&value).ok_or_else(|| format!("invalid document path: {}", value))
    }
}

impl From<DocRef> for String {
    fn from(value: DocRef) -> Self {
        value.path()
    }
}

/// Reference to a collection of documents.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CollectionRef {
    path: String,
}

impl CollectionRef {
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn doc(&self, id: impl Into<String>) -> DocRef {
        DocRef::new(self.path.clone(), id)
    }

    /// Reference to a new document with a random id.
    pub fn new_doc(&self) -> DocRef {
        let id: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(AUTO_ID_LENGTH)
            .map(char::from)
            .collect();
        self.doc(id)
    }

    /// Query over the whole collection.
    pub fn query(&self) -> Query {
        Query::new(self.clone())
    }
}

impl fmt::Display for CollectionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
    Eq,
    Lt,
    Le,
    Gt,
    Ge,
    ArrayContains,
    In,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    pub field: String,
    pub op: FilterOp,
    pub value: Value,
}

impl Filter {
    /// Evaluate against a document body. `field` may be a dotted path.
    pub fn matches(&self, data: &Value) -> bool {
        let Some(actual) = lookup_field(data, &self.field) else {
            return false;
        };
        match self.op {
            FilterOp::Eq => actual == &self.value,
            FilterOp::Lt => compare_values(actual, &self.value) == Some(Ordering::Less),
            FilterOp::Le => matches!(
                compare_values(actual, &self.value),
                Some(Ordering::Less | Ordering::Equal)
            ),
            FilterOp::Gt => compare_values(actual, &self.value) == Some(Ordering::Greater),
            FilterOp::Ge => matches!(
                compare_values(actual, &self.value),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            FilterOp::ArrayContains => actual
                .as_array()
                .map(|items| items.contains(&self.value))
                .unwrap_or(false),
            FilterOp::In => self
                .value
                .as_array()
                .map(|options| options.contains(actual))
                .unwrap_or(false),
        }
    }
}

fn lookup_field<'a>(data: &'a Value, field: &str) -> Option<&'a Value> {
    field
        .split('.')
        .try_fold(data, |current, segment| current.as_object()?.get(segment))
}

/// Ordering between two values of the same JSON type; `None` across types.
fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

/// A collection plus field filters, evaluated in order.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    collection: CollectionRef,
    filters: Vec<Filter>,
    limit: Option<usize>,
}

impl Query {
    pub fn new(collection: CollectionRef) -> Self {
        Self {
            collection,
            filters: Vec::new(),
            limit: None,
        }
    }

    pub fn filter(mut self, field: impl Into<String>, op: FilterOp, value: impl Into<Value>) -> Self {
        self.filters.push(Filter {
            field: field.into(),
            op,
            value: value.into(),
        });
        self
    }

    pub fn where_eq(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filter(field, FilterOp::Eq, value)
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn collection(&self) -> &CollectionRef {
        &self.collection
    }

    pub fn filters(&self) -> &[Filter] {
        &self.filters
    }

    pub fn max_results(&self) -> Option<usize> {
        self.limit
    }

    pub fn matches(&self, reference: &DocRef, data: &Value) -> bool {
        reference.collection_path() == self.collection.path()
            && self.filters.iter().all(|filter| filter.matches(data))
    }
}

impl fmt::Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.collection)?;
        if !self.filters.is_empty() {
            write!(f, " ({} filters)", self.filters.len())?;
        }
        Ok(())
    }
}

/// A document body as delivered by the store, before decoding.
#[derive(Debug, Clone, PartialEq)]
pub struct RawDocument {
    pub reference: DocRef,
    pub data: Value,
    pub read_time: DateTime<Utc>,
}

impl RawDocument {
    pub fn new(reference: DocRef, data: Value) -> Self {
        Self {
            reference,
            data,
            read_time: Utc::now(),
        }
    }

    pub fn id(&self) -> &str {
        self.reference.id()
    }
}

/// State of one document at a point in time; `data` is `None` when the
/// document does not exist.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentSnapshot {
    pub reference: DocRef,
    pub data: Option<Value>,
    pub read_time: DateTime<Utc>,
}

impl DocumentSnapshot {
    pub fn exists(&self) -> bool {
        self.data.is_some()
    }

    pub fn into_raw(self) -> Option<RawDocument> {
        let data = self.data?;
        Some(RawDocument {
            reference: self.reference,
            data,
            read_time: self.read_time,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Added,
    Modified,
    Removed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DocumentChange {
    pub kind: ChangeKind,
    pub document: RawDocument,
}

impl DocumentChange {
    pub fn id(&self) -> &str {
        self.document.id()
    }
}

/// Changes delivered together by a query subscription. The first batch of a
/// subscription carries every matching document as `Added`.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ChangeBatch {
    pub changes: Vec<DocumentChange>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    Set { reference: DocRef, data: Value },
    Update { reference: DocRef, fields: Map<String, Value> },
    Delete { reference: DocRef },
}

impl WriteOp {
    pub fn reference(&self) -> &DocRef {
        match self {
            WriteOp::Set { reference, .. }
            | WriteOp::Update { reference, .. }
            | WriteOp::Delete { reference } => reference,
        }
    }
}

/// Writes queued for a single atomic commit.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteBatch {
    ops: Vec<WriteOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, reference: DocRef, data: Value) -> &mut Self {
        self.ops.push(WriteOp::Set { reference, data });
        self
    }

    pub fn update(&mut self, reference: DocRef, fields: Map<String, Value>) -> &mut Self {
        self.ops.push(WriteOp::Update { reference, fields });
        self
    }

    pub fn delete(&mut self, reference: DocRef) -> &mut Self {
        self.ops.push(WriteOp::Delete { reference });
        self
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn into_ops(self) -> Vec<WriteOp> {
        self.ops
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_doc_ref_parse() {
        let r = DocRef::parse("users/u1/notifications/n9").expect("nested path");
        assert_eq!(r.collection_path(), "users/u1/notifications");
        assert_eq!(r.id(), "n9");

        assert!(DocRef::parse("users").is_none());
        assert!(DocRef::parse("users/").is_none());
        assert!(DocRef::parse("/abc").is_none());
    }

    #[test]
    fn test_doc_ref_serializes_as_path() {
        let r = DocRef::new("users", "alice");
        let encoded = serde_json::to_value(&r).expect("serialize ref");
        assert_eq!(encoded, json!("users/alice"));
        let decoded: DocRef = serde_json::from_value(encoded).expect("deserialize ref");
        assert_eq!(decoded, r);
        assert!(serde_json::from_value::<DocRef>(json!("nope")).is_err());
    }

    #[test]
    fn test_new_doc_ids_are_random() {
        let users = CollectionRef::new("users");
        let a = users.new_doc();
        let b = users.new_doc();
        assert_eq!(a.id().len(), AUTO_ID_LENGTH);
        assert_ne!(a, b);
        assert_eq!(a.collection(), users);
    }

    #[test]
    fn test_query_filters() {
        let users = CollectionRef::new("users");
        let query = users
            .query()
            .where_eq("team", "red")
            .filter("profile.age", FilterOp::Ge, 18)
            .filter("tags", FilterOp::ArrayContains, "admin");

        let reference = users.doc("a");
        let adult_admin = json!({"team": "red", "profile": {"age": 30}, "tags": ["admin"]});
        let minor = json!({"team": "red", "profile": {"age": 12}, "tags": ["admin"]});
        let missing_field = json!({"team": "red", "tags": ["admin"]});

        assert!(query.matches(&reference, &adult_admin));
        assert!(!query.matches(&reference, &minor));
        assert!(!query.matches(&reference, &missing_field));
        assert!(!query.matches(&DocRef::new("teams", "a"), &adult_admin));
    }

    #[test]
    fn test_filter_in_and_cross_type() {
        let filter = Filter {
            field: "status".to_string(),
            op: FilterOp::In,
            value: json!(["open", "pending"]),
        };
        assert!(filter.matches(&json!({"status": "open"})));
        assert!(!filter.matches(&json!({"status": "closed"})));

        let lt = Filter {
            field: "n".to_string(),
            op: FilterOp::Lt,
            value: json!(5),
        };
        assert!(lt.matches(&json!({"n": 1})));
        assert!(!lt.matches(&json!({"n": "1"})));
    }

    #[test]
    fn test_write_batch_collects_ops() {
        let users = CollectionRef::new("users");
        let mut batch = WriteBatch::new();
        batch
            .set(users.doc("a"), json!({"name": "A"}))
            .delete(users.doc("b"));
        assert_eq!(batch.len(), 2);
        let ops = batch.into_ops();
        assert_eq!(ops[1].reference().id(), "b");
    }
}
