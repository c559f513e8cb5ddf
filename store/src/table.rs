//! The single-table seam every store operation is written against.
//!
//! The model follows a typical partitioned key-value store: items are
//! addressed by `(pk, sk)`, carry a flat attribute map, and can be written
//! conditionally, in bounded all-or-nothing transactions, or deleted in
//! bounded batches. Queries scan one partition in sort-key order.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashSet;

pub type Attributes = serde_json::Map<String, Value>;

/// Maximum number of operations in one transaction.
pub const TRANSACTION_LIMIT: usize = 100;
/// Maximum number of keys in one batch delete.
pub const BATCH_DELETE_LIMIT: usize = 25;

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Key {
    pub pk: String,
    pub sk: String,
}

impl Key {
    pub fn new<P: Into<String>, S: Into<String>>(pk: P, sk: S) -> Self {
        Key {
            pk: pk.into(),
            sk: sk.into(),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Item {
    pub key: Key,
    pub attributes: Attributes,
}

/// Precondition evaluated against the current state of the targeted item.
#[derive(Clone, Debug, PartialEq)]
pub enum Condition {
    KeyNotExists,
    KeyExists,
    AttrNotExists(String),
    /// The numeric attribute exists and is strictly less than the value.
    LessThan(String, i64),
    And(Box<Condition>, Box<Condition>),
    Or(Box<Condition>, Box<Condition>),
}

impl Condition {
    pub fn and(self, other: Condition) -> Condition {
        Condition::And(Box::new(self), Box::new(other))
    }

    pub fn or(self, other: Condition) -> Condition {
        Condition::Or(Box::new(self), Box::new(other))
    }

    pub fn evaluate(&self, current: Option<&Attributes>) -> bool {
        match self {
            Condition::KeyNotExists => current.is_none(),
            Condition::KeyExists => current.is_some(),
            Condition::AttrNotExists(name) => current.is_none_or(|attrs| !attrs.contains_key(name)),
            Condition::LessThan(name, value) => current
                .and_then(|attrs| attrs.get(name))
                .and_then(Value::as_i64)
                .is_some_and(|current| current < *value),
            Condition::And(a, b) => a.evaluate(current) && b.evaluate(current),
            Condition::Or(a, b) => a.evaluate(current) || b.evaluate(current),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum WriteOp {
    /// Replaces the whole item.
    Put {
        item: Item,
        condition: Option<Condition>,
    },
    /// Modifies individual attributes, creating the item when it is missing.
    /// `add` increments numeric attributes, treating absent ones as zero.
    Update {
        key: Key,
        set: Attributes,
        add: Vec<(String, i64)>,
        remove: Vec<String>,
        condition: Option<Condition>,
    },
    Delete {
        key: Key,
        condition: Option<Condition>,
    },
}

impl WriteOp {
    pub fn put(key: Key, attributes: Attributes) -> Self {
        WriteOp::Put {
            item: Item { key, attributes },
            condition: None,
        }
    }

    /// Put guarded by "key does not already exist".
    pub fn insert(key: Key, attributes: Attributes) -> Self {
        WriteOp::Put {
            item: Item { key, attributes },
            condition: Some(Condition::KeyNotExists),
        }
    }

    /// Update that only sets attributes. Attributes it does not name are left alone.
    pub fn upsert(key: Key, set: Attributes) -> Self {
        WriteOp::Update {
            key,
            set,
            add: Vec::new(),
            remove: Vec::new(),
            condition: None,
        }
    }

    pub fn increment(key: Key, add: Vec<(String, i64)>) -> Self {
        WriteOp::Update {
            key,
            set: Attributes::new(),
            add,
            remove: Vec::new(),
            condition: None,
        }
    }

    pub fn delete(key: Key) -> Self {
        WriteOp::Delete {
            key,
            condition: None,
        }
    }

    pub fn with_condition(mut self, new: Condition) -> Self {
        match &mut self {
            WriteOp::Put { condition, .. }
            | WriteOp::Update { condition, .. }
            | WriteOp::Delete { condition, .. } => *condition = Some(new),
        }
        self
    }

    pub fn key(&self) -> &Key {
        match self {
            WriteOp::Put { item, .. } => &item.key,
            WriteOp::Update { key, .. } | WriteOp::Delete { key, .. } => key,
        }
    }

    pub fn condition(&self) -> Option<&Condition> {
        match self {
            WriteOp::Put { condition, .. }
            | WriteOp::Update { condition, .. }
            | WriteOp::Delete { condition, .. } => condition.as_ref(),
        }
    }

    /// The targeted item after this operation, given its current attributes.
    /// None means the item is gone. Conditions are not checked here.
    pub fn apply(self, current: Option<Attributes>) -> (Key, Option<Attributes>) {
        match self {
            WriteOp::Put { item, .. } => (item.key, Some(item.attributes)),
            WriteOp::Update {
                key,
                set,
                add,
                remove,
                ..
            } => {
                let mut attributes = current.unwrap_or_default();
                for (name, value) in set {
                    attributes.insert(name, value);
                }
                for (name, delta) in add {
                    let current = attributes.get(&name).and_then(Value::as_i64).unwrap_or(0);
                    attributes.insert(name, Value::from(current + delta));
                }
                for name in remove {
                    attributes.remove(&name);
                }
                (key, Some(attributes))
            }
            WriteOp::Delete { key, .. } => (key, None),
        }
    }
}

/// Sort-key restriction of a partition query.
#[derive(Clone, Debug, PartialEq)]
pub enum SortKeyRange {
    All,
    BeginsWith(String),
    /// Inclusive on both ends.
    Between(String, String),
}

impl SortKeyRange {
    pub fn contains(&self, sk: &str) -> bool {
        match self {
            SortKeyRange::All => true,
            SortKeyRange::BeginsWith(prefix) => sk.starts_with(prefix.as_str()),
            SortKeyRange::Between(low, high) => low.as_str() <= sk && sk <= high.as_str(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Order {
    Ascending,
    Descending,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CancelReason {
    None,
    ConditionalCheckFailed,
}

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum TableError {
    #[error("conditional check failed")]
    ConditionalCheckFailed,
    #[error("transaction canceled: {reasons:?}")]
    TransactionCanceled { reasons: Vec<CancelReason> },
    #[error("{operation} accepts at most {limit} items, got {count}")]
    TooManyItems {
        operation: &'static str,
        count: usize,
        limit: usize,
    },
    #[error("invalid request: {0}")]
    Validation(String),
    #[error("table unavailable: {0}")]
    Unavailable(String),
}

impl TableError {
    /// Index of the first transaction item whose condition failed.
    pub fn failed_item(&self) -> Option<usize> {
        match self {
            TableError::TransactionCanceled { reasons } => reasons
                .iter()
                .position(|r| *r == CancelReason::ConditionalCheckFailed),
            _ => None,
        }
    }

    pub fn is_condition_failure(&self) -> bool {
        matches!(self, TableError::ConditionalCheckFailed) || self.failed_item().is_some()
    }
}

#[async_trait]
pub trait Table: Send + Sync {
    async fn get(&self, key: &Key) -> Result<Option<Attributes>, TableError>;

    /// Applies one operation, failing with `ConditionalCheckFailed` when its
    /// condition does not hold.
    async fn write(&self, op: WriteOp) -> Result<(), TableError>;

    /// Applies every operation or none. At most [`TRANSACTION_LIMIT`]
    /// operations, each on a distinct key.
    async fn transact(&self, ops: Vec<WriteOp>) -> Result<(), TableError>;

    async fn query(
        &self,
        pk: &str,
        range: SortKeyRange,
        order: Order,
    ) -> Result<Vec<Item>, TableError>;

    /// Deletes up to [`BATCH_DELETE_LIMIT`] keys. Missing keys are ignored.
    async fn batch_delete(&self, keys: Vec<Key>) -> Result<(), TableError>;
}

/// Rejects transactions the provider would refuse before touching any item.
pub fn validate_transaction(ops: &[WriteOp]) -> Result<(), TableError> {
    if ops.len() > TRANSACTION_LIMIT {
        return Err(TableError::TooManyItems {
            operation: "transaction",
            count: ops.len(),
            limit: TRANSACTION_LIMIT,
        });
    }
    let mut seen = HashSet::with_capacity(ops.len());
    for op in ops {
        if !seen.insert(op.key()) {
            return Err(TableError::Validation(format!(
                "transaction touches {}/{} more than once",
                op.key().pk,
                op.key().sk
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn attrs(value: Value) -> Attributes {
        match value {
            Value::Object(map) => map,
            _ => panic!("not an object"),
        }
    }

    #[test]
    fn test_conditions() {
        let lock = attrs(json!({ "locked_until": 100 }));

        assert!(Condition::KeyNotExists.evaluate(None));
        assert!(!Condition::KeyNotExists.evaluate(Some(&lock)));
        assert!(Condition::KeyExists.evaluate(Some(&lock)));

        assert!(Condition::LessThan("locked_until".into(), 101).evaluate(Some(&lock)));
        assert!(!Condition::LessThan("locked_until".into(), 100).evaluate(Some(&lock)));
        assert!(!Condition::LessThan("missing".into(), 101).evaluate(Some(&lock)));
        assert!(!Condition::LessThan("locked_until".into(), 101).evaluate(None));

        assert!(Condition::AttrNotExists("missing".into()).evaluate(Some(&lock)));
        assert!(Condition::AttrNotExists("missing".into()).evaluate(None));
        assert!(!Condition::AttrNotExists("locked_until".into()).evaluate(Some(&lock)));

        let acquire = Condition::KeyNotExists.or(Condition::LessThan("locked_until".into(), 150));
        assert!(acquire.evaluate(None));
        assert!(acquire.evaluate(Some(&lock)));
        let both = Condition::KeyExists.and(Condition::LessThan("locked_until".into(), 50));
        assert!(!both.evaluate(Some(&lock)));
    }

    #[test]
    fn test_sort_key_range() {
        assert!(SortKeyRange::All.contains("anything"));
        assert!(SortKeyRange::BeginsWith("lap#1001#".into()).contains("lap#1001#0001"));
        assert!(!SortKeyRange::BeginsWith("lap#1001#".into()).contains("lap#10011#0001"));

        let range = SortKeyRange::Between("session#2000".into(), "session#3999".into());
        assert!(range.contains("session#2000"));
        assert!(range.contains("session#3000"));
        assert!(!range.contains("session#4000"));
        assert!(!range.contains("session#1000"));
    }

    #[test]
    fn test_validate_transaction() {
        let op = |sk: &str| WriteOp::put(Key::new("p", sk), Attributes::new());

        let ops: Vec<WriteOp> = (0..=TRANSACTION_LIMIT).map(|i| op(&i.to_string())).collect();
        assert_eq!(
            validate_transaction(&ops),
            Err(TableError::TooManyItems {
                operation: "transaction",
                count: 101,
                limit: 100
            })
        );
        assert!(validate_transaction(&ops[..100]).is_ok());
        assert!(matches!(
            validate_transaction(&[op("a"), op("a")]),
            Err(TableError::Validation(_))
        ));
    }

    #[test]
    fn test_failed_item() {
        let err = TableError::TransactionCanceled {
            reasons: vec![CancelReason::None, CancelReason::ConditionalCheckFailed],
        };
        assert_eq!(err.failed_item(), Some(1));
        assert!(err.is_condition_failure());
        assert!(!TableError::Unavailable("down".into()).is_condition_failure());
    }
}
