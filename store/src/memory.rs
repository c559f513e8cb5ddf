use crate::table::{
    Attributes, BATCH_DELETE_LIMIT, CancelReason, Item, Key, Order, SortKeyRange, Table,
    TableError, WriteOp, validate_transaction,
};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::BTreeMap;

type Partitions = BTreeMap<String, BTreeMap<String, Attributes>>;

/// In-process table. Every operation runs under one lock, so transactions
/// are trivially atomic and isolated.
#[derive(Default)]
pub struct MemoryTable {
    partitions: RwLock<Partitions>,
}

impl MemoryTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of items in a partition.
    pub fn partition_len(&self, pk: &str) -> usize {
        self.partitions.read().get(pk).map_or(0, BTreeMap::len)
    }
}

fn lookup<'a>(partitions: &'a Partitions, key: &Key) -> Option<&'a Attributes> {
    partitions.get(&key.pk).and_then(|items| items.get(&key.sk))
}

fn check(partitions: &Partitions, ops: &[WriteOp]) -> Vec<CancelReason> {
    ops.iter()
        .map(|op| match op.condition() {
            Some(condition) if !condition.evaluate(lookup(partitions, op.key())) => {
                CancelReason::ConditionalCheckFailed
            }
            _ => CancelReason::None,
        })
        .collect()
}

fn apply(partitions: &mut Partitions, op: WriteOp) {
    let current = match &op {
        WriteOp::Update { key, .. } => lookup(partitions, key).cloned(),
        _ => None,
    };
    match op.apply(current) {
        (key, Some(attributes)) => {
            partitions.entry(key.pk).or_default().insert(key.sk, attributes);
        }
        (key, None) => remove(partitions, &key),
    }
}

fn remove(partitions: &mut Partitions, key: &Key) {
    if let Some(items) = partitions.get_mut(&key.pk) {
        items.remove(&key.sk);
        if items.is_empty() {
            partitions.remove(&key.pk);
        }
    }
}

#[async_trait]
impl Table for MemoryTable {
    async fn get(&self, key: &Key) -> Result<Option<Attributes>, TableError> {
        Ok(lookup(&self.partitions.read(), key).cloned())
    }

    async fn write(&self, op: WriteOp) -> Result<(), TableError> {
        let mut partitions = self.partitions.write();
        let ops = [op];
        if check(&partitions, &ops)[0] == CancelReason::ConditionalCheckFailed {
            return Err(TableError::ConditionalCheckFailed);
        }
        let [op] = ops;
        apply(&mut partitions, op);
        Ok(())
    }

    async fn transact(&self, ops: Vec<WriteOp>) -> Result<(), TableError> {
        validate_transaction(&ops)?;

        let mut partitions = self.partitions.write();
        let reasons = check(&partitions, &ops);
        if reasons.contains(&CancelReason::ConditionalCheckFailed) {
            return Err(TableError::TransactionCanceled { reasons });
        }
        for op in ops {
            apply(&mut partitions, op);
        }
        Ok(())
    }

    async fn query(
        &self,
        pk: &str,
        range: SortKeyRange,
        order: Order,
    ) -> Result<Vec<Item>, TableError> {
        let partitions = self.partitions.read();
        let Some(items) = partitions.get(pk) else {
            return Ok(Vec::new());
        };

        let mut matched: Vec<Item> = items
            .iter()
            .filter(|(sk, _)| range.contains(sk))
            .map(|(sk, attributes)| Item {
                key: Key::new(pk, sk.clone()),
                attributes: attributes.clone(),
            })
            .collect();

        if order == Order::Descending {
            matched.reverse();
        }
        Ok(matched)
    }

    async fn batch_delete(&self, keys: Vec<Key>) -> Result<(), TableError> {
        if keys.len() > BATCH_DELETE_LIMIT {
            return Err(TableError::TooManyItems {
                operation: "batch delete",
                count: keys.len(),
                limit: BATCH_DELETE_LIMIT,
            });
        }

        let mut partitions = self.partitions.write();
        for key in &keys {
            remove(&mut partitions, key);
        }
        Ok(())
    }
}
