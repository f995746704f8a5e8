use std::collections::BTreeMap;
use std::sync::RwLock;

use crate::{Column, KeyValueStore, PrefixVisitor, StoreError, WriteBatch, WriteOp};

type MemoryStoreMap = BTreeMap<(Column, Vec<u8>), Vec<u8>>;

#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<MemoryStoreMap>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let guard = self.inner.read().expect("memory store lock");
        Ok(guard.get(&(column, key.to_vec())).cloned())
    }

    fn put(&self, column: Column, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        let mut guard = self.inner.write().expect("memory store lock");
        guard.insert((column, key.to_vec()), value.to_vec());
        Ok(())
    }

    fn delete(&self, column: Column, key: &[u8]) -> Result<(), StoreError> {
        let mut guard = self.inner.write().expect("memory store lock");
        guard.remove(&(column, key.to_vec()));
        Ok(())
    }

    fn scan_prefix(
        &self,
        column: Column,
        prefix: &[u8],
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError> {
        let guard = self.inner.read().expect("memory store lock");
        let mut results = Vec::new();
        for ((entry_column, key), value) in guard.iter() {
            if *entry_column == column && key.starts_with(prefix) {
                results.push((key.clone(), value.clone()));
            }
        }
        Ok(results)
    }

    fn for_each_prefix<'a>(
        &self,
        column: Column,
        prefix: &[u8],
        visitor: &mut PrefixVisitor<'a>,
    ) -> Result<(), StoreError> {
        let guard = self.inner.read().expect("memory store lock");
        for ((entry_column, key), value) in guard.iter() {
            if *entry_column == column && key.starts_with(prefix) {
                visitor(key.as_slice(), value.as_slice())?;
            }
        }
        Ok(())
    }

    fn write_batch(&self, batch: &WriteBatch) -> Result<(), StoreError> {
        let mut guard = self.inner.write().expect("memory store lock");
        for op in batch.iter() {
            match op {
                WriteOp::Put { column, key, value } => {
                    guard.insert(
                        (*column, key.as_slice().to_vec()),
                        value.as_slice().to_vec(),
                    );
                }
                WriteOp::Delete { column, key } => {
                    guard.remove(&(*column, key.as_slice().to_vec()));
                }
            }
        }
        Ok(())
    }

    fn clear(&self) -> Result<(), StoreError> {
        let mut guard = self.inner.write().expect("memory store lock");
        guard.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_applies_in_order() {
        let store = MemoryStore::new();
        let mut batch = WriteBatch::new();
        batch.put(Column::Meta, b"k", b"first");
        batch.put(Column::Meta, b"k", b"second");
        batch.delete(Column::Meta, b"absent");
        store.write_batch(&batch).expect("batch");
        assert_eq!(
            store.get(Column::Meta, b"k").expect("get"),
            Some(b"second".to_vec())
        );
    }

    #[test]
    fn columns_are_isolated() {
        let store = MemoryStore::new();
        store.put(Column::Block, b"k", b"b").expect("put");
        store.put(Column::Utxo, b"k", b"u").expect("put");
        assert_eq!(
            store.get(Column::Block, b"k").expect("get"),
            Some(b"b".to_vec())
        );
        assert_eq!(
            store.get(Column::Utxo, b"k").expect("get"),
            Some(b"u".to_vec())
        );
        assert!(store.get(Column::Undo, b"k").expect("get").is_none());
    }

    #[test]
    fn clear_empties_every_column() {
        let store = MemoryStore::new();
        for column in Column::ALL {
            store.put(column, b"k", b"v").expect("put");
        }
        store.clear().expect("clear");
        for column in Column::ALL {
            assert!(store.get(column, b"k").expect("get").is_none());
        }
    }
}
