use std::collections::BTreeMap;
use std::sync::RwLock;

use crate::types::{Key, Value};

use super::backend::RowStorage;

/// In-memory committed-row backing. The ordered map gives snapshots their
/// stable scan order for free.
#[derive(Debug, Default)]
pub struct MemoryRowStorage {
    rows: RwLock<BTreeMap<Key, Value>>,
}

impl MemoryRowStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RowStorage for MemoryRowStorage {
    fn read(&self, key: &Key) -> Option<Value> {
        self.rows.read().expect("row map poisoned").get(key).cloned()
    }

    fn write(&self, key: Key, value: Value) {
        self.rows
            .write()
            .expect("row map poisoned")
            .insert(key, value);
    }

    fn erase(&self, key: &Key) {
        self.rows.write().expect("row map poisoned").remove(key);
    }

    fn scan(&self) -> Vec<(Key, Value)> {
        self.rows
            .read()
            .expect("row map poisoned")
            .iter()
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect()
    }

    fn clear(&self) {
        self.rows.write().expect("row map poisoned").clear();
    }

    fn len(&self) -> usize {
        self.rows.read().expect("row map poisoned").len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_read_erase_round_trip() {
        let storage = MemoryRowStorage::new();
        storage.write(b"a".to_vec(), b"1".to_vec());
        assert_eq!(storage.read(&b"a".to_vec()), Some(b"1".to_vec()));

        storage.erase(&b"a".to_vec());
        assert_eq!(storage.read(&b"a".to_vec()), None);
        assert!(storage.is_empty());
    }

    #[test]
    fn scan_is_key_ordered() {
        let storage = MemoryRowStorage::new();
        storage.write(b"b".to_vec(), b"2".to_vec());
        storage.write(b"a".to_vec(), b"1".to_vec());
        storage.write(b"c".to_vec(), b"3".to_vec());

        let keys: Vec<Key> = storage.scan().into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
    }
}
