//! In-memory store

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use super::{Persistence, StoreError};

/// Cell and list tables shared by the in-memory and WAL backends
#[derive(Default)]
pub(super) struct Tables {
    cells: FxHashMap<String, Vec<u8>>,
    lists: FxHashMap<String, Vec<Vec<u8>>>,
}

impl Tables {
    pub(super) fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.cells.get(key).cloned()
    }

    pub(super) fn set(&mut self, key: &str, value: Vec<u8>) {
        self.cells.insert(key.to_string(), value);
    }

    pub(super) fn append(&mut self, key: &str, value: Vec<u8>) -> usize {
        let list = self.lists.entry(key.to_string()).or_default();
        list.push(value);
        list.len()
    }

    pub(super) fn list(&self, key: &str) -> Vec<Vec<u8>> {
        self.lists.get(key).cloned().unwrap_or_default()
    }

    pub(super) fn list_len(&self, key: &str) -> usize {
        self.lists.get(key).map_or(0, Vec::len)
    }

    /// Cells in key order
    pub(super) fn cells(&self) -> Vec<(&String, &Vec<u8>)> {
        let mut cells: Vec<_> = self.cells.iter().collect();
        cells.sort_by(|a, b| a.0.cmp(b.0));
        cells
    }

    /// Lists in key order
    pub(super) fn lists(&self) -> Vec<(&String, &Vec<Vec<u8>>)> {
        let mut lists: Vec<_> = self.lists.iter().collect();
        lists.sort_by(|a, b| a.0.cmp(b.0));
        lists
    }

    /// Number of live values: one per cell plus one per list record
    pub(super) fn record_count(&self) -> u64 {
        (self.cells.len() + self.lists.values().map(Vec::len).sum::<usize>()) as u64
    }

    pub(super) fn truncate(&mut self, key: &str, len: usize) {
        if let Some(list) = self.lists.get_mut(key) {
            list.truncate(len);
        }
    }
}

/// Volatile store backed by hash maps
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Persistence for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.tables.lock().get(key))
    }

    fn set(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError> {
        self.tables.lock().set(key, value);
        Ok(())
    }

    fn append(&self, key: &str, value: Vec<u8>) -> Result<usize, StoreError> {
        Ok(self.tables.lock().append(key, value))
    }

    fn list(&self, key: &str) -> Result<Vec<Vec<u8>>, StoreError> {
        Ok(self.tables.lock().list(key))
    }

    fn truncate(&self, key: &str, len: usize) -> Result<(), StoreError> {
        self.tables.lock().truncate(key, len);
        Ok(())
    }
}
