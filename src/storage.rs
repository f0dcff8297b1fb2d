//! The persistence seam: an opaque key-value mapping with prefix iteration.
//!
//! Keys are ASCII strings (`block:<hex>`, `chainTip`, ...); values are raw
//! encodings. The chain manager is written against [ChainStore] only, so a
//! disk-backed store can be dropped in without touching the core.

use std::collections::BTreeMap;

pub trait ChainStore {
    fn put(&mut self, key: &str, value: Vec<u8>);
    fn get(&self, key: &str) -> Option<Vec<u8>>;
    fn delete(&mut self, key: &str);
    /// Iterates entries whose keys start with `prefix`, in key order.
    fn iter_prefix<'a>(
        &'a self, prefix: &'a str,
    ) -> Box<dyn Iterator<Item = (String, Vec<u8>)> + 'a>;
}

/// In-memory store over an ordered map; the reference implementation and
/// the test double.
#[derive(Default)]
pub struct MemStore {
    map: BTreeMap<String, Vec<u8>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

impl ChainStore for MemStore {
    fn put(&mut self, key: &str, value: Vec<u8>) {
        self.map.insert(key.to_string(), value);
    }

    fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.map.get(key).cloned()
    }

    fn delete(&mut self, key: &str) {
        self.map.remove(key);
    }

    fn iter_prefix<'a>(
        &'a self, prefix: &'a str,
    ) -> Box<dyn Iterator<Item = (String, Vec<u8>)> + 'a> {
        Box::new(
            self.map
                .range(prefix.to_string()..)
                .take_while(move |(k, _)| k.starts_with(prefix))
                .map(|(k, v)| (k.clone(), v.clone())),
        )
    }
}
