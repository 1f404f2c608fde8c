use std::hash::Hasher;

use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHasher};

/// Interned strings of one capture. Keys are set at most once; a conflicting
/// re-insertion under an existing key is ignored, so replaying a stream is
/// idempotent.
#[derive(Debug, Default)]
pub struct StringTable {
    strings: Mutex<FxHashMap<u64, String>>,
}

impl StringTable {
    pub fn add_if_absent(&self, key: u64, value: &str) {
        self.strings
            .lock()
            .entry(key)
            .or_insert_with(|| value.to_string());
    }

    /// Interns a client-generated string (labels the client itself needs),
    /// returning its key. The key is the same content hash the service uses,
    /// so client and wire keys live in one namespace.
    pub fn add_or_get_key(&self, value: &str) -> u64 {
        let mut hasher = FxHasher::default();
        hasher.write(value.as_bytes());
        let key = hasher.finish();
        self.add_if_absent(key, value);
        key
    }

    pub fn get(&self, key: u64) -> Option<String> {
        self.strings.lock().get(&key).cloned()
    }

    pub fn contains(&self, key: u64) -> bool {
        self.strings.lock().contains_key(&key)
    }

    pub fn copy_of_all(&self) -> FxHashMap<u64, String> {
        self.strings.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_set_at_most_once() {
        let table = StringTable::default();
        table.add_if_absent(1, "first");
        table.add_if_absent(1, "second");
        assert_eq!(table.get(1).as_deref(), Some("first"));
    }

    #[test]
    fn client_interning_is_stable() {
        let table = StringTable::default();
        let a = table.add_or_get_key("hw execution");
        let b = table.add_or_get_key("hw execution");
        assert_eq!(a, b);
        assert_eq!(table.get(a).as_deref(), Some("hw execution"));
    }
}
