//! Sorted key/value store: string keys, opaque byte values, binary-search
//! lookup, ordering fixed at construction.

use std::cmp::Ordering;
use std::fmt;

use crate::env;
use crate::error::Result;

/// Key ordering used by a [`Kvs`].
pub trait Comparator {
    fn compare(&self, a: &str, b: &str) -> Ordering;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct CaseSensitive;

impl Comparator for CaseSensitive {
    fn compare(&self, a: &str, b: &str) -> Ordering {
        a.cmp(b)
    }
}

/// ASCII case-insensitive ordering (header-style keys).
#[derive(Debug, Default, Clone, Copy)]
pub struct CaseInsensitive;

impl Comparator for CaseInsensitive {
    fn compare(&self, a: &str, b: &str) -> Ordering {
        a.bytes()
            .map(|c| c.to_ascii_lowercase())
            .cmp(b.bytes().map(|c| c.to_ascii_lowercase()))
    }
}

/// Opaque value. Its size is `data.len()`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Value {
    pub data: Vec<u8>,
}

impl Value {
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// The value as UTF-8 text, if it is valid UTF-8.
    pub fn as_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.data).ok()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub key: String,
    pub value: Value,
}

/// Entries are kept sorted by key under the store's comparator. Setting an
/// existing key overwrites in place; new keys are inserted at their sorted
/// position.
pub struct Kvs {
    entries: Vec<Entry>,
    cmp: Box<dyn Comparator + Send>,
}

impl fmt::Debug for Kvs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.entries.iter().map(|e| (&e.key, &e.value)))
            .finish()
    }
}

impl Default for Kvs {
    fn default() -> Self {
        Kvs::new(0, true)
    }
}

impl Kvs {
    pub fn new(capacity: usize, case_sensitive: bool) -> Self {
        if case_sensitive {
            Kvs::with_comparator(capacity, CaseSensitive)
        } else {
            Kvs::with_comparator(capacity, CaseInsensitive)
        }
    }

    pub fn with_comparator(capacity: usize, cmp: impl Comparator + Send + 'static) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            cmp: Box::new(cmp),
        }
    }

    fn search(&self, key: &str) -> std::result::Result<usize, usize> {
        self.entries
            .binary_search_by(|e| self.cmp.compare(&e.key, key))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.entries.capacity()
    }

    /// Store a copy of `data` under `key`. Key and value copies go through
    /// the environment's allocation hooks; on unrecovered failure the store
    /// is left unchanged and `MEM` is recorded.
    pub fn set(&mut self, key: &str, data: &[u8]) -> Result<()> {
        let mut copy = env::alloc(data.len())?;
        copy.extend_from_slice(data);
        let value = Value { data: copy };
        match self.search(key) {
            Ok(i) => self.entries[i].value = value,
            Err(i) => {
                let key = env::dup(key)?;
                if self.entries.len() == self.entries.capacity() {
                    let grow = self.entries.capacity().max(1);
                    self.entries.reserve_exact(grow);
                }
                self.entries.insert(i, Entry { key, value });
            }
        }
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.search(key).ok().map(|i| &self.entries[i].value)
    }

    pub fn set_str(&mut self, key: &str, value: &str) -> Result<()> {
        self.set(key, value.as_bytes())
    }

    /// The value for `key` as text; `None` if absent or not UTF-8.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.search(key).is_ok()
    }

    /// Returns whether an entry was removed.
    pub fn remove(&mut self, key: &str) -> bool {
        match self.search(key) {
            Ok(i) => {
                self.entries.remove(i);
                true
            }
            Err(_) => false,
        }
    }

    /// Remove every entry, keeping capacity.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Entries in key order.
    pub fn iter(&self) -> impl Iterator<Item = &Entry> {
        self.entries.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::{AllocHooks, Environment};
    use crate::error::{AllocError, Error, ErrorCode};
    use rand::seq::SliceRandom;
    use rand::Rng;

    fn is_sorted(m: &Kvs, cmp: &dyn Comparator) -> bool {
        let keys: Vec<&str> = m.iter().map(|e| e.key.as_str()).collect();
        keys.windows(2)
            .all(|w| cmp.compare(w[0], w[1]) == Ordering::Less)
    }

    #[test]
    fn set_get_remove() {
        let mut m = Kvs::new(2, true);
        m.set("b", b"two").unwrap();
        m.set("a", b"one").unwrap();
        m.set("c", b"three").unwrap();
        assert_eq!(m.len(), 3);
        assert_eq!(m.get("a").unwrap().data, b"one");
        assert_eq!(m.get("c").unwrap().size(), 5);
        assert!(m.get("d").is_none());

        assert!(m.remove("b"));
        assert!(!m.remove("b"));
        assert!(m.get("b").is_none());
        assert_eq!(m.len(), 2);
        assert!(is_sorted(&m, &CaseSensitive));
    }

    #[test]
    fn overwrite_does_not_grow() {
        let mut m = Kvs::new(4, true);
        m.set_str("key", "v1").unwrap();
        m.set_str("other", "x").unwrap();
        m.set_str("key", "v2").unwrap();
        assert_eq!(m.len(), 2);
        assert_eq!(m.get_str("key"), Some("v2"));
    }

    #[test]
    fn capacity_doubles_when_full() {
        let mut m = Kvs::new(2, true);
        m.set_str("a", "1").unwrap();
        m.set_str("b", "2").unwrap();
        let cap = m.capacity();
        m.set_str("c", "3").unwrap();
        assert!(m.capacity() >= cap * 2);
        assert!(m.len() <= m.capacity());
    }

    #[test]
    fn random_sequences_stay_sorted() {
        let mut rng = rand::thread_rng();
        let mut keys: Vec<String> = (0..200).map(|i| format!("key-{i:03}")).collect();
        keys.shuffle(&mut rng);
        let mut m = Kvs::new(0, true);
        for (i, k) in keys.iter().enumerate() {
            m.set(k, &i.to_le_bytes()).unwrap();
            assert!(is_sorted(&m, &CaseSensitive));
        }
        assert_eq!(m.len(), keys.len());
        for (i, k) in keys.iter().enumerate() {
            assert_eq!(m.get(k).unwrap().data, i.to_le_bytes());
        }
        for k in keys.iter().filter(|_| rng.gen_bool(0.5)) {
            assert!(m.remove(k));
            assert!(m.get(k).is_none());
            assert!(is_sorted(&m, &CaseSensitive));
        }
    }

    #[test]
    fn case_insensitive_keys() {
        let mut m = Kvs::new(0, false);
        m.set_str("Content-Type", "text/plain").unwrap();
        m.set_str("content-type", "application/json").unwrap();
        m.set_str("Accept", "*/*").unwrap();
        assert_eq!(m.len(), 2);
        assert_eq!(m.get_str("CONTENT-TYPE"), Some("application/json"));
        assert!(m.contains_key("accept"));
        assert!(is_sorted(&m, &CaseInsensitive));

        let mut strict = Kvs::new(0, true);
        strict.set_str("Content-Type", "a").unwrap();
        strict.set_str("content-type", "b").unwrap();
        assert_eq!(strict.len(), 2);
        assert!(strict.get("CONTENT-TYPE").is_none());
    }

    #[test]
    fn clear_keeps_capacity() {
        let mut m = Kvs::new(0, true);
        for i in 0..10 {
            m.set_str(&i.to_string(), "x").unwrap();
        }
        let cap = m.capacity();
        m.clear();
        assert!(m.is_empty());
        assert_eq!(m.capacity(), cap);
        assert!(m.get("3").is_none());
    }

    #[test]
    fn non_utf8_value() {
        let mut m = Kvs::default();
        m.set("blob", &[0xff, 0xfe]).unwrap();
        assert!(m.get_str("blob").is_none());
        assert_eq!(m.get("blob").unwrap().size(), 2);
    }

    /// Fails every key copy; value copies still succeed.
    struct NoDup;

    impl AllocHooks for NoDup {
        fn dup(&self, s: &str) -> std::result::Result<String, AllocError> {
            Err(AllocError { requested: s.len() })
        }
    }

    #[test]
    fn key_copy_failure_leaves_store_unchanged() {
        env::init(Environment::builder().alloc_hooks(NoDup).build());
        let mut m = Kvs::new(0, true);
        let err = m.set_str("fresh", "value").unwrap_err();
        assert!(matches!(err, Error::Memory(_)));
        assert_eq!(env::last_error().code, ErrorCode::MEM);
        assert!(m.is_empty());
        env::cleanup();
    }

    /// Recovers failed key copies with a fixed replacement.
    struct FallbackDup;

    impl AllocHooks for FallbackDup {
        fn dup(&self, s: &str) -> std::result::Result<String, AllocError> {
            Err(AllocError { requested: s.len() })
        }

        fn dup_failed(&self, _s: &str) -> Option<String> {
            Some("fallback".to_string())
        }
    }

    #[test]
    fn key_copy_goes_through_dup_hook() {
        env::init(Environment::builder().alloc_hooks(FallbackDup).build());
        let mut m = Kvs::new(0, true);
        m.set_str("original", "v").unwrap();
        assert!(m.get("original").is_none());
        assert_eq!(m.get_str("fallback"), Some("v"));
        env::cleanup();
    }

    struct NoAlloc;

    impl AllocHooks for NoAlloc {
        fn alloc(&self, size: usize) -> std::result::Result<Vec<u8>, AllocError> {
            Err(AllocError { requested: size })
        }
    }

    #[test]
    fn value_copy_failure_keeps_old_value() {
        let mut m = Kvs::new(0, true);
        m.set_str("k", "old").unwrap();
        env::init(Environment::builder().alloc_hooks(NoAlloc).build());
        assert!(matches!(m.set_str("k", "new"), Err(Error::Memory(_))));
        assert_eq!(m.get_str("k"), Some("old"));
        env::cleanup();
    }
}
