use std::collections::HashSet;
use std::sync::{Arc, Mutex};

/// Keys of local pushes currently running. One coarse lock guards the whole set;
/// holding an [`InflightGuard`] is the only way a key is present.
#[derive(Clone, Default)]
pub struct InflightSet {
    keys: Arc<Mutex<HashSet<String>>>,
}

impl InflightSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// `None` when another push already owns the key
    pub fn try_acquire(&self, key: &str) -> Option<InflightGuard> {
        let mut keys = self.keys.lock().unwrap_or_else(|e| e.into_inner());
        if !keys.insert(key.to_string()) {
            return None;
        }
        Some(InflightGuard {
            keys: self.keys.clone(),
            key: key.to_string(),
        })
    }

    pub fn contains(&self, key: &str) -> bool {
        self.keys
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(key)
    }

    pub fn len(&self) -> usize {
        self.keys.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Removes its key from the set when dropped, whatever path the push took
pub struct InflightGuard {
    keys: Arc<Mutex<HashSet<String>>>,
    key: String,
}

impl InflightGuard {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.keys
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.key);
    }
}
