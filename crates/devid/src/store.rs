//! In-memory key-value state visible to the sandboxed script.
//!
//! Nothing here is ever persisted: a [`BrowserState`] is created empty for a
//! run and dropped with it.

use std::cell::RefCell;
use std::rc::Rc;

/// Insertion-ordered string map.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyValueStore {
    entries: Vec<(String, String)>,
}

impl KeyValueStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Value stored under `key`.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Store `value` under `key`, keeping the key's original position.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    /// Remove `key`, returning its value.
    pub fn remove(&mut self, key: &str) -> Option<String> {
        let idx = self.entries.iter().position(|(k, _)| k == key)?;
        Some(self.entries.remove(idx).1)
    }

    /// Remove every entry.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Key at position `index`.
    #[must_use]
    pub fn key(&self, index: usize) -> Option<&str> {
        self.entries.get(index).map(|(k, _)| k.as_str())
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate over entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// Mutable browser state shared by the storage and cookie accessors.
///
/// Cheap to clone; clones share the same underlying stores. Only ever used
/// from the single script thread.
#[derive(Debug, Clone, Default)]
pub struct BrowserState {
    storage: Rc<RefCell<KeyValueStore>>,
    cookies: Rc<RefCell<KeyValueStore>>,
}

impl BrowserState {
    /// Fresh, empty state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Backing store for `localStorage` and `sessionStorage`.
    #[must_use]
    pub fn storage(&self) -> &Rc<RefCell<KeyValueStore>> {
        &self.storage
    }

    /// Backing store for `document.cookie`.
    #[must_use]
    pub fn cookies(&self) -> &Rc<RefCell<KeyValueStore>> {
        &self.cookies
    }

    /// Render the cookie jar the way `document.cookie` reads it.
    #[must_use]
    pub fn cookie_header(&self) -> String {
        self.cookies
            .borrow()
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("; ")
    }

    /// Apply a `document.cookie = "..."` assignment.
    ///
    /// Only the leading `name=value` pair is stored; attributes such as
    /// `path` or `expires` are ignored. Assignments without `=` or with an
    /// empty name are dropped.
    pub fn assign_cookie(&self, assignment: &str) {
        let pair = assignment.split(';').next().unwrap_or_default();
        let Some((name, value)) = pair.split_once('=') else {
            return;
        };
        let name = name.trim();
        if name.is_empty() {
            return;
        }
        self.cookies.borrow_mut().set(name, value.trim());
    }
}
