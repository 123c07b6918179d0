use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::message::Message;
use crate::pipeline::Outbound;
use crate::session::Sessions;

/// Minted keys remembered once their referent is gone.
pub const MINTED_KEYS_KEPT: usize = 1 << 16;

/// Web-keys this vat minted for references that do not survive revival.
/// A request naming one of them after revival is answered as gone instead
/// of as never having existed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MintedKeys {
    /// Oldest first. Keys are never minted twice.
    keys: VecDeque<String>,
}

impl MintedKeys {
    pub fn insert(&mut self, key: &str) {
        self.keys.push_back(key.to_string());
        while self.keys.len() > MINTED_KEYS_KEPT {
            self.keys.pop_front();
        }
    }

    /// Linear; only asked about keys missing from the live export table.
    pub fn contains(&self, key: &str) -> bool {
        self.keys.iter().any(|k| k == key)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// Persistent state of a vat. Everything else a vat holds is rebuilt on
/// revival.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Root {
    pub outbound: Outbound<Message>,
    pub sessions: Sessions,
    #[serde(default)]
    bindings: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub minted: MintedKeys,
}

impl Root {
    pub fn fetch(&self, name: &str) -> Option<&serde_json::Value> {
        self.bindings.get(name)
    }

    pub fn link(&mut self, name: &str, value: serde_json::Value) {
        self.bindings.insert(name.to_string(), value);
    }
}

/// Durable home of a vat's [`Root`].
pub trait Store: Send {
    fn load(&self) -> anyhow::Result<Option<Root>>;
    fn save(&mut self, root: &Root) -> anyhow::Result<()>;
}

/// Keeps the image in memory. Clones share the image, so a test can drop a
/// vat and revive it from the same store.
#[derive(Clone, Default)]
pub struct MemoryStore {
    image: Arc<Mutex<Option<String>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn image(&self) -> Option<String> {
        self.image.lock().clone()
    }
}

impl Store for MemoryStore {
    fn load(&self) -> anyhow::Result<Option<Root>> {
        match self.image.lock().as_deref() {
            Some(raw) => Ok(Some(serde_json::from_str(raw)?)),
            None => Ok(None),
        }
    }

    fn save(&mut self, root: &Root) -> anyhow::Result<()> {
        let raw = serde_json::to_string(root)?;
        *self.image.lock() = Some(raw);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn memory_store_shares_image_between_clones() {
        let mut store = MemoryStore::new();
        assert!(store.load().unwrap().is_none());
        let mut root = Root::default();
        root.link("drum", json!("K1"));
        store.save(&root).unwrap();
        let revived = store.clone().load().unwrap().unwrap();
        assert_eq!(revived.fetch("drum"), Some(&json!("K1")));
        assert_eq!(revived, root);
    }

    #[test]
    fn minted_keys_keep_the_newest() {
        let mut minted = MintedKeys::default();
        for i in 0..=MINTED_KEYS_KEPT {
            minted.insert(&i.to_string());
        }
        assert_eq!(minted.len(), MINTED_KEYS_KEPT);
        assert!(!minted.contains("0"));
        assert!(minted.contains(&MINTED_KEYS_KEPT.to_string()));
    }

    #[test]
    fn images_without_minted_keys_still_load() {
        let raw = serde_json::to_value(Root::default()).unwrap();
        let mut raw = raw.as_object().cloned().unwrap();
        raw.remove("minted");
        let root: Root = serde_json::from_value(serde_json::Value::Object(raw)).unwrap();
        assert!(root.minted.is_empty());
    }
}
