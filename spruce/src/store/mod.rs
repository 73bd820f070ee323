//! # Store module
//!
//! A [`Store`] is the backing organization of folders for one
//! URL-identified service. Stores hand out folders lazily and cache
//! them by full name in a weak registry: the folder is shared for as
//! long as anyone holds it, and the registry entry falls away with the
//! last reference.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, Weak},
};

use async_trait::async_trait;

use crate::{error::Result, folder::Folder};

/// The backing organization of folders for one service.
#[async_trait]
pub trait Store: Send + Sync {
    /// Get (or lazily instantiate) the folder with the given full
    /// name. The empty name refers to the store's top folder.
    async fn get_folder(&self, full_name: &str) -> Result<Arc<dyn Folder>>;

    /// The store's default folder.
    async fn get_default_folder(&self) -> Result<Arc<dyn Folder>> {
        self.get_folder("").await
    }
}

/// Weak by-name folder cache used by store implementations.
///
/// Entries are pruned lazily: a dead weak reference found on lookup is
/// dropped, so finalized folders disappear from the registry without
/// an explicit finalizer hook.
#[derive(Default)]
pub struct FolderRegistry {
    folders: Mutex<HashMap<String, Weak<dyn Folder>>>,
}

impl FolderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup(&self, full_name: &str) -> Option<Arc<dyn Folder>> {
        let mut folders = self.folders.lock().unwrap();
        match folders.get(full_name).and_then(Weak::upgrade) {
            Some(folder) => Some(folder),
            None => {
                folders.remove(full_name);
                None
            }
        }
    }

    pub fn insert(&self, full_name: impl Into<String>, folder: &Arc<dyn Folder>) {
        self.folders
            .lock()
            .unwrap()
            .insert(full_name.into(), Arc::downgrade(folder));
    }

    pub fn remove(&self, full_name: &str) {
        self.folders.lock().unwrap().remove(full_name);
    }

    /// Re-key every cached entry under `old` (the folder itself and
    /// its descendants) to live under `new` after a rename.
    pub fn rekey_prefix(&self, old: &str, new: &str) {
        let mut folders = self.folders.lock().unwrap();
        let keys: Vec<String> = folders
            .keys()
            .filter(|key| {
                key.as_str() == old || key.starts_with(&format!("{old}/"))
            })
            .cloned()
            .collect();

        for key in keys {
            if let Some(entry) = folders.remove(&key) {
                let rekeyed = format!("{new}{}", &key[old.len()..]);
                folders.insert(rekeyed, entry);
            }
        }
    }
}

impl std::fmt::Debug for FolderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FolderRegistry")
            .field("entries", &self.folders.lock().unwrap().len())
            .finish()
    }
}
