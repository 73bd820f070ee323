//! The mbox store: path mapping through `.sbd` directories, reserved
//! name filtering, and the weak by-name folder cache.

use std::{
    path::{Path, PathBuf},
    sync::{Arc, Weak},
};

use async_trait::async_trait;
use tracing::debug;

use crate::{
    error::{Error, Result},
    folder::Folder,
    store::{FolderRegistry, Store},
    url::ServiceUrl,
};

use super::folder::MboxFolder;

/// Suffixes that can never appear in a folder name: they collide with
/// the store's own on-disk artifacts.
pub(crate) const RESERVED_SUFFIXES: [&str; 4] = [".summary", ".sbd", ".msf", "~"];

pub struct MboxStore {
    base: PathBuf,
    registry: FolderRegistry,
    weak_self: Weak<MboxStore>,
}

impl MboxStore {
    /// Open a store for a `mbox:///path` URL.
    pub fn new(url: &ServiceUrl) -> Result<Arc<Self>> {
        if url.path().is_empty() {
            return Err(Error::ServiceUnavailable(format!(
                "mbox URL {url} has no path"
            )));
        }
        Ok(Self::from_root(url.path()))
    }

    /// Open a store rooted at a filesystem directory.
    pub fn from_root(root: impl Into<PathBuf>) -> Arc<Self> {
        let base = root.into();
        Arc::new_cyclic(|weak_self| Self {
            base,
            registry: FolderRegistry::new(),
            weak_self: weak_self.clone(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.base
    }

    pub(crate) fn registry(&self) -> &FolderRegistry {
        &self.registry
    }

    /// Map a full folder name to its mailbox file: `a/b/c` becomes
    /// `<base>/a.sbd/b.sbd/c`; the empty name is the store root
    /// directory itself.
    pub(crate) fn build_path(&self, full_name: &str) -> PathBuf {
        if full_name.is_empty() {
            return self.base.clone();
        }

        let mut path = self.base.clone();
        let components: Vec<&str> = full_name.split('/').collect();
        for (i, component) in components.iter().enumerate() {
            if i + 1 == components.len() {
                path.push(component);
            } else {
                path.push(format!("{component}.sbd"));
            }
        }
        path
    }

    /// The subfolder directory that accompanies a mailbox.
    pub(crate) fn sbd_path(&self, full_name: &str) -> PathBuf {
        if full_name.is_empty() {
            self.base.clone()
        } else {
            let path = self.build_path(full_name);
            let name = path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default();
            path.with_file_name(format!("{name}.sbd"))
        }
    }

    pub(crate) fn validate_name(&self, full_name: &str) -> Result<()> {
        if full_name.is_empty() {
            return Ok(());
        }

        for component in full_name.split('/') {
            let illegal = component.is_empty()
                || component.starts_with('.')
                || RESERVED_SUFFIXES
                    .iter()
                    .any(|suffix| component.ends_with(suffix));
            if illegal {
                return Err(Error::IllegalName(full_name.to_owned()));
            }
        }

        Ok(())
    }

    fn wire_parent(parent: &Arc<dyn Folder>, child: &Arc<MboxFolder>) {
        let weak = Arc::downgrade(child);
        let token = parent.subscribe_renamed(Box::new(move |_old, new_parent| {
            if let Some(child) = weak.upgrade() {
                let name = child.name();
                child.newname(new_parent, &name);
            }
        }));
        child.set_parent_subscription(parent, token);
    }
}

#[async_trait]
impl Store for MboxStore {
    async fn get_folder(&self, full_name: &str) -> Result<Arc<dyn Folder>> {
        self.validate_name(full_name)?;

        let mut parent: Option<Arc<dyn Folder>> = None;
        let mut acc = String::new();

        for component in std::iter::once("").chain(
            full_name
                .split('/')
                .filter(|component| !component.is_empty()),
        ) {
            if !component.is_empty() {
                if !acc.is_empty() {
                    acc.push('/');
                }
                acc.push_str(component);
            }

            let folder: Arc<dyn Folder> = match self.registry.lookup(&acc) {
                Some(folder) => folder,
                None => {
                    debug!("instantiating mbox folder {acc:?}");
                    let this = MboxFolder::new(self.weak_self.clone(), &acc)?;
                    let erased: Arc<dyn Folder> = this.clone();
                    if let Some(parent) = &parent {
                        Self::wire_parent(parent, &this);
                    }
                    self.registry.insert(acc.clone(), &erased);
                    erased
                }
            };

            parent = Some(folder);
        }

        parent.ok_or_else(|| Error::NoSuchFolder(full_name.to_owned()))
    }
}
