//! The Maildir store: folder path mapping, name validation, and the
//! weak by-name folder cache.

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

use super::{folder::MaildirFolder, summary::SUBDIRS};

pub struct MaildirStore {
    base: PathBuf,
    registry: FolderRegistry,
    weak_self: Weak<MaildirStore>,
}

impl MaildirStore {
    /// Open a store for a `maildir:///path` URL.
    pub fn new(url: &ServiceUrl) -> Result<Arc<Self>> {
        if url.path().is_empty() {
            return Err(Error::ServiceUnavailable(format!(
                "maildir URL {url} has no path"
            )));
        }
        Ok(Self::from_root(url.path()))
    }

    /// Open a store rooted at a filesystem path.
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

    /// Map a full folder name to its directory: `a/b/c` becomes
    /// `<base>/.a.b.c`, the empty name is the base itself.
    pub(crate) fn build_path(&self, full_name: &str) -> PathBuf {
        if full_name.is_empty() {
            self.base.clone()
        } else {
            self.base.join(format!(".{}", full_name.replace('/', ".")))
        }
    }

    /// A usable folder name has non-empty components that avoid the
    /// reserved subdir names, dots (the on-disk separator) and leading
    /// dots.
    pub(crate) fn validate_name(&self, full_name: &str) -> Result<()> {
        if full_name.is_empty() {
            return Ok(());
        }

        for component in full_name.split('/') {
            if component.is_empty()
                || component.contains('.')
                || SUBDIRS.contains(&component)
            {
                return Err(Error::IllegalName(full_name.to_owned()));
            }
        }

        Ok(())
    }

    fn wire_parent(parent: &Arc<dyn Folder>, child: &Arc<MaildirFolder>) {
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
impl Store for MaildirStore {
    async fn get_folder(&self, full_name: &str) -> Result<Arc<dyn Folder>> {
        self.validate_name(full_name)?;

        // materialize the chain from the top folder down so every
        // folder has its parent wired for rename notifications
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
                    debug!("instantiating maildir folder {acc:?}");
                    let this = MaildirFolder::new(self.weak_self.clone(), &acc)?;
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
