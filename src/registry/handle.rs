//! Shared, hot-reloadable access to the current registry.

use super::Registry;
use crate::error::RegistryError;
use log::{error, info};
use parking_lot::RwLock;
use std::path::Path;
use std::sync::Arc;

/// Holds the active registry snapshot.
///
/// Readers clone the inner `Arc` and drop the lock immediately, so a match/bind
/// cycle works against one consistent table even if a reload lands midway.
#[derive(Debug)]
pub struct RegistryHandle {
    current: RwLock<Arc<Registry>>,
}

impl RegistryHandle {
    pub fn new(registry: Registry) -> Self {
        Self {
            current: RwLock::new(Arc::new(registry)),
        }
    }

    /// The registry as of now.
    pub fn snapshot(&self) -> Arc<Registry> {
        self.current.read().clone()
    }

    /// Atomically replace the whole table.
    pub fn replace(&self, registry: Registry) {
        let registry = Arc::new(registry);
        info!(
            "[Registry] Swapped in {} profile(s), version {}",
            registry.len(),
            registry.version().unwrap_or("unversioned")
        );
        *self.current.write() = registry;
    }

    /// Reload from disk. On failure the current table stays active.
    pub fn reload_from(&self, path: &Path) -> Result<(), RegistryError> {
        match Registry::from_path(path) {
            Ok(registry) => {
                self.replace(registry);
                Ok(())
            }
            Err(e) => {
                error!(
                    "[Registry] Reload from {} failed, keeping current table: {}",
                    path.display(),
                    e
                );
                Err(e)
            }
        }
    }
}

impl Default for RegistryHandle {
    fn default() -> Self {
        Self::new(Registry::empty())
    }
}
