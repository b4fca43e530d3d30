//! Writable mount leases.
//!
//! No two live sandboxes may share a writable host path. A path conflicts
//! with a held one when it is equal to it or nested inside it (in either
//! direction). Leases are released when dropped.

use super::{Mount, SandboxError};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Clone, Default)]
pub struct MountRegistry {
    held: Arc<Mutex<Vec<(PathBuf, String)>>>,
}

impl MountRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<(PathBuf, String)>> {
        self.held.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Validate `mounts` and lease their writable paths for `holder`.
    ///
    /// Every host path must be absolute. Either every writable path is
    /// leased or none is.
    pub fn acquire(&self, mounts: &[Mount], holder: &str) -> Result<MountLease, SandboxError> {
        if let Some(mount) = mounts.iter().find(|m| !m.host.is_absolute()) {
            return Err(SandboxError::InvalidMount(mount.host.clone()));
        }

        let writable: Vec<PathBuf> = mounts
            .iter()
            .filter(|m| m.is_writable())
            .map(|m| m.host.clone())
            .collect();

        let mut held = self.lock();
        for path in &writable {
            if let Some((_, other)) = held.iter().find(|(h, _)| overlaps(h, path)) {
                return Err(SandboxError::MountConflict {
                    path: path.clone(),
                    holder: other.clone(),
                });
            }
        }
        held.extend(writable.iter().map(|p| (p.clone(), holder.to_string())));

        Ok(MountLease {
            registry: self.clone(),
            paths: writable,
        })
    }

    #[cfg(test)]
    pub fn held_count(&self) -> usize {
        self.lock().len()
    }
}

fn overlaps(a: &Path, b: &Path) -> bool {
    a.starts_with(b) || b.starts_with(a)
}

/// Writable paths held by one running sandbox.
#[derive(Debug)]
pub struct MountLease {
    registry: MountRegistry,
    paths: Vec<PathBuf>,
}

impl Drop for MountLease {
    fn drop(&mut self) {
        let mut held = self.registry.lock();
        for path in &self.paths {
            if let Some(pos) = held.iter().position(|(h, _)| h == path) {
                held.remove(pos);
            }
        }
    }
}
