//! Name-to-share directory.
//!
//! Discovery registers every remote share it materialises under a stable
//! name; opening a database by name looks it up here. One directory is shared
//! by the share manager that fills it and the code that opens from it.

use crate::share::ShareDescriptor;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::debug;

/// Process-local directory of connectable shares.
#[derive(Clone, Default)]
pub struct ShareDirectory {
    entries: Arc<DashMap<String, ShareDescriptor>>,
}

impl ShareDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) a descriptor under its name.
    pub fn register(&self, descriptor: ShareDescriptor) {
        debug!(name = %descriptor.name, "Registered share");
        self.entries.insert(descriptor.name.clone(), descriptor);
    }

    /// Look up a share by name. A `webrtc://` prefix is accepted.
    pub fn lookup(&self, name: &str) -> Option<ShareDescriptor> {
        let name = name.strip_prefix(crate::share::DBNAME_PREFIX).unwrap_or(name);
        self.entries.get(name).map(|entry| entry.value().clone())
    }

    pub fn remove(&self, name: &str) -> Option<ShareDescriptor> {
        let name = name.strip_prefix(crate::share::DBNAME_PREFIX).unwrap_or(name);
        self.entries.remove(name).map(|(_, descriptor)| descriptor)
    }

    /// Drop entries under `prefix` whose name is not in `live`.
    pub fn remove_stale(&self, prefix: &str, live: &[String]) {
        self.entries.retain(|name, _| {
            let keep = !name.starts_with(prefix) || live.contains(name);
            if !keep {
                debug!(name = %name, "Share withdrawn");
            }
            keep
        });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
