//! Bidirectional mapping between logical filenames and inode numbers.
//!
//! [`InodeMap`] keeps two [`scc::HashMap`]s guarded by a coordination lock for cross-map
//! atomicity. Inode numbers are allocated from a counter and never reused within a mount, so a
//! kernel holding a number for a file that left the listing gets `ENOENT` rather than another
//! file's data.

use std::ffi::OsStr;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::fs::{InodeAddr, ROOT_INO};
use crate::listing::Listing;

/// Bidirectional name/inode mapping for the flat namespace under the root.
///
/// Uses two concurrent `scc::HashMap`s for lock-free reads. Mutations that touch both maps are
/// serialized by a `Mutex<()>` to prevent cross-map inconsistencies.
pub struct InodeMap {
    /// name -> addr
    by_name: scc::HashMap<Arc<OsStr>, InodeAddr>,
    /// addr -> name
    by_addr: scc::HashMap<InodeAddr, Arc<OsStr>>,
    next_addr: AtomicU64,
    /// Serializes mutations that touch both maps. Holds the newest listing the maps were pruned
    /// against.
    mu: Mutex<Option<Arc<Listing>>>,
}

impl InodeMap {
    /// Creates an empty map. The first allocated number follows [`ROOT_INO`].
    #[must_use]
    pub fn new() -> Self {
        Self {
            by_name: scc::HashMap::new(),
            by_addr: scc::HashMap::new(),
            next_addr: AtomicU64::new(ROOT_INO + 1),
            mu: Mutex::new(None),
        }
    }

    /// Look up the inode number of `name`, allocating one if it has none yet.
    ///
    /// `generation` is the generation of the listing `name` was found in. Returns `None` without
    /// allocating if the map was already pruned against a newer listing that no longer has
    /// `name`.
    #[must_use]
    pub fn addr_or_insert(&self, name: &Arc<OsStr>, generation: u64) -> Option<InodeAddr> {
        if let Some(addr) = self.addr_of(name) {
            return Some(addr);
        }

        let pruned = self
            .mu
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(newer) = pruned.as_ref()
            && newer.generation() > generation
            && !newer.contains(name)
        {
            return None;
        }
        match self.by_name.entry_sync(Arc::clone(name)) {
            scc::hash_map::Entry::Occupied(occ) => Some(*occ.get()),
            scc::hash_map::Entry::Vacant(vac) => {
                let addr = self.next_addr.fetch_add(1, Ordering::Relaxed);
                vac.insert_entry(addr);
                let _ = self.by_addr.insert_sync(addr, Arc::clone(name));
                Some(addr)
            }
        }
    }

    /// Resolve an inode number to its filename.
    #[must_use]
    pub fn name_of(&self, addr: InodeAddr) -> Option<Arc<OsStr>> {
        self.by_addr.read_sync(&addr, |_, v| Arc::clone(v))
    }

    /// Resolve a filename to its inode number, if one was allocated.
    #[must_use]
    pub fn addr_of(&self, name: &Arc<OsStr>) -> Option<InodeAddr> {
        self.by_name.read_sync(name, |_, &v| v)
    }

    /// Forget every name that is not in `listing`. A listing older than one already pruned
    /// against is ignored.
    pub fn retain_listed(&self, listing: &Arc<Listing>) {
        let mut pruned = self
            .mu
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if pruned
            .as_ref()
            .is_some_and(|p| p.generation() >= listing.generation())
        {
            return;
        }
        *pruned = Some(Arc::clone(listing));
        self.by_name.retain_sync(|name, _| listing.contains(name));
        self.by_addr.retain_sync(|_, name| listing.contains(name));
    }

    /// Number of mapped names.
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    /// Returns `true` if no names are mapped.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }
}

impl Default for InodeMap {
    fn default() -> Self {
        Self::new()
    }
}
