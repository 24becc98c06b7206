//! The filesystem bridge: serves lookup, readdir, getattr, open, read and release for the flat
//! namespace produced by the list command.
//!
//! Per file, the lifecycle is `Absent → Listed → Fetching → Cached | Errored`, and back to
//! `Fetching` once the cached outcome expires and the file is read again. Whenever a refreshed
//! listing no longer contains a name, its content record, in-flight reservation and inode number
//! are dropped and the name is `Absent` again.

use std::ffi::OsStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use tracing::{debug, instrument};

use crate::command::CommandRunner;
use crate::content::{ContentCache, ContentCacheConfig};
use crate::fs::inode_map::InodeMap;
use crate::fs::{
    DirEntry, FileHandle, FsError, FsStats, INode, INodeType, InodeAddr, InodePerms, OpenFlags,
    ROOT_INO, UNKNOWN_SIZE,
};
use crate::listing::{Listing, ListingCache};

/// Default name of the environment variable carrying the filename into the transform command.
pub const DEFAULT_INPUT_VAR: &str = "INPUT";

/// Inputs of a [`ShellFs`].
#[derive(Debug, Clone)]
pub struct ShellFsConfig {
    /// Command whose stdout lists the logical filenames, one per line.
    pub list_command: String,
    /// Command whose stdout is the content of the file bound to `input_var`.
    pub transform_command: String,
    /// Maximum age of a listing served without re-running the list command.
    pub listing_freshness: Duration,
    /// Maximum age of content served without re-running the transform command.
    pub content_freshness: Duration,
    /// How long a failed command outcome is served before trying again.
    pub failure_window: Duration,
    /// Environment variable the filename is bound to.
    pub input_var: String,
    /// Bound on the total size of cached content, if any.
    pub max_content_bytes: Option<u64>,
    /// Owner reported for every inode.
    pub uid: u32,
    /// Group reported for every inode.
    pub gid: u32,
}

impl ShellFsConfig {
    /// Config with the given commands and the default windows: listing 1s, content 60s,
    /// failures 5s, no memory bound, owned by root.
    #[must_use]
    pub fn new(list_command: impl Into<String>, transform_command: impl Into<String>) -> Self {
        Self {
            list_command: list_command.into(),
            transform_command: transform_command.into(),
            listing_freshness: Duration::from_secs(1),
            content_freshness: Duration::from_secs(60),
            failure_window: Duration::from_secs(5),
            input_var: DEFAULT_INPUT_VAR.to_owned(),
            max_content_bytes: None,
            uid: 0,
            gid: 0,
        }
    }
}

/// Read-only filesystem whose directory listing and file contents come from commands.
pub struct ShellFs<R: CommandRunner> {
    listing: ListingCache<R>,
    content: ContentCache<R>,
    inodes: InodeMap,

    /// Generation of the newest listing the inode map and content cache were pruned against.
    pruned_generation: AtomicU64,

    /// Open file handles and the inode each refers to.
    open_files: scc::HashMap<FileHandle, InodeAddr>,
    /// Monotonically increasing file handle counter. Starts at 1 (0 is reserved).
    next_fh: AtomicU64,

    uid: u32,
    gid: u32,
    mounted_at: SystemTime,
}

impl<R: CommandRunner> ShellFs<R> {
    /// Create a filesystem running its commands through `runner`. Nothing runs until the first
    /// operation.
    pub fn new(runner: R, config: ShellFsConfig) -> Self {
        let runner = Arc::new(runner);
        let listing = ListingCache::new(
            Arc::clone(&runner),
            config.list_command,
            config.listing_freshness,
            config.failure_window,
        );
        let content = ContentCache::new(
            runner,
            ContentCacheConfig {
                command: config.transform_command.into(),
                input_var: config.input_var.into(),
                freshness: config.content_freshness,
                failure_window: config.failure_window,
                max_bytes: config.max_content_bytes,
            },
        );
        Self {
            listing,
            content,
            inodes: InodeMap::new(),
            pruned_generation: AtomicU64::new(0),
            open_files: scc::HashMap::new(),
            next_fh: AtomicU64::new(1),
            uid: config.uid,
            gid: config.gid,
            mounted_at: SystemTime::now(),
        }
    }

    /// The root directory inode.
    #[must_use]
    pub fn root_inode(&self) -> INode {
        INode {
            addr: ROOT_INO,
            permissions: InodePerms::READ_ONLY_DIR,
            uid: self.uid,
            gid: self.gid,
            create_time: self.mounted_at,
            last_modified_at: self.mounted_at,
            size: 0,
            itype: INodeType::Directory,
        }
    }

    /// Look up a file in the root directory.
    #[instrument(name = "ShellFs::lookup", skip(self))]
    pub async fn lookup(&self, name: &OsStr) -> Result<INode, FsError> {
        let listing = self.current_listing().await?;
        listing
            .get(name)
            .and_then(|key| self.file_inode(key, listing.generation()))
            .ok_or_else(|| FsError::NameNotFound(name.to_os_string()))
    }

    /// List the root directory in listing order.
    #[instrument(name = "ShellFs::readdir", skip(self))]
    pub async fn readdir(&self) -> Result<Vec<DirEntry>, FsError> {
        let listing = self.current_listing().await?;
        Ok(listing
            .names()
            .iter()
            .filter_map(|name| {
                Some(DirEntry {
                    name: Arc::clone(name),
                    inode: self.file_inode(name, listing.generation())?,
                })
            })
            .collect())
    }

    /// Attributes of a listed file: the materialized size if known, otherwise [`UNKNOWN_SIZE`].
    ///
    /// Never runs the transform command.
    #[instrument(name = "ShellFs::getattr", skip(self))]
    pub async fn getattr(&self, name: &OsStr) -> Result<INode, FsError> {
        self.lookup(name).await
    }

    /// Attributes by inode number, for callers that only know the number.
    pub async fn getattr_addr(&self, addr: InodeAddr) -> Result<INode, FsError> {
        if addr == ROOT_INO {
            return Ok(self.root_inode());
        }
        let name = self.name_of(addr)?;
        self.getattr(&name).await
    }

    /// Open a listed file for reading.
    ///
    /// Opening is a no-op beyond validating that the file exists; any request to modify fails
    /// with [`FsError::NotPermitted`].
    #[instrument(name = "ShellFs::open", skip(self))]
    pub async fn open(&self, name: &OsStr, flags: OpenFlags) -> Result<FileHandle, FsError> {
        if flags.wants_write() {
            return Err(FsError::NotPermitted);
        }
        let inode = self.lookup(name).await?;
        let fh = self.next_fh.fetch_add(1, Ordering::Relaxed);
        let _ = self.open_files.insert_sync(fh, inode.addr);
        Ok(fh)
    }

    /// Open by inode number.
    pub async fn open_addr(&self, addr: InodeAddr, flags: OpenFlags) -> Result<FileHandle, FsError> {
        if addr == ROOT_INO {
            return Err(FsError::IsADirectory);
        }
        let name = self.name_of(addr)?;
        self.open(&name, flags).await
    }

    /// Read up to `length` bytes of `name` starting at `offset`.
    ///
    /// Obtains the whole content through the content cache first. An offset at or past the end
    /// yields an empty result.
    #[instrument(name = "ShellFs::read", skip(self))]
    pub async fn read(&self, name: &OsStr, offset: u64, length: u32) -> Result<Bytes, FsError> {
        let listing = self.current_listing().await?;
        let bytes = self.content.get_content(&listing, name).await?;
        Ok(slice_range(&bytes, offset, length))
    }

    /// Read by inode number.
    pub async fn read_addr(
        &self,
        addr: InodeAddr,
        offset: u64,
        length: u32,
    ) -> Result<Bytes, FsError> {
        if addr == ROOT_INO {
            return Err(FsError::IsADirectory);
        }
        let name = self.name_of(addr)?;
        self.read(&name, offset, length).await
    }

    /// Release a handle returned by [`open`](Self::open).
    pub fn release(&self, fh: FileHandle) -> Result<(), FsError> {
        self.open_files
            .remove_sync(&fh)
            .map(|_| ())
            .ok_or(FsError::BadFileHandle(fh))
    }

    /// Every write-type operation ends here.
    pub fn reject_write(&self) -> Result<(), FsError> {
        _ = self;
        Err(FsError::NotPermitted)
    }

    /// Filesystem statistics for a read-only virtual filesystem. Counts the last obtained
    /// listing without running the list command.
    #[must_use]
    pub fn statfs(&self) -> FsStats {
        FsStats {
            block_size: 4096,
            total_blocks: 0,
            free_blocks: 0,
            available_blocks: 0,
            total_inodes: self.listing.peek().map_or(0, |l| l.len() as u64) + 1,
            free_inodes: 0,
            max_filename_length: 255,
        }
    }

    /// Number of currently open file handles.
    #[must_use]
    pub fn open_handle_count(&self) -> usize {
        self.open_files.len()
    }

    /// The content cache, for inspection.
    #[must_use]
    pub fn content(&self) -> &ContentCache<R> {
        &self.content
    }

    fn name_of(&self, addr: InodeAddr) -> Result<Arc<OsStr>, FsError> {
        self.inodes.name_of(addr).ok_or_else(|| {
            debug!(addr, "inode is not mapped to a listed name");
            FsError::NameNotFound(format!("<inode {addr}>").into())
        })
    }

    /// `None` if `name` left the listing after `generation` was fetched.
    fn file_inode(&self, name: &Arc<OsStr>, generation: u64) -> Option<INode> {
        Some(INode {
            addr: self.inodes.addr_or_insert(name, generation)?,
            permissions: InodePerms::READ_ONLY_FILE,
            uid: self.uid,
            gid: self.gid,
            create_time: self.mounted_at,
            last_modified_at: self.mounted_at,
            size: self.content.known_size(name).unwrap_or(UNKNOWN_SIZE),
            itype: INodeType::File,
        })
    }

    /// Fetch the listing, pruning per-name state the first time a new generation is seen.
    async fn current_listing(&self) -> Result<Arc<Listing>, FsError> {
        let view = self.listing.get_listing().await?;
        let generation = view.listing.generation();
        if self.pruned_generation.fetch_max(generation, Ordering::AcqRel) < generation {
            self.content.retain_listed(&view.listing);
            self.inodes.retain_listed(&view.listing);
            debug!(
                generation,
                records = self.content.len(),
                inodes = self.inodes.len(),
                "pruned names that left the listing"
            );
        }
        Ok(view.listing)
    }
}

/// The `[offset, offset + length)` window of `bytes`, clamped to its end.
fn slice_range(bytes: &Bytes, offset: u64, length: u32) -> Bytes {
    let len = bytes.len();
    let start = usize::try_from(offset).unwrap_or(usize::MAX).min(len);
    let end = start.saturating_add(length as usize).min(len);
    bytes.slice(start..end)
}
