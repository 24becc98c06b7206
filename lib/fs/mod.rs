//! Filesystem value types, errors, and the layers that serve them.

/// FUSE adapter: maps [`fuser::Filesystem`] callbacks to [`shell_fs::ShellFs`].
pub mod fuser;
/// Stable inode numbers for logical filenames.
pub mod inode_map;
/// The filesystem bridge over the listing and content caches.
pub mod shell_fs;

use std::ffi::{OsStr, OsString};
use std::sync::Arc;
use std::time::SystemTime;

use bitflags::bitflags;
use thiserror::Error;

use crate::command::CommandError;

/// Type representing an inode identifier.
pub type InodeAddr = u64;

/// Type representing a file handle.
pub type FileHandle = u64;

/// Inode of the root directory, the only directory in the namespace.
pub const ROOT_INO: InodeAddr = 1;

/// Size reported for files whose content has not been materialized yet.
///
/// Files are opened in direct I/O mode, so the kernel keeps reading until a short read no matter
/// what size was reported.
pub const UNKNOWN_SIZE: u64 = 0;

bitflags! {
    /// Permission bits for an inode, similar to Unix file permissions.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct InodePerms: u16 {
        /// Other: execute permission.
        const OTHER_EXECUTE = 1 << 0;
        /// Other: write permission.
        const OTHER_WRITE   = 1 << 1;
        /// Other: read permission.
        const OTHER_READ    = 1 << 2;

        /// Group: execute permission.
        const GROUP_EXECUTE = 1 << 3;
        /// Group: write permission.
        const GROUP_WRITE   = 1 << 4;
        /// Group: read permission.
        const GROUP_READ    = 1 << 5;

        /// Owner: execute permission.
        const OWNER_EXECUTE = 1 << 6;
        /// Owner: write permission.
        const OWNER_WRITE   = 1 << 7;
        /// Owner: read permission.
        const OWNER_READ    = 1 << 8;

        /// Read for owner, group and other.
        const ALL_READ = Self::OWNER_READ.bits()
            | Self::GROUP_READ.bits()
            | Self::OTHER_READ.bits();
        /// Execute (search) for owner, group and other.
        const ALL_EXECUTE = Self::OWNER_EXECUTE.bits()
            | Self::GROUP_EXECUTE.bits()
            | Self::OTHER_EXECUTE.bits();
    }
}

impl InodePerms {
    /// `0o444`: every logical file.
    pub const READ_ONLY_FILE: Self = Self::ALL_READ;
    /// `0o555`: the root directory.
    pub const READ_ONLY_DIR: Self = Self::ALL_READ.union(Self::ALL_EXECUTE);
}

bitflags! {
    /// Flags for opening a file, similar to Unix open(2) flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct OpenFlags: i32 {
        /// Open for reading only.
        const RDONLY = libc::O_RDONLY;
        /// Open for writing only.
        const WRONLY = libc::O_WRONLY;
        /// Open for reading and writing.
        const RDWR = libc::O_RDWR;

        /// Append on each write.
        const APPEND = libc::O_APPEND;
        /// Truncate to zero length.
        const TRUNC = libc::O_TRUNC;
        /// Create file if it does not exist.
        const CREAT = libc::O_CREAT;

        /// Non-blocking mode.
        const NONBLOCK = libc::O_NONBLOCK;
        /// Do not follow symlinks.
        const NOFOLLOW = libc::O_NOFOLLOW;
        /// Set close-on-exec.
        const CLOEXEC = libc::O_CLOEXEC;
        /// Fail if not a directory.
        const DIRECTORY = libc::O_DIRECTORY;
    }
}

impl OpenFlags {
    /// Returns `true` if these flags ask for any kind of modification.
    #[must_use]
    pub fn wants_write(self) -> bool {
        self.intersects(Self::WRONLY | Self::RDWR | Self::APPEND | Self::TRUNC | Self::CREAT)
    }
}

/// The type of an inode entry in the filesystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum INodeType {
    /// A regular file.
    File,
    /// A directory.
    Directory,
}

/// Representation of an inode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct INode {
    /// The address of this inode, which serves as its unique identifier.
    pub addr: InodeAddr,
    /// The permissions associated with this inode, represented as a bitfield.
    pub permissions: InodePerms,
    /// The user ID of the owner of this inode.
    pub uid: u32,
    /// The group ID of the owner of this inode.
    pub gid: u32,
    /// The time this inode was created at.
    pub create_time: SystemTime,
    /// The time this inode was last modified at.
    pub last_modified_at: SystemTime,
    /// The size of the file represented by this inode, in bytes.
    pub size: u64,
    /// Additional information about the type of this inode (e.g., file vs directory).
    pub itype: INodeType,
}

impl INode {
    /// Check if this inode is the root directory.
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.addr == ROOT_INO
    }
}

/// A directory entry yielded by [`shell_fs::ShellFs::readdir`].
#[derive(Debug, Clone)]
pub struct DirEntry {
    /// The logical filename.
    pub name: Arc<OsStr>,
    /// The full inode data for this entry.
    pub inode: INode,
}

/// Filesystem statistics returned by [`shell_fs::ShellFs::statfs`].
///
/// Block-related sizes are in units of `block_size` bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FsStats {
    /// Filesystem block size (bytes).
    pub block_size: u32,
    /// Total number of data blocks.
    pub total_blocks: u64,
    /// Number of free blocks.
    pub free_blocks: u64,
    /// Number of blocks available to unprivileged users.
    pub available_blocks: u64,
    /// Total number of file nodes (inodes).
    pub total_inodes: u64,
    /// Number of free file nodes.
    pub free_inodes: u64,
    /// Maximum filename length (bytes).
    pub max_filename_length: u32,
}

/// Errors returned by filesystem operations.
///
/// Command failures arrive here already converted; they never abort the serving process.
#[derive(Debug, Error)]
pub enum FsError {
    /// The name is not in the current listing.
    #[error("no such file: {0:?}")]
    NameNotFound(OsString),

    /// The list command failed and no earlier listing exists.
    #[error("listing unavailable: {0}")]
    ListingUnavailable(Arc<CommandError>),

    /// The transform command failed for this file.
    #[error("content of {name:?} unavailable: {source}")]
    ContentUnavailable {
        /// The file whose content could not be produced.
        name: OsString,
        /// The underlying command failure.
        source: Arc<CommandError>,
    },

    /// Attempted modification of the read-only filesystem.
    #[error("operation not permitted on a read-only filesystem")]
    NotPermitted,

    /// File operation on the root directory.
    #[error("is a directory")]
    IsADirectory,

    /// Directory operation on a file.
    #[error("not a directory")]
    NotADirectory,

    /// The file handle is not open.
    #[error("bad file handle: {0}")]
    BadFileHandle(FileHandle),
}

impl FsError {
    /// The errno the kernel should see for this error.
    #[must_use]
    pub fn errno(&self) -> i32 {
        match self {
            Self::NameNotFound(_) => libc::ENOENT,
            Self::ListingUnavailable(_) | Self::ContentUnavailable { .. } => libc::EIO,
            Self::NotPermitted => libc::EPERM,
            Self::IsADirectory => libc::EISDIR,
            Self::NotADirectory => libc::ENOTDIR,
            Self::BadFileHandle(_) => libc::EBADF,
        }
    }
}

impl From<FsError> for std::io::Error {
    fn from(e: FsError) -> Self {
        Self::from_raw_os_error(e.errno())
    }
}
