//! FUSE adapter: maps [`fuser::Filesystem`] callbacks to [`ShellFs`].
//!
//! fuser dispatches callbacks one at a time. Callbacks that may wait on a command (lookup,
//! getattr, readdir, open, read) are spawned onto the tokio runtime and reply from there, so a
//! slow transform for one file does not hold up operations on others.

use std::ffi::OsStr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tracing::{debug, error, instrument};

use super::shell_fs::ShellFs;
use super::{FsError, INode, INodeType, OpenFlags, ROOT_INO};
use crate::command::CommandRunner;

/// Trait abstracting the `.error(errno)` method common to all fuser reply types.
trait FuseReply {
    fn error(self, errno: i32);
}

macro_rules! impl_fuse_reply {
    ($($ty:ty),* $(,)?) => {
        $(impl FuseReply for $ty {
            fn error(self, errno: i32) {
                // Calls the inherent fuser method (not this trait method).
                self.error(errno);
            }
        })*
    };
}

impl_fuse_reply!(
    fuser::ReplyEntry,
    fuser::ReplyAttr,
    fuser::ReplyDirectory,
    fuser::ReplyOpen,
    fuser::ReplyData,
    fuser::ReplyEmpty,
    fuser::ReplyWrite,
    fuser::ReplyCreate,
);

/// Extension trait on `Result<T, FsError>` for FUSE reply handling.
///
/// Centralizes the error-logging + errno-reply path so each FUSE callback
/// only has to express its success path.
trait FuseResultExt<T> {
    fn fuse_reply<R: FuseReply>(self, reply: R, on_ok: impl FnOnce(T, R));
}

impl<T> FuseResultExt<T> for Result<T, FsError> {
    fn fuse_reply<R: FuseReply>(self, reply: R, on_ok: impl FnOnce(T, R)) {
        match self {
            Ok(val) => on_ok(val, reply),
            Err(e) => {
                debug!(error = %e, "replying error");
                reply.error(e.errno());
            }
        }
    }
}

/// Convert an `INode` to the fuser-specific `FileAttr`.
fn inode_to_fuser_attr(inode: &INode, block_size: u32) -> fuser::FileAttr {
    fuser::FileAttr {
        ino: inode.addr,
        size: inode.size,
        blocks: inode.size.div_ceil(512),
        atime: inode.last_modified_at,
        mtime: inode.last_modified_at,
        ctime: inode.last_modified_at,
        crtime: inode.create_time,
        kind: inode_type_to_fuser(inode.itype),
        perm: inode.permissions.bits(),
        nlink: if inode.is_root() { 2 } else { 1 },
        uid: inode.uid,
        gid: inode.gid,
        rdev: 0,
        blksize: block_size,
        flags: 0,
    }
}

fn inode_type_to_fuser(itype: INodeType) -> fuser::FileType {
    match itype {
        INodeType::Directory => fuser::FileType::Directory,
        INodeType::File => fuser::FileType::RegularFile,
    }
}

const BLOCK_SIZE: u32 = 4096;

// Listing and sizes change underneath the kernel whenever a command's output changes, so the
// kernel must come back to us often.
const ATTR_TTL: Duration = Duration::from_secs(1);

/// Bridges a [`ShellFs`] to the [`fuser::Filesystem`] trait.
pub struct FuserAdapter<R: CommandRunner> {
    fs: Arc<ShellFs<R>>,
    runtime: tokio::runtime::Handle,
}

impl<R: CommandRunner> FuserAdapter<R> {
    /// Create a new adapter serving `fs`, running async work on `runtime`.
    pub fn new(fs: Arc<ShellFs<R>>, runtime: tokio::runtime::Handle) -> Self {
        Self { fs, runtime }
    }
}

impl<R: CommandRunner> fuser::Filesystem for FuserAdapter<R> {
    #[instrument(name = "FuserAdapter::lookup", skip(self, _req, reply))]
    fn lookup(
        &mut self,
        _req: &fuser::Request<'_>,
        parent: u64,
        name: &OsStr,
        reply: fuser::ReplyEntry,
    ) {
        if parent != ROOT_INO {
            reply.error(libc::ENOENT);
            return;
        }
        let fs = Arc::clone(&self.fs);
        let name = name.to_os_string();
        self.runtime.spawn(async move {
            fs.lookup(&name).await.fuse_reply(reply, |inode, reply| {
                let f_attr = inode_to_fuser_attr(&inode, BLOCK_SIZE);
                debug!(?f_attr, "replying...");
                reply.entry(&ATTR_TTL, &f_attr, 0);
            });
        });
    }

    #[instrument(name = "FuserAdapter::getattr", skip(self, _req, _fh, reply))]
    fn getattr(
        &mut self,
        _req: &fuser::Request<'_>,
        ino: u64,
        _fh: Option<u64>,
        reply: fuser::ReplyAttr,
    ) {
        let fs = Arc::clone(&self.fs);
        self.runtime.spawn(async move {
            fs.getattr_addr(ino).await.fuse_reply(reply, |inode, reply| {
                let attr = inode_to_fuser_attr(&inode, BLOCK_SIZE);
                debug!(?attr, "replying...");
                reply.attr(&ATTR_TTL, &attr);
            });
        });
    }

    #[instrument(name = "FuserAdapter::readdir", skip(self, _req, _fh, offset, reply))]
    fn readdir(
        &mut self,
        _req: &fuser::Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: fuser::ReplyDirectory,
    ) {
        if ino != ROOT_INO {
            reply.error(FsError::NotADirectory.errno());
            return;
        }
        let fs = Arc::clone(&self.fs);
        self.runtime.spawn(async move {
            let entries = match fs.readdir().await {
                Ok(entries) => entries,
                Err(e) => {
                    debug!(error = %e, "replying error");
                    reply.error(e.errno());
                    return;
                }
            };

            let dots = [(ROOT_INO, OsStr::new(".")), (ROOT_INO, OsStr::new(".."))]
                .into_iter()
                .map(|(addr, name)| (addr, fuser::FileType::Directory, name));
            let files = entries.iter().map(|de| {
                (
                    de.inode.addr,
                    inode_type_to_fuser(de.inode.itype),
                    &*de.name,
                )
            });

            let skip = usize::try_from(offset).unwrap_or(0);
            for (i, (entry_ino, kind, entry_name)) in dots.chain(files).enumerate().skip(skip) {
                let Ok(next): Result<i64, _> = (i + 1).try_into() else {
                    error!("Directory entry index {} too large for fuser", i + 1);
                    reply.error(libc::EIO);
                    return;
                };
                debug!(?entry_name, ino = entry_ino, "adding entry to reply...");
                if reply.add(entry_ino, next, kind, entry_name) {
                    debug!("buffer full for now, stopping readdir");
                    break;
                }
            }

            debug!("finalizing reply...");
            reply.ok();
        });
    }

    #[instrument(name = "FuserAdapter::open", skip(self, _req, flags, reply))]
    fn open(&mut self, _req: &fuser::Request<'_>, ino: u64, flags: i32, reply: fuser::ReplyOpen) {
        let flags = OpenFlags::from_bits_truncate(flags);
        let fs = Arc::clone(&self.fs);
        self.runtime.spawn(async move {
            fs.open_addr(ino, flags).await.fuse_reply(reply, |fh, reply| {
                debug!(handle = fh, "replying...");
                // Sizes are unknown until the transform runs, so the kernel must not trust them.
                reply.opened(fh, fuser::consts::FOPEN_DIRECT_IO);
            });
        });
    }

    #[instrument(
        name = "FuserAdapter::read",
        skip(self, _req, _fh, _flags, _lock_owner, reply)
    )]
    fn read(
        &mut self,
        _req: &fuser::Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: fuser::ReplyData,
    ) {
        let fs = Arc::clone(&self.fs);
        self.runtime.spawn(async move {
            fs.read_addr(ino, offset.cast_unsigned(), size)
                .await
                .fuse_reply(reply, |data, reply| {
                    debug!(read_bytes = data.len(), "replying...");
                    reply.data(&data);
                });
        });
    }

    #[instrument(
        name = "FuserAdapter::release",
        skip(self, _req, _ino, _flags, _lock_owner, _flush, reply)
    )]
    fn release(
        &mut self,
        _req: &fuser::Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: fuser::ReplyEmpty,
    ) {
        self.fs.release(fh).fuse_reply(reply, |(), reply| {
            debug!("replying ok");
            reply.ok();
        });
    }

    #[instrument(name = "FuserAdapter::statfs", skip(self, _req, _ino, reply))]
    fn statfs(&mut self, _req: &fuser::Request<'_>, _ino: u64, reply: fuser::ReplyStatfs) {
        let stats = self.fs.statfs();
        debug!(?stats, "replying...");
        reply.statfs(
            stats.total_blocks,
            stats.free_blocks,
            stats.available_blocks,
            stats.total_inodes,
            stats.free_inodes,
            stats.block_size,
            stats.max_filename_length,
            0,
        );
    }

    #[instrument(name = "FuserAdapter::write", skip_all)]
    fn write(
        &mut self,
        _req: &fuser::Request<'_>,
        _ino: u64,
        _fh: u64,
        _offset: i64,
        _data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: fuser::ReplyWrite,
    ) {
        self.fs.reject_write().fuse_reply(reply, |(), _| {});
    }

    #[instrument(name = "FuserAdapter::setattr", skip_all)]
    fn setattr(
        &mut self,
        _req: &fuser::Request<'_>,
        _ino: u64,
        _mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        _size: Option<u64>,
        _atime: Option<fuser::TimeOrNow>,
        _mtime: Option<fuser::TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: fuser::ReplyAttr,
    ) {
        self.fs.reject_write().fuse_reply(reply, |(), _| {});
    }

    #[instrument(name = "FuserAdapter::mknod", skip_all)]
    fn mknod(
        &mut self,
        _req: &fuser::Request<'_>,
        _parent: u64,
        _name: &OsStr,
        _mode: u32,
        _umask: u32,
        _rdev: u32,
        reply: fuser::ReplyEntry,
    ) {
        self.fs.reject_write().fuse_reply(reply, |(), _| {});
    }

    #[instrument(name = "FuserAdapter::mkdir", skip_all)]
    fn mkdir(
        &mut self,
        _req: &fuser::Request<'_>,
        _parent: u64,
        _name: &OsStr,
        _mode: u32,
        _umask: u32,
        reply: fuser::ReplyEntry,
    ) {
        self.fs.reject_write().fuse_reply(reply, |(), _| {});
    }

    #[instrument(name = "FuserAdapter::unlink", skip_all)]
    fn unlink(
        &mut self,
        _req: &fuser::Request<'_>,
        _parent: u64,
        _name: &OsStr,
        reply: fuser::ReplyEmpty,
    ) {
        self.fs.reject_write().fuse_reply(reply, |(), _| {});
    }

    #[instrument(name = "FuserAdapter::rmdir", skip_all)]
    fn rmdir(
        &mut self,
        _req: &fuser::Request<'_>,
        _parent: u64,
        _name: &OsStr,
        reply: fuser::ReplyEmpty,
    ) {
        self.fs.reject_write().fuse_reply(reply, |(), _| {});
    }

    #[instrument(name = "FuserAdapter::rename", skip_all)]
    fn rename(
        &mut self,
        _req: &fuser::Request<'_>,
        _parent: u64,
        _name: &OsStr,
        _newparent: u64,
        _newname: &OsStr,
        _flags: u32,
        reply: fuser::ReplyEmpty,
    ) {
        self.fs.reject_write().fuse_reply(reply, |(), _| {});
    }

    #[instrument(name = "FuserAdapter::create", skip_all)]
    fn create(
        &mut self,
        _req: &fuser::Request<'_>,
        _parent: u64,
        _name: &OsStr,
        _mode: u32,
        _umask: u32,
        _flags: i32,
        reply: fuser::ReplyCreate,
    ) {
        self.fs.reject_write().fuse_reply(reply, |(), _| {});
    }
}
