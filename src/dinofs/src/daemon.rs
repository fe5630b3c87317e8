use std::ffi::OsStr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use dino_lib::DinoError;
use fuser::{
    FileAttr, FileType, Filesystem, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory,
    ReplyEmpty, ReplyEntry, ReplyOpen, ReplyWrite, ReplyXattr, Request, TimeOrNow,
};
use libc::{EINVAL, EIO, ENOENT};
use log::debug;
use tokio::runtime::Runtime;

use crate::factory::NodeFactory;
use crate::ino::ROOT_INO;
use crate::node::{
    Node, NodeAttr, SetattrChanges, SetxattrFlags, S_IFDIR, S_IFLNK, S_IFMT,
};

const TTL: Duration = Duration::from_secs(1);

#[cfg(target_os = "macos")]
const XATTR_NOT_FOUND: i32 = libc::ENOATTR;
#[cfg(not(target_os = "macos"))]
const XATTR_NOT_FOUND: i32 = libc::ENODATA;
#[cfg(target_os = "macos")]
const XATTR_CREATE_FLAG: i32 = libc::XATTR_CREATE as i32;
#[cfg(not(target_os = "macos"))]
const XATTR_CREATE_FLAG: i32 = libc::XATTR_CREATE;
#[cfg(target_os = "macos")]
const XATTR_REPLACE_FLAG: i32 = libc::XATTR_REPLACE as i32;
#[cfg(not(target_os = "macos"))]
const XATTR_REPLACE_FLAG: i32 = libc::XATTR_REPLACE;

/// The kernel-bridge side of the filesystem: resolves inode numbers to
/// nodes and drives the node engine from the synchronous callback surface,
/// blocking on the owned runtime.
pub struct DinoFs {
    runtime: Runtime,
    factory: Arc<NodeFactory>,
}

impl NodeFactory {
    /// Registers the root node under inode 1.
    pub fn adopt_root(&self, root: &Arc<Node>) {
        root.set_ino(ROOT_INO);
        self.register_ino(ROOT_INO, root.clone());
    }
}

fn map_dino_err(err: DinoError) -> i32 {
    match err {
        DinoError::NotFound(_) => ENOENT,
        DinoError::AlreadyExists(_) => libc::EEXIST,
        DinoError::NoData(_) => XATTR_NOT_FOUND,
        DinoError::NotEmpty(_) => libc::ENOTEMPTY,
        DinoError::InvalidParam(_) => EINVAL,
        // Storage and transport failures of any flavor reach the kernel as
        // plain I/O errors; the node layer has already rolled back.
        _ => EIO,
    }
}

fn attr_from(attr: NodeAttr) -> FileAttr {
    let kind = match attr.mode & S_IFMT {
        m if m == S_IFDIR => FileType::Directory,
        m if m == S_IFLNK => FileType::Symlink,
        _ => FileType::RegularFile,
    };
    let time = UNIX_EPOCH + Duration::from_nanos(attr.time_ns);
    FileAttr {
        ino: attr.ino,
        size: attr.size,
        blocks: (attr.size + 511) / 512,
        atime: time,
        mtime: time,
        ctime: time,
        crtime: time,
        kind,
        perm: (attr.mode & 0o7777) as u16,
        nlink: 1,
        uid: attr.user,
        gid: attr.group,
        rdev: 0,
        flags: 0,
        blksize: 4096,
    }
}

fn file_type_of(mode: u32) -> FileType {
    match mode & S_IFMT {
        m if m == S_IFDIR => FileType::Directory,
        m if m == S_IFLNK => FileType::Symlink,
        _ => FileType::RegularFile,
    }
}

fn system_time_ns(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH).unwrap_or_default().as_nanos() as u64
}

impl DinoFs {
    pub fn new(runtime: Runtime, factory: Arc<NodeFactory>) -> Self {
        Self { runtime, factory }
    }

    fn node(&self, ino: u64) -> Result<Arc<Node>, i32> {
        self.factory.node_by_ino(ino).ok_or(ENOENT)
    }

    fn node_attr(&self, node: &Arc<Node>) -> Result<FileAttr, i32> {
        self.runtime
            .block_on(node.getattr())
            .map(attr_from)
            .map_err(map_dino_err)
    }

    fn lookup_entry(&self, parent: u64, name: &str) -> Result<FileAttr, i32> {
        let parent_node = self.node(parent)?;
        let child = self
            .runtime
            .block_on(parent_node.lookup(name))
            .map_err(map_dino_err)?;
        self.node_attr(&child)
    }
}

impl Filesystem for DinoFs {
    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let name = match name.to_str() {
            Some(v) => v,
            None => {
                reply.error(EINVAL);
                return;
            }
        };
        match self.lookup_entry(parent, name) {
            Ok(attr) => reply.entry(&TTL, &attr, 0),
            Err(code) => reply.error(code),
        }
    }

    fn forget(&mut self, _req: &Request<'_>, ino: u64, _nlookup: u64) {
        if ino != ROOT_INO {
            self.factory.forget_ino(ino);
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyAttr) {
        match self.node(ino).and_then(|node| self.node_attr(&node)) {
            Ok(attr) => reply.attr(&TTL, &attr),
            Err(code) => reply.error(code),
        }
    }

    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        _atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        debug!(
            "setattr ino={} mode={:?} uid={:?} gid={:?} size={:?}",
            ino, mode, uid, gid, size
        );
        let node = match self.node(ino) {
            Ok(node) => node,
            Err(code) => {
                reply.error(code);
                return;
            }
        };
        let mtime_ns = mtime.map(|v| match v {
            TimeOrNow::SpecificTime(t) => system_time_ns(t),
            TimeOrNow::Now => system_time_ns(SystemTime::now()),
        });
        let changes = SetattrChanges {
            mode,
            uid,
            gid,
            size,
            mtime_ns,
        };
        if let Err(err) = self.runtime.block_on(node.setattr(changes)) {
            reply.error(map_dino_err(err));
            return;
        }
        match self.node_attr(&node) {
            Ok(attr) => reply.attr(&TTL, &attr),
            Err(code) => reply.error(code),
        }
    }

    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        let node = match self.node(ino) {
            Ok(node) => node,
            Err(code) => {
                reply.error(code);
                return;
            }
        };
        match self.runtime.block_on(node.readlink()) {
            Ok(target) => reply.data(&target),
            Err(err) => reply.error(map_dino_err(err)),
        }
    }

    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        let name = match name.to_str() {
            Some(v) => v,
            None => {
                reply.error(EINVAL);
                return;
            }
        };
        let parent_node = match self.node(parent) {
            Ok(node) => node,
            Err(code) => {
                reply.error(code);
                return;
            }
        };
        match self.runtime.block_on(parent_node.mkdir(name, mode)) {
            Ok(child) => match self.node_attr(&child) {
                Ok(attr) => reply.entry(&TTL, &attr, 0),
                Err(code) => reply.error(code),
            },
            Err(err) => reply.error(map_dino_err(err)),
        }
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let name = match name.to_str() {
            Some(v) => v,
            None => {
                reply.error(EINVAL);
                return;
            }
        };
        let parent_node = match self.node(parent) {
            Ok(node) => node,
            Err(code) => {
                reply.error(code);
                return;
            }
        };
        match self.runtime.block_on(parent_node.unlink(name)) {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(map_dino_err(err)),
        }
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let name = match name.to_str() {
            Some(v) => v,
            None => {
                reply.error(EINVAL);
                return;
            }
        };
        let parent_node = match self.node(parent) {
            Ok(node) => node,
            Err(code) => {
                reply.error(code);
                return;
            }
        };
        match self.runtime.block_on(parent_node.rmdir(name)) {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(map_dino_err(err)),
        }
    }

    fn symlink(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        link_name: &OsStr,
        target: &std::path::Path,
        reply: ReplyEntry,
    ) {
        let name = match link_name.to_str() {
            Some(v) => v,
            None => {
                reply.error(EINVAL);
                return;
            }
        };
        let target = match target.to_str() {
            Some(v) => v,
            None => {
                reply.error(EINVAL);
                return;
            }
        };
        let parent_node = match self.node(parent) {
            Ok(node) => node,
            Err(code) => {
                reply.error(code);
                return;
            }
        };
        match self.runtime.block_on(parent_node.symlink(target, name)) {
            Ok(child) => match self.node_attr(&child) {
                Ok(attr) => reply.entry(&TTL, &attr, 0),
                Err(code) => reply.error(code),
            },
            Err(err) => reply.error(map_dino_err(err)),
        }
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        let (name, newname) = match (name.to_str(), newname.to_str()) {
            (Some(a), Some(b)) => (a, b),
            _ => {
                reply.error(EINVAL);
                return;
            }
        };
        let (old_parent, new_parent) = match (self.node(parent), self.node(newparent)) {
            (Ok(a), Ok(b)) => (a, b),
            _ => {
                reply.error(ENOENT);
                return;
            }
        };
        match self
            .runtime
            .block_on(old_parent.rename(name, &new_parent, newname))
        {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(map_dino_err(err)),
        }
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        _flags: i32,
        reply: ReplyCreate,
    ) {
        let name = match name.to_str() {
            Some(v) => v,
            None => {
                reply.error(EINVAL);
                return;
            }
        };
        let parent_node = match self.node(parent) {
            Ok(node) => node,
            Err(code) => {
                reply.error(code);
                return;
            }
        };
        match self.runtime.block_on(parent_node.create(name, mode)) {
            Ok(child) => match self.node_attr(&child) {
                Ok(attr) => reply.created(&TTL, &attr, 0, 0, 0),
                Err(code) => reply.error(code),
            },
            Err(err) => reply.error(map_dino_err(err)),
        }
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        let node = match self.node(ino) {
            Ok(node) => node,
            Err(code) => {
                reply.error(code);
                return;
            }
        };
        match self.runtime.block_on(node.open()) {
            Ok(()) => reply.opened(0, 0),
            Err(err) => reply.error(map_dino_err(err)),
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let node = match self.node(ino) {
            Ok(node) => node,
            Err(code) => {
                reply.error(code);
                return;
            }
        };
        let data = self.runtime.block_on(node.read(offset.max(0) as u64, size));
        reply.data(&data);
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let node = match self.node(ino) {
            Ok(node) => node,
            Err(code) => {
                reply.error(code);
                return;
            }
        };
        let written = self.runtime.block_on(node.write(data, offset.max(0) as u64));
        reply.written(written);
    }

    fn flush(&mut self, _req: &Request<'_>, ino: u64, _fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        let node = match self.node(ino) {
            Ok(node) => node,
            Err(code) => {
                reply.error(code);
                return;
            }
        };
        match self.runtime.block_on(node.flush()) {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(map_dino_err(err)),
        }
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        reply.ok();
    }

    fn fsync(&mut self, _req: &Request<'_>, _ino: u64, _fh: u64, _datasync: bool, reply: ReplyEmpty) {
        // Syncing on each flush call is enough.
        reply.ok();
    }

    fn opendir(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        let node = match self.node(ino) {
            Ok(node) => node,
            Err(code) => {
                reply.error(code);
                return;
            }
        };
        match self.runtime.block_on(node.opendir()) {
            Ok(()) => reply.opened(0, 0),
            Err(err) => reply.error(map_dino_err(err)),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let node = match self.node(ino) {
            Ok(node) => node,
            Err(code) => {
                reply.error(code);
                return;
            }
        };
        let entries = match self.runtime.block_on(node.readdir()) {
            Ok(entries) => entries,
            Err(err) => {
                reply.error(map_dino_err(err));
                return;
            }
        };
        let mut all = Vec::with_capacity(entries.len() + 2);
        all.push((ino, FileType::Directory, ".".to_string()));
        all.push((ino, FileType::Directory, "..".to_string()));
        for entry in entries {
            all.push((entry.ino, file_type_of(entry.mode), entry.name));
        }
        for (i, (entry_ino, kind, name)) in
            all.into_iter().enumerate().skip(offset.max(0) as usize)
        {
            if reply.add(entry_ino, (i + 1) as i64, kind, name) {
                break;
            }
        }
        reply.ok();
    }

    fn releasedir(&mut self, _req: &Request<'_>, _ino: u64, _fh: u64, _flags: i32, reply: ReplyEmpty) {
        reply.ok();
    }

    fn fsyncdir(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _fh: u64,
        _datasync: bool,
        reply: ReplyEmpty,
    ) {
        reply.ok();
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: fuser::ReplyStatfs) {
        reply.statfs(0, 0, 0, 0, 0, 512, 255, 0);
    }

    fn access(&mut self, _req: &Request<'_>, _ino: u64, _mask: i32, reply: ReplyEmpty) {
        reply.ok();
    }

    fn setxattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        name: &OsStr,
        value: &[u8],
        flags: i32,
        _position: u32,
        reply: ReplyEmpty,
    ) {
        let name = match name.to_str() {
            Some(v) => v,
            None => {
                reply.error(EINVAL);
                return;
            }
        };
        let create = flags & XATTR_CREATE_FLAG != 0;
        let replace = flags & XATTR_REPLACE_FLAG != 0;
        let flags = match (create, replace) {
            (true, true) => {
                reply.error(EINVAL);
                return;
            }
            (true, false) => SetxattrFlags::Create,
            (false, true) => SetxattrFlags::Replace,
            (false, false) => SetxattrFlags::Default,
        };
        let node = match self.node(ino) {
            Ok(node) => node,
            Err(code) => {
                reply.error(code);
                return;
            }
        };
        match self.runtime.block_on(node.setxattr(name, value, flags)) {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(map_dino_err(err)),
        }
    }

    fn getxattr(&mut self, _req: &Request<'_>, ino: u64, name: &OsStr, size: u32, reply: ReplyXattr) {
        let name = match name.to_str() {
            Some(v) => v,
            None => {
                reply.error(EINVAL);
                return;
            }
        };
        let node = match self.node(ino) {
            Ok(node) => node,
            Err(code) => {
                reply.error(code);
                return;
            }
        };
        let value = match self.runtime.block_on(node.getxattr(name)) {
            Ok(value) => value,
            Err(err) => {
                reply.error(map_dino_err(err));
                return;
            }
        };
        if size == 0 {
            reply.size(value.len() as u32);
        } else if value.len() <= size as usize {
            reply.data(&value);
        } else {
            reply.error(libc::ERANGE);
        }
    }

    fn listxattr(&mut self, _req: &Request<'_>, ino: u64, size: u32, reply: ReplyXattr) {
        let node = match self.node(ino) {
            Ok(node) => node,
            Err(code) => {
                reply.error(code);
                return;
            }
        };
        let names = self.runtime.block_on(node.listxattr());
        let mut listing = Vec::new();
        for name in names {
            listing.extend_from_slice(name.as_bytes());
            listing.push(0);
        }
        if size == 0 {
            reply.size(listing.len() as u32);
        } else if listing.len() <= size as usize {
            reply.data(&listing);
        } else {
            reply.error(libc::ERANGE);
        }
    }
}
