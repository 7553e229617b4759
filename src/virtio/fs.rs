//! virtio-fs (device id 26)
//!
//! The request queue carries FUSE messages; the host translates them onto an
//! abstract [`FsBackend`] — in the common case the unpacked OCI root
//! overlay. The mount tag in config space identifies the share. One hiprio
//! queue plus one request queue; multiqueue is negotiated down to one.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};
use vm_memory::GuestMemoryMmap;

use crate::virtio::{device_id, features, NotifyOutcome, Virtqueue, VirtioDevice};
use crate::Result;

pub const MAX_TAG_LEN: usize = 36;
const Q_REQUEST: usize = 1;

/// FUSE protocol version we answer INIT with.
const FUSE_MAJOR: u32 = 7;
const FUSE_MINOR: u32 = 31;
const MAX_WRITE: u32 = 1 << 20;

/// FUSE opcodes handled here; everything else answers ENOSYS.
mod op {
    pub const LOOKUP: u32 = 1;
    pub const FORGET: u32 = 2;
    pub const GETATTR: u32 = 3;
    pub const SETATTR: u32 = 4;
    pub const READLINK: u32 = 5;
    pub const SYMLINK: u32 = 6;
    pub const MKDIR: u32 = 9;
    pub const UNLINK: u32 = 10;
    pub const RMDIR: u32 = 11;
    pub const RENAME: u32 = 12;
    pub const OPEN: u32 = 14;
    pub const READ: u32 = 15;
    pub const WRITE: u32 = 16;
    pub const STATFS: u32 = 17;
    pub const RELEASE: u32 = 18;
    pub const FLUSH: u32 = 25;
    pub const INIT: u32 = 26;
    pub const OPENDIR: u32 = 27;
    pub const READDIR: u32 = 28;
    pub const RELEASEDIR: u32 = 29;
    pub const ACCESS: u32 = 34;
    pub const CREATE: u32 = 35;
    pub const DESTROY: u32 = 38;
}

const IN_HDR_LEN: usize = 40;
const OUT_HDR_LEN: usize = 16;
const ATTR_LEN: usize = 88;
const ENTRY_OUT_LEN: usize = 40 + ATTR_LEN;
const ATTR_OUT_LEN: usize = 16 + ATTR_LEN;

pub const ROOT_NODE: u64 = 1;

/// Attributes of one filesystem node, FUSE-shaped.
#[derive(Debug, Clone, Copy, Default)]
pub struct FsAttr {
    pub ino: u64,
    pub size: u64,
    pub mode: u32,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub mtime: i64,
}

impl FsAttr {
    fn encode(&self) -> [u8; ATTR_LEN] {
        let mut out = [0u8; ATTR_LEN];
        out[0..8].copy_from_slice(&self.ino.to_le_bytes());
        out[8..16].copy_from_slice(&self.size.to_le_bytes());
        out[16..24].copy_from_slice(&self.size.div_ceil(512).to_le_bytes()); // blocks
        out[32..40].copy_from_slice(&(self.mtime as u64).to_le_bytes()); // mtime
        out[60..64].copy_from_slice(&self.mode.to_le_bytes());
        out[64..68].copy_from_slice(&self.nlink.to_le_bytes());
        out[68..72].copy_from_slice(&self.uid.to_le_bytes());
        out[72..76].copy_from_slice(&self.gid.to_le_bytes());
        out[80..84].copy_from_slice(&4096u32.to_le_bytes()); // blksize
        out
    }
}

/// The filesystem the device serves. Node ids are backend-assigned;
/// [`ROOT_NODE`] is the mount root.
pub trait FsBackend: Send {
    fn lookup(&mut self, parent: u64, name: &str) -> io::Result<(u64, FsAttr)>;
    fn getattr(&mut self, node: u64) -> io::Result<FsAttr>;
    fn setattr(
        &mut self,
        node: u64,
        mode: Option<u32>,
        uid_gid: Option<(u32, u32)>,
        size: Option<u64>,
        mtime: Option<i64>,
    ) -> io::Result<FsAttr>;
    fn readlink(&mut self, node: u64) -> io::Result<String>;
    fn symlink(&mut self, parent: u64, name: &str, target: &str) -> io::Result<(u64, FsAttr)>;
    fn mkdir(&mut self, parent: u64, name: &str, mode: u32) -> io::Result<(u64, FsAttr)>;
    fn unlink(&mut self, parent: u64, name: &str) -> io::Result<()>;
    fn rmdir(&mut self, parent: u64, name: &str) -> io::Result<()>;
    fn rename(&mut self, parent: u64, name: &str, new_parent: u64, new_name: &str)
        -> io::Result<()>;
    fn open(&mut self, node: u64, flags: u32) -> io::Result<u64>;
    fn create(&mut self, parent: u64, name: &str, mode: u32, flags: u32)
        -> io::Result<(u64, FsAttr, u64)>;
    fn read(&mut self, node: u64, fh: u64, offset: u64, size: u32) -> io::Result<Vec<u8>>;
    fn write(&mut self, node: u64, fh: u64, offset: u64, data: &[u8]) -> io::Result<u32>;
    fn release(&mut self, node: u64, fh: u64) -> io::Result<()>;
    fn readdir(&mut self, node: u64) -> io::Result<Vec<(u64, String, FsAttr)>>;
    fn forget(&mut self, _node: u64) {}
}

/// [`FsBackend`] over a host directory tree.
pub struct DirBackend {
    root: PathBuf,
    nodes: HashMap<u64, PathBuf>,
    next_node: u64,
    handles: HashMap<u64, fs::File>,
    next_handle: u64,
}

impl DirBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let mut nodes = HashMap::new();
        nodes.insert(ROOT_NODE, root.clone());
        Self {
            root,
            nodes,
            next_node: 2,
            handles: HashMap::new(),
            next_handle: 1,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn node_path(&self, node: u64) -> io::Result<PathBuf> {
        self.nodes
            .get(&node)
            .cloned()
            .ok_or_else(|| io::Error::from_raw_os_error(libc::ESTALE))
    }

    fn child_path(&self, parent: u64, name: &str) -> io::Result<PathBuf> {
        if name.contains('/') || name == ".." {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }
        Ok(self.node_path(parent)?.join(name))
    }

    fn intern(&mut self, path: PathBuf) -> u64 {
        if let Some((&node, _)) = self.nodes.iter().find(|(_, p)| **p == path) {
            return node;
        }
        let node = self.next_node;
        self.next_node += 1;
        self.nodes.insert(node, path);
        node
    }

    fn attr_of(path: &Path) -> io::Result<FsAttr> {
        let meta = fs::symlink_metadata(path)?;
        Ok(FsAttr {
            ino: meta.ino(),
            size: meta.len(),
            mode: meta.mode(),
            nlink: meta.nlink() as u32,
            uid: meta.uid(),
            gid: meta.gid(),
            mtime: meta.mtime(),
        })
    }
}

impl FsBackend for DirBackend {
    fn lookup(&mut self, parent: u64, name: &str) -> io::Result<(u64, FsAttr)> {
        let path = self.child_path(parent, name)?;
        let attr = Self::attr_of(&path)?;
        Ok((self.intern(path), attr))
    }

    fn getattr(&mut self, node: u64) -> io::Result<FsAttr> {
        let path = self.node_path(node)?;
        Self::attr_of(&path)
    }

    fn setattr(
        &mut self,
        node: u64,
        mode: Option<u32>,
        uid_gid: Option<(u32, u32)>,
        size: Option<u64>,
        _mtime: Option<i64>,
    ) -> io::Result<FsAttr> {
        let path = self.node_path(node)?;
        if let Some(mode) = mode {
            fs::set_permissions(&path, fs::Permissions::from_mode(mode & 0o7777))?;
        }
        if let Some((uid, gid)) = uid_gid {
            let c_path = std::ffi::CString::new(path.as_os_str().as_encoded_bytes())
                .map_err(|_| io::Error::from_raw_os_error(libc::EINVAL))?;
            let ret = unsafe { libc::chown(c_path.as_ptr(), uid, gid) };
            if ret != 0 {
                return Err(io::Error::last_os_error());
            }
        }
        if let Some(size) = size {
            let file = fs::OpenOptions::new().write(true).open(&path)?;
            file.set_len(size)?;
        }
        Self::attr_of(&path)
    }

    fn readlink(&mut self, node: u64) -> io::Result<String> {
        let path = self.node_path(node)?;
        let target = fs::read_link(path)?;
        Ok(target.to_string_lossy().into_owned())
    }

    fn symlink(&mut self, parent: u64, name: &str, target: &str) -> io::Result<(u64, FsAttr)> {
        let path = self.child_path(parent, name)?;
        std::os::unix::fs::symlink(target, &path)?;
        let attr = Self::attr_of(&path)?;
        Ok((self.intern(path), attr))
    }

    fn mkdir(&mut self, parent: u64, name: &str, mode: u32) -> io::Result<(u64, FsAttr)> {
        let path = self.child_path(parent, name)?;
        fs::create_dir(&path)?;
        fs::set_permissions(&path, fs::Permissions::from_mode(mode & 0o7777))?;
        let attr = Self::attr_of(&path)?;
        Ok((self.intern(path), attr))
    }

    fn unlink(&mut self, parent: u64, name: &str) -> io::Result<()> {
        fs::remove_file(self.child_path(parent, name)?)
    }

    fn rmdir(&mut self, parent: u64, name: &str) -> io::Result<()> {
        fs::remove_dir(self.child_path(parent, name)?)
    }

    fn rename(
        &mut self,
        parent: u64,
        name: &str,
        new_parent: u64,
        new_name: &str,
    ) -> io::Result<()> {
        let from = self.child_path(parent, name)?;
        let to = self.child_path(new_parent, new_name)?;
        fs::rename(&from, &to)?;
        // Keep interned nodes pointing at the new location.
        for path in self.nodes.values_mut() {
            if *path == from {
                *path = to.clone();
            }
        }
        Ok(())
    }

    fn open(&mut self, node: u64, flags: u32) -> io::Result<u64> {
        let path = self.node_path(node)?;
        let write = flags & (libc::O_WRONLY | libc::O_RDWR) as u32 != 0;
        let file = fs::OpenOptions::new()
            .read(true)
            .write(write)
            .append(flags & libc::O_APPEND as u32 != 0)
            .open(path)?;
        let fh = self.next_handle;
        self.next_handle += 1;
        self.handles.insert(fh, file);
        Ok(fh)
    }

    fn create(
        &mut self,
        parent: u64,
        name: &str,
        mode: u32,
        _flags: u32,
    ) -> io::Result<(u64, FsAttr, u64)> {
        let path = self.child_path(parent, name)?;
        let file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)?;
        fs::set_permissions(&path, fs::Permissions::from_mode(mode & 0o7777))?;
        let attr = Self::attr_of(&path)?;
        let node = self.intern(path);
        let fh = self.next_handle;
        self.next_handle += 1;
        self.handles.insert(fh, file);
        Ok((node, attr, fh))
    }

    fn read(&mut self, _node: u64, fh: u64, offset: u64, size: u32) -> io::Result<Vec<u8>> {
        use std::os::unix::fs::FileExt;
        let file = self
            .handles
            .get(&fh)
            .ok_or_else(|| io::Error::from_raw_os_error(libc::EBADF))?;
        let mut buf = vec![0u8; size as usize];
        let n = file.read_at(&mut buf, offset)?;
        buf.truncate(n);
        Ok(buf)
    }

    fn write(&mut self, _node: u64, fh: u64, offset: u64, data: &[u8]) -> io::Result<u32> {
        use std::os::unix::fs::FileExt;
        let file = self
            .handles
            .get(&fh)
            .ok_or_else(|| io::Error::from_raw_os_error(libc::EBADF))?;
        file.write_all_at(data, offset)?;
        Ok(data.len() as u32)
    }

    fn release(&mut self, _node: u64, fh: u64) -> io::Result<()> {
        self.handles.remove(&fh);
        Ok(())
    }

    fn readdir(&mut self, node: u64) -> io::Result<Vec<(u64, String, FsAttr)>> {
        let path = self.node_path(node)?;
        let mut out = Vec::new();
        for entry in fs::read_dir(path)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let attr = Self::attr_of(&entry.path())?;
            let node = self.intern(entry.path());
            out.push((node, name, attr));
        }
        out.sort_by(|a, b| a.1.cmp(&b.1));
        Ok(out)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct FsState {
    tag: String,
    initialized: bool,
}

/// The virtio-fs device.
pub struct Fs {
    state: FsState,
    backend: Box<dyn FsBackend>,
}

impl Fs {
    pub fn new(tag: &str, backend: Box<dyn FsBackend>) -> crate::Result<Self> {
        if tag.is_empty() || tag.len() > MAX_TAG_LEN {
            return Err(crate::Error::InvalidConfig(format!(
                "virtio-fs tag must be 1..={} bytes, got {:?}",
                MAX_TAG_LEN, tag
            )));
        }
        Ok(Self {
            state: FsState {
                tag: tag.to_string(),
                initialized: false,
            },
            backend,
        })
    }

    /// Process one FUSE request, producing the reply bytes.
    fn handle_fuse(&mut self, request: &[u8]) -> Vec<u8> {
        if request.len() < IN_HDR_LEN {
            return Vec::new();
        }
        let opcode = u32::from_le_bytes(request[4..8].try_into().unwrap());
        let unique = u64::from_le_bytes(request[8..16].try_into().unwrap());
        let nodeid = u64::from_le_bytes(request[16..24].try_into().unwrap());
        let body = &request[IN_HDR_LEN..];
        trace!(opcode, unique, nodeid, "fuse request");

        let result: std::result::Result<Vec<u8>, i32> = match opcode {
            op::INIT => {
                self.state.initialized = true;
                debug!(tag = %self.state.tag, "virtio-fs initialized");
                let mut out = vec![0u8; 64];
                out[0..4].copy_from_slice(&FUSE_MAJOR.to_le_bytes());
                out[4..8].copy_from_slice(&FUSE_MINOR.to_le_bytes());
                out[8..12].copy_from_slice(&0x1000u32.to_le_bytes()); // max_readahead
                out[20..24].copy_from_slice(&MAX_WRITE.to_le_bytes());
                out[24..28].copy_from_slice(&1u32.to_le_bytes()); // time_gran
                Ok(out)
            }
            op::DESTROY => Ok(Vec::new()),
            op::LOOKUP => {
                let name = cstr(body);
                self.backend
                    .lookup(nodeid, &name)
                    .map(|(node, attr)| entry_out(node, &attr))
                    .map_err(errno)
            }
            op::FORGET => {
                self.backend.forget(nodeid);
                // FORGET has no reply.
                return Vec::new();
            }
            op::GETATTR => self
                .backend
                .getattr(nodeid)
                .map(|attr| attr_out(&attr))
                .map_err(errno),
            op::SETATTR => {
                // fuse_setattr_in: valid(0) padding(4) fh(8) size(16)
                // lock_owner(24) atime(32) mtime(40) ctime(48) *nsec(56..)
                // mode(68) unused(72) uid(76) gid(80).
                if body.len() < 88 {
                    Err(libc::EINVAL)
                } else {
                    let valid = u32::from_le_bytes(body[0..4].try_into().unwrap());
                    let size = u64::from_le_bytes(body[16..24].try_into().unwrap());
                    let mtime = u64::from_le_bytes(body[40..48].try_into().unwrap());
                    let mode = u32::from_le_bytes(body[68..72].try_into().unwrap());
                    let uid = u32::from_le_bytes(body[76..80].try_into().unwrap());
                    let gid = u32::from_le_bytes(body[80..84].try_into().unwrap());

                    const FATTR_MODE: u32 = 1 << 0;
                    const FATTR_UID: u32 = 1 << 1;
                    const FATTR_GID: u32 = 1 << 2;
                    const FATTR_SIZE: u32 = 1 << 3;
                    const FATTR_MTIME: u32 = 1 << 5;

                    self.backend
                        .setattr(
                            nodeid,
                            (valid & FATTR_MODE != 0).then_some(mode),
                            (valid & (FATTR_UID | FATTR_GID) != 0).then_some((uid, gid)),
                            (valid & FATTR_SIZE != 0).then_some(size),
                            (valid & FATTR_MTIME != 0).then_some(mtime as i64),
                        )
                        .map(|attr| attr_out(&attr))
                        .map_err(errno)
                }
            }
            op::READLINK => self
                .backend
                .readlink(nodeid)
                .map(|t| t.into_bytes())
                .map_err(errno),
            op::SYMLINK => {
                // Two NUL-terminated strings: name, target.
                let name = cstr(body);
                let target = cstr(&body[name.len() + 1..]);
                self.backend
                    .symlink(nodeid, &name, &target)
                    .map(|(node, attr)| entry_out(node, &attr))
                    .map_err(errno)
            }
            op::MKDIR => {
                if body.len() < 8 {
                    Err(libc::EINVAL)
                } else {
                    let mode = u32::from_le_bytes(body[0..4].try_into().unwrap());
                    let name = cstr(&body[8..]);
                    self.backend
                        .mkdir(nodeid, &name, mode)
                        .map(|(node, attr)| entry_out(node, &attr))
                        .map_err(errno)
                }
            }
            op::UNLINK => self
                .backend
                .unlink(nodeid, &cstr(body))
                .map(|_| Vec::new())
                .map_err(errno),
            op::RMDIR => self
                .backend
                .rmdir(nodeid, &cstr(body))
                .map(|_| Vec::new())
                .map_err(errno),
            op::RENAME => {
                if body.len() < 8 {
                    Err(libc::EINVAL)
                } else {
                    let new_parent = u64::from_le_bytes(body[0..8].try_into().unwrap());
                    let name = cstr(&body[8..]);
                    let new_name = cstr(&body[8 + name.len() + 1..]);
                    self.backend
                        .rename(nodeid, &name, new_parent, &new_name)
                        .map(|_| Vec::new())
                        .map_err(errno)
                }
            }
            op::OPEN | op::OPENDIR => {
                let flags = read_u32_at(body, 0);
                if opcode == op::OPENDIR {
                    // Directories stream through READDIR; fh unused.
                    Ok(open_out(0))
                } else {
                    self.backend
                        .open(nodeid, flags)
                        .map(open_out)
                        .map_err(errno)
                }
            }
            op::READ => {
                if body.len() < 24 {
                    Err(libc::EINVAL)
                } else {
                    let fh = u64::from_le_bytes(body[0..8].try_into().unwrap());
                    let offset = u64::from_le_bytes(body[8..16].try_into().unwrap());
                    let size = u32::from_le_bytes(body[16..20].try_into().unwrap());
                    self.backend.read(nodeid, fh, offset, size).map_err(errno)
                }
            }
            op::WRITE => {
                if body.len() < 40 {
                    Err(libc::EINVAL)
                } else {
                    let fh = u64::from_le_bytes(body[0..8].try_into().unwrap());
                    let offset = u64::from_le_bytes(body[8..16].try_into().unwrap());
                    let size = u32::from_le_bytes(body[16..20].try_into().unwrap()) as usize;
                    let data = &body[40..];
                    let data = &data[..size.min(data.len())];
                    self.backend
                        .write(nodeid, fh, offset, data)
                        .map(|n| {
                            let mut out = vec![0u8; 8];
                            out[0..4].copy_from_slice(&n.to_le_bytes());
                            out
                        })
                        .map_err(errno)
                }
            }
            op::STATFS => {
                // fuse_kstatfs: all-zero is accepted by Linux.
                Ok(vec![0u8; 80])
            }
            op::RELEASE | op::RELEASEDIR => {
                let fh = u64::from_le_bytes(body[0..8].try_into().unwrap_or([0; 8]));
                if opcode == op::RELEASE {
                    let _ = self.backend.release(nodeid, fh);
                }
                Ok(Vec::new())
            }
            op::FLUSH => Ok(Vec::new()),
            op::ACCESS => Ok(Vec::new()),
            op::READDIR => {
                if body.len() < 24 {
                    Err(libc::EINVAL)
                } else {
                    let offset = u64::from_le_bytes(body[8..16].try_into().unwrap());
                    let size = u32::from_le_bytes(body[16..20].try_into().unwrap()) as usize;
                    self.backend
                        .readdir(nodeid)
                        .map(|entries| encode_dirents(&entries, offset, size))
                        .map_err(errno)
                }
            }
            op::CREATE => {
                if body.len() < 16 {
                    Err(libc::EINVAL)
                } else {
                    let flags = u32::from_le_bytes(body[0..4].try_into().unwrap());
                    let mode = u32::from_le_bytes(body[4..8].try_into().unwrap());
                    let name = cstr(&body[16..]);
                    self.backend
                        .create(nodeid, &name, mode, flags)
                        .map(|(node, attr, fh)| {
                            let mut out = entry_out(node, &attr);
                            out.extend_from_slice(&open_out(fh));
                            out
                        })
                        .map_err(errno)
                }
            }
            other => {
                trace!(opcode = other, "fuse opcode not implemented");
                Err(libc::ENOSYS)
            }
        };

        match result {
            Ok(payload) => reply(unique, 0, &payload),
            Err(errno) => reply(unique, -errno, &[]),
        }
    }
}

fn cstr(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

fn read_u32_at(body: &[u8], off: usize) -> u32 {
    body.get(off..off + 4)
        .map(|b| u32::from_le_bytes(b.try_into().unwrap()))
        .unwrap_or(0)
}

fn errno(e: io::Error) -> i32 {
    e.raw_os_error().unwrap_or(libc::EIO)
}

fn reply(unique: u64, error: i32, payload: &[u8]) -> Vec<u8> {
    let mut out = vec![0u8; OUT_HDR_LEN + payload.len()];
    out[0..4].copy_from_slice(&((OUT_HDR_LEN + payload.len()) as u32).to_le_bytes());
    out[4..8].copy_from_slice(&error.to_le_bytes());
    out[8..16].copy_from_slice(&unique.to_le_bytes());
    out[OUT_HDR_LEN..].copy_from_slice(payload);
    out
}

fn entry_out(node: u64, attr: &FsAttr) -> Vec<u8> {
    let mut out = vec![0u8; ENTRY_OUT_LEN];
    out[0..8].copy_from_slice(&node.to_le_bytes());
    // generation 0; entry/attr valid 1 second.
    out[16..24].copy_from_slice(&1u64.to_le_bytes());
    out[24..32].copy_from_slice(&1u64.to_le_bytes());
    out[40..].copy_from_slice(&attr.encode());
    out
}

fn attr_out(attr: &FsAttr) -> Vec<u8> {
    let mut out = vec![0u8; ATTR_OUT_LEN];
    out[0..8].copy_from_slice(&1u64.to_le_bytes()); // attr_valid
    out[16..].copy_from_slice(&attr.encode());
    out
}

fn open_out(fh: u64) -> Vec<u8> {
    let mut out = vec![0u8; 16];
    out[0..8].copy_from_slice(&fh.to_le_bytes());
    out
}

/// fuse_dirent stream: entries from `offset`, capped at `size` bytes.
/// `off` in each dirent is the index of the next entry.
fn encode_dirents(entries: &[(u64, String, FsAttr)], offset: u64, size: usize) -> Vec<u8> {
    let mut out = Vec::new();
    for (i, (node, name, attr)) in entries.iter().enumerate().skip(offset as usize) {
        let name_bytes = name.as_bytes();
        let entry_len = 24 + name_bytes.len();
        let padded = entry_len.div_ceil(8) * 8;
        if out.len() + padded > size {
            break;
        }
        let mut entry = vec![0u8; padded];
        entry[0..8].copy_from_slice(&node.to_le_bytes());
        entry[8..16].copy_from_slice(&((i + 1) as u64).to_le_bytes());
        entry[16..20].copy_from_slice(&(name_bytes.len() as u32).to_le_bytes());
        entry[20..24].copy_from_slice(&((attr.mode >> 12) & 0xF).to_le_bytes());
        entry[24..24 + name_bytes.len()].copy_from_slice(name_bytes);
        out.extend_from_slice(&entry);
    }
    out
}

impl VirtioDevice for Fs {
    fn device_id(&self) -> u32 {
        device_id::FS
    }

    fn device_features(&self) -> u64 {
        features::VERSION_1
    }

    fn queue_max_sizes(&self) -> Vec<u16> {
        // hiprio + one request queue.
        vec![16, 128]
    }

    fn config_read(&self, offset: u64, data: &mut [u8]) {
        // {char tag[36], u32 num_request_queues}
        let mut config = [0u8; MAX_TAG_LEN + 4];
        let tag = self.state.tag.as_bytes();
        config[..tag.len()].copy_from_slice(tag);
        config[MAX_TAG_LEN..].copy_from_slice(&1u32.to_le_bytes());
        for (i, slot) in data.iter_mut().enumerate() {
            *slot = config.get(offset as usize + i).copied().unwrap_or(0);
        }
    }

    fn handle_notify(
        &mut self,
        queue: usize,
        queues: &mut [Virtqueue],
        mem: &GuestMemoryMmap,
    ) -> Result<NotifyOutcome> {
        let mut outcome = NotifyOutcome::default();
        let q = &mut queues[queue];
        while let Some(chain) = q.pop_chain(mem)? {
            let request = chain.read_all(mem)?;
            let response = if queue == Q_REQUEST || queue == 0 {
                self.handle_fuse(&request)
            } else {
                Vec::new()
            };
            let n = chain.write_at(mem, 0, &response)?;
            q.add_used(mem, chain.head, n as u32)?;
            outcome.merge(NotifyOutcome::used(queue));
        }
        Ok(outcome)
    }

    fn save_state(&self) -> Result<Vec<u8>> {
        // Open handles do not survive snapshots; the guest re-opens after
        // restore (FUSE_INIT re-handshake on reconnect).
        Ok(postcard::to_stdvec(&self.state)?)
    }

    fn restore_state(&mut self, blob: &[u8]) -> Result<()> {
        self.state = postcard::from_bytes(blob)?;
        Ok(())
    }
}
