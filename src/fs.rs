//! Namespace Adapter: the synchronous FUSE face of a mounted library.
//!
//! Every callback reconciles the index first, resolves through it, and
//! translates `LibraryError` into an errno reply. `fuser::mount2` delivers
//! one operation at a time to `&mut self`, so the exclusive borrow is the
//! mutual-exclusion region around the index; no locking is needed.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use fuser::{
    FileAttr, FileType, Filesystem, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory, ReplyEmpty,
    ReplyEntry, ReplyOpen, ReplyWrite, Request, TimeOrNow,
};

use crate::error::Result;
use crate::index::{LibraryIndex, Node, ROOT_FOLDER_ID};
use crate::inode::InodeTable;
use crate::store::now_ms;
use crate::thumb::Thumbnailer;

const TTL: Duration = Duration::from_secs(1);

fn ts(ms: i64) -> SystemTime {
    UNIX_EPOCH + Duration::from_millis(ms.max(0) as u64)
}

fn time_or_now_ms(t: TimeOrNow) -> i64 {
    match t {
        TimeOrNow::SpecificTime(t) => t
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0),
        TimeOrNow::Now => now_ms(),
    }
}

pub struct LibraryFs {
    index: LibraryIndex,
    inodes: InodeTable,
    thumbs: Thumbnailer,
    /// Open file handles: fh -> inode.
    handles: HashMap<u64, u64>,
    next_fh: u64,
    uid: u32,
    gid: u32,
}

impl LibraryFs {
    pub fn new(index: LibraryIndex) -> Self {
        Self {
            index,
            inodes: InodeTable::new(),
            thumbs: Thumbnailer::new(),
            handles: HashMap::new(),
            next_fh: 1,
            uid: unsafe { libc::getuid() },
            gid: unsafe { libc::getgid() },
        }
    }

    pub fn index(&self) -> &LibraryIndex {
        &self.index
    }

    /// Thumbnail read path: serve a derived preview of an asset, generating
    /// it lazily from current content. Failures here never touch the asset's
    /// own read/attribute behavior.
    pub fn preview(&mut self, asset_id: &str) -> Result<Vec<u8>> {
        self.index.reconcile(now_ms());
        let rec = self
            .index
            .asset(asset_id)
            .cloned()
            .ok_or(crate::error::LibraryError::NotFound)?;
        self.thumbs.preview(self.index.store(), &rec)
    }

    fn alloc_fh(&mut self, ino: u64) -> u64 {
        let fh = self.next_fh;
        self.next_fh += 1;
        self.handles.insert(fh, ino);
        fh
    }

    fn folder_attr(&mut self, id: &str) -> Option<FileAttr> {
        let folder = self.index.folder(id)?;
        let mtime = ts(folder.modification_time);
        let nlink = 2 + self.index.subfolder_count(id) as u32;
        let ino = self.inodes.ino(&Node::Folder(id.to_string()));
        Some(FileAttr {
            ino,
            size: 4096,
            blocks: 8,
            atime: mtime,
            mtime,
            ctime: mtime,
            crtime: mtime,
            kind: FileType::Directory,
            perm: 0o755,
            nlink,
            uid: self.uid,
            gid: self.gid,
            rdev: 0,
            blksize: 4096,
            flags: 0,
        })
    }

    fn asset_attr(&mut self, id: &str) -> Option<FileAttr> {
        let rec = self.index.asset(id)?.clone();
        let ino = self.inodes.ino(&Node::Asset(id.to_string()));
        Some(FileAttr {
            ino,
            size: rec.size,
            blocks: (rec.size + 511) / 512,
            atime: ts(rec.mtime),
            mtime: ts(rec.mtime),
            ctime: ts(rec.modification_time),
            crtime: ts(rec.btime),
            kind: FileType::RegularFile,
            perm: 0o644,
            nlink: 1,
            uid: self.uid,
            gid: self.gid,
            rdev: 0,
            blksize: 4096,
            flags: 0,
        })
    }

    fn node_attr(&mut self, node: &Node) -> Option<FileAttr> {
        match node {
            Node::Folder(id) => self.folder_attr(&id.clone()),
            Node::Asset(id) => self.asset_attr(&id.clone()),
        }
    }

    /// Resolve an inode to a folder id that still exists in the index.
    fn live_folder(&self, ino: u64) -> Option<String> {
        match self.inodes.node(ino)? {
            Node::Folder(id) if self.index.folder(id).is_some() => Some(id.clone()),
            _ => None,
        }
    }
}

impl Filesystem for LibraryFs {
    fn init(
        &mut self,
        _req: &Request,
        _config: &mut fuser::KernelConfig,
    ) -> std::result::Result<(), i32> {
        tracing::info!("[fs] FUSE initialized");
        Ok(())
    }

    fn lookup(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let name_str = match name.to_str() {
            Some(s) => s,
            None => {
                reply.error(libc::EINVAL);
                return;
            }
        };
        self.index.reconcile(now_ms());

        let folder_id = match self.live_folder(parent) {
            Some(id) => id,
            None => {
                reply.error(libc::ENOENT);
                return;
            }
        };

        let node = match name_str {
            "." => Some(Node::Folder(folder_id.clone())),
            ".." => {
                let parent_id = self
                    .index
                    .folder(&folder_id)
                    .and_then(|f| f.parent.clone())
                    .unwrap_or_else(|| ROOT_FOLDER_ID.to_string());
                Some(Node::Folder(parent_id))
            }
            _ => self.index.child(&folder_id, name_str),
        };

        match node.and_then(|n| self.node_attr(&n)) {
            Some(attr) => reply.entry(&TTL, &attr, 0),
            None => reply.error(libc::ENOENT),
        }
    }

    fn getattr(&mut self, _req: &Request, ino: u64, reply: ReplyAttr) {
        self.index.reconcile(now_ms());
        let node = self.inodes.node(ino).cloned();
        match node.and_then(|n| self.node_attr(&n)) {
            Some(attr) => reply.attr(&TTL, &attr),
            None => reply.error(libc::ENOENT),
        }
    }

    fn setattr(
        &mut self,
        _req: &Request,
        ino: u64,
        _mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
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
        self.index.reconcile(now_ms());
        let node = match self.inodes.node(ino).cloned() {
            Some(n) => n,
            None => {
                reply.error(libc::ENOENT);
                return;
            }
        };

        let asset_id = match node {
            Node::Asset(ref id) => id.clone(),
            Node::Folder(_) => {
                if size.is_some() {
                    reply.error(libc::EISDIR);
                } else {
                    // chmod/chown and friends are accepted but meaningless here
                    match self.node_attr(&node) {
                        Some(attr) => reply.attr(&TTL, &attr),
                        None => reply.error(libc::ENOENT),
                    }
                }
                return;
            }
        };

        if let Some(len) = size {
            if let Err(e) = self.index.truncate_asset(&asset_id, len, now_ms()) {
                reply.error(e.errno());
                return;
            }
            self.thumbs.invalidate(&asset_id);
        }
        if let Some(t) = mtime {
            if let Err(e) = self
                .index
                .touch_asset(&asset_id, Some(time_or_now_ms(t)), now_ms())
            {
                reply.error(e.errno());
                return;
            }
        }
        match self.asset_attr(&asset_id) {
            Some(attr) => reply.attr(&TTL, &attr),
            None => reply.error(libc::ENOENT),
        }
    }

    fn readdir(&mut self, _req: &Request, ino: u64, _fh: u64, offset: i64, mut reply: ReplyDirectory) {
        self.index.reconcile(now_ms());
        let folder_id = match self.live_folder(ino) {
            Some(id) => id,
            None => {
                reply.error(libc::ENOENT);
                return;
            }
        };
        let children = match self.index.lookup_children(&folder_id) {
            Ok(c) => c,
            Err(e) => {
                reply.error(e.errno());
                return;
            }
        };
        let parent_id = self
            .index
            .folder(&folder_id)
            .and_then(|f| f.parent.clone())
            .unwrap_or_else(|| ROOT_FOLDER_ID.to_string());
        let parent_ino = self.inodes.ino(&Node::Folder(parent_id));

        let mut entries = vec![
            (ino, FileType::Directory, ".".to_string()),
            (parent_ino, FileType::Directory, "..".to_string()),
        ];
        for (name, node) in children {
            let kind = match node {
                Node::Folder(_) => FileType::Directory,
                Node::Asset(_) => FileType::RegularFile,
            };
            entries.push((self.inodes.ino(&node), kind, name));
        }
        for (i, (ino, kind, name)) in entries.iter().enumerate().skip(offset as usize) {
            if reply.add(*ino, (i + 1) as i64, *kind, name) {
                break;
            }
        }
        reply.ok();
    }

    fn open(&mut self, _req: &Request, ino: u64, _flags: i32, reply: ReplyOpen) {
        self.index.reconcile(now_ms());
        let node = self.inodes.node(ino).cloned();
        match node {
            Some(Node::Asset(id)) if self.index.asset(&id).is_some() => {
                let fh = self.alloc_fh(ino);
                reply.opened(fh, 0);
            }
            Some(Node::Folder(_)) => reply.error(libc::EISDIR),
            _ => reply.error(libc::ENOENT),
        }
    }

    fn read(
        &mut self,
        _req: &Request,
        ino: u64,
        _fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        if offset < 0 {
            reply.error(libc::EINVAL);
            return;
        }
        self.index.reconcile(now_ms());
        let asset_id = match self.inodes.node(ino) {
            Some(Node::Asset(id)) => id.clone(),
            Some(Node::Folder(_)) => {
                reply.error(libc::EISDIR);
                return;
            }
            None => {
                reply.error(libc::ENOENT);
                return;
            }
        };
        // The asset may have vanished between reconciliation and here; that
        // race is an ordinary ENOENT.
        match self.index.read_asset_bytes(&asset_id, offset as u64, size) {
            Ok(data) => reply.data(&data),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn write(
        &mut self,
        _req: &Request,
        ino: u64,
        _fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        if offset < 0 {
            reply.error(libc::EINVAL);
            return;
        }
        self.index.reconcile(now_ms());
        let asset_id = match self.inodes.node(ino) {
            Some(Node::Asset(id)) => id.clone(),
            Some(Node::Folder(_)) => {
                reply.error(libc::EISDIR);
                return;
            }
            None => {
                reply.error(libc::ENOENT);
                return;
            }
        };
        match self.index.apply_write(&asset_id, offset as u64, data, now_ms()) {
            Ok(written) => {
                self.thumbs.invalidate(&asset_id);
                reply.written(written);
            }
            Err(e) => reply.error(e.errno()),
        }
    }

    fn create(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        _flags: i32,
        reply: ReplyCreate,
    ) {
        let name_str = match name.to_str() {
            Some(s) => s,
            None => {
                reply.error(libc::EINVAL);
                return;
            }
        };
        self.index.reconcile(now_ms());
        let folder_id = match self.live_folder(parent) {
            Some(id) => id,
            None => {
                reply.error(libc::ENOENT);
                return;
            }
        };
        match self.index.create_asset(&folder_id, name_str, now_ms()) {
            Ok(rec) => {
                let attr = match self.asset_attr(&rec.id) {
                    Some(a) => a,
                    None => {
                        reply.error(libc::EIO);
                        return;
                    }
                };
                let fh = self.alloc_fh(attr.ino);
                reply.created(&TTL, &attr, 0, fh, 0);
            }
            Err(e) => reply.error(e.errno()),
        }
    }

    fn mkdir(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        let name_str = match name.to_str() {
            Some(s) => s,
            None => {
                reply.error(libc::EINVAL);
                return;
            }
        };
        self.index.reconcile(now_ms());
        let parent_id = match self.live_folder(parent) {
            Some(id) => id,
            None => {
                reply.error(libc::ENOENT);
                return;
            }
        };
        match self.index.create_folder(&parent_id, name_str, now_ms()) {
            Ok(id) => match self.folder_attr(&id) {
                Some(attr) => reply.entry(&TTL, &attr, 0),
                None => reply.error(libc::EIO),
            },
            Err(e) => reply.error(e.errno()),
        }
    }

    fn rmdir(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let name_str = match name.to_str() {
            Some(s) => s,
            None => {
                reply.error(libc::EINVAL);
                return;
            }
        };
        self.index.reconcile(now_ms());
        let parent_id = match self.live_folder(parent) {
            Some(id) => id,
            None => {
                reply.error(libc::ENOENT);
                return;
            }
        };
        match self.index.child(&parent_id, name_str) {
            Some(Node::Folder(id)) => match self.index.remove_folder(&id, now_ms()) {
                Ok(()) => reply.ok(),
                Err(e) => reply.error(e.errno()),
            },
            Some(Node::Asset(_)) => reply.error(libc::ENOTDIR),
            None => reply.error(libc::ENOENT),
        }
    }

    fn unlink(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let name_str = match name.to_str() {
            Some(s) => s,
            None => {
                reply.error(libc::EINVAL);
                return;
            }
        };
        self.index.reconcile(now_ms());
        let parent_id = match self.live_folder(parent) {
            Some(id) => id,
            None => {
                reply.error(libc::ENOENT);
                return;
            }
        };
        match self.index.child(&parent_id, name_str) {
            Some(Node::Asset(id)) => match self.index.remove_asset(&id, now_ms()) {
                Ok(()) => {
                    self.thumbs.invalidate(&id);
                    reply.ok();
                }
                Err(e) => reply.error(e.errno()),
            },
            Some(Node::Folder(_)) => reply.error(libc::EISDIR),
            None => reply.error(libc::ENOENT),
        }
    }

    fn rename(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        let (name_str, newname_str) = match (name.to_str(), newname.to_str()) {
            (Some(a), Some(b)) => (a, b),
            _ => {
                reply.error(libc::EINVAL);
                return;
            }
        };
        self.index.reconcile(now_ms());
        let (old_folder, new_folder) = match (self.live_folder(parent), self.live_folder(newparent)) {
            (Some(a), Some(b)) => (a, b),
            _ => {
                reply.error(libc::ENOENT);
                return;
            }
        };

        let node = match self.index.child(&old_folder, name_str) {
            Some(n) => n,
            None => {
                reply.error(libc::ENOENT);
                return;
            }
        };

        match node {
            Node::Asset(id) => {
                // POSIX overwrite semantics for a plain-file target
                match self.index.child(&new_folder, newname_str) {
                    Some(Node::Asset(existing)) if existing != id => {
                        if let Err(e) = self.index.remove_asset(&existing, now_ms()) {
                            reply.error(e.errno());
                            return;
                        }
                        self.thumbs.invalidate(&existing);
                    }
                    Some(Node::Folder(_)) => {
                        reply.error(libc::EISDIR);
                        return;
                    }
                    _ => {}
                }
                match self.index.rename_asset(&id, &new_folder, newname_str, now_ms()) {
                    Ok(()) => reply.ok(),
                    Err(e) => reply.error(e.errno()),
                }
            }
            Node::Folder(id) => match self.index.rename_folder(&id, &new_folder, newname_str, now_ms()) {
                Ok(()) => reply.ok(),
                Err(e) => reply.error(e.errno()),
            },
        }
    }

    fn release(
        &mut self,
        _req: &Request,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        self.handles.remove(&fh);
        reply.ok();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LibraryError;
    use crate::store::LibraryStore;
    use serde_json::json;
    use std::fs;
    use tempfile::TempDir;

    fn write_json(path: impl AsRef<std::path::Path>, value: serde_json::Value) {
        fs::write(path, serde_json::to_vec(&value).unwrap()).unwrap();
    }

    fn library() -> TempDir {
        let dir = TempDir::new().unwrap();
        write_json(
            dir.path().join("metadata.json"),
            json!({
                "folders": [{ "id": "F1", "name": "Photos", "children": [], "modificationTime": 1000 }],
                "modificationTime": 1000,
            }),
        );
        write_json(dir.path().join("mtime.json"), json!({ "A1": 500 }));
        let asset_dir = dir.path().join("images/A1.info");
        fs::create_dir_all(&asset_dir).unwrap();
        write_json(
            asset_dir.join("metadata.json"),
            json!({
                "id": "A1", "name": "cat", "ext": "png", "size": 3,
                "btime": 400, "mtime": 500, "modificationTime": 500, "lastModified": 500,
                "folders": ["F1"], "isDeleted": false,
            }),
        );
        fs::write(asset_dir.join("cat.png"), b"abc").unwrap();
        dir
    }

    fn mount(dir: &TempDir) -> LibraryFs {
        let index = LibraryIndex::open(LibraryStore::new(dir.path()), 0).unwrap();
        LibraryFs::new(index)
    }

    #[test]
    fn attrs_reflect_the_index() {
        let dir = library();
        let mut fs = mount(&dir);

        let root = fs.folder_attr(ROOT_FOLDER_ID).unwrap();
        assert_eq!(root.ino, crate::inode::ROOT_INODE);
        assert_eq!(root.kind, FileType::Directory);
        assert_eq!(root.nlink, 4); // ".", "..", Photos, Unsorted

        let cat = fs.asset_attr("A1").unwrap();
        assert_eq!(cat.kind, FileType::RegularFile);
        assert_eq!(cat.size, 3);
        assert_eq!(cat.mtime, ts(500));
        assert_eq!(cat.crtime, ts(400));
    }

    #[test]
    fn inodes_stay_stable_across_attr_calls() {
        let dir = library();
        let mut fs = mount(&dir);
        let first = fs.asset_attr("A1").unwrap().ino;
        assert_eq!(fs.asset_attr("A1").unwrap().ino, first);
        assert_ne!(fs.folder_attr("F1").unwrap().ino, first);
    }

    #[test]
    fn preview_follows_content_and_isolates_failures() {
        let dir = library();
        let mut fs = mount(&dir);

        // give the asset decodable content first
        let png = {
            let img = image::DynamicImage::ImageRgb8(image::RgbImage::from_pixel(
                8,
                8,
                image::Rgb([1, 2, 3]),
            ));
            let mut out = Vec::new();
            img.write_to(&mut std::io::Cursor::new(&mut out), image::ImageFormat::Png)
                .unwrap();
            out
        };
        fs.index.truncate_asset("A1", 0, 1_000).unwrap();
        fs.index.apply_write("A1", 0, &png, 1_000).unwrap();
        assert!(fs.preview("A1").is_ok());

        // corrupt the content: preview degrades, reads keep working
        fs.index.truncate_asset("A1", 0, 2_000).unwrap();
        fs.index.apply_write("A1", 0, b"not an image", 2_000).unwrap();
        fs.thumbs.invalidate("A1");
        assert!(matches!(
            fs.preview("A1"),
            Err(LibraryError::ThumbnailUnavailable(_))
        ));
        assert_eq!(
            fs.index.read_asset_bytes("A1", 0, 64).unwrap(),
            b"not an image"
        );
    }

    #[test]
    fn preview_of_missing_asset_is_not_found() {
        let dir = library();
        let mut fs = mount(&dir);
        assert!(matches!(fs.preview("NOPE"), Err(LibraryError::NotFound)));
    }
}
