//! Library Index: the in-memory snapshot of a library's asset/folder graph
//! and the throttled reconciliation that keeps it synchronized with on-disk
//! state mutated by the owning application.
//!
//! The snapshot is rebuilt wholesale when the folder structure changes
//! (structure changes are rare and a rebuild is easy to reason about) and
//! patched per-asset otherwise, driven by the change ledger (`mtime.json`).
//! A failed pass is abandoned and the last-known-good snapshot stays in
//! force; the throttle clock is not advanced so the next operation retries.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use crate::error::{LibraryError, Result};
use crate::model::{split_name, AssetId, AssetRecord, FolderId, FolderRecord, LibraryMeta};
use crate::store::{new_id, LibraryStore};

/// Virtual root of the namespace; not present in `metadata.json`.
pub const ROOT_FOLDER_ID: &str = "root";
/// Virtual holding folder for assets that belong to no folder. The id is the
/// sentinel the library format itself uses for "no folder".
pub const UNSORTED_FOLDER_ID: &str = "null";
pub const UNSORTED_NAME: &str = "Unsorted";

/// Minimum interval between reconciliation disk reads.
const THROTTLE_MS: i64 = 1000;

/// A resolvable namespace entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Node {
    Folder(FolderId),
    Asset(AssetId),
}

/// Flattened view of one folder, derived from the nested metadata tree.
/// `name` is the disambiguated entry name exposed in the namespace.
#[derive(Debug, Clone, PartialEq)]
pub struct FolderView {
    pub id: FolderId,
    pub name: String,
    pub parent: Option<FolderId>,
    pub modification_time: i64,
}

/// The reconciled in-memory index. The four maps are mutually consistent at
/// every point observable outside a reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    pub assets: HashMap<AssetId, AssetRecord>,
    pub folders: HashMap<FolderId, FolderView>,
    pub children: HashMap<FolderId, BTreeMap<String, Node>>,
    pub paths: HashMap<PathBuf, FolderId>,
}

pub struct LibraryIndex {
    store: LibraryStore,
    /// Authoritative in-memory copy of `metadata.json`; structural mutations
    /// edit a clone and commit it only after the backing write succeeds.
    meta: LibraryMeta,
    snapshot: Snapshot,
    /// Change-ledger timestamps as of the last completed pass.
    asset_mtimes: HashMap<AssetId, i64>,
    /// Folder-structure stamp the snapshot was built against.
    structure_stamp: i64,
    last_check: i64,
}

impl LibraryIndex {
    /// Full scan of the library. Missing or unparseable change-tracking
    /// files are fatal here: the library cannot be served without them.
    pub fn open(store: LibraryStore, now_ms: i64) -> Result<Self> {
        let meta = store.read_meta()?;
        let ledger = store.read_mtimes()?;
        let mut index = Self {
            store,
            meta,
            snapshot: Snapshot::default(),
            asset_mtimes: HashMap::new(),
            structure_stamp: 0,
            last_check: now_ms,
        };
        index.rebuild(ledger)?;
        tracing::info!(
            "indexed library: {} folders, {} assets",
            index.snapshot.folders.len(),
            index.snapshot.assets.len()
        );
        Ok(index)
    }

    pub fn store(&self) -> &LibraryStore {
        &self.store
    }

    pub fn snapshot(&self) -> &Snapshot {
        &self.snapshot
    }

    // ---- reconciliation ----------------------------------------------------

    /// Throttled two-tier diff against the on-disk state. Cheap no-op inside
    /// the throttle window. Never fails: an unreadable backing store abandons
    /// the pass, keeps the previous snapshot, and leaves the clock alone so
    /// the next operation retries immediately.
    pub fn reconcile(&mut self, now_ms: i64) {
        if now_ms - self.last_check < THROTTLE_MS {
            return;
        }
        match self.reconcile_pass() {
            Ok(()) => self.last_check = now_ms,
            Err(e) => {
                tracing::warn!("reconciliation abandoned, serving last-known snapshot: {}", e);
            }
        }
    }

    fn reconcile_pass(&mut self) -> Result<()> {
        // Tier 1: folder structure. Any stamp change discards the snapshot;
        // the rebuild re-reads assets too, so the asset tier is skipped.
        let meta = self.store.read_meta()?;
        if meta.modification_time != self.structure_stamp {
            tracing::debug!("folder structure changed on disk, rebuilding index");
            let ledger = self.store.read_mtimes()?;
            self.meta = meta;
            return self.rebuild(ledger);
        }

        // Tier 2: per-asset diff against the change ledger.
        let ledger = self.store.read_mtimes()?;

        let gone: Vec<AssetId> = self
            .snapshot
            .assets
            .keys()
            .filter(|id| !ledger.contains_key(*id))
            .cloned()
            .collect();
        for id in gone {
            // The ledger dropped the entry; evict only once the record is
            // confirmed gone or soft-deleted, so an incomplete ledger does
            // not hide live assets.
            match self.store.read_asset(&id) {
                Err(LibraryError::NotFound) => self.evict_asset(&id),
                Ok(rec) if rec.is_deleted => self.evict_asset(&id),
                Ok(_) => {}
                Err(e) => tracing::warn!("could not re-read asset {}: {}", id, e),
            }
        }

        for (id, ts) in &ledger {
            if self.asset_mtimes.get(id) == Some(ts) {
                continue;
            }
            let known = self.snapshot.assets.contains_key(id);
            match self.store.read_asset(id) {
                Err(LibraryError::NotFound) => {
                    if known {
                        self.evict_asset(id);
                    }
                }
                Ok(rec) if rec.is_deleted => {
                    if known {
                        self.evict_asset(id);
                    }
                }
                Ok(rec) => {
                    tracing::debug!("absorbing external change to asset {}", id);
                    if known {
                        self.remove_asset_entries(id);
                    }
                    self.snapshot.assets.insert(rec.id.clone(), rec.clone());
                    self.insert_asset_entries(&rec);
                }
                Err(e) => tracing::warn!("could not read asset {}: {}", id, e),
            }
        }

        self.asset_mtimes = ledger;
        Ok(())
    }

    /// Rebuild every map from `self.meta` plus a fresh asset scan.
    fn rebuild(&mut self, ledger: HashMap<AssetId, i64>) -> Result<()> {
        let mut assets = HashMap::new();
        let mut asset_mtimes = ledger;
        for id in self.store.scan_asset_ids()? {
            let rec = match self.store.read_asset(&id) {
                Ok(rec) => rec,
                Err(LibraryError::NotFound) => {
                    tracing::warn!("asset directory {} has no metadata, skipping", id);
                    continue;
                }
                Err(e) => return Err(e),
            };
            if rec.is_deleted {
                continue;
            }
            // Assets the ledger does not track yet are seeded from their own
            // record so the next diff has a baseline.
            asset_mtimes
                .entry(rec.id.clone())
                .or_insert(rec.modification_time);
            assets.insert(rec.id.clone(), rec);
        }
        self.snapshot.assets = assets;
        self.asset_mtimes = asset_mtimes;
        self.structure_stamp = self.meta.modification_time;
        self.reindex_structure();
        Ok(())
    }

    /// Re-derive the folder maps from the metadata tree, then re-enter every
    /// asset. Asset records themselves are untouched.
    fn reindex_structure(&mut self) {
        let mut folders = HashMap::new();
        let mut children: HashMap<FolderId, BTreeMap<String, Node>> = HashMap::new();
        let mut paths = HashMap::new();

        folders.insert(
            ROOT_FOLDER_ID.to_string(),
            FolderView {
                id: ROOT_FOLDER_ID.to_string(),
                name: String::new(),
                parent: None,
                modification_time: self.meta.modification_time,
            },
        );
        children.insert(ROOT_FOLDER_ID.to_string(), BTreeMap::new());
        paths.insert(PathBuf::from("/"), ROOT_FOLDER_ID.to_string());

        folders.insert(
            UNSORTED_FOLDER_ID.to_string(),
            FolderView {
                id: UNSORTED_FOLDER_ID.to_string(),
                name: UNSORTED_NAME.to_string(),
                parent: Some(ROOT_FOLDER_ID.to_string()),
                modification_time: self.meta.modification_time,
            },
        );
        children.insert(UNSORTED_FOLDER_ID.to_string(), BTreeMap::new());
        children
            .get_mut(ROOT_FOLDER_ID)
            .unwrap()
            .insert(UNSORTED_NAME.to_string(), Node::Folder(UNSORTED_FOLDER_ID.to_string()));
        paths.insert(Path::new("/").join(UNSORTED_NAME), UNSORTED_FOLDER_ID.to_string());

        fn walk(
            recs: &[FolderRecord],
            parent_id: &str,
            parent_path: &Path,
            folders: &mut HashMap<FolderId, FolderView>,
            children: &mut HashMap<FolderId, BTreeMap<String, Node>>,
            paths: &mut HashMap<PathBuf, FolderId>,
        ) {
            for rec in recs {
                if rec.id.is_empty() {
                    continue;
                }
                let base = if rec.name.is_empty() { rec.id.clone() } else { rec.name.clone() };
                let taken = children
                    .get(parent_id)
                    .map_or(false, |m| m.contains_key(&base));
                let entry = if taken { format!("{}~{}", base, rec.id) } else { base };

                children
                    .get_mut(parent_id)
                    .unwrap()
                    .insert(entry.clone(), Node::Folder(rec.id.clone()));
                let path = parent_path.join(&entry);
                paths.insert(path.clone(), rec.id.clone());
                folders.insert(
                    rec.id.clone(),
                    FolderView {
                        id: rec.id.clone(),
                        name: entry,
                        parent: Some(parent_id.to_string()),
                        modification_time: rec.modification_time,
                    },
                );
                children.entry(rec.id.clone()).or_default();
                walk(&rec.children, &rec.id, &path, folders, children, paths);
            }
        }
        walk(
            &self.meta.folders,
            ROOT_FOLDER_ID,
            Path::new("/"),
            &mut folders,
            &mut children,
            &mut paths,
        );

        self.snapshot.folders = folders;
        self.snapshot.children = children;
        self.snapshot.paths = paths;

        // Deterministic disambiguation: lowest id wins the plain name.
        let mut ids: Vec<AssetId> = self.snapshot.assets.keys().cloned().collect();
        ids.sort();
        for id in ids {
            let rec = self.snapshot.assets[&id].clone();
            self.insert_asset_entries(&rec);
        }
    }

    fn insert_asset_entries(&mut self, rec: &AssetRecord) {
        let mut targets: Vec<FolderId> = rec
            .folders
            .iter()
            .filter(|f| self.snapshot.folders.contains_key(f.as_str()))
            .cloned()
            .collect();
        if targets.is_empty() {
            if !rec.folders.is_empty() {
                tracing::warn!(
                    "asset {} references unknown folders {:?}, exposing under {}",
                    rec.id,
                    rec.folders,
                    UNSORTED_NAME
                );
            }
            targets.push(UNSORTED_FOLDER_ID.to_string());
        }
        for folder in targets {
            let map = self.snapshot.children.entry(folder).or_default();
            let plain = rec.fullname();
            let key = if map.contains_key(&plain) { shadow_name(rec) } else { plain };
            map.insert(key, Node::Asset(rec.id.clone()));
        }
    }

    fn remove_asset_entries(&mut self, id: &str) {
        let target = Node::Asset(id.to_string());
        for map in self.snapshot.children.values_mut() {
            map.retain(|_, node| *node != target);
        }
    }

    fn evict_asset(&mut self, id: &str) {
        tracing::debug!("evicting asset {} from index", id);
        self.remove_asset_entries(id);
        self.snapshot.assets.remove(id);
    }

    // ---- queries -----------------------------------------------------------

    pub fn folder(&self, id: &str) -> Option<&FolderView> {
        self.snapshot.folders.get(id)
    }

    pub fn asset(&self, id: &str) -> Option<&AssetRecord> {
        self.snapshot.assets.get(id)
    }

    pub fn child(&self, folder_id: &str, name: &str) -> Option<Node> {
        self.snapshot.children.get(folder_id)?.get(name).cloned()
    }

    /// Children of a folder in entry-name order.
    pub fn lookup_children(&self, folder_id: &str) -> Result<Vec<(String, Node)>> {
        let map = self
            .snapshot
            .children
            .get(folder_id)
            .ok_or(LibraryError::NotFound)?;
        Ok(map.iter().map(|(n, node)| (n.clone(), node.clone())).collect())
    }

    /// Resolve an absolute namespace path to a folder or asset.
    pub fn lookup_by_path(&self, path: &Path) -> Option<Node> {
        if let Some(id) = self.snapshot.paths.get(path) {
            return Some(Node::Folder(id.clone()));
        }
        let parent = self.snapshot.paths.get(path.parent()?)?;
        self.child(parent, path.file_name()?.to_str()?)
    }

    pub fn subfolder_count(&self, folder_id: &str) -> usize {
        self.snapshot
            .children
            .get(folder_id)
            .map(|m| m.values().filter(|n| matches!(n, Node::Folder(_))).count())
            .unwrap_or(0)
    }

    pub fn root_modified(&self) -> i64 {
        self.meta.modification_time
    }

    /// Byte-range read of an asset's backing content. A vanished asset is a
    /// normal `NotFound`, never a fault.
    pub fn read_asset_bytes(&self, id: &str, offset: u64, size: u32) -> Result<Vec<u8>> {
        let rec = self.snapshot.assets.get(id).ok_or(LibraryError::NotFound)?;
        self.store.read_content(rec, offset, size)
    }

    // ---- mutations (backing write first, index second) ---------------------

    /// Create an empty asset under a folder. Content is materialized on the
    /// first write.
    pub fn create_asset(&mut self, folder_id: &str, entry_name: &str, now_ms: i64) -> Result<AssetRecord> {
        if !self.snapshot.folders.contains_key(folder_id) {
            return Err(LibraryError::NotFound);
        }
        if self.child(folder_id, entry_name).is_some() {
            return Err(LibraryError::AlreadyExists);
        }
        let (name, ext) = split_name(entry_name);
        let rec = AssetRecord {
            id: new_id(),
            name,
            size: 0,
            btime: now_ms,
            mtime: now_ms,
            ext,
            tags: Vec::new(),
            folders: membership_for(folder_id),
            is_deleted: false,
            url: String::new(),
            annotation: String::new(),
            modification_time: now_ms,
            height: 0,
            width: 0,
            last_modified: now_ms,
            palettes: Vec::new(),
        };
        self.store.write_asset(&rec)?;
        self.snapshot.assets.insert(rec.id.clone(), rec.clone());
        self.insert_asset_entries(&rec);
        Ok(rec)
    }

    /// Soft-delete an asset: the record is flagged rather than erased, the
    /// way the owning application expects.
    pub fn remove_asset(&mut self, id: &str, now_ms: i64) -> Result<()> {
        let mut rec = self
            .snapshot
            .assets
            .get(id)
            .cloned()
            .ok_or(LibraryError::NotFound)?;
        rec.is_deleted = true;
        rec.touch(now_ms);
        self.store.write_asset(&rec)?;
        self.evict_asset(id);
        Ok(())
    }

    /// Rename and/or move an asset. The backing writes happen first; the
    /// snapshot is only touched once they land, so a failed write leaves the
    /// index exactly as it was.
    pub fn rename_asset(
        &mut self,
        id: &str,
        new_folder_id: &str,
        new_entry_name: &str,
        now_ms: i64,
    ) -> Result<()> {
        let old = self
            .snapshot
            .assets
            .get(id)
            .cloned()
            .ok_or(LibraryError::NotFound)?;
        if !self.snapshot.folders.contains_key(new_folder_id) {
            return Err(LibraryError::NotFound);
        }
        let (name, ext) = split_name(new_entry_name);
        let mut new = old.clone();
        new.name = name;
        // "mv cat.png cat" keeps the extension rather than producing a
        // different file type.
        new.ext = if ext.is_empty() { old.ext.clone() } else { ext };
        new.folders = membership_for(new_folder_id);
        new.touch(now_ms);

        self.store.rename_content(&old, &new)?;
        if let Err(e) = self.store.write_asset(&new) {
            let _ = self.store.rename_content(&new, &old);
            return Err(e);
        }
        self.remove_asset_entries(id);
        self.snapshot.assets.insert(id.to_string(), new.clone());
        self.insert_asset_entries(&new);
        Ok(())
    }

    /// Write bytes at an offset, updating size and content timestamps. The
    /// cached ledger timestamp is deliberately left stale: the next
    /// reconciliation absorbs our own write through the same diff path as
    /// everyone else's.
    pub fn apply_write(&mut self, id: &str, offset: u64, data: &[u8], now_ms: i64) -> Result<u32> {
        let mut rec = self
            .snapshot
            .assets
            .get(id)
            .cloned()
            .ok_or(LibraryError::NotFound)?;
        rec.size = self.store.write_content(&rec, offset, data)?;
        rec.touch(now_ms);
        self.store.write_asset(&rec)?;
        self.snapshot.assets.insert(id.to_string(), rec);
        Ok(data.len() as u32)
    }

    pub fn truncate_asset(&mut self, id: &str, len: u64, now_ms: i64) -> Result<()> {
        let mut rec = self
            .snapshot
            .assets
            .get(id)
            .cloned()
            .ok_or(LibraryError::NotFound)?;
        self.store.truncate_content(&rec, len)?;
        rec.size = len;
        rec.touch(now_ms);
        self.store.write_asset(&rec)?;
        self.snapshot.assets.insert(id.to_string(), rec);
        Ok(())
    }

    /// Timestamp-only update (utimens).
    pub fn touch_asset(&mut self, id: &str, mtime_ms: Option<i64>, now_ms: i64) -> Result<()> {
        let mut rec = self
            .snapshot
            .assets
            .get(id)
            .cloned()
            .ok_or(LibraryError::NotFound)?;
        rec.mtime = mtime_ms.unwrap_or(now_ms);
        rec.modification_time = now_ms;
        rec.last_modified = now_ms;
        self.store.write_asset(&rec)?;
        self.snapshot.assets.insert(id.to_string(), rec);
        Ok(())
    }

    /// Create a folder under `parent_id`. Structural writes commit a clone of
    /// the metadata tree, then re-derive the folder maps eagerly; the cached
    /// structure stamp is updated so our own write does not look external.
    pub fn create_folder(&mut self, parent_id: &str, name: &str, now_ms: i64) -> Result<FolderId> {
        if parent_id == UNSORTED_FOLDER_ID {
            return Err(LibraryError::InvalidArgument(
                "cannot create inside the virtual holding folder".into(),
            ));
        }
        if !self.snapshot.folders.contains_key(parent_id) {
            return Err(LibraryError::NotFound);
        }
        if self.child(parent_id, name).is_some() {
            return Err(LibraryError::AlreadyExists);
        }
        let rec = FolderRecord::new(new_id(), name.to_string(), now_ms);
        let id = rec.id.clone();
        let mut next = self.meta.clone();
        if parent_id == ROOT_FOLDER_ID {
            next.folders.push(rec);
        } else {
            let parent = find_folder_mut(&mut next.folders, parent_id).ok_or(LibraryError::NotFound)?;
            parent.children.push(rec);
            parent.modification_time = now_ms;
        }
        self.commit_meta(next, now_ms)?;
        Ok(id)
    }

    /// Remove an empty folder.
    pub fn remove_folder(&mut self, id: &str, now_ms: i64) -> Result<()> {
        if id == ROOT_FOLDER_ID || id == UNSORTED_FOLDER_ID {
            return Err(LibraryError::InvalidArgument("virtual folder".into()));
        }
        if !self.snapshot.folders.contains_key(id) {
            return Err(LibraryError::NotFound);
        }
        if self.snapshot.children.get(id).is_some_and(|m| !m.is_empty()) {
            return Err(LibraryError::NotEmpty);
        }
        let mut next = self.meta.clone();
        detach_folder(&mut next.folders, id).ok_or(LibraryError::NotFound)?;
        self.commit_meta(next, now_ms)
    }

    /// Rename and/or reparent a folder.
    pub fn rename_folder(
        &mut self,
        id: &str,
        new_parent_id: &str,
        new_name: &str,
        now_ms: i64,
    ) -> Result<()> {
        if id == ROOT_FOLDER_ID || id == UNSORTED_FOLDER_ID || new_parent_id == UNSORTED_FOLDER_ID {
            return Err(LibraryError::InvalidArgument("virtual folder".into()));
        }
        if !self.snapshot.folders.contains_key(id)
            || !self.snapshot.folders.contains_key(new_parent_id)
        {
            return Err(LibraryError::NotFound);
        }
        if new_parent_id == id || self.is_descendant(id, new_parent_id) {
            return Err(LibraryError::InvalidArgument(
                "cannot move a folder into itself".into(),
            ));
        }
        if let Some(existing) = self.child(new_parent_id, new_name) {
            if existing != Node::Folder(id.to_string()) {
                return Err(LibraryError::AlreadyExists);
            }
        }
        let mut next = self.meta.clone();
        let mut rec = detach_folder(&mut next.folders, id).ok_or(LibraryError::NotFound)?;
        rec.name = new_name.to_string();
        rec.modification_time = now_ms;
        if new_parent_id == ROOT_FOLDER_ID {
            next.folders.push(rec);
        } else {
            let parent =
                find_folder_mut(&mut next.folders, new_parent_id).ok_or(LibraryError::NotFound)?;
            parent.children.push(rec);
            parent.modification_time = now_ms;
        }
        self.commit_meta(next, now_ms)
    }

    fn commit_meta(&mut self, mut next: LibraryMeta, now_ms: i64) -> Result<()> {
        next.modification_time = now_ms;
        self.store.write_meta(&next)?;
        self.meta = next;
        self.structure_stamp = self.meta.modification_time;
        self.reindex_structure();
        Ok(())
    }

    /// Is `folder_id` somewhere below `ancestor_id`?
    fn is_descendant(&self, ancestor_id: &str, folder_id: &str) -> bool {
        let mut cursor = self.snapshot.folders.get(folder_id).and_then(|f| f.parent.clone());
        while let Some(id) = cursor {
            if id == ancestor_id {
                return true;
            }
            cursor = self.snapshot.folders.get(&id).and_then(|f| f.parent.clone());
        }
        false
    }
}

/// Folder membership list stored in an asset record for a target folder.
/// The virtual folders mean "no membership".
fn membership_for(folder_id: &str) -> Vec<FolderId> {
    if folder_id == ROOT_FOLDER_ID || folder_id == UNSORTED_FOLDER_ID {
        Vec::new()
    } else {
        vec![folder_id.to_string()]
    }
}

/// Collision-suffixed entry name: `name~<id>.ext`.
fn shadow_name(rec: &AssetRecord) -> String {
    if rec.ext.is_empty() {
        format!("{}~{}", rec.name, rec.id)
    } else {
        format!("{}~{}.{}", rec.name, rec.id, rec.ext)
    }
}

fn find_folder_mut<'a>(folders: &'a mut [FolderRecord], id: &str) -> Option<&'a mut FolderRecord> {
    for rec in folders.iter_mut() {
        if rec.id == id {
            return Some(rec);
        }
        if let Some(found) = find_folder_mut(&mut rec.children, id) {
            return Some(found);
        }
    }
    None
}

fn detach_folder(folders: &mut Vec<FolderRecord>, id: &str) -> Option<FolderRecord> {
    if let Some(pos) = folders.iter().position(|f| f.id == id) {
        return Some(folders.remove(pos));
    }
    for rec in folders.iter_mut() {
        if let Some(found) = detach_folder(&mut rec.children, id) {
            return Some(found);
        }
    }
    None
}
