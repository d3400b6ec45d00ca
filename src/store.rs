//! Backing-store surface: every read and write against the library's on-disk
//! files goes through here.
//!
//! Layout of a library bundle:
//!   <root>/metadata.json              folder tree + structure stamp
//!   <root>/mtime.json                 asset id -> last-modified (ms)
//!   <root>/images/<id>.info/metadata.json
//!   <root>/images/<id>.info/<name>.<ext>
//!   <root>/images/<id>.info/<id>_thumbnail.png

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use rand::Rng;

use crate::error::{LibraryError, Result};
use crate::model::{AssetId, AssetRecord, LibraryMeta};

const META_FILE: &str = "metadata.json";
const MTIME_FILE: &str = "mtime.json";
const IMAGES_DIR: &str = "images";
const INFO_SUFFIX: &str = ".info";

const ID_LEN: usize = 13;
const ID_CHARS: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Current time as a millisecond epoch, the unit the library format uses.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Generate a fresh 13-character uppercase-alphanumeric identifier.
pub fn new_id() -> String {
    let mut rng = rand::rng();
    (0..ID_LEN)
        .map(|_| ID_CHARS[rng.random_range(0..ID_CHARS.len())] as char)
        .collect()
}

pub struct LibraryStore {
    root: PathBuf,
}

impl LibraryStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn asset_dir(&self, id: &str) -> PathBuf {
        self.root
            .join(IMAGES_DIR)
            .join(format!("{}{}", id, INFO_SUFFIX))
    }

    pub fn content_path(&self, asset: &AssetRecord) -> PathBuf {
        self.asset_dir(&asset.id).join(asset.fullname())
    }

    pub fn thumbnail_path(&self, id: &str) -> PathBuf {
        self.asset_dir(id).join(format!("{}_thumbnail.png", id))
    }

    // ---- library metadata --------------------------------------------------

    pub fn read_meta(&self) -> Result<LibraryMeta> {
        let raw = fs::read(self.root.join(META_FILE))?;
        Ok(serde_json::from_slice(&raw)?)
    }

    pub fn write_meta(&self, meta: &LibraryMeta) -> Result<()> {
        let bytes = serde_json::to_vec(meta)?;
        fs::write(self.root.join(META_FILE), bytes)?;
        Ok(())
    }

    // ---- change ledger -----------------------------------------------------

    pub fn read_mtimes(&self) -> Result<HashMap<AssetId, i64>> {
        let raw = fs::read(self.root.join(MTIME_FILE))?;
        Ok(serde_json::from_slice(&raw)?)
    }

    /// Refresh an asset's entry in the change ledger. A missing ledger is
    /// recreated rather than treated as fatal on the write path.
    fn bump_mtime(&self, id: &str, now_ms: i64) -> Result<()> {
        let mut mtimes = match self.read_mtimes() {
            Ok(m) => m,
            Err(LibraryError::NotFound) => HashMap::new(),
            Err(e) => return Err(e),
        };
        mtimes.insert(id.to_string(), now_ms);
        let bytes = serde_json::to_vec(&mtimes)?;
        fs::write(self.root.join(MTIME_FILE), bytes)?;
        Ok(())
    }

    // ---- asset metadata ----------------------------------------------------

    pub fn read_asset(&self, id: &str) -> Result<AssetRecord> {
        let raw = fs::read(self.asset_dir(id).join(META_FILE))?;
        Ok(serde_json::from_slice(&raw)?)
    }

    /// Persist an asset record and refresh its change-ledger entry.
    pub fn write_asset(&self, asset: &AssetRecord) -> Result<()> {
        let dir = self.asset_dir(&asset.id);
        fs::create_dir_all(&dir)?;
        let bytes = serde_json::to_vec(asset)?;
        fs::write(dir.join(META_FILE), bytes)?;
        self.bump_mtime(&asset.id, asset.modification_time)
    }

    /// Ids of every asset directory under `images/`. An absent `images/`
    /// directory is an empty library, not an error.
    pub fn scan_asset_ids(&self) -> Result<Vec<AssetId>> {
        let images = self.root.join(IMAGES_DIR);
        let entries = match fs::read_dir(&images) {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut ids = Vec::new();
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if let Some(id) = name.strip_suffix(INFO_SUFFIX) {
                ids.push(id.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }

    // ---- binary content ----------------------------------------------------

    pub fn read_content(&self, asset: &AssetRecord, offset: u64, size: u32) -> Result<Vec<u8>> {
        let file = File::open(self.content_path(asset))?;
        let mut buf = vec![0u8; size as usize];
        let n = file.read_at(&mut buf, offset)?;
        buf.truncate(n);
        Ok(buf)
    }

    pub fn read_content_full(&self, asset: &AssetRecord) -> Result<Vec<u8>> {
        Ok(fs::read(self.content_path(asset))?)
    }

    /// Write at an offset, materializing the file on first write. Returns the
    /// resulting content length.
    pub fn write_content(&self, asset: &AssetRecord, offset: u64, data: &[u8]) -> Result<u64> {
        fs::create_dir_all(self.asset_dir(&asset.id))?;
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .open(self.content_path(asset))?;
        file.write_at(data, offset)?;
        Ok(file.metadata()?.len())
    }

    pub fn truncate_content(&self, asset: &AssetRecord, len: u64) -> Result<()> {
        fs::create_dir_all(self.asset_dir(&asset.id))?;
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .open(self.content_path(asset))?;
        file.set_len(len)?;
        Ok(())
    }

    /// Rename the content file (and thumbnail, if present) to match a renamed
    /// record. Missing files are tolerated: content may never have been
    /// materialized.
    pub fn rename_content(&self, old: &AssetRecord, new: &AssetRecord) -> Result<()> {
        let (from, to) = (self.content_path(old), self.content_path(new));
        if from != to && from.exists() {
            fs::rename(&from, &to)?;
        }
        Ok(())
    }

    pub fn write_thumbnail(&self, id: &str, png: &[u8]) -> Result<()> {
        fs::create_dir_all(self.asset_dir(id))?;
        fs::write(self.thumbnail_path(id), png)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn empty_library() -> (TempDir, LibraryStore) {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(META_FILE), b"{\"folders\":[],\"modificationTime\":1}").unwrap();
        std::fs::write(dir.path().join(MTIME_FILE), b"{}").unwrap();
        let store = LibraryStore::new(dir.path());
        (dir, store)
    }

    fn sample_asset(id: &str) -> AssetRecord {
        serde_json::from_value(serde_json::json!({
            "id": id,
            "name": "cat",
            "ext": "png",
            "size": 0,
            "btime": 1000,
            "mtime": 1000,
            "modificationTime": 1000,
            "lastModified": 1000,
            "folders": ["F1"],
        }))
        .unwrap()
    }

    #[test]
    fn id_generation_shape() {
        let id = new_id();
        assert_eq!(id.len(), 13);
        assert!(id.bytes().all(|b| ID_CHARS.contains(&b)));
        assert_ne!(new_id(), new_id());
    }

    #[test]
    fn asset_roundtrip_bumps_ledger() {
        let (_dir, store) = empty_library();
        let asset = sample_asset("A0000000000001");
        store.write_asset(&asset).unwrap();

        let back = store.read_asset(&asset.id).unwrap();
        assert_eq!(back, asset);
        assert_eq!(store.read_mtimes().unwrap().get(&asset.id), Some(&1000));
    }

    #[test]
    fn content_write_read_offset_truncate() {
        let (_dir, store) = empty_library();
        let asset = sample_asset("A0000000000002");

        assert_eq!(store.write_content(&asset, 0, b"hello world").unwrap(), 11);
        assert_eq!(store.write_content(&asset, 6, b"there").unwrap(), 11);
        assert_eq!(store.read_content(&asset, 6, 16).unwrap(), b"there");
        // read past EOF is a short (empty) read, not an error
        assert!(store.read_content(&asset, 100, 4).unwrap().is_empty());

        store.truncate_content(&asset, 5).unwrap();
        assert_eq!(store.read_content(&asset, 0, 64).unwrap(), b"hello");
    }

    #[test]
    fn missing_content_is_not_found() {
        let (_dir, store) = empty_library();
        let asset = sample_asset("A0000000000003");
        assert!(matches!(
            store.read_content(&asset, 0, 4),
            Err(LibraryError::NotFound)
        ));
    }

    #[test]
    fn scan_skips_foreign_entries() {
        let (dir, store) = empty_library();
        std::fs::create_dir_all(dir.path().join("images/AAA.info")).unwrap();
        std::fs::create_dir_all(dir.path().join("images/BBB.info")).unwrap();
        std::fs::create_dir_all(dir.path().join("images/.DS_Store")).unwrap();
        assert_eq!(store.scan_asset_ids().unwrap(), vec!["AAA", "BBB"]);
    }
}
