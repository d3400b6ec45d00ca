//! On-disk record types for the library's JSON metadata.
//!
//! Field names mirror the library format exactly (camelCase on disk), so a
//! record can be decoded, edited and re-encoded without mangling files the
//! owning application still reads. Fields the adapter does not interpret
//! (tags, palettes, ...) are carried through untouched.

use serde::{Deserialize, Serialize};

/// Stable opaque asset identifier (13 uppercase alphanumerics).
pub type AssetId = String;
/// Stable opaque folder identifier.
pub type FolderId = String;

/// One media item, stored at `images/<id>.info/metadata.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetRecord {
    pub id: AssetId,
    pub name: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub btime: i64,
    #[serde(default)]
    pub mtime: i64,
    #[serde(default)]
    pub ext: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub folders: Vec<FolderId>,
    #[serde(default, rename = "isDeleted")]
    pub is_deleted: bool,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub annotation: String,
    #[serde(default, rename = "modificationTime")]
    pub modification_time: i64,
    #[serde(default)]
    pub height: u32,
    #[serde(default)]
    pub width: u32,
    #[serde(default, rename = "lastModified")]
    pub last_modified: i64,
    #[serde(default)]
    pub palettes: Vec<Palette>,
}

impl AssetRecord {
    /// Entry name as exposed in a directory listing: `name.ext`, or just
    /// `name` for extension-less assets.
    pub fn fullname(&self) -> String {
        if self.ext.is_empty() {
            self.name.clone()
        } else {
            format!("{}.{}", self.name, self.ext)
        }
    }

    /// Stamp all content-modification times at once.
    pub fn touch(&mut self, now_ms: i64) {
        self.mtime = now_ms;
        self.modification_time = now_ms;
        self.last_modified = now_ms;
    }
}

/// Dominant color extracted from an asset; opaque to the adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Palette {
    #[serde(default)]
    pub color: Vec<u16>,
    #[serde(default)]
    pub ratio: f64,
}

/// One node of the folder tree nested inside `metadata.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FolderRecord {
    #[serde(default)]
    pub id: FolderId,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, rename = "modificationTime")]
    pub modification_time: i64,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub children: Vec<FolderRecord>,
}

impl FolderRecord {
    pub fn new(id: FolderId, name: String, now_ms: i64) -> Self {
        Self {
            id,
            name,
            description: String::new(),
            modification_time: now_ms,
            tags: Vec::new(),
            children: Vec::new(),
        }
    }
}

/// Root metadata file of a library (`metadata.json`). `modificationTime` is
/// the folder-structure change-tracking stamp the reconciler compares.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LibraryMeta {
    #[serde(default)]
    pub folders: Vec<FolderRecord>,
    #[serde(default, rename = "smartFolders")]
    pub smart_folders: Vec<serde_json::Value>,
    #[serde(default, rename = "quickAccess")]
    pub quick_access: Vec<serde_json::Value>,
    #[serde(default, rename = "tagsGroups")]
    pub tags_groups: Vec<serde_json::Value>,
    #[serde(default, rename = "modificationTime")]
    pub modification_time: i64,
    #[serde(default, rename = "applicationVersion")]
    pub application_version: String,
}

/// Split a filesystem entry name into (stem, extension).
pub fn split_name(name: &str) -> (String, String) {
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() && !ext.is_empty() => {
            (stem.to_string(), ext.to_string())
        }
        _ => (name.to_string(), String::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_library_json_and_ignores_unknown_fields() {
        let raw = r#"{
            "id": "ABC1234567890",
            "name": "cat",
            "size": 42,
            "btime": 1000,
            "mtime": 2000,
            "ext": "png",
            "tags": ["pet"],
            "folders": ["F1"],
            "isDeleted": false,
            "url": "",
            "annotation": "",
            "modificationTime": 2000,
            "height": 10,
            "width": 20,
            "lastModified": 2000,
            "palettes": [{"color": [250, 248, 249], "ratio": 51.0}],
            "star": 5
        }"#;
        let rec: AssetRecord = serde_json::from_str(raw).unwrap();
        assert_eq!(rec.fullname(), "cat.png");
        assert_eq!(rec.folders, vec!["F1".to_string()]);
        assert!(!rec.is_deleted);

        let back = serde_json::to_string(&rec).unwrap();
        assert!(back.contains("\"isDeleted\":false"));
        assert!(back.contains("\"modificationTime\":2000"));
    }

    #[test]
    fn fullname_without_extension() {
        let mut rec: AssetRecord = serde_json::from_str(r#"{"id":"X","name":"notes"}"#).unwrap();
        assert_eq!(rec.fullname(), "notes");
        rec.ext = "md".into();
        assert_eq!(rec.fullname(), "notes.md");
    }

    #[test]
    fn split_name_handles_dots() {
        assert_eq!(split_name("cat.png"), ("cat".into(), "png".into()));
        assert_eq!(split_name("archive.tar.gz"), ("archive.tar".into(), "gz".into()));
        assert_eq!(split_name("README"), ("README".into(), String::new()));
        assert_eq!(split_name(".hidden"), (".hidden".into(), String::new()));
    }
}
