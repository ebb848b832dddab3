//! File catalog: shared-file descriptors, their seeders, and the name+size keyed lists a node keeps.

use std::path::{Path, PathBuf};

use tracing::warn;

use crate::chunk::{self, MissingRange};
use crate::integrity;
use crate::protocol::{PeerEndpoint, SharedFile};

/// One place a file can be fetched from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileAddress {
    /// Connection the address was learned on (0 when not tied to one).
    pub connection_id: u64,
    pub endpoint: PeerEndpoint,
    pub remote_path: String,
}

impl FileAddress {
    pub fn from_endpoint(endpoint: PeerEndpoint) -> Self {
        Self {
            connection_id: 0,
            endpoint,
            remote_path: String::new(),
        }
    }
}

/// Catalog record for one shared file, local or being downloaded.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileItem {
    /// Directory-assigned id; 0 means unassigned.
    pub file_id: u32,
    pub name: String,
    pub size: u64,
    /// Local path: the shared file, or the reassembled download once complete.
    pub path: PathBuf,
    /// SHA-256 of the content, when known. Not used for identity.
    pub hash: Option<String>,
    pub addresses: Vec<FileAddress>,
    pub completed: bool,
    /// Flat `[start, count, start, count, ...]` runs of absent chunks.
    pub missing_pieces: Vec<u32>,
}

impl FileItem {
    pub fn new(file_id: u32, name: impl Into<String>, size: u64) -> Self {
        Self {
            file_id,
            name: name.into(),
            size,
            ..Self::default()
        }
    }

    /// Same file: identical name and size.
    pub fn same_file(&self, name: &str, size: u64) -> bool {
        self.name == name && self.size == size
    }

    pub fn missing_ranges(&self) -> Vec<MissingRange> {
        chunk::pair_ranges(&self.missing_pieces)
    }

    pub fn set_missing_ranges(&mut self, ranges: &[MissingRange]) {
        self.missing_pieces = chunk::flatten_ranges(ranges);
    }

    /// Add an address unless an identical endpoint is already attached.
    pub fn add_address(&mut self, address: FileAddress) -> bool {
        if self.addresses.iter().any(|a| a.endpoint == address.endpoint) {
            return false;
        }
        self.addresses.push(address);
        true
    }

    /// Announcement line for `addFiles`.
    pub fn shared_file(&self) -> SharedFile {
        SharedFile {
            name: self.name.clone(),
            size: self.size,
            path: self.path.display().to_string(),
        }
    }
}

/// Ordered list of `FileItem`s keyed by (name, size).
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    items: Vec<FileItem>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add items not already present (by name and size). Returns how many were added.
    pub fn add_items(&mut self, items: impl IntoIterator<Item = FileItem>) -> usize {
        let mut added = 0;
        for item in items {
            if !self.contains(&item.name, item.size) {
                self.items.push(item);
                added += 1;
            }
        }
        added
    }

    pub fn contains(&self, name: &str, size: u64) -> bool {
        self.items.iter().any(|i| i.same_file(name, size))
    }

    pub fn get(&self, name: &str, size: u64) -> Option<&FileItem> {
        self.items.iter().find(|i| i.same_file(name, size))
    }

    pub fn get_mut(&mut self, name: &str, size: u64) -> Option<&mut FileItem> {
        self.items.iter_mut().find(|i| i.same_file(name, size))
    }

    pub fn by_id(&self, file_id: u32) -> Option<&FileItem> {
        self.items.iter().find(|i| i.file_id == file_id)
    }

    pub fn by_id_mut(&mut self, file_id: u32) -> Option<&mut FileItem> {
        self.items.iter_mut().find(|i| i.file_id == file_id)
    }

    pub fn remove_by_id(&mut self, file_id: u32) -> Option<FileItem> {
        let pos = self.items.iter().position(|i| i.file_id == file_id)?;
        Some(self.items.remove(pos))
    }

    pub fn items(&self) -> &[FileItem] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Turn user-supplied paths into shareable items.
///
/// A directory contributes its regular files (one level deep); a regular file contributes
/// itself; anything missing is skipped with a warning. Paths are canonicalised and hashed.
pub fn collect_files(paths: &[PathBuf]) -> Vec<FileItem> {
    let mut out = Vec::new();
    for path in paths {
        let meta = match std::fs::metadata(path) {
            Ok(m) => m,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "could not find file or folder");
                continue;
            }
        };
        if meta.is_dir() {
            let entries = match std::fs::read_dir(path) {
                Ok(e) => e,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "could not read folder");
                    continue;
                }
            };
            let mut files: Vec<PathBuf> = entries
                .filter_map(Result::ok)
                .map(|e| e.path())
                .filter(|p| p.is_file())
                .collect();
            files.sort();
            out.extend(files.iter().filter_map(|p| describe_file(p)));
        } else if meta.is_file() {
            out.extend(describe_file(path));
        }
    }
    out
}

fn describe_file(path: &Path) -> Option<FileItem> {
    let real = match path.canonicalize() {
        Ok(p) => p,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "could not resolve path");
            return None;
        }
    };
    let size = std::fs::metadata(&real).ok()?.len();
    let name = real.file_name()?.to_string_lossy().into_owned();
    let mut item = FileItem::new(0, name, size);
    item.hash = integrity::hash_file(&real).ok();
    item.path = real;
    Some(item)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_is_name_and_size() {
        let mut catalog = Catalog::new();
        assert_eq!(catalog.add_items([FileItem::new(1, "a.txt", 10)]), 1);
        // same name+size, different id: duplicate
        assert_eq!(catalog.add_items([FileItem::new(2, "a.txt", 10)]), 0);
        // same name, different size: distinct
        assert_eq!(catalog.add_items([FileItem::new(3, "a.txt", 11)]), 1);
        assert_eq!(catalog.len(), 2);
        assert_eq!(catalog.get("a.txt", 10).unwrap().file_id, 1);
        assert!(catalog.get("a.txt", 12).is_none());
    }

    #[test]
    fn lookup_and_remove_by_id() {
        let mut catalog = Catalog::new();
        catalog.add_items([FileItem::new(4, "x", 1), FileItem::new(5, "y", 2)]);
        assert_eq!(catalog.by_id(5).unwrap().name, "y");
        assert_eq!(catalog.remove_by_id(4).unwrap().name, "x");
        assert!(catalog.by_id(4).is_none());
        assert!(catalog.remove_by_id(4).is_none());
    }

    #[test]
    fn addresses_are_deduplicated() {
        let mut item = FileItem::new(1, "a", 1);
        let addr = FileAddress::from_endpoint(PeerEndpoint::new("10.0.0.1", 27891));
        assert!(item.add_address(addr.clone()));
        assert!(!item.add_address(addr));
        assert_eq!(item.addresses.len(), 1);
    }

    #[test]
    fn missing_pieces_stay_flat() {
        let mut item = FileItem::new(1, "a", 1000);
        item.set_missing_ranges(&[MissingRange::new(2, 1)]);
        assert_eq!(item.missing_pieces, vec![2, 1]);
        assert_eq!(item.missing_ranges(), vec![MissingRange::new(2, 1)]);
    }

    #[test]
    fn collect_expands_directories_and_skips_missing() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("one.txt"), b"1").unwrap();
        std::fs::write(dir.path().join("two.txt"), b"22").unwrap();
        std::fs::create_dir(dir.path().join("nested")).unwrap();
        let single = dir.path().join("nested").join("three.bin");
        std::fs::write(&single, b"333").unwrap();

        let items = collect_files(&[
            dir.path().to_path_buf(),
            single.clone(),
            dir.path().join("absent"),
        ]);
        let names: Vec<(&str, u64)> = items.iter().map(|i| (i.name.as_str(), i.size)).collect();
        assert_eq!(names, vec![("one.txt", 1), ("two.txt", 2), ("three.bin", 3)]);
        assert!(items.iter().all(|i| i.path.is_absolute() && i.hash.is_some()));
        assert!(items.iter().all(|i| i.file_id == 0));
    }
}
