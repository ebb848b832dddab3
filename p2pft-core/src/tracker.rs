//! Piece tracker: persist verified chunks as fragment files, check a download for completeness,
//! reassemble it, or report which chunk runs are still missing.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::catalog::FileItem;
use crate::chunk::{self, FragmentName, MissingRange, FRAGMENT_EXT};
use crate::config::TransferConfig;
use crate::wire::{self, ChecksumMismatch, ChunkFrame, FrameDecodeError};

/// Longest final file name, in bytes.
pub const MAX_FILENAME_LENGTH: usize = 255;

#[derive(Debug, Clone)]
pub struct PieceTracker {
    config: TransferConfig,
}

/// Result of handing one received frame to the tracker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkReceiveResult {
    Stored(PathBuf),
    /// Checksum disagreed; nothing was written.
    IntegrityFailed(ChecksumMismatch),
}

/// Result of reviewing one download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReviewOutcome {
    Complete(PathBuf),
    Missing(Vec<MissingRange>),
}

impl PieceTracker {
    pub fn new(config: TransferConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    pub fn chunk_size(&self) -> usize {
        self.config.chunk_size
    }

    pub fn fragment_path(&self, name: FragmentName) -> PathBuf {
        self.config.fragment_dir.join(name.to_string())
    }

    /// Decode, verify and persist a raw chunk frame.
    pub fn receive_frame(&self, bytes: &[u8]) -> Result<ChunkReceiveResult, TrackerError> {
        let (frame, _) = wire::decode_chunk_frame(bytes)?;
        self.receive_chunk(&frame)
    }

    /// Verify a decoded frame and persist its payload. A mismatch writes nothing.
    pub fn receive_chunk(&self, frame: &ChunkFrame) -> Result<ChunkReceiveResult, TrackerError> {
        if let Err(mismatch) = frame.verify() {
            return Ok(ChunkReceiveResult::IntegrityFailed(mismatch));
        }
        let name = FragmentName::new(
            frame.header.file_id,
            frame.header.index,
            frame.header.total_chunks,
        );
        let path = self.store_fragment(name, &frame.payload)?;
        Ok(ChunkReceiveResult::Stored(path))
    }

    /// Write a fragment under a temporary name, then rename it into place.
    pub fn store_fragment(&self, name: FragmentName, payload: &[u8]) -> Result<PathBuf, TrackerError> {
        let dir = &self.config.fragment_dir;
        fs::create_dir_all(dir).map_err(|e| TrackerError::io(dir, e))?;
        let path = self.fragment_path(name);
        let tmp = path.with_extension(format!("{}.tmp", FRAGMENT_EXT));
        let write = || -> io::Result<()> {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(payload)?;
            file.sync_all()?;
            fs::rename(&tmp, &path)
        };
        write().map_err(|e| TrackerError::io(&path, e))?;
        debug!(fragment = %name, bytes = payload.len(), "fragment stored");
        Ok(path)
    }

    /// Presence table for chunks `1..=total` of `item`. Entry `i` describes chunk `i + 1`.
    ///
    /// A fragment counts only if its total matches and its length is the expected chunk length.
    pub fn scan(&self, item: &FileItem) -> Result<Vec<bool>, TrackerError> {
        let chunk_size = self.chunk_size();
        let total = chunk::total_chunks(item.size, chunk_size);
        let mut present = vec![false; total as usize];
        for (name, path) in self.fragments_of(item.file_id)? {
            if name.total != total || name.index == 0 || name.index > total {
                continue;
            }
            let expected = chunk::chunk_len(item.size, chunk_size, name.index) as u64;
            match fs::metadata(&path) {
                Ok(m) if m.is_file() && m.len() == expected => {
                    present[name.index as usize - 1] = true;
                }
                _ => {}
            }
        }
        Ok(present)
    }

    /// Reassemble `item` if every chunk is present, otherwise report the missing runs.
    /// On completion the item is marked complete, its path updated and its missing list cleared.
    pub fn review(&self, item: &mut FileItem) -> Result<ReviewOutcome, TrackerError> {
        let present = self.scan(item)?;
        let missing = chunk::missing_ranges(&present);
        if !missing.is_empty() {
            item.set_missing_ranges(&missing);
            return Ok(ReviewOutcome::Missing(missing));
        }
        let path = self.reassemble(item, present.len() as u32)?;
        item.completed = true;
        item.path = path.clone();
        item.missing_pieces.clear();
        info!(file = %item.name, path = %path.display(), "download completed");
        Ok(ReviewOutcome::Complete(path))
    }

    /// Total bytes of stored fragments for a file id.
    pub fn downloaded_bytes(&self, file_id: u32) -> Result<u64, TrackerError> {
        Ok(self
            .fragments_of(file_id)?
            .iter()
            .filter_map(|(_, p)| fs::metadata(p).ok())
            .filter(|m| m.is_file())
            .map(|m| m.len())
            .sum())
    }

    /// Bytes stored so far, or `None` while the fragment directory is absent or unreadable.
    pub fn stored_bytes(&self, file_id: u32) -> Option<u64> {
        fs::read_dir(&self.config.fragment_dir).ok()?;
        self.downloaded_bytes(file_id).ok()
    }

    fn fragments_of(&self, file_id: u32) -> Result<Vec<(FragmentName, PathBuf)>, TrackerError> {
        let dir = &self.config.fragment_dir;
        let entries = match fs::read_dir(dir) {
            Ok(e) => e,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(TrackerError::io(dir, e)),
        };
        let mut out = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| TrackerError::io(dir, e))?;
            let file_name = entry.file_name();
            let Some(name) = file_name.to_str().and_then(FragmentName::parse) else {
                continue;
            };
            if name.file_id == file_id {
                out.push((name, entry.path()));
            }
        }
        Ok(out)
    }

    fn reassemble(&self, item: &FileItem, total: u32) -> Result<PathBuf, TrackerError> {
        let dir = &self.config.download_dir;
        fs::create_dir_all(dir).map_err(|e| TrackerError::io(dir, e))?;
        let final_path = dir.join(unique_file_name(dir, &item.name));
        let mut out = fs::File::create(&final_path).map_err(|e| TrackerError::io(&final_path, e))?;
        for index in 1..=total {
            let part = self.fragment_path(FragmentName::new(item.file_id, index, total));
            let bytes = fs::read(&part).map_err(|e| TrackerError::io(&part, e))?;
            out.write_all(&bytes)
                .map_err(|e| TrackerError::io(&final_path, e))?;
        }
        out.sync_all().map_err(|e| TrackerError::io(&final_path, e))?;
        for index in 1..=total {
            let part = self.fragment_path(FragmentName::new(item.file_id, index, total));
            if let Err(e) = fs::remove_file(&part) {
                debug!(path = %part.display(), error = %e, "could not remove fragment");
            }
        }
        Ok(final_path)
    }
}

/// A name for `name` inside `dir` that does not collide with an existing file.
///
/// Collisions get `(n)` inserted before the extension: `a.txt`, `a(1).txt`, `a(2).txt`.
/// Names are kept within [`MAX_FILENAME_LENGTH`] bytes by shortening the stem. Only the last
/// path component of `name` is used, so the result always stays inside `dir`.
pub fn unique_file_name(dir: &Path, name: &str) -> String {
    let name = base_name(name);
    let (stem, ext) = match name.rfind('.') {
        Some(i) if i > 0 => (&name[..i], &name[i..]),
        _ => (name, ""),
    };
    let mut candidate = fit_name(stem, "", ext);
    let mut n = 1u32;
    while dir.join(&candidate).exists() {
        candidate = fit_name(stem, &format!("({})", n), ext);
        n += 1;
    }
    candidate
}

/// Last component of a peer-supplied name, split on both separators. Empty, `.` and `..`
/// fall back to `download`.
fn base_name(name: &str) -> &str {
    match name.rsplit(['/', '\\']).next() {
        Some("") | Some(".") | Some("..") | None => "download",
        Some(base) => base,
    }
}

fn fit_name(stem: &str, suffix: &str, ext: &str) -> String {
    let budget = MAX_FILENAME_LENGTH.saturating_sub(suffix.len() + ext.len());
    let mut end = stem.len().min(budget);
    while !stem.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}{}{}", &stem[..end], suffix, ext)
}

#[derive(Debug, thiserror::Error)]
pub enum TrackerError {
    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Frame(#[from] FrameDecodeError),
}

impl TrackerError {
    fn io(path: &Path, source: io::Error) -> Self {
        TrackerError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}
