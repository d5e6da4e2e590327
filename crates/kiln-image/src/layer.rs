//! Image layers and reproducible application layer archives.

use std::collections::BTreeSet;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use kiln_common::{BlobDescriptor, Digest, KilnError, KilnResult};
use serde::{Deserialize, Serialize};

use crate::cache::CachedLayer;

/// Modification time stamped on every archive entry (one second past the epoch).
pub const REPRODUCIBLE_MTIME: u64 = 1;

/// One file or directory to include in a layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerEntry {
    /// Path on the build host.
    pub source: PathBuf,
    /// Absolute unix path inside the image.
    pub destination: String,
}

impl LayerEntry {
    /// Create an entry, validating that `destination` is absolute.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for relative destinations.
    pub fn new(source: impl Into<PathBuf>, destination: impl Into<String>) -> KilnResult<Self> {
        let destination = destination.into();
        if !destination.starts_with('/') || destination.contains('\\') {
            return Err(KilnError::config(format!(
                "Layer destination must be an absolute unix path: {destination}"
            )));
        }
        Ok(Self {
            source: source.into(),
            destination,
        })
    }

    fn archive_path(&self) -> &str {
        self.destination.trim_start_matches('/')
    }
}

/// Named, ordered set of entries making up one application layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerConfiguration {
    /// Layer name, used for progress and history.
    pub name: String,
    /// Entries in declaration order.
    pub entries: Vec<LayerEntry>,
}

/// File metadata folded into a layer selector.
#[derive(Serialize)]
struct SelectorEntry<'a> {
    source: &'a Path,
    destination: &'a str,
    size: u64,
    mode: u32,
    modified: u64,
}

impl LayerConfiguration {
    /// Create a layer configuration.
    pub fn new(name: impl Into<String>, entries: Vec<LayerEntry>) -> Self {
        Self {
            name: name.into(),
            entries,
        }
    }

    /// Digest over every entry's inputs, used to look up a previously built layer.
    ///
    /// Any change to a source file's size, permissions or modification time
    /// yields a different selector.
    ///
    /// # Errors
    ///
    /// Returns an error if a source file cannot be inspected.
    pub fn selector(&self) -> KilnResult<Digest> {
        let metadata = self
            .entries
            .iter()
            .map(|entry| fs::metadata(&entry.source))
            .collect::<io::Result<Vec<_>>>()?;

        let selector: Vec<SelectorEntry<'_>> = self
            .entries
            .iter()
            .zip(&metadata)
            .map(|(entry, meta)| SelectorEntry {
                source: &entry.source,
                destination: &entry.destination,
                size: if meta.is_dir() { 0 } else { meta.len() },
                mode: file_mode(meta),
                modified: meta
                    .modified()
                    .ok()
                    .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                    .map_or(0, |d| d.as_secs()),
            })
            .collect();

        Ok(Digest::of(&serde_json::to_vec(&(&self.name, selector))?))
    }

    /// Write the layer as an uncompressed, reproducible tar archive.
    ///
    /// Entries are sorted by destination, missing parent directories are added,
    /// and ownership and timestamps are normalized so identical inputs always
    /// produce identical bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if a source cannot be read or the writer fails.
    pub fn write_tar<W: Write>(&self, writer: W) -> KilnResult<W> {
        let mut entries: Vec<&LayerEntry> = self.entries.iter().collect();
        entries.sort_by(|a, b| a.destination.cmp(&b.destination));
        entries.dedup_by(|a, b| a.destination == b.destination);

        let explicit: BTreeSet<&str> = entries.iter().map(|e| e.archive_path()).collect();
        let mut parents = BTreeSet::new();
        for entry in &entries {
            let mut path = Path::new(entry.archive_path());
            while let Some(parent) = path.parent() {
                let parent_str = parent.to_string_lossy();
                if parent_str.is_empty() {
                    break;
                }
                if !explicit.contains(parent_str.as_ref()) {
                    parents.insert(parent_str.into_owned());
                }
                path = parent;
            }
        }

        let mut builder = tar::Builder::new(writer);

        for dir in &parents {
            append_directory(&mut builder, dir, 0o755)?;
        }

        for entry in entries {
            let meta = fs::metadata(&entry.source)?;
            if meta.is_dir() {
                append_directory(&mut builder, entry.archive_path(), file_mode(&meta))?;
            } else {
                let mut header = normalized_header(tar::EntryType::Regular, file_mode(&meta));
                header.set_size(meta.len());
                let file = fs::File::open(&entry.source)?;
                builder.append_data(&mut header, entry.archive_path(), file)?;
            }
        }

        Ok(builder.into_inner()?)
    }
}

fn normalized_header(kind: tar::EntryType, mode: u32) -> tar::Header {
    let mut header = tar::Header::new_gnu();
    header.set_entry_type(kind);
    header.set_mode(mode);
    header.set_mtime(REPRODUCIBLE_MTIME);
    header.set_uid(0);
    header.set_gid(0);
    header.set_size(0);
    header
}

fn append_directory<W: Write>(
    builder: &mut tar::Builder<W>,
    path: &str,
    mode: u32,
) -> KilnResult<()> {
    let mut header = normalized_header(tar::EntryType::Directory, mode);
    builder.append_data(&mut header, format!("{path}/"), io::empty())?;
    Ok(())
}

#[cfg(unix)]
fn file_mode(meta: &fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn file_mode(meta: &fs::Metadata) -> u32 {
    if meta.is_dir() { 0o755 } else { 0o644 }
}

/// A layer of an image: either known only by reference or already cached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Layer {
    /// Layer known from a manifest; its blob still has to be pulled.
    Reference {
        /// Compressed digest and size from the manifest.
        descriptor: BlobDescriptor,
        /// Uncompressed digest from the image config, if known.
        diff_id: Option<Digest>,
    },
    /// Layer materialized in a [`crate::LayerCache`].
    Cached(CachedLayer),
}

impl Layer {
    /// Compressed content digest.
    #[must_use]
    pub const fn digest(&self) -> &Digest {
        match self {
            Self::Reference { descriptor, .. } => &descriptor.digest,
            Self::Cached(cached) => &cached.digest,
        }
    }

    /// Compressed size in bytes.
    #[must_use]
    pub const fn size(&self) -> u64 {
        match self {
            Self::Reference { descriptor, .. } => descriptor.size,
            Self::Cached(cached) => cached.size,
        }
    }

    /// Uncompressed content digest, if known.
    #[must_use]
    pub const fn diff_id(&self) -> Option<&Digest> {
        match self {
            Self::Reference { diff_id, .. } => diff_id.as_ref(),
            Self::Cached(cached) => Some(&cached.diff_id),
        }
    }

    /// The cached layer, if materialized.
    #[must_use]
    pub const fn as_cached(&self) -> Option<&CachedLayer> {
        match self {
            Self::Reference { .. } => None,
            Self::Cached(cached) => Some(cached),
        }
    }

    /// Open the compressed blob for reading.
    ///
    /// # Errors
    ///
    /// Returns an error for layers that have not been cached yet.
    pub fn open_blob(&self) -> KilnResult<fs::File> {
        self.as_cached()
            .ok_or_else(|| KilnError::internal(format!("Layer {} is not cached", self.digest())))?
            .open_blob()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_paths(archive: &[u8]) -> Vec<(String, u64)> {
        let mut archive = tar::Archive::new(archive);
        archive
            .entries()
            .unwrap()
            .map(|e| {
                let e = e.unwrap();
                (
                    e.path().unwrap().to_string_lossy().into_owned(),
                    e.header().mtime().unwrap(),
                )
            })
            .collect()
    }

    #[test]
    fn relative_destination_rejected() {
        assert!(LayerEntry::new("a", "app/a").is_err());
        assert!(LayerEntry::new("a", "/app/a").is_ok());
    }

    #[test]
    fn tar_is_sorted_with_parents_and_fixed_mtime() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.txt"), b"b").unwrap();
        std::fs::write(dir.path().join("a.txt"), b"a").unwrap();

        let layer = LayerConfiguration::new(
            "app",
            vec![
                LayerEntry::new(dir.path().join("b.txt"), "/app/lib/b.txt").unwrap(),
                LayerEntry::new(dir.path().join("a.txt"), "/app/a.txt").unwrap(),
            ],
        );

        let archive = layer.write_tar(Vec::new()).unwrap();
        let paths = read_paths(&archive);
        let names: Vec<&str> = paths.iter().map(|(p, _)| p.as_str()).collect();
        assert_eq!(names, vec!["app/", "app/lib/", "app/a.txt", "app/lib/b.txt"]);
        assert!(paths.iter().all(|(_, mtime)| *mtime == REPRODUCIBLE_MTIME));
    }

    #[test]
    fn tar_is_byte_identical_across_builds() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("main"), b"binary").unwrap();
        let layer = LayerConfiguration::new(
            "bin",
            vec![LayerEntry::new(dir.path().join("main"), "/main").unwrap()],
        );

        let first = layer.write_tar(Vec::new()).unwrap();
        let second = layer.write_tar(Vec::new()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn selector_changes_with_content_size() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("config.toml");
        std::fs::write(&file, b"a = 1").unwrap();
        let layer = LayerConfiguration::new(
            "config",
            vec![LayerEntry::new(&file, "/etc/config.toml").unwrap()],
        );

        let before = layer.selector().unwrap();
        assert_eq!(before, layer.selector().unwrap());

        std::fs::write(&file, b"a = 12345").unwrap();
        assert_ne!(before, layer.selector().unwrap());
    }
}
