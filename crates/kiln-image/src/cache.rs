//! Content-addressable layer cache.
//!
//! Layers are stored under the hex of their compressed digest:
//!
//! ```text
//! <root>/
//!   layers/<hex>/blob         compressed layer blob
//!   layers/<hex>/meta.json    digest, diff-id and size
//!   selectors/<hex>           layer digest for an application layer selector
//!   images/<registry>/<repo>/<tag>/{manifest,config}.json
//!   tmp/                      in-flight writes
//! ```
//!
//! Every write lands in a private directory under `tmp/` and is renamed into
//! `layers/` as a whole, so readers never observe a partial entry. When two
//! writers race on the same digest the first rename wins and the loser returns
//! the winner's record.

use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use kiln_common::{Digest, DigestWriter, KilnError, KilnResult};
use serde::{Deserialize, Serialize};

use crate::reference::{ImageReference, ImageTag};

const LAYERS_DIR: &str = "layers";
const SELECTORS_DIR: &str = "selectors";
const IMAGES_DIR: &str = "images";
const TMP_DIR: &str = "tmp";
const BLOB_FILE: &str = "blob";
const META_FILE: &str = "meta.json";
const MANIFEST_FILE: &str = "manifest.json";
const CONFIG_FILE: &str = "config.json";
const STAGING_PREFIX: &str = "write-";

/// Age after which an abandoned staging directory is removed on [`LayerCache::open`].
pub const STALE_WRITE_AGE: Duration = Duration::from_secs(24 * 60 * 60);

/// A layer blob materialized in a [`LayerCache`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedLayer {
    /// Digest of the compressed blob.
    pub digest: Digest,
    /// Digest of the uncompressed tar.
    pub diff_id: Digest,
    /// Compressed size in bytes.
    pub size: u64,
    /// Location of the compressed blob.
    #[serde(skip)]
    pub blob_path: PathBuf,
}

impl CachedLayer {
    /// Open the compressed blob for reading.
    ///
    /// # Errors
    ///
    /// Returns [`KilnError::CacheIo`] if the blob cannot be opened.
    pub fn open_blob(&self) -> KilnResult<File> {
        File::open(&self.blob_path).map_err(|e| KilnError::cache_io(&self.blob_path, e))
    }
}

/// Manifest and config of a pulled image, kept for offline builds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageMetadata {
    /// Raw manifest bytes.
    pub manifest: Vec<u8>,
    /// Raw container configuration bytes.
    pub config: Vec<u8>,
}

/// Content-addressable store of compressed layer blobs.
///
/// Cloning is cheap; clones share the same directory.
#[derive(Debug, Clone)]
pub struct LayerCache {
    root: PathBuf,
}

impl LayerCache {
    /// Open (creating if needed) a cache rooted at `root`.
    ///
    /// Staging directories untouched for [`STALE_WRITE_AGE`] are left over
    /// from killed processes and get removed. Younger ones may belong to a
    /// writer in another handle or process and are kept.
    ///
    /// # Errors
    ///
    /// Returns [`KilnError::CacheIo`] if the directories cannot be created.
    pub fn open(root: impl Into<PathBuf>) -> KilnResult<Self> {
        let root = root.into();
        for dir in [LAYERS_DIR, SELECTORS_DIR, IMAGES_DIR, TMP_DIR] {
            let path = root.join(dir);
            fs::create_dir_all(&path).map_err(|e| KilnError::cache_io(&path, e))?;
        }
        sweep_stale_writes(&root.join(TMP_DIR), STALE_WRITE_AGE);
        tracing::debug!(root = %root.display(), "Opened layer cache");
        Ok(Self { root })
    }

    /// Cache root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn entry_dir(&self, digest: &Digest) -> PathBuf {
        self.root.join(LAYERS_DIR).join(digest.hash())
    }

    /// Whether a layer with `digest` is stored. Only touches metadata.
    #[must_use]
    pub fn has(&self, digest: &Digest) -> bool {
        self.entry_dir(digest).join(META_FILE).is_file()
    }

    /// Look up a stored layer.
    ///
    /// # Errors
    ///
    /// Returns an error if the entry exists but its metadata is unreadable.
    pub fn retrieve(&self, digest: &Digest) -> KilnResult<Option<CachedLayer>> {
        let dir = self.entry_dir(digest);
        let meta_path = dir.join(META_FILE);
        let bytes = match fs::read(&meta_path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(KilnError::cache_io(&meta_path, e)),
        };
        let mut layer: CachedLayer =
            serde_json::from_slice(&bytes).map_err(|e| KilnError::CacheCorrupted {
                message: format!("{}: {e}", meta_path.display()),
            })?;
        if &layer.digest != digest {
            return Err(KilnError::CacheCorrupted {
                message: format!("{} records digest {}", meta_path.display(), layer.digest),
            });
        }
        layer.blob_path = dir.join(BLOB_FILE);
        Ok(Some(layer))
    }

    /// Store a compressed layer blob, computing its digest and diff-id.
    ///
    /// Writing content that is already stored returns the existing record.
    ///
    /// # Errors
    ///
    /// Returns [`KilnError::CacheIo`] on write failures, or the reader's error.
    pub fn write_compressed<R: Read>(&self, reader: R) -> KilnResult<CachedLayer> {
        self.write_blob(None, reader)
    }

    /// Store a compressed layer blob that must hash to `expected`.
    ///
    /// # Errors
    ///
    /// Returns [`KilnError::Integrity`] when the content hashes differently; in
    /// that case nothing is stored.
    pub fn write_compressed_verified<R: Read>(
        &self,
        expected: &Digest,
        reader: R,
    ) -> KilnResult<CachedLayer> {
        self.write_blob(Some(expected), reader)
    }

    fn write_blob<R: Read>(&self, expected: Option<&Digest>, mut reader: R) -> KilnResult<CachedLayer> {
        let staging = self.staging_dir()?;
        let blob_path = staging.path().join(BLOB_FILE);

        let file = File::create(&blob_path).map_err(|e| KilnError::cache_io(&blob_path, e))?;
        let mut writer = DigestWriter::new(BufWriter::new(file));
        copy_into(&mut reader, &mut writer, &blob_path)?;
        let (buffered, blob) = writer.finish();
        finish_file(buffered, &blob_path)?;

        if let Some(expected) = expected {
            if &blob.digest != expected {
                return Err(KilnError::Integrity {
                    expected: expected.to_string(),
                    actual: blob.digest.to_string(),
                });
            }
        }

        let diff_id = uncompressed_digest(&blob_path)?;
        self.commit(&staging, CachedLayer {
            digest: blob.digest,
            diff_id,
            size: blob.size,
            blob_path: PathBuf::new(),
        })
    }

    /// Gzip an uncompressed layer tar into the cache and record it under `selector`.
    ///
    /// Digest and diff-id are computed in the same pass as compression.
    ///
    /// # Errors
    ///
    /// Returns [`KilnError::CacheIo`] on write failures, or the reader's error.
    pub fn write_uncompressed<R: Read>(
        &self,
        mut reader: R,
        selector: &Digest,
    ) -> KilnResult<CachedLayer> {
        let staging = self.staging_dir()?;
        let blob_path = staging.path().join(BLOB_FILE);

        let file = File::create(&blob_path).map_err(|e| KilnError::cache_io(&blob_path, e))?;
        let compressed = DigestWriter::new(BufWriter::new(file));
        let mut uncompressed = DigestWriter::new(GzEncoder::new(compressed, Compression::default()));
        copy_into(&mut reader, &mut uncompressed, &blob_path)?;

        let (encoder, tar) = uncompressed.finish();
        let compressed = encoder
            .finish()
            .map_err(|e| KilnError::cache_io(&blob_path, e))?;
        let (buffered, blob) = compressed.finish();
        finish_file(buffered, &blob_path)?;

        let layer = self.commit(&staging, CachedLayer {
            digest: blob.digest,
            diff_id: tar.digest,
            size: blob.size,
            blob_path: PathBuf::new(),
        })?;
        self.write_selector(selector, &layer.digest)?;
        Ok(layer)
    }

    /// Look up an application layer by the digest of its inputs.
    ///
    /// # Errors
    ///
    /// Returns an error if the selector file is unreadable or malformed.
    pub fn retrieve_by_selector(&self, selector: &Digest) -> KilnResult<Option<CachedLayer>> {
        let path = self.root.join(SELECTORS_DIR).join(selector.hash());
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(KilnError::cache_io(&path, e)),
        };
        let digest = Digest::new(content.trim()).map_err(|_| KilnError::CacheCorrupted {
            message: format!("{} does not hold a digest", path.display()),
        })?;
        self.retrieve(&digest)
    }

    /// All stored layers, ordered by digest.
    ///
    /// # Errors
    ///
    /// Returns an error if the layers directory cannot be listed.
    pub fn list_entries(&self) -> KilnResult<Vec<CachedLayer>> {
        let dir = self.root.join(LAYERS_DIR);
        let mut entries = Vec::new();
        for entry in fs::read_dir(&dir).map_err(|e| KilnError::cache_io(&dir, e))? {
            let entry = entry.map_err(|e| KilnError::cache_io(&dir, e))?;
            let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
                continue;
            };
            let Ok(digest) = Digest::from_hash(&name) else {
                tracing::debug!(entry = %name, "Skipping unrecognized cache entry");
                continue;
            };
            if let Some(layer) = self.retrieve(&digest)? {
                entries.push(layer);
            }
        }
        entries.sort_by(|a, b| a.digest.cmp(&b.digest));
        Ok(entries)
    }

    /// Sum of compressed sizes of all stored layers.
    ///
    /// # Errors
    ///
    /// Returns an error if the layers directory cannot be listed.
    pub fn total_size(&self) -> KilnResult<u64> {
        Ok(self.list_entries()?.iter().map(|l| l.size).sum())
    }

    /// Remove every entry, selector and image record.
    ///
    /// In-flight writes are left alone and land in the emptied cache.
    ///
    /// # Errors
    ///
    /// Returns [`KilnError::CacheIo`] if removal fails.
    pub fn clear(&self) -> KilnResult<()> {
        for dir in [LAYERS_DIR, SELECTORS_DIR, IMAGES_DIR] {
            let path = self.root.join(dir);
            match fs::remove_dir_all(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(KilnError::cache_io(&path, e)),
            }
            fs::create_dir_all(&path).map_err(|e| KilnError::cache_io(&path, e))?;
        }
        tracing::info!(root = %self.root.display(), "Cleared layer cache");
        Ok(())
    }

    fn image_dir(&self, image: &ImageReference) -> PathBuf {
        let tag = match &image.reference {
            ImageTag::Tag(tag) => tag.clone(),
            ImageTag::Digest(digest) => digest.replace(':', "_"),
        };
        self.root
            .join(IMAGES_DIR)
            .join(image.registry.replace(':', "_"))
            .join(&image.repository)
            .join(tag)
    }

    /// Persist the manifest and config of a pulled image.
    ///
    /// # Errors
    ///
    /// Returns [`KilnError::CacheIo`] if the files cannot be written.
    pub fn save_image_metadata(
        &self,
        image: &ImageReference,
        metadata: &ImageMetadata,
    ) -> KilnResult<()> {
        let dir = self.image_dir(image);
        fs::create_dir_all(&dir).map_err(|e| KilnError::cache_io(&dir, e))?;
        self.replace_file(&dir.join(MANIFEST_FILE), &metadata.manifest)?;
        self.replace_file(&dir.join(CONFIG_FILE), &metadata.config)?;
        tracing::debug!(image = %image, "Saved image metadata");
        Ok(())
    }

    /// Load previously persisted manifest and config of an image.
    ///
    /// # Errors
    ///
    /// Returns [`KilnError::CacheIo`] if the files exist but cannot be read.
    pub fn load_image_metadata(&self, image: &ImageReference) -> KilnResult<Option<ImageMetadata>> {
        let dir = self.image_dir(image);
        let read = |name: &str| {
            let path = dir.join(name);
            match fs::read(&path) {
                Ok(bytes) => Ok(Some(bytes)),
                Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
                Err(e) => Err(KilnError::cache_io(&path, e)),
            }
        };
        match (read(MANIFEST_FILE)?, read(CONFIG_FILE)?) {
            (Some(manifest), Some(config)) => Ok(Some(ImageMetadata { manifest, config })),
            _ => Ok(None),
        }
    }

    fn staging_dir(&self) -> KilnResult<tempfile::TempDir> {
        let tmp = self.root.join(TMP_DIR);
        fs::create_dir_all(&tmp).map_err(|e| KilnError::cache_io(&tmp, e))?;
        tempfile::Builder::new()
            .prefix(STAGING_PREFIX)
            .tempdir_in(&tmp)
            .map_err(|e| KilnError::cache_io(&tmp, e))
    }

    /// Write metadata into `staging` and move it into place.
    fn commit(&self, staging: &tempfile::TempDir, mut layer: CachedLayer) -> KilnResult<CachedLayer> {
        let meta_path = staging.path().join(META_FILE);
        fs::write(&meta_path, serde_json::to_vec_pretty(&layer)?)
            .map_err(|e| KilnError::cache_io(&meta_path, e))?;

        let target = self.entry_dir(&layer.digest);
        match fs::rename(staging.path(), &target) {
            Ok(()) => {
                tracing::debug!(digest = %layer.digest, size = layer.size, "Cached layer");
                layer.blob_path = target.join(BLOB_FILE);
                Ok(layer)
            }
            // Lost the race to another writer of the same content.
            Err(_) if self.has(&layer.digest) => {
                tracing::debug!(digest = %layer.digest, "Layer already cached");
                self.retrieve(&layer.digest)?
                    .ok_or_else(|| KilnError::internal("cache entry vanished after commit"))
            }
            Err(e) => Err(KilnError::cache_io(&target, e)),
        }
    }

    fn write_selector(&self, selector: &Digest, digest: &Digest) -> KilnResult<()> {
        let path = self.root.join(SELECTORS_DIR).join(selector.hash());
        self.replace_file(&path, digest.as_str().as_bytes())
    }

    fn replace_file(&self, path: &Path, contents: &[u8]) -> KilnResult<()> {
        let tmp = self.root.join(TMP_DIR);
        let mut file =
            tempfile::NamedTempFile::new_in(&tmp).map_err(|e| KilnError::cache_io(&tmp, e))?;
        file.write_all(contents)
            .map_err(|e| KilnError::cache_io(file.path(), e))?;
        file.persist(path)
            .map_err(|e| KilnError::cache_io(path, e.error))?;
        Ok(())
    }
}

/// Remove staging directories under `tmp` last modified at least `max_age` ago.
fn sweep_stale_writes(tmp: &Path, max_age: Duration) {
    let Ok(entries) = fs::read_dir(tmp) else {
        return;
    };
    let now = SystemTime::now();
    for entry in entries.flatten() {
        if !entry.file_name().to_string_lossy().starts_with(STAGING_PREFIX) {
            continue;
        }
        let stale = entry
            .metadata()
            .and_then(|meta| meta.modified())
            .is_ok_and(|modified| now.duration_since(modified).unwrap_or_default() >= max_age);
        if !stale {
            continue;
        }
        let path = entry.path();
        match fs::remove_dir_all(&path) {
            Ok(()) => tracing::debug!(path = %path.display(), "Removed abandoned cache write"),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Failed to remove abandoned cache write");
            }
        }
    }
}

/// Copy `reader` into `writer`, keeping source failures apart from cache failures.
fn copy_into<R: Read, W: Write>(reader: &mut R, writer: &mut W, path: &Path) -> KilnResult<u64> {
    let mut buf = vec![0u8; 64 * 1024];
    let mut total = 0u64;
    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => return Ok(total),
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(source_error(e)),
        };
        writer
            .write_all(&buf[..n])
            .map_err(|e| KilnError::cache_io(path, e))?;
        total += n as u64;
    }
}

/// Unwrap a [`KilnError`] smuggled through an [`io::Error`] by a blob reader.
fn source_error(error: io::Error) -> KilnError {
    if error.get_ref().is_some_and(|inner| inner.is::<KilnError>()) {
        if let Some(inner) = error.into_inner() {
            return match inner.downcast::<KilnError>() {
                Ok(kiln) => *kiln,
                Err(other) => KilnError::Io(io::Error::other(other)),
            };
        }
        return KilnError::internal("blob reader error lost its source");
    }
    KilnError::Io(error)
}

fn finish_file(writer: BufWriter<File>, path: &Path) -> KilnResult<()> {
    let file = writer
        .into_inner()
        .map_err(|e| KilnError::cache_io(path, e.into_error()))?;
    file.sync_all().map_err(|e| KilnError::cache_io(path, e))
}

fn uncompressed_digest(blob_path: &Path) -> KilnResult<Digest> {
    let file = File::open(blob_path).map_err(|e| KilnError::cache_io(blob_path, e))?;
    let mut decoder = GzDecoder::new(BufReader::new(file));
    let mut sink = DigestWriter::new(io::sink());
    io::copy(&mut decoder, &mut sink).map_err(|e| KilnError::CacheCorrupted {
        message: format!("layer blob is not a gzip stream: {e}"),
    })?;
    Ok(sink.finish().1.digest)
}
