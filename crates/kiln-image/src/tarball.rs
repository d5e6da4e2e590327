//! `docker load` compatible image archives.

use std::io::{self, Write};

use kiln_common::KilnResult;
use kiln_oci::image::DockerLoadManifestEntry;

use crate::image::Image;
use crate::layer::REPRODUCIBLE_MTIME;

const CONFIG_NAME: &str = "config.json";
const MANIFEST_NAME: &str = "manifest.json";

/// An image packaged as a single tar archive.
///
/// The archive holds every layer blob as `<hex>.tar.gz` in layer order, the
/// container configuration as `config.json`, and a `manifest.json` tying them
/// together under `tags`.
#[derive(Debug)]
pub struct ImageTarball<'a> {
    image: &'a Image,
    tags: Vec<String>,
}

impl<'a> ImageTarball<'a> {
    /// Package `image`, tagged with full references such as `ghcr.io/org/app:v1`.
    #[must_use]
    pub const fn new(image: &'a Image, tags: Vec<String>) -> Self {
        Self { image, tags }
    }

    /// Write the archive. Layers are streamed from the cache.
    ///
    /// # Errors
    ///
    /// Returns an error if a layer blob cannot be read or the writer fails.
    pub fn write<W: Write>(&self, writer: W) -> KilnResult<W> {
        let mut builder = tar::Builder::new(writer);
        let mut layer_names = Vec::with_capacity(self.image.layers.len());

        for layer in &self.image.layers {
            let name = format!("{}.tar.gz", layer.digest.hash());
            let file = layer.open_blob()?;
            append(&mut builder, &name, layer.size, file)?;
            layer_names.push(name);
        }

        let (config, _) = self.image.config_blob()?;
        append(&mut builder, CONFIG_NAME, config.len() as u64, config.as_slice())?;

        let manifest = serde_json::to_vec(&[DockerLoadManifestEntry {
            config: CONFIG_NAME.to_string(),
            repo_tags: self.tags.clone(),
            layers: layer_names,
        }])?;
        append(&mut builder, MANIFEST_NAME, manifest.len() as u64, manifest.as_slice())?;

        Ok(builder.into_inner()?)
    }
}

fn append<W: Write>(
    builder: &mut tar::Builder<W>,
    name: &str,
    size: u64,
    data: impl io::Read,
) -> KilnResult<()> {
    let mut header = tar::Header::new_gnu();
    header.set_entry_type(tar::EntryType::Regular);
    header.set_size(size);
    header.set_mode(0o644);
    header.set_mtime(REPRODUCIBLE_MTIME);
    builder.append_data(&mut header, name, data)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::Read;

    use kiln_oci::ImageFormat;

    use super::*;
    use crate::cache::LayerCache;

    #[test]
    fn archive_layout() {
        let dir = tempfile::tempdir().unwrap();
        let cache = LayerCache::open(dir.path()).unwrap();
        let selector = kiln_common::Digest::of(b"s");
        let first = cache.write_uncompressed(&b"first"[..], &selector).unwrap();
        let second = cache.write_uncompressed(&b"second"[..], &selector).unwrap();

        let mut image = Image::new(ImageFormat::Docker);
        image.layers = vec![first.clone(), second.clone()];

        let bytes = ImageTarball::new(&image, vec!["localhost/app:latest".to_string()])
            .write(Vec::new())
            .unwrap();

        let mut archive = tar::Archive::new(bytes.as_slice());
        let mut names = Vec::new();
        let mut manifest = String::new();
        for entry in archive.entries().unwrap() {
            let mut entry = entry.unwrap();
            let name = entry.path().unwrap().to_string_lossy().into_owned();
            if name == MANIFEST_NAME {
                entry.read_to_string(&mut manifest).unwrap();
            }
            names.push(name);
        }

        assert_eq!(
            names,
            vec![
                format!("{}.tar.gz", first.digest.hash()),
                format!("{}.tar.gz", second.digest.hash()),
                CONFIG_NAME.to_string(),
                MANIFEST_NAME.to_string(),
            ]
        );
        let entries: Vec<DockerLoadManifestEntry> = serde_json::from_str(&manifest).unwrap();
        assert_eq!(entries[0].repo_tags, vec!["localhost/app:latest"]);
        assert_eq!(entries[0].layers, names[..2].to_vec());
    }
}
