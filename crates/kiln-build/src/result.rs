//! The outcome of a successful build.

use std::fmt;

use kiln_common::{Digest, KilnResult};
use kiln_image::Image;
use serde::Serialize;

/// What a successful build produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BuildResult {
    /// Digest of the container configuration.
    pub image_digest: Digest,
    /// Short image id as shown by `docker images`.
    pub image_id: String,
    /// Digest of the image manifest.
    pub manifest_digest: Digest,
    /// Full references the image was published or loaded under.
    pub tags: Vec<String>,
}

impl BuildResult {
    /// Describe `image`, published under `tags`.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration or manifest cannot be serialized.
    pub fn for_image(image: &Image, tags: Vec<String>) -> KilnResult<Self> {
        let (_, config) = image.config_blob()?;
        let manifest = image.manifest(&config).to_bytes()?;
        Ok(Self::new(config.digest, Digest::of(&manifest), tags))
    }

    pub(crate) fn new(config_digest: Digest, manifest_digest: Digest, tags: Vec<String>) -> Self {
        Self {
            image_id: config_digest.short().to_string(),
            image_digest: config_digest,
            manifest_digest,
            tags,
        }
    }
}

impl fmt::Display for BuildResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Image id:        {}", self.image_id)?;
        writeln!(f, "Image digest:    {}", self.image_digest)?;
        write!(f, "Manifest digest: {}", self.manifest_digest)?;
        for tag in &self.tags {
            write!(f, "\nTag:             {tag}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use kiln_oci::ImageFormat;

    use super::*;

    #[test]
    fn result_for_empty_image() {
        let image = Image::new(ImageFormat::Docker);
        let result = BuildResult::for_image(&image, vec!["localhost/app:latest".to_string()]).unwrap();
        let (_, config) = image.config_blob().unwrap();

        assert_eq!(result.image_digest, config.digest);
        assert_eq!(result.image_id.len(), 12);
        assert!(result.to_string().contains("localhost/app:latest"));
    }
}
