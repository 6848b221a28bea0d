//! The image-transport collaborator seam.
//!
//! A working container is usually based on a parent image that some
//! transport can read. The pipeline needs very little from it: the raw
//! manifest with its MIME type, the configuration blob, and the ability to
//! re-interpret the image under a different manifest MIME type so that both
//! configuration decoders can be fed the format they expect.

use serde::de::DeserializeOwned;

use crate::error::{CommitError, Result};

/// A parent image as seen through an image transport.
pub trait ParentImage {
    /// The image's manifest bytes and their MIME type.
    fn manifest(&self) -> Result<(Vec<u8>, String)>;

    /// The image's configuration blob.
    fn config_blob(&self) -> Result<Vec<u8>>;

    /// A view of the same image converted to the given manifest MIME type.
    fn to_manifest_type(&self, manifest_mime_type: &str) -> Result<Box<dyn ParentImage + '_>>;

    /// A printable name for diagnostics.
    fn image_name(&self) -> String;
}

/// Obtain the config blob of `image` valid for the `wanted` manifest format
/// (either as it exists, or converting the image if necessary) and decode it
/// into `T`.
///
/// The MIME type is that of the *manifest*, not of the returned config.
pub(crate) fn unmarshal_converted_config<T: DeserializeOwned>(
    image: &dyn ParentImage,
    wanted: &str,
) -> Result<T> {
    let (_, actual) = image.manifest().map_err(|e| {
        CommitError::Config(format!(
            "getting manifest MIME type for {:?}: {}",
            image.image_name(),
            e
        ))
    })?;
    let converted;
    let source: &dyn ParentImage = if actual != wanted {
        converted = image.to_manifest_type(wanted).map_err(|e| {
            CommitError::Config(format!(
                "converting image {:?} to {}: {}",
                image.image_name(),
                wanted,
                e
            ))
        })?;
        converted.as_ref()
    } else {
        image
    };
    let config = source.config_blob().map_err(|e| {
        CommitError::Config(format!(
            "reading {} config from {:?}: {}",
            wanted,
            image.image_name(),
            e
        ))
    })?;
    serde_json::from_slice(&config).map_err(|e| {
        CommitError::Config(format!(
            "parsing {} configuration from {:?}: {}",
            wanted,
            image.image_name(),
            e
        ))
    })
}
