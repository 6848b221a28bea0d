//! The working container and its dual-format configuration.
//!
//! A [`WorkingContainer`] carries everything needed to commit a mutable
//! container into an immutable image: the parent image identity, the raw
//! parent manifest and configuration, and the two parsed configuration
//! documents — OCI v1 and Docker v2s2 — that are kept field-for-field in
//! sync by the accessors in [`crate::config`].
//!
//! Loading a parent establishes the invariants the rest of the pipeline
//! relies on: `created` is non-zero in both formats, `os`, `architecture`,
//! and the working directory have concrete values, the Docker
//! `container_config` is a copy of its `config`, and any recorded Docker
//! version is cleared.

use std::collections::HashMap;

use chrono::{DateTime, SecondsFormat, Utc};
use oci_spec::image::{
    Arch, History, ImageConfiguration, ImageConfigurationBuilder, ImageManifest, Os,
};

use crate::copier::IdMappingOptions;
use crate::docker::{self, V2Image, V2S2_MANIFEST_MEDIA_TYPE};
use crate::error::{CommitError, Result};
use crate::image::OCI_V1_IMAGE_MANIFEST;
use crate::linked::LinkedLayer;
use crate::transport::{unmarshal_converted_config, ParentImage};

/// Render a timestamp the way both configuration formats expect it.
pub(crate) fn rfc3339(when: DateTime<Utc>) -> String {
    when.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

/// A mutable container being prepared for commit.
///
/// The pipeline borrows the container read-only once the configuration
/// snapshot has been taken; only the explicit accessors mutate it.
#[derive(Debug, Clone)]
pub struct WorkingContainer {
    /// Container ID as known to the storage driver.
    pub container_id: String,
    /// Name the parent image was pulled by; empty for "from scratch".
    pub from_image_name: String,
    /// ID of the parent image; empty for "from scratch".
    pub from_image_id: String,
    /// Label to use when mounting the container's filesystem.
    pub mount_label: String,
    /// Raw manifest of the parent image, if any.
    pub manifest: Vec<u8>,
    /// Raw configuration blob of the parent image, if any.
    pub config: Vec<u8>,
    /// The OCI v1 view of the configuration.
    pub oci: ImageConfiguration,
    /// The Docker v2s2 view of the configuration.
    pub docker: V2Image,
    /// Manifest-level annotations (OCI only).
    pub(crate) image_annotations: HashMap<String, String>,
    /// Description of how the image being committed was built.
    pub(crate) image_created_by: String,
    /// Comment for the history entry describing the commit.
    pub(crate) image_history_comment: String,
    /// ID mappings in effect for the container.
    pub id_mapping: IdMappingOptions,
    /// Empty-layer history entries to place before this commit's entry.
    pub prepended_empty_layers: Vec<History>,
    /// Empty-layer history entries to place after this commit's entry.
    pub appended_empty_layers: Vec<History>,
    /// Linked layers to place before the container's layers.
    pub prepended_linked_layers: Vec<LinkedLayer>,
    /// Linked layers to place after the container's layers.
    pub appended_linked_layers: Vec<LinkedLayer>,
}

impl WorkingContainer {
    /// Create a container with empty configuration, as for a build from
    /// scratch. Call [`initialize`](Self::initialize) to load a parent
    /// image and establish the configuration invariants.
    pub fn new(container_id: impl Into<String>) -> Result<Self> {
        Ok(Self {
            container_id: container_id.into(),
            from_image_name: String::new(),
            from_image_id: String::new(),
            mount_label: String::new(),
            manifest: Vec::new(),
            config: Vec::new(),
            oci: ImageConfigurationBuilder::default().build()?,
            docker: V2Image::default(),
            image_annotations: HashMap::new(),
            image_created_by: String::new(),
            image_history_comment: String::new(),
            id_mapping: IdMappingOptions::default(),
            prepended_empty_layers: Vec::new(),
            appended_empty_layers: Vec::new(),
            prepended_linked_layers: Vec::new(),
            appended_linked_layers: Vec::new(),
        })
    }

    /// Load configuration from a parent image, or fix up the empty
    /// configuration when building from scratch.
    pub fn initialize(&mut self, image: Option<&dyn ParentImage>) -> Result<()> {
        if let Some(image) = image {
            // A pre-existing image, as opposed to a "FROM scratch" new one.
            let (raw_manifest, manifest_mime_type) = image.manifest().map_err(|e| {
                CommitError::Config(format!(
                    "reading image manifest for {:?}: {}",
                    image.image_name(),
                    e
                ))
            })?;
            let raw_config = image.config_blob().map_err(|e| {
                CommitError::Config(format!(
                    "reading image configuration for {:?}: {}",
                    image.image_name(),
                    e
                ))
            })?;
            self.manifest = raw_manifest;
            self.config = raw_config;

            self.docker = unmarshal_converted_config(image, V2S2_MANIFEST_MEDIA_TYPE)?;
            self.oci = unmarshal_converted_config(image, OCI_V1_IMAGE_MANIFEST)?;

            if manifest_mime_type == OCI_V1_IMAGE_MANIFEST {
                // Recover format-specific data from the manifest.
                let manifest: ImageManifest = serde_json::from_slice(&self.manifest)
                    .map_err(|e| CommitError::Config(format!("parsing OCI manifest: {e}")))?;
                self.image_annotations = manifest.annotations().clone().unwrap_or_default();
            }
        }
        self.fixup_config();
        Ok(())
    }

    fn fixup_config(&mut self) {
        if let Some(config) = self.docker.config.take() {
            // Prefer image-level settings over those from the container it
            // was built from.
            self.docker.container_config = config;
        }
        self.docker.config = Some(self.docker.container_config.clone());
        self.docker.docker_version = String::new();
        let now = Utc::now();
        if self
            .docker
            .created
            .map_or(true, |t| t == docker::zero_time())
        {
            self.docker.created = Some(now);
        }
        let oci_created_unset = match self.oci.created() {
            None => true,
            Some(created) => chrono::DateTime::parse_from_rfc3339(created)
                .map_or(true, |t| t.with_timezone(&Utc) == docker::zero_time()),
        };
        if oci_created_unset {
            self.oci.set_created(Some(rfc3339(now)));
        }
        if self.docker.os.is_empty() {
            self.set_os(std::env::consts::OS);
        }
        if self.docker.architecture.is_empty() {
            self.set_architecture(host_arch());
        }
        if self.work_dir().is_empty() {
            self.set_work_dir("/");
        }
    }
}

/// The process architecture, in the naming the image formats use.
pub(crate) fn host_arch() -> &'static str {
    match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "x86" => "386",
        "aarch64" => "arm64",
        "powerpc64" => "ppc64le",
        other => other,
    }
}

/// Parse an architecture string into the typed OCI value.
pub(crate) fn oci_arch(s: &str) -> Arch {
    Arch::from(s)
}

/// Parse an OS string into the typed OCI value.
pub(crate) fn oci_os(s: &str) -> Os {
    Os::from(s)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scratch_defaults() {
        let mut container = WorkingContainer::new("ctr").unwrap();
        container.initialize(None).unwrap();
        assert_eq!(container.docker.os, std::env::consts::OS);
        assert_eq!(container.docker.architecture, host_arch());
        assert_eq!(container.work_dir(), "/");
        assert!(container.docker.created.is_some());
        assert!(container.oci.created().is_some());
        assert!(container.docker.docker_version.is_empty());
        assert!(container.docker.config.is_some());
    }

    #[test]
    fn test_fixup_copies_config_over_container_config() {
        let mut container = WorkingContainer::new("ctr").unwrap();
        let mut config = crate::docker::Schema2Config::default();
        config.user = "1000".to_string();
        container.docker.config = Some(config);
        container.docker.container_config.user = "0".to_string();
        container.initialize(None).unwrap();
        assert_eq!(container.docker.container_config.user, "1000");
        assert_eq!(container.docker.config.as_ref().unwrap().user, "1000");
    }
}
