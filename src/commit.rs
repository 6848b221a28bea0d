//! Committing a working container to an image source.
//!
//! [`WorkingContainer::commit`] snapshots the container's configuration,
//! ingests any caller-supplied layers, and runs the assembly pipeline,
//! returning a [`ContainerImageSource`] a copier can pull the finished
//! image from. Nothing is written to any destination and the working
//! container itself is left as it was, apart from the explicit
//! `unset_envs` edits applied before the snapshot.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use oci_spec::image::History;

use crate::archive::Compression;
use crate::container::{rfc3339, WorkingContainer};
use crate::copier::{RootfsCopier, TarCopier};
use crate::docker::Schema2Config;
use crate::error::{CommitError, Result};
use crate::image::{
    canonical_json, ContainerImageRef, ContainerImageSource, ExtractRootfsOptions,
    OCI_V1_IMAGE_MANIFEST,
};
use crate::linked::{make_linked_layer_infos, LinkedLayer};
use crate::rootfs::RootfsStream;
use crate::store::Store;
use crate::workload::{ConfidentialWorkloadOptions, WorkloadArchiver};

/// Settings for one commit.
#[derive(Debug, Clone, Default)]
pub struct CommitOptions {
    /// The manifest format to emit: [`OCI_V1_IMAGE_MANIFEST`],
    /// [`crate::DOCKER_V2S2_IMAGE_MANIFEST`], or empty for the default
    /// (OCI).
    pub preferred_manifest_type: String,
    /// Compression to apply to newly staged layer blobs.
    pub compression: Compression,
    /// Flatten the container's filesystem into a single layer.
    pub squash: bool,
    /// Confidential-workload conversion settings.
    pub confidential_workload: ConfidentialWorkloadOptions,
    /// Don't record any history in the committed image.
    pub omit_history: bool,
    /// Don't include a layer for the container's own changes.
    pub empty_layer: bool,
    /// Timestamp to use (in UTC) as `created` everywhere, and for
    /// rewriting non-zero tar header times.
    pub history_timestamp: Option<DateTime<Utc>>,
    /// Extra layers to place before the container's layers.
    pub prepended_linked_layers: Vec<LinkedLayer>,
    /// Extra layers to place after the container's layers.
    pub appended_linked_layers: Vec<LinkedLayer>,
    /// Empty-layer history entries to place before this commit's entry.
    pub prepended_empty_layers: Vec<History>,
    /// Empty-layer history entries to place after this commit's entry.
    pub appended_empty_layers: Vec<History>,
    /// Instruction-style configuration edits to apply on the way out.
    pub override_changes: Vec<String>,
    /// A Docker-format configuration whose set fields override the
    /// snapshot.
    pub override_config: Option<Schema2Config>,
    /// Extra file content to carry in the image, keyed by in-image path.
    pub extra_image_content: BTreeMap<String, String>,
    /// Whether to populate the Docker `parent` field, for compatibility
    /// with classic builds. `None` leaves it unset.
    pub compat_set_parent: Option<bool>,
    /// Environment variables to remove from the working container before
    /// the configuration snapshot is taken.
    pub unset_envs: Vec<String>,
    /// A secondary directory the blob source consults when a digest is not
    /// found in the staging directory.
    pub blob_directory: Option<PathBuf>,
}

/// The injectable collaborators a commit streams through.
pub struct Collaborators {
    /// Streams a mounted filesystem as tar for squash and rootfs
    /// extraction.
    pub copier: Arc<dyn RootfsCopier>,
    /// Builds encrypted disk images for confidential workloads; required
    /// only when conversion is requested.
    pub workload_archiver: Option<Arc<dyn WorkloadArchiver>>,
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            copier: Arc::new(TarCopier),
            workload_archiver: None,
        }
    }
}

fn is_canonical_digest_hex(s: &str) -> bool {
    s.len() == 64
        && s.bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

impl WorkingContainer {
    /// Commit the container with the default collaborators.
    pub fn commit<'a>(
        &mut self,
        store: &'a dyn Store,
        options: CommitOptions,
    ) -> Result<ContainerImageSource<'a>> {
        self.commit_with(store, Collaborators::default(), options)
    }

    /// Commit the container, streaming through the given collaborators.
    pub fn commit_with<'a>(
        &mut self,
        store: &'a dyn Store,
        collaborators: Collaborators,
        options: CommitOptions,
    ) -> Result<ContainerImageSource<'a>> {
        let image_ref = self.make_image_ref(store, collaborators, options)?;
        image_ref.new_image_source()
    }

    /// Extract the container's whole filesystem as if it were a single
    /// layer.
    pub fn extract_rootfs<'a>(
        &mut self,
        store: &'a dyn Store,
        options: CommitOptions,
        opts: ExtractRootfsOptions,
    ) -> Result<RootfsStream<'a>> {
        let image_ref = self
            .make_image_ref(store, Collaborators::default(), options)
            .map_err(|e| {
                CommitError::Storage(format!(
                    "creating image reference for container {:?} to extract its contents: {}",
                    self.container_id, e
                ))
            })?;
        image_ref.extract_rootfs(opts)
    }

    fn make_image_ref<'a>(
        &mut self,
        store: &'a dyn Store,
        collaborators: Collaborators,
        options: CommitOptions,
    ) -> Result<ContainerImageRef<'a>> {
        let single_layer = options.squash || options.confidential_workload.convert;
        if single_layer
            && (!options.prepended_linked_layers.is_empty()
                || !options.appended_linked_layers.is_empty()
                || !self.prepended_linked_layers.is_empty()
                || !self.appended_linked_layers.is_empty())
        {
            return Err(CommitError::InconsistentRequest(
                "can't add prebuilt layers and produce an image with only one layer, at the same time"
                    .to_string(),
            ));
        }

        let container = store.container(&self.container_id).map_err(|e| {
            CommitError::Storage(format!(
                "locating container {:?}: {}",
                self.container_id, e
            ))
        })?;

        let manifest_type = if options.preferred_manifest_type.is_empty() {
            OCI_V1_IMAGE_MANIFEST.to_string()
        } else {
            options.preferred_manifest_type.clone()
        };

        for unset in &options.unset_envs {
            self.unset_env(unset);
        }
        let oconfig = canonical_json(&self.oci).map_err(|e| {
            CommitError::Config(format!("encoding OCI-format image configuration: {e}"))
        })?;
        let dconfig = canonical_json(&self.docker).map_err(|e| {
            CommitError::Config(format!("encoding docker-format image configuration: {e}"))
        })?;

        let created = options
            .history_timestamp
            .map(|t| t.with_timezone(&Utc));
        let mut created_by = self.created_by();
        if created_by.is_empty() {
            created_by = self.shell().join(" ");
            if created_by.is_empty() {
                created_by = "/bin/sh".to_string();
            }
        }

        let mut parent = String::new();
        let mut force_omit_history = false;
        if !self.from_image_id.is_empty() {
            if is_canonical_digest_hex(&self.from_image_id) {
                parent = format!("sha256:{}", self.from_image_id);
            }
            if !options.omit_history
                && self.oci.history().as_ref().map_or(true, |h| h.is_empty())
                && !self.oci.rootfs().diff_ids().is_empty()
            {
                // The parent had layers but no history. Adding entries
                // only for our own layers would leave a partially
                // annotated history, which is broken in confusing ways.
                tracing::debug!(
                    "parent image {:?} had no history but had {} layers, assuming OmitHistory",
                    self.from_image_id,
                    self.oci.rootfs().diff_ids().len()
                );
                force_omit_history = true;
            }
        }

        let mut pre_linked = self.prepended_linked_layers.clone();
        pre_linked.extend(options.prepended_linked_layers.iter().cloned());
        let mut post_linked = options.appended_linked_layers.clone();
        post_linked.extend(self.appended_linked_layers.iter().cloned());
        let mut pre_layers =
            make_linked_layer_infos(store, &container.id, &pre_linked, "prepended layer")?;
        let mut post_layers =
            make_linked_layer_infos(store, &container.id, &post_linked, "appended layer")?;

        let mut pre_empty_layers = self.prepended_empty_layers.clone();
        pre_empty_layers.extend(options.prepended_empty_layers.iter().cloned());
        let mut post_empty_layers = self.appended_empty_layers.clone();
        post_empty_layers.extend(options.appended_empty_layers.iter().cloned());

        if let Some(created) = created {
            let stamp = rfc3339(created);
            for history in pre_empty_layers
                .iter_mut()
                .chain(post_empty_layers.iter_mut())
            {
                history.set_created(Some(stamp.clone()));
            }
            for info in pre_layers.iter_mut().chain(post_layers.iter_mut()) {
                info.linked_layer.history.set_created(Some(stamp.clone()));
            }
        }

        Ok(ContainerImageRef {
            store,
            copier: collaborators.copier,
            workload_archiver: collaborators.workload_archiver,
            from_image_name: self.from_image_name.clone(),
            from_image_id: self.from_image_id.clone(),
            compression: options.compression,
            names: container.names.clone(),
            container_id: container.id.clone(),
            mount_label: self.mount_label.clone(),
            layer_id: container.layer_id.clone(),
            oconfig,
            dconfig,
            created,
            created_by,
            history_comment: self.history_comment(),
            annotations: self.annotations(),
            preferred_manifest_type: manifest_type,
            squash: options.squash,
            confidential_workload: options.confidential_workload.clone(),
            omit_history: options.omit_history || force_omit_history,
            empty_layer: options.empty_layer && !single_layer,
            id_mapping: self.id_mapping.clone(),
            parent,
            blob_directory: options.blob_directory.clone(),
            pre_empty_layers,
            pre_layers,
            post_empty_layers,
            post_layers,
            override_changes: options.override_changes.clone(),
            override_config: options.override_config.clone(),
            extra_image_content: options.extra_image_content.clone(),
            compat_set_parent: options.compat_set_parent,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_canonical_digest_hex() {
        assert!(is_canonical_digest_hex(&"a".repeat(64)));
        assert!(is_canonical_digest_hex(
            "0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef"
        ));
        assert!(!is_canonical_digest_hex("short"));
        assert!(!is_canonical_digest_hex(&"A".repeat(64)));
        assert!(!is_canonical_digest_hex(&"g".repeat(64)));
    }
}
