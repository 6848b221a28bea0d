//! The storage collaborator seam.
//!
//! The pipeline reads containers and layers through the [`Store`] trait and
//! never touches the layer graph directly: looking layers up, mounting,
//! unmounting, and producing uncompressed diffs all belong to the storage
//! driver behind this seam. The record types mirror what the driver knows
//! about a container and a layer.

use std::io::Read;
use std::path::PathBuf;

use crate::archive::Compression;
use crate::error::Result;

/// What the storage driver knows about a container.
#[derive(Debug, Clone, Default)]
pub struct ContainerRecord {
    /// Container ID.
    pub id: String,
    /// Names assigned to the container.
    pub names: Vec<String>,
    /// ID of the container's read-write layer.
    pub layer_id: String,
}

/// What the storage driver knows about a layer.
#[derive(Debug, Clone, Default)]
pub struct LayerRecord {
    /// Layer ID.
    pub id: String,
    /// Parent layer ID, if any.
    pub parent: Option<String>,
    /// Canonical digest of the layer's uncompressed diff, when the driver
    /// has recorded it.
    pub uncompressed_digest: Option<String>,
    /// Size of the uncompressed diff, when recorded.
    pub uncompressed_size: Option<u64>,
}

/// Options for [`Store::diff`].
#[derive(Debug, Clone, Copy, Default)]
pub struct DiffOptions {
    /// Compression applied to the returned stream. The pipeline always asks
    /// for [`Compression::Uncompressed`].
    pub compression: Compression,
}

/// Storage driver operations the commit pipeline depends on.
///
/// Implementations are not required to be thread-safe across blob reads;
/// the committed image source advertises that accordingly.
pub trait Store {
    /// Look up a container by ID.
    fn container(&self, id: &str) -> Result<ContainerRecord>;

    /// Look up a layer by ID.
    fn layer(&self, id: &str) -> Result<LayerRecord>;

    /// Mount a container's filesystem and return the mount point.
    ///
    /// Every successful mount must be paired with exactly one
    /// [`unmount`](Store::unmount); reference counting belongs to the
    /// driver.
    fn mount(&self, container_id: &str, mount_label: &str) -> Result<PathBuf>;

    /// Unmount a container's filesystem. Returns whether the mount is now
    /// fully released.
    fn unmount(&self, container_id: &str, force: bool) -> Result<bool>;

    /// Produce a layer diff as a tar stream. An empty `from` means a diff
    /// against the empty layer, i.e. the layer's full contents.
    fn diff(&self, from: &str, to: &str, options: &DiffOptions) -> Result<Box<dyn Read + Send>>;

    /// Per-container scratch directory for data tied to the container's
    /// lifetime.
    fn container_directory(&self, container_id: &str) -> Result<PathBuf>;

    /// Driver-specific graph options, passed through to collaborators that
    /// need them.
    fn graph_options(&self) -> Vec<String> {
        Vec::new()
    }
}
