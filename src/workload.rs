//! The confidential-workload collaborator seam.
//!
//! Converting a container into a confidential workload replaces its rootfs
//! with a LUKS-compatible encrypted disk image plus an attestation-aware
//! launcher. Producing that disk image (encryption, TEE negotiation,
//! firmware) is entirely the archiver's business; the pipeline mounts the
//! container, hands the mount point over, and treats the result as one more
//! layer stream.

use std::collections::BTreeMap;
use std::io::Read;
use std::path::{Path, PathBuf};

use oci_spec::image::ImageConfiguration;

use crate::error::Result;

/// Commit-level settings for confidential-workload conversion.
#[derive(Debug, Clone, Default)]
pub struct ConfidentialWorkloadOptions {
    /// Convert the image to a confidential workload instead of committing a
    /// conventional layer stack.
    pub convert: bool,
    /// URL of the attestation server the launcher should register with.
    pub attestation_url: String,
    /// Number of virtual CPUs to provision for.
    pub cpus: u32,
    /// Memory to provision for, in megabytes.
    pub memory: u64,
    /// Scratch space for building the disk image. Defaults to a fresh
    /// directory under the per-container data directory.
    pub temp_dir: Option<PathBuf>,
    /// Trusted execution environment type to target.
    pub tee_type: String,
    /// Proceed even if the attestation server cannot be reached.
    pub ignore_attestation_errors: bool,
    /// Workload identifier registered with the attestation server.
    pub workload_id: String,
    /// Passphrase for the disk encryption key.
    pub disk_encryption_passphrase: String,
    /// Extra disk space to leave unallocated, e.g. `"25%"` or `"1GB"`.
    pub slop: String,
    /// Firmware library to boot the guest with.
    pub firmware_library: String,
}

/// Everything the archiver needs to build the encrypted disk image.
#[derive(Debug, Clone, Default)]
pub struct WorkloadArchiveOptions {
    pub attestation_url: String,
    pub cpus: u32,
    pub memory: u64,
    pub temp_dir: PathBuf,
    pub tee_type: String,
    pub ignore_attestation_errors: bool,
    pub workload_id: String,
    pub disk_encryption_passphrase: String,
    pub slop: String,
    pub firmware_library: String,
    /// Storage-driver graph options, for drivers that need them reflected
    /// into the guest.
    pub graph_options: Vec<String>,
    /// Additional files to place into the disk image, keyed by their
    /// in-image path.
    pub extra_image_content: BTreeMap<String, String>,
}

impl WorkloadArchiveOptions {
    pub(crate) fn new(options: &ConfidentialWorkloadOptions, temp_dir: PathBuf) -> Self {
        Self {
            attestation_url: options.attestation_url.clone(),
            cpus: options.cpus,
            memory: options.memory,
            temp_dir,
            tee_type: options.tee_type.clone(),
            ignore_attestation_errors: options.ignore_attestation_errors,
            workload_id: options.workload_id.clone(),
            disk_encryption_passphrase: options.disk_encryption_passphrase.clone(),
            slop: options.slop.clone(),
            firmware_library: options.firmware_library.clone(),
            graph_options: Vec::new(),
            extra_image_content: BTreeMap::new(),
        }
    }
}

/// Produces the tar stream wrapping a LUKS-compatible disk image of a
/// mounted root filesystem.
pub trait WorkloadArchiver {
    /// Build the disk image for the filesystem at `mount_point` and return
    /// a stream of the resulting archive.
    fn archive(
        &self,
        mount_point: &Path,
        image: &ImageConfiguration,
        options: &WorkloadArchiveOptions,
    ) -> Result<Box<dyn Read + Send>>;
}
