#![forbid(unsafe_code)]
//! Commit working containers into content-addressed container images.
//!
//! This library turns a mutable "working container" — a mounted root
//! filesystem plus a pair of evolving configuration documents — into an
//! immutable image in either the OCI Image v1 format or the Docker Image
//! Manifest v2 Schema 2 format, exposed as a read-only blob source that a
//! copier can pull manifest and layer bytes from by digest.
//!
//! # Overview
//!
//! The pipeline behind [`WorkingContainer::commit`]:
//!
//! 1. The dual configuration (OCI + Docker, kept in lockstep by the
//!    accessors in [`config`]) is snapshotted as canonical JSON.
//! 2. Caller-supplied linked layers are ingested: directories are archived
//!    into the per-container data directory, blobs are digested in place.
//! 3. The layer list is planned: parents oldest-first, prepended layers,
//!    the container's top layer, an optional synthesized layer for extra
//!    content, appended layers.
//! 4. Each planned layer is materialized into a staging directory named by
//!    blob digest — hashed, filtered, and optionally recompressed in a
//!    single pass — unless it is a parent layer whose digest storage
//!    already knows, in which case its bytes are re-diffed on demand.
//! 5. Twin configurations and manifests are assembled, history and diff ID
//!    bookkeeping is checked across both formats, and the result is
//!    wrapped in a [`ContainerImageSource`].
//!
//! Five commit modes ride this one pipeline: normal multi-layer commits,
//! squashed single-layer commits, confidential-workload conversion,
//! emptied top layers, and extra-content-as-a-layer.
//!
//! # Collaborators
//!
//! The container storage driver ([`Store`]), the image transport used to
//! read parent images ([`ParentImage`]), the filesystem-to-tar streamer
//! ([`RootfsCopier`]), and the confidential-workload disk-image builder
//! ([`WorkloadArchiver`]) all sit behind traits; the library ships a
//! capability-confined default copier ([`TarCopier`]) and nothing else.
//! Committing never writes to a destination, never talks to a network,
//! and never mutates the working container beyond explicitly requested
//! environment removals.
//!
//! # Example
//!
//! ```no_run
//! use ccommit_rs::{CommitOptions, WorkingContainer};
//! # fn example(store: &dyn ccommit_rs::Store) -> ccommit_rs::Result<()> {
//! let mut container = WorkingContainer::new("working-container-id")?;
//! container.initialize(None)?;
//! container.set_env("PATH", "/usr/local/bin:/usr/bin");
//!
//! let source = container.commit(store, CommitOptions::default())?;
//! let (manifest, manifest_type) = source.get_manifest();
//! println!("{}: {} bytes", manifest_type, manifest.len());
//! source.close()?;
//! # Ok(())
//! # }
//! ```

// Configuration model
pub mod config;
pub mod container;
pub mod docker;

// Commit pipeline
mod changes;
pub mod commit;
pub mod image;
pub mod linked;
mod planner;

// Stream plumbing
mod archive;
mod rootfs;
mod tarfilter;
mod tarwriter;

// Collaborator seams
pub mod copier;
pub mod error;
pub mod store;
pub mod transport;
pub mod workload;

pub use archive::Compression;
pub use commit::{Collaborators, CommitOptions};
pub use container::WorkingContainer;
pub use copier::{CopierOptions, IdMapping, IdMappingOptions, RootfsCopier, TarCopier};
pub use docker::{Schema2Config, V2Image, V2S2Manifest};
pub use error::{CommitError, Result};
pub use image::{
    ContainerImageSource, ExtractRootfsOptions, DOCKER_V2S2_IMAGE_MANIFEST,
    OCI_V1_IMAGE_MANIFEST,
};
pub use linked::LinkedLayer;
pub use rootfs::RootfsStream;
pub use store::{ContainerRecord, DiffOptions, LayerRecord, Store};
pub use transport::ParentImage;
pub use workload::{ConfidentialWorkloadOptions, WorkloadArchiveOptions, WorkloadArchiver};

// Re-export OCI spec types that appear in the public API.
pub use oci_spec::image::{History, HistoryBuilder, ImageConfiguration, ImageManifest};
