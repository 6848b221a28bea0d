//! Image assembly: layer materialization, manifest/config production, and
//! the read-only blob source that serves the result.
//!
//! [`ContainerImageRef`] is the state of one commit in flight. Its
//! [`new_image_source`](ContainerImageRef::new_image_source) drives the
//! whole pipeline: plan the layer list, materialize each layer into a
//! staging directory named by blob digest (or reuse a parent layer's known
//! digest without moving any bytes), assemble the twin OCI/Docker
//! configurations and manifests, and wrap everything in a
//! [`ContainerImageSource`] that answers blob reads by digest.

use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use canon_json::CanonicalFormatter;
use chrono::{DateTime, Utc};
use oci_spec::image::{
    Descriptor, DescriptorBuilder, History, HistoryBuilder, ImageConfiguration, ImageManifest,
    ImageManifestBuilder, MediaType, Sha256Digest, SCHEMA_VERSION,
};
use serde::Serialize;

use crate::archive::{digest_bytes, Compression, CountingWriter, LayerSink, Sha256Writer};
use crate::changes::apply_overrides;
use crate::container::rfc3339;
use crate::copier::{CopierOptions, IdMappingOptions, RootfsCopier};
use crate::docker::{
    self, V2Image, V2S2Descriptor, V2S2History, V2S2Manifest, V2S2RootFs,
    V2S2_CONFIG_MEDIA_TYPE, V2S2_LAYER_GZIP_MEDIA_TYPE, V2S2_LAYER_MEDIA_TYPE,
    V2S2_MANIFEST_MEDIA_TYPE,
};
use crate::error::{CommitError, Result};
use crate::linked::CommitLinkedLayerInfo;
use crate::planner::{plan_layers, PlannedLayer, SYNTHESIZED_LAYER_ID};
use crate::rootfs::{spawn_rootfs_stream, RootfsStream};
use crate::store::{DiffOptions, Store};
use crate::tarfilter::TarFilter;
use crate::tarwriter;
use crate::workload::{ConfidentialWorkloadOptions, WorkloadArchiveOptions, WorkloadArchiver};

/// MIME type of an OCI v1 image manifest, suitable as a
/// `preferred_manifest_type` value. Also the default.
pub const OCI_V1_IMAGE_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";

/// MIME type of a Docker v2s2 image manifest, suitable as a
/// `preferred_manifest_type` value.
pub const DOCKER_V2S2_IMAGE_MANIFEST: &str = V2S2_MANIFEST_MEDIA_TYPE;

/// Controls what [`crate::WorkingContainer::extract_rootfs`] preserves on
/// the file system objects it streams.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExtractRootfsOptions {
    /// Strip the setuid bit off of items being extracted.
    pub strip_setuid_bit: bool,
    /// Strip the setgid bit off of items being extracted.
    pub strip_setgid_bit: bool,
    /// Don't record extended attributes of items being extracted.
    pub strip_xattrs: bool,
}

/// A parent layer whose bytes are served by re-diffing storage on demand
/// instead of from a staged file.
#[derive(Debug, Clone)]
struct BlobLayerInfo {
    id: String,
    size: u64,
}

/// Serialize a document as canonical JSON (sorted object keys), the form
/// every emitted manifest and configuration uses.
pub(crate) fn canonical_json<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    let mut ser = serde_json::Serializer::with_formatter(&mut buf, CanonicalFormatter::new());
    value.serialize(&mut ser)?;
    Ok(buf)
}

/// Compute the media types to attach to a layer, given the compression
/// we'll be applying to it.
fn compute_layer_media_types(
    what: &str,
    compression: Compression,
) -> Result<(MediaType, &'static str)> {
    match compression {
        Compression::Uncompressed => Ok((MediaType::ImageLayer, V2S2_LAYER_MEDIA_TYPE)),
        Compression::Gzip => {
            tracing::debug!("compressing {} with gzip", what);
            Ok((MediaType::ImageLayerGzip, V2S2_LAYER_GZIP_MEDIA_TYPE))
        }
        // Until the image specs define media types for these, even knowing
        // how to decompress them doesn't let us produce them.
        Compression::Bzip2 => Err(CommitError::UnsupportedCompression("bzip2")),
        Compression::Xz => Err(CommitError::UnsupportedCompression("xz")),
        Compression::Zstd => Err(CommitError::UnsupportedCompression("zstd")),
    }
}

fn oci_descriptor(media_type: MediaType, digest: &str, size: u64) -> Result<Descriptor> {
    let hex = digest.strip_prefix("sha256:").unwrap_or(digest);
    Ok(DescriptorBuilder::default()
        .media_type(media_type)
        .digest(Sha256Digest::from_str(hex)?)
        .size(size)
        .build()?)
}

/// The state of one commit: everything needed to render the working
/// container as a pullable image source.
pub(crate) struct ContainerImageRef<'a> {
    pub store: &'a dyn Store,
    pub copier: Arc<dyn RootfsCopier>,
    pub workload_archiver: Option<Arc<dyn WorkloadArchiver>>,
    pub from_image_name: String,
    pub from_image_id: String,
    pub compression: Compression,
    pub names: Vec<String>,
    pub container_id: String,
    pub mount_label: String,
    pub layer_id: String,
    pub oconfig: Vec<u8>,
    pub dconfig: Vec<u8>,
    pub created: Option<DateTime<Utc>>,
    pub created_by: String,
    pub history_comment: String,
    pub annotations: HashMap<String, String>,
    pub preferred_manifest_type: String,
    pub squash: bool,
    pub confidential_workload: ConfidentialWorkloadOptions,
    pub omit_history: bool,
    pub empty_layer: bool,
    pub id_mapping: IdMappingOptions,
    pub parent: String,
    pub blob_directory: Option<PathBuf>,
    pub pre_empty_layers: Vec<History>,
    pub pre_layers: Vec<CommitLinkedLayerInfo>,
    pub post_empty_layers: Vec<History>,
    pub post_layers: Vec<CommitLinkedLayerInfo>,
    pub override_changes: Vec<String>,
    pub override_config: Option<docker::Schema2Config>,
    pub extra_image_content: BTreeMap<String, String>,
    pub compat_set_parent: Option<bool>,
}

/// A stream feeding one layer's uncompressed bytes into the materializer.
enum LayerStream<'a> {
    File(File),
    Diff(Box<dyn Read + Send>),
    Rootfs(RootfsStream<'a>),
    Workload(WorkloadStream<'a>),
}

impl Read for LayerStream<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            LayerStream::File(f) => f.read(buf),
            LayerStream::Diff(r) => r.read(buf),
            LayerStream::Rootfs(r) => r.read(buf),
            LayerStream::Workload(w) => w.reader.read(buf),
        }
    }
}

impl LayerStream<'_> {
    fn close(self) -> Result<()> {
        match self {
            LayerStream::File(_) | LayerStream::Diff(_) => Ok(()),
            LayerStream::Rootfs(stream) => stream.close(),
            LayerStream::Workload(stream) => stream.close(),
        }
    }
}

/// The confidential-workload disk image stream plus the unmount obligation
/// that comes with it.
struct WorkloadStream<'a> {
    reader: Box<dyn Read + Send>,
    store: &'a dyn Store,
    container_id: String,
}

impl WorkloadStream<'_> {
    fn close(self) -> Result<()> {
        drop(self.reader);
        self.store
            .unmount(&self.container_id, false)
            .map(|_| ())
            .map_err(|e| {
                CommitError::Storage(format!(
                    "unmounting container {:?}: {}",
                    self.container_id, e
                ))
            })
    }
}

/// Write the extra-content map as tar entries: each file becomes a regular
/// entry owned by root with mode 0644. With `include_footer` unset the
/// archive is left unterminated so another stream can be concatenated
/// directly after it.
///
/// Returns the digest and size of the bytes written.
fn write_extra_content(
    out: &mut dyn Write,
    content: &BTreeMap<String, String>,
    created: DateTime<Utc>,
    include_footer: bool,
) -> Result<(String, u64)> {
    let mut writer = Sha256Writer::new(CountingWriter::new(out));
    let mtime = created.timestamp().max(0) as u64;
    for (path, source) in content {
        let mut file = File::open(source).map_err(|e| {
            CommitError::Archive(format!("opening {source:?} for {path:?}: {e}"))
        })?;
        let size = file.metadata()?.len();
        tarwriter::write_file_header(&mut writer, path, size, 0o644, mtime)?;
        tarwriter::write_file_data(&mut writer, &mut file, size)?;
    }
    if include_footer {
        tarwriter::write_tar_footer(&mut writer)?;
    }
    writer.flush()?;
    let (digest, counter) = writer.finish();
    let (_, count) = counter.finish();
    Ok((digest, count))
}

impl<'a> ContainerImageRef<'a> {
    fn single_layer(&self) -> bool {
        self.squash || self.confidential_workload.convert
    }

    /// Seconds-since-epoch override for tar header rewriting, present only
    /// when the commit carries a fixed timestamp.
    fn tar_mtime_override(&self) -> Option<u64> {
        self.created.map(|t| t.timestamp().max(0) as u64)
    }

    /// Create an archive of the extra-content map in the per-container
    /// directory. The footer that marks the end of the archive may be
    /// omitted.
    fn make_extra_image_content_diff(
        &self,
        include_footer: bool,
        created: DateTime<Utc>,
    ) -> Result<(PathBuf, String, u64)> {
        let cdir = self.store.container_directory(&self.container_id)?;
        let mut file = tempfile::Builder::new()
            .prefix("extradiff")
            .tempfile_in(&cdir)?;
        let (digest, size) =
            write_extra_content(file.as_file_mut(), &self.extra_image_content, created, include_footer)?;
        let (_, path) = file
            .keep()
            .map_err(|e| CommitError::Archive(format!("keeping extra-content diff: {e}")))?;
        Ok((path, digest, size))
    }

    /// Extract the container's whole filesystem as a filesystem image,
    /// wrapped in LUKS-compatible encryption.
    fn extract_confidential_workload(&self) -> Result<WorkloadStream<'a>> {
        let archiver = self.workload_archiver.as_ref().ok_or(
            CommitError::UnsupportedOperation(
                "converting to a confidential workload requires a workload archiver",
            ),
        )?;
        let image: ImageConfiguration = serde_json::from_slice(&self.oconfig).map_err(|e| {
            CommitError::Config(format!(
                "recreating OCI configuration for {:?}: {}",
                self.container_id, e
            ))
        })?;
        // Scratch space lives under the per-container directory unless the
        // caller chose a spot; either way it is gone once the archiver has
        // handed us its stream.
        let mut scratch = None;
        let temp_dir = match &self.confidential_workload.temp_dir {
            Some(dir) => dir.clone(),
            None => {
                let cdir = self.store.container_directory(&self.container_id)?;
                let dir = tempfile::Builder::new()
                    .prefix("rootfs")
                    .tempdir_in(&cdir)
                    .map_err(|e| {
                        CommitError::Archive(format!(
                            "creating a temporary data directory to hold a rootfs image for {:?}: {}",
                            self.container_id, e
                        ))
                    })?;
                let path = dir.path().to_path_buf();
                scratch = Some(dir);
                path
            }
        };
        let mount_point = self
            .store
            .mount(&self.container_id, &self.mount_label)
            .map_err(|e| {
                CommitError::Storage(format!(
                    "mounting container {:?}: {}",
                    self.container_id, e
                ))
            })?;
        let mut options =
            WorkloadArchiveOptions::new(&self.confidential_workload, temp_dir);
        options.graph_options = self.store.graph_options();
        options.extra_image_content = self.extra_image_content.clone();
        let reader = match archiver.archive(&mount_point, &image, &options) {
            Ok(reader) => reader,
            Err(e) => {
                if let Err(e2) = self.store.unmount(&self.container_id, false) {
                    tracing::debug!("unmounting container {:?}: {}", self.container_id, e2);
                }
                return Err(CommitError::Archive(format!(
                    "converting rootfs {:?}: {}",
                    self.container_id, e
                )));
            }
        };
        drop(scratch);
        Ok(WorkloadStream {
            reader,
            store: self.store,
            container_id: self.container_id.clone(),
        })
    }

    /// Extract the container's whole filesystem as if it were a single
    /// layer.
    pub(crate) fn extract_rootfs(&self, opts: ExtractRootfsOptions) -> Result<RootfsStream<'a>> {
        let mount_point = self
            .store
            .mount(&self.container_id, &self.mount_label)
            .map_err(|e| {
                CommitError::Storage(format!(
                    "mounting container {:?}: {}",
                    self.container_id, e
                ))
            })?;
        let options = CopierOptions {
            uid_map: self.id_mapping.uid_map.clone(),
            gid_map: self.id_mapping.gid_map.clone(),
            strip_setuid_bit: opts.strip_setuid_bit,
            strip_setgid_bit: opts.strip_setgid_bit,
            strip_xattrs: opts.strip_xattrs,
        };
        // Slip the synthesized data items in front of the archive the
        // copier produces, leaving out the footer so that a reader sees one
        // continuous archive.
        let prefix: Option<Box<dyn FnOnce(&mut dyn Write) -> Result<()> + Send>> =
            if self.extra_image_content.is_empty() {
                None
            } else {
                let content = self.extra_image_content.clone();
                let created = self.created.unwrap_or_else(Utc::now);
                Some(Box::new(move |out: &mut dyn Write| {
                    write_extra_content(out, &content, created, false).map(|_| ())
                }))
            };
        spawn_rootfs_stream(
            self.store,
            &self.container_id,
            mount_point,
            Arc::clone(&self.copier),
            options,
            prefix,
        )
    }

    /// Build fresh copies of the configuration documents so edits never
    /// leak back into the working container.
    fn create_configs(&self, created: DateTime<Utc>) -> Result<(ImageConfiguration, V2Image)> {
        let single_layer_or_bare = self.confidential_workload.convert || self.squash || self.omit_history;

        let mut oimage: ImageConfiguration = serde_json::from_slice(&self.oconfig)?;
        // Always replace this value; we're newer than our base image.
        oimage.set_created(Some(rfc3339(created)));
        // Clear the diff ID list, since we always repopulate it.
        let mut rootfs = oimage.rootfs().clone();
        rootfs.set_typ(docker::TYPE_LAYERS.to_string());
        rootfs.diff_ids_mut().clear();
        oimage.set_rootfs(rootfs);
        // Only clear the history for single-layer output, so that we can
        // otherwise append to it.
        if single_layer_or_bare {
            oimage.set_history(Some(Vec::new()));
        }

        let mut dimage: V2Image = serde_json::from_slice(&self.dconfig)?;
        // Set the parent, but only for compatibility with "classic" builds.
        if self.compat_set_parent == Some(true) {
            dimage.parent = self.parent.clone();
        }
        dimage.container = self.container_id.clone();
        if let Some(config) = dimage.config.clone() {
            dimage.container_config = config;
        }
        dimage.created = Some(created);
        dimage.rootfs = Some(V2S2RootFs {
            typ: docker::TYPE_LAYERS.to_string(),
            diff_ids: Vec::new(),
        });
        if single_layer_or_bare {
            // The parent's layers and history no longer describe ours.
            dimage.parent = String::new();
            dimage.history.clear();
        }

        // Apply any caller-supplied configuration on top.
        let mut oconfig = oimage.config().clone().unwrap_or_default();
        let dconfig = dimage.config.get_or_insert_with(Default::default);
        apply_overrides(
            dconfig,
            &mut oconfig,
            &self.override_changes,
            self.override_config.as_ref(),
        )?;

        // A confidential workload boots through its own launcher; settings
        // that assume a conventional rootfs won't work there.
        if self.confidential_workload.convert {
            let entrypoint = vec!["/entrypoint".to_string()];
            dconfig.entrypoint = Some(entrypoint.clone());
            oconfig.set_entrypoint(Some(entrypoint));
            dconfig.cmd = None;
            oconfig.set_cmd(None);
            dconfig.user = String::new();
            oconfig.set_user(None);
            dconfig.working_dir = String::new();
            oconfig.set_working_dir(None);
            dconfig.healthcheck = None;
            dconfig.shell = None;
            dconfig.volumes = None;
            oconfig.set_volumes(None);
            dconfig.exposed_ports = None;
            oconfig.set_exposed_ports(None);
        }
        oimage.set_config(Some(oconfig));

        Ok((oimage, dimage))
    }

    /// Run the pipeline and wrap its outputs in a read-only blob source.
    pub(crate) fn new_image_source(&self) -> Result<ContainerImageSource<'a>> {
        // Decide which type of manifest and configuration we're producing.
        let manifest_type = if self.preferred_manifest_type.is_empty() {
            OCI_V1_IMAGE_MANIFEST
        } else {
            self.preferred_manifest_type.as_str()
        };
        if manifest_type != OCI_V1_IMAGE_MANIFEST && manifest_type != DOCKER_V2S2_IMAGE_MANIFEST {
            return Err(CommitError::UnsupportedManifestType(
                manifest_type.to_string(),
            ));
        }

        let api_layers: Vec<&CommitLinkedLayerInfo> =
            self.pre_layers.iter().chain(self.post_layers.iter()).collect();

        let plan = plan_layers(
            self.store,
            &self.layer_id,
            self.pre_layers.len(),
            self.post_layers.len(),
            self.single_layer(),
            !self.extra_image_content.is_empty(),
        )?;
        tracing::debug!("layer list: {:?}", plan);

        // Reject undefined compressors before any layer byte moves.
        compute_layer_media_types("layers", self.compression)?;

        // The staging directory owns every blob we write until the image
        // source takes it over; unwinding with an error removes it.
        let staging = tempfile::Builder::new()
            .prefix(concat!(env!("CARGO_PKG_NAME"), "."))
            .tempdir()
            .map_err(|e| {
                CommitError::Archive(format!(
                    "creating temporary directory to hold layer blobs: {e}"
                ))
            })?;
        tracing::debug!("using {:?} to hold temporary data", staging.path());

        let created = self.created.unwrap_or_else(Utc::now);
        let (mut oimage, mut dimage) = self.create_configs(created)?;

        let mut olayers: Vec<Descriptor> = Vec::new();
        let mut dlayers: Vec<V2S2Descriptor> = Vec::new();
        let mut odiff_ids: Vec<String> = Vec::new();
        let mut blob_layers: HashMap<String, BlobLayerInfo> = HashMap::new();
        let mut owned_files: Vec<PathBuf> = api_layers
            .iter()
            .filter(|info| info.owned)
            .map(|info| info.linked_layer.blob_path.clone())
            .collect();
        let mut extra_diff: Option<(PathBuf, String)> = None;

        for planned in &plan {
            let what = if self.single_layer() {
                format!("container {:?}", self.container_id)
            } else {
                match planned {
                    PlannedLayer::Parent(id) | PlannedLayer::Top(id) => format!("layer {id:?}"),
                    PlannedLayer::Synthesized => SYNTHESIZED_LAYER_ID.to_string(),
                    PlannedLayer::Linked(i) => api_layers[*i].layer_id.clone(),
                }
            };

            // We already know the digests of the contents of parent
            // layers; reuse the recorded blobsum, diff ID, and size rather
            // than streaming any bytes.
            if let PlannedLayer::Parent(id) = planned {
                let layer = self
                    .store
                    .layer(id)
                    .map_err(|e| CommitError::Storage(format!("unable to locate layer {id:?}: {e}")))?;
                if !self.single_layer() {
                    if let Some(digest) = layer.uncompressed_digest.clone() {
                        let size = layer.uncompressed_size.unwrap_or(0);
                        olayers.push(oci_descriptor(MediaType::ImageLayer, &digest, size)?);
                        dlayers.push(V2S2Descriptor {
                            media_type: V2S2_LAYER_MEDIA_TYPE.to_string(),
                            size,
                            digest: digest.clone(),
                        });
                        odiff_ids.push(digest.clone());
                        blob_layers.insert(
                            digest,
                            BlobLayerInfo {
                                id: layer.id.clone(),
                                size,
                            },
                        );
                        continue;
                    }
                }
            }

            // The media types depend on the compression we'll apply.
            let (omedia_type, dmedia_type) =
                compute_layer_media_types(&what, self.compression)?;

            // Decide where this layer's bytes come from.
            let mut rc: LayerStream<'a> = if self.confidential_workload.convert {
                LayerStream::Workload(self.extract_confidential_workload()?)
            } else if self.squash {
                LayerStream::Rootfs(self.extract_rootfs(ExtractRootfsOptions::default())?)
            } else {
                match planned {
                    PlannedLayer::Linked(i) => {
                        let info = api_layers[*i];
                        let file = File::open(&info.linked_layer.blob_path).map_err(|e| {
                            CommitError::Storage(format!(
                                "opening layer blob for {}: {}",
                                info.layer_id, e
                            ))
                        })?;
                        LayerStream::File(file)
                    }
                    PlannedLayer::Synthesized => {
                        // Slip in additional content as its own layer.
                        let (path, digest, _size) =
                            self.make_extra_image_content_diff(true, created).map_err(|e| {
                                CommitError::Archive(format!(
                                    "unable to generate layer for additional content: {e}"
                                ))
                            })?;
                        owned_files.push(path.clone());
                        let file = File::open(&path)?;
                        extra_diff = Some((path, digest));
                        LayerStream::File(file)
                    }
                    PlannedLayer::Top(_) if self.empty_layer => {
                        // The final layer, which we don't want a diff for.
                        continue;
                    }
                    PlannedLayer::Parent(id) | PlannedLayer::Top(id) => {
                        let diff = self
                            .store
                            .diff("", id, &DiffOptions::default())
                            .map_err(|e| {
                                CommitError::Storage(format!("extracting {what}: {e}"))
                            })?;
                        LayerStream::Diff(diff)
                    }
                }
            };

            // One pass: filter tar headers, hash the uncompressed stream,
            // compress if requested, and hash and count what lands on disk.
            let layer_path = staging.path().join("layer");
            let layer_file = File::create(&layer_path)
                .map_err(|e| CommitError::Archive(format!("opening file for {what}: {e}")))?;
            let sink = LayerSink::new(layer_file, self.compression)?;
            let mut filter = TarFilter::new(sink, self.tar_mtime_override());

            let copy_result = io::copy(&mut rc, &mut filter);
            let close_result = rc.close();
            let copied = copy_result
                .map_err(|e| CommitError::Archive(format!("storing {what} to file: {e}")))?;
            close_result
                .map_err(|e| CommitError::Archive(format!("extracting container rootfs: {e}")))?;
            let sink = filter
                .finish()
                .map_err(|e| CommitError::Archive(format!("storing {what} to file: {e}")))?;
            let blob = sink.finish()?;

            let size = if self.compression == Compression::Uncompressed {
                if copied != blob.size {
                    return Err(CommitError::Internal(format!(
                        "storing {} to file: inconsistent layer size (copied {}, wrote {})",
                        what, copied, blob.size
                    )));
                }
                copied
            } else {
                blob.size
            };
            tracing::debug!(
                "{} size is {} bytes, uncompressed digest {}, possibly-compressed digest {}",
                what,
                size,
                blob.uncompressed_digest,
                blob.digest
            );

            // Name the staged blob by digest so lookups can find it later.
            let final_path = staging.path().join(&blob.digest);
            std::fs::rename(&layer_path, &final_path).map_err(|e| {
                CommitError::Archive(format!(
                    "storing {} to file while renaming {:?} to {:?}: {}",
                    what, layer_path, final_path, e
                ))
            })?;

            // The manifests identify blobs by their possibly-compressed
            // digests; the diff ID is always the uncompressed digest.
            olayers.push(oci_descriptor(omedia_type, &blob.digest, size)?);
            dlayers.push(V2S2Descriptor {
                media_type: dmedia_type.to_string(),
                size,
                digest: blob.digest.clone(),
            });
            odiff_ids.push(blob.uncompressed_digest.clone());
        }

        // Record the diff IDs in both configurations.
        let mut rootfs = oimage.rootfs().clone();
        *rootfs.diff_ids_mut() = odiff_ids.clone();
        oimage.set_rootfs(rootfs);
        if let Some(rootfs) = dimage.rootfs.as_mut() {
            rootfs.diff_ids = odiff_ids.clone();
        }

        self.assemble_history(&mut oimage, &mut dimage, created, extra_diff.as_ref())?;

        // Encode the configuration blobs and describe them in manifests.
        let oconfig_bytes = canonical_json(&oimage)?;
        tracing::debug!("OCI v1 config = {}", String::from_utf8_lossy(&oconfig_bytes));
        let oconfig_digest = digest_bytes(&oconfig_bytes);
        let mut omanifest_builder = ImageManifestBuilder::default()
            .schema_version(SCHEMA_VERSION)
            .media_type(MediaType::ImageManifest)
            .config(oci_descriptor(
                MediaType::ImageConfig,
                &oconfig_digest,
                oconfig_bytes.len() as u64,
            )?)
            .layers(olayers);
        if !self.annotations.is_empty() {
            omanifest_builder = omanifest_builder.annotations(self.annotations.clone());
        }
        let omanifest: ImageManifest = omanifest_builder.build()?;
        let omanifest_bytes = canonical_json(&omanifest)?;

        let dconfig_bytes = canonical_json(&dimage)?;
        tracing::debug!(
            "Docker v2s2 config = {}",
            String::from_utf8_lossy(&dconfig_bytes)
        );
        let dmanifest = V2S2Manifest {
            schema_version: 2,
            media_type: V2S2_MANIFEST_MEDIA_TYPE.to_string(),
            config: V2S2Descriptor {
                media_type: V2S2_CONFIG_MEDIA_TYPE.to_string(),
                size: dconfig_bytes.len() as u64,
                digest: digest_bytes(&dconfig_bytes),
            },
            layers: dlayers,
        };
        let dmanifest_bytes = canonical_json(&dmanifest)?;

        let (config, manifest) = if manifest_type == OCI_V1_IMAGE_MANIFEST {
            (oconfig_bytes, omanifest_bytes)
        } else {
            (dconfig_bytes, dmanifest_bytes)
        };

        let config_digest = digest_bytes(&config);
        Ok(ContainerImageSource {
            staging: Some(staging),
            store: self.store,
            container_id: self.container_id.clone(),
            layer_id: self.layer_id.clone(),
            names: self.names.clone(),
            compression: self.compression,
            config,
            config_digest,
            manifest,
            manifest_type: manifest_type.to_string(),
            blob_directory: self.blob_directory.clone(),
            blob_layers,
            owned_files,
        })
    }

    /// Append this commit's history entries to both configurations and
    /// check the cross-format bookkeeping.
    fn assemble_history(
        &self,
        oimage: &mut ImageConfiguration,
        dimage: &mut V2Image,
        created: DateTime<Utc>,
        extra_diff: Option<&(PathBuf, String)>,
    ) -> Result<()> {
        if self.omit_history {
            return Ok(());
        }

        // How long the parent's history was before we started adding.
        let base_history_len = oimage.history().as_ref().map_or(0, |h| h.len());

        let append = |oimage: &mut ImageConfiguration,
                      dimage: &mut V2Image,
                      entries: &[History],
                      empty: bool| {
            for entry in entries {
                let mut oentry = entry.clone();
                oentry.set_empty_layer(Some(empty));
                oimage.history_mut().get_or_insert_with(Vec::new).push(oentry);
                dimage.history.push(V2S2History {
                    created: Some(parse_history_created(entry)),
                    author: entry.author().clone().unwrap_or_default(),
                    created_by: entry.created_by().clone().unwrap_or_default(),
                    comment: entry.comment().clone().unwrap_or_default(),
                    empty_layer: empty,
                });
            }
        };

        append(oimage, dimage, &self.pre_empty_layers, true);
        for info in &self.pre_layers {
            let history = info.linked_layer.history.clone();
            let empty = history.empty_layer().unwrap_or(false);
            append(oimage, dimage, &[history], empty);
        }

        // One entry for this commit's layer, empty or not.
        let mut onews = HistoryBuilder::default().build()?;
        onews.set_created(Some(rfc3339(created)));
        if !self.created_by.is_empty() {
            onews.set_created_by(Some(self.created_by.clone()));
        }
        if let Some(author) = oimage.author().clone() {
            onews.set_author(Some(author));
        }
        if !self.history_comment.is_empty() {
            onews.set_comment(Some(self.history_comment.clone()));
        }
        onews.set_empty_layer(Some(self.empty_layer));
        oimage.history_mut().get_or_insert_with(Vec::new).push(onews);
        dimage.history.push(V2S2History {
            created: Some(created),
            author: dimage.author.clone(),
            created_by: self.created_by.clone(),
            comment: self.history_comment.clone(),
            empty_layer: self.empty_layer,
        });

        // The synthesized layer sits right after this commit's layer in
        // the blob list, so its history entry has to come right after the
        // commit's entry to keep the non-empty counts aligned.
        if let Some((_, digest)) = extra_diff {
            let encoded = digest.strip_prefix("sha256:").unwrap_or(digest);
            let created_by = format!("/bin/sh -c #(nop) ADD dir:{encoded} in /,");
            let mut oentry = HistoryBuilder::default().build()?;
            oentry.set_created(Some(rfc3339(created)));
            oentry.set_created_by(Some(created_by.clone()));
            oimage.history_mut().get_or_insert_with(Vec::new).push(oentry);
            dimage.history.push(V2S2History {
                created: Some(created),
                created_by,
                ..Default::default()
            });
        }

        append(oimage, dimage, &self.post_empty_layers, true);
        for info in &self.post_layers {
            let history = info.linked_layer.history.clone();
            let empty = history.empty_layer().unwrap_or(false);
            append(oimage, dimage, &[history], empty);
        }

        // Note which base image was used, if it wasn't just an image ID,
        // on the first history entry this commit produced.
        if self.parent.contains(&self.from_image_id)
            && !self.from_image_name.is_empty()
            && !self.from_image_name.starts_with(&self.from_image_id)
        {
            let existing = oimage.history().as_ref().unwrap()[base_history_len]
                .comment()
                .clone()
                .unwrap_or_default();
            let mut from_comment = String::new();
            if !existing.is_empty() {
                from_comment.push(' ');
            }
            from_comment.push_str("FROM ");
            from_comment.push_str(&self.from_image_name);
            oimage.history_mut().as_mut().unwrap()[base_history_len]
                .set_comment(Some(existing + &from_comment));
            dimage.history[base_history_len].comment += &from_comment;
        }

        // Confidence check that the history and the diff ID list still
        // agree about how many non-empty layers there are. Only applicable
        // if the base image gave us at least one entry to start from.
        if base_history_len != 0 {
            let oexpected = oimage
                .history()
                .iter()
                .flatten()
                .filter(|h| !h.empty_layer().unwrap_or(false))
                .count();
            if oimage.rootfs().diff_ids().len() != oexpected {
                return Err(CommitError::Internal(format!(
                    "history lists {} non-empty layers, but we have {} layers on disk",
                    oexpected,
                    oimage.rootfs().diff_ids().len()
                )));
            }
            let dexpected = dimage.history.iter().filter(|h| !h.empty_layer).count();
            let ddiff_ids = dimage.rootfs.as_ref().map_or(0, |r| r.diff_ids.len());
            if ddiff_ids != dexpected {
                return Err(CommitError::Internal(format!(
                    "history lists {dexpected} non-empty layers, but we have {ddiff_ids} layers on disk"
                )));
            }
        }
        Ok(())
    }
}

fn parse_history_created(entry: &History) -> DateTime<Utc> {
    entry
        .created()
        .as_deref()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(docker::zero_time)
}

/// The committed image, served read-only by digest.
///
/// Writing to the source is not supported; the staging directory it owns is
/// removed by [`close`](Self::close) (or when the source is dropped).
pub struct ContainerImageSource<'a> {
    staging: Option<tempfile::TempDir>,
    store: &'a dyn Store,
    container_id: String,
    layer_id: String,
    names: Vec<String>,
    compression: Compression,
    config: Vec<u8>,
    config_digest: String,
    manifest: Vec<u8>,
    manifest_type: String,
    blob_directory: Option<PathBuf>,
    blob_layers: HashMap<String, BlobLayerInfo>,
    owned_files: Vec<PathBuf>,
}

impl std::fmt::Debug for ContainerImageSource<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContainerImageSource")
            .field("container_id", &self.container_id)
            .field("layer_id", &self.layer_id)
            .finish_non_exhaustive()
    }
}

impl<'a> ContainerImageSource<'a> {
    /// The emitted manifest and its MIME type.
    pub fn get_manifest(&self) -> (&[u8], &str) {
        (&self.manifest, &self.manifest_type)
    }

    /// Canonical digest of the emitted configuration blob.
    pub fn config_digest(&self) -> &str {
        &self.config_digest
    }

    /// Names the source container was known by.
    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// The compression the staged layer blobs carry.
    pub fn compression(&self) -> Compression {
        self.compression
    }

    /// ID of the container this image was committed from.
    pub fn container_id(&self) -> &str {
        &self.container_id
    }

    /// ID of the container's top layer.
    pub fn layer_id(&self) -> &str {
        &self.layer_id
    }

    /// Fetch a blob's bytes and size by digest.
    ///
    /// The configuration comes from memory; parent layers that took the
    /// reuse fast-path are re-diffed from storage on demand; everything
    /// else is served from the staging directory or the optional
    /// supplemental blob directory.
    pub fn get_blob(&self, digest: &str) -> Result<(Box<dyn Read + Send + 'a>, u64)> {
        if digest == self.config_digest {
            tracing::debug!("start reading config");
            let reader = io::Cursor::new(self.config.clone());
            return Ok((Box::new(reader), self.config.len() as u64));
        }
        if let Some(info) = self.blob_layers.get(digest) {
            let reader = self.store.diff("", &info.id, &DiffOptions::default())?;
            return Ok((reader, info.size));
        }
        let staging = self
            .staging
            .as_ref()
            .map(|dir| dir.path().to_path_buf())
            .unwrap_or_default();
        for blob_dir in self
            .blob_directory
            .iter()
            .cloned()
            .chain(std::iter::once(staging))
        {
            if blob_dir.as_os_str().is_empty() {
                continue;
            }
            match File::open(blob_dir.join(digest)) {
                Ok(file) => {
                    let size = file.metadata()?.len();
                    tracing::debug!("reading layer {:?}", digest);
                    return Ok((Box::new(file), size));
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => {
                    tracing::debug!(
                        "error checking for layer {:?} in {:?}: {}",
                        digest,
                        blob_dir,
                        e
                    );
                }
            }
        }
        Err(CommitError::BlobNotFound(digest.to_string()))
    }

    /// Blob reads re-enter the storage collaborator, which is not promised
    /// to be thread-safe.
    pub fn has_thread_safe_get_blob(&self) -> bool {
        false
    }

    /// Layer substitutions for a copier to apply; always none.
    pub fn layer_infos_for_copy(&self) -> Option<Vec<Descriptor>> {
        None
    }

    /// Signatures attached to the image; always none.
    pub fn signatures(&self) -> Option<Vec<Vec<u8>>> {
        None
    }

    /// Writing through this source is never possible.
    pub fn image_destination(&self) -> Result<()> {
        Err(CommitError::UnsupportedOperation("can't write to a container"))
    }

    /// Remove the staging directory and any ingestion temporaries this
    /// commit created.
    pub fn close(mut self) -> Result<()> {
        for path in std::mem::take(&mut self.owned_files) {
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => {
                    tracing::warn!("removing ingested layer blob {:?}: {}", path, e);
                }
            }
        }
        if let Some(staging) = self.staging.take() {
            staging
                .close()
                .map_err(|e| CommitError::Archive(format!("removing layer blob directory: {e}")))?;
        }
        Ok(())
    }
}
