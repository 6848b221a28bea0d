//! Ingestion of caller-supplied linked layers.
//!
//! A linked layer arrives as either a ready-made blob file or a directory
//! to be archived. Ingestion normalizes both shapes into
//! [`CommitLinkedLayerInfo`] records carrying the uncompressed digest and
//! size the planner and assembler need, archiving directories into the
//! per-container data directory as it goes.

use std::io::Write;
use std::path::PathBuf;

use oci_spec::image::History;

use crate::archive::{digest_reader, CountingWriter, Sha256Writer};
use crate::copier::tar_directory;
use crate::error::{CommitError, Result};
use crate::store::Store;

/// A caller-supplied extra layer to commit alongside the container's own
/// layers.
///
/// The layer's emptiness is carried by its history entry: a history entry
/// with `empty_layer` set must come with an empty `blob_path`, and vice
/// versa.
#[derive(Debug, Clone)]
pub struct LinkedLayer {
    /// The one history entry describing this layer.
    pub history: History,
    /// A blob file or a directory to archive; empty for an empty layer.
    pub blob_path: PathBuf,
}

impl LinkedLayer {
    fn is_empty_layer(&self) -> bool {
        self.history.empty_layer().unwrap_or(false)
    }
}

/// A linked layer after ingestion.
#[derive(Debug, Clone)]
pub(crate) struct CommitLinkedLayerInfo {
    /// Opaque token of the form `(prepended layer N)` / `(appended layer
    /// N)`, used to label this layer in logs and errors.
    pub layer_id: String,
    /// The (possibly rewritten) linked layer.
    pub linked_layer: LinkedLayer,
    /// Canonical digest of the layer's uncompressed stream.
    pub uncompressed_digest: String,
    /// Size of the uncompressed stream.
    pub size: u64,
    /// Whether ingestion created the blob file and should clean it up when
    /// the image source closes.
    pub owned: bool,
}

/// Calculate the size and digest information for layers we intend to add to
/// the image being committed.
///
/// Directories are archived to a temporary file in the per-container
/// directory and the layer's `blob_path` is rewritten to point at the
/// archive; regular files are digested in place.
pub(crate) fn make_linked_layer_infos(
    store: &dyn Store,
    container_id: &str,
    layers: &[LinkedLayer],
    layer_type: &str,
) -> Result<Vec<CommitLinkedLayerInfo>> {
    let mut infos = Vec::with_capacity(layers.len());
    for (i, layer) in layers.iter().enumerate() {
        // Complain if the empty-layer flag and "is the blob path empty"
        // don't agree.
        if layer.is_empty_layer() != layer.blob_path.as_os_str().is_empty() {
            return Err(CommitError::InconsistentRequest(format!(
                "layer-is-empty = {}, but content path is {:?}",
                layer.is_empty_layer(),
                layer.blob_path
            )));
        }
        // If there's no layer contents, we're done with this one.
        if layer.is_empty_layer() {
            continue;
        }
        let mut info = CommitLinkedLayerInfo {
            layer_id: format!("({} {})", layer_type, i + 1),
            linked_layer: layer.clone(),
            uncompressed_digest: String::new(),
            size: 0,
            owned: false,
        };
        let st = std::fs::metadata(&layer.blob_path).map_err(|e| {
            CommitError::Storage(format!(
                "checking if layer content {} is a directory: {}",
                layer.blob_path.display(),
                e
            ))
        })?;
        if st.is_dir() {
            // Archive it, digesting the archive while we store a copy in
            // the per-container directory.
            let cdir = store.container_directory(container_id)?;
            let file = tempfile::Builder::new()
                .prefix("linked-layer")
                .tempfile_in(&cdir)
                .map_err(|e| {
                    CommitError::Archive(format!(
                        "creating temporary file to hold blob for {:?}: {}",
                        layer.blob_path, e
                    ))
                })?;
            let mut writer = Sha256Writer::new(CountingWriter::new(file));
            tar_directory(&layer.blob_path, &mut writer).map_err(|e| {
                CommitError::Archive(format!(
                    "generating a layer blob from {:?}: {}",
                    layer.blob_path, e
                ))
            })?;
            writer.flush()?;
            let (digest, counter) = writer.finish();
            let (file, size) = counter.finish();
            let (_, path) = file.keep().map_err(|e| {
                CommitError::Archive(format!(
                    "storing a copy of {:?}: {}",
                    layer.blob_path, e
                ))
            })?;
            info.uncompressed_digest = digest;
            info.size = size;
            info.linked_layer.blob_path = path;
            info.owned = true;
        } else {
            // Not a directory; just digest it.
            let mut file = std::fs::File::open(&layer.blob_path)?;
            let (digest, size) = digest_reader(&mut file)?;
            info.uncompressed_digest = digest;
            info.size = size;
        }
        infos.push(info);
    }
    Ok(infos)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::digest_bytes;
    use oci_spec::image::HistoryBuilder;
    use std::io::Read;

    struct DirStore(PathBuf);

    impl Store for DirStore {
        fn container(&self, _: &str) -> Result<crate::store::ContainerRecord> {
            unimplemented!()
        }
        fn layer(&self, _: &str) -> Result<crate::store::LayerRecord> {
            unimplemented!()
        }
        fn mount(&self, _: &str, _: &str) -> Result<PathBuf> {
            unimplemented!()
        }
        fn unmount(&self, _: &str, _: bool) -> Result<bool> {
            unimplemented!()
        }
        fn diff(
            &self,
            _: &str,
            _: &str,
            _: &crate::store::DiffOptions,
        ) -> Result<Box<dyn Read + Send>> {
            unimplemented!()
        }
        fn container_directory(&self, _: &str) -> Result<PathBuf> {
            Ok(self.0.clone())
        }
    }

    #[test]
    fn test_empty_flag_must_match_blob_path() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirStore(dir.path().to_path_buf());
        let layer = LinkedLayer {
            history: HistoryBuilder::default()
                .empty_layer(true)
                .build()
                .unwrap(),
            blob_path: PathBuf::from("/somewhere"),
        };
        let err =
            make_linked_layer_infos(&store, "ctr", &[layer], "prepended layer").unwrap_err();
        assert!(matches!(err, CommitError::InconsistentRequest(_)));
    }

    #[test]
    fn test_empty_layers_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirStore(dir.path().to_path_buf());
        let layer = LinkedLayer {
            history: HistoryBuilder::default()
                .empty_layer(true)
                .build()
                .unwrap(),
            blob_path: PathBuf::new(),
        };
        let infos =
            make_linked_layer_infos(&store, "ctr", &[layer], "prepended layer").unwrap();
        assert!(infos.is_empty());
    }

    #[test]
    fn test_regular_file_is_digested_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirStore(dir.path().to_path_buf());
        let blob = dir.path().join("layer.tar");
        std::fs::write(&blob, b"not really a tarball").unwrap();
        let layer = LinkedLayer {
            history: HistoryBuilder::default().build().unwrap(),
            blob_path: blob.clone(),
        };
        let infos =
            make_linked_layer_infos(&store, "ctr", &[layer], "appended layer").unwrap();
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0].layer_id, "(appended layer 1)");
        assert_eq!(infos[0].size, 20);
        assert_eq!(
            infos[0].uncompressed_digest,
            digest_bytes(b"not really a tarball")
        );
        assert_eq!(infos[0].linked_layer.blob_path, blob);
        assert!(!infos[0].owned);
    }

    #[test]
    fn test_directory_is_archived() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirStore(dir.path().to_path_buf());
        let tree = dir.path().join("tree");
        std::fs::create_dir(&tree).unwrap();
        std::fs::write(tree.join("data"), b"contents").unwrap();
        let layer = LinkedLayer {
            history: HistoryBuilder::default().build().unwrap(),
            blob_path: tree.clone(),
        };
        let infos =
            make_linked_layer_infos(&store, "ctr", &[layer], "prepended layer").unwrap();
        assert_eq!(infos.len(), 1);
        let staged = &infos[0].linked_layer.blob_path;
        assert_ne!(staged, &tree);
        assert!(infos[0].owned);
        let mut data = Vec::new();
        std::fs::File::open(staged)
            .unwrap()
            .read_to_end(&mut data)
            .unwrap();
        assert_eq!(data.len() as u64, infos[0].size);
        assert_eq!(digest_bytes(&data), infos[0].uncompressed_digest);
        // The archive holds the directory's contents.
        let mut archive = tar::Archive::new(&data[..]);
        let names: Vec<String> = archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["data".to_string()]);
    }
}
