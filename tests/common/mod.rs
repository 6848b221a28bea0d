//! Test fixtures for isolated commit runs.

use std::collections::HashMap;
use std::io::{Cursor, Read};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use sha2::{Digest, Sha256};

use ccommit_rs::{
    CommitError, ContainerRecord, DiffOptions, LayerRecord, Result, Store,
};

/// An in-memory storage driver with canned containers, layers, and diffs.
///
/// Layer diffs are plain uncompressed tar byte vectors; mounting serves a
/// directory created by the test. Mounts and unmounts are counted so tests
/// can assert they stay paired.
pub struct TestStore {
    containers: HashMap<String, ContainerRecord>,
    layers: HashMap<String, LayerRecord>,
    diffs: Mutex<HashMap<String, Vec<u8>>>,
    rootfs: Option<PathBuf>,
    container_dir: PathBuf,
    pub mounts: AtomicUsize,
    pub unmounts: AtomicUsize,
    pub diff_reads: AtomicUsize,
}

impl TestStore {
    pub fn new(container_dir: PathBuf) -> Self {
        Self {
            containers: HashMap::new(),
            layers: HashMap::new(),
            diffs: Mutex::new(HashMap::new()),
            rootfs: None,
            container_dir,
            mounts: AtomicUsize::new(0),
            unmounts: AtomicUsize::new(0),
            diff_reads: AtomicUsize::new(0),
        }
    }

    pub fn add_container(&mut self, id: &str, layer_id: &str) {
        self.containers.insert(
            id.to_string(),
            ContainerRecord {
                id: id.to_string(),
                names: vec![format!("{id}-working")],
                layer_id: layer_id.to_string(),
            },
        );
    }

    /// Add a layer whose diff bytes are recorded but whose uncompressed
    /// digest is unknown to the driver (like a fresh read-write layer).
    pub fn add_layer(&mut self, id: &str, parent: Option<&str>, diff: Vec<u8>) {
        self.layers.insert(
            id.to_string(),
            LayerRecord {
                id: id.to_string(),
                parent: parent.map(str::to_string),
                uncompressed_digest: None,
                uncompressed_size: None,
            },
        );
        self.diffs.lock().unwrap().insert(id.to_string(), diff);
    }

    /// Add a layer with a recorded uncompressed digest and size, as a
    /// parent layer pulled from an image would have.
    pub fn add_known_layer(&mut self, id: &str, parent: Option<&str>, diff: Vec<u8>) -> String {
        let digest = sha256_digest(&diff);
        self.layers.insert(
            id.to_string(),
            LayerRecord {
                id: id.to_string(),
                parent: parent.map(str::to_string),
                uncompressed_digest: Some(digest.clone()),
                uncompressed_size: Some(diff.len() as u64),
            },
        );
        self.diffs.lock().unwrap().insert(id.to_string(), diff);
        digest
    }

    pub fn set_rootfs(&mut self, path: PathBuf) {
        self.rootfs = Some(path);
    }
}

impl Store for TestStore {
    fn container(&self, id: &str) -> Result<ContainerRecord> {
        self.containers
            .get(id)
            .cloned()
            .ok_or_else(|| CommitError::Storage(format!("no container {id:?}")))
    }

    fn layer(&self, id: &str) -> Result<LayerRecord> {
        self.layers
            .get(id)
            .cloned()
            .ok_or_else(|| CommitError::Storage(format!("no layer {id:?}")))
    }

    fn mount(&self, _container_id: &str, _mount_label: &str) -> Result<PathBuf> {
        let rootfs = self
            .rootfs
            .clone()
            .ok_or_else(|| CommitError::Storage("nothing to mount".to_string()))?;
        self.mounts.fetch_add(1, Ordering::SeqCst);
        Ok(rootfs)
    }

    fn unmount(&self, _container_id: &str, _force: bool) -> Result<bool> {
        self.unmounts.fetch_add(1, Ordering::SeqCst);
        Ok(true)
    }

    fn diff(&self, _from: &str, to: &str, _options: &DiffOptions) -> Result<Box<dyn Read + Send>> {
        self.diff_reads.fetch_add(1, Ordering::SeqCst);
        let diff = self
            .diffs
            .lock()
            .unwrap()
            .get(to)
            .cloned()
            .ok_or_else(|| CommitError::Storage(format!("no diff for layer {to:?}")))?;
        Ok(Box::new(Cursor::new(diff)))
    }

    fn container_directory(&self, _container_id: &str) -> Result<PathBuf> {
        Ok(self.container_dir.clone())
    }
}

/// Canonical digest string of a byte slice.
pub fn sha256_digest(data: &[u8]) -> String {
    let mut sha = Sha256::new();
    sha.update(data);
    format!("sha256:{:x}", sha.finalize())
}

/// Build an uncompressed tar archive from `(path, contents)` pairs.
pub fn make_tar(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    for (path, contents) in entries {
        let mut header = tar::Header::new_ustar();
        header.set_mode(0o644);
        header.set_size(contents.len() as u64);
        header.set_mtime(1_600_000_000);
        header.set_entry_type(tar::EntryType::Regular);
        header.set_cksum();
        builder.append_data(&mut header, path, *contents).unwrap();
    }
    builder.into_inner().unwrap()
}

/// An empty tar archive: just the end-of-archive marker.
pub fn empty_tar() -> Vec<u8> {
    tar::Builder::new(Vec::new()).into_inner().unwrap()
}

/// Read every entry of an uncompressed tar stream as `(path, contents)`.
pub fn tar_entries(data: &[u8]) -> Vec<(String, Vec<u8>)> {
    let mut archive = tar::Archive::new(data);
    let mut entries = Vec::new();
    for entry in archive.entries().unwrap() {
        let mut entry = entry.unwrap();
        let path = entry.path().unwrap().to_string_lossy().into_owned();
        let mut contents = Vec::new();
        entry.read_to_end(&mut contents).unwrap();
        entries.push((path, contents));
    }
    entries
}
