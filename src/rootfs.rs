//! Rootfs extraction streaming.
//!
//! Extracting a mounted root filesystem as one tar stream is the only place
//! the pipeline uses concurrency: a producer thread writes the archive into
//! an anonymous pipe while the consumer reads. Completion status travels
//! through a single-capacity channel that the consumer drains exactly once
//! after closing its read end; the consumer also owns releasing the mount,
//! and an unmount failure is surfaced unless a prior error is already being
//! reported, in which case it is downgraded to a warning.

use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::sync::mpsc;
use std::sync::Arc;

use crate::copier::{CopierOptions, RootfsCopier};
use crate::error::{CommitError, Result};
use crate::store::Store;

/// A streaming tar rendition of a mounted container filesystem.
///
/// Read it to the end, then call [`close`](Self::close) to collect the
/// producer's status and release the mount. Dropping the stream without
/// closing it releases the mount best-effort.
pub struct RootfsStream<'a> {
    reader: Option<io::PipeReader>,
    err_rx: mpsc::Receiver<Result<()>>,
    store: &'a dyn Store,
    container_id: String,
    done: bool,
}

impl Read for RootfsStream<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.reader.as_mut() {
            Some(reader) => reader.read(buf),
            None => Ok(0),
        }
    }
}

impl RootfsStream<'_> {
    /// Close the read end, drain the producer's status, and unmount.
    pub fn close(mut self) -> Result<()> {
        self.close_mut()
    }

    fn close_mut(&mut self) -> Result<()> {
        if self.done {
            return Ok(());
        }
        self.done = true;
        drop(self.reader.take());
        let produced = self.err_rx.recv().unwrap_or(Ok(()));
        let unmounted = self.store.unmount(&self.container_id, false);
        match produced {
            Err(e) => {
                if let Err(e2) = unmounted {
                    tracing::warn!(
                        "unmounting container {:?}: {}",
                        self.container_id,
                        e2
                    );
                }
                Err(e)
            }
            Ok(()) => unmounted.map(|_| ()),
        }
    }
}

impl Drop for RootfsStream<'_> {
    fn drop(&mut self) {
        if !self.done {
            if let Err(e) = self.close_mut() {
                tracing::warn!("closing rootfs stream: {}", e);
            }
        }
    }
}

/// Start the producer for an already-mounted container filesystem.
///
/// `prefix`, when present, is written into the pipe before the archive
/// proper; the squash path uses it to slip synthesized content in front of
/// the rootfs without a terminating footer in between.
pub(crate) fn spawn_rootfs_stream<'a>(
    store: &'a dyn Store,
    container_id: &str,
    mount_point: PathBuf,
    copier: Arc<dyn RootfsCopier>,
    options: CopierOptions,
    prefix: Option<Box<dyn FnOnce(&mut dyn Write) -> Result<()> + Send>>,
) -> Result<RootfsStream<'a>> {
    let (reader, writer) = io::pipe()?;
    let (err_tx, err_rx) = mpsc::sync_channel(1);
    let container = container_id.to_string();
    std::thread::Builder::new()
        .name("rootfs-extract".to_string())
        .spawn(move || {
            let mut writer = writer;
            let result = (|| -> Result<()> {
                if let Some(prefix) = prefix {
                    prefix(&mut writer)?;
                }
                copier.copy(&mount_point, &options, &mut writer)
            })();
            if let Err(e) = &result {
                tracing::debug!("extracting rootfs of container {:?}: {}", container, e);
            }
            // Capacity one; this never blocks, and the consumer drains it
            // exactly once. Dropping the writer closes our end of the pipe.
            let _ = err_tx.send(result);
        })
        .map_err(|e| CommitError::Internal(format!("spawning extraction thread: {e}")))?;
    Ok(RootfsStream {
        reader: Some(reader),
        err_rx,
        store,
        container_id: container_id.to_string(),
        done: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{ContainerRecord, DiffOptions, LayerRecord};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct UnmountCounter(AtomicUsize);

    impl Store for UnmountCounter {
        fn container(&self, _: &str) -> Result<ContainerRecord> {
            unimplemented!()
        }
        fn layer(&self, _: &str) -> Result<LayerRecord> {
            unimplemented!()
        }
        fn mount(&self, _: &str, _: &str) -> Result<PathBuf> {
            unimplemented!()
        }
        fn unmount(&self, _: &str, _: bool) -> Result<bool> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(true)
        }
        fn diff(&self, _: &str, _: &str, _: &DiffOptions) -> Result<Box<dyn Read + Send>> {
            unimplemented!()
        }
        fn container_directory(&self, _: &str) -> Result<PathBuf> {
            unimplemented!()
        }
    }

    #[test]
    fn test_stream_delivers_rootfs_and_unmounts_once() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("file"), b"content").unwrap();
        let store = UnmountCounter(AtomicUsize::new(0));
        let mut stream = spawn_rootfs_stream(
            &store,
            "ctr",
            dir.path().to_path_buf(),
            Arc::new(crate::copier::TarCopier),
            CopierOptions::default(),
            None,
        )
        .unwrap();
        let mut data = Vec::new();
        stream.read_to_end(&mut data).unwrap();
        stream.close().unwrap();
        assert_eq!(store.0.load(Ordering::SeqCst), 1);

        let mut archive = tar::Archive::new(&data[..]);
        let names: Vec<String> = archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["file".to_string()]);
    }

    #[test]
    fn test_prefix_is_written_before_rootfs() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("z"), b"tail").unwrap();
        let store = UnmountCounter(AtomicUsize::new(0));
        let mut stream = spawn_rootfs_stream(
            &store,
            "ctr",
            dir.path().to_path_buf(),
            Arc::new(crate::copier::TarCopier),
            CopierOptions::default(),
            Some(Box::new(|out: &mut dyn Write| {
                crate::tarwriter::write_file_header(out, "/injected", 2, 0o644, 1)?;
                crate::tarwriter::write_file_data(out, &mut &b"hi"[..], 2)?;
                Ok(())
            })),
        )
        .unwrap();
        let mut data = Vec::new();
        stream.read_to_end(&mut data).unwrap();
        stream.close().unwrap();

        let mut archive = tar::Archive::new(&data[..]);
        let names: Vec<String> = archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["injected".to_string(), "z".to_string()]);
    }

    #[test]
    fn test_producer_error_is_reported_on_close() {
        let store = UnmountCounter(AtomicUsize::new(0));
        let stream = spawn_rootfs_stream(
            &store,
            "ctr",
            PathBuf::from("/does/not/exist"),
            Arc::new(crate::copier::TarCopier),
            CopierOptions::default(),
            None,
        )
        .unwrap();
        assert!(stream.close().is_err());
        assert_eq!(store.0.load(Ordering::SeqCst), 1);
    }
}
