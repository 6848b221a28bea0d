//! Stream plumbing for layer materialization.
//!
//! A layer blob is produced in a single pass: the uncompressed stream is
//! hashed for its diff ID while simultaneously being compressed (or passed
//! through), counted, and hashed again post-compression for its blobsum.
//! Nothing here ever re-reads staged bytes to recover a digest.
//!
//! # Writer chain
//!
//! ```text
//! tar filter -> LayerSink { src digester, CompressSink { gzip? -> BlobSink { dest digester?, counter, file } } }
//! ```
//!
//! When no compression is requested the destination digester is elided and
//! the source digest doubles as the blobsum, so the bytes are only hashed
//! once.

use std::fs::File;
use std::io::{self, Read, Write};

use flate2::write::GzEncoder;
use sha2::{Digest, Sha256};

use crate::error::{CommitError, Result};

/// Compression applied to layer blobs as they are staged.
///
/// Only `Uncompressed` and `Gzip` can be emitted; the other variants are
/// recognized so that requests for them fail with a precise error instead
/// of an unknown-value parse failure.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Compression {
    /// Store layer blobs as plain tar streams.
    #[default]
    Uncompressed,
    /// Compress layer blobs with gzip.
    Gzip,
    /// Recognized but rejected: the image specs define no media type.
    Bzip2,
    /// Recognized but rejected: the image specs define no media type.
    Xz,
    /// Recognized but rejected: the image specs define no media type.
    Zstd,
}

impl Compression {
    /// Short lowercase name, as used in error messages.
    pub fn name(&self) -> &'static str {
        match self {
            Compression::Uncompressed => "uncompressed",
            Compression::Gzip => "gzip",
            Compression::Bzip2 => "bzip2",
            Compression::Xz => "xz",
            Compression::Zstd => "zstd",
        }
    }
}

/// Render a SHA-256 state as a canonical digest string.
pub(crate) fn format_digest(sha: Sha256) -> String {
    format!("sha256:{:x}", sha.finalize())
}

/// Canonical digest of a byte slice.
pub(crate) fn digest_bytes(data: &[u8]) -> String {
    let mut sha = Sha256::new();
    sha.update(data);
    format_digest(sha)
}

/// Canonical digest and size of everything a reader yields.
pub(crate) fn digest_reader(reader: &mut dyn Read) -> Result<(String, u64)> {
    let mut counter = CountingWriter::new(Sha256Writer::new(io::sink()));
    io::copy(reader, &mut counter)?;
    let (sha_writer, count) = counter.finish();
    let (digest, _) = sha_writer.finish();
    Ok((digest, count))
}

/// Wraps a writer and counts the bytes passed through to it.
#[derive(Debug)]
pub(crate) struct CountingWriter<W> {
    inner: W,
    count: u64,
}

impl<W> CountingWriter<W> {
    pub(crate) fn new(inner: W) -> Self {
        Self { inner, count: 0 }
    }

    pub(crate) fn count(&self) -> u64 {
        self.count
    }

    pub(crate) fn finish(self) -> (W, u64) {
        (self.inner, self.count)
    }
}

impl<W: Write> Write for CountingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.count += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Wraps a writer and calculates the sha256 digest of data written through
/// to the inner writer.
pub(crate) struct Sha256Writer<W> {
    inner: W,
    sha: Sha256,
}

impl<W> Sha256Writer<W> {
    pub(crate) fn new(inner: W) -> Self {
        Self {
            inner,
            sha: Sha256::new(),
        }
    }

    /// Return the canonical digest of the written data and the inner writer.
    pub(crate) fn finish(self) -> (String, W) {
        (format_digest(self.sha), self.inner)
    }
}

impl<W: Write> Write for Sha256Writer<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.sha.update(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// The staging-file side of the chain: hashes (when compressing) and counts
/// the possibly-compressed bytes as they land on disk.
#[derive(Debug)]
struct BlobSink {
    file: File,
    sha: Option<Sha256>,
    count: u64,
}

impl Write for BlobSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.write_all(buf)?;
        if let Some(sha) = self.sha.as_mut() {
            sha.update(buf);
        }
        self.count += buf.len() as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

#[derive(Debug)]
enum CompressSink {
    Plain(BlobSink),
    Gzip(GzEncoder<BlobSink>),
}

impl CompressSink {
    fn finish(self) -> io::Result<BlobSink> {
        match self {
            CompressSink::Plain(sink) => Ok(sink),
            CompressSink::Gzip(enc) => enc.finish(),
        }
    }
}

impl Write for CompressSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            CompressSink::Plain(sink) => sink.write(buf),
            CompressSink::Gzip(enc) => enc.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            CompressSink::Plain(sink) => sink.flush(),
            CompressSink::Gzip(enc) => enc.flush(),
        }
    }
}

/// Digest and size summary of one fully staged blob.
#[derive(Debug, Clone)]
pub(crate) struct FinishedBlob {
    /// Digest of the uncompressed stream (the diff ID).
    pub uncompressed_digest: String,
    /// Digest of the bytes on disk (the blobsum; equals
    /// `uncompressed_digest` when no compression was applied).
    pub digest: String,
    /// Number of bytes on disk.
    pub size: u64,
}

/// One-pass writer producing a staged blob plus both of its digests.
#[derive(Debug)]
pub(crate) struct LayerSink {
    src: Sha256,
    inner: CompressSink,
}

impl LayerSink {
    pub(crate) fn new(file: File, compression: Compression) -> Result<Self> {
        let sink = BlobSink {
            file,
            // Avoid rehashing when we do not compress.
            sha: match compression {
                Compression::Uncompressed => None,
                _ => Some(Sha256::new()),
            },
            count: 0,
        };
        let inner = match compression {
            Compression::Uncompressed => CompressSink::Plain(sink),
            Compression::Gzip => CompressSink::Gzip(GzEncoder::new(sink, flate2::Compression::default())),
            other => return Err(CommitError::UnsupportedCompression(other.name())),
        };
        Ok(Self {
            src: Sha256::new(),
            inner,
        })
    }

    /// Flush everything and return the digests and byte count.
    pub(crate) fn finish(self) -> Result<FinishedBlob> {
        let uncompressed_digest = format_digest(self.src);
        let sink = self.inner.finish()?;
        sink.file.sync_data().ok();
        let digest = match sink.sha {
            Some(sha) => format_digest(sha),
            None => uncompressed_digest.clone(),
        };
        Ok(FinishedBlob {
            uncompressed_digest,
            digest,
            size: sink.count,
        })
    }
}

impl Write for LayerSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.src.update(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn test_digest_bytes() {
        // sha256 of the empty string.
        assert_eq!(
            digest_bytes(b""),
            "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_counting_writer() {
        let mut w = CountingWriter::new(io::sink());
        w.write_all(b"hello").unwrap();
        w.write_all(b" world").unwrap();
        assert_eq!(w.count(), 11);
    }

    #[test]
    fn test_layer_sink_uncompressed_digests_match() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("layer");
        let file = File::create(&path).unwrap();
        let mut sink = LayerSink::new(file, Compression::Uncompressed).unwrap();
        sink.write_all(b"layer data").unwrap();
        let blob = sink.finish().unwrap();
        assert_eq!(blob.digest, blob.uncompressed_digest);
        assert_eq!(blob.size, 10);
        assert_eq!(blob.digest, digest_bytes(b"layer data"));
    }

    #[test]
    fn test_layer_sink_gzip_digests_differ() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("layer");
        let file = File::create(&path).unwrap();
        let mut sink = LayerSink::new(file, Compression::Gzip).unwrap();
        sink.write_all(b"layer data").unwrap();
        let blob = sink.finish().unwrap();
        assert_ne!(blob.digest, blob.uncompressed_digest);
        assert_eq!(blob.uncompressed_digest, digest_bytes(b"layer data"));

        // The blobsum and size describe the bytes on disk.
        let mut staged = Vec::new();
        File::open(&path)
            .unwrap()
            .read_to_end(&mut staged)
            .unwrap();
        assert_eq!(blob.size, staged.len() as u64);
        assert_eq!(blob.digest, digest_bytes(&staged));

        // And the staged bytes decompress back to the input.
        let mut gz = flate2::read::GzDecoder::new(&staged[..]);
        let mut plain = Vec::new();
        gz.read_to_end(&mut plain).unwrap();
        assert_eq!(plain, b"layer data");
    }

    #[test]
    fn test_layer_sink_rejects_undefined_compressors() {
        let dir = tempfile::tempdir().unwrap();
        for compression in [Compression::Bzip2, Compression::Xz, Compression::Zstd] {
            let file = File::create(dir.path().join("layer")).unwrap();
            let err = LayerSink::new(file, compression).unwrap_err();
            assert!(matches!(err, CommitError::UnsupportedCompression(_)));
        }
    }
}
