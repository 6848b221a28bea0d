//! Filesystem-to-tar streaming.
//!
//! The squash and rootfs-extraction paths need a container's mounted
//! filesystem rendered as a single tar stream. That job sits behind the
//! [`RootfsCopier`] seam; the default implementation, [`TarCopier`], walks
//! the tree through capability-scoped [`cap_std::fs::Dir`] handles so that
//! nothing outside the mount point can ever be read, and emits entries in
//! sorted order so the stream is deterministic.
//!
//! The same walker archives caller-supplied linked-layer directories via
//! [`tar_directory`].

use std::io::{self, Write};
use std::path::{Path, PathBuf};

use cap_std::fs::{Dir, MetadataExt};

use crate::error::{CommitError, Result};

/// One range of a user-namespace ID mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdMapping {
    /// Container ID start.
    pub container_id: u32,
    /// Host ID start.
    pub host_id: u32,
    /// Size of the mapping range.
    pub size: u32,
}

/// UID/GID mappings describing how a container's IDs appear on the host.
#[derive(Debug, Clone, Default)]
pub struct IdMappingOptions {
    pub uid_map: Vec<IdMapping>,
    pub gid_map: Vec<IdMapping>,
}

/// Options for streaming a filesystem subtree as tar.
#[derive(Debug, Clone, Default)]
pub struct CopierOptions {
    /// Map host UIDs back into the container's ID space.
    pub uid_map: Vec<IdMapping>,
    /// Map host GIDs back into the container's ID space.
    pub gid_map: Vec<IdMapping>,
    /// Strip the setuid bit off of items being archived.
    pub strip_setuid_bit: bool,
    /// Strip the setgid bit off of items being archived.
    pub strip_setgid_bit: bool,
    /// Don't record extended attributes of items being archived.
    pub strip_xattrs: bool,
}

/// Streams a filesystem subtree as an uncompressed tar archive.
pub trait RootfsCopier: Send + Sync {
    /// Archive the tree rooted at `root` into `out`, including the
    /// end-of-archive footer.
    fn copy(&self, root: &Path, options: &CopierOptions, out: &mut dyn Write) -> Result<()>;
}

/// Map a host ID back to its container ID. IDs outside every range are left
/// unchanged.
fn map_id(id: u32, mapping: &[IdMapping]) -> u32 {
    for m in mapping {
        if id >= m.host_id && (id - m.host_id) < m.size {
            return m.container_id + (id - m.host_id);
        }
    }
    id
}

/// The default copier: a sorted, capability-confined tree walk.
#[derive(Debug, Default)]
pub struct TarCopier;

impl RootfsCopier for TarCopier {
    fn copy(&self, root: &Path, options: &CopierOptions, out: &mut dyn Write) -> Result<()> {
        let dir = Dir::open_ambient_dir(root, cap_std::ambient_authority())
            .map_err(|e| CommitError::Archive(format!("opening {}: {}", root.display(), e)))?;
        let mut builder = tar::Builder::new(out);
        append_tree(&mut builder, &dir, Path::new(""), options)?;
        builder.finish()?;
        Ok(())
    }
}

fn entry_header(meta: &cap_std::fs::Metadata, options: &CopierOptions) -> tar::Header {
    let mut header = tar::Header::new_ustar();
    let mut mode = meta.mode() & 0o7777;
    if options.strip_setuid_bit {
        mode &= !0o4000;
    }
    if options.strip_setgid_bit {
        mode &= !0o2000;
    }
    header.set_mode(mode);
    header.set_uid(map_id(meta.uid(), &options.uid_map) as u64);
    header.set_gid(map_id(meta.gid(), &options.gid_map) as u64);
    header.set_mtime(meta.mtime().max(0) as u64);
    header
}

fn append_tree<W: Write>(
    builder: &mut tar::Builder<W>,
    dir: &Dir,
    prefix: &Path,
    options: &CopierOptions,
) -> Result<()> {
    let mut entries = dir
        .entries()?
        .collect::<io::Result<Vec<cap_std::fs::DirEntry>>>()?;
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let name = entry.file_name();
        let rel = prefix.join(&name);
        let meta = entry.metadata()?;
        let file_type = meta.file_type();

        if file_type.is_dir() {
            let mut header = entry_header(&meta, options);
            header.set_entry_type(tar::EntryType::Directory);
            header.set_size(0);
            builder.append_data(&mut header, &rel, io::empty())?;
            append_tree(builder, &dir.open_dir(&name)?, &rel, options)?;
        } else if file_type.is_symlink() {
            let target: PathBuf = dir.read_link(&name)?;
            let mut header = entry_header(&meta, options);
            header.set_entry_type(tar::EntryType::Symlink);
            header.set_size(0);
            builder.append_link(&mut header, &rel, &target)?;
        } else if file_type.is_file() {
            let mut header = entry_header(&meta, options);
            header.set_entry_type(tar::EntryType::Regular);
            header.set_size(meta.len());
            let file = dir.open(&name)?.into_std();
            builder.append_data(&mut header, &rel, file)?;
        } else {
            tracing::debug!("skipping special file {:?}", rel);
        }
    }
    Ok(())
}

/// Archive the directory at `path` as an uncompressed tar stream, footer
/// included.
pub(crate) fn tar_directory(path: &Path, out: &mut dyn Write) -> Result<()> {
    TarCopier.copy(path, &CopierOptions::default(), out)
}
