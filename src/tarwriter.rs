//! Minimal tar emission for synthesized content.
//!
//! The extra-content diff needs tar output with one unusual property: the
//! end-of-archive marker must be omittable, so the stream can be
//! concatenated in front of another archive. High-level builders insist on
//! terminating what they write, so the handful of 512-byte blocks involved
//! are produced here directly.
//!
//! # TAR Format
//!
//! TAR archives consist of:
//! - 512-byte header blocks (ustar format)
//! - File content padded to 512-byte boundaries
//! - End-of-archive marker (1024 zero bytes)

use std::io::{self, Read, Write};

/// Fill `width` bytes of a numeric header field with zero-padded octal
/// digits, least-significant digit last. Values too large for the field
/// lose their high digits; every field written here is wide enough for the
/// values the format allows.
pub(crate) fn write_octal(dest: &mut [u8], value: u64, width: usize) {
    let width = width.min(dest.len());
    let mut rest = value;
    for slot in dest[..width].iter_mut().rev() {
        *slot = b'0' + (rest & 7) as u8;
        rest >>= 3;
    }
}

fn header_block(name: &[u8], size: u64, mode: u32, mtime: u64, typeflag: u8) -> [u8; 512] {
    let mut block = [0u8; 512];

    // Name (100 bytes)
    let name_len = name.len().min(100);
    block[0..name_len].copy_from_slice(&name[0..name_len]);

    // Mode, UID, GID (8 bytes octal each)
    write_octal(&mut block[100..108], mode as u64, 7);
    write_octal(&mut block[108..116], 0, 7);
    write_octal(&mut block[116..124], 0, 7);

    // Size and mtime (12 bytes octal each)
    write_octal(&mut block[124..136], size, 11);
    write_octal(&mut block[136..148], mtime, 11);

    // Checksum placeholder (8 bytes) - spaces while summing
    block[148..156].fill(b' ');

    block[156] = typeflag;

    // Magic ("ustar\0") and version ("00")
    block[257..263].copy_from_slice(b"ustar\0");
    block[263..265].copy_from_slice(b"00");

    let checksum: u32 = block.iter().map(|&b| b as u32).sum();
    write_octal(&mut block[148..154], checksum as u64, 6);
    block[154] = 0;
    block[155] = b' ';

    block
}

/// Write a header for a regular file. Names longer than the ustar field are
/// carried in a GNU long-name entry preceding the real header.
pub(crate) fn write_file_header<W: Write + ?Sized>(
    writer: &mut W,
    name: &str,
    size: u64,
    mode: u32,
    mtime: u64,
) -> io::Result<()> {
    let name_bytes = name.as_bytes();
    if name_bytes.len() > 100 {
        let payload_len = name_bytes.len() as u64 + 1;
        writer.write_all(&header_block(b"././@LongLink", payload_len, 0o644, 0, b'L'))?;
        writer.write_all(name_bytes)?;
        writer.write_all(&[0])?;
        write_padding(writer, payload_len)?;
    }
    writer.write_all(&header_block(name_bytes, size, mode, mtime, b'0'))
}

/// Copy `size` bytes of file content and pad to a 512-byte boundary.
pub(crate) fn write_file_data<W: Write + ?Sized>(
    writer: &mut W,
    reader: &mut dyn Read,
    size: u64,
) -> io::Result<()> {
    let copied = io::copy(&mut reader.take(size), writer)?;
    if copied != size {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "unexpected EOF while reading file data",
        ));
    }
    write_padding(writer, size)
}

fn write_padding<W: Write>(writer: &mut W, size: u64) -> io::Result<()> {
    let padding = (512 - (size % 512)) % 512;
    if padding > 0 {
        let pad = [0u8; 512];
        writer.write_all(&pad[..padding as usize])?;
    }
    Ok(())
}

/// Write the tar end-of-archive marker (two 512-byte zero blocks).
pub(crate) fn write_tar_footer<W: Write>(writer: &mut W) -> io::Result<()> {
    let block = [0u8; 1024];
    writer.write_all(&block)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_octal() {
        let mut buf = [0u8; 8];
        write_octal(&mut buf, 0o755, 7);
        assert_eq!(&buf[..7], b"0000755");

        write_octal(&mut buf, 0o644, 7);
        assert_eq!(&buf[..7], b"0000644");
    }

    #[test]
    fn test_round_trips_through_tar_reader() {
        let mut out = Vec::new();
        write_file_header(&mut out, "/foo", 3, 0o644, 1700000000).unwrap();
        write_file_data(&mut out, &mut &b"abc"[..], 3).unwrap();
        write_tar_footer(&mut out).unwrap();

        let mut archive = tar::Archive::new(&out[..]);
        let mut entries = archive.entries().unwrap();
        let mut entry = entries.next().unwrap().unwrap();
        assert_eq!(entry.path().unwrap().to_string_lossy(), "foo");
        assert_eq!(entry.header().mode().unwrap(), 0o644);
        assert_eq!(entry.header().mtime().unwrap(), 1700000000);
        let mut content = String::new();
        entry.read_to_string(&mut content).unwrap();
        assert_eq!(content, "abc");
        assert!(entries.next().is_none());
    }

    #[test]
    fn test_long_names_use_gnu_extension() {
        let name = format!("/{}", "d/".repeat(70));
        let mut out = Vec::new();
        write_file_header(&mut out, &name, 0, 0o644, 0).unwrap();
        write_tar_footer(&mut out).unwrap();

        let mut archive = tar::Archive::new(&out[..]);
        let entry = archive.entries().unwrap().next().unwrap().unwrap();
        assert_eq!(
            entry.path().unwrap().to_string_lossy(),
            name.trim_start_matches('/')
        );
    }

    #[test]
    fn test_short_write_is_an_error() {
        let mut out = Vec::new();
        write_file_header(&mut out, "f", 10, 0o644, 0).unwrap();
        let err = write_file_data(&mut out, &mut &b"abc"[..], 10).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }
}
