//! In-stream tar header rewriting.
//!
//! Layers are rewritten while they stream through the materializer: local
//! user and group names are scrubbed, and when the commit carries a fixed
//! timestamp, non-zero time fields are pinned to it. The rewrite operates on
//! raw 512-byte header blocks and never changes the length of the stream:
//! zero-valued time fields are left zero, because promoting them to a real
//! timestamp can change how a header is framed and therefore every digest
//! downstream.
//!
//! Payload bytes, extension entries (PAX, GNU long names), and end-of-archive
//! markers pass through untouched. Input that does not parse as tar is passed
//! through verbatim from the first unrecognizable block.

use std::io::{self, Write};

use crate::tarwriter::write_octal;

const BLOCK_SIZE: usize = 512;

/// Offsets into a ustar header block.
const SIZE_FIELD: std::ops::Range<usize> = 124..136;
const MTIME_FIELD: std::ops::Range<usize> = 136..148;
const CHECKSUM_FIELD: std::ops::Range<usize> = 148..156;
const TYPEFLAG: usize = 156;
const MAGIC_FIELD: std::ops::Range<usize> = 257..263;
const UNAME_FIELD: std::ops::Range<usize> = 265..297;
const GNAME_FIELD: std::ops::Range<usize> = 297..329;
/// Old-GNU headers keep access and change times where POSIX keeps the
/// path prefix.
const GNU_ATIME_FIELD: std::ops::Range<usize> = 345..357;
const GNU_CTIME_FIELD: std::ops::Range<usize> = 357..369;

#[derive(Clone, Copy)]
enum State {
    /// Accumulating the next 512-byte header block.
    Header,
    /// Forwarding payload bytes (content plus padding).
    Payload(u64),
    /// The stream stopped looking like tar; forward everything.
    Raw,
}

/// A writer that rewrites tar headers on the way through to `inner`.
pub(crate) struct TarFilter<W: Write> {
    inner: W,
    mtime_override: Option<u64>,
    state: State,
    block: Box<[u8; BLOCK_SIZE]>,
    filled: usize,
}

impl<W: Write> TarFilter<W> {
    /// Wrap `inner`. When `mtime_override` is set, non-zero time fields in
    /// each header are rewritten to that many seconds since the epoch.
    pub(crate) fn new(inner: W, mtime_override: Option<u64>) -> Self {
        Self {
            inner,
            mtime_override,
            state: State::Header,
            block: Box::new([0; BLOCK_SIZE]),
            filled: 0,
        }
    }

    /// Flush any partial trailing block and return the inner writer.
    pub(crate) fn finish(mut self) -> io::Result<W> {
        if self.filled > 0 {
            let filled = self.filled;
            self.inner.write_all(&self.block[..filled])?;
            self.filled = 0;
        }
        Ok(self.inner)
    }

    fn process_header_block(&mut self) -> io::Result<()> {
        if self.block.iter().all(|&b| b == 0) {
            // End-of-archive marker (or half of one); emit unchanged.
            self.inner.write_all(&self.block[..])?;
            return Ok(());
        }
        if !checksum_valid(&self.block[..]) {
            // Not a tar header. Stop filtering and pass the rest through.
            self.state = State::Raw;
            self.inner.write_all(&self.block[..])?;
            return Ok(());
        }

        let is_ustar = &self.block[MAGIC_FIELD.start..MAGIC_FIELD.start + 5] == b"ustar";
        let is_gnu = &self.block[MAGIC_FIELD] == b"ustar ";
        let mut changed = false;
        if is_ustar {
            // Scrub any local user names that might correspond to UIDs or
            // GIDs of files in this layer.
            for field in [UNAME_FIELD, GNAME_FIELD] {
                if self.block[field.clone()].iter().any(|&b| b != 0) {
                    self.block[field].fill(0);
                    changed = true;
                }
            }
        }
        if let Some(mtime) = self.mtime_override {
            changed |= rewrite_nonzero_time(&mut self.block[MTIME_FIELD], mtime);
            if is_gnu {
                changed |= rewrite_nonzero_time(&mut self.block[GNU_ATIME_FIELD], mtime);
                changed |= rewrite_nonzero_time(&mut self.block[GNU_CTIME_FIELD], mtime);
            }
        }
        // An untouched header passes through byte-for-byte.
        if changed {
            update_checksum(&mut self.block[..]);
        }

        let payload = payload_length(&self.block[..]);
        if payload > 0 {
            self.state = State::Payload(payload);
        }
        self.inner.write_all(&self.block[..])?;
        Ok(())
    }
}

impl<W: Write> Write for TarFilter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.state {
            State::Raw => self.inner.write(buf),
            State::Payload(remaining) => {
                let n = buf.len().min(remaining as usize);
                self.inner.write_all(&buf[..n])?;
                let remaining = remaining - n as u64;
                self.state = if remaining == 0 {
                    State::Header
                } else {
                    State::Payload(remaining)
                };
                Ok(n)
            }
            State::Header => {
                let n = buf.len().min(BLOCK_SIZE - self.filled);
                self.block[self.filled..self.filled + n].copy_from_slice(&buf[..n]);
                self.filled += n;
                if self.filled == BLOCK_SIZE {
                    self.filled = 0;
                    self.process_header_block()?;
                }
                Ok(n)
            }
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Parse a numeric header field: octal, or base-256 when the high bit of the
/// first byte is set.
fn parse_numeric(field: &[u8]) -> Option<u64> {
    if field.first().is_some_and(|b| b & 0x80 != 0) {
        let mut value: u64 = (field[0] & 0x7f) as u64;
        for &b in &field[1..] {
            value = value.checked_shl(8)? | b as u64;
        }
        return Some(value);
    }
    let mut value: u64 = 0;
    let mut seen = false;
    for &b in field {
        match b {
            b'0'..=b'7' => {
                value = value.checked_mul(8)?.checked_add((b - b'0') as u64)?;
                seen = true;
            }
            b' ' | 0 => {
                if seen {
                    break;
                }
            }
            _ => return None,
        }
    }
    Some(value)
}

/// Rewrite a 12-byte time field to `mtime`, but only if it currently holds a
/// non-zero value in a representation we understand. Returns whether the
/// field was rewritten.
fn rewrite_nonzero_time(field: &mut [u8], mtime: u64) -> bool {
    match parse_numeric(field) {
        Some(0) | None => false,
        Some(_) => {
            write_octal(field, mtime, 11);
            true
        }
    }
}

fn header_checksum(block: &[u8]) -> u32 {
    block
        .iter()
        .enumerate()
        .map(|(i, &b)| {
            if CHECKSUM_FIELD.contains(&i) {
                b' ' as u32
            } else {
                b as u32
            }
        })
        .sum()
}

fn checksum_valid(block: &[u8]) -> bool {
    match parse_numeric(&block[CHECKSUM_FIELD]) {
        Some(stored) => stored == header_checksum(block) as u64,
        None => false,
    }
}

fn update_checksum(block: &mut [u8]) {
    let checksum = header_checksum(block);
    block[CHECKSUM_FIELD].fill(b' ');
    write_octal(&mut block[CHECKSUM_FIELD.start..CHECKSUM_FIELD.start + 6], checksum as u64, 6);
    block[CHECKSUM_FIELD.start + 6] = 0;
    block[CHECKSUM_FIELD.start + 7] = b' ';
}

/// Number of payload bytes (content rounded up to whole blocks) following a
/// header. Entry types that never carry data contribute nothing even if
/// their size field is non-zero.
fn payload_length(block: &[u8]) -> u64 {
    match block[TYPEFLAG] {
        b'1' | b'2' | b'3' | b'4' | b'5' | b'6' => 0,
        _ => {
            let size = parse_numeric(&block[SIZE_FIELD]).unwrap_or(0);
            size.div_ceil(512) * 512
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    fn sample_tar(mtime: u64, username: Option<&str>) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_ustar();
        header.set_mode(0o644);
        header.set_size(6);
        header.set_mtime(mtime);
        header.set_entry_type(tar::EntryType::Regular);
        if let Some(name) = username {
            header.set_username(name).unwrap();
        }
        header.set_cksum();
        builder
            .append_data(&mut header, "etc/hosts", &b"hello\n"[..])
            .unwrap();
        builder.into_inner().unwrap()
    }

    fn filter(data: &[u8], mtime_override: Option<u64>) -> Vec<u8> {
        let mut f = TarFilter::new(Vec::new(), mtime_override);
        f.write_all(data).unwrap();
        f.finish().unwrap()
    }

    #[test]
    fn test_clears_user_and_group_names() {
        let data = sample_tar(1234, Some("bob"));
        let out = filter(&data, None);
        assert_eq!(out.len(), data.len());

        let mut archive = tar::Archive::new(&out[..]);
        let entry = archive.entries().unwrap().next().unwrap().unwrap();
        assert_eq!(entry.header().username().unwrap(), Some(""));
        assert_eq!(entry.header().groupname().unwrap(), Some(""));
        assert_eq!(entry.header().mtime().unwrap(), 1234);
    }

    #[test]
    fn test_rewrites_nonzero_mtime_only() {
        let data = sample_tar(1234, None);
        let out = filter(&data, Some(42));
        assert_eq!(out.len(), data.len());
        let mut archive = tar::Archive::new(&out[..]);
        let mut entry = archive.entries().unwrap().next().unwrap().unwrap();
        assert_eq!(entry.header().mtime().unwrap(), 42);
        let mut content = String::new();
        entry.read_to_string(&mut content).unwrap();
        assert_eq!(content, "hello\n");

        // A zero mtime stays zero so the header framing cannot change.
        let data = sample_tar(0, None);
        let out = filter(&data, Some(42));
        let mut archive = tar::Archive::new(&out[..]);
        let entry = archive.entries().unwrap().next().unwrap().unwrap();
        assert_eq!(entry.header().mtime().unwrap(), 0);
    }

    #[test]
    fn test_payload_bytes_unmodified() {
        // Payload that happens to look header-ish must not be touched.
        let mut builder = tar::Builder::new(Vec::new());
        let payload = vec![0x55u8; 1500];
        let mut header = tar::Header::new_ustar();
        header.set_mode(0o600);
        header.set_size(payload.len() as u64);
        header.set_mtime(7);
        header.set_entry_type(tar::EntryType::Regular);
        header.set_cksum();
        builder
            .append_data(&mut header, "blob.bin", &payload[..])
            .unwrap();
        let data = builder.into_inner().unwrap();

        let out = filter(&data, Some(42));
        let mut archive = tar::Archive::new(&out[..]);
        let mut entry = archive.entries().unwrap().next().unwrap().unwrap();
        let mut content = Vec::new();
        entry.read_to_end(&mut content).unwrap();
        assert_eq!(content, payload);
    }

    #[test]
    fn test_untouched_archive_is_byte_identical() {
        // No names to scrub and no override: nothing may change, not even
        // checksum formatting.
        let data = sample_tar(1234, None);
        assert_eq!(filter(&data, None), data);
    }

    #[test]
    fn test_non_tar_input_passes_through() {
        let data: Vec<u8> = (0..2000u32).map(|i| (i % 251) as u8).collect();
        let out = filter(&data, Some(42));
        assert_eq!(out, data);
    }

    #[test]
    fn test_parse_numeric_octal_and_binary() {
        assert_eq!(parse_numeric(b"0000755\0"), Some(0o755));
        assert_eq!(parse_numeric(b"        "), Some(0));
        let mut binary = [0u8; 12];
        binary[0] = 0x80;
        binary[11] = 42;
        assert_eq!(parse_numeric(&binary), Some(42));
    }
}
