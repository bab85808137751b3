//! Little-endian wire helpers and the checksummed file frame shared by data
//! points and stored registries.
//!
//! ```text
//! frame header (64 bytes)
//!   magic [u8;4] | format_version u16 | flags u16 | registry_version u64
//!   generation_ts_ms i64 | body_len u64 | sha256(header[..32] ++ body) [u8;32]
//! body (body_len bytes)
//! ```
//!
//! The checksum covers every header field before it, so a flipped registry
//! version or timestamp is caught like a flipped body byte.
//!
//! Bytes after `body_len` are ignored.

use crate::result::{CoverageError, CoverageResult};
use sha2::{Digest, Sha256};
use std::ops::RangeInclusive;

/// Fixed header length in bytes
pub const HEADER_LEN: usize = 64;

const CHECKSUM_LEN: usize = 32;

/// Header bytes covered by the checksum (magic through `body_len`)
const CHECKED_LEN: usize = HEADER_LEN - CHECKSUM_LEN;

/// Decoded frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Four-byte file type tag
    pub magic: [u8; 4],
    /// Body layout version
    pub format_version: u16,
    /// Reserved, written as zero
    pub flags: u16,
    /// Registry version the body refers to
    pub registry_version: u64,
    /// Creation time, ms since the epoch
    pub generation_ts_ms: i64,
}

/// Append-only little-endian encoder
#[derive(Debug, Default)]
pub(crate) struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    pub(crate) fn with_capacity(bytes: usize) -> Self {
        Self {
            buf: Vec::with_capacity(bytes),
        }
    }

    pub(crate) fn u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub(crate) fn u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub(crate) fn u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub(crate) fn u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub(crate) fn i64(&mut self, v: i64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub(crate) fn bytes(&mut self, v: &[u8]) {
        self.buf.extend_from_slice(v);
    }

    /// Length-prefixed UTF-8
    pub(crate) fn str(&mut self, v: &str) {
        self.u32(len_u32(v.len()));
        self.bytes(v.as_bytes());
    }

    pub(crate) fn len(&self) -> usize {
        self.buf.len()
    }

    /// Overwrite a previously written `u32` at `at`
    pub(crate) fn patch_u32(&mut self, at: usize, v: u32) {
        self.buf[at..at + 4].copy_from_slice(&v.to_le_bytes());
    }

    pub(crate) fn into_inner(self) -> Vec<u8> {
        self.buf
    }
}

/// Bounds-checked little-endian decoder over a borrowed buffer
#[derive(Debug)]
pub(crate) struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
    source: &'a str,
}

impl<'a> Reader<'a> {
    pub(crate) fn new(data: &'a [u8], source: &'a str) -> Self {
        Self {
            data,
            pos: 0,
            source,
        }
    }

    #[inline]
    fn ensure_len(&self, need: usize, ctx: &str) -> CoverageResult<()> {
        if self.remaining() < need {
            return Err(CoverageError::corrupted(
                self.source,
                format!(
                    "truncated at {ctx} (need {need} bytes at offset {}, have {})",
                    self.pos,
                    self.data.len()
                ),
            ));
        }
        Ok(())
    }

    pub(crate) fn take(&mut self, n: usize, ctx: &str) -> CoverageResult<&'a [u8]> {
        self.ensure_len(n, ctx)?;
        let out = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn array<const N: usize>(&mut self, ctx: &str) -> CoverageResult<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N, ctx)?);
        Ok(out)
    }

    pub(crate) fn u8(&mut self, ctx: &str) -> CoverageResult<u8> {
        Ok(self.array::<1>(ctx)?[0])
    }

    pub(crate) fn u16(&mut self, ctx: &str) -> CoverageResult<u16> {
        self.array(ctx).map(u16::from_le_bytes)
    }

    pub(crate) fn u32(&mut self, ctx: &str) -> CoverageResult<u32> {
        self.array(ctx).map(u32::from_le_bytes)
    }

    pub(crate) fn u64(&mut self, ctx: &str) -> CoverageResult<u64> {
        self.array(ctx).map(u64::from_le_bytes)
    }

    pub(crate) fn i64(&mut self, ctx: &str) -> CoverageResult<i64> {
        self.array(ctx).map(i64::from_le_bytes)
    }

    pub(crate) fn str(&mut self, ctx: &str) -> CoverageResult<String> {
        let len = self.u32(ctx)? as usize;
        let raw = self.take(len, ctx)?;
        std::str::from_utf8(raw)
            .map(str::to_string)
            .map_err(|e| CoverageError::corrupted(self.source, format!("invalid UTF-8 in {ctx}: {e}")))
    }

    pub(crate) fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub(crate) fn source(&self) -> &'a str {
        self.source
    }
}

/// Wrap `body` in a checksummed frame
#[must_use]
pub(crate) fn seal(header: &FrameHeader, body: &[u8]) -> Vec<u8> {
    let mut w = Writer::with_capacity(HEADER_LEN + body.len());
    w.bytes(&header.magic);
    w.u16(header.format_version);
    w.u16(header.flags);
    w.u64(header.registry_version);
    w.i64(header.generation_ts_ms);
    w.u64(body.len() as u64);
    let mut framed = w.into_inner();
    let digest = checksum(&framed, body);
    framed.extend_from_slice(&digest);
    framed.extend_from_slice(body);
    framed
}

fn checksum(checked_header: &[u8], body: &[u8]) -> [u8; CHECKSUM_LEN] {
    let digest = Sha256::new()
        .chain_update(checked_header)
        .chain_update(body)
        .finalize();
    let mut out = [0u8; CHECKSUM_LEN];
    out.copy_from_slice(&digest);
    out
}

/// Validate a frame and return its header and body
///
/// # Errors
///
/// `UnsupportedFormat` if the format version is outside `supported`;
/// otherwise `corrupt` builds the error for a bad magic, short input or
/// checksum mismatch.
pub(crate) fn open<'a>(
    data: &'a [u8],
    source: &str,
    magic: [u8; 4],
    supported: RangeInclusive<u16>,
    corrupt: fn(&str, String) -> CoverageError,
) -> CoverageResult<(FrameHeader, &'a [u8])> {
    if data.len() < HEADER_LEN {
        return Err(corrupt(
            source,
            format!("header truncated ({} of {HEADER_LEN} bytes)", data.len()),
        ));
    }
    let mut r = Reader::new(data, source);
    let found: [u8; 4] = r.array("magic")?;
    if found != magic {
        return Err(corrupt(source, format!("bad magic {found:02x?}")));
    }
    let format_version = r.u16("format version")?;
    if !supported.contains(&format_version) {
        return Err(CoverageError::UnsupportedFormat {
            source_name: source.to_string(),
            found: format_version,
            min_supported: *supported.start(),
            max_supported: *supported.end(),
        });
    }
    let flags = r.u16("flags")?;
    let registry_version = r.u64("registry version")?;
    let generation_ts_ms = r.i64("generation timestamp")?;
    let body_len = r.u64("body length")?;
    let expected: [u8; CHECKSUM_LEN] = r.array("checksum")?;

    let body_len = usize::try_from(body_len)
        .ok()
        .filter(|len| *len <= r.remaining())
        .ok_or_else(|| {
            corrupt(
                source,
                format!("body length {body_len} exceeds {} available bytes", r.remaining()),
            )
        })?;
    let body = &data[HEADER_LEN..HEADER_LEN + body_len];
    if checksum(&data[..CHECKED_LEN], body) != expected {
        return Err(corrupt(source, "checksum mismatch".to_string()));
    }
    Ok((
        FrameHeader {
            magic,
            format_version,
            flags,
            registry_version,
            generation_ts_ms,
        },
        body,
    ))
}

pub(crate) fn len_u32(len: usize) -> u32 {
    u32::try_from(len).unwrap_or(u32::MAX)
}
