//! Coverage Data Point
//!
//! An immutable capture of one execution: the counter snapshot plus every
//! closed per-test entry, tagged with the registry version it was recorded
//! against and its generation time.
//!
//! ```text
//! body:
//!   slot_count u32 | counters [u64; slot_count]
//!   entry_count u32 | entry*
//! entry:
//!   record_len u32 | test_id str | class_name str | method_name str
//!   iteration u32 | outcome u8 | start_ms i64 | duration_us u64
//!   touched_count u32 | touched [u32] | has_message u8 [| message str]
//!   (any further bytes up to record_len are skipped)
//! ```

use super::codec::{self, len_u32, FrameHeader, Reader, Writer};
use super::{CounterSnapshot, Outcome, SlotIndex, SlotSet, TestEntry, TestId, TestName};
use crate::result::{CoverageError, CoverageResult};
use std::fs;
use std::ops::RangeInclusive;
use std::path::Path;
use tracing::debug;

/// File type tag
pub const DATA_POINT_MAGIC: [u8; 4] = *b"SCDP";

/// Format version written by this build
pub const FORMAT_VERSION: u16 = 1;

/// Format versions this build can read
pub const SUPPORTED_VERSIONS: RangeInclusive<u16> = 1..=1;

/// File extension for data points
pub const DATA_POINT_EXTENSION: &str = "scdp";

/// Persisted coverage of one execution
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataPoint {
    /// Registry version the slots refer to
    pub registry_version: u64,
    /// Creation time, ms since the epoch
    pub generation_ts_ms: i64,
    /// Counter values by slot
    pub counters: CounterSnapshot,
    /// Closed per-test entries
    pub tests: Vec<TestEntry>,
}

impl DataPoint {
    /// Capture a snapshot and test entries, stamped with the current time
    #[must_use]
    pub fn write(counters: CounterSnapshot, tests: Vec<TestEntry>, registry_version: u64) -> Self {
        Self {
            registry_version,
            generation_ts_ms: chrono::Utc::now().timestamp_millis(),
            counters,
            tests,
        }
    }

    /// Unique file name for a data point of `project`
    #[must_use]
    pub fn file_name(project: &str) -> String {
        format!("{project}-{}.{DATA_POINT_EXTENSION}", uuid::Uuid::new_v4())
    }

    /// Serialize to the framed binary form
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let counters = self.counters.as_slice();
        let mut w = Writer::with_capacity(8 + counters.len() * 8 + self.tests.len() * 64);
        w.u32(len_u32(counters.len()));
        for &value in counters {
            w.u64(value);
        }
        w.u32(len_u32(self.tests.len()));
        for entry in &self.tests {
            encode_entry(&mut w, entry);
        }
        codec::seal(
            &FrameHeader {
                magic: DATA_POINT_MAGIC,
                format_version: FORMAT_VERSION,
                flags: 0,
                registry_version: self.registry_version,
                generation_ts_ms: self.generation_ts_ms,
            },
            &w.into_inner(),
        )
    }

    /// Parse and validate a framed data point
    ///
    /// `source` names the input in errors.
    ///
    /// # Errors
    ///
    /// `UnsupportedFormat` for a format version outside
    /// [`SUPPORTED_VERSIONS`], `CorruptedDataPoint` for anything else that
    /// does not validate.
    pub fn decode(data: &[u8], source: &str) -> CoverageResult<Self> {
        let (header, body) = codec::open(
            data,
            source,
            DATA_POINT_MAGIC,
            SUPPORTED_VERSIONS,
            |s, r| CoverageError::corrupted(s, r),
        )?;
        let mut r = Reader::new(body, source);

        let slot_count = r.u32("slot count")? as usize;
        if slot_count.saturating_mul(8) > r.remaining() {
            return Err(CoverageError::corrupted(
                source,
                format!("counter section claims {slot_count} slots beyond body end"),
            ));
        }
        let mut counters = Vec::with_capacity(slot_count);
        for _ in 0..slot_count {
            counters.push(r.u64("counter")?);
        }

        let entry_count = r.u32("entry count")? as usize;
        let mut tests = Vec::with_capacity(entry_count.min(r.remaining() / 4));
        for _ in 0..entry_count {
            let record_len = r.u32("record length")? as usize;
            let record = r.take(record_len, "test record")?;
            tests.push(decode_entry(&mut Reader::new(record, source))?);
        }

        Ok(Self {
            registry_version: header.registry_version,
            generation_ts_ms: header.generation_ts_ms,
            counters: CounterSnapshot::from_vec(counters),
            tests,
        })
    }

    /// Write atomically: a sibling temp file is renamed over `path`
    ///
    /// # Errors
    ///
    /// Any I/O failure.
    pub fn write_to_path(&self, path: &Path) -> CoverageResult<()> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        let tmp = path.with_extension(format!("{DATA_POINT_EXTENSION}.{}.tmp", uuid::Uuid::new_v4()));
        fs::write(&tmp, self.encode())?;
        fs::rename(&tmp, path)?;
        debug!(path = %path.display(), slots = self.counters.len(), tests = self.tests.len(),
            "data point written");
        Ok(())
    }

    /// Read and decode a data point file
    ///
    /// # Errors
    ///
    /// I/O failure or any [`DataPoint::decode`] error.
    pub fn read_from_path(path: &Path) -> CoverageResult<Self> {
        let bytes = fs::read(path)?;
        Self::decode(&bytes, &path.display().to_string())
    }
}

fn encode_entry(w: &mut Writer, entry: &TestEntry) {
    let len_at = w.len();
    w.u32(0);
    let start = w.len();
    w.str(&entry.id.to_string());
    w.str(&entry.id.name.class_name);
    w.str(&entry.id.name.method_name);
    w.u32(entry.id.iteration);
    w.u8(entry.outcome.as_u8());
    w.i64(entry.start_ms);
    w.u64(entry.duration_us);
    w.u32(len_u32(entry.touched.len()));
    for slot in entry.touched.iter() {
        w.u32(slot.as_u32());
    }
    match &entry.failure_message {
        Some(message) => {
            w.u8(1);
            w.str(message);
        }
        None => w.u8(0),
    }
    let record_len = len_u32(w.len() - start);
    w.patch_u32(len_at, record_len);
}

fn decode_entry(r: &mut Reader<'_>) -> CoverageResult<TestEntry> {
    let _display_id = r.str("test id")?;
    let class_name = r.str("class name")?;
    let method_name = r.str("method name")?;
    let iteration = r.u32("iteration")?;
    let tag = r.u8("outcome")?;
    let outcome = Outcome::from_u8(tag)
        .ok_or_else(|| CoverageError::corrupted(r.source(), format!("unknown outcome tag {tag}")))?;
    let start_ms = r.i64("start time")?;
    let duration_us = r.u64("duration")?;
    let touched_count = r.u32("touched count")? as usize;
    if touched_count.saturating_mul(4) > r.remaining() {
        return Err(CoverageError::corrupted(
            r.source(),
            format!("touched set claims {touched_count} slots beyond record end"),
        ));
    }
    let mut touched = SlotSet::new();
    for _ in 0..touched_count {
        let _ = touched.insert(SlotIndex::new(r.u32("touched slot")?));
    }
    let failure_message = match r.u8("message flag")? {
        0 => None,
        _ => Some(r.str("failure message")?),
    };
    Ok(TestEntry {
        id: TestId::new(
            TestName {
                class_name,
                method_name,
            },
            iteration,
        ),
        start_ms,
        duration_us,
        outcome,
        failure_message,
        touched,
    })
}
