//! On-disk history file (Full backend).
//!
//! Layout:
//!
//! ```text
//! [header: 64 bytes]
//! [record]*      quark u32 | start i64 | end i64 | tag u8 | payload | crc32
//! [footer]       MessagePack: attribute tree, per-quark index, extra blob
//! ```
//!
//! The header is rewritten once the footer is in place, so a file whose
//! status byte still says "building" was never completed.

use super::{IntervalTail, StateBackend};
use crate::attributes::AttributeTree;
use crate::error::{Result, StateError};
use crate::types::{BackendType, Interval, Quark, StateValue, Timestamp};
use fs2::FileExt;
use lru::LruCache;
use memmap2::Mmap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, Read, Seek, SeekFrom, Write};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use tracing::{debug, warn};

/// Default extension of history files.
pub const HISTORY_FILE_EXTENSION: &str = "ht";

/// Magic bytes for history files.
const FILE_MAGIC: &[u8; 4] = b"SHT\0";

/// Current file format version.
const FORMAT_VERSION: u8 = 2;

const HEADER_SIZE: usize = 64;

const STATUS_BUILDING: u8 = 0;
const STATUS_COMPLETE: u8 = 1;

/// Backend that wrote the file. Full and partial files share a layout but a
/// partial file only holds the intervals crossing a checkpoint.
const KIND_FULL: u8 = 0;
const KIND_PARTIAL: u8 = 1;

fn kind_byte(kind: BackendType) -> Result<u8> {
    match kind {
        BackendType::Full => Ok(KIND_FULL),
        BackendType::Partial => Ok(KIND_PARTIAL),
        other => Err(StateError::InvalidOperation(format!(
            "{} histories are not stored in files",
            other
        ))),
    }
}

fn kind_name(byte: u8) -> &'static str {
    match byte {
        KIND_FULL => "FULL",
        KIND_PARTIAL => "PARTIAL",
        _ => "unknown",
    }
}

/// Fixed part of a record: quark + start + end + tag.
const RECORD_FIXED_SIZE: usize = 4 + 8 + 8 + 1;

const TAG_NULL: u8 = 0;
const TAG_INT: u8 = 1;
const TAG_LONG: u8 = 2;
const TAG_DOUBLE: u8 = 3;
const TAG_STRING: u8 = 4;

/// Location of one record.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
struct IndexEntry {
    start: Timestamp,
    end: Timestamp,
    offset: u64,
}

#[derive(Serialize, Deserialize)]
struct Footer {
    attribute_tree: Vec<u8>,
    index: Vec<Vec<IndexEntry>>,
    extra: Vec<u8>,
}

#[derive(Debug)]
struct Header {
    status: u8,
    kind: u8,
    provider_version: u32,
    start: Timestamp,
    end: Timestamp,
    footer_offset: u64,
    footer_len: u64,
    footer_crc: u32,
}

impl Header {
    fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..4].copy_from_slice(FILE_MAGIC);
        buf[4] = FORMAT_VERSION;
        buf[5] = self.status;
        buf[6] = self.kind;
        buf[8..12].copy_from_slice(&self.provider_version.to_le_bytes());
        buf[16..24].copy_from_slice(&self.start.to_le_bytes());
        buf[24..32].copy_from_slice(&self.end.to_le_bytes());
        buf[32..40].copy_from_slice(&self.footer_offset.to_le_bytes());
        buf[40..48].copy_from_slice(&self.footer_len.to_le_bytes());
        buf[48..52].copy_from_slice(&self.footer_crc.to_le_bytes());
        buf
    }

    fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_SIZE {
            return Err(StateError::InvalidFormat("truncated header".into()));
        }
        if &buf[0..4] != FILE_MAGIC {
            return Err(StateError::InvalidFormat("invalid history file magic".into()));
        }
        if buf[4] != FORMAT_VERSION {
            return Err(StateError::InvalidFormat(format!(
                "unsupported format version: {}",
                buf[4]
            )));
        }
        Ok(Self {
            status: buf[5],
            kind: buf[6],
            provider_version: u32::from_le_bytes(le_array(&buf[8..12])),
            start: i64::from_le_bytes(le_array(&buf[16..24])),
            end: i64::from_le_bytes(le_array(&buf[24..32])),
            footer_offset: u64::from_le_bytes(le_array(&buf[32..40])),
            footer_len: u64::from_le_bytes(le_array(&buf[40..48])),
            footer_crc: u32::from_le_bytes(le_array(&buf[48..52])),
        })
    }
}

fn le_array<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&bytes[..N]);
    out
}

fn encode_record(quark: Quark, start: Timestamp, end: Timestamp, value: &StateValue) -> Vec<u8> {
    let mut buf = Vec::with_capacity(RECORD_FIXED_SIZE + 12);
    buf.extend_from_slice(&quark.0.to_le_bytes());
    buf.extend_from_slice(&start.to_le_bytes());
    buf.extend_from_slice(&end.to_le_bytes());
    match value {
        StateValue::Null => buf.push(TAG_NULL),
        StateValue::Int(v) => {
            buf.push(TAG_INT);
            buf.extend_from_slice(&v.to_le_bytes());
        }
        StateValue::Long(v) => {
            buf.push(TAG_LONG);
            buf.extend_from_slice(&v.to_le_bytes());
        }
        StateValue::Double(v) => {
            buf.push(TAG_DOUBLE);
            buf.extend_from_slice(&v.to_bits().to_le_bytes());
        }
        StateValue::String(s) => {
            buf.push(TAG_STRING);
            buf.extend_from_slice(&(s.len() as u32).to_le_bytes());
            buf.extend_from_slice(s.as_bytes());
        }
    }
    let checksum = crc32fast::hash(&buf);
    buf.extend_from_slice(&checksum.to_le_bytes());
    buf
}

fn decode_record<R: Read>(reader: &mut R) -> Result<Interval> {
    let mut hasher = crc32fast::Hasher::new();

    let mut fixed = [0u8; RECORD_FIXED_SIZE];
    reader.read_exact(&mut fixed)?;
    hasher.update(&fixed);
    let quark = Quark(u32::from_le_bytes(le_array(&fixed[0..4])));
    let start = i64::from_le_bytes(le_array(&fixed[4..12]));
    let end = i64::from_le_bytes(le_array(&fixed[12..20]));

    let value = match fixed[20] {
        TAG_NULL => StateValue::Null,
        TAG_INT => {
            let mut b = [0u8; 4];
            reader.read_exact(&mut b)?;
            hasher.update(&b);
            StateValue::Int(i32::from_le_bytes(b))
        }
        TAG_LONG => {
            let mut b = [0u8; 8];
            reader.read_exact(&mut b)?;
            hasher.update(&b);
            StateValue::Long(i64::from_le_bytes(b))
        }
        TAG_DOUBLE => {
            let mut b = [0u8; 8];
            reader.read_exact(&mut b)?;
            hasher.update(&b);
            StateValue::Double(f64::from_bits(u64::from_le_bytes(b)))
        }
        TAG_STRING => {
            let mut len_bytes = [0u8; 4];
            reader.read_exact(&mut len_bytes)?;
            hasher.update(&len_bytes);
            let mut bytes = vec![0u8; u32::from_le_bytes(len_bytes) as usize];
            reader.read_exact(&mut bytes)?;
            hasher.update(&bytes);
            StateValue::String(
                String::from_utf8(bytes)
                    .map_err(|e| StateError::InvalidFormat(format!("invalid string value: {}", e)))?,
            )
        }
        tag => {
            return Err(StateError::InvalidFormat(format!("unknown value tag: {}", tag)));
        }
    };

    let mut checksum_bytes = [0u8; 4];
    reader.read_exact(&mut checksum_bytes)?;
    let stored = u32::from_le_bytes(checksum_bytes);
    let computed = hasher.finalize();
    if stored != computed {
        return Err(StateError::ChecksumMismatch {
            expected: stored,
            got: computed,
        });
    }

    Ok(Interval::new(quark, start, end, value))
}

fn find_entry(entries: &[IndexEntry], t: Timestamp) -> Option<IndexEntry> {
    let index = entries.partition_point(|e| e.end < t);
    entries.get(index).filter(|e| e.start <= t).copied()
}

enum Storage {
    /// Being built: records are appended through the locked handle.
    Writing { file: File, len: u64 },
    /// Complete: read through a read-only mapping. The handle keeps the lock.
    Mapped { map: Mmap, _file: File },
    Released,
}

/// Every interval persisted to one history file.
pub struct HistoryFileBackend {
    ssid: String,
    path: PathBuf,
    kind: u8,
    provider_version: u32,
    start: Timestamp,
    end: AtomicI64,
    storage: RwLock<Storage>,
    index: RwLock<Vec<Vec<IndexEntry>>>,
    tail: IntervalTail,
    cache: Mutex<LruCache<u64, Interval>>,
    extra: RwLock<Vec<u8>>,
    attribute_tree: Option<Vec<u8>>,
    complete: bool,
}

impl HistoryFileBackend {
    /// Create a new history file at `path`, replacing any existing one.
    ///
    /// The file stays exclusively locked for the lifetime of the backend.
    pub fn create(
        ssid: impl Into<String>,
        path: impl AsRef<Path>,
        provider_version: u32,
        start: Timestamp,
        cache_size: usize,
    ) -> Result<Self> {
        Self::create_as(BackendType::Full, ssid, path, provider_version, start, cache_size)
    }

    /// Like [`HistoryFileBackend::create`], tagging the file as written by
    /// `kind`.
    pub(crate) fn create_as(
        kind: BackendType,
        ssid: impl Into<String>,
        path: impl AsRef<Path>,
        provider_version: u32,
        start: Timestamp,
        cache_size: usize,
    ) -> Result<Self> {
        let kind = kind_byte(kind)?;
        let ssid = ssid.into();
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        file.try_lock_exclusive().map_err(|_| StateError::Locked)?;
        file.set_len(0)?;

        let header = Header {
            status: STATUS_BUILDING,
            kind,
            provider_version,
            start,
            end: start,
            footer_offset: 0,
            footer_len: 0,
            footer_crc: 0,
        };
        file.write_all(&header.encode())?;

        debug!(ssid = %ssid, path = %path.display(), "created history file");

        Ok(Self {
            ssid,
            path,
            kind,
            provider_version,
            start,
            end: AtomicI64::new(start),
            storage: RwLock::new(Storage::Writing {
                file,
                len: HEADER_SIZE as u64,
            }),
            index: RwLock::new(Vec::new()),
            tail: IntervalTail::new(start),
            cache: Mutex::new(LruCache::new(cache_capacity(cache_size))),
            extra: RwLock::new(Vec::new()),
            attribute_tree: None,
            complete: false,
        })
    }

    /// Reopen a completed history file written by a provider of
    /// `expected_version`.
    ///
    /// Fails with `VersionMismatch`, `InvalidFormat` or `ChecksumMismatch`
    /// when the file cannot be reused as is, including a file written by the
    /// partial backend.
    pub fn open(
        ssid: impl Into<String>,
        path: impl AsRef<Path>,
        expected_version: u32,
        cache_size: usize,
    ) -> Result<Self> {
        Self::open_as(BackendType::Full, ssid, path, expected_version, cache_size)
    }

    /// Like [`HistoryFileBackend::open`], requiring a file written by `kind`.
    pub(crate) fn open_as(
        kind: BackendType,
        ssid: impl Into<String>,
        path: impl AsRef<Path>,
        expected_version: u32,
        cache_size: usize,
    ) -> Result<Self> {
        let kind = kind_byte(kind)?;
        let ssid = ssid.into();
        let path = path.as_ref().to_path_buf();

        let file = File::open(&path)?;
        file.try_lock_shared().map_err(|_| StateError::Locked)?;

        // SAFETY: the file is held under a shared lock, which excludes the
        // only writer (an exclusive lock holder), and is never written
        // through this handle.
        let map = unsafe { Mmap::map(&file)? };

        let header = Header::decode(&map)?;
        if header.status != STATUS_COMPLETE {
            return Err(StateError::InvalidFormat(
                "history file was never completed".into(),
            ));
        }
        if header.kind != kind {
            return Err(StateError::InvalidFormat(format!(
                "history file was written by a {} backend, expected {}",
                kind_name(header.kind),
                kind_name(kind)
            )));
        }
        if header.provider_version != expected_version {
            return Err(StateError::VersionMismatch {
                expected: expected_version,
                got: header.provider_version,
            });
        }

        let footer_start = header.footer_offset as usize;
        let footer_end = footer_start.saturating_add(header.footer_len as usize);
        let footer_bytes = map
            .get(footer_start..footer_end)
            .ok_or_else(|| StateError::InvalidFormat("footer out of bounds".into()))?;
        let crc = crc32fast::hash(footer_bytes);
        if crc != header.footer_crc {
            return Err(StateError::ChecksumMismatch {
                expected: header.footer_crc,
                got: crc,
            });
        }
        let footer: Footer = rmp_serde::from_slice(footer_bytes)?;

        let tail = IntervalTail::new(header.start);
        tail.close()?;

        debug!(
            ssid = %ssid,
            path = %path.display(),
            attributes = footer.index.len(),
            "reopened history file"
        );

        Ok(Self {
            ssid,
            path,
            kind,
            provider_version: header.provider_version,
            start: header.start,
            end: AtomicI64::new(header.end),
            storage: RwLock::new(Storage::Mapped { map, _file: file }),
            index: RwLock::new(footer.index),
            tail,
            cache: Mutex::new(LruCache::new(cache_capacity(cache_size))),
            extra: RwLock::new(footer.extra),
            attribute_tree: Some(footer.attribute_tree),
            complete: true,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn provider_version(&self) -> u32 {
        self.provider_version
    }

    /// Backend-specific blob stored in the footer.
    pub(crate) fn extra(&self) -> Vec<u8> {
        self.extra.read().clone()
    }

    /// Set the blob written to the footer on completion.
    pub(crate) fn set_extra(&self, bytes: Vec<u8>) {
        *self.extra.write() = bytes;
    }

    /// Number of stored intervals.
    pub fn interval_count(&self) -> usize {
        self.index.read().iter().map(Vec::len).sum()
    }

    fn read_interval(&self, offset: u64) -> Result<Interval> {
        if let Some(interval) = self.cache.lock().get(&offset) {
            return Ok(interval.clone());
        }

        let mapped = {
            let storage = self.storage.read();
            match &*storage {
                Storage::Mapped { map, .. } => Some(read_mapped(map, offset)?),
                Storage::Released => return Err(StateError::Disposed),
                Storage::Writing { .. } => None,
            }
        };
        let interval = match mapped {
            Some(interval) => interval,
            None => {
                let mut storage = self.storage.write();
                match &mut *storage {
                    Storage::Writing { file, .. } => {
                        file.seek(SeekFrom::Start(offset))?;
                        decode_record(&mut BufReader::with_capacity(256, &mut *file))?
                    }
                    Storage::Mapped { map, .. } => read_mapped(map, offset)?,
                    Storage::Released => return Err(StateError::Disposed),
                }
            }
        };

        self.cache.lock().put(offset, interval.clone());
        Ok(interval)
    }
}

fn cache_capacity(size: usize) -> NonZeroUsize {
    NonZeroUsize::new(size).unwrap_or(NonZeroUsize::MIN)
}

fn read_mapped(map: &Mmap, offset: u64) -> Result<Interval> {
    let mut bytes = map
        .get(offset as usize..)
        .ok_or_else(|| StateError::InvalidFormat(format!("record offset {} out of bounds", offset)))?;
    decode_record(&mut bytes)
}

impl StateBackend for HistoryFileBackend {
    fn ssid(&self) -> &str {
        &self.ssid
    }

    fn backend_type(&self) -> BackendType {
        BackendType::Full
    }

    fn start_time(&self) -> Timestamp {
        self.start
    }

    fn end_time(&self) -> Timestamp {
        self.end.load(Ordering::SeqCst)
    }

    fn insert_past_state(
        &self,
        start: Timestamp,
        end: Timestamp,
        quark: Quark,
        value: &StateValue,
    ) -> Result<()> {
        self.tail.advance(quark, start, end)?;
        let record = encode_record(quark, start, end, value);

        let offset = {
            let mut storage = self.storage.write();
            match &mut *storage {
                Storage::Writing { file, len } => {
                    let offset = *len;
                    file.seek(SeekFrom::Start(offset))?;
                    file.write_all(&record)?;
                    *len += record.len() as u64;
                    offset
                }
                _ => return Err(StateError::ClosedStore),
            }
        };

        let mut index = self.index.write();
        let slot = quark.index();
        if slot >= index.len() {
            index.resize_with(slot + 1, Vec::new);
        }
        index[slot].push(IndexEntry { start, end, offset });
        self.end.fetch_max(end, Ordering::SeqCst);
        Ok(())
    }

    fn finished_building(&self, end: Timestamp, tree: &AttributeTree) -> Result<()> {
        self.tail.close()?;
        let end = self.end.fetch_max(end, Ordering::SeqCst).max(end);

        let footer = Footer {
            attribute_tree: tree.to_bytes()?,
            index: self.index.read().clone(),
            extra: self.extra.read().clone(),
        };
        let footer_bytes = rmp_serde::to_vec(&footer)?;

        let mut storage = self.storage.write();
        let (mut file, len) = match std::mem::replace(&mut *storage, Storage::Released) {
            Storage::Writing { file, len } => (file, len),
            other => {
                *storage = other;
                return Err(StateError::ClosedStore);
            }
        };

        file.seek(SeekFrom::Start(len))?;
        file.write_all(&footer_bytes)?;
        let header = Header {
            status: STATUS_COMPLETE,
            kind: self.kind,
            provider_version: self.provider_version,
            start: self.start,
            end,
            footer_offset: len,
            footer_len: footer_bytes.len() as u64,
            footer_crc: crc32fast::hash(&footer_bytes),
        };
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&header.encode())?;
        file.sync_all()?;

        // SAFETY: the file is exclusively locked by this handle and no more
        // writes go through it from here on.
        let map = unsafe { Mmap::map(&file)? };
        *storage = Storage::Mapped { map, _file: file };

        debug!(
            ssid = %self.ssid,
            path = %self.path.display(),
            end,
            intervals = footer.index.iter().map(Vec::len).sum::<usize>(),
            "history file completed"
        );
        Ok(())
    }

    fn attribute_tree(&self) -> Option<Vec<u8>> {
        self.attribute_tree.clone()
    }

    fn is_complete(&self) -> bool {
        self.complete
    }

    fn do_query(&self, states: &mut [Option<Interval>], t: Timestamp) -> Result<()> {
        let hits: Vec<(usize, u64)> = {
            let index = self.index.read();
            index
                .iter()
                .take(states.len())
                .enumerate()
                .filter_map(|(q, entries)| find_entry(entries, t).map(|e| (q, e.offset)))
                .collect()
        };
        for (q, offset) in hits {
            states[q] = Some(self.read_interval(offset)?);
        }
        Ok(())
    }

    fn do_single_query(&self, t: Timestamp, quark: Quark) -> Result<Option<Interval>> {
        let entry = {
            let index = self.index.read();
            index
                .get(quark.index())
                .and_then(|entries| find_entry(entries, t))
        };
        match entry {
            Some(e) => Ok(Some(self.read_interval(e.offset)?)),
            None => Ok(None),
        }
    }

    fn file_path(&self) -> Option<&Path> {
        Some(&self.path)
    }

    fn file_size(&self) -> Option<u64> {
        fs::metadata(&self.path).map(|m| m.len()).ok()
    }

    fn remove_files(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => {
                debug!(ssid = %self.ssid, path = %self.path.display(), "deleted history file");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => {
                warn!(ssid = %self.ssid, path = %self.path.display(), error = %e, "could not delete history file");
                Err(e.into())
            }
        }
    }

    fn dispose(&self) {
        *self.storage.write() = Storage::Released;
        self.cache.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn build(path: &Path, version: u32) -> AttributeTree {
        let tree = AttributeTree::new();
        let a = tree.get_or_create_quark(None, &["A"]).unwrap();
        let b = tree.get_or_create_quark(None, &["B"]).unwrap();

        let backend = HistoryFileBackend::create("ht", path, version, 0, 16).unwrap();
        backend.insert_past_state(0, 9, a, &StateValue::Int(1)).unwrap();
        backend.insert_past_state(10, 19, a, &StateValue::from("two")).unwrap();
        backend.insert_past_state(0, 29, b, &StateValue::Double(0.5)).unwrap();
        backend.insert_past_state(20, 30, a, &StateValue::Null).unwrap();
        backend.insert_past_state(30, 30, b, &StateValue::Long(-3)).unwrap();

        // Readable before completion.
        let interval = backend.do_single_query(12, a).unwrap().unwrap();
        assert_eq!(interval.value, StateValue::from("two"));

        backend.finished_building(30, &tree).unwrap();
        tree
    }

    #[test]
    fn test_create_and_query() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("test.ht");
        build(&path, 1);

        let backend = HistoryFileBackend::open("ht", &path, 1, 16).unwrap();
        assert!(backend.is_complete());
        assert_eq!(backend.start_time(), 0);
        assert_eq!(backend.end_time(), 30);
        assert_eq!(backend.interval_count(), 5);

        let interval = backend.do_single_query(5, Quark(0)).unwrap().unwrap();
        assert_eq!((interval.start, interval.end), (0, 9));
        assert_eq!(interval.value, StateValue::Int(1));

        let mut states = vec![None, None];
        backend.do_query(&mut states, 30).unwrap();
        assert_eq!(states[0].as_ref().unwrap().value, StateValue::Null);
        assert_eq!(states[1].as_ref().unwrap().value, StateValue::Long(-3));
    }

    #[test]
    fn test_reopen_restores_tree() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tree.ht");
        build(&path, 3);

        let backend = HistoryFileBackend::open("ht", &path, 3, 16).unwrap();
        let tree = AttributeTree::from_bytes(&backend.attribute_tree().unwrap()).unwrap();
        assert_eq!(tree.lookup_quark(None, &["B"]).unwrap(), Some(Quark(1)));
    }

    #[test]
    fn test_version_mismatch() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("version.ht");
        build(&path, 1);

        let result = HistoryFileBackend::open("ht", &path, 2, 16);
        assert!(matches!(
            result,
            Err(StateError::VersionMismatch { expected: 2, got: 1 })
        ));
    }

    #[test]
    fn test_backend_kind_must_match() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("kind.ht");
        {
            let tree = AttributeTree::new();
            let a = tree.get_or_create_quark(None, &["A"]).unwrap();
            let backend =
                HistoryFileBackend::create_as(BackendType::Partial, "ht", &path, 1, 0, 16).unwrap();
            backend.insert_past_state(0, 9, a, &StateValue::Int(1)).unwrap();
            backend.finished_building(9, &tree).unwrap();
        }

        assert!(matches!(
            HistoryFileBackend::open("ht", &path, 1, 16),
            Err(StateError::InvalidFormat(message)) if message.contains("PARTIAL")
        ));
        let backend = HistoryFileBackend::open_as(BackendType::Partial, "ht", &path, 1, 16).unwrap();
        assert_eq!(backend.end_time(), 9);

        let full = dir.path().join("full.ht");
        build(&full, 1);
        assert!(matches!(
            HistoryFileBackend::open_as(BackendType::Partial, "ht", &full, 1, 16),
            Err(StateError::InvalidFormat(_))
        ));
        assert!(matches!(
            HistoryFileBackend::create_as(BackendType::Null, "ht", dir.path().join("null.ht"), 1, 0, 16),
            Err(StateError::InvalidOperation(_))
        ));
    }

    #[test]
    fn test_incomplete_file_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("partial.ht");
        {
            let backend = HistoryFileBackend::create("ht", &path, 1, 0, 16).unwrap();
            backend
                .insert_past_state(0, 9, Quark(0), &StateValue::Int(1))
                .unwrap();
        }
        assert!(matches!(
            HistoryFileBackend::open("ht", &path, 1, 16),
            Err(StateError::InvalidFormat(_))
        ));
    }

    #[test]
    fn test_corrupt_footer_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("corrupt.ht");
        build(&path, 1);

        let mut bytes = fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        fs::write(&path, bytes).unwrap();

        assert!(matches!(
            HistoryFileBackend::open("ht", &path, 1, 16),
            Err(StateError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_exclusive_lock_while_building() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("locked.ht");
        let _writer = HistoryFileBackend::create("ht", &path, 1, 0, 16).unwrap();

        assert!(matches!(
            HistoryFileBackend::create("ht", &path, 1, 0, 16),
            Err(StateError::Locked)
        ));
    }

    #[test]
    fn test_remove_files() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("gone.ht");
        let backend = HistoryFileBackend::create("ht", &path, 1, 0, 16).unwrap();
        assert!(backend.file_size().unwrap() >= HEADER_SIZE as u64);

        backend.remove_files().unwrap();
        assert!(!path.exists());
        backend.remove_files().unwrap();
    }
}
