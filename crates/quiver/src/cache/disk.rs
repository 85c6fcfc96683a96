//! The disk-backed cache store.
//!
//! Entries live as individual files in the cache directory. Each file starts
//! with a binary header (magic number, key, validators, expiration
//! timestamps, response headers) followed by the raw body bytes up to the
//! end of the file. The magic number doubles as the format version guard: a
//! mismatch marks the file as corrupt and it is dropped.
//!
//! An in-memory index maps keys to header metadata in access order; once the
//! byte budget is exceeded, least-recently-used entries are pruned until
//! usage falls below the budget times the hysteresis factor.

use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use lru::LruCache;

use crate::cache::{CacheEntry, CacheStore};
use crate::response::Headers;

/// Format version guard prefixed to every cache file.
const CACHE_MAGIC: u32 = 0x2015_0306;

/// The default on-disk budget.
pub const DEFAULT_MAX_BYTES: u64 = 5 * 1024 * 1024;

/// Once pruning starts it continues until usage drops below
/// `max_bytes * HYSTERESIS_FACTOR`.
const HYSTERESIS_FACTOR: f32 = 0.9;

/// Header metadata kept in the in-memory index; everything from
/// [`CacheEntry`] except the body.
#[derive(Debug, Clone)]
struct EntryMeta {
    key: String,
    /// Byte size accounted against the cache budget.
    size: u64,
    etag: Option<String>,
    server_date: u64,
    last_modified: u64,
    ttl: u64,
    soft_ttl: u64,
    response_headers: Headers,
}

impl EntryMeta {
    fn new(key: String, entry: &CacheEntry) -> Self {
        EntryMeta {
            key,
            size: entry.data.len() as u64,
            etag: entry.etag.clone(),
            server_date: entry.server_date,
            last_modified: entry.last_modified,
            ttl: entry.ttl,
            soft_ttl: entry.soft_ttl,
            response_headers: entry.response_headers.clone(),
        }
    }

    fn into_entry(self, data: Vec<u8>) -> CacheEntry {
        CacheEntry {
            data,
            etag: self.etag,
            server_date: self.server_date,
            last_modified: self.last_modified,
            ttl: self.ttl,
            soft_ttl: self.soft_ttl,
            response_headers: self.response_headers,
        }
    }
}

#[derive(Debug)]
struct Index {
    /// Access-ordered key → metadata map; oldest entries are pruned first.
    entries: LruCache<String, EntryMeta>,
    total_bytes: u64,
}

/// Disk-backed [`CacheStore`] with an LRU byte budget.
#[derive(Debug)]
pub struct DiskCache {
    root: PathBuf,
    max_bytes: u64,
    index: Mutex<Index>,
}

impl DiskCache {
    /// Creates a cache rooted at `root` with the default byte budget.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self::with_max_bytes(root, DEFAULT_MAX_BYTES)
    }

    /// Creates a cache rooted at `root` with an explicit byte budget.
    pub fn with_max_bytes(root: impl Into<PathBuf>, max_bytes: u64) -> Self {
        DiskCache {
            root: root.into(),
            max_bytes,
            index: Mutex::new(Index {
                entries: LruCache::unbounded(),
                total_bytes: 0,
            }),
        }
    }

    /// Total bytes currently accounted against the budget.
    pub fn total_bytes(&self) -> u64 {
        self.index.lock().unwrap().total_bytes
    }

    fn file_for_key(&self, key: &str) -> PathBuf {
        self.root.join(filename_for_key(key))
    }

    /// Evicts least-recently-used entries until `needed` more bytes fit.
    fn prune_if_needed(&self, index: &mut Index, needed: u64) {
        if index.total_bytes + needed < self.max_bytes {
            return;
        }

        let before = index.total_bytes;
        let mut pruned = 0;
        let target = (self.max_bytes as f32 * HYSTERESIS_FACTOR) as u64;
        while index.total_bytes + needed >= target {
            let Some((key, meta)) = index.entries.pop_lru() else {
                break;
            };
            match fs::remove_file(self.file_for_key(&key)) {
                Ok(()) => index.total_bytes -= meta.size,
                Err(error) => {
                    tracing::debug!(key, error = %error, "could not delete cache file");
                }
            }
            pruned += 1;
        }

        tracing::debug!(
            pruned,
            freed = before - index.total_bytes,
            "pruned cache entries"
        );
    }

    fn read_entry(&self, key: &str, path: &Path) -> io::Result<CacheEntry> {
        let file = File::open(path)?;
        let total_len = file.metadata()?.len();
        let mut reader = CountingReader::new(BufReader::new(file), total_len);

        let meta = read_header(&mut reader)?;
        if meta.key != key {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("cache key mismatch: expected {key}, found {}", meta.key),
            ));
        }

        let mut data = Vec::with_capacity(reader.remaining() as usize);
        reader.read_to_end(&mut data)?;
        Ok(meta.into_entry(data))
    }
}

impl CacheStore for DiskCache {
    /// Scans the cache directory and rebuilds the index. Files that fail to
    /// parse are deleted. Safe to call repeatedly; every call rebuilds the
    /// index from disk.
    fn initialize(&self) {
        let mut index = self.index.lock().unwrap();
        index.entries.clear();
        index.total_bytes = 0;

        if !self.root.exists() {
            if let Err(error) = fs::create_dir_all(&self.root) {
                tracing::error!(
                    path = %self.root.display(),
                    error = &error as &dyn std::error::Error,
                    "unable to create cache directory",
                );
            }
            return;
        }

        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(error) => {
                tracing::error!(
                    path = %self.root.display(),
                    error = &error as &dyn std::error::Error,
                    "unable to scan cache directory",
                );
                return;
            }
        };

        for dir_entry in entries.flatten() {
            let path = dir_entry.path();
            let parsed = File::open(&path).and_then(|file| {
                let size = file.metadata()?.len();
                let mut reader = CountingReader::new(BufReader::new(file), size);
                let mut meta = read_header(&mut reader)?;
                meta.size = size;
                Ok(meta)
            });
            match parsed {
                Ok(meta) => {
                    index.total_bytes += meta.size;
                    index.entries.put(meta.key.clone(), meta);
                }
                Err(error) => {
                    tracing::debug!(
                        path = %path.display(),
                        error = %error,
                        "dropping unreadable cache file",
                    );
                    let _ = fs::remove_file(&path);
                }
            }
        }

        tracing::debug!(
            entries = index.entries.len(),
            total_bytes = index.total_bytes,
            "cache initialized",
        );
    }

    fn get(&self, key: &str) -> Option<CacheEntry> {
        let mut index = self.index.lock().unwrap();
        // Touch the entry so pruning sees it as recently used.
        index.entries.get(key)?;

        let path = self.file_for_key(key);
        match self.read_entry(key, &path) {
            Ok(entry) => Some(entry),
            Err(error) => {
                tracing::debug!(key, error = %error, "failed to read cache entry");
                if let Some(meta) = index.entries.pop(key) {
                    index.total_bytes -= meta.size;
                }
                let _ = fs::remove_file(path);
                None
            }
        }
    }

    fn put(&self, key: &str, entry: CacheEntry) {
        let mut index = self.index.lock().unwrap();
        self.prune_if_needed(&mut index, entry.data.len() as u64);

        let meta = EntryMeta::new(key.to_owned(), &entry);
        let path = self.file_for_key(key);

        let written = write_entry_file(&self.root, &path, &meta, &entry.data);
        match written {
            Ok(()) => {
                index.total_bytes += meta.size;
                if let Some(old) = index.entries.put(key.to_owned(), meta) {
                    index.total_bytes -= old.size;
                }
            }
            Err(error) => {
                tracing::error!(
                    key,
                    error = &error as &dyn std::error::Error,
                    "failed to write cache entry",
                );
                if let Some(old) = index.entries.pop(key) {
                    index.total_bytes -= old.size;
                }
                let _ = fs::remove_file(path);
            }
        }
    }

    fn remove(&self, key: &str) {
        let mut index = self.index.lock().unwrap();
        let _ = fs::remove_file(self.file_for_key(key));
        if let Some(meta) = index.entries.pop(key) {
            index.total_bytes -= meta.size;
        }
    }

    fn invalidate(&self, key: &str, full_expire: bool) {
        if let Some(mut entry) = self.get(key) {
            entry.soft_ttl = 0;
            if full_expire {
                entry.ttl = 0;
            }
            self.put(key, entry);
        }
    }

    fn clear(&self) {
        let mut index = self.index.lock().unwrap();
        if let Ok(entries) = fs::read_dir(&self.root) {
            for dir_entry in entries.flatten() {
                let _ = fs::remove_file(dir_entry.path());
            }
        }
        index.entries.clear();
        index.total_bytes = 0;
        tracing::debug!("cache cleared");
    }
}

/// Writes header and body to a temporary file in the cache directory, then
/// atomically moves it into place. A failed write never leaves a partial
/// entry behind.
fn write_entry_file(root: &Path, path: &Path, meta: &EntryMeta, data: &[u8]) -> io::Result<()> {
    fs::create_dir_all(root)?;
    let temp_file = tempfile::Builder::new().prefix("tmp").tempfile_in(root)?;

    {
        let mut writer = BufWriter::new(temp_file.as_file());
        write_header(&mut writer, meta)?;
        writer.write_all(data)?;
        writer.flush()?;
    }

    temp_file.persist(path).map_err(|error| error.error)?;
    Ok(())
}

fn write_header(writer: &mut impl Write, meta: &EntryMeta) -> io::Result<()> {
    write_u32(writer, CACHE_MAGIC)?;
    write_string(writer, &meta.key)?;
    // An absent etag is encoded as the empty string.
    write_string(writer, meta.etag.as_deref().unwrap_or(""))?;
    write_u64(writer, meta.server_date)?;
    write_u64(writer, meta.last_modified)?;
    write_u64(writer, meta.ttl)?;
    write_u64(writer, meta.soft_ttl)?;
    write_u32(writer, meta.response_headers.len() as u32)?;
    for (name, value) in meta.response_headers.iter() {
        write_string(writer, name)?;
        write_string(writer, value)?;
    }
    Ok(())
}

fn read_header(reader: &mut CountingReader<impl Read>) -> io::Result<EntryMeta> {
    let magic = read_u32(reader)?;
    if magic != CACHE_MAGIC {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("bad magic number {magic:#010x}"),
        ));
    }

    let key = read_string(reader)?;
    let etag = read_string(reader)?;
    let etag = (!etag.is_empty()).then_some(etag);
    let server_date = read_u64(reader)?;
    let last_modified = read_u64(reader)?;
    let ttl = read_u64(reader)?;
    let soft_ttl = read_u64(reader)?;

    let header_count = read_u32(reader)?;
    let mut response_headers = Headers::new();
    for _ in 0..header_count {
        let name = read_string(reader)?;
        let value = read_string(reader)?;
        response_headers.insert(name, value);
    }

    Ok(EntryMeta {
        key,
        size: 0,
        etag,
        server_date,
        last_modified,
        ttl,
        soft_ttl,
        response_headers,
    })
}

/// A reader that tracks how many of the file's bytes are left, so that
/// length-prefixed reads can be validated against the file size.
struct CountingReader<R> {
    inner: R,
    remaining: u64,
}

impl<R: Read> CountingReader<R> {
    fn new(inner: R, total: u64) -> Self {
        CountingReader {
            inner,
            remaining: total,
        }
    }

    fn remaining(&self) -> u64 {
        self.remaining
    }
}

impl<R: Read> Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let read = self.inner.read(buf)?;
        self.remaining = self.remaining.saturating_sub(read as u64);
        Ok(read)
    }
}

fn write_u32(writer: &mut impl Write, value: u32) -> io::Result<()> {
    writer.write_all(&value.to_le_bytes())
}

fn write_u64(writer: &mut impl Write, value: u64) -> io::Result<()> {
    writer.write_all(&value.to_le_bytes())
}

fn write_string(writer: &mut impl Write, value: &str) -> io::Result<()> {
    write_u64(writer, value.len() as u64)?;
    writer.write_all(value.as_bytes())
}

fn read_u32(reader: &mut impl Read) -> io::Result<u32> {
    let mut bytes = [0; 4];
    reader.read_exact(&mut bytes)?;
    Ok(u32::from_le_bytes(bytes))
}

fn read_u64(reader: &mut impl Read) -> io::Result<u64> {
    let mut bytes = [0; 8];
    reader.read_exact(&mut bytes)?;
    Ok(u64::from_le_bytes(bytes))
}

fn read_string(reader: &mut CountingReader<impl Read>) -> io::Result<String> {
    let len = read_u64(reader)?;
    if len > reader.remaining() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("string length {len} exceeds remaining file size"),
        ));
    }
    let mut bytes = vec![0; len as usize];
    reader.read_exact(&mut bytes)?;
    String::from_utf8(bytes).map_err(|error| io::Error::new(io::ErrorKind::InvalidData, error))
}

/// Derives the file name for a key from two 31-based rolling hashes of the
/// key's halves, rendered in decimal. Collisions are tolerated: the header
/// embeds the key, and a mismatch on read counts as corruption.
fn filename_for_key(key: &str) -> String {
    let mid = key
        .char_indices()
        .nth(key.chars().count() / 2)
        .map(|(idx, _)| idx)
        .unwrap_or(key.len());
    let (first, second) = key.split_at(mid);
    format!("{}{}", segment_hash(first), segment_hash(second))
}

fn segment_hash(segment: &str) -> i32 {
    segment
        .chars()
        .fold(0i32, |hash, c| hash.wrapping_mul(31).wrapping_add(c as i32))
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::cache::now_millis;

    fn entry(body: &[u8]) -> CacheEntry {
        let mut response_headers = Headers::new();
        response_headers.insert("Content-Type", "text/plain");
        CacheEntry {
            data: body.to_vec(),
            etag: Some("v1".into()),
            server_date: 1_700_000_000_000,
            last_modified: 1_600_000_000_000,
            ttl: now_millis() + 60_000,
            soft_ttl: now_millis() + 30_000,
            response_headers,
        }
    }

    #[test]
    fn test_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DiskCache::new(dir.path());
        cache.initialize();

        let original = entry(b"hello world");
        cache.put("http://example.com/a", original.clone());

        assert_eq!(cache.get("http://example.com/a"), Some(original));
        assert_eq!(cache.get("http://example.com/b"), None);
    }

    #[test]
    fn test_round_trip_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let original = entry(b"persisted");

        {
            let cache = DiskCache::new(dir.path());
            cache.initialize();
            cache.put("key", original.clone());
        }

        let reopened = DiskCache::new(dir.path());
        reopened.initialize();
        assert_eq!(reopened.get("key"), Some(original));
    }

    #[test]
    fn test_entry_without_etag_or_headers() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DiskCache::new(dir.path());
        cache.initialize();

        let original = CacheEntry {
            data: vec![],
            ..Default::default()
        };
        cache.put("empty", original.clone());
        assert_eq!(cache.get("empty"), Some(original));
    }

    #[test]
    fn test_bad_magic_is_treated_as_absent() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DiskCache::new(dir.path());
        cache.initialize();
        cache.put("key", entry(b"body"));

        let path = dir.path().join(filename_for_key("key"));
        let mut bytes = fs::read(&path).unwrap();
        bytes[0] ^= 0xff;
        fs::write(&path, bytes).unwrap();

        assert_eq!(cache.get("key"), None);
        // The corrupt file was removed.
        assert!(!path.exists());
        assert_eq!(cache.total_bytes(), 0);
    }

    #[test]
    fn test_corrupt_files_dropped_on_initialize() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("junk");
        fs::write(&path, b"not a cache file").unwrap();

        let cache = DiskCache::new(dir.path());
        cache.initialize();

        assert!(!path.exists());
        assert_eq!(cache.total_bytes(), 0);
    }

    #[test]
    fn test_pruning_evicts_least_recently_used() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DiskCache::with_max_bytes(dir.path(), 1000);
        cache.initialize();

        cache.put("a", entry(&[0; 400]));
        cache.put("b", entry(&[1; 400]));
        cache.put("c", entry(&[2; 400]));

        assert!(cache.total_bytes() <= 900);
        assert_eq!(cache.get("a"), None);
        assert!(cache.get("b").is_some());
        assert!(cache.get("c").is_some());
    }

    #[test]
    fn test_get_refreshes_recency() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DiskCache::with_max_bytes(dir.path(), 1000);
        cache.initialize();

        cache.put("a", entry(&[0; 400]));
        cache.put("b", entry(&[1; 400]));
        // Touch "a" so that "b" is now the oldest.
        assert!(cache.get("a").is_some());

        cache.put("c", entry(&[2; 400]));

        assert!(cache.get("a").is_some());
        assert_eq!(cache.get("b"), None);
        assert!(cache.get("c").is_some());
    }

    #[test]
    fn test_replacement_accounting() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DiskCache::new(dir.path());
        cache.initialize();

        cache.put("key", entry(&[0; 100]));
        assert_eq!(cache.total_bytes(), 100);
        cache.put("key", entry(&[0; 40]));
        assert_eq!(cache.total_bytes(), 40);
    }

    #[test]
    fn test_invalidate() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DiskCache::new(dir.path());
        cache.initialize();
        cache.put("key", entry(b"body"));

        cache.invalidate("key", false);
        let soft = cache.get("key").unwrap();
        assert_eq!(soft.soft_ttl, 0);
        assert!(soft.refresh_needed());
        assert!(!soft.is_expired());

        cache.invalidate("key", true);
        let full = cache.get("key").unwrap();
        assert_eq!(full.ttl, 0);
        assert!(full.is_expired());
    }

    #[test]
    fn test_clear() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DiskCache::new(dir.path());
        cache.initialize();
        cache.put("a", entry(b"one"));
        cache.put("b", entry(b"two"));

        cache.clear();

        assert_eq!(cache.get("a"), None);
        assert_eq!(cache.get("b"), None);
        assert_eq!(cache.total_bytes(), 0);
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_filename_is_stable_and_multibyte_safe() {
        assert_eq!(
            filename_for_key("http://example.com/a"),
            filename_for_key("http://example.com/a")
        );
        // Must not panic on a non-ASCII split point.
        filename_for_key("héllo wörld");
        filename_for_key("");
    }
}
