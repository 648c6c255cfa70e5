//! The storage engine: open/recovery, put/get/remove, and rollover.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::index::{DirEntry, ShardedIndex};
use crate::log::LogFile;

/// Reserved value marking a deletion. Carried in the log itself, since the
/// on-disk record format has no spare type tag or sign bit to flag a
/// tombstone out of band.
pub const TOMBSTONE_SENTINEL: &[u8] = b"\x00__bitcask_tombstone__\x00";

/// Reserved for future use; like [`TOMBSTONE_SENTINEL`], callers may never
/// store this as a value.
pub const RESERVED_SENTINEL: &[u8] = b"\x00__bitcask_reserved__\x00";

/// An open Bitcask database.
///
/// Cheaply cloneable handles are not provided; instead, share one `Engine`
/// across threads behind an `Arc` if concurrent access from multiple owners
/// is needed -- every method here already takes `&self` and is safe to call
/// from multiple threads directly.
pub struct Engine {
    dir: PathBuf,
    config: Config,
    segments: RwLock<HashMap<u32, Arc<LogFile>>>,
    active_id: AtomicU32,
    index: ShardedIndex,
    /// Serializes the whole append-then-update-index sequence, and
    /// rollover, across the active segment and the segment table.
    write_lock: Mutex<()>,
}

impl Engine {
    /// Opens (or creates) a database directory, replaying every segment in
    /// ascending id order to rebuild the in-memory index.
    pub fn open(dir: impl AsRef<Path>, config: Config) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let mut ids = Self::scan_segment_ids(&dir)?;
        if ids.is_empty() {
            ids.push(0);
        }
        ids.sort_unstable();

        let index = ShardedIndex::new(config.num_shards);
        let mut segments = HashMap::with_capacity(ids.len());

        for id in &ids {
            let log = LogFile::open_or_create(&dir, *id, config.max_log_file_size)?;
            let mut iter = log.iterate()?;
            for record in iter.by_ref() {
                let record = record?;
                if record.value == TOMBSTONE_SENTINEL {
                    index.remove(&record.key);
                } else {
                    index.put(
                        record.key,
                        DirEntry {
                            segment_id: *id,
                            value_offset: record.value_offset,
                            value_size: record.value.len() as u32,
                        },
                    );
                }
            }
            log.set_write_cursor(iter.final_offset());
            segments.insert(*id, Arc::new(log));
        }

        let active_id = *ids.last().expect("at least segment 0 always present");
        log::info!(
            "opened bitcask database at {} with {} segment(s), {} live key(s), active segment {}",
            dir.display(),
            segments.len(),
            index.count(),
            active_id
        );

        Ok(Self {
            dir,
            config,
            segments: RwLock::new(segments),
            active_id: AtomicU32::new(active_id),
            index,
            write_lock: Mutex::new(()),
        })
    }

    /// Enumerates the database directory, parsing every entry name as a
    /// segment id. A non-numeric name, or an entry that is not a regular
    /// file, is a hard error.
    fn scan_segment_ids(dir: &Path) -> Result<Vec<u32>> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if !entry.file_type()?.is_file() {
                return Err(Error::CorruptDirectory(name.into_owned()));
            }
            match name.parse::<u32>() {
                Ok(id) => ids.push(id),
                Err(_) => return Err(Error::CorruptDirectory(name.into_owned())),
            }
        }
        Ok(ids)
    }

    /// Looks up `key`, returning its value if present.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let Some(entry) = self.index.get(key) else {
            return Ok(None);
        };
        let segment = self.segment(entry.segment_id);
        Ok(Some(segment.read_value(entry.value_offset, entry.value_size)?))
    }

    /// Inserts or overwrites `key` with `value`.
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        if value == TOMBSTONE_SENTINEL || value == RESERVED_SENTINEL {
            return Err(Error::ValueReserved);
        }

        let _guard = self.write_lock.lock().expect("engine write lock poisoned");
        let segment = self.active_segment_for_write()?;
        let (_item_offset, value_offset) = segment.write_item(key, value)?;
        self.index.put(
            key.to_vec(),
            DirEntry {
                segment_id: segment.id(),
                value_offset,
                value_size: value.len() as u32,
            },
        );
        Ok(())
    }

    /// Removes `key`, returning whether it was present.
    pub fn remove(&self, key: &[u8]) -> Result<bool> {
        if self.index.get(key).is_none() {
            return Ok(false);
        }

        let _guard = self.write_lock.lock().expect("engine write lock poisoned");
        // Re-check under the write lock: another thread may have removed
        // the key between the check above and acquiring the lock.
        if self.index.get(key).is_none() {
            return Ok(false);
        }
        let segment = self.active_segment_for_write()?;
        segment.write_item(key, TOMBSTONE_SENTINEL)?;
        self.index.remove(key);
        Ok(true)
    }

    /// Must be called while holding `write_lock`. Rolls the active segment
    /// over if it is full, then returns the (now certainly writable)
    /// active segment.
    fn active_segment_for_write(&self) -> Result<Arc<LogFile>> {
        let active_id = self.active_id.load(Ordering::Acquire);
        let segment = self.segment(active_id);
        if segment.is_full() {
            self.rollover(active_id)
        } else {
            Ok(segment)
        }
    }

    /// Must be called while holding `write_lock`. Creates segment
    /// `current_active + 1`, adds it to the segment table, and advances
    /// `active_id`.
    fn rollover(&self, current_active: u32) -> Result<Arc<LogFile>> {
        let new_id = current_active + 1;
        let new_log = Arc::new(LogFile::open_or_create(
            &self.dir,
            new_id,
            self.config.max_log_file_size,
        )?);
        self.segments
            .write()
            .expect("segment table lock poisoned")
            .insert(new_id, Arc::clone(&new_log));
        self.active_id.store(new_id, Ordering::Release);
        log::debug!("rolled over to segment {new_id}");
        // Re-fetch from the table rather than trusting `new_log` directly:
        // this is the point where a source implementation could hand back a
        // reference that dangles once the table is mutated again. Reading
        // it back through `segment()` keeps that invariant honest.
        Ok(self.segment(new_id))
    }

    /// Looks up an open segment by id. Panics if the id is not present,
    /// since the index is only ever updated with ids of segments that are
    /// already in the table (see the open/recovery and rollover paths).
    fn segment(&self, id: u32) -> Arc<LogFile> {
        Arc::clone(
            self.segments
                .read()
                .expect("segment table lock poisoned")
                .get(&id)
                .unwrap_or_else(|| panic!("index referenced segment {id} that was never opened")),
        )
    }

    /// Number of live keys in the index. An exact count if there is no
    /// concurrent mutation, otherwise a point-in-time approximation (see
    /// [`ShardedIndex::count`]).
    pub fn len(&self) -> usize {
        self.index.count()
    }

    /// Whether the index currently holds no keys.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Compaction is declared but intentionally unimplemented; merging
    /// obsolete segments is out of scope for this engine.
    pub fn compact(&self) -> Result<()> {
        Err(Error::NotImplemented("compaction"))
    }

    /// Consumes the engine. Every write was already fsynced when it
    /// happened, so there is nothing left to flush; this exists to give
    /// callers an explicit, named teardown point.
    pub fn close(self) {
        log::info!("closing bitcask database at {}", self.dir.display());
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        log::debug!("dropping bitcask database handle for {}", self.dir.display());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open(dir: &Path) -> Engine {
        Engine::open(dir, Config::small()).expect("open should succeed")
    }

    #[test]
    fn empty_directory_behaves_as_empty_database() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let engine = open(dir.path());
        assert_eq!(engine.get(b"name")?, None);
        assert!(dir.path().join(crate::log::segment_filename(0)).exists());
        Ok(())
    }

    #[test]
    fn scenario_1_open_put_get() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let engine = open(dir.path());
        assert_eq!(engine.get(b"name")?, None);
        engine.put(b"name", b"jhon")?;
        assert_eq!(engine.get(b"name")?, Some(b"jhon".to_vec()));
        Ok(())
    }

    #[test]
    fn put_get_overwrite() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let engine = open(dir.path());
        engine.put(b"k", b"v1")?;
        engine.put(b"k", b"v2")?;
        assert_eq!(engine.get(b"k")?, Some(b"v2".to_vec()));
        Ok(())
    }

    #[test]
    fn put_remove_get_absent() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let engine = open(dir.path());
        engine.put(b"k", b"v")?;
        assert!(engine.remove(b"k")?);
        assert_eq!(engine.get(b"k")?, None);
        assert!(!engine.remove(b"k")?);
        Ok(())
    }

    #[test]
    fn scenario_2_rollover_is_a_soft_bound_checked_before_not_after() -> Result<()> {
        // is_full() is a pure predicate on the *current* write cursor, checked
        // before a write begins (section 4.1): it has no look-ahead into how
        // large the next record will be. With a 32-byte segment cap:
        //   put("a","1")    -> 10 bytes, cursor 0  -> 10 (not full before; 10 < 32)
        //   put("bb","22")  -> 12 bytes, cursor 10 -> 22 (not full before; 10 < 32)
        //   put("ccc","333")-> 14 bytes, cursor 22 -> 36 (not full before; 22 < 32)
        // All three therefore land in segment 0, which ends up *over* its soft
        // bound (36 > 32) exactly as section 4.1 allows ("a single write_item
        // may push the cursor past max_size"). Only the *next* put, checked
        // against a cursor that has now reached 36, triggers rollover.
        let dir = tempfile::tempdir()?;
        let engine = Engine::open(dir.path(), Config::new(8, 32))?;

        engine.put(b"a", b"1")?;
        engine.put(b"bb", b"22")?;
        engine.put(b"ccc", b"333")?;

        assert_eq!(engine.get(b"a")?, Some(b"1".to_vec()));
        assert_eq!(engine.get(b"bb")?, Some(b"22".to_vec()));
        assert_eq!(engine.get(b"ccc")?, Some(b"333".to_vec()));

        assert!(dir.path().join(crate::log::segment_filename(0)).exists());
        assert!(!dir.path().join(crate::log::segment_filename(1)).exists());

        let seg0_records: Result<Vec<_>> =
            LogFile::open_or_create(dir.path(), 0, 32)?.iterate()?.collect();
        assert_eq!(seg0_records?.len(), 3);

        // The segment is now over its soft bound; the next put rolls over.
        engine.put(b"d", b"4")?;
        assert!(dir.path().join(crate::log::segment_filename(1)).exists());
        let seg1_records: Result<Vec<_>> =
            LogFile::open_or_create(dir.path(), 1, 32)?.iterate()?.collect();
        let seg1_records = seg1_records?;
        assert_eq!(seg1_records.len(), 1);
        assert_eq!(seg1_records[0].key, b"d");

        // The sealed segment 0 must still be readable after rollover: keys
        // written to it resolve exactly as they did before segment 1 existed.
        assert_eq!(engine.get(b"a")?, Some(b"1".to_vec()));
        assert_eq!(engine.get(b"bb")?, Some(b"22".to_vec()));
        assert_eq!(engine.get(b"ccc")?, Some(b"333".to_vec()));
        assert_eq!(engine.get(b"d")?, Some(b"4".to_vec()));
        Ok(())
    }

    #[test]
    fn scenario_3_put_put_remove_put_in_order() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let engine = open(dir.path());
        engine.put(b"k", b"v1")?;
        engine.put(b"k", b"v2")?;
        engine.remove(b"k")?;
        engine.put(b"k", b"v3")?;
        assert_eq!(engine.get(b"k")?, Some(b"v3".to_vec()));

        let records: Result<Vec<_>> =
            LogFile::open_or_create(dir.path(), 0, Config::small().max_log_file_size)?
                .iterate()?
                .collect();
        let records = records?;
        assert_eq!(records.len(), 4);
        assert_eq!(records[0].value, b"v1");
        assert_eq!(records[1].value, b"v2");
        assert_eq!(records[2].value, TOMBSTONE_SENTINEL);
        assert_eq!(records[3].value, b"v3");
        Ok(())
    }

    #[test]
    fn scenario_5_reopen_round_trip() -> Result<()> {
        let dir = tempfile::tempdir()?;
        {
            let engine = open(dir.path());
            engine.put(b"k", b"v1")?;
            engine.put(b"k", b"v2")?;
            engine.remove(b"k")?;
            engine.put(b"k", b"v3")?;
            engine.close();
        }
        let engine = open(dir.path());
        assert_eq!(engine.get(b"k")?, Some(b"v3".to_vec()));
        Ok(())
    }

    #[test]
    fn put_rejects_reserved_sentinels() {
        let dir = tempfile::tempdir().unwrap();
        let engine = open(dir.path());
        assert!(matches!(engine.put(b"k", TOMBSTONE_SENTINEL), Err(Error::ValueReserved)));
        assert!(matches!(engine.put(b"k", RESERVED_SENTINEL), Err(Error::ValueReserved)));
    }

    #[test]
    fn zero_length_value_is_valid() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let engine = open(dir.path());
        engine.put(b"empty", b"")?;
        assert_eq!(engine.get(b"empty")?, Some(Vec::new()));
        Ok(())
    }

    #[test]
    fn non_numeric_directory_entry_is_corrupt() -> Result<()> {
        let dir = tempfile::tempdir()?;
        std::fs::write(dir.path().join("manifest"), b"not a segment")?;
        let result = Engine::open(dir.path(), Config::small());
        assert!(matches!(result, Err(Error::CorruptDirectory(_))));
        Ok(())
    }

    #[test]
    fn compact_is_not_implemented() {
        let dir = tempfile::tempdir().unwrap();
        let engine = open(dir.path());
        assert!(matches!(engine.compact(), Err(Error::NotImplemented(_))));
    }

    #[test]
    fn reopen_recovers_from_torn_tail() -> Result<()> {
        let dir = tempfile::tempdir()?;
        {
            let engine = open(dir.path());
            engine.put(b"safe", b"value")?;
        }
        let seg0 = dir.path().join(crate::log::segment_filename(0));
        let full_len = std::fs::metadata(&seg0)?.len();
        let mut bytes = std::fs::read(&seg0)?;
        bytes.truncate((full_len - 2) as usize); // tear the trailing value bytes
        std::fs::write(&seg0, bytes)?;

        let engine = open(dir.path());
        assert_eq!(engine.get(b"safe")?, None);
        // The engine should still be writable after recovering past a torn tail.
        engine.put(b"safe", b"value2")?;
        assert_eq!(engine.get(b"safe")?, Some(b"value2".to_vec()));
        Ok(())
    }

    #[test]
    fn concurrent_puts_and_gets_across_threads() -> Result<()> {
        use std::sync::Arc;
        use std::thread;

        let dir = tempfile::tempdir()?;
        let engine = Arc::new(Engine::open(dir.path(), Config::new(4, 1024 * 1024))?);

        let mut handles = vec![];
        for t in 0..4 {
            let engine = Arc::clone(&engine);
            handles.push(thread::spawn(move || {
                for i in 0..100u32 {
                    let key = format!("t{t}-k{i}").into_bytes();
                    let value = format!("v{i}").into_bytes();
                    engine.put(&key, &value).unwrap();
                    assert_eq!(engine.get(&key).unwrap(), Some(value));
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(engine.len(), 400);
        Ok(())
    }

    /// Hex-dumps the records of a segment, one line per record: a
    /// human-readable view of the raw log for diagnosing recovery behavior
    /// by eye.
    fn dump_segment(log: &LogFile) -> Result<String> {
        let mut out = String::new();
        for record in log.iterate()? {
            let record = record?;
            out.push_str(&format!(
                "{}@{} key={} value={}\n",
                hex::encode(&record.key),
                record.item_offset,
                String::from_utf8_lossy(&record.key),
                if record.value == TOMBSTONE_SENTINEL {
                    "<tombstone>".to_string()
                } else {
                    String::from_utf8_lossy(&record.value).into_owned()
                },
            ));
        }
        Ok(out)
    }

    #[test]
    fn dump_segment_marks_tombstones() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let engine = open(dir.path());
        engine.put(b"k", b"v1")?;
        engine.remove(b"k")?;

        let log = LogFile::open_or_create(dir.path(), 0, Config::small().max_log_file_size)?;
        let dump = dump_segment(&log)?;
        assert!(dump.contains("key=k value=v1"));
        assert!(dump.contains("key=k value=<tombstone>"));
        Ok(())
    }
}
