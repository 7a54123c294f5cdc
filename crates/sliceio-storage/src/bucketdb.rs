//! Per-bucket storage facade
//!
//! A `BucketDb` owns one metadata database and an append-only list of
//! slice databases `slice-000`, `slice-001`, ... The newest one is the
//! active write target; older ones stay open for reads and for overwrites of
//! keys they already own.
//!
//! The metadata database maps every slice key to a [`SliceLocation`] and
//! stores the active slice database id under [`ACTIVE_SLICEDB_KEY`], so a
//! restart reopens exactly the databases that may hold data.
//!
//! All state sits behind one mutex: callers may share a `BucketDb` across
//! threads, and each operation sees a consistent active pointer.

use crate::engine::{KvEngine, open_engine};
use crate::slicedb::SliceDb;
use bytes::Bytes;
use parking_lot::Mutex;
use sliceio_common::{
    BucketId, Error, Result, Slice, SliceDbId, SliceKey, SliceLocation, StorageConfig,
};
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, trace, warn};

/// File name of the metadata database inside a bucket directory
pub const METADATA_DBNAME: &str = "metadata";

/// Metadata key holding the persisted active slice database id
pub const ACTIVE_SLICEDB_KEY: &[u8] = b"active_slicedb_id";

/// Point-in-time view of a bucket's databases
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BucketDbStats {
    pub bucket_id: BucketId,
    pub active_slicedb_id: SliceDbId,
    pub open_slicedbs: usize,
    /// `(id, approximate size)` for every open slice database
    pub slicedb_sizes: Vec<(SliceDbId, u64)>,
}

struct Inner {
    metadata: Box<dyn KvEngine>,
    /// Indexed by id; ids are gap-free from 0
    slicedbs: Vec<SliceDb>,
    active: SliceDbId,
}

impl Inner {
    fn slicedb(&self, id: SliceDbId) -> Result<&SliceDb> {
        self.slicedbs
            .get(id as usize)
            .ok_or(Error::SliceDbNotOpen(id))
    }

    fn active_slicedb(&self) -> Result<&SliceDb> {
        self.slicedb(self.active)
    }

    fn location(&self, key: &SliceKey) -> Result<Option<SliceLocation>> {
        let Some(raw) = self.metadata.get(&key.to_bytes())? else {
            return Ok(None);
        };
        let location: SliceLocation = bincode::deserialize(&raw)
            .map_err(|e| Error::Deserialization(format!("slice location for {key}: {e}")))?;
        Ok(Some(location))
    }

    fn put_location(&self, key: &SliceKey, location: &SliceLocation) -> Result<()> {
        let raw = bincode::serialize(location)
            .map_err(|e| Error::Serialization(format!("slice location for {key}: {e}")))?;
        self.metadata.put(&key.to_bytes(), &raw)
    }
}

/// Rotating slice storage for one bucket
pub struct BucketDb {
    id: BucketId,
    root_dir: PathBuf,
    config: StorageConfig,
    inner: Mutex<Inner>,
}

impl BucketDb {
    /// Open (or create) the bucket rooted at `<data_dir>/<id:04>`.
    ///
    /// Reopens every slice database from 0 up to the persisted active id;
    /// if any of them fails to open the whole bucket fails.
    pub fn open(data_dir: &Path, id: BucketId, config: &StorageConfig) -> Result<Self> {
        let root_dir = data_dir.join(format!("{id:04}"));
        std::fs::create_dir_all(&root_dir).map_err(|e| {
            Error::storage(format!(
                "cannot create bucket {id} directory {}: {e}",
                root_dir.display()
            ))
        })?;

        let metadata = open_engine(config.backend, &root_dir.join(METADATA_DBNAME))
            .map_err(|e| Error::metadata(format!("bucket {id}: cannot open metadata db: {e}")))?;

        let active = match metadata.get(ACTIVE_SLICEDB_KEY)? {
            Some(raw) => bincode::deserialize::<SliceDbId>(&raw).map_err(|e| {
                Error::Deserialization(format!("bucket {id}: active slicedb id: {e}"))
            })?,
            None => 0,
        };
        trace!(bucket_id = id, active_slicedb_id = active, "Read active slicedb id");

        // Already opened databases are dropped (and closed) on early return
        let mut slicedbs = Vec::with_capacity(active as usize + 1);
        for db_id in 0..=active {
            let slicedb = SliceDb::open(config.backend, &root_dir, db_id).map_err(|e| {
                error!(bucket_id = id, slicedb_id = db_id, error = %e, "SliceDB open failed");
                e
            })?;
            slicedbs.push(slicedb);
        }

        info!(
            bucket_id = id,
            backend = %config.backend,
            active_slicedb_id = active,
            root = %root_dir.display(),
            "Opened bucket storage"
        );

        Ok(Self {
            id,
            root_dir,
            config: config.clone(),
            inner: Mutex::new(Inner {
                metadata,
                slicedbs,
                active,
            }),
        })
    }

    #[must_use]
    pub const fn id(&self) -> BucketId {
        self.id
    }

    #[must_use]
    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    /// Id of the slice database currently receiving new keys
    #[must_use]
    pub fn active_slicedb_id(&self) -> SliceDbId {
        self.inner.lock().active
    }

    /// Metadata record of a slice, if any
    pub fn location(&self, key: &SliceKey) -> Result<Option<SliceLocation>> {
        self.inner.lock().location(key)
    }

    /// Persist a slice.
    ///
    /// Rotates to a fresh slice database first when the active one is past
    /// 90% of `max_dbsize`. A key that already has a home is rewritten in
    /// place, unless its home is the database that just filled up, in which
    /// case the old copy is removed and the slice moves to the new active
    /// database. The metadata record is written before the payload.
    pub fn write(&self, slice: &Slice) -> Result<()> {
        let key = &slice.key;
        let mut inner = self.inner.lock();

        let previous_active = inner.active;
        let rotated = if self.config.needs_rotation(inner.active_slicedb()?.size()?) {
            self.rotate(&mut inner)?;
            true
        } else {
            false
        };

        let target = match inner.location(key)? {
            Some(old) if rotated && old.slicedb_id == previous_active => {
                let stale = inner.slicedb(old.slicedb_id)?;
                if let Err(e) = stale.delete(key) {
                    warn!(
                        bucket_id = self.id,
                        slicedb_id = old.slicedb_id,
                        slice = %key,
                        error = %e,
                        "Failed to remove stale slice copy"
                    );
                }
                inner.active
            }
            Some(old) => old.slicedb_id,
            None => inner.active,
        };
        let slicedb = inner.slicedb(target)?;

        inner.put_location(key, &SliceLocation::new(target))?;
        slicedb.put(key, &slice.data).map_err(|e| {
            error!(bucket_id = self.id, slicedb_id = target, slice = %key, error = %e, "Slice write failed");
            e
        })?;

        trace!(
            bucket_id = self.id,
            slicedb_id = target,
            slice = %key,
            size = slice.size(),
            "Wrote slice"
        );
        Ok(())
    }

    /// Read a slice; `None` when no metadata exists or the payload is missing
    pub fn read(&self, key: &SliceKey) -> Result<Option<Bytes>> {
        let inner = self.inner.lock();
        let Some(location) = inner.location(key)? else {
            return Ok(None);
        };
        match inner.slicedb(location.slicedb_id)?.get(key)? {
            Some(data) => Ok(Some(Bytes::from(data))),
            None => {
                warn!(
                    bucket_id = self.id,
                    slicedb_id = location.slicedb_id,
                    slice = %key,
                    "Metadata points to a missing slice"
                );
                Ok(None)
            }
        }
    }

    /// Delete a slice and its metadata record; `false` when unknown
    pub fn delete(&self, key: &SliceKey) -> Result<bool> {
        let inner = self.inner.lock();
        let Some(location) = inner.location(key)? else {
            return Ok(false);
        };
        if !inner.slicedb(location.slicedb_id)?.delete(key)? {
            debug!(bucket_id = self.id, slice = %key, "Deleting slice with no payload");
        }
        inner.metadata.delete(&key.to_bytes())?;
        trace!(bucket_id = self.id, slicedb_id = location.slicedb_id, slice = %key, "Deleted slice");
        Ok(true)
    }

    pub fn stats(&self) -> Result<BucketDbStats> {
        let inner = self.inner.lock();
        let slicedb_sizes = inner
            .slicedbs
            .iter()
            .map(|db| Ok((db.id(), db.size()?)))
            .collect::<Result<Vec<_>>>()?;
        Ok(BucketDbStats {
            bucket_id: self.id,
            active_slicedb_id: inner.active,
            open_slicedbs: inner.slicedbs.len(),
            slicedb_sizes,
        })
    }

    /// Flush every slice database and the metadata database
    pub fn flush(&self) -> Result<()> {
        let inner = self.inner.lock();
        for slicedb in &inner.slicedbs {
            slicedb.flush()?;
        }
        inner.metadata.flush()
    }

    /// Open the next slice database and make it active.
    ///
    /// The new id is persisted before it becomes active; on any failure the
    /// current active database stays in place.
    fn rotate(&self, inner: &mut Inner) -> Result<()> {
        let next = inner.active + 1;
        let slicedb = SliceDb::open(self.config.backend, &self.root_dir, next).map_err(|e| {
            error!(bucket_id = self.id, slicedb_id = next, error = %e, "SliceDB create failed");
            e
        })?;

        let raw = bincode::serialize(&next)
            .map_err(|e| Error::Serialization(format!("active slicedb id: {e}")))?;
        inner.metadata.put(ACTIVE_SLICEDB_KEY, &raw).map_err(|e| {
            error!(bucket_id = self.id, slicedb_id = next, error = %e, "Save active_slicedb_id failed");
            e
        })?;

        inner.slicedbs.push(slicedb);
        inner.active = next;
        info!(bucket_id = self.id, active_slicedb_id = next, "Rotated active slicedb");
        Ok(())
    }
}

impl Drop for BucketDb {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            warn!(bucket_id = self.id, error = %e, "Failed to flush bucket storage on close");
        }
    }
}

impl std::fmt::Debug for BucketDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BucketDb")
            .field("id", &self.id)
            .field("root_dir", &self.root_dir)
            .field("backend", &self.config.backend)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::RngCore;
    use sliceio_common::StorageBackend;
    use tempfile::tempdir;

    fn config(backend: StorageBackend, max_dbsize: u64) -> StorageConfig {
        StorageConfig {
            backend,
            max_dbsize,
        }
    }

    fn slice(key: &str, data: &[u8]) -> Slice {
        Slice::new(SliceKey::for_key(key.as_bytes(), 0), data.to_vec())
    }

    fn key(key: &str) -> SliceKey {
        SliceKey::for_key(key.as_bytes(), 0)
    }

    fn random_payload(len: usize) -> Vec<u8> {
        let mut payload = vec![0u8; len];
        rand::thread_rng().fill_bytes(&mut payload);
        payload
    }

    /// Active id is the largest opened id and the list is gap-free
    fn assert_single_active(db: &BucketDb) {
        let stats = db.stats().unwrap();
        assert_eq!(stats.open_slicedbs, stats.active_slicedb_id as usize + 1);
        let ids: Vec<_> = stats.slicedb_sizes.iter().map(|(id, _)| *id).collect();
        let expected: Vec<_> = (0..=stats.active_slicedb_id).collect();
        assert_eq!(ids, expected);
    }

    #[test]
    fn test_write_then_read() {
        let dir = tempdir().unwrap();
        let db = BucketDb::open(dir.path(), 1, &config(StorageBackend::Redb, 1 << 30)).unwrap();
        assert!(db.root_dir().ends_with("0001"));
        assert!(db.root_dir().join(METADATA_DBNAME).exists());
        assert!(db.root_dir().join("slice-000").exists());

        let payload = random_payload(4096);
        db.write(&slice("alpha", &payload)).unwrap();
        assert_eq!(db.read(&key("alpha")).unwrap().as_deref(), Some(&payload[..]));
        assert_eq!(db.read(&key("beta")).unwrap(), None);
        assert_eq!(db.location(&key("alpha")).unwrap(), Some(SliceLocation::new(0)));
    }

    #[test]
    fn test_overwrite_replaces_payload() {
        let dir = tempdir().unwrap();
        let db = BucketDb::open(dir.path(), 0, &config(StorageBackend::Memory, 1 << 20)).unwrap();
        db.write(&slice("k", b"first")).unwrap();
        db.write(&slice("k", b"second")).unwrap();
        assert_eq!(db.read(&key("k")).unwrap().as_deref(), Some(&b"second"[..]));
    }

    #[test]
    fn test_rotation_preserves_reads() {
        let dir = tempdir().unwrap();
        let db = BucketDb::open(dir.path(), 0, &config(StorageBackend::LogFile, 1024)).unwrap();

        let payloads: Vec<_> = (0..50).map(|_| random_payload(100)).collect();
        for (i, payload) in payloads.iter().enumerate() {
            db.write(&slice(&format!("key-{i}"), payload)).unwrap();
            assert_single_active(&db);
        }

        let stats = db.stats().unwrap();
        assert!(
            stats.active_slicedb_id >= 2,
            "expected at least two rotations, got {stats:?}"
        );
        for (i, payload) in payloads.iter().enumerate() {
            let read = db.read(&key(&format!("key-{i}"))).unwrap();
            assert_eq!(read.as_deref(), Some(&payload[..]), "key-{i} lost");
        }

        // Only the active database may exceed the rotation threshold
        let threshold = 1024 * 9 / 10;
        for (id, size) in &stats.slicedb_sizes {
            if *id != stats.active_slicedb_id {
                assert!(*size > threshold, "slicedb {id} rotated early at {size} bytes");
            }
        }
    }

    #[test]
    fn test_reopen_restores_state() {
        let dir = tempdir().unwrap();
        let storage = config(StorageBackend::LogFile, 1024);
        let payloads: Vec<_> = (0..30).map(|_| random_payload(100)).collect();

        let active = {
            let db = BucketDb::open(dir.path(), 7, &storage).unwrap();
            for (i, payload) in payloads.iter().enumerate() {
                db.write(&slice(&format!("key-{i}"), payload)).unwrap();
            }
            db.active_slicedb_id()
        };
        assert!(active > 0);

        let db = BucketDb::open(dir.path(), 7, &storage).unwrap();
        assert_eq!(db.active_slicedb_id(), active);
        assert_single_active(&db);
        for (i, payload) in payloads.iter().enumerate() {
            let read = db.read(&key(&format!("key-{i}"))).unwrap();
            assert_eq!(read.as_deref(), Some(&payload[..]));
        }
    }

    #[test]
    fn test_existing_key_stays_in_older_slicedb() {
        let dir = tempdir().unwrap();
        let db = BucketDb::open(dir.path(), 0, &config(StorageBackend::Memory, 1000)).unwrap();

        db.write(&slice("home", &[1u8; 100])).unwrap();
        let mut i = 0;
        while db.active_slicedb_id() < 1 {
            db.write(&slice(&format!("filler-{i}"), &[0u8; 100])).unwrap();
            i += 1;
        }
        assert_eq!(db.location(&key("home")).unwrap(), Some(SliceLocation::new(0)));

        // Slice database 1 is nearly empty, so no rotation happens here
        db.write(&slice("home", &[2u8; 100])).unwrap();
        assert_eq!(db.location(&key("home")).unwrap(), Some(SliceLocation::new(0)));
        assert_eq!(db.read(&key("home")).unwrap().as_deref(), Some(&[2u8; 100][..]));
    }

    #[test]
    fn test_rewrite_moves_key_out_of_full_slicedb() {
        let dir = tempdir().unwrap();
        let db = BucketDb::open(dir.path(), 0, &config(StorageBackend::Memory, 1000)).unwrap();

        // Fill slice database 0 right up to the threshold
        db.write(&slice("mover", &[1u8; 100])).unwrap();
        let mut i = 0;
        loop {
            let size = db.stats().unwrap().slicedb_sizes[0].1;
            if db.config.needs_rotation(size) {
                break;
            }
            db.write(&slice(&format!("filler-{i}"), &[0u8; 100])).unwrap();
            i += 1;
        }
        assert_eq!(db.active_slicedb_id(), 0);

        // This write rotates; the key's home was the full database
        db.write(&slice("mover", &[9u8; 100])).unwrap();
        assert_eq!(db.active_slicedb_id(), 1);
        assert_eq!(db.location(&key("mover")).unwrap(), Some(SliceLocation::new(1)));
        assert_eq!(db.read(&key("mover")).unwrap().as_deref(), Some(&[9u8; 100][..]));

        let inner = db.inner.lock();
        assert_eq!(inner.slicedbs[0].get(&key("mover")).unwrap(), None);
    }

    #[test]
    fn test_delete_removes_payload_and_metadata() {
        let dir = tempdir().unwrap();
        let db = BucketDb::open(dir.path(), 0, &config(StorageBackend::LogFile, 1 << 20)).unwrap();

        db.write(&slice("gone", b"payload")).unwrap();
        assert!(db.delete(&key("gone")).unwrap());
        assert_eq!(db.read(&key("gone")).unwrap(), None);
        assert_eq!(db.location(&key("gone")).unwrap(), None);
        assert!(!db.delete(&key("gone")).unwrap());
        assert!(!db.delete(&key("never")).unwrap());

        db.write(&slice("gone", b"again")).unwrap();
        assert_eq!(db.read(&key("gone")).unwrap().as_deref(), Some(&b"again"[..]));
    }

    #[test]
    fn test_failed_rotation_keeps_serving() {
        let dir = tempdir().unwrap();
        let db = BucketDb::open(dir.path(), 0, &config(StorageBackend::LogFile, 1024)).unwrap();

        // A directory where slice-001 should go makes the next open fail
        let blocker = db.root_dir().join("slice-001");
        std::fs::create_dir_all(&blocker).unwrap();

        let mut written = Vec::new();
        let mut failed = false;
        for i in 0..20 {
            let name = format!("key-{i}");
            if db.write(&slice(&name, &[i as u8; 100])).is_err() {
                failed = true;
                break;
            }
            written.push(name);
        }
        assert!(failed, "rotation into a directory should fail");
        assert_eq!(db.active_slicedb_id(), 0);
        for name in &written {
            assert!(db.read(&key(name)).unwrap().is_some());
        }

        std::fs::remove_dir(&blocker).unwrap();
        db.write(&slice("after", b"recovered")).unwrap();
        assert_eq!(db.active_slicedb_id(), 1);
        assert_eq!(db.read(&key("after")).unwrap().as_deref(), Some(&b"recovered"[..]));
    }

    #[test]
    fn test_open_fails_when_metadata_unavailable() {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("0003").join(METADATA_DBNAME)).unwrap();
        let err = BucketDb::open(dir.path(), 3, &config(StorageBackend::LogFile, 1024)).unwrap_err();
        assert!(matches!(err, Error::Metadata(_)), "{err}");
    }

    #[test]
    fn test_null_backend_accepts_and_forgets() {
        let dir = tempdir().unwrap();
        let db = BucketDb::open(dir.path(), 0, &config(StorageBackend::None, 1024)).unwrap();
        db.write(&slice("k", b"v")).unwrap();
        assert_eq!(db.read(&key("k")).unwrap(), None);
        assert!(!db.delete(&key("k")).unwrap());
        assert_eq!(db.active_slicedb_id(), 0);
    }
}
