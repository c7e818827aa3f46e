//! The content-addressed artifact store.

use std::fmt;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use fs4::FileExt;
use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use kiln_core::{Clock, Digest};

use crate::error::{StoreError, StoreResult};
use crate::index::EvictionIndex;

/// Subdirectory holding artifact files, sharded by digest prefix.
const OBJECTS_DIR: &str = "objects";

/// Advisory lock file marking the owning process.
const LOCK_FILE: &str = "lock";

/// Gzip stream magic. Compressed entries are recognized by sniffing this on
/// read, so a store reopened with a different `compress` setting still reads
/// every entry. Committed payloads are the daemon's artifact container, whose
/// own magic never collides with it.
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

struct Inner {
    index: EvictionIndex,
    /// Bytes promised to reservations that have not yet committed.
    pending: u64,
}

struct Shared {
    objects: PathBuf,
    budget: u64,
    compress: bool,
    inner: Mutex<Inner>,
    evictions: AtomicU64,
    temp_seq: AtomicU64,
    clock: Arc<dyn Clock>,
}

impl Shared {
    fn entry_dir(&self, digest: &Digest) -> PathBuf {
        self.objects.join(digest.shard_prefix())
    }

    fn entry_path(&self, digest: &Digest) -> PathBuf {
        self.entry_dir(digest).join(digest.shard_rest())
    }
}

/// A pre-commit claim on store capacity.
///
/// Created by [`ArtifactStore::reserve`]; the reserved bytes are returned to
/// the budget when the reservation is committed, discarded, or dropped on any
/// other exit path.
pub struct Reservation {
    shared: Arc<Shared>,
    digest: Digest,
    size: u64,
    consumed: bool,
}

impl fmt::Debug for Reservation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reservation")
            .field("digest", &self.digest)
            .field("size", &self.size)
            .field("consumed", &self.consumed)
            .finish_non_exhaustive()
    }
}

impl Reservation {
    pub fn digest(&self) -> &Digest {
        &self.digest
    }

    pub fn size(&self) -> u64 {
        self.size
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if !self.consumed {
            self.shared.inner.lock().pending -= self.size;
        }
    }
}

/// Read access to one committed artifact.
#[derive(Debug, Clone)]
pub struct ReadHandle {
    digest: Digest,
    path: PathBuf,
    size: u64,
}

impl ReadHandle {
    pub fn digest(&self) -> &Digest {
        &self.digest
    }

    /// On-disk size in bytes (post-compression).
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads and, if needed, decompresses the artifact payload.
    pub async fn read(&self) -> StoreResult<Vec<u8>> {
        let bytes = tokio::fs::read(&self.path)
            .await
            .map_err(|e| StoreError::io(&self.path, e))?;
        if bytes.len() as u64 != self.size {
            return Err(StoreError::Corrupted {
                digest: self.digest.to_string(),
                details: format!("expected {} bytes on disk, found {}", self.size, bytes.len()),
            });
        }
        if bytes.starts_with(&GZIP_MAGIC) {
            gzip_decode(&bytes).map_err(|e| StoreError::Corrupted {
                digest: self.digest.to_string(),
                details: format!("gzip decode failed: {e}"),
            })
        } else {
            Ok(bytes)
        }
    }

    /// Writes the decoded payload to a caller-requested path.
    pub async fn materialize(&self, dest: &Path) -> StoreResult<()> {
        let bytes = self.read().await?;
        tokio::fs::write(dest, &bytes)
            .await
            .map_err(|e| StoreError::io(dest, e))
    }
}

/// On-disk content-addressed store with bounded capacity.
///
/// Inserts follow a reserve/commit protocol: [`reserve`](Self::reserve)
/// evicts least-recently-used entries until the incoming artifact fits, then
/// [`commit`](Self::commit) materializes it with a temp-file write and an
/// atomic rename. Lookups touch the eviction record. Read paths are
/// fail-safe; invalid entries are deleted and reported as misses.
pub struct ArtifactStore {
    shared: Arc<Shared>,
    /// Serializes reserve-plus-eviction against concurrent reservations.
    reserve_gate: tokio::sync::Mutex<()>,
    /// Held for the lifetime of the store; releases the advisory lock on drop.
    _lock_file: fs::File,
}

impl fmt::Debug for ArtifactStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArtifactStore").finish_non_exhaustive()
    }
}

impl ArtifactStore {
    /// Opens the store, taking ownership of the directory.
    ///
    /// Creates the layout if missing, takes the advisory lock (failing with
    /// [`StoreError::LockHeld`] when another process owns the store), and
    /// rebuilds the eviction index by scanning `objects/`. Entries with a
    /// malformed name are deleted; last access is seeded from file mtime.
    pub fn open(
        root: &Path,
        budget: u64,
        compress: bool,
        clock: Arc<dyn Clock>,
    ) -> StoreResult<Self> {
        let objects = root.join(OBJECTS_DIR);
        fs::create_dir_all(&objects).map_err(|e| StoreError::Unavailable {
            path: root.to_path_buf(),
            message: e.to_string(),
        })?;

        let lock_path = root.join(LOCK_FILE);
        let lock_file = fs::OpenOptions::new()
            .create(true)
            .write(true)
            .open(&lock_path)
            .map_err(|e| StoreError::Unavailable {
                path: lock_path.clone(),
                message: e.to_string(),
            })?;
        if let Err(e) = lock_file.try_lock_exclusive() {
            if e.kind() == std::io::ErrorKind::WouldBlock {
                return Err(StoreError::LockHeld { path: lock_path });
            }
            return Err(StoreError::Unavailable {
                path: lock_path,
                message: e.to_string(),
            });
        }

        let index = scan_objects(&objects)?;
        info!(
            entries = index.len(),
            bytes = index.total_bytes(),
            root = %root.display(),
            "artifact store opened"
        );

        Ok(Self {
            shared: Arc::new(Shared {
                objects,
                budget,
                compress,
                inner: Mutex::new(Inner { index, pending: 0 }),
                evictions: AtomicU64::new(0),
                temp_seq: AtomicU64::new(0),
                clock,
            }),
            reserve_gate: tokio::sync::Mutex::new(()),
            _lock_file: lock_file,
        })
    }

    /// Looks up an artifact, touching its eviction record on a hit.
    ///
    /// An entry whose on-disk size disagrees with the index is invalid: it is
    /// deleted and the lookup reports a miss.
    pub async fn lookup(&self, digest: &Digest) -> Option<ReadHandle> {
        let size = self.shared.inner.lock().index.get(digest).map(|m| m.size)?;
        let path = self.shared.entry_path(digest);
        match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.len() == size => {
                let now = self.shared.clock.now_ns();
                self.shared.inner.lock().index.touch(digest, now);
                Some(ReadHandle {
                    digest: *digest,
                    path,
                    size,
                })
            }
            Ok(meta) => {
                warn!(
                    digest = %digest,
                    index_size = size,
                    disk_size = meta.len(),
                    "entry size mismatch, deleting"
                );
                self.delete(digest).await;
                None
            }
            Err(e) => {
                warn!(digest = %digest, error = %e, "entry unreadable, deleting");
                self.delete(digest).await;
                None
            }
        }
    }

    /// Declares intent to insert `size` payload bytes for `digest`.
    ///
    /// Evicts least-recent entries until the reservation fits. Fails with
    /// [`StoreError::BudgetExceeded`] only when `size` exceeds the budget
    /// outright, or when the index is empty and outstanding reservations
    /// still leave no room.
    pub async fn reserve(&self, digest: Digest, size: u64) -> StoreResult<Reservation> {
        if size > self.shared.budget {
            return Err(StoreError::BudgetExceeded {
                requested: size,
                budget: self.shared.budget,
            });
        }

        let _gate = self.reserve_gate.lock().await;
        self.evict_until_fits(size).await?;
        self.shared.inner.lock().pending += size;
        Ok(Reservation {
            shared: Arc::clone(&self.shared),
            digest,
            size,
            consumed: false,
        })
    }

    /// Atomically materializes an artifact under its content-addressed path.
    ///
    /// The payload is written to a temp name in the entry's shard directory,
    /// fsynced, renamed into place, and verified by size read-back. Any
    /// failure leaves no residue: the temp file is removed and the
    /// reservation released. A compressed payload that outgrows both its
    /// reservation and the evictable budget fails with
    /// [`StoreError::BudgetExceeded`] before anything touches the disk.
    pub async fn commit(&self, mut reservation: Reservation, payload: &[u8]) -> StoreResult<ReadHandle> {
        let digest = reservation.digest;
        let encoded: Vec<u8> = if self.shared.compress {
            gzip_encode(payload)
        } else {
            payload.to_vec()
        };
        let disk_size = encoded.len() as u64;

        // Incompressible payloads can expand under gzip past the reserved
        // size. Make room for the difference and grow the reservation to the
        // real on-disk footprint before writing, so the budget invariant
        // never depends on evicting the entry being committed.
        if disk_size > reservation.size {
            let _gate = self.reserve_gate.lock().await;
            let delta = disk_size - reservation.size;
            self.evict_until_fits(delta).await?;
            self.shared.inner.lock().pending += delta;
            reservation.size = disk_size;
        }

        let dir = self.shared.entry_dir(&digest);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| StoreError::io(&dir, e))?;

        let temp = dir.join(format!(
            ".{}.tmp{}",
            digest.shard_rest(),
            self.shared.temp_seq.fetch_add(1, Ordering::Relaxed)
        ));
        if let Err(e) = write_sync_all(&temp, &encoded).await {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(StoreError::io(&temp, e));
        }

        let dest = self.shared.entry_path(&digest);
        if let Err(e) = tokio::fs::rename(&temp, &dest).await {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(StoreError::io(&dest, e));
        }

        match tokio::fs::metadata(&dest).await {
            Ok(meta) if meta.len() == disk_size => {}
            Ok(meta) => {
                let found = meta.len();
                let _ = tokio::fs::remove_file(&dest).await;
                return Err(StoreError::Corrupted {
                    digest: digest.to_string(),
                    details: format!("wrote {disk_size} bytes, read back {found}"),
                });
            }
            Err(e) => {
                let _ = tokio::fs::remove_file(&dest).await;
                return Err(StoreError::io(&dest, e));
            }
        }

        let reserved = reservation.size;
        {
            let mut inner = self.shared.inner.lock();
            inner.pending -= reserved;
            reservation.consumed = true;
            inner.index.insert(digest, disk_size, self.shared.clock.now_ns());
        }
        debug!(digest = %digest, bytes = disk_size, "artifact committed");

        Ok(ReadHandle {
            digest,
            path: dest,
            size: disk_size,
        })
    }

    /// Releases a reservation without publishing anything.
    pub fn discard(&self, reservation: Reservation) {
        drop(reservation);
    }

    /// Explicitly removes an entry. Returns `true` if it was indexed.
    pub async fn delete(&self, digest: &Digest) -> bool {
        let removed = self.shared.inner.lock().index.remove(digest).is_some();
        let path = self.shared.entry_path(digest);
        if let Err(e) = tokio::fs::remove_file(&path).await {
            if removed {
                warn!(digest = %digest, error = %e, "failed to remove entry file");
            }
        }
        removed
    }

    pub fn contains(&self, digest: &Digest) -> bool {
        self.shared.inner.lock().index.contains(digest)
    }

    /// Indexed bytes on disk.
    pub fn occupancy(&self) -> u64 {
        self.shared.inner.lock().index.total_bytes()
    }

    pub fn entry_count(&self) -> usize {
        self.shared.inner.lock().index.len()
    }

    pub fn budget(&self) -> u64 {
        self.shared.budget
    }

    /// Entries evicted since the store was opened.
    pub fn evictions(&self) -> u64 {
        self.shared.evictions.load(Ordering::Relaxed)
    }

    async fn evict_until_fits(&self, incoming: u64) -> StoreResult<()> {
        loop {
            let victim = {
                let mut inner = self.shared.inner.lock();
                let used = inner.index.total_bytes() + inner.pending;
                if used + incoming <= self.shared.budget {
                    return Ok(());
                }
                inner.index.pop_least_recent()
            };
            match victim {
                Some((digest, meta)) => {
                    debug!(digest = %digest, bytes = meta.size, "evicting");
                    self.shared.evictions.fetch_add(1, Ordering::Relaxed);
                    let path = self.shared.entry_path(&digest);
                    if let Err(e) = tokio::fs::remove_file(&path).await {
                        warn!(digest = %digest, error = %e, "failed to remove evicted entry");
                    }
                }
                None => {
                    return Err(StoreError::BudgetExceeded {
                        requested: incoming,
                        budget: self.shared.budget,
                    });
                }
            }
        }
    }
}

async fn write_sync_all(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = tokio::fs::File::create(path).await?;
    file.write_all(bytes).await?;
    file.sync_all().await?;
    Ok(())
}

/// Rebuilds the eviction index from the on-disk layout.
///
/// Walks `objects/<2-hex>/<30-hex>`; anything with a malformed name
/// (including temp files left by a crash) is deleted. Recency is seeded by
/// mtime, ties by discovery order.
fn scan_objects(objects: &Path) -> StoreResult<EvictionIndex> {
    let mut found: Vec<(u128, Digest, u64)> = Vec::new();

    let shards = fs::read_dir(objects).map_err(|e| StoreError::io(objects, e))?;
    for shard in shards {
        let shard = shard.map_err(|e| StoreError::io(objects, e))?;
        let shard_path = shard.path();
        let shard_name = shard.file_name().to_string_lossy().into_owned();
        if !shard_path.is_dir() || shard_name.len() != 2 || !is_lower_hex(&shard_name) {
            warn!(path = %shard_path.display(), "removing foreign file in objects root");
            remove_any(&shard_path);
            continue;
        }

        let entries = fs::read_dir(&shard_path).map_err(|e| StoreError::io(&shard_path, e))?;
        for entry in entries {
            let entry = entry.map_err(|e| StoreError::io(&shard_path, e))?;
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().into_owned();
            let digest: Option<Digest> = format!("{shard_name}{name}").parse().ok();
            let Some(digest) = digest.filter(|_| path.is_file()) else {
                warn!(path = %path.display(), "removing malformed store entry");
                remove_any(&path);
                continue;
            };

            let meta = fs::metadata(&path).map_err(|e| StoreError::io(&path, e))?;
            let mtime_ns = meta
                .modified()
                .ok()
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map(|d| d.as_nanos())
                .unwrap_or(0);
            found.push((mtime_ns, digest, meta.len()));
        }
    }

    found.sort_by_key(|(mtime, _, _)| *mtime);
    let mut index = EvictionIndex::new();
    for (mtime_ns, digest, size) in found {
        index.insert(digest, size, mtime_ns as u64);
    }
    Ok(index)
}

fn is_lower_hex(s: &str) -> bool {
    s.bytes()
        .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

fn remove_any(path: &Path) {
    let result = if path.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    };
    if let Err(e) = result {
        warn!(path = %path.display(), error = %e, "failed to remove invalid path");
    }
}

fn gzip_encode(data: &[u8]) -> Vec<u8> {
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    // Writing into a Vec cannot fail.
    let _ = encoder.write_all(data);
    encoder.finish().unwrap_or_default()
}

fn gzip_decode(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut decoder = flate2::read::GzDecoder::new(data);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}
