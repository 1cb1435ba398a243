//! On-disk byte-range store for partially downloaded streams.
//!
//! One sparse data file per track plus a JSON index recording which
//! half-open byte spans of each file hold real data. A span only
//! becomes part of the index after its bytes are flushed to disk, so a
//! crash mid-write loses the bytes but never yields a covered range
//! with garbage in it.
//!
//! When the store grows past its capacity, whole extents are evicted
//! least-recently-used first; evicting part of a file is not worth the
//! bookkeeping.

use std::{
    collections::HashMap,
    io::SeekFrom,
    path::{Path, PathBuf},
    sync::{Mutex, PoisonError},
    time::{SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Serialize};
use tokio::{
    fs::{self, OpenOptions},
    io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt},
};

use crate::{
    error::{Error, Result},
    track::TrackId,
};

/// Name of the JSON file holding the range index, in the store root.
const INDEX_NAME: &str = "index.json";

/// A sorted set of disjoint half-open byte spans `[start, end)`.
///
/// Adjacent and overlapping spans merge on insert, so the set stays
/// minimal and `covers` is a single scan.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeSet {
    spans: Vec<(u64, u64)>,
}

impl RangeSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts `[start, end)`, merging with any touching spans.
    /// Empty ranges are ignored.
    pub fn insert(&mut self, start: u64, end: u64) {
        if start >= end {
            return;
        }

        let mut merged = (start, end);
        let mut out = Vec::with_capacity(self.spans.len() + 1);
        for &(s, e) in &self.spans {
            if e < merged.0 || s > merged.1 {
                out.push((s, e));
            } else {
                merged.0 = merged.0.min(s);
                merged.1 = merged.1.max(e);
            }
        }
        out.push(merged);
        out.sort_unstable();
        self.spans = out;
    }

    /// Whether `[start, end)` lies entirely within one recorded span.
    #[must_use]
    pub fn covers(&self, start: u64, end: u64) -> bool {
        if start >= end {
            return true;
        }
        self.spans.iter().any(|&(s, e)| s <= start && end <= e)
    }

    /// The sub-ranges of `[start, end)` not yet recorded, in order.
    #[must_use]
    pub fn missing(&self, start: u64, end: u64) -> Vec<(u64, u64)> {
        let mut gaps = Vec::new();
        let mut cursor = start;
        for &(s, e) in &self.spans {
            if e <= cursor {
                continue;
            }
            if s >= end {
                break;
            }
            if s > cursor {
                gaps.push((cursor, s.min(end)));
            }
            cursor = cursor.max(e);
            if cursor >= end {
                break;
            }
        }
        if cursor < end {
            gaps.push((cursor, end));
        }
        gaps
    }

    /// Total number of bytes recorded.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.spans.iter().map(|&(s, e)| e - s).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.spans.is_empty()
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct Extent {
    ranges: RangeSet,

    /// Seconds since the Unix epoch of the last read or write.
    last_used: u64,
}

impl Extent {
    fn touch(&mut self) {
        self.last_used = unix_now();
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs())
}

pub struct StreamStore {
    root: PathBuf,
    capacity: u64,
    index: Mutex<HashMap<TrackId, Extent>>,
}

impl StreamStore {
    /// Opens the store at `root`, creating the directory and loading
    /// the index. Index entries whose data file has gone missing are
    /// dropped rather than served as phantom coverage.
    pub async fn open(root: &Path, capacity: u64) -> Result<Self> {
        fs::create_dir_all(root).await?;

        let mut index: HashMap<TrackId, Extent> = match fs::read(root.join(INDEX_NAME)).await {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
                warn!("stream store index unreadable, starting empty: {e}");
                HashMap::new()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(e.into()),
        };

        let mut orphaned = Vec::new();
        for track_id in index.keys() {
            if !fs::try_exists(root.join(track_id.as_str())).await? {
                orphaned.push(track_id.clone());
            }
        }
        for track_id in orphaned {
            warn!("dropping index entry for {track_id}: data file missing");
            index.remove(&track_id);
        }

        Ok(Self {
            root: root.to_path_buf(),
            capacity,
            index: Mutex::new(index),
        })
    }

    /// Whether `[start, end)` of a track can be served from disk.
    #[must_use]
    pub fn covers(&self, track_id: &TrackId, start: u64, end: u64) -> bool {
        self.lock()
            .get(track_id)
            .is_some_and(|extent| extent.ranges.covers(start, end))
    }

    /// The sub-ranges of `[start, end)` that are not on disk.
    #[must_use]
    pub fn missing(&self, track_id: &TrackId, start: u64, end: u64) -> Vec<(u64, u64)> {
        match self.lock().get(track_id) {
            Some(extent) => extent.ranges.missing(start, end),
            None => vec![(start, end)],
        }
    }

    /// Reads `[start, end)` of a track. Returns `None` when the range
    /// is not fully covered; partial reads are the caller's job to
    /// stitch from `missing`.
    pub async fn read(&self, track_id: &TrackId, start: u64, end: u64) -> Result<Option<Vec<u8>>> {
        if !self.covers(track_id, start, end) {
            return Ok(None);
        }

        let mut file = fs::File::open(self.data_path(track_id)).await?;
        file.seek(SeekFrom::Start(start)).await?;
        let mut buf = vec![0; usize::try_from(end - start).map_err(Error::out_of_range)?];
        file.read_exact(&mut buf).await?;

        if let Some(extent) = self.lock().get_mut(track_id) {
            extent.touch();
        }

        Ok(Some(buf))
    }

    /// Writes `bytes` at `offset` of a track's data file. The range is
    /// marked covered only after the bytes are flushed, then the index
    /// is persisted and the store evicted back under capacity.
    pub async fn write(&self, track_id: &TrackId, offset: u64, bytes: &[u8]) -> Result<()> {
        if bytes.is_empty() {
            return Ok(());
        }

        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(self.data_path(track_id))
            .await?;
        file.seek(SeekFrom::Start(offset)).await?;
        file.write_all(bytes).await?;
        file.flush().await?;
        file.sync_data().await?;

        let end = offset + bytes.len() as u64;
        {
            let mut index = self.lock();
            let extent = index.entry(track_id.clone()).or_insert_with(|| Extent {
                ranges: RangeSet::new(),
                last_used: unix_now(),
            });
            extent.ranges.insert(offset, end);
            extent.touch();
        }

        let evicted = self.evict_over_capacity(track_id);
        for id in &evicted {
            if let Err(e) = fs::remove_file(self.data_path(id)).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("failed to remove evicted stream file for {id}: {e}");
                }
            }
        }

        self.persist_index().await
    }

    /// Drops a track's extent and data file. Used when the index
    /// claims coverage the disk can no longer back up; nothing here
    /// fails, the caller is already falling back to the network.
    pub async fn discard(&self, track_id: &TrackId) {
        if self.lock().remove(track_id).is_none() {
            return;
        }
        if let Err(e) = self.persist_index().await {
            warn!("failed to persist index after discarding {track_id}: {e}");
        }
        if let Err(e) = fs::remove_file(self.data_path(track_id)).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("failed to remove discarded stream file for {track_id}: {e}");
            }
        }
    }

    /// Bytes currently recorded across all extents.
    #[must_use]
    pub fn used(&self) -> u64 {
        self.lock().values().map(|extent| extent.ranges.len()).sum()
    }

    /// Evicts least-recently-used extents until the store fits its
    /// capacity, sparing the extent just written to. Returns the
    /// evicted ids so the caller can unlink their files.
    fn evict_over_capacity(&self, spare: &TrackId) -> Vec<TrackId> {
        let mut index = self.lock();
        let mut evicted = Vec::new();

        loop {
            let used: u64 = index.values().map(|extent| extent.ranges.len()).sum();
            if used <= self.capacity {
                break;
            }

            let Some(victim) = index
                .iter()
                .filter(|(id, _)| *id != spare)
                .min_by_key(|(_, extent)| extent.last_used)
                .map(|(id, _)| id.clone())
            else {
                break;
            };

            debug!("stream store over capacity, evicting {victim}");
            index.remove(&victim);
            evicted.push(victim);
        }

        evicted
    }

    async fn persist_index(&self) -> Result<()> {
        let json = {
            let index = self.lock();
            serde_json::to_vec(&*index)?
        };
        fs::write(self.root.join(INDEX_NAME), json).await?;
        Ok(())
    }

    fn data_path(&self, track_id: &TrackId) -> PathBuf {
        self.root.join(track_id.as_str())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<TrackId, Extent>> {
        self.index.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ranges_merge_on_insert() {
        let mut set = RangeSet::new();
        set.insert(0, 10);
        set.insert(20, 30);
        set.insert(10, 20);
        assert!(set.covers(0, 30));
        assert_eq!(set.len(), 30);
    }

    #[test]
    fn overlapping_inserts_do_not_double_count() {
        let mut set = RangeSet::new();
        set.insert(0, 100);
        set.insert(50, 150);
        assert_eq!(set.len(), 150);
        assert!(set.covers(0, 150));
        assert!(!set.covers(0, 151));
    }

    #[test]
    fn missing_reports_gaps_in_order() {
        let mut set = RangeSet::new();
        set.insert(10, 20);
        set.insert(40, 50);
        assert_eq!(set.missing(0, 60), vec![(0, 10), (20, 40), (50, 60)]);
        assert_eq!(set.missing(10, 20), Vec::new());
        assert_eq!(set.missing(15, 45), vec![(20, 40)]);
    }

    #[test]
    fn empty_range_is_trivially_covered() {
        let set = RangeSet::new();
        assert!(set.covers(5, 5));
        assert!(set.missing(5, 5).is_empty());
    }

    #[test]
    fn disjoint_spans_do_not_cover_their_gap() {
        let mut set = RangeSet::new();
        set.insert(0, 10);
        set.insert(20, 30);
        assert!(!set.covers(5, 25));
        assert!(set.covers(22, 28));
    }

    #[tokio::test]
    async fn over_capacity_evicts_the_older_extent_whole() {
        let dir = tempfile::tempdir().unwrap();
        let store = StreamStore::open(dir.path(), 1024).await.unwrap();
        let older: TrackId = "older".parse().unwrap();
        let newer: TrackId = "newer".parse().unwrap();

        store.write(&older, 0, &vec![1; 600]).await.unwrap();
        // The second write overflows the capacity; the write just made
        // is spared, leaving "older" as the only eviction candidate.
        store.write(&newer, 0, &vec![2; 600]).await.unwrap();

        assert!(!store.covers(&older, 0, 600));
        assert!(store.covers(&newer, 0, 600));
        assert!(store.used() <= 1024);
        assert!(!fs::try_exists(dir.path().join(older.as_str())).await.unwrap());

        // The eviction survives a reopen: the index on disk no longer
        // claims the evicted extent.
        drop(store);
        let reopened = StreamStore::open(dir.path(), 1024).await.unwrap();
        assert!(!reopened.covers(&older, 0, 600));
        assert!(reopened.covers(&newer, 0, 600));
    }

    #[tokio::test]
    async fn reopen_drops_claims_without_a_data_file() {
        let dir = tempfile::tempdir().unwrap();
        let track_id: TrackId = "vanished".parse().unwrap();
        {
            let store = StreamStore::open(dir.path(), 4096).await.unwrap();
            store.write(&track_id, 0, &[7; 256]).await.unwrap();
        }
        std::fs::remove_file(dir.path().join(track_id.as_str())).unwrap();

        let store = StreamStore::open(dir.path(), 4096).await.unwrap();
        assert!(!store.covers(&track_id, 0, 256));
        assert_eq!(store.missing(&track_id, 0, 256), vec![(0, 256)]);
    }

    #[tokio::test]
    async fn unreadable_index_starts_the_store_empty() {
        let dir = tempfile::tempdir().unwrap();
        let track_id: TrackId = "partial".parse().unwrap();
        {
            let store = StreamStore::open(dir.path(), 4096).await.unwrap();
            store.write(&track_id, 0, &[7; 256]).await.unwrap();
        }
        // A crash mid-persist leaves a truncated index; coverage is
        // lost but never fabricated.
        std::fs::write(dir.path().join(INDEX_NAME), b"{\"partial\":").unwrap();

        let store = StreamStore::open(dir.path(), 4096).await.unwrap();
        assert!(!store.covers(&track_id, 0, 256));
        assert_eq!(store.used(), 0);
    }

    #[tokio::test]
    async fn discard_removes_claim_and_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = StreamStore::open(dir.path(), 4096).await.unwrap();
        let track_id: TrackId = "doomed".parse().unwrap();

        store.write(&track_id, 0, &[9; 128]).await.unwrap();
        store.discard(&track_id).await;

        assert!(!store.covers(&track_id, 0, 128));
        assert!(!fs::try_exists(dir.path().join(track_id.as_str())).await.unwrap());

        // Discarding an unknown track is a no-op.
        store.discard(&track_id).await;
    }
}
