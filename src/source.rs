//! Range-addressed audio access: disk first, network for the gaps.
//!
//! A fully covered range is served from the store without touching the
//! resolver or the network at all. Anything else resolves the stream
//! (through the single-flight cache), fetches only the missing
//! sub-ranges, writes them through to disk, and stitches the reply
//! together. A disk write failure downgrades the request to uncached
//! but still serves the bytes, and a disk read failure under a covered
//! claim discards the claim and refetches from the network.

use std::{sync::Arc, time::Duration};

use crate::{
    cache::ResolutionCache,
    db::MetadataStore,
    error::{Error, Result},
    platform::Platform,
    resolver::{Resolution, ResolveError, StreamResolver},
    store::StreamStore,
    track::{Connectivity, QualityPreference, TrackId},
};

pub struct AudioSource {
    store: Arc<StreamStore>,
    cache: Arc<ResolutionCache>,
    resolver: Arc<StreamResolver>,
    platform: Arc<dyn Platform>,
    db: Arc<MetadataStore>,
    preference: QualityPreference,
    connectivity: Connectivity,
    resolve_timeout: Duration,
}

impl AudioSource {
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<StreamStore>,
        cache: Arc<ResolutionCache>,
        resolver: Arc<StreamResolver>,
        platform: Arc<dyn Platform>,
        db: Arc<MetadataStore>,
        preference: QualityPreference,
        connectivity: Connectivity,
        resolve_timeout: Duration,
    ) -> Self {
        Self {
            store,
            cache,
            resolver,
            platform,
            db,
            preference,
            connectivity,
            resolve_timeout,
        }
    }

    /// Resolves the stream for a track through the single-flight
    /// cache, under the configured timeout. Each fresh resolution
    /// persists its metadata; a database hiccup is logged but never
    /// blocks playback.
    pub async fn resolve(
        &self,
        track_id: &TrackId,
    ) -> std::result::Result<Resolution, ResolveError> {
        self.cache
            .get_or_resolve(track_id, || async {
                let resolution = self
                    .resolver
                    .resolve_timed(
                        track_id,
                        self.preference,
                        self.connectivity,
                        self.resolve_timeout,
                    )
                    .await?;
                if let Err(e) = self.persist_resolution(track_id, &resolution).await {
                    warn!("failed to persist metadata for {track_id}: {e}");
                }
                Ok(resolution)
            })
            .await
    }

    async fn persist_resolution(&self, track_id: &TrackId, resolution: &Resolution) -> Result<()> {
        self.db
            .upsert_format(
                track_id,
                &resolution.stream,
                resolution.itag,
                resolution.meta.playback_url.as_deref(),
            )
            .await?;
        self.db
            .upsert_song_if_absent(track_id, &resolution.meta)
            .await
    }

    /// Reads `[start, end)` of a track's audio, in stream byte order.
    ///
    /// Ranges past the stream's known content length are rejected as
    /// out of range rather than silently truncated.
    pub async fn fetch(&self, track_id: &TrackId, start: u64, end: u64) -> Result<Vec<u8>> {
        if start > end {
            return Err(Error::invalid_argument(format!(
                "range start {start} past end {end}"
            )));
        }
        if start == end {
            return Ok(Vec::new());
        }

        // Covered ranges never touch the resolver or the network. A
        // claim the disk cannot back up is dropped, and the request
        // degrades to a plain network fetch.
        match self.store.read(track_id, start, end).await {
            Ok(Some(bytes)) => return Ok(bytes),
            Ok(None) => {}
            Err(e) => {
                warn!("disk read for {track_id} failed, streaming from network: {e}");
                self.store.discard(track_id).await;
            }
        }

        let mut resolution = self.resolve(track_id).await?;
        if let Some(len) = resolution.stream.content_length {
            if end > len {
                return Err(Error::out_of_range(format!(
                    "range [{start}, {end}) exceeds stream length {len}"
                )));
            }
        }

        let gaps = self.store.missing(track_id, start, end);
        let mut fetched = Vec::with_capacity(gaps.len());
        for &(gap_start, gap_end) in &gaps {
            let bytes = self
                .fetch_gap(track_id, &mut resolution, gap_start, gap_end)
                .await?;
            if let Err(e) = self.store.write(track_id, gap_start, &bytes).await {
                warn!("serving {track_id} uncached, disk write failed: {e}");
            }
            fetched.push((gap_start, bytes));
        }

        self.assemble(track_id, &mut resolution, start, end, &gaps, fetched)
            .await
    }

    /// Fetches one missing sub-range, verifying its length. A failed
    /// fetch usually means the stream URL died early, so the cached
    /// resolution is dropped and the fetch retried once against a
    /// fresh one.
    async fn fetch_gap(
        &self,
        track_id: &TrackId,
        resolution: &mut Resolution,
        start: u64,
        end: u64,
    ) -> Result<Vec<u8>> {
        let bytes = match self
            .platform
            .fetch_range(&resolution.stream.url, start, end)
            .await
        {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("range fetch for {track_id} failed, refreshing stream url: {e}");
                self.cache.evict(track_id);
                *resolution = self.resolve(track_id).await?;
                self.platform
                    .fetch_range(&resolution.stream.url, start, end)
                    .await?
            }
        };

        if bytes.len() as u64 != end - start {
            return Err(Error::data_loss(format!(
                "short range response for {track_id}: got {} of {} bytes",
                bytes.len(),
                end - start
            )));
        }
        Ok(bytes)
    }

    /// Interleaves freshly fetched gap bytes with the covered pieces
    /// read back from disk.
    async fn assemble(
        &self,
        track_id: &TrackId,
        resolution: &mut Resolution,
        start: u64,
        end: u64,
        gaps: &[(u64, u64)],
        fetched: Vec<(u64, Vec<u8>)>,
    ) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(usize::try_from(end - start).map_err(Error::out_of_range)?);
        let mut cursor = start;

        for ((gap_start, gap_end), (_, bytes)) in gaps.iter().zip(fetched) {
            if *gap_start > cursor {
                out.extend(
                    self.covered_piece(track_id, resolution, cursor, *gap_start)
                        .await?,
                );
            }
            out.extend(bytes);
            cursor = *gap_end;
        }
        if cursor < end {
            out.extend(self.covered_piece(track_id, resolution, cursor, end).await?);
        }

        Ok(out)
    }

    /// Reads a piece the index claims is on disk. When the disk
    /// disagrees the claim is discarded and the piece fetched from
    /// the network instead; the caller already holds a resolution.
    async fn covered_piece(
        &self,
        track_id: &TrackId,
        resolution: &mut Resolution,
        start: u64,
        end: u64,
    ) -> Result<Vec<u8>> {
        match self.store.read(track_id, start, end).await {
            Ok(Some(bytes)) => return Ok(bytes),
            Ok(None) => {
                warn!("cached range [{start}, {end}) for {track_id} was evicted mid-read");
            }
            Err(e) => {
                warn!("cached range [{start}, {end}) for {track_id} unreadable, refetching: {e}");
                self.store.discard(track_id).await;
            }
        }
        self.fetch_gap(track_id, resolution, start, end).await
    }
}
