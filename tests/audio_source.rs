//! Range-serving behavior: disk-first reads, gap fetching, and
//! resolution reuse across requests.

mod common;

use std::{
    path::Path,
    sync::{atomic::Ordering, Arc},
    time::Duration,
};

use cadenza::{
    cache::ResolutionCache,
    db::MetadataStore,
    platform::Platform,
    resolver::StreamResolver,
    source::AudioSource,
    store::StreamStore,
    track::{Connectivity, QualityPreference, TrackId},
};

use common::{audio_response, expect_bytes, FakePlatform, FixedTransformer};

async fn make_source(platform: Arc<FakePlatform>, dir: &Path) -> (AudioSource, Arc<MetadataStore>) {
    let store = Arc::new(
        StreamStore::open(&dir.join("streams"), 64 * 1024 * 1024)
            .await
            .unwrap(),
    );
    let cache = Arc::new(ResolutionCache::new(16));
    let dyn_platform: Arc<dyn Platform> = platform;
    let resolver = Arc::new(StreamResolver::new(
        Arc::clone(&dyn_platform),
        Arc::new(FixedTransformer),
    ));
    let db = Arc::new(MetadataStore::open(&dir.join("meta.db")).await.unwrap());
    let source = AudioSource::new(
        store,
        cache,
        resolver,
        dyn_platform,
        Arc::clone(&db),
        QualityPreference::Auto,
        Connectivity::Unmetered,
        Duration::from_secs(5),
    );
    (source, db)
}

#[tokio::test]
async fn covered_range_is_served_without_network() {
    let dir = tempfile::tempdir().unwrap();
    let platform = Arc::new(FakePlatform::new());
    let track_id: TrackId = "covered".parse().unwrap();
    platform.serve(&track_id, audio_response(128_000, 4096));

    let (source, _db) = make_source(Arc::clone(&platform), dir.path()).await;

    // Populate the store.
    let first = source.fetch(&track_id, 0, 1024).await.unwrap();
    assert_eq!(first, expect_bytes(0, 1024));
    let responses_after_fill = platform.response_calls.load(Ordering::SeqCst);
    let ranges_after_fill = platform.range_calls.load(Ordering::SeqCst);

    // A fully covered range touches neither resolver nor network.
    let again = source.fetch(&track_id, 100, 900).await.unwrap();
    assert_eq!(again, expect_bytes(100, 900));
    assert_eq!(
        platform.response_calls.load(Ordering::SeqCst),
        responses_after_fill
    );
    assert_eq!(platform.range_calls.load(Ordering::SeqCst), ranges_after_fill);
}

#[tokio::test]
async fn partial_coverage_fetches_only_the_gaps() {
    let dir = tempfile::tempdir().unwrap();
    let platform = Arc::new(FakePlatform::new());
    let track_id: TrackId = "gappy".parse().unwrap();
    platform.serve(&track_id, audio_response(128_000, 65536));

    let (source, _db) = make_source(Arc::clone(&platform), dir.path()).await;

    source.fetch(&track_id, 0, 1000).await.unwrap();
    source.fetch(&track_id, 2000, 3000).await.unwrap();
    let ranges_before = platform.range_calls.load(Ordering::SeqCst);

    // Spans both cached pieces and the hole between them.
    let stitched = source.fetch(&track_id, 500, 2500).await.unwrap();
    assert_eq!(stitched, expect_bytes(500, 2500));

    // Exactly one more range request, for the hole.
    assert_eq!(
        platform.range_calls.load(Ordering::SeqCst),
        ranges_before + 1
    );
}

#[tokio::test]
async fn second_request_reuses_the_cached_resolution() {
    let dir = tempfile::tempdir().unwrap();
    let platform = Arc::new(FakePlatform::new());
    let track_id: TrackId = "reused".parse().unwrap();
    platform.serve(&track_id, audio_response(128_000, 65536));

    let (source, _db) = make_source(Arc::clone(&platform), dir.path()).await;

    source.fetch(&track_id, 0, 1000).await.unwrap();
    source.fetch(&track_id, 5000, 6000).await.unwrap();

    // Both requests needed the stream URL, but only the first resolved.
    assert_eq!(platform.response_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn range_past_stream_length_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let platform = Arc::new(FakePlatform::new());
    let track_id: TrackId = "short".parse().unwrap();
    platform.serve(&track_id, audio_response(128_000, 1000));

    let (source, _db) = make_source(Arc::clone(&platform), dir.path()).await;

    assert!(source.fetch(&track_id, 500, 2000).await.is_err());
}

#[tokio::test]
async fn empty_range_yields_no_bytes_and_no_traffic() {
    let dir = tempfile::tempdir().unwrap();
    let platform = Arc::new(FakePlatform::new());
    let track_id: TrackId = "empty".parse().unwrap();
    platform.serve(&track_id, audio_response(128_000, 1000));

    let (source, _db) = make_source(Arc::clone(&platform), dir.path()).await;

    let bytes = source.fetch(&track_id, 42, 42).await.unwrap();
    assert!(bytes.is_empty());
    assert_eq!(platform.response_calls.load(Ordering::SeqCst), 0);
    assert_eq!(platform.range_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn store_contents_survive_reopening() {
    let dir = tempfile::tempdir().unwrap();
    let track_id: TrackId = "persisted".parse().unwrap();

    {
        let platform = Arc::new(FakePlatform::new());
        platform.serve(&track_id, audio_response(128_000, 4096));
        let (source, _db) = make_source(Arc::clone(&platform), dir.path()).await;
        source.fetch(&track_id, 0, 2048).await.unwrap();
    }

    // A fresh stack over the same directory serves the range cold,
    // without any network.
    let platform = Arc::new(FakePlatform::new());
    platform.serve(&track_id, audio_response(128_000, 4096));
    let (source, _db) = make_source(Arc::clone(&platform), dir.path()).await;

    let bytes = source.fetch(&track_id, 0, 2048).await.unwrap();
    assert_eq!(bytes, expect_bytes(0, 2048));
    assert_eq!(platform.response_calls.load(Ordering::SeqCst), 0);
    assert_eq!(platform.range_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn missing_data_file_degrades_to_network_streaming() {
    let dir = tempfile::tempdir().unwrap();
    let platform = Arc::new(FakePlatform::new());
    let track_id: TrackId = "phantom".parse().unwrap();
    platform.serve(&track_id, audio_response(128_000, 4096));

    let (source, _db) = make_source(Arc::clone(&platform), dir.path()).await;
    source.fetch(&track_id, 0, 1024).await.unwrap();
    let ranges_before = platform.range_calls.load(Ordering::SeqCst);

    // The index still claims [0, 1024) but the bytes are gone.
    std::fs::remove_file(dir.path().join("streams").join(track_id.as_str())).unwrap();

    let bytes = source.fetch(&track_id, 100, 200).await.unwrap();
    assert_eq!(bytes, expect_bytes(100, 200));
    assert!(platform.range_calls.load(Ordering::SeqCst) > ranges_before);

    // The stale claim was dropped and the refetch cached normally, so
    // a repeat is served from disk again.
    let ranges_after = platform.range_calls.load(Ordering::SeqCst);
    let again = source.fetch(&track_id, 100, 200).await.unwrap();
    assert_eq!(again, expect_bytes(100, 200));
    assert_eq!(platform.range_calls.load(Ordering::SeqCst), ranges_after);
}

#[tokio::test]
async fn playback_resolution_is_recorded() {
    let dir = tempfile::tempdir().unwrap();
    let platform = Arc::new(FakePlatform::new());
    let track_id: TrackId = "recorded".parse().unwrap();
    platform.serve(&track_id, audio_response(128_000, 4096));

    let (source, db) = make_source(Arc::clone(&platform), dir.path()).await;
    source.fetch(&track_id, 0, 512).await.unwrap();

    // Resolving for plain playback already lands the metadata rows.
    let record = db.format_record(&track_id).await.unwrap().unwrap();
    assert_eq!(record.itag, 251);
    assert_eq!(record.bitrate, 128_000);
    assert_eq!(
        record.playback_url.as_deref(),
        Some("https://api.test.invalid/playback")
    );

    // Playback alone is not a download; no stamp yet.
    assert_eq!(db.downloaded_at(&track_id).await.unwrap(), None);
}
