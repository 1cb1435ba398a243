//! Shared test doubles: an in-memory platform and a fixed signature
//! transformer, so no test ever touches the network.

// Not every test binary uses every helper.
#![allow(dead_code)]

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::{Duration, SystemTime},
};

use async_trait::async_trait;
use tokio::sync::Semaphore;
use url::Url;

use cadenza::{
    cipher::{CipherProgram, ExtractionError, SignatureTransformer},
    error::{Error, Result},
    platform::Platform,
    protocol::{Format, PlaybackTracking, PlayerResponse, StreamingData, VideoDetails},
    resolver::{Resolution, TrackMeta},
    track::{ResolvedStream, TrackId},
};

/// Deterministic byte pattern for a stream offset, so reassembled
/// ranges can be checked for both content and position.
pub fn stream_byte(offset: u64) -> u8 {
    (offset % 251) as u8
}

pub fn expect_bytes(start: u64, end: u64) -> Vec<u8> {
    (start..end).map(stream_byte).collect()
}

/// An in-memory [`Platform`] serving canned player responses and
/// synthetic stream bytes, with counters for everything a test may
/// want to assert on.
pub struct FakePlatform {
    responses: Mutex<HashMap<TrackId, PlayerResponse>>,
    pub response_calls: AtomicUsize,
    pub range_calls: AtomicUsize,

    /// When set, `player_response` fails as if the endpoint were down.
    pub fail_responses: AtomicBool,

    /// Artificial transfer time per range request.
    pub range_delay: Duration,

    /// When present, range requests wait on this semaphore first. A
    /// gate with zero permits blocks transfers until the test decides
    /// otherwise.
    pub range_gate: Option<Arc<Semaphore>>,

    active_ranges: AtomicUsize,
    pub max_active_ranges: AtomicUsize,
}

impl FakePlatform {
    pub fn new() -> Self {
        Self {
            responses: Mutex::new(HashMap::new()),
            response_calls: AtomicUsize::new(0),
            range_calls: AtomicUsize::new(0),
            fail_responses: AtomicBool::new(false),
            range_delay: Duration::ZERO,
            range_gate: None,
            active_ranges: AtomicUsize::new(0),
            max_active_ranges: AtomicUsize::new(0),
        }
    }

    pub fn with_range_delay(mut self, delay: Duration) -> Self {
        self.range_delay = delay;
        self
    }

    pub fn with_range_gate(mut self, gate: Arc<Semaphore>) -> Self {
        self.range_gate = Some(gate);
        self
    }

    pub fn serve(&self, track_id: &TrackId, response: PlayerResponse) {
        self.responses
            .lock()
            .unwrap()
            .insert(track_id.clone(), response);
    }
}

#[async_trait]
impl Platform for FakePlatform {
    async fn player_response(&self, track_id: &TrackId) -> Result<PlayerResponse> {
        self.response_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_responses.load(Ordering::SeqCst) {
            return Err(Error::unavailable("player endpoint down"));
        }
        self.responses
            .lock()
            .unwrap()
            .get(track_id)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("no response for {track_id}")))
    }

    async fn player_script(&self, _program_ref: &str) -> Result<String> {
        Ok(String::new())
    }

    async fn fetch_range(&self, _url: &Url, start: u64, end: u64) -> Result<Vec<u8>> {
        self.range_calls.fetch_add(1, Ordering::SeqCst);
        let active = self.active_ranges.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active_ranges.fetch_max(active, Ordering::SeqCst);

        if let Some(gate) = &self.range_gate {
            // Dropped without release; holding the permit keeps the
            // transfer "in flight" as far as the test is concerned.
            let _permit = gate.acquire().await;
        }
        if !self.range_delay.is_zero() {
            tokio::time::sleep(self.range_delay).await;
        }

        self.active_ranges.fetch_sub(1, Ordering::SeqCst);
        Ok(expect_bytes(start, end))
    }
}

/// A transformer that never needs a script: every program is the empty
/// program, leaving URLs untouched.
pub struct FixedTransformer;

#[async_trait]
impl SignatureTransformer for FixedTransformer {
    async fn program(
        &self,
        program_ref: &str,
    ) -> std::result::Result<Arc<CipherProgram>, ExtractionError> {
        Ok(Arc::new(CipherProgram::new(program_ref, vec![], vec![])))
    }

    fn invalidate(&self, _program_ref: &str) {}
}

/// A player response offering a single unprotected audio format.
pub fn audio_response(bitrate: u32, content_length: u64) -> PlayerResponse {
    PlayerResponse {
        streaming_data: Some(StreamingData {
            expires_in_seconds: 3600,
            adaptive_formats: vec![Format {
                itag: 251,
                url: Some("https://streams.test.invalid/audio".to_string()),
                mime_type: "audio/webm; codecs=\"opus\"".to_string(),
                bitrate,
                audio_sample_rate: Some(48_000),
                content_length: Some(content_length),
                ..Format::default()
            }],
        }),
        video_details: Some(VideoDetails {
            title: "Test Track".to_string(),
            length_seconds: Some(245),
            ..VideoDetails::default()
        }),
        playback_tracking: Some(PlaybackTracking {
            videostats_playback_url: Some("https://api.test.invalid/playback".to_string()),
        }),
        ..PlayerResponse::default()
    }
}

/// A ready-made resolution for cache tests that bypass the resolver.
pub fn resolution(track_id: &TrackId, ttl: Duration) -> Resolution {
    Resolution {
        stream: ResolvedStream {
            track_id: track_id.clone(),
            url: "https://streams.test.invalid/audio".parse().unwrap(),
            expires_at: SystemTime::now() + ttl,
            bitrate: 128_000,
            sample_rate: Some(48_000),
            content_length: Some(1024),
            mime_type: "audio/webm".to_string(),
            codecs: "opus".to_string(),
            loudness_db: None,
        },
        meta: TrackMeta::default(),
        itag: 251,
    }
}
