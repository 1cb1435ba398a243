//! Stream Resolver: track id in, short-lived authorized URL out.
//!
//! Fetches the platform's format list, selects the best matching
//! audio-only format for the caller's quality preference, runs the
//! signature and throttling transforms when the format is protected,
//! and stamps the result with its expiry. The resolver has no side
//! effects; callers populate the resolution cache and persist metadata.

use std::{
    sync::Arc,
    time::{Duration, SystemTime},
};

use url::Url;

use crate::{
    cipher::SignatureTransformer,
    error::Error,
    platform::Platform,
    protocol::{Format, PlayerResponse},
    track::{Connectivity, Quality, QualityPreference, ResolvedStream, TrackId},
};

/// Failure modes of a resolution attempt.
///
/// All are recoverable by retry at a higher layer; none crash the
/// caller. The variants carry rendered messages rather than source
/// errors so a single in-flight outcome can be handed to every joined
/// caller of the resolution cache.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ResolveError {
    /// Transport failure or timeout talking to the platform.
    #[error("network failure: {0}")]
    Network(String),

    /// The platform returned no usable audio format.
    #[error("no usable audio format")]
    NoFormat,

    /// Signature or throttling transform failed.
    #[error("signature transform failed: {0}")]
    Cipher(String),
}

impl From<tokio::time::error::Elapsed> for ResolveError {
    fn from(e: tokio::time::error::Elapsed) -> Self {
        Self::Network(format!("resolution timed out: {e}"))
    }
}

/// Resolution failures cross the data-source boundary as well-defined
/// conditions, never as faults.
impl From<ResolveError> for Error {
    fn from(e: ResolveError) -> Self {
        match e {
            ResolveError::Network(_) => Self::unavailable(e.to_string()),
            ResolveError::NoFormat => Self::not_found(e.to_string()),
            ResolveError::Cipher(_) => Self::internal(e.to_string()),
        }
    }
}

/// Track metadata worth keeping after the stream URL expires.
#[derive(Clone, Debug, Default)]
pub struct TrackMeta {
    pub title: Option<String>,
    pub duration: Option<Duration>,
    pub thumbnail_url: Option<String>,
    pub playback_url: Option<String>,
}

/// A successful resolution: the stream plus its persistence-worthy
/// metadata.
#[derive(Clone, Debug)]
pub struct Resolution {
    pub stream: ResolvedStream,
    pub meta: TrackMeta,

    /// Format identifier of the selected stream, recorded alongside
    /// the technical details on download.
    pub itag: u32,
}

pub struct StreamResolver {
    platform: Arc<dyn Platform>,
    transformer: Arc<dyn SignatureTransformer>,
}

impl StreamResolver {
    #[must_use]
    pub fn new(platform: Arc<dyn Platform>, transformer: Arc<dyn SignatureTransformer>) -> Self {
        Self {
            platform,
            transformer,
        }
    }

    /// Resolves a track under a deadline covering the format-list fetch
    /// and all cipher work. A deadline overrun surfaces as
    /// [`ResolveError::Network`], not a hang.
    pub async fn resolve_timed(
        &self,
        track_id: &TrackId,
        preference: QualityPreference,
        connectivity: Connectivity,
        deadline: Duration,
    ) -> Result<Resolution, ResolveError> {
        tokio::time::timeout(deadline, self.resolve(track_id, preference, connectivity)).await?
    }

    /// Resolves a track into a playable stream descriptor.
    pub async fn resolve(
        &self,
        track_id: &TrackId,
        preference: QualityPreference,
        connectivity: Connectivity,
    ) -> Result<Resolution, ResolveError> {
        let resolved_at = SystemTime::now();
        let response = self
            .platform
            .player_response(track_id)
            .await
            .map_err(|e| ResolveError::Network(e.to_string()))?;

        let streaming = response
            .streaming_data
            .as_ref()
            .ok_or(ResolveError::NoFormat)?;
        let format = select_format(&streaming.adaptive_formats, preference, connectivity)
            .ok_or(ResolveError::NoFormat)?;

        debug!(
            "selected itag {} at {} bps for {track_id} ({preference:?}, {connectivity:?})",
            format.itag, format.bitrate
        );

        let url = self.format_url(&response, format).await?;
        let expires_at = resolved_at + Duration::from_secs(streaming.expires_in_seconds);

        let stream = ResolvedStream {
            track_id: track_id.clone(),
            url,
            expires_at,
            bitrate: format.bitrate,
            sample_rate: format.audio_sample_rate,
            content_length: format.content_length,
            mime_type: format.mime_type.clone(),
            codecs: format.codecs().to_string(),
            loudness_db: format.loudness_db,
        };
        info!("resolved {stream}");

        let meta = TrackMeta {
            title: response.video_details.as_ref().map(|d| d.title.clone()),
            duration: response
                .video_details
                .as_ref()
                .and_then(|d| d.length_seconds)
                .map(Duration::from_secs),
            thumbnail_url: response
                .video_details
                .as_ref()
                .and_then(|d| d.best_thumbnail())
                .map(ToString::to_string),
            playback_url: response
                .playback_tracking
                .as_ref()
                .and_then(|t| t.videostats_playback_url.clone()),
        };

        Ok(Resolution {
            stream,
            meta,
            itag: format.itag,
        })
    }

    /// Produces the playable URL for the selected format, running the
    /// signature and throttling transforms when the format is
    /// protected.
    async fn format_url(
        &self,
        response: &PlayerResponse,
        format: &Format,
    ) -> Result<Url, ResolveError> {
        if let Some(raw) = &format.url {
            return Url::parse(raw).map_err(|e| ResolveError::Cipher(format!("bad raw URL: {e}")));
        }

        let descriptor = format
            .cipher_descriptor()
            .ok_or_else(|| ResolveError::Cipher("format has neither URL nor cipher".to_string()))?;
        let program_ref = response
            .player_ref
            .as_deref()
            .ok_or_else(|| ResolveError::Cipher("response names no player script".to_string()))?;

        // A stale cached program produces a signature the CDN rejects as
        // unparseable, which shows up here as a transform failure. Drop
        // the program and re-extract once before surfacing.
        match self.decipher(program_ref, &descriptor).await {
            Ok(url) => Ok(url),
            Err(first) => {
                warn!("cipher failed for program {program_ref}, re-extracting: {first}");
                self.transformer.invalidate(program_ref);
                self.decipher(program_ref, &descriptor).await
            }
        }
    }

    async fn decipher(
        &self,
        program_ref: &str,
        descriptor: &crate::protocol::CipherDescriptor,
    ) -> Result<Url, ResolveError> {
        let program = self
            .transformer
            .program(program_ref)
            .await
            .map_err(|e| ResolveError::Cipher(e.to_string()))?;

        let signature = program.apply_signature(&descriptor.signature);
        let mut url = Url::parse(&descriptor.base_url)
            .map_err(|e| ResolveError::Cipher(format!("bad cipher base URL: {e}")))?;
        url.query_pairs_mut()
            .append_pair(&descriptor.signature_param, &signature);

        Ok(program.apply_throttling(&url))
    }
}

/// Picks the best audio-only format for the preference.
///
/// Explicit tier: highest bitrate at or below the tier ceiling,
/// degrading to the lowest available format when everything is above
/// it. AUTO: lowest bitrate on constrained connections, highest
/// otherwise. Ties are broken in favor of formats with a known content
/// length, which download and seek more predictably.
fn select_format(
    formats: &[Format],
    preference: QualityPreference,
    connectivity: Connectivity,
) -> Option<&Format> {
    let audio = || formats.iter().filter(|f| f.is_audio());

    match preference {
        QualityPreference::Fixed(tier) => {
            let ceiling = tier.max_bitrate();
            pick_highest(audio().filter(|f| f.bitrate <= ceiling))
                .or_else(|| pick_lowest(audio()))
        }
        QualityPreference::Auto => match connectivity {
            Connectivity::Constrained => pick_lowest(audio()),
            Connectivity::Unmetered => {
                pick_highest(audio().filter(|f| f.bitrate <= Quality::High.max_bitrate()))
            }
        },
    }
}

fn pick_highest<'a>(formats: impl Iterator<Item = &'a Format>) -> Option<&'a Format> {
    formats.max_by_key(|f| (f.bitrate, f.content_length.is_some()))
}

fn pick_lowest<'a>(formats: impl Iterator<Item = &'a Format>) -> Option<&'a Format> {
    formats.min_by_key(|f| (f.bitrate, f.content_length.is_none()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn format(bitrate: u32, content_length: Option<u64>) -> Format {
        Format {
            itag: bitrate / 1000,
            mime_type: "audio/webm; codecs=\"opus\"".to_string(),
            bitrate,
            content_length,
            ..Format::default()
        }
    }

    fn video(bitrate: u32) -> Format {
        Format {
            mime_type: "video/mp4; codecs=\"avc1\"".to_string(),
            bitrate,
            ..Format::default()
        }
    }

    #[test]
    fn constrained_auto_picks_lowest_bitrate() {
        let formats = [
            format(128_000, Some(1)),
            format(48_000, Some(1)),
            format(256_000, Some(1)),
            video(32_000),
        ];
        let picked =
            select_format(&formats, QualityPreference::Auto, Connectivity::Constrained).unwrap();
        assert_eq!(picked.bitrate, 48_000);
    }

    #[test]
    fn unmetered_auto_picks_highest_bitrate() {
        let formats = [format(128_000, None), format(256_000, None)];
        let picked =
            select_format(&formats, QualityPreference::Auto, Connectivity::Unmetered).unwrap();
        assert_eq!(picked.bitrate, 256_000);
    }

    #[test]
    fn fixed_tier_respects_ceiling() {
        let formats = [
            format(48_000, None),
            format(128_000, None),
            format(256_000, None),
        ];
        let picked = select_format(
            &formats,
            QualityPreference::Fixed(Quality::Standard),
            Connectivity::Unmetered,
        )
        .unwrap();
        assert_eq!(picked.bitrate, 128_000);
    }

    #[test]
    fn fixed_tier_degrades_to_lowest_when_nothing_fits() {
        let formats = [format(128_000, None), format(256_000, None)];
        let picked = select_format(
            &formats,
            QualityPreference::Fixed(Quality::Basic),
            Connectivity::Unmetered,
        )
        .unwrap();
        assert_eq!(picked.bitrate, 128_000);
    }

    #[test]
    fn known_content_length_wins_ties() {
        let formats = [format(128_000, None), format(128_000, Some(100))];
        let picked =
            select_format(&formats, QualityPreference::Auto, Connectivity::Unmetered).unwrap();
        assert_eq!(picked.content_length, Some(100));

        let picked =
            select_format(&formats, QualityPreference::Auto, Connectivity::Constrained).unwrap();
        assert_eq!(picked.content_length, Some(100));
    }

    #[test]
    fn video_only_list_is_no_format() {
        let formats = [video(128_000)];
        assert!(select_format(&formats, QualityPreference::Auto, Connectivity::Unmetered).is_none());
    }
}
