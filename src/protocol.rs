//! Wire types for the platform player response.
//!
//! Only the subset of the response that the resolver consumes is modeled
//! here: the format list, the expiry duration, minimal video details for
//! metadata persistence, and the playback-tracking reference. The
//! platform serves several numeric fields as JSON strings, hence the
//! `serde_as` annotations.

use serde::Deserialize;
use serde_with::{serde_as, DisplayFromStr};

/// Top-level player response for a track.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerResponse {
    pub streaming_data: Option<StreamingData>,
    pub video_details: Option<VideoDetails>,
    pub playback_tracking: Option<PlaybackTracking>,

    /// Version token of the client-side player script this response was
    /// generated against. Many tracks share one script version, so this
    /// is the cipher-program cache key, not the track id.
    pub player_ref: Option<String>,
}

/// Format list and expiry for a track.
#[serde_as]
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamingData {
    /// Validity of every URL in this response, relative to the time the
    /// response was produced.
    #[serde_as(as = "DisplayFromStr")]
    pub expires_in_seconds: u64,

    #[serde(default)]
    pub adaptive_formats: Vec<Format>,
}

/// A single downloadable format.
///
/// Exactly one of `url` and `signature_cipher` is present: protected
/// tracks carry a cipher descriptor instead of a raw URL.
#[serde_as]
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Format {
    pub itag: u32,

    pub url: Option<String>,
    pub signature_cipher: Option<String>,

    pub mime_type: String,
    pub bitrate: u32,

    #[serde_as(as = "Option<DisplayFromStr>")]
    #[serde(default)]
    pub audio_sample_rate: Option<u32>,

    #[serde_as(as = "Option<DisplayFromStr>")]
    #[serde(default)]
    pub content_length: Option<u64>,

    pub loudness_db: Option<f32>,
}

/// Cipher descriptor extracted from a protected format.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CipherDescriptor {
    /// Obfuscated signature to transform.
    pub signature: String,
    /// Query parameter name the transformed signature must be attached
    /// under.
    pub signature_param: String,
    /// Base media URL the signature gets attached to.
    pub base_url: String,
}

impl Format {
    /// Whether this format carries audio only.
    #[must_use]
    pub fn is_audio(&self) -> bool {
        self.mime_type.starts_with("audio/")
    }

    /// Codec string from the mime type parameters, e.g. `opus` out of
    /// `audio/webm; codecs="opus"`.
    #[must_use]
    pub fn codecs(&self) -> &str {
        self.mime_type
            .split_once("codecs=\"")
            .and_then(|(_, rest)| rest.split('"').next())
            .unwrap_or_default()
    }

    /// Parses the cipher descriptor, if this format is protected.
    ///
    /// The descriptor is a form-encoded triple: the obfuscated signature
    /// (`s`), the parameter name to attach the transformed signature
    /// under (`sp`, historically defaulting to `signature`), and the base
    /// URL (`url`).
    #[must_use]
    pub fn cipher_descriptor(&self) -> Option<CipherDescriptor> {
        let raw = self.signature_cipher.as_deref()?;

        let mut signature = None;
        let mut signature_param = None;
        let mut base_url = None;
        for (key, value) in url::form_urlencoded::parse(raw.as_bytes()) {
            match key.as_ref() {
                "s" => signature = Some(value.into_owned()),
                "sp" => signature_param = Some(value.into_owned()),
                "url" => base_url = Some(value.into_owned()),
                _ => {}
            }
        }

        Some(CipherDescriptor {
            signature: signature?,
            signature_param: signature_param.unwrap_or_else(|| "signature".to_string()),
            base_url: base_url?,
        })
    }
}

/// Minimal video details, consumed by metadata persistence only.
#[serde_as]
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoDetails {
    #[serde(default)]
    pub title: String,

    #[serde_as(as = "Option<DisplayFromStr>")]
    #[serde(default)]
    pub length_seconds: Option<u64>,

    pub thumbnail: Option<ThumbnailList>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThumbnailList {
    #[serde(default)]
    pub thumbnails: Vec<Thumbnail>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Thumbnail {
    pub url: String,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

impl VideoDetails {
    /// Largest thumbnail URL, when any is present.
    #[must_use]
    pub fn best_thumbnail(&self) -> Option<&str> {
        self.thumbnail
            .as_ref()?
            .thumbnails
            .iter()
            .max_by_key(|t| t.width.unwrap_or(0))
            .map(|t| t.url.as_str())
    }
}

/// Playback-tracking endpoints reported alongside the format list.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaybackTracking {
    pub videostats_playback_url: Option<String>,
}
