//! Track identifiers, resolved streams, and quality selection types.

use std::{
    fmt,
    str::FromStr,
    time::{Duration, SystemTime},
};

use time::OffsetDateTime;
use url::Url;

use crate::error::Error;

/// Opaque identifier of a media item on the upstream platform.
///
/// Stable for the item's lifetime and used as the cache key everywhere in
/// this crate: the resolution cache, the byte-range store on disk, the
/// download task map, and the metadata tables are all keyed by it.
#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct TrackId(String);

impl TrackId {
    /// Returns the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for TrackId {
    type Err = Error;

    /// Validates the platform identifier alphabet. An id never contains
    /// path separators because it doubles as a cache file name.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() || s.len() > 64 {
            return Err(Error::invalid_argument(format!(
                "track id length {} out of bounds",
                s.len()
            )));
        }
        if !s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(Error::invalid_argument(format!(
                "track id {s} contains invalid characters"
            )));
        }

        Ok(Self(s.to_string()))
    }
}

impl fmt::Display for TrackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl serde::Serialize for TrackId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

/// Deserializes through [`FromStr`] so ids read back from a persisted
/// index are re-validated.
impl<'de> serde::Deserialize<'de> for TrackId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = <String as serde::Deserialize>::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Audio quality tiers that can be requested for resolution.
///
/// Each tier maps to a bitrate ceiling; the resolver picks the highest
/// bitrate at or below the ceiling and degrades to the lowest available
/// format when nothing fits.
#[derive(Copy, Clone, Debug, Default, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub enum Quality {
    /// Data-saver tier, roughly 64 kbps.
    Basic,
    /// Standard tier, roughly 128 kbps.
    #[default]
    Standard,
    /// Highest tier the platform serves, typically 256 kbps.
    High,
}

impl Quality {
    /// Bitrate ceiling in bits per second for this tier.
    ///
    /// Ceilings are set slightly above the nominal encodes because the
    /// platform reports container bitrates, not target bitrates.
    #[must_use]
    pub fn max_bitrate(self) -> u32 {
        match self {
            Self::Basic => 72_000,
            Self::Standard => 160_000,
            Self::High => u32::MAX,
        }
    }
}

impl fmt::Display for Quality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Basic => write!(f, "basic"),
            Self::Standard => write!(f, "standard"),
            Self::High => write!(f, "high"),
        }
    }
}

impl FromStr for Quality {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "basic" => Ok(Self::Basic),
            "standard" => Ok(Self::Standard),
            "high" => Ok(Self::High),
            other => Err(Error::invalid_argument(format!(
                "unknown quality tier {other}"
            ))),
        }
    }
}

/// Caller preference for format selection.
#[derive(Copy, Clone, Debug, Default, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub enum QualityPreference {
    /// Let the resolver pick based on the connectivity hint.
    #[default]
    Auto,
    /// Request a fixed tier regardless of connectivity.
    Fixed(Quality),
}

/// Coarse connectivity hint passed through from the network layer.
#[derive(Copy, Clone, Debug, Default, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub enum Connectivity {
    /// Unconstrained connection; prefer the best available format.
    #[default]
    Unmetered,
    /// Metered or slow connection; prefer the smallest format.
    Constrained,
}

/// A resolved, short-lived, authorized stream for a track.
///
/// Created by the resolver and immutable once constructed. Becomes stale
/// once `now >= expires_at` and must not be reused past that point; the
/// resolution cache enforces this for its own entries, and the byte-range
/// store re-resolves whenever it needs fresh bytes.
#[derive(Clone, Debug)]
pub struct ResolvedStream {
    /// Track this stream was resolved for.
    pub track_id: TrackId,

    /// Authorized media URL; valid until `expires_at`.
    pub url: Url,

    /// Expiry instant as reported by the platform, relative to the time
    /// of resolution.
    pub expires_at: SystemTime,

    /// Bitrate of the selected format in bits per second.
    pub bitrate: u32,

    /// Sample rate in Hz, when the platform reports one.
    pub sample_rate: Option<u32>,

    /// Total content length in bytes, when known up front.
    pub content_length: Option<u64>,

    /// Mime type of the selected format, e.g. `audio/webm`.
    pub mime_type: String,

    /// Codec string extracted from the mime type parameters.
    pub codecs: String,

    /// Perceptual loudness in dB, for volume normalization downstream.
    pub loudness_db: Option<f32>,
}

impl ResolvedStream {
    /// Whether the stream URL has passed its expiry.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.expires_at <= SystemTime::now()
    }

    /// Time remaining until expiry, zero once expired.
    #[must_use]
    pub fn remaining(&self) -> Duration {
        self.expires_at
            .duration_since(SystemTime::now())
            .unwrap_or(Duration::ZERO)
    }
}

impl fmt::Display for ResolvedStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}; {} bps; expires {})",
            self.track_id,
            self.mime_type,
            self.bitrate,
            OffsetDateTime::from(self.expires_at)
        )
    }
}
