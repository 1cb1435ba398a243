//! Upstream platform boundary.
//!
//! Everything this crate consumes from the network goes through the
//! [`Platform`] trait: the player response for a track, the client-side
//! player script, and ranged media-byte fetches. Production code uses
//! [`HttpPlatform`] over the rate-limited [`crate::http::Client`]; tests
//! substitute a double so no test touches the network.

use async_trait::async_trait;
use reqwest::header::RANGE;
use serde_json::json;
use url::Url;

use crate::{
    config::Config,
    error::{Error, Result},
    http,
    protocol::PlayerResponse,
    track::TrackId,
};

/// Remote calls the resolver and the byte-range store depend on.
///
/// Authorization material (cookies, proxy configuration) is a concern of
/// the underlying network client, passed through untouched.
#[async_trait]
pub trait Platform: Send + Sync {
    /// Fetches the player response carrying the format list for a track.
    async fn player_response(&self, track_id: &TrackId) -> Result<PlayerResponse>;

    /// Fetches the raw client-side player script for a program version.
    async fn player_script(&self, program_ref: &str) -> Result<String>;

    /// Fetches the byte range `[start, end)` of an already-resolved
    /// media URL.
    async fn fetch_range(&self, url: &Url, start: u64, end: u64) -> Result<Vec<u8>>;
}

/// HTTP-backed platform implementation.
pub struct HttpPlatform {
    client: http::Client,
    api_base: Url,
    script_base: Url,
}

impl HttpPlatform {
    /// Path of the player endpoint, relative to the API base.
    const PLAYER_PATH: &'static str = "player";

    /// File name of the player script under a program-version directory.
    const SCRIPT_NAME: &'static str = "base.js";

    pub fn new(config: &Config) -> Result<Self> {
        Ok(Self {
            client: http::Client::new(config)?,
            api_base: config.api_base.clone(),
            script_base: config.script_base.clone(),
        })
    }
}

#[async_trait]
impl Platform for HttpPlatform {
    async fn player_response(&self, track_id: &TrackId) -> Result<PlayerResponse> {
        let url = self.api_base.join(Self::PLAYER_PATH)?;
        trace!("{url}: player response for {track_id}");

        let request = self
            .client
            .unlimited
            .post(url)
            .json(&json!({ "trackId": track_id.as_str() }))
            .build()?;

        let response = self.client.execute(request).await?;
        let response = response.error_for_status()?;
        response.json::<PlayerResponse>().await.map_err(Into::into)
    }

    async fn player_script(&self, program_ref: &str) -> Result<String> {
        let url = self
            .script_base
            .join(&format!("{program_ref}/{}", Self::SCRIPT_NAME))?;
        debug!("fetching player script {program_ref}");

        let request = self.client.get(url);
        let response = self.client.execute(request).await?;
        let response = response.error_for_status()?;
        response.text().await.map_err(Into::into)
    }

    async fn fetch_range(&self, url: &Url, start: u64, end: u64) -> Result<Vec<u8>> {
        if start >= end {
            return Err(Error::invalid_argument(format!(
                "empty byte range [{start}, {end})"
            )));
        }

        // Media bytes bypass the API rate limiter: range requests are
        // served by CDN edges with per-URL authorization.
        let response = self
            .client
            .unlimited
            .get(url.clone())
            .header(RANGE, format!("bytes={start}-{}", end - 1))
            .send()
            .await?;
        let response = response.error_for_status()?;

        let body = response.bytes().await?;
        trace!("fetched {} bytes at offset {start}", body.len());
        Ok(body.to_vec())
    }
}
