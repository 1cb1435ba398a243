use std::{path::PathBuf, time::Duration};

use url::Url;

use crate::track::{Connectivity, QualityPreference};

/// Runtime configuration for the resolution and cache subsystem.
///
/// Constructed once at startup and shared by reference with every
/// component, so tests can build isolated instances per case.
#[derive(Clone, Debug)]
pub struct Config {
    pub app_name: String,
    pub app_version: String,

    /// Base URL of the platform endpoint serving player responses.
    pub api_base: Url,

    /// Base URL the platform serves its client-side player scripts from.
    pub script_base: Url,

    /// `User-Agent` presented on every outbound request.
    pub user_agent: String,

    /// Deadline for a single resolution attempt, format-list fetch and
    /// cipher work included.
    pub resolve_timeout: Duration,

    /// Ceiling on concurrently downloading tasks.
    pub max_concurrent_downloads: usize,

    /// Hard ceiling on retained resolution cache entries.
    pub resolution_cache_ceiling: usize,

    /// Directory holding the byte-range store and its index.
    pub cache_dir: PathBuf,

    /// Byte-range store capacity in bytes.
    pub cache_capacity: u64,

    /// SQLite database path for persisted metadata.
    pub db_path: PathBuf,

    /// Default quality preference for resolutions without an explicit one.
    pub preference: QualityPreference,

    /// Network class the automatic preference adapts to.
    pub connectivity: Connectivity,
}

impl Config {
    /// Default deadline for a resolution attempt.
    pub const DEFAULT_RESOLVE_TIMEOUT: Duration = Duration::from_millis(15_000);

    /// Default number of download slots.
    pub const DEFAULT_MAX_CONCURRENT_DOWNLOADS: usize = 3;

    /// Default byte-range store capacity (512 MiB).
    pub const DEFAULT_CACHE_CAPACITY: u64 = 512 * 1024 * 1024;

    /// Default resolution cache ceiling. Track id cardinality is
    /// unbounded over a long session, so the map cannot grow freely.
    pub const DEFAULT_RESOLUTION_CACHE_CEILING: usize = 256;

    /// Creates a configuration rooted at the given cache directory.
    ///
    /// # Panics
    ///
    /// Panics when the compiled-in package name or version would produce
    /// an invalid `User-Agent`, which is a build defect rather than a
    /// runtime condition.
    #[must_use]
    pub fn with_cache_dir(api_base: Url, script_base: Url, cache_dir: PathBuf) -> Self {
        let app_name = env!("CARGO_PKG_NAME").to_owned();
        let app_version = env!("CARGO_PKG_VERSION").to_owned();

        // Additional `User-Agent` string checks on top of what `reqwest`
        // will verify when the header is set.
        let illegal_chars = |chr| chr == '/' || chr == ';';
        if app_name.is_empty()
            || app_name.contains(illegal_chars)
            || app_version.is_empty()
            || app_version.contains(illegal_chars)
        {
            panic!("application name and/or version invalid (\"{app_name}\"; \"{app_version}\")");
        }

        let os_name = match std::env::consts::OS {
            "macos" => "osx",
            other => other,
        };
        let user_agent = format!("{app_name}/{app_version} (Rust; {os_name}; Headless)");
        trace!("user agent: {user_agent}");

        let db_path = cache_dir.join("metadata.db");

        Self {
            app_name,
            app_version,
            api_base,
            script_base,
            user_agent,
            resolve_timeout: Self::DEFAULT_RESOLVE_TIMEOUT,
            max_concurrent_downloads: Self::DEFAULT_MAX_CONCURRENT_DOWNLOADS,
            resolution_cache_ceiling: Self::DEFAULT_RESOLUTION_CACHE_CEILING,
            cache_dir,
            cache_capacity: Self::DEFAULT_CACHE_CAPACITY,
            db_path,
            preference: QualityPreference::Auto,
            connectivity: Connectivity::Unmetered,
        }
    }
}
