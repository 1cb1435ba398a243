//! SQLite persistence for track metadata and format details.
//!
//! Two tables: `song` holds display metadata plus a set-once
//! `downloaded_at` stamp, `format` holds the technical details of the
//! last resolved stream and is overwritten on every resolution. The
//! distinction matters on upgrade: a re-resolution at a different
//! quality must refresh the format row without rewriting when the song
//! first landed on disk.

use std::path::Path;

use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    Row, SqlitePool,
};
use time::OffsetDateTime;

use crate::{
    error::Result,
    resolver::TrackMeta,
    track::{ResolvedStream, TrackId},
};

/// One row of the `format` table, as last written by
/// [`MetadataStore::upsert_format`]. Column-native types; the
/// short-lived stream URL and its expiry are deliberately not here.
#[derive(Clone, Debug, PartialEq)]
pub struct FormatRecord {
    pub itag: i64,
    pub mime_type: String,
    pub codecs: String,
    pub bitrate: i64,
    pub sample_rate: Option<i64>,
    pub content_length: Option<i64>,
    pub loudness_db: Option<f64>,
    pub playback_url: Option<String>,
}

pub struct MetadataStore {
    pool: SqlitePool,
}

impl MetadataStore {
    /// Opens (and creates, if absent) the database at `path` and runs
    /// the schema migration.
    pub async fn open(path: &Path) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new().connect_with(options).await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// An in-memory database, for tests. Pinned to a single connection
    /// because every `sqlite::memory:` connection is its own database.
    #[cfg(test)]
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS song (
                id            TEXT PRIMARY KEY,
                title         TEXT NOT NULL,
                duration_secs INTEGER NOT NULL,
                thumbnail_url TEXT,
                downloaded_at INTEGER
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS format (
                id             TEXT PRIMARY KEY,
                itag           INTEGER NOT NULL,
                mime_type      TEXT NOT NULL,
                codecs         TEXT NOT NULL,
                bitrate        INTEGER NOT NULL,
                sample_rate    INTEGER,
                content_length INTEGER,
                loudness_db    REAL,
                playback_url   TEXT
            )",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Writes the format row for a track, replacing whatever was there.
    /// The row always reflects the most recently resolved stream; the
    /// stream URL itself expires within hours and is never persisted.
    pub async fn upsert_format(
        &self,
        track_id: &TrackId,
        stream: &ResolvedStream,
        itag: u32,
        playback_url: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO format
                (id, itag, mime_type, codecs, bitrate, sample_rate,
                 content_length, loudness_db, playback_url)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT (id) DO UPDATE SET
                itag = excluded.itag,
                mime_type = excluded.mime_type,
                codecs = excluded.codecs,
                bitrate = excluded.bitrate,
                sample_rate = excluded.sample_rate,
                content_length = excluded.content_length,
                loudness_db = excluded.loudness_db,
                playback_url = excluded.playback_url",
        )
        .bind(track_id.as_str())
        .bind(i64::from(itag))
        .bind(&stream.mime_type)
        .bind(&stream.codecs)
        .bind(i64::from(stream.bitrate))
        .bind(stream.sample_rate.map(i64::from))
        .bind(stream.content_length.and_then(|n| i64::try_from(n).ok()))
        .bind(stream.loudness_db.map(f64::from))
        .bind(playback_url)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Inserts the song row if the track was never seen before. An
    /// existing row is left alone, so a later re-resolution cannot
    /// rewrite the title the user first saw.
    pub async fn upsert_song_if_absent(&self, track_id: &TrackId, meta: &TrackMeta) -> Result<()> {
        let duration_secs = meta
            .duration
            .and_then(|d| i64::try_from(d.as_secs()).ok())
            .unwrap_or(0);

        sqlx::query(
            "INSERT INTO song (id, title, duration_secs, thumbnail_url)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (id) DO NOTHING",
        )
        .bind(track_id.as_str())
        .bind(meta.title.as_deref().unwrap_or(""))
        .bind(duration_secs)
        .bind(meta.thumbnail_url.as_deref())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Stamps `downloaded_at`, first completion only. A re-download
    /// keeps the original stamp.
    pub async fn mark_downloaded(&self, track_id: &TrackId) -> Result<()> {
        sqlx::query(
            "UPDATE song SET downloaded_at = ?2
             WHERE id = ?1 AND downloaded_at IS NULL",
        )
        .bind(track_id.as_str())
        .bind(OffsetDateTime::now_utc().unix_timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// The persisted format row for a track, if it was ever resolved.
    pub async fn format_record(&self, track_id: &TrackId) -> Result<Option<FormatRecord>> {
        let row = sqlx::query(
            "SELECT itag, mime_type, codecs, bitrate, sample_rate,
                    content_length, loudness_db, playback_url
             FROM format WHERE id = ?1",
        )
        .bind(track_id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(FormatRecord {
            itag: row.try_get("itag")?,
            mime_type: row.try_get("mime_type")?,
            codecs: row.try_get("codecs")?,
            bitrate: row.try_get("bitrate")?,
            sample_rate: row.try_get("sample_rate")?,
            content_length: row.try_get("content_length")?,
            loudness_db: row.try_get("loudness_db")?,
            playback_url: row.try_get("playback_url")?,
        }))
    }

    /// Ids of every song with a download stamp, for restoring the
    /// manager's completed set at startup.
    pub async fn completed_ids(&self) -> Result<Vec<TrackId>> {
        let rows = sqlx::query("SELECT id FROM song WHERE downloaded_at IS NOT NULL")
            .fetch_all(&self.pool)
            .await?;

        let mut ids = Vec::with_capacity(rows.len());
        for row in rows {
            let id: String = row.try_get("id")?;
            // Ids were validated on the way in; skip rather than fail
            // on a row edited out from under us.
            if let Ok(track_id) = id.parse() {
                ids.push(track_id);
            }
        }
        Ok(ids)
    }

    /// The first-download stamp for a song, if it has one.
    pub async fn downloaded_at(&self, track_id: &TrackId) -> Result<Option<i64>> {
        let row = sqlx::query("SELECT downloaded_at FROM song WHERE id = ?1")
            .bind(track_id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row
            .and_then(|r| r.try_get::<Option<i64>, _>("downloaded_at").ok())
            .flatten())
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, SystemTime};

    use super::*;

    fn meta(title: &str) -> TrackMeta {
        TrackMeta {
            title: Some(title.to_string()),
            duration: Some(Duration::from_secs(245)),
            thumbnail_url: None,
            playback_url: Some("https://api.example.com/playback".to_string()),
        }
    }

    fn stream(track_id: &TrackId, bitrate: u32) -> ResolvedStream {
        ResolvedStream {
            track_id: track_id.clone(),
            url: "https://streams.example.com/a".parse().unwrap(),
            expires_at: SystemTime::now() + Duration::from_secs(3600),
            bitrate,
            sample_rate: Some(44_100),
            content_length: Some(4_000_000),
            mime_type: "audio/webm".to_string(),
            codecs: "opus".to_string(),
            loudness_db: Some(-5.2),
        }
    }

    #[tokio::test]
    async fn download_stamp_is_set_once() {
        let db = MetadataStore::in_memory().await.unwrap();
        let id: TrackId = "abc123".parse().unwrap();

        db.upsert_song_if_absent(&id, &meta("First")).await.unwrap();
        db.mark_downloaded(&id).await.unwrap();
        let first = db.downloaded_at(&id).await.unwrap().unwrap();

        db.mark_downloaded(&id).await.unwrap();
        assert_eq!(db.downloaded_at(&id).await.unwrap(), Some(first));
    }

    #[tokio::test]
    async fn song_row_is_not_rewritten_once_present() {
        let db = MetadataStore::in_memory().await.unwrap();
        let id: TrackId = "abc123".parse().unwrap();

        db.upsert_song_if_absent(&id, &meta("Original")).await.unwrap();
        db.upsert_song_if_absent(&id, &meta("Renamed")).await.unwrap();

        let row = sqlx::query("SELECT title FROM song WHERE id = ?1")
            .bind(id.as_str())
            .fetch_one(&db.pool)
            .await
            .unwrap();
        let title: String = row.try_get("title").unwrap();
        assert_eq!(title, "Original");
    }

    #[tokio::test]
    async fn format_row_is_overwritten() {
        let db = MetadataStore::in_memory().await.unwrap();
        let id: TrackId = "abc123".parse().unwrap();

        db.upsert_format(&id, &stream(&id, 128_000), 251, None)
            .await
            .unwrap();
        db.upsert_format(
            &id,
            &stream(&id, 256_000),
            774,
            Some("https://api.example.com/playback"),
        )
        .await
        .unwrap();

        let record = db.format_record(&id).await.unwrap().unwrap();
        assert_eq!(record.bitrate, 256_000);
        assert_eq!(record.itag, 774);
        assert_eq!(
            record.playback_url.as_deref(),
            Some("https://api.example.com/playback")
        );
    }

    #[tokio::test]
    async fn format_record_is_none_for_unresolved_tracks() {
        let db = MetadataStore::in_memory().await.unwrap();
        let id: TrackId = "never-seen".parse().unwrap();
        assert_eq!(db.format_record(&id).await.unwrap(), None);
    }

    #[tokio::test]
    async fn completed_ids_lists_only_stamped_songs() {
        let db = MetadataStore::in_memory().await.unwrap();
        let done: TrackId = "done-track".parse().unwrap();
        db.upsert_song_if_absent(&done, &meta("Done")).await.unwrap();
        db.mark_downloaded(&done).await.unwrap();

        let pending: TrackId = "pending-track".parse().unwrap();
        db.upsert_song_if_absent(&pending, &meta("Pending"))
            .await
            .unwrap();

        assert_eq!(db.completed_ids().await.unwrap(), vec![done]);
    }
}
