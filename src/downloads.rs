//! Bounded download orchestration.
//!
//! Each enqueued track gets its own task; a semaphore keeps the number
//! actually transferring at or below the configured ceiling while the
//! rest sit in `Queued`. State changes are broadcast so the binary (or
//! any other subscriber) can follow progress without polling.
//!
//! Failures are terminal until someone asks for a retry. There is no
//! automatic retry loop: the stream resolver already retries the one
//! recoverable case (a stale cipher program) internally, and anything
//! else that failed once will usually fail again immediately.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
};

use tokio::sync::{broadcast, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::{
    db::MetadataStore,
    error::{Error, Result},
    resolver::ResolveError,
    source::AudioSource,
    track::TrackId,
};

/// Bytes fetched per range request while downloading a full track.
const CHUNK_SIZE: u64 = 1024 * 1024;

/// Capacity of the state change broadcast channel. Slow subscribers
/// lag rather than block the orchestrator.
const EVENT_CHANNEL_CAPACITY: usize = 64;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureReason {
    /// The platform or stream host could not be reached, or a
    /// transfer broke off mid-way.
    Network,
    /// No playable audio format was offered for the track.
    NoFormat,
    /// The signature transform could not be extracted or applied.
    Cipher,
    /// Download finished but its metadata could not be persisted.
    Disk,
    /// Cancelled on request before completing.
    Cancelled,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DownloadState {
    Queued,
    Downloading,
    Completed,
    Failed(FailureReason),
}

impl DownloadState {
    /// Whether no further transitions happen without outside action.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed(_))
    }
}

#[derive(Clone, Debug)]
pub struct DownloadEvent {
    pub track_id: TrackId,
    pub state: DownloadState,
}

struct TaskEntry {
    state: DownloadState,
    cancel: CancellationToken,
}

pub struct DownloadManager {
    source: Arc<AudioSource>,
    db: Arc<MetadataStore>,
    tasks: Mutex<HashMap<TrackId, TaskEntry>>,
    slots: Arc<Semaphore>,
    events: broadcast::Sender<DownloadEvent>,
    shutdown: CancellationToken,
}

impl DownloadManager {
    #[must_use]
    pub fn new(source: Arc<AudioSource>, db: Arc<MetadataStore>, max_concurrent: usize) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            source,
            db,
            tasks: Mutex::new(HashMap::new()),
            slots: Arc::new(Semaphore::new(max_concurrent.max(1))),
            events,
            shutdown: CancellationToken::new(),
        }
    }

    /// Marks previously downloaded tracks as `Completed` so they are
    /// not re-downloaded after a restart. No events are emitted.
    pub async fn restore(&self) -> Result<()> {
        let completed = self.db.completed_ids().await?;
        let mut tasks = self.lock();
        for track_id in completed {
            tasks.entry(track_id).or_insert_with(|| TaskEntry {
                state: DownloadState::Completed,
                cancel: CancellationToken::new(),
            });
        }
        Ok(())
    }

    /// Queues a track for download. Tracks already queued, running or
    /// completed are left alone; a failed track needs an explicit
    /// `retry` instead.
    pub fn enqueue(self: &Arc<Self>, track_id: TrackId) {
        {
            let mut tasks = self.lock();
            if let Some(entry) = tasks.get(&track_id) {
                debug!("not enqueueing {track_id}: already {:?}", entry.state);
                return;
            }
            tasks.insert(
                track_id.clone(),
                TaskEntry {
                    state: DownloadState::Queued,
                    cancel: CancellationToken::new(),
                },
            );
        }
        self.emit(&track_id, DownloadState::Queued);
        self.spawn(track_id);
    }

    /// Re-queues a failed track. Returns `failed_precondition` for
    /// tracks in any other state.
    pub fn retry(self: &Arc<Self>, track_id: &TrackId) -> Result<()> {
        {
            let mut tasks = self.lock();
            match tasks.get_mut(track_id) {
                Some(entry) if matches!(entry.state, DownloadState::Failed(_)) => {
                    entry.state = DownloadState::Queued;
                    entry.cancel = CancellationToken::new();
                }
                Some(entry) => {
                    return Err(Error::failed_precondition(format!(
                        "cannot retry {track_id} in state {:?}",
                        entry.state
                    )));
                }
                None => {
                    return Err(Error::not_found(format!("{track_id} was never enqueued")));
                }
            }
        }
        self.emit(track_id, DownloadState::Queued);
        self.spawn(track_id.clone());
        Ok(())
    }

    /// Cancels a queued or running download. A track still waiting for
    /// a transfer slot is dropped from the manager outright, as if it
    /// had never been enqueued; only a transfer interrupted mid-flight
    /// ends up `Failed(Cancelled)`. Completed and failed downloads are
    /// left untouched.
    pub fn cancel(&self, track_id: &TrackId) {
        let mut tasks = self.lock();
        let Some(entry) = tasks.get(track_id) else {
            return;
        };
        if entry.state.is_terminal() {
            return;
        }
        let queued = entry.state == DownloadState::Queued;
        entry.cancel.cancel();
        if queued {
            debug!("dropping {track_id}: cancelled before a transfer slot opened");
            tasks.remove(track_id);
        }
    }

    /// Stops all queued and in-flight downloads. Tasks exit without
    /// further state changes; the process is going away.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<DownloadEvent> {
        self.events.subscribe()
    }

    /// Current state of every known track.
    #[must_use]
    pub fn snapshot(&self) -> Vec<(TrackId, DownloadState)> {
        self.lock()
            .iter()
            .map(|(id, entry)| (id.clone(), entry.state))
            .collect()
    }

    #[must_use]
    pub fn state(&self, track_id: &TrackId) -> Option<DownloadState> {
        self.lock().get(track_id).map(|entry| entry.state)
    }

    fn spawn(self: &Arc<Self>, track_id: TrackId) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            manager.run(track_id).await;
        });
    }

    async fn run(self: Arc<Self>, track_id: TrackId) {
        let cancel = match self.lock().get(&track_id) {
            Some(entry) => entry.cancel.clone(),
            None => return,
        };

        // Wait for a transfer slot; the track stays Queued until one
        // frees up. A cancel in this window already removed the entry,
        // so the task just exits.
        let _permit = tokio::select! {
            () = cancel.cancelled() => return,
            () = self.shutdown.cancelled() => return,
            permit = Arc::clone(&self.slots).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => return,
            },
        };
        if cancel.is_cancelled() {
            return;
        }

        self.transition(&track_id, DownloadState::Downloading);

        let outcome = tokio::select! {
            () = cancel.cancelled() => Err(FailureReason::Cancelled),
            () = self.shutdown.cancelled() => return,
            outcome = self.download(&track_id) => outcome,
        };

        match outcome {
            Ok(()) => {
                info!("download of {track_id} complete");
                self.transition(&track_id, DownloadState::Completed);
            }
            Err(reason) => {
                warn!("download of {track_id} failed: {reason:?}");
                self.transition(&track_id, DownloadState::Failed(reason));
            }
        }
    }

    async fn download(&self, track_id: &TrackId) -> std::result::Result<(), FailureReason> {
        let resolution = self
            .source
            .resolve(track_id)
            .await
            .map_err(|e| classify_resolve(&e))?;

        let Some(length) = resolution.stream.content_length else {
            warn!("cannot download {track_id}: stream length unknown");
            return Err(FailureReason::NoFormat);
        };

        let mut offset = 0;
        while offset < length {
            let end = (offset + CHUNK_SIZE).min(length);
            self.source.fetch(track_id, offset, end).await.map_err(|e| {
                warn!("chunk [{offset}, {end}) of {track_id} failed: {e}");
                FailureReason::Network
            })?;
            offset = end;
        }

        // The resolution path already wrote these rows fail-soft; the
        // completion stamp must not be, so redo them and surface any
        // failure as the task's outcome.
        let recorded = async {
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
                .await?;
            self.db.mark_downloaded(track_id).await
        };
        recorded.await.map_err(|e| {
            error!("download of {track_id} complete but not recorded: {e}");
            FailureReason::Disk
        })
    }

    fn transition(&self, track_id: &TrackId, state: DownloadState) {
        {
            let mut tasks = self.lock();
            match tasks.get_mut(track_id) {
                Some(entry) => entry.state = state,
                // Removed by a queued-cancel; nothing left to report.
                None => return,
            }
        }
        self.emit(track_id, state);
    }

    fn emit(&self, track_id: &TrackId, state: DownloadState) {
        debug!("{track_id} is now {state:?}");
        let _ = self.events.send(DownloadEvent {
            track_id: track_id.clone(),
            state,
        });
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<TrackId, TaskEntry>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn classify_resolve(error: &ResolveError) -> FailureReason {
    match error {
        ResolveError::Network(_) => FailureReason::Network,
        ResolveError::NoFormat => FailureReason::NoFormat,
        ResolveError::Cipher(_) => FailureReason::Cipher,
    }
}
