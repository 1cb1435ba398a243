//! In-memory, time-boxed, single-flight cache in front of the resolver.
//!
//! For a given track id at most one resolution runs at a time; every
//! concurrent caller for that id joins the in-flight computation and
//! receives its one outcome. Completed resolutions are retained until
//! their stream expires. Failures are never cached: resolution failures
//! are typically transient network conditions or expiry races, so the
//! next caller retries immediately.
//!
//! The pending slot is inserted atomically with the absent-check under
//! one lock, closing the race where two callers both observe "absent"
//! and both start resolving.

use std::{
    collections::HashMap,
    future::Future,
    sync::{Mutex, PoisonError},
    time::Instant,
};

use tokio::sync::watch;

use crate::{
    resolver::{Resolution, ResolveError},
    track::TrackId,
};

/// Outcome of an in-flight resolution, `None` while still running.
type Outcome = Option<Result<Resolution, ResolveError>>;

enum Slot {
    /// A completed resolution, valid until the stream expires.
    Ready {
        resolution: Resolution,
        resolved_at: Instant,
    },
    /// A resolution in flight; joiners watch for its outcome.
    Pending(watch::Receiver<Outcome>),
}

/// What the current caller has to do, decided under the map lock.
enum Role {
    Hit(Resolution),
    Join(watch::Receiver<Outcome>),
    Lead(watch::Sender<Outcome>),
}

pub struct ResolutionCache {
    slots: Mutex<HashMap<TrackId, Slot>>,

    /// Hard ceiling on retained entries; least-recently-resolved ready
    /// entries are dropped once it is exceeded. Track id cardinality is
    /// unbounded over a long session.
    ceiling: usize,
}

impl ResolutionCache {
    #[must_use]
    pub fn new(ceiling: usize) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            ceiling: ceiling.max(1),
        }
    }

    /// Returns the cached resolution for `track_id`, joining an
    /// in-flight one, or running `resolve` when there is neither.
    ///
    /// The resolution runs inline under the caller that installed the
    /// pending slot; if that caller's deadline cuts it short, the
    /// timeout failure is the single outcome shared with all joiners
    /// and nothing is cached.
    pub async fn get_or_resolve<F, Fut>(
        &self,
        track_id: &TrackId,
        resolve: F,
    ) -> Result<Resolution, ResolveError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Resolution, ResolveError>>,
    {
        let role = {
            let mut slots = self.lock();
            match slots.get(track_id) {
                Some(Slot::Ready { resolution, .. }) if !resolution.stream.is_expired() => {
                    Role::Hit(resolution.clone())
                }
                Some(Slot::Pending(rx)) => Role::Join(rx.clone()),
                // Absent, or ready but expired: this caller leads a
                // fresh resolution.
                _ => {
                    let (tx, rx) = watch::channel(None);
                    slots.insert(track_id.clone(), Slot::Pending(rx));
                    Role::Lead(tx)
                }
            }
        };

        match role {
            Role::Hit(resolution) => {
                trace!("resolution cache hit for {track_id}");
                Ok(resolution)
            }
            Role::Join(rx) => self.join(track_id, rx).await,
            Role::Lead(tx) => self.lead(track_id, resolve, tx).await,
        }
    }

    /// Drops the entry for a track, if any. Used when a stream turns
    /// out dead before its reported expiry.
    pub fn evict(&self, track_id: &TrackId) {
        self.lock().remove(track_id);
    }

    /// Number of retained entries, in-flight ones included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    async fn join(
        &self,
        track_id: &TrackId,
        mut rx: watch::Receiver<Outcome>,
    ) -> Result<Resolution, ResolveError> {
        trace!("joining in-flight resolution for {track_id}");
        loop {
            // The borrow must not be held across an await.
            if let Some(outcome) = rx.borrow().clone() {
                return outcome;
            }
            if rx.changed().await.is_err() {
                // The leader was dropped without publishing. Clean up
                // its slot so the next caller can lead a fresh attempt.
                let mut slots = self.lock();
                if let Some(Slot::Pending(pending)) = slots.get(track_id) {
                    if pending.same_channel(&rx) {
                        slots.remove(track_id);
                    }
                }
                return Err(ResolveError::Network(
                    "in-flight resolution was abandoned".to_string(),
                ));
            }
        }
    }

    async fn lead<F, Fut>(
        &self,
        track_id: &TrackId,
        resolve: F,
        tx: watch::Sender<Outcome>,
    ) -> Result<Resolution, ResolveError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Resolution, ResolveError>>,
    {
        let outcome = resolve().await;

        {
            let mut slots = self.lock();
            match &outcome {
                Ok(resolution) => {
                    slots.insert(
                        track_id.clone(),
                        Slot::Ready {
                            resolution: resolution.clone(),
                            resolved_at: Instant::now(),
                        },
                    );
                    Self::enforce_ceiling(&mut slots, self.ceiling);
                }
                Err(e) => {
                    debug!("resolution for {track_id} failed, not cached: {e}");
                    slots.remove(track_id);
                }
            }
        }

        // Publish after the map is consistent; joiners may re-enter.
        let _ = tx.send(Some(outcome.clone()));
        outcome
    }

    /// Evicts least-recently-resolved ready entries until the map fits
    /// the ceiling. Pending entries are never evicted.
    fn enforce_ceiling(slots: &mut HashMap<TrackId, Slot>, ceiling: usize) {
        while slots.len() > ceiling {
            let oldest = slots
                .iter()
                .filter_map(|(id, slot)| match slot {
                    Slot::Ready { resolved_at, .. } => Some((id.clone(), *resolved_at)),
                    Slot::Pending(_) => None,
                })
                .min_by_key(|(_, resolved_at)| *resolved_at);

            match oldest {
                Some((id, _)) => {
                    trace!("resolution cache over ceiling, evicting {id}");
                    slots.remove(&id);
                }
                None => break,
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<TrackId, Slot>> {
        // A poisoned lock means a panic while holding it; the map is
        // still structurally sound, so keep serving.
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
