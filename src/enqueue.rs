use std::sync::atomic::Ordering;

use crate::error::MusicError;
use crate::player::Player;
use crate::queue::Track;
use crate::session::{PlaybackState, SessionKey};

/// Terminal outcome of one bulk enqueue run. Interruption is a normal
/// outcome here, not a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EnqueueSummary {
    pub added: usize,
    pub failed: usize,
    pub interrupted: bool,
}

impl EnqueueSummary {
    pub fn message(&self) -> String {
        let mut msg = format!("Added {} tracks", self.added);
        if self.failed > 0 {
            msg.push_str(&format!(", {} failed", self.failed));
        }
        if self.interrupted {
            msg.push_str(" (interrupted)");
        }
        msg
    }
}

impl Player {
    /// Add many tracks (typically a playlist) in batches.
    ///
    /// The session's interrupt flag is polled before every item; raising it
    /// abandons the remainder cooperatively, nothing in flight is aborted.
    /// One item failing never stops the batch. Surfaces get a progress
    /// notice per batch and exactly one terminal summary.
    pub async fn enqueue_many(
        &self,
        key: &SessionKey,
        tracks: Vec<Track>,
    ) -> Result<EnqueueSummary, MusicError> {
        let session = self.registry.get_or_create(key);
        let flag = { session.lock().await.interrupted.clone() };
        flag.store(false, Ordering::SeqCst);

        let total = tracks.len();
        let batch_size = self.settings.batch_size.max(1);
        let mut summary = EnqueueSummary::default();
        let mut kicked = false;

        'batches: for batch in tracks.chunks(batch_size) {
            for track in batch {
                if flag.load(Ordering::SeqCst) {
                    summary.interrupted = true;
                    break 'batches;
                }
                match self.enqueue_one(key, track.clone(), &mut kicked).await {
                    Ok(()) => summary.added += 1,
                    Err(e) => {
                        tracing::warn!(key = %key, track = %track.id, error = %e, "bulk enqueue item failed");
                        summary.failed += 1;
                    }
                }
            }
            let done = summary.added + summary.failed;
            if done < total && !flag.load(Ordering::SeqCst) {
                let pct = done * 100 / total.max(1);
                self.surfaces
                    .notify(key, &format!("Adding playlist: {pct}% ({done}/{total})"))
                    .await;
                self.surfaces.refresh(key).await;
            }
        }

        flag.store(false, Ordering::SeqCst);
        tracing::info!(
            key = %key,
            added = summary.added,
            failed = summary.failed,
            interrupted = summary.interrupted,
            "bulk enqueue finished"
        );
        self.surfaces.notify(key, &summary.message()).await;
        self.surfaces.refresh(key).await;
        Ok(summary)
    }

    async fn enqueue_one(
        &self,
        key: &SessionKey,
        track: Track,
        kicked: &mut bool,
    ) -> Result<(), MusicError> {
        if !self.ensure_connected(key, true).await? {
            return Err(MusicError::NotConnected);
        }
        let was_idle = {
            let session = self.registry.get_or_create(key);
            let mut s = session.lock().await;
            s.queue.append(track);
            s.playback_state == PlaybackState::Idle
        };
        // Kick playback once per run; every later append lands behind the
        // track that is already playing.
        if was_idle && !*kicked {
            *kicked = true;
            if let Err(e) = self.advance(key).await {
                tracing::warn!(key = %key, error = %e, "could not start playback during bulk enqueue");
            }
        }
        Ok(())
    }
}
