use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;
use serenity::async_trait;

use crate::error::MusicError;
use crate::queue::Track;
use crate::session::{ConnectionState, PlaybackState, Registry, SessionKey};

/// Presentation view of one session. Every control surface renders from
/// this and nothing else.
#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    pub key: String,
    pub queue_preview: Vec<Track>,
    pub queue_len: usize,
    /// Tracks beyond the preview window.
    pub overflow: usize,
    pub current_track: Option<Track>,
    pub connection_state: ConnectionState,
    pub playback_state: PlaybackState,
}

/// One rendering target for snapshots and transient notices. A push that
/// fails gets the surface dropped from the registration set.
#[async_trait]
pub trait SurfaceSink: Send + Sync {
    async fn push(&self, snapshot: &Snapshot) -> Result<(), MusicError>;
    async fn notice(&self, text: &str) -> Result<(), MusicError>;
}

struct Registration {
    key: SessionKey,
    sink: Arc<dyn SurfaceSink>,
}

/// Keeps every registered surface consistent with session state. Many
/// surfaces may watch one session; registration changes are independent
/// and need no coordination beyond the map itself.
pub struct SurfaceSync {
    registry: Arc<Registry>,
    preview_len: usize,
    surfaces: DashMap<String, Registration>,
}

impl SurfaceSync {
    pub fn new(registry: Arc<Registry>, preview_len: usize) -> Self {
        SurfaceSync {
            registry,
            preview_len,
            surfaces: DashMap::new(),
        }
    }

    pub fn register(
        &self,
        surface_id: impl Into<String>,
        key: SessionKey,
        sink: Arc<dyn SurfaceSink>,
    ) {
        self.surfaces
            .insert(surface_id.into(), Registration { key, sink });
    }

    pub fn unregister(&self, surface_id: &str) {
        self.surfaces.remove(surface_id);
    }

    pub async fn snapshot(&self, key: &SessionKey) -> Snapshot {
        let session = self.registry.get_or_create(key);
        let s = session.lock().await;
        let queue_len = s.queue.len();
        let queue_preview: Vec<Track> = s.queue.iter().take(self.preview_len).cloned().collect();
        Snapshot {
            key: key.to_string(),
            overflow: queue_len.saturating_sub(queue_preview.len()),
            queue_preview,
            queue_len,
            current_track: s.current_track.clone(),
            connection_state: s.connection_state,
            playback_state: s.playback_state,
        }
    }

    fn sinks_for(&self, key: &SessionKey) -> Vec<(String, Arc<dyn SurfaceSink>)> {
        self.surfaces
            .iter()
            .filter(|e| e.value().key == *key)
            .map(|e| (e.key().clone(), e.value().sink.clone()))
            .collect()
    }

    /// Recompute the snapshot once and push it to every surface watching
    /// `key`. Idempotent and safe to call redundantly. One failing surface
    /// never blocks the rest.
    pub async fn refresh(&self, key: &SessionKey) {
        let snapshot = self.snapshot(key).await;
        for (id, sink) in self.sinks_for(key) {
            if let Err(e) = sink.push(&snapshot).await {
                tracing::warn!(surface = %id, error = %e, "surface push failed, dropping registration");
                self.surfaces.remove(&id);
            }
        }
    }

    /// Deliver a transient, out-of-band message (bulk enqueue progress and
    /// summaries) to every surface watching `key`.
    pub async fn notify(&self, key: &SessionKey, text: &str) {
        for (id, sink) in self.sinks_for(key) {
            if let Err(e) = sink.notice(text).await {
                tracing::warn!(surface = %id, error = %e, "surface notice failed, dropping registration");
                self.surfaces.remove(&id);
            }
        }
    }
}
