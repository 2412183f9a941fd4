use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use serenity::model::id::GuildId;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::Instant;

use crate::error::MusicError;
use crate::queue::Track;
use crate::resolver::AudioResolver;
use crate::session::{ConnectionState, PlaybackState, Registry, SessionKey};
use crate::surface::SurfaceSync;
use crate::voice::{TrackEndSignal, VoiceTransport};

#[derive(Debug, Clone)]
pub struct PlayerSettings {
    pub join_cooldown: Duration,
    pub batch_size: usize,
}

impl Default for PlayerSettings {
    fn default() -> Self {
        PlayerSettings {
            join_cooldown: Duration::from_secs(5),
            batch_size: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToggleOutcome {
    Paused,
    Resumed,
    Started,
}

impl ToggleOutcome {
    pub fn message(&self) -> &'static str {
        match self {
            ToggleOutcome::Paused => "Paused playback",
            ToggleOutcome::Resumed => "Resumed playback",
            ToggleOutcome::Started => "Started playback",
        }
    }
}

/// Session and playback orchestration. One instance per process; every
/// command path, button press, control-plane request and track-end signal
/// funnels through here, so per-key ordering rules live in one place.
pub struct Player {
    pub(crate) registry: Arc<Registry>,
    pub(crate) transport: Arc<dyn VoiceTransport>,
    pub(crate) resolver: Arc<dyn AudioResolver>,
    pub(crate) surfaces: Arc<SurfaceSync>,
    pub(crate) settings: PlayerSettings,
}

impl Player {
    pub fn new(
        registry: Arc<Registry>,
        transport: Arc<dyn VoiceTransport>,
        resolver: Arc<dyn AudioResolver>,
        surfaces: Arc<SurfaceSync>,
        settings: PlayerSettings,
    ) -> Arc<Self> {
        Arc::new(Player {
            registry,
            transport,
            resolver,
            surfaces,
            settings,
        })
    }

    /// Consume track-end signals posted by the transport's audio threads.
    /// This loop is the only re-entry point that does not originate from a
    /// user command; it goes through the same mutation paths as everything
    /// else.
    pub async fn drive(self: Arc<Self>, mut rx: UnboundedReceiver<TrackEndSignal>) {
        while let Some(signal) = rx.recv().await {
            if let Err(e) = self.handle_track_end(&signal).await {
                tracing::warn!(key = %signal.key, error = %e, "advance after track end failed");
            }
        }
    }

    pub async fn handle_track_end(&self, signal: &TrackEndSignal) -> Result<(), MusicError> {
        let session = self.registry.get_or_create(&signal.key);
        {
            let mut s = session.lock().await;
            if s.play_seq != signal.seq {
                tracing::debug!(key = %signal.key, seq = signal.seq, "stale track-end signal ignored");
                return Ok(());
            }
            s.current_track = None;
            s.playback_state = PlaybackState::Idle;
        }
        self.advance(&signal.key).await
    }

    /// Get a live connection for `key`, creating one when `connect` is set.
    ///
    /// Returns false without touching the transport while an attempt is
    /// already in flight, or while the previous attempt is under the join
    /// cooldown. The voice handshake is slow and failure-prone; concurrent
    /// commands retrying it would otherwise storm the gateway.
    pub async fn ensure_connected(
        &self,
        key: &SessionKey,
        connect: bool,
    ) -> Result<bool, MusicError> {
        let session = self.registry.get_or_create(key);
        {
            let mut s = session.lock().await;
            if self.transport.is_connected(key) {
                s.connection_state = ConnectionState::Connected;
                return Ok(true);
            }
            if s.connection_state == ConnectionState::Connected {
                // transport dropped underneath us
                s.connection_state = ConnectionState::Disconnected;
            }
            if !connect {
                return Ok(false);
            }
            if s.connection_state == ConnectionState::Connecting {
                return Ok(false);
            }
            if let Some(at) = s.last_join_attempt {
                if at.elapsed() < self.settings.join_cooldown {
                    return Ok(false);
                }
            }
            s.connection_state = ConnectionState::Connecting;
            s.last_join_attempt = Some(Instant::now());
        }

        let result = self.transport.connect(key).await;
        let mut s = session.lock().await;
        match result {
            Ok(()) => {
                s.connection_state = ConnectionState::Connected;
                drop(s);
                self.transport.play_silence(key).await;
                self.surfaces.refresh(key).await;
                Ok(true)
            }
            Err(e) => {
                s.connection_state = ConnectionState::Disconnected;
                Err(e)
            }
        }
    }

    /// Append one track, connecting first when asked, and start playback if
    /// the session was idle. Returns the queue length right after the
    /// append.
    pub async fn add_to_queue(
        &self,
        key: &SessionKey,
        track: Track,
        connect: bool,
    ) -> Result<usize, MusicError> {
        if !self.ensure_connected(key, connect).await? {
            return Err(MusicError::NotConnected);
        }
        let (len, was_idle) = {
            let session = self.registry.get_or_create(key);
            let mut s = session.lock().await;
            let len = s.queue.append(track);
            (len, s.playback_state == PlaybackState::Idle)
        };
        self.surfaces.refresh(key).await;
        if was_idle {
            if let Err(e) = self.advance(key).await {
                tracing::warn!(key = %key, error = %e, "could not start playback after append");
            }
        }
        Ok(len)
    }

    /// Queue-driven transition: pop the next track, resolve it, play it.
    /// A track whose URL cannot be resolved is dropped, never retried, and
    /// the next one is tried; one bad item must not stall the queue.
    pub async fn advance(&self, key: &SessionKey) -> Result<(), MusicError> {
        let session = self.registry.get_or_create(key);

        // Exhaustion is checked before the transport is touched at all.
        {
            let mut s = session.lock().await;
            if s.queue.is_empty() {
                s.current_track = None;
                s.playback_state = PlaybackState::Idle;
                drop(s);
                self.surfaces.refresh(key).await;
                return Ok(());
            }
        }

        if !self.ensure_connected(key, true).await? {
            return Err(MusicError::NotConnected);
        }

        loop {
            let (track, seq) = {
                let mut s = session.lock().await;
                let Some(track) = s.queue.pop_front() else {
                    s.current_track = None;
                    s.playback_state = PlaybackState::Idle;
                    drop(s);
                    self.surfaces.refresh(key).await;
                    return Ok(());
                };
                s.play_seq += 1;
                s.current_track = Some(track.clone());
                s.playback_state = PlaybackState::Playing;
                (track, s.play_seq)
            };

            let source = match self.resolver.resolve(&track.id).await {
                Ok(source) => source,
                Err(e) => {
                    tracing::warn!(key = %key, track = %track.id, error = %e, "dropping unresolvable track");
                    let mut s = session.lock().await;
                    if s.play_seq != seq {
                        return Ok(());
                    }
                    s.current_track = None;
                    s.playback_state = PlaybackState::Idle;
                    continue;
                }
            };

            // Re-validate after the suspension: a stop, follow or disconnect
            // that landed while we resolved makes this track stale.
            {
                let s = session.lock().await;
                if s.play_seq != seq {
                    return Ok(());
                }
            }

            match self.transport.play(key, &source, seq).await {
                Ok(()) => {
                    tracing::info!(key = %key, track = %track.title, "now playing");
                    self.surfaces.refresh(key).await;
                    return Ok(());
                }
                Err(e) => {
                    tracing::warn!(key = %key, track = %track.id, error = %e, "playback start failed, dropping track");
                    let mut s = session.lock().await;
                    if s.play_seq != seq {
                        return Ok(());
                    }
                    s.current_track = None;
                    s.playback_state = PlaybackState::Idle;
                    continue;
                }
            }
        }
    }

    pub async fn pause(&self, key: &SessionKey) -> Result<(), MusicError> {
        let session = self.registry.get_or_create(key);
        {
            let s = session.lock().await;
            if s.playback_state != PlaybackState::Playing {
                return Err(MusicError::NothingPlaying);
            }
        }
        self.transport.set_paused(key, true).await?;
        session.lock().await.playback_state = PlaybackState::Paused;
        self.surfaces.refresh(key).await;
        Ok(())
    }

    pub async fn resume(&self, key: &SessionKey) -> Result<(), MusicError> {
        let session = self.registry.get_or_create(key);
        {
            let s = session.lock().await;
            if s.playback_state != PlaybackState::Paused {
                return Err(MusicError::NothingPlaying);
            }
        }
        self.transport.set_paused(key, false).await?;
        session.lock().await.playback_state = PlaybackState::Playing;
        self.surfaces.refresh(key).await;
        Ok(())
    }

    pub async fn toggle(&self, key: &SessionKey) -> Result<ToggleOutcome, MusicError> {
        let (state, queue_empty) = {
            let session = self.registry.get_or_create(key);
            let s = session.lock().await;
            (s.playback_state, s.queue.is_empty())
        };
        match (state, queue_empty) {
            (PlaybackState::Playing, _) => {
                self.pause(key).await?;
                Ok(ToggleOutcome::Paused)
            }
            (PlaybackState::Paused, _) => {
                self.resume(key).await?;
                Ok(ToggleOutcome::Resumed)
            }
            (PlaybackState::Idle, false) => {
                self.advance(key).await?;
                Ok(ToggleOutcome::Started)
            }
            (PlaybackState::Idle, true) => Err(MusicError::NothingToPlay),
        }
    }

    /// Halt the current audio. The end signal that follows drives the
    /// actual queue advance, same as a natural end of track.
    pub async fn skip(&self, key: &SessionKey) -> Result<(), MusicError> {
        {
            let session = self.registry.get_or_create(key);
            let s = session.lock().await;
            if !matches!(
                s.playback_state,
                PlaybackState::Playing | PlaybackState::Paused
            ) {
                return Err(MusicError::NothingPlaying);
            }
        }
        self.transport.halt(key).await
    }

    /// Stop playback, clear the queue and the current track, and interrupt
    /// any bulk enqueue still feeding this session.
    pub async fn stop(&self, key: &SessionKey) -> Result<(), MusicError> {
        if !self.transport.is_connected(key) {
            return Err(MusicError::NotConnected);
        }
        {
            let session = self.registry.get_or_create(key);
            let mut s = session.lock().await;
            s.interrupted.store(true, Ordering::SeqCst);
            s.play_seq += 1;
            s.queue.clear();
            s.current_track = None;
            s.playback_state = PlaybackState::Idle;
        }
        let _ = self.transport.halt(key).await;
        self.surfaces.refresh(key).await;
        Ok(())
    }

    /// Raise the cooperative cancellation flag for `key` without touching
    /// playback. Polled by the bulk enqueue loop between items.
    pub async fn request_interrupt(&self, key: &SessionKey) {
        let session = self.registry.get_or_create(key);
        let s = session.lock().await;
        s.interrupted.store(true, Ordering::SeqCst);
    }

    pub async fn move_track(
        &self,
        key: &SessionKey,
        from: usize,
        to: usize,
    ) -> Result<(), MusicError> {
        {
            let session = self.registry.get_or_create(key);
            let mut s = session.lock().await;
            s.queue.move_track(from, to)?;
        }
        self.surfaces.refresh(key).await;
        Ok(())
    }

    pub async fn shuffle(&self, key: &SessionKey) -> Result<(), MusicError> {
        {
            let session = self.registry.get_or_create(key);
            let mut s = session.lock().await;
            let mut rng = rand::thread_rng();
            s.queue.shuffle(&mut rng)?;
        }
        self.surfaces.refresh(key).await;
        Ok(())
    }

    /// Clear the queue and the now-playing slot together; a stale
    /// now-playing display over an empty queue confuses every surface.
    pub async fn clear(&self, key: &SessionKey) -> Result<(), MusicError> {
        {
            let session = self.registry.get_or_create(key);
            let mut s = session.lock().await;
            s.play_seq += 1;
            s.queue.clear();
            s.current_track = None;
            s.playback_state = PlaybackState::Idle;
        }
        let _ = self.transport.halt(key).await;
        self.surfaces.refresh(key).await;
        Ok(())
    }

    pub async fn disconnect(&self, key: &SessionKey, preserve_queue: bool) -> Result<(), MusicError> {
        if !self.transport.is_connected(key) {
            return Err(MusicError::NotConnected);
        }
        {
            let session = self.registry.get_or_create(key);
            let mut s = session.lock().await;
            s.play_seq += 1;
            let current = s.current_track.take();
            if preserve_queue {
                if let Some(track) = current {
                    s.queue.push_front(track);
                }
            } else {
                s.queue.clear();
            }
            s.playback_state = PlaybackState::Idle;
            s.connection_state = ConnectionState::Disconnected;
        }
        self.transport.disconnect(key).await?;
        self.surfaces.refresh(key).await;
        Ok(())
    }

    /// The session key holding this guild's live voice connection, if any.
    pub fn active_key(&self, guild: GuildId) -> Option<SessionKey> {
        self.registry
            .keys_for_guild(guild)
            .into_iter()
            .find(|k| self.transport.is_connected(k))
    }

    /// Guild-wide disconnect: one live voice connection per guild is
    /// assumed, so the first connected key wins.
    pub async fn disconnect_guild(
        &self,
        guild: GuildId,
        preserve_queue: bool,
    ) -> Result<SessionKey, MusicError> {
        let key = self.active_key(guild).ok_or(MusicError::NotConnected)?;
        self.disconnect(&key, preserve_queue).await?;
        Ok(key)
    }

    /// Move the session to a new channel: stop without discarding, carry
    /// the queue over, re-front the in-flight track, and resume if it was
    /// playing.
    pub async fn follow(&self, old_key: &SessionKey, new_key: &SessionKey) -> Result<(), MusicError> {
        if old_key == new_key {
            self.ensure_connected(new_key, true).await?;
            return Ok(());
        }

        let (tracks, current, was_playing, was_paused) = {
            let session = self.registry.get_or_create(old_key);
            let mut s = session.lock().await;
            s.play_seq += 1;
            // a bulk enqueue still feeding the old session must stop
            s.interrupted.store(true, Ordering::SeqCst);
            let was_playing = s.playback_state == PlaybackState::Playing;
            let was_paused = s.playback_state == PlaybackState::Paused;
            let current = s.current_track.take();
            let tracks = s.queue.take_all();
            s.playback_state = PlaybackState::Idle;
            s.connection_state = ConnectionState::Disconnected;
            (tracks, current, was_playing, was_paused)
        };

        let _ = self.transport.halt(old_key).await;
        if self.transport.is_connected(old_key) {
            self.transport.disconnect(old_key).await?;
        }

        {
            let session = self.registry.get_or_create(new_key);
            let mut s = session.lock().await;
            s.queue.replace_all(tracks);
            if let Some(track) = current {
                if was_playing || was_paused {
                    s.queue.push_front(track);
                }
            }
            s.interrupted.store(false, Ordering::SeqCst);
        }

        if !self.ensure_connected(new_key, true).await? {
            self.surfaces.refresh(old_key).await;
            self.surfaces.refresh(new_key).await;
            return Err(MusicError::NotConnected);
        }

        if was_playing {
            self.advance(new_key).await?;
        }
        self.surfaces.refresh(old_key).await;
        self.surfaces.refresh(new_key).await;
        Ok(())
    }

    /// Join `key`'s channel, handing the session over when the guild is
    /// already connected somewhere else, and pick playback back up if
    /// tracks are waiting.
    pub async fn join(&self, key: &SessionKey) -> Result<(), MusicError> {
        if self.transport.is_connected(key) {
            self.ensure_connected(key, false).await?;
            return Ok(());
        }
        if let Some(old) = self
            .registry
            .keys_for_guild(key.guild)
            .into_iter()
            .find(|k| k != key && self.transport.is_connected(k))
        {
            return self.follow(&old, key).await;
        }
        if !self.ensure_connected(key, true).await? {
            return Err(MusicError::NotConnected);
        }
        let should_start = {
            let session = self.registry.get_or_create(key);
            let s = session.lock().await;
            s.playback_state == PlaybackState::Idle && !s.queue.is_empty()
        };
        if should_start {
            self.advance(key).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use crate::error::MusicError;
    use crate::queue::Track;
    use crate::session::{ConnectionState, PlaybackState};
    use crate::testutil::harness;
    use crate::voice::{TrackEndSignal, VoiceTransport};

    fn track(id: &str) -> Track {
        Track::from_video(id, format!("Title {id}"))
    }

    #[tokio::test]
    async fn advance_on_empty_queue_idles_without_touching_the_transport() {
        let h = harness();
        let key = h.key();

        h.player.advance(&key).await.unwrap();
        h.player.advance(&key).await.unwrap();

        let (state, conn, current, queued) = h.session_view(&key).await;
        assert_eq!(state, PlaybackState::Idle);
        assert_eq!(conn, ConnectionState::Disconnected);
        assert!(current.is_none());
        assert!(queued.is_empty());
        assert_eq!(h.transport.connect_calls.load(Ordering::SeqCst), 0);
        assert_eq!(h.transport.play_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn append_with_connect_starts_playback() {
        let h = harness();
        let key = h.key();

        let len = h.player.add_to_queue(&key, track("a"), true).await.unwrap();
        assert_eq!(len, 1);

        let (state, conn, current, queued) = h.session_view(&key).await;
        assert_eq!(state, PlaybackState::Playing);
        assert_eq!(conn, ConnectionState::Connected);
        assert_eq!(current.as_deref(), Some("a"));
        assert!(queued.is_empty());

        assert_eq!(h.transport.connect_calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.transport.play_calls.load(Ordering::SeqCst), 1);
        // silence starts the moment the connection is up, before any track
        assert_eq!(h.transport.silence_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn append_without_connect_fails_when_disconnected() {
        let h = harness();
        let key = h.key();
        let err = h.player.add_to_queue(&key, track("a"), false).await.unwrap_err();
        assert!(matches!(err, MusicError::NotConnected));
        assert_eq!(h.transport.connect_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn skip_hands_off_to_the_end_signal_and_advances() {
        let h = harness();
        let key = h.key();
        for id in ["a", "b", "c"] {
            h.player.add_to_queue(&key, track(id), true).await.unwrap();
        }
        let (_, _, current, queued) = h.session_view(&key).await;
        assert_eq!(current.as_deref(), Some("a"));
        assert_eq!(queued, vec!["b", "c"]);

        h.player.skip(&key).await.unwrap();
        assert_eq!(h.transport.halt_calls.load(Ordering::SeqCst), 1);

        // the halt surfaces as the same end signal a natural finish sends
        let seq = h.current_seq(&key).await;
        h.player
            .handle_track_end(&TrackEndSignal { key: key.clone(), seq })
            .await
            .unwrap();

        let (state, _, current, queued) = h.session_view(&key).await;
        assert_eq!(state, PlaybackState::Playing);
        assert_eq!(current.as_deref(), Some("b"));
        assert_eq!(queued, vec!["c"]);
        assert_eq!(h.transport.play_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn natural_end_on_empty_queue_goes_idle() {
        let h = harness();
        let key = h.key();
        h.player.add_to_queue(&key, track("a"), true).await.unwrap();

        let seq = h.current_seq(&key).await;
        h.player
            .handle_track_end(&TrackEndSignal { key: key.clone(), seq })
            .await
            .unwrap();

        let (state, _, current, queued) = h.session_view(&key).await;
        assert_eq!(state, PlaybackState::Idle);
        assert!(current.is_none());
        assert!(queued.is_empty());
        assert_eq!(h.transport.play_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn stale_end_signal_is_ignored() {
        let h = harness();
        let key = h.key();
        h.player.add_to_queue(&key, track("a"), true).await.unwrap();

        h.player
            .handle_track_end(&TrackEndSignal {
                key: key.clone(),
                seq: 0,
            })
            .await
            .unwrap();

        let (state, _, current, _) = h.session_view(&key).await;
        assert_eq!(state, PlaybackState::Playing);
        assert_eq!(current.as_deref(), Some("a"));
        assert_eq!(h.transport.play_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn toggle_walks_pause_resume_and_start() {
        let h = harness();
        let key = h.key();

        // Idle with an empty queue has nothing to offer
        let err = h.player.toggle(&key).await.unwrap_err();
        assert!(matches!(err, MusicError::NothingToPlay));

        h.player.add_to_queue(&key, track("a"), true).await.unwrap();

        let outcome = h.player.toggle(&key).await.unwrap();
        assert_eq!(outcome, super::ToggleOutcome::Paused);
        let (state, _, _, _) = h.session_view(&key).await;
        assert_eq!(state, PlaybackState::Paused);
        assert_eq!(h.transport.paused.lock().unwrap()[&key], true);

        let outcome = h.player.toggle(&key).await.unwrap();
        assert_eq!(outcome, super::ToggleOutcome::Resumed);
        let (state, _, _, _) = h.session_view(&key).await;
        assert_eq!(state, PlaybackState::Playing);
        assert_eq!(h.transport.paused.lock().unwrap()[&key], false);
    }

    #[tokio::test]
    async fn toggle_on_idle_session_with_waiting_tracks_starts_playback() {
        let h = harness();
        let key = h.key();
        h.seed_queue(&key, &["a", "b"]).await;

        let outcome = h.player.toggle(&key).await.unwrap();
        assert_eq!(outcome, super::ToggleOutcome::Started);
        let (state, _, current, queued) = h.session_view(&key).await;
        assert_eq!(state, PlaybackState::Playing);
        assert_eq!(current.as_deref(), Some("a"));
        assert_eq!(queued, vec!["b"]);
    }

    #[tokio::test]
    async fn skip_and_pause_require_something_playing() {
        let h = harness();
        let key = h.key();
        assert!(matches!(
            h.player.skip(&key).await.unwrap_err(),
            MusicError::NothingPlaying
        ));
        assert!(matches!(
            h.player.pause(&key).await.unwrap_err(),
            MusicError::NothingPlaying
        ));
    }

    #[tokio::test]
    async fn stop_clears_everything_and_raises_the_interrupt_flag() {
        let h = harness();
        let key = h.key();
        for id in ["a", "b", "c"] {
            h.player.add_to_queue(&key, track(id), true).await.unwrap();
        }

        h.player.stop(&key).await.unwrap();

        let (state, _, current, queued) = h.session_view(&key).await;
        assert_eq!(state, PlaybackState::Idle);
        assert!(current.is_none());
        assert!(queued.is_empty());
        assert!(h.transport.halt_calls.load(Ordering::SeqCst) >= 1);

        let session = h.registry.get_or_create(&key);
        let flag = session.lock().await.interrupted.clone();
        assert!(flag.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn stop_needs_a_live_connection() {
        let h = harness();
        let key = h.key();
        assert!(matches!(
            h.player.stop(&key).await.unwrap_err(),
            MusicError::NotConnected
        ));
    }

    #[tokio::test]
    async fn disconnect_preserving_queue_refronts_the_current_track() {
        let h = harness();
        let key = h.key();
        h.player.add_to_queue(&key, track("c"), true).await.unwrap();
        h.player.add_to_queue(&key, track("d"), true).await.unwrap();
        h.player.pause(&key).await.unwrap();

        let (state, _, current, queued) = h.session_view(&key).await;
        assert_eq!(state, PlaybackState::Paused);
        assert_eq!(current.as_deref(), Some("c"));
        assert_eq!(queued, vec!["d"]);

        h.player.disconnect(&key, true).await.unwrap();

        let (state, conn, current, queued) = h.session_view(&key).await;
        assert_eq!(state, PlaybackState::Idle);
        assert_eq!(conn, ConnectionState::Disconnected);
        assert!(current.is_none());
        assert_eq!(queued, vec!["c", "d"]);
        assert!(!h.transport.is_connected(&key));
    }

    #[tokio::test]
    async fn disconnect_without_preserve_clears_the_queue() {
        let h = harness();
        let key = h.key();
        for id in ["a", "b"] {
            h.player.add_to_queue(&key, track(id), true).await.unwrap();
        }
        h.player.disconnect(&key, false).await.unwrap();

        let (_, conn, current, queued) = h.session_view(&key).await;
        assert_eq!(conn, ConnectionState::Disconnected);
        assert!(current.is_none());
        assert!(queued.is_empty());
    }

    #[tokio::test]
    async fn disconnect_when_not_connected_is_an_error() {
        let h = harness();
        assert!(matches!(
            h.player.disconnect(&h.key(), true).await.unwrap_err(),
            MusicError::NotConnected
        ));
        assert!(matches!(
            h.player
                .disconnect_guild(h.key().guild, true)
                .await
                .unwrap_err(),
            MusicError::NotConnected
        ));
    }

    #[tokio::test]
    async fn disconnect_guild_finds_the_single_live_connection() {
        let h = harness();
        let key = h.key();
        h.player.add_to_queue(&key, track("a"), true).await.unwrap();

        let hit = h.player.disconnect_guild(key.guild, false).await.unwrap();
        assert_eq!(hit, key);
        assert!(!h.transport.is_connected(&key));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_connect_is_not_retried_inside_the_cooldown() {
        let h = harness();
        let key = h.key();
        h.transport.fail_connect.store(true, Ordering::SeqCst);

        let err = h.player.ensure_connected(&key, true).await.unwrap_err();
        assert!(matches!(err, MusicError::Transport(_)));
        assert_eq!(h.transport.connect_calls.load(Ordering::SeqCst), 1);

        // within the 5 second window nothing reaches the transport
        assert!(!h.player.ensure_connected(&key, true).await.unwrap());
        assert_eq!(h.transport.connect_calls.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_secs(6)).await;
        let _ = h.player.ensure_connected(&key, true).await;
        assert_eq!(h.transport.connect_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn concurrent_connects_do_not_stack() {
        let h = harness();
        let key = h.key();
        h.transport.hold_connects();

        let player = h.player.clone();
        let key2 = key.clone();
        let first = tokio::spawn(async move { player.ensure_connected(&key2, true).await });
        tokio::task::yield_now().await;

        // second caller sees the in-flight attempt and backs off
        assert!(!h.player.ensure_connected(&key, true).await.unwrap());
        assert_eq!(h.transport.connect_calls.load(Ordering::SeqCst), 1);

        h.transport.release_connect();
        assert!(first.await.unwrap().unwrap());
        assert!(h.transport.is_connected(&key));
    }

    #[tokio::test]
    async fn ensure_connected_is_idempotent_for_a_live_connection() {
        let h = harness();
        let key = h.key();
        assert!(h.player.ensure_connected(&key, true).await.unwrap());
        assert!(h.player.ensure_connected(&key, true).await.unwrap());
        assert_eq!(h.transport.connect_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unresolvable_track_is_dropped_and_the_next_one_plays() {
        let h = harness();
        let key = h.key();
        h.resolver.fail_for("bad");
        h.seed_queue(&key, &["bad", "good"]).await;

        h.player.toggle(&key).await.unwrap();

        let (state, _, current, queued) = h.session_view(&key).await;
        assert_eq!(state, PlaybackState::Playing);
        assert_eq!(current.as_deref(), Some("good"));
        assert!(queued.is_empty());
        assert_eq!(h.transport.play_calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.resolver.resolve_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn systemic_resolution_failure_drains_the_queue_to_idle() {
        let h = harness();
        let key = h.key();
        for id in ["x1", "x2", "x3"] {
            h.resolver.fail_for(id);
        }
        h.seed_queue(&key, &["x1", "x2", "x3"]).await;

        h.player.toggle(&key).await.unwrap();

        let (state, _, current, queued) = h.session_view(&key).await;
        assert_eq!(state, PlaybackState::Idle);
        assert!(current.is_none());
        assert!(queued.is_empty());
        assert_eq!(h.transport.play_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn move_track_reorders_and_rejects_bad_indexes() {
        let h = harness();
        let key = h.key();
        h.seed_queue(&key, &["a", "b", "c"]).await;

        h.player.move_track(&key, 0, 2).await.unwrap();
        let (_, _, _, queued) = h.session_view(&key).await;
        assert_eq!(queued, vec!["b", "c", "a"]);

        let err = h.player.move_track(&key, 5, 0).await.unwrap_err();
        assert!(matches!(err, MusicError::InvalidIndex { .. }));
        let (_, _, _, queued) = h.session_view(&key).await;
        assert_eq!(queued, vec!["b", "c", "a"]);
    }

    #[tokio::test]
    async fn shuffle_on_empty_queue_is_distinguishable_from_success() {
        let h = harness();
        assert!(matches!(
            h.player.shuffle(&h.key()).await.unwrap_err(),
            MusicError::EmptyQueue
        ));
    }

    #[tokio::test]
    async fn clear_drops_queue_and_now_playing_together() {
        let h = harness();
        let key = h.key();
        for id in ["a", "b", "c"] {
            h.player.add_to_queue(&key, track(id), true).await.unwrap();
        }

        h.player.clear(&key).await.unwrap();

        let (state, _, current, queued) = h.session_view(&key).await;
        assert_eq!(state, PlaybackState::Idle);
        assert!(current.is_none());
        assert!(queued.is_empty());
    }

    #[tokio::test]
    async fn follow_carries_the_session_to_the_new_channel_and_resumes() {
        let h = harness();
        let old = h.key();
        let new = h.other_key();
        for id in ["a", "b", "c"] {
            h.player.add_to_queue(&old, track(id), true).await.unwrap();
        }

        h.player.follow(&old, &new).await.unwrap();

        assert!(!h.transport.is_connected(&old));
        assert!(h.transport.is_connected(&new));

        // the in-flight track went to the front and resumed immediately
        let (state, _, current, queued) = h.session_view(&new).await;
        assert_eq!(state, PlaybackState::Playing);
        assert_eq!(current.as_deref(), Some("a"));
        assert_eq!(queued, vec!["b", "c"]);
        assert_eq!(h.transport.play_calls.load(Ordering::SeqCst), 2);

        let (state, conn, current, queued) = h.session_view(&old).await;
        assert_eq!(state, PlaybackState::Idle);
        assert_eq!(conn, ConnectionState::Disconnected);
        assert!(current.is_none());
        assert!(queued.is_empty());

        // the hand-off interrupts bulk work on the old key and starts the
        // new key with a clean flag
        let old_session = h.registry.get_or_create(&old);
        assert!(old_session.lock().await.interrupted.load(Ordering::SeqCst));
        let new_session = h.registry.get_or_create(&new);
        assert!(!new_session.lock().await.interrupted.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn follow_while_paused_refronts_but_does_not_resume() {
        let h = harness();
        let old = h.key();
        let new = h.other_key();
        h.player.add_to_queue(&old, track("a"), true).await.unwrap();
        h.player.add_to_queue(&old, track("b"), true).await.unwrap();
        h.player.pause(&old).await.unwrap();

        h.player.follow(&old, &new).await.unwrap();

        let (state, _, current, queued) = h.session_view(&new).await;
        assert_eq!(state, PlaybackState::Idle);
        assert!(current.is_none());
        assert_eq!(queued, vec!["a", "b"]);
        assert_eq!(h.transport.play_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn join_moves_an_existing_guild_connection() {
        let h = harness();
        let old = h.key();
        let new = h.other_key();
        h.player.add_to_queue(&old, track("a"), true).await.unwrap();

        h.player.join(&new).await.unwrap();

        assert!(!h.transport.is_connected(&old));
        assert!(h.transport.is_connected(&new));
        let (state, _, current, _) = h.session_view(&new).await;
        assert_eq!(state, PlaybackState::Playing);
        assert_eq!(current.as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn join_resumes_a_waiting_queue() {
        let h = harness();
        let key = h.key();
        h.seed_queue(&key, &["a"]).await;

        h.player.join(&key).await.unwrap();

        let (state, _, current, _) = h.session_view(&key).await;
        assert_eq!(state, PlaybackState::Playing);
        assert_eq!(current.as_deref(), Some("a"));
    }
}
