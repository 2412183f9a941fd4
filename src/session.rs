use std::fmt;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use dashmap::DashMap;
use serde::Serialize;
use serenity::model::id::{ChannelId, GuildId};
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::queue::{Track, TrackQueue};

/// Identifies one playback context: a voice channel inside a guild.
///
/// Rendered as `"{guild}_{channel}"`. A guild is assumed to hold one live
/// voice connection at a time, but the key keeps the channel component so
/// per-channel queues survive a channel hand-off.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub guild: GuildId,
    pub channel: ChannelId,
}

impl SessionKey {
    pub fn new(guild: impl Into<GuildId>, channel: impl Into<ChannelId>) -> Self {
        SessionKey {
            guild: guild.into(),
            channel: channel.into(),
        }
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.guild.get(), self.channel.get())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackState {
    Idle,
    Playing,
    Paused,
}

/// The full mutable state for one session key.
///
/// Mutations hold the session lock for a short synchronous section with no
/// await inside; anything that must suspend (URL resolution, transport
/// calls) snapshots what it needs, drops the lock, and re-validates with
/// `play_seq` before applying a deferred change.
pub struct Session {
    pub key: SessionKey,
    pub queue: TrackQueue,
    pub current_track: Option<Track>,
    pub connection_state: ConnectionState,
    pub playback_state: PlaybackState,
    /// Cooperative cancellation for an in-flight bulk enqueue. Shared as an
    /// Arc so the bulk loop can poll it without re-taking the session lock.
    pub interrupted: Arc<AtomicBool>,
    pub last_join_attempt: Option<Instant>,
    /// Bumped whenever the current track changes or is forcibly cleared.
    /// Track-end signals carry the sequence they were issued for; a stale
    /// signal is dropped instead of advancing someone else's playback.
    pub play_seq: u64,
}

impl Session {
    pub fn new(key: SessionKey) -> Self {
        Session {
            key,
            queue: TrackQueue::new(),
            current_track: None,
            connection_state: ConnectionState::Disconnected,
            playback_state: PlaybackState::Idle,
            interrupted: Arc::new(AtomicBool::new(false)),
            last_join_attempt: None,
            play_seq: 0,
        }
    }
}

pub type SharedSession = Arc<Mutex<Session>>;

/// Process-scoped store mapping session keys to sessions. Entries are
/// created lazily and never removed; a session with an empty queue, no
/// current track and no connection is simply inert.
#[derive(Default)]
pub struct Registry {
    sessions: DashMap<SessionKey, SharedSession>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_create(&self, key: &SessionKey) -> SharedSession {
        self.sessions
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(Session::new(key.clone()))))
            .clone()
    }

    pub fn get(&self, key: &SessionKey) -> Option<SharedSession> {
        self.sessions.get(key).map(|e| e.value().clone())
    }

    /// All keys registered under a guild, in no particular order.
    pub fn keys_for_guild(&self, guild: GuildId) -> Vec<SessionKey> {
        self.sessions
            .iter()
            .filter(|e| e.key().guild == guild)
            .map(|e| e.key().clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_display_uses_guild_underscore_channel() {
        let key = SessionKey::new(123u64, 456u64);
        assert_eq!(key.to_string(), "123_456");
    }

    #[tokio::test]
    async fn get_or_create_returns_the_same_session() {
        let registry = Registry::new();
        let key = SessionKey::new(1u64, 2u64);
        let a = registry.get_or_create(&key);
        let b = registry.get_or_create(&key);
        assert!(Arc::ptr_eq(&a, &b));

        let other = registry.get_or_create(&SessionKey::new(1u64, 3u64));
        assert!(!Arc::ptr_eq(&a, &other));
    }

    #[test]
    fn keys_for_guild_filters_by_guild() {
        let registry = Registry::new();
        registry.get_or_create(&SessionKey::new(1u64, 10u64));
        registry.get_or_create(&SessionKey::new(1u64, 11u64));
        registry.get_or_create(&SessionKey::new(2u64, 20u64));

        let mut keys = registry.keys_for_guild(GuildId::new(1));
        keys.sort_by_key(|k| k.channel.get());
        assert_eq!(keys.len(), 2);
        assert_eq!(keys[0].channel.get(), 10);
        assert_eq!(keys[1].channel.get(), 11);
    }
}
