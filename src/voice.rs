use std::process::Stdio;
use std::sync::Arc;

use dashmap::DashMap;
use serenity::async_trait;
use serenity::model::id::{ChannelId, GuildId};
use songbird::input::{ChildContainer, Input};
use songbird::tracks::TrackHandle;
use songbird::{Event, EventContext, EventHandler as VoiceEventHandler, Songbird, TrackEvent};
use tokio::sync::mpsc::UnboundedSender;

use crate::error::MusicError;
use crate::resolver::ResolvedSource;
use crate::session::SessionKey;

/// Posted when a track stops for any reason. The sequence number lets the
/// player drop signals for tracks it has already moved past.
#[derive(Debug, Clone)]
pub struct TrackEndSignal {
    pub key: SessionKey,
    pub seq: u64,
}

pub type TrackEndTx = UnboundedSender<TrackEndSignal>;

/// The voice transport as the orchestration core sees it. The production
/// implementation drives songbird; tests swap in a mock.
#[async_trait]
pub trait VoiceTransport: Send + Sync {
    async fn connect(&self, key: &SessionKey) -> Result<(), MusicError>;
    async fn disconnect(&self, key: &SessionKey) -> Result<(), MusicError>;
    fn is_connected(&self, key: &SessionKey) -> bool;
    /// Start playing a resolved source. A `TrackEndSignal` carrying `seq` is
    /// posted once the audio stops, whether it ended naturally or was halted.
    async fn play(&self, key: &SessionKey, source: &ResolvedSource, seq: u64)
    -> Result<(), MusicError>;
    async fn set_paused(&self, key: &SessionKey, paused: bool) -> Result<(), MusicError>;
    /// Stop the current audio, if any. Not an error when nothing is playing.
    async fn halt(&self, key: &SessionKey) -> Result<(), MusicError>;
    /// Keep the freshly negotiated voice connection's jitter buffer warm
    /// until a real track arrives. The handshake is slow and failure-prone;
    /// an idle connection right after it tends to get torn down.
    async fn play_silence(&self, key: &SessionKey);
}

#[derive(Clone)]
struct TrackEndNotifier {
    tx: TrackEndTx,
    key: SessionKey,
    seq: u64,
}

#[async_trait]
impl VoiceEventHandler for TrackEndNotifier {
    async fn act(&self, _ctx: &EventContext<'_>) -> Option<Event> {
        // Never touch session state here: this fires on the audio pump's
        // thread. Post the signal and let the player's own loop handle it.
        let _ = self.tx.send(TrackEndSignal {
            key: self.key.clone(),
            seq: self.seq,
        });
        Some(Event::Cancel)
    }
}

pub struct SongbirdTransport {
    manager: Arc<Songbird>,
    end_tx: TrackEndTx,
    volume: f32,
    handles: DashMap<GuildId, TrackHandle>,
    /// Which channel each guild's single live connection points at.
    channels: DashMap<GuildId, ChannelId>,
}

impl SongbirdTransport {
    pub fn new(manager: Arc<Songbird>, end_tx: TrackEndTx, volume: f32) -> Self {
        SongbirdTransport {
            manager,
            end_tx,
            volume,
            handles: DashMap::new(),
            channels: DashMap::new(),
        }
    }
}

#[async_trait]
impl VoiceTransport for SongbirdTransport {
    async fn connect(&self, key: &SessionKey) -> Result<(), MusicError> {
        self.manager
            .join(key.guild, key.channel)
            .await
            .map(|_| ())
            .map_err(|e| MusicError::Transport(format!("join failed: {e}")))?;
        self.channels.insert(key.guild, key.channel);
        Ok(())
    }

    async fn disconnect(&self, key: &SessionKey) -> Result<(), MusicError> {
        self.handles.remove(&key.guild);
        self.channels.remove(&key.guild);
        self.manager
            .remove(key.guild)
            .await
            .map_err(|e| MusicError::Transport(format!("leave failed: {e}")))
    }

    fn is_connected(&self, key: &SessionKey) -> bool {
        self.manager.get(key.guild).is_some()
            && self
                .channels
                .get(&key.guild)
                .is_some_and(|c| *c == key.channel)
    }

    async fn play(
        &self,
        key: &SessionKey,
        source: &ResolvedSource,
        seq: u64,
    ) -> Result<(), MusicError> {
        let call = self.manager.get(key.guild).ok_or(MusicError::NotConnected)?;

        let child = spawn_stream_ffmpeg(source)
            .map_err(|e| MusicError::Transport(format!("ffmpeg spawn failed: {e}")))?;
        let input: Input = ChildContainer::from(child).into();

        // play_only replaces whatever was on the call, including the
        // post-connect silence filler.
        let handle = { call.lock().await.play_only(input.into()) };
        let _ = handle.set_volume(self.volume);

        let notifier = TrackEndNotifier {
            tx: self.end_tx.clone(),
            key: key.clone(),
            seq,
        };
        handle
            .add_event(Event::Track(TrackEvent::End), notifier.clone())
            .map_err(|e| MusicError::Transport(format!("event hook failed: {e}")))?;
        let _ = handle.add_event(Event::Track(TrackEvent::Error), notifier);

        self.handles.insert(key.guild, handle);
        Ok(())
    }

    async fn set_paused(&self, key: &SessionKey, paused: bool) -> Result<(), MusicError> {
        let handle = self
            .handles
            .get(&key.guild)
            .ok_or(MusicError::NothingPlaying)?;
        let result = if paused { handle.pause() } else { handle.play() };
        result.map_err(|e| MusicError::Transport(format!("track control failed: {e}")))
    }

    async fn halt(&self, key: &SessionKey) -> Result<(), MusicError> {
        if let Some(handle) = self.handles.get(&key.guild) {
            handle
                .stop()
                .map_err(|e| MusicError::Transport(format!("stop failed: {e}")))?;
        }
        Ok(())
    }

    async fn play_silence(&self, key: &SessionKey) {
        let Some(call) = self.manager.get(key.guild) else {
            return;
        };
        match spawn_silence_ffmpeg() {
            Ok(child) => {
                let input: Input = ChildContainer::from(child).into();
                let handle = { call.lock().await.play_only(input.into()) };
                let _ = handle.set_volume(0.0);
            }
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "could not start silence stream");
            }
        }
    }
}

// Transcode to WAV (pcm_s16le) so symphonia can probe the stream reliably.
fn spawn_stream_ffmpeg(source: &ResolvedSource) -> std::io::Result<std::process::Child> {
    let mut cmd = std::process::Command::new("ffmpeg");
    cmd.arg("-hide_banner").arg("-loglevel").arg("error");
    for arg in source.params.reconnect_args {
        cmd.arg(arg);
    }
    if !source.headers.is_empty() {
        let mut header_str = String::new();
        for (name, value) in &source.headers {
            header_str.push_str(&format!("{name}: {value}\r\n"));
        }
        cmd.arg("-headers").arg(header_str);
    }
    cmd.arg("-i")
        .arg(&source.url)
        .arg("-vn")
        .arg("-af")
        .arg(source.params.audio_filter)
        .arg("-c:a")
        .arg("pcm_s16le")
        .arg("-f")
        .arg("wav")
        .arg("-ar")
        .arg("48000")
        .arg("-ac")
        .arg("2")
        .arg("pipe:1")
        .stdout(Stdio::piped())
        .stderr(Stdio::null());
    cmd.spawn()
}

fn spawn_silence_ffmpeg() -> std::io::Result<std::process::Child> {
    std::process::Command::new("ffmpeg")
        .args([
            "-hide_banner",
            "-loglevel",
            "error",
            "-f",
            "lavfi",
            "-i",
            "anullsrc=channel_layout=stereo:sample_rate=48000",
            "-f",
            "wav",
            "-ar",
            "48000",
            "-ac",
            "2",
            "pipe:1",
        ])
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
}
