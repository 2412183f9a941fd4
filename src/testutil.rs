//! Shared mocks for exercising the orchestration core without a gateway,
//! a voice transport or yt-dlp.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serenity::async_trait;
use tokio::sync::Semaphore;

use crate::error::MusicError;
use crate::player::{Player, PlayerSettings};
use crate::queue::Track;
use crate::resolver::{AudioResolver, Quality, ResolvedSource, stream_params};
use crate::session::{ConnectionState, PlaybackState, Registry, SessionKey};
use crate::surface::{Snapshot, SurfaceSink, SurfaceSync};
use crate::voice::VoiceTransport;

pub struct MockTransport {
    pub connected: Mutex<HashSet<SessionKey>>,
    pub connect_calls: AtomicUsize,
    pub play_calls: AtomicUsize,
    pub plays: Mutex<Vec<(SessionKey, String, u64)>>,
    pub halt_calls: AtomicUsize,
    pub silence_calls: AtomicUsize,
    pub paused: Mutex<HashMap<SessionKey, bool>>,
    pub fail_connect: AtomicBool,
    gate_enabled: AtomicBool,
    gate: Semaphore,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(MockTransport {
            connected: Mutex::new(HashSet::new()),
            connect_calls: AtomicUsize::new(0),
            play_calls: AtomicUsize::new(0),
            plays: Mutex::new(Vec::new()),
            halt_calls: AtomicUsize::new(0),
            silence_calls: AtomicUsize::new(0),
            paused: Mutex::new(HashMap::new()),
            fail_connect: AtomicBool::new(false),
            gate_enabled: AtomicBool::new(false),
            gate: Semaphore::new(0),
        })
    }

    /// Make every subsequent connect park until `release_connect` is called.
    pub fn hold_connects(&self) {
        self.gate_enabled.store(true, Ordering::SeqCst);
    }

    pub fn release_connect(&self) {
        self.gate.add_permits(1);
    }
}

#[async_trait]
impl VoiceTransport for MockTransport {
    async fn connect(&self, key: &SessionKey) -> Result<(), MusicError> {
        self.connect_calls.fetch_add(1, Ordering::SeqCst);
        if self.gate_enabled.load(Ordering::SeqCst) {
            let permit = self.gate.acquire().await.expect("gate closed");
            permit.forget();
        }
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(MusicError::Transport("mock connect refused".into()));
        }
        self.connected.lock().unwrap().insert(key.clone());
        Ok(())
    }

    async fn disconnect(&self, key: &SessionKey) -> Result<(), MusicError> {
        self.connected.lock().unwrap().remove(key);
        self.paused.lock().unwrap().remove(key);
        Ok(())
    }

    fn is_connected(&self, key: &SessionKey) -> bool {
        self.connected.lock().unwrap().contains(key)
    }

    async fn play(
        &self,
        key: &SessionKey,
        source: &ResolvedSource,
        seq: u64,
    ) -> Result<(), MusicError> {
        self.play_calls.fetch_add(1, Ordering::SeqCst);
        self.plays
            .lock()
            .unwrap()
            .push((key.clone(), source.url.clone(), seq));
        self.paused.lock().unwrap().insert(key.clone(), false);
        Ok(())
    }

    async fn set_paused(&self, key: &SessionKey, paused: bool) -> Result<(), MusicError> {
        self.paused.lock().unwrap().insert(key.clone(), paused);
        Ok(())
    }

    async fn halt(&self, _key: &SessionKey) -> Result<(), MusicError> {
        self.halt_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn play_silence(&self, _key: &SessionKey) {
        self.silence_calls.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct MockResolver {
    pub fail_ids: Mutex<HashSet<String>>,
    pub resolve_calls: AtomicUsize,
}

impl MockResolver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_for(&self, id: &str) {
        self.fail_ids.lock().unwrap().insert(id.to_string());
    }
}

#[async_trait]
impl AudioResolver for MockResolver {
    async fn resolve(&self, track_id: &str) -> Result<ResolvedSource, MusicError> {
        self.resolve_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_ids.lock().unwrap().contains(track_id) {
            return Err(MusicError::Extraction(format!("no stream for {track_id}")));
        }
        Ok(ResolvedSource {
            url: format!("https://stream.test/{track_id}"),
            headers: Vec::new(),
            params: stream_params(Quality::Medium),
        })
    }
}

#[derive(Default)]
pub struct RecordingSink {
    pub pushes: Mutex<Vec<Snapshot>>,
    pub notices: Mutex<Vec<String>>,
}

#[async_trait]
impl SurfaceSink for RecordingSink {
    async fn push(&self, snapshot: &Snapshot) -> Result<(), MusicError> {
        self.pushes.lock().unwrap().push(snapshot.clone());
        Ok(())
    }

    async fn notice(&self, text: &str) -> Result<(), MusicError> {
        self.notices.lock().unwrap().push(text.to_string());
        Ok(())
    }
}

/// Raises a session's interrupt flag the moment the first notice arrives,
/// which in bulk enqueue terms means "at the first batch boundary". Fires
/// once; later notices (the terminal summary) leave the flag alone.
pub struct InterruptingSink {
    flag: Arc<AtomicBool>,
    armed: AtomicBool,
    pub notices: Mutex<Vec<String>>,
}

impl InterruptingSink {
    pub fn new(flag: Arc<AtomicBool>) -> Self {
        InterruptingSink {
            flag,
            armed: AtomicBool::new(true),
            notices: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl SurfaceSink for InterruptingSink {
    async fn push(&self, _snapshot: &Snapshot) -> Result<(), MusicError> {
        Ok(())
    }

    async fn notice(&self, text: &str) -> Result<(), MusicError> {
        if self.armed.swap(false, Ordering::SeqCst) {
            self.flag.store(true, Ordering::SeqCst);
        }
        self.notices.lock().unwrap().push(text.to_string());
        Ok(())
    }
}

pub struct Harness {
    pub player: Arc<Player>,
    pub registry: Arc<Registry>,
    pub transport: Arc<MockTransport>,
    pub resolver: Arc<MockResolver>,
    pub surfaces: Arc<SurfaceSync>,
}

impl Harness {
    pub fn key(&self) -> SessionKey {
        SessionKey::new(100u64, 200u64)
    }

    pub fn other_key(&self) -> SessionKey {
        SessionKey::new(100u64, 201u64)
    }

    /// (playback state, connection state, current track id, queued ids)
    pub async fn session_view(
        &self,
        key: &SessionKey,
    ) -> (PlaybackState, ConnectionState, Option<String>, Vec<String>) {
        let session = self.registry.get_or_create(key);
        let s = session.lock().await;
        (
            s.playback_state,
            s.connection_state,
            s.current_track.as_ref().map(|t| t.id.clone()),
            s.queue.iter().map(|t| t.id.clone()).collect(),
        )
    }

    pub async fn current_seq(&self, key: &SessionKey) -> u64 {
        let session = self.registry.get_or_create(key);
        let s = session.lock().await;
        s.play_seq
    }

    pub async fn seed_queue(&self, key: &SessionKey, ids: &[&str]) {
        let session = self.registry.get_or_create(key);
        let mut s = session.lock().await;
        for id in ids {
            s.queue.append(Track::from_video(*id, format!("Title {id}")));
        }
    }
}

pub fn tracks(n: usize) -> Vec<Track> {
    (0..n)
        .map(|i| Track::from_video(format!("vid{i}"), format!("Track {i}")))
        .collect()
}

pub fn harness() -> Harness {
    let registry = Arc::new(Registry::new());
    let transport = MockTransport::new();
    let resolver = MockResolver::new();
    let surfaces = Arc::new(SurfaceSync::new(registry.clone(), 5));
    let player = Player::new(
        registry.clone(),
        transport.clone(),
        resolver.clone(),
        surfaces.clone(),
        PlayerSettings {
            join_cooldown: Duration::from_secs(5),
            batch_size: 3,
        },
    );
    Harness {
        player,
        registry,
        transport,
        resolver,
        surfaces,
    }
}
