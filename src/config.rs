use serde::Deserialize;
use std::io::ErrorKind;

use crate::error::BoxError;

pub const CONFIG_PATH: &str = "config.jsonc";

const DEFAULT_CONFIG: &str = r#"// Global bot config (JSONC: supports comments)
{
  // HTTP API consumed by the web dashboard process
  "control_plane": {
    "bind": "0.0.0.0:5001"
  },
  "music": {
    // Minimum seconds between voice connect attempts for one session
    "join_cooldown_secs": 5,
    // Bulk playlist enqueue: tracks added between progress updates
    "batch_size": 10,
    // Tracks shown in control panel / snapshot previews
    "queue_preview": 5,
    // Stream quality tier: low, medium, high
    "quality": "medium",
    "volume": 0.5,
    // Hard cap on tracks taken from one playlist
    "max_playlist_tracks": 100,
    // Seconds before transient confirmations are deleted
    "cleartimer_secs": 10
  }
}
"#;

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    #[serde(default)]
    pub control_plane: ControlPlaneConfig,
    #[serde(default)]
    pub music: MusicConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ControlPlaneConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct MusicConfig {
    #[serde(default = "default_cooldown")]
    pub join_cooldown_secs: u64,
    #[serde(default = "default_batch")]
    pub batch_size: usize,
    #[serde(default = "default_preview")]
    pub queue_preview: usize,
    #[serde(default = "default_quality")]
    pub quality: String,
    #[serde(default = "default_volume")]
    pub volume: f32,
    #[serde(default = "default_max_playlist")]
    pub max_playlist_tracks: usize,
    #[serde(default = "default_cleartimer")]
    pub cleartimer_secs: u64,
}

fn default_bind() -> String {
    "0.0.0.0:5001".into()
}
fn default_cooldown() -> u64 {
    5
}
fn default_batch() -> usize {
    10
}
fn default_preview() -> usize {
    5
}
fn default_quality() -> String {
    "medium".into()
}
fn default_volume() -> f32 {
    0.5
}
fn default_max_playlist() -> usize {
    100
}
fn default_cleartimer() -> u64 {
    10
}

impl Default for ControlPlaneConfig {
    fn default() -> Self {
        ControlPlaneConfig {
            bind: default_bind(),
        }
    }
}

impl Default for MusicConfig {
    fn default() -> Self {
        MusicConfig {
            join_cooldown_secs: default_cooldown(),
            batch_size: default_batch(),
            queue_preview: default_preview(),
            quality: default_quality(),
            volume: default_volume(),
            max_playlist_tracks: default_max_playlist(),
            cleartimer_secs: default_cleartimer(),
        }
    }
}

pub async fn ensure_default_config() -> Result<(), BoxError> {
    match tokio::fs::metadata(CONFIG_PATH).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => {
            tokio::fs::write(CONFIG_PATH, DEFAULT_CONFIG).await?;
            Ok(())
        }
        Err(e) => Err(Box::new(e)),
    }
}

pub async fn load_config() -> Result<AppConfig, BoxError> {
    let _ = ensure_default_config().await;

    let contents = tokio::fs::read_to_string(CONFIG_PATH).await?;
    let cfg: AppConfig = json5::from_str(&contents)?;
    Ok(cfg)
}
