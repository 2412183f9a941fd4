use std::time::Duration;

use serenity::async_trait;
use tokio::process::Command;
use tokio::time::timeout;

use crate::error::MusicError;

const YTDLP_TIMEOUT: Duration = Duration::from_secs(20);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Quality {
    Low,
    Medium,
    High,
}

impl Quality {
    pub fn from_config(s: &str) -> Self {
        match s {
            "low" => Quality::Low,
            "high" => Quality::High,
            _ => Quality::Medium,
        }
    }
}

/// ffmpeg parameters attached to every resolved stream. Streaming URLs are
/// time-limited and the CDN drops idle connections, hence the reconnect
/// flags on every tier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamParams {
    pub reconnect_args: &'static [&'static str],
    pub audio_filter: &'static str,
    pub bitrate: Option<&'static str>,
}

const RECONNECT_ARGS: &[&str] = &[
    "-reconnect",
    "1",
    "-reconnect_streamed",
    "1",
    "-reconnect_delay_max",
    "5",
];

pub fn stream_params(quality: Quality) -> StreamParams {
    match quality {
        Quality::Low => StreamParams {
            reconnect_args: RECONNECT_ARGS,
            audio_filter: "loudnorm=I=-16:TP=-1.5:LRA=11, aresample=48000, asetrate=48000*0.9",
            bitrate: None,
        },
        Quality::Medium => StreamParams {
            reconnect_args: RECONNECT_ARGS,
            audio_filter: "loudnorm=I=-16:TP=-1.5:LRA=11",
            bitrate: None,
        },
        Quality::High => StreamParams {
            reconnect_args: RECONNECT_ARGS,
            audio_filter: "loudnorm=I=-14:TP=-1:LRA=9",
            bitrate: Some("192k"),
        },
    }
}

/// A direct, time-limited streaming URL plus the parameters to play it with.
#[derive(Debug, Clone)]
pub struct ResolvedSource {
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub params: StreamParams,
}

/// Turns a track id into a playable source. Behind a trait so the playback
/// state machine can be exercised without shelling out to yt-dlp.
#[async_trait]
pub trait AudioResolver: Send + Sync {
    async fn resolve(&self, track_id: &str) -> Result<ResolvedSource, MusicError>;
}

/// Production resolver: one yt-dlp invocation per track, JSON output parsed
/// for the direct URL and any required HTTP headers.
pub struct YtDlpResolver {
    quality: Quality,
}

impl YtDlpResolver {
    pub fn new(quality: Quality) -> Self {
        YtDlpResolver { quality }
    }
}

#[async_trait]
impl AudioResolver for YtDlpResolver {
    async fn resolve(&self, track_id: &str) -> Result<ResolvedSource, MusicError> {
        let url = format!("https://www.youtube.com/watch?v={track_id}");
        let run = Command::new("yt-dlp")
            .arg("-f")
            .arg("bestaudio/best")
            .arg("--no-playlist")
            .arg("--no-warnings")
            .arg("-j")
            .arg(&url)
            .output();

        let output = match timeout(YTDLP_TIMEOUT, run).await {
            Ok(Ok(o)) => o,
            Ok(Err(e)) => return Err(MusicError::Extraction(format!("yt-dlp failed to run: {e}"))),
            Err(_) => return Err(MusicError::Extraction("yt-dlp timed out".into())),
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(MusicError::Extraction(format!(
                "yt-dlp exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let json_line = stdout
            .lines()
            .next()
            .ok_or_else(|| MusicError::Extraction("yt-dlp produced no output".into()))?;
        let value: serde_json::Value = serde_json::from_str(json_line)
            .map_err(|e| MusicError::Extraction(format!("bad yt-dlp json: {e}")))?;

        let (stream_url, headers) = parse_ytdlp_json(&value)?;
        Ok(ResolvedSource {
            url: stream_url,
            headers,
            params: stream_params(self.quality),
        })
    }
}

fn parse_ytdlp_json(
    value: &serde_json::Value,
) -> Result<(String, Vec<(String, String)>), MusicError> {
    let url = value
        .get("url")
        .and_then(|v| v.as_str())
        .ok_or_else(|| MusicError::Extraction("no audio url in yt-dlp output".into()))?
        .to_string();

    let mut headers = Vec::new();
    if let Some(map) = value.get("http_headers").and_then(|v| v.as_object()) {
        for (k, v) in map {
            if let Some(s) = v.as_str() {
                headers.push((k.clone(), s.to_string()));
            }
        }
    }
    Ok((url, headers))
}
