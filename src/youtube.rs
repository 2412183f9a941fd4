use std::collections::HashMap;
use std::time::Duration;

use reqwest::Client;
use serde::Deserialize;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::error::MusicError;

const API_BASE: &str = "https://www.googleapis.com/youtube/v3";
const CACHE_TTL: Duration = Duration::from_secs(60 * 60);

/// One search/playlist hit as shown to users.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoHit {
    pub id: String,
    pub title: String,
    pub channel: String,
    pub thumbnail: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoDetails {
    pub id: String,
    pub title: String,
    pub channel: String,
    pub duration: Option<Duration>,
    pub thumbnail: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaylistDetails {
    pub id: String,
    pub title: String,
    pub channel: String,
    pub video_count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaylistPage {
    pub entries: Vec<VideoHit>,
    pub next_page_token: Option<String>,
}

#[derive(Clone)]
enum Cached {
    Hits(Vec<VideoHit>),
    Details(VideoDetails),
    Playlist(PlaylistDetails),
    Page(PlaylistPage),
}

/// Thin client for the video-hosting Data API. Responses are cached in
/// process for an hour; every call is treated as potentially slow.
pub struct YouTubeClient {
    http: Client,
    api_key: Option<String>,
    cache: Mutex<HashMap<String, (Instant, Cached)>>,
}

// Data API response shapes, only the fields we read.

#[derive(Deserialize)]
struct SearchResponse {
    #[serde(default)]
    items: Vec<SearchItem>,
}

#[derive(Deserialize)]
struct SearchItem {
    id: SearchId,
    snippet: Snippet,
}

#[derive(Deserialize)]
struct SearchId {
    #[serde(rename = "videoId")]
    video_id: Option<String>,
}

#[derive(Deserialize)]
struct Snippet {
    title: String,
    #[serde(rename = "channelTitle", default)]
    channel_title: String,
    #[serde(default)]
    thumbnails: Thumbnails,
}

#[derive(Deserialize, Default)]
struct Thumbnails {
    default: Option<Thumbnail>,
    medium: Option<Thumbnail>,
}

#[derive(Deserialize)]
struct Thumbnail {
    url: String,
}

#[derive(Deserialize)]
struct VideoResponse {
    #[serde(default)]
    items: Vec<VideoItem>,
}

#[derive(Deserialize)]
struct VideoItem {
    id: String,
    snippet: Snippet,
    #[serde(rename = "contentDetails")]
    content_details: VideoContentDetails,
}

#[derive(Deserialize)]
struct VideoContentDetails {
    duration: Option<String>,
}

#[derive(Deserialize)]
struct PlaylistResponse {
    #[serde(default)]
    items: Vec<PlaylistItem>,
}

#[derive(Deserialize)]
struct PlaylistItem {
    id: String,
    snippet: Snippet,
    #[serde(rename = "contentDetails")]
    content_details: PlaylistContentDetails,
}

#[derive(Deserialize)]
struct PlaylistContentDetails {
    #[serde(rename = "itemCount")]
    item_count: u64,
}

#[derive(Deserialize)]
struct PlaylistItemsResponse {
    #[serde(default)]
    items: Vec<PlaylistEntryItem>,
    #[serde(rename = "nextPageToken")]
    next_page_token: Option<String>,
}

#[derive(Deserialize)]
struct PlaylistEntryItem {
    snippet: PlaylistEntrySnippet,
}

#[derive(Deserialize)]
struct PlaylistEntrySnippet {
    title: String,
    #[serde(rename = "channelTitle", default)]
    channel_title: String,
    #[serde(rename = "resourceId")]
    resource_id: ResourceId,
    #[serde(default)]
    thumbnails: Thumbnails,
}

#[derive(Deserialize)]
struct ResourceId {
    #[serde(rename = "videoId")]
    video_id: Option<String>,
}

impl Snippet {
    fn thumbnail(&self) -> Option<String> {
        self.thumbnails
            .medium
            .as_ref()
            .or(self.thumbnails.default.as_ref())
            .map(|t| t.url.clone())
    }
}

impl PlaylistEntrySnippet {
    fn thumbnail(&self) -> Option<String> {
        self.thumbnails
            .medium
            .as_ref()
            .or(self.thumbnails.default.as_ref())
            .map(|t| t.url.clone())
    }
}

impl YouTubeClient {
    pub fn new(http: Client, api_key: Option<String>) -> Self {
        if api_key.is_none() {
            tracing::warn!("no YouTube API key provided, search will return no results");
        }
        YouTubeClient {
            http,
            api_key,
            cache: Mutex::new(HashMap::new()),
        }
    }

    async fn cached(&self, key: &str) -> Option<Cached> {
        let cache = self.cache.lock().await;
        cache.get(key).and_then(|(at, value)| {
            (at.elapsed() < CACHE_TTL).then(|| value.clone())
        })
    }

    async fn store(&self, key: String, value: Cached) {
        self.cache.lock().await.insert(key, (Instant::now(), value));
    }

    pub async fn search_videos(
        &self,
        query: &str,
        max_results: usize,
    ) -> Result<Vec<VideoHit>, MusicError> {
        let Some(api_key) = self.api_key.as_deref() else {
            return Ok(Vec::new());
        };

        let cache_key = format!("videos_{query}_{max_results}");
        if let Some(Cached::Hits(hits)) = self.cached(&cache_key).await {
            return Ok(hits);
        }

        let max = max_results.to_string();
        let response: SearchResponse = self
            .http
            .get(format!("{API_BASE}/search"))
            .query(&[
                ("part", "snippet"),
                ("q", query),
                ("key", api_key),
                ("maxResults", max.as_str()),
                ("type", "video"),
            ])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let hits: Vec<VideoHit> = response
            .items
            .into_iter()
            .filter_map(|item| {
                let id = item.id.video_id?;
                Some(VideoHit {
                    id,
                    title: item.snippet.title.clone(),
                    channel: item.snippet.channel_title.clone(),
                    thumbnail: item.snippet.thumbnail(),
                })
            })
            .collect();

        self.store(cache_key, Cached::Hits(hits.clone())).await;
        Ok(hits)
    }

    pub async fn video_details(&self, video_id: &str) -> Result<Option<VideoDetails>, MusicError> {
        let Some(api_key) = self.api_key.as_deref() else {
            return Ok(None);
        };

        let cache_key = format!("video_{video_id}");
        if let Some(Cached::Details(details)) = self.cached(&cache_key).await {
            return Ok(Some(details));
        }

        let response: VideoResponse = self
            .http
            .get(format!("{API_BASE}/videos"))
            .query(&[
                ("part", "snippet,contentDetails"),
                ("id", video_id),
                ("key", api_key),
            ])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let Some(item) = response.items.into_iter().next() else {
            return Ok(None);
        };
        let details = VideoDetails {
            id: item.id,
            title: item.snippet.title.clone(),
            channel: item.snippet.channel_title.clone(),
            duration: item
                .content_details
                .duration
                .as_deref()
                .and_then(parse_iso8601_duration),
            thumbnail: item.snippet.thumbnail(),
        };
        self.store(cache_key, Cached::Details(details.clone())).await;
        Ok(Some(details))
    }

    pub async fn playlist_details(
        &self,
        playlist_id: &str,
    ) -> Result<Option<PlaylistDetails>, MusicError> {
        let Some(api_key) = self.api_key.as_deref() else {
            return Ok(None);
        };

        let cache_key = format!("playlist_{playlist_id}");
        if let Some(Cached::Playlist(details)) = self.cached(&cache_key).await {
            return Ok(Some(details));
        }

        let response: PlaylistResponse = self
            .http
            .get(format!("{API_BASE}/playlists"))
            .query(&[
                ("part", "snippet,contentDetails"),
                ("id", playlist_id),
                ("key", api_key),
            ])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let Some(item) = response.items.into_iter().next() else {
            return Ok(None);
        };
        let details = PlaylistDetails {
            id: item.id,
            title: item.snippet.title.clone(),
            channel: item.snippet.channel_title.clone(),
            video_count: item.content_details.item_count,
        };
        self.store(cache_key, Cached::Playlist(details.clone())).await;
        Ok(Some(details))
    }

    /// One page of playlist entries. Pass the previous page's token to
    /// continue; `None` starts from the beginning.
    pub async fn playlist_items(
        &self,
        playlist_id: &str,
        page_token: Option<&str>,
    ) -> Result<PlaylistPage, MusicError> {
        let Some(api_key) = self.api_key.as_deref() else {
            return Ok(PlaylistPage {
                entries: Vec::new(),
                next_page_token: None,
            });
        };

        let cache_key = format!("playlist_items_{playlist_id}_{}", page_token.unwrap_or(""));
        if let Some(Cached::Page(page)) = self.cached(&cache_key).await {
            return Ok(page);
        }

        let mut query = vec![
            ("part", "snippet".to_string()),
            ("playlistId", playlist_id.to_string()),
            ("maxResults", "50".to_string()),
            ("key", api_key.to_string()),
        ];
        if let Some(token) = page_token {
            query.push(("pageToken", token.to_string()));
        }

        let response: PlaylistItemsResponse = self
            .http
            .get(format!("{API_BASE}/playlistItems"))
            .query(&query)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let entries = response
            .items
            .into_iter()
            .filter_map(|item| {
                let id = item.snippet.resource_id.video_id.clone()?;
                Some(VideoHit {
                    id,
                    title: item.snippet.title.clone(),
                    channel: item.snippet.channel_title.clone(),
                    thumbnail: item.snippet.thumbnail(),
                })
            })
            .collect();
        let page = PlaylistPage {
            entries,
            next_page_token: response.next_page_token,
        };
        self.store(cache_key, Cached::Page(page.clone())).await;
        Ok(page)
    }

    /// Collect up to `limit` entries, following page tokens.
    pub async fn playlist_entries(
        &self,
        playlist_id: &str,
        limit: usize,
    ) -> Result<Vec<VideoHit>, MusicError> {
        let mut all = Vec::new();
        let mut token: Option<String> = None;
        loop {
            let page = self.playlist_items(playlist_id, token.as_deref()).await?;
            all.extend(page.entries);
            if all.len() >= limit {
                all.truncate(limit);
                return Ok(all);
            }
            match page.next_page_token {
                Some(next) => token = Some(next),
                None => return Ok(all),
            }
        }
    }
}

/// Video id from a watch URL, a short URL, or a bare id.
pub fn extract_video_id(input: &str) -> Option<String> {
    if !input.starts_with("http://") && !input.starts_with("https://") {
        return None;
    }
    if let Some(idx) = input.find("watch?v=") {
        return input[idx + "watch?v=".len()..]
            .split(&['&', '#'][..])
            .next()
            .filter(|s| !s.is_empty())
            .map(str::to_string);
    }
    if let Some(idx) = input.find("youtu.be/") {
        return input[idx + "youtu.be/".len()..]
            .split(&['?', '&', '#'][..])
            .next()
            .filter(|s| !s.is_empty())
            .map(str::to_string);
    }
    None
}

/// Playlist id from a URL carrying a `list=` parameter.
pub fn extract_playlist_id(input: &str) -> Option<String> {
    if !input.contains("youtube.com") && !input.contains("youtu.be") {
        return None;
    }
    input.find("list=").map(|idx| {
        input[idx + "list=".len()..]
            .split(&['&', '#'][..])
            .next()
            .unwrap_or("")
            .to_string()
    })
    .filter(|s| !s.is_empty())
}

/// ISO-8601 duration as the Data API reports it, e.g. "PT4M13S".
pub fn parse_iso8601_duration(s: &str) -> Option<Duration> {
    let rest = s.strip_prefix("PT").or_else(|| s.strip_prefix("P"))?;
    let mut secs: u64 = 0;
    let mut num = String::new();
    for c in rest.chars() {
        if c.is_ascii_digit() {
            num.push(c);
            continue;
        }
        if c == 'T' && num.is_empty() {
            // date/time separator in forms like P1DT2H
            continue;
        }
        let value: u64 = num.parse().ok()?;
        num.clear();
        match c {
            'D' => secs += value * 86_400,
            'H' => secs += value * 3_600,
            'M' => secs += value * 60,
            'S' => secs += value,
            _ => return None,
        }
    }
    if !num.is_empty() {
        return None;
    }
    Some(Duration::from_secs(secs))
}
