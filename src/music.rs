use std::sync::Arc;
use std::time::Duration;

use serenity::{
    builder::{CreateActionRow, CreateButton, CreateEmbed, CreateMessage, EditMessage},
    model::prelude::*,
    prelude::*,
};
use serenity::all::ButtonStyle;
use serenity::async_trait;

use crate::config::AppConfig;
use crate::error::MusicError;
use crate::player::Player;
use crate::queue::Track;
use crate::session::SessionKey;
use crate::surface::{Snapshot, SurfaceSink, SurfaceSync};
use crate::youtube::{self, YouTubeClient};

type MusicResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

struct Stores {
    player: Arc<Player>,
    surfaces: Arc<SurfaceSync>,
    youtube: Arc<YouTubeClient>,
    config: Arc<AppConfig>,
}

async fn stores(ctx: &Context) -> MusicResult<Stores> {
    let data = ctx.data.read().await;
    Ok(Stores {
        player: data
            .get::<crate::PlayerStore>()
            .cloned()
            .ok_or("player not initialised")?,
        surfaces: data
            .get::<crate::SurfaceStore>()
            .cloned()
            .ok_or("surface sync not initialised")?,
        youtube: data
            .get::<crate::YouTubeStore>()
            .cloned()
            .ok_or("youtube client not initialised")?,
        config: data
            .get::<crate::ConfigStore>()
            .cloned()
            .ok_or("config not initialised")?,
    })
}

pub async fn handle_music(
    ctx: &Context,
    channel: ChannelId,
    user_voice: Option<ChannelId>,
    user_id: UserId,
    guild_id: Option<GuildId>,
    args: &str,
    embed_color: u32,
) -> serenity::Result<()> {
    let mut parts = args.split_whitespace();
    let sub = parts.next().unwrap_or("");
    let remainder = parts.collect::<Vec<_>>().join(" ");

    let result: MusicResult<()> = match sub {
        "join" => join(ctx, channel, user_voice, user_id, guild_id, &remainder, embed_color).await,
        "play" => play(ctx, channel, user_voice, user_id, guild_id, &remainder, embed_color).await,
        "leave" => leave(ctx, channel, guild_id, embed_color).await,
        "skip" => skip(ctx, channel, user_voice, user_id, guild_id, embed_color).await,
        "pause" => pause(ctx, channel, user_voice, user_id, guild_id, embed_color).await,
        "stop" => stop(ctx, channel, user_voice, user_id, guild_id, embed_color).await,
        "shuffle" => shuffle(ctx, channel, user_voice, user_id, guild_id, embed_color).await,
        "move" => move_cmd(ctx, channel, user_voice, user_id, guild_id, &remainder, embed_color).await,
        "queue" => queue_cmd(ctx, channel, user_voice, user_id, guild_id, embed_color).await,
        "follow" => follow_cmd(ctx, channel, user_voice, user_id, guild_id, embed_color).await,
        "control" => control(ctx, channel, user_voice, user_id, guild_id, embed_color).await,
        _ => {
            send_info(
                ctx,
                channel,
                embed_color,
                "Music",
                "Subcommands: join, play <song|url>, skip, pause, stop, shuffle, queue, move <from> <to>, follow, control, leave",
            )
            .await
        }
    };

    if let Err(err) = result {
        tracing::warn!(error = %err, "music command failed");
        let _ = send_info(ctx, channel, embed_color, "Music Error", &format!("{err}")).await;
    }

    Ok(())
}

/// Verify yt-dlp and ffmpeg are reachable at startup. Playback needs both;
/// a missing tool is logged loudly instead of failing on the first track.
pub async fn ensure_media_tools() {
    for (tool, arg) in [("yt-dlp", "--version"), ("ffmpeg", "-version")] {
        match tokio::process::Command::new(tool).arg(arg).output().await {
            Ok(o) if o.status.success() => {
                tracing::info!(tool, "media tool found");
            }
            Ok(o) => {
                tracing::warn!(tool, status = %o.status, "media tool exists but failed to run");
            }
            Err(_) => {
                tracing::warn!(tool, "media tool not found on PATH, playback may fail");
            }
        }
    }
}

/// Voice channel the session commands should target: where the bot already
/// sits in this guild, else where the user is.
fn target_key(
    ctx: &Context,
    player: &Player,
    guild_id: GuildId,
    user_id: UserId,
    user_voice: Option<ChannelId>,
) -> Option<SessionKey> {
    if let Some(key) = player.active_key(guild_id) {
        return Some(key);
    }
    voice_channel_for_user_id(ctx, guild_id, user_id)
        .or(user_voice)
        .map(|vc| SessionKey::new(guild_id, vc))
}

async fn join(
    ctx: &Context,
    channel: ChannelId,
    user_voice: Option<ChannelId>,
    user_id: UserId,
    guild_id: Option<GuildId>,
    args: &str,
    color: u32,
) -> MusicResult<()> {
    let guild_id = guild_id.ok_or("This command only works in a guild")?;
    let s = stores(ctx).await?;

    // Allow an explicit channel argument: "music join <channel>"
    let mut channel_id = args
        .split_whitespace()
        .next()
        .and_then(|v| v.trim().trim_start_matches("<#").trim_end_matches('>').parse::<u64>().ok())
        .map(ChannelId::new);

    if channel_id.is_none() {
        channel_id = voice_channel_for_user_id(ctx, guild_id, user_id).or(user_voice);
    }

    let Some(voice_channel) = channel_id else {
        send_info(
            ctx,
            channel,
            color,
            "Music",
            "Couldn't determine your voice channel. Join a voice channel or provide one: music join <channel>",
        )
        .await?;
        return Ok(());
    };

    let key = SessionKey::new(guild_id, voice_channel);
    s.player.join(&key).await?;

    send_temp_info(
        ctx.clone(),
        channel,
        &format!("Joined <#{}>", voice_channel.get()),
        Duration::from_secs(s.config.music.cleartimer_secs),
    )
    .await?;

    send_control_panel(ctx, channel, key, color).await
}

async fn leave(
    ctx: &Context,
    channel: ChannelId,
    guild_id: Option<GuildId>,
    color: u32,
) -> MusicResult<()> {
    let guild_id = guild_id.ok_or("This command only works in a guild")?;
    let s = stores(ctx).await?;

    match s.player.disconnect_guild(guild_id, false).await {
        Ok(_) => send_info(ctx, channel, color, "Music", "Left the voice channel").await,
        Err(e) => send_info(ctx, channel, color, "Music", e.user_message()).await,
    }
}

async fn play(
    ctx: &Context,
    channel: ChannelId,
    user_voice: Option<ChannelId>,
    user_id: UserId,
    guild_id: Option<GuildId>,
    query: &str,
    color: u32,
) -> MusicResult<()> {
    let guild_id = guild_id.ok_or("This command only works in a guild")?;
    if query.trim().is_empty() {
        send_info(ctx, channel, color, "Music", "Provide a song name or URL: music play <song>").await?;
        return Ok(());
    }
    let s = stores(ctx).await?;

    let Some(voice_channel) = voice_channel_for_user_id(ctx, guild_id, user_id).or(user_voice)
    else {
        send_info(ctx, channel, color, "Music", "Join a voice channel first").await?;
        return Ok(());
    };
    let key = SessionKey::new(guild_id, voice_channel);

    // One live connection per guild: playing from another channel hands
    // the session over instead of leaking a second connection.
    if let Some(active) = s.player.active_key(guild_id) {
        if active != key {
            s.player.follow(&active, &key).await?;
        }
    }

    let raw = query.trim();

    if let Some(playlist_id) = youtube::extract_playlist_id(raw) {
        return play_playlist(ctx, channel, &s, &key, &playlist_id, color).await;
    }

    let track = if let Some(video_id) = youtube::extract_video_id(raw) {
        let title = s
            .youtube
            .video_details(&video_id)
            .await
            .ok()
            .flatten()
            .map(|d| d.title)
            .unwrap_or_else(|| raw.to_string());
        Track::from_video(video_id, title)
    } else {
        let hits = s.youtube.search_videos(raw, 1).await?;
        let Some(hit) = hits.into_iter().next() else {
            send_info(ctx, channel, color, "Music", &format!("No results for: {raw}")).await?;
            return Ok(());
        };
        Track::from_video(hit.id, hit.title)
    };

    let title = track.title.clone();
    let position = s.player.add_to_queue(&key, track, true).await?;
    send_temp_info(
        ctx.clone(),
        channel,
        &format!("Queued: {title} (position {position})"),
        Duration::from_secs(s.config.music.cleartimer_secs),
    )
    .await?;
    Ok(())
}

async fn play_playlist(
    ctx: &Context,
    channel: ChannelId,
    s: &Stores,
    key: &SessionKey,
    playlist_id: &str,
    color: u32,
) -> MusicResult<()> {
    let limit = s.config.music.max_playlist_tracks;
    let entries = s.youtube.playlist_entries(playlist_id, limit).await?;
    if entries.is_empty() {
        send_info(ctx, channel, color, "Music", "Playlist is empty or unavailable").await?;
        return Ok(());
    }

    let playlist_title = s
        .youtube
        .playlist_details(playlist_id)
        .await
        .ok()
        .flatten()
        .map(|p| p.title)
        .unwrap_or_else(|| "playlist".to_string());

    send_info(
        ctx,
        channel,
        color,
        "Music",
        &format!("Queuing {} tracks from {playlist_title}", entries.len()),
    )
    .await?;

    let tracks: Vec<Track> = entries
        .into_iter()
        .map(|e| Track::from_video(e.id, e.title))
        .collect();
    let summary = s.player.enqueue_many(key, tracks).await?;
    send_info(ctx, channel, color, "Music", &summary.message()).await?;
    Ok(())
}

async fn skip(
    ctx: &Context,
    channel: ChannelId,
    user_voice: Option<ChannelId>,
    user_id: UserId,
    guild_id: Option<GuildId>,
    color: u32,
) -> MusicResult<()> {
    let guild_id = guild_id.ok_or("This command only works in a guild")?;
    let s = stores(ctx).await?;
    let Some(key) = target_key(ctx, &s.player, guild_id, user_id, user_voice) else {
        send_info(ctx, channel, color, "Music", "Join a voice channel first").await?;
        return Ok(());
    };
    match s.player.skip(&key).await {
        Ok(()) => {
            send_temp_info(
                ctx.clone(),
                channel,
                "Skipped to next track",
                Duration::from_secs(s.config.music.cleartimer_secs),
            )
            .await
        }
        Err(e) => send_info(ctx, channel, color, "Music", e.user_message()).await,
    }
}

async fn pause(
    ctx: &Context,
    channel: ChannelId,
    user_voice: Option<ChannelId>,
    user_id: UserId,
    guild_id: Option<GuildId>,
    color: u32,
) -> MusicResult<()> {
    let guild_id = guild_id.ok_or("This command only works in a guild")?;
    let s = stores(ctx).await?;
    let Some(key) = target_key(ctx, &s.player, guild_id, user_id, user_voice) else {
        send_info(ctx, channel, color, "Music", "Join a voice channel first").await?;
        return Ok(());
    };
    match s.player.toggle(&key).await {
        Ok(outcome) => send_info(ctx, channel, color, "Music", outcome.message()).await,
        Err(e) => send_info(ctx, channel, color, "Music", e.user_message()).await,
    }
}

async fn stop(
    ctx: &Context,
    channel: ChannelId,
    user_voice: Option<ChannelId>,
    user_id: UserId,
    guild_id: Option<GuildId>,
    color: u32,
) -> MusicResult<()> {
    let guild_id = guild_id.ok_or("This command only works in a guild")?;
    let s = stores(ctx).await?;
    let Some(key) = target_key(ctx, &s.player, guild_id, user_id, user_voice) else {
        send_info(ctx, channel, color, "Music", "Join a voice channel first").await?;
        return Ok(());
    };
    match s.player.stop(&key).await {
        Ok(()) => {
            send_info(ctx, channel, color, "Music", "Stopped playback and cleared queue").await
        }
        Err(e) => send_info(ctx, channel, color, "Music", e.user_message()).await,
    }
}

async fn shuffle(
    ctx: &Context,
    channel: ChannelId,
    user_voice: Option<ChannelId>,
    user_id: UserId,
    guild_id: Option<GuildId>,
    color: u32,
) -> MusicResult<()> {
    let guild_id = guild_id.ok_or("This command only works in a guild")?;
    let s = stores(ctx).await?;
    let Some(key) = target_key(ctx, &s.player, guild_id, user_id, user_voice) else {
        send_info(ctx, channel, color, "Music", "Join a voice channel first").await?;
        return Ok(());
    };
    match s.player.shuffle(&key).await {
        Ok(()) => send_info(ctx, channel, color, "Music", "Queue shuffled").await,
        Err(e) => send_info(ctx, channel, color, "Music", e.user_message()).await,
    }
}

async fn move_cmd(
    ctx: &Context,
    channel: ChannelId,
    user_voice: Option<ChannelId>,
    user_id: UserId,
    guild_id: Option<GuildId>,
    args: &str,
    color: u32,
) -> MusicResult<()> {
    let guild_id = guild_id.ok_or("This command only works in a guild")?;
    let s = stores(ctx).await?;

    let mut parts = args.split_whitespace();
    // users see 1-based queue positions
    let (Some(from), Some(to)) = (
        parts.next().and_then(|v| v.parse::<usize>().ok()).filter(|v| *v >= 1),
        parts.next().and_then(|v| v.parse::<usize>().ok()).filter(|v| *v >= 1),
    ) else {
        send_info(ctx, channel, color, "Music", "Usage: music move <from> <to>").await?;
        return Ok(());
    };

    let Some(key) = target_key(ctx, &s.player, guild_id, user_id, user_voice) else {
        send_info(ctx, channel, color, "Music", "Join a voice channel first").await?;
        return Ok(());
    };
    match s.player.move_track(&key, from - 1, to - 1).await {
        Ok(()) => {
            send_info(ctx, channel, color, "Music", &format!("Moved track {from} to {to}")).await
        }
        Err(e) => send_info(ctx, channel, color, "Music", e.user_message()).await,
    }
}

async fn follow_cmd(
    ctx: &Context,
    channel: ChannelId,
    user_voice: Option<ChannelId>,
    user_id: UserId,
    guild_id: Option<GuildId>,
    color: u32,
) -> MusicResult<()> {
    let guild_id = guild_id.ok_or("This command only works in a guild")?;
    let s = stores(ctx).await?;

    let Some(voice_channel) = voice_channel_for_user_id(ctx, guild_id, user_id).or(user_voice)
    else {
        send_info(ctx, channel, color, "Music", "Join a voice channel first").await?;
        return Ok(());
    };
    let Some(active) = s.player.active_key(guild_id) else {
        send_info(ctx, channel, color, "Music", "Not connected to a voice channel").await?;
        return Ok(());
    };
    if active.channel == voice_channel {
        send_info(ctx, channel, color, "Music", "Already in your voice channel").await?;
        return Ok(());
    }

    let new_key = SessionKey::new(guild_id, voice_channel);
    match s.player.follow(&active, &new_key).await {
        Ok(()) => {
            send_info(
                ctx,
                channel,
                color,
                "Music",
                &format!("Followed you to <#{}>", voice_channel.get()),
            )
            .await
        }
        Err(e) => send_info(ctx, channel, color, "Music", e.user_message()).await,
    }
}

async fn queue_cmd(
    ctx: &Context,
    channel: ChannelId,
    user_voice: Option<ChannelId>,
    user_id: UserId,
    guild_id: Option<GuildId>,
    color: u32,
) -> MusicResult<()> {
    let guild_id = guild_id.ok_or("This command only works in a guild")?;
    let s = stores(ctx).await?;
    let Some(key) = target_key(ctx, &s.player, guild_id, user_id, user_voice) else {
        send_info(ctx, channel, color, "Music", "Join a voice channel first").await?;
        return Ok(());
    };

    let snapshot = s.surfaces.snapshot(&key).await;
    let embed = snapshot_embed(&snapshot, color);
    channel
        .send_message(&ctx.http, CreateMessage::new().embed(embed))
        .await?;
    Ok(())
}

async fn control(
    ctx: &Context,
    channel: ChannelId,
    user_voice: Option<ChannelId>,
    user_id: UserId,
    guild_id: Option<GuildId>,
    color: u32,
) -> MusicResult<()> {
    let guild_id = guild_id.ok_or("Controls only available in a guild")?;
    let s = stores(ctx).await?;
    let Some(key) = target_key(ctx, &s.player, guild_id, user_id, user_voice) else {
        send_info(ctx, channel, color, "Music", "Join a voice channel first").await?;
        return Ok(());
    };
    send_control_panel(ctx, channel, key, color).await
}

/// Post (or repost) the interactive panel in `channel` and register it as a
/// surface so every later state change re-renders it in place.
pub async fn send_control_panel(
    ctx: &Context,
    channel: ChannelId,
    key: SessionKey,
    color: u32,
) -> MusicResult<()> {
    let s = stores(ctx).await?;
    let sink = Arc::new(PanelSink {
        http: ctx.http.clone(),
        channel,
        key: key.clone(),
        color,
        cleartimer: Duration::from_secs(s.config.music.cleartimer_secs),
        message: tokio::sync::Mutex::new(None),
    });

    let snapshot = s.surfaces.snapshot(&key).await;
    sink.push(&snapshot)
        .await
        .map_err(|e| format!("could not send control panel: {e}"))?;

    // one panel per text channel; a newer one simply replaces the entry
    s.surfaces
        .register(panel_surface_id(channel), key, sink);
    Ok(())
}

pub fn panel_surface_id(channel: ChannelId) -> String {
    format!("panel:{}", channel.get())
}

/// In-chat control surface: an embed plus button rows, edited in place on
/// every refresh.
pub struct PanelSink {
    http: Arc<serenity::http::Http>,
    channel: ChannelId,
    key: SessionKey,
    color: u32,
    cleartimer: Duration,
    message: tokio::sync::Mutex<Option<MessageId>>,
}

#[async_trait]
impl SurfaceSink for PanelSink {
    async fn push(&self, snapshot: &Snapshot) -> Result<(), MusicError> {
        let embed = snapshot_embed(snapshot, self.color);
        let rows = self.button_rows();

        let mut slot = self.message.lock().await;
        if let Some(id) = *slot {
            let edit = EditMessage::new().embed(embed.clone()).components(rows.clone());
            if self.channel.edit_message(&self.http, id, edit).await.is_ok() {
                return Ok(());
            }
            // panel message was deleted; send a fresh one below
            *slot = None;
        }

        let message = CreateMessage::new().embed(embed).components(rows);
        let sent = self
            .channel
            .send_message(&self.http, message)
            .await
            .map_err(|e| MusicError::Surface(e.to_string()))?;
        *slot = Some(sent.id);
        Ok(())
    }

    async fn notice(&self, text: &str) -> Result<(), MusicError> {
        let sent = self
            .channel
            .send_message(&self.http, CreateMessage::new().content(text))
            .await
            .map_err(|e| MusicError::Surface(e.to_string()))?;

        // mimic ephemeral behavior: delete the notice after a short delay
        let http = self.http.clone();
        let channel = self.channel;
        let id = sent.id;
        let delay = self.cleartimer;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = channel.delete_message(&http, id).await;
        });
        Ok(())
    }
}

impl PanelSink {
    fn button_rows(&self) -> Vec<CreateActionRow> {
        let guild = self.key.guild.get();
        let channel = self.key.channel.get();
        let id = |action: &str| format!("music:{action}:{guild}:{channel}");

        vec![
            CreateActionRow::Buttons(vec![
                CreateButton::new(id("play_pause"))
                    .style(ButtonStyle::Primary)
                    .label("Play/Pause"),
                CreateButton::new(id("skip"))
                    .style(ButtonStyle::Primary)
                    .label("Skip"),
                CreateButton::new(id("stop"))
                    .style(ButtonStyle::Danger)
                    .label("Stop"),
            ]),
            CreateActionRow::Buttons(vec![
                CreateButton::new(id("shuffle"))
                    .style(ButtonStyle::Secondary)
                    .label("Shuffle"),
                CreateButton::new(id("disconnect"))
                    .style(ButtonStyle::Secondary)
                    .label("Disconnect"),
            ]),
        ]
    }
}

fn snapshot_embed(snapshot: &Snapshot, color: u32) -> CreateEmbed {
    let now_playing = match &snapshot.current_track {
        Some(track) => format!("[{}]({})", track.title, track.url),
        None => "Nothing playing".to_string(),
    };

    let queue_text = if snapshot.queue_preview.is_empty() {
        "Empty".to_string()
    } else {
        let mut lines: Vec<String> = snapshot
            .queue_preview
            .iter()
            .enumerate()
            .map(|(i, t)| format!("{}. {}", i + 1, t.title))
            .collect();
        if snapshot.overflow > 0 {
            lines.push(format!("... and {} more", snapshot.overflow));
        }
        lines.join("\n")
    };

    CreateEmbed::new()
        .title("Music Control Panel")
        .description(format!(
            "{now_playing}\nStatus: {:?} | Connection: {:?}",
            snapshot.playback_state, snapshot.connection_state
        ))
        .field("Queue", queue_text, false)
        .color(color)
}

pub fn voice_channel_for_user_id(
    ctx: &Context,
    guild_id: GuildId,
    user_id: UserId,
) -> Option<ChannelId> {
    ctx.cache
        .guild(guild_id)
        .and_then(|guild| guild.voice_states.get(&user_id).and_then(|vs| vs.channel_id))
}

pub async fn send_info(
    ctx: &Context,
    channel: ChannelId,
    color: u32,
    title: &str,
    desc: &str,
) -> MusicResult<()> {
    let embed = CreateEmbed::new().title(title).description(desc).color(color);
    let message = CreateMessage::new().embed(embed);
    channel.send_message(&ctx.http, message).await?;
    Ok(())
}

async fn send_temp_info(
    ctx: Context,
    channel: ChannelId,
    content: &str,
    delay: Duration,
) -> MusicResult<()> {
    // Send a short non-embedded message and delete it after a short delay
    let msg = channel
        .send_message(&ctx.http, CreateMessage::new().content(content))
        .await?;

    let http = ctx.http.clone();
    let id = msg.id;
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        let _ = channel.delete_message(&http, id).await;
    });

    Ok(())
}
