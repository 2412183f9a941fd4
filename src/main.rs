use serenity::{
    async_trait,
    builder::{CreateEmbed, CreateMessage},
    model::{channel::Message, gateway::Ready},
    prelude::*,
};
use songbird::SerenityInit;
use dotenvy::dotenv;
use std::env;
use std::sync::Arc;
use std::time::Duration;

mod config;
mod controlplane;
mod enqueue;
mod error;
mod music;
mod player;
mod queue;
mod resolver;
mod session;
mod surface;
#[cfg(test)]
mod testutil;
mod voice;
mod youtube;

use serenity::all::Interaction;
use serenity::builder::{CreateInteractionResponse, CreateInteractionResponseMessage};
use serenity::model::id::{ChannelId, GuildId};
use serenity::prelude::TypeMapKey;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use crate::config::AppConfig;
use crate::controlplane::ApiState;
use crate::music::{ensure_media_tools, handle_music, panel_surface_id, voice_channel_for_user_id};
use crate::player::{Player, PlayerSettings};
use crate::resolver::{Quality, YtDlpResolver};
use crate::session::{Registry, SessionKey};
use crate::surface::SurfaceSync;
use crate::youtube::YouTubeClient;

const PREFIX: &str = "!jb ";
const EMBED_COLOR: u32 = 0x5865F2;

pub struct PlayerStore;
impl TypeMapKey for PlayerStore {
    type Value = Arc<Player>;
}

pub struct SurfaceStore;
impl TypeMapKey for SurfaceStore {
    type Value = Arc<SurfaceSync>;
}

pub struct YouTubeStore;
impl TypeMapKey for YouTubeStore {
    type Value = Arc<YouTubeClient>;
}

pub struct ConfigStore;
impl TypeMapKey for ConfigStore {
    type Value = Arc<AppConfig>;
}

struct Handler;

#[async_trait]
impl EventHandler for Handler {
    async fn message(&self, ctx: Context, msg: Message) {
        // move any data we need out of the potentially non-Send `Message` before awaiting
        let author_is_bot = msg.author.bot;
        let channel_id = msg.channel_id;
        let author_id = msg.author.id;
        let guild_id = msg.guild_id;
        let content = msg.content.clone();
        drop(msg);

        if author_is_bot {
            return;
        }

        if let Some(command) = content.trim().strip_prefix(PREFIX) {
            let command = command.trim();

            let mut parts = command.split_whitespace();
            let cmd = parts.next().unwrap_or("");
            let args = parts.collect::<Vec<_>>().join(" ");

            match cmd.to_ascii_lowercase().as_str() {
                "ping" => {
                    if let Err(why) = channel_id.say(&ctx.http, "Pong!").await {
                        tracing::warn!("Error sending message: {why:?}");
                    }
                }
                "help" => {
                    let fields: Vec<(String, String, bool)> = [
                        ("ping", "Pong reply"),
                        ("help", "Show this menu"),
                        ("music join", "Join your voice channel"),
                        ("music play <song|url>", "Search or queue a video/playlist"),
                        ("music skip", "Skip the current track"),
                        ("music pause", "Toggle play/pause"),
                        ("music stop", "Stop and clear the queue"),
                        ("music shuffle", "Shuffle the queue"),
                        ("music queue", "Show the queue"),
                        ("music move <from> <to>", "Reorder the queue"),
                        ("music follow", "Move the bot to your voice channel"),
                        ("music control", "Show the control panel"),
                        ("music leave", "Disconnect from voice"),
                    ]
                    .iter()
                    .map(|(name, desc)| (format!("{PREFIX}{name}"), (*desc).to_string(), false))
                    .collect();

                    let embed = CreateEmbed::new()
                        .title("Help Menu")
                        .description("Use the commands below with the prefix")
                        .color(EMBED_COLOR)
                        .fields(fields);

                    if let Err(why) = channel_id
                        .send_message(&ctx.http, CreateMessage::new().embed(embed))
                        .await
                    {
                        tracing::warn!("Error sending help: {why:?}");
                    }
                }
                "music" => {
                    let user_vc =
                        guild_id.and_then(|gid| voice_channel_for_user_id(&ctx, gid, author_id));

                    if let Err(why) = handle_music(
                        &ctx,
                        channel_id,
                        user_vc,
                        author_id,
                        guild_id,
                        &args,
                        EMBED_COLOR,
                    )
                    .await
                    {
                        tracing::warn!("Error handling music command: {why:?}");
                    }
                }
                _ => {}
            }
        }
    }

    async fn ready(&self, ctx: Context, ready: Ready) {
        tracing::info!("Connected as {}", ready.user.name);
        tracing::info!("Ready: {} guilds", ctx.cache.guild_count());
    }

    async fn interaction_create(&self, ctx: Context, interaction: Interaction) {
        let Interaction::Component(mc) = interaction else {
            return;
        };

        // custom_id format: music:<action>:<guild_id>:<channel_id>
        let custom_id = mc.data.custom_id.clone();
        let mut parts = custom_id.split(':');
        if parts.next() != Some("music") {
            return;
        }
        let action = parts.next().unwrap_or("");
        let guild_id = parts
            .next()
            .and_then(|v| v.parse::<u64>().ok())
            .map(GuildId::new);
        let channel_id = parts
            .next()
            .and_then(|v| v.parse::<u64>().ok())
            .map(ChannelId::new);
        let (Some(guild_id), Some(channel_id)) = (guild_id, channel_id) else {
            return;
        };
        let key = SessionKey::new(guild_id, channel_id);

        // panel buttons only work for listeners in the session's channel
        if voice_channel_for_user_id(&ctx, guild_id, mc.user.id) != Some(channel_id) {
            let _ = mc
                .create_response(
                    &ctx.http,
                    CreateInteractionResponse::Message(
                        CreateInteractionResponseMessage::new()
                            .content("You need to be in the same voice channel to use this control.")
                            .ephemeral(true),
                    ),
                )
                .await;
            return;
        }

        let Some(player) = ctx.data.read().await.get::<PlayerStore>().cloned() else {
            return;
        };

        let result = match action {
            "play_pause" => player.toggle(&key).await.map(|o| o.message().to_string()),
            "skip" => player
                .skip(&key)
                .await
                .map(|_| "Skipped to next track".to_string()),
            "stop" => player
                .stop(&key)
                .await
                .map(|_| "Stopped playback and cleared queue".to_string()),
            "shuffle" => player
                .shuffle(&key)
                .await
                .map(|_| "Queue shuffled".to_string()),
            "disconnect" => {
                player.request_interrupt(&key).await;
                player
                    .disconnect(&key, true)
                    .await
                    .map(|_| "Disconnected from voice channel".to_string())
            }
            _ => Ok("Unknown action".to_string()),
        };

        let text = match result {
            Ok(message) => message,
            Err(e) => e.user_message().to_string(),
        };

        let _ = mc
            .create_response(
                &ctx.http,
                CreateInteractionResponse::Message(
                    CreateInteractionResponseMessage::new()
                        .content(text)
                        .ephemeral(true),
                ),
            )
            .await;

        // the panel is pointless once the session left the channel
        if action == "disconnect" {
            if let Some(surfaces) = ctx.data.read().await.get::<SurfaceStore>().cloned() {
                surfaces.unregister(&panel_surface_id(mc.channel_id));
            }
            let _ = mc.message.delete(&ctx.http).await;
        }
    }
}

#[tokio::main]
async fn main() {
    dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let token = env::var("DISCORD_TOKEN").expect("DISCORD_TOKEN not set");
    let secret = env::var("CONTROL_PLANE_SECRET").expect("CONTROL_PLANE_SECRET not set");
    let youtube_key = env::var("YOUTUBE_API_KEY").ok();

    let app_config = config::load_config()
        .await
        .expect("failed to load config.jsonc");

    ensure_media_tools().await;

    let registry = Arc::new(Registry::new());
    let surfaces = Arc::new(SurfaceSync::new(
        registry.clone(),
        app_config.music.queue_preview,
    ));

    let (end_tx, end_rx) = mpsc::unbounded_channel();
    let manager = songbird::Songbird::serenity();
    let transport = Arc::new(voice::SongbirdTransport::new(
        manager.clone(),
        end_tx,
        app_config.music.volume,
    ));
    let resolver = Arc::new(YtDlpResolver::new(Quality::from_config(
        &app_config.music.quality,
    )));

    let player = Player::new(
        registry.clone(),
        transport,
        resolver,
        surfaces.clone(),
        PlayerSettings {
            join_cooldown: Duration::from_secs(app_config.music.join_cooldown_secs),
            batch_size: app_config.music.batch_size,
        },
    );

    // track-end signals from the audio threads re-enter through this loop
    tokio::spawn(player.clone().drive(end_rx));

    let youtube = Arc::new(YouTubeClient::new(reqwest::Client::new(), youtube_key));

    let intents = GatewayIntents::GUILD_MESSAGES
        | GatewayIntents::DIRECT_MESSAGES
        | GatewayIntents::MESSAGE_CONTENT
        | GatewayIntents::GUILDS
        | GatewayIntents::GUILD_MEMBERS
        | GatewayIntents::GUILD_VOICE_STATES;

    let mut client = Client::builder(token, intents)
        .register_songbird_with(manager)
        .event_handler(Handler)
        .await
        .expect("Err creating client");

    {
        let mut data = client.data.write().await;
        data.insert::<PlayerStore>(player.clone());
        data.insert::<SurfaceStore>(surfaces.clone());
        data.insert::<YouTubeStore>(youtube);
        data.insert::<ConfigStore>(Arc::new(app_config.clone()));
    }

    let api_state = ApiState {
        player,
        surfaces,
        cache: client.cache.clone(),
        secret: Arc::new(secret),
    };
    let bind = app_config.control_plane.bind.clone();
    tokio::spawn(async move {
        if let Err(e) = controlplane::serve(api_state, bind).await {
            tracing::error!(error = %e, "control plane server ended");
        }
    });

    if let Err(why) = client.start().await {
        tracing::error!("Client error: {why:?}");
    }
}
