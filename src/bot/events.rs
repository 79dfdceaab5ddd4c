use anyhow::Result;
use serenity::{
    async_trait,
    builder::{CreateEmbed, CreateMessage},
    http::Http,
    model::id::{ChannelId, GuildId},
};
use std::sync::Arc;
use tracing::{debug, error};

use crate::{
    audio::{track::Track, transport::Notifier},
    storage::JsonStorage,
    ui::{buttons, embeds},
};

/// Envía los avisos del reproductor al canal de texto de cada guild.
///
/// El canal fijado con `/setchannel` tiene prioridad; si no hay, se usa el
/// último canal desde el que se encoló música.
pub struct DiscordNotifier {
    http: Arc<Http>,
    storage: Arc<tokio::sync::Mutex<JsonStorage>>,
}

impl DiscordNotifier {
    pub fn new(http: Arc<Http>, storage: Arc<tokio::sync::Mutex<JsonStorage>>) -> Self {
        Self { http, storage }
    }

    async fn channel_for(&self, guild_id: GuildId, fallback: Option<ChannelId>) -> Option<ChannelId> {
        self.storage
            .lock()
            .await
            .notification_channel(guild_id)
            .or(fallback)
    }

    async fn send(&self, channel_id: ChannelId, message: CreateMessage) -> Result<()> {
        channel_id.send_message(&self.http, message).await?;
        Ok(())
    }

    async fn deliver(&self, guild_id: GuildId, fallback: Option<ChannelId>, embed: CreateEmbed, with_controls: bool) {
        let Some(channel_id) = self.channel_for(guild_id, fallback).await else {
            debug!("Sin canal de avisos para guild {}", guild_id);
            return;
        };

        let mut message = CreateMessage::new().embed(embed);
        if with_controls {
            message = message.components(buttons::create_player_buttons());
        }
        if let Err(e) = self.send(channel_id, message).await {
            error!("Error al enviar aviso a {}: {:?}", channel_id, e);
        }
    }
}

#[async_trait]
impl Notifier for DiscordNotifier {
    async fn now_playing(&self, guild_id: GuildId, target: Option<ChannelId>, track: &Track) {
        self.deliver(guild_id, target, embeds::create_now_playing_embed(track), true)
            .await;
    }

    async fn track_skipped(
        &self,
        guild_id: GuildId,
        target: Option<ChannelId>,
        track: &Track,
        reason: &str,
    ) {
        self.deliver(guild_id, target, embeds::create_track_skipped_embed(track, reason), false)
            .await;
    }
}
