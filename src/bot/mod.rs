//! # Bot Module
//!
//! Discord front end of the jukebox.
//!
//! - Command registration and routing
//! - Voice connection through the player's [`VoiceConnector`] seam
//! - Bot disconnect detection (voice state updates)
//! - Background maintenance: idle sweep and cache ceiling
//!
//! ## Architecture
//!
//! [`JukeboxBot`] implements Serenity's [`EventHandler`]. It owns no playback
//! state: every guild session lives in the shared [`AudioPlayer`].

use anyhow::Result;
use serenity::{
    all::{ChannelId, Context, EventHandler, GuildId, Interaction, Ready, UserId, VoiceState},
    async_trait,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

pub mod commands;
pub mod events;
pub mod handlers;

use crate::{
    audio::{player::AudioPlayer, voice::SongbirdConnector},
    config::Config,
    storage::JsonStorage,
};

pub struct JukeboxBot {
    /// Bot configuration loaded from environment variables
    config: Arc<Config>,
    /// Playlists, canal de avisos e índice de la caché
    pub storage: Arc<tokio::sync::Mutex<JsonStorage>>,
    pub player: Arc<AudioPlayer>,
    maintenance_started: AtomicBool,
}

impl JukeboxBot {
    pub fn new(
        config: Config,
        storage: Arc<tokio::sync::Mutex<JsonStorage>>,
        player: Arc<AudioPlayer>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            storage,
            player,
            maintenance_started: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Registers slash commands with Discord.
    ///
    /// Per guild when `GUILD_ID` is set (instant, for development), global
    /// otherwise (up to an hour to propagate).
    async fn register_commands(&self, ctx: &Context) -> Result<()> {
        info!("📝 Registrando comandos slash...");

        match self.config.guild_id {
            Some(guild_id) => {
                info!("🏠 Registrando comandos para guild específica: {}", guild_id);
                let guild_id = GuildId::new(guild_id);

                if !ctx.cache.guilds().contains(&guild_id) {
                    warn!("⚠️ El bot no está en la guild especificada: {}", guild_id);
                    return Ok(());
                }

                commands::register_guild_commands(ctx, guild_id).await.map_err(|e| {
                    error!("❌ Error registrando comandos de guild: {:?}", e);
                    anyhow::anyhow!("No se pudieron registrar comandos de guild. Verifica que el bot tenga permisos de 'applications.commands' en la guild.")
                })?;
                info!("✅ Comandos de guild registrados para: {}", guild_id);
            }
            None => {
                info!("🌐 Registrando comandos globalmente");
                commands::register_global_commands(ctx).await.map_err(|e| {
                    error!("❌ Error registrando comandos globales: {:?}", e);
                    anyhow::anyhow!("No se pudieron registrar comandos globales. Verifica que el bot tenga permisos de 'applications.commands'.")
                })?;
                info!("✅ Comandos globales registrados");
            }
        }

        Ok(())
    }

    /// Conecta el bot al canal de voz del usuario si todavía no está conectado
    pub async fn ensure_connected(&self, ctx: &Context, guild_id: GuildId, user_id: UserId) -> Result<()> {
        if self.player.is_connected(guild_id) {
            return Ok(());
        }

        let channel_id = get_user_voice_channel(ctx, guild_id, user_id)?;
        let manager = songbird::get(ctx)
            .await
            .ok_or_else(|| anyhow::anyhow!("Songbird no inicializado"))?;
        let connector = SongbirdConnector::new(manager, Arc::clone(&ctx.cache));

        self.player.connect(guild_id, channel_id, &connector).await?;
        Ok(())
    }
}

#[async_trait]
impl EventHandler for JukeboxBot {
    async fn ready(&self, ctx: Context, ready: Ready) {
        info!("🤖 {} está en línea!", ready.user.name);
        info!("📊 Conectado a {} servidores", ready.guilds.len());

        if let Err(e) = self.register_commands(&ctx).await {
            error!("Error al registrar comandos: {:?}", e);
        }

        // `ready` se repite en cada reconexión del gateway
        if self.maintenance_started.swap(true, Ordering::SeqCst) {
            return;
        }
        let player = Arc::clone(&self.player);
        let config = Arc::clone(&self.config);
        tokio::spawn(async move {
            maintenance_tasks(config, player).await;
        });
    }

    async fn interaction_create(&self, ctx: Context, interaction: Interaction) {
        match interaction {
            Interaction::Command(command_interaction) => {
                if let Err(e) = handlers::handle_command(&ctx, command_interaction, self).await {
                    error!("Error manejando comando: {:?}", e);
                }
            }
            Interaction::Component(component_interaction) => {
                if let Err(e) = handlers::handle_component(&ctx, component_interaction, self).await {
                    error!("Error manejando componente: {:?}", e);
                }
            }
            _ => {}
        }
    }

    /// Si alguien desconecta al bot del canal de voz, la sesión se detiene
    /// como con `/stop`.
    async fn voice_state_update(&self, ctx: Context, old: Option<VoiceState>, new: VoiceState) {
        let current_user_id = ctx.cache.current_user().id;
        if new.user_id != current_user_id || old.is_none() || new.channel_id.is_some() {
            return;
        }

        if let Some(guild_id) = new.guild_id {
            info!("🔌 Bot desconectado en guild {}", guild_id);
            if !self.player.stop(guild_id).await.stopped() {
                debug!("Guild {} ya estaba detenida", guild_id);
            }
        }
    }
}

/// Runs periodic maintenance tasks in the background.
///
/// Every `IDLE_SWEEP_INTERVAL_SECS`: leaves guilds that are alone or idle and
/// keeps the cache directory under its ceiling.
async fn maintenance_tasks(config: Arc<Config>, player: Arc<AudioPlayer>) {
    let mut interval = tokio::time::interval(config.idle_sweep_interval());

    loop {
        interval.tick().await;

        let stopped = player.sweep_idle().await;
        if !stopped.is_empty() {
            info!("💤 {} guilds desconectadas por inactividad", stopped.len());
        }

        if let Err(e) = player.cache().enforce_limit().await {
            warn!("Error al aplicar el límite de caché: {:?}", e);
        }
    }
}

pub fn get_user_voice_channel(ctx: &Context, guild_id: GuildId, user_id: UserId) -> Result<ChannelId> {
    let guild = guild_id
        .to_guild_cached(&ctx.cache)
        .ok_or_else(|| anyhow::anyhow!("Guild no encontrada en caché"))?;

    let channel_id = guild
        .voice_states
        .get(&user_id)
        .and_then(|voice_state| voice_state.channel_id)
        .ok_or_else(|| anyhow::anyhow!("Debes estar en un canal de voz"))?;

    Ok(channel_id)
}
