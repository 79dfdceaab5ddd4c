use anyhow::Result;
use serenity::{
    builder::{
        CreateActionRow, CreateEmbed, CreateInteractionResponse, CreateInteractionResponseMessage,
        EditInteractionResponse,
    },
    model::{
        application::{CommandInteraction, ComponentInteraction, ComponentInteractionDataKind},
        id::GuildId,
    },
    prelude::Context,
};
use std::sync::Arc;
use tracing::{info, warn};

use crate::{
    audio::player::{AudioPlayer, ControlAction, ControlOutcome},
    bot::JukeboxBot,
    error::PlayerError,
    sources::{to_query, ItemRange, YouTubeClient},
    storage::SavedPlaylist,
    ui::{
        buttons::{self, button_ids, TRACK_OPTION_PREFIX},
        embeds,
    },
};

/// Comandos que pueden tardar más de los 3 s que Discord da para responder
const DEFERRED_COMMANDS: &[&str] = &["play", "search", "loadplaylist", "new", "autoplay", "skip", "stop", "cache"];

/// Respuesta de un comando, enviada de una sola vez al final
struct Reply {
    embed: CreateEmbed,
    components: Vec<CreateActionRow>,
    ephemeral: bool,
}

impl Reply {
    fn embed(embed: CreateEmbed) -> Self {
        Self {
            embed,
            components: Vec::new(),
            ephemeral: false,
        }
    }

    fn message(text: impl Into<String>) -> Self {
        Self::embed(embeds::create_message_embed(text))
    }

    fn error(text: impl Into<String>) -> Self {
        Self::embed(embeds::create_error_embed(text)).ephemeral()
    }

    fn ephemeral(mut self) -> Self {
        self.ephemeral = true;
        self
    }

    fn components(mut self, components: Vec<CreateActionRow>) -> Self {
        self.components = components;
        self
    }
}

fn option_str<'a>(command: &'a CommandInteraction, name: &str) -> Option<&'a str> {
    command
        .data
        .options
        .iter()
        .find(|opt| opt.name == name)
        .and_then(|opt| opt.value.as_str())
}

fn option_i64(command: &CommandInteraction, name: &str) -> Option<i64> {
    command
        .data
        .options
        .iter()
        .find(|opt| opt.name == name)
        .and_then(|opt| opt.value.as_i64())
}

fn option_bool(command: &CommandInteraction, name: &str) -> Option<bool> {
    command
        .data
        .options
        .iter()
        .find(|opt| opt.name == name)
        .and_then(|opt| opt.value.as_bool())
}

fn page(command: &CommandInteraction) -> usize {
    option_i64(command, "page").unwrap_or(1).max(1) as usize
}

/// Maneja comandos slash
pub async fn handle_command(ctx: &Context, command: CommandInteraction, bot: &JukeboxBot) -> Result<()> {
    let guild_id = command
        .guild_id
        .ok_or_else(|| anyhow::anyhow!("Comando usado fuera de un servidor"))?;

    info!(
        "📝 Comando /{} usado por {} en guild {}",
        command.data.name, command.user.name, guild_id
    );

    let deferred = DEFERRED_COMMANDS.contains(&command.data.name.as_str());
    if deferred {
        command
            .create_response(
                &ctx.http,
                CreateInteractionResponse::Defer(CreateInteractionResponseMessage::new()),
            )
            .await?;
    }

    let reply = match run_command(ctx, &command, bot, guild_id).await {
        Ok(reply) => reply,
        Err(e) => {
            warn!("⚠️ /{} falló en guild {}: {}", command.data.name, guild_id, e);
            Reply::error(e.to_string())
        }
    };

    if deferred {
        command
            .edit_response(
                &ctx.http,
                EditInteractionResponse::new()
                    .embed(reply.embed)
                    .components(reply.components),
            )
            .await?;
    } else {
        command
            .create_response(
                &ctx.http,
                CreateInteractionResponse::Message(
                    CreateInteractionResponseMessage::new()
                        .embed(reply.embed)
                        .components(reply.components)
                        .ephemeral(reply.ephemeral),
                ),
            )
            .await?;
    }

    Ok(())
}

async fn run_command(
    ctx: &Context,
    command: &CommandInteraction,
    bot: &JukeboxBot,
    guild_id: GuildId,
) -> Result<Reply> {
    let player = &bot.player;

    match command.data.name.as_str() {
        "play" => handle_play(ctx, command, bot, guild_id).await,
        "search" => handle_search(command, player).await,
        "pause" => {
            player.control(guild_id, ControlAction::Pause).await?;
            Ok(Reply::message("⏸️ Reproducción pausada"))
        }
        "resume" => {
            player.control(guild_id, ControlAction::Resume).await?;
            Ok(Reply::message("▶️ Reproducción reanudada"))
        }
        "skip" => {
            player.control(guild_id, ControlAction::Skip).await?;
            Ok(Reply::message("⏭️ Canción saltada"))
        }
        "stop" => {
            if player.stop(guild_id).await.stopped() {
                Ok(Reply::message("👋 Detenido. Guardando la sesión en caché..."))
            } else {
                Ok(Reply::error("No hay nada que detener"))
            }
        }
        "queue" => queue_reply(player, guild_id, page(command)).await,
        "history" => {
            let history = player.history(guild_id);
            if history.is_empty() {
                return Ok(Reply::message("El historial está vacío."));
            }
            Ok(Reply::embed(embeds::create_history_embed(&history, page(command))))
        }
        "shuffle" => {
            player.shuffle(guild_id)?;
            Ok(Reply::message("🔀 Cola mezclada"))
        }
        "remove" => {
            let position = option_i64(command, "position")
                .ok_or_else(|| anyhow::anyhow!("Posición no proporcionada"))?;
            let index = usize::try_from(position - 1).map_err(|_| PlayerError::invalid("Posición inválida"))?;
            let removed = player.remove_at(guild_id, index)?;
            Ok(Reply::message(format!("🗑️ Quitada: **{}**", removed.title)))
        }
        "clear" => {
            let removed = player.clear_user_tracks(guild_id)?;
            Ok(Reply::message(format!("🧹 Se quitaron **{}** canciones", removed)))
        }
        "autoplay" => {
            let requested = option_bool(command, "enabled");
            match player.control(guild_id, ControlAction::Autoplay(requested)).await? {
                ControlOutcome::Autoplay(enabled) => Ok(Reply::message(format!(
                    "📻 Autoplay: **{}**",
                    if enabled { "ON" } else { "OFF" }
                ))),
                _ => Ok(Reply::message("📻 Autoplay actualizado")),
            }
        }
        "new" => match player.control(guild_id, ControlAction::Regenerate).await? {
            ControlOutcome::Regenerated(Some(track)) => Ok(Reply::message(format!(
                "🎲 Nueva sugerencia: **{}**",
                track.title
            ))),
            _ => Ok(Reply::error("No se pudo generar otra sugerencia")),
        },
        "setchannel" => {
            bot.storage
                .lock()
                .await
                .set_notification_channel(guild_id, command.channel_id)
                .await?;
            Ok(Reply::message(format!("✅ Avisos en <#{}>", command.channel_id)))
        }
        "saveplaylist" => handle_saveplaylist(command, bot, guild_id).await,
        "loadplaylist" => handle_loadplaylist(ctx, command, bot, guild_id).await,
        "delplaylist" => {
            let name = option_str(command, "name").ok_or_else(|| anyhow::anyhow!("Nombre no proporcionado"))?;
            if bot.storage.lock().await.delete_playlist(name).await? {
                Ok(Reply::message(format!("🗑️ Playlist **{}** borrada", name)))
            } else {
                Ok(Reply::error("Playlist no encontrada"))
            }
        }
        "listplaylists" => {
            let storage = bot.storage.lock().await;
            Ok(Reply::embed(embeds::create_playlists_embed(storage.playlists())))
        }
        "cache" => handle_cache(command, player).await,
        "help" => Ok(Reply::embed(embeds::create_help_embed()).ephemeral()),
        _ => Ok(Reply::error("Comando no reconocido")),
    }
}

// Handlers específicos para cada comando

async fn handle_play(
    ctx: &Context,
    command: &CommandInteraction,
    bot: &JukeboxBot,
    guild_id: GuildId,
) -> Result<Reply> {
    let query = option_str(command, "query").ok_or_else(|| anyhow::anyhow!("Query no proporcionado"))?;

    bot.ensure_connected(ctx, guild_id, command.user.id).await?;

    let tracks = bot.player.search(&to_query(query), ItemRange::All).await?;
    if tracks.is_empty() {
        return Ok(Reply::error("No se encontraron resultados"));
    }

    let report = bot
        .player
        .enqueue(guild_id, tracks, Some(command.channel_id))
        .await?;
    Ok(Reply::embed(embeds::create_enqueued_embed(&report)))
}

async fn handle_search(command: &CommandInteraction, player: &Arc<AudioPlayer>) -> Result<Reply> {
    let query = option_str(command, "query").ok_or_else(|| anyhow::anyhow!("Query no proporcionado"))?;

    info!("🔍 Búsqueda iniciada por {}: {}", command.user.name, query);
    let results = player
        .search(&format!("ytsearch5:{}", query), ItemRange::All)
        .await?;
    if results.is_empty() {
        return Ok(Reply::error(format!("Sin resultados para **{}**", query)));
    }

    Ok(Reply::embed(embeds::create_search_results_embed(query, &results))
        .components(buttons::create_track_selection_menu(&results)))
}

async fn queue_reply(player: &AudioPlayer, guild_id: GuildId, page: usize) -> Result<Reply> {
    let status = player.status(guild_id, "queue");
    let current_cached = match &status.current {
        Some(track) => player.cache().lookup(&track.id).await.is_some(),
        None => false,
    };
    Ok(Reply::embed(embeds::create_queue_embed(&status, current_cached, page)))
}

async fn handle_saveplaylist(command: &CommandInteraction, bot: &JukeboxBot, guild_id: GuildId) -> Result<Reply> {
    let name = option_str(command, "name").ok_or_else(|| anyhow::anyhow!("Nombre no proporcionado"))?;

    let playlist = match option_str(command, "url") {
        Some(url) => {
            if !YouTubeClient::is_youtube_url(url) {
                return Ok(Reply::error("URL de YouTube inválida"));
            }
            SavedPlaylist::live(url)
        }
        None => {
            let tracks = bot.player.snapshot(guild_id);
            if tracks.is_empty() {
                return Ok(Reply::error("La cola está vacía"));
            }
            SavedPlaylist::Static(tracks)
        }
    };

    bot.storage.lock().await.save_playlist(name, playlist).await?;
    Ok(Reply::message(format!("💾 Playlist **{}** guardada", name)))
}

async fn handle_loadplaylist(
    ctx: &Context,
    command: &CommandInteraction,
    bot: &JukeboxBot,
    guild_id: GuildId,
) -> Result<Reply> {
    let name = option_str(command, "name").ok_or_else(|| anyhow::anyhow!("Nombre no proporcionado"))?;
    let Some(playlist) = bot.storage.lock().await.playlist(name).cloned() else {
        return Ok(Reply::error("Playlist no encontrada"));
    };

    bot.ensure_connected(ctx, guild_id, command.user.id).await?;

    match playlist {
        SavedPlaylist::Static(tracks) => {
            let report = bot
                .player
                .enqueue(guild_id, tracks, Some(command.channel_id))
                .await?;
            Ok(Reply::message(format!("📂 Cargadas **{}** canciones", report.added.len())))
        }
        SavedPlaylist::Live { url, .. } => {
            let limit = bot.config().playlist_load_limit;
            let tracks = bot.player.search(&url, ItemRange::First(limit)).await?;
            let first_batch = tracks.len();
            let report = bot
                .player
                .enqueue(guild_id, tracks, Some(command.channel_id))
                .await?;

            if first_batch < limit {
                return Ok(Reply::message(format!("✅ Cargadas **{}** canciones", report.added.len())));
            }

            let player = Arc::clone(&bot.player);
            tokio::spawn(async move {
                load_rest_of_playlist(player, guild_id, url, limit + 1).await;
            });
            Ok(Reply::message(format!(
                "✅ Cargadas **{}**. El resto se carga en segundo plano...",
                report.added.len()
            )))
        }
    }
}

async fn load_rest_of_playlist(player: Arc<AudioPlayer>, guild_id: GuildId, url: String, from: usize) {
    let rest = match player.search(&url, ItemRange::From(from)).await {
        Ok(rest) => rest,
        Err(e) => {
            warn!("⚠️ No se pudo cargar el resto de la playlist: {}", e);
            return;
        }
    };
    if rest.is_empty() {
        return;
    }

    match player.enqueue(guild_id, rest, None).await {
        Ok(report) => info!("📂 {} canciones más agregadas en guild {}", report.added.len(), guild_id),
        Err(e) => warn!("⚠️ Resto de la playlist descartado en guild {}: {}", guild_id, e),
    }
}

async fn handle_cache(command: &CommandInteraction, player: &AudioPlayer) -> Result<Reply> {
    if option_bool(command, "purge") == Some(true) {
        let removed = player.cache().clear().await?;
        return Ok(Reply::message(format!("🗑️ Caché vaciada ({} archivos)", removed)));
    }

    let usage = player.cache().usage().await?;
    let mut titles: Vec<String> = player
        .cache()
        .cached_titles()
        .await
        .into_iter()
        .map(|(_, title)| title)
        .collect();
    if titles.is_empty() {
        return Ok(Reply::message("La caché está vacía."));
    }
    titles.sort();

    Ok(Reply::embed(embeds::create_cache_embed(&usage, &titles, page(command))))
}

/// Maneja interacciones con componentes (botones y menú de búsqueda)
pub async fn handle_component(ctx: &Context, component: ComponentInteraction, bot: &JukeboxBot) -> Result<()> {
    let guild_id = component
        .guild_id
        .ok_or_else(|| anyhow::anyhow!("Componente usado fuera de un servidor"))?;

    info!(
        "🔘 Botón {} presionado por {} en guild {}",
        component.data.custom_id, component.user.name, guild_id
    );

    if component.data.custom_id == button_ids::TRACK_SELECTION {
        return handle_track_selection(ctx, &component, bot, guild_id).await;
    }

    let reply = run_button(&bot.player, guild_id, &component.data.custom_id)
        .await
        .unwrap_or_else(|e| Reply::error(e.to_string()));
    component
        .create_response(
            &ctx.http,
            CreateInteractionResponse::Message(
                CreateInteractionResponseMessage::new()
                    .embed(reply.embed)
                    .ephemeral(true),
            ),
        )
        .await?;

    Ok(())
}

async fn run_button(player: &Arc<AudioPlayer>, guild_id: GuildId, custom_id: &str) -> Result<Reply> {
    match custom_id {
        button_ids::PLAY_PAUSE => match player.control(guild_id, ControlAction::TogglePause).await? {
            ControlOutcome::Paused => Ok(Reply::message("⏸️ Pausado")),
            _ => Ok(Reply::message("▶️ Reanudado")),
        },
        button_ids::SKIP => {
            player.control(guild_id, ControlAction::Skip).await?;
            Ok(Reply::message("⏭️ Saltada"))
        }
        button_ids::SHUFFLE => {
            player.shuffle(guild_id)?;
            Ok(Reply::message("🔀 Cola mezclada"))
        }
        button_ids::QUEUE => queue_reply(player, guild_id, 1).await,
        button_ids::STOP => {
            player.stop(guild_id).await;
            Ok(Reply::message("👋 Deteniendo y guardando..."))
        }
        _ => Ok(Reply::error("Acción no reconocida")),
    }
}

/// Selección del menú de `/search`: el valor lleva el id del video
async fn handle_track_selection(
    ctx: &Context,
    component: &ComponentInteraction,
    bot: &JukeboxBot,
    guild_id: GuildId,
) -> Result<()> {
    let ComponentInteractionDataKind::StringSelect { values } = &component.data.kind else {
        return Ok(());
    };
    let Some(track_id) = values.first().and_then(|v| v.strip_prefix(TRACK_OPTION_PREFIX)) else {
        return Ok(());
    };

    component.defer(&ctx.http).await?;

    let reply = enqueue_selection(ctx, component, bot, guild_id, track_id)
        .await
        .unwrap_or_else(|e| Reply::error(e.to_string()));
    component
        .edit_response(
            &ctx.http,
            EditInteractionResponse::new()
                .embed(reply.embed)
                .components(Vec::new()),
        )
        .await?;

    Ok(())
}

async fn enqueue_selection(
    ctx: &Context,
    component: &ComponentInteraction,
    bot: &JukeboxBot,
    guild_id: GuildId,
    track_id: &str,
) -> Result<Reply> {
    bot.ensure_connected(ctx, guild_id, component.user.id).await?;
    let tracks = bot
        .player
        .search(&YouTubeClient::watch_url(track_id), ItemRange::First(1))
        .await?;
    let report = bot
        .player
        .enqueue(guild_id, tracks, Some(component.channel_id))
        .await?;
    Ok(Reply::embed(embeds::create_enqueued_embed(&report)))
}
