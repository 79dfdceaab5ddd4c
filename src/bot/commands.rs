use anyhow::Result;
use serenity::{
    builder::{CreateCommand, CreateCommandOption},
    model::{application::CommandOptionType, id::GuildId},
    prelude::Context,
};

fn all_commands() -> Vec<CreateCommand> {
    vec![
        play_command(),
        search_command(),
        pause_command(),
        resume_command(),
        skip_command(),
        stop_command(),
        queue_command(),
        history_command(),
        shuffle_command(),
        remove_command(),
        clear_command(),
        autoplay_command(),
        new_command(),
        setchannel_command(),
        saveplaylist_command(),
        loadplaylist_command(),
        delplaylist_command(),
        listplaylists_command(),
        cache_command(),
        help_command(),
    ]
}

/// Registra comandos globales
pub async fn register_global_commands(ctx: &Context) -> Result<()> {
    for command in all_commands() {
        ctx.http.create_global_command(&command).await?;
    }

    Ok(())
}

/// Registra comandos para una guild específica (desarrollo)
pub async fn register_guild_commands(ctx: &Context, guild_id: GuildId) -> Result<()> {
    guild_id.set_commands(&ctx.http, all_commands()).await?;

    Ok(())
}

fn page_option() -> CreateCommandOption {
    CreateCommandOption::new(CommandOptionType::Integer, "page", "Número de página").min_int_value(1)
}

// Comandos de reproducción

fn play_command() -> CreateCommand {
    CreateCommand::new("play")
        .description("Reproduce una canción o playlist")
        .add_option(
            CreateCommandOption::new(
                CommandOptionType::String,
                "query",
                "URL o término de búsqueda",
            )
            .required(true),
        )
}

fn search_command() -> CreateCommand {
    CreateCommand::new("search")
        .description("Busca canciones y muestra resultados")
        .add_option(
            CreateCommandOption::new(CommandOptionType::String, "query", "Término de búsqueda")
                .required(true),
        )
}

// Comandos de control

fn pause_command() -> CreateCommand {
    CreateCommand::new("pause").description("Pausa la reproducción actual")
}

fn resume_command() -> CreateCommand {
    CreateCommand::new("resume").description("Reanuda la reproducción pausada")
}

fn skip_command() -> CreateCommand {
    CreateCommand::new("skip").description("Salta a la siguiente canción")
}

fn stop_command() -> CreateCommand {
    CreateCommand::new("stop").description("Detiene la música y sale del canal de voz")
}

// Comandos de cola

fn queue_command() -> CreateCommand {
    CreateCommand::new("queue")
        .description("Muestra la cola de reproducción")
        .add_option(page_option())
}

fn history_command() -> CreateCommand {
    CreateCommand::new("history")
        .description("Muestra las últimas canciones reproducidas")
        .add_option(page_option())
}

fn shuffle_command() -> CreateCommand {
    CreateCommand::new("shuffle").description("Mezcla la cola")
}

fn remove_command() -> CreateCommand {
    CreateCommand::new("remove")
        .description("Quita una canción de la cola")
        .add_option(
            CreateCommandOption::new(CommandOptionType::Integer, "position", "Posición en la cola")
                .min_int_value(1)
                .required(true),
        )
}

fn clear_command() -> CreateCommand {
    CreateCommand::new("clear").description("Vacía la cola")
}

// Autoplay

fn autoplay_command() -> CreateCommand {
    CreateCommand::new("autoplay")
        .description("Activa o desactiva las sugerencias automáticas")
        .add_option(CreateCommandOption::new(
            CommandOptionType::Boolean,
            "enabled",
            "Forzar encendido o apagado",
        ))
}

fn new_command() -> CreateCommand {
    CreateCommand::new("new").description("Cambia la sugerencia del autoplay")
}

// Ajustes y playlists

fn setchannel_command() -> CreateCommand {
    CreateCommand::new("setchannel").description("Usa este canal para los avisos del bot")
}

fn saveplaylist_command() -> CreateCommand {
    CreateCommand::new("saveplaylist")
        .description("Guarda la cola actual, o una playlist de YouTube, con un nombre")
        .add_option(
            CreateCommandOption::new(CommandOptionType::String, "name", "Nombre de la playlist")
                .required(true),
        )
        .add_option(CreateCommandOption::new(
            CommandOptionType::String,
            "url",
            "URL de una playlist de YouTube (se recarga en cada uso)",
        ))
}

fn loadplaylist_command() -> CreateCommand {
    CreateCommand::new("loadplaylist")
        .description("Carga una playlist guardada")
        .add_option(
            CreateCommandOption::new(CommandOptionType::String, "name", "Nombre de la playlist")
                .required(true),
        )
}

fn delplaylist_command() -> CreateCommand {
    CreateCommand::new("delplaylist")
        .description("Borra una playlist guardada")
        .add_option(
            CreateCommandOption::new(CommandOptionType::String, "name", "Nombre de la playlist")
                .required(true),
        )
}

fn listplaylists_command() -> CreateCommand {
    CreateCommand::new("listplaylists").description("Lista las playlists guardadas")
}

fn cache_command() -> CreateCommand {
    CreateCommand::new("cache")
        .description("Muestra las canciones en la caché local")
        .add_option(page_option())
        .add_option(CreateCommandOption::new(
            CommandOptionType::Boolean,
            "purge",
            "Borra toda la caché",
        ))
}

fn help_command() -> CreateCommand {
    CreateCommand::new("help").description("Muestra todos los comandos")
}
