use serenity::{
    all::Timestamp,
    builder::{CreateEmbed, CreateEmbedFooter},
};

use crate::{
    audio::{
        player::{EnqueueReport, PlayerStatus},
        track::Track,
    },
    cache::CacheUsage,
    storage::SavedPlaylist,
};

/// Paleta de colores estandarizada para el bot
pub mod colors {
    use serenity::all::Colour;

    pub const SUCCESS_GREEN: Colour = Colour::from_rgb(67, 181, 129);
    pub const ERROR_RED: Colour = Colour::from_rgb(220, 53, 69);
    pub const WARNING_ORANGE: Colour = Colour::from_rgb(255, 193, 7);
    pub const INFO_BLUE: Colour = Colour::from_rgb(52, 144, 220);
    pub const MUSIC_PURPLE: Colour = Colour::from_rgb(138, 43, 226);
    pub const NEUTRAL_GRAY: Colour = Colour::from_rgb(108, 117, 125);
}

/// Footer estandarizado para todos los embeds
const STANDARD_FOOTER: &str = "🎵 Jukebox";
const SUGGESTION_FOOTER: &str = "✨ Sugerencia de Autoplay";
const ITEMS_PER_PAGE: usize = 10;

/// Página pedida (base 1) acotada a las que existen
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageWindow {
    pub start: usize,
    pub end: usize,
    pub page: usize,
    pub pages: usize,
}

pub fn page_window(total: usize, page: usize, per_page: usize) -> PageWindow {
    let pages = total.div_ceil(per_page).max(1);
    let page = page.clamp(1, pages);
    let start = (page - 1) * per_page;
    PageWindow {
        start,
        end: (start + per_page).min(total),
        page,
        pages,
    }
}

fn list_line(position: usize, track: &Track) -> String {
    format!(
        "`{}.` {}**{}** ({})",
        position,
        if track.suggested { "✨ " } else { "" },
        track.title,
        track.formatted_duration()
    )
}

fn paged_list(title: &str, lines: &[String], page: usize) -> CreateEmbed {
    let window = page_window(lines.len(), page, ITEMS_PER_PAGE);
    let description = if lines.is_empty() {
        "Vacío.".to_string()
    } else {
        lines[window.start..window.end].join("\n")
    };

    CreateEmbed::default()
        .title(format!("📜 {}", title))
        .description(description)
        .color(colors::MUSIC_PURPLE)
        .footer(CreateEmbedFooter::new(format!(
            "Página {} de {} • Total: {}",
            window.page,
            window.pages,
            lines.len()
        )))
        .timestamp(Timestamp::now())
}

/// Crea un embed para mostrar la canción actual
pub fn create_now_playing_embed(track: &Track) -> CreateEmbed {
    let footer = if track.suggested {
        SUGGESTION_FOOTER
    } else {
        STANDARD_FOOTER
    };

    CreateEmbed::default()
        .title("🎶 Reproduciendo Ahora")
        .description(format!("**[{}]({})**", track.title, track.watch_url()))
        .color(colors::SUCCESS_GREEN)
        .thumbnail(track.remote_thumbnail())
        .field("🎤 Autor", &track.author, true)
        .field("⏱️ Duración", track.formatted_duration(), true)
        .footer(CreateEmbedFooter::new(footer))
        .timestamp(Timestamp::now())
}

pub fn create_track_skipped_embed(track: &Track, reason: &str) -> CreateEmbed {
    CreateEmbed::default()
        .title("⚠️ Canción Omitida")
        .description(format!("No se pudo reproducir **{}**", track.title))
        .color(colors::WARNING_ORANGE)
        .field("Motivo", reason, false)
        .footer(CreateEmbedFooter::new(STANDARD_FOOTER))
        .timestamp(Timestamp::now())
}

/// Resultado de `/play` y `/loadplaylist`
pub fn create_enqueued_embed(report: &EnqueueReport) -> CreateEmbed {
    let description = match (report.added.as_slice(), &report.started) {
        (_, Some(track)) if report.added.len() == 1 => {
            format!("▶️ Reproduciendo **{}**", track.title)
        }
        ([track], None) => format!("✅ En cola: **{}**", track.title),
        (tracks, _) => format!("✅ Se agregaron **{}** canciones", tracks.len()),
    };

    CreateEmbed::default()
        .description(description)
        .color(colors::SUCCESS_GREEN)
}

/// Cola de la guild; `current_cached` indica si la actual sale del disco
pub fn create_queue_embed(status: &PlayerStatus, current_cached: bool, page: usize) -> CreateEmbed {
    if status.current.is_none() && status.queue.is_empty() {
        return CreateEmbed::default()
            .title("📋 Cola de Reproducción")
            .description("😴 **La cola está vacía**\n\n💡 Usa `/play <canción>` para agregar música")
            .color(colors::NEUTRAL_GRAY)
            .footer(CreateEmbedFooter::new(STANDARD_FOOTER))
            .timestamp(Timestamp::now());
    }

    let lines: Vec<String> = status
        .queue
        .iter()
        .enumerate()
        .map(|(i, entry)| list_line(i + 1, &entry.track))
        .collect();

    let mut embed = paged_list("Cola de Reproducción", &lines, page).color(colors::INFO_BLUE);

    if let Some(current) = &status.current {
        let source = if current_cached { "💾 Local" } else { "☁️ Stream" };
        let state = if status.paused { "⏸️ En pausa" } else { "▶️ Reproduciendo" };
        embed = embed.field(
            format!("{} ({})", state, source),
            format!("**{}**", current.title),
            false,
        );
    }

    embed.field(
        "📻 Autoplay",
        if status.autoplay { "Activado" } else { "Desactivado" },
        true,
    )
}

/// Historial, del más reciente al más viejo
pub fn create_history_embed(history: &[Track], page: usize) -> CreateEmbed {
    let lines: Vec<String> = history
        .iter()
        .enumerate()
        .map(|(i, track)| list_line(i + 1, track))
        .collect();
    paged_list("Historial", &lines, page)
}

pub fn create_cache_embed(usage: &CacheUsage, titles: &[String], page: usize) -> CreateEmbed {
    let lines: Vec<String> = titles
        .iter()
        .enumerate()
        .map(|(i, title)| format!("`{}.` **{}**", i + 1, title))
        .collect();

    paged_list("Caché Local", &lines, page).field(
        "💾 Almacenamiento",
        format!(
            "`{}` canciones • `{:.2} GB` / {} GB",
            usage.tracks,
            usage.used_bytes as f64 / (1024.0 * 1024.0 * 1024.0),
            usage.ceiling_bytes / (1024 * 1024 * 1024)
        ),
        false,
    )
}

pub fn create_playlists_embed<'a>(
    playlists: impl IntoIterator<Item = (&'a String, &'a SavedPlaylist)>,
) -> CreateEmbed {
    let lines: Vec<String> = playlists
        .into_iter()
        .map(|(name, playlist)| format!("• **{}** ({})", name, playlist.describe()))
        .collect();

    CreateEmbed::default()
        .title("📂 Playlists Guardadas")
        .description(if lines.is_empty() {
            "Ninguna".to_string()
        } else {
            lines.join("\n")
        })
        .color(colors::MUSIC_PURPLE)
        .footer(CreateEmbedFooter::new(STANDARD_FOOTER))
}

pub fn create_search_results_embed(query: &str, results: &[Track]) -> CreateEmbed {
    let lines: Vec<String> = results
        .iter()
        .enumerate()
        .map(|(i, track)| {
            format!(
                "**{}**. {} - {} `[{}]`",
                i + 1,
                track.title,
                track.author,
                track.formatted_duration()
            )
        })
        .collect();

    CreateEmbed::default()
        .title("🔍 Resultados de Búsqueda")
        .description(format!(
            "Búsqueda: **{}**\nSelecciona una canción del menú inferior:\n\n{}",
            query,
            lines.join("\n")
        ))
        .color(colors::INFO_BLUE)
}

/// Embed de una línea
pub fn create_message_embed(message: impl Into<String>) -> CreateEmbed {
    CreateEmbed::default()
        .description(message)
        .color(colors::MUSIC_PURPLE)
}

pub fn create_error_embed(message: impl Into<String>) -> CreateEmbed {
    CreateEmbed::default()
        .description(format!("❌ {}", message.into()))
        .color(colors::ERROR_RED)
}

pub fn create_help_embed() -> CreateEmbed {
    CreateEmbed::default()
        .title("🎵 Jukebox - Comandos")
        .color(colors::INFO_BLUE)
        .description("Controla la música con estos comandos:")
        .field(
            "🎵 Música",
            "`/play <canción/url>` - Reproduce música\n\
            `/search <texto>` - Elige entre resultados\n\
            `/pause` / `/resume`\n\
            `/skip`\n\
            `/stop`\n\
            `/autoplay` - Sugerencias automáticas\n\
            `/new` - Cambia la sugerencia",
            false,
        )
        .field(
            "📜 Cola",
            "`/queue`\n`/history`\n`/shuffle`\n`/remove <posición>`\n`/clear`",
            false,
        )
        .field(
            "📂 Playlists",
            "`/saveplaylist`\n`/loadplaylist`\n`/listplaylists`\n`/delplaylist`",
            false,
        )
        .field("⚙️ Utilidades", "`/setchannel` - Canal de avisos\n`/cache`", false)
        .footer(CreateEmbedFooter::new(STANDARD_FOOTER))
        .timestamp(Timestamp::now())
}
