use serenity::{
    all::ButtonStyle,
    builder::{CreateActionRow, CreateButton, CreateSelectMenu, CreateSelectMenuKind, CreateSelectMenuOption},
};

use crate::audio::track::Track;

/// IDs personalizados para los componentes
pub mod button_ids {
    pub const PLAY_PAUSE: &str = "music_play_pause";
    pub const SKIP: &str = "music_skip";
    pub const SHUFFLE: &str = "music_shuffle";
    pub const QUEUE: &str = "music_queue";
    pub const STOP: &str = "music_stop";
    pub const TRACK_SELECTION: &str = "track_selection";
}

/// Prefijo del valor de cada opción del menú de búsqueda; le sigue el id
pub const TRACK_OPTION_PREFIX: &str = "track_";

/// Controles del mensaje "Reproduciendo Ahora"
pub fn create_player_buttons() -> Vec<CreateActionRow> {
    let play_pause_btn = CreateButton::new(button_ids::PLAY_PAUSE)
        .emoji('⏯')
        .style(ButtonStyle::Primary);

    let skip_btn = CreateButton::new(button_ids::SKIP)
        .emoji('⏭')
        .style(ButtonStyle::Secondary);

    let shuffle_btn = CreateButton::new(button_ids::SHUFFLE)
        .emoji('🔀')
        .style(ButtonStyle::Secondary);

    let queue_btn = CreateButton::new(button_ids::QUEUE)
        .label("Cola")
        .emoji('📋')
        .style(ButtonStyle::Secondary);

    let stop_btn = CreateButton::new(button_ids::STOP)
        .emoji('⏹')
        .style(ButtonStyle::Danger);

    vec![CreateActionRow::Buttons(vec![
        play_pause_btn,
        skip_btn,
        shuffle_btn,
        queue_btn,
        stop_btn,
    ])]
}

/// Menú de selección con los resultados de `/search`
pub fn create_track_selection_menu(tracks: &[Track]) -> Vec<CreateActionRow> {
    let options = tracks
        .iter()
        .take(25)
        .map(|track| {
            let label = truncate(&format!("{} [{}]", track.title, track.formatted_duration()), 100);
            CreateSelectMenuOption::new(label, format!("{}{}", TRACK_OPTION_PREFIX, track.id))
                .description(truncate(&track.author, 100))
        })
        .collect();

    let menu = CreateSelectMenu::new(button_ids::TRACK_SELECTION, CreateSelectMenuKind::String { options })
        .placeholder("Selecciona una canción para reproducir...")
        .min_values(1)
        .max_values(1);

    vec![CreateActionRow::SelectMenu(menu)]
}

/// Recorta a `max` caracteres agregando "..."
pub fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max.saturating_sub(3)).collect();
    out.push_str("...");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn long_labels_fit_discord_limits() {
        let label = truncate(&"ñ".repeat(150), 100);
        assert_eq!(label.chars().count(), 100);
        assert!(label.ends_with("..."));
        assert_eq!(truncate("corto", 100), "corto");
    }
}
