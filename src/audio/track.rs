use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Pista reproducible.
///
/// `suggested` marca las entradas elegidas por el autoplay; nunca se
/// persiste en playlists guardadas.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Track {
    pub id: String,
    pub title: String,
    #[serde(default = "unknown_author")]
    pub author: String,
    #[serde(default)]
    pub duration_seconds: u64,
    #[serde(default, rename = "webpage")]
    pub webpage_url: String,
    #[serde(default, skip_serializing)]
    pub suggested: bool,
}

fn unknown_author() -> String {
    "Desconocido".to_string()
}

impl Track {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            author: unknown_author(),
            duration_seconds: 0,
            webpage_url: String::new(),
            suggested: false,
        }
    }

    pub fn with_author(mut self, author: impl Into<String>) -> Self {
        self.author = author.into();
        self
    }

    pub fn with_duration(mut self, seconds: u64) -> Self {
        self.duration_seconds = seconds;
        self
    }

    pub fn with_webpage_url(mut self, url: impl Into<String>) -> Self {
        self.webpage_url = url.into();
        self
    }

    /// Copia marcada como sugerencia del autoplay
    pub fn into_suggestion(mut self) -> Self {
        self.suggested = true;
        self
    }

    /// Copia sin la marca de sugerencia
    pub fn into_user_track(mut self) -> Self {
        self.suggested = false;
        self
    }

    pub fn duration(&self) -> Option<Duration> {
        (self.duration_seconds > 0).then(|| Duration::from_secs(self.duration_seconds))
    }

    /// URL pública de la pista; si el resolver no dio una, se arma la de YouTube
    pub fn watch_url(&self) -> String {
        if self.webpage_url.is_empty() {
            format!("https://www.youtube.com/watch?v={}", self.id)
        } else {
            self.webpage_url.clone()
        }
    }

    pub fn remote_thumbnail(&self) -> String {
        format!("https://i.ytimg.com/vi/{}/mqdefault.jpg", self.id)
    }

    pub fn formatted_duration(&self) -> String {
        format_duration(self.duration_seconds)
    }
}

/// `m:ss` o `h:mm:ss`
pub fn format_duration(total_seconds: u64) -> String {
    let hours = total_seconds / 3600;
    let minutes = (total_seconds % 3600) / 60;
    let seconds = total_seconds % 60;

    if hours > 0 {
        format!("{}:{:02}:{:02}", hours, minutes, seconds)
    } else {
        format!("{}:{:02}", minutes, seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn durations_are_formatted_like_a_player() {
        assert_eq!(format_duration(0), "0:00");
        assert_eq!(format_duration(65), "1:05");
        assert_eq!(format_duration(3725), "1:02:05");
    }

    #[test]
    fn playlist_entries_never_carry_the_suggestion_flag() {
        let track = Track::new("abc", "Song").with_author("Band").into_suggestion();
        let json = serde_json::to_string(&track).unwrap();
        assert!(!json.contains("suggested"));

        let back: Track = serde_json::from_str(&json).unwrap();
        assert!(!back.suggested);
        assert_eq!(back.author, "Band");
    }

    #[test]
    fn legacy_entries_fill_missing_fields() {
        let back: Track = serde_json::from_str(r#"{"id":"x1","title":"Old"}"#).unwrap();
        assert_eq!(back.author, "Desconocido");
        assert_eq!(back.duration(), None);
        assert_eq!(back.watch_url(), "https://www.youtube.com/watch?v=x1");
    }
}
