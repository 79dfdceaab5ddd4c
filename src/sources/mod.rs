pub mod youtube;

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::audio::track::Track;
use crate::error::PlayerResult;

pub use youtube::YouTubeClient;

/// Rango de entradas de una playlist (índices base 1, como yt-dlp)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemRange {
    All,
    /// Las primeras `n`
    First(usize),
    /// Desde la posición `n` hasta el final
    From(usize),
}

impl ItemRange {
    /// Valor para `--playlist-items`
    pub fn as_arg(&self) -> Option<String> {
        match self {
            Self::All => None,
            Self::First(n) => Some(format!("1-{}", n)),
            Self::From(n) => Some(format!("{}-", n)),
        }
    }
}

/// URL de stream lista para abrir, con las cabeceras que exige el servidor
#[derive(Debug, Clone)]
pub struct ResolvedStream {
    pub track: Track,
    pub stream_url: String,
    pub http_headers: HashMap<String, String>,
}

/// Archivos que dejó una descarga en el directorio temporal
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadedFiles {
    pub audio: PathBuf,
    pub thumbnail: Option<PathBuf>,
}

/// Búsqueda y resolución de pistas
#[async_trait]
pub trait TrackResolver: Send + Sync {
    /// Texto libre, URL de video o URL de playlist
    async fn search(&self, query: &str, range: ItemRange) -> PlayerResult<Vec<Track>>;
    async fn resolve_stream(&self, track_id: &str) -> PlayerResult<ResolvedStream>;
}

/// Pistas relacionadas con una semilla
#[async_trait]
pub trait RecommendationFeed: Send + Sync {
    async fn related(&self, seed_id: &str, window: usize) -> PlayerResult<Vec<Track>>;
}

#[async_trait]
pub trait TrackDownloader: Send + Sync {
    /// Descarga audio y miniatura de `track_id` dentro de `staging_dir`
    async fn download(&self, track_id: &str, staging_dir: &Path) -> PlayerResult<DownloadedFiles>;
}

pub fn is_url(input: &str) -> bool {
    url::Url::parse(input)
        .map(|u| matches!(u.scheme(), "http" | "https"))
        .unwrap_or(false)
}

/// Convierte lo que escribió el usuario en algo que yt-dlp entienda
pub fn to_query(input: &str) -> String {
    let input = input.trim();
    if is_url(input) {
        input.to_string()
    } else {
        format!("ytsearch1:{}", input)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn free_text_becomes_a_single_search() {
        assert_eq!(to_query("  daft punk  "), "ytsearch1:daft punk");
        assert_eq!(
            to_query("https://youtu.be/dQw4w9WgXcQ"),
            "https://youtu.be/dQw4w9WgXcQ"
        );
        assert!(!is_url("ftp://example.com/a.mp3"));
    }

    #[test]
    fn item_ranges_map_to_playlist_items() {
        assert_eq!(ItemRange::First(50).as_arg().as_deref(), Some("1-50"));
        assert_eq!(ItemRange::From(51).as_arg().as_deref(), Some("51-"));
        assert_eq!(ItemRange::All.as_arg(), None);
    }
}
