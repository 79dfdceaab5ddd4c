use anyhow::Context;
use async_process::Command;
use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use super::{DownloadedFiles, ItemRange, RecommendationFeed, ResolvedStream, TrackDownloader, TrackResolver};
use crate::audio::track::Track;
use crate::error::{PlayerError, PlayerResult};

/// Formato preferido: webm/opus evita recodificar en la mayoría de casos
const AUDIO_FORMAT: &str = "bestaudio[ext=webm]/bestaudio/best";

static YOUTUBE_ID: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:youtube\.com/(?:watch\?(?:.*&)?v=|embed/|v/|shorts/)|youtu\.be/)([A-Za-z0-9_-]{11})")
        .unwrap_or_else(|e| panic!("regex de YouTube inválida: {e}"))
});

/// Cliente para interactuar con YouTube/yt-dlp
pub struct YouTubeClient {
    binary: String,
    // Limitar procesos concurrentes para evitar rate limiting
    rate_limiter: Semaphore,
}

/// Información extraída de yt-dlp (video suelto o playlist)
#[derive(Debug, Deserialize)]
struct YtDlpInfo {
    id: Option<String>,
    title: Option<String>,
    duration: Option<f64>,
    uploader: Option<String>,
    channel: Option<String>,
    webpage_url: Option<String>,
    url: Option<String>,
    entries: Option<Vec<YtDlpInfo>>,
    #[serde(default)]
    http_headers: HashMap<String, String>,
}

impl YouTubeClient {
    pub fn new() -> Self {
        Self::with_binary("yt-dlp")
    }

    pub fn with_binary(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            rate_limiter: Semaphore::new(3),
        }
    }

    /// Comprueba que yt-dlp esté instalado y devuelve su versión
    pub async fn verify_dependencies(&self) -> anyhow::Result<String> {
        let output = Command::new(&self.binary)
            .arg("--version")
            .output()
            .await
            .with_context(|| format!("No se encontró {}", self.binary))?;

        if !output.status.success() {
            anyhow::bail!("{} --version terminó con {}", self.binary, output.status);
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Video, playlist o mix de YouTube / YouTube Music
    pub fn is_youtube_url(url: &str) -> bool {
        url::Url::parse(url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_ascii_lowercase))
            .is_some_and(|host| {
                host == "youtu.be" || host == "youtube.com" || host.ends_with(".youtube.com")
            })
    }

    pub fn extract_video_id(url: &str) -> Option<String> {
        YOUTUBE_ID
            .captures(url)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string())
    }

    pub fn watch_url(id: &str) -> String {
        format!("https://www.youtube.com/watch?v={}", id)
    }

    /// URL del mix automático de YouTube para una semilla
    pub fn mix_url(id: &str) -> String {
        format!("https://www.youtube.com/watch?v={id}&list=RD{id}")
    }

    async fn run(&self, args: &[String]) -> Result<Vec<u8>, String> {
        let _permit = self
            .rate_limiter
            .acquire()
            .await
            .map_err(|e| e.to_string())?;

        debug!("▶️ {} {}", self.binary, args.join(" "));
        let output = Command::new(&self.binary)
            .args(args)
            .output()
            .await
            .map_err(|e| format!("Error al ejecutar {}: {}", self.binary, e))?;

        if !output.status.success() {
            let error = String::from_utf8_lossy(&output.stderr);
            return Err(format!("yt-dlp error: {}", error.trim()));
        }
        Ok(output.stdout)
    }

    async fn flat_extract(&self, target: &str, range: ItemRange) -> PlayerResult<Vec<Track>> {
        let mut args = vec![
            "--flat-playlist".to_string(),
            "--dump-single-json".to_string(),
            "--no-warnings".to_string(),
        ];
        if let Some(items) = range.as_arg() {
            args.push("--playlist-items".to_string());
            args.push(items);
        }
        args.push(target.to_string());

        let stdout = self.run(&args).await.map_err(PlayerError::Resolution)?;
        parse_tracks(&stdout)
    }
}

impl Default for YouTubeClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TrackResolver for YouTubeClient {
    async fn search(&self, query: &str, range: ItemRange) -> PlayerResult<Vec<Track>> {
        info!("🔍 Buscando: {}", query);
        let tracks = self.flat_extract(query, range).await?;
        if tracks.is_empty() {
            return Err(PlayerError::Resolution(format!("Sin resultados para '{}'", query)));
        }
        Ok(tracks)
    }

    async fn resolve_stream(&self, track_id: &str) -> PlayerResult<ResolvedStream> {
        debug!("🎵 Obteniendo URL de stream para: {}", track_id);
        let args = vec![
            "-f".to_string(),
            AUDIO_FORMAT.to_string(),
            "--dump-single-json".to_string(),
            "--no-playlist".to_string(),
            "--no-warnings".to_string(),
            Self::watch_url(track_id),
        ];
        let stdout = self.run(&args).await.map_err(PlayerError::Resolution)?;
        parse_stream(&stdout)
    }
}

#[async_trait]
impl RecommendationFeed for YouTubeClient {
    async fn related(&self, seed_id: &str, window: usize) -> PlayerResult<Vec<Track>> {
        debug!("🎲 Consultando mix de {}", seed_id);
        self.flat_extract(&Self::mix_url(seed_id), ItemRange::First(window))
            .await
    }
}

#[async_trait]
impl TrackDownloader for YouTubeClient {
    async fn download(&self, track_id: &str, staging_dir: &Path) -> PlayerResult<DownloadedFiles> {
        let template = staging_dir.join("%(id)s.%(ext)s");
        let args = vec![
            "-f".to_string(),
            AUDIO_FORMAT.to_string(),
            "-o".to_string(),
            template.to_string_lossy().into_owned(),
            "--write-thumbnail".to_string(),
            "--convert-thumbnails".to_string(),
            "jpg".to_string(),
            "--no-playlist".to_string(),
            "--no-warnings".to_string(),
            "--quiet".to_string(),
            Self::watch_url(track_id),
        ];
        self.run(&args)
            .await
            .map_err(|e| PlayerError::CacheIo(std::io::Error::other(e)))?;

        let mut names = Vec::new();
        let mut dir = tokio::fs::read_dir(staging_dir).await?;
        while let Some(entry) = dir.next_entry().await? {
            names.push(entry.path());
        }

        pick_downloaded(track_id, names).ok_or_else(|| {
            warn!("⚠️ yt-dlp terminó sin dejar audio para {}", track_id);
            PlayerError::CacheIo(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no se encontró el audio descargado de {}", track_id),
            ))
        })
    }
}

fn parse_info(stdout: &[u8]) -> PlayerResult<YtDlpInfo> {
    serde_json::from_slice(stdout)
        .map_err(|e| PlayerError::Resolution(format!("Error al parsear respuesta de yt-dlp: {}", e)))
}

/// Convierte la salida de `--dump-single-json` en pistas. Un video suelto da
/// una sola pista; una playlist o búsqueda da sus entradas con id.
fn parse_tracks(stdout: &[u8]) -> PlayerResult<Vec<Track>> {
    let info = parse_info(stdout)?;
    Ok(match info.entries {
        Some(entries) => entries.into_iter().filter_map(info_to_track).collect(),
        None => info_to_track(info).into_iter().collect(),
    })
}

fn parse_stream(stdout: &[u8]) -> PlayerResult<ResolvedStream> {
    let mut info = parse_info(stdout)?;
    let stream_url = info
        .url
        .take()
        .filter(|u| !u.is_empty())
        .ok_or_else(|| PlayerError::Resolution("No se pudo obtener URL de stream".to_string()))?;
    let http_headers = std::mem::take(&mut info.http_headers);
    let track = info_to_track(info)
        .ok_or_else(|| PlayerError::Resolution("Respuesta de yt-dlp sin id".to_string()))?;

    Ok(ResolvedStream {
        track,
        stream_url,
        http_headers,
    })
}

fn info_to_track(info: YtDlpInfo) -> Option<Track> {
    let id = info
        .id
        .filter(|id| !id.is_empty())
        .or_else(|| info.url.as_deref().and_then(YouTubeClient::extract_video_id))?;

    let mut track = Track::new(id.clone(), info.title.unwrap_or_else(|| "Sin título".to_string()))
        .with_duration(info.duration.map(|d| d.max(0.0) as u64).unwrap_or(0))
        .with_webpage_url(info.webpage_url.unwrap_or_else(|| YouTubeClient::watch_url(&id)));
    if let Some(author) = info.uploader.or(info.channel) {
        track = track.with_author(author);
    }
    Some(track)
}

/// Elige entre los archivos del directorio temporal los que pertenecen a
/// `track_id`: la miniatura `.jpg` y el audio (lo demás son restos a medias).
fn pick_downloaded(track_id: &str, paths: Vec<PathBuf>) -> Option<DownloadedFiles> {
    let mut audio = None;
    let mut thumbnail = None;

    for path in paths {
        let (Some(stem), Some(ext)) = (
            path.file_stem().and_then(|s| s.to_str()),
            path.extension().and_then(|s| s.to_str()),
        ) else {
            continue;
        };
        if stem != track_id {
            continue;
        }
        match ext {
            "jpg" => thumbnail = Some(path),
            "part" | "ytdl" | "webp" | "png" | "temp" => {}
            _ => audio = Some(path),
        }
    }

    audio.map(|audio| DownloadedFiles { audio, thumbnail })
}
