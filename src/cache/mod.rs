//! # Cache Module
//!
//! Disk cache of downloaded tracks for the jukebox.
//!
//! Every track that is played (or is about to be) gets downloaded in the
//! background into `CACHE_DIR` as `<id>.<ext>` plus an optional `<id>.jpg`
//! thumbnail. The next time that id is played it is read from disk instead of
//! streamed.
//!
//! ## Layout
//!
//! ```text
//! CACHE_DIR/
//! ├── .incoming/        # descargas a medias, nunca se leen
//! ├── dQw4w9WgXcQ.webm
//! ├── dQw4w9WgXcQ.jpg
//! └── ...
//! ```
//!
//! Downloads land in `.incoming/` first and are moved into place with a
//! rename (thumbnail first, audio last), so a reader never sees a half-written
//! audio file under its final name.
//!
//! ## Eviction
//!
//! The directory is bounded by `MAX_CACHE_SIZE_GB`. Before each download the
//! manager runs [`eviction::enforce`]: if the audio total exceeds the ceiling, the
//! least recently used audio (by mtime) is deleted together with its
//! thumbnail until the total is at or below `ceiling - CACHE_SAFETY_MARGIN_MB`.
//! Playing a cached file refreshes its mtime, which is what makes the order
//! LRU.
//!
//! ## Configuration
//!
//! ```env
//! CACHE_DIR=/app/cache
//! MAX_CACHE_SIZE_GB=16
//! CACHE_SAFETY_MARGIN_MB=100
//! CACHE_AUDIO_EXTENSIONS=webm,m4a,opus,mp3
//! ```

pub mod eviction;

use dashmap::DashSet;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::audio::track::Track;
use crate::error::{PlayerError, PlayerResult};
use crate::sources::TrackDownloader;
use crate::storage::JsonStorage;
pub use eviction::{EvictionPolicy, EvictionReport};

const STAGING_DIR: &str = ".incoming";

/// Un archivo de audio más chico que esto se considera roto
pub const MIN_VALID_AUDIO_BYTES: u64 = 1024;

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub dir: PathBuf,
    pub policy: EvictionPolicy,
}

/// Uso actual del directorio, para `/cache`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheUsage {
    pub used_bytes: u64,
    pub ceiling_bytes: u64,
    pub tracks: usize,
}

pub struct CacheManager {
    settings: CacheSettings,
    downloader: Arc<dyn TrackDownloader>,
    storage: Arc<Mutex<JsonStorage>>,
    // Un solo barrido de desalojo a la vez
    sweep_lock: Mutex<()>,
    in_flight: DashSet<String>,
}

impl CacheManager {
    /// Crea el directorio de caché y vacía lo que haya quedado a medias en
    /// `.incoming/` de una ejecución anterior.
    pub fn new(
        settings: CacheSettings,
        downloader: Arc<dyn TrackDownloader>,
        storage: Arc<Mutex<JsonStorage>>,
    ) -> std::io::Result<Arc<Self>> {
        let staging = settings.dir.join(STAGING_DIR);
        std::fs::create_dir_all(&staging)?;
        for entry in std::fs::read_dir(&staging)? {
            let path = entry?.path();
            if path.is_file() {
                let _ = std::fs::remove_file(&path);
            }
        }

        info!("💾 Caché de audio en {}", settings.dir.display());
        Ok(Arc::new(Self {
            settings,
            downloader,
            storage,
            sweep_lock: Mutex::new(()),
            in_flight: DashSet::new(),
        }))
    }

    #[cfg(test)]
    pub fn dir(&self) -> &Path {
        &self.settings.dir
    }

    fn staging_dir(&self) -> PathBuf {
        self.settings.dir.join(STAGING_DIR)
    }

    /// Ruta del audio cacheado de `track_id`, si existe y no está truncado
    pub async fn lookup(&self, track_id: &str) -> Option<PathBuf> {
        for ext in &self.settings.policy.audio_extensions {
            let path = self.settings.dir.join(format!("{}.{}", track_id, ext));
            if let Ok(meta) = tokio::fs::metadata(&path).await {
                if meta.is_file() && meta.len() > MIN_VALID_AUDIO_BYTES {
                    return Some(path);
                }
            }
        }
        None
    }

    /// Marca el archivo como usado recién (mtime = ahora)
    pub async fn touch(&self, path: &Path) {
        let path = path.to_path_buf();
        let result = tokio::task::spawn_blocking(move || {
            OpenOptions::new()
                .append(true)
                .open(&path)?
                .set_modified(SystemTime::now())
        })
        .await;

        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!("No se pudo actualizar mtime: {}", e),
            Err(e) => warn!("⚠️ Tarea de touch abortada: {}", e),
        }
    }

    /// Aplica el límite de tamaño. Los desalojados se quitan del índice.
    pub async fn enforce_limit(&self) -> PlayerResult<EvictionReport> {
        let _sweep = self.sweep_lock.lock().await;

        let dir = self.settings.dir.clone();
        let policy = self.settings.policy.clone();
        let report = tokio::task::spawn_blocking(move || eviction::enforce(&dir, &policy))
            .await
            .map_err(|e| PlayerError::CacheIo(std::io::Error::other(e)))??;

        if !report.evicted.is_empty() {
            info!(
                "🧹 Caché: {} pistas desalojadas ({} MB → {} MB)",
                report.evicted.len(),
                report.scanned_bytes / (1024 * 1024),
                report.remaining_bytes / (1024 * 1024)
            );
            if let Err(e) = self.storage.lock().await.forget_cached(&report.evicted).await {
                warn!("⚠️ No se pudo actualizar el índice de caché: {}", e);
            }
        }
        Ok(report)
    }

    /// Descarga `track` en segundo plano si no está en caché. Devuelve `None`
    /// si ya hay una descarga de ese id en curso.
    pub fn prefetch(self: &Arc<Self>, track: Track) -> Option<JoinHandle<()>> {
        if !self.in_flight.insert(track.id.clone()) {
            debug!("⏳ Descarga de {} ya en curso", track.id);
            return None;
        }

        let this = Arc::clone(self);
        Some(tokio::spawn(async move {
            if this.lookup(&track.id).await.is_none() {
                if let Err(e) = this.download(&track).await {
                    error!("❌ Error descargando {}: {}", track.id, e);
                }
            }
            this.in_flight.remove(&track.id);
        }))
    }

    /// Descarga varias pistas una detrás de otra
    pub fn prefetch_many(self: &Arc<Self>, tracks: Vec<Track>) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            for track in tracks {
                if let Some(handle) = this.prefetch(track) {
                    let _ = handle.await;
                }
            }
        })
    }

    #[cfg(test)]
    pub fn is_downloading(&self, track_id: &str) -> bool {
        self.in_flight.contains(track_id)
    }

    async fn download(&self, track: &Track) -> PlayerResult<PathBuf> {
        if let Err(e) = self.enforce_limit().await {
            warn!("⚠️ Barrido de caché fallido: {}", e);
        }

        debug!("📥 Descargando {} ({})", track.title, track.id);
        let files = self.downloader.download(&track.id, &self.staging_dir()).await?;

        if let Some(thumbnail) = files.thumbnail {
            let target = self.settings.dir.join(format!("{}.jpg", track.id));
            if let Err(e) = tokio::fs::rename(&thumbnail, &target).await {
                debug!("Miniatura de {} descartada: {}", track.id, e);
            }
        }

        let ext = files
            .audio
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("webm")
            .to_string();
        let target = self.settings.dir.join(format!("{}.{}", track.id, ext));
        tokio::fs::rename(&files.audio, &target).await?;

        if let Err(e) = self.storage.lock().await.record_cached(&track.id, &track.title).await {
            warn!("⚠️ No se pudo actualizar el índice de caché: {}", e);
        }
        info!("💾 En caché: {}", track.title);
        Ok(target)
    }

    /// Títulos cacheados según el índice, ordenados por id
    pub async fn cached_titles(&self) -> Vec<(String, String)> {
        self.storage
            .lock()
            .await
            .cache_map()
            .iter()
            .map(|(id, title)| (id.clone(), title.clone()))
            .collect()
    }

    pub async fn usage(&self) -> PlayerResult<CacheUsage> {
        let dir = self.settings.dir.clone();
        let policy = self.settings.policy.clone();
        let used_bytes = tokio::task::spawn_blocking(move || eviction::audio_bytes(&dir, &policy))
            .await
            .map_err(|e| PlayerError::CacheIo(std::io::Error::other(e)))??;

        Ok(CacheUsage {
            used_bytes,
            ceiling_bytes: self.settings.policy.ceiling_bytes,
            tracks: self.storage.lock().await.cache_map().len(),
        })
    }

    /// Borra todo el audio y las miniaturas cacheadas
    pub async fn clear(&self) -> PlayerResult<usize> {
        let _sweep = self.sweep_lock.lock().await;

        let dir = self.settings.dir.clone();
        let policy = self.settings.policy.clone();
        let removed = tokio::task::spawn_blocking(move || -> std::io::Result<usize> {
            let mut removed = 0;
            for entry in std::fs::read_dir(&dir)? {
                let path = entry?.path();
                let is_thumbnail = path.extension().is_some_and(|e| e == "jpg");
                if path.is_file() && (policy.is_audio(&path) || is_thumbnail) {
                    if std::fs::remove_file(&path).is_ok() && !is_thumbnail {
                        removed += 1;
                    }
                }
            }
            Ok(removed)
        })
        .await
        .map_err(|e| PlayerError::CacheIo(std::io::Error::other(e)))??;

        if let Err(e) = self.storage.lock().await.clear_cache_map().await {
            warn!("⚠️ No se pudo vaciar el índice de caché: {}", e);
        }
        info!("🗑️ Caché vaciada: {} pistas", removed);
        Ok(removed)
    }
}
