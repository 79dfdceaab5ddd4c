use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serenity::model::id::{ChannelId, GuildId};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info, warn};

use crate::audio::track::Track;

const CACHE_MAP_FILE: &str = "cache_map.json";
const PLAYLISTS_FILE: &str = "playlists.json";
const SETTINGS_FILE: &str = "server_settings.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlaylistKind {
    Live,
}

/// Playlist guardada: una lista fija de pistas, o una URL que se vuelve a
/// cargar cada vez.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SavedPlaylist {
    Static(Vec<Track>),
    Live {
        #[serde(rename = "type")]
        kind: PlaylistKind,
        url: String,
    },
}

impl SavedPlaylist {
    pub fn live(url: impl Into<String>) -> Self {
        Self::Live {
            kind: PlaylistKind::Live,
            url: url.into(),
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Self::Static(tracks) => format!("{} canciones", tracks.len()),
            Self::Live { .. } => "🔴 En vivo".to_string(),
        }
    }
}

/// Manager de almacenamiento basado en archivos JSON.
///
/// Tres mapas planos en `data_dir`: el índice de la caché (id → título), las
/// playlists guardadas y el canal de avisos de cada servidor. Cada escritura
/// reemplaza el archivo entero vía archivo temporal + rename.
pub struct JsonStorage {
    data_dir: PathBuf,
    cache_map: BTreeMap<String, String>,
    playlists: BTreeMap<String, SavedPlaylist>,
    channels: BTreeMap<String, u64>,
}

impl JsonStorage {
    pub async fn new(data_dir: PathBuf) -> Result<Self> {
        // Crear directorio de datos si no existe
        fs::create_dir_all(&data_dir).await?;

        let storage = Self {
            cache_map: load_json(&data_dir.join(CACHE_MAP_FILE)).await,
            playlists: load_json(&data_dir.join(PLAYLISTS_FILE)).await,
            channels: load_json(&data_dir.join(SETTINGS_FILE)).await,
            data_dir,
        };

        info!(
            "📁 Storage inicializado en: {} ({} en caché, {} playlists)",
            storage.data_dir.display(),
            storage.cache_map.len(),
            storage.playlists.len()
        );
        Ok(storage)
    }

    // Índice de la caché

    pub fn cache_map(&self) -> &BTreeMap<String, String> {
        &self.cache_map
    }

    pub async fn record_cached(&mut self, id: &str, title: &str) -> Result<()> {
        self.cache_map.insert(id.to_string(), title.to_string());
        self.save(CACHE_MAP_FILE, &self.cache_map).await
    }

    /// Olvida entradas ya desalojadas. No escribe si nada cambió.
    pub async fn forget_cached(&mut self, ids: &[String]) -> Result<usize> {
        let removed = ids
            .iter()
            .filter(|id| self.cache_map.remove(id.as_str()).is_some())
            .count();
        if removed > 0 {
            self.save(CACHE_MAP_FILE, &self.cache_map).await?;
        }
        Ok(removed)
    }

    pub async fn clear_cache_map(&mut self) -> Result<()> {
        self.cache_map.clear();
        self.save(CACHE_MAP_FILE, &self.cache_map).await
    }

    // Playlists

    pub fn playlist(&self, name: &str) -> Option<&SavedPlaylist> {
        self.playlists.get(name)
    }

    pub fn playlists(&self) -> &BTreeMap<String, SavedPlaylist> {
        &self.playlists
    }

    pub async fn save_playlist(&mut self, name: &str, playlist: SavedPlaylist) -> Result<()> {
        // Las sugerencias nunca se guardan como parte de una playlist
        let playlist = match playlist {
            SavedPlaylist::Static(tracks) => {
                SavedPlaylist::Static(tracks.into_iter().map(Track::into_user_track).collect())
            }
            live => live,
        };
        self.playlists.insert(name.to_string(), playlist);
        self.save(PLAYLISTS_FILE, &self.playlists).await?;
        info!("💾 Playlist '{}' guardada", name);
        Ok(())
    }

    pub async fn delete_playlist(&mut self, name: &str) -> Result<bool> {
        if self.playlists.remove(name).is_none() {
            return Ok(false);
        }
        self.save(PLAYLISTS_FILE, &self.playlists).await?;
        info!("🗑️ Playlist '{}' eliminada", name);
        Ok(true)
    }

    // Canal de avisos por servidor

    pub fn notification_channel(&self, guild_id: GuildId) -> Option<ChannelId> {
        self.channels
            .get(&guild_id.get().to_string())
            .copied()
            .filter(|id| *id != 0)
            .map(ChannelId::new)
    }

    pub async fn set_notification_channel(&mut self, guild_id: GuildId, channel_id: ChannelId) -> Result<()> {
        self.channels.insert(guild_id.get().to_string(), channel_id.get());
        self.save(SETTINGS_FILE, &self.channels).await
    }

    async fn save<T: Serialize>(&self, file: &str, data: &T) -> Result<()> {
        let path = self.data_dir.join(file);
        let tmp = self.data_dir.join(format!("{}.tmp", file));
        let content = serde_json::to_string_pretty(data)?;

        fs::write(&tmp, content)
            .await
            .with_context(|| format!("Error escribiendo {}", tmp.display()))?;
        fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("Error reemplazando {}", path.display()))?;
        debug!("💾 {} guardado", file);
        Ok(())
    }
}

/// Carga un mapa JSON; si falta o está corrupto se empieza vacío.
async fn load_json<T: DeserializeOwned + Default>(path: &Path) -> T {
    let content = match fs::read_to_string(path).await {
        Ok(content) => content,
        Err(_) => return T::default(),
    };
    serde_json::from_str(&content).unwrap_or_else(|e| {
        warn!("⚠️ {} ilegible, se ignora: {}", path.display(), e);
        T::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    #[tokio::test]
    async fn maps_survive_a_restart() {
        let dir = TempDir::new().unwrap();
        {
            let mut storage = JsonStorage::new(dir.path().to_path_buf()).await.unwrap();
            storage.record_cached("a1", "Song A").await.unwrap();
            storage
                .save_playlist(
                    "fav",
                    SavedPlaylist::Static(vec![Track::new("a1", "Song A").into_suggestion()]),
                )
                .await
                .unwrap();
            storage.save_playlist("radio", SavedPlaylist::live("https://youtube.com/playlist?list=PL1")).await.unwrap();
            storage
                .set_notification_channel(GuildId::new(10), ChannelId::new(20))
                .await
                .unwrap();
        }

        let storage = JsonStorage::new(dir.path().to_path_buf()).await.unwrap();
        assert_eq!(storage.cache_map().get("a1").map(String::as_str), Some("Song A"));
        assert_eq!(storage.notification_channel(GuildId::new(10)), Some(ChannelId::new(20)));
        assert_eq!(storage.notification_channel(GuildId::new(11)), None);

        match storage.playlist("fav") {
            Some(SavedPlaylist::Static(tracks)) => assert!(!tracks[0].suggested),
            other => panic!("playlist inesperada: {other:?}"),
        }
        assert_eq!(
            storage.playlist("radio"),
            Some(&SavedPlaylist::live("https://youtube.com/playlist?list=PL1"))
        );
    }

    #[tokio::test]
    async fn legacy_files_are_readable() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join(PLAYLISTS_FILE),
            r#"{"old": [{"id": "x", "title": "X"}], "live": {"type": "live", "url": "https://u"}}"#,
        )
        .unwrap();
        std::fs::write(dir.path().join(SETTINGS_FILE), r#"{"5": 6}"#).unwrap();
        std::fs::write(dir.path().join(CACHE_MAP_FILE), "{not json").unwrap();

        let storage = JsonStorage::new(dir.path().to_path_buf()).await.unwrap();
        assert_eq!(storage.playlists().len(), 2);
        assert_eq!(storage.playlist("old").unwrap().describe(), "1 canciones");
        assert_eq!(storage.notification_channel(GuildId::new(5)), Some(ChannelId::new(6)));
        assert!(storage.cache_map().is_empty());
    }

    #[tokio::test]
    async fn forgetting_unknown_ids_is_a_no_op() {
        let dir = TempDir::new().unwrap();
        let mut storage = JsonStorage::new(dir.path().to_path_buf()).await.unwrap();
        storage.record_cached("a", "A").await.unwrap();

        assert_eq!(storage.forget_cached(&["zz".to_string()]).await.unwrap(), 0);
        assert_eq!(storage.forget_cached(&["a".to_string()]).await.unwrap(), 1);
        assert!(!storage.delete_playlist("nope").await.unwrap());
    }
}
