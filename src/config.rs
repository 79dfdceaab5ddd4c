use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::audio::autoplay::AutoplaySettings;
use crate::audio::player::PlayerConfig;
use crate::audio::state::SessionDefaults;
use crate::cache::{CacheSettings, EvictionPolicy};

const MB: u64 = 1024 * 1024;
const GB: u64 = 1024 * MB;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    // Discord
    pub discord_token: String,
    pub application_id: u64,
    pub guild_id: Option<u64>, // Para comandos de desarrollo

    // Paths
    pub data_dir: PathBuf,
    pub cache_dir: PathBuf,

    // Caché
    pub max_cache_size_gb: u64,
    pub cache_safety_margin_mb: u64,
    pub cache_audio_extensions: Vec<String>,

    // Reproducción
    pub idle_timeout_secs: u64,
    pub idle_sweep_interval_secs: u64,
    pub retry_backoff_ms: u64,
    pub max_load_attempts: u32,
    pub history_size: usize,
    pub max_queue_size: usize,

    // Autoplay
    pub autoplay_window: usize,
    pub autoplay_candidates: usize,
    pub enable_autoplay: bool,

    // Playlists
    pub playlist_prefetch: usize,
    pub playlist_load_limit: usize,
}

fn env_or<T>(key: &str, default: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw = std::env::var(key).unwrap_or_else(|_| default.to_string());
    raw.trim()
        .parse()
        .map_err(|e| anyhow::anyhow!("{} inválido ('{}'): {}", key, raw, e))
}

fn parse_extensions(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|ext| ext.trim().trim_start_matches('.').to_ascii_lowercase())
        .filter(|ext| !ext.is_empty())
        .collect()
}

impl Config {
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = Self {
            // Discord
            discord_token: std::env::var("DISCORD_TOKEN")?,
            application_id: std::env::var("APPLICATION_ID")?.parse()?,
            guild_id: std::env::var("GUILD_ID").ok().and_then(|s| s.parse().ok()),

            // Paths
            data_dir: std::env::var("DATA_DIR")
                .unwrap_or_else(|_| "/app/data".to_string())
                .into(),
            cache_dir: std::env::var("CACHE_DIR")
                .unwrap_or_else(|_| "/app/cache".to_string())
                .into(),

            // Caché
            max_cache_size_gb: env_or("MAX_CACHE_SIZE_GB", "16")?,
            cache_safety_margin_mb: env_or("CACHE_SAFETY_MARGIN_MB", "100")?,
            cache_audio_extensions: parse_extensions(
                &std::env::var("CACHE_AUDIO_EXTENSIONS")
                    .unwrap_or_else(|_| "webm,m4a,opus,mp3".to_string()),
            ),

            // Reproducción
            idle_timeout_secs: env_or("IDLE_TIMEOUT_SECS", "300")?,
            idle_sweep_interval_secs: env_or("IDLE_SWEEP_INTERVAL_SECS", "120")?,
            retry_backoff_ms: env_or("RETRY_BACKOFF_MS", "2000")?,
            max_load_attempts: env_or("MAX_LOAD_ATTEMPTS", "3")?,
            history_size: env_or("HISTORY_SIZE", "20")?,
            max_queue_size: env_or("MAX_QUEUE_SIZE", "1000")?,

            // Autoplay
            autoplay_window: env_or("AUTOPLAY_WINDOW", "20")?,
            autoplay_candidates: env_or("AUTOPLAY_CANDIDATES", "5")?,
            enable_autoplay: env_or("ENABLE_AUTOPLAY", "false")?,

            // Playlists
            playlist_prefetch: env_or("PLAYLIST_PREFETCH", "3")?,
            playlist_load_limit: env_or("PLAYLIST_LOAD_LIMIT", "50")?,
        };

        std::fs::create_dir_all(&config.data_dir)?;
        std::fs::create_dir_all(&config.cache_dir)?;

        config.validate()?;

        Ok(config)
    }

    /// Validates configuration values for correctness.
    ///
    /// # Validation Rules
    ///
    /// - The cache ceiling must be larger than the safety margin
    /// - At least one audio extension must be configured
    /// - Queue, history and autoplay sizes must be > 0
    /// - At least one load attempt per track
    pub fn validate(&self) -> Result<()> {
        if self.max_cache_size_gb == 0 {
            anyhow::bail!("Max cache size must be greater than 0");
        }

        if self.cache_safety_margin_mb * MB >= self.max_cache_size_gb * GB {
            anyhow::bail!(
                "Cache safety margin ({} MB) must be smaller than the cache size ({} GB)",
                self.cache_safety_margin_mb,
                self.max_cache_size_gb
            );
        }

        if self.cache_audio_extensions.is_empty() {
            anyhow::bail!("At least one cache audio extension is required");
        }

        if self.max_queue_size == 0 {
            anyhow::bail!("Max queue size must be greater than 0");
        }

        if self.history_size == 0 {
            anyhow::bail!("History size must be greater than 0");
        }

        if self.max_load_attempts == 0 {
            anyhow::bail!("Max load attempts must be at least 1");
        }

        if self.autoplay_window == 0 || self.autoplay_candidates == 0 {
            anyhow::bail!("Autoplay window and candidates must be greater than 0");
        }

        if self.idle_sweep_interval_secs == 0 {
            anyhow::bail!("Idle sweep interval must be greater than 0");
        }

        if self.playlist_load_limit == 0 {
            anyhow::bail!("Playlist load limit must be greater than 0");
        }

        Ok(())
    }

    /// Returns a summary of the current configuration for logging.
    ///
    /// Excludes the token.
    pub fn summary(&self) -> String {
        format!(
            "Config Summary:\n  \
            Discord: App ID {} (Guild: {})\n  \
            Cache: {} in {} GB (margin {} MB, ext {})\n  \
            Playback: {} queue, {} history, {} attempts every {}ms\n  \
            Idle: {}s timeout, sweep every {}s\n  \
            Autoplay: default={}, window {}, {} candidates",
            self.application_id,
            self.guild_id.map_or("global".to_string(), |id| id.to_string()),
            self.cache_dir.display(),
            self.max_cache_size_gb,
            self.cache_safety_margin_mb,
            self.cache_audio_extensions.join(","),
            self.max_queue_size,
            self.history_size,
            self.max_load_attempts,
            self.retry_backoff_ms,
            self.idle_timeout_secs,
            self.idle_sweep_interval_secs,
            self.enable_autoplay,
            self.autoplay_window,
            self.autoplay_candidates,
        )
    }

    pub fn player_config(&self) -> PlayerConfig {
        PlayerConfig {
            session: SessionDefaults {
                max_queue_size: self.max_queue_size,
                history_size: self.history_size,
                autoplay_enabled: self.enable_autoplay,
            },
            autoplay: AutoplaySettings {
                window: self.autoplay_window,
                max_candidates: self.autoplay_candidates,
                history_window: self.history_size,
            },
            retry_backoff: Duration::from_millis(self.retry_backoff_ms),
            max_load_attempts: self.max_load_attempts,
            idle_timeout: Duration::from_secs(self.idle_timeout_secs),
            playlist_prefetch: self.playlist_prefetch,
        }
    }

    pub fn cache_settings(&self) -> CacheSettings {
        CacheSettings {
            dir: self.cache_dir.clone(),
            policy: EvictionPolicy {
                ceiling_bytes: self.max_cache_size_gb * GB,
                safety_margin_bytes: self.cache_safety_margin_mb * MB,
                audio_extensions: self.cache_audio_extensions.clone(),
            },
        }
    }

    pub fn idle_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.idle_sweep_interval_secs)
    }
}

/// Default configuration values.
///
/// Used as fallbacks when environment variables are not provided.
impl Default for Config {
    fn default() -> Self {
        Self {
            // Discord (no defaults - must be provided)
            discord_token: String::new(),
            application_id: 0,
            guild_id: None,

            data_dir: "/app/data".into(),
            cache_dir: "/app/cache".into(),

            max_cache_size_gb: 16,
            cache_safety_margin_mb: 100,
            cache_audio_extensions: parse_extensions("webm,m4a,opus,mp3"),

            idle_timeout_secs: 300,
            idle_sweep_interval_secs: 120,
            retry_backoff_ms: 2000,
            max_load_attempts: 3,
            history_size: 20,
            max_queue_size: 1000,

            autoplay_window: 20,
            autoplay_candidates: 5,
            enable_autoplay: false,

            playlist_prefetch: 3,
            playlist_load_limit: 50,
        }
    }
}
