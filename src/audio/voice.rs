//! Implementación con Songbird de las costuras de voz y audio.

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serenity::cache::Cache;
use serenity::model::id::{ChannelId, GuildId};
use songbird::input::{File, HttpRequest};
use songbird::tracks::TrackHandle;
use songbird::{Call, Event, EventContext, EventHandler as VoiceEventHandler, Songbird, TrackEvent};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::transport::{
    AudioLocation, AudioSource, AudioTranscoder, CompletionSink, VoiceConnector, VoiceTransport,
};
use crate::cache::MIN_VALID_AUDIO_BYTES;
use crate::error::{PlayerError, PlayerResult};

/// Estado de la pista actual visto desde los eventos de Songbird
#[derive(Debug, Default)]
struct PlaybackFlags {
    playing: AtomicBool,
    paused: AtomicBool,
    generation: AtomicU64,
}

/// Conexión de voz de una guild sobre un `songbird::Call`
pub struct SongbirdTransport {
    guild_id: GuildId,
    call: Arc<tokio::sync::Mutex<Call>>,
    manager: Arc<Songbird>,
    cache: Arc<Cache>,
    current: Mutex<Option<TrackHandle>>,
    flags: Arc<PlaybackFlags>,
}

impl SongbirdTransport {
    fn current_handle(&self) -> PlayerResult<TrackHandle> {
        self.current.lock().clone().ok_or(PlayerError::NotConnected)
    }
}

#[async_trait]
impl VoiceTransport for SongbirdTransport {
    async fn play(&self, source: AudioSource, sink: CompletionSink) -> PlayerResult<()> {
        // Primero la generación: el fin de la pista anterior que provoca
        // `play_only_input` ya no debe tocar las banderas.
        self.flags.generation.store(sink.generation(), Ordering::SeqCst);
        self.flags.playing.store(true, Ordering::SeqCst);
        self.flags.paused.store(false, Ordering::SeqCst);

        let handle = {
            let mut call = self.call.lock().await;
            call.play_only_input(source.into_input())
        };

        for (event, failure) in [(TrackEvent::End, false), (TrackEvent::Error, true)] {
            let notifier = TrackEndNotifier {
                guild_id: self.guild_id,
                sink: sink.clone(),
                flags: Arc::clone(&self.flags),
                failure,
            };
            handle
                .add_event(Event::Track(event), notifier)
                .map_err(|e| PlayerError::Transcode(format!("Error al agregar event handler: {}", e)))?;
        }

        *self.current.lock() = Some(handle);
        Ok(())
    }

    async fn stop(&self) {
        self.flags.playing.store(false, Ordering::SeqCst);
        self.flags.paused.store(false, Ordering::SeqCst);
        if let Some(handle) = self.current.lock().take() {
            let _ = handle.stop();
        }
    }

    async fn pause(&self) -> PlayerResult<()> {
        self.current_handle()?
            .pause()
            .map_err(|e| PlayerError::invalid(format!("No se pudo pausar: {}", e)))?;
        self.flags.paused.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn resume(&self) -> PlayerResult<()> {
        self.current_handle()?
            .play()
            .map_err(|e| PlayerError::invalid(format!("No se pudo reanudar: {}", e)))?;
        self.flags.paused.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_playing(&self) -> bool {
        self.flags.playing.load(Ordering::SeqCst) && !self.flags.paused.load(Ordering::SeqCst)
    }

    fn is_paused(&self) -> bool {
        self.flags.paused.load(Ordering::SeqCst)
    }

    fn member_count(&self) -> Option<usize> {
        let channel = {
            let call = self.call.try_lock().ok()?;
            ChannelId::from(call.current_channel()?.0)
        };
        let guild = self.cache.guild(self.guild_id)?;
        Some(
            guild
                .voice_states
                .values()
                .filter(|state| state.channel_id == Some(channel))
                .count(),
        )
    }

    async fn disconnect(&self) {
        if let Err(e) = self.manager.remove(self.guild_id).await {
            warn!("⚠️ Error al salir del canal de voz en guild {}: {:?}", self.guild_id, e);
        }
        info!("👋 Desconectado del canal de voz en guild {}", self.guild_id);
    }
}

/// Avisa al reproductor cuando la pista termina o falla
struct TrackEndNotifier {
    guild_id: GuildId,
    sink: CompletionSink,
    flags: Arc<PlaybackFlags>,
    /// Registrado para `TrackEvent::Error`
    failure: bool,
}

#[async_trait]
impl VoiceEventHandler for TrackEndNotifier {
    async fn act(&self, ctx: &EventContext<'_>) -> Option<Event> {
        let mut state_desc = None;
        if let EventContext::Track(tracks) = ctx {
            for (state, _handle) in *tracks {
                debug!("Pista terminada en guild {}: {:?}", self.guild_id, state.playing);
                state_desc = Some(format!("{:?}", state.playing));
            }
        }

        if self.flags.generation.load(Ordering::SeqCst) == self.sink.generation() {
            self.flags.playing.store(false, Ordering::SeqCst);
            self.flags.paused.store(false, Ordering::SeqCst);
        }
        if self.failure {
            let reason = state_desc.unwrap_or_else(|| "el stream falló".to_string());
            warn!("⚠️ Error de stream en guild {}: {}", self.guild_id, reason);
            self.sink.failed(reason);
        } else {
            self.sink.finished();
        }
        None
    }
}

pub struct SongbirdConnector {
    manager: Arc<Songbird>,
    cache: Arc<Cache>,
}

impl SongbirdConnector {
    pub fn new(manager: Arc<Songbird>, cache: Arc<Cache>) -> Self {
        Self { manager, cache }
    }
}

#[async_trait]
impl VoiceConnector for SongbirdConnector {
    async fn connect(
        &self,
        guild_id: GuildId,
        channel_id: ChannelId,
    ) -> PlayerResult<Arc<dyn VoiceTransport>> {
        let call = self.manager.join(guild_id, channel_id).await.map_err(|e| {
            error!("Error al obtener handler de voz: {:?}", e);
            PlayerError::Connect(e.to_string())
        })?;

        if let Err(e) = call.lock().await.deafen(true).await {
            debug!("No se pudo ensordecer al bot: {:?}", e);
        }

        Ok(Arc::new(SongbirdTransport {
            guild_id,
            call,
            manager: Arc::clone(&self.manager),
            cache: Arc::clone(&self.cache),
            current: Mutex::new(None),
            flags: Arc::new(PlaybackFlags::default()),
        }))
    }
}

/// Entradas de Songbird: archivo local o petición HTTP con cabeceras
pub struct SongbirdTranscoder {
    http: reqwest::Client,
}

impl SongbirdTranscoder {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }
}

#[async_trait]
impl AudioTranscoder for SongbirdTranscoder {
    async fn open(&self, location: AudioLocation) -> PlayerResult<AudioSource> {
        let input = match &location {
            AudioLocation::Local(path) => {
                let meta = tokio::fs::metadata(path)
                    .await
                    .map_err(|e| PlayerError::Transcode(format!("{}: {}", path.display(), e)))?;
                if meta.len() <= MIN_VALID_AUDIO_BYTES {
                    return Err(PlayerError::Transcode(format!(
                        "{} está truncado ({} bytes)",
                        path.display(),
                        meta.len()
                    )));
                }
                File::new(path.clone()).into()
            }
            AudioLocation::Remote { url, headers } => {
                let headers = header_map(headers)?;
                HttpRequest::new_with_headers(self.http.clone(), url.clone(), headers).into()
            }
        };
        Ok(AudioSource::new(location, input))
    }
}

fn header_map(headers: &std::collections::HashMap<String, String>) -> PlayerResult<HeaderMap> {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| PlayerError::Transcode(format!("cabecera inválida '{}': {}", name, e)))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| PlayerError::Transcode(format!("valor inválido para '{}': {}", name, e)))?;
        map.insert(name, value);
    }
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn yt_dlp_headers_become_a_header_map() {
        let headers = HashMap::from([
            ("User-Agent".to_string(), "Mozilla/5.0".to_string()),
            ("Accept-Language".to_string(), "en-us,en;q=0.5".to_string()),
        ]);
        let map = header_map(&headers).unwrap();
        assert_eq!(map.get("user-agent").unwrap(), "Mozilla/5.0");
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn malformed_headers_fail_while_loading() {
        let headers = HashMap::from([("Bad Header".to_string(), "x".to_string())]);
        assert!(matches!(header_map(&headers), Err(PlayerError::Transcode(_))));
    }

    #[tokio::test]
    async fn truncated_local_files_are_rejected() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("tiny.webm");
        std::fs::write(&path, [0u8; 10]).unwrap();

        let transcoder = SongbirdTranscoder::new(reqwest::Client::new());
        let result = transcoder.open(AudioLocation::Local(path)).await;
        assert!(matches!(result, Err(PlayerError::Transcode(_))));
    }
}
