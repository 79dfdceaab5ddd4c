//! Costuras con el mundo exterior: conexión de voz, pipeline de audio y
//! notificaciones. El reproductor solo conoce estos traits; la
//! implementación real con Songbird vive en [`super::voice`].

use async_trait::async_trait;
use serenity::model::id::{ChannelId, GuildId};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

use super::track::Track;
use crate::error::PlayerResult;

/// Eventos que alimentan el bucle del reproductor
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlayerEvent {
    /// La pista de la generación indicada terminó
    TrackFinished { generation: u64 },
    /// El stream de la pista no abrió o se cortó; pasa por la política de reintentos
    TrackFailed { generation: u64, reason: String },
    /// Reintento programado tras un fallo de carga
    AdvanceRequested,
}

pub type EventSender = mpsc::UnboundedSender<(GuildId, PlayerEvent)>;
pub type EventReceiver = mpsc::UnboundedReceiver<(GuildId, PlayerEvent)>;

/// Aviso de fin de pista. Se entrega a la conexión de voz junto con el audio
/// y dispara exactamente un evento (`TrackFinished` o `TrackFailed`), aunque
/// se llame varias veces: gana el primero.
#[derive(Debug, Clone)]
pub struct CompletionSink {
    guild_id: GuildId,
    generation: u64,
    tx: EventSender,
    fired: Arc<AtomicBool>,
}

impl CompletionSink {
    pub fn new(guild_id: GuildId, generation: u64, tx: EventSender) -> Self {
        Self {
            guild_id,
            generation,
            tx,
            fired: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn finished(&self) {
        self.fire(PlayerEvent::TrackFinished {
            generation: self.generation,
        });
    }

    pub fn failed(&self, reason: impl Into<String>) {
        self.fire(PlayerEvent::TrackFailed {
            generation: self.generation,
            reason: reason.into(),
        });
    }

    fn fire(&self, event: PlayerEvent) {
        if self.fired.swap(true, Ordering::AcqRel) {
            return;
        }
        // Si el bucle ya cerró no hay nadie a quien avisar
        let _ = self.tx.send((self.guild_id, event));
    }
}

/// De dónde sale el audio de una pista
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AudioLocation {
    Local(PathBuf),
    Remote {
        url: String,
        headers: HashMap<String, String>,
    },
}

/// Audio listo para entregar a la conexión de voz
pub struct AudioSource {
    location: AudioLocation,
    input: songbird::input::Input,
}

impl AudioSource {
    pub fn new(location: AudioLocation, input: songbird::input::Input) -> Self {
        Self { location, input }
    }

    pub fn location(&self) -> &AudioLocation {
        &self.location
    }

    pub fn into_input(self) -> songbird::input::Input {
        self.input
    }
}

/// Conexión de voz de una guild
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait VoiceTransport: Send + Sync {
    /// Reemplaza lo que suene por `source`. Al terminar la pista se llama a
    /// `sink.finished()`; si el stream falla, a `sink.failed(..)`.
    async fn play(&self, source: AudioSource, sink: CompletionSink) -> PlayerResult<()>;
    async fn stop(&self);
    async fn pause(&self) -> PlayerResult<()>;
    async fn resume(&self) -> PlayerResult<()>;
    fn is_playing(&self) -> bool;
    fn is_paused(&self) -> bool;
    /// Miembros en el canal de voz del bot, incluido el bot. `None` si no se sabe.
    fn member_count(&self) -> Option<usize>;
    async fn disconnect(&self);
}

#[async_trait]
pub trait VoiceConnector: Send + Sync {
    async fn connect(
        &self,
        guild_id: GuildId,
        channel_id: ChannelId,
    ) -> PlayerResult<Arc<dyn VoiceTransport>>;
}

/// Abre un pipeline de audio (demux + decode) para un archivo o una URL
#[async_trait]
pub trait AudioTranscoder: Send + Sync {
    async fn open(&self, location: AudioLocation) -> PlayerResult<AudioSource>;
}

/// Mensajes hacia el canal de texto de la guild
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn now_playing(&self, guild_id: GuildId, target: Option<ChannelId>, track: &Track);
    async fn track_skipped(
        &self,
        guild_id: GuildId,
        target: Option<ChannelId>,
        track: &Track,
        reason: &str,
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completion_fires_once() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink = CompletionSink::new(GuildId::new(7), 3, tx);
        let clone = sink.clone();

        sink.finished();
        clone.finished();

        assert_eq!(
            rx.try_recv().unwrap(),
            (GuildId::new(7), PlayerEvent::TrackFinished { generation: 3 })
        );
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn a_failure_reported_first_wins_over_the_end() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink = CompletionSink::new(GuildId::new(7), 5, tx);

        sink.failed("HTTP 403");
        sink.finished();

        assert_eq!(
            rx.try_recv().unwrap(),
            (
                GuildId::new(7),
                PlayerEvent::TrackFailed {
                    generation: 5,
                    reason: "HTTP 403".to_string()
                }
            )
        );
        assert!(rx.try_recv().is_err());
    }
}
