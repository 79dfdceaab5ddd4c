use serde::Serialize;
use serenity::model::id::{ChannelId, GuildId};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::autoplay::{AutoplayEngine, AutoplayOutcome, AutoplaySettings};
use super::state::{GuildRegistry, GuildSession, PendingRetry, SessionDefaults};
use super::track::Track;
use super::transport::{
    AudioLocation, AudioSource, AudioTranscoder, CompletionSink, EventReceiver, EventSender,
    Notifier, PlayerEvent, VoiceConnector,
};
use crate::cache::CacheManager;
use crate::error::{PlayerError, PlayerResult};
use crate::sources::{ItemRange, RecommendationFeed, TrackResolver};

/// Parámetros del reproductor, derivados de [`crate::config::Config`]
#[derive(Debug, Clone)]
pub struct PlayerConfig {
    pub session: SessionDefaults,
    pub autoplay: AutoplaySettings,
    pub retry_backoff: Duration,
    pub max_load_attempts: u32,
    pub idle_timeout: Duration,
    /// Cuántas pistas de una playlist se descargan al encolarla
    pub playlist_prefetch: usize,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            session: SessionDefaults::default(),
            autoplay: AutoplaySettings::default(),
            retry_backoff: Duration::from_secs(2),
            max_load_attempts: 3,
            idle_timeout: Duration::from_secs(300),
            playlist_prefetch: 3,
        }
    }
}

/// Colaboradores externos del reproductor
pub struct PlayerDeps {
    pub resolver: Arc<dyn TrackResolver>,
    pub feed: Arc<dyn RecommendationFeed>,
    pub transcoder: Arc<dyn AudioTranscoder>,
    pub cache: Arc<CacheManager>,
    pub notifier: Arc<dyn Notifier>,
}

/// Qué pasó en un intento de avance
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdvanceOutcome {
    Started(Track),
    QueueEmpty,
    /// Otro avance ya estaba en curso
    Busy,
    Stopped,
    NotConnected,
    RetryScheduled { attempts: u32 },
    Skipped(Track),
}

/// Resultado de [`AudioPlayer::stop`]
#[derive(Debug)]
pub enum StopOutcome {
    /// No había sesión, u otro stop ya estaba en curso
    NotRunning,
    /// Sesión cerrada. Lleva la descarga final de sus pistas, si hizo falta.
    Stopped(Option<JoinHandle<()>>),
}

impl StopOutcome {
    pub fn stopped(&self) -> bool {
        matches!(self, Self::Stopped(_))
    }

    pub fn into_final_downloads(self) -> Option<JoinHandle<()>> {
        match self {
            Self::Stopped(downloads) => downloads,
            Self::NotRunning => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlAction {
    Pause,
    Resume,
    TogglePause,
    Skip,
    /// `None` alterna
    Autoplay(Option<bool>),
    Regenerate,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlOutcome {
    Paused,
    Resumed,
    Skipped,
    Autoplay(bool),
    Regenerated(Option<Track>),
}

#[derive(Debug, Clone)]
pub struct EnqueueReport {
    pub added: Vec<Track>,
    pub started: Option<Track>,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueEntry {
    #[serde(flatten)]
    pub track: Track,
    pub suggested: bool,
}

/// Foto del estado de una guild, serializable para una API web
#[derive(Debug, Clone, Serialize)]
pub struct PlayerStatus {
    pub label: String,
    pub connected: bool,
    pub playing: bool,
    pub paused: bool,
    pub autoplay: bool,
    pub current: Option<Track>,
    pub queue: Vec<QueueEntry>,
}

/// Orquestador de reproducción por guild.
///
/// Cada guild avanza por `Idle → Loading → Playing → Loading…`; el fin de una
/// pista llega como [`PlayerEvent`] por un canal que consume
/// [`AudioPlayer::spawn_event_loop`].
pub struct AudioPlayer {
    registry: GuildRegistry,
    resolver: Arc<dyn TrackResolver>,
    transcoder: Arc<dyn AudioTranscoder>,
    cache: Arc<CacheManager>,
    autoplay: AutoplayEngine,
    notifier: Arc<dyn Notifier>,
    events: EventSender,
    config: PlayerConfig,
}

impl AudioPlayer {
    pub fn new(deps: PlayerDeps, config: PlayerConfig) -> (Arc<Self>, EventReceiver) {
        let (events, rx) = mpsc::unbounded_channel();
        let player = Arc::new(Self {
            registry: GuildRegistry::new(config.session.clone()),
            resolver: deps.resolver,
            transcoder: deps.transcoder,
            cache: deps.cache,
            autoplay: AutoplayEngine::new(deps.feed, config.autoplay.clone()),
            notifier: deps.notifier,
            events,
            config,
        });
        (player, rx)
    }

    pub fn spawn_event_loop(self: &Arc<Self>, mut rx: EventReceiver) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            while let Some((guild_id, event)) = rx.recv().await {
                this.handle_event(guild_id, event);
            }
            debug!("Bucle de eventos del reproductor terminado");
        })
    }

    /// Aplica un evento. Devuelve el avance lanzado, si lo hubo.
    pub fn handle_event(
        self: &Arc<Self>,
        guild_id: GuildId,
        event: PlayerEvent,
    ) -> Option<JoinHandle<AdvanceOutcome>> {
        let Some(session) = self.registry.get(guild_id) else {
            debug!("Evento {:?} para guild {} sin sesión", event, guild_id);
            return None;
        };

        let stale = |generation: u64| {
            let current = session.read(|s| s.play_generation);
            if current != generation {
                debug!(
                    "Evento obsoleto en guild {} (gen {} ≠ {})",
                    guild_id, generation, current
                );
            }
            current != generation
        };

        let this = Arc::clone(self);
        match event {
            PlayerEvent::TrackFinished { generation } => {
                if stale(generation) {
                    return None;
                }
                Some(tokio::spawn(async move { this.advance(&session).await }))
            }
            PlayerEvent::TrackFailed { generation, reason } => {
                if stale(generation) {
                    return None;
                }
                Some(tokio::spawn(async move { this.retry_current(&session, reason).await }))
            }
            PlayerEvent::AdvanceRequested => {
                let busy = session
                    .transport()
                    .is_some_and(|t| t.is_playing() || t.is_paused());
                if busy {
                    debug!("Reintento descartado: guild {} ya está reproduciendo", guild_id);
                    return None;
                }
                Some(tokio::spawn(async move { this.advance(&session).await }))
            }
        }
    }

    pub fn registry(&self) -> &GuildRegistry {
        &self.registry
    }

    pub fn cache(&self) -> &Arc<CacheManager> {
        &self.cache
    }

    pub async fn search(&self, query: &str, range: ItemRange) -> PlayerResult<Vec<Track>> {
        self.resolver.search(query, range).await
    }

    /// Conecta la guild al canal de voz si todavía no lo está
    pub async fn connect(
        &self,
        guild_id: GuildId,
        channel_id: ChannelId,
        connector: &dyn VoiceConnector,
    ) -> PlayerResult<()> {
        let session = self.registry.get_or_create(guild_id);
        if session.is_stopping() {
            return Err(PlayerError::Connect(
                "la sesión anterior se está cerrando, intenta de nuevo".to_string(),
            ));
        }
        if session.transport().is_some() {
            return Ok(());
        }

        match connector.connect(guild_id, channel_id).await {
            Ok(transport) => {
                session.attach_transport(transport);
                session.with_state(|s| s.touch());
                info!("🔊 Conectado a {} en guild {}", channel_id, guild_id);
                Ok(())
            }
            Err(e) => {
                if session.read(|s| s.queue.is_empty() && s.queue.current().is_none()) {
                    self.registry.remove_if_same(&session);
                }
                Err(e)
            }
        }
    }

    pub fn is_connected(&self, guild_id: GuildId) -> bool {
        self.registry
            .get(guild_id)
            .is_some_and(|s| s.transport().is_some() && !s.is_stopping())
    }

    /// Agrega pistas de usuario y, si no suena nada, arranca la reproducción
    pub async fn enqueue(
        self: &Arc<Self>,
        guild_id: GuildId,
        tracks: Vec<Track>,
        notification_target: Option<ChannelId>,
    ) -> PlayerResult<EnqueueReport> {
        let session = self.registry.get_or_create(guild_id);
        let added = session.with_state(|s| {
            if s.stopping {
                return Err(PlayerError::NotConnected);
            }
            let added = s.queue.push_user_tracks(tracks)?;
            if notification_target.is_some() {
                s.notification_target = notification_target;
            }
            s.touch();
            Ok(added)
        })?;

        let prefetch: Vec<Track> = added
            .iter()
            .take(self.config.playlist_prefetch.max(1))
            .cloned()
            .collect();
        self.cache.prefetch_many(prefetch);
        self.spawn_autoplay(&session, Vec::new(), true);

        let started = match session.transport() {
            Some(t) if !t.is_playing() && !t.is_paused() => match self.advance(&session).await {
                AdvanceOutcome::Started(track) => Some(track),
                _ => None,
            },
            _ => None,
        };

        Ok(EnqueueReport { added, started })
    }

    /// Un paso de la máquina de estados: carga la siguiente pista y la
    /// entrega a la conexión de voz.
    pub async fn advance(self: &Arc<Self>, session: &Arc<GuildSession>) -> AdvanceOutcome {
        let guild_id = session.guild_id;
        if session.is_stopping() {
            return AdvanceOutcome::Stopped;
        }
        let Some(transport) = session.transport() else {
            return AdvanceOutcome::NotConnected;
        };
        let Some(ticket) = session.advance.try_begin(false) else {
            debug!("Avance ya en curso para guild {}", guild_id);
            return AdvanceOutcome::Busy;
        };

        let next = session.with_state(|s| {
            if let Some(retry) = s.pending_retry.take() {
                s.queue.set_current(Some(retry.track.clone()));
                return Some((retry.track, retry.attempts));
            }
            s.queue.pop_next().map(|track| (track, 0))
        });
        let Some((track, attempts)) = next else {
            session.with_state(|s| s.queue.set_current(None));
            debug!("Cola vacía para guild {}", guild_id);
            return AdvanceOutcome::QueueEmpty;
        };

        info!("🎵 Cargando: {}", track.title);
        let source = match self.load(&track).await {
            Ok(source) => source,
            Err(e) => {
                drop(ticket);
                return self.schedule_retry(session, track, attempts + 1, e).await;
            }
        };

        let generation = session.with_state(|s| {
            if s.stopping {
                return None;
            }
            s.play_generation += 1;
            s.load_failures = attempts;
            s.touch();
            Some(s.play_generation)
        });
        let Some(generation) = generation else {
            return AdvanceOutcome::Stopped;
        };
        let sink = CompletionSink::new(guild_id, generation, self.events.clone());
        if let Err(e) = transport.play(source, sink).await {
            drop(ticket);
            return self.schedule_retry(session, track, attempts + 1, e).await;
        }
        drop(ticket);

        // Un stop pudo colarse mientras se entregaba el audio
        if session.is_stopping() {
            transport.stop().await;
            return AdvanceOutcome::Stopped;
        }

        let (head, target) = session.read(|s| (s.queue.front().cloned(), s.notification_target));
        if let Some(head) = head {
            self.cache.prefetch(head);
        }
        self.spawn_autoplay(session, Vec::new(), false);
        self.notifier.now_playing(guild_id, target, &track).await;

        info!("▶️ Reproduciendo: {}", track.title);
        AdvanceOutcome::Started(track)
    }

    /// Archivo local si está en caché; si no, stream remoto y descarga en
    /// segundo plano.
    async fn load(&self, track: &Track) -> PlayerResult<AudioSource> {
        if let Some(path) = self.cache.lookup(&track.id).await {
            self.cache.touch(&path).await;
            debug!("💾 Desde caché: {}", path.display());
            match self.transcoder.open(AudioLocation::Local(path)).await {
                Ok(source) => return Ok(source),
                Err(e) => warn!("⚠️ Archivo en caché inservible para {}: {}", track.id, e),
            }
        }

        self.cache.prefetch(track.clone());
        let stream = self.resolver.resolve_stream(&track.id).await?;
        self.transcoder
            .open(AudioLocation::Remote {
                url: stream.stream_url,
                headers: stream.http_headers,
            })
            .await
    }

    /// La pista actual falló después de arrancar: se reintenta como un fallo
    /// de carga más.
    async fn retry_current(self: &Arc<Self>, session: &Arc<GuildSession>, reason: String) -> AdvanceOutcome {
        let failed = session.read(|s| s.queue.current().cloned().map(|t| (t, s.load_failures)));
        let Some((track, failures)) = failed else {
            return AdvanceOutcome::QueueEmpty;
        };
        self.schedule_retry(session, track, failures + 1, PlayerError::Transcode(reason))
            .await
    }

    async fn schedule_retry(
        self: &Arc<Self>,
        session: &Arc<GuildSession>,
        track: Track,
        attempts: u32,
        err: PlayerError,
    ) -> AdvanceOutcome {
        let guild_id = session.guild_id;
        if session.is_stopping() {
            return AdvanceOutcome::Stopped;
        }
        if matches!(err, PlayerError::NotConnected) {
            session.with_state(|s| s.pending_retry = Some(PendingRetry { track, attempts: attempts - 1 }));
            return AdvanceOutcome::NotConnected;
        }

        warn!(
            "⚠️ Error cargando '{}' (intento {}/{}): {}",
            track.title, attempts, self.config.max_load_attempts, err
        );

        let exhausted = attempts >= self.config.max_load_attempts;
        if exhausted || !err.is_recoverable() {
            if exhausted {
                error!("❌ '{}' descartada tras {} intentos", track.title, attempts);
            } else {
                error!("❌ '{}' descartada, error no recuperable: {}", track.title, err);
            }
            let target = session.with_state(|s| {
                s.pending_retry = None;
                s.notification_target
            });
            self.notifier
                .track_skipped(guild_id, target, &track, &err.to_string())
                .await;
            let _ = self.events.send((guild_id, PlayerEvent::AdvanceRequested));
            return AdvanceOutcome::Skipped(track);
        }

        session.with_state(|s| s.pending_retry = Some(PendingRetry { track, attempts }));
        let events = self.events.clone();
        let backoff = self.config.retry_backoff;
        tokio::spawn(async move {
            tokio::time::sleep(backoff).await;
            let _ = events.send((guild_id, PlayerEvent::AdvanceRequested));
        });
        AdvanceOutcome::RetryScheduled { attempts }
    }

    fn spawn_autoplay(self: &Arc<Self>, session: &Arc<GuildSession>, avoid: Vec<String>, forced: bool) {
        let this = Arc::clone(self);
        let session = Arc::clone(session);
        tokio::spawn(async move {
            let outcome = this.autoplay.ensure(&session, &avoid, forced).await;
            // Si la cola se había agotado, la sugerencia nueva arranca sola
            if matches!(outcome, AutoplayOutcome::Appended(_)) && this.is_idle(&session) {
                this.advance(&session).await;
            }
        });
    }

    fn is_idle(&self, session: &GuildSession) -> bool {
        let transport_idle = session
            .transport()
            .is_some_and(|t| !t.is_playing() && !t.is_paused());
        transport_idle && session.read(|s| s.queue.current().is_none() && s.pending_retry.is_none())
    }

    fn session(&self, guild_id: GuildId) -> PlayerResult<Arc<GuildSession>> {
        self.registry
            .get(guild_id)
            .filter(|s| !s.is_stopping())
            .ok_or(PlayerError::NotConnected)
    }

    pub fn remove_at(&self, guild_id: GuildId, index: usize) -> PlayerResult<Track> {
        let session = self.session(guild_id)?;
        session.with_state(|s| {
            s.touch();
            let autoplay = s.autoplay_enabled;
            s.queue.remove_at(index, autoplay)
        })
    }

    pub fn shuffle(&self, guild_id: GuildId) -> PlayerResult<()> {
        let session = self.session(guild_id)?;
        session.with_state(|s| {
            s.touch();
            s.queue.shuffle_user_tracks();
        });
        Ok(())
    }

    pub fn clear_user_tracks(&self, guild_id: GuildId) -> PlayerResult<usize> {
        let session = self.session(guild_id)?;
        Ok(session.with_state(|s| {
            s.touch();
            s.queue.clear_user_tracks()
        }))
    }

    pub async fn control(
        self: &Arc<Self>,
        guild_id: GuildId,
        action: ControlAction,
    ) -> PlayerResult<ControlOutcome> {
        let session = self.session(guild_id)?;
        session.with_state(|s| s.touch());

        match action {
            ControlAction::Pause => {
                let transport = session.transport().ok_or(PlayerError::NotConnected)?;
                transport.pause().await?;
                info!("⏸️ Reproducción pausada");
                Ok(ControlOutcome::Paused)
            }
            ControlAction::Resume => {
                let transport = session.transport().ok_or(PlayerError::NotConnected)?;
                transport.resume().await?;
                info!("▶️ Reproducción reanudada");
                Ok(ControlOutcome::Resumed)
            }
            ControlAction::TogglePause => {
                let transport = session.transport().ok_or(PlayerError::NotConnected)?;
                if transport.is_paused() {
                    transport.resume().await?;
                    Ok(ControlOutcome::Resumed)
                } else {
                    transport.pause().await?;
                    Ok(ControlOutcome::Paused)
                }
            }
            ControlAction::Skip => {
                let transport = session.transport().ok_or(PlayerError::NotConnected)?;
                session.with_state(|s| s.pending_retry = None);
                if transport.is_playing() || transport.is_paused() {
                    // El fin de pista dispara el avance
                    transport.stop().await;
                } else {
                    self.advance(&session).await;
                }
                info!("⏭️ Canción saltada");
                Ok(ControlOutcome::Skipped)
            }
            ControlAction::Autoplay(enabled) => {
                let enabled = session.with_state(|s| {
                    s.autoplay_enabled = enabled.unwrap_or(!s.autoplay_enabled);
                    if !s.autoplay_enabled {
                        s.queue.strip_suggestions();
                    }
                    s.autoplay_enabled
                });
                info!("🎲 Autoplay {} en guild {}", if enabled { "activado" } else { "desactivado" }, guild_id);

                if enabled {
                    self.autoplay.ensure(&session, &[], true).await;
                    let has_queue = session.read(|s| !s.queue.is_empty());
                    let idle = session
                        .transport()
                        .is_some_and(|t| !t.is_playing() && !t.is_paused());
                    if has_queue && idle {
                        self.advance(&session).await;
                    }
                }
                Ok(ControlOutcome::Autoplay(enabled))
            }
            ControlAction::Regenerate => match self.autoplay.regenerate(&session).await? {
                AutoplayOutcome::Appended(track) => Ok(ControlOutcome::Regenerated(Some(track))),
                _ => Ok(ControlOutcome::Regenerated(None)),
            },
        }
    }

    /// Estado actual; no crea sesión si no existe
    pub fn status(&self, guild_id: GuildId, label: impl Into<String>) -> PlayerStatus {
        let label = label.into();
        let Some(session) = self.registry.get(guild_id) else {
            return PlayerStatus {
                label,
                connected: false,
                playing: false,
                paused: false,
                autoplay: self.config.session.autoplay_enabled,
                current: None,
                queue: Vec::new(),
            };
        };

        let transport = session.transport();
        session.read(|s| PlayerStatus {
            label,
            connected: transport.is_some() && !s.stopping,
            playing: transport.as_ref().is_some_and(|t| t.is_playing()),
            paused: transport.as_ref().is_some_and(|t| t.is_paused()),
            autoplay: s.autoplay_enabled,
            current: s.queue.current().cloned(),
            queue: s
                .queue
                .items()
                .iter()
                .map(|t| QueueEntry {
                    suggested: t.suggested,
                    track: t.clone(),
                })
                .collect(),
        })
    }

    pub fn history(&self, guild_id: GuildId) -> Vec<Track> {
        self.registry
            .get(guild_id)
            .map(|s| s.read(|s| s.queue.history().iter().rev().cloned().collect()))
            .unwrap_or_default()
    }

    /// Actual + cola de usuario, para guardar como playlist
    pub fn snapshot(&self, guild_id: GuildId) -> Vec<Track> {
        self.registry
            .get(guild_id)
            .map(|s| s.read(|s| s.queue.snapshot()))
            .unwrap_or_default()
    }

    /// Detiene y desconecta la guild. La descarga final de las pistas de la
    /// sesión queda en segundo plano; su handle va en el resultado.
    pub async fn stop(&self, guild_id: GuildId) -> StopOutcome {
        let Some(session) = self.registry.get(guild_id) else {
            return StopOutcome::NotRunning;
        };
        let already_stopping = session.with_state(|s| std::mem::replace(&mut s.stopping, true));
        if already_stopping {
            return StopOutcome::NotRunning;
        }

        info!("⏹️ Deteniendo guild {}", guild_id);
        if let Some(transport) = session.take_transport() {
            transport.stop().await;
            transport.disconnect().await;
        }

        let session_tracks = session.read(|s| s.queue.session_tracks());
        let downloads = if session_tracks.is_empty() {
            None
        } else {
            debug!("📥 Descarga final de {} pistas de la sesión", session_tracks.len());
            Some(self.cache.prefetch_many(session_tracks))
        };

        self.registry.remove_if_same(&session);
        StopOutcome::Stopped(downloads)
    }

    pub async fn sweep_idle(&self) -> Vec<GuildId> {
        self.sweep_idle_at(Instant::now()).await
    }

    /// Detiene guilds solas en el canal o inactivas más de `idle_timeout`
    pub async fn sweep_idle_at(&self, now: Instant) -> Vec<GuildId> {
        let mut stopped = Vec::new();

        for guild_id in self.registry.guild_ids() {
            let Some(session) = self.registry.get(guild_id) else {
                continue;
            };
            if session.is_stopping() {
                continue;
            }
            let Some(transport) = session.transport() else {
                debug!("🧹 Sesión sin conexión descartada: guild {}", guild_id);
                self.registry.remove_if_same(&session);
                continue;
            };

            if transport.member_count() == Some(1) {
                info!("👋 Solo en el canal de voz, saliendo de guild {}", guild_id);
            } else if transport.is_playing() {
                session.with_state(|s| s.touch());
                continue;
            } else {
                let idle_for = now.saturating_duration_since(session.read(|s| s.last_interaction));
                if idle_for <= self.config.idle_timeout {
                    continue;
                }
                info!("💤 Inactivo {}s, saliendo de guild {}", idle_for.as_secs(), guild_id);
            }

            if self.stop(guild_id).await.stopped() {
                stopped.push(guild_id);
            }
        }

        stopped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::autoplay::tests::EchoFeed;
    use crate::audio::transport::{MockVoiceTransport, VoiceTransport};
    use crate::cache::tests::{manager, FakeDownloader};
    use crate::sources::ResolvedStream;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;
    use std::collections::{HashMap, HashSet};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::SystemTime;
    use tempfile::TempDir;

    #[derive(Default)]
    struct FakeTransport {
        playing: AtomicBool,
        paused: AtomicBool,
        members: Option<usize>,
        /// `play` falla con un error no recuperable
        reject_plays: bool,
        played: Mutex<Vec<AudioLocation>>,
        sink: Mutex<Option<CompletionSink>>,
        disconnects: AtomicUsize,
    }

    impl FakeTransport {
        fn with_members(members: usize) -> Self {
            Self {
                members: Some(members),
                ..Self::default()
            }
        }

        /// La pista actual llega a su fin
        fn finish_current(&self) {
            self.playing.store(false, Ordering::SeqCst);
            if let Some(sink) = self.sink.lock().take() {
                sink.finished();
            }
        }

        /// El stream de la pista actual se cae
        fn fail_current(&self, reason: &str) {
            self.playing.store(false, Ordering::SeqCst);
            if let Some(sink) = self.sink.lock().take() {
                sink.failed(reason);
            }
        }
    }

    #[async_trait]
    impl VoiceTransport for FakeTransport {
        async fn play(&self, source: AudioSource, sink: CompletionSink) -> PlayerResult<()> {
            if self.reject_plays {
                return Err(PlayerError::invalid("canal sin permisos"));
            }
            self.played.lock().push(source.location().clone());
            *self.sink.lock() = Some(sink);
            self.playing.store(true, Ordering::SeqCst);
            self.paused.store(false, Ordering::SeqCst);
            Ok(())
        }
        async fn stop(&self) {
            self.paused.store(false, Ordering::SeqCst);
            self.finish_current();
        }
        async fn pause(&self) -> PlayerResult<()> {
            self.paused.store(true, Ordering::SeqCst);
            Ok(())
        }
        async fn resume(&self) -> PlayerResult<()> {
            self.paused.store(false, Ordering::SeqCst);
            Ok(())
        }
        fn is_playing(&self) -> bool {
            self.playing.load(Ordering::SeqCst)
        }
        fn is_paused(&self) -> bool {
            self.paused.load(Ordering::SeqCst)
        }
        fn member_count(&self) -> Option<usize> {
            self.members
        }
        async fn disconnect(&self) {
            self.disconnects.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct FakeResolver {
        broken: HashSet<String>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl TrackResolver for FakeResolver {
        async fn search(&self, query: &str, _range: ItemRange) -> PlayerResult<Vec<Track>> {
            Ok(vec![Track::new(query, query)])
        }

        async fn resolve_stream(&self, track_id: &str) -> PlayerResult<ResolvedStream> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.broken.contains(track_id) {
                return Err(PlayerError::Resolution(format!("{track_id} no disponible")));
            }
            Ok(ResolvedStream {
                track: Track::new(track_id, track_id),
                stream_url: format!("https://stream.test/{track_id}"),
                http_headers: HashMap::new(),
            })
        }
    }

    #[derive(Default)]
    struct FakeTranscoder {
        /// Sesión que se marca como detenida al abrir el siguiente audio
        stop_on_open: Mutex<Option<Arc<GuildSession>>>,
    }

    #[async_trait]
    impl AudioTranscoder for FakeTranscoder {
        async fn open(&self, location: AudioLocation) -> PlayerResult<AudioSource> {
            if let Some(session) = self.stop_on_open.lock().take() {
                session.with_state(|s| s.stopping = true);
            }
            let input = songbird::input::File::new("/dev/null").into();
            Ok(AudioSource::new(location, input))
        }
    }

    #[derive(Default)]
    struct RecordingNotifier {
        now_playing: Mutex<Vec<String>>,
        skipped: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn now_playing(&self, _guild_id: GuildId, _target: Option<ChannelId>, track: &Track) {
            self.now_playing.lock().push(track.id.clone());
        }
        async fn track_skipped(
            &self,
            _guild_id: GuildId,
            _target: Option<ChannelId>,
            track: &Track,
            _reason: &str,
        ) {
            self.skipped.lock().push(track.id.clone());
        }
    }

    struct Harness {
        _dir: TempDir,
        player: Arc<AudioPlayer>,
        events: EventReceiver,
        resolver: Arc<FakeResolver>,
        transcoder: Arc<FakeTranscoder>,
        notifier: Arc<RecordingNotifier>,
    }

    fn guild() -> GuildId {
        GuildId::new(42)
    }

    async fn harness(resolver: FakeResolver, config: PlayerConfig) -> Harness {
        harness_with(resolver, config, Arc::new(FakeDownloader::failing())).await
    }

    async fn harness_with(
        resolver: FakeResolver,
        config: PlayerConfig,
        downloader: Arc<FakeDownloader>,
    ) -> Harness {
        let dir = TempDir::new().unwrap();
        let cache = manager(&dir, downloader).await;
        let resolver = Arc::new(resolver);
        let transcoder = Arc::new(FakeTranscoder::default());
        let notifier = Arc::new(RecordingNotifier::default());
        let (player, events) = AudioPlayer::new(
            PlayerDeps {
                resolver: resolver.clone(),
                feed: Arc::new(EchoFeed::default()),
                transcoder: transcoder.clone(),
                cache,
                notifier: notifier.clone(),
            },
            config,
        );
        Harness {
            _dir: dir,
            player,
            events,
            resolver,
            transcoder,
            notifier,
        }
    }

    fn attach(player: &AudioPlayer, guild_id: GuildId, transport: Arc<dyn VoiceTransport>) {
        player.registry().get_or_create(guild_id).attach_transport(transport);
    }

    fn tracks(ids: &[&str]) -> Vec<Track> {
        ids.iter().map(|id| Track::new(*id, format!("Song {id}"))).collect()
    }

    #[tokio::test]
    async fn enqueue_while_idle_starts_the_first_track() {
        let h = harness(FakeResolver::default(), PlayerConfig::default()).await;
        let transport = Arc::new(FakeTransport::default());
        attach(&h.player, guild(), transport.clone());

        let report = h.player.enqueue(guild(), tracks(&["A", "B"]), None).await.unwrap();

        assert_eq!(report.added.len(), 2);
        assert_eq!(report.started.map(|t| t.id), Some("A".to_string()));
        assert_eq!(
            *transport.played.lock(),
            vec![AudioLocation::Remote {
                url: "https://stream.test/A".into(),
                headers: HashMap::new()
            }]
        );
        let status = h.player.status(guild(), "test");
        assert_eq!(status.current.map(|t| t.id), Some("A".to_string()));
        assert_eq!(status.queue.len(), 1);
        assert_eq!(*h.notifier.now_playing.lock(), vec!["A"]);
    }

    #[tokio::test]
    async fn completion_advances_and_stale_events_are_dropped() {
        let mut h = harness(FakeResolver::default(), PlayerConfig::default()).await;
        let transport = Arc::new(FakeTransport::default());
        attach(&h.player, guild(), transport.clone());
        h.player.enqueue(guild(), tracks(&["A", "B"]), None).await.unwrap();

        assert!(h
            .player
            .handle_event(guild(), PlayerEvent::TrackFinished { generation: 0 })
            .is_none());

        transport.finish_current();
        let (guild, event) = h.events.recv().await.unwrap();
        assert_eq!(event, PlayerEvent::TrackFinished { generation: 1 });

        let outcome = h.player.handle_event(guild, event).unwrap().await.unwrap();
        assert_eq!(outcome, AdvanceOutcome::Started(Track::new("B", "Song B")));

        transport.finish_current();
        let (guild, event) = h.events.recv().await.unwrap();
        let outcome = h.player.handle_event(guild, event).unwrap().await.unwrap();
        assert_eq!(outcome, AdvanceOutcome::QueueEmpty);
        assert!(h.player.status(self::guild(), "test").current.is_none());
    }

    #[tokio::test]
    async fn broken_track_is_retried_then_skipped() {
        let resolver = FakeResolver {
            broken: HashSet::from(["bad".to_string()]),
            ..FakeResolver::default()
        };
        let config = PlayerConfig {
            retry_backoff: Duration::from_millis(1),
            ..PlayerConfig::default()
        };
        let mut h = harness(resolver, config).await;
        let transport = Arc::new(FakeTransport::default());
        attach(&h.player, guild(), transport.clone());

        let report = h.player.enqueue(guild(), tracks(&["bad", "good"]), None).await.unwrap();
        assert!(report.started.is_none());

        let mut outcomes = Vec::new();
        while !matches!(outcomes.last(), Some(AdvanceOutcome::Started(_))) {
            let (guild, event) = h.events.recv().await.unwrap();
            assert_eq!(event, PlayerEvent::AdvanceRequested);
            if let Some(handle) = h.player.handle_event(guild, event) {
                outcomes.push(handle.await.unwrap());
            }
        }

        assert_eq!(
            outcomes,
            vec![
                AdvanceOutcome::RetryScheduled { attempts: 2 },
                AdvanceOutcome::Skipped(Track::new("bad", "Song bad")),
                AdvanceOutcome::Started(Track::new("good", "Song good")),
            ]
        );
        assert_eq!(*h.notifier.skipped.lock(), vec!["bad"]);
        // 3 intentos de "bad" + 1 de "good"
        assert_eq!(h.resolver.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn stop_twice_disconnects_once() {
        let h = harness(FakeResolver::default(), PlayerConfig::default()).await;
        let mut mock = MockVoiceTransport::new();
        mock.expect_stop().times(1).return_const(());
        mock.expect_disconnect().times(1).return_const(());
        attach(&h.player, guild(), Arc::new(mock));

        let (first, second) = tokio::join!(h.player.stop(guild()), h.player.stop(guild()));
        assert!(first.stopped() ^ second.stopped());
        assert!(!h.player.stop(guild()).await.stopped());
        assert!(h.player.registry().get(guild()).is_none());
    }

    #[tokio::test]
    async fn stopped_guild_rejects_controls_and_starts_fresh_on_enqueue() {
        let h = harness(FakeResolver::default(), PlayerConfig::default()).await;
        attach(&h.player, guild(), Arc::new(FakeTransport::default()));
        h.player.enqueue(guild(), tracks(&["A", "B"]), None).await.unwrap();
        assert!(h.player.stop(guild()).await.stopped());

        assert!(matches!(
            h.player.control(guild(), ControlAction::Skip).await,
            Err(PlayerError::NotConnected)
        ));
        assert!(matches!(h.player.shuffle(guild()), Err(PlayerError::NotConnected)));

        let report = h.player.enqueue(guild(), tracks(&["C"]), None).await.unwrap();
        assert!(report.started.is_none());
        assert_eq!(h.player.status(guild(), "test").queue.len(), 1);
        assert!(h.player.history(guild()).is_empty());
    }

    #[tokio::test]
    async fn pinned_suggestion_survives_remove_and_clear() {
        let config = PlayerConfig {
            session: SessionDefaults {
                autoplay_enabled: true,
                ..SessionDefaults::default()
            },
            ..PlayerConfig::default()
        };
        let h = harness(FakeResolver::default(), config).await;
        let session = h.player.registry().get_or_create(guild());
        session.with_state(|s| {
            s.queue.push_user_tracks(tracks(&["U1", "U2"])).unwrap();
            s.queue.push_suggestion(Track::new("S", "Suggestion"));
        });

        assert!(matches!(
            h.player.remove_at(guild(), 2),
            Err(PlayerError::InvalidOperation(_))
        ));
        assert_eq!(h.player.clear_user_tracks(guild()).unwrap(), 2);

        let status = serde_json::to_value(h.player.status(guild(), "Guild")).unwrap();
        assert_eq!(status["queue"][0]["id"], "S");
        assert_eq!(status["queue"][0]["suggested"], true);
        assert_eq!(status["label"], "Guild");
    }

    #[tokio::test]
    async fn turning_autoplay_off_strips_the_suggestion() {
        let config = PlayerConfig {
            session: SessionDefaults {
                autoplay_enabled: true,
                ..SessionDefaults::default()
            },
            ..PlayerConfig::default()
        };
        let h = harness(FakeResolver::default(), config).await;
        let transport = Arc::new(FakeTransport::default());
        transport.playing.store(true, Ordering::SeqCst);
        attach(&h.player, guild(), transport);
        let session = h.player.registry().get(guild()).unwrap();
        session.with_state(|s| {
            s.queue.push_user_tracks(tracks(&["U1"])).unwrap();
            s.queue.push_suggestion(Track::new("S", "Suggestion"));
        });

        let outcome = h.player.control(guild(), ControlAction::Autoplay(None)).await.unwrap();
        assert_eq!(outcome, ControlOutcome::Autoplay(false));
        assert_eq!(session.read(|s| s.queue.suggestion_count()), 0);
        assert!(matches!(
            h.player.control(guild(), ControlAction::Regenerate).await,
            Err(PlayerError::InvalidOperation(_))
        ));
    }

    #[tokio::test]
    async fn idle_sweep_leaves_lonely_and_idle_guilds() {
        let h = harness(FakeResolver::default(), PlayerConfig::default()).await;
        let lonely = Arc::new(FakeTransport::with_members(1));
        let idle = Arc::new(FakeTransport::with_members(3));
        let busy = Arc::new(FakeTransport::with_members(3));
        busy.playing.store(true, Ordering::SeqCst);

        attach(&h.player, GuildId::new(1), lonely.clone());
        attach(&h.player, GuildId::new(2), idle.clone());
        attach(&h.player, GuildId::new(3), busy.clone());
        h.player.registry().get_or_create(GuildId::new(4));

        let later = Instant::now() + Duration::from_secs(301);
        let mut stopped = h.player.sweep_idle_at(later).await;
        stopped.sort();

        assert_eq!(stopped, vec![GuildId::new(1), GuildId::new(2)]);
        assert_eq!(lonely.disconnects.load(Ordering::SeqCst), 1);
        assert_eq!(busy.disconnects.load(Ordering::SeqCst), 0);
        assert!(h.player.registry().get(GuildId::new(3)).is_some());
        assert!(h.player.registry().get(GuildId::new(4)).is_none());
    }

    #[tokio::test]
    async fn a_stream_that_fails_after_starting_is_retried_then_skipped() {
        let config = PlayerConfig {
            retry_backoff: Duration::from_millis(1),
            ..PlayerConfig::default()
        };
        let mut h = harness(FakeResolver::default(), config).await;
        let transport = Arc::new(FakeTransport::default());
        attach(&h.player, guild(), transport.clone());
        h.player.enqueue(guild(), tracks(&["A", "B"]), None).await.unwrap();

        let mut outcomes = Vec::new();
        for _ in 0..3 {
            transport.fail_current("HTTP 403");
            let (guild, event) = h.events.recv().await.unwrap();
            assert!(matches!(event, PlayerEvent::TrackFailed { .. }));
            outcomes.push(h.player.handle_event(guild, event).unwrap().await.unwrap());

            let (guild, event) = h.events.recv().await.unwrap();
            assert_eq!(event, PlayerEvent::AdvanceRequested);
            outcomes.push(h.player.handle_event(guild, event).unwrap().await.unwrap());
        }

        let a = Track::new("A", "Song A");
        assert_eq!(
            outcomes,
            vec![
                AdvanceOutcome::RetryScheduled { attempts: 1 },
                AdvanceOutcome::Started(a.clone()),
                AdvanceOutcome::RetryScheduled { attempts: 2 },
                AdvanceOutcome::Started(a.clone()),
                AdvanceOutcome::Skipped(a),
                AdvanceOutcome::Started(Track::new("B", "Song B")),
            ]
        );
        assert_eq!(*h.notifier.skipped.lock(), vec!["A"]);
        assert_eq!(*h.notifier.now_playing.lock(), vec!["A", "A", "A", "B"]);
    }

    #[tokio::test]
    async fn unrecoverable_play_errors_skip_without_retrying() {
        let mut h = harness(FakeResolver::default(), PlayerConfig::default()).await;
        let transport = Arc::new(FakeTransport {
            reject_plays: true,
            ..FakeTransport::default()
        });
        attach(&h.player, guild(), transport.clone());

        let report = h.player.enqueue(guild(), tracks(&["A"]), None).await.unwrap();

        assert!(report.started.is_none());
        assert_eq!(*h.notifier.skipped.lock(), vec!["A"]);
        assert_eq!(h.resolver.calls.load(Ordering::SeqCst), 1);
        assert!(h.player.registry().get(guild()).unwrap().read(|s| s.pending_retry.is_none()));

        let (guild, event) = h.events.recv().await.unwrap();
        assert_eq!(event, PlayerEvent::AdvanceRequested);
        let outcome = h.player.handle_event(guild, event).unwrap().await.unwrap();
        assert_eq!(outcome, AdvanceOutcome::QueueEmpty);
    }

    #[tokio::test]
    async fn cached_tracks_play_from_disk_and_get_their_mtime_refreshed() {
        let mut h = harness(FakeResolver::default(), PlayerConfig::default()).await;
        let dir = h.player.cache().dir().to_path_buf();
        let cached = dir.join("A.webm");
        std::fs::write(&cached, vec![0u8; 4096]).unwrap();
        let old = SystemTime::now() - Duration::from_secs(3600);
        std::fs::File::options()
            .append(true)
            .open(&cached)
            .unwrap()
            .set_modified(old)
            .unwrap();
        // 1 KiB o menos: se trata como corrupto
        std::fs::write(dir.join("B.webm"), [0u8; 100]).unwrap();

        let transport = Arc::new(FakeTransport::default());
        attach(&h.player, guild(), transport.clone());
        h.player.enqueue(guild(), tracks(&["A", "B"]), None).await.unwrap();

        assert_eq!(*transport.played.lock(), vec![AudioLocation::Local(cached.clone())]);
        assert_eq!(h.resolver.calls.load(Ordering::SeqCst), 0);
        let touched = std::fs::metadata(&cached).unwrap().modified().unwrap();
        assert!(touched > old + Duration::from_secs(60));

        transport.finish_current();
        let (guild, event) = h.events.recv().await.unwrap();
        h.player.handle_event(guild, event).unwrap().await.unwrap();

        assert_eq!(
            transport.played.lock().last().cloned(),
            Some(AudioLocation::Remote {
                url: "https://stream.test/B".into(),
                headers: HashMap::new()
            })
        );
        assert_eq!(h.resolver.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn stop_downloads_history_and_current_in_the_background() {
        let downloader = Arc::new(FakeDownloader::default());
        let h = harness_with(FakeResolver::default(), PlayerConfig::default(), downloader.clone()).await;
        attach(&h.player, guild(), Arc::new(FakeTransport::default()));
        let session = h.player.registry().get(guild()).unwrap();
        session.with_state(|s| {
            s.queue.push_user_tracks(tracks(&["A", "B", "C"])).unwrap();
            s.queue.pop_next();
            s.queue.pop_next();
        });

        let downloads = h.player.stop(guild()).await.into_final_downloads().unwrap();
        downloads.await.unwrap();

        assert_eq!(*downloader.ids.lock(), vec!["A", "B"]);
        assert!(h.player.cache().lookup("A").await.is_some());
        assert!(h.player.cache().lookup("B").await.is_some());
        assert!(h.player.cache().lookup("C").await.is_none());
    }

    #[tokio::test]
    async fn a_stop_during_loading_never_reaches_the_transport() {
        let h = harness(FakeResolver::default(), PlayerConfig::default()).await;
        let transport = Arc::new(FakeTransport::default());
        attach(&h.player, guild(), transport.clone());
        let session = h.player.registry().get(guild()).unwrap();
        *h.transcoder.stop_on_open.lock() = Some(Arc::clone(&session));

        let report = h.player.enqueue(guild(), tracks(&["A"]), None).await.unwrap();

        assert!(report.started.is_none());
        assert!(transport.played.lock().is_empty());
        assert!(h.notifier.now_playing.lock().is_empty());
    }
}
