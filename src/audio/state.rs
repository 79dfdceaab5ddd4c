use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serenity::model::id::{ChannelId, GuildId};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

use super::flight::SingleFlight;
use super::queue::MusicQueue;
use super::track::Track;
use super::transport::VoiceTransport;

/// Pista que falló al cargar y espera su reintento
#[derive(Debug, Clone)]
pub struct PendingRetry {
    pub track: Track,
    pub attempts: u32,
}

/// Estado mutable de reproducción de una guild.
///
/// Se guarda detrás de un mutex síncrono: nunca se retiene a través de un
/// `.await`.
#[derive(Debug)]
pub struct GuildState {
    pub queue: MusicQueue,
    pub autoplay_enabled: bool,
    pub stopping: bool,
    pub last_interaction: Instant,
    pub notification_target: Option<ChannelId>,
    pub pending_retry: Option<PendingRetry>,
    /// Sube en cada `play`; los avisos de fin con otra generación se ignoran
    pub play_generation: u64,
    /// Intentos fallidos de la pista actual antes de que arrancara
    pub load_failures: u32,
}

impl GuildState {
    pub fn new(defaults: &SessionDefaults) -> Self {
        Self {
            queue: MusicQueue::new(defaults.max_queue_size, defaults.history_size),
            autoplay_enabled: defaults.autoplay_enabled,
            stopping: false,
            last_interaction: Instant::now(),
            notification_target: None,
            pending_retry: None,
            play_generation: 0,
            load_failures: 0,
        }
    }

    pub fn touch(&mut self) {
        self.last_interaction = Instant::now();
    }
}

/// Valores iniciales de cada sesión nueva
#[derive(Debug, Clone)]
pub struct SessionDefaults {
    pub max_queue_size: usize,
    pub history_size: usize,
    pub autoplay_enabled: bool,
}

impl Default for SessionDefaults {
    fn default() -> Self {
        Self {
            max_queue_size: 1000,
            history_size: 20,
            autoplay_enabled: false,
        }
    }
}

/// Sesión de una guild: estado, vuelos únicos y conexión de voz
pub struct GuildSession {
    pub guild_id: GuildId,
    state: Mutex<GuildState>,
    pub advance: Arc<SingleFlight>,
    pub autoplay: Arc<SingleFlight>,
    transport: RwLock<Option<Arc<dyn VoiceTransport>>>,
}

impl GuildSession {
    fn new(guild_id: GuildId, defaults: &SessionDefaults) -> Self {
        Self {
            guild_id,
            state: Mutex::new(GuildState::new(defaults)),
            advance: SingleFlight::new(),
            autoplay: SingleFlight::new(),
            transport: RwLock::new(None),
        }
    }

    /// Ejecuta `f` con el estado bloqueado
    pub fn with_state<R>(&self, f: impl FnOnce(&mut GuildState) -> R) -> R {
        let mut state = self.state.lock();
        f(&mut state)
    }

    pub fn read<R>(&self, f: impl FnOnce(&GuildState) -> R) -> R {
        let state = self.state.lock();
        f(&state)
    }

    pub fn is_stopping(&self) -> bool {
        self.state.lock().stopping
    }

    pub fn transport(&self) -> Option<Arc<dyn VoiceTransport>> {
        self.transport.read().clone()
    }

    pub fn attach_transport(&self, transport: Arc<dyn VoiceTransport>) {
        *self.transport.write() = Some(transport);
    }

    pub fn take_transport(&self) -> Option<Arc<dyn VoiceTransport>> {
        self.transport.write().take()
    }
}

/// Registro de sesiones, una por guild
pub struct GuildRegistry {
    sessions: DashMap<GuildId, Arc<GuildSession>>,
    defaults: SessionDefaults,
}

impl GuildRegistry {
    pub fn new(defaults: SessionDefaults) -> Self {
        Self {
            sessions: DashMap::new(),
            defaults,
        }
    }

    pub fn get_or_create(&self, guild_id: GuildId) -> Arc<GuildSession> {
        self.sessions
            .entry(guild_id)
            .or_insert_with(|| {
                info!("🆕 Nueva sesión para guild {}", guild_id);
                Arc::new(GuildSession::new(guild_id, &self.defaults))
            })
            .clone()
    }

    pub fn get(&self, guild_id: GuildId) -> Option<Arc<GuildSession>> {
        self.sessions.get(&guild_id).map(|s| s.clone())
    }

    /// Quita la sesión solo si sigue siendo la misma instancia; una sesión
    /// creada después de un stop no se toca.
    pub fn remove_if_same(&self, session: &Arc<GuildSession>) -> bool {
        let removed = self
            .sessions
            .remove_if(&session.guild_id, |_, current| Arc::ptr_eq(current, session))
            .is_some();
        if removed {
            debug!("🗑️ Sesión eliminada para guild {}", session.guild_id);
        }
        removed
    }

    pub fn guild_ids(&self) -> Vec<GuildId> {
        self.sessions.iter().map(|entry| *entry.key()).collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sessions_are_created_once_per_guild() {
        let registry = GuildRegistry::new(SessionDefaults::default());
        let a = registry.get_or_create(GuildId::new(1));
        let b = registry.get_or_create(GuildId::new(1));
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len(), 1);
        assert!(registry.get(GuildId::new(2)).is_none());
    }

    #[test]
    fn stale_session_does_not_remove_its_replacement() {
        let registry = GuildRegistry::new(SessionDefaults::default());
        let old = registry.get_or_create(GuildId::new(1));
        assert!(registry.remove_if_same(&old));

        let fresh = registry.get_or_create(GuildId::new(1));
        assert!(!registry.remove_if_same(&old));
        assert!(Arc::ptr_eq(&registry.get(GuildId::new(1)).unwrap(), &fresh));
    }

    #[test]
    fn new_sessions_take_the_configured_defaults() {
        let registry = GuildRegistry::new(SessionDefaults {
            autoplay_enabled: true,
            ..SessionDefaults::default()
        });
        let session = registry.get_or_create(GuildId::new(9));
        assert!(session.read(|s| s.autoplay_enabled && !s.stopping));
        assert!(session.transport().is_none());
    }
}
