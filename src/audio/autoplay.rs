use rand::seq::SliceRandom;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::state::GuildSession;
use super::track::Track;
use crate::error::{PlayerError, PlayerResult};
use crate::sources::RecommendationFeed;

#[derive(Debug, Clone)]
pub struct AutoplaySettings {
    /// Cuántas recomendaciones pedir por consulta
    pub window: usize,
    pub max_candidates: usize,
    /// Cuántas entradas recientes del historial se excluyen
    pub history_window: usize,
}

impl Default for AutoplaySettings {
    fn default() -> Self {
        Self {
            window: 20,
            max_candidates: 5,
            history_window: 20,
        }
    }
}

/// Resultado de una pasada del autoplay
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AutoplayOutcome {
    Disabled,
    /// Ya había una consulta en curso
    Busy,
    NoSeed,
    AlreadyBuffered,
    Appended(Track),
    NoCandidates,
    FeedFailed,
}

/// Mantiene exactamente una sugerencia al final de la cola mientras el
/// autoplay está activo.
pub struct AutoplayEngine {
    feed: Arc<dyn RecommendationFeed>,
    settings: AutoplaySettings,
}

impl AutoplayEngine {
    pub fn new(feed: Arc<dyn RecommendationFeed>, settings: AutoplaySettings) -> Self {
        Self { feed, settings }
    }

    /// Asegura la sugerencia final.
    ///
    /// Con el autoplay apagado quita cualquier sugerencia. Si ya hay una
    /// consulta en curso no arranca otra; con `forced` deja pedida una pasada
    /// más, y cualquier cantidad de pedidos así se resuelve en una sola.
    pub async fn ensure(
        &self,
        session: &Arc<GuildSession>,
        avoid: &[String],
        forced: bool,
    ) -> AutoplayOutcome {
        let active = session.with_state(|state| {
            if !state.autoplay_enabled {
                state.queue.strip_suggestions();
            }
            state.autoplay_enabled && !state.stopping
        });
        if !active {
            return AutoplayOutcome::Disabled;
        }

        let Some(mut ticket) = session.autoplay.try_begin(forced) else {
            debug!("🎲 Autoplay ya en curso para guild {}", session.guild_id);
            return AutoplayOutcome::Busy;
        };

        let mut avoid = avoid.to_vec();
        let mut forced = forced;
        loop {
            let outcome = self.fetch_once(session, &avoid, forced).await;
            match ticket.finish() {
                Some(again) => {
                    debug!("🎲 Cola cambiada durante el autoplay, recalculando");
                    ticket = again;
                    forced = true;
                    avoid.clear();
                }
                None => return outcome,
            }
        }
    }

    /// Cambia la sugerencia actual por otra distinta
    pub async fn regenerate(&self, session: &Arc<GuildSession>) -> PlayerResult<AutoplayOutcome> {
        let popped = session.with_state(|state| {
            if !state.autoplay_enabled {
                return Err(PlayerError::invalid("El autoplay está desactivado"));
            }
            Ok(state.queue.pop_trailing_suggestion())
        })?;

        let avoid: Vec<String> = popped.into_iter().map(|t| t.id).collect();
        Ok(self.ensure(session, &avoid, true).await)
    }

    async fn fetch_once(
        &self,
        session: &Arc<GuildSession>,
        avoid: &[String],
        forced: bool,
    ) -> AutoplayOutcome {
        let seed = session.with_state(|state| {
            if state.stopping || !state.autoplay_enabled {
                return Err(AutoplayOutcome::Disabled);
            }
            if !forced && state.queue.has_trailing_suggestion() {
                return Err(AutoplayOutcome::AlreadyBuffered);
            }
            if state.queue.suggestion_count() > 0 && !state.queue.has_trailing_suggestion() {
                warn!("⚠️ Sugerencia fuera de lugar en guild {}, se descarta", session.guild_id);
                state.queue.strip_suggestions();
            }
            state.queue.seed().cloned().ok_or(AutoplayOutcome::NoSeed)
        });
        let seed = match seed {
            Ok(seed) => seed,
            Err(outcome) => return outcome,
        };

        debug!("🎲 Buscando recomendaciones a partir de '{}'", seed.title);
        let related = match self.feed.related(&seed.id, self.settings.window).await {
            Ok(related) => related,
            Err(e) => {
                warn!("⚠️ Autoplay sin recomendaciones para {}: {}", seed.id, e);
                return AutoplayOutcome::FeedFailed;
            }
        };

        session.with_state(|state| {
            if state.stopping || !state.autoplay_enabled {
                return AutoplayOutcome::Disabled;
            }

            let mut excluded: HashSet<String> = state.queue.recent_history_ids(self.settings.history_window);
            excluded.extend(state.queue.queued_ids());
            excluded.extend(avoid.iter().cloned());
            excluded.insert(seed.id.clone());

            let candidates: Vec<Track> = related
                .into_iter()
                .filter(|track| excluded.insert(track.id.clone()))
                .take(self.settings.max_candidates)
                .collect();

            match candidates.choose(&mut rand::thread_rng()) {
                Some(pick) => {
                    state.queue.push_suggestion(pick.clone());
                    info!("✨ Sugerencia de autoplay: {}", pick.title);
                    AutoplayOutcome::Appended(pick.clone().into_suggestion())
                }
                None => {
                    debug!("🎲 Sin candidatos para '{}'", seed.title);
                    AutoplayOutcome::NoCandidates
                }
            }
        })
    }
}
