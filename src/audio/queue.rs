use rand::seq::SliceRandom;
use std::collections::{HashSet, VecDeque};
use tracing::{debug, info};

use super::track::Track;
use crate::error::{PlayerError, PlayerResult};

/// Cola de una guild: pistas pendientes, pista actual e historial.
///
/// Mantiene el invariante de la sugerencia: como mucho una pista con
/// `suggested = true` y, si existe, siempre es la última.
#[derive(Debug, Clone)]
pub struct MusicQueue {
    items: VecDeque<Track>,
    current: Option<Track>,
    history: VecDeque<Track>,
    max_size: usize,
    max_history: usize,
}

impl MusicQueue {
    pub fn new(max_size: usize, max_history: usize) -> Self {
        Self {
            items: VecDeque::new(),
            current: None,
            history: VecDeque::with_capacity(max_history),
            max_size,
            max_history,
        }
    }

    /// Agrega pistas de usuario. La sugerencia final, si la hay, se quita
    /// antes para que nunca quede delante de ellas; el autoplay la vuelve a
    /// derivar después.
    pub fn push_user_tracks(&mut self, tracks: Vec<Track>) -> PlayerResult<Vec<Track>> {
        self.strip_suggestions();

        let available = self.max_size.saturating_sub(self.items.len());
        if available == 0 && !tracks.is_empty() {
            return Err(PlayerError::invalid(format!(
                "La cola está llena (máximo {} canciones)",
                self.max_size
            )));
        }

        let added: Vec<Track> = tracks
            .into_iter()
            .take(available)
            .map(Track::into_user_track)
            .collect();
        self.items.extend(added.iter().cloned());

        info!("➕ Agregadas {} canciones a la cola", added.len());
        Ok(added)
    }

    /// Saca la siguiente pista (FIFO), la guarda en el historial y la marca
    /// como actual.
    pub fn pop_next(&mut self) -> Option<Track> {
        let next = self.items.pop_front()?;
        self.push_history(next.clone());
        self.current = Some(next.clone());
        Some(next)
    }

    pub fn remove_at(&mut self, index: usize, autoplay_enabled: bool) -> PlayerResult<Track> {
        let target = self
            .items
            .get(index)
            .ok_or_else(|| PlayerError::invalid(format!("No hay ninguna canción en la posición {}", index + 1)))?;

        if target.suggested && autoplay_enabled {
            return Err(PlayerError::invalid(
                "La sugerencia del autoplay no se puede quitar; usa /new para cambiarla",
            ));
        }

        let removed = self
            .items
            .remove(index)
            .ok_or_else(|| PlayerError::invalid("No se pudo remover el item"))?;
        debug!("❌ Track eliminado en posición {}", index);
        Ok(removed)
    }

    /// Mezcla solo las pistas de usuario; la sugerencia sigue al final.
    pub fn shuffle_user_tracks(&mut self) {
        let suggestion = self.pop_trailing_suggestion();
        self.strip_suggestions();

        let mut items: Vec<_> = self.items.drain(..).collect();
        items.shuffle(&mut rand::thread_rng());
        self.items.extend(items);

        if let Some(suggestion) = suggestion {
            self.items.push_back(suggestion);
        }
        info!("🔀 Cola mezclada");
    }

    /// Quita todas las pistas de usuario; la sugerencia sobrevive.
    pub fn clear_user_tracks(&mut self) -> usize {
        let original_len = self.items.len();
        self.items.retain(|track| track.suggested);
        let removed = original_len - self.items.len();
        info!("🗑️ Cola limpiada: {} tracks removidos", removed);
        removed
    }

    pub fn strip_suggestions(&mut self) -> usize {
        let original_len = self.items.len();
        self.items.retain(|track| !track.suggested);
        original_len - self.items.len()
    }

    /// Reemplaza cualquier sugerencia por `track` al final de la cola.
    pub fn push_suggestion(&mut self, track: Track) {
        self.strip_suggestions();
        self.items.push_back(track.into_suggestion());
    }

    pub fn pop_trailing_suggestion(&mut self) -> Option<Track> {
        if self.items.back().is_some_and(|t| t.suggested) {
            self.items.pop_back()
        } else {
            None
        }
    }

    pub fn suggestion_count(&self) -> usize {
        self.items.iter().filter(|t| t.suggested).count()
    }

    /// Exactamente una sugerencia y en la última posición
    pub fn has_trailing_suggestion(&self) -> bool {
        self.suggestion_count() == 1 && self.items.back().is_some_and(|t| t.suggested)
    }

    /// Semilla para recomendaciones: última pista de usuario en la cola, si
    /// no la actual, si no la más reciente del historial.
    pub fn seed(&self) -> Option<&Track> {
        self.items
            .iter()
            .rev()
            .find(|t| !t.suggested)
            .or(self.current.as_ref())
            .or_else(|| self.history.back())
    }

    pub fn recent_history_ids(&self, window: usize) -> HashSet<String> {
        self.history
            .iter()
            .rev()
            .take(window)
            .map(|t| t.id.clone())
            .collect()
    }

    pub fn queued_ids(&self) -> HashSet<String> {
        self.items.iter().map(|t| t.id.clone()).collect()
    }

    /// Pistas de esta sesión (historial + actual) sin repetir, para la última
    /// pasada de descargas al desconectar.
    pub fn session_tracks(&self) -> Vec<Track> {
        let mut seen = HashSet::new();
        self.history
            .iter()
            .chain(self.current.iter())
            .filter(|t| seen.insert(t.id.clone()))
            .cloned()
            .collect()
    }

    /// Actual + cola de usuario, para guardar como playlist
    pub fn snapshot(&self) -> Vec<Track> {
        self.current
            .iter()
            .chain(self.items.iter())
            .map(|t| t.clone().into_user_track())
            .collect()
    }

    pub fn items(&self) -> &VecDeque<Track> {
        &self.items
    }

    pub fn front(&self) -> Option<&Track> {
        self.items.front()
    }

    pub fn current(&self) -> Option<&Track> {
        self.current.as_ref()
    }

    pub fn set_current(&mut self, track: Option<Track>) {
        self.current = track;
    }

    pub fn history(&self) -> &VecDeque<Track> {
        &self.history
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    fn push_history(&mut self, track: Track) {
        self.history.push_back(track);
        while self.history.len() > self.max_history {
            self.history.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn user(id: &str) -> Track {
        Track::new(id, format!("Song {id}"))
    }

    fn ids(queue: &MusicQueue) -> Vec<String> {
        queue.items().iter().map(|t| t.id.clone()).collect()
    }

    fn queue_with(tracks: &[&str]) -> MusicQueue {
        let mut queue = MusicQueue::new(100, 20);
        queue
            .push_user_tracks(tracks.iter().map(|id| user(id)).collect())
            .unwrap();
        queue
    }

    #[test]
    fn enqueue_appends_and_advance_pops_fifo() {
        let mut queue = queue_with(&["A"]);
        queue.push_user_tracks(vec![user("B")]).unwrap();
        assert_eq!(ids(&queue), vec!["A", "B"]);

        let next = queue.pop_next().unwrap();
        assert_eq!(next.id, "A");
        assert_eq!(ids(&queue), vec!["B"]);
        assert_eq!(queue.current().map(|t| t.id.as_str()), Some("A"));
        assert_eq!(queue.history().back().map(|t| t.id.as_str()), Some("A"));
    }

    #[test]
    fn enqueue_drops_the_trailing_suggestion_first() {
        let mut queue = queue_with(&["U1"]);
        queue.push_suggestion(user("S"));
        queue.push_user_tracks(vec![user("U2")]).unwrap();

        assert_eq!(ids(&queue), vec!["U1", "U2"]);
        assert_eq!(queue.suggestion_count(), 0);
    }

    #[test]
    fn pinned_suggestion_cannot_be_removed_while_autoplay_is_on() {
        let mut queue = queue_with(&["U1"]);
        queue.push_suggestion(user("S"));

        let err = queue.remove_at(1, true).unwrap_err();
        assert!(matches!(err, PlayerError::InvalidOperation(_)));
        assert_eq!(queue.len(), 2);

        assert_eq!(queue.remove_at(1, false).unwrap().id, "S");
        assert!(matches!(queue.remove_at(5, false), Err(PlayerError::InvalidOperation(_))));
    }

    #[test]
    fn shuffle_keeps_the_suggestion_last() {
        let mut queue = queue_with(&["a", "b", "c", "d", "e", "f", "g", "h"]);
        queue.push_suggestion(user("S"));

        for _ in 0..20 {
            queue.shuffle_user_tracks();
            assert!(queue.has_trailing_suggestion());
            assert_eq!(queue.len(), 9);
        }
    }

    #[test]
    fn clear_keeps_only_the_suggestion() {
        let mut queue = queue_with(&["a", "b"]);
        queue.push_suggestion(user("S"));

        assert_eq!(queue.clear_user_tracks(), 2);
        assert_eq!(ids(&queue), vec!["S"]);
    }

    #[test]
    fn seed_prefers_last_user_track_then_current_then_history() {
        let mut queue = queue_with(&["a", "b"]);
        queue.push_suggestion(user("S"));
        assert_eq!(queue.seed().unwrap().id, "b");

        let mut queue = queue_with(&["x"]);
        queue.pop_next();
        assert_eq!(queue.seed().unwrap().id, "x");

        queue.set_current(None);
        assert_eq!(queue.seed().unwrap().id, "x");

        assert!(MusicQueue::new(10, 20).seed().is_none());
    }

    #[test]
    fn history_is_a_bounded_ring() {
        let mut queue = MusicQueue::new(100, 3);
        queue
            .push_user_tracks(["1", "2", "3", "4", "5"].iter().map(|id| user(id)).collect())
            .unwrap();
        while queue.pop_next().is_some() {}

        let history: Vec<_> = queue.history().iter().map(|t| t.id.as_str()).collect();
        assert_eq!(history, vec!["3", "4", "5"]);
    }

    #[test]
    fn full_queue_rejects_and_partial_fits_truncate() {
        let mut queue = MusicQueue::new(2, 20);
        let added = queue
            .push_user_tracks(vec![user("a"), user("b"), user("c")])
            .unwrap();
        assert_eq!(added.len(), 2);
        assert!(queue.push_user_tracks(vec![user("d")]).is_err());
    }

    #[test]
    fn snapshot_and_session_tracks_drop_duplicates_and_flags() {
        let mut queue = queue_with(&["a", "a"]);
        queue.pop_next();
        queue.push_suggestion(user("S"));

        let session: Vec<_> = queue.session_tracks().into_iter().map(|t| t.id).collect();
        assert_eq!(session, vec!["a"]);

        let snapshot = queue.snapshot();
        assert_eq!(snapshot.len(), 3);
        assert!(snapshot.iter().all(|t| !t.suggested));
    }
}
