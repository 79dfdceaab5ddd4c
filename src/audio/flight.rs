//! Single-flight por guild.
//!
//! Un [`SingleFlight`] admite como máximo una operación en curso. Quien llega
//! tarde no arranca trabajo duplicado: puede marcar el vuelo como "sucio" y
//! el dueño actual hará exactamente una pasada más al terminar.

use parking_lot::Mutex;
use std::sync::Arc;

#[derive(Debug, Default)]
struct FlightState {
    in_flight: bool,
    dirty: bool,
}

#[derive(Debug, Default)]
pub struct SingleFlight {
    state: Mutex<FlightState>,
}

impl SingleFlight {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Intenta tomar el vuelo. Si ya hay uno en curso devuelve `None` y, con
    /// `mark_dirty`, deja pedida una pasada de seguimiento.
    pub fn try_begin(self: &Arc<Self>, mark_dirty: bool) -> Option<FlightTicket> {
        let mut state = self.state.lock();
        if state.in_flight {
            if mark_dirty {
                state.dirty = true;
            }
            return None;
        }

        state.in_flight = true;
        state.dirty = false;
        Some(FlightTicket {
            flight: Arc::clone(self),
            released: false,
        })
    }

    pub fn is_in_flight(&self) -> bool {
        self.state.lock().in_flight
    }

    #[cfg(test)]
    pub fn is_dirty(&self) -> bool {
        self.state.lock().dirty
    }
}

/// Prueba de que el vuelo es nuestro. Soltarlo libera el vuelo.
#[derive(Debug)]
pub struct FlightTicket {
    flight: Arc<SingleFlight>,
    released: bool,
}

impl FlightTicket {
    /// Termina la pasada actual. Si alguien pidió seguimiento mientras tanto,
    /// devuelve el mismo ticket (el vuelo sigue tomado) para una pasada más.
    pub fn finish(mut self) -> Option<FlightTicket> {
        let rearm = {
            let mut state = self.flight.state.lock();
            if state.dirty {
                state.dirty = false;
                true
            } else {
                state.in_flight = false;
                false
            }
        };

        if rearm {
            Some(self)
        } else {
            self.released = true;
            None
        }
    }
}

impl Drop for FlightTicket {
    fn drop(&mut self) {
        if !self.released {
            self.flight.state.lock().in_flight = false;
        }
    }
}
