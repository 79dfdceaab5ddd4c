use thiserror::Error;

/// Errores del orquestador de reproducción.
///
/// `Resolution` y `Transcode` se recuperan localmente dentro del avance
/// (reintento con espera); `CacheIo` se registra y se descarta; `Connect`,
/// `NotConnected` e `InvalidOperation` siempre llegan a quien hizo la petición.
#[derive(Debug, Error)]
pub enum PlayerError {
    /// Falló la búsqueda de metadata o de la URL de stream
    #[error("No se pudo resolver la pista: {0}")]
    Resolution(String),

    /// El pipeline de audio no pudo arrancar
    #[error("No se pudo preparar el audio: {0}")]
    Transcode(String),

    /// No se pudo entrar al canal de voz
    #[error("No se pudo conectar al canal de voz: {0}")]
    Connect(String),

    /// Error de disco en la caché (descarga o desalojo)
    #[error("Error de caché: {0}")]
    CacheIo(#[from] std::io::Error),

    /// Operación rechazada, p. ej. quitar la sugerencia fijada
    #[error("{0}")]
    InvalidOperation(String),

    /// No hay conexión de voz para esta guild
    #[error("No estoy conectado a un canal de voz")]
    NotConnected,
}

impl PlayerError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidOperation(msg.into())
    }

    /// Errores que el avance reintenta en lugar de propagar
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Resolution(_) | Self::Transcode(_))
    }
}

pub type PlayerResult<T> = Result<T, PlayerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_failures_are_recoverable() {
        assert!(PlayerError::Resolution("404".into()).is_recoverable());
        assert!(PlayerError::Transcode("códec desconocido".into()).is_recoverable());
        assert!(!PlayerError::NotConnected.is_recoverable());
        assert!(!PlayerError::invalid("nope").is_recoverable());
    }

    #[test]
    fn io_errors_become_cache_failures() {
        let err: PlayerError = std::io::Error::new(std::io::ErrorKind::NotFound, "gone").into();
        assert!(matches!(err, PlayerError::CacheIo(_)));
    }
}
