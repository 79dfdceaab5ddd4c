//! Desalojo LRU por mtime del directorio de caché. Síncrono: se llama desde
//! `spawn_blocking`.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct EvictionPolicy {
    pub ceiling_bytes: u64,
    /// Al desalojar se baja hasta `ceiling_bytes - safety_margin_bytes`
    pub safety_margin_bytes: u64,
    /// Extensiones (sin punto) que cuentan como audio desalojable
    pub audio_extensions: Vec<String>,
}

impl EvictionPolicy {
    pub fn target_bytes(&self) -> u64 {
        self.ceiling_bytes.saturating_sub(self.safety_margin_bytes)
    }

    pub fn is_audio(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .is_some_and(|ext| self.audio_extensions.iter().any(|a| a.eq_ignore_ascii_case(ext)))
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct EvictionReport {
    pub scanned_bytes: u64,
    pub remaining_bytes: u64,
    /// Ids (nombre sin extensión) de las pistas desalojadas, de la más vieja a la más nueva
    pub evicted: Vec<String>,
}

#[derive(Debug)]
struct AudioEntry {
    path: PathBuf,
    size: u64,
    modified: SystemTime,
}

/// Entradas de audio del directorio (sin entrar en subdirectorios) y la suma
/// de sus tamaños. Miniaturas y otros archivos no cuentan para el techo.
fn scan(dir: &Path, policy: &EvictionPolicy) -> io::Result<(u64, Vec<AudioEntry>)> {
    let mut total = 0;
    let mut audio = Vec::new();

    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if !policy.is_audio(&path) {
            continue;
        }
        let metadata = match entry.metadata() {
            Ok(m) => m,
            // Otro barrido o el reproductor pudo borrarlo entre medio
            Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e),
        };
        if !metadata.is_file() {
            continue;
        }

        total += metadata.len();
        audio.push(AudioEntry {
            size: metadata.len(),
            modified: metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            path,
        });
    }

    Ok((total, audio))
}

/// Bytes de audio que cuentan para el techo
pub fn audio_bytes(dir: &Path, policy: &EvictionPolicy) -> io::Result<u64> {
    scan(dir, policy).map(|(total, _)| total)
}

/// Borra audio empezando por el de mtime más antiguo hasta quedar bajo el
/// objetivo. No hace nada si el total no supera el techo.
pub fn enforce(dir: &Path, policy: &EvictionPolicy) -> io::Result<EvictionReport> {
    let (scanned, mut audio) = scan(dir, policy)?;
    let mut report = EvictionReport {
        scanned_bytes: scanned,
        remaining_bytes: scanned,
        evicted: Vec::new(),
    };

    if scanned <= policy.ceiling_bytes {
        return Ok(report);
    }

    audio.sort_by_key(|entry| entry.modified);
    let target = policy.target_bytes();

    for entry in audio {
        if report.remaining_bytes <= target {
            break;
        }

        match fs::remove_file(&entry.path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("Archivo ya eliminado: {}", entry.path.display());
            }
            Err(e) => {
                warn!("⚠️ No se pudo borrar {}: {}", entry.path.display(), e);
                continue;
            }
        }
        report.remaining_bytes = report.remaining_bytes.saturating_sub(entry.size);

        let thumbnail = entry.path.with_extension("jpg");
        if let Err(e) = fs::remove_file(&thumbnail) {
            if e.kind() != io::ErrorKind::NotFound {
                debug!("Miniatura {} no borrada: {}", thumbnail.display(), e);
            }
        }

        if let Some(id) = entry.path.file_stem().and_then(|s| s.to_str()) {
            report.evicted.push(id.to_string());
        }
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::fs::OpenOptions;
    use std::time::Duration;
    use tempfile::TempDir;

    const MB: u64 = 1024 * 1024;

    fn policy(ceiling_mb: u64, margin_mb: u64) -> EvictionPolicy {
        EvictionPolicy {
            ceiling_bytes: ceiling_mb * MB,
            safety_margin_bytes: margin_mb * MB,
            audio_extensions: vec!["webm".into(), "m4a".into()],
        }
    }

    /// Archivo disperso de `size` bytes con mtime `age_secs` en el pasado
    fn make_file(dir: &Path, name: &str, size: u64, age_secs: u64) {
        let file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(dir.join(name))
            .unwrap();
        file.set_len(size).unwrap();
        file.set_modified(SystemTime::now() - Duration::from_secs(age_secs))
            .unwrap();
    }

    #[test]
    fn oldest_files_go_first_until_under_the_margin() {
        let dir = TempDir::new().unwrap();
        for (i, name) in ["f1", "f2", "f3", "f4", "f5"].iter().enumerate() {
            make_file(dir.path(), &format!("{name}.webm"), 300 * MB, 1000 - i as u64 * 100);
        }
        make_file(dir.path(), "f1.jpg", 10, 1000);

        let report = enforce(dir.path(), &policy(1000, 100)).unwrap();

        assert_eq!(report.evicted, vec!["f1", "f2"]);
        assert_eq!(report.remaining_bytes, 900 * MB);
        assert!(!dir.path().join("f1.jpg").exists());
        assert!(dir.path().join("f3.webm").exists());
    }

    #[test]
    fn under_the_ceiling_nothing_is_touched() {
        let dir = TempDir::new().unwrap();
        make_file(dir.path(), "a.webm", 10 * MB, 50);

        let report = enforce(dir.path(), &policy(1000, 100)).unwrap();
        assert!(report.evicted.is_empty());
        assert_eq!(report.scanned_bytes, 10 * MB);
    }

    #[test]
    fn every_audio_extension_counts_but_other_files_are_kept() {
        let dir = TempDir::new().unwrap();
        make_file(dir.path(), "old.m4a", 8 * MB, 500);
        make_file(dir.path(), "notes.txt", 6 * MB, 900);
        make_file(dir.path(), "new.webm", 3 * MB, 10);
        std::fs::create_dir(dir.path().join(".incoming")).unwrap();

        let report = enforce(dir.path(), &policy(10, 2)).unwrap();

        assert_eq!(report.evicted, vec!["old"]);
        assert!(dir.path().join("notes.txt").exists());
        assert_eq!(audio_bytes(dir.path(), &policy(10, 2)).unwrap(), 3 * MB);
    }

    #[test]
    fn large_foreign_files_do_not_push_audio_out() {
        let dir = TempDir::new().unwrap();
        make_file(dir.path(), "notes.txt", 20 * MB, 900);
        make_file(dir.path(), "a.webm", MB, 10);
        make_file(dir.path(), "a.jpg", 5 * MB, 10);

        let report = enforce(dir.path(), &policy(10, 2)).unwrap();

        assert!(report.evicted.is_empty());
        assert_eq!(report.scanned_bytes, MB);
        assert!(dir.path().join("a.webm").exists());
    }
}
