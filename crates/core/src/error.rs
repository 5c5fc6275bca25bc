//! Fehlertypen fuer Fernsprech
//!
//! Zentraler Fehler-Enum fuer alles, was Crate-Grenzen ueberquert.
//! Die Fach-Crates definieren eigene Fehler und konvertieren bei Bedarf.

use thiserror::Error;

use crate::types::StreamDirection;

/// Globaler Result-Alias fuer Fernsprech
pub type Result<T> = std::result::Result<T, FernsprechError>;

/// Alle Fehler, die zwischen den Fernsprech-Crates ausgetauscht werden
#[derive(Debug, Error)]
pub enum FernsprechError {
    // --- Geraete ---
    #[error("Geraet ({richtung}) konnte nicht geoeffnet werden: {grund}")]
    GeraetOeffnen {
        richtung: StreamDirection,
        grund: String,
    },

    #[error("Audio-Server nicht erreichbar: {0}")]
    ServerVerbindung(String),

    // --- Codecs ---
    #[error("Kein Codec fuer Payload-Typ {0}")]
    CodecNichtGefunden(u8),

    #[error("Codec-Fehler: {0}")]
    Codec(String),

    // --- Konfiguration ---
    #[error("Konfigurationsfehler: {0}")]
    Konfiguration(String),

    // --- Intern ---
    #[error("Interner Fehler: {0}")]
    Intern(String),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}
