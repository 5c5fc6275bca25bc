//! Fehlertypen fuer das Codec-Modulsystem

use std::path::PathBuf;

use fernsprech_core::PayloadTyp;
use thiserror::Error;

/// Alle moeglichen Fehler im Codec-Modulsystem
#[derive(Debug, Error)]
pub enum CodecError {
    // --- Module ---
    #[error("Modulname nicht zugelassen: {0}")]
    NichtZugelassen(String),

    #[error("Modul nicht verfuegbar: {0}")]
    ModulNichtVerfuegbar(String),

    #[error("Symbol '{symbol}' in {pfad} nicht gefunden")]
    SymbolFehlt { symbol: String, pfad: PathBuf },

    #[error("Codec-Konstruktion fehlgeschlagen: {0}")]
    Konstruktion(String),

    #[error("Payload-Typ {0} bereits registriert")]
    PayloadBelegt(PayloadTyp),

    // --- Kodierung ---
    #[error("Puffer zu klein: benoetigt {benoetigt}, vorhanden {vorhanden}")]
    PufferZuKlein { benoetigt: usize, vorhanden: usize },

    #[error("Kodierfehler: {0}")]
    Kodierung(String),

    // --- IO ---
    #[error("IO-Fehler: {0}")]
    Io(#[from] std::io::Error),
}

/// Result-Alias fuer das Codec-Modulsystem
pub type CodecResult<T> = std::result::Result<T, CodecError>;

impl From<CodecError> for fernsprech_core::FernsprechError {
    fn from(e: CodecError) -> Self {
        fernsprech_core::FernsprechError::Codec(e.to_string())
    }
}
