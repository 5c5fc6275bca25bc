//! fernsprech-core – Gemeinsame Typen und Fehlertypen
//!
//! Dieses Crate stellt die Bausteine bereit, die Codec-Registry,
//! Audio-Backends und Daemon gemeinsam nutzen.

pub mod error;
pub mod types;

// Re-Exporte fuer bequemen Zugriff
pub use error::{FernsprechError, Result};
pub use types::{CallId, PayloadTyp, Sample, StreamDirection};
