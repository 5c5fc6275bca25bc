//! # fernsprech-observability
//!
//! Structured Logging fuer den Daemon ueber `tracing-subscriber`.
//! Level und Format kommen aus der Konfiguration und lassen sich per
//! Umgebung (`FS_LOG_LEVEL`, `FS_LOG_FORMAT`) ueberschreiben.

pub mod logging;

pub use logging::{init_logging, LogFormat, LoggingError};
