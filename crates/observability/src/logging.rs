//! Logging-Setup via tracing-subscriber
//!
//! - `FS_LOG_LEVEL`: Filter-Direktive (z.B. `debug` oder
//!   `fernsprech_audio=trace,info`), ueberschreibt das konfigurierte Level
//! - `FS_LOG_FORMAT`: `text` oder `json`, ueberschreibt das konfigurierte Format

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

pub const ENV_LEVEL: &str = "FS_LOG_LEVEL";
pub const ENV_FORMAT: &str = "FS_LOG_FORMAT";

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("Ungueltiger Log-Filter '{0}'")]
    Filter(String),

    #[error("Unbekanntes Log-Format '{0}' (erlaubt: text, json)")]
    Format(String),

    #[error("Logging bereits initialisiert")]
    BereitsInitialisiert,
}

/// Ausgabeformat der Log-Zeilen
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = LoggingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "text" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            _ => Err(LoggingError::Format(s.to_string())),
        }
    }
}

/// Level aus der Umgebung, sonst das konfigurierte
fn filter_waehlen(level: &str) -> Result<EnvFilter, LoggingError> {
    let direktive = std::env::var(ENV_LEVEL).unwrap_or_else(|_| level.to_string());
    EnvFilter::try_new(&direktive).map_err(|_| LoggingError::Filter(direktive))
}

fn format_waehlen(format: LogFormat) -> Result<LogFormat, LoggingError> {
    match std::env::var(ENV_FORMAT) {
        Ok(wert) => wert.parse(),
        Err(_) => Ok(format),
    }
}

/// Initialisiert den globalen Subscriber.
///
/// Darf pro Prozess nur einmal erfolgreich aufgerufen werden.
pub fn init_logging(level: &str, format: LogFormat) -> Result<(), LoggingError> {
    let filter = filter_waehlen(level)?;
    let format = format_waehlen(format)?;
    let registry = tracing_subscriber::registry().with(filter);

    let ergebnis = match format {
        LogFormat::Json => registry
            .with(
                fmt::layer()
                    .json()
                    .with_target(true)
                    .with_thread_names(true)
                    .with_current_span(true),
            )
            .try_init(),
        LogFormat::Text => registry
            .with(fmt::layer().with_target(true).with_thread_names(true))
            .try_init(),
    };
    ergebnis.map_err(|_| LoggingError::BereitsInitialisiert)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_parsen() {
        assert_eq!("text".parse::<LogFormat>().unwrap(), LogFormat::Text);
        assert_eq!("JSON".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert!(matches!(
            "xml".parse::<LogFormat>(),
            Err(LoggingError::Format(_))
        ));
    }

    #[test]
    fn format_aus_toml() {
        #[derive(Deserialize)]
        struct Abschnitt {
            format: LogFormat,
        }
        let a: Abschnitt = toml::from_str("format = \"json\"").unwrap();
        assert_eq!(a.format, LogFormat::Json);
    }

    #[test]
    fn filter_direktiven() {
        assert!(filter_waehlen("debug").is_ok());
        assert!(filter_waehlen("fernsprech_audio=trace,info").is_ok());
    }

    #[test]
    fn zweite_initialisierung_schlaegt_fehl() {
        let erstes = init_logging("info", LogFormat::Text);
        let zweites = init_logging("info", LogFormat::Text);
        assert!(erstes.is_ok() || matches!(erstes, Err(LoggingError::BereitsInitialisiert)));
        assert!(matches!(zweites, Err(LoggingError::BereitsInitialisiert)));
    }
}
