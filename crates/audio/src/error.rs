//! Fehlertypen fuer die Audio-Schicht

use fernsprech_core::{FernsprechError, StreamDirection};
use thiserror::Error;

/// Alle moeglichen Fehler der Audio-Schicht
#[derive(Debug, Error)]
pub enum AudioError {
    #[error("Audio-Geraet nicht gefunden: {0}")]
    GeraetNichtGefunden(String),

    #[error("Kein Geraet nutzbar: {0}")]
    KeinGeraet(String),

    #[error("Stream-Fehler: {0}")]
    StreamFehler(String),

    #[error("Resampler-Fehler: {0}")]
    Resampler(String),

    #[error("Konfigurationsfehler: {0}")]
    Konfiguration(String),

    #[error("Dringender Leser '{0}' bereits registriert")]
    DringenderLeserVorhanden(String),

    #[error("Audio-Server: {0}")]
    Server(String),

    #[error("Backend nach Verbindungsverlust unbrauchbar")]
    BackendDefekt,

    #[error("Backend nicht geoeffnet")]
    NichtGeoeffnet,

    #[error("Ungueltige DTMF-Ziffer: {0:?}")]
    UngueltigeDtmfZiffer(char),

    #[error("WAV-Fehler: {0}")]
    Wav(String),

    #[error("IO-Fehler: {0}")]
    Io(#[from] std::io::Error),
}

pub type AudioResult<T> = Result<T, AudioError>;

/// Fehler eines PCM-Geraets auf Treiberebene
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PcmError {
    /// Unter- oder Ueberlauf, wird an Ort und Stelle behoben
    #[error("Xrun")]
    Xrun,

    #[error("Geraet suspendiert")]
    Suspended,

    #[error("Ungueltiger Zustandswechsel: {von} -> {nach}")]
    Zustand {
        von: &'static str,
        nach: &'static str,
    },

    #[error("Geraetefehler: {0}")]
    Geraet(String),
}

impl PcmError {
    /// Wird durch Neustart des Streams behoben
    pub fn ist_voruebergehend(&self) -> bool {
        matches!(self, Self::Xrun | Self::Suspended)
    }
}

/// Fehler beim Oeffnen eines Geraets, getrennt nach Richtung
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeviceError {
    #[error("Capture-Geraet: {0}")]
    Capture(String),

    #[error("Playback-Geraet: {0}")]
    Playback(String),

    #[error("Klingelton-Geraet: {0}")]
    Ringtone(String),
}

impl DeviceError {
    pub fn neu(richtung: StreamDirection, grund: impl Into<String>) -> Self {
        match richtung {
            StreamDirection::Capture => Self::Capture(grund.into()),
            StreamDirection::Playback => Self::Playback(grund.into()),
            StreamDirection::Ringtone => Self::Ringtone(grund.into()),
        }
    }

    pub fn richtung(&self) -> StreamDirection {
        match self {
            Self::Capture(_) => StreamDirection::Capture,
            Self::Playback(_) => StreamDirection::Playback,
            Self::Ringtone(_) => StreamDirection::Ringtone,
        }
    }

    /// Fehlercode fuer die Signalisierung (ein Bit pro Richtung)
    pub fn code(&self) -> u32 {
        match self {
            Self::Capture(_) => 0x01,
            Self::Playback(_) => 0x02,
            Self::Ringtone(_) => 0x04,
        }
    }
}

impl From<DeviceError> for FernsprechError {
    fn from(e: DeviceError) -> Self {
        let richtung = e.richtung();
        let grund = match e {
            DeviceError::Capture(g) | DeviceError::Playback(g) | DeviceError::Ringtone(g) => g,
        };
        FernsprechError::GeraetOeffnen { richtung, grund }
    }
}

impl From<AudioError> for FernsprechError {
    fn from(e: AudioError) -> Self {
        match e {
            AudioError::Server(msg) => FernsprechError::ServerVerbindung(msg),
            AudioError::Konfiguration(msg) => FernsprechError::Konfiguration(msg),
            andere => FernsprechError::Intern(andere.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn geraetefehler_codes_getrennt() {
        let c = DeviceError::neu(StreamDirection::Capture, "belegt");
        let p = DeviceError::neu(StreamDirection::Playback, "fehlt");
        assert_eq!(c.code() & p.code(), 0);
        assert_eq!(c.richtung(), StreamDirection::Capture);
        assert_eq!(c.to_string(), "Capture-Geraet: belegt");
    }

    #[test]
    fn xrun_ist_voruebergehend() {
        assert!(PcmError::Xrun.ist_voruebergehend());
        assert!(!PcmError::Geraet("weg".into()).ist_voruebergehend());
    }

    #[test]
    fn konvertierung_in_kernfehler() {
        let e: FernsprechError = DeviceError::Playback("weg".into()).into();
        assert!(matches!(
            e,
            FernsprechError::GeraetOeffnen {
                richtung: StreamDirection::Playback,
                ..
            }
        ));
    }
}
