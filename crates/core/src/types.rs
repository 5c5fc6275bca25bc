//! Gemeinsame Typen fuer Fernsprech
//!
//! Call-IDs verwenden das Newtype-Pattern, damit sie nicht mit
//! Ringpuffer- oder Geraetenamen verwechselt werden.

use serde::{Deserialize, Serialize};

/// Ein PCM-Sample. Die gesamte Pipeline arbeitet mit 16 Bit signed.
pub type Sample = i16;

/// RTP-Payload-Typ (0..=127, dynamisch ab 96)
pub type PayloadTyp = u8;

/// Kennung eines Gespraechs
///
/// Die Signalisierung vergibt die Kennung; die Media-Engine nutzt sie
/// als Schluessel fuer Ringpuffer und Leser.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CallId(pub String);

impl CallId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CallId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "call:{}", self.0)
    }
}

impl From<&str> for CallId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Richtung eines Audio-Streams
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamDirection {
    /// Mikrofon -> Pipeline
    Capture,
    /// Pipeline -> Lautsprecher
    Playback,
    /// Klingelton auf separatem Geraet
    Ringtone,
}

impl StreamDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Capture => "capture",
            Self::Playback => "playback",
            Self::Ringtone => "ringtone",
        }
    }
}

impl std::fmt::Display for StreamDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn call_id_anzeige() {
        let id = CallId::new("1234");
        assert_eq!(id.to_string(), "call:1234");
        assert_eq!(id.as_str(), "1234");
    }

    #[test]
    fn richtung_anzeige() {
        assert_eq!(StreamDirection::Capture.to_string(), "capture");
        assert_eq!(StreamDirection::Ringtone.as_str(), "ringtone");
    }
}
