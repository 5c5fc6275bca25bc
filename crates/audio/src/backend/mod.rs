//! Geraete-Backends
//!
//! Zwei austauschbare Varianten hinter [`AudioBackend`]:
//! - [`hardware::HardwareBackend`]: eigener Sitzungs-Thread mit Takt
//! - [`server::ServerBackend`]: Daten fliessen in Callbacks eines Audio-Servers
//!
//! Beide teilen sich den Hot-Path in [`path::AudioPath`].

pub mod hardware;
pub mod path;
pub mod server;

use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender, TrySendError};
use fernsprech_core::StreamDirection;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{AudioResult, DeviceError};
use crate::tone::ToneState;
use crate::volume::VolumeControl;

pub use path::AudioPath;

/// Kapazitaet des Ereignis-Kanals
pub const EVENT_KAPAZITAET: usize = 64;

/// Welche Streams geoeffnet werden
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpenDirection {
    #[default]
    Both,
    Playback,
    Capture,
}

impl OpenDirection {
    pub fn playback(self) -> bool {
        matches!(self, Self::Both | Self::Playback)
    }

    pub fn capture(self) -> bool {
        matches!(self, Self::Both | Self::Capture)
    }
}

/// Parameter fuer `open_device`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenParams {
    /// `None` = Standardgeraet
    pub input_index: Option<usize>,
    pub output_index: Option<usize>,
    /// `None` = kein eigenes Klingelton-Geraet
    pub ringtone_index: Option<usize>,
    pub sample_rate: u32,
    /// Frames pro Periode
    pub frame_size: usize,
    pub direction: OpenDirection,
    pub plugin: String,
    /// Eigene Echounterdrueckung im Aufnahmepfad
    pub echo_cancel: bool,
}

impl Default for OpenParams {
    fn default() -> Self {
        Self {
            input_index: None,
            output_index: None,
            ringtone_index: None,
            sample_rate: 8000,
            frame_size: 160,
            direction: OpenDirection::Both,
            plugin: "default".to_string(),
            echo_cancel: false,
        }
    }
}

/// Meldungen eines Backends an die Pipeline
#[derive(Debug, Clone, PartialEq)]
pub enum BackendEvent {
    Started,
    Stopped,
    /// Ein Geraet liess sich nicht oeffnen
    DeviceFailed(DeviceError),
    /// Stream wurde auf ein anderes Geraet verschoben
    DeviceMoved {
        richtung: StreamDirection,
        geraet: String,
    },
    /// Echounterdrueckung des aktuellen Geraets hat sich geaendert
    EchoCancel(bool),
    /// Geraeteliste hat sich geaendert
    DevicesChanged,
    /// Verbindung zum Audio-Server verloren; Backend ist unbrauchbar
    ConnectionLost,
}

/// Gemeinsamer Vertrag beider Backend-Varianten
pub trait AudioBackend: Send {
    /// Merkt Parameter vor; geoeffnet wird beim Start
    fn open_device(&mut self, params: OpenParams) -> AudioResult<()>;

    /// Startet alle angeforderten Streams. Schlaegt nur fehl, wenn keine
    /// Richtung geoeffnet werden konnte.
    fn start_stream(&mut self) -> AudioResult<()>;

    fn stop_stream(&mut self) -> AudioResult<()>;

    fn playback_device_list(&self) -> Vec<String>;

    fn capture_device_list(&self) -> Vec<String>;

    /// `"<karte> - <pcm>"` pro Geraet
    fn sound_cards_info(&self, richtung: StreamDirection) -> Vec<String>;

    fn volume(&self) -> Arc<VolumeControl>;

    fn tones(&self) -> Arc<ToneState>;

    /// Fehler der letzten Oeffnung, pro Richtung
    fn device_error(&self) -> Vec<DeviceError>;

    fn is_started(&self) -> bool;

    fn events(&self) -> Receiver<BackendEvent>;
}

/// Sendet ein Ereignis ohne zu blockieren
pub(crate) fn melden(tx: &Sender<BackendEvent>, ereignis: BackendEvent) {
    match tx.try_send(ereignis) {
        Ok(()) | Err(TrySendError::Disconnected(_)) => {}
        Err(TrySendError::Full(e)) => warn!("Ereignis-Kanal voll, verworfen: {:?}", e),
    }
}
