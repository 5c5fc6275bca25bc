//! Schnittstelle zu einem Audio-Server
//!
//! Anfragen gehen ueber [`AudioServer`], Antworten und Daten kommen als
//! Callbacks ueber [`ServerEvents`]. Callbacks duerfen den Server nicht
//! zurueckrufen; sie koennen synchron innerhalb einer Anfrage oder auf einem
//! fremden Thread eintreffen.

use std::sync::Arc;

use fernsprech_core::{Sample, StreamDirection};

use crate::device::DeviceDescriptor;
use crate::error::AudioResult;

pub type OperationId = u64;
pub type StreamId = u64;

/// Zustand der Server-Verbindung
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextState {
    Connecting,
    Ready,
    Failed,
    Terminated,
}

/// Zustand eines Server-Streams
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Unconnected,
    Creating,
    Ready,
    Failed,
    Terminated,
}

impl StreamState {
    pub fn ist_ende(self) -> bool {
        matches!(self, Self::Failed | Self::Terminated)
    }
}

/// Anforderung eines Streams; Streams starten immer angehalten (corked)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamSpec {
    pub richtung: StreamDirection,
    /// `None` = Standardgeraet des Servers
    pub geraet: Option<String>,
    pub rate: u32,
    pub frame_size: usize,
}

/// Vom Server vergebene Kennung und tatsaechliche Rate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamHandle {
    pub id: StreamId,
    pub rate: u32,
}

/// Callbacks vom Server an das Backend
pub trait ServerEvents: Send + Sync {
    fn context_state(&self, zustand: ContextState);

    /// Ein Eintrag der Senkenliste; `None` beendet die Liste
    fn sink_info(&self, op: OperationId, info: Option<DeviceDescriptor>);

    /// Ein Eintrag der Quellenliste; `None` beendet die Liste
    fn source_info(&self, op: OperationId, info: Option<DeviceDescriptor>);

    fn server_info(&self, op: OperationId, standard_senke: String, standard_quelle: String);

    fn stream_state(&self, stream: StreamId, zustand: StreamState);

    /// Server kann `frames` Samples aufnehmen
    fn writable(&self, stream: StreamId, frames: usize) -> Vec<Sample>;

    /// Server liefert Mikrofon-Samples
    fn readable(&self, stream: StreamId, samples: &[Sample]);

    fn stream_moved(&self, stream: StreamId, geraet: String);

    /// Senken oder Quellen wurden hinzugefuegt oder entfernt
    fn devices_changed(&self);
}

/// Verbindung zu einem Audio-Server
pub trait AudioServer: Send {
    fn connect(&mut self, events: Arc<dyn ServerEvents>) -> AudioResult<()>;

    fn disconnect(&mut self);

    fn request_sinks(&mut self) -> AudioResult<OperationId>;

    fn request_sources(&mut self) -> AudioResult<OperationId>;

    fn request_server_info(&mut self) -> AudioResult<OperationId>;

    fn create_stream(&mut self, spec: StreamSpec) -> AudioResult<StreamHandle>;

    fn set_corked(&mut self, stream: StreamId, corked: bool) -> AudioResult<()>;

    fn remove_stream(&mut self, stream: StreamId);

    /// Nach dem Abbruch kommt fuer `op` kein Callback mehr
    fn cancel_operation(&mut self, op: OperationId);
}
