//! Simulierter Audio-Server
//!
//! Callbacks werden gesammelt und im automatischen Modus direkt nach jeder
//! Anfrage zugestellt, sonst erst durch [`SimulatedServer::run_pending`].
//! Zugestellt wird immer ohne gehaltenes Lock.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use fernsprech_core::{Sample, StreamDirection};
use parking_lot::Mutex;

use super::connection::{
    AudioServer, ContextState, OperationId, ServerEvents, StreamHandle, StreamId, StreamSpec,
    StreamState,
};
use crate::device::DeviceDescriptor;
use crate::error::{AudioError, AudioResult};

enum Rueckruf {
    Kontext(ContextState),
    Senke(OperationId, Option<DeviceDescriptor>),
    Quelle(OperationId, Option<DeviceDescriptor>),
    Info(OperationId, String, String),
    Stream(StreamId, StreamState),
    Verschoben(StreamId, String),
    Geaendert,
}

impl Rueckruf {
    fn op(&self) -> Option<OperationId> {
        match self {
            Self::Senke(op, _) | Self::Quelle(op, _) | Self::Info(op, _, _) => Some(*op),
            _ => None,
        }
    }

    fn stream(&self) -> Option<StreamId> {
        match self {
            Self::Stream(id, _) | Self::Verschoben(id, _) => Some(*id),
            _ => None,
        }
    }
}

struct SimStream {
    richtung: StreamDirection,
    rate: u32,
    corked: bool,
}

struct SimInner {
    events: Option<Arc<dyn ServerEvents>>,
    automatisch: bool,
    warteschlange: VecDeque<Rueckruf>,
    naechste_id: u64,
    senken: Vec<DeviceDescriptor>,
    quellen: Vec<DeviceDescriptor>,
    standard_senke: String,
    standard_quelle: String,
    streams: HashMap<StreamId, SimStream>,
    abgebrochen: Vec<OperationId>,
    stream_fehler: HashSet<StreamDirection>,
    abgelehnt: HashSet<StreamDirection>,
    geschrieben: HashMap<StreamDirection, Vec<Sample>>,
    verbindung_fehler: bool,
    rate: Option<u32>,
}

impl Default for SimInner {
    fn default() -> Self {
        Self {
            events: None,
            automatisch: true,
            warteschlange: VecDeque::new(),
            naechste_id: 1,
            senken: Vec::new(),
            quellen: Vec::new(),
            standard_senke: "sim-senke".to_string(),
            standard_quelle: "sim-quelle".to_string(),
            streams: HashMap::new(),
            abgebrochen: Vec::new(),
            stream_fehler: HashSet::new(),
            abgelehnt: HashSet::new(),
            geschrieben: HashMap::new(),
            verbindung_fehler: false,
            rate: None,
        }
    }
}

impl SimInner {
    fn id(&mut self) -> u64 {
        let id = self.naechste_id;
        self.naechste_id += 1;
        id
    }
}

/// Simulierter Server; Klone teilen denselben Zustand
#[derive(Clone, Default)]
pub struct SimulatedServer {
    inner: Arc<Mutex<SimInner>>,
}

impl SimulatedServer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Automatische Zustellung an- oder abschalten
    pub fn set_automatic(&self, an: bool) {
        self.inner.lock().automatisch = an;
    }

    /// Stellt genau einen wartenden Callback zu
    pub fn step(&self) -> bool {
        let naechster = {
            let mut inner = self.inner.lock();
            let Some(events) = inner.events.clone() else {
                return false;
            };
            inner.warteschlange.pop_front().map(|r| (r, events))
        };
        match naechster {
            Some((rueckruf, events)) => {
                zustellen(events.as_ref(), rueckruf);
                true
            }
            None => false,
        }
    }

    /// Stellt alle wartenden Callbacks zu
    pub fn run_pending(&self) {
        while self.step() {}
    }

    fn einreihen(&self, rueckrufe: impl IntoIterator<Item = Rueckruf>) {
        let automatisch = {
            let mut inner = self.inner.lock();
            inner.warteschlange.extend(rueckrufe);
            inner.automatisch
        };
        if automatisch {
            self.run_pending();
        }
    }

    pub fn add_sink(&self, d: DeviceDescriptor) {
        let verbunden = {
            let mut inner = self.inner.lock();
            inner.senken.push(d);
            inner.events.is_some()
        };
        if verbunden {
            self.einreihen([Rueckruf::Geaendert]);
        }
    }

    pub fn add_source(&self, d: DeviceDescriptor) {
        let verbunden = {
            let mut inner = self.inner.lock();
            inner.quellen.push(d);
            inner.events.is_some()
        };
        if verbunden {
            self.einreihen([Rueckruf::Geaendert]);
        }
    }

    pub fn remove_device(&self, name: &str) {
        let verbunden = {
            let mut inner = self.inner.lock();
            inner.senken.retain(|d| d.name != name);
            inner.quellen.retain(|d| d.name != name);
            inner.events.is_some()
        };
        if verbunden {
            self.einreihen([Rueckruf::Geaendert]);
        }
    }

    pub fn set_default_devices(&self, senke: &str, quelle: &str) {
        let mut inner = self.inner.lock();
        inner.standard_senke = senke.to_string();
        inner.standard_quelle = quelle.to_string();
    }

    /// Alle Streams laufen mit dieser Rate statt der angeforderten
    pub fn set_stream_rate(&self, rate: u32) {
        self.inner.lock().rate = Some(rate);
    }

    /// Das naechste `connect` endet im Zustand `Failed`
    pub fn fail_connect(&self) {
        self.inner.lock().verbindung_fehler = true;
    }

    /// Verbindung bricht ab
    pub fn fail_context(&self) {
        self.einreihen([Rueckruf::Kontext(ContextState::Failed)]);
    }

    /// Der naechste Stream dieser Richtung geht in `Failed` statt `Ready`
    pub fn fail_stream(&self, richtung: StreamDirection) {
        self.inner.lock().stream_fehler.insert(richtung);
    }

    /// Der naechste Stream dieser Richtung wird gar nicht erst erzeugt
    pub fn reject_stream(&self, richtung: StreamDirection) {
        self.inner.lock().abgelehnt.insert(richtung);
    }

    /// Verschiebt alle Streams einer Richtung
    pub fn move_streams(&self, richtung: StreamDirection, geraet: &str) {
        let rueckrufe: Vec<Rueckruf> = {
            let inner = self.inner.lock();
            inner
                .streams
                .iter()
                .filter(|(_, s)| s.richtung == richtung)
                .map(|(id, _)| Rueckruf::Verschoben(*id, geraet.to_string()))
                .collect()
        };
        self.einreihen(rueckrufe);
    }

    /// `None`, wenn kein Stream dieser Richtung existiert
    pub fn is_corked(&self, richtung: StreamDirection) -> Option<bool> {
        self.inner
            .lock()
            .streams
            .values()
            .find(|s| s.richtung == richtung)
            .map(|s| s.corked)
    }

    pub fn stream_count(&self) -> usize {
        self.inner.lock().streams.len()
    }

    pub fn cancelled(&self) -> Vec<OperationId> {
        self.inner.lock().abgebrochen.clone()
    }

    /// Fragt `frames` Samples von jedem laufenden Wiedergabe-Stream ab
    pub fn pump(&self, frames: usize) {
        let (events, ziele) = {
            let inner = self.inner.lock();
            let Some(events) = inner.events.clone() else {
                return;
            };
            let ziele: Vec<(StreamId, StreamDirection)> = inner
                .streams
                .iter()
                .filter(|(_, s)| !s.corked && s.richtung != StreamDirection::Capture)
                .map(|(id, s)| (*id, s.richtung))
                .collect();
            (events, ziele)
        };
        for (id, richtung) in ziele {
            let daten = events.writable(id, frames);
            self.inner
                .lock()
                .geschrieben
                .entry(richtung)
                .or_default()
                .extend_from_slice(&daten);
        }
    }

    /// Liefert Mikrofon-Samples an jeden laufenden Aufnahme-Stream
    pub fn feed_capture(&self, samples: &[Sample]) {
        let (events, ziele) = {
            let inner = self.inner.lock();
            let Some(events) = inner.events.clone() else {
                return;
            };
            let ziele: Vec<StreamId> = inner
                .streams
                .iter()
                .filter(|(_, s)| !s.corked && s.richtung == StreamDirection::Capture)
                .map(|(id, _)| *id)
                .collect();
            (events, ziele)
        };
        for id in ziele {
            events.readable(id, samples);
        }
    }

    /// Alles, was bisher in diese Richtung abgespielt wurde
    pub fn written(&self, richtung: StreamDirection) -> Vec<Sample> {
        self.inner
            .lock()
            .geschrieben
            .get(&richtung)
            .cloned()
            .unwrap_or_default()
    }

    pub fn stream_rate(&self, richtung: StreamDirection) -> Option<u32> {
        self.inner
            .lock()
            .streams
            .values()
            .find(|s| s.richtung == richtung)
            .map(|s| s.rate)
    }

    fn verbunden(&self) -> AudioResult<()> {
        if self.inner.lock().events.is_none() {
            return Err(AudioError::Server("Nicht verbunden".into()));
        }
        Ok(())
    }
}

fn zustellen(events: &dyn ServerEvents, rueckruf: Rueckruf) {
    match rueckruf {
        Rueckruf::Kontext(z) => events.context_state(z),
        Rueckruf::Senke(op, d) => events.sink_info(op, d),
        Rueckruf::Quelle(op, d) => events.source_info(op, d),
        Rueckruf::Info(op, s, q) => events.server_info(op, s, q),
        Rueckruf::Stream(id, z) => events.stream_state(id, z),
        Rueckruf::Verschoben(id, g) => events.stream_moved(id, g),
        Rueckruf::Geaendert => events.devices_changed(),
    }
}

impl AudioServer for SimulatedServer {
    fn connect(&mut self, events: Arc<dyn ServerEvents>) -> AudioResult<()> {
        let ende = {
            let mut inner = self.inner.lock();
            inner.events = Some(events);
            if std::mem::take(&mut inner.verbindung_fehler) {
                ContextState::Failed
            } else {
                ContextState::Ready
            }
        };
        self.einreihen([
            Rueckruf::Kontext(ContextState::Connecting),
            Rueckruf::Kontext(ende),
        ]);
        Ok(())
    }

    fn disconnect(&mut self) {
        let events = {
            let mut inner = self.inner.lock();
            inner.streams.clear();
            inner.warteschlange.clear();
            inner.events.take()
        };
        if let Some(events) = events {
            events.context_state(ContextState::Terminated);
        }
    }

    fn request_sinks(&mut self) -> AudioResult<OperationId> {
        self.verbunden()?;
        let (op, rueckrufe) = {
            let mut inner = self.inner.lock();
            let op = inner.id();
            let mut r: Vec<Rueckruf> = inner
                .senken
                .iter()
                .map(|d| Rueckruf::Senke(op, Some(d.clone())))
                .collect();
            r.push(Rueckruf::Senke(op, None));
            (op, r)
        };
        self.einreihen(rueckrufe);
        Ok(op)
    }

    fn request_sources(&mut self) -> AudioResult<OperationId> {
        self.verbunden()?;
        let (op, rueckrufe) = {
            let mut inner = self.inner.lock();
            let op = inner.id();
            let mut r: Vec<Rueckruf> = inner
                .quellen
                .iter()
                .map(|d| Rueckruf::Quelle(op, Some(d.clone())))
                .collect();
            r.push(Rueckruf::Quelle(op, None));
            (op, r)
        };
        self.einreihen(rueckrufe);
        Ok(op)
    }

    fn request_server_info(&mut self) -> AudioResult<OperationId> {
        self.verbunden()?;
        let (op, rueckruf) = {
            let mut inner = self.inner.lock();
            let op = inner.id();
            let r = Rueckruf::Info(
                op,
                inner.standard_senke.clone(),
                inner.standard_quelle.clone(),
            );
            (op, r)
        };
        self.einreihen([rueckruf]);
        Ok(op)
    }

    fn create_stream(&mut self, spec: StreamSpec) -> AudioResult<StreamHandle> {
        self.verbunden()?;
        let (handle, ende) = {
            let mut inner = self.inner.lock();
            if inner.abgelehnt.remove(&spec.richtung) {
                return Err(AudioError::Server(format!(
                    "{}-Stream abgelehnt",
                    spec.richtung
                )));
            }
            let id = inner.id();
            let rate = inner.rate.unwrap_or(spec.rate);
            inner.streams.insert(
                id,
                SimStream {
                    richtung: spec.richtung,
                    rate,
                    corked: true,
                },
            );
            let ende = if inner.stream_fehler.remove(&spec.richtung) {
                StreamState::Failed
            } else {
                StreamState::Ready
            };
            (StreamHandle { id, rate }, ende)
        };
        self.einreihen([
            Rueckruf::Stream(handle.id, StreamState::Creating),
            Rueckruf::Stream(handle.id, ende),
        ]);
        Ok(handle)
    }

    fn set_corked(&mut self, stream: StreamId, corked: bool) -> AudioResult<()> {
        let mut inner = self.inner.lock();
        let s = inner
            .streams
            .get_mut(&stream)
            .ok_or_else(|| AudioError::Server(format!("Unbekannter Stream {}", stream)))?;
        s.corked = corked;
        Ok(())
    }

    fn remove_stream(&mut self, stream: StreamId) {
        let mut inner = self.inner.lock();
        inner.streams.remove(&stream);
        inner.warteschlange.retain(|r| r.stream() != Some(stream));
    }

    fn cancel_operation(&mut self, op: OperationId) {
        let mut inner = self.inner.lock();
        inner.abgebrochen.push(op);
        inner.warteschlange.retain(|r| r.op() != Some(op));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Mitschrift {
        senken: Mutex<Vec<Option<String>>>,
        kontext: Mutex<Vec<ContextState>>,
    }

    impl ServerEvents for Mitschrift {
        fn context_state(&self, zustand: ContextState) {
            self.kontext.lock().push(zustand);
        }
        fn sink_info(&self, _op: OperationId, info: Option<DeviceDescriptor>) {
            self.senken.lock().push(info.map(|d| d.name));
        }
        fn source_info(&self, _op: OperationId, _info: Option<DeviceDescriptor>) {}
        fn server_info(&self, _op: OperationId, _s: String, _q: String) {}
        fn stream_state(&self, _stream: StreamId, _zustand: StreamState) {}
        fn writable(&self, _stream: StreamId, frames: usize) -> Vec<Sample> {
            vec![7; frames]
        }
        fn readable(&self, _stream: StreamId, _samples: &[Sample]) {}
        fn stream_moved(&self, _stream: StreamId, _geraet: String) {}
        fn devices_changed(&self) {}
    }

    #[test]
    fn manuelle_zustellung() {
        let mut sim = SimulatedServer::new();
        sim.set_automatic(false);
        sim.add_sink(DeviceDescriptor::new("a", 8000, 1));
        let m = Arc::new(Mitschrift::default());
        sim.connect(m.clone()).unwrap();
        assert!(m.kontext.lock().is_empty());
        sim.request_sinks().unwrap();
        sim.run_pending();
        assert_eq!(
            *m.kontext.lock(),
            vec![ContextState::Connecting, ContextState::Ready]
        );
        assert_eq!(*m.senken.lock(), vec![Some("a".to_string()), None]);
    }

    #[test]
    fn abgebrochene_anfrage_wird_nicht_zugestellt() {
        let mut sim = SimulatedServer::new();
        let m = Arc::new(Mitschrift::default());
        sim.connect(m.clone()).unwrap();
        sim.set_automatic(false);
        let op = sim.request_sinks().unwrap();
        sim.cancel_operation(op);
        sim.run_pending();
        assert!(m.senken.lock().is_empty());
        assert_eq!(sim.cancelled(), vec![op]);
    }

    #[test]
    fn nur_freigegebene_streams_werden_abgefragt() {
        let mut sim = SimulatedServer::new();
        sim.connect(Arc::new(Mitschrift::default())).unwrap();
        let h = sim
            .create_stream(StreamSpec {
                richtung: StreamDirection::Playback,
                geraet: None,
                rate: 8000,
                frame_size: 160,
            })
            .unwrap();
        sim.pump(10);
        assert!(sim.written(StreamDirection::Playback).is_empty());
        sim.set_corked(h.id, false).unwrap();
        sim.pump(10);
        assert_eq!(sim.written(StreamDirection::Playback), vec![7; 10]);
    }

    #[test]
    fn ohne_verbindung_keine_anfragen() {
        let mut sim = SimulatedServer::new();
        assert!(sim.request_sinks().is_err());
    }
}
