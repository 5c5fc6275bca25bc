//! Server-Backend: Streams eines Audio-Servers, Daten in dessen Callbacks
//!
//! Aufzaehlungen laufen als Anfrage/Callback. Laufende Anfragen werden
//! zusammengefasst, Aufrufer warten begrenzt ueber eine Condvar. Streams
//! werden angehalten erzeugt und erst freigegeben, wenn alle angeforderten
//! Streams bereit sind. Ein Verbindungsverlust macht die Instanz unbrauchbar.

pub mod connection;
pub mod cpal_server;
pub mod sim;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, Sender};
use fernsprech_core::{Sample, StreamDirection};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info, warn};

use super::{melden, AudioBackend, AudioPath, BackendEvent, OpenParams, EVENT_KAPAZITAET};
use crate::device::DeviceDescriptor;
use crate::error::{AudioError, AudioResult, DeviceError};
use crate::pool::RingBufferPool;
use crate::tone::ToneState;
use crate::volume::VolumeControl;

pub use connection::{
    AudioServer, ContextState, OperationId, ServerEvents, StreamHandle, StreamId, StreamSpec,
    StreamState,
};
pub use cpal_server::CpalServer;
pub use sim::SimulatedServer;

/// Obergrenze fuer jedes Warten auf den Server
pub const WARTEZEIT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ListenArt {
    Senken,
    Quellen,
}

#[derive(Default)]
struct Liste {
    eintraege: Vec<DeviceDescriptor>,
    neu: Vec<DeviceDescriptor>,
    laeuft: bool,
    gueltig: bool,
}

#[derive(Default)]
struct StreamEintrag {
    richtung: Option<StreamDirection>,
    zustand: Option<StreamState>,
    rate: u32,
    geraet: Option<String>,
}

struct Zustand {
    kontext: ContextState,
    senken: Liste,
    quellen: Liste,
    info_laeuft: bool,
    standard_senke: String,
    standard_quelle: String,
    offene_ops: HashSet<OperationId>,
    /// Abgeschlossen, bevor die Anfrage angemeldet war
    erledigt: HashSet<OperationId>,
    abgebrochen: HashSet<OperationId>,
    streams: HashMap<StreamId, StreamEintrag>,
    /// Start-Schranke passiert, Streams sind freigegeben
    freigegeben: bool,
    defekt: bool,
    trennen: bool,
}

impl Zustand {
    /// Daten fliessen nur fuer bereite Streams nach der Start-Schranke
    fn datenstrom(&self, stream: StreamId) -> Option<&StreamEintrag> {
        if !self.freigegeben {
            return None;
        }
        self.streams
            .get(&stream)
            .filter(|e| e.zustand == Some(StreamState::Ready))
    }

    fn liste(&mut self, art: ListenArt) -> &mut Liste {
        match art {
            ListenArt::Senken => &mut self.senken,
            ListenArt::Quellen => &mut self.quellen,
        }
    }

    fn op_angemeldet(&mut self, op: OperationId) {
        if !self.erledigt.remove(&op) {
            self.offene_ops.insert(op);
        }
    }

    fn op_erledigt(&mut self, op: OperationId) {
        if !self.offene_ops.remove(&op) {
            self.erledigt.insert(op);
        }
    }
}

/// Gemeinsamer Zustand von Backend und Server-Callbacks
struct Kern {
    zustand: Mutex<Zustand>,
    cv: Condvar,
    in_callback: AtomicUsize,
    pfad: Mutex<Option<AudioPath>>,
    event_tx: Sender<BackendEvent>,
}

/// Zaehlt laufende Callbacks; beim Verlassen wird die Condvar geweckt
struct CallbackWache<'a>(&'a Kern);

impl Drop for CallbackWache<'_> {
    fn drop(&mut self) {
        if self.0.in_callback.fetch_sub(1, Ordering::AcqRel) == 1 {
            let _z = self.0.zustand.lock();
            self.0.cv.notify_all();
        }
    }
}

impl Kern {
    fn betreten(&self) -> CallbackWache<'_> {
        self.in_callback.fetch_add(1, Ordering::AcqRel);
        CallbackWache(self)
    }

    fn listeneintrag(&self, art: ListenArt, op: OperationId, info: Option<DeviceDescriptor>) {
        let _wache = self.betreten();
        let mut z = self.zustand.lock();
        if z.abgebrochen.contains(&op) {
            return;
        }
        match info {
            Some(d) if art == ListenArt::Quellen && d.is_monitor => {
                debug!("Monitor-Quelle uebersprungen: {}", d.name);
            }
            Some(d) => z.liste(art).neu.push(d),
            None => {
                let liste = z.liste(art);
                liste.eintraege = std::mem::take(&mut liste.neu);
                liste.laeuft = false;
                liste.gueltig = true;
                z.op_erledigt(op);
                self.cv.notify_all();
            }
        }
    }

    /// Liefert genau `frames` Samples fuer einen Wiedergabe- oder Klingel-Stream
    fn write_to_speaker(&self, stream: StreamId, frames: usize) -> Vec<Sample> {
        let (richtung, rate, klingel) = {
            let z = self.zustand.lock();
            let Some(e) = z.datenstrom(stream) else {
                return vec![0; frames];
            };
            let klingel = z
                .streams
                .values()
                .any(|e| e.richtung == Some(StreamDirection::Ringtone));
            (e.richtung, e.rate, klingel)
        };
        let mut pfad = self.pfad.lock();
        let Some(pfad) = pfad.as_mut() else {
            return vec![0; frames];
        };
        let mut daten = match richtung {
            Some(StreamDirection::Playback) => pfad.playback(frames, rate, klingel),
            Some(StreamDirection::Ringtone) => pfad.ringtone(frames, rate),
            _ => Vec::new(),
        };
        daten.resize(frames, 0);
        daten
    }

    fn read_from_mic(&self, stream: StreamId, samples: &[Sample]) {
        let rate = {
            let z = self.zustand.lock();
            match z.datenstrom(stream) {
                Some(e) if e.richtung == Some(StreamDirection::Capture) => e.rate,
                _ => return,
            }
        };
        if let Some(pfad) = self.pfad.lock().as_mut() {
            pfad.capture(samples, rate);
        }
    }

    fn echo_cancel_fuer(&self, z: &Zustand, richtung: StreamDirection, geraet: &str) -> bool {
        let liste = match richtung {
            StreamDirection::Capture => &z.quellen.eintraege,
            _ => &z.senken.eintraege,
        };
        liste
            .iter()
            .find(|d| d.name == geraet)
            .map(|d| d.echo_cancel)
            .unwrap_or_else(|| geraet.contains("echo-cancel"))
    }
}

impl ServerEvents for Kern {
    fn context_state(&self, zustand: ContextState) {
        let _wache = self.betreten();
        let verloren = {
            let mut z = self.zustand.lock();
            z.kontext = zustand;
            let verloren = matches!(zustand, ContextState::Failed | ContextState::Terminated)
                && !z.trennen
                && !z.defekt;
            if verloren {
                z.defekt = true;
                z.senken.laeuft = false;
                z.quellen.laeuft = false;
                z.info_laeuft = false;
            }
            self.cv.notify_all();
            verloren
        };
        debug!("Server-Kontext: {:?}", zustand);
        if verloren {
            error!("Verbindung zum Audio-Server verloren");
            melden(&self.event_tx, BackendEvent::ConnectionLost);
        }
    }

    fn sink_info(&self, op: OperationId, info: Option<DeviceDescriptor>) {
        self.listeneintrag(ListenArt::Senken, op, info);
    }

    fn source_info(&self, op: OperationId, info: Option<DeviceDescriptor>) {
        self.listeneintrag(ListenArt::Quellen, op, info);
    }

    fn server_info(&self, op: OperationId, standard_senke: String, standard_quelle: String) {
        let _wache = self.betreten();
        let mut z = self.zustand.lock();
        if z.abgebrochen.contains(&op) {
            return;
        }
        z.standard_senke = standard_senke;
        z.standard_quelle = standard_quelle;
        z.info_laeuft = false;
        z.op_erledigt(op);
        self.cv.notify_all();
    }

    fn stream_state(&self, stream: StreamId, zustand: StreamState) {
        let _wache = self.betreten();
        let mut z = self.zustand.lock();
        let eintrag = z.streams.entry(stream).or_default();
        eintrag.zustand = Some(zustand);
        match zustand {
            StreamState::Ready => debug!("Stream {} bereit", stream),
            StreamState::Failed => warn!("Stream {} fehlgeschlagen", stream),
            _ => {}
        }
        self.cv.notify_all();
    }

    fn writable(&self, stream: StreamId, frames: usize) -> Vec<Sample> {
        let _wache = self.betreten();
        self.write_to_speaker(stream, frames)
    }

    fn readable(&self, stream: StreamId, samples: &[Sample]) {
        let _wache = self.betreten();
        self.read_from_mic(stream, samples);
    }

    fn stream_moved(&self, stream: StreamId, geraet: String) {
        let _wache = self.betreten();
        let (richtung, echo) = {
            let mut z = self.zustand.lock();
            let Some(richtung) = z.streams.get(&stream).and_then(|e| e.richtung) else {
                return;
            };
            let echo = self.echo_cancel_fuer(&z, richtung, &geraet);
            if let Some(e) = z.streams.get_mut(&stream) {
                e.geraet = Some(geraet.clone());
            }
            (richtung, echo)
        };
        if richtung == StreamDirection::Capture {
            if let Some(pfad) = self.pfad.lock().as_mut() {
                pfad.set_external_echo_cancel(echo);
            }
        }
        info!("Stream {} ({}) verschoben nach '{}'", stream, richtung, geraet);
        melden(&self.event_tx, BackendEvent::DeviceMoved { richtung, geraet });
        melden(&self.event_tx, BackendEvent::EchoCancel(echo));
    }

    fn devices_changed(&self) {
        let _wache = self.betreten();
        {
            let mut z = self.zustand.lock();
            for art in [ListenArt::Senken, ListenArt::Quellen] {
                let liste = z.liste(art);
                liste.eintraege.clear();
                liste.gueltig = false;
            }
        }
        debug!("Geraeteliste veraltet");
        melden(&self.event_tx, BackendEvent::DevicesChanged);
    }
}

/// Backend fuer einen Audio-Server
pub struct ServerBackend {
    server: Mutex<Box<dyn AudioServer>>,
    kern: Arc<Kern>,
    pool: Arc<RingBufferPool>,
    volume: Arc<VolumeControl>,
    toene: Arc<ToneState>,
    params: Option<OpenParams>,
    verbunden: bool,
    gestartet: bool,
    fehler: Vec<DeviceError>,
    event_rx: Receiver<BackendEvent>,
}

impl ServerBackend {
    pub fn new(
        server: Box<dyn AudioServer>,
        pool: Arc<RingBufferPool>,
        volume: Arc<VolumeControl>,
        toene: Arc<ToneState>,
    ) -> Self {
        let (event_tx, event_rx) = bounded(EVENT_KAPAZITAET);
        let kern = Arc::new(Kern {
            zustand: Mutex::new(Zustand {
                kontext: ContextState::Connecting,
                senken: Liste::default(),
                quellen: Liste::default(),
                info_laeuft: false,
                standard_senke: String::new(),
                standard_quelle: String::new(),
                offene_ops: HashSet::new(),
                erledigt: HashSet::new(),
                abgebrochen: HashSet::new(),
                streams: HashMap::new(),
                freigegeben: false,
                defekt: false,
                trennen: false,
            }),
            cv: Condvar::new(),
            in_callback: AtomicUsize::new(0),
            pfad: Mutex::new(None),
            event_tx,
        });
        Self {
            server: Mutex::new(server),
            kern,
            pool,
            volume,
            toene,
            params: None,
            verbunden: false,
            gestartet: false,
            fehler: Vec::new(),
            event_rx,
        }
    }

    /// Wartet begrenzt, bis `bedingung` gilt; bricht bei Verbindungsverlust ab
    fn warten(&self, bedingung: impl Fn(&Zustand) -> bool) -> bool {
        let ende = Instant::now() + WARTEZEIT;
        let mut z = self.kern.zustand.lock();
        while !bedingung(&z) {
            if z.defekt {
                return false;
            }
            if self.kern.cv.wait_until(&mut z, ende).timed_out() {
                return bedingung(&z);
            }
        }
        true
    }

    pub fn is_defect(&self) -> bool {
        self.kern.zustand.lock().defekt
    }

    /// Standardgeraete laut Server (Senke, Quelle)
    pub fn default_devices(&self) -> (String, String) {
        let z = self.kern.zustand.lock();
        (z.standard_senke.clone(), z.standard_quelle.clone())
    }

    fn verbinden(&mut self) -> AudioResult<()> {
        if self.is_defect() {
            return Err(AudioError::BackendDefekt);
        }
        if self.verbunden {
            return Ok(());
        }
        let events: Arc<dyn ServerEvents> = Arc::clone(&self.kern) as Arc<dyn ServerEvents>;
        self.server.lock().connect(events)?;
        if !self.warten(|z| z.kontext == ContextState::Ready) {
            return Err(if self.is_defect() {
                AudioError::BackendDefekt
            } else {
                AudioError::Server("Zeitueberschreitung beim Verbinden".into())
            });
        }
        self.verbunden = true;
        info!("Mit Audio-Server verbunden");
        Ok(())
    }

    fn server_info_abfragen(&self) {
        let anfragen = {
            let mut z = self.kern.zustand.lock();
            if z.defekt || z.info_laeuft {
                false
            } else {
                z.info_laeuft = true;
                true
            }
        };
        if anfragen {
            let op = self.server.lock().request_server_info();
            let mut z = self.kern.zustand.lock();
            match op {
                Ok(op) => z.op_angemeldet(op),
                Err(e) => {
                    warn!("Server-Info nicht abfragbar: {}", e);
                    z.info_laeuft = false;
                }
            }
        }
        self.warten(|z| !z.info_laeuft);
    }

    /// Stoesst eine Aufzaehlung an (zusammengefasst) und wartet begrenzt
    fn aufzaehlen(&self, art: ListenArt) -> Vec<DeviceDescriptor> {
        let anfragen = {
            let mut z = self.kern.zustand.lock();
            if z.defekt {
                return Vec::new();
            }
            let liste = z.liste(art);
            if liste.gueltig && !liste.laeuft {
                return liste.eintraege.clone();
            }
            if liste.laeuft {
                false
            } else {
                liste.laeuft = true;
                liste.neu.clear();
                true
            }
        };

        if anfragen {
            let op = {
                let mut server = self.server.lock();
                match art {
                    ListenArt::Senken => server.request_sinks(),
                    ListenArt::Quellen => server.request_sources(),
                }
            };
            let mut z = self.kern.zustand.lock();
            match op {
                Ok(op) => z.op_angemeldet(op),
                Err(e) => {
                    warn!("Aufzaehlung {:?} fehlgeschlagen: {}", art, e);
                    z.liste(art).laeuft = false;
                }
            }
        }

        if !self.warten(|z| match art {
            ListenArt::Senken => !z.senken.laeuft,
            ListenArt::Quellen => !z.quellen.laeuft,
        }) {
            warn!("Aufzaehlung {:?} nicht abgeschlossen", art);
        }
        let mut z = self.kern.zustand.lock();
        z.liste(art).eintraege.clone()
    }

    fn geraet_fuer(&self, art: ListenArt, index: Option<usize>) -> Option<String> {
        match index {
            None | Some(0) => None,
            Some(i) => self.aufzaehlen(art).get(i - 1).map(|d| d.name.clone()),
        }
    }

    fn streams_entfernen(&self, ids: &[StreamId]) {
        let mut server = self.server.lock();
        for &id in ids {
            server.remove_stream(id);
        }
        drop(server);
        let mut z = self.kern.zustand.lock();
        for id in ids {
            z.streams.remove(id);
        }
    }
}

fn namen(liste: Vec<DeviceDescriptor>) -> Vec<String> {
    std::iter::once("default".to_string())
        .chain(liste.into_iter().map(|d| d.name))
        .collect()
}

impl AudioBackend for ServerBackend {
    fn open_device(&mut self, params: OpenParams) -> AudioResult<()> {
        if params.sample_rate == 0 || params.frame_size == 0 {
            return Err(AudioError::Konfiguration(format!(
                "Ungueltige Parameter: {} Hz, {} Frames",
                params.sample_rate, params.frame_size
            )));
        }
        self.verbinden()?;
        self.server_info_abfragen();
        info!(
            "Server-Backend: {} Hz, {} Frames",
            params.sample_rate, params.frame_size
        );
        self.params = Some(params);
        Ok(())
    }

    fn start_stream(&mut self) -> AudioResult<()> {
        if self.is_defect() {
            return Err(AudioError::BackendDefekt);
        }
        if self.gestartet {
            return Ok(());
        }
        let params = self.params.clone().ok_or(AudioError::NichtGeoeffnet)?;
        self.verbinden()?;

        let mut anforderungen = Vec::new();
        if params.direction.playback() {
            let geraet = self.geraet_fuer(ListenArt::Senken, params.output_index);
            anforderungen.push((StreamDirection::Playback, geraet));
        }
        if params.direction.capture() {
            let geraet = self.geraet_fuer(ListenArt::Quellen, params.input_index);
            anforderungen.push((StreamDirection::Capture, geraet));
        }
        if params.ringtone_index.is_some() && params.ringtone_index != params.output_index {
            let geraet = self.geraet_fuer(ListenArt::Senken, params.ringtone_index);
            anforderungen.push((StreamDirection::Ringtone, geraet));
        }

        let mut pfad = AudioPath::new(
            Arc::clone(&self.pool),
            Arc::clone(&self.volume),
            Arc::clone(&self.toene),
        )?;
        pfad.set_echo_cancel(params.echo_cancel);
        let quelle = anforderungen
            .iter()
            .find(|(r, _)| *r == StreamDirection::Capture)
            .map(|(_, g)| g.clone());
        if let Some(quelle) = quelle {
            let z = self.kern.zustand.lock();
            let name = quelle.unwrap_or_else(|| z.standard_quelle.clone());
            pfad.set_external_echo_cancel(self.kern.echo_cancel_fuer(
                &z,
                StreamDirection::Capture,
                &name,
            ));
        }
        *self.kern.pfad.lock() = Some(pfad);

        let mut fehler = Vec::new();
        let mut erstellt: Vec<(StreamId, StreamDirection)> = Vec::new();
        for (richtung, geraet) in anforderungen {
            let spec = StreamSpec {
                richtung,
                geraet: geraet.clone(),
                rate: params.sample_rate,
                frame_size: params.frame_size,
            };
            let ergebnis = self.server.lock().create_stream(spec);
            match ergebnis {
                Ok(h) => {
                    let mut z = self.kern.zustand.lock();
                    let e = z.streams.entry(h.id).or_default();
                    e.richtung = Some(richtung);
                    e.rate = h.rate;
                    e.geraet = geraet;
                    erstellt.push((h.id, richtung));
                }
                Err(e) => {
                    error!("{}-Stream nicht erzeugbar: {}", richtung, e);
                    fehler.push(DeviceError::neu(richtung, e.to_string()));
                }
            }
        }

        // Start-Schranke: alle Streams bereit oder endgueltig gescheitert
        let ids: Vec<StreamId> = erstellt.iter().map(|(id, _)| *id).collect();
        let entschieden = |z: &Zustand, id: &StreamId| {
            z.streams
                .get(id)
                .and_then(|e| e.zustand)
                .map(|s| s == StreamState::Ready || s.ist_ende())
                .unwrap_or(false)
        };
        if !self.warten(|z| ids.iter().all(|id| entschieden(z, id))) {
            warn!("Nicht alle Streams wurden rechtzeitig bereit");
        }

        let mut bereit = Vec::new();
        let mut verworfen = Vec::new();
        {
            let z = self.kern.zustand.lock();
            for (id, richtung) in &erstellt {
                match z.streams.get(id).and_then(|e| e.zustand) {
                    Some(StreamState::Ready) => bereit.push(*id),
                    andere => {
                        let grund = match andere {
                            Some(s) => format!("Stream-Zustand {:?}", s),
                            None => "Zeitueberschreitung".to_string(),
                        };
                        fehler.push(DeviceError::neu(*richtung, grund));
                        verworfen.push(*id);
                    }
                }
            }
        }
        self.streams_entfernen(&verworfen);

        for f in &fehler {
            melden(&self.kern.event_tx, BackendEvent::DeviceFailed(f.clone()));
        }
        self.fehler = fehler;

        if bereit.is_empty() {
            *self.kern.pfad.lock() = None;
            let gruende: Vec<String> = self.fehler.iter().map(|f| f.to_string()).collect();
            return Err(if self.is_defect() {
                AudioError::BackendDefekt
            } else {
                AudioError::KeinGeraet(gruende.join("; "))
            });
        }

        self.kern.zustand.lock().freigegeben = true;
        {
            let mut server = self.server.lock();
            for id in &bereit {
                if let Err(e) = server.set_corked(*id, false) {
                    warn!("Stream {} nicht freigebbar: {}", id, e);
                }
            }
        }
        self.gestartet = true;
        info!("Server-Backend gestartet ({} Streams)", bereit.len());
        melden(&self.kern.event_tx, BackendEvent::Started);
        Ok(())
    }

    fn stop_stream(&mut self) -> AudioResult<()> {
        let (ids, ops) = {
            let z = self.kern.zustand.lock();
            let ids: Vec<StreamId> = z.streams.keys().copied().collect();
            let ops: Vec<OperationId> = z.offene_ops.iter().copied().collect();
            (ids, ops)
        };
        if !self.gestartet && ids.is_empty() && ops.is_empty() {
            return Ok(());
        }

        {
            let mut server = self.server.lock();
            for &op in &ops {
                server.cancel_operation(op);
            }
            for &id in &ids {
                server.remove_stream(id);
            }
        }
        {
            let mut z = self.kern.zustand.lock();
            for op in &ops {
                z.abgebrochen.insert(*op);
                z.offene_ops.remove(op);
            }
            z.streams.clear();
            z.freigegeben = false;
            z.senken.laeuft = false;
            z.quellen.laeuft = false;
            z.info_laeuft = false;
            self.kern.cv.notify_all();
        }

        let kern = Arc::clone(&self.kern);
        if !self.warten(|z| z.offene_ops.is_empty() && kern.in_callback.load(Ordering::Acquire) == 0)
        {
            warn!("Abbau: Callbacks nicht rechtzeitig beendet");
        }
        *self.kern.pfad.lock() = None;

        let war_gestartet = std::mem::replace(&mut self.gestartet, false);
        if war_gestartet {
            melden(&self.kern.event_tx, BackendEvent::Stopped);
            info!("Server-Backend gestoppt");
        }
        Ok(())
    }

    fn playback_device_list(&self) -> Vec<String> {
        namen(self.aufzaehlen(ListenArt::Senken))
    }

    fn capture_device_list(&self) -> Vec<String> {
        namen(self.aufzaehlen(ListenArt::Quellen))
    }

    fn sound_cards_info(&self, richtung: StreamDirection) -> Vec<String> {
        let art = match richtung {
            StreamDirection::Capture => ListenArt::Quellen,
            _ => ListenArt::Senken,
        };
        self.aufzaehlen(art)
            .into_iter()
            .map(|d| d.beschreibung)
            .collect()
    }

    fn volume(&self) -> Arc<VolumeControl> {
        Arc::clone(&self.volume)
    }

    fn tones(&self) -> Arc<ToneState> {
        Arc::clone(&self.toene)
    }

    fn device_error(&self) -> Vec<DeviceError> {
        self.fehler.clone()
    }

    fn is_started(&self) -> bool {
        self.gestartet && !self.is_defect()
    }

    fn events(&self) -> Receiver<BackendEvent> {
        self.event_rx.clone()
    }
}

impl Drop for ServerBackend {
    fn drop(&mut self) {
        if let Err(e) = self.stop_stream() {
            warn!("Stoppen beim Aufraeumen fehlgeschlagen: {}", e);
        }
        self.kern.zustand.lock().trennen = true;
        self.server.lock().disconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend() -> (ServerBackend, SimulatedServer) {
        let sim = SimulatedServer::new();
        let b = ServerBackend::new(
            Box::new(sim.clone()),
            Arc::new(RingBufferPool::default()),
            Arc::new(VolumeControl::default()),
            Arc::new(ToneState::new()),
        );
        (b, sim)
    }

    #[test]
    fn geraetelisten_beginnen_mit_default() {
        let (mut b, sim) = backend();
        sim.add_sink(DeviceDescriptor::new("alsa_output.analog", 48000, 2));
        sim.add_source(DeviceDescriptor::new("alsa_input.analog", 48000, 1));
        sim.add_source(DeviceDescriptor::new("alsa_output.analog.monitor", 48000, 2));
        b.open_device(OpenParams::default()).unwrap();

        assert_eq!(b.playback_device_list(), vec!["default", "alsa_output.analog"]);
        assert_eq!(b.capture_device_list(), vec!["default", "alsa_input.analog"]);
    }

    #[test]
    fn liste_wird_nach_aenderung_neu_aufgezaehlt() {
        let (mut b, sim) = backend();
        b.open_device(OpenParams::default()).unwrap();
        assert_eq!(b.playback_device_list(), vec!["default"]);
        sim.add_sink(DeviceDescriptor::new("usb_headset", 16000, 1));
        assert_eq!(
            b.events().try_iter().last(),
            Some(BackendEvent::DevicesChanged)
        );
        assert_eq!(b.playback_device_list(), vec!["default", "usb_headset"]);
    }

    #[test]
    fn kartenbeschreibung() {
        let (mut b, sim) = backend();
        let mut d = DeviceDescriptor::new("alsa_output.pci", 48000, 2);
        d.beschreibung = "HDA Intel - Analog Stereo".into();
        sim.add_sink(d);
        b.open_device(OpenParams::default()).unwrap();
        assert_eq!(
            b.sound_cards_info(StreamDirection::Playback),
            vec!["HDA Intel - Analog Stereo"]
        );
    }

    #[test]
    fn verbindungsverlust_ist_endgueltig() {
        let (mut b, sim) = backend();
        b.open_device(OpenParams::default()).unwrap();
        b.start_stream().unwrap();
        sim.fail_context();
        assert!(b.is_defect());
        assert!(!b.is_started());
        assert!(b
            .events()
            .try_iter()
            .any(|e| e == BackendEvent::ConnectionLost));
        b.stop_stream().unwrap();
        assert!(matches!(b.start_stream(), Err(AudioError::BackendDefekt)));
    }

    #[test]
    fn verschieben_meldet_echounterdrueckung() {
        let (mut b, sim) = backend();
        sim.add_source(DeviceDescriptor::new("echo-cancel-source", 48000, 1));
        b.open_device(OpenParams::default()).unwrap();
        b.capture_device_list();
        b.start_stream().unwrap();
        let rx = b.events();
        rx.try_iter().for_each(drop);

        sim.move_streams(StreamDirection::Capture, "echo-cancel-source");
        let events: Vec<BackendEvent> = rx.try_iter().collect();
        assert!(events.contains(&BackendEvent::EchoCancel(true)));
        assert!(b
            .kern
            .pfad
            .lock()
            .as_ref()
            .is_some_and(|p| p.external_echo_cancel()));
        assert!(events.contains(&BackendEvent::DeviceMoved {
            richtung: StreamDirection::Capture,
            geraet: "echo-cancel-source".into()
        }));
    }

    #[test]
    fn standardquelle_mit_echounterdrueckung() {
        let (mut b, sim) = backend();
        sim.add_source(DeviceDescriptor::new("echo-cancel-source", 16000, 1));
        sim.set_default_devices("", "echo-cancel-source");
        b.open_device(OpenParams {
            echo_cancel: true,
            ..OpenParams::default()
        })
        .unwrap();
        b.start_stream().unwrap();
        assert!(b
            .kern
            .pfad
            .lock()
            .as_ref()
            .is_some_and(|p| p.external_echo_cancel()));
        b.stop_stream().unwrap();
    }

    #[test]
    fn keine_daten_vor_der_start_schranke() {
        let (b, _sim) = backend();
        let pool = Arc::clone(&b.pool);
        pool.bind_call("call:1", crate::pool::DEFAULT_ID);
        let pfad = AudioPath::new(
            Arc::clone(&pool),
            Arc::clone(&b.volume),
            Arc::clone(&b.toene),
        )
        .unwrap();
        *b.kern.pfad.lock() = Some(pfad);
        {
            let mut z = b.kern.zustand.lock();
            for (id, richtung) in [(7, StreamDirection::Playback), (8, StreamDirection::Capture)] {
                let e = z.streams.entry(id).or_default();
                e.richtung = Some(richtung);
                e.zustand = Some(StreamState::Creating);
                e.rate = 8000;
            }
        }
        pool.put_urgent(&[1000; 160]);

        // Stream noch nicht bereit
        assert_eq!(b.kern.writable(7, 160), vec![0; 160]);
        b.kern.readable(8, &[500; 160]);
        assert_eq!(pool.urgent_available(crate::pool::DEFAULT_ID), 160);
        assert_eq!(pool.available_for_get("call:1"), 0);

        // Bereit, aber Schranke noch nicht passiert
        b.kern.stream_state(7, StreamState::Ready);
        b.kern.stream_state(8, StreamState::Ready);
        assert_eq!(b.kern.writable(7, 160), vec![0; 160]);
        b.kern.readable(8, &[500; 160]);
        assert_eq!(pool.urgent_available(crate::pool::DEFAULT_ID), 160);
        assert_eq!(pool.available_for_get("call:1"), 0);

        b.kern.zustand.lock().freigegeben = true;
        assert_eq!(b.kern.writable(7, 160), vec![1000; 160]);
        b.kern.readable(8, &[500; 160]);
        assert_eq!(pool.urgent_available(crate::pool::DEFAULT_ID), 0);
        assert_eq!(pool.available_for_get("call:1"), 160);
    }

    #[test]
    fn stop_bricht_offene_anfragen_ab() {
        let (mut b, sim) = backend();
        b.open_device(OpenParams::default()).unwrap();
        b.start_stream().unwrap();
        sim.set_automatic(false);
        let op = b.server.lock().request_sinks().unwrap();
        b.kern.zustand.lock().op_angemeldet(op);
        b.stop_stream().unwrap();
        assert!(b.kern.zustand.lock().offene_ops.is_empty());
        assert!(sim.cancelled().contains(&op));
        // Spaete Antwort wird verworfen
        sim.run_pending();
        assert!(!b.kern.zustand.lock().senken.gueltig);
    }
}
