//! Audio-Server ueber den cpal-Host des Systems
//!
//! cpal-Streams sind nicht `Send`; Host und Streams gehoeren daher einem
//! eigenen Ereignis-Thread. Anfragen gehen als Befehle an diesen Thread,
//! Antworten kommen als Callbacks. Der Thread prueft zyklisch Geraeteliste
//! und Standardgeraete und meldet Aenderungen.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, Host, SizedSample, Stream, StreamConfig};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use fernsprech_core::{Sample, StreamDirection};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use super::connection::{
    AudioServer, ContextState, OperationId, ServerEvents, StreamHandle, StreamId, StreamSpec,
    StreamState,
};
use crate::backend::hardware::cpal_pcm::konfiguration;
use crate::device::{list_input_devices, list_output_devices, DeviceDescriptor};
use crate::error::{AudioError, AudioResult};

/// Abstand der Geraete-Pruefung
const ABFRAGE: Duration = Duration::from_secs(1);

enum Befehl {
    Senken(OperationId),
    Quellen(OperationId),
    Info(OperationId),
    Erzeugen(StreamId, StreamSpec, Sender<AudioResult<u32>>),
    Korken(StreamId, bool, Sender<AudioResult<()>>),
    Entfernen(StreamId, Sender<()>),
    Beenden,
}

/// Verbindung zum cpal-Host
#[derive(Default)]
pub struct CpalServer {
    befehle: Option<Sender<Befehl>>,
    thread: Option<JoinHandle<()>>,
    abgebrochen: Arc<Mutex<HashSet<OperationId>>>,
    naechste_id: AtomicU64,
}

impl CpalServer {
    pub fn new() -> Self {
        Self::default()
    }

    fn id(&self) -> u64 {
        self.naechste_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn senden(&self, befehl: Befehl) -> AudioResult<()> {
        self.befehle
            .as_ref()
            .ok_or_else(|| AudioError::Server("Nicht verbunden".into()))?
            .send(befehl)
            .map_err(|_| AudioError::Server("Ereignis-Thread beendet".into()))
    }
}

impl AudioServer for CpalServer {
    fn connect(&mut self, events: Arc<dyn ServerEvents>) -> AudioResult<()> {
        if self.befehle.is_some() {
            return Ok(());
        }
        let (tx, rx) = bounded(64);
        let abgebrochen = Arc::clone(&self.abgebrochen);
        let thread = thread::Builder::new()
            .name("fernsprech-server".into())
            .spawn(move || EreignisSchleife::new(events, abgebrochen).laufen(rx))
            .map_err(|e| AudioError::Server(format!("Thread nicht startbar: {}", e)))?;
        self.befehle = Some(tx);
        self.thread = Some(thread);
        Ok(())
    }

    fn disconnect(&mut self) {
        if let Some(tx) = self.befehle.take() {
            if tx.send(Befehl::Beenden).is_err() {
                debug!("Ereignis-Schleife bereits beendet");
            }
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("Ereignis-Thread ist abgestuerzt");
            }
        }
    }

    fn request_sinks(&mut self) -> AudioResult<OperationId> {
        let op = self.id();
        self.senden(Befehl::Senken(op))?;
        Ok(op)
    }

    fn request_sources(&mut self) -> AudioResult<OperationId> {
        let op = self.id();
        self.senden(Befehl::Quellen(op))?;
        Ok(op)
    }

    fn request_server_info(&mut self) -> AudioResult<OperationId> {
        let op = self.id();
        self.senden(Befehl::Info(op))?;
        Ok(op)
    }

    fn create_stream(&mut self, spec: StreamSpec) -> AudioResult<StreamHandle> {
        let id = self.id();
        let (tx, rx) = bounded(1);
        self.senden(Befehl::Erzeugen(id, spec, tx))?;
        let rate = rx
            .recv()
            .map_err(|_| AudioError::Server("Keine Antwort".into()))??;
        Ok(StreamHandle { id, rate })
    }

    fn set_corked(&mut self, stream: StreamId, corked: bool) -> AudioResult<()> {
        let (tx, rx) = bounded(1);
        self.senden(Befehl::Korken(stream, corked, tx))?;
        rx.recv()
            .map_err(|_| AudioError::Server("Keine Antwort".into()))?
    }

    fn remove_stream(&mut self, stream: StreamId) {
        let (tx, rx) = bounded(1);
        if self.senden(Befehl::Entfernen(stream, tx)).is_ok() {
            if rx.recv().is_err() {
                debug!("Keine Bestaetigung fuer das Entfernen von Stream {}", stream);
            }
        }
    }

    fn cancel_operation(&mut self, op: OperationId) {
        self.abgebrochen.lock().insert(op);
    }
}

impl Drop for CpalServer {
    fn drop(&mut self) {
        self.disconnect();
    }
}

// ---------------------------------------------------------------------------
// Ereignis-Thread
// ---------------------------------------------------------------------------

struct AktiverStream {
    stream: Stream,
    spec: StreamSpec,
    rate: u32,
    corked: bool,
}

struct EreignisSchleife {
    host: Host,
    events: Arc<dyn ServerEvents>,
    abgebrochen: Arc<Mutex<HashSet<OperationId>>>,
    streams: HashMap<StreamId, AktiverStream>,
    bekannte_geraete: Vec<String>,
    standard_ausgabe: Option<String>,
    standard_eingabe: Option<String>,
}

impl EreignisSchleife {
    fn new(events: Arc<dyn ServerEvents>, abgebrochen: Arc<Mutex<HashSet<OperationId>>>) -> Self {
        Self {
            host: cpal::default_host(),
            events,
            abgebrochen,
            streams: HashMap::new(),
            bekannte_geraete: Vec::new(),
            standard_ausgabe: None,
            standard_eingabe: None,
        }
    }

    fn laufen(mut self, rx: Receiver<Befehl>) {
        self.events.context_state(ContextState::Connecting);
        self.bekannte_geraete = self.geraetenamen();
        self.standard_ausgabe = self.host.default_output_device().and_then(|d| d.name().ok());
        self.standard_eingabe = self.host.default_input_device().and_then(|d| d.name().ok());
        info!("cpal-Host '{}' bereit", self.host.id().name());
        self.events.context_state(ContextState::Ready);

        loop {
            match rx.recv_timeout(ABFRAGE) {
                Ok(Befehl::Beenden) | Err(RecvTimeoutError::Disconnected) => break,
                Ok(befehl) => self.ausfuehren(befehl),
                Err(RecvTimeoutError::Timeout) => self.geraete_pruefen(),
            }
        }

        self.streams.clear();
        self.events.context_state(ContextState::Terminated);
        debug!("Ereignis-Thread beendet");
    }

    fn gueltig(&self, op: OperationId) -> bool {
        !self.abgebrochen.lock().remove(&op)
    }

    fn ausfuehren(&mut self, befehl: Befehl) {
        match befehl {
            Befehl::Senken(op) => {
                let liste = list_output_devices(&self.host).unwrap_or_else(|e| {
                    warn!("Senken nicht abrufbar: {}", e);
                    Vec::new()
                });
                self.liste_melden(op, liste, |ev, op, d| ev.sink_info(op, d));
            }
            Befehl::Quellen(op) => {
                let liste = list_input_devices(&self.host).unwrap_or_else(|e| {
                    warn!("Quellen nicht abrufbar: {}", e);
                    Vec::new()
                });
                self.liste_melden(op, liste, |ev, op, d| ev.source_info(op, d));
            }
            Befehl::Info(op) => {
                if self.gueltig(op) {
                    self.events.server_info(
                        op,
                        self.standard_ausgabe.clone().unwrap_or_default(),
                        self.standard_eingabe.clone().unwrap_or_default(),
                    );
                }
            }
            Befehl::Erzeugen(id, spec, antwort) => {
                let ergebnis = self.stream_bauen(id, &spec);
                let antwort_wert = match ergebnis {
                    Ok((stream, rate)) => {
                        self.streams.insert(
                            id,
                            AktiverStream {
                                stream,
                                spec,
                                rate,
                                corked: true,
                            },
                        );
                        Ok(rate)
                    }
                    Err(e) => Err(e),
                };
                let bereit = antwort_wert.is_ok();
                if antwort.send(antwort_wert).is_err() {
                    debug!("Antwort fuer Stream {} nicht zustellbar", id);
                }
                if bereit {
                    self.events.stream_state(id, StreamState::Creating);
                    self.events.stream_state(id, StreamState::Ready);
                }
            }
            Befehl::Korken(id, corked, antwort) => {
                let ergebnis = match self.streams.get_mut(&id) {
                    Some(s) => {
                        s.corked = corked;
                        if corked {
                            s.stream
                                .pause()
                                .map_err(|e| AudioError::StreamFehler(e.to_string()))
                        } else {
                            s.stream
                                .play()
                                .map_err(|e| AudioError::StreamFehler(e.to_string()))
                        }
                    }
                    None => Err(AudioError::Server(format!("Unbekannter Stream {}", id))),
                };
                if antwort.send(ergebnis).is_err() {
                    debug!("Antwort fuer Stream {} nicht zustellbar", id);
                }
            }
            Befehl::Entfernen(id, antwort) => {
                if self.streams.remove(&id).is_some() {
                    self.events.stream_state(id, StreamState::Terminated);
                }
                if antwort.send(()).is_err() {
                    debug!("Antwort fuer Stream {} nicht zustellbar", id);
                }
            }
            Befehl::Beenden => {}
        }
    }

    fn liste_melden(
        &self,
        op: OperationId,
        liste: Vec<DeviceDescriptor>,
        melden: impl Fn(&dyn ServerEvents, OperationId, Option<DeviceDescriptor>),
    ) {
        if !self.gueltig(op) {
            return;
        }
        let karte = self.host.id().name();
        for mut d in liste {
            d.beschreibung = format!("{} - {}", karte, d.name);
            melden(self.events.as_ref(), op, Some(d));
        }
        melden(self.events.as_ref(), op, None);
    }

    fn geraetenamen(&self) -> Vec<String> {
        let mut namen: Vec<String> = list_output_devices(&self.host)
            .into_iter()
            .chain(list_input_devices(&self.host))
            .flatten()
            .map(|d| d.name)
            .collect();
        namen.sort();
        namen
    }

    fn geraet_suchen(&self, richtung: StreamDirection, name: Option<&str>) -> AudioResult<Device> {
        let eingabe = richtung == StreamDirection::Capture;
        let Some(name) = name else {
            let standard = if eingabe {
                self.host.default_input_device()
            } else {
                self.host.default_output_device()
            };
            return standard
                .ok_or_else(|| AudioError::GeraetNichtGefunden(format!("Standard {}", richtung)));
        };
        let passt = |d: &Device| d.name().map(|n| n == name).unwrap_or(false);
        let gefunden = if eingabe {
            self.host
                .input_devices()
                .map_err(|e| AudioError::StreamFehler(e.to_string()))?
                .find(passt)
        } else {
            self.host
                .output_devices()
                .map_err(|e| AudioError::StreamFehler(e.to_string()))?
                .find(passt)
        };
        gefunden.ok_or_else(|| AudioError::GeraetNichtGefunden(name.to_string()))
    }

    fn stream_bauen(&self, id: StreamId, spec: &StreamSpec) -> AudioResult<(Stream, u32)> {
        let device = self.geraet_suchen(spec.richtung, spec.geraet.as_deref())?;
        let eingabe = spec.richtung == StreamDirection::Capture;
        let (config, format) = konfiguration(&device, eingabe, spec.rate)
            .map_err(|e| AudioError::StreamFehler(e.to_string()))?;
        let events = Arc::clone(&self.events);

        let stream = if eingabe {
            match format {
                cpal::SampleFormat::F32 => eingabe_bauen::<f32>(&device, &config, id, events, |x| x)?,
                cpal::SampleFormat::I16 => {
                    eingabe_bauen::<i16>(&device, &config, id, events, |x| x as f32 / 32768.0)?
                }
                cpal::SampleFormat::U16 => eingabe_bauen::<u16>(&device, &config, id, events, |x| {
                    (x as f32 - 32768.0) / 32768.0
                })?,
                anderes => {
                    return Err(AudioError::StreamFehler(format!(
                        "Nicht unterstuetztes Sample-Format: {:?}",
                        anderes
                    )))
                }
            }
        } else {
            match format {
                cpal::SampleFormat::F32 => {
                    ausgabe_bauen::<f32>(&device, &config, id, events, |s| s as f32 / 32768.0)?
                }
                cpal::SampleFormat::I16 => ausgabe_bauen::<i16>(&device, &config, id, events, |s| s)?,
                cpal::SampleFormat::U16 => ausgabe_bauen::<u16>(&device, &config, id, events, |s| {
                    (s as i32 + 32768) as u16
                })?,
                anderes => {
                    return Err(AudioError::StreamFehler(format!(
                        "Nicht unterstuetztes Sample-Format: {:?}",
                        anderes
                    )))
                }
            }
        };
        // Streams beginnen angehalten
        if let Err(e) = stream.pause() {
            warn!("Stream {} nicht pausierbar: {}", id, e);
        }
        Ok((stream, config.sample_rate.0))
    }

    /// Meldet neue oder entfernte Geraete und folgt dem Standardgeraet
    fn geraete_pruefen(&mut self) {
        let namen = self.geraetenamen();
        if namen != self.bekannte_geraete {
            self.bekannte_geraete = namen;
            self.events.devices_changed();
        }

        let ausgabe = self.host.default_output_device().and_then(|d| d.name().ok());
        if ausgabe.is_some() && ausgabe != self.standard_ausgabe {
            self.standard_ausgabe = ausgabe.clone();
            self.standard_folgen(false, ausgabe);
        }
        let eingabe = self.host.default_input_device().and_then(|d| d.name().ok());
        if eingabe.is_some() && eingabe != self.standard_eingabe {
            self.standard_eingabe = eingabe.clone();
            self.standard_folgen(true, eingabe);
        }
    }

    fn standard_folgen(&mut self, eingabe: bool, neu: Option<String>) {
        let Some(neu) = neu else { return };
        let betroffen: Vec<StreamId> = self
            .streams
            .iter()
            .filter(|(_, s)| {
                s.spec.geraet.is_none() && (s.spec.richtung == StreamDirection::Capture) == eingabe
            })
            .map(|(id, _)| *id)
            .collect();

        for id in betroffen {
            let Some(alt) = self.streams.get(&id) else { continue };
            let spec = alt.spec.clone();
            let (rate_alt, corked) = (alt.rate, alt.corked);
            match self.stream_bauen(id, &spec) {
                Ok((stream, rate)) if rate == rate_alt => {
                    if !corked {
                        if let Err(e) = stream.play() {
                            warn!("Verschobener Stream {} startet nicht: {}", id, e);
                        }
                    }
                    self.streams.insert(
                        id,
                        AktiverStream {
                            stream,
                            spec,
                            rate,
                            corked,
                        },
                    );
                    self.events.stream_moved(id, neu.clone());
                }
                Ok((_, rate)) => warn!(
                    "Stream {} bleibt: neues Standardgeraet laeuft mit {} statt {} Hz",
                    id, rate, rate_alt
                ),
                Err(e) => warn!("Stream {} nicht verschiebbar: {}", id, e),
            }
        }
    }
}

fn ausgabe_bauen<T>(
    device: &Device,
    config: &StreamConfig,
    id: StreamId,
    events: Arc<dyn ServerEvents>,
    wandeln: fn(Sample) -> T,
) -> AudioResult<Stream>
where
    T: SizedSample + Send + 'static,
{
    let kanaele = config.channels.max(1) as usize;
    let fehler_events = Arc::clone(&events);
    device
        .build_output_stream(
            config,
            move |data: &mut [T], _| {
                let samples = events.writable(id, data.len() / kanaele);
                let mut quelle = samples.iter().copied();
                for frame in data.chunks_mut(kanaele) {
                    frame.fill(wandeln(quelle.next().unwrap_or(0)));
                }
            },
            move |err| {
                error!("Stream {}: {}", id, err);
                fehler_events.stream_state(id, StreamState::Failed);
            },
            None,
        )
        .map_err(|e| AudioError::StreamFehler(e.to_string()))
}

fn eingabe_bauen<T>(
    device: &Device,
    config: &StreamConfig,
    id: StreamId,
    events: Arc<dyn ServerEvents>,
    wandeln: fn(T) -> f32,
) -> AudioResult<Stream>
where
    T: SizedSample + Send + 'static,
{
    let kanaele = config.channels.max(1) as usize;
    let fehler_events = Arc::clone(&events);
    let mut mono: Vec<Sample> = Vec::new();
    device
        .build_input_stream(
            config,
            move |data: &[T], _| {
                mono.clear();
                mono.extend(data.chunks(kanaele).map(|frame| {
                    let summe: f32 = frame.iter().map(|&x| wandeln(x)).sum();
                    (summe / frame.len() as f32 * 32767.0)
                        .clamp(Sample::MIN as f32, Sample::MAX as f32) as Sample
                }));
                events.readable(id, &mono);
            },
            move |err| {
                error!("Stream {}: {}", id, err);
                fehler_events.stream_state(id, StreamState::Failed);
            },
            None,
        )
        .map_err(|e| AudioError::StreamFehler(e.to_string()))
}
