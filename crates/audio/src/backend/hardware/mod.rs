//! Hardware-Backend: PCM-Geraete an einem eigenen Sitzungs-Thread
//!
//! Der Thread wird bei `start_stream` erzeugt und bei `stop_stream`
//! zusammengefuehrt. Er wartet mit 20 ms Timeout auf Kommandos; jeder
//! Timeout ist ein Takt des Hot-Paths.

pub mod cpal_pcm;
pub mod pcm;
pub mod sim;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use fernsprech_core::{Sample, StreamDirection};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use super::{melden, AudioBackend, AudioPath, BackendEvent, OpenParams, EVENT_KAPAZITAET};
use crate::device::device_topology;
use crate::error::{AudioError, AudioResult, DeviceError};
use crate::pool::RingBufferPool;
use crate::tone::ToneState;
use crate::volume::VolumeControl;

pub use cpal_pcm::CpalDriver;
pub use pcm::{PcmDevice, PcmDriver, PcmState, PcmStream};
pub use sim::SimulatedPcmDriver;

/// Takt des Sitzungs-Threads
pub const TAKT: Duration = Duration::from_millis(20);

/// Hoechstens so viele Frames pro Takt von der Aufnahme
const MAX_AUFNAHME_FRAMES: usize = 2048;

/// Kommandos an den Sitzungs-Thread
#[derive(Debug)]
enum SitzungsBefehl {
    Stop,
}

struct Sitzung {
    cmd_tx: Sender<SitzungsBefehl>,
    thread: JoinHandle<()>,
}

/// Backend fuer direkt angesprochene PCM-Geraete
pub struct HardwareBackend {
    treiber: Arc<dyn PcmDriver>,
    pool: Arc<RingBufferPool>,
    volume: Arc<VolumeControl>,
    toene: Arc<ToneState>,
    params: Option<OpenParams>,
    sitzung: Option<Sitzung>,
    fehler: Arc<Mutex<Vec<DeviceError>>>,
    gestartet: Arc<AtomicBool>,
    event_tx: Sender<BackendEvent>,
    event_rx: Receiver<BackendEvent>,
}

impl HardwareBackend {
    pub fn new(
        treiber: Arc<dyn PcmDriver>,
        pool: Arc<RingBufferPool>,
        volume: Arc<VolumeControl>,
        toene: Arc<ToneState>,
    ) -> Self {
        let (event_tx, event_rx) = bounded(EVENT_KAPAZITAET);
        Self {
            treiber,
            pool,
            volume,
            toene,
            params: None,
            sitzung: None,
            fehler: Arc::new(Mutex::new(Vec::new())),
            gestartet: Arc::new(AtomicBool::new(false)),
            event_tx,
            event_rx,
        }
    }

    /// Backend mit cpal-Treiber
    pub fn cpal(
        pool: Arc<RingBufferPool>,
        volume: Arc<VolumeControl>,
        toene: Arc<ToneState>,
    ) -> Self {
        Self::new(Arc::new(CpalDriver::new()), pool, volume, toene)
    }
}

impl AudioBackend for HardwareBackend {
    fn open_device(&mut self, params: OpenParams) -> AudioResult<()> {
        if params.sample_rate == 0 || params.frame_size == 0 {
            return Err(AudioError::Konfiguration(format!(
                "Ungueltige Parameter: {} Hz, {} Frames",
                params.sample_rate, params.frame_size
            )));
        }
        info!(
            "Hardware-Backend: {} Hz, {} Frames, Plugin '{}'",
            params.sample_rate, params.frame_size, params.plugin
        );
        self.params = Some(params);
        Ok(())
    }

    fn start_stream(&mut self) -> AudioResult<()> {
        if self.sitzung.is_some() {
            return Ok(());
        }
        let params = self.params.clone().ok_or(AudioError::NichtGeoeffnet)?;
        let mut pfad = AudioPath::new(
            Arc::clone(&self.pool),
            Arc::clone(&self.volume),
            Arc::clone(&self.toene),
        )?;
        pfad.set_echo_cancel(params.echo_cancel);

        let (cmd_tx, cmd_rx) = bounded::<SitzungsBefehl>(64);
        let (bereit_tx, bereit_rx) = bounded::<Vec<DeviceError>>(1);
        let treiber = Arc::clone(&self.treiber);
        let gestartet = Arc::clone(&self.gestartet);
        let event_tx = self.event_tx.clone();

        let thread = std::thread::Builder::new()
            .name("fernsprech-audio".to_string())
            .spawn(move || {
                sitzungs_thread(treiber, params, pfad, cmd_rx, bereit_tx, gestartet, event_tx);
            })
            .map_err(|e| AudioError::StreamFehler(e.to_string()))?;

        let fehler = bereit_rx.recv().unwrap_or_else(|_| {
            vec![DeviceError::Playback("Sitzungs-Thread beendet".into())]
        });
        for f in &fehler {
            melden(&self.event_tx, BackendEvent::DeviceFailed(f.clone()));
        }
        *self.fehler.lock() = fehler.clone();

        if !self.gestartet.load(Ordering::Acquire) {
            if thread.join().is_err() {
                error!("Sitzungs-Thread ist abgestuerzt");
            }
            let gruende: Vec<String> = fehler.iter().map(|f| f.to_string()).collect();
            return Err(AudioError::KeinGeraet(gruende.join("; ")));
        }

        self.sitzung = Some(Sitzung { cmd_tx, thread });
        melden(&self.event_tx, BackendEvent::Started);
        Ok(())
    }

    fn stop_stream(&mut self) -> AudioResult<()> {
        let Some(sitzung) = self.sitzung.take() else {
            return Ok(());
        };
        if let Err(e) = sitzung.cmd_tx.send(SitzungsBefehl::Stop) {
            warn!("Stop-Kommando nicht zustellbar: {}", e);
        }
        if sitzung.thread.join().is_err() {
            error!("Sitzungs-Thread ist abgestuerzt");
        }
        self.gestartet.store(false, Ordering::Release);
        melden(&self.event_tx, BackendEvent::Stopped);
        info!("Hardware-Backend gestoppt");
        Ok(())
    }

    fn playback_device_list(&self) -> Vec<String> {
        self.treiber.device_names(StreamDirection::Playback)
    }

    fn capture_device_list(&self) -> Vec<String> {
        self.treiber.device_names(StreamDirection::Capture)
    }

    fn sound_cards_info(&self, richtung: StreamDirection) -> Vec<String> {
        self.treiber.card_list(richtung)
    }

    fn volume(&self) -> Arc<VolumeControl> {
        Arc::clone(&self.volume)
    }

    fn tones(&self) -> Arc<ToneState> {
        Arc::clone(&self.toene)
    }

    fn device_error(&self) -> Vec<DeviceError> {
        self.fehler.lock().clone()
    }

    fn is_started(&self) -> bool {
        self.gestartet.load(Ordering::Acquire)
    }

    fn events(&self) -> Receiver<BackendEvent> {
        self.event_rx.clone()
    }
}

impl Drop for HardwareBackend {
    fn drop(&mut self) {
        if let Err(e) = self.stop_stream() {
            warn!("Stoppen beim Aufraeumen fehlgeschlagen: {}", e);
        }
    }
}

// ---------------------------------------------------------------------------
// Sitzungs-Thread
// ---------------------------------------------------------------------------

struct Geraete {
    wiedergabe: Option<PcmStream>,
    aufnahme: Option<PcmStream>,
    klingel: Option<PcmStream>,
}

fn oeffnen(
    treiber: &dyn PcmDriver,
    params: &OpenParams,
    richtung: StreamDirection,
    index: Option<usize>,
    fehler: &mut Vec<DeviceError>,
) -> Option<PcmStream> {
    match PcmStream::open(
        treiber,
        richtung,
        index,
        &params.plugin,
        params.sample_rate,
        params.frame_size,
    ) {
        Ok(s) => Some(s),
        Err(e) => {
            let karte = index.map_or_else(|| "default".to_string(), |i| i.to_string());
            let topologie = device_topology(&params.plugin, &karte, None);
            error!("{}-Geraet '{}' nicht oeffenbar: {}", richtung, topologie, e);
            fehler.push(DeviceError::neu(richtung, format!("{}: {}", topologie, e)));
            None
        }
    }
}

fn sitzungs_thread(
    treiber: Arc<dyn PcmDriver>,
    params: OpenParams,
    mut pfad: AudioPath,
    cmd_rx: Receiver<SitzungsBefehl>,
    bereit_tx: Sender<Vec<DeviceError>>,
    gestartet: Arc<AtomicBool>,
    event_tx: Sender<BackendEvent>,
) {
    let mut fehler = Vec::new();
    let treiber = treiber.as_ref();
    let mut geraete = Geraete {
        wiedergabe: params
            .direction
            .playback()
            .then(|| {
                oeffnen(treiber, &params, StreamDirection::Playback, params.output_index, &mut fehler)
            })
            .flatten(),
        aufnahme: params
            .direction
            .capture()
            .then(|| {
                oeffnen(treiber, &params, StreamDirection::Capture, params.input_index, &mut fehler)
            })
            .flatten(),
        klingel: None,
    };
    if params.ringtone_index.is_some() && params.ringtone_index != params.output_index {
        geraete.klingel = oeffnen(
            treiber,
            &params,
            StreamDirection::Ringtone,
            params.ringtone_index,
            &mut fehler,
        );
    }

    let nutzbar = geraete.wiedergabe.is_some() || geraete.aufnahme.is_some();
    gestartet.store(nutzbar, Ordering::Release);
    if bereit_tx.send(fehler).is_err() {
        debug!("Startmeldung nicht zustellbar, Backend wartet nicht mehr");
    }
    if !nutzbar {
        return;
    }

    if let Some(a) = geraete.aufnahme.as_mut() {
        if let Err(e) = a.start() {
            warn!("Aufnahme-Start fehlgeschlagen: {}", e);
        }
    }
    debug!("Sitzungs-Thread gestartet");

    let mut aufnahme_puffer: Vec<Sample> = vec![0; MAX_AUFNAHME_FRAMES];
    loop {
        match cmd_rx.recv_timeout(TAKT) {
            Ok(SitzungsBefehl::Stop) => break,
            Err(RecvTimeoutError::Timeout) => {
                takt(&mut geraete, &mut pfad, &mut aufnahme_puffer);
            }
            Err(RecvTimeoutError::Disconnected) => {
                warn!("Kommando-Kanal getrennt, beende Sitzung");
                melden(&event_tx, BackendEvent::Stopped);
                break;
            }
        }
    }

    for s in [&mut geraete.wiedergabe, &mut geraete.aufnahme, &mut geraete.klingel]
        .into_iter()
        .flatten()
    {
        s.close();
    }
    debug!("Sitzungs-Thread beendet");
}

fn takt(geraete: &mut Geraete, pfad: &mut AudioPath, aufnahme_puffer: &mut [Sample]) {
    let klingel_geraet = geraete.klingel.is_some();

    if let Some(w) = geraete.wiedergabe.as_mut() {
        let frei = w.avail();
        if frei > 0 {
            let daten = pfad.playback(frei, w.rate(), klingel_geraet);
            w.write(&daten);
        }
    }

    if let Some(k) = geraete.klingel.as_mut() {
        let frei = k.avail();
        if frei > 0 {
            let daten = pfad.ringtone(frei, k.rate());
            k.write(&daten);
        }
    }

    if let Some(a) = geraete.aufnahme.as_mut() {
        let n = a.avail().min(aufnahme_puffer.len());
        if n > 0 {
            let gelesen = a.read(&mut aufnahme_puffer[..n]);
            pfad.capture(&aufnahme_puffer[..gelesen], a.rate());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::DEFAULT_ID;
    use std::time::Instant;

    fn backend(treiber: &SimulatedPcmDriver) -> (HardwareBackend, Arc<RingBufferPool>) {
        let pool = Arc::new(RingBufferPool::default());
        let b = HardwareBackend::new(
            Arc::new(treiber.clone()),
            Arc::clone(&pool),
            Arc::new(VolumeControl::default()),
            Arc::new(ToneState::new()),
        );
        (b, pool)
    }

    fn warten_bis(mut bedingung: impl FnMut() -> bool) -> bool {
        let ende = Instant::now() + Duration::from_secs(2);
        while Instant::now() < ende {
            if bedingung() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn start_ohne_oeffnen() {
        let (mut b, _) = backend(&SimulatedPcmDriver::new());
        assert!(matches!(b.start_stream(), Err(AudioError::NichtGeoeffnet)));
    }

    #[test]
    fn ungueltige_parameter() {
        let (mut b, _) = backend(&SimulatedPcmDriver::new());
        let params = OpenParams {
            frame_size: 0,
            ..OpenParams::default()
        };
        assert!(b.open_device(params).is_err());
    }

    #[test]
    fn start_und_stop() {
        let treiber = SimulatedPcmDriver::new();
        let (mut b, _) = backend(&treiber);
        b.open_device(OpenParams::default()).unwrap();
        b.start_stream().unwrap();
        assert!(b.is_started());
        assert!(b.device_error().is_empty());
        assert!(warten_bis(|| !treiber.written(StreamDirection::Playback).is_empty()));
        b.stop_stream().unwrap();
        assert!(!b.is_started());

        let events: Vec<BackendEvent> = b.events().try_iter().collect();
        assert_eq!(events, vec![BackendEvent::Started, BackendEvent::Stopped]);
    }

    #[test]
    fn nichts_oeffenbar() {
        let treiber = SimulatedPcmDriver::new();
        treiber.fail_open(StreamDirection::Playback);
        treiber.fail_open(StreamDirection::Capture);
        let (mut b, _) = backend(&treiber);
        b.open_device(OpenParams::default()).unwrap();
        assert!(matches!(b.start_stream(), Err(AudioError::KeinGeraet(_))));
        assert!(!b.is_started());
        assert_eq!(b.device_error().len(), 2);
    }

    #[test]
    fn fehler_nennt_geraetetopologie() {
        let treiber = SimulatedPcmDriver::new();
        treiber.fail_open(StreamDirection::Capture);
        let (mut b, _) = backend(&treiber);
        b.open_device(OpenParams {
            input_index: Some(1),
            plugin: "plughw".into(),
            ..OpenParams::default()
        })
        .unwrap();
        b.start_stream().unwrap();
        let fehler = b.device_error();
        assert_eq!(fehler.len(), 1);
        assert!(fehler[0].to_string().contains("plughw:1"), "{}", fehler[0]);
        b.stop_stream().unwrap();
    }

    #[test]
    fn nur_wiedergabe_angefordert() {
        let treiber = SimulatedPcmDriver::new();
        let (mut b, _) = backend(&treiber);
        b.open_device(OpenParams {
            direction: super::super::OpenDirection::Playback,
            ..OpenParams::default()
        })
        .unwrap();
        b.start_stream().unwrap();
        assert_eq!(treiber.opened(), vec![StreamDirection::Playback]);
        b.stop_stream().unwrap();
    }

    #[test]
    fn aufnahme_in_den_pool() {
        let treiber = SimulatedPcmDriver::new();
        let (mut b, pool) = backend(&treiber);
        pool.bind_call("call:1", DEFAULT_ID);
        b.open_device(OpenParams::default()).unwrap();
        b.start_stream().unwrap();
        treiber.feed_capture(&[800; 320]);
        let rb = pool.ring_buffer(DEFAULT_ID).unwrap();
        assert!(warten_bis(|| rb.available_for_get("call:1") == 320));
        b.stop_stream().unwrap();
    }
}
