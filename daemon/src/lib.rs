//! fernsprech-daemon – Bibliotheks-Root
//!
//! Baut Codec-Registry, Ringpuffer-Pool und das konfigurierte Backend
//! zusammen, verwaltet Anruf-Bindungen und Aufnahmen und leitet
//! Backend-Ereignisse ins Log weiter.

pub mod config;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{Context, Result};
use crossbeam_channel::{Receiver, RecvTimeoutError};
use fernsprech_audio::backend::server::AudioServer;
use fernsprech_audio::{
    recording_file_name, AudioBackend, BackendEvent, CallRecorder, CpalServer, DtmfGenerator,
    HardwareBackend, RingBufferPool, ServerBackend, SimulatedServer, ToneState, VolumeControl,
    DEFAULT_ID,
};
use fernsprech_codec::{search_paths, CodecInstance, CodecRegistry, StaticLoader};
use fernsprech_core::{CallId, FernsprechError, PayloadTyp};
use parking_lot::Mutex;
use tracing::{error, info, warn};

use config::{AudioEinstellungen, BackendArt, DaemonConfig};

/// Erzeugt eine frische Server-Verbindung
pub type ServerFabrik = Arc<dyn Fn() -> Box<dyn AudioServer> + Send + Sync>;

type GeteiltesBackend = Arc<Mutex<Box<dyn AudioBackend>>>;
type Aufnahmen = Arc<Mutex<HashMap<CallId, CallRecorder>>>;

/// Pruefintervall des Weiterleitungs-Threads fuer das Stopp-Flag
const EREIGNIS_TIMEOUT: Duration = Duration::from_millis(100);

/// Was ein Backend beim Bau braucht
#[derive(Clone)]
struct Bausteine {
    audio: AudioEinstellungen,
    pool: Arc<RingBufferPool>,
    volume: Arc<VolumeControl>,
    toene: Arc<ToneState>,
    fabrik: Option<ServerFabrik>,
}

impl Bausteine {
    fn backend_bauen(&self) -> Box<dyn AudioBackend> {
        let (pool, volume, toene) = (
            Arc::clone(&self.pool),
            Arc::clone(&self.volume),
            Arc::clone(&self.toene),
        );
        match &self.fabrik {
            Some(fabrik) => Box::new(ServerBackend::new(fabrik(), pool, volume, toene)),
            None => Box::new(HardwareBackend::cpal(pool, volume, toene)),
        }
    }
}

/// Laufender Daemon
pub struct Daemon {
    config: DaemonConfig,
    registry: Arc<CodecRegistry>,
    bausteine: Bausteine,
    backend: GeteiltesBackend,
    aufnahmen: Aufnahmen,
    weiterleitung: Option<JoinHandle<()>>,
    stopp: Arc<AtomicBool>,
    neuaufbauten: Arc<AtomicUsize>,
}

impl Daemon {
    /// Baut den Daemon aus der Konfiguration
    pub fn neu(config: DaemonConfig) -> Result<Self> {
        let fabrik: Option<ServerFabrik> = match config.audio.backend {
            BackendArt::Hardware => None,
            BackendArt::Server => {
                Some(Arc::new(|| Box::new(CpalServer::new()) as Box<dyn AudioServer>))
            }
            BackendArt::Null => {
                Some(Arc::new(|| Box::new(SimulatedServer::new()) as Box<dyn AudioServer>))
            }
        };
        Self::mit_fabrik(config, fabrik)
    }

    /// Wie [`Daemon::neu`], aber mit eigener Server-Fabrik (`None` = Hardware)
    pub fn mit_fabrik(config: DaemonConfig, fabrik: Option<ServerFabrik>) -> Result<Self> {
        let registry = Arc::new(CodecRegistry::neu(Arc::new(StaticLoader::eingebaut())));
        registry.scan(&search_paths(&config.codecs.verzeichnisse));
        if !config.codecs.reihenfolge.is_empty() {
            let uebernommen = registry.save_active_codecs(&config.codecs.reihenfolge);
            info!(reihenfolge = ?uebernommen, "Codec-Reihenfolge uebernommen");
        }

        let pool = Arc::new(RingBufferPool::new(config.ringpuffer.pool_config()));
        pool.set_internal_sampling_rate(config.audio.abtastrate);
        let volume = Arc::new(VolumeControl::new(
            config.audio.capture_gain,
            config.audio.playback_gain,
        ));

        let bausteine = Bausteine {
            audio: config.audio.clone(),
            pool,
            volume,
            toene: Arc::new(ToneState::new()),
            fabrik,
        };
        let backend: GeteiltesBackend = Arc::new(Mutex::new(bausteine.backend_bauen()));

        Ok(Self {
            config,
            registry,
            bausteine,
            backend,
            aufnahmen: Arc::new(Mutex::new(HashMap::new())),
            weiterleitung: None,
            stopp: Arc::new(AtomicBool::new(false)),
            neuaufbauten: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn config(&self) -> &DaemonConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<CodecRegistry> {
        &self.registry
    }

    pub fn pool(&self) -> &Arc<RingBufferPool> {
        &self.bausteine.pool
    }

    pub fn tones(&self) -> &Arc<ToneState> {
        &self.bausteine.toene
    }

    pub fn is_started(&self) -> bool {
        self.backend.lock().is_started()
    }

    /// Wie oft das Backend nach Verbindungsverlust neu aufgebaut wurde
    pub fn reconnects(&self) -> usize {
        self.neuaufbauten.load(Ordering::Acquire)
    }

    /// Oeffnet und startet das Backend, startet die Ereignis-Weiterleitung
    pub fn starten(&mut self) -> Result<()> {
        let events = {
            let mut backend = self.backend.lock();
            backend
                .open_device(self.bausteine.audio.open_params())
                .context("Geraete konnten nicht geoeffnet werden")?;
            backend
                .start_stream()
                .context("Audio-Streams konnten nicht gestartet werden")?;
            for fehler in backend.device_error() {
                warn!(richtung = %fehler.richtung(), "Geraet nicht verfuegbar: {}", fehler);
            }
            backend.events()
        };

        self.stopp.store(false, Ordering::Release);
        let weiterleitung = Weiterleitung {
            backend: Arc::clone(&self.backend),
            bausteine: self.bausteine.clone(),
            aufnahmen: Arc::clone(&self.aufnahmen),
            stopp: Arc::clone(&self.stopp),
            neuaufbauten: Arc::clone(&self.neuaufbauten),
        };
        let thread = std::thread::Builder::new()
            .name("fernsprech-events".into())
            .spawn(move || weiterleitung.laufen(events))
            .context("Ereignis-Thread konnte nicht gestartet werden")?;
        self.weiterleitung = Some(thread);

        info!(
            backend = ?self.config.audio.backend,
            abtastrate = self.config.audio.abtastrate,
            codecs = self.registry.anzahl(),
            "Media-Engine gestartet"
        );
        Ok(())
    }

    /// Schreibt eine DTMF-Ziffer in den dringenden Puffer
    pub fn send_dtmf(&self, ziffer: char) -> Result<()> {
        DtmfGenerator::new(self.bausteine.pool.internal_sampling_rate())
            .send(&self.bausteine.pool, ziffer)?;
        Ok(())
    }

    /// Neue Codec-Instanz fuer eine Sitzung
    pub fn codec_instanz(&self, payload: PayloadTyp) -> fernsprech_core::Result<CodecInstance> {
        self.registry
            .instantiate_codec(payload)
            .ok_or(FernsprechError::CodecNichtGefunden(payload))
    }

    // -----------------------------------------------------------------------
    // Anrufe
    // -----------------------------------------------------------------------

    /// Verbindet einen Anruf mit Mikrofon und Lautsprecher
    pub fn anruf_binden(&self, anruf: &CallId) -> Result<()> {
        self.bausteine.pool.bind_call(&anruf.to_string(), DEFAULT_ID);
        if self.config.aufnahme.immer && !self.is_recording(anruf) {
            self.aufnahme_starten(anruf)?;
        }
        Ok(())
    }

    /// Loest den Anruf, beendet seine Aufnahme und verwirft seinen Puffer
    pub fn anruf_loesen(&self, anruf: &CallId) -> Result<()> {
        let aufnahme = self.aufnahme_stoppen(anruf);
        let id = anruf.to_string();
        self.bausteine.pool.unbind_all(&id);
        self.bausteine.pool.remove_ring_buffer(&id);
        self.bausteine.volume.remove_call(&id);
        aufnahme.map(|_| ())
    }

    /// Verstaerkung eines Anrufs beim Mischen
    pub fn set_call_gain(&self, anruf: &CallId, verstaerkung: f32) {
        self.bausteine
            .volume
            .set_call_gain(&anruf.to_string(), verstaerkung);
    }

    pub fn call_gain(&self, anruf: &CallId) -> f32 {
        self.bausteine.volume.call_gain(&anruf.to_string())
    }

    // -----------------------------------------------------------------------
    // Aufnahme
    // -----------------------------------------------------------------------

    pub fn is_recording(&self, anruf: &CallId) -> bool {
        self.aufnahmen.lock().contains_key(anruf)
    }

    /// Startet die Aufnahme im konfigurierten Verzeichnis
    pub fn aufnahme_starten(&self, anruf: &CallId) -> Result<PathBuf> {
        let mut aufnahmen = self.aufnahmen.lock();
        if let Some(r) = aufnahmen.get(anruf) {
            return Ok(r.path().to_path_buf());
        }
        let pfad = self
            .config
            .aufnahme
            .verzeichnis
            .join(recording_file_name(anruf));
        let rekorder = CallRecorder::start(Arc::clone(&self.bausteine.pool), anruf, pfad.clone())
            .with_context(|| format!("Aufnahme '{}' nicht startbar", pfad.display()))?;
        aufnahmen.insert(anruf.clone(), rekorder);
        Ok(pfad)
    }

    /// Beendet die Aufnahme; `None`, wenn keine lief
    pub fn aufnahme_stoppen(&self, anruf: &CallId) -> Result<Option<PathBuf>> {
        let Some(rekorder) = self.aufnahmen.lock().remove(anruf) else {
            return Ok(None);
        };
        let pfad = rekorder.stop().context("Aufnahme nicht sauber beendet")?;
        Ok(Some(pfad))
    }

    /// Schaltet die Aufnahme um; gibt zurueck, ob jetzt aufgenommen wird
    pub fn aufnahme_umschalten(&self, anruf: &CallId) -> Result<bool> {
        if self.is_recording(anruf) {
            self.aufnahme_stoppen(anruf)?;
            Ok(false)
        } else {
            self.aufnahme_starten(anruf)?;
            Ok(true)
        }
    }

    /// Stoppt Weiterleitung, Aufnahmen und Backend und gibt die Codec-Module frei
    pub fn stoppen(&mut self) -> Result<()> {
        self.stopp.store(true, Ordering::Release);
        if let Some(thread) = self.weiterleitung.take() {
            if thread.join().is_err() {
                error!("Ereignis-Thread ist abgestuerzt");
            }
        }
        let laufend: Vec<CallRecorder> = self.aufnahmen.lock().drain().map(|(_, r)| r).collect();
        for rekorder in laufend {
            if let Err(e) = rekorder.stop() {
                warn!("Aufnahme nicht sauber beendet: {}", e);
            }
        }
        self.backend
            .lock()
            .stop_stream()
            .context("Audio-Streams konnten nicht gestoppt werden")?;
        let lebend: usize = self
            .registry
            .codec_list()
            .into_iter()
            .map(|pt| self.registry.active_instances(pt))
            .sum();
        if lebend > 0 {
            warn!(instanzen = lebend, "Codec-Instanzen leben noch, Freigabe verzoegert");
        }
        self.registry.shutdown();
        info!("Media-Engine gestoppt");
        Ok(())
    }
}

impl Drop for Daemon {
    fn drop(&mut self) {
        if self.weiterleitung.is_some() {
            if let Err(e) = self.stoppen() {
                warn!("Stoppen beim Aufraeumen fehlgeschlagen: {:#}", e);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Ereignis-Weiterleitung
// ---------------------------------------------------------------------------

struct Weiterleitung {
    backend: GeteiltesBackend,
    bausteine: Bausteine,
    aufnahmen: Aufnahmen,
    stopp: Arc<AtomicBool>,
    neuaufbauten: Arc<AtomicUsize>,
}

impl Weiterleitung {
    fn laufen(self, mut events: Receiver<BackendEvent>) {
        while !self.stopp.load(Ordering::Acquire) {
            let ereignis = events.recv_timeout(EREIGNIS_TIMEOUT);
            self.aufnehmen();
            let ereignis = match ereignis {
                Ok(e) => e,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            };
            match ereignis {
                BackendEvent::Started => info!("Backend gestartet"),
                BackendEvent::Stopped => info!("Backend gestoppt"),
                BackendEvent::DeviceFailed(f) => warn!("Geraetefehler: {}", f),
                BackendEvent::DeviceMoved { richtung, geraet } => {
                    info!(%richtung, %geraet, "Stream verschoben")
                }
                BackendEvent::EchoCancel(an) => info!(echo_cancel = an, "Echounterdrueckung"),
                BackendEvent::DevicesChanged => info!("Geraeteliste geaendert"),
                BackendEvent::ConnectionLost => {
                    error!("Verbindung zum Audio-Server verloren");
                    match self.neu_aufbauen() {
                        Ok(Some(neu)) => events = neu,
                        Ok(None) => {}
                        Err(e) => error!("Neuaufbau fehlgeschlagen: {:#}", e),
                    }
                }
            }
        }
    }

    /// Schreibt die laufenden Aufnahmen fort
    fn aufnehmen(&self) {
        for (anruf, rekorder) in self.aufnahmen.lock().iter_mut() {
            if let Err(e) = rekorder.record() {
                warn!(anruf = %anruf, "Aufnahme fehlgeschlagen: {}", e);
            }
        }
    }

    /// Baut das Server-Backend einmalig neu auf
    fn neu_aufbauen(&self) -> Result<Option<Receiver<BackendEvent>>> {
        if !self.bausteine.audio.neu_verbinden || self.bausteine.fabrik.is_none() {
            return Ok(None);
        }
        if self
            .neuaufbauten
            .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            warn!("Bereits einmal neu verbunden, Backend bleibt gestoppt");
            return Ok(None);
        }

        let mut backend = self.backend.lock();
        if let Err(e) = backend.stop_stream() {
            warn!("Altes Backend liess sich nicht stoppen: {}", e);
        }
        // Das alte Backend trennt beim Drop seine Verbindung
        *backend = self.bausteine.backend_bauen();
        backend.open_device(self.bausteine.audio.open_params())?;
        backend.start_stream()?;
        info!("Server-Backend neu aufgebaut");
        Ok(Some(backend.events()))
    }
}
