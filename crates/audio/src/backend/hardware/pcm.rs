//! PCM-Geraete-Abstraktion mit Zustandsmaschine
//!
//! `Closed -> Open -> Prepared -> Running`. Xruns werden an Ort und Stelle
//! behoben: beim Schreiben stop/prepare/start und ein einmaliger Neuversuch,
//! beim Lesen stop/prepare/start.

use fernsprech_core::{Sample, StreamDirection};
use tracing::{debug, warn};

use crate::error::PcmError;

/// Ein geoeffnetes PCM-Geraet (mono, i16)
///
/// Implementierungen muessen nicht `Send` sein: Geraete werden im
/// Sitzungs-Thread geoeffnet und nie verschoben.
pub trait PcmDevice {
    fn name(&self) -> &str;

    /// Tatsaechliche Rate des Geraets
    fn rate(&self) -> u32;

    fn prepare(&mut self) -> Result<(), PcmError>;

    fn start(&mut self) -> Result<(), PcmError>;

    fn stop(&mut self) -> Result<(), PcmError>;

    /// Schreibbare (Wiedergabe) bzw. lesbare (Aufnahme) Frames
    fn avail(&mut self) -> Result<usize, PcmError>;

    fn writei(&mut self, samples: &[Sample]) -> Result<usize, PcmError>;

    fn readi(&mut self, ziel: &mut [Sample]) -> Result<usize, PcmError>;
}

/// Treiber, der PCM-Geraete oeffnet und auflistet
pub trait PcmDriver: Send + Sync {
    fn open(
        &self,
        richtung: StreamDirection,
        index: Option<usize>,
        plugin: &str,
        rate: u32,
        frame_size: usize,
    ) -> Result<Box<dyn PcmDevice>, PcmError>;

    /// Geraetenamen der Richtung
    fn device_names(&self, richtung: StreamDirection) -> Vec<String>;

    /// `"<karte> - <pcm>"` pro Geraet
    fn card_list(&self, richtung: StreamDirection) -> Vec<String>;
}

/// Zustand eines PCM-Streams
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PcmState {
    Closed,
    Open,
    Prepared,
    Running,
}

impl PcmState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::Prepared => "prepared",
            Self::Running => "running",
        }
    }
}

/// PCM-Stream einer Richtung
pub struct PcmStream {
    richtung: StreamDirection,
    geraet: Option<Box<dyn PcmDevice>>,
    zustand: PcmState,
    xruns: u64,
}

impl PcmStream {
    /// Oeffnet und bereitet das Geraet vor
    pub fn open(
        treiber: &dyn PcmDriver,
        richtung: StreamDirection,
        index: Option<usize>,
        plugin: &str,
        rate: u32,
        frame_size: usize,
    ) -> Result<Self, PcmError> {
        let geraet = treiber.open(richtung, index, plugin, rate, frame_size)?;
        debug!(
            "PCM {} geoeffnet: {} @ {} Hz",
            richtung,
            geraet.name(),
            geraet.rate()
        );
        let mut stream = Self {
            richtung,
            geraet: Some(geraet),
            zustand: PcmState::Open,
            xruns: 0,
        };
        stream.prepare()?;
        Ok(stream)
    }

    pub fn state(&self) -> PcmState {
        self.zustand
    }

    pub fn direction(&self) -> StreamDirection {
        self.richtung
    }

    pub fn xruns(&self) -> u64 {
        self.xruns
    }

    pub fn rate(&self) -> u32 {
        self.geraet.as_ref().map(|g| g.rate()).unwrap_or(0)
    }

    fn geraet(&mut self) -> Result<&mut Box<dyn PcmDevice>, PcmError> {
        self.geraet.as_mut().ok_or(PcmError::Zustand {
            von: PcmState::Closed.as_str(),
            nach: "io",
        })
    }

    fn pruefen(&self, erlaubt: &[PcmState], nach: PcmState) -> Result<(), PcmError> {
        if erlaubt.contains(&self.zustand) {
            Ok(())
        } else {
            Err(PcmError::Zustand {
                von: self.zustand.as_str(),
                nach: nach.as_str(),
            })
        }
    }

    pub fn prepare(&mut self) -> Result<(), PcmError> {
        self.pruefen(&[PcmState::Open, PcmState::Prepared], PcmState::Prepared)?;
        self.geraet()?.prepare()?;
        self.zustand = PcmState::Prepared;
        Ok(())
    }

    pub fn start(&mut self) -> Result<(), PcmError> {
        self.pruefen(&[PcmState::Prepared, PcmState::Running], PcmState::Running)?;
        if self.zustand == PcmState::Prepared {
            self.geraet()?.start()?;
            self.zustand = PcmState::Running;
        }
        Ok(())
    }

    /// Haelt an; danach ist der Stream wieder im Zustand Open
    pub fn stop(&mut self) -> Result<(), PcmError> {
        if self.zustand == PcmState::Closed {
            return Ok(());
        }
        self.geraet()?.stop()?;
        self.zustand = PcmState::Open;
        Ok(())
    }

    pub fn close(&mut self) {
        if let Err(e) = self.stop() {
            warn!("PCM {}: Stoppen beim Schliessen fehlgeschlagen: {}", self.richtung, e);
        }
        self.geraet = None;
        self.zustand = PcmState::Closed;
    }

    fn neu_starten(&mut self) -> Result<(), PcmError> {
        self.xruns += 1;
        warn!("PCM {}: Xrun #{}, starte neu", self.richtung, self.xruns);
        self.stop()?;
        self.prepare()?;
        self.start()
    }

    pub fn avail(&mut self) -> usize {
        let ergebnis = match self.geraet() {
            Ok(g) => g.avail(),
            Err(_) => return 0,
        };
        match ergebnis {
            Ok(n) => n,
            Err(e) if e.ist_voruebergehend() => {
                if let Err(e) = self.neu_starten() {
                    warn!("PCM {}: Neustart fehlgeschlagen: {}", self.richtung, e);
                }
                0
            }
            Err(e) => {
                warn!("PCM {}: avail fehlgeschlagen: {}", self.richtung, e);
                0
            }
        }
    }

    /// Schreibt; startet bei Bedarf, behebt Xruns und versucht einmal neu
    pub fn write(&mut self, samples: &[Sample]) -> usize {
        if samples.is_empty() || self.zustand == PcmState::Closed {
            return 0;
        }
        if let Err(e) = self.start() {
            warn!("PCM {}: Start fehlgeschlagen: {}", self.richtung, e);
            return 0;
        }
        let ergebnis = match self.geraet() {
            Ok(g) => g.writei(samples),
            Err(_) => return 0,
        };
        match ergebnis {
            Ok(n) => n,
            Err(e) if e.ist_voruebergehend() => {
                if let Err(e) = self.neu_starten() {
                    warn!("PCM {}: Neustart fehlgeschlagen: {}", self.richtung, e);
                    return 0;
                }
                match self.geraet().and_then(|g| g.writei(samples)) {
                    Ok(n) => n,
                    Err(e) => {
                        warn!("PCM {}: Neuversuch fehlgeschlagen: {}", self.richtung, e);
                        0
                    }
                }
            }
            Err(e) => {
                warn!("PCM {}: Schreiben fehlgeschlagen: {}", self.richtung, e);
                0
            }
        }
    }

    /// Liest; ein Xrun startet den Stream neu und liefert 0
    pub fn read(&mut self, ziel: &mut [Sample]) -> usize {
        if ziel.is_empty() || self.zustand == PcmState::Closed {
            return 0;
        }
        if let Err(e) = self.start() {
            warn!("PCM {}: Start fehlgeschlagen: {}", self.richtung, e);
            return 0;
        }
        let ergebnis = match self.geraet() {
            Ok(g) => g.readi(ziel),
            Err(_) => return 0,
        };
        match ergebnis {
            Ok(n) => n,
            Err(e) if e.ist_voruebergehend() => {
                if let Err(e) = self.neu_starten() {
                    warn!("PCM {}: Neustart fehlgeschlagen: {}", self.richtung, e);
                }
                0
            }
            Err(e) => {
                warn!("PCM {}: Lesen fehlgeschlagen: {}", self.richtung, e);
                0
            }
        }
    }
}

impl Drop for PcmStream {
    fn drop(&mut self) {
        if self.zustand != PcmState::Closed {
            self.close();
        }
    }
}
