//! Simulierter PCM-Treiber ohne Hardware
//!
//! Wird fuer Tests und das `null`-Backend benutzt. Wiedergabe nimmt pro
//! Abfrage eine Periode (20 ms) an, Aufnahme liefert eingespeiste Samples.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use fernsprech_core::{Sample, StreamDirection};
use parking_lot::Mutex;

use super::pcm::{PcmDevice, PcmDriver};
use crate::device::device_topology;
use crate::error::PcmError;

#[derive(Default)]
struct SimInner {
    fehler: HashSet<StreamDirection>,
    xruns: HashSet<StreamDirection>,
    geschrieben: HashMap<StreamDirection, Vec<Sample>>,
    mikrofon: VecDeque<Sample>,
    /// Feste Geraeterate; `None` = angeforderte Rate
    rate: Option<u32>,
    geoeffnet: Vec<StreamDirection>,
}

/// Simulierter Treiber; Klone teilen denselben Zustand
#[derive(Clone, Default)]
pub struct SimulatedPcmDriver {
    inner: Arc<Mutex<SimInner>>,
}

impl SimulatedPcmDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Das naechste Oeffnen dieser Richtung schlaegt fehl
    pub fn fail_open(&self, richtung: StreamDirection) {
        self.inner.lock().fehler.insert(richtung);
    }

    /// Der naechste Zugriff dieser Richtung meldet einen Xrun
    pub fn inject_xrun(&self, richtung: StreamDirection) {
        self.inner.lock().xruns.insert(richtung);
    }

    pub fn set_device_rate(&self, rate: u32) {
        self.inner.lock().rate = Some(rate);
    }

    pub fn feed_capture(&self, samples: &[Sample]) {
        self.inner.lock().mikrofon.extend(samples.iter().copied());
    }

    /// Alles, was bisher in diese Richtung geschrieben wurde
    pub fn written(&self, richtung: StreamDirection) -> Vec<Sample> {
        self.inner
            .lock()
            .geschrieben
            .get(&richtung)
            .cloned()
            .unwrap_or_default()
    }

    /// Richtungen, die erfolgreich geoeffnet wurden
    pub fn opened(&self) -> Vec<StreamDirection> {
        self.inner.lock().geoeffnet.clone()
    }
}

impl PcmDriver for SimulatedPcmDriver {
    fn open(
        &self,
        richtung: StreamDirection,
        _index: Option<usize>,
        plugin: &str,
        rate: u32,
        _frame_size: usize,
    ) -> Result<Box<dyn PcmDevice>, PcmError> {
        let mut inner = self.inner.lock();
        if inner.fehler.remove(&richtung) {
            return Err(PcmError::Geraet(format!("{}: Geraet belegt", richtung)));
        }
        inner.geoeffnet.push(richtung);
        let rate = inner.rate.unwrap_or(rate);
        Ok(Box::new(SimulatedPcm {
            name: device_topology(plugin, &format!("sim-{}", richtung), None),
            richtung,
            rate,
            inner: Arc::clone(&self.inner),
        }))
    }

    fn device_names(&self, richtung: StreamDirection) -> Vec<String> {
        vec![format!("sim-{}", richtung)]
    }

    fn card_list(&self, richtung: StreamDirection) -> Vec<String> {
        vec![format!("Simulation - sim-{}", richtung)]
    }
}

struct SimulatedPcm {
    name: String,
    richtung: StreamDirection,
    rate: u32,
    inner: Arc<Mutex<SimInner>>,
}

impl SimulatedPcm {
    fn xrun_pruefen(&self) -> Result<(), PcmError> {
        if self.inner.lock().xruns.remove(&self.richtung) {
            return Err(PcmError::Xrun);
        }
        Ok(())
    }
}

impl PcmDevice for SimulatedPcm {
    fn name(&self) -> &str {
        &self.name
    }

    fn rate(&self) -> u32 {
        self.rate
    }

    fn prepare(&mut self) -> Result<(), PcmError> {
        Ok(())
    }

    fn start(&mut self) -> Result<(), PcmError> {
        Ok(())
    }

    fn stop(&mut self) -> Result<(), PcmError> {
        Ok(())
    }

    fn avail(&mut self) -> Result<usize, PcmError> {
        match self.richtung {
            StreamDirection::Capture => Ok(self.inner.lock().mikrofon.len()),
            _ => Ok(self.rate as usize / 50),
        }
    }

    fn writei(&mut self, samples: &[Sample]) -> Result<usize, PcmError> {
        self.xrun_pruefen()?;
        self.inner
            .lock()
            .geschrieben
            .entry(self.richtung)
            .or_default()
            .extend_from_slice(samples);
        Ok(samples.len())
    }

    fn readi(&mut self, ziel: &mut [Sample]) -> Result<usize, PcmError> {
        self.xrun_pruefen()?;
        let mut inner = self.inner.lock();
        let n = ziel.len().min(inner.mikrofon.len());
        for (z, s) in ziel.iter_mut().zip(inner.mikrofon.drain(..n)) {
            *z = s;
        }
        Ok(n)
    }
}
