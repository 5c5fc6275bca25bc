//! Signalverarbeitung im Aufnahmepfad
//!
//! Prozessoren arbeiten in-place auf i16-Samples und werden vom Hot-Path
//! des jeweiligen Backends besessen.

use fernsprech_core::Sample;

/// Gemeinsames Trait fuer Audio-Prozessoren
pub trait AudioProcessor: Send {
    /// Verarbeitet einen Puffer in-place
    fn process(&mut self, samples: &mut [Sample]);

    /// Setzt die Filter-Historie zurueck
    fn reset(&mut self);

    fn is_enabled(&self) -> bool;

    fn set_enabled(&mut self, enabled: bool);
}

/// Gleichanteil-Filter erster Ordnung: y[n] = x[n] - x[n-1] + R * y[n-1]
pub struct DcBlocker {
    r: f32,
    x1: f32,
    y1: f32,
    enabled: bool,
}

impl DcBlocker {
    /// `r` nahe 1.0 ergibt eine tiefe Grenzfrequenz
    pub fn new(r: f32) -> Self {
        Self {
            r: r.clamp(0.0, 0.9999),
            x1: 0.0,
            y1: 0.0,
            enabled: true,
        }
    }
}

impl Default for DcBlocker {
    fn default() -> Self {
        Self::new(0.995)
    }
}

impl AudioProcessor for DcBlocker {
    fn process(&mut self, samples: &mut [Sample]) {
        if !self.enabled {
            return;
        }
        for s in samples.iter_mut() {
            let x = *s as f32;
            let y = x - self.x1 + self.r * self.y1;
            self.x1 = x;
            self.y1 = y;
            *s = y.round().clamp(Sample::MIN as f32, Sample::MAX as f32) as Sample;
        }
    }

    fn reset(&mut self) {
        self.x1 = 0.0;
        self.y1 = 0.0;
    }

    fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }
}

/// Einstellungen der Echounterdrueckung
#[derive(Debug, Clone)]
pub struct EchoCancelConfig {
    /// Groesste beruecksichtigte Echo-Verzoegerung in Samples
    pub max_verzoegerung: usize,
    /// Anteil der Referenz, der abgezogen wird (0.0..1.0)
    pub staerke: f32,
}

impl Default for EchoCancelConfig {
    fn default() -> Self {
        Self {
            max_verzoegerung: 1600, // 200 ms bei 8 kHz
            staerke: 0.7,
        }
    }
}

/// Vereinfachte Echounterdrueckung
///
/// Merkt sich das Lautsprechersignal als Referenz und zieht eine
/// verzoegerte, skalierte Kopie davon vom Mikrofonsignal ab. Referenz und
/// Mikrofon muessen dieselbe Rate haben.
pub struct EchoCanceller {
    config: EchoCancelConfig,
    referenz: Vec<f32>,
    schreib_pos: usize,
    verzoegerung: usize,
    enabled: bool,
}

/// Reserve fuer einen Mikrofonblock hinter der groessten Verzoegerung
const MAX_BLOCK: usize = 2048;

impl EchoCanceller {
    pub fn new(config: EchoCancelConfig) -> Self {
        Self {
            referenz: vec![0.0; config.max_verzoegerung + MAX_BLOCK],
            schreib_pos: 0,
            verzoegerung: config.max_verzoegerung / 4,
            config,
            enabled: true,
        }
    }

    /// Lautsprecher-Samples in die Referenz aufnehmen
    pub fn feed_reference(&mut self, samples: &[Sample]) {
        let len = self.referenz.len();
        for &s in samples {
            self.referenz[self.schreib_pos] = s as f32;
            self.schreib_pos = (self.schreib_pos + 1) % len;
        }
    }

    /// Stille in die Referenz, haelt die Zeitachse beider Seiten gleich
    pub fn feed_silence(&mut self, n: usize) {
        let len = self.referenz.len();
        for _ in 0..n.min(len) {
            self.referenz[self.schreib_pos] = 0.0;
            self.schreib_pos = (self.schreib_pos + 1) % len;
        }
    }

    /// Referenz-Sample `abstand` Samples vor dem neuesten (1 = neuestes)
    fn referenz_vor(&self, abstand: usize) -> f32 {
        let len = self.referenz.len();
        self.referenz[(self.schreib_pos + len - abstand % len) % len]
    }

    pub fn set_delay(&mut self, samples: usize) {
        self.verzoegerung = samples.min(self.config.max_verzoegerung);
    }

    pub fn delay(&self) -> usize {
        self.verzoegerung
    }
}

impl Default for EchoCanceller {
    fn default() -> Self {
        Self::new(EchoCancelConfig::default())
    }
}

impl AudioProcessor for EchoCanceller {
    fn process(&mut self, samples: &mut [Sample]) {
        if !self.enabled {
            return;
        }
        // Blockende entspricht dem neuesten Referenz-Sample
        let n = samples.len().min(MAX_BLOCK);
        for (i, s) in samples[..n].iter_mut().enumerate() {
            let echo = self.referenz_vor(self.verzoegerung + n - i);
            let y = *s as f32 - echo * self.config.staerke;
            *s = y.round().clamp(Sample::MIN as f32, Sample::MAX as f32) as Sample;
        }
    }

    fn reset(&mut self) {
        self.referenz.fill(0.0);
        self.schreib_pos = 0;
    }

    fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }
}
