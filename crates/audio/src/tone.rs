//! Hoertoene, DTMF und Klingeltoene aus Dateien
//!
//! [`ToneState`] gehoert genau einem Backend und wird von dessen Hot-Path
//! gelesen. Alle Quellen erzeugen Samples fuer eine beliebige Ausgaberate.

use std::path::Path;

use fernsprech_core::Sample;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{AudioError, AudioResult};
use crate::pool::RingBufferPool;
use crate::resampler::{ausgabe_frames, SampleRateConverter};

const TON_AMPLITUDE: f32 = 6000.0;

// ---------------------------------------------------------------------------
// Hoertoene
// ---------------------------------------------------------------------------

/// Art des Hoertons
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToneKind {
    Dial,
    Ringback,
    Busy,
    Congestion,
}

/// Laendervariante der Kadenzen
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToneRegion {
    #[default]
    Europa,
    Nordamerika,
}

/// Abschnitt einer Kadenz: Frequenzen (leer = Pause) und Dauer
#[derive(Debug, Clone)]
struct Abschnitt {
    frequenzen: &'static [f32],
    dauer_ms: u32,
}

const fn ab(frequenzen: &'static [f32], dauer_ms: u32) -> Abschnitt {
    Abschnitt {
        frequenzen,
        dauer_ms,
    }
}

fn kadenz(art: ToneKind, region: ToneRegion) -> Vec<Abschnitt> {
    const EU: &[f32] = &[425.0];
    const NA_WAHL: &[f32] = &[350.0, 440.0];
    const NA_RUF: &[f32] = &[440.0, 480.0];
    const NA_BESETZT: &[f32] = &[480.0, 620.0];
    const STILL: &[f32] = &[];

    match (region, art) {
        (ToneRegion::Europa, ToneKind::Dial) => vec![ab(EU, 1000)],
        (ToneRegion::Europa, ToneKind::Ringback) => vec![ab(EU, 1000), ab(STILL, 4000)],
        (ToneRegion::Europa, ToneKind::Busy) => vec![ab(EU, 500), ab(STILL, 500)],
        (ToneRegion::Europa, ToneKind::Congestion) => vec![ab(EU, 250), ab(STILL, 250)],
        (ToneRegion::Nordamerika, ToneKind::Dial) => vec![ab(NA_WAHL, 1000)],
        (ToneRegion::Nordamerika, ToneKind::Ringback) => {
            vec![ab(NA_RUF, 2000), ab(STILL, 4000)]
        }
        (ToneRegion::Nordamerika, ToneKind::Busy) => vec![ab(NA_BESETZT, 500), ab(STILL, 500)],
        (ToneRegion::Nordamerika, ToneKind::Congestion) => {
            vec![ab(NA_BESETZT, 250), ab(STILL, 250)]
        }
    }
}

/// Erzeugt einen Hoerton mit Kadenz, phasenstetig ueber Aufrufe hinweg
pub struct ToneGenerator {
    art: ToneKind,
    abschnitte: Vec<Abschnitt>,
    index: usize,
    /// Bereits erzeugte Zeit im aktuellen Abschnitt (Sekunden)
    im_abschnitt: f64,
    phasen: [f64; 2],
}

impl ToneGenerator {
    pub fn new(art: ToneKind, region: ToneRegion) -> Self {
        Self {
            art,
            abschnitte: kadenz(art, region),
            index: 0,
            im_abschnitt: 0.0,
            phasen: [0.0; 2],
        }
    }

    pub fn kind(&self) -> ToneKind {
        self.art
    }

    /// Fuellt `ziel` vollstaendig mit dem Ton bei `rate` Hz
    pub fn fill(&mut self, ziel: &mut [Sample], rate: u32) {
        let dt = 1.0 / rate.max(1) as f64;
        for s in ziel.iter_mut() {
            let abschnitt = &self.abschnitte[self.index];
            let mut wert = 0.0f64;
            for (phase, &f) in self.phasen.iter_mut().zip(abschnitt.frequenzen) {
                wert += phase.sin();
                *phase = (*phase + std::f64::consts::TAU * f as f64 * dt) % std::f64::consts::TAU;
            }
            let anzahl = abschnitt.frequenzen.len().max(1) as f64;
            *s = (wert / anzahl * TON_AMPLITUDE as f64) as Sample;

            self.im_abschnitt += dt;
            if self.im_abschnitt >= abschnitt.dauer_ms as f64 / 1000.0 {
                self.im_abschnitt = 0.0;
                self.index = (self.index + 1) % self.abschnitte.len();
            }
        }
    }
}

// ---------------------------------------------------------------------------
// DTMF
// ---------------------------------------------------------------------------

/// Frequenzpaar (Zeile, Spalte) einer DTMF-Ziffer
pub fn dtmf_frequenzen(ziffer: char) -> Option<(f32, f32)> {
    let paar = match ziffer.to_ascii_uppercase() {
        '1' => (697.0, 1209.0),
        '2' => (697.0, 1336.0),
        '3' => (697.0, 1477.0),
        'A' => (697.0, 1633.0),
        '4' => (770.0, 1209.0),
        '5' => (770.0, 1336.0),
        '6' => (770.0, 1477.0),
        'B' => (770.0, 1633.0),
        '7' => (852.0, 1209.0),
        '8' => (852.0, 1336.0),
        '9' => (852.0, 1477.0),
        'C' => (852.0, 1633.0),
        '*' => (941.0, 1209.0),
        '0' => (941.0, 1336.0),
        '#' => (941.0, 1477.0),
        'D' => (941.0, 1633.0),
        _ => return None,
    };
    Some(paar)
}

/// Erzeugt DTMF-Ziffern fuer den dringenden Puffer
#[derive(Debug, Clone, Copy)]
pub struct DtmfGenerator {
    rate: u32,
    dauer_ms: u32,
}

impl DtmfGenerator {
    pub fn new(rate: u32) -> Self {
        Self {
            rate,
            dauer_ms: 150,
        }
    }

    pub fn with_duration(mut self, dauer_ms: u32) -> Self {
        self.dauer_ms = dauer_ms;
        self
    }

    /// Samples einer Ziffer bei der eingestellten Rate
    pub fn generate(&self, ziffer: char) -> AudioResult<Vec<Sample>> {
        let (f1, f2) =
            dtmf_frequenzen(ziffer).ok_or(AudioError::UngueltigeDtmfZiffer(ziffer))?;
        let n = (self.dauer_ms as u64 * self.rate as u64 / 1000) as usize;
        let rate = self.rate as f32;
        Ok((0..n)
            .map(|i| {
                let t = i as f32 / rate;
                let a = (std::f32::consts::TAU * f1 * t).sin();
                let b = (std::f32::consts::TAU * f2 * t).sin();
                ((a + b) / 2.0 * TON_AMPLITUDE) as Sample
            })
            .collect())
    }

    /// Schreibt eine Ziffer in den dringenden Puffer des Pools
    pub fn send(&self, pool: &RingBufferPool, ziffer: char) -> AudioResult<()> {
        let samples = self.generate(ziffer)?;
        debug!("DTMF '{}': {} Samples", ziffer, samples.len());
        pool.put_urgent(&samples);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Dateien
// ---------------------------------------------------------------------------

/// Mindestens so viel Vorlauf, dass die Filterlatenz abgeklungen ist
const EINSCHWINGEN: usize = 2048;

/// Ganzzahl-Sample beliebiger Breite auf 16 Bit
fn auf_16_bit(v: i32, bits: u32) -> i32 {
    match bits {
        0..=15 => v << (16 - bits.max(1)),
        16 => v,
        _ => v >> (bits - 16),
    }
}

/// Wandelt eine Schleife ohne Einschwing-Stille am Anfang
///
/// Die Schleife wird mehrfach hintereinander gewandelt und nur die letzte
/// Periode behalten, deren Anfang nahtlos an ihr Ende anschliesst.
fn schleife_wandeln(samples: &[Sample], quelle: u32, ziel: u32) -> Vec<Sample> {
    if samples.is_empty() {
        return Vec::new();
    }
    let wiederholungen = 1 + EINSCHWINGEN.div_ceil(samples.len());
    let eingang: Vec<Sample> = samples
        .iter()
        .copied()
        .cycle()
        .take(samples.len() * wiederholungen)
        .collect();
    let periode = ausgabe_frames(samples.len(), quelle, ziel);
    match SampleRateConverter::new().resample(&eingang, quelle, ziel, 1) {
        Ok(d) => d[d.len().saturating_sub(periode)..].to_vec(),
        Err(e) => {
            warn!("Klingelton nicht wandelbar: {}", e);
            Vec::new()
        }
    }
}

/// Endlosschleife ueber eine Mono-Aufnahme (Klingelton)
pub struct AudioLoop {
    samples: Vec<Sample>,
    rate: u32,
    pos: usize,
    /// Auf die Ausgaberate gewandelte Kopie
    gewandelt: Option<(u32, Vec<Sample>)>,
}

impl AudioLoop {
    pub fn from_samples(samples: Vec<Sample>, rate: u32) -> Self {
        Self {
            samples,
            rate,
            pos: 0,
            gewandelt: None,
        }
    }

    /// Laedt eine WAV-Datei; mehrkanalige Dateien werden gemittelt
    pub fn from_wav(pfad: &Path) -> AudioResult<Self> {
        let mut reader = hound::WavReader::open(pfad).map_err(|e| AudioError::Wav(e.to_string()))?;
        let spec = reader.spec();
        let kanaele = spec.channels.max(1) as usize;

        let roh: Vec<i32> = match spec.sample_format {
            hound::SampleFormat::Int => {
                let bits = spec.bits_per_sample as u32;
                reader
                    .samples::<i32>()
                    .map(|s| s.map(|v| auf_16_bit(v, bits)))
                    .collect::<Result<_, _>>()
                    .map_err(|e| AudioError::Wav(e.to_string()))?
            }
            hound::SampleFormat::Float => reader
                .samples::<f32>()
                .map(|s| s.map(|v| (v * 32767.0) as i32))
                .collect::<Result<_, _>>()
                .map_err(|e| AudioError::Wav(e.to_string()))?,
        };

        let samples: Vec<Sample> = roh
            .chunks(kanaele)
            .map(|frame| {
                let summe: i32 = frame.iter().sum();
                (summe / frame.len() as i32).clamp(Sample::MIN as i32, Sample::MAX as i32) as Sample
            })
            .collect();

        info!(
            "Klingelton geladen: {} ({} Hz, {} Kanaele, {} Samples)",
            pfad.display(),
            spec.sample_rate,
            kanaele,
            samples.len()
        );
        Ok(Self::from_samples(samples, spec.sample_rate))
    }

    pub fn sample_rate(&self) -> u32 {
        self.rate
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    fn daten_fuer(&mut self, rate: u32) -> &[Sample] {
        if rate == self.rate {
            return &self.samples;
        }
        let passt = matches!(&self.gewandelt, Some((r, _)) if *r == rate);
        if !passt {
            let daten = schleife_wandeln(&self.samples, self.rate, rate);
            // Position proportional uebertragen
            self.pos = (self.pos as u64 * rate as u64 / self.rate.max(1) as u64) as usize;
            self.gewandelt = Some((rate, daten));
        }
        match &self.gewandelt {
            Some((_, d)) => d,
            None => &[],
        }
    }

    /// Fuellt `ziel` in Schleife; leere Dateien ergeben Stille
    pub fn fill(&mut self, ziel: &mut [Sample], rate: u32) {
        let mut pos = self.pos;
        let daten = self.daten_fuer(rate);
        if daten.is_empty() {
            ziel.fill(0);
            return;
        }
        pos %= daten.len();
        for s in ziel.iter_mut() {
            *s = daten[pos];
            pos = (pos + 1) % daten.len();
        }
        self.pos = pos;
    }
}

// ---------------------------------------------------------------------------
// Zustand pro Backend
// ---------------------------------------------------------------------------

/// Aktive Ton- und Dateiquelle eines Backends
#[derive(Default)]
pub struct ToneState {
    telefon: Mutex<Option<ToneGenerator>>,
    datei: Mutex<Option<AudioLoop>>,
}

impl ToneState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn play_tone(&self, art: ToneKind, region: ToneRegion) {
        debug!("Hoerton gestartet: {:?} ({:?})", art, region);
        *self.telefon.lock() = Some(ToneGenerator::new(art, region));
    }

    pub fn stop_tone(&self) {
        self.telefon.lock().take();
    }

    pub fn play_file(&self, quelle: AudioLoop) {
        debug!("Dateiton gestartet ({} Samples)", quelle.len());
        *self.datei.lock() = Some(quelle);
    }

    pub fn stop_file(&self) {
        self.datei.lock().take();
    }

    pub fn tone_active(&self) -> bool {
        self.telefon.lock().is_some()
    }

    pub fn file_active(&self) -> bool {
        self.datei.lock().is_some()
    }

    /// Fuellt aus dem Hoerton; `false` wenn keiner aktiv ist
    pub fn fill_tone(&self, ziel: &mut [Sample], rate: u32) -> bool {
        match self.telefon.lock().as_mut() {
            Some(ton) => {
                ton.fill(ziel, rate);
                true
            }
            None => false,
        }
    }

    /// Fuellt aus dem Dateiton; `false` wenn keiner aktiv ist
    pub fn fill_file(&self, ziel: &mut [Sample], rate: u32) -> bool {
        match self.datei.lock().as_mut() {
            Some(datei) => {
                datei.fill(ziel, rate);
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{ReaderKind, DEFAULT_ID};

    fn energie(s: &[Sample]) -> f64 {
        s.iter().map(|&x| (x as f64) * (x as f64)).sum()
    }

    #[test]
    fn besetztton_hat_pausen() {
        let mut ton = ToneGenerator::new(ToneKind::Busy, ToneRegion::Europa);
        let mut an = vec![0; 4000]; // 500 ms bei 8 kHz
        let mut aus = vec![0; 4000];
        ton.fill(&mut an, 8000);
        ton.fill(&mut aus, 8000);
        assert!(energie(&an) > 0.0);
        assert!(energie(&aus[10..]) == 0.0);
    }

    #[test]
    fn waehlton_ist_dauerton() {
        let mut ton = ToneGenerator::new(ToneKind::Dial, ToneRegion::Nordamerika);
        let mut s = vec![0; 48000];
        ton.fill(&mut s, 16000);
        let zweite = energie(&s[24000..]);
        let erste = energie(&s[..24000]);
        assert!((zweite / erste - 1.0).abs() < 0.05);
    }

    #[test]
    fn dtmf_tabelle() {
        assert_eq!(dtmf_frequenzen('5'), Some((770.0, 1336.0)));
        assert_eq!(dtmf_frequenzen('d'), Some((941.0, 1633.0)));
        assert_eq!(dtmf_frequenzen('x'), None);
    }

    #[test]
    fn dtmf_landet_im_dringenden_puffer() {
        let pool = RingBufferPool::default();
        pool.register_reader(DEFAULT_ID, ReaderKind::Urgent).unwrap();
        let gen = DtmfGenerator::new(8000).with_duration(100);
        gen.send(&pool, '#').unwrap();
        assert_eq!(pool.urgent_available(DEFAULT_ID), 800);
        assert!(matches!(
            gen.send(&pool, '?'),
            Err(AudioError::UngueltigeDtmfZiffer('?'))
        ));
    }

    #[test]
    fn schleife_wiederholt() {
        let mut l = AudioLoop::from_samples(vec![1, 2, 3], 8000);
        let mut s = [0; 7];
        l.fill(&mut s, 8000);
        assert_eq!(s, [1, 2, 3, 1, 2, 3, 1]);
        let mut s = [0; 2];
        l.fill(&mut s, 8000);
        assert_eq!(s, [2, 3]);
    }

    #[test]
    fn wav_laden_und_wandeln() {
        let dir = tempfile::tempdir().unwrap();
        let pfad = dir.path().join("klingel.wav");
        let spec = hound::WavSpec {
            channels: 2,
            sample_rate: 16000,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(&pfad, spec).unwrap();
        for _ in 0..1600 {
            writer.write_sample(1000i16).unwrap();
            writer.write_sample(3000i16).unwrap();
        }
        writer.finalize().unwrap();

        let mut l = AudioLoop::from_wav(&pfad).unwrap();
        assert_eq!(l.sample_rate(), 16000);
        assert_eq!(l.len(), 1600);

        let mut s = [0; 800];
        l.fill(&mut s, 8000);
        // Keine Einschwing-Stille am Schleifenanfang
        assert!(s.iter().all(|&x| (x - 2000).abs() < 200), "{:?}", &s[..8]);
    }

    #[test]
    fn acht_bit_wav_wird_skaliert() {
        let dir = tempfile::tempdir().unwrap();
        let pfad = dir.path().join("alt.wav");
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: 8000,
            bits_per_sample: 8,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(&pfad, spec).unwrap();
        for v in [100i8, -100, 0] {
            writer.write_sample(v).unwrap();
        }
        writer.finalize().unwrap();

        let mut l = AudioLoop::from_wav(&pfad).unwrap();
        let mut s = [0; 3];
        l.fill(&mut s, 8000);
        assert_eq!(s, [25600, -25600, 0]);
        assert_eq!(auf_16_bit(1 << 23, 24), 1 << 15);
    }

    #[test]
    fn zustand_schaltet_quellen() {
        let zustand = ToneState::new();
        let mut s = [0; 16];
        assert!(!zustand.fill_tone(&mut s, 8000));
        zustand.play_tone(ToneKind::Ringback, ToneRegion::Europa);
        assert!(zustand.tone_active());
        assert!(zustand.fill_tone(&mut s, 8000));
        zustand.stop_tone();
        assert!(!zustand.tone_active());

        zustand.play_file(AudioLoop::from_samples(vec![9; 4], 8000));
        assert!(zustand.fill_file(&mut s, 8000));
        assert_eq!(s, [9; 16]);
        zustand.stop_file();
        assert!(!zustand.file_active());
    }
}
