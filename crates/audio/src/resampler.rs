//! Abtastratenwandler fuer interleaved i16-PCM
//!
//! Bandbegrenzte Sinc-Interpolation ueber rubato. Pro Aufruf werden genau
//! `ceil(frames * ziel / quelle)` Frames ausgegeben; die Latenz des Filters
//! wird beim Start mit Stille und spaeter mit dem letzten Sample aufgefuellt.
//! Aendert sich das Ratenpaar, wird der Wandler neu aufgebaut.

use std::collections::VecDeque;

use fernsprech_core::Sample;
use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};
use tracing::debug;

use crate::error::{AudioError, AudioResult};

/// Blockgroesse des Wandlers: 10 ms der Quellrate
fn block_frames(quelle: u32) -> usize {
    (quelle as usize / 100).max(16)
}

struct Zustand {
    quelle: u32,
    ziel: u32,
    kanaele: usize,
    resampler: SincFixedIn<f32>,
    eingang: Vec<VecDeque<f32>>,
    ausgang: Vec<VecDeque<f32>>,
    letzter: Vec<f32>,
    /// Obergrenze fuer gepufferte Ausgabe
    max_ausgang: usize,
}

impl Zustand {
    fn neu(quelle: u32, ziel: u32, kanaele: usize) -> AudioResult<Self> {
        let params = SincInterpolationParameters {
            sinc_len: 256,
            f_cutoff: 0.95,
            interpolation: SincInterpolationType::Linear,
            oversampling_factor: 256,
            window: WindowFunction::BlackmanHarris2,
        };
        let verhaeltnis = ziel as f64 / quelle as f64;
        let block = block_frames(quelle);
        let resampler = SincFixedIn::<f32>::new(verhaeltnis, 1.0, params, block, kanaele)
            .map_err(|e| AudioError::Resampler(e.to_string()))?;

        // Vorlauf deckt einen Block Ausgabe ab
        let vorlauf = (block as f64 * verhaeltnis).ceil() as usize + 2;
        let ausgang = (0..kanaele)
            .map(|_| std::iter::repeat(0.0).take(vorlauf).collect())
            .collect();

        debug!(
            "Resampler aufgebaut: {} Hz -> {} Hz, {} Kanaele, Block {}",
            quelle, ziel, kanaele, block
        );
        Ok(Self {
            quelle,
            ziel,
            kanaele,
            resampler,
            eingang: vec![VecDeque::new(); kanaele],
            ausgang,
            letzter: vec![0.0; kanaele],
            max_ausgang: vorlauf * 4,
        })
    }

    fn passt(&self, quelle: u32, ziel: u32, kanaele: usize) -> bool {
        self.quelle == quelle && self.ziel == ziel && self.kanaele == kanaele
    }

    fn verarbeiten(&mut self, eingang: &[Sample]) -> AudioResult<Vec<Sample>> {
        let k = self.kanaele;
        let frames = eingang.len() / k;
        for frame in eingang.chunks_exact(k) {
            for (kanal, &s) in frame.iter().enumerate() {
                self.eingang[kanal].push_back(s as f32 / 32768.0);
            }
        }

        loop {
            let benoetigt = self.resampler.input_frames_next();
            if self.eingang[0].len() < benoetigt {
                break;
            }
            let block: Vec<Vec<f32>> = self
                .eingang
                .iter_mut()
                .map(|q| q.drain(..benoetigt).collect())
                .collect();
            let ergebnis = self
                .resampler
                .process(&block, None)
                .map_err(|e| AudioError::Resampler(e.to_string()))?;
            for (q, kanal) in self.ausgang.iter_mut().zip(ergebnis) {
                q.extend(kanal);
            }
        }

        // Pro Aufruf aufgerundet, Ueberhang kommt aus dem letzten Sample
        let anzahl = ausgabe_frames(frames, self.quelle, self.ziel);

        let mut aus = Vec::with_capacity(anzahl * k);
        for _ in 0..anzahl {
            for kanal in 0..k {
                let wert = match self.ausgang[kanal].pop_front() {
                    Some(v) => {
                        self.letzter[kanal] = v;
                        v
                    }
                    None => self.letzter[kanal],
                };
                aus.push((wert * 32768.0).round().clamp(-32768.0, 32767.0) as Sample);
            }
        }

        // Aufgefuellte Frames duerfen die Latenz nicht unbegrenzt wachsen lassen
        for q in &mut self.ausgang {
            if q.len() > self.max_ausgang {
                let zuviel = q.len() - self.max_ausgang;
                q.drain(..zuviel);
            }
        }
        Ok(aus)
    }
}

/// Wandler zwischen zwei Abtastraten, wird bei Ratenwechsel neu aufgebaut
#[derive(Default)]
pub struct SampleRateConverter {
    zustand: Option<Zustand>,
}

impl SampleRateConverter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wandelt `eingang` (interleaved, `kanaele` Kanaele) von `quelle` nach `ziel`
    pub fn resample(
        &mut self,
        eingang: &[Sample],
        quelle: u32,
        ziel: u32,
        kanaele: u16,
    ) -> AudioResult<Vec<Sample>> {
        if quelle == 0 || ziel == 0 || kanaele == 0 {
            return Err(AudioError::Resampler(format!(
                "Ungueltige Parameter: {} Hz -> {} Hz, {} Kanaele",
                quelle, ziel, kanaele
            )));
        }
        if quelle == ziel {
            self.zustand = None;
            return Ok(eingang.to_vec());
        }

        let kanaele = kanaele as usize;
        let neu_aufbauen = !matches!(&self.zustand, Some(z) if z.passt(quelle, ziel, kanaele));
        if neu_aufbauen {
            self.zustand = Some(Zustand::neu(quelle, ziel, kanaele)?);
        }
        match self.zustand.as_mut() {
            Some(z) => z.verarbeiten(eingang),
            None => Ok(Vec::new()),
        }
    }

    /// Aktuelles Ratenpaar, falls ein Wandler aufgebaut ist
    pub fn rates(&self) -> Option<(u32, u32)> {
        self.zustand.as_ref().map(|z| (z.quelle, z.ziel))
    }

    pub fn reset(&mut self) {
        self.zustand = None;
    }
}

/// `ceil(frames * ziel / quelle)`
pub fn ausgabe_frames(frames: usize, quelle: u32, ziel: u32) -> usize {
    if frames == 0 || quelle == 0 {
        return 0;
    }
    (frames as u64 * ziel as u64).div_ceil(quelle as u64) as usize
}

/// Verhaeltnis Ziel- zu Quellrate
pub fn resample_factor(quelle: u32, ziel: u32) -> f64 {
    if quelle == 0 {
        return 1.0;
    }
    ziel as f64 / quelle as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ton(frequenz: f64, rate: u32, sekunden: f64) -> Vec<Sample> {
        let n = (rate as f64 * sekunden) as usize;
        (0..n)
            .map(|i| {
                ((i as f64 * frequenz * std::f64::consts::TAU / rate as f64).sin() * 12000.0)
                    as Sample
            })
            .collect()
    }

    fn goertzel(samples: &[Sample], frequenz: f64, rate: u32) -> f64 {
        let w = std::f64::consts::TAU * frequenz / rate as f64;
        let koeff = 2.0 * w.cos();
        let (mut s1, mut s2) = (0.0f64, 0.0f64);
        for &x in samples {
            let s0 = x as f64 + koeff * s1 - s2;
            s2 = s1;
            s1 = s0;
        }
        s1 * s1 + s2 * s2 - koeff * s1 * s2
    }

    fn in_frames(
        wandler: &mut SampleRateConverter,
        eingang: &[Sample],
        quelle: u32,
        ziel: u32,
    ) -> Vec<Sample> {
        let frame = quelle as usize / 50;
        let mut aus = Vec::new();
        for stueck in eingang.chunks(frame) {
            let teil = wandler.resample(stueck, quelle, ziel, 1).unwrap();
            assert_eq!(teil.len(), (stueck.len() * ziel as usize).div_ceil(quelle as usize));
            aus.extend(teil);
        }
        aus
    }

    fn hin_und_zurueck(rate: u32, zwischen: u32) {
        let eingang = ton(1000.0, rate, 2.0);
        let mut hin = SampleRateConverter::new();
        let mut zurueck = SampleRateConverter::new();
        let mitte = in_frames(&mut hin, &eingang, rate, zwischen);
        let aus = in_frames(&mut zurueck, &mitte, zwischen, rate);
        assert_eq!(aus.len(), eingang.len());

        let n = rate as usize / 2;
        let ref_energie = goertzel(&eingang[eingang.len() - n..], 1000.0, rate);
        let aus_energie = goertzel(&aus[aus.len() - n..], 1000.0, rate);
        let anteil = aus_energie / ref_energie;
        assert!(anteil >= 0.9, "{} -> {} -> {}: nur {:.3}", rate, zwischen, rate, anteil);
    }

    #[test]
    fn schmalband_zu_breitband_und_zurueck() {
        hin_und_zurueck(8000, 16000);
    }

    #[test]
    fn codec_raten_ueber_48k() {
        for rate in [8000, 16000, 32000, 44100, 48000] {
            hin_und_zurueck(rate, 48000);
        }
    }

    #[test]
    fn gleiche_rate_ist_durchreichung() {
        let mut w = SampleRateConverter::new();
        let eingang: Vec<Sample> = (0..160).collect();
        assert_eq!(w.resample(&eingang, 8000, 8000, 1).unwrap(), eingang);
        assert!(w.rates().is_none());
    }

    #[test]
    fn ausgabelaenge_bei_ungeraden_frames() {
        let mut w = SampleRateConverter::new();
        for (n, erwartet) in [(37usize, 7usize), (5, 1), (101, 19), (960, 175), (1, 1)] {
            let aus = w.resample(&vec![100; n], 44100, 8000, 1).unwrap();
            assert_eq!(aus.len(), erwartet, "{} Frames", n);
        }
        assert_eq!(ausgabe_frames(0, 44100, 8000), 0);
    }

    #[test]
    fn neuaufbau_bei_ratenwechsel() {
        let mut w = SampleRateConverter::new();
        w.resample(&[0; 160], 8000, 16000, 1).unwrap();
        assert_eq!(w.rates(), Some((8000, 16000)));
        let aus = w.resample(&[0; 320], 16000, 48000, 1).unwrap();
        assert_eq!(aus.len(), 960);
        assert_eq!(w.rates(), Some((16000, 48000)));
    }

    #[test]
    fn stereo_bleibt_interleaved() {
        let mut w = SampleRateConverter::new();
        let aus = w.resample(&[0; 320], 8000, 16000, 2).unwrap();
        assert_eq!(aus.len(), 640);
    }

    #[test]
    fn ungueltige_raten() {
        let mut w = SampleRateConverter::new();
        assert!(w.resample(&[0; 10], 0, 8000, 1).is_err());
        assert_eq!(resample_factor(8000, 48000), 6.0);
    }
}
