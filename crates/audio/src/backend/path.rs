//! Hot-Path zwischen Ringpuffer-Pool und Geraet
//!
//! Wiedergabe: dringender Puffer vor Hoerton vor normalem Pool. Aufnahme:
//! Verstaerkung, Gleichanteil-Filter, Wandlung auf die interne Rate und
//! optional Echounterdrueckung gegen das Wiedergabesignal. Fehler werden
//! hier nie weitergereicht, sondern durch Stille ersetzt.

use std::sync::Arc;

use fernsprech_core::Sample;
use tracing::{debug, trace, warn};

use crate::dsp::{AudioProcessor, DcBlocker, EchoCanceller};
use crate::error::AudioResult;
use crate::pool::{ReaderKind, RingBufferPool, DEFAULT_ID};
use crate::resampler::{resample_factor, SampleRateConverter};
use crate::tone::ToneState;
use crate::volume::VolumeControl;

/// Zustand des Hot-Paths einer laufenden Sitzung
pub struct AudioPath {
    pool: Arc<RingBufferPool>,
    volume: Arc<VolumeControl>,
    toene: Arc<ToneState>,
    wandler_aus: SampleRateConverter,
    wandler_ein: SampleRateConverter,
    dc: DcBlocker,
    echo: EchoCanceller,
    /// Geraet bringt eigene Echounterdrueckung mit
    echo_extern: bool,
    puffer: Vec<Sample>,
    zwischen: Vec<Sample>,
}

impl AudioPath {
    /// Meldet die Audio-Schicht als dringenden Leser an
    pub fn new(
        pool: Arc<RingBufferPool>,
        volume: Arc<VolumeControl>,
        toene: Arc<ToneState>,
    ) -> AudioResult<Self> {
        pool.register_reader(DEFAULT_ID, ReaderKind::Urgent)?;
        let mut echo = EchoCanceller::default();
        echo.set_enabled(false);
        Ok(Self {
            pool,
            volume,
            toene,
            wandler_aus: SampleRateConverter::new(),
            wandler_ein: SampleRateConverter::new(),
            dc: DcBlocker::default(),
            echo,
            echo_extern: false,
            puffer: Vec::new(),
            zwischen: Vec::new(),
        })
    }

    /// Schaltet die eigene Echounterdrueckung ein oder aus
    pub fn set_echo_cancel(&mut self, an: bool) {
        if an != self.echo.is_enabled() {
            self.echo.reset();
        }
        self.echo.set_enabled(an);
    }

    /// Das Aufnahmegeraet unterdrueckt Echos bereits selbst
    pub fn set_external_echo_cancel(&mut self, an: bool) {
        if an != self.echo_extern {
            debug!(geraet = an, "Echounterdrueckung des Geraets");
        }
        self.echo_extern = an;
    }

    pub fn external_echo_cancel(&self) -> bool {
        self.echo_extern
    }

    fn echo_aktiv(&self) -> bool {
        self.echo.is_enabled() && !self.echo_extern
    }

    pub fn pool(&self) -> &Arc<RingBufferPool> {
        &self.pool
    }

    /// Wandelt auf die Geraeterate, hoechstens `frei` Samples
    fn ausgabe_wandeln(
        &mut self,
        daten: &[Sample],
        intern: u32,
        geraet: u32,
        frei: usize,
    ) -> Vec<Sample> {
        self.echo.feed_reference(daten);
        match self.wandler_aus.resample(daten, intern, geraet, 1) {
            Ok(mut d) => {
                d.truncate(frei);
                d
            }
            Err(e) => {
                warn!("Wiedergabe-Wandlung fehlgeschlagen: {}", e);
                Vec::new()
            }
        }
    }

    /// Erzeugt bis zu `frei` Samples bei `geraet_rate` fuer die Wiedergabe
    ///
    /// Mit `klingel_geraet` gehoert der Dateiton dem Klingelton-Geraet.
    pub fn playback(&mut self, frei: usize, geraet_rate: u32, klingel_geraet: bool) -> Vec<Sample> {
        if frei == 0 {
            return Vec::new();
        }
        let intern = self.pool.internal_sampling_rate();
        let faktor = resample_factor(intern, geraet_rate);
        let max_intern = ((frei as f64 / faktor).floor() as usize).max(1);

        // 1. Dringender Puffer
        let dringend = self.pool.urgent_available(DEFAULT_ID);
        if dringend > 0 {
            let n = dringend.min(max_intern);
            self.puffer.resize(n, 0);
            let gelesen = self.pool.get_urgent(&mut self.puffer[..n], DEFAULT_ID);
            self.pool.discard(gelesen, DEFAULT_ID);
            let mut daten = std::mem::take(&mut self.puffer);
            daten.truncate(gelesen);
            self.volume.apply_playback(&mut daten);
            let aus = self.ausgabe_wandeln(&daten, intern, geraet_rate, frei);
            self.puffer = daten;
            trace!("Dringend: {} Samples", gelesen);
            return aus;
        }

        // 2. Hoerton oder Dateiton
        let datei = !klingel_geraet && self.toene.file_active();
        if self.toene.tone_active() || datei {
            let mut aus = vec![0; frei];
            if !self.toene.fill_tone(&mut aus, geraet_rate) {
                self.toene.fill_file(&mut aus, geraet_rate);
            }
            self.volume.apply_playback(&mut aus);
            self.echo.feed_silence(max_intern);
            return aus;
        }

        // 3. Normaler Pool
        let verfuegbar = self.pool.available_for_get(DEFAULT_ID);
        if verfuegbar == 0 {
            self.echo.feed_silence(max_intern);
            return vec![0; frei];
        }
        let n = verfuegbar.min(max_intern);
        let mut daten = std::mem::take(&mut self.puffer);
        daten.clear();
        daten.resize(n, 0);
        let volume = Arc::clone(&self.volume);
        self.pool.get_data_into(DEFAULT_ID, &mut daten, &mut self.zwischen, |quelle| {
            volume.call_gain(quelle)
        });
        self.volume.apply_playback(&mut daten);
        let aus = self.ausgabe_wandeln(&daten, intern, geraet_rate, frei);
        self.puffer = daten;
        aus
    }

    /// Samples fuer das Klingelton-Geraet: Dateiton oder Stille
    pub fn ringtone(&mut self, frei: usize, geraet_rate: u32) -> Vec<Sample> {
        let mut aus = vec![0; frei];
        self.toene.fill_file(&mut aus, geraet_rate);
        aus
    }

    /// Verarbeitet Mikrofon-Samples und legt sie im Standardpuffer ab
    pub fn capture(&mut self, eingang: &[Sample], geraet_rate: u32) {
        if eingang.is_empty() {
            return;
        }
        let mut daten = eingang.to_vec();
        self.volume.apply_capture(&mut daten);
        self.dc.process(&mut daten);

        let intern = self.pool.internal_sampling_rate();
        match self.wandler_ein.resample(&daten, geraet_rate, intern, 1) {
            Ok(mut gewandelt) => {
                if self.echo_aktiv() {
                    self.echo.process(&mut gewandelt);
                }
                self.pool.put_data(DEFAULT_ID, &gewandelt)
            }
            Err(e) => warn!("Aufnahme-Wandlung fehlgeschlagen: {}", e),
        }
    }
}

impl Drop for AudioPath {
    fn drop(&mut self) {
        self.pool.unregister_urgent_reader(DEFAULT_ID);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tone::{ToneKind, ToneRegion};

    fn pfad() -> (AudioPath, Arc<RingBufferPool>, Arc<ToneState>) {
        let pool = Arc::new(RingBufferPool::default());
        let toene = Arc::new(ToneState::new());
        let p = AudioPath::new(
            Arc::clone(&pool),
            Arc::new(VolumeControl::default()),
            Arc::clone(&toene),
        )
        .unwrap();
        (p, pool, toene)
    }

    #[test]
    fn stille_ohne_daten() {
        let (mut p, _, _) = pfad();
        assert_eq!(p.playback(160, 8000, false), vec![0; 160]);
    }

    #[test]
    fn dringend_verdraengt_normal() {
        let (mut p, pool, _) = pfad();
        pool.bind_call("call:1", DEFAULT_ID);
        pool.put_data("call:1", &[100; 160]);
        pool.put_urgent(&[7; 80]);

        let aus = p.playback(160, 8000, false);
        assert_eq!(aus, vec![7; 80]);
        // Gleiche Menge aus dem normalen Puffer verworfen
        assert_eq!(pool.available_for_get(DEFAULT_ID), 80);
    }

    #[test]
    fn hoerton_vor_normalem_pool() {
        let (mut p, pool, toene) = pfad();
        pool.bind_call("call:1", DEFAULT_ID);
        pool.put_data("call:1", &[0; 160]);
        toene.play_tone(ToneKind::Dial, ToneRegion::Europa);
        let aus = p.playback(160, 8000, false);
        assert!(aus.iter().any(|&s| s != 0));
        assert_eq!(pool.available_for_get(DEFAULT_ID), 160);
    }

    #[test]
    fn normaler_pool_mit_wandlung() {
        let (mut p, pool, _) = pfad();
        pool.bind_call("call:1", DEFAULT_ID);
        pool.put_data("call:1", &[500; 160]);
        let aus = p.playback(960, 48000, false);
        assert_eq!(aus.len(), 960);
        assert_eq!(pool.available_for_get(DEFAULT_ID), 0);
    }

    #[test]
    fn ausgabe_nie_laenger_als_platz() {
        let (mut p, pool, _) = pfad();
        pool.bind_call("call:1", DEFAULT_ID);
        pool.put_data("call:1", &[500; 160]);
        let aus = p.playback(3, 48000, false);
        assert!(aus.len() <= 3, "{} Samples", aus.len());
        pool.put_urgent(&[7; 10]);
        assert!(p.playback(5, 48000, false).len() <= 5);
    }

    fn echo_nach_wiedergabe(p: &mut AudioPath, pool: &RingBufferPool) -> Vec<Sample> {
        pool.bind_call("call:1", DEFAULT_ID);
        pool.put_data("call:1", &[4000; 640]);
        for _ in 0..4 {
            p.playback(160, 8000, false);
        }
        p.capture(&[0; 160], 8000);
        let mut aus = vec![0; 160];
        let n = pool.ring_buffer(DEFAULT_ID).unwrap().get(&mut aus, "call:1");
        assert_eq!(n, 160);
        aus
    }

    #[test]
    fn echounterdrueckung_zieht_wiedergabe_ab() {
        let (mut p, pool, _) = pfad();
        p.set_echo_cancel(true);
        let aus = echo_nach_wiedergabe(&mut p, &pool);
        assert!(aus.iter().all(|&s| s < -2000), "{:?}", &aus[..4]);
    }

    #[test]
    fn echounterdrueckung_des_geraets_hat_vorrang() {
        let (mut p, pool, _) = pfad();
        p.set_echo_cancel(true);
        p.set_external_echo_cancel(true);
        assert_eq!(echo_nach_wiedergabe(&mut p, &pool), vec![0; 160]);
    }

    #[test]
    fn ohne_echounterdrueckung_unveraendert() {
        let (mut p, pool, _) = pfad();
        assert_eq!(echo_nach_wiedergabe(&mut p, &pool), vec![0; 160]);
    }

    #[test]
    fn aufnahme_landet_im_standardpuffer() {
        let (mut p, pool, _) = pfad();
        pool.bind_call("call:1", DEFAULT_ID);
        p.capture(&[1000; 960], 48000);
        let rb = pool.ring_buffer(DEFAULT_ID).unwrap();
        assert_eq!(rb.available_for_get("call:1"), 160);
    }

    #[test]
    fn zweiter_pfad_am_selben_pool_abgelehnt() {
        let (p, pool, toene) = pfad();
        let zweiter = AudioPath::new(
            Arc::clone(&pool),
            Arc::new(VolumeControl::default()),
            Arc::clone(&toene),
        );
        assert!(zweiter.is_err());
        pool.bind_call("call:1", DEFAULT_ID);
        drop(p);
        // Bindungen ueberleben das Ende der Sitzung
        assert_eq!(pool.bound_sources(DEFAULT_ID), vec!["call:1".to_string()]);
        assert!(AudioPath::new(pool, Arc::new(VolumeControl::default()), toene).is_ok());
    }
}
