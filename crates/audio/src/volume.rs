//! Lautstaerke und Stummschaltung fuer Aufnahme und Wiedergabe
//!
//! Wird zwischen Steuerflaeche und Hot-Path geteilt. Verstaerkungen werden
//! pro Sample geglaettet (keine Klicks), Stummschaltung wirkt sofort.
//! Zusaetzlich gibt es eine Verstaerkung pro Anruf fuer das Mischen.

use std::collections::HashMap;

use fernsprech_core::Sample;
use parking_lot::Mutex;

const GLAETTUNG: f32 = 0.995;
const MAX_VERSTAERKUNG: f32 = 2.0;

#[derive(Debug, Clone, Copy)]
struct Kanal {
    aktuell: f32,
    ziel: f32,
    stumm: bool,
}

impl Kanal {
    fn neu(verstaerkung: f32) -> Self {
        Self {
            aktuell: verstaerkung,
            ziel: verstaerkung,
            stumm: false,
        }
    }

    fn anwenden(&mut self, samples: &mut [Sample]) {
        if self.stumm {
            samples.fill(0);
            return;
        }
        for s in samples.iter_mut() {
            self.aktuell = GLAETTUNG * self.aktuell + (1.0 - GLAETTUNG) * self.ziel;
            let v = *s as f32 * self.aktuell;
            *s = v.round().clamp(Sample::MIN as f32, Sample::MAX as f32) as Sample;
        }
    }
}

struct Inner {
    capture: Kanal,
    playback: Kanal,
    pro_anruf: HashMap<String, f32>,
}

/// Lautstaerke-Steuerung eines Backends
pub struct VolumeControl {
    inner: Mutex<Inner>,
}

impl VolumeControl {
    pub fn new(capture: f32, playback: f32) -> Self {
        Self {
            inner: Mutex::new(Inner {
                capture: Kanal::neu(capture.clamp(0.0, MAX_VERSTAERKUNG)),
                playback: Kanal::neu(playback.clamp(0.0, MAX_VERSTAERKUNG)),
                pro_anruf: HashMap::new(),
            }),
        }
    }

    /// Setzt die Aufnahme-Verstaerkung (sanfter Uebergang)
    pub fn set_capture_gain(&self, v: f32) {
        self.inner.lock().capture.ziel = v.clamp(0.0, MAX_VERSTAERKUNG);
    }

    pub fn capture_gain(&self) -> f32 {
        self.inner.lock().capture.ziel
    }

    /// Setzt die Wiedergabe-Verstaerkung (sanfter Uebergang)
    pub fn set_playback_gain(&self, v: f32) {
        self.inner.lock().playback.ziel = v.clamp(0.0, MAX_VERSTAERKUNG);
    }

    pub fn playback_gain(&self) -> f32 {
        self.inner.lock().playback.ziel
    }

    pub fn set_capture_muted(&self, stumm: bool) {
        self.inner.lock().capture.stumm = stumm;
    }

    pub fn is_capture_muted(&self) -> bool {
        self.inner.lock().capture.stumm
    }

    pub fn set_playback_muted(&self, stumm: bool) {
        self.inner.lock().playback.stumm = stumm;
    }

    pub fn is_playback_muted(&self) -> bool {
        self.inner.lock().playback.stumm
    }

    /// Verstaerkung fuer einen Anruf beim Mischen
    pub fn set_call_gain(&self, anruf: &str, v: f32) {
        self.inner
            .lock()
            .pro_anruf
            .insert(anruf.to_string(), v.clamp(0.0, MAX_VERSTAERKUNG));
    }

    /// 1.0 wenn fuer den Anruf nichts gesetzt ist
    pub fn call_gain(&self, anruf: &str) -> f32 {
        self.inner
            .lock()
            .pro_anruf
            .get(anruf)
            .copied()
            .unwrap_or(1.0)
    }

    pub fn remove_call(&self, anruf: &str) {
        self.inner.lock().pro_anruf.remove(anruf);
    }

    pub fn apply_capture(&self, samples: &mut [Sample]) {
        self.inner.lock().capture.anwenden(samples);
    }

    pub fn apply_playback(&self, samples: &mut [Sample]) {
        self.inner.lock().playback.anwenden(samples);
    }
}

impl Default for VolumeControl {
    fn default() -> Self {
        Self::new(1.0, 1.0)
    }
}

impl std::fmt::Debug for VolumeControl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("VolumeControl")
            .field("capture", &inner.capture)
            .field("playback", &inner.playback)
            .field("anrufe", &inner.pro_anruf.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_ist_neutral() {
        let v = VolumeControl::default();
        let mut s = [1000, -1000, 0];
        v.apply_playback(&mut s);
        assert_eq!(s, [1000, -1000, 0]);
        assert_eq!(v.call_gain("call:x"), 1.0);
    }

    #[test]
    fn stumm_wirkt_sofort_und_getrennt() {
        let v = VolumeControl::default();
        v.set_capture_muted(true);
        let mut mic = [500; 4];
        let mut laut = [500; 4];
        v.apply_capture(&mut mic);
        v.apply_playback(&mut laut);
        assert_eq!(mic, [0; 4]);
        assert_eq!(laut, [500; 4]);
        assert!(v.is_capture_muted());
        assert!(!v.is_playback_muted());
    }

    #[test]
    fn verstaerkung_naehert_sich_ziel() {
        let v = VolumeControl::default();
        v.set_playback_gain(0.5);
        let mut s = vec![10000; 4000];
        v.apply_playback(&mut s);
        // Erstes Sample kaum veraendert, letztes beim Ziel
        assert!(s[0] > 9900);
        assert!((s[3999] - 5000).abs() < 10);
    }

    #[test]
    fn saettigung_statt_ueberlauf() {
        let v = VolumeControl::new(2.0, 1.0);
        let mut s = [30000, -30000];
        v.apply_capture(&mut s);
        assert_eq!(s, [Sample::MAX, Sample::MIN]);
    }

    #[test]
    fn anruf_verstaerkung_begrenzt() {
        let v = VolumeControl::default();
        v.set_call_gain("call:1", 7.0);
        assert_eq!(v.call_gain("call:1"), MAX_VERSTAERKUNG);
        v.remove_call("call:1");
        assert_eq!(v.call_gain("call:1"), 1.0);
    }
}
