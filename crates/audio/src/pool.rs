//! Ringpuffer-Pool: Puffer pro Anruf, Bindungen und der dringende Puffer
//!
//! Jeder Puffer gehoert einem Schreiber (Anruf oder Audio-Schicht unter
//! [`DEFAULT_ID`]). Gelesen wird ueber Bindungen: ein Leser mischt alle
//! Puffer, an die er gebunden ist. Der dringende Puffer (DTMF, Signaltoene)
//! ist getrennt und wird im Hot-Path zuerst geleert.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use fernsprech_core::Sample;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::error::{AudioError, AudioResult};
use crate::ringbuffer::RingBuffer;

/// Puffer-Id der Audio-Schicht (Mikrofon schreibt, Lautsprecher liest)
pub const DEFAULT_ID: &str = "audiolayer_id";

pub const NORMAL_KAPAZITAET: usize = 32000;
pub const DRINGEND_KAPAZITAET: usize = 8000;

const DRINGEND_ID: &str = "dringend";

/// Art eines registrierten Lesers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderKind {
    Normal,
    Urgent,
}

/// Kapazitaeten des Pools (in Samples)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolConfig {
    pub normal_kapazitaet: usize,
    pub dringend_kapazitaet: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            normal_kapazitaet: NORMAL_KAPAZITAET,
            dringend_kapazitaet: DRINGEND_KAPAZITAET,
        }
    }
}

/// Verwaltet alle Ringpuffer einer Sitzung
pub struct RingBufferPool {
    config: PoolConfig,
    puffer: RwLock<HashMap<String, Arc<RingBuffer>>>,
    /// Leser -> Quellpuffer
    bindungen: Mutex<HashMap<String, BTreeSet<String>>>,
    dringend: RingBuffer,
    dringende_leser: Mutex<HashSet<String>>,
    interne_rate: AtomicU32,
}

impl RingBufferPool {
    pub fn new(config: PoolConfig) -> Self {
        let pool = Self {
            config,
            puffer: RwLock::new(HashMap::new()),
            bindungen: Mutex::new(HashMap::new()),
            dringend: RingBuffer::new(DRINGEND_ID, config.dringend_kapazitaet),
            dringende_leser: Mutex::new(HashSet::new()),
            interne_rate: AtomicU32::new(8000),
        };
        pool.create_ring_buffer(DEFAULT_ID);
        pool
    }

    pub fn config(&self) -> PoolConfig {
        self.config
    }

    // -----------------------------------------------------------------------
    // Puffer
    // -----------------------------------------------------------------------

    /// Liefert den Puffer `id`, legt ihn bei Bedarf an
    pub fn create_ring_buffer(&self, id: &str) -> Arc<RingBuffer> {
        if let Some(rb) = self.puffer.read().get(id) {
            return Arc::clone(rb);
        }
        let mut puffer = self.puffer.write();
        let rb = puffer.entry(id.to_string()).or_insert_with(|| {
            debug!("Ringpuffer '{}' angelegt", id);
            Arc::new(RingBuffer::new(id, self.config.normal_kapazitaet))
        });
        Arc::clone(rb)
    }

    pub fn ring_buffer(&self, id: &str) -> Option<Arc<RingBuffer>> {
        self.puffer.read().get(id).cloned()
    }

    /// Entfernt einen Puffer samt aller Bindungen darauf
    pub fn remove_ring_buffer(&self, id: &str) {
        if id == DEFAULT_ID {
            return;
        }
        if self.puffer.write().remove(id).is_some() {
            let mut bindungen = self.bindungen.lock();
            for quellen in bindungen.values_mut() {
                quellen.remove(id);
            }
            debug!("Ringpuffer '{}' entfernt", id);
        }
    }

    // -----------------------------------------------------------------------
    // Leser
    // -----------------------------------------------------------------------

    /// Registriert einen Leser; ein zweiter dringender Leser gleicher Id
    /// wird abgelehnt
    pub fn register_reader(&self, leser: &str, art: ReaderKind) -> AudioResult<()> {
        match art {
            ReaderKind::Normal => {
                self.bindungen.lock().entry(leser.to_string()).or_default();
            }
            ReaderKind::Urgent => {
                let mut dringende = self.dringende_leser.lock();
                if !dringende.insert(leser.to_string()) {
                    warn!("Dringender Leser '{}' bereits registriert", leser);
                    return Err(AudioError::DringenderLeserVorhanden(leser.to_string()));
                }
                self.dringend.create_read_offset(leser);
            }
        }
        Ok(())
    }

    pub fn has_urgent_reader(&self, leser: &str) -> bool {
        self.dringende_leser.lock().contains(leser)
    }

    /// Entfernt nur die dringende Registrierung
    pub fn unregister_urgent_reader(&self, leser: &str) {
        if self.dringende_leser.lock().remove(leser) {
            self.dringend.remove_read_offset(leser);
        }
    }

    /// Entfernt den Leser vollstaendig samt Bindungen
    pub fn unregister_reader(&self, leser: &str) {
        self.unregister_urgent_reader(leser);
        if let Some(quellen) = self.bindungen.lock().remove(leser) {
            for quelle in quellen {
                if let Some(rb) = self.ring_buffer(&quelle) {
                    rb.remove_read_offset(leser);
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Bindungen
    // -----------------------------------------------------------------------

    fn binden(&self, leser: &str, quelle: &str) {
        let rb = self.create_ring_buffer(quelle);
        let neu = self
            .bindungen
            .lock()
            .entry(leser.to_string())
            .or_default()
            .insert(quelle.to_string());
        if neu {
            rb.create_read_offset(leser);
        }
    }

    fn loesen(&self, leser: &str, quelle: &str) {
        let entfernt = self
            .bindungen
            .lock()
            .get_mut(leser)
            .map(|q| q.remove(quelle))
            .unwrap_or(false);
        if entfernt {
            if let Some(rb) = self.ring_buffer(quelle) {
                rb.remove_read_offset(leser);
            }
        }
    }

    /// Beide Seiten lesen jeweils den Puffer der anderen
    pub fn bind_call(&self, a: &str, b: &str) {
        info!("Binde '{}' <-> '{}'", a, b);
        self.create_ring_buffer(a);
        self.create_ring_buffer(b);
        self.binden(a, b);
        self.binden(b, a);
    }

    /// Nur `prozess` liest den Puffer von `anruf` (z.B. Aufnahme)
    pub fn bind_half_duplex_out(&self, prozess: &str, anruf: &str) {
        debug!("Binde halbduplex '{}' <- '{}'", prozess, anruf);
        self.binden(prozess, anruf);
    }

    pub fn unbind_call(&self, a: &str, b: &str) {
        info!("Loese '{}' <-> '{}'", a, b);
        self.loesen(a, b);
        self.loesen(b, a);
    }

    pub fn unbind_half_duplex_out(&self, prozess: &str, anruf: &str) {
        self.loesen(prozess, anruf);
    }

    /// Loest alle Bindungen in beide Richtungen, an denen `id` beteiligt ist
    pub fn unbind_all(&self, id: &str) {
        let quellen: Vec<String> = self
            .bindungen
            .lock()
            .get(id)
            .map(|q| q.iter().cloned().collect())
            .unwrap_or_default();
        for quelle in quellen {
            self.unbind_call(id, &quelle);
        }
        let leser: Vec<String> = self
            .bindungen
            .lock()
            .iter()
            .filter(|(_, q)| q.contains(id))
            .map(|(l, _)| l.clone())
            .collect();
        for l in leser {
            self.loesen(&l, id);
        }
    }

    /// Quellpuffer, an die `leser` gebunden ist
    pub fn bound_sources(&self, leser: &str) -> Vec<String> {
        self.bindungen
            .lock()
            .get(leser)
            .map(|q| q.iter().cloned().collect())
            .unwrap_or_default()
    }

    // -----------------------------------------------------------------------
    // Daten
    // -----------------------------------------------------------------------

    /// Schreibt in den Puffer `id`
    pub fn put_data(&self, id: &str, samples: &[Sample]) {
        self.create_ring_buffer(id).put(samples);
    }

    /// Mischt alle gebundenen Puffer von `leser` nach `ziel`
    ///
    /// `verstaerkung` liefert den Faktor je Quellpuffer. Gibt die groesste
    /// gelesene Anzahl zurueck; der Rest von `ziel` ist Stille.
    pub fn get_data(
        &self,
        leser: &str,
        ziel: &mut [Sample],
        verstaerkung: impl Fn(&str) -> f32,
    ) -> usize {
        let mut zwischen = Vec::new();
        self.get_data_into(leser, ziel, &mut zwischen, verstaerkung)
    }

    /// Wie [`get_data`](Self::get_data), liest aber ueber den vom
    /// Aufrufer gehaltenen Zwischenpuffer
    pub fn get_data_into(
        &self,
        leser: &str,
        ziel: &mut [Sample],
        zwischen: &mut Vec<Sample>,
        verstaerkung: impl Fn(&str) -> f32,
    ) -> usize {
        ziel.fill(0);
        let quellen = self.bound_sources(leser);
        if quellen.is_empty() {
            return 0;
        }

        zwischen.resize(ziel.len(), 0);
        let mut max = 0;
        for quelle in &quellen {
            let Some(rb) = self.ring_buffer(quelle) else {
                continue;
            };
            let n = rb.get(&mut zwischen[..ziel.len()], leser);
            let g = verstaerkung(quelle);
            for (z, &x) in ziel.iter_mut().zip(&zwischen[..n]) {
                let summe = *z as f32 + x as f32 * g;
                *z = summe.round().clamp(Sample::MIN as f32, Sample::MAX as f32) as Sample;
            }
            max = max.max(n);
        }
        max
    }

    /// Minimum der verfuegbaren Samples ueber alle gebundenen Puffer
    pub fn available_for_get(&self, leser: &str) -> usize {
        self.bound_sources(leser)
            .iter()
            .filter_map(|q| self.ring_buffer(q))
            .map(|rb| rb.available_for_get(leser))
            .min()
            .unwrap_or(0)
    }

    pub fn discard(&self, n: usize, leser: &str) {
        for quelle in self.bound_sources(leser) {
            if let Some(rb) = self.ring_buffer(&quelle) {
                rb.discard(n, leser);
            }
        }
    }

    pub fn flush(&self, leser: &str) {
        for quelle in self.bound_sources(leser) {
            if let Some(rb) = self.ring_buffer(&quelle) {
                rb.flush(leser);
            }
        }
    }

    pub fn flush_all(&self) {
        for rb in self.puffer.read().values() {
            rb.flush_all();
        }
        self.dringend.flush_all();
    }

    // -----------------------------------------------------------------------
    // Dringender Puffer
    // -----------------------------------------------------------------------

    pub fn put_urgent(&self, samples: &[Sample]) {
        self.dringend.put(samples);
    }

    pub fn urgent_available(&self, leser: &str) -> usize {
        self.dringend.available_for_get(leser)
    }

    pub fn get_urgent(&self, ziel: &mut [Sample], leser: &str) -> usize {
        self.dringend.get(ziel, leser)
    }

    pub fn discard_urgent(&self, n: usize, leser: &str) -> usize {
        self.dringend.discard(n, leser)
    }

    // -----------------------------------------------------------------------
    // Interne Abtastrate
    // -----------------------------------------------------------------------

    pub fn internal_sampling_rate(&self) -> u32 {
        self.interne_rate.load(Ordering::Acquire)
    }

    /// Setzt die interne Rate; bei Aenderung werden alle Puffer geleert
    pub fn set_internal_sampling_rate(&self, rate: u32) -> bool {
        let alt = self.interne_rate.swap(rate, Ordering::AcqRel);
        if alt == rate {
            return false;
        }
        info!("Interne Abtastrate: {} Hz -> {} Hz", alt, rate);
        self.flush_all();
        true
    }
}

impl Default for RingBufferPool {
    fn default() -> Self {
        Self::new(PoolConfig::default())
    }
}

impl std::fmt::Debug for RingBufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingBufferPool")
            .field("puffer", &self.puffer.read().len())
            .field("interne_rate", &self.internal_sampling_rate())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eins(_: &str) -> f32 {
        1.0
    }

    #[test]
    fn anruf_bindung_in_beide_richtungen() {
        let pool = RingBufferPool::default();
        pool.bind_call("call:1", DEFAULT_ID);

        pool.put_data(DEFAULT_ID, &[1, 2, 3]);
        pool.put_data("call:1", &[9, 8]);

        let mut aus = [0; 3];
        assert_eq!(pool.get_data("call:1", &mut aus, eins), 3);
        assert_eq!(aus, [1, 2, 3]);
        let mut aus = [0; 4];
        assert_eq!(pool.get_data(DEFAULT_ID, &mut aus, eins), 2);
        assert_eq!(aus, [9, 8, 0, 0]);
    }

    #[test]
    fn mischen_mit_verstaerkung_und_saettigung() {
        let pool = RingBufferPool::default();
        pool.bind_call("a", DEFAULT_ID);
        pool.bind_call("b", DEFAULT_ID);
        pool.put_data("a", &[100, 30000]);
        pool.put_data("b", &[100, 30000]);

        let mut aus = [0; 2];
        let n = pool.get_data(DEFAULT_ID, &mut aus, |q| if q == "a" { 0.5 } else { 1.0 });
        assert_eq!(n, 2);
        assert_eq!(aus[0], 150);
        assert_eq!(aus[1], Sample::MAX);
    }

    #[test]
    fn zwischenpuffer_wird_wiederverwendet() {
        let pool = RingBufferPool::default();
        pool.bind_call("a", DEFAULT_ID);
        let mut zwischen = Vec::with_capacity(160);
        let adresse = zwischen.as_ptr();
        for runde in 0..3 {
            pool.put_data("a", &[runde; 160]);
            let mut aus = [0; 160];
            assert_eq!(pool.get_data_into(DEFAULT_ID, &mut aus, &mut zwischen, eins), 160);
            assert_eq!(aus, [runde; 160]);
        }
        assert_eq!(zwischen.as_ptr(), adresse);
        assert_eq!(zwischen.capacity(), 160);
    }

    #[test]
    fn verfuegbar_ist_minimum() {
        let pool = RingBufferPool::default();
        pool.bind_call("a", DEFAULT_ID);
        pool.bind_call("b", DEFAULT_ID);
        pool.put_data("a", &[0; 10]);
        pool.put_data("b", &[0; 4]);
        assert_eq!(pool.available_for_get(DEFAULT_ID), 4);
        pool.discard(4, DEFAULT_ID);
        assert_eq!(pool.available_for_get(DEFAULT_ID), 0);
    }

    #[test]
    fn halbduplex_und_loesen() {
        let pool = RingBufferPool::default();
        pool.bind_half_duplex_out("aufnahme", "call:7");
        assert_eq!(pool.bound_sources("aufnahme"), vec!["call:7".to_string()]);
        assert!(pool.bound_sources("call:7").is_empty());

        pool.unbind_half_duplex_out("aufnahme", "call:7");
        assert!(pool.bound_sources("aufnahme").is_empty());
        let rb = pool.ring_buffer("call:7").unwrap();
        assert!(!rb.has_reader("aufnahme"));
    }

    #[test]
    fn alles_loesen() {
        let pool = RingBufferPool::default();
        pool.bind_call("x", DEFAULT_ID);
        pool.bind_call("x", "y");
        pool.bind_half_duplex_out("rec", "x");
        pool.unbind_all("x");
        assert!(pool.bound_sources("x").is_empty());
        assert!(pool.bound_sources(DEFAULT_ID).is_empty());
        assert!(pool.bound_sources("y").is_empty());
        assert!(pool.bound_sources("rec").is_empty());
    }

    #[test]
    fn zweiter_dringender_leser_abgelehnt() {
        let pool = RingBufferPool::default();
        pool.register_reader(DEFAULT_ID, ReaderKind::Urgent).unwrap();
        let err = pool.register_reader(DEFAULT_ID, ReaderKind::Urgent);
        assert!(matches!(err, Err(AudioError::DringenderLeserVorhanden(_))));
        pool.unregister_reader(DEFAULT_ID);
        assert!(pool.register_reader(DEFAULT_ID, ReaderKind::Urgent).is_ok());
    }

    #[test]
    fn dringender_puffer() {
        let pool = RingBufferPool::default();
        pool.register_reader(DEFAULT_ID, ReaderKind::Urgent).unwrap();
        pool.put_urgent(&[5; 20]);
        assert_eq!(pool.urgent_available(DEFAULT_ID), 20);
        let mut aus = [0; 8];
        assert_eq!(pool.get_urgent(&mut aus, DEFAULT_ID), 8);
        assert_eq!(pool.discard_urgent(100, DEFAULT_ID), 12);
        assert_eq!(pool.urgent_available(DEFAULT_ID), 0);
    }

    #[test]
    fn ratenwechsel_leert_puffer() {
        let pool = RingBufferPool::default();
        pool.bind_call("a", DEFAULT_ID);
        pool.put_data("a", &[1; 50]);
        assert!(!pool.set_internal_sampling_rate(8000));
        assert_eq!(pool.available_for_get(DEFAULT_ID), 50);
        assert!(pool.set_internal_sampling_rate(16000));
        assert_eq!(pool.available_for_get(DEFAULT_ID), 0);
        assert_eq!(pool.internal_sampling_rate(), 16000);
    }

    #[test]
    fn entfernter_puffer_verschwindet_aus_bindungen() {
        let pool = RingBufferPool::default();
        pool.bind_call("a", DEFAULT_ID);
        pool.remove_ring_buffer("a");
        assert!(pool.bound_sources(DEFAULT_ID).is_empty());
        pool.remove_ring_buffer(DEFAULT_ID);
        assert!(pool.ring_buffer(DEFAULT_ID).is_some());
    }
}
