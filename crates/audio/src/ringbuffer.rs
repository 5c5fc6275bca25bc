//! Ringpuffer mit einem Schreiber und beliebig vielen Lesern
//!
//! Positionen werden als absolute Sample-Zaehler gefuehrt. Ein Leser kann
//! nie mehr als die Kapazitaet zurueckliegen: beim Ueberlauf wird sein
//! Cursor auf das aelteste noch vorhandene Sample gezogen. Der Schreiber
//! wartet nie auf Leser.

use std::collections::HashMap;

use fernsprech_core::Sample;
use parking_lot::Mutex;
use tracing::{debug, trace};

struct Inner {
    daten: Vec<Sample>,
    /// Anzahl jemals geschriebener Samples
    geschrieben: u64,
    /// Leser -> absolute Leseposition
    leser: HashMap<String, u64>,
    ueberlaeufe: u64,
}

impl Inner {
    fn kapazitaet(&self) -> u64 {
        self.daten.len() as u64
    }

    fn aeltestes(&self) -> u64 {
        self.geschrieben.saturating_sub(self.kapazitaet())
    }

    fn verfuegbar(&self, pos: u64) -> usize {
        (self.geschrieben - pos) as usize
    }
}

/// Ringpuffer fuer interleaved PCM
pub struct RingBuffer {
    id: String,
    inner: Mutex<Inner>,
}

impl RingBuffer {
    /// Erstellt einen leeren Puffer mit fester Kapazitaet (in Samples)
    pub fn new(id: impl Into<String>, kapazitaet: usize) -> Self {
        Self {
            id: id.into(),
            inner: Mutex::new(Inner {
                daten: vec![0; kapazitaet.max(1)],
                geschrieben: 0,
                leser: HashMap::new(),
                ueberlaeufe: 0,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kapazitaet(&self) -> usize {
        self.inner.lock().daten.len()
    }

    /// Legt einen Lese-Cursor an der aktuellen Schreibposition an
    pub fn create_read_offset(&self, leser: &str) {
        let mut inner = self.inner.lock();
        let pos = inner.geschrieben;
        if inner.leser.insert(leser.to_string(), pos).is_none() {
            debug!("Ringpuffer '{}': Leser '{}' angelegt", self.id, leser);
        }
    }

    pub fn remove_read_offset(&self, leser: &str) {
        if self.inner.lock().leser.remove(leser).is_some() {
            debug!("Ringpuffer '{}': Leser '{}' entfernt", self.id, leser);
        }
    }

    pub fn has_reader(&self, leser: &str) -> bool {
        self.inner.lock().leser.contains_key(leser)
    }

    pub fn reader_count(&self) -> usize {
        self.inner.lock().leser.len()
    }

    /// Haengt Samples an; verdraengt bei Bedarf die aeltesten
    pub fn put(&self, samples: &[Sample]) {
        if samples.is_empty() {
            return;
        }
        let mut inner = self.inner.lock();
        let kap = inner.daten.len();

        // Mehr als die Kapazitaet: nur der Rest bleibt ohnehin erhalten
        let uebersprungen = samples.len().saturating_sub(kap);
        inner.geschrieben += uebersprungen as u64;
        let samples = &samples[uebersprungen..];

        let start = (inner.geschrieben % kap as u64) as usize;
        let erster = samples.len().min(kap - start);
        inner.daten[start..start + erster].copy_from_slice(&samples[..erster]);
        inner.daten[..samples.len() - erster].copy_from_slice(&samples[erster..]);
        inner.geschrieben += samples.len() as u64;

        let aeltestes = inner.aeltestes();
        let mut verdraengt = false;
        for pos in inner.leser.values_mut() {
            if *pos < aeltestes {
                *pos = aeltestes;
                verdraengt = true;
            }
        }
        if verdraengt {
            inner.ueberlaeufe += 1;
            trace!("Ringpuffer '{}': Ueberlauf, langsame Leser vorgezogen", self.id);
        }
    }

    /// Kopiert bis zu `ziel.len()` Samples fuer `leser`
    ///
    /// Gibt die Anzahl kopierter Samples zurueck; weniger bedeutet Stille.
    pub fn get(&self, ziel: &mut [Sample], leser: &str) -> usize {
        let mut inner = self.inner.lock();
        let Some(&pos) = inner.leser.get(leser) else {
            return 0;
        };
        let n = ziel.len().min(inner.verfuegbar(pos));
        if n == 0 {
            return 0;
        }

        let kap = inner.daten.len();
        let start = (pos % kap as u64) as usize;
        let erster = n.min(kap - start);
        ziel[..erster].copy_from_slice(&inner.daten[start..start + erster]);
        ziel[erster..n].copy_from_slice(&inner.daten[..n - erster]);

        if let Some(p) = inner.leser.get_mut(leser) {
            *p = pos + n as u64;
        }
        n
    }

    /// Rueckt den Cursor ohne Kopie vor
    pub fn discard(&self, n: usize, leser: &str) -> usize {
        let mut inner = self.inner.lock();
        let Some(&pos) = inner.leser.get(leser) else {
            return 0;
        };
        let n = n.min(inner.verfuegbar(pos));
        if let Some(p) = inner.leser.get_mut(leser) {
            *p = pos + n as u64;
        }
        n
    }

    /// Verfuegbare Samples fuer `leser`
    pub fn available_for_get(&self, leser: &str) -> usize {
        let inner = self.inner.lock();
        inner
            .leser
            .get(leser)
            .map(|&pos| inner.verfuegbar(pos))
            .unwrap_or(0)
    }

    /// Verwirft alle ungelesenen Daten eines Lesers
    pub fn flush(&self, leser: &str) {
        let mut inner = self.inner.lock();
        let ende = inner.geschrieben;
        if let Some(p) = inner.leser.get_mut(leser) {
            *p = ende;
        }
    }

    /// Verwirft alle ungelesenen Daten aller Leser
    pub fn flush_all(&self) {
        let mut inner = self.inner.lock();
        let ende = inner.geschrieben;
        for p in inner.leser.values_mut() {
            *p = ende;
        }
    }

    /// Anzahl Schreibvorgaenge, die Leser verdraengt haben
    pub fn ueberlaeufe(&self) -> u64 {
        self.inner.lock().ueberlaeufe
    }
}

impl std::fmt::Debug for RingBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("RingBuffer")
            .field("id", &self.id)
            .field("kapazitaet", &inner.daten.len())
            .field("geschrieben", &inner.geschrieben)
            .field("leser", &inner.leser.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn folge(von: i16, n: usize) -> Vec<Sample> {
        (0..n as i16).map(|i| von.wrapping_add(i)).collect()
    }

    #[test]
    fn hin_und_zurueck() {
        let rb = RingBuffer::new("t", 64);
        rb.create_read_offset("a");
        let eingang = folge(1, 50);
        rb.put(&eingang);
        let mut aus = vec![0; 50];
        assert_eq!(rb.get(&mut aus, "a"), 50);
        assert_eq!(aus, eingang);
        assert_eq!(rb.available_for_get("a"), 0);
    }

    #[test]
    fn umbruch_ueber_das_ende() {
        let rb = RingBuffer::new("t", 16);
        rb.create_read_offset("a");
        let mut aus = vec![0; 10];
        rb.put(&folge(0, 10));
        rb.get(&mut aus, "a");
        rb.put(&folge(100, 12));
        let mut aus = vec![0; 12];
        assert_eq!(rb.get(&mut aus, "a"), 12);
        assert_eq!(aus, folge(100, 12));
    }

    #[test]
    fn ueberlauf_zieht_langsamen_leser_vor() {
        let rb = RingBuffer::new("t", 8);
        rb.create_read_offset("langsam");
        rb.put(&folge(0, 5));
        rb.put(&folge(5, 7)); // 12 geschrieben, 8 behalten: 4..12
        assert_eq!(rb.available_for_get("langsam"), 8);
        let mut aus = vec![0; 8];
        assert_eq!(rb.get(&mut aus, "langsam"), 8);
        assert_eq!(aus, folge(4, 8));
        assert_eq!(rb.ueberlaeufe(), 1);
    }

    #[test]
    fn schreiben_groesser_als_kapazitaet() {
        let rb = RingBuffer::new("t", 8);
        rb.create_read_offset("a");
        rb.put(&folge(0, 20));
        let mut aus = vec![0; 20];
        assert_eq!(rb.get(&mut aus, "a"), 8);
        assert_eq!(&aus[..8], &folge(12, 8)[..]);
    }

    #[test]
    fn neuer_leser_beginnt_an_schreibposition() {
        let rb = RingBuffer::new("t", 32);
        rb.put(&folge(0, 10));
        rb.create_read_offset("spaet");
        assert_eq!(rb.available_for_get("spaet"), 0);
        rb.put(&folge(10, 3));
        let mut aus = vec![0; 3];
        assert_eq!(rb.get(&mut aus, "spaet"), 3);
        assert_eq!(aus, vec![10, 11, 12]);
    }

    #[test]
    fn unterlauf_liefert_weniger() {
        let rb = RingBuffer::new("t", 32);
        rb.create_read_offset("a");
        rb.put(&folge(0, 4));
        let mut aus = vec![7; 10];
        assert_eq!(rb.get(&mut aus, "a"), 4);
        assert_eq!(&aus[4..], &[7; 6]);
    }

    #[test]
    fn discard_und_flush() {
        let rb = RingBuffer::new("t", 32);
        rb.create_read_offset("a");
        rb.create_read_offset("b");
        rb.put(&folge(0, 10));
        assert_eq!(rb.discard(4, "a"), 4);
        assert_eq!(rb.available_for_get("a"), 6);
        assert_eq!(rb.discard(100, "a"), 6);
        rb.flush("b");
        assert_eq!(rb.available_for_get("b"), 0);
        rb.put(&folge(0, 2));
        rb.flush_all();
        assert_eq!(rb.available_for_get("a"), 0);
        assert_eq!(rb.available_for_get("b"), 0);
    }

    #[test]
    fn unbekannter_leser() {
        let rb = RingBuffer::new("t", 8);
        rb.put(&[1, 2, 3]);
        let mut aus = [0; 3];
        assert_eq!(rb.get(&mut aus, "niemand"), 0);
        assert_eq!(rb.discard(3, "niemand"), 0);
    }

    #[test]
    fn leser_unabhaengig() {
        let rb = RingBuffer::new("t", 32);
        rb.create_read_offset("a");
        rb.create_read_offset("b");
        rb.put(&folge(0, 6));
        let mut aus = [0; 6];
        rb.get(&mut aus, "a");
        assert_eq!(rb.available_for_get("a"), 0);
        assert_eq!(rb.available_for_get("b"), 6);
        rb.remove_read_offset("b");
        assert!(!rb.has_reader("b"));
        assert_eq!(rb.reader_count(), 1);
    }
}
