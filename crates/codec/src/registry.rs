//! Codec Registry – Vorlagen nach Payload-Typ, Klone pro Gespraech
//!
//! Die Modultabelle wird nur beim Scan und beim Herunterfahren veraendert.
//! Im laufenden Betrieb sind alle Zugriffe Lesezugriffe auf `DashMap`s.
//!
//! Jede [`CodecInstance`] haelt eine Referenz auf ihr Modul. Ein Modul
//! wird erst zerstoert, wenn die Registry es freigegeben hat und der
//! letzte Klon verschwunden ist.

use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use fernsprech_core::PayloadTyp;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::abi::{ModuleLibrary, Symbol, CREATE_SYMBOL, DESTROY_SYMBOL};
use crate::discovery::seems_valid;
use crate::error::{CodecError, CodecResult};
use crate::loader::ModuleLoader;
use crate::types::{Codec, CodecDescriptor};

// ---------------------------------------------------------------------------
// Geladenes Modul
// ---------------------------------------------------------------------------

/// Paar aus geoeffnetem Modul und der Vorlage, die es erzeugt hat
pub struct LoadedModule {
    library: Option<Box<dyn ModuleLibrary>>,
    template: Mutex<Option<Box<dyn Codec>>>,
    descriptor: CodecDescriptor,
    pfad: PathBuf,
}

impl LoadedModule {
    fn new(library: Box<dyn ModuleLibrary>, template: Box<dyn Codec>, pfad: PathBuf) -> Self {
        let descriptor = template.descriptor().clone();
        Self {
            library: Some(library),
            template: Mutex::new(Some(template)),
            descriptor,
            pfad,
        }
    }

    pub fn descriptor(&self) -> &CodecDescriptor {
        &self.descriptor
    }

    pub fn pfad(&self) -> &Path {
        &self.pfad
    }

    /// Klont die Vorlage; Panics der Codec-Implementierung werden abgefangen
    fn clone_template(&self) -> CodecResult<Box<dyn Codec>> {
        let vorlage = self.template.lock();
        let vorlage = vorlage
            .as_ref()
            .ok_or_else(|| CodecError::Konstruktion("Vorlage bereits zerstoert".into()))?;
        match panic::catch_unwind(AssertUnwindSafe(|| vorlage.clone_codec())) {
            Ok(ergebnis) => ergebnis,
            Err(_) => Err(CodecError::Konstruktion(format!(
                "Panic beim Klonen von {}",
                self.descriptor.sdp_name()
            ))),
        }
    }
}

impl Drop for LoadedModule {
    fn drop(&mut self) {
        let vorlage = self.template.get_mut().take();
        let library = self.library.take();
        let (Some(vorlage), Some(library)) = (vorlage, library) else {
            return;
        };

        match library.resolve(DESTROY_SYMBOL) {
            Some(Symbol::Destroy(zerstoeren)) => {
                zerstoeren(vorlage);
                info!(
                    "Codec-Modul '{}' entladen (PT {})",
                    library.name(),
                    self.descriptor.payload
                );
                drop(library);
            }
            _ => {
                error!(
                    "Symbol '{}' in {} nicht gefunden, Modul bleibt geoeffnet",
                    DESTROY_SYMBOL,
                    self.pfad.display()
                );
                std::mem::forget(vorlage);
                std::mem::forget(library);
            }
        }
    }
}

impl std::fmt::Debug for LoadedModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedModule")
            .field("descriptor", &self.descriptor)
            .field("pfad", &self.pfad)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Instanz pro Gespraech
// ---------------------------------------------------------------------------

/// Codec-Instanz fuer genau ein Gespraech
///
/// Haelt das Modul am Leben, solange die Instanz existiert.
pub struct CodecInstance {
    codec: Box<dyn Codec>,
    module: Arc<LoadedModule>,
}

impl CodecInstance {
    /// Pfad des Moduls, aus dem die Instanz stammt
    pub fn module_path(&self) -> &Path {
        self.module.pfad()
    }
}

impl std::ops::Deref for CodecInstance {
    type Target = dyn Codec;

    fn deref(&self) -> &Self::Target {
        self.codec.as_ref()
    }
}

impl std::ops::DerefMut for CodecInstance {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.codec.as_mut()
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Codec Registry – thread-sicher via DashMap
pub struct CodecRegistry {
    loader: Arc<dyn ModuleLoader>,
    /// Payload-Typ -> Modul mit Vorlage
    templates: DashMap<PayloadTyp, Arc<LoadedModule>>,
    /// In dieser Sitzung geladene Dateinamen
    geladen: DashMap<String, PayloadTyp>,
    /// Bevorzugte Reihenfolge fuer die Aushandlung
    reihenfolge: RwLock<Vec<PayloadTyp>>,
    leer_gemeldet: AtomicBool,
}

impl CodecRegistry {
    /// Erstellt eine leere Registry mit dem gegebenen Lader
    pub fn neu(loader: Arc<dyn ModuleLoader>) -> Self {
        Self {
            loader,
            templates: DashMap::new(),
            geladen: DashMap::new(),
            reihenfolge: RwLock::new(Vec::new()),
            leer_gemeldet: AtomicBool::new(false),
        }
    }

    /// Durchsucht die Verzeichnisse in der gegebenen Reihenfolge
    ///
    /// Gibt die Anzahl neu geladener Module zurueck. Fehler einzelner
    /// Kandidaten werden protokolliert und uebersprungen.
    pub fn scan(&self, verzeichnisse: &[PathBuf]) -> usize {
        let mut neu = 0;

        for dir in verzeichnisse {
            let eintraege = match std::fs::read_dir(dir) {
                Ok(e) => e,
                Err(e) => {
                    debug!("Codec-Verzeichnis {} nicht lesbar: {}", dir.display(), e);
                    continue;
                }
            };

            let mut namen: Vec<(String, PathBuf)> = eintraege
                .filter_map(|e| e.ok())
                .filter_map(|e| {
                    let name = e.file_name().to_str()?.to_string();
                    Some((name, e.path()))
                })
                .collect();
            namen.sort();

            for (name, pfad) in namen {
                if self.geladen.contains_key(&name) {
                    debug!("{} bereits geladen, uebersprungen", name);
                    continue;
                }
                if !seems_valid(&name) {
                    debug!("{} entspricht keinem zugelassenen Codec", name);
                    continue;
                }
                match self.load_module(&pfad) {
                    Ok(pt) => {
                        neu += 1;
                        debug!("{} -> PT {}", name, pt);
                    }
                    Err(e) => warn!("Codec-Modul {} uebersprungen: {}", pfad.display(), e),
                }
            }
        }

        if self.templates.is_empty() {
            if !self.leer_gemeldet.swap(true, Ordering::SeqCst) {
                error!(
                    "Konfigurationsfehler: keine Codecs gefunden in {:?}",
                    verzeichnisse
                );
            }
        } else if self.reihenfolge.read().is_empty() {
            self.set_default_order();
        }

        info!("Codec-Scan abgeschlossen: {} neu, {} gesamt", neu, self.templates.len());
        neu
    }

    /// Laedt ein einzelnes Modul und registriert seine Vorlage
    pub fn load_module(&self, pfad: &Path) -> CodecResult<PayloadTyp> {
        let library = self.loader.open(pfad)?;

        let erzeugen = match library.resolve(CREATE_SYMBOL) {
            Some(Symbol::Create(f)) => f,
            _ => {
                return Err(CodecError::SymbolFehlt {
                    symbol: CREATE_SYMBOL.to_string(),
                    pfad: pfad.to_path_buf(),
                })
            }
        };

        let vorlage = match panic::catch_unwind(erzeugen) {
            Ok(Ok(v)) => v,
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                return Err(CodecError::Konstruktion(format!(
                    "Panic beim Erzeugen aus {}",
                    pfad.display()
                )))
            }
        };

        let modul = Arc::new(LoadedModule::new(library, vorlage, pfad.to_path_buf()));
        let pt = modul.descriptor().payload;

        match self.templates.entry(pt) {
            Entry::Occupied(_) => return Err(CodecError::PayloadBelegt(pt)),
            Entry::Vacant(v) => {
                info!(
                    "Codec {} geladen (PT {}, {} kbit/s)",
                    modul.descriptor().sdp_name(),
                    pt,
                    modul.descriptor().bitrate_kbps
                );
                v.insert(modul);
            }
        }

        if let Some(name) = pfad.file_name().and_then(|n| n.to_str()) {
            self.geladen.insert(name.to_string(), pt);
        }
        Ok(pt)
    }

    /// Beschreibung zum Payload-Typ
    pub fn get_codec(&self, payload: PayloadTyp) -> Option<CodecDescriptor> {
        self.templates
            .get(&payload)
            .map(|m| m.descriptor().clone())
    }

    /// Sucht per SDP-Name; der erste Codec, dessen Name in `name` enthalten ist, gewinnt
    pub fn get_codec_by_name(&self, name: &str) -> Option<CodecDescriptor> {
        let gesucht = name.to_ascii_lowercase();
        self.codec_list().into_iter().find_map(|pt| {
            let desc = self.get_codec(pt)?;
            gesucht
                .contains(&desc.sdp_name().to_ascii_lowercase())
                .then_some(desc)
        })
    }

    /// Neue, unabhaengige Instanz fuer ein Gespraech
    ///
    /// `None` wenn kein Codec registriert ist oder das Klonen scheitert.
    pub fn instantiate_codec(&self, payload: PayloadTyp) -> Option<CodecInstance> {
        let module = match self.templates.get(&payload) {
            Some(m) => Arc::clone(m.value()),
            None => {
                debug!("Kein Codec fuer PT {}", payload);
                return None;
            }
        };

        match module.clone_template() {
            Ok(codec) => Some(CodecInstance { codec, module }),
            Err(e) => {
                warn!("PT {} derzeit nicht nutzbar: {}", payload, e);
                None
            }
        }
    }

    /// Anzahl lebender Instanzen eines Codecs
    pub fn active_instances(&self, payload: PayloadTyp) -> usize {
        self.templates
            .get(&payload)
            .map(|m| Arc::strong_count(m.value()) - 1)
            .unwrap_or(0)
    }

    /// Gibt ein Modul frei
    ///
    /// Zerstoert wird es erst, wenn keine Instanz mehr lebt.
    pub fn unload_module(&self, payload: PayloadTyp) -> bool {
        let Some((_, modul)) = self.templates.remove(&payload) else {
            return false;
        };
        self.geladen.retain(|_, pt| *pt != payload);
        self.reihenfolge.write().retain(|pt| *pt != payload);

        let offen = Arc::strong_count(&modul) - 1;
        if offen > 0 {
            info!(
                "Entladen von PT {} verzoegert bis {} Instanz(en) freigegeben sind",
                payload, offen
            );
        }
        true
    }

    /// Alle geladenen Payload-Typen, aufsteigend und ohne Duplikate
    pub fn codec_list(&self) -> Vec<PayloadTyp> {
        let mut liste: Vec<PayloadTyp> = self.templates.iter().map(|e| *e.key()).collect();
        liste.sort_unstable();
        liste.dedup();
        liste
    }

    /// Setzt die Reihenfolge auf alle geladenen Codecs
    pub fn set_default_order(&self) {
        *self.reihenfolge.write() = self.codec_list();
    }

    /// Uebernimmt eine Benutzerreihenfolge
    ///
    /// Unbekannte Payload-Typen werden verworfen, Duplikate entfernt.
    /// Gibt die tatsaechlich uebernommene Liste zurueck.
    pub fn save_active_codecs(&self, liste: &[PayloadTyp]) -> Vec<PayloadTyp> {
        let mut neu: Vec<PayloadTyp> = Vec::with_capacity(liste.len());
        for &pt in liste {
            if !self.templates.contains_key(&pt) {
                warn!("PT {} ist nicht geladen, aus Reihenfolge entfernt", pt);
                continue;
            }
            if !neu.contains(&pt) {
                neu.push(pt);
            }
        }
        *self.reihenfolge.write() = neu.clone();
        neu
    }

    /// Aktuelle Reihenfolge fuer die Aushandlung
    pub fn active_codecs(&self) -> Vec<PayloadTyp> {
        self.reihenfolge.read().clone()
    }

    /// Anzahl geladener Codecs
    pub fn anzahl(&self) -> usize {
        self.templates.len()
    }

    /// Gibt alle Module frei
    pub fn shutdown(&self) {
        for pt in self.codec_list() {
            self.unload_module(pt);
        }
        self.geladen.clear();
        debug!("Codec-Registry heruntergefahren");
    }
}

impl Drop for CodecRegistry {
    fn drop(&mut self) {
        self.shutdown();
    }
}
