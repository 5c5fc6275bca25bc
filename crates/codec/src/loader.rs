//! Modul-Lader
//!
//! [`ModuleLoader`] oeffnet einen Kandidaten und liefert eine
//! [`ModuleLibrary`], aus der die ABI-Symbole aufgeloest werden.
//! [`StaticLoader`] bedient sich aus der fest einkompilierten Modultabelle:
//! die Datei auf der Platte schaltet das Modul frei, ausgefuehrt wird nur
//! Code aus diesem Binary.

use std::path::Path;

use tracing::debug;

use crate::abi::{ModuleLibrary, Symbol};
use crate::discovery::{seems_valid, short_name};
use crate::error::{CodecError, CodecResult};

/// Oeffnet Codec-Module
pub trait ModuleLoader: Send + Sync {
    fn open(&self, pfad: &Path) -> CodecResult<Box<dyn ModuleLibrary>>;
}

/// Einkompiliertes Modul mit seiner Symboltabelle
#[derive(Debug)]
pub struct StaticModule {
    pub name: &'static str,
    pub symbols: &'static [(&'static str, Symbol)],
}

/// Geoeffnetes statisches Modul
struct StaticHandle(&'static StaticModule);

impl ModuleLibrary for StaticHandle {
    fn name(&self) -> &str {
        self.0.name
    }

    fn resolve(&self, symbol: &str) -> Option<Symbol> {
        self.0
            .symbols
            .iter()
            .find(|(name, _)| *name == symbol)
            .map(|(_, s)| *s)
    }
}

impl Drop for StaticHandle {
    fn drop(&mut self) {
        debug!("Modul '{}' geschlossen", self.0.name);
    }
}

/// Lader fuer einkompilierte Module
pub struct StaticLoader {
    modules: Vec<&'static StaticModule>,
}

impl StaticLoader {
    /// Lader mit einer eigenen Modultabelle
    pub fn neu(modules: Vec<&'static StaticModule>) -> Self {
        Self { modules }
    }

    /// Lader mit allen eingebauten Codecs
    pub fn eingebaut() -> Self {
        Self::neu(crate::modules::BUILTIN.to_vec())
    }

    /// Kurznamen aller bekannten Module
    pub fn module_names(&self) -> Vec<&'static str> {
        self.modules.iter().map(|m| m.name).collect()
    }
}

impl Default for StaticLoader {
    fn default() -> Self {
        Self::eingebaut()
    }
}

impl ModuleLoader for StaticLoader {
    fn open(&self, pfad: &Path) -> CodecResult<Box<dyn ModuleLibrary>> {
        let datei = pfad
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default();

        // Zweite Pruefung, falls jemand am Scan vorbei laedt
        if !seems_valid(datei) {
            return Err(CodecError::NichtZugelassen(datei.to_string()));
        }
        let kurz = short_name(datei).unwrap_or_default();

        let meta = std::fs::metadata(pfad)?;
        if !meta.is_file() {
            return Err(CodecError::ModulNichtVerfuegbar(format!(
                "{} ist keine Datei",
                pfad.display()
            )));
        }

        let modul = self
            .modules
            .iter()
            .find(|m| m.name == kurz)
            .ok_or_else(|| CodecError::ModulNichtVerfuegbar(kurz.to_string()))?;

        debug!("Modul '{}' geoeffnet ({})", modul.name, pfad.display());
        Ok(Box::new(StaticHandle(modul)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::CREATE_SYMBOL;
    use crate::discovery::module_file_name;
    use tempfile::TempDir;

    fn datei_anlegen(dir: &TempDir, name: &str) -> std::path::PathBuf {
        let pfad = dir.path().join(name);
        std::fs::write(&pfad, b"").unwrap();
        pfad
    }

    #[test]
    fn eingebautes_modul_oeffnen() {
        let dir = TempDir::new().unwrap();
        let pfad = datei_anlegen(&dir, &module_file_name("ulaw"));
        let lader = StaticLoader::eingebaut();
        let modul = lader.open(&pfad).unwrap();
        assert_eq!(modul.name(), "ulaw");
        assert!(matches!(modul.resolve(CREATE_SYMBOL), Some(Symbol::Create(_))));
        assert!(modul.resolve("gibt_es_nicht").is_none());
    }

    #[test]
    fn zugelassen_aber_nicht_einkompiliert() {
        let dir = TempDir::new().unwrap();
        let pfad = datei_anlegen(&dir, &module_file_name("gsm"));
        let lader = StaticLoader::eingebaut();
        assert!(matches!(
            lader.open(&pfad),
            Err(CodecError::ModulNichtVerfuegbar(_))
        ));
    }

    #[test]
    fn fehlende_datei_ist_io_fehler() {
        let dir = TempDir::new().unwrap();
        let pfad = dir.path().join(module_file_name("alaw"));
        let lader = StaticLoader::eingebaut();
        assert!(matches!(lader.open(&pfad), Err(CodecError::Io(_))));
    }

    #[test]
    fn nicht_zugelassener_name_wird_nie_geoeffnet() {
        let dir = TempDir::new().unwrap();
        let pfad = datei_anlegen(&dir, "libevil.so");
        let lader = StaticLoader::eingebaut();
        assert!(matches!(
            lader.open(&pfad),
            Err(CodecError::NichtZugelassen(_))
        ));
    }

    #[test]
    fn eingebaute_namen_sind_zugelassen() {
        for name in StaticLoader::eingebaut().module_names() {
            assert!(crate::ALLOW_LIST.contains(&name), "{name} fehlt");
        }
    }
}
