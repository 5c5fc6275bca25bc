//! Modul-ABI
//!
//! Jedes Codec-Modul exportiert genau zwei Einstiegspunkte: einen zum
//! Erzeugen der Vorlage und einen zum Zerstoeren. Die Versionsnummer ist
//! Teil des Symbolnamens. Aendert sich die [`Codec`]-Schnittstelle, wird
//! [`ABI_VERSION`] erhoeht; alte Module loesen dann nicht mehr auf und
//! werden beim Scan uebersprungen.

use crate::error::CodecResult;
use crate::types::Codec;

/// Aktuelle Version der Modul-ABI
pub const ABI_VERSION: u32 = 1;

/// Symbol zum Erzeugen der Codec-Vorlage
pub const CREATE_SYMBOL: &str = "fernsprech_codec_create_v1";

/// Symbol zum Zerstoeren der Codec-Vorlage
pub const DESTROY_SYMBOL: &str = "fernsprech_codec_destroy_v1";

/// Signatur des Erzeugen-Einstiegspunkts
pub type CreateFn = fn() -> CodecResult<Box<dyn Codec>>;

/// Signatur des Zerstoeren-Einstiegspunkts
pub type DestroyFn = fn(Box<dyn Codec>);

/// Ein aufgeloestes Symbol
#[derive(Clone, Copy)]
pub enum Symbol {
    Create(CreateFn),
    Destroy(DestroyFn),
}

impl std::fmt::Debug for Symbol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Create(_) => f.write_str("Symbol::Create"),
            Self::Destroy(_) => f.write_str("Symbol::Destroy"),
        }
    }
}

/// Ein geoeffnetes Modul, aus dem Symbole aufgeloest werden koennen
///
/// Das Schliessen des Moduls entspricht dem Drop des Objekts.
pub trait ModuleLibrary: Send + Sync {
    /// Kurzname des Moduls (z.B. "g722")
    fn name(&self) -> &str;

    /// Loest ein Symbol auf
    fn resolve(&self, symbol: &str) -> Option<Symbol>;
}

/// Baut den versionierten Symbolnamen
pub fn symbol_name(basis: &str, version: u32) -> String {
    format!("fernsprech_codec_{basis}_v{version}")
}

/// Standard-Zerstoerer fuer Module ohne eigene Aufraeumlogik
pub fn destroy_boxed(codec: Box<dyn Codec>) {
    drop(codec);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn symbolnamen_tragen_version() {
        assert_eq!(symbol_name("create", ABI_VERSION), CREATE_SYMBOL);
        assert_eq!(symbol_name("destroy", ABI_VERSION), DESTROY_SYMBOL);
        assert_ne!(symbol_name("create", ABI_VERSION + 1), CREATE_SYMBOL);
    }
}
