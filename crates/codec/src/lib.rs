//! fernsprech-codec – Codec-Modulsystem
//!
//! Codecs liegen als Module vor, die eine feste Erzeugen/Zerstoeren-ABI
//! exportieren. Die [`CodecRegistry`] durchsucht die bekannten
//! Verzeichnisse, laedt zugelassene Module und gibt pro Gespraech
//! unabhaengige Codec-Instanzen heraus.
//!
//! Eingebaute Module:
//! - G.711 µ-law / A-law (PT 0 / 8)
//! - G.722 64 kbit/s (PT 9)
//! - Opus (dynamischer PT 104)

pub mod abi;
pub mod discovery;
pub mod error;
pub mod loader;
pub mod modules;
pub mod registry;
pub mod types;

// Bequeme Re-Exporte der wichtigsten Typen
pub use discovery::{search_paths, seems_valid, ALLOW_LIST};
pub use error::{CodecError, CodecResult};
pub use loader::{ModuleLoader, StaticLoader, StaticModule};
pub use registry::{CodecInstance, CodecRegistry};
pub use types::{Codec, CodecDescriptor};
