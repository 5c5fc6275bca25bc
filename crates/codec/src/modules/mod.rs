//! Eingebaute Codec-Module
//!
//! Jedes Modul exportiert die ABI-Symbole ueber eine [`StaticModule`]-Tabelle.

pub mod g711;
pub mod g722;
pub mod opus;

use crate::loader::StaticModule;

/// Alle einkompilierten Module
pub static BUILTIN: &[&StaticModule] = &[
    &g711::ULAW_MODULE,
    &g711::ALAW_MODULE,
    &g722::MODULE,
    &opus::MODULE,
];
