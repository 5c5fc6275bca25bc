//! Modulsuche: Namenskonvention, Zulassungsliste, Suchpfade
//!
//! Ein Kandidat wird nur geoeffnet, wenn sein Dateiname exakt
//! `libcodec_<name>.<endung>` lautet und `<name>` in [`ALLOW_LIST`]
//! steht. Die Endung allein reicht nie.

use std::path::{Path, PathBuf};

/// Bekannte Codec-Kennungen
pub const ALLOW_LIST: &[&str] = &[
    "ulaw", "alaw", "g722", "gsm", "speex", "speex_wb", "speex_ub", "ilbc", "opus", "celt",
    "g729",
];

/// Praefix aller Modul-Dateien
pub const MODULE_PREFIX: &str = "libcodec_";

/// Endung gemeinsam genutzter Bibliotheken auf dieser Plattform
#[cfg(target_os = "macos")]
pub const PLATFORM_SUFFIX: &str = "dylib";
#[cfg(target_os = "windows")]
pub const PLATFORM_SUFFIX: &str = "dll";
#[cfg(not(any(target_os = "macos", target_os = "windows")))]
pub const PLATFORM_SUFFIX: &str = "so";

/// Umgebungsvariable mit zusaetzlichen Suchpfaden (durch `:` getrennt)
pub const ENV_OVERRIDE: &str = "FERNSPRECH_CODECS_PATH";

/// Installationsverzeichnis, beim Bauen ueber `FERNSPRECH_CODEC_DIR` setzbar
pub const INSTALL_DIR: &str = match option_env!("FERNSPRECH_CODEC_DIR") {
    Some(dir) => dir,
    None => "/usr/lib/fernsprech/codecs",
};

/// Liefert `<name>` aus `libcodec_<name>.<endung>`, ohne Zulassungspruefung
pub fn short_name(file_name: &str) -> Option<&str> {
    let rest = file_name.strip_prefix(MODULE_PREFIX)?;
    let name = rest.strip_suffix(PLATFORM_SUFFIX)?.strip_suffix('.')?;
    if name.is_empty() {
        return None;
    }
    Some(name)
}

/// Prueft Namenskonvention und Zulassungsliste
pub fn seems_valid(file_name: &str) -> bool {
    match short_name(file_name) {
        Some(name) => ALLOW_LIST.contains(&name),
        None => false,
    }
}

/// Dateiname des Moduls fuer einen Kurznamen
pub fn module_file_name(short: &str) -> String {
    format!("{MODULE_PREFIX}{short}.{PLATFORM_SUFFIX}")
}

/// Benutzerverzeichnis fuer Codec-Module
fn user_dir() -> Option<PathBuf> {
    if let Some(xdg) = std::env::var_os("XDG_CONFIG_HOME").filter(|v| !v.is_empty()) {
        return Some(PathBuf::from(xdg).join("fernsprech").join("codecs"));
    }
    std::env::var_os("HOME").map(|home| {
        PathBuf::from(home)
            .join(".config")
            .join("fernsprech")
            .join("codecs")
    })
}

/// Verzeichnis des laufenden Programms
fn program_dir() -> Option<PathBuf> {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
}

/// Geordnete Suchpfade
///
/// Reihenfolge: Benutzerverzeichnis, Installationsverzeichnis,
/// Umgebungsvariable, Programmverzeichnis, danach `extra`. Doppelte
/// Eintraege werden entfernt, die erste Position bleibt.
pub fn search_paths(extra: &[PathBuf]) -> Vec<PathBuf> {
    let mut pfade = Vec::new();
    pfade.extend(user_dir());
    pfade.push(PathBuf::from(INSTALL_DIR));
    if let Some(env) = std::env::var_os(ENV_OVERRIDE) {
        pfade.extend(std::env::split_paths(&env).filter(|p| !p.as_os_str().is_empty()));
    }
    pfade.extend(program_dir());
    pfade.extend(extra.iter().cloned());

    let mut gesehen = std::collections::HashSet::new();
    pfade.retain(|p| gesehen.insert(p.clone()));
    pfade
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zugelassene_namen() {
        assert!(seems_valid(&module_file_name("gsm")));
        assert!(seems_valid(&module_file_name("g722")));
        assert!(seems_valid(&module_file_name("speex_wb")));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn zugelassene_namen_linux() {
        assert!(seems_valid("libcodec_gsm.so"));
        assert!(!seems_valid("libcodec_gsm.dll"));
    }

    #[test]
    fn fremde_bibliothek_abgelehnt() {
        assert!(!seems_valid(&format!("libfoo.{PLATFORM_SUFFIX}")));
    }

    #[test]
    fn unbekannter_codec_abgelehnt() {
        assert!(!seems_valid(&module_file_name("totallymadeup")));
    }

    #[test]
    fn grenzfaelle_abgelehnt() {
        assert!(!seems_valid(&format!("libcodec_.{PLATFORM_SUFFIX}")));
        assert!(!seems_valid("libcodec_gsm"));
        assert!(!seems_valid(&format!("libcodec_gsm{PLATFORM_SUFFIX}")));
        assert!(!seems_valid(&format!("libcodec_gsm.{PLATFORM_SUFFIX}.bak")));
        assert!(!seems_valid(&format!("xlibcodec_gsm.{PLATFORM_SUFFIX}")));
    }

    #[test]
    fn kurzname_extrahieren() {
        assert_eq!(short_name(&module_file_name("ulaw")), Some("ulaw"));
        assert_eq!(short_name("readme.txt"), None);
    }

    #[test]
    fn suchpfade_ohne_duplikate() {
        let extra = vec![PathBuf::from(INSTALL_DIR), PathBuf::from("/opt/codecs")];
        let pfade = search_paths(&extra);
        let install = pfade
            .iter()
            .filter(|p| **p == PathBuf::from(INSTALL_DIR))
            .count();
        assert_eq!(install, 1);
        assert_eq!(pfade.last(), Some(&PathBuf::from("/opt/codecs")));
    }
}
