//! Daemon-Konfiguration
//!
//! Wird beim Start aus einer TOML-Datei geladen. Jeder Abschnitt hat
//! Standardwerte; ohne Datei laeuft der Daemon mit Hardware-Backend,
//! 8 kHz und den eingebauten Codecs.

use std::path::{Path, PathBuf};

use fernsprech_audio::backend::OpenDirection;
use fernsprech_audio::{OpenParams, PoolConfig};
use fernsprech_core::PayloadTyp;
use fernsprech_observability::LogFormat;
use serde::{Deserialize, Serialize};

/// Umgebungsvariable mit dem Pfad der Konfigurationsdatei
pub const ENV_CONFIG: &str = "FERNSPRECH_CONFIG";
pub const STANDARD_PFAD: &str = "fernsprech.toml";

/// Vollstaendige Daemon-Konfiguration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub logging: LoggingEinstellungen,
    pub audio: AudioEinstellungen,
    pub codecs: CodecEinstellungen,
    pub ringpuffer: RingpufferEinstellungen,
    pub aufnahme: AufnahmeEinstellungen,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingEinstellungen {
    /// Filter-Direktive, z.B. "info" oder "fernsprech_audio=debug,info"
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingEinstellungen {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: LogFormat::Text,
        }
    }
}

/// Welche Backend-Variante gebaut wird
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendArt {
    #[default]
    Hardware,
    Server,
    /// Simulierter Server ohne Geraete
    Null,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioEinstellungen {
    pub backend: BackendArt,
    /// Geraete-Indizes; leer = Standardgeraet
    pub eingabe: Option<usize>,
    pub ausgabe: Option<usize>,
    pub klingelton: Option<usize>,
    pub abtastrate: u32,
    pub frame_groesse: usize,
    pub richtung: OpenDirection,
    pub plugin: String,
    pub capture_gain: f32,
    pub playback_gain: f32,
    /// Eigene Echounterdrueckung, sofern das Geraet keine mitbringt
    pub echo_unterdrueckung: bool,
    /// Server-Backend nach Verbindungsverlust einmal neu aufbauen
    pub neu_verbinden: bool,
}

impl Default for AudioEinstellungen {
    fn default() -> Self {
        Self {
            backend: BackendArt::Hardware,
            eingabe: None,
            ausgabe: None,
            klingelton: None,
            abtastrate: 8000,
            frame_groesse: 160,
            richtung: OpenDirection::Both,
            plugin: "default".into(),
            capture_gain: 1.0,
            playback_gain: 1.0,
            echo_unterdrueckung: false,
            neu_verbinden: true,
        }
    }
}

impl AudioEinstellungen {
    pub fn open_params(&self) -> OpenParams {
        OpenParams {
            input_index: self.eingabe,
            output_index: self.ausgabe,
            ringtone_index: self.klingelton,
            sample_rate: self.abtastrate,
            frame_size: self.frame_groesse,
            direction: self.richtung,
            plugin: self.plugin.clone(),
            echo_cancel: self.echo_unterdrueckung,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CodecEinstellungen {
    /// Zusaetzliche Suchverzeichnisse, nach den Standardpfaden
    pub verzeichnisse: Vec<PathBuf>,
    /// Bevorzugte Reihenfolge (Payload-Typen); leer = alle geladenen
    pub reihenfolge: Vec<PayloadTyp>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RingpufferEinstellungen {
    pub normal: usize,
    pub dringend: usize,
}

impl Default for RingpufferEinstellungen {
    fn default() -> Self {
        let p = PoolConfig::default();
        Self {
            normal: p.normal_kapazitaet,
            dringend: p.dringend_kapazitaet,
        }
    }
}

impl RingpufferEinstellungen {
    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            normal_kapazitaet: self.normal,
            dringend_kapazitaet: self.dringend,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AufnahmeEinstellungen {
    /// Zielverzeichnis fuer Gespraechsaufnahmen
    pub verzeichnis: PathBuf,
    /// Jeden gebundenen Anruf automatisch aufnehmen
    pub immer: bool,
}

impl Default for AufnahmeEinstellungen {
    fn default() -> Self {
        Self {
            verzeichnis: PathBuf::from("aufnahmen"),
            immer: false,
        }
    }
}

impl DaemonConfig {
    /// Laedt die Konfiguration aus einer TOML-Datei.
    /// Fehlt die Datei, gelten die Standardwerte.
    pub fn laden(pfad: impl AsRef<Path>) -> anyhow::Result<Self> {
        let pfad = pfad.as_ref();
        match std::fs::read_to_string(pfad) {
            Ok(inhalt) => {
                let config: Self = toml::from_str(&inhalt).map_err(|e| {
                    anyhow::anyhow!("Konfigurationsfehler in '{}': {e}", pfad.display())
                })?;
                config.pruefen()?;
                Ok(config)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(
                    pfad = %pfad.display(),
                    "Konfigurationsdatei nicht gefunden, verwende Standardwerte"
                );
                Ok(Self::default())
            }
            Err(e) => Err(anyhow::anyhow!(
                "Konfigurationsdatei '{}' nicht lesbar: {e}",
                pfad.display()
            )),
        }
    }

    /// Pfad aus `FERNSPRECH_CONFIG`, sonst `fernsprech.toml`
    pub fn pfad_aus_env() -> PathBuf {
        std::env::var_os(ENV_CONFIG)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(STANDARD_PFAD))
    }

    fn pruefen(&self) -> anyhow::Result<()> {
        if self.audio.abtastrate == 0 || self.audio.frame_groesse == 0 {
            anyhow::bail!("audio.abtastrate und audio.frame_groesse muessen > 0 sein");
        }
        if self.ringpuffer.normal == 0 || self.ringpuffer.dringend == 0 {
            anyhow::bail!("Ringpuffer-Kapazitaeten muessen > 0 sein");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn standardwerte() {
        let cfg = DaemonConfig::default();
        assert_eq!(cfg.audio.backend, BackendArt::Hardware);
        assert_eq!(cfg.audio.abtastrate, 8000);
        assert_eq!(cfg.ringpuffer.normal, 32000);
        assert_eq!(cfg.ringpuffer.dringend, 8000);
        assert_eq!(cfg.logging.format, LogFormat::Text);
        assert!(cfg.audio.neu_verbinden);
        assert!(!cfg.audio.echo_unterdrueckung);
        assert_eq!(cfg.aufnahme.verzeichnis, PathBuf::from("aufnahmen"));
        assert!(!cfg.aufnahme.immer);
    }

    #[test]
    fn teilweise_konfiguration() {
        let toml = r#"
            [audio]
            backend = "server"
            abtastrate = 16000
            klingelton = 2

            echo_unterdrueckung = true

            [codecs]
            reihenfolge = [9, 0]

            [aufnahme]
            verzeichnis = "/var/lib/fernsprech"
            immer = true
        "#;
        let cfg: DaemonConfig = toml::from_str(toml).unwrap();
        assert_eq!(cfg.audio.backend, BackendArt::Server);
        assert_eq!(cfg.audio.abtastrate, 16000);
        assert_eq!(cfg.audio.frame_groesse, 160);
        assert_eq!(cfg.codecs.reihenfolge, vec![9, 0]);

        let p = cfg.audio.open_params();
        assert_eq!(p.ringtone_index, Some(2));
        assert_eq!(p.output_index, None);
        assert_eq!(p.sample_rate, 16000);
        assert!(p.echo_cancel);
        assert!(cfg.aufnahme.immer);
        assert_eq!(cfg.aufnahme.verzeichnis, PathBuf::from("/var/lib/fernsprech"));
    }

    #[test]
    fn fehlende_datei_liefert_standard() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = DaemonConfig::laden(dir.path().join("gibt-es-nicht.toml")).unwrap();
        assert_eq!(cfg.audio.plugin, "default");
    }

    #[test]
    fn datei_laden_und_pruefen() {
        let mut datei = tempfile::NamedTempFile::new().unwrap();
        writeln!(datei, "[logging]\nformat = \"json\"\n[ringpuffer]\ndringend = 4000").unwrap();
        let cfg = DaemonConfig::laden(datei.path()).unwrap();
        assert_eq!(cfg.logging.format, LogFormat::Json);
        assert_eq!(cfg.ringpuffer.pool_config().dringend_kapazitaet, 4000);

        let mut kaputt = tempfile::NamedTempFile::new().unwrap();
        writeln!(kaputt, "[audio]\nabtastrate = 0").unwrap();
        assert!(DaemonConfig::laden(kaputt.path()).is_err());
    }
}
