//! Geraete-Beschreibung, Topologie-Namen und cpal-Enumeration

use cpal::traits::{DeviceTrait, HostTrait};
use cpal::{Device, Host};
use tracing::{debug, warn};

use crate::error::{AudioError, AudioResult};

/// Sample-Format eines Geraets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SampleFormat {
    #[default]
    S16,
    F32,
    U8,
    Sonstiges,
}

impl From<cpal::SampleFormat> for SampleFormat {
    fn from(f: cpal::SampleFormat) -> Self {
        match f {
            cpal::SampleFormat::I16 => Self::S16,
            cpal::SampleFormat::F32 => Self::F32,
            cpal::SampleFormat::U8 => Self::U8,
            _ => Self::Sonstiges,
        }
    }
}

/// Beschreibung eines Wiedergabe- oder Aufnahmegeraets
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDescriptor {
    pub name: String,
    /// Beschreibung fuer die Anzeige ("<karte> - <pcm>")
    pub beschreibung: String,
    pub sample_rate: u32,
    pub channels: u16,
    pub format: SampleFormat,
    /// Monitor-Quelle eines Ausgangs (nie als Mikrofon anbieten)
    pub is_monitor: bool,
    pub echo_cancel: bool,
}

impl DeviceDescriptor {
    pub fn new(name: impl Into<String>, sample_rate: u32, channels: u16) -> Self {
        let name = name.into();
        Self {
            is_monitor: is_monitor_name(&name),
            echo_cancel: name.contains("echo-cancel"),
            beschreibung: name.clone(),
            name,
            sample_rate,
            channels,
            format: SampleFormat::S16,
        }
    }
}

/// Geraetename fuer eine Karte: `"default"` bleibt, sonst
/// `"<plugin>:<karte>"` mit optionalem `",<subdevice>"`
pub fn device_topology(plugin: &str, karte: &str, subdevice: Option<u32>) -> String {
    if karte == "default" {
        return karte.to_string();
    }
    match subdevice {
        Some(sub) => format!("{}:{},{}", plugin, karte, sub),
        None => format!("{}:{}", plugin, karte),
    }
}

/// Monitor-Quellen tragen ".monitor" im Namen
pub fn is_monitor_name(name: &str) -> bool {
    name.ends_with(".monitor") || name.starts_with("Monitor of ")
}

/// Naechste unterstuetzte Rate zu `wunsch` innerhalb `[min, max]`
pub fn nearest_rate(min: u32, max: u32, wunsch: u32) -> u32 {
    wunsch.clamp(min, max.max(min))
}

// ---------------------------------------------------------------------------
// cpal
// ---------------------------------------------------------------------------

fn descriptor_von(device: &Device, eingabe: bool) -> AudioResult<DeviceDescriptor> {
    let name = device
        .name()
        .map_err(|e| AudioError::StreamFehler(e.to_string()))?;
    let config = if eingabe {
        device.default_input_config()
    } else {
        device.default_output_config()
    }
    .map_err(|e| AudioError::StreamFehler(e.to_string()))?;

    let mut d = DeviceDescriptor::new(name, config.sample_rate().0, config.channels());
    d.format = config.sample_format().into();
    Ok(d)
}

/// Listet alle Eingabegeraete des Hosts auf
pub fn list_input_devices(host: &Host) -> AudioResult<Vec<DeviceDescriptor>> {
    let devices = host
        .input_devices()
        .map_err(|e| AudioError::StreamFehler(e.to_string()))?;

    let mut result = Vec::new();
    for device in devices {
        match descriptor_von(&device, true) {
            Ok(d) => result.push(d),
            Err(e) => warn!("Eingabegeraet konnte nicht gelesen werden: {}", e),
        }
    }
    debug!("Gefundene Eingabegeraete: {}", result.len());
    Ok(result)
}

/// Listet alle Ausgabegeraete des Hosts auf
pub fn list_output_devices(host: &Host) -> AudioResult<Vec<DeviceDescriptor>> {
    let devices = host
        .output_devices()
        .map_err(|e| AudioError::StreamFehler(e.to_string()))?;

    let mut result = Vec::new();
    for device in devices {
        match descriptor_von(&device, false) {
            Ok(d) => result.push(d),
            Err(e) => warn!("Ausgabegeraet konnte nicht gelesen werden: {}", e),
        }
    }
    debug!("Gefundene Ausgabegeraete: {}", result.len());
    Ok(result)
}

/// Eingabegeraet nach Index; `None` waehlt das Standardgeraet
pub fn find_input_device(host: &Host, index: Option<usize>) -> AudioResult<Device> {
    match index {
        None => host
            .default_input_device()
            .ok_or_else(|| AudioError::GeraetNichtGefunden("Standard-Eingabe".into())),
        Some(i) => host
            .input_devices()
            .map_err(|e| AudioError::StreamFehler(e.to_string()))?
            .nth(i)
            .ok_or_else(|| AudioError::GeraetNichtGefunden(format!("Eingabe #{}", i))),
    }
}

/// Ausgabegeraet nach Index; `None` waehlt das Standardgeraet
pub fn find_output_device(host: &Host, index: Option<usize>) -> AudioResult<Device> {
    match index {
        None => host
            .default_output_device()
            .ok_or_else(|| AudioError::GeraetNichtGefunden("Standard-Ausgabe".into())),
        Some(i) => host
            .output_devices()
            .map_err(|e| AudioError::StreamFehler(e.to_string()))?
            .nth(i)
            .ok_or_else(|| AudioError::GeraetNichtGefunden(format!("Ausgabe #{}", i))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topologie() {
        assert_eq!(device_topology("hw", "default", Some(2)), "default");
        assert_eq!(device_topology("plughw", "1", None), "plughw:1");
        assert_eq!(device_topology("hw", "0", Some(3)), "hw:0,3");
    }

    #[test]
    fn monitor_erkennung() {
        let d = DeviceDescriptor::new("alsa_output.pci.analog-stereo.monitor", 48000, 2);
        assert!(d.is_monitor);
        assert!(!DeviceDescriptor::new("alsa_input.usb", 16000, 1).is_monitor);
        assert!(DeviceDescriptor::new("echo-cancel-source", 48000, 1).echo_cancel);
    }

    #[test]
    fn rate_begrenzen() {
        assert_eq!(nearest_rate(44100, 48000, 8000), 44100);
        assert_eq!(nearest_rate(8000, 48000, 16000), 16000);
        assert_eq!(nearest_rate(8000, 8000, 48000), 8000);
    }

    #[test]
    #[ignore = "Benoetigt Audio-Hardware"]
    fn eingabegeraete_auflistbar() {
        let host = cpal::default_host();
        let devices = list_input_devices(&host).expect("Liste sollte abrufbar sein");
        println!(
            "Eingabegeraete: {:?}",
            devices.iter().map(|d| &d.name).collect::<Vec<_>>()
        );
    }
}
