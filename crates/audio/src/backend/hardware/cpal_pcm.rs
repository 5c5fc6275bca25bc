//! PCM-Treiber ueber cpal
//!
//! Zwischen cpal-Callback und Sitzungs-Thread liegt ein lock-freier
//! Ring-Buffer. Der Callback mischt Mehrkanal auf Mono herunter bzw.
//! verteilt Mono auf alle Kanaele. Fehler im Callback werden beim naechsten
//! Zugriff als Xrun gemeldet.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SizedSample, Stream, StreamConfig};
use fernsprech_core::{Sample, StreamDirection};
use ringbuf::traits::{Consumer, Observer, Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};
use tracing::{debug, error, warn};

use super::pcm::{PcmDevice, PcmDriver};
use crate::device::{
    find_input_device, find_output_device, list_input_devices, list_output_devices, nearest_rate,
};
use crate::error::PcmError;

/// Perioden im Ring-Buffer (Latenz gegen Aussetzer)
const PERIODEN: usize = 4;

/// cpal-Treiber fuer den Standard-Host
#[derive(Debug, Default, Clone, Copy)]
pub struct CpalDriver;

impl CpalDriver {
    pub fn new() -> Self {
        Self
    }
}

fn geraet_fehler(e: impl std::fmt::Display) -> PcmError {
    PcmError::Geraet(e.to_string())
}

/// Waehlt Rate, Kanaele und Format nahe an der Anforderung
pub(crate) fn konfiguration(
    device: &Device,
    eingabe: bool,
    wunsch: u32,
) -> Result<(StreamConfig, cpal::SampleFormat), PcmError> {
    let bereiche: Vec<cpal::SupportedStreamConfigRange> = if eingabe {
        device
            .supported_input_configs()
            .map_err(geraet_fehler)?
            .collect()
    } else {
        device
            .supported_output_configs()
            .map_err(geraet_fehler)?
            .collect()
    };

    let passend = bereiche
        .iter()
        .find(|c| c.min_sample_rate().0 <= wunsch && c.max_sample_rate().0 >= wunsch)
        .or_else(|| bereiche.first())
        .ok_or_else(|| PcmError::Geraet("Keine unterstuetzte Konfiguration".into()))?;

    let rate = nearest_rate(passend.min_sample_rate().0, passend.max_sample_rate().0, wunsch);
    let config = StreamConfig {
        channels: passend.channels(),
        sample_rate: cpal::SampleRate(rate),
        buffer_size: cpal::BufferSize::Default,
    };
    Ok((config, passend.sample_format()))
}

fn ausgabe_stream<T>(
    device: &Device,
    config: &StreamConfig,
    mut consumer: HeapCons<Sample>,
    wandeln: fn(Sample) -> T,
    fehler: Arc<AtomicBool>,
) -> Result<Stream, PcmError>
where
    T: SizedSample + Send + 'static,
{
    let kanaele = config.channels.max(1) as usize;
    device
        .build_output_stream(
            config,
            move |data: &mut [T], _| {
                for frame in data.chunks_mut(kanaele) {
                    let wert = wandeln(consumer.try_pop().unwrap_or(0));
                    frame.fill(wert);
                }
            },
            move |err| {
                error!("Playback-Fehler: {}", err);
                fehler.store(true, Ordering::Release);
            },
            None,
        )
        .map_err(geraet_fehler)
}

fn eingabe_stream<T>(
    device: &Device,
    config: &StreamConfig,
    mut producer: HeapProd<Sample>,
    wandeln: fn(T) -> f32,
    fehler: Arc<AtomicBool>,
) -> Result<Stream, PcmError>
where
    T: SizedSample + Send + 'static,
{
    let kanaele = config.channels.max(1) as usize;
    let ueberlauf = Arc::clone(&fehler);
    device
        .build_input_stream(
            config,
            move |data: &[T], _| {
                for frame in data.chunks(kanaele) {
                    let summe: f32 = frame.iter().map(|&x| wandeln(x)).sum();
                    let mono = (summe / frame.len() as f32 * 32767.0)
                        .clamp(Sample::MIN as f32, Sample::MAX as f32)
                        as Sample;
                    if producer.try_push(mono).is_err() {
                        ueberlauf.store(true, Ordering::Release);
                        break;
                    }
                }
            },
            move |err| {
                error!("Capture-Fehler: {}", err);
                fehler.store(true, Ordering::Release);
            },
            None,
        )
        .map_err(geraet_fehler)
}

enum Seite {
    Wiedergabe(HeapProd<Sample>),
    Aufnahme(HeapCons<Sample>),
}

/// cpal-Stream einer Richtung
struct CpalPcm {
    name: String,
    rate: u32,
    stream: Stream,
    seite: Seite,
    fehler: Arc<AtomicBool>,
}

impl CpalPcm {
    fn fehler_pruefen(&self) -> Result<(), PcmError> {
        if self.fehler.swap(false, Ordering::AcqRel) {
            return Err(PcmError::Xrun);
        }
        Ok(())
    }
}

impl PcmDevice for CpalPcm {
    fn name(&self) -> &str {
        &self.name
    }

    fn rate(&self) -> u32 {
        self.rate
    }

    fn prepare(&mut self) -> Result<(), PcmError> {
        if let Seite::Aufnahme(c) = &mut self.seite {
            c.clear();
        }
        Ok(())
    }

    fn start(&mut self) -> Result<(), PcmError> {
        self.stream.play().map_err(geraet_fehler)
    }

    fn stop(&mut self) -> Result<(), PcmError> {
        self.stream.pause().map_err(geraet_fehler)
    }

    fn avail(&mut self) -> Result<usize, PcmError> {
        self.fehler_pruefen()?;
        Ok(match &self.seite {
            Seite::Wiedergabe(p) => p.vacant_len(),
            Seite::Aufnahme(c) => c.occupied_len(),
        })
    }

    fn writei(&mut self, samples: &[Sample]) -> Result<usize, PcmError> {
        self.fehler_pruefen()?;
        match &mut self.seite {
            Seite::Wiedergabe(p) => Ok(p.push_slice(samples)),
            Seite::Aufnahme(_) => Err(PcmError::Geraet("Schreiben auf Aufnahme".into())),
        }
    }

    fn readi(&mut self, ziel: &mut [Sample]) -> Result<usize, PcmError> {
        self.fehler_pruefen()?;
        match &mut self.seite {
            Seite::Aufnahme(c) => Ok(c.pop_slice(ziel)),
            Seite::Wiedergabe(_) => Err(PcmError::Geraet("Lesen von Wiedergabe".into())),
        }
    }
}

impl PcmDriver for CpalDriver {
    fn open(
        &self,
        richtung: StreamDirection,
        index: Option<usize>,
        _plugin: &str,
        rate: u32,
        frame_size: usize,
    ) -> Result<Box<dyn PcmDevice>, PcmError> {
        let host = cpal::default_host();
        let eingabe = richtung == StreamDirection::Capture;
        let device = if eingabe {
            find_input_device(&host, index)
        } else {
            find_output_device(&host, index)
        }
        .map_err(geraet_fehler)?;
        let name = device.name().unwrap_or_else(|_| "unbekannt".to_string());

        let (config, format) = konfiguration(&device, eingabe, rate)?;
        let geraet_rate = config.sample_rate.0;
        // Periode auf die Geraeterate umgerechnet
        let periode = (frame_size as u64 * geraet_rate as u64 / rate.max(1) as u64) as usize;
        let (producer, consumer) = HeapRb::<Sample>::new(periode.max(64) * PERIODEN).split();
        let fehler = Arc::new(AtomicBool::new(false));

        let (stream, seite) = if eingabe {
            let f = Arc::clone(&fehler);
            let stream = match format {
                cpal::SampleFormat::F32 => eingabe_stream::<f32>(&device, &config, producer, |x| x, f)?,
                cpal::SampleFormat::I16 => {
                    eingabe_stream::<i16>(&device, &config, producer, |x| x as f32 / 32768.0, f)?
                }
                cpal::SampleFormat::U16 => eingabe_stream::<u16>(
                    &device,
                    &config,
                    producer,
                    |x| (x as f32 - 32768.0) / 32768.0,
                    f,
                )?,
                anderes => {
                    return Err(PcmError::Geraet(format!(
                        "Nicht unterstuetztes Sample-Format: {:?}",
                        anderes
                    )))
                }
            };
            (stream, Seite::Aufnahme(consumer))
        } else {
            let f = Arc::clone(&fehler);
            let stream = match format {
                cpal::SampleFormat::F32 => {
                    ausgabe_stream::<f32>(&device, &config, consumer, |s| s as f32 / 32768.0, f)?
                }
                cpal::SampleFormat::I16 => ausgabe_stream::<i16>(&device, &config, consumer, |s| s, f)?,
                cpal::SampleFormat::U16 => ausgabe_stream::<u16>(
                    &device,
                    &config,
                    consumer,
                    |s| (s as i32 + 32768) as u16,
                    f,
                )?,
                anderes => {
                    return Err(PcmError::Geraet(format!(
                        "Nicht unterstuetztes Sample-Format: {:?}",
                        anderes
                    )))
                }
            };
            (stream, Seite::Wiedergabe(producer))
        };

        // cpal startet manche Streams sofort; Start erfolgt erst im Zustand Running
        if let Err(e) = stream.pause() {
            warn!("{}: Pausieren nach dem Oeffnen fehlgeschlagen: {}", name, e);
        }

        debug!(
            "cpal {} geoeffnet: {} ({} Hz, {} Kanaele, {:?})",
            richtung, name, geraet_rate, config.channels, format
        );
        Ok(Box::new(CpalPcm {
            name,
            rate: geraet_rate,
            stream,
            seite,
            fehler,
        }))
    }

    fn device_names(&self, richtung: StreamDirection) -> Vec<String> {
        let host = cpal::default_host();
        let liste = match richtung {
            StreamDirection::Capture => list_input_devices(&host),
            _ => list_output_devices(&host),
        };
        match liste {
            Ok(l) => l.into_iter().map(|d| d.name).collect(),
            Err(e) => {
                warn!("Geraeteliste nicht abrufbar: {}", e);
                Vec::new()
            }
        }
    }

    fn card_list(&self, richtung: StreamDirection) -> Vec<String> {
        let host = cpal::default_host();
        let karte = host.id().name();
        self.device_names(richtung)
            .into_iter()
            .map(|pcm| format!("{} - {}", karte, pcm))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[ignore = "Benoetigt Audio-Hardware"]
    fn wiedergabe_oeffnen() {
        let treiber = CpalDriver::new();
        let mut g = treiber
            .open(StreamDirection::Playback, None, "default", 48000, 960)
            .expect("Playback-Geraet sollte oeffenbar sein");
        g.prepare().unwrap();
        g.start().unwrap();
        let frei = g.avail().unwrap();
        assert!(frei > 0);
        assert_eq!(g.writei(&vec![0; frei]).unwrap(), frei);
    }

    #[test]
    #[ignore = "Benoetigt Audio-Hardware"]
    fn kartenliste() {
        let liste = CpalDriver::new().card_list(StreamDirection::Playback);
        assert!(liste.iter().all(|e| e.contains(" - ")));
    }
}
