//! Gespraechsaufnahme als WAV-Datei
//!
//! Der Rekorder ist ein eigener Leser im Pool. Er liest halbduplex den
//! Puffer des Anrufs (Gegenseite) und den Standardpuffer (Mikrofon) und
//! schreibt deren Mischung mono mit der internen Rate.

use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use fernsprech_core::{CallId, Sample};
use hound::{WavSpec, WavWriter};
use tracing::{debug, info, warn};

use crate::error::{AudioError, AudioResult};
use crate::pool::{RingBufferPool, DEFAULT_ID};

/// Groesster Block pro Schreibvorgang
const BLOCK: usize = 1600;

fn wav_fehler(e: hound::Error) -> AudioError {
    AudioError::Wav(e.to_string())
}

/// Dateiname `<anruf>-<unix-sekunden>.wav`
pub fn recording_file_name(anruf: &CallId) -> String {
    let sekunden = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    format!("{}-{}.wav", anruf.as_str(), sekunden)
}

/// Laufende Aufnahme eines Gespraechs
pub struct CallRecorder {
    anruf: CallId,
    leser: String,
    pool: Arc<RingBufferPool>,
    writer: Option<WavWriter<BufWriter<File>>>,
    pfad: PathBuf,
    rate: u32,
    mischung: Vec<Sample>,
    zwischen: Vec<Sample>,
    geschrieben: u64,
}

impl CallRecorder {
    /// Legt die Datei an und bindet den Rekorder an Anruf und Mikrofon
    pub fn start(
        pool: Arc<RingBufferPool>,
        anruf: &CallId,
        pfad: impl Into<PathBuf>,
    ) -> AudioResult<Self> {
        let pfad = pfad.into();
        if let Some(dir) = pfad.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)?;
        }
        let rate = pool.internal_sampling_rate();
        let spec = WavSpec {
            channels: 1,
            sample_rate: rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let writer = WavWriter::create(&pfad, spec).map_err(wav_fehler)?;

        let leser = format!("aufnahme:{}", anruf.as_str());
        let quelle = anruf.to_string();
        pool.bind_half_duplex_out(&leser, &quelle);
        pool.bind_half_duplex_out(&leser, DEFAULT_ID);
        info!(anruf = %anruf, pfad = %pfad.display(), rate, "Aufnahme gestartet");

        Ok(Self {
            anruf: anruf.clone(),
            leser,
            pool,
            writer: Some(writer),
            pfad,
            rate,
            mischung: Vec::new(),
            zwischen: Vec::new(),
            geschrieben: 0,
        })
    }

    pub fn call_id(&self) -> &CallId {
        &self.anruf
    }

    pub fn path(&self) -> &Path {
        &self.pfad
    }

    pub fn sample_rate(&self) -> u32 {
        self.rate
    }

    /// Bisher geschriebene Samples
    pub fn samples_written(&self) -> u64 {
        self.geschrieben
    }

    /// Schreibt alles, was beide Seiten bereitstellen. Gibt die Anzahl
    /// neu geschriebener Samples zurueck.
    pub fn record(&mut self) -> AudioResult<usize> {
        let Some(writer) = self.writer.as_mut() else {
            return Ok(0);
        };
        let mut gesamt = 0;
        loop {
            let n = self.pool.available_for_get(&self.leser).min(BLOCK);
            if n == 0 {
                break;
            }
            self.mischung.clear();
            self.mischung.resize(n, 0);
            self.pool
                .get_data_into(&self.leser, &mut self.mischung, &mut self.zwischen, |_| 1.0);
            for &s in &self.mischung {
                writer.write_sample(s).map_err(wav_fehler)?;
            }
            gesamt += n;
        }
        self.geschrieben += gesamt as u64;
        Ok(gesamt)
    }

    /// Schreibt den Rest, schliesst die Datei und loest die Bindungen
    pub fn stop(mut self) -> AudioResult<PathBuf> {
        let rest = self.record();
        let ende = self.abschliessen();
        rest?;
        ende?;
        Ok(self.pfad.clone())
    }

    fn abschliessen(&mut self) -> AudioResult<()> {
        self.pool.unregister_reader(&self.leser);
        match self.writer.take() {
            Some(writer) => {
                writer.finalize().map_err(wav_fehler)?;
                info!(
                    anruf = %self.anruf,
                    samples = self.geschrieben,
                    "Aufnahme beendet"
                );
                Ok(())
            }
            None => Ok(()),
        }
    }
}

impl Drop for CallRecorder {
    fn drop(&mut self) {
        if self.writer.is_some() {
            debug!(anruf = %self.anruf, "Aufnahme beim Aufraeumen geschlossen");
            if let Err(e) = self.abschliessen() {
                warn!("Aufnahme nicht sauber geschlossen: {}", e);
            }
        }
    }
}
