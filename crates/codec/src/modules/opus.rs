//! Opus (dynamischer PT 104) ueber audiopus
//!
//! 48 kHz, mono, 20-ms-Frames, Anwendung VoIP.

use audiopus::{
    coder::{Decoder, Encoder},
    Application, Bitrate, Channels, SampleRate,
};
use fernsprech_core::Sample;
use tracing::debug;

use crate::abi::{destroy_boxed, Symbol, CREATE_SYMBOL, DESTROY_SYMBOL};
use crate::error::{CodecError, CodecResult};
use crate::loader::StaticModule;
use crate::types::{puffer_pruefen, Codec, CodecDescriptor};

/// Dynamischer Payload-Typ fuer Opus
pub const PAYLOAD: u8 = 104;

/// Samples pro Frame (20 ms bei 48 kHz)
pub const FRAME_SAMPLES: usize = 960;

const BITRATE_KBPS: u32 = 32;

fn descriptor() -> CodecDescriptor {
    CodecDescriptor {
        payload: PAYLOAD,
        mime_subtype: "opus",
        clock_rate: 48000,
        channels: 1,
        bitrate_kbps: BITRATE_KBPS,
        frame_size: FRAME_SAMPLES,
    }
}

fn codec_fehler(e: audiopus::Error) -> CodecError {
    CodecError::Kodierung(e.to_string())
}

/// Opus-Codec; Encoder und Decoder sind pro Instanz eigene libopus-Objekte
pub struct Opus {
    descriptor: CodecDescriptor,
    encoder: Encoder,
    decoder: Decoder,
}

impl Opus {
    pub fn new() -> CodecResult<Self> {
        let mut encoder = Encoder::new(SampleRate::Hz48000, Channels::Mono, Application::Voip)
            .map_err(|e| CodecError::Konstruktion(e.to_string()))?;
        encoder
            .set_bitrate(Bitrate::BitsPerSecond((BITRATE_KBPS as i32) * 1000))
            .map_err(|e| CodecError::Konstruktion(e.to_string()))?;
        let decoder = Decoder::new(SampleRate::Hz48000, Channels::Mono)
            .map_err(|e| CodecError::Konstruktion(e.to_string()))?;

        debug!("Opus-Instanz erstellt: {} kbit/s", BITRATE_KBPS);
        Ok(Self {
            descriptor: descriptor(),
            encoder,
            decoder,
        })
    }
}

impl Codec for Opus {
    fn descriptor(&self) -> &CodecDescriptor {
        &self.descriptor
    }

    fn decode(&mut self, payload: &[u8], pcm: &mut [Sample]) -> CodecResult<usize> {
        puffer_pruefen(FRAME_SAMPLES, pcm.len())?;
        let ziel = &mut pcm[..FRAME_SAMPLES];
        let n = if payload.is_empty() {
            // Verlustverschleierung
            self.decoder.decode(None::<&[u8]>, ziel, false)
        } else {
            self.decoder.decode(Some(payload), ziel, false)
        }
        .map_err(codec_fehler)?;
        Ok(n)
    }

    fn encode(&mut self, pcm: &[Sample], payload: &mut [u8]) -> CodecResult<usize> {
        if pcm.len() != FRAME_SAMPLES {
            return Err(CodecError::Kodierung(format!(
                "PCM-Frame muss {} Samples lang sein, war {}",
                FRAME_SAMPLES,
                pcm.len()
            )));
        }
        self.encoder.encode(pcm, payload).map_err(codec_fehler)
    }

    fn clone_codec(&self) -> CodecResult<Box<dyn Codec>> {
        Ok(Box::new(Opus::new()?))
    }
}

fn create() -> CodecResult<Box<dyn Codec>> {
    Ok(Box::new(Opus::new()?))
}

pub static MODULE: StaticModule = StaticModule {
    name: "opus",
    symbols: &[
        (CREATE_SYMBOL, Symbol::Create(create)),
        (DESTROY_SYMBOL, Symbol::Destroy(destroy_boxed)),
    ],
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn beschreibung() {
        let d = descriptor();
        assert_eq!(d.sdp_name(), "opus/48000");
        assert_eq!(d.frame_ms(), 20);
    }

    #[test]
    fn kodieren_und_dekodieren() {
        let mut codec = Opus::new().unwrap();
        let pcm: Vec<Sample> = (0..FRAME_SAMPLES)
            .map(|i| ((i as f32 / 48000.0 * 440.0 * std::f32::consts::TAU).sin() * 8000.0) as Sample)
            .collect();
        let mut payload = [0u8; 1500];
        let n = codec.encode(&pcm, &mut payload).unwrap();
        assert!(n > 0);
        let mut zurueck = [0 as Sample; FRAME_SAMPLES];
        assert_eq!(codec.decode(&payload[..n], &mut zurueck).unwrap(), FRAME_SAMPLES);
    }

    #[test]
    fn falsche_frame_groesse() {
        let mut codec = Opus::new().unwrap();
        let mut payload = [0u8; 1500];
        assert!(codec.encode(&[0; 100], &mut payload).is_err());
    }
}
