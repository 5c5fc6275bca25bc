//! G.711 µ-law (PCMU, PT 0) und A-law (PCMA, PT 8)
//!
//! Zustandslos; ein Klon ist eine einfache Kopie.

use fernsprech_core::Sample;

use crate::abi::{destroy_boxed, Symbol, CREATE_SYMBOL, DESTROY_SYMBOL};
use crate::error::CodecResult;
use crate::loader::StaticModule;
use crate::types::{puffer_pruefen, Codec, CodecDescriptor};

const SEG_UEND: [i32; 8] = [0x3F, 0x7F, 0xFF, 0x1FF, 0x3FF, 0x7FF, 0xFFF, 0x1FFF];
const SEG_AEND: [i32; 8] = [0x1F, 0x3F, 0x7F, 0xFF, 0x1FF, 0x3FF, 0x7FF, 0xFFF];
const ULAW_BIAS: i32 = 0x84;
const ULAW_CLIP: i32 = 8159;

fn segment(wert: i32, tabelle: &[i32; 8]) -> usize {
    tabelle.iter().position(|&grenze| wert <= grenze).unwrap_or(8)
}

/// Linear 16 Bit -> µ-law
pub fn linear_to_ulaw(sample: Sample) -> u8 {
    let mut pcm = (sample as i32) >> 2;
    let maske: u8 = if pcm < 0 {
        pcm = -pcm;
        0x7F
    } else {
        0xFF
    };
    pcm = pcm.min(ULAW_CLIP) + (ULAW_BIAS >> 2);

    let seg = segment(pcm, &SEG_UEND);
    if seg >= 8 {
        return 0x7F ^ maske;
    }
    let wert = ((seg as i32) << 4) | ((pcm >> (seg + 1)) & 0x0F);
    (wert as u8) ^ maske
}

/// µ-law -> linear 16 Bit
pub fn ulaw_to_linear(code: u8) -> Sample {
    let u = !code;
    let mut t = (((u & 0x0F) as i32) << 3) + ULAW_BIAS;
    t <<= ((u & 0x70) >> 4) as i32;
    if u & 0x80 != 0 {
        (ULAW_BIAS - t) as Sample
    } else {
        (t - ULAW_BIAS) as Sample
    }
}

/// Linear 16 Bit -> A-law
pub fn linear_to_alaw(sample: Sample) -> u8 {
    let mut pcm = (sample as i32) >> 3;
    let maske: u8 = if pcm >= 0 {
        0xD5
    } else {
        pcm = -pcm - 1;
        0x55
    };

    let seg = segment(pcm, &SEG_AEND);
    if seg >= 8 {
        return 0x7F ^ maske;
    }
    let mut wert = (seg as i32) << 4;
    if seg < 2 {
        wert |= (pcm >> 1) & 0x0F;
    } else {
        wert |= (pcm >> seg) & 0x0F;
    }
    (wert as u8) ^ maske
}

/// A-law -> linear 16 Bit
pub fn alaw_to_linear(code: u8) -> Sample {
    let a = code ^ 0x55;
    let mut t = ((a & 0x0F) as i32) << 4;
    let seg = ((a & 0x70) >> 4) as i32;
    match seg {
        0 => t += 8,
        1 => t += 0x108,
        _ => {
            t += 0x108;
            t <<= seg - 1;
        }
    }
    if a & 0x80 != 0 {
        t as Sample
    } else {
        -t as Sample
    }
}

/// Kompandierungsgesetz
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Law {
    Ulaw,
    Alaw,
}

/// G.711-Codec
#[derive(Debug, Clone)]
pub struct G711 {
    law: Law,
    descriptor: CodecDescriptor,
}

impl G711 {
    pub fn ulaw() -> Self {
        Self {
            law: Law::Ulaw,
            descriptor: CodecDescriptor {
                payload: 0,
                mime_subtype: "PCMU",
                clock_rate: 8000,
                channels: 1,
                bitrate_kbps: 64,
                frame_size: 160,
            },
        }
    }

    pub fn alaw() -> Self {
        Self {
            law: Law::Alaw,
            descriptor: CodecDescriptor {
                payload: 8,
                mime_subtype: "PCMA",
                ..Self::ulaw().descriptor
            },
        }
    }

    pub fn law(&self) -> Law {
        self.law
    }
}

impl Codec for G711 {
    fn descriptor(&self) -> &CodecDescriptor {
        &self.descriptor
    }

    fn decode(&mut self, payload: &[u8], pcm: &mut [Sample]) -> CodecResult<usize> {
        puffer_pruefen(payload.len(), pcm.len())?;
        let umrechnen = match self.law {
            Law::Ulaw => ulaw_to_linear,
            Law::Alaw => alaw_to_linear,
        };
        for (ziel, &code) in pcm.iter_mut().zip(payload) {
            *ziel = umrechnen(code);
        }
        Ok(payload.len())
    }

    fn encode(&mut self, pcm: &[Sample], payload: &mut [u8]) -> CodecResult<usize> {
        puffer_pruefen(pcm.len(), payload.len())?;
        let umrechnen = match self.law {
            Law::Ulaw => linear_to_ulaw,
            Law::Alaw => linear_to_alaw,
        };
        for (ziel, &s) in payload.iter_mut().zip(pcm) {
            *ziel = umrechnen(s);
        }
        Ok(pcm.len())
    }

    fn clone_codec(&self) -> CodecResult<Box<dyn Codec>> {
        Ok(Box::new(self.clone()))
    }
}

fn create_ulaw() -> CodecResult<Box<dyn Codec>> {
    Ok(Box::new(G711::ulaw()))
}

fn create_alaw() -> CodecResult<Box<dyn Codec>> {
    Ok(Box::new(G711::alaw()))
}

pub static ULAW_MODULE: StaticModule = StaticModule {
    name: "ulaw",
    symbols: &[
        (CREATE_SYMBOL, Symbol::Create(create_ulaw)),
        (DESTROY_SYMBOL, Symbol::Destroy(destroy_boxed)),
    ],
};

pub static ALAW_MODULE: StaticModule = StaticModule {
    name: "alaw",
    symbols: &[
        (CREATE_SYMBOL, Symbol::Create(create_alaw)),
        (DESTROY_SYMBOL, Symbol::Destroy(destroy_boxed)),
    ],
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ulaw_bekannte_werte() {
        assert_eq!(linear_to_ulaw(0), 0xFF);
        assert_eq!(ulaw_to_linear(0xFF), 0);
        assert_eq!(ulaw_to_linear(0x7F), 0);
        assert_eq!(linear_to_ulaw(Sample::MAX), 0x80);
        assert_eq!(linear_to_ulaw(Sample::MIN), 0x00);
    }

    #[test]
    fn alaw_bekannte_werte() {
        assert_eq!(linear_to_alaw(0), 0xD5);
        assert_eq!(alaw_to_linear(0xD5), 8);
        assert_eq!(alaw_to_linear(0x55), -8);
    }

    #[test]
    fn quantisierungsfehler_begrenzt() {
        for law in [Law::Ulaw, Law::Alaw] {
            for s in (-32000i32..32000).step_by(97) {
                let s = s as Sample;
                let zurueck = match law {
                    Law::Ulaw => ulaw_to_linear(linear_to_ulaw(s)),
                    Law::Alaw => alaw_to_linear(linear_to_alaw(s)),
                };
                let fehler = (s as i32 - zurueck as i32).abs();
                // Segmentbreite waechst mit der Amplitude, hoechstens 1/16
                assert!(
                    fehler <= (s as i32).abs() / 16 + 16,
                    "{law:?}: {s} -> {zurueck}"
                );
            }
        }
    }

    #[test]
    fn zu_kleiner_puffer() {
        let mut codec = G711::alaw();
        let mut out = [0u8; 10];
        assert!(codec.encode(&[0; 160], &mut out).is_err());
    }

    #[test]
    fn kodieren_und_dekodieren() {
        let mut codec = G711::ulaw();
        let pcm: Vec<Sample> = (0..160).map(|i| (i * 100) as Sample).collect();
        let mut payload = vec![0u8; 160];
        assert_eq!(codec.encode(&pcm, &mut payload).unwrap(), 160);
        let mut zurueck = vec![0 as Sample; 160];
        assert_eq!(codec.decode(&payload, &mut zurueck).unwrap(), 160);
        assert!((zurueck[100] as i32 - 10000).abs() < 400);
    }
}
