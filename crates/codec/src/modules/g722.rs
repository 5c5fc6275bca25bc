//! G.722 (PT 9) – 64 kbit/s Sub-Band-ADPCM nach ITU-T G.722
//!
//! QMF teilt das 16-kHz-Signal in zwei Baender; das untere Band wird mit
//! 6 Bit, das obere mit 2 Bit ADPCM kodiert. Ein Byte pro Samplepaar.
//! Encoder und Decoder tragen Praediktor-Zustand, deshalb muss jedes
//! Gespraech eine eigene Instanz haben.

use fernsprech_core::Sample;

use crate::abi::{destroy_boxed, Symbol, CREATE_SYMBOL, DESTROY_SYMBOL};
use crate::error::CodecResult;
use crate::loader::StaticModule;
use crate::types::{puffer_pruefen, Codec, CodecDescriptor};

// ---------------------------------------------------------------------------
// Tabellen
// ---------------------------------------------------------------------------

const QMF_KOEFF: [i32; 12] = [3, -11, 12, 32, -210, 951, 3876, -805, 362, -156, 53, -11];

const Q6: [i32; 32] = [
    0, 35, 72, 110, 150, 190, 233, 276, 323, 370, 422, 473, 530, 587, 650, 714, 786, 858, 940,
    1023, 1121, 1219, 1339, 1458, 1612, 1765, 1980, 2195, 2557, 2919, 0, 0,
];
const ILN: [i32; 32] = [
    0, 63, 62, 31, 30, 29, 28, 27, 26, 25, 24, 23, 22, 21, 20, 19, 18, 17, 16, 15, 14, 13, 12,
    11, 10, 9, 8, 7, 6, 5, 4, 0,
];
const ILP: [i32; 32] = [
    0, 61, 60, 59, 58, 57, 56, 55, 54, 53, 52, 51, 50, 49, 48, 47, 46, 45, 44, 43, 42, 41, 40,
    39, 38, 37, 36, 35, 34, 33, 32, 0,
];
const WL: [i32; 8] = [-60, -30, 58, 172, 334, 538, 1198, 3042];
const RL42: [usize; 16] = [0, 7, 6, 5, 4, 3, 2, 1, 7, 6, 5, 4, 3, 2, 1, 0];
const ILB: [i32; 32] = [
    2048, 2093, 2139, 2186, 2233, 2282, 2332, 2383, 2435, 2489, 2543, 2599, 2656, 2714, 2774,
    2834, 2896, 2960, 3025, 3091, 3158, 3228, 3298, 3371, 3444, 3520, 3597, 3676, 3756, 3838,
    3922, 4008,
];
const QM4: [i32; 16] = [
    0, -20456, -12896, -8968, -6288, -4240, -2584, -1200, 20456, 12896, 8968, 6288, 4240, 2584,
    1200, 0,
];
const QM6: [i32; 64] = [
    -136, -136, -136, -136, -24808, -21904, -19008, -16704, -14984, -13512, -12280, -11192,
    -10232, -9360, -8576, -7856, -7192, -6576, -6000, -5456, -4944, -4464, -4008, -3576, -3168,
    -2776, -2400, -2032, -1688, -1360, -1040, -728, 24808, 21904, 19008, 16704, 14984, 13512,
    12280, 11192, 10232, 9360, 8576, 7856, 7192, 6576, 6000, 5456, 4944, 4464, 4008, 3576,
    3168, 2776, 2400, 2032, 1688, 1360, 1040, 728, 432, 136, -432, -136,
];
const QM2: [i32; 4] = [-7408, -1616, 7408, 1616];
const IHN: [usize; 3] = [0, 1, 0];
const IHP: [usize; 3] = [0, 3, 2];
const WH: [i32; 3] = [0, -214, 798];
const RH2: [usize; 4] = [2, 1, 2, 1];

/// Samples pro Frame (20 ms bei 16 kHz)
pub const FRAME_SAMPLES: usize = 320;

// ---------------------------------------------------------------------------
// Zustand
// ---------------------------------------------------------------------------

fn saturate(wert: i32) -> i32 {
    wert.clamp(i16::MIN as i32, i16::MAX as i32)
}

/// ADPCM-Zustand eines Teilbands
#[derive(Debug, Clone, Default)]
struct Band {
    s: i32,
    sp: i32,
    sz: i32,
    r: [i32; 3],
    a: [i32; 3],
    ap: [i32; 3],
    p: [i32; 3],
    d: [i32; 7],
    b: [i32; 7],
    bp: [i32; 7],
    sg: [i32; 7],
    nb: i32,
    det: i32,
}

impl Band {
    fn mit_det(det: i32) -> Self {
        Self {
            det,
            ..Self::default()
        }
    }

    /// Praediktor-Anpassung (Block 4)
    fn anpassen(&mut self, d: i32) {
        // RECONS, PARREC
        self.d[0] = d;
        self.r[0] = saturate(self.s + d);
        self.p[0] = saturate(self.sz + d);

        // UPPOL2
        for i in 0..3 {
            self.sg[i] = self.p[i] >> 15;
        }
        let wd1 = saturate(self.a[1] << 2);
        let wd2 = (if self.sg[0] == self.sg[1] { -wd1 } else { wd1 }).min(32767);
        let mut wd3 = (wd2 >> 7) + if self.sg[0] == self.sg[2] { 128 } else { -128 };
        wd3 += (self.a[2] * 32512) >> 15;
        self.ap[2] = wd3.clamp(-12288, 12288);

        // UPPOL1
        self.sg[0] = self.p[0] >> 15;
        self.sg[1] = self.p[1] >> 15;
        let wd1 = if self.sg[0] == self.sg[1] { 192 } else { -192 };
        let wd2 = (self.a[1] * 32640) >> 15;
        self.ap[1] = saturate(wd1 + wd2);
        let wd3 = saturate(15360 - self.ap[2]);
        self.ap[1] = self.ap[1].clamp(-wd3, wd3);

        // UPZERO
        let wd1 = if d == 0 { 0 } else { 128 };
        self.sg[0] = d >> 15;
        for i in 1..7 {
            self.sg[i] = self.d[i] >> 15;
            let wd2 = if self.sg[i] == self.sg[0] { wd1 } else { -wd1 };
            let wd3 = (self.b[i] * 32640) >> 15;
            self.bp[i] = saturate(wd2 + wd3);
        }

        // DELAYA
        for i in (1..7).rev() {
            self.d[i] = self.d[i - 1];
            self.b[i] = self.bp[i];
        }
        for i in (1..3).rev() {
            self.r[i] = self.r[i - 1];
            self.p[i] = self.p[i - 1];
            self.a[i] = self.ap[i];
        }

        // FILTEP
        let wd1 = (self.a[1] * saturate(self.r[1] + self.r[1])) >> 15;
        let wd2 = (self.a[2] * saturate(self.r[2] + self.r[2])) >> 15;
        self.sp = saturate(wd1 + wd2);

        // FILTEZ
        let mut sz = 0;
        for i in (1..7).rev() {
            sz += (self.b[i] * saturate(self.d[i] + self.d[i])) >> 15;
        }
        self.sz = saturate(sz);

        // PREDIC
        self.s = saturate(self.sp + self.sz);
    }

    /// Skalierungsfaktor des unteren Bands nachfuehren (LOGSCL, SCALEL)
    fn skalieren_unten(&mut self, il4: usize) {
        self.nb = (((self.nb * 127) >> 7) + WL[il4]).clamp(0, 18432);
        self.det = det_aus_nb(self.nb, 8);
    }

    /// Skalierungsfaktor des oberen Bands nachfuehren (LOGSCH, SCALEH)
    fn skalieren_oben(&mut self, ih2: usize) {
        self.nb = (((self.nb * 127) >> 7) + WH[ih2]).clamp(0, 22528);
        self.det = det_aus_nb(self.nb, 10);
    }
}

fn det_aus_nb(nb: i32, basis: i32) -> i32 {
    let wd1 = ((nb >> 6) & 31) as usize;
    let wd2 = basis - (nb >> 11);
    let wd3 = if wd2 < 0 {
        ILB[wd1] << -wd2
    } else {
        ILB[wd1] >> wd2
    };
    wd3 << 2
}

/// Zustand einer Richtung (Encoder oder Decoder)
#[derive(Debug, Clone)]
struct Zustand {
    unten: Band,
    oben: Band,
    x: [i32; 24],
}

impl Default for Zustand {
    fn default() -> Self {
        Self {
            unten: Band::mit_det(32),
            oben: Band::mit_det(8),
            x: [0; 24],
        }
    }
}

impl Zustand {
    fn verzoegerung_schieben(&mut self, a: i32, b: i32) {
        self.x.copy_within(2..24, 0);
        self.x[22] = a;
        self.x[23] = b;
    }

    fn kodieren(&mut self, s0: Sample, s1: Sample) -> u8 {
        // Sende-QMF
        self.verzoegerung_schieben(s0 as i32, s1 as i32);
        let mut ungerade = 0;
        let mut gerade = 0;
        for i in 0..12 {
            ungerade += self.x[2 * i] * QMF_KOEFF[i];
            gerade += self.x[2 * i + 1] * QMF_KOEFF[11 - i];
        }
        let xlow = (gerade + ungerade) >> 14;
        let xhigh = (gerade - ungerade) >> 14;

        // Unteres Band: SUBTRA, QUANTL
        let el = saturate(xlow - self.unten.s);
        let wd = if el >= 0 { el } else { -(el + 1) };
        let mut i = 1;
        while i < 30 {
            if wd < (Q6[i] * self.unten.det) >> 12 {
                break;
            }
            i += 1;
        }
        let ilow = if el < 0 { ILN[i] } else { ILP[i] };

        // INVQAL
        let ril = (ilow >> 2) as usize;
        let dlow = (self.unten.det * QM4[ril]) >> 15;
        self.unten.skalieren_unten(RL42[ril]);
        self.unten.anpassen(dlow);

        // Oberes Band: SUBTRA, QUANTH
        let eh = saturate(xhigh - self.oben.s);
        let wd = if eh >= 0 { eh } else { -(eh + 1) };
        let mih = if wd >= (564 * self.oben.det) >> 12 { 2 } else { 1 };
        let ihigh = if eh < 0 { IHN[mih] } else { IHP[mih] };

        // INVQAH
        let dhigh = (self.oben.det * QM2[ihigh]) >> 15;
        self.oben.skalieren_oben(RH2[ihigh]);
        self.oben.anpassen(dhigh);

        (((ihigh as i32) << 6) | ilow) as u8
    }

    fn dekodieren(&mut self, code: u8) -> (Sample, Sample) {
        let ilow = (code & 0x3F) as usize;
        let ihigh = ((code >> 6) & 0x03) as usize;

        // Unteres Band: INVQBL, RECONS, LIMIT
        let wd2 = (self.unten.det * QM6[ilow]) >> 15;
        let rlow = (self.unten.s + wd2).clamp(-16384, 16383);

        // INVQAL
        let ril = ilow >> 2;
        let dlowt = (self.unten.det * QM4[ril]) >> 15;
        self.unten.skalieren_unten(RL42[ril]);
        self.unten.anpassen(dlowt);

        // Oberes Band: INVQAH, RECONS, LIMIT
        let dhigh = (self.oben.det * QM2[ihigh]) >> 15;
        let rhigh = (dhigh + self.oben.s).clamp(-16384, 16383);
        self.oben.skalieren_oben(RH2[ihigh]);
        self.oben.anpassen(dhigh);

        // Empfangs-QMF
        self.verzoegerung_schieben(rlow + rhigh, rlow - rhigh);
        let mut xout1 = 0;
        let mut xout2 = 0;
        for i in 0..12 {
            xout2 += self.x[2 * i] * QMF_KOEFF[i];
            xout1 += self.x[2 * i + 1] * QMF_KOEFF[11 - i];
        }
        (
            saturate(xout1 >> 11) as Sample,
            saturate(xout2 >> 11) as Sample,
        )
    }
}

// ---------------------------------------------------------------------------
// Codec
// ---------------------------------------------------------------------------

/// G.722-Codec mit eigenem Encoder- und Decoder-Zustand
#[derive(Debug, Clone)]
pub struct G722 {
    descriptor: CodecDescriptor,
    encoder: Zustand,
    decoder: Zustand,
}

impl G722 {
    pub fn new() -> Self {
        Self {
            descriptor: CodecDescriptor {
                payload: 9,
                mime_subtype: "G722",
                clock_rate: 16000,
                channels: 1,
                bitrate_kbps: 64,
                frame_size: FRAME_SAMPLES,
            },
            encoder: Zustand::default(),
            decoder: Zustand::default(),
        }
    }
}

impl Default for G722 {
    fn default() -> Self {
        Self::new()
    }
}

impl Codec for G722 {
    fn descriptor(&self) -> &CodecDescriptor {
        &self.descriptor
    }

    fn decode(&mut self, payload: &[u8], pcm: &mut [Sample]) -> CodecResult<usize> {
        puffer_pruefen(payload.len() * 2, pcm.len())?;
        for (paar, &code) in pcm.chunks_exact_mut(2).zip(payload) {
            let (a, b) = self.decoder.dekodieren(code);
            paar[0] = a;
            paar[1] = b;
        }
        Ok(payload.len() * 2)
    }

    fn encode(&mut self, pcm: &[Sample], payload: &mut [u8]) -> CodecResult<usize> {
        let bytes = pcm.len() / 2;
        puffer_pruefen(bytes, payload.len())?;
        for (ziel, paar) in payload.iter_mut().zip(pcm.chunks_exact(2)) {
            *ziel = self.encoder.kodieren(paar[0], paar[1]);
        }
        Ok(bytes)
    }

    fn clone_codec(&self) -> CodecResult<Box<dyn Codec>> {
        // Frischer Zustand, nie den der Vorlage weitergeben
        Ok(Box::new(G722::new()))
    }
}

fn create() -> CodecResult<Box<dyn Codec>> {
    Ok(Box::new(G722::new()))
}

pub static MODULE: StaticModule = StaticModule {
    name: "g722",
    symbols: &[
        (CREATE_SYMBOL, Symbol::Create(create)),
        (DESTROY_SYMBOL, Symbol::Destroy(destroy_boxed)),
    ],
};

#[cfg(test)]
mod tests {
    use super::*;

    fn sinus(freq: f64, rate: f64, n: usize, amp: f64) -> Vec<Sample> {
        (0..n)
            .map(|i| ((2.0 * std::f64::consts::PI * freq * i as f64 / rate).sin() * amp) as Sample)
            .collect()
    }

    fn energie(s: &[Sample]) -> f64 {
        s.iter().map(|&x| (x as f64) * (x as f64)).sum::<f64>() / s.len() as f64
    }

    #[test]
    fn stille_bleibt_stille() {
        let mut codec = G722::new();
        let mut payload = [0u8; FRAME_SAMPLES / 2];
        codec.encode(&[0; FRAME_SAMPLES], &mut payload).unwrap();
        let mut pcm = [0 as Sample; FRAME_SAMPLES];
        codec.decode(&payload, &mut pcm).unwrap();
        assert!(pcm.iter().all(|&s| s.abs() < 64));
    }

    #[test]
    fn sinus_ueberlebt_kodierung() {
        let mut codec = G722::new();
        let eingang = sinus(1000.0, 16000.0, FRAME_SAMPLES * 20, 8000.0);
        let mut ausgang = Vec::new();
        for frame in eingang.chunks(FRAME_SAMPLES) {
            let mut payload = [0u8; FRAME_SAMPLES / 2];
            let n = codec.encode(frame, &mut payload).unwrap();
            assert_eq!(n, FRAME_SAMPLES / 2);
            let mut pcm = [0 as Sample; FRAME_SAMPLES];
            codec.decode(&payload, &mut pcm).unwrap();
            ausgang.extend_from_slice(&pcm);
        }
        // Einschwingen ueberspringen
        let e_in = energie(&eingang[FRAME_SAMPLES * 5..]);
        let e_out = energie(&ausgang[FRAME_SAMPLES * 5..]);
        assert!(e_out > e_in * 0.5 && e_out < e_in * 1.5, "{e_in} vs {e_out}");
    }

    #[test]
    fn klone_sind_unabhaengig() {
        let vorlage = G722::new();
        let mut a = vorlage.clone_codec().unwrap();
        let mut b = vorlage.clone_codec().unwrap();
        let eingang = sinus(440.0, 16000.0, FRAME_SAMPLES, 6000.0);

        // a arbeitet zuerst mehrere Frames, b danach einen
        let mut pa = [0u8; FRAME_SAMPLES / 2];
        for _ in 0..3 {
            a.encode(&eingang, &mut pa).unwrap();
        }
        let mut pb = [0u8; FRAME_SAMPLES / 2];
        b.encode(&eingang, &mut pb).unwrap();

        let mut frisch = G722::new();
        let mut pf = [0u8; FRAME_SAMPLES / 2];
        frisch.encode(&eingang, &mut pf).unwrap();
        assert_eq!(pb, pf);
    }
}
