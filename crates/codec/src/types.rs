//! Codec-Schnittstelle und Beschreibung
//!
//! Eine Vorlage (Template) wird pro Modul einmal erzeugt und nie zum
//! Kodieren benutzt. Jedes Gespraech bekommt ueber [`Codec::clone_codec`]
//! eine eigene Instanz mit frischem Kodierzustand.

use fernsprech_core::{PayloadTyp, Sample};

use crate::error::CodecResult;

/// Unveraenderliche Beschreibung eines Codecs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodecDescriptor {
    /// RTP-Payload-Typ
    pub payload: PayloadTyp,
    /// MIME-Subtyp wie in SDP (z.B. "PCMU")
    pub mime_subtype: &'static str,
    /// Taktrate in Hz
    pub clock_rate: u32,
    /// Kanalzahl
    pub channels: u16,
    /// Nominale Bitrate in kbit/s
    pub bitrate_kbps: u32,
    /// Samples pro encode/decode-Aufruf
    pub frame_size: usize,
}

impl CodecDescriptor {
    /// SDP-Darstellung `"<subtype>/<rate>[/<kanaele>]"`
    ///
    /// Die Kanalzahl erscheint nur bei mehr als einem Kanal.
    pub fn sdp_name(&self) -> String {
        if self.channels > 1 {
            format!("{}/{}/{}", self.mime_subtype, self.clock_rate, self.channels)
        } else {
            format!("{}/{}", self.mime_subtype, self.clock_rate)
        }
    }

    /// Dauer eines Frames in Millisekunden
    pub fn frame_ms(&self) -> u32 {
        (self.frame_size as u64 * 1000 / self.clock_rate.max(1) as u64) as u32
    }
}

/// Ein Audio-Codec mit eigenem, nicht geteiltem Kodierzustand
pub trait Codec: Send {
    /// Beschreibung des Codecs
    fn descriptor(&self) -> &CodecDescriptor;

    /// Dekodiert ein Payload nach `pcm`, gibt die Anzahl Samples zurueck
    fn decode(&mut self, payload: &[u8], pcm: &mut [Sample]) -> CodecResult<usize>;

    /// Kodiert `pcm` nach `payload`, gibt die Anzahl Bytes zurueck
    fn encode(&mut self, pcm: &[Sample], payload: &mut [u8]) -> CodecResult<usize>;

    /// Erzeugt eine unabhaengige Instanz mit frischem Zustand
    fn clone_codec(&self) -> CodecResult<Box<dyn Codec>>;
}

/// Prueft ob ein Zielpuffer gross genug ist
pub(crate) fn puffer_pruefen(benoetigt: usize, vorhanden: usize) -> CodecResult<()> {
    if vorhanden < benoetigt {
        return Err(crate::error::CodecError::PufferZuKlein {
            benoetigt,
            vorhanden,
        });
    }
    Ok(())
}
