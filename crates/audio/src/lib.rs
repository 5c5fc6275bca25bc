//! fernsprech-audio – Audio-Schicht des Softphone-Daemons
//!
//! - Ringpuffer mit benannten Lesern und Pool mit Anruf-Bindungen
//! - Dringender Puffer fuer Signaltoene (DTMF, Freiton)
//! - Abtastratenwandlung zwischen Geraete- und interner Rate
//! - Lautstaerke, Stummschaltung, Hoertoene und Klingeltoene
//! - Echounterdrueckung und Gespraechsaufnahme als WAV
//! - Geraete-Backends: Hardware (eigener Thread) und Audio-Server (Callbacks)

pub mod backend;
pub mod device;
pub mod dsp;
pub mod error;
pub mod pool;
pub mod recorder;
pub mod resampler;
pub mod ringbuffer;
pub mod tone;
pub mod volume;

// Bequeme Re-Exporte der wichtigsten Typen
pub use backend::hardware::{CpalDriver, HardwareBackend, SimulatedPcmDriver};
pub use backend::server::{CpalServer, ServerBackend, SimulatedServer};
pub use backend::{AudioBackend, AudioPath, BackendEvent, OpenDirection, OpenParams};
pub use device::{device_topology, DeviceDescriptor, SampleFormat};
pub use dsp::{AudioProcessor, DcBlocker, EchoCancelConfig, EchoCanceller};
pub use error::{AudioError, AudioResult, DeviceError, PcmError};
pub use pool::{PoolConfig, ReaderKind, RingBufferPool, DEFAULT_ID};
pub use recorder::{recording_file_name, CallRecorder};
pub use resampler::{ausgabe_frames, SampleRateConverter};
pub use ringbuffer::RingBuffer;
pub use tone::{AudioLoop, DtmfGenerator, ToneGenerator, ToneKind, ToneRegion, ToneState};
pub use volume::VolumeControl;
