//! tonewire - stream byte payloads as tone signals over audio I/O.
//!
//! A transmitter pushes a payload into the signal codec and feeds the
//! encoded samples to the playback device one block at a time, never letting
//! the hardware starve and never dropping a block. A receiver windows
//! captured blocks into the decoder and surfaces completed payloads with
//! absolute timestamps. Both pipelines are created through an [`Engine`]
//! that owns the shared audio context, and both tear down safely mid-flight:
//! a destroyed pipeline turns every late hardware cycle into a no-op.

mod audio;
mod codec;
mod config;
mod engine;
mod gate;
#[cfg(feature = "native-qrtone")]
pub mod qrtone;

pub use audio::input::{ReceivedMessage, Receiver, ReceiverOptions, ReceiverStats};
pub use audio::output::{Transmitter, TransmitterOptions, TxState};
pub use codec::{CodecFactory, EccLevel, ToneDecoder, ToneEncoder};
pub use config::EngineConfig;
pub use engine::Engine;
pub use gate::CapabilityGate;
