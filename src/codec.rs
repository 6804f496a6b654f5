//! Trait seam between the streaming pipelines and the signal codec.
//!
//! The codec converts byte payloads to/from audio sample sequences; its
//! signal processing is opaque to this crate. Pipelines only rely on the
//! contract below: the encoder emits up to one block of samples per call and
//! tracks its own cursor, the decoder accepts bounded sample windows and
//! reports exactly when a frame completes.

use anyhow::Result;

/// Forward-error-correction level, mapped from the 0..=3 integer the public
/// transmit API takes. Out-of-range values clamp to the nearest end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EccLevel {
    L,
    M,
    Q,
    H,
}

impl EccLevel {
    pub fn from_level(level: i32) -> Self {
        match level.clamp(0, 3) {
            0 => EccLevel::L,
            1 => EccLevel::M,
            2 => EccLevel::Q,
            _ => EccLevel::H,
        }
    }

    pub fn as_i32(self) -> i32 {
        match self {
            EccLevel::L => 0,
            EccLevel::M => 1,
            EccLevel::Q => 2,
            EccLevel::H => 3,
        }
    }
}

/// Encoder side of the codec.
pub trait ToneEncoder: Send {
    /// Submit a payload for emission. Returns the total number of audio
    /// samples the encoded frame will occupy, and resets the emit cursor.
    fn set_payload(
        &mut self,
        payload: &[u8],
        ecc_level: EccLevel,
        add_checksum: bool,
    ) -> Result<usize>;

    /// Emit up to `out.len()` samples of the current frame into `out`,
    /// advancing the internal cursor. The caller zeroes `out` beforehand;
    /// past the end of the frame nothing is written.
    fn fill_samples(&mut self, out: &mut [f32], gain: f32);
}

/// Decoder side of the codec.
pub trait ToneDecoder: Send {
    /// Maximum number of samples the decoder will accept per
    /// [`push_samples`](Self::push_samples) call in its current state.
    fn max_window_len(&self) -> usize;

    /// Feed a window of samples. Returns true exactly when a complete frame
    /// has been recovered; the payload is then available until the next call.
    fn push_samples(&mut self, samples: &[f32]) -> bool;

    /// Payload of the last completed frame.
    fn payload(&self) -> Vec<u8>;

    /// Index, within the pushed sample stream, at which the last frame
    /// completed.
    fn payload_sample_index(&self) -> u64;

    /// Running count of symbols the decoder corrected via error correction.
    fn fixed_error_count(&self) -> u32;
}

/// Factory for codec instances bound to a sample rate.
pub trait CodecFactory: Send + Sync {
    fn new_encoder(&self, sample_rate: u32) -> Result<Box<dyn ToneEncoder>>;
    fn new_decoder(&self, sample_rate: u32) -> Result<Box<dyn ToneDecoder>>;
}
