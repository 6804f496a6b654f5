//! Safe wrappers around the native libqrtone signal codec.
//!
//! Implements the codec seam traits over the C API. One `qrtone_t` instance
//! serves as either an encoder or a decoder depending on which calls it
//! receives; the wrappers keep the two roles in separate types.

use std::ffi::{c_double, c_float};

use anyhow::Result;

use crate::codec::{CodecFactory, EccLevel, ToneDecoder, ToneEncoder};

/// Opaque type for qrtone_t
#[repr(C)]
pub struct QrtoneState {
    _private: [u8; 0],
}

unsafe extern "C" {
    fn qrtone_new() -> *mut QrtoneState;
    fn qrtone_init(qrtone: *mut QrtoneState, sample_rate: c_double);
    fn qrtone_free(qrtone: *mut QrtoneState);

    fn qrtone_set_payload_ext(
        qrtone: *mut QrtoneState,
        payload: *const i8,
        payload_length: u8,
        ecc_level: i8,
        add_crc: i8,
    ) -> i32;
    fn qrtone_get_samples(
        qrtone: *mut QrtoneState,
        samples: *mut c_float,
        samples_length: i32,
        offset: i32,
        power: c_float,
    );

    fn qrtone_get_maximum_length(qrtone: *mut QrtoneState) -> i32;
    fn qrtone_push_samples(
        qrtone: *mut QrtoneState,
        samples: *const c_float,
        samples_length: i32,
    ) -> i8;
    fn qrtone_get_payload(qrtone: *mut QrtoneState) -> *const i8;
    fn qrtone_get_payload_length(qrtone: *mut QrtoneState) -> i32;
    fn qrtone_get_payload_sample_index(qrtone: *mut QrtoneState) -> i64;
    fn qrtone_get_fixed_errors(qrtone: *mut QrtoneState) -> i32;
}

fn new_state(sample_rate: u32) -> Result<*mut QrtoneState> {
    let state = unsafe { qrtone_new() };
    if state.is_null() {
        anyhow::bail!("Failed to allocate qrtone instance");
    }
    unsafe { qrtone_init(state, sample_rate as c_double) };
    Ok(state)
}

// ======================== Encoder ========================

/// Encoder half of the native codec.
pub struct QrtoneEncoder {
    state: *mut QrtoneState,
    /// Samples already requested from the current frame.
    cursor: i32,
}

// qrtone_t is used from a single thread only
unsafe impl Send for QrtoneEncoder {}

impl QrtoneEncoder {
    pub fn new(sample_rate: u32) -> Result<Self> {
        Ok(Self {
            state: new_state(sample_rate)?,
            cursor: 0,
        })
    }
}

impl ToneEncoder for QrtoneEncoder {
    fn set_payload(&mut self, payload: &[u8], ecc_level: EccLevel, add_checksum: bool) -> Result<usize> {
        if payload.is_empty() || payload.len() > u8::MAX as usize {
            anyhow::bail!("payload length {} out of range 1..=255", payload.len());
        }
        let total = unsafe {
            qrtone_set_payload_ext(
                self.state,
                payload.as_ptr() as *const i8,
                payload.len() as u8,
                ecc_level.as_i32() as i8,
                i8::from(add_checksum),
            )
        };
        if total <= 0 {
            anyhow::bail!("qrtone rejected payload of {} bytes", payload.len());
        }
        self.cursor = 0;
        Ok(total as usize)
    }

    fn fill_samples(&mut self, out: &mut [f32], gain: f32) {
        // qrtone adds the signal into the buffer, guarding internally against
        // reads past the frame end; the caller has zeroed `out`
        unsafe {
            qrtone_get_samples(
                self.state,
                out.as_mut_ptr(),
                out.len() as i32,
                self.cursor,
                gain as c_float,
            );
        }
        self.cursor += out.len() as i32;
    }
}

impl Drop for QrtoneEncoder {
    fn drop(&mut self) {
        unsafe { qrtone_free(self.state) };
    }
}

// ======================== Decoder ========================

/// Decoder half of the native codec.
pub struct QrtoneDecoder {
    state: *mut QrtoneState,
}

unsafe impl Send for QrtoneDecoder {}

impl QrtoneDecoder {
    pub fn new(sample_rate: u32) -> Result<Self> {
        Ok(Self {
            state: new_state(sample_rate)?,
        })
    }
}

impl ToneDecoder for QrtoneDecoder {
    fn max_window_len(&self) -> usize {
        let len = unsafe { qrtone_get_maximum_length(self.state) };
        len.max(0) as usize
    }

    fn push_samples(&mut self, samples: &[f32]) -> bool {
        let res = unsafe {
            qrtone_push_samples(self.state, samples.as_ptr(), samples.len() as i32)
        };
        res != 0
    }

    fn payload(&self) -> Vec<u8> {
        let length = unsafe { qrtone_get_payload_length(self.state) };
        if length <= 0 {
            return Vec::new();
        }
        let payload = unsafe { qrtone_get_payload(self.state) };
        if payload.is_null() {
            return Vec::new();
        }
        // qrtone owns the returned buffer; copy it out
        let bytes = unsafe { std::slice::from_raw_parts(payload as *const u8, length as usize) };
        bytes.to_vec()
    }

    fn payload_sample_index(&self) -> u64 {
        let index = unsafe { qrtone_get_payload_sample_index(self.state) };
        index.max(0) as u64
    }

    fn fixed_error_count(&self) -> u32 {
        let fixed = unsafe { qrtone_get_fixed_errors(self.state) };
        fixed.max(0) as u32
    }
}

impl Drop for QrtoneDecoder {
    fn drop(&mut self) {
        unsafe { qrtone_free(self.state) };
    }
}

// ======================== Factory ========================

/// [`CodecFactory`] producing native qrtone instances.
pub struct QrtoneCodec;

impl CodecFactory for QrtoneCodec {
    fn new_encoder(&self, sample_rate: u32) -> Result<Box<dyn ToneEncoder>> {
        Ok(Box::new(QrtoneEncoder::new(sample_rate)?))
    }

    fn new_decoder(&self, sample_rate: u32) -> Result<Box<dyn ToneDecoder>> {
        Ok(Box::new(QrtoneDecoder::new(sample_rate)?))
    }
}
