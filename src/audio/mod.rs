//! Audio device layer and streaming pipelines.
//!
//! `alsa_device` wraps PCM open/negotiation; `output` and `input` hold the
//! transmitter and receiver pipelines that bridge block-based hardware I/O
//! to the signal codec.

pub(crate) mod alsa_device;
pub(crate) mod input;
pub(crate) mod output;
