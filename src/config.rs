use serde::{Deserialize, Serialize};

/// Engine configuration.
///
/// All fields have defaults suitable for a desktop machine with a "default"
/// ALSA device; the demo binary can override them from a JSON file.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct EngineConfig {
    /// ALSA playback device name (e.g. "default", "plughw:0,0")
    pub playback_device: String,
    /// ALSA capture device name
    pub capture_device: String,
    /// Sample rate the codec and both PCM devices run at
    pub sample_rate: u32,
    /// Samples exchanged with the hardware per block cycle; must be a power of two
    pub block_size: usize,
    /// Delay between capture attach and decoder construction, in milliseconds.
    /// Lets the capture graph stabilize so warm-up transients are not decoded.
    pub settle_delay_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            playback_device: "default".to_string(),
            capture_device: "default".to_string(),
            sample_rate: 44100,
            block_size: 16384,
            settle_delay_ms: 2000,
        }
    }
}
