//! Output streaming pipeline (transmitter).
//!
//! Bridges the pull-based ALSA playback cycle to the push-based encoder: a
//! one-slot sample buffer is refilled from the encoder after each consumed
//! block, and the block cycle always hands the hardware a full block,
//! silence when no fresh data is pending. The slot handshake (`consumed`)
//! guarantees every produced block plays exactly once and is never
//! overwritten before it has played.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use anyhow::{Context, Result};

use super::alsa_device;
use crate::codec::{EccLevel, ToneEncoder};

/// Silence blocks emitted after the payload so the device's own buffering is
/// flushed before the output detaches.
const DRAIN_BLOCKS: u32 = 3;

/// Transmitter lifecycle. `Destroyed` overrides everything; the remaining
/// states advance Idle → Attaching → Streaming → Draining → Completed, and
/// a new session restarts the cycle at Attaching.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    Idle,
    Attaching,
    Streaming,
    Draining,
    Completed,
    Destroyed,
}

/// Transmitter creation options.
pub struct TransmitterOptions {
    /// Peak amplitude of the emitted signal, in (0, 1].
    pub gain: f32,
    /// Invoked once per transmission, after the trailing silence has been
    /// emitted and before the output detaches.
    pub on_finish: Option<Box<dyn FnMut() + Send>>,
}

impl Default for TransmitterOptions {
    fn default() -> Self {
        Self {
            gain: 1.0,
            on_finish: None,
        }
    }
}

// ======================== Core state machine ========================

pub(crate) struct TransmitterCore {
    encoder: Option<Box<dyn ToneEncoder>>,
    block_size: usize,
    /// One block of samples pending playback.
    slot: Vec<f32>,
    /// true: the slot holds stale data the hardware already played (safe to
    /// overwrite). false: fresh data pending, must not be overwritten.
    consumed: bool,
    gain: f32,
    state: TxState,
    /// Samples the current frame occupies, as reported by the encoder.
    total_samples: usize,
    /// Samples handed to the slot so far this session.
    written: usize,
    /// Trailing silence blocks emitted so far this session.
    empties: u32,
    on_finish: Option<Box<dyn FnMut() + Send>>,
}

impl TransmitterCore {
    pub(crate) fn new(
        encoder: Box<dyn ToneEncoder>,
        block_size: usize,
        options: TransmitterOptions,
    ) -> Self {
        Self {
            encoder: Some(encoder),
            block_size,
            slot: vec![0.0; block_size],
            consumed: true,
            gain: options.gain,
            state: TxState::Idle,
            total_samples: 0,
            written: 0,
            empties: 0,
            on_finish: options.on_finish,
        }
    }

    pub(crate) fn state(&self) -> TxState {
        self.state
    }

    /// Start a new transmission session. Returns false if the call was
    /// rejected (destroyed, or the encoder refused the payload); rejection
    /// leaves all session state untouched.
    pub(crate) fn submit(&mut self, payload: &[u8], ecc_level: i32, add_checksum: bool) -> bool {
        if self.state == TxState::Destroyed {
            return false;
        }
        let Some(encoder) = self.encoder.as_mut() else {
            return false;
        };
        let ecc = EccLevel::from_level(ecc_level);
        let total = match encoder.set_payload(payload, ecc, add_checksum) {
            Ok(total) => total,
            Err(e) => {
                log::error!("transmit rejected: {:#}", e);
                return false;
            }
        };
        if matches!(self.state, TxState::Streaming | TxState::Draining) {
            log::warn!("transmit while a session is in flight, replacing it");
        }
        self.total_samples = total;
        self.written = 0;
        self.empties = 0;
        self.state = match self.state {
            // already attached, keep streaming
            TxState::Streaming | TxState::Draining => TxState::Streaming,
            _ => TxState::Attaching,
        };
        true
    }

    /// The playback thread confirmed the device is open.
    pub(crate) fn mark_attached(&mut self) {
        if self.state == TxState::Attaching {
            self.state = TxState::Streaming;
        }
    }

    /// The playback thread could not open or keep the device; the session is
    /// dropped.
    pub(crate) fn detach_failed(&mut self) {
        if self.state != TxState::Destroyed {
            self.state = TxState::Idle;
        }
    }

    /// One hardware block cycle. Always fills `out` completely (the slot
    /// verbatim when fresh data is pending, silence otherwise) so the
    /// device is never starved. Returns true when a refill should run after
    /// the hardware write returns.
    pub(crate) fn fill_block(&mut self, out: &mut [f32]) -> bool {
        if self.state == TxState::Destroyed || self.consumed {
            out.fill(0.0);
            return false;
        }
        out.copy_from_slice(&self.slot);
        self.consumed = true;
        true
    }

    /// Produce the next block into the slot. Runs once per block cycle,
    /// outside the hardware write; also invoked directly by `transmit` to
    /// prime the first block.
    pub(crate) fn refill(&mut self) {
        if !matches!(self.state, TxState::Streaming | TxState::Draining) {
            return;
        }
        if !self.consumed {
            // backpressure: the previous block has not played yet
            return;
        }
        let Some(encoder) = self.encoder.as_mut() else {
            return;
        };

        self.slot.fill(0.0);
        encoder.fill_samples(&mut self.slot, self.gain);
        self.written += self.block_size;

        // written overshoots total_samples by up to one block because the
        // last real block is usually partial
        if self.written >= self.total_samples + self.block_size {
            if self.empties < DRAIN_BLOCKS {
                self.slot.fill(0.0);
                self.empties += 1;
                self.state = TxState::Draining;
                self.consumed = false;
                return;
            }
            self.state = TxState::Completed;
            if let Some(on_finish) = self.on_finish.as_mut() {
                on_finish();
            }
            return;
        }

        self.consumed = false;
    }

    /// Set the destroy guard and release the encoder and slot. Any block
    /// cycle or refill still in flight becomes a no-op.
    pub(crate) fn destroy(&mut self) {
        self.state = TxState::Destroyed;
        self.encoder = None;
        self.slot = Vec::new();
        self.on_finish = None;
    }
}

// ======================== Handle + playback thread ========================

/// Handle to an output streaming pipeline.
///
/// Created through [`Engine::transmitter`](crate::Engine::transmitter). The
/// playback device attaches lazily on the first `transmit` and detaches when
/// a session completes or the handle is destroyed.
pub struct Transmitter {
    core: Arc<Mutex<TransmitterCore>>,
    running: Arc<AtomicBool>,
    pump: Option<JoinHandle<()>>,
    device: String,
    sample_rate: u32,
    block_size: usize,
}

impl Transmitter {
    pub(crate) fn new(
        encoder: Box<dyn ToneEncoder>,
        device: String,
        sample_rate: u32,
        block_size: usize,
        options: TransmitterOptions,
    ) -> Self {
        Self {
            core: Arc::new(Mutex::new(TransmitterCore::new(encoder, block_size, options))),
            running: Arc::new(AtomicBool::new(false)),
            pump: None,
            device,
            sample_rate,
            block_size,
        }
    }

    /// Submit a payload for emission. Synchronous from the caller's side;
    /// audio emission is asynchronous. `ecc_level` clamps into 0..=3. After
    /// `destroy`, or when the codec rejects the payload, the call logs and
    /// returns with no state change.
    pub fn transmit(&mut self, payload: &[u8], ecc_level: i32, add_checksum: bool) {
        if !self.core.lock().unwrap().submit(payload, ecc_level, add_checksum) {
            return;
        }
        self.ensure_attached();
        // prime the first block; later refills ride the block cycle
        self.core.lock().unwrap().refill();
    }

    fn ensure_attached(&mut self) {
        if let Some(pump) = &self.pump {
            if !pump.is_finished() {
                return;
            }
            // previous session detached; reap it before re-attaching
            if let Some(pump) = self.pump.take() {
                let _ = pump.join();
            }
        }

        self.running.store(true, Ordering::SeqCst);
        let core = self.core.clone();
        let running = self.running.clone();
        let device = self.device.clone();
        let sample_rate = self.sample_rate;
        let block_size = self.block_size;

        let spawned = thread::Builder::new().name("tone-play".into()).spawn(move || {
            if let Err(e) = playback_thread(&device, sample_rate, block_size, &core, &running) {
                log::error!("Playback thread error: {:#}", e);
                core.lock().unwrap().detach_failed();
            }
        });
        match spawned {
            Ok(handle) => self.pump = Some(handle),
            Err(e) => {
                log::error!("Failed to spawn playback thread: {}", e);
                self.core.lock().unwrap().detach_failed();
            }
        }
    }

    /// Tear the pipeline down. Idempotent; every operation after the first
    /// call is a silent no-op, including block cycles already in flight.
    pub fn destroy(&mut self) {
        {
            let mut core = self.core.lock().unwrap();
            if core.state() == TxState::Destroyed {
                return;
            }
            core.destroy();
        }
        self.running.store(false, Ordering::SeqCst);
        if let Some(pump) = self.pump.take() {
            let _ = pump.join();
        }
    }
}

impl Drop for Transmitter {
    fn drop(&mut self) {
        self.destroy();
    }
}

fn playback_thread(
    device: &str,
    sample_rate: u32,
    block_size: usize,
    core: &Arc<Mutex<TransmitterCore>>,
    running: &AtomicBool,
) -> Result<()> {
    let (pcm, _params) = alsa_device::open_playback(device, sample_rate, block_size)?;
    let io = pcm.io_f32()?;
    let mut block = vec![0.0f32; block_size];

    {
        let mut core = core.lock().unwrap();
        core.mark_attached();
        core.refill();
    }

    while running.load(Ordering::Relaxed) {
        let needs_refill = core.lock().unwrap().fill_block(&mut block);

        // Write one full block, recovering from XRUN without losing frames
        let mut written = 0;
        let mut retries = 0u32;
        while written < block.len() {
            match io.writei(&block[written..]) {
                Ok(frames) => {
                    written += frames;
                    retries = 0;
                }
                Err(e) => {
                    log::warn!("ALSA XRUN or error: {}, recovering...", e);
                    retries += 1;
                    pcm.prepare()
                        .with_context(|| "Failed to recover PCM playback")?;
                    if retries >= 3 {
                        log::error!(
                            "Max recovery retries reached, dropping {} unwritten frames",
                            block.len() - written,
                        );
                        break;
                    }
                }
            }
        }

        if needs_refill {
            let mut core = core.lock().unwrap();
            core.refill();
            if core.state() == TxState::Completed {
                break;
            }
        }
    }

    let _ = pcm.drain();
    log::info!("Playback detached");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::testing::{EncoderLog, ScriptedEncoder};
    use std::sync::atomic::AtomicUsize;

    const BLOCK: usize = 16384;

    fn make_core(
        total_samples: usize,
        gain: f32,
    ) -> (TransmitterCore, Arc<Mutex<EncoderLog>>, Arc<AtomicUsize>) {
        let (encoder, log) = ScriptedEncoder::new(total_samples);
        let finishes = Arc::new(AtomicUsize::new(0));
        let finishes_clone = finishes.clone();
        let options = TransmitterOptions {
            gain,
            on_finish: Some(Box::new(move || {
                finishes_clone.fetch_add(1, Ordering::SeqCst);
            })),
        };
        (
            TransmitterCore::new(Box::new(encoder), BLOCK, options),
            log,
            finishes,
        )
    }

    /// Run block cycles until the session completes; returns the number of
    /// refills that ran (including the priming refill).
    fn run_session(core: &mut TransmitterCore, finishes: &AtomicUsize) -> usize {
        assert!(core.submit(&[1, 2, 3], 2, true));
        core.mark_attached();
        core.refill();
        let mut refills = 1;

        let mut out = vec![0.0f32; BLOCK];
        for _ in 0..100 {
            if core.fill_block(&mut out) {
                core.refill();
                refills += 1;
            }
            if core.state() == TxState::Completed {
                return refills;
            }
        }
        panic!(
            "session did not complete; finishes={}",
            finishes.load(Ordering::SeqCst)
        );
    }

    #[test]
    fn test_drain_completeness_one_block_payload() {
        let (mut core, _log, finishes) = make_core(BLOCK, 1.0);
        assert!(core.submit(&[7], 2, true));
        core.mark_attached();

        // refill 1: the payload block
        core.refill();
        assert_eq!(finishes.load(Ordering::SeqCst), 0);

        let mut out = vec![0.0f32; BLOCK];
        // refills 2..=4: the three trailing silence blocks
        for _ in 0..3 {
            assert!(core.fill_block(&mut out));
            core.refill();
            assert_eq!(core.state(), TxState::Draining);
            assert_eq!(finishes.load(Ordering::SeqCst), 0);
        }

        // refill 5: final check, completion fires
        assert!(core.fill_block(&mut out));
        core.refill();
        assert_eq!(core.state(), TxState::Completed);
        assert_eq!(finishes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_silence_blocks_are_zeroed() {
        let (mut core, _log, _finishes) = make_core(BLOCK, 1.0);
        assert!(core.submit(&[7], 2, true));
        core.mark_attached();
        core.refill();

        let mut out = vec![7.0f32; BLOCK];
        assert!(core.fill_block(&mut out));
        assert!(out.iter().all(|&s| s == 0.5), "payload block plays verbatim");

        core.refill();
        assert!(core.fill_block(&mut out));
        assert!(out.iter().all(|&s| s == 0.0), "drain blocks are silence");

        // nothing fresh: the cycle still gets a full block of silence
        let mut out = vec![7.0f32; BLOCK];
        assert!(!core.fill_block(&mut out));
        assert!(out.iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_no_overwrite_while_unplayed() {
        let (mut core, log, _finishes) = make_core(4 * BLOCK, 1.0);
        assert!(core.submit(&[1], 0, false));
        core.mark_attached();
        core.refill();
        assert_eq!(log.lock().unwrap().fill_calls.len(), 1);

        // the block has not been played; repeated refills must not touch the
        // slot or the encoder
        core.refill();
        core.refill();
        assert_eq!(log.lock().unwrap().fill_calls.len(), 1);

        let mut out = vec![0.0f32; BLOCK];
        assert!(core.fill_block(&mut out));
        core.refill();
        assert_eq!(log.lock().unwrap().fill_calls.len(), 2);
    }

    #[test]
    fn test_every_block_plays_exactly_once() {
        let (mut core, _log, _finishes) = make_core(2 * BLOCK, 1.0);
        assert!(core.submit(&[1], 0, false));
        core.mark_attached();
        core.refill();

        let mut out = vec![0.0f32; BLOCK];
        assert!(core.fill_block(&mut out));
        // second cycle without a refill: the same block must not replay
        assert!(!core.fill_block(&mut out));
        assert!(out.iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_ecc_level_out_of_range_clamps() {
        let (mut core, log, _finishes) = make_core(BLOCK, 1.0);
        assert!(core.submit(&[1, 2], 9, true));
        assert!(core.submit(&[1, 2], 3, true));
        assert!(core.submit(&[1, 2], -1, true));
        let log = log.lock().unwrap();
        assert_eq!(log.ecc_levels[0], EccLevel::H);
        assert_eq!(log.ecc_levels[0], log.ecc_levels[1]);
        assert_eq!(log.ecc_levels[2], EccLevel::L);
    }

    #[test]
    fn test_destroy_is_idempotent_and_silences_operations() {
        let (mut core, log, finishes) = make_core(BLOCK, 1.0);
        assert!(core.submit(&[1], 2, true));
        core.mark_attached();
        core.refill();

        core.destroy();
        core.destroy();
        assert_eq!(core.state(), TxState::Destroyed);

        // a block cycle racing destroy sees silence and schedules nothing
        let mut out = vec![7.0f32; BLOCK];
        assert!(!core.fill_block(&mut out));
        assert!(out.iter().all(|&s| s == 0.0));

        // no further encoder work, no completion callback
        let calls_before = log.lock().unwrap().fill_calls.len();
        core.refill();
        assert!(!core.submit(&[1], 2, true));
        assert_eq!(log.lock().unwrap().fill_calls.len(), calls_before);
        assert_eq!(finishes.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_session_resets_for_reuse() {
        let (mut core, _log, finishes) = make_core(BLOCK, 1.0);
        let first = run_session(&mut core, &finishes);
        assert_eq!(first, 5);
        assert_eq!(finishes.load(Ordering::SeqCst), 1);

        // the counters reset per transmit, so the same pipeline can run a
        // second session of identical shape
        let second = run_session(&mut core, &finishes);
        assert_eq!(second, 5);
        assert_eq!(finishes.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_gain_reaches_encoder() {
        let (mut core, log, _finishes) = make_core(BLOCK, 0.25);
        assert!(core.submit(&[1], 2, true));
        core.mark_attached();
        core.refill();
        assert_eq!(log.lock().unwrap().fill_calls[0], (BLOCK, 0.25));
    }

    #[test]
    fn test_rejected_payload_leaves_state_untouched() {
        let (mut core, _log, _finishes) = make_core(BLOCK, 1.0);
        // ScriptedEncoder rejects empty payloads
        assert!(!core.submit(&[], 2, true));
        assert_eq!(core.state(), TxState::Idle);
    }

    #[test]
    fn test_partial_final_block_extends_session() {
        let (mut core, _log, finishes) = make_core(BLOCK + 100, 1.0);
        let refills = run_session(&mut core, &finishes);
        // two data blocks (the second mostly silence), three drain blocks,
        // one completing refill
        assert_eq!(refills, 6);
    }
}
