//! Input streaming pipeline (receiver).
//!
//! The engine's capture tap delivers fixed-size blocks; the receiver walks
//! each block in windows no longer than the decoder currently accepts,
//! queues completed payloads with an absolute timestamp, and delivers them
//! to the consumer callback on its own thread; decoding never runs on the
//! capture thread itself.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tokio::sync::mpsc;

use crate::codec::{CodecFactory, ToneDecoder};
use crate::engine::TapSubscription;

/// A payload recovered from the capture stream.
#[derive(Debug, Clone, PartialEq)]
pub struct ReceivedMessage {
    /// Absolute wall-clock time, in seconds since the Unix epoch, at which
    /// the frame's last sample was captured.
    pub timestamp_secs: f64,
    pub payload: Vec<u8>,
}

/// Decode statistics, reported after every pass that completes a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceiverStats {
    pub frames_received: u64,
    /// Symbols the decoder corrected via error correction, cumulative.
    pub fixed_errors: u32,
}

/// Receiver creation options. Only `on_receive` is required.
pub struct ReceiverOptions {
    /// Invoked once per decoded payload, in arrival order.
    pub on_receive: Box<dyn FnMut(ReceivedMessage) + Send>,
    /// Invoked once the capture device is attached.
    pub on_create: Option<Box<dyn FnOnce() + Send>>,
    /// Invoked if the capture device cannot be acquired.
    pub on_create_fail: Option<Box<dyn FnOnce(String) + Send>>,
    /// Invoked with the cumulative dropped-block count when this receiver
    /// falls behind the capture tap.
    pub on_receive_fail: Option<Box<dyn FnMut(u64) + Send>>,
    /// Invoked with updated statistics after each completed frame.
    pub on_stats: Option<Box<dyn FnMut(ReceiverStats) + Send>>,
}

impl ReceiverOptions {
    pub fn new(on_receive: impl FnMut(ReceivedMessage) + Send + 'static) -> Self {
        Self {
            on_receive: Box::new(on_receive),
            on_create: None,
            on_create_fail: None,
            on_receive_fail: None,
            on_stats: None,
        }
    }
}

// ======================== Core state machine ========================

pub(crate) struct ReceiverCore {
    /// None until the settling delay after capture attach has elapsed.
    decoder: Option<Box<dyn ToneDecoder>>,
    /// The most recently captured block.
    block: Vec<f32>,
    sample_rate: u32,
    /// Wall-clock epoch of the decoded stream's first sample; 0 until the
    /// first decode pass runs.
    epoch_secs: f64,
    messages: VecDeque<ReceivedMessage>,
    frames_received: u64,
    destroyed: bool,
}

impl ReceiverCore {
    pub(crate) fn new(block_size: usize, sample_rate: u32) -> Self {
        Self {
            decoder: None,
            block: vec![0.0; block_size],
            sample_rate,
            epoch_secs: 0.0,
            messages: VecDeque::new(),
            frames_received: 0,
            destroyed: false,
        }
    }

    pub(crate) fn needs_decoder(&self) -> bool {
        !self.destroyed && self.decoder.is_none()
    }

    pub(crate) fn install_decoder(&mut self, decoder: Box<dyn ToneDecoder>) {
        if !self.destroyed && self.decoder.is_none() {
            self.decoder = Some(decoder);
        }
    }

    /// Store one hardware-delivered block. Returns true when a decode pass
    /// should follow (a decoder exists and the pipeline is live).
    pub(crate) fn capture_block(&mut self, input: &[f32]) -> bool {
        if self.destroyed {
            return false;
        }
        let n = input.len().min(self.block.len());
        self.block[..n].copy_from_slice(&input[..n]);
        self.decoder.is_some()
    }

    /// Walk the captured block in decoder-sized windows. Returns true when
    /// at least one frame completed.
    pub(crate) fn decode_pass(&mut self) -> bool {
        if self.destroyed {
            return false;
        }
        let Some(decoder) = self.decoder.as_mut() else {
            return false;
        };
        if self.epoch_secs == 0.0 {
            self.epoch_secs = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs_f64();
        }

        let mut completed = false;
        let mut cursor = 0;
        while cursor < self.block.len() {
            // the decoder bounds how much it accepts per call depending on
            // its frame-alignment state; re-query every window
            let window = (self.block.len() - cursor).min(decoder.max_window_len());
            if window == 0 {
                break;
            }
            if decoder.push_samples(&self.block[cursor..cursor + window]) {
                let payload = decoder.payload();
                let timestamp_secs = self.epoch_secs
                    + decoder.payload_sample_index() as f64 / self.sample_rate as f64;
                self.messages.push_back(ReceivedMessage {
                    timestamp_secs,
                    payload,
                });
                self.frames_received += 1;
                completed = true;
            }
            cursor += window;
        }
        completed
    }

    /// Take all queued messages, oldest first.
    pub(crate) fn drain_messages(&mut self) -> Vec<ReceivedMessage> {
        if self.destroyed {
            return Vec::new();
        }
        self.messages.drain(..).collect()
    }

    pub(crate) fn stats(&self) -> ReceiverStats {
        ReceiverStats {
            frames_received: self.frames_received,
            fixed_errors: self
                .decoder
                .as_ref()
                .map(|d| d.fixed_error_count())
                .unwrap_or(0),
        }
    }

    /// Set the destroy guard and release the decoder and capture buffer.
    pub(crate) fn destroy(&mut self) {
        self.destroyed = true;
        self.decoder = None;
        self.block = Vec::new();
        self.messages.clear();
    }
}

// ======================== Handle + receiver thread ========================

/// Handle to an input streaming pipeline.
///
/// Created through [`Engine::receiver`](crate::Engine::receiver). Holds an
/// owning subscription to the engine's shared capture tap for its lifetime.
pub struct Receiver {
    core: Arc<Mutex<ReceiverCore>>,
    thread: Option<JoinHandle<()>>,
    subscription: Option<TapSubscription>,
    destroyed: bool,
}

impl Receiver {
    pub(crate) fn start(
        block_size: usize,
        sample_rate: u32,
        settle_delay: Duration,
        factory: Arc<dyn CodecFactory>,
        blocks: mpsc::Receiver<Arc<[f32]>>,
        dropped: Arc<AtomicU64>,
        subscription: Option<TapSubscription>,
        options: ReceiverOptions,
    ) -> Self {
        let core = Arc::new(Mutex::new(ReceiverCore::new(block_size, sample_rate)));

        let thread = {
            let core = core.clone();
            thread::Builder::new()
                .name("tone-receive".into())
                .spawn(move || {
                    receiver_thread(core, blocks, factory, sample_rate, settle_delay, dropped, options);
                })
                .ok()
        };
        if thread.is_none() {
            log::error!("Failed to spawn receiver thread");
        }

        Self {
            core,
            thread,
            subscription,
            destroyed: false,
        }
    }

    /// Tear the pipeline down. Idempotent; capture blocks already in flight
    /// become no-ops.
    pub fn destroy(&mut self) {
        if self.destroyed {
            return;
        }
        self.destroyed = true;
        self.core.lock().unwrap().destroy();
        // dropping the subscription closes the block channel, which ends the
        // receiver thread
        self.subscription = None;
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for Receiver {
    fn drop(&mut self) {
        self.destroy();
    }
}

fn receiver_thread(
    core: Arc<Mutex<ReceiverCore>>,
    mut blocks: mpsc::Receiver<Arc<[f32]>>,
    factory: Arc<dyn CodecFactory>,
    sample_rate: u32,
    settle_delay: Duration,
    dropped: Arc<AtomicU64>,
    options: ReceiverOptions,
) {
    let ReceiverOptions {
        mut on_receive,
        mut on_receive_fail,
        mut on_stats,
        ..
    } = options;
    let attached_at = Instant::now();
    let mut decoder_failed = false;
    let mut reported_drops = 0u64;

    while let Some(block) = blocks.blocking_recv() {
        // blocks arriving before the settling delay elapses are discarded
        // undecoded; the decoder is only built against a stable graph
        if !decoder_failed && attached_at.elapsed() >= settle_delay {
            let mut core = core.lock().unwrap();
            if core.needs_decoder() {
                match factory.new_decoder(sample_rate) {
                    Ok(decoder) => core.install_decoder(decoder),
                    Err(e) => {
                        log::error!("Failed to create decoder: {:#}", e);
                        decoder_failed = true;
                    }
                }
            }
        }

        if core.lock().unwrap().capture_block(&block) {
            let completed = {
                let mut core = core.lock().unwrap();
                core.decode_pass()
            };
            let messages = core.lock().unwrap().drain_messages();
            for message in messages {
                on_receive(message);
            }
            if completed {
                if let Some(on_stats) = on_stats.as_mut() {
                    on_stats(core.lock().unwrap().stats());
                }
            }
        }

        let drops = dropped.load(Ordering::Relaxed);
        if drops > reported_drops {
            reported_drops = drops;
            log::warn!("Receiver fell behind; {} capture blocks dropped so far", drops);
            if let Some(on_receive_fail) = on_receive_fail.as_mut() {
                on_receive_fail(drops);
            }
        }
    }

    log::info!("Receiver capture stream closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::testing::{LoopbackCodec, LoopbackEncoder, ScriptedDecoder};
    use crate::codec::{EccLevel, ToneEncoder};

    const BLOCK: usize = 16384;
    const RATE: u32 = 44100;

    fn ramp_block() -> Vec<f32> {
        (0..BLOCK).map(|i| i as f32).collect()
    }

    #[test]
    fn test_windowed_decode_covers_full_block() {
        let mut core = ReceiverCore::new(BLOCK, RATE);
        let (decoder, log) = ScriptedDecoder::new(512);
        core.install_decoder(Box::new(decoder));

        assert!(core.capture_block(&ramp_block()));
        core.decode_pass();

        let log = log.lock().unwrap();
        assert_eq!(log.window_lens.len(), 32);
        assert!(log.window_lens.iter().all(|&len| len == 512));
        // the block is a ramp, so each window's first sample is its offset
        let offsets: Vec<f32> = (0..32).map(|i| (i * 512) as f32).collect();
        assert_eq!(log.window_starts, offsets);
    }

    #[test]
    fn test_window_never_exceeds_remaining_block() {
        let mut core = ReceiverCore::new(BLOCK, RATE);
        let (decoder, log) = ScriptedDecoder::new(100_000);
        core.install_decoder(Box::new(decoder));

        assert!(core.capture_block(&ramp_block()));
        core.decode_pass();

        assert_eq!(log.lock().unwrap().window_lens, vec![BLOCK]);
    }

    #[test]
    fn test_completed_frame_is_queued_with_timestamp() {
        let mut core = ReceiverCore::new(BLOCK, RATE);
        let (mut decoder, _log) = ScriptedDecoder::new(512);
        decoder.completions = vec![(5, vec![9, 8, 7], 2304)];
        core.install_decoder(Box::new(decoder));

        core.capture_block(&ramp_block());
        assert!(core.decode_pass());

        let messages = core.drain_messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].payload, vec![9, 8, 7]);
        let expected = core.epoch_secs + 2304.0 / RATE as f64;
        assert!((messages[0].timestamp_secs - expected).abs() < 1e-9);
        assert!(core.epoch_secs > 0.0);
    }

    #[test]
    fn test_messages_deliver_in_arrival_order() {
        let mut core = ReceiverCore::new(BLOCK, RATE);
        let (mut decoder, _log) = ScriptedDecoder::new(512);
        decoder.completions = vec![(1, vec![1], 100), (3, vec![2], 1300)];
        core.install_decoder(Box::new(decoder));

        core.capture_block(&ramp_block());
        core.decode_pass();

        let messages = core.drain_messages();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].payload, vec![1]);
        assert_eq!(messages[1].payload, vec![2]);
        assert!(messages[0].timestamp_secs < messages[1].timestamp_secs);

        // drained means drained
        assert!(core.drain_messages().is_empty());
    }

    #[test]
    fn test_no_decode_before_decoder_installed() {
        let mut core = ReceiverCore::new(BLOCK, RATE);
        assert!(!core.capture_block(&ramp_block()));
        assert!(!core.decode_pass());
        assert_eq!(core.epoch_secs, 0.0);
    }

    #[test]
    fn test_stats_track_completed_frames() {
        let mut core = ReceiverCore::new(BLOCK, RATE);
        let (mut decoder, _log) = ScriptedDecoder::new(4096);
        decoder.completions = vec![(2, vec![1], 100), (4, vec![2], 200)];
        core.install_decoder(Box::new(decoder));

        core.capture_block(&ramp_block());
        core.decode_pass();
        assert_eq!(core.stats().frames_received, 2);
    }

    #[test]
    fn test_destroy_is_idempotent_and_silences_operations() {
        let mut core = ReceiverCore::new(BLOCK, RATE);
        let (mut decoder, log) = ScriptedDecoder::new(512);
        decoder.completions = vec![(1, vec![1], 100)];
        core.install_decoder(Box::new(decoder));
        core.capture_block(&ramp_block());
        core.decode_pass();

        core.destroy();
        core.destroy();

        assert!(!core.capture_block(&ramp_block()));
        let windows_before = log.lock().unwrap().window_lens.len();
        assert!(!core.decode_pass());
        assert_eq!(log.lock().unwrap().window_lens.len(), windows_before);
        // queued but undelivered messages die with the pipeline
        assert!(core.drain_messages().is_empty());

        // a decoder cannot be installed into a destroyed pipeline
        let (decoder, _log) = ScriptedDecoder::new(512);
        core.install_decoder(Box::new(decoder));
        assert!(!core.needs_decoder());
        assert!(!core.decode_pass());
    }

    #[test]
    fn test_receiver_thread_end_to_end() {
        // one encoded frame in the middle of an otherwise silent block
        let mut encoder = LoopbackEncoder::new();
        encoder.set_payload(&[10, 20, 30], EccLevel::Q, true).unwrap();
        let mut block = vec![0.0f32; BLOCK];
        encoder.fill_samples(&mut block[300..], 1.0);

        let (tx, rx) = mpsc::channel::<Arc<[f32]>>(8);
        let received: Arc<Mutex<Vec<ReceivedMessage>>> = Arc::new(Mutex::new(Vec::new()));
        let received_clone = received.clone();

        let mut receiver = Receiver::start(
            BLOCK,
            RATE,
            Duration::ZERO,
            Arc::new(LoopbackCodec { decoder_window: 512 }),
            rx,
            Arc::new(AtomicU64::new(0)),
            None,
            ReceiverOptions::new(move |message| received_clone.lock().unwrap().push(message)),
        );

        tx.try_send(Arc::from(block.into_boxed_slice())).unwrap();
        drop(tx);
        if let Some(thread) = receiver.thread.take() {
            thread.join().unwrap();
        }
        receiver.destroy();

        let received = received.lock().unwrap();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].payload, vec![10, 20, 30]);
    }
}
