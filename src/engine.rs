//! Engine: explicit owner of what the streaming pipelines share.
//!
//! Owns the audio parameters (sample rate, block size), the codec factory
//! and its readiness gate, and the shared capture tap: one capture thread
//! reading microphone blocks and fanning them out to every live receiver.
//! Pipelines are created through the engine and hold owning references to
//! what they use; there is no ambient global state.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::mpsc;

use crate::audio::alsa_device;
use crate::audio::input::{Receiver, ReceiverOptions};
use crate::audio::output::{Transmitter, TransmitterOptions};
use crate::codec::CodecFactory;
use crate::config::EngineConfig;
use crate::gate::CapabilityGate;

/// How many blocks a receiver may lag behind the tap before blocks drop.
const SUBSCRIBER_QUEUE_BLOCKS: usize = 32;

struct TapSubscriber {
    id: u64,
    tx: mpsc::Sender<Arc<[f32]>>,
    dropped: Arc<AtomicU64>,
}

type SubscriberList = Arc<Mutex<Vec<TapSubscriber>>>;

/// Owning subscription to the capture tap. Dropping it unsubscribes, which
/// closes the receiver's block channel.
pub(crate) struct TapSubscription {
    id: u64,
    subscribers: SubscriberList,
}

impl Drop for TapSubscription {
    fn drop(&mut self) {
        self.subscribers.lock().unwrap().retain(|s| s.id != self.id);
    }
}

struct CaptureTap {
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
    subscribers: SubscriberList,
    gate: Arc<CapabilityGate>,
    next_id: u64,
}

impl CaptureTap {
    fn spawn(device: String, sample_rate: u32, block_size: usize) -> Self {
        let running = Arc::new(AtomicBool::new(true));
        let subscribers: SubscriberList = Arc::new(Mutex::new(Vec::new()));
        let gate = Arc::new(CapabilityGate::new());

        let thread = {
            let running = running.clone();
            let subscribers = subscribers.clone();
            let gate = gate.clone();
            thread::Builder::new()
                .name("tone-capture".into())
                .spawn(move || {
                    if let Err(e) =
                        capture_thread(&device, sample_rate, block_size, &subscribers, &gate, &running)
                    {
                        log::error!("Capture thread error: {:#}", e);
                        // no-op if the tap already came up and failed later
                        gate.mark_failed(&format!("{:#}", e));
                    }
                })
                .ok()
        };
        if thread.is_none() {
            gate.mark_failed("failed to spawn capture thread");
        }

        Self {
            running,
            thread,
            subscribers,
            gate,
            next_id: 0,
        }
    }

    fn subscribe(&mut self) -> (mpsc::Receiver<Arc<[f32]>>, Arc<AtomicU64>, TapSubscription) {
        let id = self.next_id;
        self.next_id += 1;
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE_BLOCKS);
        let dropped = Arc::new(AtomicU64::new(0));
        self.subscribers.lock().unwrap().push(TapSubscriber {
            id,
            tx,
            dropped: dropped.clone(),
        });
        let subscription = TapSubscription {
            id,
            subscribers: self.subscribers.clone(),
        };
        (rx, dropped, subscription)
    }

    fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        self.subscribers.lock().unwrap().clear();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn capture_thread(
    device: &str,
    sample_rate: u32,
    block_size: usize,
    subscribers: &SubscriberList,
    gate: &CapabilityGate,
    running: &AtomicBool,
) -> Result<()> {
    let (pcm, _params) = alsa_device::open_capture(device, sample_rate, block_size)?;
    let io = pcm.io_f32()?;
    gate.mark_ready();

    let mut block = vec![0.0f32; block_size];
    // accumulate short reads so subscribers always see whole blocks
    let mut filled = 0;

    while running.load(Ordering::Relaxed) {
        match io.readi(&mut block[filled..]) {
            Ok(frames) => {
                filled += frames;
                if filled < block_size {
                    continue;
                }
                filled = 0;
                broadcast(subscribers, &block);
            }
            Err(e) => {
                log::warn!("ALSA capture error: {}, recovering...", e);
                pcm.prepare()
                    .with_context(|| "Failed to recover PCM capture")?;
            }
        }
    }

    log::info!("Capture tap stopped");
    Ok(())
}

/// Hand one captured block to every subscriber. A subscriber whose queue is
/// full misses the block and has its drop counter bumped; the tap itself
/// never blocks on a slow receiver.
fn broadcast(subscribers: &SubscriberList, block: &[f32]) {
    let block: Arc<[f32]> = Arc::from(block);
    for subscriber in subscribers.lock().unwrap().iter() {
        if subscriber.tx.try_send(block.clone()).is_err() {
            subscriber.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }
}

// ======================== Engine ========================

/// Shared context for transmitters and receivers.
pub struct Engine {
    config: EngineConfig,
    codec: Arc<dyn CodecFactory>,
    codec_gate: Arc<CapabilityGate>,
    capture: Mutex<Option<CaptureTap>>,
}

impl Engine {
    pub fn new(config: EngineConfig, codec: Arc<dyn CodecFactory>) -> Result<Self> {
        if config.block_size == 0 || !config.block_size.is_power_of_two() {
            anyhow::bail!("block_size must be a power of two, got {}", config.block_size);
        }
        let codec_gate = Arc::new(CapabilityGate::new());
        // the codec factory is live once constructed
        codec_gate.mark_ready();
        Ok(Self {
            config,
            codec,
            codec_gate,
            capture: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Register for codec-engine readiness. Settled gates fire synchronously.
    pub fn on_ready(
        &self,
        callback: Box<dyn FnOnce() + Send>,
        errback: Option<Box<dyn FnOnce(String) + Send>>,
    ) {
        self.codec_gate.on_ready(callback, errback);
    }

    /// Create an output streaming pipeline. The playback device is not
    /// touched until the first `transmit`.
    pub fn transmitter(&self, options: TransmitterOptions) -> Result<Transmitter> {
        let encoder = self.codec.new_encoder(self.config.sample_rate)?;
        Ok(Transmitter::new(
            encoder,
            self.config.playback_device.clone(),
            self.config.sample_rate,
            self.config.block_size,
            options,
        ))
    }

    /// Create an input streaming pipeline subscribed to the shared capture
    /// tap, starting the tap if this is the first receiver. `on_create` /
    /// `on_create_fail` fire when capture acquisition settles.
    pub fn receiver(&self, mut options: ReceiverOptions) -> Result<Receiver> {
        let mut capture = self.capture.lock().unwrap();
        let tap = capture.get_or_insert_with(|| {
            CaptureTap::spawn(
                self.config.capture_device.clone(),
                self.config.sample_rate,
                self.config.block_size,
            )
        });

        let on_create = options.on_create.take();
        let on_create_fail = options.on_create_fail.take();
        tap.gate.on_ready(
            Box::new(move || {
                if let Some(on_create) = on_create {
                    on_create();
                }
            }),
            on_create_fail,
        );

        let (blocks, dropped, subscription) = tap.subscribe();
        Ok(Receiver::start(
            self.config.block_size,
            self.config.sample_rate,
            Duration::from_millis(self.config.settle_delay_ms),
            self.codec.clone(),
            blocks,
            dropped,
            Some(subscription),
            options,
        ))
    }

    /// Stop the shared capture tap. This disconnects every receiver at once,
    /// so destroy receivers before calling it. The next `receiver` call
    /// starts a fresh tap.
    pub fn disconnect(&self) {
        if let Some(mut tap) = self.capture.lock().unwrap().take() {
            tap.stop();
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.disconnect();
    }
}
