use anyhow::Result;

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    #[cfg(not(feature = "native-qrtone"))]
    return Err(anyhow::anyhow!(
        "the demo binary drives the native signal codec; rebuild with --features native-qrtone"
    ));

    #[cfg(feature = "native-qrtone")]
    demo::run().await
}

#[cfg(feature = "native-qrtone")]
mod demo {
    use std::sync::Arc;

    use anyhow::Result;
    use tokio::signal;
    use tokio::sync::mpsc;

    use tonewire::qrtone::QrtoneCodec;
    use tonewire::{Engine, EngineConfig, ReceivedMessage, ReceiverOptions, TransmitterOptions};

    const CONFIG_FILE: &str = "tonewire.json";

    fn load_config() -> EngineConfig {
        match std::fs::read_to_string(CONFIG_FILE) {
            Ok(content) => match serde_json::from_str(&content) {
                Ok(config) => {
                    log::info!("Loaded config from {}", CONFIG_FILE);
                    config
                }
                Err(e) => {
                    log::warn!("Ignoring malformed {}: {}", CONFIG_FILE, e);
                    EngineConfig::default()
                }
            },
            Err(_) => EngineConfig::default(),
        }
    }

    pub async fn run() -> Result<()> {
        let args: Vec<String> = std::env::args().collect();
        let config = load_config();
        let engine = Engine::new(config, Arc::new(QrtoneCodec))?;

        match args.get(1).map(String::as_str) {
            Some("send") if args.len() > 2 => send(&engine, args[2..].join(" ")).await,
            Some("listen") => listen(&engine).await,
            _ => {
                eprintln!("Usage: tonewire send <message...> | tonewire listen");
                Ok(())
            }
        }
    }

    async fn send(engine: &Engine, message: String) -> Result<()> {
        let (tx_done, mut rx_done) = mpsc::channel::<()>(1);
        let mut transmitter = engine.transmitter(TransmitterOptions {
            gain: 1.0,
            on_finish: Some(Box::new(move || {
                let _ = tx_done.try_send(());
            })),
        })?;

        println!("Transmitting {} bytes...", message.len());
        transmitter.transmit(message.as_bytes(), 2, true);

        tokio::select! {
            _ = rx_done.recv() => println!("Transmission complete"),
            _ = signal::ctrl_c() => println!("Interrupted"),
        }
        transmitter.destroy();
        Ok(())
    }

    async fn listen(engine: &Engine) -> Result<()> {
        let (tx_msg, mut rx_msg) = mpsc::channel::<ReceivedMessage>(16);
        let (tx_fail, mut rx_fail) = mpsc::channel::<String>(1);

        let mut options = ReceiverOptions::new(move |message| {
            let _ = tx_msg.blocking_send(message);
        });
        options.on_create = Some(Box::new(|| {
            log::info!("Receiver attached; decoding starts after the settling delay");
        }));
        options.on_create_fail = Some(Box::new(move |reason| {
            let _ = tx_fail.try_send(reason);
        }));
        options.on_stats = Some(Box::new(|stats| {
            log::info!(
                "Decoded {} frame(s), {} symbol(s) corrected",
                stats.frames_received,
                stats.fixed_errors,
            );
        }));

        let mut receiver = engine.receiver(options)?;
        println!("Listening... press Ctrl+C to stop");

        loop {
            tokio::select! {
                Some(message) = rx_msg.recv() => {
                    println!(
                        "[{:.3}] {} bytes: {:?}",
                        message.timestamp_secs,
                        message.payload.len(),
                        message.payload,
                    );
                }
                Some(reason) = rx_fail.recv() => {
                    log::error!("Receiver creation failed: {}", reason);
                    break;
                }
                _ = signal::ctrl_c() => break,
            }
        }

        receiver.destroy();
        engine.disconnect();
        Ok(())
    }
}
