//! micstream - live microphone capture service
//!
//! Streams the default microphone as 16kHz PCM chunks until Ctrl-C.

use micstream::audio::CpalProvider;
use micstream::ipc;
use micstream::pipeline::{CaptureService, PumpConfig};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "micstream=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("micstream v{}", env!("CARGO_PKG_VERSION"));

    let devices = CpalProvider::list_devices();
    tracing::info!("Input devices: {:?}", devices);

    let (handle, service) = CaptureService::spawn(CpalProvider::new(), PumpConfig::default());
    let mut chunks = handle.listen().await?;

    let message = ipc::start_recording(&handle).await?;
    tracing::info!("{}", message);

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            payload = chunks.recv() => match payload {
                Some(payload) => tracing::debug!(
                    sequence = payload.sequence_index,
                    samples = payload.samples.len(),
                    "chunk"
                ),
                None => break,
            },
            _ = &mut ctrl_c => break,
        }
    }

    match ipc::stop_recording(&handle).await {
        Ok(message) => tracing::info!("{}", message),
        Err(e) => tracing::warn!("{}", e),
    }

    if let Ok(status) = ipc::get_status(&handle).await {
        tracing::info!(
            forwarded = status.stats.forwarded,
            dropped = status.stats.dropped,
            "Final status: {}",
            status.status
        );
    }

    ipc::teardown(&handle).await;
    service.await?;
    Ok(())
}
