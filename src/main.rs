use std::sync::Arc;

use futures::StreamExt;
use gst_relay::{Relay, RelayError};
use tokio_util::sync::CancellationToken;

mod config;
mod ingest;

fn init_logging() {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .filter_module("gst_relay", log::LevelFilter::Debug)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();
    let config = config::config();

    let relay = Relay::new(gst_relay::default_engine(), config.relay().clone())?;
    relay.run()?;
    log::info!("relay running on {} engine", relay.engine().name());

    let session = Arc::new(relay.compile(&config.descriptor()?)?);
    session.on_new_source(|source| {
        log::info!(
            "new source ssrc={} pt={} codec={:?} on port {}",
            source.key,
            source.payload_type,
            source.codec,
            source.port
        );
    });
    session.on_source_frame(|frame| {
        log::trace!("{}: {} bytes pts={:?}", frame.port, frame.len(), frame.pts);
    });
    for port in session.ports() {
        if port.as_str() == "media-out" {
            session.on_frame(port, |frame| {
                log::trace!("media-out: {} bytes pts={:?}", frame.len(), frame.pts);
            })?;
        }
    }

    let mut diagnostics = session.diagnostics();
    tokio::spawn(async move {
        while let Some(diagnostic) = diagnostics.next().await {
            log::debug!("diagnostic: {}", diagnostic);
        }
    });

    session.start()?;

    let cancel = CancellationToken::new();
    ingest::start_udp_ingest(cancel.clone(), config.listen(), session.clone()).await?;

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                break;
            },
            _ = tokio::signal::ctrl_c() => {
                cancel.cancel();
            },
            fatal = session.wait_fatal() => {
                log::error!("engine stopped: {}", fatal);
                cancel.cancel();
            },
        }
    }

    let outcome = session.check();
    session.stop();
    relay.shutdown();
    match outcome {
        Err(RelayError::EngineFatal(fatal)) if fatal.is_eos() => Ok(()),
        outcome => Ok(outcome?),
    }
}
