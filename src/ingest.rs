use std::sync::Arc;

use bytes::BytesMut;
use gst_relay::{PushOutcome, Session};
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

const MAX_DATAGRAM: usize = 65536;

/// Feeds every datagram received on `listen` into the session, RTP and RTCP
/// alike. Stops on cancel or once the session refuses input.
pub async fn start_udp_ingest(
    cancel: CancellationToken,
    listen: &str,
    session: Arc<Session>,
) -> anyhow::Result<()> {
    let socket = UdpSocket::bind(listen)
        .await
        .map_err(|e| anyhow::anyhow!("bind {}: {}", listen, e))?;
    log::info!("udp ingest listening on {}", socket.local_addr()?);

    tokio::spawn(async move {
        let mut buf = BytesMut::zeroed(MAX_DATAGRAM);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                received = socket.recv_from(&mut buf) => {
                    let (len, peer) = match received {
                        Ok(received) => received,
                        Err(e) => {
                            log::warn!("udp recv: {}", e);
                            continue;
                        }
                    };
                    match session.push_packet(&buf[..len]) {
                        PushOutcome::Queued => {}
                        PushOutcome::Stopped => {
                            log::info!("session stopped, udp ingest exiting");
                            break;
                        }
                        outcome => log::debug!("dropped {} bytes from {}: {:?}", len, peer, outcome),
                    }
                }
            }
        }
    });
    Ok(())
}
