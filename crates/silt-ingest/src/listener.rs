//! TCP listeners for the three write modalities.
//!
//! Each listener accepts connections and spawns one writer actor per
//! connection. The listener itself and every spawned actor stop on the
//! shared shutdown signal.

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::log::IngestLog;
use crate::metrics::IngestMetrics;
use crate::writer::{handle_connection, Modality, WriterConfig};

/// Accept loop for one modality. Returns when the shutdown signal flips.
pub async fn serve_writers(
    listener: TcpListener,
    modality: Modality,
    log: Arc<IngestLog>,
    config: WriterConfig,
    metrics: Arc<IngestMetrics>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let local_addr = listener.local_addr().map_err(silt_core::Error::from)?;
    info!(addr = %local_addr, modality = modality.as_str(), "writer listener started");

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, addr)) => {
                        let gauge = metrics
                            .connected_clients
                            .with_label_values(&[modality.as_str()]);
                        gauge.inc();
                        let log = log.clone();
                        let metrics = metrics.clone();
                        let shutdown = shutdown.clone();
                        tokio::spawn(async move {
                            match handle_connection(stream, modality, log, config, metrics, shutdown)
                                .await
                            {
                                Ok(()) => debug!(client = %addr, "connection closed"),
                                Err(err) => {
                                    warn!(client = %addr, error = %err, "connection failed")
                                }
                            }
                            gauge.dec();
                        });
                    }
                    Err(err) => error!(error = %err, "accept failed"),
                }
            }
            _ = shutdown.changed() => break,
        }
    }

    info!(modality = modality.as_str(), "writer listener stopped");
    Ok(())
}
