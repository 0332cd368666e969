//! Store Consumer
//!
//! The loop that drains ingest nodes into the store. Each pass discovers the
//! current ingest peers, shuffles them for load balance, and walks the list
//! claiming one segment at a time:
//!
//! 1. `GET /ingest/next` claims the peer's oldest flushed segment. A 404
//!    means the peer has nothing; any other failure is logged and the next
//!    peer is tried.
//! 2. The body is appended to the local store.
//! 3. On success `POST /ingest/commit?token=T`; on append failure
//!    `POST /ingest/fail?token=T` hands the segment back.
//!
//! A pass that yields nothing sleeps a short jittered interval before
//! rediscovery. Delivery is at-least-once: a commit that fails after a
//! successful append is reclaimed by the ingest sweep and appended again,
//! where the range-idempotent store absorbs it.
//!
//! With a replication factor above one, each appended segment is also pushed
//! to random sibling stores over `POST /store/replicate`, counted as egress.

use std::sync::Arc;
use std::time::Duration;

use rand::seq::SliceRandom;
use rand::Rng;
use reqwest::StatusCode;
use silt_cluster::{NodeType, PeerDirectory};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::log::StoreLog;
use crate::metrics::StoreMetrics;

/// Header carrying the claim token, shared with the ingest API.
const SEGMENT_TOKEN_HEADER: &str = "x-segment-token";

#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Copies of each segment across the store tier, this node included.
    pub replication_factor: usize,
    /// Deadline for each claim and control request.
    pub request_timeout: Duration,
    /// Idle back-off bounds, jittered per pass.
    pub backoff_min: Duration,
    pub backoff_max: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            replication_factor: 1,
            request_timeout: Duration::from_secs(10),
            backoff_min: Duration::from_millis(250),
            backoff_max: Duration::from_secs(1),
        }
    }
}

pub struct Consumer {
    peers: Arc<dyn PeerDirectory>,
    store: Arc<StoreLog>,
    client: reqwest::Client,
    config: ConsumerConfig,
    metrics: Arc<StoreMetrics>,
}

impl Consumer {
    pub fn new(
        peers: Arc<dyn PeerDirectory>,
        store: Arc<StoreLog>,
        config: ConsumerConfig,
        metrics: Arc<StoreMetrics>,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .expect("default reqwest client");
        Self {
            peers,
            store,
            client,
            config,
            metrics,
        }
    }

    /// Run until the shutdown signal flips.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!("consumer started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            let consumed = match self.pass().await {
                Ok(consumed) => consumed,
                Err(Error::NoPeersAvailable) => {
                    debug!("no ingest peers available");
                    false
                }
                Err(err) => {
                    warn!(error = %err, "consumer pass failed");
                    false
                }
            };
            if !consumed {
                let backoff = self.jittered_backoff();
                tokio::select! {
                    _ = tokio::time::sleep(backoff) => {}
                    _ = shutdown.changed() => break,
                }
            }
        }
        info!("consumer stopped");
        Ok(())
    }

    /// One full pass over the shuffled peer list. True when a segment was
    /// consumed.
    async fn pass(&self) -> Result<bool> {
        let mut peers = self.peers.current(NodeType::Ingest).await;
        if peers.is_empty() {
            return Err(Error::NoPeersAvailable);
        }
        {
            let mut rng = rand::thread_rng();
            peers.shuffle(&mut rng);
        }
        for peer in &peers {
            match self.consume_one(peer).await {
                Ok(true) => return Ok(true),
                Ok(false) => continue,
                Err(err) => {
                    warn!(peer = %peer, error = %err, "claim attempt failed");
                    continue;
                }
            }
        }
        Ok(false)
    }

    /// Claim, append, and settle one segment from `base`. False when the
    /// peer had nothing or the segment was handed back.
    async fn consume_one(&self, base: &str) -> Result<bool> {
        let resp = self
            .client
            .get(format!("{base}/ingest/next"))
            .send()
            .await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        let resp = resp.error_for_status()?;
        let token = resp
            .headers()
            .get(SEGMENT_TOKEN_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned)
            .ok_or(Error::MissingToken)?;
        let body = resp.bytes().await?;

        match self.store.append(&body).await {
            Ok(meta) => {
                self.settle(base, "commit", &token).await?;
                self.metrics.consumed_segments.inc();
                self.metrics.consumed_bytes.inc_by(body.len() as u64);
                debug!(segment = %meta.path.display(), bytes = body.len(), "segment consumed");
                self.replicate(&body).await;
                Ok(true)
            }
            Err(err) => {
                warn!(error = %err, peer = %base, "append failed, handing segment back");
                if let Err(err) = self.settle(base, "fail", &token).await {
                    // The sweep covers a lost fail.
                    warn!(error = %err, "fail request did not land");
                }
                Ok(false)
            }
        }
    }

    async fn settle(&self, base: &str, op: &str, token: &str) -> Result<()> {
        self.client
            .post(format!("{base}/ingest/{op}?token={token}"))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    /// Push the freshly appended segment to sibling stores. Best effort;
    /// receive is idempotent by range name, failures are logged and counted
    /// nowhere else.
    async fn replicate(&self, body: &bytes::Bytes) {
        if self.config.replication_factor <= 1 {
            return;
        }
        let me = self.peers.identity().api_addr;
        let mut stores = self.peers.current(NodeType::Store).await;
        stores.retain(|addr| *addr != me);
        {
            let mut rng = rand::thread_rng();
            stores.shuffle(&mut rng);
        }
        stores.truncate(self.config.replication_factor - 1);

        for peer in stores {
            let sent = self
                .client
                .post(format!("{peer}/store/replicate"))
                .body(body.clone())
                .send()
                .await
                .and_then(|resp| resp.error_for_status());
            match sent {
                Ok(_) => {
                    self.metrics
                        .replicated_segments
                        .with_label_values(&["egress"])
                        .inc();
                    self.metrics
                        .replicated_bytes
                        .with_label_values(&["egress"])
                        .inc_by(body.len() as u64);
                }
                Err(err) => warn!(peer = %peer, error = %err, "replication push failed"),
            }
        }
    }

    fn jittered_backoff(&self) -> Duration {
        let min = self.config.backoff_min.as_millis() as u64;
        let max = (self.config.backoff_max.as_millis() as u64).max(min + 1);
        let ms = rand::thread_rng().gen_range(min..max);
        Duration::from_millis(ms)
    }
}
