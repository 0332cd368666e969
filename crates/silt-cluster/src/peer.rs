//! Peer directory backed by HTTP probes.
//!
//! Each node serves `GET /cluster/info` describing itself. The directory
//! probes its seed list on an interval, keeps the peers that answered, and
//! drops the ones that did not until they answer again. The local node is
//! always a member of its own listings, so a single-node deployment works
//! with an empty seed list.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use prometheus::{IntGauge, Registry};
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, RwLock};
use tracing::{debug, info, warn};

/// How often peers are re-probed.
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(30);

/// What a node does. A combined node answers for both tiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeType {
    Ingest,
    Store,
    IngestStore,
}

impl NodeType {
    /// Whether a node of this type serves the `want`ed role.
    pub fn serves(self, want: NodeType) -> bool {
        match (self, want) {
            (NodeType::IngestStore, _) => true,
            (a, b) => a == b,
        }
    }
}

/// Identity one node advertises at `/cluster/info`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInfo {
    pub id: String,
    pub node_type: NodeType,
    /// HTTP base address, e.g. `http://10.0.1.5:7650`.
    pub api_addr: String,
}

/// The listing interface the consumer and replication paths depend on.
#[async_trait]
pub trait PeerDirectory: Send + Sync + 'static {
    fn identity(&self) -> NodeInfo;

    /// API base addresses of live peers serving `want`, the local node
    /// included when it qualifies.
    async fn current(&self, want: NodeType) -> Vec<String>;
}

/// Directory that learns peer types and liveness by probing seeds.
pub struct HttpPeerDirectory {
    me: NodeInfo,
    seeds: Vec<String>,
    live: RwLock<HashMap<String, NodeInfo>>,
    client: reqwest::Client,
    cluster_size: IntGauge,
}

impl HttpPeerDirectory {
    pub fn new(
        me: NodeInfo,
        seeds: Vec<String>,
        registry: &Registry,
    ) -> Result<Arc<Self>, prometheus::Error> {
        let cluster_size = IntGauge::new(
            "silt_cluster_size",
            "Number of live peers in the cluster from this node's perspective.",
        )?;
        registry.register(Box::new(cluster_size.clone()))?;
        cluster_size.set(1);

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .expect("default reqwest client");

        Ok(Arc::new(Self {
            me,
            seeds,
            live: RwLock::new(HashMap::new()),
            client,
            cluster_size,
        }))
    }

    /// Probe every seed once and replace the live set with the answers.
    pub async fn refresh(&self) {
        let mut found = HashMap::new();
        for seed in &self.seeds {
            if *seed == self.me.api_addr {
                continue;
            }
            let url = format!("{}/cluster/info", seed.trim_end_matches('/'));
            match self.client.get(&url).send().await {
                Ok(resp) if resp.status().is_success() => match resp.json::<NodeInfo>().await {
                    Ok(info) => {
                        debug!(peer = %seed, node_type = ?info.node_type, "peer answered");
                        found.insert(seed.clone(), info);
                    }
                    Err(err) => warn!(peer = %seed, error = %err, "bad cluster info payload"),
                },
                Ok(resp) => warn!(peer = %seed, status = %resp.status(), "peer probe rejected"),
                Err(err) => debug!(peer = %seed, error = %err, "peer unreachable"),
            }
        }
        self.cluster_size.set(found.len() as i64 + 1);
        *self.live.write().await = found;
    }

    /// Refresh loop. Runs until the shutdown signal flips.
    pub async fn run(
        self: Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), DirectoryError> {
        info!(seeds = self.seeds.len(), interval_secs = interval.as_secs(), "membership refresh started");
        self.refresh().await;
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.refresh().await,
                _ = shutdown.changed() => break,
            }
        }
        info!("membership refresh stopped");
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DirectoryError {
    #[error("membership probe failed: {0}")]
    Probe(#[from] reqwest::Error),
}

#[async_trait]
impl PeerDirectory for HttpPeerDirectory {
    fn identity(&self) -> NodeInfo {
        self.me.clone()
    }

    async fn current(&self, want: NodeType) -> Vec<String> {
        let live = self.live.read().await;
        let mut addrs: Vec<String> = live
            .values()
            .filter(|info| info.node_type.serves(want))
            .map(|info| info.api_addr.clone())
            .collect();
        if self.me.node_type.serves(want) {
            addrs.push(self.me.api_addr.clone());
        }
        addrs
    }
}
