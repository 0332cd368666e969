//! Silt Server
//!
//! Wires the two tiers and the membership layer into one node process. The
//! flow through a node:
//!
//! ```text
//! producer ──tcp──► writer ──► ingest log ──claim/commit──► consumer ──► store log
//!                                  ▲                                        │
//!                               sweeper                                 compacter
//! ```
//!
//! [`Node::build`] binds the listeners and assembles the actors; [`Node::run`]
//! hands them to the supervisor, which stops everything when the first actor
//! exits and surfaces the first error as the process result.

pub mod config;
pub mod ops;
pub mod supervisor;

use std::net::SocketAddr;
use std::sync::Arc;

use prometheus::Registry;
use tokio::net::TcpListener;
use tracing::info;
use ulid::Ulid;

use silt_cluster::{HttpPeerDirectory, NodeInfo, NodeType, DEFAULT_REFRESH_INTERVAL};
use silt_ingest::{
    run_sweeper, serve_writers, IngestApiState, IngestLog, IngestMetrics, Modality, WriterConfig,
};
use silt_store::{
    Compacter, CompacterConfig, Consumer, ConsumerConfig, StoreApiState, StoreLog, StoreMetrics,
};

pub use config::{Args, FilesystemKind};
pub use supervisor::{shutdown_signal, BoxError, ShutdownHandle, Supervisor};

/// A fully wired node, not yet running. Tests build one on ephemeral ports
/// and drive it directly; `main` builds one from the CLI.
pub struct Node {
    pub api_addr: SocketAddr,
    pub fast_addr: SocketAddr,
    pub durable_addr: SocketAddr,
    pub bulk_addr: SocketAddr,
    pub identity: NodeInfo,
    pub ingest_log: Arc<IngestLog>,
    pub store_log: Arc<StoreLog>,
    pub registry: Registry,
    supervisor: Supervisor,
}

impl Node {
    pub async fn build(args: Args) -> Result<Node, BoxError> {
        let registry = Registry::new();
        let fs = args.filesystem.build();

        let ingest_log = Arc::new(IngestLog::open(fs.clone(), args.ingest_path.clone()).await?);
        let store_log = Arc::new(
            StoreLog::open(fs.clone(), args.store_path.clone(), args.segment_target_size).await?,
        );
        let ingest_metrics = Arc::new(IngestMetrics::new(&registry));
        let store_metrics = Arc::new(StoreMetrics::new(&registry));
        info!(
            ingest_path = %args.ingest_path.display(),
            store_path = %args.store_path.display(),
            "segment logs opened"
        );

        let api_listener = TcpListener::bind(&args.api_addr).await?;
        let fast_listener = TcpListener::bind(&args.fast_addr).await?;
        let durable_listener = TcpListener::bind(&args.durable_addr).await?;
        let bulk_listener = TcpListener::bind(&args.bulk_addr).await?;
        let api_addr = api_listener.local_addr()?;
        let fast_addr = fast_listener.local_addr()?;
        let durable_addr = durable_listener.local_addr()?;
        let bulk_addr = bulk_listener.local_addr()?;

        let advertised = args
            .advertised_api
            .clone()
            .unwrap_or_else(|| format!("http://{api_addr}"));
        let identity = NodeInfo {
            id: Ulid::new().to_string(),
            node_type: NodeType::IngestStore,
            api_addr: advertised,
        };
        let directory = HttpPeerDirectory::new(identity.clone(), args.peers.clone(), &registry)?;

        let mut supervisor = Supervisor::new();
        let handle = supervisor.handle();

        let writer_config = WriterConfig {
            flush_size: args.segment_flush_size,
            flush_age: args.flush_age(),
        };
        for (listener, modality) in [
            (fast_listener, Modality::Fast),
            (durable_listener, Modality::Durable),
            (bulk_listener, Modality::Bulk),
        ] {
            supervisor.add(
                format!("{}-listener", modality.as_str()),
                serve_writers(
                    listener,
                    modality,
                    ingest_log.clone(),
                    writer_config,
                    ingest_metrics.clone(),
                    handle.subscribe(),
                ),
            );
        }

        supervisor.add(
            "sweeper",
            run_sweeper(
                ingest_log.clone(),
                args.pending_timeout(),
                ingest_metrics.clone(),
                handle.subscribe(),
            ),
        );

        let consumer = Consumer::new(
            directory.clone(),
            store_log.clone(),
            ConsumerConfig {
                replication_factor: args.replication_factor,
                ..ConsumerConfig::default()
            },
            store_metrics.clone(),
        );
        supervisor.add("consumer", consumer.run(handle.subscribe()));

        let compacter = Compacter::new(
            store_log.clone(),
            CompacterConfig {
                interval: args.compact_interval(),
                retention: args.retention(),
                purge_age: args.purge_age(),
            },
            store_metrics.clone(),
        );
        supervisor.add("compacter", compacter.run(handle.subscribe()));

        supervisor.add(
            "membership",
            directory
                .clone()
                .run(DEFAULT_REFRESH_INTERVAL, handle.subscribe()),
        );

        let http_metrics = Arc::new(ops::HttpMetrics::new(&registry));
        let app = axum::Router::new()
            .nest(
                "/ingest",
                silt_ingest::router(IngestApiState {
                    log: ingest_log.clone(),
                    metrics: ingest_metrics.clone(),
                }),
            )
            .nest(
                "/store",
                silt_store::router(StoreApiState {
                    log: store_log.clone(),
                    metrics: store_metrics.clone(),
                }),
            )
            .merge(ops::router(ops::OpsState {
                registry: registry.clone(),
                identity: identity.clone(),
            }))
            .layer(axum::middleware::from_fn_with_state(
                http_metrics,
                ops::track_requests,
            ));

        let mut api_shutdown = handle.subscribe();
        supervisor.add("http-api", async move {
            axum::serve(api_listener, app)
                .with_graceful_shutdown(async move {
                    let _ = api_shutdown.changed().await;
                })
                .await
        });

        Ok(Node {
            api_addr,
            fast_addr,
            durable_addr,
            bulk_addr,
            identity,
            ingest_log,
            store_log,
            registry,
            supervisor,
        })
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.supervisor.handle()
    }

    /// Run every actor; returns when the first exits and the rest have
    /// stopped.
    pub async fn run(self) -> Result<(), BoxError> {
        info!(api = %self.api_addr, node = %self.identity.id, "node starting");
        self.supervisor.run().await
    }
}
