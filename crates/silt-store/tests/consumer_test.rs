//! Consumer integration: a real ingest API served over HTTP, drained into a
//! real store log by the consumer loop.

use std::sync::Arc;
use std::time::Duration;

use prometheus::Registry;
use silt_cluster::{HttpPeerDirectory, NodeInfo, NodeType};
use silt_core::MemFilesystem;
use silt_ingest::{FlushReason, IngestApiState, IngestLog, IngestMetrics};
use silt_store::{Consumer, ConsumerConfig, StoreLog, StoreMetrics};
use tokio::sync::watch;
use ulid::Ulid;

struct Cluster {
    ingest: Arc<IngestLog>,
    store: Arc<StoreLog>,
    store_metrics: Arc<StoreMetrics>,
    shutdown_tx: watch::Sender<bool>,
}

/// One combined node: ingest API on an ephemeral port, consumer pointed at
/// it through the peer directory.
async fn start_cluster() -> Cluster {
    let fs = Arc::new(MemFilesystem::new());
    let registry = Registry::new();

    let ingest = Arc::new(IngestLog::open(fs.clone(), "/ingest").await.unwrap());
    let ingest_metrics = Arc::new(IngestMetrics::new(&registry));
    let store = Arc::new(
        StoreLog::open(fs.clone(), "/store", 10 * 1024 * 1024)
            .await
            .unwrap(),
    );
    let store_metrics = Arc::new(StoreMetrics::new(&registry));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = format!("http://{}", listener.local_addr().unwrap());
    let app = axum::Router::new().nest(
        "/ingest",
        silt_ingest::router(IngestApiState {
            log: ingest.clone(),
            metrics: ingest_metrics.clone(),
        }),
    );
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let directory = HttpPeerDirectory::new(
        NodeInfo {
            id: "test-node".to_string(),
            node_type: NodeType::IngestStore,
            api_addr: base,
        },
        Vec::new(),
        &registry,
    )
    .unwrap();

    let config = ConsumerConfig {
        backoff_min: Duration::from_millis(10),
        backoff_max: Duration::from_millis(30),
        ..ConsumerConfig::default()
    };
    let consumer = Consumer::new(directory, store.clone(), config, store_metrics.clone());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        consumer.run(shutdown_rx).await.unwrap();
    });

    Cluster {
        ingest,
        store,
        store_metrics,
        shutdown_tx,
    }
}

async fn flush_records(ingest: &IngestLog, ids: &[Ulid]) {
    let mut seg = ingest.create().await.unwrap();
    for (k, id) in ids.iter().enumerate() {
        seg.write(format!("{id} msg-{k}\n").as_bytes()).await.unwrap();
    }
    seg.close(FlushReason::Size).await.unwrap();
}

async fn wait_for<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {what}"));
}

#[tokio::test]
async fn test_consumer_moves_segment_from_ingest_to_store() {
    let cluster = start_cluster().await;
    let t = 1_700_000_000_000u64;
    let ids: Vec<Ulid> = (0..100).map(|k| Ulid::from_parts(t + k, k as u128 + 1)).collect();
    flush_records(&cluster.ingest, &ids).await;

    wait_for("segment in store", || async {
        cluster.store.segments().await.unwrap().len() == 1
    })
    .await;

    // The store segment covers all record ULIDs; the ingest side is empty.
    let seg = &cluster.store.segments().await.unwrap()[0];
    assert_eq!(seg.low, ids[0]);
    assert_eq!(seg.high, ids[99]);
    assert_eq!(cluster.ingest.flushed_count().await.unwrap(), 0);
    assert_eq!(cluster.store_metrics.consumed_segments.get(), 1);

    let records = cluster.store.query(ids[0], ids[99]).await.unwrap();
    assert_eq!(records.len(), 100);

    cluster.shutdown_tx.send(true).unwrap();
}

#[tokio::test]
async fn test_consumer_drains_segments_in_order() {
    let cluster = start_cluster().await;
    let t = 1_700_000_000_000u64;
    let first: Vec<Ulid> = (0..3).map(|k| Ulid::from_parts(t + k, k as u128 + 1)).collect();
    let second: Vec<Ulid> = (0..3)
        .map(|k| Ulid::from_parts(t + 100 + k, k as u128 + 1))
        .collect();
    flush_records(&cluster.ingest, &first).await;
    flush_records(&cluster.ingest, &second).await;

    wait_for("both segments in store", || async {
        cluster.store.segments().await.unwrap().len() == 2
    })
    .await;

    assert_eq!(cluster.ingest.flushed_count().await.unwrap(), 0);
    assert_eq!(cluster.store_metrics.consumed_segments.get(), 2);
    cluster.shutdown_tx.send(true).unwrap();
}

#[tokio::test]
async fn test_malformed_segment_is_handed_back_not_stored() {
    let cluster = start_cluster().await;

    // A segment whose records carry no ULID prefix cannot enter the store.
    let mut seg = cluster.ingest.create().await.unwrap();
    seg.write(b"garbage without a ulid\n").await.unwrap();
    seg.close(FlushReason::Size).await.unwrap();

    // The consumer keeps claiming and failing it; it stays on the ingest
    // side and the store stays empty.
    wait_for("segment handed back", || async {
        cluster.ingest.flushed_count().await.unwrap() == 1
    })
    .await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(cluster.store.segments().await.unwrap().is_empty());

    cluster.shutdown_tx.send(true).unwrap();
}
