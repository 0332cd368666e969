//! Connection Writers
//!
//! One actor per accepted TCP connection, all sharing the same state machine
//! over the active segment:
//!
//! - **Idle**: no active segment. The first incoming record allocates one.
//! - **Writing**: records accumulate. A size trigger (bytes written reaching
//!   the flush size) or an age trigger (segment older than the flush age)
//!   rotates the segment: it is closed, which renames it to `.flushed`, and
//!   the connection returns to Idle.
//! - **Closing**: connection loss or shutdown. A live segment is flushed
//!   with reason `close`, then the actor terminates.
//!
//! The three modalities differ only in durability timing:
//!
//! - **Fast**: buffered, fsync at rotation, no per-record response.
//! - **Durable**: fsync after every record, then `OK\n` or `ERR <msg>\n`
//!   back to the producer. A per-record error does not kill the connection.
//! - **Bulk**: a whole pre-formed segment to EOF, validated for framing and
//!   ULID prefixes, flushed once, answered once with `OK <n>\n`.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::warn;

use silt_core::record;

use crate::error::Result;
use crate::log::{ActiveSegment, FlushReason, IngestLog};
use crate::metrics::IngestMetrics;

/// The per-connection durability contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Modality {
    Fast,
    Durable,
    Bulk,
}

impl Modality {
    pub fn as_str(self) -> &'static str {
        match self {
            Modality::Fast => "fast",
            Modality::Durable => "durable",
            Modality::Bulk => "bulk",
        }
    }
}

/// Rotation triggers shared by every connection.
#[derive(Debug, Clone, Copy)]
pub struct WriterConfig {
    pub flush_size: u64,
    pub flush_age: Duration,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            flush_size: 25 * 1024 * 1024,
            flush_age: Duration::from_secs(3),
        }
    }
}

/// Serve one producer connection until EOF, a fatal error, or shutdown.
pub async fn handle_connection(
    stream: TcpStream,
    modality: Modality,
    log: Arc<IngestLog>,
    config: WriterConfig,
    metrics: Arc<IngestMetrics>,
    shutdown: watch::Receiver<bool>,
) -> Result<()> {
    match modality {
        Modality::Fast => stream_writer(stream, false, log, config, metrics, shutdown).await,
        Modality::Durable => stream_writer(stream, true, log, config, metrics, shutdown).await,
        Modality::Bulk => bulk_writer(stream, log, metrics, shutdown).await,
    }
}

/// Fast and durable share this loop; `durable` adds the fsync and the
/// per-record response.
async fn stream_writer(
    stream: TcpStream,
    durable: bool,
    log: Arc<IngestLog>,
    config: WriterConfig,
    metrics: Arc<IngestMetrics>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut line: Vec<u8> = Vec::new();
    let mut active: Option<ActiveSegment> = None;

    loop {
        let age_deadline = active.as_ref().map(|seg| seg.created() + config.flush_age);
        tokio::select! {
            read = reader.read_until(b'\n', &mut line) => {
                let n = read.map_err(silt_core::Error::from)?;
                if n == 0 && line.is_empty() {
                    break;
                }
                if line.last() != Some(&b'\n') {
                    line.push(b'\n');
                }

                if active.is_none() {
                    active = Some(log.create().await?);
                }
                let seg = active.as_mut().expect("active segment just ensured");
                match write_record(seg, &line, durable, &metrics).await {
                    Ok(()) => {
                        if durable {
                            respond(&mut write_half, b"OK\n").await?;
                        }
                    }
                    Err(err) if durable => {
                        // Reported inline; the connection continues.
                        warn!(error = %err, "durable record write failed");
                        let msg = format!("ERR {err}\n");
                        respond(&mut write_half, msg.as_bytes()).await?;
                    }
                    Err(err) => return Err(err),
                }
                line.clear();

                if seg_full(&active, config.flush_size) {
                    rotate(&mut active, FlushReason::Size, &metrics).await?;
                }
                if n == 0 {
                    break;
                }
            }
            _ = sleep_until_deadline(age_deadline), if age_deadline.is_some() => {
                rotate(&mut active, FlushReason::Age, &metrics).await?;
            }
            _ = shutdown.changed() => break,
        }
    }

    if active.is_some() {
        rotate(&mut active, FlushReason::Close, &metrics).await?;
    }
    Ok(())
}

/// Whole-segment upload. The body is validated record by record; a bad
/// record discards the partial segment and the producer gets one error.
async fn bulk_writer(
    stream: TcpStream,
    log: Arc<IngestLog>,
    metrics: Arc<IngestMetrics>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut line: Vec<u8> = Vec::new();
    let mut active: Option<ActiveSegment> = None;

    let outcome: Result<u64> = loop {
        tokio::select! {
            read = reader.read_until(b'\n', &mut line) => {
                let n = read.map_err(silt_core::Error::from)?;
                if n == 0 && line.is_empty() {
                    break Ok(active.as_ref().map_or(0, |seg| seg.records()));
                }
                if line.last() != Some(&b'\n') {
                    line.push(b'\n');
                }
                if let Err(err) = record::record_ulid(&line) {
                    break Err(err.into());
                }

                if active.is_none() {
                    active = Some(log.create().await?);
                }
                let seg = active.as_mut().expect("active segment just ensured");
                if let Err(err) = seg.write(&line).await {
                    break Err(err.into());
                }
                metrics.writer_bytes.inc_by(line.len() as u64);
                metrics.writer_records.inc();
                line.clear();

                if n == 0 {
                    break Ok(seg.records());
                }
            }
            _ = shutdown.changed() => {
                // No producer to answer once we are stopping; drop the
                // partial upload so it is not half-committed.
                if let Some(seg) = active.take() {
                    seg.discard().await?;
                }
                return Ok(());
            }
        }
    };

    match outcome {
        Ok(count) => {
            if active.is_some() {
                rotate(&mut active, FlushReason::Close, &metrics).await?;
            }
            let msg = format!("OK {count}\n");
            respond(&mut write_half, msg.as_bytes()).await?;
            Ok(())
        }
        Err(err) => {
            if let Some(seg) = active.take() {
                seg.discard().await?;
            }
            warn!(error = %err, "bulk upload rejected");
            let msg = format!("ERR {err}\n");
            respond(&mut write_half, msg.as_bytes()).await?;
            Ok(())
        }
    }
}

async fn write_record(
    seg: &mut ActiveSegment,
    line: &[u8],
    durable: bool,
    metrics: &IngestMetrics,
) -> Result<()> {
    seg.write(line).await?;
    metrics.writer_bytes.inc_by(line.len() as u64);
    metrics.writer_records.inc();
    if durable {
        seg.sync().await?;
        metrics.writer_syncs.inc();
    }
    Ok(())
}

fn seg_full(active: &Option<ActiveSegment>, flush_size: u64) -> bool {
    active.as_ref().is_some_and(|seg| seg.bytes() >= flush_size)
}

/// Close the active segment and record the flush. The flush failure policy
/// is to surface the error, which terminates the connection; the partial
/// `.active` file is left for the startup sweep.
async fn rotate(
    active: &mut Option<ActiveSegment>,
    reason: FlushReason,
    metrics: &IngestMetrics,
) -> Result<()> {
    let Some(seg) = active.take() else {
        return Ok(());
    };
    if let Some(flushed) = seg.close(reason).await? {
        metrics
            .writer_flushes
            .with_label_values(&[reason.as_str()])
            .inc();
        metrics.segment_flush_age.observe(flushed.age.as_secs_f64());
        metrics.segment_flush_size.observe(flushed.bytes as f64);
    }
    Ok(())
}

async fn sleep_until_deadline(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

async fn respond(write_half: &mut OwnedWriteHalf, msg: &[u8]) -> Result<()> {
    write_half
        .write_all(msg)
        .await
        .map_err(silt_core::Error::from)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use prometheus::Registry;
    use silt_core::MemFilesystem;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;
    use ulid::Ulid;

    struct Harness {
        log: Arc<IngestLog>,
        metrics: Arc<IngestMetrics>,
        addr: std::net::SocketAddr,
        shutdown_tx: watch::Sender<bool>,
    }

    async fn start(modality: Modality, config: WriterConfig) -> Harness {
        let fs = Arc::new(MemFilesystem::new());
        let log = Arc::new(IngestLog::open(fs, "/ingest").await.unwrap());
        let metrics = Arc::new(IngestMetrics::new(&Registry::new()));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let (accept_log, accept_metrics) = (log.clone(), metrics.clone());
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let (log, metrics, shutdown) =
                    (accept_log.clone(), accept_metrics.clone(), shutdown_rx.clone());
                tokio::spawn(async move {
                    let _ = handle_connection(stream, modality, log, config, metrics, shutdown)
                        .await;
                });
            }
        });

        Harness {
            log,
            metrics,
            addr,
            shutdown_tx,
        }
    }

    fn rec(payload: &str) -> String {
        format!("{} {payload}\n", Ulid::new())
    }

    #[tokio::test]
    async fn test_fast_flushes_on_close() {
        let h = start(Modality::Fast, WriterConfig::default()).await;
        let mut conn = TcpStream::connect(h.addr).await.unwrap();
        for k in 0..5 {
            conn.write_all(rec(&format!("msg-{k}")).as_bytes())
                .await
                .unwrap();
        }
        drop(conn);

        tokio::time::timeout(Duration::from_secs(2), async {
            while h.log.flushed_count().await.unwrap() == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("segment flushed after close");
        assert_eq!(h.metrics.writer_records.get(), 5);
        assert_eq!(
            h.metrics.writer_flushes.with_label_values(&["close"]).get(),
            1
        );
        h.shutdown_tx.send(true).unwrap();
    }

    #[tokio::test]
    async fn test_fast_rotates_on_size() {
        let config = WriterConfig {
            flush_size: 64,
            flush_age: Duration::from_secs(60),
        };
        let h = start(Modality::Fast, config).await;
        let mut conn = TcpStream::connect(h.addr).await.unwrap();
        // Two records of ~40 bytes push past the 64 byte trigger.
        conn.write_all(rec("aaaaaaaaaaaa").as_bytes()).await.unwrap();
        conn.write_all(rec("bbbbbbbbbbbb").as_bytes()).await.unwrap();
        conn.flush().await.unwrap();

        tokio::time::timeout(Duration::from_secs(2), async {
            while h.metrics.writer_flushes.with_label_values(&["size"]).get() == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("size rotation observed");
        assert_eq!(h.log.flushed_count().await.unwrap(), 1);
        h.shutdown_tx.send(true).unwrap();
    }

    #[tokio::test]
    async fn test_durable_acks_each_record_and_rotates_on_age() {
        let config = WriterConfig {
            flush_size: 25 * 1024 * 1024,
            flush_age: Duration::from_millis(150),
        };
        let h = start(Modality::Durable, config).await;
        let mut conn = TcpStream::connect(h.addr).await.unwrap();

        for k in 0..3 {
            conn.write_all(rec(&format!("msg-{k}")).as_bytes())
                .await
                .unwrap();
            let mut buf = [0u8; 3];
            conn.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"OK\n");
        }
        assert_eq!(h.metrics.writer_syncs.get(), 3);

        // Idle past the flush age: exactly one age rotation.
        tokio::time::timeout(Duration::from_secs(2), async {
            while h.metrics.writer_flushes.with_label_values(&["age"]).get() == 0 {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("age rotation observed");
        assert_eq!(
            h.metrics.writer_flushes.with_label_values(&["age"]).get(),
            1
        );
        assert_eq!(h.log.flushed_count().await.unwrap(), 1);
        h.shutdown_tx.send(true).unwrap();
    }

    #[tokio::test]
    async fn test_bulk_acks_once_with_count() {
        let h = start(Modality::Bulk, WriterConfig::default()).await;
        let mut conn = TcpStream::connect(h.addr).await.unwrap();
        let body = format!("{}{}{}", rec("one"), rec("two"), rec("three"));
        conn.write_all(body.as_bytes()).await.unwrap();
        conn.shutdown().await.unwrap();

        let mut response = String::new();
        let mut reader = BufReader::new(conn);
        reader.read_line(&mut response).await.unwrap();
        assert_eq!(response, "OK 3\n");
        assert_eq!(h.log.flushed_count().await.unwrap(), 1);
        h.shutdown_tx.send(true).unwrap();
    }

    #[tokio::test]
    async fn test_bulk_rejects_record_without_ulid() {
        let h = start(Modality::Bulk, WriterConfig::default()).await;
        let mut conn = TcpStream::connect(h.addr).await.unwrap();
        let body = format!("{}no ulid prefix here\n", rec("good"));
        conn.write_all(body.as_bytes()).await.unwrap();
        conn.shutdown().await.unwrap();

        let mut response = String::new();
        let mut reader = BufReader::new(conn);
        reader.read_line(&mut response).await.unwrap();
        assert!(response.starts_with("ERR "), "got {response:?}");
        // The partial segment was discarded, nothing flushed.
        assert_eq!(h.log.flushed_count().await.unwrap(), 0);
        h.shutdown_tx.send(true).unwrap();
    }

    #[tokio::test]
    async fn test_empty_connection_flushes_nothing() {
        let h = start(Modality::Fast, WriterConfig::default()).await;
        let conn = TcpStream::connect(h.addr).await.unwrap();
        drop(conn);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(h.log.flushed_count().await.unwrap(), 0);
        assert_eq!(h.metrics.writer_records.get(), 0);
        h.shutdown_tx.send(true).unwrap();
    }
}
