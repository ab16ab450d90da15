//! Bidirectional TCP ⇄ record-stream relay.
//!
//! Both endpoints run the same loop: the upstream direction reads raw
//! bytes from the local/target TCP side, coalesces them under the
//! adaptive policy, and emits Data records; the downstream direction
//! unwraps Data records and writes raw bytes back. The two directions run
//! concurrently and each propagates its own EOF: local EOF finishes the
//! record stream so the peer sees a clean end, record EOF shuts down the
//! local write half.

use std::{sync::Arc, time::Duration};

use bytes::BytesMut;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    sync::mpsc,
    time::Instant,
};

use crate::{
    coalesce::CoalescePolicy,
    error::CoreError,
    metrics::Metrics,
    pump::{RecordReceiver, RecordSender},
};

/// Read chunk size for the raw TCP side.
const TCP_READ_CHUNK: usize = 64 * 1024;

/// One latency sample captured per record flush when diagnostics are on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PerfSample {
    /// Unix millis at flush time.
    pub at_ms: u64,
    /// Record-write latency in microseconds.
    pub latency_us: u64,
    /// Plaintext bytes in the flushed batch.
    pub batch_bytes: usize,
}

/// Optional sink for [`PerfSample`]s (the `perf_capture_*` toggles).
pub type PerfSink = mpsc::UnboundedSender<PerfSample>;

/// What a finished relay looked like.
#[derive(Debug)]
pub struct RelayOutcome {
    /// Plaintext bytes moved local → records.
    pub bytes_up: u64,
    /// Plaintext bytes moved records → local.
    pub bytes_down: u64,
    /// First failure observed, if the relay did not end with clean EOFs.
    pub error: Option<CoreError>,
}

/// Pump both directions until EOF or failure on each.
///
/// Metrics are updated incrementally so a torn-down stream still
/// accounts for the bytes it moved.
pub async fn relay_bidirectional<LR, LW, RR, RW>(
    mut local_read: LR,
    mut local_write: LW,
    mut sender: RecordSender<RW>,
    mut receiver: RecordReceiver<RR>,
    mut policy: CoalescePolicy,
    metrics: Arc<Metrics>,
    perf: Option<PerfSink>,
) -> RelayOutcome
where
    LR: AsyncRead + Unpin,
    LW: AsyncWrite + Unpin,
    RR: AsyncRead + Unpin,
    RW: AsyncWrite + Unpin,
{
    let up_metrics = Arc::clone(&metrics);
    let up = pump_upstream(&mut local_read, &mut sender, &mut policy, &up_metrics, perf);
    let down = pump_downstream(&mut receiver, &mut local_write, &metrics);

    let (up_result, down_result) = tokio::join!(up, down);

    let (bytes_up, up_error) = split(up_result);
    let (bytes_down, down_error) = split(down_result);

    RelayOutcome { bytes_up, bytes_down, error: up_error.or(down_error) }
}

fn split(result: Result<u64, (u64, CoreError)>) -> (u64, Option<CoreError>) {
    match result {
        Ok(bytes) => (bytes, None),
        Err((bytes, error)) => (bytes, Some(error)),
    }
}

/// Local bytes → coalesced Data records.
async fn pump_upstream<LR, RW>(
    local_read: &mut LR,
    sender: &mut RecordSender<RW>,
    policy: &mut CoalescePolicy,
    metrics: &Arc<Metrics>,
    perf: Option<PerfSink>,
) -> Result<u64, (u64, CoreError)>
where
    LR: AsyncRead + Unpin,
    RW: AsyncWrite + Unpin,
{
    let mut total: u64 = 0;
    let mut chunk = vec![0u8; TCP_READ_CHUNK];
    let mut batch = BytesMut::with_capacity(policy.flush_threshold());

    'outer: loop {
        // Block for the first bytes of a batch.
        let n = local_read.read(&mut chunk).await.map_err(|e| (total, e.into()))?;
        if n == 0 {
            break;
        }
        batch.extend_from_slice(&chunk[..n]);

        // Top up until the threshold fills or the wait expires.
        let mut local_eof = false;
        let deadline = Instant::now() + policy.coalesce_wait();
        while batch.len() < policy.flush_threshold() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining == Duration::ZERO {
                break;
            }
            match tokio::time::timeout(remaining, local_read.read(&mut chunk)).await {
                Ok(Ok(0)) => {
                    local_eof = true;
                    break;
                },
                Ok(Ok(n)) => batch.extend_from_slice(&chunk[..n]),
                Ok(Err(e)) => return Err((total, e.into())),
                Err(_) => break,
            }
        }

        let full_batch = batch.len() >= policy.flush_threshold();
        let started = Instant::now();
        sender.write_all_data(&batch).await.map_err(|e| (total, e))?;
        let latency = started.elapsed();

        policy.observe(latency, full_batch);
        metrics.set_last_latency(latency);
        metrics.add_bytes_sent(batch.len() as u64);
        total += batch.len() as u64;

        if let Some(sink) = &perf {
            let _ = sink.send(PerfSample {
                at_ms: crate::time::unix_now_ms(),
                latency_us: latency.as_micros() as u64,
                batch_bytes: batch.len(),
            });
        }

        batch.clear();
        if local_eof {
            break 'outer;
        }
    }

    // Propagate EOF so the peer's downstream pump terminates cleanly.
    let _ = sender.finish().await;
    Ok(total)
}

/// Data records → local bytes.
async fn pump_downstream<RR, LW>(
    receiver: &mut RecordReceiver<RR>,
    local_write: &mut LW,
    metrics: &Arc<Metrics>,
) -> Result<u64, (u64, CoreError)>
where
    RR: AsyncRead + Unpin,
    LW: AsyncWrite + Unpin,
{
    let mut total: u64 = 0;
    let mut buf = vec![0u8; TCP_READ_CHUNK];

    loop {
        let n = receiver.read_data(&mut buf).await.map_err(|e| (total, e))?;
        if n == 0 {
            break;
        }
        local_write.write_all(&buf[..n]).await.map_err(|e| (total, e.into()))?;
        metrics.add_bytes_received(n as u64);
        total += n as u64;
    }

    let _ = local_write.shutdown().await;
    Ok(total)
}
