//! Gateway stream handler: handshake validation, silent drop, target
//! dial, bidirectional relay.
//!
//! Every accepted stream gets one jittered chance to present a valid
//! first record. A Ping earns a Pong; a Metadata record that passes the
//! replay window, the counter checks, and authenticated decryption earns
//! a TCP dial to its target. *Anything* else - timeout, malformed
//! framing, foreign version, stale timestamp, replayed counter, bad tag -
//! takes the silent-drop path: a jittered pause, a burst of random
//! bytes, and a close. No structured byte is ever returned to a failed
//! handshake, so an active prober cannot distinguish this endpoint from
//! an uncooperative service.

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use aether_core::{
    CoalescePolicy, EventBus, EventKind, Metrics, RecordPolicy, RecordReceiver, RecordSender,
    relay_bidirectional,
};
use aether_crypto::NonceGenerator;
use aether_proto::{ErrorCode, MetadataPayload, Record, RecordKind};
use rand::{Rng, RngCore, rngs::OsRng};
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt},
    net::TcpStream,
    sync::Mutex,
};

/// Handshake read deadline bounds (jittered per stream).
const HANDSHAKE_DEADLINE_MS: (u64, u64) = (4_000, 6_000);

/// Silent-drop delay bounds.
const SILENT_DROP_DELAY_MS: (u64, u64) = (100, 1_000);

/// Silent-drop noise length bounds.
const SILENT_DROP_NOISE: (usize, usize) = (32, 128);

/// Target TCP dial ceiling.
const TARGET_DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Sender session ids tracked against handshake replay.
const HANDSHAKE_GUARD_CAPACITY: usize = 4096;

/// Cross-stream handshake replay watermark.
///
/// The per-stream guard cannot catch a metadata record replayed on a
/// *fresh* stream (its counter state starts at zero), so the gateway
/// additionally requires the metadata counter to strictly advance per
/// observed sender session id. Legitimate clients satisfy this for free:
/// all streams of a session draw from one monotonic counter.
pub struct HandshakeReplayGuard {
    inner: Mutex<GuardMap>,
}

struct GuardMap {
    last: HashMap<[u8; 4], u64>,
    order: VecDeque<[u8; 4]>,
}

impl HandshakeReplayGuard {
    /// Guard with the default capacity.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(GuardMap {
                last: HashMap::new(),
                order: VecDeque::new(),
            }),
        }
    }

    /// `true` if `counter` advances the watermark for `session_id`;
    /// `false` means a replayed or reordered handshake.
    pub async fn check_and_advance(&self, session_id: [u8; 4], counter: u64) -> bool {
        let mut guard = self.inner.lock().await;
        match guard.last.get_mut(&session_id) {
            Some(last) => {
                if counter <= *last {
                    return false;
                }
                *last = counter;
                true
            },
            None => {
                // Bounded: evict the oldest tracked session ids. An
                // evicted id re-admits counter 1, which the 30 s
                // timestamp window still bounds.
                if guard.order.len() >= HANDSHAKE_GUARD_CAPACITY {
                    if let Some(evicted) = guard.order.pop_front() {
                        guard.last.remove(&evicted);
                    }
                }
                guard.last.insert(session_id, counter);
                guard.order.push_back(session_id);
                true
            },
        }
    }
}

impl Default for HandshakeReplayGuard {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared state for all stream handlers of one gateway.
pub struct HandlerContext {
    /// Pre-shared key (trimmed).
    pub psk: String,
    /// Record policy for gateway-outbound records.
    pub record_policy: RecordPolicy,
    /// Shared counters.
    pub metrics: Arc<Metrics>,
    /// Event fan-out.
    pub bus: EventBus,
    /// Cross-stream handshake replay watermark.
    pub handshake_guard: HandshakeReplayGuard,
    next_stream_id: AtomicU64,
}

impl HandlerContext {
    /// Build a context for one gateway instance.
    #[must_use]
    pub fn new(psk: String, record_policy: RecordPolicy, metrics: Arc<Metrics>, bus: EventBus) -> Arc<Self> {
        Arc::new(Self {
            psk,
            record_policy,
            metrics,
            bus,
            handshake_guard: HandshakeReplayGuard::new(),
            next_stream_id: AtomicU64::new(1),
        })
    }
}

/// Drive one accepted stream to completion.
///
/// `outbound_nonce` is the per-session generator shared by all streams
/// of the owning connection; the gateway's outbound session id is
/// independent from the client's.
pub async fn handle_stream<R, W>(
    recv: R,
    send: W,
    outbound_nonce: Arc<NonceGenerator>,
    ctx: Arc<HandlerContext>,
) where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    let mut receiver = RecordReceiver::new(recv, &ctx.psk);

    let deadline = Duration::from_millis(OsRng.gen_range(HANDSHAKE_DEADLINE_MS.0..=HANDSHAKE_DEADLINE_MS.1));
    let record = match tokio::time::timeout(deadline, receiver.next_record()).await {
        Err(_) => {
            tracing::debug!("handshake deadline expired");
            return silent_drop(send).await;
        },
        Ok(Err(e)) => {
            tracing::debug!(error = %e, "handshake framing failure");
            return silent_drop(send).await;
        },
        Ok(Ok(None)) => return, // peer closed before sending anything
        Ok(Ok(Some(record))) => record,
    };

    match record.kind() {
        Some(RecordKind::Ping) => {
            let mut sender =
                RecordSender::new(send, &ctx.psk, outbound_nonce, ctx.record_policy.clone());
            if let Err(e) = sender.send_pong().await {
                tracing::debug!(error = %e, "pong failed");
            }
            let _ = sender.finish().await;
            return;
        },
        Some(RecordKind::Metadata) => {},
        _ => {
            tracing::debug!("first record is not metadata");
            return silent_drop(send).await;
        },
    }

    let metadata = match validate_metadata(&mut receiver, &ctx, &record).await {
        Ok(metadata) => metadata,
        Err(reason) => {
            tracing::debug!(reason, "handshake rejected");
            return silent_drop(send).await;
        },
    };

    // The client may announce its own padding ceiling for this stream.
    let mut policy = ctx.record_policy.clone();
    if let Some(max_padding) = metadata.max_padding {
        policy.max_padding = max_padding;
    }
    let mut sender = RecordSender::new(send, &ctx.psk, outbound_nonce, policy.clone());

    let host = metadata.target.host();
    let port = metadata.port;

    let tcp = match tokio::time::timeout(
        TARGET_DIAL_TIMEOUT,
        TcpStream::connect((host.as_str(), port)),
    )
    .await
    {
        Err(_) => {
            tracing::debug!(host, port, "target dial timed out");
            let _ = sender.send_error(ErrorCode::TargetConnect, "dial timed out").await;
            let _ = sender.finish().await;
            return;
        },
        Ok(Err(e)) => {
            tracing::debug!(host, port, error = %e, "target dial failed");
            let _ = sender.send_error(ErrorCode::TargetConnect, &e.to_string()).await;
            let _ = sender.finish().await;
            return;
        },
        Ok(Ok(tcp)) => tcp,
    };

    let stream_id = ctx.next_stream_id.fetch_add(1, Ordering::Relaxed);
    let target = format!("{host}:{port}");
    ctx.metrics.stream_opened();
    ctx.bus.publish(EventKind::StreamOpened { stream_id, target: target.clone() });

    let (tcp_read, tcp_write) = tcp.into_split();
    let outcome = relay_bidirectional(
        tcp_read,
        tcp_write,
        sender,
        receiver,
        CoalescePolicy::new(policy.max_record_payload),
        Arc::clone(&ctx.metrics),
        None,
    )
    .await;

    ctx.metrics.stream_closed();
    if let Some(error) = &outcome.error {
        tracing::debug!(stream_id, target, %error, "stream failed");
        ctx.bus.publish(EventKind::StreamError {
            stream_id,
            code: error.code_str().to_string(),
        });
    }
    ctx.bus.publish(EventKind::StreamClosed {
        stream_id,
        bytes_sent: outcome.bytes_up,
        bytes_received: outcome.bytes_down,
    });
}

/// Replay checks, authenticated decryption, payload parsing, and the
/// cross-stream watermark, in that order.
async fn validate_metadata<R: AsyncRead + Unpin>(
    receiver: &mut RecordReceiver<R>,
    ctx: &HandlerContext,
    record: &Record,
) -> Result<MetadataPayload, &'static str> {
    let plaintext = receiver.open_sealed(record).map_err(|_| "window, counter, or tag")?;
    let metadata = MetadataPayload::decode(&plaintext).map_err(|_| "malformed metadata")?;

    let session_id = record.header.session_id();
    let counter = record.header.counter();
    if !ctx.handshake_guard.check_and_advance(session_id, counter).await {
        return Err("handshake replay across streams");
    }

    Ok(metadata)
}

/// The only reply a failed handshake ever gets: a jittered pause, then
/// 32-128 random bytes, then close.
async fn silent_drop<W: AsyncWrite + Unpin>(mut send: W) {
    let delay = OsRng.gen_range(SILENT_DROP_DELAY_MS.0..=SILENT_DROP_DELAY_MS.1);
    tokio::time::sleep(Duration::from_millis(delay)).await;

    let len = OsRng.gen_range(SILENT_DROP_NOISE.0..=SILENT_DROP_NOISE.1);
    let mut noise = vec![0u8; len];
    OsRng.fill_bytes(&mut noise);

    let _ = send.write_all(&noise).await;
    let _ = send.flush().await;
    let _ = send.shutdown().await;
}

#[cfg(test)]
mod tests {
    use aether_crypto::{TAG_SIZE, derive_record_key, nonce_for, seal};
    use aether_proto::RecordHeader;
    use bytes::Bytes;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};

    use super::*;

    const PSK: &str = "correct horse battery staple";

    fn test_ctx() -> Arc<HandlerContext> {
        HandlerContext::new(
            PSK.to_string(),
            RecordPolicy::default(),
            Metrics::new(),
            EventBus::new(),
        )
    }

    /// Spawn a handler over a duplex pipe; returns the client's halves.
    fn spawn_handler(
        ctx: Arc<HandlerContext>,
    ) -> (WriteHalf<DuplexStream>, ReadHalf<DuplexStream>) {
        let (client, server) = tokio::io::duplex(256 * 1024);
        let (client_read, client_write) = tokio::io::split(client);
        let (server_read, server_write) = tokio::io::split(server);

        let nonce = Arc::new(NonceGenerator::new([0xA0, 0xA1, 0xA2, 0xA3]));
        tokio::spawn(handle_stream(server_read, server_write, nonce, ctx));
        (client_write, client_read)
    }

    /// Encode a sealed metadata record the way a client would.
    async fn metadata_wire(psk: &str, host: &str, port: u16) -> Vec<u8> {
        let mut sender = RecordSender::new(
            Vec::new(),
            psk,
            Arc::new(NonceGenerator::new([0x11, 0x22, 0x33, 0x44])),
            RecordPolicy::default(),
        );
        let metadata = MetadataPayload::for_host(host, port).unwrap();
        sender.send_metadata(&metadata).await.unwrap();
        sender.into_inner()
    }

    async fn read_to_eof(read: &mut ReadHalf<DuplexStream>) -> Vec<u8> {
        let mut collected = Vec::new();
        read.read_to_end(&mut collected).await.unwrap();
        collected
    }

    fn assert_is_noise(bytes: &[u8]) {
        assert!(
            (SILENT_DROP_NOISE.0..=SILENT_DROP_NOISE.1).contains(&bytes.len()),
            "noise length {} outside [32, 128]",
            bytes.len()
        );
    }

    #[tokio::test]
    async fn ping_earns_pong() {
        let (mut to_gw, from_gw) = spawn_handler(test_ctx());

        let mut sender = RecordSender::new(
            Vec::new(),
            PSK,
            Arc::new(NonceGenerator::new([1, 2, 3, 4])),
            RecordPolicy::default(),
        );
        sender.send_ping().await.unwrap();
        to_gw.write_all(&sender.into_inner()).await.unwrap();
        to_gw.shutdown().await.unwrap();

        let mut receiver = RecordReceiver::new(from_gw, PSK);
        let record = receiver.next_record().await.unwrap().unwrap();
        assert_eq!(record.kind(), Some(RecordKind::Pong));
        assert!(receiver.next_record().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn valid_handshake_dials_and_pipes() {
        // Target: a real TCP echo server.
        let target = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target_port = target.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut conn, _) = target.accept().await.unwrap();
            let mut buf = Vec::new();
            conn.read_to_end(&mut buf).await.unwrap();
            conn.write_all(&buf.to_ascii_uppercase()).await.unwrap();
        });

        let ctx = test_ctx();
        let (mut to_gw, from_gw) = spawn_handler(Arc::clone(&ctx));

        // Client side of the tunnel stream.
        let client_nonce = Arc::new(NonceGenerator::new([5, 6, 7, 8]));
        let mut sender =
            RecordSender::new(Vec::new(), PSK, Arc::clone(&client_nonce), RecordPolicy::default());
        sender
            .send_metadata(&MetadataPayload::for_host("127.0.0.1", target_port).unwrap())
            .await
            .unwrap();
        sender.write_all_data(b"hello target").await.unwrap();
        to_gw.write_all(&sender.into_inner()).await.unwrap();
        to_gw.shutdown().await.unwrap();

        let mut receiver = RecordReceiver::new(from_gw, PSK);
        let mut response = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            let n = receiver.read_data(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            response.extend_from_slice(&buf[..n]);
        }
        assert_eq!(response, b"HELLO TARGET");
        assert_eq!(ctx.metrics.snapshot().total_streams, 1);
    }

    #[tokio::test]
    async fn wrong_psk_gets_silent_drop() {
        let (mut to_gw, mut from_gw) = spawn_handler(test_ctx());

        let wire = metadata_wire("a different psk", "example.com", 80).await;
        to_gw.write_all(&wire).await.unwrap();
        to_gw.shutdown().await.unwrap();

        assert_is_noise(&read_to_eof(&mut from_gw).await);
    }

    #[tokio::test]
    async fn data_first_record_gets_silent_drop() {
        let (mut to_gw, mut from_gw) = spawn_handler(test_ctx());

        let mut sender = RecordSender::new(
            Vec::new(),
            PSK,
            Arc::new(NonceGenerator::new([1, 1, 2, 2])),
            RecordPolicy::default(),
        );
        sender.write_all_data(b"no handshake").await.unwrap();
        to_gw.write_all(&sender.into_inner()).await.unwrap();
        to_gw.shutdown().await.unwrap();

        assert_is_noise(&read_to_eof(&mut from_gw).await);
    }

    #[tokio::test]
    async fn garbage_framing_gets_silent_drop() {
        let (mut to_gw, mut from_gw) = spawn_handler(test_ctx());

        // A length prefix far above the record ceiling.
        to_gw.write_all(&[0xFF; 64]).await.unwrap();
        to_gw.shutdown().await.unwrap();

        assert_is_noise(&read_to_eof(&mut from_gw).await);
    }

    #[tokio::test]
    async fn replay_on_fresh_stream_gets_silent_drop() {
        let ctx = test_ctx();

        // Target so the first (legitimate) handshake proceeds.
        let target = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target_port = target.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                let Ok((conn, _)) = target.accept().await else { break };
                drop(conn);
            }
        });

        let wire = metadata_wire(PSK, "127.0.0.1", target_port).await;

        // Original stream.
        let (mut first_tx, mut first_rx) = spawn_handler(Arc::clone(&ctx));
        first_tx.write_all(&wire).await.unwrap();
        first_tx.shutdown().await.unwrap();
        let _ = read_to_eof(&mut first_rx).await;

        // Identical bytes replayed on a fresh stream moments later.
        let (mut replay_tx, mut replay_rx) = spawn_handler(Arc::clone(&ctx));
        replay_tx.write_all(&wire).await.unwrap();
        replay_tx.shutdown().await.unwrap();

        assert_is_noise(&read_to_eof(&mut replay_rx).await);
    }

    #[tokio::test]
    async fn stale_timestamp_gets_silent_drop() {
        let (mut to_gw, mut from_gw) = spawn_handler(test_ctx());

        // Hand-craft a metadata record 60 s in the past.
        let session_id = [0x77; 4];
        let key = derive_record_key(PSK, session_id);
        let plaintext = MetadataPayload::for_host("example.com", 80).unwrap().encode().unwrap();

        let mut header = RecordHeader::new(RecordKind::Metadata);
        header.set_timestamp_ns(aether_core::time::unix_now_ns() - 60_000_000_000);
        header.set_session_id(session_id);
        header.set_counter(1);
        header.set_payload_length((plaintext.len() + TAG_SIZE) as u32);
        header.set_padding_length(0);

        let ciphertext = seal(&key, &nonce_for(session_id, 1), &header.to_bytes(), &plaintext);
        let record = Record::new(header, ciphertext, Bytes::new()).unwrap();
        let mut wire = Vec::new();
        record.encode(&mut wire).unwrap();

        to_gw.write_all(&wire).await.unwrap();
        to_gw.shutdown().await.unwrap();

        assert_is_noise(&read_to_eof(&mut from_gw).await);
    }

    #[tokio::test(start_paused = true)]
    async fn handshake_timeout_gets_silent_drop() {
        let (_to_gw, mut from_gw) = spawn_handler(test_ctx());

        // Send nothing; the deadline (4-6 s) expires under virtual time.
        assert_is_noise(&read_to_eof(&mut from_gw).await);
    }

    #[tokio::test]
    async fn unreachable_target_gets_error_record() {
        let (mut to_gw, from_gw) = spawn_handler(test_ctx());

        // A port that nothing listens on.
        let unused = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = unused.local_addr().unwrap().port();
        drop(unused);

        let wire = metadata_wire(PSK, "127.0.0.1", port).await;
        to_gw.write_all(&wire).await.unwrap();
        to_gw.shutdown().await.unwrap();

        let mut receiver = RecordReceiver::new(from_gw, PSK);
        let mut buf = [0u8; 64];
        let err = receiver.read_data(&mut buf).await.unwrap_err();
        assert!(matches!(
            err,
            aether_core::CoreError::Peer { code: ErrorCode::TargetConnect, .. }
        ));
    }

    #[tokio::test]
    async fn handshake_guard_tracks_per_session_watermarks() {
        let guard = HandshakeReplayGuard::new();
        assert!(guard.check_and_advance([1; 4], 1).await);
        assert!(guard.check_and_advance([1; 4], 5).await);
        assert!(!guard.check_and_advance([1; 4], 5).await);
        assert!(!guard.check_and_advance([1; 4], 3).await);
        // Independent session ids do not interfere.
        assert!(guard.check_and_advance([2; 4], 1).await);
    }
}
