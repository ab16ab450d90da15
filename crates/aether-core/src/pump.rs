//! Record pump: adapts a framed record stream to a byte stream.
//!
//! [`RecordSender`] owns the write half of a tunnel stream: it seals
//! plaintext into Metadata/Data records (fresh nonce per record, padding
//! drawn from the configured distribution) and emits unencrypted
//! Ping/Pong/Error records. [`RecordReceiver`] owns the read half: it
//! reframes, validates the anti-replay invariants, opens sealed payloads,
//! surfaces Error records as failures, and silently consumes Ping/Pong.
//!
//! One sender and one receiver per stream direction; records within a
//! direction are serialized by that single owner, so there is no
//! cross-record interleaving to defend against.

use std::sync::Arc;

use aether_crypto::{
    NonceGenerator, RecordKey, ReplayGuard, TAG_SIZE, derive_record_key, nonce_for,
};
use aether_proto::{
    ErrorCode, ErrorPayload, MAX_RECORD_TOTAL, MetadataPayload, Record, RecordHeader, RecordKind,
};
use bytes::{Bytes, BytesMut};
use rand::{Rng, RngCore, rngs::OsRng};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

use crate::{
    error::{CoreError, Result},
    time::unix_now_ns,
};

/// Buffered-reader capacity; large enough to coalesce an entire maximum
/// record into one syscall's worth of reads.
pub const READER_BUFFER: usize = MAX_RECORD_TOTAL;

/// Smallest allowed plaintext cap per Data record.
pub const MIN_RECORD_PAYLOAD: usize = 4 * 1024;

/// Largest allowed plaintext cap per Data record.
pub const MAX_RECORD_PAYLOAD: usize = 64 * 1024;

/// Default plaintext cap per Data record.
pub const DEFAULT_RECORD_PAYLOAD: usize = 16 * 1024;

/// Padding ceiling applied to data records regardless of configuration.
const DATA_PADDING_CAP: u16 = 32;

/// Metadata records pad in `[16, 256]` to blur the handshake size.
const METADATA_PADDING_RANGE: (usize, usize) = (16, 256);

/// Knobs governing what a sender puts on the wire.
#[derive(Debug, Clone)]
pub struct RecordPolicy {
    /// Upper bound on data-record padding; 0 disables padding entirely.
    pub max_padding: u16,
    /// Plaintext cap per Data record, clamped to
    /// `[MIN_RECORD_PAYLOAD, MAX_RECORD_PAYLOAD]`.
    pub max_record_payload: usize,
}

impl RecordPolicy {
    /// Policy with explicit knobs (payload cap clamped into range).
    #[must_use]
    pub fn new(max_padding: u16, max_record_payload: usize) -> Self {
        Self {
            max_padding,
            max_record_payload: max_record_payload.clamp(MIN_RECORD_PAYLOAD, MAX_RECORD_PAYLOAD),
        }
    }
}

impl Default for RecordPolicy {
    fn default() -> Self {
        Self { max_padding: 64, max_record_payload: DEFAULT_RECORD_PAYLOAD }
    }
}

/// Draw `len` random padding bytes.
fn draw_padding(len: usize) -> Bytes {
    if len == 0 {
        return Bytes::new();
    }
    let mut padding = vec![0u8; len];
    OsRng.fill_bytes(&mut padding);
    Bytes::from(padding)
}

/// Padding length for a data record: uniform in
/// `[1, min(max_padding, 32)]`, or 0 when padding is disabled.
fn data_padding_len(max_padding: u16) -> usize {
    if max_padding == 0 {
        return 0;
    }
    let ceiling = usize::from(max_padding.min(DATA_PADDING_CAP));
    OsRng.gen_range(1..=ceiling)
}

/// Padding length for a metadata record: uniform in `[16, 256]`, or 0
/// when padding is disabled.
fn metadata_padding_len(max_padding: u16) -> usize {
    if max_padding == 0 {
        return 0;
    }
    OsRng.gen_range(METADATA_PADDING_RANGE.0..=METADATA_PADDING_RANGE.1)
}

/// Write half of a tunnel stream.
pub struct RecordSender<W> {
    writer: W,
    key: RecordKey,
    nonce: Arc<NonceGenerator>,
    policy: RecordPolicy,
}

impl<W> std::fmt::Debug for RecordSender<W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordSender")
            .field("session_id", &self.nonce.session_id())
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl<W: AsyncWrite + Unpin> RecordSender<W> {
    /// Sender sealing under the key derived from `psk` and the
    /// generator's session id. The generator is shared across all streams
    /// of a session so counters stay globally unique per direction.
    #[must_use]
    pub fn new(writer: W, psk: &str, nonce: Arc<NonceGenerator>, policy: RecordPolicy) -> Self {
        let key = derive_record_key(psk, nonce.session_id());
        Self { writer, key, nonce, policy }
    }

    /// Session id stamped into every sealed record.
    #[must_use]
    pub fn session_id(&self) -> [u8; 4] {
        self.nonce.session_id()
    }

    /// Seal and send one Metadata record (the stream handshake).
    pub async fn send_metadata(&mut self, payload: &MetadataPayload) -> Result<()> {
        let plaintext = payload.encode()?;
        let padding = metadata_padding_len(self.policy.max_padding);
        self.send_sealed(RecordKind::Metadata, &plaintext, padding).await
    }

    /// Seal and send one Data record. `chunk` must not exceed the policy's
    /// payload cap; [`RecordSender::write_all_data`] handles splitting.
    pub async fn send_data(&mut self, chunk: &[u8]) -> Result<()> {
        debug_assert!(chunk.len() <= self.policy.max_record_payload);
        let padding = data_padding_len(self.policy.max_padding);
        self.send_sealed(RecordKind::Data, chunk, padding).await
    }

    /// Send arbitrary plaintext as a run of Data records, chunked at the
    /// policy's payload cap. Returns once the transport has accepted every
    /// enclosing record, which is the pump's backpressure point.
    pub async fn write_all_data(&mut self, buf: &[u8]) -> Result<()> {
        for chunk in buf.chunks(self.policy.max_record_payload.max(1)) {
            self.send_data(chunk).await?;
        }
        Ok(())
    }

    /// Send an unencrypted Ping record.
    pub async fn send_ping(&mut self) -> Result<()> {
        self.send_plain(RecordKind::Ping, Bytes::new()).await
    }

    /// Send an unencrypted Pong record.
    pub async fn send_pong(&mut self) -> Result<()> {
        self.send_plain(RecordKind::Pong, Bytes::new()).await
    }

    /// Send an unencrypted Error record.
    pub async fn send_error(&mut self, code: ErrorCode, message: &str) -> Result<()> {
        let payload = ErrorPayload::new(code, message).encode();
        self.send_plain(RecordKind::Error, payload.freeze()).await
    }

    /// Finish the stream: flush and signal EOF to the peer.
    pub async fn finish(&mut self) -> Result<()> {
        self.writer.shutdown().await?;
        Ok(())
    }

    /// Consume the sender, returning the underlying writer.
    pub fn into_inner(self) -> W {
        self.writer
    }

    async fn send_sealed(
        &mut self,
        kind: RecordKind,
        plaintext: &[u8],
        padding_len: usize,
    ) -> Result<()> {
        let (nonce, counter) = self.nonce.next()?;

        let mut header = RecordHeader::new(kind);
        header.set_timestamp_ns(unix_now_ns());
        header.set_session_id(self.nonce.session_id());
        header.set_counter(counter);
        header.set_payload_length((plaintext.len() + TAG_SIZE) as u32);
        header.set_padding_length(padding_len as u32);

        // The AAD is the final header bytes; both length fields are
        // already stamped, so the tag covers them.
        let ciphertext = aether_crypto::seal(&self.key, &nonce, &header.to_bytes(), plaintext);

        let record = Record::new(header, ciphertext, draw_padding(padding_len))?;
        self.write_record(&record).await
    }

    async fn send_plain(&mut self, kind: RecordKind, payload: Bytes) -> Result<()> {
        // Unused header fields stay zero for wire determinism.
        let record = Record::new(RecordHeader::new(kind), payload, Bytes::new())?;
        self.write_record(&record).await
    }

    async fn write_record(&mut self, record: &Record) -> Result<()> {
        let mut wire = BytesMut::with_capacity(record.wire_length());
        record.encode(&mut wire)?;
        self.writer.write_all(&wire).await?;
        self.writer.flush().await?;
        Ok(())
    }
}

/// Read half of a tunnel stream.
pub struct RecordReceiver<R> {
    reader: BufReader<R>,
    psk: String,
    key: Option<([u8; 4], RecordKey)>,
    replay: ReplayGuard,
    stash: Bytes,
}

impl<R> std::fmt::Debug for RecordReceiver<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordReceiver")
            .field("stash", &self.stash.len())
            .field("last_seen_counter", &self.replay.last_seen_counter())
            .finish_non_exhaustive()
    }
}

impl<R: AsyncRead + Unpin> RecordReceiver<R> {
    /// Receiver with the default replay window. Keys are derived lazily
    /// from the observed session id.
    #[must_use]
    pub fn new(reader: R, psk: &str) -> Self {
        Self::with_replay_guard(reader, psk, ReplayGuard::new())
    }

    /// Receiver with explicit replay state (gateway handshake paths build
    /// the guard up front so the first record and the data phase share
    /// one watermark).
    #[must_use]
    pub fn with_replay_guard(reader: R, psk: &str, replay: ReplayGuard) -> Self {
        Self {
            reader: BufReader::with_capacity(READER_BUFFER, reader),
            psk: psk.to_string(),
            key: None,
            replay,
            stash: Bytes::new(),
        }
    }

    /// Read the next framed record, validating structure only.
    ///
    /// Returns `None` on a clean EOF at a record boundary.
    pub async fn next_record(&mut self) -> Result<Option<Record>> {
        let mut prefix = [0u8; 4];
        match self.reader.read_exact(&mut prefix).await {
            Ok(_) => {},
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }

        let framed = u32::from_be_bytes(prefix) as usize;
        if framed < RecordHeader::SIZE || framed > MAX_RECORD_TOTAL {
            return Err(aether_proto::ProtocolError::BadFramedLength {
                length: framed,
                min: RecordHeader::SIZE,
                max: MAX_RECORD_TOTAL,
            }
            .into());
        }

        let mut body = vec![0u8; framed];
        self.reader.read_exact(&mut body).await?;

        Ok(Some(Record::decode_body(&body)?))
    }

    /// Validate replay invariants and open a sealed record's payload.
    ///
    /// Order matters: timestamp and counter are checked *before* the key
    /// is touched, so replays cost no AEAD work.
    pub fn open_sealed(&mut self, record: &Record) -> Result<Vec<u8>> {
        let header = &record.header;
        self.replay.check(header.timestamp_ns(), header.counter(), unix_now_ns())?;

        let session_id = header.session_id();
        if !matches!(&self.key, Some((id, _)) if *id == session_id) {
            self.key = Some((session_id, derive_record_key(&self.psk, session_id)));
        }
        let Some((_, key)) = &self.key else {
            unreachable!("key installed above");
        };

        let nonce = nonce_for(session_id, header.counter());
        let plaintext = aether_crypto::open(key, &nonce, &header.to_bytes(), &record.payload)?;
        Ok(plaintext)
    }

    /// Byte-stream read: fills `buf` from Data records, consuming
    /// Ping/Pong silently and surfacing Error records as failures.
    ///
    /// Returns 0 on clean EOF.
    pub async fn read_data(&mut self, buf: &mut [u8]) -> Result<usize> {
        loop {
            if !self.stash.is_empty() {
                let n = self.stash.len().min(buf.len());
                buf[..n].copy_from_slice(&self.stash.split_to(n));
                return Ok(n);
            }

            let Some(record) = self.next_record().await? else {
                return Ok(0);
            };

            match record.kind() {
                Some(RecordKind::Data) => {
                    self.stash = Bytes::from(self.open_sealed(&record)?);
                },
                Some(RecordKind::Ping | RecordKind::Pong) => {},
                Some(RecordKind::Error) => {
                    let payload = ErrorPayload::decode(&record.payload)?;
                    return Err(CoreError::Peer { code: payload.code, message: payload.message });
                },
                Some(RecordKind::Metadata) | None => {
                    return Err(CoreError::UnexpectedRecord { expected: "data record" });
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sender_over_vec(session_id: [u8; 4]) -> RecordSender<Vec<u8>> {
        RecordSender::new(
            Vec::new(),
            "test psk",
            Arc::new(NonceGenerator::new(session_id)),
            RecordPolicy::default(),
        )
    }

    fn into_receiver(wire: Vec<u8>) -> RecordReceiver<std::io::Cursor<Vec<u8>>> {
        RecordReceiver::new(std::io::Cursor::new(wire), "test psk")
    }

    #[tokio::test]
    async fn data_round_trip() {
        let mut sender = sender_over_vec([1, 2, 3, 4]);
        sender.write_all_data(b"hello tunnel").await.unwrap();

        let mut receiver = into_receiver(sender.writer);
        let mut buf = [0u8; 64];
        let n = receiver.read_data(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello tunnel");
        assert_eq!(receiver.read_data(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn large_writes_are_chunked() {
        let mut sender = sender_over_vec([1, 2, 3, 4]);
        let payload = vec![0x5A; DEFAULT_RECORD_PAYLOAD * 2 + 100];
        sender.write_all_data(&payload).await.unwrap();

        let mut receiver = into_receiver(sender.writer);
        let mut collected = Vec::new();
        let mut buf = vec![0u8; 128 * 1024];
        loop {
            let n = receiver.read_data(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            collected.extend_from_slice(&buf[..n]);
        }
        assert_eq!(collected, payload);
    }

    #[tokio::test]
    async fn small_reads_drain_the_stash() {
        let mut sender = sender_over_vec([9, 9, 9, 9]);
        sender.write_all_data(b"abcdef").await.unwrap();

        let mut receiver = into_receiver(sender.writer);
        let mut out = Vec::new();
        let mut buf = [0u8; 2];
        loop {
            let n = receiver.read_data(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        assert_eq!(out, b"abcdef");
    }

    #[tokio::test]
    async fn metadata_round_trip() {
        let mut sender = sender_over_vec([7, 7, 7, 7]);
        let meta = MetadataPayload::for_host("example.com", 80).unwrap();
        sender.send_metadata(&meta).await.unwrap();

        let mut receiver = into_receiver(sender.writer);
        let record = receiver.next_record().await.unwrap().unwrap();
        assert_eq!(record.kind(), Some(RecordKind::Metadata));
        // Metadata records pad in [16, 256].
        let padding = record.header.padding_length();
        assert!((16..=256).contains(&padding), "padding {padding}");

        let plaintext = receiver.open_sealed(&record).unwrap();
        assert_eq!(MetadataPayload::decode(&plaintext).unwrap(), meta);
    }

    #[tokio::test]
    async fn ping_pong_consumed_silently() {
        let mut sender = sender_over_vec([1, 1, 1, 1]);
        sender.send_ping().await.unwrap();
        sender.send_pong().await.unwrap();
        sender.write_all_data(b"after").await.unwrap();

        let mut receiver = into_receiver(sender.writer);
        let mut buf = [0u8; 16];
        let n = receiver.read_data(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"after");
    }

    #[tokio::test]
    async fn error_record_surfaces_as_peer_error() {
        let mut sender = sender_over_vec([1, 1, 1, 1]);
        sender.send_error(ErrorCode::TargetConnect, "dial refused").await.unwrap();

        let mut receiver = into_receiver(sender.writer);
        let mut buf = [0u8; 16];
        let err = receiver.read_data(&mut buf).await.unwrap_err();
        assert!(matches!(
            err,
            CoreError::Peer { code: ErrorCode::TargetConnect, ref message } if message == "dial refused"
        ));
    }

    #[tokio::test]
    async fn replayed_record_rejected() {
        let mut sender = sender_over_vec([3, 3, 3, 3]);
        sender.write_all_data(b"once").await.unwrap();

        // Replay the identical wire bytes on the same stream.
        let mut wire = sender.writer.clone();
        wire.extend_from_slice(&sender.writer);

        let mut receiver = into_receiver(wire);
        let mut buf = [0u8; 16];
        assert_eq!(receiver.read_data(&mut buf).await.unwrap(), 4);
        let err = receiver.read_data(&mut buf).await.unwrap_err();
        assert!(matches!(
            err,
            CoreError::Crypto(aether_crypto::CryptoError::CounterNotMonotonic { .. })
        ));
    }

    #[tokio::test]
    async fn wrong_psk_fails_open() {
        let mut sender = sender_over_vec([4, 4, 4, 4]);
        sender.write_all_data(b"secret").await.unwrap();

        let mut receiver =
            RecordReceiver::new(std::io::Cursor::new(sender.writer), "a different psk");
        let mut buf = [0u8; 16];
        let err = receiver.read_data(&mut buf).await.unwrap_err();
        assert!(matches!(err, CoreError::Crypto(aether_crypto::CryptoError::OpenFailed)));
    }

    #[tokio::test]
    async fn tampered_header_fails_open() {
        let mut sender = sender_over_vec([5, 5, 5, 5]);
        sender.write_all_data(b"payload").await.unwrap();

        let mut wire = sender.writer;
        // Flip a bit in the timestamp field (prefix 4 + offset 2).
        wire[6] ^= 0x01;

        let mut receiver = into_receiver(wire);
        let mut buf = [0u8; 16];
        let err = receiver.read_data(&mut buf).await.unwrap_err();
        // Timestamp tamper fails either the window check or the AEAD.
        assert!(matches!(err, CoreError::Crypto(_)));
    }

    #[tokio::test]
    async fn truncated_stream_is_an_error_not_eof() {
        let mut sender = sender_over_vec([6, 6, 6, 6]);
        sender.write_all_data(b"payload").await.unwrap();

        let mut wire = sender.writer;
        wire.truncate(wire.len() - 3);

        let mut receiver = into_receiver(wire);
        let mut buf = [0u8; 16];
        assert!(receiver.read_data(&mut buf).await.is_err());
    }

    #[tokio::test]
    async fn data_padding_respects_disabled_padding() {
        let mut sender = RecordSender::new(
            Vec::new(),
            "test psk",
            Arc::new(NonceGenerator::new([0; 4])),
            RecordPolicy::new(0, DEFAULT_RECORD_PAYLOAD),
        );
        sender.write_all_data(b"no padding").await.unwrap();

        let mut receiver = into_receiver(sender.writer);
        let record = receiver.next_record().await.unwrap().unwrap();
        assert_eq!(record.header.padding_length(), 0);
    }

    #[tokio::test]
    async fn data_padding_within_configured_bounds() {
        let mut sender = RecordSender::new(
            Vec::new(),
            "test psk",
            Arc::new(NonceGenerator::new([0; 4])),
            RecordPolicy::new(200, DEFAULT_RECORD_PAYLOAD),
        );
        for _ in 0..32 {
            sender.send_data(b"x").await.unwrap();
        }

        let mut receiver = into_receiver(sender.writer);
        while let Some(record) = receiver.next_record().await.unwrap() {
            let padding = record.header.padding_length();
            // Data padding caps at 32 regardless of the configured 200.
            assert!((1..=32).contains(&padding), "padding {padding}");
        }
    }

    #[test]
    fn record_policy_clamps_payload_cap() {
        assert_eq!(RecordPolicy::new(0, 1).max_record_payload, MIN_RECORD_PAYLOAD);
        assert_eq!(RecordPolicy::new(0, 1 << 30).max_record_payload, MAX_RECORD_PAYLOAD);
        assert_eq!(RecordPolicy::new(0, 8192).max_record_payload, 8192);
    }
}
