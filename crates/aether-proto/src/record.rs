//! Record type combining header, payload, and padding.
//!
//! A `Record` is the stream-layer unit: a 30-byte header, a variable
//! payload (ciphertext for sealed kinds, plain bytes for Error), and
//! variable padding. On the wire the record is prefixed by a `u32` total
//! length equal to `header + payload + padding`; records are concatenated
//! with no other separator and endpoints never emit partial records.
//!
//! This is a pure data holder. Sealing payloads happens in
//! `aether-crypto`; async framing happens in the record pump.

use bytes::{BufMut, Bytes};

use crate::{
    MAX_RECORD_TOTAL, RecordKind,
    errors::{ProtocolError, Result},
    header::RecordHeader,
};

/// Size of the `u32` length prefix preceding every record on a stream.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Complete protocol record.
///
/// # Invariants
///
/// - `payload.len()` equals `header.payload_length()` and `padding.len()`
///   equals `header.padding_length()`; both are enforced by
///   [`Record::new`] and verified by [`Record::decode_body`].
/// - The framed length never exceeds [`MAX_RECORD_TOTAL`]; oversized
///   records are rejected during construction and decoding.
///
/// Padding bytes are carried so that encode/decode round-trips are exact,
/// but receivers must never interpret them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// Record header (30 bytes).
    pub header: RecordHeader,
    /// Payload bytes. For Metadata/Data this is AEAD ciphertext including
    /// the 16-byte tag; for Error it is the plain error payload; empty for
    /// Ping/Pong.
    pub payload: Bytes,
    /// Padding bytes; random on emit, ignored on receipt.
    pub padding: Bytes,
}

impl Record {
    /// Create a record, stamping both length fields from the actual
    /// slices so header and body can never disagree.
    ///
    /// # Errors
    ///
    /// - `ProtocolError::BadFramedLength` if the record would exceed
    ///   [`MAX_RECORD_TOTAL`]
    pub fn new(
        mut header: RecordHeader,
        payload: impl Into<Bytes>,
        padding: impl Into<Bytes>,
    ) -> Result<Self> {
        let payload = payload.into();
        let padding = padding.into();

        let framed = RecordHeader::SIZE + payload.len() + padding.len();
        if framed > MAX_RECORD_TOTAL {
            return Err(ProtocolError::BadFramedLength {
                length: framed,
                min: RecordHeader::SIZE,
                max: MAX_RECORD_TOTAL,
            });
        }

        header.set_payload_length(payload.len() as u32);
        header.set_padding_length(padding.len() as u32);

        Ok(Self { header, payload, padding })
    }

    /// Record kind from the header.
    ///
    /// Headers built through [`RecordHeader::new`] or parsed through
    /// [`RecordHeader::from_bytes`] always carry a known kind.
    #[must_use]
    pub fn kind(&self) -> Option<RecordKind> {
        self.header.kind()
    }

    /// Total bytes this record occupies on the wire, including the length
    /// prefix.
    #[must_use]
    pub fn wire_length(&self) -> usize {
        LENGTH_PREFIX_SIZE + self.header.framed_length()
    }

    /// Encode the record into `dst`: length prefix, header, payload,
    /// padding.
    ///
    /// # Errors
    ///
    /// - `ProtocolError::LengthMismatch` if the slices no longer match the
    ///   header (a record mutated after construction)
    pub fn encode(&self, dst: &mut impl BufMut) -> Result<()> {
        let payload_len = self.header.payload_length() as usize;
        let padding_len = self.header.padding_length() as usize;
        if payload_len != self.payload.len() || padding_len != self.padding.len() {
            return Err(ProtocolError::LengthMismatch {
                payload: payload_len,
                padding: padding_len,
                body: self.payload.len() + self.padding.len(),
            });
        }

        let framed = self.header.framed_length();
        dst.put_u32(framed as u32);
        dst.put_slice(&self.header.to_bytes());
        dst.put_slice(&self.payload);
        dst.put_slice(&self.padding);

        Ok(())
    }

    /// Decode a record from a buffer that starts with the length prefix.
    ///
    /// Trailing bytes beyond the framed length are ignored, so a buffer
    /// holding several concatenated records can be decoded one prefix at a
    /// time.
    ///
    /// # Errors
    ///
    /// - `ProtocolError::RecordTooShort` if the buffer is truncated
    /// - `ProtocolError::BadFramedLength` if the prefix is below the
    ///   header size or above [`MAX_RECORD_TOTAL`]
    /// - any error from [`Record::decode_body`]
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let prefix: [u8; LENGTH_PREFIX_SIZE] = bytes
            .get(..LENGTH_PREFIX_SIZE)
            .and_then(|s| s.try_into().ok())
            .ok_or(ProtocolError::RecordTooShort {
                expected: LENGTH_PREFIX_SIZE,
                actual: bytes.len(),
            })?;
        let framed = u32::from_be_bytes(prefix) as usize;

        if framed < RecordHeader::SIZE || framed > MAX_RECORD_TOTAL {
            return Err(ProtocolError::BadFramedLength {
                length: framed,
                min: RecordHeader::SIZE,
                max: MAX_RECORD_TOTAL,
            });
        }

        let body = bytes.get(LENGTH_PREFIX_SIZE..LENGTH_PREFIX_SIZE + framed).ok_or(
            ProtocolError::RecordTooShort {
                expected: LENGTH_PREFIX_SIZE + framed,
                actual: bytes.len(),
            },
        )?;

        Self::decode_body(body)
    }

    /// Decode a record body (header + payload + padding) after the length
    /// prefix has already been consumed, as the streaming reader does.
    ///
    /// # Errors
    ///
    /// - header validation errors from [`RecordHeader::from_bytes`]
    /// - `ProtocolError::LengthMismatch` if the header's length fields do
    ///   not sum to the body size
    pub fn decode_body(body: &[u8]) -> Result<Self> {
        let header = *RecordHeader::from_bytes(body)?;

        let payload_len = header.payload_length() as usize;
        let padding_len = header.padding_length() as usize;
        let expected = RecordHeader::SIZE + payload_len + padding_len;
        if body.len() != expected {
            return Err(ProtocolError::LengthMismatch {
                payload: payload_len,
                padding: padding_len,
                body: body.len().saturating_sub(RecordHeader::SIZE),
            });
        }

        // Bounds established by the equality check above.
        let payload = Bytes::copy_from_slice(&body[RecordHeader::SIZE..RecordHeader::SIZE + payload_len]);
        let padding = Bytes::copy_from_slice(&body[RecordHeader::SIZE + payload_len..]);

        Ok(Self { header, payload, padding })
    }
}
