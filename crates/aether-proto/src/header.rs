//! Record header with zero-copy parsing.
//!
//! The `RecordHeader` is a fixed 30-byte structure serialized as raw
//! binary (big endian). The receiver validates version, kind, and length
//! bounds before any allocation, and the whole 30 bytes double as the
//! AEAD associated data, so a single flipped header bit fails
//! authentication downstream.

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::{
    MAX_RECORD_TOTAL, PROTOCOL_VERSION, RecordKind,
    errors::{ProtocolError, Result},
};

/// Fixed 30-byte record header (big-endian network byte order).
///
/// Fields are stored as raw byte arrays to avoid alignment issues; the
/// `#[repr(C, packed)]` layout with zerocopy traits allows casting the
/// struct from untrusted network bytes - every 30-byte pattern is a valid
/// bit pattern, so the cast itself cannot misbehave. Semantic validation
/// (version, kind, lengths) happens in [`RecordHeader::from_bytes`].
///
/// Wire layout:
///
/// | Offset | Size | Field |
/// |---|---|---|
/// | 0 | 1 | version |
/// | 1 | 1 | kind |
/// | 2 | 8 | `timestamp_ns` |
/// | 10 | 4 | `payload_length` |
/// | 14 | 4 | `padding_length` |
/// | 18 | 4 | `session_id` |
/// | 22 | 8 | counter |
#[repr(C, packed)]
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct RecordHeader {
    version: u8,
    kind: u8,
    timestamp_ns: [u8; 8],
    pub(crate) payload_length: [u8; 4],
    pub(crate) padding_length: [u8; 4],
    session_id: [u8; 4],
    counter: [u8; 8],
}

impl RecordHeader {
    /// Size of the serialized header (30 bytes).
    pub const SIZE: usize = 30;

    /// Create a new header for the given kind with all other fields zero.
    #[must_use]
    pub fn new(kind: RecordKind) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            kind: kind.to_u8(),
            timestamp_ns: [0u8; 8],
            payload_length: [0u8; 4],
            padding_length: [0u8; 4],
            session_id: [0u8; 4],
            counter: [0u8; 8],
        }
    }

    /// Parse a header from network bytes (zero-copy).
    ///
    /// Validation is cheapest-first: size, version, kind, then length
    /// bounds. Garbage input fails before any allocation.
    ///
    /// # Errors
    ///
    /// - `ProtocolError::RecordTooShort` if fewer than 30 bytes
    /// - `ProtocolError::UnsupportedVersion` on a foreign version byte
    /// - `ProtocolError::UnknownKind` on an unrecognized type byte
    /// - `ProtocolError::BadFramedLength` if the claimed body exceeds
    ///   [`MAX_RECORD_TOTAL`]
    pub fn from_bytes(bytes: &[u8]) -> Result<&Self> {
        let header = Self::ref_from_prefix(bytes)
            .map_err(|_| ProtocolError::RecordTooShort {
                expected: Self::SIZE,
                actual: bytes.len(),
            })?
            .0;

        if header.version != PROTOCOL_VERSION {
            return Err(ProtocolError::UnsupportedVersion(header.version));
        }

        if RecordKind::from_u8(header.kind).is_none() {
            return Err(ProtocolError::UnknownKind(header.kind));
        }

        let framed = Self::SIZE + header.payload_length() as usize + header.padding_length() as usize;
        if framed > MAX_RECORD_TOTAL {
            return Err(ProtocolError::BadFramedLength {
                length: framed,
                min: Self::SIZE,
                max: MAX_RECORD_TOTAL,
            });
        }

        Ok(header)
    }

    /// Serialize the header to its 30 wire bytes.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let bytes = IntoBytes::as_bytes(self);
        let mut arr = [0u8; Self::SIZE];
        arr.copy_from_slice(bytes);
        arr
    }

    /// Protocol version byte.
    #[must_use]
    pub fn version(&self) -> u8 {
        self.version
    }

    /// Record kind. Always valid for headers obtained via
    /// [`RecordHeader::from_bytes`].
    #[must_use]
    pub fn kind(&self) -> Option<RecordKind> {
        RecordKind::from_u8(self.kind)
    }

    /// Sender wallclock at encode time, nanoseconds since the Unix epoch.
    #[must_use]
    pub fn timestamp_ns(&self) -> u64 {
        u64::from_be_bytes(self.timestamp_ns)
    }

    /// Payload length in bytes. For sealed records this includes the
    /// 16-byte authentication tag.
    #[must_use]
    pub fn payload_length(&self) -> u32 {
        u32::from_be_bytes(self.payload_length)
    }

    /// Padding length in bytes.
    #[must_use]
    pub fn padding_length(&self) -> u32 {
        u32::from_be_bytes(self.padding_length)
    }

    /// Sender's session identifier; doubles as the HKDF salt for the
    /// record key.
    #[must_use]
    pub fn session_id(&self) -> [u8; 4] {
        self.session_id
    }

    /// Per-session monotonic counter; concatenated with the session id it
    /// forms the AEAD nonce.
    #[must_use]
    pub fn counter(&self) -> u64 {
        u64::from_be_bytes(self.counter)
    }

    /// Total framed length on the wire (header + payload + padding), the
    /// value of the `u32` length prefix.
    #[must_use]
    pub fn framed_length(&self) -> usize {
        Self::SIZE + self.payload_length() as usize + self.padding_length() as usize
    }

    /// Set the sender timestamp.
    pub fn set_timestamp_ns(&mut self, timestamp_ns: u64) {
        self.timestamp_ns = timestamp_ns.to_be_bytes();
    }

    /// Set the payload length (must be set before sealing, since the
    /// header is authenticated as-is).
    pub fn set_payload_length(&mut self, length: u32) {
        self.payload_length = length.to_be_bytes();
    }

    /// Set the padding length.
    pub fn set_padding_length(&mut self, length: u32) {
        self.padding_length = length.to_be_bytes();
    }

    /// Set the sender session identifier.
    pub fn set_session_id(&mut self, session_id: [u8; 4]) {
        self.session_id = session_id;
    }

    /// Set the record counter.
    pub fn set_counter(&mut self, counter: u64) {
        self.counter = counter.to_be_bytes();
    }
}

// Manual Debug implementation (can't derive due to packed repr)
impl std::fmt::Debug for RecordHeader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordHeader")
            .field("version", &format!("{:#04x}", self.version()))
            .field("kind", &format!("{:#04x}", self.kind))
            .field("timestamp_ns", &self.timestamp_ns())
            .field("payload_length", &self.payload_length())
            .field("padding_length", &self.padding_length())
            .field("session_id", &format!("{:02x?}", self.session_id()))
            .field("counter", &self.counter())
            .finish()
    }
}

// Manual PartialEq implementation (can't derive due to packed repr)
impl PartialEq for RecordHeader {
    fn eq(&self, other: &Self) -> bool {
        self.to_bytes() == other.to_bytes()
    }
}

impl Eq for RecordHeader {}

/// Proptest strategy over all record kinds (shared with record tests).
#[cfg(test)]
pub(crate) fn arbitrary_kind() -> impl proptest::strategy::Strategy<Value = RecordKind> {
    proptest::sample::select(vec![
        RecordKind::Metadata,
        RecordKind::Data,
        RecordKind::Ping,
        RecordKind::Pong,
        RecordKind::Error,
    ])
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn arbitrary_bytes<const N: usize>() -> impl Strategy<Value = [u8; N]> {
        prop::collection::vec(any::<u8>(), N).prop_map(|v| {
            let mut arr = [0u8; N];
            arr.copy_from_slice(&v);
            arr
        })
    }

    impl Arbitrary for RecordHeader {
        type Parameters = ();
        type Strategy = BoxedStrategy<Self>;

        fn arbitrary_with((): Self::Parameters) -> Self::Strategy {
            (
                arbitrary_kind(),
                any::<u64>(),              // timestamp_ns
                0u32..=4096,               // payload_length (kept small for tests)
                0u32..=256,                // padding_length
                arbitrary_bytes::<4>(),    // session_id
                any::<u64>(),              // counter
            )
                .prop_map(|(kind, timestamp_ns, payload_length, padding_length, session_id, counter)| {
                    let mut header = Self::new(kind);
                    header.set_timestamp_ns(timestamp_ns);
                    header.set_payload_length(payload_length);
                    header.set_padding_length(padding_length);
                    header.set_session_id(session_id);
                    header.set_counter(counter);
                    header
                })
                .boxed()
        }
    }

    #[test]
    fn header_size() {
        assert_eq!(std::mem::size_of::<RecordHeader>(), RecordHeader::SIZE);
        assert_eq!(RecordHeader::SIZE, 30);
    }

    proptest! {
        #[test]
        fn header_round_trip(header in any::<RecordHeader>()) {
            let bytes = header.to_bytes();
            let parsed = RecordHeader::from_bytes(&bytes).expect("should parse");
            prop_assert_eq!(&header, parsed);
        }

        #[test]
        fn framed_length_consistent(header in any::<RecordHeader>()) {
            let framed = header.framed_length();
            prop_assert_eq!(
                framed,
                RecordHeader::SIZE
                    + header.payload_length() as usize
                    + header.padding_length() as usize
            );
        }
    }

    #[test]
    fn reject_short_buffer() {
        let short = [0u8; 12];
        let result = RecordHeader::from_bytes(&short);
        assert_eq!(result, Err(ProtocolError::RecordTooShort { expected: 30, actual: 12 }));
    }

    #[test]
    fn reject_wrong_version() {
        let mut bytes = RecordHeader::new(RecordKind::Data).to_bytes();
        bytes[0] = 0x04;
        assert_eq!(RecordHeader::from_bytes(&bytes), Err(ProtocolError::UnsupportedVersion(0x04)));
    }

    #[test]
    fn reject_unknown_kind() {
        let mut bytes = RecordHeader::new(RecordKind::Data).to_bytes();
        bytes[1] = 0x42;
        assert_eq!(RecordHeader::from_bytes(&bytes), Err(ProtocolError::UnknownKind(0x42)));
    }

    #[test]
    fn reject_oversized_body() {
        let mut header = RecordHeader::new(RecordKind::Data);
        header.set_payload_length(crate::MAX_RECORD_TOTAL as u32);
        header.set_padding_length(64);
        let bytes = header.to_bytes();
        assert!(matches!(
            RecordHeader::from_bytes(&bytes),
            Err(ProtocolError::BadFramedLength { .. })
        ));
    }

    #[test]
    fn offsets_match_wire_layout() {
        let mut header = RecordHeader::new(RecordKind::Metadata);
        header.set_timestamp_ns(0x0102_0304_0506_0708);
        header.set_payload_length(0x0A0B_0C0D);
        header.set_padding_length(0x1112_1314);
        header.set_session_id([0xDE, 0xAD, 0xBE, 0xEF]);
        header.set_counter(0x2122_2324_2526_2728);

        let bytes = header.to_bytes();
        assert_eq!(bytes[0], PROTOCOL_VERSION);
        assert_eq!(bytes[1], RecordKind::Metadata.to_u8());
        assert_eq!(&bytes[2..10], &[0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08]);
        assert_eq!(&bytes[10..14], &[0x0A, 0x0B, 0x0C, 0x0D]);
        assert_eq!(&bytes[14..18], &[0x11, 0x12, 0x13, 0x14]);
        assert_eq!(&bytes[18..22], &[0xDE, 0xAD, 0xBE, 0xEF]);
        assert_eq!(&bytes[22..30], &[0x21, 0x22, 0x23, 0x24, 0x25, 0x26, 0x27, 0x28]);
    }
}
