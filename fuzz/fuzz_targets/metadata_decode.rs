//! Fuzz target for MetadataPayload::decode
//!
//! This fuzzer tests metadata parsing with:
//! - Truncated address fields
//! - Domain length prefixes overrunning the buffer
//! - TLV option lists whose lengths disagree with options_length
//! - Unknown address types and option tags
//!
//! The fuzzer should NEVER panic. All invalid inputs should return an error.

#![no_main]

use aether_proto::MetadataPayload;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(payload) = MetadataPayload::decode(data) {
        // Anything that parsed must re-encode.
        let _ = payload.encode();
    }
});
