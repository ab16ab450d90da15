//! Fuzz target for ErrorPayload::decode
//!
//! Exercises truncation, unknown codes, non-zero reserved fields, and
//! invalid UTF-8 in the message. Must never panic.

#![no_main]

use aether_proto::ErrorPayload;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let _ = ErrorPayload::decode(data);
});
