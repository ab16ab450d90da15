//! Fuzz target for Record::decode
//!
//! This fuzzer tests record deframing with arbitrary byte sequences to find:
//! - Parser crashes or panics
//! - Integer overflows in framed-length calculations
//! - Buffer over-reads
//! - Length-field combinations that bypass validation
//!
//! The fuzzer should NEVER panic. All invalid inputs should return an error.

#![no_main]

use aether_proto::Record;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Attempt to decode arbitrary bytes as a length-prefixed record,
    // and as a bare record body. Both must only ever return Err for
    // invalid data.
    let _ = Record::decode(data);
    let _ = Record::decode_body(data);
});
