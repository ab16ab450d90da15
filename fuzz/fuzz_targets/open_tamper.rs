//! Fuzz target for authenticated decryption under tampering
//!
//! Seals a payload, lets the fuzzer mutate ciphertext and associated
//! data, and checks that open either fails or returns the original
//! plaintext (when the mutation happens to be the identity). Must never
//! panic, and a real mutation must never authenticate.

#![no_main]

use aether_crypto::{derive_record_key, nonce_for, open, seal};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|input: (Vec<u8>, [u8; 30], Vec<u8>, [u8; 30])| {
    let (plaintext, header, ct_mutation, header_mutation) = input;

    let key = derive_record_key("fuzzing psk", [7, 7, 7, 7]);
    let nonce = nonce_for([7, 7, 7, 7], 1);

    let original_ciphertext = seal(&key, &nonce, &header, &plaintext);

    let mut ciphertext = original_ciphertext.clone();
    for (byte, mask) in ciphertext.iter_mut().zip(ct_mutation.iter()) {
        *byte ^= mask;
    }
    let mut tampered_header = header;
    for (byte, mask) in tampered_header.iter_mut().zip(header_mutation.iter()) {
        *byte ^= mask;
    }

    let untouched = ciphertext == original_ciphertext && tampered_header == header;

    match open(&key, &nonce, &tampered_header, &ciphertext) {
        Ok(recovered) => {
            assert!(untouched, "tampered input authenticated");
            assert_eq!(recovered, plaintext);
        },
        Err(_) => {
            assert!(!untouched, "untouched input failed to authenticate");
        },
    }
});
