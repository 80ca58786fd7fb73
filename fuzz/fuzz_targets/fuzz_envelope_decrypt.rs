//! Fuzz target for envelope decryption.
//!
//! This tests that `SecurityEnvelope::decrypt` rejects arbitrary blobs
//! with an error instead of panicking, and never "succeeds" on garbage.

#![no_main]

use libfuzzer_sys::fuzz_target;
use meshkv::config::SecurityConfig;
use meshkv::envelope::{EnvelopeBlob, SecurityEnvelope};
use std::sync::OnceLock;

fn envelope() -> &'static SecurityEnvelope {
    static ENV: OnceLock<SecurityEnvelope> = OnceLock::new();
    ENV.get_or_init(|| {
        let config = SecurityConfig {
            kdf_iterations: 1000,
            ..SecurityConfig::with_master_key("fuzz-harness-master-key")
        };
        SecurityEnvelope::new(&config).unwrap()
    })
}

fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };
    let Ok(blob) = serde_json::from_str::<EnvelopeBlob>(text) else {
        return;
    };

    // Arbitrary encrypted blobs must fail cleanly; unencrypted blobs pass
    // their data through. Either way: no panic.
    let result = envelope().decrypt(&blob);
    if blob.encrypted {
        assert!(result.is_err(), "garbage blob decrypted successfully");
    }
});
