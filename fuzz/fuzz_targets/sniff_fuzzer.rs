//! Fuzz target for TLS detection on servers that allow unsecured clients
//!
//! # Strategy
//!
//! - Arbitrary first bytes, split into arbitrary chunks
//! - Optional end of stream after the last chunk
//!
//! # Invariants
//!
//! - NEVER panic, whatever arrives
//! - Nothing reaches the application before the decision
//! - Plaintext peers see their bytes passed through unmodified
//! - Streams not starting with a TLS handshake header are never treated as TLS

#![no_main]

use std::sync::OnceLock;

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use skiff_driver::{Prelude, SecurityLayer, ServerSecurity};

#[derive(Debug, Clone, Arbitrary)]
struct Input {
    chunks: Vec<Vec<u8>>,
    eof: bool,
}

fn security() -> &'static ServerSecurity {
    static SECURITY: OnceLock<ServerSecurity> = OnceLock::new();
    SECURITY.get_or_init(|| {
        ServerSecurity::self_signed(vec!["localhost".to_string()]).expect("self-signed identity")
    })
}

fuzz_target!(|input: Input| {
    let Ok(mut layer) = SecurityLayer::server(security(), true) else {
        return;
    };

    let mut seen = Vec::new();
    for chunk in &input.chunks {
        if layer.feed_input(chunk).is_err() {
            return;
        }
        seen.extend_from_slice(chunk);
        if Prelude::detect(&seen, false).is_none() {
            assert!(layer.application_input().is_empty());
            assert!(!layer.handshake_complete());
        }
    }
    if input.eof && layer.finish_input().is_err() {
        return;
    }

    if let Some(Prelude::Plain) = Prelude::detect(&seen, input.eof) {
        assert!(!layer.is_encrypted());
        assert_eq!(layer.application_input(), seen.as_slice());
    }
});
