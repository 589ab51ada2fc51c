//! Fuzz target for the two-axis connector state machine
//!
//! # Strategy
//!
//! - Arbitrary sequences of half-closes, full closes and failures
//! - Closure reports interleaved at random points
//!
//! # Invariants
//!
//! - Closed iff neither side is open
//! - A side that left Open never returns to it
//! - The closed event fires at most once, and only once closed
//! - The first recorded reason never changes

#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use skiff_core::{CloseReason, ConnectorState, Side};

#[derive(Debug, Clone, Arbitrary)]
enum Op {
    CloseRead,
    CloseWrite,
    Close,
    Fail,
    TakeClosed,
}

fuzz_target!(|ops: Vec<Op>| {
    let mut state = ConnectorState::new();
    let mut reported = 0usize;
    let mut first: Option<CloseReason> = None;
    let mut read_done = false;
    let mut write_done = false;

    for op in ops {
        match op {
            Op::CloseRead => {
                state.close_read(CloseReason::PeerClosed);
            }
            Op::CloseWrite => {
                state.close_write(CloseReason::Local);
            }
            Op::Close => {
                state.close(CloseReason::Local);
            }
            Op::Fail => {
                state.fail(CloseReason::Io("fuzz".to_string()));
            }
            Op::TakeClosed => {
                if state.take_closed_event() {
                    assert!(state.is_closed());
                    reported += 1;
                }
            }
        }

        assert!(reported <= 1);
        assert_eq!(state.is_closed(), !state.read().is_open() && !state.write().is_open());
        if read_done {
            assert_ne!(state.read(), Side::Open);
        }
        if write_done {
            assert_ne!(state.write(), Side::Open);
        }
        read_done |= !state.read().is_open();
        write_done |= !state.write().is_open();

        match (&first, state.reason()) {
            (None, Some(reason)) => first = Some(reason.clone()),
            (Some(expected), actual) => assert_eq!(Some(expected), actual),
            (None, None) => {}
        }
    }
});
