//! Property tests for the connector state machine.
//!
//! Random sequences of half-closes, local closes and failures are applied to
//! a `ConnectorState` and checked against a trivially correct model.

use proptest::prelude::*;
use skiff_core::{CloseReason, ConnectorState, Side};

#[derive(Debug, Clone)]
enum Op {
    CloseRead,
    CloseWrite,
    Close,
    Fail,
    TakeClosed,
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        Just(Op::CloseRead),
        Just(Op::CloseWrite),
        Just(Op::Close),
        Just(Op::Fail),
        Just(Op::TakeClosed),
    ]
}

/// Reference model: two sides and a reported flag.
#[derive(Debug, Default)]
struct Model {
    read_open: bool,
    write_open: bool,
    reported: bool,
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    /// Property: closed iff neither side is open, for every prefix of ops.
    #[test]
    fn prop_closed_iff_both_sides_done(ops in prop::collection::vec(op_strategy(), 0..32)) {
        let mut state = ConnectorState::new();
        let mut model = Model { read_open: true, write_open: true, reported: false };

        for op in ops {
            match op {
                Op::CloseRead => {
                    let changed = state.close_read(CloseReason::PeerClosed);
                    prop_assert_eq!(changed, model.read_open);
                    model.read_open = false;
                },
                Op::CloseWrite => {
                    let changed = state.close_write(CloseReason::Local);
                    prop_assert_eq!(changed, model.write_open);
                    model.write_open = false;
                },
                Op::Close => {
                    let changed = state.close(CloseReason::Local);
                    prop_assert_eq!(changed, model.read_open || model.write_open);
                    model.read_open = false;
                    model.write_open = false;
                },
                Op::Fail => {
                    let changed = state.fail(CloseReason::Io("reset".to_string()));
                    prop_assert_eq!(changed, model.read_open || model.write_open);
                    model.read_open = false;
                    model.write_open = false;
                },
                Op::TakeClosed => {
                    let expected = !model.read_open && !model.write_open && !model.reported;
                    prop_assert_eq!(state.take_closed_event(), expected);
                    if expected {
                        model.reported = true;
                    }
                },
            }

            prop_assert_eq!(state.read().is_open(), model.read_open);
            prop_assert_eq!(state.write().is_open(), model.write_open);
            prop_assert_eq!(state.is_closed(), !model.read_open && !model.write_open);
        }
    }

    /// Property: once a side leaves Open it never returns.
    #[test]
    fn prop_sides_never_reopen(ops in prop::collection::vec(op_strategy(), 0..32)) {
        let mut state = ConnectorState::new();
        let mut read_done = false;
        let mut write_done = false;

        for op in ops {
            match op {
                Op::CloseRead => { state.close_read(CloseReason::PeerClosed); },
                Op::CloseWrite => { state.close_write(CloseReason::Local); },
                Op::Close => { state.close(CloseReason::Local); },
                Op::Fail => { state.fail(CloseReason::Io("reset".to_string())); },
                Op::TakeClosed => { state.take_closed_event(); },
            }

            if read_done {
                prop_assert_ne!(state.read(), Side::Open);
            }
            if write_done {
                prop_assert_ne!(state.write(), Side::Open);
            }
            read_done |= !state.read().is_open();
            write_done |= !state.write().is_open();
        }
    }

    /// Property: the first recorded reason sticks.
    #[test]
    fn prop_first_reason_wins(ops in prop::collection::vec(op_strategy(), 1..16)) {
        let mut state = ConnectorState::new();
        let mut first: Option<CloseReason> = None;

        for op in ops {
            let (reason, changed) = match op {
                Op::CloseRead => (CloseReason::PeerClosed, state.close_read(CloseReason::PeerClosed)),
                Op::CloseWrite => (CloseReason::Local, state.close_write(CloseReason::Local)),
                Op::Close => (CloseReason::Local, state.close(CloseReason::Local)),
                Op::Fail => {
                    let reason = CloseReason::Io("reset".to_string());
                    (reason.clone(), state.fail(reason))
                },
                Op::TakeClosed => continue,
            };
            if changed && first.is_none() {
                first = Some(reason);
            }
        }

        prop_assert_eq!(state.reason(), first.as_ref());
    }
}
