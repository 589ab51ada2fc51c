//! Property tests for byte ordering across many connectors.
//!
//! Several peers write interleaved chunks at once; every engine must see
//! exactly its own peer's bytes, in order, whatever the chunking and however
//! slowly the engine consumes.

use std::{io::Write, time::Duration};

use proptest::prelude::*;
use skiff_driver::{ConnectorId, Driver, DriverConfig};
use skiff_harness::{RecordingEngine, pump_until, socket_pair};

fn chunks_strategy() -> impl Strategy<Value = Vec<Vec<u8>>> {
    prop::collection::vec(prop::collection::vec(any::<u8>(), 1..64), 1..8)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    /// Property: interleaved writes on N connections arrive in order and
    /// isolated from each other.
    #[test]
    fn prop_interleaved_streams_stay_isolated(
        peers in prop::collection::vec((chunks_strategy(), 1usize..16), 1..5),
    ) {
        let mut driver: Driver<RecordingEngine> = Driver::new(DriverConfig::default()).unwrap();
        let mut clients = Vec::new();
        let mut ids: Vec<ConnectorId> = Vec::new();

        for (_, chunk) in &peers {
            let (client, server) = socket_pair().unwrap();
            let id = driver.connect_std(server, ()).unwrap();
            driver.connector_mut(id).unwrap().set_connection(RecordingEngine::new().with_chunk(*chunk));
            clients.push(client);
            ids.push(id);
        }

        let rounds = peers.iter().map(|(chunks, _)| chunks.len()).max().unwrap_or(0);
        for round in 0..rounds {
            for (client, (chunks, _)) in clients.iter_mut().zip(&peers) {
                if let Some(chunk) = chunks.get(round) {
                    client.write_all(chunk).unwrap();
                }
            }
        }

        let expected: Vec<Vec<u8>> = peers.iter().map(|(chunks, _)| chunks.concat()).collect();
        let done = pump_until(&mut driver, Duration::from_secs(5), RecordingEngine::new, |d, _| {
            ids.iter().zip(&expected).all(|(id, want)| {
                d.connector(*id).and_then(|c| c.connection()).is_some_and(|e| e.received().len() >= want.len())
            })
        })
        .unwrap();
        prop_assert!(done.is_some());

        for (id, want) in ids.iter().zip(&expected) {
            let engine = driver.connector(*id).unwrap().connection().unwrap();
            prop_assert_eq!(engine.received(), want.as_slice());
        }
    }
}
