//! End-to-end tests of the readiness loop over loopback sockets.

use std::{
    io::{Read, Write},
    net::Shutdown,
    thread,
    time::{Duration, Instant},
};

use skiff_driver::{
    CloseReason, Connector, ConnectorId, Driver, DriverConfig, EngineError, ErrorCode, Side,
};
use skiff_harness::{RecordingEngine, pump_until, run_cycle, socket_pair};

const LIMIT: Duration = Duration::from_secs(5);

fn driver() -> Driver<RecordingEngine> {
    Driver::new(DriverConfig::default()).unwrap()
}

fn engine(driver: &Driver<RecordingEngine>, id: ConnectorId) -> &RecordingEngine {
    driver.connector(id).unwrap().connection().unwrap()
}

/// Adopt the server half of a socket pair; returns the client half.
fn adopt(driver: &mut Driver<RecordingEngine>, engine: RecordingEngine) -> (std::net::TcpStream, ConnectorId) {
    let (client, server) = socket_pair().unwrap();
    let id = driver.connect_std(server, ()).unwrap();
    driver.connector_mut(id).unwrap().set_connection(engine);
    (client, id)
}

#[test]
fn ping_round_trip() {
    let mut driver = driver();
    let listener = driver.listen("127.0.0.1", "0", ()).unwrap();
    let port = driver.local_addr(listener).unwrap().port();

    let client = driver.connect("127.0.0.1", &port.to_string(), ()).unwrap();
    let mut ping = RecordingEngine::new();
    ping.send(b"PING");
    ping.close();
    driver.connector_mut(client).unwrap().set_connection(ping);

    let history = pump_until(&mut driver, LIMIT, RecordingEngine::echo, |_, h| h.closed.len() == 2)
        .unwrap()
        .expect("both connectors close");

    let server = history.accepted[0];
    assert_eq!(driver.connector(server).unwrap().listener(), Some(listener));
    assert_eq!(driver.connector(client).unwrap().listener(), None);
    assert_eq!(engine(&driver, server).received(), b"PING");
    assert_eq!(engine(&driver, client).received(), b"PING");
    assert_eq!(engine(&driver, client).input_closed_count(), 1);
    assert_eq!(driver.connector(client).unwrap().close_reason(), Some(&CloseReason::Local));
}

#[test]
fn accepted_connectors_follow_insertion_order() {
    let mut driver = driver();
    let listener = driver.listen("127.0.0.1", "0", ()).unwrap();
    let addr = driver.local_addr(listener).unwrap();

    let _first = std::net::TcpStream::connect(addr).unwrap();
    let _second = std::net::TcpStream::connect(addr).unwrap();

    let history = pump_until(&mut driver, LIMIT, RecordingEngine::new, |_, h| h.accepted.len() == 2)
        .unwrap()
        .expect("both accepted");

    assert!(history.accepted[0] < history.accepted[1]);
    assert_eq!(driver.connector_head(), Some(history.accepted[0]));
    assert_eq!(driver.connector_next(history.accepted[0]), Some(history.accepted[1]));
    assert_eq!(driver.connector_next(history.accepted[1]), None);
}

#[test]
fn half_close_then_close_reported_once() {
    let mut driver = driver();
    let (mut client, id) = adopt(&mut driver, RecordingEngine::new());

    client.write_all(b"abc").unwrap();
    client.shutdown(Shutdown::Write).unwrap();

    pump_until(&mut driver, LIMIT, RecordingEngine::new, |d, _| {
        engine(d, id).input_closed_count() == 1
    })
    .unwrap()
    .expect("end of input seen");

    let connector = driver.connector(id).unwrap();
    assert_eq!(engine(&driver, id).received(), b"abc");
    assert_eq!(connector.state().read(), Side::HalfClosed);
    assert_eq!(connector.state().write(), Side::Open);
    assert!(!connector.is_closed());

    driver.connector_mut(id).unwrap().connection_mut().unwrap().close();
    let history = pump_until(&mut driver, LIMIT, RecordingEngine::new, |_, h| !h.closed.is_empty())
        .unwrap()
        .expect("closure reported");
    assert_eq!(history.closed, vec![id]);

    let mut rest = Vec::new();
    client.read_to_end(&mut rest).unwrap();
    assert!(rest.is_empty());

    let mut later = Vec::new();
    for _ in 0..5 {
        later.extend(run_cycle(&mut driver, Duration::from_millis(5), &mut RecordingEngine::new).unwrap().closed);
    }
    assert!(later.is_empty());
    assert_eq!(engine(&driver, id).input_closed_count(), 1);

    let freed = driver.free_connector(id).unwrap();
    assert!(freed.is_closed());
    assert!(driver.connector(id).is_none());
}

#[test]
fn tick_deadline_caps_wait() {
    let mut driver = driver();
    let (_client, id) = adopt(&mut driver, RecordingEngine::new());
    run_cycle(&mut driver, Duration::ZERO, &mut RecordingEngine::new).unwrap();

    let deadline = Instant::now() + Duration::from_millis(50);
    driver.connector_mut(id).unwrap().connection_mut().unwrap().schedule_tick(deadline);

    let start = Instant::now();
    driver.wait(Some(Duration::from_secs(5))).unwrap();
    let returned = Instant::now();
    assert!(returned + Duration::from_millis(5) >= deadline, "woke {:?} early", deadline - returned);
    assert!(start.elapsed() < Duration::from_millis(250));

    pump_until(&mut driver, LIMIT, RecordingEngine::new, |d, _| !engine(d, id).ticks().is_empty())
        .unwrap()
        .expect("tick ran");
    assert!(engine(&driver, id).ticks()[0] >= deadline);

    for _ in 0..3 {
        run_cycle(&mut driver, Duration::from_millis(5), &mut RecordingEngine::new).unwrap();
    }
    assert_eq!(engine(&driver, id).ticks().len(), 1);
}

#[test]
fn closed_connectors_are_freed_by_the_loop() {
    let mut driver = driver();
    let mut closing = RecordingEngine::new();
    closing.send(b"bye");
    closing.close();
    let (client, id) = adopt(&mut driver, closing);
    drop(client);

    let start = Instant::now();
    while driver.connector(id).is_some() {
        assert!(start.elapsed() < LIMIT, "connector never freed");
        driver.wait(Some(Duration::from_millis(10))).unwrap();
        while let Some(c) = driver.next_pending_connector() {
            if driver.connector(c).is_some_and(Connector::is_closed) {
                driver.free_connector(c);
            } else {
                driver.process(c).unwrap();
            }
        }
    }

    for _ in 0..3 {
        driver.wait(Some(Duration::from_millis(5))).unwrap();
        assert_eq!(driver.next_pending_connector(), None);
    }
}

#[test]
fn wakeup_before_wait_returns_immediately() {
    let mut driver = driver();
    driver.wakeup().unwrap();

    let start = Instant::now();
    driver.wait(None).unwrap();
    assert!(start.elapsed() < Duration::from_secs(1));
}

#[test]
fn wakeup_from_another_thread() {
    let mut driver = driver();
    let waker = driver.waker();

    let handle = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        waker.wake().unwrap();
    });

    let start = Instant::now();
    driver.wait(None).unwrap();
    assert!(start.elapsed() < Duration::from_secs(5));
    handle.join().unwrap();
}

#[test]
fn engine_error_fails_both_sides() {
    let mut driver = driver();
    let failing = RecordingEngine::new().failing_with(EngineError::Protocol("bad header".to_string()));
    let (mut client, id) = adopt(&mut driver, failing);

    client.write_all(b"garbage").unwrap();
    pump_until(&mut driver, LIMIT, RecordingEngine::new, |_, h| h.closed.contains(&id))
        .unwrap()
        .expect("connector fails");

    let connector = driver.connector(id).unwrap();
    assert_eq!(connector.state().read(), Side::Errored);
    assert_eq!(connector.state().write(), Side::Errored);
    assert!(matches!(connector.close_reason(), Some(CloseReason::Engine(_))));
    assert!(engine(&driver, id).received().is_empty());
}

#[test]
fn explicit_close_is_not_reported() {
    let mut driver = driver();
    let (_client, id) = adopt(&mut driver, RecordingEngine::new());

    driver.close_connector(id).unwrap();
    assert!(driver.connector(id).unwrap().is_closed());

    for _ in 0..3 {
        let cycle = run_cycle(&mut driver, Duration::from_millis(5), &mut RecordingEngine::new).unwrap();
        assert!(cycle.closed.is_empty());
    }
    assert!(driver.free_connector(id).is_some());
}

#[test]
#[should_panic(expected = "free of open")]
fn freeing_open_connector_panics() {
    let mut driver = driver();
    let (_client, id) = adopt(&mut driver, RecordingEngine::new());
    driver.free_connector(id);
}

#[test]
#[should_panic(expected = "process called on closed")]
fn processing_closed_connector_panics() {
    let mut driver = driver();
    let (_client, id) = adopt(&mut driver, RecordingEngine::new());
    driver.close_connector(id).unwrap();
    let _ = driver.process(id);
}

#[test]
fn connect_to_closed_port_fails() {
    let port = {
        let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        probe.local_addr().unwrap().port()
    };

    let mut driver = driver();
    match driver.connect("127.0.0.1", &port.to_string(), ()) {
        Err(err) => {
            assert_eq!(err.code(), ErrorCode::Io);
            assert_eq!(driver.error_code(), ErrorCode::Io);
        },
        Ok(id) => {
            driver.connector_mut(id).unwrap().set_connection(RecordingEngine::new());
            pump_until(&mut driver, LIMIT, RecordingEngine::new, |_, h| h.closed.contains(&id))
                .unwrap()
                .expect("connect failure reported");
            let reason = driver.connector(id).unwrap().close_reason().cloned();
            assert!(matches!(reason, Some(CloseReason::ConnectFailed(_) | CloseReason::Io(_))));
        },
    }
}

#[test]
fn invalid_address_sets_error() {
    let mut driver = driver();
    let err = driver.connect("127.0.0.1", "no-such-service", ()).unwrap_err();

    assert_eq!(err.code(), ErrorCode::InvalidAddress);
    assert_eq!(driver.error_code(), ErrorCode::InvalidAddress);
    assert!(driver.error_text().contains("no-such-service"));
    assert!(driver.connector_head().is_none());
}

#[test]
fn slow_engine_gets_all_input() {
    let mut driver = driver();
    let (mut client, id) = adopt(&mut driver, RecordingEngine::new().with_chunk(3).with_capacity(8));

    let payload: Vec<u8> = (0..200u8).collect();
    client.write_all(&payload).unwrap();

    pump_until(&mut driver, LIMIT, RecordingEngine::new, |d, _| {
        engine(d, id).received().len() == payload.len()
    })
    .unwrap()
    .expect("all input delivered");
    assert_eq!(engine(&driver, id).received(), payload.as_slice());
}
