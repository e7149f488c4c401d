//! End-to-end scenarios over loopback.
//!
//! Every scenario runs once per I/O driver available on the host. Each test
//! owns a distinct port range so tests can run in parallel.

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, TcpListener};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use tpc_core::error::ErrorCode;
use tpc_engine::ops::{parse_lookup, upsert_payload};
use tpc_engine::{
    Address, Engine, EngineConfig, EngineContext, InvocationFuture, Opcode, Request,
    StaticOwnership, TpcError,
};
use tpc_module::DriverKind;

const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);
const WAIT: Duration = Duration::from_secs(15);

fn drivers() -> Vec<DriverKind> {
    let mut kinds = vec![DriverKind::Poll];
    if tpc_module::new_driver(DriverKind::IoUring, 8).is_ok() {
        kinds.push(DriverKind::IoUring);
    }
    kinds
}

fn config(kind: DriverKind, reactors: usize, port_start: u16) -> EngineConfig {
    EngineConfig::default()
        .reactor_count(reactors)
        .bind_host(LOCALHOST)
        .port_range(port_start, port_start + 99)
        .driver(kind)
        .connect_timeout(Duration::from_secs(2))
        .connect_retries(1, Duration::from_millis(10))
        .termination_timeout(Duration::from_secs(5))
}

fn start(config: EngineConfig, ownership: Arc<StaticOwnership>) -> Engine {
    let engine = Engine::new(config, EngineContext::new(ownership)).unwrap();
    engine.start().unwrap();
    engine
}

fn wait(fut: InvocationFuture) -> Result<Bytes, TpcError> {
    fut.wait_timeout(WAIT).expect("invocation did not complete")
}

#[test]
fn test_local_partition_never_touches_sockets() {
    for (k, kind) in drivers().into_iter().enumerate() {
        let ownership = Arc::new(StaticOwnership::new());
        let engine = start(config(kind, 2, 24000 + 100 * k as u16), ownership.clone());
        ownership.assign(3, engine.local_address().unwrap());

        let out = wait(engine.invoke(Request::new(Opcode::Echo, 3, "hello"))).unwrap();
        assert_eq!(out, Bytes::from_static(b"hello"));

        let prev = wait(engine.invoke(Request::new(Opcode::TableUpsert, 3, upsert_payload(b"k", b"v"))));
        assert_eq!(prev.map(parse_lookup), Ok(None));
        let found = wait(engine.invoke(Request::new(Opcode::TableSelectByKey, 3, "k"))).unwrap();
        assert_eq!(parse_lookup(found), Some(Bytes::from_static(b"v")));

        // Fire-and-forget completes on hand-off.
        let evicted = engine.invoke(Request::new(Opcode::TableEvict, 3, "k"));
        assert_eq!(wait(evicted), Ok(Bytes::new()));
        let found = wait(engine.invoke(Request::new(Opcode::TableSelectByKey, 3, "k"))).unwrap();
        assert_eq!(parse_lookup(found), None);

        for i in 0..engine.reactor_count() {
            let stats = engine.reactor_stats(i).unwrap();
            assert_eq!(stats.accepted, 0);
            assert_eq!(stats.connects, 0);
            assert_eq!(stats.messages_in, 0);
        }
        assert_eq!(engine.outstanding_invocations(), 0);
    }
}

#[test]
fn test_concurrent_local_invocations_complete_once() {
    for (k, kind) in drivers().into_iter().enumerate() {
        let ownership = Arc::new(StaticOwnership::new());
        let engine = Arc::new(start(config(kind, 2, 24200 + 100 * k as u16), ownership.clone()));
        ownership.set_default(engine.local_address());

        let handles: Vec<_> = (0..8u32)
            .map(|t| {
                let engine = engine.clone();
                thread::spawn(move || {
                    (0..200u32)
                        .map(|i| {
                            let payload = Bytes::from(format!("{t}:{i}"));
                            let fut = engine.invoke(Request::new(Opcode::Echo, 3, payload.clone()));
                            let id = fut.correlation_id();
                            assert_eq!(wait(fut), Ok(payload));
                            id
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut seen = HashSet::new();
        for h in handles {
            for id in h.join().unwrap() {
                assert!(seen.insert(id), "correlation id {id} reused");
            }
        }
        assert_eq!(seen.len(), 1600);
        assert_eq!(engine.outstanding_invocations(), 0);
    }
}

#[test]
fn test_remote_partition_single_connection() {
    for (k, kind) in drivers().into_iter().enumerate() {
        let base = 24400 + 200 * k as u16;
        let owner = start(config(kind, 2, base + 100), Arc::new(StaticOwnership::new()));
        let owner_addr = owner.local_address().unwrap();

        let ownership = Arc::new(StaticOwnership::new());
        ownership.assign(7, owner_addr);
        let engine = Arc::new(start(config(kind, 2, base), ownership));

        let barrier = Arc::new(Barrier::new(16));
        let handles: Vec<_> = (0..16u8)
            .map(|t| {
                let engine = engine.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    let payload = Bytes::from(vec![t; 64]);
                    let fut = engine.invoke(Request::new(Opcode::Echo, 7, payload.clone()));
                    assert_eq!(wait(fut), Ok(payload));
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(engine.connect_requests(&owner_addr), 1);

        // Tables live on the owner; fire-and-forget keeps channel order.
        let prev = wait(engine.invoke(Request::new(Opcode::TableUpsert, 7, upsert_payload(b"a", b"1"))));
        assert_eq!(prev.map(parse_lookup), Ok(None));
        wait(engine.invoke(Request::new(Opcode::TableEvict, 7, "a"))).unwrap();
        let found = wait(engine.invoke(Request::new(Opcode::TableSelectByKey, 7, "a"))).unwrap();
        assert_eq!(parse_lookup(found), None);

        assert_eq!(engine.connect_requests(&owner_addr), 1);
        let index = owner.reactor_index(7);
        assert_eq!(owner.reactor_stats(index).unwrap().accepted, 1);
    }
}

#[test]
fn test_fragmented_large_payload() {
    for (k, kind) in drivers().into_iter().enumerate() {
        let base = 24800 + 200 * k as u16;
        let owner = start(config(kind, 1, base + 100), Arc::new(StaticOwnership::new()));
        let ownership = Arc::new(StaticOwnership::all_to(owner.local_address().unwrap()));
        let engine = start(config(kind, 1, base).fragment_threshold(16 * 1024), ownership);

        let payload: Bytes = (0..1024 * 1024).map(|i| (i % 251) as u8).collect::<Vec<_>>().into();
        let out = wait(engine.invoke(Request::new(Opcode::Echo, 11, payload.clone()))).unwrap();
        assert_eq!(out.len(), payload.len());
        assert_eq!(out, payload);
        assert_eq!(engine.reactor_stats(0).unwrap().messages_in, 1);
        // 1 MiB over the owner's default 64 KiB threshold.
        assert_eq!(owner.reactor_stats(0).unwrap().frames_out, 16);
    }
}

#[test]
fn test_unknown_opcode_reported_not_fatal() {
    for (k, kind) in drivers().into_iter().enumerate() {
        let base = 25200 + 200 * k as u16;
        let owner = start(config(kind, 1, base + 100), Arc::new(StaticOwnership::new()));
        let ownership = Arc::new(StaticOwnership::new());
        let engine = start(config(kind, 1, base), ownership.clone());
        ownership.assign(1, engine.local_address().unwrap());
        ownership.assign(2, owner.local_address().unwrap());

        for partition in [1, 2] {
            let err = wait(engine.invoke(Request::raw(200, partition, "?"))).unwrap_err();
            match err {
                TpcError::Remote { code, .. } => assert_eq!(code, ErrorCode::UnknownOpcode),
                other => panic!("unexpected error {other:?}"),
            }
            // The reactor is still serving.
            let ok = wait(engine.invoke(Request::new(Opcode::Ping, partition, Bytes::new())));
            assert_eq!(ok, Ok(Bytes::new()));
        }
    }
}

#[test]
fn test_routing_errors() {
    let ownership = Arc::new(StaticOwnership::new());
    let engine = start(config(DriverKind::Poll, 1, 25600), ownership.clone());

    let err = wait(engine.invoke(Request::new(Opcode::Ping, 5, Bytes::new())));
    assert_eq!(err, Err(TpcError::NoOwner(5)));
    let err = wait(engine.invoke(Request::new(Opcode::Ping, -1, Bytes::new())));
    assert_eq!(err, Err(TpcError::InvalidPartition(-1)));
    assert!(engine.start().is_err());
}

#[test]
fn test_failed_bind_leaves_engine_restartable() {
    let ownership = Arc::new(StaticOwnership::new());
    let config = config(DriverKind::Poll, 2, 26700).port_range(26700, 26701);
    let engine = Engine::new(config, EngineContext::new(ownership.clone())).unwrap();

    let held: Vec<_> = (26700..=26701)
        .map(|port| TcpListener::bind((LOCALHOST, port)).unwrap())
        .collect();
    assert!(matches!(engine.start(), Err(TpcError::Bind(_))));
    assert_eq!(engine.local_address(), None);

    drop(held);
    engine.start().unwrap();
    let local = engine.local_address().unwrap();
    assert_eq!(local.port(), 26700);
    ownership.set_default(Some(local));
    let out = wait(engine.invoke(Request::new(Opcode::Echo, 1, "bound")));
    assert_eq!(out, Ok(Bytes::from_static(b"bound")));
    assert!(matches!(engine.start(), Err(TpcError::Config(_))));
}

#[test]
fn test_shutdown_fails_outstanding_and_is_idempotent() {
    for (k, kind) in drivers().into_iter().enumerate() {
        // Accepts connections, never answers.
        let silent = TcpListener::bind((LOCALHOST, 0)).unwrap();
        let peer = Address::from(silent.local_addr().unwrap());
        let ownership = Arc::new(StaticOwnership::all_to(peer));
        let engine = start(config(kind, 1, 25800 + 100 * k as u16), ownership);

        let pending: Vec<_> = (0..4)
            .map(|p| engine.invoke(Request::new(Opcode::Echo, p, "never answered")))
            .collect();
        thread::sleep(Duration::from_millis(100));
        assert!(pending.iter().all(|f| !f.is_done()));
        assert_eq!(engine.outstanding_invocations(), 4);

        engine.shutdown();
        engine.shutdown();
        for fut in pending {
            assert_eq!(wait(fut), Err(TpcError::ShuttingDown));
        }
        assert!(engine.await_termination(Duration::from_secs(5)));
        assert!(engine.await_termination(Duration::from_millis(1)));
        assert_eq!(engine.outstanding_invocations(), 0);

        let late = engine.invoke(Request::new(Opcode::Echo, 0, "late"));
        assert_eq!(wait(late), Err(TpcError::ShuttingDown));
    }
}

#[test]
fn test_connect_refused() {
    for (k, kind) in drivers().into_iter().enumerate() {
        let closed_port = TcpListener::bind((LOCALHOST, 0))
            .unwrap()
            .local_addr()
            .unwrap();
        let peer = Address::from(closed_port);
        let ownership = Arc::new(StaticOwnership::all_to(peer));
        let engine = start(config(kind, 1, 26000 + 100 * k as u16), ownership);

        let err = wait(engine.invoke(Request::new(Opcode::Ping, 1, Bytes::new()))).unwrap_err();
        match err {
            TpcError::Connect { addr, .. } => assert_eq!(addr, closed_port),
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(engine.outstanding_invocations(), 0);

        // The link went back to idle; the next call starts a new connection.
        let err = wait(engine.invoke(Request::new(Opcode::Ping, 1, Bytes::new())));
        assert!(matches!(err, Err(TpcError::Connect { .. })));
        assert!(engine.connect_requests(&peer) >= 2);
    }
}

#[test]
fn test_request_forwarded_to_owning_reactor() {
    for (k, kind) in drivers().into_iter().enumerate() {
        let base = 26200 + 200 * k as u16;
        // Two reactors on the receiving side, one on the sending side: every
        // request arrives on reactor 0 of the receiver.
        let receiver = start(config(kind, 2, base + 100), Arc::new(StaticOwnership::new()));
        let ownership = Arc::new(StaticOwnership::all_to(receiver.local_address().unwrap()));
        let sender = start(config(kind, 1, base), ownership);

        for partition in [1, 3, 5] {
            let payload = Bytes::from(format!("partition {partition}"));
            let out = wait(sender.invoke(Request::new(Opcode::Echo, partition, payload.clone())));
            assert_eq!(out, Ok(payload));
        }

        let r0 = receiver.reactor_stats(0).unwrap();
        let r1 = receiver.reactor_stats(1).unwrap();
        assert_eq!(r0.accepted, 1);
        assert_eq!(r1.accepted, 0);
        // Forward tasks on reactor 1, reply tasks back on reactor 0.
        assert!(r1.tasks >= 3);
        assert!(r0.tasks >= 3);
        assert_eq!(r0.frames_out, 0);
        assert_eq!(r1.frames_out, 3);
    }
}
