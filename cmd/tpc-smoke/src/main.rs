//! TPC End-to-End Smoke Test
//!
//! Starts two engines on loopback and drives them through every path:
//!   Part A, Lifecycle (config, start, listener layout)
//!   Part B, Local invocations (no socket involved)
//!   Part C, Remote invocations (lazy connect, fragmentation, concurrency)
//!   Part D, Failure reporting (unknown opcode, routing errors)
//!   Part E, Shutdown (idempotence, outstanding invocations, termination)
//!
//! Run: RUST_LOG=info ./target/release/tpc-smoke
//! Engine settings come from TPC_* variables (see `EngineConfig::from_env`).

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tpc_core::error::ErrorCode;
use tpc_engine::ops::{parse_lookup, upsert_payload};
use tpc_engine::{
    Address, Engine, EngineConfig, EngineContext, Opcode, Request,
    StaticOwnership, TpcError,
};
use tracing_subscriber::EnvFilter;

const WAIT: Duration = Duration::from_secs(10);

/// Partition served by the engine that issues the calls.
const LOCAL_PARTITION: i32 = 3;
/// Partition owned by the peer engine.
const REMOTE_PARTITION: i32 = 7;

// ── Report ──

struct Outcome {
    part: char,
    name: String,
    verdict: Result<(), String>,
    /// Set for checks that timed one invocation.
    latency: Option<Duration>,
}

#[derive(Default)]
struct Report {
    part: char,
    outcomes: Vec<Outcome>,
}

impl Report {
    fn part(&mut self, id: char, title: &str) {
        self.part = id;
        println!("\n== Part {id}: {title} ==");
    }

    fn record(&mut self, name: &str, verdict: Result<(), String>, latency: Option<Duration>) {
        let seq = self.outcomes.iter().filter(|o| o.part == self.part).count() + 1;
        let timing = latency.map(|d| format!(" ({d:.1?})")).unwrap_or_default();
        match &verdict {
            Ok(()) => println!("  {}{seq:<3} {name:<48} ok{timing}", self.part),
            Err(why) => println!("  {}{seq:<3} {name:<48} FAIL{timing}: {why}", self.part),
        }
        self.outcomes.push(Outcome {
            part: self.part,
            name: name.to_string(),
            verdict,
            latency,
        });
    }

    fn ensure(&mut self, name: &str, ok: bool, reason: &str) {
        let verdict = if ok { Ok(()) } else { Err(reason.to_string()) };
        self.record(name, verdict, None);
    }

    /// Invoke once and compare the outcome, timing the round trip.
    fn invoke(&mut self, name: &str, engine: &Engine, request: Request, expected: Result<Bytes, TpcError>) {
        let started = Instant::now();
        let got = engine.invoke(request).wait_timeout(WAIT);
        let latency = started.elapsed();
        let verdict = match got {
            Some(got) if got == expected => Ok(()),
            Some(Ok(bytes)) => Err(format!("got {} bytes, expected {}", bytes.len(), describe(&expected))),
            Some(Err(e)) => Err(format!("got {}, expected {}", describe_err(&e), describe(&expected))),
            None => Err("timed out".to_string()),
        };
        self.record(name, verdict, Some(latency));
    }

    fn failed(&self) -> usize {
        self.outcomes.iter().filter(|o| o.verdict.is_err()).count()
    }

    fn summary(&self) {
        println!("\n== Summary ==");
        let mut parts: Vec<char> = self.outcomes.iter().map(|o| o.part).collect();
        parts.dedup();
        for part in parts {
            let rows: Vec<_> = self.outcomes.iter().filter(|o| o.part == part).collect();
            let ok = rows.iter().filter(|o| o.verdict.is_ok()).count();
            let slowest = rows
                .iter()
                .filter_map(|o| o.latency.map(|d| (d, o.name.as_str())))
                .max_by_key(|(d, _)| *d);
            match slowest {
                Some((d, name)) => println!("  Part {part}: {ok}/{}  slowest call: {name} ({d:.1?})", rows.len()),
                None => println!("  Part {part}: {ok}/{}", rows.len()),
            }
        }
        println!("  Failed: {}", self.failed());
    }
}

fn describe(expected: &Result<Bytes, TpcError>) -> String {
    match expected {
        Ok(bytes) => format!("{} bytes", bytes.len()),
        Err(e) => describe_err(e),
    }
}

/// Error text with the wire error code, when the peer sent one.
fn describe_err(err: &TpcError) -> String {
    match err {
        TpcError::Remote { code, message } => format!("[{code:?}] {message}"),
        other => format!("[{other:?}]"),
    }
}

fn call(engine: &Engine, op: Opcode, partition: i32, payload: impl Into<Bytes>) -> Result<Bytes, TpcError> {
    engine
        .invoke(Request::new(op, partition, payload))
        .wait_timeout(WAIT)
        .unwrap_or_else(|| Err(TpcError::Transport("timed out".into())))
}

// ════════════════════════════════════════════════════════════
// Part A: Lifecycle
// ════════════════════════════════════════════════════════════

fn test_lifecycle(t: &mut Report, config: &EngineConfig) -> Option<(Engine, Engine, Arc<StaticOwnership>)> {
    t.part('A', "Lifecycle");

    t.ensure("config validates", config.validate().is_ok(), "invalid TPC_* settings");

    let peer = match Engine::new(config.clone(), EngineContext::new(Arc::new(StaticOwnership::new()))) {
        Ok(e) => e,
        Err(e) => {
            t.record("build peer engine", Err(describe_err(&e)), None);
            return None;
        }
    };
    let ownership = Arc::new(StaticOwnership::new());
    let engine = match Engine::new(config.clone(), EngineContext::new(ownership.clone())) {
        Ok(e) => e,
        Err(e) => {
            t.record("build engine", Err(describe_err(&e)), None);
            return None;
        }
    };

    t.ensure(
        "invoke before start → NotStarted",
        engine.invoke(Request::new(Opcode::Ping, 0, Bytes::new())).wait() == Err(TpcError::NotStarted),
        "expected NotStarted",
    );

    for (name, e) in [("start peer engine", &peer), ("start engine", &engine)] {
        if let Err(err) = e.start() {
            t.record(name, Err(describe_err(&err)), None);
            return None;
        }
        t.ensure(name, true, "");
    }
    t.ensure("second start rejected", engine.start().is_err(), "start succeeded twice");

    let (Some(local), Some(remote)) = (engine.local_address(), peer.local_address()) else {
        t.ensure("local addresses", false, "engine did not record its address");
        return None;
    };
    println!("       engine at {} ({} reactors), peer at {}", local, engine.reactor_count(), remote);
    t.ensure(
        "listener groups do not overlap",
        local.port().abs_diff(remote.port()) as usize >= engine.reactor_count(),
        "port groups overlap",
    );

    ownership.set_default(Some(remote));
    ownership.assign(LOCAL_PARTITION, local);
    Some((engine, peer, ownership))
}

// ════════════════════════════════════════════════════════════
// Part B: Local invocations
// ════════════════════════════════════════════════════════════

fn test_local(t: &mut Report, engine: &Engine) {
    t.part('B', "Local invocations");

    t.invoke(
        "echo on local partition",
        engine,
        Request::new(Opcode::Echo, LOCAL_PARTITION, "hello"),
        Ok(Bytes::from_static(b"hello")),
    );

    let prev = call(engine, Opcode::TableUpsert, LOCAL_PARTITION, upsert_payload(b"k", b"v1"));
    t.ensure("upsert new key", prev.map(parse_lookup) == Ok(None), "unexpected previous value");
    let prev = call(engine, Opcode::TableUpsert, LOCAL_PARTITION, upsert_payload(b"k", b"v2"));
    t.ensure(
        "upsert returns previous value",
        prev.map(parse_lookup) == Ok(Some(Bytes::from_static(b"v1"))),
        "previous value lost",
    );
    let found = call(engine, Opcode::TableSelectByKey, LOCAL_PARTITION, "k");
    t.ensure(
        "select by key",
        found.map(parse_lookup) == Ok(Some(Bytes::from_static(b"v2"))),
        "wrong value",
    );
    t.invoke(
        "evict (fire-and-forget)",
        engine,
        Request::new(Opcode::TableEvict, LOCAL_PARTITION, "k"),
        Ok(Bytes::new()),
    );
    let found = call(engine, Opcode::TableSelectByKey, LOCAL_PARTITION, "k");
    t.ensure("evicted key gone", found.map(parse_lookup) == Ok(None), "key still present");

    let idle = (0..engine.reactor_count())
        .filter_map(|i| engine.reactor_stats(i))
        .all(|s| s.accepted == 0 && s.connects == 0);
    t.ensure("no socket touched", idle, "local path opened a connection");
}

// ════════════════════════════════════════════════════════════
// Part C: Remote invocations
// ════════════════════════════════════════════════════════════

fn test_remote(t: &mut Report, engine: &Arc<Engine>, peer: Address) {
    t.part('C', "Remote invocations");

    let started = Instant::now();
    let handles: Vec<_> = (0..16u8)
        .map(|i| {
            let engine = engine.clone();
            thread::spawn(move || {
                let payload = Bytes::from(vec![i; 128]);
                call(&engine, Opcode::Echo, REMOTE_PARTITION, payload.clone()) == Ok(payload)
            })
        })
        .collect();
    let ok = handles.into_iter().all(|h| h.join().unwrap_or(false));
    t.ensure("16 concurrent echoes on first use", ok, "echo mismatch");
    println!("       first round trip batch: {:?}", started.elapsed());
    t.ensure(
        "exactly one connection",
        engine.connect_requests(&peer) == 1,
        &format!("{} connections", engine.connect_requests(&peer)),
    );

    let payload: Bytes = (0..1024 * 1024).map(|i| (i % 251) as u8).collect::<Vec<_>>().into();
    let started = Instant::now();
    t.ensure(
        "1 MiB fragmented echo",
        call(engine, Opcode::Echo, REMOTE_PARTITION, payload.clone()) == Ok(payload),
        "payload corrupted",
    );
    println!("       1 MiB round trip: {:?}", started.elapsed());

    let prev = call(engine, Opcode::TableUpsert, REMOTE_PARTITION, upsert_payload(b"r", b"1"));
    t.ensure("remote upsert", prev.map(parse_lookup) == Ok(None), "unexpected previous value");
    let found = call(engine, Opcode::TableSelectByKey, REMOTE_PARTITION, "r");
    t.ensure(
        "remote select",
        found.map(parse_lookup) == Ok(Some(Bytes::from_static(b"1"))),
        "wrong value",
    );

    const ROUNDS: u32 = 10_000;
    let started = Instant::now();
    let futures: Vec<_> = (0..ROUNDS)
        .map(|_| engine.invoke(Request::new(Opcode::Ping, REMOTE_PARTITION, Bytes::new())))
        .collect();
    let ok = futures
        .into_iter()
        .all(|f| f.wait_timeout(WAIT) == Some(Ok(Bytes::new())));
    let elapsed = started.elapsed();
    t.ensure("10k pipelined pings", ok, "ping failed");
    println!(
        "       {} pings in {:?} ({:.0} ops/s)",
        ROUNDS,
        elapsed,
        f64::from(ROUNDS) / elapsed.as_secs_f64()
    );
}

// ════════════════════════════════════════════════════════════
// Part D: Failure reporting
// ════════════════════════════════════════════════════════════

fn test_failures(t: &mut Report, engine: &Engine) {
    t.part('D', "Failure reporting");

    for (name, partition) in [("unknown opcode (local)", LOCAL_PARTITION), ("unknown opcode (remote)", REMOTE_PARTITION)] {
        let got = engine.invoke(Request::raw(250, partition, Bytes::new())).wait_timeout(WAIT);
        let ok = matches!(got, Some(Err(TpcError::Remote { code: ErrorCode::UnknownOpcode, .. })));
        t.ensure(name, ok, &format!("got {:?}", got));
    }
    t.invoke(
        "reactor survives unknown opcode",
        engine,
        Request::new(Opcode::Ping, REMOTE_PARTITION, Bytes::new()),
        Ok(Bytes::new()),
    );
    t.invoke(
        "negative partition rejected",
        engine,
        Request::new(Opcode::Ping, -4, Bytes::new()),
        Err(TpcError::InvalidPartition(-4)),
    );
}

// ════════════════════════════════════════════════════════════
// Part E: Shutdown
// ════════════════════════════════════════════════════════════

fn test_shutdown(t: &mut Report, engine: &Engine, peer: &Engine) {
    t.part('E', "Shutdown");

    engine.shutdown();
    engine.shutdown();
    t.ensure("shutdown twice", true, "");
    t.invoke(
        "invoke after shutdown",
        engine,
        Request::new(Opcode::Echo, LOCAL_PARTITION, "late"),
        Err(TpcError::ShuttingDown),
    );

    let timeout = engine.config().termination_timeout;
    t.ensure("engine terminated", engine.await_termination(timeout), "reactors still running");
    t.ensure("no invocation left", engine.outstanding_invocations() == 0, "invocations leaked");

    peer.shutdown();
    t.ensure("peer terminated", peer.await_termination(timeout), "reactors still running");
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_thread_names(true)
        .init();

    println!("=== TPC End-to-End Smoke Test ===");
    let config = EngineConfig::from_env();
    println!(
        "    reactors: {}  driver: {}  scheduling: {}  ports: {}..={}",
        config.reactor_count, config.driver, config.scheduling, config.port_start, config.port_end
    );

    let mut t = Report::default();

    let Some((engine, peer, _ownership)) = test_lifecycle(&mut t, &config) else {
        t.summary();
        std::process::exit(1);
    };
    let peer_addr = peer.local_address();
    let engine = Arc::new(engine);

    test_local(&mut t, &engine);
    if let Some(addr) = peer_addr {
        test_remote(&mut t, &engine, addr);
    }
    test_failures(&mut t, &engine);
    test_shutdown(&mut t, &engine, &peer);

    t.summary();
    if t.failed() > 0 {
        std::process::exit(1);
    }
}
