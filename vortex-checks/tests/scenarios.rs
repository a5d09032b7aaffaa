//! End-to-end scenarios (spec.md §8) driven over a real loopback socket,
//! exercising the full connect → probe → verdict → reschedule path rather
//! than any single layer in isolation.

use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use vortex_checks::check::{Check, CheckConfig, CheckKind};
use vortex_checks::clock::Clock;
use vortex_checks::driver::{run_round, DriverEnv};
use vortex_checks::hooks::NullLbHooks;
use vortex_checks::tcpcheck::{ConnectOpts, TcpCheckRule};
use vortex_checks::verdict::CheckRegistry;
use vortex_checks::CheckTask;
use vortex_core::domain::backend::{Backend, BackendId, ProxyId, ServerStateFlags};

fn http_config() -> CheckConfig {
    CheckConfig {
        kind: CheckKind::Http,
        rise: 2,
        fall: 3,
        inter_ms: 1_000,
        fastinter_ms: None,
        downinter_ms: None,
        timeout_check_ms: None,
        timeout_connect_ms: Some(1_000),
        slowstart_ms: 0,
        port: None,
        http_request: Some(b"GET / HTTP/1.0\r\n".to_vec()),
        send_state_header: false,
        expect: None,
        disable404: false,
        tcp_script: Vec::new(),
        agent_enabled: false,
        mysql_two_packet: false,
    }
}

fn env() -> DriverEnv {
    DriverEnv { tls_connector: None, tls_server_name: None, spread_checks_pct: 0 }
}

/// Scenario 1: two consecutive "200 OK" rounds carry `health` from 0 to
/// `rise`, transitioning the server to UP.
#[tokio::test]
async fn http_happy_path_reaches_up() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        for _ in 0..2 {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 256];
            let _ = stream.read(&mut buf).await;
            stream.write_all(b"HTTP/1.1 200 OK\r\n\r\n").await.unwrap();
        }
    });

    let server = Arc::new(Backend::new(BackendId(1), ProxyId(1), addr));
    server.with_state_mut(|s| s.remove(ServerStateFlags::RUNNING)); // starts DOWN, unproven
    let mut check = Check::new(http_config()).unwrap();
    check.health = 0;
    let registry = CheckRegistry::new();
    let hooks = NullLbHooks;
    let task = CheckTask::new();

    run_round(&mut check, &server, &registry, &hooks, &task, Clock::now(), &env()).await;
    assert_eq!(check.health, 1);
    assert!(!server.state().contains(ServerStateFlags::RUNNING));

    run_round(&mut check, &server, &registry, &hooks, &task, Clock::now(), &env()).await;
    assert_eq!(check.health, 2);
    assert!(server.state().contains(ServerStateFlags::RUNNING));
}

/// Scenario 2: three FAILED 503 rounds after reaching UP bring health back
/// down past the rise boundary, marking the server DOWN with `L7STS`/503.
#[tokio::test]
async fn http_flapping_marks_down() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        for _ in 0..3 {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 256];
            let _ = stream.read(&mut buf).await;
            stream.write_all(b"HTTP/1.1 503 Service Unavailable\r\n\r\n").await.unwrap();
        }
    });

    let server = Arc::new(Backend::new(BackendId(1), ProxyId(1), addr)); // RUNNING by default
    let mut check = Check::new(http_config()).unwrap();
    check.health = check.health_max(); // starts fully UP (4 with rise=2, fall=3)
    let registry = CheckRegistry::new();
    let hooks = NullLbHooks;
    let task = CheckTask::new();

    for _ in 0..3 {
        run_round(&mut check, &server, &registry, &hooks, &task, Clock::now(), &env()).await;
    }

    assert_eq!(check.health, 0);
    assert!(!server.state().contains(ServerStateFlags::RUNNING));
    assert_eq!(check.code, 503);
}

/// Scenario 6: a CONNECT/SEND/EXPECT script against a Redis-like echo server
/// advances through all three rules on a matching reply.
#[tokio::test]
async fn tcp_script_send_expect_matches() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let port = addr.port();

    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; 256];
        let n = stream.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"PING\r\n");
        stream.write_all(b"+PONG\r\n").await.unwrap();
    });

    let config = CheckConfig {
        kind: CheckKind::TcpScript,
        rise: 1,
        fall: 1,
        inter_ms: 1_000,
        fastinter_ms: None,
        downinter_ms: None,
        timeout_check_ms: None,
        timeout_connect_ms: Some(1_000),
        slowstart_ms: 0,
        port: Some(port),
        http_request: None,
        send_state_header: false,
        expect: None,
        disable404: false,
        tcp_script: vec![
            TcpCheckRule::Connect { port: None, opts: ConnectOpts::empty() },
            TcpCheckRule::Send { data: b"PING\r\n".to_vec() },
            TcpCheckRule::Expect {
                pattern: vortex_checks::probers::expect::ExpectPattern::Literal(b"+PONG".to_vec()),
                inverse: false,
            },
        ],
        agent_enabled: false,
        mysql_two_packet: false,
    };

    let server = Arc::new(Backend::new(BackendId(2), ProxyId(1), addr));
    let mut check = Check::new(config).unwrap();
    let registry = CheckRegistry::new();
    let hooks = NullLbHooks;
    let task = CheckTask::new();

    run_round(&mut check, &server, &registry, &hooks, &task, Clock::now(), &env()).await;

    assert!(server.state().contains(ServerStateFlags::RUNNING));
    assert_eq!(check.desc, "(tcp-check)");
}
