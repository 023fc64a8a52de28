//! Integration tests for the labproxy motor server.
//!
//! These tests drive a `DummyMotor` server through real TCP clients and check
//! the session, admin, and non-blocking task behavior clients rely on.

use labproxy::server::TASK_STARTED;
use labproxy::{value_to_bytes, CancellationToken, ClientOptions, ClientProxy, Server, ServerOptions};
use labproxy_rpc::{DummyMotor, MotorClient};
use serde_json::{json, Map, Value};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::AsyncBufReadExt;

/// Start a motor server on an ephemeral port.
async fn start_server(options: ServerOptions) -> (Server<DummyMotor>, String) {
    let mut server = Server::<DummyMotor>::new(options).expect("Failed to build registry");
    let addr = server
        .start("127.0.0.1:0")
        .await
        .expect("Failed to start server");
    (server, addr.to_string())
}

/// Client options with fast polling.
fn client_options(name: &str) -> ClientOptions {
    ClientOptions {
        poll_interval: Duration::from_millis(20),
        ..ClientOptions::named(name)
    }
}

/// Connect a client that constructs the motor at `position` moving 10 units/s.
async fn connect(addr: &str, name: &str, position: f64) -> ClientProxy {
    ClientProxy::connect(
        addr,
        vec![json!(10.0), json!(position)],
        Map::new(),
        client_options(name),
    )
    .await
    .expect("Failed to connect")
}

/// Connect a client that never asks for admin.
async fn connect_observer(addr: &str, name: &str) -> ClientProxy {
    ClientProxy::connect(addr, vec![], Map::new(), client_options(name).observer())
        .await
        .expect("Failed to connect")
}

/// Wait until `check` holds, or fail after `timeout`.
async fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) {
    let start = Instant::now();
    while !check() {
        assert!(start.elapsed() < timeout, "condition not met within {:?}", timeout);
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn test_session_ids_are_unique_and_admin_is_exclusive() {
    let (mut server, addr) = start_server(ServerOptions::default()).await;

    let a = connect(&addr, "a", 0.0).await;
    let b = connect(&addr, "b", 0.0).await;
    let c = connect_observer(&addr, "c").await;

    assert!(a.session_id() < b.session_id());
    assert!(b.session_id() < c.session_id());

    assert!(a.is_admin().await.unwrap());
    assert!(!b.is_admin().await.unwrap());
    assert!(!c.is_admin().await.unwrap());

    let refused = b.request_admin(false).await.unwrap();
    assert!(refused.is_error());

    let forced = b.request_admin(true).await.unwrap();
    assert!(forced.is_ok());
    assert!(b.is_admin().await.unwrap());
    assert!(!a.is_admin().await.unwrap());

    for client in [a, b, c] {
        client.shutdown().await;
    }
    server.stop().await;
}

#[tokio::test]
async fn test_non_blocking_move_returns_final_position() {
    let (mut server, addr) = start_server(ServerOptions::default()).await;
    let motor = connect(&addr, "mover", 22.0).await;

    // 20 units at 10 units/s
    let started = Instant::now();
    let reply = motor.call_raw("set_pos", vec![json!(42.0)], Map::new()).await.unwrap();
    assert!(reply.is_ok());
    assert_eq!(reply.msg.as_deref(), Some(TASK_STARTED));
    assert!(started.elapsed() < Duration::from_millis(500));

    assert!(motor.result().await.unwrap().is_waiting());
    let status = motor.call("status", vec![], Map::new()).await.unwrap();
    assert_eq!(status, json!("MOVING"));

    let value = loop {
        let reply = motor.result().await.unwrap();
        if !reply.is_waiting() {
            break reply;
        }
        assert!(started.elapsed() < Duration::from_secs(5), "move never finished");
    };
    assert_eq!(value.into_result().unwrap(), json!(42.0));
    assert!(started.elapsed() >= Duration::from_millis(1900));

    // The result is handed out once
    let again = motor.result().await.unwrap();
    assert!(again.is_error());
    assert_eq!(again.msg.as_deref(), Some("No pending task"));

    motor.shutdown().await;
    server.stop().await;
}

#[tokio::test]
async fn test_abort_returns_interrupt_value() {
    let (mut server, addr) = start_server(ServerOptions::default()).await;
    let motor = connect(&addr, "mover", 22.0).await;

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(500)).await;
        trigger.cancel();
    });

    let started = Instant::now();
    let stopped_at = motor
        .call_with_cancel("set_pos", vec![json!(42.0)], Map::new(), &cancel)
        .await
        .unwrap();
    assert!(started.elapsed() < Duration::from_millis(1500));

    let stopped_at = stopped_at.as_f64().unwrap();
    assert!(stopped_at > 22.0 && stopped_at < 42.0, "stopped at {}", stopped_at);

    // The slot is free again
    assert!(!server.dispatcher().has_pending_task());
    wait_until(Duration::from_secs(1), || {
        !server.dispatcher().instance().unwrap().is_moving()
    })
    .await;

    motor.shutdown().await;
    server.stop().await;
}

#[tokio::test]
async fn test_admin_handover_between_clients() {
    let (mut server, addr) = start_server(ServerOptions::default()).await;

    let a = MotorClient::from_proxy(connect(&addr, "a", 0.0).await);
    a.set_speed(5.0).await.unwrap();
    a.proxy().shutdown().await;

    let b = MotorClient::from_proxy(connect_observer(&addr, "b").await);
    let c = MotorClient::from_proxy(connect_observer(&addr, "c").await);
    assert_eq!(b.speed().await.unwrap(), 5.0);

    // Nobody holds admin after A left, so B gets it without forcing
    assert!(b.proxy().request_admin(false).await.unwrap().is_ok());

    let (written, seen) = tokio::join!(b.set_speed(7.0), c.speed());
    written.unwrap();
    let seen = seen.unwrap();
    assert!(seen == 5.0 || seen == 7.0, "saw {}", seen);
    assert_eq!(c.speed().await.unwrap(), 7.0);

    // C is not admin and cannot write
    assert!(c.set_speed(9.0).await.is_err());
    assert_eq!(b.speed().await.unwrap(), 7.0);

    b.proxy().shutdown().await;
    c.proxy().shutdown().await;
    server.stop().await;
}

#[tokio::test]
async fn test_silent_client_is_evicted() {
    let options = ServerOptions {
        ping_interval: Duration::from_millis(50),
        liveness_budget: Duration::from_millis(300),
        ..ServerOptions::default()
    };
    let (mut server, addr) = start_server(options).await;

    let quiet = ClientProxy::connect(
        addr.as_str(),
        vec![],
        Map::new(),
        ClientOptions {
            ping_interval: Duration::from_secs(60),
            ..ClientOptions::named("quiet")
        },
    )
    .await
    .unwrap();
    let chatty = ClientProxy::connect(
        addr.as_str(),
        vec![],
        Map::new(),
        ClientOptions {
            ping_interval: Duration::from_millis(50),
            ..ClientOptions::named("chatty").observer()
        },
    )
    .await
    .unwrap();
    assert_eq!(server.dispatcher().session_count(), 2);

    wait_until(Duration::from_secs(3), || {
        server.dispatcher().session_count() == 1
    })
    .await;
    assert!(chatty.is_alive());

    // The evicted session took its admin slot with it
    assert!(chatty.request_admin(false).await.unwrap().is_ok());

    quiet.shutdown().await;
    chatty.shutdown().await;
    server.stop().await;
}

#[tokio::test]
async fn test_second_non_blocking_call_is_rejected() {
    let (mut server, addr) = start_server(ServerOptions::default()).await;
    let motor = connect(&addr, "mover", 0.0).await;

    let first = motor.call_raw("set_pos", vec![json!(3.0)], Map::new()).await.unwrap();
    assert!(first.is_ok());

    let second = motor.call_raw("set_pos", vec![json!(5.0)], Map::new()).await.unwrap();
    assert!(second.is_error());

    // Blocking calls still go through while the move runs
    let pos = motor.call("get_pos", vec![], Map::new()).await.unwrap();
    assert!(pos.as_f64().unwrap() <= 3.0);

    let done = motor.call("check_done", vec![], Map::new()).await.unwrap();
    assert_eq!(done, Value::Null);
    assert_eq!(motor.result().await.unwrap().into_result().unwrap(), json!(3.0));

    motor.shutdown().await;
    server.stop().await;
}

#[tokio::test]
async fn test_non_admin_cannot_move() {
    let (mut server, addr) = start_server(ServerOptions::default()).await;
    let admin = connect(&addr, "admin", 0.0).await;
    let viewer = connect_observer(&addr, "viewer").await;

    let reply = viewer.call_raw("set_pos", vec![json!(1.0)], Map::new()).await.unwrap();
    assert!(reply.is_error());
    assert!(!server.dispatcher().has_pending_task());

    // Reads are open to everyone
    assert_eq!(viewer.get("pos").await.unwrap(), json!(0.0));
    assert!(viewer.set("pos", json!(1.0)).await.is_err());

    admin.shutdown().await;
    viewer.shutdown().await;
    server.stop().await;
}

#[tokio::test]
async fn test_typed_client_and_binary_payload() {
    let (mut server, addr) = start_server(ServerOptions::default()).await;
    let motor = MotorClient::connect(
        addr.as_str(),
        vec![json!(50.0), json!(1.5)],
        client_options("typed"),
    )
    .await
    .unwrap();

    assert_eq!(motor.status().await.unwrap(), "IDLE");
    assert_eq!(motor.pos().await.unwrap(), 1.5);
    assert_eq!(motor.set_pos(4.0).await.unwrap(), 4.0);
    assert_eq!(motor.get_pos().await.unwrap(), 4.0);

    let raw = motor
        .proxy()
        .call("controller_reply", vec![], Map::new())
        .await
        .unwrap();
    assert_eq!(value_to_bytes(&raw).unwrap(), b"POS 4.000\r\n");

    motor.proxy().shutdown().await;
    server.stop().await;
}

#[tokio::test]
async fn test_binary_serves_and_exits_on_kill() {
    let mut child = tokio::process::Command::new(env!("CARGO_BIN_EXE_labproxy-rpc"))
        .args(["--port", "0"])
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .expect("Failed to spawn server");

    let stdout = child.stdout.take().expect("No stdout");
    let mut lines = tokio::io::BufReader::new(stdout).lines();
    let port = tokio::time::timeout(Duration::from_secs(30), async {
        while let Some(line) = lines.next_line().await.unwrap() {
            if let Some(port) = line.strip_prefix("LABPROXY_PORT=") {
                return port.parse::<u16>().unwrap();
            }
        }
        panic!("Server exited without printing its port");
    })
    .await
    .expect("Server did not start in time");

    let motor = connect(&format!("127.0.0.1:{}", port), "killer", 0.0).await;
    assert_eq!(motor.call("status", vec![], Map::new()).await.unwrap(), json!("IDLE"));
    motor.kill().await.unwrap();

    let status = tokio::time::timeout(Duration::from_secs(10), child.wait())
        .await
        .expect("Server did not exit after kill")
        .unwrap();
    assert!(status.success());
}
