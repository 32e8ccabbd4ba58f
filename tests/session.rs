//! Control session behavior against scripted bulbs on localhost.

use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

use yeelight_rs::{
    Brightness, ControlSession, DeviceRegistry, DeviceState, Error, EventBus, Power, Rgb,
    SessionConfig, SessionState,
};

/// Bind a listener and run `script` on the first accepted connection.
async fn spawn_bulb<F, Fut>(script: F) -> SocketAddr
where
    F: FnOnce(TcpStream) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        script(stream).await;
    });
    addr
}

/// Reply `{"id": ..., "result": ["ok"]}` to every command.
async fn answer_ok(stream: TcpStream) {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let frame: Value = serde_json::from_str(&line).unwrap();
        let reply = format!(r#"{{"id":{},"result":["ok"]}}"#, frame["id"]);
        write_half.write_all(reply.as_bytes()).await.unwrap();
        write_half.write_all(b"\r\n").await.unwrap();
    }
}

fn quick_config() -> SessionConfig {
    SessionConfig {
        connect_timeout: Duration::from_secs(2),
        response_timeout: Duration::from_millis(500),
        keepalive_interval: Duration::from_secs(60),
    }
}

#[tokio::test]
async fn commands_round_trip_and_stop_flow_is_idempotent() {
    let addr = spawn_bulb(answer_ok).await;
    let session = ControlSession::connect(addr, DeviceRegistry::new(), EventBus::default())
        .await
        .unwrap();

    assert_eq!(session.state(), SessionState::Ready);
    session.set_power(Power::On).await.unwrap();
    session.set_brightness(Brightness::clamped(80)).await.unwrap();
    session.set_rgb(Rgb::rgb(10, 20, 30)).await.unwrap();
    session.toggle().await.unwrap();
    // No flow is running; stopping must still succeed.
    session.stop_flow().await.unwrap();
    session.stop_flow().await.unwrap();

    session.close().await;
    assert_eq!(session.state(), SessionState::Disconnected);
}

#[tokio::test]
async fn props_push_updates_registry_and_publishes_event() {
    let addr = spawn_bulb(|stream| async move {
        let (read_half, mut write_half) = stream.into_split();
        let mut lines = BufReader::new(read_half).lines();
        // Answer the first command, then push an unsolicited state change.
        let line = lines.next_line().await.unwrap().unwrap();
        let frame: Value = serde_json::from_str(&line).unwrap();
        let reply = format!(r#"{{"id":{},"result":["on"]}}"#, frame["id"]);
        write_half.write_all(reply.as_bytes()).await.unwrap();
        write_half.write_all(b"\r\n").await.unwrap();
        write_half
            .write_all(
                br#"{"method":"props","params":{"power":"on","bright":"80","rgb":660510,"color_mode":1}}"#,
            )
            .await
            .unwrap();
        write_half.write_all(b"\r\n").await.unwrap();
        // Keep the connection open until the client closes it.
        let _ = lines.next_line().await;
    })
    .await;

    let registry = DeviceRegistry::new();
    let events = EventBus::default();
    let mut rx = events.subscribe();

    let session = ControlSession::connect(addr, registry.clone(), events)
        .await
        .unwrap();
    session.get_properties(&["power"]).await.unwrap();

    let change = timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("no event within deadline")
        .unwrap();
    let expected = DeviceState::on(Brightness::clamped(80), yeelight_rs::Color::Rgb(Rgb::rgb(10, 20, 30)));
    assert_eq!(change.addr, addr);
    assert_eq!(change.state, expected);
    assert_eq!(registry.get(addr).unwrap().state(), expected);

    session.close().await;
}

#[tokio::test]
async fn severed_transport_fails_pending_with_connection_lost() {
    let addr = spawn_bulb(|stream| async move {
        let (read_half, _write_half) = stream.into_split();
        let mut lines = BufReader::new(read_half).lines();
        // Swallow one command, then drop the connection without replying.
        let _ = lines.next_line().await;
    })
    .await;

    let session = ControlSession::connect_with(
        addr,
        DeviceRegistry::new(),
        EventBus::default(),
        SessionConfig {
            response_timeout: Duration::from_secs(10),
            ..quick_config()
        },
    )
    .await
    .unwrap();

    // Must resolve promptly with ConnectionLost, well before the 10s timeout.
    let result = timeout(Duration::from_secs(2), session.set_power(Power::On)).await;
    match result {
        Ok(Err(Error::ConnectionLost)) => {}
        other => panic!("expected ConnectionLost, got {other:?}"),
    }
    assert_eq!(session.state(), SessionState::Disconnected);
}

#[tokio::test]
async fn unanswered_command_times_out() {
    let addr = spawn_bulb(|stream| async move {
        let (read_half, _write_half) = stream.into_split();
        let mut lines = BufReader::new(read_half).lines();
        // Read commands forever, never reply.
        while let Ok(Some(_)) = lines.next_line().await {}
    })
    .await;

    let session = ControlSession::connect_with(
        addr,
        DeviceRegistry::new(),
        EventBus::default(),
        quick_config(),
    )
    .await
    .unwrap();

    let err = session.set_power(Power::On).await.unwrap_err();
    assert!(matches!(err, Error::ResponseTimeout));
    // A timeout is local to that command; the session stays usable.
    assert_eq!(session.state(), SessionState::Ready);
}

#[tokio::test]
async fn device_error_frames_surface_as_command_errors() {
    let addr = spawn_bulb(|stream| async move {
        let (read_half, mut write_half) = stream.into_split();
        let mut lines = BufReader::new(read_half).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let frame: Value = serde_json::from_str(&line).unwrap();
            let reply = format!(
                r#"{{"id":{},"error":{{"code":-5000,"message":"general error"}}}}"#,
                frame["id"]
            );
            write_half.write_all(reply.as_bytes()).await.unwrap();
            write_half.write_all(b"\r\n").await.unwrap();
        }
    })
    .await;

    let session = ControlSession::connect(addr, DeviceRegistry::new(), EventBus::default())
        .await
        .unwrap();

    match session.set_name("kitchen").await.unwrap_err() {
        Error::Device { code, message } => {
            assert_eq!(code, -5000);
            assert_eq!(message, "general error");
        }
        other => panic!("expected device error, got {other:?}"),
    }
    session.close().await;
}

#[tokio::test]
async fn closed_session_rejects_further_commands() {
    let addr = spawn_bulb(answer_ok).await;
    let session = ControlSession::connect(addr, DeviceRegistry::new(), EventBus::default())
        .await
        .unwrap();

    session.close().await;
    let err = session.set_power(Power::On).await.unwrap_err();
    assert!(matches!(err, Error::NotReady(SessionState::Disconnected)));
}

#[tokio::test]
async fn connect_to_closed_port_fails() {
    // Bind then drop to get a port nothing listens on.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let registry = DeviceRegistry::new();
    let result = ControlSession::connect_with(
        addr,
        registry.clone(),
        EventBus::default(),
        quick_config(),
    )
    .await;
    assert!(matches!(
        result.unwrap_err(),
        Error::Connect { .. } | Error::ConnectTimeout(_)
    ));
}

#[tokio::test]
async fn json_command_frames_match_the_wire_format() {
    let (frames_tx, mut frames_rx) = tokio::sync::mpsc::unbounded_channel();
    let addr = spawn_bulb(move |stream| async move {
        let (read_half, mut write_half) = stream.into_split();
        let mut lines = BufReader::new(read_half).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let frame: Value = serde_json::from_str(&line).unwrap();
            let reply = format!(r#"{{"id":{},"result":["ok"]}}"#, frame["id"]);
            write_half.write_all(reply.as_bytes()).await.unwrap();
            write_half.write_all(b"\r\n").await.unwrap();
            frames_tx.send(frame).unwrap();
        }
    })
    .await;

    let session = ControlSession::connect(addr, DeviceRegistry::new(), EventBus::default())
        .await
        .unwrap();
    session.set_brightness(Brightness::clamped(80)).await.unwrap();

    let frame = frames_rx.recv().await.unwrap();
    assert_eq!(frame["method"], "set_bright");
    assert_eq!(frame["params"], json!([80, "smooth", 500]));
    assert!(frame["id"].as_u64().is_some());

    session.close().await;
}
