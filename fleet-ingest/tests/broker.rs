//! Drives the connection manager against a minimal in-process MQTT peer.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fleet_ingest::{
    BrokerConfig, ConnectionManager, InboundMessage, MessageHandler, SessionError, SessionState,
};
use rumqttc::ConnectReturnCode;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;

const CONNECT: u8 = 0x10;
const SUBSCRIBE: u8 = 0x82;
const DISCONNECT: u8 = 0xE0;
const WAIT: Duration = Duration::from_secs(10);

struct Recorder(mpsc::UnboundedSender<InboundMessage>);

#[async_trait]
impl MessageHandler for Recorder {
    async fn handle(&self, message: InboundMessage) {
        let _ = self.0.send(message);
    }
}

fn recorder() -> (Arc<Recorder>, mpsc::UnboundedReceiver<InboundMessage>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Arc::new(Recorder(tx)), rx)
}

async fn peer() -> (TcpListener, BrokerConfig) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let config = BrokerConfig {
        host: "127.0.0.1".to_string(),
        port,
        client_id: "fleet-ingest-test".to_string(),
        connect_timeout_secs: 5,
        reconnect_min_delay_secs: 1,
        reconnect_max_delay_secs: 2,
        ..BrokerConfig::default()
    };
    (listener, config)
}

async fn read_packet(stream: &mut TcpStream) -> std::io::Result<(u8, Vec<u8>)> {
    let header = stream.read_u8().await?;
    let mut len = 0usize;
    let mut shift = 0;
    loop {
        let byte = stream.read_u8().await?;
        len |= usize::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            break;
        }
        shift += 7;
    }
    let mut body = vec![0; len];
    stream.read_exact(&mut body).await?;
    Ok((header, body))
}

fn remaining_length(mut len: usize, out: &mut Vec<u8>) {
    loop {
        let mut byte = (len % 128) as u8;
        len /= 128;
        if len > 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if len == 0 {
            break;
        }
    }
}

async fn accept_session(listener: &TcpListener, return_code: u8) -> TcpStream {
    let (mut stream, _) = listener.accept().await.unwrap();
    let (header, _) = read_packet(&mut stream).await.unwrap();
    assert_eq!(header & 0xF0, CONNECT);
    stream
        .write_all(&[0x20, 0x02, 0x00, return_code])
        .await
        .unwrap();
    stream
}

/// Waits for the next SUBSCRIBE, acknowledges it and returns its first filter.
async fn expect_subscribe(stream: &mut TcpStream) -> String {
    loop {
        let (header, body) = read_packet(stream).await.unwrap();
        if header != SUBSCRIBE {
            continue;
        }
        let topic_len = usize::from(u16::from_be_bytes([body[2], body[3]]));
        let topic = String::from_utf8(body[4..4 + topic_len].to_vec()).unwrap();
        stream
            .write_all(&[0x90, 0x03, body[0], body[1], 0x00])
            .await
            .unwrap();
        return topic;
    }
}

async fn publish(stream: &mut TcpStream, topic: &str, payload: &[u8]) {
    let mut packet = vec![0x30];
    remaining_length(2 + topic.len() + payload.len(), &mut packet);
    packet.extend_from_slice(&(topic.len() as u16).to_be_bytes());
    packet.extend_from_slice(topic.as_bytes());
    packet.extend_from_slice(payload);
    stream.write_all(&packet).await.unwrap();
}

#[tokio::test]
async fn subscribes_on_connect_and_delivers_publishes() {
    let (listener, config) = peer().await;
    let (handler, mut received) = recorder();

    let broker = tokio::spawn(async move {
        let mut stream = accept_session(&listener, 0x00).await;
        let topic = expect_subscribe(&mut stream).await;
        publish(
            &mut stream,
            "iot/acme/plant1/line3/status",
            br#"{"serial_number":"SN1"}"#,
        )
        .await;

        let mut saw_disconnect = false;
        while let Ok((header, _)) = read_packet(&mut stream).await {
            if header == DISCONNECT {
                saw_disconnect = true;
                break;
            }
        }
        (topic, saw_disconnect)
    });

    let manager = ConnectionManager::new(config, handler);
    assert_eq!(manager.subscribe([" iot/# ", ""], 1), 1);
    manager.connect(WAIT).await.unwrap();
    assert_eq!(manager.state(), SessionState::Connected);

    let message = timeout(WAIT, received.recv()).await.unwrap().unwrap();
    assert_eq!(message.topic, "iot/acme/plant1/line3/status");
    assert_eq!(message.payload, br#"{"serial_number":"SN1"}"#.to_vec());
    assert_eq!(message.qos, 0);
    assert!(!message.retain);

    manager.shutdown().await;
    assert_eq!(manager.state(), SessionState::Disconnected);

    let (topic, saw_disconnect) = timeout(WAIT, broker).await.unwrap().unwrap();
    assert_eq!(topic, "iot/#");
    assert!(saw_disconnect);
}

#[tokio::test]
async fn refused_connection_is_reported() {
    let (listener, config) = peer().await;
    let (handler, _received) = recorder();

    let broker = tokio::spawn(async move {
        let _stream = accept_session(&listener, 0x05).await;
        tokio::time::sleep(WAIT).await;
    });

    let manager = ConnectionManager::new(config, handler);
    let err = manager.connect(WAIT).await.unwrap_err();
    assert!(
        matches!(err, SessionError::Refused(ConnectReturnCode::NotAuthorized)),
        "unexpected error: {err}"
    );
    assert_eq!(manager.state(), SessionState::Disconnected);

    broker.abort();
    manager.shutdown().await;
}

#[tokio::test]
async fn silent_broker_times_out() {
    let (listener, config) = peer().await;
    let (handler, _received) = recorder();

    let broker = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        while read_packet(&mut stream).await.is_ok() {}
    });

    let manager = ConnectionManager::new(config, handler);
    let err = manager
        .connect(Duration::from_millis(500))
        .await
        .unwrap_err();
    assert!(err.is_timeout(), "unexpected error: {err}");
    assert_eq!(manager.state(), SessionState::Disconnected);

    manager.shutdown().await;
    assert!(matches!(
        manager.connect(WAIT).await,
        Err(SessionError::ShutDown)
    ));
    broker.abort();
}

#[tokio::test]
async fn resubscribes_after_the_broker_drops_the_connection() {
    let (listener, config) = peer().await;
    let (handler, _received) = recorder();

    let broker = tokio::spawn(async move {
        let mut first = accept_session(&listener, 0x00).await;
        let before = expect_subscribe(&mut first).await;
        drop(first);

        let mut second = accept_session(&listener, 0x00).await;
        let after = expect_subscribe(&mut second).await;
        (before, after, second)
    });

    let manager = ConnectionManager::new(config, handler);
    manager.subscribe(["fleet/+/status"], 0);
    manager.connect(WAIT).await.unwrap();

    // The back-off between attempts keeps the session in Reconnecting long enough to observe.
    let mut state = manager.watch_state();
    timeout(WAIT, state.wait_for(|s| *s == SessionState::Reconnecting))
        .await
        .unwrap()
        .unwrap();
    timeout(WAIT, state.wait_for(|s| *s == SessionState::Connected))
        .await
        .unwrap()
        .unwrap();

    let (before, after, _second) = timeout(WAIT, broker).await.unwrap().unwrap();
    assert_eq!(before, "fleet/+/status");
    assert_eq!(after, "fleet/+/status");
    assert_eq!(manager.state(), SessionState::Connected);
    assert_eq!(
        manager.subscriptions().await,
        vec![("fleet/+/status".to_string(), rumqttc::QoS::AtMostOnce)]
    );

    manager.shutdown().await;
}

#[tokio::test]
async fn subscribing_while_connected_applies_immediately() {
    let (listener, config) = peer().await;
    let (handler, _received) = recorder();

    let broker = tokio::spawn(async move {
        let mut stream = accept_session(&listener, 0x00).await;
        let topic = expect_subscribe(&mut stream).await;
        (topic, stream)
    });

    let manager = ConnectionManager::new(config, handler);
    manager.connect(WAIT).await.unwrap();
    assert_eq!(manager.state(), SessionState::Connected);
    assert_eq!(manager.subscribe(["late/#"], 1), 1);

    let (topic, _stream) = timeout(WAIT, broker).await.unwrap().unwrap();
    assert_eq!(topic, "late/#");
    assert_eq!(
        manager.subscriptions().await,
        vec![("late/#".to_string(), rumqttc::QoS::AtLeastOnce)]
    );

    manager.shutdown().await;
}

#[tokio::test]
async fn abandoned_connect_leaves_nothing_running() {
    let (listener, config) = peer().await;
    let (handler, _received) = recorder();
    let (closed_tx, closed_rx) = oneshot::channel();

    let broker = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        while read_packet(&mut stream).await.is_ok() {}
        let _ = closed_tx.send(());

        let mut stream = accept_session(&listener, 0x00).await;
        while read_packet(&mut stream).await.is_ok() {}
    });

    let manager = ConnectionManager::new(config, handler);
    let abandoned = timeout(Duration::from_millis(300), manager.connect(WAIT)).await;
    assert!(abandoned.is_err(), "connect should still be waiting for CONNACK");
    assert_eq!(manager.state(), SessionState::Disconnected);

    // The half-open socket is closed rather than left reconnecting in the background.
    timeout(WAIT, closed_rx).await.unwrap().unwrap();

    manager.connect(WAIT).await.unwrap();
    assert_eq!(manager.state(), SessionState::Connected);

    manager.shutdown().await;
    broker.abort();
}
