//! End-to-end tests over a real TCP listener.

use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::oneshot;

use divvy::metrics::{Instrumenter, PrometheusInstrumenter};
use divvy::ratelimit::{CreditBackend, MemoryBackend, RuleDocument};
use divvy::server::{DivvyService, Server};

const RULES: &str = r#"
overrides:
  - operation: { method: GET, ip: "*" }
    creditLimit: 2
    resetSeconds: 60
    actorField: ip
    label: get-by-ip
  - operation: { method: DELETE }
    creditLimit: 0
    label: no-deletes
default:
  creditLimit: 1
  resetSeconds: 60
"#;

struct Harness {
    addr: SocketAddr,
    instrumenter: Arc<PrometheusInstrumenter>,
    shutdown: Option<oneshot::Sender<()>>,
    connections: Arc<std::sync::atomic::AtomicUsize>,
}

impl Drop for Harness {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

async fn start(rules: &str) -> Harness {
    let store = RuleDocument::from_yaml(rules).unwrap().into_store().unwrap();
    let backend = Arc::new(MemoryBackend::new());
    backend.initialize().await.unwrap();
    let instrumenter = Arc::new(PrometheusInstrumenter::new());
    let dyn_instrumenter: Arc<dyn Instrumenter> = instrumenter.clone();

    let service = DivvyService::new(Arc::new(store), backend, dyn_instrumenter);
    let server = Server::bind("127.0.0.1:0".parse().unwrap(), service)
        .await
        .unwrap();
    let addr = server.local_addr().unwrap();
    let connections = server.connections();

    let (tx, rx) = oneshot::channel();
    tokio::spawn(server.serve_with_shutdown(async move {
        let _ = rx.await;
    }));

    Harness {
        addr,
        instrumenter,
        shutdown: Some(tx),
        connections,
    }
}

struct Client {
    lines: tokio::io::Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl Client {
    async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (reader, writer) = stream.into_split();
        Self {
            lines: BufReader::new(reader).lines(),
            writer,
        }
    }

    async fn send_raw(&mut self, bytes: &[u8]) {
        self.writer.write_all(bytes).await.unwrap();
    }

    async fn send(&mut self, line: &str) {
        self.writer.write_all(line.as_bytes()).await.unwrap();
        self.writer.write_all(b"\n").await.unwrap();
    }

    async fn recv(&mut self) -> Option<String> {
        tokio::time::timeout(Duration::from_secs(5), self.lines.next_line())
            .await
            .expect("timed out waiting for response")
            .unwrap()
    }

    async fn request(&mut self, line: &str) -> String {
        self.send(line).await;
        self.recv().await.expect("connection closed")
    }
}

#[tokio::test]
async fn test_default_rule_limits_everything_else() {
    let harness = start(RULES).await;
    let mut client = Client::connect(harness.addr).await;

    assert_eq!(client.request("HIT method=PUT").await, "OK true 0 60");

    let second = client.request("HIT method=POST").await;
    let ttl: i64 = second
        .strip_prefix("OK false 0 ")
        .expect("second hit should be rejected")
        .parse()
        .unwrap();
    assert!((59..=60).contains(&ttl));
}

#[tokio::test]
async fn test_actor_field_and_zero_credit_rules() {
    let harness = start(RULES).await;
    let mut client = Client::connect(harness.addr).await;

    assert_eq!(client.request("HIT method=GET ip=10.0.0.1").await, "OK true 1 60");
    assert_eq!(client.request("HIT method=GET ip=10.0.0.1").await, "OK true 0 60");
    assert!(client
        .request("HIT method=GET ip=10.0.0.1")
        .await
        .starts_with("OK false 0 "));
    assert_eq!(client.request("HIT method=GET ip=10.0.0.2").await, "OK true 1 60");

    assert_eq!(client.request("HIT method=DELETE").await, "OK false 0 -1");
    assert_eq!(client.request("hit \"method\"=\"DELETE\"").await, "OK false 0 -1");
}

#[tokio::test]
async fn test_pipelined_requests_answered_in_order() {
    let harness = start(RULES).await;
    let mut client = Client::connect(harness.addr).await;

    client
        .send("HIT method=GET ip=a\nHIT method=GET ip=a\nHIT method=GET ip=a\nHIT method=DELETE")
        .await;

    // Each request is billed independently, so only the counts are fixed.
    let mut allowed = 0;
    for _ in 0..3 {
        let line = client.recv().await.unwrap();
        if line.starts_with("OK true") {
            allowed += 1;
        } else {
            assert!(line.starts_with("OK false"));
        }
    }
    assert_eq!(allowed, 2);
    assert_eq!(client.recv().await.unwrap(), "OK false 0 -1");
}

#[tokio::test]
async fn test_malformed_request_closes_connection() {
    let harness = start(RULES).await;
    let mut client = Client::connect(harness.addr).await;

    assert_eq!(
        client.request("HIT \"a=1").await,
        "ERR unknown \"Unexpected end of quoted string.\""
    );
    assert_eq!(client.recv().await, None);

    let metrics = harness.instrumenter.encode().unwrap();
    assert!(metrics.contains("divvy_errors_total{code=\"unknown\"} 1"));
}

#[tokio::test]
async fn test_unknown_command_closes_connection() {
    let harness = start(RULES).await;
    let mut client = Client::connect(harness.addr).await;

    assert_eq!(
        client.request("EGGPLANT").await,
        "ERR unknown-command \"Unrecognized command: EGGPLANT\""
    );

    let mut rest = String::new();
    client.lines.get_mut().read_to_string(&mut rest).await.unwrap();
    assert!(rest.is_empty());
}

#[tokio::test]
async fn test_invalid_utf8_is_still_answered() {
    let harness = start("default:\n  creditLimit: 10\n  resetSeconds: 60\n").await;
    let mut client = Client::connect(harness.addr).await;

    client.send_raw(b"HIT a=\xff\nHIT b=1\r\n").await;

    // Both requests bill the same bucket concurrently, so only the verdicts
    // are fixed.
    for _ in 0..2 {
        let line = client.recv().await.expect("connection closed");
        assert!(line.starts_with("OK true "), "{}", line);
    }
    assert_eq!(harness.connections.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_blank_lines_are_ignored() {
    let harness = start(RULES).await;
    let mut client = Client::connect(harness.addr).await;

    client.send("").await;
    assert_eq!(client.request("HIT").await, "OK true 0 60");
}

#[tokio::test]
async fn test_connection_gauge_tracks_clients() {
    let harness = start(RULES).await;

    let mut first = Client::connect(harness.addr).await;
    let mut second = Client::connect(harness.addr).await;
    first.request("HIT method=GET ip=x").await;
    second.request("HIT method=GET ip=y").await;
    assert_eq!(harness.connections.load(Ordering::SeqCst), 2);

    drop(first);
    drop(second);

    for _ in 0..50 {
        if harness.connections.load(Ordering::SeqCst) == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(harness.connections.load(Ordering::SeqCst), 0);

    let metrics = harness.instrumenter.encode().unwrap();
    assert!(metrics.contains("divvy_tcp_connections_total 0"));
    assert!(metrics.contains("divvy_hits_total{status=\"accepted\",rule=\"get-by-ip\"} 2"));
}
