//! Multi-node scenarios over real loopback connections.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use super::{node_config, HarnessConfig, TestHarness};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use dsn_node::cipher::{self, EnvelopeKey};
use dsn_node::criteria::parse_record;
use dsn_node::protocol::message::{self, PrintMessage, UploadReceipt, UploadRequest, Verdict};
use dsn_node::request::StaticPeers;
use dsn_node::{
    Comparison, Criteria, Decision, Error, NodeBuilder, PeerIdentity, ProtocolErrorKind,
    ProtocolId, ProtocolStream, RequestStatus, Rule, StreamHandler,
};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn protocol(id: &str) -> ProtocolId {
    ProtocolId::new(id).unwrap()
}

/// Reads the request, then never answers.
struct HangHandler;

#[async_trait]
impl StreamHandler for HangHandler {
    async fn handle(&self, stream: &mut ProtocolStream) -> dsn_node::Result<()> {
        let _ = stream.read_to_end().await?;
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(())
    }
}

/// Poll `check` until it holds or `limit` passes.
async fn eventually<F, Fut>(limit: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

#[tokio::test]
async fn test_echo_round_trip() {
    let harness = TestHarness::setup().await.expect("Failed to setup harness");
    let connection = harness.connect(1, 0).await.unwrap();
    let b = harness.node(1).unwrap();

    let mut stream = b
        .multiplexer()
        .open_stream(&connection, &protocol(message::ECHO))
        .await
        .unwrap();
    stream.write_all(b"ping").await.unwrap();
    stream.close().await.unwrap();
    assert!(stream.is_write_closed());
    assert_eq!(stream.read_to_end().await.unwrap(), b"ping");

    harness.teardown().await.expect("Failed to teardown");
}

#[tokio::test]
async fn test_send_and_close_awaits_reply() {
    let harness = TestHarness::setup().await.unwrap();
    let connection = harness.connect(1, 0).await.unwrap();
    let mux = harness.node(1).unwrap().multiplexer();

    let ack = mux
        .send_and_close(&connection, &protocol(message::ECHO), b"hello", true)
        .await
        .unwrap();
    assert_eq!(ack.bytes_sent, 5);
    assert_eq!(ack.response.as_deref(), Some(&b"hello"[..]));

    let ack = mux
        .notify(
            &connection,
            &protocol(message::PRINT),
            &PrintMessage {
                message: "hello from a peer".to_string(),
            },
        )
        .await
        .unwrap();
    assert!(ack.bytes_sent > 0);
    assert!(ack.response.is_none());

    harness.teardown().await.unwrap();
}

#[tokio::test]
async fn test_concurrent_dials_share_one_connection() {
    let harness = TestHarness::setup().await.unwrap();
    let target = harness.node(0).unwrap().peer_id();
    let addr = harness.node(0).unwrap().handle().dialable_addrs()[0].clone();
    let dialer = harness.node(1).unwrap().handle().clone();

    let dials = (0..8).map(|_| {
        let dialer = dialer.clone();
        let addr = addr.clone();
        tokio::spawn(async move { dialer.dial(&addr).await })
    });
    let connections: Vec<_> = futures::future::join_all(dials)
        .await
        .into_iter()
        .map(|r| r.unwrap().unwrap())
        .collect();

    let first = connections[0].connection_id();
    assert!(connections.iter().all(|c| c.connection_id() == first));
    assert!(connections.iter().all(|c| c.peer_id() == target));
    assert_eq!(dialer.connection_count(&target).await.unwrap(), 1);
    assert_eq!(dialer.connected_peers().await.unwrap(), vec![target]);

    harness.teardown().await.unwrap();
}

#[tokio::test]
async fn test_simultaneous_dials_converge() {
    let harness = TestHarness::setup().await.unwrap();
    let a = harness.node(0).unwrap();
    let b = harness.node(1).unwrap();

    let (ab, ba) = tokio::join!(harness.connect(0, 1), harness.connect(1, 0));
    ab.unwrap();
    ba.unwrap();

    let converged = eventually(Duration::from_secs(5), || async {
        a.handle().connection_count(&b.peer_id()).await.unwrap() == 1
            && b.handle().connection_count(&a.peer_id()).await.unwrap() == 1
    })
    .await;
    assert!(converged, "both sides should keep exactly one connection");

    // The survivor is usable from both ends.
    let from_a = a.handle().connections().await.unwrap().remove(0);
    let ack = a
        .multiplexer()
        .send_and_close(&from_a, &protocol(message::ECHO), b"x", true)
        .await
        .unwrap();
    assert_eq!(ack.response.as_deref(), Some(&b"x"[..]));

    harness.teardown().await.unwrap();
}

#[tokio::test]
async fn test_closing_connection_unblocks_streams() {
    let harness = TestHarness::setup().await.unwrap();
    let hang = protocol("/hang/1.0.0");
    harness
        .node(0)
        .unwrap()
        .multiplexer()
        .register_handler(hang.clone(), Arc::new(HangHandler))
        .unwrap();

    let b = harness.node(1).unwrap();
    let connection = harness.connect(1, 0).await.unwrap();
    let mut stream = b
        .multiplexer()
        .open_stream(&connection, &hang)
        .await
        .unwrap();
    stream.write_all(b"anyone there?").await.unwrap();
    stream.close().await.unwrap();

    let reader = tokio::spawn(async move { stream.read_to_end().await });
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(b.handle().close(&connection).await.unwrap());

    // Stream timeout is 30s; closure must be observed well before that.
    let result = tokio::time::timeout(Duration::from_secs(5), reader)
        .await
        .expect("stream read hung after connection close")
        .unwrap();
    let err = result.expect_err("read succeeded on a closed connection");
    assert!(
        matches!(err, Error::Protocol { kind: ProtocolErrorKind::Io(_), .. }),
        "expected an io error, got {err}"
    );

    harness.teardown().await.unwrap();
}

#[tokio::test]
async fn test_unsupported_protocol_leaves_connection_intact() {
    let harness = TestHarness::setup().await.unwrap();
    let connection = harness.connect(1, 0).await.unwrap();
    let b = harness.node(1).unwrap();

    let err = b
        .multiplexer()
        .open_stream(&connection, &protocol("/nope/1.0.0"))
        .await
        .unwrap_err();
    assert!(
        matches!(
            err,
            Error::Protocol {
                kind: ProtocolErrorKind::UnsupportedProtocol,
                ..
            }
        ),
        "got {err:?}"
    );
    assert!(!err.is_retryable());

    let peer = harness.node(0).unwrap().peer_id();
    assert_eq!(b.handle().connection_count(&peer).await.unwrap(), 1);
    let ack = b
        .multiplexer()
        .send_and_close(&connection, &protocol(message::ECHO), b"still here", true)
        .await
        .unwrap();
    assert_eq!(ack.response.as_deref(), Some(&b"still here"[..]));

    harness.teardown().await.unwrap();
}

#[tokio::test]
async fn test_duplicate_handler_registration_fails() {
    let harness = TestHarness::setup().await.unwrap();
    let err = harness
        .node(0)
        .unwrap()
        .multiplexer()
        .register_handler(protocol(message::ECHO), Arc::new(HangHandler))
        .unwrap_err();
    assert!(matches!(
        err,
        Error::Protocol {
            kind: ProtocolErrorKind::AlreadyRegistered,
            ..
        }
    ));
    harness.teardown().await.unwrap();
}

#[tokio::test]
async fn test_malformed_payload_gets_no_receipt() {
    let harness = TestHarness::setup().await.unwrap();
    let connection = harness.connect(1, 0).await.unwrap();

    let result = harness
        .node(1)
        .unwrap()
        .multiplexer()
        .request::<_, message::Receipt>(
            &connection,
            &protocol(message::NEW_USER),
            &serde_json::json!({ "id": "u1", "u": "AAAA", "k": "BBBB", "extra": true }),
        )
        .await;
    assert!(matches!(
        result,
        Err(Error::Protocol {
            kind: ProtocolErrorKind::Malformed(_),
            ..
        })
    ));
    assert_eq!(harness.node(0).unwrap().custody().user_count(), 0);

    harness.teardown().await.unwrap();
}

#[tokio::test]
async fn test_full_verification_round() {
    let harness = TestHarness::setup().await.unwrap();
    let authority = harness.node(0).unwrap();
    let custodian = harness.node(1).unwrap();

    let record = parse_record(br#"{"name":"Jacob","age":21,"country":"NZ"}"#).unwrap();
    let holder = authority.dispatcher().enroll("u1", &record).await.unwrap();
    assert_eq!(holder, custodian.peer_id());
    assert_eq!(custodian.custody().user_count(), 1);

    let requests = authority.requests();
    let adult = Criteria::all(vec![Rule::new("age", Comparison::Greater, 18)])
        .named("Over 18");
    let request = requests.create("p1", "u1", "Acme", adult).await.unwrap();
    assert_eq!(request.status, RequestStatus::Pending);

    let (accepted, outcome) = requests
        .resolve_with_outcome(&request.id, Decision::Accept)
        .await
        .unwrap();
    assert_eq!(accepted.status, RequestStatus::Accepted);
    let outcome = outcome.unwrap();
    assert_eq!(outcome.peer_id, custodian.peer_id());
    assert_eq!(outcome.verdict, Verdict::Eligible);

    let senior = Criteria {
        name: None,
        all: vec![Rule::new("age", Comparison::Greater, 65)],
        any: vec![Rule::new("country", Comparison::In, serde_json::json!(["NZ", "AU"]))],
    };
    let request = requests.create("p1", "u1", "Acme", senior).await.unwrap();
    let (_, outcome) = requests
        .resolve_with_outcome(&request.id, Decision::Accept)
        .await
        .unwrap();
    assert_eq!(outcome.unwrap().verdict, Verdict::Ineligible);

    let stranger = requests
        .create("p1", "u404", "Acme", Criteria::default())
        .await
        .unwrap();
    let (_, outcome) = requests
        .resolve_with_outcome(&stranger.id, Decision::Accept)
        .await
        .unwrap();
    assert_eq!(outcome.unwrap().verdict, Verdict::UnknownSubject);

    let again = requests.resolve(&stranger.id, Decision::Reject).await;
    assert!(matches!(again, Err(Error::InvalidTransition { .. })));

    harness.teardown().await.unwrap();
}

#[tokio::test]
async fn test_unreachable_custody_peer_keeps_request_pending() {
    let config = HarnessConfig {
        dial_timeout: Duration::from_secs(2),
        ..HarnessConfig::default()
    };
    let dir = TempDir::new().unwrap();
    let ghost = PeerIdentity::generate().peer_id();
    let peers = StaticPeers::parse(&[format!("/ip4/127.0.0.1/tcp/1/p2p/{ghost}")]).unwrap();
    let authority = NodeBuilder::new(node_config(&dir, &config))
        .with_peer_source(Arc::new(peers))
        .build()
        .await
        .unwrap();
    let mut events = authority.subscribe_events();

    let requests = authority.requests();
    let request = requests
        .create("p1", "u1", "Acme", Criteria::default())
        .await
        .unwrap();

    let err = requests
        .resolve(&request.id, Decision::Accept)
        .await
        .unwrap_err();
    assert!(err.is_network(), "got {err:?}");
    assert_eq!(
        requests.get(&request.id).await.unwrap().status,
        RequestStatus::Pending
    );

    let mut saw_failure = false;
    while let Ok(event) = events.try_recv() {
        if matches!(event, dsn_node::NodeEvent::DispatchFailed { .. }) {
            saw_failure = true;
        }
    }
    assert!(saw_failure, "dispatch failure should be recorded");

    // Still decidable after the failed round.
    let rejected = requests.resolve(&request.id, Decision::Reject).await.unwrap();
    assert_eq!(rejected.status, RequestStatus::Rejected);

    authority.stop().await.unwrap();
}

#[tokio::test]
async fn test_upload_seals_stores_and_replicates() {
    let harness = TestHarness::setup_with_config(HarnessConfig::nodes(3))
        .await
        .unwrap();
    harness.connect(2, 1).await.unwrap();
    let connection = harness.connect(0, 1).await.unwrap();

    let data = b"passport scan";
    let receipt: UploadReceipt = harness
        .node(0)
        .unwrap()
        .multiplexer()
        .request(
            &connection,
            &protocol(message::UPLOAD),
            &UploadRequest {
                data: STANDARD.encode(data),
            },
        )
        .await
        .unwrap();

    let receiver = harness.node(1).unwrap();
    let envelope = receiver.custody().block(&receipt.hash).unwrap();
    let key = EnvelopeKey::from_base64(&receipt.key).unwrap();
    assert_eq!(cipher::open(&envelope, &key).unwrap(), data);

    let replica = harness.node(2).unwrap();
    let replicated = eventually(Duration::from_secs(5), || async {
        replica.custody().block(&receipt.hash).is_some()
    })
    .await;
    assert!(replicated, "block should reach the other connected peer");
    assert_eq!(harness.node(0).unwrap().custody().block_count(), 0);

    harness.teardown().await.unwrap();
}
