//! 会话 / 控制器测试
//!
//! 使用记录所有命令的 MockTransport，直接向事件通道注入传输事件。

use super::*;
use crate::codec;
use crate::error::TransportError;
use crate::registry::EndpointState;
use crate::snapshot::UserSnapshot;
use crate::transport::{ConnectionStatus, TransportEvent, TransportEventSender, event_channel};
use async_trait::async_trait;
use std::sync::Mutex;
use std::time::Duration;

// ============================================================================
// 测试替身
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
enum Call {
    Advertise(String),
    StopAdvertise,
    Discover,
    StopDiscover,
    Connect(String, String),
    Accept(String),
    Reject(String),
    Disconnect(String),
    DisconnectAll,
    Send(String, Vec<u8>),
}

#[derive(Default)]
struct MockTransport {
    calls: Mutex<Vec<Call>>,
    fail_advertise: Mutex<Option<TransportError>>,
    fail_discover: Mutex<Option<TransportError>>,
    fail_connect: Mutex<Option<TransportError>>,
    fail_send: Mutex<Option<TransportError>>,
}

impl MockTransport {
    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }

    fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    fn sends(&self) -> Vec<(String, Vec<u8>)> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Send(id, bytes) => Some((id, bytes)),
                _ => None,
            })
            .collect()
    }

    fn fail(slot: &Mutex<Option<TransportError>>) -> Result<(), TransportError> {
        match slot.lock().unwrap().clone() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn advertise(&self, local_name: &str) -> Result<(), TransportError> {
        Self::fail(&self.fail_advertise)?;
        self.record(Call::Advertise(local_name.to_string()));
        Ok(())
    }

    async fn stop_advertise(&self) {
        self.record(Call::StopAdvertise);
    }

    async fn discover(&self) -> Result<(), TransportError> {
        Self::fail(&self.fail_discover)?;
        self.record(Call::Discover);
        Ok(())
    }

    async fn stop_discover(&self) {
        self.record(Call::StopDiscover);
    }

    async fn connect(&self, endpoint_id: &str, local_name: &str) -> Result<(), TransportError> {
        Self::fail(&self.fail_connect)?;
        self.record(Call::Connect(endpoint_id.to_string(), local_name.to_string()));
        Ok(())
    }

    async fn accept(&self, endpoint_id: &str) -> Result<(), TransportError> {
        self.record(Call::Accept(endpoint_id.to_string()));
        Ok(())
    }

    async fn reject(&self, endpoint_id: &str) -> Result<(), TransportError> {
        self.record(Call::Reject(endpoint_id.to_string()));
        Ok(())
    }

    async fn disconnect(&self, endpoint_id: &str) {
        self.record(Call::Disconnect(endpoint_id.to_string()));
    }

    async fn disconnect_all(&self) {
        self.record(Call::DisconnectAll);
    }

    async fn send(&self, endpoint_id: &str, bytes: Vec<u8>) -> Result<(), TransportError> {
        Self::fail(&self.fail_send)?;
        self.record(Call::Send(endpoint_id.to_string(), bytes));
        Ok(())
    }
}

#[derive(Default)]
struct RecordingFriends {
    confirmed: Mutex<Vec<(String, UserSnapshot)>>,
}

impl FriendSink for RecordingFriends {
    fn on_friend_confirmed(&self, peer_id: &str, snapshot: &UserSnapshot) {
        self.confirmed
            .lock()
            .unwrap()
            .push((peer_id.to_string(), snapshot.clone()));
    }
}

fn local_snapshot() -> UserSnapshot {
    UserSnapshot {
        user_id: "me".to_string(),
        user_name: "Me".to_string(),
        total_score: 300,
        current_streak: 9,
        captured_at_epoch_millis: 1_700_000_000_000,
        ..Default::default()
    }
}

struct Harness {
    session: Session,
    transport: Arc<MockTransport>,
    friends: Arc<RecordingFriends>,
    events_tx: TransportEventSender,
    events: mpsc::Receiver<SessionEvent>,
}

impl Harness {
    async fn new() -> Self {
        Self::with_config(test_config()).await
    }

    async fn with_config(config: SessionConfig) -> Self {
        let transport = Arc::new(MockTransport::default());
        let friends = Arc::new(RecordingFriends::default());
        let (events_tx, events_rx) = event_channel();
        let (callback, events) = SimpleSessionCallback::new();

        let session = Session::builder(
            config,
            transport.clone() as Arc<dyn Transport>,
            Arc::new(local_snapshot),
        )
        .with_friend_sink(friends.clone())
        .with_callback(Arc::new(callback))
        .start(events_rx);

        Self {
            session,
            transport,
            friends,
            events_tx,
            events,
        }
    }

    async fn started() -> Self {
        let h = Self::new().await;
        h.session.start_advertising_and_discovery("Me").await.unwrap();
        h
    }

    fn inject(&self, event: TransportEvent) {
        self.events_tx.send(event).unwrap();
    }

    /// 通过一次查询往返，确保之前注入的事件都已被处理
    async fn settle(&self) {
        self.session.status().await.unwrap();
    }

    async fn next_event(&mut self) -> SessionEvent {
        tokio::time::timeout(Duration::from_secs(2), self.events.recv())
            .await
            .expect("timed out waiting for session event")
            .expect("event channel closed")
    }

    async fn assert_no_event(&mut self) {
        self.settle().await;
        assert!(
            self.events.try_recv().is_err(),
            "unexpected session event"
        );
    }

    async fn state(&self, id: &str) -> Option<EndpointState> {
        self.session.endpoint(id).await.unwrap().map(|e| e.state)
    }

    fn found(&self, id: &str, name: &str) {
        self.inject(TransportEvent::EndpointFound {
            endpoint_id: id.to_string(),
            name: name.to_string(),
        });
    }

    fn initiated(&self, id: &str, name: &str, incoming: bool) {
        self.inject(TransportEvent::ConnectionInitiated {
            endpoint_id: id.to_string(),
            name: name.to_string(),
            auth_token: "1234".to_string(),
            incoming,
        });
    }

    fn result(&self, id: &str, status: ConnectionStatus) {
        self.inject(TransportEvent::ConnectionResult {
            endpoint_id: id.to_string(),
            status,
        });
    }

    fn payload(&self, id: &str, bytes: Vec<u8>) {
        self.inject(TransportEvent::PayloadReceived {
            endpoint_id: id.to_string(),
            bytes,
        });
    }

    /// 对端发起并被接受，直到 Connected
    async fn connect_inbound(&mut self, id: &str, name: &str) {
        self.initiated(id, name, true);
        assert!(matches!(
            self.next_event().await,
            SessionEvent::ConnectionRequested(_)
        ));
        self.session.respond_to_request(id, true).await.unwrap();
        self.result(id, ConnectionStatus::Success);
        assert!(matches!(
            self.next_event().await,
            SessionEvent::Connected { .. }
        ));
    }
}

fn test_config() -> SessionConfig {
    SessionConfig {
        local_name: "Me".to_string(),
        ..Default::default()
    }
}

// ============================================================================
// 场景
// ============================================================================

/// 发现 → 请求 → 成功 → 推送一次本地快照
#[tokio::test]
async fn test_outbound_connection_pushes_snapshot_once() {
    let mut h = Harness::started().await;

    h.found("P1", "Alex");
    match h.next_event().await {
        SessionEvent::EndpointFound(ep) => {
            assert_eq!(ep.id, "P1");
            assert_eq!(ep.display_name, "Alex");
            assert_eq!(ep.state, EndpointState::Discovered);
        }
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(h.session.discovered().await.unwrap().len(), 1);

    h.session.request_connection("P1", "Me").await.unwrap();
    assert_eq!(h.state("P1").await, Some(EndpointState::RequestSentByUs));
    assert!(h.transport.calls().contains(&Call::Connect("P1".into(), "Me".into())));

    // 握手回显由控制器自动接受
    h.initiated("P1", "Alex", false);
    h.settle().await;
    assert!(h.transport.calls().contains(&Call::Accept("P1".into())));
    assert_eq!(h.state("P1").await, Some(EndpointState::RequestSentByUs));

    h.result("P1", ConnectionStatus::Success);
    assert_eq!(
        h.next_event().await,
        SessionEvent::Connected {
            endpoint_id: "P1".to_string(),
            name: "Alex".to_string(),
        }
    );
    h.settle().await;

    let expected = codec::encode(&local_snapshot()).unwrap();
    assert_eq!(h.transport.sends(), vec![("P1".to_string(), expected)]);
    assert_eq!(h.state("P1").await, Some(EndpointState::Connected));
}

/// 对端请求 → 拒绝 → 重新发现时是新的 Discovered
#[tokio::test]
async fn test_reject_then_rediscover() {
    let mut h = Harness::started().await;

    h.initiated("P2", "Jamie", true);
    assert_eq!(
        h.next_event().await,
        SessionEvent::ConnectionRequested(ConnectionRequest {
            endpoint_id: "P2".to_string(),
            name: "Jamie".to_string(),
            auth_token: "1234".to_string(),
        })
    );
    assert_eq!(
        h.state("P2").await,
        Some(EndpointState::RequestReceivedFromPeer)
    );

    h.session.respond_to_request("P2", false).await.unwrap();
    assert_eq!(h.state("P2").await, Some(EndpointState::Rejected));
    assert!(h.transport.calls().contains(&Call::Reject("P2".into())));

    // 传输层随后回报的拒绝结果不会重复通知
    h.result("P2", ConnectionStatus::Rejected);
    h.assert_no_event().await;

    h.found("P2", "Jamie");
    assert!(matches!(h.next_event().await, SessionEvent::EndpointFound(_)));
    assert_eq!(h.state("P2").await, Some(EndpointState::Discovered));
}

/// 已拒绝的对端再次发起请求：直接回绝，不再提示
#[tokio::test]
async fn test_repeat_request_from_rejected_peer_is_declined() {
    let mut h = Harness::started().await;

    h.initiated("P2", "Jamie", true);
    assert!(matches!(
        h.next_event().await,
        SessionEvent::ConnectionRequested(_)
    ));
    h.session.respond_to_request("P2", false).await.unwrap();

    h.initiated("P2", "Jamie", true);
    h.assert_no_event().await;
    assert_eq!(h.state("P2").await, Some(EndpointState::Rejected));
    let rejects = h
        .transport
        .calls()
        .into_iter()
        .filter(|c| *c == Call::Reject("P2".into()))
        .count();
    assert_eq!(rejects, 2);

    // 重新发现后可以再次请求
    h.found("P2", "Jamie");
    assert!(matches!(h.next_event().await, SessionEvent::EndpointFound(_)));
    h.initiated("P2", "Jamie", true);
    assert!(matches!(
        h.next_event().await,
        SessionEvent::ConnectionRequested(_)
    ));
}

/// 已连接对端发来合法快照
#[tokio::test]
async fn test_payload_stored_on_connected_peer() {
    let mut h = Harness::started().await;
    h.connect_inbound("P3", "Sam").await;

    let remote = UserSnapshot {
        user_id: "u1".to_string(),
        total_score: 120,
        current_streak: 5,
        ..Default::default()
    };
    h.payload("P3", codec::encode(&remote).unwrap());

    assert_eq!(
        h.next_event().await,
        SessionEvent::DataReceived {
            endpoint_id: "P3".to_string(),
            snapshot: remote.clone(),
        }
    );
    let connected = h.session.connected().await.unwrap();
    assert_eq!(connected.len(), 1);
    assert_eq!(connected[0].endpoint_id, "P3");
    assert_eq!(connected[0].snapshot, Some(remote));
}

/// stop_all 之后迟到的事件被丢弃
#[tokio::test]
async fn test_late_events_after_stop_all_discarded() {
    let mut h = Harness::started().await;
    h.connect_inbound("P3", "Sam").await;

    h.session.stop_all().await;
    let calls = h.transport.calls();
    assert!(calls.contains(&Call::StopAdvertise));
    assert!(calls.contains(&Call::StopDiscover));
    assert!(calls.contains(&Call::DisconnectAll));

    h.payload("P3", codec::encode(&UserSnapshot::new("u1", "Sam")).unwrap());
    h.found("P9", "Late");
    h.inject(TransportEvent::Disconnected {
        endpoint_id: "P3".to_string(),
    });
    h.assert_no_event().await;

    assert!(h.session.connected().await.unwrap().is_empty());
    assert!(h.session.discovered().await.unwrap().is_empty());
    assert_eq!(h.session.status().await.unwrap(), SessionStatus::default());
}

// ============================================================================
// 不变量与边界情况
// ============================================================================

#[tokio::test]
async fn test_endpoint_lost_never_drops_connected() {
    let mut h = Harness::started().await;
    h.connect_inbound("P1", "Alex").await;

    for _ in 0..3 {
        h.inject(TransportEvent::EndpointLost {
            endpoint_id: "P1".to_string(),
        });
        h.found("P1", "Alex");
    }
    h.assert_no_event().await;
    assert_eq!(h.state("P1").await, Some(EndpointState::Connected));
    assert_eq!(h.session.connected().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_endpoint_lost_prunes_discovered() {
    let mut h = Harness::started().await;
    h.found("P1", "Alex");
    h.next_event().await;

    h.inject(TransportEvent::EndpointLost {
        endpoint_id: "P1".to_string(),
    });
    assert_eq!(
        h.next_event().await,
        SessionEvent::EndpointLost {
            endpoint_id: "P1".to_string()
        }
    );
    assert!(h.state("P1").await.is_none());
}

#[tokio::test]
async fn test_duplicate_accept_and_result_are_noops() {
    let mut h = Harness::started().await;
    h.connect_inbound("P1", "Alex").await;

    h.session.respond_to_request("P1", true).await.unwrap();
    h.result("P1", ConnectionStatus::Success);
    h.assert_no_event().await;

    let accepts = h
        .transport
        .calls()
        .into_iter()
        .filter(|c| *c == Call::Accept("P1".into()))
        .count();
    assert_eq!(accepts, 1);
    assert_eq!(h.transport.sends().len(), 1);
}

#[tokio::test]
async fn test_malformed_payload_is_swallowed() {
    let mut h = Harness::started().await;
    h.connect_inbound("P1", "Alex").await;

    h.payload("P1", b"\x00\x01not json".to_vec());
    h.payload("P1", br#"{"totalScore":-5}"#.to_vec());
    h.assert_no_event().await;

    assert_eq!(h.state("P1").await, Some(EndpointState::Connected));
    assert_eq!(h.session.connected().await.unwrap()[0].snapshot, None);
}

#[tokio::test]
async fn test_payload_from_unconnected_endpoint_ignored() {
    let mut h = Harness::started().await;
    h.found("P1", "Alex");
    h.next_event().await;

    h.payload("P1", codec::encode(&UserSnapshot::new("u1", "Alex")).unwrap());
    h.assert_no_event().await;
}

#[tokio::test]
async fn test_send_failure_keeps_connection() {
    let mut h = Harness::started().await;
    *h.transport.fail_send.lock().unwrap() = Some(TransportError::PayloadTooLarge {
        size: 10,
        max: 1,
    });
    h.connect_inbound("P1", "Alex").await;
    h.settle().await;

    assert_eq!(h.state("P1").await, Some(EndpointState::Connected));
    assert!(h.transport.sends().is_empty());

    // 界面手动重新同步
    *h.transport.fail_send.lock().unwrap() = None;
    h.session.send_local_snapshot_now("P1").await.unwrap();
    assert_eq!(h.transport.sends().len(), 1);
}

#[tokio::test]
async fn test_connect_failure_leaves_state_unchanged() {
    let mut h = Harness::started().await;
    h.found("P1", "Alex");
    h.next_event().await;

    *h.transport.fail_connect.lock().unwrap() = Some(TransportError::Unavailable);
    let err = h.session.request_connection("P1", "Me").await.unwrap_err();
    assert!(matches!(
        err,
        SessionError::Transport(TransportError::Unavailable)
    ));
    assert_eq!(h.state("P1").await, Some(EndpointState::Discovered));
    h.assert_no_event().await;
}

#[tokio::test]
async fn test_request_connection_requires_discovered() {
    let h = Harness::started().await;
    assert!(matches!(
        h.session.request_connection("nobody", "Me").await,
        Err(SessionError::UnknownEndpoint(_))
    ));

    h.initiated("P1", "Alex", true);
    h.settle().await;
    assert!(matches!(
        h.session.request_connection("P1", "Me").await,
        Err(SessionError::InvalidState {
            state: EndpointState::RequestReceivedFromPeer,
            ..
        })
    ));
}

#[tokio::test]
async fn test_start_failure_stays_pre_scan() {
    let h = Harness::new().await;
    *h.transport.fail_advertise.lock().unwrap() = Some(TransportError::Unavailable);

    let err = h
        .session
        .start_advertising_and_discovery("Me")
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::Transport(e) if e.is_unavailable()));
    assert_eq!(h.session.status().await.unwrap(), SessionStatus::default());

    // 用户打开无线电后重试
    *h.transport.fail_advertise.lock().unwrap() = None;
    h.session.start_advertising_and_discovery("Me").await.unwrap();
    let status = h.session.status().await.unwrap();
    assert!(status.is_advertising && status.is_discovering);
}

#[tokio::test]
async fn test_discover_failure_rolls_back_advertising() {
    let h = Harness::new().await;
    *h.transport.fail_discover.lock().unwrap() = Some(TransportError::PermissionDenied);

    assert!(h.session.start_advertising_and_discovery("Me").await.is_err());
    assert_eq!(
        h.transport.calls(),
        vec![Call::Advertise("Me".into()), Call::StopAdvertise]
    );
    assert!(!h.session.status().await.unwrap().is_advertising);
}

#[tokio::test]
async fn test_start_twice_is_error() {
    let h = Harness::started().await;
    assert!(matches!(
        h.session.start_advertising_and_discovery("Me").await,
        Err(SessionError::AlreadyRunning)
    ));
}

#[tokio::test]
async fn test_commands_rejected_before_start() {
    let h = Harness::new().await;
    assert!(matches!(
        h.session.request_connection("P1", "Me").await,
        Err(SessionError::NotRunning)
    ));
    assert!(matches!(
        h.session.respond_to_request("P1", true).await,
        Err(SessionError::NotRunning)
    ));
}

#[tokio::test]
async fn test_events_before_start_are_dropped() {
    let h = Harness::new().await;
    h.found("P1", "Alex");
    h.settle().await;
    h.session.start_advertising_and_discovery("Me").await.unwrap();
    assert!(h.session.discovered().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_auto_accept_skips_prompt() {
    let mut h = Harness::with_config(SessionConfig {
        auto_accept: true,
        ..test_config()
    })
    .await;
    h.session.start_advertising_and_discovery("Me").await.unwrap();

    h.initiated("P1", "Alex", true);
    h.assert_no_event().await;
    assert!(h.transport.calls().contains(&Call::Accept("P1".into())));

    h.result("P1", ConnectionStatus::Success);
    assert!(matches!(
        h.next_event().await,
        SessionEvent::Connected { .. }
    ));
}

#[tokio::test]
async fn test_simultaneous_requests_accept_without_prompt() {
    let mut h = Harness::started().await;
    h.found("P1", "Alex");
    h.next_event().await;
    h.session.request_connection("P1", "Me").await.unwrap();

    h.initiated("P1", "Alex", true);
    h.assert_no_event().await;
    assert!(h.transport.calls().contains(&Call::Accept("P1".into())));
    assert_eq!(h.state("P1").await, Some(EndpointState::RequestSentByUs));
}

#[tokio::test]
async fn test_peer_rejects_our_request() {
    let mut h = Harness::started().await;
    h.found("P1", "Alex");
    h.next_event().await;
    h.session.request_connection("P1", "Me").await.unwrap();

    h.result("P1", ConnectionStatus::Rejected);
    assert_eq!(
        h.next_event().await,
        SessionEvent::ConnectionRejected {
            endpoint_id: "P1".to_string()
        }
    );
    assert_eq!(h.state("P1").await, Some(EndpointState::Rejected));
}

#[tokio::test]
async fn test_handshake_failure_marks_disconnected() {
    let mut h = Harness::started().await;
    h.found("P1", "Alex");
    h.next_event().await;
    h.session.request_connection("P1", "Me").await.unwrap();

    h.result("P1", ConnectionStatus::Failed("timeout".to_string()));
    assert_eq!(
        h.next_event().await,
        SessionEvent::ConnectionFailed {
            endpoint_id: "P1".to_string(),
            reason: "timeout".to_string(),
        }
    );
    assert_eq!(h.state("P1").await, Some(EndpointState::Disconnected));
}

#[tokio::test]
async fn test_peer_disconnect_then_rediscover() {
    let mut h = Harness::started().await;
    h.connect_inbound("P1", "Alex").await;

    h.inject(TransportEvent::Disconnected {
        endpoint_id: "P1".to_string(),
    });
    assert_eq!(
        h.next_event().await,
        SessionEvent::Disconnected {
            endpoint_id: "P1".to_string()
        }
    );
    assert!(h.session.connected().await.unwrap().is_empty());

    h.found("P1", "Alex");
    assert!(matches!(h.next_event().await, SessionEvent::EndpointFound(_)));
    assert_eq!(h.state("P1").await, Some(EndpointState::Discovered));
}

#[tokio::test]
async fn test_local_disconnect() {
    let mut h = Harness::started().await;
    h.connect_inbound("P1", "Alex").await;

    h.session.disconnect("P1").await.unwrap();
    assert!(h.transport.calls().contains(&Call::Disconnect("P1".into())));
    assert_eq!(
        h.next_event().await,
        SessionEvent::Disconnected {
            endpoint_id: "P1".to_string()
        }
    );

    assert!(matches!(
        h.session.disconnect("P1").await,
        Err(SessionError::NotConnected(_))
    ));
    assert!(matches!(
        h.session.send_local_snapshot_now("P1").await,
        Err(SessionError::NotConnected(_))
    ));
}

#[tokio::test]
async fn test_confirm_friend() {
    let mut h = Harness::started().await;
    h.connect_inbound("P1", "Alex").await;

    assert!(matches!(
        h.session.confirm_friend("P1").await,
        Err(SessionError::SnapshotUnavailable(_))
    ));

    let remote = UserSnapshot::new("u1", "Alex");
    h.payload("P1", codec::encode(&remote).unwrap());
    h.next_event().await;

    h.session.confirm_friend("P1").await.unwrap();
    assert_eq!(
        *h.friends.confirmed.lock().unwrap(),
        vec![("P1".to_string(), remote)]
    );
}

#[tokio::test]
async fn test_subscribe_after_start() {
    let mut h = Harness::started().await;
    let (extra, mut extra_rx) = SimpleSessionCallback::new();
    h.session.subscribe(Arc::new(extra)).await.unwrap();

    h.found("P1", "Alex");
    h.next_event().await;
    assert!(matches!(
        extra_rx.recv().await,
        Some(SessionEvent::EndpointFound(_))
    ));
}

#[tokio::test]
async fn test_shutdown_tears_down() {
    let h = Harness::started().await;
    let transport = h.transport.clone();
    h.session.shutdown().await;
    assert!(transport.calls().contains(&Call::DisconnectAll));
}
