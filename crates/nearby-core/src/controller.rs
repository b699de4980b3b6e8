//! 连接生命周期控制器
//!
//! 一个独立的 tokio 任务，是注册表的唯一写者。两路输入：
//! - 传输层事件（来自任意线程，经无界通道汇入）
//! - `Session` 发来的命令（带 oneshot 回复）
//!
//! 两路输入在同一个循环里串行处理，因此注册表的读改写不会交错。
//! 会话未运行时（`stop_all` 之后）到达的传输事件一律静默丢弃。

use log::{debug, info, trace, warn};

use crate::codec;
use crate::config::SessionConfig;
use crate::error::SessionError;
use crate::registry::{Endpoint, EndpointRegistry, EndpointState};
use crate::session::{ConnectionRequest, SessionCallback, SessionEvent, SessionStatus};
use crate::snapshot::{ConnectedPeer, FriendSink, SnapshotProvider};
use crate::transport::{ConnectionStatus, Transport, TransportEvent, TransportEventReceiver};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

type Reply<T> = oneshot::Sender<T>;

/// `Session` 发给控制器的命令
pub(crate) enum Command {
    Start {
        local_name: String,
        reply: Reply<Result<(), SessionError>>,
    },
    StopAll {
        reply: Reply<()>,
    },
    RequestConnection {
        endpoint_id: String,
        local_name: String,
        reply: Reply<Result<(), SessionError>>,
    },
    Respond {
        endpoint_id: String,
        accept: bool,
        reply: Reply<Result<(), SessionError>>,
    },
    Disconnect {
        endpoint_id: String,
        reply: Reply<Result<(), SessionError>>,
    },
    SendSnapshot {
        endpoint_id: String,
        reply: Reply<Result<(), SessionError>>,
    },
    ConfirmFriend {
        endpoint_id: String,
        reply: Reply<Result<(), SessionError>>,
    },
    Subscribe {
        callback: Arc<dyn SessionCallback>,
        reply: Reply<()>,
    },
    GetEndpoint {
        endpoint_id: String,
        reply: Reply<Option<Endpoint>>,
    },
    Discovered {
        reply: Reply<Vec<Endpoint>>,
    },
    Connected {
        reply: Reply<Vec<ConnectedPeer>>,
    },
    Status {
        reply: Reply<SessionStatus>,
    },
}

pub(crate) struct Controller {
    config: SessionConfig,
    transport: Arc<dyn Transport>,
    snapshots: Arc<dyn SnapshotProvider>,
    friend_sink: Option<Arc<dyn FriendSink>>,
    callbacks: Vec<Arc<dyn SessionCallback>>,
    registry: EndpointRegistry,
    is_advertising: bool,
    is_discovering: bool,
}

impl Controller {
    pub(crate) fn new(
        config: SessionConfig,
        transport: Arc<dyn Transport>,
        snapshots: Arc<dyn SnapshotProvider>,
        friend_sink: Option<Arc<dyn FriendSink>>,
        callbacks: Vec<Arc<dyn SessionCallback>>,
    ) -> Self {
        Self {
            config,
            transport,
            snapshots,
            friend_sink,
            callbacks,
            registry: EndpointRegistry::new(),
            is_advertising: false,
            is_discovering: false,
        }
    }

    /// 主循环，命令通道关闭（`Session` 被释放）时拆除会话并退出
    pub(crate) async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut events: TransportEventReceiver,
    ) {
        let mut events_open = true;

        loop {
            tokio::select! {
                biased;
                event = events.recv(), if events_open => match event {
                    Some(event) => self.handle_event(event).await,
                    None => {
                        debug!("Transport event channel closed");
                        events_open = false;
                    }
                },
                command = commands.recv() => match command {
                    Some(command) => {
                        if matches!(command, Command::Start { .. }) {
                            // 上一轮会话遗留的事件不属于新的发现状态
                            let mut stale = 0usize;
                            while events.try_recv().is_ok() {
                                stale += 1;
                            }
                            if stale > 0 {
                                debug!("Dropped {} stale transport event(s) before start", stale);
                            }
                        }
                        self.handle_command(command).await;
                    }
                    None => break,
                },
            }
        }

        self.teardown().await;
        debug!("Session controller stopped");
    }

    fn is_running(&self) -> bool {
        self.is_advertising || self.is_discovering
    }

    fn notify(&self, event: SessionEvent) {
        trace!("Session event: {:?}", event);
        for callback in &self.callbacks {
            event.dispatch(callback.as_ref());
        }
    }

    // ------------------------------------------------------------------
    // 传输事件
    // ------------------------------------------------------------------

    async fn handle_event(&mut self, event: TransportEvent) {
        if !self.is_running() {
            debug!(
                "Discarding transport event for {} after teardown",
                event.endpoint_id()
            );
            return;
        }

        match event {
            TransportEvent::EndpointFound { endpoint_id, name } => {
                if self.registry.upsert_discovered(&endpoint_id, &name) {
                    info!("Endpoint found: {} ('{}')", endpoint_id, name);
                    if let Some(endpoint) = self.registry.get(&endpoint_id) {
                        self.notify(SessionEvent::EndpointFound(endpoint));
                    }
                }
            }
            TransportEvent::EndpointLost { endpoint_id } => {
                if self.registry.remove(&endpoint_id) {
                    info!("Endpoint lost: {}", endpoint_id);
                    self.notify(SessionEvent::EndpointLost { endpoint_id });
                } else {
                    debug!("Ignoring endpoint-lost for {}", endpoint_id);
                }
            }
            TransportEvent::ConnectionInitiated {
                endpoint_id,
                name,
                auth_token,
                incoming,
            } => {
                self.on_connection_initiated(endpoint_id, name, auth_token, incoming)
                    .await;
            }
            TransportEvent::ConnectionResult {
                endpoint_id,
                status,
            } => {
                self.on_connection_result(endpoint_id, status).await;
            }
            TransportEvent::PayloadReceived { endpoint_id, bytes } => {
                self.on_payload(endpoint_id, bytes);
            }
            TransportEvent::Disconnected { endpoint_id } => {
                if self.registry.state(&endpoint_id) == Some(EndpointState::Connected) {
                    self.registry.mark_disconnected(&endpoint_id);
                    info!("Connection lost: {}", endpoint_id);
                    self.notify(SessionEvent::Disconnected { endpoint_id });
                } else {
                    debug!("Ignoring disconnection for {}", endpoint_id);
                }
            }
        }
    }

    async fn on_connection_initiated(
        &mut self,
        endpoint_id: String,
        name: String,
        auth_token: String,
        incoming: bool,
    ) {
        let state = self.registry.state(&endpoint_id);

        if state == Some(EndpointState::RequestSentByUs) {
            // 本端请求的握手回显，或双方同时发起：直接接受，由传输层协商方向
            debug!(
                "Accepting handshake with {} (incoming={}, token={})",
                endpoint_id, incoming, auth_token
            );
            self.auto_accept(&endpoint_id).await;
            return;
        }

        if !incoming {
            debug!("Ignoring outgoing handshake for {} in {:?}", endpoint_id, state);
            return;
        }

        if state == Some(EndpointState::Rejected) {
            // 本轮已拒绝过的端点：直接回绝，不再提示用户
            debug!("Declining repeated request from rejected {}", endpoint_id);
            if let Err(e) = self.transport.reject(&endpoint_id).await {
                debug!("Transport reject for {} failed: {}", endpoint_id, e);
            }
            return;
        }

        if !self.registry.mark_requested_by_peer(&endpoint_id, &name) {
            debug!("Ignoring duplicate request from {} in {:?}", endpoint_id, state);
            return;
        }

        info!(
            "Connection requested by {} ('{}'), token {}",
            endpoint_id, name, auth_token
        );
        if self.config.auto_accept {
            self.auto_accept(&endpoint_id).await;
        } else {
            self.notify(SessionEvent::ConnectionRequested(ConnectionRequest {
                endpoint_id,
                name,
                auth_token,
            }));
        }
    }

    /// 自动接受握手；失败时保持当前状态，由随后的连接结果收尾
    async fn auto_accept(&self, endpoint_id: &str) {
        if let Err(e) = self.transport.accept(endpoint_id).await {
            warn!("Failed to accept handshake with {}: {}", endpoint_id, e);
        }
    }

    async fn on_connection_result(&mut self, endpoint_id: String, status: ConnectionStatus) {
        match status {
            ConnectionStatus::Success => {
                if !self.registry.mark_connected(&endpoint_id) {
                    debug!("Ignoring connection result for {}", endpoint_id);
                    return;
                }
                let name = self
                    .registry
                    .get(&endpoint_id)
                    .map(|e| e.display_name)
                    .unwrap_or_default();
                info!("Connected to {} ('{}')", endpoint_id, name);
                self.notify(SessionEvent::Connected {
                    endpoint_id: endpoint_id.clone(),
                    name,
                });

                // 只推送一次；失败不回滚 Connected
                if let Err(e) = self.push_local_snapshot(&endpoint_id).await {
                    warn!(
                        "Failed to send local snapshot to {}: {} (stats not yet synced)",
                        endpoint_id, e
                    );
                }
            }
            ConnectionStatus::Rejected => {
                if self.registry.mark_rejected(&endpoint_id) {
                    info!("Connection with {} rejected", endpoint_id);
                    self.notify(SessionEvent::ConnectionRejected { endpoint_id });
                } else {
                    debug!("Ignoring rejection for {}", endpoint_id);
                }
            }
            ConnectionStatus::Failed(reason) => {
                let pending = self
                    .registry
                    .state(&endpoint_id)
                    .is_some_and(|s| s.is_pending());
                if pending && self.registry.mark_disconnected(&endpoint_id) {
                    warn!("Connection with {} failed: {}", endpoint_id, reason);
                    self.notify(SessionEvent::ConnectionFailed {
                        endpoint_id,
                        reason,
                    });
                } else {
                    debug!("Ignoring failure for {}: {}", endpoint_id, reason);
                }
            }
        }
    }

    fn on_payload(&mut self, endpoint_id: String, bytes: Vec<u8>) {
        if self.registry.state(&endpoint_id) != Some(EndpointState::Connected) {
            debug!(
                "Ignoring {} byte payload from unconnected {}",
                bytes.len(),
                endpoint_id
            );
            return;
        }

        match codec::decode_with_limit(&bytes, self.config.max_payload_bytes) {
            Ok(snapshot) => {
                debug!(
                    "Snapshot from {}: user='{}', score={}",
                    endpoint_id, snapshot.user_id, snapshot.total_score
                );
                self.registry.store_snapshot(&endpoint_id, snapshot.clone());
                self.notify(SessionEvent::DataReceived {
                    endpoint_id,
                    snapshot,
                });
            }
            Err(e) => {
                warn!("Discarding payload from {}: {}", endpoint_id, e);
            }
        }
    }

    async fn push_local_snapshot(&self, endpoint_id: &str) -> Result<(), SessionError> {
        let snapshot = self.snapshots.produce_local_snapshot();
        let bytes = codec::encode(&snapshot).map_err(SessionError::Encode)?;
        debug!("Sending local snapshot to {} ({} bytes)", endpoint_id, bytes.len());
        self.transport.send(endpoint_id, bytes).await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // 命令
    // ------------------------------------------------------------------

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Start { local_name, reply } => {
                let _ = reply.send(self.start(&local_name).await);
            }
            Command::StopAll { reply } => {
                self.teardown().await;
                let _ = reply.send(());
            }
            Command::RequestConnection {
                endpoint_id,
                local_name,
                reply,
            } => {
                let _ = reply.send(self.request_connection(&endpoint_id, &local_name).await);
            }
            Command::Respond {
                endpoint_id,
                accept,
                reply,
            } => {
                let _ = reply.send(self.respond(&endpoint_id, accept).await);
            }
            Command::Disconnect { endpoint_id, reply } => {
                let _ = reply.send(self.disconnect(&endpoint_id).await);
            }
            Command::SendSnapshot { endpoint_id, reply } => {
                let result = match self.require_connected(&endpoint_id) {
                    Ok(()) => self.push_local_snapshot(&endpoint_id).await,
                    Err(e) => Err(e),
                };
                let _ = reply.send(result);
            }
            Command::ConfirmFriend { endpoint_id, reply } => {
                let _ = reply.send(self.confirm_friend(&endpoint_id));
            }
            Command::Subscribe { callback, reply } => {
                self.callbacks.push(callback);
                let _ = reply.send(());
            }
            Command::GetEndpoint { endpoint_id, reply } => {
                let _ = reply.send(self.registry.get(&endpoint_id));
            }
            Command::Discovered { reply } => {
                let _ = reply.send(self.registry.discovered());
            }
            Command::Connected { reply } => {
                let _ = reply.send(self.registry.connected());
            }
            Command::Status { reply } => {
                let _ = reply.send(SessionStatus {
                    is_advertising: self.is_advertising,
                    is_discovering: self.is_discovering,
                    discovered: self.registry.discovered().len(),
                    connected: self.registry.connected().len(),
                });
            }
        }
    }

    async fn start(&mut self, local_name: &str) -> Result<(), SessionError> {
        if self.is_running() {
            return Err(SessionError::AlreadyRunning);
        }

        self.transport.advertise(local_name).await?;
        self.is_advertising = true;

        if let Err(e) = self.transport.discover().await {
            // 回到扫描前状态
            self.transport.stop_advertise().await;
            self.is_advertising = false;
            return Err(e.into());
        }
        self.is_discovering = true;

        info!(
            "Advertising as '{}' and discovering service '{}'",
            local_name, self.config.service_id
        );
        Ok(())
    }

    /// 停止广播/扫描，断开所有端点并清空注册表
    async fn teardown(&mut self) {
        if !self.is_running() && self.registry.is_empty() {
            return;
        }
        self.transport.stop_advertise().await;
        self.transport.stop_discover().await;
        self.transport.disconnect_all().await;

        let released = self.registry.len();
        self.registry.clear();
        self.is_advertising = false;
        self.is_discovering = false;
        info!("Session stopped, released {} endpoint(s)", released);
    }

    async fn request_connection(
        &mut self,
        endpoint_id: &str,
        local_name: &str,
    ) -> Result<(), SessionError> {
        if !self.is_running() {
            return Err(SessionError::NotRunning);
        }
        match self.registry.state(endpoint_id) {
            None => Err(SessionError::UnknownEndpoint(endpoint_id.to_string())),
            Some(EndpointState::Discovered) => {
                // 发送失败时状态保持 Discovered
                self.transport.connect(endpoint_id, local_name).await?;
                self.registry.mark_requested_by_us(endpoint_id);
                info!("Connection requested to {}", endpoint_id);
                Ok(())
            }
            Some(state) => Err(SessionError::InvalidState {
                id: endpoint_id.to_string(),
                state,
            }),
        }
    }

    async fn respond(&mut self, endpoint_id: &str, accept: bool) -> Result<(), SessionError> {
        if !self.is_running() {
            return Err(SessionError::NotRunning);
        }
        match self.registry.state(endpoint_id) {
            None => Err(SessionError::UnknownEndpoint(endpoint_id.to_string())),
            Some(EndpointState::RequestReceivedFromPeer) if accept => {
                // 保持 RequestReceivedFromPeer 直到结果到达
                self.transport.accept(endpoint_id).await?;
                debug!("Accepted request from {}", endpoint_id);
                Ok(())
            }
            Some(EndpointState::RequestReceivedFromPeer) => {
                if let Err(e) = self.transport.reject(endpoint_id).await {
                    debug!("Transport reject for {} failed: {}", endpoint_id, e);
                }
                self.registry.mark_rejected(endpoint_id);
                info!("Rejected request from {}", endpoint_id);
                Ok(())
            }
            Some(EndpointState::Connected) if accept => {
                debug!("Endpoint {} already connected, ignoring accept", endpoint_id);
                Ok(())
            }
            Some(state) => Err(SessionError::InvalidState {
                id: endpoint_id.to_string(),
                state,
            }),
        }
    }

    async fn disconnect(&mut self, endpoint_id: &str) -> Result<(), SessionError> {
        let state = self.registry.state(endpoint_id);
        let connected_or_pending =
            state.is_some_and(|s| s == EndpointState::Connected || s.is_pending());
        if !connected_or_pending {
            return Err(SessionError::NotConnected(endpoint_id.to_string()));
        }

        self.transport.disconnect(endpoint_id).await;
        self.registry.mark_disconnected(endpoint_id);
        info!("Disconnected from {}", endpoint_id);
        // 传输层不会向主动断开的一方回报断开事件
        self.notify(SessionEvent::Disconnected {
            endpoint_id: endpoint_id.to_string(),
        });
        Ok(())
    }

    fn require_connected(&self, endpoint_id: &str) -> Result<(), SessionError> {
        if self.registry.state(endpoint_id) == Some(EndpointState::Connected) {
            Ok(())
        } else {
            Err(SessionError::NotConnected(endpoint_id.to_string()))
        }
    }

    fn confirm_friend(&self, endpoint_id: &str) -> Result<(), SessionError> {
        self.require_connected(endpoint_id)?;
        let snapshot = self
            .registry
            .snapshot(endpoint_id)
            .ok_or_else(|| SessionError::SnapshotUnavailable(endpoint_id.to_string()))?;
        let sink = self.friend_sink.as_ref().ok_or(SessionError::NoFriendSink)?;
        sink.on_friend_confirmed(endpoint_id, snapshot);
        info!("Friend confirmed: {} ('{}')", endpoint_id, snapshot.user_name);
        Ok(())
    }
}
