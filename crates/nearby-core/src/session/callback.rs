//! 会话事件回调
//!
//! 回调在控制器任务中被同步调用，实现必须快速返回、不能阻塞。
//! 需要异步处理时使用 [`SimpleSessionCallback`] 转成通道。

use crate::registry::Endpoint;
use crate::snapshot::UserSnapshot;
use tokio::sync::mpsc;

/// 对端发来的连接请求，需要用户确认
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionRequest {
    pub endpoint_id: String,
    pub name: String,
    /// 双方界面上显示的校验码
    pub auth_token: String,
}

/// 会话状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SessionStatus {
    pub is_advertising: bool,
    pub is_discovering: bool,
    pub discovered: usize,
    pub connected: usize,
}

/// 会话事件
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    EndpointFound(Endpoint),
    EndpointLost {
        endpoint_id: String,
    },
    ConnectionRequested(ConnectionRequest),
    Connected {
        endpoint_id: String,
        name: String,
    },
    ConnectionRejected {
        endpoint_id: String,
    },
    ConnectionFailed {
        endpoint_id: String,
        reason: String,
    },
    Disconnected {
        endpoint_id: String,
    },
    DataReceived {
        endpoint_id: String,
        snapshot: UserSnapshot,
    },
}

impl SessionEvent {
    pub(crate) fn dispatch(&self, callback: &dyn SessionCallback) {
        match self {
            SessionEvent::EndpointFound(endpoint) => callback.on_endpoint_found(endpoint),
            SessionEvent::EndpointLost { endpoint_id } => callback.on_endpoint_lost(endpoint_id),
            SessionEvent::ConnectionRequested(request) => {
                callback.on_connection_requested(request)
            }
            SessionEvent::Connected { endpoint_id, name } => {
                callback.on_connected(endpoint_id, name)
            }
            SessionEvent::ConnectionRejected { endpoint_id } => {
                callback.on_connection_rejected(endpoint_id)
            }
            SessionEvent::ConnectionFailed {
                endpoint_id,
                reason,
            } => callback.on_connection_failed(endpoint_id, reason),
            SessionEvent::Disconnected { endpoint_id } => callback.on_disconnected(endpoint_id),
            SessionEvent::DataReceived {
                endpoint_id,
                snapshot,
            } => callback.on_data_received(endpoint_id, snapshot),
        }
    }
}

/// 会话事件回调接口
///
/// 所有方法都有空的默认实现，界面只需实现关心的部分。
pub trait SessionCallback: Send + Sync {
    /// 发现新设备
    fn on_endpoint_found(&self, _endpoint: &Endpoint) {}
    /// 设备不再广播
    fn on_endpoint_lost(&self, _endpoint_id: &str) {}
    /// 对端请求连接，调用 `respond_to_request` 作答
    fn on_connection_requested(&self, _request: &ConnectionRequest) {}
    /// 连接建立
    fn on_connected(&self, _endpoint_id: &str, _name: &str) {}
    /// 握手被拒绝
    fn on_connection_rejected(&self, _endpoint_id: &str) {}
    /// 握手失败
    fn on_connection_failed(&self, _endpoint_id: &str, _reason: &str) {}
    /// 连接断开
    fn on_disconnected(&self, _endpoint_id: &str) {}
    /// 收到对端快照
    fn on_data_received(&self, _endpoint_id: &str, _snapshot: &UserSnapshot) {}
}

/// 简化的回调实现，把事件转发到通道
pub struct SimpleSessionCallback {
    tx: mpsc::Sender<SessionEvent>,
}

impl SimpleSessionCallback {
    pub fn new() -> (Self, mpsc::Receiver<SessionEvent>) {
        let (tx, rx) = mpsc::channel(64);
        (Self { tx }, rx)
    }

    fn forward(&self, event: SessionEvent) {
        if let Err(e) = self.tx.try_send(event) {
            log::warn!("Session event dropped: {}", e);
        }
    }
}

impl SessionCallback for SimpleSessionCallback {
    fn on_endpoint_found(&self, endpoint: &Endpoint) {
        self.forward(SessionEvent::EndpointFound(endpoint.clone()));
    }

    fn on_endpoint_lost(&self, endpoint_id: &str) {
        self.forward(SessionEvent::EndpointLost {
            endpoint_id: endpoint_id.to_string(),
        });
    }

    fn on_connection_requested(&self, request: &ConnectionRequest) {
        self.forward(SessionEvent::ConnectionRequested(request.clone()));
    }

    fn on_connected(&self, endpoint_id: &str, name: &str) {
        self.forward(SessionEvent::Connected {
            endpoint_id: endpoint_id.to_string(),
            name: name.to_string(),
        });
    }

    fn on_connection_rejected(&self, endpoint_id: &str) {
        self.forward(SessionEvent::ConnectionRejected {
            endpoint_id: endpoint_id.to_string(),
        });
    }

    fn on_connection_failed(&self, endpoint_id: &str, reason: &str) {
        self.forward(SessionEvent::ConnectionFailed {
            endpoint_id: endpoint_id.to_string(),
            reason: reason.to_string(),
        });
    }

    fn on_disconnected(&self, endpoint_id: &str) {
        self.forward(SessionEvent::Disconnected {
            endpoint_id: endpoint_id.to_string(),
        });
    }

    fn on_data_received(&self, endpoint_id: &str, snapshot: &UserSnapshot) {
        self.forward(SessionEvent::DataReceived {
            endpoint_id: endpoint_id.to_string(),
            snapshot: snapshot.clone(),
        });
    }
}
