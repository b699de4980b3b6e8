//! 传输适配层
//!
//! 对本地点对点无线服务（蓝牙 / WiFi Direct 一类）的能力抽象。
//! 所有命令都是"发出即返回"：`Ok` 只表示命令已经交给无线电，
//! 结果通过 [`TransportEvent`] 异步送达。
//!
//! # 握手
//!
//! 发起方调用 `connect` 后，双方都会收到 `ConnectionInitiated`
//! （发起方 `incoming = false`，接收方 `incoming = true`），
//! 双方都 `accept` 之后才会收到 `ConnectionResult::Success`。

pub mod loopback;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::TransportError;

/// 握手结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionStatus {
    Success,
    Rejected,
    Failed(String),
}

/// 无线电上报的事件，可能来自任意线程
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    EndpointFound {
        endpoint_id: String,
        name: String,
    },
    EndpointLost {
        endpoint_id: String,
    },
    ConnectionInitiated {
        endpoint_id: String,
        name: String,
        /// 双方显示的短校验码
        auth_token: String,
        incoming: bool,
    },
    ConnectionResult {
        endpoint_id: String,
        status: ConnectionStatus,
    },
    PayloadReceived {
        endpoint_id: String,
        bytes: Vec<u8>,
    },
    Disconnected {
        endpoint_id: String,
    },
}

impl TransportEvent {
    pub fn endpoint_id(&self) -> &str {
        match self {
            TransportEvent::EndpointFound { endpoint_id, .. }
            | TransportEvent::EndpointLost { endpoint_id }
            | TransportEvent::ConnectionInitiated { endpoint_id, .. }
            | TransportEvent::ConnectionResult { endpoint_id, .. }
            | TransportEvent::PayloadReceived { endpoint_id, .. }
            | TransportEvent::Disconnected { endpoint_id } => endpoint_id,
        }
    }
}

pub type TransportEventSender = mpsc::UnboundedSender<TransportEvent>;
pub type TransportEventReceiver = mpsc::UnboundedReceiver<TransportEvent>;

/// 创建事件通道
///
/// 无界通道：传输层在处理控制器命令的过程中也会向同一通道投递事件，
/// 有界通道在这里会造成自锁。
pub fn event_channel() -> (TransportEventSender, TransportEventReceiver) {
    mpsc::unbounded_channel()
}

/// 传输适配接口
#[async_trait]
pub trait Transport: Send + Sync {
    /// 以 `local_name` 开始广播；已在广播时返回 `AlreadyAdvertising`
    async fn advertise(&self, local_name: &str) -> Result<(), TransportError>;
    async fn stop_advertise(&self);
    /// 开始扫描广播相同服务标识的设备
    async fn discover(&self) -> Result<(), TransportError>;
    async fn stop_discover(&self);
    /// 发起握手，`Ok` 只表示请求已发出
    async fn connect(&self, endpoint_id: &str, local_name: &str) -> Result<(), TransportError>;
    async fn accept(&self, endpoint_id: &str) -> Result<(), TransportError>;
    async fn reject(&self, endpoint_id: &str) -> Result<(), TransportError>;
    async fn disconnect(&self, endpoint_id: &str);
    async fn disconnect_all(&self);
    async fn send(&self, endpoint_id: &str, bytes: Vec<u8>) -> Result<(), TransportError>;
}
