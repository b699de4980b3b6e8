//! 错误类型
//!
//! 只有 `TransportError` 的不可用类错误和握手拒绝会被呈现给用户，
//! 其余错误都在会话内部吸收。

use thiserror::Error;

use crate::registry::EndpointState;

/// 传输层错误
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// 无线电关闭或不可用
    #[error("radio transport unavailable")]
    Unavailable,
    /// 缺少权限或未授权
    #[error("permission denied by the platform")]
    PermissionDenied,
    /// 端点未知（可能已经断开）
    #[error("unknown endpoint '{0}'")]
    UnknownEndpoint(String),
    /// 单次发送的负载超出限制
    #[error("payload of {size} bytes exceeds the {max} byte limit")]
    PayloadTooLarge { size: usize, max: usize },
    #[error("already advertising")]
    AlreadyAdvertising,
    #[error("already discovering")]
    AlreadyDiscovering,
}

impl TransportError {
    /// 是否属于"无线电/权限不可用"，用户可以打开无线电后重试
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            TransportError::Unavailable | TransportError::PermissionDenied
        )
    }
}

/// 负载解码错误
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("payload of {size} bytes exceeds the {max} byte limit")]
    TooLarge { size: usize, max: usize },
    #[error("malformed snapshot payload: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// 会话层错误，由 `Session` 的命令返回
#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("session is not advertising or discovering")]
    NotRunning,
    #[error("session is already advertising and discovering")]
    AlreadyRunning,
    #[error("unknown endpoint '{0}'")]
    UnknownEndpoint(String),
    #[error("endpoint '{id}' is {state:?}, which does not allow this operation")]
    InvalidState { id: String, state: EndpointState },
    #[error("endpoint '{0}' is not connected")]
    NotConnected(String),
    #[error("no snapshot received from endpoint '{0}' yet")]
    SnapshotUnavailable(String),
    #[error("no friend sink registered")]
    NoFriendSink,
    #[error("failed to encode local snapshot: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("session controller has shut down")]
    Closed,
}
