//! Nearby Core Library
//!
//! "附近好友"功能的点对点发现与连接生命周期管理
//!
//! # 模块
//!
//! - **transport**: 无线传输抽象、事件通道、进程内 loopback 介质
//! - **registry**: 端点注册表（发现 → 请求 → 连接 → 断开）
//! - **controller**: 连接生命周期状态机（单写者任务）
//! - **codec**: 健康统计快照的线上编解码
//! - **session**: 面向界面的会话门面和事件回调
//! - **config**: 会话配置和持久化
//!
//! # 使用示例
//!
//! ```ignore
//! use nearby_core::{Session, SessionConfig, SimpleSessionCallback, SessionEvent};
//!
//! let session = Session::builder(config, transport, snapshots)
//!     .with_callback(Arc::new(callback))
//!     .start(events_rx);
//! session.start_advertising_and_discovery(&config.local_name).await?;
//!
//! while let Some(event) = events.recv().await {
//!     match event {
//!         SessionEvent::EndpointFound(ep) => session.request_connection(&ep.id, "Alex").await?,
//!         SessionEvent::DataReceived { snapshot, .. } => println!("{}", snapshot.total_score),
//!         _ => {}
//!     }
//! }
//! session.shutdown().await;
//! ```

pub mod codec;
pub mod config;
mod controller;
pub mod error;
pub mod registry;
pub mod session;
pub mod snapshot;
pub mod transport;

pub use config::SessionConfig;
pub use error::{DecodeError, SessionError, TransportError};
pub use registry::{Endpoint, EndpointRegistry, EndpointState};
pub use session::{
    ConnectionRequest, Session, SessionBuilder, SessionCallback, SessionEvent, SessionStatus,
    SimpleSessionCallback,
};
pub use snapshot::{ConnectedPeer, FriendSink, SnapshotProvider, UserSnapshot};
pub use transport::{
    ConnectionStatus, Transport, TransportEvent, TransportEventReceiver, TransportEventSender,
    event_channel,
};
