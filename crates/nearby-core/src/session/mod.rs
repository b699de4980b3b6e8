//! 会话门面
//!
//! 进入"附近好友"功能时创建 [`Session`]，离开时 `shutdown`（或直接释放）。
//! 门面本身不持有状态，也没有业务逻辑：每个调用都转成命令交给控制器任务，
//! 注册表、广播/扫描标志都归该任务所有。
//!
//! # 使用示例
//!
//! ```ignore
//! use nearby_core::{Session, SessionConfig, SimpleSessionCallback, UserSnapshot};
//! use nearby_core::transport::{event_channel, loopback::LoopbackMedium};
//!
//! let medium = LoopbackMedium::new();
//! let (events_tx, events_rx) = event_channel();
//! let transport = medium.transport("wellness.nearby.friends", events_tx).await;
//!
//! let (callback, mut events) = SimpleSessionCallback::new();
//! let session = Session::builder(config, Arc::new(transport), Arc::new(|| my_snapshot()))
//!     .with_callback(Arc::new(callback))
//!     .start(events_rx);
//!
//! session.start_advertising_and_discovery("Alex").await?;
//! while let Some(event) = events.recv().await { /* 更新界面 */ }
//! ```

mod callback;

#[cfg(test)]
mod tests;

pub use callback::{
    ConnectionRequest, SessionCallback, SessionEvent, SessionStatus, SimpleSessionCallback,
};

use crate::config::SessionConfig;
use crate::controller::{Command, Controller};
use crate::error::SessionError;
use crate::registry::Endpoint;
use crate::snapshot::{ConnectedPeer, FriendSink, SnapshotProvider};
use crate::transport::{Transport, TransportEventReceiver};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// 会话构建器
pub struct SessionBuilder {
    config: SessionConfig,
    transport: Arc<dyn Transport>,
    snapshots: Arc<dyn SnapshotProvider>,
    friend_sink: Option<Arc<dyn FriendSink>>,
    callbacks: Vec<Arc<dyn SessionCallback>>,
}

impl SessionBuilder {
    /// 设置好友确认接收端
    pub fn with_friend_sink(mut self, sink: Arc<dyn FriendSink>) -> Self {
        self.friend_sink = Some(sink);
        self
    }

    /// 在控制器启动前注册回调，保证不会错过最早的事件
    pub fn with_callback(mut self, callback: Arc<dyn SessionCallback>) -> Self {
        self.callbacks.push(callback);
        self
    }

    /// 启动控制器任务，必须在 tokio 运行时中调用
    pub fn start(self, events: TransportEventReceiver) -> Session {
        let (tx, rx) = mpsc::channel(32);
        let controller = Controller::new(
            self.config,
            self.transport,
            self.snapshots,
            self.friend_sink,
            self.callbacks,
        );
        let task = tokio::spawn(controller.run(rx, events));
        Session { commands: tx, task }
    }
}

/// 附近好友会话句柄
pub struct Session {
    commands: mpsc::Sender<Command>,
    task: JoinHandle<()>,
}

impl Session {
    pub fn builder(
        config: SessionConfig,
        transport: Arc<dyn Transport>,
        snapshots: Arc<dyn SnapshotProvider>,
    ) -> SessionBuilder {
        SessionBuilder {
            config,
            transport,
            snapshots,
            friend_sink: None,
            callbacks: Vec::new(),
        }
    }

    /// 不带好友接收端和预注册回调的快捷方式
    pub fn start(
        config: SessionConfig,
        transport: Arc<dyn Transport>,
        events: TransportEventReceiver,
        snapshots: Arc<dyn SnapshotProvider>,
    ) -> Self {
        Self::builder(config, transport, snapshots).start(events)
    }

    async fn call<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T, SessionError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .await
            .map_err(|_| SessionError::Closed)?;
        rx.await.map_err(|_| SessionError::Closed)
    }

    /// 开始广播和扫描
    ///
    /// 无线电不可用时返回传输错误，会话保持在扫描前状态，可以重试。
    pub async fn start_advertising_and_discovery(&self, local_name: &str) -> Result<(), SessionError> {
        let local_name = local_name.to_string();
        self.call(|reply| Command::Start { local_name, reply }).await?
    }

    /// 停止广播/扫描并释放所有端点，之后到达的传输事件被丢弃
    pub async fn stop_all(&self) {
        let _ = self.call(|reply| Command::StopAll { reply }).await;
    }

    /// 向已发现的端点发起连接
    pub async fn request_connection(&self, endpoint_id: &str, local_name: &str) -> Result<(), SessionError> {
        let endpoint_id = endpoint_id.to_string();
        let local_name = local_name.to_string();
        self.call(|reply| Command::RequestConnection {
            endpoint_id,
            local_name,
            reply,
        })
        .await?
    }

    /// 回应对端的连接请求
    pub async fn respond_to_request(&self, endpoint_id: &str, accept: bool) -> Result<(), SessionError> {
        let endpoint_id = endpoint_id.to_string();
        self.call(|reply| Command::Respond {
            endpoint_id,
            accept,
            reply,
        })
        .await?
    }

    pub async fn disconnect(&self, endpoint_id: &str) -> Result<(), SessionError> {
        let endpoint_id = endpoint_id.to_string();
        self.call(|reply| Command::Disconnect { endpoint_id, reply })
            .await?
    }

    /// 重新推送本地快照（界面需要重新同步时使用）
    pub async fn send_local_snapshot_now(&self, endpoint_id: &str) -> Result<(), SessionError> {
        let endpoint_id = endpoint_id.to_string();
        self.call(|reply| Command::SendSnapshot { endpoint_id, reply })
            .await?
    }

    /// 把已连接对端的最近快照交给好友接收端
    pub async fn confirm_friend(&self, endpoint_id: &str) -> Result<(), SessionError> {
        let endpoint_id = endpoint_id.to_string();
        self.call(|reply| Command::ConfirmFriend { endpoint_id, reply })
            .await?
    }

    /// 注册事件回调，返回后产生的事件都会送达
    pub async fn subscribe(&self, callback: Arc<dyn SessionCallback>) -> Result<(), SessionError> {
        self.call(|reply| Command::Subscribe { callback, reply }).await
    }

    /// 查询单个端点的当前状态
    pub async fn endpoint(&self, endpoint_id: &str) -> Result<Option<Endpoint>, SessionError> {
        let endpoint_id = endpoint_id.to_string();
        self.call(|reply| Command::GetEndpoint { endpoint_id, reply })
            .await
    }

    pub async fn discovered(&self) -> Result<Vec<Endpoint>, SessionError> {
        self.call(|reply| Command::Discovered { reply }).await
    }

    pub async fn connected(&self) -> Result<Vec<ConnectedPeer>, SessionError> {
        self.call(|reply| Command::Connected { reply }).await
    }

    pub async fn status(&self) -> Result<SessionStatus, SessionError> {
        self.call(|reply| Command::Status { reply }).await
    }

    /// 拆除会话并等待控制器任务退出
    pub async fn shutdown(self) {
        self.stop_all().await;
        let Session { commands, task } = self;
        drop(commands);
        if let Err(e) = task.await {
            log::warn!("Session controller task failed: {}", e);
        }
    }
}
