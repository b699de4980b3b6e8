//! 交换的数据：用户健康统计快照
//!
//! 以及与宿主应用之间的两个窄接口：
//! - [`SnapshotProvider`]：连接建立时提供本地用户的当前统计
//! - [`FriendSink`]：用户选择保存某个已连接的对端为好友时接收结果

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// UserSnapshot - 线上交换的统计快照
///
/// 所有字段都带默认值，解码时缺失的字段回退为 0 或空字符串，
/// 未知字段会被忽略。整型字段均为无符号，负数在解码时被拒绝。
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct UserSnapshot {
    pub user_id: String,
    pub user_name: String,
    pub user_email: String,
    pub avatar_glyph: String,
    pub total_score: u64,
    pub current_streak: u32,
    pub achievement_count: u32,
    pub today_steps: u64,
    pub today_mood: String,
    pub captured_at_epoch_millis: u64,
}

impl UserSnapshot {
    pub fn new(user_id: impl Into<String>, user_name: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            user_name: user_name.into(),
            captured_at_epoch_millis: now_epoch_millis(),
            ..Default::default()
        }
    }
}

/// 当前时间（毫秒），时钟早于 1970 时返回 0
pub fn now_epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// 已连接的对端，以及最近一次收到的快照
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectedPeer {
    pub endpoint_id: String,
    pub display_name: String,
    /// 第一次收到负载之前为 None
    pub snapshot: Option<UserSnapshot>,
}

/// 本地快照提供者
///
/// 在连接建立的那一刻被调用，必须快速返回。
pub trait SnapshotProvider: Send + Sync {
    fn produce_local_snapshot(&self) -> UserSnapshot;
}

impl<F> SnapshotProvider for F
where
    F: Fn() -> UserSnapshot + Send + Sync,
{
    fn produce_local_snapshot(&self) -> UserSnapshot {
        self()
    }
}

/// 好友确认接收端
///
/// 持久化好友关系完全由宿主应用负责。
pub trait FriendSink: Send + Sync {
    fn on_friend_confirmed(&self, peer_id: &str, snapshot: &UserSnapshot);
}
