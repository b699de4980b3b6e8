//! 端点注册表
//!
//! 端点 ID 到当前状态（以及已连接时最近一次快照）的唯一权威映射。
//! 只由控制器任务持有和修改。

use log::debug;

use crate::snapshot::{ConnectedPeer, UserSnapshot};
use std::collections::HashMap;

/// 端点状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointState {
    Discovered,
    RequestSentByUs,
    RequestReceivedFromPeer,
    Connected,
    Disconnected,
    Rejected,
}

impl EndpointState {
    /// 握手进行中
    pub fn is_pending(&self) -> bool {
        matches!(
            self,
            EndpointState::RequestSentByUs | EndpointState::RequestReceivedFromPeer
        )
    }

    /// 终止状态：可以被重新发现
    pub fn is_terminal(&self) -> bool {
        matches!(self, EndpointState::Disconnected | EndpointState::Rejected)
    }
}

/// 本次会话中看到的一个设备
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub id: String,
    pub display_name: String,
    pub state: EndpointState,
}

#[derive(Debug, Clone)]
struct Entry {
    display_name: String,
    state: EndpointState,
    snapshot: Option<UserSnapshot>,
}

#[derive(Debug, Default)]
pub struct EndpointRegistry {
    entries: HashMap<String, Entry>,
}

impl EndpointRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self, id: &str) -> Option<EndpointState> {
        self.entries.get(id).map(|e| e.state)
    }

    pub fn get(&self, id: &str) -> Option<Endpoint> {
        self.entries.get(id).map(|e| Endpoint {
            id: id.to_string(),
            display_name: e.display_name.clone(),
            state: e.state,
        })
    }

    /// 记录被发现的端点
    ///
    /// 返回是否（重新）进入 Discovered。握手中或已连接的端点不会被回退，
    /// Disconnected / Rejected 的端点被重新发现时重新进入 Discovered。
    pub fn upsert_discovered(&mut self, id: &str, name: &str) -> bool {
        match self.entries.get_mut(id) {
            None => {
                self.entries.insert(
                    id.to_string(),
                    Entry {
                        display_name: name.to_string(),
                        state: EndpointState::Discovered,
                        snapshot: None,
                    },
                );
                true
            }
            Some(entry) if entry.state.is_terminal() => {
                debug!("Endpoint {} rediscovered after {:?}", id, entry.state);
                entry.display_name = name.to_string();
                entry.state = EndpointState::Discovered;
                entry.snapshot = None;
                true
            }
            Some(entry) => {
                if entry.state == EndpointState::Discovered {
                    entry.display_name = name.to_string();
                }
                false
            }
        }
    }

    /// 端点丢失：只裁剪尚未进入握手的 Discovered 条目
    pub fn remove(&mut self, id: &str) -> bool {
        if self.state(id) == Some(EndpointState::Discovered) {
            self.entries.remove(id);
            true
        } else {
            false
        }
    }

    pub fn mark_requested_by_us(&mut self, id: &str) -> bool {
        self.transition(id, EndpointState::RequestSentByUs, |s| {
            s == EndpointState::Discovered
        })
    }

    /// 对端发起的请求，未知端点会被登记（请求方本身就是真实存在的对端）
    ///
    /// 本轮会话中已被拒绝的端点不再接受请求，只有重新发现才能回到 Discovered。
    pub fn mark_requested_by_peer(&mut self, id: &str, name: &str) -> bool {
        match self.entries.get_mut(id) {
            None => {
                self.entries.insert(
                    id.to_string(),
                    Entry {
                        display_name: name.to_string(),
                        state: EndpointState::RequestReceivedFromPeer,
                        snapshot: None,
                    },
                );
                true
            }
            Some(entry)
                if matches!(
                    entry.state,
                    EndpointState::Discovered | EndpointState::Disconnected
                ) =>
            {
                entry.display_name = name.to_string();
                entry.state = EndpointState::RequestReceivedFromPeer;
                entry.snapshot = None;
                true
            }
            Some(_) => false,
        }
    }

    /// 只有握手中的端点可以进入 Connected
    pub fn mark_connected(&mut self, id: &str) -> bool {
        self.transition(id, EndpointState::Connected, |s| s.is_pending())
    }

    pub fn mark_disconnected(&mut self, id: &str) -> bool {
        let changed = self.transition(id, EndpointState::Disconnected, |s| {
            s == EndpointState::Connected || s.is_pending()
        });
        if changed {
            if let Some(entry) = self.entries.get_mut(id) {
                entry.snapshot = None;
            }
        }
        changed
    }

    pub fn mark_rejected(&mut self, id: &str) -> bool {
        self.transition(id, EndpointState::Rejected, |s| s.is_pending())
    }

    /// 挂上/替换对端最近一次快照，只对已连接端点生效
    pub fn store_snapshot(&mut self, id: &str, snapshot: UserSnapshot) -> bool {
        match self.entries.get_mut(id) {
            Some(entry) if entry.state == EndpointState::Connected => {
                entry.snapshot = Some(snapshot);
                true
            }
            _ => false,
        }
    }

    pub fn snapshot(&self, id: &str) -> Option<&UserSnapshot> {
        self.entries.get(id).and_then(|e| e.snapshot.as_ref())
    }

    /// 所有 Discovered 端点，按 ID 排序
    pub fn discovered(&self) -> Vec<Endpoint> {
        let mut list: Vec<Endpoint> = self
            .entries
            .iter()
            .filter(|(_, e)| e.state == EndpointState::Discovered)
            .map(|(id, e)| Endpoint {
                id: id.clone(),
                display_name: e.display_name.clone(),
                state: e.state,
            })
            .collect();
        list.sort_by(|a, b| a.id.cmp(&b.id));
        list
    }

    /// 所有已连接的对端，按 ID 排序
    pub fn connected(&self) -> Vec<ConnectedPeer> {
        let mut list: Vec<ConnectedPeer> = self
            .entries
            .iter()
            .filter(|(_, e)| e.state == EndpointState::Connected)
            .map(|(id, e)| ConnectedPeer {
                endpoint_id: id.clone(),
                display_name: e.display_name.clone(),
                snapshot: e.snapshot.clone(),
            })
            .collect();
        list.sort_by(|a, b| a.endpoint_id.cmp(&b.endpoint_id));
        list
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// 会话拆除时释放所有端点
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    fn transition(
        &mut self,
        id: &str,
        to: EndpointState,
        allowed: impl Fn(EndpointState) -> bool,
    ) -> bool {
        match self.entries.get_mut(id) {
            Some(entry) if allowed(entry.state) => {
                debug!("Endpoint {}: {:?} -> {:?}", id, entry.state, to);
                entry.state = to;
                true
            }
            Some(entry) => {
                debug!(
                    "Endpoint {}: ignoring {:?} -> {:?}",
                    id, entry.state, to
                );
                false
            }
            None => false,
        }
    }
}
