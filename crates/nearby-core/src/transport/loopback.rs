//! Loopback 传输 - 进程内模拟的无线介质
//!
//! 多个 [`LoopbackTransport`] 挂在同一个 [`LoopbackMedium`] 上，
//! 行为与真实的附近连接服务一致：
//! - 只能发现广播相同服务标识的节点
//! - 握手需要双方都 accept
//! - 主动断开只通知对端
//! - 单次发送受负载上限约束

use log::{debug, trace};

use crate::codec::MAX_PAYLOAD_BYTES;
use crate::error::TransportError;
use crate::transport::{ConnectionStatus, Transport, TransportEvent, TransportEventSender};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;

/// 随机端点 ID（4 位十六进制）
fn generate_endpoint_id() -> String {
    let random_bytes: [u8; 2] = rand::random();
    format!("{:02x}{:02x}", random_bytes[0], random_bytes[1])
}

/// 4 位数字校验码
fn generate_auth_token() -> String {
    format!("{:04}", rand::random::<u16>() % 10_000)
}

/// 无序节点对
fn pair(a: &str, b: &str) -> (String, String) {
    if a <= b {
        (a.to_string(), b.to_string())
    } else {
        (b.to_string(), a.to_string())
    }
}

struct Node {
    service_id: String,
    events: TransportEventSender,
    advertised_name: Option<String>,
    discovering: bool,
    radio_enabled: bool,
}

struct Handshake {
    auth_token: String,
    accepted: HashSet<String>,
}

struct MediumState {
    nodes: HashMap<String, Node>,
    handshakes: HashMap<(String, String), Handshake>,
    links: HashSet<(String, String)>,
    max_payload_bytes: usize,
}

impl MediumState {
    fn emit(&self, node_id: &str, event: TransportEvent) {
        if let Some(node) = self.nodes.get(node_id) {
            trace!("loopback -> {}: {:?}", node_id, event);
            // 接收端已经关闭时静默丢弃
            let _ = node.events.send(event);
        }
    }

    fn node(&self, id: &str) -> Result<&Node, TransportError> {
        self.nodes
            .get(id)
            .ok_or_else(|| TransportError::UnknownEndpoint(id.to_string()))
    }

    fn node_mut(&mut self, id: &str) -> Result<&mut Node, TransportError> {
        self.nodes
            .get_mut(id)
            .ok_or_else(|| TransportError::UnknownEndpoint(id.to_string()))
    }

    fn check_radio(&self, id: &str) -> Result<(), TransportError> {
        if self.node(id)?.radio_enabled {
            Ok(())
        } else {
            Err(TransportError::Unavailable)
        }
    }

    /// 与 `id` 同服务标识的其它节点
    fn peers_of(&self, id: &str) -> Vec<String> {
        let Some(service_id) = self.nodes.get(id).map(|n| n.service_id.clone()) else {
            return Vec::new();
        };
        self.nodes
            .iter()
            .filter(|(other, node)| other.as_str() != id && node.service_id == service_id)
            .map(|(other, _)| other.clone())
            .collect()
    }
}

/// 共享的模拟介质
#[derive(Clone)]
pub struct LoopbackMedium {
    state: Arc<Mutex<MediumState>>,
}

impl Default for LoopbackMedium {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackMedium {
    pub fn new() -> Self {
        Self::with_max_payload(MAX_PAYLOAD_BYTES)
    }

    pub fn with_max_payload(max_payload_bytes: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(MediumState {
                nodes: HashMap::new(),
                handshakes: HashMap::new(),
                links: HashSet::new(),
                max_payload_bytes,
            })),
        }
    }

    /// 挂载一个新节点，事件投递到 `events`
    pub async fn transport(
        &self,
        service_id: impl Into<String>,
        events: TransportEventSender,
    ) -> LoopbackTransport {
        let mut state = self.state.lock().await;
        let mut id = generate_endpoint_id();
        while state.nodes.contains_key(&id) {
            id = generate_endpoint_id();
        }
        state.nodes.insert(
            id.clone(),
            Node {
                service_id: service_id.into(),
                events,
                advertised_name: None,
                discovering: false,
                radio_enabled: true,
            },
        );
        debug!("Loopback node {} attached", id);
        LoopbackTransport {
            id,
            state: self.state.clone(),
        }
    }
}

/// 介质上的一个节点
pub struct LoopbackTransport {
    id: String,
    state: Arc<Mutex<MediumState>>,
}

impl LoopbackTransport {
    /// 其它节点看到的本节点端点 ID
    pub fn endpoint_id(&self) -> &str {
        &self.id
    }

    /// 模拟关闭/打开无线电
    pub async fn set_radio_enabled(&self, enabled: bool) {
        let mut state = self.state.lock().await;
        if let Ok(node) = state.node_mut(&self.id) {
            node.radio_enabled = enabled;
        }
    }

    /// 当前已建立的链路数
    pub async fn link_count(&self) -> usize {
        let state = self.state.lock().await;
        state
            .links
            .iter()
            .filter(|(a, b)| *a == self.id || *b == self.id)
            .count()
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn advertise(&self, local_name: &str) -> Result<(), TransportError> {
        let mut state = self.state.lock().await;
        state.check_radio(&self.id)?;
        let node = state.node_mut(&self.id)?;
        if node.advertised_name.is_some() {
            return Err(TransportError::AlreadyAdvertising);
        }
        node.advertised_name = Some(local_name.to_string());

        for peer in state.peers_of(&self.id) {
            if state.nodes.get(&peer).is_some_and(|n| n.discovering) {
                state.emit(
                    &peer,
                    TransportEvent::EndpointFound {
                        endpoint_id: self.id.clone(),
                        name: local_name.to_string(),
                    },
                );
            }
        }
        debug!("Loopback node {} advertising as '{}'", self.id, local_name);
        Ok(())
    }

    async fn stop_advertise(&self) {
        let mut state = self.state.lock().await;
        let was_advertising = match state.node_mut(&self.id) {
            Ok(node) => node.advertised_name.take().is_some(),
            Err(_) => false,
        };
        if !was_advertising {
            return;
        }
        for peer in state.peers_of(&self.id) {
            if state.nodes.get(&peer).is_some_and(|n| n.discovering) {
                state.emit(
                    &peer,
                    TransportEvent::EndpointLost {
                        endpoint_id: self.id.clone(),
                    },
                );
            }
        }
    }

    async fn discover(&self) -> Result<(), TransportError> {
        let mut state = self.state.lock().await;
        state.check_radio(&self.id)?;
        let node = state.node_mut(&self.id)?;
        if node.discovering {
            return Err(TransportError::AlreadyDiscovering);
        }
        node.discovering = true;

        for peer in state.peers_of(&self.id) {
            let name = state.nodes.get(&peer).and_then(|n| n.advertised_name.clone());
            if let Some(name) = name {
                state.emit(
                    &self.id,
                    TransportEvent::EndpointFound {
                        endpoint_id: peer,
                        name,
                    },
                );
            }
        }
        Ok(())
    }

    async fn stop_discover(&self) {
        let mut state = self.state.lock().await;
        if let Ok(node) = state.node_mut(&self.id) {
            node.discovering = false;
        }
    }

    async fn connect(&self, endpoint_id: &str, local_name: &str) -> Result<(), TransportError> {
        let mut state = self.state.lock().await;
        state.check_radio(&self.id)?;

        let target = state.node(endpoint_id)?;
        let same_service = state
            .nodes
            .get(&self.id)
            .is_some_and(|n| n.service_id == target.service_id);
        let Some(target_name) = target.advertised_name.clone().filter(|_| same_service) else {
            return Err(TransportError::UnknownEndpoint(endpoint_id.to_string()));
        };

        let key = pair(&self.id, endpoint_id);
        if state.links.contains(&key) || state.handshakes.contains_key(&key) {
            // 握手已在进行或已连接，由介质协商方向
            debug!(
                "Loopback handshake {} <-> {} already in progress",
                self.id, endpoint_id
            );
            return Ok(());
        }

        let auth_token = generate_auth_token();
        state.handshakes.insert(
            key,
            Handshake {
                auth_token: auth_token.clone(),
                accepted: HashSet::new(),
            },
        );
        state.emit(
            &self.id,
            TransportEvent::ConnectionInitiated {
                endpoint_id: endpoint_id.to_string(),
                name: target_name,
                auth_token: auth_token.clone(),
                incoming: false,
            },
        );
        state.emit(
            endpoint_id,
            TransportEvent::ConnectionInitiated {
                endpoint_id: self.id.clone(),
                name: local_name.to_string(),
                auth_token,
                incoming: true,
            },
        );
        Ok(())
    }

    async fn accept(&self, endpoint_id: &str) -> Result<(), TransportError> {
        let mut state = self.state.lock().await;
        let key = pair(&self.id, endpoint_id);
        let handshake = state
            .handshakes
            .get_mut(&key)
            .ok_or_else(|| TransportError::UnknownEndpoint(endpoint_id.to_string()))?;
        handshake.accepted.insert(self.id.clone());
        if handshake.accepted.len() < 2 {
            return Ok(());
        }

        if let Some(done) = state.handshakes.remove(&key) {
            trace!("Loopback handshake completed, token {}", done.auth_token);
        }
        state.links.insert(key);
        state.emit(
            &self.id,
            TransportEvent::ConnectionResult {
                endpoint_id: endpoint_id.to_string(),
                status: ConnectionStatus::Success,
            },
        );
        state.emit(
            endpoint_id,
            TransportEvent::ConnectionResult {
                endpoint_id: self.id.clone(),
                status: ConnectionStatus::Success,
            },
        );
        Ok(())
    }

    async fn reject(&self, endpoint_id: &str) -> Result<(), TransportError> {
        let mut state = self.state.lock().await;
        let key = pair(&self.id, endpoint_id);
        if state.handshakes.remove(&key).is_none() {
            return Err(TransportError::UnknownEndpoint(endpoint_id.to_string()));
        }
        state.emit(
            &self.id,
            TransportEvent::ConnectionResult {
                endpoint_id: endpoint_id.to_string(),
                status: ConnectionStatus::Rejected,
            },
        );
        state.emit(
            endpoint_id,
            TransportEvent::ConnectionResult {
                endpoint_id: self.id.clone(),
                status: ConnectionStatus::Rejected,
            },
        );
        Ok(())
    }

    async fn disconnect(&self, endpoint_id: &str) {
        let mut state = self.state.lock().await;
        let key = pair(&self.id, endpoint_id);
        if state.links.remove(&key) {
            state.emit(
                endpoint_id,
                TransportEvent::Disconnected {
                    endpoint_id: self.id.clone(),
                },
            );
        } else if state.handshakes.remove(&key).is_some() {
            state.emit(
                endpoint_id,
                TransportEvent::ConnectionResult {
                    endpoint_id: self.id.clone(),
                    status: ConnectionStatus::Failed("handshake cancelled".to_string()),
                },
            );
        }
    }

    async fn disconnect_all(&self) {
        let mut state = self.state.lock().await;
        let mine: Vec<(String, String)> = state
            .links
            .iter()
            .filter(|(a, b)| *a == self.id || *b == self.id)
            .cloned()
            .collect();
        for key in mine {
            state.links.remove(&key);
            let other = if key.0 == self.id { &key.1 } else { &key.0 };
            state.emit(
                other,
                TransportEvent::Disconnected {
                    endpoint_id: self.id.clone(),
                },
            );
        }
        let pending: Vec<(String, String)> = state
            .handshakes
            .keys()
            .filter(|(a, b)| *a == self.id || *b == self.id)
            .cloned()
            .collect();
        for key in pending {
            state.handshakes.remove(&key);
            let other = if key.0 == self.id { &key.1 } else { &key.0 };
            state.emit(
                other,
                TransportEvent::ConnectionResult {
                    endpoint_id: self.id.clone(),
                    status: ConnectionStatus::Failed("handshake cancelled".to_string()),
                },
            );
        }
    }

    async fn send(&self, endpoint_id: &str, bytes: Vec<u8>) -> Result<(), TransportError> {
        let state = self.state.lock().await;
        if bytes.len() > state.max_payload_bytes {
            return Err(TransportError::PayloadTooLarge {
                size: bytes.len(),
                max: state.max_payload_bytes,
            });
        }
        if !state.links.contains(&pair(&self.id, endpoint_id)) {
            return Err(TransportError::UnknownEndpoint(endpoint_id.to_string()));
        }
        state.emit(
            endpoint_id,
            TransportEvent::PayloadReceived {
                endpoint_id: self.id.clone(),
                bytes,
            },
        );
        Ok(())
    }
}
