//! 会话配置和持久化
//!
//! 提供广播名称、服务标识等设置的存储和读取。

use log::debug;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::codec::MAX_PAYLOAD_BYTES;

/// 默认服务标识，只有广播相同标识的设备才会被发现
pub const DEFAULT_SERVICE_ID: &str = "wellness.nearby.friends";

/// 会话设置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// 本机名称（广播和连接请求中使用）
    pub local_name: String,
    /// 服务标识
    pub service_id: String,
    /// 是否自动接受对端的连接请求
    pub auto_accept: bool,
    /// 单次负载上限（字节）
    pub max_payload_bytes: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            local_name: get_default_local_name(),
            service_id: DEFAULT_SERVICE_ID.to_string(),
            auto_accept: false,
            max_payload_bytes: MAX_PAYLOAD_BYTES,
        }
    }
}

impl SessionConfig {
    /// 获取配置文件路径
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("nearby-friends")
            .join("session.toml")
    }

    /// 加载设置（如果文件不存在则使用默认值）
    pub fn load() -> Self {
        Self::load_from(&Self::config_path())
    }

    /// 从指定路径加载设置，读取或解析失败时使用默认值
    pub fn load_from(path: &Path) -> Self {
        if path.exists() {
            match fs::read_to_string(path) {
                Ok(content) => match toml::from_str(&content) {
                    Ok(config) => {
                        debug!("Loaded session config from {:?}", path);
                        return config;
                    }
                    Err(e) => {
                        log::warn!("Failed to parse session config: {}, using defaults", e);
                    }
                },
                Err(e) => {
                    log::warn!("Failed to read session config: {}, using defaults", e);
                }
            }
        }
        Self::default()
    }

    /// 保存设置到默认路径
    pub fn save(&self) -> anyhow::Result<()> {
        self.save_to(&Self::config_path())
    }

    pub fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        debug!("Saved session config to {:?}", path);
        Ok(())
    }
}

/// 获取默认本机名称（主机名）
fn get_default_local_name() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "Nearby".to_string())
}
