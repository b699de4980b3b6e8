//! Nearby CLI
//!
//! 开发用命令行工具：
//! - 在进程内 loopback 介质上演示两个会话的发现、连接和快照交换
//! - 生成/检查快照负载文件

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use nearby_core::codec;
use nearby_core::transport::loopback::LoopbackMedium;
use nearby_core::{
    FriendSink, Session, SessionConfig, SessionEvent, SimpleSessionCallback, UserSnapshot,
    event_channel,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "nearby-cli", version, about = "附近好友 - 发现与连接调试工具")]
struct Cli {
    /// 配置文件路径 (默认使用用户配置目录)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// 在 loopback 介质上模拟两台设备互加好友
    Demo {
        /// 本机名称 (默认取配置)
        #[arg(short, long)]
        name: Option<String>,
        /// 模拟对端的名称
        #[arg(short, long, default_value = "Jamie")]
        peer_name: String,
        /// 超时时间 (秒)
        #[arg(short, long, default_value = "10")]
        timeout: u64,
    },
    /// 生成一个示例快照负载
    Sample {
        /// 输出文件 (不指定则输出到标准输出)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// 解码并打印快照负载文件
    Inspect {
        /// 负载文件路径
        file: PathBuf,
    },
    /// 打印当前生效的配置
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    // 桥接 log crate（nearby-core 使用）到 tracing
    let _ = tracing_log::LogTracer::init();

    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,nearby_core=debug")),
        )
        .try_init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => SessionConfig::load_from(path),
        None => SessionConfig::load(),
    };

    match cli.command {
        Commands::Demo {
            name,
            peer_name,
            timeout,
        } => {
            let local_name = name.unwrap_or_else(|| config.local_name.clone());
            run_demo(config, local_name, peer_name, Duration::from_secs(timeout)).await?;
        }
        Commands::Sample { output } => {
            let bytes = codec::encode(&sample_snapshot("u-alex", "Alex", 1_250, 12))?;
            match output {
                Some(path) => {
                    tokio::fs::write(&path, &bytes)
                        .await
                        .with_context(|| format!("写入 {} 失败", path.display()))?;
                    println!("📝 已写入 {} ({} 字节)", path.display(), bytes.len());
                }
                None => println!("{}", String::from_utf8_lossy(&bytes)),
            }
        }
        Commands::Inspect { file } => {
            let bytes = tokio::fs::read(&file)
                .await
                .with_context(|| format!("读取 {} 失败", file.display()))?;
            let snapshot = codec::decode_with_limit(&bytes, config.max_payload_bytes)
                .with_context(|| format!("{} 不是有效的快照负载", file.display()))?;
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
        }
        Commands::Config => {
            print!("{}", render_config(&config)?);
        }
    }

    Ok(())
}

/// 按磁盘上的 TOML 格式输出配置，首行注明文件位置
fn render_config(config: &SessionConfig) -> Result<String> {
    Ok(format!(
        "# {}\n{}",
        SessionConfig::config_path().display(),
        toml::to_string_pretty(config)?
    ))
}

fn sample_snapshot(user_id: &str, name: &str, score: u64, streak: u32) -> UserSnapshot {
    UserSnapshot {
        user_email: format!("{}@example.com", name.to_lowercase()),
        avatar_glyph: name.chars().next().map(String::from).unwrap_or_default(),
        total_score: score,
        current_streak: streak,
        achievement_count: streak / 3,
        today_steps: 6_400,
        today_mood: "😊".to_string(),
        ..UserSnapshot::new(user_id, name)
    }
}

/// 把确认的好友打印到日志
struct LogFriends {
    owner: String,
}

impl FriendSink for LogFriends {
    fn on_friend_confirmed(&self, peer_id: &str, snapshot: &UserSnapshot) {
        tracing::info!(
            "🤝 {} 添加好友 {} ({}), 积分 {}",
            self.owner,
            snapshot.user_name,
            peer_id,
            snapshot.total_score
        );
    }
}

struct DemoPeer {
    id: String,
    name: String,
    session: Session,
    events: mpsc::Receiver<SessionEvent>,
}

impl DemoPeer {
    async fn join(
        medium: &LoopbackMedium,
        config: &SessionConfig,
        name: String,
        snapshot: UserSnapshot,
    ) -> Self {
        let (tx, rx) = event_channel();
        let transport = Arc::new(medium.transport(&config.service_id, tx).await);
        let (callback, events) = SimpleSessionCallback::new();
        let id = transport.endpoint_id().to_string();

        let session = Session::builder(
            SessionConfig {
                local_name: name.clone(),
                ..config.clone()
            },
            transport,
            Arc::new(move || snapshot.clone()),
        )
        .with_callback(Arc::new(callback))
        .with_friend_sink(Arc::new(LogFriends {
            owner: name.clone(),
        }))
        .start(rx);

        Self {
            id,
            name,
            session,
            events,
        }
    }
}

async fn run_demo(
    config: SessionConfig,
    local_name: String,
    peer_name: String,
    timeout: Duration,
) -> Result<()> {
    let medium = LoopbackMedium::with_max_payload(config.max_payload_bytes);
    let mut local = DemoPeer::join(
        &medium,
        &config,
        local_name.clone(),
        sample_snapshot("u-local", &local_name, 1_250, 12),
    )
    .await;
    let mut remote = DemoPeer::join(
        &medium,
        &config,
        peer_name.clone(),
        sample_snapshot("u-peer", &peer_name, 980, 4),
    )
    .await;

    tracing::info!(
        "🔍 {} ({}) 与 {} ({}) 开始广播和扫描",
        local.name,
        local.id,
        remote.name,
        remote.id
    );
    local
        .session
        .start_advertising_and_discovery(&local.name)
        .await?;
    remote
        .session
        .start_advertising_and_discovery(&remote.name)
        .await?;

    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);

    // 双方都收到对方快照即结束
    let mut received = 0;
    while received < 2 {
        tokio::select! {
            Some(event) = local.events.recv() => match event {
                SessionEvent::EndpointFound(endpoint) if endpoint.id == remote.id => {
                    tracing::info!("📡 发现 {}，发起连接", endpoint.display_name);
                    local.session.request_connection(&endpoint.id, &local.name).await?;
                }
                SessionEvent::DataReceived { endpoint_id, snapshot } => {
                    tracing::info!(
                        "📥 {} 收到快照:\n{}",
                        local.name,
                        serde_json::to_string_pretty(&snapshot)?
                    );
                    local.session.confirm_friend(&endpoint_id).await?;
                    received += 1;
                }
                other => tracing::debug!("{}: {:?}", local.name, other),
            },
            Some(event) = remote.events.recv() => match event {
                SessionEvent::ConnectionRequested(request) => {
                    tracing::info!(
                        "🔔 {} 请求连接 (验证码 {})，接受",
                        request.name,
                        request.auth_token
                    );
                    remote.session.respond_to_request(&request.endpoint_id, true).await?;
                }
                SessionEvent::DataReceived { snapshot, .. } => {
                    tracing::info!(
                        "📥 {} 收到 {} 的快照: 积分 {}, 连续 {} 天",
                        remote.name,
                        snapshot.user_name,
                        snapshot.total_score,
                        snapshot.current_streak
                    );
                    received += 1;
                }
                other => tracing::debug!("{}: {:?}", remote.name, other),
            },
            _ = &mut deadline => {
                anyhow::bail!("演示超时 ({}s)", timeout.as_secs());
            }
        }
    }

    let status = local.session.status().await?;
    tracing::info!(
        "✅ 完成: 已发现 {}，已连接 {}",
        status.discovered,
        status.connected
    );

    local.session.shutdown().await;
    remote.session.shutdown().await;
    Ok(())
}
