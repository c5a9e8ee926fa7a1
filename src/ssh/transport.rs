//! SSH 传输层
//!
//! [`Connector`] 负责一次物理握手，[`RemoteConnection`] 代表一条已认证的连接，
//! 可在其上并发打开多个 session channel。默认实现基于 russh。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client;
use russh::{Channel, ChannelMsg};
use russh_keys::key::PublicKey;
use russh_keys::load_secret_key;
use russh_keys::PublicKeyBase64;
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use sha2::Digest;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::config::{SshAuth, VmConfig};
use crate::error::{AppError, Result};

/// 传输层返回的原始执行结果，由 [`crate::execution::CommandResult`] 负责规范化
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteOutput {
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub exit_status: Option<u32>,
    /// 远端进程被信号终止时的信号名
    pub exit_signal: Option<String>,
}

/// 一条已建立的远程连接
#[async_trait]
pub trait RemoteConnection: Send + Sync {
    /// 传输层报告连接是否已关闭
    fn is_closed(&self) -> bool;

    /// 在连接上执行一条命令，等待其结束
    async fn run(&self, command: &str) -> Result<RemoteOutput>;

    /// 请求优雅关闭并等待关闭完成
    async fn close(&self);
}

/// 建立新连接，每次调用对应一次物理握手
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn RemoteConnection>>;
}

/// 主机密钥验证策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum HostKeyVerification {
    /// 严格模式：只接受已知的主机密钥
    Strict,
    /// 接受模式：首次连接时接受新密钥，之后验证
    Accept,
    /// 禁用验证（开发虚拟机的常见用法）
    #[default]
    Disabled,
}

impl std::str::FromStr for HostKeyVerification {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "strict" => Ok(Self::Strict),
            "accept" => Ok(Self::Accept),
            "disabled" | "none" | "false" => Ok(Self::Disabled),
            _ => Err(format!("Unknown host key verification mode: {}", s)),
        }
    }
}

/// 根据验证策略判断指纹是否可接受
pub fn verify_fingerprint(
    mode: HostKeyVerification,
    known_hosts: &HashMap<String, String>,
    host_key: &str,
    fingerprint: &str,
) -> bool {
    if mode == HostKeyVerification::Disabled {
        warn!(host = %host_key, "Host key verification DISABLED - accepting all keys");
        return true;
    }

    match known_hosts.get(host_key) {
        Some(stored) if stored == fingerprint => {
            debug!(host = %host_key, "Host key verified");
            true
        }
        Some(stored) => {
            error!(
                host = %host_key,
                expected = %stored,
                actual = %fingerprint,
                "Host key mismatch - REJECTING CONNECTION"
            );
            false
        }
        None if mode == HostKeyVerification::Accept => {
            info!(
                host = %host_key,
                fingerprint = %fingerprint,
                "First time connecting - accepting host key"
            );
            true
        }
        None => {
            error!(host = %host_key, "Unknown host in strict mode - rejecting connection");
            false
        }
    }
}

/// 主机公钥的 SHA-256 指纹（十六进制）
pub fn fingerprint(key_base64: &str) -> String {
    let mut hasher = sha2::Sha256::new();
    hasher.update(key_base64.as_bytes());
    hex::encode(hasher.finalize())
}

/// russh 客户端会话处理器
struct HostKeyChecker {
    mode: HostKeyVerification,
    known_hosts: HashMap<String, String>,
    host_key: String,
}

#[async_trait]
impl client::Handler for HostKeyChecker {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        let fingerprint = fingerprint(&server_public_key.public_key_base64());
        Ok(verify_fingerprint(
            self.mode,
            &self.known_hosts,
            &self.host_key,
            &fingerprint,
        ))
    }
}

/// 基于 russh 的连接器
pub struct RusshConnector {
    host: String,
    port: u16,
    username: String,
    auth: SshAuth,
    connect_timeout: Duration,
    host_key_verification: HostKeyVerification,
    known_hosts: HashMap<String, String>,
}

impl RusshConnector {
    pub fn from_config(vm: &VmConfig) -> Result<Self> {
        Ok(Self {
            host: vm.host.clone(),
            port: vm.port,
            username: vm.username.clone(),
            auth: vm.auth()?,
            connect_timeout: Duration::from_secs(vm.connect_timeout_secs),
            host_key_verification: vm.host_key_verification()?,
            known_hosts: vm.known_hosts.clone(),
        })
    }

    /// 获取目标地址字符串
    pub fn target(&self) -> String {
        format!("{}@{}:{}", self.username, self.host, self.port)
    }

    async fn handshake(&self) -> Result<client::Handle<HostKeyChecker>> {
        let client_config = Arc::new(client::Config::default());
        let handler = HostKeyChecker {
            mode: self.host_key_verification,
            known_hosts: self.known_hosts.clone(),
            host_key: format!("{}:{}", self.host, self.port),
        };

        let mut handle = client::connect(client_config, (self.host.clone(), self.port), handler)
            .await
            .map_err(|e| {
                error!(error = %e, "SSH连接失败");
                AppError::connection_with(
                    format!("Failed to connect to VM {}:{}", self.host, self.port),
                    e,
                )
            })?;

        let authenticated = match &self.auth {
            SshAuth::Password { password } => {
                handle
                    .authenticate_password(self.username.clone(), password.expose_secret())
                    .await
            }
            SshAuth::Key {
                key_file,
                passphrase,
            } => {
                let key = load_secret_key(
                    key_file,
                    passphrase.as_ref().map(|p| p.expose_secret().as_str()),
                )
                .map_err(|e| {
                    error!(error = %e, key_file = %key_file, "加载SSH私钥失败");
                    AppError::connection_with(format!("Failed to load key {}", key_file), e)
                })?;

                handle
                    .authenticate_publickey(self.username.clone(), Arc::new(key))
                    .await
            }
        }
        .map_err(|e| AppError::connection_with("SSH authentication exchange failed", e))?;

        if !authenticated {
            error!(remote = %self.target(), "SSH认证失败");
            return Err(AppError::SshAuthenticationError(format!(
                "server rejected credentials for {}",
                self.target()
            )));
        }

        Ok(handle)
    }
}

#[async_trait]
impl Connector for RusshConnector {
    async fn connect(&self) -> Result<Arc<dyn RemoteConnection>> {
        info!(host = %self.host, port = self.port, "Connecting to {}:{}", self.host, self.port);

        let handle = timeout(self.connect_timeout, self.handshake())
            .await
            .map_err(|_| {
                AppError::connection(format!(
                    "SSH握手超时: {} after {}s",
                    self.target(),
                    self.connect_timeout.as_secs()
                ))
            })??;

        info!(remote = %self.target(), "SSH connection established");

        let connection: Arc<dyn RemoteConnection> = Arc::new(RusshConnection {
            handle,
            target: self.target(),
        });
        Ok(connection)
    }
}

/// 可关闭的 channel
#[async_trait]
trait CloseChannel: Send + Sized + 'static {
    async fn close_channel(self);
}

#[async_trait]
impl CloseChannel for Channel<client::Msg> {
    async fn close_channel(self) {
        if let Err(e) = self.close().await {
            debug!(error = %e, "channel close failed, already closed by peer");
        }
    }
}

/// 持有一个打开的 channel，被丢弃时在后台关闭它
struct ChannelGuard<C: CloseChannel> {
    channel: Option<C>,
}

impl<C: CloseChannel> ChannelGuard<C> {
    fn new(channel: C) -> Self {
        Self {
            channel: Some(channel),
        }
    }

    fn channel_mut(&mut self) -> Option<&mut C> {
        self.channel.as_mut()
    }

    /// 命令正常结束后关闭 channel
    async fn finish(mut self) {
        if let Some(channel) = self.channel.take() {
            channel.close_channel().await;
        }
    }
}

impl<C: CloseChannel> Drop for ChannelGuard<C> {
    fn drop(&mut self) {
        let Some(channel) = self.channel.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(channel.close_channel());
            }
            Err(_) => debug!("no runtime to close abandoned SSH channel"),
        }
    }
}

/// 基于 russh 的连接，每条命令使用独立的 session channel
pub struct RusshConnection {
    handle: client::Handle<HostKeyChecker>,
    target: String,
}

#[async_trait]
impl RemoteConnection for RusshConnection {
    fn is_closed(&self) -> bool {
        self.handle.is_closed()
    }

    async fn run(&self, command: &str) -> Result<RemoteOutput> {
        let channel = self.handle.channel_open_session().await.map_err(|e| {
            error!(error = %e, "打开SSH通道失败");
            AppError::execution_with("Failed to open SSH channel", e)
        })?;
        // 超时取消 run 时由 guard 在后台关闭 channel
        let mut guard = ChannelGuard::new(channel);

        let Some(channel) = guard.channel_mut() else {
            return Err(AppError::execution("SSH channel already closed"));
        };

        channel.exec(true, command).await.map_err(|e| {
            error!(error = %e, "执行命令失败");
            AppError::execution_with("Failed to start remote command", e)
        })?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut exit_status = None;
        let mut exit_signal = None;

        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::Data { ref data } => stdout.extend_from_slice(data),
                ChannelMsg::ExtendedData { ref data, ext } => {
                    // SSH_EXTENDED_DATA_STDERR
                    if ext == 1 {
                        stderr.extend_from_slice(data);
                    }
                }
                ChannelMsg::ExitStatus { exit_status: status } => exit_status = Some(status),
                ChannelMsg::ExitSignal {
                    signal_name,
                    core_dumped,
                    error_message,
                    ..
                } => {
                    warn!(
                        remote = %self.target,
                        signal = ?signal_name,
                        core_dumped,
                        error_message = %error_message,
                        "Remote command terminated by signal"
                    );
                    exit_signal = Some(format!("{:?}", signal_name));
                }
                ChannelMsg::Close => break,
                _ => {}
            }
        }

        guard.finish().await;

        if exit_status.is_none() && exit_signal.is_none() && self.handle.is_closed() {
            return Err(AppError::execution(format!(
                "connection to {} dropped while command was running",
                self.target
            )));
        }

        Ok(RemoteOutput {
            stdout: Some(String::from_utf8_lossy(&stdout).into_owned()),
            stderr: Some(String::from_utf8_lossy(&stderr).into_owned()),
            exit_status,
            exit_signal,
        })
    }

    async fn close(&self) {
        info!(remote = %self.target, "Closing SSH connection");

        if let Err(e) = self
            .handle
            .disconnect(russh::Disconnect::ByApplication, "", "English")
            .await
        {
            debug!(error = %e, "disconnect request failed, connection already gone");
        }

        let wait_closed = async {
            while !self.handle.is_closed() {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        };
        if timeout(Duration::from_secs(5), wait_closed).await.is_err() {
            warn!(remote = %self.target, "SSH connection did not report closed within 5s");
        }
    }
}
