//! 配置系统
//! 默认值 -> YAML 配置文件 -> 环境变量（前缀 VM_EXEC_），敏感信息使用 Secret 包装

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use config::{Config, ConfigBuilder, ConfigError, Environment, File, FileFormat};
use secrecy::Secret;
use serde::Deserialize;

use crate::error::{AppError, Result};
use crate::ssh::escalation::{EscalationMethod, EscalationPolicy};
use crate::ssh::transport::HostKeyVerification;

/// 远程虚拟机连接配置
#[derive(Debug, Clone, Deserialize)]
pub struct VmConfig {
    /// 主机地址
    pub host: String,
    /// 端口
    pub port: u16,
    /// 用户名
    pub username: String,
    /// 认证方式: key, password
    pub auth_method: String,
    /// 私钥文件路径（支持 ~ 展开）
    #[serde(default)]
    pub key_file: Option<String>,
    /// 私钥密码
    #[serde(default)]
    pub key_passphrase: Option<Secret<String>>,
    /// 登录密码（使用 Secret 包装，防止日志泄露）
    #[serde(default)]
    pub password: Option<Secret<String>>,
    /// 需要 root 的命令是否通过 sudo 执行
    pub use_sudo: bool,
    /// sudo 方式: command, su
    pub sudo_method: String,
    /// sudo 密码（None 表示远端已配置 NOPASSWD）
    #[serde(default)]
    pub sudo_password: Option<Secret<String>>,
    /// 连接与握手超时（秒）
    pub connect_timeout_secs: u64,
    /// 命令执行默认超时（秒），0 表示不限时
    pub command_timeout_secs: u64,
    /// 主机密钥验证策略（strict/accept/disabled）
    pub host_key_verification: String,
    /// 已知主机指纹，键为 "host:port"
    #[serde(default)]
    pub known_hosts: HashMap<String, String>,
}

/// SSH 认证方式
#[derive(Debug, Clone)]
pub enum SshAuth {
    /// 密码认证
    Password { password: Secret<String> },
    /// 私钥认证
    Key {
        key_file: String,
        passphrase: Option<Secret<String>>,
    },
}

impl VmConfig {
    /// 获取目标地址字符串
    pub fn target(&self) -> String {
        format!("{}@{}:{}", self.username, self.host, self.port)
    }

    pub fn auth(&self) -> Result<SshAuth> {
        match self.auth_method.to_lowercase().as_str() {
            "key" => {
                let key_file = self.key_file.clone().ok_or_else(|| {
                    AppError::Config("vm.key_file is required when auth_method is 'key'".to_string())
                })?;
                Ok(SshAuth::Key {
                    key_file,
                    passphrase: self.key_passphrase.clone(),
                })
            }
            "password" => {
                let password = self.password.clone().ok_or_else(|| {
                    AppError::Config(
                        "vm.password is required when auth_method is 'password'".to_string(),
                    )
                })?;
                Ok(SshAuth::Password { password })
            }
            other => Err(AppError::Config(format!(
                "vm.auth_method must be 'key' or 'password', got '{}'",
                other
            ))),
        }
    }

    pub fn escalation_policy(&self) -> Result<EscalationPolicy> {
        let method: EscalationMethod = self.sudo_method.parse().map_err(AppError::Config)?;
        Ok(EscalationPolicy {
            enabled: self.use_sudo,
            method,
            credential: self.sudo_password.clone(),
        })
    }

    pub fn host_key_verification(&self) -> Result<HostKeyVerification> {
        self.host_key_verification.parse().map_err(AppError::Config)
    }

    pub fn default_timeout(&self) -> Option<Duration> {
        (self.command_timeout_secs > 0).then(|| Duration::from_secs(self.command_timeout_secs))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// 日志级别: trace, debug, info, warn, error
    pub level: String,
    /// 日志格式: json, pretty, compact
    pub format: String,
    /// 日志文件路径（追加写入，可选）
    #[serde(default)]
    pub file: Option<String>,
    /// 是否输出到控制台（stderr）
    pub enable_console: bool,
    /// 是否记录每条命令的生命周期事件
    pub log_commands: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub vm: VmConfig,
    pub logging: LoggingConfig,
}

/// 展开路径开头的 ~
pub fn expand_home(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest).to_string_lossy().into_owned();
        }
    } else if path == "~" {
        if let Some(home) = dirs::home_dir() {
            return home.to_string_lossy().into_owned();
        }
    }
    path.to_string()
}

impl AppConfig {
    /// 从配置文件（可选）和环境变量加载配置
    pub fn load(path: Option<&Path>) -> std::result::Result<Self, ConfigError> {
        let mut settings = Self::defaults()?;

        if let Some(path) = path {
            settings = settings.add_source(File::from(path).format(FileFormat::Yaml).required(true));
        }

        Self::finish(settings)
    }

    /// 从 YAML 文本加载配置（环境变量仍然生效）
    pub fn from_yaml_str(yaml: &str) -> std::result::Result<Self, ConfigError> {
        let settings = Self::defaults()?.add_source(File::from_str(yaml, FileFormat::Yaml));
        Self::finish(settings)
    }

    fn defaults() -> std::result::Result<ConfigBuilder<config::builder::DefaultState>, ConfigError> {
        Config::builder()
            .set_default("vm.host", "")?
            .set_default("vm.port", 22)?
            .set_default("vm.username", "root")?
            .set_default("vm.auth_method", "key")?
            .set_default("vm.use_sudo", false)?
            .set_default("vm.sudo_method", "command")?
            .set_default("vm.connect_timeout_secs", 10)?
            .set_default("vm.command_timeout_secs", 30)?
            .set_default("vm.host_key_verification", "disabled")?
            .set_default("logging.level", "info")?
            .set_default("logging.format", "pretty")?
            .set_default("logging.enable_console", true)?
            .set_default("logging.log_commands", true)
    }

    fn finish(
        settings: ConfigBuilder<config::builder::DefaultState>,
    ) -> std::result::Result<Self, ConfigError> {
        // 环境变量覆盖（前缀为 VM_EXEC_，例如 VM_EXEC_VM__HOST）
        let settings = settings.add_source(
            Environment::with_prefix("VM_EXEC")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let mut config: AppConfig = settings.build()?.try_deserialize()?;

        config.vm.key_file = config.vm.key_file.as_deref().map(expand_home);
        config.logging.file = config.logging.file.as_deref().map(expand_home);

        config.validate()?;

        Ok(config)
    }

    /// 验证配置合法性
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.vm.host.trim().is_empty() {
            return Err(ConfigError::Message("vm.host is required".to_string()));
        }

        self.vm
            .auth()
            .map_err(|e| ConfigError::Message(e.to_string()))?;

        if self.vm.use_sudo {
            self.vm
                .escalation_policy()
                .map_err(|_| ConfigError::Message("vm.sudo_method must be 'command' or 'su'".to_string()))?;
        }

        self.vm
            .host_key_verification()
            .map_err(|e| ConfigError::Message(e.to_string()))?;

        // 验证日志级别
        match self.logging.level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => {
                return Err(ConfigError::Message(format!(
                    "Invalid log level: {}. Must be one of: trace, debug, info, warn, error",
                    self.logging.level
                )))
            }
        }

        // 验证日志格式
        match self.logging.format.to_lowercase().as_str() {
            "json" | "pretty" | "compact" => {}
            _ => {
                return Err(ConfigError::Message(format!(
                    "Invalid log format: {}. Must be one of: json, pretty, compact",
                    self.logging.format
                )))
            }
        }

        Ok(())
    }
}
