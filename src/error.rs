//! 统一错误模型
//! 定义连接、超时、命令失败等错误类型

use std::time::Duration;
use thiserror::Error;

/// 结果类型别名
pub type Result<T> = std::result::Result<T, AppError>;

/// 传输层底层错误（保留原始错误链）
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// 应用错误类型
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("SSH connection error: {message}")]
    SshConnectionError {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    #[error("SSH authentication failed: {0}")]
    SshAuthenticationError(String),

    #[error("Command timed out after {}s: {command}", .timeout.as_secs_f64())]
    Timeout { command: String, timeout: Duration },

    #[error("Command failed with exit code {exit_code}: {output}")]
    CommandFailed { exit_code: i32, output: String },

    #[error("SSH execution error: {message}")]
    SshExecutionError {
        message: String,
        #[source]
        source: Option<BoxError>,
    },
}

impl AppError {
    /// 稳定的错误类别标识，写入命令生命周期事件
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::Config(_) => "config",
            AppError::SshConnectionError { .. } => "connection",
            AppError::SshAuthenticationError(_) => "authentication",
            AppError::Timeout { .. } => "timeout",
            AppError::CommandFailed { .. } => "command_failed",
            AppError::SshExecutionError { .. } => "execution",
        }
    }

    /// 建立连接阶段的错误（认证失败也属于此类）
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            AppError::SshConnectionError { .. } | AppError::SshAuthenticationError(_)
        )
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, AppError::Timeout { .. })
    }

    /// 复制一份同类别、同消息的错误，原因链压平为文本
    pub fn to_shared(&self) -> AppError {
        let flattened = || -> Option<BoxError> {
            let chain = error_chain(self);
            (!chain.is_empty()).then(|| chain.join(": ").into())
        };

        match self {
            AppError::Config(msg) => AppError::Config(msg.clone()),
            AppError::SshConnectionError { message, .. } => AppError::SshConnectionError {
                message: message.clone(),
                source: flattened(),
            },
            AppError::SshAuthenticationError(msg) => AppError::SshAuthenticationError(msg.clone()),
            AppError::Timeout { command, timeout } => AppError::Timeout {
                command: command.clone(),
                timeout: *timeout,
            },
            AppError::CommandFailed { exit_code, output } => AppError::CommandFailed {
                exit_code: *exit_code,
                output: output.clone(),
            },
            AppError::SshExecutionError { message, .. } => AppError::SshExecutionError {
                message: message.clone(),
                source: flattened(),
            },
        }
    }

    // 便捷方法
    pub fn connection(msg: impl Into<String>) -> Self {
        AppError::SshConnectionError {
            message: msg.into(),
            source: None,
        }
    }

    pub fn connection_with<E>(msg: impl Into<String>, source: E) -> Self
    where
        E: Into<BoxError>,
    {
        AppError::SshConnectionError {
            message: msg.into(),
            source: Some(source.into()),
        }
    }

    pub fn execution(msg: impl Into<String>) -> Self {
        AppError::SshExecutionError {
            message: msg.into(),
            source: None,
        }
    }

    pub fn execution_with<E>(msg: impl Into<String>, source: E) -> Self
    where
        E: Into<BoxError>,
    {
        AppError::SshExecutionError {
            message: msg.into(),
            source: Some(source.into()),
        }
    }
}

/// 从 config::ConfigError 转换
impl From<config::ConfigError> for AppError {
    fn from(e: config::ConfigError) -> Self {
        AppError::Config(e.to_string())
    }
}

/// 展开错误链，用于日志
pub fn error_chain(err: &(dyn std::error::Error + 'static)) -> Vec<String> {
    let mut chain = Vec::new();
    let mut current = err.source();
    while let Some(cause) = current {
        chain.push(cause.to_string());
        current = cause.source();
    }
    chain
}
