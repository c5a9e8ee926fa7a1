//! SSH 命令执行器
//!
//! 调用方运行远程命令的唯一入口：确保连接、按需提权、在截止时间内分发命令、
//! 规范化结果，并通过关联器记录每条命令的生命周期。
//!
//! 超时只会放弃等待，不保证远端进程被终止。执行器不做任何自动重试。

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;
use tokio::time::timeout;
use tracing::{debug, error};

use crate::config::AppConfig;
use crate::error::{AppError, Result};
use crate::execution::CommandResult;
use crate::ssh::correlator::CommandCorrelator;
use crate::ssh::escalation::{self, EscalationPolicy};
use crate::ssh::session::SshSession;
use crate::ssh::transport::RusshConnector;

/// 默认命令超时
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// 调试日志中输出摘要的最大字符数
const LOG_SUMMARY_CHARS: usize = 200;

/// 单条命令的超时设置
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Timeout {
    /// 使用执行器的默认超时
    #[default]
    Default,
    /// 指定超时
    After(Duration),
    /// 不设超时
    Unbounded,
}

/// 执行选项
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExecOptions {
    pub timeout: Timeout,
    /// 非零退出码时返回 [`AppError::CommandFailed`]
    pub verify_success: bool,
    /// 需要 root 权限
    pub needs_escalation: bool,
}

impl ExecOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn timeout(mut self, duration: Duration) -> Self {
        self.timeout = Timeout::After(duration);
        self
    }

    pub fn no_timeout(mut self) -> Self {
        self.timeout = Timeout::Unbounded;
        self
    }

    pub fn verify_success(mut self) -> Self {
        self.verify_success = true;
        self
    }

    pub fn escalated(mut self) -> Self {
        self.needs_escalation = true;
        self
    }
}

/// 命令执行器
pub struct CommandExecutor {
    session: Arc<SshSession>,
    policy: EscalationPolicy,
    correlator: Option<Arc<CommandCorrelator>>,
    default_timeout: Option<Duration>,
}

impl CommandExecutor {
    /// 创建执行器（不提权、不记录命令事件、默认超时 30 秒）
    pub fn new(session: Arc<SshSession>) -> Self {
        Self {
            session,
            policy: EscalationPolicy::disabled(),
            correlator: None,
            default_timeout: Some(DEFAULT_COMMAND_TIMEOUT),
        }
    }

    /// 从配置创建基于 russh 的执行器
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        let connector = RusshConnector::from_config(&config.vm)?;
        let session = Arc::new(SshSession::new(Arc::new(connector)));

        let mut executor = Self::new(session)
            .with_escalation(config.vm.escalation_policy()?)
            .with_default_timeout(config.vm.default_timeout());

        if config.logging.log_commands {
            executor = executor.with_correlator(Arc::new(CommandCorrelator::new("CMD")));
        }

        Ok(executor)
    }

    pub fn with_escalation(mut self, policy: EscalationPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_correlator(mut self, correlator: Arc<CommandCorrelator>) -> Self {
        self.correlator = Some(correlator);
        self
    }

    /// 设置默认超时，None 表示默认不限时
    pub fn with_default_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn session(&self) -> &Arc<SshSession> {
        &self.session
    }

    pub fn correlator(&self) -> Option<&Arc<CommandCorrelator>> {
        self.correlator.as_ref()
    }

    /// 建立连接（可在启动阶段显式调用）
    pub async fn connect(&self) -> Result<()> {
        self.session.connect().await.map(|_| ())
    }

    /// 关闭连接（幂等）
    pub async fn close(&self) {
        self.session.close().await;
    }

    /// 使用默认选项执行命令
    pub async fn run(&self, command: &str) -> Result<CommandResult> {
        self.execute(command, ExecOptions::default()).await
    }

    /// 以 root 权限执行命令
    pub async fn run_escalated(&self, command: &str) -> Result<CommandResult> {
        self.execute(command, ExecOptions::new().escalated()).await
    }

    fn resolve_timeout(&self, timeout: Timeout) -> Option<Duration> {
        match timeout {
            Timeout::Default => self.default_timeout,
            Timeout::After(duration) => Some(duration),
            Timeout::Unbounded => None,
        }
    }

    /// 执行远程命令
    ///
    /// 默认不论退出码都返回结果，由调用方根据 [`CommandResult::succeeded`] 分支；
    /// `verify_success` 打开时非零退出码返回 [`AppError::CommandFailed`]。
    pub async fn execute(&self, command: &str, options: ExecOptions) -> Result<CommandResult> {
        let conn = self.session.connect().await?;

        let wrapped = escalation::apply(command, &self.policy, options.needs_escalation);
        let escalated = wrapped.as_ref() != command;
        let deadline = self.resolve_timeout(options.timeout);

        let cmd_id = self.correlator.as_ref().map(|correlator| {
            correlator.start(
                &wrapped,
                deadline,
                Some(json!({
                    "check": options.verify_success,
                    "needs_root": options.needs_escalation,
                    "original_command": if escalated { Some(command) } else { None },
                })),
            )
        });

        debug!(command = %wrapped, timeout = ?deadline, "Executing command");
        let started = Instant::now();

        let dispatched = match deadline {
            Some(limit) => match timeout(limit, conn.run(&wrapped)).await {
                Ok(outcome) => outcome,
                Err(_) => Err(AppError::Timeout {
                    command: command.to_string(),
                    timeout: limit,
                }),
            },
            None => conn.run(&wrapped).await,
        };

        let output = match dispatched {
            Ok(output) => output,
            Err(e) => {
                error!(error = %e, elapsed = ?started.elapsed(), "Command execution failed");

                if let (Some(correlator), Some(id)) = (&self.correlator, cmd_id) {
                    correlator.error(id, &e);
                }
                if conn.is_closed() {
                    self.session.invalidate(&conn).await;
                }
                return Err(e);
            }
        };

        let duration = started.elapsed();
        let result = CommandResult::from_output(output);

        debug!(
            exit_code = result.exit_code(),
            stdout_len = result.stdout().len(),
            stderr_len = result.stderr().len(),
            output = %result.output_summary(LOG_SUMMARY_CHARS),
            "Command finished"
        );

        if let (Some(correlator), Some(id)) = (&self.correlator, cmd_id) {
            correlator.end(id, result.exit_code(), result.stdout(), result.stderr(), duration);
        }

        if options.verify_success && result.is_failure() {
            return Err(AppError::CommandFailed {
                exit_code: result.exit_code(),
                output: result.failure_context().to_string(),
            });
        }

        Ok(result)
    }
}
