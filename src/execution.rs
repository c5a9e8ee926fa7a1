//! 统一执行结果模型
//!
//! 定义远程命令执行的规范化结果类型，传输层的原始结果在会话边界处转换为该类型

use serde::{Deserialize, Serialize};

use crate::ssh::transport::RemoteOutput;

/// 远端进程被信号终止且没有退出状态时使用的退出码
pub const SIGNALLED_EXIT_CODE: i32 = -1;

/// 执行结果 - 一次远程命令调用的规范化输出
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResult {
    /// 标准输出（已去除首尾空白）
    stdout: String,

    /// 标准错误（已去除首尾空白）
    stderr: String,

    /// 退出码
    exit_code: i32,
}

impl CommandResult {
    pub fn new(stdout: impl Into<String>, stderr: impl Into<String>, exit_code: i32) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: stderr.into(),
            exit_code,
        }
    }

    /// 将传输层的原始结果规范化
    ///
    /// 缺失的输出视为空字符串；缺失的退出状态视为 0，
    /// 但进程被信号终止时为 [`SIGNALLED_EXIT_CODE`]
    pub fn from_output(output: RemoteOutput) -> Self {
        let exit_code = match (output.exit_status, &output.exit_signal) {
            (Some(status), _) => i32::try_from(status).unwrap_or(i32::MAX),
            (None, Some(_)) => SIGNALLED_EXIT_CODE,
            (None, None) => 0,
        };

        Self {
            stdout: output.stdout.as_deref().map(str::trim).unwrap_or_default().to_string(),
            stderr: output.stderr.as_deref().map(str::trim).unwrap_or_default().to_string(),
            exit_code,
        }
    }

    pub fn stdout(&self) -> &str {
        &self.stdout
    }

    pub fn stderr(&self) -> &str {
        &self.stderr
    }

    pub fn exit_code(&self) -> i32 {
        self.exit_code
    }

    /// 判断是否成功
    pub fn succeeded(&self) -> bool {
        self.exit_code == 0
    }

    /// 判断是否失败
    pub fn is_failure(&self) -> bool {
        !self.succeeded()
    }

    /// 失败时用于错误信息的输出：优先 stderr，为空时使用 stdout
    pub fn failure_context(&self) -> &str {
        if self.stderr.is_empty() {
            &self.stdout
        } else {
            &self.stderr
        }
    }

    /// 获取完整输出（stdout + stderr）
    pub fn full_output(&self) -> String {
        format!("{}\n{}", self.stdout, self.stderr)
            .trim()
            .to_string()
    }

    /// 获取输出摘要（按字符限制长度）
    pub fn output_summary(&self, max_chars: usize) -> String {
        let full = self.full_output();
        match full.char_indices().nth(max_chars) {
            Some((idx, _)) => format!("{}...", &full[..idx]),
            None => full,
        }
    }
}

impl From<RemoteOutput> for CommandResult {
    fn from(output: RemoteOutput) -> Self {
        Self::from_output(output)
    }
}
