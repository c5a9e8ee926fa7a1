//! 命令执行关联器
//!
//! 为每次命令调用分配单调递增的 ID，并输出 start / end / error 三类生命周期事件。
//! 每个关联器实例拥有独立的计数器，不同子系统互不干扰。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::error::{error_chain, AppError};

/// 命令预览的最大字符数
pub const COMMAND_PREVIEW_CHARS: usize = 200;
/// stdout / stderr 预览的最大字符数
pub const OUTPUT_PREVIEW_CHARS: usize = 500;

/// 命令生命周期事件，载荷中始终保留完整文本
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum CommandEvent {
    Started {
        cmd_id: u64,
        command: String,
        timeout_secs: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        context: Option<Value>,
        started_at: DateTime<Utc>,
    },
    Completed {
        cmd_id: u64,
        exit_code: i32,
        duration_seconds: f64,
        stdout_length: usize,
        stderr_length: usize,
        stdout: String,
        stderr: String,
        completed_at: DateTime<Utc>,
    },
    Failed {
        cmd_id: u64,
        error_type: String,
        error_message: String,
        #[serde(default)]
        causes: Vec<String>,
        failed_at: DateTime<Utc>,
    },
}

impl CommandEvent {
    pub fn cmd_id(&self) -> u64 {
        match self {
            CommandEvent::Started { cmd_id, .. }
            | CommandEvent::Completed { cmd_id, .. }
            | CommandEvent::Failed { cmd_id, .. } => *cmd_id,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, CommandEvent::Started { .. })
    }
}

/// 事件输出端
pub trait EventSink: Send + Sync {
    fn emit(&self, label: &str, event: &CommandEvent);
}

/// 截断到指定字符数，返回预览和是否发生截断
fn preview(text: &str, max_chars: usize) -> (&str, bool) {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => (&text[..idx], true),
        None => (text, false),
    }
}

/// 完整载荷事件的 target
pub const PAYLOAD_TARGET: &str = "ssh_commands::payload";

/// 通过 tracing 输出事件（target = `ssh_commands`），JSON 或文本格式由 telemetry 层决定
///
/// 带消息的事件只包含预览和长度字段，完整的命令与输出以 DEBUG 级别
/// 单独写到 [`PAYLOAD_TARGET`]。
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, label: &str, event: &CommandEvent) {
        match event {
            CommandEvent::Started {
                cmd_id,
                command,
                timeout_secs,
                context,
                started_at,
            } => {
                let (command_preview, truncated) = preview(command, COMMAND_PREVIEW_CHARS);
                let marker = if truncated {
                    "... (truncated, see full command below)"
                } else {
                    ""
                };
                let context = context.as_ref().map(Value::to_string).unwrap_or_default();

                info!(
                    target: "ssh_commands",
                    cmd_id = *cmd_id,
                    command_length = command.len(),
                    timeout_secs = ?timeout_secs,
                    started_at = %started_at.to_rfc3339(),
                    "[{}-{}] Starting command: {}{}",
                    label,
                    cmd_id,
                    command_preview,
                    marker
                );

                if truncated {
                    info!(target: "ssh_commands", "[{}-{}] Full command:\n{}", label, cmd_id, command);
                }

                debug!(
                    target: PAYLOAD_TARGET,
                    cmd_id = *cmd_id,
                    command = %command,
                    context = %context,
                    "[{}-{}] start payload",
                    label,
                    cmd_id
                );
            }
            CommandEvent::Completed {
                cmd_id,
                exit_code,
                duration_seconds,
                stdout_length,
                stderr_length,
                stdout,
                stderr,
                completed_at,
            } => {
                if *exit_code == 0 {
                    info!(
                        target: "ssh_commands",
                        cmd_id = *cmd_id,
                        exit_code = *exit_code,
                        duration_seconds = *duration_seconds,
                        stdout_length = *stdout_length,
                        stderr_length = *stderr_length,
                        completed_at = %completed_at.to_rfc3339(),
                        "[{}-{}] Completed with exit code {} in {:.3}s",
                        label,
                        cmd_id,
                        exit_code,
                        duration_seconds
                    );
                } else {
                    warn!(
                        target: "ssh_commands",
                        cmd_id = *cmd_id,
                        exit_code = *exit_code,
                        duration_seconds = *duration_seconds,
                        stdout_length = *stdout_length,
                        stderr_length = *stderr_length,
                        completed_at = %completed_at.to_rfc3339(),
                        "[{}-{}] Completed with exit code {} in {:.3}s",
                        label,
                        cmd_id,
                        exit_code,
                        duration_seconds
                    );
                }

                if !stdout.is_empty() {
                    let (text, truncated) = preview(stdout, OUTPUT_PREVIEW_CHARS);
                    let marker = if truncated { "... (truncated)" } else { "" };
                    info!(target: "ssh_commands", "[{}-{}] STDOUT:\n{}{}", label, cmd_id, text, marker);
                }

                if !stderr.is_empty() {
                    let (text, truncated) = preview(stderr, OUTPUT_PREVIEW_CHARS);
                    let marker = if truncated { "... (truncated)" } else { "" };
                    warn!(target: "ssh_commands", "[{}-{}] STDERR:\n{}{}", label, cmd_id, text, marker);
                }

                debug!(
                    target: PAYLOAD_TARGET,
                    cmd_id = *cmd_id,
                    stdout = %stdout,
                    stderr = %stderr,
                    "[{}-{}] completion payload",
                    label,
                    cmd_id
                );
            }
            CommandEvent::Failed {
                cmd_id,
                error_type,
                error_message,
                causes,
                failed_at,
            } => {
                error!(
                    target: "ssh_commands",
                    cmd_id = *cmd_id,
                    error_type = %error_type,
                    causes = ?causes,
                    failed_at = %failed_at.to_rfc3339(),
                    "[{}-{}] Command failed with error: {}",
                    label,
                    cmd_id,
                    error_message
                );
            }
        }
    }
}

/// 内存中记录事件，供测试或嵌入方读取
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<CommandEvent>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// 已记录事件的快照
    pub fn events(&self) -> Vec<CommandEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }

    /// 指定命令 ID 的所有事件
    pub fn events_for(&self, cmd_id: u64) -> Vec<CommandEvent> {
        self.events()
            .into_iter()
            .filter(|event| event.cmd_id() == cmd_id)
            .collect()
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, _label: &str, event: &CommandEvent) {
        match self.events.lock() {
            Ok(mut events) => events.push(event.clone()),
            Err(poisoned) => poisoned.into_inner().push(event.clone()),
        }
    }
}

/// 命令执行关联器
pub struct CommandCorrelator {
    label: String,
    counter: AtomicU64,
    sink: Arc<dyn EventSink>,
}

impl std::fmt::Debug for CommandCorrelator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandCorrelator")
            .field("label", &self.label)
            .field("counter", &self.counter.load(Ordering::SeqCst))
            .finish()
    }
}

impl Default for CommandCorrelator {
    fn default() -> Self {
        Self::new("CMD")
    }
}

impl CommandCorrelator {
    /// 创建输出到 tracing 的关联器
    pub fn new(label: impl Into<String>) -> Self {
        Self::with_sink(label, Arc::new(TracingSink))
    }

    pub fn with_sink(label: impl Into<String>, sink: Arc<dyn EventSink>) -> Self {
        Self {
            label: label.into(),
            counter: AtomicU64::new(0),
            sink,
        }
    }

    /// 已分配的最大 ID（尚未分配时为 0）
    pub fn last_id(&self) -> u64 {
        self.counter.load(Ordering::SeqCst)
    }

    /// 分配新 ID 并输出开始事件
    pub fn start(&self, command: &str, timeout: Option<Duration>, context: Option<Value>) -> u64 {
        let cmd_id = self.counter.fetch_add(1, Ordering::SeqCst) + 1;

        self.sink.emit(
            &self.label,
            &CommandEvent::Started {
                cmd_id,
                command: command.to_string(),
                timeout_secs: timeout.map(|t| t.as_secs_f64()),
                context,
                started_at: Utc::now(),
            },
        );

        cmd_id
    }

    /// 输出完成事件（退出码非零时为 warning 级别）
    pub fn end(&self, cmd_id: u64, exit_code: i32, stdout: &str, stderr: &str, duration: Duration) {
        let duration_seconds = (duration.as_secs_f64() * 1000.0).round() / 1000.0;

        self.sink.emit(
            &self.label,
            &CommandEvent::Completed {
                cmd_id,
                exit_code,
                duration_seconds,
                stdout_length: stdout.len(),
                stderr_length: stderr.len(),
                stdout: stdout.to_string(),
                stderr: stderr.to_string(),
                completed_at: Utc::now(),
            },
        );
    }

    /// 输出错误事件，包含错误类别和原因链
    pub fn error(&self, cmd_id: u64, err: &AppError) {
        self.sink.emit(
            &self.label,
            &CommandEvent::Failed {
                cmd_id,
                error_type: err.kind().to_string(),
                error_message: err.to_string(),
                causes: error_chain(err),
                failed_at: Utc::now(),
            },
        );
    }
}
