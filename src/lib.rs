//! 远程虚拟机命令执行库
//! 通过一条复用的 SSH 连接执行命令，支持超时、提权和命令生命周期日志

pub mod config;
pub mod error;
pub mod execution;
pub mod ssh;
pub mod telemetry;

pub use error::{AppError, Result};
pub use execution::CommandResult;
pub use ssh::{CommandExecutor, ExecOptions};
