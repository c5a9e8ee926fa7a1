//! SSH执行模块
//! 单连接会话管理、提权包装、命令生命周期记录和命令执行

pub mod correlator;
pub mod escalation;
pub mod executor;
pub mod session;
pub mod transport;

pub use correlator::{CommandCorrelator, CommandEvent, EventSink, RecordingSink, TracingSink};
pub use escalation::{EscalationMethod, EscalationPolicy};
pub use executor::{CommandExecutor, ExecOptions, Timeout, DEFAULT_COMMAND_TIMEOUT};
pub use session::SshSession;
pub use transport::{Connector, HostKeyVerification, RemoteConnection, RemoteOutput, RusshConnector};
