//! 测试公共模块
//! 提供可控的桩连接器和桩连接，用于在没有真实 SSH 服务器的情况下测试会话与执行器

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use vm_exec::error::{AppError, Result};
use vm_exec::ssh::{
    CommandCorrelator, CommandExecutor, Connector, RecordingSink, RemoteConnection, RemoteOutput,
    SshSession,
};

/// 桩连接对一条命令的响应
#[derive(Debug, Clone)]
pub enum Reply {
    /// 立即返回
    Output(RemoteOutput),
    /// 延迟后返回
    After(Duration, RemoteOutput),
    /// 永不返回
    Hang,
    /// 传输层错误
    Fail(String),
    /// 连接在执行中断开
    Drop,
}

pub type Responder = Arc<dyn Fn(&str) -> Reply + Send + Sync>;

pub fn output(stdout: &str, stderr: &str, exit_status: Option<u32>) -> RemoteOutput {
    RemoteOutput {
        stdout: Some(stdout.to_string()),
        stderr: Some(stderr.to_string()),
        exit_status,
        exit_signal: None,
    }
}

/// 进程被信号终止，没有退出状态
pub fn killed(signal: &str) -> RemoteOutput {
    RemoteOutput {
        stdout: Some(String::new()),
        stderr: Some(String::new()),
        exit_status: None,
        exit_signal: Some(signal.to_string()),
    }
}

/// 按命令名模拟 true / false，其余命令回显
pub fn shell_like() -> Responder {
    Arc::new(|command: &str| match command {
        "true" => Reply::Output(output("", "", Some(0))),
        "false" => Reply::Output(output("", "", Some(1))),
        other => Reply::Output(output(&format!("{}\n", other), "", Some(0))),
    })
}

pub fn always(reply: Reply) -> Responder {
    Arc::new(move |_: &str| reply.clone())
}

pub struct StubConnection {
    id: usize,
    closed: AtomicBool,
    close_calls: AtomicUsize,
    commands: Mutex<Vec<String>>,
    responder: Responder,
}

impl StubConnection {
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }

    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }

    /// 模拟远端断开
    pub fn kill(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl RemoteConnection for StubConnection {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn run(&self, command: &str) -> Result<RemoteOutput> {
        self.commands.lock().unwrap().push(command.to_string());

        match (self.responder)(command) {
            Reply::Output(out) => Ok(out),
            Reply::After(delay, out) => {
                tokio::time::sleep(delay).await;
                Ok(out)
            }
            Reply::Hang => {
                std::future::pending::<()>().await;
                unreachable!()
            }
            Reply::Fail(message) => Err(AppError::execution_with(
                "channel failure",
                std::io::Error::new(std::io::ErrorKind::Other, message),
            )),
            Reply::Drop => {
                self.closed.store(true, Ordering::SeqCst);
                Err(AppError::execution("connection dropped while command was running"))
            }
        }
    }

    async fn close(&self) {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// 桩连接器：统计握手次数，可模拟握手延迟和失败
pub struct StubConnector {
    handshakes: AtomicUsize,
    failures_left: AtomicUsize,
    delay: Duration,
    responder: Responder,
    connections: Mutex<Vec<Arc<StubConnection>>>,
}

impl StubConnector {
    pub fn new(responder: Responder) -> Self {
        Self {
            handshakes: AtomicUsize::new(0),
            failures_left: AtomicUsize::new(0),
            delay: Duration::ZERO,
            responder,
            connections: Mutex::new(Vec::new()),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// 前 n 次握手失败
    pub fn failing(self, n: usize) -> Self {
        self.failures_left.store(n, Ordering::SeqCst);
        self
    }

    pub fn handshakes(&self) -> usize {
        self.handshakes.load(Ordering::SeqCst)
    }

    pub fn last_connection(&self) -> Option<Arc<StubConnection>> {
        self.connections.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl Connector for StubConnector {
    async fn connect(&self) -> Result<Arc<dyn RemoteConnection>> {
        let attempt = self.handshakes.fetch_add(1, Ordering::SeqCst) + 1;

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let should_fail = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if should_fail {
            return Err(AppError::connection_with(
                "Failed to connect to VM",
                std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "connection refused"),
            ));
        }

        let conn = Arc::new(StubConnection {
            id: attempt,
            closed: AtomicBool::new(false),
            close_calls: AtomicUsize::new(0),
            commands: Mutex::new(Vec::new()),
            responder: self.responder.clone(),
        });
        self.connections.lock().unwrap().push(conn.clone());

        Ok(conn as Arc<dyn RemoteConnection>)
    }
}

/// 测试装置：执行器 + 桩连接器 + 事件记录
pub struct Harness {
    pub connector: Arc<StubConnector>,
    pub session: Arc<SshSession>,
    pub sink: Arc<RecordingSink>,
    pub correlator: Arc<CommandCorrelator>,
}

impl Harness {
    pub fn new(connector: StubConnector) -> Self {
        let connector = Arc::new(connector);
        let session = Arc::new(SshSession::new(connector.clone()));
        let sink = Arc::new(RecordingSink::new());
        let correlator = Arc::new(CommandCorrelator::with_sink("CMD", sink.clone()));

        Self {
            connector,
            session,
            sink,
            correlator,
        }
    }

    pub fn executor(&self) -> CommandExecutor {
        CommandExecutor::new(self.session.clone()).with_correlator(self.correlator.clone())
    }
}
