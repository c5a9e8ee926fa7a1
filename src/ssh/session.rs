//! SSH 会话
//!
//! 持有唯一的远程连接：首次使用时建立，存活期间复用，关闭或检测到失效后在下次使用时重建。
//! 建立连接与关闭连接都在同一把互斥锁内完成，同一时刻最多只有一次握手在进行。
//! 握手期间等待的调用方得到同一个结果：成功时是同一条连接，失败时是同一个错误。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, error, info};

use crate::error::{AppError, Result};
use crate::ssh::transport::{Connector, RemoteConnection};

#[derive(Default)]
struct SessionState {
    connection: Option<Arc<dyn RemoteConnection>>,
    /// 最近一次失败的握手（握手序号, 错误）
    last_failure: Option<(u64, AppError)>,
}

/// 单连接 SSH 会话
pub struct SshSession {
    connector: Arc<dyn Connector>,
    state: Mutex<SessionState>,
    /// 已完成的握手次数
    attempts: AtomicU64,
}

impl SshSession {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self {
            connector,
            state: Mutex::new(SessionState::default()),
            attempts: AtomicU64::new(0),
        }
    }

    /// 获取或创建连接
    ///
    /// 已有连接且未关闭时直接返回；否则在持锁状态下完成握手。
    /// 握手失败时会话保持"无连接"状态，下次调用会重新尝试。
    pub async fn connect(&self) -> Result<Arc<dyn RemoteConnection>> {
        let observed = self.attempts.load(Ordering::SeqCst);
        let mut state = self.state.lock().await;

        if let Some(conn) = state.connection.as_ref() {
            if !conn.is_closed() {
                return Ok(conn.clone());
            }
            debug!("Stored SSH connection is closed, reconnecting");
        }
        state.connection = None;

        // 等锁期间有握手失败，直接返回同一个错误
        if let Some((attempt, err)) = state.last_failure.as_ref() {
            if *attempt > observed {
                return Err(err.to_shared());
            }
        }

        let attempt = self.attempts.load(Ordering::SeqCst) + 1;
        let outcome = self.connector.connect().await;
        self.attempts.store(attempt, Ordering::SeqCst);

        match outcome {
            Ok(conn) => {
                state.connection = Some(conn.clone());
                state.last_failure = None;
                Ok(conn)
            }
            Err(e) => {
                error!(error = %e, attempt, "Failed to connect to VM");
                state.last_failure = Some((attempt, e.to_shared()));
                Err(e)
            }
        }
    }

    /// 关闭连接（幂等）
    pub async fn close(&self) {
        let mut state = self.state.lock().await;

        if let Some(conn) = state.connection.take() {
            if !conn.is_closed() {
                conn.close().await;
            }
            info!("SSH session closed");
        }
    }

    /// 当前是否持有存活的连接
    pub async fn is_connected(&self) -> bool {
        self.state
            .lock()
            .await
            .connection
            .as_ref()
            .is_some_and(|conn| !conn.is_closed())
    }

    /// 丢弃已失效的连接
    ///
    /// 只有当存储的仍是同一条连接时才清除，避免误删并发重连得到的新连接
    pub async fn invalidate(&self, failed: &Arc<dyn RemoteConnection>) {
        let mut state = self.state.lock().await;

        if state
            .connection
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(current, failed))
        {
            debug!("Dropping failed SSH connection");
            state.connection = None;
        }
    }
}
