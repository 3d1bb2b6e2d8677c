//! 持久化存储的带外通知通道
//!
//! 监听一个命名通道（例如密码轮换通知），把收到的通知分发给注册的处理器。
//! 出错或 panic 时断开连接，固定退避后重连。

use super::StoreError;
use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::RwLock;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// 通知消息
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub channel: String,
    pub payload: String,
}

/// 已建立的通知连接
#[async_trait]
pub trait NotificationStream: Send {
    /// 等待下一条通知；连接正常关闭时返回 None
    async fn next(&mut self) -> Result<Option<Notification>, StoreError>;
}

/// 通知源（负责建立连接并 LISTEN 指定通道）
#[async_trait]
pub trait NotificationSource: Send + Sync {
    async fn connect(&self, channel: &str) -> Result<Box<dyn NotificationStream>, StoreError>;
}

pub type NotificationHandler = Arc<dyn Fn(&Notification) + Send + Sync>;

/// 通知监听器
pub struct NotificationListener {
    channel: String,
    source: Arc<dyn NotificationSource>,
    handlers: Arc<RwLock<Vec<NotificationHandler>>>,
    backoff: Duration,
    shutdown_tx: watch::Sender<bool>,
    handle: Option<JoinHandle<()>>,
}

impl NotificationListener {
    pub fn new(channel: impl Into<String>, source: Arc<dyn NotificationSource>, backoff: Duration) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            channel: channel.into(),
            source,
            handlers: Arc::new(RwLock::new(Vec::new())),
            backoff,
            shutdown_tx,
            handle: None,
        }
    }

    /// 注册处理器（启动前后均可）
    pub fn add_handler<F>(&self, handler: F)
    where
        F: Fn(&Notification) + Send + Sync + 'static,
    {
        self.handlers.write().push(Arc::new(handler));
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().map(|h| !h.is_finished()).unwrap_or(false)
    }

    /// 启动监听循环
    pub fn start(&mut self) {
        if self.is_running() {
            return;
        }
        self.shutdown_tx.send_replace(false);

        let channel = self.channel.clone();
        let source = self.source.clone();
        let handlers = self.handlers.clone();
        let backoff = self.backoff;
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        self.handle = Some(tokio::spawn(async move {
            log::info!("Notification listener started on channel '{}'", channel);
            loop {
                if *shutdown_rx.borrow() {
                    break;
                }

                let session = AssertUnwindSafe(listen_once(&channel, source.as_ref(), &handlers))
                    .catch_unwind();

                let outcome = tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    outcome = session => outcome,
                };

                match outcome {
                    Ok(Ok(())) => log::warn!("Notification channel '{}' closed by peer", channel),
                    Ok(Err(e)) => log::error!("Notification listener error on '{}': {}", channel, e),
                    Err(panic) => log::error!(
                        "Notification listener panicked on '{}': {}",
                        channel,
                        panic_message(&panic)
                    ),
                }

                // 断开后固定退避再重连
                crate::observability::NOTIFY_RECONNECTS.inc();
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    _ = tokio::time::sleep(backoff) => {}
                }
            }
            log::info!("Notification listener on '{}' stopped", channel);
        }));
    }

    /// 停止监听循环
    pub async fn stop(&mut self) {
        self.shutdown_tx.send_replace(true);
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

async fn listen_once(
    channel: &str,
    source: &dyn NotificationSource,
    handlers: &RwLock<Vec<NotificationHandler>>,
) -> Result<(), StoreError> {
    let mut stream = source.connect(channel).await?;
    log::debug!("Listening on notification channel '{}'", channel);

    while let Some(notification) = stream.next().await? {
        let current: Vec<NotificationHandler> = handlers.read().clone();
        for handler in current {
            handler(&notification);
        }
    }
    Ok(())
}

// ============================================================================
// 行协议通知源
// ============================================================================

/// 基于 TCP 行协议的通知源
///
/// 连接后发送 `LISTEN <channel>\n`，之后对端每发送一行即为一条通知。
pub struct TcpNotificationSource {
    address: String,
}

impl TcpNotificationSource {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
        }
    }
}

struct TcpNotificationStream {
    channel: String,
    lines: Lines<BufReader<TcpStream>>,
}

#[async_trait]
impl NotificationStream for TcpNotificationStream {
    async fn next(&mut self) -> Result<Option<Notification>, StoreError> {
        Ok(self.lines.next_line().await?.map(|payload| Notification {
            channel: self.channel.clone(),
            payload,
        }))
    }
}

#[async_trait]
impl NotificationSource for TcpNotificationSource {
    async fn connect(&self, channel: &str) -> Result<Box<dyn NotificationStream>, StoreError> {
        let mut stream = TcpStream::connect(&self.address).await?;
        stream
            .write_all(format!("LISTEN {}\n", channel).as_bytes())
            .await?;
        Ok(Box::new(TcpNotificationStream {
            channel: channel.to_string(),
            lines: BufReader::new(stream).lines(),
        }))
    }
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// 每次 connect 依次取出一个脚本化的会话
    struct ScriptedSource {
        sessions: parking_lot::Mutex<VecDeque<Vec<Step>>>,
        connects: AtomicUsize,
    }

    #[derive(Clone)]
    enum Step {
        Emit(&'static str),
        Fail,
        Panic,
    }

    struct ScriptedStream {
        steps: VecDeque<Step>,
    }

    #[async_trait]
    impl NotificationStream for ScriptedStream {
        async fn next(&mut self) -> Result<Option<Notification>, StoreError> {
            match self.steps.pop_front() {
                Some(Step::Emit(p)) => Ok(Some(Notification {
                    channel: "creds".to_string(),
                    payload: p.to_string(),
                })),
                Some(Step::Fail) => Err(StoreError::Channel("connection reset".to_string())),
                Some(Step::Panic) => panic!("driver bug"),
                // 脚本耗尽后挂起，模拟空闲连接
                None => std::future::pending().await,
            }
        }
    }

    #[async_trait]
    impl NotificationSource for ScriptedSource {
        async fn connect(&self, _channel: &str) -> Result<Box<dyn NotificationStream>, StoreError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            let steps = self.sessions.lock().pop_front().unwrap_or_default();
            Ok(Box::new(ScriptedStream { steps: steps.into() }))
        }
    }

    #[tokio::test]
    async fn test_reconnects_after_error_and_panic() {
        let source = Arc::new(ScriptedSource {
            sessions: parking_lot::Mutex::new(VecDeque::from(vec![
                vec![Step::Emit("a"), Step::Fail],
                vec![Step::Panic],
                vec![Step::Emit("b")],
            ])),
            connects: AtomicUsize::new(0),
        });

        let received = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let mut listener =
            NotificationListener::new("creds", source.clone(), Duration::from_millis(5));
        let sink = received.clone();
        listener.add_handler(move |n| sink.lock().push(n.payload.clone()));

        listener.start();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(listener.is_running());
        listener.stop().await;

        assert_eq!(*received.lock(), vec!["a".to_string(), "b".to_string()]);
        assert_eq!(source.connects.load(Ordering::SeqCst), 3);
        assert!(!listener.is_running());
    }

    #[tokio::test]
    async fn test_tcp_source_reads_lines() {
        let server = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap();
        tokio::spawn(async move {
            let (socket, _) = server.accept().await.unwrap();
            let mut reader = BufReader::new(socket);
            let mut line = String::new();
            reader.read_line(&mut line).await.unwrap();
            assert_eq!(line, "LISTEN creds\n");
            reader.get_mut().write_all(b"rotated\n").await.unwrap();
        });

        let source = TcpNotificationSource::new(addr.to_string());
        let mut stream = source.connect("creds").await.unwrap();
        let n = stream.next().await.unwrap().unwrap();
        assert_eq!(n.channel, "creds");
        assert_eq!(n.payload, "rotated");
        assert!(stream.next().await.unwrap().is_none());
    }
}
