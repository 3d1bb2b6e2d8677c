//! 内部事件总线
//!
//! 进程内发布/订阅，解耦存储写路径与消费者（发送器、资源构建器）。
//!
//! - 发布在调用者的任务中同步执行
//! - 处理器按订阅顺序执行
//! - 某个处理器失败不影响后续处理器，全部执行完后返回第一个错误

use super::event::{Event, Topic};
use crate::observability::{BUS_EVENTS_TOTAL, BUS_HANDLER_ERRORS};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// 总线错误
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BusError {
    #[error("handler {handler} failed on topic {topic}: {message}")]
    Handler {
        topic: Topic,
        handler: String,
        message: String,
    },
}

impl BusError {
    pub fn handler(topic: Topic, handler: impl Into<String>, message: impl Into<String>) -> Self {
        BusError::Handler {
            topic,
            handler: handler.into(),
            message: message.into(),
        }
    }
}

/// 事件处理器
pub trait EventHandler: Send + Sync {
    /// 处理器名称（用于日志与指标）
    fn name(&self) -> &str;

    fn handle(&self, event: &Event) -> Result<(), BusError>;
}

/// 总线统计
#[derive(Debug, Default)]
pub struct BusStats {
    pub events_published: AtomicU64,
    pub events_without_subscribers: AtomicU64,
    pub handler_errors: AtomicU64,
}

/// 内部事件总线
pub struct EventBus {
    /// 主题 -> 按订阅顺序排列的处理器
    subscribers: DashMap<Topic, Vec<Arc<dyn EventHandler>>>,

    stats: Arc<BusStats>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            subscribers: DashMap::new(),
            stats: Arc::new(BusStats::default()),
        }
    }

    /// 订阅主题
    pub fn subscribe(&self, topic: Topic, handler: Arc<dyn EventHandler>) {
        log::debug!("Handler {} subscribed to topic {}", handler.name(), topic);
        self.subscribers.entry(topic).or_default().push(handler);
    }

    /// 订阅全部四个主题
    pub fn subscribe_all(&self, handler: Arc<dyn EventHandler>) {
        for topic in Topic::ALL {
            self.subscribe(topic, handler.clone());
        }
    }

    /// 同步发布
    pub fn publish(&self, event: Event) -> Result<(), BusError> {
        let topic = event.topic();
        self.stats.events_published.fetch_add(1, Ordering::Relaxed);
        BUS_EVENTS_TOTAL.with_label_values(&[topic.as_str()]).inc();

        // 先克隆处理器列表再释放分片锁，处理器内部可以再订阅/发布
        let handlers: Vec<Arc<dyn EventHandler>> = match self.subscribers.get(&topic) {
            Some(list) => list.clone(),
            None => Vec::new(),
        };

        if handlers.is_empty() {
            self.stats
                .events_without_subscribers
                .fetch_add(1, Ordering::Relaxed);
            log::debug!("No subscribers for topic {}", topic);
            return Ok(());
        }

        let mut first_error = None;
        for handler in handlers {
            if let Err(e) = handler.handle(&event) {
                self.stats.handler_errors.fetch_add(1, Ordering::Relaxed);
                BUS_HANDLER_ERRORS
                    .with_label_values(&[topic.as_str(), handler.name()])
                    .inc();
                log::warn!("Bus handler {} failed on {}: {}", handler.name(), topic, e);
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub fn subscriber_count(&self, topic: Topic) -> usize {
        self.subscribers.get(&topic).map(|l| l.len()).unwrap_or(0)
    }

    /// 获取统计信息
    pub fn get_stats(&self) -> BusStatsSnapshot {
        BusStatsSnapshot {
            events_published: self.stats.events_published.load(Ordering::Relaxed),
            events_without_subscribers: self
                .stats
                .events_without_subscribers
                .load(Ordering::Relaxed),
            handler_errors: self.stats.handler_errors.load(Ordering::Relaxed),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// 统计信息快照
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusStatsSnapshot {
    pub events_published: u64,
    pub events_without_subscribers: u64,
    pub handler_errors: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{ChangeEvent, ReloadEvent};
    use parking_lot::Mutex;

    struct Recorder {
        name: String,
        log: Arc<Mutex<Vec<String>>>,
        fail: bool,
    }

    impl EventHandler for Recorder {
        fn name(&self) -> &str {
            &self.name
        }

        fn handle(&self, event: &Event) -> Result<(), BusError> {
            self.log
                .lock()
                .push(format!("{}:{}", self.name, event.topic()));
            if self.fail {
                Err(BusError::handler(event.topic(), &self.name, "boom"))
            } else {
                Ok(())
            }
        }
    }

    fn recorder(name: &str, log: &Arc<Mutex<Vec<String>>>, fail: bool) -> Arc<dyn EventHandler> {
        Arc::new(Recorder {
            name: name.to_string(),
            log: log.clone(),
            fail,
        })
    }

    #[test]
    fn test_handlers_run_in_subscription_order() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        bus.subscribe(Topic::Changes, recorder("a", &log, false));
        bus.subscribe(Topic::Changes, recorder("b", &log, false));
        bus.subscribe(Topic::Reload, recorder("c", &log, false));

        bus.publish(ChangeEvent::new(None, vec![]).into()).unwrap();
        assert_eq!(*log.lock(), vec!["a:changes", "b:changes"]);
    }

    #[test]
    fn test_every_handler_runs_and_first_error_returned() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        bus.subscribe(Topic::Reload, recorder("first", &log, true));
        bus.subscribe(Topic::Reload, recorder("second", &log, true));
        bus.subscribe(Topic::Reload, recorder("third", &log, false));

        let err = bus.publish(ReloadEvent::all().into()).unwrap_err();
        assert_eq!(err, BusError::handler(Topic::Reload, "first", "boom"));
        assert_eq!(*log.lock(), vec!["first:reload", "second:reload", "third:reload"]);
        assert_eq!(bus.get_stats().handler_errors, 2);
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus = EventBus::new();
        bus.publish(ReloadEvent::all().into()).unwrap();
        let stats = bus.get_stats();
        assert_eq!(stats.events_published, 1);
        assert_eq!(stats.events_without_subscribers, 1);
    }

    #[test]
    fn test_subscribe_all() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        bus.subscribe_all(recorder("s", &log, false));
        for topic in Topic::ALL {
            assert_eq!(bus.subscriber_count(topic), 1);
        }
    }
}
