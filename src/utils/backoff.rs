//! 间隔/退避策略

use crate::utils::config::RetryConfig;
use rand::Rng;
use std::time::Duration;

/// 间隔提供者（发送循环节拍、初始化重试）
pub trait IntervalProvider: Send {
    fn next_interval(&mut self) -> Duration;

    fn reset(&mut self);
}

/// 固定间隔
#[derive(Debug, Clone)]
pub struct FixedInterval {
    interval: Duration,
}

impl FixedInterval {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }
}

impl IntervalProvider for FixedInterval {
    fn next_interval(&mut self) -> Duration {
        self.interval
    }

    fn reset(&mut self) {}
}

/// 指数退避（带 ±20% 抖动，上限 max）
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    initial: Duration,
    max: Duration,
    current: Duration,
    jitter: f64,
}

impl ExponentialBackoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
            jitter: 0.2,
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(
            Duration::from_millis(config.initial_ms),
            Duration::from_millis(config.max_ms),
        )
    }

    /// 关闭抖动（测试中使用确定值）
    pub fn without_jitter(mut self) -> Self {
        self.jitter = 0.0;
        self
    }
}

impl IntervalProvider for ExponentialBackoff {
    fn next_interval(&mut self) -> Duration {
        let base = self.current;
        self.current = self.current.checked_mul(2).unwrap_or(self.max).min(self.max);

        if self.jitter <= 0.0 {
            return base;
        }
        let factor = rand::thread_rng().gen_range((1.0 - self.jitter)..=(1.0 + self.jitter));
        Duration::try_from_secs_f64(base.as_secs_f64() * factor)
            .unwrap_or(self.max)
            .min(self.max)
    }

    fn reset(&mut self) {
        self.current = self.initial;
    }
}
