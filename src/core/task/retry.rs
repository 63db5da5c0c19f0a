use std::time::Duration;

use crate::config::Config;
use crate::core::error::DownloadError;

/// 重试策略
///
/// 固定间隔重试。`max_attempts` 包含首次尝试，最少为 1。
#[derive(Debug, Clone, PartialEq)]
pub struct RetryStrategy {
    pub max_attempts: usize,
    pub delay: Duration,
}

impl Default for RetryStrategy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: Duration::from_secs(2),
        }
    }
}

impl RetryStrategy {
    pub fn new(max_retries: usize, delay: Duration) -> Self {
        Self {
            max_attempts: max_retries.max(1),
            delay,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.max_retries, config.retry_delay())
    }

    /// 已经尝试 `attempts` 次后，遇到 `error` 是否还要再试
    pub fn should_retry(&self, error: &DownloadError, attempts: usize) -> bool {
        attempts < self.max_attempts && error.is_retryable()
    }
}

/// 重试上下文
#[derive(Debug)]
pub struct RetryContext {
    pub strategy: RetryStrategy,
    pub attempts: usize,
    pub last_error: Option<DownloadError>,
}

impl RetryContext {
    pub fn new(strategy: RetryStrategy) -> Self {
        Self {
            strategy,
            attempts: 0,
            last_error: None,
        }
    }

    /// 记录一次失败的尝试
    pub fn record_failure(&mut self, error: DownloadError) {
        self.attempts += 1;
        self.last_error = Some(error);
    }

    pub fn should_retry(&self) -> bool {
        match &self.last_error {
            Some(error) => self.strategy.should_retry(error, self.attempts),
            None => self.attempts < self.strategy.max_attempts,
        }
    }

    pub fn delay(&self) -> Duration {
        self.strategy.delay
    }

    pub fn take_last_error(&mut self) -> Option<DownloadError> {
        self.last_error.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transient() -> DownloadError {
        DownloadError::UnexpectedStatus { status: 503, expected: 206 }
    }

    #[test]
    fn test_zero_retries_still_attempts_once() {
        let strategy = RetryStrategy::new(0, Duration::from_millis(10));
        assert_eq!(strategy.max_attempts, 1);

        let mut ctx = RetryContext::new(strategy);
        assert!(ctx.should_retry());
        ctx.record_failure(transient());
        assert!(!ctx.should_retry());
    }

    #[test]
    fn test_retry_budget() {
        let mut ctx = RetryContext::new(RetryStrategy::new(3, Duration::from_millis(10)));
        ctx.record_failure(transient());
        assert!(ctx.should_retry());
        ctx.record_failure(transient());
        assert!(ctx.should_retry());
        ctx.record_failure(transient());
        assert!(!ctx.should_retry());
        assert_eq!(ctx.attempts, 3);
        assert!(matches!(
            ctx.take_last_error(),
            Some(DownloadError::UnexpectedStatus { status: 503, .. })
        ));
    }

    #[test]
    fn test_non_retryable_error_stops_immediately() {
        let mut ctx = RetryContext::new(RetryStrategy::new(5, Duration::from_millis(10)));
        ctx.record_failure(DownloadError::Cancelled);
        assert!(!ctx.should_retry());
    }

    #[test]
    fn test_from_config() {
        let config = Config::default().with_max_retries(4).with_retry_delay_ms(250);
        let strategy = RetryStrategy::from_config(&config);
        assert_eq!(strategy.max_attempts, 4);
        assert_eq!(strategy.delay, Duration::from_millis(250));
    }
}
