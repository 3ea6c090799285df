//! 重试策略：有界指数退避，仅对瞬时错误重试
//!
//! 延迟 = base * 2^attempt，封顶 max_delay；默认 3 次尝试、base 1s、cap 10s。

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

/// 可区分瞬时 / 永久失败的错误（限流、超时、连接类为瞬时）
pub trait Transient {
    fn is_transient(&self) -> bool;
}

/// 重试策略（由配置构造后注入 LLM 包装器与工具分发器）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// 总尝试次数（含首次）
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
        }
    }

    /// 不重试（测试或无需退避的场景）
    pub fn no_retry() -> Self {
        Self::new(1, Duration::ZERO, Duration::ZERO)
    }

    /// 第 attempt 次失败（从 0 计）之后的等待时长
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// 执行 op，瞬时错误按退避重试；返回最终结果
    pub async fn run<T, E, F, Fut>(&self, label: &str, op: F) -> Result<T, E>
    where
        E: Transient + Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.run_counted(label, op).await.0
    }

    /// 同 run，并返回实际尝试次数（用于审计日志）
    pub async fn run_counted<T, E, F, Fut>(&self, label: &str, mut op: F) -> (Result<T, E>, u32)
    where
        E: Transient + Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match op().await {
                Ok(v) => return (Ok(v), attempt),
                Err(e) if e.is_transient() && attempt < self.max_attempts => {
                    let delay = self.delay_for(attempt - 1);
                    tracing::warn!(
                        op = label,
                        attempt,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "transient failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    if e.is_transient() {
                        tracing::warn!(op = label, attempts = attempt, error = %e, "retries exhausted");
                    }
                    return (Err(e), attempt);
                }
            }
        }
    }
}
