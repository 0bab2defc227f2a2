use std::time::Duration;

/// 重试退避策略
#[derive(Clone, Debug)]
pub enum Backoff {
    Exponential { base: Duration },
}

impl Backoff {
    pub fn exponential(base: Duration) -> Self {
        Backoff::Exponential { base }
    }

    /// 第 attempt 次尝试后的等待时长，attempt 从 1 开始计
    pub fn delay_at(&self, attempt: u32) -> Duration {
        match self {
            Backoff::Exponential { base } => {
                let exp = std::cmp::min(attempt.saturating_sub(1), 20);
                let factor = 1u32 << exp;
                base.saturating_mul(factor)
            }
        }
    }
}
