use std::time::Duration;

use sandsched_errors::{SchedulerError, SchedulerResult};

/// 单次执行时限的下限
pub const MIN_EXECUTION_TIME: Duration = Duration::from_secs(30);

/// 调度核心配置
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// 执行器并发上限
    pub max_running: usize,
    /// 首次之外允许的额外尝试次数
    pub max_retries: u32,
    /// 单次执行的墙钟时限，低于下限时取下限
    pub max_execution_time: Duration,
    /// 结果消费者落库操作的时限
    pub update_timeout: Duration,
    /// 监视器扫描周期
    pub monitor_period: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_running: 50,
            max_retries: 3,
            max_execution_time: Duration::from_secs(60),
            update_timeout: Duration::from_secs(60),
            monitor_period: Duration::from_secs(60),
        }
    }
}

impl SchedulerConfig {
    pub fn validate(&self) -> SchedulerResult<()> {
        if self.max_running == 0 {
            return Err(SchedulerError::config_error("max_running 必须大于0"));
        }
        if self.max_execution_time.is_zero() {
            return Err(SchedulerError::config_error("max_execution_time 必须大于0"));
        }
        if self.update_timeout.is_zero() {
            return Err(SchedulerError::config_error("update_timeout 必须大于0"));
        }
        if self.monitor_period.is_zero() {
            return Err(SchedulerError::config_error("monitor_period 必须大于0"));
        }
        Ok(())
    }

    /// 返回校验过且执行时限不低于下限的配置
    pub fn normalized(mut self) -> SchedulerResult<Self> {
        self.validate()?;
        if self.max_execution_time < MIN_EXECUTION_TIME {
            self.max_execution_time = MIN_EXECUTION_TIME;
        }
        Ok(self)
    }
}
