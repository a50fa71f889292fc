pub mod models;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("配置加载失败: {0}")]
    Load(#[from] config::ConfigError),
    #[error("配置文件不存在: {0}")]
    NotFound(String),
    #[error("配置验证失败: {0}")]
    Validation(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

pub use models::{
    AppConfig, DatabaseConfig, MessageQueueConfig, ObservabilityConfig, RedisConfig,
    SchedulerSettings,
};
