use async_trait::async_trait;
use redis::{aio::ConnectionManager, AsyncCommands};
use tracing::debug;
use uuid::Uuid;

use sandsched_domain::repositories::RetryCountRepository;
use sandsched_errors::{SchedulerError, SchedulerResult};

const KEY_PREFIX: &str = "tasks";
const FIELD_RETRIES: &str = "retries";

/// Redis重试计数存储
///
/// 键格式 `tasks:<task_id>`，计数放在 hash 的 retries 字段。
/// 键不存在映射为 RetryCountNotFound 哨兵。
pub struct RedisRetryStore {
    conn: ConnectionManager,
}

impl RedisRetryStore {
    pub async fn connect(url: &str) -> SchedulerResult<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| SchedulerError::RetryStore(format!("无效的Redis地址: {e}")))?;

        let conn = client
            .get_connection_manager()
            .await
            .map_err(|e| SchedulerError::RetryStore(format!("连接Redis失败: {e}")))?;

        Ok(Self { conn })
    }

    pub fn with_connection(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    fn key(task_id: Uuid) -> String {
        format!("{KEY_PREFIX}:{task_id}")
    }
}

#[async_trait]
impl RetryCountRepository for RedisRetryStore {
    async fn create(&self, task_id: Uuid) -> SchedulerResult<()> {
        let mut conn = self.conn.clone();
        conn.hset::<_, _, _, ()>(Self::key(task_id), FIELD_RETRIES, 0u32)
            .await
            .map_err(|e| SchedulerError::RetryStore(format!("hset: {e}")))?;
        Ok(())
    }

    async fn get(&self, task_id: Uuid) -> SchedulerResult<u32> {
        let mut conn = self.conn.clone();
        let attempts: Option<u32> = conn
            .hget(Self::key(task_id), FIELD_RETRIES)
            .await
            .map_err(|e| SchedulerError::RetryStore(format!("hget: {e}")))?;

        attempts.ok_or(SchedulerError::RetryCountNotFound { id: task_id })
    }

    async fn update(&self, task_id: Uuid, attempts: u32) -> SchedulerResult<()> {
        let mut conn = self.conn.clone();
        conn.hset::<_, _, _, ()>(Self::key(task_id), FIELD_RETRIES, attempts)
            .await
            .map_err(|e| SchedulerError::RetryStore(format!("hset: {e}")))?;
        Ok(())
    }

    async fn delete(&self, task_id: Uuid) -> SchedulerResult<()> {
        let mut conn = self.conn.clone();
        let removed: i64 = conn
            .del(Self::key(task_id))
            .await
            .map_err(|e| SchedulerError::RetryStore(format!("del: {e}")))?;

        if removed == 0 {
            return Err(SchedulerError::RetryCountNotFound { id: task_id });
        }

        debug!(task_id = %task_id, "重试计数已删除");
        Ok(())
    }
}
