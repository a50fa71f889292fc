use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use sandsched_domain::repositories::RetryCountRepository;
use sandsched_errors::{SchedulerError, SchedulerResult};

/// 内存重试计数存储，测试与嵌入式部署用
#[derive(Default)]
pub struct MemoryRetryStore {
    counters: RwLock<HashMap<Uuid, u32>>,
}

impl MemoryRetryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RetryCountRepository for MemoryRetryStore {
    async fn create(&self, task_id: Uuid) -> SchedulerResult<()> {
        self.counters.write().await.insert(task_id, 0);
        Ok(())
    }

    async fn get(&self, task_id: Uuid) -> SchedulerResult<u32> {
        self.counters
            .read()
            .await
            .get(&task_id)
            .copied()
            .ok_or(SchedulerError::RetryCountNotFound { id: task_id })
    }

    async fn update(&self, task_id: Uuid, attempts: u32) -> SchedulerResult<()> {
        self.counters.write().await.insert(task_id, attempts);
        Ok(())
    }

    async fn delete(&self, task_id: Uuid) -> SchedulerResult<()> {
        self.counters
            .write()
            .await
            .remove(&task_id)
            .map(|_| ())
            .ok_or(SchedulerError::RetryCountNotFound { id: task_id })
    }
}
