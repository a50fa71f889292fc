use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::entities::Task;
use crate::value_objects::{OrderBy, Page};
use sandsched_errors::SchedulerResult;

/// 任务仓储抽象
#[async_trait]
pub trait TaskRepository: Send + Sync {
    async fn create(&self, task: &Task) -> SchedulerResult<()>;

    async fn update(&self, task: &Task) -> SchedulerResult<()>;

    async fn delete(&self, id: Uuid) -> SchedulerResult<()>;

    /// 不存在时返回 TaskNotFound
    async fn get_by_id(&self, id: Uuid) -> SchedulerResult<Task>;

    async fn get_by_user_id(
        &self,
        user_id: Uuid,
        page: Page,
        order: OrderBy,
    ) -> SchedulerResult<Vec<Task>>;

    /// 到期窗口内（含已过期）的 pending 任务
    async fn get_all_due(
        &self,
        now: DateTime<Utc>,
        due_window: chrono::Duration,
    ) -> SchedulerResult<Vec<Task>>;
}

/// 重试计数仓储抽象
///
/// 键不存在用 RetryCountNotFound 哨兵表达，语义上等于"尚无任何重试"。
#[async_trait]
pub trait RetryCountRepository: Send + Sync {
    /// 写入0，幂等
    async fn create(&self, task_id: Uuid) -> SchedulerResult<()>;

    async fn get(&self, task_id: Uuid) -> SchedulerResult<u32>;

    async fn update(&self, task_id: Uuid, attempts: u32) -> SchedulerResult<()>;

    async fn delete(&self, task_id: Uuid) -> SchedulerResult<()>;
}
