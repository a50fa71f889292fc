use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use sandsched_domain::entities::{Task, TaskStatus};
use sandsched_domain::repositories::TaskRepository;
use sandsched_domain::value_objects::{OrderBy, OrderDirection, OrderField, Page};
use sandsched_errors::{SchedulerError, SchedulerResult};

/// 内存任务仓储，测试与嵌入式部署用
#[derive(Default)]
pub struct MemoryTaskRepository {
    tasks: RwLock<HashMap<Uuid, Task>>,
}

impl MemoryTaskRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskRepository for MemoryTaskRepository {
    async fn create(&self, task: &Task) -> SchedulerResult<()> {
        self.tasks.write().await.insert(task.id, task.clone());
        Ok(())
    }

    async fn update(&self, task: &Task) -> SchedulerResult<()> {
        let mut tasks = self.tasks.write().await;
        if !tasks.contains_key(&task.id) {
            return Err(SchedulerError::TaskNotFound { id: task.id });
        }
        tasks.insert(task.id, task.clone());
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> SchedulerResult<()> {
        self.tasks
            .write()
            .await
            .remove(&id)
            .map(|_| ())
            .ok_or(SchedulerError::TaskNotFound { id })
    }

    async fn get_by_id(&self, id: Uuid) -> SchedulerResult<Task> {
        self.tasks
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(SchedulerError::TaskNotFound { id })
    }

    async fn get_by_user_id(
        &self,
        user_id: Uuid,
        page: Page,
        order: OrderBy,
    ) -> SchedulerResult<Vec<Task>> {
        let mut tasks: Vec<Task> = self
            .tasks
            .read()
            .await
            .values()
            .filter(|t| t.user_id == user_id)
            .cloned()
            .collect();

        tasks.sort_by(|a, b| {
            let ordering = match order.field {
                OrderField::CreatedAt => a.created_at.cmp(&b.created_at),
                OrderField::ScheduledAt => a.scheduled_at.cmp(&b.scheduled_at),
                OrderField::Status => a.status.to_string().cmp(&b.status.to_string()),
            };
            match order.direction {
                OrderDirection::Asc => ordering,
                OrderDirection::Desc => ordering.reverse(),
            }
        });

        Ok(tasks
            .into_iter()
            .skip(page.offset() as usize)
            .take(page.rows_per_page() as usize)
            .collect())
    }

    async fn get_all_due(
        &self,
        now: DateTime<Utc>,
        due_window: Duration,
    ) -> SchedulerResult<Vec<Task>> {
        Ok(self
            .tasks
            .read()
            .await
            .values()
            .filter(|t| t.status == TaskStatus::Pending && t.scheduled_at - now <= due_window)
            .cloned()
            .collect())
    }
}
