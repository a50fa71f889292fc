use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::debug;
use uuid::Uuid;

use crate::entities::{NewTask, Task, TaskMessage, TaskStatus, TaskUpdate};
use crate::messaging::{MessageQueue, QUEUE_TASKS};
use crate::repositories::TaskRepository;
use crate::value_objects::{OrderBy, Page};
use sandsched_errors::{SchedulerError, SchedulerResult};

/// 任务领域服务
///
/// 创建时如果距离计划时间已不足一个到期窗口，任务会被立即投递到
/// tasks 队列；更远的任务完全依赖监视器在窗口临近时补投。
pub struct TaskService {
    repository: Arc<dyn TaskRepository>,
    queue: Arc<dyn MessageQueue>,
    due_window: Duration,
}

impl TaskService {
    pub async fn new(
        repository: Arc<dyn TaskRepository>,
        queue: Arc<dyn MessageQueue>,
        due_window: std::time::Duration,
    ) -> SchedulerResult<Self> {
        queue.declare_queue(QUEUE_TASKS).await?;

        let due_window = Duration::from_std(due_window)
            .map_err(|e| SchedulerError::config_error(format!("无效的到期窗口: {e}")))?;

        Ok(Self {
            repository,
            queue,
            due_window,
        })
    }

    pub async fn create_task(&self, new_task: NewTask) -> SchedulerResult<Task> {
        let now = Utc::now();
        let task = Task {
            id: Uuid::new_v4(),
            user_id: new_task.user_id,
            command: new_task.command,
            args: new_task.args,
            image: new_task.image,
            environment: new_task.environment,
            status: TaskStatus::Pending,
            result: String::new(),
            err_message: String::new(),
            scheduled_at: new_task.scheduled_at,
            created_at: now,
            updated_at: now,
        };

        self.repository.create(&task).await?;

        if task.scheduled_at - now < self.due_window {
            let payload = TaskMessage::new(task.clone()).serialize_bytes()?;
            self.queue.publish(QUEUE_TASKS, &payload).await?;
            debug!(task_id = %task.id, "任务在到期窗口内，已直接入队");
        }

        Ok(task)
    }

    pub async fn get_task(&self, id: Uuid) -> SchedulerResult<Task> {
        self.repository.get_by_id(id).await
    }

    pub async fn delete_task(&self, id: Uuid) -> SchedulerResult<()> {
        self.repository.delete(id).await
    }

    /// 应用部分更新并持久化，updated_at 取当前时间
    pub async fn update_task(&self, mut task: Task, update: TaskUpdate) -> SchedulerResult<Task> {
        if let Some(status) = update.status {
            task.status = status;
        }
        if let Some(result) = update.result {
            task.result = result;
        }
        if let Some(err_message) = update.err_message {
            task.err_message = err_message;
        }
        task.updated_at = Utc::now();

        self.repository.update(&task).await?;
        Ok(task)
    }

    pub async fn get_tasks_by_user(
        &self,
        user_id: Uuid,
        page: Page,
        order: OrderBy,
    ) -> SchedulerResult<Vec<Task>> {
        self.repository.get_by_user_id(user_id, page, order).await
    }

    pub async fn get_all_due(&self, now: DateTime<Utc>) -> SchedulerResult<Vec<Task>> {
        self.repository.get_all_due(now, self.due_window).await
    }
}
