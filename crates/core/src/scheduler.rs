use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{RwLock, Semaphore};
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};
use uuid::Uuid;

use sandsched_domain::entities::{Task, TaskMessage, TaskStatus, TaskUpdate};
use sandsched_domain::messaging::{
    MessageDelivery, MessageQueue, QUEUE_FAILED, QUEUE_RETRY, QUEUE_SUCCESS, QUEUE_TASKS,
};
use sandsched_domain::repositories::RetryCountRepository;
use sandsched_domain::sandbox::Sandbox;
use sandsched_domain::services::TaskService;
use sandsched_errors::{SchedulerError, SchedulerResult};

use crate::config::SchedulerConfig;

/// 调度器的外部协作方
pub struct SchedulerDeps {
    pub queue: Arc<dyn MessageQueue>,
    pub task_service: Arc<TaskService>,
    pub retry_store: Arc<dyn RetryCountRepository>,
    pub sandbox: Arc<dyn Sandbox>,
}

/// 任务调度核心
///
/// 四个队列消费者 + 有界执行器池 + 到期任务监视器。接收时刻与执行时刻
/// 解耦：tasks 消费者把任务交给执行器，执行器睡到计划时刻再调沙箱，
/// 结果经 success/retry 队列由各自消费者落库。共享可变状态只有执行器
/// 注册表和关闭信号。克隆得到的是同一个调度器的新句柄。
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

struct SchedulerInner {
    queue: Arc<dyn MessageQueue>,
    task_service: Arc<TaskService>,
    retry_store: Arc<dyn RetryCountRepository>,
    sandbox: Arc<dyn Sandbox>,
    config: SchedulerConfig,
    semaphore: Arc<Semaphore>,
    shutdown: CancellationToken,
    executors: RwLock<HashMap<Uuid, CancellationToken>>,
    tracker: TaskTracker,
}

impl Scheduler {
    /// 创建调度器：校验配置并声明全部四个队列
    pub async fn new(config: SchedulerConfig, deps: SchedulerDeps) -> SchedulerResult<Self> {
        let config = config.normalized()?;

        for queue in [QUEUE_TASKS, QUEUE_SUCCESS, QUEUE_FAILED, QUEUE_RETRY] {
            deps.queue.declare_queue(queue).await?;
        }

        Ok(Self {
            inner: Arc::new(SchedulerInner {
                queue: deps.queue,
                task_service: deps.task_service,
                retry_store: deps.retry_store,
                sandbox: deps.sandbox,
                semaphore: Arc::new(Semaphore::new(config.max_running)),
                config,
                shutdown: CancellationToken::new(),
                executors: RwLock::new(HashMap::new()),
                tracker: TaskTracker::new(),
            }),
        })
    }

    /// 当前注册在案的执行器数量
    pub async fn running_executors(&self) -> usize {
        self.inner.executors.read().await.len()
    }

    /// 优雅关闭
    ///
    /// 顺序：关闭信号 → 取消注册表快照里的全部执行器 → 在宽限期内等待
    /// 执行器清理完毕。宽限期内没等到则返回超时，剩余执行器转为尽力而为，
    /// 它们的结果仍会落到 outcome 队列上。
    pub async fn shutdown(&self, grace: Duration) -> SchedulerResult<()> {
        info!(component = "scheduler", "开始优雅关闭");
        self.inner.shutdown.cancel();

        {
            // 读锁下快照取消；写入方只有提交路径和执行器自身的清理
            let executors = self.inner.executors.read().await;
            info!(
                component = "scheduler",
                running = executors.len(),
                "向在运行的执行器传播取消"
            );
            for cancel in executors.values() {
                cancel.cancel();
            }
        }

        self.inner.tracker.close();
        match timeout(grace, self.inner.tracker.wait()).await {
            Ok(()) => {
                info!(component = "scheduler", "全部执行器已退出");
                Ok(())
            }
            Err(_) => Err(SchedulerError::Timeout(format!(
                "等待执行器退出超过 {}s",
                grace.as_secs()
            ))),
        }
    }

    /// 监听 tasks 队列，把就绪任务交给执行器池
    pub async fn consume_tasks(&self) -> SchedulerResult<()> {
        let mut deliveries = self.inner.queue.consume(QUEUE_TASKS).await?;
        let scheduler = self.clone();

        tokio::spawn(async move {
            loop {
                let delivery = tokio::select! {
                    biased;
                    _ = scheduler.inner.shutdown.cancelled() => {
                        info!(component = "tasks_consumer", "收到关闭信号，停止领取新任务");
                        break;
                    }
                    delivery = deliveries.recv() => match delivery {
                        Some(delivery) => delivery,
                        None => break,
                    },
                };

                let Some(task) = scheduler.ack_and_parse(delivery, "tasks_consumer").await
                else {
                    continue;
                };

                match scheduler.submit_task(task).await {
                    Ok(()) => {}
                    Err(SchedulerError::ShuttingDown) => {
                        // 消息已确认，任务在库里仍是 pending，之后由监视器补投
                        warn!(component = "tasks_consumer", "调度器关闭中，任务被放弃");
                    }
                    Err(e) => {
                        error!(component = "tasks_consumer", "提交任务到执行器失败: {e}");
                    }
                }
            }
        });

        Ok(())
    }

    /// 监听 success 队列，持久化成功终态
    pub async fn on_task_success(&self) -> SchedulerResult<()> {
        let mut deliveries = self.inner.queue.consume(QUEUE_SUCCESS).await?;
        let scheduler = self.clone();

        tokio::spawn(async move {
            // 故意不理会关闭信号：消息一经确认，落库就必须完成，否则结果丢失
            while let Some(delivery) = deliveries.recv().await {
                let scheduler = scheduler.clone();
                tokio::spawn(async move {
                    scheduler.handle_success_message(delivery).await;
                });
            }
        });

        Ok(())
    }

    /// 监听 failed 队列，持久化失败终态
    pub async fn on_task_failure(&self) -> SchedulerResult<()> {
        let mut deliveries = self.inner.queue.consume(QUEUE_FAILED).await?;
        let scheduler = self.clone();

        tokio::spawn(async move {
            while let Some(delivery) = deliveries.recv().await {
                let scheduler = scheduler.clone();
                tokio::spawn(async move {
                    scheduler.handle_failed_message(delivery).await;
                });
            }
        });

        Ok(())
    }

    /// 监听 retry 队列，给失败尝试做预算裁决
    ///
    /// 逐条顺序处理：prefetch=1 加顺序消费让计数的读改写无需CAS。
    pub async fn on_task_retry(&self) -> SchedulerResult<()> {
        let mut deliveries = self.inner.queue.consume(QUEUE_RETRY).await?;
        let scheduler = self.clone();

        tokio::spawn(async move {
            while let Some(delivery) = deliveries.recv().await {
                if scheduler.inner.shutdown.is_cancelled() {
                    // tasks 消费者已停止，重新入队只会把任务丢在地上，就地按终态失败落库
                    info!(component = "retry_consumer", "关闭中，在途重试直接按失败处理");
                    scheduler.handle_failed_message(delivery).await;
                    continue;
                }
                scheduler.handle_retry_message(delivery).await;
            }
        });

        Ok(())
    }

    /// 周期扫描临近计划时刻的 pending 任务并补投到 tasks 队列
    ///
    /// 重复投递是预期内的：状态只经 outcome 队列写入，重复执行最多造成
    /// 一次多余的尝试，而尝试次数有预算约束。
    pub async fn monitor_scheduled_tasks(&self) -> SchedulerResult<()> {
        let scheduler = self.clone();

        tokio::spawn(async move {
            let period = scheduler.inner.config.monitor_period;
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;
                    _ = scheduler.inner.shutdown.cancelled() => {
                        info!(component = "monitor", "收到关闭信号");
                        break;
                    }
                    _ = ticker.tick() => scheduler.sweep_due_tasks().await,
                }
            }
        });

        Ok(())
    }

    async fn sweep_due_tasks(&self) {
        let due = match self.inner.task_service.get_all_due(Utc::now()).await {
            Ok(due) => due,
            Err(e) => {
                error!(component = "monitor", "查询到期任务失败: {e}");
                return;
            }
        };

        for task in due {
            if let Err(e) = self.publish_task(&task, QUEUE_TASKS).await {
                error!(component = "monitor", task_id = %task.id, "补投任务失败: {e}");
            }
        }
    }

    /// 申请执行器额度并派发执行
    ///
    /// 在信号量和关闭信号之间等待；提交方的生存期只决定是否受理，
    /// 不控制沙箱运行——执行时限一律从受理时刻起算。
    async fn submit_task(&self, task: Task) -> SchedulerResult<()> {
        let permit = tokio::select! {
            biased;
            _ = self.inner.shutdown.cancelled() => return Err(SchedulerError::ShuttingDown),
            permit = Arc::clone(&self.inner.semaphore).acquire_owned() => {
                permit.map_err(|_| SchedulerError::ShuttingDown)?
            }
        };

        let executor_id = Uuid::new_v4();
        let cancel = CancellationToken::new();
        self.inner
            .executors
            .write()
            .await
            .insert(executor_id, cancel.clone());

        let scheduler = self.clone();
        self.inner.tracker.spawn(async move {
            scheduler.run_executor(executor_id, &cancel, task).await;

            // 清理在每条退出路径上都执行
            cancel.cancel();
            scheduler.inner.executors.write().await.remove(&executor_id);
            drop(permit);
        });

        Ok(())
    }

    async fn run_executor(&self, executor_id: Uuid, cancel: &CancellationToken, mut task: Task) {
        // 睡到计划时刻；已过期则立即执行。关闭传播的取消同样会中断等待
        let wait = (task.scheduled_at - Utc::now())
            .to_std()
            .unwrap_or(Duration::ZERO);
        if !wait.is_zero() {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    task.status = TaskStatus::Failed;
                    task.err_message = "执行在计划时刻前被取消".to_string();
                    task.result.clear();
                    if let Err(e) = self.publish_task(&task, QUEUE_RETRY).await {
                        error!(
                            component = "executor",
                            task_id = %task.id,
                            "发布到重试队列失败: {e}"
                        );
                    }
                    return;
                }
                _ = tokio::time::sleep(wait) => {}
            }
        }

        info!(
            component = "executor",
            executor_id = %executor_id,
            task_id = %task.id,
            "开始执行任务"
        );

        let run = self
            .inner
            .sandbox
            .run(&task.image, &task.command, &task.args, &task.environment);
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(SchedulerError::SandboxExecution(
                "执行被取消".to_string(),
            )),
            result = timeout(self.inner.config.max_execution_time, run) => match result {
                Ok(result) => result,
                Err(_) => Err(SchedulerError::ExecutionTimeout),
            },
        };

        match outcome {
            Ok(stdout) => {
                task.status = TaskStatus::Completed;
                task.result = stdout;
                task.err_message.clear();
                if let Err(e) = self.publish_task(&task, QUEUE_SUCCESS).await {
                    // 只记录不重试；任务在库里仍是 pending，监视器之后会再次投递
                    error!(
                        component = "executor",
                        task_id = %task.id,
                        "发布到成功队列失败: {e}"
                    );
                }
            }
            Err(e) => {
                task.status = TaskStatus::Failed;
                task.err_message = e.to_string();
                task.result.clear();
                if let Err(e) = self.publish_task(&task, QUEUE_RETRY).await {
                    error!(
                        component = "executor",
                        task_id = %task.id,
                        "发布到重试队列失败: {e}"
                    );
                }
            }
        }
    }

    async fn handle_success_message(&self, delivery: MessageDelivery) {
        let Some(task) = self.ack_and_parse(delivery, "success_consumer").await else {
            return;
        };
        let task_id = task.id;

        let update = TaskUpdate {
            status: Some(TaskStatus::Completed),
            result: Some(task.result.clone()),
            err_message: None,
        };

        match timeout(
            self.inner.config.update_timeout,
            self.inner.task_service.update_task(task, update),
        )
        .await
        {
            Ok(Ok(_)) => {
                info!(
                    component = "success_consumer",
                    task_id = %task_id,
                    "任务执行成功并已落库"
                );
            }
            Ok(Err(e)) => {
                error!(
                    component = "success_consumer",
                    task_id = %task_id,
                    "更新任务失败: {e}"
                );
                return;
            }
            Err(_) => {
                error!(
                    component = "success_consumer",
                    task_id = %task_id,
                    "更新任务超时"
                );
                return;
            }
        }

        self.cleanup_retry_count(task_id, "success_consumer").await;
    }

    async fn handle_failed_message(&self, delivery: MessageDelivery) {
        let Some(task) = self.ack_and_parse(delivery, "failed_consumer").await else {
            return;
        };
        let task_id = task.id;

        let update = TaskUpdate {
            status: Some(TaskStatus::Failed),
            result: None,
            err_message: Some(task.err_message.clone()),
        };

        match timeout(
            self.inner.config.update_timeout,
            self.inner.task_service.update_task(task, update),
        )
        .await
        {
            Ok(Ok(_)) => {
                info!(
                    component = "failed_consumer",
                    task_id = %task_id,
                    "任务以失败告终并已落库"
                );
            }
            Ok(Err(e)) => {
                error!(
                    component = "failed_consumer",
                    task_id = %task_id,
                    "更新任务失败: {e}"
                );
                return;
            }
            Err(_) => {
                error!(
                    component = "failed_consumer",
                    task_id = %task_id,
                    "更新任务超时"
                );
                return;
            }
        }

        self.cleanup_retry_count(task_id, "failed_consumer").await;
    }

    async fn handle_retry_message(&self, delivery: MessageDelivery) {
        let Some(task) = self.ack_and_parse(delivery, "retry_consumer").await else {
            return;
        };

        let attempts = match timeout(
            self.inner.config.update_timeout,
            self.inner.retry_store.get(task.id),
        )
        .await
        {
            Ok(Ok(attempts)) => attempts,
            Ok(Err(e)) if e.is_not_found() => 0,
            Ok(Err(e)) => {
                error!(
                    component = "retry_consumer",
                    task_id = %task.id,
                    "读取重试计数失败: {e}"
                );
                return;
            }
            Err(_) => {
                error!(
                    component = "retry_consumer",
                    task_id = %task.id,
                    "读取重试计数超时"
                );
                return;
            }
        };

        let attempts = attempts + 1;
        if attempts > self.inner.config.max_retries {
            info!(
                component = "retry_consumer",
                task_id = %task.id,
                "重试预算耗尽，转入失败队列"
            );
            if let Err(e) = self.publish_task(&task, QUEUE_FAILED).await {
                error!(
                    component = "retry_consumer",
                    task_id = %task.id,
                    "发布到失败队列失败: {e}"
                );
            }
            return;
        }

        match timeout(
            self.inner.config.update_timeout,
            self.inner.retry_store.update(task.id, attempts),
        )
        .await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!(
                    component = "retry_consumer",
                    task_id = %task.id,
                    "更新重试计数失败: {e}"
                );
                return;
            }
            Err(_) => {
                error!(
                    component = "retry_consumer",
                    task_id = %task.id,
                    "更新重试计数超时"
                );
                return;
            }
        }

        info!(
            component = "retry_consumer",
            task_id = %task.id,
            "{attempts}/{}: 重新投递任务",
            self.inner.config.max_retries
        );
        if let Err(e) = self.publish_task(&task, QUEUE_TASKS).await {
            error!(
                component = "retry_consumer",
                task_id = %task.id,
                "重新投递失败: {e}"
            );
        }
    }

    /// 终态落库后清理重试计数，尽力而为
    async fn cleanup_retry_count(&self, task_id: Uuid, component: &'static str) {
        if let Err(e) = self.inner.retry_store.delete(task_id).await {
            if !e.is_not_found() {
                warn!(component, task_id = %task_id, "删除重试计数失败: {e}");
            }
        }
    }

    /// 先确认再解码；解不开的消息丢弃，绝不重新入队
    async fn ack_and_parse(
        &self,
        delivery: MessageDelivery,
        component: &'static str,
    ) -> Option<Task> {
        let body = match delivery.ack().await {
            Ok(body) => body,
            Err(e) => {
                error!(component, "确认消息失败: {e}");
                return None;
            }
        };

        match TaskMessage::deserialize_bytes(&body) {
            Ok(message) => Some(message.task),
            Err(e) => {
                // 任务在库里仍是 pending，监视器会重新投递一份可解析的快照
                error!(component, "解析任务消息失败: {e}");
                None
            }
        }
    }

    async fn publish_task(&self, task: &Task, queue: &str) -> SchedulerResult<()> {
        let payload = TaskMessage::new(task.clone()).serialize_bytes()?;
        self.inner.queue.publish(queue, &payload).await
    }
}
