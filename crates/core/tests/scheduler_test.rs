use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::time::{sleep, timeout};
use uuid::Uuid;

use sandsched_core::{Scheduler, SchedulerConfig, SchedulerDeps};
use sandsched_domain::entities::{NewTask, Task, TaskStatus};
use sandsched_domain::messaging::{MessageQueue, QUEUE_RETRY, QUEUE_TASKS};
use sandsched_domain::repositories::{RetryCountRepository, TaskRepository};
use sandsched_domain::sandbox::Sandbox;
use sandsched_domain::services::TaskService;
use sandsched_errors::{SchedulerError, SchedulerResult};
use sandsched_infrastructure::{InMemoryMessageQueue, MemoryRetryStore, MemoryTaskRepository};

/// 按脚本给出执行结果的沙箱替身，脚本耗尽后一律成功
struct ScriptedSandbox {
    outcomes: Mutex<VecDeque<Result<String, String>>>,
    invocations: AtomicU32,
    active: AtomicU32,
    peak_active: AtomicU32,
    run_delay: Duration,
    invocation_times: Mutex<Vec<DateTime<Utc>>>,
}

impl ScriptedSandbox {
    fn always_ok() -> Self {
        Self::with_outcomes(vec![])
    }

    fn with_outcomes(outcomes: Vec<Result<String, String>>) -> Self {
        Self {
            outcomes: Mutex::new(outcomes.into()),
            invocations: AtomicU32::new(0),
            active: AtomicU32::new(0),
            peak_active: AtomicU32::new(0),
            run_delay: Duration::ZERO,
            invocation_times: Mutex::new(Vec::new()),
        }
    }

    fn with_delay(mut self, delay: Duration) -> Self {
        self.run_delay = delay;
        self
    }

    fn invocations(&self) -> u32 {
        self.invocations.load(Ordering::SeqCst)
    }

    fn first_invocation_at(&self) -> DateTime<Utc> {
        self.invocation_times.lock().unwrap()[0]
    }
}

#[async_trait]
impl Sandbox for ScriptedSandbox {
    async fn run(
        &self,
        _image: &str,
        _command: &str,
        _args: &[String],
        _environment: &HashMap<String, String>,
    ) -> SchedulerResult<String> {
        self.invocation_times.lock().unwrap().push(Utc::now());
        self.invocations.fetch_add(1, Ordering::SeqCst);

        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_active.fetch_max(active, Ordering::SeqCst);

        if !self.run_delay.is_zero() {
            sleep(self.run_delay).await;
        }
        self.active.fetch_sub(1, Ordering::SeqCst);

        let outcome = self.outcomes.lock().unwrap().pop_front();
        match outcome {
            Some(Ok(stdout)) => Ok(stdout),
            Some(Err(message)) => Err(SchedulerError::SandboxExecution(message)),
            None => Ok("ok\n".to_string()),
        }
    }
}

struct Harness {
    scheduler: Scheduler,
    queue: Arc<InMemoryMessageQueue>,
    task_service: Arc<TaskService>,
    retry_store: Arc<MemoryRetryStore>,
    sandbox: Arc<ScriptedSandbox>,
}

impl Harness {
    async fn new(
        config: SchedulerConfig,
        sandbox: ScriptedSandbox,
        due_window: Duration,
    ) -> Self {
        let queue = Arc::new(InMemoryMessageQueue::new());
        let repository = Arc::new(MemoryTaskRepository::new());
        let retry_store = Arc::new(MemoryRetryStore::new());
        let sandbox = Arc::new(sandbox);

        let task_service = Arc::new(
            TaskService::new(
                Arc::clone(&repository) as Arc<dyn TaskRepository>,
                Arc::clone(&queue) as Arc<dyn MessageQueue>,
                due_window,
            )
            .await
            .unwrap(),
        );

        let scheduler = Scheduler::new(
            config,
            SchedulerDeps {
                queue: Arc::clone(&queue) as Arc<dyn MessageQueue>,
                task_service: Arc::clone(&task_service),
                retry_store: Arc::clone(&retry_store) as Arc<dyn RetryCountRepository>,
                sandbox: Arc::clone(&sandbox) as Arc<dyn Sandbox>,
            },
        )
        .await
        .unwrap();

        Self {
            scheduler,
            queue,
            task_service,
            retry_store,
            sandbox,
        }
    }

    /// 启动除监视器外的全部消费者
    async fn start_consumers(&self) {
        self.scheduler.consume_tasks().await.unwrap();
        self.scheduler.on_task_success().await.unwrap();
        self.scheduler.on_task_failure().await.unwrap();
        self.scheduler.on_task_retry().await.unwrap();
    }

    async fn create_task(&self, scheduled_at: DateTime<Utc>) -> Task {
        self.task_service
            .create_task(NewTask {
                user_id: Uuid::new_v4(),
                command: "date".to_string(),
                args: vec![],
                image: "alpine:3.20".to_string(),
                environment: HashMap::from([("APP_NAME".to_string(), "test".to_string())]),
                scheduled_at,
            })
            .await
            .unwrap()
    }

    async fn wait_for_status(&self, id: Uuid, status: TaskStatus) -> Task {
        timeout(Duration::from_secs(10), async {
            loop {
                if let Ok(task) = self.task_service.get_task(id).await {
                    if task.status == status {
                        return task;
                    }
                }
                sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("等待任务进入目标状态超时")
    }
}

fn test_config(max_retries: u32) -> SchedulerConfig {
    SchedulerConfig {
        max_running: 4,
        max_retries,
        max_execution_time: Duration::from_secs(30),
        update_timeout: Duration::from_secs(5),
        monitor_period: Duration::from_secs(60),
    }
}

#[tokio::test]
async fn test_completes_task_and_records_result() {
    let harness = Harness::new(
        test_config(1),
        ScriptedSandbox::always_ok(),
        Duration::from_secs(60),
    )
    .await;
    harness.start_consumers().await;

    let task = harness.create_task(Utc::now()).await;
    let finished = harness.wait_for_status(task.id, TaskStatus::Completed).await;

    assert_eq!(finished.result, "ok\n");
    assert!(finished.err_message.is_empty());
    assert_eq!(harness.sandbox.invocations(), 1);

    // 没有任何失败尝试，计数从未建立
    assert!(matches!(
        harness.retry_store.get(task.id).await,
        Err(SchedulerError::RetryCountNotFound { .. })
    ));
}

#[tokio::test]
async fn test_transient_failure_then_success() {
    let harness = Harness::new(
        test_config(1),
        ScriptedSandbox::with_outcomes(vec![
            Err("exit 1".to_string()),
            Ok("second try\n".to_string()),
        ]),
        Duration::from_secs(60),
    )
    .await;
    harness.start_consumers().await;

    let task = harness.create_task(Utc::now()).await;
    let finished = harness.wait_for_status(task.id, TaskStatus::Completed).await;

    assert_eq!(harness.sandbox.invocations(), 2);
    assert_eq!(finished.result, "second try\n");
    assert!(finished.err_message.is_empty());

    // 终态后计数被清理
    assert!(matches!(
        harness.retry_store.get(task.id).await,
        Err(SchedulerError::RetryCountNotFound { .. })
    ));
}

#[tokio::test]
async fn test_exhausted_retries_end_in_failure() {
    let harness = Harness::new(
        test_config(1),
        ScriptedSandbox::with_outcomes(vec![
            Err("command not found".to_string()),
            Err("command not found".to_string()),
            Err("command not found".to_string()),
        ]),
        Duration::from_secs(60),
    )
    .await;
    harness.start_consumers().await;

    let task = harness.create_task(Utc::now()).await;
    let finished = harness.wait_for_status(task.id, TaskStatus::Failed).await;

    // 预算 max_retries=1：首次 + 一次重试，绝不更多
    assert_eq!(harness.sandbox.invocations(), 2);
    assert!(finished.err_message.contains("command not found"));
    assert!(finished.result.is_empty());

    assert!(matches!(
        harness.retry_store.get(task.id).await,
        Err(SchedulerError::RetryCountNotFound { .. })
    ));
}

#[tokio::test]
async fn test_monitor_republishes_upcoming_task() {
    let mut config = test_config(1);
    config.monitor_period = Duration::from_millis(200);

    // 计划时刻在创建时处于窗口之外，创建路径不会入队
    let harness = Harness::new(
        config,
        ScriptedSandbox::always_ok(),
        Duration::from_millis(300),
    )
    .await;
    harness.start_consumers().await;
    harness.scheduler.monitor_scheduled_tasks().await.unwrap();

    let scheduled_at = Utc::now() + chrono::Duration::milliseconds(600);
    let task = harness.create_task(scheduled_at).await;
    assert_eq!(harness.queue.depth(QUEUE_TASKS).await, 0);

    let finished = harness.wait_for_status(task.id, TaskStatus::Completed).await;

    assert_eq!(finished.status, TaskStatus::Completed);
    // 执行不早于计划时刻（毫秒级时钟抖动除外）
    let lag = harness.sandbox.first_invocation_at() - scheduled_at;
    assert!(lag.num_milliseconds() >= -50, "执行早于计划时刻: {lag}");
}

#[tokio::test]
async fn test_executor_sleeps_until_scheduled_instant() {
    let harness = Harness::new(
        test_config(1),
        ScriptedSandbox::always_ok(),
        Duration::from_secs(60),
    )
    .await;
    harness.start_consumers().await;

    let scheduled_at = Utc::now() + chrono::Duration::milliseconds(400);
    let task = harness.create_task(scheduled_at).await;
    let finished = harness.wait_for_status(task.id, TaskStatus::Completed).await;

    let lag = harness.sandbox.first_invocation_at() - scheduled_at;
    assert!(lag.num_milliseconds() >= -50, "执行早于计划时刻: {lag}");
    assert!((finished.updated_at - finished.created_at).num_milliseconds() >= 350);
}

#[tokio::test]
async fn test_shutdown_promotes_in_flight_retry_to_failure() {
    let harness = Harness::new(
        test_config(3),
        ScriptedSandbox::with_outcomes(vec![Err("exit 1".to_string())]),
        Duration::from_secs(60),
    )
    .await;

    // 先不启动 retry 消费者，让重试消息停在队列里
    harness.scheduler.consume_tasks().await.unwrap();
    harness.scheduler.on_task_success().await.unwrap();
    harness.scheduler.on_task_failure().await.unwrap();

    let task = harness.create_task(Utc::now()).await;

    timeout(Duration::from_secs(5), async {
        while harness.queue.depth(QUEUE_RETRY).await == 0 {
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("等待重试消息入队超时");

    harness
        .scheduler
        .shutdown(Duration::from_secs(5))
        .await
        .unwrap();

    // 关闭后才开始消费 retry：消息必须被就地按失败落库
    harness.scheduler.on_task_retry().await.unwrap();
    let finished = harness.wait_for_status(task.id, TaskStatus::Failed).await;

    assert!(!finished.err_message.is_empty());
    // 关闭后 retry 消费者不得再向 tasks 投递
    assert_eq!(harness.queue.depth(QUEUE_TASKS).await, 0);
}

#[tokio::test]
async fn test_concurrency_never_exceeds_max_running() {
    let config = SchedulerConfig {
        max_running: 2,
        ..test_config(0)
    };
    let harness = Harness::new(
        config,
        ScriptedSandbox::always_ok().with_delay(Duration::from_millis(150)),
        Duration::from_secs(60),
    )
    .await;
    harness.start_consumers().await;

    let mut ids = Vec::new();
    for _ in 0..6 {
        ids.push(harness.create_task(Utc::now()).await.id);
    }
    for id in ids {
        harness.wait_for_status(id, TaskStatus::Completed).await;
    }

    assert_eq!(harness.sandbox.invocations(), 6);
    assert!(harness.sandbox.peak_active.load(Ordering::SeqCst) <= 2);
}

#[tokio::test]
async fn test_shutdown_cancels_running_executor_cleanly() {
    let harness = Harness::new(
        test_config(3),
        ScriptedSandbox::always_ok().with_delay(Duration::from_secs(30)),
        Duration::from_secs(60),
    )
    .await;
    harness.start_consumers().await;

    let task = harness.create_task(Utc::now()).await;

    timeout(Duration::from_secs(5), async {
        while harness.scheduler.running_executors().await == 0 {
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("等待执行器启动超时");

    // 宽限期远小于沙箱剩余耗时，取消必须及时生效
    let started = std::time::Instant::now();
    harness
        .scheduler
        .shutdown(Duration::from_secs(5))
        .await
        .unwrap();
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(harness.scheduler.running_executors().await, 0);

    // 被取消的尝试走 retry 通道，关闭中的 retry 消费者把它落成终态失败
    let finished = harness.wait_for_status(task.id, TaskStatus::Failed).await;
    assert!(!finished.err_message.is_empty());
    assert_eq!(harness.queue.depth(QUEUE_TASKS).await, 0);
}

#[tokio::test]
async fn test_construction_rejects_zero_max_running() {
    let queue = Arc::new(InMemoryMessageQueue::new());
    let repository = Arc::new(MemoryTaskRepository::new());
    let task_service = Arc::new(
        TaskService::new(
            Arc::clone(&repository) as Arc<dyn TaskRepository>,
            Arc::clone(&queue) as Arc<dyn MessageQueue>,
            Duration::from_secs(60),
        )
        .await
        .unwrap(),
    );

    let result = Scheduler::new(
        SchedulerConfig {
            max_running: 0,
            ..SchedulerConfig::default()
        },
        SchedulerDeps {
            queue: queue as Arc<dyn MessageQueue>,
            task_service,
            retry_store: Arc::new(MemoryRetryStore::new()),
            sandbox: Arc::new(ScriptedSandbox::always_ok()),
        },
    )
    .await;

    assert!(matches!(result, Err(SchedulerError::Configuration(_))));
}

#[tokio::test]
async fn test_malformed_message_is_dropped_and_task_recovered_by_monitor() {
    let mut config = test_config(0);
    config.monitor_period = Duration::from_millis(100);

    let harness = Harness::new(
        config,
        ScriptedSandbox::always_ok(),
        Duration::from_secs(60),
    )
    .await;

    // 一条解不开的消息先进队列
    harness.queue.publish(QUEUE_TASKS, b"{broken").await.unwrap();

    harness.start_consumers().await;
    harness.scheduler.monitor_scheduled_tasks().await.unwrap();

    let task = harness.create_task(Utc::now()).await;
    let finished = harness.wait_for_status(task.id, TaskStatus::Completed).await;
    assert_eq!(finished.status, TaskStatus::Completed);

    // 坏消息被确认丢弃，监视器的补投也都被消费，队列最终清空
    timeout(Duration::from_secs(5), async {
        while harness.queue.depth(QUEUE_TASKS).await != 0 {
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("tasks 队列未清空");
}
