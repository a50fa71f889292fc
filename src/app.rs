use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use tracing::info;

use sandsched_config::AppConfig;
use sandsched_core::{Scheduler, SchedulerConfig, SchedulerDeps};
use sandsched_domain::services::TaskService;
use sandsched_infrastructure::{
    DockerSandbox, PostgresTaskRepository, RabbitMqMessageQueue, RedisRetryStore,
};

/// 主应用程序：构建外部协作方并驱动调度核心
pub struct Application {
    scheduler: Scheduler,
    shutdown_grace: Duration,
}

impl Application {
    /// 按配置组装数据库连接池、消息代理、重试存储和调度器
    pub async fn new(config: AppConfig) -> Result<Self> {
        info!("初始化应用程序");

        let pool = PgPoolOptions::new()
            .max_connections(config.database.max_connections)
            .min_connections(config.database.min_connections)
            .acquire_timeout(Duration::from_secs(
                config.database.connection_timeout_seconds,
            ))
            .connect(&config.database.url)
            .await
            .context("连接数据库失败")?;

        let queue = Arc::new(
            tokio::time::timeout(
                Duration::from_secs(config.message_queue.connection_timeout_seconds),
                RabbitMqMessageQueue::connect(&config.message_queue.url),
            )
            .await
            .context("连接消息代理超时")?
            .context("连接消息代理失败")?,
        );

        let retry_store = Arc::new(
            RedisRetryStore::connect(&config.redis.url)
                .await
                .context("连接Redis失败")?,
        );

        let task_repository = Arc::new(PostgresTaskRepository::new(pool));
        let task_service = Arc::new(
            TaskService::new(
                task_repository,
                Arc::clone(&queue) as Arc<dyn sandsched_domain::messaging::MessageQueue>,
                Duration::from_secs(config.scheduler.due_window_seconds),
            )
            .await
            .context("创建任务服务失败")?,
        );

        let scheduler_config = SchedulerConfig {
            max_running: config.scheduler.max_running,
            max_retries: config.scheduler.max_retries,
            max_execution_time: Duration::from_secs(config.scheduler.max_execution_time_seconds),
            update_timeout: Duration::from_secs(config.scheduler.update_timeout_seconds),
            monitor_period: Duration::from_secs(config.scheduler.monitor_period_seconds),
        };

        let scheduler = Scheduler::new(
            scheduler_config,
            SchedulerDeps {
                queue,
                task_service,
                retry_store,
                sandbox: Arc::new(DockerSandbox::new()),
            },
        )
        .await
        .context("创建调度器失败")?;

        Ok(Self {
            scheduler,
            shutdown_grace: Duration::from_secs(config.scheduler.shutdown_grace_seconds),
        })
    }

    /// 启动四个消费者和监视器
    pub async fn start(&self) -> Result<()> {
        self.scheduler.consume_tasks().await?;
        self.scheduler.on_task_success().await?;
        self.scheduler.on_task_failure().await?;
        self.scheduler.on_task_retry().await?;
        self.scheduler.monitor_scheduled_tasks().await?;

        info!("调度器已启动");
        Ok(())
    }

    /// 在宽限期内优雅关闭调度器
    pub async fn shutdown(&self) -> Result<()> {
        self.scheduler
            .shutdown(self.shutdown_grace)
            .await
            .context("优雅关闭失败")
    }
}
