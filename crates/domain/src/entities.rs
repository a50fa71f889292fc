use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use sandsched_errors::SchedulerError;

/// 任务状态
///
/// 终态（completed/failed）只由 success/failed 消费者写入，写入后不再变化。
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TaskStatus::Pending)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        };
        f.write_str(name)
    }
}

impl FromStr for TaskStatus {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(TaskStatus::Pending),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            other => Err(SchedulerError::validation_error(format!(
                "无效的任务状态: {other:?}"
            ))),
        }
    }
}

/// 任务实体
///
/// 不变量: 终态时 result 与 err_message 恰好一个非空；pending 时两者皆空。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub id: Uuid,
    pub user_id: Uuid,
    pub command: String,
    pub args: Vec<String>,
    pub image: String,
    #[serde(default)]
    pub environment: HashMap<String, String>,
    pub status: TaskStatus,
    #[serde(default)]
    pub result: String,
    #[serde(default)]
    pub err_message: String,
    pub scheduled_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// 创建任务所需的输入
#[derive(Debug, Clone)]
pub struct NewTask {
    pub user_id: Uuid,
    pub command: String,
    pub args: Vec<String>,
    pub image: String,
    pub environment: HashMap<String, String>,
    pub scheduled_at: DateTime<Utc>,
}

/// 任务的可更新字段，None 表示保持原值
#[derive(Debug, Clone, Default)]
pub struct TaskUpdate {
    pub status: Option<TaskStatus>,
    pub result: Option<String>,
    pub err_message: Option<String>,
}

/// 四个队列共用的消息信封，负载是任务快照。
///
/// 反序列化忽略未知字段，允许向前兼容的扩展。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskMessage {
    pub id: String,
    pub task: Task,
    pub timestamp: DateTime<Utc>,
}

impl TaskMessage {
    pub fn new(task: Task) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            task,
            timestamp: Utc::now(),
        }
    }

    pub fn serialize_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn deserialize_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}
