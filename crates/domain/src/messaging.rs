use async_trait::async_trait;
use tokio::sync::mpsc;

use sandsched_errors::SchedulerResult;

/// 队列名是对外契约的一部分
pub const QUEUE_TASKS: &str = "tasks";
pub const QUEUE_SUCCESS: &str = "success";
pub const QUEUE_FAILED: &str = "failed";
pub const QUEUE_RETRY: &str = "retry";

/// 单条投递的确认句柄
#[async_trait]
pub trait MessageAck: Send {
    async fn ack(self: Box<Self>) -> SchedulerResult<()>;
}

/// 从队列收到的一条投递
///
/// 消费者必须显式 ack；未确认的投递由代理按至少一次语义重投。
pub struct MessageDelivery {
    body: Vec<u8>,
    acker: Box<dyn MessageAck>,
}

impl MessageDelivery {
    pub fn new(body: Vec<u8>, acker: Box<dyn MessageAck>) -> Self {
        Self { body, acker }
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// 确认投递并取回消息体
    pub async fn ack(self) -> SchedulerResult<Vec<u8>> {
        self.acker.ack().await?;
        Ok(self.body)
    }
}

impl std::fmt::Debug for MessageDelivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageDelivery")
            .field("body_len", &self.body.len())
            .finish()
    }
}

/// 消息队列抽象接口
///
/// 每个队列同一时刻只允许一个消费者循环；consume 返回的通道容量为1，
/// 对应代理侧 prefetch=1 的约束。
#[async_trait]
pub trait MessageQueue: Send + Sync {
    /// 声明队列，幂等
    async fn declare_queue(&self, queue: &str) -> SchedulerResult<()>;

    /// 发布消息，返回时消息已被代理持久化
    async fn publish(&self, queue: &str, payload: &[u8]) -> SchedulerResult<()>;

    /// 订阅队列，返回投递通道
    async fn consume(&self, queue: &str) -> SchedulerResult<mpsc::Receiver<MessageDelivery>>;
}
