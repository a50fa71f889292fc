use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, info};

use sandsched_domain::messaging::{MessageAck, MessageDelivery, MessageQueue};
use sandsched_errors::{SchedulerError, SchedulerResult};

/// 内存消息队列实现
///
/// 基于 Tokio channel，用于嵌入式部署和测试。深度计数在 ack 时才减一，
/// 这样测试能观察到"已发布未确认"的消息。每个队列只允许取一次消费端。
pub struct InMemoryMessageQueue {
    queues: RwLock<HashMap<String, QueueChannels>>,
}

struct QueueChannels {
    sender: mpsc::UnboundedSender<Vec<u8>>,
    receiver: Arc<Mutex<Option<mpsc::UnboundedReceiver<Vec<u8>>>>>,
    depth: Arc<AtomicU32>,
}

impl InMemoryMessageQueue {
    pub fn new() -> Self {
        Self {
            queues: RwLock::new(HashMap::new()),
        }
    }

    async fn ensure_queue(&self, queue: &str) {
        let mut queues = self.queues.write().await;
        if !queues.contains_key(queue) {
            let (sender, receiver) = mpsc::unbounded_channel();
            queues.insert(
                queue.to_string(),
                QueueChannels {
                    sender,
                    receiver: Arc::new(Mutex::new(Some(receiver))),
                    depth: Arc::new(AtomicU32::new(0)),
                },
            );
            info!("创建内存队列: {}", queue);
        }
    }

    /// 已发布未确认的消息数
    pub async fn depth(&self, queue: &str) -> u32 {
        let queues = self.queues.read().await;
        queues
            .get(queue)
            .map(|q| q.depth.load(Ordering::Relaxed))
            .unwrap_or(0)
    }
}

impl Default for InMemoryMessageQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageQueue for InMemoryMessageQueue {
    async fn declare_queue(&self, queue: &str) -> SchedulerResult<()> {
        self.ensure_queue(queue).await;
        Ok(())
    }

    async fn publish(&self, queue: &str, payload: &[u8]) -> SchedulerResult<()> {
        self.ensure_queue(queue).await;

        let (sender, depth) = {
            let queues = self.queues.read().await;
            queues
                .get(queue)
                .map(|channels| (channels.sender.clone(), Arc::clone(&channels.depth)))
                .ok_or_else(|| {
                    SchedulerError::MessageQueue(format!("队列 {queue} 不存在"))
                })?
        };

        sender.send(payload.to_vec()).map_err(|e| {
            SchedulerError::MessageQueue(format!("向队列 {queue} 发送消息失败: {e}"))
        })?;
        depth.fetch_add(1, Ordering::Relaxed);

        debug!("消息已发布到内存队列: {}", queue);
        Ok(())
    }

    async fn consume(&self, queue: &str) -> SchedulerResult<mpsc::Receiver<MessageDelivery>> {
        self.ensure_queue(queue).await;

        let (receiver_slot, depth) = {
            let queues = self.queues.read().await;
            queues
                .get(queue)
                .map(|channels| (Arc::clone(&channels.receiver), Arc::clone(&channels.depth)))
                .ok_or_else(|| {
                    SchedulerError::MessageQueue(format!("队列 {queue} 不存在"))
                })?
        };

        let mut inner = receiver_slot.lock().await.take().ok_or_else(|| {
            SchedulerError::MessageQueue(format!("队列 {queue} 已经有消费者"))
        })?;

        // 容量1的转发通道，对应代理侧 prefetch=1
        let (tx, rx) = mpsc::channel(1);

        tokio::spawn(async move {
            while let Some(body) = inner.recv().await {
                let acker = Box::new(InMemoryAck {
                    depth: Arc::clone(&depth),
                });
                if tx.send(MessageDelivery::new(body, acker)).await.is_err() {
                    break;
                }
            }
        });

        Ok(rx)
    }
}

struct InMemoryAck {
    depth: Arc<AtomicU32>,
}

#[async_trait]
impl MessageAck for InMemoryAck {
    async fn ack(self: Box<Self>) -> SchedulerResult<()> {
        self.depth.fetch_sub(1, Ordering::Relaxed);
        Ok(())
    }
}
