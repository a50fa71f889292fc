use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
        ConfirmSelectOptions, QueueDeclareOptions,
    },
    types::FieldTable,
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info};

use sandsched_domain::messaging::{MessageAck, MessageDelivery, MessageQueue};
use sandsched_errors::{SchedulerError, SchedulerResult};

/// RabbitMQ消息队列实现
///
/// 队列持久化、消息持久化、发布确认；消费端 prefetch=1，
/// 投递必须显式 ack，未确认的消息由代理重投。
pub struct RabbitMqMessageQueue {
    connection: Connection,
    channel: Arc<Mutex<Channel>>,
}

impl RabbitMqMessageQueue {
    /// 连接 RabbitMQ 并打开通道
    pub async fn connect(url: &str) -> SchedulerResult<Self> {
        let connection = Connection::connect(url, ConnectionProperties::default())
            .await
            .map_err(|e| SchedulerError::MessageQueue(format!("连接RabbitMQ失败: {e}")))?;

        let channel = connection
            .create_channel()
            .await
            .map_err(|e| SchedulerError::MessageQueue(format!("创建通道失败: {e}")))?;

        // 打开发布确认，publish 返回即代表代理已持久化
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| SchedulerError::MessageQueue(format!("开启发布确认失败: {e}")))?;

        info!("成功连接到RabbitMQ: {}", url);

        Ok(Self {
            connection,
            channel: Arc::new(Mutex::new(channel)),
        })
    }

    pub fn is_connected(&self) -> bool {
        self.connection.status().connected()
    }

    pub async fn close(&self) -> SchedulerResult<()> {
        self.connection
            .close(200, "正常关闭")
            .await
            .map_err(|e| SchedulerError::MessageQueue(format!("关闭连接失败: {e}")))?;

        info!("RabbitMQ连接已关闭");
        Ok(())
    }
}

#[async_trait]
impl MessageQueue for RabbitMqMessageQueue {
    async fn declare_queue(&self, queue: &str) -> SchedulerResult<()> {
        let channel = self.channel.lock().await;
        channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: true,
                    exclusive: false,
                    auto_delete: false,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| SchedulerError::MessageQueue(format!("声明队列 {queue} 失败: {e}")))?;

        debug!("队列 {} 声明成功", queue);
        Ok(())
    }

    async fn publish(&self, queue: &str, payload: &[u8]) -> SchedulerResult<()> {
        let channel = self.channel.lock().await;

        let confirm = channel
            .basic_publish(
                "",
                queue,
                BasicPublishOptions::default(),
                payload,
                BasicProperties::default().with_delivery_mode(2), // 2 = persistent
            )
            .await
            .map_err(|e| {
                SchedulerError::MessageQueue(format!("发布消息到队列 {queue} 失败: {e}"))
            })?;

        confirm
            .await
            .map_err(|e| SchedulerError::MessageQueue(format!("消息发布确认失败: {e}")))?;

        debug!("消息已发布到队列: {}", queue);
        Ok(())
    }

    async fn consume(&self, queue: &str) -> SchedulerResult<mpsc::Receiver<MessageDelivery>> {
        let channel = self.channel.lock().await;

        // 每次只预取一条，背压由未确认消息数量约束
        channel
            .basic_qos(1, BasicQosOptions::default())
            .await
            .map_err(|e| SchedulerError::MessageQueue(format!("设置qos失败: {e}")))?;

        let mut consumer = channel
            .basic_consume(
                queue,
                &format!("sandsched-{queue}"),
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| {
                SchedulerError::MessageQueue(format!("为队列 {queue} 创建消费者失败: {e}"))
            })?;

        let (tx, rx) = mpsc::channel(1);
        let queue_name = queue.to_string();

        tokio::spawn(async move {
            while let Some(delivery) = consumer.next().await {
                let delivery = match delivery {
                    Ok(delivery) => delivery,
                    Err(e) => {
                        error!("队列 {} 的消费者流出错: {e}", queue_name);
                        continue;
                    }
                };

                let body = delivery.data.clone();
                let acker = Box::new(LapinAck {
                    acker: delivery.acker,
                });

                if tx.send(MessageDelivery::new(body, acker)).await.is_err() {
                    // 接收端已关闭，停止转发
                    debug!("队列 {} 的投递通道已关闭", queue_name);
                    break;
                }
            }
        });

        Ok(rx)
    }
}

struct LapinAck {
    acker: lapin::acker::Acker,
}

#[async_trait]
impl MessageAck for LapinAck {
    async fn ack(self: Box<Self>) -> SchedulerResult<()> {
        self.acker
            .ack(BasicAckOptions::default())
            .await
            .map_err(|e| SchedulerError::MessageQueue(format!("确认消息失败: {e}")))
    }
}
