use std::collections::HashMap;

use async_trait::async_trait;
use cabbage_core::{
    config::{AckMode, BrokerConfig},
    models::Envelope,
    traits::{Broker, Settlement},
    CabbageError, CabbageResult,
};
use chrono::{DateTime, Utc};
use futures::{FutureExt, StreamExt};
use lapin::{
    options::*,
    types::{AMQPValue, FieldTable, LongString},
    BasicProperties, Channel, Connection, ConnectionProperties, Consumer, ExchangeKind,
};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

const HEADER_ID: &str = "id";
const HEADER_TASK_NAME: &str = "taskName";
const EMPTY_MESSAGE_ID: &str = "<EMPTY>";

/// RabbitMQ消息代理实现
///
/// 每个队列对应一个同名持久化队列和一个直连交换机 `<queue>_cabbage_exchange`，
/// 路由键就是队列名。消费者在 `activate_queue` 时创建，`dequeue` 只做非阻塞读取。
pub struct RabbitMqBroker {
    connection: Connection,
    channel: Channel,
    consumers: Mutex<HashMap<String, Consumer>>,
    ack_mode: AckMode,
    ack_retry_attempts: u32,
}

impl RabbitMqBroker {
    /// 连接RabbitMQ并设置通道预取数量
    pub async fn new(config: &BrokerConfig) -> CabbageResult<Self> {
        let connection = Connection::connect(&config.url, ConnectionProperties::default())
            .await
            .map_err(|e| CabbageError::Broker(format!("连接RabbitMQ失败: {e}")))?;

        let channel = connection
            .create_channel()
            .await
            .map_err(|e| CabbageError::Broker(format!("创建通道失败: {e}")))?;

        channel
            .basic_qos(config.prefetch, BasicQosOptions::default())
            .await
            .map_err(|e| CabbageError::Broker(format!("设置通道预取数量失败: {e}")))?;

        info!(prefetch = config.prefetch, "成功连接到RabbitMQ");

        Ok(Self {
            connection,
            channel,
            consumers: Mutex::new(HashMap::new()),
            ack_mode: config.ack_mode,
            ack_retry_attempts: config.ack_retry_attempts.max(1),
        })
    }

    /// 声明交换机、队列并完成绑定，重复调用是安全的
    async fn declare_queue(&self, queue: &str) -> CabbageResult<()> {
        let exchange = exchange_name(queue);

        self.channel
            .exchange_declare(
                exchange.as_str().into(),
                ExchangeKind::Direct,
                ExchangeDeclareOptions {
                    durable: true,
                    auto_delete: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| CabbageError::Broker(format!("声明交换机 {exchange} 失败: {e}")))?;

        self.channel
            .queue_declare(
                queue.into(),
                QueueDeclareOptions {
                    durable: true,
                    exclusive: false,
                    auto_delete: false,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| CabbageError::Broker(format!("声明队列 {queue} 失败: {e}")))?;

        self.channel
            .queue_bind(
                queue.into(),
                exchange.as_str().into(),
                queue.into(),
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| CabbageError::Broker(format!("绑定队列 {queue} 失败: {e}")))?;

        debug!(queue, exchange = %exchange, "队列声明成功");
        Ok(())
    }

    async fn ack_with_retry(&self, queue: &str, delivery_tag: u64) {
        let mut last_error = None;
        for _ in 0..self.ack_retry_attempts {
            match self
                .channel
                .basic_ack(delivery_tag, BasicAckOptions::default())
                .await
            {
                Ok(()) => return,
                Err(e) => last_error = Some(e),
            }
        }
        if let Some(e) = last_error {
            error!(queue, delivery_tag, error = %e, "确认消息失败");
        }
    }

    async fn nack_with_retry(&self, queue: &str, delivery_tag: u64, requeue: bool) {
        let mut last_error = None;
        for _ in 0..self.ack_retry_attempts {
            match self
                .channel
                .basic_nack(
                    delivery_tag,
                    BasicNackOptions {
                        multiple: false,
                        requeue,
                    },
                )
                .await
            {
                Ok(()) => return,
                Err(e) => last_error = Some(e),
            }
        }
        if let Some(e) = last_error {
            error!(queue, delivery_tag, requeue, error = %e, "拒绝消息失败");
        }
    }

    /// 获取连接状态
    pub fn is_connected(&self) -> bool {
        self.connection.status().connected()
    }
}

#[async_trait]
impl Broker for RabbitMqBroker {
    async fn enqueue(&self, queue: &str, envelope: &Envelope) -> CabbageResult<()> {
        self.declare_queue(queue).await?;

        let exchange = exchange_name(queue);
        let confirm = self
            .channel
            .basic_publish(
                exchange.as_str().into(),
                queue.into(),
                BasicPublishOptions::default(),
                &envelope.body,
                publish_properties(envelope),
            )
            .await
            .map_err(|e| CabbageError::Broker(format!("发布消息到队列 {queue} 失败: {e}")))?;

        confirm
            .await
            .map_err(|e| CabbageError::Broker(format!("消息发布确认失败: {e}")))?;

        debug!(queue, message_id = %envelope.id, "消息已发布");
        Ok(())
    }

    async fn dequeue(&self, queue: &str) -> CabbageResult<Option<Envelope>> {
        let polled = {
            let mut consumers = self.consumers.lock().await;
            let consumer = consumers.get_mut(queue).ok_or_else(|| {
                CabbageError::Broker(format!("队列 {queue} 尚未激活消费者"))
            })?;
            consumer.next().now_or_never()
        };

        let delivery = match polled {
            None => return Ok(None),
            Some(None) => {
                return Err(CabbageError::Broker(format!("队列 {queue} 的消费者已关闭")));
            }
            Some(Some(Err(e))) => {
                return Err(CabbageError::Broker(format!("从队列 {queue} 接收消息失败: {e}")));
            }
            Some(Some(Ok(delivery))) => delivery,
        };

        let delivery_tag = delivery.delivery_tag;
        let envelope = match envelope_from_delivery(&delivery.data, &delivery.properties) {
            Ok(envelope) => envelope.with_receipt(delivery_tag),
            Err(e) => {
                warn!(queue, delivery_tag, error = %e, "丢弃无法解析的消息");
                self.nack_with_retry(queue, delivery_tag, false).await;
                return Err(e);
            }
        };

        if self.ack_mode == AckMode::BeforeProcess {
            self.ack_with_retry(queue, delivery_tag).await;
        }

        Ok(Some(envelope))
    }

    async fn activate_queue(&self, queue: &str) -> CabbageResult<()> {
        self.declare_queue(queue).await?;

        let mut consumers = self.consumers.lock().await;
        if consumers.contains_key(queue) {
            return Ok(());
        }

        let consumer = self
            .channel
            .basic_consume(
                queue.into(),
                "".into(),
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| CabbageError::Broker(format!("创建消费者失败: {e}")))?;

        consumers.insert(queue.to_string(), consumer);
        info!(queue, "队列消费者已启动");
        Ok(())
    }

    async fn settle(
        &self,
        queue: &str,
        envelope: &Envelope,
        settlement: Settlement,
    ) -> CabbageResult<()> {
        if self.ack_mode != AckMode::AfterProcess {
            return Ok(());
        }
        let Some(delivery_tag) = envelope.receipt else {
            return Ok(());
        };

        match settlement {
            Settlement::Processed => self.ack_with_retry(queue, delivery_tag).await,
            Settlement::Failed => self.nack_with_retry(queue, delivery_tag, true).await,
            Settlement::Unroutable => self.nack_with_retry(queue, delivery_tag, false).await,
        }
        Ok(())
    }

    async fn close(&self) -> CabbageResult<()> {
        self.consumers.lock().await.clear();

        if let Err(e) = self.channel.close(200, "正常关闭".into()).await {
            warn!(error = %e, "关闭通道失败");
        }

        self.connection
            .close(200, "正常关闭".into())
            .await
            .map_err(|e| CabbageError::Broker(format!("关闭连接失败: {e}")))?;

        info!("RabbitMQ连接已关闭");
        Ok(())
    }
}

pub fn exchange_name(queue: &str) -> String {
    format!("{queue}_cabbage_exchange")
}

fn publish_properties(envelope: &Envelope) -> BasicProperties {
    let timestamp = u64::try_from(envelope.timestamp.timestamp()).unwrap_or_default();
    BasicProperties::default()
        .with_delivery_mode(2)
        .with_content_type("application/json".into())
        .with_message_id(envelope.message_id.as_str().into())
        .with_timestamp(timestamp)
        .with_headers(build_headers(envelope))
}

fn build_headers(envelope: &Envelope) -> FieldTable {
    let mut headers = FieldTable::default();
    headers.insert(
        HEADER_ID.into(),
        AMQPValue::LongString(LongString::from(envelope.id.clone())),
    );
    headers.insert(
        HEADER_TASK_NAME.into(),
        AMQPValue::LongString(LongString::from(envelope.task_name.clone())),
    );
    headers
}

fn header_string(headers: &FieldTable, key: &str) -> Option<String> {
    headers
        .inner()
        .iter()
        .find(|(name, _)| name.as_str() == key)
        .and_then(|(_, value)| match value {
            AMQPValue::LongString(s) => Some(String::from_utf8_lossy(s.as_bytes()).into_owned()),
            AMQPValue::ShortString(s) => Some(s.as_str().to_string()),
            _ => None,
        })
}

/// 由一次AMQP投递还原消息信封，消息体原样保留
fn envelope_from_delivery(data: &[u8], properties: &BasicProperties) -> CabbageResult<Envelope> {
    let headers = properties
        .headers()
        .as_ref()
        .ok_or_else(|| CabbageError::Serialization("消息缺少头部".to_string()))?;

    let id = header_string(headers, HEADER_ID)
        .ok_or_else(|| CabbageError::Serialization(format!("消息头缺少 {HEADER_ID}")))?;
    let task_name = header_string(headers, HEADER_TASK_NAME)
        .ok_or_else(|| CabbageError::Serialization(format!("消息头缺少 {HEADER_TASK_NAME}")))?;

    let message_id = properties
        .message_id()
        .as_ref()
        .map(|id| id.as_str().to_string())
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| EMPTY_MESSAGE_ID.to_string());

    let timestamp = (*properties.timestamp())
        .and_then(|secs| i64::try_from(secs).ok())
        .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0))
        .unwrap_or_else(Utc::now);

    Ok(Envelope {
        id,
        message_id,
        body: data.to_vec(),
        task_name,
        timestamp,
        receipt: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exchange_name() {
        assert_eq!(exchange_name("reports"), "reports_cabbage_exchange");
    }

    #[test]
    fn test_properties_round_trip() {
        let envelope = Envelope::new("send_email", b"{\"to\":\"a\"}".to_vec());
        let properties = publish_properties(&envelope);

        assert_eq!(*properties.delivery_mode(), Some(2));
        assert_eq!(
            properties.content_type().as_ref().map(|c| c.as_str()),
            Some("application/json")
        );

        let decoded = envelope_from_delivery(&envelope.body, &properties).unwrap();
        assert_eq!(decoded.id, envelope.id);
        assert_eq!(decoded.message_id, envelope.message_id);
        assert_eq!(decoded.task_name, "send_email");
        assert_eq!(decoded.body, envelope.body);
        assert_eq!(decoded.timestamp.timestamp(), envelope.timestamp.timestamp());
    }

    #[test]
    fn test_missing_message_id_is_placeholder() {
        let envelope = Envelope::new("t", vec![]);
        let properties = BasicProperties::default().with_headers(build_headers(&envelope));

        let decoded = envelope_from_delivery(&[], &properties).unwrap();
        assert_eq!(decoded.message_id, "<EMPTY>");
    }

    #[test]
    fn test_missing_headers_rejected() {
        let result = envelope_from_delivery(b"x", &BasicProperties::default());
        assert!(matches!(result, Err(CabbageError::Serialization(_))));

        let mut headers = FieldTable::default();
        headers.insert(
            HEADER_ID.into(),
            AMQPValue::LongString(LongString::from("abc".to_string())),
        );
        let properties = BasicProperties::default().with_headers(headers);
        assert!(envelope_from_delivery(b"x", &properties).is_err());
    }
}
