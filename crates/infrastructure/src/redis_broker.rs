use async_trait::async_trait;
use cabbage_core::{
    config::BrokerConfig, models::Envelope, traits::Broker, CabbageError, CabbageResult,
};
use redis::{
    aio::{ConnectionManager, ConnectionManagerConfig},
    AsyncCommands, Client,
};
use tokio::sync::Mutex;
use tracing::{debug, info};

const MAX_RETRY_DELAY_MS: u64 = 1_000;

/// 基于Redis列表的消息代理
///
/// 入队使用 `LPUSH`，出队使用 `LPOP`，同一队列表现为栈（后进先出）。
/// 元素是消息信封的JSON文本，与其它语言的生产者/消费者互通。
pub struct RedisBroker {
    connection: Mutex<Option<ConnectionManager>>,
}

impl RedisBroker {
    /// 连接Redis并通过PING验证连接，失败即返回错误
    ///
    /// 重试次数和单次连接超时来自配置，不可达的服务器会在有限时间内报错。
    pub async fn new(config: &BrokerConfig) -> CabbageResult<Self> {
        let client = Client::open(config.url.as_str())
            .map_err(|e| CabbageError::Broker(format!("创建Redis客户端失败: {e}")))?;

        let manager_config = ConnectionManagerConfig::new()
            .set_number_of_retries(config.connect_retries)
            .set_max_delay(MAX_RETRY_DELAY_MS)
            .set_connection_timeout(config.connect_timeout())
            .set_response_timeout(config.connect_timeout());

        debug!(
            retries = config.connect_retries,
            timeout_ms = config.connect_timeout_ms,
            "连接Redis"
        );
        let mut manager = ConnectionManager::new_with_config(client, manager_config)
            .await
            .map_err(|e| CabbageError::Broker(format!("连接Redis失败: {e}")))?;

        let response: String = redis::cmd("PING")
            .query_async(&mut manager)
            .await
            .map_err(|e| CabbageError::Broker(format!("Redis PING失败: {e}")))?;
        if response != "PONG" {
            return Err(CabbageError::Broker(format!(
                "Redis PING返回异常: {response}"
            )));
        }

        info!("成功连接到Redis");
        Ok(Self {
            connection: Mutex::new(Some(manager)),
        })
    }

    /// 使用默认的重试和超时设置连接
    pub async fn connect(url: &str) -> CabbageResult<Self> {
        Self::new(&BrokerConfig::redis(url)).await
    }

    async fn connection(&self) -> CabbageResult<ConnectionManager> {
        self.connection
            .lock()
            .await
            .clone()
            .ok_or_else(|| CabbageError::Broker("Redis连接已关闭".to_string()))
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn enqueue(&self, queue: &str, envelope: &Envelope) -> CabbageResult<()> {
        let payload = envelope.to_json()?;
        let mut conn = self.connection().await?;

        let _: () = conn
            .lpush(queue, payload)
            .await
            .map_err(|e| CabbageError::Broker(format!("LPUSH到队列 {queue} 失败: {e}")))?;

        debug!(queue, message_id = %envelope.id, "消息已推入Redis列表");
        Ok(())
    }

    async fn dequeue(&self, queue: &str) -> CabbageResult<Option<Envelope>> {
        let mut conn = self.connection().await?;

        let item: Option<String> = conn
            .lpop(queue, None)
            .await
            .map_err(|e| CabbageError::Broker(format!("从队列 {queue} LPOP失败: {e}")))?;

        match item {
            Some(json) => Ok(Some(Envelope::from_json(&json)?)),
            None => Ok(None),
        }
    }

    async fn activate_queue(&self, _queue: &str) -> CabbageResult<()> {
        Ok(())
    }

    async fn close(&self) -> CabbageResult<()> {
        if self.connection.lock().await.take().is_some() {
            info!("Redis连接已关闭");
        }
        Ok(())
    }
}
