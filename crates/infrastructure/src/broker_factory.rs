use std::sync::Arc;

use cabbage_core::{
    config::{BrokerConfig, BrokerType},
    traits::Broker,
    CabbageError, CabbageResult,
};
use tracing::{debug, info};

use crate::{InMemoryBroker, RabbitMqBroker, RedisBroker};

pub struct BrokerFactory;

impl BrokerFactory {
    /// 按配置创建消息代理，连接失败直接返回错误
    pub async fn create(config: &BrokerConfig) -> CabbageResult<Arc<dyn Broker>> {
        debug!("Creating broker with type: {:?}", config.r#type);

        config
            .validate()
            .map_err(|e| CabbageError::Configuration(format!("{e:#}")))?;

        match config.r#type {
            BrokerType::Rabbitmq => {
                info!("Initializing RabbitMQ broker");
                Ok(Arc::new(RabbitMqBroker::new(config).await?))
            }
            BrokerType::Redis => {
                info!("Initializing Redis broker");
                Ok(Arc::new(RedisBroker::new(config).await?))
            }
            BrokerType::Memory => {
                info!("Initializing in-memory broker");
                Ok(Arc::new(InMemoryBroker::new()))
            }
        }
    }
}
