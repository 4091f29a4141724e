//! # cabbage
//!
//! 任务分发库：应用代码注册具名任务，把任务消息发布到由可插拔消息代理承载的具名队列，
//! 由Worker池拉取消息并分发给注册的处理器；调度器按CRON时间网格周期性地发布任务。
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use async_trait::async_trait;
//! use cabbage::{CabbageResult, Client, InMemoryBroker, Task, TaskProcessor};
//!
//! struct SendEmail;
//!
//! #[async_trait]
//! impl TaskProcessor for SendEmail {
//!     async fn process(&self, body: &[u8], id: &str) -> CabbageResult<()> {
//!         println!("{id}: {}", String::from_utf8_lossy(body));
//!         Ok(())
//!     }
//! }
//!
//! # async fn run() -> CabbageResult<()> {
//! let client = Client::new(Arc::new(InMemoryBroker::new()));
//! let pool = client.create_worker_pool("emails", 4).await?;
//! let publisher = client.create_publisher().await;
//!
//! client
//!     .register_task(Task::new("send_email", "emails", Some(Arc::new(SendEmail)), true)?)
//!     .await?;
//! pool.start().await?;
//!
//! publisher.publish_task("send_email", &"hello".to_string()).await?;
//! client.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod client;

pub use client::Client;

pub use cabbage_core::{
    config::{
        AckMode, BrokerConfig, BrokerType, CabbageConfig, LoggingConfig, SchedulerConfig,
        WorkerConfig,
    },
    logging::{init_logging, init_logging_from_config},
    Broker, CabbageError, CabbageResult, Envelope, JsonPayload, Publisher, Settlement, Task,
    TaskProcessor, TaskPublisher, TaskRoutes,
};
pub use cabbage_dispatcher::{
    CronSchedule, Entry, Job, PayloadGenerator, ScheduleTask, Scheduler, Tick,
};
pub use cabbage_infrastructure::{BrokerFactory, InMemoryBroker, RabbitMqBroker, RedisBroker};
pub use cabbage_worker::{PoolStats, WorkerPool};
pub use tokio_util::sync::CancellationToken;
