use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::debug;

use crate::{
    models::{Envelope, Task},
    traits::{Broker, TaskPublisher},
    CabbageError, CabbageResult,
};

/// 任务发布器
///
/// 按任务名查找绑定的队列，调用调用方提供的序列化得到消息体，
/// 构造新的消息信封并经由消息代理入队。绑定表可以被并发的发布和调度触发安全共享。
pub struct Publisher {
    broker: Arc<dyn Broker>,
    registered_tasks: RwLock<HashMap<String, Task>>,
}

impl Publisher {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self {
            broker,
            registered_tasks: RwLock::new(HashMap::new()),
        }
    }

    /// 注册（或替换）任务绑定
    pub async fn register_task(&self, task: &Task) {
        let mut tasks = self.registered_tasks.write().await;
        tasks.insert(task.name.clone(), task.clone());
        debug!(task_name = %task.name, queue = %task.queue_name, "发布器注册任务");
    }

    pub async fn is_registered(&self, task_name: &str) -> bool {
        self.registered_tasks.read().await.contains_key(task_name)
    }

    /// 发布任务，返回已入队消息的ID
    pub async fn publish_task(
        &self,
        task_name: &str,
        payload: &dyn TaskPublisher,
    ) -> CabbageResult<String> {
        let queue_name = {
            let tasks = self.registered_tasks.read().await;
            tasks
                .get(task_name)
                .map(|task| task.queue_name.clone())
                .ok_or_else(|| CabbageError::MissingTask {
                    name: task_name.to_string(),
                })?
        };

        let body = payload.to_publish()?;
        let envelope = Envelope::new(task_name, body);
        self.broker.enqueue(&queue_name, &envelope).await?;

        debug!(
            task_name,
            queue = %queue_name,
            message_id = %envelope.id,
            "任务已发布"
        );
        Ok(envelope.id)
    }
}
