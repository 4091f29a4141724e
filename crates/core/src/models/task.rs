use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::{traits::TaskProcessor, CabbageError, CabbageResult};

/// 任务名到处理器的路由表
pub type TaskRoutes = HashMap<String, Arc<dyn TaskProcessor>>;

/// 绑定到队列的具名任务
///
/// 带处理器的任务会被装入对应队列Worker池的路由表；
/// `with_publish` 为真时任务会注册到发布器，允许通过任务名发布消息。
#[derive(Clone)]
pub struct Task {
    pub name: String,
    pub queue_name: String,
    pub processor: Option<Arc<dyn TaskProcessor>>,
    pub with_publish: bool,
}

impl Task {
    pub fn new(
        name: impl Into<String>,
        queue_name: impl Into<String>,
        processor: Option<Arc<dyn TaskProcessor>>,
        with_publish: bool,
    ) -> CabbageResult<Self> {
        let name = name.into();
        let queue_name = queue_name.into();
        if name.is_empty() {
            return Err(CabbageError::EmptyTaskName);
        }
        if queue_name.is_empty() {
            return Err(CabbageError::EmptyQueueName);
        }
        Ok(Self {
            name,
            queue_name,
            processor,
            with_publish,
        })
    }

    /// 只用于消费的任务
    pub fn handler(
        name: impl Into<String>,
        queue_name: impl Into<String>,
        processor: Arc<dyn TaskProcessor>,
    ) -> CabbageResult<Self> {
        Self::new(name, queue_name, Some(processor), false)
    }

    /// 只用于发布的任务
    pub fn publishable(name: impl Into<String>, queue_name: impl Into<String>) -> CabbageResult<Self> {
        Self::new(name, queue_name, None, true)
    }

    pub fn has_processor(&self) -> bool {
        self.processor.is_some()
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.name)
            .field("queue_name", &self.queue_name)
            .field("has_processor", &self.processor.is_some())
            .field("with_publish", &self.with_publish)
            .finish()
    }
}
