use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use cabbage_core::{models::Envelope, traits::Broker, CabbageError, CabbageResult};
use tokio::sync::RwLock;
use tracing::debug;

/// 内存消息代理实现
///
/// 每个队列是一个先进先出的 `VecDeque`，适用于测试和单进程嵌入式场景。
#[derive(Debug, Default)]
pub struct InMemoryBroker {
    queues: RwLock<HashMap<String, VecDeque<Envelope>>>,
    active_queues: RwLock<HashSet<String>>,
    closed: AtomicBool,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// 获取队列中的消息数量
    pub async fn queue_len(&self, queue: &str) -> usize {
        self.queues
            .read()
            .await
            .get(queue)
            .map(VecDeque::len)
            .unwrap_or(0)
    }

    pub async fn is_active(&self, queue: &str) -> bool {
        self.active_queues.read().await.contains(queue)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> CabbageResult<()> {
        if self.is_closed() {
            return Err(CabbageError::Broker("内存消息代理已关闭".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn enqueue(&self, queue: &str, envelope: &Envelope) -> CabbageResult<()> {
        self.ensure_open()?;
        let mut queues = self.queues.write().await;
        queues
            .entry(queue.to_string())
            .or_default()
            .push_back(envelope.clone());
        debug!(queue, message_id = %envelope.id, "消息已放入内存队列");
        Ok(())
    }

    async fn dequeue(&self, queue: &str) -> CabbageResult<Option<Envelope>> {
        self.ensure_open()?;
        let mut queues = self.queues.write().await;
        Ok(queues.get_mut(queue).and_then(VecDeque::pop_front))
    }

    async fn activate_queue(&self, queue: &str) -> CabbageResult<()> {
        self.ensure_open()?;
        self.active_queues.write().await.insert(queue.to_string());
        Ok(())
    }

    async fn close(&self) -> CabbageResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
