use async_trait::async_trait;

use crate::{models::Envelope, CabbageResult};

/// 消息处理结果，交给后端决定如何确认投递
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    /// 处理器执行成功
    Processed,
    /// 处理器返回错误或发生panic
    Failed,
    /// 没有找到任务名对应的处理器
    Unroutable,
}

/// 消息代理抽象接口
///
/// 任何后端（AMQP代理、键值列表存储等）都需要实现这个契约。
/// `dequeue` 是非阻塞的：没有可用消息时立即返回 `Ok(None)`，轮询节奏由调用方负责。
#[async_trait]
pub trait Broker: Send + Sync {
    /// 把消息放入指定队列，如果后端需要显式声明队列，这里会顺带完成（可重复调用）
    async fn enqueue(&self, queue: &str, envelope: &Envelope) -> CabbageResult<()>;

    /// 从指定队列取出一条消息
    ///
    /// 返回消息之前后端已经确保同一次投递不会再交给其它消费者，
    /// 也就是说消费和下游处理不是事务性的。
    async fn dequeue(&self, queue: &str) -> CabbageResult<Option<Envelope>>;

    /// 在Worker池消费之前激活队列（声明队列/订阅），幂等
    async fn activate_queue(&self, queue: &str) -> CabbageResult<()>;

    /// 处理结束后的确认钩子，默认什么也不做（消费即确认）
    async fn settle(
        &self,
        _queue: &str,
        _envelope: &Envelope,
        _settlement: Settlement,
    ) -> CabbageResult<()> {
        Ok(())
    }

    /// 释放所有后端连接
    async fn close(&self) -> CabbageResult<()>;
}
