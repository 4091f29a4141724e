use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use cabbage_core::{
    models::{Envelope, TaskRoutes},
    traits::{Broker, Settlement, TaskProcessor},
    CabbageError, CabbageResult,
};
use futures::FutureExt;
use tokio::sync::{Mutex, RwLock};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, error, info, warn};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Worker池运行统计快照
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub processed: u64,
    pub failed: u64,
    pub unroutable: u64,
    pub in_flight: usize,
}

#[derive(Debug, Default)]
struct PoolCounters {
    processed: AtomicU64,
    failed: AtomicU64,
    unroutable: AtomicU64,
    in_flight: AtomicUsize,
}

/// 一次运行的取消令牌和轮询器集合，所有等待者共同观察同一个tracker
#[derive(Default)]
struct PoolState {
    token: Option<CancellationToken>,
    tracker: Option<TaskTracker>,
}

impl PoolState {
    /// 上一轮的轮询器是否还有存活的
    fn is_active(&self) -> bool {
        let cancelled = self.token.as_ref().map_or(true, |t| t.is_cancelled());
        let drained = self.tracker.as_ref().map_or(true, |t| t.is_empty());
        !(cancelled && drained)
    }
}

/// 单个队列的Worker池
///
/// 启动后产生 `concurrency` 个相互独立的轮询器，共享一个取消令牌。每个轮询器按固定间隔
/// 尝试出队，出队失败或队列为空时等待下一个间隔；取到消息后按任务名查找处理器并同步执行。
/// 处理器错误只记录日志，不会中断轮询器。
pub struct WorkerPool {
    broker: Arc<dyn Broker>,
    queue_name: String,
    concurrency: usize,
    poll_interval: Duration,
    routes: Arc<RwLock<TaskRoutes>>,
    state: Mutex<PoolState>,
    counters: Arc<PoolCounters>,
}

impl WorkerPool {
    pub fn new(
        broker: Arc<dyn Broker>,
        queue_name: impl Into<String>,
        concurrency: usize,
    ) -> CabbageResult<Self> {
        Self::with_poll_interval(broker, queue_name, concurrency, DEFAULT_POLL_INTERVAL)
    }

    pub fn with_poll_interval(
        broker: Arc<dyn Broker>,
        queue_name: impl Into<String>,
        concurrency: usize,
        poll_interval: Duration,
    ) -> CabbageResult<Self> {
        let queue_name = queue_name.into();
        if queue_name.is_empty() {
            return Err(CabbageError::EmptyQueueName);
        }
        if concurrency == 0 {
            return Err(CabbageError::InvalidConcurrency(concurrency));
        }

        Ok(Self {
            broker,
            queue_name,
            concurrency,
            poll_interval,
            routes: Arc::new(RwLock::new(TaskRoutes::new())),
            state: Mutex::new(PoolState::default()),
            counters: Arc::new(PoolCounters::default()),
        })
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// 注册（或替换）单个任务处理器，运行中也可以调用
    pub async fn register_handler(
        &self,
        task_name: impl Into<String>,
        processor: Arc<dyn TaskProcessor>,
    ) {
        let task_name = task_name.into();
        debug!(queue = %self.queue_name, task_name = %task_name, "注册任务处理器");
        self.routes.write().await.insert(task_name, processor);
    }

    /// 用新的路由表整体替换当前路由
    pub async fn register_routes(&self, routes: TaskRoutes) {
        debug!(queue = %self.queue_name, routes = routes.len(), "替换任务路由表");
        *self.routes.write().await = routes;
    }

    pub async fn has_route(&self, task_name: &str) -> bool {
        self.routes.read().await.contains_key(task_name)
    }

    pub async fn start(&self) -> CabbageResult<()> {
        self.start_with_token(&CancellationToken::new()).await
    }

    /// 在调用方提供的取消范围内启动轮询器
    ///
    /// 取消父令牌与调用 `stop` 效果相同，之后可以用 `wait` 等待轮询器退出。
    pub async fn start_with_token(&self, parent: &CancellationToken) -> CabbageResult<()> {
        if self.routes.read().await.is_empty() {
            return Err(CabbageError::NoRoutes {
                queue: self.queue_name.clone(),
            });
        }

        let mut state = self.state.lock().await;
        if state.is_active() {
            return Err(CabbageError::AlreadyRunning {
                queue: self.queue_name.clone(),
            });
        }

        let token = parent.child_token();
        let tracker = TaskTracker::new();
        for index in 0..self.concurrency {
            let poller = Poller {
                worker_id: format!("{}-{index}", self.queue_name),
                broker: Arc::clone(&self.broker),
                queue_name: self.queue_name.clone(),
                poll_interval: self.poll_interval,
                routes: Arc::clone(&self.routes),
                counters: Arc::clone(&self.counters),
                token: token.clone(),
            };
            tracker.spawn(poller.run());
        }
        tracker.close();

        state.token = Some(token);
        state.tracker = Some(tracker);

        info!(
            queue = %self.queue_name,
            concurrency = self.concurrency,
            "Worker池已启动"
        );
        Ok(())
    }

    /// 发出取消信号并等待所有轮询器退出
    ///
    /// 正在执行的处理器会先完成；返回之后不会再有新的处理器调用开始。
    /// 可以与 `wait` 或另一个 `stop` 同时调用，每个调用方都会等到轮询器全部退出。
    pub async fn stop(&self) {
        let token = self.state.lock().await.token.clone();
        let Some(token) = token else {
            return;
        };

        token.cancel();
        self.wait().await;
        info!(queue = %self.queue_name, "Worker池已停止");
    }

    /// 等待所有轮询器退出，但不发出取消信号
    pub async fn wait(&self) {
        let tracker = self.state.lock().await.tracker.clone();
        let Some(tracker) = tracker else {
            return;
        };

        tracker.wait().await;

        let mut state = self.state.lock().await;
        let same_run = state
            .tracker
            .as_ref()
            .is_some_and(|current| TaskTracker::ptr_eq(current, &tracker));
        if same_run {
            state.token = None;
            state.tracker = None;
        }
    }

    /// 已启动且尚未被取消
    pub async fn is_running(&self) -> bool {
        self.state
            .lock()
            .await
            .token
            .as_ref()
            .is_some_and(|token| !token.is_cancelled())
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            processed: self.counters.processed.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            unroutable: self.counters.unroutable.load(Ordering::Relaxed),
            in_flight: self.counters.in_flight.load(Ordering::Relaxed),
        }
    }
}

struct Poller {
    worker_id: String,
    broker: Arc<dyn Broker>,
    queue_name: String,
    poll_interval: Duration,
    routes: Arc<RwLock<TaskRoutes>>,
    counters: Arc<PoolCounters>,
    token: CancellationToken,
}

impl Poller {
    async fn run(self) {
        let mut ticker = interval_at(Instant::now() + self.poll_interval, self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        debug!(worker_id = %self.worker_id, queue = %self.queue_name, "轮询器启动");

        loop {
            tokio::select! {
                biased;
                _ = self.token.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let envelope = match self.broker.dequeue(&self.queue_name).await {
                Ok(Some(envelope)) => envelope,
                Ok(None) => continue,
                Err(e) => {
                    debug!(worker_id = %self.worker_id, queue = %self.queue_name, error = %e, "出队失败");
                    continue;
                }
            };

            if self.token.is_cancelled() {
                warn!(
                    worker_id = %self.worker_id,
                    queue = %self.queue_name,
                    task_name = %envelope.task_name,
                    message_id = %envelope.id,
                    "Worker池已取消，消息未处理"
                );
                self.settle(&envelope, Settlement::Failed).await;
                break;
            }

            let settlement = self.dispatch(&envelope).await;
            self.settle(&envelope, settlement).await;
        }

        debug!(worker_id = %self.worker_id, queue = %self.queue_name, "轮询器退出");
    }

    async fn dispatch(&self, envelope: &Envelope) -> Settlement {
        let processor = self.routes.read().await.get(&envelope.task_name).cloned();
        let Some(processor) = processor else {
            warn!(
                worker_id = %self.worker_id,
                queue = %self.queue_name,
                task_name = %envelope.task_name,
                message_id = %envelope.id,
                "没有找到任务处理器，丢弃消息"
            );
            self.counters.unroutable.fetch_add(1, Ordering::Relaxed);
            return Settlement::Unroutable;
        };

        self.counters.in_flight.fetch_add(1, Ordering::SeqCst);
        let result = AssertUnwindSafe(processor.process(&envelope.body, &envelope.id))
            .catch_unwind()
            .await;
        self.counters.in_flight.fetch_sub(1, Ordering::SeqCst);

        match result {
            Ok(Ok(())) => {
                self.counters.processed.fetch_add(1, Ordering::Relaxed);
                debug!(
                    worker_id = %self.worker_id,
                    task_name = %envelope.task_name,
                    message_id = %envelope.id,
                    "任务处理完成"
                );
                Settlement::Processed
            }
            Ok(Err(e)) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                error!(
                    worker_id = %self.worker_id,
                    task_name = %envelope.task_name,
                    message_id = %envelope.id,
                    error = %e,
                    "任务处理失败"
                );
                Settlement::Failed
            }
            Err(_) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                error!(
                    worker_id = %self.worker_id,
                    task_name = %envelope.task_name,
                    message_id = %envelope.id,
                    "任务处理器panic"
                );
                Settlement::Failed
            }
        }
    }

    async fn settle(&self, envelope: &Envelope, settlement: Settlement) {
        if let Err(e) = self
            .broker
            .settle(&self.queue_name, envelope, settlement)
            .await
        {
            warn!(
                worker_id = %self.worker_id,
                message_id = %envelope.id,
                error = %e,
                "消息确认失败"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use cabbage_infrastructure::InMemoryBroker;
    use mockall::mock;
    use tokio::time::{sleep, timeout};

    mock! {
        pub FlakyBroker {}

        #[async_trait]
        impl Broker for FlakyBroker {
            async fn enqueue(&self, queue: &str, envelope: &Envelope) -> CabbageResult<()>;
            async fn dequeue(&self, queue: &str) -> CabbageResult<Option<Envelope>>;
            async fn activate_queue(&self, queue: &str) -> CabbageResult<()>;
            async fn settle(&self, queue: &str, envelope: &Envelope, settlement: Settlement) -> CabbageResult<()>;
            async fn close(&self) -> CabbageResult<()>;
        }
    }

    #[derive(Default)]
    struct CountingProcessor {
        calls: AtomicU64,
        active: AtomicUsize,
        max_active: AtomicUsize,
        delay: Duration,
    }

    #[async_trait]
    impl TaskProcessor for CountingProcessor {
        async fn process(&self, _body: &[u8], _id: &str) -> CabbageResult<()> {
            let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(active, Ordering::SeqCst);
            sleep(self.delay).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct FailingProcessor;

    #[async_trait]
    impl TaskProcessor for FailingProcessor {
        async fn process(&self, body: &[u8], _id: &str) -> CabbageResult<()> {
            if body == b"panic" {
                panic!("handler exploded");
            }
            Err(CabbageError::TaskExecution("bad input".to_string()))
        }
    }

    fn fast_pool(broker: Arc<dyn Broker>, concurrency: usize) -> WorkerPool {
        WorkerPool::with_poll_interval(broker, "jobs", concurrency, Duration::from_millis(5))
            .unwrap()
    }

    async fn wait_for<F: Fn(PoolStats) -> bool>(pool: &WorkerPool, predicate: F) {
        timeout(Duration::from_secs(5), async {
            while !predicate(pool.stats()) {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_invalid_construction() {
        let broker: Arc<dyn Broker> = Arc::new(InMemoryBroker::new());
        assert!(matches!(
            WorkerPool::new(Arc::clone(&broker), "", 1),
            Err(CabbageError::EmptyQueueName)
        ));
        assert!(matches!(
            WorkerPool::new(broker, "q", 0),
            Err(CabbageError::InvalidConcurrency(0))
        ));
    }

    #[tokio::test]
    async fn test_start_without_routes() {
        let pool = fast_pool(Arc::new(InMemoryBroker::new()), 1);
        assert!(matches!(
            pool.start().await,
            Err(CabbageError::NoRoutes { .. })
        ));
        assert!(!pool.is_running().await);
    }

    #[tokio::test]
    async fn test_processes_all_messages_within_concurrency() {
        let broker = Arc::new(InMemoryBroker::new());
        for i in 0..20 {
            broker
                .enqueue("jobs", &Envelope::new("count", vec![i]))
                .await
                .unwrap();
        }

        let processor = Arc::new(CountingProcessor {
            delay: Duration::from_millis(10),
            ..Default::default()
        });
        let pool = fast_pool(broker.clone(), 3);
        pool.register_handler("count", processor.clone()).await;
        pool.start().await.unwrap();

        wait_for(&pool, |stats| stats.processed == 20).await;
        pool.stop().await;

        assert_eq!(processor.calls.load(Ordering::SeqCst), 20);
        assert!(processor.max_active.load(Ordering::SeqCst) <= 3);
        assert_eq!(broker.queue_len("jobs").await, 0);
        assert_eq!(pool.stats().in_flight, 0);
    }

    #[tokio::test]
    async fn test_double_start_rejected_until_stopped() {
        let pool = fast_pool(Arc::new(InMemoryBroker::new()), 2);
        pool.register_handler("count", Arc::new(CountingProcessor::default()))
            .await;

        pool.start().await.unwrap();
        assert!(matches!(
            pool.start().await,
            Err(CabbageError::AlreadyRunning { .. })
        ));

        pool.stop().await;
        assert!(!pool.is_running().await);
        pool.start().await.unwrap();
        pool.stop().await;
    }

    #[tokio::test]
    async fn test_stop_waits_for_in_flight_handler() {
        let broker = Arc::new(InMemoryBroker::new());
        broker
            .enqueue("jobs", &Envelope::new("slow", vec![]))
            .await
            .unwrap();

        let processor = Arc::new(CountingProcessor {
            delay: Duration::from_millis(200),
            ..Default::default()
        });
        let pool = fast_pool(broker.clone(), 1);
        pool.register_handler("slow", processor.clone()).await;
        pool.start().await.unwrap();

        wait_for(&pool, |stats| stats.in_flight == 1).await;
        pool.stop().await;

        assert_eq!(processor.calls.load(Ordering::SeqCst), 1);

        broker
            .enqueue("jobs", &Envelope::new("slow", vec![]))
            .await
            .unwrap();
        sleep(Duration::from_millis(50)).await;
        assert_eq!(processor.calls.load(Ordering::SeqCst), 1);
        assert_eq!(broker.queue_len("jobs").await, 1);
    }

    #[tokio::test]
    async fn test_handler_errors_and_panics_do_not_stop_poller() {
        let broker = Arc::new(InMemoryBroker::new());
        for body in [b"bad".to_vec(), b"panic".to_vec(), b"bad".to_vec()] {
            broker
                .enqueue("jobs", &Envelope::new("fails", body))
                .await
                .unwrap();
        }
        broker
            .enqueue("jobs", &Envelope::new("ok", vec![]))
            .await
            .unwrap();

        let pool = fast_pool(broker, 1);
        pool.register_handler("fails", Arc::new(FailingProcessor)).await;
        pool.register_handler("ok", Arc::new(CountingProcessor::default()))
            .await;
        pool.start().await.unwrap();

        wait_for(&pool, |stats| stats.failed == 3 && stats.processed == 1).await;
        pool.stop().await;
    }

    #[tokio::test]
    async fn test_unroutable_message_is_dropped() {
        let broker = Arc::new(InMemoryBroker::new());
        broker
            .enqueue("jobs", &Envelope::new("unknown", vec![]))
            .await
            .unwrap();
        broker
            .enqueue("jobs", &Envelope::new("known", vec![]))
            .await
            .unwrap();

        let pool = fast_pool(broker.clone(), 1);
        pool.register_handler("known", Arc::new(CountingProcessor::default()))
            .await;
        pool.start().await.unwrap();

        wait_for(&pool, |stats| stats.unroutable == 1 && stats.processed == 1).await;
        pool.stop().await;
        assert_eq!(broker.queue_len("jobs").await, 0);
    }

    #[tokio::test]
    async fn test_register_routes_replaces_table() {
        let pool = fast_pool(Arc::new(InMemoryBroker::new()), 1);
        pool.register_handler("old", Arc::new(CountingProcessor::default()))
            .await;

        let mut routes = TaskRoutes::new();
        routes.insert(
            "new".to_string(),
            Arc::new(CountingProcessor::default()) as Arc<dyn TaskProcessor>,
        );
        pool.register_routes(routes).await;

        assert!(pool.has_route("new").await);
        assert!(!pool.has_route("old").await);
    }

    #[tokio::test]
    async fn test_broker_failures_are_swallowed() {
        let mut broker = MockFlakyBroker::new();
        let mut calls = 0;
        broker.expect_dequeue().returning(move |_| {
            calls += 1;
            match calls {
                1 | 2 => Err(CabbageError::Broker("connection reset".to_string())),
                3 => Ok(Some(Envelope::new("count", vec![]))),
                _ => Ok(None),
            }
        });
        broker
            .expect_settle()
            .withf(|queue, _, settlement| queue == "jobs" && *settlement == Settlement::Processed)
            .times(1)
            .returning(|_, _, _| Ok(()));

        let pool = fast_pool(Arc::new(broker), 1);
        pool.register_handler("count", Arc::new(CountingProcessor::default()))
            .await;
        pool.start().await.unwrap();

        wait_for(&pool, |stats| stats.processed == 1).await;
        pool.stop().await;
    }

    #[tokio::test]
    async fn test_parent_token_cancels_pool() {
        let pool = fast_pool(Arc::new(InMemoryBroker::new()), 2);
        pool.register_handler("count", Arc::new(CountingProcessor::default()))
            .await;

        let parent = CancellationToken::new();
        pool.start_with_token(&parent).await.unwrap();
        assert!(pool.is_running().await);
        parent.cancel();
        assert!(!pool.is_running().await);

        timeout(Duration::from_secs(1), pool.wait()).await.unwrap();
        assert!(!pool.is_running().await);
    }

    async fn slow_pool_in_flight(delay: Duration) -> (Arc<WorkerPool>, Arc<CountingProcessor>) {
        let broker = Arc::new(InMemoryBroker::new());
        broker
            .enqueue("jobs", &Envelope::new("slow", vec![]))
            .await
            .unwrap();

        let processor = Arc::new(CountingProcessor {
            delay,
            ..Default::default()
        });
        let pool = Arc::new(fast_pool(broker, 1));
        pool.register_handler("slow", processor.clone()).await;
        (pool, processor)
    }

    #[tokio::test]
    async fn test_stop_drains_while_another_caller_waits() {
        let (pool, processor) = slow_pool_in_flight(Duration::from_millis(300)).await;
        let parent = CancellationToken::new();
        pool.start_with_token(&parent).await.unwrap();
        wait_for(&pool, |stats| stats.in_flight == 1).await;

        let waiter = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.wait().await })
        };
        sleep(Duration::from_millis(20)).await;

        pool.stop().await;
        assert_eq!(processor.calls.load(Ordering::SeqCst), 1);
        assert_eq!(pool.stats().in_flight, 0);
        assert!(!pool.is_running().await);

        timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_stops_both_wait_for_drain() {
        let (pool, processor) = slow_pool_in_flight(Duration::from_millis(200)).await;
        pool.start().await.unwrap();
        wait_for(&pool, |stats| stats.in_flight == 1).await;

        let other = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move {
                pool.stop().await;
                pool.stats().in_flight
            })
        };
        pool.stop().await;
        assert_eq!(pool.stats().in_flight, 0);
        assert_eq!(timeout(Duration::from_secs(1), other).await.unwrap().unwrap(), 0);
        assert_eq!(processor.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_restart_rejected_while_cancelled_pollers_drain() {
        let (pool, processor) = slow_pool_in_flight(Duration::from_millis(200)).await;
        let parent = CancellationToken::new();
        pool.start_with_token(&parent).await.unwrap();
        wait_for(&pool, |stats| stats.in_flight == 1).await;

        parent.cancel();
        assert!(!pool.is_running().await);
        assert!(matches!(
            pool.start().await,
            Err(CabbageError::AlreadyRunning { .. })
        ));

        pool.wait().await;
        assert_eq!(processor.calls.load(Ordering::SeqCst), 1);
        pool.start().await.unwrap();
        assert!(pool.is_running().await);
        pool.stop().await;
    }

    #[tokio::test]
    async fn test_message_dequeued_after_cancel_is_settled_failed() {
        let parent = CancellationToken::new();
        let cancel_on_dequeue = parent.clone();

        let mut broker = MockFlakyBroker::new();
        broker.expect_dequeue().times(1).returning(move |_| {
            cancel_on_dequeue.cancel();
            Ok(Some(Envelope::new("count", vec![])))
        });
        broker
            .expect_settle()
            .withf(|_, _, settlement| *settlement == Settlement::Failed)
            .times(1)
            .returning(|_, _, _| Ok(()));

        let processor = Arc::new(CountingProcessor::default());
        let pool = fast_pool(Arc::new(broker), 1);
        pool.register_handler("count", processor.clone()).await;
        pool.start_with_token(&parent).await.unwrap();

        timeout(Duration::from_secs(1), pool.wait()).await.unwrap();
        assert_eq!(processor.calls.load(Ordering::SeqCst), 0);
        assert_eq!(pool.stats().processed, 0);
    }
}
