use std::collections::HashMap;
use std::sync::Arc;

use cabbage_core::{
    config::CabbageConfig, models::Task, publisher::Publisher, traits::Broker, CabbageError,
    CabbageResult,
};
use cabbage_dispatcher::Scheduler;
use cabbage_infrastructure::BrokerFactory;
use cabbage_worker::WorkerPool;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// 组合根：持有消息代理，创建并查找Worker池、发布器和调度器
///
/// 每个Client独立拥有自己的注册表，可以在同一进程内创建多个互不干扰的实例。
pub struct Client {
    broker: Arc<dyn Broker>,
    config: CabbageConfig,
    worker_pools: Mutex<HashMap<String, Arc<WorkerPool>>>,
    tasks: Mutex<HashMap<String, Task>>,
    publisher: Mutex<Option<Arc<Publisher>>>,
}

impl Client {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self::with_config(broker, CabbageConfig::default())
    }

    pub fn with_config(broker: Arc<dyn Broker>, config: CabbageConfig) -> Self {
        Self {
            broker,
            config,
            worker_pools: Mutex::new(HashMap::new()),
            tasks: Mutex::new(HashMap::new()),
            publisher: Mutex::new(None),
        }
    }

    /// 按配置创建消息代理并构造Client，连接失败直接返回错误
    pub async fn connect(config: &CabbageConfig) -> CabbageResult<Self> {
        let broker = BrokerFactory::create(&config.broker).await?;
        info!(broker = config.broker.r#type.as_str(), "Client已连接消息代理");
        Ok(Self::with_config(broker, config.clone()))
    }

    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.broker
    }

    pub fn config(&self) -> &CabbageConfig {
        &self.config
    }

    /// 为队列创建Worker池并激活队列，同一队列只能有一个Worker池
    pub async fn create_worker_pool(
        &self,
        queue_name: &str,
        concurrency: usize,
    ) -> CabbageResult<Arc<WorkerPool>> {
        let mut pools = self.worker_pools.lock().await;
        if pools.contains_key(queue_name) {
            return Err(CabbageError::WorkerPoolExists {
                queue: queue_name.to_string(),
            });
        }

        let pool = Arc::new(WorkerPool::with_poll_interval(
            Arc::clone(&self.broker),
            queue_name,
            concurrency,
            self.config.worker.poll_interval(),
        )?);
        self.broker.activate_queue(queue_name).await?;

        pools.insert(queue_name.to_string(), Arc::clone(&pool));
        debug!(queue = queue_name, concurrency, "创建Worker池");
        Ok(pool)
    }

    pub async fn worker_pool(&self, queue_name: &str) -> Option<Arc<WorkerPool>> {
        self.worker_pools.lock().await.get(queue_name).cloned()
    }

    /// 获取（必要时创建）发布器
    ///
    /// 第一次创建时会装入所有已注册的可发布任务。
    pub async fn create_publisher(&self) -> Arc<Publisher> {
        let mut slot = self.publisher.lock().await;
        if let Some(publisher) = slot.as_ref() {
            return Arc::clone(publisher);
        }

        let publisher = Arc::new(Publisher::new(Arc::clone(&self.broker)));
        let tasks = self.tasks.lock().await;
        for task in tasks.values().filter(|task| task.with_publish) {
            publisher.register_task(task).await;
        }

        *slot = Some(Arc::clone(&publisher));
        publisher
    }

    /// 注册任务
    ///
    /// 带处理器的任务装入对应队列的Worker池（队列没有Worker池时报错）；
    /// 可发布的任务在发布器存在时注册到发布器。两者都没有时什么也不做。
    pub async fn register_task(&self, task: Task) -> CabbageResult<()> {
        if let Some(processor) = &task.processor {
            let pool = self.worker_pool(&task.queue_name).await.ok_or_else(|| {
                CabbageError::NoWorkerPool {
                    task: task.name.clone(),
                    queue: task.queue_name.clone(),
                }
            })?;
            pool.register_handler(task.name.clone(), Arc::clone(processor))
                .await;
        }

        self.tasks
            .lock()
            .await
            .insert(task.name.clone(), task.clone());

        if task.with_publish {
            if let Some(publisher) = self.publisher.lock().await.as_ref() {
                publisher.register_task(&task).await;
            }
        }

        debug!(task_name = %task.name, queue = %task.queue_name, "任务已注册");
        Ok(())
    }

    pub async fn registered_task(&self, task_name: &str) -> Option<Task> {
        self.tasks.lock().await.get(task_name).cloned()
    }

    /// 创建调度器，调度器使用自己的发布器
    pub fn create_scheduler(&self) -> Scheduler {
        Scheduler::with_config(Arc::clone(&self.broker), self.config.scheduler.clone())
    }

    /// 停止所有Worker池（包括仍在退出中的）后关闭消息代理
    pub async fn close(&self) -> CabbageResult<()> {
        let pools: Vec<Arc<WorkerPool>> = self.worker_pools.lock().await.values().cloned().collect();
        for pool in pools {
            pool.stop().await;
        }

        if let Err(e) = self.broker.close().await {
            warn!(error = %e, "关闭消息代理失败");
            return Err(e);
        }
        info!("Client已关闭");
        Ok(())
    }
}
