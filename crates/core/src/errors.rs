use thiserror::Error;

/// 任务分发系统错误类型定义
///
/// 配置类错误（重复的Worker池、非法CRON表达式等）在注册时同步返回给调用方；
/// 消息队列的瞬时错误由轮询循环吸收，只有发布路径会把它交给直接调用方。
#[derive(Debug, Error)]
pub enum CabbageError {
    #[error("任务名称不能为空")]
    EmptyTaskName,

    #[error("队列名称不能为空")]
    EmptyQueueName,

    #[error("Worker并发数必须大于0，当前值: {0}")]
    InvalidConcurrency(usize),

    #[error("队列 {queue} 的Worker池已存在")]
    WorkerPoolExists { queue: String },

    #[error("尝试注册任务处理器 {task}，但队列 {queue} 没有可用的Worker池")]
    NoWorkerPool { task: String, queue: String },

    #[error("队列 {queue} 的Worker池未注册任何任务处理器")]
    NoRoutes { queue: String },

    #[error("队列 {queue} 的Worker池已在运行")]
    AlreadyRunning { queue: String },

    #[error("任务未注册: {name}")]
    MissingTask { name: String },

    #[error("无效的CRON表达式: {expr} - {message}")]
    InvalidCron { expr: String, message: String },

    #[error("调度任务 {name} 的调度条目不能为空")]
    EmptyEntries { name: String },

    #[error("无效的调度条目参数: {0}")]
    InvalidEntry(String),

    #[error("消息队列错误: {0}")]
    Broker(String),

    #[error("序列化错误: {0}")]
    Serialization(String),

    #[error("任务执行错误: {0}")]
    TaskExecution(String),

    #[error("配置错误: {0}")]
    Configuration(String),

    #[error("内部错误: {0}")]
    Internal(String),
}

impl CabbageError {
    pub fn invalid_cron(expr: &str, message: impl Into<String>) -> Self {
        Self::InvalidCron {
            expr: expr.to_string(),
            message: message.into(),
        }
    }

    /// 是否属于注册阶段即可发现的配置错误
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::EmptyTaskName
                | Self::EmptyQueueName
                | Self::InvalidConcurrency(_)
                | Self::WorkerPoolExists { .. }
                | Self::NoWorkerPool { .. }
                | Self::NoRoutes { .. }
                | Self::AlreadyRunning { .. }
                | Self::InvalidCron { .. }
                | Self::EmptyEntries { .. }
                | Self::InvalidEntry(_)
                | Self::Configuration(_)
        )
    }
}

impl From<serde_json::Error> for CabbageError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

/// 统一的Result类型
pub type CabbageResult<T> = std::result::Result<T, CabbageError>;
