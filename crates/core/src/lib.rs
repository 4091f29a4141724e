//! # cabbage-core
//!
//! 任务分发系统的核心抽象：消息信封、任务定义、消息代理契约、
//! 处理器/发布者能力接口、任务发布器以及配置和日志初始化。

pub mod config;
pub mod errors;
pub mod logging;
pub mod models;
pub mod publisher;
pub mod traits;

pub use errors::*;
pub use models::{Envelope, Task, TaskRoutes};
pub use publisher::Publisher;
pub use traits::{Broker, JsonPayload, Settlement, TaskProcessor, TaskPublisher};
