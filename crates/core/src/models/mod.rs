//! # 数据模型
//!
//! 定义任务分发的核心数据结构。
//!
//! ### Envelope - 消息信封
//! 在发布器/调度器与Worker池之间经由消息代理传递的单元：
//! 消息ID、投递关联ID、任务名、不透明的消息体和时间戳。
//!
//! ### Task - 任务定义
//! 绑定到队列的具名任务，可选地携带处理器并声明是否允许发布。
//!
//! ## 使用示例
//!
//! ```rust
//! use cabbage_core::models::{Envelope, Task};
//!
//! let task = Task::publishable("send_report", "reports").unwrap();
//! let envelope = Envelope::new(&task.name, br#"{"site":"a"}"#.to_vec());
//! assert_eq!(envelope.task_name, "send_report");
//! ```

pub mod envelope;
pub mod task;

pub use envelope::*;
pub use task::*;
