//! 周期任务调度：CRON解析与匹配、调度条目、Job编译以及tick循环。

pub mod cron_utils;
pub mod entry;
pub mod job;
pub mod scheduler;

pub use cron_utils::{CronSchedule, Tick};
pub use entry::Entry;
pub use job::{Job, PayloadGenerator, ScheduleTask};
pub use scheduler::Scheduler;
