use std::fmt;
use std::sync::Arc;

use cabbage_core::{
    models::Task, publisher::Publisher, traits::TaskPublisher, CabbageError, CabbageResult,
};

use crate::{
    cron_utils::{CronSchedule, Tick},
    entry::Entry,
};

/// 每次触发时生成待发布的任务负载
pub type PayloadGenerator = Arc<dyn Fn() -> Box<dyn TaskPublisher> + Send + Sync>;

/// 周期性任务定义
#[derive(Clone)]
pub struct ScheduleTask {
    pub name: String,
    pub queue_name: String,
    pub generator: PayloadGenerator,
    pub entries: Vec<Entry>,
}

impl ScheduleTask {
    pub fn new<F>(
        name: impl Into<String>,
        queue_name: impl Into<String>,
        generator: F,
        entries: Vec<Entry>,
    ) -> Self
    where
        F: Fn() -> Box<dyn TaskPublisher> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            queue_name: queue_name.into(),
            generator: Arc::new(generator),
            entries,
        }
    }

    /// 发布端的任务绑定
    pub fn task(&self) -> CabbageResult<Task> {
        Task::publishable(self.name.clone(), self.queue_name.clone())
    }

    /// 校验并编译所有条目，任何一条非法都会失败
    pub(crate) fn compile(&self, publisher: &Arc<Publisher>) -> CabbageResult<Vec<Job>> {
        self.task()?;
        if self.entries.is_empty() {
            return Err(CabbageError::EmptyEntries {
                name: self.name.clone(),
            });
        }

        self.entries
            .iter()
            .map(|entry| {
                Job::compile(
                    &self.name,
                    entry,
                    Arc::clone(&self.generator),
                    Arc::clone(publisher),
                )
            })
            .collect()
    }
}

impl fmt::Debug for ScheduleTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScheduleTask")
            .field("name", &self.name)
            .field("queue_name", &self.queue_name)
            .field("entries", &self.entries)
            .finish()
    }
}

/// 一条条目编译后的可匹配形式，编译后不可变
pub struct Job {
    task_name: String,
    schedule: CronSchedule,
    generator: PayloadGenerator,
    publisher: Arc<Publisher>,
}

impl Job {
    pub fn compile(
        task_name: &str,
        entry: &Entry,
        generator: PayloadGenerator,
        publisher: Arc<Publisher>,
    ) -> CabbageResult<Self> {
        Ok(Self {
            task_name: task_name.to_string(),
            schedule: entry.compile()?,
            generator,
            publisher,
        })
    }

    pub fn task_name(&self) -> &str {
        &self.task_name
    }

    pub fn schedule(&self) -> &CronSchedule {
        &self.schedule
    }

    pub fn is_due(&self, tick: &Tick) -> bool {
        self.schedule.matches(tick)
    }

    /// 生成负载并发布，返回消息ID
    pub async fn run(&self) -> CabbageResult<String> {
        let payload = (self.generator)();
        self.publisher
            .publish_task(&self.task_name, payload.as_ref())
            .await
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("task_name", &self.task_name)
            .field("schedule", &self.schedule.expression())
            .finish()
    }
}
