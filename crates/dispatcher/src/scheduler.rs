use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use cabbage_core::{
    config::SchedulerConfig, publisher::Publisher, traits::Broker, CabbageResult,
};
use chrono::{DateTime, Local, TimeZone, Utc};
use futures::FutureExt;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    cron_utils::Tick,
    entry::Entry,
    job::{Job, PayloadGenerator, ScheduleTask},
};

struct SchedulerRuntime {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// 周期任务调度器
///
/// 每个tick计算当前时间的五字段分解，对所有已编译的Job做成员检查，
/// 到期的Job各自作为独立的并发单元生成负载并发布，互不阻塞，也不阻塞下一个tick。
pub struct Scheduler {
    publisher: Arc<Publisher>,
    jobs: Arc<RwLock<Vec<Arc<Job>>>>,
    config: SchedulerConfig,
    runtime: Mutex<Option<SchedulerRuntime>>,
}

impl Scheduler {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self::with_config(broker, SchedulerConfig::default())
    }

    pub fn with_config(broker: Arc<dyn Broker>, config: SchedulerConfig) -> Self {
        Self::with_publisher(Arc::new(Publisher::new(broker)), config)
    }

    pub fn with_publisher(publisher: Arc<Publisher>, config: SchedulerConfig) -> Self {
        Self {
            publisher,
            jobs: Arc::new(RwLock::new(Vec::new())),
            config,
            runtime: Mutex::new(None),
        }
    }

    pub fn publisher(&self) -> &Arc<Publisher> {
        &self.publisher
    }

    /// 注册周期任务
    ///
    /// 所有条目先全部编译，任何一条非法都会直接返回错误，调度器状态保持不变。
    pub async fn add_schedule_task(&self, task: &ScheduleTask) -> CabbageResult<()> {
        self.add_schedule_tasks(std::slice::from_ref(task)).await
    }

    pub async fn add_schedule_tasks(&self, tasks: &[ScheduleTask]) -> CabbageResult<()> {
        let mut compiled = Vec::new();
        let mut bindings = Vec::with_capacity(tasks.len());
        for task in tasks {
            compiled.extend(task.compile(&self.publisher)?);
            bindings.push(task.task()?);
        }

        for binding in &bindings {
            self.publisher.register_task(binding).await;
        }

        let mut jobs = self.jobs.write().await;
        for job in compiled {
            debug!(
                task_name = %job.task_name(),
                schedule = %job.schedule(),
                "添加调度Job"
            );
            jobs.push(Arc::new(job));
        }
        Ok(())
    }

    /// 为已经在发布器中注册的任务添加一条调度条目
    pub async fn add_job(
        &self,
        entry: &Entry,
        task_name: &str,
        generator: PayloadGenerator,
    ) -> CabbageResult<()> {
        let job = Job::compile(task_name, entry, generator, Arc::clone(&self.publisher))?;
        if !self.publisher.is_registered(task_name).await {
            warn!(task_name, "调度Job对应的任务尚未在发布器中注册");
        }
        self.jobs.write().await.push(Arc::new(job));
        Ok(())
    }

    pub async fn job_count(&self) -> usize {
        self.jobs.read().await.len()
    }

    /// 启动tick循环，返回可观察的取消令牌
    ///
    /// 已经在运行时返回当前令牌，不会启动第二个循环。
    pub async fn start(&self) -> CancellationToken {
        let mut runtime = self.runtime.lock().await;
        if let Some(existing) = runtime.as_ref() {
            if !existing.token.is_cancelled() {
                warn!("调度器已在运行");
                return existing.token.clone();
            }
        }

        let token = CancellationToken::new();
        let handle = tokio::spawn(tick_loop(
            Arc::clone(&self.jobs),
            self.config.clone(),
            token.clone(),
            Utc::now,
        ));
        *runtime = Some(SchedulerRuntime {
            token: token.clone(),
            handle,
        });

        info!(
            align_to_minute = self.config.align_to_minute,
            use_utc = self.config.use_utc,
            "调度器已启动"
        );
        token
    }

    /// 停止tick循环并等待其退出，已经触发的Job不会被等待
    pub async fn shutdown(&self) {
        let runtime = self.runtime.lock().await.take();
        let Some(runtime) = runtime else {
            return;
        };

        runtime.token.cancel();
        if let Err(e) = runtime.handle.await {
            error!(error = %e, "调度循环异常退出");
        }
        info!("调度器已停止");
    }

    pub async fn is_running(&self) -> bool {
        self.runtime
            .lock()
            .await
            .as_ref()
            .is_some_and(|runtime| !runtime.token.is_cancelled())
    }

    /// 按给定时刻评估一次，返回触发的Job数量
    pub async fn run_pending<Tz: TimeZone>(&self, now: &DateTime<Tz>) -> usize {
        run_pending_jobs(&self.jobs, &Tick::from_datetime(now)).await
    }
}

async fn run_pending_jobs(jobs: &RwLock<Vec<Arc<Job>>>, tick: &Tick) -> usize {
    let due: Vec<Arc<Job>> = jobs
        .read()
        .await
        .iter()
        .filter(|job| job.is_due(tick))
        .cloned()
        .collect();

    for job in &due {
        let job = Arc::clone(job);
        tokio::spawn(async move {
            info!(task_name = %job.task_name(), "调度器发布任务");
            match AssertUnwindSafe(job.run()).catch_unwind().await {
                Ok(Ok(message_id)) => {
                    debug!(task_name = %job.task_name(), message_id = %message_id, "调度任务已发布");
                }
                Ok(Err(e)) => {
                    error!(task_name = %job.task_name(), error = %e, "调度任务发布失败");
                }
                Err(_) => {
                    error!(task_name = %job.task_name(), "调度任务执行panic");
                }
            }
        });
    }
    due.len()
}

/// tick循环的时间决策：下一次醒来前等待多久，以及醒来时是否评估
#[derive(Debug)]
struct TickClock {
    align_to_minute: bool,
    tick_interval: Duration,
    last_minute: Option<i64>,
}

impl TickClock {
    fn new(config: &SchedulerConfig) -> Self {
        Self {
            align_to_minute: config.align_to_minute,
            tick_interval: config.tick_interval(),
            last_minute: None,
        }
    }

    fn delay(&self, now: DateTime<Utc>) -> Duration {
        if self.align_to_minute {
            until_next_minute(now)
        } else {
            self.tick_interval
        }
    }

    /// 对齐模式下同一分钟只评估一次
    fn admit(&mut self, now: DateTime<Utc>) -> bool {
        if !self.align_to_minute {
            return true;
        }
        let minute = now.timestamp().div_euclid(60);
        if self.last_minute == Some(minute) {
            return false;
        }
        self.last_minute = Some(minute);
        true
    }
}

async fn tick_loop<C>(
    jobs: Arc<RwLock<Vec<Arc<Job>>>>,
    config: SchedulerConfig,
    token: CancellationToken,
    clock: C,
) where
    C: Fn() -> DateTime<Utc>,
{
    let mut ticks = TickClock::new(&config);

    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(ticks.delay(clock())) => {}
        }

        let now = clock();
        if !ticks.admit(now) {
            continue;
        }

        let tick = if config.use_utc {
            Tick::from_datetime(&now)
        } else {
            Tick::from_datetime(&now.with_timezone(&Local))
        };
        let fired = run_pending_jobs(&jobs, &tick).await;
        debug!(?tick, fired, "调度tick");
    }

    debug!("调度循环退出");
}

fn until_next_minute(now: DateTime<Utc>) -> Duration {
    let elapsed = now.timestamp_millis().rem_euclid(60_000);
    Duration::from_millis((60_000 - elapsed) as u64)
}
