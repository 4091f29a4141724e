use std::fmt;

use cabbage_core::{CabbageError, CabbageResult};

use crate::cron_utils::CronSchedule;

/// 调度条目：一条五字段CRON表达式
///
/// 通过 `Entry::new` 构造的条目在注册到调度器时才会编译；
/// 便捷构造函数会立即编译，非法参数直接返回错误。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    schedule: String,
}

impl Entry {
    pub fn new(schedule: impl Into<String>) -> Self {
        Self {
            schedule: schedule.into(),
        }
    }

    pub fn schedule(&self) -> &str {
        &self.schedule
    }

    pub fn compile(&self) -> CabbageResult<CronSchedule> {
        CronSchedule::parse(&self.schedule)
    }

    /// 每 `minute` 分钟：`*/minute * * * *`
    pub fn every_minute(minute: i32) -> CabbageResult<Self> {
        check_step("minute", minute, 59)?;
        Self::compiled(format!("*/{minute} * * * *"))
    }

    /// 每 `hour` 小时的整点：`0 */hour * * *`
    pub fn every_hour(hour: i32) -> CabbageResult<Self> {
        check_step("hour", hour, 23)?;
        Self::compiled(format!("0 */{hour} * * *"))
    }

    /// 每 `hour` 小时的第 `minute` 分钟：`minute */hour * * *`
    pub fn every_hour_at_minute(minute: i32, hour: i32) -> CabbageResult<Self> {
        check_step("hour", hour, 23)?;
        if !(0..=59).contains(&minute) {
            return Err(CabbageError::InvalidEntry(format!(
                "minute必须在0-59之间，当前值: {minute}"
            )));
        }
        Self::compiled(format!("{minute} */{hour} * * *"))
    }

    /// 由各字段的取值列表生成条目，空列表表示通配
    pub fn every(
        minutes: &[i32],
        hours: &[i32],
        days: &[i32],
        months: &[i32],
        weekdays: &[i32],
    ) -> CabbageResult<Self> {
        let schedule = [minutes, hours, days, months, weekdays]
            .iter()
            .map(|values| join_values(values))
            .collect::<Vec<_>>()
            .join(" ");
        Self::compiled(schedule)
    }

    fn compiled(schedule: String) -> CabbageResult<Self> {
        let entry = Self::new(schedule);
        entry.compile()?;
        Ok(entry)
    }
}

impl From<&str> for Entry {
    fn from(schedule: &str) -> Self {
        Self::new(schedule)
    }
}

impl From<String> for Entry {
    fn from(schedule: String) -> Self {
        Self::new(schedule)
    }
}

impl fmt::Display for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.schedule)
    }
}

fn check_step(name: &str, value: i32, max: i32) -> CabbageResult<()> {
    if value < 1 || value > max {
        return Err(CabbageError::InvalidEntry(format!(
            "{name}必须在1-{max}之间，当前值: {value}"
        )));
    }
    Ok(())
}

fn join_values(values: &[i32]) -> String {
    if values.is_empty() {
        return "*".to_string();
    }
    values
        .iter()
        .map(i32::to_string)
        .collect::<Vec<_>>()
        .join(",")
}
