use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, TimeZone, Timelike};

use cabbage_core::{CabbageError, CabbageResult};

#[derive(Debug, Clone, Copy)]
struct FieldBounds {
    name: &'static str,
    min: u32,
    max: u32,
}

const MINUTE: FieldBounds = FieldBounds { name: "分钟", min: 0, max: 59 };
const HOUR: FieldBounds = FieldBounds { name: "小时", min: 0, max: 23 };
const DAY: FieldBounds = FieldBounds { name: "日", min: 1, max: 31 };
const MONTH: FieldBounds = FieldBounds { name: "月", min: 1, max: 12 };
const WEEKDAY: FieldBounds = FieldBounds { name: "星期", min: 0, max: 6 };

impl FieldBounds {
    fn full(&self) -> BTreeSet<u32> {
        (self.min..=self.max).collect()
    }

    fn size(&self) -> usize {
        (self.max - self.min + 1) as usize
    }
}

/// 调度评估时刻的五字段时间分解
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tick {
    pub minute: u32,
    pub hour: u32,
    pub day: u32,
    pub month: u32,
    /// 0 表示星期日
    pub weekday: u32,
}

impl Tick {
    pub fn from_datetime<Tz: TimeZone>(time: &DateTime<Tz>) -> Self {
        Self {
            minute: time.minute(),
            hour: time.hour(),
            day: time.day(),
            month: time.month(),
            weekday: time.weekday().num_days_from_sunday(),
        }
    }
}

/// 编译后的五字段CRON表达式（`分 时 日 月 星期`）
///
/// 日和星期按或关系组合；如果其中一个字段被显式限制而另一个是通配，
/// 通配字段的集合会在编译时清空，只由被限制的字段决定是否匹配。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSchedule {
    expression: String,
    minutes: BTreeSet<u32>,
    hours: BTreeSet<u32>,
    days: BTreeSet<u32>,
    months: BTreeSet<u32>,
    weekdays: BTreeSet<u32>,
}

impl CronSchedule {
    pub fn parse(expr: &str) -> CabbageResult<Self> {
        let parts: Vec<&str> = expr.split_whitespace().collect();
        if parts.len() != 5 {
            return Err(CabbageError::invalid_cron(
                expr,
                format!("需要5个字段（分 时 日 月 星期），实际为 {}", parts.len()),
            ));
        }

        let minutes = parse_field(parts[0], MINUTE, expr)?;
        let hours = parse_field(parts[1], HOUR, expr)?;
        let mut days = parse_field(parts[2], DAY, expr)?;
        let months = parse_field(parts[3], MONTH, expr)?;
        let mut weekdays = parse_field(parts[4], WEEKDAY, expr)?;

        let day_wildcard = days.len() == DAY.size();
        let weekday_wildcard = weekdays.len() == WEEKDAY.size();
        if !day_wildcard && weekday_wildcard {
            weekdays.clear();
        } else if day_wildcard && !weekday_wildcard {
            days.clear();
        }

        Ok(Self {
            expression: parts.join(" "),
            minutes,
            hours,
            days,
            months,
            weekdays,
        })
    }

    /// 检查给定时刻是否应该触发
    pub fn matches(&self, tick: &Tick) -> bool {
        self.minutes.contains(&tick.minute)
            && self.hours.contains(&tick.hour)
            && (self.days.contains(&tick.day) || self.weekdays.contains(&tick.weekday))
            && self.months.contains(&tick.month)
    }

    pub fn matches_time<Tz: TimeZone>(&self, time: &DateTime<Tz>) -> bool {
        self.matches(&Tick::from_datetime(time))
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    pub fn minutes(&self) -> &BTreeSet<u32> {
        &self.minutes
    }

    pub fn hours(&self) -> &BTreeSet<u32> {
        &self.hours
    }

    pub fn days(&self) -> &BTreeSet<u32> {
        &self.days
    }

    pub fn months(&self) -> &BTreeSet<u32> {
        &self.months
    }

    pub fn weekdays(&self) -> &BTreeSet<u32> {
        &self.weekdays
    }

    /// 各字段集合大小：分、时、日、月、星期
    pub fn field_sizes(&self) -> [usize; 5] {
        [
            self.minutes.len(),
            self.hours.len(),
            self.days.len(),
            self.months.len(),
            self.weekdays.len(),
        ]
    }

    /// 验证CRON表达式是否有效
    pub fn validate(expr: &str) -> CabbageResult<()> {
        Self::parse(expr).map(|_| ())
    }
}

impl FromStr for CronSchedule {
    type Err = CabbageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for CronSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.expression)
    }
}

fn parse_field(token: &str, field: FieldBounds, expr: &str) -> CabbageResult<BTreeSet<u32>> {
    if token == "*" {
        return Ok(field.full());
    }

    let values = match token.split_once('/') {
        Some((base, step)) => parse_stepped(base, step, token, field, expr)?,
        None => parse_list(token, field, expr)?,
    };

    if values.is_empty() {
        return Err(CabbageError::invalid_cron(
            expr,
            format!("{}字段 {token} 没有产生任何取值", field.name),
        ));
    }
    Ok(values)
}

/// `*/N` 或 `a-b/N`
fn parse_stepped(
    base: &str,
    step: &str,
    token: &str,
    field: FieldBounds,
    expr: &str,
) -> CabbageResult<BTreeSet<u32>> {
    let step = parse_number(step, token, field, expr)?;
    if step == 0 {
        return Err(CabbageError::invalid_cron(
            expr,
            format!("{}字段 {token} 的步长不能为0", field.name),
        ));
    }

    let (start, end) = if base == "*" {
        (field.min, field.max)
    } else if base.contains(',') {
        return Err(CabbageError::invalid_cron(
            expr,
            format!("{}字段 {token} 的步长不能作用于列表", field.name),
        ));
    } else if let Some((low, high)) = base.split_once('-') {
        parse_range(low, high, token, field, expr)?
    } else {
        return Err(CabbageError::invalid_cron(
            expr,
            format!("无法解析{}字段 {token}，步长只能用于 * 或范围", field.name),
        ));
    };

    Ok((start..=end).step_by(step as usize).collect())
}

/// 逗号分隔的整数和 `a-b` 范围
fn parse_list(token: &str, field: FieldBounds, expr: &str) -> CabbageResult<BTreeSet<u32>> {
    let mut values = BTreeSet::new();
    for part in token.split(',') {
        if let Some((low, high)) = part.split_once('-') {
            let (start, end) = parse_range(low, high, token, field, expr)?;
            values.extend(start..=end);
        } else {
            let value = parse_number(part, token, field, expr)?;
            check_bounds(value, token, field, expr)?;
            values.insert(value);
        }
    }
    Ok(values)
}

fn parse_range(
    low: &str,
    high: &str,
    token: &str,
    field: FieldBounds,
    expr: &str,
) -> CabbageResult<(u32, u32)> {
    let start = parse_number(low, token, field, expr)?;
    let end = parse_number(high, token, field, expr)?;
    check_bounds(start, token, field, expr)?;
    check_bounds(end, token, field, expr)?;
    if start > end {
        return Err(CabbageError::invalid_cron(
            expr,
            format!("{}字段 {token} 的范围起点大于终点", field.name),
        ));
    }
    Ok((start, end))
}

fn parse_number(text: &str, token: &str, field: FieldBounds, expr: &str) -> CabbageResult<u32> {
    if text.is_empty() || !text.bytes().all(|b| b.is_ascii_digit()) {
        return Err(CabbageError::invalid_cron(
            expr,
            format!("无法解析{}字段 {token} 中的 {text:?}", field.name),
        ));
    }
    text.parse::<u32>().map_err(|_| {
        CabbageError::invalid_cron(
            expr,
            format!("{}字段 {token} 中的 {text} 超出范围 {}-{}", field.name, field.min, field.max),
        )
    })
}

fn check_bounds(value: u32, token: &str, field: FieldBounds, expr: &str) -> CabbageResult<()> {
    if value < field.min || value > field.max {
        return Err(CabbageError::invalid_cron(
            expr,
            format!(
                "{}字段 {token} 中的 {value} 超出范围 {}-{}",
                field.name, field.min, field.max
            ),
        ));
    }
    Ok(())
}
