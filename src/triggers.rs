//! Built-in triggers.
//!
//! - `NOW` runs the task once, right away.
//! - `AT` runs it daily at a local time, optionally restricted to some days
//!   of the week and months (`t-at-time = "HH:MM[:days[:months]]"`).
//! - `PERIOD` runs it repeatedly, one ISO-8601 period after the previous
//!   run completed (`t-period`, e.g. `P1D`, `PT6H`).
//!
//! Every activated instance owns one background tokio task; deactivating
//! the instance aborts it.

use async_trait::async_trait;
use chrono::{
    DateTime, Datelike, Duration, Local, Months, NaiveDate, NaiveDateTime, NaiveTime, Utc,
};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::error::{HarvestError, Result};
use crate::models::{TaskDefinition, TriggerDefinition};
use crate::template::{Argument, ArgumentKind, UiTemplate};
use crate::traits::{Descriptor, Trigger, TriggerContext, TriggerInstance};

pub const NOW: &str = "NOW";
pub const AT: &str = "AT";
pub const PERIOD: &str = "PERIOD";

pub const P_AT_TIME: &str = "t-at-time";
pub const P_PERIOD: &str = "t-period";

fn require_trigger_type(def: &TriggerDefinition, expected: &str) -> Result<()> {
    if def.trigger_type != expected {
        return Err(HarvestError::invalid(format!(
            "trigger type '{}' does not match '{}'",
            def.trigger_type, expected
        )));
    }
    Ok(())
}

fn property<'a>(def: &'a TriggerDefinition, key: &str) -> Result<&'a str> {
    def.properties
        .get(key)
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| HarvestError::invalid(format!("missing trigger property '{}'", key)))
}

fn task_of(def: &TriggerDefinition) -> Result<TaskDefinition> {
    def.task_definition
        .clone()
        .ok_or_else(|| HarvestError::invalid(format!("{} trigger has no task", def.trigger_type)))
}

/// Background job of an activated trigger.
#[derive(Default)]
struct Job(Option<JoinHandle<()>>);

impl Job {
    fn start<F>(&mut self, fut: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        self.stop();
        self.0 = Some(tokio::spawn(fut));
    }

    fn stop(&mut self) {
        if let Some(handle) = self.0.take() {
            handle.abort();
        }
    }
}

impl Drop for Job {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Submit `task` and wait for the run to complete. Submission failures
/// are logged.
async fn run_once(ctx: &dyn TriggerContext, task: &TaskDefinition) {
    match ctx.submit(task).await {
        Ok(process) => process.wait().await,
        Err(e) => error!(task = %task, error = %e, "error submitting task"),
    }
}

async fn sleep_until(at: DateTime<Utc>) {
    let delay = (at - Utc::now()).to_std().unwrap_or_default();
    tokio::time::sleep(delay).await;
}

// ═══════════════════════════════════════════════════════════════════════
// NOW
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Default)]
pub struct NowTrigger;

impl Descriptor for NowTrigger {
    fn entity_type(&self) -> &str {
        NOW
    }

    fn template(&self) -> UiTemplate {
        UiTemplate::new(NOW, "Now", Vec::new())
    }
}

impl Trigger for NowTrigger {
    fn create_instance(&self, def: &TriggerDefinition) -> Result<Box<dyn TriggerInstance>> {
        require_trigger_type(def, NOW)?;
        Ok(Box::new(NowInstance {
            task: task_of(def)?,
            def: def.clone(),
            job: Job::default(),
        }))
    }
}

struct NowInstance {
    def: TriggerDefinition,
    task: TaskDefinition,
    job: Job,
}

#[async_trait]
impl TriggerInstance for NowInstance {
    fn trigger_definition(&self) -> &TriggerDefinition {
        &self.def
    }

    async fn activate(&mut self, ctx: Arc<dyn TriggerContext>) -> Result<()> {
        let task = self.task.clone();
        info!(task = %task, "task is being submitted now");
        self.job.start(async move { run_once(ctx.as_ref(), &task).await });
        Ok(())
    }

    async fn deactivate(&mut self) {
        self.job.stop();
    }
}

// ═══════════════════════════════════════════════════════════════════════
// AT
// ═══════════════════════════════════════════════════════════════════════

/// Daily schedule parsed from `HH:MM[:days-of-week[:months]]`.
///
/// Days of the week run from 1 (Sunday) to 7 (Saturday), months from 1 to
/// 12; both are comma separated lists and `*` means any.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AtSchedule {
    pub time: NaiveTime,
    pub days: Option<Vec<u32>>,
    pub months: Option<Vec<u32>>,
}

impl AtSchedule {
    /// Whether runs are allowed on `date`.
    pub fn matches(&self, date: NaiveDate) -> bool {
        let day = date.weekday().number_from_sunday();
        self.days.as_ref().map_or(true, |d| d.contains(&day))
            && self.months.as_ref().map_or(true, |m| m.contains(&date.month()))
    }

    /// First scheduled local time strictly after `now`, looking up to a
    /// little over a year ahead.
    pub fn next_after(&self, now: NaiveDateTime) -> Option<NaiveDateTime> {
        (0..=400)
            .filter_map(|offset| now.date().checked_add_signed(Duration::days(offset)))
            .filter(|date| self.matches(*date))
            .map(|date| date.and_time(self.time))
            .find(|at| *at > now)
    }

    fn next_run(&self) -> Option<DateTime<Utc>> {
        let mut now = Local::now().naive_local();
        // Skip local times that fall into a DST gap.
        for _ in 0..8 {
            let at = self.next_after(now)?;
            if let Some(local) = at.and_local_timezone(Local).earliest() {
                return Some(local.with_timezone(&Utc));
            }
            now = at;
        }
        None
    }
}

fn parse_list(field: &str, max: u32, what: &str) -> Option<Vec<u32>> {
    if field.trim() == "*" {
        return None;
    }
    let values = field
        .split(',')
        .filter_map(|s| match s.trim().parse::<u32>() {
            Ok(n) if (1..=max).contains(&n) => Some(n),
            _ => {
                warn!(value = s, "ignoring invalid {}", what);
                None
            }
        })
        .collect();
    Some(values)
}

impl FromStr for AtSchedule {
    type Err = HarvestError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || HarvestError::invalid(format!("invalid {} '{}'", P_AT_TIME, s));
        let parts: Vec<&str> = s.trim().split(':').collect();
        if parts.len() < 2 || parts.len() > 4 {
            return Err(invalid());
        }
        let hour: u32 = parts[0].trim().parse().map_err(|_| invalid())?;
        let minute: u32 = parts[1].trim().parse().map_err(|_| invalid())?;
        let time = NaiveTime::from_hms_opt(hour, minute, 0).ok_or_else(invalid)?;
        Ok(Self {
            time,
            days: parts.get(2).and_then(|d| parse_list(d, 7, "day of the week")),
            months: parts.get(3).and_then(|m| parse_list(m, 12, "month")),
        })
    }
}

#[derive(Debug, Default)]
pub struct AtTrigger;

impl Descriptor for AtTrigger {
    fn entity_type(&self) -> &str {
        AT
    }

    fn template(&self) -> UiTemplate {
        UiTemplate::new(
            AT,
            "At",
            vec![Argument::new(P_AT_TIME, "Time", ArgumentKind::Temporal).required()],
        )
    }
}

impl Trigger for AtTrigger {
    fn create_instance(&self, def: &TriggerDefinition) -> Result<Box<dyn TriggerInstance>> {
        require_trigger_type(def, AT)?;
        let schedule = property(def, P_AT_TIME)?.parse()?;
        Ok(Box::new(AtInstance {
            task: task_of(def)?,
            def: def.clone(),
            schedule,
            job: Job::default(),
        }))
    }
}

struct AtInstance {
    def: TriggerDefinition,
    task: TaskDefinition,
    schedule: AtSchedule,
    job: Job,
}

#[async_trait]
impl TriggerInstance for AtInstance {
    fn trigger_definition(&self) -> &TriggerDefinition {
        &self.def
    }

    async fn activate(&mut self, ctx: Arc<dyn TriggerContext>) -> Result<()> {
        let task = self.task.clone();
        let schedule = self.schedule.clone();
        self.job.start(async move {
            while let Some(at) = schedule.next_run() {
                info!(task = %task, at = %at.with_timezone(&Local), "task is scheduled");
                sleep_until(at).await;
                run_once(ctx.as_ref(), &task).await;
            }
            warn!(task = %task, "schedule never matches, trigger stopped");
        });
        Ok(())
    }

    async fn deactivate(&mut self) {
        self.job.stop();
    }
}

// ═══════════════════════════════════════════════════════════════════════
// PERIOD
// ═══════════════════════════════════════════════════════════════════════

/// An ISO-8601 period: `PnYnMnWnDTnHnMnS`. Years and months are calendar
/// months, the rest a fixed duration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IsoPeriod {
    pub months: u32,
    pub duration: Duration,
}

impl IsoPeriod {
    pub fn is_zero(&self) -> bool {
        self.months == 0 && self.duration.is_zero()
    }

    pub fn add_to(&self, ts: DateTime<Utc>) -> Option<DateTime<Utc>> {
        ts.checked_add_months(Months::new(self.months))?
            .checked_add_signed(self.duration)
    }
}

impl FromStr for IsoPeriod {
    type Err = HarvestError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || HarvestError::invalid(format!("invalid {} '{}'", P_PERIOD, s));
        let upper = s.trim().to_ascii_uppercase();
        let body = upper.strip_prefix('P').ok_or_else(invalid)?;
        if body.is_empty() {
            return Err(invalid());
        }

        let mut period = IsoPeriod {
            months: 0,
            duration: Duration::zero(),
        };
        let mut in_time = false;
        let mut number = String::new();
        for c in body.chars() {
            if c.is_ascii_digit() {
                number.push(c);
                continue;
            }
            if c == 'T' {
                if in_time || !number.is_empty() {
                    return Err(invalid());
                }
                in_time = true;
                continue;
            }
            let n: i64 = number.parse().map_err(|_| invalid())?;
            number.clear();
            let part = match (in_time, c) {
                (false, 'Y') | (false, 'M') => {
                    let months = if c == 'Y' { n.checked_mul(12) } else { Some(n) };
                    let months = months
                        .and_then(|m| u32::try_from(m).ok())
                        .and_then(|m| period.months.checked_add(m))
                        .ok_or_else(invalid)?;
                    period.months = months;
                    continue;
                }
                (false, 'W') => Duration::try_weeks(n),
                (false, 'D') => Duration::try_days(n),
                (true, 'H') => Duration::try_hours(n),
                (true, 'M') => Duration::try_minutes(n),
                (true, 'S') => Duration::try_seconds(n),
                _ => return Err(invalid()),
            };
            period.duration = part
                .and_then(|part| period.duration.checked_add(&part))
                .ok_or_else(invalid)?;
        }
        if !number.is_empty() {
            return Err(invalid());
        }
        Ok(period)
    }
}

impl fmt::Display for IsoPeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} month(s) + {}s", self.months, self.duration.num_seconds())
    }
}

#[derive(Debug, Default)]
pub struct PeriodTrigger;

impl Descriptor for PeriodTrigger {
    fn entity_type(&self) -> &str {
        PERIOD
    }

    fn template(&self) -> UiTemplate {
        UiTemplate::new(
            PERIOD,
            "Periodical",
            vec![Argument::new(P_PERIOD, "Period", ArgumentKind::Periodical).required()],
        )
    }
}

impl Trigger for PeriodTrigger {
    fn create_instance(&self, def: &TriggerDefinition) -> Result<Box<dyn TriggerInstance>> {
        require_trigger_type(def, PERIOD)?;
        let period: IsoPeriod = property(def, P_PERIOD)?.parse()?;
        if period.is_zero() {
            return Err(HarvestError::invalid(format!("{} must not be zero", P_PERIOD)));
        }
        if period.add_to(Utc::now()).is_none() {
            return Err(HarvestError::invalid(format!(
                "{} reaches past the supported date range ({})",
                P_PERIOD, period
            )));
        }
        Ok(Box::new(PeriodInstance {
            task: task_of(def)?,
            def: def.clone(),
            period,
            job: Job::default(),
        }))
    }
}

struct PeriodInstance {
    def: TriggerDefinition,
    task: TaskDefinition,
    period: IsoPeriod,
    job: Job,
}

#[async_trait]
impl TriggerInstance for PeriodInstance {
    fn trigger_definition(&self) -> &TriggerDefinition {
        &self.def
    }

    async fn activate(&mut self, ctx: Arc<dyn TriggerContext>) -> Result<()> {
        let task = self.task.clone();
        let period = self.period;
        let first = match ctx.last_harvest().await {
            Some(last) => period.add_to(last),
            None => Some(Utc::now()),
        };
        self.job.start(async move {
            let mut next = first;
            while let Some(at) = next {
                info!(task = %task, at = %at.with_timezone(&Local), "task is scheduled");
                sleep_until(at).await;
                run_once(ctx.as_ref(), &task).await;
                next = period.add_to(Utc::now());
            }
            warn!(task = %task, period = %period, "period overflows, trigger stopped");
        });
        Ok(())
    }

    async fn deactivate(&mut self) {
        self.job.stop();
    }
}
