//! Minute-resolution cron scheduling
//!
//! Parses standard five-field cron expressions (minute, hour, day-of-month,
//! month, day-of-week) plus the usual `@` macro aliases, and runs registered
//! jobs from a single ticker aligned to the wall-clock minute. Each firing
//! job runs on its own task; the scheduler never waits for a job to finish,
//! so slow jobs may overlap their next fire.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use chrono::{Datelike, Local, Timelike};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

#[derive(Debug, Error, PartialEq)]
pub enum ScheduleError {
    #[error("cron expression must have 5 fields, got {0}")]
    FieldCount(usize),

    #[error("invalid cron field '{0}'")]
    InvalidField(String),

    #[error("cron value {value} out of range {min}-{max}")]
    OutOfRange { value: u32, min: u32, max: u32 },

    #[error("duplicate job id '{0}'")]
    DuplicateJob(String),

    #[error("scheduler already started")]
    AlreadyStarted,
}

/// Expand a macro alias to its five-field equivalent.
fn expand_macro(expr: &str) -> Option<&'static str> {
    match expr {
        "@yearly" | "@annually" => Some("0 0 1 1 *"),
        "@monthly" => Some("0 0 1 * *"),
        "@weekly" => Some("0 0 * * 0"),
        "@daily" | "@midnight" => Some("0 0 * * *"),
        "@hourly" => Some("0 * * * *"),
        "@minutely" => Some("* * * * *"),
        _ => None,
    }
}

/// A parsed cron expression. Each field is a bitmask of permitted values.
#[derive(Debug, Clone, PartialEq)]
pub struct Schedule {
    minutes: u64,
    hours: u64,
    days_of_month: u64,
    months: u64,
    days_of_week: u64,
}

impl Schedule {
    /// Parse a five-field expression or macro alias. Validation is strict:
    /// any malformed field fails the whole expression.
    pub fn parse(expr: &str) -> Result<Self, ScheduleError> {
        let expr = expand_macro(expr.trim()).unwrap_or(expr).trim();

        let fields: Vec<&str> = expr.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(ScheduleError::FieldCount(fields.len()));
        }

        Ok(Self {
            minutes: parse_field(fields[0], 0, 59)?,
            hours: parse_field(fields[1], 0, 23)?,
            days_of_month: parse_field(fields[2], 1, 31)?,
            months: parse_field(fields[3], 1, 12)?,
            days_of_week: parse_dow_field(fields[4])?,
        })
    }

    /// Whether the schedule matches the given wall-clock minute.
    pub fn matches(&self, minute: u32, hour: u32, day: u32, month: u32, weekday: u32) -> bool {
        bit(self.minutes, minute)
            && bit(self.hours, hour)
            && bit(self.days_of_month, day)
            && bit(self.months, month)
            && bit(self.days_of_week, weekday)
    }

    /// Match against a local timestamp.
    pub fn matches_time(&self, t: &chrono::DateTime<Local>) -> bool {
        self.matches(
            t.minute(),
            t.hour(),
            t.day(),
            t.month(),
            t.weekday().num_days_from_sunday(),
        )
    }
}

fn bit(mask: u64, value: u32) -> bool {
    mask & (1u64 << value) != 0
}

fn parse_dow_field(field: &str) -> Result<u64, ScheduleError> {
    // 7 is accepted as an alias for Sunday
    let mut mask = parse_field(field, 0, 7)?;
    if bit(mask, 7) {
        mask = (mask & !(1u64 << 7)) | 1;
    }
    Ok(mask)
}

fn parse_field(field: &str, min: u32, max: u32) -> Result<u64, ScheduleError> {
    if field.is_empty() {
        return Err(ScheduleError::InvalidField(field.to_string()));
    }

    let mut mask = 0u64;
    for term in field.split(',') {
        mask |= parse_term(term, min, max)?;
    }
    Ok(mask)
}

fn parse_term(term: &str, min: u32, max: u32) -> Result<u64, ScheduleError> {
    let (range_part, step) = match term.split_once('/') {
        Some((range, step_str)) => {
            let step: u32 = step_str
                .parse()
                .map_err(|_| ScheduleError::InvalidField(term.to_string()))?;
            if step == 0 {
                return Err(ScheduleError::InvalidField(term.to_string()));
            }
            (range, step)
        }
        None => (term, 1),
    };

    let (lo, hi) = if range_part == "*" {
        (min, max)
    } else if let Some((lo_str, hi_str)) = range_part.split_once('-') {
        let lo = parse_value(lo_str, min, max)?;
        let hi = parse_value(hi_str, min, max)?;
        if lo > hi {
            return Err(ScheduleError::InvalidField(term.to_string()));
        }
        (lo, hi)
    } else {
        let value = parse_value(range_part, min, max)?;
        // A bare value with a step (e.g. "5/2") is not part of the grammar
        if term.contains('/') {
            return Err(ScheduleError::InvalidField(term.to_string()));
        }
        (value, value)
    };

    let mut mask = 0u64;
    let mut v = lo;
    while v <= hi {
        mask |= 1u64 << v;
        v += step;
    }
    Ok(mask)
}

fn parse_value(s: &str, min: u32, max: u32) -> Result<u32, ScheduleError> {
    let value: u32 = s
        .parse()
        .map_err(|_| ScheduleError::InvalidField(s.to_string()))?;
    if value < min || value > max {
        return Err(ScheduleError::OutOfRange {
            value,
            min,
            max,
        });
    }
    Ok(value)
}

/// Async job body spawned on every matching minute.
pub type JobFn = Arc<dyn Fn() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

struct Job {
    id: String,
    schedule: Schedule,
    action: JobFn,
}

/// Fires registered jobs once per matching wall-clock minute.
///
/// Jobs are registered before `start`; the job table is immutable while the
/// ticker runs. `stop` cancels future fires but does not preempt actions
/// already running.
pub struct Scheduler {
    jobs: Vec<Job>,
    delay: Duration,
    shutdown_tx: Option<watch::Sender<bool>>,
    handle: Option<JoinHandle<()>>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            jobs: Vec::new(),
            delay: Duration::ZERO,
            shutdown_tx: None,
            handle: None,
        }
    }

    /// Gate the first fire after `start` by `delay`.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Register a job under a unique id. Fails on an invalid expression or
    /// a duplicate id.
    pub fn add<F, Fut>(&mut self, id: &str, expr: &str, action: F) -> Result<(), ScheduleError>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if self.handle.is_some() {
            return Err(ScheduleError::AlreadyStarted);
        }
        if self.jobs.iter().any(|j| j.id == id) {
            return Err(ScheduleError::DuplicateJob(id.to_string()));
        }

        let schedule = Schedule::parse(expr)?;
        let action: JobFn = Arc::new(move || Box::pin(action()));

        self.jobs.push(Job {
            id: id.to_string(),
            schedule,
            action,
        });

        Ok(())
    }

    pub fn job_count(&self) -> usize {
        self.jobs.len()
    }

    /// Start the ticker. Fires once per minute, aligned to the minute
    /// boundary, spawning every matching job on a fresh task.
    pub fn start(&mut self) -> Result<(), ScheduleError> {
        if self.handle.is_some() {
            return Err(ScheduleError::AlreadyStarted);
        }

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        self.shutdown_tx = Some(shutdown_tx);

        let jobs: Arc<Vec<(String, Schedule, JobFn)>> = Arc::new(
            self.jobs
                .iter()
                .map(|j| (j.id.clone(), j.schedule.clone(), j.action.clone()))
                .collect(),
        );
        let delay = self.delay;

        let handle = tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            info!(jobs = jobs.len(), "Scheduler started");

            loop {
                // Align the next tick to the upcoming minute boundary
                let now = Local::now();
                let to_boundary =
                    Duration::from_secs(60 - u64::from(now.second())).max(Duration::from_secs(1));

                tokio::select! {
                    _ = tokio::time::sleep(to_boundary) => {}
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            info!("Scheduler shutting down");
                            return;
                        }
                    }
                }

                let tick = Local::now();
                for (id, schedule, action) in jobs.iter() {
                    if schedule.matches_time(&tick) {
                        debug!(job = %id, "Firing scheduled job");
                        let action = action.clone();
                        tokio::spawn(async move {
                            action().await;
                        });
                    }
                }
            }
        });

        self.handle = Some(handle);
        Ok(())
    }

    /// Cancel future fires. Running actions are left to complete.
    pub fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(true);
        }
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_wildcard() {
        let s = Schedule::parse("* * * * *").unwrap();
        assert!(s.matches(0, 0, 1, 1, 0));
        assert!(s.matches(59, 23, 31, 12, 6));
    }

    #[test]
    fn test_parse_fixed_values() {
        let s = Schedule::parse("30 14 1 6 2").unwrap();
        assert!(s.matches(30, 14, 1, 6, 2));
        assert!(!s.matches(31, 14, 1, 6, 2));
        assert!(!s.matches(30, 15, 1, 6, 2));
    }

    #[test]
    fn test_parse_range_and_step() {
        let s = Schedule::parse("10-20/5 * * * *").unwrap();
        assert!(s.matches(10, 0, 1, 1, 0));
        assert!(s.matches(15, 0, 1, 1, 0));
        assert!(s.matches(20, 0, 1, 1, 0));
        assert!(!s.matches(11, 0, 1, 1, 0));
        assert!(!s.matches(25, 0, 1, 1, 0));
    }

    #[test]
    fn test_parse_wildcard_step() {
        let s = Schedule::parse("*/15 * * * *").unwrap();
        for minute in [0, 15, 30, 45] {
            assert!(s.matches(minute, 0, 1, 1, 0));
        }
        assert!(!s.matches(10, 0, 1, 1, 0));
    }

    #[test]
    fn test_parse_list() {
        let s = Schedule::parse("1,2,3 0,12 * * *").unwrap();
        assert!(s.matches(2, 0, 1, 1, 0));
        assert!(s.matches(3, 12, 1, 1, 0));
        assert!(!s.matches(4, 0, 1, 1, 0));
        assert!(!s.matches(2, 6, 1, 1, 0));
    }

    #[test]
    fn test_macros() {
        assert_eq!(
            Schedule::parse("@daily").unwrap(),
            Schedule::parse("0 0 * * *").unwrap()
        );
        assert_eq!(
            Schedule::parse("@midnight").unwrap(),
            Schedule::parse("@daily").unwrap()
        );
        assert_eq!(
            Schedule::parse("@yearly").unwrap(),
            Schedule::parse("0 0 1 1 *").unwrap()
        );
        assert_eq!(
            Schedule::parse("@annually").unwrap(),
            Schedule::parse("@yearly").unwrap()
        );
        assert_eq!(
            Schedule::parse("@minutely").unwrap(),
            Schedule::parse("* * * * *").unwrap()
        );
    }

    #[test]
    fn test_daily_matches_one_minute_per_day() {
        let s = Schedule::parse("@daily").unwrap();
        let mut matches = 0;
        for hour in 0..24 {
            for minute in 0..60 {
                if s.matches(minute, hour, 5, 3, 4) {
                    matches += 1;
                }
            }
        }
        assert_eq!(matches, 1);
        assert!(s.matches(0, 0, 5, 3, 4));
    }

    #[test]
    fn test_sunday_alias() {
        let s = Schedule::parse("* * * * 7").unwrap();
        assert!(s.matches(0, 0, 1, 1, 0));
        assert!(!s.matches(0, 0, 1, 1, 1));
    }

    #[test]
    fn test_invalid_expressions() {
        assert!(Schedule::parse("").is_err());
        assert!(Schedule::parse("* * * *").is_err());
        assert!(Schedule::parse("* * * * * *").is_err());
        assert!(Schedule::parse("60 * * * *").is_err());
        assert!(Schedule::parse("* 24 * * *").is_err());
        assert!(Schedule::parse("* * 0 * *").is_err());
        assert!(Schedule::parse("* * * 13 *").is_err());
        assert!(Schedule::parse("* * * * 8").is_err());
        assert!(Schedule::parse("a * * * *").is_err());
        assert!(Schedule::parse("5-2 * * * *").is_err());
        assert!(Schedule::parse("*/0 * * * *").is_err());
        assert!(Schedule::parse("@weekly-ish").is_err());
    }

    #[test]
    fn test_add_validates_expression() {
        let mut scheduler = Scheduler::new();
        assert!(scheduler.add("ok", "* * * * *", || async {}).is_ok());
        assert!(scheduler.add("bad", "not a cron", || async {}).is_err());
        assert_eq!(scheduler.job_count(), 1);
    }

    #[test]
    fn test_add_rejects_duplicate_id() {
        let mut scheduler = Scheduler::new();
        scheduler.add("job", "* * * * *", || async {}).unwrap();
        assert_eq!(
            scheduler.add("job", "@daily", || async {}),
            Err(ScheduleError::DuplicateJob("job".to_string()))
        );
    }

    #[tokio::test]
    async fn test_start_stop() {
        let mut scheduler = Scheduler::new();
        scheduler.add("noop", "* * * * *", || async {}).unwrap();

        scheduler.start().unwrap();
        assert!(matches!(
            scheduler.start(),
            Err(ScheduleError::AlreadyStarted)
        ));
        scheduler.stop();
    }

    #[tokio::test]
    async fn test_add_after_start_fails() {
        let mut scheduler = Scheduler::new();
        scheduler.start().unwrap();
        assert!(matches!(
            scheduler.add("late", "* * * * *", || async {}),
            Err(ScheduleError::AlreadyStarted)
        ));
        scheduler.stop();
    }
}
