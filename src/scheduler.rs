//! Cooperative wall-clock scheduler.
//!
//! Tasks recur hourly (top of hour), weekly or monthly (local midnight).
//! Every task owns its loop task, and every firing runs in a freshly
//! spawned task, so one long-running job can never block the others or its
//! own cadence. Failures inside a task are logged and do not affect the
//! scheduler loop.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Datelike, Duration as ChronoDuration, Local, NaiveDate, TimeZone, Timelike, Weekday};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::broadcast;

use crate::error::{Error, Result};

pub type TaskFn = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Cadence {
    Hourly,
    Weekly(Weekday),
    Monthly(u32),
}

impl Cadence {
    /// Time until the next firing, strictly in the future of `now`.
    fn until_next(&self, now: DateTime<Local>) -> Duration {
        let next = match self {
            Cadence::Hourly => {
                let truncated = now
                    .with_minute(0)
                    .and_then(|t| t.with_second(0))
                    .and_then(|t| t.with_nanosecond(0))
                    .unwrap_or(now);
                truncated + ChronoDuration::hours(1)
            }
            Cadence::Weekly(weekday) => {
                let today = now.date_naive();
                let mut date = today;
                loop {
                    date = date.succ_opt().unwrap_or(date);
                    if date.weekday() == *weekday {
                        break;
                    }
                }
                local_midnight(date, now)
            }
            Cadence::Monthly(day) => {
                let mut year = now.year();
                let mut month = now.month();
                loop {
                    (year, month) = if month == 12 { (year + 1, 1) } else { (year, month + 1) };
                    if let Some(date) = NaiveDate::from_ymd_opt(year, month, *day) {
                        break local_midnight(date, now);
                    }
                }
            }
        };
        (next - now).to_std().unwrap_or(Duration::ZERO)
    }
}

fn local_midnight(date: NaiveDate, fallback: DateTime<Local>) -> DateTime<Local> {
    date.and_hms_opt(0, 0, 0)
        .and_then(|naive| Local.from_local_datetime(&naive).single())
        .unwrap_or(fallback)
}

struct TaskEntry {
    run: TaskFn,
    handle: tokio::task::JoinHandle<()>,
}

pub struct Scheduler {
    tasks: Mutex<HashMap<String, TaskEntry>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl Scheduler {
    pub fn new(shutdown_tx: broadcast::Sender<()>) -> Self {
        Self {
            tasks: Mutex::new(HashMap::new()),
            shutdown_tx,
        }
    }

    pub fn add_hourly_task(&self, task_id: &str, run: TaskFn) -> Result<()> {
        self.add_task(task_id, Cadence::Hourly, run)
    }

    pub fn add_weekly_task(&self, task_id: &str, day_of_week: Weekday, run: TaskFn) -> Result<()> {
        self.add_task(task_id, Cadence::Weekly(day_of_week), run)
    }

    pub fn add_monthly_task(&self, task_id: &str, day_of_month: u32, run: TaskFn) -> Result<()> {
        if !(1..=31).contains(&day_of_month) {
            return Err(Error::Scheduler(format!(
                "Invalid day of month: {}",
                day_of_month
            )));
        }
        self.add_task(task_id, Cadence::Monthly(day_of_month), run)
    }

    fn add_task(&self, task_id: &str, cadence: Cadence, run: TaskFn) -> Result<()> {
        let mut tasks = self.tasks.lock();
        if tasks.contains_key(task_id) {
            return Err(Error::Scheduler(format!(
                "Task id '{}' already registered",
                task_id
            )));
        }

        let loop_run = run.clone();
        let loop_id = task_id.to_string();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let handle = tokio::spawn(async move {
            loop {
                let delay = cadence.until_next(Local::now());
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        tracing::info!(task = %loop_id, "Scheduled task loop shutting down");
                        break;
                    }
                    _ = tokio::time::sleep(delay) => {
                        fire(&loop_id, &loop_run);
                    }
                }
            }
        });

        tasks.insert(task_id.to_string(), TaskEntry { run, handle });
        tracing::info!(task = task_id, ?cadence, "Scheduled task registered");
        Ok(())
    }

    /// One-shot trigger of a registered task after a delay.
    pub fn execute_task(&self, task_id: &str, delay: Duration) -> Result<()> {
        let tasks = self.tasks.lock();
        let entry = tasks
            .get(task_id)
            .ok_or_else(|| Error::Scheduler(format!("Unknown task id '{}'", task_id)))?;
        let run = entry.run.clone();
        let id = task_id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            fire(&id, &run);
        });
        Ok(())
    }

    /// Aborts all task loops. Firing tasks already spawned run to completion.
    pub fn stop(&self) {
        for (id, entry) in self.tasks.lock().drain() {
            entry.handle.abort();
            tracing::debug!(task = %id, "Scheduled task loop aborted");
        }
    }
}

/// Each firing gets its own task; a panic inside is confined to it.
fn fire(task_id: &str, run: &TaskFn) {
    tracing::info!(task = task_id, "Scheduled task firing");
    let future = run();
    let id = task_id.to_string();
    tokio::spawn(async move {
        future.await;
        tracing::debug!(task = %id, "Scheduled task finished");
    });
}
