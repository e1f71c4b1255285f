//! Task scheduler: a polling loop that materializes due tasks into agent
//! invocations. `next_run` is recomputed and persisted before dispatch so a
//! crash can never double-fire; `once` tasks are deleted at claim time, which
//! is their at-most-once commit.

use crate::queue::GroupQueue;
use crate::store::{now_timestamp, ScheduleKind, Store, Task};
use crate::supervisor::Supervisor;
use anyhow::Result;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Compute the first `next_run` for a new task, validating the schedule.
///
/// Rejections carry the reason; invalid schedules never reach the store.
pub fn compute_initial_next_run(
    kind: ScheduleKind,
    value: &str,
    now: DateTime<Utc>,
    tz: Tz,
) -> Result<DateTime<Utc>> {
    match kind {
        ScheduleKind::Cron => next_cron_occurrence(value, now, tz),
        ScheduleKind::Interval => {
            let ms = parse_interval_ms(value)?;
            Ok(now + chrono::Duration::milliseconds(ms))
        }
        ScheduleKind::Once => {
            let at = DateTime::parse_from_rfc3339(value)
                .map_err(|error| {
                    crate::error::SchedulerError::InvalidTimestamp(format!("{value}: {error}"))
                })?
                .with_timezone(&Utc);
            Ok(at)
        }
    }
}

fn parse_interval_ms(value: &str) -> Result<i64> {
    let ms: i64 = value.trim().parse().map_err(|_| {
        crate::error::SchedulerError::InvalidInterval(format!("not an integer: {value}"))
    })?;
    if ms <= 0 {
        return Err(
            crate::error::SchedulerError::InvalidInterval(format!("must be positive: {value}"))
                .into(),
        );
    }
    Ok(ms)
}

/// Next occurrence strictly after `after`, evaluated in the configured
/// timezone.
fn next_cron_occurrence(expression: &str, after: DateTime<Utc>, tz: Tz) -> Result<DateTime<Utc>> {
    let normalized = normalize_expression(expression)?;
    let schedule = Schedule::from_str(&normalized).map_err(|error| {
        crate::error::SchedulerError::InvalidCron(format!("{expression}: {error}"))
    })?;
    schedule
        .after(&after.with_timezone(&tz))
        .next()
        .map(|at| at.with_timezone(&Utc))
        .ok_or_else(|| {
            crate::error::SchedulerError::InvalidCron(format!(
                "no future occurrence for: {expression}"
            ))
            .into()
        })
}

/// The cron parser requires a leading seconds field. Callers hand in plain
/// five-field crontab expressions, so those get second `0` prepended; six- or
/// seven-field forms already carry seconds (and optionally a year) and pass
/// through untouched.
fn normalize_expression(expression: &str) -> Result<String> {
    let expression = expression.trim();
    let fields = expression.split_whitespace().count();

    if fields == 5 {
        return Ok(format!("0 {expression}"));
    }
    if fields == 6 || fields == 7 {
        return Ok(expression.to_string());
    }
    Err(crate::error::SchedulerError::InvalidCron(format!(
        "{expression} (expected 5, 6, or 7 fields, got {fields})"
    ))
    .into())
}

/// Claim a due task: persist the recomputed `next_run` (or delete a `once`
/// task) before any dispatch happens. Returns false when the task could not
/// be claimed and must not run.
fn claim_due_task(store: &Store, task: &Task, now: DateTime<Utc>, tz: Tz) -> Result<bool> {
    match task.schedule_kind {
        ScheduleKind::Cron => {
            let next = next_cron_occurrence(&task.schedule_value, now, tz)?;
            store.set_task_next_run(&task.id, &crate::store::format_timestamp(next))?;
            Ok(true)
        }
        ScheduleKind::Interval => {
            let ms = parse_interval_ms(&task.schedule_value)?;
            let next = now + chrono::Duration::milliseconds(ms);
            store.set_task_next_run(&task.id, &crate::store::format_timestamp(next))?;
            Ok(true)
        }
        // Deleting the row is the at-most-once commit; if another pass (or a
        // crashed predecessor) already claimed it, skip.
        ScheduleKind::Once => store.delete_task(&task.id),
    }
}

/// Scheduler loop; ticks until `shutdown` is observed.
pub async fn run(
    store: Arc<Store>,
    queue: Arc<GroupQueue>,
    supervisor: Arc<Supervisor>,
    tz: Tz,
    tick: Duration,
    shutdown: Arc<AtomicBool>,
) {
    let mut interval = tokio::time::interval(tick);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        interval.tick().await;
        if shutdown.load(Ordering::SeqCst) {
            return;
        }

        let due = match store.due_tasks(&now_timestamp()) {
            Ok(due) => due,
            Err(error) => {
                tracing::warn!(%error, "scheduler query failed");
                continue;
            }
        };

        for task in due {
            let now = Utc::now();
            match claim_due_task(&store, &task, now, tz) {
                Ok(true) => {}
                Ok(false) => continue,
                Err(error) => {
                    tracing::warn!(task = %task.id, %error, "failed to claim due task, pausing it");
                    // A task whose schedule no longer computes would fire
                    // every tick otherwise.
                    if let Err(error) =
                        store.set_task_status(&task.id, crate::store::TaskStatus::Paused)
                    {
                        tracing::warn!(task = %task.id, %error, "failed to pause broken task");
                    }
                    continue;
                }
            }

            let supervisor = Arc::clone(&supervisor);
            let job_task = task.clone();
            queue.enqueue_task(
                &task.channel_id,
                &task.id,
                Box::pin(async move {
                    supervisor.run_scheduled_task(job_task).await;
                }),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{ContextMode, ScheduleKind};
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn utc(text: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(text).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn normalize_prefixes_seconds_on_five_fields() {
        assert_eq!(normalize_expression("*/5 * * * *").unwrap(), "0 */5 * * * *");
        assert_eq!(normalize_expression("0 0 * * * *").unwrap(), "0 0 * * * *");
        assert!(normalize_expression("* * *").is_err());
    }

    #[test]
    fn cron_next_run_is_strictly_after_now() {
        let now = utc("2026-01-01T00:02:30+00:00");
        let next = next_cron_occurrence("*/5 * * * *", now, chrono_tz::Tz::UTC).unwrap();
        assert_eq!(next, utc("2026-01-01T00:05:00+00:00"));
    }

    #[test]
    fn cron_evaluates_in_configured_timezone() {
        // 09:00 in Tokyo is 00:00 UTC.
        let now = utc("2026-01-01T10:00:00+00:00");
        let next =
            next_cron_occurrence("0 9 * * *", now, chrono_tz::Tz::Asia__Tokyo).unwrap();
        let local = next.with_timezone(&chrono_tz::Tz::Asia__Tokyo);
        assert_eq!(local.time(), chrono::NaiveTime::from_hms_opt(9, 0, 0).unwrap());
        assert_eq!(next, utc("2026-01-02T00:00:00+00:00"));
    }

    #[test]
    fn initial_next_run_for_interval_adds_milliseconds() {
        let now = chrono::Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let next =
            compute_initial_next_run(ScheduleKind::Interval, "60000", now, chrono_tz::Tz::UTC)
                .unwrap();
        assert_eq!(next, now + chrono::Duration::seconds(60));
    }

    #[test]
    fn initial_next_run_rejects_bad_values() {
        let now = Utc::now();
        let tz = chrono_tz::Tz::UTC;
        assert!(compute_initial_next_run(ScheduleKind::Interval, "abc", now, tz).is_err());
        assert!(compute_initial_next_run(ScheduleKind::Interval, "-5", now, tz).is_err());
        assert!(compute_initial_next_run(ScheduleKind::Cron, "not a cron", now, tz).is_err());
        assert!(compute_initial_next_run(ScheduleKind::Once, "tomorrow", now, tz).is_err());
    }

    #[test]
    fn initial_next_run_for_once_parses_offsets() {
        let now = Utc::now();
        let next = compute_initial_next_run(
            ScheduleKind::Once,
            "2026-06-01T12:00:00+02:00",
            now,
            chrono_tz::Tz::UTC,
        )
        .unwrap();
        assert_eq!(next, utc("2026-06-01T10:00:00+00:00"));
    }

    #[test]
    fn claim_persists_next_run_before_dispatch() {
        let tmp = TempDir::new().unwrap();
        let store = Store::open(&tmp.path().join("db")).unwrap();
        let task = store
            .create_task(
                "g1",
                "C1",
                "tick",
                ScheduleKind::Interval,
                "300000",
                ContextMode::Group,
                "2026-01-01T00:00:00.000Z",
            )
            .unwrap();

        let now = utc("2026-02-01T00:00:00+00:00");
        assert!(claim_due_task(&store, &task, now, chrono_tz::Tz::UTC).unwrap());

        let stored = store.get_task(&task.id).unwrap().unwrap();
        assert_eq!(
            stored.next_run.as_deref(),
            Some("2026-02-01T00:05:00.000Z"),
            "next_run recomputed and persisted"
        );
    }

    #[test]
    fn claim_deletes_once_tasks_exactly_once() {
        let tmp = TempDir::new().unwrap();
        let store = Store::open(&tmp.path().join("db")).unwrap();
        let task = store
            .create_task(
                "g1",
                "C1",
                "one shot",
                ScheduleKind::Once,
                "2026-01-01T00:00:00.000Z",
                ContextMode::Isolated,
                "2026-01-01T00:00:00.000Z",
            )
            .unwrap();

        let now = Utc::now();
        assert!(claim_due_task(&store, &task, now, chrono_tz::Tz::UTC).unwrap());
        assert!(store.get_task(&task.id).unwrap().is_none());

        // Second claim of the same (stale) task object must refuse.
        assert!(!claim_due_task(&store, &task, now, chrono_tz::Tz::UTC).unwrap());
    }
}
