use chrono::{DateTime, Duration, Utc};

use crate::runs::{ExecutionRun, RunStatus};

/// Total billable minutes for a snapshot of runs at time `now`.
///
/// A completed run bills the ceiling of its wall-clock duration in minutes,
/// floored at one minute. A running run bills the same against `now`. Runs
/// missing the timestamps they need contribute zero rather than erroring.
/// Deterministic and stateless.
pub fn billable_minutes(runs: &[ExecutionRun], now: DateTime<Utc>) -> i64 {
    runs.iter().map(|run| run_minutes(run, now)).sum()
}

fn run_minutes(run: &ExecutionRun, now: DateTime<Utc>) -> i64 {
    match run.status {
        RunStatus::Running => match run.started_at {
            Some(started_at) => ceil_minutes(now - started_at),
            None => 0,
        },
        RunStatus::Completed => match (run.started_at, run.completed_at) {
            (Some(started_at), Some(completed_at)) => ceil_minutes(completed_at - started_at),
            _ => 0,
        },
        RunStatus::Failed | RunStatus::Stopped => 0,
    }
}

fn ceil_minutes(elapsed: Duration) -> i64 {
    let seconds = elapsed.num_seconds().max(0);
    ((seconds + 59) / 60).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(seconds: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + seconds, 0).unwrap()
    }

    fn run(
        id: &str,
        status: RunStatus,
        started: Option<i64>,
        completed: Option<i64>,
    ) -> ExecutionRun {
        ExecutionRun {
            id: id.to_string(),
            status,
            started_at: started.map(at),
            completed_at: completed.map(at),
        }
    }

    #[test]
    fn running_run_bills_against_now() {
        let runs = vec![run("a", RunStatus::Running, Some(0), None)];
        assert_eq!(billable_minutes(&runs, at(90)), 2);
    }

    #[test]
    fn completed_run_bills_its_duration() {
        let runs = vec![run("a", RunStatus::Completed, Some(0), Some(150))];
        assert_eq!(billable_minutes(&runs, at(0)), 3);
        assert_eq!(billable_minutes(&runs, at(10_000)), 3);
    }

    #[test]
    fn sub_minute_completion_bills_one_minute() {
        let runs = vec![run("a", RunStatus::Completed, Some(0), Some(0))];
        assert_eq!(billable_minutes(&runs, at(0)), 1);
    }

    #[test]
    fn fresh_running_run_bills_one_minute() {
        let runs = vec![run("a", RunStatus::Running, Some(0), None)];
        assert_eq!(billable_minutes(&runs, at(0)), 1);
    }

    #[test]
    fn malformed_records_bill_zero() {
        let runs = vec![
            run("a", RunStatus::Running, None, None),
            run("b", RunStatus::Completed, Some(0), None),
            run("c", RunStatus::Completed, None, Some(60)),
        ];
        assert_eq!(billable_minutes(&runs, at(600)), 0);
    }

    #[test]
    fn failed_and_stopped_runs_bill_zero() {
        let runs = vec![
            run("a", RunStatus::Failed, Some(0), Some(600)),
            run("b", RunStatus::Stopped, Some(0), Some(600)),
        ];
        assert_eq!(billable_minutes(&runs, at(600)), 0);
    }

    #[test]
    fn contributions_sum() {
        let runs = vec![
            run("a", RunStatus::Completed, Some(0), Some(150)),
            run("b", RunStatus::Running, Some(0), None),
        ];
        assert_eq!(billable_minutes(&runs, at(90)), 5);
    }

    #[test]
    fn clock_skew_does_not_go_negative() {
        // started_at in the future relative to now
        let runs = vec![run("a", RunStatus::Running, Some(120), None)];
        assert_eq!(billable_minutes(&runs, at(0)), 1);
    }
}
