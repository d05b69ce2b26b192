use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::Serialize;
use thiserror::Error;
use time::OffsetDateTime;
use time::macros::format_description;

use super::executor::ExecutionResult;
use super::operation::{
    Operation, Outcome, Plan, PlannedOperation, PlannedSkip, PlanningFailure, TraversalFailure,
};

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("operation #{0} already has a recorded outcome")]
    AlreadyRecorded(usize),
    #[error("failed to write report {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to serialize report: {0}")]
    Json(#[from] serde_json::Error),
    #[error("failed to format report timestamp: {0}")]
    Timestamp(#[from] time::error::Format),
}

/// Terminal outcome of one operation with its inputs and retry accounting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReportRecord {
    pub index: usize,
    pub operation: Operation,
    pub path: String,
    pub outcome: Outcome,
    pub attempts: u32,
    pub waited_ms: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub recorded_at: OffsetDateTime,
}

impl ReportRecord {
    pub fn new(planned: &PlannedOperation, result: ExecutionResult) -> Self {
        Self {
            index: planned.index,
            operation: planned.operation.clone(),
            path: planned.path.clone(),
            outcome: result.outcome,
            attempts: result.retry.attempts,
            waited_ms: u64::try_from(result.retry.waited.as_millis()).unwrap_or(u64::MAX),
            recorded_at: OffsetDateTime::now_utc(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Tally {
    pub succeeded: usize,
    pub skipped: usize,
    pub failed: usize,
    pub not_started: usize,
}

impl fmt::Display for Tally {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} succeeded, {} skipped, {} failed, {} not started",
            self.succeeded, self.skipped, self.failed, self.not_started
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Report {
    pub command: String,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub finished_at: OffsetDateTime,
    pub cancelled: bool,
    pub planned: usize,
    pub tally: Tally,
    pub records: Vec<ReportRecord>,
    pub skipped_at_planning: Vec<PlannedSkip>,
    pub unreachable: Vec<TraversalFailure>,
    pub planning_failures: Vec<PlanningFailure>,
}

impl Report {
    pub fn has_failures(&self) -> bool {
        self.tally.failed > 0 || !self.planning_failures.is_empty()
    }

    pub fn failures(&self) -> impl Iterator<Item = &ReportRecord> {
        self.records.iter().filter(|record| record.outcome.is_failed())
    }

    /// Writes `drivebatch_report_<timestamp>.json` into `dir` and returns its path.
    pub async fn write_json(&self, dir: &Path) -> Result<PathBuf, ReportError> {
        let stamp = self
            .finished_at
            .format(format_description!("[year][month][day]_[hour][minute][second]"))?;
        let path = dir.join(format!("drivebatch_report_{stamp}.json"));
        let body = serde_json::to_vec_pretty(self)?;
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|source| ReportError::Io {
                path: dir.to_path_buf(),
                source,
            })?;
        tokio::fs::write(&path, body)
            .await
            .map_err(|source| ReportError::Io {
                path: path.clone(),
                source,
            })?;
        Ok(path)
    }
}

/// Collects outcomes for one command. Consumed by [`ReportAggregator::finalize`].
#[derive(Debug)]
pub struct ReportAggregator {
    command: String,
    started_at: OffsetDateTime,
    planned: usize,
    cancelled: bool,
    records: Vec<ReportRecord>,
    recorded: HashSet<usize>,
    skipped_at_planning: Vec<PlannedSkip>,
    unreachable: Vec<TraversalFailure>,
    planning_failures: Vec<PlanningFailure>,
}

impl ReportAggregator {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            started_at: OffsetDateTime::now_utc(),
            planned: 0,
            cancelled: false,
            records: Vec::new(),
            recorded: HashSet::new(),
            skipped_at_planning: Vec::new(),
            unreachable: Vec::new(),
            planning_failures: Vec::new(),
        }
    }

    /// Adds `plan` to the run and returns the index its first operation
    /// is recorded under.
    pub fn absorb_plan(&mut self, plan: &Plan) -> usize {
        let offset = self.planned;
        self.planned += plan.len();
        self.skipped_at_planning.extend(plan.skipped.iter().cloned());
        self.unreachable.extend(plan.unreachable.iter().cloned());
        self.planning_failures.extend(plan.failures.iter().cloned());
        offset
    }

    pub fn note_planning_failure(&mut self, failure: PlanningFailure) {
        self.planning_failures.push(failure);
    }

    pub fn record(&mut self, record: ReportRecord) -> Result<(), ReportError> {
        if !self.recorded.insert(record.index) {
            return Err(ReportError::AlreadyRecorded(record.index));
        }
        self.records.push(record);
        Ok(())
    }

    pub fn recorded(&self) -> usize {
        self.records.len()
    }

    pub fn planned(&self) -> usize {
        self.planned
    }

    pub fn mark_cancelled(&mut self) {
        self.cancelled = true;
    }

    pub fn finalize(self) -> Report {
        let mut tally = Tally::default();
        for record in &self.records {
            match record.outcome {
                Outcome::Succeeded { .. } => tally.succeeded += 1,
                Outcome::Skipped { .. } => tally.skipped += 1,
                Outcome::Failed { .. } => tally.failed += 1,
            }
        }
        tally.not_started = self.planned.saturating_sub(self.records.len());
        Report {
            command: self.command,
            started_at: self.started_at,
            finished_at: OffsetDateTime::now_utc(),
            cancelled: self.cancelled,
            planned: self.planned,
            tally,
            records: self.records,
            skipped_at_planning: self.skipped_at_planning,
            unreachable: self.unreachable,
            planning_failures: self.planning_failures,
        }
    }
}
