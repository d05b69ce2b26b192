pub mod duplicate;
pub mod executor;
pub mod operation;
pub mod pattern;
pub mod planner;
pub mod report;
pub mod retry;
pub mod store;
pub mod walker;

#[cfg(test)]
mod memory_store;

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::command::{BatchEntry, Command};
use crate::config::EngineConfig;
use executor::{Executor, Progress};
use operation::Plan;
use planner::{Planner, PlanningError};
use report::{Report, ReportAggregator};
use store::RemoteStore;

/// Plans a command and runs the result against one store.
pub struct BatchEngine {
    planner: Planner,
    executor: Executor,
}

impl BatchEngine {
    pub fn new(store: Arc<dyn RemoteStore>, config: &EngineConfig) -> Self {
        let planner = Planner::new(store.clone(), config.retry_policy(), config.page_size)
            .with_default_destination(config.default_destination.clone());
        let executor = Executor::new(store, config.executor_config());
        Self { planner, executor }
    }

    pub fn with_progress(mut self, progress: mpsc::UnboundedSender<Progress>) -> Self {
        self.executor = self.executor.with_progress(progress);
        self
    }

    /// Read-only; safe for dry runs.
    pub async fn plan(&self, command: &Command) -> Result<Plan, PlanningError> {
        self.planner.plan(command).await
    }

    /// Plans and executes `command`. Batch entries run one after another,
    /// each planned only once the previous entry finished, and share one
    /// report.
    pub async fn run(
        &self,
        command: &Command,
        cancel: CancellationToken,
    ) -> Result<Report, PlanningError> {
        if let Command::Batch(entries) = command {
            return Ok(self.run_batch(command, entries, cancel).await);
        }
        let plan = self.plan(command).await?;
        Ok(self.execute(&plan, command, cancel).await)
    }

    pub async fn execute(
        &self,
        plan: &Plan,
        command: &Command,
        cancel: CancellationToken,
    ) -> Report {
        self.executor
            .execute_plan(plan, &command.to_string(), cancel)
            .await
    }

    async fn run_batch(
        &self,
        command: &Command,
        entries: &[BatchEntry],
        cancel: CancellationToken,
    ) -> Report {
        let mut aggregator = ReportAggregator::new(command.to_string());
        for (position, entry) in entries.iter().enumerate() {
            if cancel.is_cancelled() {
                tracing::warn!(remaining = entries.len() - position, "batch entries not started");
                break;
            }
            match self.planner.plan_entry(position + 1, entry).await {
                Ok(plan) => self.executor.run_into(&mut aggregator, &plan, &cancel).await,
                Err(failure) => aggregator.note_planning_failure(failure),
            }
        }
        self.executor.conclude(aggregator, &cancel)
    }
}
