use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError};

use futures_util::FutureExt;
use tokio::sync::{OnceCell, Semaphore, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use super::duplicate::find_duplicate;
use super::operation::{FailureKind, FolderRef, Operation, Outcome, Plan, PlannedOperation};
use super::report::{Report, ReportAggregator, ReportRecord};
use super::retry::{RetryPolicy, RetryState};
use super::store::{Item, RemoteStore, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutorConfig {
    pub retry: RetryPolicy,
    pub max_concurrency: usize,
    /// Re-list the destination right before a copy or folder creation.
    pub verify_before_copy: bool,
    pub page_size: u32,
}

/// Sent once per operation when it reaches a terminal outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Progress {
    pub completed: usize,
    pub total: usize,
    pub index: usize,
    pub path: String,
    pub outcome: &'static str,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionResult {
    pub outcome: Outcome,
    pub retry: RetryState,
}

/// Folder id an operation runs against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedParent {
    pub id: String,
    /// Created by this run, so it cannot hold anything yet.
    pub fresh: bool,
}

impl ResolvedParent {
    pub fn existing(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            fresh: false,
        }
    }
}

#[derive(Clone)]
pub struct Executor {
    store: Arc<dyn RemoteStore>,
    config: ExecutorConfig,
    progress: Option<mpsc::UnboundedSender<Progress>>,
}

impl Executor {
    pub fn new(store: Arc<dyn RemoteStore>, config: ExecutorConfig) -> Self {
        Self {
            store,
            config,
            progress: None,
        }
    }

    pub fn with_progress(mut self, progress: mpsc::UnboundedSender<Progress>) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Drives one operation to its terminal outcome.
    pub async fn execute(
        &self,
        planned: &PlannedOperation,
        parent: Option<&ResolvedParent>,
    ) -> ExecutionResult {
        self.execute_with(planned, parent, &SiblingCache::default()).await
    }

    async fn execute_with(
        &self,
        planned: &PlannedOperation,
        parent: Option<&ResolvedParent>,
        siblings: &SiblingCache,
    ) -> ExecutionResult {
        let mut retry = RetryState::default();
        if planned.operation.parent().is_some() && parent.is_none() {
            return ExecutionResult {
                outcome: Outcome::Failed {
                    error: "parent folder was not resolved".to_string(),
                    kind: FailureKind::ParentUnavailable,
                },
                retry,
            };
        }

        let outcome = loop {
            retry.attempts += 1;
            let err = match self.attempt(planned, parent, siblings).await {
                Ok(outcome) => break outcome,
                Err(err) => err,
            };
            match self.config.retry.next_delay(retry.attempts, &err) {
                Some(delay) => {
                    tracing::debug!(
                        index = planned.index,
                        attempt = retry.attempts,
                        ?delay,
                        error = %err,
                        "operation will be retried"
                    );
                    retry.backoff(delay).await;
                }
                None => break settle(&planned.operation, err, retry.attempts),
            }
        };
        ExecutionResult { outcome, retry }
    }

    async fn attempt(
        &self,
        planned: &PlannedOperation,
        parent: Option<&ResolvedParent>,
        siblings: &SiblingCache,
    ) -> Result<Outcome, StoreError> {
        let store = self.store.as_ref();
        match &planned.operation {
            Operation::CreateFolder { name, .. } => {
                let parent = required(parent)?;
                let expected = planned.expected.as_ref();
                if let Some(existing) = self.preflight(parent, expected, siblings).await? {
                    return Ok(Outcome::Skipped {
                        reason: "folder already exists".to_string(),
                        item_id: Some(existing.id),
                    });
                }
                let created = store.create_folder(name, &parent.id).await?;
                Ok(Outcome::Succeeded {
                    item_id: Some(created.id),
                })
            }
            Operation::CopyItem {
                source_id,
                new_name,
                ..
            } => {
                let parent = required(parent)?;
                let expected = planned.expected.as_ref();
                if let Some(existing) = self.preflight(parent, expected, siblings).await? {
                    return Ok(Outcome::Skipped {
                        reason: "duplicate already in destination".to_string(),
                        item_id: Some(existing.id),
                    });
                }
                let copied = store
                    .copy_item(source_id, &parent.id, new_name.as_deref())
                    .await?;
                Ok(Outcome::Succeeded {
                    item_id: Some(copied.id),
                })
            }
            Operation::RenameItem { item_id, new_name } => {
                let current = store.get_metadata(item_id).await?;
                if current.name == *new_name {
                    return Ok(Outcome::Skipped {
                        reason: "item already carries the new name".to_string(),
                        item_id: Some(current.id),
                    });
                }
                let renamed = store.rename_item(item_id, new_name).await?;
                Ok(Outcome::Succeeded {
                    item_id: Some(renamed.id),
                })
            }
            Operation::DeleteItem { item_id } => {
                store.delete_item(item_id).await?;
                Ok(Outcome::Succeeded { item_id: None })
            }
        }
    }

    /// Returns the sibling that already satisfies `expected`, if any.
    async fn preflight(
        &self,
        parent: &ResolvedParent,
        expected: Option<&Item>,
        siblings: &SiblingCache,
    ) -> Result<Option<Item>, StoreError> {
        let Some(expected) = expected else {
            return Ok(None);
        };
        if !self.config.verify_before_copy || parent.fresh {
            return Ok(None);
        }
        let cell = siblings.cell(&parent.id);
        let store = self.store.as_ref();
        let page_size = self.config.page_size;
        let listed = cell
            .get_or_try_init(|| list_every_page(store, &parent.id, page_size))
            .await?;
        Ok(find_duplicate(expected, listed).cloned())
    }

    /// Runs `plan` tier by tier and returns the finalized report.
    ///
    /// Operations inside a tier run concurrently, bounded by
    /// `max_concurrency`. Cancellation stops new dispatches; operations
    /// already in flight finish and are recorded.
    pub async fn execute_plan(
        &self,
        plan: &Plan,
        command: &str,
        cancel: CancellationToken,
    ) -> Report {
        let mut aggregator = ReportAggregator::new(command);
        self.run_into(&mut aggregator, plan, &cancel).await;
        self.conclude(aggregator, &cancel)
    }

    /// Runs `plan` and records its outcomes after whatever `aggregator`
    /// already holds. Record indices are shifted past earlier plans.
    pub async fn run_into(
        &self,
        aggregator: &mut ReportAggregator,
        plan: &Plan,
        cancel: &CancellationToken,
    ) {
        let offset = aggregator.absorb_plan(plan);
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrency.max(1)));
        let mut created: HashMap<usize, ResolvedParent> = HashMap::new();

        for tier in plan.tiers() {
            if cancel.is_cancelled() {
                break;
            }
            let siblings = SiblingCache::default();
            let mut workers = JoinSet::new();
            for index in tier {
                if cancel.is_cancelled() {
                    break;
                }
                let planned = &plan.operations[index];
                let parent = match planned.operation.parent() {
                    None => None,
                    Some(FolderRef::Existing(id)) => Some(ResolvedParent::existing(id.clone())),
                    Some(FolderRef::Planned(parent)) => match created.get(parent) {
                        Some(resolved) => Some(resolved.clone()),
                        None => {
                            let result = ExecutionResult {
                                outcome: Outcome::Failed {
                                    error: format!("parent folder #{parent} was not created"),
                                    kind: FailureKind::ParentUnavailable,
                                },
                                retry: RetryState::default(),
                            };
                            self.finish(aggregator, planned, result, offset, &mut created);
                            continue;
                        }
                    },
                };

                let permit = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => None,
                    permit = semaphore.clone().acquire_owned() => permit.ok(),
                };
                let Some(permit) = permit else {
                    break;
                };

                while let Some(joined) = workers.try_join_next() {
                    self.collect(aggregator, plan, joined, offset, &mut created);
                }

                let executor = self.clone();
                let job = planned.clone();
                let siblings = siblings.clone();
                workers.spawn(async move {
                    let _permit = permit;
                    let result = AssertUnwindSafe(executor.execute_with(
                        &job,
                        parent.as_ref(),
                        &siblings,
                    ))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|_| ExecutionResult {
                        outcome: Outcome::Failed {
                            error: "operation panicked".to_string(),
                            kind: FailureKind::Permanent,
                        },
                        retry: RetryState {
                            attempts: 1,
                            ..RetryState::default()
                        },
                    });
                    (job.index, result)
                });
            }

            while let Some(joined) = workers.join_next().await {
                self.collect(aggregator, plan, joined, offset, &mut created);
            }
        }
    }

    /// Marks cancellation if needed and finalizes the report.
    pub fn conclude(&self, mut aggregator: ReportAggregator, cancel: &CancellationToken) -> Report {
        if cancel.is_cancelled() {
            aggregator.mark_cancelled();
            tracing::warn!(
                not_started = aggregator.planned().saturating_sub(aggregator.recorded()),
                "run cancelled"
            );
        }
        let report = aggregator.finalize();
        tracing::info!(command = %report.command, tally = %report.tally, "run finished");
        report
    }

    fn collect(
        &self,
        aggregator: &mut ReportAggregator,
        plan: &Plan,
        joined: Result<(usize, ExecutionResult), tokio::task::JoinError>,
        offset: usize,
        created: &mut HashMap<usize, ResolvedParent>,
    ) {
        match joined {
            Ok((index, result)) => {
                self.finish(aggregator, &plan.operations[index], result, offset, created)
            }
            Err(err) => tracing::error!(error = %err, "operation worker stopped without a result"),
        }
    }

    fn finish(
        &self,
        aggregator: &mut ReportAggregator,
        planned: &PlannedOperation,
        result: ExecutionResult,
        offset: usize,
        created: &mut HashMap<usize, ResolvedParent>,
    ) {
        if matches!(planned.operation, Operation::CreateFolder { .. }) {
            if let Some(id) = result.outcome.resulting_id() {
                created.insert(
                    planned.index,
                    ResolvedParent {
                        id: id.to_string(),
                        fresh: matches!(result.outcome, Outcome::Succeeded { .. }),
                    },
                );
            }
        }

        let index = offset + planned.index;
        let label = result.outcome.label();
        match &result.outcome {
            Outcome::Failed { error, kind } => tracing::warn!(
                index,
                op = planned.operation.kind_label(),
                path = %planned.path,
                attempts = result.retry.attempts,
                ?kind,
                %error,
                "operation failed"
            ),
            Outcome::Skipped { reason, .. } => tracing::info!(
                index,
                op = planned.operation.kind_label(),
                path = %planned.path,
                %reason,
                "operation skipped"
            ),
            Outcome::Succeeded { .. } => tracing::info!(
                index,
                op = planned.operation.kind_label(),
                path = %planned.path,
                attempts = result.retry.attempts,
                "operation succeeded"
            ),
        }

        let mut record = ReportRecord::new(planned, result);
        record.index = index;
        if let Err(err) = aggregator.record(record) {
            tracing::error!(error = %err, "dropping duplicate outcome");
            return;
        }
        if let Some(progress) = &self.progress {
            // A closed receiver only means nobody displays progress anymore.
            progress
                .send(Progress {
                    completed: aggregator.recorded(),
                    total: aggregator.planned(),
                    index,
                    path: planned.path.clone(),
                    outcome: label,
                })
                .ok();
        }
    }
}

/// Destination listings shared by the operations of one tier, so copies
/// into the same folder list it once.
#[derive(Clone, Default)]
struct SiblingCache(Arc<Mutex<HashMap<String, Arc<OnceCell<Vec<Item>>>>>>);

impl SiblingCache {
    fn cell(&self, folder_id: &str) -> Arc<OnceCell<Vec<Item>>> {
        let mut cells = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        cells.entry(folder_id.to_string()).or_default().clone()
    }
}

fn required(parent: Option<&ResolvedParent>) -> Result<&ResolvedParent, StoreError> {
    parent.ok_or_else(|| StoreError::Permanent("parent folder was not resolved".to_string()))
}

/// Maps the error that ended the retry loop to a terminal outcome.
fn settle(operation: &Operation, err: StoreError, attempts: u32) -> Outcome {
    match err {
        StoreError::NotFound(_) if matches!(operation, Operation::DeleteItem { .. }) => {
            Outcome::Skipped {
                reason: "already deleted".to_string(),
                item_id: None,
            }
        }
        StoreError::AlreadySatisfied(reason) => Outcome::Skipped {
            reason,
            item_id: None,
        },
        err @ (StoreError::RateLimited { .. } | StoreError::Transient(_)) => Outcome::Failed {
            error: format!("{err} (gave up after {attempts} attempts)"),
            kind: FailureKind::RetriesExhausted,
        },
        err @ StoreError::NotFound(_) => Outcome::Failed {
            error: err.to_string(),
            kind: FailureKind::NotFound,
        },
        err @ StoreError::Permanent(_) => Outcome::Failed {
            error: err.to_string(),
            kind: FailureKind::Permanent,
        },
    }
}

/// Single pass over every page; failures go back to the caller's retry loop.
async fn list_every_page(
    store: &dyn RemoteStore,
    folder_id: &str,
    page_size: u32,
) -> Result<Vec<Item>, StoreError> {
    let mut items = Vec::new();
    let mut token: Option<String> = None;
    loop {
        let page = store
            .list_children(folder_id, token.as_deref(), page_size.max(1))
            .await?;
        items.extend(page.items);
        match page.next_page_token {
            Some(next) => token = Some(next),
            None => return Ok(items),
        }
    }
}

#[cfg(test)]
#[path = "executor_tests.rs"]
mod tests;
