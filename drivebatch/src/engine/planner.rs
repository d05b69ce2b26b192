use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use drivebatch_core::extract_file_id;
use thiserror::Error;

use super::duplicate::find_duplicate;
use super::operation::{FolderRef, Operation, Plan, PlanningFailure, TraversalFailure};
use super::pattern::{Pattern, PatternError};
use super::retry::{RetryPolicy, RetryState, with_retry};
use super::store::{Item, ItemKind, RemoteStore, StoreError};
use super::walker::{TraversalError, TreeWalker, list_all_children};
use crate::command::{BatchEntry, Command};

pub const DEFAULT_DESTINATION: &str = "root";

#[derive(Debug, Error)]
pub enum PlanningError {
    #[error(transparent)]
    Pattern(#[from] PatternError),
    #[error("missing required argument `{0}`")]
    MissingArgument(&'static str),
    #[error("`{0}` is neither an item id nor a shared link")]
    InvalidSource(String),
    #[error("source {0} is a folder, expected a file")]
    NotAFile(String),
    #[error("batch entries cannot contain another batch")]
    NestedBatch,
    #[error("{0}")]
    InvalidEntry(String),
    #[error("failed to look up {what} {id}: {source}")]
    Lookup {
        what: &'static str,
        id: String,
        source: StoreError,
    },
}

/// Destination folder for one level of a copied tree.
struct CopyTarget {
    folder: FolderRef,
    existing: Vec<Item>,
    planned: Vec<PlannedChild>,
}

struct PlannedChild {
    item: Item,
    created: Option<usize>,
}

impl CopyTarget {
    fn new(folder: FolderRef, existing: Vec<Item>) -> Self {
        Self {
            folder,
            existing,
            planned: Vec::new(),
        }
    }
}

/// Turns commands into ordered operations. Only reads from the store.
pub struct Planner {
    store: Arc<dyn RemoteStore>,
    policy: RetryPolicy,
    page_size: u32,
    default_destination: String,
}

impl Planner {
    pub fn new(store: Arc<dyn RemoteStore>, policy: RetryPolicy, page_size: u32) -> Self {
        Self {
            store,
            policy,
            page_size: page_size.max(1),
            default_destination: DEFAULT_DESTINATION.to_string(),
        }
    }

    pub fn with_default_destination(mut self, destination: impl Into<String>) -> Self {
        self.default_destination = destination.into();
        self
    }

    pub async fn plan(&self, command: &Command) -> Result<Plan, PlanningError> {
        let plan = match command {
            Command::Batch(entries) => self.plan_batch(entries).await,
            other => self.plan_single(other).await?,
        };
        tracing::info!(
            command = %command,
            operations = plan.len(),
            skipped = plan.skipped.len(),
            unreachable = plan.unreachable.len(),
            failures = plan.failures.len(),
            "planned command"
        );
        Ok(plan)
    }

    async fn plan_single(&self, command: &Command) -> Result<Plan, PlanningError> {
        match command {
            Command::Copy {
                source,
                destination,
                new_name,
            } => {
                self.plan_copy(source, destination.as_deref(), new_name.as_deref())
                    .await
            }
            Command::Modify {
                folder_id,
                target,
                prefix,
                suffix,
                keep_extension,
            } => {
                self.plan_rename(
                    folder_id,
                    target,
                    prefix.as_deref().unwrap_or(""),
                    suffix.as_deref().unwrap_or(""),
                    *keep_extension,
                )
                .await
            }
            Command::Delete { folder_id, pattern } => self.plan_delete(folder_id, pattern).await,
            Command::CopyToSubfolders {
                source_id,
                folder_id,
            } => self.plan_copy_to_subfolders(source_id, folder_id).await,
            Command::Batch(_) => Err(PlanningError::NestedBatch),
        }
    }

    /// Plans every entry against the same snapshot and concatenates the
    /// results in file order. Used for previews; runs go through
    /// [`Planner::plan_entry`] one entry at a time.
    async fn plan_batch(&self, entries: &[BatchEntry]) -> Plan {
        let mut plan = Plan::default();
        for (position, entry) in entries.iter().enumerate() {
            match self.plan_entry(position + 1, entry).await {
                Ok(sub_plan) => plan.append(sub_plan),
                Err(failure) => plan.failures.push(failure),
            }
        }
        plan
    }

    /// Plans one batch entry (`number` is 1-based).
    pub async fn plan_entry(
        &self,
        number: usize,
        entry: &BatchEntry,
    ) -> Result<Plan, PlanningFailure> {
        let result = match &entry.command {
            Ok(command) => self.plan_single(command).await,
            Err(message) => Err(PlanningError::InvalidEntry(message.clone())),
        };
        result.map_err(|err| {
            tracing::warn!(entry = number, error = %err, "batch entry could not be planned");
            PlanningFailure {
                entry: number,
                description: entry.description.clone(),
                error: err.to_string(),
            }
        })
    }

    async fn plan_copy(
        &self,
        source: &str,
        destination: Option<&str>,
        new_name: Option<&str>,
    ) -> Result<Plan, PlanningError> {
        let source = require("source", source)?;
        let source_id =
            extract_file_id(source).ok_or_else(|| PlanningError::InvalidSource(source.to_string()))?;
        let destination = destination
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .unwrap_or(&self.default_destination)
            .to_string();
        let new_name = new_name.map(str::trim).filter(|value| !value.is_empty());

        let source_item = self.lookup("source", &source_id).await?;
        let dest_children = self.children("destination", &destination).await?;
        let mut plan = Plan::default();

        if !source_item.is_folder() {
            let candidate = Item {
                name: new_name.unwrap_or(&source_item.name).to_string(),
                ..source_item.clone()
            };
            match find_duplicate(&candidate, &dest_children) {
                Some(existing) => plan.skip(
                    candidate.name.clone(),
                    existing.id.clone(),
                    "duplicate already in destination",
                ),
                None => {
                    plan.push(
                        Operation::CopyItem {
                            source_id: source_item.id.clone(),
                            dest_parent: FolderRef::Existing(destination),
                            new_name: new_name.map(str::to_string),
                        },
                        candidate.name.clone(),
                        Some(candidate),
                    );
                }
            }
            return Ok(plan);
        }

        let root = match new_name {
            Some(name) => {
                let wrapper = folder_named(name);
                match find_duplicate(&wrapper, &dest_children) {
                    Some(existing) => {
                        plan.skip(
                            name.to_string(),
                            existing.id.clone(),
                            "folder already exists in destination, merging",
                        );
                        let existing_id = existing.id.clone();
                        let children = self.destination_children(&mut plan, &existing_id, name);
                        match children.await {
                            Some(children) => {
                                CopyTarget::new(FolderRef::Existing(existing_id), children)
                            }
                            None => return Ok(plan),
                        }
                    }
                    None => {
                        let index = plan.push(
                            Operation::CreateFolder {
                                name: name.to_string(),
                                parent: FolderRef::Existing(destination),
                            },
                            name.to_string(),
                            Some(wrapper),
                        );
                        CopyTarget::new(FolderRef::Planned(index), Vec::new())
                    }
                }
            }
            None => CopyTarget::new(FolderRef::Existing(destination), dest_children),
        };

        let mut targets: HashMap<String, CopyTarget> = HashMap::new();
        targets.insert(source_item.id.clone(), root);

        let mut walker = TreeWalker::new(
            self.store.clone(),
            self.policy,
            &source_item.id,
            None,
            self.page_size,
        );
        while let Some(next) = walker.next().await {
            let entry = match next {
                Ok(entry) => entry,
                Err(err) => {
                    absorb_traversal(&mut plan, &source_item.id, err)?;
                    continue;
                }
            };
            let Some(target) = targets.get_mut(&entry.parent_id) else {
                walker.prune();
                continue;
            };
            let candidate = entry.item;

            if let Some(existing) = find_duplicate(&candidate, &target.existing) {
                plan.skip(
                    entry.path.clone(),
                    existing.id.clone(),
                    if candidate.is_folder() {
                        "folder already exists in destination, merging"
                    } else {
                        "duplicate already in destination"
                    },
                );
                if candidate.is_folder() {
                    let existing_id = existing.id.clone();
                    match self
                        .destination_children(&mut plan, &existing_id, &entry.path)
                        .await
                    {
                        Some(children) => {
                            targets.insert(
                                candidate.id.clone(),
                                CopyTarget::new(FolderRef::Existing(existing_id), children),
                            );
                        }
                        None => walker.prune(),
                    }
                }
                continue;
            }

            let planned_twin = target
                .planned
                .iter()
                .find(|child| find_duplicate(&candidate, std::slice::from_ref(&child.item)).is_some());
            if let Some(twin) = planned_twin {
                plan.skip(
                    entry.path.clone(),
                    twin.item.id.clone(),
                    "duplicate of an item already planned into the same folder",
                );
                if let Some(index) = twin.created {
                    targets.insert(
                        candidate.id.clone(),
                        CopyTarget::new(FolderRef::Planned(index), Vec::new()),
                    );
                }
                continue;
            }

            let parent = target.folder.clone();
            match candidate.kind {
                ItemKind::Folder => {
                    let index = plan.push(
                        Operation::CreateFolder {
                            name: candidate.name.clone(),
                            parent,
                        },
                        entry.path,
                        Some(candidate.clone()),
                    );
                    target.planned.push(PlannedChild {
                        item: candidate.clone(),
                        created: Some(index),
                    });
                    targets.insert(
                        candidate.id,
                        CopyTarget::new(FolderRef::Planned(index), Vec::new()),
                    );
                }
                ItemKind::File => {
                    plan.push(
                        Operation::CopyItem {
                            source_id: candidate.id.clone(),
                            dest_parent: parent,
                            new_name: None,
                        },
                        entry.path,
                        Some(candidate.clone()),
                    );
                    target.planned.push(PlannedChild {
                        item: candidate,
                        created: None,
                    });
                }
            }
        }
        Ok(plan)
    }

    async fn plan_rename(
        &self,
        folder_id: &str,
        target: &str,
        prefix: &str,
        suffix: &str,
        keep_extension: bool,
    ) -> Result<Plan, PlanningError> {
        let folder_id = require("folder_id", folder_id)?;
        let pattern = Pattern::new(require("target", target)?)?;
        if prefix.is_empty() && suffix.is_empty() {
            return Err(PlanningError::MissingArgument("prefix or suffix"));
        }
        tracing::debug!(folder_id, pattern = pattern.as_str(), "planning rename");

        let mut plan = Plan::default();
        let mut seen = HashSet::new();
        let mut walker = self.walker(folder_id, None);
        while let Some(next) = walker.next().await {
            let entry = match next {
                Ok(entry) => entry,
                Err(err) => {
                    absorb_traversal(&mut plan, folder_id, err)?;
                    continue;
                }
            };
            // Listings report original names, so a freshly renamed item can
            // never be matched a second time.
            if !pattern.matches(&entry.item.name) || !seen.insert(entry.item.id.clone()) {
                continue;
            }
            let new_name = renamed(&entry.item, prefix, suffix, keep_extension);
            plan.push(
                Operation::RenameItem {
                    item_id: entry.item.id,
                    new_name,
                },
                entry.path,
                None,
            );
        }
        Ok(plan)
    }

    async fn plan_delete(&self, folder_id: &str, pattern: &str) -> Result<Plan, PlanningError> {
        let folder_id = require("folder_id", folder_id)?;
        let pattern = Pattern::new(require("pattern", pattern)?)?;
        tracing::debug!(folder_id, pattern = pattern.as_str(), "planning delete");

        let mut plan = Plan::default();
        let mut walker = self.walker(folder_id, None);
        while let Some(next) = walker.next().await {
            let entry = match next {
                Ok(entry) => entry,
                Err(err) => {
                    absorb_traversal(&mut plan, folder_id, err)?;
                    continue;
                }
            };
            if !pattern.matches(&entry.item.name) {
                continue;
            }
            if entry.item.is_folder() {
                // The store removes a folder's contents with it.
                walker.prune();
            }
            plan.push(
                Operation::DeleteItem {
                    item_id: entry.item.id,
                },
                entry.path,
                None,
            );
        }
        Ok(plan)
    }

    async fn plan_copy_to_subfolders(
        &self,
        source_id: &str,
        folder_id: &str,
    ) -> Result<Plan, PlanningError> {
        let source = require("source_id", source_id)?;
        let folder_id = require("folder_id", folder_id)?;
        let source_id =
            extract_file_id(source).ok_or_else(|| PlanningError::InvalidSource(source.to_string()))?;
        let source_item = self.lookup("source", &source_id).await?;
        if source_item.is_folder() {
            return Err(PlanningError::NotAFile(source_id));
        }

        let mut plan = Plan::default();
        let mut walker = self.walker(folder_id, Some(1));
        while let Some(next) = walker.next().await {
            let entry = match next {
                Ok(entry) => entry,
                Err(err) => {
                    absorb_traversal(&mut plan, folder_id, err)?;
                    continue;
                }
            };
            if !entry.item.is_folder() {
                continue;
            }
            let path = format!("{}/{}", entry.path, source_item.name);
            let siblings = match list_all_children(
                self.store.as_ref(),
                &self.policy,
                &entry.item.id,
                self.page_size,
            )
            .await
            {
                Ok(siblings) => siblings,
                Err(err) => {
                    tracing::warn!(folder_id = %entry.item.id, error = %err, "subfolder is unreachable, skipping");
                    plan.unreachable.push(TraversalFailure {
                        folder_id: entry.item.id,
                        path: entry.path,
                        error: err.to_string(),
                    });
                    continue;
                }
            };
            match find_duplicate(&source_item, &siblings) {
                Some(existing) => {
                    plan.skip(path, existing.id.clone(), "duplicate already in subfolder")
                }
                None => {
                    plan.push(
                        Operation::CopyItem {
                            source_id: source_item.id.clone(),
                            dest_parent: FolderRef::Existing(entry.item.id),
                            new_name: None,
                        },
                        path,
                        Some(source_item.clone()),
                    );
                }
            }
        }
        Ok(plan)
    }

    fn walker(&self, root_id: &str, max_depth: Option<usize>) -> TreeWalker {
        TreeWalker::new(
            self.store.clone(),
            self.policy,
            root_id,
            max_depth,
            self.page_size,
        )
    }

    async fn lookup(&self, what: &'static str, id: &str) -> Result<Item, PlanningError> {
        let mut state = RetryState::default();
        let store = self.store.as_ref();
        with_retry(&self.policy, &mut state, move || store.get_metadata(id))
            .await
            .map_err(|source| PlanningError::Lookup {
                what,
                id: id.to_string(),
                source,
            })
    }

    /// Lists a destination folder the copy merges into. A failure is
    /// recorded as unreachable and the caller drops that branch.
    async fn destination_children(
        &self,
        plan: &mut Plan,
        folder_id: &str,
        path: &str,
    ) -> Option<Vec<Item>> {
        match list_all_children(self.store.as_ref(), &self.policy, folder_id, self.page_size).await
        {
            Ok(children) => Some(children),
            Err(err) => {
                tracing::warn!(folder_id, path, error = %err, "destination folder is unreachable, skipping branch");
                plan.unreachable.push(TraversalFailure {
                    folder_id: folder_id.to_string(),
                    path: path.to_string(),
                    error: err.to_string(),
                });
                None
            }
        }
    }

    async fn children(&self, what: &'static str, id: &str) -> Result<Vec<Item>, PlanningError> {
        list_all_children(self.store.as_ref(), &self.policy, id, self.page_size)
            .await
            .map_err(|source| PlanningError::Lookup {
                what,
                id: id.to_string(),
                source,
            })
    }
}

fn require<'a>(name: &'static str, value: &'a str) -> Result<&'a str, PlanningError> {
    let value = value.trim();
    if value.is_empty() {
        Err(PlanningError::MissingArgument(name))
    } else {
        Ok(value)
    }
}

/// A root that cannot be listed fails the command; deeper branches are only
/// recorded.
fn absorb_traversal(plan: &mut Plan, root_id: &str, err: TraversalError) -> Result<(), PlanningError> {
    if err.folder_id == root_id {
        return Err(PlanningError::Lookup {
            what: "folder",
            id: err.folder_id,
            source: err.source,
        });
    }
    plan.unreachable.push(err.into());
    Ok(())
}

fn folder_named(name: &str) -> Item {
    Item {
        id: String::new(),
        name: name.to_string(),
        kind: ItemKind::Folder,
        size: 0,
        parent_id: None,
        checksum: None,
    }
}

fn renamed(item: &Item, prefix: &str, suffix: &str, keep_extension: bool) -> String {
    if keep_extension && !item.is_folder() {
        if let Some((stem, extension)) = item.name.rsplit_once('.') {
            if !stem.is_empty() {
                return format!("{prefix}{stem}{suffix}.{extension}");
            }
        }
    }
    format!("{prefix}{}{suffix}", item.name)
}

#[cfg(test)]
#[path = "planner_tests.rs"]
mod tests;
