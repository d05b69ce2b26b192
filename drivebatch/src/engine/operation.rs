use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::store::Item;
use super::walker::TraversalError;

/// Parent of a folder-targeting operation: an id that already exists, or the
/// plan index of a `CreateFolder` whose id is only known after it runs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FolderRef {
    Existing(String),
    Planned(usize),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Operation {
    CreateFolder {
        name: String,
        parent: FolderRef,
    },
    CopyItem {
        source_id: String,
        dest_parent: FolderRef,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        new_name: Option<String>,
    },
    RenameItem {
        item_id: String,
        new_name: String,
    },
    DeleteItem {
        item_id: String,
    },
}

impl Operation {
    pub fn parent(&self) -> Option<&FolderRef> {
        match self {
            Operation::CreateFolder { parent, .. } => Some(parent),
            Operation::CopyItem { dest_parent, .. } => Some(dest_parent),
            Operation::RenameItem { .. } | Operation::DeleteItem { .. } => None,
        }
    }

    pub fn kind_label(&self) -> &'static str {
        match self {
            Operation::CreateFolder { .. } => "create-folder",
            Operation::CopyItem { .. } => "copy",
            Operation::RenameItem { .. } => "rename",
            Operation::DeleteItem { .. } => "delete",
        }
    }

    fn shift_planned(&mut self, offset: usize) {
        let parent = match self {
            Operation::CreateFolder { parent, .. } => parent,
            Operation::CopyItem { dest_parent, .. } => dest_parent,
            Operation::RenameItem { .. } | Operation::DeleteItem { .. } => return,
        };
        if let FolderRef::Planned(index) = parent {
            *index += offset;
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlannedOperation {
    pub index: usize,
    pub operation: Operation,
    /// Source path relative to the walk root, for reporting only.
    pub path: String,
    /// How the item should look once the operation lands, used for
    /// duplicate checks right before a copy or folder creation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected: Option<Item>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlannedSkip {
    pub path: String,
    pub existing_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TraversalFailure {
    pub folder_id: String,
    pub path: String,
    pub error: String,
}

impl From<TraversalError> for TraversalFailure {
    fn from(err: TraversalError) -> Self {
        Self {
            error: err.source.to_string(),
            folder_id: err.folder_id,
            path: err.path,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlanningFailure {
    pub entry: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("operation #{index} references folder #{parent} which is not planned before it")]
pub struct OrderingViolation {
    pub index: usize,
    pub parent: usize,
}

/// Ordered operations for one command, plus what planning had to leave out.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Plan {
    pub operations: Vec<PlannedOperation>,
    pub skipped: Vec<PlannedSkip>,
    pub unreachable: Vec<TraversalFailure>,
    pub failures: Vec<PlanningFailure>,
}

impl Plan {
    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    pub fn push(&mut self, operation: Operation, path: String, expected: Option<Item>) -> usize {
        let index = self.operations.len();
        self.operations.push(PlannedOperation {
            index,
            operation,
            path,
            expected,
        });
        index
    }

    pub fn skip(&mut self, path: String, existing_id: String, reason: impl Into<String>) {
        self.skipped.push(PlannedSkip {
            path,
            existing_id,
            reason: reason.into(),
        });
    }

    /// Appends `other`, rebasing its planned-folder references.
    pub fn append(&mut self, other: Plan) {
        let offset = self.operations.len();
        for mut planned in other.operations {
            planned.index += offset;
            planned.operation.shift_planned(offset);
            self.operations.push(planned);
        }
        self.skipped.extend(other.skipped);
        self.unreachable.extend(other.unreachable);
        self.failures.extend(other.failures);
    }

    pub fn check_ordering(&self) -> Result<(), OrderingViolation> {
        for planned in &self.operations {
            if let Some(FolderRef::Planned(parent)) = planned.operation.parent() {
                let creates_folder = self
                    .operations
                    .get(*parent)
                    .is_some_and(|op| matches!(op.operation, Operation::CreateFolder { .. }));
                if *parent >= planned.index || !creates_folder {
                    return Err(OrderingViolation {
                        index: planned.index,
                        parent: *parent,
                    });
                }
            }
        }
        Ok(())
    }

    /// Groups operation indices into tiers that can run once every earlier
    /// tier finished: tier 0 depends only on existing folders, tier `n + 1`
    /// on folders created in tier `n`.
    pub fn tiers(&self) -> Vec<Vec<usize>> {
        let mut tier_of = vec![0usize; self.operations.len()];
        let mut tiers: Vec<Vec<usize>> = Vec::new();
        for (position, planned) in self.operations.iter().enumerate() {
            let tier = match planned.operation.parent() {
                Some(FolderRef::Planned(parent)) if *parent < position => tier_of[*parent] + 1,
                _ => 0,
            };
            tier_of[position] = tier;
            if tiers.len() <= tier {
                tiers.resize_with(tier + 1, Vec::new);
            }
            tiers[tier].push(position);
        }
        tiers
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    RetriesExhausted,
    Permanent,
    NotFound,
    ParentUnavailable,
}

/// Terminal result of one operation; never changes once recorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    Succeeded {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        item_id: Option<String>,
    },
    Skipped {
        reason: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        item_id: Option<String>,
    },
    Failed {
        error: String,
        kind: FailureKind,
    },
}

impl Outcome {
    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Succeeded { .. } => "succeeded",
            Outcome::Skipped { .. } => "skipped",
            Outcome::Failed { .. } => "failed",
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Outcome::Failed { .. })
    }

    /// Id of the item the operation produced or found already in place.
    pub fn resulting_id(&self) -> Option<&str> {
        match self {
            Outcome::Succeeded { item_id } | Outcome::Skipped { item_id, .. } => {
                item_id.as_deref()
            }
            Outcome::Failed { .. } => None,
        }
    }
}
