use std::fmt;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

/// A user-level request the planner turns into operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Copy {
        /// File or folder id, or a shared link to one.
        source: String,
        destination: Option<String>,
        new_name: Option<String>,
    },
    Modify {
        folder_id: String,
        target: String,
        prefix: Option<String>,
        suffix: Option<String>,
        /// Insert the suffix before a file's last extension.
        keep_extension: bool,
    },
    Delete {
        folder_id: String,
        pattern: String,
    },
    CopyToSubfolders {
        source_id: String,
        folder_id: String,
    },
    Batch(Vec<BatchEntry>),
}

/// One batch file entry. Entries that failed to parse keep their error so
/// they surface as planning failures instead of aborting the whole batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchEntry {
    pub description: Option<String>,
    pub command: Result<Command, String>,
}

impl BatchEntry {
    pub fn new(command: Command) -> Self {
        Self {
            description: None,
            command: Ok(command),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Copy {
                source,
                destination,
                new_name,
            } => {
                write!(
                    f,
                    "copy {source} into {}",
                    destination.as_deref().unwrap_or("default destination")
                )?;
                if let Some(name) = new_name {
                    write!(f, " as `{name}`")?;
                }
                Ok(())
            }
            Command::Modify {
                folder_id,
                target,
                prefix,
                suffix,
                ..
            } => write!(
                f,
                "rename `{target}` in {folder_id} (prefix `{}`, suffix `{}`)",
                prefix.as_deref().unwrap_or(""),
                suffix.as_deref().unwrap_or("")
            ),
            Command::Delete { folder_id, pattern } => {
                write!(f, "delete `{pattern}` in {folder_id}")
            }
            Command::CopyToSubfolders {
                source_id,
                folder_id,
            } => write!(f, "copy {source_id} into every subfolder of {folder_id}"),
            Command::Batch(entries) => write!(f, "batch of {} commands", entries.len()),
        }
    }
}

#[derive(Debug, Error)]
pub enum BatchFileError {
    #[error("failed to read batch file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("batch file is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Deserialize)]
struct BatchFile {
    #[serde(default)]
    commands: Vec<serde_json::Value>,
}

#[derive(Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
enum BatchAction {
    Copy {
        source: String,
        #[serde(default)]
        destination: Option<String>,
        #[serde(default)]
        new_name: Option<String>,
    },
    #[serde(alias = "modify")]
    Rename {
        folder_id: String,
        target: String,
        #[serde(default)]
        prefix: Option<String>,
        #[serde(default)]
        suffix: Option<String>,
        #[serde(default)]
        keep_extension: bool,
    },
    Delete {
        folder_id: String,
        pattern: String,
    },
    #[serde(alias = "copy-to-subfolders")]
    CopyToSubfolders {
        source_id: String,
        folder_id: String,
    },
    Batch {},
}

impl From<BatchAction> for Command {
    fn from(action: BatchAction) -> Self {
        match action {
            BatchAction::Copy {
                source,
                destination,
                new_name,
            } => Command::Copy {
                source,
                destination,
                new_name,
            },
            BatchAction::Rename {
                folder_id,
                target,
                prefix,
                suffix,
                keep_extension,
            } => Command::Modify {
                folder_id,
                target,
                prefix,
                suffix,
                keep_extension,
            },
            BatchAction::Delete { folder_id, pattern } => Command::Delete { folder_id, pattern },
            BatchAction::CopyToSubfolders {
                source_id,
                folder_id,
            } => Command::CopyToSubfolders {
                source_id,
                folder_id,
            },
            BatchAction::Batch {} => Command::Batch(Vec::new()),
        }
    }
}

/// Parses `{"commands": [...]}`. Only a malformed document is an error;
/// a malformed entry becomes an entry carrying its parse error.
pub fn parse_batch(text: &str) -> Result<Vec<BatchEntry>, BatchFileError> {
    let file: BatchFile = serde_json::from_str(text)?;
    Ok(file.commands.into_iter().map(parse_entry).collect())
}

fn parse_entry(value: serde_json::Value) -> BatchEntry {
    let description = value
        .get("description")
        .and_then(serde_json::Value::as_str)
        .map(str::to_string);
    let command = serde_json::from_value::<BatchAction>(value)
        .map(Command::from)
        .map_err(|err| format!("invalid batch entry: {err}"));
    BatchEntry {
        description,
        command,
    }
}

pub async fn load_batch_file(path: &Path) -> Result<Command, BatchFileError> {
    let text = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| BatchFileError::Io {
            path: path.to_path_buf(),
            source,
        })?;
    Ok(Command::Batch(parse_batch(&text)?))
}
