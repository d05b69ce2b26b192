use std::time::Duration;

use async_trait::async_trait;
use drivebatch_core::{ApiErrorClass, DriveClient, DriveError, DriveFile};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemKind {
    File,
    Folder,
}

/// A file or folder as seen by one listing or metadata call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    pub id: String,
    pub name: String,
    pub kind: ItemKind,
    pub size: u64,
    pub parent_id: Option<String>,
    pub checksum: Option<String>,
}

impl Item {
    pub fn is_folder(&self) -> bool {
        self.kind == ItemKind::Folder
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Page {
    pub items: Vec<Item>,
    pub next_page_token: Option<String>,
}

/// Closed set of failure classes every store call resolves to.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("rate limited by the remote store")]
    RateLimited { retry_after: Option<Duration> },
    #[error("transient store error: {0}")]
    Transient(String),
    #[error("permanent store error: {0}")]
    Permanent(String),
    #[error("item not found: {0}")]
    NotFound(String),
    #[error("already satisfied: {0}")]
    AlreadySatisfied(String),
}

impl StoreError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StoreError::RateLimited { .. } | StoreError::Transient(_)
        )
    }
}

impl From<DriveError> for StoreError {
    fn from(err: DriveError) -> Self {
        match err.classification() {
            ApiErrorClass::RateLimit => StoreError::RateLimited {
                retry_after: err.retry_after(),
            },
            ApiErrorClass::Transient => StoreError::Transient(err.to_string()),
            ApiErrorClass::NotFound => StoreError::NotFound(err.to_string()),
            ApiErrorClass::Auth | ApiErrorClass::Permanent => {
                StoreError::Permanent(err.to_string())
            }
        }
    }
}

#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn list_children(
        &self,
        folder_id: &str,
        page_token: Option<&str>,
        page_size: u32,
    ) -> Result<Page, StoreError>;

    async fn get_metadata(&self, item_id: &str) -> Result<Item, StoreError>;

    async fn create_folder(&self, name: &str, parent_id: &str) -> Result<Item, StoreError>;

    async fn copy_item(
        &self,
        item_id: &str,
        dest_parent_id: &str,
        new_name: Option<&str>,
    ) -> Result<Item, StoreError>;

    async fn rename_item(&self, item_id: &str, new_name: &str) -> Result<Item, StoreError>;

    async fn delete_item(&self, item_id: &str) -> Result<(), StoreError>;
}

#[async_trait]
impl RemoteStore for DriveClient {
    async fn list_children(
        &self,
        folder_id: &str,
        page_token: Option<&str>,
        page_size: u32,
    ) -> Result<Page, StoreError> {
        let list = DriveClient::list_children(self, folder_id, page_token, page_size).await?;
        Ok(Page {
            items: list
                .files
                .into_iter()
                .map(|file| {
                    let mut item = item_from_file(file);
                    item.parent_id = Some(folder_id.to_string());
                    item
                })
                .collect(),
            next_page_token: list.next_page_token.filter(|token| !token.is_empty()),
        })
    }

    async fn get_metadata(&self, item_id: &str) -> Result<Item, StoreError> {
        Ok(item_from_file(self.get_file(item_id).await?))
    }

    async fn create_folder(&self, name: &str, parent_id: &str) -> Result<Item, StoreError> {
        Ok(item_from_file(
            DriveClient::create_folder(self, name, parent_id).await?,
        ))
    }

    async fn copy_item(
        &self,
        item_id: &str,
        dest_parent_id: &str,
        new_name: Option<&str>,
    ) -> Result<Item, StoreError> {
        Ok(item_from_file(
            self.copy_file(item_id, dest_parent_id, new_name).await?,
        ))
    }

    async fn rename_item(&self, item_id: &str, new_name: &str) -> Result<Item, StoreError> {
        Ok(item_from_file(self.rename_file(item_id, new_name).await?))
    }

    async fn delete_item(&self, item_id: &str) -> Result<(), StoreError> {
        Ok(self.delete_file(item_id).await?)
    }
}

fn item_from_file(file: DriveFile) -> Item {
    let kind = if file.is_folder() {
        ItemKind::Folder
    } else {
        ItemKind::File
    };
    let size = match kind {
        ItemKind::Folder => 0,
        ItemKind::File => file.size_bytes(),
    };
    Item {
        id: file.id,
        name: file.name,
        kind,
        size,
        parent_id: file.parents.into_iter().next(),
        checksum: file.md5_checksum,
    }
}
