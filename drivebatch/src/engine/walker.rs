use std::collections::VecDeque;
use std::sync::Arc;

use futures_util::Stream;
use thiserror::Error;

use super::retry::{RetryPolicy, RetryState, with_retry};
use super::store::{Item, RemoteStore, StoreError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalkEntry {
    pub item: Item,
    /// 1 for direct children of the walk root.
    pub depth: usize,
    pub path: String,
    /// Folder whose listing produced this entry.
    pub parent_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("failed to list folder `{path}` ({folder_id}): {source}")]
pub struct TraversalError {
    pub folder_id: String,
    pub path: String,
    pub source: StoreError,
}

struct Frame {
    folder_id: String,
    path: String,
    child_depth: usize,
    buffer: VecDeque<Item>,
    next_page_token: Option<String>,
    loaded: bool,
}

impl Frame {
    fn new(folder_id: String, path: String, child_depth: usize) -> Self {
        Self {
            folder_id,
            path,
            child_depth,
            buffer: VecDeque::new(),
            next_page_token: None,
            loaded: false,
        }
    }

    fn exhausted(&self) -> bool {
        self.loaded && self.buffer.is_empty() && self.next_page_token.is_none()
    }
}

/// Lazy depth-first, pre-order walk of a remote subtree.
///
/// Children keep the store's listing order. Each open folder holds at most
/// one page of children, and folders are expanded from an explicit stack.
/// A folder that cannot be listed yields one [`TraversalError`], is counted
/// as unreachable and is skipped; the rest of the walk carries on.
pub struct TreeWalker {
    store: Arc<dyn RemoteStore>,
    policy: RetryPolicy,
    page_size: u32,
    max_depth: Option<usize>,
    stack: Vec<Frame>,
    pending: Option<Frame>,
    unreachable: usize,
}

impl TreeWalker {
    pub fn new(
        store: Arc<dyn RemoteStore>,
        policy: RetryPolicy,
        root_id: &str,
        max_depth: Option<usize>,
        page_size: u32,
    ) -> Self {
        let root = Frame::new(root_id.to_string(), String::new(), 1);
        let stack = if max_depth == Some(0) {
            Vec::new()
        } else {
            vec![root]
        };
        Self {
            store,
            policy,
            page_size: page_size.max(1),
            max_depth,
            stack,
            pending: None,
            unreachable: 0,
        }
    }

    /// Number of folders that could not be listed so far.
    pub fn unreachable(&self) -> usize {
        self.unreachable
    }

    /// Do not descend into the folder returned by the last `next` call.
    pub fn prune(&mut self) {
        self.pending = None;
    }

    pub async fn next(&mut self) -> Option<Result<WalkEntry, TraversalError>> {
        if let Some(frame) = self.pending.take() {
            self.stack.push(frame);
        }

        loop {
            let frame = self.stack.last_mut()?;

            if let Some(item) = frame.buffer.pop_front() {
                let depth = frame.child_depth;
                let path = join_path(&frame.path, &item.name);
                let parent_id = frame.folder_id.clone();
                if item.is_folder() && self.max_depth.is_none_or(|max| depth < max) {
                    self.pending = Some(Frame::new(item.id.clone(), path.clone(), depth + 1));
                }
                return Some(Ok(WalkEntry {
                    item,
                    depth,
                    path,
                    parent_id,
                }));
            }

            if frame.exhausted() {
                self.stack.pop();
                continue;
            }

            let folder_id = frame.folder_id.clone();
            let token = frame.next_page_token.take();
            match self.fetch_page(&folder_id, token.as_deref()).await {
                Ok((items, next)) => {
                    let frame = self.stack.last_mut()?;
                    frame.buffer.extend(items);
                    frame.next_page_token = next;
                    frame.loaded = true;
                }
                Err(source) => {
                    let frame = self.stack.pop()?;
                    self.unreachable += 1;
                    tracing::warn!(
                        folder_id = %frame.folder_id,
                        path = %frame.path,
                        error = %source,
                        "folder is unreachable, skipping branch"
                    );
                    return Some(Err(TraversalError {
                        folder_id: frame.folder_id,
                        path: frame.path,
                        source,
                    }));
                }
            }
        }
    }

    pub fn into_stream(self) -> impl Stream<Item = Result<WalkEntry, TraversalError>> {
        futures_util::stream::unfold(self, |mut walker| async move {
            walker.next().await.map(|entry| (entry, walker))
        })
    }

    async fn fetch_page(
        &self,
        folder_id: &str,
        token: Option<&str>,
    ) -> Result<(Vec<Item>, Option<String>), StoreError> {
        let mut state = RetryState::default();
        let store = self.store.as_ref();
        let page_size = self.page_size;
        let page = with_retry(&self.policy, &mut state, move || {
            store.list_children(folder_id, token, page_size)
        })
        .await?;
        Ok((page.items, page.next_page_token))
    }
}

fn join_path(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_string()
    } else {
        format!("{parent}/{name}")
    }
}

/// Lists every child of `folder_id`, following page tokens.
pub async fn list_all_children(
    store: &dyn RemoteStore,
    policy: &RetryPolicy,
    folder_id: &str,
    page_size: u32,
) -> Result<Vec<Item>, StoreError> {
    let mut items = Vec::new();
    let mut token: Option<String> = None;
    loop {
        let mut state = RetryState::default();
        let current = token.as_deref();
        let page = with_retry(policy, &mut state, move || {
            store.list_children(folder_id, current, page_size.max(1))
        })
        .await?;
        items.extend(page.items);
        match page.next_page_token {
            Some(next) => token = Some(next),
            None => break,
        }
    }
    Ok(items)
}

#[cfg(test)]
#[path = "walker_tests.rs"]
mod tests;
