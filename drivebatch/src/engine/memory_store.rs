use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use super::store::{Item, ItemKind, Page, RemoteStore, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum Call {
    List,
    Metadata,
    CreateFolder,
    Copy,
    Rename,
    Delete,
}

#[derive(Default)]
struct State {
    items: HashMap<String, Item>,
    children: HashMap<String, Vec<String>>,
    failures: HashMap<(Call, String), VecDeque<StoreError>>,
    calls: Vec<String>,
    next_id: u64,
}

/// In-memory store with scripted failures, keyed by call kind and the id
/// (or folder name for `CreateFolder`) the call targets.
#[derive(Default)]
pub(crate) struct MemoryStore {
    state: Mutex<State>,
    copy_latency: Mutex<Option<Duration>>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl MemoryStore {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn add_root(&self, id: &str) {
        let mut state = self.state.lock().unwrap();
        state.children.entry(id.to_string()).or_default();
    }

    pub(crate) fn add_folder(&self, parent: &str, id: &str, name: &str) {
        self.insert(Item {
            id: id.to_string(),
            name: name.to_string(),
            kind: ItemKind::Folder,
            size: 0,
            parent_id: Some(parent.to_string()),
            checksum: None,
        });
    }

    pub(crate) fn add_file(
        &self,
        parent: &str,
        id: &str,
        name: &str,
        size: u64,
        checksum: Option<&str>,
    ) {
        self.insert(Item {
            id: id.to_string(),
            name: name.to_string(),
            kind: ItemKind::File,
            size,
            parent_id: Some(parent.to_string()),
            checksum: checksum.map(str::to_string),
        });
    }

    pub(crate) fn fail(
        &self,
        call: Call,
        key: &str,
        errors: impl IntoIterator<Item = StoreError>,
    ) {
        let mut state = self.state.lock().unwrap();
        state
            .failures
            .entry((call, key.to_string()))
            .or_default()
            .extend(errors);
    }

    /// Makes every copy take `latency`, so overlapping copies can be observed.
    pub(crate) fn set_copy_latency(&self, latency: Duration) {
        *self.copy_latency.lock().unwrap() = Some(latency);
    }

    pub(crate) fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    pub(crate) fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub(crate) fn mutation_calls(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|call| !call.starts_with("list:") && !call.starts_with("get:"))
            .collect()
    }

    pub(crate) fn child_names(&self, folder: &str) -> Vec<String> {
        let state = self.state.lock().unwrap();
        state
            .children
            .get(folder)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| state.items.get(id))
                    .map(|item| item.name.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub(crate) fn item(&self, id: &str) -> Option<Item> {
        self.state.lock().unwrap().items.get(id).cloned()
    }

    fn insert(&self, item: Item) {
        let mut state = self.state.lock().unwrap();
        if let Some(parent) = &item.parent_id {
            state
                .children
                .entry(parent.clone())
                .or_default()
                .push(item.id.clone());
        }
        if item.kind == ItemKind::Folder {
            state.children.entry(item.id.clone()).or_default();
        }
        state.items.insert(item.id.clone(), item);
    }

    fn begin(&self, call: Call, key: &str, label: String) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(label);
        match state
            .failures
            .get_mut(&(call, key.to_string()))
            .and_then(VecDeque::pop_front)
        {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn simulate_copy_latency(&self) {
        let latency = *self.copy_latency.lock().unwrap();
        let Some(latency) = latency else {
            return;
        };
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(latency).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }

    fn allocate_id(&self) -> String {
        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        format!("new-{}", state.next_id)
    }
}

#[async_trait]
impl RemoteStore for MemoryStore {
    async fn list_children(
        &self,
        folder_id: &str,
        page_token: Option<&str>,
        page_size: u32,
    ) -> Result<Page, StoreError> {
        self.begin(Call::List, folder_id, format!("list:{folder_id}"))?;
        let state = self.state.lock().unwrap();
        let ids = state
            .children
            .get(folder_id)
            .ok_or_else(|| StoreError::NotFound(folder_id.to_string()))?;
        let offset: usize = page_token.and_then(|t| t.parse().ok()).unwrap_or(0);
        let end = (offset + page_size as usize).min(ids.len());
        let items = ids[offset.min(end)..end]
            .iter()
            .filter_map(|id| state.items.get(id).cloned())
            .collect();
        Ok(Page {
            items,
            next_page_token: (end < ids.len()).then(|| end.to_string()),
        })
    }

    async fn get_metadata(&self, item_id: &str) -> Result<Item, StoreError> {
        self.begin(Call::Metadata, item_id, format!("get:{item_id}"))?;
        self.item(item_id)
            .ok_or_else(|| StoreError::NotFound(item_id.to_string()))
    }

    async fn create_folder(&self, name: &str, parent_id: &str) -> Result<Item, StoreError> {
        self.begin(
            Call::CreateFolder,
            name,
            format!("mkdir:{name}->{parent_id}"),
        )?;
        let id = self.allocate_id();
        self.add_folder(parent_id, &id, name);
        self.item(&id)
            .ok_or_else(|| StoreError::Permanent("folder vanished".into()))
    }

    async fn copy_item(
        &self,
        item_id: &str,
        dest_parent_id: &str,
        new_name: Option<&str>,
    ) -> Result<Item, StoreError> {
        self.simulate_copy_latency().await;
        self.begin(Call::Copy, item_id, format!("copy:{item_id}->{dest_parent_id}"))?;
        let source = self
            .item(item_id)
            .ok_or_else(|| StoreError::NotFound(item_id.to_string()))?;
        let id = self.allocate_id();
        self.insert(Item {
            id: id.clone(),
            name: new_name.unwrap_or(&source.name).to_string(),
            parent_id: Some(dest_parent_id.to_string()),
            ..source
        });
        self.item(&id)
            .ok_or_else(|| StoreError::Permanent("copy vanished".into()))
    }

    async fn rename_item(&self, item_id: &str, new_name: &str) -> Result<Item, StoreError> {
        self.begin(Call::Rename, item_id, format!("rename:{item_id}->{new_name}"))?;
        let mut state = self.state.lock().unwrap();
        let item = state
            .items
            .get_mut(item_id)
            .ok_or_else(|| StoreError::NotFound(item_id.to_string()))?;
        item.name = new_name.to_string();
        Ok(item.clone())
    }

    async fn delete_item(&self, item_id: &str) -> Result<(), StoreError> {
        self.begin(Call::Delete, item_id, format!("delete:{item_id}"))?;
        let mut state = self.state.lock().unwrap();
        let item = state
            .items
            .remove(item_id)
            .ok_or_else(|| StoreError::NotFound(item_id.to_string()))?;
        if let Some(siblings) = item
            .parent_id
            .as_ref()
            .and_then(|parent| state.children.get_mut(parent))
        {
            siblings.retain(|id| id != item_id);
        }
        Ok(())
    }
}
