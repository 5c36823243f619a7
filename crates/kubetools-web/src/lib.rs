//! Serving layer: dataset loading, category/search filtering, and local vote tracking behind a
//! small axum JSON API.

use std::collections::{BTreeSet, HashMap};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use anyhow::Context;
use async_trait::async_trait;
use axum::{
    extract::{Path as AxumPath, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use kubetools_core::{
    Dataset, ToolRecord, VoteMap, ALL_CATEGORIES, DATASET_FILE_NAME, VOTES_STORAGE_KEY,
};
use kubetools_storage::write_file_atomic;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

pub const CRATE_NAME: &str = "kubetools-web";

#[derive(Debug, Clone)]
pub struct WebConfig {
    pub data_dir: PathBuf,
    pub votes_dir: PathBuf,
    pub port: u16,
}

impl WebConfig {
    pub fn from_env() -> Self {
        let data_dir = std::env::var("KUBETOOLS_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./data"));
        let votes_dir = std::env::var("KUBETOOLS_VOTES_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("votes"));
        Self {
            data_dir,
            votes_dir,
            port: std::env::var("KUBETOOLS_WEB_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(8000),
        }
    }

    pub fn dataset_path(&self) -> PathBuf {
        self.data_dir.join(DATASET_FILE_NAME)
    }
}

// ---------------------------------------------------------------------------
// Dataset + filtering
// ---------------------------------------------------------------------------

/// Read-only view of the dataset artifact.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    tools: Dataset,
    categories: Vec<String>,
    load_error: Option<String>,
}

impl Catalog {
    pub fn new(tools: Dataset) -> Self {
        let categories = category_list(&tools);
        Self {
            tools,
            categories,
            load_error: None,
        }
    }

    /// Empty catalog carrying the reason loading stopped.
    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            load_error: Some(reason.into()),
            ..Self::new(Vec::new())
        }
    }

    /// Load the dataset; failures are logged and yield an empty catalog instead of an error.
    pub async fn load(path: &Path) -> Self {
        match load_dataset(path).await {
            Ok(tools) => {
                info!(path = %path.display(), tools = tools.len(), "dataset loaded");
                Self::new(tools)
            }
            Err(err) => {
                error!(path = %path.display(), error = %format!("{err:#}"), "failed to load dataset");
                Self::failed(format!("{err:#}"))
            }
        }
    }

    pub fn tools(&self) -> &[ToolRecord] {
        &self.tools
    }

    pub fn categories(&self) -> &[String] {
        &self.categories
    }

    pub fn load_error(&self) -> Option<&str> {
        self.load_error.as_deref()
    }

    pub fn contains(&self, id: u32) -> bool {
        self.tools.iter().any(|t| t.id == id)
    }
}

pub async fn load_dataset(path: &Path) -> anyhow::Result<Dataset> {
    let text = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

/// Distinct categories, sorted, with the synthetic `All` entry first.
pub fn category_list(tools: &[ToolRecord]) -> Vec<String> {
    let distinct: BTreeSet<&str> = tools.iter().map(|t| t.category.as_str()).collect();
    std::iter::once(ALL_CATEGORIES.to_string())
        .chain(distinct.into_iter().map(str::to_string))
        .collect()
}

/// Records in `category` (or any, for `All`) whose name or description contains `query`,
/// ignoring case. Relative order is preserved.
pub fn filter_tools<'a>(tools: &'a [ToolRecord], category: &str, query: &str) -> Vec<&'a ToolRecord> {
    let needle = query.to_lowercase();
    tools
        .iter()
        .filter(|t| category == ALL_CATEGORIES || t.category == category)
        .filter(|t| {
            t.name.to_lowercase().contains(&needle)
                || t.description.to_lowercase().contains(&needle)
        })
        .collect()
}

pub fn listing_summary(count: usize, category: &str, query: &str) -> String {
    let mut summary = format!("Showing {count} tools");
    if category != ALL_CATEGORIES {
        summary.push_str(&format!(" in {category}"));
    }
    if !query.is_empty() {
        summary.push_str(&format!(" matching \"{query}\""));
    }
    summary
}

// ---------------------------------------------------------------------------
// Vote store
// ---------------------------------------------------------------------------

/// Durable key-value storage the vote store persists into.
#[async_trait]
pub trait KeyValueStorage: Send + Sync {
    async fn get(&self, key: &str) -> anyhow::Result<Option<String>>;
    async fn set(&self, key: &str, value: &str) -> anyhow::Result<()>;
}

/// One JSON file per key under `root`, replaced atomically on every write.
#[derive(Debug, Clone)]
pub struct FileStorage {
    root: PathBuf,
}

impl FileStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(format!("{key}.json"))
    }
}

#[async_trait]
impl KeyValueStorage for FileStorage {
    async fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        let path = self.path_for(key);
        match tokio::fs::read_to_string(&path).await {
            Ok(text) => Ok(Some(text)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err).with_context(|| format!("reading {}", path.display())),
        }
    }

    async fn set(&self, key: &str, value: &str) -> anyhow::Result<()> {
        write_file_atomic(&self.path_for(key), value.as_bytes()).await
    }
}

#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: StdMutex<HashMap<String, String>>,
}

#[async_trait]
impl KeyValueStorage for MemoryStorage {
    async fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(entries.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> anyhow::Result<()> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum VoteStoreError {
    #[error("serializing votes: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error(transparent)]
    Persist(#[from] anyhow::Error),
}

/// Local per-tool vote counts. Counts only ever grow, one at a time.
pub struct VoteStore {
    storage: Box<dyn KeyValueStorage>,
    votes: VoteMap,
}

impl VoteStore {
    pub async fn open(storage: Box<dyn KeyValueStorage>) -> Self {
        let mut store = Self {
            storage,
            votes: VoteMap::new(),
        };
        store.votes = store.load().await;
        store
    }

    /// Read the persisted map; absent or unreadable data is an empty map.
    pub async fn load(&self) -> VoteMap {
        let text = match self.storage.get(VOTES_STORAGE_KEY).await {
            Ok(Some(text)) => text,
            Ok(None) => return VoteMap::new(),
            Err(err) => {
                warn!(error = %format!("{err:#}"), "reading votes failed; starting empty");
                return VoteMap::new();
            }
        };
        serde_json::from_str(&text).unwrap_or_else(|err| {
            warn!(error = %err, "stored votes are unparsable; starting empty");
            VoteMap::new()
        })
    }

    pub fn votes(&self) -> &VoteMap {
        &self.votes
    }

    pub fn count(&self, id: u32) -> u64 {
        self.votes.get(&id).copied().unwrap_or(0)
    }

    /// Add one vote for `id` and persist the whole map before returning the new count.
    pub async fn increment(&mut self, id: u32) -> Result<u64, VoteStoreError> {
        let mut next = self.votes.clone();
        let count = next.entry(id).or_insert(0);
        *count += 1;
        let count = *count;

        let text = serde_json::to_string(&next)?;
        self.storage
            .set(VOTES_STORAGE_KEY, &text)
            .await
            .context("persisting votes")?;
        self.votes = next;
        Ok(count)
    }
}

// ---------------------------------------------------------------------------
// HTTP API
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct AppState {
    pub catalog: Arc<Catalog>,
    pub votes: Arc<Mutex<VoteStore>>,
}

impl AppState {
    pub fn new(catalog: Catalog, votes: VoteStore) -> Self {
        Self {
            catalog: Arc::new(catalog),
            votes: Arc::new(Mutex::new(votes)),
        }
    }
}

#[derive(Debug, Deserialize, Default)]
struct ToolsQuery {
    category: Option<String>,
    q: Option<String>,
}

#[derive(Debug, Serialize)]
struct StatusView<'a> {
    loaded: bool,
    tools: usize,
    categories: usize,
    load_error: Option<&'a str>,
}

#[derive(Debug, Serialize)]
struct ToolView<'a> {
    #[serde(flatten)]
    tool: &'a ToolRecord,
    votes: u64,
}

#[derive(Debug, Serialize)]
struct ToolListView<'a> {
    category: String,
    query: String,
    total: usize,
    summary: String,
    tools: Vec<ToolView<'a>>,
}

#[derive(Debug, Serialize)]
struct VoteView {
    id: u32,
    votes: u64,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/api/status", get(status_handler))
        .route("/api/categories", get(categories_handler))
        .route("/api/tools", get(tools_handler))
        .route("/api/votes", get(votes_handler))
        .route("/api/tools/{id}/vote", post(vote_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(config: WebConfig) -> anyhow::Result<()> {
    let catalog = Catalog::load(&config.dataset_path()).await;
    let votes = VoteStore::open(Box::new(FileStorage::new(&config.votes_dir))).await;
    let listener = TcpListener::bind(("0.0.0.0", config.port))
        .await
        .with_context(|| format!("binding port {}", config.port))?;
    info!(port = config.port, "serving kubetools catalog");
    axum::serve(listener, app(AppState::new(catalog, votes))).await?;
    Ok(())
}

async fn status_handler(State(state): State<Arc<AppState>>) -> Response {
    let catalog = &state.catalog;
    Json(StatusView {
        loaded: catalog.load_error().is_none(),
        tools: catalog.tools().len(),
        categories: catalog.categories().len(),
        load_error: catalog.load_error(),
    })
    .into_response()
}

async fn categories_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(state.catalog.categories()).into_response()
}

async fn tools_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ToolsQuery>,
) -> Response {
    let category = query
        .category
        .unwrap_or_else(|| ALL_CATEGORIES.to_string());
    let q = query.q.unwrap_or_default();

    let votes = state.votes.lock().await;
    let tools = filter_tools(state.catalog.tools(), &category, &q)
        .into_iter()
        .map(|tool| ToolView {
            tool,
            votes: votes.count(tool.id),
        })
        .collect::<Vec<_>>();

    Json(ToolListView {
        total: tools.len(),
        summary: listing_summary(tools.len(), &category, &q),
        category,
        query: q,
        tools,
    })
    .into_response()
}

async fn votes_handler(State(state): State<Arc<AppState>>) -> Response {
    let votes = state.votes.lock().await;
    Json(votes.votes()).into_response()
}

async fn vote_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<u32>,
) -> Response {
    if !state.catalog.contains(id) {
        return error_response(StatusCode::NOT_FOUND, format!("tool {id} not found"));
    }
    let mut votes = state.votes.lock().await;
    match votes.increment(id).await {
        Ok(count) => Json(VoteView { id, votes: count }).into_response(),
        Err(err) => {
            error!(id, error = %err, "failed to record vote");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
        }
    }
}

fn error_response(status: StatusCode, message: String) -> Response {
    (status, Json(serde_json::json!({ "error": message }))).into_response()
}
