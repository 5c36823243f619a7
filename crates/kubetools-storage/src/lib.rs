//! HTTP fetch, popularity lookup, and atomic file storage utilities for kubetools.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::header::{ACCEPT, AUTHORIZATION};
use reqwest::StatusCode;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info_span, warn, Instrument};
use url::Url;
use uuid::Uuid;

pub const CRATE_NAME: &str = "kubetools-storage";

pub const DEFAULT_GITHUB_API_URL: &str = "https://api.github.com";

const SUPPORTED_HOSTS: [&str; 2] = ["github.com", "www.github.com"];

/// Write `bytes` to `path` via a sibling temp file and an atomic rename.
///
/// Missing parent directories are created first. Readers of `path` observe either the previous
/// contents or the complete new contents, never a partial write.
pub async fn write_file_atomic(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent)
        .await
        .with_context(|| format!("creating directory {}", parent.display()))?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp file {}", temp_path.display()))?;
    let written = async {
        file.write_all(bytes).await?;
        file.flush().await?;
        file.sync_all().await
    }
    .await;
    drop(file);
    if let Err(err) = written {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| format!("writing temp file {}", temp_path.display()));
    }

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| {
            format!(
                "atomically renaming temp file {} -> {}",
                temp_path.display(),
                path.display()
            )
        });
    }
    Ok(())
}

/// Where a source snapshot landed and whether identical bytes were already there.
#[derive(Debug, Clone)]
pub struct StoredSnapshot {
    pub path: PathBuf,
    pub deduplicated: bool,
}

/// Raw source documents keyed by content: `<root>/<source_id>/<sha256>.<ext>`.
///
/// Unchanged documents map to the same file, so the store only grows when the source changes.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn snapshot_path(&self, source_id: &str, bytes: &[u8], extension: &str) -> PathBuf {
        let digest = hex::encode(Sha256::digest(bytes));
        let ext = match extension.trim_start_matches('.').trim() {
            "" => "bin",
            ext => ext,
        };
        self.root.join(source_id).join(format!("{digest}.{ext}"))
    }

    pub async fn store_snapshot(
        &self,
        source_id: &str,
        extension: &str,
        bytes: &[u8],
    ) -> anyhow::Result<StoredSnapshot> {
        let path = self.snapshot_path(source_id, bytes, extension);
        let deduplicated = fs::try_exists(&path)
            .await
            .with_context(|| format!("checking snapshot path {}", path.display()))?;
        if !deduplicated {
            write_file_atomic(&path, bytes).await?;
        }
        Ok(StoredSnapshot { path, deduplicated })
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: Some("kubetools-bot/0.1".to_string()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// Single-shot GET client. No retries: a failed fetch is reported to the caller as-is.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    pub async fn fetch_bytes(
        &self,
        run_id: Uuid,
        source_id: &str,
        url: &str,
    ) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", %run_id, source_id, url);
        async {
            let resp = self.client.get(url).send().await?;
            let status = resp.status();
            let final_url = resp.url().to_string();

            if !status.is_success() {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: final_url,
                });
            }

            let body = resp.bytes().await?.to_vec();
            Ok(FetchedResponse {
                status,
                final_url,
                body,
            })
        }
        .instrument(span)
        .await
    }
}

/// Resolves a popularity count for a tool URL.
///
/// Implementations never fail: anything that cannot be resolved counts as 0.
#[async_trait]
pub trait PopularityLookup: Send + Sync {
    async fn stars_for(&self, url: &str) -> u64;
}

#[derive(Debug, Error)]
pub enum LookupError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("malformed repository metadata: {0}")]
    Decode(#[from] serde_json::Error),
}

#[derive(Debug, Deserialize)]
struct RepoMetadata {
    #[serde(default)]
    stargazers_count: Option<u64>,
}

/// Extract `(owner, repository)` from a URL on a supported code-hosting domain.
///
/// Returns `None` for empty, unparsable, or foreign-hosted URLs and for URLs with fewer than
/// two path segments after the host.
pub fn repo_coordinates(url: &str) -> Option<(String, String)> {
    let url = url.trim();
    if url.is_empty() {
        return None;
    }
    let parsed = Url::parse(url).ok()?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return None;
    }
    let host = parsed.host_str()?;
    if !SUPPORTED_HOSTS
        .iter()
        .any(|supported| host.eq_ignore_ascii_case(supported))
    {
        return None;
    }

    let mut segments = parsed.path_segments()?.filter(|s| !s.is_empty());
    let owner = segments.next()?;
    let repo = segments.next()?;
    let repo = repo.strip_suffix(".git").unwrap_or(repo);
    if repo.is_empty() {
        return None;
    }
    Some((owner.to_string(), repo.to_string()))
}

/// Popularity lookup against the GitHub repository metadata endpoint.
#[derive(Debug, Clone)]
pub struct GitHubStarsClient {
    client: reqwest::Client,
    api_base: String,
    token: Option<String>,
}

impl GitHubStarsClient {
    pub fn new(http: &HttpFetcher, api_base: impl Into<String>, token: Option<String>) -> Self {
        let api_base = api_base.into().trim_end_matches('/').to_string();
        Self {
            client: http.client().clone(),
            api_base,
            token: token.filter(|t| !t.trim().is_empty()),
        }
    }

    pub fn has_token(&self) -> bool {
        self.token.is_some()
    }

    pub async fn fetch_stars(&self, owner: &str, repo: &str) -> Result<u64, LookupError> {
        let endpoint = format!("{}/repos/{owner}/{repo}", self.api_base);
        let mut request = self
            .client
            .get(&endpoint)
            .header(ACCEPT, "application/vnd.github+json");
        if let Some(token) = &self.token {
            request = request.header(AUTHORIZATION, format!("token {token}"));
        }

        let resp = request.send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(LookupError::HttpStatus {
                status: status.as_u16(),
                url: endpoint,
            });
        }

        let body = resp.bytes().await?;
        let metadata: RepoMetadata = serde_json::from_slice(&body)?;
        Ok(metadata.stargazers_count.unwrap_or(0))
    }
}

#[async_trait]
impl PopularityLookup for GitHubStarsClient {
    async fn stars_for(&self, url: &str) -> u64 {
        let Some((owner, repo)) = repo_coordinates(url) else {
            debug!(url, "no supported repository in url; skipping lookup");
            return 0;
        };
        match self.fetch_stars(&owner, &repo).await {
            Ok(stars) => stars,
            Err(err) => {
                warn!(url, error = %err, "popularity lookup failed; defaulting to 0");
                0
            }
        }
    }
}
