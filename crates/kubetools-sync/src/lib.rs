//! Ingestion pipeline: fetch the source document, parse its tables, enrich with popularity
//! counts, and publish the dataset artifact.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use kubetools_adapters::{
    adapter_for_source, AdapterContext, DocumentTarget, KUBETOOLS_README_SOURCE_ID,
};
use kubetools_core::{ToolRecord, DATASET_FILE_NAME};
use kubetools_storage::{
    write_file_atomic, ArtifactStore, GitHubStarsClient, HttpClientConfig, HttpFetcher,
    PopularityLookup, DEFAULT_GITHUB_API_URL,
};
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "kubetools-sync";

pub const DEFAULT_SOURCE_URL: &str =
    "https://raw.githubusercontent.com/ajeetraina/kubetools/main/README.md";

#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub source_url: String,
    pub source_id: String,
    pub data_dir: PathBuf,
    pub artifacts_dir: PathBuf,
    pub github_api_url: String,
    pub github_token: Option<String>,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    /// Popularity lookups in flight at once. 1 keeps the loop strictly sequential.
    pub enrich_concurrency: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            source_url: DEFAULT_SOURCE_URL.to_string(),
            source_id: KUBETOOLS_README_SOURCE_ID.to_string(),
            data_dir: PathBuf::from("./data"),
            artifacts_dir: PathBuf::from("./artifacts"),
            github_api_url: DEFAULT_GITHUB_API_URL.to_string(),
            github_token: None,
            user_agent: "kubetools-bot/0.1".to_string(),
            http_timeout_secs: 20,
            enrich_concurrency: 1,
        }
    }
}

impl IngestConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            source_url: std::env::var("KUBETOOLS_SOURCE_URL").unwrap_or(defaults.source_url),
            source_id: std::env::var("KUBETOOLS_SOURCE_ID").unwrap_or(defaults.source_id),
            data_dir: std::env::var("KUBETOOLS_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            artifacts_dir: std::env::var("KUBETOOLS_ARTIFACTS_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.artifacts_dir),
            github_api_url: std::env::var("GITHUB_API_URL").unwrap_or(defaults.github_api_url),
            github_token: std::env::var("GITHUB_TOKEN").ok(),
            user_agent: std::env::var("KUBETOOLS_USER_AGENT").unwrap_or(defaults.user_agent),
            http_timeout_secs: std::env::var("KUBETOOLS_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.http_timeout_secs),
            enrich_concurrency: std::env::var("KUBETOOLS_ENRICH_CONCURRENCY")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|n: &usize| *n > 0)
                .unwrap_or(defaults.enrich_concurrency),
        }
    }

    pub fn output_path(&self) -> PathBuf {
        self.data_dir.join(DATASET_FILE_NAME)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub source_id: String,
    pub parsed_tools: usize,
    pub tools_with_stars: usize,
    pub output_path: String,
    /// Absent when the snapshot could not be stored; the run itself still succeeds.
    pub raw_artifact_path: Option<String>,
}

pub struct IngestPipeline {
    config: IngestConfig,
    artifact_store: ArtifactStore,
    http: HttpFetcher,
    lookup: Arc<dyn PopularityLookup>,
}

impl IngestPipeline {
    pub fn new(config: IngestConfig) -> Result<Self> {
        let artifact_store = ArtifactStore::new(config.artifacts_dir.clone());
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
        })?;
        let lookup = GitHubStarsClient::new(
            &http,
            config.github_api_url.clone(),
            config.github_token.clone(),
        );
        if !lookup.has_token() {
            info!("GITHUB_TOKEN not set; popularity lookups use the anonymous rate limit");
        }
        Ok(Self {
            config,
            artifact_store,
            http,
            lookup: Arc::new(lookup),
        })
    }

    pub fn with_lookup(mut self, lookup: Arc<dyn PopularityLookup>) -> Self {
        self.lookup = lookup;
        self
    }

    pub async fn run_once(&self) -> Result<IngestRunSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let adapter = adapter_for_source(&self.config.source_id)
            .with_context(|| format!("no adapter registered for {}", self.config.source_id))?;

        info!(%run_id, url = %self.config.source_url, "Fetching source document");
        let ctx = AdapterContext {
            run_id,
            fetched_at: started_at,
        };
        let target = DocumentTarget {
            url: self.config.source_url.clone(),
        };
        let document = adapter
            .fetch_document(&self.http, &ctx, &target)
            .await
            .with_context(|| format!("fetching source document {}", target.url))?;

        let raw_artifact_path = match self
            .artifact_store
            .store_snapshot(adapter.source_id(), "md", document.text.as_bytes())
            .await
        {
            Ok(snapshot) => Some(snapshot.path.display().to_string()),
            Err(err) => {
                warn!(error = %format!("{err:#}"), "could not store raw source snapshot; continuing");
                None
            }
        };

        info!("Parsing markdown tables");
        let records = adapter.parse_document(&document);
        info!("Parsed {} tools from the source document", records.len());

        let records =
            enrich_records(records, self.lookup.as_ref(), self.config.enrich_concurrency).await;

        let output_path = self.config.output_path();
        write_dataset(&output_path, &records).await?;
        info!("Data saved to {}", output_path.display());

        Ok(IngestRunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            source_id: adapter.source_id().to_string(),
            parsed_tools: records.len(),
            tools_with_stars: records.iter().filter(|r| r.stars > 0).count(),
            output_path: output_path.display().to_string(),
            raw_artifact_path,
        })
    }
}

/// Assign `stars` to every record, keeping at most `concurrency` lookups in flight.
///
/// Output order always matches input order. A lookup never fails the batch.
pub async fn enrich_records(
    records: Vec<ToolRecord>,
    lookup: &dyn PopularityLookup,
    concurrency: usize,
) -> Vec<ToolRecord> {
    stream::iter(records)
        .map(|mut record| async move {
            record.stars = lookup.stars_for(&record.url).await;
            info!("Processed: {} ({})", record.name, record.category);
            record
        })
        .buffered(concurrency.max(1))
        .collect()
        .await
}

/// Publish the dataset as pretty-printed JSON; the previous file stays intact on failure.
pub async fn write_dataset(path: &Path, records: &[ToolRecord]) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(records).context("serializing dataset")?;
    write_file_atomic(path, &bytes)
        .await
        .with_context(|| format!("writing dataset {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use tempfile::tempdir;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const README: &str = "\
## Cluster Management
| Sr No | Tool Name | Description | GitHub Popularity |
|-------|-----------|-------------|-------------------|
| 1 | Monokle | [Visual tool for Kubernetes configs](https://github.com/kubeshop/monokle) | badge |
| 2 | Lens | [Kubernetes IDE](https://k8slens.dev/) | badge |
## Pods
| 1 | kubetail | [Tail logs](https://github.com/johanhaleby/kubetail) | badge |
";

    fn record(id: u32, name: &str, url: &str) -> ToolRecord {
        ToolRecord {
            id,
            name: name.to_string(),
            description: format!("{name} description"),
            url: url.to_string(),
            category: "Pods".to_string(),
            stars: 0,
        }
    }

    fn test_config(server: &MockServer, root: &Path) -> IngestConfig {
        IngestConfig {
            source_url: format!("{}/README.md", server.uri()),
            data_dir: root.join("data"),
            artifacts_dir: root.join("artifacts"),
            github_api_url: server.uri(),
            http_timeout_secs: 5,
            ..Default::default()
        }
    }

    struct StubLookup {
        stars: HashMap<String, u64>,
        delay_ms: HashMap<String, u64>,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    impl StubLookup {
        fn new(entries: &[(&str, u64, u64)]) -> Self {
            Self {
                stars: entries.iter().map(|(u, s, _)| (u.to_string(), *s)).collect(),
                delay_ms: entries.iter().map(|(u, _, d)| (u.to_string(), *d)).collect(),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl PopularityLookup for StubLookup {
        async fn stars_for(&self, url: &str) -> u64 {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            let delay = self.delay_ms.get(url).copied().unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(delay)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            self.stars.get(url).copied().unwrap_or(0)
        }
    }

    #[derive(Clone, Default)]
    struct CapturedLogs(Arc<std::sync::Mutex<Vec<u8>>>);

    impl CapturedLogs {
        fn contents(&self) -> String {
            String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
        }
    }

    impl std::io::Write for CapturedLogs {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn default_config_targets_kubetools_readme() {
        let config = IngestConfig::default();
        assert_eq!(config.source_url, DEFAULT_SOURCE_URL);
        assert_eq!(config.source_id, KUBETOOLS_README_SOURCE_ID);
        assert_eq!(config.enrich_concurrency, 1);
        assert_eq!(config.output_path(), PathBuf::from("./data/tools.json"));
    }

    #[tokio::test]
    async fn sequential_enrichment_keeps_one_lookup_in_flight() {
        let lookup = StubLookup::new(&[("a", 10, 5), ("b", 20, 5), ("c", 30, 5)]);
        let records = vec![record(1, "a", "a"), record(2, "b", "b"), record(3, "c", "c")];

        let enriched = enrich_records(records, &lookup, 1).await;

        assert_eq!(
            enriched.iter().map(|r| r.stars).collect::<Vec<_>>(),
            vec![10, 20, 30]
        );
        assert_eq!(lookup.max_in_flight.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn bounded_enrichment_preserves_input_order() {
        let lookup = StubLookup::new(&[("slow", 1, 40), ("mid", 2, 20), ("fast", 3, 0)]);
        let records = vec![
            record(1, "slow", "slow"),
            record(2, "mid", "mid"),
            record(3, "fast", "fast"),
            record(4, "none", ""),
        ];

        let enriched = enrich_records(records, &lookup, 2).await;

        assert_eq!(
            enriched.iter().map(|r| (r.id, r.stars)).collect::<Vec<_>>(),
            vec![(1, 1), (2, 2), (3, 3), (4, 0)]
        );
        assert!(lookup.max_in_flight.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn run_once_writes_enriched_dataset_and_raw_snapshot() {
        let server = MockServer::start().await;
        let dir = tempdir().expect("tempdir");
        Mock::given(method("GET"))
            .and(path("/README.md"))
            .respond_with(ResponseTemplate::new(200).set_body_string(README))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/repos/kubeshop/monokle"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"stargazers_count": 2400})),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/repos/johanhaleby/kubetail"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let config = test_config(&server, dir.path());
        let summary = IngestPipeline::new(config.clone())
            .unwrap()
            .run_once()
            .await
            .expect("ingest run");

        assert_eq!(summary.parsed_tools, 3);
        assert_eq!(summary.tools_with_stars, 1);
        assert!(Path::new(summary.raw_artifact_path.as_deref().unwrap()).exists());

        let written: Vec<ToolRecord> =
            serde_json::from_str(&std::fs::read_to_string(config.output_path()).unwrap()).unwrap();
        let view: Vec<(u32, &str, &str, u64)> = written
            .iter()
            .map(|r| (r.id, r.name.as_str(), r.category.as_str(), r.stars))
            .collect();
        assert_eq!(
            view,
            vec![
                (1, "Monokle", "Cluster Management", 2400),
                (2, "Lens", "Cluster Management", 0),
                (3, "kubetail", "Pods", 0),
            ]
        );
    }

    #[tokio::test]
    async fn unwritable_artifacts_dir_does_not_abort_the_run() {
        let server = MockServer::start().await;
        let dir = tempdir().expect("tempdir");
        Mock::given(method("GET"))
            .and(path("/README.md"))
            .respond_with(ResponseTemplate::new(200).set_body_string(README))
            .mount(&server)
            .await;

        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, b"not a directory").unwrap();
        let mut config = test_config(&server, dir.path());
        config.artifacts_dir = blocker.join("artifacts");

        let summary = IngestPipeline::new(config.clone())
            .unwrap()
            .with_lookup(Arc::new(StubLookup::new(&[])))
            .run_once()
            .await
            .expect("snapshot failure is not fatal");

        assert_eq!(summary.raw_artifact_path, None);
        assert_eq!(summary.parsed_tools, 3);
        assert!(config.output_path().exists());
    }

    #[tokio::test]
    async fn repeated_runs_reuse_the_same_snapshot() {
        let server = MockServer::start().await;
        let dir = tempdir().expect("tempdir");
        Mock::given(method("GET"))
            .and(path("/README.md"))
            .respond_with(ResponseTemplate::new(200).set_body_string(README))
            .mount(&server)
            .await;

        let config = test_config(&server, dir.path());
        let pipeline = IngestPipeline::new(config.clone())
            .unwrap()
            .with_lookup(Arc::new(StubLookup::new(&[])));
        let first = pipeline.run_once().await.expect("first run");
        let second = pipeline.run_once().await.expect("second run");

        assert!(first.raw_artifact_path.is_some());
        assert_eq!(first.raw_artifact_path, second.raw_artifact_path);
        let snapshots = std::fs::read_dir(config.artifacts_dir.join(KUBETOOLS_README_SOURCE_ID))
            .unwrap()
            .count();
        assert_eq!(snapshots, 1);
    }

    #[tokio::test]
    async fn enrichment_logs_a_processed_line_per_record() {
        let logs = CapturedLogs::default();
        let sink = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || sink.clone())
            .with_ansi(false)
            .with_target(false)
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let lookup = StubLookup::new(&[]);
        let mut first = record(1, "kubetail", "");
        first.category = "Pods".into();
        let mut second = record(2, "Monokle", "");
        second.category = "Cluster Management".into();
        enrich_records(vec![first, second], &lookup, 1).await;

        let output = logs.contents();
        assert!(output.contains("Processed: kubetail (Pods)"), "{output}");
        assert!(output.contains("Processed: Monokle (Cluster Management)"), "{output}");
    }

    #[tokio::test]
    async fn source_fetch_failure_aborts_without_output() {
        let server = MockServer::start().await;
        let dir = tempdir().expect("tempdir");
        Mock::given(method("GET"))
            .and(path("/README.md"))
            .respond_with(ResponseTemplate::new(502))
            .mount(&server)
            .await;

        let config = test_config(&server, dir.path());
        let err = IngestPipeline::new(config.clone())
            .unwrap()
            .run_once()
            .await
            .unwrap_err();

        assert!(format!("{err:#}").contains("fetching source document"));
        assert!(!config.output_path().exists());
    }

    #[tokio::test]
    async fn output_write_failure_is_fatal_and_keeps_previous_dataset() {
        let server = MockServer::start().await;
        let dir = tempdir().expect("tempdir");
        Mock::given(method("GET"))
            .and(path("/README.md"))
            .respond_with(ResponseTemplate::new(200).set_body_string(README))
            .mount(&server)
            .await;

        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, b"not a directory").unwrap();
        let mut config = test_config(&server, dir.path());
        config.data_dir = blocker.join("data");

        let lookup = Arc::new(StubLookup::new(&[]));
        let err = IngestPipeline::new(config)
            .unwrap()
            .with_lookup(lookup)
            .run_once()
            .await
            .unwrap_err();

        assert!(format!("{err:#}").contains("writing dataset"));
        assert_eq!(std::fs::read(&blocker).unwrap(), b"not a directory");
    }

    #[tokio::test]
    async fn unknown_source_id_is_rejected() {
        let server = MockServer::start().await;
        let dir = tempdir().expect("tempdir");
        let mut config = test_config(&server, dir.path());
        config.source_id = "nope".into();

        let err = IngestPipeline::new(config).unwrap().run_once().await.unwrap_err();
        assert!(err.to_string().contains("no adapter registered for nope"));
    }
}
