//! Crawl → normalize → extract → download orchestration for the registry
//! mirror, plus the CSV sinks for both output tables.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use gsmirror_client::{
    CatalogQuery, HttpClientConfig, HttpRegistryClient, RegistryClient, RequestProfile,
};
use gsmirror_core::{
    fingerprint, parse_goal_id, value_repr, DocumentManifest, FingerprintError, GoalRow,
    ProjectRow, RawRecord, SdgGoal, FINGERPRINT_KEYS,
};
use gsmirror_store::{classify_file, DocumentStore};
use serde::Serialize;
use serde_json::Value as JsonValue;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "gsmirror-pipeline";

#[derive(Debug, Clone)]
pub struct MirrorConfig {
    /// First catalog page to request.
    pub start_page: u32,
    /// Safety bound; the crawl also stops at the first empty page.
    pub max_page: u32,
    pub page_size: u32,
    /// Fixed pause between page requests, applied whether the page
    /// succeeded or failed.
    pub page_delay: Duration,
    pub download_concurrency: usize,
    pub documents_dir: PathBuf,
    pub records_csv: PathBuf,
    pub goals_csv: PathBuf,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub scheduler_enabled: bool,
    pub refresh_cron: String,
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            start_page: 1,
            max_page: 29,
            page_size: 25,
            page_delay: Duration::from_secs(5),
            download_concurrency: 4,
            documents_dir: PathBuf::from("./mirror/project_files"),
            records_csv: PathBuf::from("./mirror/main_project_details.csv"),
            goals_csv: PathBuf::from("./mirror/sdg_goals.csv"),
            user_agent: "gsmirror-bot/0.1".to_string(),
            http_timeout_secs: 20,
            scheduler_enabled: false,
            refresh_cron: "0 6 * * *".to_string(),
        }
    }
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl MirrorConfig {
    pub fn from_env() -> Self {
        let base = Self::default();
        Self {
            start_page: env_parse("GSMIRROR_START_PAGE", base.start_page),
            max_page: env_parse("GSMIRROR_MAX_PAGE", base.max_page),
            page_size: env_parse("GSMIRROR_PAGE_SIZE", base.page_size),
            page_delay: Duration::from_millis(env_parse(
                "GSMIRROR_PAGE_DELAY_MS",
                base.page_delay.as_millis() as u64,
            )),
            download_concurrency: env_parse(
                "GSMIRROR_DOWNLOAD_CONCURRENCY",
                base.download_concurrency,
            ),
            documents_dir: std::env::var("GSMIRROR_DOCUMENTS_DIR")
                .map(PathBuf::from)
                .unwrap_or(base.documents_dir),
            records_csv: std::env::var("GSMIRROR_RECORDS_CSV")
                .map(PathBuf::from)
                .unwrap_or(base.records_csv),
            goals_csv: std::env::var("GSMIRROR_GOALS_CSV")
                .map(PathBuf::from)
                .unwrap_or(base.goals_csv),
            user_agent: std::env::var("GSMIRROR_USER_AGENT").unwrap_or(base.user_agent),
            http_timeout_secs: env_parse("GSMIRROR_HTTP_TIMEOUT_SECS", base.http_timeout_secs),
            scheduler_enabled: std::env::var("GSMIRROR_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(base.scheduler_enabled),
            refresh_cron: std::env::var("GSMIRROR_REFRESH_CRON").unwrap_or(base.refresh_cron),
        }
    }
}

/// Cooperative stop flag, checked between page fetches and between per-record
/// downloads. Triggering it flushes whatever has been accumulated so far.
#[derive(Debug, Clone, Default)]
pub struct StopSignal {
    flag: Arc<AtomicBool>,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_triggered(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MirrorRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub pages_fetched: usize,
    pub pages_failed: usize,
    pub records: usize,
    pub duplicates_skipped: usize,
    pub goal_rows: usize,
    pub manifests_resolved: usize,
    pub files_downloaded: usize,
    pub files_skipped: usize,
    pub files_failed: usize,
    pub stopped_early: bool,
    pub records_csv: String,
    pub goals_csv: String,
}

/// Flatten one raw catalog record into the canonical row shape.
///
/// Geographic coordinates are not part of [`ProjectRow`], so `latitude` and
/// `longitude` fall away in the projection. The scalar `sustaincert_url` is
/// wrapped into a serialized singleton list to match the other multi-valued
/// columns, and the nested goal and label arrays become opaque JSON blobs.
pub fn normalize_record(raw: &RawRecord) -> Result<ProjectRow, FingerprintError> {
    let hsh = fingerprint(raw, &FINGERPRINT_KEYS)?;

    let scalar = |key: &str| raw.get(key).map(value_repr).unwrap_or_default();
    let blob = |key: &str| match raw.get(key) {
        None | Some(JsonValue::Null) => String::new(),
        Some(value) => value.to_string(),
    };
    let singleton_url = match raw.get("sustaincert_url") {
        None | Some(JsonValue::Null) => String::new(),
        Some(value) => JsonValue::Array(vec![value.clone()]).to_string(),
    };

    Ok(ProjectRow {
        id: scalar("id"),
        created_at: scalar("created_at"),
        updated_at: scalar("updated_at"),
        name: scalar("name"),
        description: scalar("description"),
        status: scalar("status"),
        gsf_standards_version: scalar("gsf_standards_version"),
        estimated_annual_credits: scalar("estimated_annual_credits"),
        crediting_period_start_date: scalar("crediting_period_start_date"),
        crediting_period_end_date: scalar("crediting_period_end_date"),
        methodology: scalar("methodology"),
        project_type: scalar("type"),
        size: scalar("size"),
        sustaincert_id: scalar("sustaincert_id"),
        sustaincert_url: singleton_url,
        project_developer: scalar("project_developer"),
        carbon_stream: scalar("carbon_stream"),
        country: scalar("country"),
        country_code: scalar("country_code"),
        state: scalar("state"),
        programme_of_activities: scalar("programme_of_activities"),
        poa_project_id: scalar("poa_project_id"),
        poa_project_sustaincert_id: scalar("poa_project_sustaincert_id"),
        poa_project_name: scalar("poa_project_name"),
        sustainable_development_goals: blob("sustainable_development_goals"),
        labels: blob("labels"),
        hsh,
        files: String::new(),
    })
}

/// Derive the distinct-goal table from the accumulated rows.
///
/// Keyed by the leading numeric token of the goal name; the first-seen
/// product list wins and later occurrences are dropped, since goal
/// definitions are assumed invariant across records. Unparseable goal names
/// are skipped, never fatal.
pub fn extract_goal_rows(rows: &[ProjectRow]) -> Vec<GoalRow> {
    let mut seen: HashSet<String> = HashSet::new();
    let mut out = Vec::new();

    for row in rows {
        if row.sustainable_development_goals.is_empty() {
            continue;
        }
        let goals: Vec<SdgGoal> = match serde_json::from_str(&row.sustainable_development_goals) {
            Ok(goals) => goals,
            Err(err) => {
                warn!(record = %row.id, %err, "unreadable sustainable_development_goals blob");
                continue;
            }
        };
        for goal in goals {
            let goal_id = match parse_goal_id(&goal.name) {
                Ok(id) => id,
                Err(err) => {
                    warn!(record = %row.id, %err, "skipping goal");
                    continue;
                }
            };
            if !seen.insert(goal_id.clone()) {
                continue;
            }
            let product =
                serde_json::to_string(&goal.issuable_products).unwrap_or_else(|_| "[]".to_string());
            out.push(GoalRow {
                goal: goal.name,
                product,
                goal_id,
            });
        }
    }

    out
}

#[derive(Debug, Default, Clone, Copy)]
struct DownloadStats {
    resolved: usize,
    downloaded: usize,
    skipped: usize,
    failed: usize,
}

async fn download_for_project(
    client: &dyn RegistryClient,
    store: &DocumentStore,
    project_id: &str,
) -> (Option<DocumentManifest>, DownloadStats) {
    let mut stats = DownloadStats::default();

    let file_names = match client.list_documents(project_id).await {
        Ok(names) => names,
        Err(err) => {
            warn!(project_id, %err, "document list lookup failed");
            stats.failed += 1;
            return (None, stats);
        }
    };
    stats.resolved = 1;

    if file_names.is_empty() {
        info!(project_id, "no public files for this registry entry");
        return (Some(DocumentManifest::empty(project_id)), stats);
    }

    let mut manifest = DocumentManifest::empty(project_id);
    for file_name in file_names {
        if classify_file(&file_name).is_err() {
            warn!(project_id, file = %file_name, "unsupported file type, skipping");
            stats.skipped += 1;
            continue;
        }
        match client.fetch_document(project_id, &file_name).await {
            Ok(bytes) => match store.write_document(&file_name, &bytes).await {
                Ok(_) => {
                    manifest.files.push(file_name);
                    stats.downloaded += 1;
                }
                Err(err) => {
                    warn!(project_id, file = %file_name, %err, "failed to persist document");
                    stats.failed += 1;
                }
            },
            Err(err) => {
                warn!(project_id, file = %file_name, %err, "failed to download document");
                stats.failed += 1;
            }
        }
    }

    (Some(manifest), stats)
}

#[derive(Debug, Default)]
struct CrawlOutcome {
    rows: Vec<ProjectRow>,
    pages_fetched: usize,
    pages_failed: usize,
    duplicates_skipped: usize,
    stopped: bool,
}

pub struct MirrorPipeline {
    config: MirrorConfig,
    client: Arc<dyn RegistryClient>,
    store: DocumentStore,
    stop: StopSignal,
}

impl MirrorPipeline {
    pub fn new(config: MirrorConfig) -> Result<Self> {
        let client = HttpRegistryClient::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            profile: RequestProfile {
                user_agent: config.user_agent.clone(),
                origin: Some("https://registry.goldstandard.org".to_string()),
                referer: Some("https://registry.goldstandard.org/".to_string()),
            },
            catalog_query: CatalogQuery {
                size: config.page_size,
                ..Default::default()
            },
            concurrency: config.download_concurrency,
            ..Default::default()
        })?;
        Ok(Self::with_client(config, Arc::new(client)))
    }

    pub fn with_client(config: MirrorConfig, client: Arc<dyn RegistryClient>) -> Self {
        let store = DocumentStore::new(config.documents_dir.clone());
        Self {
            config,
            client,
            store,
            stop: StopSignal::new(),
        }
    }

    /// Handle for requesting a cooperative stop from another task.
    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    /// Crawl the configured page range, normalizing and deduplicating as
    /// pages arrive. A failed page contributes zero rows and never aborts
    /// the remaining pages; an empty page ends the crawl early.
    async fn crawl(&self) -> CrawlOutcome {
        let mut outcome = CrawlOutcome::default();
        let mut seen_fingerprints: HashSet<String> = HashSet::new();

        for page in self.config.start_page..=self.config.max_page {
            if self.stop.is_triggered() {
                info!(page, "stop requested, ending crawl");
                outcome.stopped = true;
                break;
            }

            match self.client.fetch_page(page).await {
                Ok(records) if records.is_empty() => {
                    info!(page, "empty page, catalog exhausted");
                    break;
                }
                Ok(records) => {
                    for raw in &records {
                        match normalize_record(raw) {
                            Ok(row) => {
                                if seen_fingerprints.insert(row.hsh.clone()) {
                                    outcome.rows.push(row);
                                } else {
                                    debug!(page, hsh = %row.hsh, "duplicate record skipped");
                                    outcome.duplicates_skipped += 1;
                                }
                            }
                            Err(err) => {
                                warn!(page, %err, "record cannot be fingerprinted, skipping");
                            }
                        }
                    }
                    outcome.pages_fetched += 1;
                }
                Err(err) => {
                    warn!(page, %err, "page fetch failed");
                    outcome.pages_failed += 1;
                }
            }

            if page < self.config.max_page && !self.config.page_delay.is_zero() {
                tokio::time::sleep(self.config.page_delay).await;
            }
        }

        outcome
    }

    /// Resolve and download document sets for every row with a bounded worker
    /// pool. Manifests are attached in original row order, not completion
    /// order.
    async fn download_documents(
        &self,
        rows: &mut [ProjectRow],
        summary: &mut MirrorRunSummary,
    ) -> Result<()> {
        self.store
            .ensure_root()
            .await
            .context("creating documents directory")?;

        let limit = Arc::new(Semaphore::new(self.config.download_concurrency.max(1)));
        let mut tasks: JoinSet<(usize, Option<DocumentManifest>, DownloadStats)> = JoinSet::new();

        for (index, row) in rows.iter().enumerate() {
            if self.stop.is_triggered() {
                info!(record = %row.id, "stop requested, ending document downloads");
                summary.stopped_early = true;
                break;
            }
            let Some(project_id) = row.document_project_id() else {
                warn!(record = %row.id, "row has no sustaincert url, skipping document lookup");
                continue;
            };

            let client = Arc::clone(&self.client);
            let store = self.store.clone();
            let limit = Arc::clone(&limit);
            tasks.spawn(async move {
                let _permit = limit.acquire_owned().await.expect("semaphore not closed");
                let (manifest, stats) =
                    download_for_project(client.as_ref(), &store, &project_id).await;
                (index, manifest, stats)
            });
        }

        let mut manifests: Vec<Option<DocumentManifest>> = vec![None; rows.len()];
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, manifest, stats)) => {
                    manifests[index] = manifest;
                    summary.manifests_resolved += stats.resolved;
                    summary.files_downloaded += stats.downloaded;
                    summary.files_skipped += stats.skipped;
                    summary.files_failed += stats.failed;
                }
                Err(err) => warn!(%err, "download task failed to join"),
            }
        }

        for (row, manifest) in rows.iter_mut().zip(manifests) {
            if let Some(manifest) = manifest {
                row.files = serde_json::to_string(&manifest.files)
                    .unwrap_or_else(|_| "[]".to_string());
            }
        }

        Ok(())
    }

    /// Run the full pipeline once: crawl all pages, derive the goal table,
    /// pull every record's document set, and write both CSV outputs. Unit
    /// failures are logged and accounted in the summary; whatever has been
    /// accumulated is flushed even when the run ends by cancellation.
    pub async fn run_once(&self) -> Result<MirrorRunSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        info!(%run_id, start_page = self.config.start_page, max_page = self.config.max_page, "mirror run starting");

        let crawl = self.crawl().await;
        let mut rows = crawl.rows;

        let goal_rows = extract_goal_rows(&rows);

        let mut summary = MirrorRunSummary {
            run_id,
            started_at,
            finished_at: started_at,
            pages_fetched: crawl.pages_fetched,
            pages_failed: crawl.pages_failed,
            records: rows.len(),
            duplicates_skipped: crawl.duplicates_skipped,
            goal_rows: goal_rows.len(),
            manifests_resolved: 0,
            files_downloaded: 0,
            files_skipped: 0,
            files_failed: 0,
            stopped_early: crawl.stopped,
            records_csv: self.config.records_csv.display().to_string(),
            goals_csv: self.config.goals_csv.display().to_string(),
        };

        self.download_documents(&mut rows, &mut summary).await?;

        write_csv(&self.config.records_csv, &rows).context("writing records table")?;
        write_csv(&self.config.goals_csv, &goal_rows).context("writing goal table")?;

        summary.finished_at = Utc::now();
        info!(
            %run_id,
            records = summary.records,
            pages_failed = summary.pages_failed,
            files_downloaded = summary.files_downloaded,
            stopped_early = summary.stopped_early,
            "mirror run finished"
        );
        Ok(summary)
    }
}

/// Serialize rows to CSV with headers in struct declaration order, creating
/// parent directories as needed.
fn write_csv<T: Serialize>(path: &Path, rows: &[T]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let mut writer =
        csv::Writer::from_path(path).with_context(|| format!("creating {}", path.display()))?;
    for row in rows {
        writer
            .serialize(row)
            .with_context(|| format!("writing row to {}", path.display()))?;
    }
    writer
        .flush()
        .with_context(|| format!("flushing {}", path.display()))?;
    Ok(())
}

/// Optional periodic refresh. Returns `None` unless the scheduler is enabled
/// in config; the caller starts the returned scheduler and keeps it alive.
pub async fn maybe_build_scheduler(
    pipeline: Arc<MirrorPipeline>,
) -> Result<Option<JobScheduler>> {
    if !pipeline.config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let cron = pipeline.config.refresh_cron.clone();
    let job = Job::new_async(cron.as_str(), move |_uuid, _lock| {
        let pipeline = Arc::clone(&pipeline);
        Box::pin(async move {
            match pipeline.run_once().await {
                Ok(summary) => info!(
                    run_id = %summary.run_id,
                    records = summary.records,
                    "scheduled refresh complete"
                ),
                Err(err) => warn!(%err, "scheduled refresh failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}

pub async fn run_mirror_once_from_env() -> Result<MirrorRunSummary> {
    let config = MirrorConfig::from_env();
    let pipeline = MirrorPipeline::new(config)?;
    pipeline.run_once().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use gsmirror_client::FetchError;
    use serde_json::json;
    use std::collections::HashMap;
    use tempfile::tempdir;

    #[derive(Debug, Clone)]
    enum PageResult {
        Records(Vec<RawRecord>),
        Http(u16),
    }

    #[derive(Debug, Default)]
    struct FakeRegistryClient {
        pages: Vec<PageResult>,
        documents: HashMap<String, Vec<String>>,
        payloads: HashMap<(String, String), Vec<u8>>,
        list_failures: HashSet<String>,
    }

    #[async_trait]
    impl RegistryClient for FakeRegistryClient {
        async fn fetch_page(&self, page: u32) -> Result<Vec<RawRecord>, FetchError> {
            match self.pages.get((page - 1) as usize) {
                Some(PageResult::Records(records)) => Ok(records.clone()),
                Some(PageResult::Http(status)) => Err(FetchError::HttpStatus {
                    status: *status,
                    url: format!("fake://projects?page={page}"),
                }),
                None => Ok(Vec::new()),
            }
        }

        async fn list_documents(&self, project_id: &str) -> Result<Vec<String>, FetchError> {
            if self.list_failures.contains(project_id) {
                return Err(FetchError::HttpStatus {
                    status: 500,
                    url: format!("fake://publiclist?projectID={project_id}"),
                });
            }
            Ok(self.documents.get(project_id).cloned().unwrap_or_default())
        }

        async fn fetch_document(
            &self,
            project_id: &str,
            file_name: &str,
        ) -> Result<Vec<u8>, FetchError> {
            self.payloads
                .get(&(project_id.to_string(), file_name.to_string()))
                .cloned()
                .ok_or(FetchError::HttpStatus {
                    status: 404,
                    url: format!("fake://publicdownload?projectID={project_id}&fileName={file_name}"),
                })
        }
    }

    fn raw_record(id: u64, sustaincert_id: u64, name: &str, country: &str) -> RawRecord {
        let value = json!({
            "id": id,
            "created_at": "2024-01-01T00:00:00Z",
            "updated_at": "2024-06-01T00:00:00Z",
            "name": name,
            "country": country,
            "sustaincert_id": sustaincert_id,
            "sustaincert_url": format!("https://platform.sustain-cert.com/public-project/{sustaincert_id}"),
            "status": "CERTIFIED_DESIGN",
            "latitude": 12.34,
            "longitude": 56.78,
            "sustainable_development_goals": [],
            "labels": [],
        });
        match value {
            JsonValue::Object(map) => map,
            _ => unreachable!(),
        }
    }

    fn test_config(dir: &Path) -> MirrorConfig {
        MirrorConfig {
            page_delay: Duration::ZERO,
            max_page: 5,
            documents_dir: dir.join("project_files"),
            records_csv: dir.join("main_project_details.csv"),
            goals_csv: dir.join("sdg_goals.csv"),
            ..Default::default()
        }
    }

    fn pipeline_with(client: FakeRegistryClient, dir: &Path) -> MirrorPipeline {
        MirrorPipeline::with_client(test_config(dir), Arc::new(client))
    }

    #[test]
    fn normalize_wraps_url_and_serializes_nested_arrays() {
        let mut raw = raw_record(1, 100, "Cookstoves", "Kenya");
        raw.insert(
            "sustainable_development_goals".to_string(),
            json!([{"name": "13: Climate Action", "issuable_products": ["VER"]}]),
        );
        raw.insert("labels".to_string(), json!(["CDM"]));

        let row = normalize_record(&raw).expect("normalize");
        assert_eq!(
            row.sustaincert_url,
            "[\"https://platform.sustain-cert.com/public-project/100\"]"
        );
        assert_eq!(
            row.sustainable_development_goals,
            "[{\"name\":\"13: Climate Action\",\"issuable_products\":[\"VER\"]}]"
        );
        assert_eq!(row.labels, "[\"CDM\"]");
        assert_eq!(row.hsh.len(), 64);
    }

    #[test]
    fn normalize_rejects_records_without_identity_fields() {
        let mut raw = raw_record(1, 100, "Cookstoves", "Kenya");
        raw.remove("country");
        assert!(normalize_record(&raw).is_err());
    }

    #[test]
    fn goal_extraction_first_seen_wins() {
        let mut row_a = ProjectRow::default();
        row_a.sustainable_development_goals =
            r#"[{"name":"3: No Poverty","issuable_products":["A"]}]"#.to_string();
        let mut row_b = ProjectRow::default();
        row_b.sustainable_development_goals =
            r#"[{"name":"3: No Poverty","issuable_products":["B"]}]"#.to_string();

        let goals = extract_goal_rows(&[row_a, row_b]);
        assert_eq!(goals.len(), 1);
        assert_eq!(goals[0].goal_id, "3");
        assert_eq!(goals[0].goal, "3: No Poverty");
        assert_eq!(goals[0].product, "[\"A\"]");
    }

    #[test]
    fn malformed_goal_names_are_skipped_not_fatal() {
        let mut row = ProjectRow::default();
        row.sustainable_development_goals = r#"[
            {"name":"Climate Action","issuable_products":["X"]},
            {"name":"13: Climate Action","issuable_products":["VER"]}
        ]"#
        .to_string();

        let goals = extract_goal_rows(&[row]);
        assert_eq!(goals.len(), 1);
        assert_eq!(goals[0].goal_id, "13");
    }

    #[tokio::test]
    async fn failed_page_contributes_nothing_and_does_not_abort() {
        let dir = tempdir().expect("tempdir");
        let client = FakeRegistryClient {
            pages: vec![
                PageResult::Records(vec![
                    raw_record(1, 100, "Alpha", "Kenya"),
                    raw_record(2, 101, "Beta", "India"),
                ]),
                PageResult::Http(500),
                PageResult::Records(vec![raw_record(3, 102, "Gamma", "Peru")]),
            ],
            ..Default::default()
        };
        let pipeline = pipeline_with(client, dir.path());

        let summary = pipeline.run_once().await.expect("run");
        assert_eq!(summary.pages_fetched, 2);
        assert_eq!(summary.pages_failed, 1);
        assert_eq!(summary.records, 3);

        let csv = std::fs::read_to_string(dir.path().join("main_project_details.csv"))
            .expect("records csv");
        let ids: Vec<&str> = csv
            .lines()
            .skip(1)
            .map(|line| line.split(',').next().unwrap())
            .collect();
        assert_eq!(ids, vec!["1", "2", "3"]);
    }

    #[tokio::test]
    async fn duplicate_fingerprints_collapse_across_pages() {
        let dir = tempdir().expect("tempdir");
        let mut reappearance = raw_record(9, 100, "Alpha", "Kenya");
        reappearance.insert("status".to_string(), json!("LISTED"));
        let client = FakeRegistryClient {
            pages: vec![
                PageResult::Records(vec![raw_record(1, 100, "Alpha", "Kenya")]),
                PageResult::Records(vec![reappearance]),
            ],
            ..Default::default()
        };
        let pipeline = pipeline_with(client, dir.path());

        let summary = pipeline.run_once().await.expect("run");
        assert_eq!(summary.records, 1);
        assert_eq!(summary.duplicates_skipped, 1);
    }

    #[tokio::test]
    async fn empty_document_list_is_a_valid_manifest() {
        let dir = tempdir().expect("tempdir");
        let client = FakeRegistryClient {
            pages: vec![PageResult::Records(vec![raw_record(1, 100, "Alpha", "Kenya")])],
            documents: HashMap::from([("100".to_string(), Vec::new())]),
            ..Default::default()
        };
        let pipeline = pipeline_with(client, dir.path());

        let summary = pipeline.run_once().await.expect("run");
        assert_eq!(summary.manifests_resolved, 1);
        assert_eq!(summary.files_failed, 0);

        let csv = std::fs::read_to_string(dir.path().join("main_project_details.csv"))
            .expect("records csv");
        let row = csv.lines().nth(1).expect("one row");
        assert!(row.ends_with("\"[]\"") || row.ends_with("[]"));
    }

    #[tokio::test]
    async fn extension_routing_and_per_file_isolation() {
        let dir = tempdir().expect("tempdir");
        let client = FakeRegistryClient {
            pages: vec![PageResult::Records(vec![raw_record(1, 100, "Alpha", "Kenya")])],
            documents: HashMap::from([(
                "100".to_string(),
                vec![
                    "report.pdf".to_string(),
                    "data.csv".to_string(),
                    "data.xyz".to_string(),
                    "missing.pdf".to_string(),
                ],
            )]),
            payloads: HashMap::from([
                (
                    ("100".to_string(), "report.pdf".to_string()),
                    vec![0x25, 0x50, 0x44, 0x46],
                ),
                (
                    ("100".to_string(), "data.csv".to_string()),
                    b"a,b\n1,2\n".to_vec(),
                ),
            ]),
            ..Default::default()
        };
        let pipeline = pipeline_with(client, dir.path());

        let summary = pipeline.run_once().await.expect("run");
        assert_eq!(summary.files_downloaded, 2);
        assert_eq!(summary.files_skipped, 1);
        assert_eq!(summary.files_failed, 1);

        let files_dir = dir.path().join("project_files");
        assert_eq!(
            std::fs::read(files_dir.join("report.pdf")).expect("pdf"),
            vec![0x25, 0x50, 0x44, 0x46]
        );
        assert_eq!(
            std::fs::read_to_string(files_dir.join("data.csv")).expect("csv"),
            "a,b\n1,2\n"
        );
        assert!(!files_dir.join("data.xyz").exists());

        let csv = std::fs::read_to_string(dir.path().join("main_project_details.csv"))
            .expect("records csv");
        assert!(csv.contains("report.pdf"));
        assert!(csv.contains("data.csv"));
        assert!(!csv.contains("data.xyz"));
    }

    #[tokio::test]
    async fn rerunning_downloads_leaves_files_byte_identical() {
        let dir = tempdir().expect("tempdir");
        let mk_client = || FakeRegistryClient {
            pages: vec![PageResult::Records(vec![raw_record(1, 100, "Alpha", "Kenya")])],
            documents: HashMap::from([("100".to_string(), vec!["report.pdf".to_string()])]),
            payloads: HashMap::from([(
                ("100".to_string(), "report.pdf".to_string()),
                b"stable bytes".to_vec(),
            )]),
            ..Default::default()
        };

        pipeline_with(mk_client(), dir.path())
            .run_once()
            .await
            .expect("first run");
        let first = std::fs::read(dir.path().join("project_files/report.pdf")).expect("first");

        pipeline_with(mk_client(), dir.path())
            .run_once()
            .await
            .expect("second run");
        let second = std::fs::read(dir.path().join("project_files/report.pdf")).expect("second");

        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn document_lookup_failure_is_isolated_per_record() {
        let dir = tempdir().expect("tempdir");
        let client = FakeRegistryClient {
            pages: vec![PageResult::Records(vec![
                raw_record(1, 100, "Alpha", "Kenya"),
                raw_record(2, 101, "Beta", "India"),
            ])],
            documents: HashMap::from([("101".to_string(), vec!["report.pdf".to_string()])]),
            payloads: HashMap::from([(
                ("101".to_string(), "report.pdf".to_string()),
                b"beta".to_vec(),
            )]),
            list_failures: HashSet::from(["100".to_string()]),
            ..Default::default()
        };
        let pipeline = pipeline_with(client, dir.path());

        let summary = pipeline.run_once().await.expect("run");
        assert_eq!(summary.manifests_resolved, 1);
        assert_eq!(summary.files_downloaded, 1);
        assert_eq!(summary.files_failed, 1);
        assert!(dir.path().join("project_files/report.pdf").exists());
    }

    #[tokio::test]
    async fn canonical_column_order_is_fixed() {
        let dir = tempdir().expect("tempdir");
        let mut record = raw_record(1, 100, "Alpha", "Kenya");
        record.insert(
            "sustainable_development_goals".to_string(),
            json!([{"name": "13: Climate Action", "issuable_products": ["VER"]}]),
        );
        let client = FakeRegistryClient {
            pages: vec![PageResult::Records(vec![record])],
            ..Default::default()
        };
        let pipeline = pipeline_with(client, dir.path());
        pipeline.run_once().await.expect("run");

        let csv = std::fs::read_to_string(dir.path().join("main_project_details.csv"))
            .expect("records csv");
        let header = csv.lines().next().expect("header");
        assert_eq!(
            header,
            "id,created_at,updated_at,name,description,status,gsf_standards_version,\
             estimated_annual_credits,crediting_period_start_date,crediting_period_end_date,\
             methodology,type,size,sustaincert_id,sustaincert_url,project_developer,\
             carbon_stream,country,country_code,state,programme_of_activities,poa_project_id,\
             poa_project_sustaincert_id,poa_project_name,sustainable_development_goals,labels,\
             hsh,files"
        );

        let goals_csv =
            std::fs::read_to_string(dir.path().join("sdg_goals.csv")).expect("goals csv");
        assert_eq!(goals_csv.lines().next().expect("header"), "goal,product,goal_id");
    }

    #[tokio::test]
    async fn stop_signal_flushes_partial_output() {
        let dir = tempdir().expect("tempdir");
        let client = FakeRegistryClient {
            pages: vec![PageResult::Records(vec![raw_record(1, 100, "Alpha", "Kenya")])],
            ..Default::default()
        };
        let pipeline = pipeline_with(client, dir.path());
        pipeline.stop_signal().trigger();

        let summary = pipeline.run_once().await.expect("run");
        assert!(summary.stopped_early);
        assert_eq!(summary.records, 0);
        assert!(dir.path().join("main_project_details.csv").exists());
        assert!(dir.path().join("sdg_goals.csv").exists());
    }
}
