//! Export archiving, export fetch, and the known-workout store backends.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, info_span, Instrument};
use uuid::Uuid;
use workout_core::{
    IdentifierSet, WorkoutRecord, ACTIVITY_TYPE, CALORIES_BURNED, DISTANCE_MI, WORKOUT_TIME_SECONDS,
};

pub const CRATE_NAME: &str = "workout-storage";

// ---------------------------------------------------------------------------
// Export archive
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ArchivedExport {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

#[derive(Debug, Clone)]
pub struct ExportArchive {
    root: PathBuf,
}

impl ExportArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn archive_relative_path(&self, received_at: DateTime<Utc>, file_key: &str, content_hash: &str) -> PathBuf {
        let stamp = received_at.format("%Y%m%d_%H%M%S").to_string();
        PathBuf::from("archive")
            .join(stamp)
            .join(file_stem(file_key))
            .join(format!("{content_hash}.csv"))
    }

    /// Store bytes immutably using a hash-addressed path and atomic temp-file rename.
    pub async fn store_export(
        &self,
        received_at: DateTime<Utc>,
        file_key: &str,
        bytes: &[u8],
    ) -> anyhow::Result<ArchivedExport> {
        let content_hash = Self::sha256_hex(bytes);
        let relative_path = self.archive_relative_path(received_at, file_key, &content_hash);
        let absolute_path = self.root.join(&relative_path);
        let parent = absolute_path
            .parent()
            .with_context(|| format!("archive path {} has no parent", absolute_path.display()))?
            .to_path_buf();

        fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("creating archive directory {}", parent.display()))?;

        let archived = |deduplicated| ArchivedExport {
            content_hash: content_hash.clone(),
            relative_path: relative_path.clone(),
            absolute_path: absolute_path.clone(),
            byte_size: bytes.len(),
            deduplicated,
        };

        if fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking archive path {}", absolute_path.display()))?
        {
            debug!(path = %absolute_path.display(), "export already archived");
            return Ok(archived(true));
        }

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp archive file {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp archive file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp archive file {}", temp_path.display()))?;
        drop(file);

        match fs::rename(&temp_path, &absolute_path).await {
            Ok(()) => Ok(archived(false)),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                let _ = fs::remove_file(&temp_path).await;
                Ok(archived(true))
            }
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(err).with_context(|| {
                    format!(
                        "atomically renaming temp archive {} -> {}",
                        temp_path.display(),
                        absolute_path.display()
                    )
                })
            }
        }
    }

    /// Copy `current/<key>` aside to `archive/<stem>_<stamp>.csv`. `None` when there is no current file.
    pub async fn version_current(&self, file_key: &str, now: DateTime<Utc>) -> anyhow::Result<Option<PathBuf>> {
        let current = self.root.join("current").join(file_key);
        if !fs::try_exists(&current)
            .await
            .with_context(|| format!("checking {}", current.display()))?
        {
            return Ok(None);
        }

        let relative = PathBuf::from("archive").join(format!(
            "{}_{}.csv",
            file_stem(file_key),
            now.format("%Y%m%d_%H%M%S")
        ));
        let target = self.root.join(&relative);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        fs::copy(&current, &target)
            .await
            .with_context(|| format!("versioning {} -> {}", current.display(), target.display()))?;
        Ok(Some(relative))
    }

    pub async fn write_current(&self, file_key: &str, bytes: &[u8]) -> anyhow::Result<PathBuf> {
        let target = self.root.join("current").join(file_key);
        write_atomic(&target, bytes)
            .await
            .with_context(|| format!("writing {}", target.display()))?;
        Ok(target)
    }
}

fn file_stem(file_key: &str) -> String {
    let stem = Path::new(file_key)
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    let stem: String = stem
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    if stem.is_empty() {
        "export".to_string()
    } else {
        stem
    }
}

async fn write_atomic(target: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let parent = target.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).await?;
    let temp_path = parent.join(format!(".{}.tmp", Uuid::new_v4()));
    fs::write(&temp_path, bytes).await?;
    if let Err(err) = fs::rename(&temp_path, target).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Export fetch
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedExport {
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

#[derive(Debug, Clone)]
pub struct ExportFetcher {
    client: reqwest::Client,
}

impl ExportFetcher {
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

    pub async fn fetch_export(&self, run_id: Uuid, url: &str) -> Result<FetchedExport, FetchError> {
        let span = info_span!("export_fetch", %run_id, url);
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
            info!(bytes = body.len(), "fetched export");
            Ok(FetchedExport {
                status,
                final_url,
                body,
            })
        }
        .instrument(span)
        .await
    }
}

// ---------------------------------------------------------------------------
// Known-workout stores
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed store file: {0}")]
    Json(#[from] serde_json::Error),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

#[async_trait]
pub trait KnownWorkoutStore: Send + Sync {
    fn backend_name(&self) -> &'static str;

    async fn fetch_known_identifiers(&self) -> Result<IdentifierSet, StoreError>;

    async fn record_new(&self, records: &[WorkoutRecord]) -> Result<usize, StoreError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreBackend {
    Local { path: PathBuf },
    Postgres { database_url: String },
}

pub async fn open_store(backend: &StoreBackend) -> Result<Box<dyn KnownWorkoutStore>, StoreError> {
    match backend {
        StoreBackend::Local { path } => Ok(Box::new(LocalKnownStore::new(path.clone()))),
        StoreBackend::Postgres { database_url } => {
            Ok(Box::new(PgKnownStore::connect(database_url).await?))
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct KnownWorkoutsFile {
    #[serde(default)]
    workout_ids: Vec<String>,
}

#[derive(Debug)]
pub struct LocalKnownStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl LocalKnownStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_file(&self) -> Result<KnownWorkoutsFile, StoreError> {
        if !fs::try_exists(&self.path).await? {
            return Ok(KnownWorkoutsFile::default());
        }
        let text = fs::read_to_string(&self.path).await?;
        Ok(serde_json::from_str(&text)?)
    }
}

#[async_trait]
impl KnownWorkoutStore for LocalKnownStore {
    fn backend_name(&self) -> &'static str {
        "local"
    }

    async fn fetch_known_identifiers(&self) -> Result<IdentifierSet, StoreError> {
        let file = self.read_file().await?;
        Ok(file.workout_ids.into_iter().collect())
    }

    async fn record_new(&self, records: &[WorkoutRecord]) -> Result<usize, StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut known: IdentifierSet = self.read_file().await?.workout_ids.into_iter().collect();
        let added = records
            .iter()
            .filter_map(WorkoutRecord::workout_id)
            .filter(|id| known.insert(*id))
            .count();
        if added == 0 {
            return Ok(0);
        }

        let file = KnownWorkoutsFile {
            workout_ids: known.iter().map(str::to_string).collect(),
        };
        write_atomic(&self.path, &serde_json::to_vec_pretty(&file)?).await?;
        debug!(path = %self.path.display(), added, "recorded workout ids");
        Ok(added)
    }
}

/// `workout_summary` table in Postgres. The table is expected to exist.
#[derive(Debug, Clone)]
pub struct PgKnownStore {
    pool: PgPool,
}

impl PgKnownStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(4)
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await?;
        info!("connected to workout store database");
        Ok(Self { pool })
    }
}

#[async_trait]
impl KnownWorkoutStore for PgKnownStore {
    fn backend_name(&self) -> &'static str {
        "postgres"
    }

    async fn fetch_known_identifiers(&self) -> Result<IdentifierSet, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT workout_id
              FROM workout_summary
             WHERE workout_id IS NOT NULL
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        let mut out = IdentifierSet::new();
        for row in rows {
            let id: String = row.try_get("workout_id")?;
            out.insert(id);
        }
        info!(count = out.len(), "fetched known workout ids");
        Ok(out)
    }

    async fn record_new(&self, records: &[WorkoutRecord]) -> Result<usize, StoreError> {
        let mut tx = self.pool.begin().await?;
        for record in records {
            let row = record.row();
            sqlx::query(
                r#"
                INSERT INTO workout_summary (
                    workout_id, workout_date, activity_type,
                    kcal_burned, distance_mi, duration_sec
                ) VALUES ($1, $2, $3, $4, $5, $6)
                "#,
            )
            .bind(record.workout_id())
            .bind(row.workout_date())
            .bind(row.get(ACTIVITY_TYPE).as_text())
            .bind(row.get(CALORIES_BURNED).as_f64())
            .bind(row.get(DISTANCE_MI).as_f64())
            .bind(row.get(WORKOUT_TIME_SECONDS).as_f64())
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        info!(count = records.len(), "inserted new workouts");
        Ok(records.len())
    }
}

#[derive(Debug, Default)]
pub struct MemoryKnownStore {
    known: Mutex<IdentifierSet>,
    recorded: Mutex<Vec<WorkoutRecord>>,
}

impl MemoryKnownStore {
    pub fn with_known(known: IdentifierSet) -> Self {
        Self {
            known: Mutex::new(known),
            recorded: Mutex::new(Vec::new()),
        }
    }

    pub async fn recorded(&self) -> Vec<WorkoutRecord> {
        self.recorded.lock().await.clone()
    }
}

#[async_trait]
impl KnownWorkoutStore for MemoryKnownStore {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    async fn fetch_known_identifiers(&self) -> Result<IdentifierSet, StoreError> {
        Ok(self.known.lock().await.clone())
    }

    async fn record_new(&self, records: &[WorkoutRecord]) -> Result<usize, StoreError> {
        let mut known = self.known.lock().await;
        known.extend(records.iter().filter_map(WorkoutRecord::workout_id));
        self.recorded.lock().await.extend_from_slice(records);
        Ok(records.len())
    }
}
