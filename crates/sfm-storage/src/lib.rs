//! Interchange file storage, notification outbox and HTTP client utilities.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use chrono::NaiveDate;
use sfm_core::{Extract, RawRecord, RunMode};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("interchange file {path} does not exist")]
    MissingInterchangeFile { path: PathBuf },
    #[error("interchange file {path} has no header row")]
    EmptyFile { path: PathBuf },
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("csv error on {path}: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
    #[error(transparent)]
    Catalog(#[from] sfm_core::CatalogError),
}

#[derive(Debug, Clone)]
pub struct StoredFile {
    pub path: PathBuf,
    pub rows: usize,
    pub byte_size: usize,
}

/// Header row plus data rows, as stored on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterchangeTable {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

/// The destination transport cannot carry single quotes.
pub fn strip_single_quotes(value: &str) -> String {
    value.replace('\'', "")
}

/// Writes one file per extract: `<root>/initial/<Object>_export.csv` for full
/// loads, `<root>/update/<YYYY-MM-DD>/<Object>_export.csv` for incremental ones.
#[derive(Debug, Clone)]
pub struct InterchangeStore {
    root: PathBuf,
}

impl InterchangeStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn batch_dir(&self, mode: RunMode, date: NaiveDate) -> PathBuf {
        match mode {
            RunMode::Full => self.root.join("initial"),
            RunMode::Incremental => self
                .root
                .join("update")
                .join(date.format("%Y-%m-%d").to_string()),
        }
    }

    pub fn path_for(
        &self,
        mode: RunMode,
        date: NaiveDate,
        extract: Extract,
    ) -> Result<PathBuf, StorageError> {
        let object = extract.object_name()?;
        Ok(self
            .batch_dir(mode, date)
            .join(format!("{object}_export.csv")))
    }

    /// Writes `records` (keyed by source field name) in catalog column order.
    pub async fn write_extract(
        &self,
        mode: RunMode,
        date: NaiveDate,
        extract: Extract,
        records: &[RawRecord],
    ) -> Result<StoredFile, StorageError> {
        let path = self.path_for(mode, date, extract)?;
        let fields = extract.fields()?;
        let rows = records
            .iter()
            .map(|record| {
                fields
                    .iter()
                    .map(|f| {
                        record
                            .get(*f)
                            .map(|v| strip_single_quotes(v))
                            .unwrap_or_default()
                    })
                    .collect::<Vec<_>>()
            })
            .collect::<Vec<_>>();
        let table = InterchangeTable {
            headers: fields.iter().map(ToString::to_string).collect(),
            rows,
        };
        self.write_table(&path, &table).await
    }

    pub async fn write_table(
        &self,
        path: &Path,
        table: &InterchangeTable,
    ) -> Result<StoredFile, StorageError> {
        let bytes = encode_csv(table).map_err(|source| StorageError::Csv {
            path: path.to_path_buf(),
            source,
        })?;
        write_atomically(path, &bytes)
            .await
            .map_err(|source| StorageError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        info!(path = %path.display(), rows = table.rows.len(), "wrote interchange file");
        Ok(StoredFile {
            path: path.to_path_buf(),
            rows: table.rows.len(),
            byte_size: bytes.len(),
        })
    }

    pub async fn read_extract(
        &self,
        mode: RunMode,
        date: NaiveDate,
        extract: Extract,
    ) -> Result<InterchangeTable, StorageError> {
        let path = self.path_for(mode, date, extract)?;
        self.read_table(&path).await
    }

    pub async fn read_table(&self, path: &Path) -> Result<InterchangeTable, StorageError> {
        let bytes = match fs::read(path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(StorageError::MissingInterchangeFile {
                    path: path.to_path_buf(),
                })
            }
            Err(source) => {
                return Err(StorageError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        debug!(path = %path.display(), bytes = bytes.len(), "loading interchange file");
        decode_csv(&bytes, path)
    }
}

fn encode_csv(table: &InterchangeTable) -> Result<Vec<u8>, csv::Error> {
    let mut writer = csv::WriterBuilder::new()
        .quote_style(csv::QuoteStyle::Always)
        .from_writer(Vec::new());
    writer.write_record(&table.headers)?;
    for row in &table.rows {
        writer.write_record(row)?;
    }
    writer
        .into_inner()
        .map_err(|err| csv::Error::from(err.into_error()))
}

fn decode_csv(bytes: &[u8], path: &Path) -> Result<InterchangeTable, StorageError> {
    let csv_err = |source: csv::Error| StorageError::Csv {
        path: path.to_path_buf(),
        source,
    };
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(bytes);
    let mut records = reader.records();
    let headers: Vec<String> = match records.next() {
        Some(row) => row.map_err(csv_err)?.iter().map(ToString::to_string).collect(),
        None => {
            return Err(StorageError::EmptyFile {
                path: path.to_path_buf(),
            })
        }
    };
    let mut rows: Vec<Vec<String>> = Vec::new();
    for row in records {
        rows.push(row.map_err(csv_err)?.iter().map(ToString::to_string).collect());
    }
    Ok(InterchangeTable { headers, rows })
}

/// Writes through a temp file in the same directory, then renames into place.
async fn write_atomically(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).await?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await?;
    file.write_all(bytes).await?;
    file.flush().await?;
    drop(file);

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err);
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct OutboxEntry {
    pub content_hash: String,
    pub path: PathBuf,
    pub deduplicated: bool,
}

/// Content-addressed drop directory for outgoing notifications.
#[derive(Debug, Clone)]
pub struct OutboxStore {
    root: PathBuf,
}

impl OutboxStore {
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

    /// Stores `bytes` under `<root>/<date>/<sha256>.json`; identical messages are stored once.
    pub async fn enqueue(&self, date: NaiveDate, bytes: &[u8]) -> anyhow::Result<OutboxEntry> {
        let content_hash = Self::sha256_hex(bytes);
        let path = self
            .root
            .join(date.format("%Y-%m-%d").to_string())
            .join(format!("{content_hash}.json"));

        if fs::try_exists(&path)
            .await
            .with_context(|| format!("checking outbox path {}", path.display()))?
        {
            return Ok(OutboxEntry {
                content_hash,
                path,
                deduplicated: true,
            });
        }

        write_atomically(&path, bytes)
            .await
            .with_context(|| format!("writing outbox message {}", path.display()))?;
        Ok(OutboxEntry {
            content_hash,
            path,
            deduplicated: false,
        })
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
            timeout: Duration::from_secs(30),
            user_agent: None,
        }
    }
}

pub fn build_http_client(config: &HttpClientConfig) -> anyhow::Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .gzip(true)
        .brotli(true)
        .timeout(config.timeout);

    if let Some(user_agent) = &config.user_agent {
        builder = builder.user_agent(user_agent.clone());
    }

    builder.build().context("building reqwest client")
}

#[derive(Debug, Error)]
pub enum HttpError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}: {body}")]
    HttpStatus {
        status: u16,
        url: String,
        body: String,
    },
}

/// Passes successful responses through; turns any other status into [`HttpError::HttpStatus`].
pub async fn ensure_success(resp: reqwest::Response) -> Result<reqwest::Response, HttpError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let url = resp.url().to_string();
    let body = resp.text().await.unwrap_or_default();
    Err(HttpError::HttpStatus {
        status: status.as_u16(),
        url,
        body: body.chars().take(512).collect(),
    })
}
