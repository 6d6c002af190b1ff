//! Run configuration, pipeline orchestration, persistence, and export
//! regeneration for CHMM.
//!
//! A run fetches every enabled source, normalizes and deduplicates the
//! postings, enriches them, geocodes locations, upserts the batch into the
//! durable store in one transaction, and then regenerates the flat export
//! files from the store's current state. Exports are rebuilt whole every
//! run, never patched, so a corrupt prior export self-heals.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chmm_core::{AnalysisSnapshot, EnrichedPosting, ReportRecord, SalarySummary};
use chmm_enrich::{
    enrich_posting, enrich_report, Deduper, Geocoder, GeocoderConfig, HeuristicRecognizer,
    Normalizer, SentimentLexicon, SkillTaxonomy,
};
use chmm_sources::{collect_source, extract_reports, fetch_details, load_registry, PageFetcher};
use chmm_store::{CacheStore, HttpClientConfig, HttpFetcher, ShutdownFlag};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "chmm-sync";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("CHMM_GEOCODER_CONTACT must be set when geocoding is enabled")]
    MissingGeocoderContact,
    #[error("CHMM_SHEETS_CREDENTIALS must be set when spreadsheet sync is enabled")]
    MissingSheetsCredentials,
    #[error("invalid value `{value}` for {key}")]
    InvalidValue { key: &'static str, value: String },
}

/// Everything a run needs, resolved from the environment up front. No
/// component reads process-wide state after this point.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub user_agent: String,
    pub fetch_workers: usize,
    pub fetch_interval: Duration,
    pub http_timeout: Duration,
    pub page_cap: usize,
    pub geocode_enabled: bool,
    pub geocoder_contact: String,
    pub geocoder_endpoint: String,
    pub db_enabled: bool,
    pub db_path: PathBuf,
    pub sheets_enabled: bool,
    pub sheets_credentials: Option<PathBuf>,
    pub data_dir: PathBuf,
    pub reports_dir: PathBuf,
    pub cache_dir: PathBuf,
    pub sources_path: PathBuf,
    pub taxonomy_path: PathBuf,
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_flag(key: &str, default: bool) -> bool {
    std::env::var(key)
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(default)
}

fn env_parse<T: std::str::FromStr>(key: &'static str, default: T) -> Result<T, ConfigError> {
    match std::env::var(key) {
        Ok(value) => value
            .parse()
            .map_err(|_| ConfigError::InvalidValue { key, value }),
        Err(_) => Ok(default),
    }
}

impl RunConfig {
    /// Read the environment-style configuration surface and validate it.
    /// Every failure here happens before any I/O is attempted.
    pub fn from_env() -> Result<Self, ConfigError> {
        let config = Self {
            user_agent: env_string("CHMM_USER_AGENT", "chmm/0.1 (research)"),
            fetch_workers: env_parse("CHMM_FETCH_WORKERS", 4usize)?,
            fetch_interval: Duration::from_millis(env_parse("CHMM_FETCH_INTERVAL_MS", 1000u64)?),
            http_timeout: Duration::from_secs(env_parse("CHMM_HTTP_TIMEOUT_SECS", 25u64)?),
            page_cap: env_parse("CHMM_PAGE_CAP", 10usize)?,
            geocode_enabled: env_flag("CHMM_GEOCODE_ENABLED", true),
            geocoder_contact: env_string("CHMM_GEOCODER_CONTACT", ""),
            geocoder_endpoint: env_string(
                "CHMM_GEOCODER_ENDPOINT",
                "https://nominatim.openstreetmap.org/search",
            ),
            db_enabled: env_flag("CHMM_DB_ENABLED", true),
            db_path: PathBuf::from(env_string("CHMM_DB_PATH", "data/chmm.db")),
            sheets_enabled: env_flag("CHMM_SHEETS_ENABLED", false),
            sheets_credentials: std::env::var("CHMM_SHEETS_CREDENTIALS")
                .ok()
                .map(PathBuf::from),
            data_dir: PathBuf::from(env_string("CHMM_DATA_DIR", "data")),
            reports_dir: PathBuf::from(env_string("CHMM_REPORTS_DIR", "reports")),
            cache_dir: PathBuf::from(env_string("CHMM_CACHE_DIR", "data/cache")),
            sources_path: PathBuf::from(env_string("CHMM_SOURCES_PATH", "sources.yaml")),
            taxonomy_path: PathBuf::from(env_string(
                "CHMM_TAXONOMY_PATH",
                "skills/skills_taxonomy.csv",
            )),
        };
        config.validate()?;
        Ok(config)
    }

    /// A missing identifier for an enabled feature is a configuration
    /// error, not a runtime one.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.geocode_enabled && self.geocoder_contact.trim().is_empty() {
            return Err(ConfigError::MissingGeocoderContact);
        }
        if self.sheets_enabled && self.sheets_credentials.is_none() {
            return Err(ConfigError::MissingSheetsCredentials);
        }
        Ok(())
    }

    pub fn exports_dir(&self) -> PathBuf {
        self.data_dir.join("processed")
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub sources_attempted: usize,
    pub sources_failed: usize,
    pub postings_fetched: usize,
    pub duplicates_dropped: usize,
    pub postings_in_batch: usize,
    pub reports_processed: usize,
    pub geocoded: usize,
    pub exports_dir: String,
}

/// One exportable posting row, the shape shared by the store and the
/// in-memory batch so exports look the same either way.
#[derive(Debug, Clone, PartialEq)]
pub struct JobRow {
    pub url: String,
    pub source: String,
    pub title: String,
    pub company: String,
    pub location: String,
    pub city: Option<String>,
    pub state: Option<String>,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub date_posted: Option<String>,
    pub job_type: String,
    pub seniority: String,
    pub skills: Vec<String>,
    pub salary_min: Option<f64>,
    pub salary_max: Option<f64>,
    pub currency: Option<String>,
    pub description: String,
    pub sentiment: f64,
}

impl JobRow {
    pub fn from_enriched(enriched: &EnrichedPosting) -> Self {
        let p = &enriched.posting;
        Self {
            url: p.url.clone(),
            source: p.source.clone(),
            title: p.title.clone(),
            company: p.company.clone(),
            location: p.location.clone(),
            city: p.city.clone(),
            state: p.state.clone(),
            lat: enriched.coords.map(|c| c.lat),
            lon: enriched.coords.map(|c| c.lon),
            date_posted: p.date_posted.map(|d| d.format("%Y-%m-%d").to_string()),
            job_type: p.job_type.clone(),
            seniority: p.seniority.clone(),
            skills: enriched.skills.clone(),
            salary_min: p.salary.min,
            salary_max: p.salary.max,
            currency: p.currency.clone(),
            description: p.description.clone(),
            sentiment: enriched.sentiment,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ExportManifest {
    pub schema_version: u32,
    pub files: Vec<ExportManifestFile>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExportManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

pub struct Pipeline {
    config: RunConfig,
    cache: CacheStore,
    shutdown: ShutdownFlag,
}

impl Pipeline {
    pub fn new(config: RunConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let cache = CacheStore::new(config.cache_dir.clone());
        Ok(Self {
            config,
            cache,
            shutdown: ShutdownFlag::new(),
        })
    }

    /// Handle for a run-level interrupt: stops new fetches promptly while
    /// in-flight cache writes complete.
    pub fn shutdown_flag(&self) -> ShutdownFlag {
        self.shutdown.clone()
    }

    /// One end-to-end run. Zero fetched records is a success; only
    /// configuration problems and store-write failure are fatal.
    pub async fn run_once(&self) -> Result<RunSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();

        let registry = load_registry(&self.config.sources_path)?;
        let taxonomy = SkillTaxonomy::from_csv_path(&self.config.taxonomy_path)
            .with_context(|| "loading skill taxonomy")?;
        let recognizer = HeuristicRecognizer::default();
        let lexicon = SentimentLexicon::default();
        let normalizer = Normalizer::new();

        let fetcher: Arc<dyn PageFetcher> = Arc::new(HttpFetcher::new(HttpClientConfig {
            timeout: self.config.http_timeout,
            user_agent: self.config.user_agent.clone(),
            worker_limit: self.config.fetch_workers,
            min_interval: self.config.fetch_interval,
            ..Default::default()
        })?);

        let pool = if self.config.db_enabled {
            let pool = open_store(&self.config.db_path).await?;
            init_schema(&pool).await?;
            Some(pool)
        } else {
            None
        };

        // Fetch listings source by source; one failing source never takes
        // down the run.
        let enabled: Vec<_> = registry.sources.into_iter().filter(|s| s.enabled).collect();
        let sources_attempted = enabled.len();
        let mut sources_failed = 0usize;
        let mut raw_postings = Vec::new();
        for mut source in enabled {
            source.page_cap = source.page_cap.min(self.config.page_cap);
            match collect_source(fetcher.as_ref(), &source, run_id, self.shutdown.clone()).await {
                Ok(scrape) => {
                    info!(source_id = %source.source_id, count = scrape.postings.len(), aborted = scrape.aborted, "source listing complete");
                    if scrape.aborted {
                        sources_failed += 1;
                    }
                    raw_postings.extend(scrape.postings);
                }
                Err(err) => {
                    warn!(source_id = %source.source_id, %err, "source misconfigured, continuing with other sources");
                    sources_failed += 1;
                }
            }
        }
        let raw_postings = fetch_details(
            Arc::clone(&fetcher),
            self.cache.clone(),
            run_id,
            raw_postings,
            self.shutdown.clone(),
        )
        .await;
        let postings_fetched = raw_postings.len();

        let report_sources =
            extract_reports(&self.config.reports_dir, &self.cache, self.config.fetch_workers)
                .await?;

        // Normalize + dedupe against this run and persisted history.
        let mut deduper = Deduper::new();
        if let Some(pool) = &pool {
            let (urls, fingerprints) = load_history(pool).await?;
            deduper.seed_history(urls, fingerprints);
        }
        let mut enriched = Vec::new();
        for raw in &raw_postings {
            let clean = normalizer.normalize(raw);
            if !deduper.admit(&clean) {
                continue;
            }
            enriched.push(enrich_posting(clean, &taxonomy, &recognizer, &lexicon));
        }

        let reports: Vec<ReportRecord> = report_sources
            .into_iter()
            .map(|r| enrich_report(r.name, r.content_hash, r.text, &taxonomy, &recognizer))
            .collect();

        // Geocoding runs single-threaded behind its own rate gate.
        let mut geocoded = 0usize;
        if self.config.geocode_enabled {
            let geocoder = Geocoder::new(
                GeocoderConfig {
                    endpoint: self.config.geocoder_endpoint.clone(),
                    contact: self.config.geocoder_contact.clone(),
                    ..Default::default()
                },
                self.cache.clone(),
            )?;
            for posting in &mut enriched {
                if posting.posting.location.is_empty() {
                    continue;
                }
                posting.coords = geocoder.lookup(&posting.posting.location).await;
                if posting.coords.is_some() {
                    geocoded += 1;
                }
            }
        }

        // Store write is fatal on failure; exports are only regenerated
        // after it succeeds, preserving the previous run's artifacts.
        let now = Utc::now();
        if let Some(pool) = &pool {
            persist_batch(pool, &enriched, &reports, now)
                .await
                .context("persisting batch to durable store")?;
        }

        let (job_rows, report_rows) = match &pool {
            Some(pool) => (load_job_rows(pool).await?, load_report_rows(pool).await?),
            None => {
                let mut rows: Vec<JobRow> = enriched.iter().map(JobRow::from_enriched).collect();
                rows.sort_by(|a, b| a.url.cmp(&b.url));
                let mut reports = reports.clone();
                reports.sort_by(|a, b| {
                    a.name.cmp(&b.name).then_with(|| a.content_hash.cmp(&b.content_hash))
                });
                (rows, reports)
            }
        };

        let snapshot = compute_snapshot(run_id, started_at, &job_rows);
        let exports_dir = self.config.exports_dir();
        write_exports(&exports_dir, &job_rows, &report_rows, &snapshot)
            .await
            .context("regenerating export artifacts")?;

        if self.config.sheets_enabled {
            info!("spreadsheet sync enabled; external exporter consumes the regenerated artifacts");
        }

        let finished_at = Utc::now();
        Ok(RunSummary {
            run_id,
            started_at,
            finished_at,
            sources_attempted,
            sources_failed,
            postings_fetched,
            duplicates_dropped: deduper.duplicates_dropped(),
            postings_in_batch: enriched.len(),
            reports_processed: reports.len(),
            geocoded,
            exports_dir: exports_dir.display().to_string(),
        })
    }
}

pub async fn run_once_from_env() -> Result<RunSummary> {
    let config = RunConfig::from_env()?;
    let pipeline = Pipeline::new(config)?;
    pipeline.run_once().await
}

pub async fn open_store(path: &Path) -> Result<SqlitePool> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating store directory {}", parent.display()))?;
    }
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal);
    SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await
        .with_context(|| format!("opening durable store {}", path.display()))
}

pub async fn init_schema(pool: &SqlitePool) -> Result<()> {
    let statements = [
        r#"CREATE TABLE IF NOT EXISTS jobs (
            url TEXT PRIMARY KEY,
            source TEXT NOT NULL,
            title TEXT NOT NULL,
            company TEXT NOT NULL,
            location TEXT NOT NULL,
            city TEXT,
            state TEXT,
            lat REAL,
            lon REAL,
            date_posted TEXT,
            job_type TEXT NOT NULL,
            seniority TEXT NOT NULL,
            salary_min REAL,
            salary_max REAL,
            currency TEXT,
            description TEXT NOT NULL,
            sentiment REAL NOT NULL,
            fingerprint TEXT NOT NULL,
            first_seen_at TEXT NOT NULL,
            last_seen_at TEXT NOT NULL
        )"#,
        r#"CREATE TABLE IF NOT EXISTS job_skills (
            job_url TEXT NOT NULL,
            skill TEXT NOT NULL,
            PRIMARY KEY (job_url, skill)
        )"#,
        r#"CREATE TABLE IF NOT EXISTS reports (
            name TEXT NOT NULL,
            content_hash TEXT NOT NULL,
            word_count INTEGER NOT NULL,
            skills TEXT NOT NULL,
            entities TEXT NOT NULL,
            full_text TEXT NOT NULL,
            first_seen_at TEXT NOT NULL,
            last_seen_at TEXT NOT NULL,
            PRIMARY KEY (name, content_hash)
        )"#,
        "CREATE INDEX IF NOT EXISTS idx_jobs_company ON jobs(company)",
        "CREATE INDEX IF NOT EXISTS idx_jobs_fingerprint ON jobs(fingerprint)",
        "CREATE INDEX IF NOT EXISTS idx_job_skills_skill ON job_skills(skill)",
    ];
    for statement in statements {
        sqlx::query(statement)
            .execute(pool)
            .await
            .context("initializing store schema")?;
    }
    Ok(())
}

pub async fn load_history(pool: &SqlitePool) -> Result<(Vec<String>, Vec<String>)> {
    let rows = sqlx::query("SELECT url, fingerprint FROM jobs")
        .fetch_all(pool)
        .await
        .context("loading dedup history")?;
    let mut urls = Vec::with_capacity(rows.len());
    let mut fingerprints = Vec::with_capacity(rows.len());
    for row in rows {
        urls.push(row.try_get::<String, _>("url")?);
        fingerprints.push(row.try_get::<String, _>("fingerprint")?);
    }
    Ok((urls, fingerprints))
}

/// Upsert the run's batch in one transaction. Re-running with unchanged
/// input leaves every content column byte-for-byte identical; only
/// `last_seen_at` moves.
pub async fn persist_batch(
    pool: &SqlitePool,
    postings: &[EnrichedPosting],
    reports: &[ReportRecord],
    now: DateTime<Utc>,
) -> Result<()> {
    let stamp = now.to_rfc3339();
    let mut tx = pool.begin().await.context("opening store transaction")?;

    for enriched in postings {
        let row = JobRow::from_enriched(enriched);
        sqlx::query(
            r#"INSERT INTO jobs (
                url, source, title, company, location, city, state, lat, lon,
                date_posted, job_type, seniority, salary_min, salary_max,
                currency, description, sentiment, fingerprint,
                first_seen_at, last_seen_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(url) DO UPDATE SET
                source = excluded.source,
                title = excluded.title,
                company = excluded.company,
                location = excluded.location,
                city = excluded.city,
                state = excluded.state,
                lat = excluded.lat,
                lon = excluded.lon,
                date_posted = excluded.date_posted,
                job_type = excluded.job_type,
                seniority = excluded.seniority,
                salary_min = excluded.salary_min,
                salary_max = excluded.salary_max,
                currency = excluded.currency,
                description = excluded.description,
                sentiment = excluded.sentiment,
                fingerprint = excluded.fingerprint,
                last_seen_at = excluded.last_seen_at"#,
        )
        .bind(&row.url)
        .bind(&row.source)
        .bind(&row.title)
        .bind(&row.company)
        .bind(&row.location)
        .bind(&row.city)
        .bind(&row.state)
        .bind(row.lat)
        .bind(row.lon)
        .bind(&row.date_posted)
        .bind(&row.job_type)
        .bind(&row.seniority)
        .bind(row.salary_min)
        .bind(row.salary_max)
        .bind(&row.currency)
        .bind(&row.description)
        .bind(row.sentiment)
        .bind(&enriched.posting.fingerprint)
        .bind(&stamp)
        .bind(&stamp)
        .execute(&mut *tx)
        .await
        .with_context(|| format!("upserting job {}", row.url))?;

        sqlx::query("DELETE FROM job_skills WHERE job_url = ?")
            .bind(&row.url)
            .execute(&mut *tx)
            .await?;
        for skill in &row.skills {
            sqlx::query("INSERT OR IGNORE INTO job_skills (job_url, skill) VALUES (?, ?)")
                .bind(&row.url)
                .bind(skill)
                .execute(&mut *tx)
                .await?;
        }
    }

    for report in reports {
        sqlx::query(
            r#"INSERT INTO reports (
                name, content_hash, word_count, skills, entities, full_text,
                first_seen_at, last_seen_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(name, content_hash) DO UPDATE SET
                last_seen_at = excluded.last_seen_at"#,
        )
        .bind(&report.name)
        .bind(&report.content_hash)
        .bind(report.word_count as i64)
        .bind(report.skills_joined())
        .bind(report.entities_joined())
        .bind(&report.text)
        .bind(&stamp)
        .bind(&stamp)
        .execute(&mut *tx)
        .await
        .with_context(|| format!("upserting report {}", report.name))?;
    }

    tx.commit().await.context("committing store transaction")
}

pub async fn load_job_rows(pool: &SqlitePool) -> Result<Vec<JobRow>> {
    let skill_rows = sqlx::query("SELECT job_url, skill FROM job_skills ORDER BY job_url, skill")
        .fetch_all(pool)
        .await
        .context("loading job skills")?;
    let mut skills_by_url: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for row in skill_rows {
        skills_by_url
            .entry(row.try_get("job_url")?)
            .or_default()
            .push(row.try_get("skill")?);
    }

    let rows = sqlx::query(
        r#"SELECT url, source, title, company, location, city, state, lat, lon,
                  date_posted, job_type, seniority, salary_min, salary_max,
                  currency, description, sentiment
           FROM jobs ORDER BY url"#,
    )
    .fetch_all(pool)
    .await
    .context("loading job rows")?;

    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        let url: String = row.try_get("url")?;
        out.push(JobRow {
            skills: skills_by_url.remove(&url).unwrap_or_default(),
            url,
            source: row.try_get("source")?,
            title: row.try_get("title")?,
            company: row.try_get("company")?,
            location: row.try_get("location")?,
            city: row.try_get("city")?,
            state: row.try_get("state")?,
            lat: row.try_get("lat")?,
            lon: row.try_get("lon")?,
            date_posted: row.try_get("date_posted")?,
            job_type: row.try_get("job_type")?,
            seniority: row.try_get("seniority")?,
            salary_min: row.try_get("salary_min")?,
            salary_max: row.try_get("salary_max")?,
            currency: row.try_get("currency")?,
            description: row.try_get("description")?,
            sentiment: row.try_get("sentiment")?,
        });
    }
    Ok(out)
}

pub async fn load_report_rows(pool: &SqlitePool) -> Result<Vec<ReportRecord>> {
    let rows = sqlx::query(
        r#"SELECT name, content_hash, word_count, skills, entities, full_text
           FROM reports ORDER BY name, content_hash"#,
    )
    .fetch_all(pool)
    .await
    .context("loading report rows")?;

    let split = |cell: String| -> Vec<String> {
        cell.split(';')
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    };

    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        let word_count: i64 = row.try_get("word_count")?;
        out.push(ReportRecord {
            name: row.try_get("name")?,
            content_hash: row.try_get("content_hash")?,
            word_count: word_count as usize,
            skills: split(row.try_get("skills")?),
            entities: chmm_core::TopEntities {
                // Stored delimited; orgs and places are not distinguished
                // once persisted, matching the export shape.
                orgs: split(row.try_get("entities")?),
                places: Vec::new(),
            },
            text: row.try_get("full_text")?,
        });
    }
    Ok(out)
}

/// Recompute the market snapshot from the current record set. Aggregates
/// exclude nulls; a missing salary never counts as zero.
pub fn compute_snapshot(
    run_id: Uuid,
    run_timestamp: DateTime<Utc>,
    rows: &[JobRow],
) -> AnalysisSnapshot {
    let mut skill_counts: BTreeMap<&str, usize> = BTreeMap::new();
    let mut employer_counts: BTreeMap<&str, usize> = BTreeMap::new();
    let mut geocoded = 0usize;
    let mut salary_values = Vec::new();

    for row in rows {
        for skill in &row.skills {
            *skill_counts.entry(skill.as_str()).or_default() += 1;
        }
        if !row.company.is_empty() {
            *employer_counts.entry(row.company.as_str()).or_default() += 1;
        }
        if row.lat.is_some() && row.lon.is_some() {
            geocoded += 1;
        }
        if let Some(min) = row.salary_min {
            salary_values.push(min);
        }
    }

    let rank = |counts: BTreeMap<&str, usize>, top_n: usize| -> Vec<(String, usize)> {
        let mut ranked: Vec<(String, usize)> = counts
            .into_iter()
            .map(|(name, count)| (name.to_string(), count))
            .collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        ranked.truncate(top_n);
        ranked
    };

    let salary_summary = if salary_values.is_empty() {
        None
    } else {
        Some(SalarySummary {
            count: salary_values.len(),
            mean_min: salary_values.iter().sum::<f64>() / salary_values.len() as f64,
        })
    };

    AnalysisSnapshot {
        run_id,
        run_timestamp,
        num_jobs: rows.len(),
        unique_employers: employer_counts.len(),
        geocoded,
        top_skills: rank(skill_counts, 30),
        top_employers: rank(employer_counts, 20),
        salary_summary,
    }
}

fn float_cell(value: Option<f64>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

fn opt_cell(value: &Option<String>) -> &str {
    value.as_deref().unwrap_or("")
}

fn jobs_csv_bytes(rows: &[JobRow]) -> Result<Vec<u8>> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record([
        "source",
        "title",
        "company",
        "location",
        "city",
        "state",
        "lat",
        "lon",
        "date_posted",
        "job_type",
        "seniority",
        "skills",
        "salary_min",
        "salary_max",
        "currency",
        "url",
        "description",
        "sentiment",
    ])?;
    for row in rows {
        let lat = float_cell(row.lat);
        let lon = float_cell(row.lon);
        let skills = row.skills.join(";");
        let salary_min = float_cell(row.salary_min);
        let salary_max = float_cell(row.salary_max);
        let sentiment = row.sentiment.to_string();
        writer.write_record([
            row.source.as_str(),
            row.title.as_str(),
            row.company.as_str(),
            row.location.as_str(),
            opt_cell(&row.city),
            opt_cell(&row.state),
            lat.as_str(),
            lon.as_str(),
            opt_cell(&row.date_posted),
            row.job_type.as_str(),
            row.seniority.as_str(),
            skills.as_str(),
            salary_min.as_str(),
            salary_max.as_str(),
            opt_cell(&row.currency),
            row.url.as_str(),
            row.description.as_str(),
            sentiment.as_str(),
        ])?;
    }
    writer.into_inner().context("finishing jobs csv")
}

fn reports_csv_bytes(reports: &[ReportRecord]) -> Result<Vec<u8>> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(["name", "word_count", "skills", "top_entities", "text"])?;
    for report in reports {
        let word_count = report.word_count.to_string();
        let skills = report.skills_joined();
        let entities = report.entities_joined();
        writer.write_record([
            report.name.as_str(),
            word_count.as_str(),
            skills.as_str(),
            entities.as_str(),
            report.text.as_str(),
        ])?;
    }
    writer.into_inner().context("finishing reports csv")
}

async fn publish_file(dir: &Path, name: &str, bytes: &[u8]) -> Result<ExportManifestFile> {
    let final_path = dir.join(name);
    let temp_path = dir.join(format!(".{name}.tmp"));
    tokio::fs::write(&temp_path, bytes)
        .await
        .with_context(|| format!("writing {}", temp_path.display()))?;
    tokio::fs::rename(&temp_path, &final_path)
        .await
        .with_context(|| format!("publishing {}", final_path.display()))?;

    let mut hasher = Sha256::new();
    hasher.update(bytes);
    Ok(ExportManifestFile {
        name: name.trim_end_matches(".csv").trim_end_matches(".json").to_string(),
        path: name.to_string(),
        sha256: hex::encode(hasher.finalize()),
        bytes: bytes.len() as u64,
    })
}

/// Regenerate every export artifact from scratch. A zero-record run still
/// produces header-only tabular files and a minimal summary, so consumers
/// never see a missing file.
pub async fn write_exports(
    dir: &Path,
    job_rows: &[JobRow],
    reports: &[ReportRecord],
    snapshot: &AnalysisSnapshot,
) -> Result<PathBuf> {
    tokio::fs::create_dir_all(dir)
        .await
        .with_context(|| format!("creating exports directory {}", dir.display()))?;

    let jobs_bytes = jobs_csv_bytes(job_rows)?;
    let reports_bytes = reports_csv_bytes(reports)?;
    let snapshot_bytes =
        serde_json::to_vec_pretty(snapshot).context("serializing analysis snapshot")?;

    let manifest = ExportManifest {
        schema_version: 1,
        files: vec![
            publish_file(dir, "jobs.csv", &jobs_bytes).await?,
            publish_file(dir, "reports.csv", &reports_bytes).await?,
            publish_file(dir, "analysis.json", &snapshot_bytes).await?,
        ],
    };

    let manifest_bytes =
        serde_json::to_vec_pretty(&manifest).context("serializing export manifest")?;
    let manifest_path = dir.join("manifest.json");
    publish_file(dir, "manifest.json", &manifest_bytes).await?;
    Ok(manifest_path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chmm_core::{CleanPosting, Coordinates, SalaryBounds, TopEntities};
    use chrono::TimeZone;
    use tempfile::tempdir;

    fn enriched(url: &str, title: &str, company: &str, salary_min: Option<f64>) -> EnrichedPosting {
        let fingerprint = chmm_enrich::fingerprint(title, company, "desc");
        EnrichedPosting {
            posting: CleanPosting {
                source: "acra".into(),
                title: title.into(),
                company: company.into(),
                location: "Phoenix, AZ".into(),
                city: Some("Phoenix".into()),
                state: Some("AZ".into()),
                date_posted: None,
                job_type: "field-tech".into(),
                seniority: "entry".into(),
                salary: SalaryBounds {
                    min: salary_min,
                    max: salary_min.map(|v| v + 10_000.0),
                },
                currency: salary_min.map(|_| "USD".to_string()),
                url: url.into(),
                description: "Survey and excavation support.".into(),
                fingerprint,
            },
            skills: vec!["ArcGIS".into(), "Section 106".into()],
            entities: TopEntities::default(),
            sentiment: 0.25,
            coords: Some(Coordinates { lat: 33.45, lon: -112.07 }),
        }
    }

    fn report(name: &str) -> ReportRecord {
        ReportRecord {
            name: name.into(),
            content_hash: "deadbeef".into(),
            word_count: 120,
            skills: vec!["NEPA".into()],
            entities: TopEntities {
                orgs: vec!["Heritage Research Inc".into()],
                places: vec![],
            },
            text: "Workforce demand for NEPA compliance is growing.".into(),
        }
    }

    fn test_timestamp() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 8, 6, 12, 0, 0).single().expect("timestamp")
    }

    async fn temp_pool() -> (tempfile::TempDir, SqlitePool) {
        let dir = tempdir().expect("tempdir");
        let pool = open_store(&dir.path().join("chmm.db")).await.expect("store");
        init_schema(&pool).await.expect("schema");
        (dir, pool)
    }

    #[tokio::test]
    async fn upsert_is_idempotent_for_unchanged_input() {
        let (_dir, pool) = temp_pool().await;
        let batch = vec![enriched("https://example.com/job/1", "Field Tech", "Heritage Inc", Some(50_000.0))];

        persist_batch(&pool, &batch, &[], test_timestamp()).await.expect("first persist");
        let first = load_job_rows(&pool).await.expect("rows");

        // Second run, later timestamp, identical content.
        let later = test_timestamp() + chrono::Duration::hours(12);
        persist_batch(&pool, &batch, &[], later).await.expect("second persist");
        let second = load_job_rows(&pool).await.expect("rows");

        assert_eq!(first.len(), 1);
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn conflicting_urls_collapse_to_one_row() {
        let (_dir, pool) = temp_pool().await;
        let first = vec![enriched("https://example.com/job/1", "Field Tech", "Heritage Inc", None)];
        let second = vec![enriched("https://example.com/job/1", "Field Tech II", "Heritage Inc", None)];

        persist_batch(&pool, &first, &[], test_timestamp()).await.expect("persist");
        persist_batch(&pool, &second, &[], test_timestamp()).await.expect("persist");

        let rows = load_job_rows(&pool).await.expect("rows");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].title, "Field Tech II");
    }

    #[tokio::test]
    async fn null_salary_persists_as_null_and_aggregates_exclude_it() {
        let (_dir, pool) = temp_pool().await;
        let batch = vec![
            enriched("https://example.com/job/1", "Field Tech", "Heritage Inc", None),
            enriched("https://example.com/job/2", "Archaeologist", "CRC", Some(60_000.0)),
        ];
        persist_batch(&pool, &batch, &[], test_timestamp()).await.expect("persist");

        let rows = load_job_rows(&pool).await.expect("rows");
        assert_eq!(rows[0].salary_min, None);
        assert_eq!(rows[1].salary_min, Some(60_000.0));

        let snapshot = compute_snapshot(Uuid::new_v4(), test_timestamp(), &rows);
        let summary = snapshot.salary_summary.expect("one salaried posting");
        assert_eq!(summary.count, 1);
        assert_eq!(summary.mean_min, 60_000.0);
    }

    #[tokio::test]
    async fn report_identity_is_name_plus_content_hash() {
        let (_dir, pool) = temp_pool().await;
        let original = report("market-2026.pdf");
        let mut revised = report("market-2026.pdf");
        revised.content_hash = "cafebabe".into();

        persist_batch(&pool, &[], &[original.clone()], test_timestamp()).await.expect("persist");
        persist_batch(&pool, &[], &[original, revised], test_timestamp()).await.expect("persist");

        let rows = load_report_rows(&pool).await.expect("rows");
        // Same name, new bytes: stored as a distinct version.
        assert_eq!(rows.len(), 2);
    }

    #[test]
    fn snapshot_rankings_are_deterministic() {
        let batch = vec![
            enriched("https://example.com/job/1", "Field Tech", "Heritage Inc", None),
            enriched("https://example.com/job/2", "Archaeologist", "CRC", None),
            enriched("https://example.com/job/3", "Crew Chief", "Heritage Inc", None),
        ];
        let rows: Vec<JobRow> = batch.iter().map(JobRow::from_enriched).collect();

        let a = compute_snapshot(Uuid::nil(), test_timestamp(), &rows);
        let b = compute_snapshot(Uuid::nil(), test_timestamp(), &rows);
        assert_eq!(a, b);
        assert_eq!(a.num_jobs, 3);
        assert_eq!(a.unique_employers, 2);
        assert_eq!(a.geocoded, 3);
        assert_eq!(a.top_employers[0], ("Heritage Inc".to_string(), 2));
        // Equal counts rank alphabetically.
        assert_eq!(
            a.top_skills,
            vec![("ArcGIS".to_string(), 3), ("Section 106".to_string(), 3)]
        );
    }

    #[tokio::test]
    async fn zero_record_exports_are_header_only_but_present() {
        let dir = tempdir().expect("tempdir");
        let snapshot = compute_snapshot(Uuid::nil(), test_timestamp(), &[]);
        write_exports(dir.path(), &[], &[], &snapshot).await.expect("exports");

        let jobs = std::fs::read_to_string(dir.path().join("jobs.csv")).expect("jobs.csv");
        assert_eq!(
            jobs.trim_end(),
            "source,title,company,location,city,state,lat,lon,date_posted,job_type,seniority,skills,salary_min,salary_max,currency,url,description,sentiment"
        );

        let reports = std::fs::read_to_string(dir.path().join("reports.csv")).expect("reports.csv");
        assert_eq!(reports.trim_end(), "name,word_count,skills,top_entities,text");

        let analysis: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(dir.path().join("analysis.json")).expect("analysis"))
                .expect("json");
        assert_eq!(analysis["num_jobs"], 0);
        assert!(analysis["salary_summary"].is_null());

        let manifest: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(dir.path().join("manifest.json")).expect("manifest"))
                .expect("json");
        assert_eq!(manifest["files"].as_array().expect("files").len(), 3);
    }

    #[tokio::test]
    async fn export_bytes_are_stable_across_reruns() {
        let dir = tempdir().expect("tempdir");
        let batch = vec![enriched("https://example.com/job/1", "Field Tech", "Heritage Inc", Some(55_000.0))];
        let rows: Vec<JobRow> = batch.iter().map(JobRow::from_enriched).collect();

        let snapshot = compute_snapshot(Uuid::nil(), test_timestamp(), &rows);
        write_exports(dir.path(), &rows, &[], &snapshot).await.expect("first export");
        let first = std::fs::read(dir.path().join("jobs.csv")).expect("jobs.csv");

        // A later run over the same record set: only the snapshot's run
        // timestamp differs; the tabular export is byte-identical.
        let later = compute_snapshot(Uuid::new_v4(), test_timestamp() + chrono::Duration::days(1), &rows);
        write_exports(dir.path(), &rows, &[], &later).await.expect("second export");
        let second = std::fs::read(dir.path().join("jobs.csv")).expect("jobs.csv");
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn export_manifest_checksums_match_file_contents() {
        let dir = tempdir().expect("tempdir");
        let snapshot = compute_snapshot(Uuid::nil(), test_timestamp(), &[]);
        write_exports(dir.path(), &[], &[], &snapshot).await.expect("exports");

        let manifest: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(dir.path().join("manifest.json")).expect("manifest"))
                .expect("json");
        for file in manifest["files"].as_array().expect("files") {
            let bytes = std::fs::read(dir.path().join(file["path"].as_str().expect("path"))).expect("file");
            let mut hasher = Sha256::new();
            hasher.update(&bytes);
            assert_eq!(file["sha256"].as_str().expect("sha256"), hex::encode(hasher.finalize()));
            assert_eq!(file["bytes"].as_u64().expect("bytes"), bytes.len() as u64);
        }
    }

    #[test]
    fn missing_geocoder_contact_is_a_startup_error() {
        let config = RunConfig {
            user_agent: "chmm-test/0.1".into(),
            fetch_workers: 2,
            fetch_interval: Duration::from_millis(10),
            http_timeout: Duration::from_secs(5),
            page_cap: 5,
            geocode_enabled: true,
            geocoder_contact: String::new(),
            geocoder_endpoint: "http://127.0.0.1:9/search".into(),
            db_enabled: false,
            db_path: "chmm.db".into(),
            sheets_enabled: false,
            sheets_credentials: None,
            data_dir: "data".into(),
            reports_dir: "reports".into(),
            cache_dir: "cache".into(),
            sources_path: "sources.yaml".into(),
            taxonomy_path: "skills.csv".into(),
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingGeocoderContact)
        ));

        let mut sheets = config;
        sheets.geocode_enabled = false;
        sheets.sheets_enabled = true;
        assert!(matches!(
            sheets.validate(),
            Err(ConfigError::MissingSheetsCredentials)
        ));
    }

    #[tokio::test]
    async fn zero_source_run_completes_and_publishes_artifacts() {
        let dir = tempdir().expect("tempdir");
        std::fs::write(dir.path().join("sources.yaml"), "sources: []\n").expect("sources");
        std::fs::write(
            dir.path().join("skills.csv"),
            "alias,canonical,category\nArcGIS,ArcGIS,GIS\n",
        )
        .expect("taxonomy");

        let config = RunConfig {
            user_agent: "chmm-test/0.1".into(),
            fetch_workers: 2,
            fetch_interval: Duration::from_millis(10),
            http_timeout: Duration::from_secs(5),
            page_cap: 5,
            geocode_enabled: false,
            geocoder_contact: String::new(),
            geocoder_endpoint: "http://127.0.0.1:9/search".into(),
            db_enabled: true,
            db_path: dir.path().join("chmm.db"),
            sheets_enabled: false,
            sheets_credentials: None,
            data_dir: dir.path().join("data"),
            reports_dir: dir.path().join("reports"),
            cache_dir: dir.path().join("cache"),
            sources_path: dir.path().join("sources.yaml"),
            taxonomy_path: dir.path().join("skills.csv"),
        };

        let pipeline = Pipeline::new(config.clone()).expect("pipeline");
        let summary = pipeline.run_once().await.expect("run");

        assert_eq!(summary.postings_fetched, 0);
        assert_eq!(summary.sources_attempted, 0);
        assert!(config.exports_dir().join("jobs.csv").exists());
        assert!(config.exports_dir().join("analysis.json").exists());
        assert!(config.db_path.exists());
    }
}
