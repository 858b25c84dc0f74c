//! Tender, analysis and enterprise persistence.
//!
//! The pipeline only talks to the [`Repository`] trait. [`SqliteRepository`]
//! is the production implementation:
//! - tenders are unique by `source_url` (`INSERT OR IGNORE`)
//! - one analysis row per tender (`UNIQUE(tender_id)`)
//! - analysis batches are committed in a single transaction
//! - every notification attempt is logged in `notification_log`

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Connection, Row};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tender_common::{Error, Result};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::model::{
    join_list, parse_list, AnalysisRecord, AnalyzedTender, EnterpriseId, EnterpriseProfile,
    ExtractedInfo, NewTender, ScoredTender, TenderId, TenderRecord, DATE_FORMAT,
};

// ============================================================================
// Database Schema
// ============================================================================

const CREATE_TABLES_SQL: &str = r#"
-- Scraped tenders
CREATE TABLE IF NOT EXISTS tenders (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    title TEXT NOT NULL,
    description TEXT,
    raw_text TEXT,
    sector TEXT,
    estimated_budget REAL,
    location TEXT,
    deadline TEXT,
    source_url TEXT NOT NULL,
    document_path TEXT,
    analyzed INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    UNIQUE(source_url)
);

CREATE INDEX IF NOT EXISTS idx_tenders_analyzed
ON tenders(analyzed);

-- One analysis per tender; score fields hold the latest scoring call
CREATE TABLE IF NOT EXISTS analyses (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    tender_id INTEGER NOT NULL REFERENCES tenders(id),
    enterprise_id INTEGER,
    summary TEXT NOT NULL,
    sector TEXT,
    estimated_budget REAL,
    location TEXT,
    deadline TEXT,
    score REAL NOT NULL DEFAULT 0,
    explanation TEXT NOT NULL DEFAULT '',
    created_at TEXT NOT NULL,
    UNIQUE(tender_id)
);

-- Registered enterprises, keyed by name
CREATE TABLE IF NOT EXISTS enterprises (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    sector TEXT NOT NULL,
    min_budget REAL NOT NULL DEFAULT 0,
    max_budget REAL NOT NULL DEFAULT 0,
    zones TEXT NOT NULL DEFAULT '',
    experience_years INTEGER NOT NULL DEFAULT 0,
    include_keywords TEXT NOT NULL DEFAULT '',
    exclude_keywords TEXT NOT NULL DEFAULT '',
    email TEXT,
    updated_at TEXT DEFAULT CURRENT_TIMESTAMP,
    UNIQUE(name)
);

-- Notification attempts
CREATE TABLE IF NOT EXISTS notification_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    enterprise_id INTEGER NOT NULL,
    channel TEXT NOT NULL,
    recipient TEXT NOT NULL,
    match_count INTEGER NOT NULL DEFAULT 0,
    status TEXT NOT NULL,
    error_message TEXT,
    created_at TEXT NOT NULL,
    sent_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_notification_log_enterprise
ON notification_log(enterprise_id, created_at DESC);
"#;

const TENDER_COLUMNS: &str = "t.id, t.title, t.description, t.raw_text, t.sector, \
    t.estimated_budget, t.location, t.deadline, t.source_url, t.document_path, t.analyzed, \
    t.created_at";

const ANALYSIS_COLUMNS: &str = "a.tender_id, a.enterprise_id, a.summary, a.sector, \
    a.estimated_budget, a.location, a.deadline, a.score, a.explanation, a.created_at";

const ENTERPRISE_COLUMNS: &str = "id, name, sector, min_budget, max_budget, zones, \
    experience_years, include_keywords, exclude_keywords, email";

/// Maximum stored length of a notification error message.
pub const MAX_NOTIFICATION_ERROR_CHARS: usize = 500;

// ============================================================================
// Notification log types
// ============================================================================

/// Delivery state of one notification attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationStatus {
    Pending,
    Sent,
    Failed,
}

impl NotificationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Sent => "sent",
            Self::Failed => "failed",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "sent" => Self::Sent,
            "failed" => Self::Failed,
            _ => Self::Pending,
        }
    }
}

impl std::fmt::Display for NotificationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A notification attempt about to be made.
#[derive(Debug, Clone)]
pub struct NewNotification {
    pub enterprise_id: EnterpriseId,
    pub channel: String,
    pub recipient: String,
    pub match_count: usize,
}

/// A row of the notification log.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NotificationLogEntry {
    pub id: i64,
    pub enterprise_id: EnterpriseId,
    pub channel: String,
    pub recipient: String,
    pub match_count: usize,
    pub status: NotificationStatus,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
}

// ============================================================================
// Repository Trait
// ============================================================================

/// Storage operations used by the pipeline.
#[async_trait]
pub trait Repository: Send + Sync {
    /// Tenders not analyzed yet, oldest first.
    async fn get_pending_tenders(&self) -> Result<Vec<TenderRecord>>;

    /// Insert scraped tenders, ignoring URLs already stored.
    /// Returns only the rows actually created.
    async fn save_tender_batch(
        &self,
        tenders: Vec<NewTender>,
        now: DateTime<Utc>,
    ) -> Result<Vec<TenderRecord>>;

    /// Insert or replace the analysis of a tender.
    async fn upsert_analysis(&self, analysis: &AnalysisRecord) -> Result<()>;

    /// Analyzed tenders with their analysis, oldest first.
    async fn list_analyzed_tenders(&self) -> Result<Vec<AnalyzedTender>>;

    async fn list_enterprises(&self) -> Result<Vec<EnterpriseProfile>>;

    async fn get_enterprise(&self, id: EnterpriseId) -> Result<Option<EnterpriseProfile>>;

    /// Insert or update an enterprise by name, returning its id.
    async fn upsert_enterprise(&self, enterprise: &EnterpriseProfile) -> Result<EnterpriseId>;

    /// Pending tenders that reference a document but have no text yet.
    async fn get_tenders_missing_text(&self) -> Result<Vec<TenderRecord>>;

    async fn update_raw_text(&self, tender_id: TenderId, text: &str) -> Result<()>;

    /// Persist a batch of analysis results in one transaction: tender fields,
    /// the analyzed flag and each analysis row.
    async fn commit_analysis_batch(&self, items: &[AnalyzedTender]) -> Result<()>;

    /// Overwrite the shared score fields of each scored tender's analysis,
    /// in one transaction.
    async fn record_scores(
        &self,
        enterprise_id: EnterpriseId,
        scored: &[ScoredTender],
    ) -> Result<()>;

    async fn count_tenders(&self) -> Result<usize>;

    /// Record a pending notification attempt, returning its log id.
    async fn log_notification(&self, entry: &NewNotification, now: DateTime<Utc>) -> Result<i64>;

    async fn update_notification_status(
        &self,
        log_id: i64,
        status: NotificationStatus,
        error: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<()>;

    async fn list_notifications(&self, enterprise_id: EnterpriseId)
        -> Result<Vec<NotificationLogEntry>>;
}

// ============================================================================
// SQLite Implementation
// ============================================================================

/// SQLite-backed repository.
pub struct SqliteRepository {
    /// rusqlite::Connection is Send but not Sync, hence a Mutex
    db: Arc<Mutex<Connection>>,
    path: Option<PathBuf>,
}

impl SqliteRepository {
    /// Open (or create) the database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path).map_err(|e| {
            Error::Persistence(format!("failed to open {}: {}", path.display(), e))
        })?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(persistence)?;
        conn.execute_batch(CREATE_TABLES_SQL).map_err(persistence)?;

        info!(db_path = %path.display(), "Initialized tender storage");

        Ok(Self {
            db: Arc::new(Mutex::new(conn)),
            path: Some(path.to_path_buf()),
        })
    }

    /// Private in-memory database.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(persistence)?;
        conn.execute_batch(CREATE_TABLES_SQL).map_err(persistence)?;
        Ok(Self {
            db: Arc::new(Mutex::new(conn)),
            path: None,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn query_tenders(
        conn: &Connection,
        filter: &str,
    ) -> rusqlite::Result<Vec<TenderRecord>> {
        let sql = format!("SELECT {TENDER_COLUMNS} FROM tenders t {filter} ORDER BY t.id");
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([], |row| row_to_tender(row, 0))?;
        rows.collect()
    }

    fn query_enterprises(
        conn: &Connection,
        filter: &str,
        id: Option<EnterpriseId>,
    ) -> rusqlite::Result<Vec<EnterpriseProfile>> {
        let sql = format!("SELECT {ENTERPRISE_COLUMNS} FROM enterprises {filter} ORDER BY id");
        let mut stmt = conn.prepare(&sql)?;
        let rows = match id {
            Some(id) => stmt.query_map(params![id], row_to_enterprise)?,
            None => stmt.query_map([], row_to_enterprise)?,
        };
        rows.collect()
    }
}

#[async_trait]
impl Repository for SqliteRepository {
    async fn get_pending_tenders(&self) -> Result<Vec<TenderRecord>> {
        let db = self.db.lock().await;
        Self::query_tenders(&db, "WHERE t.analyzed = 0").map_err(persistence)
    }

    async fn save_tender_batch(
        &self,
        tenders: Vec<NewTender>,
        now: DateTime<Utc>,
    ) -> Result<Vec<TenderRecord>> {
        if tenders.is_empty() {
            return Ok(Vec::new());
        }

        let mut db = self.db.lock().await;
        let tx = db.transaction().map_err(persistence)?;
        let mut created = Vec::new();
        let submitted = tenders.len();

        for tender in tenders {
            let inserted = tx
                .execute(
                    r#"
                    INSERT OR IGNORE INTO tenders
                    (title, description, sector, estimated_budget, location, deadline,
                     source_url, document_path, analyzed, created_at)
                    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 0, ?9)
                    "#,
                    params![
                        tender.title,
                        tender.description,
                        tender.sector,
                        tender.estimated_budget,
                        tender.location,
                        format_date(tender.deadline),
                        tender.source_url,
                        tender.document_path,
                        now.to_rfc3339(),
                    ],
                )
                .map_err(persistence)?;

            if inserted == 1 {
                created.push(TenderRecord::from_new(tx.last_insert_rowid(), tender, now));
            }
        }

        tx.commit().map_err(persistence)?;
        debug!(submitted, created = created.len(), "Saved tender batch");
        Ok(created)
    }

    async fn upsert_analysis(&self, analysis: &AnalysisRecord) -> Result<()> {
        let db = self.db.lock().await;
        write_analysis(&db, analysis).map_err(persistence)
    }

    async fn list_analyzed_tenders(&self) -> Result<Vec<AnalyzedTender>> {
        let db = self.db.lock().await;
        let sql = format!(
            "SELECT {TENDER_COLUMNS}, {ANALYSIS_COLUMNS}
             FROM tenders t LEFT JOIN analyses a ON a.tender_id = t.id
             WHERE t.analyzed = 1 ORDER BY t.id"
        );
        let mut stmt = db.prepare(&sql).map_err(persistence)?;
        let rows = stmt
            .query_map([], |row| {
                Ok(AnalyzedTender {
                    tender: row_to_tender(row, 0)?,
                    analysis: row_to_analysis(row, 12)?,
                })
            })
            .map_err(persistence)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(persistence)
    }

    async fn list_enterprises(&self) -> Result<Vec<EnterpriseProfile>> {
        let db = self.db.lock().await;
        Self::query_enterprises(&db, "", None).map_err(persistence)
    }

    async fn get_enterprise(&self, id: EnterpriseId) -> Result<Option<EnterpriseProfile>> {
        let db = self.db.lock().await;
        let mut found = Self::query_enterprises(&db, "WHERE id = ?1", Some(id)).map_err(persistence)?;
        Ok(found.pop())
    }

    async fn upsert_enterprise(&self, enterprise: &EnterpriseProfile) -> Result<EnterpriseId> {
        let db = self.db.lock().await;
        db.execute(
            r#"
            INSERT INTO enterprises
            (name, sector, min_budget, max_budget, zones, experience_years,
             include_keywords, exclude_keywords, email, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, CURRENT_TIMESTAMP)
            ON CONFLICT(name) DO UPDATE SET
                sector = excluded.sector,
                min_budget = excluded.min_budget,
                max_budget = excluded.max_budget,
                zones = excluded.zones,
                experience_years = excluded.experience_years,
                include_keywords = excluded.include_keywords,
                exclude_keywords = excluded.exclude_keywords,
                email = excluded.email,
                updated_at = CURRENT_TIMESTAMP
            "#,
            params![
                enterprise.name,
                enterprise.sector,
                enterprise.min_budget,
                enterprise.max_budget,
                join_list(&enterprise.zones),
                enterprise.experience_years,
                join_list(&enterprise.include_keywords),
                join_list(&enterprise.exclude_keywords),
                enterprise.email,
            ],
        )
        .map_err(persistence)?;

        db.query_row(
            "SELECT id FROM enterprises WHERE name = ?1",
            params![enterprise.name],
            |row| row.get(0),
        )
        .map_err(persistence)
    }

    async fn get_tenders_missing_text(&self) -> Result<Vec<TenderRecord>> {
        let db = self.db.lock().await;
        Self::query_tenders(
            &db,
            "WHERE t.analyzed = 0 AND t.document_path IS NOT NULL AND t.document_path != '' \
             AND (t.raw_text IS NULL OR t.raw_text = '')",
        )
        .map_err(persistence)
    }

    async fn update_raw_text(&self, tender_id: TenderId, text: &str) -> Result<()> {
        let db = self.db.lock().await;
        let updated = db
            .execute(
                "UPDATE tenders SET raw_text = ?1 WHERE id = ?2",
                params![text, tender_id],
            )
            .map_err(persistence)?;
        if updated == 0 {
            return Err(Error::NotFound(format!("tender {tender_id}")));
        }
        Ok(())
    }

    async fn commit_analysis_batch(&self, items: &[AnalyzedTender]) -> Result<()> {
        if items.is_empty() {
            return Ok(());
        }

        let mut db = self.db.lock().await;
        let tx = db.transaction().map_err(persistence)?;

        for item in items {
            let t = &item.tender;
            tx.execute(
                r#"
                UPDATE tenders
                SET sector = ?1, estimated_budget = ?2, location = ?3, deadline = ?4,
                    analyzed = ?5
                WHERE id = ?6
                "#,
                params![
                    t.sector,
                    t.estimated_budget,
                    t.location,
                    format_date(t.deadline),
                    t.analyzed,
                    t.id,
                ],
            )
            .map_err(persistence)?;

            if let Some(analysis) = &item.analysis {
                write_analysis(&tx, analysis).map_err(persistence)?;
            }
        }

        tx.commit().map_err(persistence)?;
        debug!(count = items.len(), "Committed analysis batch");
        Ok(())
    }

    async fn record_scores(
        &self,
        enterprise_id: EnterpriseId,
        scored: &[ScoredTender],
    ) -> Result<()> {
        if scored.is_empty() {
            return Ok(());
        }

        let mut db = self.db.lock().await;
        let tx = db.transaction().map_err(persistence)?;
        {
            let mut stmt = tx
                .prepare(
                    "UPDATE analyses SET score = ?1, explanation = ?2, enterprise_id = ?3 WHERE tender_id = ?4",
                )
                .map_err(persistence)?;
            for item in scored {
                stmt.execute(params![
                    item.score(),
                    item.result.explanation,
                    enterprise_id,
                    item.tender_id
                ])
                .map_err(persistence)?;
            }
        }
        tx.commit().map_err(persistence)?;
        debug!(enterprise_id, count = scored.len(), "Recorded scores");
        Ok(())
    }

    async fn count_tenders(&self) -> Result<usize> {
        let db = self.db.lock().await;
        let count: i64 = db
            .query_row("SELECT COUNT(*) FROM tenders", [], |row| row.get(0))
            .map_err(persistence)?;
        Ok(count as usize)
    }

    async fn log_notification(&self, entry: &NewNotification, now: DateTime<Utc>) -> Result<i64> {
        let db = self.db.lock().await;
        db.execute(
            r#"
            INSERT INTO notification_log
            (enterprise_id, channel, recipient, match_count, status, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                entry.enterprise_id,
                entry.channel,
                entry.recipient,
                entry.match_count as i64,
                NotificationStatus::Pending.as_str(),
                now.to_rfc3339(),
            ],
        )
        .map_err(persistence)?;
        Ok(db.last_insert_rowid())
    }

    async fn update_notification_status(
        &self,
        log_id: i64,
        status: NotificationStatus,
        error: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let error = error.map(|e| tender_common::util::truncate_chars(e, MAX_NOTIFICATION_ERROR_CHARS));
        let sent_at = (status == NotificationStatus::Sent).then(|| now.to_rfc3339());

        let db = self.db.lock().await;
        db.execute(
            "UPDATE notification_log SET status = ?1, error_message = ?2, sent_at = COALESCE(?3, sent_at) WHERE id = ?4",
            params![status.as_str(), error, sent_at, log_id],
        )
        .map_err(persistence)?;
        Ok(())
    }

    async fn list_notifications(
        &self,
        enterprise_id: EnterpriseId,
    ) -> Result<Vec<NotificationLogEntry>> {
        let db = self.db.lock().await;
        let mut stmt = db
            .prepare(
                "SELECT id, enterprise_id, channel, recipient, match_count, status, error_message,
                        created_at, sent_at
                 FROM notification_log WHERE enterprise_id = ?1 ORDER BY id",
            )
            .map_err(persistence)?;
        let rows = stmt
            .query_map(params![enterprise_id], |row| {
                let status: String = row.get(5)?;
                let count: i64 = row.get(4)?;
                Ok(NotificationLogEntry {
                    id: row.get(0)?,
                    enterprise_id: row.get(1)?,
                    channel: row.get(2)?,
                    recipient: row.get(3)?,
                    match_count: count.max(0) as usize,
                    status: NotificationStatus::parse(&status),
                    error_message: row.get(6)?,
                    created_at: parse_timestamp(&row.get::<_, String>(7)?),
                    sent_at: row.get::<_, Option<String>>(8)?.map(|s| parse_timestamp(&s)),
                })
            })
            .map_err(persistence)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(persistence)
    }
}

// ============================================================================
// Row mapping
// ============================================================================

fn persistence(err: rusqlite::Error) -> Error {
    Error::Persistence(err.to_string())
}

fn write_analysis(conn: &Connection, a: &AnalysisRecord) -> rusqlite::Result<()> {
    conn.execute(
        r#"
        INSERT INTO analyses
        (tender_id, enterprise_id, summary, sector, estimated_budget, location, deadline,
         score, explanation, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
        ON CONFLICT(tender_id) DO UPDATE SET
            enterprise_id = excluded.enterprise_id,
            summary = excluded.summary,
            sector = excluded.sector,
            estimated_budget = excluded.estimated_budget,
            location = excluded.location,
            deadline = excluded.deadline,
            score = excluded.score,
            explanation = excluded.explanation
        "#,
        params![
            a.tender_id,
            a.enterprise_id,
            a.info.summary,
            a.info.sector,
            a.info.estimated_budget,
            a.info.location,
            format_date(a.info.deadline),
            a.score,
            a.explanation,
            a.created_at.to_rfc3339(),
        ],
    )?;
    Ok(())
}

fn row_to_tender(row: &Row, offset: usize) -> rusqlite::Result<TenderRecord> {
    let deadline: Option<String> = row.get(offset + 7)?;
    let created_at: String = row.get(offset + 11)?;
    Ok(TenderRecord {
        id: row.get(offset)?,
        title: row.get(offset + 1)?,
        description: row.get(offset + 2)?,
        raw_text: row.get(offset + 3)?,
        sector: row.get(offset + 4)?,
        estimated_budget: row.get(offset + 5)?,
        location: row.get(offset + 6)?,
        deadline: parse_date(deadline.as_deref()),
        source_url: row.get(offset + 8)?,
        document_path: row.get(offset + 9)?,
        analyzed: row.get(offset + 10)?,
        created_at: parse_timestamp(&created_at),
    })
}

fn row_to_analysis(row: &Row, offset: usize) -> rusqlite::Result<Option<AnalysisRecord>> {
    let Some(tender_id) = row.get::<_, Option<TenderId>>(offset)? else {
        return Ok(None);
    };
    let deadline: Option<String> = row.get(offset + 6)?;
    let created_at: String = row.get(offset + 9)?;
    Ok(Some(AnalysisRecord {
        tender_id,
        enterprise_id: row.get(offset + 1)?,
        info: ExtractedInfo {
            summary: row.get(offset + 2)?,
            sector: row.get::<_, Option<String>>(offset + 3)?.unwrap_or_default(),
            estimated_budget: row.get::<_, Option<f64>>(offset + 4)?.unwrap_or(0.0),
            location: row.get::<_, Option<String>>(offset + 5)?.unwrap_or_default(),
            deadline: parse_date(deadline.as_deref()),
        },
        score: row.get(offset + 7)?,
        explanation: row.get(offset + 8)?,
        created_at: parse_timestamp(&created_at),
    }))
}

fn row_to_enterprise(row: &Row) -> rusqlite::Result<EnterpriseProfile> {
    let zones: String = row.get(5)?;
    let include: String = row.get(7)?;
    let exclude: String = row.get(8)?;
    let years: i64 = row.get(6)?;
    Ok(EnterpriseProfile {
        id: row.get(0)?,
        name: row.get(1)?,
        sector: row.get(2)?,
        min_budget: row.get(3)?,
        max_budget: row.get(4)?,
        zones: parse_list(&zones),
        experience_years: years.max(0) as u32,
        include_keywords: parse_list(&include),
        exclude_keywords: parse_list(&exclude),
        email: row.get(9)?,
    })
}

fn format_date(date: Option<NaiveDate>) -> Option<String> {
    date.map(|d| d.format(DATE_FORMAT).to_string())
}

fn parse_date(raw: Option<&str>) -> Option<NaiveDate> {
    raw.and_then(|s| NaiveDate::parse_from_str(s, DATE_FORMAT).ok())
}

fn parse_timestamp(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}
