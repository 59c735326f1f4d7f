//! SQLite store.
//!
//! rusqlite is synchronous, so every trait method opens a connection inside
//! `tokio::task::spawn_blocking`. Multi-statement writes run in a single
//! transaction; counter updates are single `UPDATE ... SET x = x + 1`
//! statements so concurrent increments never lose writes.
//!
//! Keyword and similarity ranking happen in Rust over the active rows of one
//! kind, which keeps their semantics identical to [`MemoryStore`](super::MemoryStore).

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use uuid::Uuid;

use super::{rank_by_reputation, rank_by_similarity, CapabilityFilter, CapabilityStore};
use crate::cache::CacheEntry;
use crate::capabilities::{
    Capability, CapabilityBody, CapabilityId, CapabilityKind, CapabilityStatus, ScoredCapability,
};
use crate::embeddings::cosine_similarity;
use crate::error::{RegistryError, Result};
use crate::governance::{
    GovernanceAction, Report, ReportStatus, Resolution, StateChange,
};
use crate::reputation::{score, Feedback, FeedbackStats};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS capabilities (
    id TEXT PRIMARY KEY,
    kind TEXT NOT NULL,
    name TEXT NOT NULL,
    version TEXT NOT NULL,
    description TEXT NOT NULL,
    tags TEXT NOT NULL,
    skills TEXT NOT NULL,
    reputation_score REAL NOT NULL,
    usage_count INTEGER NOT NULL DEFAULT 0,
    feedback_count INTEGER NOT NULL DEFAULT 0,
    avg_rating REAL NOT NULL DEFAULT 0,
    embedding TEXT,
    is_system INTEGER NOT NULL DEFAULT 0,
    is_generated INTEGER NOT NULL DEFAULT 0,
    created_by TEXT,
    metadata TEXT NOT NULL,
    status TEXT NOT NULL,
    payload TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    UNIQUE (kind, name)
);
CREATE INDEX IF NOT EXISTS idx_capabilities_kind_status ON capabilities (kind, status);

CREATE TABLE IF NOT EXISTS feedback (
    id TEXT PRIMARY KEY,
    capability_id TEXT NOT NULL,
    session_id TEXT,
    rating INTEGER NOT NULL,
    task_success INTEGER NOT NULL,
    task_type TEXT,
    feedback_text TEXT,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_feedback_capability ON feedback (capability_id);

CREATE TABLE IF NOT EXISTS reports (
    id TEXT PRIMARY KEY,
    target_id TEXT NOT NULL,
    target_name TEXT NOT NULL,
    reported_by TEXT NOT NULL,
    report_type TEXT NOT NULL,
    severity TEXT NOT NULL,
    description TEXT NOT NULL,
    evidence TEXT NOT NULL,
    status TEXT NOT NULL,
    reviewed_by TEXT,
    resolution TEXT,
    resolution_note TEXT,
    created_at TEXT NOT NULL,
    resolved_at TEXT
);
CREATE INDEX IF NOT EXISTS idx_reports_target_status ON reports (target_id, status);

CREATE TABLE IF NOT EXISTS governance_actions (
    id TEXT PRIMARY KEY,
    target_id TEXT NOT NULL,
    target_name TEXT NOT NULL,
    report_id TEXT,
    action_type TEXT NOT NULL,
    role TEXT NOT NULL,
    reason TEXT NOT NULL,
    previous_status TEXT,
    previous_reputation REAL,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_actions_target ON governance_actions (target_id);

CREATE TABLE IF NOT EXISTS skill_request_cache (
    fingerprint TEXT PRIMARY KEY,
    skills TEXT NOT NULL,
    capability_id TEXT NOT NULL,
    hit_count INTEGER NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL,
    last_used TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS skill_request_claims (
    fingerprint TEXT PRIMARY KEY,
    claimed_at TEXT NOT NULL
);
";

const CAPABILITY_COLUMNS: &str = "id, kind, name, version, description, tags, skills, \
    reputation_score, usage_count, feedback_count, avg_rating, embedding, is_system, \
    is_generated, created_by, metadata, status, payload, created_at, updated_at";

const REPORT_COLUMNS: &str = "id, target_id, target_name, reported_by, report_type, severity, \
    description, evidence, status, reviewed_by, resolution, resolution_note, created_at, resolved_at";

const ACTION_COLUMNS: &str = "id, target_id, target_name, report_id, action_type, role, reason, \
    previous_status, previous_reputation, created_at";

/// SQLite-backed [`CapabilityStore`].
#[derive(Debug, Clone)]
pub struct SqliteStore {
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
}

impl SqliteStore {
    /// Open (creating if needed) the database at `db_path` and apply the schema.
    pub fn new(db_path: impl Into<PathBuf>) -> Result<Self> {
        let db_path = db_path.into();
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                RegistryError::Persistence(format!(
                    "cannot create {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }
        let conn = open(&db_path)?;
        conn.execute_batch(SCHEMA)?;
        log::debug!("SQLite store ready at {}", db_path.display());
        Ok(Self { db_path })
    }

    /// Run `f` on a fresh connection in the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = open(&db_path)?;
            f(&mut conn)
        })
        .await?
    }
}

fn open(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(Duration::from_secs(5))?;
    Ok(conn)
}

// ---- value conversions ----

fn fmt_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| RegistryError::Persistence(format!("bad timestamp '{}': {}", raw, e)))
}

fn parse_id(raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw)
        .map_err(|e| RegistryError::Persistence(format!("bad id '{}': {}", raw, e)))
}

fn parse_enum<T: std::str::FromStr<Err = RegistryError>>(raw: &str) -> Result<T> {
    raw.parse()
        .map_err(|e: RegistryError| RegistryError::Persistence(e.to_string()))
}

/// Status strings in the audit trail carry no kind; agent statuses win.
fn parse_any_status(raw: &str) -> Result<CapabilityStatus> {
    CapabilityStatus::parse(CapabilityKind::Agent, raw)
        .or_else(|_| CapabilityStatus::parse(CapabilityKind::Skill, raw))
        .map_err(|e| RegistryError::Persistence(e.to_string()))
}

fn split_body(body: &CapabilityBody) -> Result<(String, String)> {
    let payload = match body {
        CapabilityBody::Agent { profile, .. } => serde_json::to_string(profile)?,
        CapabilityBody::Skill { document, .. } => serde_json::to_string(document)?,
        CapabilityBody::Command { template, .. } => serde_json::to_string(template)?,
    };
    Ok((body.status().as_str().to_string(), payload))
}

fn join_body(kind: CapabilityKind, status: &str, payload: &str) -> Result<CapabilityBody> {
    let mut body = match kind {
        CapabilityKind::Agent => CapabilityBody::agent(serde_json::from_str(payload)?),
        CapabilityKind::Skill => CapabilityBody::skill(serde_json::from_str(payload)?),
        CapabilityKind::Command => CapabilityBody::command(serde_json::from_str(payload)?),
    };
    body.set_status(CapabilityStatus::parse(kind, status)?)?;
    Ok(body)
}

struct CapabilityRow {
    id: String,
    kind: String,
    name: String,
    version: String,
    description: String,
    tags: String,
    skills: String,
    reputation_score: f64,
    usage_count: i64,
    feedback_count: i64,
    avg_rating: f64,
    embedding: Option<String>,
    is_system: bool,
    is_generated: bool,
    created_by: Option<String>,
    metadata: String,
    status: String,
    payload: String,
    created_at: String,
    updated_at: String,
}

impl CapabilityRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            kind: row.get(1)?,
            name: row.get(2)?,
            version: row.get(3)?,
            description: row.get(4)?,
            tags: row.get(5)?,
            skills: row.get(6)?,
            reputation_score: row.get(7)?,
            usage_count: row.get(8)?,
            feedback_count: row.get(9)?,
            avg_rating: row.get(10)?,
            embedding: row.get(11)?,
            is_system: row.get(12)?,
            is_generated: row.get(13)?,
            created_by: row.get(14)?,
            metadata: row.get(15)?,
            status: row.get(16)?,
            payload: row.get(17)?,
            created_at: row.get(18)?,
            updated_at: row.get(19)?,
        })
    }

    fn into_capability(self) -> Result<Capability> {
        let kind: CapabilityKind = parse_enum(&self.kind)?;
        Ok(Capability {
            id: parse_id(&self.id)?,
            name: self.name,
            version: self.version,
            description: self.description,
            tags: serde_json::from_str(&self.tags)?,
            skills: serde_json::from_str(&self.skills)?,
            reputation_score: self.reputation_score,
            usage_count: self.usage_count.max(0) as u64,
            feedback_count: self.feedback_count.max(0) as u64,
            avg_rating: self.avg_rating,
            embedding: self
                .embedding
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?,
            is_system: self.is_system,
            is_generated: self.is_generated,
            created_by: self.created_by,
            metadata: serde_json::from_str(&self.metadata)?,
            created_at: parse_ts(&self.created_at)?,
            updated_at: parse_ts(&self.updated_at)?,
            body: join_body(kind, &self.status, &self.payload)?,
        })
    }
}

fn query_capabilities<P: rusqlite::Params>(
    conn: &Connection,
    sql: &str,
    params: P,
) -> Result<Vec<Capability>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params, CapabilityRow::from_row)?;
    let mut caps = Vec::new();
    for row in rows {
        caps.push(row?.into_capability()?);
    }
    Ok(caps)
}

fn load_capability(conn: &Connection, id: CapabilityId) -> Result<Option<Capability>> {
    let sql = format!("SELECT {} FROM capabilities WHERE id = ?1", CAPABILITY_COLUMNS);
    Ok(query_capabilities(conn, &sql, params![id.to_string()])?
        .into_iter()
        .next())
}

fn active_of_kind(conn: &Connection, kind: CapabilityKind) -> Result<Vec<Capability>> {
    let sql = format!(
        "SELECT {} FROM capabilities WHERE kind = ?1 AND status = 'active'",
        CAPABILITY_COLUMNS
    );
    query_capabilities(conn, &sql, params![kind.as_str()])
}

fn ensure_updated(rows: usize, id: impl std::fmt::Display) -> Result<()> {
    if rows == 0 {
        Err(RegistryError::not_found("capability", id))
    } else {
        Ok(())
    }
}

fn set_status(conn: &Connection, id: CapabilityId, status: CapabilityStatus) -> Result<()> {
    let cap = load_capability(conn, id)?.ok_or_else(|| RegistryError::not_found("capability", id))?;
    // Rejects statuses outside the capability's domain.
    cap.body.clone().set_status(status)?;
    let rows = conn.execute(
        "UPDATE capabilities SET status = ?1, updated_at = ?2 WHERE id = ?3",
        params![status.as_str(), fmt_ts(&Utc::now()), id.to_string()],
    )?;
    ensure_updated(rows, id)
}

fn set_reputation(conn: &Connection, id: CapabilityId, score: f64) -> Result<()> {
    let rows = conn.execute(
        "UPDATE capabilities SET reputation_score = ?1, updated_at = ?2 WHERE id = ?3",
        params![score, fmt_ts(&Utc::now()), id.to_string()],
    )?;
    ensure_updated(rows, id)
}

fn load_feedback_stats(conn: &Connection, id: CapabilityId) -> Result<FeedbackStats> {
    let mut stmt = conn.prepare(
        "SELECT id, rating, task_success, task_type, created_at
         FROM feedback WHERE capability_id = ?1",
    )?;
    let rows = stmt.query_map(params![id.to_string()], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, i64>(1)?,
            row.get::<_, bool>(2)?,
            row.get::<_, Option<String>>(3)?,
            row.get::<_, String>(4)?,
        ))
    })?;
    let mut stats = FeedbackStats::default();
    for row in rows {
        let (fid, rating, task_success, task_type, created_at) = row?;
        stats.add(&Feedback {
            id: parse_id(&fid)?,
            capability_id: id,
            session_id: None,
            rating: rating.clamp(0, u8::MAX as i64) as u8,
            task_success,
            task_type,
            feedback_text: None,
            created_at: parse_ts(&created_at)?,
        });
    }
    Ok(stats)
}

fn insert_action(conn: &Connection, action: &GovernanceAction) -> Result<()> {
    conn.execute(
        "INSERT INTO governance_actions (id, target_id, target_name, report_id, action_type, \
         role, reason, previous_status, previous_reputation, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            action.id.to_string(),
            action.target_id.to_string(),
            action.target_name,
            action.report_id.map(|id| id.to_string()),
            action.action_type.as_str(),
            action.role.as_str(),
            action.reason,
            action.previous_status.map(|s| s.as_str()),
            action.previous_reputation,
            fmt_ts(&action.created_at),
        ],
    )?;
    Ok(())
}

fn report_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<[Option<String>; 14]> {
    let mut out: [Option<String>; 14] = Default::default();
    for (i, slot) in out.iter_mut().enumerate() {
        *slot = row.get(i)?;
    }
    Ok(out)
}

fn required(field: &Option<String>, name: &str) -> Result<String> {
    field
        .clone()
        .ok_or_else(|| RegistryError::Persistence(format!("missing column {}", name)))
}

fn build_report(cols: [Option<String>; 14]) -> Result<Report> {
    let [id, target_id, target_name, reported_by, report_type, severity, description, evidence, status, reviewed_by, resolution, resolution_note, created_at, resolved_at] =
        cols;
    Ok(Report {
        id: parse_id(&required(&id, "id")?)?,
        target_id: parse_id(&required(&target_id, "target_id")?)?,
        target_name: required(&target_name, "target_name")?,
        reported_by: required(&reported_by, "reported_by")?,
        report_type: parse_enum(&required(&report_type, "report_type")?)?,
        severity: parse_enum(&required(&severity, "severity")?)?,
        description: required(&description, "description")?,
        evidence: serde_json::from_str(&required(&evidence, "evidence")?)?,
        status: parse_enum(&required(&status, "status")?)?,
        reviewed_by,
        resolution: resolution.as_deref().map(parse_enum).transpose()?,
        resolution_note,
        created_at: parse_ts(&required(&created_at, "created_at")?)?,
        resolved_at: resolved_at.as_deref().map(parse_ts).transpose()?,
    })
}

fn query_reports<P: rusqlite::Params>(conn: &Connection, sql: &str, params: P) -> Result<Vec<Report>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params, report_from_row)?;
    let mut reports = Vec::new();
    for row in rows {
        reports.push(build_report(row?)?);
    }
    Ok(reports)
}

type ActionRow = (
    String,
    String,
    String,
    Option<String>,
    String,
    String,
    String,
    Option<String>,
    Option<f64>,
    String,
);

fn build_action(row: ActionRow) -> Result<GovernanceAction> {
    let (id, target_id, target_name, report_id, action_type, role, reason, prev_status, prev_rep, created_at) =
        row;
    Ok(GovernanceAction {
        id: parse_id(&id)?,
        target_id: parse_id(&target_id)?,
        target_name,
        report_id: report_id.as_deref().map(parse_id).transpose()?,
        action_type: parse_enum(&action_type)?,
        role: parse_enum(&role)?,
        reason,
        previous_status: prev_status.as_deref().map(parse_any_status).transpose()?,
        previous_reputation: prev_rep,
        created_at: parse_ts(&created_at)?,
    })
}

fn count(conn: &Connection, sql: &str, params: impl rusqlite::Params) -> Result<u64> {
    let n: i64 = conn.query_row(sql, params, |row| row.get(0))?;
    Ok(n.max(0) as u64)
}

#[async_trait]
impl CapabilityStore for SqliteStore {
    async fn get(&self, kind: CapabilityKind, name: &str) -> Result<Option<Capability>> {
        let name = name.to_string();
        self.with_conn(move |conn| {
            let sql = format!(
                "SELECT {} FROM capabilities WHERE kind = ?1 AND name = ?2",
                CAPABILITY_COLUMNS
            );
            Ok(query_capabilities(conn, &sql, params![kind.as_str(), name])?
                .into_iter()
                .next())
        })
        .await
    }

    async fn get_by_id(&self, id: CapabilityId) -> Result<Option<Capability>> {
        self.with_conn(move |conn| load_capability(conn, id)).await
    }

    async fn list(&self, filter: &CapabilityFilter) -> Result<Vec<Capability>> {
        let filter = filter.clone();
        self.with_conn(move |conn| {
            let sql = format!("SELECT {} FROM capabilities", CAPABILITY_COLUMNS);
            let mut caps: Vec<Capability> = query_capabilities(conn, &sql, [])?
                .into_iter()
                .filter(|c| filter.matches(c))
                .collect();
            rank_by_reputation(&mut caps);
            if let Some(limit) = filter.limit {
                caps.truncate(limit);
            }
            Ok(caps)
        })
        .await
    }

    async fn search_keyword(&self, kind: CapabilityKind, query: &str) -> Result<Vec<Capability>> {
        let query = query.to_string();
        self.with_conn(move |conn| {
            let mut caps: Vec<Capability> = active_of_kind(conn, kind)?
                .into_iter()
                .filter(|c| c.matches_keyword(&query))
                .collect();
            rank_by_reputation(&mut caps);
            Ok(caps)
        })
        .await
    }

    async fn search_similar(
        &self,
        kind: CapabilityKind,
        vector: &[f32],
        limit: usize,
        threshold: f64,
    ) -> Result<Vec<ScoredCapability>> {
        let vector = vector.to_vec();
        self.with_conn(move |conn| {
            let mut hits: Vec<ScoredCapability> = active_of_kind(conn, kind)?
                .into_iter()
                .filter_map(|c| {
                    let similarity = cosine_similarity(c.embedding.as_deref()?, &vector);
                    (similarity >= threshold).then_some(ScoredCapability {
                        capability: c,
                        similarity,
                    })
                })
                .collect();
            rank_by_similarity(&mut hits);
            hits.truncate(limit);
            Ok(hits)
        })
        .await
    }

    async fn create(&self, capability: Capability) -> Result<Capability> {
        self.with_conn(move |conn| {
            let (status, payload) = split_body(&capability.body)?;
            let embedding = capability
                .embedding
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?;
            let result = conn.execute(
                &format!(
                    "INSERT INTO capabilities ({}) VALUES \
                     (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20)",
                    CAPABILITY_COLUMNS
                ),
                params![
                    capability.id.to_string(),
                    capability.kind().as_str(),
                    capability.name,
                    capability.version,
                    capability.description,
                    serde_json::to_string(&capability.tags)?,
                    serde_json::to_string(&capability.skills)?,
                    capability.reputation_score,
                    capability.usage_count as i64,
                    capability.feedback_count as i64,
                    capability.avg_rating,
                    embedding,
                    capability.is_system,
                    capability.is_generated,
                    capability.created_by,
                    serde_json::to_string(&capability.metadata)?,
                    status,
                    payload,
                    fmt_ts(&capability.created_at),
                    fmt_ts(&capability.updated_at),
                ],
            );
            match result {
                Ok(_) => Ok(capability),
                Err(rusqlite::Error::SqliteFailure(e, _))
                    if e.code == rusqlite::ErrorCode::ConstraintViolation =>
                {
                    Err(RegistryError::Conflict(format!(
                        "{} '{}' already exists",
                        capability.kind(),
                        capability.name
                    )))
                }
                Err(e) => Err(e.into()),
            }
        })
        .await
    }

    async fn update_status(&self, id: CapabilityId, status: CapabilityStatus) -> Result<()> {
        self.with_conn(move |conn| set_status(conn, id, status)).await
    }

    async fn update_reputation(&self, id: CapabilityId, score: f64) -> Result<()> {
        self.with_conn(move |conn| set_reputation(conn, id, score)).await
    }

    async fn increment_usage(&self, id: CapabilityId) -> Result<()> {
        self.with_conn(move |conn| {
            let rows = conn.execute(
                "UPDATE capabilities SET usage_count = usage_count + 1 WHERE id = ?1",
                params![id.to_string()],
            )?;
            ensure_updated(rows, id)
        })
        .await
    }

    async fn count_by_status(&self, kind: CapabilityKind, status: CapabilityStatus) -> Result<u64> {
        self.with_conn(move |conn| {
            count(
                conn,
                "SELECT COUNT(*) FROM capabilities WHERE kind = ?1 AND status = ?2",
                params![kind.as_str(), status.as_str()],
            )
        })
        .await
    }

    async fn record_feedback(&self, feedback: &Feedback) -> Result<(Capability, FeedbackStats)> {
        let feedback = feedback.clone();
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let rows = tx.execute(
                "UPDATE capabilities SET
                    avg_rating = (avg_rating * feedback_count + ?1) / (feedback_count + 1),
                    feedback_count = feedback_count + 1,
                    updated_at = ?2
                 WHERE id = ?3",
                params![
                    feedback.rating as f64,
                    fmt_ts(&Utc::now()),
                    feedback.capability_id.to_string()
                ],
            )?;
            ensure_updated(rows, feedback.capability_id)?;
            tx.execute(
                "INSERT INTO feedback (id, capability_id, session_id, rating, task_success, \
                 task_type, feedback_text, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    feedback.id.to_string(),
                    feedback.capability_id.to_string(),
                    feedback.session_id,
                    feedback.rating as i64,
                    feedback.task_success,
                    feedback.task_type,
                    feedback.feedback_text,
                    fmt_ts(&feedback.created_at),
                ],
            )?;
            let stats = load_feedback_stats(&tx, feedback.capability_id)?;
            let mut updated = load_capability(&tx, feedback.capability_id)?
                .ok_or_else(|| RegistryError::not_found("capability", feedback.capability_id))?;
            if !updated.is_system {
                updated.reputation_score = score(
                    updated.feedback_count,
                    updated.avg_rating,
                    updated.usage_count,
                    stats.success_rate(),
                );
                set_reputation(&tx, updated.id, updated.reputation_score)?;
            }
            tx.commit()?;
            Ok((updated, stats))
        })
        .await
    }

    async fn feedback_stats(&self, id: CapabilityId) -> Result<FeedbackStats> {
        self.with_conn(move |conn| load_feedback_stats(conn, id)).await
    }

    async fn create_report(&self, report: &Report) -> Result<()> {
        let report = report.clone();
        self.with_conn(move |conn| {
            conn.execute(
                &format!(
                    "INSERT INTO reports ({}) VALUES \
                     (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
                    REPORT_COLUMNS
                ),
                params![
                    report.id.to_string(),
                    report.target_id.to_string(),
                    report.target_name,
                    report.reported_by,
                    report.report_type.as_str(),
                    report.severity.as_str(),
                    report.description,
                    serde_json::to_string(&report.evidence)?,
                    report.status.as_str(),
                    report.reviewed_by,
                    report.resolution.map(|r| r.as_str()),
                    report.resolution_note,
                    fmt_ts(&report.created_at),
                    report.resolved_at.as_ref().map(fmt_ts),
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn get_report(&self, id: Uuid) -> Result<Option<Report>> {
        self.with_conn(move |conn| {
            let sql = format!("SELECT {} FROM reports WHERE id = ?1", REPORT_COLUMNS);
            Ok(query_reports(conn, &sql, params![id.to_string()])?
                .into_iter()
                .next())
        })
        .await
    }

    async fn list_pending_reports(&self) -> Result<Vec<Report>> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {} FROM reports
                 WHERE status IN ('pending', 'reviewing')
                 ORDER BY CASE severity
                     WHEN 'critical' THEN 0
                     WHEN 'high' THEN 1
                     WHEN 'medium' THEN 2
                     ELSE 3
                 END, created_at ASC, id ASC",
                REPORT_COLUMNS
            );
            query_reports(conn, &sql, [])
        })
        .await
    }

    async fn count_pending_reports(&self, target_id: CapabilityId) -> Result<u64> {
        self.with_conn(move |conn| {
            count(
                conn,
                "SELECT COUNT(*) FROM reports WHERE target_id = ?1 AND status = 'pending'",
                params![target_id.to_string()],
            )
        })
        .await
    }

    async fn count_reports(&self, status: ReportStatus) -> Result<u64> {
        self.with_conn(move |conn| {
            count(
                conn,
                "SELECT COUNT(*) FROM reports WHERE status = ?1",
                params![status.as_str()],
            )
        })
        .await
    }

    async fn mark_report_reviewing(&self, id: Uuid, reviewer: &str) -> Result<()> {
        let reviewer = reviewer.to_string();
        self.with_conn(move |conn| {
            let rows = conn.execute(
                "UPDATE reports SET status = 'reviewing', reviewed_by = ?1 WHERE id = ?2",
                params![reviewer, id.to_string()],
            )?;
            if rows == 0 {
                return Err(RegistryError::not_found("report", id));
            }
            Ok(())
        })
        .await
    }

    async fn resolve_report(
        &self,
        id: Uuid,
        resolution: Resolution,
        note: &str,
        resolver: &str,
    ) -> Result<()> {
        let (note, resolver) = (note.to_string(), resolver.to_string());
        self.with_conn(move |conn| {
            let rows = conn.execute(
                "UPDATE reports SET status = 'resolved', resolution = ?1, resolution_note = ?2,
                    reviewed_by = ?3, resolved_at = ?4
                 WHERE id = ?5",
                params![
                    resolution.as_str(),
                    note,
                    resolver,
                    fmt_ts(&Utc::now()),
                    id.to_string()
                ],
            )?;
            if rows == 0 {
                return Err(RegistryError::not_found("report", id));
            }
            Ok(())
        })
        .await
    }

    async fn record_governance_action(&self, action: &GovernanceAction) -> Result<()> {
        let action = action.clone();
        self.with_conn(move |conn| insert_action(conn, &action)).await
    }

    async fn apply_governance_action(
        &self,
        action: &GovernanceAction,
        change: StateChange,
    ) -> Result<()> {
        let action = action.clone();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            insert_action(&tx, &action)?;
            match change {
                StateChange::None => {}
                StateChange::Status(status) => set_status(&tx, action.target_id, status)?,
                StateChange::Reputation(score) => set_reputation(&tx, action.target_id, score)?,
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn list_actions(&self, target_id: CapabilityId) -> Result<Vec<GovernanceAction>> {
        self.with_conn(move |conn| {
            let sql = format!(
                "SELECT {} FROM governance_actions WHERE target_id = ?1 ORDER BY created_at ASC",
                ACTION_COLUMNS
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params![target_id.to_string()], |row| -> rusqlite::Result<ActionRow> {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                    row.get(6)?,
                    row.get(7)?,
                    row.get(8)?,
                    row.get(9)?,
                ))
            })?;
            let mut actions = Vec::new();
            for row in rows {
                actions.push(build_action(row?)?);
            }
            Ok(actions)
        })
        .await
    }

    async fn count_actions_since(&self, since: DateTime<Utc>) -> Result<u64> {
        self.with_conn(move |conn| {
            count(
                conn,
                "SELECT COUNT(*) FROM governance_actions WHERE created_at >= ?1",
                params![fmt_ts(&since)],
            )
        })
        .await
    }

    async fn get_by_fingerprint(&self, fingerprint: &str) -> Result<Option<CacheEntry>> {
        let fingerprint = fingerprint.to_string();
        self.with_conn(move |conn| {
            let row = conn
                .query_row(
                    "SELECT skills, capability_id, hit_count, created_at, last_used
                     FROM skill_request_cache WHERE fingerprint = ?1",
                    params![fingerprint],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, i64>(2)?,
                            row.get::<_, String>(3)?,
                            row.get::<_, String>(4)?,
                        ))
                    },
                )
                .optional()?;
            row.map(|(skills, capability_id, hit_count, created_at, last_used)| -> Result<CacheEntry> {
                Ok(CacheEntry {
                    fingerprint: fingerprint.clone(),
                    skills: serde_json::from_str(&skills)?,
                    capability_id: parse_id(&capability_id)?,
                    hit_count: hit_count.max(0) as u64,
                    created_at: parse_ts(&created_at)?,
                    last_used: parse_ts(&last_used)?,
                })
            })
            .transpose()
        })
        .await
    }

    async fn record_cache_hit(&self, fingerprint: &str) -> Result<()> {
        let fingerprint = fingerprint.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE skill_request_cache SET hit_count = hit_count + 1, last_used = ?1
                 WHERE fingerprint = ?2",
                params![fmt_ts(&Utc::now()), fingerprint],
            )?;
            Ok(())
        })
        .await
    }

    async fn upsert_fingerprint(
        &self,
        fingerprint: &str,
        skills: &[String],
        capability_id: CapabilityId,
    ) -> Result<()> {
        let fingerprint = fingerprint.to_string();
        let skills = serde_json::to_string(skills)?;
        self.with_conn(move |conn| {
            let now = fmt_ts(&Utc::now());
            conn.execute(
                "INSERT INTO skill_request_cache (fingerprint, skills, capability_id, hit_count, created_at, last_used)
                 VALUES (?1, ?2, ?3, 1, ?4, ?4)
                 ON CONFLICT (fingerprint) DO UPDATE SET
                     capability_id = excluded.capability_id,
                     hit_count = skill_request_cache.hit_count + 1,
                     last_used = excluded.last_used",
                params![fingerprint, skills, capability_id.to_string(), now],
            )?;
            Ok(())
        })
        .await
    }

    async fn try_claim_fingerprint(&self, fingerprint: &str, stale_after: Duration) -> Result<bool> {
        let fingerprint = fingerprint.to_string();
        let stale_after = chrono::Duration::from_std(stale_after)
            .map_err(|e| RegistryError::Validation(format!("invalid claim age: {}", e)))?;
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let now = Utc::now();
            let existing: Option<String> = tx
                .query_row(
                    "SELECT claimed_at FROM skill_request_claims WHERE fingerprint = ?1",
                    params![fingerprint],
                    |row| row.get(0),
                )
                .optional()?;
            if let Some(claimed_at) = existing {
                if now - parse_ts(&claimed_at)? < stale_after {
                    return Ok(false);
                }
            }
            tx.execute(
                "INSERT OR REPLACE INTO skill_request_claims (fingerprint, claimed_at) VALUES (?1, ?2)",
                params![fingerprint, fmt_ts(&now)],
            )?;
            tx.commit()?;
            Ok(true)
        })
        .await
    }

    async fn release_fingerprint(&self, fingerprint: &str) -> Result<()> {
        let fingerprint = fingerprint.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "DELETE FROM skill_request_claims WHERE fingerprint = ?1",
                params![fingerprint],
            )?;
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::{
        AgentProfile, AgentStatus, CommandArgument, CommandTemplate, ContentStatus, NewCapability,
    };
    use crate::governance::{GovernanceActionType, GovernanceRole, ReportType, Severity};
    use serde_json::{json, Value};

    fn temp_store() -> (tempfile::TempDir, SqliteStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::new(dir.path().join("nested").join("registry.db")).unwrap();
        (dir, store)
    }

    fn agent(name: &str) -> Capability {
        let mut cap = NewCapability::new(
            name,
            "Reviews code",
            CapabilityBody::agent(AgentProfile {
                model: "opus".into(),
                prompt: "Review carefully".into(),
                tools: vec!["Read".into(), "Grep".into()],
            }),
        )
        .with_skills(["review"])
        .with_tags(["quality"])
        .into_capability();
        cap.embedding = Some(vec![0.5, 0.5]);
        cap.metadata = json!({"source": "test"});
        cap
    }

    #[tokio::test]
    async fn test_capability_round_trip() {
        let (_dir, store) = temp_store();
        let cap = store.create(agent("reviewer")).await.unwrap();
        let loaded = store
            .get(CapabilityKind::Agent, "reviewer")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.id, cap.id);
        assert_eq!(loaded.body, cap.body);
        assert_eq!(loaded.embedding, cap.embedding);
        assert_eq!(loaded.metadata, cap.metadata);
        assert_eq!(loaded.created_at, cap.created_at);

        let command = NewCapability::new(
            "deploy",
            "Deploy the service",
            CapabilityBody::command(CommandTemplate {
                category: "devops".into(),
                prompt: "Deploy $ENV".into(),
                arguments: vec![CommandArgument {
                    name: "env".into(),
                    required: true,
                    ..CommandArgument::default()
                }],
            }),
        )
        .into_capability();
        let command = store.create(command).await.unwrap();
        let loaded = store.get_by_id(command.id).await.unwrap().unwrap();
        assert_eq!(loaded.body, command.body);
    }

    #[tokio::test]
    async fn test_duplicate_name_is_conflict() {
        let (_dir, store) = temp_store();
        store.create(agent("reviewer")).await.unwrap();
        let err = store.create(agent("reviewer")).await.unwrap_err();
        assert!(matches!(err, RegistryError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_status_domain_is_enforced() {
        let (_dir, store) = temp_store();
        let cap = store.create(agent("reviewer")).await.unwrap();
        let err = store
            .update_status(cap.id, CapabilityStatus::Content(ContentStatus::Deprecated))
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::Validation(_)));

        store
            .update_status(cap.id, CapabilityStatus::Agent(AgentStatus::Quarantined))
            .await
            .unwrap();
        assert!(store
            .search_keyword(CapabilityKind::Agent, "review")
            .await
            .unwrap()
            .is_empty());
        assert_eq!(
            store
                .count_by_status(
                    CapabilityKind::Agent,
                    CapabilityStatus::Agent(AgentStatus::Quarantined)
                )
                .await
                .unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn test_concurrent_usage_increments() {
        let (_dir, store) = temp_store();
        let cap = store.create(agent("reviewer")).await.unwrap();
        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move { store.increment_usage(cap.id).await }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }
        assert_eq!(store.get_by_id(cap.id).await.unwrap().unwrap().usage_count, 8);
    }

    #[tokio::test]
    async fn test_feedback_and_stats() {
        let (_dir, store) = temp_store();
        let cap = store.create(agent("reviewer")).await.unwrap();
        for (rating, ok, task) in [(5u8, true, "review"), (2, false, "review"), (5, true, "audit")] {
            store
                .record_feedback(&Feedback {
                    id: Uuid::new_v4(),
                    capability_id: cap.id,
                    session_id: Some("s1".into()),
                    rating,
                    task_success: ok,
                    task_type: Some(task.into()),
                    feedback_text: None,
                    created_at: Utc::now(),
                })
                .await
                .unwrap();
        }
        let cap = store.get_by_id(cap.id).await.unwrap().unwrap();
        assert_eq!(cap.feedback_count, 3);
        assert!((cap.avg_rating - 4.0).abs() < 1e-9);

        let stats = store.feedback_stats(cap.id).await.unwrap();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.rating_distribution.get(&5), Some(&2));
        assert_eq!(stats.task_type_breakdown.get("review"), Some(&2));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_feedback_scores_match_aggregates() {
        let (_dir, store) = temp_store();
        let store = std::sync::Arc::new(store);
        let cap = store.create(agent("reviewer")).await.unwrap();

        let mut handles = Vec::new();
        for i in 0..12u8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .record_feedback(&Feedback {
                        id: Uuid::new_v4(),
                        capability_id: cap.id,
                        session_id: None,
                        rating: 1 + i % 2,
                        task_success: i % 4 == 0,
                        task_type: None,
                        feedback_text: None,
                        created_at: Utc::now(),
                    })
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let stored = store.get_by_id(cap.id).await.unwrap().unwrap();
        let stats = store.feedback_stats(cap.id).await.unwrap();
        assert_eq!(stored.feedback_count, 12);
        assert_eq!(stats.total, 12);
        let expected = score(
            stored.feedback_count,
            stored.avg_rating,
            stored.usage_count,
            stats.success_rate(),
        );
        assert!((stored.reputation_score - expected).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_reports_and_actions() {
        let (_dir, store) = temp_store();
        let cap = store.create(agent("reviewer")).await.unwrap();
        let mut ids = Vec::new();
        for (severity, age) in [(Severity::Low, 30), (Severity::Critical, 10), (Severity::High, 20)] {
            let report = Report {
                id: Uuid::new_v4(),
                target_id: cap.id,
                target_name: cap.name.clone(),
                reported_by: "user".into(),
                report_type: ReportType::Ineffective,
                severity,
                description: "bad".into(),
                evidence: Value::Null,
                status: ReportStatus::Pending,
                reviewed_by: None,
                resolution: None,
                resolution_note: None,
                created_at: Utc::now() - chrono::Duration::seconds(age),
                resolved_at: None,
            };
            store.create_report(&report).await.unwrap();
            ids.push(report.id);
        }
        let ordered: Vec<Uuid> = store
            .list_pending_reports()
            .await
            .unwrap()
            .iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(ordered, vec![ids[1], ids[2], ids[0]]);
        assert_eq!(store.count_pending_reports(cap.id).await.unwrap(), 3);

        store.mark_report_reviewing(ids[0], "judge-1").await.unwrap();
        store
            .resolve_report(ids[1], Resolution::Dismissed, "not reproducible", "judge-1")
            .await
            .unwrap();
        let resolved = store.get_report(ids[1]).await.unwrap().unwrap();
        assert_eq!(resolved.status, ReportStatus::Resolved);
        assert_eq!(resolved.resolution, Some(Resolution::Dismissed));
        assert!(resolved.resolved_at.is_some());
        assert_eq!(store.count_pending_reports(cap.id).await.unwrap(), 1);
        assert_eq!(store.count_reports(ReportStatus::Reviewing).await.unwrap(), 1);

        let action = GovernanceAction {
            id: Uuid::new_v4(),
            target_id: cap.id,
            target_name: cap.name.clone(),
            report_id: Some(ids[0]),
            action_type: GovernanceActionType::Quarantine,
            role: GovernanceRole::Judge,
            reason: "confirmed".into(),
            previous_status: Some(cap.status()),
            previous_reputation: Some(cap.reputation_score),
            created_at: Utc::now(),
        };
        store
            .apply_governance_action(
                &action,
                StateChange::Status(CapabilityStatus::Agent(AgentStatus::Quarantined)),
            )
            .await
            .unwrap();
        let trail = store.list_actions(cap.id).await.unwrap();
        assert_eq!(trail, vec![action]);
        assert_eq!(
            store
                .count_actions_since(Utc::now() - chrono::Duration::hours(1))
                .await
                .unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn test_failed_transition_rolls_back_audit_record() {
        let (_dir, store) = temp_store();
        let cap = store.create(agent("reviewer")).await.unwrap();
        let action = GovernanceAction {
            id: Uuid::new_v4(),
            target_id: cap.id,
            target_name: cap.name.clone(),
            report_id: None,
            action_type: GovernanceActionType::Quarantine,
            role: GovernanceRole::Police,
            reason: "wrong domain".into(),
            previous_status: Some(cap.status()),
            previous_reputation: None,
            created_at: Utc::now(),
        };
        let err = store
            .apply_governance_action(
                &action,
                StateChange::Status(CapabilityStatus::Content(ContentStatus::Disabled)),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::Validation(_)));
        assert!(store.list_actions(cap.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cache_upsert_and_claims() {
        let (_dir, store) = temp_store();
        let cap = store.create(agent("reviewer")).await.unwrap();
        let skills = vec!["docker".to_string(), "kubectl".to_string()];

        store.upsert_fingerprint("fp", &skills, cap.id).await.unwrap();
        store.record_cache_hit("fp").await.unwrap();
        store.upsert_fingerprint("fp", &skills, cap.id).await.unwrap();
        let entry = store.get_by_fingerprint("fp").await.unwrap().unwrap();
        assert_eq!(entry.hit_count, 3);
        assert_eq!(entry.skills, skills);
        assert!(store.get_by_fingerprint("other").await.unwrap().is_none());

        let stale = Duration::from_secs(60);
        assert!(store.try_claim_fingerprint("fp", stale).await.unwrap());
        assert!(!store.try_claim_fingerprint("fp", stale).await.unwrap());
        // zero max age makes any claim stale
        assert!(store.try_claim_fingerprint("fp", Duration::ZERO).await.unwrap());
        store.release_fingerprint("fp").await.unwrap();
        assert!(store.try_claim_fingerprint("fp", stale).await.unwrap());
    }
}
