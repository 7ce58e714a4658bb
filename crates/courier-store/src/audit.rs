//! Audit history — day-partitioned, capacity-bounded, append-only.
//!
//! Each calendar day gets its own file; when a file reaches capacity a new
//! segment for the same day is opened. History is never trimmed by an
//! append. Appends rewrite the tail file through the same atomic-replace
//! path as every other document, so a crashed append never leaves a
//! half-written day file behind.

use crate::store::{read_json, write_json_atomic};
use chrono::{DateTime, Duration, NaiveDate, Utc};
use courier_core::error::CourierError;
use courier_core::model::Job;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Capacity of one day-segment file.
pub const MAX_ENTRIES_PER_FILE: usize = 1000;

/// How far back unscoped queries and summaries look.
const QUERY_HORIZON_DAYS: i64 = 30;

/// Status of an audited operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditStatus {
    Success,
    Failed,
}

impl AuditStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }
}

/// One audit event. Ids restart at 1 in every segment file; global order is
/// (date, segment, id).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: u64,
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub actor: String,
    pub resource_type: String,
    pub resource_id: String,
    pub action: String,
    #[serde(default)]
    pub details: Value,
    pub status: AuditStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    // Flattened fields for job_execution events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items_returned: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items_filtered: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter_reasons: Option<Value>,
}

impl AuditEvent {
    fn new(event_type: String, resource_type: &str, resource_id: &str, action: &str) -> Self {
        Self {
            id: 0,
            timestamp: Utc::now(),
            event_type,
            actor: "agent".to_string(),
            resource_type: resource_type.to_string(),
            resource_id: resource_id.to_string(),
            action: action.to_string(),
            details: Value::Null,
            status: AuditStatus::Success,
            error: None,
            job_id: None,
            avatar_id: None,
            command: None,
            params: None,
            items_returned: None,
            items_filtered: None,
            execution_ms: None,
            filter_reasons: None,
        }
    }
}

/// On-disk layout of one day-segment file.
#[derive(Debug, Serialize, Deserialize)]
struct DayFile {
    date: NaiveDate,
    segment: u32,
    max_entries: usize,
    next_id: u64,
    entries: Vec<AuditEvent>,
}

impl DayFile {
    fn fresh(date: NaiveDate, segment: u32, max_entries: usize) -> Self {
        Self {
            date,
            segment,
            max_entries,
            next_id: 1,
            entries: Vec::new(),
        }
    }
}

/// History query filters. Precedence when several are set: job id, then
/// date (optionally narrowed by avatar), then avatar, then recent events.
/// Event-type prefix, resource, and free-text filters apply in every branch.
#[derive(Debug, Clone)]
pub struct HistoryQuery {
    pub avatar_id: Option<String>,
    pub job_id: Option<String>,
    pub date: Option<NaiveDate>,
    pub event_type_prefix: Option<String>,
    pub resource_type: Option<String>,
    pub resource_id: Option<String>,
    pub text: Option<String>,
    pub limit: usize,
}

impl Default for HistoryQuery {
    fn default() -> Self {
        Self {
            avatar_id: None,
            job_id: None,
            date: None,
            event_type_prefix: None,
            resource_type: None,
            resource_id: None,
            text: None,
            limit: 50,
        }
    }
}

/// Aggregate statistics over a day range.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditSummary {
    pub total_events: usize,
    pub successful: usize,
    pub failed: usize,
    pub total_items_returned: u64,
    pub total_items_filtered: u64,
    pub avg_execution_ms: f64,
    pub event_types: BTreeMap<String, EventTypeStats>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventTypeStats {
    pub count: usize,
    pub successful: usize,
    pub failed: usize,
}

/// Writer position: which segment of which day currently takes appends.
struct WriteCursor {
    date: NaiveDate,
    segment: u32,
}

/// Day-partitioned audit log rooted at a directory.
#[derive(Clone)]
pub struct AuditLog {
    dir: PathBuf,
    max_entries: usize,
    cursor: Arc<Mutex<Option<WriteCursor>>>,
}

impl AuditLog {
    /// Open the log, creating its directory.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, CourierError> {
        Self::with_capacity(dir, MAX_ENTRIES_PER_FILE).await
    }

    /// Open with a custom per-file capacity.
    pub async fn with_capacity(
        dir: impl Into<PathBuf>,
        max_entries: usize,
    ) -> Result<Self, CourierError> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await.map_err(|e| {
            CourierError::Storage(format!("failed to create audit dir: {e}"))
        })?;
        info!("Audit log rooted at {}", dir.display());
        Ok(Self {
            dir,
            max_entries,
            cursor: Arc::new(Mutex::new(None)),
        })
    }

    // ---------- append ----------

    /// Append one event. Assigns the per-file sequence id; rolls over to a
    /// new segment when the tail file is full.
    pub async fn record(&self, mut event: AuditEvent) -> Result<(), CourierError> {
        let mut cursor = self.cursor.lock().await;
        let today = event.timestamp.date_naive();

        let segment = match cursor.as_ref() {
            Some(c) if c.date == today => c.segment,
            _ => self.tail_segment(today).await?,
        };

        let path = self.segment_path(today, segment);
        let doc: DayFile = read_json(&path)
            .await?
            .unwrap_or_else(|| DayFile::fresh(today, segment, self.max_entries));

        let (path, mut doc) = if doc.entries.len() >= doc.max_entries {
            let next = segment + 1;
            (
                self.segment_path(today, next),
                DayFile::fresh(today, next, self.max_entries),
            )
        } else {
            (path, doc)
        };

        event.id = doc.next_id;
        doc.next_id += 1;
        debug!(
            "audit: {} {} [{}]",
            event.event_type,
            event.resource_id,
            event.status.as_str()
        );
        doc.entries.push(event);
        let segment = doc.segment;
        write_json_atomic(&path, &doc).await?;

        *cursor = Some(WriteCursor {
            date: today,
            segment,
        });
        Ok(())
    }

    /// Avatar lifecycle event (`avatar_<action>`).
    pub async fn avatar_event(
        &self,
        avatar_id: &str,
        action: &str,
        details: Value,
    ) -> Result<(), CourierError> {
        let mut event = AuditEvent::new(format!("avatar_{action}"), "avatar", avatar_id, action);
        event.details = details;
        self.record(event).await
    }

    /// Source lifecycle event (`source_<action>`); the owning avatar id is
    /// folded into the details.
    pub async fn source_event(
        &self,
        avatar_id: &str,
        source_id: &str,
        action: &str,
        details: Value,
    ) -> Result<(), CourierError> {
        let mut event = AuditEvent::new(format!("source_{action}"), "source", source_id, action);
        let mut details = details;
        if let Some(map) = details.as_object_mut() {
            map.insert("avatar_id".to_string(), Value::String(avatar_id.to_string()));
        }
        event.details = details;
        self.record(event).await
    }

    /// Authentication flow event (`auth_<action>`).
    pub async fn auth_event(
        &self,
        avatar_id: &str,
        action: &str,
        details: Value,
        status: AuditStatus,
        error: Option<String>,
    ) -> Result<(), CourierError> {
        let mut event = AuditEvent::new(format!("auth_{action}"), "avatar", avatar_id, action);
        event.details = details;
        event.status = status;
        event.error = error;
        self.record(event).await
    }

    /// Generic system event (`<resource_type>_<action>`).
    pub async fn system_event(
        &self,
        resource_type: &str,
        resource_id: &str,
        action: &str,
        details: Value,
        status: AuditStatus,
        error: Option<String>,
    ) -> Result<(), CourierError> {
        let mut event = AuditEvent::new(
            format!("{resource_type}_{action}"),
            resource_type,
            resource_id,
            action,
        );
        event.details = details;
        event.status = status;
        event.error = error;
        self.record(event).await
    }

    /// The one `job_execution` event a job produces.
    #[allow(clippy::too_many_arguments)]
    pub async fn job_execution(
        &self,
        job: &Job,
        items_returned: usize,
        items_filtered: usize,
        execution_ms: u64,
        status: AuditStatus,
        error: Option<String>,
        filter_reasons: Option<Value>,
    ) -> Result<(), CourierError> {
        let mut event = AuditEvent::new(
            "job_execution".to_string(),
            "job",
            &job.job_id,
            "execute",
        );
        event.details = serde_json::json!({
            "command": job.command,
            "items_returned": items_returned,
            "items_filtered": items_filtered,
            "execution_ms": execution_ms,
        });
        event.status = status;
        event.error = error;
        event.job_id = Some(job.job_id.clone());
        event.avatar_id = Some(job.avatar_id.clone());
        event.command = Some(job.command.clone());
        event.params = Some(job.params.clone());
        event.items_returned = Some(items_returned);
        event.items_filtered = Some(items_filtered);
        event.execution_ms = Some(execution_ms);
        event.filter_reasons = filter_reasons;
        self.record(event).await
    }

    // ---------- queries ----------

    /// Run a filtered query, newest-first, bounded by the query limit.
    pub async fn query(&self, q: &HistoryQuery) -> Result<Vec<AuditEvent>, CourierError> {
        if let Some(job_id) = &q.job_id {
            return self.find_job(job_id).await;
        }

        let dates: Vec<NaiveDate> = match q.date {
            Some(date) => vec![date],
            None => self.dates_within(QUERY_HORIZON_DAYS).await?,
        };

        let mut out = Vec::new();
        // Newest first: walk days backwards, entries within a day backwards.
        for date in dates.iter().rev() {
            let entries = self.read_day(*date).await?;
            for event in entries.iter().rev() {
                if event_matches(event, q) {
                    out.push(event.clone());
                    if out.len() >= q.limit {
                        return Ok(out);
                    }
                }
            }
        }
        Ok(out)
    }

    /// Chronological trail for one resource, most recent `limit` events.
    pub async fn trail(
        &self,
        resource_type: &str,
        resource_id: &str,
        limit: usize,
    ) -> Result<Vec<AuditEvent>, CourierError> {
        let mut out = Vec::new();
        for date in self.list_dates().await? {
            let entries = self.read_day(date).await?;
            out.extend(
                entries
                    .into_iter()
                    .filter(|e| e.resource_type == resource_type && e.resource_id == resource_id),
            );
        }
        if out.len() > limit {
            out.drain(..out.len() - limit);
        }
        Ok(out)
    }

    /// Aggregate statistics over the last `days` days.
    pub async fn summary(&self, days: i64) -> Result<AuditSummary, CourierError> {
        let mut summary = AuditSummary {
            total_events: 0,
            successful: 0,
            failed: 0,
            total_items_returned: 0,
            total_items_filtered: 0,
            avg_execution_ms: 0.0,
            event_types: BTreeMap::new(),
        };
        let mut latency_sum: u64 = 0;
        let mut latency_count: u64 = 0;

        for date in self.dates_within(days).await? {
            for event in self.read_day(date).await? {
                summary.total_events += 1;
                let stats = summary
                    .event_types
                    .entry(event.event_type.clone())
                    .or_default();
                stats.count += 1;
                match event.status {
                    AuditStatus::Success => {
                        summary.successful += 1;
                        stats.successful += 1;
                    }
                    AuditStatus::Failed => {
                        summary.failed += 1;
                        stats.failed += 1;
                    }
                }
                summary.total_items_returned += event.items_returned.unwrap_or(0) as u64;
                summary.total_items_filtered += event.items_filtered.unwrap_or(0) as u64;
                if let Some(ms) = event.execution_ms {
                    latency_sum += ms;
                    latency_count += 1;
                }
            }
        }

        if latency_count > 0 {
            summary.avg_execution_ms = latency_sum as f64 / latency_count as f64;
        }
        Ok(summary)
    }

    /// Days that have at least one log file, ascending.
    pub async fn list_dates(&self) -> Result<Vec<NaiveDate>, CourierError> {
        let mut dates: Vec<NaiveDate> = self
            .scan_files()
            .await?
            .into_iter()
            .map(|(date, _, _)| date)
            .collect();
        dates.sort();
        dates.dedup();
        Ok(dates)
    }

    /// Delete files older than the horizon. Returns how many were removed.
    pub async fn cleanup_old(&self, keep_days: i64) -> Result<usize, CourierError> {
        let horizon = Utc::now().date_naive() - Duration::days(keep_days);
        let mut removed = 0;
        for (date, _, path) in self.scan_files().await? {
            if date < horizon {
                tokio::fs::remove_file(&path).await.map_err(|e| {
                    CourierError::Storage(format!("failed to remove {}: {e}", path.display()))
                })?;
                removed += 1;
            }
        }
        if removed > 0 {
            info!("audit cleanup removed {removed} file(s) older than {horizon}");
        }
        Ok(removed)
    }

    // ---------- internals ----------

    fn segment_path(&self, date: NaiveDate, segment: u32) -> PathBuf {
        let name = if segment == 0 {
            format!("history_{date}.json")
        } else {
            format!("history_{date}.{segment}.json")
        };
        self.dir.join(name)
    }

    /// Highest existing segment for a day (0 when the day has no files).
    async fn tail_segment(&self, date: NaiveDate) -> Result<u32, CourierError> {
        Ok(self
            .scan_files()
            .await?
            .into_iter()
            .filter(|(d, _, _)| *d == date)
            .map(|(_, segment, _)| segment)
            .max()
            .unwrap_or(0))
    }

    /// All entries for one day, in (segment, id) order.
    async fn read_day(&self, date: NaiveDate) -> Result<Vec<AuditEvent>, CourierError> {
        let mut segments: Vec<(u32, PathBuf)> = self
            .scan_files()
            .await?
            .into_iter()
            .filter(|(d, _, _)| *d == date)
            .map(|(_, segment, path)| (segment, path))
            .collect();
        segments.sort_by_key(|(segment, _)| *segment);

        let mut entries = Vec::new();
        for (_, path) in segments {
            if let Some(doc) = read_json::<DayFile>(&path).await? {
                entries.extend(doc.entries);
            }
        }
        Ok(entries)
    }

    /// Days with files inside the horizon, ascending.
    async fn dates_within(&self, days: i64) -> Result<Vec<NaiveDate>, CourierError> {
        let horizon = Utc::now().date_naive() - Duration::days(days - 1);
        Ok(self
            .list_dates()
            .await?
            .into_iter()
            .filter(|d| *d >= horizon)
            .collect())
    }

    /// Newest-first lookup of the single entry for a job id.
    async fn find_job(&self, job_id: &str) -> Result<Vec<AuditEvent>, CourierError> {
        for date in self.dates_within(QUERY_HORIZON_DAYS).await?.iter().rev() {
            let entries = self.read_day(*date).await?;
            if let Some(event) = entries
                .iter()
                .rev()
                .find(|e| e.job_id.as_deref() == Some(job_id))
            {
                return Ok(vec![event.clone()]);
            }
        }
        Ok(Vec::new())
    }

    /// `(date, segment, path)` for every parseable log file.
    async fn scan_files(&self) -> Result<Vec<(NaiveDate, u32, PathBuf)>, CourierError> {
        let mut out = Vec::new();
        let mut dir = match tokio::fs::read_dir(&self.dir).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => {
                return Err(CourierError::Storage(format!(
                    "failed to list audit dir: {e}"
                )))
            }
        };
        while let Some(entry) = dir
            .next_entry()
            .await
            .map_err(|e| CourierError::Storage(format!("failed to list audit dir: {e}")))?
        {
            let name = entry.file_name();
            if let Some((date, segment)) = parse_file_name(&name.to_string_lossy()) {
                out.push((date, segment, entry.path()));
            }
        }
        Ok(out)
    }
}

/// Parse `history_<date>.json` / `history_<date>.<segment>.json`.
fn parse_file_name(name: &str) -> Option<(NaiveDate, u32)> {
    let rest = name.strip_prefix("history_")?.strip_suffix(".json")?;
    match rest.split_once('.') {
        Some((date, segment)) => Some((
            NaiveDate::parse_from_str(date, "%Y-%m-%d").ok()?,
            segment.parse().ok()?,
        )),
        None => Some((NaiveDate::parse_from_str(rest, "%Y-%m-%d").ok()?, 0)),
    }
}

fn event_matches(event: &AuditEvent, q: &HistoryQuery) -> bool {
    if let Some(avatar_id) = &q.avatar_id {
        if !event_involves_avatar(event, avatar_id) {
            return false;
        }
    }
    if let Some(prefix) = &q.event_type_prefix {
        if !event.event_type.starts_with(prefix.as_str()) {
            return false;
        }
    }
    if let Some(resource_type) = &q.resource_type {
        if event.resource_type != *resource_type {
            return false;
        }
    }
    if let Some(resource_id) = &q.resource_id {
        if event.resource_id != *resource_id {
            return false;
        }
    }
    if let Some(text) = &q.text {
        let needle = text.to_lowercase();
        let haystack = format!(
            "{} {} {} {} {}",
            event.event_type,
            event.action,
            event.resource_id,
            event.details,
            event.error.as_deref().unwrap_or("")
        )
        .to_lowercase();
        if !haystack.contains(&needle) {
            return false;
        }
    }
    true
}

/// An event involves an avatar when it carries the id in its flattened job
/// fields, targets the avatar directly, or references it in the details.
fn event_involves_avatar(event: &AuditEvent, avatar_id: &str) -> bool {
    if event.avatar_id.as_deref() == Some(avatar_id) {
        return true;
    }
    if event.resource_type == "avatar" && event.resource_id == avatar_id {
        return true;
    }
    event
        .details
        .get("avatar_id")
        .and_then(Value::as_str)
        .is_some_and(|id| id == avatar_id)
}
