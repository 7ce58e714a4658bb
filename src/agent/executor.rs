//! Job execution: dispatch one backend job against an avatar's platform
//! session, filter the fetched items, and audit the outcome.
//!
//! Every job produces exactly one `job_execution` audit event and one
//! execution report for submission, whether it succeeded or not. Retry
//! policy lives in the control loop, not here.

use courier_core::error::CourierError;
use courier_core::filter::{self, FilterOutcome};
use courier_core::model::{ExecutionReport, Job, ReportError};
use courier_core::traits::PlatformHandler;
use courier_store::audit::AuditStatus;
use courier_store::Registry;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Item cap applied when a job does not carry its own `limit`.
const DEFAULT_FETCH_LIMIT: usize = 100;
const DEFAULT_DIALOG_LIMIT: usize = 50;

#[derive(Clone)]
pub struct JobExecutor {
    registry: Registry,
    platform: Arc<dyn PlatformHandler>,
}

impl JobExecutor {
    pub fn new(registry: Registry, platform: Arc<dyn PlatformHandler>) -> Self {
        Self { registry, platform }
    }

    /// Execute one job end to end. Never returns an error: failures become
    /// a `success: false` report carrying the error kind and message.
    pub async fn execute(&self, job: &Job) -> ExecutionReport {
        info!(
            "executing job {} ({}) for avatar {}",
            job.job_id, job.command, job.avatar_id
        );
        let started = Instant::now();
        let outcome = self.dispatch(job).await;
        let execution_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(filtered) => {
                let reasons = filter_reasons(&filtered);
                if let Err(e) = self
                    .registry
                    .audit()
                    .job_execution(
                        job,
                        filtered.kept.len(),
                        filtered.dropped,
                        execution_ms,
                        AuditStatus::Success,
                        None,
                        reasons,
                    )
                    .await
                {
                    warn!("audit write for job {} failed: {e}", job.job_id);
                }
                info!(
                    "job {} completed: {} item(s) kept, {} filtered, {execution_ms}ms",
                    job.job_id,
                    filtered.kept.len(),
                    filtered.dropped
                );
                ExecutionReport {
                    job_id: job.job_id.clone(),
                    avatar_id: job.avatar_id.clone(),
                    success: true,
                    execution_ms,
                    items_count: Some(filtered.kept.len()),
                    filtered_count: Some(filtered.dropped),
                    items: Some(filtered.kept),
                    error: None,
                }
            }
            Err(e) => {
                warn!("job {} failed: {e}", job.job_id);
                if let Err(audit_err) = self
                    .registry
                    .audit()
                    .job_execution(
                        job,
                        0,
                        0,
                        execution_ms,
                        AuditStatus::Failed,
                        Some(e.to_string()),
                        None,
                    )
                    .await
                {
                    warn!("audit write for job {} failed: {audit_err}", job.job_id);
                }
                ExecutionReport {
                    job_id: job.job_id.clone(),
                    avatar_id: job.avatar_id.clone(),
                    success: false,
                    execution_ms,
                    items: None,
                    items_count: None,
                    filtered_count: None,
                    error: Some(ReportError {
                        kind: e.kind().to_string(),
                        message: e.to_string(),
                    }),
                }
            }
        }
    }

    /// Resolve the avatar, dispatch the command, and filter the result.
    async fn dispatch(&self, job: &Job) -> Result<FilterOutcome, CourierError> {
        let avatar = self
            .registry
            .avatar(&job.avatar_id)
            .await?
            .ok_or_else(|| CourierError::Validation(format!("unknown avatar {}", job.avatar_id)))?;
        if !avatar.session_live() {
            return Err(CourierError::SessionUnavailable(format!(
                "avatar {} has no live session (status {})",
                job.avatar_id,
                avatar.status.as_str()
            )));
        }
        let session = avatar.session.clone().ok_or_else(|| {
            CourierError::SessionUnavailable(format!("avatar {} has no session", job.avatar_id))
        })?;

        let (platform, operation) = job.command.split_once('.').ok_or_else(|| {
            CourierError::Validation(format!(
                "malformed command {:?}, expected \"<platform>.<operation>\"",
                job.command
            ))
        })?;
        if platform != self.platform.name() {
            return Err(CourierError::Validation(format!(
                "unsupported platform: {platform}"
            )));
        }

        match operation {
            "get_messages" => {
                let source_id = job
                    .params
                    .get("source_id")
                    .and_then(Value::as_str)
                    .ok_or_else(|| {
                        CourierError::Validation("get_messages requires params.source_id".into())
                    })?;
                let limit = param_limit(&job.params, DEFAULT_FETCH_LIMIT);
                let since_id = avatar
                    .sources
                    .items
                    .iter()
                    .find(|s| s.id == source_id)
                    .and_then(|s| s.last_message_id);

                let items = match self
                    .platform
                    .fetch_messages(&session, source_id, since_id, limit)
                    .await
                {
                    Ok(items) => items,
                    Err(e) => {
                        if matches!(e, CourierError::SessionUnavailable(_)) {
                            self.record_session_rejection(&job.avatar_id).await;
                        }
                        return Err(e);
                    }
                };
                self.registry.mark_avatar_used(&job.avatar_id).await?;

                // Cursor tracks fetch progress over everything the platform
                // returned, including items the filter will drop.
                let newest_id = items
                    .iter()
                    .filter_map(|i| i.get("id").and_then(Value::as_i64))
                    .max();
                self.registry
                    .update_source_cursor(&job.avatar_id, source_id, newest_id)
                    .await?;

                let scope = self.registry.scope_for(&job.avatar_id).await?;
                let outcome = filter::apply(&scope, items);
                debug!(
                    "fetched {} message(s) from {source_id}, {} dropped by blacklist",
                    outcome.kept.len() + outcome.dropped,
                    outcome.dropped
                );
                Ok(outcome)
            }
            "list_dialogs" => {
                let limit = param_limit(&job.params, DEFAULT_DIALOG_LIMIT);
                let dialogs = match self.platform.list_dialogs(&session, limit).await {
                    Ok(dialogs) => dialogs,
                    Err(e) => {
                        if matches!(e, CourierError::SessionUnavailable(_)) {
                            self.record_session_rejection(&job.avatar_id).await;
                        }
                        return Err(e);
                    }
                };
                self.registry.mark_avatar_used(&job.avatar_id).await?;
                self.registry
                    .set_dialog_cache(&job.avatar_id, dialogs.clone())
                    .await?;

                // Dialog listings are metadata, not message content; they
                // pass through unfiltered.
                let items = dialogs
                    .into_iter()
                    .map(serde_json::to_value)
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(FilterOutcome {
                    kept: items,
                    dropped: 0,
                    reasons: Vec::new(),
                })
            }
            other => Err(CourierError::Validation(format!(
                "unknown operation: {platform}.{other}"
            ))),
        }
    }

    /// The platform refused the avatar's session mid-job: demote the avatar
    /// so the next sync reports it and a re-login can be prompted.
    async fn record_session_rejection(&self, avatar_id: &str) {
        match self.registry.escalate_auth_failure(avatar_id).await {
            Ok(Some(status)) => warn!(
                "avatar {avatar_id} session rejected by platform, status now {}",
                status.as_str()
            ),
            Ok(None) => {}
            Err(e) => warn!("status escalation for avatar {avatar_id} failed: {e}"),
        }
    }
}

fn param_limit(params: &Value, default: usize) -> usize {
    params
        .get("limit")
        .and_then(Value::as_u64)
        .map(|l| l as usize)
        .unwrap_or(default)
}

fn filter_reasons(outcome: &FilterOutcome) -> Option<Value> {
    if outcome.reasons.is_empty() {
        return None;
    }
    Some(Value::Array(
        outcome
            .reasons
            .iter()
            .map(|r| {
                json!({
                    "index": r.index,
                    "reason": r.reason,
                    "item_id": r.item_id,
                })
            })
            .collect(),
    ))
}

#[cfg(test)]
mod tests {
    use super::super::testutil::{connected_avatar, make_registry, FakePlatform};
    use super::*;
    use courier_core::model::{AvatarStatus, BlacklistDoc, RuleSet};
    use courier_store::audit::HistoryQuery;

    fn job(command: &str, params: Value) -> Job {
        Job {
            job_id: "job-1".to_string(),
            avatar_id: "av1".to_string(),
            command: command.to_string(),
            params,
        }
    }

    #[tokio::test]
    async fn test_get_messages_filters_and_advances_cursor() {
        let dir = tempfile::tempdir().unwrap();
        let registry = make_registry(dir.path()).await;
        registry
            .upsert_avatar(connected_avatar("av1"))
            .await
            .unwrap();
        registry
            .replace_blacklist(BlacklistDoc {
                global: RuleSet {
                    keywords: vec!["crypto".to_string()],
                    ..Default::default()
                },
                ..Default::default()
            })
            .await
            .unwrap();

        let platform = FakePlatform::new();
        platform
            .script_messages(vec![
                json!({"id": 10, "message": "plain news"}),
                json!({"id": 11, "message": "hot CRYPTO tips"}),
                json!({"id": 12, "message": "weather"}),
            ])
            .await;
        let executor = JobExecutor::new(registry.clone(), platform.clone());

        let report = executor
            .execute(&job("telegram.get_messages", json!({"source_id": "src-1"})))
            .await;

        assert!(report.success, "error: {:?}", report.error);
        assert_eq!(report.items_count, Some(2));
        assert_eq!(report.filtered_count, Some(1));
        let items = report.items.unwrap();
        assert_eq!(items[0]["id"], 10);
        assert_eq!(items[1]["id"], 12, "kept items stay in original order");

        let avatar = registry.avatar("av1").await.unwrap().unwrap();
        let source = &avatar.sources.items[0];
        assert_eq!(
            source.last_message_id,
            Some(12),
            "cursor advances over everything fetched, filtered or not"
        );
        assert!(source.last_checked_at.is_some());

        let q = HistoryQuery {
            job_id: Some("job-1".to_string()),
            ..Default::default()
        };
        let events = registry.audit().query(&q).await.unwrap();
        assert_eq!(events.len(), 1, "exactly one job_execution event");
        assert_eq!(events[0].items_returned, Some(2));
        assert_eq!(events[0].items_filtered, Some(1));
        let reasons = events[0].filter_reasons.as_ref().unwrap();
        assert_eq!(reasons[0]["reason"], "keyword:crypto");
    }

    #[tokio::test]
    async fn test_get_messages_passes_stored_cursor_to_the_platform() {
        let dir = tempfile::tempdir().unwrap();
        let registry = make_registry(dir.path()).await;
        let mut avatar = connected_avatar("av1");
        avatar.sources.items[0].last_message_id = Some(42);
        registry.upsert_avatar(avatar).await.unwrap();

        let platform = FakePlatform::new();
        platform.script_messages(Vec::new()).await;
        let executor = JobExecutor::new(registry.clone(), platform.clone());

        let report = executor
            .execute(&job("telegram.get_messages", json!({"source_id": "src-1"})))
            .await;
        assert!(report.success);
        assert_eq!(
            platform.last_since_id().await,
            Some(42),
            "the stored cursor must bound the fetch"
        );

        let avatar = registry.avatar("av1").await.unwrap().unwrap();
        assert_eq!(
            avatar.sources.items[0].last_message_id,
            Some(42),
            "an empty fetch must not move the message cursor"
        );
    }

    #[tokio::test]
    async fn test_list_dialogs_is_unfiltered_and_caches() {
        let dir = tempfile::tempdir().unwrap();
        let registry = make_registry(dir.path()).await;
        registry
            .upsert_avatar(connected_avatar("av1"))
            .await
            .unwrap();
        registry
            .replace_blacklist(BlacklistDoc {
                global: RuleSet {
                    channels: vec!["-1001".to_string()],
                    ..Default::default()
                },
                ..Default::default()
            })
            .await
            .unwrap();

        let platform = FakePlatform::new();
        let executor = JobExecutor::new(registry.clone(), platform.clone());

        let report = executor
            .execute(&job("telegram.list_dialogs", json!({})))
            .await;
        assert!(report.success);
        assert_eq!(report.filtered_count, Some(0), "dialog listings bypass the filter");
        assert_eq!(report.items_count, Some(2));

        let cached = registry.dialog_cache("av1").await.unwrap().unwrap();
        assert_eq!(cached.len(), 2);
    }

    #[tokio::test]
    async fn test_unknown_avatar_is_a_validation_failure() {
        let dir = tempfile::tempdir().unwrap();
        let registry = make_registry(dir.path()).await;
        let executor = JobExecutor::new(registry, FakePlatform::new());

        let report = executor
            .execute(&job("telegram.get_messages", json!({"source_id": "x"})))
            .await;
        assert!(!report.success);
        assert_eq!(report.error.as_ref().unwrap().kind, "validation_error");
    }

    #[tokio::test]
    async fn test_disconnected_avatar_is_session_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let registry = make_registry(dir.path()).await;
        let mut avatar = connected_avatar("av1");
        avatar.session = None;
        avatar.status = AvatarStatus::Disconnected;
        registry.upsert_avatar(avatar).await.unwrap();
        let executor = JobExecutor::new(registry.clone(), FakePlatform::new());

        let report = executor
            .execute(&job("telegram.get_messages", json!({"source_id": "x"})))
            .await;
        assert!(!report.success);
        assert_eq!(report.error.as_ref().unwrap().kind, "session_unavailable");

        let q = HistoryQuery {
            job_id: Some("job-1".to_string()),
            ..Default::default()
        };
        let events = registry.audit().query(&q).await.unwrap();
        assert_eq!(events.len(), 1, "failures are audited too");
        assert_eq!(events[0].status, AuditStatus::Failed);
    }

    #[tokio::test]
    async fn test_unknown_command_shapes_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let registry = make_registry(dir.path()).await;
        registry
            .upsert_avatar(connected_avatar("av1"))
            .await
            .unwrap();
        let executor = JobExecutor::new(registry, FakePlatform::new());

        for command in ["no-dot", "discord.get_messages", "telegram.send_message"] {
            let report = executor.execute(&job(command, json!({}))).await;
            assert!(!report.success, "{command} should be rejected");
            assert_eq!(
                report.error.as_ref().unwrap().kind,
                "validation_error",
                "{command} should be a validation error"
            );
        }
    }

    #[tokio::test]
    async fn test_platform_session_rejection_demotes_the_avatar() {
        let dir = tempfile::tempdir().unwrap();
        let registry = make_registry(dir.path()).await;
        registry
            .upsert_avatar(connected_avatar("av1"))
            .await
            .unwrap();

        let platform = FakePlatform::new();
        platform.fail_with_dead_session();
        let executor = JobExecutor::new(registry.clone(), platform);

        let report = executor
            .execute(&job("telegram.get_messages", json!({"source_id": "src-1"})))
            .await;
        assert!(!report.success);
        assert_eq!(report.error.as_ref().unwrap().kind, "session_unavailable");

        let avatar = registry.avatar("av1").await.unwrap().unwrap();
        assert_eq!(
            avatar.status,
            AvatarStatus::PendingAuth,
            "a first rejection demotes connected to pending_auth"
        );
    }
}
