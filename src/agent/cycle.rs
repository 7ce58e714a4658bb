//! The control loop: one cooperative background task that verifies the
//! agent token, polls the backend for jobs, executes them sequentially,
//! and pushes avatar snapshots.

use super::executor::JobExecutor;
use super::AgentState;
use chrono::Utc;
use courier_core::model::AvatarSync;
use courier_core::traits::BackendClient;
use courier_store::Registry;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

/// Avatar snapshots are pushed at least this often even without a local
/// status change.
const AVATAR_SYNC_INTERVAL_SECS: i64 = 300;

pub(crate) struct ControlLoop {
    registry: Registry,
    backend: Arc<dyn BackendClient>,
    executor: JobExecutor,
    state: Arc<AgentState>,
    poll_interval_secs: u64,
    stop: Arc<AtomicBool>,
    wake: Arc<Notify>,
    /// A dirty snapshot failed to sync; the dirty flag is already consumed,
    /// so carry the obligation to the next tick.
    resync_pending: bool,
}

impl ControlLoop {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        registry: Registry,
        backend: Arc<dyn BackendClient>,
        executor: JobExecutor,
        state: Arc<AgentState>,
        poll_interval_secs: u64,
        stop: Arc<AtomicBool>,
        wake: Arc<Notify>,
    ) -> Self {
        Self {
            registry,
            backend,
            executor,
            state,
            poll_interval_secs,
            stop,
            wake,
            resync_pending: false,
        }
    }

    pub(crate) async fn run(mut self) {
        info!(
            "control loop started, polling every {}s",
            self.poll_interval_secs
        );
        loop {
            if self.stop.load(Ordering::Relaxed) {
                break;
            }
            self.tick().await;
            tokio::select! {
                _ = self.wake.notified() => {}
                _ = tokio::time::sleep(Duration::from_secs(self.poll_interval_secs)) => {}
            }
        }
        self.state.running.store(false, Ordering::Relaxed);
        info!("control loop stopped");
    }

    /// One full cycle: verification gate, job poll, snapshot sync.
    async fn tick(&mut self) {
        if self.ensure_verified().await {
            self.poll_and_execute().await;
        }
        self.sync_if_needed().await;
    }

    /// Job fetching is gated on a backend verification newer than the
    /// verification window. An explicit rejection pauses fetching until a
    /// later verification succeeds; a transport failure only skips this
    /// tick.
    async fn ensure_verified(&self) -> bool {
        match self.registry.is_verified().await {
            Ok(true) => return true,
            Ok(false) => {}
            Err(e) => {
                warn!("verification state read failed: {e}");
                return false;
            }
        }
        info!("verifying agent token with the backend");
        match self.backend.verify_token().await {
            Ok(v) if v.accepted => {
                if let Err(e) = self.registry.mark_verified(v.platform_config).await {
                    warn!("recording verification failed: {e}");
                    return false;
                }
                info!("agent token verified");
                true
            }
            Ok(_) => {
                warn!("backend rejected the agent token; job polling paused until it verifies");
                if let Err(e) = self
                    .registry
                    .mark_unverified("token rejected by backend")
                    .await
                {
                    warn!("recording rejection failed: {e}");
                }
                false
            }
            Err(e) => {
                warn!("token verification failed: {e}");
                false
            }
        }
    }

    async fn poll_and_execute(&self) {
        let jobs = match self.backend.fetch_jobs().await {
            Ok(jobs) => jobs,
            Err(e) => {
                warn!("job fetch failed: {e}");
                return;
            }
        };
        self.state.set_last_poll(Utc::now());
        if jobs.is_empty() {
            return;
        }
        info!("fetched {} job(s)", jobs.len());
        for job in jobs {
            if self.stop.load(Ordering::Relaxed) {
                info!("stop requested, leaving remaining jobs for the backend to reissue");
                break;
            }
            let report = self.executor.execute(&job).await;
            self.state.jobs_executed.fetch_add(1, Ordering::Relaxed);
            if let Err(e) = self.backend.submit_result(&report).await {
                warn!("result submission for job {} failed: {e}", job.job_id);
            }
        }
    }

    /// Push the avatar snapshot when the cadence is due or a local status
    /// change marked it dirty.
    async fn sync_if_needed(&mut self) {
        let dirty = self.registry.consume_status_dirty() || self.resync_pending;
        let due = match self.state.last_sync() {
            None => true,
            Some(at) => {
                Utc::now().signed_duration_since(at).num_seconds() >= AVATAR_SYNC_INTERVAL_SECS
            }
        };
        if !dirty && !due {
            return;
        }

        let avatars = match self.registry.avatars().await {
            Ok(avatars) => avatars,
            Err(e) => {
                warn!("avatar listing for sync failed: {e}");
                if dirty {
                    self.resync_pending = true;
                }
                return;
            }
        };
        let snapshot: Vec<AvatarSync> = avatars.iter().map(AvatarSync::from_avatar).collect();
        match self.backend.sync_avatars(&snapshot).await {
            Ok(()) => {
                self.state.set_last_sync(Utc::now());
                self.resync_pending = false;
                debug!("synced {} avatar(s)", snapshot.len());
            }
            Err(e) => {
                warn!("avatar sync failed: {e}");
                if dirty {
                    self.resync_pending = true;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::testutil::{connected_avatar, make_registry, FakeBackend, FakePlatform};
    use super::*;
    use courier_core::model::{BlacklistDoc, Job, RuleSet, TokenVerification};
    use serde_json::json;

    fn control_loop(
        registry: Registry,
        platform: std::sync::Arc<FakePlatform>,
        backend: std::sync::Arc<FakeBackend>,
    ) -> ControlLoop {
        let executor = JobExecutor::new(registry.clone(), platform);
        ControlLoop::new(
            registry,
            backend,
            executor,
            AgentState::new(),
            30,
            Arc::new(AtomicBool::new(false)),
            Arc::new(Notify::new()),
        )
    }

    fn get_messages_job(job_id: &str) -> Job {
        Job {
            job_id: job_id.to_string(),
            avatar_id: "av1".to_string(),
            command: "telegram.get_messages".to_string(),
            params: json!({"source_id": "src-1"}),
        }
    }

    #[tokio::test]
    async fn test_tick_runs_the_full_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let registry = make_registry(dir.path()).await;
        registry
            .upsert_avatar(connected_avatar("av1"))
            .await
            .unwrap();
        registry
            .replace_blacklist(BlacklistDoc {
                global: RuleSet {
                    keywords: vec!["spam".to_string()],
                    ..Default::default()
                },
                ..Default::default()
            })
            .await
            .unwrap();

        let platform = FakePlatform::new();
        platform
            .script_messages(vec![
                json!({"id": 1, "message": "hello"}),
                json!({"id": 2, "message": "buy spam now"}),
                json!({"id": 3, "message": "meeting at noon"}),
            ])
            .await;
        let backend = FakeBackend::new();
        backend.script_jobs(vec![get_messages_job("job-1")]).await;

        let mut control = control_loop(registry.clone(), platform, backend.clone());
        control.tick().await;

        let reports = backend.reports.lock().await;
        assert_eq!(reports.len(), 1);
        assert!(reports[0].success);
        assert_eq!(reports[0].items_count, Some(2));
        assert_eq!(reports[0].filtered_count, Some(1));
        drop(reports);

        assert_eq!(control.state.jobs_executed.load(Ordering::Relaxed), 1);
        assert!(control.state.last_poll().is_some());
        assert!(control.state.last_sync().is_some(), "first tick syncs avatars");

        let avatar = registry.avatar("av1").await.unwrap().unwrap();
        assert_eq!(
            avatar.sources.items[0].last_message_id,
            Some(3),
            "the cycle must leave the source cursor advanced"
        );
    }

    #[tokio::test]
    async fn test_rejected_token_pauses_job_fetching() {
        let dir = tempfile::tempdir().unwrap();
        let registry = make_registry(dir.path()).await;
        let backend = FakeBackend::new();
        backend
            .script_verify(Ok(TokenVerification {
                accepted: false,
                platform_config: None,
            }))
            .await;

        let mut control = control_loop(registry.clone(), FakePlatform::new(), backend.clone());
        control.tick().await;

        assert_eq!(
            backend.fetch_calls.load(Ordering::Relaxed),
            0,
            "a rejected token must stop job fetching"
        );
        assert!(!registry.is_verified().await.unwrap());
        let q = courier_store::HistoryQuery {
            event_type_prefix: Some("token_verification_failed".to_string()),
            ..Default::default()
        };
        assert_eq!(
            registry.audit().query(&q).await.unwrap().len(),
            1,
            "the rejection must be audited"
        );

        control.tick().await;
        assert_eq!(
            backend.fetch_calls.load(Ordering::Relaxed),
            1,
            "fetching resumes once a later verification succeeds"
        );
        assert!(registry.is_verified().await.unwrap());
    }

    #[tokio::test]
    async fn test_fresh_verification_short_circuits_the_backend() {
        let dir = tempfile::tempdir().unwrap();
        let registry = make_registry(dir.path()).await;
        registry.mark_verified(None).await.unwrap();
        let backend = FakeBackend::new();

        let mut control = control_loop(registry, FakePlatform::new(), backend.clone());
        control.tick().await;

        assert_eq!(
            backend.verify_calls.load(Ordering::Relaxed),
            0,
            "a verification inside the window must not hit the backend"
        );
        assert_eq!(backend.fetch_calls.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_transport_failure_is_not_a_rejection() {
        let dir = tempfile::tempdir().unwrap();
        let registry = make_registry(dir.path()).await;
        let backend = FakeBackend::new();
        backend
            .script_verify(Err(courier_core::error::CourierError::Network(
                "connection refused".to_string(),
            )))
            .await;

        let mut control = control_loop(registry.clone(), FakePlatform::new(), backend.clone());
        control.tick().await;

        assert_eq!(backend.fetch_calls.load(Ordering::Relaxed), 0);
        let q = courier_store::HistoryQuery {
            event_type_prefix: Some("token_verification_failed".to_string()),
            ..Default::default()
        };
        assert!(
            registry.audit().query(&q).await.unwrap().is_empty(),
            "a transport failure must not be recorded as a rejection"
        );
    }

    #[tokio::test]
    async fn test_status_change_triggers_an_immediate_sync() {
        let dir = tempfile::tempdir().unwrap();
        let registry = make_registry(dir.path()).await;
        registry
            .upsert_avatar(connected_avatar("av1"))
            .await
            .unwrap();
        let backend = FakeBackend::new();

        let mut control = control_loop(registry.clone(), FakePlatform::new(), backend.clone());
        control.tick().await;
        assert_eq!(backend.syncs.lock().await.len(), 1);

        control.tick().await;
        assert_eq!(
            backend.syncs.lock().await.len(),
            1,
            "no change and inside the cadence: no sync"
        );

        registry.escalate_auth_failure("av1").await.unwrap();
        control.tick().await;
        let syncs = backend.syncs.lock().await;
        assert_eq!(syncs.len(), 2, "a status change must sync on the next tick");
        assert_eq!(syncs[1][0].status, "pending_auth");
        let payload = serde_json::to_string(&syncs[1]).unwrap();
        assert!(
            !payload.contains("session-blob"),
            "the session handle must never appear in a sync payload"
        );
    }

    #[tokio::test]
    async fn test_failed_dirty_sync_is_retried_next_tick() {
        let dir = tempfile::tempdir().unwrap();
        let registry = make_registry(dir.path()).await;
        registry
            .upsert_avatar(connected_avatar("av1"))
            .await
            .unwrap();
        let backend = FakeBackend::new();

        let mut control = control_loop(registry.clone(), FakePlatform::new(), backend.clone());
        control.tick().await;
        assert_eq!(backend.syncs.lock().await.len(), 1);

        registry.escalate_auth_failure("av1").await.unwrap();
        backend.fail_syncs(true);
        control.tick().await;
        assert_eq!(backend.syncs.lock().await.len(), 1, "the sync attempt failed");
        assert!(control.resync_pending);

        backend.fail_syncs(false);
        control.tick().await;
        assert_eq!(
            backend.syncs.lock().await.len(),
            2,
            "the consumed dirty flag must not be lost to a failed sync"
        );
        assert!(!control.resync_pending);
    }
}
