//! Shared fakes for agent-layer tests: a scriptable platform and backend.

use async_trait::async_trait;
use chrono::Utc;
use courier_core::error::CourierError;
use courier_core::model::{
    Avatar, AvatarProfile, AvatarStatus, AvatarSync, Dialog, ExecutionReport, Job, SessionHandle,
    Source, Sources, TokenVerification,
};
use courier_core::traits::{BackendClient, PhoneLoginOutcome, PlatformHandler, QrPoll, QrToken};
use courier_store::audit::AuditLog;
use courier_store::Registry;
use serde_json::Value;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

pub async fn make_registry(dir: &Path) -> Registry {
    let audit = AuditLog::open(dir.join("history")).await.unwrap();
    Registry::open(dir, audit).await.unwrap()
}

/// A connected avatar subscribed to one channel source.
pub fn connected_avatar(id: &str) -> Avatar {
    Avatar {
        id: id.to_string(),
        name: "Test Avatar".to_string(),
        platform: "telegram".to_string(),
        status: AvatarStatus::Connected,
        session: Some(SessionHandle("session-blob".to_string())),
        phone: None,
        created_at: Utc::now(),
        last_used_at: None,
        profile: AvatarProfile {
            user_id: Some(7),
            username: Some("ada".to_string()),
            first_name: Some("Ada".to_string()),
            last_name: None,
            auth_method: Some("qr".to_string()),
        },
        sources: Sources {
            enabled: true,
            items: vec![Source {
                id: "src-1".to_string(),
                name: "Market News".to_string(),
                kind: "channel".to_string(),
                username: Some("marketnews".to_string()),
                frequency_seconds: 300,
                last_checked_at: None,
                last_message_id: None,
            }],
        },
        cached_dialogs: None,
    }
}

fn default_dialogs() -> Vec<Dialog> {
    vec![
        Dialog {
            id: -1001,
            name: "Market News".to_string(),
            kind: "channel".to_string(),
            username: Some("marketnews".to_string()),
            members_count: Some(1200),
            photo_url: None,
        },
        Dialog {
            id: 77,
            name: "Ada".to_string(),
            kind: "user".to_string(),
            username: Some("ada".to_string()),
            members_count: None,
            photo_url: None,
        },
    ]
}

/// Scriptable platform double. Message batches are consumed per fetch;
/// unscripted calls return empty batches or the default dialog pair.
pub struct FakePlatform {
    message_batches: Mutex<VecDeque<Vec<Value>>>,
    dialog_batches: Mutex<VecDeque<Vec<Dialog>>>,
    last_since: Mutex<Option<i64>>,
    pub fetch_calls: AtomicUsize,
    pub dialog_calls: AtomicUsize,
    pub session_deletes: AtomicUsize,
    dead_session: AtomicBool,
}

impl FakePlatform {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            message_batches: Mutex::new(VecDeque::new()),
            dialog_batches: Mutex::new(VecDeque::new()),
            last_since: Mutex::new(None),
            fetch_calls: AtomicUsize::new(0),
            dialog_calls: AtomicUsize::new(0),
            session_deletes: AtomicUsize::new(0),
            dead_session: AtomicBool::new(false),
        })
    }

    pub async fn script_messages(&self, batch: Vec<Value>) {
        self.message_batches.lock().await.push_back(batch);
    }

    pub async fn script_dialogs(&self, batch: Vec<Dialog>) {
        self.dialog_batches.lock().await.push_back(batch);
    }

    pub async fn last_since_id(&self) -> Option<i64> {
        *self.last_since.lock().await
    }

    /// Make every data call fail the way the bridge reports a revoked
    /// session.
    pub fn fail_with_dead_session(&self) {
        self.dead_session.store(true, Ordering::Relaxed);
    }

    fn check_session(&self) -> Result<(), CourierError> {
        if self.dead_session.load(Ordering::Relaxed) {
            return Err(CourierError::SessionUnavailable(
                "bridge /messages: session revoked".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl PlatformHandler for FakePlatform {
    fn name(&self) -> &str {
        "telegram"
    }

    async fn list_dialogs(
        &self,
        _session: &SessionHandle,
        limit: usize,
    ) -> Result<Vec<Dialog>, CourierError> {
        self.check_session()?;
        self.dialog_calls.fetch_add(1, Ordering::Relaxed);
        let mut dialogs = self
            .dialog_batches
            .lock()
            .await
            .pop_front()
            .unwrap_or_else(default_dialogs);
        dialogs.truncate(limit);
        Ok(dialogs)
    }

    async fn fetch_messages(
        &self,
        _session: &SessionHandle,
        _source_id: &str,
        since_message_id: Option<i64>,
        _limit: usize,
    ) -> Result<Vec<Value>, CourierError> {
        self.check_session()?;
        self.fetch_calls.fetch_add(1, Ordering::Relaxed);
        *self.last_since.lock().await = since_message_id;
        Ok(self
            .message_batches
            .lock()
            .await
            .pop_front()
            .unwrap_or_default())
    }

    async fn begin_qr_login(&self, _avatar_id: &str) -> Result<QrToken, CourierError> {
        Err(CourierError::Platform("login not scripted".to_string()))
    }

    async fn poll_qr_login(
        &self,
        _avatar_id: &str,
        _timeout_secs: u64,
    ) -> Result<QrPoll, CourierError> {
        Err(CourierError::Platform("login not scripted".to_string()))
    }

    async fn cancel_qr_login(&self, _avatar_id: &str) -> Result<(), CourierError> {
        Ok(())
    }

    async fn begin_phone_login(
        &self,
        _avatar_id: &str,
        _phone: &str,
    ) -> Result<String, CourierError> {
        Err(CourierError::Platform("login not scripted".to_string()))
    }

    async fn complete_phone_login(
        &self,
        _avatar_id: &str,
        _phone: &str,
        _code: &str,
        _code_hash: &str,
        _password: Option<&str>,
    ) -> Result<PhoneLoginOutcome, CourierError> {
        Err(CourierError::Platform("login not scripted".to_string()))
    }

    async fn delete_session(&self, _session: &SessionHandle) -> Result<(), CourierError> {
        self.session_deletes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

/// Scriptable backend double. Verification results and job batches are
/// consumed in order; unscripted calls accept the token and hand out no
/// jobs.
pub struct FakeBackend {
    verify_results: Mutex<VecDeque<Result<TokenVerification, CourierError>>>,
    job_batches: Mutex<VecDeque<Vec<Job>>>,
    pub reports: Mutex<Vec<ExecutionReport>>,
    pub syncs: Mutex<Vec<Vec<AvatarSync>>>,
    pub verify_calls: AtomicUsize,
    pub fetch_calls: AtomicUsize,
    fail_sync: AtomicBool,
    healthy: AtomicBool,
}

impl FakeBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            verify_results: Mutex::new(VecDeque::new()),
            job_batches: Mutex::new(VecDeque::new()),
            reports: Mutex::new(Vec::new()),
            syncs: Mutex::new(Vec::new()),
            verify_calls: AtomicUsize::new(0),
            fetch_calls: AtomicUsize::new(0),
            fail_sync: AtomicBool::new(false),
            healthy: AtomicBool::new(true),
        })
    }

    pub async fn script_verify(&self, result: Result<TokenVerification, CourierError>) {
        self.verify_results.lock().await.push_back(result);
    }

    pub async fn script_jobs(&self, jobs: Vec<Job>) {
        self.job_batches.lock().await.push_back(jobs);
    }

    pub fn fail_syncs(&self, fail: bool) {
        self.fail_sync.store(fail, Ordering::Relaxed);
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::Relaxed);
    }
}

#[async_trait]
impl BackendClient for FakeBackend {
    async fn verify_token(&self) -> Result<TokenVerification, CourierError> {
        self.verify_calls.fetch_add(1, Ordering::Relaxed);
        self.verify_results
            .lock()
            .await
            .pop_front()
            .unwrap_or(Ok(TokenVerification {
                accepted: true,
                platform_config: None,
            }))
    }

    async fn fetch_jobs(&self) -> Result<Vec<Job>, CourierError> {
        self.fetch_calls.fetch_add(1, Ordering::Relaxed);
        Ok(self.job_batches.lock().await.pop_front().unwrap_or_default())
    }

    async fn submit_result(&self, report: &ExecutionReport) -> Result<(), CourierError> {
        self.reports.lock().await.push(report.clone());
        Ok(())
    }

    async fn sync_avatars(&self, avatars: &[AvatarSync]) -> Result<(), CourierError> {
        if self.fail_sync.load(Ordering::Relaxed) {
            return Err(CourierError::Network("backend unreachable".to_string()));
        }
        self.syncs.lock().await.push(avatars.to_vec());
        Ok(())
    }

    async fn health_check(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }
}
