//! The agent context object.
//!
//! `Agent` owns the registry, the platform and backend clients, and the
//! control loop lifecycle. Everything the CLI (and the remote backend,
//! through the loop) does goes through here; there is no global state.

mod cycle;
mod executor;
#[cfg(test)]
mod testutil;

use chrono::{DateTime, Utc};
use courier_backend::HttpBackend;
use courier_core::config::{self, Config};
use courier_core::error::CourierError;
use courier_core::model::{
    AgentStatus, Avatar, AvatarProfile, AvatarStatus, Dialog, Sources,
};
use courier_core::traits::{BackendClient, PlatformHandler};
use courier_platform::TelegramBridge;
use courier_session::SessionAuthenticator;
use courier_store::audit::{AuditEvent, AuditLog, AuditStatus, AuditSummary, HistoryQuery};
use courier_store::Registry;
use cycle::ControlLoop;
use executor::JobExecutor;
use serde_json::json;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

/// Loop-side counters and timestamps, shared between the control loop and
/// the status surface.
pub(crate) struct AgentState {
    pub(crate) running: AtomicBool,
    pub(crate) jobs_executed: AtomicU64,
    last_poll_at: std::sync::Mutex<Option<DateTime<Utc>>>,
    last_sync_at: std::sync::Mutex<Option<DateTime<Utc>>>,
}

impl AgentState {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            running: AtomicBool::new(false),
            jobs_executed: AtomicU64::new(0),
            last_poll_at: std::sync::Mutex::new(None),
            last_sync_at: std::sync::Mutex::new(None),
        })
    }

    pub(crate) fn last_poll(&self) -> Option<DateTime<Utc>> {
        self.last_poll_at.lock().map(|slot| *slot).unwrap_or(None)
    }

    pub(crate) fn set_last_poll(&self, at: DateTime<Utc>) {
        if let Ok(mut slot) = self.last_poll_at.lock() {
            *slot = Some(at);
        }
    }

    pub(crate) fn last_sync(&self) -> Option<DateTime<Utc>> {
        self.last_sync_at.lock().map(|slot| *slot).unwrap_or(None)
    }

    pub(crate) fn set_last_sync(&self, at: DateTime<Utc>) {
        if let Ok(mut slot) = self.last_sync_at.lock() {
            *slot = Some(at);
        }
    }
}

/// Builds a backend client for a given agent token. Tokens can change at
/// runtime, so the client is rebuilt rather than cached.
type BackendBuilder = Box<dyn Fn(String) -> Arc<dyn BackendClient> + Send + Sync>;

struct LoopHandle {
    task: JoinHandle<()>,
    stop: Arc<AtomicBool>,
    wake: Arc<Notify>,
}

pub struct Agent {
    config: Config,
    registry: Registry,
    platform: Arc<dyn PlatformHandler>,
    authenticator: SessionAuthenticator,
    state: Arc<AgentState>,
    runtime: Mutex<Option<LoopHandle>>,
    backend_builder: BackendBuilder,
}

impl Agent {
    pub async fn new(config: Config) -> Result<Self, CourierError> {
        let data_dir = PathBuf::from(config::shellexpand(&config.courier.data_dir));
        let audit = AuditLog::open(data_dir.join("history")).await?;
        let registry = Registry::open(&data_dir, audit).await?;

        let bridge = config.platform.telegram.clone().unwrap_or_default();
        let platform: Arc<dyn PlatformHandler> = Arc::new(TelegramBridge::new(bridge));

        let backend_cfg = config.backend.clone();
        let backend_builder: BackendBuilder =
            Box::new(move |token| Arc::new(HttpBackend::new(&backend_cfg, token)));

        Ok(Self::assemble(config, registry, platform, backend_builder))
    }

    fn assemble(
        config: Config,
        registry: Registry,
        platform: Arc<dyn PlatformHandler>,
        backend_builder: BackendBuilder,
    ) -> Self {
        let authenticator = SessionAuthenticator::new(platform.clone(), registry.clone());
        Self {
            config,
            registry,
            platform,
            authenticator,
            state: AgentState::new(),
            runtime: Mutex::new(None),
            backend_builder,
        }
    }

    pub fn authenticator(&self) -> &SessionAuthenticator {
        &self.authenticator
    }

    /// Start the control loop. A start while already running is a no-op
    /// that reports the current state; a start without a configured token
    /// is rejected.
    pub async fn start(&self) -> Result<AgentStatus, CourierError> {
        let mut runtime = self.runtime.lock().await;
        if runtime.is_none() {
            if !self.registry.is_configured().await? {
                return Err(CourierError::Validation(
                    "agent token is not configured; run `courier init` first".into(),
                ));
            }
            let token = self.registry.token().await?.unwrap_or_default();
            match self
                .registry
                .audit()
                .cleanup_old(self.config.courier.history_keep_days)
                .await
            {
                Ok(0) => {}
                Ok(removed) => info!("removed {removed} expired history file(s)"),
                Err(e) => warn!("history cleanup failed: {e}"),
            }

            let stop = Arc::new(AtomicBool::new(false));
            let wake = Arc::new(Notify::new());
            self.state.running.store(true, Ordering::Relaxed);
            let control = ControlLoop::new(
                self.registry.clone(),
                (self.backend_builder)(token),
                JobExecutor::new(self.registry.clone(), self.platform.clone()),
                self.state.clone(),
                self.config.backend.poll_interval_secs,
                stop.clone(),
                wake.clone(),
            );
            *runtime = Some(LoopHandle {
                task: tokio::spawn(control.run()),
                stop,
                wake,
            });
        }
        drop(runtime);
        self.status().await
    }

    /// Cooperative shutdown: the in-flight job finishes, no new job is
    /// dispatched, then the loop task exits.
    pub async fn stop(&self) -> Result<AgentStatus, CourierError> {
        if let Some(handle) = self.runtime.lock().await.take() {
            handle.stop.store(true, Ordering::Relaxed);
            handle.wake.notify_one();
            if handle.task.await.is_err() {
                warn!("control loop ended abnormally");
            }
        }
        self.status().await
    }

    /// Merged status surface: loop state plus the runtime documents plus a
    /// live backend reachability probe.
    pub async fn status(&self) -> Result<AgentStatus, CourierError> {
        let configured = self.registry.is_configured().await?;
        let verified = self.registry.is_verified().await?;
        let token = self.registry.token().await?.unwrap_or_default();
        let backend_reachable = (self.backend_builder)(token).health_check().await;
        Ok(AgentStatus {
            running: self.state.running.load(Ordering::Relaxed),
            verified,
            backend_reachable,
            configured,
            last_poll_at: self.state.last_poll(),
            last_avatar_sync_at: self.state.last_sync(),
            jobs_executed: self.state.jobs_executed.load(Ordering::Relaxed),
        })
    }

    pub async fn masked_token(&self) -> Result<String, CourierError> {
        self.registry.masked_token().await
    }

    /// Store a new agent token and verify it with the backend immediately.
    /// When the loop is running it is restarted so polling resumes under
    /// the new credential. Returns whether the backend accepted the token.
    pub async fn update_token(&self, token: &str) -> Result<bool, CourierError> {
        self.registry.set_token(token).await?;
        let client = (self.backend_builder)(token.trim().to_string());
        let accepted = match client.verify_token().await {
            Ok(v) if v.accepted => {
                self.registry.mark_verified(v.platform_config).await?;
                true
            }
            Ok(_) => {
                self.registry
                    .mark_unverified("token rejected by backend")
                    .await?;
                false
            }
            Err(e) => {
                warn!("token verification failed: {e}");
                false
            }
        };
        let running = self.runtime.lock().await.is_some();
        if running {
            self.stop().await?;
            self.start().await?;
        }
        Ok(accepted)
    }

    pub async fn avatars(&self) -> Result<Vec<Avatar>, CourierError> {
        self.registry.avatars().await
    }

    pub async fn avatar(&self, avatar_id: &str) -> Result<Option<Avatar>, CourierError> {
        self.registry.avatar(avatar_id).await
    }

    /// Register a new avatar in `pending_auth`, ready for a login flow.
    pub async fn create_avatar(
        &self,
        name: &str,
        phone: Option<String>,
    ) -> Result<Avatar, CourierError> {
        let avatar = Avatar {
            id: Uuid::new_v4().to_string(),
            name: name.trim().to_string(),
            platform: self.platform.name().to_string(),
            status: AvatarStatus::PendingAuth,
            session: None,
            phone,
            created_at: Utc::now(),
            last_used_at: None,
            profile: AvatarProfile::default(),
            sources: Sources::default(),
            cached_dialogs: None,
        };
        self.registry.upsert_avatar(avatar).await
    }

    /// Remove an avatar, tearing down any live login flow and revoking its
    /// platform session. Returns whether an avatar was removed.
    pub async fn delete_avatar(&self, avatar_id: &str) -> Result<bool, CourierError> {
        self.authenticator.reset(avatar_id).await;
        match self.registry.delete_avatar(avatar_id).await? {
            Some(avatar) => {
                if let Some(session) = avatar.session {
                    if let Err(e) = self.platform.delete_session(&session).await {
                        warn!("platform session teardown for avatar {avatar_id} failed: {e}");
                    }
                }
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Log an avatar out: detach and revoke its session, keep the avatar.
    pub async fn logout(&self, avatar_id: &str) -> Result<(), CourierError> {
        self.authenticator.reset(avatar_id).await;
        if let Some(session) = self.registry.clear_session(avatar_id).await? {
            if let Err(e) = self.platform.delete_session(&session).await {
                warn!("platform session teardown for avatar {avatar_id} failed: {e}");
            }
        }
        Ok(())
    }

    /// The avatar's dialog list, served from cache unless a refresh is
    /// forced or no cache exists yet.
    pub async fn dialogs(
        &self,
        avatar_id: &str,
        limit: usize,
        force_refresh: bool,
    ) -> Result<Vec<Dialog>, CourierError> {
        if !force_refresh {
            if let Some(cached) = self.registry.dialog_cache(avatar_id).await? {
                return Ok(cached);
            }
        }
        let avatar = self
            .registry
            .avatar(avatar_id)
            .await?
            .ok_or_else(|| CourierError::Validation(format!("unknown avatar {avatar_id}")))?;
        let session = match avatar.session {
            Some(ref session) if avatar.session_live() => session.clone(),
            _ => {
                return Err(CourierError::SessionUnavailable(format!(
                    "avatar {avatar_id} has no live session"
                )))
            }
        };

        let dialogs = match self.platform.list_dialogs(&session, limit).await {
            Ok(dialogs) => dialogs,
            Err(e) => {
                if matches!(e, CourierError::SessionUnavailable(_)) {
                    if let Err(esc) = self.registry.escalate_auth_failure(avatar_id).await {
                        warn!("status escalation for avatar {avatar_id} failed: {esc}");
                    }
                }
                return Err(e);
            }
        };
        self.registry
            .set_dialog_cache(avatar_id, dialogs.clone())
            .await?;
        self.registry.mark_avatar_used(avatar_id).await?;
        if let Err(e) = self
            .registry
            .audit()
            .system_event(
                "avatar",
                avatar_id,
                "dialogs_refreshed",
                json!({"count": dialogs.len(), "forced": force_refresh}),
                AuditStatus::Success,
                None,
            )
            .await
        {
            warn!("audit write for dialog refresh failed: {e}");
        }
        Ok(dialogs)
    }

    pub async fn history(&self, query: &HistoryQuery) -> Result<Vec<AuditEvent>, CourierError> {
        self.registry.audit().query(query).await
    }

    pub async fn history_summary(&self, days: i64) -> Result<AuditSummary, CourierError> {
        self.registry.audit().summary(days).await
    }
}
