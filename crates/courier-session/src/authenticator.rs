//! Avatar login flows.
//!
//! QR login is a per-avatar state machine: `idle → generating → ready →
//! authenticating → success`, with a recoverable `error` state. While
//! `ready`, a single driver task polls the platform for scan confirmation
//! and regenerates the token shortly before it expires. Every transition
//! re-validates the flow's generation counter under the lock, so a stale
//! scheduled action can never act on a flow that has moved on.
//!
//! Phone login is two steps (`start` sends the code, `complete` submits
//! it). Both flows share the per-avatar slot, which makes them mutually
//! exclusive for the same avatar id.

use chrono::{DateTime, Utc};
use courier_core::error::CourierError;
use courier_core::model::{AvatarProfile, SessionHandle};
use courier_core::traits::{PhoneLoginOutcome, PlatformHandler, QrPoll};
use courier_store::audit::AuditStatus;
use courier_store::Registry;
use serde::Serialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// QR flow timing knobs.
#[derive(Debug, Clone, Copy)]
pub struct QrTiming {
    /// How long before token expiry the regeneration fires.
    pub regen_lead_secs: u64,
    /// Tokens arriving with less lifetime than this are regenerated
    /// outright instead of polled.
    pub min_usable_secs: u64,
    /// Wall-clock budget for one login attempt across all regenerations.
    pub flow_deadline_secs: u64,
}

impl Default for QrTiming {
    fn default() -> Self {
        Self {
            regen_lead_secs: 10,
            min_usable_secs: 5,
            flow_deadline_secs: 600,
        }
    }
}

/// Snapshot of an avatar's login flow for the upward surface.
#[derive(Debug, Clone, Serialize)]
pub struct AuthFlowStatus {
    pub state: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
}

impl AuthFlowStatus {
    fn bare(state: &str) -> Self {
        Self {
            state: state.to_string(),
            payload: None,
            expires_at: None,
            message: None,
            phone: None,
        }
    }

    fn idle() -> Self {
        Self::bare("idle")
    }
}

/// Outcome of a phone-flow completion attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhoneCompletion {
    Authenticated,
    /// The account has a second factor; call `complete_phone` again with
    /// the password.
    PasswordRequired,
}

#[derive(Debug, Clone)]
enum QrState {
    Generating,
    Ready {
        payload: String,
        expires_at: DateTime<Utc>,
    },
    Authenticating,
    Success,
    Error {
        message: String,
    },
}

struct QrFlow {
    state: QrState,
    /// Retired on every terminal or regenerating transition; a scheduled
    /// action holding an older value is stale and must not act.
    generation: u64,
    attempt_id: String,
    driver: Option<JoinHandle<()>>,
}

struct PhoneFlow {
    phone: String,
    attempt_id: String,
}

enum AuthFlow {
    Qr(QrFlow),
    Phone(PhoneFlow),
}

/// Login flow coordinator. One slot per avatar id; at most one in-flight
/// scheduled action per slot.
#[derive(Clone)]
pub struct SessionAuthenticator {
    platform: Arc<dyn PlatformHandler>,
    registry: Registry,
    flows: Arc<Mutex<HashMap<String, AuthFlow>>>,
    next_generation: Arc<AtomicU64>,
    timing: QrTiming,
}

impl SessionAuthenticator {
    pub fn new(platform: Arc<dyn PlatformHandler>, registry: Registry) -> Self {
        Self::with_timing(platform, registry, QrTiming::default())
    }

    pub fn with_timing(
        platform: Arc<dyn PlatformHandler>,
        registry: Registry,
        timing: QrTiming,
    ) -> Self {
        Self {
            platform,
            registry,
            flows: Arc::new(Mutex::new(HashMap::new())),
            next_generation: Arc::new(AtomicU64::new(0)),
            timing,
        }
    }

    // ---------- qr flow ----------

    /// Begin a QR login. Only an idle or errored slot may start; anything
    /// else is rejected synchronously with no side effects.
    pub async fn start_qr(&self, avatar_id: &str) -> Result<AuthFlowStatus, CourierError> {
        self.registry
            .avatar(avatar_id)
            .await?
            .ok_or_else(|| CourierError::Validation(format!("unknown avatar {avatar_id}")))?;

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let attempt_id = Uuid::new_v4().to_string();
        {
            let mut flows = self.flows.lock().await;
            match flows.get(avatar_id) {
                None => {}
                Some(AuthFlow::Qr(flow)) => match flow.state {
                    QrState::Error { .. } => {}
                    QrState::Success => {
                        return Err(CourierError::AuthState(format!(
                            "avatar {avatar_id} already completed a login"
                        )))
                    }
                    _ => {
                        return Err(CourierError::AuthState(format!(
                            "qr login already in progress for avatar {avatar_id}"
                        )))
                    }
                },
                Some(AuthFlow::Phone(_)) => {
                    return Err(CourierError::AuthState(format!(
                        "phone login already in progress for avatar {avatar_id}"
                    )))
                }
            }
            flows.insert(
                avatar_id.to_string(),
                AuthFlow::Qr(QrFlow {
                    state: QrState::Generating,
                    generation,
                    attempt_id: attempt_id.clone(),
                    driver: None,
                }),
            );
        }

        info!("qr login started for avatar {avatar_id}");
        self.registry
            .audit()
            .auth_event(
                avatar_id,
                "started",
                json!({ "method": "qr", "attempt_id": attempt_id }),
                AuditStatus::Success,
                None,
            )
            .await?;

        let token = match self.platform.begin_qr_login(avatar_id).await {
            Ok(token) => token,
            Err(e) => {
                self.fail_qr(avatar_id, generation, &e.to_string()).await;
                return Err(e);
            }
        };

        let status = {
            let mut flows = self.flows.lock().await;
            match flows.get_mut(avatar_id) {
                Some(AuthFlow::Qr(flow)) if flow.generation == generation => {
                    flow.state = QrState::Ready {
                        payload: token.payload.clone(),
                        expires_at: token.expires_at,
                    };
                    AuthFlowStatus {
                        state: "ready".to_string(),
                        payload: Some(token.payload),
                        expires_at: Some(token.expires_at),
                        message: None,
                        phone: None,
                    }
                }
                _ => {
                    debug!("discarding qr token for {avatar_id}: flow cancelled during generation");
                    return Ok(AuthFlowStatus::idle());
                }
            }
        };

        let auth = self.clone();
        let id = avatar_id.to_string();
        let expires_at = token.expires_at;
        let driver = tokio::spawn(async move {
            auth.drive_qr(&id, generation, expires_at).await;
        });
        {
            let mut flows = self.flows.lock().await;
            if let Some(AuthFlow::Qr(flow)) = flows.get_mut(avatar_id) {
                if flow.generation == generation {
                    flow.driver = Some(driver);
                }
            }
        }

        Ok(status)
    }

    /// The one scheduled action for a QR flow: waits for a scan, and
    /// regenerates the token when the regeneration point is reached.
    async fn drive_qr(
        &self,
        avatar_id: &str,
        mut generation: u64,
        mut expires_at: DateTime<Utc>,
    ) {
        let deadline = Instant::now() + std::time::Duration::from_secs(self.timing.flow_deadline_secs);
        loop {
            if Instant::now() >= deadline {
                self.expire_qr(avatar_id, generation).await;
                return;
            }

            let remaining = remaining_secs(expires_at);
            let window = match poll_window(remaining, &self.timing) {
                Some(window) => window,
                None => match self.regenerate(avatar_id, generation).await {
                    Some((next_generation, next_expiry)) => {
                        generation = next_generation;
                        expires_at = next_expiry;
                        continue;
                    }
                    None => return,
                },
            };

            match self.platform.poll_qr_login(avatar_id, window).await {
                Ok(QrPoll::Authenticated { session, profile }) => {
                    self.finish_qr(avatar_id, generation, session, profile).await;
                    return;
                }
                Ok(QrPoll::TimedOut) => match self.regenerate(avatar_id, generation).await {
                    Some((next_generation, next_expiry)) => {
                        generation = next_generation;
                        expires_at = next_expiry;
                    }
                    None => return,
                },
                Ok(QrPoll::Pending) => {
                    if remaining_secs(expires_at) <= self.timing.regen_lead_secs {
                        match self.regenerate(avatar_id, generation).await {
                            Some((next_generation, next_expiry)) => {
                                generation = next_generation;
                                expires_at = next_expiry;
                            }
                            None => return,
                        }
                    }
                    // The bridge normally holds the request for the whole
                    // window; pace the re-poll in case it returned early.
                    tokio::time::sleep(std::time::Duration::from_millis(250)).await;
                }
                Err(e) => {
                    self.fail_qr(avatar_id, generation, &e.to_string()).await;
                    return;
                }
            }
        }
    }

    /// Swap in a fresh token, cancelling the old one platform-side. Returns
    /// the new generation and expiry, or `None` if the flow has moved on.
    async fn regenerate(
        &self,
        avatar_id: &str,
        generation: u64,
    ) -> Option<(u64, DateTime<Utc>)> {
        {
            let mut flows = self.flows.lock().await;
            match flows.get_mut(avatar_id) {
                Some(AuthFlow::Qr(flow))
                    if flow.generation == generation
                        && matches!(flow.state, QrState::Ready { .. }) =>
                {
                    flow.state = QrState::Generating;
                }
                _ => return None,
            }
        }

        debug!("regenerating qr token for avatar {avatar_id}");
        if let Err(e) = self.platform.cancel_qr_login(avatar_id).await {
            debug!("platform-side cancel during regeneration failed: {e}");
        }

        let token = match self.platform.begin_qr_login(avatar_id).await {
            Ok(token) => token,
            Err(e) => {
                self.fail_qr(avatar_id, generation, &e.to_string()).await;
                return None;
            }
        };

        let next_generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let mut flows = self.flows.lock().await;
        match flows.get_mut(avatar_id) {
            Some(AuthFlow::Qr(flow)) if flow.generation == generation => {
                flow.generation = next_generation;
                flow.state = QrState::Ready {
                    payload: token.payload,
                    expires_at: token.expires_at,
                };
                Some((next_generation, token.expires_at))
            }
            _ => {
                debug!("discarding regenerated qr token for {avatar_id}: flow changed");
                None
            }
        }
    }

    /// A scan was confirmed: retire the generation (stopping every pending
    /// action) before any further I/O, then persist the session.
    async fn finish_qr(
        &self,
        avatar_id: &str,
        generation: u64,
        session: SessionHandle,
        profile: AvatarProfile,
    ) {
        let next_generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let attempt_id = {
            let mut flows = self.flows.lock().await;
            match flows.get_mut(avatar_id) {
                Some(AuthFlow::Qr(flow))
                    if flow.generation == generation
                        && matches!(flow.state, QrState::Ready { .. }) =>
                {
                    flow.state = QrState::Authenticating;
                    flow.generation = next_generation;
                    flow.driver = None;
                    flow.attempt_id.clone()
                }
                _ => {
                    warn!("discarding confirmed login for {avatar_id}: flow changed");
                    return;
                }
            }
        };

        let mut profile = profile;
        profile.auth_method = Some("qr".to_string());
        let name = display_name(self.platform.name(), &profile);
        let user_id = profile.user_id;

        if let Err(e) = self
            .registry
            .store_session(avatar_id, session, profile, name)
            .await
        {
            self.fail_qr(avatar_id, next_generation, &format!("session store failed: {e}"))
                .await;
            return;
        }

        if let Err(e) = self
            .registry
            .audit()
            .auth_event(
                avatar_id,
                "completed",
                json!({ "method": "qr", "attempt_id": attempt_id, "user_id": user_id }),
                AuditStatus::Success,
                None,
            )
            .await
        {
            warn!("audit write for completed login failed: {e}");
        }

        let mut flows = self.flows.lock().await;
        if let Some(AuthFlow::Qr(flow)) = flows.get_mut(avatar_id) {
            if flow.generation == next_generation {
                flow.state = QrState::Success;
            }
        }
        info!("qr login completed for avatar {avatar_id}");
    }

    /// Park the flow in the error state. No-op when the generation is stale.
    async fn fail_qr(&self, avatar_id: &str, generation: u64, error: &str) {
        let attempt_id = {
            let mut flows = self.flows.lock().await;
            match flows.get_mut(avatar_id) {
                Some(AuthFlow::Qr(flow)) if flow.generation == generation => {
                    flow.state = QrState::Error {
                        message: error.to_string(),
                    };
                    flow.driver = None;
                    flow.attempt_id.clone()
                }
                _ => return,
            }
        };

        warn!("qr login for avatar {avatar_id} failed: {error}");
        if let Err(e) = self
            .registry
            .audit()
            .auth_event(
                avatar_id,
                "failed",
                json!({ "method": "qr", "attempt_id": attempt_id }),
                AuditStatus::Failed,
                Some(error.to_string()),
            )
            .await
        {
            warn!("audit write for failed login failed: {e}");
        }
    }

    /// The attempt outlived its deadline without a scan.
    async fn expire_qr(&self, avatar_id: &str, generation: u64) {
        let attempt_id = {
            let mut flows = self.flows.lock().await;
            match flows.get_mut(avatar_id) {
                Some(AuthFlow::Qr(flow)) if flow.generation == generation => {
                    flow.state = QrState::Error {
                        message: "login window elapsed".to_string(),
                    };
                    flow.driver = None;
                    flow.attempt_id.clone()
                }
                _ => return,
            }
        };

        info!("qr login for avatar {avatar_id} timed out");
        if let Err(e) = self.platform.cancel_qr_login(avatar_id).await {
            debug!("platform-side cancel after timeout failed: {e}");
        }
        if let Err(e) = self
            .registry
            .audit()
            .auth_event(
                avatar_id,
                "timeout",
                json!({ "method": "qr", "attempt_id": attempt_id }),
                AuditStatus::Failed,
                Some("login window elapsed".to_string()),
            )
            .await
        {
            warn!("audit write for login timeout failed: {e}");
        }
    }

    /// Cancel whatever flow the avatar has. Idempotent: an idle slot and a
    /// completed login are both safe no-ops, and no platform cancel is
    /// issued once success has been observed.
    pub async fn cancel(&self, avatar_id: &str) -> Result<(), CourierError> {
        let removed = {
            let mut flows = self.flows.lock().await;
            match flows.get(avatar_id) {
                None => return Ok(()),
                Some(AuthFlow::Qr(flow)) if matches!(flow.state, QrState::Success) => {
                    return Ok(())
                }
                Some(_) => flows.remove(avatar_id),
            }
        };

        match removed {
            Some(AuthFlow::Qr(mut flow)) => {
                if let Some(driver) = flow.driver.take() {
                    driver.abort();
                }
                if let Err(e) = self.platform.cancel_qr_login(avatar_id).await {
                    warn!("platform-side qr cancel failed: {e}");
                }
                info!("qr login cancelled for avatar {avatar_id}");
                self.registry
                    .audit()
                    .auth_event(
                        avatar_id,
                        "cancelled",
                        json!({ "method": "qr", "attempt_id": flow.attempt_id }),
                        AuditStatus::Success,
                        None,
                    )
                    .await?;
            }
            Some(AuthFlow::Phone(flow)) => {
                info!("phone login cancelled for avatar {avatar_id}");
                self.registry
                    .audit()
                    .auth_event(
                        avatar_id,
                        "cancelled",
                        json!({ "method": "phone", "attempt_id": flow.attempt_id }),
                        AuditStatus::Success,
                        None,
                    )
                    .await?;
            }
            None => {}
        }
        Ok(())
    }

    /// Clear the slot without touching the platform. For avatar teardown
    /// and for dismissing a completed or errored flow.
    pub async fn reset(&self, avatar_id: &str) {
        let mut flows = self.flows.lock().await;
        if let Some(AuthFlow::Qr(mut flow)) = flows.remove(avatar_id) {
            if let Some(driver) = flow.driver.take() {
                driver.abort();
            }
        }
    }

    pub async fn status(&self, avatar_id: &str) -> AuthFlowStatus {
        let flows = self.flows.lock().await;
        match flows.get(avatar_id) {
            None => AuthFlowStatus::idle(),
            Some(AuthFlow::Qr(flow)) => match &flow.state {
                QrState::Generating => AuthFlowStatus::bare("generating"),
                QrState::Ready {
                    payload,
                    expires_at,
                } => AuthFlowStatus {
                    state: "ready".to_string(),
                    payload: Some(payload.clone()),
                    expires_at: Some(*expires_at),
                    message: None,
                    phone: None,
                },
                QrState::Authenticating => AuthFlowStatus::bare("authenticating"),
                QrState::Success => AuthFlowStatus::bare("success"),
                QrState::Error { message } => AuthFlowStatus {
                    state: "error".to_string(),
                    payload: None,
                    expires_at: None,
                    message: Some(message.clone()),
                    phone: None,
                },
            },
            Some(AuthFlow::Phone(flow)) => AuthFlowStatus {
                state: "code_requested".to_string(),
                payload: None,
                expires_at: None,
                message: None,
                phone: Some(flow.phone.clone()),
            },
        }
    }

    // ---------- phone flow ----------

    /// Request a verification code. Returns the code-hash the caller must
    /// echo back to `complete_phone`. Re-requesting a code replaces the
    /// pending one; a live QR flow blocks the slot.
    pub async fn start_phone(
        &self,
        avatar_id: &str,
        phone: &str,
    ) -> Result<String, CourierError> {
        if phone.trim().is_empty() {
            return Err(CourierError::Validation("phone number must not be empty".into()));
        }
        self.registry
            .avatar(avatar_id)
            .await?
            .ok_or_else(|| CourierError::Validation(format!("unknown avatar {avatar_id}")))?;

        let attempt_id = Uuid::new_v4().to_string();
        {
            let mut flows = self.flows.lock().await;
            if matches!(flows.get(avatar_id), Some(AuthFlow::Qr(_))) {
                return Err(CourierError::AuthState(format!(
                    "qr login already in progress for avatar {avatar_id}"
                )));
            }
            flows.insert(
                avatar_id.to_string(),
                AuthFlow::Phone(PhoneFlow {
                    phone: phone.to_string(),
                    attempt_id: attempt_id.clone(),
                }),
            );
        }

        info!("phone login started for avatar {avatar_id}");
        self.registry
            .audit()
            .auth_event(
                avatar_id,
                "started",
                json!({ "method": "phone", "attempt_id": attempt_id }),
                AuditStatus::Success,
                None,
            )
            .await?;

        match self.platform.begin_phone_login(avatar_id, phone).await {
            Ok(code_hash) => Ok(code_hash),
            Err(e) => {
                {
                    let mut flows = self.flows.lock().await;
                    if matches!(flows.get(avatar_id), Some(AuthFlow::Phone(f)) if f.attempt_id == attempt_id)
                    {
                        flows.remove(avatar_id);
                    }
                }
                self.registry
                    .audit()
                    .auth_event(
                        avatar_id,
                        "failed",
                        json!({ "method": "phone", "attempt_id": attempt_id }),
                        AuditStatus::Failed,
                        Some(e.to_string()),
                    )
                    .await?;
                Err(e)
            }
        }
    }

    /// Submit the verification code. A wrong code keeps the flow alive for
    /// another attempt; a second-factor challenge comes back as
    /// `PasswordRequired` without consuming the flow.
    pub async fn complete_phone(
        &self,
        avatar_id: &str,
        phone: &str,
        code: &str,
        code_hash: &str,
        password: Option<&str>,
    ) -> Result<PhoneCompletion, CourierError> {
        let attempt_id = {
            let flows = self.flows.lock().await;
            match flows.get(avatar_id) {
                Some(AuthFlow::Phone(flow)) => flow.attempt_id.clone(),
                Some(AuthFlow::Qr(_)) => {
                    return Err(CourierError::AuthState(format!(
                        "qr login already in progress for avatar {avatar_id}"
                    )))
                }
                None => {
                    return Err(CourierError::AuthState(format!(
                        "no phone login in progress for avatar {avatar_id}"
                    )))
                }
            }
        };

        match self
            .platform
            .complete_phone_login(avatar_id, phone, code, code_hash, password)
            .await
        {
            Ok(PhoneLoginOutcome::PasswordRequired) => {
                debug!("phone login for {avatar_id} requires the account password");
                Ok(PhoneCompletion::PasswordRequired)
            }
            Ok(PhoneLoginOutcome::Authenticated { session, profile }) => {
                let mut profile = profile;
                profile.auth_method = Some("phone".to_string());
                let name = display_name(self.platform.name(), &profile);
                let user_id = profile.user_id;

                self.registry
                    .store_session(avatar_id, session, profile, name)
                    .await?;
                {
                    let mut flows = self.flows.lock().await;
                    if matches!(flows.get(avatar_id), Some(AuthFlow::Phone(f)) if f.attempt_id == attempt_id)
                    {
                        flows.remove(avatar_id);
                    }
                }
                self.registry
                    .audit()
                    .auth_event(
                        avatar_id,
                        "completed",
                        json!({ "method": "phone", "attempt_id": attempt_id, "user_id": user_id }),
                        AuditStatus::Success,
                        None,
                    )
                    .await?;
                info!("phone login completed for avatar {avatar_id}");
                Ok(PhoneCompletion::Authenticated)
            }
            Err(e) => {
                self.registry
                    .audit()
                    .auth_event(
                        avatar_id,
                        "failed",
                        json!({ "method": "phone", "attempt_id": attempt_id }),
                        AuditStatus::Failed,
                        Some(e.to_string()),
                    )
                    .await?;
                Err(e)
            }
        }
    }
}

/// Seconds until expiry, clamped at zero.
fn remaining_secs(expires_at: DateTime<Utc>) -> u64 {
    (expires_at - Utc::now()).num_seconds().max(0) as u64
}

/// Poll window for a token with `remaining` seconds of life. `None` means
/// the token is no longer worth polling and must be regenerated now. A
/// token living past the regeneration lead is polled up to that point; a
/// shorter-lived one gets a window shrunk to its remaining lifetime.
fn poll_window(remaining: u64, timing: &QrTiming) -> Option<u64> {
    if remaining < timing.min_usable_secs {
        None
    } else if remaining > timing.regen_lead_secs {
        Some(remaining - timing.regen_lead_secs)
    } else {
        Some(remaining)
    }
}

/// "Telegram - Ada" style avatar name derived from the login profile.
fn display_name(platform: &str, profile: &AvatarProfile) -> Option<String> {
    let first = profile.first_name.as_deref()?;
    let mut label = platform.to_string();
    if let Some(head) = label.get_mut(0..1) {
        head.make_ascii_uppercase();
    }
    Some(format!("{label} - {first}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use courier_core::model::{Avatar, AvatarStatus, Dialog, Sources};
    use courier_core::traits::QrToken;
    use courier_store::audit::HistoryQuery;
    use courier_store::AuditLog;
    use serde_json::Value;
    use std::collections::VecDeque;
    use std::path::Path;
    use std::sync::atomic::{AtomicBool, AtomicUsize};

    struct FakePlatform {
        token_ttl_secs: i64,
        begins: AtomicUsize,
        cancels: AtomicUsize,
        fail_begin: AtomicBool,
        poll_script: Mutex<VecDeque<QrPoll>>,
        complete_script: Mutex<VecDeque<Result<PhoneLoginOutcome, CourierError>>>,
    }

    impl FakePlatform {
        fn new(token_ttl_secs: i64) -> Arc<Self> {
            Arc::new(Self {
                token_ttl_secs,
                begins: AtomicUsize::new(0),
                cancels: AtomicUsize::new(0),
                fail_begin: AtomicBool::new(false),
                poll_script: Mutex::new(VecDeque::new()),
                complete_script: Mutex::new(VecDeque::new()),
            })
        }

        async fn script_polls(&self, outcomes: impl IntoIterator<Item = QrPoll>) {
            self.poll_script.lock().await.extend(outcomes);
        }

        async fn script_completions(
            &self,
            outcomes: impl IntoIterator<Item = Result<PhoneLoginOutcome, CourierError>>,
        ) {
            self.complete_script.lock().await.extend(outcomes);
        }

        fn begins(&self) -> usize {
            self.begins.load(Ordering::Relaxed)
        }

        fn cancels(&self) -> usize {
            self.cancels.load(Ordering::Relaxed)
        }
    }

    fn authenticated(session: &str) -> QrPoll {
        QrPoll::Authenticated {
            session: SessionHandle(session.to_string()),
            profile: AvatarProfile {
                user_id: Some(7),
                first_name: Some("Ada".to_string()),
                ..Default::default()
            },
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
            _limit: usize,
        ) -> Result<Vec<Dialog>, CourierError> {
            Ok(Vec::new())
        }

        async fn fetch_messages(
            &self,
            _session: &SessionHandle,
            _source_id: &str,
            _since_message_id: Option<i64>,
            _limit: usize,
        ) -> Result<Vec<Value>, CourierError> {
            Ok(Vec::new())
        }

        async fn begin_qr_login(&self, _avatar_id: &str) -> Result<QrToken, CourierError> {
            if self.fail_begin.load(Ordering::Relaxed) {
                return Err(CourierError::Platform("bridge unreachable".into()));
            }
            let n = self.begins.fetch_add(1, Ordering::Relaxed) + 1;
            Ok(QrToken {
                payload: format!("qr-{n}"),
                expires_at: Utc::now() + chrono::Duration::seconds(self.token_ttl_secs),
            })
        }

        async fn poll_qr_login(
            &self,
            _avatar_id: &str,
            _timeout_secs: u64,
        ) -> Result<QrPoll, CourierError> {
            let next = self.poll_script.lock().await.pop_front();
            match next {
                Some(outcome) => Ok(outcome),
                // An unscripted poll behaves like a held-open long poll.
                None => std::future::pending().await,
            }
        }

        async fn cancel_qr_login(&self, _avatar_id: &str) -> Result<(), CourierError> {
            self.cancels.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }

        async fn begin_phone_login(
            &self,
            _avatar_id: &str,
            _phone: &str,
        ) -> Result<String, CourierError> {
            Ok("code-hash-1".to_string())
        }

        async fn complete_phone_login(
            &self,
            _avatar_id: &str,
            _phone: &str,
            _code: &str,
            _code_hash: &str,
            _password: Option<&str>,
        ) -> Result<PhoneLoginOutcome, CourierError> {
            self.complete_script
                .lock()
                .await
                .pop_front()
                .unwrap_or_else(|| Err(CourierError::Platform("unscripted completion".into())))
        }

        async fn delete_session(&self, _session: &SessionHandle) -> Result<(), CourierError> {
            Ok(())
        }
    }

    fn test_avatar(id: &str) -> Avatar {
        Avatar {
            id: id.to_string(),
            name: format!("Avatar {id}"),
            platform: "telegram".to_string(),
            status: AvatarStatus::PendingAuth,
            session: None,
            phone: None,
            created_at: Utc::now(),
            last_used_at: None,
            profile: AvatarProfile::default(),
            sources: Sources::default(),
            cached_dialogs: None,
        }
    }

    async fn harness(
        dir: &Path,
        platform: Arc<FakePlatform>,
        timing: QrTiming,
    ) -> (SessionAuthenticator, Registry) {
        let audit = AuditLog::open(dir.join("history")).await.unwrap();
        let registry = Registry::open(dir, audit).await.unwrap();
        registry.upsert_avatar(test_avatar("av1")).await.unwrap();
        let auth = SessionAuthenticator::with_timing(platform, registry.clone(), timing);
        (auth, registry)
    }

    async fn wait_for_state(auth: &SessionAuthenticator, avatar_id: &str, target: &str) {
        for _ in 0..400 {
            let status = auth.status(avatar_id).await;
            if status.state == target {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        let status = auth.status(avatar_id).await;
        panic!(
            "timed out waiting for state {target}, flow is in {}",
            status.state
        );
    }

    #[tokio::test]
    async fn test_scan_confirmation_reaches_success_without_platform_cancel() {
        let dir = tempfile::tempdir().unwrap();
        let platform = FakePlatform::new(60);
        platform.script_polls([authenticated("session-blob")]).await;
        let (auth, registry) = harness(dir.path(), platform.clone(), QrTiming::default()).await;

        let status = auth.start_qr("av1").await.unwrap();
        assert_eq!(status.state, "ready");
        assert_eq!(status.payload.as_deref(), Some("qr-1"));
        assert!(status.expires_at.is_some());

        wait_for_state(&auth, "av1", "success").await;

        let avatar = registry.avatar("av1").await.unwrap().unwrap();
        assert_eq!(avatar.status, AvatarStatus::Connected);
        assert!(avatar.session_live());
        assert_eq!(avatar.name, "Telegram - Ada");
        assert_eq!(avatar.profile.auth_method.as_deref(), Some("qr"));
        assert_eq!(
            platform.cancels(),
            0,
            "no platform cancel may be issued once success is observed"
        );

        let q = HistoryQuery {
            event_type_prefix: Some("auth_".into()),
            ..Default::default()
        };
        let events = registry.audit().query(&q).await.unwrap();
        assert_eq!(events[0].event_type, "auth_completed");
        assert_eq!(events[1].event_type, "auth_started");
    }

    #[tokio::test]
    async fn test_two_poll_timeouts_cause_two_regenerations() {
        let dir = tempfile::tempdir().unwrap();
        let platform = FakePlatform::new(60);
        platform
            .script_polls([QrPoll::TimedOut, QrPoll::TimedOut, authenticated("blob")])
            .await;
        let (auth, _registry) = harness(dir.path(), platform.clone(), QrTiming::default()).await;

        auth.start_qr("av1").await.unwrap();
        wait_for_state(&auth, "av1", "success").await;

        assert_eq!(
            platform.begins(),
            3,
            "each regeneration must produce a fresh token"
        );
        assert_eq!(
            platform.cancels(),
            2,
            "each regeneration must cancel the previous token"
        );
    }

    #[tokio::test]
    async fn test_pending_poll_is_retried_until_confirmed() {
        let dir = tempfile::tempdir().unwrap();
        let platform = FakePlatform::new(60);
        platform
            .script_polls([QrPoll::Pending, authenticated("blob")])
            .await;
        let (auth, _registry) = harness(dir.path(), platform.clone(), QrTiming::default()).await;

        auth.start_qr("av1").await.unwrap();
        wait_for_state(&auth, "av1", "success").await;

        assert_eq!(platform.begins(), 1, "a pending poll must not regenerate");
        assert_eq!(platform.cancels(), 0);
    }

    #[tokio::test]
    async fn test_start_is_rejected_while_a_flow_is_live() {
        let dir = tempfile::tempdir().unwrap();
        let platform = FakePlatform::new(60);
        let (auth, _registry) = harness(dir.path(), platform.clone(), QrTiming::default()).await;

        auth.start_qr("av1").await.unwrap();

        let err = auth.start_qr("av1").await.unwrap_err();
        assert!(matches!(err, CourierError::AuthState(_)), "got: {err}");

        let err = auth.start_phone("av1", "+15550100").await.unwrap_err();
        assert!(matches!(err, CourierError::AuthState(_)), "got: {err}");

        auth.cancel("av1").await.unwrap();
        assert_eq!(auth.status("av1").await.state, "idle");

        let status = auth.start_qr("av1").await.unwrap();
        assert_eq!(status.payload.as_deref(), Some("qr-2"));
        auth.cancel("av1").await.unwrap();
    }

    #[tokio::test]
    async fn test_cancel_is_idempotent_from_any_state() {
        let dir = tempfile::tempdir().unwrap();
        let platform = FakePlatform::new(60);
        let (auth, _registry) = harness(dir.path(), platform.clone(), QrTiming::default()).await;

        auth.cancel("av1").await.unwrap();
        auth.cancel("never-started").await.unwrap();
        assert_eq!(platform.cancels(), 0, "cancelling an idle slot is a no-op");

        auth.start_qr("av1").await.unwrap();
        auth.cancel("av1").await.unwrap();
        assert_eq!(platform.cancels(), 1);
        assert_eq!(auth.status("av1").await.state, "idle");

        auth.cancel("av1").await.unwrap();
        assert_eq!(platform.cancels(), 1, "repeat cancel must not reach the platform");
    }

    #[tokio::test]
    async fn test_cancel_after_success_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        let platform = FakePlatform::new(60);
        platform.script_polls([authenticated("blob")]).await;
        let (auth, _registry) = harness(dir.path(), platform.clone(), QrTiming::default()).await;

        auth.start_qr("av1").await.unwrap();
        wait_for_state(&auth, "av1", "success").await;

        auth.cancel("av1").await.unwrap();
        assert_eq!(auth.status("av1").await.state, "success");
        assert_eq!(platform.cancels(), 0);
    }

    #[tokio::test]
    async fn test_stale_regeneration_is_a_noop_after_success() {
        let dir = tempfile::tempdir().unwrap();
        let platform = FakePlatform::new(60);
        platform.script_polls([authenticated("blob")]).await;
        let (auth, _registry) = harness(dir.path(), platform.clone(), QrTiming::default()).await;

        auth.start_qr("av1").await.unwrap();
        wait_for_state(&auth, "av1", "success").await;
        let begins_before = platform.begins();

        // Fire a stale callback by hand: generation 0 was retired when the
        // scan was confirmed.
        let outcome = auth.regenerate("av1", 0).await;
        assert!(outcome.is_none(), "a stale timer must not act");
        assert_eq!(platform.begins(), begins_before);
        assert_eq!(auth.status("av1").await.state, "success");
    }

    #[tokio::test]
    async fn test_error_state_allows_restart() {
        let dir = tempfile::tempdir().unwrap();
        let platform = FakePlatform::new(60);
        platform.fail_begin.store(true, Ordering::Relaxed);
        let (auth, _registry) = harness(dir.path(), platform.clone(), QrTiming::default()).await;

        let err = auth.start_qr("av1").await.unwrap_err();
        assert!(matches!(err, CourierError::Platform(_)), "got: {err}");
        let status = auth.status("av1").await;
        assert_eq!(status.state, "error");
        assert!(status.message.unwrap().contains("bridge unreachable"));

        platform.fail_begin.store(false, Ordering::Relaxed);
        let status = auth.start_qr("av1").await.unwrap();
        assert_eq!(status.state, "ready");
        auth.cancel("av1").await.unwrap();
    }

    #[tokio::test]
    async fn test_flow_deadline_parks_the_flow_in_error() {
        let dir = tempfile::tempdir().unwrap();
        let platform = FakePlatform::new(60);
        let timing = QrTiming {
            flow_deadline_secs: 0,
            ..Default::default()
        };
        let (auth, registry) = harness(dir.path(), platform.clone(), timing).await;

        auth.start_qr("av1").await.unwrap();
        wait_for_state(&auth, "av1", "error").await;

        assert_eq!(platform.cancels(), 1, "an expired attempt cancels its token");
        let q = HistoryQuery {
            event_type_prefix: Some("auth_timeout".into()),
            ..Default::default()
        };
        let events = registry.audit().query(&q).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].status, AuditStatus::Failed);
    }

    #[tokio::test]
    async fn test_start_qr_rejects_unknown_avatar() {
        let dir = tempfile::tempdir().unwrap();
        let platform = FakePlatform::new(60);
        let (auth, _registry) = harness(dir.path(), platform, QrTiming::default()).await;

        let err = auth.start_qr("ghost").await.unwrap_err();
        assert!(matches!(err, CourierError::Validation(_)), "got: {err}");
    }

    #[tokio::test]
    async fn test_phone_flow_with_second_factor() {
        let dir = tempfile::tempdir().unwrap();
        let platform = FakePlatform::new(60);
        platform
            .script_completions([
                Ok(PhoneLoginOutcome::PasswordRequired),
                Ok(PhoneLoginOutcome::Authenticated {
                    session: SessionHandle("phone-blob".into()),
                    profile: AvatarProfile {
                        user_id: Some(7),
                        first_name: Some("Ada".into()),
                        ..Default::default()
                    },
                }),
            ])
            .await;
        let (auth, registry) = harness(dir.path(), platform.clone(), QrTiming::default()).await;

        let code_hash = auth.start_phone("av1", "+15550100").await.unwrap();
        assert_eq!(code_hash, "code-hash-1");
        let status = auth.status("av1").await;
        assert_eq!(status.state, "code_requested");
        assert_eq!(status.phone.as_deref(), Some("+15550100"));

        let outcome = auth
            .complete_phone("av1", "+15550100", "12345", &code_hash, None)
            .await
            .unwrap();
        assert_eq!(outcome, PhoneCompletion::PasswordRequired);
        assert_eq!(
            auth.status("av1").await.state,
            "code_requested",
            "a second-factor challenge must not consume the flow"
        );

        let outcome = auth
            .complete_phone("av1", "+15550100", "12345", &code_hash, Some("hunter2"))
            .await
            .unwrap();
        assert_eq!(outcome, PhoneCompletion::Authenticated);
        assert_eq!(auth.status("av1").await.state, "idle");

        let avatar = registry.avatar("av1").await.unwrap().unwrap();
        assert!(avatar.session_live());
        assert_eq!(avatar.profile.auth_method.as_deref(), Some("phone"));
    }

    #[tokio::test]
    async fn test_phone_wrong_code_keeps_the_flow_alive() {
        let dir = tempfile::tempdir().unwrap();
        let platform = FakePlatform::new(60);
        platform
            .script_completions([
                Err(CourierError::Platform("code invalid".into())),
                Ok(PhoneLoginOutcome::Authenticated {
                    session: SessionHandle("phone-blob".into()),
                    profile: AvatarProfile::default(),
                }),
            ])
            .await;
        let (auth, _registry) = harness(dir.path(), platform, QrTiming::default()).await;

        let code_hash = auth.start_phone("av1", "+15550100").await.unwrap();
        let err = auth
            .complete_phone("av1", "+15550100", "00000", &code_hash, None)
            .await
            .unwrap_err();
        assert!(matches!(err, CourierError::Platform(_)), "got: {err}");
        assert_eq!(auth.status("av1").await.state, "code_requested");

        let outcome = auth
            .complete_phone("av1", "+15550100", "12345", &code_hash, None)
            .await
            .unwrap();
        assert_eq!(outcome, PhoneCompletion::Authenticated);
    }

    #[tokio::test]
    async fn test_complete_phone_without_start_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let platform = FakePlatform::new(60);
        let (auth, _registry) = harness(dir.path(), platform, QrTiming::default()).await;

        let err = auth
            .complete_phone("av1", "+15550100", "12345", "hash", None)
            .await
            .unwrap_err();
        assert!(matches!(err, CourierError::AuthState(_)), "got: {err}");
    }

    #[tokio::test]
    async fn test_phone_flow_blocks_qr_start() {
        let dir = tempfile::tempdir().unwrap();
        let platform = FakePlatform::new(60);
        let (auth, _registry) = harness(dir.path(), platform, QrTiming::default()).await;

        auth.start_phone("av1", "+15550100").await.unwrap();
        let err = auth.start_qr("av1").await.unwrap_err();
        assert!(matches!(err, CourierError::AuthState(_)), "got: {err}");
    }

    #[test]
    fn test_poll_window_rules() {
        let timing = QrTiming::default();
        assert_eq!(poll_window(60, &timing), Some(50), "poll up to the regen lead");
        assert_eq!(poll_window(10, &timing), Some(10), "short tokens shrink the window");
        assert_eq!(poll_window(7, &timing), Some(7));
        assert_eq!(poll_window(3, &timing), None, "nearly-dead tokens regenerate now");
        assert_eq!(poll_window(0, &timing), None);
    }

    #[test]
    fn test_display_name_from_profile() {
        let profile = AvatarProfile {
            first_name: Some("Ada".into()),
            ..Default::default()
        };
        assert_eq!(
            display_name("telegram", &profile).as_deref(),
            Some("Telegram - Ada")
        );
        assert_eq!(display_name("telegram", &AvatarProfile::default()), None);
    }
}
