use crate::{
    error::CourierError,
    model::{
        AvatarProfile, AvatarSync, Dialog, ExecutionReport, Job, SessionHandle, TokenVerification,
    },
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

/// A fresh QR login token from the platform.
#[derive(Debug, Clone)]
pub struct QrToken {
    /// Opaque payload to render as a QR code (login URL).
    pub payload: String,
    pub expires_at: DateTime<Utc>,
}

/// Outcome of one QR poll window.
#[derive(Debug, Clone)]
pub enum QrPoll {
    /// The window elapsed without a scan confirmation; the token may still
    /// be valid.
    Pending,
    /// The user approved the login; the platform handed over a session.
    Authenticated {
        session: SessionHandle,
        profile: AvatarProfile,
    },
    /// The token expired while waiting.
    TimedOut,
}

/// Outcome of completing a phone login.
#[derive(Debug, Clone)]
pub enum PhoneLoginOutcome {
    Authenticated {
        session: SessionHandle,
        profile: AvatarProfile,
    },
    /// The account has a second factor; retry `complete` with the password.
    PasswordRequired,
}

/// Platform capability — the hands.
///
/// One implementation per supported messaging platform. The wire protocol
/// lives behind this trait; the core only sees dialogs, messages, and
/// login primitives.
#[async_trait]
pub trait PlatformHandler: Send + Sync {
    /// Platform key, e.g. "telegram". Matches the command-grammar prefix.
    fn name(&self) -> &str;

    /// Fetch the avatar's dialog list (channels, groups, direct chats).
    async fn list_dialogs(
        &self,
        session: &SessionHandle,
        limit: usize,
    ) -> Result<Vec<Dialog>, CourierError>;

    /// Fetch messages from one source, newer than the given cursor.
    async fn fetch_messages(
        &self,
        session: &SessionHandle,
        source_id: &str,
        since_message_id: Option<i64>,
        limit: usize,
    ) -> Result<Vec<Value>, CourierError>;

    /// Request a fresh QR login token for an avatar.
    async fn begin_qr_login(&self, avatar_id: &str) -> Result<QrToken, CourierError>;

    /// Wait up to `timeout_secs` for the QR token to be scanned and approved.
    async fn poll_qr_login(
        &self,
        avatar_id: &str,
        timeout_secs: u64,
    ) -> Result<QrPoll, CourierError>;

    /// Invalidate an outstanding QR token.
    async fn cancel_qr_login(&self, avatar_id: &str) -> Result<(), CourierError>;

    /// Send a verification code to a phone number. Returns the opaque
    /// code-hash required to complete the login.
    async fn begin_phone_login(
        &self,
        avatar_id: &str,
        phone: &str,
    ) -> Result<String, CourierError>;

    /// Submit the verification code (and the account password when a second
    /// factor is enabled).
    async fn complete_phone_login(
        &self,
        avatar_id: &str,
        phone: &str,
        code: &str,
        code_hash: &str,
        password: Option<&str>,
    ) -> Result<PhoneLoginOutcome, CourierError>;

    /// Tear down the platform-side session for an avatar.
    async fn delete_session(&self, session: &SessionHandle) -> Result<(), CourierError>;
}

/// Backend capability — the employer.
///
/// Transport to the remote backend that issues jobs and collects results.
#[async_trait]
pub trait BackendClient: Send + Sync {
    /// Verify the agent token and report capabilities. A transport failure
    /// is a `NetworkError`; an explicit rejection comes back as
    /// `accepted = false`.
    async fn verify_token(&self) -> Result<TokenVerification, CourierError>;

    /// Fetch pending jobs for all avatars.
    async fn fetch_jobs(&self) -> Result<Vec<Job>, CourierError>;

    /// Submit one execution report.
    async fn submit_result(&self, report: &ExecutionReport) -> Result<(), CourierError>;

    /// Push the avatar snapshot (sessions excluded).
    async fn sync_avatars(&self, avatars: &[AvatarSync]) -> Result<(), CourierError>;

    /// Cheap reachability probe.
    async fn health_check(&self) -> bool;
}
