//! Telegram bridge client.
//!
//! MTProto sessions are owned by a local bridge daemon; Courier drives it
//! over loopback HTTP. Every call posts JSON and reads back an
//! `{ok, result, description}` envelope.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use courier_core::config::TelegramBridgeConfig;
use courier_core::error::CourierError;
use courier_core::model::{AvatarProfile, Dialog, SessionHandle};
use courier_core::traits::{PhoneLoginOutcome, PlatformHandler, QrPoll, QrToken};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;

/// Extra headroom over the bridge-side poll window.
const POLL_TIMEOUT_MARGIN_SECS: u64 = 5;

pub struct TelegramBridge {
    config: TelegramBridgeConfig,
    client: reqwest::Client,
}

impl TelegramBridge {
    pub fn new(config: TelegramBridgeConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(self.config.request_timeout_secs)
    }

    /// POST a request and unwrap the envelope, requiring a result payload.
    async fn call<B, T>(&self, path: &str, body: &B, timeout: Duration) -> Result<T, CourierError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let envelope = self.post::<B, T>(path, body, timeout).await?;
        envelope
            .result
            .ok_or_else(|| CourierError::Platform(format!("bridge {path} returned no result")))
    }

    /// POST a request where only the ok/error outcome matters.
    async fn call_unit<B>(&self, path: &str, body: &B) -> Result<(), CourierError>
    where
        B: Serialize + ?Sized,
    {
        self.post::<B, Value>(path, body, self.timeout()).await?;
        Ok(())
    }

    async fn post<B, T>(
        &self,
        path: &str,
        body: &B,
        timeout: Duration,
    ) -> Result<BridgeResponse<T>, CourierError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let url = format!("{}{}", self.config.bridge_url.trim_end_matches('/'), path);
        let resp = self
            .client
            .post(&url)
            .json(body)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| CourierError::Platform(format!("bridge {path} failed: {e}")))?;

        let status = resp.status();
        let envelope: BridgeResponse<T> = resp
            .json()
            .await
            .map_err(|e| CourierError::Platform(format!("bridge {path} parse failed: {e}")))?;

        if !envelope.ok {
            return Err(bridge_error(
                path,
                status,
                &envelope.description.unwrap_or_default(),
            ));
        }
        Ok(envelope)
    }
}

/// Map a bridge refusal to the error taxonomy. The bridge signals a dead or
/// revoked session with 401; everything else is a platform fault.
fn bridge_error(path: &str, status: reqwest::StatusCode, description: &str) -> CourierError {
    if status == reqwest::StatusCode::UNAUTHORIZED {
        CourierError::SessionUnavailable(format!("bridge {path}: {description}"))
    } else {
        CourierError::Platform(format!("bridge {path} returned {status}: {description}"))
    }
}

#[async_trait]
impl PlatformHandler for TelegramBridge {
    fn name(&self) -> &str {
        "telegram"
    }

    async fn list_dialogs(
        &self,
        session: &SessionHandle,
        limit: usize,
    ) -> Result<Vec<Dialog>, CourierError> {
        let body = json!({ "session": session, "limit": limit });
        self.call("/dialogs", &body, self.timeout()).await
    }

    async fn fetch_messages(
        &self,
        session: &SessionHandle,
        source_id: &str,
        since_message_id: Option<i64>,
        limit: usize,
    ) -> Result<Vec<Value>, CourierError> {
        let body = json!({
            "session": session,
            "source_id": source_id,
            "since_message_id": since_message_id,
            "limit": limit,
        });
        self.call("/messages", &body, self.timeout()).await
    }

    async fn begin_qr_login(&self, avatar_id: &str) -> Result<QrToken, CourierError> {
        let body = json!({ "avatar_id": avatar_id });
        let result: QrBeginResult = self.call("/auth/qr/begin", &body, self.timeout()).await?;
        debug!("qr token for {avatar_id} expires at {}", result.expires_at);
        Ok(QrToken {
            payload: result.payload,
            expires_at: result.expires_at,
        })
    }

    async fn poll_qr_login(
        &self,
        avatar_id: &str,
        timeout_secs: u64,
    ) -> Result<QrPoll, CourierError> {
        let body = json!({ "avatar_id": avatar_id, "timeout_secs": timeout_secs });
        // The bridge holds the request open for the whole window.
        let timeout = Duration::from_secs(timeout_secs + POLL_TIMEOUT_MARGIN_SECS);
        let result: QrPollResult = self.call("/auth/qr/poll", &body, timeout).await?;
        qr_poll_outcome(result)
    }

    async fn cancel_qr_login(&self, avatar_id: &str) -> Result<(), CourierError> {
        self.call_unit("/auth/qr/cancel", &json!({ "avatar_id": avatar_id }))
            .await
    }

    async fn begin_phone_login(
        &self,
        avatar_id: &str,
        phone: &str,
    ) -> Result<String, CourierError> {
        let body = json!({ "avatar_id": avatar_id, "phone": phone });
        let result: PhoneBeginResult = self.call("/auth/phone/begin", &body, self.timeout()).await?;
        Ok(result.code_hash)
    }

    async fn complete_phone_login(
        &self,
        avatar_id: &str,
        phone: &str,
        code: &str,
        code_hash: &str,
        password: Option<&str>,
    ) -> Result<PhoneLoginOutcome, CourierError> {
        let body = json!({
            "avatar_id": avatar_id,
            "phone": phone,
            "code": code,
            "code_hash": code_hash,
            "password": password,
        });
        let result: PhoneCompleteResult = self
            .call("/auth/phone/complete", &body, self.timeout())
            .await?;
        phone_login_outcome(result)
    }

    async fn delete_session(&self, session: &SessionHandle) -> Result<(), CourierError> {
        self.call_unit("/session/delete", &json!({ "session": session }))
            .await
    }
}

fn qr_poll_outcome(result: QrPollResult) -> Result<QrPoll, CourierError> {
    match result.status.as_str() {
        "authenticated" => {
            let session = result.session.ok_or_else(|| {
                CourierError::Platform("bridge reported authenticated without a session".into())
            })?;
            Ok(QrPoll::Authenticated {
                session: SessionHandle(session),
                profile: result.profile.unwrap_or_default(),
            })
        }
        "timeout" => Ok(QrPoll::TimedOut),
        "pending" => Ok(QrPoll::Pending),
        other => Err(CourierError::Platform(format!(
            "bridge returned unknown qr status: {other}"
        ))),
    }
}

fn phone_login_outcome(result: PhoneCompleteResult) -> Result<PhoneLoginOutcome, CourierError> {
    match result.status.as_str() {
        "authenticated" => {
            let session = result.session.ok_or_else(|| {
                CourierError::Platform("bridge reported authenticated without a session".into())
            })?;
            Ok(PhoneLoginOutcome::Authenticated {
                session: SessionHandle(session),
                profile: result.profile.unwrap_or_default(),
            })
        }
        "password_required" => Ok(PhoneLoginOutcome::PasswordRequired),
        other => Err(CourierError::Platform(format!(
            "bridge returned unknown login status: {other}"
        ))),
    }
}

// ---------- bridge wire types ----------

#[derive(Debug, Deserialize)]
struct BridgeResponse<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct QrBeginResult {
    payload: String,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct QrPollResult {
    status: String,
    session: Option<String>,
    profile: Option<AvatarProfile>,
}

#[derive(Debug, Deserialize)]
struct PhoneBeginResult {
    code_hash: String,
}

#[derive(Debug, Deserialize)]
struct PhoneCompleteResult {
    status: String,
    session: Option<String>,
    profile: Option<AvatarProfile>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_parses_error_shape() {
        let json = r#"{"ok": false, "description": "session revoked"}"#;
        let envelope: BridgeResponse<Vec<Dialog>> = serde_json::from_str(json).unwrap();
        assert!(!envelope.ok);
        assert!(envelope.result.is_none());
        assert_eq!(envelope.description.as_deref(), Some("session revoked"));
    }

    #[test]
    fn test_bridge_error_distinguishes_dead_sessions() {
        let err = bridge_error(
            "/messages",
            reqwest::StatusCode::UNAUTHORIZED,
            "session revoked",
        );
        assert!(matches!(err, CourierError::SessionUnavailable(_)), "got: {err}");

        let err = bridge_error(
            "/messages",
            reqwest::StatusCode::INTERNAL_SERVER_ERROR,
            "flood wait",
        );
        assert!(matches!(err, CourierError::Platform(_)), "got: {err}");
    }

    #[test]
    fn test_envelope_parses_dialog_list() {
        let json = r#"{
            "ok": true,
            "result": [
                {"id": -1001234, "name": "Rust News", "type": "channel",
                 "username": "rustnews", "members_count": 4200},
                {"id": 777, "name": "Ada", "type": "user"}
            ]
        }"#;
        let envelope: BridgeResponse<Vec<Dialog>> = serde_json::from_str(json).unwrap();
        let dialogs = envelope.result.unwrap();
        assert_eq!(dialogs.len(), 2);
        assert_eq!(dialogs[0].id, -1001234);
        assert_eq!(dialogs[0].kind, "channel");
        assert_eq!(dialogs[1].members_count, None);
    }

    #[test]
    fn test_qr_poll_outcome_mapping() {
        let pending: QrPollResult =
            serde_json::from_str(r#"{"status": "pending"}"#).unwrap();
        assert!(matches!(qr_poll_outcome(pending), Ok(QrPoll::Pending)));

        let timed_out: QrPollResult =
            serde_json::from_str(r#"{"status": "timeout"}"#).unwrap();
        assert!(matches!(qr_poll_outcome(timed_out), Ok(QrPoll::TimedOut)));

        let authed: QrPollResult = serde_json::from_str(
            r#"{"status": "authenticated", "session": "blob",
                "profile": {"user_id": 7, "first_name": "Ada"}}"#,
        )
        .unwrap();
        match qr_poll_outcome(authed).unwrap() {
            QrPoll::Authenticated { session, profile } => {
                assert_eq!(session, SessionHandle("blob".into()));
                assert_eq!(profile.first_name.as_deref(), Some("Ada"));
            }
            other => panic!("expected authenticated, got {other:?}"),
        }
    }

    #[test]
    fn test_qr_poll_authenticated_without_session_is_an_error() {
        let broken: QrPollResult =
            serde_json::from_str(r#"{"status": "authenticated"}"#).unwrap();
        let err = qr_poll_outcome(broken).unwrap_err();
        assert!(matches!(err, CourierError::Platform(_)), "got: {err}");
    }

    #[test]
    fn test_phone_outcome_password_required() {
        let result: PhoneCompleteResult =
            serde_json::from_str(r#"{"status": "password_required"}"#).unwrap();
        assert!(matches!(
            phone_login_outcome(result),
            Ok(PhoneLoginOutcome::PasswordRequired)
        ));
    }

    #[test]
    fn test_phone_outcome_rejects_unknown_status() {
        let result: PhoneCompleteResult =
            serde_json::from_str(r#"{"status": "weird"}"#).unwrap();
        assert!(phone_login_outcome(result).is_err());
    }
}
