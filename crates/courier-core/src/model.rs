//! Domain model: avatars, sources, jobs, runtime documents, and the
//! payloads exchanged with the backend.
//!
//! The three runtime documents (`AgentConfigDoc`, `AvatarsDoc`,
//! `BlacklistDoc`) are persisted as whole JSON files; everything here
//! round-trips through serde.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// How long a successful token verification stays fresh.
pub const VERIFICATION_WINDOW_HOURS: i64 = 24;

/// Lifecycle status of an avatar's platform session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AvatarStatus {
    /// Session is live and usable for jobs.
    Connected,
    /// Session was rejected once; a re-login is needed.
    PendingAuth,
    /// Re-login also failed, or the session was removed.
    Disconnected,
}

impl AvatarStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connected => "connected",
            Self::PendingAuth => "pending_auth",
            Self::Disconnected => "disconnected",
        }
    }

    /// Status escalation after a platform auth failure: a first failure
    /// demands re-auth, a failure while already pending gives up.
    pub fn after_auth_failure(&self) -> AvatarStatus {
        match self {
            Self::Connected => Self::PendingAuth,
            Self::PendingAuth | Self::Disconnected => Self::Disconnected,
        }
    }
}

/// Opaque platform session credential. Never serialized into backend
/// payloads or upward listings; `Debug` masks the contents.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionHandle(pub String);

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionHandle(***)")
    }
}

/// Profile details captured at login time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AvatarProfile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
    /// "qr" or "phone".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_method: Option<String>,
}

/// A locally-held platform identity the agent acts on behalf of.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Avatar {
    pub id: String,
    pub name: String,
    /// Platform key, e.g. "telegram".
    pub platform: String,
    pub status: AvatarStatus,
    /// Live session credential. Present only while a login is valid.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<SessionHandle>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_used_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub profile: AvatarProfile,
    #[serde(default)]
    pub sources: Sources,
    /// Dialog list from the last platform fetch, served until a refresh
    /// is forced.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cached_dialogs: Option<Vec<Dialog>>,
}

impl Avatar {
    /// Whether the avatar has a session the executor may dispatch against.
    pub fn session_live(&self) -> bool {
        self.status == AvatarStatus::Connected && self.session.is_some()
    }
}

/// Per-avatar source subscriptions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sources {
    pub enabled: bool,
    pub items: Vec<Source>,
}

impl Default for Sources {
    fn default() -> Self {
        Self {
            enabled: true,
            items: Vec::new(),
        }
    }
}

/// A subscribed dialog/channel polled for messages on a schedule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Source {
    pub id: String,
    pub name: String,
    /// "channel", "group", or "user".
    #[serde(default = "default_source_kind", rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    pub frequency_seconds: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_checked_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message_id: Option<i64>,
}

impl Source {
    /// Whether this source is due for a poll at `now`.
    ///
    /// Due when never checked, or when its frequency has elapsed since the
    /// last check.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        match self.last_checked_at {
            None => true,
            Some(checked) => {
                let elapsed = now.signed_duration_since(checked);
                elapsed >= Duration::seconds(self.frequency_seconds as i64)
            }
        }
    }
}

fn default_source_kind() -> String {
    "channel".to_string()
}

/// The enumerated polling frequencies a source may use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollFrequency {
    M5,
    M10,
    M15,
    M30,
    H1,
    H2,
    H4,
    H6,
    H12,
    H24,
}

impl PollFrequency {
    pub const ALL: [PollFrequency; 10] = [
        Self::M5,
        Self::M10,
        Self::M15,
        Self::M30,
        Self::H1,
        Self::H2,
        Self::H4,
        Self::H6,
        Self::H12,
        Self::H24,
    ];

    /// Default source frequency (5 minutes).
    pub const DEFAULT: PollFrequency = Self::M5;

    pub fn seconds(&self) -> u64 {
        match self {
            Self::M5 => 300,
            Self::M10 => 600,
            Self::M15 => 900,
            Self::M30 => 1800,
            Self::H1 => 3600,
            Self::H2 => 7200,
            Self::H4 => 14400,
            Self::H6 => 21600,
            Self::H12 => 43200,
            Self::H24 => 86400,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::M5 => "5min",
            Self::M10 => "10min",
            Self::M15 => "15min",
            Self::M30 => "30min",
            Self::H1 => "1h",
            Self::H2 => "2h",
            Self::H4 => "4h",
            Self::H6 => "6h",
            Self::H12 => "12h",
            Self::H24 => "24h",
        }
    }

    /// Map a second count back to a preset. `None` means the value is not
    /// an allowed frequency.
    pub fn from_seconds(seconds: u64) -> Option<PollFrequency> {
        Self::ALL.iter().copied().find(|f| f.seconds() == seconds)
    }

    /// Label → seconds map for the upward surface.
    pub fn presets() -> BTreeMap<&'static str, u64> {
        Self::ALL.iter().map(|f| (f.label(), f.seconds())).collect()
    }
}

/// A dialog entry returned by the platform (channel, group, or direct chat).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dialog {
    pub id: i64,
    pub name: String,
    /// "channel", "group", or "user".
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub members_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub photo_url: Option<String>,
}

/// A unit of work fetched from the backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub job_id: String,
    pub avatar_id: String,
    /// Command grammar: `"<platform>.<operation>"`.
    pub command: String,
    #[serde(default)]
    pub params: Value,
}

/// Error detail attached to a failed execution report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportError {
    #[serde(rename = "type")]
    pub kind: String,
    pub message: String,
}

/// Result of one job execution, as submitted to the backend.
///
/// Filtered-out items never appear here; only the kept items and counts do.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub job_id: String,
    pub avatar_id: String,
    pub success: bool,
    pub execution_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items_count: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filtered_count: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ReportError>,
}

/// Runtime agent configuration document (`config.json`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentConfigDoc {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verified_at: Option<DateTime<Utc>>,
    /// Backend-pushed platform configuration, stored verbatim.
    #[serde(default)]
    pub platform_config: Value,
}

impl AgentConfigDoc {
    pub fn is_configured(&self) -> bool {
        self.token.as_deref().is_some_and(|t| !t.is_empty())
    }

    /// Verified means a successful verification within the last 24 hours.
    pub fn is_verified(&self, now: DateTime<Utc>) -> bool {
        match self.verified_at {
            Some(at) => now.signed_duration_since(at) < Duration::hours(VERIFICATION_WINDOW_HOURS),
            None => false,
        }
    }
}

/// Avatar collection document (`avatars.json`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AvatarsDoc {
    #[serde(default)]
    pub avatars: Vec<Avatar>,
}

/// One scope of blacklist rules.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuleSet {
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub senders: Vec<String>,
    #[serde(default)]
    pub channels: Vec<String>,
}

impl RuleSet {
    pub fn is_empty(&self) -> bool {
        self.keywords.is_empty() && self.senders.is_empty() && self.channels.is_empty()
    }
}

/// Blacklist document (`blacklist.json`): global rules plus per-avatar rules.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BlacklistDoc {
    #[serde(default)]
    pub global: RuleSet,
    #[serde(default)]
    pub by_avatar: BTreeMap<String, RuleSet>,
}

impl BlacklistDoc {
    /// The effective rule scope for one avatar: the union of global and
    /// avatar-specific rules, sorted and deduplicated so the merge is
    /// deterministic.
    pub fn scope_for(&self, avatar_id: &str) -> RuleSet {
        let mut scope = self.global.clone();
        if let Some(extra) = self.by_avatar.get(avatar_id) {
            scope.keywords.extend(extra.keywords.iter().cloned());
            scope.senders.extend(extra.senders.iter().cloned());
            scope.channels.extend(extra.channels.iter().cloned());
        }
        for list in [
            &mut scope.keywords,
            &mut scope.senders,
            &mut scope.channels,
        ] {
            list.sort();
            list.dedup();
        }
        scope
    }
}

/// Backend response to a token verification.
#[derive(Debug, Clone)]
pub struct TokenVerification {
    pub accepted: bool,
    /// Platform configuration pushed by the backend, when present.
    pub platform_config: Option<Value>,
}

/// One source entry inside the avatar sync payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncSource {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub frequency_seconds: u64,
}

/// Metadata block of the avatar sync payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_used_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    pub sources_enabled: bool,
    pub sources: Vec<SyncSource>,
}

/// Avatar snapshot sent to the backend. The session handle never appears.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AvatarSync {
    pub id: String,
    pub name: String,
    pub platform: String,
    pub status: String,
    pub metadata: SyncMetadata,
}

impl AvatarSync {
    pub fn from_avatar(avatar: &Avatar) -> Self {
        Self {
            id: avatar.id.clone(),
            name: avatar.name.clone(),
            platform: avatar.platform.clone(),
            status: avatar.status.as_str().to_string(),
            metadata: SyncMetadata {
                phone: avatar.phone.clone(),
                created_at: avatar.created_at,
                last_used_at: avatar.last_used_at,
                user_id: avatar.profile.user_id,
                username: avatar.profile.username.clone(),
                sources_enabled: avatar.sources.enabled,
                sources: avatar
                    .sources
                    .items
                    .iter()
                    .map(|s| SyncSource {
                        id: s.id.clone(),
                        name: s.name.clone(),
                        kind: s.kind.clone(),
                        frequency_seconds: s.frequency_seconds,
                    })
                    .collect(),
            },
        }
    }
}

/// Agent status surface merged from loop state and the runtime documents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentStatus {
    pub running: bool,
    pub verified: bool,
    pub backend_reachable: bool,
    pub configured: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_poll_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_avatar_sync_at: Option<DateTime<Utc>>,
    pub jobs_executed: u64,
}

/// Mask an agent token for display: enough prefix to recognize it, never
/// enough to replay it.
pub fn mask_token(token: &str) -> String {
    if token.chars().count() > 12 {
        let prefix: String = token.chars().take(12).collect();
        format!("{prefix}...")
    } else if token.is_empty() {
        String::new()
    } else {
        "***".to_string()
    }
}
