//! Registry — the agent's runtime documents behind one typed surface.
//!
//! Wraps the three durable documents (`config.json`, `avatars.json`,
//! `blacklist.json`) and threads every mutation through the audit log.
//! Mutations that change what the backend sees raise the status-dirty
//! flag so the next loop tick syncs immediately.

use crate::audit::{AuditLog, AuditStatus};
use crate::store::JsonStore;
use chrono::Utc;
use courier_core::error::CourierError;
use courier_core::model::{
    mask_token, AgentConfigDoc, Avatar, AvatarProfile, AvatarStatus, AvatarsDoc, BlacklistDoc,
    Dialog, PollFrequency, RuleSet, SessionHandle, Source,
};
use serde::Serialize;
use serde_json::{json, Value};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Partial update for one source; unset fields keep their value.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SourceUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frequency_seconds: Option<u64>,
}

#[derive(Clone)]
pub struct Registry {
    config: JsonStore,
    avatars: JsonStore,
    blacklist: JsonStore,
    audit: AuditLog,
    status_dirty: Arc<AtomicBool>,
}

impl Registry {
    /// Bind the registry to a data directory, creating the documents with
    /// their defaults on first use.
    pub async fn open(data_dir: &Path, audit: AuditLog) -> Result<Self, CourierError> {
        let config = JsonStore::open(data_dir.join("config.json")).await?;
        let avatars = JsonStore::open(data_dir.join("avatars.json")).await?;
        let blacklist = JsonStore::open(data_dir.join("blacklist.json")).await?;

        config.load_or_init::<AgentConfigDoc>().await?;
        avatars.load_or_init::<AvatarsDoc>().await?;
        blacklist.load_or_init::<BlacklistDoc>().await?;

        Ok(Self {
            config,
            avatars,
            blacklist,
            audit,
            status_dirty: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    // ---------- agent config ----------

    pub async fn config_doc(&self) -> Result<AgentConfigDoc, CourierError> {
        self.config.load_or_init().await
    }

    pub async fn token(&self) -> Result<Option<String>, CourierError> {
        Ok(self.config_doc().await?.token)
    }

    pub async fn masked_token(&self) -> Result<String, CourierError> {
        Ok(mask_token(self.token().await?.as_deref().unwrap_or("")))
    }

    /// Store a new agent token. Clears the verification timestamp so the
    /// loop re-verifies before fetching jobs again. The audit trail only
    /// ever sees the masked form.
    pub async fn set_token(&self, token: &str) -> Result<(), CourierError> {
        if token.trim().is_empty() {
            return Err(CourierError::Validation("token must not be empty".into()));
        }
        let token = token.trim().to_string();
        let masked = mask_token(&token);
        self.config
            .update::<AgentConfigDoc, _, _>(|doc| {
                doc.token = Some(token);
                doc.verified_at = None;
            })
            .await?;
        self.audit
            .system_event(
                "token",
                "agent",
                "updated",
                json!({ "token": masked }),
                AuditStatus::Success,
                None,
            )
            .await
    }

    pub async fn is_configured(&self) -> Result<bool, CourierError> {
        Ok(self.config_doc().await?.is_configured())
    }

    pub async fn is_verified(&self) -> Result<bool, CourierError> {
        Ok(self.config_doc().await?.is_verified(Utc::now()))
    }

    /// Record a successful backend verification, keeping any pushed
    /// platform configuration.
    pub async fn mark_verified(&self, platform_config: Option<Value>) -> Result<(), CourierError> {
        self.config
            .update::<AgentConfigDoc, _, _>(|doc| {
                doc.verified_at = Some(Utc::now());
                if let Some(cfg) = platform_config {
                    doc.platform_config = cfg;
                }
            })
            .await?;
        self.audit
            .system_event(
                "token",
                "agent",
                "verified",
                Value::Null,
                AuditStatus::Success,
                None,
            )
            .await
    }

    /// Record an explicit backend rejection of the token.
    pub async fn mark_unverified(&self, reason: &str) -> Result<(), CourierError> {
        self.config
            .update::<AgentConfigDoc, _, _>(|doc| {
                doc.verified_at = None;
            })
            .await?;
        self.audit
            .system_event(
                "token",
                "agent",
                "verification_failed",
                Value::Null,
                AuditStatus::Failed,
                Some(reason.to_string()),
            )
            .await
    }

    // ---------- avatars ----------

    pub async fn avatars(&self) -> Result<Vec<Avatar>, CourierError> {
        Ok(self.avatars.load_or_init::<AvatarsDoc>().await?.avatars)
    }

    pub async fn avatar(&self, avatar_id: &str) -> Result<Option<Avatar>, CourierError> {
        Ok(self
            .avatars()
            .await?
            .into_iter()
            .find(|a| a.id == avatar_id))
    }

    /// Create or replace an avatar. On replace the original creation time
    /// is preserved.
    pub async fn upsert_avatar(&self, avatar: Avatar) -> Result<Avatar, CourierError> {
        if avatar.id.trim().is_empty() {
            return Err(CourierError::Validation("avatar id must not be empty".into()));
        }
        let stored = self
            .avatars
            .update::<AvatarsDoc, _, _>(|doc| {
                match doc.avatars.iter_mut().find(|a| a.id == avatar.id) {
                    Some(existing) => {
                        let created_at = existing.created_at;
                        *existing = avatar;
                        existing.created_at = created_at;
                        (existing.clone(), "updated")
                    }
                    None => {
                        let stored = avatar.clone();
                        doc.avatars.push(avatar);
                        (stored, "created")
                    }
                }
            })
            .await?;
        let (avatar, action) = stored;
        self.mark_dirty();
        self.audit
            .avatar_event(
                &avatar.id,
                action,
                json!({
                    "name": avatar.name,
                    "platform": avatar.platform,
                    "status": avatar.status.as_str(),
                }),
            )
            .await?;
        Ok(avatar)
    }

    /// Remove an avatar, returning it so the caller can tear down its
    /// platform session.
    pub async fn delete_avatar(&self, avatar_id: &str) -> Result<Option<Avatar>, CourierError> {
        let removed = self
            .avatars
            .update::<AvatarsDoc, _, _>(|doc| {
                let pos = doc.avatars.iter().position(|a| a.id == avatar_id)?;
                Some(doc.avatars.remove(pos))
            })
            .await?;
        if let Some(avatar) = &removed {
            self.mark_dirty();
            self.audit
                .avatar_event(avatar_id, "deleted", json!({ "name": avatar.name }))
                .await?;
        }
        Ok(removed)
    }

    /// Set an avatar's status. No-op when the avatar is missing or already
    /// in that status.
    pub async fn update_avatar_status(
        &self,
        avatar_id: &str,
        status: AvatarStatus,
    ) -> Result<bool, CourierError> {
        let old = self
            .avatars
            .update::<AvatarsDoc, _, _>(|doc| {
                let avatar = doc.avatars.iter_mut().find(|a| a.id == avatar_id)?;
                if avatar.status == status {
                    return None;
                }
                let old = avatar.status;
                avatar.status = status;
                Some(old)
            })
            .await?;
        match old {
            Some(old) => {
                self.mark_dirty();
                self.audit
                    .avatar_event(
                        avatar_id,
                        "status_changed",
                        json!({
                            "old_status": old.as_str(),
                            "new_status": status.as_str(),
                        }),
                    )
                    .await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Demote an avatar after an authentication failure. Connected drops to
    /// pending re-auth; anything already degraded drops to disconnected.
    pub async fn escalate_auth_failure(
        &self,
        avatar_id: &str,
    ) -> Result<Option<AvatarStatus>, CourierError> {
        let transition = self
            .avatars
            .update::<AvatarsDoc, _, _>(|doc| {
                let avatar = doc.avatars.iter_mut().find(|a| a.id == avatar_id)?;
                let old = avatar.status;
                let new = old.after_auth_failure();
                if new == old {
                    return None;
                }
                avatar.status = new;
                Some((old, new))
            })
            .await?;
        match transition {
            Some((old, new)) => {
                self.mark_dirty();
                self.audit
                    .avatar_event(
                        avatar_id,
                        "status_changed",
                        json!({
                            "old_status": old.as_str(),
                            "new_status": new.as_str(),
                            "cause": "auth_failure",
                        }),
                    )
                    .await?;
                Ok(Some(new))
            }
            None => Ok(None),
        }
    }

    /// Attach a fresh session after a completed login. Connects the avatar
    /// and optionally renames it from the profile.
    pub async fn store_session(
        &self,
        avatar_id: &str,
        session: SessionHandle,
        profile: AvatarProfile,
        display_name: Option<String>,
    ) -> Result<(), CourierError> {
        let old_status = self
            .avatars
            .update::<AvatarsDoc, _, _>(|doc| {
                let avatar = doc.avatars.iter_mut().find(|a| a.id == avatar_id)?;
                let old = avatar.status;
                avatar.session = Some(session);
                avatar.profile = profile;
                avatar.status = AvatarStatus::Connected;
                avatar.last_used_at = Some(Utc::now());
                if let Some(name) = display_name {
                    avatar.name = name;
                }
                Some(old)
            })
            .await?;
        let old =
            old_status.ok_or_else(|| CourierError::Validation(format!("unknown avatar {avatar_id}")))?;
        self.mark_dirty();
        if old != AvatarStatus::Connected {
            self.audit
                .avatar_event(
                    avatar_id,
                    "status_changed",
                    json!({
                        "old_status": old.as_str(),
                        "new_status": AvatarStatus::Connected.as_str(),
                    }),
                )
                .await?;
        }
        Ok(())
    }

    /// Detach the session, returning the handle so the caller can revoke it
    /// platform-side.
    pub async fn clear_session(
        &self,
        avatar_id: &str,
    ) -> Result<Option<SessionHandle>, CourierError> {
        let cleared = self
            .avatars
            .update::<AvatarsDoc, _, _>(|doc| {
                let avatar = doc.avatars.iter_mut().find(|a| a.id == avatar_id)?;
                avatar.status = AvatarStatus::Disconnected;
                avatar.session.take()
            })
            .await?;
        if cleared.is_some() {
            self.mark_dirty();
            self.audit
                .avatar_event(avatar_id, "session_cleared", Value::Null)
                .await?;
        }
        Ok(cleared)
    }

    pub async fn mark_avatar_used(&self, avatar_id: &str) -> Result<(), CourierError> {
        self.avatars
            .update::<AvatarsDoc, _, _>(|doc| {
                if let Some(avatar) = doc.avatars.iter_mut().find(|a| a.id == avatar_id) {
                    avatar.last_used_at = Some(Utc::now());
                }
            })
            .await
    }

    /// Take the dirty flag, clearing it. The loop calls this each tick to
    /// decide whether an out-of-cadence sync is needed.
    pub fn consume_status_dirty(&self) -> bool {
        self.status_dirty.swap(false, Ordering::Relaxed)
    }

    fn mark_dirty(&self) {
        self.status_dirty.store(true, Ordering::Relaxed);
    }

    // ---------- sources ----------

    /// Add a source to an avatar. The frequency must be one of the presets
    /// and the id must be new; either failure leaves the document untouched.
    pub async fn add_source(&self, avatar_id: &str, source: Source) -> Result<Source, CourierError> {
        if source.id.trim().is_empty() {
            return Err(CourierError::Validation("source id must not be empty".into()));
        }
        if PollFrequency::from_seconds(source.frequency_seconds).is_none() {
            return Err(CourierError::Validation(format!(
                "unsupported poll frequency: {}s",
                source.frequency_seconds
            )));
        }
        let added = self
            .avatars
            .update::<AvatarsDoc, _, _>(|doc| {
                let avatar = doc
                    .avatars
                    .iter_mut()
                    .find(|a| a.id == avatar_id)
                    .ok_or_else(|| {
                        CourierError::Validation(format!("unknown avatar {avatar_id}"))
                    })?;
                if avatar.sources.items.iter().any(|s| s.id == source.id) {
                    return Err(CourierError::Validation(format!(
                        "source {} already exists",
                        source.id
                    )));
                }
                avatar.sources.items.push(source.clone());
                Ok(source)
            })
            .await??;
        self.mark_dirty();
        self.audit
            .source_event(
                avatar_id,
                &added.id,
                "added",
                json!({
                    "name": added.name,
                    "type": added.kind,
                    "frequency_seconds": added.frequency_seconds,
                }),
            )
            .await?;
        Ok(added)
    }

    pub async fn remove_source(
        &self,
        avatar_id: &str,
        source_id: &str,
    ) -> Result<bool, CourierError> {
        let removed = self
            .avatars
            .update::<AvatarsDoc, _, _>(|doc| {
                let avatar = doc.avatars.iter_mut().find(|a| a.id == avatar_id)?;
                let pos = avatar.sources.items.iter().position(|s| s.id == source_id)?;
                Some(avatar.sources.items.remove(pos))
            })
            .await?;
        match removed {
            Some(source) => {
                self.mark_dirty();
                self.audit
                    .source_event(avatar_id, source_id, "removed", json!({ "name": source.name }))
                    .await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Apply a partial update to a source. Frequency changes are validated
    /// against the presets before anything is written.
    pub async fn update_source(
        &self,
        avatar_id: &str,
        source_id: &str,
        update: SourceUpdate,
    ) -> Result<Source, CourierError> {
        if let Some(freq) = update.frequency_seconds {
            if PollFrequency::from_seconds(freq).is_none() {
                return Err(CourierError::Validation(format!(
                    "unsupported poll frequency: {freq}s"
                )));
            }
        }
        let details = serde_json::to_value(&update)?;
        let updated = self
            .avatars
            .update::<AvatarsDoc, _, _>(|doc| {
                let avatar = doc
                    .avatars
                    .iter_mut()
                    .find(|a| a.id == avatar_id)
                    .ok_or_else(|| {
                        CourierError::Validation(format!("unknown avatar {avatar_id}"))
                    })?;
                let source = avatar
                    .sources
                    .items
                    .iter_mut()
                    .find(|s| s.id == source_id)
                    .ok_or_else(|| {
                        CourierError::Validation(format!("unknown source {source_id}"))
                    })?;
                if let Some(name) = update.name {
                    source.name = name;
                }
                if let Some(kind) = update.kind {
                    source.kind = kind;
                }
                if let Some(username) = update.username {
                    source.username = Some(username);
                }
                if let Some(freq) = update.frequency_seconds {
                    source.frequency_seconds = freq;
                }
                Ok::<_, CourierError>(source.clone())
            })
            .await??;
        self.mark_dirty();
        self.audit
            .source_event(avatar_id, source_id, "updated", json!({ "updates": details }))
            .await?;
        Ok(updated)
    }

    /// Advance a source's poll cursor after a successful fetch. The message
    /// cursor only moves when the fetch actually returned messages.
    pub async fn update_source_cursor(
        &self,
        avatar_id: &str,
        source_id: &str,
        last_message_id: Option<i64>,
    ) -> Result<(), CourierError> {
        self.avatars
            .update::<AvatarsDoc, _, _>(|doc| {
                let avatar = doc.avatars.iter_mut().find(|a| a.id == avatar_id)?;
                let source = avatar.sources.items.iter_mut().find(|s| s.id == source_id)?;
                source.last_checked_at = Some(Utc::now());
                if last_message_id.is_some() {
                    source.last_message_id = last_message_id;
                }
                Some(())
            })
            .await?;
        Ok(())
    }

    /// Sources due for a poll right now. Empty when the avatar's sources
    /// are disabled as a whole.
    pub async fn due_sources(&self, avatar_id: &str) -> Result<Vec<Source>, CourierError> {
        let now = Utc::now();
        Ok(match self.avatar(avatar_id).await? {
            Some(avatar) if avatar.sources.enabled => avatar
                .sources
                .items
                .into_iter()
                .filter(|s| s.is_due(now))
                .collect(),
            _ => Vec::new(),
        })
    }

    // ---------- dialogs ----------

    pub async fn set_dialog_cache(
        &self,
        avatar_id: &str,
        dialogs: Vec<Dialog>,
    ) -> Result<(), CourierError> {
        self.avatars
            .update::<AvatarsDoc, _, _>(|doc| {
                if let Some(avatar) = doc.avatars.iter_mut().find(|a| a.id == avatar_id) {
                    avatar.cached_dialogs = Some(dialogs);
                }
            })
            .await
    }

    pub async fn dialog_cache(
        &self,
        avatar_id: &str,
    ) -> Result<Option<Vec<Dialog>>, CourierError> {
        Ok(self.avatar(avatar_id).await?.and_then(|a| a.cached_dialogs))
    }

    // ---------- blacklist ----------

    pub async fn blacklist(&self) -> Result<BlacklistDoc, CourierError> {
        self.blacklist.load_or_init().await
    }

    /// Replace the whole blacklist document.
    pub async fn replace_blacklist(&self, doc: BlacklistDoc) -> Result<(), CourierError> {
        let details = json!({
            "global_rules": doc.global.keywords.len()
                + doc.global.senders.len()
                + doc.global.channels.len(),
            "avatar_scopes": doc.by_avatar.len(),
        });
        self.blacklist.save(&doc).await?;
        self.audit
            .system_event(
                "blacklist",
                "rules",
                "replaced",
                details,
                AuditStatus::Success,
                None,
            )
            .await
    }

    /// Effective filter scope for one avatar.
    pub async fn scope_for(&self, avatar_id: &str) -> Result<RuleSet, CourierError> {
        Ok(self.blacklist().await?.scope_for(avatar_id))
    }
}
