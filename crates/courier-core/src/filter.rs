//! Blacklist filtering over fetched message items.
//!
//! Pure and deterministic: the same rule scope and item list always produce
//! the same outcome, with kept items in their original order. Dropped
//! content never leaves this function — callers only see the survivors,
//! the drop count, and the per-drop reasons.

use crate::model::RuleSet;
use serde_json::Value;

/// Why one item was dropped.
#[derive(Debug, Clone, PartialEq)]
pub struct DropReason {
    /// Index of the item in the original list.
    pub index: usize,
    /// `keyword:<k>`, `sender:<s>`, or `channel:<c>`.
    pub reason: String,
    /// The item's message id, when it has one.
    pub item_id: Option<i64>,
}

/// Result of filtering one item batch.
#[derive(Debug, Clone)]
pub struct FilterOutcome {
    /// Surviving items, original order preserved.
    pub kept: Vec<Value>,
    pub dropped: usize,
    pub reasons: Vec<DropReason>,
}

/// Apply a rule scope to a batch of message items.
///
/// Checks run per item in a fixed order: keywords, then senders, then
/// channels. The first matching rule drops the item and records the reason.
pub fn apply(scope: &RuleSet, items: Vec<Value>) -> FilterOutcome {
    let mut kept = Vec::with_capacity(items.len());
    let mut reasons = Vec::new();

    for (index, item) in items.into_iter().enumerate() {
        match match_item(scope, &item) {
            Some(reason) => reasons.push(DropReason {
                index,
                reason,
                item_id: item.get("id").and_then(Value::as_i64),
            }),
            None => kept.push(item),
        }
    }

    FilterOutcome {
        dropped: reasons.len(),
        kept,
        reasons,
    }
}

/// Return the drop reason for an item, or `None` to keep it.
fn match_item(scope: &RuleSet, item: &Value) -> Option<String> {
    if let Some(text) = item_text(item) {
        let lower = text.to_lowercase();
        for keyword in &scope.keywords {
            if lower.contains(&keyword.to_lowercase()) {
                return Some(format!("keyword:{keyword}"));
            }
        }
    }

    if let Some(sender) = sender_id(item) {
        for rule in &scope.senders {
            if sender_matches(rule, &sender) {
                return Some(format!("sender:{rule}"));
            }
        }
    }

    if let Some(channel) = channel_id(item) {
        for rule in &scope.channels {
            if *rule == channel {
                return Some(format!("channel:{rule}"));
            }
        }
    }

    None
}

/// Message text, falling back to the media caption.
fn item_text(item: &Value) -> Option<&str> {
    item.get("message")
        .and_then(Value::as_str)
        .filter(|t| !t.is_empty())
        .or_else(|| {
            item.get("media")
                .and_then(|m| m.get("caption"))
                .and_then(Value::as_str)
        })
}

/// Sender identity from `from_id`: an id object, a bare string, or a number.
fn sender_id(item: &Value) -> Option<String> {
    let from = item.get("from_id")?;
    if let Some(obj) = from.as_object() {
        for key in ["user_id", "channel_id"] {
            if let Some(id) = obj.get(key) {
                return Some(scalar_to_string(id)?);
            }
        }
        return None;
    }
    scalar_to_string(from)
}

/// The source identity from `peer_id`.
fn channel_id(item: &Value) -> Option<String> {
    let peer = item.get("peer_id")?;
    if let Some(obj) = peer.as_object() {
        for key in ["channel_id", "chat_id"] {
            if let Some(id) = obj.get(key) {
                return Some(scalar_to_string(id)?);
            }
        }
        return None;
    }
    scalar_to_string(peer)
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Exact sender match, with `@username` equivalence in both directions.
fn sender_matches(rule: &str, sender: &str) -> bool {
    if rule == sender {
        return true;
    }
    if let Some(bare) = rule.strip_prefix('@') {
        if bare == sender {
            return true;
        }
    }
    if let Some(bare) = sender.strip_prefix('@') {
        if bare == rule {
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn scope(keywords: &[&str], senders: &[&str], channels: &[&str]) -> RuleSet {
        RuleSet {
            keywords: keywords.iter().map(|s| s.to_string()).collect(),
            senders: senders.iter().map(|s| s.to_string()).collect(),
            channels: channels.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn test_keyword_drops_with_reason_per_item() {
        let items = vec![
            json!({"id": 1, "message": "morning news"}),
            json!({"id": 2, "message": "buy CRYPTO now"}),
            json!({"id": 3, "message": "weather update"}),
            json!({"id": 4, "message": "crypto tips"}),
            json!({"id": 5, "message": "sports recap"}),
        ];
        let out = apply(&scope(&["crypto"], &[], &[]), items);

        assert_eq!(out.kept.len(), 3);
        assert_eq!(out.dropped, 2);
        assert_eq!(out.reasons.len(), 2);
        assert_eq!(out.reasons[0].index, 1);
        assert_eq!(out.reasons[0].reason, "keyword:crypto");
        assert_eq!(out.reasons[0].item_id, Some(2));
        assert_eq!(out.reasons[1].index, 3);
        assert_eq!(
            out.kept.iter().map(|i| i["id"].as_i64().unwrap()).collect::<Vec<_>>(),
            vec![1, 3, 5],
            "kept items must preserve original order"
        );
    }

    #[test]
    fn test_keyword_matches_media_caption() {
        let items = vec![json!({"id": 7, "media": {"caption": "Spam offer inside"}})];
        let out = apply(&scope(&["spam"], &[], &[]), items);
        assert_eq!(out.dropped, 1);
        assert_eq!(out.reasons[0].reason, "keyword:spam");
    }

    #[test]
    fn test_sender_match_object_and_at_equivalence() {
        let items = vec![
            json!({"id": 1, "message": "hi", "from_id": {"user_id": 42}}),
            json!({"id": 2, "message": "hi", "from_id": "scam_bot"}),
            json!({"id": 3, "message": "hi", "from_id": "@other"}),
        ];
        let out = apply(&scope(&[], &["42", "@scam_bot", "other"], &[]), items);
        assert_eq!(out.dropped, 3);
        assert_eq!(out.reasons[0].reason, "sender:42");
        assert_eq!(out.reasons[1].reason, "sender:@scam_bot");
        assert_eq!(out.reasons[2].reason, "sender:other");
    }

    #[test]
    fn test_channel_match_on_peer_id() {
        let items = vec![
            json!({"id": 1, "message": "a", "peer_id": {"channel_id": 1001}}),
            json!({"id": 2, "message": "b", "peer_id": {"chat_id": 2002}}),
        ];
        let out = apply(&scope(&[], &[], &["1001"]), items);
        assert_eq!(out.dropped, 1);
        assert_eq!(out.reasons[0].reason, "channel:1001");
        assert_eq!(out.kept[0]["id"], 2);
    }

    #[test]
    fn test_check_order_keyword_before_sender() {
        let items = vec![json!({
            "id": 1,
            "message": "crypto deal",
            "from_id": {"user_id": 42}
        })];
        let out = apply(&scope(&["crypto"], &["42"], &[]), items);
        assert_eq!(
            out.reasons[0].reason, "keyword:crypto",
            "keywords are checked before senders"
        );
    }

    #[test]
    fn test_empty_scope_keeps_everything() {
        let items = vec![json!({"id": 1, "message": "anything"})];
        let out = apply(&RuleSet::default(), items);
        assert_eq!(out.kept.len(), 1);
        assert_eq!(out.dropped, 0);
        assert!(out.reasons.is_empty());
    }

    #[test]
    fn test_keyword_case_insensitive_both_sides() {
        let items = vec![json!({"id": 1, "message": "GIVEAWAY alert"})];
        let out = apply(&scope(&["GiveAway"], &[], &[]), items);
        assert_eq!(out.dropped, 1);
    }

    #[test]
    fn test_item_without_matchable_fields_is_kept() {
        let items = vec![json!({"id": 9, "views": 120})];
        let out = apply(&scope(&["x"], &["y"], &["z"]), items);
        assert_eq!(out.kept.len(), 1);
    }
}
