//! Conversation state manager: bot/handoff control per counterpart.
//!
//! Every operation on one (device, counterpart) pair runs under that pair's
//! async lock, taken from a sharded lock table; different pairs never contend.
//! Lock entries are dropped from the table as soon as nobody holds or waits
//! on them.
//!
//! Compiled rule sets are cached per device and invalidated by every rule
//! write that goes through the manager.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tracing::{debug, info};

use super::conversation::{Action, ControlState, Conversation, ConversationKey};
use super::rules::{AutoReplyRule, RuleDraft, RuleSet};
use crate::error::{Result, ValidationError};
use crate::events::{Event, EventBus};
use crate::store::Database;

type LockTable = DashMap<ConversationKey, Arc<Mutex<()>>>;

/// Exclusive hold on one conversation. Prunes its table entry on drop.
pub(crate) struct KeyGuard<'a> {
    locks: &'a LockTable,
    key: ConversationKey,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        self.locks
            .remove_if(&self.key, |_, lock| Arc::strong_count(lock) == 1);
    }
}

pub struct ConversationManager {
    store: Arc<dyn Database>,
    events: EventBus,
    locks: LockTable,
    rule_cache: RwLock<HashMap<String, Arc<RuleSet>>>,
}

impl ConversationManager {
    pub fn new(store: Arc<dyn Database>, events: EventBus) -> Self {
        Self {
            store,
            events,
            locks: DashMap::new(),
            rule_cache: RwLock::new(HashMap::new()),
        }
    }

    pub(crate) async fn lock_key(&self, key: &ConversationKey) -> KeyGuard<'_> {
        let lock = self
            .locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        KeyGuard {
            locks: &self.locks,
            key: key.clone(),
            guard: Some(lock.lock_owned().await),
        }
    }

    /// Number of conversations currently locked or waited on.
    pub fn active_locks(&self) -> usize {
        self.locks.len()
    }

    // ── Inbound ─────────────────────────────────────────────────────

    /// Record an inbound message received now and decide whether to auto-reply.
    ///
    /// In handoff the matcher is not consulted at all.
    pub async fn on_inbound_message(
        &self,
        device_id: &str,
        counterpart_id: &str,
        text: &str,
    ) -> Result<Action> {
        self.on_inbound_message_at(device_id, counterpart_id, text, Utc::now())
            .await
    }

    /// Like [`on_inbound_message`](Self::on_inbound_message) for a message
    /// the transport stamped at `received_at`.
    ///
    /// `last_message_at` only moves forward, so a late delivery of an older
    /// message does not rewind it.
    pub async fn on_inbound_message_at(
        &self,
        device_id: &str,
        counterpart_id: &str,
        text: &str,
        received_at: DateTime<Utc>,
    ) -> Result<Action> {
        let key = conversation_key(device_id, counterpart_id)?;
        let _guard = self.lock_key(&key).await;
        self.inbound_locked(&key, text, received_at).await
    }

    pub(crate) async fn inbound_locked(
        &self,
        key: &ConversationKey,
        text: &str,
        received_at: DateTime<Utc>,
    ) -> Result<Action> {
        let mut convo = self.load_or_new(key).await?;
        convo.last_message_at = Some(match convo.last_message_at {
            Some(prev) => prev.max(received_at),
            None => received_at,
        });
        self.store.upsert_conversation(&convo).await?;

        if convo.state == ControlState::Handoff {
            debug!(conversation = %key, "Conversation in handoff, auto-reply suppressed");
            return Ok(Action::NoAutoReply);
        }

        let rules = self.rule_set(&key.device_id).await?;
        Ok(match rules.first_match(text) {
            Some(rule) => Action::AutoReply {
                rule_id: rule.id,
                response: rule.response.clone(),
            },
            None => Action::NoAutoReply,
        })
    }

    /// Current control state; a conversation never seen is driven by the bot.
    pub(crate) async fn state_locked(&self, key: &ConversationKey) -> Result<ControlState> {
        Ok(self
            .store
            .get_conversation(key)
            .await?
            .map(|convo| convo.state)
            .unwrap_or_default())
    }

    /// Note that an auto-reply went out and announce it.
    pub async fn record_auto_reply_sent(
        &self,
        device_id: &str,
        counterpart_id: &str,
        rule_id: i64,
        message_id: &str,
    ) -> Result<()> {
        let key = conversation_key(device_id, counterpart_id)?;
        let _guard = self.lock_key(&key).await;
        self.record_sent_locked(&key, rule_id, message_id).await
    }

    pub(crate) async fn record_sent_locked(
        &self,
        key: &ConversationKey,
        rule_id: i64,
        message_id: &str,
    ) -> Result<()> {
        let mut convo = self.load_or_new(key).await?;
        convo.last_bot_activity_at = Some(Utc::now());
        self.store.upsert_conversation(&convo).await?;

        info!(conversation = %key, rule_id, message_id, "Auto-reply sent");
        self.events.publish(Event::AutoReplySent {
            device_id: key.device_id.clone(),
            counterpart_id: key.counterpart_id.clone(),
            rule_id,
            message_id: message_id.to_string(),
        });
        Ok(())
    }

    // ── Control transitions ─────────────────────────────────────────

    /// Hand the conversation to a human. Returns whether the state changed.
    ///
    /// The request time and reason are recorded even when already in handoff.
    pub async fn request_handoff(
        &self,
        device_id: &str,
        counterpart_id: &str,
        reason: Option<&str>,
    ) -> Result<bool> {
        let key = conversation_key(device_id, counterpart_id)?;
        let _guard = self.lock_key(&key).await;

        let mut convo = self.load_or_new(&key).await?;
        let transitioned = convo.state != ControlState::Handoff;
        convo.state = ControlState::Handoff;
        convo.last_handoff_requested_at = Some(Utc::now());
        if let Some(reason) = reason {
            convo.handoff_reason = Some(reason.to_string());
        }
        self.store.upsert_conversation(&convo).await?;

        if transitioned {
            info!(conversation = %key, reason = ?reason, "Conversation handed off to human");
            self.events.publish(Event::HandoffStarted {
                device_id: key.device_id.clone(),
                counterpart_id: key.counterpart_id.clone(),
                reason: convo.handoff_reason.clone(),
            });
        }
        Ok(transitioned)
    }

    /// Give the conversation back to the bot. Returns whether the state changed.
    pub async fn resume_bot(&self, device_id: &str, counterpart_id: &str) -> Result<bool> {
        let key = conversation_key(device_id, counterpart_id)?;
        let _guard = self.lock_key(&key).await;

        let Some(mut convo) = self.store.get_conversation(&key).await? else {
            return Ok(false);
        };
        if convo.state == ControlState::Bot {
            return Ok(false);
        }

        convo.state = ControlState::Bot;
        convo.handoff_reason = None;
        self.store.upsert_conversation(&convo).await?;

        info!(conversation = %key, "Bot resumed");
        self.events.publish(Event::BotResumed {
            device_id: key.device_id.clone(),
            counterpart_id: key.counterpart_id.clone(),
        });
        Ok(true)
    }

    // ── Reads ───────────────────────────────────────────────────────

    pub async fn get_conversation(
        &self,
        device_id: &str,
        counterpart_id: &str,
    ) -> Result<Option<Conversation>> {
        let key = ConversationKey::new(device_id, counterpart_id);
        Ok(self.store.get_conversation(&key).await?)
    }

    pub async fn list_conversations(&self, device_id: &str) -> Result<Vec<Conversation>> {
        Ok(self.store.list_conversations(device_id).await?)
    }

    // ── Rules ───────────────────────────────────────────────────────

    pub async fn create_rule(&self, device_id: &str, draft: &RuleDraft) -> Result<AutoReplyRule> {
        if device_id.trim().is_empty() {
            return Err(ValidationError::EmptyDevice.into());
        }
        draft.validate()?;
        let rule = self.store.create_rule(device_id, draft).await?;
        self.invalidate_rules(device_id).await;
        info!(rule_id = rule.id, device_id, name = %rule.name, "Auto-reply rule created");
        Ok(rule)
    }

    pub async fn update_rule(&self, id: i64, draft: &RuleDraft) -> Result<Option<AutoReplyRule>> {
        draft.validate()?;
        let updated = self.store.update_rule(id, draft).await?;
        if let Some(rule) = &updated {
            self.invalidate_rules(&rule.device_id).await;
            info!(rule_id = id, device_id = %rule.device_id, "Auto-reply rule updated");
        }
        Ok(updated)
    }

    pub async fn delete_rule(&self, id: i64) -> Result<Option<AutoReplyRule>> {
        let deleted = self.store.delete_rule(id).await?;
        if let Some(rule) = &deleted {
            self.invalidate_rules(&rule.device_id).await;
            info!(rule_id = id, device_id = %rule.device_id, "Auto-reply rule deleted");
        }
        Ok(deleted)
    }

    pub async fn get_rule(&self, id: i64) -> Result<Option<AutoReplyRule>> {
        Ok(self.store.get_rule(id).await?)
    }

    pub async fn list_rules(&self, device_id: &str) -> Result<Vec<AutoReplyRule>> {
        Ok(self.store.list_rules(device_id).await?)
    }

    /// Compiled active rules for a device, loading them on first use.
    async fn rule_set(&self, device_id: &str) -> Result<Arc<RuleSet>> {
        if let Some(set) = self.rule_cache.read().await.get(device_id) {
            return Ok(Arc::clone(set));
        }

        // Held across the load: an invalidation never races a stale insert.
        let mut cache = self.rule_cache.write().await;
        if let Some(set) = cache.get(device_id) {
            return Ok(Arc::clone(set));
        }
        let set = Arc::new(RuleSet::compile(self.store.list_rules(device_id).await?));
        debug!(device_id, rules = set.len(), "Compiled auto-reply rules");
        cache.insert(device_id.to_string(), Arc::clone(&set));
        Ok(set)
    }

    async fn invalidate_rules(&self, device_id: &str) {
        self.rule_cache.write().await.remove(device_id);
    }

    async fn load_or_new(&self, key: &ConversationKey) -> Result<Conversation> {
        Ok(self
            .store
            .get_conversation(key)
            .await?
            .unwrap_or_else(|| Conversation::new(key)))
    }
}

fn conversation_key(device_id: &str, counterpart_id: &str) -> Result<ConversationKey> {
    if device_id.trim().is_empty() {
        return Err(ValidationError::EmptyDevice.into());
    }
    if counterpart_id.trim().is_empty() {
        return Err(ValidationError::InvalidField {
            field: "counterpart_id".into(),
            reason: "must not be empty".into(),
        }
        .into());
    }
    Ok(ConversationKey::new(device_id, counterpart_id))
}
