//! In-memory session store: conversation records keyed by
//! (user, subject, year level), the continuity/migration policy, and the
//! per-user token usage counters.
//!
//! The map sits behind an async RwLock so concurrent requests are memory
//! safe, but chat turns clone a record out, await the LLM, and write the
//! mutated clone back, so two near-simultaneous turns for one user can lose
//! the earlier write. There is no persistence; a process restart loses all
//! state.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use tokio::sync::RwLock;

use crate::config::TutorConfig;

/// Composite conversation identity. Per-user scans compare the stored
/// `user_id` field, never a string prefix, so user "al" can never pick up
/// "alex_..." records.
#[derive(Debug, Clone, Hash, PartialEq, Eq)]
pub struct ConversationKey {
    pub user_id: String,
    pub subject: String,
    pub year_level: u8,
}

impl ConversationKey {
    pub fn new(user_id: &str, subject: &str, year_level: u8) -> Self {
        Self {
            user_id: user_id.to_string(),
            subject: subject.to_string(),
            year_level,
        }
    }
}

impl fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}_{}", self.user_id, self.subject, self.year_level)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StoredMessage {
    pub role: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConversationRecord {
    pub user_id: String,
    pub subject: String,
    pub year_level: u8,
    pub messages: Vec<StoredMessage>,
    pub total_tokens: u64,
    pub created_at: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
    pub curriculum_loaded: bool,
    pub last_curriculum_topic: Option<String>,
}

impl ConversationRecord {
    pub fn new(user_id: &str, subject: &str, year_level: u8, now: DateTime<Utc>) -> Self {
        Self {
            user_id: user_id.to_string(),
            subject: subject.to_string(),
            year_level,
            messages: Vec::new(),
            total_tokens: 0,
            created_at: now,
            last_active: now,
            curriculum_loaded: false,
            last_curriculum_topic: None,
        }
    }

    /// The exact key this record currently belongs under.
    pub fn key(&self) -> ConversationKey {
        ConversationKey::new(&self.user_id, &self.subject, self.year_level)
    }

    /// Append a timestamped message and bump `last_active`.
    pub fn append(&mut self, role: &str, content: &str, now: DateTime<Utc>) {
        self.messages.push(StoredMessage {
            role: role.to_string(),
            content: content.to_string(),
            timestamp: now,
        });
        self.last_active = now;
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct TokenUsage {
    pub used: u64,
    pub limit: u64,
}

/// Conversation map plus per-user token counters and eviction policy.
pub struct SessionStore {
    conversations: RwLock<HashMap<ConversationKey, ConversationRecord>>,
    token_usage: RwLock<HashMap<String, TokenUsage>>,
    continuity_window: Duration,
    retention: Duration,
    max_per_user: usize,
    default_token_limit: u64,
}

impl SessionStore {
    pub fn new(config: &TutorConfig) -> Self {
        Self {
            conversations: RwLock::new(HashMap::new()),
            token_usage: RwLock::new(HashMap::new()),
            continuity_window: Duration::seconds(config.continuity_window_secs as i64),
            retention: Duration::days(config.retention_days),
            max_per_user: config.max_conversations_per_user,
            default_token_limit: config.user_token_limit,
        }
    }

    pub async fn get(&self, key: &ConversationKey) -> Option<ConversationRecord> {
        self.conversations.read().await.get(key).cloned()
    }

    /// Insert or overwrite the record under its own key.
    pub async fn put(&self, record: ConversationRecord) {
        self.conversations.write().await.insert(record.key(), record);
    }

    pub async fn delete(&self, key: &ConversationKey) -> bool {
        self.conversations.write().await.remove(key).is_some()
    }

    pub async fn len(&self) -> usize {
        self.conversations.read().await.len()
    }

    /// Move a record from one key to another, preserving its history. The
    /// old key is absent afterwards; the record's own fields must already
    /// reflect the new identity.
    pub async fn migrate(&self, old_key: &ConversationKey, record: ConversationRecord) {
        let mut conversations = self.conversations.write().await;
        conversations.remove(old_key);
        conversations.insert(record.key(), record);
        tracing::info!("Migrated conversation from {} to new key", old_key);
    }

    /// The user's most recently active conversation, if any.
    pub async fn most_recent_for_user(
        &self,
        user_id: &str,
    ) -> Option<(ConversationKey, ConversationRecord)> {
        self.conversations
            .read()
            .await
            .iter()
            .filter(|(_, record)| record.user_id == user_id)
            .max_by_key(|(_, record)| record.last_active)
            .map(|(key, record)| (key.clone(), record.clone()))
    }

    /// All conversations for a user, most recently active first.
    pub async fn conversations_for_user(
        &self,
        user_id: &str,
    ) -> Vec<(ConversationKey, ConversationRecord)> {
        let mut records: Vec<_> = self
            .conversations
            .read()
            .await
            .iter()
            .filter(|(_, record)| record.user_id == user_id)
            .map(|(key, record)| (key.clone(), record.clone()))
            .collect();
        records.sort_by(|a, b| b.1.last_active.cmp(&a.1.last_active));
        records
    }

    /// Resolve the conversation for a turn.
    ///
    /// 1. On reset, drop the exact-key record and continue as not-found.
    /// 2. Exact key hit: the common same-topic path.
    /// 3. Otherwise continue the user's most recent conversation if it is
    ///    inside the continuity window, re-keying it when the subject (or
    ///    year) changed.
    /// 4. Otherwise start a fresh record.
    pub async fn resolve(
        &self,
        user_id: &str,
        topic: &str,
        year_level: u8,
        reset: bool,
        now: DateTime<Utc>,
    ) -> (ConversationKey, ConversationRecord) {
        let exact = ConversationKey::new(user_id, topic, year_level);

        if reset {
            if self.delete(&exact).await {
                tracing::info!("Reset conversation context for {}", exact);
            }
        } else if let Some(record) = self.get(&exact).await {
            return (exact, record);
        }

        if let Some((old_key, mut record)) = self.most_recent_for_user(user_id).await {
            if now - record.last_active < self.continuity_window {
                if record.subject != topic {
                    tracing::info!("Topic changed: {} -> {}", record.subject, topic);
                    record.curriculum_loaded = false;
                    record.last_curriculum_topic = None;
                    record.subject = topic.to_string();
                }
                record.year_level = year_level;
                record.last_active = now;
                if old_key != exact {
                    self.migrate(&old_key, record.clone()).await;
                }
                return (exact, record);
            }
        }

        tracing::info!("Creating new conversation for {}", exact);
        let record = ConversationRecord::new(user_id, topic, year_level, now);
        self.put(record.clone()).await;
        (exact, record)
    }

    /// Drop records idle longer than the retention window, then cap each
    /// user at the most-recently-active `max_per_user`. Returns the number
    /// of evicted records.
    pub async fn sweep(&self, now: DateTime<Utc>) -> usize {
        let cutoff = now - self.retention;
        let mut conversations = self.conversations.write().await;
        let before = conversations.len();

        conversations.retain(|_, record| record.last_active >= cutoff);

        let mut by_user: HashMap<String, Vec<(ConversationKey, DateTime<Utc>)>> = HashMap::new();
        for (key, record) in conversations.iter() {
            by_user
                .entry(record.user_id.clone())
                .or_default()
                .push((key.clone(), record.last_active));
        }
        for (_, mut keys) in by_user {
            if keys.len() <= self.max_per_user {
                continue;
            }
            keys.sort_by(|a, b| b.1.cmp(&a.1));
            for (key, _) in keys.drain(self.max_per_user..) {
                conversations.remove(&key);
            }
        }

        before - conversations.len()
    }

    /// Re-apply the eviction policy for a single user, as happens after
    /// each of that user's chat turns.
    pub async fn cleanup_user(&self, user_id: &str, now: DateTime<Utc>) -> usize {
        let cutoff = now - self.retention;
        let mut conversations = self.conversations.write().await;
        let before = conversations.len();

        let mut keys: Vec<(ConversationKey, DateTime<Utc>)> = conversations
            .iter()
            .filter(|(_, record)| record.user_id == user_id)
            .map(|(key, record)| (key.clone(), record.last_active))
            .collect();
        keys.sort_by(|a, b| b.1.cmp(&a.1));

        for (index, (key, last_active)) in keys.into_iter().enumerate() {
            if index >= self.max_per_user || last_active < cutoff {
                conversations.remove(&key);
            }
        }

        before - conversations.len()
    }

    /// Accumulate a user's token spend and return the updated counter.
    pub async fn add_tokens(&self, user_id: &str, tokens: u64) -> TokenUsage {
        let mut usage = self.token_usage.write().await;
        let entry = usage.entry(user_id.to_string()).or_insert(TokenUsage {
            used: 0,
            limit: self.default_token_limit,
        });
        entry.used += tokens;
        *entry
    }

    pub async fn usage_for(&self, user_id: &str) -> TokenUsage {
        self.token_usage
            .read()
            .await
            .get(user_id)
            .copied()
            .unwrap_or(TokenUsage {
                used: 0,
                limit: self.default_token_limit,
            })
    }

    /// Per-subject record counts for the debug endpoint.
    pub async fn subject_counts(&self) -> HashMap<String, usize> {
        let mut counts = HashMap::new();
        for record in self.conversations.read().await.values() {
            *counts.entry(record.subject.clone()).or_insert(0) += 1;
        }
        counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> SessionStore {
        SessionStore::new(&TutorConfig::default())
    }

    #[tokio::test]
    async fn resolve_creates_exactly_one_record_for_new_user() {
        let store = store();
        let now = Utc::now();
        let (key, record) = store.resolve("maya", "Geometry", 7, false, now).await;

        assert_eq!(key.to_string(), "maya_Geometry_7");
        assert!(record.messages.is_empty());
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn exact_key_hit_returns_existing_record() {
        let store = store();
        let now = Utc::now();
        let (_, mut record) = store.resolve("maya", "Geometry", 7, false, now).await;
        record.append("user", "what is area?", now);
        store.put(record).await;

        let (_, found) = store.resolve("maya", "Geometry", 7, false, now).await;
        assert_eq!(found.messages.len(), 1);
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn user_prefix_does_not_cross_match() {
        let store = store();
        let now = Utc::now();
        let (_, mut record) = store.resolve("alex", "Geometry", 7, false, now).await;
        record.append("user", "triangles", now);
        store.put(record).await;

        // "al" must get a fresh record, never alex's.
        let (key, record) = store.resolve("al", "Geometry", 7, false, now).await;
        assert_eq!(key.user_id, "al");
        assert!(record.messages.is_empty());
        assert_eq!(store.len().await, 2);
    }

    #[tokio::test]
    async fn recent_conversation_continues_across_topic_change() {
        let store = store();
        let start = Utc::now();
        let (old_key, mut record) = store.resolve("maya", "Geometry", 7, false, start).await;
        record.append("user", "how do I find the area of a triangle?", start);
        record.append("assistant", "What do you know about its base?", start);
        record.curriculum_loaded = true;
        record.last_curriculum_topic = Some("Geometry".to_string());
        store.put(record).await;

        // Two minutes later the student switches topic; history must follow.
        let later = start + Duration::minutes(2);
        let (new_key, migrated) = store
            .resolve("maya", "Algebra & Equations", 7, false, later)
            .await;

        assert_eq!(new_key.to_string(), "maya_Algebra & Equations_7");
        assert_eq!(migrated.subject, "Algebra & Equations");
        assert_eq!(migrated.messages.len(), 2);
        assert!(!migrated.curriculum_loaded);
        assert!(migrated.last_curriculum_topic.is_none());

        // Old key is gone; exactly one record remains.
        assert!(store.get(&old_key).await.is_none());
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn stale_conversation_is_not_continued() {
        let store = store();
        let start = Utc::now();
        store.resolve("maya", "Geometry", 7, false, start).await;

        let later = start + Duration::minutes(6);
        let (_, record) = store
            .resolve("maya", "Algebra & Equations", 7, false, later)
            .await;

        assert!(record.messages.is_empty());
        assert_eq!(store.len().await, 2);
    }

    #[tokio::test]
    async fn reset_drops_exact_key_and_starts_fresh() {
        let store = store();
        let now = Utc::now();
        let (_, mut record) = store.resolve("maya", "Geometry", 7, false, now).await;
        record.append("user", "hello", now);
        store.put(record).await;

        let (_, record) = store.resolve("maya", "Geometry", 7, true, now).await;
        assert!(record.messages.is_empty());
    }

    #[tokio::test]
    async fn append_preserves_order_and_timestamps() {
        let store = store();
        let start = Utc::now();
        let (_, mut record) = store.resolve("maya", "Geometry", 7, false, start).await;

        for i in 0..5 {
            record.append("user", &format!("message {}", i), start + Duration::seconds(i));
        }
        store.put(record).await;

        let key = ConversationKey::new("maya", "Geometry", 7);
        let record = store.get(&key).await.unwrap();
        assert_eq!(record.messages.len(), 5);
        for (i, message) in record.messages.iter().enumerate() {
            assert_eq!(message.content, format!("message {}", i));
        }
        for pair in record.messages.windows(2) {
            assert!(pair[0].timestamp <= pair[1].timestamp);
        }
    }

    #[tokio::test]
    async fn sweep_evicts_old_records_and_keeps_fresh_ones() {
        let store = store();
        let now = Utc::now();

        let (_, mut old) = store.resolve("maya", "Geometry", 7, false, now).await;
        old.last_active = now - Duration::days(8);
        store.put(old).await;
        store.resolve("maya", "Indices", 7, false, now).await;

        let evicted = store.sweep(now).await;
        assert_eq!(evicted, 1);
        assert!(store
            .get(&ConversationKey::new("maya", "Geometry", 7))
            .await
            .is_none());
        assert!(store
            .get(&ConversationKey::new("maya", "Indices", 7))
            .await
            .is_some());
    }

    #[tokio::test]
    async fn sweep_caps_records_per_user() {
        let mut config = TutorConfig::default();
        config.max_conversations_per_user = 3;
        let store = SessionStore::new(&config);
        let now = Utc::now();

        for i in 0..5 {
            let mut record =
                ConversationRecord::new("maya", &format!("Subject {}", i), 7, now);
            record.last_active = now - Duration::minutes(10 - i);
            store.put(record).await;
        }

        let evicted = store.sweep(now).await;
        assert_eq!(evicted, 2);
        // The two least recently active subjects are gone.
        assert!(store
            .get(&ConversationKey::new("maya", "Subject 0", 7))
            .await
            .is_none());
        assert!(store
            .get(&ConversationKey::new("maya", "Subject 1", 7))
            .await
            .is_none());
        assert!(store
            .get(&ConversationKey::new("maya", "Subject 4", 7))
            .await
            .is_some());
    }

    #[tokio::test]
    async fn cleanup_user_only_touches_that_user() {
        let mut config = TutorConfig::default();
        config.max_conversations_per_user = 1;
        let store = SessionStore::new(&config);
        let now = Utc::now();

        let mut a = ConversationRecord::new("maya", "Geometry", 7, now);
        a.last_active = now - Duration::minutes(5);
        store.put(a).await;
        store.put(ConversationRecord::new("maya", "Indices", 7, now)).await;
        store.put(ConversationRecord::new("liam", "Geometry", 7, now)).await;

        let evicted = store.cleanup_user("maya", now).await;
        assert_eq!(evicted, 1);
        assert!(store
            .get(&ConversationKey::new("liam", "Geometry", 7))
            .await
            .is_some());
    }

    #[tokio::test]
    async fn token_usage_accumulates_per_user() {
        let store = store();
        let usage = store.add_tokens("maya", 120).await;
        assert_eq!(usage.used, 120);
        assert_eq!(usage.limit, 5000);

        let usage = store.add_tokens("maya", 30).await;
        assert_eq!(usage.used, 150);

        let other = store.usage_for("liam").await;
        assert_eq!(other.used, 0);
    }
}
