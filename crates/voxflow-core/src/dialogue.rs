//! Dialogue store — per-conversation turn history with trimming and LRU
//! eviction.
//!
//! Conversations are keyed independently from sessions so that a session
//! reconnect (same id, new connection) keeps its history. The store is a
//! dependency injected into the pipeline coordinator; an external store can
//! be swapped in behind [`DialogueStore`] without API changes.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

/// Speaker role of a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One `(role, content)` pair within a conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl Turn {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    /// Rough token estimate: ~4 characters per token, unless an engine
    /// supplies a better counter.
    pub fn approx_tokens(&self) -> usize {
        self.content.len() / 4
    }
}

/// Ordered turn history for one conversation id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub turns: Vec<Turn>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    fn new(id: String, system_prompt: Option<&str>) -> Self {
        let now = Utc::now();
        let turns = match system_prompt {
            Some(prompt) if !prompt.is_empty() => vec![Turn::system(prompt)],
            _ => Vec::new(),
        };
        Self {
            id,
            turns,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn approx_tokens(&self) -> usize {
        self.turns.iter().map(Turn::approx_tokens).sum()
    }
}

/// Store-wide retention limits.
#[derive(Debug, Clone, Copy)]
pub struct DialogueLimits {
    /// Maximum turns kept per conversation, system turn included.
    pub max_history_turns: usize,
    /// Approximate token budget per conversation.
    pub max_context_length: usize,
    /// Maximum live conversations before LRU eviction.
    pub max_conversations: usize,
}

impl Default for DialogueLimits {
    fn default() -> Self {
        Self {
            max_history_turns: 20,
            max_context_length: 4096,
            max_conversations: 100,
        }
    }
}

/// Async conversation persistence.
#[async_trait]
pub trait DialogueStore: Send + Sync {
    /// Fetch a conversation, creating it (with a leading system turn when a
    /// prompt is given) if absent.
    async fn get_or_create(&self, conv_id: &str, system_prompt: Option<&str>) -> Conversation;

    /// Append a turn, trimming opportunistically. A missing conversation is
    /// recreated with the retained system prompt.
    async fn append(&self, conv_id: &str, turn: Turn);

    /// Full turn history, empty if the conversation does not exist.
    async fn history(&self, conv_id: &str) -> Vec<Turn>;

    /// Number of turns currently held for the conversation.
    async fn turn_count(&self, conv_id: &str) -> usize;

    /// Drop a conversation entirely.
    async fn clear(&self, conv_id: &str);
}

/// Process-local dialogue store.
pub struct MemoryDialogueStore {
    conversations: Mutex<HashMap<String, Conversation>>,
    limits: DialogueLimits,
    system_prompt: Option<String>,
}

impl MemoryDialogueStore {
    pub fn new(limits: DialogueLimits, system_prompt: Option<String>) -> Self {
        Self {
            conversations: Mutex::new(HashMap::new()),
            limits,
            system_prompt,
        }
    }

    pub async fn conversation_count(&self) -> usize {
        self.conversations.lock().await.len()
    }

    fn create_in<'a>(
        &self,
        map: &'a mut HashMap<String, Conversation>,
        conv_id: &str,
        system_prompt: Option<&str>,
    ) -> &'a mut Conversation {
        if !map.contains_key(conv_id) && map.len() >= self.limits.max_conversations {
            evict_lru(map);
        }
        map.entry(conv_id.to_string())
            .or_insert_with(|| Conversation::new(conv_id.to_string(), system_prompt))
    }
}

#[async_trait]
impl DialogueStore for MemoryDialogueStore {
    async fn get_or_create(&self, conv_id: &str, system_prompt: Option<&str>) -> Conversation {
        let mut map = self.conversations.lock().await;
        let prompt = system_prompt.or(self.system_prompt.as_deref());
        self.create_in(&mut map, conv_id, prompt).clone()
    }

    async fn append(&self, conv_id: &str, turn: Turn) {
        let mut map = self.conversations.lock().await;
        let prompt = self.system_prompt.clone();
        let conv = self.create_in(&mut map, conv_id, prompt.as_deref());
        conv.turns.push(turn);
        conv.updated_at = Utc::now();
        trim(conv, &self.limits);
    }

    async fn history(&self, conv_id: &str) -> Vec<Turn> {
        let map = self.conversations.lock().await;
        map.get(conv_id).map(|c| c.turns.clone()).unwrap_or_default()
    }

    async fn turn_count(&self, conv_id: &str) -> usize {
        let map = self.conversations.lock().await;
        map.get(conv_id).map(|c| c.turns.len()).unwrap_or(0)
    }

    async fn clear(&self, conv_id: &str) {
        let mut map = self.conversations.lock().await;
        if map.remove(conv_id).is_some() {
            debug!(conv_id, "Cleared conversation");
        }
    }
}

/// Drop oldest non-system turns until both the turn-count and token limits
/// hold. The leading system turn (if present) is always retained.
fn trim(conv: &mut Conversation, limits: &DialogueLimits) {
    let first_droppable = usize::from(matches!(
        conv.turns.first(),
        Some(Turn {
            role: Role::System,
            ..
        })
    ));

    while conv.turns.len() > limits.max_history_turns
        || conv.approx_tokens() > limits.max_context_length
    {
        // Never drop the newest turn.
        if first_droppable + 1 >= conv.turns.len() {
            break;
        }
        conv.turns.remove(first_droppable);
    }
}

/// Evict the conversation with the oldest `updated_at`. Pure bookkeeping:
/// sessions holding the evicted id are untouched and their next append
/// recreates the conversation.
fn evict_lru(map: &mut HashMap<String, Conversation>) {
    let oldest = map
        .iter()
        .min_by_key(|(_, c)| c.updated_at)
        .map(|(id, _)| id.clone());
    if let Some(id) = oldest {
        map.remove(&id);
        debug!(conv_id = %id, "Evicted least-recently-updated conversation");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits(turns: usize, tokens: usize, convs: usize) -> DialogueLimits {
        DialogueLimits {
            max_history_turns: turns,
            max_context_length: tokens,
            max_conversations: convs,
        }
    }

    #[tokio::test]
    async fn create_with_system_prompt() {
        let store = MemoryDialogueStore::new(DialogueLimits::default(), None);
        let conv = store.get_or_create("c1", Some("be brief")).await;
        assert_eq!(conv.turns.len(), 1);
        assert_eq!(conv.turns[0].role, Role::System);
        assert_eq!(conv.turns[0].content, "be brief");
    }

    #[tokio::test]
    async fn get_or_create_is_idempotent() {
        let store = MemoryDialogueStore::new(DialogueLimits::default(), None);
        store.get_or_create("c1", Some("p")).await;
        store.append("c1", Turn::user("hi")).await;
        let again = store.get_or_create("c1", Some("p")).await;
        assert_eq!(again.turns.len(), 2);
        assert_eq!(store.conversation_count().await, 1);
    }

    #[tokio::test]
    async fn trim_retains_system_and_latest() {
        // With max_history_turns = 4, after appending 5 non-system turns the
        // conversation keeps the system turn plus the latest 3.
        let store = MemoryDialogueStore::new(limits(4, 100_000, 10), None);
        store.get_or_create("c1", Some("sys")).await;
        for i in 0..5 {
            store.append("c1", Turn::user(format!("turn {i}"))).await;
        }

        let turns = store.history("c1").await;
        assert_eq!(turns.len(), 4);
        assert_eq!(turns[0].role, Role::System);
        assert_eq!(turns[1].content, "turn 2");
        assert_eq!(turns[3].content, "turn 4");
    }

    #[tokio::test]
    async fn trim_boundary_exact_limit_is_kept() {
        let store = MemoryDialogueStore::new(limits(3, 100_000, 10), None);
        store.get_or_create("c1", Some("sys")).await;
        store.append("c1", Turn::user("a")).await;
        store.append("c1", Turn::assistant("b")).await;
        // Exactly at the limit: nothing dropped.
        assert_eq!(store.turn_count("c1").await, 3);

        store.append("c1", Turn::user("c")).await;
        let turns = store.history("c1").await;
        assert_eq!(turns.len(), 3);
        assert_eq!(turns[0].role, Role::System);
        assert_eq!(turns[1].content, "b");
        assert_eq!(turns[2].content, "c");
    }

    #[tokio::test]
    async fn trim_by_token_budget() {
        // Each 40-char turn is ~10 tokens; budget of 25 keeps at most two.
        let store = MemoryDialogueStore::new(limits(100, 25, 10), None);
        for i in 0..4 {
            store.append("c1", Turn::user(format!("{i}{}", "x".repeat(39)))).await;
        }
        let turns = store.history("c1").await;
        assert_eq!(turns.len(), 2);
        assert!(turns[0].content.starts_with('2'));
        assert!(turns[1].content.starts_with('3'));
    }

    #[tokio::test]
    async fn trim_never_drops_newest_turn() {
        // A single oversized turn survives even past the token budget.
        let store = MemoryDialogueStore::new(limits(10, 2, 10), None);
        store.append("c1", Turn::user("x".repeat(400))).await;
        assert_eq!(store.turn_count("c1").await, 1);
    }

    #[tokio::test]
    async fn system_turn_survives_every_append() {
        let store = MemoryDialogueStore::new(limits(3, 100_000, 10), None);
        store.get_or_create("c1", Some("sys")).await;
        for i in 0..20 {
            store.append("c1", Turn::user(format!("{i}"))).await;
            let turns = store.history("c1").await;
            assert_eq!(turns[0].role, Role::System);
            assert_eq!(turns[0].content, "sys");
        }
    }

    #[tokio::test]
    async fn lru_eviction_at_cap() {
        let store = MemoryDialogueStore::new(limits(10, 100_000, 2), None);
        store.append("a", Turn::user("1")).await;
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        store.append("b", Turn::user("2")).await;
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        store.append("a", Turn::user("3")).await; // refresh a

        store.append("c", Turn::user("4")).await; // evicts b
        assert_eq!(store.conversation_count().await, 2);
        assert_eq!(store.turn_count("b").await, 0);
        assert_eq!(store.turn_count("a").await, 2);
        assert_eq!(store.turn_count("c").await, 1);
    }

    #[tokio::test]
    async fn append_at_cap_keeps_existing_conversation() {
        let store = MemoryDialogueStore::new(limits(10, 100_000, 1), None);
        store.append("a", Turn::user("1")).await;
        store.append("a", Turn::user("2")).await;
        assert_eq!(store.turn_count("a").await, 2);
        assert_eq!(store.conversation_count().await, 1);
    }

    #[tokio::test]
    async fn append_after_eviction_recreates_with_system_prompt() {
        let store = MemoryDialogueStore::new(limits(10, 100_000, 1), Some("sys".into()));
        store.append("a", Turn::user("1")).await;
        store.append("b", Turn::user("2")).await; // evicts a

        store.append("a", Turn::user("again")).await;
        let turns = store.history("a").await;
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0].role, Role::System);
        assert_eq!(turns[1].content, "again");
    }

    #[tokio::test]
    async fn clear_removes_conversation() {
        let store = MemoryDialogueStore::new(DialogueLimits::default(), None);
        store.append("c1", Turn::user("hi")).await;
        store.clear("c1").await;
        assert_eq!(store.turn_count("c1").await, 0);
        assert_eq!(store.conversation_count().await, 0);
    }

    #[test]
    fn token_estimate() {
        assert_eq!(Turn::user("abcdefgh").approx_tokens(), 2);
        assert_eq!(Turn::user("").approx_tokens(), 0);
    }
}
