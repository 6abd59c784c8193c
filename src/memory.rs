//! Per-user conversation memory and pending questions.
//!
//! The memory is an L1 in-process store: each user gets a bounded turn
//! history with FIFO eviction inside the user and LRU eviction across
//! users, plus a TTL purge on access. An eviction hook receives expelled
//! turns so a durable L2 sink can be attached without changing callers.
//!
//! Pivot detection compares the deterministically-detected language of a
//! new request against the user's last-active language; on mismatch the
//! prior era is summarized, archived, and flushed so a stale stack does not
//! contaminate the new traversal.
//!
//! At most one pending question exists per user at any time. Posting a new
//! request clears it (it is consumed to rehydrate state), and a TTL bounds
//! its staleness.

use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::message::Role;
use crate::types::PendingSource;

/// A single stored conversation turn.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: Role,
    pub content: String,
    pub at: DateTime<Utc>,
    #[serde(default)]
    pub summary: String,
}

const TURN_CONTENT_CAP: usize = 4096;
const HISTORY_EXCERPT_CAP: usize = 512;

#[derive(Debug)]
struct UserHistory {
    turns: std::collections::VecDeque<ConversationTurn>,
    last_active: DateTime<Utc>,
    last_language: Option<String>,
}

/// A parked question waiting for the user's next request.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PendingQuestion {
    pub source: PendingSource,
    pub question: String,
    /// Serialized state context used to rehydrate the traversal.
    pub context: serde_json::Value,
    pub expires_at: DateTime<Utc>,
}

/// Sink receiving turns evicted from L1, for durable archival.
pub trait ArchiveSink: Send + Sync {
    /// Persist evicted turns, optionally with a pivot summary.
    fn archive(&self, user_id: &str, turns: &[ConversationTurn], summary: Option<&str>);
}

/// Default sink: log-and-drop.
#[derive(Debug, Default)]
pub struct NullArchive;

impl ArchiveSink for NullArchive {
    fn archive(&self, user_id: &str, turns: &[ConversationTurn], _summary: Option<&str>) {
        debug!(user = %truncate_id(user_id), count = turns.len(), "archived turns (null sink)");
    }
}

fn truncate_id(user_id: &str) -> &str {
    &user_id[..user_id.len().min(8)]
}

/// Thread-safe conversation memory with pending-question storage.
pub struct ConversationMemory {
    max_turns_per_user: usize,
    max_users: usize,
    ttl: chrono::Duration,
    pending_ttl: chrono::Duration,
    inner: Mutex<MemoryInner>,
    archive: Box<dyn ArchiveSink>,
}

#[derive(Default)]
struct MemoryInner {
    users: FxHashMap<String, UserHistory>,
    pending: FxHashMap<String, PendingQuestion>,
}

impl ConversationMemory {
    /// Create a memory with the given bounds.
    #[must_use]
    pub fn new(
        max_turns_per_user: usize,
        max_users: usize,
        ttl: Duration,
        pending_ttl: Duration,
    ) -> Self {
        Self::with_archive(
            max_turns_per_user,
            max_users,
            ttl,
            pending_ttl,
            Box::new(NullArchive),
        )
    }

    /// Create a memory that archives evicted turns to `archive`.
    #[must_use]
    pub fn with_archive(
        max_turns_per_user: usize,
        max_users: usize,
        ttl: Duration,
        pending_ttl: Duration,
        archive: Box<dyn ArchiveSink>,
    ) -> Self {
        Self {
            max_turns_per_user: max_turns_per_user.max(1),
            max_users: max_users.max(1),
            ttl: chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::hours(4)),
            pending_ttl: chrono::Duration::from_std(pending_ttl)
                .unwrap_or(chrono::Duration::minutes(30)),
            inner: Mutex::new(MemoryInner::default()),
            archive,
        }
    }

    /// Append a turn to the user's history, evicting as needed.
    pub fn store_turn(&self, user_id: &str, role: Role, content: &str) {
        let now = Utc::now();
        let turn = ConversationTurn {
            role,
            content: content.chars().take(TURN_CONTENT_CAP).collect(),
            at: now,
            summary: String::new(),
        };

        let mut inner = self.lock();
        self.purge_expired(&mut inner, now);

        let history = inner
            .users
            .entry(user_id.to_string())
            .or_insert_with(|| UserHistory {
                turns: std::collections::VecDeque::with_capacity(self.max_turns_per_user),
                last_active: now,
                last_language: None,
            });
        if history.turns.len() == self.max_turns_per_user {
            if let Some(evicted) = history.turns.pop_front() {
                self.archive.archive(user_id, &[evicted], None);
            }
        }
        history.turns.push_back(turn);
        history.last_active = now;

        // LRU across users.
        while inner.users.len() > self.max_users {
            let Some(oldest) = inner
                .users
                .iter()
                .min_by_key(|(_, h)| h.last_active)
                .map(|(uid, _)| uid.clone())
            else {
                break;
            };
            if let Some(history) = inner.users.remove(&oldest) {
                let turns: Vec<_> = history.turns.into_iter().collect();
                self.archive.archive(&oldest, &turns, None);
                debug!(user = %truncate_id(&oldest), count = turns.len(), "evicted LRU user");
            }
        }
    }

    /// The user's recent history as formatted excerpt lines.
    pub fn history(&self, user_id: &str, max_turns: Option<usize>) -> Vec<String> {
        let now = Utc::now();
        let mut inner = self.lock();
        if self.user_expired(&inner, user_id, now) {
            self.remove_user(&mut inner, user_id);
            return Vec::new();
        }
        let Some(history) = inner.users.get_mut(user_id) else {
            return Vec::new();
        };
        history.last_active = now;
        let limit = max_turns.unwrap_or(self.max_turns_per_user);
        history
            .turns
            .iter()
            .rev()
            .take(limit)
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .map(|t| {
                let excerpt: String = t.content.chars().take(HISTORY_EXCERPT_CAP).collect();
                format!("[{}]: {excerpt}", t.role)
            })
            .collect()
    }

    /// Record the language of the user's latest request and report whether
    /// it pivots away from the previous one.
    pub fn note_language(&self, user_id: &str, language: &str) -> bool {
        let mut inner = self.lock();
        let history = inner
            .users
            .entry(user_id.to_string())
            .or_insert_with(|| UserHistory {
                turns: std::collections::VecDeque::new(),
                last_active: Utc::now(),
                last_language: None,
            });
        let pivoted = matches!(&history.last_language, Some(prev) if prev != language);
        history.last_language = Some(language.to_string());
        pivoted
    }

    /// Flush the user's history after a pivot, archiving the prior era.
    ///
    /// Returns a one-line "prior era" note to seed the new traversal with.
    pub fn flush_on_pivot(&self, user_id: &str, summary: &str) -> String {
        let mut inner = self.lock();
        let Some(history) = inner.users.get_mut(user_id) else {
            return String::new();
        };
        let turns: Vec<_> = history.turns.drain(..).collect();
        let note = if summary.is_empty() {
            format!("Prior conversation era archived ({} turns).", turns.len())
        } else {
            format!("Prior era: {summary}")
        };
        self.archive.archive(user_id, &turns, Some(summary));
        note
    }

    /// Park a pending question for the user, replacing any existing one.
    pub fn set_pending(
        &self,
        user_id: &str,
        source: PendingSource,
        question: impl Into<String>,
        context: serde_json::Value,
    ) {
        let mut inner = self.lock();
        inner.pending.insert(
            user_id.to_string(),
            PendingQuestion {
                source,
                question: question.into(),
                context,
                expires_at: Utc::now() + self.pending_ttl,
            },
        );
    }

    /// Take (and clear) the user's pending question, if any and unexpired.
    pub fn take_pending(&self, user_id: &str) -> Option<PendingQuestion> {
        let mut inner = self.lock();
        let pending = inner.pending.remove(user_id)?;
        if pending.expires_at < Utc::now() {
            debug!(user = %truncate_id(user_id), "pending question expired");
            return None;
        }
        Some(pending)
    }

    /// Whether a live pending question exists for the user.
    pub fn has_pending(&self, user_id: &str) -> bool {
        let inner = self.lock();
        inner
            .pending
            .get(user_id)
            .is_some_and(|p| p.expires_at >= Utc::now())
    }

    /// Number of users with live history.
    pub fn active_users(&self) -> usize {
        self.lock().users.len()
    }

    fn purge_expired(&self, inner: &mut MemoryInner, now: DateTime<Utc>) {
        let expired: Vec<String> = inner
            .users
            .iter()
            .filter(|(_, h)| now - h.last_active > self.ttl)
            .map(|(uid, _)| uid.clone())
            .collect();
        for uid in expired {
            self.remove_user(inner, &uid);
        }
    }

    fn user_expired(&self, inner: &MemoryInner, user_id: &str, now: DateTime<Utc>) -> bool {
        inner
            .users
            .get(user_id)
            .is_some_and(|h| now - h.last_active > self.ttl)
    }

    fn remove_user(&self, inner: &mut MemoryInner, user_id: &str) {
        if let Some(history) = inner.users.remove(user_id) {
            let turns: Vec<_> = history.turns.into_iter().collect();
            if !turns.is_empty() {
                self.archive.archive(user_id, &turns, None);
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn memory() -> ConversationMemory {
        ConversationMemory::new(
            3,
            10,
            Duration::from_secs(3600),
            Duration::from_secs(1800),
        )
    }

    #[test]
    fn turns_evict_fifo_within_user() {
        let mem = memory();
        for i in 0..5 {
            mem.store_turn("u1", Role::User, &format!("turn {i}"));
        }
        let history = mem.history("u1", None);
        assert_eq!(history.len(), 3);
        assert!(history[0].contains("turn 2"));
        assert!(history[2].contains("turn 4"));
    }

    #[test]
    fn pending_question_is_at_most_one_and_cleared_on_take() {
        let mem = memory();
        mem.set_pending("u1", PendingSource::Worker, "which file?", json!({}));
        mem.set_pending("u1", PendingSource::Supervisor, "scope ok?", json!({}));
        let pending = mem.take_pending("u1").unwrap();
        assert_eq!(pending.source, PendingSource::Supervisor);
        assert!(mem.take_pending("u1").is_none());
    }

    #[test]
    fn expired_pending_is_dropped() {
        let mem = ConversationMemory::new(
            3,
            10,
            Duration::from_secs(3600),
            Duration::from_secs(0),
        );
        mem.set_pending("u1", PendingSource::Planner, "q", json!({}));
        assert!(mem.take_pending("u1").is_none());
    }

    #[test]
    fn language_pivot_detection() {
        let mem = memory();
        assert!(!mem.note_language("u1", "python"));
        assert!(!mem.note_language("u1", "python"));
        assert!(mem.note_language("u1", "go"));
    }

    #[test]
    fn pivot_flush_leaves_prior_era_note() {
        let mem = memory();
        mem.store_turn("u1", Role::User, "old python work");
        let note = mem.flush_on_pivot("u1", "built a python CLI");
        assert!(note.contains("built a python CLI"));
        assert!(mem.history("u1", None).is_empty());
    }

    #[test]
    fn lru_evicts_least_recent_user() {
        let mem = ConversationMemory::new(
            3,
            2,
            Duration::from_secs(3600),
            Duration::from_secs(1800),
        );
        mem.store_turn("a", Role::User, "1");
        mem.store_turn("b", Role::User, "2");
        mem.store_turn("c", Role::User, "3");
        assert_eq!(mem.active_users(), 2);
        assert!(mem.history("a", None).is_empty());
    }
}
