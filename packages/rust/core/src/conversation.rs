//! Short-lived per-session memory for follow-up questions.
//!
//! A session remembers the phase its last answer was grounded on. A
//! follow-up that names no phase inherits that phase as a matching hint;
//! a follow-up that does name one ("phase 2", or a word from a phase title)
//! stands on its own. Sessions expire after an idle timeout and then behave
//! as if newly created.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{LazyLock, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use regex::Regex;
use tracing::debug;

use playbook_shared::{ConversationConfig, Document};

use crate::matcher::tokenize;

/// Explicit references such as "phase 2" or "Phase #3".
static PHASE_REF_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bphase\s*#?\s*(\d+)\b").expect("phase reference regex"));

/// One remembered exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Turn {
    pub question: String,
    pub phase_index: Option<u32>,
    pub answer: String,
}

/// Per-session state.
#[derive(Debug, Clone)]
pub struct ConversationContext {
    pub session_id: String,
    pub history: VecDeque<Turn>,
    pub last_phase_index: Option<u32>,
    pub expires_at: DateTime<Utc>,
}

/// Outcome of [`ConversationStore::resolve`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    /// Query to hand to the matcher.
    pub effective_query: String,
    /// Phase to prefer among equally scored matches.
    pub phase_hint: Option<u32>,
}

/// All live sessions, keyed by session id.
pub struct ConversationStore {
    sessions: Mutex<HashMap<String, ConversationContext>>,
    idle_timeout: chrono::Duration,
    capacity: usize,
}

impl ConversationStore {
    pub fn new(idle_timeout: Duration, capacity: usize) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            idle_timeout: chrono::Duration::from_std(idle_timeout)
                .unwrap_or_else(|_| chrono::Duration::days(365)),
            capacity: capacity.max(1),
        }
    }

    pub fn from_config(config: &ConversationConfig) -> Self {
        Self::new(
            Duration::from_secs(config.idle_timeout_secs),
            config.history_capacity,
        )
    }

    /// Work out what to match for `question` in this session.
    pub fn resolve(
        &self,
        session_id: &str,
        question: &str,
        document: &Document,
        now: DateTime<Utc>,
    ) -> Resolution {
        let question = question.trim();

        if let Some(phase) = explicit_phase(question, document) {
            let title = document
                .phase(phase)
                .map(|p| p.title.as_str())
                .unwrap_or_default();
            return Resolution {
                effective_query: format!("{question} {title}").trim().to_string(),
                phase_hint: Some(phase),
            };
        }

        if names_a_phase(question, document) {
            return Resolution {
                effective_query: question.to_string(),
                phase_hint: None,
            };
        }

        let phase_hint = self.with_live_session(session_id, now, |ctx| ctx.last_phase_index);
        debug!(session_id, ?phase_hint, "resolved follow-up question");
        Resolution {
            effective_query: question.to_string(),
            phase_hint: phase_hint.flatten(),
        }
    }

    /// Remember a completed exchange and refresh the idle timer.
    pub fn record(&self, session_id: &str, turn: Turn, now: DateTime<Utc>) {
        let mut sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        let expires_at = now + self.idle_timeout;

        let ctx = sessions
            .entry(session_id.to_string())
            .and_modify(|ctx| {
                if ctx.expires_at <= now {
                    ctx.history.clear();
                    ctx.last_phase_index = None;
                }
            })
            .or_insert_with(|| ConversationContext {
                session_id: session_id.to_string(),
                history: VecDeque::with_capacity(self.capacity),
                last_phase_index: None,
                expires_at,
            });

        if turn.phase_index.is_some() {
            ctx.last_phase_index = turn.phase_index;
        }
        if ctx.history.len() == self.capacity {
            ctx.history.pop_front();
        }
        ctx.history.push_back(turn);
        ctx.expires_at = expires_at;
    }

    /// Remembered turns, oldest first. Empty for unknown or expired sessions.
    pub fn history(&self, session_id: &str, now: DateTime<Utc>) -> Vec<Turn> {
        self.with_live_session(session_id, now, |ctx| {
            ctx.history.iter().cloned().collect()
        })
        .unwrap_or_default()
    }

    /// Forget a session. Returns whether it existed.
    pub fn reset(&self, session_id: &str) -> bool {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(session_id)
            .is_some()
    }

    /// Drop every expired session. Returns how many were removed.
    pub fn purge_expired(&self, now: DateTime<Utc>) -> usize {
        let mut sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        let before = sessions.len();
        sessions.retain(|_, ctx| ctx.expires_at > now);
        before - sessions.len()
    }

    /// Run `f` on the session if it exists and has not expired; an expired
    /// session is removed.
    fn with_live_session<T>(
        &self,
        session_id: &str,
        now: DateTime<Utc>,
        f: impl FnOnce(&ConversationContext) -> T,
    ) -> Option<T> {
        let mut sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        match sessions.get(session_id) {
            Some(ctx) if ctx.expires_at > now => Some(f(ctx)),
            Some(_) => {
                debug!(session_id, "session expired");
                sessions.remove(session_id);
                None
            }
            None => None,
        }
    }
}

/// Index of an explicitly referenced phase that exists in `document`.
fn explicit_phase(question: &str, document: &Document) -> Option<u32> {
    PHASE_REF_RE
        .captures_iter(question)
        .filter_map(|caps| caps[1].parse::<u32>().ok())
        .find(|index| document.phase(*index).is_some())
}

/// Whether any question token appears in a phase title.
fn names_a_phase(question: &str, document: &Document) -> bool {
    let title_tokens: HashSet<String> = document
        .phases
        .iter()
        .flat_map(|p| tokenize(&p.title))
        .collect();
    tokenize(question).iter().any(|t| title_tokens.contains(t))
}

#[cfg(test)]
mod tests {
    use super::*;
    use playbook_shared::Phase;

    fn document() -> Document {
        let mut planning = Phase::new(1, "Planning & Setup", None);
        planning.deliverables = Some(vec!["kickoff checklist".into()]);
        let mut config = Phase::new(2, "Configuration & Development", None);
        config.activities = Some(vec!["integrate API credentials".into()]);
        Document {
            phases: vec![planning, config],
            ..Default::default()
        }
    }

    fn store() -> ConversationStore {
        ConversationStore::new(Duration::from_secs(600), 3)
    }

    fn turn(question: &str, phase: Option<u32>) -> Turn {
        Turn {
            question: question.into(),
            phase_index: phase,
            answer: "ok".into(),
        }
    }

    #[test]
    fn follow_up_inherits_last_phase_until_expiry() {
        let store = store();
        let doc = document();
        let t0 = Utc::now();

        let first = store.resolve("s1", "What goes into the kickoff checklist?", &doc, t0);
        assert_eq!(first.phase_hint, None);
        store.record("s1", turn("kickoff checklist", Some(1)), t0);

        let t1 = t0 + chrono::Duration::seconds(30);
        let follow_up = store.resolve("s1", "And who owns it?", &doc, t1);
        assert_eq!(follow_up.phase_hint, Some(1));
        assert_eq!(follow_up.effective_query, "And who owns it?");

        let late = t0 + chrono::Duration::seconds(601);
        let expired = store.resolve("s1", "And who owns it?", &doc, late);
        assert_eq!(expired.phase_hint, None);
        assert!(store.history("s1", late).is_empty());
    }

    #[test]
    fn sessions_are_independent() {
        let store = store();
        let doc = document();
        let now = Utc::now();
        store.record("s1", turn("q", Some(2)), now);
        assert_eq!(store.resolve("s2", "and then?", &doc, now).phase_hint, None);
    }

    #[test]
    fn title_words_suppress_the_hint() {
        let store = store();
        let doc = document();
        let now = Utc::now();
        store.record("s1", turn("q", Some(1)), now);
        let r = store.resolve("s1", "what about development?", &doc, now);
        assert_eq!(r.phase_hint, None);
    }

    #[test]
    fn explicit_reference_becomes_hint() {
        let store = store();
        let doc = document();
        let now = Utc::now();
        store.record("s1", turn("q", Some(1)), now);

        let r = store.resolve("s1", "What happens in Phase 2?", &doc, now);
        assert_eq!(r.phase_hint, Some(2));
        assert!(r.effective_query.ends_with("Configuration & Development"));

        // Unknown phases are not hints.
        let r = store.resolve("fresh", "What happens in phase 9?", &doc, now);
        assert_eq!(r.phase_hint, None);
    }

    #[test]
    fn history_evicts_oldest_first() {
        let store = store();
        let now = Utc::now();
        for i in 0..5 {
            store.record("s1", turn(&format!("q{i}"), None), now);
        }
        let questions: Vec<String> = store
            .history("s1", now)
            .into_iter()
            .map(|t| t.question)
            .collect();
        assert_eq!(questions, vec!["q2", "q3", "q4"]);
    }

    #[test]
    fn unmatched_turn_keeps_previous_phase() {
        let store = store();
        let doc = document();
        let now = Utc::now();
        store.record("s1", turn("q", Some(2)), now);
        store.record("s1", turn("small talk", None), now);
        assert_eq!(store.resolve("s1", "and then?", &doc, now).phase_hint, Some(2));
    }

    #[test]
    fn reset_and_purge() {
        let store = store();
        let doc = document();
        let now = Utc::now();
        store.record("s1", turn("q", Some(1)), now);
        store.record("s2", turn("q", Some(1)), now);

        assert!(store.reset("s1"));
        assert!(!store.reset("s1"));
        assert_eq!(store.resolve("s1", "and then?", &doc, now).phase_hint, None);

        let later = now + chrono::Duration::seconds(601);
        assert_eq!(store.purge_expired(later), 1);
    }

    #[test]
    fn record_after_expiry_starts_fresh() {
        let store = store();
        let now = Utc::now();
        store.record("s1", turn("old", Some(1)), now);
        let later = now + chrono::Duration::seconds(601);
        store.record("s1", turn("new", None), later);
        let history = store.history("s1", later);
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].question, "new");
    }
}
